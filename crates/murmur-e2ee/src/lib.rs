//! Murmur end-to-end encrypted direct messaging engine.
//!
//! The engine runs on each client device. It publishes prekeys to an
//! untrusted key directory, establishes pairwise sessions with every
//! device of a conversation partner without a live handshake, fans each
//! outgoing message out to all of those devices, and dispatches incoming
//! envelopes to the right session.
//!
//! Components, leaves first:
//! - [`account::PrekeyManager`]: identity and prekey pool
//! - [`directory::KeyDirectory`]: key distribution service seam
//! - [`store::SessionStore`]: persisted per-device sessions
//! - [`establish::Establisher`]: outbound and inbound session setup
//! - [`fanout::FanOutEncryptor`]: one message, many devices
//! - [`dispatch::Dispatcher`]: incoming envelope handling
//! - [`queue::UndecryptableQueue`]: bounded retry for early continuations
//! - [`monitor::PrekeyMonitor`]: keeps the published pool topped up
//!
//! [`client::E2eeClient`] wires them together.

#![forbid(unsafe_code)]

pub mod account;
pub mod client;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod establish;
pub mod fanout;
pub mod monitor;
pub mod queue;
pub mod storage;
pub mod store;
mod wire;

pub use account::{AutoAcknowledge, BackupAcknowledger, PrekeyManager, RecoveryKit};
pub use client::E2eeClient;
pub use config::E2eeConfig;
pub use directory::{InMemoryKeyDirectory, KeyDirectory};
pub use dispatch::{DecryptedMessage, Inbound};
pub use error::{E2eeError, Result};
pub use fanout::{FanOutReport, SkippedDevice};
pub use monitor::MonitorHandle;
pub use storage::{FileStorage, MemoryStorage, SecureStorage};
pub use store::{SessionKey, SessionState};
