//! Skipped message keys for out-of-order delivery.
//!
//! When a message arrives with an index ahead of the receiving chain, the
//! keys for the gap are derived and parked here so the late messages can
//! still be decrypted once.
//!
//! # Design
//!
//! - At most `max_skip` keys may be derived ahead in one step
//! - At most `max_stored` keys are parked; the oldest index is evicted first
//! - A key is removed the moment it is used, so replays find nothing
//!
//! # Thread Safety
//!
//! This type is NOT thread-safe. It lives inside a session, which the
//! session store guards.

use crate::cipher::MessageKey;
use crate::error::{CryptoError, CryptoResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipWindow {
    max_skip: u64,
    max_stored: usize,
    keys: BTreeMap<u64, MessageKey>,
}

impl Default for SkipWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SkipWindow {
    /// Default look-ahead: 1000 message keys.
    pub const DEFAULT_MAX_SKIP: u64 = 1000;

    /// Default number of parked keys.
    pub const DEFAULT_MAX_STORED: usize = 1000;

    pub fn new() -> Self {
        Self::with_limits(Self::DEFAULT_MAX_SKIP, Self::DEFAULT_MAX_STORED)
    }

    /// Create a window with custom limits.
    ///
    /// # Panics
    /// Panics if `max_stored` is 0.
    pub fn with_limits(max_skip: u64, max_stored: usize) -> Self {
        assert!(max_stored > 0, "skip window must store at least one key");
        Self {
            max_skip,
            max_stored,
            keys: BTreeMap::new(),
        }
    }

    pub fn max_skip(&self) -> u64 {
        self.max_skip
    }

    /// Check that `index` is reachable from the next expected index.
    pub fn check_ahead(&self, next: u64, index: u64) -> CryptoResult<()> {
        if index >= next && index - next > self.max_skip {
            return Err(CryptoError::OutsideWindow { index, next });
        }
        Ok(())
    }

    pub fn get(&self, index: u64) -> Option<&MessageKey> {
        self.keys.get(&index)
    }

    /// Remove and return the key for `index`.
    pub fn take(&mut self, index: u64) -> Option<MessageKey> {
        self.keys.remove(&index)
    }

    /// Park a key, evicting the oldest when full.
    pub fn insert(&mut self, index: u64, key: MessageKey) {
        self.keys.insert(index, key);
        while self.keys.len() > self.max_stored {
            self.keys.pop_first();
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Lowest parked index.
    pub fn oldest(&self) -> Option<u64> {
        self.keys.keys().next().copied()
    }

    /// Drop every parked key.
    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> MessageKey {
        MessageKey::from_parts([n; 32], [n; 12])
    }

    #[test]
    fn test_take_is_single_use() {
        let mut window = SkipWindow::new();
        window.insert(3, key(3));

        assert!(window.take(3).is_some());
        assert!(window.take(3).is_none());
        assert!(window.is_empty());
    }

    #[test]
    fn test_oldest_evicted_when_full() {
        let mut window = SkipWindow::with_limits(100, 3);
        for i in 0..5 {
            window.insert(i, key(i as u8));
        }

        assert_eq!(window.len(), 3);
        assert_eq!(window.oldest(), Some(2));
        assert!(window.get(0).is_none());
        assert!(window.get(4).is_some());
    }

    #[test]
    fn test_check_ahead() {
        let window = SkipWindow::with_limits(10, 10);

        assert!(window.check_ahead(0, 10).is_ok());
        assert_eq!(
            window.check_ahead(0, 11),
            Err(CryptoError::OutsideWindow { index: 11, next: 0 })
        );
        // Indices behind the chain are resolved against parked keys instead.
        assert!(window.check_ahead(50, 3).is_ok());
    }

    #[test]
    fn test_clear() {
        let mut window = SkipWindow::new();
        window.insert(1, key(1));
        window.insert(2, key(2));
        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.oldest(), None);
    }
}
