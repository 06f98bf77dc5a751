//! Session establishment.
//!
//! Outbound: claim a bundle from the directory and run the initiator side
//! of key agreement. The slot lock is held across the claim, so concurrent
//! sends to the same device wait for the first claim instead of making
//! their own.
//!
//! Inbound: rebuild the session from the handshake header of an initial
//! message, decrypt that message, install the session (retiring any
//! previous one) and only then retire the one-time prekey.

use crate::account::PrekeyManager;
use crate::config::E2eeConfig;
use crate::directory::{bounded, KeyDirectory};
use crate::error::{E2eeError, Result};
use crate::store::{LockedSlot, SessionRecord, SessionStore};
use murmur_crypto::{IdentityKeypair, RatchetMessage, RatchetSession, SkipWindow};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Establisher {
    account: Arc<PrekeyManager>,
    directory: Arc<dyn KeyDirectory>,
    store: Arc<SessionStore>,
    config: E2eeConfig,
}

impl Establisher {
    pub fn new(
        account: Arc<PrekeyManager>,
        directory: Arc<dyn KeyDirectory>,
        store: Arc<SessionStore>,
        config: E2eeConfig,
    ) -> Self {
        Self {
            account,
            directory,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    fn window(&self) -> SkipWindow {
        SkipWindow::with_limits(self.config.max_skip, self.config.max_skipped_keys.max(1))
    }

    /// Make sure the locked slot holds a usable session, establishing one
    /// if it is absent.
    pub async fn ensure_outbound(
        &self,
        identity: &IdentityKeypair,
        locked: &mut LockedSlot,
    ) -> Result<()> {
        if locked.usable()?.is_some() {
            return Ok(());
        }

        locked.slot.set_pending(true);
        let result = self.claim_session(identity, locked).await;
        locked.slot.set_pending(false);
        let session = result?;

        let session_id = session.session_id();
        self.store
            .commit(locked, SessionRecord::new(session))
            .await?;
        info!(session = %locked.key, id = %session_id, "outbound session established");
        Ok(())
    }

    async fn claim_session(
        &self,
        identity: &IdentityKeypair,
        locked: &LockedSlot,
    ) -> Result<RatchetSession> {
        let key = &locked.key;
        let bundle = bounded(
            self.config.claim_timeout(),
            "claim_prekey",
            self.directory.claim_prekey(&key.user, &key.device),
        )
        .await?;

        if bundle.device_key != key.device {
            return Err(E2eeError::InvalidBundle(format!(
                "bundle for {} returned for {}",
                bundle.device_key, key.device
            )));
        }
        if bundle.one_time_prekey.is_none() {
            warn!(session = %key, "no one-time prekey left; using signed prekey only");
        }

        debug!(session = %key, signed_prekey = bundle.signed_prekey.id, "claimed prekey bundle");
        RatchetSession::initiate_with_window(identity, &bundle, self.window())
            .map_err(|e| E2eeError::InvalidBundle(e.to_string()))
    }

    /// Establish a session from an initial message and return its plaintext.
    pub async fn accept_initial(
        &self,
        locked: &mut LockedSlot,
        message: &RatchetMessage,
    ) -> Result<Vec<u8>> {
        locked.usable()?;
        let header = message
            .handshake
            .as_ref()
            .ok_or_else(|| E2eeError::malformed("initial message without handshake"))?;
        if header.identity_key != locked.key.device {
            return Err(E2eeError::malformed(
                "handshake identity does not match sender device",
            ));
        }

        let keys = match self
            .account
            .responder_keys(header.signed_prekey_id, header.one_time_prekey_id)
            .await
        {
            Ok(keys) => keys,
            // The one-time prekey was already spent on an earlier session.
            Err(E2eeError::UnknownPrekey(id)) if header.one_time_prekey_id == Some(id) => {
                return Err(E2eeError::ReplayOrTooOld)
            }
            Err(e) => return Err(e),
        };

        let mut session = RatchetSession::respond_with_window(
            &keys.identity,
            &keys.signed_prekey,
            keys.one_time_prekey.as_ref(),
            header,
            self.window(),
        )?;
        if session.session_id() != message.session_id {
            return Err(E2eeError::malformed("session id does not match handshake"));
        }
        let plaintext = session.decrypt(message)?;

        let incoming = message.session_id;
        let kept = locked
            .record()
            .filter(|current| current.wins_crossing(&incoming))
            .map(|current| current.session.session_id());
        let superseded = locked.record().map(|r| r.session.session_id());
        let record = match locked.record() {
            Some(current) if kept.is_some() => current.with_crossed(session),
            previous => SessionRecord::superseding(session, previous),
        };
        self.store.commit(locked, record).await?;

        if let Some(id) = header.one_time_prekey_id {
            if let Err(e) = self.account.consume_one_time_prekey(id).await {
                warn!(prekey = id, error = %e, "failed to retire one-time prekey");
            }
        }

        match (kept, superseded) {
            (Some(ours), _) => info!(
                session = %locked.key,
                id = %incoming,
                kept = %ours,
                "first messages crossed; keeping our session"
            ),
            (None, Some(old)) => info!(
                session = %locked.key,
                id = %incoming,
                superseded = %old,
                "inbound session superseded previous session"
            ),
            (None, None) => info!(
                session = %locked.key,
                id = %incoming,
                "inbound session established"
            ),
        }
        Ok(plaintext)
    }
}
