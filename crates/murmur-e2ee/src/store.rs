//! Session store and per-device state machine.
//!
//! Implements the session lifecycle:
//! - ABSENT: no session with the peer device
//! - PENDING: outbound establishment in progress (prekey claim in flight)
//! - ESTABLISHED: a session is installed and usable
//! - SUPERSEDED: the session was replaced by a newer initial message
//!
//! Each peer device has its own slot guarded by an async mutex, so one
//! session is never mutated by two tasks at once. The slot map itself is
//! behind a read-write lock and only written when a new slot is created.

use crate::error::{E2eeError, Result};
use crate::storage::{load_json, save_json, SecureStorage};
use murmur_common::helpers::now_ms;
use murmur_common::UserId;
use murmur_crypto::{DeviceKey, RatchetSession, Role, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};

const INDEX_KEY: &str = "session:index";

/// Retired session ids remembered per device.
const RETIRED_HISTORY: usize = 16;

/// Session state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Absent,
    Pending,
    Established,
    Superseded,
}

/// Sessions are keyed by peer user and peer device.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub user: UserId,
    pub device: DeviceKey,
}

impl SessionKey {
    pub fn new(user: UserId, device: DeviceKey) -> Self {
        Self { user, device }
    }

    fn storage_key(&self) -> String {
        format!("session:{}:{}", self.user, self.device)
    }

    /// Retired ids left behind by a reset.
    fn retired_key(&self) -> String {
        format!("session-retired:{}:{}", self.user, self.device)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.device)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({self})")
    }
}

/// Persisted session with its bookkeeping.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session: RatchetSession,
    /// Superseded session ids, oldest first.
    pub retired: Vec<SessionId>,
    pub established_at_ms: u64,
    /// Inbound session from a simultaneous first message that lost the
    /// tie-break. Only used to decrypt what the peer sent on it.
    #[serde(default)]
    pub crossed: Option<RatchetSession>,
    /// Set when persisting failed; cleared only by a reset.
    #[serde(skip)]
    pub desynced: bool,
}

impl SessionRecord {
    pub fn new(session: RatchetSession) -> Self {
        Self {
            session,
            retired: Vec::new(),
            established_at_ms: now_ms(),
            crossed: None,
            desynced: false,
        }
    }

    /// Build the record replacing `previous`, retiring its session ids.
    pub fn superseding(session: RatchetSession, previous: Option<&SessionRecord>) -> Self {
        let mut record = Self::new(session);
        if let Some(previous) = previous {
            record.retired = previous.retired.clone();
            for id in previous.session_ids() {
                record.retire(id);
            }
        }
        record
    }

    fn retire(&mut self, id: SessionId) {
        if !self.retired.contains(&id) {
            self.retired.push(id);
        }
        if self.retired.len() > RETIRED_HISTORY {
            let excess = self.retired.len() - RETIRED_HISTORY;
            self.retired.drain(..excess);
        }
    }

    /// Put ids retired before this record existed ahead of its own.
    fn inherit_retired(&mut self, older: &[SessionId]) {
        let newer = std::mem::take(&mut self.retired);
        for id in older.iter().chain(newer.iter()) {
            self.retire(*id);
        }
    }

    /// Ids this record still decrypts: the current session first.
    fn session_ids(&self) -> impl Iterator<Item = SessionId> + '_ {
        std::iter::once(self.session.session_id())
            .chain(self.crossed.as_ref().map(RatchetSession::session_id))
    }

    pub fn is_retired(&self, id: &SessionId) -> bool {
        self.retired.contains(id)
    }

    pub fn holds(&self, id: &SessionId) -> bool {
        self.session_ids().any(|held| held == *id)
    }

    /// The session a message with `id` belongs to.
    pub fn session_mut(&mut self, id: &SessionId) -> Option<&mut RatchetSession> {
        if self.session.session_id() == *id {
            return Some(&mut self.session);
        }
        self.crossed.as_mut().filter(|s| s.session_id() == *id)
    }

    /// Whether an incoming initial for `incoming` crossed our own first
    /// message and loses to it.
    ///
    /// Both ends see the same two ids, so both keep the lower one.
    pub fn wins_crossing(&self, incoming: &SessionId) -> bool {
        self.session.role() == Role::Initiator
            && self.session.next_receive_index() == 0
            && self.session.session_id() < *incoming
    }

    /// Keep the current session and hold `session` for decryption only.
    pub fn with_crossed(&self, session: RatchetSession) -> Self {
        let mut record = self.clone();
        if let Some(previous) = record.crossed.replace(session) {
            record.retire(previous.session_id());
        }
        record
    }
}

/// Contents of a slot, reachable only through its lock.
#[derive(Default)]
pub struct SlotState {
    pub record: Option<SessionRecord>,
    /// Ids retired by a reset, while no record is installed.
    retired: Vec<SessionId>,
    loaded: bool,
}

impl SlotState {
    /// State of a particular session id in this slot.
    pub fn status_of(&self, id: &SessionId) -> SessionState {
        match &self.record {
            Some(record) if record.holds(id) => SessionState::Established,
            Some(record) if record.is_retired(id) => SessionState::Superseded,
            None if self.retired.contains(id) => SessionState::Superseded,
            _ => SessionState::Absent,
        }
    }
}

pub struct SessionSlot {
    pending: AtomicBool,
    state: Arc<Mutex<SlotState>>,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            state: Arc::new(Mutex::new(SlotState::default())),
        }
    }

    pub fn set_pending(&self, pending: bool) {
        self.pending.store(pending, Ordering::SeqCst);
    }
}

/// Exclusive access to one session slot.
pub struct LockedSlot {
    pub key: SessionKey,
    pub slot: Arc<SessionSlot>,
    pub state: OwnedMutexGuard<SlotState>,
}

impl LockedSlot {
    pub fn record(&self) -> Option<&SessionRecord> {
        self.state.record.as_ref()
    }

    /// The installed record, unless it is unusable after a failed persist.
    pub fn usable(&self) -> Result<Option<&SessionRecord>> {
        match self.state.record.as_ref() {
            Some(record) if record.desynced => {
                Err(E2eeError::SessionDesync(self.key.device.clone()))
            }
            other => Ok(other),
        }
    }
}

pub struct SessionStore {
    storage: Arc<dyn SecureStorage>,
    slots: RwLock<HashMap<SessionKey, Arc<SessionSlot>>>,
    index: Mutex<Option<BTreeSet<SessionKey>>>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn SecureStorage>) -> Self {
        Self {
            storage,
            slots: RwLock::new(HashMap::new()),
            index: Mutex::new(None),
        }
    }

    async fn slot(&self, key: &SessionKey) -> Arc<SessionSlot> {
        if let Some(slot) = self.slots.read().await.get(key) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(key.clone())
            .or_insert_with(|| Arc::new(SessionSlot::new()))
            .clone()
    }

    /// Lock a slot, loading its persisted record on first access.
    pub async fn lock(&self, key: &SessionKey) -> Result<LockedSlot> {
        let slot = self.slot(key).await;
        let mut state = slot.state.clone().lock_owned().await;
        if !state.loaded {
            state.record = load_json(self.storage.as_ref(), &key.storage_key()).await?;
            if state.record.is_none() {
                state.retired = load_json(self.storage.as_ref(), &key.retired_key())
                    .await?
                    .unwrap_or_default();
            }
            state.loaded = true;
        }
        Ok(LockedSlot {
            key: key.clone(),
            slot,
            state,
        })
    }

    /// Current lifecycle state of the slot.
    pub async fn state(&self, key: &SessionKey) -> Result<SessionState> {
        let slot = self.slot(key).await;
        if slot.pending.load(Ordering::SeqCst) {
            return Ok(SessionState::Pending);
        }
        let locked = self.lock(key).await?;
        Ok(if locked.state.record.is_some() {
            SessionState::Established
        } else {
            SessionState::Absent
        })
    }

    /// Persist `record` and install it in the slot.
    ///
    /// On a storage failure the currently installed session is marked
    /// desynchronized and [`E2eeError::SessionDesync`] is returned; the new
    /// state is discarded so nothing derived from it may be released.
    pub async fn commit(&self, locked: &mut LockedSlot, mut record: SessionRecord) -> Result<()> {
        let key = &locked.key;
        let reset_history = locked.state.record.is_none() && !locked.state.retired.is_empty();
        if reset_history {
            record.inherit_retired(&locked.state.retired);
        }
        if let Err(e) = save_json(self.storage.as_ref(), &key.storage_key(), &record).await {
            error!(session = %key, error = %e, "failed to persist session state");
            if let Some(current) = locked.state.record.as_mut() {
                current.desynced = true;
            }
            return Err(E2eeError::SessionDesync(key.device.clone()));
        }

        let is_new = locked
            .state
            .record
            .as_ref()
            .map(|r| r.session.session_id() != record.session.session_id())
            .unwrap_or(true);
        locked.state.record = Some(record);

        if reset_history {
            locked.state.retired.clear();
            if let Err(e) = self.storage.delete(&key.retired_key()).await {
                warn!(session = %key, error = %e, "failed to drop reset history");
            }
        }
        // The record itself is durable; an index write failure only
        // affects enumeration.
        if is_new {
            if let Err(e) = self.add_to_index(key).await {
                warn!(session = %key, error = %e, "failed to update session index");
            }
            debug!(session = %key, "session installed");
        }
        Ok(())
    }

    /// Drop a session so the next send establishes a fresh one.
    ///
    /// Its ids stay retired, so messages and replayed initials for them
    /// keep failing as stale.
    pub async fn reset(&self, key: &SessionKey) -> Result<()> {
        let mut locked = self.lock(key).await?;
        if let Some(mut history) = locked.state.record.clone() {
            let held: Vec<SessionId> = history.session_ids().collect();
            for id in held {
                history.retire(id);
            }
            save_json(self.storage.as_ref(), &key.retired_key(), &history.retired).await?;
            self.storage.delete(&key.storage_key()).await?;
            locked.state.retired = history.retired;
            locked.state.record = None;
        }
        info!(session = %key, "session reset");
        Ok(())
    }

    /// Every peer device with persisted session state.
    pub async fn keys(&self) -> Result<Vec<SessionKey>> {
        let mut index = self.index.lock().await;
        let keys = self.loaded_index(&mut index).await?;
        Ok(keys.iter().cloned().collect())
    }

    /// Remove every session.
    pub async fn clear(&self) -> Result<()> {
        for key in self.keys().await? {
            let mut locked = self.lock(&key).await?;
            self.storage.delete(&key.storage_key()).await?;
            self.storage.delete(&key.retired_key()).await?;
            locked.state.record = None;
            locked.state.retired.clear();
        }
        self.slots.write().await.clear();
        self.storage.delete(INDEX_KEY).await?;
        *self.index.lock().await = None;
        Ok(())
    }

    async fn loaded_index<'a>(
        &self,
        index: &'a mut Option<BTreeSet<SessionKey>>,
    ) -> Result<&'a mut BTreeSet<SessionKey>> {
        if index.is_none() {
            *index = Some(
                load_json(self.storage.as_ref(), INDEX_KEY)
                    .await?
                    .unwrap_or_default(),
            );
        }
        index
            .as_mut()
            .ok_or_else(|| E2eeError::storage("session index unavailable"))
    }

    async fn add_to_index(&self, key: &SessionKey) -> Result<()> {
        let mut guard = self.index.lock().await;
        let index = self.loaded_index(&mut guard).await?;
        if index.insert(key.clone()) {
            save_json(self.storage.as_ref(), INDEX_KEY, &*index).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use murmur_crypto::{IdentityKeypair, PrekeyBundle, SignedPrekey};

    /// Memory storage that refuses to write the session index.
    #[derive(Default)]
    struct NoIndexStorage(MemoryStorage);

    #[async_trait]
    impl SecureStorage for NoIndexStorage {
        async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.0.load(key).await
        }

        async fn save(&self, key: &str, value: &[u8]) -> Result<()> {
            if key == INDEX_KEY {
                return Err(E2eeError::storage("index unavailable"));
            }
            self.0.save(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.0.delete(key).await
        }
    }

    fn session() -> RatchetSession {
        let alice = IdentityKeypair::generate();
        let bob = IdentityKeypair::generate();
        let spk = SignedPrekey::generate(1, 0, &bob);
        let bundle = PrekeyBundle {
            device_key: bob.device_key(),
            signing_key: bob.signing_public(),
            signed_prekey: spk.public(),
            one_time_prekey: None,
        };
        RatchetSession::initiate(&alice, &bundle).unwrap()
    }

    fn key(user: &str) -> SessionKey {
        SessionKey::new(
            UserId::from(user),
            IdentityKeypair::generate().device_key(),
        )
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store = SessionStore::new(Arc::new(MemoryStorage::new()));
        let key = key("bob");
        assert_eq!(store.state(&key).await.unwrap(), SessionState::Absent);

        let slot = store.slot(&key).await;
        slot.set_pending(true);
        assert_eq!(store.state(&key).await.unwrap(), SessionState::Pending);
        slot.set_pending(false);

        let mut locked = store.lock(&key).await.unwrap();
        store
            .commit(&mut locked, SessionRecord::new(session()))
            .await
            .unwrap();
        drop(locked);
        assert_eq!(store.state(&key).await.unwrap(), SessionState::Established);

        store.reset(&key).await.unwrap();
        assert_eq!(store.state(&key).await.unwrap(), SessionState::Absent);
    }

    #[tokio::test]
    async fn test_records_survive_restart() {
        let storage: Arc<dyn SecureStorage> = Arc::new(MemoryStorage::new());
        let key = key("bob");
        let original = session();
        let id = original.session_id();

        {
            let store = SessionStore::new(storage.clone());
            let mut locked = store.lock(&key).await.unwrap();
            store
                .commit(&mut locked, SessionRecord::new(original))
                .await
                .unwrap();
        }

        let store = SessionStore::new(storage);
        let locked = store.lock(&key).await.unwrap();
        assert_eq!(locked.record().unwrap().session.session_id(), id);
        drop(locked);
        assert_eq!(store.keys().await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn test_supersession_retires_old_id() {
        let store = SessionStore::new(Arc::new(MemoryStorage::new()));
        let key = key("bob");
        let first = session();
        let first_id = first.session_id();
        let second = session();
        let second_id = second.session_id();

        let mut locked = store.lock(&key).await.unwrap();
        store
            .commit(&mut locked, SessionRecord::new(first))
            .await
            .unwrap();
        let replacement = SessionRecord::superseding(second, locked.record());
        store.commit(&mut locked, replacement).await.unwrap();

        assert_eq!(locked.state.status_of(&second_id), SessionState::Established);
        assert_eq!(locked.state.status_of(&first_id), SessionState::Superseded);
        assert_eq!(
            locked.state.status_of(&session().session_id()),
            SessionState::Absent
        );
    }

    #[tokio::test]
    async fn test_retired_history_is_bounded() {
        let mut record = SessionRecord::new(session());
        let first_id = record.session.session_id();
        for _ in 0..RETIRED_HISTORY + 1 {
            record = SessionRecord::superseding(session(), Some(&record));
        }
        assert_eq!(record.retired.len(), RETIRED_HISTORY);
        assert!(!record.is_retired(&first_id));
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let storage = Arc::new(MemoryStorage::new());
        let store = SessionStore::new(storage.clone());
        for user in ["bob", "carol"] {
            let key = key(user);
            let mut locked = store.lock(&key).await.unwrap();
            store
                .commit(&mut locked, SessionRecord::new(session()))
                .await
                .unwrap();
        }
        assert_eq!(store.keys().await.unwrap().len(), 2);

        store.clear().await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_reset_keeps_retired_ids() {
        let storage: Arc<dyn SecureStorage> = Arc::new(MemoryStorage::new());
        let key = key("bob");
        let first = session();
        let first_id = first.session_id();
        let second = session();
        let second_id = second.session_id();

        {
            let store = SessionStore::new(storage.clone());
            let mut locked = store.lock(&key).await.unwrap();
            store
                .commit(&mut locked, SessionRecord::new(first))
                .await
                .unwrap();
            let replacement = SessionRecord::superseding(second, locked.record());
            store.commit(&mut locked, replacement).await.unwrap();
            drop(locked);
            store.reset(&key).await.unwrap();
        }

        // A fresh process still refuses both old sessions.
        let store = SessionStore::new(storage);
        let mut locked = store.lock(&key).await.unwrap();
        assert!(locked.record().is_none());
        assert_eq!(locked.state.status_of(&first_id), SessionState::Superseded);
        assert_eq!(locked.state.status_of(&second_id), SessionState::Superseded);

        // The next session inherits the history.
        let third = session();
        let third_id = third.session_id();
        store
            .commit(&mut locked, SessionRecord::new(third))
            .await
            .unwrap();
        assert_eq!(locked.state.status_of(&third_id), SessionState::Established);
        assert_eq!(locked.state.status_of(&first_id), SessionState::Superseded);
        assert_eq!(locked.state.status_of(&second_id), SessionState::Superseded);
        assert_eq!(locked.record().unwrap().retired, vec![first_id, second_id]);
    }

    #[tokio::test]
    async fn test_index_failure_keeps_committed_record() {
        let storage = Arc::new(NoIndexStorage::default());
        let store = SessionStore::new(storage.clone());
        let key = key("bob");
        let original = session();
        let id = original.session_id();

        let mut locked = store.lock(&key).await.unwrap();
        store
            .commit(&mut locked, SessionRecord::new(original))
            .await
            .unwrap();
        assert_eq!(locked.state.status_of(&id), SessionState::Established);
        assert!(!locked.record().unwrap().desynced);
        drop(locked);

        let reloaded = SessionStore::new(storage);
        let locked = reloaded.lock(&key).await.unwrap();
        assert_eq!(locked.record().unwrap().session.session_id(), id);
    }

    #[test]
    fn test_crossing_keeps_lower_id() {
        let ours = SessionRecord::new(session());
        let our_id = ours.session.session_id();
        let theirs = session();
        let their_id = theirs.session_id();

        assert_eq!(ours.wins_crossing(&their_id), our_id < their_id);
        let kept = ours.with_crossed(theirs);
        assert!(kept.holds(&our_id));
        assert!(kept.holds(&their_id));
        assert_eq!(kept.session.session_id(), our_id);

        // Replacing the record retires both sessions it held.
        let next = SessionRecord::superseding(session(), Some(&kept));
        assert!(next.is_retired(&our_id));
        assert!(next.is_retired(&their_id));
    }
}
