//! Per (identity, notary) consensus state.
//!
//! Everything that must stay consistent with the notary's view lives in
//! [`ContextState`] behind one mutex per context: the number pool, request
//! counter, confirmed nymbox hash, local copies of the boxes, and the
//! outgoing queue. The lock is held for one reservation or one reply
//! application, never across network I/O.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    command::CommandType,
    crypto::{Digest, PublicKey},
    identifier::{AccountId, IdentityId, RequestNumber, ServerId, TransactionNumber},
    ledger::Ledger,
    numbers::{GuardId, MergeSummary, NumberError, NumberPool},
    queue::{OutgoingQueue, PendingRequest},
    storage::Storage,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error(transparent)]
    Numbers(#[from] NumberError),
    #[error("Nymbox is out of sync with the notary, fetch it before reserving numbers")]
    ResyncRequired,
    #[error("Nymbox hash mismatch: notary claims {claimed}, nymbox hashes to {actual}")]
    HashMismatch { claimed: Digest, actual: Digest },
}

/// Cron item (payment plan, market offer, smart contract) the notary has
/// activated and not yet closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronItem {
    pub command: CommandType,
    pub numbers: Vec<TransactionNumber>,
    /// Set while a trigger-clause notice awaits its local processing pass.
    pub awaiting_trigger: bool,
}

pub struct ContextState {
    pub(crate) numbers: NumberPool,
    request_number: RequestNumber,
    nymbox_hash: Digest,
    requires_resync: bool,
    pub(crate) nymbox: Ledger,
    pub(crate) inboxes: BTreeMap<AccountId, Ledger>,
    pub(crate) outboxes: BTreeMap<AccountId, Ledger>,
    pub(crate) stale_accounts: BTreeSet<AccountId>,
    pub(crate) cron_items: BTreeMap<TransactionNumber, CronItem>,
    pub(crate) queue: OutgoingQueue,
    /// Answered request numbers at or above `applied_floor`. Everything
    /// below the floor is older than any outstanding request.
    applied: BTreeSet<RequestNumber>,
    applied_floor: RequestNumber,
}

impl ContextState {
    fn new(identity: &IdentityId) -> Self {
        let nymbox = Ledger::nymbox(identity.clone());
        Self {
            numbers: NumberPool::default(),
            request_number: 0,
            nymbox_hash: nymbox.hash(),
            requires_resync: false,
            nymbox,
            inboxes: BTreeMap::new(),
            outboxes: BTreeMap::new(),
            stale_accounts: BTreeSet::new(),
            cron_items: BTreeMap::new(),
            queue: OutgoingQueue::default(),
            applied: BTreeSet::new(),
            applied_floor: 0,
        }
    }

    pub fn next_request_number(&mut self) -> RequestNumber {
        self.request_number += 1;
        self.request_number
    }

    pub fn request_number(&self) -> RequestNumber {
        self.request_number
    }

    pub fn nymbox_hash(&self) -> Digest {
        self.nymbox_hash
    }

    pub fn requires_resync(&self) -> bool {
        self.requires_resync
    }

    pub fn reserve(&mut self, count: usize) -> Result<(GuardId, Vec<TransactionNumber>), ContextError> {
        if self.requires_resync && count > 0 {
            return Err(ContextError::ResyncRequired);
        }
        Ok(self.numbers.reserve(count)?)
    }

    pub fn merge_issued(
        &mut self,
        numbers: impl IntoIterator<Item = TransactionNumber>,
    ) -> MergeSummary {
        self.numbers.merge_issued(numbers)
    }

    /// Returns the guard's numbers and drops the request it was reserved for.
    pub(crate) fn abort_guard(&mut self, guard: GuardId) -> Vec<TransactionNumber> {
        if let Some(outgoing) = self.queue.remove_by_guard(guard) {
            debug!(
                request_number = outgoing.request.request_number,
                command = ?outgoing.request.command,
                "abandoned outstanding request"
            );
        }
        self.numbers.abort(guard)
    }

    /// Records the notary's current nymbox hash. Returns `true` when it
    /// differs from the confirmed one, which blocks number reservation until
    /// [`ContextState::resync`] succeeds.
    pub fn note_server_nymbox_hash(&mut self, reported: Digest) -> bool {
        if reported != self.nymbox_hash {
            if !self.requires_resync {
                warn!(
                    local = %self.nymbox_hash,
                    server = %reported,
                    "nymbox hash mismatch, resync required"
                );
            }
            self.requires_resync = true;
        }
        self.requires_resync
    }

    /// Replaces the local nymbox with a freshly fetched one and confirms its
    /// hash. Fails without touching state if the nymbox does not hash to
    /// `confirmed`.
    pub fn resync(&mut self, nymbox: Ledger, confirmed: Digest) -> Result<(), ContextError> {
        let actual = nymbox.hash();
        if actual != confirmed {
            self.requires_resync = true;
            return Err(ContextError::HashMismatch {
                claimed: confirmed,
                actual,
            });
        }
        self.nymbox = nymbox;
        self.confirm_nymbox_hash(confirmed);
        Ok(())
    }

    /// Flags the nymbox as untrusted after the notary sent contents that
    /// contradict its own hash.
    pub(crate) fn require_resync(&mut self) {
        if !self.requires_resync {
            warn!(local = %self.nymbox_hash, "nymbox contents rejected, resync required");
        }
        self.requires_resync = true;
    }

    /// Confirms `hash` as the notary's nymbox hash after a local mutation of
    /// the nymbox that the notary acknowledged.
    pub(crate) fn confirm_nymbox_hash(&mut self, hash: Digest) {
        if self.requires_resync {
            info!(hash = %hash, "nymbox resynchronized");
        }
        self.nymbox_hash = hash;
        self.requires_resync = false;
    }

    /// Records answered request numbers and forgets those older than the
    /// oldest request still in the queue.
    pub(crate) fn mark_applied(&mut self, request_numbers: impl IntoIterator<Item = RequestNumber>) {
        self.applied.extend(request_numbers);
        let floor = self
            .queue
            .oldest_request_number()
            .unwrap_or(self.request_number + 1);
        if floor > self.applied_floor {
            self.applied = self.applied.split_off(&floor);
            self.applied_floor = floor;
        }
    }

    pub fn was_applied(&self, request_number: RequestNumber) -> bool {
        request_number < self.applied_floor || self.applied.contains(&request_number)
    }

    pub fn applied_len(&self) -> usize {
        self.applied.len()
    }

    pub fn nymbox(&self) -> &Ledger {
        &self.nymbox
    }

    pub fn inbox(&self, account: &AccountId) -> Option<&Ledger> {
        self.inboxes.get(account)
    }

    pub fn outbox(&self, account: &AccountId) -> Option<&Ledger> {
        self.outboxes.get(account)
    }

    pub(crate) fn open_boxes(&mut self, owner: &IdentityId, account: &AccountId) {
        self.inboxes
            .entry(account.clone())
            .or_insert_with(|| Ledger::inbox(owner.clone(), account.clone()));
        self.outboxes
            .entry(account.clone())
            .or_insert_with(|| Ledger::outbox(owner.clone(), account.clone()));
    }

    pub(crate) fn close_boxes(&mut self, account: &AccountId) {
        self.inboxes.remove(account);
        self.outboxes.remove(account);
        self.stale_accounts.remove(account);
    }
}

pub struct ServerContext {
    identity: IdentityId,
    server: ServerId,
    server_key: PublicKey,
    state: Mutex<ContextState>,
}

impl ServerContext {
    pub fn new(identity: IdentityId, server: ServerId, server_key: PublicKey) -> Arc<Self> {
        let state = ContextState::new(&identity);
        Arc::new(Self {
            identity,
            server,
            server_key,
            state: Mutex::new(state),
        })
    }

    pub fn identity(&self) -> &IdentityId {
        &self.identity
    }

    pub fn server(&self) -> &ServerId {
        &self.server
    }

    pub fn server_key(&self) -> &PublicKey {
        &self.server_key
    }

    /// Enters the context's critical section.
    pub fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock()
    }

    /// Moves `count` available numbers under a new guard.
    pub fn reserve(self: &Arc<Self>, count: usize) -> Result<ManagedNumbers, ContextError> {
        let (id, numbers) = self.lock().reserve(count)?;
        Ok(ManagedNumbers::new(self.clone(), id, numbers))
    }

    pub fn merge_issued(
        &self,
        numbers: impl IntoIterator<Item = TransactionNumber>,
    ) -> MergeSummary {
        self.lock().merge_issued(numbers)
    }

    pub fn resync(&self, nymbox: Ledger, confirmed: Digest) -> Result<(), ContextError> {
        self.lock().resync(nymbox, confirmed)
    }

    pub fn available_numbers(&self) -> BTreeSet<TransactionNumber> {
        self.lock().numbers.available().clone()
    }

    pub fn consumed_numbers(&self) -> BTreeSet<TransactionNumber> {
        self.lock().numbers.consumed().clone()
    }

    /// True when fewer than `threshold` numbers remain available.
    pub fn needs_numbers(&self, threshold: usize) -> bool {
        self.lock().numbers.available().len() < threshold
    }

    pub fn requires_resync(&self) -> bool {
        self.lock().requires_resync()
    }

    pub fn nymbox_hash(&self) -> Digest {
        self.lock().nymbox_hash()
    }

    pub fn nymbox(&self) -> Ledger {
        self.lock().nymbox.clone()
    }

    pub fn inbox(&self, account: &AccountId) -> Option<Ledger> {
        self.lock().inbox(account).cloned()
    }

    pub fn outbox(&self, account: &AccountId) -> Option<Ledger> {
        self.lock().outbox(account).cloned()
    }

    pub fn is_account_stale(&self, account: &AccountId) -> bool {
        self.lock().stale_accounts.contains(account)
    }

    pub fn cron_items(&self) -> BTreeMap<TransactionNumber, CronItem> {
        self.lock().cron_items.clone()
    }

    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.lock().queue.pending()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let state = self.lock();
        ContextSnapshot {
            identity: self.identity.clone(),
            server: self.server.clone(),
            server_key: self.server_key,
            numbers: state.numbers.snapshot(),
            request_number: state.request_number,
            nymbox_hash: state.nymbox_hash,
            requires_resync: state.requires_resync,
            nymbox: state.nymbox.clone(),
            inboxes: state.inboxes.clone(),
            outboxes: state.outboxes.clone(),
            stale_accounts: state.stale_accounts.clone(),
            cron_items: state.cron_items.clone(),
        }
    }

    pub fn save(&self, storage: &Storage) -> bool {
        let key = snapshot_key(&self.identity, &self.server);
        match serde_json::to_vec(&self.snapshot()) {
            Ok(bytes) => storage.store(&key, &bytes),
            Err(err) => {
                warn!(%key, %err, "failed to serialize context");
                false
            }
        }
    }

    pub fn load(storage: &Storage, identity: &IdentityId, server: &ServerId) -> Option<Arc<Self>> {
        let bytes = storage.load(&snapshot_key(identity, server)).ok()?;
        let snapshot: ContextSnapshot = serde_json::from_slice(&bytes)
            .inspect_err(|err| warn!(%identity, %server, %err, "stored context is unreadable"))
            .ok()?;
        Some(Self::from_snapshot(snapshot))
    }

    pub fn from_snapshot(snapshot: ContextSnapshot) -> Arc<Self> {
        let mut state = ContextState::new(&snapshot.identity);
        state.numbers = snapshot.numbers;
        state.request_number = snapshot.request_number;
        // the queue is not persisted, so no earlier request can be answered
        state.applied_floor = snapshot.request_number + 1;
        state.nymbox_hash = snapshot.nymbox_hash;
        state.requires_resync = snapshot.requires_resync;
        state.nymbox = snapshot.nymbox;
        state.inboxes = snapshot.inboxes;
        state.outboxes = snapshot.outboxes;
        state.stale_accounts = snapshot.stale_accounts;
        state.cron_items = snapshot.cron_items;
        Arc::new(Self {
            identity: snapshot.identity,
            server: snapshot.server,
            server_key: snapshot.server_key,
            state: Mutex::new(state),
        })
    }
}

fn snapshot_key(identity: &IdentityId, server: &ServerId) -> String {
    format!("context/{identity}/{server}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub identity: IdentityId,
    pub server: ServerId,
    pub server_key: PublicKey,
    pub numbers: NumberPool,
    pub request_number: RequestNumber,
    pub nymbox_hash: Digest,
    #[serde(default)]
    pub requires_resync: bool,
    pub nymbox: Ledger,
    pub inboxes: BTreeMap<AccountId, Ledger>,
    pub outboxes: BTreeMap<AccountId, Ledger>,
    #[serde(default)]
    pub stale_accounts: BTreeSet<AccountId>,
    pub cron_items: BTreeMap<TransactionNumber, CronItem>,
}

/// Binds a set of Managed numbers to one outstanding request.
///
/// Resolves exactly once: [`commit`](Self::commit) consumes the numbers,
/// [`abort`](Self::abort) returns them and abandons the request. Dropping
/// an unresolved guard aborts it.
///
/// Never drop an unresolved guard while holding the context's lock.
#[must_use = "dropping the guard returns its numbers to the pool"]
pub struct ManagedNumbers {
    context: Arc<ServerContext>,
    id: GuardId,
    numbers: Vec<TransactionNumber>,
    resolved: bool,
}

impl ManagedNumbers {
    pub(crate) fn new(
        context: Arc<ServerContext>,
        id: GuardId,
        numbers: Vec<TransactionNumber>,
    ) -> Self {
        Self {
            context,
            id,
            numbers,
            resolved: false,
        }
    }

    pub fn id(&self) -> GuardId {
        self.id
    }

    pub fn numbers(&self) -> &[TransactionNumber] {
        &self.numbers
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Guard ids are only unique within one context.
    pub fn is_for(&self, context: &ServerContext) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.context), context)
    }

    pub fn commit(mut self) -> Vec<TransactionNumber> {
        self.resolved = true;
        self.context.lock().numbers.commit(self.id)
    }

    pub fn abort(mut self) -> Vec<TransactionNumber> {
        self.resolved = true;
        self.context.lock().abort_guard(self.id)
    }

    /// Hands resolution over to a caller already inside the critical
    /// section.
    pub(crate) fn disarm(mut self) -> GuardId {
        self.resolved = true;
        self.id
    }
}

impl std::fmt::Debug for ManagedNumbers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedNumbers")
            .field("id", &self.id)
            .field("numbers", &self.numbers)
            .field("resolved", &self.resolved)
            .finish()
    }
}

impl Drop for ManagedNumbers {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let returned = self.context.lock().abort_guard(self.id);
        if !returned.is_empty() {
            debug!(guard = self.id, numbers = ?returned, "unresolved guard dropped, numbers returned");
        }
    }
}

/// All contexts of this client, one per (identity, notary) relationship.
#[derive(Default)]
pub struct ContextStore {
    contexts: RwLock<HashMap<(IdentityId, ServerId), Arc<ServerContext>>>,
}

impl ContextStore {
    pub fn get(&self, identity: &IdentityId, server: &ServerId) -> Option<Arc<ServerContext>> {
        self.contexts
            .read()
            .get(&(identity.clone(), server.clone()))
            .cloned()
    }

    /// Returns the existing context, the one saved in `storage`, or a fresh
    /// one, in that order.
    pub fn get_or_create(
        &self,
        storage: &Storage,
        identity: &IdentityId,
        server: &ServerId,
        server_key: PublicKey,
    ) -> Arc<ServerContext> {
        let key = (identity.clone(), server.clone());
        let mut contexts = self.contexts.write();
        contexts
            .entry(key)
            .or_insert_with(|| {
                ServerContext::load(storage, identity, server).unwrap_or_else(|| {
                    info!(%identity, %server, "creating server context");
                    ServerContext::new(identity.clone(), server.clone(), server_key)
                })
            })
            .clone()
    }

    pub fn save_all(&self, storage: &Storage) -> usize {
        self.contexts
            .read()
            .values()
            .filter(|context| context.save(storage))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use crate::crypto::{Crypto, Ed25519Crypto};

    use super::*;

    fn context(numbers: &[TransactionNumber]) -> Arc<ServerContext> {
        let server = Ed25519Crypto::from_seed([9; 32]);
        let ctx = ServerContext::new("alice".into(), "notary".into(), server.public_key());
        ctx.merge_issued(numbers.iter().copied());
        ctx
    }

    #[test]
    fn dropped_guard_returns_numbers() {
        let ctx = context(&[5, 6, 7]);
        {
            let guard = ctx.reserve(2).unwrap();
            assert_eq!(guard.numbers(), &[5, 6]);
            assert_eq!(ctx.available_numbers(), BTreeSet::from([7]));
        }
        assert_eq!(ctx.available_numbers(), BTreeSet::from([5, 6, 7]));
    }

    #[test]
    fn explicit_resolution() {
        let ctx = context(&[5, 6, 7]);
        let guard = ctx.reserve(1).unwrap();
        assert_eq!(guard.commit(), vec![5]);
        let guard = ctx.reserve(1).unwrap();
        assert_eq!(guard.abort(), vec![6]);
        assert_eq!(ctx.available_numbers(), BTreeSet::from([6, 7]));
        assert_eq!(ctx.consumed_numbers(), BTreeSet::from([5]));
        assert!(ctx.needs_numbers(3));
        assert!(!ctx.needs_numbers(2));
    }

    #[test]
    fn desync_blocks_reservation_until_resync() {
        let ctx = context(&[5, 6, 7]);
        let mut fresh = Ledger::nymbox("alice".into());
        fresh.insert(crate::ledger::LedgerItem::new(
            77,
            crate::ledger::ItemKind::Notice,
            Default::default(),
        ));
        let server_hash = fresh.hash();

        assert!(ctx.lock().note_server_nymbox_hash(server_hash));
        assert!(ctx.requires_resync());
        assert_eq!(ctx.reserve(1).unwrap_err(), ContextError::ResyncRequired);
        // zero-number requests may still go out
        assert!(ctx.reserve(0).is_ok());

        let stale = Ledger::nymbox("alice".into());
        assert!(matches!(
            ctx.resync(stale, server_hash),
            Err(ContextError::HashMismatch { .. })
        ));
        assert!(ctx.requires_resync());

        ctx.resync(fresh, server_hash).unwrap();
        assert!(!ctx.requires_resync());
        assert_eq!(ctx.nymbox_hash(), server_hash);
        assert!(ctx.reserve(1).is_ok());
    }

    #[test]
    fn snapshot_round_trip_returns_managed_numbers() {
        let storage = Storage::in_memory();
        let ctx = context(&[1, 2, 3]);
        let guard = ctx.reserve(2).unwrap();
        ctx.lock().next_request_number();
        assert!(ctx.save(&storage));

        let restored = ServerContext::load(&storage, ctx.identity(), ctx.server()).unwrap();
        assert_eq!(restored.available_numbers(), BTreeSet::from([1, 2, 3]));
        assert_eq!(restored.lock().request_number(), 1);
        assert_eq!(restored.nymbox_hash(), ctx.nymbox_hash());
        drop(guard);
    }

    #[test]
    fn standing_desync_survives_a_restart() {
        let storage = Storage::in_memory();
        let ctx = context(&[1, 2, 3]);
        let account = AccountId::from("a1");
        {
            let mut state = ctx.lock();
            state.note_server_nymbox_hash(Digest::of(b"notary's view"));
            state.stale_accounts.insert(account.clone());
        }
        assert!(ctx.save(&storage));

        let restored = ServerContext::load(&storage, ctx.identity(), ctx.server()).unwrap();
        assert!(restored.requires_resync());
        assert!(restored.is_account_stale(&account));
        assert_eq!(restored.reserve(1).unwrap_err(), ContextError::ResyncRequired);
    }

    #[test]
    fn answered_requests_are_forgotten_once_nothing_older_is_queued() {
        let ctx = context(&[]);
        let mut state = ctx.lock();
        for _ in 0..5 {
            let request_number = state.next_request_number();
            state.mark_applied([request_number]);
        }
        assert_eq!(state.applied_len(), 0);
        assert!((1..=5).all(|n| state.was_applied(n)));
        assert!(!state.was_applied(6));
    }

    #[test]
    fn restored_context_ignores_replies_from_before_the_restart() {
        let storage = Storage::in_memory();
        let ctx = context(&[]);
        ctx.lock().next_request_number();
        ctx.lock().next_request_number();
        assert!(ctx.save(&storage));

        let restored = ServerContext::load(&storage, ctx.identity(), ctx.server()).unwrap();
        let state = restored.lock();
        assert!(state.was_applied(2));
        assert!(!state.was_applied(3));
    }

    #[test]
    fn store_reuses_contexts() {
        let storage = Storage::in_memory();
        let store = ContextStore::default();
        let key = Ed25519Crypto::from_seed([9; 32]).public_key();
        let a = store.get_or_create(&storage, &"alice".into(), &"notary".into(), key);
        let b = store.get_or_create(&storage, &"alice".into(), &"notary".into(), key);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(store.get(&"bob".into(), &"notary".into()).is_none());
        assert_eq!(store.save_all(&storage), 1);
    }
}
