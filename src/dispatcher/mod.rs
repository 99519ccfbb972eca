use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    command::{CommandError, CommandType, RequestSpec},
    config::ClientConfig,
    context::{ContextError, ContextState, ManagedNumbers, ServerContext},
    crypto::{Crypto, Digest, Signature},
    identifier::{AccountId, IdentityId, RequestNumber, ServerId, TransactionNumber},
    ledger::{Ledger, LedgerKind},
    message::{Reply, Request},
    numbers::{GuardId, NumberError},
    queue::{Outgoing, PendingRequest, QueueError, RequestState, RequestStatus},
    reconciler::{ReconcileError, Reconciler},
    storage::Storage,
    transport::{Transport, TransportError},
    wallet::{PendingWithdrawal, Wallet, WalletError},
    workflow::Workflow,
};

mod handlers;

#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("Nymbox is out of sync with the notary, fetch it first")]
    ResyncRequired,
    #[error("Account `{account}` must be refreshed from the notary first")]
    StaleAccount { account: AccountId },
    #[error("{limit} requests are already outstanding")]
    QueueFull { limit: usize },
    #[error("Items {numbers:?} are not in the local {kind:?}")]
    MissingItems {
        kind: LedgerKind,
        numbers: Vec<TransactionNumber>,
    },
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    NumberExhaustion(#[from] NumberError),
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    #[error("Request could not be encoded for signing: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<ContextError> for BuildError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Numbers(err) => BuildError::NumberExhaustion(err),
            ContextError::ResyncRequired | ContextError::HashMismatch { .. } => {
                BuildError::Precondition(PreconditionError::ResyncRequired)
            }
        }
    }
}

impl From<WalletError> for BuildError {
    fn from(err: WalletError) -> Self {
        BuildError::Precondition(err.into())
    }
}

impl From<QueueError> for BuildError {
    fn from(err: QueueError) -> Self {
        BuildError::Precondition(err.into())
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Reply is addressed to `{identity}` at `{server}`")]
    WrongContext { identity: IdentityId, server: ServerId },
    #[error("Reply {request_number} is not signed by the notary")]
    BadSignature { request_number: RequestNumber },
    #[error("Reply {request_number} matches no outstanding request")]
    UnknownRequest { request_number: RequestNumber },
    #[error("Reply {request_number} answers {actual:?}, request was {expected:?}")]
    CommandMismatch {
        request_number: RequestNumber,
        expected: CommandType,
        actual: CommandType,
    },
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Reply {request_number} contradicts the notary's {kind:?} hash: claimed {claimed}, contents hash to {actual}")]
    Desync {
        request_number: RequestNumber,
        kind: LedgerKind,
        claimed: Digest,
        actual: Digest,
    },
    #[error("Reply {request_number} was already applied")]
    Replay { request_number: RequestNumber },
    #[error("Reply {request_number}: applied {applied} items, {} failed verification", .failed.len())]
    PartialApply {
        request_number: RequestNumber,
        applied: usize,
        failed: Vec<TransactionNumber>,
    },
}

impl ReplyError {
    /// Replays are logged and otherwise ignored.
    pub fn is_benign(&self) -> bool {
        matches!(self, ReplyError::Replay { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyOutcome {
    pub request_number: RequestNumber,
    pub command: CommandType,
    pub status: RequestStatus,
    pub items_applied: usize,
    /// The context or the request's account must be resynchronized before
    /// further number-issuing requests.
    pub resync_required: bool,
    /// Storage keys of receipts persisted while applying the reply.
    pub receipts: Vec<String>,
}

/// Builds requests against a [`ServerContext`] and applies the notary's
/// replies to them.
///
/// Holds no per-context state itself; one dispatcher serves every context
/// of the client.
pub struct Dispatcher {
    crypto: Arc<dyn Crypto>,
    wallet: Arc<Wallet>,
    storage: Arc<Storage>,
    workflow: Arc<dyn Workflow>,
    config: ClientConfig,
}

impl Dispatcher {
    pub fn new(
        crypto: Arc<dyn Crypto>,
        wallet: Arc<Wallet>,
        storage: Arc<Storage>,
        workflow: Arc<dyn Workflow>,
        config: ClientConfig,
    ) -> Self {
        Self {
            crypto,
            wallet,
            storage,
            workflow,
            config,
        }
    }

    pub fn wallet(&self) -> &Arc<Wallet> {
        &self.wallet
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Reserves the numbers `spec` needs, signs the request and queues it.
    ///
    /// The returned guard owns the reservation: pass it back to
    /// [`process_reply`](Self::process_reply) with the reply, or to
    /// [`abandon`](Self::abandon). Dropping it abandons the request.
    pub fn build_request(
        &self,
        context: &Arc<ServerContext>,
        spec: RequestSpec,
    ) -> Result<ManagedNumbers, BuildError> {
        spec.validate()?;
        let command = spec.command;
        if let Some(account) = spec.account.as_ref().filter(|_| command.is_account_scoped()) {
            self.wallet
                .get_or_load_account(context.identity(), account, context.server())?;
        }
        if command == CommandType::Withdrawal {
            self.release_stale_withdrawal(context)?;
        }

        let (guard, request) = {
            let mut state = context.lock();
            check_preconditions(&state, &spec, self.config.max_outstanding_requests)?;
            let (guard, numbers) = state.reserve(command.numbers_required())?;
            let mut request = Request {
                request_number: state.next_request_number(),
                command,
                identity: context.identity().clone(),
                server: context.server().clone(),
                account: spec.account,
                unit: spec.unit,
                counterparty: spec.counterparty,
                counterparty_account: spec.counterparty_account,
                amount: spec.amount.unwrap_or(Decimal::ZERO),
                numbers,
                nymbox_hash: state.nymbox_hash(),
                payload: spec.payload,
                signature: Signature::empty(),
            };
            let queued = request
                .sign(self.crypto.as_ref())
                .map_err(BuildError::from)
                .and_then(|()| {
                    state
                        .queue
                        .push(Outgoing::new(request.clone(), Some(guard)))
                        .map_err(BuildError::from)
                });
            if let Err(err) = queued {
                state.numbers.abort(guard);
                return Err(err);
            }
            (guard, request)
        };
        let guard = ManagedNumbers::new(context.clone(), guard, request.numbers.clone());

        if let (CommandType::Withdrawal, Some(account), Some(blinding)) =
            (command, &request.account, spec.blinding)
        {
            // on error the guard drops here and takes the request off the queue
            self.wallet.set_pending_withdrawal(PendingWithdrawal {
                identity: context.identity().clone(),
                server: context.server().clone(),
                request_number: request.request_number,
                account: account.clone(),
                amount: request.amount,
                blinding,
            })?;
        }
        debug!(
            request_number = request.request_number,
            ?command,
            numbers = ?request.numbers,
            "request queued"
        );
        Ok(guard)
    }

    /// Only the owning context can tell whether its withdrawal is still
    /// outstanding, so a slot held by another context is never released.
    fn release_stale_withdrawal(&self, context: &ServerContext) -> Result<(), BuildError> {
        let Some(pending) = self.wallet.pending_withdrawal() else {
            return Ok(());
        };
        let (identity, server) = (context.identity(), context.server());
        if !pending.belongs_to(identity, server)
            || context.lock().queue.get(pending.request_number).is_some()
        {
            return Err(WalletError::WithdrawalPending {
                request_number: pending.request_number,
            }
            .into());
        }
        warn!(
            request_number = pending.request_number,
            "clearing withdrawal slot of a request that is no longer outstanding"
        );
        self.wallet
            .take_pending_withdrawal(identity, server, pending.request_number);
        Ok(())
    }

    /// Queues a request signed elsewhere. Its numbers are not managed by
    /// this client, so its reply resolves no guard.
    pub fn enqueue(&self, context: &ServerContext, request: Request) -> Result<(), QueueError> {
        let mut state = context.lock();
        if state.was_applied(request.request_number) {
            return Err(QueueError::DuplicateRequest {
                request_number: request.request_number,
            });
        }
        state.queue.push(Outgoing::new(request, None))
    }

    pub fn pending_requests(&self, context: &ServerContext) -> Vec<PendingRequest> {
        context.pending_requests()
    }

    /// Hands every built request to `transport`, oldest first, and marks it
    /// sent. Stops at the first transport failure.
    pub fn send_pending(
        &self,
        context: &ServerContext,
        transport: &dyn Transport,
    ) -> Result<usize, TransportError> {
        let unsent = context.lock().queue.unsent();
        let mut sent = 0;
        for request in unsent {
            transport.send(&request)?;
            // a reply may already have dequeued it
            if context.lock().queue.mark_sent(request.request_number).is_ok() {
                sent += 1;
            }
        }
        Ok(sent)
    }

    pub fn mark_timed_out(
        &self,
        context: &ServerContext,
        request_number: RequestNumber,
    ) -> Result<(), QueueError> {
        info!(request_number, "request timed out");
        context.lock().queue.mark_timed_out(request_number)
    }

    /// Puts a timed out request back in line to be sent, keeping its
    /// reserved numbers. With `resign_on_resend` it takes a fresh request
    /// number; replies to the old number are still accepted.
    pub fn resend(
        &self,
        context: &ServerContext,
        request_number: RequestNumber,
    ) -> Result<Request, QueueError> {
        let mut state = context.lock();
        let current = state
            .queue
            .get(request_number)
            .map(|entry| entry.state)
            .ok_or(QueueError::NotOutstanding { request_number })?;
        if current != RequestState::TimedOut {
            return Err(QueueError::NotTimedOut {
                request_number,
                state: current,
            });
        }
        let fresh = self
            .config
            .resign_on_resend
            .then(|| state.next_request_number());
        let entry = state
            .queue
            .get_mut(request_number)
            .ok_or(QueueError::NotOutstanding { request_number })?;
        if let Some(fresh) = fresh {
            let mut resigned = Request {
                request_number: fresh,
                ..entry.request.clone()
            };
            resigned
                .sign(self.crypto.as_ref())
                .map_err(|err| QueueError::Unsignable {
                    request_number,
                    reason: err.to_string(),
                })?;
            entry.aliases.push(entry.request.request_number);
            entry.request = resigned;
            debug!(old = request_number, new = fresh, "request re-signed for resend");
        }
        entry.state = RequestState::Built;
        Ok(entry.request.clone())
    }

    /// Gives up on the guard's request: numbers return to the pool, the
    /// request leaves the queue and a pending withdrawal slot is cleared.
    pub fn abandon(&self, guard: ManagedNumbers) -> Vec<TransactionNumber> {
        let context = guard.context().clone();
        let request_numbers: Vec<RequestNumber> = context
            .lock()
            .queue
            .get_by_guard(guard.id())
            .map(|entry| entry.request_numbers().collect())
            .unwrap_or_default();
        let returned = guard.abort();
        for request_number in request_numbers {
            self.wallet
                .take_pending_withdrawal(context.identity(), context.server(), request_number);
        }
        returned
    }

    /// Applies one reply. The guard reserved for the answered request is
    /// taken out of `guards` and resolved: committed when the notary
    /// accepted the request, aborted when it refused it. Validation
    /// failures and replays leave `guards` and all state untouched.
    ///
    /// `nymbox` stands in for the ledger of a GetNymbox reply that was
    /// delivered without one.
    pub fn process_reply(
        &self,
        guards: &mut Vec<ManagedNumbers>,
        context: &Arc<ServerContext>,
        reply: Reply,
        nymbox: Option<&Ledger>,
    ) -> Result<ReplyOutcome, ReplyError> {
        let request_number = reply.request_number;
        if reply.identity != *context.identity() || reply.server != *context.server() {
            return Err(ValidationError::WrongContext {
                identity: reply.identity,
                server: reply.server,
            }
            .into());
        }
        if !reply.verify(self.crypto.as_ref(), context.server_key()) {
            warn!(request_number, "rejecting reply with invalid notary signature");
            return Err(ValidationError::BadSignature { request_number }.into());
        }

        let mut state = context.lock();
        if state.was_applied(request_number) {
            debug!(request_number, "ignoring replayed reply");
            return Err(ReplyError::Replay { request_number });
        }
        let outgoing = state
            .queue
            .get(request_number)
            .cloned()
            .ok_or(ValidationError::UnknownRequest { request_number })?;
        if outgoing.request.command != reply.command {
            return Err(ValidationError::CommandMismatch {
                request_number,
                expected: outgoing.request.command,
                actual: reply.command,
            }
            .into());
        }
        let pending_withdrawal = self
            .wallet
            .pending_withdrawal()
            .filter(|pending| pending.belongs_to(context.identity(), context.server()))
            .filter(|pending| outgoing.answers_to(pending.request_number));

        if !reply.success {
            info!(request_number, command = ?reply.command, "notary rejected request");
            self.finish(context, &mut state, guards, &outgoing, RequestStatus::Rejected, reply.nymbox_hash);
            return Ok(ReplyOutcome {
                request_number: outgoing.request.request_number,
                command: reply.command,
                status: RequestStatus::Rejected,
                items_applied: 0,
                resync_required: state.requires_resync(),
                receipts: Vec::new(),
            });
        }

        let reconciler = self.reconciler(context);
        let applied = match self.apply_accepted(
            &reconciler,
            &mut state,
            &outgoing.request,
            &reply,
            nymbox,
            pending_withdrawal.as_ref(),
        ) {
            Ok(applied) => applied,
            Err(ReconcileError::HashMismatch {
                kind,
                claimed,
                actual,
            }) => {
                warn!(request_number, ?kind, %claimed, %actual, "notary contradicts its own hash");
                match (kind, outgoing.request.account.as_ref()) {
                    (LedgerKind::Nymbox, _) | (_, None) => state.require_resync(),
                    (_, Some(account)) => {
                        state.stale_accounts.insert(account.clone());
                    }
                }
                self.finish(context, &mut state, guards, &outgoing, RequestStatus::Rejected, reply.nymbox_hash);
                return Err(ReplyError::Desync {
                    request_number,
                    kind,
                    claimed,
                    actual,
                });
            }
            Err(err) => {
                warn!(request_number, %err, "reply does not match its request");
                return Err(ValidationError::Reconcile(err).into());
            }
        };

        self.finish(context, &mut state, guards, &outgoing, RequestStatus::Accepted, reply.nymbox_hash);
        if !applied.failed.is_empty() {
            warn!(request_number, failed = ?applied.failed, "reply applied partially");
            return Err(ReplyError::PartialApply {
                request_number,
                applied: applied.items,
                failed: applied.failed,
            });
        }
        debug!(request_number, command = ?reply.command, items = applied.items, "reply applied");
        Ok(ReplyOutcome {
            request_number: outgoing.request.request_number,
            command: reply.command,
            status: RequestStatus::Accepted,
            items_applied: applied.items,
            resync_required: applied.resync_required || state.requires_resync(),
            receipts: applied.receipts,
        })
    }

    fn reconciler<'a>(&'a self, context: &'a ServerContext) -> Reconciler<'a> {
        Reconciler {
            crypto: self.crypto.as_ref(),
            wallet: &self.wallet,
            storage: &self.storage,
            workflow: self.workflow.as_ref(),
            identity: context.identity(),
            server: context.server(),
            server_key: context.server_key(),
            verify_originator: self.config.verify_originator_signatures,
        }
    }

    /// Terminal bookkeeping shared by every answered request: resolve the
    /// guard, dequeue, remember the request numbers as applied, clear the
    /// withdrawal slot and record the notary's nymbox hash.
    fn finish(
        &self,
        context: &ServerContext,
        state: &mut ContextState,
        guards: &mut Vec<ManagedNumbers>,
        outgoing: &Outgoing,
        status: RequestStatus,
        nymbox_hash: Digest,
    ) {
        if let Some(guard) = outgoing.guard {
            resolve_guard(context, state, guards, guard, status);
        }
        state.queue.remove(outgoing.request.request_number);
        state.mark_applied(outgoing.request_numbers());
        for request_number in outgoing.request_numbers() {
            self.wallet
                .take_pending_withdrawal(context.identity(), context.server(), request_number);
        }
        state.note_server_nymbox_hash(nymbox_hash);
    }
}

fn resolve_guard(
    context: &ServerContext,
    state: &mut ContextState,
    guards: &mut Vec<ManagedNumbers>,
    guard: GuardId,
    status: RequestStatus,
) {
    // disarmed before it drops, the lock is already held
    if let Some(index) = guards
        .iter()
        .position(|g| g.id() == guard && g.is_for(context))
    {
        guards.swap_remove(index).disarm();
    }
    let numbers = match status {
        RequestStatus::Accepted => state.numbers.commit(guard),
        RequestStatus::Rejected => state.numbers.abort(guard),
    };
    debug!(guard, ?status, ?numbers, "guard resolved");
}

fn check_preconditions(
    state: &ContextState,
    spec: &RequestSpec,
    max_outstanding: usize,
) -> Result<(), PreconditionError> {
    let command = spec.command;
    if state.queue.len() >= max_outstanding {
        return Err(PreconditionError::QueueFull {
            limit: max_outstanding,
        });
    }
    if command.requires_synchronized_nymbox() && state.requires_resync() {
        return Err(PreconditionError::ResyncRequired);
    }
    if let Some(account) = spec.account.as_ref().filter(|_| command.numbers_required() > 0) {
        if state.stale_accounts.contains(account) {
            return Err(PreconditionError::StaleAccount {
                account: account.clone(),
            });
        }
    }
    if let Some((accept, reject)) = spec.payload.processed_items() {
        let (kind, ledger) = match command {
            CommandType::ProcessNymbox => (LedgerKind::Nymbox, Some(state.nymbox())),
            _ => (
                LedgerKind::Inbox,
                spec.account.as_ref().and_then(|a| state.inbox(a)),
            ),
        };
        let missing: Vec<_> = accept
            .iter()
            .chain(reject)
            .copied()
            .filter(|n| !ledger.is_some_and(|l| l.contains(*n)))
            .collect();
        if !missing.is_empty() {
            return Err(PreconditionError::MissingItems {
                kind,
                numbers: missing,
            });
        }
    }
    Ok(())
}
