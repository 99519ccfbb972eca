//! Applies ledger deltas carried in notary replies to local state.
//!
//! Every entry point validates the whole delta before mutating anything,
//! so a rejected delta leaves the context untouched. Once validation
//! passes, items are applied one by one; an item that fails verification
//! stays in its box and is reported back instead of aborting the rest.

use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    account::{AccountEvent, BalanceAction, BalanceCommand},
    command::CommandType,
    context::{ContextState, CronItem},
    crypto::{Crypto, Digest, PublicKey},
    identifier::{AccountId, IdentityId, RequestNumber, ServerId, TransactionNumber},
    ledger::{ItemKind, Ledger, LedgerItem, LedgerKind},
    message::{DividendPayout, Request},
    storage::{Storage, StorageError},
    wallet::{PendingWithdrawal, Wallet, WalletError},
    workflow::{Workflow, WorkflowEvent, WorkflowEventKind},
};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Reply carries a {actual:?} ledger, expected {expected:?}")]
    WrongLedger {
        expected: LedgerKind,
        actual: LedgerKind,
    },
    #[error("Reply closes {actual} items, request listed {expected}")]
    ItemCount { expected: usize, actual: usize },
    #[error("Reply closes item {number}, which the request did not list")]
    UnexpectedItem { number: TransactionNumber },
    #[error("Ledger belongs to `{actual}`, expected `{expected}`")]
    WrongOwner { expected: String, actual: String },
    #[error("No local {kind:?} for account `{account}`")]
    MissingLedger { kind: LedgerKind, account: AccountId },
    #[error("Signature on item {number} does not verify")]
    BadSignature { number: TransactionNumber },
    #[error("Receipt {number} does not match the request")]
    ReceiptMismatch { number: TransactionNumber },
    #[error("Claimed {kind:?} hash {claimed} does not match its contents {actual}")]
    HashMismatch {
        kind: LedgerKind,
        claimed: Digest,
        actual: Digest,
    },
    #[error("Request is missing its account")]
    MissingAccount,
    #[error("Reply payload does not answer {command:?}")]
    UnexpectedPayload { command: CommandType },
    #[error("No blinding state saved for withdrawal request {request_number}")]
    NoPendingWithdrawal { request_number: RequestNumber },
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error("Failed to persist receipt {number}: {source}")]
    Persist {
        number: TransactionNumber,
        #[source]
        source: StorageError,
    },
    #[error("Failed to encode receipt {number}: {source}")]
    Encode {
        number: TransactionNumber,
        #[source]
        source: serde_json::Error,
    },
}

/// Result of applying one delta.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Applied {
    pub items: usize,
    pub failed: Vec<TransactionNumber>,
    /// Storage keys of persisted receipts.
    pub receipts: Vec<String>,
    pub resync_required: bool,
}

impl Applied {
    fn merge(&mut self, other: Applied) {
        self.items += other.items;
        self.failed.extend(other.failed);
        self.receipts.extend(other.receipts);
        self.resync_required |= other.resync_required;
    }
}

/// Items a box-processing reply reports as closed.
#[derive(Debug, Clone, Copy)]
pub struct BoxDelta<'r> {
    pub kind: LedgerKind,
    pub accepted: &'r [LedgerItem],
    pub rejected: &'r [TransactionNumber],
    /// The notary's hash of the box after processing.
    pub claimed_hash: Option<Digest>,
}

#[derive(Serialize)]
struct Purse<'a> {
    account: &'a AccountId,
    amount: Decimal,
    tokens: &'a [u8],
    blinding: &'a [u8],
}

pub struct Reconciler<'a> {
    pub crypto: &'a dyn Crypto,
    pub wallet: &'a Wallet,
    pub storage: &'a Storage,
    pub workflow: &'a dyn Workflow,
    pub identity: &'a IdentityId,
    pub server: &'a ServerId,
    pub server_key: &'a PublicKey,
    pub verify_originator: bool,
}

impl Reconciler<'_> {
    /// Verifies the notary's signature and, for transfers, the sender's.
    /// The notary's signature covers the sender's key. The sender is the
    /// counterparty of an incoming transfer and this identity for one it
    /// sent.
    pub fn verify_item(&self, item: &LedgerItem) -> bool {
        if !self
            .crypto
            .verify(&item.server_bytes(), &item.server_signature, self.server_key)
        {
            return false;
        }
        if item.kind == ItemKind::Transfer && self.verify_originator {
            return item.originator.as_ref().is_some_and(|originator| {
                (item.counterparty.as_ref() == Some(&originator.identity)
                    || originator.identity == *self.identity)
                    && self.crypto.verify(
                        &item.body_bytes(),
                        &originator.signature,
                        &originator.key,
                    )
            });
        }
        true
    }

    fn verify_receipt(&self, item: &LedgerItem) -> Result<(), ReconcileError> {
        if self.verify_item(item) {
            Ok(())
        } else {
            Err(ReconcileError::BadSignature {
                number: item.number,
            })
        }
    }

    /// Applies a processed nymbox or inbox.
    pub fn apply_box_delta(
        &self,
        state: &mut ContextState,
        request: &Request,
        delta: BoxDelta<'_>,
    ) -> Result<Applied, ReconcileError> {
        let expected_kind = match request.command {
            CommandType::ProcessNymbox => LedgerKind::Nymbox,
            _ => LedgerKind::Inbox,
        };
        if delta.kind != expected_kind {
            return Err(ReconcileError::WrongLedger {
                expected: expected_kind,
                actual: delta.kind,
            });
        }
        let (accept, reject) = request.payload.processed_items().unwrap_or_default();
        let expected = accept.len() + reject.len();
        let actual = delta.accepted.len() + delta.rejected.len();
        if expected != actual {
            return Err(ReconcileError::ItemCount { expected, actual });
        }
        let accept: BTreeSet<_> = accept.iter().copied().collect();
        let reject: BTreeSet<_> = reject.iter().copied().collect();
        let mut seen = BTreeSet::new();
        for number in delta.accepted.iter().map(|item| item.number) {
            if !accept.contains(&number) || !seen.insert(number) {
                return Err(ReconcileError::UnexpectedItem { number });
            }
        }
        for number in delta.rejected {
            if !reject.contains(number) || !seen.insert(*number) {
                return Err(ReconcileError::UnexpectedItem { number: *number });
            }
        }
        if delta.kind == LedgerKind::Inbox {
            let account = request.account.as_ref().ok_or(ReconcileError::MissingAccount)?;
            if !state.inboxes.contains_key(account) {
                return Err(ReconcileError::MissingLedger {
                    kind: LedgerKind::Inbox,
                    account: account.clone(),
                });
            }
        }

        let mut applied = Applied::default();
        for item in delta.accepted {
            let local_matches = self
                .local_box(state, delta.kind, request.account.as_ref())
                .and_then(|ledger| ledger.get(item.number))
                .is_none_or(|local| local.same_body(item));
            if !local_matches || !self.verify_item(item) {
                warn!(number = item.number, kind = ?item.kind, "item failed verification, leaving it in place");
                applied.failed.push(item.number);
                continue;
            }
            match self.apply_item(state, item) {
                Ok(receipt) => {
                    if let Some(ledger) = self.local_box_mut(state, delta.kind, request.account.as_ref()) {
                        ledger.remove(item.number);
                    }
                    applied.items += 1;
                    applied.receipts.extend(receipt);
                }
                Err(err) => {
                    warn!(number = item.number, %err, "failed to apply item");
                    applied.failed.push(item.number);
                }
            }
        }
        for number in delta.rejected {
            let removed = self
                .local_box_mut(state, delta.kind, request.account.as_ref())
                .and_then(|ledger| ledger.remove(*number));
            if let Some(item) = removed {
                if item.kind == ItemKind::Transfer {
                    self.record(&item, WorkflowEventKind::TransferRejected, item.account.clone());
                }
            }
            applied.items += 1;
        }

        if let Some(claimed) = delta.claimed_hash {
            applied.resync_required =
                !self.check_box_hash(state, delta.kind, request.account.as_ref(), claimed);
        }
        Ok(applied)
    }

    fn local_box<'s>(
        &self,
        state: &'s ContextState,
        kind: LedgerKind,
        account: Option<&AccountId>,
    ) -> Option<&'s Ledger> {
        match kind {
            LedgerKind::Nymbox => Some(state.nymbox()),
            LedgerKind::Inbox => account.and_then(|a| state.inbox(a)),
            LedgerKind::Outbox => account.and_then(|a| state.outbox(a)),
        }
    }

    fn local_box_mut<'s>(
        &self,
        state: &'s mut ContextState,
        kind: LedgerKind,
        account: Option<&AccountId>,
    ) -> Option<&'s mut Ledger> {
        match kind {
            LedgerKind::Nymbox => Some(&mut state.nymbox),
            LedgerKind::Inbox => account.and_then(|a| state.inboxes.get_mut(a)),
            LedgerKind::Outbox => account.and_then(|a| state.outboxes.get_mut(a)),
        }
    }

    /// Compares the recomputed local hash with the notary's. A matching
    /// nymbox hash is confirmed; a mismatch flags the context (nymbox) or
    /// the account (inbox/outbox) for resync. Returns whether they matched.
    fn check_box_hash(
        &self,
        state: &mut ContextState,
        kind: LedgerKind,
        account: Option<&AccountId>,
        claimed: Digest,
    ) -> bool {
        let Some(local) = self.local_box(state, kind, account).map(Ledger::hash) else {
            return false;
        };
        let matched = local == claimed;
        match (kind, account) {
            (LedgerKind::Nymbox, _) if matched => state.confirm_nymbox_hash(claimed),
            (LedgerKind::Nymbox, _) => {
                state.note_server_nymbox_hash(claimed);
            }
            (_, Some(account)) if !matched => {
                warn!(%account, ?kind, %local, %claimed, "box hash mismatch, account needs resync");
                state.stale_accounts.insert(account.clone());
            }
            _ => {}
        }
        matched
    }

    /// Effect of accepting one item. Returns the persisted receipt key.
    fn apply_item(
        &self,
        state: &mut ContextState,
        item: &LedgerItem,
    ) -> Result<Option<String>, ReconcileError> {
        match item.kind {
            ItemKind::Transfer => {
                let account = item.account.as_ref().ok_or(ReconcileError::MissingAccount)?;
                self.apply_balance(account, item.number, BalanceAction::Credit, item.amount)?;
                self.record(item, WorkflowEventKind::IncomingTransfer, Some(account.clone()));
            }
            ItemKind::TransferReceipt => {
                if let Some(outbox) = item.account.as_ref().and_then(|a| state.outboxes.get_mut(a)) {
                    for number in &item.numbers {
                        outbox.remove(*number);
                    }
                }
                self.record(item, WorkflowEventKind::TransferCompleted, item.account.clone());
            }
            ItemKind::ChequeReceipt => {
                self.record(item, WorkflowEventKind::ChequeCleared, item.account.clone());
            }
            ItemKind::ItemReceipt => {}
            ItemKind::PaymentReceipt | ItemKind::MarketReceipt => {
                self.record(item, WorkflowEventKind::CronReceipt, item.account.clone());
            }
            ItemKind::FinalReceipt => {
                for number in &item.numbers {
                    if let Some(cron) = state.cron_items.remove(number) {
                        debug!(opening = number, command = ?cron.command, "cron item closed");
                    }
                }
                self.record(item, WorkflowEventKind::CronFinalized, item.account.clone());
            }
            ItemKind::Notice => {
                state.merge_issued(item.numbers.iter().copied());
                return Ok(None);
            }
        }
        self.persist(item.number, item).map(Some)
    }

    fn apply_balance(
        &self,
        account: &AccountId,
        receipt: TransactionNumber,
        action: BalanceAction,
        amount: Decimal,
    ) -> Result<bool, ReconcileError> {
        let command = BalanceCommand {
            receipt,
            action,
            amount,
        };
        let changed = self
            .wallet
            .with_account(self.identity, account, self.server, |acc| {
                acc.handle_balance_command(&command).map(|event| {
                    event.map(|event| acc.apply(&event)).is_some()
                })
            })?
            .map_err(|source| WalletError::Account {
                account: account.clone(),
                source,
            })?;
        if !changed {
            debug!(%account, receipt, "receipt already applied");
        }
        Ok(changed)
    }

    fn record(&self, item: &LedgerItem, kind: WorkflowEventKind, account: Option<AccountId>) {
        self.workflow.record(WorkflowEvent {
            identity: self.identity.clone(),
            item: item.number,
            workflow: Digest::of(&item.body_bytes()),
            kind,
            account,
            amount: item.amount,
        });
    }

    fn persist<T: Serialize>(
        &self,
        number: TransactionNumber,
        value: &T,
    ) -> Result<String, ReconcileError> {
        let bytes =
            serde_json::to_vec(value).map_err(|source| ReconcileError::Encode { number, source })?;
        self.storage
            .store_content(&bytes)
            .map_err(|source| ReconcileError::Persist { number, source })
    }

    /// Replaces the local nymbox with a freshly downloaded one.
    pub fn apply_nymbox(
        &self,
        state: &mut ContextState,
        nymbox: &Ledger,
        claimed: Digest,
    ) -> Result<Applied, ReconcileError> {
        self.check_ledger(nymbox, LedgerKind::Nymbox, None, claimed)?;
        state
            .resync(nymbox.clone(), claimed)
            .map_err(|_| ReconcileError::HashMismatch {
                kind: LedgerKind::Nymbox,
                claimed,
                actual: nymbox.hash(),
            })?;
        Ok(Applied {
            items: nymbox.len(),
            ..Default::default()
        })
    }

    fn check_ledger(
        &self,
        ledger: &Ledger,
        kind: LedgerKind,
        account: Option<&AccountId>,
        claimed: Digest,
    ) -> Result<(), ReconcileError> {
        if ledger.kind() != kind {
            return Err(ReconcileError::WrongLedger {
                expected: kind,
                actual: ledger.kind(),
            });
        }
        if ledger.owner() != self.identity || ledger.account() != account {
            return Err(ReconcileError::WrongOwner {
                expected: self.identity.to_string(),
                actual: ledger.owner().to_string(),
            });
        }
        let actual = ledger.hash();
        if actual != claimed {
            return Err(ReconcileError::HashMismatch {
                kind,
                claimed,
                actual,
            });
        }
        ledger.items().try_for_each(|item| {
            if self.crypto.verify(&item.server_bytes(), &item.server_signature, self.server_key) {
                Ok(())
            } else {
                Err(ReconcileError::BadSignature {
                    number: item.number,
                })
            }
        })
    }

    /// Replaces an account's local boxes and balance with the notary's
    /// signed statement.
    pub fn apply_account_data(
        &self,
        state: &mut ContextState,
        request: &Request,
        balance: Decimal,
        boxes: (&Ledger, &Ledger),
        claimed: (Option<Digest>, Option<Digest>),
    ) -> Result<Applied, ReconcileError> {
        let account = request.account.as_ref().ok_or(ReconcileError::MissingAccount)?;
        let (inbox, outbox) = boxes;
        let (claimed_inbox, claimed_outbox) = claimed;
        self.check_ledger(
            inbox,
            LedgerKind::Inbox,
            Some(account),
            claimed_inbox.unwrap_or_else(|| inbox.hash()),
        )?;
        self.check_ledger(
            outbox,
            LedgerKind::Outbox,
            Some(account),
            claimed_outbox.unwrap_or_else(|| outbox.hash()),
        )?;
        self.wallet
            .with_account(self.identity, account, self.server, |acc| {
                acc.apply(&AccountEvent::synchronized(balance))
            })?;
        state.inboxes.insert(account.clone(), inbox.clone());
        state.outboxes.insert(account.clone(), outbox.clone());
        state.stale_accounts.remove(account);
        Ok(Applied {
            items: inbox.len() + outbox.len(),
            ..Default::default()
        })
    }

    /// Checks that a single-receipt reply refers to this request.
    pub fn check_receipt(&self, request: &Request, receipt: &LedgerItem) -> Result<(), ReconcileError> {
        if !request.numbers.contains(&receipt.number) || receipt.account != request.account {
            return Err(ReconcileError::ReceiptMismatch {
                number: receipt.number,
            });
        }
        self.verify_receipt(receipt)
    }

    /// Debits the sending account and records the pending transfer in the
    /// outbox.
    pub fn apply_outgoing_transfer(
        &self,
        state: &mut ContextState,
        request: &Request,
        receipt: &LedgerItem,
        claimed_outbox: Option<Digest>,
    ) -> Result<Applied, ReconcileError> {
        let account = request.account.as_ref().ok_or(ReconcileError::MissingAccount)?;
        if receipt.amount != request.amount {
            return Err(ReconcileError::ReceiptMismatch {
                number: receipt.number,
            });
        }
        self.apply_balance(account, receipt.number, BalanceAction::Debit, receipt.amount)?;
        state.open_boxes(self.identity, account);
        if let Some(outbox) = state.outboxes.get_mut(account) {
            outbox.insert(receipt.clone());
        }
        self.record(receipt, WorkflowEventKind::OutgoingTransfer, Some(account.clone()));
        let mut applied = Applied {
            items: 1,
            receipts: vec![self.persist(receipt.number, receipt)?],
            ..Default::default()
        };
        if let Some(claimed) = claimed_outbox {
            applied.resync_required =
                !self.check_box_hash(state, LedgerKind::Outbox, Some(account), claimed);
        }
        Ok(applied)
    }

    /// Credits a cash or cheque deposit.
    pub fn apply_deposit(&self, request: &Request, receipt: &LedgerItem) -> Result<Applied, ReconcileError> {
        let account = request.account.as_ref().ok_or(ReconcileError::MissingAccount)?;
        let kind = match request.command {
            CommandType::DepositCheque => WorkflowEventKind::ChequeDeposit,
            _ => WorkflowEventKind::CashDeposit,
        };
        self.apply_balance(account, receipt.number, BalanceAction::Credit, receipt.amount)?;
        self.record(receipt, kind, Some(account.clone()));
        Ok(Applied {
            items: 1,
            receipts: vec![self.persist(receipt.number, receipt)?],
            ..Default::default()
        })
    }

    /// Debits the account and persists the purse built from the notary's
    /// signed tokens and the saved blinding state.
    pub fn apply_withdrawal(
        &self,
        receipt: &LedgerItem,
        tokens: &[u8],
        pending: &PendingWithdrawal,
    ) -> Result<Applied, ReconcileError> {
        self.apply_balance(&pending.account, receipt.number, BalanceAction::Debit, pending.amount)?;
        self.record(receipt, WorkflowEventKind::Withdrawal, Some(pending.account.clone()));
        let purse = Purse {
            account: &pending.account,
            amount: pending.amount,
            tokens,
            blinding: &pending.blinding,
        };
        Ok(Applied {
            items: 1,
            receipts: vec![
                self.persist(receipt.number, receipt)?,
                self.persist(receipt.number, &purse)?,
            ],
            ..Default::default()
        })
    }

    /// Debits the payer and credits every locally held shareholder account,
    /// all at once or not at all.
    pub fn apply_dividend(
        &self,
        request: &Request,
        receipt: &LedgerItem,
        per_share: Decimal,
        payouts: &[DividendPayout],
    ) -> Result<Applied, ReconcileError> {
        let payer = request.account.as_ref().ok_or(ReconcileError::MissingAccount)?;
        let total: Decimal = payouts.iter().map(|p| p.shares * per_share).sum();
        let mut commands = vec![(
            payer.clone(),
            BalanceCommand {
                receipt: receipt.number,
                action: BalanceAction::Debit,
                amount: total,
            },
        )];
        let local: Vec<&DividendPayout> = payouts
            .iter()
            .filter(|p| {
                self.wallet
                    .get_or_load_account(self.identity, &p.account, self.server)
                    .is_ok()
            })
            .collect();
        commands.extend(local.iter().map(|p| {
            (
                p.account.clone(),
                BalanceCommand {
                    receipt: p.voucher,
                    action: BalanceAction::Credit,
                    amount: p.shares * per_share,
                },
            )
        }));
        self.wallet.apply_batch(self.identity, self.server, &commands)?;

        self.record(receipt, WorkflowEventKind::DividendPaid, Some(payer.clone()));
        for payout in &local {
            self.workflow.record(WorkflowEvent {
                identity: self.identity.clone(),
                item: payout.voucher,
                workflow: Digest::of(&receipt.body_bytes()),
                kind: WorkflowEventKind::DividendReceived,
                account: Some(payout.account.clone()),
                amount: payout.shares * per_share,
            });
        }
        Ok(Applied {
            items: 1 + local.len(),
            receipts: vec![self.persist(receipt.number, receipt)?],
            ..Default::default()
        })
    }

    /// Records an activated cron item, then runs the trigger-clause pass if
    /// the notary reported one. The item stays `awaiting_trigger` if the
    /// notice fails verification.
    pub fn apply_cron_item(
        &self,
        state: &mut ContextState,
        request: &Request,
        receipt: &LedgerItem,
        trigger: Option<&LedgerItem>,
    ) -> Result<Applied, ReconcileError> {
        let opening = request.numbers.first().copied().unwrap_or(receipt.number);
        state.cron_items.insert(
            opening,
            CronItem {
                command: request.command,
                numbers: request.numbers.clone(),
                awaiting_trigger: trigger.is_some(),
            },
        );
        self.record(receipt, WorkflowEventKind::CronActivated, request.account.clone());
        let mut applied = Applied {
            items: 1,
            receipts: vec![self.persist(receipt.number, receipt)?],
            ..Default::default()
        };
        if let Some(notice) = trigger {
            applied.merge(self.apply_trigger(state, opening, notice)?);
        }
        Ok(applied)
    }

    /// Processing pass for a trigger-clause notice on the cron item opened
    /// by `opening`.
    pub fn apply_trigger(
        &self,
        state: &mut ContextState,
        opening: TransactionNumber,
        notice: &LedgerItem,
    ) -> Result<Applied, ReconcileError> {
        if !self.verify_item(notice) {
            warn!(opening, number = notice.number, "trigger notice failed verification");
            return Ok(Applied {
                failed: vec![notice.number],
                ..Default::default()
            });
        }
        if let Some(cron) = state.cron_items.get_mut(&opening) {
            cron.awaiting_trigger = false;
        }
        debug!(opening, clause = %notice.memo, "trigger clause processed");
        self.record(notice, WorkflowEventKind::ClauseTriggered, notice.account.clone());
        Ok(Applied {
            items: 1,
            receipts: vec![self.persist(notice.number, notice)?],
            ..Default::default()
        })
    }
}
