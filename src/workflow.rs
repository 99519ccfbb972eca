use std::collections::HashSet;

use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::{
    crypto::Digest,
    identifier::{AccountId, IdentityId, TransactionNumber},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowEventKind {
    IncomingTransfer,
    OutgoingTransfer,
    TransferRejected,
    TransferCompleted,
    CashDeposit,
    ChequeDeposit,
    ChequeCleared,
    Withdrawal,
    DividendPaid,
    DividendReceived,
    CronActivated,
    CronReceipt,
    CronFinalized,
    ClauseTriggered,
}

/// A payment event, keyed by `(identity, item, workflow)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowEvent {
    pub identity: IdentityId,
    pub item: TransactionNumber,
    /// Digest of the signed item that started this payment flow.
    pub workflow: Digest,
    pub kind: WorkflowEventKind,
    pub account: Option<AccountId>,
    pub amount: Decimal,
}

pub trait Workflow: Send + Sync {
    /// Records the event. Returns `false` if an event with the same key and
    /// kind was already recorded.
    fn record(&self, event: WorkflowEvent) -> bool;
}

#[derive(Default)]
pub struct InMemoryWorkflow {
    events: Mutex<Vec<WorkflowEvent>>,
    seen: Mutex<HashSet<(IdentityId, TransactionNumber, Digest, WorkflowEventKind)>>,
}

impl InMemoryWorkflow {
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().clone()
    }
}

impl Workflow for InMemoryWorkflow {
    fn record(&self, event: WorkflowEvent) -> bool {
        let key = (
            event.identity.clone(),
            event.item,
            event.workflow,
            event.kind,
        );
        if !self.seen.lock().insert(key) {
            return false;
        }
        self.events.lock().push(event);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_events_are_ignored() {
        let workflow = InMemoryWorkflow::default();
        let event = WorkflowEvent {
            identity: "alice".into(),
            item: 42,
            workflow: Digest::of(b"transfer"),
            kind: WorkflowEventKind::IncomingTransfer,
            account: Some("a1".into()),
            amount: Decimal::from(100),
        };
        assert!(workflow.record(event.clone()));
        assert!(!workflow.record(event.clone()));
        assert!(workflow.record(WorkflowEvent {
            kind: WorkflowEventKind::TransferCompleted,
            ..event
        }));
        assert_eq!(workflow.events().len(), 2);
    }
}
