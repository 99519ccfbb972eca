use tracing::{debug, info};

use crate::{
    account::{Account, AccountKind},
    command::{CommandType, Payload},
    context::ContextState,
    ledger::{Ledger, LedgerKind},
    message::{Reply, ReplyPayload, Request},
    reconciler::{Applied, BoxDelta, ReconcileError, Reconciler},
    wallet::PendingWithdrawal,
};

use super::Dispatcher;

impl Dispatcher {
    /// Applies an accepted reply. Every arm validates the payload against
    /// the request before mutating anything.
    pub(super) fn apply_accepted(
        &self,
        reconciler: &Reconciler<'_>,
        state: &mut ContextState,
        request: &Request,
        reply: &Reply,
        nymbox: Option<&Ledger>,
        pending_withdrawal: Option<&PendingWithdrawal>,
    ) -> Result<Applied, ReconcileError> {
        let command = request.command;
        let unexpected = || ReconcileError::UnexpectedPayload { command };

        match command {
            CommandType::GetTransactionNumbers => {
                let ReplyPayload::Numbers(numbers) = &reply.payload else {
                    return Err(unexpected());
                };
                let summary = state.merge_issued(numbers.iter().copied());
                info!(added = ?summary.added, "transaction numbers issued");
                Ok(Applied {
                    items: summary.added.len(),
                    ..Default::default()
                })
            }
            CommandType::GetNymbox => {
                let ledger = match (&reply.payload, nymbox) {
                    (ReplyPayload::Nymbox(ledger), _) => ledger,
                    (ReplyPayload::Empty, Some(ledger)) => ledger,
                    _ => return Err(unexpected()),
                };
                reconciler.apply_nymbox(state, ledger, reply.nymbox_hash)
            }
            CommandType::ProcessNymbox | CommandType::ProcessInbox => {
                let ReplyPayload::Processed {
                    kind,
                    accepted,
                    rejected,
                } = &reply.payload
                else {
                    return Err(unexpected());
                };
                let claimed_hash = match kind {
                    LedgerKind::Nymbox => Some(reply.nymbox_hash),
                    _ => reply.inbox_hash,
                };
                reconciler.apply_box_delta(
                    state,
                    request,
                    BoxDelta {
                        kind: *kind,
                        accepted,
                        rejected,
                        claimed_hash,
                    },
                )
            }
            CommandType::GetAccountData => {
                let ReplyPayload::AccountData {
                    balance,
                    inbox,
                    outbox,
                } = &reply.payload
                else {
                    return Err(unexpected());
                };
                reconciler.apply_account_data(
                    state,
                    request,
                    *balance,
                    (inbox, outbox),
                    (reply.inbox_hash, reply.outbox_hash),
                )
            }
            CommandType::RegisterAccount => {
                let ReplyPayload::AccountRegistered {
                    account,
                    unit,
                    issuer,
                } = &reply.payload
                else {
                    return Err(unexpected());
                };
                if request.unit.as_ref() != Some(unit) {
                    return Err(unexpected());
                }
                let known = reconciler
                    .wallet
                    .get_or_load_account(&request.identity, account, &request.server)
                    .is_ok();
                if !known {
                    let kind = if *issuer {
                        AccountKind::Issuer
                    } else {
                        AccountKind::Simple
                    };
                    reconciler.wallet.add_account(Account::new(
                        account.clone(),
                        request.identity.clone(),
                        request.server.clone(),
                        unit.clone(),
                        kind,
                    ))?;
                    info!(%account, %unit, "account registered");
                }
                state.open_boxes(&request.identity, account);
                Ok(Applied {
                    items: 1,
                    ..Default::default()
                })
            }
            CommandType::UnregisterAccount => {
                let (ReplyPayload::Empty, Some(account)) = (&reply.payload, &request.account) else {
                    return Err(unexpected());
                };
                reconciler.wallet.remove_account(account);
                state.close_boxes(account);
                info!(%account, "account unregistered");
                Ok(Applied {
                    items: 1,
                    ..Default::default()
                })
            }
            CommandType::NotarizeTransaction => {
                let ReplyPayload::Receipt(receipt) = &reply.payload else {
                    return Err(unexpected());
                };
                reconciler.check_receipt(request, receipt)?;
                reconciler.apply_outgoing_transfer(state, request, receipt, reply.outbox_hash)
            }
            CommandType::Deposit | CommandType::DepositCheque => {
                let ReplyPayload::Receipt(receipt) = &reply.payload else {
                    return Err(unexpected());
                };
                reconciler.check_receipt(request, receipt)?;
                if receipt.amount != request.amount {
                    return Err(ReconcileError::ReceiptMismatch {
                        number: receipt.number,
                    });
                }
                reconciler.apply_deposit(request, receipt)
            }
            CommandType::Withdrawal => {
                let ReplyPayload::Withdrawal { receipt, tokens } = &reply.payload else {
                    return Err(unexpected());
                };
                reconciler.check_receipt(request, receipt)?;
                let pending = pending_withdrawal.ok_or(ReconcileError::NoPendingWithdrawal {
                    request_number: request.request_number,
                })?;
                reconciler.apply_withdrawal(receipt, tokens, pending)
            }
            CommandType::PayDividend => {
                let (ReplyPayload::Dividend { receipt, payouts }, Payload::Dividend { per_share, .. }) =
                    (&reply.payload, &request.payload)
                else {
                    return Err(unexpected());
                };
                reconciler.check_receipt(request, receipt)?;
                reconciler.apply_dividend(request, receipt, *per_share, payouts)
            }
            CommandType::PaymentPlan | CommandType::MarketOffer | CommandType::SmartContract => {
                let ReplyPayload::Cron { receipt, trigger } = &reply.payload else {
                    return Err(unexpected());
                };
                reconciler.check_receipt(request, receipt)?;
                reconciler.apply_cron_item(state, request, receipt, trigger.as_ref())
            }
            CommandType::TriggerClause => {
                let (ReplyPayload::Receipt(notice), Payload::Clause { contract, clause }) =
                    (&reply.payload, &request.payload)
                else {
                    return Err(unexpected());
                };
                debug!(contract, %clause, "clause trigger acknowledged");
                reconciler.apply_trigger(state, *contract, notice)
            }
        }
    }
}
