use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifier::{AccountId, IdentityId, ServerId, TransactionNumber, UnitId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Simple,
    /// Issuer accounts mirror outstanding supply and may go negative.
    Issuer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceAction {
    Credit,
    Debit,
}

/// Balance change requested by the reconciler, keyed by the receipt that
/// justifies it.
#[derive(Debug, Clone)]
pub struct BalanceCommand {
    pub receipt: TransactionNumber,
    pub action: BalanceAction,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEventKind {
    Credited,
    Debited,
    /// Balance overwritten by a server-signed account statement.
    Synchronized,
}

#[derive(Debug, Clone)]
pub struct AccountEvent {
    receipt: TransactionNumber,
    amount: Decimal,
    kind: AccountEventKind,
}

impl AccountEvent {
    pub fn synchronized(balance: Decimal) -> Self {
        Self {
            receipt: 0,
            amount: balance,
            kind: AccountEventKind::Synchronized,
        }
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn kind(&self) -> &AccountEventKind {
        &self.kind
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("Insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: Decimal, requested: Decimal },
    #[error("Amount must not be negative, got {amount}")]
    NegativeAmount { amount: Decimal },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    id: AccountId,
    owner: IdentityId,
    server: ServerId,
    unit: UnitId,
    kind: AccountKind,
    balance: Decimal,
    /// Shares held, for accounts denominated in a dividend-paying unit.
    #[serde(default)]
    shares: Decimal,
    applied_receipts: BTreeSet<TransactionNumber>,
}

impl Account {
    pub fn new(
        id: AccountId,
        owner: IdentityId,
        server: ServerId,
        unit: UnitId,
        kind: AccountKind,
    ) -> Self {
        Self {
            id,
            owner,
            server,
            unit,
            kind,
            balance: Decimal::ZERO,
            shares: Decimal::ZERO,
            applied_receipts: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> &AccountId {
        &self.id
    }

    pub fn owner(&self) -> &IdentityId {
        &self.owner
    }

    pub fn server(&self) -> &ServerId {
        &self.server
    }

    pub fn unit(&self) -> &UnitId {
        &self.unit
    }

    pub fn kind(&self) -> AccountKind {
        self.kind
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn shares(&self) -> Decimal {
        self.shares
    }

    pub fn set_shares(&mut self, shares: Decimal) {
        self.shares = shares;
    }

    pub fn has_applied(&self, receipt: TransactionNumber) -> bool {
        self.applied_receipts.contains(&receipt)
    }

    pub fn apply(&mut self, event: &AccountEvent) {
        match event.kind {
            AccountEventKind::Credited => {
                self.balance += event.amount;
                self.applied_receipts.insert(event.receipt);
            }
            AccountEventKind::Debited => {
                self.balance -= event.amount;
                self.applied_receipts.insert(event.receipt);
            }
            AccountEventKind::Synchronized => {
                self.balance = event.amount;
            }
        }
    }

    /// Validates a balance command. Returns `None` when the receipt was
    /// already applied to this account.
    pub fn handle_balance_command(
        &self,
        command: &BalanceCommand,
    ) -> Result<Option<AccountEvent>, AccountError> {
        if self.applied_receipts.contains(&command.receipt) {
            return Ok(None);
        }
        if command.amount < Decimal::ZERO {
            return Err(AccountError::NegativeAmount {
                amount: command.amount,
            });
        }
        let kind = match command.action {
            BalanceAction::Credit => AccountEventKind::Credited,
            BalanceAction::Debit => {
                if self.kind != AccountKind::Issuer && self.balance < command.amount {
                    return Err(AccountError::InsufficientFunds {
                        balance: self.balance,
                        requested: command.amount,
                    });
                }
                AccountEventKind::Debited
            }
        };
        Ok(Some(AccountEvent {
            receipt: command.receipt,
            amount: command.amount,
            kind,
        }))
    }
}
