use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifier::{AccountId, IdentityId, TransactionNumber, UnitId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    GetTransactionNumbers,
    GetNymbox,
    ProcessNymbox,
    GetAccountData,
    ProcessInbox,
    RegisterAccount,
    UnregisterAccount,
    /// Account-to-account transfer.
    NotarizeTransaction,
    Deposit,
    DepositCheque,
    Withdrawal,
    PayDividend,
    PaymentPlan,
    MarketOffer,
    SmartContract,
    TriggerClause,
}

impl CommandType {
    /// Transaction numbers a request of this type reserves.
    pub fn numbers_required(self) -> usize {
        match self {
            CommandType::GetTransactionNumbers
            | CommandType::GetNymbox
            | CommandType::ProcessNymbox
            | CommandType::GetAccountData
            | CommandType::RegisterAccount
            | CommandType::UnregisterAccount
            | CommandType::TriggerClause => 0,
            CommandType::ProcessInbox
            | CommandType::NotarizeTransaction
            | CommandType::Deposit
            | CommandType::DepositCheque
            | CommandType::Withdrawal
            | CommandType::PayDividend => 1,
            // opening and closing number
            CommandType::PaymentPlan | CommandType::MarketOffer | CommandType::SmartContract => 2,
        }
    }

    pub fn is_account_scoped(self) -> bool {
        !matches!(
            self,
            CommandType::GetTransactionNumbers
                | CommandType::GetNymbox
                | CommandType::ProcessNymbox
                | CommandType::RegisterAccount
                | CommandType::TriggerClause
        )
    }

    /// Commands the server refuses while the client's nymbox hash is stale.
    pub fn requires_synchronized_nymbox(self) -> bool {
        self == CommandType::GetTransactionNumbers || self.numbers_required() > 0
    }

    pub fn is_cron_item(self) -> bool {
        matches!(
            self,
            CommandType::PaymentPlan | CommandType::MarketOffer | CommandType::SmartContract
        )
    }

    fn requires_amount(self) -> bool {
        matches!(
            self,
            CommandType::NotarizeTransaction
                | CommandType::Deposit
                | CommandType::DepositCheque
                | CommandType::Withdrawal
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Empty,
    NumberCount(u32),
    Process {
        accept: Vec<TransactionNumber>,
        reject: Vec<TransactionNumber>,
    },
    Cash {
        tokens: Vec<u8>,
    },
    Cheque {
        cheque_number: TransactionNumber,
        drawer: IdentityId,
        drawer_account: AccountId,
    },
    /// Blinded prototokens. The blinding factors never leave the wallet.
    Withdrawal {
        blinded: Vec<u8>,
    },
    Dividend {
        share_unit: UnitId,
        per_share: Decimal,
    },
    Cron {
        terms: String,
    },
    Clause {
        contract: TransactionNumber,
        clause: String,
    },
}

impl Payload {
    /// Items a box-processing request accepts and rejects.
    pub fn processed_items(&self) -> Option<(&[TransactionNumber], &[TransactionNumber])> {
        match self {
            Payload::Process { accept, reject } => Some((accept, reject)),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Account is required for {command:?}")]
    AccountRequired { command: CommandType },
    #[error("Unit is required for {command:?}")]
    UnitRequired { command: CommandType },
    #[error("Amount is required for {command:?}")]
    AmountRequired { command: CommandType },
    #[error("Amount must be positive for {command:?}")]
    NonPositiveAmount { command: CommandType },
    #[error("Recipient account is required for {command:?}")]
    CounterpartyRequired { command: CommandType },
    #[error("Payload does not match {command:?}")]
    PayloadMismatch { command: CommandType },
    #[error("Blinding state is required for {command:?}")]
    BlindingRequired { command: CommandType },
    #[error("Item {number} is listed more than once")]
    DuplicateItem { number: TransactionNumber },
    #[error("Nothing to process for {command:?}")]
    NothingToProcess { command: CommandType },
}

/// Caller-side description of a request, before numbers are reserved and
/// the request is signed.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub command: CommandType,
    pub payload: Payload,
    pub account: Option<AccountId>,
    pub unit: Option<UnitId>,
    pub counterparty: Option<IdentityId>,
    pub counterparty_account: Option<AccountId>,
    pub amount: Option<Decimal>,
    pub blinding: Option<Vec<u8>>,
}

impl RequestSpec {
    pub fn new(command: CommandType) -> Self {
        Self {
            command,
            payload: Payload::Empty,
            account: None,
            unit: None,
            counterparty: None,
            counterparty_account: None,
            amount: None,
            blinding: None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_account(mut self, account: impl Into<AccountId>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<UnitId>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_counterparty(
        mut self,
        identity: impl Into<IdentityId>,
        account: impl Into<AccountId>,
    ) -> Self {
        self.counterparty = Some(identity.into());
        self.counterparty_account = Some(account.into());
        self
    }

    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_blinding(mut self, blinding: Vec<u8>) -> Self {
        self.blinding = Some(blinding);
        self
    }

    pub fn validate(&self) -> Result<(), CommandError> {
        let command = self.command;
        if command.is_account_scoped() && self.account.is_none() {
            return Err(CommandError::AccountRequired { command });
        }
        if command == CommandType::RegisterAccount && self.unit.is_none() {
            return Err(CommandError::UnitRequired { command });
        }
        if command.requires_amount() {
            match self.amount {
                None => return Err(CommandError::AmountRequired { command }),
                Some(amount) if amount <= Decimal::ZERO => {
                    return Err(CommandError::NonPositiveAmount { command });
                }
                Some(_) => {}
            }
        }
        if command == CommandType::NotarizeTransaction && self.counterparty_account.is_none() {
            return Err(CommandError::CounterpartyRequired { command });
        }
        self.validate_payload()
    }

    fn validate_payload(&self) -> Result<(), CommandError> {
        let command = self.command;
        let matches = match (&self.payload, command) {
            (Payload::Empty | Payload::NumberCount(_), CommandType::GetTransactionNumbers) => true,
            (Payload::Process { accept, reject }, CommandType::ProcessInbox)
            | (Payload::Process { accept, reject }, CommandType::ProcessNymbox) => {
                return validate_processed(command, accept, reject);
            }
            (Payload::Cash { .. }, CommandType::Deposit) => true,
            (Payload::Cheque { .. }, CommandType::DepositCheque) => true,
            (Payload::Withdrawal { .. }, CommandType::Withdrawal) => {
                if self.blinding.is_none() {
                    return Err(CommandError::BlindingRequired { command });
                }
                true
            }
            (Payload::Dividend { per_share, .. }, CommandType::PayDividend) => {
                if *per_share <= Decimal::ZERO {
                    return Err(CommandError::NonPositiveAmount { command });
                }
                true
            }
            (Payload::Cron { .. }, c) if c.is_cron_item() => true,
            (Payload::Clause { .. }, CommandType::TriggerClause) => true,
            (
                Payload::Empty,
                CommandType::GetNymbox
                | CommandType::GetAccountData
                | CommandType::RegisterAccount
                | CommandType::UnregisterAccount
                | CommandType::NotarizeTransaction,
            ) => true,
            _ => false,
        };
        if matches {
            Ok(())
        } else {
            Err(CommandError::PayloadMismatch { command })
        }
    }
}

fn validate_processed(
    command: CommandType,
    accept: &[TransactionNumber],
    reject: &[TransactionNumber],
) -> Result<(), CommandError> {
    if accept.is_empty() && reject.is_empty() {
        return Err(CommandError::NothingToProcess { command });
    }
    let mut seen = BTreeSet::new();
    for number in accept.iter().chain(reject) {
        if !seen.insert(*number) {
            return Err(CommandError::DuplicateItem { number: *number });
        }
    }
    Ok(())
}
