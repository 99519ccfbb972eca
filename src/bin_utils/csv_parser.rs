use std::io::Read;

use csv::{DeserializeRecordsIntoIter, Trim};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::identifier::{AccountId, IdentityId, UnitId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Register an account for `unit`.
    Register,
    /// Fetch `amount` (default 5) transaction numbers.
    Numbers,
    /// Download and process the nymbox.
    Sync,
    Deposit,
    Transfer,
    /// Refresh the account and accept everything in its inbox.
    Accept,
    Withdraw,
    /// Pay `amount` per share of `unit` from `account`.
    Dividend,
    Unregister,
}

#[derive(Debug, Deserialize)]
pub struct Step {
    #[serde(rename = "op")]
    pub operation: Operation,
    pub identity: IdentityId,
    pub account: Option<AccountId>,
    pub unit: Option<UnitId>,
    pub amount: Option<Decimal>,
    pub counterparty: Option<IdentityId>,
    pub counterparty_account: Option<AccountId>,
}

/// Parses a client script in CSV format, one [`Step`] per row.
pub struct CsvScriptParser<R> {
    iter: DeserializeRecordsIntoIter<R, Step>,
}

impl<R> CsvScriptParser<R>
where
    R: Read,
{
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(source);

        Self {
            iter: reader.into_deserialize(),
        }
    }
}

impl<R> Iterator for CsvScriptParser<R>
where
    R: Read,
{
    type Item = (u64, Result<Step, csv::Error>);

    fn next(&mut self) -> Option<Self::Item> {
        let curr_line = self.iter.reader().position().line();
        self.iter.next().map(|row| (curr_line, row))
    }
}
