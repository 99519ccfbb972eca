use std::io::Write;

use anyhow::Context;
use csv::Writer;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::identifier::{AccountId, IdentityId, UnitId};

#[derive(Debug, Serialize)]
pub struct AccountRow {
    pub account: AccountId,
    pub owner: IdentityId,
    pub unit: UnitId,
    pub balance: Decimal,
}

/// Writes one CSV row per account, with a header.
pub fn print_accounts<W>(
    output: &mut W,
    accounts: impl Iterator<Item = AccountRow>,
) -> anyhow::Result<()>
where
    W: Write,
{
    let mut writer = Writer::from_writer(output);
    for row in accounts {
        writer
            .serialize(&row)
            .with_context(|| format!("Failed to write account `{}`", row.account))?;
    }
    writer.flush().context("Failed to flush account listing")
}
