use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    command::{CommandType, Payload},
    crypto::{Crypto, Digest, PublicKey, Signature},
    identifier::{AccountId, IdentityId, RequestNumber, ServerId, TransactionNumber, UnitId},
    ledger::{Ledger, LedgerItem, LedgerKind},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub request_number: RequestNumber,
    pub command: CommandType,
    pub identity: IdentityId,
    pub server: ServerId,
    pub account: Option<AccountId>,
    pub unit: Option<UnitId>,
    pub counterparty: Option<IdentityId>,
    pub counterparty_account: Option<AccountId>,
    pub amount: Decimal,
    /// Transaction numbers reserved for this request.
    pub numbers: Vec<TransactionNumber>,
    /// The client's confirmed nymbox hash when the request was signed.
    pub nymbox_hash: Digest,
    pub payload: Payload,
    pub signature: Signature,
}

impl Request {
    pub fn signing_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let unsigned = Request {
            signature: Signature::empty(),
            ..self.clone()
        };
        serde_json::to_vec(&unsigned)
    }

    pub fn sign(&mut self, crypto: &dyn Crypto) -> Result<(), serde_json::Error> {
        self.signature = crypto.sign(&self.signing_bytes()?);
        Ok(())
    }

    pub fn verify(&self, crypto: &dyn Crypto, key: &PublicKey) -> bool {
        self.signing_bytes()
            .is_ok_and(|bytes| crypto.verify(&bytes, &self.signature, key))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DividendPayout {
    pub account: AccountId,
    pub shares: Decimal,
    pub voucher: TransactionNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyPayload {
    Empty,
    Numbers(Vec<TransactionNumber>),
    Nymbox(Ledger),
    AccountData {
        balance: Decimal,
        inbox: Ledger,
        outbox: Ledger,
    },
    /// Items the server closed in response to a box-processing request.
    Processed {
        kind: LedgerKind,
        accepted: Vec<LedgerItem>,
        rejected: Vec<TransactionNumber>,
    },
    Receipt(LedgerItem),
    Withdrawal {
        receipt: LedgerItem,
        tokens: Vec<u8>,
    },
    Dividend {
        receipt: LedgerItem,
        payouts: Vec<DividendPayout>,
    },
    Cron {
        receipt: LedgerItem,
        /// Notice that one of the item's clauses fired while activating it.
        trigger: Option<LedgerItem>,
    },
    AccountRegistered {
        account: AccountId,
        unit: UnitId,
        /// The identity issued `unit`; its account may go negative.
        #[serde(default)]
        issuer: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub request_number: RequestNumber,
    pub command: CommandType,
    pub identity: IdentityId,
    pub server: ServerId,
    pub success: bool,
    /// The server's current nymbox hash for this identity.
    pub nymbox_hash: Digest,
    pub inbox_hash: Option<Digest>,
    pub outbox_hash: Option<Digest>,
    pub payload: ReplyPayload,
    pub signature: Signature,
}

impl Reply {
    pub fn signing_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let unsigned = Reply {
            signature: Signature::empty(),
            ..self.clone()
        };
        serde_json::to_vec(&unsigned)
    }

    pub fn sign(&mut self, crypto: &dyn Crypto) -> Result<(), serde_json::Error> {
        self.signature = crypto.sign(&self.signing_bytes()?);
        Ok(())
    }

    pub fn verify(&self, crypto: &dyn Crypto, key: &PublicKey) -> bool {
        !self.signature.is_empty()
            && self
                .signing_bytes()
                .is_ok_and(|bytes| crypto.verify(&bytes, &self.signature, key))
    }
}
