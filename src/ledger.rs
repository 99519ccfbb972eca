use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    crypto::{Digest, PublicKey, Signature},
    identifier::{AccountId, IdentityId, TransactionNumber},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Nymbox,
    Inbox,
    Outbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Funds moving between accounts, pending acceptance by the recipient.
    Transfer,
    /// Recipient accepted a transfer this identity sent.
    TransferReceipt,
    /// A cheque this identity wrote was cashed.
    ChequeReceipt,
    /// A payment plan made one of its recurring payments.
    PaymentReceipt,
    /// A market offer traded.
    MarketReceipt,
    /// A cron item closed; its closing numbers are released.
    FinalReceipt,
    /// Server-originated notice. `numbers` holds newly granted numbers.
    Notice,
    /// Notary's acknowledgement of a transaction against one account.
    ItemReceipt,
}

/// Sender attestation carried by transferred items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Originator {
    pub identity: IdentityId,
    pub key: PublicKey,
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerItem {
    pub number: TransactionNumber,
    pub kind: ItemKind,
    pub amount: Decimal,
    pub account: Option<AccountId>,
    pub counterparty: Option<IdentityId>,
    pub counterparty_account: Option<AccountId>,
    /// Numbers granted (notices) or closed (receipts) by this item.
    #[serde(default)]
    pub numbers: Vec<TransactionNumber>,
    #[serde(default)]
    pub memo: String,
    pub originator: Option<Originator>,
    pub server_signature: Signature,
}

impl LedgerItem {
    pub fn new(number: TransactionNumber, kind: ItemKind, amount: Decimal) -> Self {
        Self {
            number,
            kind,
            amount,
            account: None,
            counterparty: None,
            counterparty_account: None,
            numbers: Vec::new(),
            memo: String::new(),
            originator: None,
            server_signature: Signature::empty(),
        }
    }

    /// Bytes the originator signs: every field except the signatures, each
    /// length-prefixed in declaration order.
    pub fn body_bytes(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        push_field(&mut payload, &self.number.to_be_bytes());
        push_field(&mut payload, &[self.kind as u8]);
        push_field(&mut payload, self.amount.to_string().as_bytes());
        push_optional(&mut payload, self.account.as_ref().map(|a| a.as_str().as_bytes()));
        push_optional(&mut payload, self.counterparty.as_ref().map(|c| c.as_str().as_bytes()));
        push_optional(
            &mut payload,
            self.counterparty_account.as_ref().map(|a| a.as_str().as_bytes()),
        );
        payload.extend_from_slice(&(self.numbers.len() as u64).to_be_bytes());
        for number in &self.numbers {
            payload.extend_from_slice(&number.to_be_bytes());
        }
        push_field(&mut payload, self.memo.as_bytes());
        payload
    }

    /// Bytes the notary signs: the body plus the originator's identity and
    /// key, so an attestation cannot be swapped for another one.
    pub fn server_bytes(&self) -> Vec<u8> {
        let mut payload = self.body_bytes();
        match &self.originator {
            Some(originator) => {
                payload.push(1);
                push_field(&mut payload, originator.identity.as_str().as_bytes());
                payload.extend_from_slice(originator.key.as_bytes());
            }
            None => payload.push(0),
        }
        payload
    }

    pub fn digest(&self) -> Digest {
        Digest::of_chunks([
            self.server_bytes().as_slice(),
            self.server_signature.as_bytes(),
        ])
    }

    pub fn same_body(&self, other: &LedgerItem) -> bool {
        self.body_bytes() == other.body_bytes()
    }
}

fn push_field(payload: &mut Vec<u8>, bytes: &[u8]) {
    payload.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    payload.extend_from_slice(bytes);
}

fn push_optional(payload: &mut Vec<u8>, bytes: Option<&[u8]>) {
    match bytes {
        Some(bytes) => {
            payload.push(1);
            push_field(payload, bytes);
        }
        None => payload.push(0),
    }
}

/// Local copy of one of the server's signed boxes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    kind: LedgerKind,
    owner: IdentityId,
    account: Option<AccountId>,
    items: BTreeMap<TransactionNumber, LedgerItem>,
}

impl Ledger {
    pub fn nymbox(owner: IdentityId) -> Self {
        Self::new(LedgerKind::Nymbox, owner, None)
    }

    pub fn inbox(owner: IdentityId, account: AccountId) -> Self {
        Self::new(LedgerKind::Inbox, owner, Some(account))
    }

    pub fn outbox(owner: IdentityId, account: AccountId) -> Self {
        Self::new(LedgerKind::Outbox, owner, Some(account))
    }

    fn new(kind: LedgerKind, owner: IdentityId, account: Option<AccountId>) -> Self {
        Self {
            kind,
            owner,
            account,
            items: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> LedgerKind {
        self.kind
    }

    pub fn owner(&self) -> &IdentityId {
        &self.owner
    }

    pub fn account(&self) -> Option<&AccountId> {
        self.account.as_ref()
    }

    /// Inserts the item unless its number is already present.
    pub fn insert(&mut self, item: LedgerItem) -> bool {
        if self.items.contains_key(&item.number) {
            return false;
        }
        self.items.insert(item.number, item);
        true
    }

    pub fn remove(&mut self, number: TransactionNumber) -> Option<LedgerItem> {
        self.items.remove(&number)
    }

    pub fn get(&self, number: TransactionNumber) -> Option<&LedgerItem> {
        self.items.get(&number)
    }

    pub fn contains(&self, number: TransactionNumber) -> bool {
        self.items.contains_key(&number)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> impl Iterator<Item = &LedgerItem> {
        self.items.values()
    }

    pub fn numbers(&self) -> Vec<TransactionNumber> {
        self.items.keys().copied().collect()
    }

    /// Hash both sides compute over the box contents, in number order.
    pub fn hash(&self) -> Digest {
        let tag = [self.kind as u8];
        let digests: Vec<Digest> = self.items.values().map(LedgerItem::digest).collect();
        Digest::of_chunks(
            std::iter::once(tag.as_slice()).chain(digests.iter().map(|d| d.as_bytes().as_slice())),
        )
    }
}
