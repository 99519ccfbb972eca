//! In-process notary answering requests directly, used by the CLI and the
//! integration tests in place of a network transport.
//!
//! It keeps just enough server-side state (balances, boxes, issued
//! numbers) to produce signed replies the client will accept. The first
//! account registered for a unit is that unit's issuer account.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    command::{CommandType, Payload},
    crypto::{Crypto, Ed25519Crypto, PublicKey, Signature},
    identifier::{AccountId, IdentityId, ServerId, TransactionNumber, UnitId},
    ledger::{ItemKind, Ledger, LedgerItem, LedgerKind, Originator},
    message::{DividendPayout, Reply, ReplyPayload, Request},
    transport::{Transport, TransportError},
};

#[derive(Debug, Error)]
pub enum Refusal {
    #[error("Request signature does not verify")]
    BadSignature,
    #[error("Unknown account `{0}`")]
    UnknownAccount(AccountId),
    #[error("Account `{0}` already exists")]
    AccountExists(AccountId),
    #[error("`{identity}` does not own `{account}`")]
    NotOwner {
        identity: IdentityId,
        account: AccountId,
    },
    #[error("Insufficient funds in `{0}`")]
    InsufficientFunds(AccountId),
    #[error("Item {0} is not in the box")]
    MissingItem(TransactionNumber),
    #[error("Account `{0}` still holds funds or receipts")]
    NotEmpty(AccountId),
    #[error("Malformed {0:?} request")]
    Malformed(CommandType),
}

#[derive(Debug, Clone)]
struct NotaryAccount {
    owner: IdentityId,
    unit: UnitId,
    balance: Decimal,
    issuer: bool,
}

pub struct LoopbackNotary {
    id: ServerId,
    crypto: Ed25519Crypto,
    next_number: TransactionNumber,
    identities: HashMap<IdentityId, Arc<dyn Crypto>>,
    issuers: HashMap<UnitId, IdentityId>,
    accounts: BTreeMap<AccountId, NotaryAccount>,
    nymboxes: HashMap<IdentityId, Ledger>,
    inboxes: HashMap<AccountId, Ledger>,
    outboxes: HashMap<AccountId, Ledger>,
}

impl LoopbackNotary {
    pub fn new(id: impl Into<ServerId>, seed: [u8; 32]) -> Self {
        Self {
            id: id.into(),
            crypto: Ed25519Crypto::from_seed(seed),
            next_number: 100,
            identities: HashMap::new(),
            issuers: HashMap::new(),
            accounts: BTreeMap::new(),
            nymboxes: HashMap::new(),
            inboxes: HashMap::new(),
            outboxes: HashMap::new(),
        }
    }

    pub fn id(&self) -> &ServerId {
        &self.id
    }

    pub fn public_key(&self) -> PublicKey {
        self.crypto.public_key()
    }

    /// Registers a client's keys. Requests from known identities must be
    /// signed, and their transfers carry an originator attestation.
    pub fn register_identity(&mut self, identity: IdentityId, crypto: Arc<dyn Crypto>) {
        self.identities.insert(identity, crypto);
    }

    pub fn balance(&self, account: &AccountId) -> Option<Decimal> {
        self.accounts.get(account).map(|acc| acc.balance)
    }

    pub fn nymbox(&self, identity: &IdentityId) -> Ledger {
        self.nymboxes
            .get(identity)
            .cloned()
            .unwrap_or_else(|| Ledger::nymbox(identity.clone()))
    }

    pub fn inbox(&self, account: &AccountId) -> Option<&Ledger> {
        self.inboxes.get(account)
    }

    /// Signs `item` with the notary key.
    pub fn sign_item(&self, mut item: LedgerItem) -> LedgerItem {
        item.server_signature = self.crypto.sign(&item.server_bytes());
        item
    }

    /// Signs a reply the caller assembled by hand.
    pub fn sign_reply(&self, mut reply: Reply) -> Reply {
        self.seal(&mut reply);
        reply
    }

    /// An unencodable reply goes out unsigned and the client refuses it.
    fn seal(&self, reply: &mut Reply) {
        if let Err(err) = reply.sign(&self.crypto) {
            warn!(request_number = reply.request_number, %err, "reply left unsigned");
        }
    }

    /// Drops a notice granting `count` fresh numbers into the identity's
    /// nymbox, the way numbers arrive out of band.
    pub fn grant_via_nymbox(&mut self, identity: &IdentityId, count: usize) -> TransactionNumber {
        let numbers: Vec<_> = (0..count).map(|_| self.issue_number()).collect();
        let number = self.issue_number();
        let notice = self.sign_item(LedgerItem {
            numbers,
            ..LedgerItem::new(number, ItemKind::Notice, Decimal::ZERO)
        });
        self.nymbox_mut(identity).insert(notice);
        number
    }

    /// Signs `item` and places it in an account's inbox, as if another
    /// party had sent it.
    pub fn deliver(&mut self, owner: &IdentityId, account: &AccountId, item: LedgerItem) {
        let item = self.sign_item(item);
        self.inbox_mut(owner, account).insert(item);
    }

    pub fn handle(&mut self, request: &Request) -> Reply {
        let result = self.verify(request).and_then(|()| self.execute(request));
        let (success, payload) = match result {
            Ok(payload) => (true, payload),
            Err(refusal) => {
                debug!(request_number = request.request_number, %refusal, "notary refused request");
                (false, ReplyPayload::Empty)
            }
        };
        let account = request.account.as_ref();
        let mut reply = Reply {
            request_number: request.request_number,
            command: request.command,
            identity: request.identity.clone(),
            server: self.id.clone(),
            success,
            nymbox_hash: self.nymbox(&request.identity).hash(),
            inbox_hash: account.and_then(|a| self.inboxes.get(a)).map(Ledger::hash),
            outbox_hash: account.and_then(|a| self.outboxes.get(a)).map(Ledger::hash),
            payload,
            signature: Signature::empty(),
        };
        self.seal(&mut reply);
        reply
    }

    fn verify(&self, request: &Request) -> Result<(), Refusal> {
        match self.identities.get(&request.identity) {
            Some(crypto) if !request.verify(crypto.as_ref(), &crypto.public_key()) => {
                Err(Refusal::BadSignature)
            }
            _ => Ok(()),
        }
    }

    fn execute(&mut self, request: &Request) -> Result<ReplyPayload, Refusal> {
        let malformed = || Refusal::Malformed(request.command);
        let identity = &request.identity;
        match request.command {
            CommandType::GetTransactionNumbers => {
                let count = match request.payload {
                    Payload::NumberCount(count) => count as usize,
                    _ => 5,
                };
                let numbers = (0..count).map(|_| self.issue_number()).collect();
                Ok(ReplyPayload::Numbers(numbers))
            }
            CommandType::GetNymbox => Ok(ReplyPayload::Nymbox(self.nymbox(identity))),
            CommandType::ProcessNymbox => {
                let (accept, reject) = request.payload.processed_items().ok_or_else(malformed)?;
                let nymbox = self.nymbox_mut(identity);
                let (accepted, rejected) = take_items(nymbox, accept, reject)?;
                Ok(ReplyPayload::Processed {
                    kind: LedgerKind::Nymbox,
                    accepted,
                    rejected,
                })
            }
            CommandType::GetAccountData => {
                let account = self.owned(request)?.clone();
                let balance = self.accounts[&account].balance;
                Ok(ReplyPayload::AccountData {
                    balance,
                    inbox: self.inbox_mut(identity, &account).clone(),
                    outbox: self.outbox_mut(identity, &account).clone(),
                })
            }
            CommandType::ProcessInbox => {
                let account = self.owned(request)?.clone();
                let (accept, reject) = request.payload.processed_items().ok_or_else(malformed)?;
                let inbox = self.inbox_mut(identity, &account);
                let (accepted, rejected) = take_items(inbox, accept, reject)?;
                for item in accepted.iter().filter(|i| i.kind == ItemKind::Transfer) {
                    self.credit(&account, item.amount)?;
                    self.notify_sender(item);
                }
                Ok(ReplyPayload::Processed {
                    kind: LedgerKind::Inbox,
                    accepted,
                    rejected,
                })
            }
            CommandType::RegisterAccount => {
                let unit = request.unit.clone().ok_or_else(malformed)?;
                let account = match &request.account {
                    Some(account) => account.clone(),
                    None => AccountId::new(format!("{identity}-{unit}-{}", self.issue_number())),
                };
                if self.accounts.contains_key(&account) {
                    return Err(Refusal::AccountExists(account));
                }
                let issuer = *self
                    .issuers
                    .entry(unit.clone())
                    .or_insert_with(|| identity.clone())
                    == *identity;
                self.accounts.insert(
                    account.clone(),
                    NotaryAccount {
                        owner: identity.clone(),
                        unit: unit.clone(),
                        balance: Decimal::ZERO,
                        issuer,
                    },
                );
                self.inbox_mut(identity, &account);
                self.outbox_mut(identity, &account);
                Ok(ReplyPayload::AccountRegistered {
                    account,
                    unit,
                    issuer,
                })
            }
            CommandType::UnregisterAccount => {
                let account = self.owned(request)?.clone();
                let empty_inbox = self.inboxes.get(&account).is_none_or(Ledger::is_empty);
                if self.accounts[&account].balance != Decimal::ZERO || !empty_inbox {
                    return Err(Refusal::NotEmpty(account));
                }
                self.accounts.remove(&account);
                self.inboxes.remove(&account);
                self.outboxes.remove(&account);
                Ok(ReplyPayload::Empty)
            }
            CommandType::NotarizeTransaction => {
                let from = self.owned(request)?.clone();
                let number = *request.numbers.first().ok_or_else(malformed)?;
                let to = request.counterparty_account.clone().ok_or_else(malformed)?;
                let recipient = self
                    .accounts
                    .get(&to)
                    .map(|acc| acc.owner.clone())
                    .ok_or_else(|| Refusal::UnknownAccount(to.clone()))?;
                self.debit(&from, request.amount)?;

                let outgoing = self.attest(
                    identity,
                    LedgerItem {
                        account: Some(from.clone()),
                        counterparty: Some(recipient.clone()),
                        counterparty_account: Some(to.clone()),
                        ..LedgerItem::new(number, ItemKind::Transfer, request.amount)
                    },
                );
                let incoming = self.attest(
                    identity,
                    LedgerItem {
                        account: Some(to.clone()),
                        counterparty: Some(identity.clone()),
                        counterparty_account: Some(from.clone()),
                        ..LedgerItem::new(number, ItemKind::Transfer, request.amount)
                    },
                );
                self.outbox_mut(identity, &from).insert(outgoing.clone());
                self.inbox_mut(&recipient, &to).insert(incoming);
                Ok(ReplyPayload::Receipt(outgoing))
            }
            CommandType::Deposit => {
                let account = self.owned(request)?.clone();
                self.credit(&account, request.amount)?;
                Ok(ReplyPayload::Receipt(self.item_receipt(request, &account)?))
            }
            CommandType::DepositCheque => {
                let account = self.owned(request)?.clone();
                let Payload::Cheque {
                    cheque_number,
                    drawer,
                    drawer_account,
                } = &request.payload
                else {
                    return Err(malformed());
                };
                if self.accounts.get(drawer_account).map(|acc| &acc.owner) != Some(drawer) {
                    return Err(Refusal::NotOwner {
                        identity: drawer.clone(),
                        account: drawer_account.clone(),
                    });
                }
                self.debit(drawer_account, request.amount)?;
                self.credit(&account, request.amount)?;
                let cleared = self.sign_item(LedgerItem {
                    account: Some(drawer_account.clone()),
                    counterparty: Some(identity.clone()),
                    counterparty_account: Some(account.clone()),
                    ..LedgerItem::new(*cheque_number, ItemKind::ChequeReceipt, request.amount)
                });
                self.inbox_mut(drawer, drawer_account).insert(cleared);
                Ok(ReplyPayload::Receipt(self.item_receipt(request, &account)?))
            }
            CommandType::Withdrawal => {
                let account = self.owned(request)?.clone();
                let Payload::Withdrawal { blinded } = &request.payload else {
                    return Err(malformed());
                };
                self.debit(&account, request.amount)?;
                let tokens = self.crypto.sign(blinded).as_bytes().to_vec();
                Ok(ReplyPayload::Withdrawal {
                    receipt: self.item_receipt(request, &account)?,
                    tokens,
                })
            }
            CommandType::PayDividend => {
                let payer = self.owned(request)?.clone();
                let Payload::Dividend {
                    share_unit,
                    per_share,
                } = &request.payload
                else {
                    return Err(malformed());
                };
                let number = *request.numbers.first().ok_or_else(malformed)?;
                let per_share = *per_share;
                let payouts = self.dividend_payouts(&payer, share_unit, per_share);
                let total: Decimal = payouts.iter().map(|p| p.shares * per_share).sum();
                self.debit(&payer, total)?;
                for payout in &payouts {
                    self.credit(&payout.account, payout.shares * per_share)?;
                }
                let receipt = self.sign_item(LedgerItem {
                    account: Some(payer),
                    ..LedgerItem::new(number, ItemKind::ItemReceipt, total)
                });
                Ok(ReplyPayload::Dividend { receipt, payouts })
            }
            CommandType::PaymentPlan | CommandType::MarketOffer | CommandType::SmartContract => {
                let account = self.owned(request)?.clone();
                let Payload::Cron { terms } = &request.payload else {
                    return Err(malformed());
                };
                let opening = *request.numbers.first().ok_or_else(malformed)?;
                let receipt = self.sign_item(LedgerItem {
                    account: Some(account.clone()),
                    numbers: request.numbers.clone(),
                    memo: terms.clone(),
                    ..LedgerItem::new(opening, ItemKind::ItemReceipt, request.amount)
                });
                let trigger = terms.contains("trigger").then(|| {
                    let number = self.issue_number();
                    self.sign_item(LedgerItem {
                        account: Some(account),
                        numbers: vec![opening],
                        memo: terms.clone(),
                        ..LedgerItem::new(number, ItemKind::Notice, Decimal::ZERO)
                    })
                });
                Ok(ReplyPayload::Cron { receipt, trigger })
            }
            CommandType::TriggerClause => {
                let Payload::Clause { contract, clause } = &request.payload else {
                    return Err(malformed());
                };
                let number = self.issue_number();
                Ok(ReplyPayload::Receipt(self.sign_item(LedgerItem {
                    numbers: vec![*contract],
                    memo: clause.clone(),
                    ..LedgerItem::new(number, ItemKind::Notice, Decimal::ZERO)
                })))
            }
        }
    }

    fn issue_number(&mut self) -> TransactionNumber {
        self.next_number += 1;
        self.next_number
    }

    fn owned<'a>(&self, request: &'a Request) -> Result<&'a AccountId, Refusal> {
        let account = request
            .account
            .as_ref()
            .ok_or(Refusal::Malformed(request.command))?;
        match self.accounts.get(account) {
            None => Err(Refusal::UnknownAccount(account.clone())),
            Some(acc) if acc.owner != request.identity => Err(Refusal::NotOwner {
                identity: request.identity.clone(),
                account: account.clone(),
            }),
            Some(_) => Ok(account),
        }
    }

    fn credit(&mut self, account: &AccountId, amount: Decimal) -> Result<(), Refusal> {
        let acc = self
            .accounts
            .get_mut(account)
            .ok_or_else(|| Refusal::UnknownAccount(account.clone()))?;
        acc.balance += amount;
        Ok(())
    }

    fn debit(&mut self, account: &AccountId, amount: Decimal) -> Result<(), Refusal> {
        let acc = self
            .accounts
            .get_mut(account)
            .ok_or_else(|| Refusal::UnknownAccount(account.clone()))?;
        if !acc.issuer && acc.balance < amount {
            return Err(Refusal::InsufficientFunds(account.clone()));
        }
        acc.balance -= amount;
        Ok(())
    }

    fn item_receipt(&self, request: &Request, account: &AccountId) -> Result<LedgerItem, Refusal> {
        let number = *request
            .numbers
            .first()
            .ok_or(Refusal::Malformed(request.command))?;
        Ok(self.sign_item(LedgerItem {
            account: Some(account.clone()),
            ..LedgerItem::new(number, ItemKind::ItemReceipt, request.amount)
        }))
    }

    /// Shareholders of `share_unit` are paid into one of their accounts in
    /// the payer's unit. Holders without such an account are skipped.
    fn dividend_payouts(
        &mut self,
        payer: &AccountId,
        share_unit: &UnitId,
        per_share: Decimal,
    ) -> Vec<DividendPayout> {
        let Some(payout_unit) = self.accounts.get(payer).map(|acc| acc.unit.clone()) else {
            return Vec::new();
        };
        let holdings: Vec<(IdentityId, Decimal)> = self
            .accounts
            .values()
            .filter(|acc| &acc.unit == share_unit && !acc.issuer && acc.balance > Decimal::ZERO)
            .map(|acc| (acc.owner.clone(), acc.balance))
            .collect();
        let mut payouts = Vec::new();
        for (owner, shares) in holdings {
            let target = self
                .accounts
                .iter()
                .find(|(id, acc)| acc.owner == owner && acc.unit == payout_unit && *id != payer)
                .map(|(id, _)| id.clone());
            if let Some(account) = target {
                debug!(%account, %shares, %per_share, "dividend payout");
                payouts.push(DividendPayout {
                    account,
                    shares,
                    voucher: self.issue_number(),
                });
            }
        }
        payouts
    }

    fn attest(&self, sender: &IdentityId, mut item: LedgerItem) -> LedgerItem {
        if let Some(crypto) = self.identities.get(sender) {
            item.originator = Some(Originator {
                identity: sender.clone(),
                key: crypto.public_key(),
                signature: crypto.sign(&item.body_bytes()),
            });
        }
        self.sign_item(item)
    }

    /// Tells the sender of an accepted transfer that it went through.
    fn notify_sender(&mut self, transfer: &LedgerItem) {
        let (Some(sender), Some(from)) = (&transfer.counterparty, &transfer.counterparty_account)
        else {
            return;
        };
        let number = self.issue_number();
        let receipt = self.sign_item(LedgerItem {
            account: Some(from.clone()),
            counterparty_account: transfer.account.clone(),
            numbers: vec![transfer.number],
            ..LedgerItem::new(number, ItemKind::TransferReceipt, transfer.amount)
        });
        if let Some(outbox) = self.outboxes.get_mut(from) {
            outbox.remove(transfer.number);
        }
        self.inbox_mut(sender, from).insert(receipt);
    }

    fn nymbox_mut(&mut self, identity: &IdentityId) -> &mut Ledger {
        self.nymboxes
            .entry(identity.clone())
            .or_insert_with(|| Ledger::nymbox(identity.clone()))
    }

    fn inbox_mut(&mut self, owner: &IdentityId, account: &AccountId) -> &mut Ledger {
        self.inboxes
            .entry(account.clone())
            .or_insert_with(|| Ledger::inbox(owner.clone(), account.clone()))
    }

    fn outbox_mut(&mut self, owner: &IdentityId, account: &AccountId) -> &mut Ledger {
        self.outboxes
            .entry(account.clone())
            .or_insert_with(|| Ledger::outbox(owner.clone(), account.clone()))
    }
}

fn take_items(
    ledger: &mut Ledger,
    accept: &[TransactionNumber],
    reject: &[TransactionNumber],
) -> Result<(Vec<LedgerItem>, Vec<TransactionNumber>), Refusal> {
    if let Some(missing) = accept.iter().chain(reject).find(|n| !ledger.contains(**n)) {
        return Err(Refusal::MissingItem(*missing));
    }
    let accepted = accept.iter().filter_map(|n| ledger.remove(*n)).collect();
    for number in reject {
        ledger.remove(*number);
    }
    Ok((accepted, reject.to_vec()))
}

/// [`Transport`] that answers every request on the spot and keeps the
/// replies until [`LoopbackTransport::take_replies`] collects them.
pub struct LoopbackTransport<'n> {
    notary: &'n Mutex<LoopbackNotary>,
    replies: Mutex<Vec<Reply>>,
}

impl<'n> LoopbackTransport<'n> {
    pub fn new(notary: &'n Mutex<LoopbackNotary>) -> Self {
        Self {
            notary,
            replies: Mutex::default(),
        }
    }

    pub fn take_replies(&self) -> Vec<Reply> {
        std::mem::take(&mut *self.replies.lock())
    }
}

impl Transport for LoopbackTransport<'_> {
    fn send(&self, request: &Request) -> Result<(), TransportError> {
        let reply = self.notary.lock().handle(request);
        self.replies.lock().push(reply);
        Ok(())
    }
}
