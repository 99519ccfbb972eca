//! Single owner of every [`Account`] this client holds.
//!
//! Other components never keep account references: they borrow an account
//! for the duration of one closure via [`Wallet::with_account`], or apply a
//! batch of balance commands atomically via [`Wallet::apply_batch`].

use std::{
    collections::{BTreeMap, HashMap, hash_map::Entry},
    sync::Arc,
};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    account::{Account, AccountError, BalanceCommand},
    identifier::{AccountId, IdentityId, RequestNumber, ServerId},
    storage::Storage,
};

const PENDING_WITHDRAWAL_KEY: &str = "wallet/pending-withdrawal";

fn account_key(id: &AccountId) -> String {
    format!("account/{id}")
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("There's no account `{account}` in the wallet or in storage")]
    UnknownAccount { account: AccountId },
    #[error("Account `{account}` belongs to notary `{actual}`, not `{expected}`")]
    WrongServer {
        account: AccountId,
        expected: ServerId,
        actual: ServerId,
    },
    #[error("Identity `{identity}` is not the owner of account `{account}`")]
    WrongOwner {
        account: AccountId,
        identity: IdentityId,
    },
    #[error("Stored account `{account}` is unreadable: {reason}")]
    Corrupt { account: AccountId, reason: String },
    #[error("Account `{account}`: {source}")]
    Account {
        account: AccountId,
        #[source]
        source: AccountError,
    },
    #[error("A withdrawal for request {request_number} is already pending")]
    WithdrawalPending { request_number: RequestNumber },
    #[error("Failed to persist `{key}`")]
    Persist { key: String },
}

/// Blinding state kept while a withdrawal reply is outstanding. Losing it
/// makes the withdrawn tokens impossible to unblind.
///
/// Request numbers restart in every context, so the slot is owned by one
/// (identity, notary) pair and only that context's requests can touch it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWithdrawal {
    pub identity: IdentityId,
    pub server: ServerId,
    pub request_number: RequestNumber,
    pub account: AccountId,
    pub amount: Decimal,
    pub blinding: Vec<u8>,
}

impl PendingWithdrawal {
    pub fn belongs_to(&self, identity: &IdentityId, server: &ServerId) -> bool {
        self.identity == *identity && self.server == *server
    }

    pub fn answers(
        &self,
        identity: &IdentityId,
        server: &ServerId,
        request_number: RequestNumber,
    ) -> bool {
        self.belongs_to(identity, server) && self.request_number == request_number
    }
}

pub struct Wallet {
    storage: Arc<Storage>,
    accounts: Mutex<HashMap<AccountId, Account>>,
    pending_withdrawal: Mutex<Option<PendingWithdrawal>>,
    extra_keys: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl Wallet {
    pub fn new(storage: Arc<Storage>) -> Self {
        let pending_withdrawal = storage
            .load(PENDING_WITHDRAWAL_KEY)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());
        Self {
            storage,
            accounts: Mutex::default(),
            pending_withdrawal: Mutex::new(pending_withdrawal),
            extra_keys: Mutex::default(),
        }
    }

    pub fn add_account(&self, account: Account) -> Result<(), WalletError> {
        self.persist(&account)?;
        self.accounts.lock().insert(account.id().clone(), account);
        Ok(())
    }

    pub fn remove_account(&self, id: &AccountId) -> bool {
        let removed = self.accounts.lock().remove(id).is_some();
        // an empty value reads back as not found
        self.storage.store(&account_key(id), b"");
        removed
    }

    /// Returns a snapshot of the account, loading and verifying it from
    /// storage when it is not in memory yet.
    pub fn get_or_load_account(
        &self,
        identity: &IdentityId,
        account: &AccountId,
        server: &ServerId,
    ) -> Result<Account, WalletError> {
        self.with_account(identity, account, server, |acc| acc.clone())
    }

    /// Runs `f` against the account for the duration of one call and
    /// persists the account afterwards.
    pub fn with_account<R>(
        &self,
        identity: &IdentityId,
        account: &AccountId,
        server: &ServerId,
        f: impl FnOnce(&mut Account) -> R,
    ) -> Result<R, WalletError> {
        let mut accounts = self.accounts.lock();
        let acc = self.get_or_load(&mut accounts, identity, account, server)?;
        let result = f(acc);
        self.persist(acc)?;
        Ok(result)
    }

    /// Applies every command or none of them. Returns how many commands
    /// changed a balance (already applied receipts are skipped).
    pub fn apply_batch(
        &self,
        identity: &IdentityId,
        server: &ServerId,
        commands: &[(AccountId, BalanceCommand)],
    ) -> Result<usize, WalletError> {
        let mut accounts = self.accounts.lock();
        let mut staged: BTreeMap<AccountId, Account> = BTreeMap::new();
        let mut applied = 0;

        for (account, command) in commands {
            if !staged.contains_key(account) {
                let acc = self.get_or_load(&mut accounts, identity, account, server)?;
                staged.insert(account.clone(), acc.clone());
            }
            let Some(acc) = staged.get_mut(account) else {
                continue;
            };
            let event = acc
                .handle_balance_command(command)
                .map_err(|source| WalletError::Account {
                    account: account.clone(),
                    source,
                })?;
            if let Some(event) = event {
                acc.apply(&event);
                applied += 1;
            }
        }

        for (id, acc) in staged {
            self.persist(&acc)?;
            accounts.insert(id, acc);
        }
        Ok(applied)
    }

    pub fn accounts(&self) -> Vec<Account> {
        let mut list: Vec<_> = self.accounts.lock().values().cloned().collect();
        list.sort_by(|a, b| a.id().cmp(b.id()));
        list
    }

    fn get_or_load<'a>(
        &self,
        accounts: &'a mut HashMap<AccountId, Account>,
        identity: &IdentityId,
        account: &AccountId,
        server: &ServerId,
    ) -> Result<&'a mut Account, WalletError> {
        let acc = match accounts.entry(account.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                debug!(%account, "account not in wallet, loading it from storage");
                entry.insert(self.load_account(account)?)
            }
        };
        verify_account(acc, identity, server)?;
        Ok(acc)
    }

    fn load_account(&self, account: &AccountId) -> Result<Account, WalletError> {
        let bytes = self
            .storage
            .load(&account_key(account))
            .map_err(|_| WalletError::UnknownAccount {
                account: account.clone(),
            })?;
        serde_json::from_slice(&bytes).map_err(|err| WalletError::Corrupt {
            account: account.clone(),
            reason: err.to_string(),
        })
    }

    fn persist(&self, account: &Account) -> Result<(), WalletError> {
        let key = account_key(account.id());
        let stored = serde_json::to_vec(account)
            .map(|bytes| self.storage.store(&key, &bytes))
            .unwrap_or(false);
        if stored {
            Ok(())
        } else {
            Err(WalletError::Persist { key })
        }
    }

    pub fn pending_withdrawal(&self) -> Option<PendingWithdrawal> {
        self.pending_withdrawal.lock().clone()
    }

    /// Occupies the single withdrawal slot and saves it right away.
    pub fn set_pending_withdrawal(&self, withdrawal: PendingWithdrawal) -> Result<(), WalletError> {
        let mut slot = self.pending_withdrawal.lock();
        if let Some(existing) = slot.as_ref() {
            return Err(WalletError::WithdrawalPending {
                request_number: existing.request_number,
            });
        }
        let bytes = serde_json::to_vec(&withdrawal).map_err(|_| WalletError::Persist {
            key: PENDING_WITHDRAWAL_KEY.to_owned(),
        })?;
        if !self.storage.store(PENDING_WITHDRAWAL_KEY, &bytes) {
            return Err(WalletError::Persist {
                key: PENDING_WITHDRAWAL_KEY.to_owned(),
            });
        }
        *slot = Some(withdrawal);
        Ok(())
    }

    /// Clears the slot if it was set by `request_number` of the given
    /// identity at the given notary.
    pub fn take_pending_withdrawal(
        &self,
        identity: &IdentityId,
        server: &ServerId,
        request_number: RequestNumber,
    ) -> Option<PendingWithdrawal> {
        let mut slot = self.pending_withdrawal.lock();
        if !slot.as_ref()?.answers(identity, server, request_number) {
            return None;
        }
        self.storage.store(PENDING_WITHDRAWAL_KEY, b"");
        slot.take()
    }

    pub fn add_extra_key(&self, id: impl Into<String>, sealed: Vec<u8>) {
        self.extra_keys.lock().insert(id.into(), sealed);
    }

    pub fn extra_key(&self, id: &str) -> Option<Vec<u8>> {
        self.extra_keys.lock().get(id).cloned()
    }

    /// Re-seals every extra key after a master passphrase change. The key
    /// map is replaced only when every key was rewrapped.
    pub fn change_passphrase_on_extra_keys(
        &self,
        rewrap: impl Fn(&str, &[u8]) -> Option<Vec<u8>>,
    ) -> bool {
        let mut keys = self.extra_keys.lock();
        let mut changed = BTreeMap::new();
        for (id, sealed) in keys.iter() {
            let Some(resealed) = rewrap(id, sealed) else {
                warn!(key_id = %id, "failed to rewrap extra key, keeping old keys");
                return false;
            };
            changed.insert(id.clone(), resealed);
        }
        info!(count = changed.len(), "rewrapped extra keys");
        *keys = changed;
        true
    }
}

fn verify_account(
    account: &Account,
    identity: &IdentityId,
    server: &ServerId,
) -> Result<(), WalletError> {
    if account.server() != server {
        return Err(WalletError::WrongServer {
            account: account.id().clone(),
            expected: server.clone(),
            actual: account.server().clone(),
        });
    }
    if account.owner() != identity {
        return Err(WalletError::WrongOwner {
            account: account.id().clone(),
            identity: identity.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::account::{AccountKind, BalanceAction};

    use super::*;

    fn wallet() -> (Arc<Storage>, Wallet) {
        let storage = Arc::new(Storage::in_memory());
        (storage.clone(), Wallet::new(storage))
    }

    fn account(id: &str) -> Account {
        Account::new(
            id.into(),
            "alice".into(),
            "notary".into(),
            "usd".into(),
            AccountKind::Simple,
        )
    }

    fn credit(receipt: u64, amount: i64) -> BalanceCommand {
        BalanceCommand {
            receipt,
            action: BalanceAction::Credit,
            amount: Decimal::from(amount),
        }
    }

    #[test]
    fn loads_and_verifies_from_storage() {
        let (storage, w) = wallet();
        w.add_account(account("a1")).unwrap();

        let fresh = Wallet::new(storage);
        let acc = fresh
            .get_or_load_account(&"alice".into(), &"a1".into(), &"notary".into())
            .unwrap();
        assert_eq!(acc.id().as_str(), "a1");

        let err = fresh
            .get_or_load_account(&"bob".into(), &"a1".into(), &"notary".into())
            .unwrap_err();
        assert!(matches!(err, WalletError::WrongOwner { .. }));
        let err = fresh
            .get_or_load_account(&"alice".into(), &"a1".into(), &"other".into())
            .unwrap_err();
        assert!(matches!(err, WalletError::WrongServer { .. }));
        let err = fresh
            .get_or_load_account(&"alice".into(), &"nope".into(), &"notary".into())
            .unwrap_err();
        assert!(matches!(err, WalletError::UnknownAccount { .. }));
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let (_, w) = wallet();
        w.add_account(account("a1")).unwrap();
        w.add_account(account("a2")).unwrap();
        let alice = IdentityId::from("alice");
        let notary = ServerId::from("notary");

        let bad = [
            ("a1".into(), credit(1, 10)),
            (
                "a2".into(),
                BalanceCommand {
                    receipt: 1,
                    action: BalanceAction::Debit,
                    amount: Decimal::from(5),
                },
            ),
        ];
        assert!(w.apply_batch(&alice, &notary, &bad).is_err());
        assert!(w.accounts().iter().all(|a| a.balance().is_zero()));

        let good = [("a1".into(), credit(1, 10)), ("a2".into(), credit(1, 5))];
        assert_eq!(w.apply_batch(&alice, &notary, &good).unwrap(), 2);
        assert_eq!(w.apply_batch(&alice, &notary, &good).unwrap(), 0);
        let balances: Vec<_> = w.accounts().iter().map(|a| a.balance()).collect();
        assert_eq!(balances, vec![Decimal::from(10), Decimal::from(5)]);
    }

    #[test]
    fn single_pending_withdrawal_slot() {
        let (storage, w) = wallet();
        let alice = IdentityId::from("alice");
        let notary = ServerId::from("notary");
        let pending = PendingWithdrawal {
            identity: alice.clone(),
            server: notary.clone(),
            request_number: 3,
            account: "a1".into(),
            amount: Decimal::from(20),
            blinding: vec![1, 2, 3],
        };
        w.set_pending_withdrawal(pending.clone()).unwrap();
        assert!(matches!(
            w.set_pending_withdrawal(pending.clone()),
            Err(WalletError::WithdrawalPending { request_number: 3 })
        ));
        // survives a restart
        assert_eq!(Wallet::new(storage.clone()).pending_withdrawal(), Some(pending.clone()));

        assert_eq!(w.take_pending_withdrawal(&alice, &notary, 4), None);
        // request numbers restart per context
        assert_eq!(w.take_pending_withdrawal(&"bob".into(), &notary, 3), None);
        assert_eq!(w.take_pending_withdrawal(&alice, &"other".into(), 3), None);
        assert!(w.pending_withdrawal().is_some());
        assert_eq!(w.take_pending_withdrawal(&alice, &notary, 3), Some(pending));
        assert_eq!(w.pending_withdrawal(), None);
        assert_eq!(Wallet::new(storage).pending_withdrawal(), None);
    }

    #[test]
    fn passphrase_rotation_swaps_all_or_nothing() {
        let (_, w) = wallet();
        w.add_extra_key("db", vec![1]);
        w.add_extra_key("notes", vec![2]);

        let rotated = w.change_passphrase_on_extra_keys(|id, sealed| {
            (id != "notes").then(|| sealed.iter().map(|b| b + 10).collect())
        });
        assert!(!rotated);
        assert_eq!(w.extra_key("db"), Some(vec![1]));

        assert!(w.change_passphrase_on_extra_keys(|_, sealed| {
            Some(sealed.iter().map(|b| b + 10).collect())
        }));
        assert_eq!(w.extra_key("db"), Some(vec![11]));
        assert_eq!(w.extra_key("notes"), Some(vec![12]));
    }
}
