use std::collections::BTreeMap;

use thiserror::Error;

use crate::common::{Digest, DigestBuilder, Hashable};

pub type AccountId = u64;
pub type Balance = i64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("unknown account {0}")]
    UnknownAccount(AccountId),

    #[error("invalid amount {0}")]
    InvalidAmount(Balance),

    #[error("insufficient funds in account {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account: AccountId,
        balance: Balance,
        requested: Balance,
    },
}

/// Account table of one replica. Only the replica's execution path mutates
/// it, and that path already runs under the replica's state lock.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    accounts: BTreeMap<AccountId, Balance>,
    next_id: AccountId,
}

impl Ledger {
    pub fn new() -> Self {
        Ledger {
            accounts: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Ledger with accounts `1..=count` each holding `balance`.
    pub fn seeded(count: u32, balance: Balance) -> Self {
        let mut ledger = Ledger::new();
        for _ in 0..count {
            let id = ledger.create_account();
            ledger.accounts.insert(id, balance.max(0));
        }
        ledger
    }

    pub fn create_account(&mut self) -> AccountId {
        let id = self.next_id;
        self.next_id += 1;
        self.accounts.insert(id, 0);
        id
    }

    pub fn deposit(&mut self, id: AccountId, amount: Balance) -> Result<(), LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let current = *self.accounts.get(&id).ok_or(LedgerError::UnknownAccount(id))?;
        let updated = current
            .checked_add(amount)
            .ok_or(LedgerError::InvalidAmount(amount))?;
        // The ledger total must stay representable too.
        if self.checked_total().and_then(|total| total.checked_add(amount)).is_none() {
            return Err(LedgerError::InvalidAmount(amount));
        }
        self.accounts.insert(id, updated);
        Ok(())
    }

    pub fn transfer(
        &mut self,
        from: AccountId,
        to: AccountId,
        amount: Balance,
    ) -> Result<(), LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let source = *self
            .accounts
            .get(&from)
            .ok_or(LedgerError::UnknownAccount(from))?;
        let target = *self.accounts.get(&to).ok_or(LedgerError::UnknownAccount(to))?;
        if source < amount {
            return Err(LedgerError::InsufficientFunds {
                account: from,
                balance: source,
                requested: amount,
            });
        }
        if from == to {
            return Ok(());
        }
        let credited = target
            .checked_add(amount)
            .ok_or(LedgerError::InvalidAmount(amount))?;

        self.accounts.insert(from, source - amount);
        self.accounts.insert(to, credited);
        Ok(())
    }

    pub fn balance(&self, id: AccountId) -> Option<Balance> {
        self.accounts.get(&id).copied()
    }

    /// Sum of all balances, saturating at `Balance::MAX`. Deposits that
    /// would push the sum past that are rejected, so only an oversized seed
    /// can saturate it.
    pub fn total_balance(&self) -> Balance {
        self.accounts
            .values()
            .fold(0, |total: Balance, balance| total.saturating_add(*balance))
    }

    fn checked_total(&self) -> Option<Balance> {
        self.accounts
            .values()
            .try_fold(0, |total: Balance, balance| total.checked_add(*balance))
    }
}

impl Hashable for Ledger {
    fn hash(&self) -> Digest {
        let mut builder = DigestBuilder::new();
        builder.update_u64(self.next_id);
        for (id, balance) in &self.accounts {
            builder.update_u64(*id).update_i64(*balance);
        }
        builder.finish()
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    #[test]
    fn test_create_account_ids_are_fresh() {
        let mut ledger = Ledger::seeded(3, 1000);
        assert_eq!(ledger.create_account(), 4);
        assert_eq!(ledger.create_account(), 5);
        assert_eq!(ledger.balance(4), Some(0));
        assert_eq!(ledger.total_balance(), 3000);
    }

    #[test]
    fn test_deposit() {
        let mut ledger = Ledger::seeded(2, 1000);
        ledger.deposit(1, 250).unwrap();
        assert_eq!(ledger.balance(1), Some(1250));
        assert_eq!(ledger.deposit(9, 10), Err(LedgerError::UnknownAccount(9)));
        assert_eq!(ledger.deposit(1, -5), Err(LedgerError::InvalidAmount(-5)));
        assert_eq!(ledger.total_balance(), 2250);
    }

    #[test]
    fn test_transfer_insufficient_funds_leaves_state_untouched() {
        let mut ledger = Ledger::seeded(2, 100);
        let before = ledger.hash();

        let result = ledger.transfer(1, 2, 101);
        assert!(matches!(result, Err(LedgerError::InsufficientFunds { account: 1, .. })));
        assert_eq!(ledger.hash(), before);
    }

    #[test]
    fn test_transfer_unknown_target_leaves_state_untouched() {
        let mut ledger = Ledger::seeded(2, 100);
        assert_eq!(ledger.transfer(1, 3, 10), Err(LedgerError::UnknownAccount(3)));
        assert_eq!(ledger.transfer(3, 1, 10), Err(LedgerError::UnknownAccount(3)));
        assert_eq!(ledger.balance(1), Some(100));
    }

    #[test]
    fn test_overflowing_amounts_are_rejected() {
        let mut ledger = Ledger::seeded(2, 100);
        let before = ledger.hash();

        assert_eq!(
            ledger.deposit(1, Balance::MAX),
            Err(LedgerError::InvalidAmount(Balance::MAX))
        );
        assert_eq!(ledger.hash(), before);

        // Fits the account but not the ledger total.
        let mut ledger = Ledger::seeded(2, 0);
        ledger.deposit(1, Balance::MAX - 10).unwrap();
        assert_eq!(ledger.deposit(2, 11), Err(LedgerError::InvalidAmount(11)));
        assert_eq!(ledger.balance(2), Some(0));
        assert_eq!(ledger.total_balance(), Balance::MAX - 10);
    }

    #[test]
    fn test_transfer_credit_overflow_is_rejected() {
        // Only reachable when the seed itself is already at the limit.
        let mut ledger = Ledger::seeded(2, Balance::MAX);
        let before = ledger.hash();

        assert_eq!(ledger.transfer(1, 2, 1), Err(LedgerError::InvalidAmount(1)));
        assert_eq!(ledger.hash(), before);
        assert_eq!(ledger.total_balance(), Balance::MAX);
    }

    #[test]
    fn test_self_transfer_keeps_balance() {
        let mut ledger = Ledger::seeded(1, 100);
        ledger.transfer(1, 1, 60).unwrap();
        assert_eq!(ledger.balance(1), Some(100));
        assert!(matches!(ledger.transfer(1, 1, 101), Err(LedgerError::InsufficientFunds { .. })));
    }

    #[test]
    fn test_random_operations_preserve_invariants() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut ledger = Ledger::seeded(20, 1000);
        let mut expected_total = ledger.total_balance();

        for _ in 0..5_000 {
            let a = rng.gen_range(1..=22);
            let b = rng.gen_range(1..=22);
            let amount = rng.gen_range(-50..400);
            if rng.gen_bool(0.2) {
                if ledger.deposit(a, amount).is_ok() {
                    expected_total += amount;
                }
            } else {
                let _ = ledger.transfer(a, b, amount);
            }

            assert_eq!(ledger.total_balance(), expected_total);
            assert!((1..=20).all(|id| ledger.balance(id).unwrap() >= 0));
        }
    }
}
