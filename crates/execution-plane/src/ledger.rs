//! User balance ledger with available/liability accounting.
//!
//! `available` is a user's total on-platform balance; `liabilities` is the
//! slice of it reserved by resting orders. Reservations and withdrawals spend
//! from `available - liabilities`; fills consume both sides at once. Only the
//! executor mutates this structure.

use common_types::{Address, Amount, Asset, UserAccount, UserBalance};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("insufficient available balance: have {spendable}, need {needed}")]
    InsufficientAvailable { spendable: Amount, needed: Amount },
    /// Liabilities would go negative. This is an internal miscount, never a
    /// user error, and the executor halts on it.
    #[error("liability underflow: have {liabilities}, tried to remove {amount}")]
    LiabilityUnderflow { liabilities: Amount, amount: Amount },
    /// Available would go negative while consuming a reservation; same fatal
    /// class as a liability underflow.
    #[error("available underflow: have {available}, tried to remove {amount}")]
    AvailableUnderflow { available: Amount, amount: Amount },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    accounts: HashMap<Address, UserAccount>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    fn balance_mut(&mut self, user: Address, asset: Asset) -> &mut UserBalance {
        self.accounts.entry(user).or_default().balance_mut(asset)
    }

    /// Add funds to `available`. Used for deposits and trade proceeds.
    pub fn credit(&mut self, user: Address, asset: Asset, amount: Amount) {
        self.balance_mut(user, asset).available += amount;
    }

    /// Lock funds against a new resting order or taker leg.
    pub fn reserve(&mut self, user: Address, asset: Asset, amount: Amount) -> Result<(), LedgerError> {
        let balance = self.balance_mut(user, asset);
        let spendable = balance.available.saturating_sub(balance.liabilities);
        if amount > spendable {
            return Err(LedgerError::InsufficientAvailable { spendable, needed: amount });
        }
        balance.liabilities += amount;
        Ok(())
    }

    /// Unlock reserved funds after a cancellation or rounding release.
    pub fn release(&mut self, user: Address, asset: Asset, amount: Amount) -> Result<(), LedgerError> {
        let balance = self.balance_mut(user, asset);
        balance.liabilities = balance.liabilities.checked_sub(amount).ok_or(
            LedgerError::LiabilityUnderflow { liabilities: balance.liabilities, amount },
        )?;
        Ok(())
    }

    /// Spend reserved funds on a fill: the amount leaves both `available`
    /// and `liabilities` because it is transferred to the counterparty.
    pub fn consume(&mut self, user: Address, asset: Asset, amount: Amount) -> Result<(), LedgerError> {
        let balance = self.balance_mut(user, asset);
        let available = balance.available.checked_sub(amount).ok_or(
            LedgerError::AvailableUnderflow { available: balance.available, amount },
        )?;
        let liabilities = balance.liabilities.checked_sub(amount).ok_or(
            LedgerError::LiabilityUnderflow { liabilities: balance.liabilities, amount },
        )?;
        balance.available = available;
        balance.liabilities = liabilities;
        Ok(())
    }

    /// Spend unreserved funds on a withdrawal.
    pub fn debit(&mut self, user: Address, asset: Asset, amount: Amount) -> Result<(), LedgerError> {
        let balance = self.balance_mut(user, asset);
        let spendable = balance.available.saturating_sub(balance.liabilities);
        if amount > spendable {
            return Err(LedgerError::InsufficientAvailable { spendable, needed: amount });
        }
        balance.available -= amount;
        Ok(())
    }

    pub fn balance(&self, user: &Address, asset: Asset) -> UserBalance {
        self.accounts
            .get(user)
            .map(|account| *account.balance(asset))
            .unwrap_or_default()
    }

    pub fn available(&self, user: &Address, asset: Asset) -> Amount {
        self.balance(user, asset).available
    }

    pub fn liabilities(&self, user: &Address, asset: Asset) -> Amount {
        self.balance(user, asset).liabilities
    }

    /// Accounts sorted by address, for snapshots that compare bytewise.
    pub fn snapshot_accounts(&self) -> Vec<(Address, UserAccount)> {
        let mut accounts: Vec<(Address, UserAccount)> =
            self.accounts.iter().map(|(user, account)| (*user, *account)).collect();
        accounts.sort_by_key(|(user, _)| *user);
        accounts
    }

    /// True when every balance satisfies
    /// `liabilities <= available + pending_deposits`.
    pub fn invariant_holds(&self) -> bool {
        self.accounts.values().all(|account| {
            [Asset::A, Asset::B].into_iter().all(|asset| {
                let b = account.balance(asset);
                b.liabilities <= b.available + b.pending_deposits
            })
        })
    }
}
