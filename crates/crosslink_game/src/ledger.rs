//! # Ledger
//!
//! Player gold balances. Integer gold only; no fractional currency.

use std::collections::HashMap;

use crosslink_core::Rollback;

use crate::error::{GameError, GameResult};
use crate::events::PlayerId;

/// Gold per player.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ledger {
    balances: HashMap<PlayerId, u64>,
}

impl Ledger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Balance of `player` (0 if unknown).
    #[must_use]
    pub fn balance(&self, player: PlayerId) -> u64 {
        self.balances.get(&player).copied().unwrap_or(0)
    }

    /// Sum of all balances.
    #[must_use]
    pub fn total_supply(&self) -> u64 {
        self.balances.values().sum()
    }

    /// Adds gold. Returns the new balance.
    ///
    /// # Errors
    ///
    /// `ArithmeticOverflow` if the balance would exceed `u64::MAX`.
    pub fn credit(&mut self, player: PlayerId, amount: u64) -> GameResult<u64> {
        let balance = self.balances.entry(player).or_insert(0);
        *balance = balance.checked_add(amount).ok_or(GameError::ArithmeticOverflow)?;
        Ok(*balance)
    }

    /// Removes gold. Returns the new balance.
    ///
    /// # Errors
    ///
    /// `InsufficientFunds`; the balance is unchanged.
    pub fn debit(&mut self, player: PlayerId, amount: u64) -> GameResult<u64> {
        let available = self.balance(player);
        let remaining = available
            .checked_sub(amount)
            .ok_or(GameError::InsufficientFunds {
                player,
                required: amount,
                available,
            })?;
        self.balances.insert(player, remaining);
        Ok(remaining)
    }

    /// Moves gold from `from` to `to`. Returns the payer's new balance.
    ///
    /// # Errors
    ///
    /// `InsufficientFunds` or `ArithmeticOverflow`. The debit may already be
    /// applied when the credit overflows; run it inside a transaction.
    pub fn transfer(&mut self, from: PlayerId, to: PlayerId, amount: u64) -> GameResult<u64> {
        let remaining = self.debit(from, amount)?;
        self.credit(to, amount)?;
        Ok(remaining)
    }
}

impl Rollback for Ledger {
    type Snapshot = HashMap<PlayerId, u64>;

    fn snapshot(&self) -> Self::Snapshot {
        self.balances.clone()
    }

    fn restore(&mut self, snapshot: Self::Snapshot) {
        self.balances = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credit_and_debit() {
        let mut ledger = Ledger::new();
        assert_eq!(ledger.credit(1, 100), Ok(100));
        assert_eq!(ledger.debit(1, 30), Ok(70));
        assert_eq!(ledger.balance(1), 70);
    }

    #[test]
    fn test_overdraw_rejected() {
        let mut ledger = Ledger::new();
        ledger.credit(1, 10).unwrap();
        assert_eq!(
            ledger.debit(1, 11),
            Err(GameError::InsufficientFunds {
                player: 1,
                required: 11,
                available: 10
            })
        );
        assert_eq!(ledger.balance(1), 10);
    }

    #[test]
    fn test_transfer_overflow_leaves_debit_applied() {
        let mut ledger = Ledger::new();
        ledger.credit(1, 10).unwrap();
        ledger.credit(2, u64::MAX).unwrap();
        let checkpoint = ledger.snapshot();

        assert_eq!(ledger.transfer(1, 2, 5), Err(GameError::ArithmeticOverflow));
        assert_eq!(ledger.balance(1), 5);

        ledger.restore(checkpoint);
        assert_eq!(ledger.balance(1), 10);
    }

    #[test]
    fn test_transfer_conserves_supply() {
        let mut ledger = Ledger::new();
        ledger.credit(1, 50).unwrap();
        ledger.transfer(1, 2, 20).unwrap();
        assert_eq!(ledger.total_supply(), 50);
        assert_eq!(ledger.balance(2), 20);
    }
}
