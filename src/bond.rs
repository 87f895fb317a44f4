//! Trader collateral accounting.
//!
//! [`BondAccount`] holds the arithmetic and its invariant
//! (`0 <= locked <= total`); [`BondLedger`] applies it to a trader row
//! inside the caller's storage transaction and appends an audit event for
//! every movement. The trader row is read inside the transaction, so a lock
//! always checks against the bond left by the previous commit.
use crate::error::ExchangeError;
use crate::store::{Abortable, StoreTx, TxResult};
use crate::trade::TimeStamp;
use crate::trader::Trader;
use chrono::Utc;
use uuid7::uuid7;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BondAccount {
    #[n(0)]
    total: u64,
    #[n(1)]
    locked: u64,
}

impl BondAccount {
    pub fn total(&self) -> u64 {
        self.total
    }
    pub fn locked(&self) -> u64 {
        self.locked
    }
    pub fn available(&self) -> u64 {
        self.total.saturating_sub(self.locked)
    }

    pub fn check(&self) -> Result<(), ExchangeError> {
        if self.locked > self.total {
            return Err(ExchangeError::invariant(format!(
                "bond locked {} exceeds total {}",
                self.locked, self.total
            )));
        }
        Ok(())
    }

    pub fn deposit(&mut self, amount: u64) -> Result<(), ExchangeError> {
        if amount == 0 {
            return Err(ExchangeError::InvalidAmount("deposit of zero".into()));
        }
        self.total = self
            .total
            .checked_add(amount)
            .ok_or_else(|| ExchangeError::InvalidAmount("deposit overflows bond total".into()))?;
        Ok(())
    }

    pub fn withdraw(&mut self, amount: u64) -> Result<(), ExchangeError> {
        if amount == 0 {
            return Err(ExchangeError::InvalidAmount("withdrawal of zero".into()));
        }
        if amount > self.available() {
            return Err(ExchangeError::InsufficientBond {
                available: self.available(),
                required: amount,
            });
        }
        self.total -= amount;
        Ok(())
    }

    pub fn lock(&mut self, amount: u64) -> Result<(), ExchangeError> {
        if amount > self.available() {
            return Err(ExchangeError::InsufficientBond {
                available: self.available(),
                required: amount,
            });
        }
        self.locked += amount;
        Ok(())
    }

    pub fn unlock(&mut self, amount: u64) -> Result<(), ExchangeError> {
        if amount > self.locked {
            return Err(ExchangeError::invariant(format!(
                "unlock of {amount} exceeds locked bond {}",
                self.locked
            )));
        }
        self.locked -= amount;
        Ok(())
    }

    /// Remove collateral permanently: it leaves both the locked and the total balance.
    pub fn forfeit(&mut self, amount: u64) -> Result<(), ExchangeError> {
        if amount > self.locked {
            return Err(ExchangeError::invariant(format!(
                "forfeit of {amount} exceeds locked bond {}",
                self.locked
            )));
        }
        self.locked -= amount;
        self.total -= amount;
        Ok(())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondEventKind {
    #[n(0)]
    Deposit,
    #[n(1)]
    Withdraw,
    #[n(2)]
    Lock,
    #[n(3)]
    Unlock,
    #[n(4)]
    Forfeit,
}

/// Audit record of a single bond movement.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct BondEvent {
    #[n(0)]
    pub id: String, // hex uuid7, time ordered
    #[n(1)]
    pub trader_id: String,
    #[n(2)]
    pub trade_id: Option<String>,
    #[n(3)]
    pub kind: BondEventKind,
    #[n(4)]
    pub amount: u64,
    #[n(5)]
    pub total_after: u64,
    #[n(6)]
    pub locked_after: u64,
    #[n(7)]
    pub at: TimeStamp<Utc>,
}

impl BondEvent {
    pub(crate) fn key(&self) -> Vec<u8> {
        let mut key = format!("{}/", self.trader_id).into_bytes();
        // id is produced by hex::encode so decoding only fails on a corrupted record
        key.extend(hex::decode(&self.id).unwrap_or_default());
        key
    }
}

pub struct BondLedger;

impl BondLedger {
    pub fn lock(tx: &StoreTx<'_>, trader_id: &str, amount: u64, trade_id: &str) -> TxResult<Trader> {
        Self::apply(tx, trader_id, BondEventKind::Lock, amount, Some(trade_id))
    }

    pub fn unlock(tx: &StoreTx<'_>, trader_id: &str, amount: u64, trade_id: &str) -> TxResult<Trader> {
        Self::apply(tx, trader_id, BondEventKind::Unlock, amount, Some(trade_id))
    }

    pub fn forfeit(tx: &StoreTx<'_>, trader_id: &str, amount: u64, trade_id: &str) -> TxResult<Trader> {
        Self::apply(tx, trader_id, BondEventKind::Forfeit, amount, Some(trade_id))
    }

    pub fn deposit(tx: &StoreTx<'_>, trader_id: &str, amount: u64) -> TxResult<Trader> {
        Self::apply(tx, trader_id, BondEventKind::Deposit, amount, None)
    }

    pub fn withdraw(tx: &StoreTx<'_>, trader_id: &str, amount: u64) -> TxResult<Trader> {
        Self::apply(tx, trader_id, BondEventKind::Withdraw, amount, None)
    }

    fn apply(
        tx: &StoreTx<'_>,
        trader_id: &str,
        kind: BondEventKind,
        amount: u64,
        trade_id: Option<&str>,
    ) -> TxResult<Trader> {
        let mut trader = tx.trader(trader_id)?;
        let bond = &mut trader.bond;

        match kind {
            BondEventKind::Deposit => bond.deposit(amount),
            BondEventKind::Withdraw => bond.withdraw(amount),
            BondEventKind::Lock => bond.lock(amount),
            BondEventKind::Unlock => bond.unlock(amount),
            BondEventKind::Forfeit => bond.forfeit(amount),
        }
        .or_abort()?;
        bond.check().or_abort()?;

        let event = BondEvent {
            id: hex::encode(uuid7().as_bytes()),
            trader_id: trader_id.to_string(),
            trade_id: trade_id.map(str::to_string),
            kind,
            amount,
            total_after: bond.total(),
            locked_after: bond.locked(),
            at: TimeStamp::new(),
        };

        tx.put_trader(&trader)?;
        tx.record_bond_event(&event)?;

        Ok(trader)
    }
}

/// Bond that has to be locked for a trade sending `send_amount`, given a
/// collateral ratio in basis points. Rounds up so a trade is never under-collateralised.
pub fn required_bond(send_amount: u64, collateral_ratio_bps: u32) -> Result<u64, ExchangeError> {
    let scaled = u128::from(send_amount) * u128::from(collateral_ratio_bps);
    let bond = scaled.div_ceil(10_000);

    u64::try_from(bond)
        .map_err(|_| ExchangeError::InvalidAmount("required bond overflows".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(total: u64) -> BondAccount {
        let mut acc = BondAccount::default();
        acc.deposit(total).unwrap();
        acc
    }

    #[test]
    fn lock_reduces_available() {
        let mut acc = account(1_000);
        acc.lock(600).unwrap();

        assert_eq!(acc.locked(), 600);
        assert_eq!(acc.available(), 400);
    }

    #[test]
    fn lock_beyond_available_fails_without_mutation() {
        let mut acc = account(1_000);
        acc.lock(600).unwrap();

        let err = acc.lock(500).unwrap_err();
        assert_eq!(
            err,
            ExchangeError::InsufficientBond {
                available: 400,
                required: 500
            }
        );
        assert_eq!(acc.locked(), 600);
    }

    #[test]
    fn unlock_restores_exactly() {
        let mut acc = account(1_000);
        let before = acc;
        acc.lock(321).unwrap();
        acc.unlock(321).unwrap();

        assert_eq!(acc, before);
    }

    #[test]
    fn unlock_below_zero_is_an_invariant_violation() {
        let mut acc = account(1_000);
        acc.lock(10).unwrap();

        let err = acc.unlock(11).unwrap_err();
        assert!(matches!(err, ExchangeError::InvariantViolation(_)));
        assert_eq!(acc.locked(), 10);
    }

    #[test]
    fn forfeit_reduces_total_and_locked() {
        let mut acc = account(1_000);
        acc.lock(600).unwrap();
        acc.forfeit(600).unwrap();

        assert_eq!(acc.total(), 400);
        assert_eq!(acc.locked(), 0);
        assert!(acc.check().is_ok());
    }

    #[test]
    fn forfeit_more_than_locked_fails() {
        let mut acc = account(1_000);
        acc.lock(100).unwrap();

        assert!(acc.forfeit(101).is_err());
    }

    #[test]
    fn withdraw_limited_to_available() {
        let mut acc = account(1_000);
        acc.lock(700).unwrap();

        assert!(matches!(
            acc.withdraw(301),
            Err(ExchangeError::InsufficientBond { .. })
        ));
        acc.withdraw(300).unwrap();
        assert_eq!(acc.total(), 700);
        assert_eq!(acc.available(), 0);
    }

    #[test]
    fn zero_deposits_and_withdrawals_are_rejected() {
        let mut acc = BondAccount::default();
        assert!(matches!(acc.deposit(0), Err(ExchangeError::InvalidAmount(_))));
        assert!(matches!(acc.withdraw(0), Err(ExchangeError::InvalidAmount(_))));
    }

    #[test]
    fn deposit_overflow_is_rejected() {
        let mut acc = account(u64::MAX);
        assert!(acc.deposit(1).is_err());
        assert_eq!(acc.total(), u64::MAX);
    }

    #[test]
    fn required_bond_rounds_up() {
        assert_eq!(required_bond(600, 10_000).unwrap(), 600);
        assert_eq!(required_bond(101, 5_000).unwrap(), 51);
        assert_eq!(required_bond(1, 1).unwrap(), 1);
        assert_eq!(required_bond(1_000, 15_000).unwrap(), 1_500);
    }
}
