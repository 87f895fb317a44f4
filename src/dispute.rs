//! Disputes freeze a trade until an arbiter resolves it. Resolution is
//! one-shot and decides where the trade's locked bond goes.
use crate::bond::BondLedger;
use crate::error::ExchangeError;
use crate::lifecycle::{BondEffect, TradeAction, TradeStatus};
use crate::store::{Abortable, StoreTx, TxResult, abort};
use crate::trade::{CancelReason, TimeStamp, Trade};
use chrono::Utc;
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    #[n(0)]
    FavorUser,
    #[n(1)]
    FavorTrader,
    #[n(2)]
    Split,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::FavorUser => "favor_user",
            Resolution::FavorTrader => "favor_trader",
            Resolution::Split => "split",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ExchangeError> {
        match value {
            "favor_user" => Ok(Resolution::FavorUser),
            "favor_trader" => Ok(Resolution::FavorTrader),
            "split" => Ok(Resolution::Split),
            other => Err(ExchangeError::Validation(format!(
                "unknown resolution '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    #[n(0)]
    User,
    #[n(1)]
    Trader,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeStatus {
    #[n(0)]
    Open,
    #[n(1)]
    Resolved,
}

/// Pointer to material held by the upload service.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Evidence {
    #[n(0)]
    pub submitted_by: String,
    #[n(1)]
    pub party: Party,
    #[n(2)]
    pub reference: String,
    #[n(3)]
    pub note: Option<String>,
    #[n(4)]
    pub submitted_at: TimeStamp<Utc>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Dispute {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub trade_id: String,
    #[n(2)]
    pub opened_by: String,
    #[n(3)]
    pub opened_by_party: Party,
    #[n(4)]
    pub reason: String,
    #[n(5)]
    pub status: DisputeStatus,
    #[n(6)]
    pub evidence: Vec<Evidence>,
    #[n(7)]
    pub resolution: Option<Resolution>,
    #[n(8)]
    pub resolution_notes: Option<String>,
    #[n(9)]
    pub resolved_by: Option<String>,
    #[n(10)]
    pub resolved_at: Option<TimeStamp<Utc>>,
    #[n(11)]
    pub forfeited: u64,
    #[n(12)]
    pub unlocked: u64,
    #[n(13)]
    pub opened_at: TimeStamp<Utc>,
}

/// Forfeited and released parts of a split. The odd unit is forfeited,
/// so the user side never receives less than half.
pub fn split_bond(locked: u64) -> (u64, u64) {
    let forfeited = locked.div_ceil(2);
    (forfeited, locked - forfeited)
}

/// Which side of `trade` the actor is on.
pub fn party_of(trade: &Trade, actor_id: &str) -> Result<Party, ExchangeError> {
    if actor_id == trade.user_id {
        Ok(Party::User)
    } else if actor_id == trade.trader_id {
        Ok(Party::Trader)
    } else {
        Err(ExchangeError::NotParticipant(actor_id.to_string()))
    }
}

pub struct DisputeResolver;

impl DisputeResolver {
    /// Freeze the trade and create its dispute in one step.
    pub fn open(
        tx: &StoreTx<'_>,
        dispute_id: &str,
        trade_id: &str,
        actor_id: &str,
        reason: &str,
    ) -> TxResult<(Trade, Dispute)> {
        let mut trade = tx.trade(trade_id)?;
        let party = party_of(&trade, actor_id).or_abort()?;

        if let Some(existing) = &trade.dispute_id {
            tracing::debug!(trade_id, dispute_id = %existing, "dispute already on record");
            return Err(abort(ExchangeError::DisputeAlreadyOpen(trade_id.to_string())));
        }

        let step = trade.status.apply(TradeAction::OpenDispute).or_abort()?;
        let now = TimeStamp::new();

        let dispute = Dispute {
            id: dispute_id.to_string(),
            trade_id: trade_id.to_string(),
            opened_by: actor_id.to_string(),
            opened_by_party: party,
            reason: reason.to_string(),
            status: DisputeStatus::Open,
            evidence: vec![],
            resolution: None,
            resolution_notes: None,
            resolved_by: None,
            resolved_at: None,
            forfeited: 0,
            unlocked: 0,
            opened_at: now.clone(),
        };

        trade.status = step.to;
        trade.dispute_id = Some(dispute.id.clone());
        trade.stamp(step.to, now);

        tx.put_trade(&trade)?;
        tx.put_dispute(&dispute)?;

        Ok((trade, dispute))
    }

    pub fn add_evidence(
        tx: &StoreTx<'_>,
        dispute_id: &str,
        actor_id: &str,
        reference: &str,
        note: Option<&str>,
    ) -> TxResult<Dispute> {
        let mut dispute = tx.dispute(dispute_id)?;
        if dispute.status == DisputeStatus::Resolved {
            return Err(abort(ExchangeError::AlreadyResolved(dispute_id.to_string())));
        }
        let trade = tx.trade(&dispute.trade_id)?;
        let party = party_of(&trade, actor_id).or_abort()?;

        dispute.evidence.push(Evidence {
            submitted_by: actor_id.to_string(),
            party,
            reference: reference.to_string(),
            note: note.map(str::to_string),
            submitted_at: TimeStamp::new(),
        });
        tx.put_dispute(&dispute)?;

        Ok(dispute)
    }

    /// Apply the terminal resolution. Dispute row, trade row and trader bond
    /// are written together; a second call fails `AlreadyResolved`.
    pub fn resolve(
        tx: &StoreTx<'_>,
        dispute_id: &str,
        resolver_id: &str,
        resolution: Resolution,
        notes: Option<&str>,
    ) -> TxResult<(Trade, Dispute)> {
        let mut dispute = tx.dispute(dispute_id)?;
        if dispute.status == DisputeStatus::Resolved {
            return Err(abort(ExchangeError::AlreadyResolved(dispute_id.to_string())));
        }

        let mut trade = tx.trade(&dispute.trade_id)?;
        if trade.status != TradeStatus::Disputed {
            return Err(abort(ExchangeError::invariant(format!(
                "open dispute {dispute_id} points at trade {} in status {}",
                trade.id, trade.status
            ))));
        }
        let step = trade.status.apply(TradeAction::Resolve(resolution)).or_abort()?;

        let locked = trade.bond_locked;
        let (forfeited, unlocked) = match step.effect {
            BondEffect::Forfeit => (locked, 0),
            BondEffect::Unlock => (0, locked),
            BondEffect::Split => split_bond(locked),
            other => {
                return Err(abort(ExchangeError::invariant(format!(
                    "resolution {resolution} mapped to bond effect {other:?}"
                ))));
            }
        };

        if forfeited > 0 {
            BondLedger::forfeit(tx, &trade.trader_id, forfeited, &trade.id)?;
        }
        if unlocked > 0 {
            BondLedger::unlock(tx, &trade.trader_id, unlocked, &trade.id)?;
        }

        if step.to == TradeStatus::Completed {
            let mut trader = tx.trader(&trade.trader_id)?;
            trader.completed_trades += 1;
            tx.put_trader(&trader)?;
        }

        let now = TimeStamp::new();
        trade.status = step.to;
        trade.resolution = Some(resolution);
        if resolution == Resolution::FavorUser {
            trade.cancel_reason = Some(CancelReason::DisputeFavoredUser);
        }
        trade.stamp(step.to, now.clone());

        dispute.status = DisputeStatus::Resolved;
        dispute.resolution = Some(resolution);
        dispute.resolution_notes = notes.map(str::to_string);
        dispute.resolved_by = Some(resolver_id.to_string());
        dispute.resolved_at = Some(now);
        dispute.forfeited = forfeited;
        dispute.unlocked = unlocked;

        tx.put_trade(&trade)?;
        tx.put_dispute(&dispute)?;

        Ok((trade, dispute))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_gives_odd_unit_to_forfeit() {
        assert_eq!(split_bond(101), (51, 50));
        assert_eq!(split_bond(100), (50, 50));
        assert_eq!(split_bond(1), (1, 0));
        assert_eq!(split_bond(0), (0, 0));
    }

    #[test]
    fn split_never_loses_units() {
        for locked in [0u64, 1, 2, 3, 999, u64::MAX] {
            let (f, u) = split_bond(locked);
            assert_eq!(f + u, locked);
            assert!(f >= u);
        }
    }

    #[test]
    fn resolution_parsing() {
        assert_eq!(Resolution::parse("favor_user").unwrap(), Resolution::FavorUser);
        assert_eq!(Resolution::parse("split").unwrap(), Resolution::Split);
        assert!(Resolution::parse("favour_user").is_err());
        assert_eq!(Resolution::FavorTrader.to_string(), "favor_trader");
    }
}
