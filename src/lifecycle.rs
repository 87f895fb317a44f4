//! Trade lifecycle: the transition table every state-changing operation
//! goes through.
//!
//! ```text
//! pending ──accept──▶ accepted ──mark-paid──▶ paid ──mark-delivered──▶ delivering ──complete──▶ completed
//!    │                   │  │                  │                          │
//!    │ decline/cancel/   │  └──────────────────┴──────open-dispute────────┴──▶ disputed ──resolve──▶ completed|cancelled
//!    │ expire            │ cancel
//!    ▼                   ▼
//! cancelled          cancelled
//! ```
use crate::dispute::Resolution;
use crate::error::ExchangeError;
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Accepted,
    #[n(2)]
    Paid,
    #[n(3)]
    Delivering,
    #[n(4)]
    Completed,
    #[n(5)]
    Disputed,
    #[n(6)]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeAction {
    Accept,
    Decline,
    Cancel,
    /// Stale-pending sweep; a cancel that is only legal before acceptance.
    Expire,
    MarkPaid,
    MarkDelivered,
    Complete,
    OpenDispute,
    Resolve(Resolution),
}

/// What the bond ledger must do as part of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondEffect {
    None,
    /// Lock collateral and snapshot it onto the trade.
    Lock,
    /// Release the trade's full snapshot.
    Unlock,
    /// Forfeit the trade's full snapshot.
    Forfeit,
    /// Forfeit half (rounded up), release the rest.
    Split,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: TradeStatus,
    pub to: TradeStatus,
    pub effect: BondEffect,
}

impl TradeStatus {
    pub const ALL: [TradeStatus; 7] = [
        TradeStatus::Pending,
        TradeStatus::Accepted,
        TradeStatus::Paid,
        TradeStatus::Delivering,
        TradeStatus::Completed,
        TradeStatus::Disputed,
        TradeStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Accepted => "accepted",
            TradeStatus::Paid => "paid",
            TradeStatus::Delivering => "delivering",
            TradeStatus::Completed => "completed",
            TradeStatus::Disputed => "disputed",
            TradeStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeStatus::Completed | TradeStatus::Cancelled)
    }

    /// Statuses in which the trader's collateral for the trade is held.
    pub fn holds_bond(&self) -> bool {
        matches!(
            self,
            TradeStatus::Accepted
                | TradeStatus::Paid
                | TradeStatus::Delivering
                | TradeStatus::Disputed
        )
    }

    /// Validate `action` against this status. The only place transitions are decided.
    pub fn apply(self, action: TradeAction) -> Result<Transition, ExchangeError> {
        use BondEffect as B;
        use TradeAction as A;
        use TradeStatus as S;

        let (to, effect) = match (self, action) {
            (S::Pending, A::Accept) => (S::Accepted, B::Lock),
            (S::Pending, A::Decline | A::Cancel | A::Expire) => (S::Cancelled, B::None),
            (S::Accepted, A::Cancel) => (S::Cancelled, B::Unlock),
            (S::Accepted, A::MarkPaid) => (S::Paid, B::None),
            (S::Paid, A::MarkDelivered) => (S::Delivering, B::None),
            (S::Delivering, A::Complete) => (S::Completed, B::Unlock),
            (S::Accepted | S::Paid | S::Delivering, A::OpenDispute) => (S::Disputed, B::None),
            (S::Disputed, A::Resolve(Resolution::FavorUser)) => (S::Cancelled, B::Forfeit),
            (S::Disputed, A::Resolve(Resolution::FavorTrader)) => (S::Completed, B::Unlock),
            (S::Disputed, A::Resolve(Resolution::Split)) => (S::Completed, B::Split),
            (status, action) => {
                return Err(ExchangeError::InvalidTradeState { status, action });
            }
        };

        Ok(Transition {
            from: self,
            to,
            effect,
        })
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Accept => "accept",
            TradeAction::Decline => "decline",
            TradeAction::Cancel => "cancel",
            TradeAction::Expire => "expire",
            TradeAction::MarkPaid => "mark-paid",
            TradeAction::MarkDelivered => "mark-delivered",
            TradeAction::Complete => "complete",
            TradeAction::OpenDispute => "open-dispute",
            TradeAction::Resolve(_) => "resolve",
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeAction::Resolve(resolution) => write!(f, "resolve ({resolution})"),
            other => f.write_str(other.as_str()),
        }
    }
}
