//! Read-side helpers: filters, pagination and aggregate reports.
use crate::dispute::{Dispute, DisputeStatus};
use crate::lifecycle::TradeStatus;
use crate::trade::{CurrencyCode, Trade};
use crate::trader::{Trader, TraderStatus};
use std::cmp::Reverse;
use std::collections::HashMap;

pub const DEFAULT_PAGE_SIZE: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matches before pagination.
    pub total: usize,
}

pub fn paginate<T>(items: Vec<T>, limit: usize, offset: usize) -> Page<T> {
    let total = items.len();
    let items = items.into_iter().skip(offset).take(limit).collect();
    Page { items, total }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeFilter {
    pub status: Option<TradeStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for TradeFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl TradeFilter {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_status(mut self, status: TradeStatus) -> Self {
        self.status = Some(status);
        self
    }
    pub fn set_page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Newest first.
    pub(crate) fn apply(&self, trades: Vec<Trade>, owner: impl Fn(&Trade) -> bool) -> Page<Trade> {
        let mut matching: Vec<Trade> = trades
            .into_iter()
            .filter(|t| owner(t) && self.status.is_none_or(|s| t.status == s))
            .collect();
        matching.sort_by_key(|t| Reverse(t.created_at.to_datetime_utc()));
        paginate(matching, self.limit, self.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraderFilter {
    pub status: TraderStatus,
    pub online: Option<bool>,
    pub corridor: Option<(CurrencyCode, CurrencyCode)>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for TraderFilter {
    fn default() -> Self {
        Self {
            status: TraderStatus::Active,
            online: None,
            corridor: None,
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl TraderFilter {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_status(mut self, status: TraderStatus) -> Self {
        self.status = status;
        self
    }
    pub fn set_online(mut self, online: bool) -> Self {
        self.online = Some(online);
        self
    }
    pub fn set_corridor(mut self, from: CurrencyCode, to: CurrencyCode) -> Self {
        self.corridor = Some((from, to));
        self
    }
    pub fn set_page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Best rated first, ties broken by completed trades.
    pub(crate) fn apply(&self, traders: Vec<Trader>) -> Page<Trader> {
        let mut matching: Vec<Trader> = traders
            .into_iter()
            .filter(|t| t.status == self.status)
            .filter(|t| self.online.is_none_or(|online| t.is_online == online))
            .filter(|t| {
                self.corridor
                    .as_ref()
                    .is_none_or(|(from, to)| t.corridor(from, to).is_some())
            })
            .collect();
        matching.sort_by_key(|t| Reverse((t.rating_x100().unwrap_or(0), t.completed_trades)));
        paginate(matching, self.limit, self.offset)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BondOverview {
    pub total_deposited: u64,
    pub total_locked: u64,
    pub total_available: u64,
    pub traders: usize,
}

impl BondOverview {
    pub fn from_traders<'a>(traders: impl IntoIterator<Item = &'a Trader>) -> Self {
        traders.into_iter().fold(Self::default(), |mut acc, t| {
            acc.total_deposited = acc.total_deposited.saturating_add(t.bond.total());
            acc.total_locked = acc.total_locked.saturating_add(t.bond.locked());
            acc.total_available = acc.total_available.saturating_add(t.bond.available());
            acc.traders += 1;
            acc
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExchangeStats {
    pub trades_by_status: HashMap<TradeStatus, usize>,
    pub traders_by_status: HashMap<TraderStatus, usize>,
    pub disputes_open: usize,
    pub disputes_resolved: usize,
}

impl ExchangeStats {
    pub fn collect(trades: &[Trade], traders: &[Trader], disputes: &[Dispute]) -> Self {
        let mut stats = Self::default();
        for trade in trades {
            *stats.trades_by_status.entry(trade.status).or_default() += 1;
        }
        for trader in traders {
            *stats.traders_by_status.entry(trader.status).or_default() += 1;
        }
        for dispute in disputes {
            match dispute.status {
                DisputeStatus::Open => stats.disputes_open += 1,
                DisputeStatus::Resolved => stats.disputes_resolved += 1,
            }
        }
        stats
    }

    pub fn trades(&self, status: TradeStatus) -> usize {
        self.trades_by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn traders(&self, status: TraderStatus) -> usize {
        self.traders_by_status.get(&status).copied().unwrap_or(0)
    }
}
