//! Service layer API for the exchange core.
//!
//! Every state-changing call runs as one storage transaction: the trade
//! row, the trader's bond, any dispute or rating row and the outbox entry
//! commit together or not at all. Notification of external mirrors happens
//! after commit and can never undo it.
use crate::bond::{BondEvent, BondLedger, required_bond};
use crate::config::ExchangeConfig;
use crate::dispute::{Dispute, DisputeResolver, DisputeStatus, Resolution};
use crate::error::{ErrorKind, ExchangeError};
use crate::lifecycle::{BondEffect, TradeAction, TradeStatus};
use crate::notifier::{DispatchReport, LedgerEvent, LedgerNotifier, LedgerSink, Notification};
use crate::query::{BondOverview, ExchangeStats, Page, TradeFilter, TraderFilter};
use crate::rating::Rating;
use crate::store::{Abortable, StoreTx, TradeStore, TxResult, abort};
use crate::trade::{CancelReason, TimeStamp, Trade, TradeRequest};
use crate::trader::{Corridor, Trader, TraderStatus, validate_corridors};
use crate::utils::{DISPUTE_HRP, TRADE_HRP, TRADER_HRP, new_id};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::sync::Arc;

type Result<T> = std::result::Result<T, ExchangeError>;

pub struct TradeService {
    store: TradeStore,
    notifier: LedgerNotifier,
    config: ExchangeConfig,
}

impl TradeService {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self> {
        Self::with_config(instance, ExchangeConfig::default())
    }

    pub fn with_config(instance: Arc<sled::Db>, config: ExchangeConfig) -> Result<Self> {
        Self::from_store(TradeStore::open(&instance)?, config)
    }

    pub fn from_store(store: TradeStore, config: ExchangeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            notifier: LedgerNotifier::new(config.max_notification_attempts()),
            config,
        })
    }

    /// Service over a throwaway in-memory database.
    pub fn temporary(config: ExchangeConfig) -> Result<Self> {
        Self::from_store(TradeStore::open_temporary()?, config)
    }

    pub fn register_sink(&mut self, sink: Box<dyn LedgerSink>) {
        self.notifier.register(sink);
    }

    pub fn store(&self) -> &TradeStore {
        &self.store
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// Run `f` in a transaction, logging rejections.
    fn execute<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn(&StoreTx<'_>) -> TxResult<T>,
    {
        let result = self.store.transact(f);
        if let Err(e) = &result {
            match e.kind() {
                ErrorKind::Storage => tracing::warn!(op, error = %e, "transaction failed"),
                // logged where it was raised
                ErrorKind::InvariantViolation => {}
                _ => tracing::debug!(op, error = %e, "operation rejected"),
            }
        }
        result
    }

    /// Like [`Self::execute`] for operations that move a trade: the
    /// notification queued by `f` is published once the transaction commits.
    fn commit<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn(&StoreTx<'_>) -> TxResult<(T, Notification)>,
    {
        let (value, notification) = self.execute(op, f)?;
        tracing::info!(
            op,
            trade_id = %notification.trade_id,
            trader_id = %notification.trader_id,
            status = %notification.status,
            "trade transition committed"
        );
        self.notifier.dispatch(&self.store, &notification);
        Ok(value)
    }

    /// Drive one trade through `action`. `authorize` runs against the stored
    /// trade before the status check; `edit` sets action specific fields.
    fn advance<A, E>(&self, trade_id: &str, action: TradeAction, authorize: A, edit: E) -> Result<Trade>
    where
        A: Fn(&Trade) -> Result<()>,
        E: Fn(&mut Trade),
    {
        self.commit(action.as_str(), |tx| {
            let mut trade = tx.trade(trade_id)?;
            authorize(&trade).or_abort()?;
            let step = trade.status.apply(action).or_abort()?;

            let mut unlocked = 0;
            match step.effect {
                BondEffect::None => {}
                BondEffect::Lock => {
                    let trader = tx.trader(&trade.trader_id)?;
                    if !trader.is_active() {
                        return Err(abort(ExchangeError::TraderInactive(trader.id)));
                    }
                    trader
                        .corridor_for(&trade.send_currency, &trade.receive_currency, trade.send_amount)
                        .or_abort()?;

                    let amount =
                        required_bond(trade.send_amount, self.config.collateral_ratio_bps()).or_abort()?;
                    BondLedger::lock(tx, &trade.trader_id, amount, &trade.id)?;
                    trade.bond_locked = amount;
                }
                BondEffect::Unlock => {
                    BondLedger::unlock(tx, &trade.trader_id, trade.bond_locked, &trade.id)?;
                    unlocked = trade.bond_locked;

                    if step.to == TradeStatus::Completed {
                        let mut trader = tx.trader(&trade.trader_id)?;
                        trader.completed_trades += 1;
                        tx.put_trader(&trader)?;
                    }
                }
                BondEffect::Forfeit | BondEffect::Split => {
                    return Err(abort(ExchangeError::invariant(format!(
                        "{action} produced {:?}, which only dispute resolution applies",
                        step.effect
                    ))));
                }
            }

            edit(&mut trade);
            trade.status = step.to;
            trade.stamp(step.to, TimeStamp::new());
            trade.cancel_reason = match action {
                TradeAction::Decline => Some(CancelReason::DeclinedByTrader),
                TradeAction::Cancel => Some(CancelReason::CancelledByUser),
                TradeAction::Expire => Some(CancelReason::Expired),
                _ => trade.cancel_reason,
            };

            let event = match action {
                TradeAction::Accept => LedgerEvent::TradeAccepted {
                    bond_locked: trade.bond_locked,
                },
                TradeAction::MarkPaid => LedgerEvent::TradePaid,
                TradeAction::MarkDelivered => LedgerEvent::TradeDelivered,
                TradeAction::Complete => LedgerEvent::TradeCompleted {
                    bond_unlocked: unlocked,
                },
                TradeAction::Decline | TradeAction::Cancel | TradeAction::Expire => {
                    LedgerEvent::TradeCancelled {
                        bond_unlocked: unlocked,
                    }
                }
                TradeAction::OpenDispute | TradeAction::Resolve(_) => {
                    return Err(abort(ExchangeError::invariant(format!(
                        "{action} must go through the dispute resolver"
                    ))));
                }
            };

            tx.put_trade(&trade)?;
            let notification = Notification::new(&trade.id, &trade.trader_id, trade.status, event);
            tx.queue(&notification)?;

            Ok((trade, notification))
        })
    }

    // ---- trade lifecycle ----

    pub fn create_trade(&self, request: TradeRequest) -> Result<Trade> {
        let request = request.validate()?;
        let trade_id = new_id(TRADE_HRP)?;

        self.commit("create", |tx| {
            let trader = tx.trader(&request.trader_id)?;
            if !trader.is_active() {
                return Err(abort(ExchangeError::TraderInactive(trader.id)));
            }
            if trader.user_id == request.user_id {
                return Err(abort(ExchangeError::Validation(
                    "a trader cannot take their own trade".into(),
                )));
            }

            let trade = Trade::new(trade_id.clone(), request.clone(), TimeStamp::new());
            tx.put_trade(&trade)?;

            let event = LedgerEvent::TradeCreated {
                send_amount: trade.send_amount,
                receive_amount: trade.receive_amount,
            };
            let notification = Notification::new(&trade.id, &trade.trader_id, trade.status, event);
            tx.queue(&notification)?;

            Ok((trade, notification))
        })
    }

    /// Accept a pending trade, locking the trader's collateral for it.
    pub fn accept_trade(&self, trade_id: &str, trader_id: &str) -> Result<Trade> {
        self.advance(trade_id, TradeAction::Accept, |t| assigned_trader(t, trader_id), |_| {})
    }

    pub fn decline_trade(&self, trade_id: &str, trader_id: &str) -> Result<Trade> {
        self.advance(trade_id, TradeAction::Decline, |t| assigned_trader(t, trader_id), |_| {})
    }

    pub fn mark_paid(
        &self,
        trade_id: &str,
        user_id: &str,
        reference: Option<&str>,
        proof_url: Option<&str>,
    ) -> Result<Trade> {
        self.advance(
            trade_id,
            TradeAction::MarkPaid,
            |t| owner(t, user_id),
            |t| {
                t.payment_reference = reference.map(str::to_string);
                t.payment_proof_url = proof_url.map(str::to_string);
            },
        )
    }

    pub fn mark_delivered(&self, trade_id: &str, trader_id: &str) -> Result<Trade> {
        self.advance(trade_id, TradeAction::MarkDelivered, |t| assigned_trader(t, trader_id), |_| {})
    }

    /// Confirm receipt. Releases the trade's bond and counts the trade for the trader.
    pub fn complete_trade(&self, trade_id: &str, user_id: &str) -> Result<Trade> {
        self.advance(trade_id, TradeAction::Complete, |t| owner(t, user_id), |_| {})
    }

    /// Cancel before payment. Releases the bond if the trade was already accepted.
    pub fn cancel_trade(&self, trade_id: &str, user_id: &str) -> Result<Trade> {
        self.advance(trade_id, TradeAction::Cancel, |t| owner(t, user_id), |_| {})
    }

    // ---- disputes ----

    pub fn open_dispute(&self, trade_id: &str, actor_id: &str, reason: &str) -> Result<Dispute> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ExchangeError::Validation("dispute reason is required".into()));
        }
        let dispute_id = new_id(DISPUTE_HRP)?;

        self.commit("open-dispute", |tx| {
            let (trade, dispute) = DisputeResolver::open(tx, &dispute_id, trade_id, actor_id, reason)?;
            let event = LedgerEvent::DisputeOpened {
                dispute_id: dispute.id.clone(),
            };
            let notification = Notification::new(&trade.id, &trade.trader_id, trade.status, event);
            tx.queue(&notification)?;

            Ok((dispute, notification))
        })
    }

    pub fn submit_evidence(
        &self,
        dispute_id: &str,
        actor_id: &str,
        reference: &str,
        note: Option<&str>,
    ) -> Result<Dispute> {
        if reference.trim().is_empty() {
            return Err(ExchangeError::Validation("evidence reference is required".into()));
        }
        self.execute("submit-evidence", |tx| {
            DisputeResolver::add_evidence(tx, dispute_id, actor_id, reference, note)
        })
    }

    /// Settle a dispute. One-shot: a second call fails `AlreadyResolved`
    /// and changes nothing.
    pub fn resolve_dispute(
        &self,
        dispute_id: &str,
        resolver_id: &str,
        resolution: Resolution,
        notes: Option<&str>,
    ) -> Result<Trade> {
        self.commit("resolve", |tx| {
            let (trade, dispute) = DisputeResolver::resolve(tx, dispute_id, resolver_id, resolution, notes)?;
            let event = LedgerEvent::DisputeResolved {
                dispute_id: dispute.id.clone(),
                resolution,
                forfeited: dispute.forfeited,
                unlocked: dispute.unlocked,
            };
            let notification = Notification::new(&trade.id, &trade.trader_id, trade.status, event);
            tx.queue(&notification)?;

            Ok((trade, notification))
        })
    }

    // ---- ratings ----

    pub fn rate_trade(
        &self,
        trade_id: &str,
        user_id: &str,
        score: u8,
        comment: Option<&str>,
    ) -> Result<Rating> {
        let score = Rating::validate_score(score)?;

        self.execute("rate", |tx| {
            let trade = tx.trade(trade_id)?;
            owner(&trade, user_id).or_abort()?;
            if trade.status != TradeStatus::Completed {
                return Err(abort(ExchangeError::NotCompleted(trade.id)));
            }
            if tx.rating(trade_id, user_id)?.is_some() {
                return Err(abort(ExchangeError::AlreadyRated(trade.id)));
            }

            let rating = Rating {
                trade_id: trade.id.clone(),
                from_user_id: user_id.to_string(),
                to_trader_id: trade.trader_id.clone(),
                score,
                comment: comment.map(str::to_string),
                created_at: TimeStamp::new(),
            };
            tx.put_rating(&rating)?;

            let mut trader = tx.trader(&trade.trader_id)?;
            trader.record_rating(score);
            tx.put_trader(&trader)?;

            Ok(rating)
        })
    }

    // ---- trader management ----

    pub fn apply_trader(&self, user_id: &str, corridors: Vec<Corridor>) -> Result<Trader> {
        if user_id.trim().is_empty() {
            return Err(ExchangeError::Validation("user id is required".into()));
        }
        validate_corridors(&corridors)?;
        let trader_id = new_id(TRADER_HRP)?;

        let trader = self.execute("apply-trader", |tx| {
            if tx.trader_for_user(user_id)?.is_some() {
                return Err(abort(ExchangeError::AlreadyApplied(user_id.to_string())));
            }
            let trader = Trader::new(trader_id.clone(), user_id.to_string(), corridors.clone());
            tx.insert_trader(&trader)?;
            Ok(trader)
        })?;

        tracing::info!(trader_id = %trader.id, user_id, "trader application received");
        Ok(trader)
    }

    pub fn approve_trader(&self, trader_id: &str, admin_id: &str) -> Result<Trader> {
        self.update_trader("approve-trader", trader_id, |trader| {
            trader.transition(TraderStatus::Active, "approve")?;
            trader.approved_by = Some(admin_id.to_string());
            trader.approved_at = Some(TimeStamp::new());
            trader.status_reason = None;
            Ok(())
        })
    }

    pub fn reject_trader(&self, trader_id: &str, reason: &str) -> Result<Trader> {
        self.update_trader("reject-trader", trader_id, |trader| {
            trader.transition(TraderStatus::Rejected, "reject")?;
            trader.status_reason = Some(reason.to_string());
            Ok(())
        })
    }

    /// Suspend an active trader and take them offline. Trades already
    /// accepted keep running; new ones cannot be created or accepted.
    pub fn suspend_trader(&self, trader_id: &str, reason: &str) -> Result<Trader> {
        self.update_trader("suspend-trader", trader_id, |trader| {
            trader.transition(TraderStatus::Suspended, "suspend")?;
            trader.is_online = false;
            trader.status_reason = Some(reason.to_string());
            Ok(())
        })
    }

    pub fn set_trader_online(&self, trader_id: &str, online: bool) -> Result<Trader> {
        self.update_trader("set-online", trader_id, |trader| {
            if online && !trader.is_active() {
                return Err(ExchangeError::InvalidTraderState {
                    status: trader.status,
                    action: "go online",
                });
            }
            trader.is_online = online;
            Ok(())
        })
    }

    /// Replace the trader's corridor list. Trades already accepted keep
    /// the rate and bond they were accepted with.
    pub fn update_corridors(&self, trader_id: &str, corridors: Vec<Corridor>) -> Result<Trader> {
        validate_corridors(&corridors)?;
        self.update_trader("update-corridors", trader_id, |trader| {
            trader.corridors = corridors.clone();
            Ok(())
        })
    }

    fn update_trader<F>(&self, op: &'static str, trader_id: &str, edit: F) -> Result<Trader>
    where
        F: Fn(&mut Trader) -> Result<()>,
    {
        let trader = self.execute(op, |tx| {
            let mut trader = tx.trader(trader_id)?;
            edit(&mut trader).or_abort()?;
            tx.put_trader(&trader)?;
            Ok(trader)
        })?;

        tracing::info!(op, trader_id, status = %trader.status, online = trader.is_online, "trader updated");
        Ok(trader)
    }

    pub fn deposit_bond(&self, trader_id: &str, amount: u64) -> Result<Trader> {
        let trader = self.execute("deposit-bond", |tx| BondLedger::deposit(tx, trader_id, amount))?;
        tracing::info!(trader_id, amount, total = trader.bond.total(), "bond deposited");
        Ok(trader)
    }

    /// Withdraw unlocked collateral; locked bond cannot leave.
    pub fn withdraw_bond(&self, trader_id: &str, amount: u64) -> Result<Trader> {
        let trader = self.execute("withdraw-bond", |tx| BondLedger::withdraw(tx, trader_id, amount))?;
        tracing::info!(trader_id, amount, total = trader.bond.total(), "bond withdrawn");
        Ok(trader)
    }

    // ---- maintenance ----

    /// Cancel every pending trade created more than the configured expiry
    /// before `now`. Returns the ids that were expired. A trade accepted
    /// while the sweep runs is left alone.
    pub fn expire_stale_pending(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let Some(cutoff) = now.checked_sub_signed(self.config.pending_expiry()) else {
            // nothing can be older than the earliest representable instant
            return Ok(vec![]);
        };
        let stale: Vec<String> = self
            .store
            .trades()?
            .into_iter()
            .filter(|t| t.status == TradeStatus::Pending && t.created_at.to_datetime_utc() < cutoff)
            .map(|t| t.id)
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for trade_id in stale {
            match self.advance(&trade_id, TradeAction::Expire, |_| Ok(()), |_| {}) {
                Ok(_) => expired.push(trade_id),
                Err(ExchangeError::InvalidTradeState { status, .. }) => {
                    tracing::debug!(trade_id = %trade_id, %status, "trade moved on before it could expire");
                }
                Err(e) => return Err(e),
            }
        }

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired stale pending trades");
        }
        Ok(expired)
    }

    pub fn pending_notifications(&self) -> Result<Vec<Notification>> {
        self.store.pending_notifications()
    }

    pub fn retry_pending_notifications(&self) -> Result<DispatchReport> {
        let report = self.notifier.retry_pending(&self.store).inspect_err(|e| {
            tracing::warn!(error = %e, "could not read notification outbox");
        })?;
        if report.exhausted > 0 {
            tracing::warn!(
                exhausted = report.exhausted,
                max_attempts = self.notifier.max_attempts(),
                "notifications past their attempt limit"
            );
        }
        Ok(report)
    }

    // ---- queries ----

    pub fn trade(&self, trade_id: &str) -> Result<Trade> {
        self.store
            .trade(trade_id)?
            .ok_or_else(|| ExchangeError::TradeNotFound(trade_id.to_string()))
    }

    pub fn trader(&self, trader_id: &str) -> Result<Trader> {
        self.store
            .trader(trader_id)?
            .ok_or_else(|| ExchangeError::TraderNotFound(trader_id.to_string()))
    }

    pub fn trader_by_user(&self, user_id: &str) -> Result<Option<Trader>> {
        self.store.trader_by_user(user_id)
    }

    pub fn dispute(&self, dispute_id: &str) -> Result<Dispute> {
        self.store
            .dispute(dispute_id)?
            .ok_or_else(|| ExchangeError::DisputeNotFound(dispute_id.to_string()))
    }

    pub fn dispute_for_trade(&self, trade_id: &str) -> Result<Option<Dispute>> {
        match self.trade(trade_id)?.dispute_id {
            Some(dispute_id) => self.dispute(&dispute_id).map(Some),
            None => Ok(None),
        }
    }

    pub fn rating(&self, trade_id: &str, user_id: &str) -> Result<Option<Rating>> {
        self.store.rating(trade_id, user_id)
    }

    pub fn list_trades_for_user(&self, user_id: &str, filter: &TradeFilter) -> Result<Page<Trade>> {
        Ok(filter.apply(self.store.trades()?, |t| t.user_id == user_id))
    }

    pub fn list_trades_for_trader(&self, trader_id: &str, filter: &TradeFilter) -> Result<Page<Trade>> {
        Ok(filter.apply(self.store.trades()?, |t| t.trader_id == trader_id))
    }

    pub fn list_traders(&self, filter: &TraderFilter) -> Result<Page<Trader>> {
        Ok(filter.apply(self.store.traders()?))
    }

    /// Newest first.
    pub fn list_disputes(&self, status: Option<DisputeStatus>) -> Result<Vec<Dispute>> {
        let mut disputes: Vec<Dispute> = self
            .store
            .disputes()?
            .into_iter()
            .filter(|d| status.is_none_or(|s| d.status == s))
            .collect();
        disputes.sort_by_key(|d| Reverse(d.opened_at.to_datetime_utc()));
        Ok(disputes)
    }

    pub fn bond_events(&self, trader_id: &str) -> Result<Vec<BondEvent>> {
        self.trader(trader_id)?;
        self.store.bond_events(trader_id)
    }

    pub fn bond_overview(&self) -> Result<BondOverview> {
        Ok(BondOverview::from_traders(&self.store.traders()?))
    }

    pub fn stats(&self) -> Result<ExchangeStats> {
        Ok(ExchangeStats::collect(
            &self.store.trades()?,
            &self.store.traders()?,
            &self.store.disputes()?,
        ))
    }
}

fn assigned_trader(trade: &Trade, trader_id: &str) -> Result<()> {
    if trade.trader_id == trader_id {
        Ok(())
    } else {
        Err(ExchangeError::WrongTrader(trader_id.to_string()))
    }
}

fn owner(trade: &Trade, user_id: &str) -> Result<()> {
    if trade.user_id == user_id {
        Ok(())
    } else {
        Err(ExchangeError::NotOwner(user_id.to_string()))
    }
}
