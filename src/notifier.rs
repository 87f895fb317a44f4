//! Post-commit notification of external mirrors (on-chain escrow, websocket rooms).
//!
//! A [`Notification`] is written to the outbox in the same transaction as
//! the transition it describes. After commit the [`LedgerNotifier`] pushes it
//! to every registered [`LedgerSink`]; on success it is removed from the
//! outbox, on failure it stays there with its attempt count bumped so a
//! background process can retry it. Nothing here can undo a committed
//! transition. Delivery is at-least-once.
use crate::dispute::Resolution;
use crate::error::ExchangeError;
use crate::lifecycle::TradeStatus;
use crate::store::TradeStore;
use crate::trade::TimeStamp;
use chrono::Utc;
use std::sync::mpsc::Sender;
use uuid7::uuid7;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    #[n(0)]
    TradeCreated {
        #[n(0)]
        send_amount: u64,
        #[n(1)]
        receive_amount: u64,
    },
    #[n(1)]
    TradeAccepted {
        #[n(0)]
        bond_locked: u64,
    },
    #[n(2)]
    TradePaid,
    #[n(3)]
    TradeDelivered,
    #[n(4)]
    TradeCompleted {
        #[n(0)]
        bond_unlocked: u64,
    },
    #[n(5)]
    TradeCancelled {
        #[n(0)]
        bond_unlocked: u64,
    },
    #[n(6)]
    DisputeOpened {
        #[n(0)]
        dispute_id: String,
    },
    #[n(7)]
    DisputeResolved {
        #[n(0)]
        dispute_id: String,
        #[n(1)]
        resolution: Resolution,
        #[n(2)]
        forfeited: u64,
        #[n(3)]
        unlocked: u64,
    },
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    #[n(0)]
    pub id: String, // hex of the uuid7 outbox key
    #[n(1)]
    pub trade_id: String,
    #[n(2)]
    pub trader_id: String,
    #[n(3)]
    pub status: TradeStatus,
    #[n(4)]
    pub event: LedgerEvent,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
    #[n(6)]
    pub attempts: u32,
    #[n(7)]
    pub last_error: Option<String>,
}

impl Notification {
    pub fn new(trade_id: &str, trader_id: &str, status: TradeStatus, event: LedgerEvent) -> Self {
        Self {
            id: hex::encode(uuid7().as_bytes()),
            trade_id: trade_id.to_string(),
            trader_id: trader_id.to_string(),
            status,
            event,
            created_at: TimeStamp::new(),
            attempts: 0,
            last_error: None,
        }
    }

    /// Content digest of the event, stable across retries. Mirrors use it to
    /// drop duplicates.
    pub fn digest(&self) -> anyhow::Result<String> {
        let cbor = minicbor::to_vec((&self.id, &self.trade_id, &self.event))?;
        Ok(sha256::digest(&cbor))
    }

    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }
}

/// An external mirror of trade state.
///
/// Sinks are called on the request thread right after commit, so a slow
/// sink delays the caller's response though never its committed state.
/// Implementations that talk to a slow mirror should hand the notification
/// off (see [`ChannelSink`]) and publish from their own worker, leaving
/// failures to the outbox retry.
pub trait LedgerSink: Send + Sync {
    fn name(&self) -> &str;
    fn publish(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Forwards notifications into a channel, e.g. to a websocket room broadcaster.
pub struct ChannelSink {
    name: String,
    sender: Sender<Notification>,
}

impl ChannelSink {
    pub fn new(name: &str, sender: Sender<Notification>) -> Self {
        Self {
            name: name.to_string(),
            sender,
        }
    }
}

impl LedgerSink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }
    fn publish(&self, notification: &Notification) -> anyhow::Result<()> {
        self.sender
            .send(notification.clone())
            .map_err(|_| anyhow::anyhow!("{} receiver has hung up", self.name))
    }
}

/// Logs every event; useful when no mirror is configured.
pub struct TracingSink;

impl LedgerSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }
    fn publish(&self, notification: &Notification) -> anyhow::Result<()> {
        let digest = notification.digest()?;
        tracing::info!(
            digest = %digest,
            trade_id = %notification.trade_id,
            status = %notification.status,
            event = ?notification.event,
            "ledger event"
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    /// Still pending and past the attempt limit.
    pub exhausted: usize,
}

pub struct LedgerNotifier {
    sinks: Vec<Box<dyn LedgerSink>>,
    max_attempts: u32,
}

impl LedgerNotifier {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            sinks: vec![],
            max_attempts,
        }
    }

    pub fn register(&mut self, sink: Box<dyn LedgerSink>) {
        tracing::debug!(sink = sink.name(), "ledger sink registered");
        self.sinks.push(sink);
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Publish one committed notification. Never fails: problems are logged
    /// and the notification stays in the outbox.
    pub fn dispatch(&self, store: &TradeStore, notification: &Notification) -> bool {
        let failures: Vec<String> = self
            .sinks
            .iter()
            .filter_map(|sink| {
                sink.publish(notification)
                    .err()
                    .map(|e| format!("{}: {e:#}", sink.name()))
            })
            .collect();

        if failures.is_empty() {
            if let Err(e) = store.ack_notification(&notification.id) {
                tracing::warn!(id = %notification.id, error = %e, "failed to clear delivered notification");
            }
            return true;
        }

        let error = failures.join("; ");
        tracing::warn!(
            id = %notification.id,
            trade_id = %notification.trade_id,
            error = %error,
            "ledger notification failed, left pending"
        );
        if let Err(e) = store.record_notification_failure(&notification.id, &error) {
            tracing::warn!(id = %notification.id, error = %e, "failed to record notification failure");
        }
        false
    }

    /// Re-publish everything in the outbox, oldest first. Fails only when
    /// the outbox itself cannot be read.
    pub fn retry_pending(&self, store: &TradeStore) -> Result<DispatchReport, ExchangeError> {
        let mut report = DispatchReport::default();

        for notification in store.pending_notifications()? {
            if self.dispatch(store, &notification) {
                report.delivered += 1;
            } else {
                report.failed += 1;
                if notification.attempts + 1 >= self.max_attempts {
                    report.exhausted += 1;
                }
            }
        }
        Ok(report)
    }
}
