//! Durable storage for trades, traders, disputes, ratings, the bond audit
//! log and the notification outbox.
//!
//! | Tree          | Key                          | Value               |
//! |---------------|------------------------------|---------------------|
//! | `trades`      | trade id                     | cbor [`Trade`]      |
//! | `traders`     | trader id                    | cbor [`Trader`]     |
//! | `trader_users`| user id                      | trader id           |
//! | `disputes`    | dispute id                   | cbor [`Dispute`]    |
//! | `ratings`     | `{trade id}/{user id}`       | cbor [`Rating`]     |
//! | `bond_events` | `{trader id}/` + uuid7 bytes | cbor [`BondEvent`]  |
//! | `outbox`      | uuid7 bytes                  | cbor [`Notification`] |
//!
//! State changes go through [`TradeStore::transact`], one sled transaction
//! over all seven trees. sled 0.34 stages every transaction under a single
//! process-wide write lock, so transactions run one at a time across the
//! whole store, not per row. Each closure reads the current trade and trader
//! rows and decides from those, so a transition that lost a race sees the
//! winner's write and fails instead of overwriting it.
use crate::bond::BondEvent;
use crate::dispute::Dispute;
use crate::error::ExchangeError;
use crate::notifier::Notification;
use crate::rating::Rating;
use crate::trade::Trade;
use crate::trader::Trader;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Transactional, Tree};

pub type TxResult<T> = Result<T, ConflictableTransactionError<ExchangeError>>;

/// Abort the enclosing transaction with `err`; nothing it wrote is kept.
pub fn abort(err: ExchangeError) -> ConflictableTransactionError<ExchangeError> {
    ConflictableTransactionError::Abort(err)
}

/// Lift a domain result into the transaction, aborting on error.
pub trait Abortable<T> {
    fn or_abort(self) -> TxResult<T>;
}

impl<T> Abortable<T> for Result<T, ExchangeError> {
    fn or_abort(self) -> TxResult<T> {
        self.map_err(abort)
    }
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, ExchangeError> {
    Ok(minicbor::to_vec(value)?)
}

fn decode<'b, T: minicbor::Decode<'b, ()>>(bytes: &'b [u8]) -> Result<T, ExchangeError> {
    Ok(minicbor::decode(bytes)?)
}

/// View of the store inside one transaction.
pub struct StoreTx<'a> {
    trades: &'a TransactionalTree,
    traders: &'a TransactionalTree,
    trader_users: &'a TransactionalTree,
    disputes: &'a TransactionalTree,
    ratings: &'a TransactionalTree,
    bond_events: &'a TransactionalTree,
    outbox: &'a TransactionalTree,
}

impl StoreTx<'_> {
    pub fn trade(&self, id: &str) -> TxResult<Trade> {
        match self.trades.get(id.as_bytes())? {
            Some(bytes) => decode(&bytes).or_abort(),
            None => Err(abort(ExchangeError::TradeNotFound(id.to_string()))),
        }
    }

    pub fn put_trade(&self, trade: &Trade) -> TxResult<()> {
        self.trades
            .insert(trade.id.as_bytes(), encode(trade).or_abort()?)?;
        Ok(())
    }

    pub fn trader(&self, id: &str) -> TxResult<Trader> {
        match self.traders.get(id.as_bytes())? {
            Some(bytes) => decode(&bytes).or_abort(),
            None => Err(abort(ExchangeError::TraderNotFound(id.to_string()))),
        }
    }

    pub fn put_trader(&self, trader: &Trader) -> TxResult<()> {
        self.traders
            .insert(trader.id.as_bytes(), encode(trader).or_abort()?)?;
        Ok(())
    }

    /// Trader id registered for `user_id`, if any.
    pub fn trader_for_user(&self, user_id: &str) -> TxResult<Option<String>> {
        Ok(self
            .trader_users
            .get(user_id.as_bytes())?
            .map(|id| String::from_utf8_lossy(&id).into_owned()))
    }

    /// Insert a new trader together with its user index entry.
    pub fn insert_trader(&self, trader: &Trader) -> TxResult<()> {
        self.trader_users
            .insert(trader.user_id.as_bytes(), trader.id.as_bytes())?;
        self.put_trader(trader)
    }

    pub fn dispute(&self, id: &str) -> TxResult<Dispute> {
        match self.disputes.get(id.as_bytes())? {
            Some(bytes) => decode(&bytes).or_abort(),
            None => Err(abort(ExchangeError::DisputeNotFound(id.to_string()))),
        }
    }

    pub fn put_dispute(&self, dispute: &Dispute) -> TxResult<()> {
        self.disputes
            .insert(dispute.id.as_bytes(), encode(dispute).or_abort()?)?;
        Ok(())
    }

    pub fn rating(&self, trade_id: &str, user_id: &str) -> TxResult<Option<Rating>> {
        let key = Rating::key(trade_id, user_id);
        match self.ratings.get(key.as_bytes())? {
            Some(bytes) => decode(&bytes).map(Some).or_abort(),
            None => Ok(None),
        }
    }

    pub fn put_rating(&self, rating: &Rating) -> TxResult<()> {
        let key = Rating::key(&rating.trade_id, &rating.from_user_id);
        self.ratings.insert(key.as_bytes(), encode(rating).or_abort()?)?;
        Ok(())
    }

    pub fn record_bond_event(&self, event: &BondEvent) -> TxResult<()> {
        self.bond_events
            .insert(event.key(), encode(event).or_abort()?)?;
        Ok(())
    }

    /// Queue a notification; it becomes visible only if the transaction commits.
    pub fn queue(&self, notification: &Notification) -> TxResult<()> {
        let key = outbox_key(&notification.id).or_abort()?;
        self.outbox.insert(key, encode(notification).or_abort()?)?;
        Ok(())
    }
}

fn outbox_key(id: &str) -> Result<Vec<u8>, ExchangeError> {
    hex::decode(id).map_err(|e| ExchangeError::Validation(format!("bad notification id {id}: {e}")))
}

#[derive(Debug, Clone)]
pub struct TradeStore {
    trades: Tree,
    traders: Tree,
    trader_users: Tree,
    disputes: Tree,
    ratings: Tree,
    bond_events: Tree,
    outbox: Tree,
}

impl TradeStore {
    pub fn open(db: &sled::Db) -> Result<Self, ExchangeError> {
        Ok(Self {
            trades: db.open_tree("trades")?,
            traders: db.open_tree("traders")?,
            trader_users: db.open_tree("trader_users")?,
            disputes: db.open_tree("disputes")?,
            ratings: db.open_tree("ratings")?,
            bond_events: db.open_tree("bond_events")?,
            outbox: db.open_tree("outbox")?,
        })
    }

    /// In-memory store removed on drop. Same code path as the on-disk store.
    pub fn open_temporary() -> Result<Self, ExchangeError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::open(&db)
    }

    /// Run `f` as one all-or-nothing transaction. Only writes made through
    /// `tx` are rolled back on abort, so `f` must not act outside it.
    pub fn transact<T, F>(&self, f: F) -> Result<T, ExchangeError>
    where
        F: Fn(&StoreTx<'_>) -> TxResult<T>,
    {
        let trees = (
            &self.trades,
            &self.traders,
            &self.trader_users,
            &self.disputes,
            &self.ratings,
            &self.bond_events,
            &self.outbox,
        );

        trees
            .transaction(|(trades, traders, trader_users, disputes, ratings, bond_events, outbox)| {
                let tx = StoreTx {
                    trades,
                    traders,
                    trader_users,
                    disputes,
                    ratings,
                    bond_events,
                    outbox,
                };
                f(&tx)
            })
            .map_err(|e| match e {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => ExchangeError::from(err),
            })
    }

    pub fn trade(&self, id: &str) -> Result<Option<Trade>, ExchangeError> {
        get(&self.trades, id.as_bytes())
    }

    pub fn trader(&self, id: &str) -> Result<Option<Trader>, ExchangeError> {
        get(&self.traders, id.as_bytes())
    }

    pub fn trader_by_user(&self, user_id: &str) -> Result<Option<Trader>, ExchangeError> {
        match self.trader_users.get(user_id.as_bytes())? {
            Some(id) => get(&self.traders, &id),
            None => Ok(None),
        }
    }

    pub fn dispute(&self, id: &str) -> Result<Option<Dispute>, ExchangeError> {
        get(&self.disputes, id.as_bytes())
    }

    pub fn rating(&self, trade_id: &str, user_id: &str) -> Result<Option<Rating>, ExchangeError> {
        get(&self.ratings, Rating::key(trade_id, user_id).as_bytes())
    }

    pub fn trades(&self) -> Result<Vec<Trade>, ExchangeError> {
        scan(self.trades.iter())
    }

    pub fn traders(&self) -> Result<Vec<Trader>, ExchangeError> {
        scan(self.traders.iter())
    }

    pub fn disputes(&self) -> Result<Vec<Dispute>, ExchangeError> {
        scan(self.disputes.iter())
    }

    /// Audit log for one trader, oldest first.
    pub fn bond_events(&self, trader_id: &str) -> Result<Vec<BondEvent>, ExchangeError> {
        scan(self.bond_events.scan_prefix(format!("{trader_id}/").as_bytes()))
    }

    /// Outbox contents, oldest first.
    pub fn pending_notifications(&self) -> Result<Vec<Notification>, ExchangeError> {
        scan(self.outbox.iter())
    }

    pub fn ack_notification(&self, id: &str) -> Result<(), ExchangeError> {
        self.outbox.remove(outbox_key(id)?)?;
        Ok(())
    }

    pub fn record_notification_failure(&self, id: &str, error: &str) -> Result<(), ExchangeError> {
        let key = outbox_key(id)?;

        self.outbox
            .transaction(|outbox| {
                let Some(bytes) = outbox.get(&key)? else {
                    // acknowledged by a concurrent retry
                    return Ok(());
                };
                let mut notification: Notification = decode(&bytes).or_abort()?;
                notification.attempts += 1;
                notification.last_error = Some(error.to_string());
                outbox.insert(key.as_slice(), encode(&notification).or_abort()?)?;
                Ok(())
            })
            .map_err(|e| match e {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => ExchangeError::from(err),
            })
    }
}

fn get<T>(tree: &Tree, key: &[u8]) -> Result<Option<T>, ExchangeError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tree.get(key)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

fn scan<T, I>(iter: I) -> Result<Vec<T>, ExchangeError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
    I: Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>,
{
    iter.map(|entry| {
        let (_, bytes) = entry?;
        decode(&bytes)
    })
    .collect()
}
