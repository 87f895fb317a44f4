//! Trade requests and the persisted trade record
use crate::dispute::Resolution;
use crate::error::ExchangeError;
use crate::lifecycle::TradeStatus;
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;

/// Exchange rates are fixed-point with six decimal places.
pub const RATE_SCALE: u64 = 1_000_000;

/// ISO-4217 style code (`XAF`, `NGN`) or a stablecoin ticker (`USDT`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn parse(code: &str) -> Result<Self, ExchangeError> {
        let valid_len = (3..=5).contains(&code.len());
        let starts_alpha = code.chars().next().is_some_and(|c| c.is_ascii_uppercase());
        let charset = code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());

        if valid_len && starts_alpha && charset {
            Ok(Self(code.to_string()))
        } else {
            Err(ExchangeError::Validation(format!(
                "'{code}' is not a currency code"
            )))
        }
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<C> minicbor::Encode<C> for CurrencyCode {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.0)?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for CurrencyCode {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let code = d.str()?;

        CurrencyCode::parse(code)
            .map_err(|_| minicbor::decode::Error::message("stored currency code is malformed"))
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Who receives the payout on the receiving side.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipient {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub phone: Option<String>,
    #[n(2)]
    pub method: Option<String>, // bank / mobile money label, validated elsewhere
}

impl Recipient {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
    pub fn with_phone(mut self, phone: &str) -> Self {
        self.phone = Some(phone.to_string());
        self
    }
    pub fn with_method(mut self, method: &str) -> Self {
        self.method = Some(method.to_string());
        self
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    #[n(0)]
    DeclinedByTrader,
    #[n(1)]
    CancelledByUser,
    #[n(2)]
    Expired,
    #[n(3)]
    DisputeFavoredUser,
}

/// Draft of a trade request. Fields are filled builder style and checked
/// by [`TradeRequest::validate`] before anything is persisted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TradeRequest {
    user_id: Option<String>,
    trader_id: Option<String>,
    send_currency: Option<String>,
    send_amount: u64,
    receive_currency: Option<String>,
    receive_amount: u64,
    rate: u64, // scaled by RATE_SCALE
    recipient: Option<Recipient>,
}

/// A request that passed validation; the only input `create_trade` accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidTradeRequest {
    pub user_id: String,
    pub trader_id: String,
    pub send_currency: CurrencyCode,
    pub send_amount: u64,
    pub receive_currency: CurrencyCode,
    pub receive_amount: u64,
    pub rate: u64,
    pub recipient: Recipient,
}

impl TradeRequest {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }
    pub fn set_trader(mut self, trader_id: &str) -> Self {
        self.trader_id = Some(trader_id.to_string());
        self
    }
    pub fn set_send(mut self, currency: &str, amount: u64) -> Self {
        self.send_currency = Some(currency.to_string());
        self.send_amount = amount;
        self
    }
    pub fn set_receive(mut self, currency: &str, amount: u64) -> Self {
        self.receive_currency = Some(currency.to_string());
        self.receive_amount = amount;
        self
    }
    pub fn set_rate(mut self, rate: u64) -> Self {
        self.rate = rate;
        self
    }
    pub fn set_recipient(mut self, recipient: Recipient) -> Self {
        self.recipient = Some(recipient);
        self
    }

    pub fn validate(&self) -> Result<ValidTradeRequest, ExchangeError> {
        let user_id = non_empty(self.user_id.as_deref(), "user id")?;
        let trader_id = non_empty(self.trader_id.as_deref(), "trader id")?;

        let send_currency = CurrencyCode::parse(non_empty(
            self.send_currency.as_deref(),
            "send currency",
        )?)?;
        let receive_currency = CurrencyCode::parse(non_empty(
            self.receive_currency.as_deref(),
            "receive currency",
        )?)?;
        if send_currency == receive_currency {
            return Err(ExchangeError::Validation(
                "send and receive currency must differ".into(),
            ));
        }

        if self.send_amount == 0 {
            return Err(ExchangeError::InvalidAmount("send amount is zero".into()));
        }
        if self.receive_amount == 0 {
            return Err(ExchangeError::InvalidAmount("receive amount is zero".into()));
        }
        if self.rate == 0 {
            return Err(ExchangeError::InvalidAmount("exchange rate is zero".into()));
        }

        let recipient = self
            .recipient
            .clone()
            .ok_or_else(|| ExchangeError::Validation("recipient is missing".into()))?;
        non_empty(Some(recipient.name.as_str()), "recipient name")?;

        Ok(ValidTradeRequest {
            user_id: user_id.to_string(),
            trader_id: trader_id.to_string(),
            send_currency,
            send_amount: self.send_amount,
            receive_currency,
            receive_amount: self.receive_amount,
            rate: self.rate,
            recipient,
        })
    }
}

fn non_empty<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, ExchangeError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ExchangeError::Validation(format!("{field} is required"))),
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub user_id: String,
    #[n(2)]
    pub trader_id: String,
    #[n(3)]
    pub send_currency: CurrencyCode,
    #[n(4)]
    pub send_amount: u64,
    #[n(5)]
    pub receive_currency: CurrencyCode,
    #[n(6)]
    pub receive_amount: u64,
    #[n(7)]
    pub rate: u64,
    #[n(8)]
    pub recipient: Recipient,
    #[n(9)]
    pub status: TradeStatus,
    #[n(10)]
    pub bond_locked: u64, // snapshot taken at acceptance, never re-derived
    #[n(11)]
    pub payment_reference: Option<String>,
    #[n(12)]
    pub payment_proof_url: Option<String>,
    #[n(13)]
    pub dispute_id: Option<String>,
    #[n(14)]
    pub resolution: Option<Resolution>,
    #[n(15)]
    pub cancel_reason: Option<CancelReason>,
    #[n(16)]
    pub created_at: TimeStamp<Utc>,
    #[n(17)]
    pub accepted_at: Option<TimeStamp<Utc>>,
    #[n(18)]
    pub paid_at: Option<TimeStamp<Utc>>,
    #[n(19)]
    pub delivered_at: Option<TimeStamp<Utc>>,
    #[n(20)]
    pub completed_at: Option<TimeStamp<Utc>>,
    #[n(21)]
    pub cancelled_at: Option<TimeStamp<Utc>>,
    #[n(22)]
    pub disputed_at: Option<TimeStamp<Utc>>,
}

impl Trade {
    pub fn new(id: String, request: ValidTradeRequest, created_at: TimeStamp<Utc>) -> Self {
        Self {
            id,
            user_id: request.user_id,
            trader_id: request.trader_id,
            send_currency: request.send_currency,
            send_amount: request.send_amount,
            receive_currency: request.receive_currency,
            receive_amount: request.receive_amount,
            rate: request.rate,
            recipient: request.recipient,
            status: TradeStatus::Pending,
            bond_locked: 0,
            payment_reference: None,
            payment_proof_url: None,
            dispute_id: None,
            resolution: None,
            cancel_reason: None,
            created_at,
            accepted_at: None,
            paid_at: None,
            delivered_at: None,
            completed_at: None,
            cancelled_at: None,
            disputed_at: None,
        }
    }

    /// Stamp the timestamp belonging to `status` once the trade reaches it.
    pub(crate) fn stamp(&mut self, status: TradeStatus, at: TimeStamp<Utc>) {
        let slot = match status {
            TradeStatus::Pending => return,
            TradeStatus::Accepted => &mut self.accepted_at,
            TradeStatus::Paid => &mut self.paid_at,
            TradeStatus::Delivering => &mut self.delivered_at,
            TradeStatus::Completed => &mut self.completed_at,
            TradeStatus::Disputed => &mut self.disputed_at,
            TradeStatus::Cancelled => &mut self.cancelled_at,
        };
        *slot = Some(at);
    }
}
