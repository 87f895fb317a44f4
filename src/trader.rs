use crate::bond::BondAccount;
use crate::error::ExchangeError;
use crate::trade::{CurrencyCode, TimeStamp};
use chrono::Utc;
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraderStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Active,
    #[n(2)]
    Suspended,
    #[n(3)]
    Rejected,
}

impl TraderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraderStatus::Pending => "pending",
            TraderStatus::Active => "active",
            TraderStatus::Suspended => "suspended",
            TraderStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for TraderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A currency pair a trader serves, with their rates and per-trade limits.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Corridor {
    #[n(0)]
    pub from: CurrencyCode,
    #[n(1)]
    pub to: CurrencyCode,
    #[n(2)]
    pub buy_rate: u64, // RATE_SCALE fixed point
    #[n(3)]
    pub sell_rate: u64,
    #[n(4)]
    pub min_amount: u64,
    #[n(5)]
    pub max_amount: u64,
}

impl Corridor {
    pub fn new(
        from: &str,
        to: &str,
        buy_rate: u64,
        sell_rate: u64,
        min_amount: u64,
        max_amount: u64,
    ) -> Result<Self, ExchangeError> {
        let corridor = Self {
            from: CurrencyCode::parse(from)?,
            to: CurrencyCode::parse(to)?,
            buy_rate,
            sell_rate,
            min_amount,
            max_amount,
        };
        corridor.validate()?;
        Ok(corridor)
    }

    pub fn validate(&self) -> Result<(), ExchangeError> {
        if self.from == self.to {
            return Err(ExchangeError::Validation(format!(
                "corridor {}->{} uses the same currency twice",
                self.from, self.to
            )));
        }
        if self.buy_rate == 0 || self.sell_rate == 0 {
            return Err(ExchangeError::InvalidAmount("corridor rate is zero".into()));
        }
        if self.min_amount == 0 || self.min_amount > self.max_amount {
            return Err(ExchangeError::InvalidAmount(format!(
                "corridor limits [{}, {}] are not a valid range",
                self.min_amount, self.max_amount
            )));
        }
        Ok(())
    }

    pub fn serves(&self, from: &CurrencyCode, to: &CurrencyCode) -> bool {
        &self.from == from && &self.to == to
    }

    pub fn accepts(&self, amount: u64) -> bool {
        (self.min_amount..=self.max_amount).contains(&amount)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Trader {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub user_id: String, // identity reference, authentication lives elsewhere
    #[n(2)]
    pub status: TraderStatus,
    #[n(3)]
    pub bond: BondAccount,
    #[n(4)]
    pub corridors: Vec<Corridor>,
    #[n(5)]
    pub rating_sum: u64,
    #[n(6)]
    pub rating_count: u64,
    #[n(7)]
    pub completed_trades: u64,
    #[n(8)]
    pub is_online: bool,
    #[n(9)]
    pub approved_by: Option<String>,
    #[n(10)]
    pub approved_at: Option<TimeStamp<Utc>>,
    #[n(11)]
    pub status_reason: Option<String>,
    #[n(12)]
    pub created_at: TimeStamp<Utc>,
}

impl Trader {
    pub fn new(id: String, user_id: String, corridors: Vec<Corridor>) -> Self {
        Self {
            id,
            user_id,
            status: TraderStatus::Pending,
            bond: BondAccount::default(),
            corridors,
            rating_sum: 0,
            rating_count: 0,
            completed_trades: 0,
            is_online: false,
            approved_by: None,
            approved_at: None,
            status_reason: None,
            created_at: TimeStamp::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TraderStatus::Active
    }

    /// Average score in hundredths (`450` is 4.50), `None` before the first rating.
    pub fn rating_x100(&self) -> Option<u64> {
        (self.rating_count > 0).then(|| self.rating_sum * 100 / self.rating_count)
    }

    pub fn corridor(&self, from: &CurrencyCode, to: &CurrencyCode) -> Option<&Corridor> {
        self.corridors.iter().find(|c| c.serves(from, to))
    }

    /// The corridor that would carry `amount` from `from` to `to`.
    pub fn corridor_for(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        amount: u64,
    ) -> Result<&Corridor, ExchangeError> {
        self.corridor(from, to)
            .filter(|c| c.accepts(amount))
            .ok_or_else(|| ExchangeError::CorridorUnavailable {
                from: from.to_string(),
                to: to.to_string(),
                amount,
            })
    }

    pub(crate) fn record_rating(&mut self, score: u8) {
        self.rating_sum += u64::from(score);
        self.rating_count += 1;
    }

    /// Admin status changes. Returns the error for an illegal change.
    pub(crate) fn transition(
        &mut self,
        to: TraderStatus,
        action: &'static str,
    ) -> Result<(), ExchangeError> {
        use TraderStatus::*;

        let legal = matches!(
            (self.status, to),
            (Pending, Active) | (Suspended, Active) | (Pending, Rejected) | (Active, Suspended)
        );
        if !legal {
            return Err(ExchangeError::InvalidTraderState {
                status: self.status,
                action,
            });
        }
        self.status = to;
        Ok(())
    }
}

pub fn validate_corridors(corridors: &[Corridor]) -> Result<(), ExchangeError> {
    for (i, corridor) in corridors.iter().enumerate() {
        corridor.validate()?;
        if corridors[..i].iter().any(|c| c.serves(&corridor.from, &corridor.to)) {
            return Err(ExchangeError::Validation(format!(
                "corridor {}->{} listed twice",
                corridor.from, corridor.to
            )));
        }
    }
    Ok(())
}
