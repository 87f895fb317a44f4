//! Tunables for the exchange core. Defaults match what the platform runs with.
use crate::error::ExchangeError;
use chrono::Duration;

/// Collateral locked per trade, in basis points of the send amount (100%).
pub const DEFAULT_COLLATERAL_RATIO_BPS: u32 = 10_000;

/// Upper bound on the collateral ratio (1000%).
pub const MAX_COLLATERAL_RATIO_BPS: u32 = 100_000;

/// Pending trades older than this are swept to cancelled.
pub const DEFAULT_PENDING_EXPIRY_HOURS: i64 = 24;

pub const DEFAULT_MAX_NOTIFICATION_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeConfig {
    collateral_ratio_bps: u32,
    pending_expiry: Duration,
    max_notification_attempts: u32,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            collateral_ratio_bps: DEFAULT_COLLATERAL_RATIO_BPS,
            pending_expiry: Duration::hours(DEFAULT_PENDING_EXPIRY_HOURS),
            max_notification_attempts: DEFAULT_MAX_NOTIFICATION_ATTEMPTS,
        }
    }
}

impl ExchangeConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_collateral_ratio_bps(mut self, bps: u32) -> Self {
        self.collateral_ratio_bps = bps;
        self
    }
    pub fn set_pending_expiry(mut self, expiry: Duration) -> Self {
        self.pending_expiry = expiry;
        self
    }
    pub fn set_max_notification_attempts(mut self, attempts: u32) -> Self {
        self.max_notification_attempts = attempts;
        self
    }

    pub fn collateral_ratio_bps(&self) -> u32 {
        self.collateral_ratio_bps
    }
    pub fn pending_expiry(&self) -> Duration {
        self.pending_expiry
    }
    pub fn max_notification_attempts(&self) -> u32 {
        self.max_notification_attempts
    }

    pub fn validate(&self) -> Result<(), ExchangeError> {
        if !(1..=MAX_COLLATERAL_RATIO_BPS).contains(&self.collateral_ratio_bps) {
            return Err(ExchangeError::Validation(format!(
                "collateral ratio {} bps outside 1..={MAX_COLLATERAL_RATIO_BPS}",
                self.collateral_ratio_bps
            )));
        }
        if self.pending_expiry <= Duration::zero() {
            return Err(ExchangeError::Validation(
                "pending expiry must be positive".into(),
            ));
        }
        if self.max_notification_attempts == 0 {
            return Err(ExchangeError::Validation(
                "max notification attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
