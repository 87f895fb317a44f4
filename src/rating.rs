use crate::error::ExchangeError;
use crate::trade::TimeStamp;
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Rating {
    #[n(0)]
    pub trade_id: String,
    #[n(1)]
    pub from_user_id: String,
    #[n(2)]
    pub to_trader_id: String,
    #[n(3)]
    pub score: u8,
    #[n(4)]
    pub comment: Option<String>,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
}

impl Rating {
    pub fn validate_score(score: u8) -> Result<u8, ExchangeError> {
        if (1..=5).contains(&score) {
            Ok(score)
        } else {
            Err(ExchangeError::Validation(format!(
                "rating must be between 1 and 5, got {score}"
            )))
        }
    }

    pub(crate) fn key(trade_id: &str, user_id: &str) -> String {
        format!("{trade_id}/{user_id}")
    }
}
