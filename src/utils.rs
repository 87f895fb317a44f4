//! Identifier generation

use crate::error::ExchangeError;
use bech32::Bech32m;
use uuid7::uuid7;

pub const TRADE_HRP: &str = "trade_";
pub const TRADER_HRP: &str = "trader_";
pub const DISPUTE_HRP: &str = "dispute_";

// construct a unique, time ordered id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Entity id for one of the fixed prefixes above.
pub(crate) fn new_id(hrp: &str) -> Result<String, ExchangeError> {
    new_uuid_to_bech32(hrp)
        .map_err(|e| ExchangeError::invariant(format!("id generation for {hrp} failed: {e}")))
}
