//! Helpers for time and instrument symbols.
//!
//! Symbol helpers understand the dash-separated derivative naming
//! used by Deribit-style venues:
//!
//! ```text
//! BTC-PERPETUAL          perpetual future
//! ETH-27DEC24            dated future
//! BTC-27DEC24-50000-C    option (expiry, strike, right)
//! ```
//!
//! They are fallbacks for catalog entries that lack structured
//! metadata; the catalog fields take precedence where present.

use chrono::{DateTime, Utc};

use crate::venue::OptionRight;

/// Converts a venue timestamp, falling back to the local clock
/// when absent or out of range.
pub fn timestamp_or_now(ms: Option<i64>) -> DateTime<Utc> {
    ms.and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

/// Leading segment of a symbol.
///
/// Examples:
/// - "BTC-PERPETUAL"  -> "BTC"
/// - "ETH_USDC-PERPETUAL" -> "ETH"
/// - "BTC/USDT:USDT"  -> "BTC"
pub fn base_from_symbol(symbol: &str) -> &str {
    symbol
        .split(['-', '_', '/', ':'])
        .next()
        .unwrap_or(symbol)
}

/// Option right encoded as the last dash-separated segment.
pub fn right_from_symbol(symbol: &str) -> Option<OptionRight> {
    match symbol.rsplit('-').next()? {
        "C" => Some(OptionRight::Call),
        "P" => Some(OptionRight::Put),
        _ => None,
    }
}
