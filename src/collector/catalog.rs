use std::collections::BTreeMap;

use crate::util;
use crate::venue::{MarketInfo, MarketType, Markets, OptionRight};

/// Instrument catalog split into futures and options.
///
/// Entries of any other type are counted but not kept. Ordered
/// maps give every query a stable, sorted result.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    futures: BTreeMap<String, MarketInfo>,
    options: BTreeMap<String, MarketInfo>,
    skipped: usize,
}

impl Catalog {
    pub fn partition(markets: Markets) -> Self {
        let mut catalog = Catalog::default();
        for (symbol, market) in markets {
            match market.market_type {
                MarketType::Future => {
                    catalog.futures.insert(symbol, market);
                }
                MarketType::Option => {
                    catalog.options.insert(symbol, market);
                }
                MarketType::Other(_) => catalog.skipped += 1,
            }
        }
        catalog
    }

    pub fn futures_len(&self) -> usize {
        self.futures.len()
    }

    pub fn options_len(&self) -> usize {
        self.options.len()
    }

    /// Catalog entries that were neither future nor option.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn get(&self, symbol: &str) -> Option<&MarketInfo> {
        self.futures.get(symbol).or_else(|| self.options.get(symbol))
    }

    pub fn futures(&self, base: Option<&str>) -> Vec<String> {
        self.futures
            .values()
            .filter(|m| base.is_none_or(|b| has_base(m, b)))
            .map(|m| m.symbol.clone())
            .collect()
    }

    pub fn options(
        &self,
        base: Option<&str>,
        right: Option<OptionRight>,
        expiry: Option<&str>,
    ) -> Vec<String> {
        self.options
            .values()
            .filter(|m| base.is_none_or(|b| has_base(m, b)))
            .filter(|m| right.is_none_or(|r| right_of(m) == Some(r)))
            .filter(|m| expiry.is_none_or(|e| m.symbol.contains(e)))
            .map(|m| m.symbol.clone())
            .collect()
    }
}

fn has_base(market: &MarketInfo, base: &str) -> bool {
    let actual = market
        .base_currency
        .as_deref()
        .unwrap_or_else(|| util::base_from_symbol(&market.symbol));
    actual.eq_ignore_ascii_case(base)
}

fn right_of(market: &MarketInfo) -> Option<OptionRight> {
    market
        .option_right
        .or_else(|| util::right_from_symbol(&market.symbol))
}
