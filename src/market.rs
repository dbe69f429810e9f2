//! `MarketData` collaborator contract (§2, §4.1). This module only defines the
//! interface and the indicator math the fact synthesizer calls against it;
//! wiring a real vendor feed behind it is out of scope — interfaces only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::AppResult;

#[derive(Debug, Clone, Copy)]
pub struct OhlcBar {
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    pub fn spread(&self) -> f64 {
        (self.ask - self.bid).max(0.0)
    }
}

/// One method per collaborator need, implementations swappable behind
/// `Arc<dyn MarketData>`.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn quote(&self, ticker: &str) -> AppResult<Quote>;

    /// Most recent bars, oldest first. Implementations should return as many as
    /// they have up to `lookback`, never pad or fabricate.
    async fn history(&self, ticker: &str, lookback: usize) -> AppResult<Vec<OhlcBar>>;
}

/// Always-sentinel implementation used when no real feed is configured. The fact
/// synthesizer treats its `AppError` the same as any other collaborator failure:
/// sentinels in, `data_thin` flag set, never raises.
pub struct UnavailableMarketData;

#[async_trait]
impl MarketData for UnavailableMarketData {
    async fn quote(&self, ticker: &str) -> AppResult<Quote> {
        Err(crate::errors::AppError::internal(format!(
            "no market data provider configured for {ticker}"
        )))
    }

    async fn history(&self, ticker: &str, _lookback: usize) -> AppResult<Vec<OhlcBar>> {
        Err(crate::errors::AppError::internal(format!(
            "no market data provider configured for {ticker}"
        )))
    }
}

pub const RSI_ATR_PERIOD: usize = 14;
pub const HISTORY_LOOKBACK: usize = 30;
pub const MIN_BARS_FOR_INDICATORS: usize = 20;

/// Computed market-context indicators, before they're wrapped into the
/// API-facing `MarketContext` (which also carries price/spread/dollar_adv and a
/// `data_thin` flag the caller sets from bar count).
pub struct Indicators {
    pub rsi14: Option<f64>,
    pub atr14: Option<f64>,
    pub dollar_adv: f64,
}

/// RSI(14)/ATR(14) over the trailing window, and ADV as mean(close * volume).
/// `bars` must be oldest-first. Returns `None` indicators (never panics) when
/// there isn't enough history, an `n < period` short-circuit rather than a
/// computation over a padded or fabricated series.
pub fn compute_indicators(bars: &[OhlcBar]) -> Indicators {
    if bars.len() < MIN_BARS_FOR_INDICATORS {
        let dollar_adv = mean_dollar_volume(bars);
        return Indicators { rsi14: None, atr14: None, dollar_adv };
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();

    let rsi14 = rust_ti::standard_indicators::bulk::rsi(&closes).last().copied();

    let atr14 = if closes.len() >= RSI_ATR_PERIOD {
        let start = closes.len() - RSI_ATR_PERIOD;
        Some(rust_ti::other_indicators::single::average_true_range(
            &closes[start..],
            &highs[start..],
            &lows[start..],
            rust_ti::ConstantModelType::SimpleMovingAverage,
        ))
    } else {
        None
    };

    Indicators { rsi14, atr14, dollar_adv: mean_dollar_volume(bars) }
}

fn mean_dollar_volume(bars: &[OhlcBar]) -> f64 {
    if bars.is_empty() {
        return 0.0;
    }
    let sum: f64 = bars.iter().map(|b| b.close * b.volume).sum();
    sum / bars.len() as f64
}

/// Derives an event time `days_to_event` trading days from `now`, skipping
/// weekends (§4.1: "derive from now + days_to_event on a trading-day calendar,
/// skip weekends/known holidays"). Holiday calendars vary by market and are out
/// of scope here; weekends are the only fixed rule applied.
pub fn derive_event_time(now: DateTime<Utc>, days_to_event: f64) -> DateTime<Utc> {
    use chrono::Datelike;
    let whole_days = days_to_event.round().max(0.0) as i64;
    let mut remaining = whole_days;
    let mut cursor = now;
    while remaining > 0 {
        cursor += chrono::Duration::days(1);
        let is_weekend = matches!(cursor.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun);
        if !is_weekend {
            remaining -= 1;
        }
    }
    cursor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(close: f64) -> OhlcBar {
        OhlcBar { close, high: close * 1.01, low: close * 0.99, volume: 1_000_000.0 }
    }

    #[test]
    fn insufficient_history_yields_sentinels_not_panic() {
        let bars: Vec<OhlcBar> = (0..5).map(|i| bar(100.0 + i as f64)).collect();
        let ind = compute_indicators(&bars);
        assert!(ind.rsi14.is_none());
        assert!(ind.atr14.is_none());
        assert!(ind.dollar_adv > 0.0);
    }

    #[test]
    fn sufficient_history_computes_indicators() {
        let bars: Vec<OhlcBar> = (0..30).map(|i| bar(100.0 + (i as f64 * 0.3).sin() * 5.0)).collect();
        let ind = compute_indicators(&bars);
        assert!(ind.rsi14.is_some());
        assert!(ind.atr14.is_some());
        let rsi = ind.rsi14.unwrap();
        assert!((0.0..=100.0).contains(&rsi));
    }

    #[test]
    fn event_time_skips_weekends() {
        // 2026-07-28 is a Tuesday.
        let now = DateTime::parse_from_rfc3339("2026-07-28T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        // 5 trading days ahead should land on the following Tuesday (skipping one weekend).
        let event = derive_event_time(now, 5.0);
        use chrono::Datelike;
        assert_ne!(event.weekday(), chrono::Weekday::Sat);
        assert_ne!(event.weekday(), chrono::Weekday::Sun);
    }
}
