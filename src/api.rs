//! Public payload shapes (§6). Every externally-deserialized payload forbids
//! unknown fields and enforces numeric ranges via `garde`.

use std::collections::HashMap;

use garde::Validate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The fixed default arm set (§4.2). Configuration may add arms at the
/// registry level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Arm {
    EarningsPre,
    PostEventMomo,
    NewsSpike,
    Reactive,
    Skip,
}

impl Arm {
    /// Deterministic tie-break order (§4.2: "tie-break by deterministic arm index order").
    pub const ALL: [Arm; 5] = [
        Arm::EarningsPre,
        Arm::PostEventMomo,
        Arm::NewsSpike,
        Arm::Reactive,
        Arm::Skip,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Arm::EarningsPre => "EARNINGS_PRE",
            Arm::PostEventMomo => "POST_EVENT_MOMO",
            Arm::NewsSpike => "NEWS_SPIKE",
            Arm::Reactive => "REACTIVE",
            Arm::Skip => "SKIP",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Arm> {
        Self::ALL.into_iter().find(|a| a.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Limit,
    Market,
    Trigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Side {
    Long,
    Short,
}

fn validate_unit_range_map(value: &HashMap<String, f64>, _ctx: &()) -> garde::Result {
    for (k, v) in value {
        if !v.is_finite() || !(0.0..=1.0).contains(v) {
            return Err(garde::Error::new(format!(
                "rank_components[{k}] = {v} is not within [0, 1]"
            )));
        }
    }
    Ok(())
}

fn validate_finite_vec(value: &[f64], _ctx: &()) -> garde::Result {
    if value.iter().any(|v| !v.is_finite()) {
        return Err(garde::Error::new("context contains a non-finite value"));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct BacktestKpis {
    #[garde(range(min = 0.0, max = 1.0))]
    pub hit_rate: f64,
    #[garde(custom(|v: &f64, _: &()| if v.is_finite() { Ok(()) } else { Err(garde::Error::new("avg_win must be finite")) }))]
    pub avg_win: f64,
    #[garde(custom(|v: &f64, _: &()| if v.is_finite() { Ok(()) } else { Err(garde::Error::new("avg_loss must be finite")) }))]
    pub avg_loss: f64,
    #[garde(custom(|v: &f64, _: &()| if v.is_finite() { Ok(()) } else { Err(garde::Error::new("max_dd must be finite")) }))]
    pub max_dd: f64,
}

/// `ProposePayload` / `DecisionRequest` (§3, §6). `context` length is asserted
/// against the deployment's pinned `D` outside of `garde` (§3 Rust-native
/// additions) since `D` is a runtime config value, not known to the derive.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct DecisionRequest {
    #[garde(length(min = 1, max = 10))]
    pub ticker: String,
    #[garde(range(min = 0.0001))]
    pub price: f64,
    #[garde(length(min = 1))]
    pub event_type: String,
    #[garde(range(min = 0.0))]
    pub days_to_event: f64,
    #[garde(range(min = 0.0))]
    pub expected_move: f64,
    #[garde(custom(validate_unit_range_map))]
    pub rank_components: HashMap<String, f64>,
    #[garde(dive)]
    pub backtest_kpis: BacktestKpis,
    #[garde(range(min = 0.0))]
    pub liquidity: f64,
    #[garde(range(min = 0.0))]
    pub spread: f64,
    #[serde(default)]
    #[garde(inner(length(min = 1)))]
    pub news_summary: Option<String>,
    #[garde(length(min = 1), custom(validate_finite_vec))]
    pub context: Vec<f64>,
    #[garde(length(min = 1))]
    pub decision_id: String,
}

/// `TradePlan` (§3, §6). `target_prices` resolves the Open Question in favor of
/// an ordered, non-empty list of partial targets.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct TradePlan {
    #[garde(length(min = 1, max = 10))]
    pub ticker: String,
    #[garde(skip)]
    pub entry_type: EntryType,
    #[garde(range(min = 0.0001))]
    pub entry_price: f64,
    #[garde(range(min = 0.0001))]
    pub stop_price: f64,
    #[garde(length(min = 1), inner(range(min = 0.0001)))]
    pub target_prices: Vec<f64>,
    #[garde(range(min = 1, max = 60))]
    pub timeout_days: i32,
    #[garde(range(min = 0.5, max = 1.0))]
    pub confidence: f64,
    #[garde(length(min = 1, max = 280))]
    pub reason: String,
    #[garde(skip)]
    pub schema_version: String,
}

impl TradePlan {
    /// Inferred from the relation between entry and the first target:
    /// `TradePlan` carries no explicit `side` field, so side is derived the
    /// same way the policy validator needs it (§4.4 rule 5).
    pub fn side(&self) -> Side {
        if self.target_prices.first().copied().unwrap_or(self.entry_price) >= self.entry_price {
            Side::Long
        } else {
            Side::Short
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CatalystInfo {
    pub event_type: String,
    pub event_time: chrono::DateTime<chrono::Utc>,
    pub days_to_event: f64,
    pub materiality: f64,
    pub expected_move: f64,
    pub rank: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StrategyInfo {
    pub selected_arm: Arm,
    pub reason: String,
    pub gating_facts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NewsItem {
    pub headline: String,
    pub url: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub sentiment: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PerfStats {
    pub horizon_days: i32,
    pub samples: i64,
    pub hit_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub median_r: Option<f64>,
    pub p90_r: Option<f64>,
    pub max_dd: f64,
    pub limited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MarketContext {
    pub price: f64,
    pub spread: f64,
    pub dollar_adv: f64,
    pub rsi14: Option<f64>,
    pub atr14: Option<f64>,
    pub data_thin: bool,
}

/// `WhySelected` (§3). Always produced, even when the LLM path fails.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WhySelected {
    pub catalyst: CatalystInfo,
    pub strategy: StrategyInfo,
    pub news: Vec<NewsItem>,
    pub history: PerfStats,
    pub market: MarketContext,
    pub llm_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProposeResponse {
    pub selected_arm: Arm,
    pub plan: TradePlan,
    pub decision_id: String,
    pub analysis: WhySelected,
    pub schema_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QuickResponse {
    pub ticker: String,
    pub price: f64,
    pub analysis_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct ValidateMarket {
    #[garde(range(min = 0.0001))]
    pub price: f64,
    #[garde(range(min = 0.0))]
    pub spread: f64,
    #[garde(range(min = 0.0))]
    pub avg_dollar_vol: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct PortfolioContext {
    #[garde(range(min = 0))]
    pub open_positions: i64,
    #[garde(custom(|v: &f64, _: &()| if v.is_finite() { Ok(()) } else { Err(garde::Error::new("realized_pnl_today must be finite")) }))]
    pub realized_pnl_today: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct ValidatePayload {
    #[garde(dive)]
    pub plan: TradePlan,
    #[garde(dive)]
    pub market: ValidateMarket,
    #[garde(dive)]
    pub context: PortfolioContext,
    #[garde(length(min = 1))]
    pub decision_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approved,
    Rejected,
    Review,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PolicyVerdict {
    pub verdict: Verdict,
    pub reason: String,
    pub adjusted_size: i64,
    pub decision_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct RewardPayload {
    #[garde(skip)]
    pub arm_name: Arm,
    #[garde(length(min = 1), custom(validate_finite_vec))]
    pub context: Vec<f64>,
    #[garde(range(min = -1.0, max = 1.0))]
    pub reward: f64,
    #[garde(length(min = 1))]
    pub decision_id: String,
    #[serde(default)]
    #[garde(skip)]
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RewardStatus {
    Ok,
    DuplicateIgnored,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RewardResponse {
    pub status: RewardStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BanditLogEntry {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub arm_name: Arm,
    pub context: Vec<f64>,
    pub reward: f64,
    pub decision_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArmStats {
    pub arm_name: Arm,
    pub count: i64,
    pub avg_reward: f64,
    pub min_reward: f64,
    pub max_reward: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BanditStats {
    pub total: i64,
    pub arm_stats: Vec<ArmStats>,
}

pub const SCHEMA_VERSION: &str = "ProposeResponseV1";

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> DecisionRequest {
        DecisionRequest {
            ticker: "AAPL".to_string(),
            price: 192.50,
            event_type: "EARNINGS".to_string(),
            days_to_event: 7.0,
            expected_move: 0.04,
            rank_components: HashMap::from([("momentum".to_string(), 0.6)]),
            backtest_kpis: BacktestKpis {
                hit_rate: 0.55,
                avg_win: 1.2,
                avg_loss: -0.8,
                max_dd: -0.15,
            },
            liquidity: 5_000_000_000.0,
            spread: 0.01,
            news_summary: None,
            context: vec![0.6, 0.6, 1.0, 0.4, 0.5, 0.04, 7.0],
            decision_id: "d1".to_string(),
        }
    }

    #[test]
    fn decision_request_accepts_spec_example() {
        assert!(valid_request().validate().is_ok());
    }

    #[test]
    fn decision_request_rejects_out_of_range_rank_component() {
        let mut r = valid_request();
        r.rank_components.insert("bad".to_string(), 1.5);
        assert!(r.validate().is_err());
    }

    #[test]
    fn decision_request_rejects_empty_decision_id() {
        let mut r = valid_request();
        r.decision_id = String::new();
        assert!(r.validate().is_err());
    }

    #[test]
    fn reward_payload_rejects_out_of_range_reward() {
        let p = RewardPayload {
            arm_name: Arm::PostEventMomo,
            context: vec![0.1; 7],
            reward: 1.5,
            decision_id: "d1".to_string(),
            meta: None,
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn arm_round_trips_through_str() {
        for arm in Arm::ALL {
            assert_eq!(Arm::from_str_loose(arm.as_str()), Some(arm));
        }
    }

    #[test]
    fn trade_plan_side_inferred_from_target() {
        let long = TradePlan {
            ticker: "AAPL".to_string(),
            entry_type: EntryType::Limit,
            entry_price: 100.0,
            stop_price: 98.0,
            target_prices: vec![103.0],
            timeout_days: 5,
            confidence: 0.5,
            reason: "x".to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
        };
        assert_eq!(long.side(), Side::Long);
    }
}
