//! Deployment configuration. `PolicyParams` is the single source of truth shared
//! by the fact synthesizer's `gating_facts` and the policy validator (§9's fix for
//! the "cyclic entanglement" pattern) — both read the same struct, never a copy.

use std::path::PathBuf;
use std::time::Duration;

/// Hard-rule and sizing thresholds. Cheap to `Clone`; constructed once at startup
/// and shared by `Arc` from the `Registry`.
#[derive(Debug, Clone)]
pub struct PolicyParams {
    pub max_ticket: f64,
    pub max_positions: i64,
    pub max_per_trade_loss: f64,
    pub daily_kill_switch: f64,
    pub spread_cents_max: f64,
    pub spread_bps_max: f64,
    pub slippage_bps: f64,
    pub pct_adv_cap: f64,
    pub min_dollar_adv: f64,
    /// Max allowed drift of `plan.entry_price` from `market.price`, in bps of
    /// market price (§3's "entry within a bounded distance of market price").
    pub max_entry_drift_bps: f64,
}

impl PolicyParams {
    pub fn from_env() -> Self {
        Self {
            max_ticket: env_f64("MAX_TICKET", 5_000.0),
            max_positions: env_i64("MAX_POSITIONS", 10),
            max_per_trade_loss: env_f64("MAX_PER_TRADE_LOSS", 250.0),
            daily_kill_switch: env_f64("DAILY_KILL_SWITCH", -1_000.0),
            spread_cents_max: env_f64("SPREAD_CENTS_MAX", 0.05),
            spread_bps_max: env_f64("SPREAD_BPS_MAX", 50.0),
            slippage_bps: env_f64("SLIPPAGE_BPS", 10.0),
            pct_adv_cap: env_f64("PCT_ADV_CAP", 0.05),
            min_dollar_adv: env_f64("MIN_DOLLAR_ADV", 1_000_000.0),
            max_entry_drift_bps: env_f64("MAX_ENTRY_DRIFT_BPS", 200.0),
        }
    }
}

impl Default for PolicyParams {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Bandit hyperparameters, LLM call budget, and storage locations.
#[derive(Debug, Clone)]
pub struct Config {
    pub context_dim: usize,
    pub bandit_lambda: f64,
    pub bandit_exploration_nu: f64,
    pub llm_max_retries: u32,
    pub llm_timeout: Duration,
    pub llm_debug: bool,
    pub llm_success_sample_rate: f64,
    pub news_max_items: usize,
    pub propose_budget: Duration,
    pub data_root: PathBuf,
    /// Deployment-wide stand-ins for the sample count and horizon behind every
    /// request's `backtest_kpis` — the request schema carries aggregate KPIs
    /// only, no per-call sample count, so the synthesizer treats both as fixed
    /// constants rather than inventing an unrequested request field.
    pub perf_stats_samples: i64,
    pub perf_stats_horizon_days: i32,
}

impl Config {
    pub fn from_env() -> Self {
        let data_root = match std::env::var("DATA_ROOT") {
            Ok(v) => PathBuf::from(v),
            Err(_) => default_data_root(),
        };
        Self {
            context_dim: env_usize("CONTEXT_DIM", 7),
            bandit_lambda: env_f64("BANDIT_LAMBDA", 1.0),
            bandit_exploration_nu: env_f64("BANDIT_EXPLORATION_NU", 1.0),
            llm_max_retries: env_u32("LLM_MAX_RETRIES", 2),
            llm_timeout: Duration::from_secs_f64(env_f64("LLM_TIMEOUT_S", 12.0)),
            llm_debug: std::env::var("LLM_DEBUG").as_deref() == Ok("1"),
            llm_success_sample_rate: env_f64("LLM_SUCCESS_SAMPLE_RATE", 0.08),
            news_max_items: env_usize("NEWS_MAX_ITEMS", 5),
            propose_budget: Duration::from_secs_f64(env_f64("PROPOSE_BUDGET_S", 15.0)),
            data_root,
            perf_stats_samples: env_i64("PERF_STATS_SAMPLES", 60),
            perf_stats_horizon_days: env_i64("PERF_STATS_HORIZON_DAYS", 5) as i32,
        }
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.data_root.join("decisions.sqlite3")
    }

    pub fn snapshot_path(&self, dim: usize) -> PathBuf {
        self.data_root.join(format!("bandit_d{dim}.json"))
    }

    pub fn llm_artifact_dir(&self) -> PathBuf {
        self.data_root.join("llm_artifacts")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn default_data_root() -> PathBuf {
    dirs_home().join(".catalyst-desk")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
