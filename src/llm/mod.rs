//! LLM Advisor (§4.3): prompt assembly, strict schema validation with light
//! repairs, retry with backoff, versioned artifact capture, deterministic
//! fallback. The retry loop is hand-rolled rather than built on a generic retry
//! crate — the backoff formula and failure classification are both contractual,
//! so a bespoke loop keeps the failure-mode-to-variant mapping explicit (§9's
//! "exceptions for control flow" redesign flag: branch on an enum, not a caught
//! exception).

mod client;

pub use client::{HttpLlmClient, StubLlmClient};

use std::hash::Hasher;
use std::sync::Arc;

use async_trait::async_trait;
use garde::Validate;
use rustc_hash::FxHasher;
use tracing::warn;

use crate::api::{EntryType, TradePlan};
use crate::config::{Config, PolicyParams};
use crate::errors::LlmFailureKind;

pub const PROMPT_VERSION: &str = "catalyst-desk-prompt-v1";
pub const SCHEMA_VERSION: &str = "ProposeResponseV1";
pub const VALIDATOR_VERSION: &str = "garde-0.22-v1";
/// `TradePlan::reason` on every fallback plan — the orchestrator compares
/// against this to tell a fallback from an LLM-authored plan without a
/// separate out-of-band flag (§4.3 Rust-native additions).
pub const FALLBACK_REASON: &str = "LLM unavailable — fallback plan";

#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub model_id: String,
}

/// Raw model output, before light repairs and schema validation.
#[derive(Debug, Clone)]
pub struct RawPlan(pub String);

#[derive(Debug, Clone)]
pub struct LlmError {
    pub kind: LlmFailureKind,
    pub message: String,
}

impl LlmError {
    pub fn new(kind: LlmFailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn propose_plan(&self, prompt: &Prompt) -> Result<RawPlan, LlmError>;
    fn model_id(&self) -> &str;
}

/// Builds the versioned prompt from facts computed upstream — only numeric
/// facts and the constraint envelope, never free text beyond `news_summary`
/// and the arm's name (§4.3).
pub fn build_prompt(
    ticker: &str,
    price: f64,
    arm_name: &str,
    expected_move: f64,
    days_to_event: f64,
    rsi14: Option<f64>,
    atr14: Option<f64>,
    news_summary: Option<&str>,
    params: &PolicyParams,
    model_id: &str,
) -> Prompt {
    let system = format!(
        "You are a trading-plan assistant ({PROMPT_VERSION}). Respond with a single JSON object \
         matching the TradePlan schema exactly: entry_type (limit|market|trigger), entry_price, \
         stop_price, target_prices (non-empty array), timeout_days (1-60), confidence (0.5-1.0), \
         reason (<=280 chars), schema_version (\"{SCHEMA_VERSION}\"). No extra fields. No prose \
         outside the JSON object."
    );
    let user = format!(
        "ticker={ticker} price={price:.4} arm={arm_name} expected_move={expected_move:.4} \
         days_to_event={days_to_event:.1} rsi14={} atr14={} news_summary={} \
         max_ticket={:.2} max_per_trade_loss={:.2} spread_cents_max={:.4} slippage_bps={:.2}",
        rsi14.map_or("n/a".to_string(), |v| format!("{v:.2}")),
        atr14.map_or("n/a".to_string(), |v| format!("{v:.2}")),
        news_summary.unwrap_or("none"),
        params.max_ticket,
        params.max_per_trade_loss,
        params.spread_cents_max,
        params.slippage_bps,
    );
    Prompt { system, user, model_id: model_id.to_string() }
}

/// Strip ```-fenced code blocks and trailing commas before JSON parsing —
/// the only repairs attempted before giving up on an attempt (§4.3).
fn light_repair(raw: &str) -> String {
    let trimmed = raw.trim();
    let unfenced = if trimmed.starts_with("```") {
        trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
    } else {
        trimmed
    };
    // Trailing commas before a closing brace/bracket.
    let mut out = String::with_capacity(unfenced.len());
    let chars: Vec<char> = unfenced.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn parse_and_validate(raw: &str) -> Result<TradePlan, LlmError> {
    let repaired = light_repair(raw);
    let value: serde_json::Value = serde_json::from_str(&repaired)
        .map_err(|e| LlmError::new(LlmFailureKind::Format, format!("not valid JSON: {e}")))?;
    let plan: TradePlan = serde_json::from_value(value)
        .map_err(|e| LlmError::new(LlmFailureKind::Schema, format!("schema mismatch: {e}")))?;
    plan.validate()
        .map_err(|e| LlmError::new(LlmFailureKind::Schema, format!("constraint violation: {e}")))?;
    Ok(plan)
}

/// Entry = 0.995*price, stop = 0.98*price, target = 1.03*price, timeout = 5d,
/// confidence = 0.5 (§4.3). Always a valid `TradePlan`.
pub fn fallback_plan(ticker: &str, price: f64) -> TradePlan {
    TradePlan {
        ticker: ticker.to_string(),
        entry_type: EntryType::Limit,
        entry_price: price * 0.995,
        stop_price: price * 0.98,
        target_prices: vec![price * 1.03],
        timeout_days: 5,
        confidence: 0.5,
        reason: FALLBACK_REASON.to_string(),
        schema_version: SCHEMA_VERSION.to_string(),
    }
}

fn sample_seed(decision_id: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(decision_id.as_bytes());
    hasher.finish()
}

fn should_sample(decision_id: &str, rate: f64) -> bool {
    if rate <= 0.0 {
        return false;
    }
    let seed = sample_seed(decision_id);
    (seed % 10_000) as f64 / 10_000.0 < rate
}

fn redact(text: &str) -> String {
    // Collapse anything that looks like a bearer token or api key value.
    let mut redacted = text.to_string();
    for marker in ["Bearer ", "sk-", "api_key=", "apikey="] {
        if let Some(pos) = redacted.find(marker) {
            let tail_start = pos + marker.len();
            let tail_end = redacted[tail_start..]
                .find(|c: char| c.is_whitespace() || c == '"' || c == '&')
                .map_or(redacted.len(), |o| tail_start + o);
            redacted.replace_range(tail_start..tail_end, "***REDACTED***");
        }
    }
    redacted
}

fn write_artifact(config: &Config, decision_id: &str, label: &str, prompt: &Prompt, raw: Option<&str>, outcome: &str) {
    let dir = config.llm_artifact_dir();
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let doc = serde_json::json!({
        "decision_id": decision_id,
        "prompt_version": PROMPT_VERSION,
        "schema_version": SCHEMA_VERSION,
        "validator_version": VALIDATOR_VERSION,
        "model_id": prompt.model_id,
        "system": redact(&prompt.system),
        "user": redact(&prompt.user),
        "raw_response": raw.map(redact),
        "outcome": outcome,
    });
    let path = dir.join(format!("{decision_id}-{label}.json"));
    if let Ok(bytes) = serde_json::to_vec_pretty(&doc) {
        let _ = std::fs::write(path, bytes);
    }
}

/// Runs the retry loop, classifies failures, and always returns a valid plan —
/// the fallback path on exhaustion, never an error (§4.3: "The fallback still
/// yields a valid TradePlan").
pub async fn advise(
    client: &Arc<dyn LlmClient>,
    config: &Config,
    prompt: &Prompt,
    ticker: &str,
    price: f64,
    decision_id: &str,
) -> (TradePlan, f64) {
    let mut last_message = String::new();
    let mut last_kind = LlmFailureKind::Transport;
    for attempt in 0..config.llm_max_retries {
        let call = tokio::time::timeout(config.llm_timeout, client.propose_plan(prompt)).await;
        let raw = match call {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                last_message = e.message.clone();
                last_kind = e.kind;
                warn!(decision_id, attempt, kind = e.kind.as_str(), "llm call failed");
                if config.llm_debug {
                    write_artifact(config, decision_id, &format!("attempt{attempt}"), prompt, None, e.kind.as_str());
                }
                backoff(attempt).await;
                continue;
            }
            Err(_) => {
                last_message = "call exceeded per-attempt deadline".to_string();
                last_kind = LlmFailureKind::Timeout;
                warn!(decision_id, attempt, "llm call timed out");
                if config.llm_debug {
                    write_artifact(config, decision_id, &format!("attempt{attempt}"), prompt, None, "TIMEOUT");
                }
                backoff(attempt).await;
                continue;
            }
        };
        match parse_and_validate(&raw.0) {
            Ok(plan) => {
                let confidence = plan.confidence;
                if config.llm_debug || should_sample(decision_id, config.llm_success_sample_rate) {
                    write_artifact(config, decision_id, "success", prompt, Some(&raw.0), "OK");
                }
                return (plan, confidence);
            }
            Err(e) => {
                last_message = e.message.clone();
                last_kind = e.kind;
                warn!(decision_id, attempt, kind = e.kind.as_str(), "llm output failed validation");
                if config.llm_debug {
                    write_artifact(config, decision_id, &format!("attempt{attempt}"), prompt, Some(&raw.0), e.kind.as_str());
                }
                backoff(attempt).await;
            }
        }
    }
    let exhausted = last_kind.into_app_error(last_message).with_decision_id(decision_id);
    warn!(decision_id, error = %exhausted.to_tool_error(), "exhausted llm retries, using fallback plan");
    if config.llm_debug {
        write_artifact(config, decision_id, "fallback", prompt, None, "FALLBACK");
    }
    let plan = fallback_plan(ticker, price);
    let confidence = plan.confidence;
    (plan, confidence)
}

async fn backoff(attempt: u32) {
    let secs = 0.5 * 2f64.powi(attempt as i32);
    tokio::time::sleep(std::time::Duration::from_secs_f64(secs)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn light_repair_strips_code_fence_and_trailing_comma() {
        let raw = "```json\n{\"a\": 1, \"b\": 2,}\n```";
        let repaired = light_repair(raw);
        let value: serde_json::Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(value["a"], 1);
        assert_eq!(value["b"], 2);
    }

    #[test]
    fn parse_and_validate_rejects_extra_fields() {
        let raw = r#"{"ticker":"AAPL","entry_type":"limit","entry_price":100.0,"stop_price":98.0,
            "target_prices":[103.0],"timeout_days":5,"confidence":0.6,"reason":"x",
            "schema_version":"ProposeResponseV1","extra_field":true}"#;
        let err = parse_and_validate(raw).unwrap_err();
        assert_eq!(err.kind, LlmFailureKind::Schema);
    }

    #[test]
    fn parse_and_validate_accepts_well_formed_plan() {
        let raw = r#"{"ticker":"AAPL","entry_type":"limit","entry_price":100.0,"stop_price":98.0,
            "target_prices":[103.0],"timeout_days":5,"confidence":0.6,"reason":"x",
            "schema_version":"ProposeResponseV1"}"#;
        assert!(parse_and_validate(raw).is_ok());
    }

    #[test]
    fn fallback_plan_matches_spec_constants() {
        let plan = fallback_plan("AAPL", 100.0);
        assert!((plan.entry_price - 99.5).abs() < 1e-9);
        assert!((plan.stop_price - 98.0).abs() < 1e-9);
        assert_eq!(plan.target_prices, vec![103.0]);
        assert_eq!(plan.timeout_days, 5);
        assert_eq!(plan.confidence, 0.5);
    }

    #[test]
    fn redact_masks_bearer_token() {
        let text = "Authorization: Bearer sk-abc123 sent";
        let redacted = redact(text);
        assert!(!redacted.contains("sk-abc123"));
    }
}
