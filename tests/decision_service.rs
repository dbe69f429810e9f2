//! Decision service integration tests.
//!
//! Verifies tool registration, garde rejection, the propose/validate/reward
//! workflow end to end, the LLM-fallback path, and reward idempotency, the
//! same in-process `tokio::io::duplex` + `rmcp::ServiceExt` harness the
//! teacher uses for its own MCP server tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rmcp::model::CallToolRequestParams;
use rmcp::ServiceExt;
use serde_json::json;
use tempfile::TempDir;

use catalyst_desk::api::{
    BacktestKpis, DecisionRequest, EntryType, PortfolioContext, TradePlan, ValidateMarket,
};
use catalyst_desk::config::{Config, PolicyParams};
use catalyst_desk::errors::AppResult;
use catalyst_desk::events::{EventCache, EventProvider};
use catalyst_desk::llm::{LlmClient, StubLlmClient};
use catalyst_desk::market::{MarketData, OhlcBar, Quote};
use catalyst_desk::news::{News, NoNews, RawNewsItem};
use catalyst_desk::registry::Registry;
use catalyst_desk::server::OrchestratorServer;
use catalyst_desk::storage::Store;
use catalyst_desk::telemetry::Telemetry;

const CONTEXT_DIM: usize = 3;

// ─── Test Fixtures ──────────────────────────────────────────────────────────

/// Constant quote/history fixture: no network, no env vars, deterministic.
struct FixtureMarket;

#[async_trait]
impl MarketData for FixtureMarket {
    async fn quote(&self, _ticker: &str) -> AppResult<Quote> {
        Ok(Quote { price: 192.50, bid: 192.45, ask: 192.55 })
    }

    async fn history(&self, _ticker: &str, lookback: usize) -> AppResult<Vec<OhlcBar>> {
        Ok((0..lookback)
            .map(|i| OhlcBar {
                close: 190.0 + (i as f64 * 0.3).sin() * 4.0,
                high: 193.0,
                low: 188.0,
                volume: 40_000_000.0,
            })
            .collect())
    }
}

/// A single upcoming earnings event, 7 days out.
struct FixtureEventProvider;

#[async_trait]
impl EventProvider for FixtureEventProvider {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn next_event(&self, _ticker: &str) -> AppResult<(String, DateTime<Utc>, f64)> {
        Ok(("EARNINGS".to_string(), Utc::now() + chrono::Duration::days(7), 0.6))
    }
}

fn test_config(data_root: std::path::PathBuf) -> Config {
    Config {
        context_dim: CONTEXT_DIM,
        bandit_lambda: 1.0,
        bandit_exploration_nu: 1.0,
        llm_max_retries: 1,
        llm_timeout: std::time::Duration::from_secs(2),
        llm_debug: false,
        llm_success_sample_rate: 0.0,
        news_max_items: 5,
        propose_budget: std::time::Duration::from_secs(5),
        data_root,
        perf_stats_samples: 60,
        perf_stats_horizon_days: 5,
    }
}

/// Builds a fully wired `OrchestratorServer` over a temp-dir sqlite store and
/// deterministic collaborators — no network, no shared global state.
fn make_test_server(llm: Arc<dyn LlmClient>) -> (OrchestratorServer, TempDir) {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path().to_path_buf());
    let policy_params = PolicyParams::from_env();

    let store = Arc::new(Store::open(&config.sqlite_path()).unwrap());
    let event_cache = Arc::new(EventCache::new(store.clone(), vec![Arc::new(FixtureEventProvider)]));
    let market: Arc<dyn MarketData> = Arc::new(FixtureMarket);
    let news: Arc<dyn News> = Arc::new(NoNews);
    let telemetry = Arc::new(Telemetry::new());

    let registry = Arc::new(Registry::new(config, policy_params, store, event_cache, market, news, llm, telemetry));
    (OrchestratorServer::new(registry), tmp)
}

fn valid_request(decision_id: &str) -> DecisionRequest {
    DecisionRequest {
        ticker: "AAPL".to_string(),
        price: 192.50,
        event_type: "EARNINGS".to_string(),
        days_to_event: 7.0,
        expected_move: 0.04,
        rank_components: HashMap::from([("momentum".to_string(), 0.6)]),
        backtest_kpis: BacktestKpis { hit_rate: 0.55, avg_win: 1.2, avg_loss: -0.8, max_dd: -0.15 },
        liquidity: 5_000_000_000.0,
        spread: 0.01,
        news_summary: None,
        context: vec![0.6, 0.4, 0.5],
        decision_id: decision_id.to_string(),
    }
}

async fn connect(
    server: OrchestratorServer,
) -> rmcp::service::RunningService<rmcp::service::RoleClient, ()> {
    let (server_tx, server_rx) = tokio::io::duplex(8192);
    let (client_tx, client_rx) = tokio::io::duplex(8192);
    tokio::spawn(async move { server.serve((client_rx, server_tx)).await.unwrap() });
    ().serve((server_rx, client_tx)).await.unwrap()
}

async fn call(
    client: &rmcp::service::RunningService<rmcp::service::RoleClient, ()>,
    name: &str,
    arguments: serde_json::Value,
) -> (bool, serde_json::Value) {
    let result = client
        .peer()
        .call_tool(CallToolRequestParams {
            meta: None,
            name: name.to_string().into(),
            arguments: Some(serde_json::from_value(arguments).unwrap()),
            task: None,
        })
        .await
        .unwrap();
    let is_error = result.is_error.unwrap_or(false);
    let text = result.content.first().and_then(|c| c.raw.as_text()).unwrap();
    let body = serde_json::from_str(&text.text).unwrap_or(json!(text.text));
    (is_error, body)
}

// ═══════════════════════════════════════════════════════════════════════════
// Server Initialization
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn server_info_lists_the_recommended_workflow() {
    use rmcp::ServerHandler;
    let (server, _tmp) = make_test_server(Arc::new(StubLlmClient::valid()));
    let info = server.get_info();
    assert_eq!(info.server_info.name, "catalyst-desk");
    let instructions = info.instructions.unwrap();
    assert!(instructions.contains("propose"));
    assert!(instructions.contains("reward"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tool_router_lists_all_seven_tools() {
    let (server, _tmp) = make_test_server(Arc::new(StubLlmClient::valid()));
    let client = connect(server).await;

    let tools = client.list_all_tools().await.unwrap();
    let names: Vec<String> = tools.iter().map(|t| t.name.to_string()).collect();
    for expected in ["propose", "analyze", "quick", "validate", "reward", "bandit_stats", "bandit_logs"] {
        assert!(names.contains(&expected.to_string()), "missing tool: {expected}, got {names:?}");
    }

    client.cancel().await.unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════
// Propose → Validate → Reward workflow
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn propose_returns_a_complete_analysis_with_a_well_formed_llm() {
    let (server, _tmp) = make_test_server(Arc::new(StubLlmClient::valid()));
    let client = connect(server).await;

    let request = valid_request("dec-propose-1");
    let (is_error, resp) = call(&client, "propose", serde_json::to_value(&request).unwrap()).await;

    assert!(!is_error, "propose failed: {resp}");
    assert_eq!(resp["decision_id"], "dec-propose-1");
    assert!(resp["plan"]["reason"] != "LLM unavailable — fallback plan");
    assert!(resp["analysis"]["market"]["price"].as_f64().unwrap() > 0.0);

    client.cancel().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn propose_falls_back_to_a_deterministic_plan_when_the_llm_is_malformed() {
    let (server, _tmp) = make_test_server(Arc::new(StubLlmClient::malformed()));
    let client = connect(server).await;

    let request = valid_request("dec-fallback-1");
    let (is_error, resp) = call(&client, "propose", serde_json::to_value(&request).unwrap()).await;

    assert!(!is_error, "propose failed: {resp}");
    assert_eq!(resp["plan"]["reason"], "LLM unavailable — fallback plan");
    assert_eq!(resp["plan"]["confidence"].as_f64().unwrap(), 0.5);

    client.cancel().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_workflow_propose_validate_reward() {
    let (server, _tmp) = make_test_server(Arc::new(StubLlmClient::malformed()));
    let client = connect(server).await;

    let request = valid_request("dec-full-1");
    let (is_error, propose_resp) = call(&client, "propose", serde_json::to_value(&request).unwrap()).await;
    assert!(!is_error);

    let plan: TradePlan = serde_json::from_value(propose_resp["plan"].clone()).unwrap();
    let market = ValidateMarket { price: 192.50, spread: 0.02, avg_dollar_vol: 50_000_000.0 };
    let portfolio = PortfolioContext { open_positions: 1, realized_pnl_today: 0.0 };
    let validate_payload = json!({
        "plan": plan,
        "market": market,
        "context": portfolio,
        "decision_id": "dec-full-1",
    });
    let (is_error, verdict) = call(&client, "validate", validate_payload).await;
    assert!(!is_error);
    assert_eq!(verdict["verdict"], "APPROVED");
    assert!(verdict["adjusted_size"].as_i64().unwrap() > 0);

    let reward_payload = json!({
        "arm_name": propose_resp["selected_arm"],
        "context": request.context,
        "reward": 0.3,
        "decision_id": "dec-full-1",
    });
    let (is_error, reward_resp) = call(&client, "reward", reward_payload.clone()).await;
    assert!(!is_error);
    assert_eq!(reward_resp["status"], "ok");

    // Second call with the same decision_id is a no-op.
    let (is_error, dup_resp) = call(&client, "reward", reward_payload).await;
    assert!(!is_error);
    assert_eq!(dup_resp["status"], "duplicate_ignored");

    let (is_error, stats) = call(&client, "bandit_stats", json!({})).await;
    assert!(!is_error);
    assert_eq!(stats["total"], 1);

    client.cancel().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn analyze_synthesizes_a_request_from_market_and_event_data() {
    let (server, _tmp) = make_test_server(Arc::new(StubLlmClient::malformed()));
    let client = connect(server).await;

    let (is_error, resp) = call(&client, "analyze", json!({"ticker": "AAPL"})).await;
    assert!(!is_error, "analyze failed: {resp}");
    assert!(!resp["decision_id"].as_str().unwrap().is_empty());
    assert_eq!(resp["analysis"]["catalyst"]["event_type"], "EARNINGS");

    client.cancel().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quick_never_calls_the_llm_or_the_bandit() {
    let (server, _tmp) = make_test_server(Arc::new(StubLlmClient::malformed()));
    let client = connect(server).await;

    let (is_error, resp) = call(&client, "quick", json!({"ticker": "AAPL"})).await;
    assert!(!is_error, "quick failed: {resp}");
    assert_eq!(resp["ticker"], "AAPL");
    assert!(resp["analysis_text"].as_str().unwrap().contains("AAPL"));

    client.cancel().await.unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════
// Policy hard rules through the `validate` tool
// ═══════════════════════════════════════════════════════════════════════════

fn sample_plan() -> TradePlan {
    TradePlan {
        ticker: "AAPL".to_string(),
        entry_type: EntryType::Limit,
        entry_price: 100.0,
        stop_price: 98.0,
        target_prices: vec![106.0],
        timeout_days: 5,
        confidence: 0.6,
        reason: "x".to_string(),
        schema_version: catalyst_desk::api::SCHEMA_VERSION.to_string(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn validate_rejects_on_kill_switch() {
    let (server, _tmp) = make_test_server(Arc::new(StubLlmClient::valid()));
    let client = connect(server).await;

    let payload = json!({
        "plan": sample_plan(),
        "market": ValidateMarket { price: 100.0, spread: 0.02, avg_dollar_vol: 50_000_000.0 },
        "context": PortfolioContext { open_positions: 0, realized_pnl_today: -5_000.0 },
        "decision_id": "dec-kill",
    });
    let (is_error, verdict) = call(&client, "validate", payload).await;
    assert!(!is_error);
    assert_eq!(verdict["verdict"], "REJECTED");
    assert!(verdict["reason"].as_str().unwrap().contains("kill-switch"));

    client.cancel().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn validate_rejects_on_wide_spread() {
    let (server, _tmp) = make_test_server(Arc::new(StubLlmClient::valid()));
    let client = connect(server).await;

    let payload = json!({
        "plan": sample_plan(),
        "market": ValidateMarket { price: 100.0, spread: 5.0, avg_dollar_vol: 50_000_000.0 },
        "context": PortfolioContext { open_positions: 0, realized_pnl_today: 0.0 },
        "decision_id": "dec-spread",
    });
    let (is_error, verdict) = call(&client, "validate", payload).await;
    assert!(!is_error);
    assert_eq!(verdict["verdict"], "REJECTED");
    assert!(verdict["reason"].as_str().unwrap().contains("spread"));

    client.cancel().await.unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════
// Strict schema rejection — garde + serde(deny_unknown_fields)
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn propose_rejects_unknown_fields() {
    let (server, _tmp) = make_test_server(Arc::new(StubLlmClient::valid()));
    let client = connect(server).await;

    let mut payload = serde_json::to_value(&valid_request("dec-unknown")).unwrap();
    payload.as_object_mut().unwrap().insert("extra_field".to_string(), json!(123));

    let result = client
        .peer()
        .call_tool(CallToolRequestParams {
            meta: None,
            name: "propose".into(),
            arguments: Some(serde_json::from_value(payload).unwrap()),
            task: None,
        })
        .await;
    // Deserialization of the tool arguments fails before the handler even runs,
    // which rmcp surfaces as a transport-level error rather than a tool result.
    assert!(result.is_err() || result.unwrap().is_error.unwrap_or(false));

    client.cancel().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn propose_rejects_empty_decision_id() {
    let (server, _tmp) = make_test_server(Arc::new(StubLlmClient::valid()));
    let client = connect(server).await;

    let mut request = valid_request("");
    request.decision_id = String::new();
    let (is_error, resp) = call(&client, "propose", serde_json::to_value(&request).unwrap()).await;
    assert!(is_error, "expected validation failure, got: {resp}");

    client.cancel().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reward_rejects_out_of_range_reward() {
    let (server, _tmp) = make_test_server(Arc::new(StubLlmClient::valid()));
    let client = connect(server).await;

    let payload = json!({
        "arm_name": "REACTIVE",
        "context": [0.1, 0.2, 0.3],
        "reward": 1.5,
        "decision_id": "dec-oob",
    });
    let (is_error, resp) = call(&client, "reward", payload).await;
    assert!(is_error, "expected validation failure, got: {resp}");

    client.cancel().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn propose_rejects_context_length_mismatch() {
    let (server, _tmp) = make_test_server(Arc::new(StubLlmClient::valid()));
    let client = connect(server).await;

    let mut request = valid_request("dec-dim-mismatch");
    request.context = vec![0.1, 0.2]; // deployment is pinned to CONTEXT_DIM = 3
    let (is_error, resp) = call(&client, "propose", serde_json::to_value(&request).unwrap()).await;
    assert!(is_error, "expected context-dim rejection, got: {resp}");

    client.cancel().await.unwrap();
}

// Sanity-check the fixture itself so a future change to `News`/`EventProvider`
// defaults doesn't silently break the `analyze` test above.
#[tokio::test]
async fn no_news_fixture_returns_empty_feed() {
    let news = NoNews;
    let items: Vec<RawNewsItem> = news.recent("AAPL", 48).await.unwrap();
    assert!(items.is_empty());
}
