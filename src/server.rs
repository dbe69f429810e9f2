//! Decision Orchestrator (§4.5): the `rmcp` tool surface over the fact
//! synthesizer, bandit, LLM advisor, and policy validator. Every tool method
//! validates with `garde` before doing anything else, exactly like every
//! teacher tool method does, and maps failures through `AppError::to_tool_error`
//! so the taxonomy tag survives as a string prefix for tests to assert on.

use std::sync::Arc;

use garde::Validate;
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Json},
    model::{Implementation, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ServerHandler,
};
use rmcp::handler::server::wrapper::Parameters;
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::info;

use crate::api::{
    BanditLogEntry, BanditStats, DecisionRequest, PolicyVerdict, ProposeResponse,
    QuickResponse, RewardPayload, RewardResponse, RewardStatus, ValidatePayload,
};
use crate::errors::{AppError, AppResult};
use crate::facts;
use crate::llm;
use crate::market;
use crate::policy;
use crate::registry::Registry;

fn default_bandit_log_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct AnalyzeParams {
    /// US stock ticker symbol (e.g. "AAPL").
    #[garde(length(min = 1, max = 10))]
    pub ticker: String,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct QuickParams {
    #[garde(length(min = 1, max = 10))]
    pub ticker: String,
}

#[derive(Debug, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct BanditLogsParams {
    #[serde(default = "default_bandit_log_limit")]
    #[garde(range(min = 1, max = 1000))]
    pub limit: i64,
}

#[derive(Clone)]
pub struct OrchestratorServer {
    registry: Arc<Registry>,
    tool_router: ToolRouter<Self>,
}

impl OrchestratorServer {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry, tool_router: Self::tool_router() }
    }
}

#[tool_router]
impl OrchestratorServer {
    /// Full decision path: facts → bandit selection → LLM-advised trade plan
    /// → policy-aware analysis. Returns a `ProposeResponse` whose `analysis`
    /// is always complete, even when the LLM call falls back.
    ///
    /// **When to use**: the caller already has a catalyst/backtest snapshot
    /// for a ticker and wants a sized, explained trade plan.
    /// **Next tool**: `validate` to size the returned plan against live
    /// portfolio/market state, then `reward` once the outcome is known.
    #[tool(
        name = "propose",
        annotations(destructive_hint = false, idempotent_hint = false, open_world_hint = true)
    )]
    async fn propose(
        &self,
        Parameters(params): Parameters<DecisionRequest>,
    ) -> Result<Json<ProposeResponse>, String> {
        let decision_id = params.decision_id.clone();
        params
            .validate()
            .map_err(|e| AppError::validation(e.to_string()).with_decision_id(&decision_id).to_tool_error())?;
        self.propose_core(params).await.map(Json).map_err(|e| e.to_tool_error())
    }

    /// Convenience path: fetches a market quote and the next catalyst event
    /// for `ticker`, synthesizes a `DecisionRequest`, mints a `decision_id`,
    /// and runs the same path as `propose`.
    #[tool(
        name = "analyze",
        annotations(destructive_hint = false, idempotent_hint = false, open_world_hint = true)
    )]
    async fn analyze(
        &self,
        Parameters(params): Parameters<AnalyzeParams>,
    ) -> Result<Json<ProposeResponse>, String> {
        params.validate().map_err(|e| AppError::validation(e.to_string()).to_tool_error())?;
        self.analyze_core(&params.ticker).await.map(Json).map_err(|e| e.to_tool_error())
    }

    /// Fast path: a deterministic textual summary of current price and
    /// indicators for `ticker`. No LLM call, no bandit selection, no
    /// decision_id minted — separate cache policy from `propose`/`analyze`.
    #[tool(name = "quick", annotations(read_only_hint = true, open_world_hint = true))]
    async fn quick(
        &self,
        Parameters(params): Parameters<QuickParams>,
    ) -> Result<Json<QuickResponse>, String> {
        params.validate().map_err(|e| AppError::validation(e.to_string()).to_tool_error())?;
        self.quick_core(&params.ticker).await.map(Json).map_err(|e| e.to_tool_error())
    }

    /// Runs a `TradePlan` through the hard-rule policy chain and sizer. Pure
    /// function of its inputs — safe to call repeatedly with the same
    /// payload.
    #[tool(name = "validate", annotations(read_only_hint = true, idempotent_hint = true))]
    async fn validate(
        &self,
        Parameters(params): Parameters<ValidatePayload>,
    ) -> Result<Json<PolicyVerdict>, String> {
        let decision_id = params.decision_id.clone();
        params
            .validate()
            .map_err(|e| AppError::validation(e.to_string()).with_decision_id(&decision_id).to_tool_error())?;
        let verdict = policy::validate(
            &params.plan,
            &params.market,
            &params.context,
            &self.registry.policy_params,
            &params.decision_id,
        );
        Ok(Json(verdict))
    }

    /// Records a realized reward for a prior `decision_id` and applies it to
    /// the bandit. Idempotent: a second call for the same `decision_id`
    /// returns `duplicate_ignored` and leaves the bandit untouched.
    #[tool(name = "reward", annotations(idempotent_hint = true, destructive_hint = false))]
    async fn reward(
        &self,
        Parameters(params): Parameters<RewardPayload>,
    ) -> Result<Json<RewardResponse>, String> {
        let decision_id = params.decision_id.clone();
        params
            .validate()
            .map_err(|e| AppError::validation(e.to_string()).with_decision_id(&decision_id).to_tool_error())?;
        self.reward_core(params).await.map(Json).map_err(|e| e.to_tool_error())
    }

    /// Per-arm aggregate reward statistics over the full bandit log.
    #[tool(name = "bandit_stats", annotations(read_only_hint = true))]
    async fn bandit_stats(&self) -> Result<Json<BanditStats>, String> {
        self.registry.store.bandit_stats().await.map(Json).map_err(|e| e.to_tool_error())
    }

    /// The most recent bandit log entries, newest first.
    #[tool(name = "bandit_logs", annotations(read_only_hint = true))]
    async fn bandit_logs(
        &self,
        Parameters(params): Parameters<BanditLogsParams>,
    ) -> Result<Json<Vec<BanditLogEntry>>, String> {
        params.validate().map_err(|e| AppError::validation(e.to_string()).to_tool_error())?;
        self.registry.store.bandit_logs(params.limit).await.map(Json).map_err(|e| e.to_tool_error())
    }
}

/// Internal orchestration logic, kept out of the `#[tool_router]` block so
/// `propose` and `analyze` can share one implementation.
impl OrchestratorServer {
    async fn propose_core(&self, request: DecisionRequest) -> AppResult<ProposeResponse> {
        self.registry.assert_context_dim(&request.context).map_err(|e| e.with_decision_id(&request.decision_id))?;
        self.registry.telemetry.record_propose();
        let decision_id = request.decision_id.clone();
        let started = std::time::Instant::now();

        let bandit = self
            .registry
            .bandit()
            .await
            .map_err(|e| e.with_decision_id(&decision_id))?;

        let (market_ctx, news, selection) = tokio::join!(
            facts::build_market_context(&request.ticker, &request, self.registry.market.as_ref()),
            facts::recent_news(&request.ticker, self.registry.news.as_ref(), self.registry.config.news_max_items),
            bandit.select(&request.context, &decision_id),
        );
        let selection = selection.map_err(|e| e.with_decision_id(&decision_id))?;

        let catalyst = facts::build_catalyst(&request);
        let perf_stats = facts::build_perf_stats(
            &request.backtest_kpis,
            self.registry.config.perf_stats_samples,
            self.registry.config.perf_stats_horizon_days,
        );
        let gating = facts::gating_facts(&request, &market_ctx, &self.registry.policy_params);
        let reason = facts::reason_for_arm(selection.arm, &catalyst, &market_ctx);

        let (plan, confidence) = if self.registry.telemetry.auto_degrade() {
            let plan = llm::fallback_plan(&request.ticker, request.price);
            let confidence = plan.confidence;
            (plan, confidence)
        } else {
            let prompt = llm::build_prompt(
                &request.ticker,
                request.price,
                selection.arm.as_str(),
                request.expected_move,
                request.days_to_event,
                market_ctx.rsi14,
                market_ctx.atr14,
                request.news_summary.as_deref(),
                &self.registry.policy_params,
                self.registry.llm.model_id(),
            );
            match tokio::time::timeout(
                self.registry.config.propose_budget,
                llm::advise(
                    &self.registry.llm,
                    &self.registry.config,
                    &prompt,
                    &request.ticker,
                    request.price,
                    &decision_id,
                ),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    self.registry.telemetry.record_timeout();
                    let plan = llm::fallback_plan(&request.ticker, request.price);
                    let confidence = plan.confidence;
                    (plan, confidence)
                }
            }
        };

        if plan.reason == llm::FALLBACK_REASON {
            self.registry.telemetry.record_fallback_used();
            self.registry.telemetry.record_parse_fail();
        } else {
            self.registry.telemetry.record_parse_ok();
        }
        self.registry.telemetry.record_latency_ms(started.elapsed().as_secs_f64() * 1000.0);

        self.registry
            .store
            .record_decision(&decision_id, &request.ticker, selection.arm, &request.context, &plan)
            .await
            .map_err(|e| e.with_decision_id(&decision_id))?;

        let analysis = crate::api::WhySelected {
            catalyst,
            strategy: crate::api::StrategyInfo {
                selected_arm: selection.arm,
                reason,
                gating_facts: gating,
            },
            news,
            history: perf_stats,
            market: market_ctx,
            llm_confidence: confidence,
        };

        Ok(ProposeResponse {
            selected_arm: selection.arm,
            plan,
            decision_id,
            analysis,
            schema_version: crate::api::SCHEMA_VERSION.to_string(),
        })
    }

    /// Synthesizes a `DecisionRequest` from a live market quote and the next
    /// catalyst event for `ticker`. `expected_move` and `rank_components`
    /// have no dedicated upstream source in this request-free path, so both
    /// are derived from the event's `materiality` — the same resolution
    /// `facts::build_catalyst` uses in the other direction, documented as an
    /// Open Question in the grounding ledger.
    async fn analyze_core(&self, ticker: &str) -> AppResult<ProposeResponse> {
        let (quote, event) = tokio::join!(
            self.registry.market.quote(ticker),
            self.registry.event_cache.next_event(ticker),
        );
        let quote = quote.map_err(|_| {
            AppError::not_found(format!("no market data available for {ticker}: cannot synthesize a request"))
        })?;
        let event = event?;

        let days_to_event = (event.event_time - chrono::Utc::now()).num_days().max(0) as f64;
        let materiality = event.materiality.clamp(0.0, 1.0);
        let context_dim = self.registry.config.context_dim;
        let context = vec![materiality; context_dim.max(1)];

        let request = DecisionRequest {
            ticker: ticker.to_string(),
            price: quote.price,
            event_type: event.event_type,
            days_to_event,
            expected_move: (materiality * 0.05).max(0.0),
            rank_components: std::collections::HashMap::from([("materiality".to_string(), materiality)]),
            backtest_kpis: crate::api::BacktestKpis { hit_rate: 0.5, avg_win: 0.0, avg_loss: 0.0, max_dd: 0.0 },
            liquidity: 0.0,
            spread: quote.spread(),
            news_summary: None,
            context,
            decision_id: uuid::Uuid::new_v4().to_string(),
        };
        self.propose_core(request).await
    }

    async fn quick_core(&self, ticker: &str) -> AppResult<QuickResponse> {
        let (quote, history) = tokio::join!(
            self.registry.market.quote(ticker),
            self.registry.market.history(ticker, market::HISTORY_LOOKBACK),
        );
        let quote = quote.map_err(|_| AppError::not_found(format!("no market data available for {ticker}")))?;
        let bars = history.unwrap_or_default();
        let indicators = market::compute_indicators(&bars);
        let analysis_text = format!(
            "{ticker} @ {:.2} — RSI14={}, ATR14={}, spread={:.4}, dollar_adv={:.0}",
            quote.price,
            indicators.rsi14.map_or("n/a".to_string(), |v| format!("{v:.1}")),
            indicators.atr14.map_or("n/a".to_string(), |v| format!("{v:.2}")),
            quote.spread(),
            indicators.dollar_adv,
        );
        Ok(QuickResponse { ticker: ticker.to_string(), price: quote.price, analysis_text })
    }

    async fn reward_core(&self, params: RewardPayload) -> AppResult<RewardResponse> {
        self.registry.assert_context_dim(&params.context).map_err(|e| e.with_decision_id(&params.decision_id))?;
        let inserted = self
            .registry
            .store
            .record_reward(&params.decision_id, params.arm_name, &params.context, params.reward, params.meta.as_ref())
            .await
            .map_err(|e| e.with_decision_id(&params.decision_id))?;
        if !inserted {
            let conflict = AppError::conflict(format!("duplicate reward for decision_id {}", params.decision_id))
                .with_decision_id(&params.decision_id);
            info!(decision_id = %params.decision_id, error = %conflict.to_tool_error(), "duplicate reward ignored");
            return Ok(RewardResponse { status: RewardStatus::DuplicateIgnored });
        }
        let bandit = self.registry.bandit().await.map_err(|e| e.with_decision_id(&params.decision_id))?;
        bandit
            .update(&params.context, params.arm_name, params.reward)
            .await
            .map_err(|e| e.with_decision_id(&params.decision_id))?;
        if let Some(plan) = self
            .registry
            .store
            .get_decision_plan(&params.decision_id)
            .await
            .map_err(|e| e.with_decision_id(&params.decision_id))?
        {
            let polarity = if params.reward > 0.0 { 1.0 } else { 0.0 };
            self.registry.telemetry.record_calibration_sample(plan.confidence, polarity);
        }
        Ok(RewardResponse { status: RewardStatus::Ok })
    }
}

#[tool_handler]
impl ServerHandler for OrchestratorServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "catalyst-desk".into(),
                title: Some("Catalyst Desk Decision Service".into()),
                version: "0.1.0".into(),
                description: Some(
                    "Event-driven equity decision service: contextual bandit arm selection, \
                     LLM-advised trade plans, and risk policy validation"
                        .into(),
                ),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Event-driven equity decision service. \
                \n\nRecommended workflow:\
                \n1. propose({ ticker, price, event_type, days_to_event, rank_components, \
                expected_move, backtest_kpis, liquidity, spread, context, decision_id }) — \
                full path: deterministic facts → bandit arm selection → LLM-advised trade \
                plan → a complete `analysis` explaining the pick. Or call analyze({ ticker }) \
                to let the orchestrator fetch a market quote and the next catalyst event and \
                synthesize the request itself.\
                \n2. quick({ ticker }) — a fast deterministic summary with no LLM call and no \
                bandit selection, for a cheap sanity check before committing to propose.\
                \n3. validate({ plan, market, context, decision_id }) — run a TradePlan through \
                the hard-rule risk policy chain (kill-switch, position cap, liquidity floor, \
                spread ceiling, plan sanity) and get back a sized, approved/rejected/review \
                verdict.\
                \n4. reward({ arm_name, context, reward, decision_id, meta? }) — once a trade's \
                outcome is known, feed it back to the bandit. Idempotent on decision_id: a \
                second call for the same id is a no-op.\
                \n5. bandit_stats() / bandit_logs({ limit? }) — inspect per-arm performance and \
                recent bandit updates."
                    .into(),
            ),
        }
    }
}
