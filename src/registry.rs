//! Shared service state (§2, §5 additions): the collaborators, storage, and
//! per-D bandit map the orchestrator is built on. Constructed once in
//! `main.rs` and handed to the `rmcp` server by `Arc` — no process-global
//! mutable state anywhere in the crate.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bandit::Bandit;
use crate::config::{Config, PolicyParams};
use crate::errors::AppResult;
use crate::events::EventCache;
use crate::llm::LlmClient;
use crate::market::MarketData;
use crate::news::News;
use crate::storage::Store;
use crate::telemetry::Telemetry;

/// Bandit map keyed by context dimension `D` (§5: "the bandit map keyed by
/// D"). In practice a deployment pins one `D` via `CONTEXT_DIM`, so this map
/// usually holds a single entry, but requests are never trusted to agree
/// with the deployment's default — a mismatched `context.len()` is rejected
/// before it ever reaches the bandit.
pub struct Registry {
    pub config: Config,
    pub policy_params: PolicyParams,
    pub store: Arc<Store>,
    pub event_cache: Arc<EventCache>,
    pub market: Arc<dyn MarketData>,
    pub news: Arc<dyn News>,
    pub llm: Arc<dyn LlmClient>,
    pub telemetry: Arc<Telemetry>,
    bandits: Mutex<HashMap<usize, Arc<Bandit>>>,
}

impl Registry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        policy_params: PolicyParams,
        store: Arc<Store>,
        event_cache: Arc<EventCache>,
        market: Arc<dyn MarketData>,
        news: Arc<dyn News>,
        llm: Arc<dyn LlmClient>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            config,
            policy_params,
            store,
            event_cache,
            market,
            news,
            llm,
            telemetry,
            bandits: Mutex::new(HashMap::new()),
        }
    }

    /// Lazily loads (or creates) the `Bandit` for `dim`, caching it for reuse.
    /// The per-D snapshot path comes from `Config::snapshot_path`, so two
    /// dimensions never collide on disk.
    pub async fn bandit_for_dim(&self, dim: usize) -> AppResult<Arc<Bandit>> {
        let mut bandits = self.bandits.lock().await;
        if let Some(b) = bandits.get(&dim) {
            return Ok(b.clone());
        }
        let bandit = Arc::new(Bandit::load_or_init(
            self.config.snapshot_path(dim),
            dim,
            self.config.bandit_lambda,
            self.config.bandit_exploration_nu,
        )?);
        bandits.insert(dim, bandit.clone());
        Ok(bandit)
    }

    /// The bandit for the deployment's pinned `CONTEXT_DIM`.
    pub async fn bandit(&self) -> AppResult<Arc<Bandit>> {
        self.bandit_for_dim(self.config.context_dim).await
    }

    /// Rejects a request whose context vector doesn't match the deployment's
    /// pinned dimension, before it reaches the bandit at all (§3 Rust-native
    /// additions).
    pub fn assert_context_dim(&self, context: &[f64]) -> AppResult<()> {
        if context.len() != self.config.context_dim {
            return Err(crate::errors::AppError::validation(format!(
                "context length {} does not match deployment CONTEXT_DIM {}",
                context.len(),
                self.config.context_dim
            )));
        }
        Ok(())
    }
}
