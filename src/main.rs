// float_cmp: only in tests where assert_eq! on f64 is intentional.
#![cfg_attr(test, allow(clippy::float_cmp))]

use std::sync::Arc;

use anyhow::Result;
use rmcp::ServiceExt;
use tracing_subscriber::{self, EnvFilter};

use catalyst_desk::config::{Config, PolicyParams};
use catalyst_desk::events::{EventCache, NoProviders};
use catalyst_desk::llm::{HttpLlmClient, LlmClient, StubLlmClient};
use catalyst_desk::market::{MarketData, UnavailableMarketData};
use catalyst_desk::news::{News, NoNews};
use catalyst_desk::registry::Registry;
use catalyst_desk::server::OrchestratorServer;
use catalyst_desk::storage::Store;
use catalyst_desk::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();
    let policy_params = PolicyParams::from_env();

    let store = Arc::new(Store::open(&config.sqlite_path())?);
    let event_cache = Arc::new(EventCache::new(store.clone(), vec![Arc::new(NoProviders)]));

    let market: Arc<dyn MarketData> = Arc::new(UnavailableMarketData);
    let news: Arc<dyn News> = Arc::new(NoNews);

    let llm: Arc<dyn LlmClient> = match HttpLlmClient::from_env() {
        Some(client) => {
            tracing::info!("LLM advisor configured against {}", client.api_base());
            Arc::new(client)
        }
        None => {
            tracing::warn!("LLM_API_KEY not set, advisor falls back to deterministic plans");
            Arc::new(StubLlmClient::valid())
        }
    };

    let telemetry = Arc::new(Telemetry::new());

    let registry = Arc::new(Registry::new(
        config,
        policy_params,
        store,
        event_cache,
        market,
        news,
        llm,
        telemetry.clone(),
    ));

    if let Ok(port) = std::env::var("PORT") {
        // HTTP mode — used by cloud platforms that expect a bound $PORT.
        use rmcp::transport::streamable_http_server::{
            session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
        };

        let service = StreamableHttpService::new(
            move || Ok(OrchestratorServer::new(registry.clone())),
            LocalSessionManager::default().into(),
            StreamableHttpServerConfig::default(),
        );

        let metrics_telemetry = telemetry.clone();
        let app = axum::Router::new()
            .nest_service("/mcp", service)
            .route("/health", axum::routing::get(|| async { "ok" }))
            .route(
                "/metrics",
                axum::routing::get(move || {
                    let telemetry = metrics_telemetry.clone();
                    async move { axum::Json(telemetry.snapshot()) }
                }),
            );

        let addr = format!("0.0.0.0:{port}");
        tracing::info!("Starting catalyst-desk HTTP server on {addr}");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
    } else {
        // stdio mode — used for local development with MCP-aware clients.
        tracing::info!("Starting catalyst-desk MCP server (stdio)");

        let server = OrchestratorServer::new(registry);
        let service = server.serve(rmcp::transport::stdio()).await?;
        service.waiting().await?;
    }

    Ok(())
}
