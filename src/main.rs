use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{info, warn};

use marketgen::client::RateLimitedClient;
use marketgen::config::{ApiConfig, RateLimitConfig};
use marketgen::limiter::RateLimiter;
use marketgen::llm::{LlmProvider, OpenAiClient};
use marketgen::loader::DocumentLoader;
use marketgen::market::MarketDataClient;
use marketgen::pipeline::Pipeline;
use marketgen::retry::RetryPolicy;
use marketgen::server::{serve, AppState};
use marketgen::snapshot::SnapshotStore;
use marketgen::store::VectorStore;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();
    env_logger::init();

    let api_config = ApiConfig::from_env();
    let rate_config = RateLimitConfig::from_env();
    let policy = RetryPolicy::from_config(&rate_config);

    info!(
        "rate limits: {} req/min, {} tokens/min, {} concurrent",
        rate_config.requests_per_minute,
        rate_config.tokens_per_minute,
        rate_config.max_concurrent_requests
    );

    // One limiter and one wrapped client per process, passed by handle into
    // everything that makes LLM calls.
    let raw_client: Arc<dyn LlmProvider> =
        Arc::new(OpenAiClient::new(api_config.clone(), policy)?);
    let limiter = Arc::new(RateLimiter::new(rate_config));
    let client: Arc<dyn LlmProvider> =
        Arc::new(RateLimitedClient::new(raw_client, Arc::clone(&limiter)));

    let index_dir = env::var("INDEX_DIR").unwrap_or_else(|_| "data/index".to_string());
    let store = Arc::new(VectorStore::new(
        Arc::clone(&client),
        api_config.embedding_model.clone(),
        index_dir,
    ));

    if store.load().await? {
        info!("reusing persisted vector index");
    } else {
        let docs_dir = env::var("DOCS_DIR").unwrap_or_else(|_| "data/docs".to_string());
        let (documents, metadata) = DocumentLoader::new()
            .load_documents_with_metadata(&docs_dir)
            .await?;
        if documents.is_empty() {
            warn!("no documents found to index, retrieval will use fallbacks");
        } else {
            let count = documents.len();
            store.build_index(documents, metadata).await?;
            info!("indexed {count} document chunks from {docs_dir}");
        }
    }

    let market = MarketDataClient::new(api_config.use_mock_data, policy)?;
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&client),
        Arc::clone(&store),
        market,
        SnapshotStore::new(),
        api_config.temperature,
    ));

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = env::var("PORT")
        .unwrap_or_else(|_| "8000".to_string())
        .parse()
        .unwrap_or(8000u16);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    serve(AppState { pipeline, limiter }, addr).await?;
    Ok(())
}
