use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use anyhow::Context;
use operator_agent_lib::server::{router, AppState};
use operator_agent_lib::settings::Settings;
use operator_agent_lib::vectorstore;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::load().context("loading settings")?;
    tracing::info!("[operator] starting Operator Agent API");
    tracing::info!("[operator] OpenAI configured: {}", settings.has_openai());
    tracing::info!("[operator] vector store configured: {}", settings.has_vector_store());
    tracing::info!("[operator] Airtable configured: {}", settings.has_airtable());
    tracing::info!("[operator] computer mode: {}", settings.computer_mode);

    let settings = if settings.has_openai() && !settings.has_vector_store() {
        vectorstore::bootstrap(settings).await
    } else {
        settings
    };
    if !settings.has_openai() {
        tracing::warn!("[operator] no OPENAI_API_KEY found, running in demo mode. Set OPENAI_API_KEY in .env to enable tools");
    }

    let bind_addr = settings.bind_addr.clone();
    let state = AppState::new(settings);
    tracing::info!("[operator] runtime mode: {:?}", state.runtime.mode());
    tracing::info!("[operator] capabilities: {:?}", state.agent.describe_capabilities());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    tracing::info!("[operator] listening on {}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
