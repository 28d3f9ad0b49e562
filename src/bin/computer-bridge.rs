use anyhow::Context;
use operator_agent_lib::bridge::bridge_router;
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 34115;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let port = match std::env::var("COMPUTER_BRIDGE_PORT") {
        Ok(raw) => raw
            .trim()
            .parse::<u16>()
            .with_context(|| format!("invalid COMPUTER_BRIDGE_PORT: {raw}"))?,
        Err(_) => DEFAULT_PORT,
    };

    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("[bridge] starting LIVE bridge scaffold on http://{}", addr);
    tracing::warn!("[bridge] this is a scaffold, every action returns 501 Not Implemented");
    axum::serve(listener, bridge_router()).await?;
    Ok(())
}
