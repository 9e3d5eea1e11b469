use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = openrouter_relay::AppConfig::from_env()?;
    if config.api_key.is_none() {
        tracing::warn!("OPENROUTER_KEY is not set; chat completions will fail with 500");
    }

    let listen = config.listen_addr;
    tracing::info!(
        default_model = %config.default_model,
        upstream = %config.upstream_base_url,
        timeout_ms = config.upstream_timeout.as_millis() as u64,
        max_attempts = config.retry.max_attempts,
        aliases = config.model_aliases.len(),
        "relay configured"
    );

    let app = openrouter_relay::app(openrouter_relay::AppState::new(config));

    let listener = TcpListener::bind(listen).await?;
    tracing::info!(%listen, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
