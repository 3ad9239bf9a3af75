use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

mod app;
mod error;
mod http;

#[derive(Parser)]
#[command(name = "tianyi-gateway", about = "Conversational agent gateway")]
struct Cli {
    /// Path to tianyi.toml (default: config/tianyi.toml).
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tianyi_gateway=info,tianyi_agent=info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = tianyi_core::config::TianyiConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("config load failed ({}), using defaults", e);
        tianyi_core::config::TianyiConfig::default()
    });

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let state = Arc::new(app::AppState::init(config).await?);
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("tianyi gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
