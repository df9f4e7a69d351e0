use savings_settlement::{bootstrap, config::Config};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,savings_settlement=debug,sqlx=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("🚀 Starting savings pool settlement service");

    let config = Config::from_env()?;
    info!(
        "Network: {}, poll interval: {}s, mirror: {}",
        config.network,
        config.poll_interval.as_secs(),
        if config.database_url.is_some() { "postgres" } else { "memory" }
    );

    let services = bootstrap::initialize_services(config).await?;
    services.start().await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("❌ Failed to listen for shutdown signal: {}", e);
    }

    services.shutdown().await;
    info!("👋 Settlement service stopped");
    Ok(())
}
