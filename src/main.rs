mod api;
mod bootstrap;
mod config;
mod error;
mod escrow;
mod ledger;
mod quorum;
mod server;
mod settlement;
mod transfer;

#[cfg(test)]
mod testing;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::settlement::SweepScheduler;

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,escrow_settlement=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting equity escrow settlement service");

    let config = config::Config::load()?;
    let state = bootstrap::initialize_app_state(&config).await?;

    // Deadline enforcement runs beside the HTTP server
    let sweeper = SweepScheduler::new(state.coordinator.clone(), config.sweep_interval()).start();

    let app = server::create_app(state);
    let served = server::run_server(app, &config.bind_address).await;

    sweeper.abort();
    info!("👋 Server stopped");
    served
}
