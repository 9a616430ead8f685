// Deadline sweep scheduler
//
// Investments never schedule their own wake-ups. A single background loop
// periodically asks the coordinator to enforce every open approval window.

use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use super::coordinator::SettlementCoordinator;

pub struct SweepScheduler {
    coordinator: Arc<SettlementCoordinator>,
    every: Duration,
}

impl SweepScheduler {
    pub fn new(coordinator: Arc<SettlementCoordinator>, every: Duration) -> Self {
        Self { coordinator, every }
    }

    /// Start the sweep loop (runs in background)
    pub fn start(&self) -> JoinHandle<()> {
        let coordinator = self.coordinator.clone();
        let every = self.every;

        tokio::spawn(async move {
            info!("⏰ Deadline sweep running every {:?}", every);
            let mut ticker = interval(every);
            // A slow sweep must not trigger a burst of catch-up sweeps
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(e) = coordinator.sweep(Utc::now()).await {
                    error!("❌ Deadline sweep failed: {:?}", e);
                }
            }
        })
    }
}
