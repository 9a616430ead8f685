use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    api::AppState,
    config::Config,
    error::AppResult,
    escrow::{EscrowLedger, HttpPaymentGateway, PaymentGateway, SandboxGateway},
    ledger::{InMemoryStore, PersistenceStore, PgStore},
    settlement::{
        AuthorizationCheck, ChannelNotifier, DenyAll, FanoutNotifier, HttpAuthorizationCheck,
        NotificationDispatcher, SettlementCoordinator, WebhookNotifier,
    },
    transfer::TransferSagaService,
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    // Persistence
    let (store, store_backend): (Arc<dyn PersistenceStore>, &'static str) =
        match &config.database_url {
            Some(database_url) => {
                let pool = initialize_database(database_url).await?;
                let store = PgStore::new(pool);
                store.run_migrations().await?;
                info!("✓ Database initialized");
                (Arc::new(store), "postgres")
            }
            None => {
                warn!("⚠️  DATABASE_URL not set - using in-memory store, state is lost on restart");
                (Arc::new(InMemoryStore::new()), "memory")
            }
        };

    // Payment provider
    let gateway: Arc<dyn PaymentGateway> = match &config.payment_gateway_url {
        Some(url) => {
            let gateway =
                HttpPaymentGateway::new(url.clone(), config.payment_gateway_api_key.clone())?;
            info!("✅ Payment gateway configured: {}", url);
            Arc::new(gateway)
        }
        None => {
            warn!("⚠️  PAYMENT_GATEWAY_URL not set - sandbox gateway, no real funds move");
            Arc::new(SandboxGateway::new())
        }
    };
    let gateway_name = gateway.name().to_string();

    // Identity and PIN verification
    let auth: Arc<dyn AuthorizationCheck> = match &config.auth_service_url {
        Some(url) => {
            info!("✅ Authorization service configured: {}", url);
            Arc::new(HttpAuthorizationCheck::new(url.clone())?)
        }
        None => {
            warn!("⚠️  AUTH_SERVICE_URL not set - every investor and shareholder action will be denied");
            Arc::new(DenyAll)
        }
    };

    // Notifications
    let events = Arc::new(ChannelNotifier::new());
    let mut sinks: Vec<Arc<dyn NotificationDispatcher>> = vec![events.clone()];
    if let Some(url) = &config.notification_webhook_url {
        sinks.push(Arc::new(WebhookNotifier::new(url.clone())?));
        info!("✅ Notification webhook configured");
    }
    let notifier: Arc<dyn NotificationDispatcher> = Arc::new(FanoutNotifier::new(sinks));

    // Core components
    let ledger = Arc::new(EscrowLedger::new(
        store.clone(),
        gateway,
        config.escrow(),
    ));
    let coordinator = Arc::new(SettlementCoordinator::new(
        store.clone(),
        ledger.clone(),
        auth,
        notifier,
        config.settlement(),
    ));
    let transfers = Arc::new(TransferSagaService::new(
        store,
        ledger,
        config.platform_fee_percent,
        config.default_currency.clone(),
    ));

    if config.admin_token.is_none() {
        warn!("⚠️  ADMIN_TOKEN not set - operator endpoints are disabled");
    }

    info!("✅ Application state initialized");
    Ok(AppState {
        coordinator,
        transfers,
        events,
        store_backend,
        gateway_name,
        admin_token: config.admin_token.clone(),
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(50)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 50 max connections");
    Ok(pool)
}
