use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::handlers::{
    cancel_investment, create_transfer, get_investment, get_transfer, health_check,
    list_reconciliations, list_shareholders, register_shareholders, resolve_investment,
    retry_transfer, run_sweep, sign_investment, stream_events, submit_approval, AppState,
};
use crate::api::middleware::require_admin;

pub fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    // Operator endpoints, gated by the admin token
    let admin = Router::new()
        .route("/sweep", post(run_sweep))
        .route("/reconciliations", get(list_reconciliations))
        .route("/investments/:id/resolve", post(resolve_investment))
        .route("/events", get(stream_events))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let app = Router::new()
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Shareholder register
                .route(
                    "/businesses/:business_id/shareholders",
                    post(register_shareholders).get(list_shareholders),
                )
                // Investment lifecycle
                .route("/investments", post(sign_investment))
                .route("/investments/:id", get(get_investment))
                .route("/investments/:id/approvals", post(submit_approval))
                .route("/investments/:id/cancel", post(cancel_investment))
                // P2P transfers
                .route("/transfers", post(create_transfer))
                .route("/transfers/:id", get(get_transfer))
                .route("/transfers/:id/retry", post(retry_transfer))
                .nest("/admin", admin),
        )
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::config::SettlementConfig;
    use crate::escrow::EscrowLedger;
    use crate::ledger::InMemoryStore;
    use crate::settlement::{ChannelNotifier, DenyAll, SettlementCoordinator};
    use crate::testing::{fast_escrow_config, ScriptedGateway};
    use crate::transfer::TransferSagaService;

    fn app(admin_token: Option<&str>) -> Router {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(EscrowLedger::new(
            store.clone(),
            Arc::new(ScriptedGateway::new()),
            fast_escrow_config(),
        ));
        let events = Arc::new(ChannelNotifier::new());
        let coordinator = Arc::new(SettlementCoordinator::new(
            store.clone(),
            ledger.clone(),
            Arc::new(DenyAll),
            events.clone(),
            SettlementConfig::default(),
        ));
        let transfers = Arc::new(TransferSagaService::new(
            store,
            ledger,
            dec!(2.5),
            "NGN".to_string(),
        ));

        create_app(AppState {
            coordinator,
            transfers,
            events,
            store_backend: "memory",
            gateway_name: "scripted".to_string(),
            admin_token: admin_token.map(str::to_string),
        })
    }

    fn sweep_request(token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/api/v1/admin/sweep");
        if let Some(token) = token {
            builder = builder.header("x-admin-token", token);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_admin_routes_refused_without_configured_token() {
        let response = app(None)
            .oneshot(sweep_request(Some("anything-at-all-123")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_routes_require_matching_token() {
        let app = app(Some("operator-secret-0001"));

        let response = app.clone().oneshot(sweep_request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .clone()
            .oneshot(sweep_request(Some("operator-secret-0002")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(sweep_request(Some("operator-secret-0001")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_public_routes_do_not_need_admin_token() {
        let response = app(None)
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/businesses/{}/shareholders", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
