use axum::{
    routing::{get, post},
    Router,
};

use crate::tokens::api;

pub fn api_routes() -> Router {
    Router::new()
        .route(
            "/api/tokens/:tenant_id/authorize",
            post(api::authorize_action),
        )
        .route(
            "/api/tokens/:tenant_id/subscription",
            get(api::get_subscription)
                .post(api::create_subscription)
                .delete(api::cancel_subscription),
        )
        .route("/api/tokens/:tenant_id/plan", post(api::change_plan))
        .route(
            "/api/tokens/:tenant_id/transactions",
            get(api::list_transactions),
        )
        .route("/api/tokens/:tenant_id/refill", post(api::refill_tokens))
        .route("/api/tokens/:tenant_id/audit", post(api::audit_ledger))
        .route(
            "/api/tokens/pricing",
            get(api::list_pricing).put(api::upsert_pricing),
        )
        .route("/api/tokens/plans", get(api::list_plans))
}
