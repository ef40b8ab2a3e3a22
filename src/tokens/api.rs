use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::{AppError, AppResult};

use super::adapters::InvoicingProvider;
use super::authorizer::ConsumptionAuthorizer;
use super::catalog::PricingCatalog;
use super::ledger::TokenLedger;
use super::models::{
    AuthorizeOutcome, PlanChangeOutcome, PricingEntry, TokenPlan, TokenSubscription,
    TokenTransaction, TransactionDetail, TransactionKind,
};
use super::plans::PlanService;
use super::reconciliation::{AuditHandle, AuditJob};

/// key: token-api -> rest endpoints for the metering engine
pub async fn authorize_action(
    Extension(pool): Extension<PgPool>,
    Extension(catalog): Extension<PricingCatalog>,
    Extension(invoicing): Extension<Arc<dyn InvoicingProvider>>,
    Path(tenant_id): Path<i32>,
    Json(payload): Json<AuthorizeRequest>,
) -> AppResult<Json<AuthorizeOutcome>> {
    let authorizer = ConsumptionAuthorizer::new(catalog, TokenLedger::new(pool), invoicing);
    let outcome = authorizer
        .authorize(tenant_id, &payload.action_type)
        .await?;
    Ok(Json(outcome))
}

pub async fn get_subscription(
    Extension(pool): Extension<PgPool>,
    Path(tenant_id): Path<i32>,
) -> AppResult<Json<Option<SubscriptionEnvelope>>> {
    let ledger = TokenLedger::new(pool);
    let envelope = ledger
        .subscription_with_plan(tenant_id)
        .await?
        .map(|(subscription, plan)| SubscriptionEnvelope { subscription, plan });
    Ok(Json(envelope))
}

pub async fn create_subscription(
    Extension(pool): Extension<PgPool>,
    Extension(invoicing): Extension<Arc<dyn InvoicingProvider>>,
    Path(tenant_id): Path<i32>,
    Json(payload): Json<CreateSubscriptionRequest>,
) -> AppResult<Json<SubscriptionEnvelope>> {
    let ledger = TokenLedger::new(pool.clone());
    let service = PlanService::new(pool, ledger.clone(), invoicing);
    let trial = payload.trial.unwrap_or(false);
    service
        .create_subscription(tenant_id, &payload.plan_code, trial, Utc::now())
        .await?;

    let (subscription, plan) = ledger
        .subscription_with_plan(tenant_id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(SubscriptionEnvelope { subscription, plan }))
}

pub async fn cancel_subscription(
    Extension(pool): Extension<PgPool>,
    Extension(invoicing): Extension<Arc<dyn InvoicingProvider>>,
    Path(tenant_id): Path<i32>,
    Query(query): Query<CancelQuery>,
) -> AppResult<Json<TokenSubscription>> {
    let ledger = TokenLedger::new(pool.clone());
    let service = PlanService::new(pool, ledger, invoicing);
    let subscription = service
        .cancel_subscription(tenant_id, query.at_period_end.unwrap_or(true))
        .await?;
    Ok(Json(subscription))
}

pub async fn change_plan(
    Extension(pool): Extension<PgPool>,
    Extension(invoicing): Extension<Arc<dyn InvoicingProvider>>,
    Path(tenant_id): Path<i32>,
    Json(payload): Json<ChangePlanRequest>,
) -> AppResult<Json<PlanChangeOutcome>> {
    let ledger = TokenLedger::new(pool.clone());
    let service = PlanService::new(pool, ledger, invoicing);
    let outcome = service
        .change_plan(tenant_id, &payload.plan_code, Utc::now())
        .await?;
    Ok(Json(outcome))
}

pub async fn list_transactions(
    Extension(pool): Extension<PgPool>,
    Path(tenant_id): Path<i32>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<Vec<TokenTransaction>>> {
    let ledger = TokenLedger::new(pool);
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let rows = ledger.history(tenant_id, limit).await?;
    Ok(Json(rows))
}

/// Top-up purchase flow: payment capture happens upstream, the purchased
/// tokens land here as a plain refill (or bonus) credit.
pub async fn refill_tokens(
    Extension(pool): Extension<PgPool>,
    Path(tenant_id): Path<i32>,
    Json(payload): Json<RefillRequest>,
) -> AppResult<Json<TokenTransaction>> {
    if payload.tokens <= 0 {
        return Err(AppError::BadRequest(
            "tokens must be a positive amount".into(),
        ));
    }
    let kind = if payload.bonus.unwrap_or(false) {
        TransactionKind::Bonus
    } else {
        TransactionKind::Refill
    };
    let description = payload
        .description
        .unwrap_or_else(|| "token top-up purchase".to_string());

    let ledger = TokenLedger::new(pool);
    let transaction = ledger
        .apply_delta(
            tenant_id,
            payload.tokens,
            kind,
            None,
            &description,
            TransactionDetail::RefillV1 {
                source: payload.source.unwrap_or_else(|| "purchase".to_string()),
            },
        )
        .await?;
    Ok(Json(transaction))
}

pub async fn list_pricing(
    Extension(catalog): Extension<PricingCatalog>,
) -> AppResult<Json<Vec<PricingEntry>>> {
    let entries = catalog.list_active().await?;
    Ok(Json(entries))
}

pub async fn upsert_pricing(
    Extension(catalog): Extension<PricingCatalog>,
    Json(payload): Json<UpsertPricingRequest>,
) -> AppResult<Json<PricingEntry>> {
    let entry = catalog
        .upsert_entry(
            &payload.action_type,
            payload.token_cost,
            &payload.category,
            payload.active.unwrap_or(true),
        )
        .await?;
    Ok(Json(entry))
}

pub async fn list_plans(
    Extension(pool): Extension<PgPool>,
) -> AppResult<Json<Vec<TokenPlan>>> {
    let plans = sqlx::query_as::<_, TokenPlan>(
        "SELECT * FROM token_plans WHERE active = TRUE ORDER BY monthly_price ASC",
    )
    .fetch_all(&pool)
    .await?;
    Ok(Json(plans))
}

/// Admin surface: queue an out-of-band ledger fold check for a tenant.
pub async fn audit_ledger(
    Extension(handle): Extension<AuditHandle>,
    Path(tenant_id): Path<i32>,
) -> AppResult<StatusCode> {
    handle
        .dispatch(AuditJob::LedgerAudit { tenant_id })
        .await
        .map_err(|err| AppError::Message(err.to_string()))?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Serialize)]
pub struct SubscriptionEnvelope {
    pub subscription: TokenSubscription,
    pub plan: TokenPlan,
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    pub action_type: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub plan_code: String,
    #[serde(default)]
    pub trial: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub plan_code: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    #[serde(default)]
    pub at_period_end: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RefillRequest {
    pub tokens: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub bonus: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpsertPricingRequest {
    pub action_type: String,
    pub token_cost: i64,
    pub category: String,
    #[serde(default)]
    pub active: Option<bool>,
}
