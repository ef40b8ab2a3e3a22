use std::sync::Arc;
use std::time::Duration as StdDuration;

use agencyos_backend::tokens::{
    ConsumptionAuthorizer, PlanService, PricingCatalog, StripeLikeInvoicing, TokenLedger,
    TransactionKind,
};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

// key: token-plan-change-tests -> pro-ration, balance preservation

async fn seed_plan(pool: &PgPool, code: &str, monthly_price: Decimal, monthly_tokens: i64) {
    sqlx::query(
        "INSERT INTO token_plans (id, code, name, monthly_price, monthly_tokens, overage_token_cost, allow_overage) \
         VALUES ($1, $2, $3, $4, $5, $6, FALSE)",
    )
    .bind(Uuid::new_v4())
    .bind(code)
    .bind(code)
    .bind(monthly_price)
    .bind(monthly_tokens)
    .bind(Decimal::ZERO)
    .execute(pool)
    .await
    .unwrap();
}

/// Pin the subscription to a 30-day period with exactly 15 days remaining.
async fn pin_half_spent_period(pool: &PgPool, tenant_id: i32, now: chrono::DateTime<Utc>) {
    sqlx::query(
        "UPDATE token_subscriptions SET current_period_start = $1, current_period_end = $2 WHERE tenant_id = $3",
    )
    .bind(now - Duration::days(15))
    .bind(now + Duration::days(15))
    .bind(tenant_id)
    .execute(pool)
    .await
    .unwrap();
}

fn plan_service(pool: &PgPool) -> PlanService {
    PlanService::new(
        pool.clone(),
        TokenLedger::new(pool.clone()),
        Arc::new(StripeLikeInvoicing),
    )
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn upgrade_grants_pro_rated_adjustment(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let now = Utc::now();
    seed_plan(&pool, "growth", Decimal::new(9900, 2), 50_000).await;
    seed_plan(&pool, "scale", Decimal::new(19900, 2), 100_000).await;

    plan_service(&pool)
        .create_subscription(31, "growth", false, now)
        .await
        .unwrap();
    pin_half_spent_period(&pool, 31, now).await;

    let outcome = plan_service(&pool)
        .change_plan(31, "scale", now)
        .await
        .unwrap();

    // round(50000 * 15/30) granted on top of the saved balance
    assert_eq!(outcome.token_adjustment, 25_000);
    assert_eq!(outcome.new_balance, 75_000);
    assert_eq!(outcome.pro_rated_price_difference, Decimal::new(5000, 2));
    assert!(!outcome.charge_flagged);

    let ledger = TokenLedger::new(pool.clone());
    let (subscription, plan) = ledger.subscription_with_plan(31).await.unwrap().unwrap();
    assert_eq!(subscription.token_balance, 75_000);
    assert_eq!(subscription.monthly_allocation, 100_000);
    assert_eq!(plan.code, "scale");

    let adjustment = ledger
        .history(31, 10)
        .await
        .unwrap()
        .into_iter()
        .find(|row| row.kind() == TransactionKind::PlanAdjustment)
        .expect("plan_adjustment row recorded");
    assert_eq!(adjustment.tokens, 25_000);

    assert_eq!(ledger.verify_ledger(31).await.unwrap(), 75_000);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn downgrade_changes_allocation_but_never_claws_back(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let now = Utc::now();
    seed_plan(&pool, "growth", Decimal::new(9900, 2), 50_000).await;
    seed_plan(&pool, "scale", Decimal::new(19900, 2), 100_000).await;

    plan_service(&pool)
        .create_subscription(32, "scale", false, now)
        .await
        .unwrap();
    pin_half_spent_period(&pool, 32, now).await;

    let outcome = plan_service(&pool)
        .change_plan(32, "growth", now)
        .await
        .unwrap();

    assert_eq!(outcome.token_adjustment, 0);
    assert_eq!(outcome.new_balance, 100_000, "saved balance is untouched");
    // pro-rated credit handed to invoicing
    assert_eq!(outcome.pro_rated_price_difference, Decimal::new(-5000, 2));

    let ledger = TokenLedger::new(pool.clone());
    let (subscription, plan) = ledger.subscription_with_plan(32).await.unwrap().unwrap();
    assert_eq!(subscription.token_balance, 100_000);
    assert_eq!(subscription.monthly_allocation, 50_000);
    assert_eq!(plan.code, "growth");

    let adjustments = ledger
        .history(32, 10)
        .await
        .unwrap()
        .into_iter()
        .filter(|row| row.kind() == TransactionKind::PlanAdjustment)
        .count();
    assert_eq!(adjustments, 0, "downgrades write no adjustment row");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn plan_change_moves_balance_only_by_the_adjustment(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let now = Utc::now();
    seed_plan(&pool, "growth", Decimal::new(9900, 2), 50_000).await;
    seed_plan(&pool, "scale", Decimal::new(19900, 2), 100_000).await;
    sqlx::query(
        "INSERT INTO token_pricing (id, action_type, token_cost, category) VALUES ($1, 'proposal.draft', 30, 'test')",
    )
    .bind(Uuid::new_v4())
    .execute(&pool)
    .await
    .unwrap();

    plan_service(&pool)
        .create_subscription(33, "growth", false, now)
        .await
        .unwrap();

    let authorizer = ConsumptionAuthorizer::new(
        PricingCatalog::with_ttl(pool.clone(), StdDuration::from_secs(60)),
        TokenLedger::new(pool.clone()),
        Arc::new(StripeLikeInvoicing),
    );
    let spent = authorizer.authorize(33, "proposal.draft").await.unwrap();
    assert_eq!(spent.balance_after, 49_970);

    pin_half_spent_period(&pool, 33, now).await;
    let outcome = plan_service(&pool)
        .change_plan(33, "scale", now)
        .await
        .unwrap();

    assert_eq!(outcome.token_adjustment, 25_000);
    assert_eq!(outcome.new_balance, 74_970);

    let ledger = TokenLedger::new(pool.clone());
    assert_eq!(ledger.verify_ledger(33).await.unwrap(), 74_970);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn changing_to_the_current_plan_is_rejected(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let now = Utc::now();
    seed_plan(&pool, "growth", Decimal::new(9900, 2), 50_000).await;
    plan_service(&pool)
        .create_subscription(34, "growth", false, now)
        .await
        .unwrap();

    let err = plan_service(&pool)
        .change_plan(34, "growth", now)
        .await
        .expect_err("no-op plan change");
    assert!(matches!(
        err,
        agencyos_backend::tokens::TokenError::InvalidRequest(_)
    ));
}
