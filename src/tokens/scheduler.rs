use anyhow::Result;
use chrono::{DateTime, Months, Utc};
use sqlx::{FromRow, PgPool};
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config;

use super::ledger::TokenLedger;
use super::models::{TransactionDetail, TransactionKind};
use super::TokenError;

/// key: token-rollover-scheduler -> period boundary allocation grants
pub fn spawn(pool: PgPool) {
    let interval = TokioDuration::from_secs(*config::TOKEN_ROLLOVER_SCAN_INTERVAL_SECS);

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if let Err(err) = process_tick(&pool, now).await {
                warn!(?err, "token rollover tick failed");
            }
        }
    });
}

/// key: token-rollover-scheduler -> tick handler
///
/// Scans live subscriptions whose period has ended and rolls each one over.
/// Every per-subscription step is idempotent, so an interrupted batch is
/// safe to re-run in full on the next tick.
pub async fn process_tick(pool: &PgPool, now: DateTime<Utc>) -> Result<()> {
    let ledger = TokenLedger::new(pool.clone());
    let candidates = sqlx::query_as::<_, RolloverCandidate>(
        r#"
        SELECT
            s.id,
            s.tenant_id,
            s.current_period_end,
            s.cancel_at_period_end,
            p.monthly_tokens,
            p.code AS plan_code
        FROM token_subscriptions s
        JOIN token_plans p ON p.id = s.plan_id
        WHERE s.status IN ('trialing', 'active')
          AND s.current_period_end <= $1
        "#,
    )
    .bind(now)
    .fetch_all(pool)
    .await?;

    for record in candidates {
        if record.cancel_at_period_end {
            match retire_subscription(pool, &record).await {
                Ok(true) => info!(
                    tenant_id = record.tenant_id,
                    subscription = %record.id,
                    "retired subscription at period end"
                ),
                Ok(false) => {}
                Err(err) => warn!(
                    ?err,
                    tenant_id = record.tenant_id,
                    "failed to retire subscription at period end"
                ),
            }
            continue;
        }

        match rollover_subscription(&ledger, &record).await {
            Ok(new_balance) => info!(
                tenant_id = record.tenant_id,
                subscription = %record.id,
                plan = %record.plan_code,
                allocation = record.monthly_tokens,
                new_balance,
                "rolled subscription into new period"
            ),
            Err(TokenError::RolloverAlreadyApplied {
                subscription_id,
                period_end,
            }) => {
                // Retried boundary: the guard found the period already
                // advanced. Logged, not a failure.
                debug!(
                    tenant_id = record.tenant_id,
                    subscription = %subscription_id,
                    %period_end,
                    "rollover already applied for boundary"
                );
            }
            Err(err) => warn!(
                ?err,
                tenant_id = record.tenant_id,
                subscription = %record.id,
                "failed to roll subscription over"
            ),
        }
    }

    Ok(())
}

/// Advance one billing interval and grant the plan's monthly allocation.
/// The guard keys on `(id, current_period_end)`: a concurrent or repeated
/// run of the same boundary matches zero rows and grants nothing. Unused
/// balance rolls over untouched; the grant is purely additive.
async fn rollover_subscription(
    ledger: &TokenLedger,
    record: &RolloverCandidate,
) -> Result<i64, TokenError> {
    let observed_end = record.current_period_end;
    let next_end = next_period_end(observed_end);

    let mut tx = ledger.pool().begin().await?;

    let updated: Option<(i64,)> = sqlx::query_as(
        r#"
        UPDATE token_subscriptions
        SET current_period_start = current_period_end,
            current_period_end = $3,
            tokens_used_this_period = 0,
            token_balance = token_balance + $4,
            status = 'active',
            is_trialing = FALSE,
            updated_at = NOW()
        WHERE id = $1
          AND current_period_end = $2
          AND status IN ('trialing', 'active')
        RETURNING token_balance
        "#,
    )
    .bind(record.id)
    .bind(observed_end)
    .bind(next_end)
    .bind(record.monthly_tokens)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((balance_after,)) = updated else {
        return Err(TokenError::RolloverAlreadyApplied {
            subscription_id: record.id,
            period_end: observed_end,
        });
    };

    sqlx::query(
        r#"
        INSERT INTO token_transactions (
            id, tenant_id, subscription_id, kind, tokens,
            balance_before, balance_after, action_type, description, detail
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, NULL, $8, $9)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(record.tenant_id)
    .bind(record.id)
    .bind(TransactionKind::Allocation.as_str())
    .bind(record.monthly_tokens)
    .bind(balance_after - record.monthly_tokens)
    .bind(balance_after)
    .bind(format!("monthly allocation for plan {}", record.plan_code))
    .bind(
        TransactionDetail::AllocationV1 {
            period_start: observed_end,
            period_end: next_end,
        }
        .to_value(),
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(balance_after)
}

/// One billing interval out from the observed boundary. chrono clamps to the
/// last day of shorter months, so a Jan 31 anchor lands on Feb 29/28.
fn next_period_end(end: DateTime<Utc>) -> DateTime<Utc> {
    end.checked_add_months(Months::new(1)).unwrap_or(end)
}

async fn retire_subscription(pool: &PgPool, record: &RolloverCandidate) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE token_subscriptions
        SET status = 'canceled', updated_at = NOW()
        WHERE id = $1
          AND current_period_end = $2
          AND status IN ('trialing', 'active')
        "#,
    )
    .bind(record.id)
    .bind(record.current_period_end)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(Debug, FromRow)]
struct RolloverCandidate {
    id: Uuid,
    tenant_id: i32,
    current_period_end: DateTime<Utc>,
    cancel_at_period_end: bool,
    monthly_tokens: i64,
    plan_code: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn period_advances_by_one_month() {
        let end = Utc.with_ymd_and_hms(2024, 3, 15, 8, 30, 0).unwrap();
        assert_eq!(
            next_period_end(end),
            Utc.with_ymd_and_hms(2024, 4, 15, 8, 30, 0).unwrap()
        );
    }

    #[test]
    fn month_end_anchors_clamp_to_shorter_months() {
        let end = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        assert_eq!(
            next_period_end(end),
            Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap()
        );

        let end = Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap();
        assert_eq!(
            next_period_end(end),
            Utc.with_ymd_and_hms(2025, 2, 28, 0, 0, 0).unwrap()
        );
    }
}
