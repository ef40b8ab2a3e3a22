use std::sync::Arc;

use chrono::{DateTime, Months, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use super::adapters::InvoicingProvider;
use super::ledger::TokenLedger;
use super::models::{
    PlanChangeOutcome, TokenPlan, TokenSubscription, TokenTransaction, TransactionDetail,
    TransactionKind,
};
use super::TokenError;

/// Pro-rated token entitlement difference for a mid-period plan switch,
/// rounded half-up. Additive only in the upgrade direction: a downgrade
/// changes the forward allocation but never claws back saved balance.
pub fn pro_rated_token_adjustment(
    old_monthly_tokens: i64,
    new_monthly_tokens: i64,
    days_remaining: i64,
    days_in_period: i64,
) -> i64 {
    let diff = new_monthly_tokens - old_monthly_tokens;
    if diff <= 0 || days_in_period <= 0 {
        return 0;
    }
    let days_remaining = days_remaining.clamp(0, days_in_period);
    let numerator = diff as i128 * days_remaining as i128;
    let denominator = days_in_period as i128;
    ((2 * numerator + denominator) / (2 * denominator)) as i64
}

/// Signed pro-rated price difference handed to the invoicing collaborator:
/// positive is a charge, negative a credit. Rounded to cents.
pub fn pro_rated_price_difference(
    old_monthly_price: Decimal,
    new_monthly_price: Decimal,
    days_remaining: i64,
    days_in_period: i64,
) -> Decimal {
    if days_in_period <= 0 {
        return Decimal::ZERO;
    }
    let days_remaining = days_remaining.clamp(0, days_in_period);
    let fraction = Decimal::from(days_remaining) / Decimal::from(days_in_period);
    ((new_monthly_price - old_monthly_price) * fraction).round_dp(2)
}

/// key: token-plan-service -> signup, mid-period plan change, cancellation
#[derive(Clone)]
pub struct PlanService {
    pool: PgPool,
    ledger: TokenLedger,
    invoicing: Arc<dyn InvoicingProvider>,
}

impl PlanService {
    pub fn new(pool: PgPool, ledger: TokenLedger, invoicing: Arc<dyn InvoicingProvider>) -> Self {
        Self {
            pool,
            ledger,
            invoicing,
        }
    }

    pub async fn plan_by_code(&self, code: &str) -> Result<TokenPlan, TokenError> {
        let plan = sqlx::query_as::<_, TokenPlan>(
            "SELECT * FROM token_plans WHERE code = $1 AND active = TRUE",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        plan.ok_or_else(|| TokenError::UnknownPlan(code.to_string()))
    }

    /// Signup: one live subscription per tenant. The opening allocation is
    /// granted through the ledger so the fold invariant holds from the first
    /// row.
    pub async fn create_subscription(
        &self,
        tenant_id: i32,
        plan_code: &str,
        trial: bool,
        now: DateTime<Utc>,
    ) -> Result<(TokenSubscription, TokenTransaction), TokenError> {
        if self.ledger.subscription(tenant_id).await?.is_some() {
            return Err(TokenError::InvalidRequest(format!(
                "tenant {tenant_id} already has a live subscription"
            )));
        }

        let plan = self.plan_by_code(plan_code).await?;
        let period_end = now
            .checked_add_months(Months::new(1))
            .ok_or_else(|| TokenError::InvalidRequest("period end out of range".to_string()))?;
        let status = if trial { "trialing" } else { "active" };

        sqlx::query(
            r#"
            INSERT INTO token_subscriptions (
                id,
                tenant_id,
                plan_id,
                status,
                token_balance,
                monthly_allocation,
                tokens_used_this_period,
                lifetime_tokens_used,
                current_period_start,
                current_period_end,
                overage_token_cost,
                allow_overage,
                is_trialing,
                cancel_at_period_end
            ) VALUES ($1, $2, $3, $4, 0, $5, 0, 0, $6, $7, $8, $9, $10, FALSE)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(plan.id)
        .bind(status)
        .bind(plan.monthly_tokens)
        .bind(now)
        .bind(period_end)
        .bind(plan.overage_token_cost)
        .bind(plan.allow_overage)
        .bind(trial)
        .execute(&self.pool)
        .await?;

        let opening = self
            .ledger
            .apply_delta(
                tenant_id,
                plan.monthly_tokens,
                TransactionKind::Allocation,
                None,
                &format!("opening allocation for plan {}", plan.code),
                TransactionDetail::AllocationV1 {
                    period_start: now,
                    period_end,
                },
            )
            .await?;

        let subscription = self
            .ledger
            .subscription(tenant_id)
            .await?
            .ok_or(TokenError::SubscriptionMissing(tenant_id))?;
        Ok((subscription, opening))
    }

    /// Mid-period plan switch: the forward allocation, overage policy and
    /// plan pointer change immediately; the saved balance is preserved and
    /// only moves by the computed pro-rated adjustment.
    pub async fn change_plan(
        &self,
        tenant_id: i32,
        new_plan_code: &str,
        now: DateTime<Utc>,
    ) -> Result<PlanChangeOutcome, TokenError> {
        let Some(subscription) = self.ledger.subscription(tenant_id).await? else {
            return Err(TokenError::SubscriptionMissing(tenant_id));
        };
        if !subscription.is_live() {
            return Err(TokenError::SubscriptionFrozen(tenant_id));
        }

        let old_plan = sqlx::query_as::<_, TokenPlan>("SELECT * FROM token_plans WHERE id = $1")
            .bind(subscription.plan_id)
            .fetch_one(&self.pool)
            .await?;
        let new_plan = self.plan_by_code(new_plan_code).await?;
        if new_plan.id == old_plan.id {
            return Err(TokenError::InvalidRequest(format!(
                "tenant {tenant_id} is already on plan {new_plan_code}"
            )));
        }

        let days_in_period = (subscription.current_period_end - subscription.current_period_start)
            .num_days()
            .max(1);
        let days_remaining = (subscription.current_period_end - now)
            .num_days()
            .clamp(0, days_in_period);

        let token_adjustment = pro_rated_token_adjustment(
            old_plan.monthly_tokens,
            new_plan.monthly_tokens,
            days_remaining,
            days_in_period,
        );
        let price_difference = pro_rated_price_difference(
            old_plan.monthly_price,
            new_plan.monthly_price,
            days_remaining,
            days_in_period,
        );

        sqlx::query(
            r#"
            UPDATE token_subscriptions
            SET plan_id = $2,
                monthly_allocation = $3,
                overage_token_cost = $4,
                allow_overage = $5,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .bind(new_plan.id)
        .bind(new_plan.monthly_tokens)
        .bind(new_plan.overage_token_cost)
        .bind(new_plan.allow_overage)
        .execute(&self.pool)
        .await?;

        let new_balance = if token_adjustment > 0 {
            let adjustment = self
                .ledger
                .apply_delta(
                    tenant_id,
                    token_adjustment,
                    TransactionKind::PlanAdjustment,
                    None,
                    &format!("plan change {} -> {}", old_plan.code, new_plan.code),
                    TransactionDetail::PlanAdjustmentV1 {
                        from_plan: old_plan.code.clone(),
                        to_plan: new_plan.code.clone(),
                        days_remaining,
                        days_in_period,
                    },
                )
                .await?;
            adjustment.balance_after
        } else {
            subscription.token_balance
        };

        let mut charge_flagged = false;
        if price_difference != Decimal::ZERO {
            let description = format!(
                "pro-rated plan change {} -> {} ({days_remaining}/{days_in_period} days)",
                old_plan.code, new_plan.code
            );
            if let Err(err) = self
                .invoicing
                .invoice_plan_change(tenant_id, price_difference, &description)
                .await
            {
                warn!(
                    ?err,
                    tenant_id,
                    amount = %price_difference,
                    "invoicing provider rejected plan change charge"
                );
                self.ledger.flag_invoicing(tenant_id).await?;
                charge_flagged = true;
            }
        }

        Ok(PlanChangeOutcome {
            token_adjustment,
            pro_rated_price_difference: price_difference,
            new_balance,
            charge_flagged,
        })
    }

    /// Soft retirement: the row and its ledger survive cancellation. With
    /// `at_period_end` the scheduler retires the subscription at the next
    /// boundary instead of cutting access immediately.
    pub async fn cancel_subscription(
        &self,
        tenant_id: i32,
        at_period_end: bool,
    ) -> Result<TokenSubscription, TokenError> {
        let Some(subscription) = self.ledger.subscription(tenant_id).await? else {
            return Err(TokenError::SubscriptionMissing(tenant_id));
        };

        let row = if at_period_end {
            sqlx::query_as::<_, TokenSubscription>(
                r#"
                UPDATE token_subscriptions
                SET cancel_at_period_end = TRUE, updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(subscription.id)
            .fetch_one(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, TokenSubscription>(
                r#"
                UPDATE token_subscriptions
                SET status = 'canceled', updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(subscription.id)
            .fetch_one(&self.pool)
            .await?
        };
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn upgrade_adjustment_is_pro_rated_by_days_remaining() {
        // 50k -> 100k with half the period left grants half the difference
        assert_eq!(pro_rated_token_adjustment(50_000, 100_000, 15, 30), 25_000);
        assert_eq!(pro_rated_token_adjustment(50_000, 100_000, 30, 30), 50_000);
        assert_eq!(pro_rated_token_adjustment(50_000, 100_000, 0, 30), 0);
    }

    #[test]
    fn adjustment_rounds_half_up() {
        // 100 * 1/3 = 33.33 -> 33; 3 * 1/2 = 1.5 -> 2
        assert_eq!(pro_rated_token_adjustment(0, 100, 1, 3), 33);
        assert_eq!(pro_rated_token_adjustment(0, 3, 1, 2), 2);
    }

    #[test]
    fn downgrade_never_claws_back_balance() {
        assert_eq!(pro_rated_token_adjustment(100_000, 50_000, 15, 30), 0);
    }

    #[test]
    fn degenerate_period_produces_no_adjustment() {
        assert_eq!(pro_rated_token_adjustment(50_000, 100_000, 15, 0), 0);
    }

    #[test]
    fn price_difference_is_signed_and_rounded_to_cents() {
        assert_eq!(
            pro_rated_price_difference(dec!(49.00), dec!(99.00), 15, 30),
            dec!(25.00)
        );
        // downgrade -> credit
        assert_eq!(
            pro_rated_price_difference(dec!(99.00), dec!(49.00), 15, 30),
            dec!(-25.00)
        );
        assert_eq!(
            pro_rated_price_difference(dec!(49.00), dec!(99.00), 1, 3),
            dec!(16.67)
        );
    }
}
