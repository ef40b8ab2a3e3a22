use sqlx::PgPool;
use uuid::Uuid;

use super::models::{
    TokenPlan, TokenSubscription, TokenTransaction, TransactionDetail, TransactionKind,
};
use super::TokenError;

/// key: token-ledger -> sole writer of subscription balances
///
/// Every balance mutation flows through `apply_delta` or `conditional_debit`:
/// one database transaction updates the subscription row and appends the
/// ledger row, so replaying the ledger always folds back to the stored
/// balance. No component reads-then-writes the balance field directly.
#[derive(Clone)]
pub struct TokenLedger {
    pool: PgPool,
}

impl TokenLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Latest non-retired subscription row for a tenant. Canceled rows are
    /// kept for ledger integrity but never returned here.
    pub async fn subscription(
        &self,
        tenant_id: i32,
    ) -> Result<Option<TokenSubscription>, TokenError> {
        let row = sqlx::query_as::<_, TokenSubscription>(
            r#"
            SELECT * FROM token_subscriptions
            WHERE tenant_id = $1 AND status <> 'canceled'
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn subscription_with_plan(
        &self,
        tenant_id: i32,
    ) -> Result<Option<(TokenSubscription, TokenPlan)>, TokenError> {
        let Some(subscription) = self.subscription(tenant_id).await? else {
            return Ok(None);
        };
        let plan = sqlx::query_as::<_, TokenPlan>("SELECT * FROM token_plans WHERE id = $1")
            .bind(subscription.plan_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(Some((subscription, plan)))
    }

    /// Apply a signed token delta and append the matching ledger row in one
    /// database transaction. Negative balances are a valid state; nothing is
    /// clamped here.
    pub async fn apply_delta(
        &self,
        tenant_id: i32,
        delta: i64,
        kind: TransactionKind,
        action_type: Option<&str>,
        description: &str,
        detail: TransactionDetail,
    ) -> Result<TokenTransaction, TokenError> {
        let used_delta = if kind.counts_toward_usage() {
            (-delta).max(0)
        } else {
            0
        };
        let lifetime_delta = if matches!(kind, TransactionKind::Consume | TransactionKind::OverageCharge)
        {
            (-delta).max(0)
        } else {
            0
        };

        let mut tx = self.pool.begin().await?;

        let updated: Option<(Uuid, i64)> = sqlx::query_as(
            r#"
            UPDATE token_subscriptions
            SET token_balance = token_balance + $2,
                tokens_used_this_period = tokens_used_this_period + $3,
                lifetime_tokens_used = lifetime_tokens_used + $4,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM token_subscriptions
                WHERE tenant_id = $1 AND status <> 'canceled'
                ORDER BY updated_at DESC
                LIMIT 1
            )
            RETURNING id, token_balance
            "#,
        )
        .bind(tenant_id)
        .bind(delta)
        .bind(used_delta)
        .bind(lifetime_delta)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((subscription_id, balance_after)) = updated else {
            return Err(TokenError::SubscriptionMissing(tenant_id));
        };

        let transaction = insert_transaction(
            &mut tx,
            tenant_id,
            subscription_id,
            kind,
            delta,
            balance_after - delta,
            balance_after,
            action_type,
            description,
            &detail,
        )
        .await?;

        tx.commit().await?;
        Ok(transaction)
    }

    /// The atomic check-and-debit collapsing the read-modify-write race:
    /// decrement where the balance still covers the cost (or unconditionally
    /// when overage is permitted), with before/after taken from the same
    /// statement. Zero rows affected is re-classified against fresh state so
    /// the caller can distinguish a lost race from a genuine shortfall.
    pub async fn conditional_debit(
        &self,
        tenant_id: i32,
        cost: i64,
        action_type: &str,
        allow_overage: bool,
        description: &str,
    ) -> Result<TokenTransaction, TokenError> {
        let mut tx = self.pool.begin().await?;

        let updated: Option<(Uuid, i64)> = sqlx::query_as(
            r#"
            UPDATE token_subscriptions
            SET token_balance = token_balance - $2,
                tokens_used_this_period = tokens_used_this_period + $2,
                lifetime_tokens_used = lifetime_tokens_used + $2,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM token_subscriptions
                WHERE tenant_id = $1 AND status IN ('trialing', 'active')
                ORDER BY updated_at DESC
                LIMIT 1
            )
            AND ($3 OR token_balance >= $2)
            RETURNING id, token_balance
            "#,
        )
        .bind(tenant_id)
        .bind(cost)
        .bind(allow_overage)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((subscription_id, balance_after)) = updated else {
            drop(tx);
            return Err(self.classify_failed_debit(tenant_id, cost).await?);
        };

        let transaction = insert_transaction(
            &mut tx,
            tenant_id,
            subscription_id,
            TransactionKind::Consume,
            -cost,
            balance_after + cost,
            balance_after,
            Some(action_type),
            description,
            &TransactionDetail::ConsumeV1 {
                action_type: action_type.to_string(),
                token_cost: cost,
            },
        )
        .await?;

        tx.commit().await?;
        Ok(transaction)
    }

    async fn classify_failed_debit(
        &self,
        tenant_id: i32,
        cost: i64,
    ) -> Result<TokenError, TokenError> {
        let Some(subscription) = self.subscription(tenant_id).await? else {
            return Ok(TokenError::SubscriptionMissing(tenant_id));
        };
        if !subscription.is_live() {
            return Ok(TokenError::SubscriptionFrozen(tenant_id));
        }
        if subscription.token_balance < cost {
            return Ok(TokenError::InsufficientBalance {
                required: cost,
                available: subscription.token_balance,
            });
        }
        // The row held enough at re-read; the conditional update lost a race
        // against a concurrent debit.
        Ok(TokenError::ConcurrentDebitConflict)
    }

    pub async fn history(
        &self,
        tenant_id: i32,
        limit: i64,
    ) -> Result<Vec<TokenTransaction>, TokenError> {
        let rows = sqlx::query_as::<_, TokenTransaction>(
            r#"
            SELECT * FROM token_transactions
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Offline consistency check: the fold of all ledger rows for the live
    /// subscription must equal its stored balance exactly. Balance and fold
    /// are read in a single statement so a concurrent debit cannot fake a
    /// divergence.
    pub async fn verify_ledger(&self, tenant_id: i32) -> Result<i64, TokenError> {
        let Some(subscription) = self.subscription(tenant_id).await? else {
            return Err(TokenError::SubscriptionMissing(tenant_id));
        };

        let (stored, fold): (i64, i64) = sqlx::query_as(
            r#"
            SELECT s.token_balance,
                   COALESCE((SELECT SUM(t.tokens) FROM token_transactions t
                             WHERE t.subscription_id = s.id), 0)::BIGINT
            FROM token_subscriptions s
            WHERE s.id = $1
            "#,
        )
        .bind(subscription.id)
        .fetch_one(&self.pool)
        .await?;

        if fold != stored {
            return Err(TokenError::LedgerDivergence {
                expected: fold,
                actual: stored,
            });
        }
        Ok(fold)
    }

    /// Halt further debits for a tenant after a ledger divergence. The frozen
    /// row stays in place for reconciliation; the authorizer fails closed on
    /// it.
    pub async fn freeze(&self, tenant_id: i32) -> Result<(), TokenError> {
        sqlx::query(
            r#"
            UPDATE token_subscriptions
            SET status = 'frozen', updated_at = NOW()
            WHERE id = (
                SELECT id FROM token_subscriptions
                WHERE tenant_id = $1 AND status IN ('trialing', 'active')
                ORDER BY updated_at DESC
                LIMIT 1
            )
            "#,
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// A failed external charge never rolls tokens back; it marks the
    /// subscription for manual collection instead.
    pub async fn flag_invoicing(&self, tenant_id: i32) -> Result<(), TokenError> {
        sqlx::query(
            r#"
            UPDATE token_subscriptions
            SET invoicing_flagged = TRUE, updated_at = NOW()
            WHERE tenant_id = $1 AND status <> 'canceled'
            "#,
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn live_tenant_ids(&self) -> Result<Vec<i32>, TokenError> {
        let ids: Vec<(i32,)> =
            sqlx::query_as("SELECT tenant_id FROM token_subscriptions WHERE status <> 'canceled'")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}

#[allow(clippy::too_many_arguments)]
async fn insert_transaction(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    tenant_id: i32,
    subscription_id: Uuid,
    kind: TransactionKind,
    tokens: i64,
    balance_before: i64,
    balance_after: i64,
    action_type: Option<&str>,
    description: &str,
    detail: &TransactionDetail,
) -> Result<TokenTransaction, TokenError> {
    let row = sqlx::query_as::<_, TokenTransaction>(
        r#"
        INSERT INTO token_transactions (
            id,
            tenant_id,
            subscription_id,
            kind,
            tokens,
            balance_before,
            balance_after,
            action_type,
            description,
            detail
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(subscription_id)
    .bind(kind.as_str())
    .bind(tokens)
    .bind(balance_before)
    .bind(balance_after)
    .bind(action_type)
    .bind(description)
    .bind(detail.to_value())
    .fetch_one(&mut *tx)
    .await?;
    Ok(row)
}
