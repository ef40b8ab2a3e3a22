use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config;

use super::models::PricingEntry;
use super::TokenError;

/// key: token-pricing-catalog -> action cost resolution, hot path
///
/// Costs are read on every consumption check, so resolved entries are held
/// in a TTL cache. Catalog edits go through this service and push-invalidate
/// the cached entry immediately; stale reads are otherwise bounded by the TTL.
#[derive(Clone)]
pub struct PricingCatalog {
    pool: PgPool,
    cache: Arc<DashMap<String, CachedCost>>,
    ttl: Duration,
}

#[derive(Debug, Clone, Copy)]
struct CachedCost {
    token_cost: i64,
    active: bool,
    fetched_at: Instant,
}

impl PricingCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self::with_ttl(
            pool,
            Duration::from_secs(*config::TOKEN_PRICING_CACHE_TTL_SECS),
        )
    }

    pub fn with_ttl(pool: PgPool, ttl: Duration) -> Self {
        Self {
            pool,
            cache: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Resolve the token cost of an action type, failing closed: an absent or
    /// deactivated catalog entry denies the action rather than pricing it at
    /// zero.
    pub async fn cost(&self, action_type: &str) -> Result<i64, TokenError> {
        if let Some(cached) = self.cache.get(action_type) {
            if cached.fetched_at.elapsed() < self.ttl {
                if cached.active {
                    return Ok(cached.token_cost);
                }
                return Err(TokenError::UnknownActionType(action_type.to_string()));
            }
        }

        let row: Option<(i64, bool)> =
            sqlx::query_as("SELECT token_cost, active FROM token_pricing WHERE action_type = $1")
                .bind(action_type)
                .fetch_optional(&self.pool)
                .await?;

        let Some((token_cost, active)) = row else {
            return Err(TokenError::UnknownActionType(action_type.to_string()));
        };

        self.cache.insert(
            action_type.to_string(),
            CachedCost {
                token_cost,
                active,
                fetched_at: Instant::now(),
            },
        );

        if !active {
            return Err(TokenError::UnknownActionType(action_type.to_string()));
        }
        Ok(token_cost)
    }

    pub async fn list_active(&self) -> Result<Vec<PricingEntry>, TokenError> {
        let entries = sqlx::query_as::<_, PricingEntry>(
            "SELECT * FROM token_pricing WHERE active = TRUE ORDER BY category, action_type",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// Entries referenced by ledger rows are never deleted; an upsert either
    /// creates a new entry or revises cost/category/active in place.
    pub async fn upsert_entry(
        &self,
        action_type: &str,
        token_cost: i64,
        category: &str,
        active: bool,
    ) -> Result<PricingEntry, TokenError> {
        if token_cost < 0 {
            return Err(TokenError::InvalidRequest(
                "token_cost must be non-negative".to_string(),
            ));
        }

        let entry = sqlx::query_as::<_, PricingEntry>(
            r#"
            INSERT INTO token_pricing (id, action_type, token_cost, category, active)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (action_type)
            DO UPDATE SET
                token_cost = EXCLUDED.token_cost,
                category = EXCLUDED.category,
                active = EXCLUDED.active,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(action_type)
        .bind(token_cost)
        .bind(category)
        .bind(active)
        .fetch_one(&self.pool)
        .await?;

        self.cache.remove(action_type);
        Ok(entry)
    }

    pub async fn deactivate_entry(&self, action_type: &str) -> Result<(), TokenError> {
        let result =
            sqlx::query("UPDATE token_pricing SET active = FALSE, updated_at = NOW() WHERE action_type = $1")
                .bind(action_type)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(TokenError::UnknownActionType(action_type.to_string()));
        }
        self.cache.remove(action_type);
        Ok(())
    }
}
