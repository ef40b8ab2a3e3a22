use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// key: token-models -> plans,pricing,subscriptions,ledger
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TokenPlan {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub monthly_price: Decimal,
    pub monthly_tokens: i64,
    pub overage_token_cost: Decimal,
    pub allow_overage: bool,
    pub features: serde_json::Value,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// key: token-pricing-model -> action cost catalog entries
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PricingEntry {
    pub id: Uuid,
    pub action_type: String,
    pub token_cost: i64,
    pub category: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    Canceled,
    /// Debits halted after a ledger divergence until reconciled.
    Frozen,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Frozen => "frozen",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "trialing" => SubscriptionStatus::Trialing,
            "canceled" => SubscriptionStatus::Canceled,
            "frozen" => SubscriptionStatus::Frozen,
            _ => SubscriptionStatus::Active,
        }
    }
}

/// key: token-subscription-model -> one live row per tenant
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TokenSubscription {
    pub id: Uuid,
    pub tenant_id: i32,
    pub plan_id: Uuid,
    pub status: String,
    pub token_balance: i64,
    pub monthly_allocation: i64,
    pub tokens_used_this_period: i64,
    pub lifetime_tokens_used: i64,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub overage_token_cost: Decimal,
    pub allow_overage: bool,
    pub is_trialing: bool,
    pub cancel_at_period_end: bool,
    pub invoicing_flagged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TokenSubscription {
    /// Live means the subscription accepts debits: trialing or active.
    /// Frozen rows exist but are vetoed by the authorizer.
    pub fn is_live(&self) -> bool {
        matches!(self.status.as_str(), "trialing" | "active")
    }

    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_string(&self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Consume,
    Allocation,
    Refill,
    Bonus,
    OverageCharge,
    PlanAdjustment,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Consume => "consume",
            TransactionKind::Allocation => "allocation",
            TransactionKind::Refill => "refill",
            TransactionKind::Bonus => "bonus",
            TransactionKind::OverageCharge => "overage_charge",
            TransactionKind::PlanAdjustment => "plan_adjustment",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "allocation" => TransactionKind::Allocation,
            "refill" => TransactionKind::Refill,
            "bonus" => TransactionKind::Bonus,
            "overage_charge" => TransactionKind::OverageCharge,
            "plan_adjustment" => TransactionKind::PlanAdjustment,
            _ => TransactionKind::Consume,
        }
    }

    /// Only consume debits accrue into `tokens_used_this_period`.
    pub fn counts_toward_usage(&self) -> bool {
        matches!(self, TransactionKind::Consume)
    }
}

/// key: token-ledger-model -> append-only, never updated or deleted
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TokenTransaction {
    pub id: Uuid,
    pub tenant_id: i32,
    pub subscription_id: Uuid,
    pub kind: String,
    pub tokens: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub action_type: Option<String>,
    pub description: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TokenTransaction {
    pub fn kind(&self) -> TransactionKind {
        TransactionKind::from_string(&self.kind)
    }
}

/// Typed side-payload stored in the transaction `detail` column. The schema
/// tag carries an explicit version so the ledger stays replayable after the
/// payload shapes evolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schema")]
pub enum TransactionDetail {
    #[serde(rename = "consume.v1")]
    ConsumeV1 { action_type: String, token_cost: i64 },
    #[serde(rename = "allocation.v1")]
    AllocationV1 {
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    },
    #[serde(rename = "overage_charge.v1")]
    OverageChargeV1 {
        tokens_over_budget: i64,
        overage_token_cost: Decimal,
        amount: Decimal,
    },
    #[serde(rename = "plan_adjustment.v1")]
    PlanAdjustmentV1 {
        from_plan: String,
        to_plan: String,
        days_remaining: i64,
        days_in_period: i64,
    },
    #[serde(rename = "refill.v1")]
    RefillV1 { source: String },
}

impl TransactionDetail {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Decision returned by the consumption authorizer. `balance_after` equals
/// `balance_before` on denial; denied calls write no ledger rows.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeOutcome {
    pub allowed: bool,
    pub action_type: String,
    pub cost: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub transaction_id: Option<Uuid>,
    pub overage: Option<OverageBillingEvent>,
    pub charge_flagged: bool,
}

/// Billing event handed to the external invoicing collaborator when a debit
/// crosses below zero. This engine computes the number, it does not move
/// money.
#[derive(Debug, Clone, Serialize)]
pub struct OverageBillingEvent {
    pub tenant_id: i32,
    pub subscription_id: Uuid,
    pub tokens_over_budget: i64,
    pub overage_token_cost: Decimal,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanChangeOutcome {
    pub token_adjustment: i64,
    pub pro_rated_price_difference: Decimal,
    pub new_balance: i64,
    pub charge_flagged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn detail_payload_round_trips_with_schema_tag() {
        let detail = TransactionDetail::OverageChargeV1 {
            tokens_over_budget: 10,
            overage_token_cost: dec!(0.01),
            amount: dec!(0.10),
        };
        let value = detail.to_value();
        assert_eq!(value["schema"], "overage_charge.v1");
        let back: TransactionDetail = serde_json::from_value(value).unwrap();
        assert_eq!(back, detail);
    }

    #[test]
    fn only_consume_counts_toward_period_usage() {
        assert!(TransactionKind::Consume.counts_toward_usage());
        assert!(!TransactionKind::Allocation.counts_toward_usage());
        assert!(!TransactionKind::Refill.counts_toward_usage());
        assert!(!TransactionKind::OverageCharge.counts_toward_usage());
    }

    #[test]
    fn frozen_subscription_is_not_live() {
        let kinds = ["trialing", "active", "canceled", "frozen"];
        let live: Vec<bool> = kinds
            .iter()
            .map(|status| {
                matches!(
                    SubscriptionStatus::from_string(status),
                    SubscriptionStatus::Trialing | SubscriptionStatus::Active
                )
            })
            .collect();
        assert_eq!(live, vec![true, true, false, false]);
    }
}
