use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;

use super::models::OverageBillingEvent;

/// key: token-invoicing-adapter -> external payment provider seam
///
/// The engine computes charge amounts; the provider moves money. A failed
/// charge never rolls a token transaction back: tokens already moved stand
/// and the failure is flagged for manual collection.
#[async_trait]
pub trait InvoicingProvider: Send + Sync {
    async fn charge_overage(&self, event: &OverageBillingEvent) -> Result<Value>;
    async fn invoice_plan_change(
        &self,
        tenant_id: i32,
        amount: Decimal,
        description: &str,
    ) -> Result<Value>;
}

/// key: token-invoicing-stripe -> stub implementation
pub struct StripeLikeInvoicing;

#[async_trait]
impl InvoicingProvider for StripeLikeInvoicing {
    async fn charge_overage(&self, event: &OverageBillingEvent) -> Result<Value> {
        Ok(json_stub(
            "overage_charge",
            serde_json::json!({
                "tenant_id": event.tenant_id,
                "tokens_over_budget": event.tokens_over_budget,
                "amount": event.amount,
            }),
        ))
    }

    async fn invoice_plan_change(
        &self,
        tenant_id: i32,
        amount: Decimal,
        description: &str,
    ) -> Result<Value> {
        Ok(json_stub(
            "plan_change",
            serde_json::json!({
                "tenant_id": tenant_id,
                "amount": amount,
                "description": description,
            }),
        ))
    }
}

fn json_stub(kind: &str, payload: Value) -> Value {
    serde_json::json!({
        "kind": kind,
        "payload": payload,
        "integration": "stubbed",
    })
}
