use std::sync::Arc;

use tracing::{debug, warn};

use super::adapters::InvoicingProvider;
use super::catalog::PricingCatalog;
use super::ledger::TokenLedger;
use super::models::{AuthorizeOutcome, TokenSubscription, TransactionDetail, TransactionKind};
use super::overage;
use super::TokenError;

/// key: token-authorizer -> allow/deny + atomic debit per metered action
///
/// Feature modules call `authorize` before performing a metered action and
/// must not perform it on a denial. The decision and the debit are one
/// conditional update, so two racing calls can never both spend a balance
/// that only covers one of them.
#[derive(Clone)]
pub struct ConsumptionAuthorizer {
    catalog: PricingCatalog,
    ledger: TokenLedger,
    invoicing: Arc<dyn InvoicingProvider>,
}

impl ConsumptionAuthorizer {
    pub fn new(
        catalog: PricingCatalog,
        ledger: TokenLedger,
        invoicing: Arc<dyn InvoicingProvider>,
    ) -> Self {
        Self {
            catalog,
            ledger,
            invoicing,
        }
    }

    pub async fn authorize(
        &self,
        tenant_id: i32,
        action_type: &str,
    ) -> Result<AuthorizeOutcome, TokenError> {
        // Fails closed: an action type missing from the catalog is an error,
        // never a free pass.
        let cost = self.catalog.cost(action_type).await?;

        let Some(subscription) = self.ledger.subscription(tenant_id).await? else {
            return Err(TokenError::SubscriptionMissing(tenant_id));
        };
        if !subscription.is_live() {
            return Err(TokenError::SubscriptionFrozen(tenant_id));
        }

        if cost == 0 {
            return Ok(free_outcome(
                action_type,
                subscription.token_balance,
            ));
        }

        let description = format!("metered action {action_type}");
        let mut balance = subscription.token_balance;
        let mut retried = false;

        loop {
            if balance >= cost {
                match self
                    .ledger
                    .conditional_debit(tenant_id, cost, action_type, false, &description)
                    .await
                {
                    Ok(debit) => {
                        return Ok(AuthorizeOutcome {
                            allowed: true,
                            action_type: action_type.to_string(),
                            cost,
                            balance_before: debit.balance_before,
                            balance_after: debit.balance_after,
                            transaction_id: Some(debit.id),
                            overage: None,
                            charge_flagged: false,
                        });
                    }
                    Err(TokenError::ConcurrentDebitConflict) if !retried => {
                        // The condition is re-checked against fresh state on
                        // each attempt; a single lost race gets one retry.
                        retried = true;
                        debug!(tenant_id, action_type, "debit lost race, retrying once");
                        let Some(fresh) = self.ledger.subscription(tenant_id).await? else {
                            return Err(TokenError::SubscriptionMissing(tenant_id));
                        };
                        balance = fresh.token_balance;
                        continue;
                    }
                    Err(TokenError::ConcurrentDebitConflict) => {
                        return Ok(denied_outcome(action_type, cost, balance));
                    }
                    Err(TokenError::InsufficientBalance { available, .. }) => {
                        // Lost the race into a shortfall; fall through to the
                        // overage/denial branch with the authoritative balance.
                        balance = available;
                    }
                    Err(err) => return Err(err),
                }
            }

            if !subscription.allow_overage {
                return Ok(denied_outcome(action_type, cost, balance));
            }

            return self
                .debit_into_overage(tenant_id, action_type, cost, &subscription, &description)
                .await;
        }
    }

    async fn debit_into_overage(
        &self,
        tenant_id: i32,
        action_type: &str,
        cost: i64,
        subscription: &TokenSubscription,
        description: &str,
    ) -> Result<AuthorizeOutcome, TokenError> {
        let debit = self
            .ledger
            .conditional_debit(tenant_id, cost, action_type, true, description)
            .await?;

        let event = overage::billing_event(&debit, cost, subscription.overage_token_cost);
        let mut charge_flagged = false;

        if event.tokens_over_budget > 0 {
            // Zero-delta side row: the monetary charge is auditable in the
            // ledger without disturbing the token fold.
            self.ledger
                .apply_delta(
                    tenant_id,
                    0,
                    TransactionKind::OverageCharge,
                    Some(action_type),
                    &format!("overage charge for {action_type}"),
                    TransactionDetail::OverageChargeV1 {
                        tokens_over_budget: event.tokens_over_budget,
                        overage_token_cost: event.overage_token_cost,
                        amount: event.amount,
                    },
                )
                .await?;

            if let Err(err) = self.invoicing.charge_overage(&event).await {
                // Tokens already moved stand; the failed charge is flagged
                // for manual collection rather than rolled back.
                warn!(
                    ?err,
                    tenant_id,
                    amount = %event.amount,
                    "invoicing provider rejected overage charge"
                );
                self.ledger.flag_invoicing(tenant_id).await?;
                charge_flagged = true;
            }
        }

        let overage = (event.tokens_over_budget > 0).then_some(event);
        Ok(AuthorizeOutcome {
            allowed: true,
            action_type: action_type.to_string(),
            cost,
            balance_before: debit.balance_before,
            balance_after: debit.balance_after,
            transaction_id: Some(debit.id),
            overage,
            charge_flagged,
        })
    }
}

fn free_outcome(action_type: &str, balance: i64) -> AuthorizeOutcome {
    AuthorizeOutcome {
        allowed: true,
        action_type: action_type.to_string(),
        cost: 0,
        balance_before: balance,
        balance_after: balance,
        transaction_id: None,
        overage: None,
        charge_flagged: false,
    }
}

fn denied_outcome(action_type: &str, cost: i64, balance: i64) -> AuthorizeOutcome {
    AuthorizeOutcome {
        allowed: false,
        action_type: action_type.to_string(),
        cost,
        balance_before: balance,
        balance_after: balance,
        transaction_id: None,
        overage: None,
        charge_flagged: false,
    }
}
