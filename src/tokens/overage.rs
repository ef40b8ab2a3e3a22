use rust_decimal::Decimal;

use super::models::{OverageBillingEvent, TokenTransaction};

/// key: token-overage -> per-token billing beyond the allocation
///
/// Only the portion of a debit that lands below zero is billable: a tenant
/// spending its last prepaid tokens on the way into overage pays the
/// per-token rate for the overdrafted remainder, not the whole cost.
pub fn tokens_over_budget(cost: i64, balance_after: i64) -> i64 {
    cost.min((-balance_after).max(0))
}

pub fn overage_charge_amount(tokens_over_budget: i64, overage_token_cost: Decimal) -> Decimal {
    Decimal::from(tokens_over_budget) * overage_token_cost
}

pub fn billing_event(
    debit: &TokenTransaction,
    cost: i64,
    overage_token_cost: Decimal,
) -> OverageBillingEvent {
    let over = tokens_over_budget(cost, debit.balance_after);
    OverageBillingEvent {
        tenant_id: debit.tenant_id,
        subscription_id: debit.subscription_id,
        tokens_over_budget: over,
        overage_token_cost,
        amount: overage_charge_amount(over, overage_token_cost),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn partial_overdraft_bills_only_the_negative_portion() {
        // balance 20, cost 30 -> after -10, bill 10 tokens
        assert_eq!(tokens_over_budget(30, -10), 10);
        assert_eq!(overage_charge_amount(10, dec!(0.01)), dec!(0.10));
    }

    #[test]
    fn fully_overdrafted_debit_bills_the_whole_cost() {
        // balance -10, cost 30 -> after -40, the entire debit is over budget
        assert_eq!(tokens_over_budget(30, -40), 30);
    }

    #[test]
    fn debit_ending_at_or_above_zero_bills_nothing() {
        assert_eq!(tokens_over_budget(30, 0), 0);
        assert_eq!(tokens_over_budget(30, 70), 0);
        assert_eq!(overage_charge_amount(0, dec!(0.01)), dec!(0.00));
    }
}
