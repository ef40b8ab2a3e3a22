use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub mod adapters;
pub mod api;
pub mod authorizer;
pub mod catalog;
pub mod ledger;
pub mod models;
pub mod overage;
pub mod plans;
pub mod reconciliation;
pub mod scheduler;

pub use adapters::{InvoicingProvider, StripeLikeInvoicing};
pub use authorizer::ConsumptionAuthorizer;
pub use catalog::PricingCatalog;
pub use ledger::TokenLedger;
pub use models::{
    AuthorizeOutcome, OverageBillingEvent, PlanChangeOutcome, PricingEntry, SubscriptionStatus,
    TokenPlan, TokenSubscription, TokenTransaction, TransactionDetail, TransactionKind,
};
pub use plans::PlanService;
pub use reconciliation::{spawn_audit_sweep, start_audit_worker, AuditHandle, AuditJob};
pub use scheduler::{process_tick as run_rollover_tick, spawn as spawn_rollover_scheduler};

/// key: token-errors -> engine taxonomy, all recoverable at the caller
/// except `LedgerDivergence`, which halts debits for the affected tenant.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("unknown action type `{0}`")]
    UnknownActionType(String),
    #[error("unknown or inactive plan `{0}`")]
    UnknownPlan(String),
    #[error("tenant {0} has no live subscription")]
    SubscriptionMissing(i32),
    #[error("tenant {0} subscription is frozen pending reconciliation")]
    SubscriptionFrozen(i32),
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: i64, available: i64 },
    #[error("concurrent debit conflict")]
    ConcurrentDebitConflict,
    #[error("rollover already applied for subscription {subscription_id} at {period_end}")]
    RolloverAlreadyApplied {
        subscription_id: Uuid,
        period_end: DateTime<Utc>,
    },
    #[error("ledger fold {expected} diverged from stored balance {actual}")]
    LedgerDivergence { expected: i64, actual: i64 },
    #[error("{0}")]
    InvalidRequest(String),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}
