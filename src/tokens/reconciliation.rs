use anyhow::{anyhow, Result};
use sqlx::PgPool;
use tokio::sync::mpsc::{channel, Sender};
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, error, warn};

use crate::config;

use super::ledger::TokenLedger;
use super::TokenError;

/// key: token-ledger-audit -> background fold verification
///
/// A divergence between the ledger fold and the stored balance means data
/// corruption; the affected tenant's subscription is frozen so no further
/// debits run until someone reconciles it. This runs out-of-band, never on
/// the request path.
#[derive(Debug)]
pub enum AuditJob {
    LedgerAudit { tenant_id: i32 },
}

/// key: token-ledger-audit-handle -> enqueue interface
#[derive(Clone)]
pub struct AuditHandle {
    sender: Sender<AuditJob>,
}

impl AuditHandle {
    pub async fn dispatch(&self, job: AuditJob) -> Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|err| anyhow!("failed to enqueue ledger audit job: {err}"))
    }
}

pub fn start_audit_worker(pool: PgPool) -> AuditHandle {
    let (tx, mut rx) = channel(64);
    tokio::spawn(async move {
        let ledger = TokenLedger::new(pool);
        while let Some(job) = rx.recv().await {
            match job {
                AuditJob::LedgerAudit { tenant_id } => match ledger.verify_ledger(tenant_id).await
                {
                    Ok(fold) => {
                        debug!(tenant_id, fold, "ledger fold matches stored balance");
                    }
                    Err(TokenError::LedgerDivergence { expected, actual }) => {
                        error!(
                            tenant_id,
                            expected, actual, "ledger fold diverged from stored balance, freezing tenant"
                        );
                        if let Err(err) = ledger.freeze(tenant_id).await {
                            error!(?err, tenant_id, "failed to freeze diverged subscription");
                        }
                    }
                    Err(TokenError::SubscriptionMissing(_)) => {
                        debug!(tenant_id, "no live subscription to audit");
                    }
                    Err(err) => {
                        error!(?err, tenant_id, "ledger audit failed");
                    }
                },
            }
        }
    });

    AuditHandle { sender: tx }
}

/// Periodic sweep enqueueing an audit for every non-retired subscription.
pub fn spawn_audit_sweep(pool: PgPool, handle: AuditHandle) {
    let interval = TokioDuration::from_secs(*config::TOKEN_LEDGER_AUDIT_INTERVAL_SECS);

    tokio::spawn(async move {
        let ledger = TokenLedger::new(pool);
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let tenants = match ledger.live_tenant_ids().await {
                Ok(tenants) => tenants,
                Err(err) => {
                    warn!(?err, "failed to list tenants for ledger audit sweep");
                    continue;
                }
            };
            for tenant_id in tenants {
                if let Err(err) = handle.dispatch(AuditJob::LedgerAudit { tenant_id }).await {
                    warn!(?err, tenant_id, "failed to enqueue ledger audit");
                }
            }
        }
    });
}
