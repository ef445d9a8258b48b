//! freelancedesk Background Worker
//!
//! Handles scheduled jobs:
//! - Recurring subscription billing sweep (hourly)
//! - Work invariant audit (daily at 4:00 AM UTC)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use freelancedesk_billing::{create_pool, BillingService, InvariantCheckSummary, SweepOutcome};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Cron for the billing sweep, overridable with `BILLING_SWEEP_CRON`
const DEFAULT_SWEEP_CRON: &str = "0 0 * * * *";
const DEFAULT_AUDIT_CRON: &str = "0 0 4 * * *";

/// Log results of a billing sweep
fn log_sweep_outcomes(outcomes: &[SweepOutcome]) -> usize {
    let charged = outcomes.iter().filter(|o| o.charged).count();
    let failed = outcomes.len() - charged;

    info!(charged = charged, failed = failed, "Billing sweep cycle complete");

    for outcome in outcomes.iter().filter(|o| !o.charged) {
        error!(
            work_id = %outcome.work_id,
            error = outcome.error.as_deref().unwrap_or("unknown"),
            "Subscription renewal failed"
        );
    }

    failed
}

fn log_audit_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(works_checked = summary.works_checked, "Invariant audit passed");
    } else {
        warn!(
            works_checked = summary.works_checked,
            checks_failed = summary.checks_failed,
            violations = summary.violations.len(),
            "Invariant audit found violations"
        );
    }
}

async fn run_billing_sweep(billing: &BillingService) -> Option<usize> {
    match billing.sweep.run(OffsetDateTime::now_utc()).await {
        Ok(outcomes) => Some(log_sweep_outcomes(&outcomes)),
        Err(e) => {
            error!(error = %e, "Billing sweep could not load due subscriptions");
            None
        }
    }
}

async fn run_invariant_audit(billing: &BillingService) -> Option<InvariantCheckSummary> {
    match billing.invariants.check_all().await {
        Ok(summary) => {
            log_audit_summary(&summary);
            Some(summary)
        }
        Err(e) => {
            error!(error = %e, "Invariant audit failed");
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting freelancedesk Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url, 5).await?;
    info!("Database pool created");

    let billing = Arc::new(BillingService::from_env(pool)?);

    let sweep_cron =
        std::env::var("BILLING_SWEEP_CRON").unwrap_or_else(|_| DEFAULT_SWEEP_CRON.to_string());

    let scheduler = JobScheduler::new().await?;

    // Job 1: Charge due subscriptions
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async(sweep_cron.as_str(), move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running scheduled billing sweep");
                run_billing_sweep(&billing).await;
            })
        })?)
        .await?;
    info!(cron = %sweep_cron, "Scheduled: Billing sweep");

    // Job 2: Consistency audit over all works
    let audit_billing = billing.clone();
    scheduler
        .add(Job::new_async(DEFAULT_AUDIT_CRON, move |_uuid, _l| {
            let billing = audit_billing.clone();
            Box::pin(async move {
                info!("Running invariant audit");
                run_invariant_audit(&billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Invariant audit (daily at 4:00 AM UTC)");

    // Job 3: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;

    scheduler.start().await?;
    info!("Worker scheduler started");

    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
