//! Reconcile every stock balance of one tenant against its transaction and
//! movement logs.
//!
//! Usage: `stockledger-audit <tenant-uuid>`
//!
//! Reads the same configuration as the ledger (`config/stockledger.*` and
//! `STOCKLEDGER__*`). Exits with status 1 when any balance has drifted.

use std::process::ExitCode;

use anyhow::{Context, bail};
use tracing::{error, info};

use stockledger_core::TenantId;
use stockledger_infra::config::LedgerConfig;

fn main() -> anyhow::Result<ExitCode> {
    let tenant: TenantId = std::env::args()
        .nth(1)
        .context("usage: stockledger-audit <tenant-uuid>")?
        .parse()
        .context("tenant id must be a UUID")?;

    let config = LedgerConfig::load().context("loading configuration")?;
    stockledger_observability::init_with(&config.log);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("starting runtime")?;
    runtime.block_on(audit(config, tenant))
}

async fn audit(config: LedgerConfig, tenant: TenantId) -> anyhow::Result<ExitCode> {
    // An in-memory store has nothing to audit.
    if config.database.url.is_none() {
        bail!("database.url is not configured; set STOCKLEDGER__DATABASE__URL");
    }
    let ledger = config.ledger().await.context("connecting to the ledger store")?;
    let report = ledger
        .reconcile_tenant(tenant)
        .await
        .context("reconciling balances")?;

    let drifted: Vec<_> = report.iter().filter(|r| !r.is_consistent()).collect();
    for rec in &drifted {
        error!(
            warehouse_id = %rec.key.warehouse_id,
            item_id = %rec.key.item_id,
            balance = %rec.balance,
            transaction_sum = %rec.transaction_sum,
            movement_sum = %rec.movement_sum,
            "balance drifted from its logs"
        );
    }
    info!(
        tenant_id = %tenant,
        balances = report.len(),
        drifted = drifted.len(),
        "audit finished"
    );

    Ok(if drifted.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
