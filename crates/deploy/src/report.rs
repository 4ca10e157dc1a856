//! Human-readable summaries of a ledger.

use comfy_table::Table;

use crate::{ledger::DeploymentLedger, orchestrator::RunReport};

/// One row per deployed contract.
pub fn records_table(ledger: &DeploymentLedger) -> Table {
    let mut table = Table::new();
    table.set_header(vec![
        "Name",
        "Artifact",
        "Address",
        "Transaction",
        "Confirmations",
        "Verification",
    ]);

    for (name, record) in &ledger.records {
        table.add_row(vec![
            name.clone(),
            record.artifact.clone(),
            record.address.to_string(),
            record.transaction_hash.to_string(),
            record.confirmations.to_string(),
            record.verified.to_string(),
        ]);
    }
    table
}

/// One row per proxy, with its current implementation.
pub fn proxies_table(ledger: &DeploymentLedger) -> Table {
    let mut table = Table::new();
    table.set_header(vec![
        "Name",
        "Proxy",
        "Implementation",
        "Initialized",
        "Upgrades",
    ]);

    for (name, proxy) in &ledger.proxies {
        table.add_row(vec![
            name.clone(),
            proxy.proxy_address.to_string(),
            proxy.implementation_address.to_string(),
            proxy.initialized.to_string(),
            proxy.upgrade_history.len().to_string(),
        ]);
    }
    table
}

/// One row per step of a run.
pub fn run_table(report: &RunReport) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["Step", "Outcome"]);
    for step in &report.steps {
        table.add_row(vec![step.step.clone(), step.outcome.to_string()]);
    }
    table
}

/// Everything in the ledger, ready to print.
pub fn render_ledger(ledger: &DeploymentLedger) -> String {
    if ledger.is_empty() {
        return "Nothing deployed yet".to_string();
    }

    let mut out = records_table(ledger).to_string();
    if !ledger.proxies.is_empty() {
        out.push_str("\n\n");
        out.push_str(&proxies_table(ledger).to_string());
    }
    if !ledger.wiring.is_empty() {
        out.push_str(&format!("\n\n{} wiring step(s) completed", ledger.wiring.len()));
    }
    out
}
