//! keel deploys a declarative contract plan to an EVM chain, resuming from its ledger.

mod cli;

use std::path::Path;

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use cli::{Cli, Command, resolve_deployer};
use keel_deploy::{
    ContractRegistry, DeploymentLedger, DeploymentOrchestrator, DeploymentPlan, EtherscanClient,
    JsonRpcBackend, LedgerLock, OrchestratorConfig, UpgradeOutcome, VerificationService, report,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let ledger_path = cli.ledger_path();

    if let Command::Status = cli.command {
        let ledger = DeploymentLedger::open(&ledger_path)?;
        println!("{}", report::render_ledger(&ledger));
        return Ok(());
    }

    let signer = cli.signer()?;
    let config = load_config(&cli)?;
    let deployer = resolve_deployer(
        config.deployer,
        signer.as_ref().map(|signer| signer.address()),
    )?;
    let config = config.with_deployer(deployer);
    if config.deployer == Address::ZERO && !matches!(cli.command, Command::Verify) {
        anyhow::bail!(
            "No deployer configured, pass --private-key or --deployer (KEEL_PRIVATE_KEY, KEEL_DEPLOYER)"
        );
    }
    let rpc_url = cli.network.rpc_url()?;

    tracing::info!(
        network = %cli.network,
        rpc_url = %rpc_url,
        ledger = %ledger_path.display(),
        deployer = %config.deployer,
        confirmations = config.confirmations,
        local_signing = signer.is_some(),
        "Configuration loaded"
    );

    let _lock = LedgerLock::acquire(&ledger_path)?;
    let mut ledger = DeploymentLedger::open(&ledger_path)?;

    let registry = ContractRegistry::load_from_dir(&cli.artifacts)?;
    let backend = match signer {
        Some(signer) => JsonRpcBackend::new(rpc_url)?.with_signer(signer),
        None => JsonRpcBackend::new(rpc_url)?,
    };
    let orchestrator = DeploymentOrchestrator::new(backend, registry, config);

    match (cli.explorer_api_url(), cli.explorer_api_key.clone()) {
        (Some(api_url), Some(api_key)) => {
            let explorer = EtherscanClient::new(api_url, api_key)?;
            execute(&cli, &orchestrator.with_verifier(explorer), &mut ledger).await
        }
        _ => {
            if let Command::Verify = cli.command {
                anyhow::bail!("Verification needs an explorer API URL and an API key");
            }
            tracing::warn!("No explorer API key configured, contracts will not be verified");
            execute(&cli, &orchestrator, &mut ledger).await
        }
    }
}

/// Layer the orchestrator configuration: defaults, then the config file, then
/// `KEEL_ORCHESTRATOR__*` variables, then command-line flags.
fn load_config(cli: &Cli) -> Result<OrchestratorConfig> {
    if !cli.config.exists() {
        tracing::debug!(
            path = %cli.config.display(),
            "No configuration file, using defaults"
        );
    }

    Figment::from(Serialized::defaults(OrchestratorConfig::default()))
        .merge(Toml::file(&cli.config))
        .merge(Env::prefixed("KEEL_ORCHESTRATOR__").split("__"))
        .merge(cli.overrides())
        .extract()
        .context(format!(
            "Failed to load configuration from {}",
            cli.config.display()
        ))
}

fn load_plan(path: &Path) -> Result<DeploymentPlan> {
    DeploymentPlan::load_from_file(path)
}

async fn execute<S: VerificationService>(
    cli: &Cli,
    orchestrator: &DeploymentOrchestrator<JsonRpcBackend, S>,
    ledger: &mut DeploymentLedger,
) -> Result<()> {
    match &cli.command {
        Command::Deploy { plan, .. } => {
            let plan = load_plan(plan)?;
            let result = orchestrator.run_in_place(&plan, ledger).await;

            // The ledger was checkpointed step by step; show what is recorded either way.
            println!("{}", report::render_ledger(ledger));
            let run = result?;
            println!("{}", report::run_table(&run));

            if let Some(summary) = run.verification {
                tracing::info!(
                    verified = summary.verified,
                    pending = summary.pending,
                    failed = summary.failed,
                    unverified = summary.unverified,
                    "Verification summary"
                );
            }
        }
        Command::Upgrade {
            plan,
            proxy,
            implementation,
        } => {
            let plan = load_plan(plan)?;
            match orchestrator
                .upgrade(&plan, ledger, *proxy, implementation.as_deref())
                .await?
            {
                UpgradeOutcome::Upgraded {
                    from,
                    to,
                    generation,
                } => {
                    tracing::info!(proxy = %proxy, from = %from, to = %to, generation, "Upgrade complete");
                }
                UpgradeOutcome::AlreadyCurrent => {
                    tracing::info!(proxy = %proxy, "Proxy already runs this implementation");
                }
            }
            println!("{}", report::render_ledger(ledger));
        }
        Command::Verify => {
            if let Some(summary) = orchestrator.verify_all(ledger).await? {
                tracing::info!(
                    verified = summary.verified,
                    pending = summary.pending,
                    failed = summary.failed,
                    unverified = summary.unverified,
                    "Verification summary"
                );
            }
            println!("{}", report::render_ledger(ledger));
        }
        Command::Status => println!("{}", report::render_ledger(ledger)),
    }

    Ok(())
}
