use std::path::PathBuf;

use alloy_core::primitives::Address;
use clap::{Parser, Subcommand};
use keel_deploy::PrivateKeySigner;
use figment::{
    Metadata, Profile,
    value::{Dict, Map},
};
use tracing::level_filters::LevelFilter;
use url::Url;

/// The chain a deployment targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum Network {
    Arbitrum,
    Optimism,
    ArbitrumGoerli,
    OptimismGoerli,
    /// Any other chain, given by its RPC URL.
    #[strum(default)]
    Custom(String),
}

impl Network {
    pub fn rpc_url(&self) -> anyhow::Result<Url> {
        let url = match self {
            Network::Arbitrum => "https://arb1.arbitrum.io/rpc",
            Network::Optimism => "https://mainnet.optimism.io",
            Network::ArbitrumGoerli => "https://goerli-rollup.arbitrum.io/rpc",
            Network::OptimismGoerli => "https://goerli.optimism.io",
            Network::Custom(url) => url,
        };
        Url::parse(url).map_err(|e| anyhow::anyhow!("Invalid RPC URL {url}: {e}"))
    }

    /// The Etherscan-compatible explorer API of known networks.
    pub fn explorer_api_url(&self) -> Option<Url> {
        let url = match self {
            Network::Arbitrum => "https://api.arbiscan.io/api",
            Network::Optimism => "https://api-optimistic.etherscan.io/api",
            Network::ArbitrumGoerli => "https://api-goerli.arbiscan.io/api",
            Network::OptimismGoerli => "https://api-goerli-optimistic.etherscan.io/api",
            Network::Custom(_) => return None,
        };
        Url::parse(url).ok()
    }

    /// Default ledger file for this network.
    pub fn default_ledger(&self) -> PathBuf {
        let name = match self {
            Network::Custom(_) => "custom".to_string(),
            known => known.to_string(),
        };
        PathBuf::from("deployments").join(format!("{name}.json"))
    }
}

#[derive(Parser)]
#[command(name = "keel")]
#[command(
    author,
    version,
    about = "Deploy, wire, upgrade and verify smart contracts from a declarative plan"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "KEEL_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// The target network: a known network name or an RPC URL.
    #[arg(short, long, env = "KEEL_NETWORK", default_value_t = Network::ArbitrumGoerli)]
    pub network: Network,

    /// Path to the orchestrator configuration file.
    #[arg(long, alias = "conf", env = "KEEL_CONFIG", default_value = "keel.toml")]
    pub config: PathBuf,

    /// Path to the deployment ledger.
    ///
    /// Defaults to `deployments/<network>.json`.
    #[arg(long, env = "KEEL_LEDGER")]
    pub ledger: Option<PathBuf>,

    /// Directory holding the compiled contract artifacts.
    #[arg(long, env = "KEEL_ARTIFACTS", default_value = "artifacts")]
    pub artifacts: PathBuf,

    /// The account every transaction is sent from.
    ///
    /// Defaults to the address of `--private-key`. Without a key, the node at the RPC URL
    /// must be able to sign for it.
    #[arg(long, env = "KEEL_DEPLOYER")]
    pub deployer: Option<Address>,

    /// Hex private key to sign transactions with locally.
    #[arg(long, env = "KEEL_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,

    /// Number of confirmations to wait for after each transaction.
    #[arg(long, env = "KEEL_CONFIRMATIONS")]
    pub confirmations: Option<u64>,

    /// Explorer API URL, required to verify on custom networks.
    #[arg(long, env = "KEEL_EXPLORER_URL")]
    pub explorer_url: Option<Url>,

    /// Explorer API key. Verification is skipped without one.
    #[arg(long, env = "KEEL_EXPLORER_API_KEY", hide_env_values = true)]
    pub explorer_api_key: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deploy and wire every contract of a plan, resuming from the ledger.
    Deploy {
        /// Path to the deployment plan.
        plan: PathBuf,

        /// Skip source verification after deploying.
        #[arg(long)]
        no_verify: bool,

        /// Redeploy contracts whose plan entry changed since they were deployed.
        #[arg(long)]
        redeploy_on_change: bool,
    },

    /// Point an existing proxy at a new implementation.
    Upgrade {
        /// Path to the deployment plan.
        plan: PathBuf,

        /// Address of the proxy to upgrade.
        proxy: Address,

        /// Artifact of the new implementation. Defaults to the plan's artifact.
        #[arg(long)]
        implementation: Option<String>,
    },

    /// Verify every recorded contract that is not verified yet.
    Verify,

    /// Print the ledger.
    Status,
}

impl Cli {
    pub fn ledger_path(&self) -> PathBuf {
        self.ledger
            .clone()
            .unwrap_or_else(|| self.network.default_ledger())
    }

    pub fn explorer_api_url(&self) -> Option<Url> {
        self.explorer_url
            .clone()
            .or_else(|| self.network.explorer_api_url())
    }

    /// The local signing key, if one was given.
    pub fn signer(&self) -> anyhow::Result<Option<PrivateKeySigner>> {
        self.private_key
            .as_deref()
            .map(|key| {
                key.trim()
                    .parse::<PrivateKeySigner>()
                    .map_err(|e| anyhow::anyhow!("Invalid private key: {e}"))
            })
            .transpose()
    }

    /// The orchestrator settings given on the command line.
    pub fn overrides(&self) -> Overrides {
        let (no_verify, redeploy_on_change) = match &self.command {
            Command::Deploy {
                no_verify,
                redeploy_on_change,
                ..
            } => (*no_verify, *redeploy_on_change),
            _ => (false, false),
        };
        Overrides {
            deployer: self.deployer,
            confirmations: self.confirmations,
            no_verify,
            redeploy_on_change,
        }
    }
}

/// The deployer a run sends from, given the configured one and the signing key's.
pub fn resolve_deployer(configured: Address, signer: Option<Address>) -> anyhow::Result<Address> {
    match signer {
        Some(signer) if configured == Address::ZERO => Ok(signer),
        Some(signer) if signer != configured => anyhow::bail!(
            "Deployer {configured} does not match the private key's address {signer}"
        ),
        _ => Ok(configured),
    }
}

/// Command-line flags, which override every other configuration source.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    deployer: Option<Address>,
    confirmations: Option<u64>,
    no_verify: bool,
    redeploy_on_change: bool,
}

impl figment::Provider for Overrides {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command line arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        let mut dict = Dict::default();
        if let Some(deployer) = self.deployer {
            dict.insert("deployer".to_string(), deployer.to_string().into());
        }
        if let Some(confirmations) = self.confirmations {
            dict.insert("confirmations".to_string(), confirmations.into());
        }
        if self.no_verify {
            dict.insert("verify".to_string(), false.into());
        }
        if self.redeploy_on_change {
            dict.insert("redeploy_on_change".to_string(), true.into());
        }
        Ok(Map::from([(Profile::Default, dict)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_network() {
        assert_eq!("arbitrum".parse::<Network>().unwrap(), Network::Arbitrum);
        assert_eq!(
            "optimism-goerli".parse::<Network>().unwrap(),
            Network::OptimismGoerli
        );
        assert_eq!(
            "http://localhost:8545".parse::<Network>().unwrap(),
            Network::Custom("http://localhost:8545".to_string())
        );
    }

    #[test]
    fn test_network_urls() {
        assert_eq!(
            Network::Arbitrum.rpc_url().unwrap().as_str(),
            "https://arb1.arbitrum.io/rpc"
        );
        assert!(Network::Optimism.explorer_api_url().is_some());
        assert!(
            Network::Custom("http://localhost:8545".to_string())
                .explorer_api_url()
                .is_none()
        );
        assert_eq!(
            Network::ArbitrumGoerli.default_ledger(),
            PathBuf::from("deployments/arbitrum-goerli.json")
        );
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "keel",
            "--network",
            "optimism",
            "--confirmations",
            "2",
            "deploy",
            "plan.toml",
            "--no-verify",
        ]);

        let data = figment::Provider::data(&cli.overrides()).unwrap();
        let dict = &data[&Profile::Default];
        assert_eq!(dict["confirmations"].to_u128(), Some(2));
        assert_eq!(dict["verify"].to_bool(), Some(false));
        assert!(!dict.contains_key("deployer"));
        assert_eq!(cli.ledger_path(), PathBuf::from("deployments/optimism.json"));
    }

    #[test]
    fn test_private_key_sets_deployer() {
        let cli = Cli::parse_from([
            "keel",
            "--private-key",
            "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
            "status",
        ]);
        let signer = cli.signer().unwrap().unwrap().address();
        let expected: Address = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap();
        assert_eq!(signer, expected);

        assert_eq!(resolve_deployer(Address::ZERO, Some(signer)).unwrap(), signer);
        assert_eq!(resolve_deployer(signer, Some(signer)).unwrap(), signer);
        assert!(resolve_deployer(Address::with_last_byte(1), Some(signer)).is_err());
        assert_eq!(
            resolve_deployer(Address::with_last_byte(1), None).unwrap(),
            Address::with_last_byte(1)
        );
    }

    #[test]
    fn test_invalid_private_key() {
        let cli = Cli::parse_from(["keel", "--private-key", "0x1234", "status"]);
        assert!(cli.signer().is_err());

        let cli = Cli::parse_from(["keel", "status"]);
        assert!(cli.signer().unwrap().is_none());
    }
}
