use crate::config::WalletConfig;
use clap::{CommandFactory, Parser, Subcommand};
use eyre::Result;
use figment::{
    Metadata, Profile, Provider,
    value::{Dict, Map, Value},
};
use serde::Serialize;
use std::{net::IpAddr, path::PathBuf};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// QA wallet coordinator: impersonate on-chain operator addresses against a local fork.
#[derive(Clone, Debug, Parser, Serialize)]
#[command(name = "devwallet", version, next_display_order = None)]
pub struct DevWallet {
    #[command(subcommand)]
    #[serde(skip)]
    pub cmd: Option<DevWalletSubcommand>,

    /// Path to the config file [default: ./devwallet.toml]
    #[arg(long, value_name = "PATH")]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// The IP address to listen on [default: 127.0.0.1]
    #[arg(long, value_name = "IP_ADDR")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<IpAddr>,

    /// Port number to listen on [default: 8546]
    #[arg(long, short)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Directory of the persisted wallet state and caches
    #[arg(long, value_name = "PATH")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,

    /// Endpoint of the local fork node [default: http://127.0.0.1:8545]
    #[arg(long, value_name = "URL")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_rpc_url: Option<String>,
}

#[derive(Clone, Debug, Subcommand)]
pub enum DevWalletSubcommand {
    /// Generate shell completions script.
    #[command(visible_alias = "com")]
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

impl DevWallet {
    /// Resolves the configuration: file, environment, then these flags.
    pub fn load_config(&self) -> Result<WalletConfig> {
        Ok(WalletConfig::load(self.config.as_deref(), self)?)
    }

    /// Starts the coordinator and serves until interrupted.
    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        let storage_dir = config.storage_dir.clone();
        let (_coordinator, handle) = crate::try_spawn(config).await?;
        info!(
            target: "devwallet::server",
            endpoint = %handle.http_endpoint(),
            storage_dir = %storage_dir.display(),
            "devwallet started"
        );

        tokio::select! {
            res = handle.into_task() => res??,
            res = tokio::signal::ctrl_c() => {
                res?;
                info!(target: "devwallet::server", "received shutdown signal, shutting down");
            }
        }
        Ok(())
    }
}

// Make the args a `figment::Provider` so that they can be merged into the `WalletConfig`
impl Provider for DevWallet {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command line arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        let value = Value::serialize(self)?;
        let dict = value
            .into_dict()
            .ok_or_else(|| figment::Error::from("command line arguments must form a map".to_string()))?;
        Ok(Map::from([(Profile::Default, dict)]))
    }
}

/// Run the `devwallet` command line interface.
pub fn run() -> Result<()> {
    let args = DevWallet::parse();

    if let Some(cmd) = &args.cmd {
        match cmd {
            DevWalletSubcommand::Completions { shell } => {
                clap_complete::generate(
                    *shell,
                    &mut DevWallet::command(),
                    "devwallet",
                    &mut std::io::stdout(),
                );
            }
        }
        return Ok(());
    }

    init_tracing();
    tokio::runtime::Builder::new_multi_thread().enable_all().build()?.block_on(args.run())
}

/// Installs the global subscriber, filtered by `RUST_LOG` (default `devwallet=info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("devwallet=info"));
    let _ = tracing_subscriber::registry().with(filter).with(fmt::layer()).try_init();
}
