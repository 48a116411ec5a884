//! Process configuration.
//!
//! Layered with [`figment`], later layers winning: built-in defaults, the TOML file, `DEVWALLET_`
//! environment variables and finally command line flags. Nested keys use `__` in the
//! environment, e.g. `DEVWALLET_NETWORKS__HOODI__RPC_URL`.

use crate::networks::Networks;
use figment::{
    Figment, Provider,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

/// Configuration file looked up in the working directory when no path is given.
pub const CONFIG_FILE_NAME: &str = "devwallet.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "DEVWALLET_";

pub const DEFAULT_PORT: u16 = 8546;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Directory of the durable key/value store.
    pub storage_dir: PathBuf,
    /// Overrides `networks.fork_rpc_url` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_rpc_url: Option<String>,
    /// Command spawned with the approval surface url appended, e.g. `["xdg-open"]`.
    pub approval_launcher: Vec<String>,
    pub networks: Networks,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            storage_dir: default_storage_dir(),
            fork_rpc_url: None,
            approval_launcher: Vec::new(),
            networks: Networks::default(),
        }
    }
}

impl WalletConfig {
    /// Extracts the configuration from every layer.
    ///
    /// `file` is the explicit config path, if any; otherwise [`CONFIG_FILE_NAME`] is read when
    /// present. `overrides` is merged last.
    pub fn load<P: Provider>(file: Option<&Path>, overrides: P) -> Result<Self, figment::Error> {
        Self::figment(file).merge(overrides).extract()
    }

    /// All layers but the command line.
    pub fn figment(file: Option<&Path>) -> Figment {
        let file = file.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// The network table with the top-level fork override applied.
    pub fn networks(&self) -> Networks {
        let mut networks = self.networks.clone();
        if let Some(url) = &self.fork_rpc_url {
            networks.fork_rpc_url.clone_from(url);
        }
        networks
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }
}

/// `<data dir>/devwallet`, or `./devwallet` when the platform has no data dir.
pub fn default_storage_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("devwallet")
}
