//! Background coordinator of a QA dev wallet.
//!
//! Owns the wallet state, caches registry operators, talks to a local fork node and routes the
//! JSON-RPC traffic of embedding pages, impersonating the selected address on the fork instead
//! of signing.

#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
extern crate tracing;

use crate::{
    client::{Connector, HttpConnector},
    config::WalletConfig,
    coordinator::{Backends, Coordinator},
    fanout::Fanout,
    server::WsSurfaceHost,
    storage::{FileStore, KvStore, MemoryStore},
};
use std::{io, net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, task::JoinHandle};

pub mod approval;
pub mod cache;
pub mod client;
pub mod cmd;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod fanout;
pub mod favorites;
pub mod fork;
pub mod keys;
pub mod messages;
pub mod networks;
pub mod registry;
/// axum routes of pages, views and approval surfaces
pub mod server;
pub mod state;
pub mod storage;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use cmd::run;

/// Opens the durable store in `config.storage_dir` and starts serving.
pub async fn try_spawn(config: WalletConfig) -> io::Result<(Coordinator, ServerHandle)> {
    let durable = Arc::new(FileStore::open(&config.storage_dir).await?);
    try_spawn_with(config, durable, Arc::new(HttpConnector)).await
}

/// Starts serving with the given durable store and upstream connector.
///
/// Session storage always starts empty. Binding to port 0 picks a free port, see
/// [`ServerHandle::socket_address`].
pub async fn try_spawn_with(
    config: WalletConfig,
    durable: Arc<dyn KvStore>,
    connector: Arc<dyn Connector>,
) -> io::Result<(Coordinator, ServerHandle)> {
    let listener = TcpListener::bind(config.socket_addr()).await?;
    let addr = listener.local_addr()?;

    let views = Arc::new(Fanout::new());
    let surfaces =
        Arc::new(WsSurfaceHost::new(format!("http://{addr}"), views.clone(), config.approval_launcher.clone()));
    let backends = Backends {
        durable,
        session: Arc::new(MemoryStore::new()),
        connector,
        surfaces: surfaces.clone(),
    };
    let coordinator = Coordinator::new(config.networks(), backends, views);

    let router = server::router(coordinator.clone(), surfaces);
    let task = tokio::spawn(server::serve(listener, router));
    Ok((coordinator, ServerHandle { addr, task }))
}

/// A running server.
#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    task: JoinHandle<io::Result<()>>,
}

impl ServerHandle {
    pub fn socket_address(&self) -> SocketAddr {
        self.addr
    }

    /// The JSON-RPC endpoint of embedding pages.
    pub fn http_endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// The websocket endpoint of UI views.
    pub fn view_endpoint(&self) -> String {
        format!("ws://{}/view", self.addr)
    }

    /// Stops serving.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// The serving task, completing only if the server fails.
    pub fn into_task(self) -> JoinHandle<io::Result<()>> {
        self.task
    }
}
