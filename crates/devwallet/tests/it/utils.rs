//! Scripted upstream endpoints, approval host and coordinator harness.

use alloy_primitives::{Address, Bytes, U256, address};
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use devwallet::{
    approval::{ApprovalError, ApprovalRequest, SurfaceHandle, SurfaceHost},
    client::{Connector, RpcTransport, TransportError},
    coordinator::{Backends, Coordinator},
    fanout::{ChannelId, Fanout},
    messages::{PageNotification, ViewEvent},
    networks::Networks,
    registry::{IStakingModuleDiscovery, NodeOperatorInfo},
    storage::MemoryStore,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

pub const DISCOVERY: Address = address!("0x00000000000000000000000000000000000d15c0");
pub const CM_MODULE: Address = address!("0x00000000000000000000000000000000000000c1");

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A request seen by the mock upstream.
#[derive(Clone, Debug)]
pub struct Call {
    pub url: String,
    pub method: String,
    pub params: Value,
}

type Handler = dyn Fn(&Call) -> Result<Value, TransportError> + Send + Sync;

struct Inner {
    handler: Box<Handler>,
    calls: Mutex<Vec<Call>>,
}

/// Every endpoint answered by a single closure.
#[derive(Clone)]
pub struct Upstream {
    inner: Arc<Inner>,
}

impl Upstream {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Call) -> Result<Value, TransportError> + Send + Sync + 'static,
    {
        Self { inner: Arc::new(Inner { handler: Box::new(handler), calls: Default::default() }) }
    }

    /// Fails every request like an unreachable host.
    pub fn offline() -> Self {
        Self::new(|call| Err(unreachable(call)))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.calls.lock().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.method).collect()
    }
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upstream").field("calls", &self.inner.calls.lock().len()).finish()
    }
}

impl Connector for Upstream {
    fn connect(&self, url: &str, _timeout: Duration) -> Result<Arc<dyn RpcTransport>, TransportError> {
        Ok(Arc::new(Endpoint { url: url.to_string(), inner: self.inner.clone() }))
    }
}

struct Endpoint {
    url: String,
    inner: Arc<Inner>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint").field("url", &self.url).finish()
    }
}

#[async_trait]
impl RpcTransport for Endpoint {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let call = Call { url: self.url.clone(), method: method.to_string(), params };
        self.inner.calls.lock().push(call.clone());
        (self.inner.handler)(&call)
    }
}

pub fn unreachable(call: &Call) -> TransportError {
    TransportError::Malformed { url: call.url.clone(), reason: "connection refused".into() }
}

/// Emulates the registry-discovery contract behind `eth_call`.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    pub operators: Vec<NodeOperatorInfo>,
    /// Address returned for every module id lookup.
    pub module: Address,
}

impl Registry {
    pub fn with_operators(count: u64) -> Self {
        Self { operators: (0..count).map(operator).collect(), module: CM_MODULE }
    }

    pub fn eth_call(&self, call: &Call) -> Result<Value, TransportError> {
        let data: Bytes = serde_json::from_value(call.params[0]["data"].clone())
            .map_err(|err| TransportError::Malformed { url: call.url.clone(), reason: err.to_string() })?;

        if let Ok(page) = IStakingModuleDiscovery::getNodeOperatorsCall::abi_decode(&data) {
            let offset = usize::try_from(page.offset).unwrap_or(usize::MAX);
            let limit = usize::try_from(page.limit).unwrap_or(usize::MAX);
            let rows: Vec<_> = self.operators.iter().skip(offset).take(limit).cloned().collect();
            let out = IStakingModuleDiscovery::getNodeOperatorsCall::abi_encode_returns(&rows);
            return Ok(json!(Bytes::from(out)));
        }
        if let Ok(lookup) = IStakingModuleDiscovery::getModuleAddressesCall::abi_decode(&data) {
            let addresses = vec![self.module; lookup.moduleIds.len()];
            let out = IStakingModuleDiscovery::getModuleAddressesCall::abi_encode_returns(&addresses);
            return Ok(json!(Bytes::from(out)));
        }
        Err(TransportError::Malformed { url: call.url.clone(), reason: "unknown selector".into() })
    }
}

pub fn operator(id: u64) -> NodeOperatorInfo {
    let manager = Address::left_padding_from(&(0x1000 + id).to_be_bytes());
    let rewards = Address::left_padding_from(&(0x2000 + id).to_be_bytes());
    NodeOperatorInfo {
        id: U256::from(id),
        managerAddress: manager,
        rewardAddress: rewards,
        proposedManagerAddress: Address::ZERO,
        proposedRewardAddress: Address::ZERO,
        extendedManagerPermissions: id % 2 == 0,
        curveId: U256::from(id % 3),
    }
}

/// Networks with discovery contracts on both production chains.
pub fn networks() -> Networks {
    let mut networks = Networks::default();
    networks.mainnet.discovery = Some(DISCOVERY);
    networks.hoodi.discovery = Some(DISCOVERY);
    networks
}

pub type Opened = (ApprovalRequest, oneshot::Sender<()>);

/// Hands every opened surface to the test.
#[derive(Debug)]
pub struct ScriptedHost {
    opened: mpsc::UnboundedSender<Opened>,
    pub closed: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl SurfaceHost for ScriptedHost {
    async fn open(&self, request: &ApprovalRequest) -> Result<SurfaceHandle, ApprovalError> {
        let (tx, closed) = oneshot::channel();
        self.opened
            .send((request.clone(), tx))
            .map_err(|_| ApprovalError::Surface("test finished".into()))?;
        Ok(SurfaceHandle { closed })
    }

    fn close(&self, id: Uuid) {
        self.closed.lock().push(id);
    }
}

pub struct Harness {
    pub coordinator: Coordinator,
    pub upstream: Upstream,
    pub durable: Arc<MemoryStore>,
    pub host: Arc<ScriptedHost>,
    pub opened: mpsc::UnboundedReceiver<Opened>,
}

impl Harness {
    pub fn new(upstream: Upstream) -> Self {
        init_tracing();
        let durable = Arc::new(MemoryStore::new());
        let (tx, opened) = mpsc::unbounded_channel();
        let host = Arc::new(ScriptedHost { opened: tx, closed: Default::default() });
        let backends = Backends {
            durable: durable.clone(),
            session: Arc::new(MemoryStore::new()),
            connector: Arc::new(upstream.clone()),
            surfaces: host.clone(),
        };
        let coordinator = Coordinator::new(networks(), backends, Arc::new(Fanout::new()));
        Self { coordinator, upstream, durable, host, opened }
    }

    pub fn view(&self) -> (ChannelId, mpsc::UnboundedReceiver<ViewEvent>) {
        self.coordinator.views().subscribe()
    }

    pub fn page(&self) -> mpsc::UnboundedReceiver<PageNotification> {
        self.coordinator.pages().subscribe().1
    }
}

/// Waits for the first event matching `f`, skipping the others.
pub async fn wait_for<E, F>(rx: &mut mpsc::UnboundedReceiver<E>, mut f: F) -> E
where
    E: fmt::Debug,
    F: FnMut(&E) -> bool,
{
    let res = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            if f(&event) {
                return event;
            }
        }
        panic!("channel closed");
    })
    .await;
    res.expect("timed out waiting for event")
}
