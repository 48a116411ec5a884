//! Upstream JSON-RPC clients.

use alloy_primitives::{Address, Bytes, ChainId};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_client::RpcClient;
use alloy_rpc_types_eth::{BlockId, TransactionInput, TransactionRequest};
use alloy_transport::{TransportError as UpstreamError, TransportErrorKind};
use alloy_transport_http::Http;
use async_trait::async_trait;
use devwallet_rpc::{error::RpcError, request::RequestParams, response::RpcResponse};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::{borrow::Cow, collections::HashMap, fmt, sync::Arc, time::Duration};
use url::Url;

/// Request timeout for the built-in public endpoints.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Request timeout for user supplied endpoints, which are often local and slow to warm up.
pub const CUSTOM_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid rpc url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("failed to build http client for {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} failed: {source}")]
    Upstream {
        url: String,
        #[source]
        source: UpstreamError,
    },
    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },
    #[error("unexpected `{method}` result: {source}")]
    InvalidResult {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
    /// The endpoint answered with a JSON-RPC error object.
    #[error(transparent)]
    Rpc(RpcError),
}

impl TransportError {
    /// Returns the upstream error object, if the endpoint produced one.
    pub fn as_rpc(&self) -> Option<&RpcError> {
        match self {
            Self::Rpc(err) => Some(err),
            _ => None,
        }
    }

    /// Keeps error objects the node answered with; everything else stays a transport failure.
    fn upstream(url: &Url, err: UpstreamError) -> Self {
        match err {
            UpstreamError::ErrorResp(payload) => {
                let data = payload.try_data_as::<Value>().and_then(Result::ok);
                Self::Rpc(RpcError {
                    code: payload.code.into(),
                    message: payload.message.to_string().into(),
                    data,
                })
            }
            // some nodes attach the error object to a non-2xx status
            UpstreamError::Transport(TransportErrorKind::HttpError(http)) => {
                match serde_json::from_str::<RpcResponse>(&http.body) {
                    Ok(res) => match res.into_result().into_result() {
                        Err(err) => Self::Rpc(err),
                        Ok(_) => Self::Malformed {
                            url: url.to_string(),
                            reason: format!("status {} with a result body", http.status),
                        },
                    },
                    Err(_) => Self::Upstream {
                        url: url.to_string(),
                        source: TransportErrorKind::http_error(http.status, http.body),
                    },
                }
            }
            source => Self::Upstream { url: url.to_string(), source },
        }
    }
}

/// Something that can execute a JSON-RPC call against a single endpoint.
#[async_trait]
pub trait RpcTransport: Send + Sync + fmt::Debug {
    /// Sends `method` with `params` and returns the `result` member of the response.
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError>;

    /// Executes a view call against `to` at the latest block.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, TransportError> {
        let res = self.request("eth_call", json!([{ "to": to, "data": data }, "latest"])).await?;
        serde_json::from_value(res)
            .map_err(|source| TransportError::InvalidResult { method: "eth_call", source })
    }
}

/// Creates transports for endpoint urls.
pub trait Connector: Send + Sync + fmt::Debug {
    fn connect(&self, url: &str, timeout: Duration) -> Result<Arc<dyn RpcTransport>, TransportError>;
}

/// Connects over HTTP.
#[derive(Clone, Debug, Default)]
pub struct HttpConnector;

impl Connector for HttpConnector {
    fn connect(&self, url: &str, timeout: Duration) -> Result<Arc<dyn RpcTransport>, TransportError> {
        Ok(Arc::new(HttpTransport::new(url, timeout)?))
    }
}

/// A provider for a single HTTP endpoint.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    provider: RootProvider,
    url: Url,
}

impl HttpTransport {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let parsed = Url::parse(url)
            .map_err(|source| TransportError::InvalidUrl { url: url.to_string(), source })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| TransportError::Http { url: url.to_string(), source })?;
        let http = Http::with_client(client, parsed.clone());
        let is_local = http.guess_local();
        let provider = RootProvider::new(RpcClient::new(http, is_local));
        Ok(Self { provider, url: parsed })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        trace!(target: "devwallet::rpc", url = %self.url, method, "sending upstream request");
        self.provider
            .raw_request::<_, Value>(Cow::Owned(method.to_string()), into_params(params))
            .await
            .map_err(|err| TransportError::upstream(&self.url, err))
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, TransportError> {
        trace!(target: "devwallet::rpc", url = %self.url, %to, "sending eth_call");
        let tx = TransactionRequest::default().to(to).input(TransactionInput::new(data));
        self.provider
            .call(tx)
            .block(BlockId::latest())
            .await
            .map_err(|err| TransportError::upstream(&self.url, err))
    }
}

fn into_params(params: Value) -> RequestParams {
    match params {
        Value::Null => RequestParams::Array(Vec::new()),
        Value::Array(values) => RequestParams::Array(values),
        Value::Object(map) => RequestParams::Object(map),
        other => RequestParams::Array(vec![other]),
    }
}

/// Reuses transports per `(call-target chain, url)`.
#[derive(Debug)]
pub struct ClientCache {
    connector: Arc<dyn Connector>,
    clients: Mutex<HashMap<(ChainId, String), Arc<dyn RpcTransport>>>,
}

impl ClientCache {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector, clients: Default::default() }
    }

    /// Returns the transport for `url`, creating it on first use.
    ///
    /// `custom` selects the longer timeout for user supplied endpoints.
    pub fn client(
        &self,
        chain_id: ChainId,
        url: &str,
        custom: bool,
    ) -> Result<Arc<dyn RpcTransport>, TransportError> {
        let key = (chain_id, url.to_string());
        if let Some(client) = self.clients.lock().get(&key) {
            return Ok(client.clone());
        }

        let timeout = if custom { CUSTOM_TIMEOUT } else { DEFAULT_TIMEOUT };
        debug!(target: "devwallet::rpc", chain_id, url, ?timeout, "creating upstream client");
        let client = self.connector.connect(url, timeout)?;
        Ok(self.clients.lock().entry(key).or_insert(client).clone())
    }

    /// Number of live transports.
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
