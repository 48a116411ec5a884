//! Scripted upstream endpoints for unit tests.

use crate::client::{Connector, RpcTransport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::{fmt, sync::Arc, time::Duration};

type Handler = dyn Fn(&str, &Value) -> Result<Value, TransportError> + Send + Sync;

/// Answers every call through a closure and records what was asked, regardless of url.
pub struct MockTransport {
    handler: Box<Handler>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport").field("calls", &self.calls.lock().len()).finish()
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let res = (self.handler)(method, &params);
        self.calls.lock().push((method.to_string(), params));
        res
    }
}

#[derive(Debug)]
pub struct MockConnector {
    transport: Arc<MockTransport>,
    urls: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&str, &Value) -> Result<Value, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            transport: Arc::new(MockTransport {
                handler: Box::new(handler),
                calls: Default::default(),
            }),
            urls: Default::default(),
        })
    }

    /// Methods called so far, in order.
    pub fn methods(&self) -> Vec<String> {
        self.transport.calls.lock().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.transport.calls.lock().clone()
    }

    /// Urls transports were created for.
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

impl Connector for MockConnector {
    fn connect(&self, url: &str, _timeout: Duration) -> Result<Arc<dyn RpcTransport>, TransportError> {
        self.urls.lock().push(url.to_string());
        Ok(self.transport.clone())
    }
}
