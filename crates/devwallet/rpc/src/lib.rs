//! JSON-RPC 2.0 wire types shared by the wallet bridge, the dispatcher and the upstream
//! client.

#![cfg_attr(docsrs, feature(doc_cfg))]

/// JSON-RPC request bindings
pub mod request;

/// JSON-RPC response bindings
pub mod response;

/// JSON-RPC error bindings
pub mod error;
