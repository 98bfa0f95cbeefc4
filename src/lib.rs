//! Electrum protocol client with quorum-verified multi-server support.
//!
//! Electrum servers speak a JSON-RPC dialect over TLS with newline-delimited
//! frames. This crate provides two ways to talk to them:
//!
//! - [`Client`]: one server. Connects, negotiates the protocol version,
//!   multiplexes any number of concurrent requests over the single
//!   connection, and demultiplexes server-pushed notifications to
//!   subscribed callbacks. Idle connections are kept alive with periodic
//!   `server.ping`s.
//! - [`Cluster`]: many servers. Fans each logical request out to
//!   `distribution` members and accepts the first value that `confidence`
//!   of them agree on, byte-for-byte in canonical JSON. Notifications pass
//!   through the same quorum. The cluster is READY while enough members
//!   hold live connections and refuses requests otherwise.
//!
//! # Protocol notes
//!
//! Requests carry `{method, params, id}` and no `"jsonrpc"` field; several
//! server implementations disconnect clients that advertise one. A server
//! answering a request with an error is a *successful* round-trip: it
//! arrives as [`Response::Error`] so applications can tell a peer that said
//! "no" from a connection that died.
//!
//! # Usage
//!
//! ```rust,ignore
//! use amberline::{Cluster, ClusterConfig, Order};
//!
//! let cluster = Cluster::new(ClusterConfig {
//!     application: "my-wallet/1.0".into(),
//!     version: "1.4.2".into(),
//!     confidence: 2,
//!     distribution: 3,
//!     order: Order::Random,
//!     ..ClusterConfig::default()
//! })?;
//!
//! cluster.add_server("electrum.example.org", 50002).await?;
//! cluster.add_server("electrum.example.net", 50002).await?;
//! cluster.add_server("electrum.example.com", 50002).await?;
//! assert!(cluster.ready().await);
//!
//! let tip = cluster
//!     .request("blockchain.headers.subscribe", vec![])
//!     .await?;
//! ```
//!
//! # Diagnostics
//!
//! All logging goes through `tracing` under the targets in [`diag`]:
//! `action`, `events`, `errors`, `server`, and `status`.

mod client;
mod cluster;
mod connection;
pub mod diag;
mod error;
pub mod protocol;

pub use client::{Client, ClientConfig, ConnectionState, NotificationHandler, Response};
pub use cluster::{Cluster, ClusterConfig, ClusterStatus, Order};
pub use error::{Error, Result};
pub use protocol::RpcError;
