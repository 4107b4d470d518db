//! emptyendpoints-dns - count DNS queries for Kubernetes services with no ready endpoints.
//!
//! The proxy sits in front of the cluster DNS service. For queries that name a
//! cluster-local Service it decides whether that Service currently has zero
//! ready endpoints and, if so, increments
//! `coredns_emptyendpoints_queries_total{namespace, service}`. An autoscaler
//! such as KEDA can scrape that counter to scale a workload up from zero when
//! traffic arrives. Queries are always relayed upstream and answers are never
//! altered.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       emptyendpoints-dns                         │
//! │                                                                  │
//! │  UDP/TCP :53                                                     │
//! │      │                                                           │
//! │      ▼                                                           │
//! │  ┌─────────────────────┐  parse ─▶ filter ─▶ oracle ─▶ counter   │
//! │  │ EmptyEndpointsHandler│                      │                  │
//! │  └──────────┬──────────┘                      │ lookup mode      │
//! │             │ always                          ▼                  │
//! │             ▼                         ┌────────────────┐         │
//! │  ┌─────────────────────┐              │ Endpoints cache│◀─ watch │
//! │  │  UpstreamForwarder  │──▶ cluster   └────────────────┘         │
//! │  └─────────────────────┘    DNS                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Detection modes
//!
//! - `observe`: the upstream answer is inspected as it is written back; an
//!   NXDOMAIN for a service name counts as "no ready endpoints".
//! - `lookup`: the Endpoints object is read from a `kube` reflector cache
//!   before forwarding; only an object whose subsets carry no ready address
//!   counts. Missing objects, errors and timeouts never count.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use emptyendpoints_dns::{Config, DnsProxy};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: Config = load_config();
//!     let shutdown = CancellationToken::new();
//!     DnsProxy::new(config).run(shutdown).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod counter;
pub mod error;
pub mod forward;
pub mod handler;
pub mod metrics;
pub mod oracle;
pub mod server;
pub mod service;
pub mod telemetry;

// Re-export main types
pub use cache::{EndpointCache, EndpointSnapshot, KubeEndpointCache};
pub use config::{Config, DetectionConfig, DetectionMode, DnsConfig, TelemetryConfig};
pub use counter::EmptyEndpointCounter;
pub use error::{ForwardError, LookupError, ProxyError};
pub use forward::UpstreamForwarder;
pub use handler::EmptyEndpointsHandler;
pub use oracle::{Emptiness, EndpointCacheLookup, EndpointStateOracle};
pub use server::DnsProxy;
pub use service::{NamespaceAllowList, ServiceRef};
