//! # httplb
//!
//! Client-side HTTP load balancing with dynamic endpoint discovery.
//!
//! A caller describes a balanced service once and gets back a [`Balancer`]
//! that picks one endpoint pool per request. The crate owns three concerns:
//!
//! - **Discovery**: a background task learns the live endpoint set from a
//!   static list, DNS A or SRV records, or Consul, and reconciles it with
//!   the held connection pools without disrupting in-flight requests.
//! - **Endpoint health**: every request feeds a bounded, decaying penalty
//!   score per endpoint, shifting load away from failing endpoints without
//!   ejecting them.
//! - **Selection**: round-robin, random, smooth weighted round-robin and
//!   least-connection strategies behind one uniform surface.
//!
//! ## Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use http::Request;
//! use http_body_util::Full;
//! use httplb::{Balancer, Config};
//!
//! # async fn run() -> httplb::Result<()> {
//! let config = Config::from_toml(
//!     r#"
//!     lb_strategy = "least-connection"
//!     type = "static"
//!     ip_list = ["10.0.0.1:7780 weight=200", "10.0.0.2:7780"]
//!
//!     [opts]
//!     connect_timeout = "1s"
//!     read_timeout = "5s"
//! "#,
//! )?;
//! let balancer = Balancer::new(config).await?;
//!
//! let req = Request::builder()
//!     .uri("http://service/api/ping")
//!     .body(Full::new(Bytes::new()))?;
//! let resp = balancer.send(&req).await?;
//! assert!(resp.status().is_success());
//! # Ok(())
//! # }
//! ```
//!
//! Endpoints are identified by the canonical name `IP:Port_wWEIGHT`; a pool
//! survives reconciliation exactly as long as that name does, so a weight
//! change rebuilds the pool while a reordering keeps every live connection.

pub mod balancer;
pub mod client;
pub mod config;
pub mod error;
pub mod lb_client;
pub mod node;

mod consul;
mod dns;
mod reconcile;
mod strategy;
mod watcher;

pub use balancer::{Balancer, BalancerBuilder};
pub use client::HostClient;
pub use config::{Config, ConsulConfig, DnsConfig, DnsRecordType, LbStrategy, Opts, SourceType};
pub use error::{Error, Result};
pub use lb_client::{HealthCheck, LbClient};
pub use node::Node;
