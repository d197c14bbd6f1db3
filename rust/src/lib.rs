//! Presence routing and cluster replication for a multi-tier message relay.

pub mod cluster;

pub use cluster::config::ClusterConfig;
pub use cluster::error::{ClusterError, Result};
pub use cluster::gateway::GatewayClient;
pub use cluster::node::SessionRegistry;
pub use cluster::router::RouteResult;
pub use cluster::state::{ClusterMetrics, ClusterState};
pub use cluster::transport::{TcpTransport, Transport, serve};
pub use cluster::wire::Event;
pub use cluster::{Status, Uid};
