//! Known service servers and their reachability.

use ahash::AHashMap;
use dashmap::DashMap;

use super::wire::ServerStatus;
use super::{Status, host_key};

/// Servers learned from directory peers or from the governing directory,
/// keyed by host.
#[derive(Default)]
pub struct ServerDirectory {
    servers: DashMap<String, ServerStatus>,
}

impl ServerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the previous record for the host.
    pub fn put(&self, host: String, status: ServerStatus) -> Option<ServerStatus> {
        self.servers.insert(host, status)
    }

    pub fn remove(&self, host: &str) -> Option<ServerStatus> {
        self.servers.remove(host).map(|(_, v)| v)
    }

    pub fn get(&self, host: &str) -> Option<ServerStatus> {
        self.servers.get(host).map(|v| v.clone())
    }

    pub fn contains(&self, host: &str) -> bool {
        self.servers.contains_key(host)
    }

    pub fn snapshot(&self) -> Vec<(String, ServerStatus)> {
        self.servers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// A service server attached to this directory through a down pipe.
#[derive(Debug, Clone)]
pub struct AttachedServer {
    pub host: String,
    pub domain: String,
    pub port: u16,
    pub last_heartbeat: u64,
}

/// Servers this directory can vouch for: attached servers (stale ones marked
/// disconnected), optionally the forwarded directory, and this node itself
/// unless it only does logins.
pub fn visible_servers(
    attached: impl IntoIterator<Item = AttachedServer>,
    forwarded: Option<&ServerDirectory>,
    own: Option<(&str, u16)>,
    filtered_host: &str,
    now: u64,
    heartbeat_timeout_ms: u64,
) -> AHashMap<String, ServerStatus> {
    let mut servers = AHashMap::new();
    for a in attached {
        if a.host == filtered_host {
            continue;
        }
        let status = if now.abs_diff(a.last_heartbeat) > heartbeat_timeout_ms {
            Status::Disconnected
        } else {
            Status::Connected
        };
        servers.insert(
            a.host,
            ServerStatus {
                domain: a.domain,
                port: a.port,
                status,
            },
        );
    }
    if let Some(forwarded) = forwarded {
        for (host, status) in forwarded.snapshot() {
            servers.entry(host).or_insert(status);
        }
    }
    if let Some((domain, port)) = own {
        servers
            .entry(host_key(domain, port))
            .or_insert_with(|| ServerStatus {
                domain: domain.to_string(),
                port,
                status: Status::Connected,
            });
    }
    servers
}
