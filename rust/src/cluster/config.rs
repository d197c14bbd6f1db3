use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::error::{ClusterError, Result};
use super::host_key;

/// A planned move of all users from one service server to another.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerMoving {
    pub old_ip: String,
    pub old_port: u16,
    pub new_ip: Option<String>,
    #[serde(default = "default_port")]
    pub new_port: u16,
}

impl ServerMoving {
    pub fn is_old(&self, domain: &str, port: u16) -> bool {
        self.old_ip == domain && self.old_port == port
    }

    pub fn is_new(&self, domain: &str, port: u16) -> bool {
        self.new_ip.as_deref() == Some(domain) && self.new_port == port
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub max_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { max_workers: 128 }
    }
}

/// Node configuration. Every field has a default so a partial JSON document
/// is enough; `validate` rejects configurations without a usable own address.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub port: u16,
    pub server_ip: String,
    /// Addresses this node answers to. Directory-peer setups may name any of them as target.
    pub all_server_ips: Vec<String>,

    pub primary_server: bool,
    pub primary_login_server: bool,
    pub primary_proxy_server: bool,
    pub primary_synchronizing: bool,
    pub master_server_ip: Option<String>,
    pub master_server_port: u16,

    pub global_server: String,
    pub global_backup_servers: Vec<String>,
    /// 0 picks a random backup, 1 loops through the list in order.
    pub backup_server_strategy: u8,
    pub backup_server_random_factor: usize,
    pub min_reconnect_retries: u32,
    pub max_reconnect_interval_ms: u64,

    pub gateway_server: String,
    pub all_gateway_servers: Vec<String>,
    pub event_transparent: bool,
    pub max_event_resendings: u32,

    pub api_secret: Option<String>,
    pub all_api_secrets: Vec<String>,
    pub gateway_secret: Option<String>,
    pub all_gateway_secrets: Vec<String>,

    pub worker_pool: WorkerPoolConfig,

    pub initial_capacity: usize,
    pub user_caching_time_ms: u64,
    pub unreachable_user_removing: bool,
    pub max_unreachable_time_ms: u64,
    pub user_query_callback_size: usize,
    pub max_users: u32,
    pub max_initialize_time_ms: u64,

    pub pipe_heartbeat_timeout_ms: u64,
    pub reconnect_minimum_retries: u32,
    pub reconnect_max_time_ms: u64,
    pub reconnect_incremental_interval_ms: u64,
    pub reconnect_incremental_rate: f64,
    pub reconnect_fixed_interval_ms: u64,
    pub reconnect_fixed_per_retry_interval_ms: u64,
    pub reconnect_max_interval_ms: u64,
    pub server_heartbeat_interval_ms: u64,
    pub pipe_monitor_interval_ms: u64,

    pub server_moving: Option<ServerMoving>,

    pub logging: bool,
}

fn default_port() -> u16 {
    80
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            port: 80,
            server_ip: "127.0.0.1".to_string(),
            all_server_ips: Vec::new(),
            primary_server: true,
            primary_login_server: false,
            primary_proxy_server: false,
            primary_synchronizing: true,
            master_server_ip: None,
            master_server_port: 80,
            global_server: "http://127.0.0.1".to_string(),
            global_backup_servers: Vec::new(),
            backup_server_strategy: 1,
            backup_server_random_factor: 5,
            min_reconnect_retries: 3,
            max_reconnect_interval_ms: 3000,
            gateway_server: "http://127.0.0.1".to_string(),
            all_gateway_servers: Vec::new(),
            event_transparent: false,
            max_event_resendings: 3,
            api_secret: None,
            all_api_secrets: Vec::new(),
            gateway_secret: None,
            all_gateway_secrets: Vec::new(),
            worker_pool: WorkerPoolConfig::default(),
            initial_capacity: 10_000,
            user_caching_time_ms: 180_000,
            unreachable_user_removing: true,
            max_unreachable_time_ms: 12 * 3600 * 1000,
            user_query_callback_size: 3,
            max_users: 100_000_000,
            max_initialize_time_ms: 60_000,
            pipe_heartbeat_timeout_ms: 60_000,
            reconnect_minimum_retries: 20,
            reconnect_max_time_ms: 120_000,
            reconnect_incremental_interval_ms: 20,
            reconnect_incremental_rate: 0.2,
            reconnect_fixed_interval_ms: 2000,
            reconnect_fixed_per_retry_interval_ms: 50,
            reconnect_max_interval_ms: 10_000,
            server_heartbeat_interval_ms: 10_000,
            pipe_monitor_interval_ms: 1000,
            server_moving: None,
            logging: true,
        }
    }
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ClusterError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// A node that cannot name itself cannot register with peers.
    pub fn validate(&self) -> Result<()> {
        if self.server_ip.trim().is_empty() {
            return Err(ClusterError::Config("server_ip must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ClusterError::Config("port must not be 0".into()));
        }
        if self.backup_server_strategy > 1 {
            return Err(ClusterError::Config(format!(
                "unknown backup_server_strategy {}",
                self.backup_server_strategy
            )));
        }
        if self.max_users == 0 {
            return Err(ClusterError::Config("max_users must be positive".into()));
        }
        Ok(())
    }

    /// Registry key of this node.
    pub fn self_host(&self) -> String {
        host_key(&self.server_ip, self.port)
    }

    pub fn is_self(&self, domain: &str, port: u16) -> bool {
        self.server_ip == domain && self.port == port
    }

    /// A directory node that relays to services through RPC instead of
    /// acting as a service itself.
    pub fn is_login_only(&self) -> bool {
        self.primary_server && self.primary_login_server
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.pipe_heartbeat_timeout_ms)
    }

    pub fn user_caching_time(&self) -> Duration {
        Duration::from_millis(self.user_caching_time_ms)
    }

    /// Number of bitmap bytes needed to cover one shard of `max_users`.
    pub fn slot_bitmap_bytes(&self) -> usize {
        (self.max_users as usize >> 10) + 1
    }
}
