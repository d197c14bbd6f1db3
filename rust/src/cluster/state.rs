use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::backoff::BackoffPolicy;
use super::config::ClusterConfig;
use super::directory::ServerDirectory;
use super::monitor::Monitor;
use super::node::SessionRegistry;
use super::router::{self, RouteResult};
use super::store::PresenceStore;
use super::topology::{self, Topology};
use super::transport::Transport;
use super::upstream::UpstreamTarget;
use super::wire::Event;
use super::workers::WorkerPool;
use super::{Uid, epoch_ms};

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

pub struct ClusterMetrics {
    pub events_delivered: AtomicU64,
    pub events_buffered: AtomicU64,
    pub events_dropped: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub reconnects_scheduled: AtomicU64,
    pub pipes_removed: AtomicU64,
    pub unknown_message_kinds: AtomicU64,
    pub auth_failures: AtomicU64,
    pub slots_synchronized: AtomicU64,
}

impl ClusterMetrics {
    pub fn new() -> Self {
        Self {
            events_delivered: AtomicU64::new(0),
            events_buffered: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            reconnects_scheduled: AtomicU64::new(0),
            pipes_removed: AtomicU64::new(0),
            unknown_message_kinds: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            slots_synchronized: AtomicU64::new(0),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for ClusterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Cluster state
// ---------------------------------------------------------------------------

/// Everything one cluster process owns. Built once, shared as `Arc`, torn
/// down with [`ClusterState::shutdown`].
pub struct ClusterState {
    pub(crate) config: ClusterConfig,
    pub(crate) backoff: BackoffPolicy,
    pub(crate) store: PresenceStore,
    pub(crate) servers: ServerDirectory,
    pub(crate) topology: Topology,
    pub(crate) monitor: Monitor,
    pub(crate) workers: WorkerPool,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) metrics: Arc<ClusterMetrics>,
    pub(crate) upstream: Mutex<UpstreamTarget>,
    node: Option<Arc<dyn SessionRegistry>>,
    master: Mutex<Option<(String, u16)>>,
    global_server: Mutex<Option<String>>,
    initialized_at: AtomicU64,
    started: AtomicBool,
    pub(crate) cancel: CancellationToken,
    synced: watch::Sender<u64>,
}

impl ClusterState {
    pub fn new(
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        metrics: Arc<ClusterMetrics>,
        node: Option<Arc<dyn SessionRegistry>>,
    ) -> Arc<Self> {
        let (synced, _) = watch::channel(0);
        Arc::new(Self {
            backoff: BackoffPolicy::from_config(&config),
            store: PresenceStore::new(config.initial_capacity, config.user_query_callback_size),
            servers: ServerDirectory::new(),
            topology: Topology::new(),
            monitor: Monitor::new(),
            workers: WorkerPool::new(config.worker_pool.max_workers),
            transport,
            metrics,
            upstream: Mutex::new(UpstreamTarget::new()),
            node,
            master: Mutex::new(None),
            global_server: Mutex::new(None),
            initialized_at: AtomicU64::new(epoch_ms()),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            synced,
            config,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ClusterMetrics {
        &self.metrics
    }

    pub fn node(&self) -> Option<&Arc<dyn SessionRegistry>> {
        self.node.as_ref()
    }

    pub(crate) fn node_id(&self) -> Option<String> {
        self.node.as_ref().map(|n| n.node_id())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Start background tasks and open the pipes this role needs. Runs once.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.initialized_at.store(epoch_ms(), Ordering::Relaxed);
        self.monitor.start(self);
        info!(
            host = %self.config.self_host(),
            primary = self.config.primary_server,
            proxy = self.is_primary_proxy_mode(),
            "cluster node starting"
        );
        if self.config.primary_server {
            let master_ip = self.config.master_server_ip.clone();
            topology::update_master_server(self, master_ip.as_deref(), self.config.master_server_port);
            return;
        }
        topology::install_placeholder_up_outlet(self);
        let global = self.config.global_server.clone();
        let backups = self.config.global_backup_servers.clone();
        topology::update_global_server(self, Some(&global), &backups);
        topology::create_down_link(self);
    }

    /// Stop every pipe and background task.
    pub fn shutdown(self: &Arc<Self>) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        topology::stop_all(self);
        self.cancel.cancel();
        info!(host = %self.config.self_host(), "cluster node stopped");
    }

    /// Within the startup window during which a fresh directory pulls state
    /// from its master.
    pub fn is_just_initialized(&self) -> bool {
        epoch_ms().abs_diff(self.initialized_at.load(Ordering::Relaxed))
            < self.config.max_initialize_time_ms
    }

    pub fn master(&self) -> Option<(String, u16)> {
        self.master.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_master(&self, master: Option<(String, u16)>) {
        *self.master.lock().unwrap_or_else(|e| e.into_inner()) = master;
    }

    pub fn is_primary_master_mode(&self) -> bool {
        let c = &self.config;
        c.primary_server
            && !c.primary_proxy_server
            && self
                .master()
                .is_some_and(|(ip, port)| c.is_self(&ip, port))
    }

    pub fn is_primary_proxy_mode(&self) -> bool {
        let c = &self.config;
        c.primary_server && !c.primary_login_server && c.primary_proxy_server
    }

    pub fn global_server(&self) -> Option<String> {
        self.global_server
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_global_server(&self, prefix: Option<String>) {
        *self.global_server.lock().unwrap_or_else(|e| e.into_inner()) = prefix;
    }

    /// Completed bulk synchronizations. Changes once per finished run.
    pub fn subscribe_synced(&self) -> watch::Receiver<u64> {
        self.synced.subscribe()
    }

    pub(crate) fn mark_synced(&self) {
        self.synced.send_modify(|n| *n += 1);
    }

    // -----------------------------------------------------------------------
    // Cluster API
    // -----------------------------------------------------------------------

    /// Route an event toward the node holding its receiver.
    pub fn route_event(self: &Arc<Self>, event: Event) -> RouteResult {
        router::route_event(self, event)
    }

    /// A user logged in or out on this node.
    pub fn update_user(self: &Arc<Self>, uid: Uid, online: bool) {
        let domain = self.config.server_ip.clone();
        router::update_user(self, uid, online, &domain, self.config.port);
    }

    pub fn is_user_online(&self, uid: Uid) -> bool {
        router::is_user_online(self, uid)
    }

    /// 1 here, -1 elsewhere, 0 offline or unknown. Never leaves the node.
    pub fn user_cluster_status(&self, uid: Uid) -> i32 {
        router::user_cluster_status(self, uid)
    }

    /// Like [`Self::user_cluster_status`], but a service node asks its
    /// directory when the cache is cold and returns -1 meanwhile.
    pub fn query_user_cluster_status(self: &Arc<Self>, uid: Uid) -> i32 {
        router::query_user_cluster_status(self, uid)
    }

    pub fn update_master_server(self: &Arc<Self>, ip: Option<&str>, port: u16) {
        topology::update_master_server(self, ip, port);
    }

    pub fn update_global_server(self: &Arc<Self>, prefix: Option<&str>, backups: &[String]) {
        topology::update_global_server(self, prefix, backups);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::{TestNode, test_state};

    #[test]
    fn test_mode_flags() {
        let mut config = ClusterConfig::default();
        config.primary_proxy_server = true;
        let state = test_state(config, None);
        assert!(state.is_primary_proxy_mode());
        assert!(!state.is_primary_master_mode());

        let state = test_state(ClusterConfig::default(), None);
        assert!(!state.is_primary_master_mode());
        state.set_master(Some(("127.0.0.1".into(), 80)));
        assert!(state.is_primary_master_mode());
    }

    #[test]
    fn test_just_initialized_window() {
        let mut config = ClusterConfig::default();
        config.max_initialize_time_ms = 60_000;
        let state = test_state(config, None);
        assert!(state.is_just_initialized());
        state
            .initialized_at
            .store(epoch_ms() - 120_000, Ordering::Relaxed);
        assert!(!state.is_just_initialized());
    }

    #[tokio::test]
    async fn test_synced_signal() {
        let state = test_state(ClusterConfig::default(), Some(TestNode::new("n1")));
        let mut rx = state.subscribe_synced();
        state.mark_synced();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
