//! Pipe registries and the link lifecycle.
//!
//! Every dialed link lives in one registry per role and runs in its own task:
//! open, dispatch inbound messages until the socket drops, then either
//! schedule a redial or remove the link. Accepted outlets are swapped in under
//! a per-role mutex so a reconnecting peer inherits whatever the previous
//! outlet never delivered.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use super::auth;
use super::directory::{AttachedServer, visible_servers};
use super::error::{ClusterError, Result};
use super::pipe::{Outlet, Pipe, PipeState, Role};
use super::roles;
use super::state::{ClusterMetrics, ClusterState};
use super::transport::PipeLink;
use super::wire::{Message, PipeSetup, Request, Response, ServerStatus, SetupReply, RETURN_OK};
use super::{Status, epoch_ms, host_key};

// ---------------------------------------------------------------------------
// Registries
// ---------------------------------------------------------------------------

pub struct Topology {
    directory_links: DashMap<String, Arc<Pipe>>,
    directory_outlets: DashMap<String, Arc<Outlet>>,
    down_link: Mutex<Option<Arc<Pipe>>>,
    down_outlets: DashMap<String, Arc<Outlet>>,
    up_links: DashMap<String, Arc<Pipe>>,
    up_outlet: Mutex<Option<Arc<Outlet>>>,
    service_links: DashMap<String, Arc<Pipe>>,
    service_outlets: DashMap<String, Arc<Outlet>>,
    swap: [Mutex<()>; 4],
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    pub fn new() -> Self {
        Self {
            directory_links: DashMap::new(),
            directory_outlets: DashMap::new(),
            down_link: Mutex::new(None),
            down_outlets: DashMap::new(),
            up_links: DashMap::new(),
            up_outlet: Mutex::new(None),
            service_links: DashMap::new(),
            service_outlets: DashMap::new(),
            swap: [Mutex::new(()), Mutex::new(()), Mutex::new(()), Mutex::new(())],
        }
    }

    fn link_map(&self, role: Role) -> Option<&DashMap<String, Arc<Pipe>>> {
        match role {
            Role::DirectoryPeer => Some(&self.directory_links),
            Role::Up => Some(&self.up_links),
            Role::ServicePeer => Some(&self.service_links),
            Role::Down => None,
        }
    }

    fn outlet_map(&self, role: Role) -> Option<&DashMap<String, Arc<Outlet>>> {
        match role {
            Role::DirectoryPeer => Some(&self.directory_outlets),
            Role::Down => Some(&self.down_outlets),
            Role::ServicePeer => Some(&self.service_outlets),
            Role::Up => None,
        }
    }

    pub fn service_outlet(&self, host: &str) -> Option<Arc<Outlet>> {
        self.service_outlets.get(host).map(|o| o.clone())
    }

    pub fn down_outlet(&self, host: &str) -> Option<Arc<Outlet>> {
        self.down_outlets.get(host).map(|o| o.clone())
    }

    pub fn directory_outlet(&self, host: &str) -> Option<Arc<Outlet>> {
        self.directory_outlets.get(host).map(|o| o.clone())
    }

    pub fn up_outlet(&self) -> Option<Arc<Outlet>> {
        self.up_outlet.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn down_link(&self) -> Option<Arc<Pipe>> {
        self.down_link.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn link(&self, role: Role, host: &str) -> Option<Arc<Pipe>> {
        match self.link_map(role) {
            Some(map) => map.get(host).map(|p| p.clone()),
            None => self.down_link().filter(|p| p.host == host),
        }
    }

    pub fn has_up_link(&self, host: &str) -> bool {
        self.up_links.contains_key(host)
    }

    /// A service server attached to this directory.
    pub fn is_inner(&self, host: &str) -> bool {
        self.down_outlets.contains_key(host)
    }

    pub fn outlets_of(&self, role: Role) -> Vec<Arc<Outlet>> {
        match self.outlet_map(role) {
            Some(map) => map.iter().map(|e| e.value().clone()).collect(),
            None => self.up_outlet().into_iter().collect(),
        }
    }

    /// Every dialed link, the down link included.
    pub fn links(&self) -> Vec<Arc<Pipe>> {
        let mut links: Vec<Arc<Pipe>> = self.down_link().into_iter().collect();
        for map in [&self.directory_links, &self.up_links, &self.service_links] {
            links.extend(map.iter().map(|e| e.value().clone()));
        }
        links
    }

    pub fn outlets(&self) -> Vec<Arc<Outlet>> {
        Role::ALL.iter().flat_map(|r| self.outlets_of(*r)).collect()
    }

    /// Push `msg` to every outlet of `role` not excluded by `skip`.
    pub(crate) fn broadcast(&self, role: Role, msg: &Message, skip: impl Fn(&Outlet) -> bool) -> usize {
        let mut sent = 0;
        for outlet in self.outlets_of(role) {
            if skip(&outlet) {
                continue;
            }
            outlet.push(msg.clone());
            sent += 1;
        }
        sent
    }

    /// Whether `pipe` is the registered link for its role and host.
    pub(crate) fn is_current(&self, pipe: &Arc<Pipe>) -> bool {
        self.link(pipe.role, &pipe.host)
            .is_some_and(|p| Arc::ptr_eq(&p, pipe))
    }

    /// Drop `pipe` from its registry if it is still the registered one.
    pub(crate) fn unregister(&self, pipe: &Arc<Pipe>) -> bool {
        match self.link_map(pipe.role) {
            Some(map) => map
                .remove_if(&pipe.host, |_, p| Arc::ptr_eq(p, pipe))
                .is_some(),
            None => {
                let mut slot = self.down_link.lock().unwrap_or_else(|e| e.into_inner());
                if slot.as_ref().is_some_and(|p| Arc::ptr_eq(p, pipe)) {
                    *slot = None;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Register a fresh link unless a live one exists. Returns the link to dial.
    fn register_link(&self, role: Role, host: &str, make: impl FnOnce() -> Pipe) -> Option<Arc<Pipe>> {
        let Some(map) = self.link_map(role) else {
            let mut slot = self.down_link.lock().unwrap_or_else(|e| e.into_inner());
            if slot.as_ref().is_some_and(|p| !p.is_removed()) {
                return None;
            }
            let pipe = Arc::new(make());
            *slot = Some(pipe.clone());
            return Some(pipe);
        };
        match map.entry(host.to_string()) {
            Entry::Occupied(mut e) => {
                if !e.get().is_removed() {
                    return None;
                }
                let pipe = Arc::new(make());
                e.insert(pipe.clone());
                Some(pipe)
            }
            Entry::Vacant(e) => {
                let pipe = Arc::new(make());
                e.insert(pipe.clone());
                Some(pipe)
            }
        }
    }

    /// Swap in an accepted outlet. The new one adopts the old one's
    /// undelivered messages and the old one is closed.
    pub(crate) fn install_outlet(&self, outlet: Arc<Outlet>) -> Option<Arc<Outlet>> {
        let _guard = self.swap[outlet.role as usize - 1]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let old = match self.outlet_map(outlet.role) {
            Some(map) => map.insert(outlet.host.clone(), outlet.clone()),
            None => self
                .up_outlet
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .replace(outlet.clone()),
        };
        if let Some(old) = &old
            && !Arc::ptr_eq(old, &outlet)
        {
            outlet.adopt_pending(old);
            old.close();
        }
        old
    }

    /// Remove the outlet for `host` if `pred` holds for it, and close it.
    pub(crate) fn remove_outlet_if(&self, role: Role, host: &str, pred: impl Fn(&Outlet) -> bool) -> bool {
        let Some(map) = self.outlet_map(role) else {
            return false;
        };
        match map.remove_if(host, |_, o| pred(o)) {
            Some((_, outlet)) => {
                outlet.close();
                true
            }
            None => false,
        }
    }

    /// Close the outlet a remote identified by its pipe key.
    pub(crate) fn close_outlet_by_key(&self, key: &str) -> bool {
        for map in [&self.directory_outlets, &self.down_outlets, &self.service_outlets] {
            let host = map
                .iter()
                .find(|e| e.value().key == key)
                .map(|e| e.key().clone());
            if let Some(host) = host {
                return self.remove_outlet_if_key(map, &host, key);
            }
        }
        match self.up_outlet() {
            Some(outlet) if outlet.key == key => {
                self.replace_up_outlet(&outlet);
                true
            }
            _ => false,
        }
    }

    fn remove_outlet_if_key(&self, map: &DashMap<String, Arc<Outlet>>, host: &str, key: &str) -> bool {
        match map.remove_if(host, |_, o| o.key == key) {
            Some((_, outlet)) => {
                outlet.close();
                true
            }
            None => false,
        }
    }

    /// Close the up outlet and leave a detached placeholder that keeps
    /// queueing until the next directory attaches.
    pub(crate) fn replace_up_outlet(&self, current: &Arc<Outlet>) {
        let placeholder = Arc::new(Outlet::new(Role::Up, &current.domain, current.port));
        let _guard = self.swap[Role::Up as usize - 1]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut slot = self.up_outlet.lock().unwrap_or_else(|e| e.into_inner());
        if !slot.as_ref().is_some_and(|o| Arc::ptr_eq(o, current)) {
            return;
        }
        placeholder.adopt_pending(current);
        *slot = Some(placeholder);
        drop(slot);
        current.close();
    }
}

// ---------------------------------------------------------------------------
// Link lifecycle
// ---------------------------------------------------------------------------

/// Where a link dials. The down link follows the upstream failover state.
pub(crate) fn endpoint_for(state: &ClusterState, pipe: &Pipe) -> String {
    match pipe.role {
        Role::Down => {
            let global = state
                .global_server()
                .unwrap_or_else(|| state.config.global_server.clone());
            state
                .upstream
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .current(&global)
        }
        _ => format!("http://{}", pipe.host),
    }
}

fn setup_for(state: &ClusterState, pipe: &Pipe) -> PipeSetup {
    let config = &state.config;
    let (domain, target) = match pipe.role {
        Role::DirectoryPeer => (pipe.target.clone(), Some(pipe.domain.clone())),
        _ => (Some(config.server_ip.clone()), None),
    };
    PipeSetup {
        role: pipe.role,
        api_secret: config.api_secret.clone(),
        domain,
        port: config.port,
        target,
    }
}

pub(crate) fn dial(state: &Arc<ClusterState>, pipe: Arc<Pipe>) {
    let state = state.clone();
    tokio::spawn(async move {
        run_link(state, pipe).await;
    });
}

async fn run_link(state: Arc<ClusterState>, pipe: Arc<Pipe>) {
    if pipe.is_removed() || state.cancel.is_cancelled() {
        return;
    }
    pipe.set_state(PipeState::Setup);
    let endpoint = endpoint_for(&state, &pipe);
    let setup = setup_for(&state, &pipe);
    debug!(role = %pipe.role, %endpoint, "opening pipe");

    let opened = tokio::select! {
        r = state.transport.open_pipe(&endpoint, setup) => r,
        () = state.cancel.cancelled() => return,
    };
    let link = match opened {
        Ok(link) => link,
        Err(e) => {
            debug!(role = %pipe.role, %endpoint, error = %e, "pipe connect failed");
            if pipe.role == Role::Down {
                record_upstream_failure(&state);
            }
            pipe.detach();
            teardown(&state, &pipe);
            return;
        }
    };

    let PipeLink {
        reply,
        mut inbound,
        cancel,
    } = link;
    if pipe.is_removed() || !state.topology.is_current(&pipe) {
        cancel.cancel();
        return;
    }
    pipe.connected(reply.pipe_key.clone(), cancel.clone());
    info!(role = %pipe.role, host = %pipe.host, "pipe connected");
    roles::on_created(&state, &pipe, reply);

    loop {
        tokio::select! {
            msg = inbound.recv() => match msg {
                Some(msg) => roles::dispatch(&state, &pipe, msg),
                None => break,
            },
            () = cancel.cancelled() => break,
            () = state.cancel.cancelled() => {
                cancel.cancel();
                return;
            }
        }
    }
    cancel.cancel();
    pipe.detach();
    info!(role = %pipe.role, host = %pipe.host, "pipe disconnected");
    teardown(&state, &pipe);
}

fn record_upstream_failure(state: &ClusterState) {
    let global = state
        .global_server()
        .unwrap_or_else(|| state.config.global_server.clone());
    let mut rng = rand::thread_rng();
    state
        .upstream
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .record_failure(&state.config, &global, epoch_ms(), &mut rng);
}

/// A link lost its socket: redial it, or remove it if it is stopping.
fn teardown(state: &Arc<ClusterState>, pipe: &Arc<Pipe>) {
    if pipe.is_removed() {
        return;
    }
    if pipe.is_stopping() || state.cancel.is_cancelled() {
        remove(state, pipe);
        return;
    }
    if !state.topology.is_current(pipe) {
        return;
    }
    delay_reconnect(state, pipe);
}

fn delay_reconnect(state: &Arc<ClusterState>, pipe: &Arc<Pipe>) {
    let now = epoch_ms();
    if pipe.should_give_up(&state.backoff, now) {
        info!(
            role = %pipe.role,
            host = %pipe.host,
            retries = pipe.retries(),
            "giving up on pipe"
        );
        remove(state, pipe);
        return;
    }
    let delay = pipe.schedule_retry(&state.backoff, now);
    ClusterMetrics::incr(&state.metrics.reconnects_scheduled);
    debug!(
        role = %pipe.role,
        host = %pipe.host,
        delay_ms = delay.as_millis() as u64,
        "reconnect scheduled"
    );
    state.monitor.schedule(pipe.clone());
}

pub(crate) fn remove(state: &Arc<ClusterState>, pipe: &Arc<Pipe>) {
    pipe.set_state(PipeState::Removed);
    pipe.close_link();
    if state.topology.unregister(pipe) {
        ClusterMetrics::incr(&state.metrics.pipes_removed);
        roles::on_removed(state, pipe);
    }
}

// ---------------------------------------------------------------------------
// Creating links
// ---------------------------------------------------------------------------

/// Directory to directory link. `own_domain` is the address of ours the peer
/// should answer for.
pub(crate) fn create_directory_link(
    state: &Arc<ClusterState>,
    own_domain: &str,
    domain: &str,
    port: u16,
    synchronizing: bool,
    master_mode: bool,
) {
    if state.config.is_self(domain, port) {
        return;
    }
    let host = host_key(domain, port);
    let created = state.topology.register_link(Role::DirectoryPeer, &host, || {
        Pipe::directory_peer(domain, port, own_domain, synchronizing, master_mode)
    });
    if let Some(pipe) = created {
        debug!(%host, synchronizing, master_mode, "directory link created");
        dial(state, pipe);
    }
}

/// The service node's link to its governing directory.
pub(crate) fn create_down_link(state: &Arc<ClusterState>) {
    if state.config.primary_server {
        return;
    }
    let domain = state
        .global_server()
        .unwrap_or_else(|| state.config.global_server.clone());
    let created = state
        .topology
        .register_link(Role::Down, "", || Pipe::new(Role::Down, &domain, 80));
    if let Some(pipe) = created {
        dial(state, pipe);
    }
}

/// The directory's link back to an attached service server.
pub(crate) fn create_up_link(state: &Arc<ClusterState>, domain: &str, port: u16) {
    let host = host_key(domain, port);
    if let Some(pipe) = state
        .topology
        .register_link(Role::Up, &host, || Pipe::new(Role::Up, domain, port))
    {
        dial(state, pipe);
    }
}

pub(crate) fn create_service_link(state: &Arc<ClusterState>, domain: &str, port: u16) {
    if state.config.is_self(domain, port) {
        return;
    }
    let host = host_key(domain, port);
    if state.node_id().as_deref() == Some(host.as_str()) {
        return;
    }
    if let Some(pipe) = state
        .topology
        .register_link(Role::ServicePeer, &host, || Pipe::new(Role::ServicePeer, domain, port))
    {
        dial(state, pipe);
    }
}

/// The service node's up outlet before any directory attached.
pub(crate) fn install_placeholder_up_outlet(state: &ClusterState) {
    let mut slot = state
        .topology
        .up_outlet
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    if slot.is_none() {
        let global = host_key(&state.config.global_server, 80);
        *slot = Some(Arc::new(Outlet::new(Role::Up, &global, 80)));
    }
}

// ---------------------------------------------------------------------------
// Accepting pipes
// ---------------------------------------------------------------------------

/// Validate a pipe setup and register its outlet. `None` drops the socket.
pub(crate) fn accept_pipe(
    state: &Arc<ClusterState>,
    setup: PipeSetup,
    peer_ip: &str,
) -> Option<(Arc<Outlet>, SetupReply)> {
    if !auth::check_api_secret(&state.config, setup.api_secret.as_deref()) {
        ClusterMetrics::incr(&state.metrics.auth_failures);
        warn!(role = %setup.role, peer = peer_ip, "pipe setup rejected: bad api secret");
        return None;
    }
    let domain = setup
        .domain
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| peer_ip.to_string());
    let port = if setup.port == 0 { 80 } else { setup.port };
    let primary = state.config.primary_server;
    let accepted = match setup.role {
        Role::DirectoryPeer if primary => {
            accept_directory_peer(state, &domain, port, setup.target.as_deref())
        }
        Role::Down if primary => accept_down(state, &domain, port),
        Role::Up if !primary => accept_up(state, &domain, port),
        Role::ServicePeer => accept_service_peer(state, &domain, port),
        role => {
            warn!(%role, peer = peer_ip, "pipe role not served by this node");
            return None;
        }
    };
    debug!(role = %setup.role, host = %accepted.0.host, "pipe accepted");
    Some(accepted)
}

fn accept_directory_peer(
    state: &Arc<ClusterState>,
    domain: &str,
    port: u16,
    target: Option<&str>,
) -> (Arc<Outlet>, SetupReply) {
    let config = &state.config;
    let own = match target {
        Some(t)
            if t == config.server_ip
                || config.all_server_ips.is_empty()
                || config.all_server_ips.iter().any(|ip| ip == t) =>
        {
            t.to_string()
        }
        _ => config.server_ip.clone(),
    };
    let outlet = Arc::new(Outlet::new(Role::DirectoryPeer, domain, port));
    let old = state.topology.install_outlet(outlet.clone());
    let synchronizing = old.is_none()
        && state.is_primary_master_mode()
        && config.primary_synchronizing
        && state.is_just_initialized();
    create_directory_link(state, &own, domain, port, synchronizing, true);
    let online_servers = all_service_servers(state, &outlet.host, true)
        .into_values()
        .collect();
    let reply = SetupReply {
        pipe_key: outlet.key.clone(),
        online_servers,
        online_users: Vec::new(),
        time: epoch_ms(),
    };
    (outlet, reply)
}

/// A service server attached: tell it about every other server and tell the
/// others about it.
fn accept_down(state: &Arc<ClusterState>, domain: &str, port: u16) -> (Arc<Outlet>, SetupReply) {
    let config = &state.config;
    let outlet = Arc::new(Outlet::new(Role::Down, domain, port));
    outlet.touch();
    let host = outlet.host.clone();
    let current = ServerStatus {
        domain: domain.to_string(),
        port,
        status: Status::Connected,
    };

    let mut known = Vec::new();
    if !config.primary_login_server {
        known.push(ServerStatus {
            domain: config.server_ip.clone(),
            port: config.port,
            status: Status::Connected,
        });
        create_service_link(state, domain, port);
    }
    let now = epoch_ms();
    for other in state.topology.outlets_of(Role::Down) {
        if other.host == host {
            continue;
        }
        let stale = now.abs_diff(other.last_heartbeat()) > config.pipe_heartbeat_timeout_ms;
        known.push(ServerStatus {
            domain: other.domain.clone(),
            port: other.port,
            status: if stale {
                Status::Disconnected
            } else {
                Status::Connected
            },
        });
        if !stale {
            other.push(Message::ServerStatus(current.clone()));
        }
    }

    state.topology.install_outlet(outlet.clone());
    if !state.is_primary_proxy_mode() {
        known.extend(
            state
                .servers
                .snapshot()
                .into_iter()
                .filter(|(h, _)| *h != host)
                .map(|(_, s)| s),
        );
    }
    for status in known {
        outlet.push(Message::ServerStatus(status));
    }
    if config.primary_synchronizing && !state.is_primary_proxy_mode() {
        state.topology.broadcast(
            Role::DirectoryPeer,
            &Message::ServerStatus(current),
            |_| false,
        );
    }
    create_up_link(state, domain, port);
    let reply = SetupReply {
        pipe_key: outlet.key.clone(),
        time: now,
        ..SetupReply::default()
    };
    (outlet, reply)
}

fn accept_up(state: &Arc<ClusterState>, domain: &str, port: u16) -> (Arc<Outlet>, SetupReply) {
    let outlet = Arc::new(Outlet::new(Role::Up, domain, port));
    state.topology.install_outlet(outlet.clone());
    let online_users = state
        .node()
        .map(|n| n.online_user_ids())
        .unwrap_or_default();
    let reply = SetupReply {
        pipe_key: outlet.key.clone(),
        online_users,
        time: epoch_ms(),
        ..SetupReply::default()
    };
    (outlet, reply)
}

fn accept_service_peer(state: &Arc<ClusterState>, domain: &str, port: u16) -> (Arc<Outlet>, SetupReply) {
    let outlet = Arc::new(Outlet::new(Role::ServicePeer, domain, port));
    state.topology.install_outlet(outlet.clone());
    create_service_link(state, domain, port);
    let reply = SetupReply {
        pipe_key: outlet.key.clone(),
        time: epoch_ms(),
        ..SetupReply::default()
    };
    (outlet, reply)
}

/// Service servers this directory can vouch for, keyed by host.
pub(crate) fn all_service_servers(
    state: &ClusterState,
    filtered_host: &str,
    include_all: bool,
) -> ahash::AHashMap<String, ServerStatus> {
    let attached: Vec<AttachedServer> = state
        .topology
        .outlets_of(Role::Down)
        .into_iter()
        .map(|o| AttachedServer {
            host: o.host.clone(),
            domain: o.domain.clone(),
            port: o.port,
            last_heartbeat: o.last_heartbeat(),
        })
        .collect();
    let config = &state.config;
    let own = (!config.primary_login_server).then_some((config.server_ip.as_str(), config.port));
    visible_servers(
        attached,
        include_all.then_some(&state.servers),
        own,
        filtered_host,
        epoch_ms(),
        config.pipe_heartbeat_timeout_ms,
    )
}

// ---------------------------------------------------------------------------
// Closing and re-pointing links
// ---------------------------------------------------------------------------

/// Ask the remote end to close the outlet behind `key`.
pub(crate) async fn send_close_pipe(state: &ClusterState, endpoint: &str, key: String) -> Result<()> {
    let request = Request::ClosePipe {
        api_secret: state.config.api_secret.clone(),
        pipe_key: key,
    };
    match state.transport.call(endpoint, request).await? {
        Response::Ack | Response::ReturnCode(RETURN_OK) => Ok(()),
        Response::ReturnCode(code) => Err(ClusterError::Rejected(code)),
        _ => Err(ClusterError::UnexpectedResponse {
            endpoint: endpoint.to_string(),
        }),
    }
}

/// Close a link through the remote end, forcing it locally if that fails.
pub(crate) fn close_remotely(state: &Arc<ClusterState>, pipe: Arc<Pipe>, endpoint: String) {
    let Some(key) = pipe.key() else {
        pipe.close_link();
        return;
    };
    let state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = send_close_pipe(&state, &endpoint, key).await {
            debug!(host = %pipe.host, error = %e, "close pipe call failed, closing locally");
            pipe.close_link();
        }
    });
}

fn destroy_directory_link(state: &Arc<ClusterState>, domain: &str, port: u16) {
    let host = host_key(domain, port);
    if let Some((_, outlet)) = state.topology.directory_outlets.remove(&host) {
        outlet.push(Message::ServerStopping);
        outlet.close();
    }
    let Some(pipe) = state.topology.link(Role::DirectoryPeer, &host) else {
        return;
    };
    pipe.set_stopping(true);
    if pipe.is_attached() {
        let endpoint = endpoint_for(state, &pipe);
        close_remotely(state, pipe, endpoint);
    } else {
        remove(state, &pipe);
    }
}

/// Point this directory at a new master. `None` clears it.
pub(crate) fn update_master_server(state: &Arc<ClusterState>, ip: Option<&str>, port: u16) {
    let next = ip.filter(|ip| !ip.is_empty()).map(|ip| (ip.to_string(), port));
    let previous = state.master();
    if previous.is_none() && next.is_none() {
        return;
    }
    if previous != next {
        info!(from = ?previous, to = ?next, "master directory changed");
        if let Some((old_ip, old_port)) = &previous {
            destroy_directory_link(state, old_ip, *old_port);
        }
    }
    if let Some((ip, port)) = &next
        && !state.config.is_self(ip, *port)
    {
        let own = state.config.server_ip.clone();
        create_directory_link(state, &own, ip, *port, state.config.primary_synchronizing, false);
    }
    state.set_master(next);
}

/// Point this service node at a new global directory. Re-announcing the
/// prefix already in use, or one whose backup is in use, changes nothing.
pub(crate) fn update_global_server(state: &Arc<ClusterState>, prefix: Option<&str>, backups: &[String]) {
    if !state.is_started() {
        return;
    }
    let current = state.global_server();
    let previous = state
        .upstream
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .announce(prefix);
    let on_known = current
        .as_deref()
        .is_some_and(|c| Some(c) == prefix || backups.iter().any(|b| b == c));
    if on_known && previous.as_deref() == prefix {
        return;
    }
    if current.as_deref() == prefix {
        return;
    }
    info!(from = ?current, to = ?prefix, "global directory changed");
    state.set_global_server(prefix.map(String::from));

    if let Some(outlet) = state.topology.up_outlet()
        && outlet.is_live()
    {
        outlet.push(Message::ServerStopping);
        state.topology.replace_up_outlet(&outlet);
    }
    match state.topology.down_link() {
        Some(pipe) if pipe.is_attached() => {
            let endpoint = endpoint_for(state, &pipe);
            state.upstream.lock().unwrap_or_else(|e| e.into_inner()).reset();
            close_remotely(state, pipe, endpoint);
        }
        _ => state.upstream.lock().unwrap_or_else(|e| e.into_inner()).reset(),
    }
}

/// Tell every peer this node is going away and close every pipe.
pub(crate) fn stop_all(state: &Arc<ClusterState>) {
    for outlet in state.topology.outlets() {
        if outlet.is_live() {
            outlet.push(Message::ServerStopping);
        }
        outlet.close();
    }
    for pipe in state.topology.links() {
        pipe.set_stopping(true);
        pipe.close_link();
    }
    state.monitor.clear();
}
