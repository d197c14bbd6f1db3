//! Event routing and user status bookkeeping.
//!
//! Directory nodes route from the authoritative store; service nodes route
//! from their cache and buffer events while the directory is asked.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, trace};

use super::pipe::Role;
use super::rpc;
use super::state::{ClusterMetrics, ClusterState};
use super::store::{Duplicate, LOCAL_SENTINEL, UpdatePolicy};
use super::wire::{Event, Message, RETURN_OK, Request, Response, UserResult};
use super::{Status, Uid, epoch_ms, host_key};

/// Outcome of routing one event.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteResult {
    Delivered = 1,
    Dropped = 0,
    /// Waiting for the directory to say where the receiver is.
    Buffered = -1,
}

impl RouteResult {
    pub fn code(self) -> i32 {
        self as i32
    }
}

pub(crate) fn route_event(state: &Arc<ClusterState>, event: Event) -> RouteResult {
    route(state, event, None)
}

/// Route an event. `source` is the host it arrived from, never routed back to.
fn route(state: &Arc<ClusterState>, event: Event, source: Option<&str>) -> RouteResult {
    if event.receiver <= 0 {
        return dropped(state);
    }
    if state.config.primary_server {
        route_from_directory(state, event, source)
    } else {
        route_from_service(state, event, source)
    }
}

fn dropped(state: &ClusterState) -> RouteResult {
    ClusterMetrics::incr(&state.metrics.events_dropped);
    RouteResult::Dropped
}

fn connected_record(state: &ClusterState, uid: Uid) -> Option<(String, u16, i64)> {
    state
        .store
        .get_user(uid)
        .filter(|r| r.status == Status::Connected)
        .and_then(|r| r.domain.map(|d| (d, r.port, r.last_updated)))
}

fn route_from_directory(state: &Arc<ClusterState>, event: Event, source: Option<&str>) -> RouteResult {
    let config = &state.config;
    let uid = event.receiver;
    let Some(mut owner) = connected_record(state, uid) else {
        return dropped(state);
    };
    if let Some(moving) = &config.server_moving
        && moving.is_old(&owner.0, owner.1)
    {
        match moving.new_ip.as_deref().filter(|ip| !ip.is_empty()) {
            Some(ip) => update_user(state, uid, true, ip, moving.new_port),
            None => update_user(state, uid, true, &config.server_ip, config.port),
        }
        let Some(moved) = connected_record(state, uid) else {
            return dropped(state);
        };
        owner = moved;
    }
    let (domain, port, last_updated) = owner;
    let host = host_key(&domain, port);
    if source == Some(host.as_str()) {
        trace!(uid, %host, "not routing an event back to its source");
        return dropped(state);
    }

    let sent = if config.primary_login_server {
        send_pipe_out_rpc(state, &host, vec![event])
    } else {
        let sent = pipe_out(state, &host, vec![event]).is_ok();
        let now = epoch_ms() as i64;
        if !sent
            && config.unreachable_user_removing
            && last_updated > 0
            && now - last_updated > config.max_unreachable_time_ms as i64
        {
            debug!(uid, %host, "owner unreachable for too long, marking user offline");
            update_user(state, uid, false, &domain, port);
        }
        sent
    };
    if sent {
        RouteResult::Delivered
    } else {
        dropped(state)
    }
}

fn route_from_service(state: &Arc<ClusterState>, event: Event, source: Option<&str>) -> RouteResult {
    let uid = event.receiver;
    let now = epoch_ms() as i64;
    if let Some(r) = state
        .store
        .cache_lookup(uid, state.config.user_caching_time_ms, now)
    {
        if r.status != Status::Connected {
            return dropped(state);
        }
        let Some(domain) = r.domain.as_deref() else {
            return dropped(state);
        };
        let host = host_key(domain, r.port);
        if source == Some(host.as_str()) {
            return dropped(state);
        }
        return match pipe_out(state, &host, vec![event]) {
            Ok(()) => RouteResult::Delivered,
            Err(_) => dropped(state),
        };
    }
    state.store.buffer_event(event);
    ClusterMetrics::incr(&state.metrics.events_buffered);
    if let Some(outlet) = state.topology.up_outlet() {
        outlet.push(Message::UserQuery { uid });
    }
    RouteResult::Buffered
}

/// Hand events to the service pipe for `host`, or to the local node when
/// `host` is this node. Gives the events back when there is no way there.
pub(crate) fn pipe_out(
    state: &ClusterState,
    host: &str,
    events: Vec<Event>,
) -> std::result::Result<(), Vec<Event>> {
    let count = events.len() as u64;
    if let Some(outlet) = state.topology.service_outlet(host) {
        for event in events {
            outlet.push(Message::Event(event));
        }
        state
            .metrics
            .events_delivered
            .fetch_add(count, Ordering::Relaxed);
        return Ok(());
    }
    if let Some(node) = state.node()
        && (host == state.config.self_host() || host == node.node_id())
    {
        for event in &events {
            node.deliver(event);
        }
        state
            .metrics
            .events_delivered
            .fetch_add(count, Ordering::Relaxed);
        return Ok(());
    }
    debug!(%host, events = count, "no pipe to host");
    Err(events)
}

/// Run the non-delivery callbacks of events nobody could take.
fn run_not_sent(state: &ClusterState, events: Vec<Event>) {
    state
        .metrics
        .events_dropped
        .fetch_add(events.len() as u64, Ordering::Relaxed);
    let callbacks: Vec<_> = events
        .into_iter()
        .filter_map(|e| e.on_undelivered)
        .collect();
    if callbacks.is_empty() {
        return;
    }
    state.workers.run(move || {
        for callback in callbacks {
            callback();
        }
    });
}

/// Login-only directories send events by call instead of by pipe. Falls back
/// to a pipe when the call is refused or fails twice.
fn send_pipe_out_rpc(state: &Arc<ClusterState>, host: &str, mut events: Vec<Event>) -> bool {
    if events.is_empty() {
        return false;
    }
    if state.config.primary_login_server {
        for event in &mut events {
            event.sender = 0;
        }
    }
    let request = Request::SendEvent {
        api_secret: state.config.api_secret.clone(),
        server_ip: Some(state.config.server_ip.clone()),
        server_port: state.config.port,
        events: events.clone(),
    };
    let state = state.clone();
    let host = host.to_string();
    tokio::spawn(async move {
        let endpoint = format!("http://{host}");
        match rpc::call_with_retries(&state, &endpoint, request, 1).await {
            Ok(Response::ReturnCode(RETURN_OK)) | Ok(Response::Ack) => {}
            Ok(other) => {
                debug!(%host, response = ?other, "send event refused, falling back to pipe");
                if let Err(events) = pipe_out(&state, &host, events) {
                    run_not_sent(&state, events);
                }
            }
            Err(e) => {
                if !state.topology.has_up_link(&host) {
                    debug!(%host, error = %e, "send event failed for a server that is gone");
                    return;
                }
                debug!(%host, error = %e, "send event failed, falling back to pipe");
                if let Err(events) = pipe_out(&state, &host, events) {
                    run_not_sent(&state, events);
                }
            }
        }
    });
    true
}

// ---------------------------------------------------------------------------
// User status
// ---------------------------------------------------------------------------

/// Apply a status change to the directory store and send the resulting
/// duplicate-login and callback notifications. Returns whether it changed.
pub(crate) fn apply_user_update(
    state: &Arc<ClusterState>,
    uid: Uid,
    status: Status,
    domain: &str,
    port: u16,
) -> bool {
    let config = &state.config;
    let proxy = state.is_primary_proxy_mode();
    let is_inner = |host: &str| state.topology.is_inner(host);
    let policy = UpdatePolicy {
        local_domain: &config.server_ip,
        local_port: config.port,
        proxy_mode: proxy,
        server_moving: config.server_moving.as_ref(),
        cache_ttl_ms: config.user_caching_time_ms,
        is_inner: &is_inner,
    };
    let now = epoch_ms();
    let outcome = state
        .store
        .update_user(uid, status, domain, port, &policy, now as i64);

    match outcome.duplicate {
        Some(Duplicate::Local) => {
            if proxy {
                if let Some(node) = state.node() {
                    node.on_duplicate_login(uid, now, domain, port);
                }
            } else {
                notify_duplicated_login(state, uid, now, domain, port);
            }
        }
        Some(Duplicate::Remote {
            domain: old_domain,
            port: old_port,
        }) => {
            let old_host = host_key(&old_domain, old_port);
            if let Some(outlet) = state.topology.down_outlet(&old_host) {
                outlet.push(Message::UserDuplicated {
                    uid,
                    domain: domain.to_string(),
                    port,
                    time: now,
                });
            } else if proxy && state.node_id().as_deref() == Some(old_host.as_str()) {
                notify_duplicated_login(state, uid, now, domain, port);
            }
        }
        None => {}
    }
    for (host, result) in outcome.fanout {
        if let Some(outlet) = state.topology.down_outlet(&host) {
            outlet.push(Message::UserResult(result));
        }
    }
    outcome.changed
}

/// A session on `domain:port` logged in or out.
pub(crate) fn update_user(state: &Arc<ClusterState>, uid: Uid, online: bool, domain: &str, port: u16) {
    let status = Status::from_online(online);
    let time = epoch_ms();
    let config = &state.config;
    if config.primary_server {
        if apply_user_update(state, uid, status, domain, port) && config.primary_synchronizing {
            let (domain, port) = if state.is_primary_proxy_mode() {
                (config.server_ip.as_str(), config.port)
            } else {
                (domain, port)
            };
            let result = UserResult {
                uid,
                domain: Some(domain.to_string()),
                port,
                last_updated: time as i64,
                status,
            };
            state
                .topology
                .broadcast(Role::DirectoryPeer, &Message::UserResult(result), |_| false);
        }
        return;
    }
    state.store.mark_local(uid, online, domain, port);
    if let Some(outlet) = state.topology.up_outlet() {
        outlet.push(Message::UserStatus { uid, status, time });
    }
}

/// A service asked where `uid` is. Registers the caller for change
/// notifications; a proxy answers with itself for users it fronts.
pub(crate) fn query_user_server(state: &ClusterState, uid: Uid, domain: &str, port: u16) -> UserResult {
    let caller = host_key(domain, port);
    let result = state.store.query_user(uid, &caller, epoch_ms() as i64);
    if state.is_primary_proxy_mode()
        && let Some(owner) = result.domain.as_deref()
        && result.port > 0
    {
        let owner_host = host_key(owner, result.port);
        let fronted = !state.topology.is_inner(&owner_host)
            || state.node_id().as_deref() == Some(owner_host.as_str());
        if fronted {
            return UserResult {
                uid,
                domain: Some(state.config.server_ip.clone()),
                port: state.config.port,
                last_updated: 0,
                status: result.status,
            };
        }
    }
    result
}

/// The directory answered a query: cache it and flush buffered events.
pub(crate) fn got_user_on_server(state: &Arc<ClusterState>, result: UserResult) {
    let uid = result.uid;
    let target = result
        .domain
        .as_deref()
        .filter(|_| result.port > 0)
        .map(|d| host_key(d, result.port));
    state
        .store
        .cache_accept(result, &state.config.server_ip, state.config.port);
    let events = state.store.take_pending(uid);
    if events.is_empty() {
        return;
    }
    let outcome = match &target {
        Some(host) => pipe_out(state, host, events),
        None => Err(events),
    };
    if let Err(events) = outcome {
        debug!(uid, "receiver unreachable, dropping buffered events");
        run_not_sent(state, events);
    }
}

/// `uid` was just seen sending from `domain:port`; learn its location.
pub(crate) fn fix_query_result(state: &Arc<ClusterState>, uid: Uid, domain: &str, port: u16) {
    if state.is_primary_proxy_mode() {
        if apply_user_update(state, uid, Status::Connected, domain, port)
            && state.config.primary_synchronizing
        {
            let result = UserResult {
                uid,
                domain: Some(domain.to_string()),
                port,
                last_updated: epoch_ms() as i64,
                status: Status::Connected,
            };
            state.topology.broadcast(
                Role::DirectoryPeer,
                &Message::UserResult(result),
                |o| o.domain == domain && o.port == port,
            );
        }
        return;
    }
    let now = epoch_ms() as i64;
    if !state
        .store
        .cache_observe(uid, domain, port, state.config.user_caching_time_ms, now)
    {
        return;
    }
    let events = state.store.take_pending(uid);
    if events.is_empty() {
        return;
    }
    if let Err(events) = pipe_out(state, &host_key(domain, port), events) {
        run_not_sent(state, events);
    }
}

/// `uid` logged in on `domain:port` while holding a session here.
pub(crate) fn notify_duplicated_login(state: &ClusterState, uid: Uid, time: u64, domain: &str, port: u16) {
    if !state.config.primary_server {
        state.store.cache_accept(
            UserResult {
                uid,
                domain: Some(domain.to_string()),
                port,
                last_updated: time as i64,
                status: Status::Connected,
            },
            &state.config.server_ip,
            state.config.port,
        );
    }
    if let Some(node) = state.node() {
        node.on_duplicate_login(uid, time, domain, port);
    }
}

/// An event arrived over a service pipe from `domain:port`.
pub(crate) fn relay_from_peer(state: &Arc<ClusterState>, domain: &str, port: u16, mut event: Event) {
    let source = host_key(domain, port);
    let sender = event.sender;
    if state.is_primary_proxy_mode() {
        route(state, event, Some(source.as_str()));
    } else if let Some(node) = state.node() {
        if is_user_online(state, event.receiver) {
            node.deliver(&event);
            ClusterMetrics::incr(&state.metrics.events_delivered);
        } else {
            event.sender = 0;
            route(state, event, Some(source.as_str()));
        }
    }
    if sender > 0 && (!state.config.primary_server || state.config.primary_proxy_server) {
        fix_query_result(state, sender, domain, port);
    }
}

// ---------------------------------------------------------------------------
// Status queries
// ---------------------------------------------------------------------------

pub(crate) fn is_user_online(state: &ClusterState, uid: Uid) -> bool {
    if state.config.primary_server {
        return state
            .store
            .get_user(uid)
            .is_some_and(|r| r.status == Status::Connected);
    }
    state
        .store
        .cache_get(uid)
        .is_some_and(|r| r.status == Status::Connected && r.last_updated == LOCAL_SENTINEL)
}

fn status_code(state: &ClusterState, r: &UserResult) -> i32 {
    if r.status != Status::Connected {
        return 0;
    }
    let here = r
        .domain
        .as_deref()
        .is_some_and(|d| state.config.is_self(d, r.port));
    if here { 1 } else { -1 }
}

pub(crate) fn user_cluster_status(state: &ClusterState, uid: Uid) -> i32 {
    let record = if state.config.primary_server {
        state.store.get_user(uid)
    } else {
        state.store.cache_get(uid)
    };
    record.map_or(0, |r| status_code(state, &r))
}

pub(crate) fn query_user_cluster_status(state: &Arc<ClusterState>, uid: Uid) -> i32 {
    if state.config.primary_server {
        return i32::from(is_user_online(state, uid));
    }
    let now = epoch_ms() as i64;
    if let Some(r) = state
        .store
        .cache_lookup(uid, state.config.user_caching_time_ms, now)
    {
        return i32::from(r.status == Status::Connected);
    }
    if let Some(outlet) = state.topology.up_outlet() {
        outlet.push(Message::UserQuery { uid });
    }
    -1
}
