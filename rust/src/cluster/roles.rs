//! What each dialed link does with the messages its peer pushes, and what
//! happens when a link connects or goes away for good.
//!
//! Each role acts on a fixed set of message kinds, listed in
//! [`handled_kinds`].
//!
//! Anything else is ignored.

use std::sync::Arc;

use tracing::{debug, info, trace};

use super::pipe::{Pipe, Role};
use super::router;
use super::state::{ClusterMetrics, ClusterState};
use super::sync;
use super::topology;
use super::wire::{Message, MessageKind, ServerStatus, SetupReply, UserResult};
use super::{Status, Uid, epoch_ms, host_key};

const DIRECTORY_PEER_KINDS: &[MessageKind] = &[
    MessageKind::HeartBeat,
    MessageKind::ServerStatus,
    MessageKind::UserResult,
    MessageKind::ServerLost,
    MessageKind::ServerStopping,
];

const DOWN_KINDS: &[MessageKind] = &[
    MessageKind::HeartBeat,
    MessageKind::ServerStatus,
    MessageKind::UserResult,
    MessageKind::UserDuplicated,
];

const UP_KINDS: &[MessageKind] = &[
    MessageKind::HeartBeat,
    MessageKind::UserStatus,
    MessageKind::UserQuery,
    MessageKind::ServerStopping,
];

const SERVICE_PEER_KINDS: &[MessageKind] = &[MessageKind::HeartBeat, MessageKind::Event];

/// Message kinds a role acts on. Anything else is ignored.
pub(crate) fn handled_kinds(role: Role) -> &'static [MessageKind] {
    match role {
        Role::DirectoryPeer => DIRECTORY_PEER_KINDS,
        Role::Down => DOWN_KINDS,
        Role::Up => UP_KINDS,
        Role::ServicePeer => SERVICE_PEER_KINDS,
    }
}

pub(crate) fn dispatch(state: &Arc<ClusterState>, pipe: &Arc<Pipe>, msg: Message) {
    if let Message::Unknown { kind } = msg {
        ClusterMetrics::incr(&state.metrics.unknown_message_kinds);
        debug!(role = %pipe.role, host = %pipe.host, kind, "unknown message kind dropped");
        return;
    }
    if !msg.kind().is_some_and(|kind| handled_kinds(pipe.role).contains(&kind)) {
        ignored(pipe, &msg);
        return;
    }
    if let Message::HeartBeat { .. } = msg {
        pipe.touch();
        if pipe.role == Role::Up
            && let Some(outlet) = state.topology.down_outlet(&pipe.host)
        {
            outlet.touch();
        }
        return;
    }
    match pipe.role {
        Role::DirectoryPeer => directory_peer(state, pipe, msg),
        Role::Down => down(state, msg),
        Role::Up => up(state, pipe, msg),
        Role::ServicePeer => service_peer(state, pipe, msg),
    }
}

fn ignored(pipe: &Pipe, msg: &Message) {
    trace!(role = %pipe.role, host = %pipe.host, kind = ?msg.kind(), "message not handled by role");
}

// ---------------------------------------------------------------------------
// Directory to directory
// ---------------------------------------------------------------------------

fn directory_peer(state: &Arc<ClusterState>, pipe: &Arc<Pipe>, msg: Message) {
    match msg {
        Message::UserResult(result) => {
            let domain = result.domain.clone().unwrap_or_default();
            if result.status == Status::Connected && domain.is_empty() {
                debug!(host = %pipe.host, uid = result.uid, "connected user result without owner dropped");
                return;
            }
            let changed = router::apply_user_update(state, result.uid, result.status, &domain, result.port);
            if changed && state.config.primary_synchronizing {
                state.topology.broadcast(
                    Role::DirectoryPeer,
                    &Message::UserResult(result),
                    |o| o.host == pipe.host,
                );
            }
        }
        Message::ServerStatus(status) => peer_server_status(state, pipe, status),
        Message::ServerLost(lost) => {
            let worker_state = state.clone();
            let from = pipe.host.clone();
            state
                .workers
                .run(move || sync::receive_server_lost(&worker_state, &from, lost));
        }
        Message::ServerStopping => pipe.set_stopping(true),
        other => ignored(pipe, &other),
    }
}

/// A peer directory reports a service server coming or going.
fn peer_server_status(state: &Arc<ClusterState>, pipe: &Pipe, status: ServerStatus) {
    let config = &state.config;
    let host = host_key(&status.domain, status.port);
    let previous = if status.status == Status::Disconnected {
        state.servers.remove(&host)
    } else {
        state.servers.put(host.clone(), status.clone())
    };
    let news = previous.is_none_or(|p| p.status == Status::Disconnected && status.status == Status::Connected);
    if news {
        let msg = Message::ServerStatus(status.clone());
        if !state.is_primary_proxy_mode() {
            state.topology.broadcast(Role::Down, &msg, |o| o.host == host);
        }
        if config.primary_synchronizing {
            state.topology.broadcast(Role::DirectoryPeer, &msg, |o| {
                o.host == pipe.host || o.host == host
            });
        }
    }
    if status.status == Status::Connected
        && !config.primary_login_server
        && !config.is_self(&status.domain, status.port)
    {
        topology::create_service_link(state, &status.domain, status.port);
    }
}

// ---------------------------------------------------------------------------
// Service to directory
// ---------------------------------------------------------------------------

fn down(state: &Arc<ClusterState>, msg: Message) {
    match msg {
        Message::ServerStatus(status) => {
            if state.config.is_self(&status.domain, status.port) {
                return;
            }
            if status.status == Status::Connected {
                topology::create_service_link(state, &status.domain, status.port);
            }
            state
                .servers
                .put(host_key(&status.domain, status.port), status);
        }
        Message::UserResult(result) => router::got_user_on_server(state, result),
        Message::UserDuplicated {
            uid,
            domain,
            port,
            time,
        } => router::notify_duplicated_login(state, uid, time, &domain, port),
        other => trace!(kind = ?other.kind(), "message not handled by down link"),
    }
}

// ---------------------------------------------------------------------------
// Directory to service
// ---------------------------------------------------------------------------

fn up(state: &Arc<ClusterState>, pipe: &Arc<Pipe>, msg: Message) {
    match msg {
        Message::UserStatus { uid, status, time } => {
            let changed = router::apply_user_update(state, uid, status, &pipe.domain, pipe.port);
            if changed && state.config.primary_synchronizing {
                let (domain, port) = if state.is_primary_proxy_mode() {
                    (state.config.server_ip.clone(), state.config.port)
                } else {
                    (pipe.domain.clone(), pipe.port)
                };
                let result = UserResult {
                    uid,
                    domain: Some(domain),
                    port,
                    last_updated: time as i64,
                    status,
                };
                state
                    .topology
                    .broadcast(Role::DirectoryPeer, &Message::UserResult(result), |_| false);
            }
        }
        Message::UserQuery { uid } => {
            let result = router::query_user_server(state, uid, &pipe.domain, pipe.port);
            if let Some(outlet) = state.topology.down_outlet(&pipe.host) {
                outlet.push(Message::UserResult(result));
            }
        }
        Message::ServerStopping => pipe.set_stopping(true),
        other => ignored(pipe, &other),
    }
}

fn service_peer(state: &Arc<ClusterState>, pipe: &Arc<Pipe>, msg: Message) {
    match msg {
        Message::Event(event) => router::relay_from_peer(state, &pipe.domain, pipe.port, event),
        other => ignored(pipe, &other),
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// The link finished its handshake.
pub(crate) fn on_created(state: &Arc<ClusterState>, pipe: &Arc<Pipe>, reply: SetupReply) {
    match pipe.role {
        Role::DirectoryPeer => {
            pipe.set_stopping(false);
            for status in reply.online_servers {
                peer_server_status(state, pipe, status);
            }
            if pipe.take_synchronizing() {
                info!(host = %pipe.host, master_mode = pipe.sync_master_mode, "synchronizing slots from peer");
                tokio::spawn(sync::synchronize_slots(
                    state.clone(),
                    pipe.domain.clone(),
                    pipe.port,
                    pipe.sync_master_mode,
                ));
            }
        }
        Role::Down => {
            let prefix = state
                .upstream
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .record_success();
            if let (Some(current), Some(prefix)) = (state.global_server(), prefix)
                && current != prefix
            {
                info!(from = %current, to = %prefix, "global directory now served by backup");
                state.set_global_server(Some(prefix));
            }
        }
        Role::Up => {
            pipe.set_stopping(false);
            if reply.online_users.is_empty() {
                return;
            }
            let worker_state = state.clone();
            let domain = pipe.domain.clone();
            let port = pipe.port;
            state.workers.run(move || {
                apply_online_users(&worker_state, &reply.online_users, &domain, port);
            });
        }
        Role::ServicePeer => {}
    }
}

fn apply_online_users(state: &Arc<ClusterState>, uids: &[Uid], domain: &str, port: u16) {
    let mut applied = 0usize;
    for &uid in uids.iter().filter(|&&uid| uid > 0) {
        router::apply_user_update(state, uid, Status::Connected, domain, port);
        applied += 1;
    }
    debug!(domain, port, users = applied, "online users of attached server applied");
}

/// The link was removed from its registry and will not be redialed.
pub(crate) fn on_removed(state: &Arc<ClusterState>, pipe: &Arc<Pipe>) {
    info!(role = %pipe.role, host = %pipe.host, stopping = pipe.is_stopping(), "pipe removed");
    match pipe.role {
        Role::Up => lost_service_server(state, pipe),
        Role::ServicePeer => {
            state
                .topology
                .remove_outlet_if(Role::ServicePeer, &pipe.host, |_| true);
            state.servers.remove(&pipe.host);
        }
        Role::DirectoryPeer | Role::Down => {}
    }
}

/// A directory lost its link to an attached service server. Unless the
/// server said it was stopping, its users are dropped and peers told.
fn lost_service_server(state: &Arc<ClusterState>, pipe: &Arc<Pipe>) {
    let host = pipe.host.clone();
    state.servers.remove(&host);
    state
        .topology
        .remove_outlet_if(Role::Down, &host, |o| !o.is_live());
    if pipe.is_stopping() {
        return;
    }
    let gone = Message::ServerStatus(ServerStatus {
        domain: pipe.domain.clone(),
        port: pipe.port,
        status: Status::Disconnected,
    });
    if state.is_primary_master_mode() {
        state.topology.broadcast(Role::Down, &gone, |o| o.host == host);
    }
    let worker_state = state.clone();
    let domain = pipe.domain.clone();
    let port = pipe.port;
    state.workers.run(move || {
        let started = epoch_ms();
        sync::drop_service_server(&worker_state, &domain, port);
        if worker_state.config.primary_synchronizing && !worker_state.is_primary_proxy_mode() {
            worker_state
                .topology
                .broadcast(Role::DirectoryPeer, &gone, |o| o.host == host);
        }
        debug!(%host, elapsed_ms = epoch_ms().saturating_sub(started), "lost server handled");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::cluster::pipe::Outlet;
    use crate::cluster::testing::{
        TestNode, directory_config, service_config, test_state, test_state_with,
    };
    use crate::cluster::wire::Event;

    fn outlet(state: &ClusterState, role: Role, domain: &str) -> Arc<Outlet> {
        let outlet = Arc::new(Outlet::new(role, domain, 80));
        outlet.attach();
        state.topology.install_outlet(outlet.clone());
        outlet
    }

    fn connected(domain: &str) -> ServerStatus {
        ServerStatus {
            domain: domain.into(),
            port: 80,
            status: Status::Connected,
        }
    }

    fn user_results(outlet: &Outlet) -> Vec<UserResult> {
        outlet
            .take_all()
            .into_iter()
            .filter_map(|m| match m {
                Message::UserResult(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[test]
    fn test_heartbeat_touches_link_and_unknown_kinds_counted() {
        let state = test_state(directory_config(), None);
        let down = outlet(&state, Role::Down, "s1");
        let pipe = Arc::new(Pipe::new(Role::Up, "s1", 80));
        pipe.set_last_heartbeat(1);
        down.set_last_heartbeat(1);

        dispatch(&state, &pipe, Message::HeartBeat { time: 5 });
        assert!(pipe.last_heartbeat() > 1);
        assert!(down.last_heartbeat() > 1);

        dispatch(&state, &pipe, Message::Unknown { kind: 42 });
        dispatch(&state, &pipe, Message::Event(Event::new(1, 2, &b"x"[..])));
        assert_eq!(state.metrics().unknown_message_kinds.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_peer_user_result_forwarded_to_other_peers_once() {
        let state = test_state(directory_config(), None);
        let d2 = outlet(&state, Role::DirectoryPeer, "d2");
        let d3 = outlet(&state, Role::DirectoryPeer, "d3");
        let pipe = Arc::new(Pipe::directory_peer("d2", 80, "dir", false, false));
        let result = UserResult {
            uid: 7,
            domain: Some("s1".into()),
            port: 80,
            last_updated: 1,
            status: Status::Connected,
        };

        dispatch(&state, &pipe, Message::UserResult(result.clone()));
        assert_eq!(state.store.get_user(7).unwrap().domain.as_deref(), Some("s1"));
        assert_eq!(user_results(&d3), vec![result.clone()]);
        assert!(user_results(&d2).is_empty());

        dispatch(&state, &pipe, Message::UserResult(result));
        assert!(user_results(&d3).is_empty());
    }

    #[test]
    fn test_handled_kinds_per_role() {
        for role in [Role::DirectoryPeer, Role::Down, Role::Up, Role::ServicePeer] {
            assert!(handled_kinds(role).contains(&MessageKind::HeartBeat));
        }
        assert!(handled_kinds(Role::DirectoryPeer).contains(&MessageKind::ServerLost));
        assert!(!handled_kinds(Role::Down).contains(&MessageKind::Event));
        assert!(handled_kinds(Role::Down).contains(&MessageKind::UserDuplicated));
        assert!(!handled_kinds(Role::Up).contains(&MessageKind::UserResult));
        assert_eq!(
            handled_kinds(Role::ServicePeer),
            &[MessageKind::HeartBeat, MessageKind::Event]
        );
    }

    #[test]
    fn test_unhandled_kind_leaves_state_alone() {
        let state = test_state(directory_config(), None);
        let pipe = Arc::new(Pipe::new(Role::Up, "s1", 80));
        let result = UserResult {
            uid: 7,
            domain: Some("s2".into()),
            port: 80,
            last_updated: 1,
            status: Status::Connected,
        };
        dispatch(&state, &pipe, Message::UserResult(result));
        assert!(state.store.get_user(7).is_none());
        assert_eq!(state.metrics().unknown_message_kinds.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_peer_connected_result_needs_an_owner() {
        let state = test_state(directory_config(), None);
        let d3 = outlet(&state, Role::DirectoryPeer, "d3");
        let pipe = Arc::new(Pipe::directory_peer("d2", 80, "dir", false, false));
        for domain in [None, Some(String::new())] {
            let result = UserResult {
                uid: 7,
                domain,
                port: 80,
                last_updated: 1,
                status: Status::Connected,
            };
            dispatch(&state, &pipe, Message::UserResult(result));
        }
        assert!(state.store.get_user(7).is_none());
        assert!(user_results(&d3).is_empty());
    }

    #[tokio::test]
    async fn test_peer_server_status_spreads_new_servers() {
        let state = test_state(directory_config(), None);
        let s1 = outlet(&state, Role::Down, "s1");
        let d2 = outlet(&state, Role::DirectoryPeer, "d2");
        let d3 = outlet(&state, Role::DirectoryPeer, "d3");
        let pipe = Arc::new(Pipe::directory_peer("d2", 80, "dir", false, false));

        dispatch(&state, &pipe, Message::ServerStatus(connected("s5")));
        assert!(state.servers.contains("s5"));
        assert_eq!(s1.take_all(), vec![Message::ServerStatus(connected("s5"))]);
        assert_eq!(d3.take_all(), vec![Message::ServerStatus(connected("s5"))]);
        assert!(d2.take_all().is_empty());
        assert!(state.topology.link(Role::ServicePeer, "s5").is_some());

        // Already known: nothing to spread.
        dispatch(&state, &pipe, Message::ServerStatus(connected("s5")));
        assert!(s1.take_all().is_empty());

        let mut gone = connected("s5");
        gone.status = Status::Disconnected;
        dispatch(&state, &pipe, Message::ServerStatus(gone));
        assert!(!state.servers.contains("s5"));
        state.cancel.cancel();
    }

    #[tokio::test]
    async fn test_proxy_keeps_outer_servers_from_inner_ones() {
        let mut config = directory_config();
        config.primary_proxy_server = true;
        let state = test_state(config, None);
        let s1 = outlet(&state, Role::Down, "s1");
        let pipe = Arc::new(Pipe::directory_peer("d2", 80, "dir", false, false));
        dispatch(&state, &pipe, Message::ServerStatus(connected("s5")));
        assert!(s1.take_all().is_empty());
        state.cancel.cancel();
    }

    #[test]
    fn test_server_stopping_marks_link() {
        let state = test_state(directory_config(), None);
        let pipe = Arc::new(Pipe::directory_peer("d2", 80, "dir", false, false));
        dispatch(&state, &pipe, Message::ServerStopping);
        assert!(pipe.is_stopping());
        on_created(&state, &pipe, SetupReply::default());
        assert!(!pipe.is_stopping());
    }

    #[tokio::test]
    async fn test_down_link_learns_servers_and_results() {
        let node = TestNode::new("s1");
        let state = test_state(service_config(), Some(node.clone()));
        let pipe = Arc::new(Pipe::new(Role::Down, "dir", 80));

        dispatch(&state, &pipe, Message::ServerStatus(connected("s1")));
        assert!(state.servers.is_empty());
        dispatch(&state, &pipe, Message::ServerStatus(connected("s2")));
        assert!(state.servers.contains("s2"));
        assert!(state.topology.link(Role::ServicePeer, "s2").is_some());

        dispatch(
            &state,
            &pipe,
            Message::UserResult(UserResult {
                uid: 4,
                domain: Some("s2".into()),
                port: 80,
                last_updated: epoch_ms() as i64,
                status: Status::Connected,
            }),
        );
        assert_eq!(state.store.cache_get(4).unwrap().domain.as_deref(), Some("s2"));

        dispatch(
            &state,
            &pipe,
            Message::UserDuplicated {
                uid: 4,
                domain: "s3".into(),
                port: 80,
                time: 1,
            },
        );
        assert_eq!(node.duplicates(), vec![(4, "s3".to_string(), 80)]);
        state.cancel.cancel();
    }

    #[test]
    fn test_down_link_adopts_backup_prefix() {
        let state = test_state(service_config(), None);
        state.set_global_server(Some("http://dir".into()));
        let pipe = Arc::new(Pipe::new(Role::Down, "dir", 80));
        on_created(&state, &pipe, SetupReply::default());
        assert_eq!(state.global_server().as_deref(), Some("http://dir"));

        // The link dialed a backup and got through.
        state.upstream.lock().unwrap().current("http://backup");
        on_created(&state, &pipe, SetupReply::default());
        assert_eq!(state.global_server().as_deref(), Some("http://backup"));
    }

    #[test]
    fn test_up_link_status_and_query() {
        let state = test_state(directory_config(), None);
        let s1 = outlet(&state, Role::Down, "s1");
        let d2 = outlet(&state, Role::DirectoryPeer, "d2");
        let pipe = Arc::new(Pipe::new(Role::Up, "s1", 80));

        dispatch(
            &state,
            &pipe,
            Message::UserStatus {
                uid: 9,
                status: Status::Connected,
                time: 77,
            },
        );
        assert_eq!(state.store.get_user(9).unwrap().domain.as_deref(), Some("s1"));
        let relayed = user_results(&d2);
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].last_updated, 77);
        assert_eq!(relayed[0].domain.as_deref(), Some("s1"));

        s1.take_all();
        dispatch(&state, &pipe, Message::UserQuery { uid: 9 });
        let answers = user_results(&s1);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].uid, 9);
        assert_eq!(answers[0].status, Status::Connected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_up_link_applies_online_users() {
        let state = test_state(directory_config(), None);
        let pipe = Arc::new(Pipe::new(Role::Up, "s1", 80));
        let reply = SetupReply {
            online_users: vec![0, -3, 11, 12],
            ..SetupReply::default()
        };
        on_created(&state, &pipe, reply);
        assert!(wait_for(|| state.store.get_user(11).is_some() && state.store.get_user(12).is_some()).await);
        assert!(state.store.get_user(0).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lost_service_server_dropped_and_reported() {
        let (state, _transport) = test_state_with(directory_config(), None);
        state.set_master(Some(("dir".into(), 80)));
        let s1 = Arc::new(Outlet::new(Role::Down, "s1", 80));
        state.topology.install_outlet(s1);
        let s2 = outlet(&state, Role::Down, "s2");
        let d2 = outlet(&state, Role::DirectoryPeer, "d2");
        router::apply_user_update(&state, 5, Status::Connected, "s1", 80);
        router::apply_user_update(&state, 6, Status::Connected, "s1", 80);
        state.servers.put("s1".into(), connected("s1"));
        s2.take_all();
        d2.take_all();

        let pipe = Arc::new(Pipe::new(Role::Up, "s1", 80));
        on_removed(&state, &pipe);
        assert!(state.topology.down_outlet("s1").is_none());
        assert!(!state.servers.contains("s1"));
        let mut gone = connected("s1");
        gone.status = Status::Disconnected;
        assert_eq!(s2.take_all(), vec![Message::ServerStatus(gone.clone())]);

        assert!(
            wait_for(|| state
                .store
                .get_user(5)
                .is_some_and(|r| r.status == Status::Disconnected))
            .await
        );
        assert!(wait_for(|| d2.pending_len() >= 3).await);
        let sent = d2.take_all();
        assert!(matches!(&sent[0], Message::ServerLost(l) if l.domain == "s1" && l.slot == 5));
        assert!(sent.contains(&Message::ServerStatus(gone)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stopping_server_keeps_its_users() {
        let state = test_state(directory_config(), None);
        let d2 = outlet(&state, Role::DirectoryPeer, "d2");
        router::apply_user_update(&state, 5, Status::Connected, "s1", 80);
        d2.take_all();
        let pipe = Arc::new(Pipe::new(Role::Up, "s1", 80));
        dispatch(&state, &pipe, Message::ServerStopping);
        on_removed(&state, &pipe);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.store.get_user(5).unwrap().status, Status::Connected);
        assert!(d2.take_all().is_empty());
    }

    #[test]
    fn test_service_peer_delivers_and_learns_sender() {
        let node = TestNode::new("s1");
        let state = test_state(service_config(), Some(node.clone()));
        state.store.mark_local(3, true, "s1", 80);
        let pipe = Arc::new(Pipe::new(Role::ServicePeer, "s2", 80));

        dispatch(&state, &pipe, Message::Event(Event::new(8, 3, &b"hi"[..])));
        assert_eq!(node.delivered(), vec![Event::new(8, 3, &b"hi"[..])]);
        let sender = state.store.cache_get(8).unwrap();
        assert_eq!(sender.domain.as_deref(), Some("s2"));
    }

    #[test]
    fn test_removed_service_peer_forgets_server() {
        let state = test_state(service_config(), None);
        outlet(&state, Role::ServicePeer, "s2");
        state.servers.put("s2".into(), connected("s2"));
        let pipe = Arc::new(Pipe::new(Role::ServicePeer, "s2", 80));
        on_removed(&state, &pipe);
        assert!(state.topology.service_outlet("s2").is_none());
        assert!(!state.servers.contains("s2"));
    }
}
