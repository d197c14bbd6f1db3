//! Request/response calls: the handlers this node answers, and the retrying
//! call helper it uses toward other nodes.

use std::sync::Arc;

use tracing::{debug, warn};

use super::auth;
use super::error::{ClusterError, Result};
use super::gateway;
use super::router;
use super::state::{ClusterMetrics, ClusterState};
use super::sync;
use super::wire::{
    Event, Message, RETURN_ERROR, RETURN_OK, RETURN_SLOT_OVERFLOW, RETURN_UNAUTHORIZED, Request, Response,
    SlotSnapshot, UserResult,
};
use super::{SLOTS, Status, Uid, epoch_ms};

/// Call `endpoint`, resubmitting up to `retries` more times while the
/// transport fails. Any response, including a refusal, ends the attempts.
pub(crate) async fn call_with_retries(
    state: &ClusterState,
    endpoint: &str,
    request: Request,
    retries: u32,
) -> Result<Response> {
    let mut attempt = 0;
    loop {
        match state.transport.call(endpoint, request.clone()).await {
            Ok(response) => return Ok(response),
            Err(e) if attempt < retries && !state.cancel.is_cancelled() => {
                attempt += 1;
                debug!(endpoint, attempt, error = %e, "call failed, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Answer one inbound call. Authorization failures are answered with an
/// error code and otherwise ignored.
pub(crate) async fn handle_request(state: &Arc<ClusterState>, request: Request, peer_ip: &str) -> Response {
    match request {
        Request::ClosePipe {
            api_secret,
            pipe_key,
        } => {
            if !authorized(state, api_secret.as_deref(), "close-pipe", peer_ip) {
                return Response::ReturnCode(RETURN_ERROR);
            }
            close_pipe(state, &pipe_key)
        }
        Request::SendEvent {
            api_secret,
            server_ip,
            server_port,
            events,
        } => {
            if !authorized(state, api_secret.as_deref(), "send-event", peer_ip) {
                return Response::ReturnCode(RETURN_ERROR);
            }
            let domain = server_ip
                .filter(|ip| !ip.is_empty())
                .unwrap_or_else(|| peer_ip.to_string());
            send_event(state, &domain, server_port, events)
        }
        Request::SynchronizeSlot {
            api_secret,
            slot,
            master_mode,
        } => {
            if !authorized(state, api_secret.as_deref(), "synchronize-slot", peer_ip) {
                return Response::ReturnCode(RETURN_ERROR);
            }
            synchronize_slot(state, slot, master_mode).await
        }
        Request::GatewaySendEvents { api_secret, events } => {
            gateway::handle_send_events(state, api_secret.as_deref(), events, peer_ip)
        }
        Request::QueryUserStatus { api_secret, uid } => {
            if !authorized(state, api_secret.as_deref(), "query-user-status", peer_ip) {
                return Response::UserClusterStatus {
                    return_code: RETURN_UNAUTHORIZED,
                    status: None,
                    domain: None,
                    port: 0,
                };
            }
            query_user_status(state, uid)
        }
    }
}

fn authorized(state: &ClusterState, secret: Option<&str>, call: &str, peer_ip: &str) -> bool {
    if auth::check_api_secret(&state.config, secret) {
        return true;
    }
    ClusterMetrics::incr(&state.metrics.auth_failures);
    warn!(call, peer = peer_ip, "call rejected: bad api secret");
    false
}

fn close_pipe(state: &ClusterState, key: &str) -> Response {
    if state.topology.close_outlet_by_key(key) {
        Response::ReturnCode(RETURN_OK)
    } else {
        debug!(key, "close pipe: no outlet with that key");
        Response::ReturnCode(RETURN_ERROR)
    }
}

/// Events relayed by a directory. `domain:port` is the server the directory
/// says they came from, so senders are learned as living there.
fn send_event(state: &Arc<ClusterState>, domain: &str, port: u16, events: Vec<Event>) -> Response {
    for event in events {
        if event.receiver <= 0 {
            continue;
        }
        if let Some(node) = state.node()
            && node.deliver(&event)
        {
            ClusterMetrics::incr(&state.metrics.events_delivered);
        }
        if event.sender > 0 {
            router::fix_query_result(state, event.sender, domain, port);
        }
    }
    Response::ReturnCode(RETURN_OK)
}

async fn synchronize_slot(state: &Arc<ClusterState>, slot: u8, master_mode: bool) -> Response {
    if usize::from(slot) >= SLOTS {
        warn!(slot, "slot snapshot requested for a slot out of range");
        return Response::ReturnCode(RETURN_ERROR);
    }
    let worker_state = state.clone();
    let snapshot = state
        .workers
        .call(move || sync::snapshot_slot(&worker_state, slot, master_mode))
        .await;
    match snapshot {
        Some(Ok(snapshot)) => Response::SlotSnapshot(snapshot),
        Some(Err(e)) => {
            warn!(slot, error = %e, "slot snapshot failed");
            let return_code = match e {
                ClusterError::BitmapOverflow { .. } => RETURN_SLOT_OVERFLOW,
                _ => RETURN_ERROR,
            };
            Response::SlotSnapshot(SlotSnapshot {
                return_code,
                time: epoch_ms(),
                ..SlotSnapshot::default()
            })
        }
        None => Response::ReturnCode(RETURN_ERROR),
    }
}

fn user_status(return_code: i32, record: Option<UserResult>) -> Response {
    match record {
        Some(r) => Response::UserClusterStatus {
            return_code,
            status: Some(r.status),
            domain: r.domain,
            port: r.port,
        },
        None => Response::UserClusterStatus {
            return_code,
            status: None,
            domain: None,
            port: 0,
        },
    }
}

/// 1 online, 0 offline, -1 asked upstream and not known yet.
fn query_user_status(state: &ClusterState, uid: Uid) -> Response {
    if state.config.primary_server {
        let record = state.store.get_user(uid);
        let online = record.as_ref().is_some_and(|r| r.status == Status::Connected);
        return user_status(i32::from(online), record);
    }
    let now = epoch_ms() as i64;
    if let Some(r) = state
        .store
        .cache_lookup(uid, state.config.user_caching_time_ms, now)
    {
        return user_status(i32::from(r.status == Status::Connected), Some(r));
    }
    if let Some(outlet) = state.topology.up_outlet() {
        outlet.push(Message::UserQuery { uid });
    }
    user_status(-1, None)
}
