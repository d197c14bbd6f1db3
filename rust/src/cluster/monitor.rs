//! Liveness monitor: heartbeat emission on accepted outlets, a sweep that
//! closes dialed links whose peer went quiet, and the reconnect scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::epoch_ms;
use super::pipe::{Pipe, PipeState};
use super::state::ClusterState;
use super::topology;
use super::wire::Message;

/// Upper bound on how long the scheduler sleeps with nothing queued.
const IDLE_WAIT: Duration = Duration::from_secs(60);

pub struct Monitor {
    queue: Mutex<Vec<Arc<Pipe>>>,
    wake: Notify,
    started: AtomicBool,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            wake: Notify::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the three monitor tasks. Later calls do nothing. The tasks stop
    /// when the cluster state is cancelled.
    pub(crate) fn start(&self, state: &Arc<ClusterState>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let heartbeat = Duration::from_millis(state.config.server_heartbeat_interval_ms.max(1));
        let sweep = Duration::from_millis(state.config.pipe_monitor_interval_ms.max(1));
        tokio::spawn(every(state.clone(), heartbeat, |s| {
            emit_heartbeats(s);
        }));
        tokio::spawn(every(state.clone(), sweep, |s| {
            sweep_links(s);
        }));
        tokio::spawn(reconnect_loop(state.clone()));
        debug!(
            heartbeat_ms = heartbeat.as_millis() as u64,
            sweep_ms = sweep.as_millis() as u64,
            "liveness monitor started"
        );
    }

    /// Queue a link for redial once its backoff delay has passed.
    pub(crate) fn schedule(&self, pipe: Arc<Pipe>) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if !queue.iter().any(|p| Arc::ptr_eq(p, &pipe)) {
                queue.push(pipe);
            }
        }
        self.wake.notify_one();
    }

    pub(crate) fn clear(&self) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.wake.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Remove and return the links due at `now`, with the wait until the
    /// next one. Removed links are dropped from the queue.
    fn take_due(&self, now: u64) -> (Vec<Arc<Pipe>>, Option<Duration>) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let mut due = Vec::new();
        let mut next: Option<Duration> = None;
        queue.retain(|pipe| {
            if pipe.is_removed() {
                return false;
            }
            let remaining = pipe.remaining_delay(now);
            if remaining.is_zero() {
                due.push(pipe.clone());
                return false;
            }
            next = Some(next.map_or(remaining, |n| n.min(remaining)));
            true
        });
        (due, next)
    }
}

async fn every(state: Arc<ClusterState>, period: Duration, tick: fn(&Arc<ClusterState>)) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => tick(&state),
            () = state.cancel.cancelled() => break,
        }
    }
}

/// Push a heartbeat down every live accepted outlet.
pub(crate) fn emit_heartbeats(state: &ClusterState) -> usize {
    let msg = Message::HeartBeat { time: epoch_ms() };
    let mut sent = 0;
    for outlet in state.topology.outlets() {
        if outlet.is_live() {
            outlet.push(msg.clone());
            sent += 1;
        }
    }
    sent
}

/// Close dialed links that have not heard a heartbeat within the timeout.
/// The remote end is asked to close first so it drops its outlet too.
pub(crate) fn sweep_links(state: &Arc<ClusterState>) -> usize {
    let now = epoch_ms();
    let timeout = state.config.pipe_heartbeat_timeout_ms;
    let mut closed = 0;
    for pipe in state.topology.links() {
        if !pipe.is_attached() || pipe.is_live(timeout, now) {
            continue;
        }
        // One close request per timeout period.
        pipe.touch();
        info!(
            role = %pipe.role,
            host = %pipe.host,
            silent_ms = now.saturating_sub(pipe.last_heartbeat()),
            "pipe heartbeat timed out, closing"
        );
        let endpoint = topology::endpoint_for(state, &pipe);
        topology::close_remotely(state, pipe, endpoint);
        closed += 1;
    }
    closed
}

async fn reconnect_loop(state: Arc<ClusterState>) {
    loop {
        let (due, next) = state.monitor.take_due(epoch_ms());
        for pipe in due {
            if pipe.is_attached() || pipe.state() == PipeState::Live {
                continue;
            }
            debug!(role = %pipe.role, host = %pipe.host, retries = pipe.retries(), "redialing pipe");
            topology::dial(&state, pipe);
        }
        let wait = next.unwrap_or(IDLE_WAIT);
        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            () = state.monitor.wake.notified() => {}
            () = state.cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::error::ClusterError;
    use crate::cluster::pipe::{Outlet, Role};
    use crate::cluster::testing::{directory_config, test_state, test_state_with};
    use crate::cluster::wire::Request;

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
    fn test_heartbeats_only_reach_live_outlets() {
        let state = test_state(directory_config(), None);
        let live = Arc::new(Outlet::new(Role::Down, "s1", 80));
        live.attach();
        let idle = Arc::new(Outlet::new(Role::Down, "s2", 80));
        state.topology.install_outlet(live.clone());
        state.topology.install_outlet(idle.clone());

        assert_eq!(emit_heartbeats(&state), 1);
        assert!(matches!(live.take_all().as_slice(), [Message::HeartBeat { .. }]));
        assert!(idle.take_all().is_empty());
    }

    #[test]
    fn test_schedule_dedups_and_splits_due() {
        let monitor = Monitor::new();
        let due = Arc::new(Pipe::new(Role::ServicePeer, "s1", 80));
        let later = Arc::new(Pipe::new(Role::ServicePeer, "s2", 80));
        let gone = Arc::new(Pipe::new(Role::ServicePeer, "s3", 80));
        let now = epoch_ms();
        let policy = crate::cluster::backoff::BackoffPolicy::from_config(&directory_config());
        later.schedule_retry(&policy, now);
        gone.set_state(PipeState::Removed);

        monitor.schedule(due.clone());
        monitor.schedule(due.clone());
        monitor.schedule(later.clone());
        monitor.schedule(gone);
        assert_eq!(monitor.pending(), 3);

        let (ready, next) = monitor.take_due(now);
        assert_eq!(ready.len(), 1);
        assert!(Arc::ptr_eq(&ready[0], &due));
        assert_eq!(next, Some(Duration::from_millis(20)));
        assert_eq!(monitor.pending(), 1);

        monitor.clear();
        assert_eq!(monitor.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_link_is_redialed_until_it_connects() {
        let (state, transport) = test_state_with(directory_config(), None);
        state.monitor.start(&state);
        topology::create_service_link(&state, "s2", 80);

        assert!(wait_for(|| transport.opens().len() >= 3).await);
        assert!(state.metrics().reconnects_scheduled.load(Ordering::Relaxed) >= 2);

        transport.accept_pipes.store(true, Ordering::SeqCst);
        let pipe = state.topology.link(Role::ServicePeer, "s2").unwrap();
        assert!(wait_for(|| pipe.is_attached()).await);
        assert_eq!(pipe.retries(), 0);
        state.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sweep_asks_remote_to_close_silent_link() {
        let (state, transport) = test_state_with(directory_config(), None);
        transport.accept_pipes.store(true, Ordering::SeqCst);
        topology::create_service_link(&state, "s2", 80);
        let pipe = state.topology.link(Role::ServicePeer, "s2").unwrap();
        assert!(wait_for(|| pipe.is_attached()).await);

        assert_eq!(sweep_links(&state), 0);
        pipe.set_last_heartbeat(epoch_ms() - state.config.pipe_heartbeat_timeout_ms - 1);
        assert_eq!(sweep_links(&state), 1);
        assert_eq!(sweep_links(&state), 0);

        assert!(
            wait_for(|| transport.calls().iter().any(|(endpoint, r)| {
                endpoint == "http://s2"
                    && matches!(r, Request::ClosePipe { pipe_key, .. } if pipe_key == "key-http://s2")
            }))
            .await
        );
        // The remote accepted the close, so the local socket is left to it.
        assert!(pipe.is_attached());
        state.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sweep_forces_close_when_remote_unreachable() {
        let (state, transport) = test_state_with(directory_config(), None);
        transport.accept_pipes.store(true, Ordering::SeqCst);
        transport.respond_with(|endpoint, _| {
            Err(ClusterError::Transport {
                endpoint: endpoint.to_string(),
                reason: "refused".into(),
            })
        });
        topology::create_service_link(&state, "s2", 80);
        let pipe = state.topology.link(Role::ServicePeer, "s2").unwrap();
        assert!(wait_for(|| pipe.is_attached()).await);

        pipe.set_last_heartbeat(0);
        assert_eq!(sweep_links(&state), 1);
        assert!(wait_for(|| !pipe.is_attached()).await);
        assert!(matches!(transport.calls().last(), Some((_, Request::ClosePipe { .. }))));
        state.cancel.cancel();
    }
}
