//! The two halves of a cluster pipe.
//!
//! The dialing half ([`Pipe`]) receives pushed messages, tracks heartbeat age
//! and owns the reconnect backoff. The accepting half ([`Outlet`]) owns the
//! outbound queue; it keeps queueing while no socket is attached so a
//! superseding outlet can adopt what was never delivered.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::backoff::{BackoffPolicy, ReconnectBackoff};
use super::wire::Message;
use super::{epoch_ms, host_key};

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Pipe roles, named after the direction messages are pushed.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Directory to directory replication. Each side dials the other.
    DirectoryPeer = 1,
    /// Directory pushes server and user state down to a service. The service
    /// dials its governing directory and never gives up on it.
    Down = 2,
    /// Service pushes user status and queries up. The directory dials back
    /// when a service attaches.
    Up = 3,
    /// Service to service event relay.
    ServicePeer = 4,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::DirectoryPeer, Role::Down, Role::Up, Role::ServicePeer];

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::DirectoryPeer),
            2 => Some(Self::Down),
            3 => Some(Self::Up),
            4 => Some(Self::ServicePeer),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectoryPeer => "directory-peer",
            Self::Down => "down",
            Self::Up => "up",
            Self::ServicePeer => "service-peer",
        }
    }

    /// Exempt from the give-up rule.
    pub fn always_retry(self) -> bool {
        self == Self::Down
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Setup = 0,
    Live = 1,
    Closing = 2,
    Removed = 3,
}

impl PipeState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Live,
            2 => Self::Closing,
            3 => Self::Removed,
            _ => Self::Setup,
        }
    }
}

// ---------------------------------------------------------------------------
// Dialing half
// ---------------------------------------------------------------------------

pub struct Pipe {
    pub role: Role,
    /// Remote domain and port, as dialed.
    pub domain: String,
    pub port: u16,
    pub host: String,
    /// Directory-peer only: the address of ours the remote should answer for.
    pub target: Option<String>,
    /// Directory-peer only: synchronize users in master mode after connecting.
    pub sync_master_mode: bool,
    state: AtomicU8,
    key: Mutex<Option<String>>,
    last_heartbeat: AtomicU64,
    last_attempt: AtomicU64,
    backoff: Mutex<ReconnectBackoff>,
    stopping: AtomicBool,
    synchronizing: AtomicBool,
    link: Mutex<Option<CancellationToken>>,
}

impl Pipe {
    pub fn new(role: Role, domain: &str, port: u16) -> Self {
        Self {
            role,
            domain: domain.to_string(),
            port,
            host: host_key(domain, port),
            target: None,
            sync_master_mode: false,
            state: AtomicU8::new(PipeState::Setup as u8),
            key: Mutex::new(None),
            last_heartbeat: AtomicU64::new(epoch_ms()),
            last_attempt: AtomicU64::new(0),
            backoff: Mutex::new(ReconnectBackoff::new()),
            stopping: AtomicBool::new(false),
            synchronizing: AtomicBool::new(false),
            link: Mutex::new(None),
        }
    }

    pub fn directory_peer(domain: &str, port: u16, target: &str, synchronizing: bool, master_mode: bool) -> Self {
        let mut pipe = Self::new(Role::DirectoryPeer, domain, port);
        pipe.target = Some(target.to_string());
        pipe.sync_master_mode = master_mode;
        pipe.synchronizing = AtomicBool::new(synchronizing);
        pipe
    }

    pub fn state(&self) -> PipeState {
        PipeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: PipeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn key(&self) -> Option<String> {
        self.key.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last_heartbeat(&self) -> u64 {
        self.last_heartbeat.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_heartbeat.store(epoch_ms(), Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn set_last_heartbeat(&self, ms: u64) {
        self.last_heartbeat.store(ms, Ordering::Relaxed);
    }

    /// Connected and heard from within the heartbeat timeout.
    pub fn is_live(&self, heartbeat_timeout_ms: u64, now: u64) -> bool {
        self.state() == PipeState::Live
            && now.abs_diff(self.last_heartbeat()) < heartbeat_timeout_ms
    }

    pub fn is_removed(&self) -> bool {
        self.state() == PipeState::Removed
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn set_stopping(&self, stopping: bool) {
        self.stopping.store(stopping, Ordering::Release);
    }

    /// Clears the flag, returning whether synchronization was requested.
    pub fn take_synchronizing(&self) -> bool {
        self.synchronizing.swap(false, Ordering::AcqRel)
    }

    /// Handshake finished: reset backoff and remember the remote's key.
    pub fn connected(&self, key: String, link: CancellationToken) {
        *self.key.lock().unwrap_or_else(|e| e.into_inner()) = Some(key);
        *self.link.lock().unwrap_or_else(|e| e.into_inner()) = Some(link);
        self.backoff.lock().unwrap_or_else(|e| e.into_inner()).reset();
        self.touch();
        self.set_state(PipeState::Live);
    }

    /// Force the current socket closed. The read loop then runs teardown.
    pub fn close_link(&self) {
        if let Some(link) = self.link.lock().unwrap_or_else(|e| e.into_inner()).take() {
            link.cancel();
        }
    }

    pub fn is_attached(&self) -> bool {
        self.link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    pub fn detach(&self) {
        self.link.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.key.lock().unwrap_or_else(|e| e.into_inner()).take();
        if self.state() != PipeState::Removed {
            self.set_state(PipeState::Closing);
        }
    }

    pub fn should_give_up(&self, policy: &BackoffPolicy, now: u64) -> bool {
        let since = now.saturating_sub(self.last_heartbeat());
        self.backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .should_give_up(policy, since, self.role.always_retry())
    }

    /// Count one failure and stamp the attempt time. Returns the delay.
    pub fn schedule_retry(&self, policy: &BackoffPolicy, now: u64) -> Duration {
        let delay = self
            .backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next_delay(policy);
        self.last_attempt.store(now, Ordering::Relaxed);
        delay
    }

    pub fn retries(&self) -> u32 {
        self.backoff.lock().unwrap_or_else(|e| e.into_inner()).retries()
    }

    /// Time left before a scheduled redial, zero once due.
    pub fn remaining_delay(&self, now: u64) -> Duration {
        let delay = self.backoff.lock().unwrap_or_else(|e| e.into_inner()).delay();
        let elapsed = now.abs_diff(self.last_attempt.load(Ordering::Relaxed));
        delay.saturating_sub(Duration::from_millis(elapsed))
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("role", &self.role)
            .field("host", &self.host)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Accepting half
// ---------------------------------------------------------------------------

pub struct Outlet {
    pub role: Role,
    pub host: String,
    pub domain: String,
    pub port: u16,
    pub key: String,
    queue: Mutex<VecDeque<Message>>,
    ready: Notify,
    attached: AtomicBool,
    last_heartbeat: AtomicU64,
    closed: CancellationToken,
}

impl Outlet {
    pub fn new(role: Role, domain: &str, port: u16) -> Self {
        Self {
            role,
            host: host_key(domain, port),
            domain: domain.to_string(),
            port,
            key: uuid::Uuid::new_v4().simple().to_string(),
            queue: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            attached: AtomicBool::new(false),
            last_heartbeat: AtomicU64::new(epoch_ms()),
            closed: CancellationToken::new(),
        }
    }

    /// Queue a message for the remote end.
    pub fn push(&self, msg: Message) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(msg);
        self.ready.notify_one();
    }

    pub fn take_all(&self) -> Vec<Message> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    /// Put back a batch the socket failed to write, ahead of newer messages.
    pub fn requeue_front(&self, batch: Vec<Message>) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        for msg in batch.into_iter().rev() {
            queue.push_front(msg);
        }
    }

    /// Copy undelivered messages from a superseded outlet, minus housekeeping.
    pub fn adopt_pending(&self, old: &Outlet) {
        let carried: Vec<Message> = old
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.survives_handover())
            .cloned()
            .collect();
        if carried.is_empty() {
            return;
        }
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        for msg in carried.into_iter().rev() {
            queue.push_front(msg);
        }
        drop(queue);
        self.ready.notify_one();
    }

    pub fn pending_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn ready(&self) {
        self.ready.notified().await;
    }

    pub fn attach(&self) {
        self.attached.store(true, Ordering::Release);
        self.ready.notify_one();
    }

    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    /// A socket is attached and the outlet has not been superseded.
    pub fn is_live(&self) -> bool {
        self.attached.load(Ordering::Acquire) && !self.closed.is_cancelled()
    }

    pub fn close(&self) {
        self.attached.store(false, Ordering::Release);
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn last_heartbeat(&self) -> u64 {
        self.last_heartbeat.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_heartbeat.store(epoch_ms(), Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn set_last_heartbeat(&self, ms: u64) {
        self.last_heartbeat.store(ms, Ordering::Relaxed);
    }
}

impl fmt::Debug for Outlet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outlet")
            .field("role", &self.role)
            .field("host", &self.host)
            .field("pending", &self.pending_len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::config::ClusterConfig;
    use crate::cluster::wire::Event;

    #[test]
    fn test_role_tags() {
        for role in Role::ALL {
            assert_eq!(Role::from_u8(role as u8), Some(role));
        }
        assert_eq!(Role::from_u8(0), None);
        assert!(Role::Down.always_retry());
        assert!(!Role::Up.always_retry());
    }

    #[test]
    fn test_adopt_pending_skips_housekeeping() {
        let old = Outlet::new(Role::ServicePeer, "s1", 80);
        old.push(Message::HeartBeat { time: 1 });
        old.push(Message::Event(Event::new(1, 2, &b"x"[..])));
        old.push(Message::ServerStopping);
        old.push(Message::UserQuery { uid: 5 });

        let new = Outlet::new(Role::ServicePeer, "s1", 80);
        new.push(Message::UserQuery { uid: 6 });
        new.adopt_pending(&old);
        let msgs = new.take_all();
        assert_eq!(msgs.len(), 3);
        assert!(matches!(msgs[0], Message::Event(_)));
        assert_eq!(msgs[1], Message::UserQuery { uid: 5 });
        assert_eq!(msgs[2], Message::UserQuery { uid: 6 });
    }

    #[test]
    fn test_requeue_front_keeps_order() {
        let o = Outlet::new(Role::Up, "d", 80);
        o.push(Message::UserQuery { uid: 1 });
        o.push(Message::UserQuery { uid: 2 });
        let batch = o.take_all();
        o.push(Message::UserQuery { uid: 3 });
        o.requeue_front(batch);
        let uids: Vec<_> = o
            .take_all()
            .into_iter()
            .map(|m| match m {
                Message::UserQuery { uid } => uid,
                _ => 0,
            })
            .collect();
        assert_eq!(uids, vec![1, 2, 3]);
    }

    #[test]
    fn test_outlet_liveness() {
        let o = Outlet::new(Role::Down, "s1", 8080);
        assert_eq!(o.host, "s1:8080");
        assert!(!o.is_live());
        o.attach();
        assert!(o.is_live());
        o.close();
        assert!(!o.is_live());
        assert!(o.is_closed());
    }

    #[test]
    fn test_pipe_retry_schedule() {
        let policy = BackoffPolicy::from_config(&ClusterConfig::default());
        let p = Pipe::new(Role::ServicePeer, "s2", 80);
        assert_eq!(p.state(), PipeState::Setup);
        let delay = p.schedule_retry(&policy, 10_000);
        assert_eq!(delay, Duration::from_millis(20));
        assert_eq!(p.remaining_delay(10_005), Duration::from_millis(15));
        assert_eq!(p.remaining_delay(10_020), Duration::ZERO);
        p.connected("k".into(), CancellationToken::new());
        assert_eq!(p.retries(), 0);
        assert_eq!(p.state(), PipeState::Live);
        assert!(p.is_live(60_000, epoch_ms()));
        assert!(p.is_attached());
        p.close_link();
        assert!(!p.is_attached());
    }

    #[test]
    fn test_directory_peer_sync_flag_taken_once() {
        let p = Pipe::directory_peer("d2", 80, "d1", true, false);
        assert!(p.take_synchronizing());
        assert!(!p.take_synchronizing());
    }
}
