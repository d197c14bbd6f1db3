//! Sharded presence state.
//!
//! Directory nodes keep the authoritative [`UserRecord`] table; service nodes
//! keep a cache of directory answers plus per-user buffers of events waiting
//! for a location. All three are split into [`SLOTS`] shards, each behind its
//! own mutex. No operation holds two shard locks at once.

use std::sync::Mutex;

use ahash::AHashMap;

use super::config::ServerMoving;
use super::wire::{Event, UserResult};
use super::{SLOTS, Status, Uid, host_key, shard_of};

/// `last_updated` of a cache entry created by the local node. Never expires.
pub const LOCAL_SENTINEL: i64 = -1;

// ---------------------------------------------------------------------------
// Callback hosts
// ---------------------------------------------------------------------------

/// Hosts that queried a user and want to hear about its next change.
/// Starts at `base` slots, reuses empty slots, and grows by a quarter plus `base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackHosts {
    slots: Vec<Option<String>>,
    base: usize,
}

impl CallbackHosts {
    pub fn new(base: usize) -> Self {
        let base = base.max(1);
        Self {
            slots: vec![None; base],
            base,
        }
    }

    pub fn add(&mut self, host: &str) {
        if self.slots.iter().flatten().any(|h| h == host) {
            return;
        }
        if let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) {
            *slot = Some(host.to_string());
            return;
        }
        let len = self.slots.len();
        self.slots.resize(len + (len >> 2) + self.base, None);
        self.slots[len] = Some(host.to_string());
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().flatten().map(String::as_str)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

// ---------------------------------------------------------------------------
// Authoritative records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct UserRecord {
    owner: Option<(String, u16)>,
    status: Status,
    last_updated: i64,
    callbacks: Option<CallbackHosts>,
}

impl UserRecord {
    fn to_result(&self, uid: Uid) -> UserResult {
        let (domain, port) = match &self.owner {
            Some((d, p)) => (Some(d.clone()), *p),
            None => (None, 0),
        };
        UserResult {
            uid,
            domain,
            port,
            last_updated: self.last_updated,
            status: self.status,
        }
    }
}

/// What the directory needs to know about its surroundings to apply an update.
pub struct UpdatePolicy<'a> {
    pub local_domain: &'a str,
    pub local_port: u16,
    pub proxy_mode: bool,
    pub server_moving: Option<&'a ServerMoving>,
    pub cache_ttl_ms: u64,
    /// True when the host is a service server directly attached to this directory.
    pub is_inner: &'a dyn Fn(&str) -> bool,
}

impl UpdatePolicy<'_> {
    fn is_self(&self, domain: &str, port: u16) -> bool {
        self.local_port == port && self.local_domain == domain
    }
}

/// The previous owner of a user that just connected somewhere else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Duplicate {
    /// This node held the session.
    Local,
    Remote { domain: String, port: u16 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub changed: bool,
    pub duplicate: Option<Duplicate>,
    /// Query callbacks to notify: target host and the record to send it.
    pub fanout: Vec<(String, UserResult)>,
}

impl UpdateOutcome {
    fn unchanged() -> Self {
        Self::default()
    }
}

type Shard<T> = Mutex<AHashMap<Uid, T>>;

fn shards<T>(capacity: usize) -> Vec<Shard<T>> {
    (0..SLOTS)
        .map(|_| Mutex::new(AHashMap::with_capacity(capacity)))
        .collect()
}

pub struct PresenceStore {
    statuses: Vec<Shard<UserRecord>>,
    cache: Vec<Shard<UserResult>>,
    pending: Vec<Shard<Vec<Event>>>,
    callback_size: usize,
}

impl PresenceStore {
    pub fn new(initial_capacity: usize, callback_size: usize) -> Self {
        let per_shard = initial_capacity / SLOTS;
        Self {
            statuses: shards(per_shard),
            cache: shards(per_shard),
            pending: shards(0),
            callback_size,
        }
    }

    // -----------------------------------------------------------------------
    // Directory side
    // -----------------------------------------------------------------------

    /// Apply a connect or disconnect reported by `domain:port`. Returns whether
    /// the observable record changed, plus the notifications the caller must
    /// send once the shard lock is released.
    pub fn update_user(
        &self,
        uid: Uid,
        status: Status,
        domain: &str,
        port: u16,
        policy: &UpdatePolicy<'_>,
        now: i64,
    ) -> UpdateOutcome {
        let mut shard = self.statuses[shard_of(uid)]
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let Some(r) = shard.get_mut(&uid) else {
            let owner = (status == Status::Connected).then(|| (domain.to_string(), port));
            shard.insert(
                uid,
                UserRecord {
                    owner,
                    status,
                    last_updated: now,
                    callbacks: None,
                },
            );
            return UpdateOutcome {
                changed: true,
                ..UpdateOutcome::default()
            };
        };

        let previous_update = r.last_updated;
        r.last_updated = now;
        let mut outcome = UpdateOutcome::unchanged();

        if status == Status::Connected {
            let mut ignoring = false;
            match r.owner.clone() {
                Some((old_domain, old_port)) if old_domain != domain || old_port != port => {
                    if policy.is_self(&old_domain, old_port) {
                        outcome.duplicate = Some(Duplicate::Local);
                        outcome.changed = true;
                    } else if policy.server_moving.is_some_and(|m| {
                        m.is_new(&old_domain, old_port) && m.is_old(domain, port)
                    }) {
                        // A late report from the server users are moving away from.
                        ignoring = true;
                    } else if policy.proxy_mode
                        && policy.is_self(domain, port)
                        && (policy.is_inner)(&host_key(&old_domain, old_port))
                    {
                        // Synchronized through this proxy; the inner server knows better.
                        ignoring = true;
                    } else {
                        outcome.duplicate = Some(Duplicate::Remote {
                            domain: old_domain,
                            port: old_port,
                        });
                        outcome.changed = true;
                    }
                }
                _ => outcome.changed = r.status != status,
            }
            if !ignoring {
                r.owner = Some((domain.to_string(), port));
                r.status = status;
            }
        } else if r
            .owner
            .as_ref()
            .is_some_and(|(d, p)| d == domain && *p == port)
        {
            r.owner = None;
            r.status = Status::Disconnected;
            outcome.changed = true;
        }

        if !outcome.changed {
            return outcome;
        }

        if r.callbacks.is_some() {
            if now.abs_diff(previous_update) > 2 * policy.cache_ttl_ms {
                r.callbacks = None;
            } else if let Some(callbacks) = &r.callbacks {
                let source = (!domain.is_empty() && port > 0).then(|| host_key(domain, port));
                let from_inner = source.as_deref().is_some_and(|h| (policy.is_inner)(h));
                let record = r.to_result(uid);
                for host in callbacks.hosts() {
                    if source.as_deref() == Some(host) {
                        continue;
                    }
                    let mut result = record.clone();
                    if policy.proxy_mode && !from_inner {
                        result.domain = Some(policy.local_domain.to_string());
                        result.port = policy.local_port;
                    }
                    outcome.fanout.push((host.to_string(), result));
                }
            }
        }
        outcome
    }

    /// Register `caller_host` for change notifications and return the current
    /// record, creating a disconnected placeholder when the user is unknown.
    pub fn query_user(&self, uid: Uid, caller_host: &str, now: i64) -> UserResult {
        let mut shard = self.statuses[shard_of(uid)]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let r = shard.entry(uid).or_insert_with(|| UserRecord {
            owner: None,
            status: Status::Disconnected,
            last_updated: now,
            callbacks: None,
        });
        r.last_updated = now;
        r.callbacks
            .get_or_insert_with(|| CallbackHosts::new(self.callback_size))
            .add(caller_host);
        r.to_result(uid)
    }

    pub fn get_user(&self, uid: Uid) -> Option<UserResult> {
        let shard = self.statuses[shard_of(uid)]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        shard.get(&uid).map(|r| r.to_result(uid))
    }

    #[cfg(test)]
    pub(crate) fn callback_hosts(&self, uid: Uid) -> Vec<String> {
        let shard = self.statuses[shard_of(uid)]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        shard
            .get(&uid)
            .and_then(|r| r.callbacks.as_ref())
            .map(|c| c.hosts().map(String::from).collect())
            .unwrap_or_default()
    }

    /// Remove every user of one shard owned by `domain:port`. Returns the removed ids.
    pub fn remove_owned_by(&self, slot: usize, domain: &str, port: u16) -> Vec<Uid> {
        let mut shard = self.statuses[slot]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut removed = Vec::new();
        shard.retain(|uid, r| {
            let owned = r
                .owner
                .as_ref()
                .is_some_and(|(d, p)| d == domain && *p == port);
            if owned {
                removed.push(*uid);
            }
            !owned
        });
        removed
    }

    /// Connected users of one shard with their owners.
    pub fn online_in_slot(&self, slot: usize) -> Vec<(Uid, String, u16)> {
        let shard = self.statuses[slot]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        shard
            .iter()
            .filter(|(_, r)| r.status == Status::Connected)
            .filter_map(|(uid, r)| r.owner.as_ref().map(|(d, p)| (*uid, d.clone(), *p)))
            .collect()
    }

    pub fn directory_len(&self) -> usize {
        self.statuses
            .iter()
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    // -----------------------------------------------------------------------
    // Service side cache
    // -----------------------------------------------------------------------

    /// Cached record if it is local or younger than `ttl_ms`.
    pub fn cache_lookup(&self, uid: Uid, ttl_ms: u64, now: i64) -> Option<UserResult> {
        let shard = self.cache[shard_of(uid)]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        shard
            .get(&uid)
            .filter(|r| is_fresh(r, ttl_ms, now))
            .cloned()
    }

    pub fn cache_get(&self, uid: Uid) -> Option<UserResult> {
        let shard = self.cache[shard_of(uid)]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        shard.get(&uid).cloned()
    }

    /// Local login or logout on this service node.
    pub fn mark_local(&self, uid: Uid, online: bool, domain: &str, port: u16) {
        let mut shard = self.cache[shard_of(uid)]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if online {
            shard.insert(
                uid,
                UserResult {
                    uid,
                    domain: Some(domain.to_string()),
                    port,
                    last_updated: LOCAL_SENTINEL,
                    status: Status::Connected,
                },
            );
        } else {
            shard.remove(&uid);
        }
    }

    /// Store a directory answer. A local session keeps its never-expiring
    /// mark when the directory confirms it.
    pub fn cache_accept(&self, mut result: UserResult, local_domain: &str, local_port: u16) {
        let mut shard = self.cache[shard_of(result.uid)]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = shard.get(&result.uid) {
            if existing.last_updated == LOCAL_SENTINEL
                && result.port == local_port
                && result.domain.as_deref() == Some(local_domain)
            {
                result.last_updated = LOCAL_SENTINEL;
            }
        }
        shard.insert(result.uid, result);
    }

    /// Record that `uid` was seen sending from `domain:port`. Returns true when
    /// the entry was missing, disconnected or stale and now points there.
    pub fn cache_observe(&self, uid: Uid, domain: &str, port: u16, ttl_ms: u64, now: i64) -> bool {
        let mut shard = self.cache[shard_of(uid)]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match shard.get_mut(&uid) {
            Some(r) if r.status == Status::Connected && is_fresh(r, ttl_ms, now) => {
                if r.last_updated != LOCAL_SENTINEL {
                    r.last_updated = now;
                }
                false
            }
            _ => {
                shard.insert(
                    uid,
                    UserResult {
                        uid,
                        domain: Some(domain.to_string()),
                        port,
                        last_updated: now,
                        status: Status::Connected,
                    },
                );
                true
            }
        }
    }

    // -----------------------------------------------------------------------
    // Pending events
    // -----------------------------------------------------------------------

    pub fn buffer_event(&self, event: Event) {
        let mut shard = self.pending[shard_of(event.receiver)]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        shard.entry(event.receiver).or_default().push(event);
    }

    /// Drain buffered events for `uid` in arrival order.
    pub fn take_pending(&self, uid: Uid) -> Vec<Event> {
        let mut shard = self.pending[shard_of(uid)]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        shard.remove(&uid).unwrap_or_default()
    }

    pub fn pending_len(&self, uid: Uid) -> usize {
        let shard = self.pending[shard_of(uid)]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        shard.get(&uid).map_or(0, Vec::len)
    }
}

fn is_fresh(r: &UserResult, ttl_ms: u64, now: i64) -> bool {
    r.last_updated == LOCAL_SENTINEL || now.abs_diff(r.last_updated) < ttl_ms
}
