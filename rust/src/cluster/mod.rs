//! Presence routing and cluster replication.
//!
//! Directory nodes own the authoritative user to server assignment. Service
//! nodes hold user sessions, cache directory answers and relay events to each
//! other. Four pipe roles connect them; see [`roles`] and [`topology`].

pub mod auth;
pub mod backoff;
pub mod config;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod monitor;
pub mod node;
pub mod pipe;
pub mod roles;
pub mod router;
pub mod rpc;
pub mod state;
pub mod store;
pub mod sync;
pub mod topology;
pub mod transport;
pub mod upstream;
pub mod wire;
pub mod workers;

#[cfg(test)]
pub(crate) mod testing;

use std::time::{SystemTime, UNIX_EPOCH};

/// User identifier. Non-positive ids are never routed.
pub type Uid = i32;

/// Number of presence shards.
pub const SLOTS: usize = 128;

/// Shard mask applied to a user id.
pub const SLOT_MASK: Uid = 0x7F;

/// Shard a user id belongs to. Used identically by the store, the router and
/// bulk synchronization.
#[inline]
pub fn shard_of(uid: Uid) -> usize {
    (uid & SLOT_MASK) as usize
}

/// Wall-clock time in milliseconds since UNIX epoch.
pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Registry key for a server: the bare domain on port 80, `domain:port` otherwise.
pub fn host_key(domain: &str, port: u16) -> String {
    if port == 80 {
        domain.to_string()
    } else {
        format!("{domain}:{port}")
    }
}

/// Connection status shared by user records and server records.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Connected = 1,
    Disconnected = 2,
}

impl Status {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Connected),
            2 => Some(Self::Disconnected),
            _ => None,
        }
    }

    pub fn from_online(online: bool) -> Self {
        if online {
            Self::Connected
        } else {
            Self::Disconnected
        }
    }
}
