//! Bulk slot synchronization between directories, and the offline bitmaps
//! pushed to directory peers when a service server is lost.
//!
//! A slot is encoded as a bitmap where bit `j` of byte `i` stands for user
//! `(((i << 3) + j) << 7) + slot`. Bitmaps are gzip compressed on the wire.
//! Snapshots carry a deduplicated server list and, per set bit in ascending
//! order, an index into it.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{debug, info, trace, warn};

use super::error::{ClusterError, Result};
use super::pipe::Role;
use super::router;
use super::rpc;
use super::state::{ClusterMetrics, ClusterState};
use super::wire::{
    Message, RETURN_OK, RETURN_SLOT_OVERFLOW, Request, Response, ServerLost, ServerStatus, SlotSnapshot,
};
use super::{SLOTS, Status, Uid, epoch_ms, host_key};

/// Attempts per slot request before the slot is asked for again.
const SLOT_RETRIES: u32 = 3;
const SLOT_RETRY_DELAY: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Bitmaps
// ---------------------------------------------------------------------------

/// Set one bit per user of `slot`, trimmed to the highest user present.
///
/// The bitmap is sized for `max_users`; a user beyond that is an error rather
/// than a silently dropped bit.
pub fn build_bitmap(slot: usize, uids: &[Uid], max_users: u32) -> Result<Vec<u8>> {
    let capacity = (max_users as usize >> 10) + 1;
    let mut bits = vec![0u8; capacity];
    let mut used = 1;
    for &uid in uids {
        let overflow = || ClusterError::BitmapOverflow { uid, max_users };
        let location = usize::try_from(i64::from(uid) - slot as i64)
            .map_err(|_| overflow())?
            >> 7;
        let index = location >> 3;
        if index >= capacity {
            return Err(overflow());
        }
        bits[index] |= 1u8 << (location & 0x7);
        used = used.max(index + 1);
    }
    bits.truncate(used);
    Ok(bits)
}

/// Users whose bits are set, ascending.
pub fn bitmap_uids(slot: usize, bits: &[u8]) -> Vec<Uid> {
    let mut uids = Vec::new();
    for (i, byte) in bits.iter().enumerate() {
        if *byte == 0 {
            continue;
        }
        for j in 0..8 {
            if byte & (1u8 << j) == 0 {
                continue;
            }
            let uid = ((((i as i64) << 3) + j) << 7) + slot as i64;
            match Uid::try_from(uid) {
                Ok(uid) => uids.push(uid),
                Err(_) => return uids,
            }
        }
    }
    uids
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4 + 16), Compression::default());
    encoder.write_all(data).map_err(ClusterError::Compression)?;
    encoder.finish().map_err(ClusterError::Compression)
}

/// Inflate at most `limit` bytes. Larger payloads are rejected.
pub fn gunzip(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(ClusterError::Compression)?;
    if out.len() > limit {
        return Err(ClusterError::Compression(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bitmap inflates past {limit} bytes"),
        )));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

/// Online users of one slot with their owning servers.
///
/// In master mode only users on servers this directory can vouch for are
/// included. A proxy reports every user as its own.
pub fn snapshot_slot(state: &ClusterState, slot: u8, master_mode: bool) -> Result<SlotSnapshot> {
    let config = &state.config;
    let own_host = config.self_host();
    let services = super::topology::all_service_servers(state, &own_host, !master_mode);
    let proxy = state.is_primary_proxy_mode();
    let node_id = state.node_id();

    let mut server_list: Vec<String> = Vec::new();
    let mut server_index: AHashMap<String, u32> = AHashMap::new();
    let mut owners: Vec<(Uid, u32)> = Vec::new();
    for (uid, domain, port) in state.store.online_in_slot(slot as usize) {
        let mut host = host_key(&domain, port);
        if master_mode && !services.contains_key(&host) {
            let on_gateway = proxy && node_id.as_deref() == Some(host.as_str());
            if !on_gateway {
                continue;
            }
        }
        if proxy {
            host = own_host.clone();
        }
        let next = server_list.len() as u32;
        let index = *server_index.entry(host.clone()).or_insert_with(|| {
            server_list.push(host);
            next
        });
        owners.push((uid, index));
    }
    let time = epoch_ms();
    owners.sort_unstable_by_key(|(uid, _)| *uid);

    let uids: Vec<Uid> = owners.iter().map(|(uid, _)| *uid).collect();
    let bits = build_bitmap(slot as usize, &uids, config.max_users)?;
    let servers = server_list
        .iter()
        .map(|host| {
            let status = services.get(host).cloned();
            if status.is_none() {
                debug!(%host, slot, "server is down, users sent without owner");
            }
            status
        })
        .collect();
    Ok(SlotSnapshot {
        return_code: RETURN_OK,
        online_bits: Some(gzip(&bits)?),
        server_indexes: Some(owners.into_iter().map(|(_, index)| index).collect()),
        servers: Some(servers),
        time,
    })
}

// ---------------------------------------------------------------------------
// Requester
// ---------------------------------------------------------------------------

/// Mark every user in a snapshot connected on its server. Users whose server
/// is missing are skipped. Returns how many were applied.
pub(crate) fn apply_snapshot(
    state: &Arc<ClusterState>,
    slot: u8,
    online_bits: &[u8],
    server_indexes: &[u32],
    servers: &[Option<ServerStatus>],
) -> Result<usize> {
    let bits = gunzip(online_bits, state.config.slot_bitmap_bytes())?;
    let mut applied = 0;
    for (n, uid) in bitmap_uids(slot as usize, &bits).into_iter().enumerate() {
        let server = server_indexes
            .get(n)
            .and_then(|i| servers.get(*i as usize))
            .and_then(Option::as_ref);
        if let Some(server) = server {
            router::apply_user_update(state, uid, Status::Connected, &server.domain, server.port);
            applied += 1;
        }
    }
    Ok(applied)
}

enum SlotOutcome {
    Applied(usize),
    /// The snapshot could not be built or decoded. Not requested again.
    Unusable(ClusterError),
    /// The request failed or was refused. The slot is requested again.
    Failed(ClusterError),
}

async fn synchronize_slot(state: &Arc<ClusterState>, endpoint: &str, slot: u8, master_mode: bool) -> SlotOutcome {
    let request = Request::SynchronizeSlot {
        api_secret: state.config.api_secret.clone(),
        slot,
        master_mode,
    };
    let snapshot = match rpc::call_with_retries(state, endpoint, request, SLOT_RETRIES).await {
        Ok(Response::SlotSnapshot(snapshot)) => snapshot,
        Ok(_) => {
            return SlotOutcome::Failed(ClusterError::UnexpectedResponse {
                endpoint: endpoint.to_string(),
            });
        }
        Err(e) => return SlotOutcome::Failed(e),
    };
    if snapshot.return_code == RETURN_SLOT_OVERFLOW {
        return SlotOutcome::Unusable(ClusterError::Rejected(snapshot.return_code));
    }
    if snapshot.return_code != RETURN_OK {
        return SlotOutcome::Failed(ClusterError::Rejected(snapshot.return_code));
    }
    let SlotSnapshot {
        online_bits: Some(bits),
        server_indexes: Some(indexes),
        servers: Some(servers),
        ..
    } = snapshot
    else {
        return SlotOutcome::Failed(ClusterError::UnexpectedResponse {
            endpoint: endpoint.to_string(),
        });
    };
    let worker_state = state.clone();
    let applied = state
        .workers
        .call(move || apply_snapshot(&worker_state, slot, &bits, &indexes, &servers))
        .await;
    match applied {
        Some(Ok(count)) => SlotOutcome::Applied(count),
        Some(Err(e)) => SlotOutcome::Unusable(e),
        None => SlotOutcome::Failed(ClusterError::Cancelled),
    }
}

/// Pull every slot from the directory at `domain:port`, in order. A failed
/// slot is requested again for as long as the directory link exists; a slot
/// the source cannot encode is skipped.
pub(crate) async fn synchronize_slots(state: Arc<ClusterState>, domain: String, port: u16, master_mode: bool) {
    let host = host_key(&domain, port);
    let endpoint = format!("http://{host}");
    let started = Instant::now();
    info!(%host, master_mode, "synchronizing users");

    let mut slot = 0;
    while slot < SLOTS {
        if state.cancel.is_cancelled() {
            return;
        }
        match synchronize_slot(&state, &endpoint, slot as u8, master_mode).await {
            SlotOutcome::Applied(users) => {
                trace!(%host, slot, users, "slot synchronized");
            }
            SlotOutcome::Unusable(e) => {
                warn!(%host, slot, error = %e, "slot snapshot unusable, skipping");
            }
            SlotOutcome::Failed(e) => {
                if state.topology.link(Role::DirectoryPeer, &host).is_none() {
                    info!(%host, slot, "directory link gone, synchronization abandoned");
                    return;
                }
                debug!(%host, slot, error = %e, "slot request failed, asking again");
                tokio::select! {
                    () = tokio::time::sleep(SLOT_RETRY_DELAY) => {}
                    () = state.cancel.cancelled() => return,
                }
                continue;
            }
        }
        ClusterMetrics::incr(&state.metrics.slots_synchronized);
        slot += 1;
    }
    state.mark_synced();
    info!(
        %host,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "all slots synchronized"
    );
}

// ---------------------------------------------------------------------------
// Lost service servers
// ---------------------------------------------------------------------------

/// Forget every user on a lost service server and tell directory peers which
/// users went offline, one slot at a time. Runs on the worker pool.
pub(crate) fn drop_service_server(state: &ClusterState, domain: &str, port: u16) {
    let config = &state.config;
    let lost_host = host_key(domain, port);
    let (reported_domain, reported_port) = if state.is_primary_proxy_mode() {
        (config.server_ip.as_str(), config.port)
    } else {
        (domain, port)
    };
    let mut total = 0;
    for slot in 0..SLOTS {
        let removed = state.store.remove_owned_by(slot, domain, port);
        if removed.is_empty() {
            continue;
        }
        total += removed.len();
        if !config.primary_synchronizing {
            continue;
        }
        let peers: Vec<_> = state
            .topology
            .outlets_of(Role::DirectoryPeer)
            .into_iter()
            .filter(|o| o.host != lost_host)
            .collect();
        if peers.is_empty() {
            continue;
        }
        let offline_bits = match build_bitmap(slot, &removed, config.max_users).and_then(|b| gzip(&b)) {
            Ok(bits) => bits,
            Err(e) => {
                warn!(host = %lost_host, slot, error = %e, "offline bitmap not sent");
                continue;
            }
        };
        let lost = Message::ServerLost(ServerLost {
            domain: reported_domain.to_string(),
            port: reported_port,
            source_domain: config.server_ip.clone(),
            source_port: config.port,
            slot: slot as u8,
            offline_bits,
            time: epoch_ms(),
        });
        for peer in peers {
            peer.push(lost.clone());
        }
    }
    if total > 0 {
        info!(host = %lost_host, users = total, "users of lost server removed");
    }
}

/// Mark every user in a peer's offline bitmap disconnected from the lost
/// server. Returns whether any record changed.
pub(crate) fn apply_server_lost(state: &Arc<ClusterState>, lost: &ServerLost) -> Result<bool> {
    let bits = gunzip(&lost.offline_bits, state.config.slot_bitmap_bytes())?;
    let mut changed = false;
    for uid in bitmap_uids(lost.slot as usize, &bits) {
        changed |= router::apply_user_update(state, uid, Status::Disconnected, &lost.domain, lost.port);
    }
    Ok(changed)
}

/// A directory peer at `from` reported a lost server. Apply it and pass it on
/// to the other peers, never back to where it came from.
pub(crate) fn receive_server_lost(state: &Arc<ClusterState>, from: &str, lost: ServerLost) {
    if lost.offline_bits.is_empty() {
        return;
    }
    if usize::from(lost.slot) >= SLOTS {
        warn!(from, slot = lost.slot, "server lost bitmap for a slot out of range");
        return;
    }
    match apply_server_lost(state, &lost) {
        Ok(true) if state.config.primary_synchronizing => {
            let source = host_key(&lost.source_domain, lost.source_port);
            state.topology.broadcast(
                Role::DirectoryPeer,
                &Message::ServerLost(lost),
                |o| o.host == from || o.host == source,
            );
        }
        Ok(_) => {}
        Err(e) => warn!(from, slot = lost.slot, error = %e, "server lost bitmap unusable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::cluster::config::ClusterConfig;
    use crate::cluster::pipe::Outlet;
    use crate::cluster::testing::{TestNode, directory_config, test_state, test_state_with};
    use crate::cluster::topology;
    use crate::cluster::wire::RETURN_ERROR;

    fn owner(state: &ClusterState, uid: Uid) -> Option<(String, u16)> {
        state
            .store
            .get_user(uid)
            .filter(|r| r.status == Status::Connected)
            .and_then(|r| r.domain.map(|d| (d, r.port)))
    }

    fn attach(state: &ClusterState, role: Role, domain: &str, port: u16) -> Arc<Outlet> {
        let outlet = Arc::new(Outlet::new(role, domain, port));
        outlet.attach();
        state.topology.install_outlet(outlet.clone());
        outlet
    }

    fn lost_messages(outlet: &Outlet) -> Vec<ServerLost> {
        outlet
            .take_all()
            .into_iter()
            .filter_map(|m| match m {
                Message::ServerLost(sl) => Some(sl),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_bitmap_positions_decode_to_slot_uids() {
        let uids = [5, (3 << 7) + 5, (10 << 7) + 5];
        let bits = build_bitmap(5, &uids, 1 << 20).unwrap();
        assert_eq!(bits, vec![0b0000_1001, 0b0000_0100]);
        assert_eq!(bitmap_uids(5, &bits), uids.to_vec());
    }

    #[test]
    fn test_bitmap_sparse_and_empty_slots() {
        assert_eq!(build_bitmap(7, &[], 1 << 20).unwrap(), vec![0]);
        assert!(bitmap_uids(7, &[0]).is_empty());

        let uids: Vec<Uid> = (0..1500).map(|k| (k * 97 << 7) + 42).collect();
        let bits = build_bitmap(42, &uids, 20_000_000).unwrap();
        assert_eq!(bitmap_uids(42, &bits), uids);
    }

    #[test]
    fn test_bitmap_overflow_is_an_error() {
        let err = build_bitmap(0, &[1 << 20], 1024).unwrap_err();
        assert!(matches!(err, ClusterError::BitmapOverflow { uid, .. } if uid == 1 << 20));
        assert!(build_bitmap(3, &[-125], 1024).is_err());
    }

    #[test]
    fn test_gunzip_limit() {
        let packed = gzip(&[0xFF; 64]).unwrap();
        assert_eq!(gunzip(&packed, 64).unwrap().len(), 64);
        assert!(matches!(gunzip(&packed, 63), Err(ClusterError::Compression(_))));
        assert!(gunzip(b"not gzip", 64).is_err());
    }

    #[test]
    fn test_snapshot_round_trip_keeps_owners() {
        let source = test_state(directory_config(), None);
        attach(&source, Role::Down, "s1", 80);
        attach(&source, Role::Down, "s2", 8080);
        let users = [(5, "s1", 80), ((3 << 7) + 5, "s2", 8080), ((10 << 7) + 5, "s1", 80)];
        for (uid, domain, port) in users {
            router::apply_user_update(&source, uid, Status::Connected, domain, port);
        }
        router::apply_user_update(&source, (4 << 7) + 5, Status::Disconnected, "s1", 80);

        let snapshot = snapshot_slot(&source, 5, false).unwrap();
        assert_eq!(snapshot.return_code, RETURN_OK);
        let indexes = snapshot.server_indexes.clone().unwrap();
        let servers = snapshot.servers.clone().unwrap();
        assert_eq!(indexes.len(), 3);
        assert_eq!(servers.len(), 2);
        assert_eq!(indexes[0], indexes[2]);
        assert_ne!(indexes[0], indexes[1]);

        let replica = test_state(directory_config(), None);
        let applied = apply_snapshot(
            &replica,
            5,
            snapshot.online_bits.as_deref().unwrap(),
            &indexes,
            &servers,
        )
        .unwrap();
        assert_eq!(applied, 3);
        for (uid, domain, port) in users {
            assert_eq!(owner(&replica, uid), Some((domain.to_string(), port)));
        }
        assert_eq!(owner(&replica, (4 << 7) + 5), None);
    }

    #[test]
    fn test_master_mode_snapshot_skips_unknown_servers() {
        let source = test_state(directory_config(), None);
        attach(&source, Role::Down, "s1", 80);
        router::apply_user_update(&source, 3, Status::Connected, "s1", 80);
        router::apply_user_update(&source, 131, Status::Connected, "elsewhere", 80);

        let snapshot = snapshot_slot(&source, 3, true).unwrap();
        assert_eq!(snapshot.server_indexes.as_deref(), Some(&[0][..]));
        let bits = gunzip(snapshot.online_bits.as_deref().unwrap(), 1 << 20).unwrap();
        assert_eq!(bitmap_uids(3, &bits), vec![3]);

        let snapshot = snapshot_slot(&source, 3, false).unwrap();
        assert_eq!(snapshot.server_indexes.unwrap().len(), 2);
        let servers = snapshot.servers.unwrap();
        assert!(servers.iter().any(Option::is_none));
    }

    #[test]
    fn test_proxy_snapshot_reports_itself() {
        let mut config = directory_config();
        config.primary_proxy_server = true;
        let source = test_state(config, None);
        attach(&source, Role::Down, "s1", 80);
        router::apply_user_update(&source, 9, Status::Connected, "s1", 80);

        let snapshot = snapshot_slot(&source, 9, false).unwrap();
        let servers = snapshot.servers.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].as_ref().map(|s| s.domain.as_str()), Some("dir"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_synchronization_pulls_every_slot() {
        let source = test_state(directory_config(), None);
        attach(&source, Role::Down, "s1", 80);
        let uids = [5, (3 << 7) + 5, (10 << 7) + 5, 127, 1000];
        for uid in uids {
            router::apply_user_update(&source, uid, Status::Connected, "s1", 80);
        }

        let mut config = directory_config();
        config.server_ip = "dir2".into();
        let (replica, transport) = test_state_with(config, None);
        let responder_source = source.clone();
        transport.respond_with(move |_, request| match request {
            Request::SynchronizeSlot {
                slot, master_mode, ..
            } => Ok(Response::SlotSnapshot(snapshot_slot(
                &responder_source,
                *slot,
                *master_mode,
            )?)),
            _ => Ok(Response::Ack),
        });

        let mut synced = replica.subscribe_synced();
        tokio::spawn(synchronize_slots(replica.clone(), "dir".into(), 80, false));
        tokio::time::timeout(Duration::from_secs(10), synced.changed())
            .await
            .unwrap()
            .unwrap();

        let requested: Vec<u8> = transport
            .calls()
            .into_iter()
            .filter_map(|(_, r)| match r {
                Request::SynchronizeSlot { slot, .. } => Some(slot),
                _ => None,
            })
            .collect();
        assert_eq!(requested, (0..SLOTS as u8).collect::<Vec<_>>());
        for uid in uids {
            assert_eq!(owner(&replica, uid), Some(("s1".to_string(), 80)));
        }
        assert_eq!(
            replica.metrics().slots_synchronized.load(std::sync::atomic::Ordering::Relaxed),
            SLOTS as u64
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_slot_is_requested_again() {
        let (state, transport) = test_state_with(directory_config(), None);
        topology::create_directory_link(&state, "dir", "dir2", 80, false, false);
        let failures = Arc::new(Mutex::new(0));
        let seen = failures.clone();
        transport.respond_with(move |_, request| match request {
            Request::SynchronizeSlot { slot: 2, .. } => {
                let mut n = seen.lock().unwrap();
                *n += 1;
                if *n <= 4 {
                    return Ok(Response::ReturnCode(RETURN_ERROR));
                }
                Ok(Response::SlotSnapshot(SlotSnapshot {
                    return_code: RETURN_OK,
                    online_bits: Some(gzip(&[0]).unwrap()),
                    server_indexes: Some(Vec::new()),
                    servers: Some(Vec::new()),
                    time: 0,
                }))
            }
            Request::SynchronizeSlot { .. } => Ok(Response::SlotSnapshot(SlotSnapshot {
                return_code: RETURN_OK,
                online_bits: Some(gzip(&[0]).unwrap()),
                server_indexes: Some(Vec::new()),
                servers: Some(Vec::new()),
                time: 0,
            })),
            _ => Ok(Response::Ack),
        });

        let mut synced = state.subscribe_synced();
        tokio::spawn(synchronize_slots(state.clone(), "dir2".into(), 80, false));
        tokio::time::timeout(Duration::from_secs(10), synced.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*failures.lock().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_synchronization_stops_without_directory_link() {
        let (state, transport) = test_state_with(directory_config(), None);
        transport.respond_with(|endpoint, _| {
            Err(ClusterError::Transport {
                endpoint: endpoint.to_string(),
                reason: "refused".into(),
            })
        });
        synchronize_slots(state.clone(), "dir2".into(), 80, false).await;
        assert_eq!(*state.subscribe_synced().borrow(), 0);
        assert_eq!(transport.calls().len(), SLOT_RETRIES as usize + 1);
    }

    #[test]
    fn test_lost_server_users_removed_and_reported() {
        let state = test_state(directory_config(), None);
        let peer = attach(&state, Role::DirectoryPeer, "dir2", 80);
        let lost_side = attach(&state, Role::DirectoryPeer, "s1", 80);
        router::apply_user_update(&state, 1, Status::Connected, "s1", 80);
        router::apply_user_update(&state, 129, Status::Connected, "s1", 80);
        router::apply_user_update(&state, 2, Status::Connected, "s2", 80);

        drop_service_server(&state, "s1", 80);

        assert!(state.store.get_user(1).is_none());
        assert!(state.store.get_user(129).is_none());
        assert_eq!(owner(&state, 2), Some(("s2".to_string(), 80)));
        let reports = lost_messages(&peer);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].slot, 1);
        assert_eq!(reports[0].domain, "s1");
        assert_eq!(reports[0].source_domain, "dir");
        let bits = gunzip(&reports[0].offline_bits, 1 << 20).unwrap();
        assert_eq!(bitmap_uids(1, &bits), vec![1, 129]);
        assert!(lost_messages(&lost_side).is_empty());
    }

    #[test]
    fn test_server_lost_applied_and_relayed() {
        let state = test_state(directory_config(), Some(TestNode::new("n")));
        let from = attach(&state, Role::DirectoryPeer, "dir2", 80);
        let source = attach(&state, Role::DirectoryPeer, "dir3", 80);
        let other = attach(&state, Role::DirectoryPeer, "dir4", 80);
        router::apply_user_update(&state, 1, Status::Connected, "s1", 80);
        router::apply_user_update(&state, 257, Status::Connected, "s9", 80);

        let lost = ServerLost {
            domain: "s1".into(),
            port: 80,
            source_domain: "dir3".into(),
            source_port: 80,
            slot: 1,
            offline_bits: gzip(&build_bitmap(1, &[1, 257], 1 << 20).unwrap()).unwrap(),
            time: 0,
        };
        receive_server_lost(&state, "dir2", lost.clone());

        assert_eq!(owner(&state, 1), None);
        assert_eq!(owner(&state, 257), Some(("s9".to_string(), 80)));
        assert_eq!(lost_messages(&other), vec![lost.clone()]);
        assert!(lost_messages(&from).is_empty());
        assert!(lost_messages(&source).is_empty());

        receive_server_lost(&state, "dir2", lost);
        assert!(lost_messages(&other).is_empty());
    }

    #[test]
    fn test_server_lost_for_bad_slot_ignored() {
        let state = test_state(directory_config(), None);
        let other = attach(&state, Role::DirectoryPeer, "dir4", 80);
        router::apply_user_update(&state, 1, Status::Connected, "s1", 80);
        router::apply_user_update(&state, 129, Status::Connected, "s1", 80);

        // Read against slot 129, bit 0 would name uid 129, a slot 1 user.
        let lost = ServerLost {
            domain: "s1".into(),
            port: 80,
            source_domain: "dir3".into(),
            source_port: 80,
            slot: 129,
            offline_bits: gzip(&[0xFF]).unwrap(),
            time: 0,
        };
        receive_server_lost(&state, "dir2", lost);

        assert_eq!(owner(&state, 1), Some(("s1".to_string(), 80)));
        assert_eq!(owner(&state, 129), Some(("s1".to_string(), 80)));
        assert!(lost_messages(&other).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overflowing_slot_is_skipped() {
        let config = ClusterConfig {
            max_users: 1024,
            ..directory_config()
        };
        let source = test_state(config, None);
        attach(&source, Role::Down, "s1", 80);
        router::apply_user_update(&source, (1 << 20) + 4, Status::Connected, "s1", 80);
        router::apply_user_update(&source, 9, Status::Connected, "s1", 80);

        let mut config = directory_config();
        config.server_ip = "dir2".into();
        let (replica, transport) = test_state_with(config, None);
        topology::create_directory_link(&replica, "dir2", "dir", 80, false, false);
        transport.forward_to(source.clone());

        let mut synced = replica.subscribe_synced();
        tokio::spawn(synchronize_slots(replica.clone(), "dir".into(), 80, false));
        tokio::time::timeout(Duration::from_secs(10), synced.changed())
            .await
            .unwrap()
            .unwrap();

        let requested: Vec<u8> = transport
            .calls()
            .into_iter()
            .filter_map(|(_, r)| match r {
                Request::SynchronizeSlot { slot, .. } => Some(slot),
                _ => None,
            })
            .collect();
        assert_eq!(requested.iter().filter(|s| **s == 4).count(), 1);
        assert_eq!(requested.len(), SLOTS);
        assert_eq!(owner(&replica, 9), Some(("s1".to_string(), 80)));
        assert_eq!(owner(&replica, (1 << 20) + 4), None);
        replica.cancel.cancel();
    }

    #[test]
    fn test_snapshot_overflow_surfaces_error() {
        let config = ClusterConfig {
            max_users: 1024,
            ..directory_config()
        };
        let state = test_state(config, None);
        attach(&state, Role::Down, "s1", 80);
        router::apply_user_update(&state, (1 << 20) + 4, Status::Connected, "s1", 80);
        assert!(matches!(
            snapshot_slot(&state, 4, false),
            Err(ClusterError::BitmapOverflow { .. })
        ));
    }
}
