//! Cluster messages and their binary framing.
//!
//! Every frame is `[u8 kind][u8 flags][u16 LE reserved][u32 LE body_len][body]`,
//! carried on the socket behind a 4-byte big-endian length prefix. Integers in
//! the body are little-endian, strings and byte arrays are `u32 LE` length
//! prefixed, collections are `u32 LE` count prefixed and capped at
//! [`MAX_COLLECTION_ELEMENTS`].

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::WireError;
use super::pipe::Role;
use super::{SLOTS, Status, Uid};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
pub const MAX_COLLECTION_ELEMENTS: usize = 16_777_216;
pub(crate) const HEADER_LEN: usize = 8;
pub(crate) const MAX_BATCH_BYTES: usize = 65_536;

pub const RETURN_OK: i32 = 1;
pub const RETURN_ERROR: i32 = -1;
pub const RETURN_UNAUTHORIZED: i32 = -2;
/// A slot snapshot that cannot be built at all; the requester moves on.
pub const RETURN_SLOT_OVERFLOW: i32 = -3;

// ---------------------------------------------------------------------------
// Frame kinds
// ---------------------------------------------------------------------------

/// Kinds of messages pushed through a pipe. Role handler tables are indexed by these.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    HeartBeat = 0x01,
    ServerStatus = 0x02,
    ServerLost = 0x03,
    ServerStopping = 0x04,
    UserStatus = 0x05,
    UserQuery = 0x06,
    UserResult = 0x07,
    UserDuplicated = 0x08,
    Event = 0x09,
}

impl MessageKind {
    pub const COUNT: usize = 9;

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::HeartBeat),
            0x02 => Some(Self::ServerStatus),
            0x03 => Some(Self::ServerLost),
            0x04 => Some(Self::ServerStopping),
            0x05 => Some(Self::UserStatus),
            0x06 => Some(Self::UserQuery),
            0x07 => Some(Self::UserResult),
            0x08 => Some(Self::UserDuplicated),
            0x09 => Some(Self::Event),
            _ => None,
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize - 1
    }
}

const KIND_OPEN: u8 = 0x20;
const KIND_OPENED: u8 = 0x21;
const KIND_CLOSE_PIPE: u8 = 0x30;
const KIND_SEND_EVENT: u8 = 0x31;
const KIND_SYNCHRONIZE_SLOT: u8 = 0x32;
const KIND_GATEWAY_SEND: u8 = 0x33;
const KIND_QUERY_USER_STATUS: u8 = 0x34;
const KIND_ACK: u8 = 0x40;
const KIND_RETURN_CODE: u8 = 0x41;
const KIND_SLOT_SNAPSHOT: u8 = 0x42;
const KIND_GATEWAY_RESULTS: u8 = 0x43;
const KIND_USER_CLUSTER_STATUS: u8 = 0x44;

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub domain: String,
    pub port: u16,
    pub status: Status,
}

/// A directory answer about one user. `last_updated == LOCAL_SENTINEL` marks
/// a record created by the local node that never expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserResult {
    pub uid: Uid,
    pub domain: Option<String>,
    pub port: u16,
    pub last_updated: i64,
    pub status: Status,
}

/// Offline bitmap for one shard, pushed to directory peers when a service
/// server disappears. `offline_bits` is gzip compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLost {
    pub domain: String,
    pub port: u16,
    pub source_domain: String,
    pub source_port: u16,
    pub slot: u8,
    pub offline_bits: Vec<u8>,
    pub time: u64,
}

pub type UndeliveredCallback = Arc<dyn Fn() + Send + Sync>;

/// Opaque application event. The non-delivery callback stays on the node
/// that created the event and is never serialized.
#[derive(Clone)]
pub struct Event {
    pub sender: Uid,
    pub receiver: Uid,
    pub payload: Bytes,
    pub on_undelivered: Option<UndeliveredCallback>,
}

impl Event {
    pub fn new(sender: Uid, receiver: Uid, payload: impl Into<Bytes>) -> Self {
        Self {
            sender,
            receiver,
            payload: payload.into(),
            on_undelivered: None,
        }
    }

    pub fn with_undelivered(mut self, callback: UndeliveredCallback) -> Self {
        self.on_undelivered = Some(callback);
        self
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .field("payload_len", &self.payload.len())
            .field("on_undelivered", &self.on_undelivered.is_some())
            .finish()
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.sender == other.sender
            && self.receiver == other.receiver
            && self.payload == other.payload
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    HeartBeat { time: u64 },
    ServerStatus(ServerStatus),
    ServerLost(ServerLost),
    ServerStopping,
    UserStatus { uid: Uid, status: Status, time: u64 },
    UserQuery { uid: Uid },
    UserResult(UserResult),
    UserDuplicated { uid: Uid, domain: String, port: u16, time: u64 },
    Event(Event),
    /// A kind this build does not know. Dropped by every handler table.
    Unknown { kind: u8 },
}

impl Message {
    pub fn kind(&self) -> Option<MessageKind> {
        Some(match self {
            Self::HeartBeat { .. } => MessageKind::HeartBeat,
            Self::ServerStatus(_) => MessageKind::ServerStatus,
            Self::ServerLost(_) => MessageKind::ServerLost,
            Self::ServerStopping => MessageKind::ServerStopping,
            Self::UserStatus { .. } => MessageKind::UserStatus,
            Self::UserQuery { .. } => MessageKind::UserQuery,
            Self::UserResult(_) => MessageKind::UserResult,
            Self::UserDuplicated { .. } => MessageKind::UserDuplicated,
            Self::Event(_) => MessageKind::Event,
            Self::Unknown { .. } => return None,
        })
    }

    /// Housekeeping messages are not carried over to a superseding pipe.
    pub fn survives_handover(&self) -> bool {
        !matches!(self, Self::HeartBeat { .. } | Self::ServerStopping)
    }
}

/// First frame a dialing side sends on a pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeSetup {
    pub role: Role,
    pub api_secret: Option<String>,
    /// Dialer's own domain. The accepting side falls back to the peer address.
    pub domain: Option<String>,
    pub port: u16,
    /// Directory-peer only: which of the acceptor's addresses the dialer used.
    pub target: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupReply {
    pub pipe_key: String,
    pub online_servers: Vec<ServerStatus>,
    pub online_users: Vec<Uid>,
    pub time: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ClosePipe {
        api_secret: Option<String>,
        pipe_key: String,
    },
    SendEvent {
        api_secret: Option<String>,
        server_ip: Option<String>,
        server_port: u16,
        events: Vec<Event>,
    },
    SynchronizeSlot {
        api_secret: Option<String>,
        slot: u8,
        master_mode: bool,
    },
    GatewaySendEvents {
        api_secret: Option<String>,
        events: Vec<Event>,
    },
    QueryUserStatus {
        api_secret: Option<String>,
        uid: Uid,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub return_code: i32,
    /// Gzip compressed online bitmap.
    pub online_bits: Option<Vec<u8>>,
    /// One entry per online bit, in ascending bit order.
    pub server_indexes: Option<Vec<u32>>,
    /// `None` entries are servers that went down while the snapshot was built.
    pub servers: Option<Vec<Option<ServerStatus>>>,
    pub time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack,
    ReturnCode(i32),
    SlotSnapshot(SlotSnapshot),
    GatewayResults(Option<Vec<i32>>),
    UserClusterStatus {
        return_code: i32,
        status: Option<Status>,
        domain: Option<String>,
        port: u16,
    },
}

/// Everything that crosses the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Pipe(Message),
    Open(PipeSetup),
    Opened(SetupReply),
    Call(Request),
    Reply(Response),
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32_le(b.len() as u32);
    buf.put_slice(b);
}

fn put_server_status(buf: &mut BytesMut, s: &ServerStatus) {
    put_str(buf, &s.domain);
    buf.put_u16_le(s.port);
    buf.put_u8(s.status as u8);
}

fn put_event(buf: &mut BytesMut, e: &Event) {
    buf.put_i32_le(e.sender);
    buf.put_i32_le(e.receiver);
    put_bytes(buf, &e.payload);
}

fn put_events(buf: &mut BytesMut, events: &[Event]) {
    buf.put_u32_le(events.len() as u32);
    for e in events {
        put_event(buf, e);
    }
}

fn put_message(buf: &mut BytesMut, msg: &Message) -> u8 {
    match msg {
        Message::HeartBeat { time } => buf.put_u64_le(*time),
        Message::ServerStatus(s) => put_server_status(buf, s),
        Message::ServerLost(sl) => {
            put_str(buf, &sl.domain);
            buf.put_u16_le(sl.port);
            put_str(buf, &sl.source_domain);
            buf.put_u16_le(sl.source_port);
            buf.put_u8(sl.slot);
            put_bytes(buf, &sl.offline_bits);
            buf.put_u64_le(sl.time);
        }
        Message::ServerStopping => {}
        Message::UserStatus { uid, status, time } => {
            buf.put_i32_le(*uid);
            buf.put_u8(*status as u8);
            buf.put_u64_le(*time);
        }
        Message::UserQuery { uid } => buf.put_i32_le(*uid),
        Message::UserResult(r) => {
            buf.put_i32_le(r.uid);
            put_opt_str(buf, r.domain.as_deref());
            buf.put_u16_le(r.port);
            buf.put_i64_le(r.last_updated);
            buf.put_u8(r.status as u8);
        }
        Message::UserDuplicated {
            uid,
            domain,
            port,
            time,
        } => {
            buf.put_i32_le(*uid);
            put_str(buf, domain);
            buf.put_u16_le(*port);
            buf.put_u64_le(*time);
        }
        Message::Event(e) => put_event(buf, e),
        Message::Unknown { kind } => return *kind,
    }
    msg.kind().map_or(0, |k| k as u8)
}

fn put_request(buf: &mut BytesMut, req: &Request) -> u8 {
    match req {
        Request::ClosePipe {
            api_secret,
            pipe_key,
        } => {
            put_opt_str(buf, api_secret.as_deref());
            put_str(buf, pipe_key);
            KIND_CLOSE_PIPE
        }
        Request::SendEvent {
            api_secret,
            server_ip,
            server_port,
            events,
        } => {
            put_opt_str(buf, api_secret.as_deref());
            put_opt_str(buf, server_ip.as_deref());
            buf.put_u16_le(*server_port);
            put_events(buf, events);
            KIND_SEND_EVENT
        }
        Request::SynchronizeSlot {
            api_secret,
            slot,
            master_mode,
        } => {
            put_opt_str(buf, api_secret.as_deref());
            buf.put_u8(*slot);
            buf.put_u8(u8::from(*master_mode));
            KIND_SYNCHRONIZE_SLOT
        }
        Request::GatewaySendEvents { api_secret, events } => {
            put_opt_str(buf, api_secret.as_deref());
            put_events(buf, events);
            KIND_GATEWAY_SEND
        }
        Request::QueryUserStatus { api_secret, uid } => {
            put_opt_str(buf, api_secret.as_deref());
            buf.put_i32_le(*uid);
            KIND_QUERY_USER_STATUS
        }
    }
}

fn put_response(buf: &mut BytesMut, resp: &Response) -> u8 {
    match resp {
        Response::Ack => KIND_ACK,
        Response::ReturnCode(code) => {
            buf.put_i32_le(*code);
            KIND_RETURN_CODE
        }
        Response::SlotSnapshot(s) => {
            buf.put_i32_le(s.return_code);
            match &s.online_bits {
                Some(bits) => {
                    buf.put_u8(1);
                    put_bytes(buf, bits);
                }
                None => buf.put_u8(0),
            }
            match &s.server_indexes {
                Some(indexes) => {
                    buf.put_u8(1);
                    buf.put_u32_le(indexes.len() as u32);
                    for i in indexes {
                        buf.put_u32_le(*i);
                    }
                }
                None => buf.put_u8(0),
            }
            match &s.servers {
                Some(servers) => {
                    buf.put_u8(1);
                    buf.put_u32_le(servers.len() as u32);
                    for server in servers {
                        match server {
                            Some(ss) => {
                                buf.put_u8(1);
                                put_server_status(buf, ss);
                            }
                            None => buf.put_u8(0),
                        }
                    }
                }
                None => buf.put_u8(0),
            }
            buf.put_u64_le(s.time);
            KIND_SLOT_SNAPSHOT
        }
        Response::GatewayResults(results) => {
            match results {
                Some(results) => {
                    buf.put_u8(1);
                    buf.put_u32_le(results.len() as u32);
                    for r in results {
                        buf.put_i32_le(*r);
                    }
                }
                None => buf.put_u8(0),
            }
            KIND_GATEWAY_RESULTS
        }
        Response::UserClusterStatus {
            return_code,
            status,
            domain,
            port,
        } => {
            buf.put_i32_le(*return_code);
            buf.put_u8(status.map_or(0, |s| s as u8));
            put_opt_str(buf, domain.as_deref());
            buf.put_u16_le(*port);
            KIND_USER_CLUSTER_STATUS
        }
    }
}

/// Encode one frame (header + body) into buf.
pub fn encode_frame(buf: &mut BytesMut, frame: &Frame) {
    let start = buf.len();
    buf.reserve(HEADER_LEN + 64);
    buf.put_u8(0); // kind, patched below
    buf.put_u8(0); // flags
    buf.put_u16_le(0);
    buf.put_u32_le(0); // body_len, patched below
    let kind = match frame {
        Frame::Pipe(msg) => put_message(buf, msg),
        Frame::Open(setup) => {
            buf.put_u8(setup.role as u8);
            put_opt_str(buf, setup.api_secret.as_deref());
            put_opt_str(buf, setup.domain.as_deref());
            buf.put_u16_le(setup.port);
            put_opt_str(buf, setup.target.as_deref());
            KIND_OPEN
        }
        Frame::Opened(reply) => {
            put_str(buf, &reply.pipe_key);
            buf.put_u32_le(reply.online_servers.len() as u32);
            for s in &reply.online_servers {
                put_server_status(buf, s);
            }
            buf.put_u32_le(reply.online_users.len() as u32);
            for uid in &reply.online_users {
                buf.put_i32_le(*uid);
            }
            buf.put_u64_le(reply.time);
            KIND_OPENED
        }
        Frame::Call(req) => put_request(buf, req),
        Frame::Reply(resp) => put_response(buf, resp),
    };
    let body_len = (buf.len() - start - HEADER_LEN) as u32;
    buf[start] = kind;
    buf[start + 4..start + 8].copy_from_slice(&body_len.to_le_bytes());
}

/// Encode a frame behind the 4-byte big-endian socket length prefix.
pub fn write_framed(buf: &mut BytesMut, frame: &Frame) {
    let start = buf.len();
    buf.put_u32(0);
    encode_frame(buf, frame);
    let inner = (buf.len() - start - 4) as u32;
    buf[start..start + 4].copy_from_slice(&inner.to_be_bytes());
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

struct Reader {
    data: Bytes,
}

impl Reader {
    fn need(&self, n: usize) -> Result<(), WireError> {
        if self.data.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                remaining: self.data.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.data.get_u8())
    }

    fn bool(&mut self) -> Result<bool, WireError> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        self.need(2)?;
        Ok(self.data.get_u16_le())
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        Ok(self.data.get_u32_le())
    }

    fn i32(&mut self) -> Result<i32, WireError> {
        self.need(4)?;
        Ok(self.data.get_i32_le())
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        self.need(8)?;
        Ok(self.data.get_u64_le())
    }

    fn i64(&mut self) -> Result<i64, WireError> {
        self.need(8)?;
        Ok(self.data.get_i64_le())
    }

    fn bytes(&mut self) -> Result<Bytes, WireError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        Ok(self.data.split_to(len))
    }

    fn string(&mut self) -> Result<String, WireError> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    fn opt_string(&mut self) -> Result<Option<String>, WireError> {
        if self.bool()? {
            Ok(Some(self.string()?))
        } else {
            Ok(None)
        }
    }

    fn status(&mut self) -> Result<Status, WireError> {
        let v = self.u8()?;
        Status::from_u8(v).ok_or(WireError::InvalidTag {
            field: "status",
            value: v,
        })
    }

    fn slot(&mut self) -> Result<u8, WireError> {
        let v = self.u8()?;
        if usize::from(v) >= SLOTS {
            return Err(WireError::InvalidTag { field: "slot", value: v });
        }
        Ok(v)
    }

    /// Element count, rejected before anything is allocated.
    fn count(&mut self, min_elem_size: usize) -> Result<usize, WireError> {
        let n = self.u32()? as usize;
        if n > MAX_COLLECTION_ELEMENTS {
            return Err(WireError::CollectionTooLarge(n));
        }
        self.need(n.saturating_mul(min_elem_size))?;
        Ok(n)
    }

    fn server_status(&mut self) -> Result<ServerStatus, WireError> {
        Ok(ServerStatus {
            domain: self.string()?,
            port: self.u16()?,
            status: self.status()?,
        })
    }

    fn event(&mut self) -> Result<Event, WireError> {
        Ok(Event {
            sender: self.i32()?,
            receiver: self.i32()?,
            payload: self.bytes()?,
            on_undelivered: None,
        })
    }

    fn events(&mut self) -> Result<Vec<Event>, WireError> {
        let n = self.count(12)?;
        let mut events = Vec::with_capacity(n);
        for _ in 0..n {
            events.push(self.event()?);
        }
        Ok(events)
    }
}

fn decode_message(kind: MessageKind, r: &mut Reader) -> Result<Message, WireError> {
    Ok(match kind {
        MessageKind::HeartBeat => Message::HeartBeat { time: r.u64()? },
        MessageKind::ServerStatus => Message::ServerStatus(r.server_status()?),
        MessageKind::ServerLost => Message::ServerLost(ServerLost {
            domain: r.string()?,
            port: r.u16()?,
            source_domain: r.string()?,
            source_port: r.u16()?,
            slot: r.slot()?,
            offline_bits: r.bytes()?.to_vec(),
            time: r.u64()?,
        }),
        MessageKind::ServerStopping => Message::ServerStopping,
        MessageKind::UserStatus => Message::UserStatus {
            uid: r.i32()?,
            status: r.status()?,
            time: r.u64()?,
        },
        MessageKind::UserQuery => Message::UserQuery { uid: r.i32()? },
        MessageKind::UserResult => Message::UserResult(UserResult {
            uid: r.i32()?,
            domain: r.opt_string()?,
            port: r.u16()?,
            last_updated: r.i64()?,
            status: r.status()?,
        }),
        MessageKind::UserDuplicated => Message::UserDuplicated {
            uid: r.i32()?,
            domain: r.string()?,
            port: r.u16()?,
            time: r.u64()?,
        },
        MessageKind::Event => Message::Event(r.event()?),
    })
}

fn decode_slot_snapshot(r: &mut Reader) -> Result<SlotSnapshot, WireError> {
    let return_code = r.i32()?;
    let online_bits = if r.bool()? {
        Some(r.bytes()?.to_vec())
    } else {
        None
    };
    let server_indexes = if r.bool()? {
        let n = r.count(4)?;
        let mut indexes = Vec::with_capacity(n);
        for _ in 0..n {
            indexes.push(r.u32()?);
        }
        Some(indexes)
    } else {
        None
    };
    let servers = if r.bool()? {
        let n = r.count(1)?;
        let mut servers = Vec::with_capacity(n);
        for _ in 0..n {
            servers.push(if r.bool()? {
                Some(r.server_status()?)
            } else {
                None
            });
        }
        Some(servers)
    } else {
        None
    };
    Ok(SlotSnapshot {
        return_code,
        online_bits,
        server_indexes,
        servers,
        time: r.u64()?,
    })
}

/// Decode one frame (after the outer length prefix is stripped).
/// Unknown kinds decode to [`Message::Unknown`] so newer peers can add kinds.
pub fn decode_frame(mut data: Bytes) -> Result<Frame, WireError> {
    if data.remaining() < HEADER_LEN {
        return Err(WireError::Truncated {
            needed: HEADER_LEN,
            remaining: data.remaining(),
        });
    }
    let raw_kind = data.get_u8();
    let _flags = data.get_u8();
    let _reserved = data.get_u16_le();
    let body_len = data.get_u32_le() as usize;
    if data.remaining() < body_len {
        return Err(WireError::Truncated {
            needed: body_len,
            remaining: data.remaining(),
        });
    }
    let mut r = Reader {
        data: data.split_to(body_len),
    };

    if let Some(kind) = MessageKind::from_u8(raw_kind) {
        return Ok(Frame::Pipe(decode_message(kind, &mut r)?));
    }
    let frame = match raw_kind {
        KIND_OPEN => {
            let raw_role = r.u8()?;
            let role = Role::from_u8(raw_role).ok_or(WireError::InvalidTag {
                field: "role",
                value: raw_role,
            })?;
            Frame::Open(PipeSetup {
                role,
                api_secret: r.opt_string()?,
                domain: r.opt_string()?,
                port: r.u16()?,
                target: r.opt_string()?,
            })
        }
        KIND_OPENED => {
            let pipe_key = r.string()?;
            let n = r.count(7)?;
            let mut online_servers = Vec::with_capacity(n);
            for _ in 0..n {
                online_servers.push(r.server_status()?);
            }
            let n = r.count(4)?;
            let mut online_users = Vec::with_capacity(n);
            for _ in 0..n {
                online_users.push(r.i32()?);
            }
            Frame::Opened(SetupReply {
                pipe_key,
                online_servers,
                online_users,
                time: r.u64()?,
            })
        }
        KIND_CLOSE_PIPE => Frame::Call(Request::ClosePipe {
            api_secret: r.opt_string()?,
            pipe_key: r.string()?,
        }),
        KIND_SEND_EVENT => Frame::Call(Request::SendEvent {
            api_secret: r.opt_string()?,
            server_ip: r.opt_string()?,
            server_port: r.u16()?,
            events: r.events()?,
        }),
        KIND_SYNCHRONIZE_SLOT => Frame::Call(Request::SynchronizeSlot {
            api_secret: r.opt_string()?,
            slot: r.slot()?,
            master_mode: r.bool()?,
        }),
        KIND_GATEWAY_SEND => Frame::Call(Request::GatewaySendEvents {
            api_secret: r.opt_string()?,
            events: r.events()?,
        }),
        KIND_QUERY_USER_STATUS => Frame::Call(Request::QueryUserStatus {
            api_secret: r.opt_string()?,
            uid: r.i32()?,
        }),
        KIND_ACK => Frame::Reply(Response::Ack),
        KIND_RETURN_CODE => Frame::Reply(Response::ReturnCode(r.i32()?)),
        KIND_SLOT_SNAPSHOT => Frame::Reply(Response::SlotSnapshot(decode_slot_snapshot(&mut r)?)),
        KIND_GATEWAY_RESULTS => {
            let results = if r.bool()? {
                let n = r.count(4)?;
                let mut results = Vec::with_capacity(n);
                for _ in 0..n {
                    results.push(r.i32()?);
                }
                Some(results)
            } else {
                None
            };
            Frame::Reply(Response::GatewayResults(results))
        }
        KIND_USER_CLUSTER_STATUS => {
            let return_code = r.i32()?;
            let raw_status = r.u8()?;
            Frame::Reply(Response::UserClusterStatus {
                return_code,
                status: Status::from_u8(raw_status),
                domain: r.opt_string()?,
                port: r.u16()?,
            })
        }
        other => Frame::Pipe(Message::Unknown { kind: other }),
    };
    Ok(frame)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, &frame);
        decode_frame(buf.freeze()).unwrap()
    }

    #[test]
    fn test_user_result_with_missing_owner() {
        let frame = Frame::Pipe(Message::UserResult(UserResult {
            uid: 99,
            domain: None,
            port: 0,
            last_updated: -1,
            status: Status::Disconnected,
        }));
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_slot_snapshot_with_down_server() {
        let frame = Frame::Reply(Response::SlotSnapshot(SlotSnapshot {
            return_code: RETURN_OK,
            online_bits: Some(vec![0x1f, 0x8b, 0, 1]),
            server_indexes: Some(vec![0, 1, 0]),
            servers: Some(vec![
                Some(ServerStatus {
                    domain: "s1".into(),
                    port: 80,
                    status: Status::Connected,
                }),
                None,
            ]),
            time: 1_700_000_000_000,
        }));
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_send_event_drops_local_callback() {
        let event = Event::new(7, 42, &b"hello"[..]).with_undelivered(Arc::new(|| {}));
        let frame = Frame::Call(Request::SendEvent {
            api_secret: Some("k".into()),
            server_ip: None,
            server_port: 8080,
            events: vec![event],
        });
        match roundtrip(frame) {
            Frame::Call(Request::SendEvent { events, server_port, .. }) => {
                assert_eq!(server_port, 8080);
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].receiver, 42);
                assert_eq!(&events[0].payload[..], b"hello");
                assert!(events[0].on_undelivered.is_none());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_open_carries_role() {
        let frame = Frame::Open(PipeSetup {
            role: Role::DirectoryPeer,
            api_secret: None,
            domain: Some("d1".into()),
            port: 80,
            target: Some("d2".into()),
        });
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_write_framed_prefix() {
        let mut buf = BytesMut::new();
        write_framed(&mut buf, &Frame::Pipe(Message::ServerStopping));
        let inner = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(inner, HEADER_LEN);
        assert_eq!(buf.len(), 4 + HEADER_LEN);
        assert_eq!(buf[4], MessageKind::ServerStopping as u8);
    }

    #[test]
    fn test_oversized_collection_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(KIND_GATEWAY_SEND);
        buf.put_u8(0);
        buf.put_u16_le(0);
        buf.put_u32_le(5);
        buf.put_u8(0); // no secret
        buf.put_u32_le(MAX_COLLECTION_ELEMENTS as u32 + 1);
        assert_eq!(
            decode_frame(buf.freeze()),
            Err(WireError::CollectionTooLarge(MAX_COLLECTION_ELEMENTS + 1))
        );
    }

    #[test]
    fn test_count_larger_than_body_is_truncated() {
        let mut buf = BytesMut::new();
        buf.put_u8(KIND_GATEWAY_SEND);
        buf.put_u8(0);
        buf.put_u16_le(0);
        buf.put_u32_le(5);
        buf.put_u8(0);
        buf.put_u32_le(1000);
        assert!(matches!(
            decode_frame(buf.freeze()),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unknown_kind_is_not_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x1e);
        buf.put_u8(0);
        buf.put_u16_le(0);
        buf.put_u32_le(3);
        buf.put_slice(b"abc");
        assert_eq!(
            decode_frame(buf.freeze()).unwrap(),
            Frame::Pipe(Message::Unknown { kind: 0x1e })
        );
    }

    #[test]
    fn test_bad_status_tag() {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageKind::UserStatus as u8);
        buf.put_u8(0);
        buf.put_u16_le(0);
        buf.put_u32_le(13);
        buf.put_i32_le(1);
        buf.put_u8(9);
        buf.put_u64_le(0);
        assert_eq!(
            decode_frame(buf.freeze()),
            Err(WireError::InvalidTag {
                field: "status",
                value: 9
            })
        );
    }

    #[test]
    fn test_slot_out_of_range_rejected() {
        let mut buf = BytesMut::new();
        encode_frame(
            &mut buf,
            &Frame::Call(Request::SynchronizeSlot {
                api_secret: None,
                slot: 200,
                master_mode: false,
            }),
        );
        assert_eq!(
            decode_frame(buf.freeze()),
            Err(WireError::InvalidTag {
                field: "slot",
                value: 200
            })
        );

        let lost = ServerLost {
            domain: "s1".into(),
            port: 80,
            source_domain: "dir".into(),
            source_port: 80,
            slot: SLOTS as u8,
            offline_bits: vec![1],
            time: 0,
        };
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, &Frame::Pipe(Message::ServerLost(lost.clone())));
        assert!(matches!(
            decode_frame(buf.freeze()),
            Err(WireError::InvalidTag { field: "slot", .. })
        ));

        let ok = ServerLost { slot: 127, ..lost };
        assert_eq!(
            roundtrip(Frame::Pipe(Message::ServerLost(ok.clone()))),
            Frame::Pipe(Message::ServerLost(ok))
        );
    }

    #[test]
    fn test_decode_too_short() {
        let buf = Bytes::from_static(&[0u8; 4]);
        assert!(matches!(
            decode_frame(buf),
            Err(WireError::Truncated { needed: 8, .. })
        ));
    }

    #[test]
    fn test_handover_filter() {
        assert!(!Message::HeartBeat { time: 1 }.survives_handover());
        assert!(!Message::ServerStopping.survives_handover());
        assert!(Message::UserQuery { uid: 3 }.survives_handover());
    }
}
