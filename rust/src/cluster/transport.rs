//! Request/response calls and long-lived pipes over TCP.
//!
//! One listener serves both shapes. The first frame on an accepted socket
//! decides: a [`Frame::Call`] gets exactly one [`Frame::Reply`], a
//! [`Frame::Open`] gets a [`Frame::Opened`] followed by pushed pipe messages
//! until either side closes.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{ClusterError, Result, WireError};
use super::pipe::Outlet;
use super::state::{ClusterMetrics, ClusterState};
use super::wire::{
    Frame, HEADER_LEN, MAX_BATCH_BYTES, MAX_FRAME_SIZE, Message, PipeSetup, Request, Response,
    SetupReply, decode_frame, write_framed,
};
use super::{rpc, topology};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const READ_BUFFER: usize = 65_536;
const SOCKET_BUFFER: usize = 262_144;

/// A dialed pipe: the acceptor's setup reply and the messages it pushes.
/// `inbound` ends when the socket is lost; cancel `cancel` to close it.
pub struct PipeLink {
    pub reply: SetupReply,
    pub inbound: mpsc::UnboundedReceiver<Message>,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one request and wait for its single response.
    async fn call(&self, endpoint: &str, request: Request) -> Result<Response>;

    /// Open a pipe and complete its setup handshake.
    async fn open_pipe(&self, endpoint: &str, setup: PipeSetup) -> Result<PipeLink>;
}

/// `http://host[:port][/path]` to `host:port`, port 80 when absent.
pub(crate) fn socket_addr_of(endpoint: &str) -> String {
    let rest = endpoint
        .strip_prefix("http://")
        .or_else(|| endpoint.strip_prefix("https://"))
        .unwrap_or(endpoint);
    let authority = rest.split('/').next().unwrap_or(rest);
    match authority.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => format!("{host}:{port}"),
        _ => format!("{authority}:80"),
    }
}

/// TCP_NODELAY, keepalive and larger buffers on every cluster socket.
fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));
    let sock_ref = SockRef::from(stream);
    let _ = sock_ref.set_tcp_keepalive(&keepalive);
    let _ = sock_ref.set_recv_buffer_size(SOCKET_BUFFER);
    let _ = sock_ref.set_send_buffer_size(SOCKET_BUFFER);
}

/// Read one length-prefixed frame. `Ok(None)` on a clean EOF.
async fn read_frame<R>(reader: &mut R, metrics: &ClusterMetrics) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let frame_len = u32::from_be_bytes(len_buf) as usize;
    if frame_len < HEADER_LEN {
        return Err(WireError::Truncated {
            needed: HEADER_LEN,
            remaining: frame_len,
        }
        .into());
    }
    if frame_len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(frame_len).into());
    }
    let mut frame_buf = BytesMut::zeroed(frame_len);
    reader.read_exact(&mut frame_buf).await?;
    metrics
        .bytes_received
        .fetch_add((4 + frame_len) as u64, Ordering::Relaxed);
    Ok(Some(decode_frame(frame_buf.freeze())?))
}

async fn write_frame(
    writer: &mut OwnedWriteHalf,
    frame: &Frame,
    metrics: &ClusterMetrics,
) -> Result<()> {
    let mut buf = BytesMut::new();
    write_framed(&mut buf, frame);
    writer.write_all(&buf).await?;
    metrics
        .bytes_sent
        .fetch_add(buf.len() as u64, Ordering::Relaxed);
    Ok(())
}

// ---------------------------------------------------------------------------
// Dialing side
// ---------------------------------------------------------------------------

pub struct TcpTransport {
    metrics: Arc<ClusterMetrics>,
}

impl TcpTransport {
    pub fn new(metrics: Arc<ClusterMetrics>) -> Self {
        Self { metrics }
    }

    async fn connect(&self, endpoint: &str) -> Result<TcpStream> {
        let addr = socket_addr_of(endpoint);
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ClusterError::Transport {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ClusterError::ConnectTimeout {
                    endpoint: endpoint.to_string(),
                });
            }
        };
        tune_socket(&stream);
        Ok(stream)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, endpoint: &str, request: Request) -> Result<Response> {
        let stream = self.connect(endpoint).await?;
        let (reader, mut writer) = stream.into_split();
        write_frame(&mut writer, &Frame::Call(request), &self.metrics).await?;
        let mut reader = BufReader::new(reader);
        let frame = tokio::time::timeout(CALL_TIMEOUT, read_frame(&mut reader, &self.metrics))
            .await
            .map_err(|_| ClusterError::Transport {
                endpoint: endpoint.to_string(),
                reason: "response timed out".into(),
            })??;
        match frame {
            Some(Frame::Reply(response)) => Ok(response),
            _ => Err(ClusterError::UnexpectedResponse {
                endpoint: endpoint.to_string(),
            }),
        }
    }

    async fn open_pipe(&self, endpoint: &str, setup: PipeSetup) -> Result<PipeLink> {
        let stream = self.connect(endpoint).await?;
        let (reader, mut writer) = stream.into_split();
        write_frame(&mut writer, &Frame::Open(setup), &self.metrics).await?;
        let mut reader = BufReader::with_capacity(READ_BUFFER, reader);
        let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader, &self.metrics))
            .await
            .map_err(|_| ClusterError::Transport {
                endpoint: endpoint.to_string(),
                reason: "pipe setup timed out".into(),
            })??;
        let reply = match frame {
            Some(Frame::Opened(reply)) => reply,
            // The acceptor drops sockets it refuses.
            None => return Err(ClusterError::PipeClosed),
            Some(_) => {
                return Err(ClusterError::UnexpectedResponse {
                    endpoint: endpoint.to_string(),
                });
            }
        };
        let (tx, inbound) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(pipe_reader(
            reader,
            writer,
            tx,
            cancel.clone(),
            self.metrics.clone(),
            endpoint.to_string(),
        ));
        Ok(PipeLink {
            reply,
            inbound,
            cancel,
        })
    }
}

/// Forward pushed messages to the link owner. Holds the write half so the
/// acceptor sees EOF exactly when this task ends.
async fn pipe_reader(
    mut reader: BufReader<OwnedReadHalf>,
    _writer: OwnedWriteHalf,
    tx: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    metrics: Arc<ClusterMetrics>,
    endpoint: String,
) {
    loop {
        let frame = tokio::select! {
            r = read_frame(&mut reader, &metrics) => r,
            () = cancel.cancelled() => break,
        };
        match frame {
            Ok(Some(Frame::Pipe(msg))) => {
                if tx.send(msg).is_err() {
                    break;
                }
            }
            Ok(Some(other)) => {
                warn!(endpoint = %endpoint, frame = ?other, "unexpected frame on pipe, closing");
                break;
            }
            Ok(None) => break,
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "pipe read failed");
                break;
            }
        }
    }
    cancel.cancel();
}

// ---------------------------------------------------------------------------
// Accepting side
// ---------------------------------------------------------------------------

/// Accept calls and pipes until the cluster state is shut down.
pub async fn serve(listener: TcpListener, state: Arc<ClusterState>) -> Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            r = listener.accept() => r?,
            () = state.cancel.cancelled() => return Ok(()),
        };
        tune_socket(&stream);
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, state).await {
                debug!(peer = %peer, error = %e, "cluster connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ClusterState>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::with_capacity(READ_BUFFER, reader);
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader, &state.metrics))
        .await
        .map_err(|_| ClusterError::Transport {
            endpoint: peer.to_string(),
            reason: "no request before timeout".into(),
        })??;
    let peer_ip = peer.ip().to_string();
    match first {
        Some(Frame::Call(request)) => {
            let response = rpc::handle_request(&state, request, &peer_ip).await;
            write_frame(&mut writer, &Frame::Reply(response), &state.metrics).await
        }
        Some(Frame::Open(setup)) => {
            let role = setup.role;
            let Some((outlet, reply)) = topology::accept_pipe(&state, setup, &peer_ip) else {
                return Ok(());
            };
            write_frame(&mut writer, &Frame::Opened(reply), &state.metrics).await?;
            outlet.attach();
            debug!(host = %outlet.host, role = %role, "pipe attached");
            run_outlet(&outlet, reader, writer, &state).await;
            outlet.detach();
            debug!(host = %outlet.host, role = %role, "pipe detached");
            Ok(())
        }
        Some(other) => {
            warn!(peer = %peer, frame = ?other, "unexpected first frame");
            Ok(())
        }
        None => Ok(()),
    }
}

/// Write queued messages until the socket, the outlet or the node goes away.
async fn run_outlet(
    outlet: &Arc<Outlet>,
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    state: &ClusterState,
) {
    let metrics = state.metrics.clone();
    // The dialer sends nothing after setup; any read result means it is gone.
    let eof = async move {
        loop {
            match read_frame(&mut reader, &metrics).await {
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
    };
    tokio::pin!(eof);
    let mut buf = BytesMut::with_capacity(MAX_BATCH_BYTES);

    loop {
        let batch = outlet.take_all();
        if batch.is_empty() {
            tokio::select! {
                () = outlet.ready() => continue,
                () = &mut eof => break,
                () = outlet.closed().cancelled() => {
                    // Superseded or stopped: only housekeeping was not handed over.
                    let farewell: Vec<Message> = outlet
                        .take_all()
                        .into_iter()
                        .filter(|m| !m.survives_handover())
                        .collect();
                    let _ = write_batch(&mut writer, farewell, outlet, &state.metrics, &mut buf).await;
                    break;
                }
                () = state.cancel.cancelled() => break,
            }
        }
        let written = tokio::select! {
            ok = write_batch(&mut writer, batch, outlet, &state.metrics, &mut buf) => ok,
            () = state.cancel.cancelled() => false,
        };
        if !written {
            break;
        }
    }
}

/// Coalesce messages into writes of about [`MAX_BATCH_BYTES`]. On failure the
/// unsent tail goes back to the front of the outlet queue.
async fn write_batch(
    writer: &mut OwnedWriteHalf,
    batch: Vec<Message>,
    outlet: &Outlet,
    metrics: &ClusterMetrics,
    buf: &mut BytesMut,
) -> bool {
    let mut pending: VecDeque<Message> = batch.into();
    while !pending.is_empty() {
        buf.clear();
        let mut chunk = Vec::new();
        while let Some(msg) = pending.pop_front() {
            let frame = Frame::Pipe(msg);
            write_framed(buf, &frame);
            chunk.push(frame);
            if buf.len() >= MAX_BATCH_BYTES {
                break;
            }
        }
        if writer.write_all(buf).await.is_err() {
            let mut unsent: Vec<Message> = chunk
                .into_iter()
                .filter_map(|f| match f {
                    Frame::Pipe(m) => Some(m),
                    _ => None,
                })
                .collect();
            unsent.extend(pending);
            outlet.requeue_front(unsent);
            return false;
        }
        metrics
            .bytes_sent
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
    }
    true
}
