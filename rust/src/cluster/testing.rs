//! Test doubles: a transport that records traffic and a session registry
//! that records deliveries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::config::ClusterConfig;
use super::error::{ClusterError, Result};
use super::node::SessionRegistry;
use super::rpc;
use super::state::{ClusterMetrics, ClusterState};
use super::transport::{PipeLink, Transport};
use super::wire::{Event, Message, PipeSetup, Request, Response, SetupReply};
use super::Uid;

type Responder = Box<dyn Fn(&str, &Request) -> Result<Response> + Send + Sync>;

/// Records every call and pipe open. Calls answer `Ack` unless a responder
/// or a forwarding target is installed; pipe opens fail unless
/// `accept_pipes` is set.
pub(crate) struct RecordingTransport {
    pub calls: Mutex<Vec<(String, Request)>>,
    pub opens: Mutex<Vec<(String, PipeSetup)>>,
    pub links: Mutex<Vec<(String, mpsc::UnboundedSender<Message>, CancellationToken)>>,
    pub accept_pipes: AtomicBool,
    responder: Mutex<Option<Responder>>,
    forward: Mutex<Option<Arc<ClusterState>>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            opens: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
            accept_pipes: AtomicBool::new(false),
            responder: Mutex::new(None),
            forward: Mutex::new(None),
        })
    }

    pub fn respond_with<F>(&self, f: F)
    where
        F: Fn(&str, &Request) -> Result<Response> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(f));
    }

    /// Answer calls with another node's request handlers.
    pub fn forward_to(&self, target: Arc<ClusterState>) {
        *self.forward.lock().unwrap() = Some(target);
    }

    pub fn calls(&self) -> Vec<(String, Request)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn opens(&self) -> Vec<(String, PipeSetup)> {
        self.opens.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn call(&self, endpoint: &str, request: Request) -> Result<Response> {
        self.calls
            .lock()
            .unwrap()
            .push((endpoint.to_string(), request.clone()));
        let target = self.forward.lock().unwrap().clone();
        if let Some(target) = target {
            return Ok(rpc::handle_request(&target, request, "loopback").await);
        }
        match self.responder.lock().unwrap().as_ref() {
            Some(f) => f(endpoint, &request),
            None => Ok(Response::Ack),
        }
    }

    async fn open_pipe(&self, endpoint: &str, setup: PipeSetup) -> Result<PipeLink> {
        self.opens
            .lock()
            .unwrap()
            .push((endpoint.to_string(), setup));
        if !self.accept_pipes.load(Ordering::SeqCst) {
            return Err(ClusterError::Transport {
                endpoint: endpoint.to_string(),
                reason: "refused".into(),
            });
        }
        let (tx, inbound) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.links
            .lock()
            .unwrap()
            .push((endpoint.to_string(), tx, cancel.clone()));
        Ok(PipeLink {
            reply: SetupReply {
                pipe_key: format!("key-{endpoint}"),
                ..SetupReply::default()
            },
            inbound,
            cancel,
        })
    }
}

/// Session registry double.
pub(crate) struct TestNode {
    id: String,
    pub online: Mutex<Vec<Uid>>,
    pub delivered: Mutex<Vec<Event>>,
    pub duplicates: Mutex<Vec<(Uid, String, u16)>>,
    pub accepting: AtomicBool,
}

impl TestNode {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            online: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
            duplicates: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
        })
    }

    pub fn delivered(&self) -> Vec<Event> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn duplicates(&self) -> Vec<(Uid, String, u16)> {
        self.duplicates.lock().unwrap().clone()
    }
}

impl SessionRegistry for TestNode {
    fn node_id(&self) -> String {
        self.id.clone()
    }

    fn online_user_ids(&self) -> Vec<Uid> {
        self.online.lock().unwrap().clone()
    }

    fn deliver(&self, event: &Event) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            return false;
        }
        self.delivered.lock().unwrap().push(event.clone());
        true
    }

    fn on_duplicate_login(&self, uid: Uid, _time: u64, domain: &str, port: u16) -> bool {
        self.duplicates
            .lock()
            .unwrap()
            .push((uid, domain.to_string(), port));
        true
    }
}

pub(crate) fn test_state_with(
    config: ClusterConfig,
    node: Option<Arc<TestNode>>,
) -> (Arc<ClusterState>, Arc<RecordingTransport>) {
    let transport = RecordingTransport::new();
    let node = node.map(|n| n as Arc<dyn SessionRegistry>);
    let state = ClusterState::new(
        config,
        transport.clone(),
        Arc::new(ClusterMetrics::new()),
        node,
    );
    (state, transport)
}

pub(crate) fn test_state(config: ClusterConfig, node: Option<Arc<TestNode>>) -> Arc<ClusterState> {
    test_state_with(config, node).0
}

/// Service-node configuration used across tests: this node is `s1:80`.
pub(crate) fn service_config() -> ClusterConfig {
    ClusterConfig {
        primary_server: false,
        server_ip: "s1".into(),
        port: 80,
        global_server: "http://dir".into(),
        ..ClusterConfig::default()
    }
}

/// Directory-node configuration used across tests: this node is `dir:80`.
pub(crate) fn directory_config() -> ClusterConfig {
    ClusterConfig {
        primary_server: true,
        server_ip: "dir".into(),
        port: 80,
        ..ClusterConfig::default()
    }
}
