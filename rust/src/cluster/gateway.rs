//! Gateway event submission: the handler directories and proxies answer, and
//! the client nodes use to hand events to a gateway.

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, warn};

use super::auth;
use super::config::ClusterConfig;
use super::error::{ClusterError, Result};
use super::router;
use super::state::{ClusterMetrics, ClusterState};
use super::transport::Transport;
use super::wire::{Event, RETURN_UNAUTHORIZED, Request, Response};

fn is_http(prefix: &str) -> bool {
    prefix.starts_with("http://") || prefix.starts_with("https://")
}

/// Route events submitted through a gateway. Senders are never trusted here,
/// so every sender is cleared. A bad secret or an empty batch is answered
/// without results.
pub(crate) fn handle_send_events(
    state: &Arc<ClusterState>,
    secret: Option<&str>,
    events: Vec<Event>,
    peer_ip: &str,
) -> Response {
    if !auth::check_gateway_secret(&state.config, secret) {
        ClusterMetrics::incr(&state.metrics.auth_failures);
        warn!(peer = peer_ip, "gateway submission rejected: bad secret");
        return Response::GatewayResults(None);
    }
    if events.is_empty() {
        return Response::GatewayResults(None);
    }
    let results = events
        .into_iter()
        .map(|mut event| {
            if event.receiver <= 0 {
                return 0;
            }
            event.sender = 0;
            router::route_event(state, event).code()
        })
        .collect();
    Response::GatewayResults(Some(results))
}

/// Submits events to the configured gateways, moving to another gateway
/// after each failed attempt.
pub struct GatewayClient {
    api_secret: Option<String>,
    primary: String,
    gateways: Vec<String>,
    max_resendings: u32,
    transport: Arc<dyn Transport>,
}

impl GatewayClient {
    pub fn new(config: &ClusterConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            api_secret: config.api_secret.clone(),
            primary: config.gateway_server.clone(),
            gateways: config.all_gateway_servers.clone(),
            max_resendings: config.max_event_resendings,
            transport,
        }
    }

    /// Gateway prefix for the next attempt: the configured gateway first,
    /// then a random one other than the last tried.
    fn pick(&self, last: Option<&str>) -> String {
        let Some(last) = last else {
            return self.primary.clone();
        };
        if self.gateways.is_empty() {
            return self.primary.clone();
        }
        let mut rng = rand::thread_rng();
        let mut draws = self.gateways.len() * 5;
        while draws > 0 {
            draws -= 1;
            let prefix = &self.gateways[rng.gen_range(0..self.gateways.len())];
            if !is_http(prefix) {
                continue;
            }
            if prefix == last && self.gateways.len() > 1 && draws > 0 {
                continue;
            }
            return prefix.clone();
        }
        self.primary.clone()
    }

    fn attempts(&self) -> u32 {
        self.max_resendings.max(2) + 2 * self.gateways.len() as u32
    }

    /// Per-event route codes from the gateway that took the batch.
    pub async fn send_events(&self, events: Vec<Event>) -> Result<Vec<i32>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let mut tries = self.attempts();
        let mut last: Option<String> = None;
        loop {
            let prefix = self.pick(last.as_deref());
            let request = Request::GatewaySendEvents {
                api_secret: self.api_secret.clone(),
                events: events.clone(),
            };
            let failure = match self.transport.call(&prefix, request).await {
                Ok(Response::GatewayResults(Some(results))) => return Ok(results),
                Ok(Response::GatewayResults(None)) => {
                    return Err(ClusterError::Rejected(RETURN_UNAUTHORIZED));
                }
                Ok(_) => ClusterError::UnexpectedResponse {
                    endpoint: prefix.clone(),
                },
                Err(e) => e,
            };
            tries = tries.saturating_sub(1);
            debug!(gateway = %prefix, events = events.len(), tries, error = %failure, "gateway send failed");
            if tries == 0 || self.max_resendings == 0 {
                warn!(gateway = %prefix, events = events.len(), "giving up sending events to gateway");
                return Err(failure);
            }
            last = Some(prefix);
        }
    }
}
