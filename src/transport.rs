//! Node transport (§6 "Node transport (outbound, from C4)").
//!
//! The dispatcher only needs to distinguish three outcomes; this crate
//! ships an HTTP implementation over `reqwest` (POSTing the sealed bytes
//! to a registered node address) since the design leaves the transport
//! itself unspecified beyond that contract.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::model::{NodeId, Precedence};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Ok,
    TransientError,
    PermanentError,
}

#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn deliver(
        &self,
        recipient: &NodeId,
        sealed_payload: &[u8],
        precedence: Precedence,
        timeout: Duration,
    ) -> DeliveryOutcome;
}

/// Delivers over HTTP to addresses registered in the node registry.
pub struct HttpNodeTransport {
    client: reqwest::Client,
    addresses: parking_lot::RwLock<HashMap<NodeId, String>>,
}

impl HttpNodeTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            addresses: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn register_address(&self, node_id: NodeId, address: String) {
        self.addresses.write().insert(node_id, address);
    }
}

impl Default for HttpNodeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeTransport for HttpNodeTransport {
    async fn deliver(
        &self,
        recipient: &NodeId,
        sealed_payload: &[u8],
        precedence: Precedence,
        timeout: Duration,
    ) -> DeliveryOutcome {
        let Some(address) = self.addresses.read().get(recipient).cloned() else {
            return DeliveryOutcome::PermanentError;
        };

        let result = self
            .client
            .post(format!("{address}/inbox"))
            .header("X-TacEdge-Precedence", precedence.as_str())
            .body(sealed_payload.to_vec())
            .timeout(timeout)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => DeliveryOutcome::Ok,
            Ok(resp) if resp.status().is_client_error() => DeliveryOutcome::PermanentError,
            Ok(_) => DeliveryOutcome::TransientError,
            Err(e) if e.is_timeout() => DeliveryOutcome::TransientError,
            Err(e) if e.is_connect() => DeliveryOutcome::TransientError,
            Err(_) => DeliveryOutcome::TransientError,
        }
    }
}

/// Deterministic in-memory transport for tests: callers preload outcomes
/// per recipient and inspect what was "delivered".
#[derive(Default)]
pub struct MockNodeTransport {
    outcomes: dashmap::DashMap<NodeId, std::collections::VecDeque<DeliveryOutcome>>,
    pub delivered: parking_lot::Mutex<Vec<(NodeId, Vec<u8>)>>,
}

impl MockNodeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queue_outcome(&self, node_id: impl Into<NodeId>, outcome: DeliveryOutcome) {
        self.outcomes
            .entry(node_id.into())
            .or_default()
            .push_back(outcome);
    }
}

#[async_trait]
impl NodeTransport for MockNodeTransport {
    async fn deliver(
        &self,
        recipient: &NodeId,
        sealed_payload: &[u8],
        _precedence: Precedence,
        _timeout: Duration,
    ) -> DeliveryOutcome {
        self.delivered
            .lock()
            .push((recipient.clone(), sealed_payload.to_vec()));

        let outcome = self
            .outcomes
            .get_mut(recipient)
            .and_then(|mut q| q.pop_front())
            .unwrap_or(DeliveryOutcome::Ok);
        outcome
    }
}
