use anyhow::{Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::protocol::Envelope;

/// Delivery of hub messages to nodes. Framing is the transport's business.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send(&self, node_id: &str, envelope: Envelope) -> Result<()>;
}

/// One unbounded channel per connected node.
#[derive(Default)]
pub struct ChannelOutbound {
    peers: DashMap<String, mpsc::UnboundedSender<Envelope>>,
}

impl ChannelOutbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens (or replaces) the channel for `node_id`.
    pub fn connect(&self, node_id: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.insert(node_id.to_string(), tx);
        rx
    }

    pub fn disconnect(&self, node_id: &str) {
        self.peers.remove(node_id);
    }
}

#[async_trait]
impl Outbound for ChannelOutbound {
    async fn send(&self, node_id: &str, envelope: Envelope) -> Result<()> {
        let peer = self
            .peers
            .get(node_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| anyhow!("Node {} has no open channel", node_id))?;
        peer.send(envelope)
            .map_err(|e| anyhow!("Channel to {} closed: {}", node_id, e))
    }
}
