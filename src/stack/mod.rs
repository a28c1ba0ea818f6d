//! The protocol stack: an ordered chain of protocol layers sharing a transport.
//!
//! Every message on the wire starts with an [Envelope] that identifies the sender and the
//!  protocol layer the message belongs to, followed by the layer's own message:
//!
//! ```ascii
//! 0:  sender address (unique part, socket address)
//! *:  checksum (u64): CRC-64 over sender's unique part, protocol id and message
//! *:  protocol id (u64)
//! *:  layer specific message
//! ```
//!
//! Received buffers are checked and dispatched to the layer with the matching id. View changes
//!  are passed to all layers in the order they were registered.

pub mod stack_sender;

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::membership::View;
use crate::messaging::envelope::Envelope;
use crate::messaging::node_addr::NodeAddr;
use crate::messaging::protocol_id::ProtocolId;

#[async_trait]
pub trait ProtocolLayer: Send + Sync + 'static {
    fn id(&self) -> ProtocolId;

    /// Handles a message for this layer. The buffer contains the layer specific message, i.e.
    ///  it starts immediately *after* the envelope.
    ///
    /// Receive tasks may call this concurrently.
    async fn on_message(&self, envelope: &Envelope, buf: &[u8]);

    async fn on_view_change(&self, view: &View);

    /// The layer's periodic work. This runs until the task is aborted when the group shuts down.
    async fn run(self: Arc<Self>);
}

pub struct ProtocolStack {
    myself: NodeAddr,
    max_buffer_size: usize,
    layers: RwLock<Vec<Arc<dyn ProtocolLayer>>>,
}

impl ProtocolStack {
    pub fn new(myself: NodeAddr, max_message_size: usize) -> ProtocolStack {
        ProtocolStack {
            myself,
            max_buffer_size: max_message_size.saturating_add(1024),
            layers: Default::default(),
        }
    }

    pub async fn register_layer(&self, layer: Arc<dyn ProtocolLayer>) -> anyhow::Result<()> {
        let mut layers = self.layers.write().await;
        if layers.iter().any(|l| l.id() == layer.id()) {
            bail!("registering a second protocol layer for id {:?}", layer.id());
        }
        layers.push(layer);
        Ok(())
    }

    pub async fn layers(&self) -> Vec<Arc<dyn ProtocolLayer>> {
        self.layers.read().await.clone()
    }

    pub async fn on_message(&self, buf: &[u8]) {
        if buf.len() > self.max_buffer_size {
            warn!("received a message of {} bytes, exceeding the maximum of {} bytes - skipping", buf.len(), self.max_buffer_size);
            return;
        }

        let mut msg_buf = buf;
        let envelope = match Envelope::try_read(&mut msg_buf) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("received a message without a valid envelope - discarding: {}", e);
                return;
            }
        };

        if !envelope.is_valid_for(msg_buf) {
            warn!("checksum error in message from {:?} - skipping", envelope.from);
            return;
        }
        if envelope.from == self.myself {
            trace!("ignoring message from myself");
            return;
        }

        let layer = self.layers.read().await
            .iter()
            .find(|l| l.id() == envelope.protocol_id)
            .cloned();
        match layer {
            Some(layer) => layer.on_message(&envelope, msg_buf).await,
            None => debug!("received message for protocol {:?} which is not part of the stack - ignoring", envelope.protocol_id),
        }
    }

    pub async fn on_view_change(&self, view: &View) {
        debug!("installing view {}: {:?}", view.id, view.members().collect::<Vec<_>>());
        for layer in self.layers().await {
            layer.on_view_change(view).await;
        }
    }
}
