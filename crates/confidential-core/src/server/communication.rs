//! Replica to replica messaging
//!
//! Every payload starts with an [`InterServersMessageType`] tag. Messages
//! reach a replica either point-to-point through the [`ServerTransport`] or
//! through the ordering layer as APPLICATION requests, and are handed to the
//! handler registered for their tag.

use crate::codec::Request;
use crate::types::{MessageContext, Metadata, ProcessId};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Kind of an inter-server message. The discriminants are the wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InterServersMessageType {
    PolynomialProposal = 0,
    PolynomialProposalSet = 1,
}

impl InterServersMessageType {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for InterServersMessageType {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::PolynomialProposal),
            1 => Ok(Self::PolynomialProposalSet),
            tag => Err(Error::UnknownTag {
                kind: "inter-server message",
                tag,
            }),
        }
    }
}

/// Network seam between replicas
#[async_trait]
pub trait ServerTransport: Send + Sync {
    fn process_id(&self) -> ProcessId;

    /// Unordered point-to-point delivery
    async fn send(&self, recipients: &[ProcessId], payload: Vec<u8>) -> Result<()>;

    /// Submit an encoded request to the ordering layer
    async fn order(&self, metadata: Metadata, request: Vec<u8>) -> Result<()>;
}

/// A demultiplexed inter-server message
#[derive(Debug, Clone)]
pub struct InterServerMessage {
    pub sender: ProcessId,
    pub kind: InterServersMessageType,
    pub payload: Vec<u8>,
    /// Set when the message was delivered by the ordering layer
    pub context: Option<MessageContext>,
}

pub struct InterServersCommunication {
    transport: Arc<dyn ServerTransport>,
    handlers: DashMap<InterServersMessageType, mpsc::UnboundedSender<InterServerMessage>>,
}

impl InterServersCommunication {
    pub fn new(transport: Arc<dyn ServerTransport>) -> Self {
        Self {
            transport,
            handlers: DashMap::new(),
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.transport.process_id()
    }

    pub fn register_handler(
        &self,
        kind: InterServersMessageType,
        handler: mpsc::UnboundedSender<InterServerMessage>,
    ) {
        self.handlers.insert(kind, handler);
    }

    /// Ordered APPLICATION payload handed over by the execution engine
    pub fn message_received(&self, plain_data: &[u8], context: &MessageContext) {
        self.dispatch(context.sender, plain_data, Some(context.clone()));
    }

    /// Unordered payload received from the transport
    pub fn deliver(&self, sender: ProcessId, bytes: &[u8]) {
        self.dispatch(sender, bytes, None);
    }

    fn dispatch(&self, sender: ProcessId, bytes: &[u8], context: Option<MessageContext>) {
        let Some((&tag, payload)) = bytes.split_first() else {
            warn!(sender, "Empty inter-server message");
            return;
        };
        let kind = match InterServersMessageType::try_from(tag) {
            Ok(kind) => kind,
            Err(e) => {
                warn!(sender, error = %e, "Dropping inter-server message");
                return;
            }
        };
        let Some(handler) = self.handlers.get(&kind).map(|h| h.value().clone()) else {
            warn!(sender, ?kind, "No handler registered");
            return;
        };
        debug!(sender, ?kind, ordered = context.is_some(), "Inter-server message");
        let message = InterServerMessage {
            sender,
            kind,
            payload: payload.to_vec(),
            context,
        };
        if handler.send(message).is_err() {
            warn!(?kind, "Handler is gone, dropping message");
        }
    }

    fn frame(kind: InterServersMessageType, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(payload.len() + 1);
        bytes.push(kind.tag());
        bytes.extend_from_slice(payload);
        bytes
    }

    pub async fn send(
        &self,
        kind: InterServersMessageType,
        recipients: &[ProcessId],
        payload: &[u8],
    ) -> Result<()> {
        self.transport.send(recipients, Self::frame(kind, payload)).await
    }

    /// Order `payload` as an APPLICATION request tagged with `metadata`
    pub async fn submit_ordered(
        &self,
        kind: InterServersMessageType,
        metadata: Metadata,
        payload: &[u8],
    ) -> Result<()> {
        let request = Request::application(Self::frame(kind, payload)).encode()?;
        self.transport.order(metadata, request).await
    }

    /// Feed transport deliveries into the handlers until the channel closes
    pub fn spawn_receiver(
        self: &Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<(ProcessId, Vec<u8>)>,
    ) -> JoinHandle<()> {
        let communication = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((sender, bytes)) = inbound.recv().await {
                communication.deliver(sender, &bytes);
            }
            debug!(
                process_id = communication.process_id(),
                "Inter-server receiver stopped"
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::memory::MemoryNetwork;
    use crate::types::MessageType;

    #[tokio::test]
    async fn test_dispatch_by_tag() {
        let (network, _ordered) = MemoryNetwork::new();
        let (transport, _inbound) = network.join(0);
        let communication = InterServersCommunication::new(Arc::new(transport));

        let (tx, mut rx) = mpsc::unbounded_channel();
        communication.register_handler(InterServersMessageType::PolynomialProposalSet, tx);

        communication.deliver(3, &[1, 9, 9]);
        communication.deliver(3, &[0, 1]);
        communication.deliver(3, &[7]);
        communication.message_received(&[1, 5], &MessageContext {
            sender: 2,
            consensus_id: 4,
            ..Default::default()
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.sender, 3);
        assert_eq!(first.payload, vec![9, 9]);
        assert!(first.context.is_none());

        let second = rx.recv().await.unwrap();
        assert_eq!(second.sender, 2);
        assert_eq!(second.context.unwrap().consensus_id, 4);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transport_roundtrip() {
        let (network, mut ordered) = MemoryNetwork::new();
        let (transport_a, _inbound_a) = network.join(0);
        let (transport_b, inbound_b) = network.join(1);
        let a = InterServersCommunication::new(Arc::new(transport_a));
        let b = Arc::new(InterServersCommunication::new(Arc::new(transport_b)));

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.register_handler(InterServersMessageType::PolynomialProposal, tx);
        let _receiver = b.spawn_receiver(inbound_b);

        a.send(InterServersMessageType::PolynomialProposal, &[1], b"hello")
            .await
            .unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(message.sender, 0);
        assert_eq!(message.payload, b"hello");

        a.submit_ordered(
            InterServersMessageType::PolynomialProposalSet,
            Metadata::PolynomialProposalSet,
            b"set",
        )
        .await
        .unwrap();
        let submission = ordered.recv().await.unwrap();
        assert_eq!(submission.sender, 0);
        assert_eq!(submission.metadata, Metadata::PolynomialProposalSet);
        assert_eq!(submission.request[0], MessageType::Application.tag());
    }
}
