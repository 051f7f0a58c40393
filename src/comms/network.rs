use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::common::{
    error::EscrowError,
    types::{NodeAddress, PubKeyRing},
};
use crate::protocol::messages::TradeMessage;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageDelivery {
    Arrived,
    StoredInMailbox,
}

/// Resolves once the network layer knows what happened to a sent message. A fault carries the
/// transport's reason.
#[derive(Debug)]
pub struct DeliveryReceipt {
    rx: oneshot::Receiver<Result<MessageDelivery, String>>,
}

impl DeliveryReceipt {
    pub fn new() -> (oneshot::Sender<Result<MessageDelivery, String>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    pub async fn wait(self) -> Result<MessageDelivery, EscrowError> {
        match self.rx.await {
            Ok(Ok(delivery)) => Ok(delivery),
            Ok(Err(fault)) => Err(EscrowError::MessageDelivery(fault)),
            Err(_) => Err(EscrowError::MessageDelivery(
                "Delivery receipt dropped".to_string(),
            )),
        }
    }
}

/// Bytes handed up by the transport, with the sender key the encryption layer authenticated.
#[derive(Clone, Debug)]
pub struct RawInbound {
    pub sender_pub_key_ring: PubKeyRing,
    pub bytes: Vec<u8>,
}

/// Decoded inbound message as routed to a trade.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerEnvelope {
    pub sender_pub_key_ring: PubKeyRing,
    pub message: TradeMessage,
}

/// Encrypted direct messaging with mailbox fallback. Transport and encryption stay behind this
/// boundary.
#[async_trait]
pub trait NetworkCollaborator: Send + Sync {
    fn my_node_address(&self) -> NodeAddress;

    async fn send_encrypted_direct_message(
        &self,
        peer: &NodeAddress,
        peer_pub_key_ring: &PubKeyRing,
        bytes: Vec<u8>,
        uid: &str,
    ) -> Result<DeliveryReceipt, EscrowError>;

    async fn remove_mailbox_message(&self, uid: &str) -> Result<(), EscrowError>;

    /// Inbound messages for this node. Only one subscriber is supported.
    async fn subscribe(&self) -> Result<mpsc::Receiver<RawInbound>, EscrowError>;
}
