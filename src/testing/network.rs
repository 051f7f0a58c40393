use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::common::{
    error::EscrowError,
    types::{NodeAddress, PubKeyRing},
};
use crate::comms::{DeliveryReceipt, MessageDelivery, NetworkCollaborator, RawInbound};
use crate::protocol::messages::TradeMessage;

const INBOUND_CHANNEL_SIZE: usize = 100;

type ReceiptTx = oneshot::Sender<Result<MessageDelivery, String>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FaultKind {
    /// Receipt resolves with a transport fault.
    Fail,
    /// Message is swallowed and the receipt never resolves.
    Hold,
}

struct Fault {
    payload_name: String,
    kind: FaultKind,
    remaining: usize,
}

struct Node {
    inbound_tx: Option<mpsc::Sender<RawInbound>>,
    online: bool,
    mailbox: Vec<(String, RawInbound)>,
    delivered: Vec<(&'static str, RawInbound)>,
    faults: Vec<Fault>,
    sent: Vec<(String, &'static str)>,
    removed_uids: Vec<String>,
}

impl Node {
    fn new() -> Self {
        Self {
            inbound_tx: None,
            online: true,
            mailbox: Vec::new(),
            delivered: Vec::new(),
            faults: Vec::new(),
            sent: Vec::new(),
            removed_uids: Vec::new(),
        }
    }

    /// Mailbox entries stay until the recipient removes them, so a node coming back online sees
    /// them again.
    fn deliver_mailbox(&mut self, address: &NodeAddress) {
        let Some(inbound_tx) = self.inbound_tx.as_ref() else {
            return;
        };
        for (uid, inbound) in self.mailbox.iter() {
            if let Err(error) = inbound_tx.try_send(inbound.clone()) {
                warn!(
                    "Loopback node {} mailbox delivery of {} failed - {}",
                    address, uid, error
                );
            }
        }
    }

    fn take_fault(&mut self, payload_name: &str) -> Option<FaultKind> {
        let fault = self
            .faults
            .iter_mut()
            .find(|fault| fault.payload_name == payload_name && fault.remaining > 0)?;
        fault.remaining -= 1;
        Some(fault.kind)
    }
}

#[derive(Default)]
struct HubState {
    nodes: HashMap<NodeAddress, Node>,
    held_receipts: Vec<ReceiptTx>,
}

impl HubState {
    fn node(&mut self, address: &NodeAddress) -> &mut Node {
        self.nodes.entry(address.clone()).or_insert_with(Node::new)
    }
}

enum SendOutcome {
    Resolved(Result<MessageDelivery, String>),
    Held,
}

fn payload_name_of(bytes: &[u8]) -> &'static str {
    TradeMessage::decode(bytes)
        .map(|message| message.payload.name())
        .unwrap_or("Undecodable")
}

/// In-process network joining any number of nodes. Offline nodes get messages in their mailbox.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network endpoint for `node_address`. A second call for the same address stands for the
    /// node restarting.
    pub fn network(
        &self,
        node_address: NodeAddress,
        pub_key_ring: PubKeyRing,
    ) -> Arc<LoopbackNetwork> {
        self.state.lock().unwrap().node(&node_address);
        Arc::new(LoopbackNetwork {
            hub: self.clone(),
            node_address,
            pub_key_ring,
        })
    }

    pub fn set_online(&self, node_address: &NodeAddress, online: bool) {
        let mut state = self.state.lock().unwrap();
        let node = state.node(node_address);
        node.online = online;
        if online {
            node.deliver_mailbox(node_address);
        }
    }

    /// The next `count` sends of `payload_name` from `node_address` fault.
    pub fn fail_sends_of(&self, node_address: &NodeAddress, payload_name: &str, count: usize) {
        self.add_fault(node_address, payload_name, FaultKind::Fail, count);
    }

    /// The next `count` sends of `payload_name` from `node_address` never get a receipt.
    pub fn hold_sends_of(&self, node_address: &NodeAddress, payload_name: &str, count: usize) {
        self.add_fault(node_address, payload_name, FaultKind::Hold, count);
    }

    fn add_fault(&self, node_address: &NodeAddress, payload_name: &str, kind: FaultKind, count: usize) {
        self.state.lock().unwrap().node(node_address).faults.push(Fault {
            payload_name: payload_name.to_string(),
            kind,
            remaining: count,
        });
    }

    /// Hands the last `payload_name` delivered to `node_address` over once more.
    pub fn redeliver_last(&self, node_address: &NodeAddress, payload_name: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let node = state.node(node_address);
        let Some((_, inbound)) = node
            .delivered
            .iter()
            .rev()
            .find(|(name, _)| *name == payload_name)
        else {
            return false;
        };
        match node.inbound_tx.as_ref() {
            Some(inbound_tx) => inbound_tx.try_send(inbound.clone()).is_ok(),
            None => false,
        }
    }

    /// Hands the last `payload_name` delivered to `node_address` over again after `edit` rewrote
    /// it. The sender key is kept.
    pub fn redeliver_last_with(
        &self,
        node_address: &NodeAddress,
        payload_name: &str,
        edit: impl FnOnce(&mut TradeMessage),
    ) -> bool {
        let mut state = self.state.lock().unwrap();
        let node = state.node(node_address);
        let Some((_, inbound)) = node
            .delivered
            .iter()
            .rev()
            .find(|(name, _)| *name == payload_name)
        else {
            return false;
        };
        let Ok(mut message) = TradeMessage::decode(&inbound.bytes) else {
            return false;
        };
        edit(&mut message);
        let Ok(bytes) = message.encode() else {
            return false;
        };
        let edited = RawInbound {
            sender_pub_key_ring: inbound.sender_pub_key_ring,
            bytes,
        };
        match node.inbound_tx.as_ref() {
            Some(inbound_tx) => inbound_tx.try_send(edited).is_ok(),
            None => false,
        }
    }

    /// Uid and payload name of every message `node_address` sent, faulted sends included.
    pub fn sent_messages(&self, node_address: &NodeAddress) -> Vec<(String, String)> {
        self.state
            .lock()
            .unwrap()
            .node(node_address)
            .sent
            .iter()
            .map(|(uid, name)| (uid.clone(), name.to_string()))
            .collect()
    }

    pub fn sent_uids_of(&self, node_address: &NodeAddress, payload_name: &str) -> Vec<String> {
        self.sent_messages(node_address)
            .into_iter()
            .filter(|(_, name)| name == payload_name)
            .map(|(uid, _)| uid)
            .collect()
    }

    pub fn removed_mailbox_uids(&self, node_address: &NodeAddress) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .node(node_address)
            .removed_uids
            .clone()
    }

    pub fn mailbox_len(&self, node_address: &NodeAddress) -> usize {
        self.state.lock().unwrap().node(node_address).mailbox.len()
    }

    fn send(&self, from: &NodeAddress, to: &NodeAddress, uid: &str, inbound: RawInbound) -> SendOutcome {
        let payload_name = payload_name_of(&inbound.bytes);
        let mut state = self.state.lock().unwrap();
        let sender = state.node(from);
        sender.sent.push((uid.to_string(), payload_name));
        match sender.take_fault(payload_name) {
            Some(FaultKind::Fail) => {
                return SendOutcome::Resolved(Err(format!(
                    "Loopback send of {} from {} faulted",
                    uid, from
                )))
            }
            Some(FaultKind::Hold) => {
                debug!("Loopback send of {} from {} held", uid, from);
                return SendOutcome::Held;
            }
            None => {}
        }

        let recipient = state.node(to);
        if recipient.online {
            if let Some(inbound_tx) = recipient.inbound_tx.as_ref() {
                if inbound_tx.try_send(inbound.clone()).is_ok() {
                    recipient.delivered.push((payload_name, inbound));
                    return SendOutcome::Resolved(Ok(MessageDelivery::Arrived));
                }
            }
        }

        debug!("Loopback message {} for {} stored in mailbox", uid, to);
        recipient.mailbox.push((uid.to_string(), inbound));
        SendOutcome::Resolved(Ok(MessageDelivery::StoredInMailbox))
    }
}

pub struct LoopbackNetwork {
    hub: LoopbackHub,
    node_address: NodeAddress,
    pub_key_ring: PubKeyRing,
}

#[async_trait]
impl NetworkCollaborator for LoopbackNetwork {
    fn my_node_address(&self) -> NodeAddress {
        self.node_address.clone()
    }

    async fn send_encrypted_direct_message(
        &self,
        peer: &NodeAddress,
        _peer_pub_key_ring: &PubKeyRing,
        bytes: Vec<u8>,
        uid: &str,
    ) -> Result<DeliveryReceipt, EscrowError> {
        let inbound = RawInbound {
            sender_pub_key_ring: self.pub_key_ring,
            bytes,
        };
        let (receipt_tx, receipt) = DeliveryReceipt::new();
        match self.hub.send(&self.node_address, peer, uid, inbound) {
            SendOutcome::Resolved(result) => {
                // Receipt owner may already be gone
                let _ = receipt_tx.send(result);
            }
            SendOutcome::Held => self.hub.state.lock().unwrap().held_receipts.push(receipt_tx),
        }
        Ok(receipt)
    }

    async fn remove_mailbox_message(&self, uid: &str) -> Result<(), EscrowError> {
        let mut state = self.hub.state.lock().unwrap();
        let node = state.node(&self.node_address);
        node.mailbox.retain(|(entry_uid, _)| entry_uid != uid);
        node.removed_uids.push(uid.to_string());
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<RawInbound>, EscrowError> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let mut state = self.hub.state.lock().unwrap();
        let node = state.node(&self.node_address);
        node.inbound_tx = Some(inbound_tx);
        if node.online {
            node.deliver_mailbox(&self.node_address);
        }
        Ok(inbound_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SomeTestTradeParams;

    #[tokio::test]
    async fn offline_node_receives_mailbox_on_return() {
        let hub = LoopbackHub::new();
        let maker_address = SomeTestTradeParams::maker_node_address();
        let taker = hub.network(
            SomeTestTradeParams::taker_node_address(),
            SomeTestTradeParams::taker_key_ring().pub_key_ring(),
        );
        let maker = hub.network(
            maker_address.clone(),
            SomeTestTradeParams::maker_key_ring().pub_key_ring(),
        );
        let mut maker_rx = maker.subscribe().await.unwrap();

        hub.set_online(&maker_address, false);
        let receipt = taker
            .send_encrypted_direct_message(
                &maker_address,
                &SomeTestTradeParams::maker_key_ring().pub_key_ring(),
                vec![1, 2, 3],
                "uid-1",
            )
            .await
            .unwrap();
        assert_eq!(receipt.wait().await.unwrap(), MessageDelivery::StoredInMailbox);
        assert!(maker_rx.try_recv().is_err());

        hub.set_online(&maker_address, true);
        let inbound = maker_rx.recv().await.unwrap();
        assert_eq!(inbound.bytes, vec![1, 2, 3]);
        assert_eq!(
            inbound.sender_pub_key_ring,
            SomeTestTradeParams::taker_key_ring().pub_key_ring()
        );

        maker.remove_mailbox_message("uid-1").await.unwrap();
        assert_eq!(hub.mailbox_len(&maker_address), 0);
        assert_eq!(hub.removed_mailbox_uids(&maker_address), vec!["uid-1".to_string()]);
    }

    #[tokio::test]
    async fn injected_fault_fails_the_receipt() {
        let hub = LoopbackHub::new();
        let taker_address = SomeTestTradeParams::taker_node_address();
        let taker = hub.network(
            taker_address.clone(),
            SomeTestTradeParams::taker_key_ring().pub_key_ring(),
        );

        hub.fail_sends_of(&taker_address, "Undecodable", 1);
        let receipt = taker
            .send_encrypted_direct_message(
                &SomeTestTradeParams::maker_node_address(),
                &SomeTestTradeParams::maker_key_ring().pub_key_ring(),
                vec![],
                "uid-1",
            )
            .await
            .unwrap();
        assert!(matches!(
            receipt.wait().await,
            Err(EscrowError::MessageDelivery(_))
        ));
        assert_eq!(
            hub.sent_uids_of(&taker_address, "Undecodable"),
            vec!["uid-1".to_string()]
        );
    }
}
