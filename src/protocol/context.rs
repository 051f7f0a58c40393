use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::messages::{TradeMessage, TradePayload};
use super::protocol::TradeNotif;
use crate::common::{
    config::EngineConfig,
    error::EscrowError,
    types::{KeyRing, MessageState, NodeAddress, PubKeyRing},
};
use crate::comms::{MessageDelivery, NetworkCollaborator, PeerEnvelope};
use crate::trade::{DeliveryStates, OutboundMessage, State, Trade, TradeData};
use crate::wallet::WalletCollaborator;

/// Collaborators shared by every task of every trade. Never persisted.
pub struct ProtocolServices {
    pub wallet: Arc<dyn WalletCollaborator>,
    pub network: Arc<dyn NetworkCollaborator>,
    pub key_ring: Arc<KeyRing>,
    pub config: EngineConfig,
}

/// What a task sees: the trade it works on, the message that triggered the pipeline, and the
/// collaborators.
pub struct TradeContext {
    pub trade: Trade,
    pub services: Arc<ProtocolServices>,
    pub inbound: Option<PeerEnvelope>,
    data: Arc<TradeData>,
    notif_tx: Option<mpsc::Sender<TradeNotif>>,
}

impl TradeContext {
    pub(crate) fn new(
        data: Arc<TradeData>,
        services: Arc<ProtocolServices>,
        inbound: Option<PeerEnvelope>,
        notif_tx: Option<mpsc::Sender<TradeNotif>>,
    ) -> Self {
        Self {
            trade: data.snapshot(),
            services,
            inbound,
            data,
            notif_tx,
        }
    }

    pub fn my_node_address(&self) -> NodeAddress {
        self.services.network.my_node_address()
    }

    pub fn my_pub_key_ring(&self) -> PubKeyRing {
        self.services.key_ring.pub_key_ring()
    }

    /// Payload of the triggering peer message.
    pub fn inbound_payload(&self) -> Result<&TradePayload, EscrowError> {
        self.inbound
            .as_ref()
            .map(|envelope| &envelope.message.payload)
            .ok_or_else(|| {
                EscrowError::Simple(format!(
                    "Trade w/ TradeUUID {} has no inbound message for this task",
                    self.trade.id
                ))
            })
    }

    /// Writes the working copy back to the shared trade and persists it.
    pub fn checkpoint(&mut self) -> Result<(), EscrowError> {
        *self.data.write() = self.trade.clone();
        self.data.persist_now()
    }

    pub async fn set_state(&mut self, state: State) -> Result<(), EscrowError> {
        let previous = self.trade.state();
        self.trade.set_state(state)?;
        self.checkpoint()?;
        if previous != state {
            info!(
                "Trade w/ TradeUUID {} state {} -> {}",
                self.trade.id, previous, state
            );
            self.notify(TradeNotif::StateChanged {
                trade_id: self.trade.id,
                state,
            })
            .await;
        }
        Ok(())
    }

    pub async fn notify(&self, notif: TradeNotif) {
        if let Some(notif_tx) = &self.notif_tx {
            if let Err(error) = notif_tx.send(notif).await {
                warn!(
                    "Trade w/ TradeUUID {} failed to send notification - {}",
                    self.trade.id, error
                );
            }
        }
    }

    fn peer_route(&self) -> Result<(NodeAddress, PubKeyRing), EscrowError> {
        let peer = &self.trade.process_model.trading_peer;
        let (Some(node_address), Some(pub_key_ring)) =
            (peer.node_address.clone(), peer.pub_key_ring)
        else {
            return Err(EscrowError::MessageDelivery(format!(
                "Trade w/ TradeUUID {} has no route to its peer",
                self.trade.id
            )));
        };
        Ok((node_address, pub_key_ring))
    }

    /// Sends a new message to the trading peer and waits for the delivery receipt.
    pub async fn send_and_await(
        &mut self,
        payload: TradePayload,
        delivery_states: DeliveryStates,
    ) -> Result<(), EscrowError> {
        let message = TradeMessage::new(
            self.trade.id,
            self.my_node_address(),
            self.trade.offer.protocol_version,
            payload,
        );
        self.send_outbound(OutboundMessage {
            message,
            state: MessageState::Undefined,
            delivery_states,
        })
        .await
    }

    /// Sends `outbound` keeping its uid, so a resend after a restart is recognised as the same
    /// message. A failed delivery records the error and fails the task.
    pub async fn send_outbound(&mut self, mut outbound: OutboundMessage) -> Result<(), EscrowError> {
        let (peer_node_address, peer_pub_key_ring) = self.peer_route()?;
        let name = outbound.message.payload.name();
        let uid = outbound.message.uid.clone();
        let bytes = outbound.message.encode()?;

        outbound.state = MessageState::Sent;
        let delivery_states = outbound.delivery_states;
        self.trade.process_model.last_outbound = Some(outbound);
        self.trade.process_model.set_message_state(name, MessageState::Sent);
        match delivery_states.sent {
            Some(state) => self.set_state(state).await?,
            None => self.checkpoint()?,
        }

        debug!(
            "Trade w/ TradeUUID {} sending {} with uid {} to {}",
            self.trade.id, name, uid, peer_node_address
        );
        let network = self.services.network.clone();
        let delivery = tokio::spawn(async move {
            let receipt = network
                .send_encrypted_direct_message(&peer_node_address, &peer_pub_key_ring, bytes, &uid)
                .await?;
            receipt.wait().await
        })
        .await?;

        let (message_state, trade_state) = match &delivery {
            Ok(MessageDelivery::Arrived) => (MessageState::Arrived, delivery_states.arrived),
            Ok(MessageDelivery::StoredInMailbox) => (
                MessageState::StoredInMailbox,
                delivery_states.stored_in_mailbox,
            ),
            Err(_) => (MessageState::Failed, delivery_states.send_failed),
        };

        self.trade
            .process_model
            .set_message_state(name, message_state);
        if let Some(last_outbound) = self.trade.process_model.last_outbound.as_mut() {
            last_outbound.state = message_state;
        }
        if let Err(error) = &delivery {
            error!(
                "Trade w/ TradeUUID {} failed to deliver {} - {}",
                self.trade.id, name, error
            );
            self.trade.error_message = Some(error.to_string());
        }
        match trade_state {
            Some(state) => self.set_state(state).await?,
            None => self.checkpoint()?,
        }

        delivery.map(|_| ())
    }

    /// Acknowledges a processed peer message without waiting for delivery.
    pub(crate) fn send_ack(&self, acked: &TradeMessage, error_message: Option<String>) {
        let (peer_node_address, peer_pub_key_ring) = match self.peer_route() {
            Ok(route) => route,
            Err(error) => {
                warn!(
                    "Trade w/ TradeUUID {} cannot ack {} - {}",
                    self.trade.id, acked.uid, error
                );
                return;
            }
        };
        let ack = TradeMessage::ack(
            self.trade.id,
            self.my_node_address(),
            self.trade.offer.protocol_version,
            acked,
            error_message,
        );
        let bytes = match ack.encode() {
            Ok(bytes) => bytes,
            Err(error) => {
                error!(
                    "Trade w/ TradeUUID {} failed to encode ack - {}",
                    self.trade.id, error
                );
                return;
            }
        };

        let trade_id = self.trade.id;
        let network = self.services.network.clone();
        tokio::spawn(async move {
            let result = match network
                .send_encrypted_direct_message(&peer_node_address, &peer_pub_key_ring, bytes, &ack.uid)
                .await
            {
                Ok(receipt) => receipt.wait().await.map(|_| ()),
                Err(error) => Err(error),
            };
            if let Err(error) = result {
                warn!(
                    "Trade w/ TradeUUID {} ack for {} not delivered - {}",
                    trade_id, ack.payload.name(), error
                );
            }
        });
    }
}
