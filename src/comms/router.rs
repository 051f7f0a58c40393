use std::collections::HashMap;
use tracing::debug;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::network::PeerEnvelope;
use crate::common::error::EscrowError;

pub(super) struct Router {
    peer_message_tx_map: HashMap<Uuid, mpsc::Sender<PeerEnvelope>>,
    peer_message_fallback_tx: Option<mpsc::Sender<PeerEnvelope>>,
}

impl Router {
    pub(super) fn new() -> Self {
        Router {
            peer_message_tx_map: HashMap::new(),
            peer_message_fallback_tx: None,
        }
    }

    pub(super) fn register_peer_message_tx(
        &mut self,
        trade_uuid: Uuid,
        tx: mpsc::Sender<PeerEnvelope>,
    ) -> Result<(), EscrowError> {
        debug!("register_peer_message_tx() for {}", trade_uuid);
        if self.peer_message_tx_map.contains_key(&trade_uuid) {
            return Err(EscrowError::Simple(format!(
                "register_peer_message_tx() for {} already registered",
                trade_uuid
            )));
        }
        self.peer_message_tx_map.insert(trade_uuid, tx);
        Ok(())
    }

    pub(super) fn unregister_peer_message_tx(
        &mut self,
        trade_uuid: Uuid,
    ) -> Result<(), EscrowError> {
        debug!("unregister_peer_message_tx() for {}", trade_uuid);
        if self.peer_message_tx_map.remove(&trade_uuid).is_none() {
            return Err(EscrowError::Simple(format!(
                "unregister_peer_message_tx() {} expected to already be registered",
                trade_uuid
            )));
        }
        Ok(())
    }

    pub(super) fn register_peer_message_fallback_tx(
        &mut self,
        tx: mpsc::Sender<PeerEnvelope>,
    ) -> Result<(), EscrowError> {
        debug!("register_peer_message_fallback_tx()");

        let mut result = Ok(());
        if self.peer_message_fallback_tx.is_some() {
            result = Err(EscrowError::Simple(
                "register_peer_message_fallback_tx() already registered".to_string(),
            ));
        }
        self.peer_message_fallback_tx = Some(tx);
        result
    }

    pub(super) fn unregister_peer_message_fallback_tx(&mut self) -> Result<(), EscrowError> {
        debug!("unregister_peer_message_fallback_tx()");

        let mut result = Ok(());
        if self.peer_message_fallback_tx.is_none() {
            result = Err(EscrowError::Simple(
                "unregister_peer_message_fallback_tx() expected to already be registered"
                    .to_string(),
            ));
        }
        self.peer_message_fallback_tx = None;
        result
    }

    /// Hands the envelope to the trade it belongs to, or to the fallback for unknown trades.
    pub(super) async fn route(&mut self, envelope: PeerEnvelope) -> Result<(), EscrowError> {
        let trade_uuid = envelope.message.trade_id;

        if let Some(tx) = self.peer_message_tx_map.get(&trade_uuid) {
            tx.send(envelope).await?;
            return Ok(());
        }

        if let Some(tx) = &self.peer_message_fallback_tx {
            tx.send(envelope).await?;
            return Ok(());
        }

        Err(EscrowError::Simple(format!(
            "No channel Tx registered for peer message of trade {}",
            trade_uuid
        )))
    }
}
