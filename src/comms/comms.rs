use std::sync::Arc;

use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::network::{NetworkCollaborator, PeerEnvelope, RawInbound};
use super::router::Router;
use crate::common::{error::EscrowError, types::NodeAddress};
use crate::protocol::messages::TradeMessage;

#[derive(Clone)]
pub(crate) struct CommsAccess {
    tx: mpsc::Sender<CommsRequest>,
}

impl CommsAccess {
    pub(super) fn new(tx: mpsc::Sender<CommsRequest>) -> Self {
        Self { tx }
    }

    pub(crate) async fn get_node_address(&self) -> Result<NodeAddress, EscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<NodeAddress>();
        let request = CommsRequest::GetNodeAddress { rsp_tx };
        self.tx.send(request).await?;
        Ok(rsp_rx.await?)
    }

    pub(crate) async fn register_peer_message_tx(
        &self,
        trade_uuid: Uuid,
        tx: mpsc::Sender<PeerEnvelope>,
    ) -> Result<(), EscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), EscrowError>>();
        let request = CommsRequest::RegisterTradeTx {
            trade_uuid,
            tx,
            rsp_tx,
        };
        self.tx.send(request).await?;
        rsp_rx.await?
    }

    pub(crate) async fn unregister_peer_message_tx(
        &self,
        trade_uuid: Uuid,
    ) -> Result<(), EscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), EscrowError>>();
        let request = CommsRequest::UnregisterTradeTx { trade_uuid, rsp_tx };
        self.tx.send(request).await?;
        rsp_rx.await?
    }

    pub(crate) async fn register_peer_message_fallback_tx(
        &self,
        tx: mpsc::Sender<PeerEnvelope>,
    ) -> Result<(), EscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), EscrowError>>();
        let request = CommsRequest::RegisterFallbackTx { tx, rsp_tx };
        self.tx.send(request).await?;
        rsp_rx.await?
    }

    pub(crate) async fn unregister_peer_message_fallback_tx(&self) -> Result<(), EscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), EscrowError>>();
        let request = CommsRequest::UnregisterFallbackTx { rsp_tx };
        self.tx.send(request).await?;
        rsp_rx.await?
    }

    pub(crate) async fn shutdown(&self) -> Result<(), EscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), EscrowError>>();
        let request = CommsRequest::Shutdown { rsp_tx };
        self.tx.send(request).await?;
        rsp_rx.await?
    }
}

pub(crate) struct Comms {
    tx: mpsc::Sender<CommsRequest>,
    pub(crate) task_handle: tokio::task::JoinHandle<()>,
}

impl Comms {
    const COMMS_REQUEST_CHANNEL_SIZE: usize = 100;

    pub(crate) async fn new(network: Arc<dyn NetworkCollaborator>) -> Result<Self, EscrowError> {
        let inbound_rx = network.subscribe().await?;
        let (tx, rx) = mpsc::channel::<CommsRequest>(Self::COMMS_REQUEST_CHANNEL_SIZE);
        let actor = CommsActor::new(rx, inbound_rx, network.my_node_address());
        let task_handle = tokio::spawn(async move { actor.run().await });
        Ok(Self { tx, task_handle })
    }

    pub(crate) fn new_accessor(&self) -> CommsAccess {
        CommsAccess::new(self.tx.clone())
    }
}

pub(super) enum CommsRequest {
    GetNodeAddress {
        rsp_tx: oneshot::Sender<NodeAddress>,
    },
    RegisterTradeTx {
        trade_uuid: Uuid,
        tx: mpsc::Sender<PeerEnvelope>,
        rsp_tx: oneshot::Sender<Result<(), EscrowError>>,
    },
    UnregisterTradeTx {
        trade_uuid: Uuid,
        rsp_tx: oneshot::Sender<Result<(), EscrowError>>,
    },
    RegisterFallbackTx {
        tx: mpsc::Sender<PeerEnvelope>,
        rsp_tx: oneshot::Sender<Result<(), EscrowError>>,
    },
    UnregisterFallbackTx {
        rsp_tx: oneshot::Sender<Result<(), EscrowError>>,
    },
    Shutdown {
        rsp_tx: oneshot::Sender<Result<(), EscrowError>>,
    },
}

pub(super) struct CommsActor {
    rx: mpsc::Receiver<CommsRequest>,
    inbound_rx: mpsc::Receiver<RawInbound>,
    node_address: NodeAddress,
    router: Router,
}

impl CommsActor {
    pub(super) fn new(
        rx: mpsc::Receiver<CommsRequest>,
        inbound_rx: mpsc::Receiver<RawInbound>,
        node_address: NodeAddress,
    ) -> Self {
        CommsActor {
            rx,
            inbound_rx,
            node_address,
            router: Router::new(),
        }
    }

    async fn run(mut self) {
        // !!! This function will end if no Sender remains for the Receiver
        loop {
            select! {
                Some(request) = self.rx.recv() => {
                    if self.handle_request(request).await {
                        break;
                    }
                },
                Some(inbound) = self.inbound_rx.recv() => {
                    self.handle_inbound(inbound).await;
                },
                else => break,
            }
        }
        info!("Comms w/ node address {} terminating", self.node_address);
    }

    async fn handle_request(&mut self, request: CommsRequest) -> bool {
        let mut terminate = false;

        match request {
            CommsRequest::GetNodeAddress { rsp_tx } => {
                rsp_tx.send(self.node_address.clone()).unwrap(); // oneshot should never fail
            }

            // Router management
            CommsRequest::RegisterTradeTx {
                trade_uuid,
                tx,
                rsp_tx,
            } => {
                let result = self.router.register_peer_message_tx(trade_uuid, tx);
                rsp_tx.send(result).unwrap(); // oneshot should never fail
            }

            CommsRequest::UnregisterTradeTx { trade_uuid, rsp_tx } => {
                let result = self.router.unregister_peer_message_tx(trade_uuid);
                rsp_tx.send(result).unwrap(); // oneshot should never fail
            }

            CommsRequest::RegisterFallbackTx { tx, rsp_tx } => {
                let result = self.router.register_peer_message_fallback_tx(tx);
                rsp_tx.send(result).unwrap(); // oneshot should never fail
            }

            CommsRequest::UnregisterFallbackTx { rsp_tx } => {
                let result = self.router.unregister_peer_message_fallback_tx();
                rsp_tx.send(result).unwrap(); // oneshot should never fail
            }

            CommsRequest::Shutdown { rsp_tx } => {
                info!("Comms w/ node address {} Shutdown", self.node_address);
                rsp_tx.send(Ok(())).unwrap(); // oneshot should never fail
                terminate = true;
            }
        }
        terminate
    }

    async fn handle_inbound(&mut self, inbound: RawInbound) {
        let message = match TradeMessage::decode(&inbound.bytes) {
            Ok(message) => message,
            Err(error) => {
                warn!(
                    "Comms w/ node address {} dropped inbound of {} bytes - {}",
                    self.node_address,
                    inbound.bytes.len(),
                    error
                );
                return;
            }
        };

        debug!(
            "Comms w/ node address {} received {} with uid {} for TradeUUID {}",
            self.node_address,
            message.payload.name(),
            message.uid,
            message.trade_id
        );

        let envelope = PeerEnvelope {
            sender_pub_key_ring: inbound.sender_pub_key_ring,
            message,
        };
        if let Err(error) = self.router.route(envelope).await {
            error!(
                "Comms w/ node address {} failed to route peer message - {}",
                self.node_address, error
            );
        }
    }
}
