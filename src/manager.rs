use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};

use secp256k1::SecretKey;
use tokio::select;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::common::{
    config::EngineConfig,
    error::EscrowError,
    types::{Coin, KeyRing, NodeAddress, PaymentAccountPayload},
};
use crate::comms::{Comms, CommsAccess, NetworkCollaborator, PeerEnvelope};
use crate::persistence::{
    CorruptedStorageFileHandler, PersistenceManager, PersistenceRegistry, Priority,
};
use crate::proof::{ProofRequestRegistry, ProofResult, ProofService};
use crate::protocol::messages::{TradePayload, MIN_PROTOCOL_VERSION};
use crate::protocol::{ProtocolServices, TradeAccess, TradeProtocol};
use crate::trade::{
    file_name_for, ClosedTrades, Offer, ProcessModel, Trade, TradeData, CLOSED_TRADES_FILE_NAME,
    FILE_PREFIX,
};
use crate::wallet::WalletCollaborator;

const CLOSED_CHANNEL_SIZE: usize = 20;
const FALLBACK_CHANNEL_SIZE: usize = 20;

/// Account a maker trades an offer with.
#[derive(Clone, Debug)]
pub struct MakerParams {
    pub account_id: String,
    pub payment_account_payload: Box<dyn PaymentAccountPayload>,
}

impl MakerParams {
    fn process_model(&self) -> Result<ProcessModel, EscrowError> {
        process_model_for(&self.account_id, self.payment_account_payload.as_ref())
    }
}

/// Account and amount a taker takes an offer with.
#[derive(Clone, Debug)]
pub struct TakerParams {
    pub account_id: String,
    pub payment_account_payload: Box<dyn PaymentAccountPayload>,
    pub amount: Coin,
}

impl TakerParams {
    fn process_model(&self) -> Result<ProcessModel, EscrowError> {
        process_model_for(&self.account_id, self.payment_account_payload.as_ref())
    }
}

fn process_model_for(
    account_id: &str,
    payload: &(dyn PaymentAccountPayload + 'static),
) -> Result<ProcessModel, EscrowError> {
    Ok(ProcessModel::new(
        account_id,
        payload.hash()?,
        payload.payment_method_id(),
    ))
}

struct OpenOffer {
    offer: Offer,
    params: MakerParams,
}

/// State shared between the manager, the fallback listener and the archiver.
struct ManagerCore {
    services: Arc<ProtocolServices>,
    registry: Arc<PersistenceRegistry>,
    comms_accessor: CommsAccess,
    closed_tx: mpsc::Sender<Trade>,
    open_offers: RwLock<HashMap<Uuid, OpenOffer>>,
    protocols: RwLock<HashMap<Uuid, TradeProtocol>>,
    closed_trades: Arc<StdRwLock<ClosedTrades>>,
    closed_persistence: Arc<PersistenceManager<ClosedTrades>>,
}

impl ManagerCore {
    async fn spawn_protocol(
        &self,
        data: TradeData,
        initial: Option<PeerEnvelope>,
    ) -> Result<TradeAccess, EscrowError> {
        let trade_uuid = data.trade_uuid;
        let protocol = TradeProtocol::new(
            Arc::new(data),
            self.services.clone(),
            self.comms_accessor.clone(),
            self.closed_tx.clone(),
            initial,
        )
        .await?;
        let access = protocol.new_accessor();
        self.protocols.write().await.insert(trade_uuid, protocol);
        Ok(access)
    }

    fn is_closed(&self, trade_id: &Uuid) -> bool {
        self.closed_trades
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(trade_id)
    }

    /// Moves a terminal trade into the archive. The pending file goes only once the archive is on
    /// disk.
    fn archive(&self, trade: Trade) -> Result<(), EscrowError> {
        let trade_id = trade.id;
        let state = trade.state();
        let added = self
            .closed_trades
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add(trade);
        if added {
            self.closed_persistence.persist_now()?;
            info!(
                "Trade w/ TradeUUID {} archived in state {}",
                trade_id, state
            );
        } else {
            debug!("Trade w/ TradeUUID {} already archived", trade_id);
        }
        self.registry.delete_persisted(&file_name_for(&trade_id))
    }

    async fn handle_closed(&self, trade: Trade) {
        let trade_id = trade.id;
        if let Err(error) = self.archive(trade) {
            error!(
                "Trade w/ TradeUUID {} failed to archive - {}",
                trade_id, error
            );
        }
        let protocol = self.protocols.write().await.remove(&trade_id);
        if let Some(protocol) = protocol {
            if let Err(error) = protocol.task_handle.await {
                warn!(
                    "Trade w/ TradeUUID {} protocol task ended abnormally - {}",
                    trade_id, error
                );
            }
        }
    }

    /// A peer message for a trade we do not run yet. Only a taker's request for one of our open
    /// offers starts a new trade.
    async fn handle_fallback(&self, envelope: PeerEnvelope) {
        let trade_id = envelope.message.trade_id;
        let TradePayload::InputsForDepositTxRequest(request) = &envelope.message.payload else {
            warn!(
                "Trade w/ TradeUUID {} unexpected {} for unknown trade dropped",
                trade_id,
                envelope.message.payload.name()
            );
            return;
        };
        if self.is_closed(&trade_id) {
            warn!(
                "Trade w/ TradeUUID {} already closed, request dropped",
                trade_id
            );
            return;
        }

        let Some(open_offer) = self.open_offers.write().await.remove(&trade_id) else {
            warn!(
                "Trade w/ TradeUUID {} request for an offer we do not have open",
                trade_id
            );
            return;
        };

        let amount = request.trade_amount;
        let result = match open_offer.params.process_model() {
            Ok(process_model) => {
                Trade::new(open_offer.offer.clone(), true, amount, process_model).and_then(
                    |trade| TradeData::new(&self.registry, trade),
                )
            }
            Err(error) => Err(error),
        };
        let data = match result {
            Ok(data) => data,
            Err(error) => {
                warn!(
                    "Trade w/ TradeUUID {} offer not taken - {}",
                    trade_id, error
                );
                self.open_offers.write().await.insert(trade_id, open_offer);
                return;
            }
        };

        info!(
            "Trade w/ TradeUUID {} offer taken for {}",
            trade_id, amount
        );
        if let Err(error) = self.spawn_protocol(data, Some(envelope)).await {
            error!(
                "Trade w/ TradeUUID {} failed to start maker protocol - {}",
                trade_id, error
            );
        }
    }
}

/// Process root. Owns comms, persistence and one protocol actor per pending trade.
pub struct Manager {
    core: Arc<ManagerCore>,
    comms: Comms,
    proof_registry: Option<Arc<ProofRequestRegistry>>,
    fallback_handle: tokio::task::JoinHandle<()>,
    archive_handle: tokio::task::JoinHandle<()>,
    archive_shutdown_tx: oneshot::Sender<()>,
}

impl Manager {
    // Constructors

    pub async fn new_with_key(
        key: SecretKey,
        config: EngineConfig,
        wallet: Arc<dyn WalletCollaborator>,
        network: Arc<dyn NetworkCollaborator>,
        corruption_handler: Arc<dyn CorruptedStorageFileHandler>,
    ) -> Result<Manager, EscrowError> {
        config.validate()?;
        let registry = PersistenceRegistry::new(&config.data_dir, corruption_handler)?;

        let closed_trades = registry
            .read_persisted::<ClosedTrades>(CLOSED_TRADES_FILE_NAME)?
            .unwrap_or_default();
        let closed_trades = Arc::new(StdRwLock::new(closed_trades));
        let closed_persistence = PersistenceManager::initialize(
            &registry,
            closed_trades.clone(),
            CLOSED_TRADES_FILE_NAME,
            Priority::Private,
        )?;

        let comms = Comms::new(network.clone()).await?;
        let comms_accessor = comms.new_accessor();
        let (fallback_tx, fallback_rx) = mpsc::channel::<PeerEnvelope>(FALLBACK_CHANNEL_SIZE);
        comms_accessor
            .register_peer_message_fallback_tx(fallback_tx)
            .await?;

        let key_ring = KeyRing::new(key);
        info!(
            "Manager w/ node address {} starting with data dir {}",
            comms_accessor.get_node_address().await?,
            config.data_dir.display()
        );
        let services = Arc::new(ProtocolServices {
            wallet,
            network,
            key_ring: Arc::new(key_ring),
            config,
        });

        let (closed_tx, closed_rx) = mpsc::channel::<Trade>(CLOSED_CHANNEL_SIZE);
        let core = Arc::new(ManagerCore {
            services,
            registry,
            comms_accessor,
            closed_tx,
            open_offers: RwLock::new(HashMap::new()),
            protocols: RwLock::new(HashMap::new()),
            closed_trades,
            closed_persistence,
        });

        let (archive_shutdown_tx, archive_shutdown_rx) = oneshot::channel::<()>();
        let archive_core = core.clone();
        let archive_handle = tokio::spawn(async move {
            Self::run_archiver(archive_core, closed_rx, archive_shutdown_rx).await
        });
        let fallback_core = core.clone();
        let fallback_handle =
            tokio::spawn(async move { Self::run_fallback(fallback_core, fallback_rx).await });

        let manager = Manager {
            core,
            comms,
            proof_registry: None,
            fallback_handle,
            archive_handle,
            archive_shutdown_tx,
        };
        manager.restore_pending_trades().await?;
        Ok(manager)
    }

    /// Enables `start_payment_proof` with the given verification service.
    pub fn with_proof_service(mut self, service: Arc<dyn ProofService>) -> Self {
        self.proof_registry = Some(Arc::new(ProofRequestRegistry::with_config(
            service,
            &self.core.services.config,
        )));
        self
    }

    async fn restore_pending_trades(&self) -> Result<(), EscrowError> {
        let core = &self.core;
        for file_name in core.registry.list_files_with_prefix(FILE_PREFIX)? {
            let Some(data) = TradeData::restore(&core.registry, &file_name)? else {
                warn!("Pending trade file {} could not be restored", file_name);
                continue;
            };
            let trade = data.snapshot();
            if trade.state().is_terminal() || core.is_closed(&trade.id) {
                data.close();
                core.archive(trade)?;
                continue;
            }

            info!(
                "Trade w/ TradeUUID {} restored in state {}",
                trade.id,
                trade.state()
            );
            core.spawn_protocol(data, None).await?;
        }
        Ok(())
    }

    async fn run_archiver(
        core: Arc<ManagerCore>,
        mut closed_rx: mpsc::Receiver<Trade>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            select! {
                Some(trade) = closed_rx.recv() => {
                    core.handle_closed(trade).await;
                },
                _ = &mut shutdown_rx => break,
                else => break,
            }
        }
        // Trades that closed while shutting down
        while let Ok(trade) = closed_rx.try_recv() {
            if let Err(error) = core.archive(trade) {
                error!("Failed to archive at shutdown - {}", error);
            }
        }
    }

    async fn run_fallback(core: Arc<ManagerCore>, mut fallback_rx: mpsc::Receiver<PeerEnvelope>) {
        while let Some(envelope) = fallback_rx.recv().await {
            core.handle_fallback(envelope).await;
        }
    }

    // Offer Management

    /// Opens `offer` for takers. The offer is stamped with our configured protocol version.
    pub async fn place_offer(
        &self,
        mut offer: Offer,
        maker_params: MakerParams,
    ) -> Result<(), EscrowError> {
        let trade_id = offer.id;
        offer.protocol_version = self.core.services.config.protocol_version;
        if offer.maker_pub_key_ring != self.core.services.key_ring.pub_key_ring() {
            return Err(EscrowError::Simple(format!(
                "Offer {} names a maker key other than ours",
                trade_id
            )));
        }
        if self.core.protocols.read().await.contains_key(&trade_id) || self.core.is_closed(&trade_id)
        {
            return Err(EscrowError::Simple(format!(
                "Offer {} was already taken",
                trade_id
            )));
        }

        let mut open_offers = self.core.open_offers.write().await;
        if open_offers.contains_key(&trade_id) {
            return Err(EscrowError::Simple(format!(
                "Offer {} already placed",
                trade_id
            )));
        }
        info!(
            "Offer {} placed for {} at protocol version {}",
            trade_id, offer.amount, offer.protocol_version
        );
        open_offers.insert(
            trade_id,
            OpenOffer {
                offer,
                params: maker_params,
            },
        );
        Ok(())
    }

    pub async fn cancel_offer(&self, offer_id: &Uuid) -> Result<Offer, EscrowError> {
        match self.core.open_offers.write().await.remove(offer_id) {
            Some(open_offer) => {
                info!("Offer {} cancelled", offer_id);
                Ok(open_offer.offer)
            }
            None => Err(EscrowError::Simple(format!(
                "Offer {} is not open",
                offer_id
            ))),
        }
    }

    pub async fn open_offers(&self) -> Vec<Offer> {
        self.core
            .open_offers
            .read()
            .await
            .values()
            .map(|open_offer| open_offer.offer.clone())
            .collect()
    }

    // Trade Management

    /// Creates the taker side of a trade. Nothing is sent before `TradeAccess::take_offer`.
    pub async fn take_offer(
        &self,
        offer: Offer,
        taker_params: TakerParams,
    ) -> Result<TradeAccess, EscrowError> {
        let trade_id = offer.id;
        if offer.maker_pub_key_ring == self.core.services.key_ring.pub_key_ring() {
            return Err(EscrowError::Simple(format!(
                "Offer {} is our own",
                trade_id
            )));
        }
        let protocol_version = self.core.services.config.protocol_version;
        if !(MIN_PROTOCOL_VERSION..=protocol_version).contains(&offer.protocol_version) {
            return Err(EscrowError::Simple(format!(
                "Offer {} uses protocol version {}, we speak up to {}",
                trade_id, offer.protocol_version, protocol_version
            )));
        }
        if self.core.protocols.read().await.contains_key(&trade_id) || self.core.is_closed(&trade_id)
        {
            return Err(EscrowError::Simple(format!(
                "Trade w/ TradeUUID {} already exists",
                trade_id
            )));
        }

        let trade = Trade::new(
            offer,
            false,
            taker_params.amount,
            taker_params.process_model()?,
        )?;
        let data = TradeData::new(&self.core.registry, trade)?;
        self.core.spawn_protocol(data, None).await
    }

    pub async fn node_address(&self) -> Result<NodeAddress, EscrowError> {
        self.core.comms_accessor.get_node_address().await
    }

    pub async fn trade_access(&self, trade_id: &Uuid) -> Option<TradeAccess> {
        self.core
            .protocols
            .read()
            .await
            .get(trade_id)
            .map(|protocol| protocol.new_accessor())
    }

    /// Snapshots of every pending trade.
    pub async fn get_trades(&self) -> Vec<Trade> {
        let accessors: Vec<TradeAccess> = self
            .core
            .protocols
            .read()
            .await
            .values()
            .map(|protocol| protocol.new_accessor())
            .collect();

        let mut trades = Vec::with_capacity(accessors.len());
        for access in accessors {
            // A protocol that closed meanwhile shows up in the archive instead
            if let Ok(trade) = access.query_trade().await {
                trades.push(trade);
            }
        }
        trades
    }

    pub fn closed_trades(&self) -> Vec<Trade> {
        self.core
            .closed_trades
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .trades()
            .to_vec()
    }

    /// Seller side: polls the proof service for the buyer's counter currency payment and
    /// releases the payout once it is confirmed. Returns false if polling was already running.
    pub async fn start_payment_proof(
        &self,
        trade_id: Uuid,
        tx_id: impl Into<String>,
    ) -> Result<bool, EscrowError> {
        let Some(proof_registry) = self.proof_registry.as_ref() else {
            return Err(EscrowError::Simple(
                "No proof service configured".to_string(),
            ));
        };
        let Some(access) = self.trade_access(&trade_id).await else {
            return Err(EscrowError::Simple(format!(
                "Trade w/ TradeUUID {} is not pending",
                trade_id
            )));
        };
        if access.query_trade().await?.is_buyer() {
            return Err(EscrowError::Simple(format!(
                "Trade w/ TradeUUID {} payment proof is checked by the seller",
                trade_id
            )));
        }

        Ok(proof_registry.request(trade_id, tx_id, move |result| match result {
            ProofResult::Confirmed => {
                tokio::spawn(async move {
                    if let Err(error) = access.payment_proof_confirmed().await {
                        error!(
                            "Trade w/ TradeUUID {} payout after proof failed - {}",
                            trade_id, error
                        );
                    }
                });
            }
            other => warn!(
                "Trade w/ TradeUUID {} payment proof {}, waiting for manual confirmation",
                trade_id, other
            ),
        }))
    }

    pub fn stop_payment_proof(&self, trade_id: &Uuid) -> bool {
        self.proof_registry
            .as_ref()
            .map(|proof_registry| proof_registry.terminate_request(trade_id))
            .unwrap_or_default()
    }

    /// Stops every protocol, then comms, then flushes persistence once.
    pub async fn shutdown(self) -> Result<(), EscrowError> {
        info!("Manager shutting down");
        if let Some(proof_registry) = self.proof_registry.as_ref() {
            proof_registry.shutdown();
        }

        let protocols: Vec<(Uuid, TradeProtocol)> =
            self.core.protocols.write().await.drain().collect();
        for (trade_id, protocol) in protocols {
            // Fails if the protocol already terminated
            if let Err(error) = protocol.new_accessor().shutdown().await {
                debug!(
                    "Trade w/ TradeUUID {} shutdown request not delivered - {}",
                    trade_id, error
                );
            }
            protocol.task_handle.await?;
        }

        // Archiver may already be gone
        let _ = self.archive_shutdown_tx.send(());
        self.archive_handle.await?;

        if let Err(error) = self
            .core
            .comms_accessor
            .unregister_peer_message_fallback_tx()
            .await
        {
            warn!("Failed to unregister fallback - {}", error);
        }
        self.fallback_handle.abort();
        self.core.comms_accessor.shutdown().await?;
        self.comms.task_handle.await?;

        self.core.registry.flush_all_at_shutdown()
    }
}
