use std::sync::Arc;
use std::time::Duration;

use secp256k1::SecretKey;
use tempfile::TempDir;
use tokio::time::sleep;
use uuid::Uuid;

use crusty_escrow::{
    common::{config::EngineConfig, types::NodeAddress},
    manager::{MakerParams, Manager, TakerParams},
    persistence::CorruptedStorageFiles,
    protocol::TradeAccess,
    testing::{LoopbackHub, MockChain, MockWallet, SomeTestOfferParams, SomeTestTradeParams},
    trade::{Offer, State, Trade},
};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const POLL_ATTEMPTS: usize = 250;

pub const MAKER_UTXOS: &[u64] = &[60_000_000];
pub const TAKER_UTXOS: &[u64] = &[5_000_000, 5_000_000];

pub struct TestNode {
    manager: Option<Manager>,
    pub wallet: Arc<MockWallet>,
    pub address: NodeAddress,
    pub config: EngineConfig,
    key: SecretKey,
    hub: LoopbackHub,
    _data_dir: TempDir,
}

impl TestNode {
    async fn start(
        hub: &LoopbackHub,
        chain: &MockChain,
        name: &str,
        key: SecretKey,
        address: NodeAddress,
        utxos: &[u64],
        configure: impl FnOnce(&mut EngineConfig),
    ) -> Self {
        let data_dir = TempDir::new().unwrap();
        let mut config = EngineConfig::with_data_dir(data_dir.path());
        configure(&mut config);

        let wallet = Arc::new(MockWallet::new(name, chain.clone(), utxos));
        let mut node = Self {
            manager: None,
            wallet,
            address,
            config,
            key,
            hub: hub.clone(),
            _data_dir: data_dir,
        };
        node.manager = Some(node.new_manager().await);
        node
    }

    async fn new_manager(&self) -> Manager {
        let key_ring = crusty_escrow::common::types::KeyRing::new(self.key);
        let network = self
            .hub
            .network(self.address.clone(), key_ring.pub_key_ring());
        Manager::new_with_key(
            self.key,
            self.config.clone(),
            self.wallet.clone(),
            network,
            Arc::new(CorruptedStorageFiles::default()),
        )
        .await
        .unwrap()
    }

    pub fn manager(&self) -> &Manager {
        self.manager.as_ref().unwrap()
    }

    /// Shuts the manager down and starts a new one on the same data dir, wallet and address.
    pub async fn restart(&mut self) {
        if let Some(manager) = self.manager.take() {
            manager.shutdown().await.unwrap();
        }
        self.manager = Some(self.new_manager().await);
    }

    pub async fn shutdown(mut self) {
        if let Some(manager) = self.manager.take() {
            manager.shutdown().await.unwrap();
        }
    }

    pub async fn access(&self, trade_id: &Uuid) -> TradeAccess {
        for _ in 0..POLL_ATTEMPTS {
            if let Some(access) = self.manager().trade_access(trade_id).await {
                return access;
            }
            sleep(POLL_INTERVAL).await;
        }
        panic!("Trade {} never became pending at {}", trade_id, self.address);
    }

    pub async fn wait_for_closed(&self, trade_id: &Uuid) -> Trade {
        for _ in 0..POLL_ATTEMPTS {
            let closed = self
                .manager()
                .closed_trades()
                .into_iter()
                .find(|trade| trade.id == *trade_id);
            if let Some(trade) = closed {
                return trade;
            }
            sleep(POLL_INTERVAL).await;
        }
        panic!("Trade {} never closed at {}", trade_id, self.address);
    }
}

/// Waits until the trade behind `access` satisfies `done`, returning the matching snapshot.
pub async fn wait_for(access: &TradeAccess, done: impl Fn(&Trade) -> bool) -> Trade {
    let mut last_state = None;
    for _ in 0..POLL_ATTEMPTS {
        let trade = access.query_trade().await.unwrap();
        if done(&trade) {
            return trade;
        }
        last_state = Some(trade.state());
        sleep(POLL_INTERVAL).await;
    }
    panic!("Trade condition never met, last state {:?}", last_state);
}

pub async fn wait_for_state(access: &TradeAccess, state: State) -> Trade {
    wait_for(access, |trade| trade.state() == state).await
}

/// Polls `check` until it holds.
pub async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..POLL_ATTEMPTS {
        if check() {
            return;
        }
        sleep(POLL_INTERVAL).await;
    }
    panic!("Condition never met");
}

/// A seller maker and a buyer taker joined by a loopback hub and sharing one chain.
pub struct TradingPair {
    pub hub: LoopbackHub,
    pub chain: MockChain,
    pub maker: TestNode,
    pub taker: TestNode,
    pub offer: Offer,
}

impl TradingPair {
    pub async fn start() -> Self {
        Self::start_with(TAKER_UTXOS, |_| {}).await
    }

    pub async fn start_with(
        taker_utxos: &[u64],
        configure_taker: impl FnOnce(&mut EngineConfig),
    ) -> Self {
        Self::start_configured(taker_utxos, |_| {}, configure_taker).await
    }

    pub async fn start_configured(
        taker_utxos: &[u64],
        configure_maker: impl FnOnce(&mut EngineConfig),
        configure_taker: impl FnOnce(&mut EngineConfig),
    ) -> Self {
        let hub = LoopbackHub::new();
        let chain = MockChain::new();
        let maker = TestNode::start(
            &hub,
            &chain,
            "maker",
            SecretKey::from_slice(&[0x01; 32]).unwrap(),
            SomeTestTradeParams::maker_node_address(),
            MAKER_UTXOS,
            configure_maker,
        )
        .await;
        let taker = TestNode::start(
            &hub,
            &chain,
            "taker",
            SecretKey::from_slice(&[0x02; 32]).unwrap(),
            SomeTestTradeParams::taker_node_address(),
            taker_utxos,
            configure_taker,
        )
        .await;

        let mut offer = SomeTestOfferParams::default_builder().build().unwrap();
        offer.protocol_version = maker.config.protocol_version;
        maker
            .manager()
            .place_offer(
                offer.clone(),
                MakerParams {
                    account_id: "maker-account".to_string(),
                    payment_account_payload: Box::new(
                        SomeTestTradeParams::maker_payment_account_payload(),
                    ),
                },
            )
            .await
            .unwrap();

        Self {
            hub,
            chain,
            maker,
            taker,
            offer,
        }
    }

    pub fn trade_id(&self) -> Uuid {
        self.offer.id
    }

    /// Creates the taker trade for the full offer amount. Nothing is sent yet.
    pub async fn new_taker_trade(&self) -> TradeAccess {
        self.taker
            .manager()
            .take_offer(
                self.offer.clone(),
                TakerParams {
                    account_id: "taker-account".to_string(),
                    payment_account_payload: Box::new(
                        SomeTestTradeParams::taker_payment_account_payload(),
                    ),
                    amount: SomeTestOfferParams::amount(),
                },
            )
            .await
            .unwrap()
    }

    pub async fn shutdown(self) {
        self.taker.shutdown().await;
        self.maker.shutdown().await;
    }
}
