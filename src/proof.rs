use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use std::time::Duration;

use async_trait::async_trait;
use strum_macros::{Display, IntoStaticStr};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::common::{config::EngineConfig, error::EscrowError};

/// Answer of the external verification service for one poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, IntoStaticStr)]
pub enum ProofStatus {
    Pending,
    Confirmed,
    Rejected,
}

/// Final outcome of a proof request.
#[derive(Clone, Debug, PartialEq, Eq, Display, IntoStaticStr)]
pub enum ProofResult {
    Confirmed,
    Rejected,
    TimedOut,
}

/// External service confirming that a counter currency payment happened. `endpoint` is the
/// configured service URL.
#[async_trait]
pub trait ProofService: Send + Sync {
    async fn check(
        &self,
        endpoint: &Url,
        trade_id: Uuid,
        tx_id: &str,
    ) -> Result<ProofStatus, EscrowError>;
}

struct ProofRequest {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// At most one outstanding proof request per trade. Polling runs on spawned tasks, and a
/// terminated request never reports a result.
pub struct ProofRequestRegistry {
    service: Arc<dyn ProofService>,
    endpoint: Url,
    poll_interval: Duration,
    max_duration: Duration,
    requests: Arc<Mutex<HashMap<Uuid, ProofRequest>>>,
    next_generation: AtomicU64,
}

impl ProofRequestRegistry {
    pub fn new(
        service: Arc<dyn ProofService>,
        endpoint: Url,
        poll_interval: Duration,
        max_duration: Duration,
    ) -> Self {
        Self {
            service,
            endpoint,
            poll_interval,
            max_duration,
            requests: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn with_config(service: Arc<dyn ProofService>, config: &EngineConfig) -> Self {
        Self::new(
            service,
            config.proof_service_url.clone(),
            config.proof_poll_interval(),
            config.proof_max_duration(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, ProofRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts polling for `trade_id`. Returns false, and does nothing, if a request for the
    /// same id is still outstanding.
    pub fn request(
        &self,
        trade_id: Uuid,
        tx_id: impl Into<String>,
        on_result: impl FnOnce(ProofResult) + Send + 'static,
    ) -> bool {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut requests = self.lock();
            if requests.contains_key(&trade_id) {
                debug!(
                    "Trade w/ TradeUUID {} proof request already outstanding",
                    trade_id
                );
                return false;
            }
            // Placeholder so a racing duplicate is refused before the task exists
            requests.insert(
                trade_id,
                ProofRequest {
                    generation,
                    handle: None,
                },
            );
        }

        let tx_id = tx_id.into();
        let service = self.service.clone();
        let endpoint = self.endpoint.clone();
        let requests = self.requests.clone();
        let poll_interval = self.poll_interval;
        let max_duration = self.max_duration;
        info!(
            "Trade w/ TradeUUID {} polling {} for proof of tx {}",
            trade_id, self.endpoint, tx_id
        );

        let handle = tokio::spawn(async move {
            let result = poll(service, &endpoint, trade_id, &tx_id, poll_interval, max_duration).await;
            let current = {
                let mut requests = requests.lock().unwrap_or_else(PoisonError::into_inner);
                match requests.get(&trade_id) {
                    Some(request) if request.generation == generation => {
                        requests.remove(&trade_id);
                        true
                    }
                    _ => false,
                }
            };
            if current {
                info!(
                    "Trade w/ TradeUUID {} proof request finished - {}",
                    trade_id, result
                );
                on_result(result);
            }
        });

        let mut requests = self.lock();
        match requests.get_mut(&trade_id) {
            Some(request) if request.generation == generation => request.handle = Some(handle),
            // Already finished, or terminated before the handle was stored
            _ => handle.abort(),
        }
        true
    }

    /// Stops polling for `trade_id` and frees the slot. Returns false if nothing was outstanding.
    pub fn terminate_request(&self, trade_id: &Uuid) -> bool {
        let Some(request) = self.lock().remove(trade_id) else {
            return false;
        };
        if let Some(handle) = request.handle {
            handle.abort();
        }
        debug!("Trade w/ TradeUUID {} proof request terminated", trade_id);
        true
    }

    pub fn is_outstanding(&self, trade_id: &Uuid) -> bool {
        self.lock().contains_key(trade_id)
    }

    pub fn shutdown(&self) {
        for (_, request) in self.lock().drain() {
            if let Some(handle) = request.handle {
                handle.abort();
            }
        }
    }
}

async fn poll(
    service: Arc<dyn ProofService>,
    endpoint: &Url,
    trade_id: Uuid,
    tx_id: &str,
    poll_interval: Duration,
    max_duration: Duration,
) -> ProofResult {
    let deadline = Instant::now() + max_duration;
    loop {
        match service.check(endpoint, trade_id, tx_id).await {
            Ok(ProofStatus::Confirmed) => return ProofResult::Confirmed,
            Ok(ProofStatus::Rejected) => return ProofResult::Rejected,
            Ok(ProofStatus::Pending) => {
                trace!("Trade w/ TradeUUID {} proof still pending", trade_id);
            }
            Err(error) => {
                warn!(
                    "Trade w/ TradeUUID {} proof service error - {}",
                    trade_id, error
                );
            }
        }
        if Instant::now() + poll_interval > deadline {
            return ProofResult::TimedOut;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    struct ScriptedService {
        confirm_after: Option<usize>,
        checks: AtomicUsize,
        endpoints: Mutex<Vec<Url>>,
    }

    impl ScriptedService {
        fn new(confirm_after: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                confirm_after,
                checks: AtomicUsize::new(0),
                endpoints: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ProofService for ScriptedService {
        async fn check(
            &self,
            endpoint: &Url,
            _trade_id: Uuid,
            _tx_id: &str,
        ) -> Result<ProofStatus, EscrowError> {
            self.endpoints.lock().unwrap().push(endpoint.clone());
            let checks = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
            match self.confirm_after {
                Some(after) if checks >= after => Ok(ProofStatus::Confirmed),
                _ => Ok(ProofStatus::Pending),
            }
        }
    }

    fn registry(service: Arc<ScriptedService>, max_duration: Duration) -> ProofRequestRegistry {
        ProofRequestRegistry::new(
            service,
            Url::parse("http://127.0.0.1:9/proof").unwrap(),
            Duration::from_millis(10),
            max_duration,
        )
    }

    #[tokio::test]
    async fn polls_the_configured_endpoint() {
        let service = ScriptedService::new(Some(1));
        let mut config = EngineConfig::default();
        config.proof_service_url = Url::parse("https://proof.example.org/api/check").unwrap();
        config.proof_poll_interval_ms = 10;
        let registry = ProofRequestRegistry::with_config(service.clone(), &config);
        let (tx, mut rx) = mpsc::channel(1);

        registry.request(Uuid::new_v4(), "txid", move |result| {
            tx.try_send(result).unwrap();
        });
        assert_eq!(rx.recv().await, Some(ProofResult::Confirmed));
        assert_eq!(
            *service.endpoints.lock().unwrap(),
            vec![config.proof_service_url.clone()]
        );
    }

    #[tokio::test]
    async fn confirmed_after_a_few_polls() {
        let service = ScriptedService::new(Some(3));
        let registry = registry(service.clone(), Duration::from_secs(5));
        let (tx, mut rx) = mpsc::channel(1);
        let trade_id = Uuid::new_v4();

        assert!(registry.request(trade_id, "txid", move |result| {
            tx.try_send(result).unwrap();
        }));
        assert_eq!(rx.recv().await, Some(ProofResult::Confirmed));
        assert_eq!(service.checks.load(Ordering::SeqCst), 3);
        assert!(!registry.is_outstanding(&trade_id));
    }

    #[tokio::test]
    async fn duplicate_request_is_a_no_op() {
        let registry = registry(ScriptedService::new(None), Duration::from_secs(5));
        let trade_id = Uuid::new_v4();

        assert!(registry.request(trade_id, "txid", |_| {}));
        assert!(!registry.request(trade_id, "txid", |_| panic!("duplicate must not run")));
        assert!(registry.terminate_request(&trade_id));
    }

    #[tokio::test]
    async fn gives_up_after_max_duration() {
        let registry = registry(ScriptedService::new(None), Duration::from_millis(50));
        let (tx, mut rx) = mpsc::channel(1);

        registry.request(Uuid::new_v4(), "txid", move |result| {
            tx.try_send(result).unwrap();
        });
        assert_eq!(rx.recv().await, Some(ProofResult::TimedOut));
    }

    #[tokio::test]
    async fn terminated_request_never_reports_and_slot_is_reusable() {
        let registry = registry(ScriptedService::new(Some(3)), Duration::from_secs(5));
        let trade_id = Uuid::new_v4();
        let (stale_tx, mut stale_rx) = mpsc::channel(1);

        registry.request(trade_id, "txid", move |result| {
            stale_tx.try_send(result).unwrap();
        });
        assert!(registry.terminate_request(&trade_id));
        assert!(!registry.terminate_request(&trade_id));

        let (tx, mut rx) = mpsc::channel(1);
        assert!(registry.request(trade_id, "txid", move |result| {
            tx.try_send(result).unwrap();
        }));
        assert_eq!(rx.recv().await, Some(ProofResult::Confirmed));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(stale_rx.try_recv().is_err());
    }
}
