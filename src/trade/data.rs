use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

use super::trade::Trade;
use crate::common::error::EscrowError;
use crate::persistence::{PersistenceManager, PersistenceRegistry, Priority};

pub(crate) const FILE_PREFIX: &str = "PendingTrade_";

pub(crate) fn file_name_for(trade_id: &Uuid) -> String {
    format!("{}{}", FILE_PREFIX, trade_id)
}

/// Shared handle on a pending trade and its persistence entry.
pub(crate) struct TradeData {
    pub(crate) trade_uuid: Uuid,
    store: Arc<RwLock<Trade>>,
    persistence: Arc<PersistenceManager<Trade>>,
}

impl TradeData {
    pub(crate) fn new(registry: &Arc<PersistenceRegistry>, trade: Trade) -> Result<Self, EscrowError> {
        let data = Self::register(registry, trade)?;
        data.persist_now()?;
        Ok(data)
    }

    /// Restores from an existing `PendingTrade_` file. `Ok(None)` if the file was missing or
    /// corrupted.
    pub(crate) fn restore(
        registry: &Arc<PersistenceRegistry>,
        file_name: &str,
    ) -> Result<Option<Self>, EscrowError> {
        let Some(trade) = registry.read_persisted::<Trade>(file_name)? else {
            return Ok(None);
        };
        if file_name_for(&trade.id) != file_name {
            return Err(EscrowError::DataIntegrity(format!(
                "Persisted file {} holds trade {}",
                file_name, trade.id
            )));
        }
        Ok(Some(Self::register(registry, trade)?))
    }

    fn register(registry: &Arc<PersistenceRegistry>, trade: Trade) -> Result<Self, EscrowError> {
        let trade_uuid = trade.id;
        let store = Arc::new(RwLock::new(trade));
        let persistence = PersistenceManager::initialize(
            registry,
            store.clone(),
            file_name_for(&trade_uuid),
            Priority::Private,
        )?;
        Ok(Self {
            trade_uuid,
            store,
            persistence,
        })
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Trade> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Trade> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn snapshot(&self) -> Trade {
        self.read().clone()
    }

    pub(crate) fn persist_now(&self) -> Result<(), EscrowError> {
        self.persistence.persist_now()
    }

    pub(crate) fn request_persistence(&self) {
        self.persistence.request_persistence();
    }

    pub(crate) fn file_name(&self) -> &str {
        self.persistence.file_name()
    }

    pub(crate) fn close(&self) {
        self.persistence.close();
    }
}
