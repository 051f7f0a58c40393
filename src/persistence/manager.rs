use std::io;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError, RwLock, Weak,
};
use std::time::Duration;

use strum_macros::Display;
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

use super::envelope::PersistableEnvelope;
use super::file_util;
use super::registry::{PersistenceRegistry, RegisteredStore};
use crate::common::error::EscrowError;

/// Backup depth, write delay and shutdown behaviour of a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Priority {
    /// Data that can be fetched again from the network.
    Network,
    PrivateLowPrio,
    /// User data that must survive a shutdown.
    Private,
}

impl Priority {
    pub fn max_backups(&self) -> usize {
        match self {
            Priority::Network => 1,
            Priority::PrivateLowPrio => 4,
            Priority::Private => 10,
        }
    }

    pub fn delay(&self) -> Duration {
        match self {
            Priority::Network => Duration::from_secs(5 * 60),
            Priority::PrivateLowPrio => Duration::from_secs(60),
            Priority::Private => Duration::from_millis(200),
        }
    }

    pub fn flush_at_shutdown(&self) -> bool {
        matches!(self, Priority::Private)
    }
}

/// Owns the on-disk representation of one shared store.
pub struct PersistenceManager<T: PersistableEnvelope> {
    registry: Weak<PersistenceRegistry>,
    dir: PathBuf,
    file_name: String,
    priority: Priority,
    store: Arc<RwLock<T>>,
    write_lock: Mutex<()>,
    persistence_requested: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    #[cfg(test)]
    fail_before_rename: AtomicBool,
}

impl<T: PersistableEnvelope> PersistenceManager<T> {
    pub fn initialize(
        registry: &Arc<PersistenceRegistry>,
        store: Arc<RwLock<T>>,
        file_name: impl Into<String>,
        priority: Priority,
    ) -> Result<Arc<Self>, EscrowError> {
        let manager = Arc::new(Self {
            registry: Arc::downgrade(registry),
            dir: registry.dir().to_path_buf(),
            file_name: file_name.into(),
            priority,
            store,
            write_lock: Mutex::new(()),
            persistence_requested: AtomicBool::new(false),
            timer: Mutex::new(None),
            closed: AtomicBool::new(false),
            #[cfg(test)]
            fail_before_rename: AtomicBool::new(false),
        });
        let registered: Arc<dyn RegisteredStore> = manager.clone();
        registry.register(registered)?;
        Ok(manager)
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn store(&self) -> &Arc<RwLock<T>> {
        &self.store
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join(format!("{}.tmp", self.file_name))
    }

    /// Writes the store now: backup, temp file, fsync, rename. On failure the previous file stays
    /// untouched.
    pub fn persist_now(&self) -> Result<(), EscrowError> {
        let _write_guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.persistence_requested.store(false, Ordering::SeqCst);

        let payload = {
            let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
            store.to_persistable_bytes()?
        };
        let record = file_util::encode_record(&payload)?;
        file_util::rolling_backup(&self.dir, &self.file_name, self.priority.max_backups())?;

        let temp_path = self.temp_path();
        let target = self.dir.join(&self.file_name);
        let result = file_util::write_temp_file(&temp_path, &record)
            .and_then(|_| self.before_rename())
            .and_then(|_| file_util::rename_file(&temp_path, &target));

        if let Err(error) = result {
            file_util::delete_temp_file(&temp_path);
            error!("Failed to persist {} - {}", self.file_name, error);
            return Err(EscrowError::Persistence(format!(
                "Writing {} failed - {}",
                self.file_name, error
            )));
        }

        trace!("Persisted {} with {} bytes", self.file_name, record.len());
        Ok(())
    }

    #[cfg(not(test))]
    fn before_rename(&self) -> io::Result<()> {
        Ok(())
    }

    #[cfg(test)]
    fn before_rename(&self) -> io::Result<()> {
        if self.fail_before_rename.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "injected failure before rename",
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inject_failure_before_rename(&self, fail: bool) {
        self.fail_before_rename.store(fail, Ordering::SeqCst);
    }

    /// Schedules a write after the priority's delay. Requests arriving meanwhile are merged.
    pub fn request_persistence(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            warn!("Persistence requested for closed store {}", self.file_name);
            return;
        }
        if self.persistence_requested.swap(true, Ordering::SeqCst) {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                if let Err(error) = self.persist_now() {
                    error!("Immediate persist of {} failed - {}", self.file_name, error);
                }
                return;
            }
        };

        let weak = Arc::downgrade(self);
        let delay = self.priority.delay();
        let timer = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = weak.upgrade() else {
                return;
            };
            if manager.closed.load(Ordering::SeqCst)
                || !manager.persistence_requested.load(Ordering::SeqCst)
            {
                return;
            }
            if let Err(error) = manager.persist_now() {
                error!("Deferred persist of {} failed - {}", manager.file_name, error);
            }
        });
        if let Some(previous) = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(timer)
        {
            previous.abort();
        }
    }

    /// Marks the store dirty so the shutdown flush writes it regardless of priority.
    pub fn persist_at_shutdown(&self) {
        self.persistence_requested.store(true, Ordering::SeqCst);
    }

    /// Stops timers and unregisters. The file on disk is left as is.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel_pending_timer();
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(&self.file_name);
        }
    }

    fn cancel_pending_timer(&self) {
        if let Some(timer) = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
    }
}

impl<T: PersistableEnvelope> RegisteredStore for PersistenceManager<T> {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn is_persistence_requested(&self) -> bool {
        self.persistence_requested.load(Ordering::SeqCst)
    }

    fn persist_now(&self) -> Result<(), EscrowError> {
        PersistenceManager::persist_now(self)
    }

    fn cancel_timer(&self) {
        self.cancel_pending_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{CorruptedStorageFiles, MockCorruptedStorageFileHandler};
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Ledger {
        name: String,
        entries: Vec<u64>,
    }

    impl PersistableEnvelope for Ledger {
        fn validate(&self) -> Result<(), EscrowError> {
            if self.name.is_empty() {
                return Err(EscrowError::Persistence("Ledger without name".to_string()));
            }
            Ok(())
        }
    }

    fn ledger(entries: Vec<u64>) -> Arc<RwLock<Ledger>> {
        Arc::new(RwLock::new(Ledger {
            name: "ledger".to_string(),
            entries,
        }))
    }

    fn registry(dir: &std::path::Path) -> Arc<PersistenceRegistry> {
        PersistenceRegistry::new(dir, Arc::new(CorruptedStorageFiles::default())).unwrap()
    }

    #[test]
    fn persisted_store_reads_back_equal() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let store = ledger(vec![1, 2, 3]);
        let manager =
            PersistenceManager::initialize(&registry, store.clone(), "Ledger", Priority::Private)
                .unwrap();
        manager.persist_now().unwrap();

        let restored: Ledger = registry.read_persisted("Ledger").unwrap().unwrap();
        assert_eq!(restored, *store.read().unwrap());
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let restored: Option<Ledger> = registry.read_persisted("Nothing").unwrap();
        assert!(restored.is_none());
    }

    #[test]
    fn failure_before_rename_keeps_last_good_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let store = ledger(vec![1]);
        let manager =
            PersistenceManager::initialize(&registry, store.clone(), "Ledger", Priority::Private)
                .unwrap();
        manager.persist_now().unwrap();

        store.write().unwrap().entries.push(2);
        manager.inject_failure_before_rename(true);
        assert!(manager.persist_now().is_err());

        let target = dir.path().join("Ledger");
        assert!(std::fs::metadata(&target).unwrap().len() > 0);
        assert!(!dir.path().join("Ledger.tmp").exists());
        let restored: Ledger = registry.read_persisted("Ledger").unwrap().unwrap();
        assert_eq!(restored.entries, vec![1]);

        manager.inject_failure_before_rename(false);
        manager.persist_now().unwrap();
        let restored: Ledger = registry.read_persisted("Ledger").unwrap().unwrap();
        assert_eq!(restored.entries, vec![1, 2]);
    }

    #[test]
    fn duplicate_file_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let _first =
            PersistenceManager::initialize(&registry, ledger(vec![]), "Ledger", Priority::Private)
                .unwrap();
        let second =
            PersistenceManager::initialize(&registry, ledger(vec![]), "Ledger", Priority::Network);
        assert!(second.is_err());
        assert_eq!(registry.registered_count(), 1);
    }

    #[test]
    fn close_allows_re_registration() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let first =
            PersistenceManager::initialize(&registry, ledger(vec![]), "Ledger", Priority::Private)
                .unwrap();
        first.close();
        assert!(!registry.is_registered("Ledger"));
        PersistenceManager::initialize(&registry, ledger(vec![]), "Ledger", Priority::Private)
            .unwrap();
    }

    #[test]
    fn network_priority_keeps_single_backup() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let store = ledger(vec![]);
        let manager =
            PersistenceManager::initialize(&registry, store.clone(), "Peers", Priority::Network)
                .unwrap();
        for value in 0..5 {
            store.write().unwrap().entries.push(value);
            manager.persist_now().unwrap();
        }
        assert_eq!(registry.backup_count("Peers"), 1);
    }

    #[test]
    fn shutdown_flush_writes_private_and_requested_stores_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let _private =
            PersistenceManager::initialize(&registry, ledger(vec![1]), "Private", Priority::Private)
                .unwrap();
        let requested =
            PersistenceManager::initialize(&registry, ledger(vec![2]), "Requested", Priority::Network)
                .unwrap();
        let _idle =
            PersistenceManager::initialize(&registry, ledger(vec![3]), "Idle", Priority::Network)
                .unwrap();
        requested.persist_at_shutdown();

        registry.flush_all_at_shutdown().unwrap();
        assert!(dir.path().join("Private").exists());
        assert!(dir.path().join("Requested").exists());
        assert!(!dir.path().join("Idle").exists());
        assert_eq!(registry.registered_count(), 0);

        // second call is a no-op
        registry.flush_all_at_shutdown().unwrap();
        let late =
            PersistenceManager::initialize(&registry, ledger(vec![]), "Late", Priority::Private);
        assert!(late.is_err());
    }

    #[test]
    fn corrupted_file_is_quarantined_and_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Ledger"), b"not a record").unwrap();

        let mut handler = MockCorruptedStorageFileHandler::new();
        handler
            .expect_on_file_corrupted()
            .withf(|file_name: &str| file_name == "Ledger")
            .times(1)
            .return_const(());
        let registry = PersistenceRegistry::new(dir.path(), Arc::new(handler)).unwrap();

        let restored: Option<Ledger> = registry.read_persisted("Ledger").unwrap();
        assert!(restored.is_none());
        assert!(!dir.path().join("Ledger").exists());
        let quarantined = std::fs::read_dir(dir.path().join("backup_of_corrupted_data"))
            .unwrap()
            .count();
        assert_eq!(quarantined, 1);
    }

    #[test]
    fn invalid_content_counts_as_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(CorruptedStorageFiles::default());
        let registry = PersistenceRegistry::new(dir.path(), files.clone()).unwrap();
        let store = Arc::new(RwLock::new(Ledger {
            name: String::new(),
            entries: vec![],
        }));
        let manager =
            PersistenceManager::initialize(&registry, store, "Ledger", Priority::Private).unwrap();
        manager.persist_now().unwrap();

        let restored: Option<Ledger> = registry.read_persisted("Ledger").unwrap();
        assert!(restored.is_none());
        assert_eq!(files.files(), vec!["Ledger".to_string()]);
    }

    #[tokio::test]
    async fn requested_persistence_is_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let manager =
            PersistenceManager::initialize(&registry, ledger(vec![9]), "Ledger", Priority::Private)
                .unwrap();

        manager.request_persistence();
        manager.request_persistence();
        assert!(!dir.path().join("Ledger").exists());

        tokio::time::sleep(Priority::Private.delay() * 4).await;
        let restored: Ledger = registry.read_persisted("Ledger").unwrap().unwrap();
        assert_eq!(restored.entries, vec![9]);
    }
}
