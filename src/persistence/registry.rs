use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use tracing::{debug, error, info, warn};

use super::corrupted::CorruptedStorageFileHandler;
use super::envelope::PersistableEnvelope;
use super::file_util::{self, RecordError};
use super::manager::Priority;
use crate::common::error::EscrowError;

/// Type erased view of a persistence manager, held by the registry.
pub(super) trait RegisteredStore: Send + Sync {
    fn file_name(&self) -> &str;
    fn priority(&self) -> Priority;
    fn is_persistence_requested(&self) -> bool;
    fn persist_now(&self) -> Result<(), EscrowError>;
    fn cancel_timer(&self);
}

/// Process wide root of all persisted stores. One entry per file name.
pub struct PersistenceRegistry {
    dir: PathBuf,
    corrupted_file_handler: Arc<dyn CorruptedStorageFileHandler>,
    entries: Mutex<HashMap<String, Arc<dyn RegisteredStore>>>,
    flush_started: AtomicBool,
}

impl PersistenceRegistry {
    pub fn new(
        dir: impl AsRef<Path>,
        corrupted_file_handler: Arc<dyn CorruptedStorageFileHandler>,
    ) -> Result<Arc<Self>, EscrowError> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Arc::new(Self {
            dir: dir.as_ref().to_path_buf(),
            corrupted_file_handler,
            entries: Mutex::new(HashMap::new()),
            flush_started: AtomicBool::new(false),
        }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn is_shutting_down(&self) -> bool {
        self.flush_started.load(Ordering::SeqCst)
    }

    pub(super) fn register(&self, store: Arc<dyn RegisteredStore>) -> Result<(), EscrowError> {
        if self.is_shutting_down() {
            return Err(EscrowError::Persistence(format!(
                "Cannot register {} after shutdown flush started",
                store.file_name()
            )));
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let file_name = store.file_name().to_string();
        if entries.contains_key(&file_name) {
            return Err(EscrowError::Persistence(format!(
                "A persistence manager for {} is already registered",
                file_name
            )));
        }
        debug!("Registered persistence for {}", file_name);
        entries.insert(file_name, store);
        Ok(())
    }

    pub(super) fn unregister(&self, file_name: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.remove(file_name).is_some() {
            debug!("Unregistered persistence for {}", file_name);
        }
    }

    pub fn is_registered(&self, file_name: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(file_name)
    }

    pub fn registered_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Reads a persisted record. A missing file gives `Ok(None)`. A file that fails to decode is
    /// moved to the corrupted data backup, reported to the handler, and also gives `Ok(None)`.
    pub fn read_persisted<T: PersistableEnvelope>(
        &self,
        file_name: &str,
    ) -> Result<Option<T>, EscrowError> {
        let path = self.dir.join(file_name);
        if !path.exists() {
            return Ok(None);
        }

        let reason = match file_util::read_record(&path) {
            Ok(payload) => match T::from_persistable_bytes(&payload) {
                Ok(value) => return Ok(Some(value)),
                Err(error) => error.to_string(),
            },
            Err(RecordError::Corrupt(reason)) => reason,
            Err(RecordError::Io(error)) => return Err(error.into()),
        };

        error!("Persisted file {} is corrupted - {}", file_name, reason);
        let moved_to = file_util::remove_and_backup_corrupted(&self.dir, file_name)?;
        info!(
            "Corrupted file {} moved to {}",
            file_name,
            moved_to.display()
        );
        self.corrupted_file_handler.on_file_corrupted(file_name);
        Ok(None)
    }

    /// Names of persisted files in the storage dir starting with `prefix`.
    pub fn list_files_with_prefix(&self, prefix: &str) -> Result<Vec<String>, EscrowError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) && !name.ends_with(".tmp") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Deletes a persisted file. Its backups are kept.
    pub fn delete_persisted(&self, file_name: &str) -> Result<(), EscrowError> {
        let path = self.dir.join(file_name);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn backup_count(&self, file_name: &str) -> usize {
        file_util::backup_count(&self.dir, file_name)
    }

    /// Persists every store flagged for shutdown flushing, then unregisters all. Runs once, later
    /// calls are no-ops.
    pub fn flush_all_at_shutdown(&self) -> Result<(), EscrowError> {
        if self.flush_started.swap(true, Ordering::SeqCst) {
            warn!("Flush at shutdown already called");
            return Ok(());
        }

        let stores: Vec<Arc<dyn RegisteredStore>> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, store)| store)
            .collect();
        info!("Flushing {} persisted stores at shutdown", stores.len());

        let mut failed = Vec::new();
        for store in stores {
            store.cancel_timer();
            if !store.priority().flush_at_shutdown() && !store.is_persistence_requested() {
                continue;
            }
            if let Err(error) = store.persist_now() {
                error!(
                    "Failed to flush {} at shutdown - {}",
                    store.file_name(),
                    error
                );
                failed.push(store.file_name().to_string());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(EscrowError::Persistence(format!(
                "Flush at shutdown failed for {}",
                failed.join(", ")
            )))
        }
    }
}
