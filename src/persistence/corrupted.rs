use std::sync::{Mutex, PoisonError};
use tracing::error;

/// Told about every storage file that failed to decode and was moved aside.
#[cfg_attr(test, mockall::automock)]
pub trait CorruptedStorageFileHandler: Send + Sync {
    fn on_file_corrupted(&self, file_name: &str);
}

/// Keeps the names of corrupted files so the application can surface them to the user.
#[derive(Debug, Default)]
pub struct CorruptedStorageFiles {
    files: Mutex<Vec<String>>,
}

impl CorruptedStorageFiles {
    pub fn files(&self) -> Vec<String> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CorruptedStorageFileHandler for CorruptedStorageFiles {
    fn on_file_corrupted(&self, file_name: &str) {
        error!(
            "Storage file {} is corrupted and was moved to the corrupted data backup",
            file_name
        );
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(file_name.to_string());
    }
}
