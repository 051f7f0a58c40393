mod corrupted;
mod envelope;
mod file_util;
mod manager;
mod registry;

pub use corrupted::{CorruptedStorageFileHandler, CorruptedStorageFiles};
pub use envelope::PersistableEnvelope;
pub use manager::{PersistenceManager, Priority};
pub use registry::PersistenceRegistry;

#[cfg(test)]
pub(crate) use corrupted::MockCorruptedStorageFileHandler;
