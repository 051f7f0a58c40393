use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};

use crate::common::error::EscrowError;

const MAX_RECORD_SIZE: u64 = 64 * 1024 * 1024;

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_RECORD_SIZE)
}

/// A value that can be written to and restored from a persisted record.
pub trait PersistableEnvelope: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn to_persistable_bytes(&self) -> Result<Vec<u8>, EscrowError> {
        Ok(codec().serialize(self)?)
    }

    fn from_persistable_bytes(bytes: &[u8]) -> Result<Self, EscrowError> {
        let value: Self = codec().deserialize(bytes)?;
        value.validate()?;
        Ok(value)
    }

    /// Shape check run after decoding. A failure marks the stored file as corrupted.
    fn validate(&self) -> Result<(), EscrowError> {
        Ok(())
    }
}
