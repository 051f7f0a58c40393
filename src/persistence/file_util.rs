use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::common::crypto;

pub(super) const BACKUP_DIR: &str = "backup";
pub(super) const CORRUPTED_DIR: &str = "backup_of_corrupted_data";

// length (u32 BE) + sha256 of payload
const HEADER_LEN: usize = 4 + 32;

#[derive(Debug)]
pub(super) enum RecordError {
    Io(io::Error),
    Corrupt(String),
}

pub(super) fn backup_path(dir: &Path, file_name: &str, index: usize) -> PathBuf {
    dir.join(BACKUP_DIR)
        .join(file_name)
        .join(format!("{}_{}", file_name, index))
}

/// Shifts existing backups by one and copies the current file into slot 1. Slots beyond
/// `max_backups` are deleted.
pub(super) fn rolling_backup(dir: &Path, file_name: &str, max_backups: usize) -> io::Result<()> {
    let current = dir.join(file_name);
    if !current.exists() || max_backups == 0 {
        return Ok(());
    }
    let backup_dir = dir.join(BACKUP_DIR).join(file_name);
    fs::create_dir_all(&backup_dir)?;

    prune_backups(dir, file_name, max_backups - 1)?;
    for index in (1..max_backups).rev() {
        let from = backup_path(dir, file_name, index);
        if from.exists() {
            fs::rename(&from, backup_path(dir, file_name, index + 1))?;
        }
    }
    fs::copy(&current, backup_path(dir, file_name, 1))?;
    Ok(())
}

/// Removes every backup slot above `keep`.
fn prune_backups(dir: &Path, file_name: &str, keep: usize) -> io::Result<()> {
    let backup_dir = dir.join(BACKUP_DIR).join(file_name);
    let prefix = format!("{}_", file_name);
    for entry in fs::read_dir(&backup_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(index) = name
            .to_str()
            .and_then(|name| name.strip_prefix(&prefix))
            .and_then(|index| index.parse::<usize>().ok())
        else {
            continue;
        };
        if index > keep {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

pub(super) fn backup_count(dir: &Path, file_name: &str) -> usize {
    let backup_dir = dir.join(BACKUP_DIR).join(file_name);
    fs::read_dir(backup_dir)
        .map(|entries| entries.filter_map(Result::ok).count())
        .unwrap_or(0)
}

pub(super) fn encode_record(payload: &[u8]) -> io::Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record too large"))?;
    let mut record = Vec::with_capacity(HEADER_LEN + payload.len());
    record.extend_from_slice(&len.to_be_bytes());
    record.extend_from_slice(&crypto::sha256(payload));
    record.extend_from_slice(payload);
    Ok(record)
}

pub(super) fn decode_record(bytes: &[u8]) -> Result<&[u8], RecordError> {
    if bytes.len() < HEADER_LEN {
        return Err(RecordError::Corrupt(format!(
            "record of {} bytes is shorter than its header",
            bytes.len()
        )));
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&bytes[..4]);
    let len = u32::from_be_bytes(len) as usize;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != len {
        return Err(RecordError::Corrupt(format!(
            "record announces {} bytes, found {}",
            len,
            payload.len()
        )));
    }
    if crypto::sha256(payload)[..] != bytes[4..HEADER_LEN] {
        return Err(RecordError::Corrupt("record checksum mismatch".to_string()));
    }
    Ok(payload)
}

pub(super) fn read_record(path: &Path) -> Result<Vec<u8>, RecordError> {
    let bytes = fs::read(path).map_err(RecordError::Io)?;
    decode_record(&bytes).map(|payload| payload.to_vec())
}

/// Writes the whole record to `temp_path` and forces it to disk.
pub(super) fn write_temp_file(temp_path: &Path, record: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(temp_path)?;
    file.write_all(record)?;
    file.flush()?;
    file.sync_all()
}

/// Atomically replaces `target` with `temp_path`.
pub(super) fn rename_file(temp_path: &Path, target: &Path) -> io::Result<()> {
    fs::rename(temp_path, target)?;
    if let Some(parent) = target.parent() {
        // Directory fsync is not supported everywhere
        if let Err(error) = File::open(parent).and_then(|dir| dir.sync_all()) {
            debug!(
                "Directory sync of {} not possible - {}",
                parent.display(),
                error
            );
        }
    }
    Ok(())
}

pub(super) fn delete_temp_file(temp_path: &Path) {
    if temp_path.exists() {
        if let Err(error) = fs::remove_file(temp_path) {
            warn!(
                "Failed to delete temp file {} - {}",
                temp_path.display(),
                error
            );
        }
    }
}

/// Moves a file that failed to decode into the corrupted data backup and returns its new path.
pub(super) fn remove_and_backup_corrupted(dir: &Path, file_name: &str) -> io::Result<PathBuf> {
    let corrupted_dir = dir.join(CORRUPTED_DIR);
    fs::create_dir_all(&corrupted_dir)?;
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    let target = corrupted_dir.join(format!("{}_{}.corrupted", file_name, millis));
    fs::rename(dir.join(file_name), &target)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn record_detects_truncation_and_bit_flips() {
        let record = encode_record(b"trade payload").unwrap();
        assert_eq!(decode_record(&record).unwrap(), b"trade payload");

        assert!(matches!(
            decode_record(&record[..record.len() - 1]),
            Err(RecordError::Corrupt(_))
        ));

        let mut flipped = record.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x01;
        assert!(matches!(decode_record(&flipped), Err(RecordError::Corrupt(_))));

        assert!(matches!(decode_record(&[]), Err(RecordError::Corrupt(_))));
    }

    #[test]
    fn backups_rotate_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("Store");
        for generation in 0..3u8 {
            fs::write(&target, [generation]).unwrap();
            rolling_backup(dir.path(), "Store", 10).unwrap();
        }
        assert_eq!(fs::read(backup_path(dir.path(), "Store", 1)).unwrap(), vec![2]);
        assert_eq!(fs::read(backup_path(dir.path(), "Store", 3)).unwrap(), vec![0]);
    }

    #[test]
    fn corrupted_file_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Store"), b"garbage").unwrap();
        let moved = remove_and_backup_corrupted(dir.path(), "Store").unwrap();

        assert!(!dir.path().join("Store").exists());
        assert!(moved.starts_with(dir.path().join(CORRUPTED_DIR)));
        assert!(moved.to_string_lossy().ends_with(".corrupted"));
    }

    proptest! {
        #[test]
        fn backup_count_never_exceeds_max(max_backups in 1usize..6, writes in 1usize..15) {
            let dir = tempfile::tempdir().unwrap();
            let target = dir.path().join("Store");
            for generation in 0..writes {
                fs::write(&target, generation.to_be_bytes()).unwrap();
                rolling_backup(dir.path(), "Store", max_backups).unwrap();
                prop_assert!(backup_count(dir.path(), "Store") <= max_backups);
            }
            prop_assert_eq!(backup_count(dir.path(), "Store"), writes.min(max_backups));
        }

        #[test]
        fn shrinking_the_limit_prunes_old_backups(first in 2usize..8, second in 1usize..8) {
            let dir = tempfile::tempdir().unwrap();
            let target = dir.path().join("Store");
            for generation in 0..first {
                fs::write(&target, generation.to_be_bytes()).unwrap();
                rolling_backup(dir.path(), "Store", first).unwrap();
            }
            rolling_backup(dir.path(), "Store", second).unwrap();
            prop_assert!(backup_count(dir.path(), "Store") <= second);
        }
    }
}
