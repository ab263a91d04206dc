//! Compaction marker: the lowest sequence that may still be uncommitted and
//! the lowest sequence never handed out.
//!
//! Layout: `[floor: u64 LE][next_seq: u64 LE][crc32(floor, next_seq): u32 LE]`.
//! Written atomically via a temp file, `sync_all` and rename.
//!
//! Compaction removes committed batch records, so `next_seq` is the only
//! trace of the highest sequence used once they are gone.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::error::WalError;

const MARKER_LEN: usize = 20;

/// Decoded marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Marker {
    /// Every sequence below this is committed.
    pub floor: u64,
    /// Every sequence below this has been used.
    pub next_seq: u64,
}

/// Read the marker; `None` if none exists yet.
pub fn read(path: &Path) -> Result<Option<Marker>, WalError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let corrupt = |reason: &str| WalError::Corruption {
        path: path.to_path_buf(),
        offset: 0,
        reason: reason.to_string(),
    };
    if bytes.len() != MARKER_LEN {
        return Err(corrupt("marker has wrong length"));
    }

    let (body, crc) = bytes.split_at(16);
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(crc);
    if crc32fast::hash(body) != u32::from_le_bytes(crc_bytes) {
        return Err(corrupt("marker checksum mismatch"));
    }

    let mut word = [0u8; 8];
    word.copy_from_slice(&body[0..8]);
    let floor = u64::from_le_bytes(word);
    word.copy_from_slice(&body[8..16]);
    let next_seq = u64::from_le_bytes(word);
    Ok(Some(Marker { floor, next_seq }))
}

/// Durably replace the marker.
pub fn write(path: &Path, marker: Marker) -> Result<(), WalError> {
    let mut bytes = Vec::with_capacity(MARKER_LEN);
    bytes.extend_from_slice(&marker.floor.to_le_bytes());
    bytes.extend_from_slice(&marker.next_seq.to_le_bytes());
    let crc = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());

    let temp_path = path.with_extension("commit.tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_marker_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read(&dir.path().join("shard-0.commit")).unwrap(), None);
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard-0.commit");
        write(&path, Marker { floor: 1234, next_seq: 1300 }).unwrap();
        write(&path, Marker { floor: 5678, next_seq: 6000 }).unwrap();
        assert_eq!(
            read(&path).unwrap(),
            Some(Marker { floor: 5678, next_seq: 6000 })
        );
    }

    #[test]
    fn test_damaged_marker_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard-0.commit");
        write(&path, Marker { floor: 99, next_seq: 120 }).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        bytes[10] ^= 1;
        fs::write(&path, bytes).unwrap();
        assert!(matches!(read(&path), Err(WalError::Corruption { .. })));
    }
}
