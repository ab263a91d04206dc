//! WAL record framing.
//!
//! ```text
//! ┌──────────────┬───────────────┬──────────────────┬──────────────┐
//! │ len: u32 LE  │ seq: u64 LE   │ payload (len B)  │ crc32: u32 LE│
//! └──────────────┴───────────────┴──────────────────┴──────────────┘
//! ```
//!
//! The checksum covers the sequence bytes and the payload. The payload is a
//! bincode-encoded [`WalEntry`].

use serde::{Deserialize, Serialize};

use crate::domain::Batch;
use crate::error::WalError;

/// Length prefix + sequence number.
pub const HEADER_LEN: usize = 12;
/// Checksum trailer.
pub const TRAILER_LEN: usize = 4;
/// Largest payload accepted on decode; anything bigger is corruption.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Logical WAL entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum WalEntry {
    /// Sealed batch, written before transport.
    Batch(Batch),
    /// Batch acknowledged (or dead-lettered).
    Commit {
        /// Committed batch sequence
        seq: u64,
    },
}

// Borrowing twin of `WalEntry`; bincode encodes both identically.
#[derive(Serialize)]
enum WalEntryRef<'a> {
    Batch(&'a Batch),
    Commit { seq: u64 },
}

/// Result of decoding one record from the front of a buffer.
#[derive(Debug)]
pub enum Decoded {
    /// A valid record spanning `len` bytes.
    Record {
        /// Header sequence
        seq: u64,
        /// Decoded payload
        entry: WalEntry,
        /// Bytes consumed
        len: usize,
    },
    /// Buffer ends mid-record.
    Truncated,
    /// Record is invalid.
    Corrupt(String),
}

/// crc32 over sequence and payload.
pub fn checksum(seq: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&seq.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Frame a batch record.
pub fn encode_batch(batch: &Batch) -> Result<Vec<u8>, WalError> {
    frame(batch.seq(), &WalEntryRef::Batch(batch))
}

/// Frame a commit record.
pub fn encode_commit(seq: u64) -> Result<Vec<u8>, WalError> {
    frame(seq, &WalEntryRef::Commit { seq })
}

fn frame(seq: u64, entry: &WalEntryRef<'_>) -> Result<Vec<u8>, WalError> {
    let payload = bincode::serialize(entry)?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(WalError::Codec(format!(
            "record of {} bytes exceeds {}",
            payload.len(),
            MAX_PAYLOAD_LEN
        )));
    }

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&checksum(seq, &payload).to_le_bytes());
    Ok(out)
}

/// Decode the record at the start of `buf`.
pub fn decode(buf: &[u8]) -> Decoded {
    if buf.len() < HEADER_LEN {
        return Decoded::Truncated;
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&buf[0..4]);
    let payload_len = u32::from_le_bytes(len_bytes) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Decoded::Corrupt(format!("impossible record length {}", payload_len));
    }

    let total = HEADER_LEN + payload_len + TRAILER_LEN;
    if buf.len() < total {
        return Decoded::Truncated;
    }

    let mut seq_bytes = [0u8; 8];
    seq_bytes.copy_from_slice(&buf[4..12]);
    let seq = u64::from_le_bytes(seq_bytes);
    let payload = &buf[HEADER_LEN..HEADER_LEN + payload_len];
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&buf[HEADER_LEN + payload_len..total]);
    let stored = u32::from_le_bytes(crc_bytes);

    let computed = checksum(seq, payload);
    if stored != computed {
        return Decoded::Corrupt(format!(
            "checksum mismatch for seq {}: stored {:08x}, computed {:08x}",
            seq, stored, computed
        ));
    }

    let entry: WalEntry = match bincode::deserialize(payload) {
        Ok(entry) => entry,
        Err(e) => return Decoded::Corrupt(format!("undecodable payload for seq {}: {}", seq, e)),
    };
    let consistent = match &entry {
        WalEntry::Batch(batch) => batch.seq() == seq,
        WalEntry::Commit { seq: committed } => *committed == seq,
    };
    if !consistent {
        return Decoded::Corrupt(format!("payload sequence disagrees with header {}", seq));
    }

    Decoded::Record {
        seq,
        entry,
        len: total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Message, Priority};

    fn batch(seq: u64) -> Batch {
        Batch::seal(
            seq,
            2,
            vec![Message::new(1, b"acct".to_vec(), Priority::High, b"xfer".to_vec())],
        )
    }

    #[test]
    fn test_batch_record_decodes() {
        let b = batch(42);
        let bytes = encode_batch(&b).unwrap();
        match decode(&bytes) {
            Decoded::Record { seq, entry, len } => {
                assert_eq!(seq, 42);
                assert_eq!(len, bytes.len());
                assert_eq!(entry, WalEntry::Batch(b));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode_commit(7).unwrap();
        let payload_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        assert_eq!(bytes.len(), HEADER_LEN + payload_len + TRAILER_LEN);
        assert_eq!(u64::from_le_bytes(bytes[4..12].try_into().unwrap()), 7);
    }

    #[test]
    fn test_flipped_byte_is_corrupt() {
        let mut bytes = encode_batch(&batch(1)).unwrap();
        let mid = HEADER_LEN + 3;
        bytes[mid] ^= 0xFF;
        assert!(matches!(decode(&bytes), Decoded::Corrupt(_)));
    }

    #[test]
    fn test_short_buffer_is_truncated() {
        let bytes = encode_batch(&batch(1)).unwrap();
        assert!(matches!(decode(&bytes[..bytes.len() - 1]), Decoded::Truncated));
        assert!(matches!(decode(&bytes[..5]), Decoded::Truncated));
    }

    #[test]
    fn test_huge_length_is_corrupt() {
        let mut bytes = encode_commit(1).unwrap();
        bytes[0..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(decode(&bytes), Decoded::Corrupt(_)));
    }
}
