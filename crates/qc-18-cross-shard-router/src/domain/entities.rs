//! # Domain Entities
//!
//! Messages, sealed batches and dead letters.
//!
//! A [`Message`] is immutable once built. Whichever queue holds it owns it;
//! dequeue moves it out. A [`Batch`] is sealed with its sequence number and
//! never changes afterwards.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::value_objects::{Fingerprint, Priority, ShardId};

/// Wall clock in microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Inter-shard message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    fingerprint: Fingerprint,
    source_shard: ShardId,
    destination_key: Vec<u8>,
    priority: Priority,
    payload: Vec<u8>,
    enqueued_at_us: u64,
    expires_at_us: Option<u64>,
    retry_count: u32,
}

impl Message {
    /// Create a message stamped with the current time and no expiry.
    pub fn new(
        source_shard: ShardId,
        destination_key: impl Into<Vec<u8>>,
        priority: Priority,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        let payload = payload.into();
        Self {
            fingerprint: Fingerprint::of(&payload),
            source_shard,
            destination_key: destination_key.into(),
            priority,
            payload,
            enqueued_at_us: now_micros(),
            expires_at_us: None,
            retry_count: 0,
        }
    }

    /// Same message with an expiry `ttl_ms` after its enqueue time.
    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.expires_at_us = Some(self.enqueued_at_us.saturating_add(ttl_ms * 1_000));
        self
    }

    /// Same message with an explicit enqueue timestamp.
    pub fn with_enqueued_at(mut self, enqueued_at_us: u64) -> Self {
        if let Some(expiry) = self.expires_at_us {
            let ttl = expiry.saturating_sub(self.enqueued_at_us);
            self.expires_at_us = Some(enqueued_at_us.saturating_add(ttl));
        }
        self.enqueued_at_us = enqueued_at_us;
        self
    }

    /// Copy for re-admission after a failed or interrupted delivery.
    pub fn retried(&self) -> Self {
        let mut next = self.clone();
        next.retry_count = next.retry_count.saturating_add(1);
        next
    }

    /// Content-derived identifier.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Shard that produced the message.
    pub fn source_shard(&self) -> ShardId {
        self.source_shard
    }

    /// Key hashed onto the ring.
    pub fn destination_key(&self) -> &[u8] {
        &self.destination_key
    }

    /// Priority class.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Opaque payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Enqueue timestamp (µs since epoch).
    pub fn enqueued_at_us(&self) -> u64 {
        self.enqueued_at_us
    }

    /// Expiry timestamp, if any.
    pub fn expires_at_us(&self) -> Option<u64> {
        self.expires_at_us
    }

    /// Number of previous delivery attempts.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Scheduling cost in bytes (never zero).
    pub fn size(&self) -> usize {
        (self.payload.len() + self.destination_key.len()).max(1)
    }

    /// Whether the message is past its expiry at `now_us`.
    pub fn is_expired(&self, now_us: u64) -> bool {
        self.expires_at_us.is_some_and(|e| now_us > e)
    }
}

/// Sealed, immutable batch of messages for one route.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    seq: u64,
    route: ShardId,
    messages: Vec<Message>,
    sealed_at_us: u64,
}

impl Batch {
    /// Seal messages under a sequence number.
    pub fn seal(seq: u64, route: ShardId, messages: Vec<Message>) -> Self {
        Self {
            seq,
            route,
            messages,
            sealed_at_us: now_micros(),
        }
    }

    /// Batch sequence number (strictly increasing per route).
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Destination route.
    pub fn route(&self) -> ShardId {
        self.route
    }

    /// Messages in dequeue order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Seal timestamp.
    pub fn sealed_at_us(&self) -> u64 {
        self.sealed_at_us
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True if the batch carries no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Give up ownership of the messages.
    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

/// Message set aside after its retry budget ran out.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Unique record id.
    pub id: Uuid,
    /// Route the message was bound for.
    pub route: ShardId,
    /// Sequence of the batch that carried it.
    pub batch_seq: u64,
    /// The undelivered message.
    pub message: Message,
    /// Delivery attempts made.
    pub attempts: u32,
    /// Last failure reason.
    pub reason: String,
    /// When the record was created.
    pub created_at_us: u64,
}

impl DeadLetter {
    /// Dead-letter every message of a batch.
    pub fn from_batch(batch: &Batch, attempts: u32, reason: &str) -> Vec<DeadLetter> {
        let now = now_micros();
        batch
            .messages()
            .iter()
            .map(|message| DeadLetter {
                id: Uuid::new_v4(),
                route: batch.route(),
                batch_seq: batch.seq(),
                message: message.clone(),
                attempts,
                reason: reason.to_string(),
                created_at_us: now,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_fingerprint_from_payload() {
        let a = Message::new(1, b"acct-7".to_vec(), Priority::High, b"payload".to_vec());
        let b = Message::new(2, b"acct-9".to_vec(), Priority::Low, b"payload".to_vec());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), Fingerprint::of(b"payload"));
    }

    #[test]
    fn test_message_expiry() {
        let msg = Message::new(0, b"k".to_vec(), Priority::Normal, b"p".to_vec())
            .with_enqueued_at(1_000_000)
            .with_ttl_ms(10);
        assert_eq!(msg.expires_at_us(), Some(1_010_000));
        assert!(!msg.is_expired(1_010_000));
        assert!(msg.is_expired(1_010_001));
    }

    #[test]
    fn test_message_without_ttl_never_expires() {
        let msg = Message::new(0, b"k".to_vec(), Priority::Normal, b"p".to_vec());
        assert!(!msg.is_expired(u64::MAX));
    }

    #[test]
    fn test_retried_bumps_count_only() {
        let msg = Message::new(0, b"k".to_vec(), Priority::Normal, b"p".to_vec());
        let again = msg.retried().retried();
        assert_eq!(again.retry_count(), 2);
        assert_eq!(again.fingerprint(), msg.fingerprint());
        assert_eq!(again.enqueued_at_us(), msg.enqueued_at_us());
    }

    #[test]
    fn test_dead_letters_from_batch() {
        let msgs = vec![
            Message::new(0, b"a".to_vec(), Priority::Normal, b"1".to_vec()),
            Message::new(0, b"b".to_vec(), Priority::Normal, b"2".to_vec()),
        ];
        let batch = Batch::seal(9, 3, msgs);
        let letters = DeadLetter::from_batch(&batch, 5, "timeout");
        assert_eq!(letters.len(), 2);
        assert!(letters.iter().all(|l| l.batch_seq == 9 && l.route == 3));
        assert_ne!(letters[0].id, letters[1].id);
    }
}
