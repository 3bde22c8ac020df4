//! Bounded buffer for edits and deletes that arrive before their message
//!
//! Envelopes are parked per [`MessageKey`] in an LRU cache. The cache bounds
//! both the number of keys and the number of envelopes per key; overflow and
//! expiry drop envelopes with a warning.

use std::num::NonZeroUsize;

use courier_storage_traits::messages::types::MessageKey;
use lru::LruCache;
use parking_lot::Mutex;

use crate::envelope::Envelope;
use crate::validation::Mutation;

/// An envelope waiting for its message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredEnvelope {
    /// The parked envelope
    pub envelope: Envelope,
    /// Its validated mutation
    pub mutation: Mutation,
    /// Local time it was parked
    pub deferred_at: u64,
}

/// LRU-bounded map of parked envelopes
#[derive(Debug)]
pub struct DeferredBuffer {
    entries: Mutex<LruCache<MessageKey, Vec<DeferredEnvelope>>>,
    max_per_key: usize,
    ttl_ms: u64,
}

impl DeferredBuffer {
    /// Buffer holding at most `max_keys` keys and `max_per_key` envelopes per
    /// key, each kept for `ttl_ms` milliseconds.
    pub fn new(max_keys: usize, max_per_key: usize, ttl_ms: u64) -> Self {
        let capacity = NonZeroUsize::new(max_keys).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            max_per_key: max_per_key.max(1),
            ttl_ms,
        }
    }

    /// Park `envelope` and its validated `mutation` at local time `now`
    pub fn defer(&self, envelope: Envelope, mutation: Mutation, now: u64) {
        let key = envelope.key();
        let mut entries = self.entries.lock();

        if let Some(queue) = entries.get_mut(&key) {
            if queue.len() >= self.max_per_key {
                let dropped = queue.remove(0);
                tracing::warn!(
                    target: "courier_core::deferred::defer",
                    "Deferred queue for {} is full, dropping oldest {} envelope",
                    key,
                    dropped.envelope.kind
                );
            }
            queue.push(DeferredEnvelope {
                envelope,
                mutation,
                deferred_at: now,
            });
            return;
        }

        let queue = vec![DeferredEnvelope {
            envelope,
            mutation,
            deferred_at: now,
        }];
        if let Some((evicted_key, evicted)) = entries.push(key, queue) {
            tracing::warn!(
                target: "courier_core::deferred::defer",
                "Deferred buffer full, evicted {} envelope(s) for {}",
                evicted.len(),
                evicted_key
            );
        }
    }

    /// Remove and return everything parked for `key`, oldest first
    pub fn take(&self, key: &MessageKey) -> Vec<DeferredEnvelope> {
        self.entries.lock().pop(key).unwrap_or_default()
    }

    /// Put envelopes taken for `key` back in front of anything parked since,
    /// keeping their original park time. The per-key bound drops the oldest.
    pub fn restore(&self, key: &MessageKey, mut parked: Vec<DeferredEnvelope>) {
        if parked.is_empty() {
            return;
        }

        let mut entries = self.entries.lock();
        if let Some(newer) = entries.pop(key) {
            parked.extend(newer);
        }
        if parked.len() > self.max_per_key {
            let excess = parked.len() - self.max_per_key;
            parked.drain(..excess);
            tracing::warn!(
                target: "courier_core::deferred::restore",
                "Deferred queue for {} is full, dropping {} oldest envelope(s)",
                key,
                excess
            );
        }
        if let Some((evicted_key, evicted)) = entries.push(key.clone(), parked) {
            tracing::warn!(
                target: "courier_core::deferred::restore",
                "Deferred buffer full, evicted {} envelope(s) for {}",
                evicted.len(),
                evicted_key
            );
        }
    }

    /// Keys with parked envelopes, most recently used first
    pub fn keys(&self) -> Vec<MessageKey> {
        self.entries.lock().iter().map(|(key, _)| key.clone()).collect()
    }

    /// Drop envelopes parked for longer than the TTL. Returns how many were
    /// dropped.
    pub fn expire(&self, now: u64) -> usize {
        let cutoff = now.saturating_sub(self.ttl_ms);
        let mut entries = self.entries.lock();
        let mut dropped = 0;
        let mut emptied = Vec::new();

        for (key, queue) in entries.iter_mut() {
            let before = queue.len();
            queue.retain(|deferred| deferred.deferred_at >= cutoff);
            let expired = before - queue.len();
            if expired > 0 {
                tracing::warn!(
                    target: "courier_core::deferred::expire",
                    "Dropping {} expired deferred envelope(s) for {}",
                    expired,
                    key
                );
            }
            dropped += expired;
            if queue.is_empty() {
                emptied.push(key.clone());
            }
        }

        for key in emptied {
            entries.pop(&key);
        }

        dropped
    }

    /// Number of keys with parked envelopes
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is parked
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Total parked envelopes
    pub fn pending(&self) -> usize {
        self.entries.lock().iter().map(|(_, queue)| queue.len()).sum()
    }
}
