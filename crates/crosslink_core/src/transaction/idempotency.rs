//! # Idempotency Receipts
//!
//! Per-resource memory of accepted idempotency keys and what they produced.
//!
//! ## Eviction
//!
//! - **TTL**: a key older than `ttl` is forgotten; a repeat after that runs
//!   the mutation again.
//! - **Size**: past `max_keys`, the oldest key is forgotten first.
//!
//! Not synchronized on its own: it lives inside the guarded resource's lock.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::TransactionId;

/// What an accepted key produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt<O> {
    /// Output of the original mutation.
    pub output: O,
    /// Transaction that produced it.
    pub transaction_id: TransactionId,
    /// When the key was accepted.
    pub accepted_at: Instant,
}

/// Bounded, expiring key → receipt map.
#[derive(Debug)]
pub struct IdempotencyCache<O> {
    receipts: HashMap<String, Receipt<O>>,
    /// Insertion order; may hold stale entries for keys re-accepted later.
    order: VecDeque<(String, Instant)>,
    ttl: Duration,
    max_keys: usize,
}

impl<O> IdempotencyCache<O> {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(ttl: Duration, max_keys: usize) -> Self {
        Self {
            receipts: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            max_keys: max_keys.max(1),
        }
    }

    /// Receipt for `key`, unless it expired.
    #[must_use]
    pub fn get(&self, key: &str, now: Instant) -> Option<&Receipt<O>> {
        self.receipts
            .get(key)
            .filter(|r| now.saturating_duration_since(r.accepted_at) < self.ttl)
    }

    /// Records `key` as accepted, evicting expired and then oldest keys.
    pub fn insert(&mut self, key: String, output: O, transaction_id: TransactionId, now: Instant) {
        self.purge_expired(now);

        self.order.push_back((key.clone(), now));
        self.receipts.insert(
            key,
            Receipt {
                output,
                transaction_id,
                accepted_at: now,
            },
        );

        while self.receipts.len() > self.max_keys {
            if !self.evict_front() {
                break;
            }
        }
    }

    /// Forgets every expired key. Returns how many were removed.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.receipts.len();
        while let Some((_, accepted_at)) = self.order.front() {
            if now.saturating_duration_since(*accepted_at) < self.ttl {
                break;
            }
            self.evict_front();
        }
        before - self.receipts.len()
    }

    /// Keys currently remembered (expired ones included until purged).
    #[must_use]
    pub fn len(&self) -> usize {
        self.receipts.len()
    }

    /// Whether no key is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receipts.is_empty()
    }

    /// Pops the oldest order entry, removing its receipt if it is current.
    fn evict_front(&mut self) -> bool {
        let Some((key, accepted_at)) = self.order.pop_front() else {
            return false;
        };
        if self
            .receipts
            .get(&key)
            .is_some_and(|r| r.accepted_at == accepted_at)
        {
            self.receipts.remove(&key);
        }
        true
    }
}
