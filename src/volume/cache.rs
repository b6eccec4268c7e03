//! TTL-bounded store of volume/trading-value records keyed by security code.
//!
//! Expiry is computed on read against the injected clock; nothing needs to
//! sweep the map for `get` to be correct.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::debug;

use crate::clock::{Clock, SystemClock};
use crate::model::{CachedVolumeRecord, VolumeSnapshot, VolumeSource};

#[derive(Debug, Clone)]
struct CacheEntry {
    record: CachedVolumeRecord,
    ttl: Duration,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now.signed_duration_since(self.record.fetched_at) < ttl,
            // TTL too large to represent: never expires.
            Err(_) => true,
        }
    }
}

/// Shared volume cache. Written by the refresher, read on the tick path.
pub struct VolumeCache {
    records: DashMap<String, CacheEntry>,
    clock: Arc<dyn Clock>,
}

impl VolumeCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Returns the record for `code` unless it is older than its TTL.
    pub fn get(&self, code: &str) -> Option<CachedVolumeRecord> {
        let now = self.clock.now();
        self.records
            .get(code)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.record.clone())
    }

    /// Overwrites whatever is stored for `code`.
    pub fn set(&self, code: &str, record: CachedVolumeRecord, ttl: Duration) {
        self.records.insert(code.to_string(), CacheEntry { record, ttl });
    }

    /// Stamps a fetched snapshot with the cache clock and stores it.
    pub fn store_snapshot(&self, code: &str, snapshot: VolumeSnapshot, ttl: Duration) -> CachedVolumeRecord {
        let record = snapshot.into_record(VolumeSource::PriceQuery, self.clock.now());
        self.set(code, record.clone(), ttl);
        record
    }

    /// Drops records past their TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, entry| entry.is_live(now));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!("Purged {} expired volume records", removed);
        }
        removed
    }

    /// Physically stored records, expired ones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn live_count(&self) -> usize {
        let now = self.clock.now();
        self.records.iter().filter(|entry| entry.is_live(now)).count()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl Default for VolumeCache {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}
