use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One inbound real-time price update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub code: String,
    pub price: f64,
    pub change: f64,
    pub timestamp: DateTime<Utc>,
}

/// What a subscriber callback receives: a tick plus whatever unexpired
/// volume enrichment the cache held for the code at dispatch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub code: String,
    pub price: f64,
    pub change: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trading_value: Option<u64>,
}

impl Quote {
    /// Price fields always come from the tick; enrichment only from a record
    /// that is present. A missing record never becomes zero.
    pub fn merge(tick: Tick, record: Option<&CachedVolumeRecord>) -> Self {
        Self {
            code: tick.code,
            price: tick.price,
            change: tick.change,
            timestamp: tick.timestamp,
            volume: record.map(|r| r.volume),
            trading_value: record.map(|r| r.trading_value),
        }
    }

    pub fn is_enriched(&self) -> bool {
        self.volume.is_some() || self.trading_value.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeSource {
    /// Pulled by the background refresher.
    PriceQuery,
    /// Written directly through `VolumeCache::set`.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedVolumeRecord {
    pub volume: u64,
    pub trading_value: u64,
    pub source: VolumeSource,
    pub fetched_at: DateTime<Utc>,
}

/// Answer of the pull-style volume query. Either figure may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSnapshot {
    pub volume: Option<u64>,
    pub trading_value: Option<u64>,
}

impl VolumeSnapshot {
    pub fn new(volume: u64, trading_value: u64) -> Self {
        Self {
            volume: Some(volume),
            trading_value: Some(trading_value),
        }
    }

    /// Both figures zero or absent: upstream had nothing for the code.
    pub fn is_empty(&self) -> bool {
        self.volume.unwrap_or(0) == 0 && self.trading_value.unwrap_or(0) == 0
    }

    pub fn into_record(self, source: VolumeSource, fetched_at: DateTime<Utc>) -> CachedVolumeRecord {
        CachedVolumeRecord {
            volume: self.volume.unwrap_or(0),
            trading_value: self.trading_value.unwrap_or(0),
            source,
            fetched_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts were exhausted.
    Failed,
}
