//! Per-key requests-per-minute windows
//!
//! Counts are keyed by `(credential id, minute bucket)`. When several
//! processes share one pool the counter must live in a shared store so the
//! limit holds globally; [`MemoryRateWindow`] covers the single-process case.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;

/// Minute bucket containing `at`
pub fn minute_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(60)
}

#[async_trait]
pub trait RateWindowCounter: Send + Sync {
    /// Count one request in `bucket` unless `limit` requests are already
    /// counted there. Returns the new total, or `None` when the key is at
    /// its limit and nothing was counted.
    async fn try_increment(&self, id: Uuid, bucket: i64, limit: u64) -> Result<Option<u64>>;

    /// Requests already counted in `bucket`
    async fn current(&self, id: Uuid, bucket: i64) -> Result<u64>;
}

/// Process-local counter. Buckets older than the one being touched are
/// dropped, so memory stays bounded by the number of keys.
#[derive(Debug, Default)]
pub struct MemoryRateWindow {
    windows: Mutex<HashMap<Uuid, (i64, u64)>>,
}

impl MemoryRateWindow {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateWindowCounter for MemoryRateWindow {
    async fn try_increment(&self, id: Uuid, bucket: i64, limit: u64) -> Result<Option<u64>> {
        let mut windows = self.windows.lock().await;
        let entry = windows.entry(id).or_insert((bucket, 0));
        if entry.0 < bucket {
            *entry = (bucket, 0);
        }
        if entry.0 != bucket {
            // A caller behind the clock; its bucket has already expired.
            return Ok(Some(1));
        }
        if entry.1 >= limit {
            return Ok(None);
        }
        entry.1 += 1;
        Ok(Some(entry.1))
    }

    async fn current(&self, id: Uuid, bucket: i64) -> Result<u64> {
        let windows = self.windows.lock().await;
        Ok(match windows.get(&id) {
            Some(&(b, count)) if b == bucket => count,
            _ => 0,
        })
    }
}
