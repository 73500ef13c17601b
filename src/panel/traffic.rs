//! Per-user byte counters with periodic, failure-safe delivery to the panel.

use crate::panel::api::{ReportingSink, TrafficRecord, UserId};
use crate::util::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};

#[derive(Debug, Default)]
struct UserTraffic {
    upload: AtomicU64,
    download: AtomicU64,
}

/// Aggregates traffic per user between flushes.
///
/// The map lock only guards insertion of new users; increments and the
/// flush's take-and-zero are atomic on the counters themselves, so every
/// recorded byte is reported exactly once across retries.
pub struct TrafficAccountant {
    sink: Arc<dyn ReportingSink>,
    counters: RwLock<HashMap<UserId, Arc<UserTraffic>>>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl TrafficAccountant {
    pub fn new(sink: Arc<dyn ReportingSink>) -> Self {
        Self {
            sink,
            counters: RwLock::new(HashMap::new()),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Add one finished relay's byte counts. All-zero reports are dropped.
    pub fn record(&self, user_id: UserId, upload: u64, download: u64) {
        if upload == 0 && download == 0 {
            return;
        }

        let counter = self.counter(user_id);
        if upload > 0 {
            counter.upload.fetch_add(upload, Ordering::Relaxed);
        }
        if download > 0 {
            counter.download.fetch_add(download, Ordering::Relaxed);
        }
    }

    fn counter(&self, user_id: UserId) -> Arc<UserTraffic> {
        if let Some(counter) = self.counters.read().get(&user_id) {
            return Arc::clone(counter);
        }
        let mut counters = self.counters.write();
        Arc::clone(counters.entry(user_id).or_default())
    }

    /// Un-flushed `(upload, download)` for a user
    pub fn pending(&self, user_id: UserId) -> (u64, u64) {
        self.counters
            .read()
            .get(&user_id)
            .map(|c| {
                (
                    c.upload.load(Ordering::Relaxed),
                    c.download.load(Ordering::Relaxed),
                )
            })
            .unwrap_or((0, 0))
    }

    /// Take every non-zero counter and submit the batch.
    ///
    /// Returns the number of records delivered. If the sink fails, the taken
    /// amounts are added back so the next flush reports them.
    pub async fn flush(&self) -> Result<usize> {
        let _in_flight = self.flush_lock.lock().await;

        let records: Vec<TrafficRecord> = {
            let counters = self.counters.read();
            counters
                .iter()
                .filter_map(|(&user_id, counter)| {
                    let u = counter.upload.swap(0, Ordering::AcqRel);
                    let d = counter.download.swap(0, Ordering::AcqRel);
                    (u > 0 || d > 0).then_some(TrafficRecord { user_id, u, d })
                })
                .collect()
        };

        if records.is_empty() {
            return Ok(0);
        }

        let count = records.len();
        match self.sink.submit(records.clone()).await {
            Ok(()) => {
                info!("[Traffic] Reported traffic for {} users", count);
                Ok(count)
            }
            Err(e) => {
                error!("[Traffic] Traffic report failed, keeping amounts: {}", e);
                let counters = self.counters.read();
                for record in &records {
                    if let Some(counter) = counters.get(&record.user_id) {
                        counter.upload.fetch_add(record.u, Ordering::AcqRel);
                        counter.download.fetch_add(record.d, Ordering::AcqRel);
                    }
                }
                Err(e)
            }
        }
    }

    /// Flush every `period`, first one a full period after start.
    pub fn spawn_flush_loop(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("[Traffic] Traffic report loop started (period {:?})", period);
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // errors are logged by flush and retried next period
                let _ = self.flush().await;
            }
        })
    }
}
