//! In-memory credential directory backed by the panel's user list.
//!
//! Lookups read an immutable snapshot; a refresh builds a whole new snapshot
//! and publishes it with one pointer swap, so readers never see a half-built
//! table.

use crate::panel::api::{DirectorySource, PanelUser, RESERVED_USER_ID, UserId};
use crate::util::{Fingerprint, Result, fingerprint, fingerprint_from_slice};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// One authorised user. The secret itself is not kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub speed_limit: Option<u32>,
    pub fingerprint: Fingerprint,
}

/// Both indexes of one published user list
#[derive(Debug, Default)]
pub struct DirectorySnapshot {
    by_fingerprint: HashMap<Fingerprint, UserRecord>,
    by_id: HashMap<UserId, UserRecord>,
}

impl DirectorySnapshot {
    pub fn build(users: &[PanelUser]) -> Self {
        let mut by_fingerprint = HashMap::with_capacity(users.len());
        let mut by_id = HashMap::with_capacity(users.len());

        for user in users {
            if user.id == RESERVED_USER_ID {
                warn!("[Directory] Skipping user with reserved id {}", user.id);
                continue;
            }
            let record = UserRecord {
                id: user.id,
                speed_limit: user.speed_limit,
                fingerprint: fingerprint(&user.uuid),
            };
            if let Some(previous) = by_fingerprint.insert(record.fingerprint, record.clone()) {
                warn!(
                    "[Directory] Users {} and {} share a secret; keeping {}",
                    previous.id, record.id, record.id
                );
                if previous.id != record.id {
                    by_id.remove(&previous.id);
                }
            }
            by_id.insert(record.id, record);
        }

        Self {
            by_fingerprint,
            by_id,
        }
    }

    pub fn len(&self) -> usize {
        self.by_fingerprint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fingerprint.is_empty()
    }

    pub fn get_by_fingerprint(&self, fingerprint: &Fingerprint) -> Option<&UserRecord> {
        self.by_fingerprint.get(fingerprint)
    }

    pub fn get_by_id(&self, id: UserId) -> Option<&UserRecord> {
        self.by_id.get(&id)
    }
}

pub struct CredentialDirectory {
    source: Arc<dyn DirectorySource>,
    snapshot: RwLock<Arc<DirectorySnapshot>>,
}

impl CredentialDirectory {
    /// Empty until the first successful refresh
    pub fn new(source: Arc<dyn DirectorySource>) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(DirectorySnapshot::default())),
        }
    }

    /// Fetch the user list and replace the snapshot. On failure the previous
    /// snapshot stays in place.
    pub async fn refresh(&self) -> Result<usize> {
        let users = self.source.fetch_users().await?;
        let next = Arc::new(DirectorySnapshot::build(&users));
        let count = next.len();

        *self.snapshot.write() = next;
        debug!("[Directory] User list updated: {} users", count);
        Ok(count)
    }

    /// User id for a 32-byte fingerprint. Any other length is simply absent.
    pub fn lookup_by_fingerprint(&self, candidate: &[u8]) -> Option<UserId> {
        let key = fingerprint_from_slice(candidate)?;
        self.snapshot().get_by_fingerprint(&key).map(|r| r.id)
    }

    pub fn lookup_by_id(&self, id: UserId) -> Option<UserRecord> {
        self.snapshot().get_by_id(id).cloned()
    }

    /// The currently published snapshot
    pub fn snapshot(&self) -> Arc<DirectorySnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn user_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Refresh now, then every `period`. Errors are logged and never stop
    /// the loop.
    pub fn spawn_refresh_loop(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("[Directory] User refresh loop started (period {:?})", period);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh().await {
                    error!("[Directory] Failed to refresh user list: {}", e);
                }
            }
        })
    }
}
