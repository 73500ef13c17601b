//! Who may use this node, and where their traffic is charged.

use crate::panel::{CredentialDirectory, RESERVED_USER_ID, TrafficAccountant, UserId};
use crate::util::{Fingerprint, fingerprint, matches_fingerprint};
use std::sync::Arc;
use tracing::trace;

/// User id reported for connections authenticated by the static password
pub const STATIC_USER_ID: UserId = RESERVED_USER_ID;

/// Authentication mode of the node
pub enum ServerIdentity {
    /// One shared password, no accounting
    Static { fingerprint: Fingerprint },
    /// Per-user secrets from the panel, traffic charged per user
    Directory {
        directory: Arc<CredentialDirectory>,
        accountant: Arc<TrafficAccountant>,
    },
}

impl ServerIdentity {
    pub fn from_password(password: &str) -> Self {
        ServerIdentity::Static {
            fingerprint: fingerprint(password),
        }
    }

    pub fn from_directory(
        directory: Arc<CredentialDirectory>,
        accountant: Arc<TrafficAccountant>,
    ) -> Self {
        ServerIdentity::Directory {
            directory,
            accountant,
        }
    }

    /// Resolve the fingerprint a client sent to a user id
    pub fn authenticate(&self, candidate: &[u8]) -> Option<UserId> {
        match self {
            ServerIdentity::Static { fingerprint } => {
                matches_fingerprint(candidate, fingerprint).then_some(STATIC_USER_ID)
            }
            ServerIdentity::Directory { directory, .. } => directory.lookup_by_fingerprint(candidate),
        }
    }

    /// Charge one finished relay to `user_id`
    pub fn record_traffic(&self, user_id: UserId, upload: u64, download: u64) {
        match self {
            ServerIdentity::Static { .. } => {}
            ServerIdentity::Directory { accountant, .. } => {
                if user_id == STATIC_USER_ID {
                    return;
                }
                trace!(user_id, upload, download, "[Identity] Recording traffic");
                accountant.record(user_id, upload, download);
            }
        }
    }
}
