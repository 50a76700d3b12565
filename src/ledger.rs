use std::{cmp::Ordering, collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::{clock::Clock, topology::ClusterState};

pub const DEFAULT_REQUEST_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleRequest {
    pub key: String,
    pub master_count: u32,
    pub servant_count: u32,
    pub submitted_at: DateTime<Utc>,
}

impl ScaleRequest {
    pub fn total_count(&self) -> u64 {
        self.counts().total_count()
    }

    pub fn counts(&self) -> ClusterState {
        ClusterState::new(self.master_count, self.servant_count)
    }
}

/// Verdict ordering: larger total first, then more masters, then more
/// servants, and only then the later submission.
fn verdict_order(a: &ScaleRequest, b: &ScaleRequest) -> Ordering {
    a.total_count()
        .cmp(&b.total_count())
        .then(a.master_count.cmp(&b.master_count))
        .then(a.servant_count.cmp(&b.servant_count))
        .then(a.submitted_at.cmp(&b.submitted_at))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    InvalidMasterCount { master_count: u32 },
    MasterCountConflict { requested: u32, live: u32 },
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMasterCount { master_count } => {
                write!(f, "master_count must be 0 or 1, got {master_count}")
            }
            Self::MasterCountConflict { requested, live } => write!(
                f,
                "master_count {requested} conflicts with live requests using {live}"
            ),
        }
    }
}

impl std::error::Error for LedgerError {}

/// Live scale requests keyed by caller key.
///
/// Not internally synchronised: owners share it as `Arc<Mutex<RequestLedger>>`
/// so that a conflict check and the write that follows it happen under one lock.
pub struct RequestLedger {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    requests: BTreeMap<String, ScaleRequest>,
    next_key: u64,
}

impl RequestLedger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(clock, Duration::hours(DEFAULT_REQUEST_TTL_HOURS))
    }

    pub fn with_ttl(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            clock,
            ttl,
            requests: BTreeMap::new(),
            next_key: 1,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Unique for the lifetime of this ledger, not across restarts.
    pub fn new_key(&mut self) -> String {
        let key = format!("req-{}", self.next_key);
        self.next_key = self.next_key.saturating_add(1);
        key
    }

    fn is_live_at(&self, req: &ScaleRequest, now: DateTime<Utc>) -> bool {
        // Exactly `ttl` old is still live.
        now - req.submitted_at <= self.ttl
    }

    pub fn record_request(
        &mut self,
        key: impl Into<String>,
        master_count: u32,
        servant_count: u32,
    ) -> Result<(), LedgerError> {
        if master_count > 1 {
            return Err(LedgerError::InvalidMasterCount { master_count });
        }
        let key = key.into();
        let now = self.clock.now();

        let conflicting = self
            .requests
            .values()
            .filter(|r| r.key != key && self.is_live_at(r, now))
            .find(|r| r.master_count != master_count);
        if let Some(live) = conflicting {
            return Err(LedgerError::MasterCountConflict {
                requested: master_count,
                live: live.master_count,
            });
        }

        debug!(%key, master_count, servant_count, "scale request recorded");
        self.requests.insert(
            key.clone(),
            ScaleRequest {
                key,
                master_count,
                servant_count,
                submitted_at: now,
            },
        );
        Ok(())
    }

    pub fn purge_expired(&mut self) -> usize {
        let now = self.clock.now();
        let ttl = self.ttl;
        let before = self.requests.len();
        self.requests.retain(|_, r| now - r.submitted_at <= ttl);
        let purged = before - self.requests.len();
        if purged > 0 {
            debug!(purged, "expired scale requests purged");
        }
        purged
    }

    /// The largest live request, or `(0, 0)` when nothing is live.
    pub fn current_verdict(&mut self) -> ClusterState {
        self.purge_expired();
        self.requests
            .values()
            .max_by(|a, b| verdict_order(a, b))
            .map(ScaleRequest::counts)
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&ScaleRequest> {
        self.requests.get(key)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

}
