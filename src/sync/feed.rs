//! Change feed
//!
//! Pull side of the protocol. Returns entities changed by other devices
//! since a cursor, oldest first.

use chrono::{DateTime, Utc};

use super::clock::Clock;
use super::error::SyncResult;
use super::types::{ChangeCursor, DeviceId, PullResponse};
use super::version_store::VersionStore;

/// Page size bounds for pulls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullLimits {
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for PullLimits {
    fn default() -> Self {
        Self {
            default_limit: 100,
            max_limit: 1000,
        }
    }
}

impl PullLimits {
    /// Requested page size, defaulted and capped
    pub fn effective(&self, requested: Option<u32>) -> usize {
        requested
            .map(|l| l as usize)
            .unwrap_or(self.default_limit)
            .min(self.max_limit)
    }
}

pub struct ChangeFeed<'a> {
    store: &'a dyn VersionStore,
    clock: &'a dyn Clock,
}

impl<'a> ChangeFeed<'a> {
    pub fn new(store: &'a dyn VersionStore, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    /// Changes not written by `device_id`, strictly after `since` and `after`
    ///
    /// At most `limit` changes are returned. `has_more` is set when at
    /// least one further change matched, and `next_cursor` then points at
    /// the last returned change so that equal timestamps are never split.
    pub async fn pull(
        &self,
        device_id: &DeviceId,
        since: Option<DateTime<Utc>>,
        after: Option<&ChangeCursor>,
        limit: usize,
    ) -> SyncResult<PullResponse> {
        // Taken before reading so that nothing written during the query
        // falls behind the cursor.
        let server_timestamp = self.clock.now();

        let mut entries = self
            .store
            .get_changed_since(since, after, device_id, limit.saturating_add(1))
            .await?;

        let has_more = entries.len() > limit;
        entries.truncate(limit);

        let next_cursor = match entries.last() {
            Some(last) if has_more => Some(last.cursor()),
            None if has_more => after.cloned(),
            _ => None,
        };
        let changes: Vec<_> = entries.into_iter().map(|e| e.into_change()).collect();

        tracing::debug!(
            device_id = %device_id,
            count = changes.len(),
            has_more = has_more,
            "Pulled changes"
        );

        Ok(PullResponse {
            changes,
            server_timestamp,
            has_more,
            next_cursor,
        })
    }
}
