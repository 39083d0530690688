//! Windowed traffic statistics over recorded events.
//!
//! Queries never fail outward: a store error yields zeros or an empty list.
//! Zero stats can therefore mean "store unavailable" as well as "no traffic";
//! [`DashboardStats::available`] tells the two apart for the dashboard.

use std::{sync::Arc, time::Duration};

use {serde::Serialize, time::OffsetDateTime, tracing::warn};

use crate::{
    BlockEvent, Result,
    store::{EventStore, WindowStats},
};

/// Window used by the dashboard.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
/// Number of block events shown on the dashboard.
pub const DEFAULT_RECENT_BLOCKS: usize = 10;

/// Everything the dashboard shows in one payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DashboardStats {
    pub window_secs: u64,
    #[serde(flatten)]
    pub window: WindowStats,
    pub recent_blocked: Vec<BlockEvent>,
    /// `false` when any underlying query failed and zeros were substituted.
    pub available: bool,
}

#[derive(Clone)]
pub struct StatsAggregator {
    store: Arc<dyn EventStore>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Totals for events with `timestamp >= now - window`.
    pub async fn window_stats(&self, now: OffsetDateTime, window: Duration) -> WindowStats {
        self.try_window_stats(now, window)
            .await
            .unwrap_or_default()
    }

    /// The `limit` most recent block events, newest first.
    pub async fn recent_blocks(&self, limit: usize) -> Vec<BlockEvent> {
        self.try_recent_blocks(limit).await.unwrap_or_default()
    }

    pub async fn dashboard(
        &self,
        now: OffsetDateTime,
        window: Duration,
        limit: usize,
    ) -> DashboardStats {
        let window_stats = self.try_window_stats(now, window).await;
        let recent = self.try_recent_blocks(limit).await;
        DashboardStats {
            window_secs: window.as_secs(),
            available: window_stats.is_ok() && recent.is_ok(),
            window: window_stats.unwrap_or_default(),
            recent_blocked: recent.unwrap_or_default(),
        }
    }

    async fn try_window_stats(&self, now: OffsetDateTime, window: Duration) -> Result<WindowStats> {
        self.store
            .window_stats(window_start(now, window))
            .await
            .inspect_err(|e| warn!(error = %e, "window stats unavailable"))
    }

    async fn try_recent_blocks(&self, limit: usize) -> Result<Vec<BlockEvent>> {
        self.store
            .recent_blocks(limit)
            .await
            .inspect_err(|e| warn!(error = %e, "recent blocks unavailable"))
    }
}

/// `now - window`, clamped to the Unix epoch on overflow.
fn window_start(now: OffsetDateTime, window: Duration) -> OffsetDateTime {
    time::Duration::try_from(window)
        .ok()
        .and_then(|w| now.checked_sub(w))
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        crate::{BlockReason, Error, RequestEvent, store::SqliteEventStore},
        async_trait::async_trait,
    };

    struct BrokenStore;

    #[async_trait]
    impl EventStore for BrokenStore {
        async fn append_request(&self, _event: &RequestEvent) -> Result<()> {
            Err(Error::message("database is locked"))
        }

        async fn append_block(&self, _event: &BlockEvent) -> Result<()> {
            Err(Error::message("database is locked"))
        }

        async fn window_stats(&self, _since: OffsetDateTime) -> Result<WindowStats> {
            Err(Error::message("database is locked"))
        }

        async fn recent_blocks(&self, _limit: usize) -> Result<Vec<BlockEvent>> {
            Err(Error::message("database is locked"))
        }
    }

    #[test]
    fn window_start_subtracts_and_clamps() {
        let now = OffsetDateTime::from_unix_timestamp(1_000_000).unwrap();
        assert_eq!(
            window_start(now, Duration::from_secs(1_000)).unix_timestamp(),
            999_000
        );
        assert_eq!(
            window_start(now, Duration::from_secs(u64::MAX)),
            OffsetDateTime::UNIX_EPOCH
        );
    }

    #[tokio::test]
    async fn store_failure_yields_zeros() {
        let stats = StatsAggregator::new(Arc::new(BrokenStore));
        let now = OffsetDateTime::now_utc();
        assert_eq!(stats.window_stats(now, DEFAULT_WINDOW).await, WindowStats::default());
        assert!(stats.recent_blocks(10).await.is_empty());

        let dashboard = stats.dashboard(now, DEFAULT_WINDOW, 10).await;
        assert!(!dashboard.available);
        assert_eq!(dashboard.window, WindowStats::default());
    }

    #[tokio::test]
    async fn dashboard_flattens_window_stats() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteEventStore::open(&dir.path().join("stats.db")).await.unwrap());
        let now = OffsetDateTime::now_utc();
        store
            .append_block(&BlockEvent {
                timestamp: now,
                client_ip: "10.1.1.1".into(),
                url: "ads.example.com/banner".into(),
                reason: BlockReason::DomainMatch,
                matched_value: "ads.example.com".into(),
            })
            .await
            .unwrap();

        let stats = StatsAggregator::new(store);
        let dashboard = stats
            .dashboard(now, DEFAULT_WINDOW, DEFAULT_RECENT_BLOCKS)
            .await;
        assert!(dashboard.available);
        assert_eq!(dashboard.window.blocked_requests, 1);
        assert_eq!(dashboard.recent_blocked.len(), 1);

        let json = serde_json::to_value(&dashboard).unwrap();
        assert_eq!(json["window_secs"], 86_400);
        assert_eq!(json["blocked_requests"], 1);
        assert_eq!(json["total_traffic_bytes"], 0);
        assert_eq!(json["recent_blocked"][0]["reason"], "domain_match");
    }
}
