//! Per-request entry point for the proxy pipeline.
//!
//! [`FilterController`] owns the enabled toggle and ties together the rule
//! store, decision engine, event recorder, and stats aggregator. The pipeline
//! calls [`FilterController::on_request`] before forwarding and
//! [`FilterController::on_response`] once the exchange finished.
//!
//! Block events are appended on a spawned task, so the verdict never waits on
//! the event store. `on_request` must therefore run inside a Tokio runtime.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    serde::Serialize,
    time::OffsetDateTime,
    tokio::sync::broadcast,
    tracing::{debug, info, instrument, warn},
};

#[cfg(feature = "metrics")]
use netwatch_metrics::{counter, definitions, histogram};

use crate::{
    BlockEvent, BlockReason, RawRequest, RawResponse, RequestEvent, Result, RuleKind, RuleSet,
    config::FilterConfig,
    engine::{self, Decision, FilterRequest},
    recorder::EventRecorder,
    rules::RuleStore,
    stats::{DEFAULT_RECENT_BLOCKS, DEFAULT_WINDOW, DashboardStats, StatsAggregator},
    store::{EventStore, SqliteEventStore, WindowStats},
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Status code the caller should answer a blocked request with.
pub const BLOCK_STATUS: u16 = 403;

/// What the caller should send instead of forwarding a blocked request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockResponse {
    pub status: u16,
    pub reason: BlockReason,
    pub matched_value: String,
    pub url: String,
    /// Human-readable explanation for the block page.
    pub message: String,
}

/// Result of [`FilterController::on_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVerdict {
    pub decision: Decision,
    /// Present exactly when the request was blocked.
    pub response_override: Option<BlockResponse>,
}

impl RequestVerdict {
    fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            response_override: None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.decision.is_blocked()
    }
}

/// Current toggle state and rule counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FilterStatus {
    pub enabled: bool,
    pub domain_count: usize,
    pub keyword_count: usize,
}

/// Notifications for live dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FilterEvent {
    StatusChanged { enabled: bool },
    RulesUpdated { kind: RuleKind, count: usize },
    Blocked(BlockEvent),
}

pub struct FilterController {
    enabled: AtomicBool,
    rules: RuleStore,
    recorder: EventRecorder,
    stats: StatsAggregator,
    events: broadcast::Sender<FilterEvent>,
    dashboard_window: Duration,
    recent_blocks_limit: usize,
}

impl FilterController {
    /// Filtering starts enabled.
    pub fn new(rules: RuleStore, store: Arc<dyn EventStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            enabled: AtomicBool::new(true),
            rules,
            recorder: EventRecorder::new(Arc::clone(&store)),
            stats: StatsAggregator::new(store),
            events,
            dashboard_window: DEFAULT_WINDOW,
            recent_blocks_limit: DEFAULT_RECENT_BLOCKS,
        }
    }

    /// Build a controller from configuration: create directories, load the
    /// rule files, and open the SQLite event store.
    pub async fn open(config: &FilterConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.config_dir).await?;
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let rules = RuleStore::open(config.domains_path(), config.keywords_path()).await?;
        let store = SqliteEventStore::open(&config.database_path()).await?;
        let mut controller = Self::new(rules, Arc::new(store));
        controller.dashboard_window = config.dashboard_window();
        controller.recent_blocks_limit = config.recent_blocks_limit;
        Ok(controller)
    }

    // ── Hot path ────────────────────────────────────────────────────────────

    /// Decide whether `request` may pass. Blocks are recorded in the
    /// background; a recording failure is logged and never seen by the caller.
    pub async fn on_request(&self, request: &RawRequest) -> RequestVerdict {
        if !self.is_enabled() {
            #[cfg(feature = "metrics")]
            counter!(definitions::FILTER_DECISIONS_TOTAL, definitions::labels::RESULT => "bypassed")
                .increment(1);
            return RequestVerdict::allow();
        }

        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();
        let snapshot = self.rules.snapshot();
        let decision = engine::decide(&FilterRequest::from(request), &snapshot);
        drop(snapshot);
        #[cfg(feature = "metrics")]
        histogram!(definitions::FILTER_DECISION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        let Decision::Block { reason, matched } = &decision else {
            #[cfg(feature = "metrics")]
            counter!(definitions::FILTER_DECISIONS_TOTAL, definitions::labels::RESULT => "allowed")
                .increment(1);
            return RequestVerdict::allow();
        };
        #[cfg(feature = "metrics")]
        counter!(
            definitions::FILTER_DECISIONS_TOTAL,
            definitions::labels::RESULT => "blocked",
            definitions::labels::REASON => reason.as_str()
        )
        .increment(1);

        let event = BlockEvent {
            timestamp: OffsetDateTime::now_utc(),
            client_ip: request.client_label(),
            url: request.url(),
            reason: *reason,
            matched_value: matched.to_string(),
        };
        info!(
            client = %event.client_ip,
            url = %event.url,
            reason = %reason,
            matched = %matched,
            "blocked request"
        );
        let recorder = self.recorder.clone();
        let pending = event.clone();
        tokio::spawn(async move {
            if let Err(e) = recorder.record_block(&pending).await {
                warn!(error = %e, url = %pending.url, "failed to record block event");
            }
        });

        let response = BlockResponse {
            status: BLOCK_STATUS,
            reason: *reason,
            matched_value: event.matched_value.clone(),
            url: event.url.clone(),
            message: reason.describe(matched.as_str()),
        };
        let _ = self.events.send(FilterEvent::Blocked(event));
        RequestVerdict {
            decision,
            response_override: Some(response),
        }
    }

    /// Record the finished exchange. Runs regardless of the enabled flag.
    pub async fn on_response(
        &self,
        request: &RawRequest,
        response: &RawResponse,
        was_blocked: bool,
    ) {
        let event =
            RequestEvent::from_exchange(request, response, was_blocked, OffsetDateTime::now_utc());
        if let Err(e) = self.recorder.record_request(&event).await {
            warn!(error = %e, host = %event.host, "failed to record request event");
        }
    }

    // ── Toggle ──────────────────────────────────────────────────────────────

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Takes effect for the next evaluated request. Returns the new state.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        let previous = self.enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(enabled, "filtering toggled");
            let _ = self.events.send(FilterEvent::StatusChanged { enabled });
        }
        enabled
    }

    pub fn status(&self) -> FilterStatus {
        let (domain_count, keyword_count) = self.rules.counts();
        FilterStatus {
            enabled: self.is_enabled(),
            domain_count,
            keyword_count,
        }
    }

    // ── Rules ───────────────────────────────────────────────────────────────

    /// Sorted rules of `kind`.
    pub fn rules(&self, kind: RuleKind) -> Vec<String> {
        self.rules.snapshot().get(kind).to_strings()
    }

    /// Replace the rules of `kind` with the normalized form of `entries`.
    ///
    /// An [`Error::Persist`](crate::Error::Persist) means the new rules are
    /// active but not saved.
    #[instrument(skip(self, entries), fields(kind = %kind))]
    pub async fn set_rules<I, S>(&self, kind: RuleKind, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rules = RuleSet::from_entries(entries);
        let count = rules.len();
        let result = self.rules.replace(kind, rules).await;
        let _ = self.events.send(FilterEvent::RulesUpdated { kind, count });
        debug!(count, persisted = result.is_ok(), "rules updated");
        result
    }

    /// Re-read both rule files from disk.
    pub async fn reload_rules(&self) -> Result<()> {
        self.rules.reload().await?;
        let snapshot = self.rules.snapshot();
        for kind in RuleKind::ALL {
            let count = snapshot.get(kind).len();
            let _ = self.events.send(FilterEvent::RulesUpdated { kind, count });
        }
        Ok(())
    }

    // ── Stats ───────────────────────────────────────────────────────────────

    pub async fn window_stats(&self, window: Duration) -> WindowStats {
        self.stats
            .window_stats(OffsetDateTime::now_utc(), window)
            .await
    }

    pub async fn recent_blocks(&self, limit: usize) -> Vec<BlockEvent> {
        self.stats.recent_blocks(limit).await
    }

    /// Configured window and recent-block count.
    pub async fn dashboard(&self) -> DashboardStats {
        self.stats
            .dashboard(
                OffsetDateTime::now_utc(),
                self.dashboard_window,
                self.recent_blocks_limit,
            )
            .await
    }

    /// Window covered by [`FilterController::dashboard`].
    pub fn dashboard_window(&self) -> Duration {
        self.dashboard_window
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FilterEvent> {
        self.events.subscribe()
    }
}
