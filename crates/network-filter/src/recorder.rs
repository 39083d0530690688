//! Durable recording of request and block events.

use std::sync::Arc;

use tracing::trace;

#[cfg(feature = "metrics")]
use netwatch_metrics::{counter, definitions};

use crate::{BlockEvent, RequestEvent, Result, store::EventStore};

/// Appends events to an [`EventStore`].
///
/// Every call is a single append. Errors are returned, not swallowed; the
/// controller decides to log and drop them so traffic keeps flowing.
#[derive(Clone)]
pub struct EventRecorder {
    store: Arc<dyn EventStore>,
}

impl EventRecorder {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn record_request(&self, event: &RequestEvent) -> Result<()> {
        let result = self.store.append_request(event).await;
        observe("requests", &result);
        trace!(host = %event.host, blocked = event.blocked, ok = result.is_ok(), "request event");
        result
    }

    pub async fn record_block(&self, event: &BlockEvent) -> Result<()> {
        let result = self.store.append_block(event).await;
        observe("blocked_content", &result);
        trace!(url = %event.url, reason = %event.reason, ok = result.is_ok(), "block event");
        result
    }
}

#[cfg(feature = "metrics")]
fn observe(table: &'static str, result: &Result<()>) {
    let name = if result.is_ok() {
        definitions::EVENTS_RECORDED_TOTAL
    } else {
        definitions::EVENT_STORE_FAILURES_TOTAL
    };
    counter!(name, definitions::labels::TABLE => table).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn observe(_table: &'static str, _result: &Result<()>) {}
