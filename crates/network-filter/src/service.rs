//! JSON management layer over [`FilterController`].
//!
//! The web/API collaborator passes request bodies through as
//! [`serde_json::Value`]; malformed input is rejected with
//! [`Error::Validation`] before anything changes.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    serde_json::{Value, json},
    tracing::{info, warn},
};

use crate::{Error, Result, RuleKind, controller::FilterController};

pub type ServiceResult = Result<Value>;

const DEFAULT_RECENT_LIMIT: u64 = 10;

#[async_trait]
pub trait FilterService: Send + Sync {
    /// `{enabled, domain_count, keyword_count}`.
    async fn status(&self) -> ServiceResult;
    /// Sorted list of rules for `kind` (`"domains"` or `"keywords"`).
    async fn rules(&self, kind: &str) -> ServiceResult;
    /// Body: `{"rules": [string, ...]}`.
    async fn set_rules(&self, kind: &str, params: Value) -> ServiceResult;
    /// Body: `{"enabled": bool}`.
    async fn set_filtering(&self, params: Value) -> ServiceResult;
    /// Params: `{"window_secs": n}`, defaulting to the dashboard window.
    async fn window_stats(&self, params: Value) -> ServiceResult;
    /// Params: `{"limit": n}`.
    async fn recent_blocks(&self, params: Value) -> ServiceResult;
    async fn dashboard(&self) -> ServiceResult;
}

pub struct LiveFilterService {
    controller: Arc<FilterController>,
}

impl LiveFilterService {
    pub fn new(controller: Arc<FilterController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl FilterService for LiveFilterService {
    async fn status(&self) -> ServiceResult {
        Ok(serde_json::to_value(self.controller.status())?)
    }

    async fn rules(&self, kind: &str) -> ServiceResult {
        let kind: RuleKind = kind.parse()?;
        Ok(json!(self.controller.rules(kind)))
    }

    async fn set_rules(&self, kind: &str, params: Value) -> ServiceResult {
        let kind: RuleKind = kind.parse()?;
        let entries = parse_rule_list(&params)?;
        match self.controller.set_rules(kind, entries).await {
            Ok(()) => {
                info!(kind = %kind, "blocked rules updated");
                Ok(json!({ "success": true }))
            },
            // Rules are live; only the file write failed.
            Err(e @ Error::Persist { .. }) => {
                warn!(kind = %kind, error = %e, "blocked rules updated but not saved");
                Ok(json!({ "success": true, "warning": e.to_string() }))
            },
            Err(e) => Err(e),
        }
    }

    async fn set_filtering(&self, params: Value) -> ServiceResult {
        let enabled = params
            .get("enabled")
            .and_then(Value::as_bool)
            .ok_or_else(|| Error::validation("\"enabled\" must be a boolean"))?;
        let enabled = self.controller.set_enabled(enabled);
        Ok(json!({ "success": true, "enabled": enabled }))
    }

    async fn window_stats(&self, params: Value) -> ServiceResult {
        let window = match params.get("window_secs") {
            None | Some(Value::Null) => self.controller.dashboard_window().as_secs(),
            Some(v) => v
                .as_u64()
                .ok_or_else(|| Error::validation("\"window_secs\" must be a non-negative integer"))?,
        };
        let stats = self
            .controller
            .window_stats(Duration::from_secs(window))
            .await;
        let mut value = serde_json::to_value(stats)?;
        value["window_secs"] = json!(window);
        Ok(value)
    }

    async fn recent_blocks(&self, params: Value) -> ServiceResult {
        let limit = match params.get("limit") {
            None | Some(Value::Null) => DEFAULT_RECENT_LIMIT,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| Error::validation("\"limit\" must be a non-negative integer"))?,
        };
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let entries = self.controller.recent_blocks(limit).await;
        Ok(json!({ "entries": entries }))
    }

    async fn dashboard(&self) -> ServiceResult {
        Ok(serde_json::to_value(self.controller.dashboard().await)?)
    }
}

/// Extract `params.rules` as strings. Any non-list body or non-string entry
/// rejects the whole request.
fn parse_rule_list(params: &Value) -> Result<Vec<&str>> {
    let list = params
        .get("rules")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::validation("\"rules\" must be a list of strings"))?;
    list.iter()
        .map(|v| {
            v.as_str()
                .ok_or_else(|| Error::validation(format!("rule entries must be strings, got {v}")))
        })
        .collect()
}
