//! Core types shared by the rule store, decision engine, and event log.
//!
//! The proxy pipeline hands us [`RawRequest`]/[`RawResponse`]; everything
//! recorded is a [`RequestEvent`] or [`BlockEvent`].

use std::{
    borrow::Borrow,
    collections::BTreeSet,
    fmt,
    net::IpAddr,
    str::FromStr,
    sync::Arc,
};

use {
    serde::{Deserialize, Serialize},
    time::OffsetDateTime,
};

use crate::{Error, Result};

/// Recorded in place of the client address when the pipeline does not know it.
pub const UNKNOWN_CLIENT: &str = "unknown";

// ── Rules ───────────────────────────────────────────────────────────────────

/// A single normalized rule: trimmed, lower-cased, never empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Rule(String);

impl Rule {
    /// Normalize `raw` into a rule. Blank input is rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let value = raw.trim().to_lowercase();
        if value.is_empty() {
            return Err(Error::validation("rule must not be empty"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Rule {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Which rule collection an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// Matched as a substring of the request host.
    Domains,
    /// Matched as a substring of the decoded path and query.
    Keywords,
}

impl RuleKind {
    pub const ALL: [Self; 2] = [Self::Domains, Self::Keywords];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Domains => "domains",
            Self::Keywords => "keywords",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "domains" => Ok(Self::Domains),
            "keywords" => Ok(Self::Keywords),
            other => Err(Error::validation(format!("invalid rule type: {other}"))),
        }
    }
}

/// An ordered, de-duplicated collection of rules.
///
/// Iteration is lexicographic, which makes "first match wins" deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RuleSet(BTreeSet<Rule>);

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from untrusted entries, silently dropping blank ones.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        entries
            .into_iter()
            .filter_map(|e| Rule::parse(e.as_ref()).ok())
            .collect()
    }

    /// Returns `false` if the rule was already present.
    pub fn insert(&mut self, rule: Rule) -> bool {
        self.0.insert(rule)
    }

    pub fn contains(&self, value: &str) -> bool {
        self.0.contains(value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.0.iter()
    }

    /// Sorted plain-string form, as exposed to the management layer.
    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(|r| r.0.clone()).collect()
    }
}

impl FromIterator<Rule> for RuleSet {
    fn from_iter<T: IntoIterator<Item = Rule>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type IntoIter = std::collections::btree_set::Iter<'a, Rule>;
    type Item = &'a Rule;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Immutable view of both rule collections taken at a single instant.
#[derive(Debug, Clone, Default)]
pub struct RuleSnapshot {
    pub domains: Arc<RuleSet>,
    pub keywords: Arc<RuleSet>,
}

impl RuleSnapshot {
    pub fn new(domains: RuleSet, keywords: RuleSet) -> Self {
        Self {
            domains: Arc::new(domains),
            keywords: Arc::new(keywords),
        }
    }

    pub fn get(&self, kind: RuleKind) -> &RuleSet {
        match kind {
            RuleKind::Domains => &self.domains,
            RuleKind::Keywords => &self.keywords,
        }
    }
}

// ── Pipeline input ──────────────────────────────────────────────────────────

/// Request metadata handed over by the intercepting proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRequest {
    pub method: String,
    /// Host without port.
    pub host: String,
    /// Raw (still percent-encoded) path, starting with `/`.
    pub path: String,
    /// Raw query string, with or without the leading `?`. Empty when absent.
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub client_ip: Option<IpAddr>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl RawRequest {
    /// Query string without its leading `?`.
    pub fn query(&self) -> &str {
        self.query.strip_prefix('?').unwrap_or(&self.query)
    }

    /// Path plus `?query` when a query is present, still encoded.
    pub fn target(&self) -> String {
        match self.query() {
            "" => self.path.clone(),
            q => format!("{}?{q}", self.path),
        }
    }

    /// Host and target, used to identify the request in block events.
    pub fn url(&self) -> String {
        format!("{}{}", self.host, self.target())
    }

    /// Client address as recorded in events.
    pub fn client_label(&self) -> String {
        self.client_ip
            .map_or_else(|| UNKNOWN_CLIENT.to_string(), |ip| ip.to_string())
    }
}

/// Response metadata handed over once the upstream (or override) responded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResponse {
    pub status_code: u16,
    pub body_size_bytes: u64,
}

// ── Recorded events ─────────────────────────────────────────────────────────

/// One observed request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub client_ip: String,
    pub method: String,
    pub host: String,
    pub path: String,
    pub status_code: u16,
    pub response_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub blocked: bool,
}

impl RequestEvent {
    pub fn from_exchange(
        request: &RawRequest,
        response: &RawResponse,
        blocked: bool,
        timestamp: OffsetDateTime,
    ) -> Self {
        Self {
            timestamp,
            client_ip: request.client_label(),
            method: request.method.clone(),
            host: request.host.clone(),
            path: request.target(),
            status_code: response.status_code,
            response_size_bytes: response.body_size_bytes,
            user_agent: request.user_agent.clone(),
            blocked,
        }
    }
}

/// Why a request was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    DomainMatch,
    KeywordMatch,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DomainMatch => "domain_match",
            Self::KeywordMatch => "keyword_match",
        }
    }

    /// Human-readable explanation shown on the block page.
    pub fn describe(self, matched: &str) -> String {
        match self {
            Self::DomainMatch => format!("Blocked Domain: {matched}"),
            Self::KeywordMatch => format!("Blocked Keyword: '{matched}'"),
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "domain_match" => Ok(Self::DomainMatch),
            "keyword_match" => Ok(Self::KeywordMatch),
            other => Err(Error::message(format!("unknown block reason: {other}"))),
        }
    }
}

/// One block decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub client_ip: String,
    pub url: String,
    pub reason: BlockReason,
    pub matched_value: String,
}

// ── Tests ───────────────────────────────────────────────────────────────────
