//! Block/allow decisions for a single request.
//!
//! Matching is plain substring containment: a domain rule matches any host
//! containing it (so subdomains are caught), a keyword rule matches anywhere
//! in the decoded path and query. This over-blocks on purpose. Rules are tried
//! in lexicographic order, domains before keywords, and the first hit wins.

use std::borrow::Cow;

use serde::Serialize;

use crate::{BlockReason, RawRequest, Rule, RuleSet, RuleSnapshot};

/// The parts of a request the engine looks at.
#[derive(Debug, Clone, Copy)]
pub struct FilterRequest<'a> {
    pub host: &'a str,
    /// Still percent-encoded.
    pub raw_path: &'a str,
    /// Still percent-encoded, without the leading `?`.
    pub raw_query: &'a str,
}

impl<'a> From<&'a RawRequest> for FilterRequest<'a> {
    fn from(req: &'a RawRequest) -> Self {
        Self {
            host: &req.host,
            raw_path: &req.path,
            raw_query: req.query(),
        }
    }
}

impl FilterRequest<'_> {
    /// Percent-decoded, lower-cased path plus `?query`.
    pub fn decoded_target(&self) -> String {
        let raw = if self.raw_query.is_empty() {
            Cow::Borrowed(self.raw_path)
        } else {
            Cow::Owned(format!("{}?{}", self.raw_path, self.raw_query))
        };
        String::from_utf8_lossy(&urlencoding::decode_binary(raw.as_bytes())).to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Block { reason: BlockReason, matched: Rule },
}

impl Decision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Block { .. })
    }

    pub fn reason(&self) -> Option<BlockReason> {
        match self {
            Self::Allow => None,
            Self::Block { reason, .. } => Some(*reason),
        }
    }

    pub fn matched_value(&self) -> Option<&str> {
        match self {
            Self::Allow => None,
            Self::Block { matched, .. } => Some(matched.as_str()),
        }
    }
}

/// Evaluate `request` against `rules`. Pure; ignores the enabled flag.
pub fn decide(request: &FilterRequest<'_>, rules: &RuleSnapshot) -> Decision {
    let host = request.host.to_lowercase();
    if let Some(rule) = first_match(&rules.domains, &host) {
        return Decision::Block {
            reason: BlockReason::DomainMatch,
            matched: rule.clone(),
        };
    }

    if rules.keywords.is_empty() {
        return Decision::Allow;
    }
    let target = request.decoded_target();
    if let Some(rule) = first_match(&rules.keywords, &target) {
        return Decision::Block {
            reason: BlockReason::KeywordMatch,
            matched: rule.clone(),
        };
    }

    Decision::Allow
}

fn first_match<'r>(rules: &'r RuleSet, haystack: &str) -> Option<&'r Rule> {
    rules.iter().find(|rule| haystack.contains(rule.as_str()))
}
