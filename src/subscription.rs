//! Subscription expressions and their parsed form.
//!
//! An expression is either match-all (`*` or empty) or a `||`-separated list
//! of literal tags. The broker filters coarsely by the 32-bit tag hashes in
//! `code_set`; the client re-filters by exact tag string after each pull.

use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The match-all expression.
pub const SUB_ALL: &str = "*";

/// Parsed subscription for one topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub topic: String,
    /// Normalized raw expression (`*` for match-all).
    pub expression: String,
    pub tags: HashSet<String>,
    /// Tag hashes the broker uses for server-side coarse filtering.
    pub code_set: HashSet<i32>,
    pub class_filter_mode: bool,
    /// Construction timestamp in millis; bumped on re-subscribe so the broker
    /// can detect stale subscription data.
    pub sub_version: i64,
}

impl SubscriptionData {
    /// Parse `expression` for `topic`.
    ///
    /// `*` and the empty string subscribe to everything. Anything else must
    /// tokenize into at least one non-empty tag, otherwise the expression is
    /// rejected.
    pub fn new(topic: &str, expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let mut tags = HashSet::new();
        let mut code_set = HashSet::new();

        if !trimmed.is_empty() && trimmed != SUB_ALL {
            for tag in trimmed.split("||").map(str::trim).filter(|t| !t.is_empty()) {
                tags.insert(tag.to_string());
                code_set.insert(java_string_hash(tag));
            }
            if tags.is_empty() {
                return Err(Error::Subscription {
                    topic: topic.to_string(),
                    expression: expression.to_string(),
                    reason: "expression contains no tags".to_string(),
                });
            }
        }

        Ok(Self {
            topic: topic.to_string(),
            expression: if tags.is_empty() {
                SUB_ALL.to_string()
            } else {
                trimmed.to_string()
            },
            tags,
            code_set,
            class_filter_mode: false,
            sub_version: Utc::now().timestamp_millis(),
        })
    }

    /// Whether this subscription matches every message.
    pub fn match_all(&self) -> bool {
        self.tags.is_empty()
    }

    /// Client-side exact-tag filter. Class-filter subscriptions are filtered
    /// on the broker only.
    pub fn matches_tag(&self, tag: Option<&str>) -> bool {
        if self.match_all() || self.class_filter_mode {
            return true;
        }
        tag.map(|t| self.tags.contains(t)).unwrap_or(false)
    }
}

/// 31-multiplier rolling hash over UTF-16 code units, identical to Java's
/// `String.hashCode`. The broker computes tag codes the same way; using any
/// other hash would break server-side coarse filtering.
pub fn java_string_hash(s: &str) -> i32 {
    let mut hash: i32 = 0;
    for unit in s.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(unit as i32);
    }
    hash
}
