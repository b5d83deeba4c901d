//! The `Pair` entity and its lifecycle status, plus the `PairChange` diff
//! type emitted by catalogue reconciliation.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PairStatus {
    Created,
    Active,
    Idle,
    Stopped,
    Restored,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pair {
    pub uuid: Uuid,
    pub base: String,
    pub quote: String,
    pub status: PairStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Pair {
    /// Constructs a freshly-created pair with a new v4 uuid and both
    /// timestamps set to now.
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            uuid: Uuid::new_v4(),
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
            status: PairStatus::Created,
            created_at: now,
            updated_at: now,
        }
    }

    /// Exchange-side identifier: lowercase `base` concatenated with
    /// lowercase `quote`, e.g. `btcusdt`.
    pub fn symbol(&self) -> String {
        format!("{}{}", self.base.to_lowercase(), self.quote.to_lowercase())
    }

    /// `(base, quote)` identity, used for the non-archived uniqueness
    /// invariant.
    pub fn identity(&self) -> (String, String) {
        (self.base.clone(), self.quote.clone())
    }
}

impl PartialEq for Pair {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base && self.quote == other.quote
    }
}
impl Eq for Pair {}

impl std::hash::Hash for Pair {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.base.hash(state);
        self.quote.hash(state);
    }
}

/// Emitted whenever catalogue reconciliation detects a diff against the
/// locally tracked pair set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PairChange {
    pub added: HashSet<Pair>,
    pub removed: HashSet<Pair>,
}

/// Equality-over-present-fields query used by `Repository::find`.
#[derive(Debug, Clone, Default)]
pub struct PairQuery {
    pub base: Option<String>,
    pub quote: Option<String>,
    pub status: Option<PairStatus>,
}

impl PairQuery {
    pub fn matches(&self, pair: &Pair) -> bool {
        self.base.as_deref().map(|b| b == pair.base).unwrap_or(true)
            && self.quote.as_deref().map(|q| q == pair.quote).unwrap_or(true)
            && self.status.map(|s| s == pair.status).unwrap_or(true)
    }
}
