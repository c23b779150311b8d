//! Memory record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::MemoryError;

/// A persisted user attribute with a confidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileFact {
    pub key: String,
    pub value: String,
    /// 0.0 - 1.0
    pub confidence: f64,
    /// Where the fact came from ("conversation", "manual", ...)
    pub source: String,
    pub last_updated: DateTime<Utc>,
}

/// A deduplicated summary of a conversation exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub id: i64,
    pub text: String,
    pub content_hash: String,
    /// Decayable importance weight, 0.0 - 1.0
    pub relevance_score: f64,
    pub timestamp: DateTime<Utc>,
}

/// Something the companion has concluded about the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: i64,
    pub text: String,
    pub category: InsightCategory,
    pub content_hash: String,
    pub relevance_score: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightCategory {
    Personality,
    Interests,
    Preferences,
    Behavior,
    Emotions,
    Relationships,
    Goals,
    Skills,
    General,
}

impl InsightCategory {
    pub const ALL: [InsightCategory; 9] = [
        InsightCategory::Personality,
        InsightCategory::Interests,
        InsightCategory::Preferences,
        InsightCategory::Behavior,
        InsightCategory::Emotions,
        InsightCategory::Relationships,
        InsightCategory::Goals,
        InsightCategory::Skills,
        InsightCategory::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InsightCategory::Personality => "personality",
            InsightCategory::Interests => "interests",
            InsightCategory::Preferences => "preferences",
            InsightCategory::Behavior => "behavior",
            InsightCategory::Emotions => "emotions",
            InsightCategory::Relationships => "relationships",
            InsightCategory::Goals => "goals",
            InsightCategory::Skills => "skills",
            InsightCategory::General => "general",
        }
    }

    /// Map free-form model output to a category: the first category name
    /// found in the text wins, anything else is `General`.
    pub fn parse_lenient(text: &str) -> Self {
        let lower = text.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| lower.contains(c.as_str()))
            .unwrap_or(InsightCategory::General)
    }
}

impl fmt::Display for InsightCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InsightCategory {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| MemoryError::InvalidCategory(s.to_string()))
    }
}

/// Result of a profile fact upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Lower confidence and the same value: existing fact kept as is
    Unchanged,
}

/// Result of adding a summary or insight
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AddOutcome {
    Stored(i64),
    /// Same normalized text already stored
    Duplicate(i64),
    /// Too similar to a recent record; folded into it
    Merged { into: i64, similarity: f64 },
    /// Blank text, nothing stored
    Empty,
}

impl AddOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, AddOutcome::Stored(_))
    }
}

/// Everything in the store, for export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub exported_at: DateTime<Utc>,
    pub profile: Vec<ProfileFact>,
    pub summaries: Vec<Summary>,
    pub insights: Vec<Insight>,
}
