//! Companion Memory - what the companion knows about its user
//!
//! Three kinds of records live in one local SQLite file:
//! - profile facts (key/value with a confidence)
//! - conversation summaries
//! - categorized insights
//!
//! Summaries and insights are deduplicated by content hash and by word
//! overlap with recent records, and age out through periodic consolidation.

pub mod consolidate;
pub mod sqlite;
pub mod text;
pub mod types;

pub use consolidate::{consolidate, consolidate_if_due, ConsolidationPolicy, ConsolidationReport};
pub use sqlite::{MemoryDb, MemoryStats};
pub use types::{
    AddOutcome, Insight, InsightCategory, MemorySnapshot, ProfileFact, Summary, UpsertOutcome,
};

/// Errors from memory operations
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown insight category: {0}")]
    InvalidCategory(String),

    #[error("Bad timestamp in database: {0}")]
    Timestamp(String),

    #[error("No home directory")]
    NoHomeDir,
}

pub type Result<T> = std::result::Result<T, MemoryError>;
