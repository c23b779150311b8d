//! SQLite memory store
//!
//! Every operation opens its own connection and closes it when done, so
//! there is never more than one writer per call and nothing to share
//! between the chat loop and background work.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::text::{canonical_key, content_hash, jaccard_similarity, normalize};
use crate::types::{
    AddOutcome, Insight, InsightCategory, MemorySnapshot, ProfileFact, Summary, UpsertOutcome,
};
use crate::{MemoryError, Result};

/// How many recent summaries a new one is compared against
pub const SUMMARY_WINDOW: usize = 10;
/// Word overlap above which a summary counts as already known
pub const SUMMARY_SIMILARITY: f64 = 0.7;
pub const INSIGHT_WINDOW: usize = 15;
pub const INSIGHT_SIMILARITY: f64 = 0.8;

const LAST_CONSOLIDATION_KEY: &str = "last_consolidation";

/// Table layout for the two deduplicated record kinds
pub(crate) struct RecordTable {
    pub table: &'static str,
    pub text_col: &'static str,
    pub window: usize,
    pub threshold: f64,
}

pub(crate) const SUMMARIES: RecordTable = RecordTable {
    table: "summaries",
    text_col: "summary_text",
    window: SUMMARY_WINDOW,
    threshold: SUMMARY_SIMILARITY,
};

pub(crate) const INSIGHTS: RecordTable = RecordTable {
    table: "insights",
    text_col: "insight_text",
    window: INSIGHT_WINDOW,
    threshold: INSIGHT_SIMILARITY,
};

/// Row counts and bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryStats {
    pub profile_facts: usize,
    pub summaries: usize,
    pub insights: usize,
    pub last_consolidation: Option<DateTime<Utc>>,
}

/// Handle to the memory database file
#[derive(Debug, Clone)]
pub struct MemoryDb {
    path: PathBuf,
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    // Fixed width so lexical order is chronological order
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Case-insensitive substring match; `needles` must already be normalized
fn mentions_any(text: &str, needles: &[String]) -> bool {
    let text = normalize(text);
    needles.iter().any(|n| text.contains(n.as_str()))
}

fn clamp_unit(value: f64, what: &str) -> Result<f64> {
    if value.is_nan() {
        return Err(MemoryError::InvalidInput(format!("{} is not a number", what)));
    }
    Ok(value.clamp(0.0, 1.0))
}

pub(crate) fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Summary> {
    let ts: String = row.get(4)?;
    Ok(Summary {
        id: row.get(0)?,
        text: row.get(1)?,
        content_hash: row.get(2)?,
        relevance_score: row.get(3)?,
        timestamp: parse_ts(4, &ts)?,
    })
}

pub(crate) fn insight_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Insight> {
    let category: String = row.get(2)?;
    let ts: String = row.get(5)?;
    Ok(Insight {
        id: row.get(0)?,
        text: row.get(1)?,
        category: category
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?,
        content_hash: row.get(3)?,
        relevance_score: row.get(4)?,
        timestamp: parse_ts(5, &ts)?,
    })
}

fn fact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProfileFact> {
    let ts: String = row.get(4)?;
    Ok(ProfileFact {
        key: row.get(0)?,
        value: row.get(1)?,
        confidence: row.get(2)?,
        source: row.get(3)?,
        last_updated: parse_ts(4, &ts)?,
    })
}

pub(crate) const SUMMARY_COLUMNS: &str =
    "id, summary_text, content_hash, relevance_score, timestamp";
pub(crate) const INSIGHT_COLUMNS: &str =
    "id, insight_text, category, content_hash, relevance_score, timestamp";

/// Hash and recent-window checks shared by summaries and insights.
///
/// On a collision the surviving record keeps the higher relevance and the
/// caller stores nothing.
fn find_collision(
    tx: &Transaction<'_>,
    kind: &RecordTable,
    text: &str,
    hash: &str,
    relevance: f64,
) -> Result<Option<AddOutcome>> {
    let existing: Option<i64> = tx
        .query_row(
            &format!("SELECT id FROM {} WHERE content_hash = ?1", kind.table),
            params![hash],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        bump_relevance(tx, kind, id, relevance)?;
        return Ok(Some(AddOutcome::Duplicate(id)));
    }

    let mut stmt = tx.prepare(&format!(
        "SELECT id, {} FROM {} ORDER BY timestamp DESC, id DESC LIMIT ?1",
        kind.text_col, kind.table
    ))?;
    let recent = stmt
        .query_map(params![kind.window as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for (id, other) in recent {
        let similarity = jaccard_similarity(text, &other);
        if similarity > kind.threshold {
            bump_relevance(tx, kind, id, relevance)?;
            return Ok(Some(AddOutcome::Merged { into: id, similarity }));
        }
    }
    Ok(None)
}

fn bump_relevance(tx: &Transaction<'_>, kind: &RecordTable, id: i64, relevance: f64) -> Result<()> {
    tx.execute(
        &format!(
            "UPDATE {} SET relevance_score = MAX(relevance_score, ?1) WHERE id = ?2",
            kind.table
        ),
        params![relevance, id],
    )?;
    Ok(())
}

impl MemoryDb {
    /// Open or create the memory database
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let db = Self { path: path.into() };
        if let Some(parent) = db.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&db.path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS profile_facts (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 0.5,
                source TEXT NOT NULL DEFAULT 'conversation',
                last_updated TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                summary_text TEXT NOT NULL,
                content_hash TEXT NOT NULL UNIQUE,
                relevance_score REAL NOT NULL DEFAULT 0.5,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_summaries_relevance ON summaries(relevance_score DESC);
            CREATE INDEX IF NOT EXISTS idx_summaries_timestamp ON summaries(timestamp DESC);
            CREATE TABLE IF NOT EXISTS insights (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                insight_text TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT 'general',
                content_hash TEXT NOT NULL UNIQUE,
                relevance_score REAL NOT NULL DEFAULT 0.5,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_insights_relevance ON insights(relevance_score DESC);
            CREATE INDEX IF NOT EXISTS idx_insights_timestamp ON insights(timestamp DESC);
            CREATE TABLE IF NOT EXISTS memory_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        info!(path = %db.path.display(), "Memory database ready");
        Ok(db)
    }

    /// Open using the default path (~/.companion/memory.db)
    pub fn open_default() -> Result<Self> {
        Self::open(Self::default_path()?)
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or(MemoryError::NoHomeDir)?
            .join(".companion")
            .join("memory.db"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn connect(&self) -> Result<Connection> {
        Ok(Connection::open(&self.path)?)
    }

    // --- Profile facts ---

    /// Insert or update a fact.
    ///
    /// An existing fact is overwritten when the new confidence is at least
    /// as high, or when the value changed. A less confident restatement of
    /// the same value leaves it untouched.
    pub fn upsert_profile_fact(
        &self,
        key: &str,
        value: &str,
        confidence: f64,
        source: &str,
    ) -> Result<UpsertOutcome> {
        self.upsert_profile_fact_at(key, value, confidence, source, Utc::now())
    }

    pub fn upsert_profile_fact_at(
        &self,
        key: &str,
        value: &str,
        confidence: f64,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let key = canonical_key(key);
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            return Err(MemoryError::InvalidInput(
                "profile fact needs a key and a value".to_string(),
            ));
        }
        let confidence = clamp_unit(confidence, "confidence")?;

        let conn = self.connect()?;
        let existing: Option<(String, f64)> = conn
            .query_row(
                "SELECT value, confidence FROM profile_facts WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let outcome = match existing {
            None => {
                conn.execute(
                    "INSERT INTO profile_facts (key, value, confidence, source, last_updated)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![key, value, confidence, source, format_ts(now)],
                )?;
                UpsertOutcome::Inserted
            }
            Some((old_value, old_confidence)) if confidence >= old_confidence || old_value != value => {
                conn.execute(
                    "UPDATE profile_facts SET value = ?2, confidence = ?3, source = ?4, last_updated = ?5
                     WHERE key = ?1",
                    params![key, value, confidence, source, format_ts(now)],
                )?;
                UpsertOutcome::Updated
            }
            Some(_) => UpsertOutcome::Unchanged,
        };

        debug!(%key, confidence, ?outcome, "Profile fact upsert");
        Ok(outcome)
    }

    pub fn get_profile_fact(&self, key: &str) -> Result<Option<ProfileFact>> {
        let conn = self.connect()?;
        let fact = conn
            .query_row(
                "SELECT key, value, confidence, source, last_updated FROM profile_facts WHERE key = ?1",
                params![canonical_key(key)],
                fact_from_row,
            )
            .optional()?;
        Ok(fact)
    }

    pub fn all_profile_facts(&self) -> Result<Vec<ProfileFact>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT key, value, confidence, source, last_updated FROM profile_facts ORDER BY key",
        )?;
        let facts = stmt
            .query_map([], fact_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(facts)
    }

    // --- Summaries ---

    pub fn add_summary(&self, text: &str, relevance: f64) -> Result<AddOutcome> {
        self.add_summary_at(text, relevance, Utc::now())
    }

    /// Store a summary unless it repeats one already known.
    ///
    /// Rejected when its hash exists or its word overlap with any of the last
    /// [`SUMMARY_WINDOW`] summaries exceeds [`SUMMARY_SIMILARITY`].
    pub fn add_summary_at(&self, text: &str, relevance: f64, now: DateTime<Utc>) -> Result<AddOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(AddOutcome::Empty);
        }
        let relevance = clamp_unit(relevance, "relevance")?;
        let hash = content_hash(text);

        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        if let Some(outcome) = find_collision(&tx, &SUMMARIES, text, &hash, relevance)? {
            tx.commit()?;
            debug!(?outcome, "Summary not stored");
            return Ok(outcome);
        }

        tx.execute(
            "INSERT INTO summaries (summary_text, content_hash, relevance_score, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![text, hash, relevance, format_ts(now)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        debug!(id, relevance, "Summary stored");
        Ok(AddOutcome::Stored(id))
    }

    pub fn latest_summaries(&self, n: usize) -> Result<Vec<Summary>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM summaries ORDER BY timestamp DESC, id DESC LIMIT ?1",
            SUMMARY_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![n as i64], summary_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Most relevant summaries, optionally restricted to those mentioning a keyword.
    ///
    /// When no summary mentions any keyword the unfiltered ranking is returned.
    pub fn relevant_summaries(&self, keywords: &[String], limit: usize) -> Result<Vec<Summary>> {
        let conn = self.connect()?;
        Self::relevant(
            &conn,
            &SUMMARIES,
            SUMMARY_COLUMNS,
            keywords,
            limit,
            summary_from_row,
            |s| s.text.as_str(),
        )
    }

    // --- Insights ---

    pub fn add_insight(
        &self,
        text: &str,
        category: InsightCategory,
        relevance: f64,
    ) -> Result<AddOutcome> {
        self.add_insight_at(text, category, relevance, Utc::now())
    }

    /// Store an insight unless its hash exists or it overlaps any of the last
    /// [`INSIGHT_WINDOW`] insights by more than [`INSIGHT_SIMILARITY`].
    pub fn add_insight_at(
        &self,
        text: &str,
        category: InsightCategory,
        relevance: f64,
        now: DateTime<Utc>,
    ) -> Result<AddOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(AddOutcome::Empty);
        }
        let relevance = clamp_unit(relevance, "relevance")?;
        let hash = content_hash(text);

        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        if let Some(outcome) = find_collision(&tx, &INSIGHTS, text, &hash, relevance)? {
            tx.commit()?;
            debug!(?outcome, "Insight not stored");
            return Ok(outcome);
        }

        tx.execute(
            "INSERT INTO insights (insight_text, category, content_hash, relevance_score, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![text, category.as_str(), hash, relevance, format_ts(now)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        debug!(id, %category, relevance, "Insight stored");
        Ok(AddOutcome::Stored(id))
    }

    pub fn latest_insights(&self, n: usize) -> Result<Vec<Insight>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM insights ORDER BY timestamp DESC, id DESC LIMIT ?1",
            INSIGHT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![n as i64], insight_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn relevant_insights(&self, keywords: &[String], limit: usize) -> Result<Vec<Insight>> {
        let conn = self.connect()?;
        Self::relevant(
            &conn,
            &INSIGHTS,
            INSIGHT_COLUMNS,
            keywords,
            limit,
            insight_from_row,
            |i| i.text.as_str(),
        )
    }

    /// Rank every record, then keep those mentioning a keyword. Case is folded
    /// in Rust on both sides since SQLite's `lower()` only knows ASCII.
    fn relevant<T>(
        conn: &Connection,
        kind: &RecordTable,
        columns: &str,
        keywords: &[String],
        limit: usize,
        map: fn(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
        text_of: fn(&T) -> &str,
    ) -> Result<Vec<T>> {
        let keywords: Vec<String> = keywords
            .iter()
            .map(|k| normalize(k))
            .filter(|k| !k.is_empty())
            .collect();

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} ORDER BY relevance_score DESC, timestamp DESC, id DESC",
            columns, kind.table
        ))?;
        let ranked = stmt
            .query_map([], map)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mentions = |record: &T| mentions_any(text_of(record), &keywords);
        if !keywords.is_empty() {
            if ranked.iter().any(|r| mentions(r)) {
                return Ok(ranked.into_iter().filter(|r| mentions(r)).take(limit).collect());
            }
            debug!(table = kind.table, ?keywords, "No keyword match, using top records");
        }
        Ok(ranked.into_iter().take(limit).collect())
    }

    // --- Maintenance ---

    /// Delete every record whose text (or fact key/value) contains `pattern`,
    /// ignoring case
    pub fn forget(&self, pattern: &str) -> Result<usize> {
        let pattern = normalize(pattern);
        if pattern.is_empty() {
            return Err(MemoryError::InvalidInput("nothing to forget".to_string()));
        }
        let needle = [pattern];

        let mut conn = self.connect()?;
        let tx = conn.transaction()?;

        let facts: Vec<String> = {
            let mut stmt = tx.prepare("SELECT key, value FROM profile_facts")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .filter(|(k, v)| mentions_any(k, &needle) || mentions_any(v, &needle))
                .map(|(k, _)| k)
                .collect()
        };
        let mut deleted = 0;
        for key in &facts {
            deleted += tx.execute("DELETE FROM profile_facts WHERE key = ?1", params![key])?;
        }

        for kind in [&SUMMARIES, &INSIGHTS] {
            let ids: Vec<i64> = {
                let mut stmt =
                    tx.prepare(&format!("SELECT id, {} FROM {}", kind.text_col, kind.table))?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter()
                    .filter(|(_, text)| mentions_any(text, &needle))
                    .map(|(id, _)| id)
                    .collect()
            };
            for id in ids {
                deleted += tx.execute(
                    &format!("DELETE FROM {} WHERE id = ?1", kind.table),
                    params![id],
                )?;
            }
        }
        tx.commit()?;

        info!(deleted, "Forgot memories");
        Ok(deleted)
    }

    /// Remove everything, including consolidation bookkeeping
    pub fn clear(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            "BEGIN;
             DELETE FROM profile_facts;
             DELETE FROM summaries;
             DELETE FROM insights;
             DELETE FROM memory_meta;
             COMMIT;",
        )?;
        info!("Memory cleared");
        Ok(())
    }

    pub fn stats(&self) -> Result<MemoryStats> {
        let conn = self.connect()?;
        let count = |table: &str| -> Result<usize> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })?;
            Ok(n as usize)
        };
        Ok(MemoryStats {
            profile_facts: count("profile_facts")?,
            summaries: count("summaries")?,
            insights: count("insights")?,
            last_consolidation: self.last_consolidation()?,
        })
    }

    pub fn snapshot(&self) -> Result<MemorySnapshot> {
        let stats = self.stats()?;
        Ok(MemorySnapshot {
            exported_at: Utc::now(),
            profile: self.all_profile_facts()?,
            summaries: self.latest_summaries(stats.summaries)?,
            insights: self.latest_insights(stats.insights)?,
        })
    }

    pub fn last_consolidation(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.connect()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM memory_meta WHERE key = ?1",
                params![LAST_CONSOLIDATION_KEY],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| MemoryError::Timestamp(s))
        })
        .transpose()
    }

    pub(crate) fn set_last_consolidation_tx(tx: &Transaction<'_>, at: DateTime<Utc>) -> Result<()> {
        tx.execute(
            "INSERT INTO memory_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![LAST_CONSOLIDATION_KEY, format_ts(at)],
        )?;
        Ok(())
    }
}
