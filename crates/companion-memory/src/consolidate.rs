//! Periodic consolidation: merge near-duplicates, age low-value records,
//! purge what nobody will miss.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use tracing::{debug, info};

use crate::sqlite::{
    insight_from_row, summary_from_row, MemoryDb, INSIGHTS, INSIGHT_COLUMNS, INSIGHT_SIMILARITY,
    SUMMARIES, SUMMARY_COLUMNS, SUMMARY_SIMILARITY,
};
use crate::text::{is_core_memory, jaccard_similarity};
use crate::types::InsightCategory;
use crate::Result;

#[derive(Debug, Clone)]
pub struct ConsolidationPolicy {
    /// Records older than this start to decay
    pub aging_days: i64,
    /// Relevance under which an old record counts as low value
    pub low_value: f64,
    /// Multiplier applied to a decaying record's relevance per run
    pub decay_factor: f64,
    pub purge_days: i64,
    pub purge_below: f64,
    pub summary_merge_threshold: f64,
    pub insight_merge_threshold: f64,
    /// Minimum time between runs for [`consolidate_if_due`]
    pub interval_hours: i64,
}

impl Default for ConsolidationPolicy {
    fn default() -> Self {
        Self {
            aging_days: 30,
            low_value: 0.5,
            decay_factor: 0.9,
            purge_days: 90,
            purge_below: 0.2,
            summary_merge_threshold: SUMMARY_SIMILARITY,
            insight_merge_threshold: INSIGHT_SIMILARITY,
            interval_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    pub summaries_merged: usize,
    pub insights_merged: usize,
    pub decayed: usize,
    pub purged: usize,
}

impl ConsolidationReport {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

struct Record {
    id: i64,
    text: String,
    relevance: f64,
    timestamp: DateTime<Utc>,
    general: bool,
}

/// Ids to delete so that no two surviving records overlap above `threshold`.
/// The more relevant record survives; on a tie the newer one.
fn merge_victims(records: &mut [Record], threshold: f64) -> Vec<i64> {
    records.sort_by(|a, b| {
        b.relevance
            .total_cmp(&a.relevance)
            .then(b.timestamp.cmp(&a.timestamp))
    });
    let mut kept: Vec<usize> = Vec::new();
    let mut victims = Vec::new();
    for (i, rec) in records.iter().enumerate() {
        let absorbed = kept
            .iter()
            .any(|&k| jaccard_similarity(&records[k].text, &rec.text) > threshold);
        if absorbed {
            victims.push(rec.id);
        } else {
            kept.push(i);
        }
    }
    victims
}

fn is_old(ts: DateTime<Utc>, now: DateTime<Utc>, days: i64) -> bool {
    now - ts > Duration::days(days)
}

/// Run one consolidation pass over summaries and insights.
///
/// Profile facts are not touched. Records that mention a core topic
/// (name, age, family, job, location) are never decayed or purged.
pub fn consolidate(
    db: &MemoryDb,
    policy: &ConsolidationPolicy,
    now: DateTime<Utc>,
) -> Result<ConsolidationReport> {
    let mut conn = db.connect()?;
    let tx = conn.transaction()?;
    let mut report = ConsolidationReport::default();

    let mut summaries: Vec<Record> = {
        let mut stmt = tx.prepare(&format!("SELECT {} FROM summaries", SUMMARY_COLUMNS))?;
        let rows = stmt
            .query_map([], summary_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|s| Record {
                id: s.id,
                text: s.text,
                relevance: s.relevance_score,
                timestamp: s.timestamp,
                general: false,
            })
            .collect()
    };
    let mut insights: Vec<Record> = {
        let mut stmt = tx.prepare(&format!("SELECT {} FROM insights", INSIGHT_COLUMNS))?;
        let rows = stmt
            .query_map([], insight_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|i| Record {
                id: i.id,
                text: i.text,
                relevance: i.relevance_score,
                timestamp: i.timestamp,
                general: i.category == InsightCategory::General,
            })
            .collect()
    };

    for (records, table, threshold, merged) in [
        (
            &mut summaries,
            SUMMARIES.table,
            policy.summary_merge_threshold,
            &mut report.summaries_merged,
        ),
        (
            &mut insights,
            INSIGHTS.table,
            policy.insight_merge_threshold,
            &mut report.insights_merged,
        ),
    ] {
        let victims = merge_victims(records, threshold);
        for id in &victims {
            tx.execute(&format!("DELETE FROM {} WHERE id = ?1", table), params![id])?;
        }
        records.retain(|r| !victims.contains(&r.id));
        *merged = victims.len();

        for rec in records.iter() {
            if is_core_memory(&rec.text) {
                continue;
            }
            let mut relevance = rec.relevance;
            if is_old(rec.timestamp, now, policy.aging_days)
                && (relevance < policy.low_value || rec.general)
            {
                relevance *= policy.decay_factor;
                tx.execute(
                    &format!("UPDATE {} SET relevance_score = ?1 WHERE id = ?2", table),
                    params![relevance, rec.id],
                )?;
                report.decayed += 1;
            }
            if is_old(rec.timestamp, now, policy.purge_days) && relevance < policy.purge_below {
                tx.execute(&format!("DELETE FROM {} WHERE id = ?1", table), params![rec.id])?;
                report.purged += 1;
                debug!(table, id = rec.id, relevance, "Purged stale memory");
            }
        }
    }

    MemoryDb::set_last_consolidation_tx(&tx, now)?;
    tx.commit()?;

    info!(
        summaries_merged = report.summaries_merged,
        insights_merged = report.insights_merged,
        decayed = report.decayed,
        purged = report.purged,
        "Memory consolidated"
    );
    Ok(report)
}

/// Consolidate only if the last run is at least `interval_hours` old.
pub fn consolidate_if_due(
    db: &MemoryDb,
    policy: &ConsolidationPolicy,
    now: DateTime<Utc>,
) -> Result<Option<ConsolidationReport>> {
    let due = match db.last_consolidation()? {
        Some(last) => now - last >= Duration::hours(policy.interval_hours),
        None => true,
    };
    if !due {
        debug!("Consolidation not due yet");
        return Ok(None);
    }
    consolidate(db, policy, now).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::format_ts;
    use crate::text::content_hash;
    use tempfile::NamedTempFile;

    fn temp_db() -> (NamedTempFile, MemoryDb) {
        let tmp = NamedTempFile::new().unwrap();
        let db = MemoryDb::open(tmp.path().to_path_buf()).unwrap();
        (tmp, db)
    }

    // Bypasses add-time dedup so tests can set up overlapping rows
    fn raw_summary(db: &MemoryDb, text: &str, relevance: f64, ts: DateTime<Utc>) -> i64 {
        let conn = db.connect().unwrap();
        conn.execute(
            "INSERT INTO summaries (summary_text, content_hash, relevance_score, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![text, content_hash(text), relevance, format_ts(ts)],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    fn relevance_of(db: &MemoryDb, id: i64) -> Option<f64> {
        db.latest_summaries(100)
            .unwrap()
            .into_iter()
            .find(|s| s.id == id)
            .map(|s| s.relevance_score)
    }

    #[test]
    fn test_merges_overlapping_summaries() {
        let (_tmp, db) = temp_db();
        let now = Utc::now();
        let weak = raw_summary(&db, "user is training for a marathon in the autumn", 0.3, now);
        let strong = raw_summary(&db, "user is training for a marathon in the fall", 0.8, now);
        raw_summary(&db, "asked how to fix a flat bike tire", 0.5, now);

        let report = consolidate(&db, &ConsolidationPolicy::default(), now).unwrap();
        assert_eq!(report.summaries_merged, 1);
        assert_eq!(relevance_of(&db, weak), None);
        assert_eq!(relevance_of(&db, strong), Some(0.8));
        assert_eq!(db.latest_summaries(10).unwrap().len(), 2);
    }

    #[test]
    fn test_aging_rules() {
        let (_tmp, db) = temp_db();
        let now = Utc::now();
        let old = now - Duration::days(45);

        let old_low = raw_summary(&db, "chatted about the weather", 0.4, old);
        let old_high = raw_summary(&db, "shared a detailed plan for a startup", 0.9, old);
        let new_low = raw_summary(&db, "said good morning", 0.4, now);
        let old_core = raw_summary(&db, "mentioned their job at the hospital", 0.4, old);

        let report = consolidate(&db, &ConsolidationPolicy::default(), now).unwrap();
        assert_eq!(report.decayed, 1);
        assert!((relevance_of(&db, old_low).unwrap() - 0.36).abs() < 1e-9);
        assert_eq!(relevance_of(&db, old_high), Some(0.9));
        assert_eq!(relevance_of(&db, new_low), Some(0.4));
        assert_eq!(relevance_of(&db, old_core), Some(0.4));
    }

    #[test]
    fn test_general_insights_decay_regardless_of_value() {
        let (_tmp, db) = temp_db();
        let now = Utc::now();
        let old = now - Duration::days(40);
        db.add_insight_at("Often asks follow-up questions", InsightCategory::General, 0.9, old)
            .unwrap();
        db.add_insight_at("Loves jazz piano", InsightCategory::Interests, 0.9, old)
            .unwrap();

        let report = consolidate(&db, &ConsolidationPolicy::default(), now).unwrap();
        assert_eq!(report.decayed, 1);

        let insights = db.latest_insights(10).unwrap();
        let general = insights.iter().find(|i| i.category == InsightCategory::General).unwrap();
        let interests = insights.iter().find(|i| i.category == InsightCategory::Interests).unwrap();
        assert!((general.relevance_score - 0.81).abs() < 1e-9);
        assert_eq!(interests.relevance_score, 0.9);
    }

    #[test]
    fn test_purges_stale_non_core() {
        let (_tmp, db) = temp_db();
        let now = Utc::now();
        let ancient = now - Duration::days(120);

        let stale = raw_summary(&db, "talked about a tv show", 0.1, ancient);
        let core = raw_summary(&db, "told me their name is Priya", 0.1, ancient);
        let kept = raw_summary(&db, "described a favorite hiking trail", 0.6, ancient);

        let report = consolidate(&db, &ConsolidationPolicy::default(), now).unwrap();
        assert_eq!(report.purged, 1);
        assert_eq!(relevance_of(&db, stale), None);
        assert_eq!(relevance_of(&db, core), Some(0.1));
        assert_eq!(relevance_of(&db, kept), Some(0.6));
    }

    #[test]
    fn test_core_inflections_survive_purge() {
        let (_tmp, db) = temp_db();
        let now = Utc::now();
        let ancient = now - Duration::days(120);

        let jobs = raw_summary(&db, "user switched jobs last spring", 0.1, ancient);
        let family = raw_summary(&db, "user's family lives nearby", 0.1, ancient);
        let names = raw_summary(&db, "user's names for their kids", 0.1, ancient);
        let stale = raw_summary(&db, "watched a cooking show", 0.1, ancient);

        let report = consolidate(&db, &ConsolidationPolicy::default(), now).unwrap();
        assert_eq!(report.purged, 1);
        assert_eq!(report.decayed, 1);
        assert_eq!(relevance_of(&db, stale), None);
        for id in [jobs, family, names] {
            assert_eq!(relevance_of(&db, id), Some(0.1));
        }
    }

    #[test]
    fn test_merges_overlapping_insights() {
        let (_tmp, db) = temp_db();
        let now = Utc::now();
        let conn = db.connect().unwrap();
        // Bypasses add-time dedup: 9 shared words of 11, similarity ~0.82
        for (text, relevance) in [
            ("gets energized by long walks in the hills on sundays", 0.4),
            ("gets energized by long walks in the hills on saturdays", 0.9),
        ] {
            conn.execute(
                "INSERT INTO insights (insight_text, category, content_hash, relevance_score, timestamp)
                 VALUES (?1, 'interests', ?2, ?3, ?4)",
                params![text, content_hash(text), relevance, format_ts(now)],
            )
            .unwrap();
        }

        let report = consolidate(&db, &ConsolidationPolicy::default(), now).unwrap();
        assert_eq!(report.insights_merged, 1);
        let left = db.latest_insights(10).unwrap();
        assert_eq!(left.len(), 1);
        assert!(left[0].text.ends_with("saturdays"));
        assert_eq!(left[0].relevance_score, 0.9);
    }

    #[test]
    fn test_decay_can_push_below_purge_line() {
        let (_tmp, db) = temp_db();
        let now = Utc::now();
        // 0.21 * 0.9 = 0.189 < 0.2
        let id = raw_summary(&db, "mentioned a sandwich", 0.21, now - Duration::days(100));

        let report = consolidate(&db, &ConsolidationPolicy::default(), now).unwrap();
        assert_eq!(report.decayed, 1);
        assert_eq!(report.purged, 1);
        assert_eq!(relevance_of(&db, id), None);
    }

    #[test]
    fn test_consolidate_if_due() {
        let (_tmp, db) = temp_db();
        let policy = ConsolidationPolicy::default();
        let now = Utc::now();

        assert!(consolidate_if_due(&db, &policy, now).unwrap().is_some());
        assert!(db.last_consolidation().unwrap().is_some());
        assert!(consolidate_if_due(&db, &policy, now + Duration::hours(2))
            .unwrap()
            .is_none());
        assert!(consolidate_if_due(&db, &policy, now + Duration::hours(25))
            .unwrap()
            .is_some());
    }
}
