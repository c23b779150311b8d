//! Memory commands and the text shown for them

use anyhow::Context;
use chrono::Utc;
use companion_core::{ConversationSession, MemoryContext, SessionMemoryReport};
use companion_memory::{
    consolidate_if_due, ConsolidationPolicy, ConsolidationReport, MemoryDb, MemorySnapshot,
    UpsertOutcome,
};
use std::fmt::Write;
use std::path::Path;

use crate::ExportFormat;

pub fn render_overview(db: &MemoryDb, limit: usize) -> anyhow::Result<String> {
    let stats = db.stats()?;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} profile facts, {} summaries, {} insights",
        stats.profile_facts, stats.summaries, stats.insights
    );
    match stats.last_consolidation {
        Some(ts) => {
            let _ = writeln!(out, "Last consolidated {}", ts.format("%Y-%m-%d %H:%M UTC"));
        }
        None => out.push_str("Never consolidated\n"),
    }

    let facts = db.all_profile_facts()?;
    if !facts.is_empty() {
        out.push_str("\nProfile\n");
        for f in &facts {
            let _ = writeln!(out, "  {}: {} ({:.2}, {})", f.key, f.value, f.confidence, f.source);
        }
    }
    let summaries = db.latest_summaries(limit)?;
    if !summaries.is_empty() {
        out.push_str("\nRecent summaries\n");
        for s in &summaries {
            let _ = writeln!(out, "  [{:.2}] {}", s.relevance_score, s.text);
        }
    }
    let insights = db.latest_insights(limit)?;
    if !insights.is_empty() {
        out.push_str("\nRecent insights\n");
        for i in &insights {
            let _ = writeln!(out, "  [{:.2}] ({}) {}", i.relevance_score, i.category, i.text);
        }
    }
    Ok(out)
}

pub fn render_snapshot_text(snapshot: &MemorySnapshot) -> String {
    let mut out = format!(
        "Companion memory export, {}\n",
        snapshot.exported_at.format("%Y-%m-%d %H:%M UTC")
    );
    out.push_str("\n== Profile ==\n");
    for f in &snapshot.profile {
        let _ = writeln!(out, "{}: {} (confidence {:.2})", f.key, f.value, f.confidence);
    }
    out.push_str("\n== Summaries ==\n");
    for s in &snapshot.summaries {
        let _ = writeln!(out, "{}  {}", s.timestamp.format("%Y-%m-%d"), s.text);
    }
    out.push_str("\n== Insights ==\n");
    for i in &snapshot.insights {
        let _ = writeln!(out, "{}  [{}] {}", i.timestamp.format("%Y-%m-%d"), i.category, i.text);
    }
    out
}

pub fn export(db: &MemoryDb, format: ExportFormat, output: Option<&Path>) -> anyhow::Result<()> {
    let snapshot = db.snapshot()?;
    let body = match format {
        ExportFormat::Json => serde_json::to_string_pretty(&snapshot)?,
        ExportFormat::Text => render_snapshot_text(&snapshot),
    };
    match output {
        Some(path) => {
            std::fs::write(path, body)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Exported memory to {}", path.display());
        }
        None => println!("{}", body),
    }
    Ok(())
}

pub fn consolidate(
    db: &MemoryDb,
    policy: &ConsolidationPolicy,
    force: bool,
) -> anyhow::Result<String> {
    let now = Utc::now();
    let report = if force {
        Some(companion_memory::consolidate(db, policy, now)?)
    } else {
        consolidate_if_due(db, policy, now)?
    };
    Ok(match report {
        Some(report) => describe_consolidation(&report),
        None => "Consolidation not due yet (use --force to run anyway)".to_string(),
    })
}

fn describe_consolidation(report: &ConsolidationReport) -> String {
    if report.is_noop() {
        return "Consolidated: nothing to change".to_string();
    }
    format!(
        "Consolidated: merged {} summaries and {} insights, decayed {}, purged {}",
        report.summaries_merged, report.insights_merged, report.decayed, report.purged
    )
}

pub fn clear(db: &MemoryDb, confirmed: bool) -> anyhow::Result<()> {
    if !confirmed {
        anyhow::bail!("Refusing to clear memory without --yes");
    }
    db.clear()?;
    Ok(())
}

pub fn set_fact(db: &MemoryDb, key: &str, value: &str, confidence: f64) -> anyhow::Result<String> {
    let outcome = db.upsert_profile_fact(key, value, confidence, "manual")?;
    Ok(match outcome {
        UpsertOutcome::Inserted => format!("Added {} = {}", key, value),
        UpsertOutcome::Updated => format!("Updated {} = {}", key, value),
        UpsertOutcome::Unchanged => format!("Kept existing {} (it has higher confidence)", key),
    })
}

/// What `/context` prints in the line chat
pub fn render_context(context: &MemoryContext) -> String {
    if context.is_empty() {
        return "Nothing remembered yet.".to_string();
    }
    let mut out = String::new();
    for f in &context.profile {
        let _ = writeln!(out, "  {}: {}", f.key, f.value);
    }
    for s in &context.summaries {
        let _ = writeln!(out, "  - {}", s.text);
    }
    for i in &context.insights {
        let _ = writeln!(out, "  * ({}) {}", i.category, i.text);
    }
    out
}

pub fn describe_session(report: &SessionMemoryReport) -> String {
    let mut out = format!(
        "Remembered {} of {} exchanges: {} summaries, {} facts, {} insights",
        report.exchanges - report.skipped,
        report.exchanges,
        report.summaries_stored,
        report.facts_updated,
        report.insights_stored
    );
    if let Some(consolidation) = &report.consolidation {
        out.push('\n');
        out.push_str(&describe_consolidation(consolidation));
    }
    out
}

/// End-of-session processing shared by both chat frontends
pub async fn save_session(session: &mut ConversationSession) -> anyhow::Result<()> {
    if session.history().is_empty() {
        return Ok(());
    }
    eprintln!("Saving memories...");
    let report = session.process_session_memory().await?;
    eprintln!("{}", describe_session(&report));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_memory::InsightCategory;
    use tempfile::NamedTempFile;

    fn seeded() -> (NamedTempFile, MemoryDb) {
        let tmp = NamedTempFile::new().unwrap();
        let db = MemoryDb::open(tmp.path().to_path_buf()).unwrap();
        db.upsert_profile_fact("pet", "a greyhound called Biscuit", 0.9, "conversation")
            .unwrap();
        db.add_summary("Went to the coast for the weekend", 0.6).unwrap();
        db.add_insight("Recharges outdoors", InsightCategory::Personality, 0.7)
            .unwrap();
        (tmp, db)
    }

    #[test]
    fn test_overview_lists_everything() {
        let (_tmp, db) = seeded();
        let out = render_overview(&db, 5).unwrap();
        assert!(out.starts_with("1 profile facts, 1 summaries, 1 insights"));
        assert!(out.contains("Never consolidated"));
        assert!(out.contains("pet: a greyhound called Biscuit (0.90, conversation)"));
        assert!(out.contains("[0.60] Went to the coast for the weekend"));
        assert!(out.contains("(personality) Recharges outdoors"));
    }

    #[test]
    fn test_json_export_round_trips() {
        let (_tmp, db) = seeded();
        let out = NamedTempFile::new().unwrap();
        export(&db, ExportFormat::Json, Some(out.path())).unwrap();

        let raw = std::fs::read_to_string(out.path()).unwrap();
        let snapshot: MemorySnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(snapshot.profile.len(), 1);
        assert_eq!(snapshot.insights[0].category, InsightCategory::Personality);
    }

    #[test]
    fn test_clear_needs_confirmation() {
        let (_tmp, db) = seeded();
        assert!(clear(&db, false).is_err());
        assert_eq!(db.stats().unwrap().summaries, 1);
        clear(&db, true).unwrap();
        assert_eq!(db.stats().unwrap().summaries, 0);
    }

    #[test]
    fn test_set_fact_reports_outcome() {
        let (_tmp, db) = seeded();
        assert_eq!(set_fact(&db, "city", "Leeds", 1.0).unwrap(), "Added city = Leeds");
        assert!(set_fact(&db, "city", "Leeds", 0.5).unwrap().starts_with("Kept existing"));
    }

    #[test]
    fn test_consolidate_respects_interval() {
        let (_tmp, db) = seeded();
        let policy = ConsolidationPolicy::default();
        assert!(consolidate(&db, &policy, false).unwrap().starts_with("Consolidated"));
        assert!(consolidate(&db, &policy, false).unwrap().contains("not due"));
        assert!(consolidate(&db, &policy, true).unwrap().starts_with("Consolidated"));
    }
}
