//! System prompt assembly from stored memory

use companion_memory::{Insight, MemoryDb, ProfileFact, Summary};
use std::fmt::Write;
use tracing::debug;

/// Summaries pulled into a prompt
pub const CONTEXT_SUMMARIES: usize = 5;
/// Insights pulled into a prompt
pub const CONTEXT_INSIGHTS: usize = 8;
const MAX_KEYWORDS: usize = 3;

const PERSONA: &str = "You are a warm, curious companion who talks with the same person over many days. \
You remember what they have shared before and bring it up when it fits, the way a friend would.

HOW YOU TALK:
• Casual and natural; short replies unless they ask for depth
• Ask a follow-up question when it keeps the conversation going
• Use what you remember without announcing that you remember it
• Never invent memories; if you're unsure, ask
• Be honest when you don't know something";

/// What the companion currently knows that is relevant to the conversation
#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    pub profile: Vec<ProfileFact>,
    pub summaries: Vec<Summary>,
    pub insights: Vec<Insight>,
}

impl MemoryContext {
    /// All profile facts plus the summaries and insights ranked most relevant
    /// to `keywords` (most relevant overall when `keywords` is empty).
    pub fn load(db: &MemoryDb, keywords: &[String]) -> companion_memory::Result<Self> {
        let context = Self {
            profile: db.all_profile_facts()?,
            summaries: db.relevant_summaries(keywords, CONTEXT_SUMMARIES)?,
            insights: db.relevant_insights(keywords, CONTEXT_INSIGHTS)?,
        };
        debug!(
            facts = context.profile.len(),
            summaries = context.summaries.len(),
            insights = context.insights.len(),
            "Memory context loaded"
        );
        Ok(context)
    }

    pub fn is_empty(&self) -> bool {
        self.profile.is_empty() && self.summaries.is_empty() && self.insights.is_empty()
    }
}

/// Up to three lowercase words longer than three characters, in message order
pub fn extract_keywords(message: &str) -> Vec<String> {
    message
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| w.chars().count() > 3)
        .take(MAX_KEYWORDS)
        .collect()
}

pub fn build_system_prompt(context: &MemoryContext) -> String {
    let mut prompt = String::from(PERSONA);
    if context.is_empty() {
        return prompt;
    }

    prompt.push_str("\n\nWHAT YOU KNOW ABOUT THEM:");
    if !context.profile.is_empty() {
        prompt.push_str("\n\nProfile:");
        for fact in &context.profile {
            let _ = write!(prompt, "\n- {}: {}", fact.key, fact.value);
        }
    }
    if !context.summaries.is_empty() {
        prompt.push_str("\n\nPast conversations:");
        for summary in context.summaries.iter().take(CONTEXT_SUMMARIES) {
            let _ = write!(prompt, "\n- {}", summary.text);
        }
    }
    if !context.insights.is_empty() {
        prompt.push_str("\n\nThings you've noticed:");
        for insight in context.insights.iter().take(CONTEXT_INSIGHTS) {
            let _ = write!(prompt, "\n- [{}] {}", insight.category, insight.text);
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_memory::InsightCategory;
    use tempfile::NamedTempFile;

    #[test]
    fn test_extract_keywords() {
        assert_eq!(
            extract_keywords("Hey, what's the best PIZZA place downtown? Thanks!"),
            vec!["what's", "best", "pizza"]
        );
        assert!(extract_keywords("hi ok yes").is_empty());
        assert_eq!(extract_keywords("(guitar)..."), vec!["guitar"]);
    }

    #[test]
    fn test_empty_context_is_persona_only() {
        let prompt = build_system_prompt(&MemoryContext::default());
        assert_eq!(prompt, PERSONA);
        assert!(!prompt.contains("Profile:"));
    }

    #[test]
    fn test_prompt_includes_loaded_memory() {
        let tmp = NamedTempFile::new().unwrap();
        let db = MemoryDb::open(tmp.path().to_path_buf()).unwrap();
        db.upsert_profile_fact("name", "Sam", 0.9, "conversation").unwrap();
        db.add_summary("Sam is learning to bake sourdough", 0.6).unwrap();
        db.add_insight("Enjoys slow weekend projects", InsightCategory::Interests, 0.7)
            .unwrap();

        let context = MemoryContext::load(&db, &["sourdough".to_string()]).unwrap();
        let prompt = build_system_prompt(&context);

        assert!(prompt.contains("- name: Sam"));
        assert!(prompt.contains("- Sam is learning to bake sourdough"));
        assert!(prompt.contains("- [interests] Enjoys slow weekend projects"));
    }

    #[test]
    fn test_sections_omitted_when_empty() {
        let tmp = NamedTempFile::new().unwrap();
        let db = MemoryDb::open(tmp.path().to_path_buf()).unwrap();
        db.upsert_profile_fact("city", "Lyon", 0.8, "manual").unwrap();

        let prompt = build_system_prompt(&MemoryContext::load(&db, &[]).unwrap());
        assert!(prompt.contains("Profile:"));
        assert!(!prompt.contains("Past conversations:"));
        assert!(!prompt.contains("Things you've noticed:"));
    }
}
