//! Memory analysis - small LLM calls that decide what an exchange is worth
//!
//! Every call here degrades instead of failing: a broken or unparsable
//! reply falls back to a heuristic, an empty map, or `None`.

use companion_memory::InsightCategory;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::llm::{ChatMessage, CompletionOptions, LlmProvider};

/// Below this, an exchange is not worth an insight
pub const INSIGHT_MIN_IMPORTANCE: f64 = 0.4;

/// A fact the model pulled out of an exchange
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFact {
    pub value: String,
    pub confidence: f64,
}

/// Runs memory prompts against a (usually small, fast) model
pub struct MemoryAnalyst {
    llm: Arc<dyn LlmProvider>,
    model: Option<String>,
}

impl MemoryAnalyst {
    pub fn new(llm: Arc<dyn LlmProvider>, model: Option<String>) -> Self {
        Self { llm, model }
    }

    fn options(&self, temperature: f32, max_tokens: u32) -> CompletionOptions {
        let options = CompletionOptions::new(temperature, max_tokens);
        match &self.model {
            Some(model) => options.with_model(model.clone()),
            None => options,
        }
    }

    async fn ask(&self, prompt: String, temperature: f32, max_tokens: u32) -> Option<String> {
        let messages = [ChatMessage::user(prompt)];
        match self.llm.complete(&messages, &self.options(temperature, max_tokens)).await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Memory analysis call failed: {}", e);
                None
            }
        }
    }

    /// How much this exchange matters for long-term memory, 0.0 - 1.0
    pub async fn score_importance(&self, user_msg: &str, ai_msg: &str) -> f64 {
        let prompt = format!(
            "Rate how important this exchange is for remembering the user long-term, \
             from 0.0 to 1.0.\n\n\
             Guide:\n\
             - Personal details about the user: 0.7-1.0\n\
             - Emotionally significant moments: 0.6-0.9\n\
             - Preferences or opinions: 0.5-0.8\n\
             - Technical or practical discussion: 0.4-0.7\n\
             - Small talk: 0.1-0.3\n\n\
             User: {}\nAI: {}\n\n\
             Reply with the number only:",
            user_msg, ai_msg
        );

        let reply = self.ask(prompt, 0.1, 50).await;
        match reply.as_deref().and_then(parse_score) {
            Some(score) => {
                debug!(score, "Importance from model");
                score
            }
            None => {
                let score = heuristic_importance(user_msg, ai_msg);
                debug!(score, "Importance from keyword heuristic");
                score
            }
        }
    }

    /// Personal facts with confidences; empty when nothing usable comes back
    pub async fn extract_profile_facts(
        &self,
        user_msg: &str,
        ai_msg: &str,
    ) -> BTreeMap<String, ExtractedFact> {
        let prompt = format!(
            "List personal facts about the user stated in this exchange. \
             Give each a confidence from 0.0 to 1.0: explicit statements high, \
             preferences medium, things merely implied low.\n\n\
             User: {}\nAI: {}\n\n\
             Answer with JSON only, shaped like \
             {{\"favorite_food\": {{\"value\": \"ramen\", \"confidence\": 0.8}}}}. \
             Answer {{}} if there are none.\n\nJSON:",
            user_msg, ai_msg
        );

        match self.ask(prompt, 0.1, 200).await {
            Some(reply) => parse_facts(&reply),
            None => BTreeMap::new(),
        }
    }

    /// One to three sentences depending on importance; `None` on failure
    pub async fn summarize_exchange(
        &self,
        user_msg: &str,
        ai_msg: &str,
        importance: f64,
    ) -> Option<String> {
        let length = if importance < 0.3 {
            "in one short sentence"
        } else if importance > 0.7 {
            "in two or three sentences, keeping the key details"
        } else {
            "in one or two sentences"
        };
        let prompt = format!(
            "Summarize this exchange {}. Write about the user in the third person.\n\n\
             User: {}\nAI: {}\n\nSummary:",
            length, user_msg, ai_msg
        );
        self.ask(prompt, 0.3, 150).await.filter(|s| !s.trim().is_empty())
    }

    /// A short observation about the user, skipped for unimportant exchanges
    pub async fn generate_insight(
        &self,
        user_msg: &str,
        ai_msg: &str,
        importance: f64,
    ) -> Option<String> {
        if importance < INSIGHT_MIN_IMPORTANCE {
            return None;
        }
        let prompt = format!(
            "From this exchange, write one brief insight (1-2 sentences) about the user's \
             personality, interests, habits or goals.\n\n\
             User: {}\nAI: {}\n\nInsight:",
            user_msg, ai_msg
        );
        self.ask(prompt, 0.4, 150).await.filter(|s| !s.trim().is_empty())
    }

    pub async fn categorize_insight(&self, insight: &str) -> InsightCategory {
        let names: Vec<&str> = InsightCategory::ALL.iter().map(|c| c.as_str()).collect();
        let prompt = format!(
            "Pick the one category that fits this insight best: {}.\n\n\
             Insight: {}\n\nCategory:",
            names.join(", "),
            insight
        );
        match self.ask(prompt, 0.1, 20).await {
            Some(reply) => InsightCategory::parse_lenient(&reply),
            None => InsightCategory::General,
        }
    }
}

static SCORE_RE: OnceLock<Regex> = OnceLock::new();

/// First decimal number in the text, clamped to [0, 1]
pub fn parse_score(text: &str) -> Option<f64> {
    let re = SCORE_RE.get_or_init(|| Regex::new(r"\d*\.?\d+").expect("score pattern is valid"));
    let raw = re.find(text)?.as_str();
    let score: f64 = raw.parse().ok()?;
    Some(score.clamp(0.0, 1.0))
}

/// Keyword fallback when the model can't be asked or answers nonsense
pub fn heuristic_importance(user_msg: &str, ai_msg: &str) -> f64 {
    let combined = format!("{} {}", user_msg, ai_msg).to_lowercase();
    let words: Vec<&str> = combined
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    // Prefix match keeps inflections ("working", "favorites") but not "this" for "hi"
    let has_any = |list: &[&str]| words.iter().any(|w| list.iter().any(|kw| w.starts_with(kw)));

    if has_any(&["favorite", "prefer", "remember", "important"]) {
        0.7
    } else if has_any(&["project", "work", "coding"]) {
        0.5
    } else if has_any(&["hello", "hi", "thanks"]) {
        0.2
    } else {
        0.4
    }
}

/// Parse the model's fact JSON.
///
/// Accepts `{key: {value, confidence}}`, the same wrapped in `{"facts": ...}`,
/// and bare `{key: "value"}` pairs (confidence 0.5). Prose around the JSON
/// object is ignored.
pub fn parse_facts(reply: &str) -> BTreeMap<String, ExtractedFact> {
    let mut facts = BTreeMap::new();
    let (Some(start), Some(end)) = (reply.find('{'), reply.rfind('}')) else {
        return facts;
    };
    if end < start {
        return facts;
    }

    let parsed: Value = match serde_json::from_str(&reply[start..=end]) {
        Ok(v) => v,
        Err(e) => {
            debug!("Fact JSON did not parse: {}", e);
            return facts;
        }
    };
    let object = match parsed.get("facts").and_then(Value::as_object) {
        Some(inner) => inner,
        None => match parsed.as_object() {
            Some(obj) => obj,
            None => return facts,
        },
    };

    for (key, entry) in object {
        let (value, confidence) = match entry {
            Value::Object(fields) => (
                fields.get("value").and_then(scalar_text),
                fields.get("confidence").and_then(Value::as_f64).unwrap_or(0.5),
            ),
            other => (scalar_text(other), 0.5),
        };
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            facts.insert(
                key.clone(),
                ExtractedFact {
                    value,
                    confidence: confidence.clamp(0.0, 1.0),
                },
            );
        }
    }
    facts
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CoreError, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replies from a fixed script, then errors
    struct Scripted {
        replies: Mutex<Vec<Result<String>>>,
        seen: Mutex<Vec<CompletionOptions>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            let mut replies = replies;
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            options: &CompletionOptions,
        ) -> Result<String> {
            self.seen.lock().unwrap().push(options.clone());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(CoreError::Llm("script exhausted".to_string())))
        }

        fn name(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "script"
        }
    }

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score("0.85"), Some(0.85));
        assert_eq!(parse_score("Score: .6 overall"), Some(0.6));
        assert_eq!(parse_score("7"), Some(1.0));
        assert_eq!(parse_score("no idea"), None);
    }

    #[test]
    fn test_heuristic_importance() {
        assert_eq!(heuristic_importance("My favorite band is Low", ""), 0.7);
        assert_eq!(heuristic_importance("stuck on a coding bug", "let's see"), 0.5);
        assert_eq!(heuristic_importance("hi!", "Hello"), 0.2);
        // "this" must not count as "hi"
        assert_eq!(heuristic_importance("what is this", "a teapot"), 0.4);
        assert_eq!(heuristic_importance("I'm working on my projects", ""), 0.5);
        assert_eq!(heuristic_importance("these are my preferences", ""), 0.7);
        assert_eq!(heuristic_importance("my favorites are jazz records", ""), 0.7);
    }

    #[test]
    fn test_parse_facts_shapes() {
        let facts = parse_facts(
            "Sure! {\"city\": {\"value\": \"Porto\", \"confidence\": 0.9}, \"age\": 31, \"pet\": \"cat\"} done",
        );
        assert_eq!(facts.len(), 3);
        assert_eq!(facts["city"], ExtractedFact { value: "Porto".into(), confidence: 0.9 });
        assert_eq!(facts["age"].value, "31");
        assert_eq!(facts["pet"].confidence, 0.5);

        let wrapped = parse_facts(r#"{"facts": {"job": {"value": "nurse", "confidence": 1.4}}}"#);
        assert_eq!(wrapped["job"].confidence, 1.0);

        assert!(parse_facts("{}").is_empty());
        assert!(parse_facts("nothing here").is_empty());
        assert!(parse_facts("{not json}").is_empty());
        assert!(parse_facts(r#"{"hobby": {"value": ""}}"#).is_empty());
    }

    #[tokio::test]
    async fn test_score_uses_model_then_falls_back() {
        let llm = Scripted::new(vec![
            Ok("<think>personal</think> 0.9".to_string()),
            Ok("I can't rate that".to_string()),
            Err(CoreError::Llm("down".to_string())),
        ]);
        let analyst = MemoryAnalyst::new(llm.clone(), Some("small".to_string()));

        assert_eq!(analyst.score_importance("I have two kids", "Nice!").await, 0.9);
        assert_eq!(analyst.score_importance("thanks", "anytime").await, 0.2);
        assert_eq!(analyst.score_importance("my work project", "ok").await, 0.5);

        let seen = llm.seen.lock().unwrap();
        assert!(seen.iter().all(|o| o.model.as_deref() == Some("small")));
    }

    #[tokio::test]
    async fn test_insight_skipped_when_unimportant() {
        let llm = Scripted::new(vec![Ok("Likes chess".to_string())]);
        let analyst = MemoryAnalyst::new(llm.clone(), None);

        assert_eq!(analyst.generate_insight("hi", "hello", 0.2).await, None);
        assert!(llm.seen.lock().unwrap().is_empty());
        assert_eq!(
            analyst.generate_insight("I play chess", "cool", 0.6).await,
            Some("Likes chess".to_string())
        );
    }

    #[tokio::test]
    async fn test_categorize_falls_back_to_general() {
        let llm = Scripted::new(vec![Ok("Skills".to_string()), Ok("hobby stuff".to_string())]);
        let analyst = MemoryAnalyst::new(llm, None);
        assert_eq!(analyst.categorize_insight("x").await, InsightCategory::Skills);
        assert_eq!(analyst.categorize_insight("x").await, InsightCategory::General);
        assert_eq!(analyst.categorize_insight("x").await, InsightCategory::General);
    }
}
