//! Conversation session
//!
//! Handles the memory ↔ LLM cycle for one sitting. Frontends (line chat, TUI)
//! provide a callback for status updates; the session handles the rest.

use chrono::{DateTime, Utc};
use companion_memory::{consolidate_if_due, ConsolidationPolicy, ConsolidationReport, MemoryDb, UpsertOutcome};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::CompanionConfig;
use crate::llm::{ChatMessage, CompletionOptions, LlmProvider};
use crate::memory_ai::MemoryAnalyst;
use crate::prompt::{build_system_prompt, extract_keywords, MemoryContext};
use crate::Result;

/// Exchanges at or below this importance are not remembered
pub const REMEMBER_THRESHOLD: f64 = 0.2;

/// Shown instead of a reply when the model can't be reached
pub const EMERGENCY_REPLY: &str =
    "Sorry, I'm having trouble thinking right now. Could you say that again in a moment?";

const FACT_SOURCE: &str = "conversation";

/// Events emitted while a message is processed, for UI updates
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Waiting for the model
    Thinking,
    /// Memory context reloaded for this message
    ContextRefreshed { keywords: Vec<String> },
    Response(String),
    Error(String),
}

/// One user message and the reply it got
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
    pub timestamp: DateTime<Utc>,
}

/// What end-of-session processing kept
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionMemoryReport {
    pub exchanges: usize,
    /// Scored at or below the remember threshold
    pub skipped: usize,
    pub summaries_stored: usize,
    pub facts_updated: usize,
    pub insights_stored: usize,
    /// `None` when consolidation was not due
    pub consolidation: Option<ConsolidationReport>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub chat_model: String,
    pub memory_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub history_turns: usize,
    pub consolidation: ConsolidationPolicy,
}

impl SessionSettings {
    pub fn from_config(config: &CompanionConfig) -> Self {
        Self {
            chat_model: config.chat_model.clone(),
            memory_model: config.memory_model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            history_turns: config.history_turns,
            consolidation: config.consolidation_policy(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&CompanionConfig::default())
    }
}

pub struct ConversationSession {
    llm: Arc<dyn LlmProvider>,
    analyst: MemoryAnalyst,
    db: MemoryDb,
    settings: SessionSettings,
    context: MemoryContext,
    history: Vec<Exchange>,
}

impl ConversationSession {
    pub fn new(llm: Arc<dyn LlmProvider>, db: MemoryDb, settings: SessionSettings) -> Result<Self> {
        let context = MemoryContext::load(&db, &[])?;
        let analyst = MemoryAnalyst::new(llm.clone(), Some(settings.memory_model.clone()));
        info!(
            db = %db.path().display(),
            model = %settings.chat_model,
            "Session started"
        );
        Ok(Self {
            llm,
            analyst,
            db,
            settings,
            context,
            history: Vec::new(),
        })
    }

    pub fn context(&self) -> &MemoryContext {
        &self.context
    }

    pub fn history(&self) -> &[Exchange] {
        &self.history
    }

    pub fn db(&self) -> &MemoryDb {
        &self.db
    }

    /// Answer one user message.
    ///
    /// Never fails: if the model can't be reached the error is reported
    /// through `on_event` and an apology is returned instead.
    pub async fn process_message<F>(&mut self, text: &str, mut on_event: F) -> String
    where
        F: FnMut(SessionEvent),
    {
        on_event(SessionEvent::Thinking);

        let keywords = extract_keywords(text);
        match MemoryContext::load(&self.db, &keywords) {
            Ok(context) => self.context = context,
            Err(e) => warn!("Keeping previous memory context: {}", e),
        }
        on_event(SessionEvent::ContextRefreshed { keywords });

        let messages = self.build_messages(text);
        let options = CompletionOptions::new(self.settings.temperature, self.settings.max_tokens)
            .with_model(self.settings.chat_model.clone());
        debug!(messages = messages.len(), "Sending conversation turn");

        match self.llm.complete(&messages, &options).await {
            Ok(reply) => {
                self.history.push(Exchange {
                    user: text.to_string(),
                    assistant: reply.clone(),
                    timestamp: Utc::now(),
                });
                on_event(SessionEvent::Response(reply.clone()));
                reply
            }
            Err(e) => {
                error!("Chat completion failed: {}", e);
                on_event(SessionEvent::Error(e.to_string()));
                EMERGENCY_REPLY.to_string()
            }
        }
    }

    fn build_messages(&self, text: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(build_system_prompt(&self.context))];
        let skip = self.history.len().saturating_sub(self.settings.history_turns);
        for exchange in &self.history[skip..] {
            messages.push(ChatMessage::user(exchange.user.clone()));
            messages.push(ChatMessage::assistant(exchange.assistant.clone()));
        }
        messages.push(ChatMessage::user(text));
        messages
    }

    /// Turn this session's exchanges into long-term memory, then consolidate
    /// if it is due. History is cleared.
    pub async fn process_session_memory(&mut self) -> Result<SessionMemoryReport> {
        let exchanges = std::mem::take(&mut self.history);
        let mut report = SessionMemoryReport {
            exchanges: exchanges.len(),
            ..Default::default()
        };
        info!(exchanges = exchanges.len(), "Processing session memory");

        for exchange in &exchanges {
            let importance = self
                .analyst
                .score_importance(&exchange.user, &exchange.assistant)
                .await;
            if importance <= REMEMBER_THRESHOLD {
                debug!(importance, "Exchange not worth remembering");
                report.skipped += 1;
                continue;
            }
            if let Err(e) = self.remember(exchange, importance, &mut report).await {
                warn!("Failed to remember exchange: {}", e);
            }
        }

        report.consolidation =
            consolidate_if_due(&self.db, &self.settings.consolidation, Utc::now())?;
        info!(
            summaries = report.summaries_stored,
            facts = report.facts_updated,
            insights = report.insights_stored,
            skipped = report.skipped,
            "Session memory processed"
        );
        Ok(report)
    }

    async fn remember(
        &self,
        exchange: &Exchange,
        importance: f64,
        report: &mut SessionMemoryReport,
    ) -> Result<()> {
        let (user, ai) = (exchange.user.as_str(), exchange.assistant.as_str());

        if let Some(summary) = self.analyst.summarize_exchange(user, ai, importance).await {
            if self.db.add_summary(&summary, importance)?.is_stored() {
                report.summaries_stored += 1;
            }
        }

        for (key, fact) in self.analyst.extract_profile_facts(user, ai).await {
            match self
                .db
                .upsert_profile_fact(&key, &fact.value, fact.confidence, FACT_SOURCE)
            {
                Ok(UpsertOutcome::Inserted | UpsertOutcome::Updated) => report.facts_updated += 1,
                Ok(UpsertOutcome::Unchanged) => {}
                Err(e) => warn!(key = %key, "Skipping fact: {}", e),
            }
        }

        if let Some(insight) = self.analyst.generate_insight(user, ai, importance).await {
            let category = self.analyst.categorize_insight(&insight).await;
            if self.db.add_insight(&insight, category, importance)?.is_stored() {
                report.insights_stored += 1;
            }
        }
        Ok(())
    }
}
