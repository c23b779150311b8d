//! Companion Core - conversation orchestration
//!
//! Shared by every frontend (line chat, TUI). Holds the LLM client, the
//! memory analysis calls that decide what is worth keeping, the prompt
//! builder, and the session that ties them to the memory store.

pub mod config;
pub mod llm;
pub mod memory_ai;
pub mod prompt;
pub mod session;

pub use config::CompanionConfig;
pub use llm::{ChatClient, ChatMessage, CompletionOptions, LlmProvider, Role};
pub use memory_ai::{ExtractedFact, MemoryAnalyst};
pub use prompt::{build_system_prompt, extract_keywords, MemoryContext};
pub use session::{
    ConversationSession, Exchange, SessionEvent, SessionMemoryReport, SessionSettings,
    EMERGENCY_REPLY,
};

/// Core errors
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Memory error: {0}")]
    Memory(#[from] companion_memory::MemoryError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
