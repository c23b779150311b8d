//! Configuration
//!
//! Layered: built-in defaults, then `~/.companion/config.toml` (or an
//! explicit file), then `.env` and the process environment.

use companion_memory::{ConsolidationPolicy, MemoryDb};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{CoreError, Result};

/// Groq's OpenAI-compatible chat completions endpoint
pub const DEFAULT_API_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
pub const DEFAULT_CHAT_MODEL: &str = "deepseek-r1-distill-llama-70b";
/// Small, fast model for importance scoring and extraction
pub const DEFAULT_MEMORY_MODEL: &str = "llama-3.1-8b-instant";

pub struct CompanionConfig {
    pub api_key: Option<SecretString>,
    pub api_url: String,
    pub chat_model: String,
    pub memory_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// `None` means `~/.companion/memory.db`
    pub db_path: Option<PathBuf>,
    /// Past exchanges sent along with each new message
    pub history_turns: usize,
    pub consolidation_interval_hours: i64,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: DEFAULT_API_URL.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            memory_model: DEFAULT_MEMORY_MODEL.to_string(),
            temperature: 0.8,
            max_tokens: 1024,
            db_path: None,
            history_turns: 6,
            consolidation_interval_hours: 24,
        }
    }
}

impl std::fmt::Debug for CompanionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompanionConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_url", &self.api_url)
            .field("chat_model", &self.chat_model)
            .field("memory_model", &self.memory_model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("db_path", &self.db_path)
            .field("history_turns", &self.history_turns)
            .field("consolidation_interval_hours", &self.consolidation_interval_hours)
            .finish()
    }
}

/// On-disk shape; every field optional so a file only overrides what it names
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    api_key: Option<String>,
    api_url: Option<String>,
    chat_model: Option<String>,
    memory_model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    db_path: Option<PathBuf>,
    history_turns: Option<usize>,
    consolidation_interval_hours: Option<i64>,
}

impl CompanionConfig {
    /// Load configuration.
    ///
    /// An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Ok(env_file) = dotenvy::dotenv() {
            debug!(path = %env_file.display(), "Loaded .env");
        }

        let mut config = Self::default();
        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };
        if let Some(file) = file {
            let raw = std::fs::read_to_string(&file).map_err(|e| {
                CoreError::Config(format!("Failed to read {}: {}", file.display(), e))
            })?;
            config.apply_toml(&raw)?;
            debug!(path = %file.display(), "Loaded config file");
        }

        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".companion").join("config.toml"))
    }

    pub fn apply_toml(&mut self, raw: &str) -> Result<()> {
        let file: FileConfig =
            toml::from_str(raw).map_err(|e| CoreError::Config(format!("Invalid config: {}", e)))?;

        if let Some(key) = file.api_key.filter(|k| !k.trim().is_empty()) {
            self.set_api_key(key);
        }
        if let Some(v) = file.api_url {
            self.api_url = v;
        }
        if let Some(v) = file.chat_model {
            self.chat_model = v;
        }
        if let Some(v) = file.memory_model {
            self.memory_model = v;
        }
        if let Some(v) = file.temperature {
            self.temperature = v;
        }
        if let Some(v) = file.max_tokens {
            self.max_tokens = v;
        }
        if let Some(v) = file.db_path {
            self.db_path = Some(v);
        }
        if let Some(v) = file.history_turns {
            self.history_turns = v;
        }
        if let Some(v) = file.consolidation_interval_hours {
            self.consolidation_interval_hours = v;
        }
        Ok(())
    }

    /// Apply environment overrides through `lookup`. Blank values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("COMPANION_API_KEY").or_else(|| get("GROQ_API_KEY")) {
            self.set_api_key(key);
        }
        if let Some(v) = get("COMPANION_API_URL") {
            self.api_url = v;
        }
        if let Some(v) = get("COMPANION_CHAT_MODEL") {
            self.chat_model = v;
        }
        if let Some(v) = get("COMPANION_MEMORY_MODEL") {
            self.memory_model = v;
        }
        if let Some(v) = get("COMPANION_DB_PATH") {
            self.db_path = Some(PathBuf::from(v));
        }
    }

    pub fn set_api_key(&mut self, key: String) {
        self.api_key = Some(SecretString::new(key.trim().to_string()));
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key
            .as_ref()
            .is_some_and(|k| !k.expose_secret().is_empty())
    }

    pub fn open_memory(&self) -> companion_memory::Result<MemoryDb> {
        match &self.db_path {
            Some(path) => MemoryDb::open(path.clone()),
            None => MemoryDb::open_default(),
        }
    }

    pub fn consolidation_policy(&self) -> ConsolidationPolicy {
        ConsolidationPolicy {
            interval_hours: self.consolidation_interval_hours,
            ..ConsolidationPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = CompanionConfig::default();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.memory_model, DEFAULT_MEMORY_MODEL);
        assert!(!config.has_api_key());
    }

    #[test]
    fn test_toml_overrides_only_named_fields() {
        let mut config = CompanionConfig::default();
        config
            .apply_toml(
                r#"
                chat_model = "llama-3.3-70b-versatile"
                history_turns = 2
                db_path = "/tmp/companion-test.db"
                "#,
            )
            .unwrap();
        assert_eq!(config.chat_model, "llama-3.3-70b-versatile");
        assert_eq!(config.history_turns, 2);
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/companion-test.db")));
        assert_eq!(config.memory_model, DEFAULT_MEMORY_MODEL);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        let mut config = CompanionConfig::default();
        assert!(config.apply_toml("modle = \"typo\"").is_err());
    }

    #[test]
    fn test_env_precedence() {
        let env: HashMap<&str, &str> = [
            ("GROQ_API_KEY", "groq-key"),
            ("COMPANION_API_KEY", "companion-key"),
            ("COMPANION_CHAT_MODEL", "  "),
            ("COMPANION_MEMORY_MODEL", "tiny-model"),
        ]
        .into_iter()
        .collect();

        let mut config = CompanionConfig::default();
        config.apply_toml("chat_model = \"from-file\"").unwrap();
        config.apply_env(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(
            config.api_key.as_ref().unwrap().expose_secret(),
            "companion-key"
        );
        // Blank env value does not clobber the file
        assert_eq!(config.chat_model, "from-file");
        assert_eq!(config.memory_model, "tiny-model");
    }

    #[test]
    fn test_groq_key_fallback_and_redacted_debug() {
        let mut config = CompanionConfig::default();
        config.apply_env(|name| (name == "GROQ_API_KEY").then(|| "gsk_secret".to_string()));
        assert!(config.has_api_key());
        let debug = format!("{:?}", config);
        assert!(!debug.contains("gsk_secret"));
        assert!(debug.contains("<redacted>"));
    }
}
