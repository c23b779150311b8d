//! Companion CLI - a chat companion that remembers you
//!
//! Usage:
//!   companion chat      - Line-by-line chat in the terminal
//!   companion tui       - Full-screen chat
//!   companion memory    - Inspect and manage what the companion remembers
//!   companion key       - Store the API key in the OS keychain

mod chat;
mod keychain;
mod memory;
mod tui;

use clap::{Parser, Subcommand, ValueEnum};
use secrecy::{ExposeSecret, SecretString};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use companion_core::{ChatClient, CompanionConfig, ConversationSession, SessionSettings};
use keychain::{Keychain, KeychainError};

#[derive(Parser)]
#[command(name = "companion")]
#[command(version)]
#[command(about = "A chat companion with long-term memory", long_about = None)]
struct Cli {
    /// Config file (default: ~/.companion/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging on stderr (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat line by line on stdin/stdout
    Chat,

    /// Full-screen terminal chat
    Tui,

    /// Inspect and manage stored memory
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Manage the API key in the OS keychain
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Print the profile and the most recent summaries and insights
    Show {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Export everything
    Export {
        #[arg(long, value_enum, default_value_t = ExportFormat::Text)]
        format: ExportFormat,

        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Merge, age and purge memories
    Consolidate {
        /// Run even if the last consolidation is recent
        #[arg(long)]
        force: bool,
    },

    /// Delete every memory that mentions a phrase
    Forget {
        pattern: String,
    },

    /// Delete all memory
    Clear {
        /// Required; there is no undo
        #[arg(long)]
        yes: bool,
    },

    /// Set a profile fact by hand
    Fact {
        key: String,
        value: String,
        #[arg(long, default_value_t = 1.0)]
        confidence: f64,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Read an API key from stdin and store it
    Set,
    /// Remove the stored API key
    Clear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Text,
    Json,
}

const KEYCHAIN_SERVICE: &str = "companion";

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

/// Fill in the API key from the keychain when neither the config file nor the
/// environment provided one.
fn resolve_api_key(config: &mut CompanionConfig) {
    if config.has_api_key() {
        return;
    }
    match Keychain::new(KEYCHAIN_SERVICE).api_key() {
        Ok(key) => {
            debug!("Using API key from keychain");
            config.api_key = Some(key);
        }
        Err(KeychainError::NotFound) => {}
        Err(e) => warn!("Keychain unavailable: {}", e),
    }
}

fn start_session(config: &mut CompanionConfig) -> anyhow::Result<ConversationSession> {
    resolve_api_key(config);
    let llm = Arc::new(ChatClient::from_config(config)?);
    let db = config.open_memory()?;
    let session = ConversationSession::new(llm, db, SessionSettings::from_config(config))?;
    Ok(session)
}

fn read_api_key() -> anyhow::Result<SecretString> {
    print!("Paste your API key: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let key = SecretString::new(line.trim().to_string());
    if key.expose_secret().is_empty() {
        anyhow::bail!("No key entered");
    }
    Ok(key)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = CompanionConfig::load(cli.config.as_deref())?;
    debug!(?config, "Configuration loaded");

    match cli.command {
        Commands::Chat => {
            let session = start_session(&mut config)?;
            chat::run(session).await?;
        }

        Commands::Tui => {
            let session = start_session(&mut config)?;
            tui::run_tui(session, config.chat_model.clone()).await?;
        }

        Commands::Memory { action } => {
            let db = config.open_memory()?;
            match action {
                MemoryAction::Show { limit } => print!("{}", memory::render_overview(&db, limit)?),
                MemoryAction::Export { format, output } => {
                    memory::export(&db, format, output.as_deref())?
                }
                MemoryAction::Consolidate { force } => {
                    println!(
                        "{}",
                        memory::consolidate(&db, &config.consolidation_policy(), force)?
                    )
                }
                MemoryAction::Forget { pattern } => {
                    let deleted = db.forget(&pattern)?;
                    println!("Forgot {} memories mentioning \"{}\"", deleted, pattern);
                }
                MemoryAction::Clear { yes } => {
                    memory::clear(&db, yes)?;
                    println!("All memory cleared");
                }
                MemoryAction::Fact { key, value, confidence } => {
                    println!("{}", memory::set_fact(&db, &key, &value, confidence)?)
                }
            }
        }

        Commands::Key { action } => {
            let keychain = Keychain::new(KEYCHAIN_SERVICE);
            match action {
                KeyAction::Set => {
                    keychain.store_api_key(&read_api_key()?)?;
                    println!("API key stored in the keychain");
                }
                KeyAction::Clear => match keychain.delete_api_key() {
                    Ok(()) => println!("API key removed from the keychain"),
                    Err(KeychainError::NotFound) => println!("No API key stored"),
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    Ok(())
}
