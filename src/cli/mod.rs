//! Command-line interface parsing and dispatch.

mod init;
mod listing;
mod repl;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::warn;

use crate::core::config::data::{path_display, Config};
use crate::core::conversation::{Conversation, ConversationSettings};
use crate::core::llm::{build_provider, OpenAiCompatibleProvider, ProviderKind};
use crate::mcp::transport::DefaultConnector;
use crate::mcp::SessionRegistry;
use crate::utils::diagnostics::Diagnostics;
use crate::utils::logging::TranscriptLog;

#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(about = "Chat with an LLM that can call tools on MCP backends")]
#[command(
    long_about = "Switchboard connects to one or more tool-provider backends (local scripts, \
launched commands or event-stream services) and lets the model call their tools while you chat.\n\n\
Environment Variables:\n\
  OPENAI_API_KEY    API key for OpenAI-compatible endpoints (overrides the config file)\n\
  ANTHROPIC_API_KEY API key for Claude models (overrides the config file)\n\
  GEMINI_API_KEY    API key for Gemini models (overrides the config file)\n\
  OPENAI_BASE_URL   Chat endpoint base URL (overrides the config file)\n\
  RUST_LOG          Diagnostic filter for stderr output\n\n\
Type !help inside the chat for the list of commands. Ctrl+C interrupts a running turn; \
Ctrl+C or Ctrl+D at the prompt exits."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Chat model to use instead of models.selected
    #[arg(short = 'm', long, global = true, value_name = "MODEL")]
    pub model: Option<String>,

    /// Backend to start on instead of servers.default
    #[arg(short = 'b', long, global = true, value_name = "BACKEND")]
    pub backend: Option<String>,

    /// Print debug diagnostics to stderr
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Append the conversation transcript to this file
    #[arg(short = 'l', long, global = true, value_name = "FILE")]
    pub log: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Start the interactive chat (default)
    Chat,
    /// List configured backends
    Servers,
    /// Connect to a backend and list its tools
    Tools {
        /// Backend name
        backend: String,
    },
    /// Write a starter configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(async_main(Args::parse()));
    // A pending stdin read would otherwise keep the runtime alive.
    runtime.shutdown_background();
    result
}

async fn async_main(args: Args) -> Result<(), Box<dyn Error>> {
    let diagnostics = Diagnostics::init(args.debug);
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => Config::get_config_path()?,
    };

    if let Some(Commands::Init { force }) = &args.command {
        return init::write_starter_config(&config_path, *force);
    }

    let config = Config::load_from_path(&config_path)?;
    if config.system.debug && !args.debug {
        if let Err(err) = diagnostics.set_debug(true) {
            warn!(error = %err, "Unable to enable debug diagnostics");
        }
    }
    let backends = config.resolve_backends()?;

    match args.command.unwrap_or(Commands::Chat) {
        Commands::Servers => {
            listing::print_descriptors(&backends, config.servers.default.as_deref());
            Ok(())
        }
        Commands::Tools { backend } => {
            let registry = SessionRegistry::new(
                backends,
                Arc::new(DefaultConnector::new()?),
                config.timeout(),
            );
            let result = listing::print_backend_tools(&registry, &backend).await;
            registry.shutdown().await;
            result.map_err(Into::into)
        }
        Commands::Init { .. } => Ok(()),
        Commands::Chat => {
            let registry = Arc::new(SessionRegistry::new(
                backends,
                Arc::new(DefaultConnector::new()?),
                config.timeout(),
            ));
            if let Some(backend) = &args.backend {
                if !registry.contains(backend) {
                    return Err(format!(
                        "Unknown backend `{backend}` (available: {})",
                        registry.names().join(", ")
                    )
                    .into());
                }
            }
            let model = args.model.clone().unwrap_or_else(|| config.selected_model());
            let base_url = config.base_url();
            let kind = ProviderKind::select(&model, base_url.as_deref());
            let api_key = config.api_key(kind.api_key_env());
            let provider =
                build_provider(kind, base_url.as_deref(), api_key.clone(), config.timeout())?;
            // Model listing only speaks the OpenAI `/models` shape.
            let models_endpoint = match kind {
                ProviderKind::OpenAi => Some(Arc::new(OpenAiCompatibleProvider::new(
                    base_url.as_deref().unwrap_or(kind.default_base_url()),
                    api_key,
                    config.timeout(),
                )?)),
                ProviderKind::Anthropic | ProviderKind::Gemini => None,
            };

            let settings = ConversationSettings {
                model,
                system_message: config.system_message(),
                max_tool_rounds: config.max_tool_rounds(),
                auto_select: config.auto_select(),
                default_backend: args
                    .backend
                    .clone()
                    .or_else(|| config.servers.default.clone()),
                max_tokens: Some(config.max_tokens()),
            };
            let conversation = Conversation::new(registry.clone(), provider, settings);

            let mut transcript = TranscriptLog::new();
            if let Some(path) = &args.log {
                transcript.set_log_file(path).map_err(|err| {
                    format!("Unable to open log file {}: {err}", path_display(path))
                })?;
            }

            let mut preload = config.servers.preload.clone();
            if let Some(backend) = &args.backend {
                if !preload.contains(backend) {
                    preload.push(backend.clone());
                }
            }

            let mut repl = repl::Repl::new(
                conversation,
                models_endpoint,
                diagnostics,
                transcript,
                config.models.available.clone(),
            );
            repl.preload(&preload).await;
            let result = repl.run().await;
            registry.shutdown().await;
            result
        }
    }
}
