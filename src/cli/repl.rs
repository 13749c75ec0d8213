//! The interactive prompt: reads lines, runs turns and handles `!` commands.

use std::error::Error;
use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::models::{fetch_models, sort_models};
use crate::cli::listing;
use crate::commands::{help_text, parse_input, Command, Input};
use crate::core::conversation::{Conversation, TurnError, TurnOutcome};
use crate::core::llm::OpenAiCompatibleProvider;
use crate::utils::diagnostics::Diagnostics;
use crate::utils::logging::TranscriptLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Repl {
    conversation: Conversation,
    /// Set when the chat endpoint can list its models.
    models_endpoint: Option<Arc<OpenAiCompatibleProvider>>,
    diagnostics: Diagnostics,
    transcript: TranscriptLog,
    models: Vec<String>,
}

impl Repl {
    pub fn new(
        conversation: Conversation,
        models_endpoint: Option<Arc<OpenAiCompatibleProvider>>,
        diagnostics: Diagnostics,
        transcript: TranscriptLog,
        models: Vec<String>,
    ) -> Self {
        Self {
            conversation,
            models_endpoint,
            diagnostics,
            transcript,
            models,
        }
    }

    /// Connects the listed backends up front. Failures are reported and the
    /// REPL starts anyway.
    pub async fn preload(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        for preload in self.conversation.registry().preload(names).await {
            match preload.result {
                Ok(tools) => println!("✅ {} ready ({tools} tools)", preload.name),
                Err(err) => eprintln!("⚠️  Could not connect to {}: {err}", preload.name),
            }
        }
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn Error>> {
        println!(
            "Switchboard using {}. Type {}help for commands, Ctrl+D to quit.",
            self.conversation.model(),
            crate::commands::COMMAND_PREFIX
        );
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            self.prompt()?;
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    None
                }
            };
            let Some(line) = line else {
                break;
            };

            let flow = match parse_input(&line) {
                Input::Empty => Flow::Continue,
                Input::Query(query) => {
                    self.run_query(&query, None).await;
                    Flow::Continue
                }
                Input::Command(command) => self.handle_command(command).await,
                Input::Invalid(message) => {
                    eprintln!("❌ {message}");
                    Flow::Continue
                }
            };
            if flow == Flow::Quit {
                break;
            }
        }
        println!("Goodbye.");
        Ok(())
    }

    fn prompt(&self) -> std::io::Result<()> {
        let mut stdout = std::io::stdout();
        match self.conversation.active_backend() {
            Some(backend) => write!(stdout, "[{backend}]> ")?,
            None => write!(stdout, "> ")?,
        }
        stdout.flush()
    }

    fn log(&self, entry: &str) {
        if let Err(err) = self.transcript.log_message(entry) {
            warn!(error = %err, "Failed to write transcript");
        }
    }

    /// Runs one turn. Ctrl+C while it runs interrupts the turn only.
    async fn run_query(&mut self, query: &str, explicit: Option<&str>) {
        self.log(&format!("You: {query}"));

        let cancel = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };
        let result = self.conversation.run_turn(query, explicit, &cancel).await;
        watcher.abort();

        match result {
            Ok(outcome) => {
                print!("{}", format_invocations(&outcome));
                println!("{}", outcome.reply);
                self.log(&format!(
                    "Assistant [{}]: {}",
                    outcome.decision.backend, outcome.reply
                ));
            }
            Err(TurnError::Interrupted) => {
                println!("\n⏹️  Interrupted");
                self.log("## Turn interrupted");
            }
            Err(err @ TurnError::ToolBudgetExceeded { .. }) => {
                println!("⚠️  {err}");
                self.log(&format!("## {err}"));
            }
            Err(err) => {
                eprintln!("❌ {err}");
                self.log(&format!("## Error: {err}"));
            }
        }
    }

    pub async fn handle_command(&mut self, command: Command) -> Flow {
        debug!(?command, "Running command");
        match command {
            Command::Help => println!("{}", help_text()),
            Command::Quit => return Flow::Quit,
            Command::Servers => {
                let statuses = self.conversation.registry().status().await;
                println!(
                    "{}",
                    listing::format_statuses(&statuses, self.conversation.active_backend())
                );
            }
            Command::Tools { backend } => {
                let Some(backend) = backend.or_else(|| self.active_name()) else {
                    eprintln!("❌ No active backend. Usage: !tools <backend>");
                    return Flow::Continue;
                };
                let registry = self.conversation.registry().clone();
                if let Err(err) = listing::print_backend_tools(&registry, &backend).await {
                    eprintln!("❌ {err}");
                }
            }
            Command::Connect {
                backend,
                query: Some(query),
            } => self.run_query(&query, Some(&backend)).await,
            Command::Connect {
                backend,
                query: None,
            } => match self.conversation.switch_backend(&backend).await {
                Ok(session) => {
                    let tools = session.list_tools().await.map(|tools| tools.len());
                    println!(
                        "✅ Switched to {backend} ({} tools)",
                        tools.unwrap_or_default()
                    );
                }
                Err(err) => eprintln!("❌ {err}"),
            },
            Command::Reconnect { backend } => {
                let Some(backend) = backend.or_else(|| self.active_name()) else {
                    eprintln!("❌ No active backend. Usage: !reconnect <backend>");
                    return Flow::Continue;
                };
                match self.conversation.registry().reconnect(&backend).await {
                    Ok(_) => println!("✅ Reconnected to {backend}"),
                    Err(err) => eprintln!("❌ {err}"),
                }
            }
            Command::Disconnect { backend } => {
                match self.conversation.registry().disconnect(&backend).await {
                    Ok(()) => {
                        self.conversation.release_backend(&backend);
                        println!("Disconnected from {backend}");
                    }
                    Err(err) => eprintln!("❌ {err}"),
                }
            }
            Command::Model { name: None } => {
                println!("Current model: {}", self.conversation.model());
            }
            Command::Model { name: Some(name) } => {
                self.conversation.set_model(&name);
                println!("Model set to {name}");
            }
            Command::Models => self.list_models().await,
            Command::Debug { enabled } => {
                let enabled = enabled.unwrap_or(!self.diagnostics.is_debug());
                match self.diagnostics.set_debug(enabled) {
                    Ok(()) => println!("Debug output {}", if enabled { "on" } else { "off" }),
                    Err(err) => eprintln!("❌ Unable to change debug output: {err}"),
                }
            }
            Command::Log { file: Some(file) } => match self.transcript.set_log_file(&file) {
                Ok(message) => println!("{message}"),
                Err(err) => eprintln!("❌ Unable to open log file {file}: {err}"),
            },
            Command::Log { file: None } => match self.transcript.toggle_logging() {
                Ok(message) => println!("{message}"),
                Err(message) => eprintln!("❌ {message}"),
            },
        }
        Flow::Continue
    }

    fn active_name(&self) -> Option<String> {
        self.conversation.active_backend().map(str::to_string)
    }

    async fn list_models(&self) {
        let current = self.conversation.model();
        if !self.models.is_empty() {
            println!("{}", format_models(&self.models, current));
            return;
        }
        let Some(endpoint) = &self.models_endpoint else {
            println!("Model listing needs an OpenAI-compatible endpoint; set models.available instead.");
            return;
        };
        match fetch_models(endpoint.client(), endpoint.base_url(), endpoint.api_key()).await {
            Ok(response) => {
                let mut models = response.data;
                sort_models(&mut models);
                let ids: Vec<String> = models.into_iter().map(|model| model.id).collect();
                println!("{}", format_models(&ids, current));
            }
            Err(err) => eprintln!("❌ Unable to list models: {err}"),
        }
    }
}

pub fn format_models(models: &[String], current: &str) -> String {
    if models.is_empty() {
        return "No models available.".to_string();
    }
    let mut text = String::from("🤖 Models\n");
    for model in models {
        let marker = if model == current { "*" } else { " " };
        text.push_str(&format!("{marker} {model}\n"));
    }
    text.trim_end().to_string()
}

/// One line per tool call made during the turn.
pub fn format_invocations(outcome: &TurnOutcome) -> String {
    outcome
        .invocations
        .iter()
        .map(|invocation| {
            let icon = if invocation.succeeded { "🔧" } else { "⚠️ " };
            format!("  {icon} {} via {}\n", invocation.tool, outcome.decision.backend)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::data::BackendConfig;
    use crate::core::conversation::{ConversationSettings, ToolInvocation};
    use crate::core::router::{DecisionSource, RouterDecision};
    use crate::mcp::SessionRegistry;
    use crate::utils::test_utils::{
        FakeBackend, FakeConnector, FakeToolReply, ScriptedProvider, ScriptedReply,
    };
    use std::time::Duration;

    fn repl(connector: &FakeConnector, provider: &ScriptedProvider) -> Repl {
        let registry = Arc::new(SessionRegistry::new(
            vec![
                BackendConfig::piped_script("weather", "weather.py"),
                BackendConfig::piped_script("maps", "maps.py"),
            ],
            Arc::new(connector.clone()),
            Duration::from_secs(5),
        ));
        let settings = ConversationSettings {
            model: "gpt-4o".to_string(),
            system_message: "Use tools.".to_string(),
            max_tool_rounds: 3,
            auto_select: false,
            default_backend: None,
            max_tokens: None,
        };
        let conversation = Conversation::new(registry, Arc::new(provider.clone()), settings);
        let models_endpoint = OpenAiCompatibleProvider::new(
            "http://127.0.0.1:9/v1",
            None,
            Duration::from_secs(1),
        )
        .expect("provider");
        Repl::new(
            conversation,
            Some(Arc::new(models_endpoint)),
            Diagnostics::init(false),
            TranscriptLog::new(),
            vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()],
        )
    }

    fn connector() -> FakeConnector {
        FakeConnector::new()
            .with_backend(
                "weather",
                FakeBackend::new().with_tool("get_forecast", FakeToolReply::Text("Rain".into())),
            )
            .with_backend("maps", FakeBackend::new())
    }

    #[tokio::test]
    async fn quit_stops_the_loop_and_model_switches() {
        let connector = connector();
        let provider = ScriptedProvider::new(Vec::new());
        let mut repl = repl(&connector, &provider);

        assert_eq!(repl.handle_command(Command::Quit).await, Flow::Quit);
        let flow = repl
            .handle_command(Command::Model {
                name: Some("gpt-4o-mini".to_string()),
            })
            .await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(repl.conversation.model(), "gpt-4o-mini");
    }

    #[tokio::test]
    async fn connect_without_query_sets_active_backend_and_disconnect_clears_it() {
        let connector = connector();
        let provider = ScriptedProvider::new(Vec::new());
        let mut repl = repl(&connector, &provider);

        repl.handle_command(Command::Connect {
            backend: "maps".to_string(),
            query: None,
        })
        .await;
        assert_eq!(repl.conversation.active_backend(), Some("maps"));
        assert_eq!(connector.opens("maps"), 1);
        assert_eq!(provider.calls(), 0);

        repl.handle_command(Command::Disconnect {
            backend: "maps".to_string(),
        })
        .await;
        assert_eq!(repl.conversation.active_backend(), None);
    }

    #[tokio::test]
    async fn connect_with_query_runs_a_pinned_turn() {
        let connector = connector();
        let provider = ScriptedProvider::new(vec![
            ScriptedReply::tool_call("get_forecast", serde_json::json!({"city": "Paris"})),
            ScriptedReply::text("Expect rain."),
        ]);
        let mut repl = repl(&connector, &provider);

        repl.handle_command(Command::Connect {
            backend: "weather".to_string(),
            query: Some("rain tomorrow?".to_string()),
        })
        .await;

        assert_eq!(repl.conversation.active_backend(), Some("weather"));
        assert_eq!(provider.calls(), 2);
        let last = repl.conversation.history().last().expect("reply");
        assert_eq!(last.content_str(), "Expect rain.");
    }

    #[test]
    fn model_list_marks_the_current_model() {
        let models = vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()];
        assert_eq!(
            format_models(&models, "gpt-4o-mini"),
            "🤖 Models\n  gpt-4o\n* gpt-4o-mini"
        );
        assert_eq!(format_models(&[], "gpt-4o"), "No models available.");
    }

    #[test]
    fn invocations_name_tool_and_backend() {
        let outcome = TurnOutcome {
            decision: RouterDecision::new("weather", DecisionSource::Explicit),
            reply: "done".to_string(),
            tool_rounds: 1,
            invocations: vec![
                ToolInvocation {
                    tool: "get_forecast".to_string(),
                    succeeded: true,
                },
                ToolInvocation {
                    tool: "get_alerts".to_string(),
                    succeeded: false,
                },
            ],
        };
        let text = format_invocations(&outcome);
        assert!(text.contains("🔧 get_forecast via weather"));
        assert!(text.contains("get_alerts via weather"));
        assert_eq!(text.lines().count(), 2);
    }
}
