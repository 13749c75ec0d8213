//! Parsing of REPL input into queries and typed commands.

mod registry;

pub use registry::{all_commands, find_command, CommandSpec};

pub const COMMAND_PREFIX: char = '!';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Servers,
    Tools { backend: Option<String> },
    Connect { backend: String, query: Option<String> },
    Reconnect { backend: Option<String> },
    Disconnect { backend: String },
    Model { name: Option<String> },
    Models,
    Debug { enabled: Option<bool> },
    Log { file: Option<String> },
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Empty,
    Query(String),
    Command(Command),
    /// A `!` line that could not be parsed; carries the message to show.
    Invalid(String),
}

pub fn parse_input(line: &str) -> Input {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Empty;
    }
    let Some(body) = trimmed.strip_prefix(COMMAND_PREFIX) else {
        return Input::Query(trimmed.to_string());
    };

    let mut parts = body.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let args = parts.next().unwrap_or_default().trim();
    let Some(spec) = find_command(name) else {
        return Input::Invalid(format!(
            "Unknown command `{COMMAND_PREFIX}{name}`. Type {COMMAND_PREFIX}help for a list."
        ));
    };

    match parse_command(spec.name, args) {
        Some(command) => Input::Command(command),
        None => Input::Invalid(format!("Usage: {}", spec.usage)),
    }
}

fn optional_word(args: &str) -> Result<Option<String>, ()> {
    let mut words = args.split_whitespace();
    match (words.next(), words.next()) {
        (None, _) => Ok(None),
        (Some(word), None) => Ok(Some(word.to_string())),
        _ => Err(()),
    }
}

fn parse_command(name: &str, args: &str) -> Option<Command> {
    let command = match name {
        "help" if args.is_empty() => Command::Help,
        "servers" if args.is_empty() => Command::Servers,
        "models" if args.is_empty() => Command::Models,
        "quit" if args.is_empty() => Command::Quit,
        "tools" => Command::Tools {
            backend: optional_word(args).ok()?,
        },
        "reconnect" => Command::Reconnect {
            backend: optional_word(args).ok()?,
        },
        "disconnect" => Command::Disconnect {
            backend: optional_word(args).ok()??,
        },
        "model" => Command::Model {
            name: optional_word(args).ok()?,
        },
        "log" => Command::Log {
            file: optional_word(args).ok()?,
        },
        "connect" => {
            let mut parts = args.splitn(2, char::is_whitespace);
            let backend = parts.next().filter(|name| !name.is_empty())?.to_string();
            let query = parts
                .next()
                .map(str::trim)
                .filter(|query| !query.is_empty())
                .map(str::to_string);
            Command::Connect { backend, query }
        }
        "debug" => Command::Debug {
            enabled: match args.to_ascii_lowercase().as_str() {
                "" | "toggle" => None,
                "on" | "true" | "1" => Some(true),
                "off" | "false" | "0" => Some(false),
                _ => return None,
            },
        },
        _ => return None,
    };
    Some(command)
}

/// Help text listing every command.
pub fn help_text() -> String {
    let width = all_commands()
        .iter()
        .map(|command| command.usage.len())
        .max()
        .unwrap_or(0);
    let mut text = String::from("Commands:\n");
    for command in all_commands() {
        text.push_str(&format!("  {:width$}  {}\n", command.usage, command.help));
    }
    text.push_str("Anything else is sent to the model as a query.");
    text
}
