/// A REPL command as listed by `!help`.
pub struct CommandSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub usage: &'static str,
    pub help: &'static str,
}

pub fn all_commands() -> &'static [CommandSpec] {
    COMMANDS
}

pub fn find_command(name: &str) -> Option<&'static CommandSpec> {
    all_commands().iter().find(|command| {
        command.name.eq_ignore_ascii_case(name)
            || command
                .aliases
                .iter()
                .any(|alias| alias.eq_ignore_ascii_case(name))
    })
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "help",
        aliases: &["?"],
        usage: "!help",
        help: "Show available commands.",
    },
    CommandSpec {
        name: "servers",
        aliases: &["backends"],
        usage: "!servers",
        help: "List configured backends and their connection state.",
    },
    CommandSpec {
        name: "tools",
        aliases: &[],
        usage: "!tools [backend]",
        help: "List the tools of the active (or named) backend.",
    },
    CommandSpec {
        name: "connect",
        aliases: &["use"],
        usage: "!connect <backend> [query]",
        help: "Switch to a backend, optionally running a query on it right away.",
    },
    CommandSpec {
        name: "reconnect",
        aliases: &[],
        usage: "!reconnect [backend]",
        help: "Drop and reopen the active (or named) backend.",
    },
    CommandSpec {
        name: "disconnect",
        aliases: &[],
        usage: "!disconnect <backend>",
        help: "Close a backend's session.",
    },
    CommandSpec {
        name: "model",
        aliases: &[],
        usage: "!model [name]",
        help: "Show or switch the chat model.",
    },
    CommandSpec {
        name: "models",
        aliases: &[],
        usage: "!models",
        help: "List available models.",
    },
    CommandSpec {
        name: "debug",
        aliases: &[],
        usage: "!debug [on|off]",
        help: "Toggle debug logging on stderr.",
    },
    CommandSpec {
        name: "log",
        aliases: &[],
        usage: "!log [file]",
        help: "Start a transcript log, or pause/resume the current one.",
    },
    CommandSpec {
        name: "quit",
        aliases: &["exit", "q"],
        usage: "!quit",
        help: "Disconnect every backend and exit.",
    },
];
