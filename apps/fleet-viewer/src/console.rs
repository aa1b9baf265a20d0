use anyhow::{bail, Result};

/// One line typed at the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// A click anywhere on the dashboard.
    Click,
    Toggle(String),
    Play(String),
    Restart(String),
    Enable(String),
    Disable(String),
    Status,
    Quit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(ConsoleCommand::Click);
        };
        let agent = words.next().map(str::to_string);
        if let Some(extra) = words.next() {
            bail!("unexpected argument: {extra}");
        }

        let command = match (verb.to_ascii_lowercase().as_str(), agent) {
            ("click", None) => ConsoleCommand::Click,
            ("status", None) => ConsoleCommand::Status,
            ("quit" | "exit", None) => ConsoleCommand::Quit,
            ("toggle", Some(agent)) => ConsoleCommand::Toggle(agent),
            ("play", Some(agent)) => ConsoleCommand::Play(agent),
            ("restart", Some(agent)) => ConsoleCommand::Restart(agent),
            ("on" | "enable", Some(agent)) => ConsoleCommand::Enable(agent),
            ("off" | "disable", Some(agent)) => ConsoleCommand::Disable(agent),
            ("toggle" | "play" | "restart" | "on" | "enable" | "off" | "disable", None) => {
                bail!("{verb} needs an agent name")
            }
            (_, _) => bail!("unknown command: {verb}"),
        };
        Ok(command)
    }

    /// The agent a card-level command is aimed at.
    pub fn agent(&self) -> Option<&str> {
        match self {
            ConsoleCommand::Toggle(agent)
            | ConsoleCommand::Play(agent)
            | ConsoleCommand::Restart(agent)
            | ConsoleCommand::Enable(agent)
            | ConsoleCommand::Disable(agent) => Some(agent),
            ConsoleCommand::Click | ConsoleCommand::Status | ConsoleCommand::Quit => None,
        }
    }
}

pub const HELP: &str = "commands: <enter>|click, status, toggle <agent>, play <agent>, \
restart <agent>, on <agent>, off <agent>, quit";
