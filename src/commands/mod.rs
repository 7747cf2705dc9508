//! Console commands driving the engine
//!
//! One line of input is one command. Output is returned as a [`Reply`];
//! progress of calls is reported through notifications instead.

pub mod call_api;
pub mod util_api;

use crate::engine::EngineHandle;
use crate::error::CommandError;
use crate::view::CallView;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start,
    Call(String),
    HangUp,
    Name(String),
    Users,
    Status,
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let arg = |command: &'static str, argument: &'static str| {
            if rest.is_empty() {
                Err(CommandError::MissingArgument { command, argument })
            } else {
                Ok(rest.to_owned())
            }
        };

        match word.to_ascii_lowercase().as_str() {
            "start" => Ok(ConsoleCommand::Start),
            "call" => arg("call", "a user name").map(ConsoleCommand::Call),
            "hangup" | "hang-up" => Ok(ConsoleCommand::HangUp),
            "name" => arg("name", "a new name").map(ConsoleCommand::Name),
            "users" => Ok(ConsoleCommand::Users),
            "status" => Ok(ConsoleCommand::Status),
            "help" | "?" => Ok(ConsoleCommand::Help),
            "quit" | "exit" => Ok(ConsoleCommand::Quit),
            other => Err(CommandError::Unknown(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Silent,
    Quit,
}

/// Parses and runs one console line.
pub async fn execute(
    line: &str,
    engine: &EngineHandle,
    view: &CallView,
) -> Result<Reply, CommandError> {
    if line.trim().is_empty() {
        return Ok(Reply::Silent);
    }
    let cmd: ConsoleCommand = line.parse()?;
    tracing::debug!(?cmd, "console command");

    let reply = match cmd {
        ConsoleCommand::Start => call_api::start(engine)?,
        ConsoleCommand::Call(target) => call_api::call(engine, view, &target).await?,
        ConsoleCommand::HangUp => call_api::hang_up(engine)?,
        ConsoleCommand::Name(name) => util_api::rename(engine, &name)?,
        ConsoleCommand::Users => util_api::users(view),
        ConsoleCommand::Status => util_api::status(engine).await?,
        ConsoleCommand::Help => Reply::Text(util_api::HELP.to_owned()),
        ConsoleCommand::Quit => Reply::Quit,
    };
    Ok(reply)
}
