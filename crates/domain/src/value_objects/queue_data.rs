//! Commands carried by the durable queues
//!
//! Each `CommandKind` has its own named queue; the envelope payload on that
//! queue is the JSON encoding of the matching command struct. The queue name
//! selects the variant, so a payload can never be applied by the wrong handler.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{DiceResults, PlayerName};
use crate::error::DomainError;
use crate::ids::SessionId;

/// Command type, one durable queue each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Roll,
    EndSession,
}

impl CommandKind {
    pub const ALL: [CommandKind; 2] = [CommandKind::Roll, CommandKind::EndSession];

    /// Name of the durable queue for this command type.
    pub fn queue_name(self) -> &'static str {
        match self {
            CommandKind::Roll => "roll",
            CommandKind::EndSession => "end_session",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.queue_name())
    }
}

impl FromStr for CommandKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "roll" => Ok(CommandKind::Roll),
            "end_session" => Ok(CommandKind::EndSession),
            _ => Err(DomainError::parse(format!("Unknown queue: {}", s))),
        }
    }
}

/// Record one dice roll against the session that was current at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollCommand {
    pub session_id: SessionId,
    pub player: PlayerName,
    pub results: DiceResults,
    pub total: i64,
}

/// Close the open session.
///
/// `session_id` is the session that was current when the command was
/// published; `None` means "whatever session is latest".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndSessionCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Roll(RollCommand),
    EndSession(EndSessionCommand),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Roll(_) => CommandKind::Roll,
            Command::EndSession(_) => CommandKind::EndSession,
        }
    }

    /// JSON payload as written to the command's queue.
    pub fn encode_payload(&self) -> Result<String, serde_json::Error> {
        match self {
            Command::Roll(roll) => serde_json::to_string(roll),
            Command::EndSession(end) => serde_json::to_string(end),
        }
    }

    /// Decode a payload taken from the queue of `kind`.
    pub fn decode(kind: CommandKind, payload: &str) -> Result<Self, serde_json::Error> {
        match kind {
            CommandKind::Roll => serde_json::from_str(payload).map(Command::Roll),
            CommandKind::EndSession => serde_json::from_str(payload).map(Command::EndSession),
        }
    }
}

impl From<RollCommand> for Command {
    fn from(roll: RollCommand) -> Self {
        Command::Roll(roll)
    }
}

impl From<EndSessionCommand> for Command {
    fn from(end: EndSessionCommand) -> Self {
        Command::EndSession(end)
    }
}
