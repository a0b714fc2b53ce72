pub mod executable;
pub mod get;
pub mod ping;
pub mod set;

use bytes::Bytes;
use itertools::Itertools;
use std::str::FromStr;
use std::{fmt, vec};
use strum_macros::{Display, EnumString};
use thiserror::Error as ThisError;

use crate::commands::executable::Executable;
use crate::frame::Frame;
use crate::store::Store;
use crate::Error;

use get::Get;
use ping::Ping;
use set::Set;

#[derive(Debug, PartialEq)]
pub enum Command {
    Get(Get),
    Ping(Ping),
    Set(Set),
}

/// Names are matched case-insensitively and always rendered in upper case.
#[derive(Debug, Clone, Copy, PartialEq, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
enum CommandName {
    Get,
    Ping,
    Set,
}

impl Executable for Command {
    fn exec(self, store: Store) -> Result<Frame, Error> {
        match self {
            Command::Get(cmd) => cmd.exec(store),
            Command::Ping(cmd) => cmd.exec(store),
            Command::Set(cmd) => cmd.exec(store),
        }
    }
}

impl TryFrom<Frame> for Command {
    type Error = CommandParserError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        let parser = &mut CommandParser::try_from(frame)?;

        let command_name = CommandName::from_str(parser.name()).map_err(|_| {
            CommandParserError::UnknownCommand {
                command: parser.name().to_string(),
            }
        })?;

        let command = match command_name {
            CommandName::Get => Get::try_from(&mut *parser).map(Command::Get),
            CommandName::Ping => Ping::try_from(&mut *parser).map(Command::Ping),
            CommandName::Set => Set::try_from(&mut *parser).map(Command::Set),
        }?;
        parser.finish()?;

        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, args): (CommandName, Vec<&Bytes>) = match self {
            Command::Get(cmd) => (CommandName::Get, vec![&cmd.key]),
            Command::Ping(cmd) => (CommandName::Ping, cmd.payload.iter().collect()),
            Command::Set(cmd) => (CommandName::Set, vec![&cmd.key, &cmd.value]),
        };

        write!(f, "{}", name)?;
        if !args.is_empty() {
            let args = args.iter().map(|arg| String::from_utf8_lossy(arg)).join(" ");
            write!(f, " {}", args)?;
        }
        Ok(())
    }
}

/// The command name and arguments of a request.
///
/// Clients send commands as a non-empty array of bulk strings: the first one is the command
/// name, the rest are its arguments, kept as raw bytes.
pub struct CommandParser {
    name: String,
    parts: vec::IntoIter<Bytes>,
}

impl TryFrom<Frame> for CommandParser {
    type Error = CommandParserError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        // Clients send commands to the Redis server as RESP arrays.
        let frames = match frame {
            Frame::Array(array) => array,
            frame => {
                return Err(CommandParserError::InvalidFrame {
                    expected: "array".to_string(),
                    actual: frame,
                })
            }
        };

        let mut parts = frames
            .into_iter()
            .map(|frame| match frame {
                Frame::Bulk(bytes) => Ok(bytes),
                frame => Err(CommandParserError::InvalidFrame {
                    expected: "bulk string".to_string(),
                    actual: frame,
                }),
            })
            .collect::<Result<Vec<_>, _>>()?
            .into_iter();

        let name = parts.next().ok_or(CommandParserError::EmptyCommand)?;

        Ok(Self {
            name: String::from_utf8_lossy(&name).to_uppercase(),
            parts,
        })
    }
}

impl CommandParser {
    /// The upper-cased command name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The arguments not consumed yet.
    pub fn args(&self) -> &[Bytes] {
        self.parts.as_slice()
    }

    fn next_bytes(&mut self) -> Result<Bytes, CommandParserError> {
        self.parts.next().ok_or_else(|| self.wrong_arity())
    }

    fn next_optional_bytes(&mut self) -> Option<Bytes> {
        self.parts.next()
    }

    /// Fails when arguments are left over.
    fn finish(&self) -> Result<(), CommandParserError> {
        if !self.args().is_empty() {
            return Err(self.wrong_arity());
        }
        Ok(())
    }

    fn wrong_arity(&self) -> CommandParserError {
        CommandParserError::WrongNumberOfArguments {
            command: self.name.clone(),
        }
    }
}

#[derive(Debug, ThisError, PartialEq)]
pub enum CommandParserError {
    #[error("protocol error; invalid frame, expected {expected}, got {actual}")]
    InvalidFrame { expected: String, actual: Frame },
    #[error("protocol error; empty command")]
    EmptyCommand,
    #[error("ERR unknown command {command}")]
    UnknownCommand { command: String },
    #[error("ERR wrong number of arguments for {command}")]
    WrongNumberOfArguments { command: String },
}

impl CommandParserError {
    /// Whether the request was not a command at all. The connection can't go on after such a
    /// request, every other error is sent back to the client as an error reply.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CommandParserError::InvalidFrame { .. } | CommandParserError::EmptyCommand
        )
    }
}
