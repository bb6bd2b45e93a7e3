//! Parsing client command lines.

use std::fmt;

use thiserror::Error;

/// Maximum accepted command line length in bytes (excluding the newline).
pub const MAX_LINE_LENGTH: usize = 4096;

/// A parsed client command.
///
/// The first whitespace-delimited token selects the command and is matched
/// case-sensitively. For `start` and `monitor` the rest of the line, trimmed,
/// is the modem name, which may itself contain spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Launch a modem (and its CAT control) and hold it until the session ends
    Start { modem: String },

    /// Stream the input level of a modem's audio device
    Monitor { modem: String },

    /// End the session
    Stop,

    /// Report the service version
    Version,

    /// List configured modem names
    List,

    /// Dump the active configuration
    Config,
}

impl Command {
    /// Parses one line of client input.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let command = match verb {
            "start" => Self::Start {
                modem: required_name(verb, rest)?,
            },
            "monitor" => Self::Monitor {
                modem: required_name(verb, rest)?,
            },
            "stop" => no_argument(Self::Stop, rest)?,
            "version" => no_argument(Self::Version, rest)?,
            "list" => no_argument(Self::List, rest)?,
            "config" => no_argument(Self::Config, rest)?,
            "" => return Err(ProtocolError::Empty),
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };

        Ok(command)
    }

    /// Returns the command verb.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Monitor { .. } => "monitor",
            Self::Stop => "stop",
            Self::Version => "version",
            Self::List => "list",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start { modem } | Self::Monitor { modem } => write!(f, "{} {}", self.verb(), modem),
            _ => f.write_str(self.verb()),
        }
    }
}

fn required_name(verb: &str, rest: &str) -> Result<String, ProtocolError> {
    if rest.is_empty() {
        return Err(ProtocolError::MissingArgument(verb.to_string()));
    }
    Ok(rest.to_string())
}

fn no_argument(command: Command, rest: &str) -> Result<Command, ProtocolError> {
    if rest.is_empty() {
        Ok(command)
    } else {
        Err(ProtocolError::UnexpectedArgument(command.verb().to_string()))
    }
}

/// Malformed client input. Answered with `Invalid command`; the session
/// continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Command '{0}' requires a modem name")]
    MissingArgument(String),

    #[error("Command '{0}' takes no argument")]
    UnexpectedArgument(String),

    #[error("Line too long (max: {max} bytes)")]
    LineTooLong { max: usize },

    #[error("Line is not valid UTF-8")]
    InvalidEncoding,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(Command::parse("stop"), Ok(Command::Stop));
        assert_eq!(Command::parse("version\r"), Ok(Command::Version));
        assert_eq!(Command::parse("  list  "), Ok(Command::List));
        assert_eq!(Command::parse("config"), Ok(Command::Config));
    }

    #[test]
    fn test_parse_name_with_spaces() {
        assert_eq!(
            Command::parse("start VARA HF \r\n"),
            Ok(Command::Start {
                modem: "VARA HF".to_string()
            })
        );
        assert_eq!(
            Command::parse("monitor  My  Radio"),
            Ok(Command::Monitor {
                modem: "My  Radio".to_string()
            })
        );
    }

    #[test]
    fn test_parse_case_sensitive() {
        assert_eq!(
            Command::parse("STOP"),
            Err(ProtocolError::UnknownCommand("STOP".to_string()))
        );
        assert!(Command::parse("Start VARA").is_err());
    }

    #[test]
    fn test_parse_invalid() {
        assert_eq!(Command::parse(""), Err(ProtocolError::Empty));
        assert_eq!(Command::parse("   "), Err(ProtocolError::Empty));
        assert_eq!(
            Command::parse("start"),
            Err(ProtocolError::MissingArgument("start".to_string()))
        );
        assert_eq!(
            Command::parse("stop now"),
            Err(ProtocolError::UnexpectedArgument("stop".to_string()))
        );
        assert!(Command::parse("startVARA").is_err());
    }

    #[test]
    fn test_display_round_trips_verb() {
        let cmd = Command::parse("monitor VARA FM").unwrap();
        assert_eq!(cmd.to_string(), "monitor VARA FM");
        assert_eq!(Command::Stop.to_string(), "stop");
    }
}
