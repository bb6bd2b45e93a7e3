//! Server replies and telemetry lines.

use std::fmt;

use rigkeeper_core::DbfsLevel;

/// Status line of a successful reply.
pub const OK: &str = "OK";

/// Prefix of a failed reply.
pub const ERROR: &str = "ERROR";

/// Reply to malformed input.
pub const INVALID_COMMAND: &str = "Invalid command";

/// A complete reply: a status line plus optional data lines.
///
/// Encoded as a single buffer so the writer can emit it without any
/// telemetry line landing in the middle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    lines: Vec<String>,
}

impl Reply {
    /// `OK`
    pub fn ok() -> Self {
        Self {
            lines: vec![OK.to_string()],
        }
    }

    /// `ERROR <reason>`
    pub fn error(reason: impl fmt::Display) -> Self {
        Self {
            lines: vec![format!("{ERROR} {reason}")],
        }
    }

    /// `ERROR` with no reason, used when a process fails to spawn.
    pub fn bare_error() -> Self {
        Self {
            lines: vec![ERROR.to_string()],
        }
    }

    /// `Invalid command`
    pub fn invalid_command() -> Self {
        Self {
            lines: vec![INVALID_COMMAND.to_string()],
        }
    }

    /// Appends a data line.
    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }

    /// Appends data lines.
    pub fn lines<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lines.extend(lines.into_iter().map(Into::into));
        self
    }

    /// Encodes the reply as newline-terminated lines.
    ///
    /// Embedded CR/LF characters are replaced with spaces so a data value can
    /// never forge an extra line.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        for line in &self.lines {
            out.extend(line.chars().map(|c| if c == '\n' || c == '\r' { ' ' } else { c }));
            out.push('\n');
        }
        out.into_bytes()
    }
}

/// Encodes one telemetry sample: the level with one decimal place.
pub fn telemetry_line(level: DbfsLevel) -> Vec<u8> {
    format!("{level}\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_with_lines() {
        let reply = Reply::ok().line("VARA HF").lines(["VARA FM", "ARDOP"]);
        assert_eq!(reply.encode(), b"OK\nVARA HF\nVARA FM\nARDOP\n");
    }

    #[test]
    fn test_errors() {
        let reply = Reply::error("modem name 'Alpha' not found");
        assert_eq!(reply.encode(), b"ERROR modem name 'Alpha' not found\n");

        let reply = Reply::bare_error();
        assert_eq!(reply.encode(), b"ERROR\n");
    }

    #[test]
    fn test_invalid_command() {
        let reply = Reply::invalid_command();
        assert_eq!(reply.encode(), b"Invalid command\n");
    }

    #[test]
    fn test_encode_strips_embedded_newlines() {
        let reply = Reply::ok().line("bad\nname\r");
        assert_eq!(reply.encode(), b"OK\nbad name \n");
    }

    #[test]
    fn test_telemetry_line() {
        assert_eq!(telemetry_line(DbfsLevel(-96.0)), b"-96.0\n");
        assert_eq!(telemetry_line(DbfsLevel(-12.34)), b"-12.3\n");
    }
}
