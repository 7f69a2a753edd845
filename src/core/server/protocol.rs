use crate::domain::error::{SerialdError, SerialdResult};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub const DEFAULT_MAX_COMMAND_LEN: usize = 4096;

/// Commands accepted on a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Open { path: String, baud_rate: String },
    Info { path: String },
    Close { path: String },
    Find { pattern: String },
    Exists { pattern: String },
    Ls,
    Exit,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Parse args: {0}")]
    Syntax(String),

    #[error("Invalid args count. Usage: `{usage}`")]
    Usage { command: &'static str, usage: &'static str },

    #[error("Invalid command.")]
    Unknown,
}

impl ParseError {
    /// A malformed `open` ends the connection, every other parse error
    /// leaves the command loop running.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ParseError::Usage { command: "open", .. })
    }
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let args = shell_words::split(line).map_err(|e| ParseError::Syntax(e.to_string()))?;
        let Some((name, rest)) = args.split_first() else {
            return Err(ParseError::Unknown);
        };

        let usage =
            |command: &'static str, usage: &'static str| ParseError::Usage { command, usage };
        match (name.as_str(), rest) {
            ("open", [path, baud]) => Ok(Command::Open {
                path: path.clone(),
                baud_rate: baud.clone(),
            }),
            ("open", _) => Err(usage("open", "open PATH BAUD_RATE")),
            ("info", [path]) => Ok(Command::Info { path: path.clone() }),
            ("info", _) => Err(usage("info", "info PATH")),
            ("close", [path]) => Ok(Command::Close { path: path.clone() }),
            ("close", _) => Err(usage("close", "close PATH")),
            ("find", [pattern]) => Ok(Command::Find {
                pattern: pattern.clone(),
            }),
            ("find", _) => Err(usage("find", "find PATTERN")),
            ("exists", [pattern]) => Ok(Command::Exists {
                pattern: pattern.clone(),
            }),
            ("exists", _) => Err(usage("exists", "exists PATTERN")),
            ("ls", []) => Ok(Command::Ls),
            ("ls", _) => Err(usage("ls", "ls")),
            ("exit", _) => Ok(Command::Exit),
            _ => Err(ParseError::Unknown),
        }
    }
}

/// Reply message. Absent fields are left out of the encoding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "Value", skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Reply {
    pub fn value(value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => Self {
                error: None,
                value: Some(value),
            },
            Err(e) => Self::error(e),
        }
    }

    pub fn error(error: impl fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            value: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Two-space indented JSON followed by a newline.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = serde_json::to_vec_pretty(self)
            .unwrap_or_else(|e| format!("{{\n  \"Error\": {:?}\n}}", e.to_string()).into_bytes());
        data.push(b'\n');
        data
    }
}

/// Read one command line of at most `max_len` bytes, without its `\n` or
/// `\r\n` terminator. `Ok(None)` means the peer went away, including in the
/// middle of a line.
pub async fn read_command_line<R>(reader: &mut R, max_len: usize) -> SerialdResult<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    // Room for the line plus a `\r\n` terminator.
    let limit = max_len as u64 + 2;
    (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;

    let terminated = buf.last() == Some(&b'\n');
    if terminated {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    if buf.len() > max_len {
        return Err(SerialdError::Protocol(format!(
            "Command line exceeds {} bytes",
            max_len
        )));
    }
    if !terminated {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}
