use std::fmt;
use thiserror::Error;

/// Seriald unified error type
#[derive(Error, Debug)]
pub enum SerialdError {
    #[error("not found")]
    NotFound,

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Driver error: {message}")]
    Driver { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Protocol(String),

    #[error("{path} is already open")]
    AlreadyOpen { path: String },

    #[error("{path} is not open.")]
    NotOpen { path: String },

    #[error("{0}")]
    Close(#[from] CloseErrors),
}

impl SerialdError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SerialdError::NotFound)
    }
}

pub type SerialdResult<T> = Result<T, SerialdError>;

/// Failures collected from independent close/cleanup steps.
///
/// Every step is attempted; each failure is kept together with the label of
/// the step that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseErrors {
    entries: Vec<String>,
}

impl CloseErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one step under `label`.
    pub fn push<E: fmt::Display>(&mut self, label: impl AsRef<str>, result: Result<(), E>) {
        if let Err(e) = result {
            let label = label.as_ref();
            if label.is_empty() {
                self.entries.push(e.to_string());
            } else {
                self.entries.push(format!("{}: {}", label, e));
            }
        }
    }

    /// Fold a nested aggregate in, keeping its own labels.
    pub fn extend(&mut self, other: CloseErrors) {
        self.entries.extend(other.entries);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn into_result(self) -> Result<(), CloseErrors> {
        if self.entries.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for CloseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entries.join(" ~~~ "))
    }
}

impl std::error::Error for CloseErrors {}
