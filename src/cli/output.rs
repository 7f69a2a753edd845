use crate::cli::args::OutputFormat;
use serde_json;
use std::io::{self, Write};

/// Output writer trait for different formats
pub trait OutputWriter {
    fn write_ports(&self, ports: &[String]) -> Result<(), OutputError>;
    fn write_message(&self, message: &str) -> Result<(), OutputError>;
}

/// Output formatting errors
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Console output writer
pub struct ConsoleWriter {
    format: OutputFormat,
    quiet: bool,
}

impl ConsoleWriter {
    pub fn new(format: OutputFormat, quiet: bool) -> Self {
        Self { format, quiet }
    }

    /// Render the port list in the configured format.
    pub fn render_ports(&self, ports: &[String]) -> Result<String, OutputError> {
        Ok(match self.format {
            OutputFormat::Text => ports.iter().map(|p| format!("{}\n", p)).collect(),
            OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(ports)?),
        })
    }
}

impl OutputWriter for ConsoleWriter {
    fn write_ports(&self, ports: &[String]) -> Result<(), OutputError> {
        let rendered = self.render_ports(ports)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(rendered.as_bytes())?;
        stdout.flush()?;
        Ok(())
    }

    fn write_message(&self, message: &str) -> Result<(), OutputError> {
        if !self.quiet {
            println!("{}", message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_ports() {
        let ports = vec!["/dev/ttyACM0".to_string(), "/dev/ttyUSB0".to_string()];
        let text = ConsoleWriter::new(OutputFormat::Text, false).render_ports(&ports).unwrap();
        assert_eq!(text, "/dev/ttyACM0\n/dev/ttyUSB0\n");

        let json = ConsoleWriter::new(OutputFormat::Json, false).render_ports(&ports).unwrap();
        let parsed: Vec<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ports);
    }
}
