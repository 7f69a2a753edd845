use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Command line arguments for seriald
#[derive(Parser, Debug)]
#[command(
    name = "seriald",
    version = env!("CARGO_PKG_VERSION"),
    about = "Serial ports server",
    long_about = "Exposes the serial devices of this machine over TCP or a unix socket. \
                  Peers send line commands (open, close, info, find, exists, ls, exit) \
                  and an opened device becomes a raw byte pipe."
)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file path (default is `./.seriald.toml` or `~/.seriald.toml`)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Command to execute, `serve` when omitted
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the server
    Serve(ServeArgs),
    /// Connect to a server and pipe it through stdin/stdout
    Remote(RemoteArgs),
    /// List serial ports known to the driver
    Ports {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        output: OutputFormat,
    },
}

/// Output format options
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output
    Json,
}

#[derive(ClapArgs, Debug, Default)]
pub struct ServeArgs {
    /// The listen addr. Examples: `:5000`, `unix:/tmp/seriald.sock`
    #[arg(short, long)]
    pub addr: Option<String>,
}

#[derive(ClapArgs, Debug)]
pub struct RemoteArgs {
    /// The server addr. Example: `localhost:5000` or `unix:/path/conn.sock`
    #[arg(short, long)]
    pub addr: Option<String>,

    /// Send `exit` after the command
    #[arg(short, long)]
    pub exit: bool,

    /// Command line sent to the server
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Args {
    /// Log level from the flags, falling back to `configured`.
    pub fn log_level<'a>(&self, configured: &'a str) -> &'a str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            configured
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_is_default() {
        let args = Args::try_parse_from(["seriald", "-v"]).unwrap();
        assert!(args.command.is_none());
        assert_eq!(args.log_level("info"), "debug");
    }

    #[test]
    fn test_remote_collects_command() {
        let args = Args::try_parse_from([
            "seriald", "remote", "-a", "unix:/tmp/s.sock", "-e", "open", "/dev/ttyUSB0", "9600",
        ])
        .unwrap();
        match args.command {
            Some(Command::Remote(remote)) => {
                assert_eq!(remote.addr.as_deref(), Some("unix:/tmp/s.sock"));
                assert!(remote.exit);
                assert_eq!(remote.command, vec!["open", "/dev/ttyUSB0", "9600"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args =
            Args::try_parse_from(["seriald", "serve", "-a", ":6000", "-q", "-c", "x.toml"])
                .unwrap();
        assert_eq!(args.log_level("info"), "error");
        assert_eq!(args.config, Some(PathBuf::from("x.toml")));
        assert!(matches!(
            args.command,
            Some(Command::Serve(ServeArgs { addr: Some(ref a) })) if a == ":6000"
        ));
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Args::try_parse_from(["seriald", "-v", "-q"]).is_err());
    }
}
