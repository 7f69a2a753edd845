// seriald - Serial ports server
use clap::Parser;
use seriald::cli::args::{Args, Command};
use seriald::cli::commands::execute_command;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let is_remote = matches!(args.command, Some(Command::Remote(_)));

    let code = match execute_command(args).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };

    // A pending stdin read would keep the runtime from shutting down.
    if is_remote || code != 0 {
        std::process::exit(code);
    }
}
