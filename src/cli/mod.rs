use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "portshift")]
#[command(about = "Host-port collision supervisor for local Docker containers")]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Port for the status web server
    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    /// Lower bound of the dynamic port range
    #[arg(long, default_value_t = 10000)]
    pub min: u16,

    /// Upper bound of the dynamic port range
    #[arg(long, default_value_t = 65000)]
    pub max: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Launch a compose project with conflicting host ports pre-remapped
    Compose {
        /// Compose file (optionally preceded by -f) followed by the
        /// arguments passed through to docker-compose
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 1..)]
        args: Vec<String>,
    },
}

/// Splits the compose argument list into the descriptor path and the
/// passthrough arguments, honoring an optional leading `-f`.
pub fn split_compose_args(args: &[String]) -> Option<(PathBuf, Vec<String>)> {
    let (file, rest) = if args.first().map(String::as_str) == Some("-f") {
        (args.get(1)?, &args[2..])
    } else {
        (args.first()?, &args[1..])
    };
    Some((PathBuf::from(file), rest.to_vec()))
}
