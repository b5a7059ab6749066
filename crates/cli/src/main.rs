use clap::Parser;
use mtrace_cli::commands::{Cmd, Command};

/// mtrace CLI
///
/// mtrace instruments compiled JVM classes with method enter/exit probes. It classifies every
/// method of the given class directories and jars, writes an id mapping, and rewrites the
/// inputs into an output directory.
#[derive(Parser)]
#[command(name = "mtrace")]
#[command(about = "mtrace: build-time method trace instrumentation for JVM bytecode")]
struct Cli {
    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Cmd,
}

/// Runs the mtrace CLI with the provided arguments.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .without_time()
        .init();

    cli.command.execute().await
}
