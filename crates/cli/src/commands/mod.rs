use async_trait::async_trait;
use clap::{Args, Subcommand};
use mtrace_transform::config::ConfigurationBuilder;
use mtrace_transform::io::{Unit, is_archive};
use sha3::{Digest, Sha3_256};
use std::error::Error;
use std::path::{Path, PathBuf};

pub mod collect;
pub mod decode;
pub mod trace;

use thiserror::Error;

/// Errors raised while preparing a pipeline run.
#[derive(Debug, Error)]
pub enum CommandError {
    /// An input is neither a directory nor a jar.
    #[error("unsupported input {0}: expected a class directory or a .jar")]
    UnsupportedInput(PathBuf),
    /// Two inputs would be written to the same output path.
    #[error("inputs {0} and {1} map to the same output")]
    OutputClash(PathBuf, PathBuf),
    /// The pipeline failed.
    #[error("pipeline error: {0}")]
    Pipeline(#[from] mtrace_transform::Error),
    /// File read/write error.
    #[error("file error: {0}")]
    File(#[from] std::io::Error),
    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// CLI subcommands for mtrace.
#[derive(Subcommand)]
pub enum Cmd {
    /// Collect, persist the method mapping, and write instrumented copies of the inputs.
    Trace(trace::TraceArgs),
    /// Classify methods and write the mapping files without rewriting anything.
    Collect(collect::CollectArgs),
    /// Print a class file's header, methods and bytecode.
    Decode(decode::DecodeArgs),
}

/// Trait for executing CLI subcommands.
#[async_trait]
pub trait Command {
    /// Executes the subcommand.
    ///
    /// # Returns
    /// A `Result` indicating success or an error if execution fails.
    async fn execute(self) -> Result<(), Box<dyn Error>>;
}

#[async_trait]
impl Command for Cmd {
    async fn execute(self) -> Result<(), Box<dyn Error>> {
        match self {
            Cmd::Trace(args) => args.execute().await,
            Cmd::Collect(args) => args.execute().await,
            Cmd::Decode(args) => args.execute().await,
        }
    }
}

/// Settings shared by `trace` and `collect`.
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// Class directories and jars to process.
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,
    /// JSON settings file; flags below override its fields.
    #[arg(long)]
    pub settings: Option<PathBuf>,
    /// Block list with -keepclass, -keeppackage and -keepmethod directives.
    #[arg(long)]
    pub block_list: Option<PathBuf>,
    /// Directory containing a ProGuard mapping.txt.
    #[arg(long)]
    pub mapping_dir: Option<PathBuf>,
    /// Method mapping of a previous build whose ids should be kept.
    #[arg(long)]
    pub base_map: Option<PathBuf>,
    /// Where to write the traced-method mapping.
    #[arg(long)]
    pub method_map: Option<PathBuf>,
    /// Where to write the ignored-method report.
    #[arg(long)]
    pub ignore_map: Option<PathBuf>,
    /// Platform or dependency jars used for type resolution only.
    #[arg(long = "classpath", value_delimiter = ',')]
    pub classpath: Vec<PathBuf>,
    /// Worker pool size.
    #[arg(long)]
    pub threads: Option<usize>,
    /// Skip re-parsing rewritten classes.
    #[arg(long)]
    pub no_check: bool,
    /// Path to emit a run summary as JSON (optional).
    #[arg(long)]
    pub emit: Option<PathBuf>,
}

impl PipelineArgs {
    /// Loads the settings file, if any, and applies the flags on top.
    pub fn configuration(&self) -> Result<ConfigurationBuilder, CommandError> {
        let mut builder = match &self.settings {
            Some(path) => ConfigurationBuilder::from_json_file(path)?,
            None => ConfigurationBuilder::default(),
        };
        if let Some(path) = &self.block_list {
            builder.block_list_path = Some(path.clone());
        }
        if let Some(path) = &self.mapping_dir {
            builder.mapping_dir = Some(path.clone());
        }
        if let Some(path) = &self.base_map {
            builder.base_method_map_path = Some(path.clone());
        }
        if let Some(path) = &self.method_map {
            builder.method_map_path = path.clone();
        }
        if let Some(path) = &self.ignore_map {
            builder.ignore_method_map_path = path.clone();
        }
        builder.classpath.extend(self.classpath.iter().cloned());
        if let Some(threads) = self.threads {
            builder.threads = threads;
        }
        if self.no_check {
            builder.check_output = false;
        }
        Ok(builder)
    }

    /// Writes `summary` to the `--emit` path, if given.
    pub fn emit<T: serde::Serialize>(&self, summary: &T) -> Result<(), CommandError> {
        if let Some(path) = &self.emit {
            std::fs::write(path, serde_json::to_string_pretty(summary)?)?;
            println!("Wrote run summary to {}", path.display());
        }
        Ok(())
    }
}

/// Output file name for a jar: `<stem>_<first 16 hex digits of sha3-256(path)>.jar`.
pub fn jar_output_name(input: &Path) -> String {
    let digest = Sha3_256::digest(input.to_string_lossy().as_bytes());
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("classes");
    format!("{stem}_{}.jar", &hex::encode(digest)[..16])
}

/// Turns the inputs into pass units, writing into `out` when given.
///
/// Directories map to `out/<dir name>`, jars to `out/<jar_output_name>`.
pub fn build_units(inputs: &[PathBuf], out: Option<&Path>) -> Result<Vec<Unit>, CommandError> {
    let mut units: Vec<Unit> = Vec::with_capacity(inputs.len());
    let mut claimed: Vec<(PathBuf, PathBuf)> = Vec::new();
    for input in inputs {
        let unit = if input.is_dir() {
            let output = out.map(|o| {
                o.join(input.file_name().map_or_else(|| "classes".into(), |n| n.to_os_string()))
            });
            Unit::Directory {
                input: input.clone(),
                output,
            }
        } else if input.is_file() && is_archive(input) {
            Unit::Jar {
                input: input.clone(),
                output: out.map(|o| o.join(jar_output_name(input))),
            }
        } else {
            return Err(CommandError::UnsupportedInput(input.clone()));
        };
        let output = match &unit {
            Unit::Directory { output, .. } | Unit::Jar { output, .. } => output.clone(),
        };
        if let Some(output) = output {
            if let Some((other, _)) = claimed.iter().find(|(_, o)| *o == output) {
                return Err(CommandError::OutputClash(other.clone(), input.clone()));
            }
            claimed.push((input.clone(), output));
        }
        units.push(unit);
    }
    Ok(units)
}
