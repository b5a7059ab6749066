//! Module for the `trace` subcommand, which runs the full collect-then-rewrite pipeline.

use super::{CommandError, PipelineArgs, build_units};
use async_trait::async_trait;
use clap::Args;
use mtrace_transform::pipeline::Pipeline;
use std::error::Error;
use std::path::PathBuf;

/// Arguments for the `trace` subcommand.
#[derive(Args)]
pub struct TraceArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,
    /// Directory receiving the instrumented inputs.
    #[arg(short, long)]
    pub out: PathBuf,
}

/// Executes the `trace` subcommand.
#[async_trait]
impl super::Command for TraceArgs {
    async fn execute(self) -> Result<(), Box<dyn Error>> {
        let TraceArgs { pipeline, out } = self;
        let units = build_units(&pipeline.inputs, Some(out.as_path()))?;
        let builder = pipeline.configuration()?;
        let method_map = builder.method_map_path.clone();

        let summary = Pipeline::new(builder)
            .and_then(|p| p.trace(&units))
            .map_err(CommandError::from)?;

        println!(
            "{} methods traced, {} ignored, {} classes rewritten, {} focus callbacks added",
            summary.traced_methods,
            summary.ignored_methods,
            summary.stats.classes_rewritten,
            summary.stats.focus_synthesized
        );
        if summary.stats.copied_through > 0 {
            println!(
                "{} units copied through untraced (see warnings above)",
                summary.stats.copied_through
            );
        }
        println!("Method mapping: {}", method_map.display());
        println!("Output: {}", out.display());
        pipeline.emit(&summary)?;
        Ok(())
    }
}
