//! Module for the `collect` subcommand, which classifies methods and writes the mapping files
//! without touching the inputs.

use super::{CommandError, PipelineArgs, build_units};
use async_trait::async_trait;
use clap::Args;
use mtrace_transform::pipeline::Pipeline;
use std::error::Error;

/// Arguments for the `collect` subcommand.
#[derive(Args)]
pub struct CollectArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

/// Executes the `collect` subcommand.
#[async_trait]
impl super::Command for CollectArgs {
    async fn execute(self) -> Result<(), Box<dyn Error>> {
        let units = build_units(&self.pipeline.inputs, None)?;
        let builder = self.pipeline.configuration()?;
        let paths = (
            builder.method_map_path.clone(),
            builder.ignore_method_map_path.clone(),
        );

        let summary = Pipeline::new(builder)
            .and_then(|p| p.collect(&units))
            .map_err(CommandError::from)?;

        println!(
            "{} classes scanned: {} methods traced (last id {}), {} ignored, {} UI classes need a focus callback",
            summary.stats.classes_scanned,
            summary.traced_methods,
            summary.last_id,
            summary.ignored_methods,
            summary.stats.focus_candidates
        );
        println!("Method mapping: {}", paths.0.display());
        println!("Ignored report: {}", paths.1.display());
        self.pipeline.emit(&summary)?;
        Ok(())
    }
}
