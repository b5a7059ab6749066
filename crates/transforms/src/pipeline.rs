//! The two-stage pipeline: collect, persist, then rewrite.

use crate::collector::{HierarchyCollector, MethodCollector, write_ignored_report, write_method_map};
use crate::config::ConfigurationBuilder;
use crate::context::{PipelineContext, StatsSnapshot};
use crate::io::Unit;
use crate::mapping::{Identity, MappingReader, NameResolver};
use crate::pass::run_pass;
use crate::tracer::MethodTracer;
use crate::Result;
use mtrace_core::hierarchy::{BootstrapTypes, ClasspathTypes, SuperclassResolver};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Result of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSummary {
    /// Entries in the method map, including the dispatch entry.
    pub traced_methods: usize,
    /// Entries in the ignored report.
    pub ignored_methods: usize,
    /// Ids carried over from the base method map.
    pub preloaded_ids: usize,
    /// Highest id handed out.
    pub last_id: u32,
    /// Class and package entries in the block list.
    pub block_entries: usize,
    /// Common-superclass strategies tried before falling back to `java/lang/Object`.
    pub superclass_strategies: Vec<String>,
    /// Whether the rewrite stage ran.
    pub rewritten: bool,
    pub stats: StatsSnapshot,
    pub elapsed_ms: u64,
}

/// Owns the worker pool and the run state.
pub struct Pipeline {
    ctx: PipelineContext,
    pool: ThreadPool,
}

impl Pipeline {
    /// Loads the name mapping, resolves the block list and starts the worker pool.
    pub fn new(builder: ConfigurationBuilder) -> Result<Self> {
        let resolver = load_resolver(&builder);
        let threads = builder.threads.max(1);
        let config = builder.build(resolver.as_ref());
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("mtrace-{i}"))
            .build()?;
        Ok(Self {
            ctx: PipelineContext::new(config, resolver),
            pool,
        })
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Classifies every method of `units` and writes the method map and ignored report.
    ///
    /// Units are only read; outputs are ignored.
    pub fn collect(&self, units: &[Unit]) -> Result<TraceSummary> {
        let started = Instant::now();
        let preloaded = self.collect_inner(units)?;
        Ok(self.summary(preloaded, Vec::new(), false, started))
    }

    /// Runs collection, then rewrites every unit into its output.
    pub fn trace(&self, units: &[Unit]) -> Result<TraceSummary> {
        let started = Instant::now();
        if self.ctx.config.settings.classpath.is_empty() {
            warn!(
                "no classpath given: merges of platform types fall back to java/lang/Object, \
                 pass the platform jar as classpath for verifiable output"
            );
        }
        let preloaded = self.collect_inner(units)?;

        let roots: Vec<PathBuf> = units
            .iter()
            .map(|u| u.input().to_path_buf())
            .chain(self.ctx.config.settings.classpath.iter().cloned())
            .collect();
        let frames =
            SuperclassResolver::ladder(Arc::new(BootstrapTypes), Arc::new(ClasspathTypes::new(roots)));
        let strategies = frames.strategy_names().map(str::to_string).collect();
        let tracer = MethodTracer::new(&self.ctx, &frames);
        run_pass(&self.pool, &tracer, units, &self.ctx.stats)?;

        let summary = self.summary(preloaded, strategies, true, started);
        info!(
            "traced {} classes, {} probes, {} focus callbacks synthesized, {} copied through",
            summary.stats.classes_rewritten,
            summary.stats.probes_inserted,
            summary.stats.focus_synthesized,
            summary.stats.copied_through
        );
        Ok(summary)
    }

    fn collect_inner(&self, units: &[Unit]) -> Result<usize> {
        let settings = &self.ctx.config.settings;
        let read_only: Vec<Unit> = units.iter().map(Unit::read_only).collect();

        run_pass(
            &self.pool,
            &HierarchyCollector::new(&self.ctx),
            &read_only,
            &self.ctx.stats,
        )?;

        let mut preloaded = 0;
        if let Some(base) = &settings.base_method_map_path {
            match self.ctx.preload_base_map(base) {
                Ok(count) => preloaded = count,
                Err(e) => warn!("base method map skipped: {}", e),
            }
        }

        run_pass(
            &self.pool,
            &MethodCollector::new(&self.ctx),
            &read_only,
            &self.ctx.stats,
        )?;

        write_method_map(&self.ctx, &settings.method_map_path)?;
        write_ignored_report(&self.ctx, &settings.ignore_method_map_path)?;
        Ok(preloaded)
    }

    fn summary(
        &self,
        preloaded_ids: usize,
        superclass_strategies: Vec<String>,
        rewritten: bool,
        started: Instant,
    ) -> TraceSummary {
        TraceSummary {
            traced_methods: self.ctx.traced_len(),
            ignored_methods: self.ctx.ignored_len(),
            preloaded_ids,
            last_id: self.ctx.last_id(),
            block_entries: self.ctx.config.block_set.len(),
            superclass_strategies,
            rewritten,
            stats: self.ctx.stats.snapshot(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

fn load_resolver(builder: &ConfigurationBuilder) -> Arc<dyn NameResolver> {
    let Some(dir) = &builder.mapping_dir else {
        return Arc::new(Identity);
    };
    match MappingReader::read_dir(dir) {
        Ok(Some(mapping)) => Arc::new(mapping),
        Ok(None) => {
            info!("no mapping in {}, names are used as-is", dir.display());
            Arc::new(Identity)
        }
        Err(e) => {
            warn!("mapping unreadable, names are used as-is: {}", e);
            Arc::new(Identity)
        }
    }
}
