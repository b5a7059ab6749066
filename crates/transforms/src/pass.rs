use crate::config::is_traceable_file;
use crate::context::Stats;
use crate::io::{self, Unit};
use crate::{Error, Result};
use parking_lot::Mutex;
use rayon::ThreadPool;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use tracing::{error, info, warn};

/// What a pass did to one class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    Rewritten(Vec<u8>),
}

/// A per-class step of the pipeline.
pub trait ClassPass: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handles one class file.
    ///
    /// # Arguments
    /// * `entry` - Relative path or archive entry name, for diagnostics.
    /// * `bytes` - The class-file bytes.
    fn apply(&self, entry: &str, bytes: &[u8]) -> Result<Outcome>;
}

/// Runs `pass` over every unit on `pool` and waits for all tasks.
///
/// Units with an output get one: rewritten classes, untouched classes and non-class files
/// alike. A failing class or archive is logged and copied through. Only fatal errors are
/// returned, together with panics escaping a task.
pub fn run_pass(
    pool: &ThreadPool,
    pass: &dyn ClassPass,
    units: &[Unit],
    stats: &Stats,
) -> Result<()> {
    let fatal: Mutex<Option<Error>> = Mutex::new(None);
    let record = |e: Error| {
        if e.is_fatal() {
            error!("{:>14} {}", pass.name(), e);
            fatal.lock().get_or_insert(e);
        } else {
            warn!("{:>14} {}", pass.name(), e);
        }
    };

    let barrier = catch_unwind(AssertUnwindSafe(|| {
        pool.scope(|scope| {
            for unit in units {
                match unit {
                    Unit::Directory { input, output } => {
                        let files = match io::walk(input) {
                            Ok(files) => files,
                            Err(e) => {
                                record(e);
                                continue;
                            }
                        };
                        for file in files {
                            let record = &record;
                            scope.spawn(move |_| {
                                let output = output.as_deref();
                                if let Err(e) = process_file(pass, input, output, &file, stats) {
                                    record(e);
                                }
                            });
                        }
                    }
                    Unit::Jar { input, output } => {
                        let record = &record;
                        scope.spawn(move |_| {
                            if let Err(e) = process_jar(pass, input, output.as_deref(), stats) {
                                record(e);
                            }
                        });
                    }
                }
            }
        })
    }));

    if let Err(panic) = barrier {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "task panicked".to_string());
        error!("{:>14} barrier failed: {}", pass.name(), message);
        return Err(Error::Barrier(message));
    }
    match fatal.into_inner() {
        Some(e) => Err(e),
        None => {
            info!("{:>14} done ({} units)", pass.name(), units.len());
            Ok(())
        }
    }
}

fn process_file(
    pass: &dyn ClassPass,
    root: &Path,
    output: Option<&Path>,
    file: &Path,
    stats: &Stats,
) -> Result<()> {
    let relative = file.strip_prefix(root).unwrap_or(file);
    let entry = relative.to_string_lossy().replace('\\', "/");
    let target = output.map(|out| out.join(relative));
    if let Some(target) = &target {
        io::ensure_parent(target)?;
    }
    let bytes = std::fs::read(file).map_err(|e| Error::io(file, e))?;

    let file_name = file.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let data = if is_traceable_file(file_name) {
        match pass.apply(&entry, &bytes) {
            Ok(Outcome::Rewritten(rewritten)) => rewritten,
            Ok(Outcome::Unchanged) => bytes,
            Err(e) => {
                warn!("{:>14} {}: {}, copying through", pass.name(), entry, e);
                if target.is_some() {
                    Stats::bump(&stats.copied_through);
                }
                bytes
            }
        }
    } else {
        bytes
    };

    match target {
        Some(target) => std::fs::write(&target, data).map_err(|e| Error::io(&target, e)),
        None => Ok(()),
    }
}

fn process_jar(
    pass: &dyn ClassPass,
    input: &Path,
    output: Option<&Path>,
    stats: &Stats,
) -> Result<()> {
    let Some(output) = output else {
        return io::scan_jar(input, |entry, bytes| {
            if !is_traceable_file(entry) {
                return;
            }
            if let Err(e) = pass.apply(entry, bytes) {
                warn!("{:>14} {}!{}: {}", pass.name(), input.display(), entry, e);
            }
        });
    };

    io::ensure_parent(output)?;
    let rewritten = io::rewrite_jar(input, output, is_traceable_file, |entry, bytes| {
        match pass.apply(entry, bytes) {
            Ok(Outcome::Rewritten(data)) => Some(data),
            Ok(Outcome::Unchanged) => None,
            Err(e) => {
                warn!(
                    "{:>14} {}!{}: {}, copying through",
                    pass.name(),
                    input.display(),
                    entry,
                    e
                );
                Stats::bump(&stats.copied_through);
                None
            }
        }
    });
    match rewritten {
        Ok(count) => {
            tracing::debug!("{}: {} entries rewritten", input.display(), count);
            Ok(())
        }
        Err(e) => {
            warn!(
                "{:>14} {}: {}, copying archive through",
                pass.name(),
                input.display(),
                e
            );
            Stats::bump(&stats.copied_through);
            std::fs::copy(input, output)
                .map(|_| ())
                .map_err(|e| Error::io(output, e))
        }
    }
}
