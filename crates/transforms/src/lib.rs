pub mod collector;
pub mod config;
pub mod context;
pub mod io;
pub mod mapping;
pub mod method;
pub mod pass;
pub mod pipeline;
pub mod tracer;

use std::path::PathBuf;
use thiserror::Error;

/// Largest id a traced method can carry.
pub const METHOD_ID_MAX: u32 = 0xFFFFF;
/// Id reserved for the platform message-dispatch hook.
pub const METHOD_ID_DISPATCH: u32 = METHOD_ID_MAX - 1;

/// The reserved dispatch entry, as it appears in the method map.
pub const DISPATCH_CLASS: &str = "android.os.Handler";
pub const DISPATCH_METHOD: &str = "dispatchMessage";
pub const DISPATCH_DESC: &str = "(Landroid.os.Message;)V";

/// Classes whose subclasses are UI entry points.
pub const UI_ENTRY_BASES: &[&str] = &[
    "android/app/Activity",
    "android/support/v4/app/FragmentActivity",
    "android/support/v7/app/AppCompatActivity",
    "androidx/fragment/app/FragmentActivity",
    "androidx/appcompat/app/AppCompatActivity",
];

/// The focus callback every UI entry point is guaranteed to have after rewriting.
pub const FOCUS_METHOD: &str = "onWindowFocusChanged";
pub const FOCUS_DESC: &str = "(Z)V";

/// Transform error type encompassing all pipeline errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Class-file parsing, editing or encoding failed.
    #[error("class file error: {0}")]
    Core(#[from] mtrace_core::result::Error),

    /// Reading or writing a file failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading or writing an archive failed.
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Settings or summary (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An output directory could not be created.
    #[error("cannot create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A task escaped the fork-join barrier by panicking.
    #[error("task barrier failed: {0}")]
    Barrier(String),

    /// The worker pool could not be started.
    #[error("worker pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    /// A rewritten class did not parse back.
    #[error("rewritten class {class} failed the output check: {reason}")]
    OutputCheck { class: String, reason: String },
}

impl Error {
    /// Fatal errors abort the whole invocation; everything else degrades one unit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::OutputDir { .. } | Error::Barrier(_) | Error::Pool(_)
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

/// Transform result type
pub type Result<T> = std::result::Result<T, Error>;

/// Converts an internal name (`a/b/C`) or descriptor to its dotted form.
pub fn dotted(name: &str) -> String {
    name.replace('/', ".")
}
