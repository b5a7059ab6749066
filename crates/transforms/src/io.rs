//! Directory and archive access for the passes.

use crate::{Error, Result};
use std::fs;
use mtrace_core::read_entry;
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// One input of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// A class-file tree; each file becomes its own task.
    Directory {
        input: PathBuf,
        output: Option<PathBuf>,
    },
    /// An archive; its entries are handled sequentially by one task.
    Jar {
        input: PathBuf,
        output: Option<PathBuf>,
    },
}

impl Unit {
    pub fn input(&self) -> &Path {
        match self {
            Unit::Directory { input, .. } | Unit::Jar { input, .. } => input,
        }
    }

    /// The same unit without an output, as used by collection.
    pub fn read_only(&self) -> Unit {
        match self {
            Unit::Directory { input, .. } => Unit::Directory {
                input: input.clone(),
                output: None,
            },
            Unit::Jar { input, .. } => Unit::Jar {
                input: input.clone(),
                output: None,
            },
        }
    }
}

/// Returns true if `path` names a jar or zip archive.
pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jar") || e.eq_ignore_ascii_case("zip"))
}

/// Lists every regular file below `root`, sorted.
pub fn walk(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| Error::io(&dir, e))?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Creates the parent directory of `path`; failure is fatal.
pub fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|source| Error::OutputDir {
                path: parent.to_path_buf(),
                source,
            })
        }
        _ => Ok(()),
    }
}

/// Writes `data` to `path`, creating parent directories.
pub fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    ensure_parent(path)?;
    fs::write(path, data).map_err(|e| Error::io(path, e))
}

/// Calls `visit` with the name and bytes of every file entry of the archive.
pub fn scan_jar(path: &Path, mut visit: impl FnMut(&str, &[u8])) -> Result<()> {
    let file = fs::File::open(path).map_err(|e| Error::io(path, e))?;
    let mut archive = ZipArchive::new(file)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let declared = entry.size();
        let data = read_entry(&mut entry, declared).map_err(|e| Error::io(path.join(&name), e))?;
        visit(&name, &data);
    }
    Ok(())
}

/// Copies `input` to `output` entry by entry, replacing entries `rewrite` returns bytes for.
///
/// Entries `select` rejects are copied raw, without recompression. Returns the number of
/// replaced entries.
pub fn rewrite_jar(
    input: &Path,
    output: &Path,
    select: impl Fn(&str) -> bool,
    mut rewrite: impl FnMut(&str, &[u8]) -> Option<Vec<u8>>,
) -> Result<usize> {
    let file = fs::File::open(input).map_err(|e| Error::io(input, e))?;
    let mut archive = ZipArchive::new(file)?;
    let out = fs::File::create(output).map_err(|e| Error::io(output, e))?;
    let mut writer = ZipWriter::new(out);
    let mut replaced = 0;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() || !select(entry.name()) {
            writer.raw_copy_file(entry)?;
            continue;
        }
        let name = entry.name().to_string();
        let declared = entry.size();
        let data = read_entry(&mut entry, declared).map_err(|e| Error::io(input.join(&name), e))?;
        drop(entry);
        let data = match rewrite(&name, &data) {
            Some(rewritten) => {
                replaced += 1;
                rewritten
            }
            None => data,
        };
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        writer.start_file(name.as_str(), options)?;
        writer.write_all(&data).map_err(|e| Error::io(output, e))?;
    }
    writer.finish()?;
    Ok(replaced)
}
