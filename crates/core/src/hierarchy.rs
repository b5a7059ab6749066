//! Type-hierarchy lookups and common-superclass resolution.
//!
//! A [`TypeSource`] answers "what are the supertypes of this class". Two are provided: the
//! built-in [`BootstrapTypes`] table and the lazily indexed [`ClasspathTypes`] over class
//! directories and jars. [`SuperclassResolver`] runs an ordered list of named strategies built
//! on top of them and falls back to `java/lang/Object` when every strategy fails.

use crate::class_file::ClassFile;
use crate::frames::CommonSuperclass;
use crate::result::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const OBJECT: &str = "java/lang/Object";

/// Supertype information of one class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassHeader {
    pub name: String,
    /// `None` only for `java/lang/Object`.
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub is_interface: bool,
}

impl ClassHeader {
    pub fn from_class(class: &ClassFile) -> Result<ClassHeader> {
        Ok(ClassHeader {
            name: class.name()?.to_string(),
            super_name: class.super_name()?.map(str::to_string),
            interfaces: class
                .interface_names()?
                .into_iter()
                .map(str::to_string)
                .collect(),
            is_interface: class.is_interface(),
        })
    }
}

/// Something that can describe classes by internal name.
pub trait TypeSource: Send + Sync {
    fn describe(&self, name: &str) -> Option<ClassHeader>;
}

/// Built-in headers of core platform types, available without any classpath.
#[derive(Debug, Default, Clone, Copy)]
pub struct BootstrapTypes;

const BOOTSTRAP: &[(&str, &str, &[&str], bool)] = &[
    ("java/lang/Object", "", &[], false),
    ("java/io/Serializable", OBJECT, &[], true),
    ("java/lang/Cloneable", OBJECT, &[], true),
    ("java/lang/Comparable", OBJECT, &[], true),
    ("java/lang/CharSequence", OBJECT, &[], true),
    ("java/lang/Runnable", OBJECT, &[], true),
    ("java/lang/AutoCloseable", OBJECT, &[], true),
    ("java/lang/Iterable", OBJECT, &[], true),
    ("java/lang/String", OBJECT, &["java/io/Serializable", "java/lang/Comparable", "java/lang/CharSequence"], false),
    ("java/lang/Class", OBJECT, &["java/io/Serializable"], false),
    ("java/lang/Enum", OBJECT, &["java/lang/Comparable", "java/io/Serializable"], false),
    ("java/lang/Thread", OBJECT, &["java/lang/Runnable"], false),
    ("java/lang/StringBuilder", OBJECT, &["java/io/Serializable", "java/lang/CharSequence"], false),
    ("java/lang/Number", OBJECT, &["java/io/Serializable"], false),
    ("java/lang/Boolean", OBJECT, &["java/io/Serializable", "java/lang/Comparable"], false),
    ("java/lang/Character", OBJECT, &["java/io/Serializable", "java/lang/Comparable"], false),
    ("java/lang/Byte", "java/lang/Number", &["java/lang/Comparable"], false),
    ("java/lang/Short", "java/lang/Number", &["java/lang/Comparable"], false),
    ("java/lang/Integer", "java/lang/Number", &["java/lang/Comparable"], false),
    ("java/lang/Long", "java/lang/Number", &["java/lang/Comparable"], false),
    ("java/lang/Float", "java/lang/Number", &["java/lang/Comparable"], false),
    ("java/lang/Double", "java/lang/Number", &["java/lang/Comparable"], false),
    ("java/lang/Throwable", OBJECT, &["java/io/Serializable"], false),
    ("java/lang/Exception", "java/lang/Throwable", &[], false),
    ("java/lang/Error", "java/lang/Throwable", &[], false),
    ("java/lang/RuntimeException", "java/lang/Exception", &[], false),
    ("java/lang/IllegalArgumentException", "java/lang/RuntimeException", &[], false),
    ("java/lang/IllegalStateException", "java/lang/RuntimeException", &[], false),
    ("java/lang/NullPointerException", "java/lang/RuntimeException", &[], false),
    ("java/lang/ClassCastException", "java/lang/RuntimeException", &[], false),
    ("java/lang/ArithmeticException", "java/lang/RuntimeException", &[], false),
    ("java/lang/IndexOutOfBoundsException", "java/lang/RuntimeException", &[], false),
    ("java/lang/UnsupportedOperationException", "java/lang/RuntimeException", &[], false),
    ("java/lang/InterruptedException", "java/lang/Exception", &[], false),
    ("java/lang/ReflectiveOperationException", "java/lang/Exception", &[], false),
    ("java/lang/ClassNotFoundException", "java/lang/ReflectiveOperationException", &[], false),
    ("java/io/IOException", "java/lang/Exception", &[], false),
    ("java/io/FileNotFoundException", "java/io/IOException", &[], false),
    ("java/lang/OutOfMemoryError", "java/lang/Error", &[], false),
    ("java/lang/StackOverflowError", "java/lang/Error", &[], false),
];

impl TypeSource for BootstrapTypes {
    fn describe(&self, name: &str) -> Option<ClassHeader> {
        BOOTSTRAP
            .iter()
            .find(|(n, ..)| *n == name)
            .map(|(n, super_name, interfaces, is_interface)| ClassHeader {
                name: n.to_string(),
                super_name: (!super_name.is_empty()).then(|| super_name.to_string()),
                interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
                is_interface: *is_interface,
            })
    }
}

#[derive(Clone, Debug)]
enum Location {
    File(PathBuf),
    Jar { archive: PathBuf, entry: String },
}

/// Class headers read on demand from directories and jars.
///
/// The name index is built on first lookup; parsed headers (and misses) are cached.
#[derive(Debug, Default)]
pub struct ClasspathTypes {
    roots: Vec<PathBuf>,
    index: RwLock<Option<Arc<HashMap<String, Location>>>>,
    cache: RwLock<HashMap<String, Option<ClassHeader>>>,
}

impl ClasspathTypes {
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            roots: roots.into_iter().collect(),
            ..Self::default()
        }
    }

    fn index(&self) -> Arc<HashMap<String, Location>> {
        if let Some(index) = self.index.read().as_ref() {
            return Arc::clone(index);
        }
        let mut slot = self.index.write();
        if let Some(index) = slot.as_ref() {
            return Arc::clone(index);
        }
        let mut map = HashMap::new();
        for root in &self.roots {
            let indexed = if root.is_dir() {
                index_dir(root, root, &mut map)
            } else {
                index_jar(root, &mut map)
            };
            if let Err(e) = indexed {
                tracing::warn!("skipping classpath entry {}: {}", root.display(), e);
            }
        }
        tracing::debug!("indexed {} classpath classes", map.len());
        let map = Arc::new(map);
        *slot = Some(Arc::clone(&map));
        map
    }

    fn load(&self, location: &Location) -> Result<ClassHeader> {
        let bytes = match location {
            Location::File(path) => std::fs::read(path).map_err(|source| Error::FileRead {
                path: path.clone(),
                source,
            })?,
            Location::Jar { archive, entry } => {
                let file = File::open(archive).map_err(|source| Error::FileRead {
                    path: archive.clone(),
                    source,
                })?;
                let mut zip = zip::ZipArchive::new(file)?;
                let mut entry = zip.by_name(entry)?;
                let declared = entry.size();
                crate::read_entry(&mut entry, declared).map_err(|source| Error::FileRead {
                    path: archive.clone(),
                    source,
                })?
            }
        };
        ClassHeader::from_class(&ClassFile::parse(&bytes)?)
    }
}

fn index_dir(root: &Path, dir: &Path, map: &mut HashMap<String, Location>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|source| Error::FileRead {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            index_dir(root, &path, map)?;
        } else if let Some(name) = class_name_of(root, &path) {
            map.entry(name).or_insert(Location::File(path));
        }
    }
    Ok(())
}

fn class_name_of(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let text = relative.to_str()?.replace('\\', "/");
    text.strip_suffix(".class").map(str::to_string)
}

fn index_jar(archive: &Path, map: &mut HashMap<String, Location>) -> Result<()> {
    let file = File::open(archive).map_err(|source| Error::FileRead {
        path: archive.to_path_buf(),
        source,
    })?;
    let zip = zip::ZipArchive::new(file)?;
    for entry in zip.file_names() {
        if let Some(name) = entry.strip_suffix(".class") {
            map.entry(name.to_string()).or_insert(Location::Jar {
                archive: archive.to_path_buf(),
                entry: entry.to_string(),
            });
        }
    }
    Ok(())
}

impl TypeSource for ClasspathTypes {
    fn describe(&self, name: &str) -> Option<ClassHeader> {
        if let Some(hit) = self.cache.read().get(name) {
            return hit.clone();
        }
        let index = self.index();
        let header = index.get(name).and_then(|location| match self.load(location) {
            Ok(header) => Some(header),
            Err(e) => {
                tracing::warn!("cannot read class {}: {}", name, e);
                None
            }
        });
        self.cache.write().insert(name.to_string(), header.clone());
        header
    }
}

/// Consults its sources in order; the first that knows a class wins.
pub struct Layered(pub Vec<Arc<dyn TypeSource>>);

impl TypeSource for Layered {
    fn describe(&self, name: &str) -> Option<ClassHeader> {
        self.0.iter().find_map(|source| source.describe(name))
    }
}

fn load(source: &dyn TypeSource, name: &str) -> Result<ClassHeader> {
    source
        .describe(name)
        .ok_or_else(|| Error::UnresolvedType(name.to_string()))
}

/// Returns true when a value of type `from` can be stored in a `target` slot.
fn is_assignable(source: &dyn TypeSource, target: &str, from: &str) -> Result<bool> {
    let mut pending = vec![from.to_string()];
    let mut seen: HashSet<String> = HashSet::new();
    while let Some(name) = pending.pop() {
        if name == target {
            return Ok(true);
        }
        if !seen.insert(name.clone()) || name == OBJECT {
            continue;
        }
        let header = load(source, &name)?;
        pending.extend(header.super_name);
        pending.extend(header.interfaces);
    }
    Ok(false)
}

/// Nearest common superclass of two internal class names.
///
/// Fails with [`Error::UnresolvedType`] when a class on the walk is unknown to `source`.
/// Interfaces have no common superclass other than `java/lang/Object`.
pub fn common_super_class(source: &dyn TypeSource, a: &str, b: &str) -> Result<String> {
    if a == b {
        return Ok(a.to_string());
    }
    if a == OBJECT || b == OBJECT {
        return Ok(OBJECT.to_string());
    }
    let first = load(source, a)?;
    let second = load(source, b)?;
    if is_assignable(source, a, b)? {
        return Ok(a.to_string());
    }
    if is_assignable(source, b, a)? {
        return Ok(b.to_string());
    }
    if first.is_interface || second.is_interface {
        return Ok(OBJECT.to_string());
    }
    let mut seen = HashSet::new();
    let mut current = first;
    loop {
        let Some(parent) = current.super_name else {
            return Ok(OBJECT.to_string());
        };
        if !seen.insert(parent.clone()) {
            return Ok(OBJECT.to_string());
        }
        if is_assignable(source, &parent, b)? {
            return Ok(parent);
        }
        current = load(source, &parent)?;
    }
}

/// One named way of answering a common-superclass query.
pub type Strategy = Box<dyn Fn(&str, &str) -> Result<String> + Send + Sync>;

/// Ordered list of strategies with a `java/lang/Object` fallback.
#[derive(Default)]
pub struct SuperclassResolver {
    strategies: Vec<(String, Strategy)>,
}

impl SuperclassResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, name: impl Into<String>, strategy: Strategy) -> Self {
        self.strategies.push((name.into(), strategy));
        self
    }

    /// The standard ladder: the built-in table alone, then the classpath alone, then both in
    /// each precedence order.
    pub fn ladder(tool: Arc<dyn TypeSource>, classpath: Arc<dyn TypeSource>) -> Self {
        let over = |source: Arc<dyn TypeSource>| -> Strategy {
            Box::new(move |a: &str, b: &str| common_super_class(source.as_ref(), a, b))
        };
        let classpath_first: Arc<dyn TypeSource> =
            Arc::new(Layered(vec![Arc::clone(&classpath), Arc::clone(&tool)]));
        let tool_first: Arc<dyn TypeSource> =
            Arc::new(Layered(vec![Arc::clone(&tool), Arc::clone(&classpath)]));
        Self::new()
            .with_strategy("tool", over(Arc::clone(&tool)))
            .with_strategy("classpath", over(classpath))
            .with_strategy("classpath+tool", over(classpath_first))
            .with_strategy("tool+classpath", over(tool_first))
    }

    pub fn strategy_names(&self) -> impl Iterator<Item = &str> {
        self.strategies.iter().map(|(name, _)| name.as_str())
    }

    /// Tries each strategy in order; never fails.
    pub fn resolve(&self, a: &str, b: &str) -> String {
        for (name, strategy) in &self.strategies {
            match strategy(a, b) {
                Ok(common) => return common,
                Err(e) => tracing::debug!("{} cannot resolve {} / {}: {}", name, a, b, e),
            }
        }
        tracing::debug!("falling back to {} for {} / {}", OBJECT, a, b);
        OBJECT.to_string()
    }
}

impl CommonSuperclass for SuperclassResolver {
    fn common_super_class(&self, a: &str, b: &str) -> String {
        self.resolve(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Table(HashMap<String, ClassHeader>);

    impl Table {
        fn class(mut self, name: &str, super_name: &str, interfaces: &[&str]) -> Self {
            self.0.insert(
                name.to_string(),
                ClassHeader {
                    name: name.to_string(),
                    super_name: Some(super_name.to_string()),
                    interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
                    is_interface: false,
                },
            );
            self
        }

        fn interface(mut self, name: &str) -> Self {
            self.0.insert(
                name.to_string(),
                ClassHeader {
                    name: name.to_string(),
                    super_name: Some(OBJECT.to_string()),
                    interfaces: Vec::new(),
                    is_interface: true,
                },
            );
            self
        }
    }

    impl TypeSource for Table {
        fn describe(&self, name: &str) -> Option<ClassHeader> {
            self.0.get(name).cloned()
        }
    }

    fn app_types() -> Table {
        Table::default()
            .interface("app/Shape")
            .class("app/Base", OBJECT, &[])
            .class("app/Left", "app/Base", &["app/Shape"])
            .class("app/Right", "app/Base", &[])
            .class("app/LeftChild", "app/Left", &[])
    }

    #[test]
    fn finds_nearest_shared_class() {
        let types = app_types();
        assert_eq!(
            common_super_class(&types, "app/LeftChild", "app/Right").unwrap(),
            "app/Base"
        );
        assert_eq!(
            common_super_class(&types, "app/Left", "app/LeftChild").unwrap(),
            "app/Left"
        );
        assert_eq!(
            common_super_class(&types, "app/Shape", "app/Left").unwrap(),
            "app/Shape"
        );
        assert_eq!(
            common_super_class(&types, "app/Shape", "app/Right").unwrap(),
            OBJECT
        );
    }

    #[test]
    fn unknown_types_are_errors() {
        let types = app_types();
        assert!(matches!(
            common_super_class(&types, "app/Left", "app/Missing"),
            Err(Error::UnresolvedType(name)) if name == "app/Missing"
        ));
    }

    #[test]
    fn bootstrap_knows_exceptions() {
        assert_eq!(
            common_super_class(
                &BootstrapTypes,
                "java/lang/IllegalStateException",
                "java/io/IOException"
            )
            .unwrap(),
            "java/lang/Exception"
        );
    }

    #[test]
    fn ladder_uses_later_strategies_and_falls_back() {
        let resolver =
            SuperclassResolver::ladder(Arc::new(BootstrapTypes), Arc::new(app_types()));
        assert_eq!(
            resolver.strategy_names().collect::<Vec<_>>(),
            ["tool", "classpath", "classpath+tool", "tool+classpath"]
        );
        assert_eq!(resolver.resolve("app/LeftChild", "app/Right"), "app/Base");
        assert_eq!(resolver.resolve("app/Left", "nowhere/Gone"), OBJECT);
    }

    #[test]
    fn failing_strategies_fall_back_to_object() {
        let resolver = SuperclassResolver::new().with_strategy(
            "broken",
            Box::new(|a: &str, _: &str| Err(Error::UnresolvedType(a.to_string()))),
        );
        assert_eq!(resolver.resolve("x/A", "x/B"), OBJECT);
        assert_eq!(resolver.resolve("x/A", "x/B"), OBJECT);
    }

    #[test]
    fn read_errors_carry_the_path() {
        let missing = std::env::temp_dir().join("mtrace-missing-classpath-dir");
        let mut map = HashMap::new();
        match index_dir(&missing, &missing, &mut map) {
            Err(Error::FileRead { path, source }) => {
                assert_eq!(path, missing);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("expected FileRead, got {other:?}"),
        }
    }
}
