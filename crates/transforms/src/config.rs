//! Pipeline configuration and the block list.

use crate::mapping::NameResolver;
use crate::{Error, Result, dotted};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Directives applied before any user block list.
pub const DEFAULT_BLOCK_LIST: &str = "\
[package]
-keeppackage android/
-keeppackage com/mtrace/core/
";

/// File-name fragments of generated classes that are never traced.
const GENERATED_FRAGMENTS: &[&str] = &["R.class", "R$", "Manifest", "BuildConfig"];

/// Runtime methods the probes call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Internal name of the hook class.
    pub class_name: String,
    /// Static `(I)V` method called on entry.
    pub enter: String,
    /// Static `(I)V` method called before every return and throw.
    pub exit: String,
    /// Static `(Landroid/app/Activity;Z)V` method called from the focus callback.
    pub focus: String,
}

impl HookConfig {
    pub const ENTER_DESC: &'static str = "(I)V";
    pub const EXIT_DESC: &'static str = "(I)V";
    pub const FOCUS_DESC: &'static str = "(Landroid/app/Activity;Z)V";
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            class_name: "com/mtrace/core/MethodBeat".into(),
            enter: "i".into(),
            exit: "o".into(),
            focus: "at".into(),
        }
    }
}

/// Settings as supplied by the caller, before the block list is resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigurationBuilder {
    /// Where the traced-method mapping is written.
    pub method_map_path: PathBuf,
    /// Where the ignored-method report is written.
    pub ignore_method_map_path: PathBuf,
    /// Mapping of a previous build whose ids should be kept.
    pub base_method_map_path: Option<PathBuf>,
    /// User block list, appended to the defaults.
    pub block_list_path: Option<PathBuf>,
    /// Directory holding a ProGuard `mapping.txt`.
    pub mapping_dir: Option<PathBuf>,
    /// Directories and jars used only for type resolution.
    pub classpath: Vec<PathBuf>,
    pub hooks: HookConfig,
    /// Worker pool size.
    pub threads: usize,
    /// Re-parse every rewritten class before accepting it.
    pub check_output: bool,
}

impl Default for ConfigurationBuilder {
    fn default() -> Self {
        Self {
            method_map_path: PathBuf::from("methodMapping.txt"),
            ignore_method_map_path: PathBuf::from("ignoreMethodMapping.txt"),
            base_method_map_path: None,
            block_list_path: None,
            mapping_dir: None,
            classpath: Vec::new(),
            hooks: HookConfig::default(),
            threads: 16,
            check_output: true,
        }
    }
}

impl ConfigurationBuilder {
    /// Reads settings from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Resolves the block list against `resolver` and freezes the settings.
    pub fn build(self, resolver: &dyn NameResolver) -> Configuration {
        let mut block_set = BlockSet::default();
        let count = block_set.parse_block_file(self.block_list_path.as_deref(), resolver);
        tracing::info!(
            "block list: {} entries, {} method rules",
            count,
            block_set.method_rules.len()
        );
        Configuration {
            settings: self,
            block_set,
        }
    }
}

/// Frozen configuration shared by every pass.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub settings: ConfigurationBuilder,
    pub block_set: BlockSet,
}

impl Configuration {
    pub fn hooks(&self) -> &HookConfig {
        &self.settings.hooks
    }
}

/// Explicit per-method exclusion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRule {
    /// Dotted original class name.
    pub class_name: String,
    pub method_name: String,
    /// Dotted descriptor; `None` matches every overload.
    pub descriptor: Option<String>,
}

/// Classes, package prefixes and method rules excluded from tracing.
#[derive(Debug, Clone, Default)]
pub struct BlockSet {
    /// Dotted class names, matched exactly.
    classes: HashSet<String>,
    /// Dotted package prefixes, matched against bytecode and original names.
    packages: HashSet<String>,
    method_rules: Vec<MethodRule>,
}

impl BlockSet {
    /// Applies the default directives followed by the file at `path`, if readable.
    ///
    /// # Returns
    /// The number of class and package entries in the set.
    pub fn parse_block_file(&mut self, path: Option<&Path>, resolver: &dyn NameResolver) -> usize {
        let mut text = DEFAULT_BLOCK_LIST.to_string();
        if let Some(path) = path {
            match std::fs::read_to_string(path) {
                Ok(user) => text.push_str(&user),
                Err(e) => tracing::warn!(
                    "block list {} unreadable, using defaults: {}",
                    path.display(),
                    e
                ),
            }
        }
        self.add_directives(&text, resolver)
    }

    /// Applies block-list directives from `text`.
    pub fn add_directives(&mut self, text: &str, resolver: &dyn NameResolver) -> usize {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
                continue;
            }
            if let Some(class) = line.strip_prefix("-keepclass ") {
                let class = dotted(class.trim());
                if !class.is_empty() {
                    self.classes
                        .insert(resolver.proguard_class_name(&class, &class));
                }
            } else if let Some(package) = line.strip_prefix("-keeppackage ") {
                let package = dotted(package.trim());
                let bare = package.trim_end_matches('.');
                if bare.is_empty() {
                    continue;
                }
                let mapped = resolver.proguard_package_name(bare, bare);
                if package.ends_with('.') {
                    self.packages.insert(format!("{mapped}."));
                } else {
                    self.packages.insert(mapped);
                }
            } else if let Some(rule) = line.strip_prefix("-keepmethod ") {
                let mut parts = rule.split_whitespace();
                if let (Some(class), Some(method)) = (parts.next(), parts.next()) {
                    self.method_rules.push(MethodRule {
                        class_name: dotted(class),
                        method_name: method.to_string(),
                        descriptor: parts.next().map(dotted),
                    });
                }
            } else {
                tracing::debug!("skipping block-list line: {}", line);
            }
        }
        self.len()
    }

    /// Number of class and package entries.
    pub fn len(&self) -> usize {
        self.classes.len() + self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.packages.is_empty()
    }

    pub fn method_rules(&self) -> &[MethodRule] {
        &self.method_rules
    }

    /// Returns true if the class with internal name `class_name` must not be traced.
    pub fn is_blocked(&self, class_name: &str, resolver: &dyn NameResolver) -> bool {
        let name = dotted(class_name);
        if self.classes.contains(&name) {
            return true;
        }
        let original = resolver.original_class_name(&name, &name);
        self.packages.iter().any(|package| {
            name.starts_with(package.as_str()) || original.starts_with(package.as_str())
        })
    }

    /// Returns true if a per-method rule names the given original method.
    ///
    /// All arguments are dotted and deobfuscated.
    pub fn blocks_method(&self, class_name: &str, method_name: &str, descriptor: &str) -> bool {
        self.method_rules.iter().any(|rule| {
            rule.class_name == class_name
                && rule.method_name == method_name
                && rule.descriptor.as_deref().is_none_or(|d| d == descriptor)
        })
    }
}

/// Returns true for class files that are not generated resources.
pub fn is_traceable_file(name: &str) -> bool {
    name.ends_with(".class") && !GENERATED_FRAGMENTS.iter().any(|f| name.contains(f))
}
