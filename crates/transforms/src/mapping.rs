//! Name resolution between obfuscated and original names.
//!
//! [`NameResolver`] is the oracle every other stage consults. [`MappingCollector`] implements
//! it over ProGuard mapping data loaded by [`MappingReader`]; [`Identity`] is used when no
//! mapping is available and answers every lookup with its fallback.
//!
//! All names handled here are dotted (`com.example.Foo`), as they appear in `mapping.txt`.

use crate::{Error, Result};
use mtrace_core::descriptor;
use std::collections::HashMap;
use std::path::Path;

/// Name of the ProGuard mapping file inside a mapping directory.
pub const MAPPING_FILE: &str = "mapping.txt";

/// Method identity as recorded in a mapping, or as resolved for a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub class_name: String,
    /// Return type in Java spelling, e.g. `void` or `java.lang.String[]`.
    pub return_type: String,
    /// Comma-separated argument types in Java spelling.
    pub arguments: String,
    pub name: String,
    /// Dotted descriptor after name translation.
    pub desc: String,
}

impl MethodInfo {
    fn matches(&self, return_type: &str, arguments: &str) -> bool {
        self.return_type == return_type && self.arguments == arguments
    }
}

/// A method descriptor split into its parts, class names translated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescInfo {
    pub desc: String,
    pub return_type: String,
    pub arguments: String,
}

/// Maps possibly-obfuscated names to original names and back.
pub trait NameResolver: Send + Sync {
    /// Original name of an obfuscated class, or `fallback`.
    fn original_class_name(&self, obfuscated: &str, fallback: &str) -> String;
    /// Obfuscated name of an original class, or `fallback`.
    fn proguard_class_name(&self, original: &str, fallback: &str) -> String;
    /// Obfuscated name of an original package, or `fallback`.
    fn proguard_package_name(&self, original: &str, fallback: &str) -> String;
    /// Original package of an obfuscated package, or `fallback`.
    fn original_package_name(&self, obfuscated: &str, fallback: &str) -> String;
    /// Original name and descriptor of an obfuscated method.
    fn original_method_info(&self, class: &str, name: &str, desc: &str) -> MethodInfo;
    /// Obfuscated name and descriptor of an original method.
    fn obfuscated_method_info(&self, class: &str, name: &str, desc: &str) -> MethodInfo;
}

/// Resolver for builds without a mapping.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl NameResolver for Identity {
    fn original_class_name(&self, _: &str, fallback: &str) -> String {
        fallback.to_string()
    }

    fn proguard_class_name(&self, _: &str, fallback: &str) -> String {
        fallback.to_string()
    }

    fn proguard_package_name(&self, _: &str, fallback: &str) -> String {
        fallback.to_string()
    }

    fn original_package_name(&self, _: &str, fallback: &str) -> String {
        fallback.to_string()
    }

    fn original_method_info(&self, class: &str, name: &str, desc: &str) -> MethodInfo {
        identity_info(class, name, desc)
    }

    fn obfuscated_method_info(&self, class: &str, name: &str, desc: &str) -> MethodInfo {
        identity_info(class, name, desc)
    }
}

fn identity_info(class: &str, name: &str, desc: &str) -> MethodInfo {
    MethodInfo {
        class_name: class.to_string(),
        return_type: String::new(),
        arguments: String::new(),
        name: name.to_string(),
        desc: desc.to_string(),
    }
}

/// ProGuard mapping tables.
#[derive(Debug, Default, Clone)]
pub struct MappingCollector {
    obfuscated_to_original: HashMap<String, String>,
    original_to_obfuscated: HashMap<String, String>,
    original_to_obfuscated_package: HashMap<String, String>,
    obfuscated_to_original_package: HashMap<String, String>,
    /// obfuscated class -> obfuscated method name -> original methods
    obfuscated_methods: HashMap<String, HashMap<String, Vec<MethodInfo>>>,
    /// original class -> original method name -> obfuscated methods
    original_methods: HashMap<String, HashMap<String, Vec<MethodInfo>>>,
}

impl MappingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn class_count(&self) -> usize {
        self.original_to_obfuscated.len()
    }

    /// Records `original -> obfuscated` for a class and its package.
    pub fn process_class_mapping(&mut self, original: &str, obfuscated: &str) {
        self.obfuscated_to_original
            .insert(obfuscated.to_string(), original.to_string());
        self.original_to_obfuscated
            .insert(original.to_string(), obfuscated.to_string());
        match (original.rfind('.'), obfuscated.rfind('.')) {
            (Some(o), Some(n)) if o > 0 && n > 0 => {
                self.original_to_obfuscated_package
                    .insert(original[..o].to_string(), obfuscated[..n].to_string());
                self.obfuscated_to_original_package
                    .insert(obfuscated[..n].to_string(), original[..o].to_string());
            }
            _ => tracing::debug!("class without package: {} -> {}", original, obfuscated),
        }
    }

    /// Records one method of an already mapped class.
    pub fn process_method_mapping(
        &mut self,
        class: &str,
        return_type: &str,
        name: &str,
        arguments: &str,
        new_name: &str,
    ) {
        let new_class = self
            .original_to_obfuscated
            .get(class)
            .cloned()
            .unwrap_or_else(|| class.to_string());
        self.obfuscated_methods
            .entry(new_class.clone())
            .or_default()
            .entry(new_name.to_string())
            .or_default()
            .push(MethodInfo {
                class_name: class.to_string(),
                return_type: return_type.to_string(),
                arguments: arguments.to_string(),
                name: name.to_string(),
                desc: String::new(),
            });
        self.original_methods
            .entry(class.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default()
            .push(MethodInfo {
                class_name: new_class,
                return_type: return_type.to_string(),
                arguments: arguments.to_string(),
                name: new_name.to_string(),
                desc: String::new(),
            });
    }

    /// Splits a dotted descriptor and translates its class names.
    ///
    /// # Arguments
    /// * `desc` - Descriptor with dotted class names.
    /// * `to_obfuscated` - Translate original names to obfuscated ones instead of the reverse.
    pub fn parse_method_desc(&self, desc: &str, to_obfuscated: bool) -> Result<DescInfo> {
        let table = if to_obfuscated {
            &self.original_to_obfuscated
        } else {
            &self.obfuscated_to_original
        };
        let parsed = descriptor::parse_method(&desc.replace('.', "/"))?;
        let translate = |name: &str| {
            let dotted = name.replace('/', ".");
            table.get(&dotted).cloned().unwrap_or(dotted)
        };
        let parameters = parsed.parameter_types();
        let returns = parsed.return_type();
        Ok(DescInfo {
            desc: format!(
                "({}){}",
                parameters
                    .iter()
                    .map(|p| descriptor::to_descriptor(p, &translate))
                    .collect::<String>(),
                descriptor::to_descriptor(returns, &translate)
            ),
            return_type: descriptor::java_name(returns, &translate),
            arguments: parameters
                .iter()
                .map(|p| descriptor::java_name(p, &translate))
                .collect::<Vec<_>>()
                .join(","),
        })
    }

    /// Rewrites the class names inside a recorded method to their obfuscated form.
    fn obfuscate_signature(&self, info: &mut MethodInfo) {
        let translate = |ty: &str| -> String {
            descriptor::rename_java_type(ty, &|name: &str| {
                self.original_to_obfuscated
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| name.to_string())
            })
        };
        if !info.arguments.is_empty() {
            info.arguments = info
                .arguments
                .split(',')
                .map(|arg| translate(arg))
                .collect::<Vec<_>>()
                .join(",");
        }
        info.return_type = translate(&info.return_type);
    }
}

impl NameResolver for MappingCollector {
    fn original_class_name(&self, obfuscated: &str, fallback: &str) -> String {
        self.obfuscated_to_original
            .get(obfuscated)
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    }

    fn proguard_class_name(&self, original: &str, fallback: &str) -> String {
        self.original_to_obfuscated
            .get(original)
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    }

    fn proguard_package_name(&self, original: &str, fallback: &str) -> String {
        self.original_to_obfuscated_package
            .get(original)
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    }

    fn original_package_name(&self, obfuscated: &str, fallback: &str) -> String {
        self.obfuscated_to_original_package
            .get(obfuscated)
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    }

    fn original_method_info(&self, class: &str, name: &str, desc: &str) -> MethodInfo {
        let Ok(wanted) = self.parse_method_desc(desc, false) else {
            return identity_info(class, name, desc);
        };
        let found = self
            .obfuscated_methods
            .get(class)
            .and_then(|methods| methods.get(name))
            .and_then(|candidates| {
                candidates
                    .iter()
                    .find(|m| m.matches(&wanted.return_type, &wanted.arguments))
            });
        match found {
            Some(info) => MethodInfo {
                desc: wanted.desc,
                ..info.clone()
            },
            None => MethodInfo {
                class_name: self.original_class_name(class, class),
                return_type: wanted.return_type,
                arguments: wanted.arguments,
                name: name.to_string(),
                desc: wanted.desc,
            },
        }
    }

    fn obfuscated_method_info(&self, class: &str, name: &str, desc: &str) -> MethodInfo {
        let Ok(wanted) = self.parse_method_desc(desc, true) else {
            return identity_info(class, name, desc);
        };
        let candidates = self
            .original_methods
            .get(class)
            .and_then(|methods| methods.get(name))
            .map(Vec::as_slice)
            .unwrap_or_default();
        for candidate in candidates {
            let mut info = candidate.clone();
            self.obfuscate_signature(&mut info);
            if info.matches(&wanted.return_type, &wanted.arguments) {
                info.desc = wanted.desc;
                return info;
            }
        }
        MethodInfo {
            class_name: self.proguard_class_name(class, class),
            return_type: wanted.return_type,
            arguments: wanted.arguments,
            name: name.to_string(),
            desc: wanted.desc,
        }
    }
}

/// Parser for ProGuard `mapping.txt`.
pub struct MappingReader;

impl MappingReader {
    /// Loads `<dir>/mapping.txt`, or returns `None` when the directory has none.
    pub fn read_dir(dir: &Path) -> Result<Option<MappingCollector>> {
        let path = dir.join(MAPPING_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        let mut collector = MappingCollector::new();
        let lines = Self::parse(&text, &mut collector);
        tracing::info!(
            "loaded {} class mappings ({} lines) from {}",
            collector.class_count(),
            lines,
            path.display()
        );
        Ok(Some(collector))
    }

    /// Feeds every mapping in `text` to `collector`, returning the number of lines consumed.
    ///
    /// Class lines look like `a.b.C -> x.y:`. Indented member lines follow. Method lines may
    /// carry `start:end:` line prefixes and `:origStart:origEnd` suffixes; field lines and
    /// `#` metadata lines are skipped.
    pub fn parse(text: &str, collector: &mut MappingCollector) -> usize {
        let mut current: Option<String> = None;
        let mut consumed = 0;
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            consumed += 1;
            let indented = raw.starts_with(char::is_whitespace);
            if !indented {
                current = parse_class_line(line).map(|(original, obfuscated)| {
                    collector.process_class_mapping(original, obfuscated);
                    original.to_string()
                });
                continue;
            }
            let Some(class) = current.as_deref() else {
                continue;
            };
            if let Some(method) = parse_method_line(line) {
                collector.process_method_mapping(
                    class,
                    method.return_type,
                    method.name,
                    method.arguments,
                    method.new_name,
                );
            }
        }
        consumed
    }
}

fn parse_class_line(line: &str) -> Option<(&str, &str)> {
    let body = line.strip_suffix(':')?;
    let (original, obfuscated) = body.split_once("->")?;
    Some((original.trim(), obfuscated.trim()))
}

struct MethodLine<'a> {
    return_type: &'a str,
    name: &'a str,
    arguments: &'a str,
    new_name: &'a str,
}

fn parse_method_line(line: &str) -> Option<MethodLine<'_>> {
    let (left, new_name) = line.split_once("->")?;
    let open = left.find('(')?;
    let close = left.rfind(')')?;
    if close < open {
        return None;
    }
    let head = strip_line_range(left[..open].trim());
    let (return_type, name) = head.rsplit_once(' ')?;
    Some(MethodLine {
        return_type: return_type.trim(),
        name: name.trim(),
        arguments: left[open + 1..close].trim(),
        new_name: new_name.trim(),
    })
}

/// Drops a leading `start:end:` line range.
fn strip_line_range(head: &str) -> &str {
    if !head.starts_with(|c: char| c.is_ascii_digit()) {
        return head;
    }
    let mut rest = head;
    for _ in 0..2 {
        match rest.split_once(':') {
            Some((digits, tail)) if digits.chars().all(|c| c.is_ascii_digit()) => rest = tail,
            _ => break,
        }
    }
    rest
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPING: &str = "\
# compiler: R8
com.example.Foo -> a.a:
    int count -> a
    1:4:void bar(int,com.example.Foo):10:13 -> b
    java.lang.String name() -> c
com.example.ui.Main -> a.b.c:
    void onCreate(android.os.Bundle) -> onCreate
";

    fn collector() -> MappingCollector {
        let mut collector = MappingCollector::new();
        MappingReader::parse(MAPPING, &mut collector);
        collector
    }

    #[test]
    fn class_and_package_lookups() {
        let c = collector();
        assert_eq!(c.original_class_name("a.a", "a.a"), "com.example.Foo");
        assert_eq!(c.proguard_class_name("com.example.Foo", "x"), "a.a");
        assert_eq!(c.proguard_package_name("com.example.ui", "x"), "a.b");
        assert_eq!(c.original_package_name("a.b", "x"), "com.example.ui");
        assert_eq!(c.original_class_name("zz.Unknown", "fallback"), "fallback");
    }

    #[test]
    fn method_lookups_translate_descriptors() {
        let c = collector();
        let info = c.original_method_info("a.a", "b", "(ILa.a;)V");
        assert_eq!(info.name, "bar");
        assert_eq!(info.desc, "(ILcom.example.Foo;)V");

        let back = c.obfuscated_method_info("com.example.Foo", "bar", "(ILcom.example.Foo;)V");
        assert_eq!(back.name, "b");
        assert_eq!(back.desc, "(ILa.a;)V");
    }

    #[test]
    fn unknown_methods_keep_their_name() {
        let c = collector();
        let info = c.original_method_info("a.a", "zz", "()La.a;");
        assert_eq!(info.name, "zz");
        assert_eq!(info.desc, "()Lcom.example.Foo;");
    }

    #[test]
    fn identity_returns_fallbacks() {
        assert_eq!(Identity.original_class_name("a.b", "a.b"), "a.b");
        let info = Identity.original_method_info("a.b", "m", "()V");
        assert_eq!((info.name.as_str(), info.desc.as_str()), ("m", "()V"));
    }

    #[test]
    fn line_ranges_are_stripped() {
        assert_eq!(strip_line_range("12:20:void run"), "void run");
        assert_eq!(strip_line_range("void run"), "void run");
        let m = parse_method_line("3:3:java.lang.String[] names(int[]):55:55 -> d").unwrap();
        assert_eq!(
            (m.return_type, m.name, m.arguments, m.new_name),
            ("java.lang.String[]", "names", "int[]", "d")
        );
        assert!(parse_method_line("int count -> a").is_none());
    }
}
