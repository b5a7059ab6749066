//! Method records produced by collection.

use crate::dotted;
use crate::mapping::NameResolver;
use mtrace_core::class_file::ACC_NATIVE;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a method as it appears in the bytecode being rewritten.
///
/// Class name and descriptor are dotted, so keys read back from a mapping file compare equal
/// to keys built from class files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodKey {
    pub class_name: String,
    pub method_name: String,
    pub descriptor: String,
}

impl MethodKey {
    /// Builds a key from an internal class name and a raw descriptor.
    pub fn new(class_name: &str, method_name: &str, descriptor: &str) -> Self {
        Self {
            class_name: dotted(class_name),
            method_name: method_name.to_string(),
            descriptor: dotted(descriptor),
        }
    }

    /// Translates the key to original names.
    pub fn revert(&self, resolver: &dyn NameResolver) -> MethodKey {
        let info =
            resolver.original_method_info(&self.class_name, &self.method_name, &self.descriptor);
        MethodKey {
            class_name: resolver.original_class_name(&self.class_name, &self.class_name),
            method_name: info.name,
            descriptor: info.desc,
        }
    }

    /// Translates a key written with original names back to obfuscated names.
    pub fn proguard(&self, resolver: &dyn NameResolver) -> MethodKey {
        let info =
            resolver.obfuscated_method_info(&self.class_name, &self.method_name, &self.descriptor);
        MethodKey {
            class_name: resolver.proguard_class_name(&self.class_name, &self.class_name),
            method_name: info.name,
            descriptor: info.desc,
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.class_name, self.method_name, self.descriptor)
    }
}

/// The single decision recorded for a method key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Traced(TraceMethod),
    Ignored(IgnoredMethod),
}

/// A method that receives probes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceMethod {
    pub id: u32,
    pub access_flags: u16,
    pub key: MethodKey,
}

impl TraceMethod {
    pub fn is_native(&self) -> bool {
        self.access_flags & ACC_NATIVE != 0
    }

    /// One line of the method map: `id,access,class,method,descriptor`.
    pub fn to_mapping_line(&self, resolver: &dyn NameResolver) -> String {
        let key = self.key.revert(resolver);
        format!(
            "{},{},{},{},{}",
            self.id, self.access_flags, key.class_name, key.method_name, key.descriptor
        )
    }

    /// Parses a method-map line; returns `None` for comments and malformed lines.
    pub fn parse_mapping_line(line: &str) -> Option<TraceMethod> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let mut fields = line.splitn(5, ',').map(str::trim);
        let id = fields.next()?.parse().ok()?;
        let access_flags = fields.next()?.parse().ok()?;
        let class_name = fields.next()?.to_string();
        let method_name = fields.next()?.to_string();
        let descriptor = fields.next()?.to_string();
        Some(TraceMethod {
            id,
            access_flags,
            key: MethodKey {
                class_name,
                method_name,
                descriptor,
            },
        })
    }
}

/// Why a method was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IgnoreReason {
    /// Its class is blocked, or a method rule names it.
    Blocked,
    /// Empty, an accessor, or a leaf without calls.
    Trivial,
}

/// A method that will not receive probes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoredMethod {
    pub access_flags: u16,
    pub key: MethodKey,
    pub reason: IgnoreReason,
}

impl IgnoredMethod {
    pub fn to_report_line(&self, resolver: &dyn NameResolver) -> String {
        self.key.revert(resolver).to_string()
    }
}
