//! Field and method descriptors, parsed with `jdescriptor`.

use crate::result::{Error, Result};
use std::str::FromStr;

pub use jdescriptor::{MethodDescriptor, TypeDescriptor};

/// Parses a method descriptor such as `(I[Ljava/lang/String;)V`.
pub fn parse_method(descriptor: &str) -> Result<MethodDescriptor> {
    MethodDescriptor::from_str(descriptor)
        .map_err(|_| Error::InvalidDescriptor(descriptor.to_string()))
}

/// Parses one complete field descriptor.
pub fn parse_field(descriptor: &str) -> Result<TypeDescriptor> {
    let method = parse_method(&format!("(){descriptor}"))
        .map_err(|_| Error::InvalidDescriptor(descriptor.to_string()))?;
    match method.return_type() {
        TypeDescriptor::Void => Err(Error::InvalidDescriptor(descriptor.to_string())),
        ty => Ok(ty.clone()),
    }
}

/// The return type, or `None` for `void`.
pub fn returns(descriptor: &MethodDescriptor) -> Option<&TypeDescriptor> {
    match descriptor.return_type() {
        TypeDescriptor::Void => None,
        ty => Some(ty),
    }
}

/// Number of local-variable or operand-stack slots the type occupies.
pub fn slots(ty: &TypeDescriptor) -> u16 {
    match ty {
        TypeDescriptor::Long | TypeDescriptor::Double => 2,
        TypeDescriptor::Void => 0,
        _ => 1,
    }
}

/// Total argument slots, excluding the receiver.
pub fn argument_slots(descriptor: &MethodDescriptor) -> u16 {
    descriptor.parameter_types().iter().map(slots).sum()
}

/// Writes `ty` back in descriptor form, passing every class name through `rename`.
pub fn to_descriptor(ty: &TypeDescriptor, rename: &impl Fn(&str) -> String) -> String {
    match ty {
        TypeDescriptor::Byte => "B".into(),
        TypeDescriptor::Char => "C".into(),
        TypeDescriptor::Double => "D".into(),
        TypeDescriptor::Float => "F".into(),
        TypeDescriptor::Int => "I".into(),
        TypeDescriptor::Long => "J".into(),
        TypeDescriptor::Short => "S".into(),
        TypeDescriptor::Boolean => "Z".into(),
        TypeDescriptor::Void => "V".into(),
        TypeDescriptor::Object(name) => format!("L{};", rename(name)),
        TypeDescriptor::Array(element, dims) => format!(
            "{}{}",
            "[".repeat(usize::from(*dims)),
            to_descriptor(element, rename)
        ),
    }
}

/// Returns the Java source spelling, e.g. `int[]` or `java.lang.String`, passing every class
/// name (in internal form) through `rename`.
pub fn java_name(ty: &TypeDescriptor, rename: &impl Fn(&str) -> String) -> String {
    match ty {
        TypeDescriptor::Byte => "byte".into(),
        TypeDescriptor::Char => "char".into(),
        TypeDescriptor::Double => "double".into(),
        TypeDescriptor::Float => "float".into(),
        TypeDescriptor::Int => "int".into(),
        TypeDescriptor::Long => "long".into(),
        TypeDescriptor::Short => "short".into(),
        TypeDescriptor::Boolean => "boolean".into(),
        TypeDescriptor::Void => "void".into(),
        TypeDescriptor::Object(name) => rename(name).replace('/', "."),
        TypeDescriptor::Array(element, dims) => format!(
            "{}{}",
            java_name(element, rename),
            "[]".repeat(usize::from(*dims))
        ),
    }
}

/// Renames the class part of a Java source type spelling such as `a.b.C[][]`; primitives pass
/// through untouched.
pub fn rename_java_type(name: &str, rename: &impl Fn(&str) -> String) -> String {
    let base = name.trim_end_matches("[]");
    let suffix = &name[base.len()..];
    match base {
        "byte" | "char" | "double" | "float" | "int" | "long" | "short" | "boolean" | "void" => {
            name.to_string()
        }
        class => format!("{}{suffix}", rename(class)),
    }
}
