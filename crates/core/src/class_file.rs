//! In-memory model of a class file.
//!
//! Members and attributes are kept close to the wire format: attribute payloads stay raw until
//! a caller asks for a structured view (see [`crate::code::CodeAttribute`]). That keeps
//! untouched parts of a class byte-identical after a rewrite.

use crate::constant_pool::ConstantPool;
use crate::result::Result;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_PROTECTED: u16 = 0x0004;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_SYNCHRONIZED: u16 = 0x0020;
pub const ACC_BRIDGE: u16 = 0x0040;
pub const ACC_VARARGS: u16 = 0x0080;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_SYNTHETIC: u16 = 0x1000;
pub const ACC_ANNOTATION: u16 = 0x2000;
pub const ACC_ENUM: u16 = 0x4000;

/// First class-file major version whose verifier requires `StackMapTable`.
pub const V1_6: u16 = 50;
/// First class-file major version that forbids `jsr`/`ret`.
pub const V1_7: u16 = 51;

/// A raw attribute: its name index and unparsed payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

impl Attribute {
    pub fn name<'a>(&self, pool: &'a ConstantPool) -> Result<&'a str> {
        pool.utf8(self.name_index)
    }
}

/// A field or method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

impl MemberInfo {
    pub fn name<'a>(&self, pool: &'a ConstantPool) -> Result<&'a str> {
        pool.utf8(self.name_index)
    }

    pub fn descriptor<'a>(&self, pool: &'a ConstantPool) -> Result<&'a str> {
        pool.utf8(self.descriptor_index)
    }

    /// Returns the position of the first attribute called `name`.
    pub fn find_attribute(&self, pool: &ConstantPool, name: &str) -> Option<usize> {
        self.attributes
            .iter()
            .position(|a| a.name(pool).is_ok_and(|n| n == name))
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }
}

/// A complete class file.
#[derive(Clone, Debug)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    /// Zero only for `java/lang/Object` and `module-info`.
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<MemberInfo>,
    pub methods: Vec<MemberInfo>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    /// Internal name of this class.
    pub fn name(&self) -> Result<&str> {
        self.constant_pool.class_name(self.this_class)
    }

    /// Internal name of the superclass, if any.
    pub fn super_name(&self) -> Result<Option<&str>> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.constant_pool.class_name(self.super_class).map(Some)
    }

    pub fn interface_names(&self) -> Result<Vec<&str>> {
        self.interfaces
            .iter()
            .map(|&i| self.constant_pool.class_name(i))
            .collect()
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    /// Abstract classes and interfaces never receive probes.
    pub fn is_abstract_or_interface(&self) -> bool {
        self.access_flags & (ACC_ABSTRACT | ACC_INTERFACE) != 0
    }

    /// Finds a method by name and descriptor.
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.methods.iter().position(|m| {
            m.name(&self.constant_pool).is_ok_and(|n| n == name)
                && m.descriptor(&self.constant_pool).is_ok_and(|d| d == descriptor)
        })
    }
}
