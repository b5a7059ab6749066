//! Module for encoding a [`ClassFile`] back into class-file bytes.

use crate::class_file::{Attribute, ClassFile, MemberInfo};
use crate::constant_pool::{Constant, ConstantPool, encode_modified_utf8};
use crate::result::{Error, Result};

/// Big-endian byte sink.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn u1(&mut self, v: u8) {
        self.bytes.push(v);
    }

    pub fn u2(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u4(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_be_bytes());
    }

    pub fn i1(&mut self, v: i8) {
        self.u1(v as u8);
    }

    pub fn i2(&mut self, v: i16) {
        self.u2(v as u16);
    }

    pub fn i4(&mut self, v: i32) {
        self.u4(v as u32);
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.bytes.extend_from_slice(v);
    }

    /// Overwrites a previously written big-endian `u2` at `at`.
    pub fn patch_u2(&mut self, at: usize, v: u16) {
        self.bytes[at..at + 2].copy_from_slice(&v.to_be_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl ClassFile {
    /// Serializes the class.
    ///
    /// # Returns
    /// The class-file bytes, or an error when a table exceeds its length field.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = Writer::with_capacity(4096);
        w.u4(crate::CLASS_MAGIC);
        w.u2(self.minor_version);
        w.u2(self.major_version);
        write_constant_pool(&mut w, &self.constant_pool);
        w.u2(self.access_flags);
        w.u2(self.this_class);
        w.u2(self.super_class);
        w.u2(checked_len(self.interfaces.len())?);
        for &interface in &self.interfaces {
            w.u2(interface);
        }
        write_members(&mut w, &self.fields)?;
        write_members(&mut w, &self.methods)?;
        write_attributes(&mut w, &self.attributes)?;
        Ok(w.into_bytes())
    }
}

fn checked_len(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::ConstantPoolOverflow)
}

fn write_constant_pool(w: &mut Writer, pool: &ConstantPool) {
    w.u2(pool.count());
    for constant in pool.entries() {
        match constant {
            Constant::Unusable => {}
            Constant::Utf8(text) => {
                let encoded = encode_modified_utf8(text);
                w.u1(1);
                w.u2(encoded.len() as u16);
                w.bytes(&encoded);
            }
            Constant::OpaqueUtf8 { raw, .. } => {
                w.u1(1);
                w.u2(raw.len() as u16);
                w.bytes(raw);
            }
            Constant::Integer(v) => {
                w.u1(3);
                w.i4(*v);
            }
            Constant::Float(bits) => {
                w.u1(4);
                w.u4(*bits);
            }
            Constant::Long(v) => {
                w.u1(5);
                w.bytes(&v.to_be_bytes());
            }
            Constant::Double(bits) => {
                w.u1(6);
                w.bytes(&bits.to_be_bytes());
            }
            Constant::Class { name_index } => {
                w.u1(7);
                w.u2(*name_index);
            }
            Constant::String { string_index } => {
                w.u1(8);
                w.u2(*string_index);
            }
            Constant::Fieldref {
                class_index,
                name_and_type_index,
            } => {
                w.u1(9);
                w.u2(*class_index);
                w.u2(*name_and_type_index);
            }
            Constant::Methodref {
                class_index,
                name_and_type_index,
            } => {
                w.u1(10);
                w.u2(*class_index);
                w.u2(*name_and_type_index);
            }
            Constant::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => {
                w.u1(11);
                w.u2(*class_index);
                w.u2(*name_and_type_index);
            }
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => {
                w.u1(12);
                w.u2(*name_index);
                w.u2(*descriptor_index);
            }
            Constant::MethodHandle {
                reference_kind,
                reference_index,
            } => {
                w.u1(15);
                w.u1(*reference_kind);
                w.u2(*reference_index);
            }
            Constant::MethodType { descriptor_index } => {
                w.u1(16);
                w.u2(*descriptor_index);
            }
            Constant::Dynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            } => {
                w.u1(17);
                w.u2(*bootstrap_method_attr_index);
                w.u2(*name_and_type_index);
            }
            Constant::InvokeDynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            } => {
                w.u1(18);
                w.u2(*bootstrap_method_attr_index);
                w.u2(*name_and_type_index);
            }
            Constant::Module { name_index } => {
                w.u1(19);
                w.u2(*name_index);
            }
            Constant::Package { name_index } => {
                w.u1(20);
                w.u2(*name_index);
            }
        }
    }
}

fn write_members(w: &mut Writer, members: &[MemberInfo]) -> Result<()> {
    w.u2(checked_len(members.len())?);
    for member in members {
        w.u2(member.access_flags);
        w.u2(member.name_index);
        w.u2(member.descriptor_index);
        write_attributes(w, &member.attributes)?;
    }
    Ok(())
}

pub(crate) fn write_attributes(w: &mut Writer, attributes: &[Attribute]) -> Result<()> {
    w.u2(checked_len(attributes.len())?);
    for attribute in attributes {
        w.u2(attribute.name_index);
        w.u4(attribute.info.len() as u32);
        w.bytes(&attribute.info);
    }
    Ok(())
}
