//! Turns class-file bytes into a [`ClassFile`], and the big-endian cursor used for `Code`
//! attribute payloads.

use crate::class_file::{Attribute, ClassFile, MemberInfo};
use crate::constant_pool::{Constant, ConstantPool};
use crate::result::{Error, Result};
use noak::MStr;
use noak::reader::Class;
use noak::reader::cpool::{self, Item};

/// Big-endian cursor over a byte slice.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(Error::UnexpectedEof {
                offset: self.pos,
                wanted: n,
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u1(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u2(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u4(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i1(&mut self) -> Result<i8> {
        Ok(self.u1()? as i8)
    }

    pub fn i2(&mut self) -> Result<i16> {
        Ok(self.u2()? as i16)
    }

    pub fn i4(&mut self) -> Result<i32> {
        Ok(self.u4()? as i32)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }
}

/// Copies every attribute of a noak member or class into raw [`Attribute`]s.
macro_rules! raw_attributes {
    ($attributes:expr) => {{
        let mut out = Vec::new();
        for attribute in $attributes {
            let attribute = attribute?;
            out.push(Attribute {
                name_index: attribute.name().as_u16(),
                info: attribute.content().to_vec(),
            });
        }
        out
    }};
}

/// Copies the fields or methods of a noak class into [`MemberInfo`]s.
macro_rules! members {
    ($members:expr) => {{
        let mut out = Vec::new();
        for member in $members {
            let member = member?;
            out.push(MemberInfo {
                access_flags: member.access_flags().bits(),
                name_index: member.name().as_u16(),
                descriptor_index: member.descriptor().as_u16(),
                attributes: raw_attributes!(member.attributes()),
            });
        }
        out
    }};
}

impl ClassFile {
    /// Parses a complete class file.
    ///
    /// Structure and constant pool are decoded by `noak`; the result keeps every pool index and
    /// attribute payload as stored so unchanged parts are written back byte-identical.
    ///
    /// # Arguments
    /// * `bytes` - The raw class-file contents.
    ///
    /// # Returns
    /// The decoded class, or an error describing the first malformation encountered.
    pub fn parse(bytes: &[u8]) -> Result<ClassFile> {
        let class = Class::new(bytes)?;
        let version = class.version();
        let constant_pool = owned_pool(class.pool())?;

        let mut interfaces = Vec::new();
        for interface in class.interfaces() {
            interfaces.push(interface?.as_u16());
        }
        let fields = members!(class.fields());
        let methods = members!(class.methods());
        let attributes = raw_attributes!(class.attributes());
        let this_class = class.this_class().as_u16();

        // Fail early on a dangling class reference rather than mid-rewrite.
        constant_pool.class_name(this_class)?;

        tracing::trace!(
            "decoded class v{}.{} with {} constants, {} methods",
            version.major,
            version.minor,
            constant_pool.count(),
            methods.len()
        );

        Ok(ClassFile {
            minor_version: version.minor,
            major_version: version.major,
            constant_pool,
            access_flags: class.access_flags().bits(),
            this_class,
            super_class: class.super_class().map_or(0, |index| index.as_u16()),
            interfaces,
            fields,
            methods,
            attributes,
        })
    }
}

/// Copies a decoded pool into an owned, appendable [`ConstantPool`] at the same indices.
fn owned_pool(pool: &cpool::ConstantPool<'_>) -> Result<ConstantPool> {
    let mut entries = vec![Constant::Unusable];
    for (index, item) in pool.iter_indices() {
        let slot = index.as_u16();
        entries.resize(usize::from(slot), Constant::Unusable);
        let constant = match item {
            Item::Utf8(utf8) => owned_utf8(utf8.content),
            Item::Integer(c) => Constant::Integer(c.value),
            Item::Float(c) => Constant::Float(c.value.to_bits()),
            Item::Long(c) => Constant::Long(c.value),
            Item::Double(c) => Constant::Double(c.value.to_bits()),
            Item::Class(c) => Constant::Class {
                name_index: c.name.as_u16(),
            },
            Item::String(c) => Constant::String {
                string_index: c.string.as_u16(),
            },
            Item::FieldRef(c) => Constant::Fieldref {
                class_index: c.class.as_u16(),
                name_and_type_index: c.name_and_type.as_u16(),
            },
            Item::MethodRef(c) => Constant::Methodref {
                class_index: c.class.as_u16(),
                name_and_type_index: c.name_and_type.as_u16(),
            },
            Item::InterfaceMethodRef(c) => Constant::InterfaceMethodref {
                class_index: c.class.as_u16(),
                name_and_type_index: c.name_and_type.as_u16(),
            },
            Item::NameAndType(c) => Constant::NameAndType {
                name_index: c.name.as_u16(),
                descriptor_index: c.descriptor.as_u16(),
            },
            Item::MethodHandle(c) => Constant::MethodHandle {
                reference_kind: c.kind as u8,
                reference_index: c.reference.as_u16(),
            },
            Item::MethodType(c) => Constant::MethodType {
                descriptor_index: c.descriptor.as_u16(),
            },
            Item::Dynamic(c) => Constant::Dynamic {
                bootstrap_method_attr_index: c.bootstrap_method_attr,
                name_and_type_index: c.name_and_type.as_u16(),
            },
            Item::InvokeDynamic(c) => Constant::InvokeDynamic {
                bootstrap_method_attr_index: c.bootstrap_method_attr,
                name_and_type_index: c.name_and_type.as_u16(),
            },
            Item::Module(c) => Constant::Module {
                name_index: c.name.as_u16(),
            },
            Item::Package(c) => Constant::Package {
                name_index: c.name.as_u16(),
            },
            #[allow(unreachable_patterns)]
            _ => {
                return Err(Error::ConstantKindMismatch {
                    index: slot,
                    expected: "loadable constant",
                });
            }
        };
        let wide = constant.is_wide();
        entries.push(constant);
        if wide {
            entries.push(Constant::Unusable);
        }
    }
    Ok(ConstantPool::from_entries(entries))
}

/// Strings that are not valid Unicode (lone surrogates) keep their exact bytes.
fn owned_utf8(content: &MStr) -> Constant {
    match content.to_str() {
        Some(text) => Constant::Utf8(text.to_owned()),
        None => Constant::OpaqueUtf8 {
            raw: content.as_bytes().to_vec(),
            lossy: content.display().to_string(),
        },
    }
}

pub(crate) fn parse_attributes(r: &mut Reader<'_>) -> Result<Vec<Attribute>> {
    let count = r.u2()?;
    (0..count)
        .map(|_| {
            let name_index = r.u2()?;
            let len = r.u4()? as usize;
            Ok(Attribute {
                name_index,
                info: r.take(len)?.to_vec(),
            })
        })
        .collect()
}
