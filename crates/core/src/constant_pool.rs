//! Constant pool model with lookup and insert-or-reuse helpers.
//!
//! Entries keep their original indices; new entries are only ever appended, so every index
//! already referenced by existing bytecode stays valid after instrumentation.

use crate::result::{Error, Result};
use std::collections::HashMap;

/// Largest number of slots a constant pool may hold (the count field is a `u16`).
const MAX_ENTRIES: usize = u16::MAX as usize;

/// A single constant-pool entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Constant {
    /// Index 0 and the slot following a `Long`/`Double`.
    Unusable,
    Utf8(String),
    /// A modified-UTF-8 string that has no faithful `String` form (lone surrogates).
    OpaqueUtf8 {
        /// The bytes exactly as stored in the class file.
        raw: Vec<u8>,
        /// Lossy rendering used for lookups and diagnostics.
        lossy: String,
    },
    Integer(i32),
    /// IEEE-754 bits, kept raw so NaN payloads round-trip.
    Float(u32),
    Long(i64),
    /// IEEE-754 bits, kept raw so NaN payloads round-trip.
    Double(u64),
    Class {
        name_index: u16,
    },
    String {
        string_index: u16,
    },
    Fieldref {
        class_index: u16,
        name_and_type_index: u16,
    },
    Methodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    InterfaceMethodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    MethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    MethodType {
        descriptor_index: u16,
    },
    Dynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    InvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    Module {
        name_index: u16,
    },
    Package {
        name_index: u16,
    },
}

impl Constant {
    /// Returns true for entries that occupy two pool slots.
    pub fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }
}

/// A resolved field or method reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemberRef<'a> {
    /// Internal name of the owning class.
    pub owner: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
}

/// The constant pool of one class file.
#[derive(Clone, Debug)]
pub struct ConstantPool {
    entries: Vec<Constant>,
    lookup: HashMap<Constant, u16>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self {
            entries: vec![Constant::Unusable],
            lookup: HashMap::new(),
        }
    }
}

impl ConstantPool {
    /// Builds a pool from decoded entries; `entries[0]` must be the unusable slot.
    pub fn from_entries(entries: Vec<Constant>) -> Self {
        let mut lookup = HashMap::with_capacity(entries.len());
        for (index, constant) in entries.iter().enumerate() {
            if matches!(constant, Constant::Unusable) {
                continue;
            }
            // First occurrence wins so reuse never changes what existing code sees.
            lookup.entry(constant.clone()).or_insert(index as u16);
        }
        Self { entries, lookup }
    }

    /// Number of slots including index 0, i.e. the value of `constant_pool_count`.
    pub fn count(&self) -> u16 {
        self.entries.len() as u16
    }

    /// Iterates over `(index, entry)` pairs, skipping unusable slots.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Constant)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, c)| !matches!(c, Constant::Unusable))
            .map(|(i, c)| (i as u16, c))
    }

    pub fn get(&self, index: u16) -> Result<&Constant> {
        match self.entries.get(usize::from(index)) {
            Some(Constant::Unusable) | None => Err(Error::InvalidConstantIndex(index)),
            Some(constant) => Ok(constant),
        }
    }

    pub fn utf8(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            Constant::Utf8(text) => Ok(text),
            Constant::OpaqueUtf8 { lossy, .. } => Ok(lossy),
            _ => Err(Error::ConstantKindMismatch {
                index,
                expected: "Utf8",
            }),
        }
    }

    /// Returns the internal name of a `Class` entry.
    pub fn class_name(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            Constant::Class { name_index } => self.utf8(*name_index),
            _ => Err(Error::ConstantKindMismatch {
                index,
                expected: "Class",
            }),
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.get(index)? {
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => Err(Error::ConstantKindMismatch {
                index,
                expected: "NameAndType",
            }),
        }
    }

    /// Resolves a `Fieldref`, `Methodref` or `InterfaceMethodref` entry.
    pub fn member_ref(&self, index: u16) -> Result<MemberRef<'_>> {
        match self.get(index)? {
            Constant::Fieldref {
                class_index,
                name_and_type_index,
            }
            | Constant::Methodref {
                class_index,
                name_and_type_index,
            }
            | Constant::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => {
                let (name, descriptor) = self.name_and_type(*name_and_type_index)?;
                Ok(MemberRef {
                    owner: self.class_name(*class_index)?,
                    name,
                    descriptor,
                })
            }
            _ => Err(Error::ConstantKindMismatch {
                index,
                expected: "member reference",
            }),
        }
    }

    /// Resolves the name and descriptor of an `InvokeDynamic` or `Dynamic` entry.
    pub fn dynamic_name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.get(index)? {
            Constant::InvokeDynamic {
                name_and_type_index,
                ..
            }
            | Constant::Dynamic {
                name_and_type_index,
                ..
            } => self.name_and_type(*name_and_type_index),
            _ => Err(Error::ConstantKindMismatch {
                index,
                expected: "InvokeDynamic",
            }),
        }
    }

    /// Returns the index of an equal entry, appending one if none exists.
    pub fn add(&mut self, constant: Constant) -> Result<u16> {
        if let Some(&index) = self.lookup.get(&constant) {
            return Ok(index);
        }
        let slots = if constant.is_wide() { 2 } else { 1 };
        if self.entries.len() + slots > MAX_ENTRIES {
            return Err(Error::ConstantPoolOverflow);
        }
        let index = self.entries.len() as u16;
        let wide = constant.is_wide();
        self.lookup.insert(constant.clone(), index);
        self.entries.push(constant);
        if wide {
            self.entries.push(Constant::Unusable);
        }
        Ok(index)
    }

    pub fn add_utf8(&mut self, text: &str) -> Result<u16> {
        self.add(Constant::Utf8(text.to_string()))
    }

    pub fn add_class(&mut self, internal_name: &str) -> Result<u16> {
        let name_index = self.add_utf8(internal_name)?;
        self.add(Constant::Class { name_index })
    }

    pub fn add_integer(&mut self, value: i32) -> Result<u16> {
        self.add(Constant::Integer(value))
    }

    pub fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        self.add(Constant::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    pub fn add_method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.add(Constant::Methodref {
            class_index,
            name_and_type_index,
        })
    }

    pub fn add_field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.add(Constant::Fieldref {
            class_index,
            name_and_type_index,
        })
    }

    pub(crate) fn entries(&self) -> &[Constant] {
        &self.entries
    }
}

/// Encodes text as modified UTF-8: NUL as two bytes and supplementary characters as surrogate
/// pairs.
pub fn encode_modified_utf8(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for unit in text.encode_utf16() {
        match unit {
            0x0001..=0x007f => out.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                out.push(0xc0 | ((unit >> 6) & 0x1f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                out.push(0xe0 | ((unit >> 12) & 0x0f) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    out
}
