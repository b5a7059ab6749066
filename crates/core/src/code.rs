//! `Code` attribute model and the label-based method body used for editing.
//!
//! A [`MethodBody`] is a flat list of [`Node`]s. Labels mark positions that something refers
//! to: branch targets, exception ranges, local-variable scopes. Inserting instructions
//! therefore never invalidates a reference, and [`MethodBody::assemble`] recomputes every
//! offset, widening branches that no longer fit in 16 bits.

use crate::class_file::Attribute;
use crate::constant_pool::ConstantPool;
use crate::decoder::{Reader, parse_attributes};
use crate::encoder::{Writer, write_attributes};
use crate::frames::{self, FrameContext};
use crate::instruction::{Insn, decode_instructions};
use crate::opcodes::{JSR, RET};
use crate::result::{Error, Result};
use std::collections::{BTreeMap, HashSet};

const MAX_CODE_LENGTH: usize = 65535;

/// One row of a method's exception table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// Zero for a catch-all (`finally`) handler.
    pub catch_type: u16,
}

/// Structured view of a `Code` attribute payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionEntry>,
    pub attributes: Vec<Attribute>,
}

impl CodeAttribute {
    pub fn parse(info: &[u8]) -> Result<CodeAttribute> {
        let mut r = Reader::new(info);
        let max_stack = r.u2()?;
        let max_locals = r.u2()?;
        let code_length = r.u4()? as usize;
        let code = r.take(code_length)?.to_vec();
        let table_len = r.u2()?;
        let exception_table = (0..table_len)
            .map(|_| {
                Ok(ExceptionEntry {
                    start_pc: r.u2()?,
                    end_pc: r.u2()?,
                    handler_pc: r.u2()?,
                    catch_type: r.u2()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let attributes = parse_attributes(&mut r)?;
        Ok(CodeAttribute {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = Writer::with_capacity(self.code.len() + 32);
        w.u2(self.max_stack);
        w.u2(self.max_locals);
        w.u4(self.code.len() as u32);
        w.bytes(&self.code);
        w.u2(self.exception_table.len() as u16);
        for e in &self.exception_table {
            w.u2(e.start_pc);
            w.u2(e.end_pc);
            w.u2(e.handler_pc);
            w.u2(e.catch_type);
        }
        write_attributes(&mut w, &self.attributes)?;
        Ok(w.into_bytes())
    }
}

/// A position in a [`MethodBody`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

/// An element of a method body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Label(Label),
    /// Source line of the next instruction.
    Line(u16),
    Insn(Insn<Label>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TryCatch {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
    pub catch_type: u16,
}

/// Which debug table a local-variable entry came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalTable {
    /// `LocalVariableTable`: the entry carries a descriptor.
    Descriptor,
    /// `LocalVariableTypeTable`: the entry carries a generic signature.
    Signature,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalVar {
    pub table: LocalTable,
    pub start: Label,
    pub end: Label,
    pub name_index: u16,
    /// Descriptor or signature index depending on `table`.
    pub type_index: u16,
    pub index: u16,
}

/// Editable method body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MethodBody {
    pub max_stack: u16,
    pub max_locals: u16,
    pub nodes: Vec<Node>,
    pub try_catches: Vec<TryCatch>,
    pub local_vars: Vec<LocalVar>,
    /// Code attributes without bytecode offsets, carried over verbatim.
    pub attributes: Vec<Attribute>,
    next_label: u32,
}

/// Result of laying out a method body.
#[derive(Clone, Debug)]
pub struct Assembled {
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionEntry>,
    /// Offset of every node, parallel to [`MethodBody::nodes`].
    pub node_offsets: Vec<u32>,
    label_offsets: Vec<Option<u32>>,
}

impl Assembled {
    pub fn offset_of(&self, label: Label) -> Result<u32> {
        self.label_offsets
            .get(label.0 as usize)
            .copied()
            .flatten()
            .ok_or_else(|| Error::InvalidBranchTarget {
                offset: 0,
                target: i64::from(label.0),
            })
    }
}

impl MethodBody {
    pub fn new(max_stack: u16, max_locals: u16) -> Self {
        Self {
            max_stack,
            max_locals,
            ..Default::default()
        }
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn place(&mut self, label: Label) {
        self.nodes.push(Node::Label(label));
    }

    pub fn push(&mut self, insn: Insn<Label>) {
        self.nodes.push(Node::Insn(insn));
    }

    /// Number of labels handed out so far.
    pub fn label_count(&self) -> u32 {
        self.next_label
    }

    /// Iterates over the instructions, skipping labels and line markers.
    pub fn insns(&self) -> impl Iterator<Item = &Insn<Label>> {
        self.nodes.iter().filter_map(|n| match n {
            Node::Insn(insn) => Some(insn),
            _ => None,
        })
    }

    /// Returns true if the body still uses `jsr`/`ret`.
    pub fn has_subroutines(&self) -> bool {
        self.insns().any(|insn| {
            matches!(insn, Insn::Jump { opcode: JSR, .. } | Insn::Var { opcode: RET, .. })
        })
    }

    /// Builds an editable body from a parsed `Code` attribute.
    ///
    /// # Arguments
    /// * `attr` - The parsed attribute.
    /// * `pool` - The owning class's constant pool, used to recognise debug attributes.
    ///
    /// # Returns
    /// The body, or an error when a branch or exception range does not land on an
    /// instruction boundary. Debug-table entries that do not are dropped instead.
    pub fn decode(attr: &CodeAttribute, pool: &ConstantPool) -> Result<MethodBody> {
        let insns = decode_instructions(&attr.code)?;
        let code_len = attr.code.len() as u32;
        let mut boundaries: HashSet<u32> = insns.iter().map(|i| i.offset).collect();
        boundaries.insert(code_len);

        let mut body = MethodBody::new(attr.max_stack, attr.max_locals);
        let mut labels: BTreeMap<u32, Label> = BTreeMap::new();
        let mut label_at = |body: &mut MethodBody, from: u32, offset: u32| -> Result<Label> {
            if !boundaries.contains(&offset) {
                return Err(Error::InvalidBranchTarget {
                    offset: from as usize,
                    target: i64::from(offset),
                });
            }
            Ok(*labels.entry(offset).or_insert_with(|| body.new_label()))
        };

        let mut mapped = Vec::with_capacity(insns.len());
        for instruction in &insns {
            let insn = instruction
                .insn
                .map_targets(|&t| label_at(&mut body, instruction.offset, t))?;
            mapped.push(insn);
        }
        for e in &attr.exception_table {
            let start = label_at(&mut body, u32::from(e.start_pc), u32::from(e.start_pc))?;
            let end = label_at(&mut body, u32::from(e.start_pc), u32::from(e.end_pc))?;
            let handler = label_at(&mut body, u32::from(e.start_pc), u32::from(e.handler_pc))?;
            body.try_catches.push(TryCatch {
                start,
                end,
                handler,
                catch_type: e.catch_type,
            });
        }

        let mut lines: BTreeMap<u32, Vec<u16>> = BTreeMap::new();
        for attribute in &attr.attributes {
            let name = attribute.name(pool)?;
            match name {
                "LineNumberTable" => {
                    let mut r = Reader::new(&attribute.info);
                    for _ in 0..r.u2()? {
                        let start_pc = u32::from(r.u2()?);
                        let line = r.u2()?;
                        if start_pc < code_len && boundaries.contains(&start_pc) {
                            lines.entry(start_pc).or_default().push(line);
                        }
                    }
                }
                "LocalVariableTable" | "LocalVariableTypeTable" => {
                    let table = if name == "LocalVariableTable" {
                        LocalTable::Descriptor
                    } else {
                        LocalTable::Signature
                    };
                    let mut r = Reader::new(&attribute.info);
                    for _ in 0..r.u2()? {
                        let start_pc = u32::from(r.u2()?);
                        let length = u32::from(r.u2()?);
                        let name_index = r.u2()?;
                        let type_index = r.u2()?;
                        let index = r.u2()?;
                        let end_pc = start_pc + length;
                        let (Ok(start), Ok(end)) = (
                            label_at(&mut body, start_pc, start_pc),
                            label_at(&mut body, start_pc, end_pc),
                        ) else {
                            tracing::debug!("dropping local variable entry at {start_pc}+{length}");
                            continue;
                        };
                        body.local_vars.push(LocalVar {
                            table,
                            start,
                            end,
                            name_index,
                            type_index,
                            index,
                        });
                    }
                }
                // Recomputed on assembly.
                "StackMapTable" => {}
                // Offsets inside these cannot be relocated reliably; they are metadata only.
                "RuntimeVisibleTypeAnnotations" | "RuntimeInvisibleTypeAnnotations" => {}
                _ => body.attributes.push(attribute.clone()),
            }
        }

        for (instruction, insn) in insns.iter().zip(mapped) {
            if let Some(&label) = labels.get(&instruction.offset) {
                body.nodes.push(Node::Label(label));
            }
            if let Some(ls) = lines.get(&instruction.offset) {
                body.nodes.extend(ls.iter().map(|&l| Node::Line(l)));
            }
            body.nodes.push(Node::Insn(insn));
        }
        if let Some(&label) = labels.get(&code_len) {
            body.nodes.push(Node::Label(label));
        }
        Ok(body)
    }

    /// Lays the body out into a code array.
    ///
    /// Jumps start in their 16-bit form; any whose displacement overflows is switched to its
    /// 32-bit form and layout repeats until stable. Sizes only grow, so this terminates.
    pub fn assemble(&self) -> Result<Assembled> {
        let mut wide: HashSet<usize> = HashSet::new();
        let (offsets, label_offsets, total) = loop {
            let mut offset: u32 = 0;
            let mut offsets = vec![0u32; self.nodes.len()];
            let mut label_offsets = vec![None; self.next_label as usize];
            for (i, node) in self.nodes.iter().enumerate() {
                offsets[i] = offset;
                match node {
                    Node::Label(l) => {
                        if let Some(slot) = label_offsets.get_mut(l.0 as usize) {
                            *slot = Some(offset);
                        }
                    }
                    Node::Line(_) => {}
                    Node::Insn(insn) => offset += insn.encoded_size(offset, wide.contains(&i)),
                }
            }
            let mut grew = false;
            for (i, node) in self.nodes.iter().enumerate() {
                if let Node::Insn(insn @ Insn::Jump { target, .. }) = node
                    && !wide.contains(&i)
                {
                    let target = label_offsets
                        .get(target.0 as usize)
                        .copied()
                        .flatten()
                        .ok_or_else(|| unplaced(*target))?;
                    let delta = i64::from(target) - i64::from(offsets[i]);
                    if i16::try_from(delta).is_err() {
                        tracing::debug!(
                            "widening opcode 0x{:02x} at {} (delta {delta})",
                            insn.opcode(),
                            offsets[i]
                        );
                        wide.insert(i);
                        grew = true;
                    }
                }
            }
            if !grew {
                break (offsets, label_offsets, offset);
            }
        };
        if total as usize > MAX_CODE_LENGTH {
            return Err(Error::CodeTooLarge(total as usize));
        }

        let resolve = |l: &Label| -> Result<u32> {
            label_offsets
                .get(l.0 as usize)
                .copied()
                .flatten()
                .ok_or_else(|| unplaced(*l))
        };
        let mut w = Writer::with_capacity(total as usize);
        for (i, node) in self.nodes.iter().enumerate() {
            if let Node::Insn(insn) = node {
                insn.encode(&mut w, offsets[i], wide.contains(&i), resolve)?;
            }
        }

        let mut exception_table = Vec::with_capacity(self.try_catches.len());
        for tc in &self.try_catches {
            let start = resolve(&tc.start)?;
            let end = resolve(&tc.end)?;
            if start >= end {
                continue;
            }
            exception_table.push(ExceptionEntry {
                start_pc: start as u16,
                end_pc: end as u16,
                handler_pc: resolve(&tc.handler)? as u16,
                catch_type: tc.catch_type,
            });
        }

        Ok(Assembled {
            code: w.into_bytes(),
            exception_table,
            node_offsets: offsets,
            label_offsets,
        })
    }

    /// Lays out the body and produces the final `Code` attribute.
    ///
    /// # Arguments
    /// * `pool` - Constant pool of the owning class; debug-table names and frame types are
    ///   added to it as needed.
    /// * `frames` - When set, max stack and a `StackMapTable` are computed from scratch.
    ///   Otherwise the body's own `max_stack` is kept.
    pub fn to_code_attribute(
        &self,
        pool: &mut ConstantPool,
        frames: Option<&FrameContext<'_>>,
    ) -> Result<CodeAttribute> {
        let assembled = self.assemble()?;
        let mut attributes = Vec::new();

        // A line marker has no width, so its offset is that of the next instruction.
        let line_rows: Vec<(u16, u16)> = self
            .nodes
            .iter()
            .zip(&assembled.node_offsets)
            .filter_map(|(node, &offset)| match node {
                Node::Line(line) => Some((offset as u16, *line)),
                _ => None,
            })
            .collect();
        if !line_rows.is_empty() {
            let mut w = Writer::new();
            w.u2(line_rows.len() as u16);
            for (pc, line) in &line_rows {
                w.u2(*pc);
                w.u2(*line);
            }
            attributes.push(Attribute {
                name_index: pool.add_utf8("LineNumberTable")?,
                info: w.into_bytes(),
            });
        }

        for (table, name) in [
            (LocalTable::Descriptor, "LocalVariableTable"),
            (LocalTable::Signature, "LocalVariableTypeTable"),
        ] {
            let mut rows = Vec::new();
            for var in self.local_vars.iter().filter(|v| v.table == table) {
                let start = assembled.offset_of(var.start)?;
                let end = assembled.offset_of(var.end)?;
                if end < start {
                    continue;
                }
                rows.push((start as u16, (end - start) as u16, var));
            }
            if rows.is_empty() {
                continue;
            }
            let mut w = Writer::new();
            w.u2(rows.len() as u16);
            for (start, length, var) in rows {
                w.u2(start);
                w.u2(length);
                w.u2(var.name_index);
                w.u2(var.type_index);
                w.u2(var.index);
            }
            attributes.push(Attribute {
                name_index: pool.add_utf8(name)?,
                info: w.into_bytes(),
            });
        }
        attributes.extend(self.attributes.iter().cloned());

        let (code, exception_table, max_stack, max_locals) = match frames {
            Some(ctx) => {
                let out = frames::compute_frames(
                    ctx,
                    &assembled.code,
                    &assembled.exception_table,
                    self.max_locals,
                    pool,
                )?;
                if let Some(info) = out.stack_map {
                    attributes.push(Attribute {
                        name_index: pool.add_utf8("StackMapTable")?,
                        info,
                    });
                }
                (out.code, out.exception_table, out.max_stack, out.max_locals)
            }
            None => (
                assembled.code,
                assembled.exception_table,
                self.max_stack,
                self.max_locals,
            ),
        };

        Ok(CodeAttribute {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }
}

fn unplaced(label: Label) -> Error {
    Error::InvalidBranchTarget {
        offset: 0,
        target: i64::from(label.0),
    }
}
