//! JVM instruction decoding and encoding.
//!
//! [`Insn`] is generic over its branch-target type: the decoder yields absolute byte offsets
//! (`Insn<u32>`), while the editable method body uses labels (`Insn<Label>`). Encodings that
//! only differ in width (`goto`/`goto_w`, `ldc`/`ldc_w`, `wide` locals) are normalized on
//! decode and re-chosen on encode.

use crate::decoder::Reader;
use crate::encoder::Writer;
use crate::opcodes::*;
use crate::result::{Error, Result};
use std::fmt;

/// One instruction with its operands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Insn<T> {
    /// Any instruction without operands.
    Simple(u8),
    /// `bipush`, `sipush` and `newarray`.
    Push { opcode: u8, value: i32 },
    /// Explicit-index loads and stores, and `ret`.
    Var { opcode: u8, index: u16 },
    Iinc { index: u16, delta: i16 },
    /// Conditional branches, `goto` and `jsr`.
    Jump { opcode: u8, target: T },
    TableSwitch {
        default: T,
        low: i32,
        high: i32,
        targets: Vec<T>,
    },
    LookupSwitch { default: T, pairs: Vec<(i32, T)> },
    /// `ldc`/`ldc_w`.
    Ldc { index: u16 },
    Ldc2 { index: u16 },
    /// Field access, `invokevirtual`/`special`/`static`, `new`, `anewarray`, `checkcast`,
    /// `instanceof`.
    Constant { opcode: u8, index: u16 },
    InvokeInterface { index: u16, count: u8 },
    InvokeDynamic { index: u16 },
    MultiANewArray { index: u16, dims: u8 },
}

impl<T> Insn<T> {
    /// Returns the opcode this instruction is encoded with in its narrowest form.
    pub fn opcode(&self) -> u8 {
        match self {
            Insn::Simple(op)
            | Insn::Push { opcode: op, .. }
            | Insn::Var { opcode: op, .. }
            | Insn::Jump { opcode: op, .. }
            | Insn::Constant { opcode: op, .. } => *op,
            Insn::Iinc { .. } => IINC,
            Insn::TableSwitch { .. } => TABLESWITCH,
            Insn::LookupSwitch { .. } => LOOKUPSWITCH,
            Insn::Ldc { index } => {
                if *index <= 0xff {
                    LDC
                } else {
                    LDC_W
                }
            }
            Insn::Ldc2 { .. } => LDC2_W,
            Insn::InvokeInterface { .. } => INVOKEINTERFACE,
            Insn::InvokeDynamic { .. } => INVOKEDYNAMIC,
            Insn::MultiANewArray { .. } => MULTIANEWARRAY,
        }
    }

    /// All branch targets, default first for switches.
    pub fn targets(&self) -> Vec<&T> {
        match self {
            Insn::Jump { target, .. } => vec![target],
            Insn::TableSwitch {
                default, targets, ..
            } => std::iter::once(default).chain(targets.iter()).collect(),
            Insn::LookupSwitch { default, pairs } => std::iter::once(default)
                .chain(pairs.iter().map(|(_, t)| t))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Rebuilds the instruction with every branch target mapped through `f`.
    pub fn map_targets<U, E>(&self, mut f: impl FnMut(&T) -> std::result::Result<U, E>) -> std::result::Result<Insn<U>, E> {
        Ok(match self {
            Insn::Simple(op) => Insn::Simple(*op),
            Insn::Push { opcode, value } => Insn::Push {
                opcode: *opcode,
                value: *value,
            },
            Insn::Var { opcode, index } => Insn::Var {
                opcode: *opcode,
                index: *index,
            },
            Insn::Iinc { index, delta } => Insn::Iinc {
                index: *index,
                delta: *delta,
            },
            Insn::Jump { opcode, target } => Insn::Jump {
                opcode: *opcode,
                target: f(target)?,
            },
            Insn::TableSwitch {
                default,
                low,
                high,
                targets,
            } => Insn::TableSwitch {
                default: f(default)?,
                low: *low,
                high: *high,
                targets: targets.iter().map(&mut f).collect::<std::result::Result<_, E>>()?,
            },
            Insn::LookupSwitch { default, pairs } => Insn::LookupSwitch {
                default: f(default)?,
                pairs: pairs
                    .iter()
                    .map(|(k, t)| f(t).map(|t| (*k, t)))
                    .collect::<std::result::Result<_, E>>()?,
            },
            Insn::Ldc { index } => Insn::Ldc { index: *index },
            Insn::Ldc2 { index } => Insn::Ldc2 { index: *index },
            Insn::Constant { opcode, index } => Insn::Constant {
                opcode: *opcode,
                index: *index,
            },
            Insn::InvokeInterface { index, count } => Insn::InvokeInterface {
                index: *index,
                count: *count,
            },
            Insn::InvokeDynamic { index } => Insn::InvokeDynamic { index: *index },
            Insn::MultiANewArray { index, dims } => Insn::MultiANewArray {
                index: *index,
                dims: *dims,
            },
        })
    }

    /// Encoded size in bytes when placed at `offset`.
    ///
    /// `wide_jump` selects the 32-bit form of a jump: `goto_w`/`jsr_w`, or an inverted
    /// conditional over a `goto_w`.
    pub fn encoded_size(&self, offset: u32, wide_jump: bool) -> u32 {
        match self {
            Insn::Simple(_) => 1,
            Insn::Push { opcode, .. } => {
                if *opcode == SIPUSH {
                    3
                } else {
                    2
                }
            }
            Insn::Var { index, .. } => {
                if *index <= 0xff {
                    2
                } else {
                    4
                }
            }
            Insn::Iinc { index, delta } => {
                if *index <= 0xff && i8::try_from(*delta).is_ok() {
                    3
                } else {
                    6
                }
            }
            Insn::Jump { opcode, .. } => match (wide_jump, *opcode) {
                (false, _) => 3,
                (true, GOTO | JSR) => 5,
                (true, _) => 8,
            },
            Insn::TableSwitch { targets, .. } => {
                1 + switch_padding(offset) + 12 + 4 * targets.len() as u32
            }
            Insn::LookupSwitch { pairs, .. } => {
                1 + switch_padding(offset) + 8 + 8 * pairs.len() as u32
            }
            Insn::Ldc { index } => {
                if *index <= 0xff {
                    2
                } else {
                    3
                }
            }
            Insn::Ldc2 { .. } | Insn::Constant { .. } => 3,
            Insn::InvokeInterface { .. } | Insn::InvokeDynamic { .. } => 5,
            Insn::MultiANewArray { .. } => 4,
        }
    }

    /// Writes the instruction, resolving targets to absolute offsets with `resolve`.
    pub fn encode(
        &self,
        w: &mut Writer,
        offset: u32,
        wide_jump: bool,
        resolve: impl Fn(&T) -> Result<u32>,
    ) -> Result<()> {
        let rel = |target: &T| -> Result<i64> { Ok(i64::from(resolve(target)?) - i64::from(offset)) };
        let narrow = |target: &T| -> Result<i16> {
            let delta = rel(target)?;
            i16::try_from(delta).map_err(|_| Error::InvalidBranchTarget {
                offset: offset as usize,
                target: delta,
            })
        };
        match self {
            Insn::Simple(op) => w.u1(*op),
            Insn::Push { opcode, value } => {
                w.u1(*opcode);
                if *opcode == SIPUSH {
                    w.i2(*value as i16);
                } else {
                    w.u1(*value as u8);
                }
            }
            Insn::Var { opcode, index } => {
                if *index <= 0xff {
                    w.u1(*opcode);
                    w.u1(*index as u8);
                } else {
                    w.u1(WIDE);
                    w.u1(*opcode);
                    w.u2(*index);
                }
            }
            Insn::Iinc { index, delta } => match (u8::try_from(*index), i8::try_from(*delta)) {
                (Ok(index), Ok(delta)) => {
                    w.u1(IINC);
                    w.u1(index);
                    w.i1(delta);
                }
                _ => {
                    w.u1(WIDE);
                    w.u1(IINC);
                    w.u2(*index);
                    w.i2(*delta);
                }
            },
            Insn::Jump { opcode, target } => match (wide_jump, *opcode) {
                (false, op) => {
                    w.u1(op);
                    w.i2(narrow(target)?);
                }
                (true, GOTO) => {
                    w.u1(GOTO_W);
                    w.i4(rel(target)? as i32);
                }
                (true, JSR) => {
                    w.u1(JSR_W);
                    w.i4(rel(target)? as i32);
                }
                (true, op) => {
                    // Skip over the goto_w when the original condition does not hold.
                    w.u1(invert_branch(op));
                    w.i2(8);
                    w.u1(GOTO_W);
                    w.i4((rel(target)? - 3) as i32);
                }
            },
            Insn::TableSwitch {
                default,
                low,
                high,
                targets,
            } => {
                w.u1(TABLESWITCH);
                for _ in 0..switch_padding(offset) {
                    w.u1(0);
                }
                w.i4(rel(default)? as i32);
                w.i4(*low);
                w.i4(*high);
                for target in targets {
                    w.i4(rel(target)? as i32);
                }
            }
            Insn::LookupSwitch { default, pairs } => {
                w.u1(LOOKUPSWITCH);
                for _ in 0..switch_padding(offset) {
                    w.u1(0);
                }
                w.i4(rel(default)? as i32);
                w.i4(pairs.len() as i32);
                for (key, target) in pairs {
                    w.i4(*key);
                    w.i4(rel(target)? as i32);
                }
            }
            Insn::Ldc { index } => {
                if *index <= 0xff {
                    w.u1(LDC);
                    w.u1(*index as u8);
                } else {
                    w.u1(LDC_W);
                    w.u2(*index);
                }
            }
            Insn::Ldc2 { index } => {
                w.u1(LDC2_W);
                w.u2(*index);
            }
            Insn::Constant { opcode, index } => {
                w.u1(*opcode);
                w.u2(*index);
            }
            Insn::InvokeInterface { index, count } => {
                w.u1(INVOKEINTERFACE);
                w.u2(*index);
                w.u1(*count);
                w.u1(0);
            }
            Insn::InvokeDynamic { index } => {
                w.u1(INVOKEDYNAMIC);
                w.u2(*index);
                w.u2(0);
            }
            Insn::MultiANewArray { index, dims } => {
                w.u1(MULTIANEWARRAY);
                w.u2(*index);
                w.u1(*dims);
            }
        }
        Ok(())
    }
}

/// Builds the shortest instruction pushing `value`.
pub fn push_int<T>(value: i32) -> Option<Insn<T>> {
    match value {
        -1..=5 => Some(Insn::Simple((i32::from(ICONST_0) + value) as u8)),
        v if i8::try_from(v).is_ok() => Some(Insn::Push {
            opcode: BIPUSH,
            value: v,
        }),
        v if i16::try_from(v).is_ok() => Some(Insn::Push {
            opcode: SIPUSH,
            value: v,
        }),
        _ => None,
    }
}

/// Padding bytes after a switch opcode at `offset` so its operands are 4-byte aligned.
pub fn switch_padding(offset: u32) -> u32 {
    (4 - (offset + 1) % 4) % 4
}

/// One decoded instruction and where it sits in the code array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub offset: u32,
    pub size: u32,
    pub insn: Insn<u32>,
}

/// Decodes a whole code array.
///
/// # Arguments
/// * `code` - The bytes of a `Code` attribute's code array.
///
/// # Returns
/// The instructions in order, with branch targets as absolute offsets. Targets are only
/// range-checked; callers needing instruction-boundary checks do them against the result.
pub fn decode_instructions(code: &[u8]) -> Result<Vec<Instruction>> {
    let mut r = Reader::new(code);
    let mut out = Vec::new();
    while r.remaining() > 0 {
        let start = r.position();
        let insn = decode_one(&mut r, start, code.len())?;
        out.push(Instruction {
            offset: start as u32,
            size: (r.position() - start) as u32,
            insn,
        });
    }
    Ok(out)
}

fn decode_one(r: &mut Reader<'_>, start: usize, len: usize) -> Result<Insn<u32>> {
    let target = |delta: i64| -> Result<u32> {
        let abs = start as i64 + delta;
        if abs < 0 || abs >= len as i64 {
            return Err(Error::InvalidBranchTarget {
                offset: start,
                target: abs,
            });
        }
        Ok(abs as u32)
    };
    let opcode = r.u1()?;
    Ok(match opcode {
        BIPUSH => Insn::Push {
            opcode,
            value: i32::from(r.i1()?),
        },
        SIPUSH => Insn::Push {
            opcode,
            value: i32::from(r.i2()?),
        },
        NEWARRAY => Insn::Push {
            opcode,
            value: i32::from(r.u1()?),
        },
        LDC => Insn::Ldc {
            index: u16::from(r.u1()?),
        },
        LDC_W => Insn::Ldc { index: r.u2()? },
        LDC2_W => Insn::Ldc2 { index: r.u2()? },
        ILOAD..=ALOAD | ISTORE..=ASTORE | RET => Insn::Var {
            opcode,
            index: u16::from(r.u1()?),
        },
        IINC => Insn::Iinc {
            index: u16::from(r.u1()?),
            delta: i16::from(r.i1()?),
        },
        IFEQ..=JSR | IFNULL | IFNONNULL => Insn::Jump {
            opcode,
            target: target(i64::from(r.i2()?))?,
        },
        GOTO_W | JSR_W => Insn::Jump {
            opcode: if opcode == GOTO_W { GOTO } else { JSR },
            target: target(i64::from(r.i4()?))?,
        },
        TABLESWITCH => {
            r.skip(switch_padding(start as u32) as usize)?;
            let default = target(i64::from(r.i4()?))?;
            let low = r.i4()?;
            let high = r.i4()?;
            if high < low {
                return Err(Error::InvalidOpcode { opcode, offset: start });
            }
            let count = (i64::from(high) - i64::from(low) + 1) as usize;
            if count > len {
                return Err(Error::UnexpectedEof {
                    offset: r.position(),
                    wanted: count * 4,
                });
            }
            let targets = (0..count)
                .map(|_| target(i64::from(r.i4()?)))
                .collect::<Result<Vec<_>>>()?;
            Insn::TableSwitch {
                default,
                low,
                high,
                targets,
            }
        }
        LOOKUPSWITCH => {
            r.skip(switch_padding(start as u32) as usize)?;
            let default = target(i64::from(r.i4()?))?;
            let npairs = r.i4()?;
            if npairs < 0 || npairs as usize > len {
                return Err(Error::InvalidOpcode { opcode, offset: start });
            }
            let pairs = (0..npairs)
                .map(|_| {
                    let key = r.i4()?;
                    Ok((key, target(i64::from(r.i4()?))?))
                })
                .collect::<Result<Vec<_>>>()?;
            Insn::LookupSwitch { default, pairs }
        }
        GETSTATIC..=INVOKESTATIC | NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => Insn::Constant {
            opcode,
            index: r.u2()?,
        },
        INVOKEINTERFACE => {
            let index = r.u2()?;
            let count = r.u1()?;
            r.skip(1)?;
            Insn::InvokeInterface { index, count }
        }
        INVOKEDYNAMIC => {
            let index = r.u2()?;
            r.skip(2)?;
            Insn::InvokeDynamic { index }
        }
        MULTIANEWARRAY => Insn::MultiANewArray {
            index: r.u2()?,
            dims: r.u1()?,
        },
        WIDE => {
            let inner = r.u1()?;
            match inner {
                ILOAD..=ALOAD | ISTORE..=ASTORE | RET => Insn::Var {
                    opcode: inner,
                    index: r.u2()?,
                },
                IINC => Insn::Iinc {
                    index: r.u2()?,
                    delta: r.i2()?,
                },
                _ => {
                    return Err(Error::InvalidOpcode {
                        opcode: inner,
                        offset: start + 1,
                    });
                }
            }
        }
        op if op <= JSR_W => Insn::Simple(op),
        op => return Err(Error::InvalidOpcode { opcode: op, offset: start }),
    })
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = mnemonic(self.insn.opcode()).unwrap_or("???");
        write!(f, "{:>5}: {name}", self.offset)?;
        match &self.insn {
            Insn::Simple(_) => Ok(()),
            Insn::Push { value, .. } => write!(f, " {value}"),
            Insn::Var { index, .. } => write!(f, " {index}"),
            Insn::Iinc { index, delta } => write!(f, " {index} {delta}"),
            Insn::Jump { target, .. } => write!(f, " {target}"),
            Insn::TableSwitch {
                default,
                low,
                targets,
                ..
            } => {
                write!(f, " {{")?;
                for (i, t) in targets.iter().enumerate() {
                    write!(f, " {}: {t};", i64::from(*low) + i as i64)?;
                }
                write!(f, " default: {default} }}")
            }
            Insn::LookupSwitch { default, pairs } => {
                write!(f, " {{")?;
                for (k, t) in pairs {
                    write!(f, " {k}: {t};")?;
                }
                write!(f, " default: {default} }}")
            }
            Insn::Ldc { index }
            | Insn::Ldc2 { index }
            | Insn::Constant { index, .. }
            | Insn::InvokeDynamic { index } => write!(f, " #{index}"),
            Insn::InvokeInterface { index, count } => write!(f, " #{index}, {count}"),
            Insn::MultiANewArray { index, dims } => write!(f, " #{index}, {dims}"),
        }
    }
}
