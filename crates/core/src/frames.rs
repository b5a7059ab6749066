//! Stack-map frame inference.
//!
//! Runs a worklist data-flow analysis over assembled bytecode to recover the verification type
//! of every local and stack slot at every instruction, then emits a compressed
//! `StackMapTable` holding frames only where the type checker needs them: branch targets,
//! exception handlers and the start of each unreachable block. Unreachable code is replaced by
//! `nop`s ending in `athrow`, and exception ranges are split around it, so the emitted frames
//! never have to describe code that no path reaches.

use crate::code::ExceptionEntry;
use crate::constant_pool::{Constant, ConstantPool};
use crate::descriptor::{self, TypeDescriptor};
use crate::encoder::Writer;
use crate::instruction::{Insn, Instruction, decode_instructions};
use crate::opcodes::*;
use crate::result::{Error, Result};
use std::collections::{BTreeSet, HashMap, VecDeque};

const OBJECT: &str = "java/lang/Object";

/// Computes the nearest common ancestor of two internal class names.
///
/// Implementations must not fail: when nothing better is known they answer
/// `java/lang/Object`.
pub trait CommonSuperclass: Send + Sync {
    fn common_super_class(&self, a: &str, b: &str) -> String;
}

/// Everything the analysis needs to know about the method besides its code.
pub struct FrameContext<'a> {
    pub class_name: &'a str,
    pub access_flags: u16,
    pub method_name: &'a str,
    pub descriptor: &'a str,
    pub resolver: &'a dyn CommonSuperclass,
}

/// Verification type of one slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum VType {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    /// Internal class name or array descriptor.
    Object(String),
    /// Result of the `new` at this offset, before its constructor ran.
    Uninitialized(u32),
}

impl VType {
    fn is_wide(&self) -> bool {
        matches!(self, VType::Long | VType::Double)
    }

    fn is_reference(&self) -> bool {
        matches!(
            self,
            VType::Null | VType::Object(_) | VType::UninitializedThis | VType::Uninitialized(_)
        )
    }

    fn from_field_type(ty: &TypeDescriptor) -> VType {
        match ty {
            TypeDescriptor::Float => VType::Float,
            TypeDescriptor::Long => VType::Long,
            TypeDescriptor::Double => VType::Double,
            TypeDescriptor::Object(name) => VType::Object(name.clone()),
            array @ TypeDescriptor::Array(..) => {
                VType::Object(descriptor::to_descriptor(array, &str::to_string))
            }
            _ => VType::Integer,
        }
    }

    fn from_descriptor(descriptor: &str) -> Result<VType> {
        Ok(VType::from_field_type(&descriptor::parse_field(descriptor)?))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Frame {
    /// One entry per slot; a wide value is followed by `Top`.
    locals: Vec<VType>,
    /// One entry per value; wide values take a single entry.
    stack: Vec<VType>,
}

impl Frame {
    fn stack_words(&self) -> usize {
        self.stack.iter().map(|t| if t.is_wide() { 2 } else { 1 }).sum()
    }
}

/// Output of [`compute_frames`].
#[derive(Clone, Debug)]
pub struct FrameOutput {
    /// The input code with unreachable blocks overwritten.
    pub code: Vec<u8>,
    /// The input table with ranges over unreachable code removed.
    pub exception_table: Vec<ExceptionEntry>,
    pub max_stack: u16,
    pub max_locals: u16,
    /// `StackMapTable` payload, or `None` when no frame is required.
    pub stack_map: Option<Vec<u8>>,
}

/// Infers frames for one method.
///
/// # Arguments
/// * `ctx` - The method's owner, flags, name, descriptor and the superclass oracle.
/// * `code` - The assembled code array.
/// * `exception_table` - The assembled exception table.
/// * `max_locals` - The declared local count.
/// * `pool` - Constant pool; class entries for frame types are added to it.
///
/// # Returns
/// The possibly patched code and table plus computed maxima and the encoded stack map.
pub fn compute_frames(
    ctx: &FrameContext<'_>,
    code: &[u8],
    exception_table: &[ExceptionEntry],
    max_locals: u16,
    pool: &mut ConstantPool,
) -> Result<FrameOutput> {
    let insns = decode_instructions(code)?;
    let index_of: HashMap<u32, usize> = insns
        .iter()
        .enumerate()
        .map(|(i, ins)| (ins.offset, i))
        .collect();
    let at = |offset: u32| -> Result<usize> {
        index_of.get(&offset).copied().ok_or(Error::FrameComputation {
            offset: offset as usize,
            msg: "offset is not an instruction boundary".into(),
        })
    };

    let mut handlers = Vec::with_capacity(exception_table.len());
    for e in exception_table {
        let catch = if e.catch_type == 0 {
            "java/lang/Throwable".to_string()
        } else {
            pool.class_name(e.catch_type)?.to_string()
        };
        handlers.push((
            u32::from(e.start_pc),
            u32::from(e.end_pc),
            at(u32::from(e.handler_pc))?,
            catch,
        ));
    }

    let initial = initial_frame(ctx, max_locals)?;
    let mut frames: Vec<Option<Frame>> = vec![None; insns.len()];
    let mut max_stack = 0usize;
    let mut max_locals = usize::from(max_locals).max(initial.locals.len());
    if insns.is_empty() {
        return Err(Error::FrameComputation {
            offset: 0,
            msg: "empty code".into(),
        });
    }
    frames[0] = Some(initial.clone());

    let mut queue: VecDeque<usize> = VecDeque::from([0]);
    let mut queued = vec![false; insns.len()];
    queued[0] = true;
    let mut budget = insns.len().saturating_mul(64).max(1024);
    let interp = Interpreter {
        ctx,
        pool: &*pool,
        insns: &insns,
        index_of: &index_of,
    };

    while let Some(idx) = queue.pop_front() {
        queued[idx] = false;
        budget = budget.checked_sub(1).ok_or(Error::FrameComputation {
            offset: insns[idx].offset as usize,
            msg: "analysis did not converge".into(),
        })?;
        let Some(input) = frames[idx].clone() else {
            continue;
        };
        let ins = &insns[idx];
        max_stack = max_stack.max(input.stack_words());

        let output = interp.execute(ins, &input)?;
        max_stack = max_stack.max(output.stack_words());
        max_locals = max_locals.max(output.locals.len());

        let mut successors: Vec<(usize, Frame)> = Vec::new();
        for (start, end, handler, catch) in &handlers {
            if (*start..*end).contains(&ins.offset) {
                for locals in [&input.locals, &output.locals] {
                    successors.push((
                        *handler,
                        Frame {
                            locals: locals.clone(),
                            stack: vec![VType::Object(catch.clone())],
                        },
                    ));
                }
            }
        }
        for target in ins.insn.targets() {
            successors.push((at(*target)?, output.clone()));
        }
        if !is_unconditional(ins.insn.opcode()) {
            if idx + 1 >= insns.len() {
                return Err(Error::FrameComputation {
                    offset: ins.offset as usize,
                    msg: "execution falls off the end of the code".into(),
                });
            }
            successors.push((idx + 1, output));
        }

        for (succ, incoming) in successors {
            let changed = match &frames[succ] {
                None => {
                    frames[succ] = Some(incoming);
                    true
                }
                Some(existing) => {
                    let merged = merge_frames(ctx.resolver, existing, &incoming, insns[succ].offset)?;
                    if &merged != existing {
                        frames[succ] = Some(merged);
                        true
                    } else {
                        false
                    }
                }
            };
            if changed && !queued[succ] {
                queued[succ] = true;
                queue.push_back(succ);
            }
        }
    }

    // Replace unreachable blocks and trim exception ranges around them.
    let mut code = code.to_vec();
    let mut dead_blocks: Vec<(u32, u32)> = Vec::new();
    let mut i = 0;
    while i < insns.len() {
        if frames[i].is_some() {
            i += 1;
            continue;
        }
        let start = insns[i].offset;
        while i < insns.len() && frames[i].is_none() {
            i += 1;
        }
        let end = insns.get(i).map_or(code.len() as u32, |ins| ins.offset);
        code[start as usize..end as usize - 1].fill(NOP);
        code[end as usize - 1] = ATHROW;
        dead_blocks.push((start, end));
    }
    if !dead_blocks.is_empty() {
        tracing::debug!(
            "{}.{}: replaced {} unreachable block(s)",
            ctx.class_name,
            ctx.method_name,
            dead_blocks.len()
        );
        max_stack = max_stack.max(1);
    }
    let exception_table = split_ranges(exception_table, &dead_blocks);

    let mut frame_offsets: BTreeSet<u32> = BTreeSet::new();
    for (idx, ins) in insns.iter().enumerate() {
        if frames[idx].is_some() {
            frame_offsets.extend(ins.insn.targets().into_iter().copied());
        }
    }
    frame_offsets.extend(exception_table.iter().map(|e| u32::from(e.handler_pc)));

    let dead_starts: BTreeSet<u32> = dead_blocks.iter().map(|(s, _)| *s).collect();
    frame_offsets.extend(dead_starts.iter().copied());

    let throwable_frame = Frame {
        locals: Vec::new(),
        stack: vec![VType::Object("java/lang/Throwable".into())],
    };
    let mut encoder = StackMapEncoder::new(compact(&initial.locals));
    for offset in frame_offsets {
        let frame = if dead_starts.contains(&offset) {
            &throwable_frame
        } else {
            match frames[at(offset)?].as_ref() {
                Some(frame) => frame,
                None => continue,
            }
        };
        encoder.push(offset, frame, pool)?;
    }

    Ok(FrameOutput {
        code,
        exception_table,
        max_stack: u16::try_from(max_stack).unwrap_or(u16::MAX),
        max_locals: u16::try_from(max_locals).unwrap_or(u16::MAX),
        stack_map: encoder.finish(),
    })
}

fn initial_frame(ctx: &FrameContext<'_>, max_locals: u16) -> Result<Frame> {
    let descriptor = descriptor::parse_method(ctx.descriptor)?;
    let mut locals = Vec::with_capacity(usize::from(max_locals));
    if ctx.access_flags & crate::class_file::ACC_STATIC == 0 {
        if ctx.method_name == "<init>" && ctx.class_name != OBJECT {
            locals.push(VType::UninitializedThis);
        } else {
            locals.push(VType::Object(ctx.class_name.to_string()));
        }
    }
    for param in descriptor.parameter_types() {
        let ty = VType::from_field_type(param);
        let wide = ty.is_wide();
        locals.push(ty);
        if wide {
            locals.push(VType::Top);
        }
    }
    while locals.len() < usize::from(max_locals) {
        locals.push(VType::Top);
    }
    Ok(Frame {
        locals,
        stack: Vec::new(),
    })
}

fn merge_frames(
    resolver: &dyn CommonSuperclass,
    existing: &Frame,
    incoming: &Frame,
    offset: u32,
) -> Result<Frame> {
    if existing.stack.len() != incoming.stack.len() {
        return Err(Error::FrameComputation {
            offset: offset as usize,
            msg: format!(
                "stack height mismatch ({} vs {})",
                existing.stack.len(),
                incoming.stack.len()
            ),
        });
    }
    let len = existing.locals.len().max(incoming.locals.len());
    let mut locals = Vec::with_capacity(len);
    for i in 0..len {
        let a = existing.locals.get(i).unwrap_or(&VType::Top);
        let b = incoming.locals.get(i).unwrap_or(&VType::Top);
        locals.push(merge_type(resolver, a, b));
    }
    // A wide local whose upper half became unusable is itself unusable.
    for i in 0..locals.len() {
        if locals[i].is_wide() && locals.get(i + 1) != Some(&VType::Top) {
            locals[i] = VType::Top;
        }
    }
    let stack = existing
        .stack
        .iter()
        .zip(&incoming.stack)
        .map(|(a, b)| merge_type(resolver, a, b))
        .collect();
    Ok(Frame { locals, stack })
}

fn merge_type(resolver: &dyn CommonSuperclass, a: &VType, b: &VType) -> VType {
    match (a, b) {
        _ if a == b => a.clone(),
        (VType::Null, VType::Object(_)) => b.clone(),
        (VType::Object(_), VType::Null) => a.clone(),
        (VType::Object(x), VType::Object(y)) => VType::Object(merge_reference(resolver, x, y)),
        _ => VType::Top,
    }
}

fn merge_reference(resolver: &dyn CommonSuperclass, a: &str, b: &str) -> String {
    match (a.strip_prefix('['), b.strip_prefix('[')) {
        (None, None) => resolver.common_super_class(a, b),
        (Some(ea), Some(eb)) => {
            let element = |e: &str| -> Option<String> {
                if let Some(name) = e.strip_prefix('L') {
                    name.strip_suffix(';').map(str::to_string)
                } else if e.starts_with('[') {
                    Some(e.to_string())
                } else {
                    None
                }
            };
            match (element(ea), element(eb)) {
                (Some(x), Some(y)) => {
                    let merged = merge_reference(resolver, &x, &y);
                    if merged.starts_with('[') {
                        format!("[{merged}")
                    } else {
                        format!("[L{merged};")
                    }
                }
                _ => OBJECT.to_string(),
            }
        }
        _ => OBJECT.to_string(),
    }
}

/// Drops the upper half of wide locals and trailing `Top`s, as frames encode them.
fn compact(locals: &[VType]) -> Vec<VType> {
    let mut out = Vec::with_capacity(locals.len());
    let mut i = 0;
    while i < locals.len() {
        let ty = &locals[i];
        out.push(ty.clone());
        i += if ty.is_wide() { 2 } else { 1 };
    }
    while out.last() == Some(&VType::Top) {
        out.pop();
    }
    out
}

/// Subtracts unreachable blocks from every exception range.
fn split_ranges(table: &[ExceptionEntry], dead: &[(u32, u32)]) -> Vec<ExceptionEntry> {
    let mut out = Vec::with_capacity(table.len());
    for entry in table {
        let handler = u32::from(entry.handler_pc);
        if dead.iter().any(|(s, e)| (*s..*e).contains(&handler)) {
            continue;
        }
        let mut pieces = vec![(u32::from(entry.start_pc), u32::from(entry.end_pc))];
        for (ds, de) in dead {
            pieces = pieces
                .into_iter()
                .flat_map(|(s, e)| {
                    if e <= *ds || s >= *de {
                        return vec![(s, e)];
                    }
                    let mut kept = Vec::with_capacity(2);
                    if s < *ds {
                        kept.push((s, *ds));
                    }
                    if e > *de {
                        kept.push((*de, e));
                    }
                    kept
                })
                .filter(|(s, e)| s < e)
                .collect();
        }
        out.extend(pieces.into_iter().map(|(s, e)| ExceptionEntry {
            start_pc: s as u16,
            end_pc: e as u16,
            ..*entry
        }));
    }
    out
}

struct Interpreter<'a> {
    ctx: &'a FrameContext<'a>,
    pool: &'a ConstantPool,
    insns: &'a [Instruction],
    index_of: &'a HashMap<u32, usize>,
}

impl Interpreter<'_> {
    /// Applies one instruction to `input`, returning the frame after it.
    fn execute(&self, ins: &Instruction, input: &Frame) -> Result<Frame> {
        let mut f = input.clone();
        let offset = ins.offset;
        let fail = |msg: &str| Error::FrameComputation {
            offset: offset as usize,
            msg: msg.to_string(),
        };
        macro_rules! pop {
            () => {
                f.stack.pop().ok_or_else(|| fail("stack underflow"))?
            };
        }
        macro_rules! pop_n {
            ($n:expr) => {
                for _ in 0..$n {
                    pop!();
                }
            };
        }

        match &ins.insn {
            Insn::Simple(op) => {
                let op = *op;
                match op {
                    NOP => {}
                    ACONST_NULL => f.stack.push(VType::Null),
                    ICONST_M1..=ICONST_5 => f.stack.push(VType::Integer),
                    LCONST_0 | LCONST_1 => f.stack.push(VType::Long),
                    FCONST_0..=FCONST_2 => f.stack.push(VType::Float),
                    DCONST_0 | DCONST_1 => f.stack.push(VType::Double),
                    ILOAD_0..=ALOAD_3 => {
                        let index = u16::from((op - ILOAD_0) % 4);
                        let ty = self.load(&f, index, offset)?;
                        f.stack.push(ty);
                    }
                    IALOAD | BALOAD | CALOAD | SALOAD => {
                        pop_n!(2);
                        f.stack.push(VType::Integer);
                    }
                    LALOAD => {
                        pop_n!(2);
                        f.stack.push(VType::Long);
                    }
                    FALOAD => {
                        pop_n!(2);
                        f.stack.push(VType::Float);
                    }
                    DALOAD => {
                        pop_n!(2);
                        f.stack.push(VType::Double);
                    }
                    AALOAD => {
                        pop!();
                        let array = pop!();
                        f.stack.push(array_element(&array)?);
                    }
                    ISTORE_0..=ASTORE_3 => {
                        let index = u16::from((op - ISTORE_0) % 4);
                        let value = pop!();
                        store(&mut f, index, value);
                    }
                    IASTORE..=SASTORE => pop_n!(3),
                    POP => pop_n!(1),
                    POP2 => {
                        let top = pop!();
                        if !top.is_wide() {
                            pop!();
                        }
                    }
                    DUP => {
                        let v = f.stack.last().cloned().ok_or_else(|| fail("stack underflow"))?;
                        f.stack.push(v);
                    }
                    DUP_X1 => {
                        let v1 = pop!();
                        let v2 = pop!();
                        f.stack.extend([v1.clone(), v2, v1]);
                    }
                    DUP_X2 => {
                        let v1 = pop!();
                        let v2 = pop!();
                        if v2.is_wide() {
                            f.stack.extend([v1.clone(), v2, v1]);
                        } else {
                            let v3 = pop!();
                            f.stack.extend([v1.clone(), v3, v2, v1]);
                        }
                    }
                    DUP2 => {
                        let v1 = pop!();
                        if v1.is_wide() {
                            f.stack.extend([v1.clone(), v1]);
                        } else {
                            let v2 = pop!();
                            f.stack.extend([v2.clone(), v1.clone(), v2, v1]);
                        }
                    }
                    DUP2_X1 => {
                        let v1 = pop!();
                        if v1.is_wide() {
                            let v2 = pop!();
                            f.stack.extend([v1.clone(), v2, v1]);
                        } else {
                            let v2 = pop!();
                            let v3 = pop!();
                            f.stack.extend([v2.clone(), v1.clone(), v3, v2, v1]);
                        }
                    }
                    DUP2_X2 => {
                        let v1 = pop!();
                        if v1.is_wide() {
                            let v2 = pop!();
                            if v2.is_wide() {
                                f.stack.extend([v1.clone(), v2, v1]);
                            } else {
                                let v3 = pop!();
                                f.stack.extend([v1.clone(), v3, v2, v1]);
                            }
                        } else {
                            let v2 = pop!();
                            let v3 = pop!();
                            if v3.is_wide() {
                                f.stack.extend([v2.clone(), v1.clone(), v3, v2, v1]);
                            } else {
                                let v4 = pop!();
                                f.stack.extend([v2.clone(), v1.clone(), v4, v3, v2, v1]);
                            }
                        }
                    }
                    SWAP => {
                        let v1 = pop!();
                        let v2 = pop!();
                        f.stack.extend([v1, v2]);
                    }
                    IADD | ISUB | IMUL | IDIV | IREM | ISHL | ISHR | IUSHR | IAND | IOR | IXOR => {
                        pop_n!(2);
                        f.stack.push(VType::Integer);
                    }
                    LADD | LSUB | LMUL | LDIV | LREM | LSHL | LSHR | LUSHR | LAND | LOR | LXOR => {
                        pop_n!(2);
                        f.stack.push(VType::Long);
                    }
                    FADD | FSUB | FMUL | FDIV | FREM => {
                        pop_n!(2);
                        f.stack.push(VType::Float);
                    }
                    DADD | DSUB | DMUL | DDIV | DREM => {
                        pop_n!(2);
                        f.stack.push(VType::Double);
                    }
                    INEG | LNEG | FNEG | DNEG => {}
                    I2L | F2L | D2L => {
                        pop!();
                        f.stack.push(VType::Long);
                    }
                    I2F | L2F | D2F => {
                        pop!();
                        f.stack.push(VType::Float);
                    }
                    I2D | L2D | F2D => {
                        pop!();
                        f.stack.push(VType::Double);
                    }
                    L2I | F2I | D2I | I2B | I2C | I2S => {
                        pop!();
                        f.stack.push(VType::Integer);
                    }
                    LCMP | FCMPL | FCMPG | DCMPL | DCMPG => {
                        pop_n!(2);
                        f.stack.push(VType::Integer);
                    }
                    IRETURN..=ARETURN => pop_n!(1),
                    RETURN => {}
                    ARRAYLENGTH => {
                        pop!();
                        f.stack.push(VType::Integer);
                    }
                    ATHROW | MONITORENTER | MONITOREXIT => pop_n!(1),
                    _ => return Err(fail("unexpected operand-less opcode")),
                }
            }
            Insn::Push { opcode, value } => {
                if *opcode == NEWARRAY {
                    pop!();
                    let element = match *value {
                        4 => "Z",
                        5 => "C",
                        6 => "F",
                        7 => "D",
                        8 => "B",
                        9 => "S",
                        10 => "I",
                        11 => "J",
                        _ => return Err(fail("invalid newarray type")),
                    };
                    f.stack.push(VType::Object(format!("[{element}")));
                } else {
                    f.stack.push(VType::Integer);
                }
            }
            Insn::Var { opcode, index } => match *opcode {
                ILOAD..=ALOAD => {
                    let ty = self.load(&f, *index, offset)?;
                    f.stack.push(ty);
                }
                ISTORE..=ASTORE => {
                    let value = pop!();
                    store(&mut f, *index, value);
                }
                _ => return Err(fail("subroutine return must be inlined before frame computation")),
            },
            Insn::Iinc { index, .. } => store(&mut f, *index, VType::Integer),
            Insn::Jump { opcode, .. } => match *opcode {
                IFEQ..=IFLE | IFNULL | IFNONNULL => pop_n!(1),
                IF_ICMPEQ..=IF_ACMPNE => pop_n!(2),
                GOTO => {}
                _ => return Err(fail("subroutine call must be inlined before frame computation")),
            },
            Insn::TableSwitch { .. } | Insn::LookupSwitch { .. } => pop_n!(1),
            Insn::Ldc { index } => {
                let ty = match self.pool.get(*index)? {
                    Constant::Integer(_) => VType::Integer,
                    Constant::Float(_) => VType::Float,
                    Constant::String { .. } => VType::Object("java/lang/String".into()),
                    Constant::Class { .. } => VType::Object("java/lang/Class".into()),
                    Constant::MethodType { .. } => {
                        VType::Object("java/lang/invoke/MethodType".into())
                    }
                    Constant::MethodHandle { .. } => {
                        VType::Object("java/lang/invoke/MethodHandle".into())
                    }
                    Constant::Dynamic { .. } => {
                        VType::from_descriptor(self.pool.dynamic_name_and_type(*index)?.1)?
                    }
                    _ => return Err(fail("unsupported ldc constant")),
                };
                f.stack.push(ty);
            }
            Insn::Ldc2 { index } => {
                let ty = match self.pool.get(*index)? {
                    Constant::Long(_) => VType::Long,
                    Constant::Double(_) => VType::Double,
                    Constant::Dynamic { .. } => {
                        VType::from_descriptor(self.pool.dynamic_name_and_type(*index)?.1)?
                    }
                    _ => return Err(fail("unsupported ldc2_w constant")),
                };
                f.stack.push(ty);
            }
            Insn::Constant { opcode, index } => match *opcode {
                GETSTATIC => {
                    let member = self.pool.member_ref(*index)?;
                    f.stack.push(VType::from_descriptor(member.descriptor)?);
                }
                PUTSTATIC => pop_n!(1),
                GETFIELD => {
                    let member = self.pool.member_ref(*index)?;
                    pop!();
                    f.stack.push(VType::from_descriptor(member.descriptor)?);
                }
                PUTFIELD => pop_n!(2),
                INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC => {
                    let member = self.pool.member_ref(*index)?;
                    let descriptor = descriptor::parse_method(member.descriptor)?;
                    pop_n!(descriptor.parameter_types().len());
                    if *opcode != INVOKESTATIC {
                        let receiver = pop!();
                        if *opcode == INVOKESPECIAL && member.name == "<init>" {
                            let initialized = match &receiver {
                                VType::UninitializedThis => {
                                    VType::Object(self.ctx.class_name.to_string())
                                }
                                VType::Uninitialized(at) => {
                                    VType::Object(self.new_class(*at, offset)?)
                                }
                                _ => receiver.clone(),
                            };
                            replace_all(&mut f, &receiver, &initialized);
                        }
                    }
                    if let Some(ret) = descriptor::returns(&descriptor) {
                        f.stack.push(VType::from_field_type(ret));
                    }
                }
                NEW => f.stack.push(VType::Uninitialized(offset)),
                ANEWARRAY => {
                    pop!();
                    let element = self.pool.class_name(*index)?;
                    let array = if element.starts_with('[') {
                        format!("[{element}")
                    } else {
                        format!("[L{element};")
                    };
                    f.stack.push(VType::Object(array));
                }
                CHECKCAST => {
                    pop!();
                    f.stack
                        .push(VType::Object(self.pool.class_name(*index)?.to_string()));
                }
                INSTANCEOF => {
                    pop!();
                    f.stack.push(VType::Integer);
                }
                _ => return Err(fail("unexpected constant-pool opcode")),
            },
            Insn::InvokeInterface { index, .. } => {
                let member = self.pool.member_ref(*index)?;
                let descriptor = descriptor::parse_method(member.descriptor)?;
                pop_n!(descriptor.parameter_types().len() + 1);
                if let Some(ret) = descriptor::returns(&descriptor) {
                    f.stack.push(VType::from_field_type(ret));
                }
            }
            Insn::InvokeDynamic { index } => {
                let (_, descriptor) = self.pool.dynamic_name_and_type(*index)?;
                let descriptor = descriptor::parse_method(descriptor)?;
                pop_n!(descriptor.parameter_types().len());
                if let Some(ret) = descriptor::returns(&descriptor) {
                    f.stack.push(VType::from_field_type(ret));
                }
            }
            Insn::MultiANewArray { index, dims } => {
                pop_n!(*dims);
                f.stack
                    .push(VType::Object(self.pool.class_name(*index)?.to_string()));
            }
        }
        Ok(f)
    }

    fn load(&self, f: &Frame, index: u16, offset: u32) -> Result<VType> {
        f.locals
            .get(usize::from(index))
            .cloned()
            .ok_or(Error::FrameComputation {
                offset: offset as usize,
                msg: format!("load from undefined local {index}"),
            })
    }

    /// Class created by the `new` instruction at `at`.
    fn new_class(&self, at: u32, offset: u32) -> Result<String> {
        let ins = self
            .index_of
            .get(&at)
            .and_then(|&i| self.insns.get(i))
            .ok_or(Error::FrameComputation {
                offset: offset as usize,
                msg: format!("no `new` at offset {at}"),
            })?;
        match ins.insn {
            Insn::Constant { opcode: NEW, index } => Ok(self.pool.class_name(index)?.to_string()),
            _ => Err(Error::FrameComputation {
                offset: offset as usize,
                msg: format!("no `new` at offset {at}"),
            }),
        }
    }
}

fn store(f: &mut Frame, index: u16, value: VType) {
    let index = usize::from(index);
    let wide = value.is_wide();
    let needed = index + if wide { 2 } else { 1 };
    if f.locals.len() < needed {
        f.locals.resize(needed, VType::Top);
    }
    // Overwriting the upper half of a wide value invalidates it.
    if index > 0 && f.locals[index - 1].is_wide() {
        f.locals[index - 1] = VType::Top;
    }
    f.locals[index] = value;
    if wide {
        f.locals[index + 1] = VType::Top;
    }
}

fn replace_all(f: &mut Frame, from: &VType, to: &VType) {
    for slot in f.locals.iter_mut().chain(f.stack.iter_mut()) {
        if slot == from {
            *slot = to.clone();
        }
    }
}

fn array_element(array: &VType) -> Result<VType> {
    match array {
        VType::Null => Ok(VType::Null),
        VType::Object(desc) if desc.starts_with('[') => VType::from_descriptor(&desc[1..]),
        other if other.is_reference() => Ok(VType::Object(OBJECT.into())),
        _ => Err(Error::FrameComputation {
            offset: 0,
            msg: "aaload on a non-reference".into(),
        }),
    }
}

/// Writes frames in their most compact `StackMapTable` form.
struct StackMapEncoder {
    previous_locals: Vec<VType>,
    previous_offset: Option<u32>,
    count: u16,
    out: Writer,
}

impl StackMapEncoder {
    fn new(initial_locals: Vec<VType>) -> Self {
        Self {
            previous_locals: initial_locals,
            previous_offset: None,
            count: 0,
            out: Writer::new(),
        }
    }

    fn push(&mut self, offset: u32, frame: &Frame, pool: &mut ConstantPool) -> Result<()> {
        let delta = match self.previous_offset {
            None => offset,
            Some(prev) => offset - prev - 1,
        } as u16;
        let locals = compact(&frame.locals);
        let prev = &self.previous_locals;
        let w = &mut self.out;

        if frame.stack.is_empty() && locals == *prev {
            if delta < 64 {
                w.u1(delta as u8);
            } else {
                w.u1(251);
                w.u2(delta);
            }
        } else if frame.stack.len() == 1 && locals == *prev {
            if delta < 64 {
                w.u1(64 + delta as u8);
            } else {
                w.u1(247);
                w.u2(delta);
            }
            write_vtype(w, &frame.stack[0], pool)?;
        } else if frame.stack.is_empty()
            && locals.len() > prev.len()
            && locals.len() - prev.len() <= 3
            && locals.starts_with(prev)
        {
            let extra = &locals[prev.len()..];
            w.u1(251 + extra.len() as u8);
            w.u2(delta);
            for ty in extra {
                write_vtype(w, ty, pool)?;
            }
        } else if frame.stack.is_empty()
            && locals.len() < prev.len()
            && prev.len() - locals.len() <= 3
            && prev.starts_with(&locals)
        {
            w.u1(251 - (prev.len() - locals.len()) as u8);
            w.u2(delta);
        } else {
            w.u1(255);
            w.u2(delta);
            w.u2(locals.len() as u16);
            for ty in &locals {
                write_vtype(w, ty, pool)?;
            }
            w.u2(frame.stack.len() as u16);
            for ty in &frame.stack {
                write_vtype(w, ty, pool)?;
            }
        }

        self.previous_locals = locals;
        self.previous_offset = Some(offset);
        self.count += 1;
        Ok(())
    }

    fn finish(self) -> Option<Vec<u8>> {
        if self.count == 0 {
            return None;
        }
        let mut w = Writer::with_capacity(self.out.len() + 2);
        w.u2(self.count);
        w.bytes(&self.out.into_bytes());
        Some(w.into_bytes())
    }
}

fn write_vtype(w: &mut Writer, ty: &VType, pool: &mut ConstantPool) -> Result<()> {
    match ty {
        VType::Top => w.u1(0),
        VType::Integer => w.u1(1),
        VType::Float => w.u1(2),
        VType::Double => w.u1(3),
        VType::Long => w.u1(4),
        VType::Null => w.u1(5),
        VType::UninitializedThis => w.u1(6),
        VType::Object(name) => {
            w.u1(7);
            w.u2(pool.add_class(name)?);
        }
        VType::Uninitialized(offset) => {
            w.u1(8);
            w.u2(*offset as u16);
        }
    }
    Ok(())
}
