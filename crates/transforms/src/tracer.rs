//! Probe injection.
//!
//! Every method with an id gets a call to the enter hook before its first instruction and a
//! call to the exit hook before each return and `athrow`. UI entry points without a focus
//! callback get one that forwards to the superclass and reports to the focus hook.

use crate::config::HookConfig;
use crate::context::{PipelineContext, Stats};
use crate::method::MethodKey;
use crate::pass::{ClassPass, Outcome};
use crate::{Error, FOCUS_DESC, FOCUS_METHOD, Result};
use mtrace_core::builder::add_method;
use mtrace_core::class_file::{ACC_PUBLIC, ClassFile, V1_6};
use mtrace_core::code::{CodeAttribute, MethodBody, Node};
use mtrace_core::constant_pool::ConstantPool;
use mtrace_core::frames::CommonSuperclass;
use mtrace_core::hierarchy::OBJECT;
use mtrace_core::instruction::{Insn, push_int};
use mtrace_core::opcodes::{ALOAD_0, ATHROW, ILOAD_1, INVOKESPECIAL, INVOKESTATIC, RETURN, is_return};
use mtrace_core::{read_method_body, write_method_body};

/// Rewrites classes using the ids collected earlier.
pub struct MethodTracer<'a> {
    ctx: &'a PipelineContext,
    frames: &'a dyn CommonSuperclass,
}

impl<'a> MethodTracer<'a> {
    pub fn new(ctx: &'a PipelineContext, frames: &'a dyn CommonSuperclass) -> Self {
        Self { ctx, frames }
    }

    /// Instruments `class` in place.
    ///
    /// # Returns
    /// `true` if any probe or method was added.
    pub fn trace_class(&self, class: &mut ClassFile) -> Result<bool> {
        if class.is_abstract_or_interface() {
            return Ok(false);
        }
        let ctx = self.ctx;
        let hooks = ctx.config.hooks();
        let class_name = class.name()?.to_string();
        let ui_entry = ctx.is_ui_entry(&class_name);
        let traceable = !ctx.is_blocked(&class_name);
        let has_focus = class.find_method(FOCUS_METHOD, FOCUS_DESC).is_some();
        let mut changed = false;

        for index in 0..class.methods.len() {
            let method = &class.methods[index];
            let name = method.name(&class.constant_pool)?;
            let descriptor = method.descriptor(&class.constant_pool)?;
            let Some(id) = ctx.trace_id(&MethodKey::new(&class_name, name, descriptor)) else {
                continue;
            };
            let forward_focus =
                ui_entry && traceable && name == FOCUS_METHOD && descriptor == FOCUS_DESC;
            let Some((code_index, mut body)) = read_method_body(class, method)? else {
                continue;
            };

            let probes =
                insert_probes(&mut body, &mut class.constant_pool, hooks, id, forward_focus)?;
            if class.major_version < V1_6 {
                let needed = if forward_focus { 2 } else { 1 };
                body.max_stack = body.max_stack.saturating_add(1).max(needed);
            }
            write_method_body(class, index, code_index, &body, self.frames)?;
            ctx.stats
                .probes_inserted
                .fetch_add(probes, std::sync::atomic::Ordering::Relaxed);
            changed = true;
        }

        if ui_entry && traceable && !has_focus {
            let super_name = class.super_name()?.unwrap_or(OBJECT).to_string();
            let body = focus_method_body(&mut class.constant_pool, &super_name, hooks)?;
            add_method(
                class,
                ACC_PUBLIC,
                FOCUS_METHOD,
                FOCUS_DESC,
                Some(&body),
                self.frames,
            )?;
            Stats::bump(&ctx.stats.focus_synthesized);
            tracing::debug!("synthesized {}.{}{}", class_name, FOCUS_METHOD, FOCUS_DESC);
            changed = true;
        }
        Ok(changed)
    }
}

impl ClassPass for MethodTracer<'_> {
    fn name(&self) -> &'static str {
        "trace"
    }

    fn apply(&self, entry: &str, bytes: &[u8]) -> Result<Outcome> {
        let mut class = ClassFile::parse(bytes)?;
        if !self.trace_class(&mut class)? {
            return Ok(Outcome::Unchanged);
        }
        let rewritten = class.to_bytes()?;
        if self.ctx.config.settings.check_output {
            if let Err(e) = check_class(&rewritten) {
                Stats::bump(&self.ctx.stats.check_failures);
                return Err(Error::OutputCheck {
                    class: entry.to_string(),
                    reason: e.to_string(),
                });
            }
        }
        Stats::bump(&self.ctx.stats.classes_rewritten);
        Ok(Outcome::Rewritten(rewritten))
    }
}

/// Parses `bytes` back, including every method body.
pub fn check_class(bytes: &[u8]) -> mtrace_core::result::Result<()> {
    let class = ClassFile::parse(bytes)?;
    for method in &class.methods {
        if let Some(index) = method.find_attribute(&class.constant_pool, "Code") {
            let attr = CodeAttribute::parse(&method.attributes[index].info)?;
            MethodBody::decode(&attr, &class.constant_pool)?;
        }
    }
    Ok(())
}

fn push_id(pool: &mut ConstantPool, id: u32) -> Result<Insn<mtrace_core::code::Label>> {
    let value = id as i32;
    Ok(match push_int(value) {
        Some(insn) => insn,
        None => Insn::Ldc {
            index: pool.add_integer(value)?,
        },
    })
}

/// Adds the enter probe, the optional focus report, and an exit probe before every return and
/// `athrow`.
///
/// # Returns
/// The number of probes inserted.
pub fn insert_probes(
    body: &mut MethodBody,
    pool: &mut ConstantPool,
    hooks: &HookConfig,
    id: u32,
    forward_focus: bool,
) -> Result<usize> {
    let id_insn = push_id(pool, id)?;
    let enter = Insn::Constant {
        opcode: INVOKESTATIC,
        index: pool.add_method_ref(&hooks.class_name, &hooks.enter, HookConfig::ENTER_DESC)?,
    };
    let exit = Insn::Constant {
        opcode: INVOKESTATIC,
        index: pool.add_method_ref(&hooks.class_name, &hooks.exit, HookConfig::EXIT_DESC)?,
    };

    let mut nodes = Vec::with_capacity(body.nodes.len() + 8);
    nodes.push(Node::Insn(id_insn.clone()));
    nodes.push(Node::Insn(enter));
    if forward_focus {
        let focus = pool.add_method_ref(&hooks.class_name, &hooks.focus, HookConfig::FOCUS_DESC)?;
        nodes.push(Node::Insn(Insn::Simple(ALOAD_0)));
        nodes.push(Node::Insn(Insn::Simple(ILOAD_1)));
        nodes.push(Node::Insn(Insn::Constant {
            opcode: INVOKESTATIC,
            index: focus,
        }));
    }

    let mut probes = 1;
    for node in body.nodes.drain(..) {
        if let Node::Insn(insn) = &node {
            let opcode = insn.opcode();
            if is_return(opcode) || opcode == ATHROW {
                nodes.push(Node::Insn(id_insn.clone()));
                nodes.push(Node::Insn(exit.clone()));
                probes += 1;
            }
        }
        nodes.push(node);
    }
    body.nodes = nodes;
    Ok(probes)
}

/// Body of a synthesized `onWindowFocusChanged(Z)V`.
pub fn focus_method_body(
    pool: &mut ConstantPool,
    super_name: &str,
    hooks: &HookConfig,
) -> Result<MethodBody> {
    let mut body = MethodBody::new(2, 2);
    body.push(Insn::Simple(ALOAD_0));
    body.push(Insn::Simple(ILOAD_1));
    body.push(Insn::Constant {
        opcode: INVOKESPECIAL,
        index: pool.add_method_ref(super_name, FOCUS_METHOD, FOCUS_DESC)?,
    });
    body.push(Insn::Simple(ALOAD_0));
    body.push(Insn::Simple(ILOAD_1));
    body.push(Insn::Constant {
        opcode: INVOKESTATIC,
        index: pool.add_method_ref(&hooks.class_name, &hooks.focus, HookConfig::FOCUS_DESC)?,
    });
    body.push(Insn::Simple(RETURN));
    Ok(body)
}
