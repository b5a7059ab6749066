//! Collection: hierarchy edges, method classification and id assignment.
//!
//! Collection runs as two passes over the same inputs. [`HierarchyCollector`] records every
//! `class -> super` edge first, so that [`MethodCollector`] sees the complete hierarchy when
//! it counts UI entry points that will receive a synthesized focus callback.

use crate::context::{PipelineContext, Stats};
use crate::io;
use crate::method::{IgnoreReason, IgnoredMethod, MethodKey};
use crate::pass::{ClassPass, Outcome};
use crate::{FOCUS_DESC, FOCUS_METHOD, Result};
use mtrace_core::class_file::ClassFile;
use mtrace_core::code::{CodeAttribute, MethodBody};
use mtrace_core::instruction::Insn;
use mtrace_core::opcodes::{
    GETFIELD, GETSTATIC, INVOKESPECIAL, PUTFIELD, PUTSTATIC, SALOAD, is_invoke, is_return,
};
use std::fmt::Write as _;
use std::path::Path;

/// Why a method body is too small to be worth tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Triviality {
    /// No instructions at all, including methods without code.
    Empty,
    /// Only loads, field accesses and returns.
    Accessor,
    /// Calls nothing.
    Leaf,
}

/// Classifies a method body by its instructions.
///
/// # Arguments
/// * `method_name` - Used to tolerate the super-constructor call of `<init>` accessors.
/// * `body` - The decoded body, `None` for methods without code.
pub fn triviality(method_name: &str, body: Option<&MethodBody>) -> Option<Triviality> {
    let Some(body) = body else {
        return Some(Triviality::Empty);
    };
    if body.insns().next().is_none() {
        return Some(Triviality::Empty);
    }
    if is_accessor(method_name == "<init>", body.insns()) {
        return Some(Triviality::Accessor);
    }
    if !body.insns().any(|insn| is_invoke(insn.opcode())) {
        return Some(Triviality::Leaf);
    }
    None
}

fn is_accessor<'a, T: 'a>(is_constructor: bool, insns: impl Iterator<Item = &'a Insn<T>>) -> bool {
    let mut super_calls = 0;
    for insn in insns {
        let opcode = insn.opcode();
        let allowed = opcode <= SALOAD
            || is_return(opcode)
            || matches!(opcode, GETFIELD | GETSTATIC | PUTFIELD | PUTSTATIC);
        if allowed {
            continue;
        }
        if is_constructor && opcode == INVOKESPECIAL {
            super_calls += 1;
            if super_calls > 1 {
                return false;
            }
            continue;
        }
        return false;
    }
    true
}

/// Decodes a method's code without normalizing subroutines; classification only reads
/// opcodes.
fn decode_body(class: &ClassFile, method_index: usize) -> Result<Option<MethodBody>> {
    let method = &class.methods[method_index];
    let Some(index) = method.find_attribute(&class.constant_pool, "Code") else {
        return Ok(None);
    };
    let attr = CodeAttribute::parse(&method.attributes[index].info)?;
    Ok(Some(MethodBody::decode(&attr, &class.constant_pool)?))
}

/// Records the superclass edge of every class.
pub struct HierarchyCollector<'a> {
    ctx: &'a PipelineContext,
}

impl<'a> HierarchyCollector<'a> {
    pub fn new(ctx: &'a PipelineContext) -> Self {
        Self { ctx }
    }
}

impl ClassPass for HierarchyCollector<'_> {
    fn name(&self) -> &'static str {
        "hierarchy"
    }

    fn apply(&self, _entry: &str, bytes: &[u8]) -> Result<Outcome> {
        let class = ClassFile::parse(bytes)?;
        if let Some(super_name) = class.super_name()? {
            self.ctx.record_edge(class.name()?, super_name);
        }
        Ok(Outcome::Unchanged)
    }
}

/// Splits the methods of every concrete class into traced and ignored.
pub struct MethodCollector<'a> {
    ctx: &'a PipelineContext,
}

impl<'a> MethodCollector<'a> {
    pub fn new(ctx: &'a PipelineContext) -> Self {
        Self { ctx }
    }

    /// Classifies every method of `class`.
    pub fn collect_class(&self, class: &ClassFile) -> Result<()> {
        let ctx = self.ctx;
        let class_name = class.name()?;
        Stats::bump(&ctx.stats.classes_scanned);
        if let Some(super_name) = class.super_name()? {
            ctx.record_edge(class_name, super_name);
        }
        if class.is_abstract_or_interface() {
            return Ok(());
        }

        let pool = &class.constant_pool;
        let resolver = ctx.resolver.as_ref();
        let block_set = &ctx.config.block_set;
        let blocked = ctx.is_blocked(class_name);
        let mut has_focus = false;

        for (index, method) in class.methods.iter().enumerate() {
            let name = method.name(pool)?;
            let descriptor = method.descriptor(pool)?;
            if name == FOCUS_METHOD && descriptor == FOCUS_DESC {
                has_focus = true;
            }
            let key = MethodKey::new(class_name, name, descriptor);
            let access = method.access_flags;

            let original = key.revert(resolver);
            if block_set.blocks_method(
                &original.class_name,
                &original.method_name,
                &original.descriptor,
            ) || blocked
            {
                ctx.ignore(key, access, IgnoreReason::Blocked);
                continue;
            }

            let body = decode_body(class, index)?;
            if let Some(kind) = triviality(name, body.as_ref()) {
                tracing::trace!("{} is trivial ({:?})", key, kind);
                ctx.ignore(key, access, IgnoreReason::Trivial);
                continue;
            }

            if let Some(id) = ctx.claim(key, access) {
                tracing::trace!("{}.{}{} -> {}", class_name, name, descriptor, id);
            }
        }

        if !has_focus && !blocked && ctx.is_ui_entry(class_name) {
            Stats::bump(&ctx.stats.focus_candidates);
        }
        Ok(())
    }
}

impl ClassPass for MethodCollector<'_> {
    fn name(&self) -> &'static str {
        "collect"
    }

    fn apply(&self, _entry: &str, bytes: &[u8]) -> Result<Outcome> {
        let class = ClassFile::parse(bytes)?;
        self.collect_class(&class)?;
        Ok(Outcome::Unchanged)
    }
}

/// Writes the traced-method map, sorted by id, including the dispatch entry.
///
/// # Returns
/// The number of lines written.
pub fn write_method_map(ctx: &PipelineContext, path: &Path) -> Result<usize> {
    ctx.insert_dispatch_entry();
    let mut methods = ctx.traced_methods();
    methods.sort_by_key(|m| m.id);

    let resolver = ctx.resolver.as_ref();
    let mut text = String::new();
    for method in &methods {
        let _ = writeln!(text, "{}", method.to_mapping_line(resolver));
    }
    io::write_file(path, text.as_bytes())?;
    tracing::info!("wrote {} traced methods to {}", methods.len(), path.display());
    Ok(methods.len())
}

/// Writes the ignored-method report: trivial methods, then blocked ones.
pub fn write_ignored_report(ctx: &PipelineContext, path: &Path) -> Result<usize> {
    let resolver = ctx.resolver.as_ref();
    let section = |reason: IgnoreReason| -> Vec<String> {
        let mut methods: Vec<IgnoredMethod> = ctx
            .ignored_methods()
            .into_iter()
            .filter(|m| m.reason == reason)
            .collect();
        methods.sort_by_cached_key(|m| m.key.revert(resolver));
        methods.iter().map(|m| m.to_report_line(resolver)).collect()
    };
    let trivial = section(IgnoreReason::Trivial);
    let blocked = section(IgnoreReason::Blocked);

    let mut text = String::from("ignore methods:\n");
    for line in &trivial {
        let _ = writeln!(text, "{line}");
    }
    text.push_str("\nblack methods:\n");
    for line in &blocked {
        let _ = writeln!(text, "{line}");
    }
    text.push('\n');
    io::write_file(path, text.as_bytes())?;
    tracing::info!(
        "wrote {} ignored methods to {}",
        trivial.len() + blocked.len(),
        path.display()
    );
    Ok(trivial.len() + blocked.len())
}
