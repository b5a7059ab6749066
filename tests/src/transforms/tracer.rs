use mtrace_core::builder::ClassBuilder;
use mtrace_core::class_file::{ACC_ABSTRACT, ACC_PUBLIC, ACC_STATIC, ClassFile};
use mtrace_core::hierarchy::{BootstrapTypes, OBJECT, SuperclassResolver, common_super_class};
use mtrace_core::instruction::Insn;
use mtrace_core::opcodes::*;
use mtrace_tests::{
    ACTIVITY, activity_class, body_of, calls, foo_class, init_tracing, opcodes, pushed_int,
};
use mtrace_transform::collector::MethodCollector;
use mtrace_transform::config::ConfigurationBuilder;
use mtrace_transform::context::PipelineContext;
use mtrace_transform::mapping::Identity;
use mtrace_transform::method::MethodKey;
use mtrace_transform::pass::{ClassPass, Outcome};
use mtrace_transform::tracer::{MethodTracer, check_class};
use std::sync::Arc;
use std::sync::atomic::Ordering;

const ENTER: &str = "com/mtrace/core/MethodBeat.i";
const EXIT: &str = "com/mtrace/core/MethodBeat.o";
const FOCUS: &str = "com/mtrace/core/MethodBeat.at";

fn context() -> PipelineContext {
    let config = ConfigurationBuilder::default().build(&Identity);
    PipelineContext::new(config, Arc::new(Identity))
}

fn frames() -> SuperclassResolver {
    SuperclassResolver::new().with_strategy(
        "bootstrap",
        Box::new(|a: &str, b: &str| common_super_class(&BootstrapTypes, a, b)),
    )
}

/// Collects then traces `bytes`, returning the rewritten class.
fn trace(ctx: &PipelineContext, bytes: &[u8]) -> Option<ClassFile> {
    let class = ClassFile::parse(bytes).unwrap();
    MethodCollector::new(ctx).collect_class(&class).unwrap();
    let frames = frames();
    let tracer = MethodTracer::new(ctx, &frames);
    match tracer.apply("test.class", bytes).unwrap() {
        Outcome::Unchanged => None,
        Outcome::Rewritten(out) => {
            check_class(&out).unwrap();
            Some(ClassFile::parse(&out).unwrap())
        }
    }
}

#[test]
fn test_probes_wrap_traced_methods() {
    init_tracing();
    let ctx = context();
    let class = trace(&ctx, &foo_class()).unwrap();
    let id = ctx.trace_id(&MethodKey::new("Foo", "baz", "()V")).unwrap();

    let baz = body_of(&class, "baz", "()V");
    assert_eq!(calls(&class, &baz), [ENTER, "Bar.qux", EXIT]);
    let insns: Vec<_> = baz.insns().collect();
    assert_eq!(pushed_int(&class, insns[0]), Some(id as i32));
    assert_eq!(pushed_int(&class, insns[3]), Some(id as i32));
    assert_eq!(insns.last().unwrap().opcode(), RETURN);

    // the trivial getter is left alone
    assert_eq!(opcodes(&body_of(&class, "bar", "()I")), [ALOAD_0, GETFIELD, IRETURN]);
    assert_eq!(ctx.stats.probes_inserted.load(Ordering::Relaxed), 2);
    assert_eq!(ctx.stats.classes_rewritten.load(Ordering::Relaxed), 1);
}

#[test]
fn test_every_exit_path_is_probed() {
    let mut b = ClassBuilder::new("app/Paths", OBJECT).unwrap();
    b.method(ACC_PUBLIC | ACC_STATIC, "check", "(I)I", |c| {
        let fail = c.new_label();
        let negative = c.new_label();
        c.maxs(2, 1);
        c.invoke(INVOKESTATIC, "app/Log", "d", "()V")?;
        c.op(ILOAD_0).jump(IFLT, negative);
        c.op(ILOAD_0).jump(IFEQ, fail);
        c.op(ICONST_1).op(IRETURN);
        c.place(negative).op(ICONST_M1).op(IRETURN);
        c.place(fail);
        c.type_insn(NEW, "java/lang/IllegalStateException")?;
        c.op(DUP);
        c.invoke(INVOKESPECIAL, "java/lang/IllegalStateException", "<init>", "()V")?;
        c.op(ATHROW);
        Ok(())
    })
    .unwrap();
    let ctx = context();
    let class = trace(&ctx, &b.to_bytes().unwrap()).unwrap();
    let body = body_of(&class, "check", "(I)I");
    let exits = calls(&class, &body).iter().filter(|c| *c == EXIT).count();
    assert_eq!(exits, 3);

    // each exit probe sits right before its return or athrow
    let insns: Vec<&Insn<_>> = body.insns().collect();
    for (i, insn) in insns.iter().enumerate() {
        let op = insn.opcode();
        if is_return(op) || op == ATHROW {
            assert_eq!(insns[i - 1].opcode(), INVOKESTATIC);
        }
    }
}

#[test]
fn test_large_ids_use_a_constant() {
    let ctx = context();
    ctx.raise_counter(100_000);
    let class = trace(&ctx, &foo_class()).unwrap();
    let baz = body_of(&class, "baz", "()V");
    let first = baz.insns().next().unwrap();
    assert!(matches!(first, Insn::Ldc { .. }));
    assert_eq!(pushed_int(&class, first), Some(100_001));
}

#[test]
fn test_missing_focus_callback_is_synthesized() {
    let ctx = context();
    let main = activity_class("app/Main", false);
    ctx.record_edge("app/Main", ACTIVITY);
    let class = trace(&ctx, &main).unwrap();

    let focus = body_of(&class, "onWindowFocusChanged", "(Z)V");
    assert_eq!(
        opcodes(&focus),
        [ALOAD_0, ILOAD_1, INVOKESPECIAL, ALOAD_0, ILOAD_1, INVOKESTATIC, RETURN]
    );
    assert_eq!(
        calls(&class, &focus),
        [format!("{ACTIVITY}.onWindowFocusChanged").as_str(), FOCUS]
    );
    let created = body_of(&class, "onCreate", "(Landroid/os/Bundle;)V");
    assert_eq!(calls(&class, &created)[0], ENTER);
    assert_eq!(ctx.stats.focus_synthesized.load(Ordering::Relaxed), 1);
}

#[test]
fn test_existing_focus_callback_forwards_to_hook() {
    let ctx = context();
    let class = trace(&ctx, &activity_class("app/Focused", true)).unwrap();
    let focus = body_of(&class, "onWindowFocusChanged", "(Z)V");
    assert_eq!(
        calls(&class, &focus),
        [
            ENTER,
            FOCUS,
            format!("{ACTIVITY}.onWindowFocusChanged").as_str(),
            EXIT
        ]
    );
    assert_eq!(
        class
            .methods
            .iter()
            .filter(|m| m.name(&class.constant_pool).unwrap() == "onWindowFocusChanged")
            .count(),
        1
    );
    assert_eq!(ctx.stats.focus_synthesized.load(Ordering::Relaxed), 0);
}

#[test]
fn test_old_class_versions_get_extra_stack() {
    let mut b = ClassBuilder::new("app/Old", OBJECT).unwrap();
    b.version(49);
    b.method(ACC_PUBLIC | ACC_STATIC, "run", "()V", |c| {
        c.maxs(0, 0);
        c.invoke(INVOKESTATIC, "Bar", "qux", "()V")?;
        c.op(RETURN);
        Ok(())
    })
    .unwrap();
    let ctx = context();
    let class = trace(&ctx, &b.to_bytes().unwrap()).unwrap();
    let method = &class.methods[0];
    let index = method.find_attribute(&class.constant_pool, "Code").unwrap();
    let code = mtrace_core::code::CodeAttribute::parse(&method.attributes[index].info).unwrap();
    assert_eq!(code.max_stack, 1);
    assert!(code.attributes.is_empty());
}

#[test]
fn test_abstract_classes_pass_through() {
    let mut b = ClassBuilder::new("app/Base", OBJECT).unwrap();
    b.access(ACC_PUBLIC | ACC_ABSTRACT);
    b.method(ACC_PUBLIC, "run", "()V", |c| {
        c.maxs(0, 1);
        c.invoke(INVOKESTATIC, "Bar", "qux", "()V")?;
        c.op(RETURN);
        Ok(())
    })
    .unwrap();
    let ctx = context();
    assert!(trace(&ctx, &b.to_bytes().unwrap()).is_none());
}

#[test]
fn test_subroutines_are_inlined_before_probing() {
    let mut b = ClassBuilder::new("app/Legacy", OBJECT).unwrap();
    b.version(49);
    b.method(ACC_PUBLIC | ACC_STATIC, "run", "()V", |c| {
        let finally = c.new_label();
        c.maxs(1, 1);
        c.invoke(INVOKESTATIC, "Bar", "qux", "()V")?;
        c.jump(JSR, finally).op(RETURN);
        c.place(finally).var(ASTORE, 0);
        c.invoke(INVOKESTATIC, "Bar", "qux", "()V")?;
        c.var(RET, 0);
        Ok(())
    })
    .unwrap();
    let ctx = context();
    let class = trace(&ctx, &b.to_bytes().unwrap()).unwrap();
    let body = body_of(&class, "run", "()V");
    assert!(!body.has_subroutines());
    // the inlined copy of the subroutine is laid out after the main path
    assert_eq!(calls(&class, &body), [ENTER, "Bar.qux", EXIT, "Bar.qux"]);
}
