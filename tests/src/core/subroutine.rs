use mtrace_core::builder::ClassBuilder;
use mtrace_core::class_file::{ACC_PUBLIC, ACC_STATIC, ClassFile};
use mtrace_core::hierarchy::{BootstrapTypes, OBJECT, SuperclassResolver, common_super_class};
use mtrace_core::instruction::Insn;
use mtrace_core::opcodes::*;
use mtrace_core::{read_method_body, write_method_body};
use mtrace_tests::{body_of, init_tracing, opcodes};

/// A version 49 class whose `run()V` calls a `finally` subroutine from two places.
fn legacy_finally() -> ClassFile {
    let mut b = ClassBuilder::new("app/Legacy", OBJECT).unwrap();
    b.version(49);
    b.method(ACC_PUBLIC | ACC_STATIC, "run", "(Z)V", |c| {
        let finally = c.new_label();
        let other = c.new_label();
        c.maxs(1, 2).op(ILOAD_0).jump(IFEQ, other);
        c.invoke(INVOKESTATIC, "app/Legacy", "work", "()V")?;
        c.jump(JSR, finally).op(RETURN);
        c.place(other).jump(JSR, finally).op(RETURN);
        c.place(finally).var(ASTORE, 1);
        c.invoke(INVOKESTATIC, "app/Legacy", "cleanup", "()V")?;
        c.var(RET, 1);
        Ok(())
    })
    .unwrap();
    b.build()
}

fn bootstrap() -> SuperclassResolver {
    SuperclassResolver::new().with_strategy(
        "bootstrap",
        Box::new(|a: &str, b: &str| common_super_class(&BootstrapTypes, a, b)),
    )
}

#[test]
fn test_read_method_body_inlines_subroutines() {
    init_tracing();
    let class = legacy_finally();
    assert!(body_of(&class, "run", "(Z)V").has_subroutines());

    let (_, body) = read_method_body(&class, &class.methods[0]).unwrap().unwrap();
    assert!(!body.has_subroutines());
    let ops = opcodes(&body);
    assert!(!ops.contains(&JSR) && !ops.contains(&RET));
    let cleanups = body
        .insns()
        .filter(|i| matches!(i, Insn::Constant { opcode: INVOKESTATIC, .. }))
        .count();
    // work() plus one cleanup() per call site
    assert_eq!(cleanups, 3);
}

#[test]
fn test_inlined_body_writes_back_as_valid_code() {
    let mut class = legacy_finally();
    let (code_index, body) = read_method_body(&class, &class.methods[0]).unwrap().unwrap();
    write_method_body(&mut class, 0, code_index, &body, &bootstrap()).unwrap();

    let reparsed = ClassFile::parse(&class.to_bytes().unwrap()).unwrap();
    let written = body_of(&reparsed, "run", "(Z)V");
    assert!(!written.has_subroutines());
    assert_eq!(opcodes(&written), opcodes(&body));
}

#[test]
fn test_methods_without_code_have_no_body() {
    let mut b = ClassBuilder::new("app/Native", OBJECT).unwrap();
    b.bodiless_method(ACC_PUBLIC | mtrace_core::class_file::ACC_NATIVE, "call", "()V")
        .unwrap();
    let class = b.build();
    assert!(read_method_body(&class, &class.methods[0]).unwrap().is_none());
}
