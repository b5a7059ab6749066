use mtrace_core::builder::ClassBuilder;
use mtrace_core::class_file::{ACC_ABSTRACT, ACC_NATIVE, ACC_PUBLIC, ACC_STATIC, ClassFile};
use mtrace_core::hierarchy::OBJECT;
use mtrace_core::opcodes::*;
use mtrace_tests::{ACTIVITY, activity_class, bar_class, constructor, foo_class, init_tracing};
use mtrace_transform::collector::MethodCollector;
use mtrace_transform::config::ConfigurationBuilder;
use mtrace_transform::context::PipelineContext;
use mtrace_transform::mapping::{Identity, MappingCollector, MappingReader, NameResolver};
use mtrace_transform::method::{IgnoreReason, MethodKey};
use rayon::prelude::*;
use std::sync::Arc;
use std::sync::atomic::Ordering;

fn context_with(block_list: &str, resolver: Arc<dyn NameResolver>) -> PipelineContext {
    let mut config = ConfigurationBuilder::default().build(resolver.as_ref());
    config.block_set.add_directives(block_list, resolver.as_ref());
    PipelineContext::new(config, resolver)
}

fn context() -> PipelineContext {
    context_with("", Arc::new(Identity))
}

fn collect(ctx: &PipelineContext, classes: &[Vec<u8>]) {
    let collector = MethodCollector::new(ctx);
    for bytes in classes {
        collector
            .collect_class(&ClassFile::parse(bytes).unwrap())
            .unwrap();
    }
}

fn reason(ctx: &PipelineContext, key: &MethodKey) -> Option<IgnoreReason> {
    ctx.ignore_reason(key)
}

/// One class exercising every triviality category plus a traced method.
fn shapes() -> Vec<u8> {
    let mut b = ClassBuilder::new("app/Shapes", OBJECT).unwrap();
    constructor(&mut b, OBJECT);
    b.field(0, "x", "I").unwrap();
    b.bodiless_method(ACC_PUBLIC | ACC_NATIVE, "nativeCall", "()V")
        .unwrap();
    b.method(ACC_PUBLIC, "setX", "(I)V", |c| {
        c.maxs(2, 2).op(ALOAD_0).op(ILOAD_1);
        c.field(PUTFIELD, "app/Shapes", "x", "I")?;
        c.op(RETURN);
        Ok(())
    })
    .unwrap();
    b.method(ACC_PUBLIC | ACC_STATIC, "sum", "(II)I", |c| {
        c.maxs(2, 2).op(ILOAD_0).op(ILOAD_1).op(IADD).op(IRETURN);
        Ok(())
    })
    .unwrap();
    b.method(ACC_PUBLIC, "log", "()V", |c| {
        c.maxs(1, 1).string("hello")?;
        c.invoke(INVOKESTATIC, "app/Log", "d", "(Ljava/lang/String;)V")?;
        c.op(RETURN);
        Ok(())
    })
    .unwrap();
    b.to_bytes().unwrap()
}

#[test]
fn test_triviality_classification() {
    init_tracing();
    let ctx = context();
    collect(&ctx, &[shapes()]);

    for (name, descriptor) in [
        ("<init>", "()V"),
        ("nativeCall", "()V"),
        ("setX", "(I)V"),
        ("sum", "(II)I"),
    ] {
        let key = MethodKey::new("app/Shapes", name, descriptor);
        assert_eq!(reason(&ctx, &key), Some(IgnoreReason::Trivial), "{key}");
    }
    let log = MethodKey::new("app/Shapes", "log", "()V");
    assert_eq!(ctx.trace_id(&log), Some(1));
    assert_eq!(ctx.stats.classes_scanned.load(Ordering::Relaxed), 1);
    assert_eq!(ctx.stats.methods_ignored.load(Ordering::Relaxed), 4);
}

#[test]
fn test_class_block_overrides_triviality() {
    let ctx = context_with("-keepclass Foo\n", Arc::new(Identity));
    collect(&ctx, &[foo_class(), bar_class()]);

    for (name, descriptor) in [("bar", "()I"), ("baz", "()V")] {
        let key = MethodKey::new("Foo", name, descriptor);
        assert_eq!(reason(&ctx, &key), Some(IgnoreReason::Blocked));
        assert_eq!(ctx.trace_id(&key), None);
    }
    assert!(ctx.trace_id(&MethodKey::new("Bar", "qux", "()V")).is_some());
}

#[test]
fn test_method_rules_block_single_methods() {
    let ctx = context_with("-keepmethod Foo baz ()V\n", Arc::new(Identity));
    collect(&ctx, &[foo_class()]);
    assert_eq!(
        reason(&ctx, &MethodKey::new("Foo", "baz", "()V")),
        Some(IgnoreReason::Blocked)
    );
    assert_eq!(
        reason(&ctx, &MethodKey::new("Foo", "bar", "()I")),
        Some(IgnoreReason::Trivial)
    );
}

#[test]
fn test_abstract_classes_only_contribute_edges() {
    let mut b = ClassBuilder::new("app/Base", "app/Root").unwrap();
    b.access(ACC_PUBLIC | ACC_ABSTRACT);
    b.bodiless_method(ACC_PUBLIC | ACC_ABSTRACT, "run", "()V")
        .unwrap();
    let ctx = context();
    collect(&ctx, &[b.to_bytes().unwrap()]);
    assert_eq!(ctx.traced_len(), 0);
    assert_eq!(ctx.ignored_len(), 0);
    assert_eq!(
        ctx.hierarchy.get("app/Base").map(|s| s.value().clone()),
        Some("app/Root".to_string())
    );
}

#[test]
fn test_blocked_platform_classes_are_never_traced() {
    let mut b = ClassBuilder::new("android/widget/Helper", OBJECT).unwrap();
    b.method(ACC_PUBLIC, "work", "()V", |c| {
        c.maxs(0, 1);
        c.invoke(INVOKESTATIC, "Bar", "qux", "()V")?;
        c.op(RETURN);
        Ok(())
    })
    .unwrap();
    let ctx = context();
    collect(&ctx, &[b.to_bytes().unwrap()]);
    assert_eq!(
        reason(&ctx, &MethodKey::new("android/widget/Helper", "work", "()V")),
        Some(IgnoreReason::Blocked)
    );
}

#[test]
fn test_ui_entries_without_focus_are_counted() {
    let ctx = context();
    collect(
        &ctx,
        &[
            activity_class("app/Main", false),
            activity_class("app/Focused", true),
        ],
    );
    assert_eq!(ctx.stats.focus_candidates.load(Ordering::Relaxed), 1);
    assert!(ctx.is_ui_entry("app/Main"));
    assert!(!ctx.is_ui_entry(ACTIVITY));
    assert!(
        ctx.trace_id(&MethodKey::new("app/Focused", "onWindowFocusChanged", "(Z)V"))
            .is_some()
    );
}

#[test]
fn test_obfuscated_names_are_reverted_for_rules() {
    let mut mapping = MappingCollector::new();
    MappingReader::parse(
        "com.example.Foo -> Foo:\n    void baz() -> baz\n    int bar() -> bar\n",
        &mut mapping,
    );
    let ctx = context_with(
        "-keepmethod com.example.Foo baz ()V\n",
        Arc::new(mapping),
    );
    collect(&ctx, &[foo_class()]);
    let key = MethodKey::new("Foo", "baz", "()V");
    assert_eq!(reason(&ctx, &key), Some(IgnoreReason::Blocked));
    let reverted = key.revert(ctx.resolver.as_ref());
    assert_eq!(reverted.class_name, "com.example.Foo");
}

#[test]
fn test_concurrent_collection_assigns_unique_ids() {
    let classes: Vec<Vec<u8>> = (0..64)
        .map(|i| {
            let name = format!("app/C{i}");
            let mut b = ClassBuilder::new(&name, OBJECT).unwrap();
            for m in 0..4 {
                b.method(ACC_PUBLIC | ACC_STATIC, &format!("m{m}"), "()V", |c| {
                    c.maxs(0, 0);
                    c.invoke(INVOKESTATIC, "Bar", "qux", "()V")?;
                    c.op(RETURN);
                    Ok(())
                })
                .unwrap();
            }
            b.to_bytes().unwrap()
        })
        .collect();

    let ctx = context();
    let collector = MethodCollector::new(&ctx);
    // every class twice, so racing workers meet on the same keys
    classes.par_iter().chain(classes.par_iter()).for_each(|bytes| {
        collector
            .collect_class(&ClassFile::parse(bytes).unwrap())
            .unwrap();
    });

    assert_eq!(ctx.traced_len(), 256);
    let mut ids: Vec<u32> = ctx.traced_methods().iter().map(|m| m.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=256).collect::<Vec<_>>());
    assert_eq!(ctx.last_id(), 256);
}
