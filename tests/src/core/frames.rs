use mtrace_core::builder::ClassBuilder;
use mtrace_core::class_file::{ACC_PUBLIC, ACC_STATIC, ClassFile};
use mtrace_core::code::CodeAttribute;
use mtrace_core::constant_pool::Constant;
use mtrace_core::frames::CommonSuperclass;
use mtrace_core::hierarchy::{
    BootstrapTypes, ClasspathTypes, OBJECT, SuperclassResolver, common_super_class,
};
use mtrace_core::opcodes::*;
use mtrace_tests::{init_tracing, write_jar, write_tree};
use std::path::Path;
use std::sync::Arc;

fn plain(name: &str, super_name: &str) -> Vec<u8> {
    ClassBuilder::new(name, super_name)
        .unwrap()
        .to_bytes()
        .unwrap()
}

/// `a/Base` with subclasses `a/X` and `a/Y`, as a class directory.
fn family(root: &Path) {
    write_tree(
        root,
        &[
            ("a/Base.class", &plain("a/Base", OBJECT)),
            ("a/X.class", &plain("a/X", "a/Base")),
            ("a/Y.class", &plain("a/Y", "a/Base")),
        ],
    );
}

fn ladder(root: &Path) -> SuperclassResolver {
    SuperclassResolver::ladder(
        Arc::new(BootstrapTypes),
        Arc::new(ClasspathTypes::new([root.to_path_buf()])),
    )
}

/// `static Base pick(boolean, X, Y)` merging `X` and `Y` in local 3.
fn picker(resolver: SuperclassResolver) -> ClassFile {
    let mut b = ClassBuilder::new("app/Pick", OBJECT).unwrap();
    b.resolver(Box::new(resolver));
    b.method(ACC_PUBLIC | ACC_STATIC, "pick", "(ZLa/X;La/Y;)La/Base;", |c| {
        let other = c.new_label();
        let join = c.new_label();
        c.maxs(1, 4).op(ILOAD_0).jump(IFEQ, other);
        c.op(ALOAD_1).op(ASTORE_3).jump(GOTO, join);
        c.place(other).op(ALOAD_2).op(ASTORE_3);
        c.place(join).op(ALOAD_3).op(ARETURN);
        Ok(())
    })
    .unwrap();
    b.build()
}

fn class_constants(class: &ClassFile) -> Vec<String> {
    class
        .constant_pool
        .iter()
        .filter(|(_, c)| matches!(c, Constant::Class { .. }))
        .map(|(i, _)| class.constant_pool.class_name(i).unwrap().to_string())
        .collect()
}

fn has_stack_map(class: &ClassFile) -> bool {
    let method = &class.methods[0];
    let index = method.find_attribute(&class.constant_pool, "Code").unwrap();
    let code = CodeAttribute::parse(&method.attributes[index].info).unwrap();
    code.attributes
        .iter()
        .any(|a| a.name(&class.constant_pool).unwrap() == "StackMapTable")
}

#[test]
fn test_ladder_resolves_through_the_classpath() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    family(dir.path());
    let resolver = ladder(dir.path());
    assert_eq!(
        resolver.strategy_names().collect::<Vec<_>>(),
        ["tool", "classpath", "classpath+tool", "tool+classpath"]
    );
    assert_eq!(resolver.common_super_class("a/X", "a/Y"), "a/Base");
    assert_eq!(resolver.common_super_class("a/X", "a/Base"), "a/Base");
    assert_eq!(
        resolver.common_super_class("java/lang/RuntimeException", "java/io/IOException"),
        "java/lang/Exception"
    );
}

#[test]
fn test_jar_classpath_entries_are_indexed() {
    let dir = tempfile::tempdir().unwrap();
    let jar = dir.path().join("family.jar");
    write_jar(
        &jar,
        &[
            ("a/Base.class", &plain("a/Base", OBJECT)),
            ("a/X.class", &plain("a/X", "a/Base")),
            ("a/Y.class", &plain("a/Y", "a/Base")),
        ],
    );
    let types = ClasspathTypes::new([jar]);
    assert_eq!(common_super_class(&types, "a/X", "a/Y").unwrap(), "a/Base");
}

#[test]
fn test_unknown_types_fall_back_to_object() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = ladder(dir.path());
    assert_eq!(resolver.common_super_class("a/X", "a/Y"), OBJECT);
}

#[test]
fn test_merged_local_uses_the_common_superclass() {
    let dir = tempfile::tempdir().unwrap();
    family(dir.path());
    let class = picker(ladder(dir.path()));
    assert!(has_stack_map(&class));
    assert!(class_constants(&class).contains(&"a/Base".to_string()));
    ClassFile::parse(&class.to_bytes().unwrap()).unwrap();
}

#[test]
fn test_unresolvable_merge_still_produces_frames() {
    let empty = tempfile::tempdir().unwrap();
    let class = picker(ladder(empty.path()));
    assert!(has_stack_map(&class));
    let classes = class_constants(&class);
    assert!(!classes.contains(&"a/Base".to_string()));
    assert!(classes.contains(&OBJECT.to_string()));
}

#[test]
fn test_old_versions_get_no_stack_map() {
    let mut b = ClassBuilder::new("app/Old", OBJECT).unwrap();
    b.version(49);
    b.method(ACC_PUBLIC | ACC_STATIC, "sign", "(I)I", |c| {
        let negative = c.new_label();
        c.maxs(1, 1).op(ILOAD_0).jump(IFLT, negative).op(ICONST_1).op(IRETURN);
        c.place(negative).op(ICONST_M1).op(IRETURN);
        Ok(())
    })
    .unwrap();
    assert!(!has_stack_map(&b.build()));
}
