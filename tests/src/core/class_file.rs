use mtrace_core::builder::ClassBuilder;
use mtrace_core::class_file::{ACC_ABSTRACT, ACC_INTERFACE, ACC_PUBLIC, ClassFile};
use mtrace_core::code::CodeAttribute;
use mtrace_core::instruction::decode_instructions;
use mtrace_core::opcodes::*;
use mtrace_core::result::Error;
use mtrace_tests::{bar_class, foo_class, init_tracing};

#[test]
fn test_parse_and_reencode_is_lossless() {
    init_tracing();
    for bytes in [foo_class(), bar_class()] {
        let class = ClassFile::parse(&bytes).unwrap();
        assert_eq!(class.to_bytes().unwrap(), bytes);
    }
}

#[test]
fn test_header_accessors() {
    let mut b = ClassBuilder::new("app/Listener", "java/lang/Object").unwrap();
    b.access(ACC_PUBLIC | ACC_ABSTRACT | ACC_INTERFACE);
    b.interface("java/lang/Runnable").unwrap();
    b.bodiless_method(ACC_PUBLIC | ACC_ABSTRACT, "onEvent", "(I)V")
        .unwrap();
    let class = ClassFile::parse(&b.to_bytes().unwrap()).unwrap();

    assert_eq!(class.name().unwrap(), "app/Listener");
    assert_eq!(class.super_name().unwrap(), Some("java/lang/Object"));
    assert_eq!(class.interface_names().unwrap(), vec!["java/lang/Runnable"]);
    assert!(class.is_interface());
    assert!(class.is_abstract_or_interface());
    assert_eq!(class.find_method("onEvent", "(I)V"), Some(0));
    assert_eq!(class.find_method("onEvent", "()V"), None);
}

#[test]
fn test_decoded_code_lists_every_instruction() {
    let class = ClassFile::parse(&foo_class()).unwrap();
    let method = &class.methods[class.find_method("bar", "()I").unwrap()];
    let index = method.find_attribute(&class.constant_pool, "Code").unwrap();
    let code = CodeAttribute::parse(&method.attributes[index].info).unwrap();
    let insns = decode_instructions(&code.code).unwrap();
    assert_eq!(insns.len(), 3);
    assert_eq!(code.code[0], ALOAD_0);
    for insn in &insns {
        tracing::debug!("{}", insn);
        assert!(!insn.to_string().is_empty());
    }
}

#[test]
fn test_bad_magic_fails() {
    let mut bytes = foo_class();
    bytes[..4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    assert!(matches!(ClassFile::parse(&bytes), Err(Error::Decode(_))));
}

#[test]
fn test_truncated_input_fails() {
    let bytes = foo_class();
    assert!(matches!(
        ClassFile::parse(&bytes[..bytes.len() - 3]),
        Err(Error::Decode(_))
    ));
}
