//! Fixtures shared by the integration tests.
//!
//! Classes are assembled with [`ClassBuilder`] so every test owns its inputs; jars are written
//! with `zip` the same way build tools produce them.

use mtrace_core::builder::ClassBuilder;
use mtrace_core::class_file::{ACC_PUBLIC, ACC_STATIC, ClassFile};
use mtrace_core::code::{CodeAttribute, MethodBody};
use mtrace_core::instruction::Insn;
use mtrace_core::opcodes::*;
use mtrace_transform::config::ConfigurationBuilder;
use mtrace_transform::method::{MethodKey, TraceMethod};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use zip::write::SimpleFileOptions;

pub const ACTIVITY: &str = "android/app/Activity";

/// Routes `tracing` output through the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Log sink for [`capture_logs`].
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Captured {
    type Writer = Captured;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Runs `f` with a subscriber on this thread that records everything logged.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
    let sink = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_ansi(false)
        .with_writer(sink.clone())
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8_lossy(&sink.0.lock().unwrap()).into_owned();
    (result, logs)
}

/// `<init>()V` calling the given superclass constructor.
pub fn constructor(b: &mut ClassBuilder, super_name: &str) {
    b.method(ACC_PUBLIC, "<init>", "()V", |c| {
        c.maxs(1, 1).op(ALOAD_0);
        c.invoke(INVOKESPECIAL, super_name, "<init>", "()V")?;
        c.op(RETURN);
        Ok(())
    })
    .unwrap();
}

/// `Foo` with an int getter `bar()I` and `baz()V` calling `Bar.qux()V`.
pub fn foo_class() -> Vec<u8> {
    let mut b = ClassBuilder::new("Foo", "java/lang/Object").unwrap();
    b.field(0, "x", "I").unwrap();
    b.method(ACC_PUBLIC, "bar", "()I", |c| {
        c.maxs(1, 1).op(ALOAD_0);
        c.field(GETFIELD, "Foo", "x", "I")?;
        c.op(IRETURN);
        Ok(())
    })
    .unwrap();
    b.method(ACC_PUBLIC, "baz", "()V", |c| {
        c.maxs(0, 1);
        c.invoke(INVOKESTATIC, "Bar", "qux", "()V")?;
        c.op(RETURN);
        Ok(())
    })
    .unwrap();
    b.to_bytes().unwrap()
}

/// `Bar` with a static `qux()V` that reads the clock.
pub fn bar_class() -> Vec<u8> {
    let mut b = ClassBuilder::new("Bar", "java/lang/Object").unwrap();
    b.method(ACC_PUBLIC | ACC_STATIC, "qux", "()V", |c| {
        c.maxs(2, 0);
        c.invoke(INVOKESTATIC, "java/lang/System", "nanoTime", "()J")?;
        c.op(POP2).op(RETURN);
        Ok(())
    })
    .unwrap();
    b.to_bytes().unwrap()
}

/// An activity with `onCreate` and, optionally, its own focus callback.
pub fn activity_class(name: &str, with_focus: bool) -> Vec<u8> {
    screen_class(name, ACTIVITY, with_focus)
}

/// A screen with `onCreate`, extending `super_name`, which may itself extend an activity.
pub fn screen_class(name: &str, super_name: &str, with_focus: bool) -> Vec<u8> {
    let mut b = ClassBuilder::new(name, super_name).unwrap();
    constructor(&mut b, super_name);
    b.method(ACC_PUBLIC, "onCreate", "(Landroid/os/Bundle;)V", |c| {
        c.maxs(2, 2).op(ALOAD_0).op(ALOAD_1);
        c.invoke(INVOKESPECIAL, super_name, "onCreate", "(Landroid/os/Bundle;)V")?;
        c.op(RETURN);
        Ok(())
    })
    .unwrap();
    if with_focus {
        b.method(ACC_PUBLIC, "onWindowFocusChanged", "(Z)V", |c| {
            c.maxs(2, 2).op(ALOAD_0).op(ILOAD_1);
            c.invoke(INVOKESPECIAL, super_name, "onWindowFocusChanged", "(Z)V")?;
            c.op(RETURN);
            Ok(())
        })
        .unwrap();
    }
    b.to_bytes().unwrap()
}

/// Writes `files` under `root`, creating parents.
pub fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (name, data) in files {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }
}

pub fn write_jar(path: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    for (name, data) in entries {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

pub fn read_jar(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut archive = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    let mut entries = BTreeMap::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).unwrap();
        if entry.is_dir() {
            continue;
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        entries.insert(entry.name().to_string(), data);
    }
    entries
}

/// Settings writing both mapping files into `dir`.
pub fn settings(dir: &Path) -> ConfigurationBuilder {
    ConfigurationBuilder {
        method_map_path: dir.join("methodMapping.txt"),
        ignore_method_map_path: dir.join("ignoreMethodMapping.txt"),
        threads: 4,
        ..ConfigurationBuilder::default()
    }
}

/// Reads a method map into `(class method descriptor) -> id`.
pub fn read_method_map(path: &Path) -> BTreeMap<MethodKey, u32> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter_map(TraceMethod::parse_mapping_line)
        .map(|m| (m.key, m.id))
        .collect()
}

/// The decoded body of `name descriptor` in `class`.
pub fn body_of(class: &ClassFile, name: &str, descriptor: &str) -> MethodBody {
    let method = &class.methods[class.find_method(name, descriptor).unwrap()];
    let index = method.find_attribute(&class.constant_pool, "Code").unwrap();
    let attr = CodeAttribute::parse(&method.attributes[index].info).unwrap();
    MethodBody::decode(&attr, &class.constant_pool).unwrap()
}

pub fn opcodes(body: &MethodBody) -> Vec<u8> {
    body.insns().map(|i| i.opcode()).collect()
}

/// `owner.name` of every invoke in `body`, in order.
pub fn calls(class: &ClassFile, body: &MethodBody) -> Vec<String> {
    body.insns()
        .filter_map(|insn| match insn {
            Insn::Constant { opcode, index } if is_invoke(*opcode) => {
                let r = class.constant_pool.member_ref(*index).unwrap();
                Some(format!("{}.{}", r.owner, r.name))
            }
            _ => None,
        })
        .collect()
}

/// The int pushed by a `push_int`-style instruction or an `ldc` of an `Integer`.
pub fn pushed_int(class: &ClassFile, insn: &Insn<mtrace_core::code::Label>) -> Option<i32> {
    match insn {
        Insn::Simple(op) if (ICONST_M1..=ICONST_5).contains(op) => Some(*op as i32 - ICONST_0 as i32),
        Insn::Push { opcode, value } if *opcode != NEWARRAY => Some(*value),
        Insn::Ldc { index } => match class.constant_pool.get(*index).ok()? {
            mtrace_core::constant_pool::Constant::Integer(v) => Some(*v),
            _ => None,
        },
        _ => None,
    }
}
