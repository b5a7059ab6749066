//! End to end pipeline runs over class directories and jars.
//!
//! Every test builds its inputs in a temporary directory, runs the pipeline the way the CLI
//! does, and checks the mapping files and rewritten outputs.

use mtrace_core::class_file::ClassFile;
use mtrace_tests::{
    ACTIVITY, activity_class, bar_class, body_of, calls, capture_logs, foo_class, init_tracing,
    read_jar, read_method_map, screen_class, settings, write_jar, write_tree,
};
use mtrace_transform::io::Unit;
use mtrace_transform::method::MethodKey;
use mtrace_transform::pipeline::Pipeline;
use mtrace_transform::tracer::check_class;
use mtrace_transform::{METHOD_ID_DISPATCH, dotted};
use std::collections::BTreeSet;
use std::path::Path;

const DISPATCH_LINE: &str = "1048574,1,android.os.Handler,dispatchMessage,(Landroid.os.Message;)V";

fn dir_unit(input: &Path, output: Option<&Path>) -> Unit {
    Unit::Directory {
        input: input.to_path_buf(),
        output: output.map(Path::to_path_buf),
    }
}

#[test]
fn test_blocked_class_yields_only_the_dispatch_entry() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let classes = dir.path().join("classes");
    write_tree(&classes, &[("Foo.class", &foo_class())]);
    let block_list = dir.path().join("blockMethodList.txt");
    std::fs::write(&block_list, "[class]\n-keepclass Foo\n").unwrap();

    let mut builder = settings(dir.path());
    builder.block_list_path = Some(block_list);
    let summary = Pipeline::new(builder)
        .unwrap()
        .collect(&[dir_unit(&classes, None)])
        .unwrap();

    let map = std::fs::read_to_string(dir.path().join("methodMapping.txt")).unwrap();
    assert_eq!(map, format!("{DISPATCH_LINE}\n"));
    let report = std::fs::read_to_string(dir.path().join("ignoreMethodMapping.txt")).unwrap();
    assert_eq!(
        report,
        "ignore methods:\n\nblack methods:\nFoo bar ()I\nFoo baz ()V\n\n"
    );
    assert_eq!(summary.traced_methods, 1);
    assert_eq!(summary.ignored_methods, 2);
    assert!(!summary.rewritten);
}

#[test]
fn test_every_method_lands_in_exactly_one_table() {
    let dir = tempfile::tempdir().unwrap();
    let classes = dir.path().join("classes");
    let inputs = [
        ("Foo.class", foo_class()),
        ("Bar.class", bar_class()),
        ("app/Main.class", activity_class("app/Main", false)),
        ("app/Focused.class", activity_class("app/Focused", true)),
    ];
    let files: Vec<(&str, &[u8])> = inputs.iter().map(|(n, b)| (*n, b.as_slice())).collect();
    write_tree(&classes, &files);

    let pipeline = Pipeline::new(settings(dir.path())).unwrap();
    pipeline.collect(&[dir_unit(&classes, None)]).unwrap();
    let ctx = pipeline.context();

    for (_, bytes) in &inputs {
        let class = ClassFile::parse(bytes).unwrap();
        let pool = &class.constant_pool;
        for method in &class.methods {
            let key = MethodKey::new(
                class.name().unwrap(),
                method.name(pool).unwrap(),
                method.descriptor(pool).unwrap(),
            );
            let traced = ctx.trace_id(&key).is_some();
            let ignored = ctx.ignore_reason(&key).is_some();
            assert!(traced ^ ignored, "{key} traced={traced} ignored={ignored}");
        }
    }

    let ids: Vec<u32> = ctx.traced_methods().iter().map(|m| m.id).collect();
    let unique: BTreeSet<u32> = ids.iter().copied().collect();
    assert_eq!(ids.len(), unique.len());
    assert!(unique.contains(&METHOD_ID_DISPATCH));
}

#[test]
fn test_trace_rewrites_classes_and_copies_resources() {
    let dir = tempfile::tempdir().unwrap();
    let classes = dir.path().join("classes");
    let out = dir.path().join("out");
    let broken = b"\xca\xfe\xba\xbe\x00".to_vec();
    let r_class = b"not parsed".to_vec();
    write_tree(
        &classes,
        &[
            ("Foo.class", &foo_class()),
            ("Bar.class", &bar_class()),
            ("app/Main.class", &activity_class("app/Main", false)),
            ("app/R.class", &r_class),
            ("app/Broken.class", &broken),
            ("assets/config.json", b"{}"),
        ],
    );

    let pipeline = Pipeline::new(settings(dir.path())).unwrap();
    let summary = pipeline
        .trace(&[dir_unit(&classes, Some(out.as_path()))])
        .unwrap();
    assert!(summary.rewritten);
    assert_eq!(summary.stats.focus_synthesized, 1);
    assert_eq!(summary.stats.copied_through, 1);
    assert_eq!(summary.stats.check_failures, 0);
    assert_eq!(
        summary.superclass_strategies,
        ["tool", "classpath", "classpath+tool", "tool+classpath"]
    );

    assert_eq!(std::fs::read(out.join("assets/config.json")).unwrap(), b"{}");
    assert_eq!(std::fs::read(out.join("app/R.class")).unwrap(), r_class);
    assert_eq!(std::fs::read(out.join("app/Broken.class")).unwrap(), broken);

    let map = read_method_map(&dir.path().join("methodMapping.txt"));
    let main = ClassFile::parse(&std::fs::read(out.join("app/Main.class")).unwrap()).unwrap();
    assert!(main.find_method("onWindowFocusChanged", "(Z)V").is_some());
    let foo = std::fs::read(out.join("Foo.class")).unwrap();
    check_class(&foo).unwrap();
    let foo = ClassFile::parse(&foo).unwrap();
    let baz_id = map[&MethodKey::new("Foo", "baz", "()V")];
    assert_eq!(pipeline.context().trace_id(&MethodKey::new("Foo", "baz", "()V")), Some(baz_id));
    assert_eq!(
        calls(&foo, &body_of(&foo, "baz", "()V"))[0],
        "com/mtrace/core/MethodBeat.i"
    );
}

#[test]
fn test_indirect_activity_subclasses_get_one_focus_callback() {
    let dir = tempfile::tempdir().unwrap();
    let app = dir.path().join("app_classes");
    let lib = dir.path().join("lib_classes");
    write_tree(
        &app,
        &[("app/Main.class", &screen_class("app/Main", "lib/Base", false))],
    );
    write_tree(
        &lib,
        &[("lib/Base.class", &screen_class("lib/Base", ACTIVITY, false))],
    );
    let app_out = dir.path().join("out/app");
    let lib_out = dir.path().join("out/lib");

    let summary = Pipeline::new(settings(dir.path()))
        .unwrap()
        .trace(&[
            dir_unit(&app, Some(app_out.as_path())),
            dir_unit(&lib, Some(lib_out.as_path())),
        ])
        .unwrap();
    assert_eq!(summary.stats.focus_synthesized, 2);
    assert_eq!(summary.stats.check_failures, 0);

    for (path, super_name) in [
        (app_out.join("app/Main.class"), "lib/Base"),
        (lib_out.join("lib/Base.class"), ACTIVITY),
    ] {
        let bytes = std::fs::read(&path).unwrap();
        check_class(&bytes).unwrap();
        let class = ClassFile::parse(&bytes).unwrap();
        let pool = &class.constant_pool;
        let focus_methods = class
            .methods
            .iter()
            .filter(|m| {
                m.name(pool).unwrap() == "onWindowFocusChanged"
                    && m.descriptor(pool).unwrap() == "(Z)V"
            })
            .count();
        assert_eq!(focus_methods, 1, "{}", path.display());
        let forwarded = format!("{super_name}.onWindowFocusChanged");
        let body = body_of(&class, "onWindowFocusChanged", "(Z)V");
        assert!(calls(&class, &body).contains(&forwarded));
    }
}

#[test]
fn test_missing_classpath_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let classes = dir.path().join("classes");
    write_tree(&classes, &[("Foo.class", &foo_class())]);
    let run = |classpath: Vec<std::path::PathBuf>, name: &str| {
        let mut builder = settings(&dir.path().join(name));
        builder.classpath = classpath;
        let out = dir.path().join(name).join("out");
        let (summary, logs) = capture_logs(|| {
            Pipeline::new(builder)
                .unwrap()
                .trace(&[dir_unit(&classes, Some(out.as_path()))])
        });
        summary.unwrap();
        logs
    };

    assert!(run(Vec::new(), "bare").contains("no classpath"));
    assert!(!run(vec![classes.clone()], "with_classpath").contains("no classpath"));
}

#[test]
fn test_base_map_keeps_ids_stable() {
    let dir = tempfile::tempdir().unwrap();
    let classes = dir.path().join("classes");
    write_tree(
        &classes,
        &[("Foo.class", &foo_class()), ("Bar.class", &bar_class())],
    );
    let first = dir.path().join("first");
    Pipeline::new(settings(&first))
        .unwrap()
        .collect(&[dir_unit(&classes, None)])
        .unwrap();
    let before = read_method_map(&first.join("methodMapping.txt"));

    write_tree(
        &classes,
        &[("app/Main.class", &activity_class("app/Main", false))],
    );
    let second = dir.path().join("second");
    let mut builder = settings(&second);
    builder.base_method_map_path = Some(first.join("methodMapping.txt"));
    let summary = Pipeline::new(builder)
        .unwrap()
        .collect(&[dir_unit(&classes, None)])
        .unwrap();
    let after = read_method_map(&second.join("methodMapping.txt"));

    assert_eq!(summary.preloaded_ids, before.len() - 1);
    for (key, id) in &before {
        assert_eq!(after.get(key), Some(id), "{key}");
    }
    let previous_max = before
        .values()
        .copied()
        .filter(|id| *id != METHOD_ID_DISPATCH)
        .max()
        .unwrap();
    let main = dotted("app/Main");
    let new_ids: Vec<u32> = after
        .iter()
        .filter(|(k, _)| k.class_name == main)
        .map(|(_, id)| *id)
        .collect();
    assert!(!new_ids.is_empty());
    assert!(new_ids.iter().all(|id| *id > previous_max));
}

#[test]
fn test_jars_are_rewritten_entry_by_entry() {
    let dir = tempfile::tempdir().unwrap();
    let jar = dir.path().join("lib.jar");
    let manifest = b"Manifest-Version: 1.0\n".to_vec();
    write_jar(
        &jar,
        &[
            ("META-INF/MANIFEST.MF", &manifest),
            ("Foo.class", &foo_class()),
            ("Bar.class", &bar_class()),
            ("res/raw/data.bin", &[1, 2, 3]),
        ],
    );
    let output = dir.path().join("out/lib.jar");
    let unit = Unit::Jar {
        input: jar.clone(),
        output: Some(output.clone()),
    };

    let summary = Pipeline::new(settings(dir.path()))
        .unwrap()
        .trace(&[unit])
        .unwrap();
    assert_eq!(summary.stats.classes_rewritten, 2);

    let before = read_jar(&jar);
    let after = read_jar(&output);
    assert_eq!(
        before.keys().collect::<Vec<_>>(),
        after.keys().collect::<Vec<_>>()
    );
    assert_eq!(after["META-INF/MANIFEST.MF"], manifest);
    assert_eq!(after["res/raw/data.bin"], [1u8, 2, 3]);
    for name in ["Foo.class", "Bar.class"] {
        assert_ne!(after[name], before[name]);
        check_class(&after[name]).unwrap();
    }
}

#[test]
fn test_unreadable_jar_is_copied_through() {
    let dir = tempfile::tempdir().unwrap();
    let jar = dir.path().join("broken.jar");
    std::fs::write(&jar, b"PK\x03\x04 truncated").unwrap();
    let output = dir.path().join("out/broken.jar");

    let summary = Pipeline::new(settings(dir.path()))
        .unwrap()
        .trace(&[Unit::Jar {
            input: jar.clone(),
            output: Some(output.clone()),
        }])
        .unwrap();
    assert_eq!(summary.stats.copied_through, 1);
    assert_eq!(std::fs::read(&output).unwrap(), std::fs::read(&jar).unwrap());
}

#[test]
fn test_settings_file_drives_hooks() {
    let dir = tempfile::tempdir().unwrap();
    let classes = dir.path().join("classes");
    let out = dir.path().join("out");
    write_tree(&classes, &[("Foo.class", &foo_class())]);
    let json = dir.path().join("settings.json");
    std::fs::write(
        &json,
        r#"{"hooks": {"class_name": "app/Probe", "enter": "in", "exit": "out"}, "threads": 2}"#,
    )
    .unwrap();

    let mut builder =
        mtrace_transform::config::ConfigurationBuilder::from_json_file(&json).unwrap();
    builder.method_map_path = dir.path().join("methodMapping.txt");
    builder.ignore_method_map_path = dir.path().join("ignoreMethodMapping.txt");
    Pipeline::new(builder)
        .unwrap()
        .trace(&[dir_unit(&classes, Some(out.as_path()))])
        .unwrap();

    let foo = ClassFile::parse(&std::fs::read(out.join("Foo.class")).unwrap()).unwrap();
    assert_eq!(
        calls(&foo, &body_of(&foo, "baz", "()V")),
        ["app/Probe.in", "Bar.qux", "app/Probe.out"]
    );
}

#[test]
fn test_single_threaded_collection_is_repeatable() {
    let dir = tempfile::tempdir().unwrap();
    let classes = dir.path().join("classes");
    write_tree(
        &classes,
        &[
            ("Foo.class", &foo_class()),
            ("Bar.class", &bar_class()),
            ("app/Main.class", &activity_class("app/Main", false)),
        ],
    );

    let run = |name: &str| {
        let mut builder = settings(&dir.path().join(name));
        builder.threads = 1;
        Pipeline::new(builder)
            .unwrap()
            .collect(&[dir_unit(&classes, None)])
            .unwrap();
        (
            std::fs::read_to_string(dir.path().join(name).join("methodMapping.txt")).unwrap(),
            std::fs::read_to_string(dir.path().join(name).join("ignoreMethodMapping.txt")).unwrap(),
        )
    };
    assert_eq!(run("a"), run("b"));
}
