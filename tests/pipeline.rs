//! End-to-end driver tests: preprocess, compile, cache, execute.

use std::fs;
use std::path::Path;

use lyrical_cli::compile::{compile_file, run_compiled, CompileOptions, SIZEOF_GPR};

fn options(root: &Path) -> CompileOptions {
    CompileOptions {
        log: false,
        debug: false,
        cache_root: root.join("cache"),
        lib_dir: root.join("lib"),
        uid: 1000,
    }
}

#[test]
fn compile_and_execute() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("prog.lyc");
    fs::write(&src, "u64 a = 5;\nu64 b = 7;\nu64 c = a + b * 2;\nreturn c - 1;\n").unwrap();
    let compiled = compile_file(&src, &options(tmp.path())).unwrap();
    assert!(compiled.rebuilt);
    let outcome = run_compiled(&compiled).unwrap();
    assert_eq!(outcome.exit, 18);
}

#[test]
fn macros_flow_through_the_pipeline() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("prog.lyc");
    // `uint` is a predeclared macro for the native word type.
    fs::write(
        &src,
        "`define ANSWER 42\nuint x = ANSWER;\nreturn x;\n",
    )
    .unwrap();
    let compiled = compile_file(&src, &options(tmp.path())).unwrap();
    let outcome = run_compiled(&compiled).unwrap();
    assert_eq!(outcome.exit, 42);
}

#[test]
fn cache_files_are_laid_out_per_spec() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("prog.lyc");
    fs::write(&src, "return 3;\n").unwrap();
    let opts = CompileOptions {
        log: true,
        debug: true,
        ..options(tmp.path())
    };
    let compiled = compile_file(&src, &opts).unwrap();
    assert!(compiled.entry.bin_path().is_file());
    assert!(compiled.entry.src_path().is_file());
    assert!(compiled.entry.map_path().is_file());
    assert!(compiled.entry.log_path().is_file());
    assert!(compiled.entry.dbg_path().is_file());
    // `src` lists the consumed source files, newline-separated.
    let srcs = fs::read_to_string(compiled.entry.src_path()).unwrap();
    assert!(srcs.lines().any(|l| l.ends_with("prog.lyc")));
    // `map` carries the three word-sized sizes.
    let map = compiled.entry.load_map(SIZEOF_GPR).unwrap();
    assert!(map.executable_instr_size > 0);
}

#[test]
fn unchanged_sources_skip_the_rebuild_and_keep_the_bin_mtime() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("prog.lyc");
    fs::write(&src, "return 1;\n").unwrap();
    let opts = options(tmp.path());
    let first = compile_file(&src, &opts).unwrap();
    assert!(first.rebuilt);
    let mtime = fs::metadata(first.entry.bin_path()).unwrap().modified().unwrap();
    let second = compile_file(&src, &opts).unwrap();
    assert!(!second.rebuilt);
    let mtime2 = fs::metadata(second.entry.bin_path()).unwrap().modified().unwrap();
    assert_eq!(mtime, mtime2);
    // The cached program still runs.
    assert_eq!(run_compiled(&second).unwrap().exit, 1);
}

#[test]
fn touching_a_source_forces_a_rebuild() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("prog.lyc");
    fs::write(&src, "return 1;\n").unwrap();
    let opts = options(tmp.path());
    let first = compile_file(&src, &opts).unwrap();
    assert!(first.rebuilt);
    std::thread::sleep(std::time::Duration::from_millis(20));
    fs::write(&src, "return 2;\n").unwrap();
    let second = compile_file(&src, &opts).unwrap();
    assert!(second.rebuilt);
    assert_eq!(run_compiled(&second).unwrap().exit, 2);
}

#[test]
fn includes_are_tracked_for_cache_freshness() {
    let tmp = tempfile::tempdir().unwrap();
    let inc = tmp.path().join("defs.lyh");
    fs::write(&inc, "`define BASE 10\n").unwrap();
    let src = tmp.path().join("prog.lyc");
    fs::write(&src, "`include \"./defs.lyh\"\nreturn BASE;\n").unwrap();
    let opts = options(tmp.path());
    let first = compile_file(&src, &opts).unwrap();
    assert_eq!(run_compiled(&first).unwrap().exit, 10);
    // Touching the include invalidates the entry.
    std::thread::sleep(std::time::Duration::from_millis(20));
    fs::write(&inc, "`define BASE 11\n").unwrap();
    let second = compile_file(&src, &opts).unwrap();
    assert!(second.rebuilt);
    assert_eq!(run_compiled(&second).unwrap().exit, 11);
}

#[test]
fn compile_errors_surface_with_location() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("bad.lyc");
    fs::write(&src, "`abort\n").unwrap();
    let err = compile_file(&src, &options(tmp.path())).unwrap_err();
    assert!(err.to_string().contains("bad.lyc:1"), "{err}");
}

#[test]
fn missing_input_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let err = compile_file(&tmp.path().join("nope.lyc"), &options(tmp.path())).unwrap_err();
    assert!(err.to_string().contains("not found"));
}
