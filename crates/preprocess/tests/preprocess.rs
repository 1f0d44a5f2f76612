//! End-to-end preprocessor tests: macro algebra, conditionals, foreach,
//! includes and module dedup, lyx mode, and diagnostics.

use std::fs;

use lyrical_preprocess::{
    preprocess, Error, Preprocessed, PredeclaredMacro, PreprocessConfig, EXPORT_SCOPE_OPEN,
};

fn pp(source: &str) -> Preprocessed {
    preprocess(source, PreprocessConfig::default()).unwrap()
}

fn pp_src(source: &str) -> String {
    pp(source).source
}

fn pp_err(source: &str) -> Error {
    preprocess(source, PreprocessConfig::default()).unwrap_err()
}

#[test]
fn directive_free_input_round_trips() {
    let input = "int x = 42;\nfoo(bar, \"a string\");\nwhile (x) { x = x - 1; }\n";
    assert_eq!(pp_src(input), input);
}

#[test]
fn chunk_contents_concatenate_to_output() {
    let out = pp("abc def\nghi\n");
    let mut total = String::new();
    for &(off, id) in &out.spans {
        assert_eq!(off, total.len());
        total.push_str(&out.store.chunk(id).content);
    }
    assert_eq!(total, out.source);
}

#[test]
fn chunk_offsets_point_into_originating_file() {
    let input = "alpha beta\n";
    let out = pp(input);
    for &(_, id) in &out.spans {
        let c = out.store.chunk(id);
        assert_eq!(&input[c.offset..c.offset + c.content.len()], c.content);
    }
}

#[test]
fn define_use_undef_redefine() {
    let out = pp_src("`define X 42\nX\n`undef X\n`define X 43\nX\n");
    assert_eq!(out, "42\n43\n");
}

#[test]
fn object_like_macro_name_must_be_uppercase() {
    let err = pp_err("`define lower 1\n");
    assert!(err.message.contains("do not use lowercase"));
}

#[test]
fn duplicate_definition_quotes_original_site() {
    let err = pp_err("`define X 1\n`define X 2\n");
    assert!(err.message.contains("macro was already declared at"), "{err}");
    assert!(err.message.contains(":1"), "{err}");
}

#[test]
fn reserved_names_are_rejected() {
    assert!(pp_err("`define FILE 1\n").message.contains("reserved"));
    assert!(pp_err("`define LINE 1\n").message.contains("reserved"));
}

#[test]
fn undef_of_unknown_macro_fails() {
    let err = pp_err("`undef NOPE\n");
    assert!(err.message.contains("not previously defined"));
}

#[test]
fn macro_cannot_use_itself_while_being_defined() {
    let err = pp_err("`define X X\n");
    assert!(err.message.contains("being defined"));
}

#[test]
fn function_like_macro_substitutes_arguments() {
    // Token paste joins the two substituted arguments into `12`.
    let out = pp("`define X 1\n`define Y(A,B)\nA_B\n`enddef\nY(X,2)");
    assert_eq!(out.source, "12\n");
    // The chunk for `1` carries the argument provenance and the use site.
    let one = out.chunk_at(0).unwrap();
    let c = out.store.chunk(one);
    assert_eq!(c.content, "1");
    assert_eq!(
        c.origin.as_deref(),
        Some("from argument \"A\" of macro \"Y\"")
    );
    assert_eq!(c.line, 5);
    let two = out.chunk_at(1).unwrap();
    let c = out.store.chunk(two);
    assert_eq!(c.content, "2");
    assert_eq!(
        c.origin.as_deref(),
        Some("from argument \"B\" of macro \"Y\"")
    );
}

#[test]
fn function_like_macro_requires_parenthesis() {
    let err = pp_err("`define Y(A)\nA\n`enddef\nY\n");
    assert!(err.message.contains("not followed by '('"));
}

#[test]
fn nested_parentheses_stay_in_one_argument() {
    let out = pp_src("`define Y(A)\nA\n`enddef\nY(f(g,h))\n");
    assert_eq!(out, "f(g,h)\n");
}

#[test]
fn unused_macro_argument_is_an_error() {
    let err = pp_err("`define M(A,B)\nA\n`enddef\n");
    assert!(err.message.contains("unused macro argument"));
}

#[test]
fn unreferenced_body_with_no_arguments_never_parses() {
    // A function-like macro whose body references no argument fails at the
    // definition, pointing at the unused parameter.
    let err = pp_err("`define M(A)\nnothing here\n`enddef\n");
    assert!(err.message.contains("unused macro argument"));
}

#[test]
fn missing_enddef_is_reported() {
    let err = pp_err("`define M(A)\nA\n");
    assert!(err.message.contains("`enddef could not be found"));
}

#[test]
fn file_and_line_capture_the_use_site() {
    let out = pp_src("`define M LINE\nM\n\nM\n");
    assert_eq!(out, "2\n\n4\n");
}

#[test]
fn line_expands_outside_macros_too() {
    let out = pp_src("LINE\nLINE\n");
    assert_eq!(out, "1\n2\n");
}

#[test]
fn token_paste_erases_underscore() {
    let out = pp_src("`define A1 foo\nA1_bar\n");
    assert_eq!(out, "foobar\n");
}

#[test]
fn conditionals_select_the_defined_branch() {
    let out = pp_src("`define F 1\n`ifdef F\nyes\n`else\nno\n`endif\n");
    assert_eq!(out, "yes\n");
    // The newline right after `else is part of the selected block.
    let out = pp_src("`ifdef F\nyes\n`else\nno\n`endif\n");
    assert_eq!(out, "\nno\n");
}

#[test]
fn ifndef_negates() {
    let out = pp_src("`ifndef F\nabsent\n`endif\n");
    assert_eq!(out, "absent\n");
}

#[test]
fn elifdef_reenters_the_conditional() {
    let src = "`define B 1\n`ifdef A\none\n`elifdef B\ntwo\n`else\nthree\n`endif\n";
    assert_eq!(pp_src(src), "two\n");
}

#[test]
fn nested_conditionals_are_skipped_whole() {
    let src = "`ifdef A\n`ifdef B\nx\n`endif\ny\n`else\nz\n`endif\n";
    assert_eq!(pp_src(src), "\nz\n");
}

#[test]
fn unmatched_endif_is_reported() {
    let err = pp_err("`ifdef A\nbody\n");
    assert!(err.message.contains("`endif could not be found"));
}

#[test]
fn foreach_iterates_the_body_per_parameter() {
    let out = pp("`foreach \"a\" \"b\"\nX\n`endfor\n");
    assert_eq!(out.source, "a\nb\n");
    // Each iteration's expansion chunk carries the loop-macro origin and
    // the iteration value as content.
    let first = out.chunk_at(0).unwrap();
    let c = out.store.chunk(first);
    assert_eq!(c.content, "a");
    assert_eq!(c.origin.as_deref(), Some("from macro \"X\""));
    let second = out.chunk_at(2).unwrap();
    assert_eq!(out.store.chunk(second).content, "b");
}

#[test]
fn foreach_loop_macro_must_be_used() {
    let err = pp_err("`foreach \"a\"\nnothing\n`endfor\n");
    assert!(err.message.contains("unused for-loop macro"));
}

#[test]
fn foreach_requires_at_least_one_parameter() {
    let err = pp_err("`foreach X\nX\n`endfor\n");
    assert!(err.message.contains("expecting a double quoted string"));
}

#[test]
fn foreach_macro_cannot_be_undefined() {
    let err = pp_err("`foreach \"a\"\nX\n`undef X\n`endfor\n");
    assert!(err.message.contains("cannot be undefined"));
}

#[test]
fn abort_raises_an_empty_diagnostic() {
    let err = pp_err("text\n`abort\n");
    assert_eq!(err.message, "");
    assert_eq!(err.location.line, 2);
}

#[test]
fn nested_comments_are_stripped() {
    let out = pp_src("a #{ hidden #{ deeper }# still hidden }# b\n");
    assert_eq!(out, "a  b\n");
}

#[test]
fn line_comments_run_to_end_of_line() {
    let out = pp_src("a # comment\nb\n");
    assert_eq!(out, "a \nb\n");
}

#[test]
fn unterminated_block_comment_is_reported() {
    let err = pp_err("a #{ never closed\n");
    assert!(err.message.contains("}#"));
}

#[test]
fn predeclared_macros_expand() {
    let cfg = PreprocessConfig {
        predeclared_macros: vec![PredeclaredMacro {
            name: "uint".into(),
            content: "u64".into(),
        }],
        ..Default::default()
    };
    let out = preprocess("uint x\n", cfg).unwrap();
    assert_eq!(out.source, "u64 x\n");
}

#[test]
fn predeclared_macros_cannot_be_undefined() {
    let cfg = PreprocessConfig {
        predeclared_macros: vec![PredeclaredMacro {
            name: "uint".into(),
            content: "u64".into(),
        }],
        ..Default::default()
    };
    let err = preprocess("`undef uint\n", cfg).unwrap_err();
    assert!(err.message.contains("cannot be undefined"));
}

// ---- includes -----------------------------------------------------------

fn config_at(dir: &std::path::Path) -> PreprocessConfig<'static> {
    PreprocessConfig {
        cwd: Some(dir.to_owned()),
        ..Default::default()
    }
}

#[test]
fn plain_file_included_twice_yields_two_copies() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("f.lyc"), "payload\n").unwrap();
    let out = preprocess(
        "`include \"./f.lyc\"\n`include \"./f.lyc\"\n",
        config_at(tmp.path()),
    )
    .unwrap();
    assert_eq!(out.source.matches("payload").count(), 2);
    assert_eq!(out.src_file_paths.len(), 2);
}

#[test]
fn module_include_is_deduplicated_and_hoisted() {
    let tmp = tempfile::tempdir().unwrap();
    let bdir = tmp.path().join("b");
    fs::create_dir(&bdir).unwrap();
    fs::write(bdir.join("b.lyh"), "decl\n").unwrap();
    fs::write(bdir.join("b.lyc"), "impl\n").unwrap();
    fs::write(
        tmp.path().join("a.lyc"),
        "`include \"b\"\nmain\n`include \"b\"\n",
    )
    .unwrap();
    let cfg = PreprocessConfig {
        cwd: Some(tmp.path().to_owned()),
        standard_paths: vec![tmp.path().to_owned()],
        ..Default::default()
    };
    let out = preprocess("`include \"./a.lyc\"\n", cfg).unwrap();
    // One copy of the module, wrapped in an export-inference scope, hoisted
    // before the includer's own text.
    assert_eq!(out.source.matches("decl").count(), 1);
    assert_eq!(out.source.matches("impl").count(), 1);
    assert_eq!(out.source.matches(EXPORT_SCOPE_OPEN).count(), 1);
    let decl_at = out.source.find("decl").unwrap();
    let main_at = out.source.find("main").unwrap();
    assert!(decl_at < main_at);
    // b.lyh, b.lyc and a.lyc were all read exactly once.
    let names: Vec<_> = out
        .src_file_paths
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names.iter().filter(|n| n.as_str() == "b.lyh").count(),
        1
    );
    assert_eq!(
        names.iter().filter(|n| n.as_str() == "b.lyc").count(),
        1
    );
}

#[test]
fn module_without_lyc_is_accepted() {
    let tmp = tempfile::tempdir().unwrap();
    let bdir = tmp.path().join("m");
    fs::create_dir(&bdir).unwrap();
    fs::write(bdir.join("m.lyh"), "only header\n").unwrap();
    let out = preprocess("`include \"./m\"\n", config_at(tmp.path())).unwrap();
    assert!(out.source.contains("only header"));
    assert!(!out.source.contains(EXPORT_SCOPE_OPEN));
}

#[test]
fn recursive_include_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("self.lyc"), "`include \"./self.lyc\"\n").unwrap();
    let err = preprocess("`include \"./self.lyc\"\n", config_at(tmp.path())).unwrap_err();
    assert!(err.message.contains("recursive include"), "{err}");
    assert!(!err.included_from.is_empty());
}

#[test]
fn indirect_recursion_is_detected() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("a.lyc"), "`include \"./b.lyc\"\n").unwrap();
    fs::write(tmp.path().join("b.lyc"), "`include \"./a.lyc\"\n").unwrap();
    let err = preprocess("`include \"./a.lyc\"\n", config_at(tmp.path())).unwrap_err();
    assert!(err.message.contains("recursive include"));
    assert_eq!(err.included_from.len(), 2);
}

#[test]
fn missing_include_without_installer_fails() {
    let err = preprocess("`include \"missing.h\"\n", PreprocessConfig::default()).unwrap_err();
    assert!(err.message.contains("could not include"));
}

#[test]
fn installer_callback_gets_one_retry() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().to_owned();
    let mut calls = 0u32;
    {
        let cfg = PreprocessConfig {
            standard_paths: vec![dir.clone()],
            install_missing_module: Some(Box::new(|name: &str| {
                calls += 1;
                fs::write(dir.join(name), "installed\n").unwrap();
                true
            })),
            ..Default::default()
        };
        let out = preprocess("`include \"late.lyc\"\n", cfg).unwrap();
        assert!(out.source.contains("installed"));
    }
    assert_eq!(calls, 1);
}

#[test]
fn local_macros_do_not_leak_out_of_their_file() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("inc.lyc"), "`locdef M 9\nM\n").unwrap();
    let out = preprocess("`include \"./inc.lyc\"\nM\n", config_at(tmp.path())).unwrap();
    // Expanded inside the file, ordinary identifier outside of it.
    assert!(out.source.contains("9\n"));
    assert!(out.source.contains("M\n"));
}

#[test]
fn non_local_macros_survive_the_include() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("inc.lyc"), "`define M 9\n").unwrap();
    let out = preprocess("`include \"./inc.lyc\"\nM\n", config_at(tmp.path())).unwrap();
    assert!(out.source.contains("9\n"));
}

#[test]
fn include_backtrace_names_the_use_sites() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("bad.lyc"), "`abort\n").unwrap();
    let err = preprocess("`include \"./bad.lyc\"\n", config_at(tmp.path())).unwrap_err();
    assert_eq!(err.included_from.len(), 1);
    assert!(err.included_from[0].ends_with(":1"));
    assert!(err.location.path.ends_with("bad.lyc"));
}

// ---- lyx mode -----------------------------------------------------------

fn pp_lyx(content: &str) -> String {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("t.lyx"), content).unwrap();
    let cfg = PreprocessConfig {
        cwd: Some(tmp.path().to_owned()),
        lyx_append: Some(".out();".into()),
        ..Default::default()
    };
    preprocess("`include \"./t.lyx\"\n", cfg).unwrap().source
}

#[test]
fn lyx_text_becomes_quoted_literals_with_append() {
    assert_eq!(pp_lyx("Hi"), "\"Hi\".out();");
}

#[test]
fn lyx_newlines_become_escapes() {
    assert_eq!(pp_lyx("a\nb"), "\"a\\nb\".out();");
}

#[test]
fn lyx_code_blocks_pass_through() {
    assert_eq!(pp_lyx("Hi<%x = 1;%>Yo"), "\"Hi\".out();x = 1;\"Yo\".out();");
}

#[test]
fn lyx_empty_text_between_code_blocks_elides_the_append() {
    assert_eq!(pp_lyx("<%a();%><%b();%>"), "a();b();");
}

#[test]
fn lyx_interpolation_closes_and_reopens_the_literal() {
    assert_eq!(pp_lyx("A$v B"), "\"A\".out();v.out();\" B\".out();");
    assert_eq!(pp_lyx("A${v} B"), "\"A\".out();v.out();\" B\".out();");
}

#[test]
fn lyx_xml_comments_are_stripped() {
    assert_eq!(pp_lyx("a<! note ->b"), "\"ab\".out();");
}

#[test]
fn lyx_quotes_in_text_are_escaped() {
    assert_eq!(pp_lyx("say \"hi\" now"), "\"say \\\"hi\\\" now\".out();");
}

#[test]
fn lyx_unterminated_code_block_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("t.lyx"), "text<%never closed").unwrap();
    let err = preprocess("`include \"./t.lyx\"\n", config_at(tmp.path())).unwrap_err();
    assert!(err.message.contains("expecting %>"));
}

#[test]
fn lyx_directives_work_inside_code_blocks() {
    // $V splices the raw symbol into the code stream; the interpolated
    // text is not re-scanned for macros.
    assert_eq!(
        pp_lyx("<%`define V 7\n%>n is $V."),
        "\"n is \".out();V.out();\".\".out();"
    );
}

// ---- provenance query ----------------------------------------------------

#[test]
fn chunk_at_maps_offsets_to_chunks() {
    let out = pp("aa bb\n");
    let id = out.chunk_at(0).unwrap();
    assert!(out.store.chunk(id).content.starts_with("aa"));
    assert!(out.chunk_at(out.source.len()).is_none());
}

#[test]
fn src_file_paths_are_absolute() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("f.lyc"), "x\n").unwrap();
    let out = preprocess("`include \"./f.lyc\"\n", config_at(tmp.path())).unwrap();
    assert!(out.src_file_paths[0].is_absolute());
}

#[test]
fn provenance_survives_concatenation() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("f.lyc"), "first\n").unwrap();
    let out = preprocess("`include \"./f.lyc\"\ntail\n", config_at(tmp.path())).unwrap();
    let first_at = out.source.find("first").unwrap();
    let id = out.chunk_at(first_at).unwrap();
    let c = out.store.chunk(id);
    assert!(c.path.ends_with("f.lyc"));
    assert_eq!(c.line, 1);
}

#[test]
fn error_display_includes_location_and_backtrace() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("bad.lyc"), "\n`undef GONE\n").unwrap();
    let err = preprocess("`include \"./bad.lyc\"\n", config_at(tmp.path())).unwrap_err();
    let rendered = err.to_string();
    assert!(rendered.contains("bad.lyc:2:"), "{rendered}");
    assert!(rendered.contains("included from"), "{rendered}");
}
