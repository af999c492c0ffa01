//! End-to-end scenarios: forms in, Dart text out.

use pretty_assertions::assert_eq;

use lotus::analyze::{self, Env};
use lotus::context::CompilerContext;
use lotus::emit;
use lotus::error::ErrorKind;
use lotus::form::build::*;
use lotus::form::Form;
use lotus::nses::{DefKind, DefRecord, CORE_LIB, CORE_NS};

fn ctx() -> CompilerContext {
    let mut ctx = CompilerContext::new();
    ctx.nses.in_ns("app.main");
    ctx
}

/// A context where the given names are known top-level Dart functions.
fn ctx_with_fns(names: &[&str]) -> CompilerContext {
    let mut ctx = ctx();
    for name in names {
        ctx.nses.define(name, DefRecord::predeclaration(name, DefKind::DartFn));
    }
    ctx
}

fn core_alias(ctx: &mut CompilerContext) -> String {
    ctx.nses.ensure_import(CORE_LIB, Some(CORE_NS))
}

fn emit_stmt(ctx: &mut CompilerContext, form: Form) -> String {
    let ir = ctx
        .with_gensym_scope(|ctx| analyze::analyze(ctx, &Env::default(), &form))
        .unwrap();
    let alias = core_alias(ctx);
    emit::render_statement(&ir, &alias)
}

fn emit_ret(ctx: &mut CompilerContext, form: Form) -> String {
    let ir = ctx
        .with_gensym_scope(|ctx| analyze::analyze(ctx, &Env::default(), &form))
        .unwrap();
    let alias = core_alias(ctx);
    emit::render_return(&ir, &alias)
}

fn emit_err(ctx: &mut CompilerContext, form: Form) -> ErrorKind {
    ctx.with_gensym_scope(|ctx| analyze::analyze(ctx, &Env::default(), &form))
        .unwrap_err()
        .kind
}

fn def_source(ctx: &CompilerContext, short: &str) -> String {
    ctx.nses
        .lookup_def("app.main", short)
        .unwrap_or_else(|| panic!("no definition named {}", short))
        .source
        .clone()
}

// =============================================================================
// Scenario 1: nested let + method call

#[test]
fn nested_let_flattens_into_statements() {
    let mut ctx = ctx();
    let form = list([
        sym("let*"),
        vector([sym("x"), int(1)]),
        list([
            sym("let*"),
            vector([sym("y"), int(2)]),
            list([sym("."), sym("x"), sym("+"), sym("y")]),
        ]),
    ]);
    assert_eq!(
        emit_stmt(&mut ctx, form.clone()),
        "var x$1 = 1;\nvar y$1 = 2;\n(x$1)+(y$1);\n"
    );
    assert_eq!(
        emit_ret(&mut ctx, form),
        "var x$1 = 1;\nvar y$1 = 2;\nreturn (x$1)+(y$1);\n"
    );
}

// =============================================================================
// Scenario 2: if with compound test

#[test]
fn compound_if_test_is_lifted_and_null_checked() {
    let mut ctx = ctx_with_fns(&["foo"]);
    let form = list([sym("if"), list([sym("foo")]), string("y"), string("n")]);
    assert_eq!(
        emit_ret(&mut ctx, form),
        "var t$1 = foo();\nif (t$1 != false && t$1 != null) {\n  return \"y\";\n}\nreturn \"n\";\n"
    );
}

#[test]
fn boolean_test_stays_inline() {
    let mut ctx = ctx();
    // (let* [a 1 b 2] (if (. a < b) "y" "n"))
    let form = list([
        sym("let*"),
        vector([sym("a"), int(1), sym("b"), int(2)]),
        list([
            sym("if"),
            list([sym("."), sym("a"), sym("<"), sym("b")]),
            string("y"),
            string("n"),
        ]),
    ]);
    assert_eq!(
        emit_ret(&mut ctx, form),
        "var a$1 = 1;\nvar b$1 = 2;\nif ((a$1)<(b$1)) {\n  return \"y\";\n}\nreturn \"n\";\n"
    );
}

#[test]
fn typed_locals_shrink_the_condition() {
    let mut ctx = ctx();
    let tagged_bool = list([
        sym("let*"),
        vector([tagged_sym("bool", "b"), boolean(true)]),
        list([sym("if"), sym("b"), int(1), int(2)]),
    ]);
    assert_eq!(
        emit_ret(&mut ctx, tagged_bool),
        "var b$1 = true;\nif (b$1) {\n  return 1;\n}\nreturn 2;\n"
    );

    let tagged_string = list([
        sym("let*"),
        vector([tagged_sym("String", "s"), string("x")]),
        list([sym("if"), sym("s"), int(1), int(2)]),
    ]);
    assert_eq!(
        emit_ret(&mut ctx, tagged_string),
        "var s$1 = \"x\";\nif (s$1 != null) {\n  return 1;\n}\nreturn 2;\n"
    );
}

// =============================================================================
// Scenario 3: try/catch with rethrow

#[test]
fn rethrow_of_the_caught_exception() {
    let mut ctx = ctx_with_fns(&["f"]);
    let form = list([
        sym("try"),
        list([sym("f")]),
        list([sym("catch"), sym("StateError"), sym("e"), list([sym("throw"), sym("e")])]),
    ]);
    let out = emit_stmt(&mut ctx, form);
    assert!(out.starts_with("try {\n"), "{}", out);
    assert!(out.contains("} on StateError catch (e$1) {\n  rethrow;\n}"), "{}", out);
}

#[test]
fn catch_can_bind_the_stack_trace() {
    let mut ctx = ctx_with_fns(&["f", "g"]);
    let form = list([
        sym("try"),
        list([sym("f")]),
        list([
            sym("catch"),
            sym("Object"),
            sym("e"),
            sym("st"),
            list([sym("g"), sym("st")]),
        ]),
    ]);
    let out = emit_stmt(&mut ctx, form);
    assert!(out.contains("} on Object catch (e$1, st$1) {"), "{}", out);
    assert!(out.contains("g(st$1);"), "{}", out);
}

// =============================================================================
// Scenario 4: recur with dependent rebinds

#[test]
fn recur_computes_before_reassigning() {
    let mut ctx = ctx();
    let form = list([
        sym("loop*"),
        vector([sym("a"), int(0), sym("b"), int(1)]),
        list([
            sym("recur"),
            sym("b"),
            list([sym("."), sym("a"), sym("+"), sym("b")]),
        ]),
    ]);
    assert_eq!(
        emit_stmt(&mut ctx, form),
        "var a$1 = 0;\nvar b$1 = 1;\ndo {\n  var t$r1 = b$1;\n  var t$r2 = (a$1)+(b$1);\n  a$1 = t$r1;\n  b$1 = t$r2;\n  continue;\n} while (true);\n"
    );
}

#[test]
fn independent_recur_assigns_directly() {
    let mut ctx = ctx_with_fns(&["f"]);
    // (loop* [n 0] (if (. n < 10) (recur (. n + 1)) n))
    let form = list([
        sym("loop*"),
        vector([sym("n"), int(0)]),
        list([
            sym("if"),
            list([sym("."), sym("n"), sym("<"), int(10)]),
            list([sym("recur"), list([sym("."), sym("n"), sym("+"), int(1)])]),
            sym("n"),
        ]),
    ]);
    let out = emit_ret(&mut ctx, form);
    assert_eq!(
        out,
        "var n$1 = 0;\ndo {\n  if ((n$1)<(10)) {\n    n$1 = (n$1)+(1);\n    continue;\n  }\n  return n$1;\n} while (true);\n"
    );
}

#[test]
fn loop_without_recur_is_just_bindings() {
    let mut ctx = ctx();
    let form = list([sym("loop*"), vector([sym("x"), int(1)]), sym("x")]);
    assert_eq!(emit_ret(&mut ctx, form), "var x$1 = 1;\nreturn x$1;\n");
}

// =============================================================================
// Scenario 5: variadic dispatch

fn def_variadic(ctx: &mut CompilerContext) {
    // (def f (fn* ([] 0) ([a] 1) ([a b & rest] 2)))
    let form = list([
        sym("def"),
        sym("f"),
        list([
            sym("fn*"),
            list([vector([]), int(0)]),
            list([vector([sym("a")]), int(1)]),
            list([vector([sym("a"), sym("b"), sym("&"), sym("rest")]), int(2)]),
        ]),
    ]);
    analyze::compile_top(ctx, &form).unwrap();
}

#[test]
fn variadic_fn_synthesizes_the_dispatch_class() {
    let mut ctx = ctx();
    def_variadic(&mut ctx);

    let cls = def_source(&ctx, "_f$1");
    assert!(cls.contains("class _f$1 implements core.IFn {"), "{}", cls);
    assert!(cls.contains("dynamic $_invoke$0() {"), "{}", cls);
    assert!(cls.contains("dynamic $_invoke$1("), "{}", cls);
    assert!(cls.contains("dynamic $_invoke$vararg("), "{}", cls);
    // base-arity trampoline passes an empty rest
    assert!(cls.contains("core.emptySeq()"), "{}", cls);
    // higher trampolines pack the extras
    assert!(cls.contains("core.seqOf(["), "{}", cls);
    // the overflow method unpacks into the variadic body
    assert!(cls.contains("dynamic $_invoke_more("), "{}", cls);
    assert!(cls.contains("core.seqConcat(["), "{}", cls);
    // callable with sentinel-defaulted optionals
    assert!(cls.contains("dynamic call(["), "{}", cls);
    assert!(cls.contains("core.MISSING_ARG"), "{}", cls);
    assert!(cls.contains("noSuchMethod"), "{}", cls);

    let field = def_source(&ctx, "f");
    assert_eq!(field, "final f = (_f$1() as core.IFn);\n");
}

#[test]
fn calls_to_the_fn_object_dispatch_by_arity() {
    let mut ctx = ctx();
    def_variadic(&mut ctx);

    let zero = emit_stmt(&mut ctx, list([sym("f")]));
    assert_eq!(zero, "(f as core.IFn).$_invoke$0();\n");

    let four = emit_stmt(&mut ctx, list([sym("f"), int(1), int(2), int(3), int(4)]));
    assert_eq!(four, "(f as core.IFn).$_invoke$4(1, 2, 3, 4);\n");

    let many: Vec<Form> = std::iter::once(sym("f")).chain((0..11).map(int)).collect();
    let overflow = emit_stmt(&mut ctx, Form::Seq(many));
    assert_eq!(
        overflow,
        "(f as core.IFn).$_invoke_more(0, 1, 2, 3, 4, 5, 6, 7, 8, [9, 10]);\n"
    );
}

#[test]
fn simple_fn_defs_become_top_level_functions() {
    let mut ctx = ctx();
    let form = list([
        sym("def"),
        sym("twice"),
        list([
            sym("fn*"),
            vector([sym("x")]),
            list([sym("."), sym("x"), sym("+"), sym("x")]),
        ]),
    ]);
    analyze::compile_top(&mut ctx, &form).unwrap();
    assert_eq!(
        def_source(&ctx, "twice"),
        "dynamic twice(x$1) {\n  return (x$1)+(x$1);\n}\n"
    );

    // calls go direct
    assert_eq!(emit_stmt(&mut ctx, list([sym("twice"), int(3)])), "twice(3);\n");
}

// =============================================================================
// Scenario 6: keyword literal

#[test]
fn keywords_intern_through_the_runtime() {
    let mut ctx = ctx();
    assert_eq!(
        emit_stmt(&mut ctx, qkw("foo", "bar")),
        "core.Keyword.intern(\"foo\", \"bar\");\n"
    );
    assert_eq!(
        emit_stmt(&mut ctx, kw("solo")),
        "core.Keyword.intern(null, \"solo\");\n"
    );
}

// =============================================================================
// Source-order evaluation

#[test]
fn argument_side_effects_keep_source_order() {
    let mut ctx = ctx_with_fns(&["h", "f"]);
    // (h (f) (if (f) 1 2)): once the second argument needs a binding, the
    // first one is forced into a temporary too, ahead of it.
    let form = list([
        sym("h"),
        list([sym("f")]),
        list([sym("if"), list([sym("f")]), int(1), int(2)]),
    ]);
    assert_eq!(
        emit_stmt(&mut ctx, form),
        "var t$3 = f();\nvar t$1 = f();\nvar t$2;\nif (t$1 != false && t$1 != null) {\n  t$2 = 1;\n} else {\n  t$2 = 2;\n}\nh(t$3, t$2);\n"
    );
}

#[test]
fn plain_nested_calls_stay_inline() {
    let mut ctx = ctx_with_fns(&["h", "f", "g"]);
    let form = list([sym("h"), list([sym("f")]), list([sym("g")])]);
    assert_eq!(emit_stmt(&mut ctx, form), "h(f(), g());\n");
}

#[test]
fn method_receiver_is_evaluated_once() {
    let mut ctx = ctx_with_fns(&["f"]);
    let form = list([sym("."), list([sym("f")]), sym("toString")]);
    assert_eq!(emit_stmt(&mut ctx, form), "(f()).toString();\n");
}

#[test]
fn named_arguments_follow_positionals() {
    let mut ctx = ctx_with_fns(&["f"]);
    let form = list([
        sym("let*"),
        vector([sym("o"), list([sym("f")])]),
        list([
            sym("."),
            sym("o"),
            sym("m"),
            int(1),
            sym(".&"),
            kw("opt"),
            int(2),
        ]),
    ]);
    assert_eq!(emit_stmt(&mut ctx, form), "var o$1 = f();\no$1.m(1, opt: 2);\n");
}

// =============================================================================
// Aggregates and literals

#[test]
fn collection_literals_build_persistent_collections() {
    let mut ctx = ctx_with_fns(&["f"]);
    assert_eq!(
        emit_stmt(&mut ctx, vector([int(1), list([sym("f")])])),
        "core.PersistentVector.of([1, f()]);\n"
    );
    assert_eq!(
        emit_stmt(&mut ctx, map([(kw("a"), int(1))])),
        "core.PersistentMap.fromPairs([core.Keyword.intern(null, \"a\"), 1]);\n"
    );
    assert_eq!(
        emit_stmt(&mut ctx, set([int(1), int(2)])),
        "core.PersistentSet.of([1, 2]);\n"
    );
}

#[test]
fn dart_tagged_vector_is_a_native_list() {
    let mut ctx = ctx();
    assert_eq!(emit_stmt(&mut ctx, tagged("dart", vector([int(1), int(2)]))), "[1, 2];\n");

    let err = emit_err(&mut ctx, tagged("mystery", vector([])));
    assert!(matches!(err, ErrorKind::UnsupportedLiteral(_)));
}

#[test]
fn quoted_symbols_intern_and_collections_refuse() {
    let mut ctx = ctx();
    assert_eq!(
        emit_stmt(&mut ctx, list([sym("quote"), qsym("a", "b")])),
        "core.Symbol.intern(\"a\", \"b\");\n"
    );
    let err = emit_err(&mut ctx, list([sym("quote"), vector([int(1)])]));
    assert!(matches!(err, ErrorKind::UnsupportedLiteral(_)));
}

#[test]
fn case_star_switches_on_constants() {
    let mut ctx = ctx();
    // (let* [x 1] (case* x (1 2) "low" 3 "three" "other"))
    let form = list([
        sym("let*"),
        vector([sym("x"), int(1)]),
        list([
            sym("case*"),
            sym("x"),
            list([int(1), int(2)]),
            string("low"),
            int(3),
            string("three"),
            string("other"),
        ]),
    ]);
    assert_eq!(
        emit_ret(&mut ctx, form),
        "var x$1 = 1;\nswitch (x$1) {\n  case 1:\n  case 2:\n    return \"low\";\n  case 3:\n    return \"three\";\n  default:\n    return \"other\";\n}\n"
    );
}

#[test]
fn case_with_default_switches_on_the_expression_directly() {
    let mut ctx = ctx_with_fns(&["f"]);
    // odd clause count (trailing default): no binding around the scrutinee
    let form = list([
        sym("case"),
        list([sym("f")]),
        int(1),
        string("a"),
        string("d"),
    ]);
    assert_eq!(
        emit_ret(&mut ctx, form),
        "switch (f()) {\n  case 1:\n    return \"a\";\n  default:\n    return \"d\";\n}\n"
    );
}

// =============================================================================
// Protocols and classes

fn def_greet_protocol(ctx: &mut CompilerContext) {
    let form = list([
        sym("defprotocol"),
        sym("Greet"),
        list([sym("hello"), vector([sym("this")]), vector([sym("this"), sym("name")])]),
    ]);
    analyze::compile_top(ctx, &form).unwrap();
}

#[test]
fn defprotocol_emits_marker_interface_and_dispatch() {
    let mut ctx = ctx();
    def_greet_protocol(&mut ctx);

    let iface = def_source(&ctx, "Greet");
    assert!(iface.contains("abstract class Greet {"), "{}", iface);
    assert!(iface.contains("dynamic hello$0();"), "{}", iface);
    assert!(iface.contains("dynamic hello$1("), "{}", iface);

    // the dispatch fn is a two-arity fn object testing the marker interface
    let dispatch = def_source(&ctx, "_hello$1");
    assert!(dispatch.contains("is Greet"), "{}", dispatch);
    assert!(dispatch.contains(".hello$0()"), "{}", dispatch);
    assert!(dispatch.contains("UnsupportedError"), "{}", dispatch);

    assert!(
        ctx.nses
            .resolve_protocol_method("app.main", "Greet", "hello", 2)
            .is_some()
    );
}

#[test]
fn deftype_implements_protocol_methods_by_table() {
    let mut ctx = ctx();
    def_greet_protocol(&mut ctx);

    let form = list([
        sym("deftype"),
        sym("Person"),
        vector([sym("nm")]),
        sym("Greet"),
        list([
            sym("hello"),
            vector([sym("this")]),
            list([sym("."), sym("nm"), sym("toString")]),
        ]),
        list([sym("hello"), vector([sym("this"), sym("greeting")]), sym("greeting")]),
    ]);
    analyze::compile_top(&mut ctx, &form).unwrap();

    let cls = def_source(&ctx, "Person");
    assert!(cls.contains("class Person implements Greet {"), "{}", cls);
    assert!(cls.contains("final nm;"), "{}", cls);
    assert!(cls.contains("Person(this.nm);"), "{}", cls);
    assert!(cls.contains("dynamic hello$0() {"), "{}", cls);
    assert!(cls.contains("dynamic hello$1(greeting$1) {"), "{}", cls);
    assert!(
        cls.contains("dynamic noSuchMethod(Invocation invocation) => super.noSuchMethod(invocation);"),
        "{}",
        cls
    );

    // the factory produced by the deftype macro
    let factory = def_source(&ctx, "->Person");
    assert!(factory.contains("dynamic $_$GT_Person(nm$1) {"), "{}", factory);
    assert!(factory.contains("return Person(nm$1);"), "{}", factory);
}

#[test]
fn mutable_fields_accept_set() {
    let mut ctx = ctx();
    let form = list([
        sym("deftype"),
        sym("Counter"),
        vector([{
            // ^int ^:mutable n
            let mut meta = lotus::form::Meta::new();
            meta.insert(lotus::form::Keyword::simple("mutable"), boolean(true));
            meta.insert(lotus::form::Keyword::simple("tag"), sym("int"));
            Form::Symbol(lotus::form::Symbol::simple("n").with_meta(meta))
        }]),
        list([
            sym("bump"),
            vector([sym("this")]),
            list([sym("set!"), sym("n"), list([sym("."), sym("n"), sym("+"), int(1)])]),
        ]),
    ]);
    analyze::compile_top(&mut ctx, &form).unwrap();

    let cls = def_source(&ctx, "Counter");
    assert!(cls.contains("int n;"), "{}", cls);
    assert!(cls.contains("return n = (n)+(1);"), "{}", cls);
}

#[test]
fn reify_captures_its_closure() {
    let mut ctx = ctx();
    def_greet_protocol(&mut ctx);

    let form = list([
        sym("let*"),
        vector([sym("x"), int(1)]),
        list([
            sym("reify"),
            sym("Greet"),
            list([sym("hello"), vector([sym("this")]), sym("x")]),
            list([sym("hello"), vector([sym("this"), sym("name")]), sym("x")]),
        ]),
    ]);
    let out = emit_stmt(&mut ctx, form);
    assert_eq!(out, "var x$1 = 1;\n_reify$1(x$1);\n");

    let cls = def_source(&ctx, "_reify$1");
    assert!(cls.contains("class _reify$1 implements Greet {"), "{}", cls);
    assert!(cls.contains("final x$1;"), "{}", cls);
    assert!(cls.contains("_reify$1(this.x$1);"), "{}", cls);
    assert!(cls.contains("dynamic hello$0() {\n    return x$1;\n  }"), "{}", cls);
}

// =============================================================================
// Namespaces and imports

#[test]
fn ns_requires_set_up_aliases_and_refers() {
    let mut ctx = CompilerContext::new();
    analyze::compile_top(
        &mut ctx,
        &list([
            sym("ns"),
            sym("app.main"),
            list([
                kw("require"),
                vector([sym("app.util"), kw("as"), sym("u"), kw("refer"), vector([sym("helper")])]),
                vector([string("dart:math"), kw("as"), sym("m")]),
            ]),
        ]),
    )
    .unwrap();

    assert_eq!(ctx.nses.current_name(), "app.main");
    // alias call goes straight through the dart import
    assert_eq!(
        emit_stmt(&mut ctx, list([qsym("m", "max"), int(1), int(2)])),
        "math.max(1, 2);\n"
    );

    let err = ctx
        .with_gensym_scope(|ctx| {
            analyze::compile_top(
                ctx,
                &list([sym("ns"), sym("app.other"), list([kw("import"), sym("x")])]),
            )
        })
        .unwrap_err();
    assert!(matches!(err.kind, ErrorKind::UnsupportedImportSpec));
}

// =============================================================================
// Error taxonomy

#[test]
fn unknown_symbol_reports_the_form() {
    let mut ctx = ctx();
    let err = emit_err(&mut ctx, list([sym("nope"), int(1)]));
    assert!(matches!(err, ErrorKind::UnknownSymbol(name) if name == "nope"));
}

#[test]
fn unknown_type_tag() {
    let mut ctx = ctx();
    let form = list([
        sym("let*"),
        vector([tagged_sym("Gizmo", "g"), int(1)]),
        sym("g"),
    ]);
    let err = emit_err(&mut ctx, form);
    assert!(matches!(err, ErrorKind::UnknownTypeTag(tag) if tag == "Gizmo"));
}

#[test]
fn set_on_immutable_local_is_rejected() {
    let mut ctx = ctx();
    let form = list([
        sym("let*"),
        vector([sym("x"), int(1)]),
        list([sym("set!"), sym("x"), int(2)]),
    ]);
    assert!(matches!(emit_err(&mut ctx, form), ErrorKind::BadAssignment(_)));
}

#[test]
fn recur_validation() {
    let mut ctx = ctx();

    let across_try = list([
        sym("loop*"),
        vector([sym("x"), int(1)]),
        list([sym("try"), list([sym("recur"), sym("x")])]),
    ]);
    assert!(matches!(emit_err(&mut ctx, across_try), ErrorKind::RecurAcrossTry));

    let outside_tail = list([
        sym("loop*"),
        vector([sym("x"), int(1)]),
        list([sym("do"), list([sym("recur"), sym("x")]), nil()]),
    ]);
    assert!(matches!(emit_err(&mut ctx, outside_tail), ErrorKind::RecurOutsideTail));

    let arity = list([
        sym("loop*"),
        vector([sym("x"), int(1)]),
        list([sym("recur"), int(1), int(2)]),
    ]);
    assert!(matches!(
        emit_err(&mut ctx, arity),
        ErrorKind::RecurArityMismatch { expected: 1, got: 2 }
    ));
}

#[test]
fn doc_string_position_is_checked() {
    let mut ctx = ctx();
    let form = list([sym("def"), sym("x"), int(5), int(6)]);
    let err = analyze::compile_top(&mut ctx, &form).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::DocStringMisplaced("number")));

    let ok = list([sym("def"), sym("y"), string("docs"), int(6)]);
    analyze::compile_top(&mut ctx, &ok).unwrap();
    let source = def_source(&ctx, "y");
    assert_eq!(source, "/// docs\nfinal y = 6;\n");
}

#[test]
fn throw_in_operand_position_becomes_a_statement() {
    let mut ctx = ctx_with_fns(&["f"]);
    // (f (throw (new StateError "boom")))
    let form = list([
        sym("f"),
        list([sym("throw"), list([sym("new"), sym("StateError"), string("boom")])]),
    ]);
    assert_eq!(
        emit_stmt(&mut ctx, form),
        "throw StateError(\"boom\");\nf(null);\n"
    );
}

// =============================================================================
// Test-tooling macros end to end

#[test]
fn deftest_and_runner_compile_to_plain_functions() {
    let mut ctx = ctx();
    analyze::compile_top(
        &mut ctx,
        &list([
            sym("deftest"),
            sym("arithmetic"),
            list([sym("is"), list([sym("."), int(1), sym("=="), int(1)])]),
        ]),
    )
    .unwrap();
    let test_fn = def_source(&ctx, "arithmetic");
    assert!(test_fn.contains("dynamic arithmetic() {"), "{}", test_fn);
    assert!(test_fn.contains("StateError"), "{}", test_fn);
    assert!(test_fn.contains("rethrow"), "{}", test_fn);

    analyze::compile_top(&mut ctx, &list([sym("defrunner-main")])).unwrap();
    let main = def_source(&ctx, "main");
    assert!(main.contains("dynamic main() {"), "{}", main);
    assert!(main.contains("arithmetic()"), "{}", main);
}
