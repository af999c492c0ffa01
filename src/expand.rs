//! The macro expander.
//!
//! [`expand1`] applies one layer of rewriting; [`expand`] is its fixpoint.
//! The macro set is closed: only the builtins below exist, each implemented
//! as a plain function over the form's tail.  Macros receive an empty lexical
//! environment and must not depend on one; the environment parameter of
//! `expand1` exists purely so that locally shadowed head symbols suppress
//! expansion.

use crate::analyze::Env;
use crate::context::CompilerContext;
use crate::error::{CompileError, ErrorKind, Result};
use crate::form::build::*;
use crate::form::{Form, Keyword, Meta, Symbol};
use crate::ident::munge;

/// Head symbols the expander leaves for the analyzer.
pub const SPECIAL_FORMS: &[&str] = &[
    ".", "set!", "throw", "new", "ns", "try", "case*", "quote", "do", "let*",
    "loop*", "recur", "if", "fn*", "def", "reify*", "deftype*", "is?",
];

pub fn is_special(name: &str) -> bool {
    SPECIAL_FORMS.contains(&name)
}

/// Names of the builtin macro set, seeded into the core namespace.
pub const BUILTIN_MACROS: &[&str] = &[
    "reify", "deftype", "definterface", "defprotocol", "case", "are", "is",
    "testing", "deftest", "try-expr", "defrunner-main",
];

/// Expand until a fixpoint is reached.
pub fn expand(ctx: &mut CompilerContext, env: &Env, form: Form) -> Result<Form> {
    let mut form = form;
    while let Some(next) = expand1(ctx, env, &form)? {
        form = next;
    }
    Ok(form)
}

/// Apply one layer of rewriting, or return `None` when the form is already
/// fully expanded at its head.
pub fn expand1(ctx: &mut CompilerContext, env: &Env, form: &Form) -> Result<Option<Form>> {
    let items = match form.as_seq() {
        Some(items) => items,
        None => return Ok(None),
    };
    let head = match items.first().and_then(|f| f.as_symbol()) {
        Some(head) => head.clone(),
        None => return Ok(None),
    };

    if env.binds(&head.name) {
        return Ok(None);
    }
    if head.ns.is_none() && is_special(&head.name) {
        return Ok(None);
    }

    // (X. args) -> (new X args)
    if head.name.len() > 1 && head.name.ends_with('.') {
        let class = Symbol {
            ns: head.ns.clone(),
            name: head.name[..head.name.len() - 1].into(),
            meta: None,
        };
        let mut out = vec![sym("new"), Form::Symbol(class)];
        out.extend(items[1..].iter().cloned());
        return Ok(Some(Form::Seq(out)));
    }

    // (.m o args) -> (. o m args)
    if head.name.len() > 1 && head.name.starts_with('.') && !head.name.starts_with("..") {
        if items.len() < 2 {
            err_malformed("method call", "expected (.member obj args...)", form)?;
        }
        let member = Symbol::simple(&head.name[1..]);
        let mut out = vec![sym("."), items[1].clone(), Form::Symbol(member)];
        out.extend(items[2..].iter().cloned());
        return Ok(Some(Form::Seq(out)));
    }

    if let Some(name) = ctx.nses.macro_ref(&head) {
        let out = apply_builtin(ctx, &name, &items[1..], form)?;
        return Ok(Some(out));
    }

    Ok(None)
}

fn err_malformed(what: &'static str, reason: &'static str, form: &Form) -> Result<()> {
    Err(CompileError::new(ErrorKind::MalformedForm { form: what, reason }, form))
}

fn apply_builtin(
    ctx: &mut CompilerContext,
    name: &str,
    tail: &[Form],
    whole: &Form,
) -> Result<Form> {
    match name {
        "reify" => Ok(list([sym("reify*")].into_iter().chain(tail.iter().cloned()))),
        "deftype" => expand_deftype(tail, whole),
        "definterface" => expand_definterface(tail, whole),
        "defprotocol" => expand_defprotocol(ctx, tail, whole),
        "case" => expand_case(ctx, tail, whole),
        "is" => expand_is(tail, whole),
        "try-expr" => expand_try_expr(ctx, tail, whole),
        "are" => expand_are(tail, whole),
        "testing" => expand_testing(tail, whole),
        "deftest" => expand_deftest(tail, whole),
        "defrunner-main" => Ok(expand_defrunner_main(ctx)),
        other => panic!("unregistered builtin macro '{}'. This is a bug!", other),
    }
}

// =============================================================================
// Individual rewrites

/// `(case scrut clauses.. default?)`: goes straight to `case*` when the
/// scrutinee is a symbol, or when the clause count is odd (a trailing
/// default is present); any other shape binds the scrutinee first.
fn expand_case(ctx: &mut CompilerContext, tail: &[Form], whole: &Form) -> Result<Form> {
    let scrut = match tail.first() {
        Some(s) => s.clone(),
        None => {
            err_malformed("case", "missing scrutinee", whole)?;
            unreachable!()
        }
    };
    let has_default = (tail.len() - 1) % 2 == 1;
    if scrut.as_symbol().is_some() || has_default {
        return Ok(list([sym("case*")].into_iter().chain(tail.iter().cloned())));
    }
    let bound = Symbol::simple(&ctx.gensym_form("scrut"));
    let mut case_form = vec![sym("case*"), Form::Symbol(bound.clone())];
    case_form.extend(tail[1..].iter().cloned());
    Ok(list([
        sym("let*"),
        vector([Form::Symbol(bound), scrut]),
        Form::Seq(case_form),
    ]))
}

/// `(is form msg?)` -> `(try-expr msg form)`
fn expand_is(tail: &[Form], whole: &Form) -> Result<Form> {
    match tail {
        [form] => Ok(list([sym("try-expr"), nil(), form.clone()])),
        [form, msg] => Ok(list([sym("try-expr"), msg.clone(), form.clone()])),
        _ => {
            err_malformed("is", "expected (is form msg?)", whole)?;
            unreachable!()
        }
    }
}

/// `(try-expr msg form)`: evaluate the assertion; a falsy result or a thrown
/// error both surface as a `StateError` naming the original form.
fn expand_try_expr(ctx: &mut CompilerContext, tail: &[Form], whole: &Form) -> Result<Form> {
    let (msg, form) = match tail {
        [msg, form] => (msg.clone(), form.clone()),
        _ => {
            err_malformed("try-expr", "expected (try-expr msg form)", whole)?;
            unreachable!()
        }
    };
    let label = match msg.as_str() {
        Some(m) => format!("{}: {}", m, form),
        None => format!("{}", form),
    };
    let fail_msg = format!("assertion failed: {}", label);
    let err_msg = format!("error during assertion: {}", label);

    let value = sym(&ctx.gensym_form("value"));
    let caught = sym(&ctx.gensym_form("e"));
    Ok(list([
        sym("try"),
        list([
            sym("let*"),
            vector([value.clone(), form]),
            list([
                sym("if"),
                value.clone(),
                value,
                list([sym("throw"), list([sym("new"), sym("StateError"), string(&fail_msg)])]),
            ]),
        ]),
        list([
            sym("catch"),
            sym("StateError"),
            caught.clone(),
            list([sym("throw"), caught.clone()]),
        ]),
        list([
            sym("catch"),
            sym("Object"),
            caught.clone(),
            list([
                sym("throw"),
                list([
                    sym("new"),
                    sym("StateError"),
                    list([
                        sym("."),
                        string(&format!("{}: ", err_msg)),
                        sym("+"),
                        list([sym("."), caught, sym("toString")]),
                    ]),
                ]),
            ]),
        ]),
    ]))
}

/// `(are argv expr & args)`: substitute each row of `args` into `expr` and
/// assert every instance.
fn expand_are(tail: &[Form], whole: &Form) -> Result<Form> {
    let (argv, expr, args) = match tail {
        [argv, expr, args @ ..] => (argv, expr, args),
        _ => {
            err_malformed("are", "expected (are argv expr & args)", whole)?;
            unreachable!()
        }
    };
    let slots: Vec<Symbol> = argv
        .as_vector()
        .map(|items| items.iter().filter_map(|f| f.as_symbol().cloned()).collect())
        .unwrap_or_default();
    if slots.is_empty()
        || argv.as_vector().map_or(true, |v| v.len() != slots.len())
        || args.len() % slots.len() != 0
    {
        return Err(CompileError::new(
            ErrorKind::AreArityMismatch { argv: slots.len(), args: args.len() },
            whole,
        ));
    }

    let mut body = vec![sym("do")];
    for row in args.chunks(slots.len()) {
        let filled = substitute(expr, &slots, row);
        body.push(list([sym("is"), filled]));
    }
    Ok(Form::Seq(body))
}

/// Symbol-for-form substitution used by `are` templates.
fn substitute(form: &Form, slots: &[Symbol], row: &[Form]) -> Form {
    if let Some(s) = form.as_symbol() {
        if let Some(i) = slots.iter().position(|slot| slot == s) {
            return row[i].clone();
        }
    }
    match form {
        Form::Seq(items) => Form::Seq(items.iter().map(|f| substitute(f, slots, row)).collect()),
        Form::Vector(items) => {
            Form::Vector(items.iter().map(|f| substitute(f, slots, row)).collect())
        }
        Form::Map(pairs) => Form::Map(
            pairs
                .iter()
                .map(|(k, v)| (substitute(k, slots, row), substitute(v, slots, row)))
                .collect(),
        ),
        Form::Set(items) => Form::Set(items.iter().map(|f| substitute(f, slots, row)).collect()),
        Form::WithMeta(meta, inner) => {
            Form::WithMeta(meta.clone(), Box::new(substitute(inner, slots, row)))
        }
        other => other.clone(),
    }
}

/// `(testing "desc" & body)` -> `(do & body)`
fn expand_testing(tail: &[Form], whole: &Form) -> Result<Form> {
    if tail.is_empty() {
        err_malformed("testing", "expected (testing desc & body)", whole)?;
    }
    Ok(list([sym("do")].into_iter().chain(tail[1..].iter().cloned())))
}

/// `(deftest name & body)` -> `(def ^:test name (fn* [] (do & body)))`
fn expand_deftest(tail: &[Form], whole: &Form) -> Result<Form> {
    let (name, body) = match tail {
        [name, body @ ..] => match name.as_symbol() {
            Some(name) => (name.clone(), body),
            None => {
                err_malformed("deftest", "test name must be a symbol", whole)?;
                unreachable!()
            }
        },
        _ => {
            err_malformed("deftest", "expected (deftest name & body)", whole)?;
            unreachable!()
        }
    };
    let mut meta = Meta::new();
    meta.insert(Keyword::simple("test"), Form::Bool(true));
    let tagged_name = Form::Symbol(name.with_meta(meta));
    Ok(list([
        sym("def"),
        tagged_name,
        list([
            sym("fn*"),
            vector([]),
            list([sym("do")].into_iter().chain(body.iter().cloned())),
        ]),
    ]))
}

/// `(defrunner-main)`: a `main` calling every `deftest` in the namespace.
fn expand_defrunner_main(ctx: &mut CompilerContext) -> Form {
    let tests: Vec<Form> = ctx
        .nses
        .current()
        .defs
        .iter()
        .filter(|(_, def)| def.meta.is_test)
        .map(|(short, _)| list([sym(short)]))
        .collect();
    list([
        sym("def"),
        sym("main"),
        list([
            sym("fn*"),
            vector([]),
            list([sym("do")].into_iter().chain(tests)),
        ]),
    ])
}

/// `(deftype Name [fields] & opts+specs)`: the class itself plus the
/// `->Name` constructor factory.
fn expand_deftype(tail: &[Form], whole: &Form) -> Result<Form> {
    let (name, fields) = match tail {
        [name, fields, ..] if name.as_symbol().is_some() && fields.as_vector().is_some() => {
            (name.as_symbol().unwrap().clone(), fields.as_vector().unwrap())
        }
        _ => {
            err_malformed("deftype", "expected (deftype Name [fields] & specs)", whole)?;
            unreachable!()
        }
    };

    let mut star = vec![sym("deftype*")];
    star.extend(tail.iter().cloned());

    // factory params drop the field metadata; it only matters on the class.
    let factory_params: Vec<Form> = fields
        .iter()
        .filter_map(|f| f.as_symbol())
        .map(|s| Form::Symbol(Symbol::simple(&s.name)))
        .collect();
    let mut ctor_call = vec![sym("new"), Form::Symbol(name.clone())];
    ctor_call.extend(factory_params.iter().cloned());

    Ok(list([
        sym("do"),
        Form::Seq(star),
        list([
            sym("def"),
            sym(&format!("->{}", name.name)),
            list([
                sym("fn*"),
                Form::Vector(factory_params),
                Form::Seq(ctor_call),
            ]),
        ]),
    ]))
}

/// `(definterface I (m [a b]) ...)`: an abstract class with body-less
/// methods; the implicit receiver is added here.
fn expand_definterface(tail: &[Form], whole: &Form) -> Result<Form> {
    let name = match tail.first().and_then(|f| f.as_symbol()) {
        Some(name) => name.clone(),
        None => {
            err_malformed("definterface", "expected (definterface Name & sigs)", whole)?;
            unreachable!()
        }
    };
    let mut out = vec![sym("deftype*"), Form::Symbol(name), vector([]), kw("abstract"), boolean(true)];
    for sig in &tail[1..] {
        let items = match sig.as_seq() {
            Some(items) if !items.is_empty() => items,
            _ => {
                err_malformed("definterface", "method signature must be (name [params])", whole)?;
                unreachable!()
            }
        };
        let params = items.get(1).and_then(|f| f.as_vector()).unwrap_or(&[]);
        let mut with_this = vec![sym("this")];
        with_this.extend(params.iter().cloned());
        out.push(list([items[0].clone(), Form::Vector(with_this)]));
    }
    Ok(Form::Seq(out))
}

/// `(defprotocol P (m [this] [this a]) ...)`: a marker interface, the
/// per-method dispatch functions, and the arity table recorded in the
/// registry.
fn expand_defprotocol(ctx: &mut CompilerContext, tail: &[Form], whole: &Form) -> Result<Form> {
    use crate::nses::{DefKind, DefMeta, DefRecord, ProtocolMethod, ProtocolRecord};

    let proto = match tail.first().and_then(|f| f.as_symbol()) {
        Some(p) => p.clone(),
        None => {
            err_malformed("defprotocol", "expected (defprotocol Name & sigs)", whole)?;
            unreachable!()
        }
    };

    let mut record = ProtocolRecord::default();
    let mut iface_methods: Vec<Form> = vec![];
    let mut dispatch_defs: Vec<Form> = vec![];

    for sig in &tail[1..] {
        if sig.as_str().is_some() {
            continue; // docstring
        }
        let items = match sig.as_seq() {
            Some(items) if !items.is_empty() => items,
            _ => {
                err_malformed("defprotocol", "signature must be (name [this ...] ...)", whole)?;
                unreachable!()
            }
        };
        let mname = match items[0].as_symbol() {
            Some(m) => m.clone(),
            None => {
                err_malformed("defprotocol", "method name must be a symbol", whole)?;
                unreachable!()
            }
        };

        let mut bodies: Vec<Form> = vec![];
        for arity in &items[1..] {
            let params = match arity.as_vector() {
                Some(params) if !params.is_empty() => params,
                _ => {
                    err_malformed(
                        "defprotocol",
                        "method arity must be a non-empty parameter vector",
                        whole,
                    )?;
                    unreachable!()
                }
            };
            let dart_name = format!("{}${}", munge(&mname.name), params.len() - 1);
            let param_names: Vec<String> = params[1..]
                .iter()
                .filter_map(|f| f.as_symbol())
                .map(|s| s.name.to_string())
                .collect();
            record.methods.entry(mname.name.to_string()).or_default().insert(
                params.len(),
                ProtocolMethod { dart_name: dart_name.clone(), params: param_names },
            );

            // abstract method on the marker interface, with its final name
            let mut mmeta = Meta::new();
            mmeta.insert(Keyword::simple("dart-name"), string(&dart_name));
            iface_methods.push(list([
                Form::Symbol(Symbol::simple(&mname.name).with_meta(mmeta)),
                arity.clone(),
            ]));

            // one dispatch body per arity:
            //   ([this a] (if (is? this P) (. this m$1 a) (throw ...)))
            let this = params[0].clone();
            let mut direct = vec![
                sym("."),
                this.clone(),
                sym(&dart_name),
            ];
            direct.extend(params[1..].iter().cloned());
            let fallback = list([
                sym("throw"),
                list([
                    sym("new"),
                    sym("UnsupportedError"),
                    string(&format!(
                        "no implementation of protocol method {}.{} for this value",
                        proto.name, mname.name
                    )),
                ]),
            ]);
            bodies.push(list([
                Form::Vector(params.to_vec()),
                list([
                    sym("if"),
                    list([sym("is?"), this, Form::Symbol(proto.clone())]),
                    Form::Seq(direct),
                    fallback,
                ]),
            ]));
        }

        let mut fn_form = vec![sym("fn*"), Form::Symbol(Symbol::simple(&mname.name))];
        fn_form.extend(bodies);
        dispatch_defs.push(list([sym("def"), Form::Symbol(mname), Form::Seq(fn_form)]));
    }

    ctx.nses.define(
        &proto.name,
        DefRecord {
            dart_name: munge(&proto.name),
            kind: DefKind::Class,
            meta: DefMeta { protocol: Some(record), ..DefMeta::default() },
            source: String::new(),
        },
    );

    let mut iface = vec![
        sym("deftype*"),
        Form::Symbol(proto),
        vector([]),
        kw("abstract"),
        boolean(true),
    ];
    iface.extend(iface_methods);

    let mut out = vec![sym("do"), Form::Seq(iface)];
    out.extend(dispatch_defs);
    Ok(Form::Seq(out))
}

// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::Env;
    use crate::context::CompilerContext;

    fn ctx_in(ns: &str) -> CompilerContext {
        let mut ctx = CompilerContext::new();
        ctx.nses.in_ns(ns);
        ctx
    }

    fn expand_str(ctx: &mut CompilerContext, form: Form) -> String {
        let out = ctx
            .with_gensym_scope(|ctx| expand(ctx, &Env::default(), form))
            .unwrap();
        format!("{}", out)
    }

    #[test]
    fn non_seq_and_shadowed_heads_pass_through() {
        let mut ctx = ctx_in("app.main");
        assert!(expand1(&mut ctx, &Env::default(), &sym("case")).unwrap().is_none());

        use crate::ir::{DartId, DartType};
        let env = Env::default().bind("case", DartId::local("case$1", DartType::dynamic()));
        let shadowed = list([sym("case"), int(1)]);
        assert!(expand1(&mut ctx, &env, &shadowed).unwrap().is_none());
    }

    #[test]
    fn constructor_sugar() {
        let mut ctx = ctx_in("app.main");
        let out = expand_str(&mut ctx, list([sym("StringBuffer."), string("x")]));
        assert_eq!(out, r#"(new StringBuffer "x")"#);
    }

    #[test]
    fn method_sugar() {
        let mut ctx = ctx_in("app.main");
        let out = expand_str(&mut ctx, list([sym(".toString"), sym("x")]));
        assert_eq!(out, "(. x toString)");

        let field = expand_str(&mut ctx, list([sym(".-length"), sym("x")]));
        assert_eq!(field, "(. x -length)");
    }

    #[test]
    fn case_on_symbol_goes_straight_to_case_star() {
        let mut ctx = ctx_in("app.main");
        let out = expand_str(
            &mut ctx,
            list([sym("case"), sym("x"), int(1), string("a"), string("d")]),
        );
        assert_eq!(out, r#"(case* x 1 "a" "d")"#);
    }

    #[test]
    fn case_on_expression_with_default_goes_straight_to_case_star() {
        let mut ctx = ctx_in("app.main");
        let out = expand_str(
            &mut ctx,
            list([sym("case"), list([sym("f")]), int(1), string("a"), string("d")]),
        );
        assert_eq!(out, r#"(case* (f) 1 "a" "d")"#);
    }

    #[test]
    fn case_on_expression_without_default_binds_scrutinee() {
        let mut ctx = ctx_in("app.main");
        let out = expand_str(
            &mut ctx,
            list([sym("case"), list([sym("f")]), int(1), string("a"), int(2), string("b")]),
        );
        assert_eq!(out, r#"(let* [scrut__1 (f)] (case* scrut__1 1 "a" 2 "b"))"#);
    }

    #[test]
    fn are_builds_one_assertion_per_row() {
        let mut ctx = ctx_in("app.main");
        let form = list([
            sym("are"),
            vector([sym("x"), sym("y")]),
            list([sym("."), sym("x"), sym("=="), sym("y")]),
            int(1),
            int(1),
            int(2),
            int(2),
        ]);
        let out = ctx
            .with_gensym_scope(|ctx| expand1(ctx, &Env::default(), &form))
            .unwrap()
            .unwrap();
        assert_eq!(format!("{}", out), "(do (is (. 1 == 1)) (is (. 2 == 2)))");
    }

    #[test]
    fn are_rejects_ragged_rows() {
        let mut ctx = ctx_in("app.main");
        let form = list([
            sym("are"),
            vector([sym("x"), sym("y")]),
            sym("x"),
            int(1),
        ]);
        let err = ctx
            .with_gensym_scope(|ctx| expand(ctx, &Env::default(), form))
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::AreArityMismatch { .. }));
    }

    #[test]
    fn deftype_adds_factory() {
        let mut ctx = ctx_in("app.main");
        let form = list([
            sym("deftype"),
            sym("Point"),
            vector([sym("x"), sym("y")]),
        ]);
        let out = ctx
            .with_gensym_scope(|ctx| expand1(ctx, &Env::default(), &form))
            .unwrap()
            .unwrap();
        assert_eq!(
            format!("{}", out),
            "(do (deftype* Point [x y]) (def ->Point (fn* [x y] (new Point x y))))"
        );
    }

    #[test]
    fn defprotocol_records_arity_table() {
        let mut ctx = ctx_in("app.main");
        let form = list([
            sym("defprotocol"),
            sym("Countable"),
            list([sym("count-of"), vector([sym("this")]), vector([sym("this"), sym("start")])]),
        ]);
        let _ = ctx
            .with_gensym_scope(|ctx| expand1(ctx, &Env::default(), &form))
            .unwrap()
            .unwrap();

        let entry = ctx
            .nses
            .resolve_protocol_method("app.main", "Countable", "count-of", 2)
            .unwrap();
        assert_eq!(entry.dart_name, "count_of$1");
        assert_eq!(entry.params, vec!["start".to_string()]);
        assert!(ctx
            .nses
            .resolve_protocol_method("app.main", "Countable", "count-of", 3)
            .is_none());
    }

    #[test]
    fn deftest_tags_and_runner_collects() {
        use crate::nses::{DefKind, DefRecord};

        let mut ctx = ctx_in("app.main");
        let out = ctx
            .with_gensym_scope(|ctx| {
                expand1(ctx, &Env::default(), &list([sym("deftest"), sym("sums"), list([sym("f")])]))
            })
            .unwrap()
            .unwrap();
        assert_eq!(format!("{}", out), "(def sums (fn* [] (do (f))))");
        assert!(out.as_seq().unwrap()[1].as_symbol().unwrap().meta_flag("test"));

        // simulate the def having been compiled, then expand the runner
        let mut rec = DefRecord::predeclaration("sums", DefKind::DartFn);
        rec.meta.is_test = true;
        ctx.nses.define("sums", rec);
        let main = expand_defrunner_main(&mut ctx);
        assert_eq!(format!("{}", main), "(def main (fn* [] (do (sums))))");
    }
}
