//! The analyzer: expanded surface forms in, IR out.
//!
//! Driven by head-symbol dispatch over the fixed special forms, with a
//! fallback to plain calls.  The cross-cutting machinery lives here too:
//! lexical environments, A-normalization (the `Lifter`), recur detection and
//! validation, function lowering (plain functions and invoke-style objects),
//! and reify/deftype class assembly.  Definitions are rendered to Dart text
//! on the spot and recorded in the namespace registry; the driver writes
//! them out later.

use indexmap::IndexMap;
use std::rc::Rc;

use crate::context::CompilerContext;
use crate::emit::{self, ARITY_THRESHOLD};
use crate::error::{CompileError, ErrorKind, Result};
use crate::expand;
use crate::form::{Form, Symbol};
use crate::ident::munge;
use crate::ir::{
    free_ids, Arg, Binding, CaseClause, CatchClause, ClassDef, CtorParam, DartId, DartOp,
    DartType, FnDef, FnMarker, Ir, MethodDef, MethodKind, OptParams,
};
use crate::nses::{DefKind, DefMeta, DefRecord, CORE_LIB, CORE_NS};

// =============================================================================
// Environments

/// What `recur` would rebind at this point, if anything.
#[derive(Debug, Clone)]
enum RecurTarget {
    Bindings(Rc<Vec<DartId>>),
    /// Entered a `try` body: recur may not cross it.
    TryBarrier,
}

/// A lexical environment: source name to resolved identifier, plus the recur
/// state and tail-position flag.  Environments are small, short-lived values;
/// extension clones the map.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: IndexMap<String, DartId>,
    recur: Option<RecurTarget>,
    tail: bool,
}

impl Env {
    pub fn binds(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&DartId> {
        self.vars.get(name)
    }

    pub fn bind(&self, name: &str, id: DartId) -> Env {
        let mut out = self.clone();
        out.vars.insert(name.to_owned(), id);
        out
    }

    /// Operand position: never a tail.
    fn expr(&self) -> Env {
        let mut out = self.clone();
        out.tail = false;
        out
    }

    fn tail(&self) -> Env {
        let mut out = self.clone();
        out.tail = true;
        out
    }

    fn with_recur(&self, ids: Vec<DartId>) -> Env {
        let mut out = self.clone();
        out.recur = Some(RecurTarget::Bindings(Rc::new(ids)));
        out
    }

    fn with_recur_barrier(&self) -> Env {
        let mut out = self.clone();
        out.recur = Some(RecurTarget::TryBarrier);
        out
    }
}

// =============================================================================
// Top-level driver entry

/// Compile one top-level form in the current namespace: expand it, analyze
/// it, and record whatever it defines.
pub fn compile_top(ctx: &mut CompilerContext, form: &Form) -> Result<()> {
    ctx.with_gensym_scope(|ctx| top_form(ctx, form))
}

fn top_form(ctx: &mut CompilerContext, form: &Form) -> Result<()> {
    let env = Env::default();
    let form = expand::expand(ctx, &env, form.clone())?;
    let head = form.head_symbol().cloned();
    match head {
        Some(ref s) if s.is("do") => {
            let items = form.as_seq().expect("do is a seq");
            for inner in &items[1..] {
                top_form(ctx, inner)?;
            }
            Ok(())
        }
        Some(ref s) if s.is("ns") => analyze_ns(ctx, &form),
        Some(ref s) if s.is("def") => analyze_def(ctx, &form),
        Some(ref s) if s.is("deftype*") => {
            analyze_deftype_star(ctx, &env, &form)?;
            Ok(())
        }
        _ => {
            // Other top-level forms are analyzed for their errors only; the
            // emitted program has no load-time effect position for them.
            analyze(ctx, &env, &form)?;
            Ok(())
        }
    }
}

// =============================================================================
// Core dispatch

pub fn analyze(ctx: &mut CompilerContext, env: &Env, form: &Form) -> Result<Ir> {
    let form = expand::expand(ctx, env, form.clone())?;
    let tag = form.type_tag();
    let (inner, _) = form.strip_meta();
    let ir = analyze_inner(ctx, env, inner, &form)?;
    apply_tag(ctx, ir, tag, &form)
}

fn analyze_inner(
    ctx: &mut CompilerContext,
    env: &Env,
    inner: &Form,
    whole: &Form,
) -> Result<Ir> {
    match inner {
        Form::Nil => Ok(Ir::Nil),
        Form::Bool(b) => Ok(Ir::Bool(*b)),
        Form::Int(n) => Ok(Ir::Int(*n)),
        Form::Float(x) => Ok(Ir::Double(*x)),
        Form::Str(s) => Ok(Ir::Str(s.to_string())),
        Form::Keyword(k) => {
            let ns = k.ns.as_deref().map(str::to_owned);
            Ok(keyword_intern(ctx, ns.as_deref(), &k.name))
        }
        Form::Symbol(sym) => Ok(Ir::Id(resolve_symbol(ctx, env, sym)?)),
        Form::Vector(items) => analyze_aggregate(ctx, env, items, "PersistentVector", "of"),
        Form::Set(items) => analyze_aggregate(ctx, env, items, "PersistentSet", "of"),
        Form::Map(pairs) => {
            let flat: Vec<Form> = pairs
                .iter()
                .flat_map(|(k, v)| [k.clone(), v.clone()])
                .collect();
            analyze_aggregate(ctx, env, &flat, "PersistentMap", "fromPairs")
        }
        Form::Tagged(tag, literal) => {
            if tag.is("dart") {
                if let Some(items) = literal.as_vector() {
                    let mut lifter = Lifter::default();
                    let mut atoms = vec![];
                    for item in items.iter().rev() {
                        atoms.insert(0, lifter.operand(ctx, env, item)?);
                    }
                    return Ok(lifter.wrap(Ir::ListLit(atoms)));
                }
            }
            Err(CompileError::new(ErrorKind::UnsupportedLiteral("tagged literal"), whole))
        }
        Form::Seq(items) if items.is_empty() => {
            Ok(Ir::Call { callee: Box::new(core_id(ctx, "emptySeq")), args: vec![] })
        }
        Form::Seq(items) => {
            let head = items[0].as_symbol();
            let special = head
                .filter(|s| s.ns.is_none() && !env.binds(&s.name))
                .map(|s| s.name.to_string());
            match special.as_deref() {
                Some("quote") => analyze_quote(ctx, items, whole),
                Some("do") => analyze_do(ctx, env, &items[1..]),
                Some("let*") => analyze_let(ctx, env, items, whole),
                Some("loop*") => analyze_loop(ctx, env, items, whole),
                Some("recur") => analyze_recur(ctx, env, items, whole),
                Some("if") => analyze_if(ctx, env, items, whole),
                Some("fn*") => analyze_fn_expr(ctx, env, items, whole),
                Some(".") => analyze_dot(ctx, env, items, whole),
                Some("set!") => analyze_set(ctx, env, items, whole),
                Some("throw") => analyze_throw(ctx, env, items, whole),
                Some("new") => analyze_new(ctx, env, items, whole),
                Some("try") => analyze_try(ctx, env, items, whole),
                Some("case*") => analyze_case(ctx, env, items, whole),
                Some("is?") => analyze_is(ctx, env, items, whole),
                Some("reify*") => analyze_reify(ctx, env, items, whole),
                Some("ns") | Some("def") | Some("deftype*") => Err(CompileError::new(
                    ErrorKind::MalformedForm {
                        form: "top-level form",
                        reason: "only allowed at the top level",
                    },
                    whole,
                )),
                _ => analyze_call(ctx, env, items),
            }
        }
        Form::WithMeta(..) => unreachable!("strip_meta left a wrapper. This is a bug!"),
    }
}

fn apply_tag(
    ctx: &mut CompilerContext,
    ir: Ir,
    tag: Option<String>,
    whole: &Form,
) -> Result<Ir> {
    let tag = match tag {
        Some(tag) => tag,
        None => return Ok(ir),
    };
    let ty = ctx
        .nses
        .resolve_type(&tag)
        .map_err(|e| CompileError::new(e.kind, whole))?;
    Ok(match ir {
        Ir::Id(mut id) => {
            id.truth = ty.truth();
            id.ty = ty;
            Ir::Id(id)
        }
        ir if ir.is_statement_like() => ir,
        ir => Ir::Cast { expr: Box::new(ir), ty },
    })
}

// -----------------------------------------------------------------------------
// Runtime library references

fn core_alias(ctx: &mut CompilerContext) -> String {
    ctx.nses.ensure_import(CORE_LIB, Some(CORE_NS))
}

fn core_type(ctx: &mut CompilerContext, name: &str) -> DartType {
    let alias = core_alias(ctx);
    DartType::aliased(&alias, name)
}

fn core_id(ctx: &mut CompilerContext, name: &str) -> Ir {
    let alias = core_alias(ctx);
    Ir::Id(
        DartId::global(format!("{}.{}", alias, name), DartType::dynamic())
            .with_marker(FnMarker::Native),
    )
}

fn keyword_intern(ctx: &mut CompilerContext, ns: Option<&str>, name: &str) -> Ir {
    let class = core_type(ctx, "Keyword");
    let ns_arg = match ns {
        Some(ns) => Ir::Str(ns.to_owned()),
        None => Ir::Nil,
    };
    Ir::New {
        class,
        ctor: Some("intern".into()),
        args: vec![Arg::positional(ns_arg), Arg::positional(Ir::Str(name.to_owned()))],
    }
}

fn resolve_symbol(ctx: &mut CompilerContext, env: &Env, sym: &Symbol) -> Result<DartId> {
    let mut id = if sym.ns.is_none() && env.binds(&sym.name) {
        env.get(&sym.name).expect("just checked").clone()
    } else {
        ctx.nses.resolve(sym)?
    };
    if let Some(tag) = sym.type_tag() {
        let ty = ctx
            .nses
            .resolve_type(&tag)
            .map_err(|e| CompileError::new(e.kind, sym))?;
        id.truth = ty.truth();
        id.ty = ty;
    }
    Ok(id)
}

/// Resolve a symbol used in type position (`is?`, `new`, catch classes,
/// `:extends`).
fn type_from_symbol(ctx: &mut CompilerContext, sym: &Symbol) -> Result<DartType> {
    let text = match &sym.ns {
        Some(ns) => format!("{}.{}", ns, sym.name),
        None => sym.name.to_string(),
    };
    ctx.nses.resolve_type(&text)
}

// =============================================================================
// A-normalization

/// Accumulates the bindings required to atomize a sequence of operands.
///
/// Operands must be fed in *reverse* evaluation order; each one's bindings
/// are prepended, which reconstitutes source order in the emitted code.  Once
/// any operand has needed a binding, every remaining (earlier-evaluated)
/// non-atomic operand is forced into a temporary too, so its side effects
/// stay where the source put them.
#[derive(Default)]
struct Lifter {
    bindings: Vec<Binding>,
    forced: bool,
}

impl Lifter {
    fn operand(&mut self, ctx: &mut CompilerContext, env: &Env, form: &Form) -> Result<Ir> {
        let ir = analyze(ctx, &env.expr(), form)?;
        Ok(self.operand_ir(ctx, ir))
    }

    fn operand_ir(&mut self, ctx: &mut CompilerContext, ir: Ir) -> Ir {
        let (mut bindings, atom) = split(ctx, ir, self.forced);
        if !bindings.is_empty() {
            self.forced = true;
        }
        bindings.extend(self.bindings.drain(..));
        self.bindings = bindings;
        atom
    }

    /// Force the operand into an identifier unless it already is one.
    fn operand_id(&mut self, ctx: &mut CompilerContext, env: &Env, form: &Form) -> Result<Ir> {
        let atom = self.operand(ctx, env, form)?;
        Ok(match atom {
            Ir::Id(_) => atom,
            other => {
                let (bindings, id) = temp(ctx, other);
                let mut bindings = bindings;
                bindings.extend(self.bindings.drain(..));
                self.bindings = bindings;
                self.forced = true;
                id
            }
        })
    }

    fn wrap(self, body: Ir) -> Ir {
        if self.bindings.is_empty() {
            body
        } else {
            Ir::Let { bindings: self.bindings, body: Box::new(body) }
        }
    }
}

/// Split an analyzed operand into hoisted bindings plus an inline remainder.
fn split(ctx: &mut CompilerContext, ir: Ir, force: bool) -> (Vec<Binding>, Ir) {
    match ir {
        Ir::Let { bindings, body } => {
            let (more, atom) = split(ctx, *body, force);
            let mut all = bindings;
            all.extend(more);
            (all, atom)
        }
        // A throw has no value; it runs for effect and leaves `null` behind.
        Ir::Throw(_) => (vec![Binding { id: None, value: ir }], Ir::Nil),
        ir if ir.is_statement_like() => temp(ctx, ir),
        ir if force && !ir.is_atomic() => temp(ctx, ir),
        ir => (vec![], ir),
    }
}

fn temp(ctx: &mut CompilerContext, ir: Ir) -> (Vec<Binding>, Ir) {
    let id = DartId::local(ctx.gensym("t"), ir.ty()).with_truth(ir.truth());
    (vec![Binding { id: Some(id.clone()), value: ir }], Ir::Id(id))
}

/// Split a call's argument forms at the named-argument sentinel `.&` and
/// atomize them all (named first, right to left, then positionals).
fn lift_call_args(
    ctx: &mut CompilerContext,
    env: &Env,
    lifter: &mut Lifter,
    forms: &[Form],
    whole: &Form,
) -> Result<Vec<Arg>> {
    let sentinel = forms
        .iter()
        .position(|f| f.as_symbol().map_or(false, |s| s.is(".&")));
    let (positional, named_pairs) = match sentinel {
        None => (forms, &[][..]),
        Some(i) => (&forms[..i], &forms[i + 1..]),
    };
    if named_pairs.len() % 2 != 0 {
        return Err(CompileError::new(
            ErrorKind::MalformedForm { form: "call", reason: "named arguments come in pairs" },
            whole,
        ));
    }

    let mut named: Vec<Arg> = vec![];
    for pair in named_pairs.chunks(2).rev() {
        let name = pair[0].as_keyword().ok_or_else(|| {
            CompileError::new(
                ErrorKind::MalformedForm { form: "call", reason: "argument name must be a keyword" },
                whole,
            )
        })?;
        let value = lifter.operand(ctx, env, &pair[1])?;
        named.insert(0, Arg { name: Some(munge(&name.name)), value });
    }

    let mut args: Vec<Arg> = vec![];
    for form in positional.iter().rev() {
        let value = lifter.operand(ctx, env, form)?;
        args.insert(0, Arg::positional(value));
    }
    args.extend(named);
    Ok(args)
}

// =============================================================================
// Simple special forms

fn analyze_aggregate(
    ctx: &mut CompilerContext,
    env: &Env,
    items: &[Form],
    class: &str,
    ctor: &str,
) -> Result<Ir> {
    let mut lifter = Lifter::default();
    let mut atoms = vec![];
    for item in items.iter().rev() {
        atoms.insert(0, lifter.operand(ctx, env, item)?);
    }
    let class = core_type(ctx, class);
    let node = Ir::New {
        class,
        ctor: Some(ctor.into()),
        args: vec![Arg::positional(Ir::ListLit(atoms))],
    };
    Ok(lifter.wrap(node))
}

fn analyze_quote(ctx: &mut CompilerContext, items: &[Form], whole: &Form) -> Result<Ir> {
    let quoted = items.get(1).unwrap_or(&Form::Nil);
    match quoted.strip_meta().0 {
        Form::Nil => Ok(Ir::Nil),
        Form::Bool(b) => Ok(Ir::Bool(*b)),
        Form::Int(n) => Ok(Ir::Int(*n)),
        Form::Float(x) => Ok(Ir::Double(*x)),
        Form::Str(s) => Ok(Ir::Str(s.to_string())),
        Form::Keyword(k) => {
            let ns = k.ns.as_deref().map(str::to_owned);
            Ok(keyword_intern(ctx, ns.as_deref(), &k.name))
        }
        Form::Symbol(sym) => {
            let class = core_type(ctx, "Symbol");
            let ns_arg = match &sym.ns {
                Some(ns) => Ir::Str(ns.to_string()),
                None => Ir::Nil,
            };
            Ok(Ir::New {
                class,
                ctor: Some("intern".into()),
                args: vec![
                    Arg::positional(ns_arg),
                    Arg::positional(Ir::Str(sym.name.to_string())),
                ],
            })
        }
        _ => Err(CompileError::new(ErrorKind::UnsupportedLiteral("quoted collection"), whole)),
    }
}

fn analyze_do(ctx: &mut CompilerContext, env: &Env, body: &[Form]) -> Result<Ir> {
    let (stmts, last) = match body.split_last() {
        None => return Ok(Ir::Nil),
        Some((last, stmts)) => (stmts, last),
    };
    let mut bindings = vec![];
    for stmt in stmts {
        let value = analyze(ctx, &env.expr(), stmt)?;
        bindings.push(Binding { id: None, value });
    }
    let tail = analyze(ctx, env, last)?;
    if bindings.is_empty() {
        Ok(tail)
    } else {
        Ok(Ir::Let { bindings, body: Box::new(tail) })
    }
}

/// Analyze a `let*`/`loop*` binding vector, returning the bindings and the
/// extended environment.
fn analyze_bindings(
    ctx: &mut CompilerContext,
    env: &Env,
    vector: &Form,
    whole: &Form,
) -> Result<(Vec<(DartId, Ir)>, Env)> {
    let items = vector.as_vector().ok_or_else(|| {
        CompileError::new(
            ErrorKind::MalformedForm { form: "binding form", reason: "expected a vector" },
            whole,
        )
    })?;
    if items.len() % 2 != 0 {
        return Err(CompileError::new(
            ErrorKind::MalformedForm { form: "binding form", reason: "bindings come in pairs" },
            whole,
        ));
    }

    let mut env = env.expr();
    let mut out = vec![];
    for pair in items.chunks(2) {
        let sym = pair[0].as_symbol().filter(|s| s.ns.is_none()).ok_or_else(|| {
            CompileError::new(
                ErrorKind::MalformedForm {
                    form: "binding form",
                    reason: "binding name must be a simple symbol",
                },
                whole,
            )
        })?;
        let init = analyze(ctx, &env, &pair[1])?;
        let id = binding_id(ctx, sym, &init)?;
        env = env.bind(&sym.name, id.clone());
        out.push((id, init));
    }
    Ok((out, env))
}

/// Identifier for a fresh binding: gensym from the munged source name, typed
/// by the tag if present, otherwise by the initializer.
fn binding_id(ctx: &mut CompilerContext, sym: &Symbol, init: &Ir) -> Result<DartId> {
    let name = ctx.gensym(&munge(&sym.name));
    let id = match sym.type_tag() {
        Some(tag) => {
            let ty = ctx
                .nses
                .resolve_type(&tag)
                .map_err(|e| CompileError::new(e.kind, sym))?;
            DartId::local(name, ty)
        }
        None => DartId::local(name, init.ty()).with_truth(init.truth()),
    };
    Ok(id.with_marker(value_marker(init)))
}

/// What calling through this value looks like, when the value's shape says.
fn value_marker(ir: &Ir) -> FnMarker {
    match ir {
        Ir::Fn(_) => FnMarker::Native,
        Ir::Cast { ty, .. } if ty.name == "IFn" => FnMarker::Ifn,
        Ir::Id(id) => id.marker,
        _ => FnMarker::Unknown,
    }
}

fn analyze_let(
    ctx: &mut CompilerContext,
    env: &Env,
    items: &[Form],
    whole: &Form,
) -> Result<Ir> {
    let vector = items.get(1).ok_or_else(|| {
        CompileError::new(
            ErrorKind::MalformedForm { form: "let*", reason: "missing binding vector" },
            whole,
        )
    })?;
    let (pairs, mut benv) = analyze_bindings(ctx, env, vector, whole)?;
    benv.tail = env.tail;
    benv.recur = env.recur.clone();
    let body = analyze_do(ctx, &benv, &items[2..])?;
    let bindings = pairs
        .into_iter()
        .map(|(id, value)| Binding { id: Some(id), value })
        .collect::<Vec<_>>();
    if bindings.is_empty() {
        Ok(body)
    } else {
        Ok(Ir::Let { bindings, body: Box::new(body) })
    }
}

fn analyze_loop(
    ctx: &mut CompilerContext,
    env: &Env,
    items: &[Form],
    whole: &Form,
) -> Result<Ir> {
    let vector = items.get(1).ok_or_else(|| {
        CompileError::new(
            ErrorKind::MalformedForm { form: "loop*", reason: "missing binding vector" },
            whole,
        )
    })?;
    let (pairs, benv) = analyze_bindings(ctx, env, vector, whole)?;
    let ids: Vec<DartId> = pairs.iter().map(|(id, _)| id.clone()).collect();
    let benv = benv.with_recur(ids).tail();
    let body = analyze_do(ctx, &benv, &items[2..])?;

    if body.has_recur() {
        Ok(Ir::Loop { bindings: pairs, body: Box::new(body) })
    } else {
        let bindings = pairs
            .into_iter()
            .map(|(id, value)| Binding { id: Some(id), value })
            .collect::<Vec<_>>();
        if bindings.is_empty() {
            Ok(body)
        } else {
            Ok(Ir::Let { bindings, body: Box::new(body) })
        }
    }
}

fn analyze_recur(
    ctx: &mut CompilerContext,
    env: &Env,
    items: &[Form],
    whole: &Form,
) -> Result<Ir> {
    let ids = match &env.recur {
        None => {
            return Err(CompileError::new(
                ErrorKind::MalformedForm {
                    form: "recur",
                    reason: "no enclosing loop or function",
                },
                whole,
            ))
        }
        Some(RecurTarget::TryBarrier) => {
            return Err(CompileError::new(ErrorKind::RecurAcrossTry, whole))
        }
        Some(RecurTarget::Bindings(ids)) => ids.clone(),
    };
    if !env.tail {
        return Err(CompileError::new(ErrorKind::RecurOutsideTail, whole));
    }
    let args = &items[1..];
    if args.len() != ids.len() {
        return Err(CompileError::new(
            ErrorKind::RecurArityMismatch { expected: ids.len(), got: args.len() },
            whole,
        ));
    }

    let mut lifter = Lifter::default();
    let mut atoms = vec![];
    for arg in args.iter().rev() {
        atoms.insert(0, lifter.operand(ctx, env, arg)?);
    }
    Ok(lifter.wrap(Ir::Recur { args: atoms }))
}

fn analyze_if(ctx: &mut CompilerContext, env: &Env, items: &[Form], whole: &Form) -> Result<Ir> {
    if items.len() < 3 || items.len() > 4 {
        return Err(CompileError::new(
            ErrorKind::MalformedForm { form: "if", reason: "expected (if test then else?)" },
            whole,
        ));
    }
    let test_ir = analyze(ctx, &env.expr(), &items[1])?;
    // A non-boolean test is mentioned twice in the emitted condition, so it
    // must be duplication-safe.
    let force = test_ir.truth() != crate::ir::Truth::Boolean;
    let (bindings, test) = split(ctx, test_ir, force);

    let then = analyze(ctx, env, &items[2])?;
    let els = match items.get(3) {
        Some(form) => analyze(ctx, env, form)?,
        None => Ir::Nil,
    };
    let node = Ir::If { test: Box::new(test), then: Box::new(then), els: Box::new(els) };
    if bindings.is_empty() {
        Ok(node)
    } else {
        Ok(Ir::Let { bindings, body: Box::new(node) })
    }
}

fn analyze_throw(
    ctx: &mut CompilerContext,
    env: &Env,
    items: &[Form],
    whole: &Form,
) -> Result<Ir> {
    if items.len() != 2 {
        return Err(CompileError::new(
            ErrorKind::MalformedForm { form: "throw", reason: "expected (throw expr)" },
            whole,
        ));
    }
    let mut lifter = Lifter::default();
    let value = lifter.operand(ctx, env, &items[1])?;
    Ok(lifter.wrap(Ir::Throw(Box::new(value))))
}

fn analyze_is(ctx: &mut CompilerContext, env: &Env, items: &[Form], whole: &Form) -> Result<Ir> {
    let (expr, ty_sym) = match items {
        [_, expr, ty] => (expr, ty.as_symbol()),
        _ => {
            return Err(CompileError::new(
                ErrorKind::MalformedForm { form: "is?", reason: "expected (is? expr Type)" },
                whole,
            ))
        }
    };
    let ty_sym = ty_sym.ok_or_else(|| {
        CompileError::new(
            ErrorKind::MalformedForm { form: "is?", reason: "type must be a symbol" },
            whole,
        )
    })?;
    let ty = type_from_symbol(ctx, ty_sym)?;
    let mut lifter = Lifter::default();
    let value = lifter.operand(ctx, env, expr)?;
    Ok(lifter.wrap(Ir::Is { expr: Box::new(value), ty }))
}

fn analyze_set(ctx: &mut CompilerContext, env: &Env, items: &[Form], whole: &Form) -> Result<Ir> {
    if items.len() != 3 {
        return Err(CompileError::new(
            ErrorKind::MalformedForm { form: "set!", reason: "expected (set! target value)" },
            whole,
        ));
    }
    let mut lifter = Lifter::default();
    let value = lifter.operand(ctx, env, &items[2])?;

    let target = match items[1].as_symbol() {
        Some(sym) => {
            let id = resolve_symbol(ctx, env, sym)?;
            if !id.mutable {
                return Err(CompileError::new(
                    ErrorKind::BadAssignment(sym.to_string()),
                    whole,
                ));
            }
            Ir::Id(id)
        }
        None => {
            let target_ir = lifter.operand(ctx, env, &items[1])?;
            match target_ir {
                Ir::FieldGet { .. } => target_ir,
                _ => {
                    return Err(CompileError::new(
                        ErrorKind::BadAssignment(items[1].to_string()),
                        whole,
                    ))
                }
            }
        }
    };
    Ok(lifter.wrap(Ir::Set { target: Box::new(target), value: Box::new(value) }))
}

// =============================================================================
// Invocation forms

fn analyze_call(ctx: &mut CompilerContext, env: &Env, items: &[Form]) -> Result<Ir> {
    let whole = Form::Seq(items.to_vec());
    let mut lifter = Lifter::default();
    let args = lift_call_args(ctx, env, &mut lifter, &items[1..], &whole)?;
    // The callee evaluates first; with an unknown dispatch marker it is also
    // mentioned several times in the emitted branch, so pin it to an id.
    let callee = lifter.operand_id(ctx, env, &items[0])?;
    Ok(lifter.wrap(Ir::Call { callee: Box::new(callee), args }))
}

fn analyze_dot(ctx: &mut CompilerContext, env: &Env, items: &[Form], whole: &Form) -> Result<Ir> {
    if items.len() < 3 {
        return Err(CompileError::new(
            ErrorKind::MalformedForm { form: ".", reason: "expected (. obj member args...)" },
            whole,
        ));
    }

    // `(. obj (m a b))` and `(. obj m a b)` are both accepted.
    let (member, arg_forms): (&Form, Vec<Form>) = match items[2].as_seq() {
        Some(call) if !call.is_empty() => (&call[0], call[1..].to_vec()),
        _ => (&items[2], items[3..].to_vec()),
    };
    let member = match (member.as_symbol(), member.as_str()) {
        (Some(sym), _) => sym.name.to_string(),
        (None, Some(s)) => s.to_owned(),
        _ => {
            return Err(CompileError::new(
                ErrorKind::MalformedForm { form: ".", reason: "member must be a symbol" },
                whole,
            ))
        }
    };

    let mut lifter = Lifter::default();

    // field access: `(. obj -field)`
    if let Some(field) = member.strip_prefix('-') {
        if member.len() > 1 && !arg_forms.is_empty() {
            return Err(CompileError::new(
                ErrorKind::MalformedForm { form: ".", reason: "field access takes no arguments" },
                whole,
            ));
        }
        if member.len() > 1 {
            let obj = lifter.operand(ctx, env, &items[1])?;
            return Ok(lifter.wrap(Ir::FieldGet { obj: Box::new(obj), field: field.to_owned() }));
        }
    }

    let args = lift_call_args(ctx, env, &mut lifter, &arg_forms, whole)?;
    let obj = lifter.operand(ctx, env, &items[1])?;
    Ok(lifter.wrap(Ir::MethodCall { obj: Box::new(obj), method: member, args }))
}

fn analyze_new(ctx: &mut CompilerContext, env: &Env, items: &[Form], whole: &Form) -> Result<Ir> {
    let class_sym = items.get(1).and_then(|f| f.as_symbol()).ok_or_else(|| {
        CompileError::new(
            ErrorKind::MalformedForm { form: "new", reason: "expected (new Class args...)" },
            whole,
        )
    })?;

    // `Cls.named` selects a named constructor.
    let (class_name, ctor) = match class_sym.name.split_once('.') {
        Some((class, ctor)) => (class.to_owned(), Some(ctor.to_owned())),
        None => (class_sym.name.to_string(), None),
    };
    let lookup = Symbol { ns: class_sym.ns.clone(), name: class_name.into(), meta: None };
    let class = type_from_symbol(ctx, &lookup)?;

    let mut lifter = Lifter::default();
    let args = lift_call_args(ctx, env, &mut lifter, &items[2..], whole)?;
    Ok(lifter.wrap(Ir::New { class, ctor, args }))
}

// =============================================================================
// try / case*

fn analyze_try(ctx: &mut CompilerContext, env: &Env, items: &[Form], whole: &Form) -> Result<Ir> {
    let mut body_forms: Vec<&Form> = vec![];
    let mut catches = vec![];
    let mut finally = None;

    for item in &items[1..] {
        let head = item.head_symbol();
        if head.map_or(false, |s| s.is("catch")) {
            catches.push(analyze_catch(ctx, env, item.as_seq().expect("catch is a seq"), whole)?);
        } else if head.map_or(false, |s| s.is("finally")) {
            let forms = item.as_seq().expect("finally is a seq");
            finally = Some(Box::new(analyze_do(ctx, &env.expr(), &forms[1..])?));
        } else if !catches.is_empty() || finally.is_some() {
            return Err(CompileError::new(
                ErrorKind::MalformedForm {
                    form: "try",
                    reason: "body forms must precede catch/finally",
                },
                whole,
            ));
        } else {
            body_forms.push(item);
        }
    }

    let benv = env.with_recur_barrier();
    let body_forms: Vec<Form> = body_forms.into_iter().cloned().collect();
    let body = analyze_do(ctx, &benv, &body_forms)?;
    // a try with nothing to catch and nothing to run afterwards is its body
    if catches.is_empty() && finally.is_none() {
        return Ok(body);
    }
    Ok(Ir::Try { body: Box::new(body), catches, finally })
}

fn analyze_catch(
    ctx: &mut CompilerContext,
    env: &Env,
    items: &[Form],
    whole: &Form,
) -> Result<CatchClause> {
    let (class_sym, exn_sym) = match (items.get(1).and_then(|f| f.as_symbol()), items.get(2).and_then(|f| f.as_symbol())) {
        (Some(class), Some(exn)) => (class, exn),
        _ => {
            return Err(CompileError::new(
                ErrorKind::MalformedForm {
                    form: "catch",
                    reason: "expected (catch Class name stacktrace? body...)",
                },
                whole,
            ))
        }
    };
    let class = type_from_symbol(ctx, class_sym)?;
    let exn = DartId::local(ctx.gensym(&munge(&exn_sym.name)), DartType::dynamic());
    let mut env = env.bind(&exn_sym.name, exn.clone());

    // a bare symbol with body following it binds the stack trace
    let mut body_start = 3;
    let mut trace = None;
    if items.len() > 4 {
        if let Some(trace_sym) = items[3].as_symbol() {
            let id = DartId::local(ctx.gensym(&munge(&trace_sym.name)), DartType::named("StackTrace"));
            env = env.bind(&trace_sym.name, id.clone());
            trace = Some(id);
            body_start = 4;
        }
    }

    let body = analyze_do(ctx, &env, &items[body_start..])?;
    Ok(CatchClause { class, exn, trace, body })
}

fn analyze_case(ctx: &mut CompilerContext, env: &Env, items: &[Form], whole: &Form) -> Result<Ir> {
    let scrut_form = items.get(1).ok_or_else(|| {
        CompileError::new(
            ErrorKind::MalformedForm { form: "case*", reason: "missing scrutinee" },
            whole,
        )
    })?;
    // Dart's switch evaluates its subject exactly once, so an expression
    // scrutinee (from a default-carrying `case`) needs no extra binding;
    // only statement-shaped ones get lifted.
    let mut lifter = Lifter::default();
    let scrutinee = lifter.operand(ctx, env, scrut_form)?;

    let rest = &items[2..];
    let (clause_forms, default_form) = if rest.len() % 2 == 1 {
        (&rest[..rest.len() - 1], rest.last())
    } else {
        (rest, None)
    };

    let mut clauses = vec![];
    for pair in clause_forms.chunks(2) {
        let values = case_literals(&pair[0], whole)?;
        let body = analyze(ctx, env, &pair[1])?;
        clauses.push(CaseClause { values, body });
    }
    let default = match default_form {
        Some(form) => analyze(ctx, env, form)?,
        None => {
            let class = DartType::named("ArgumentError");
            Ir::Throw(Box::new(Ir::New {
                class,
                ctor: None,
                args: vec![Arg::positional(Ir::Str("no matching clause".into()))],
            }))
        }
    };
    Ok(lifter.wrap(Ir::Case {
        scrutinee: Box::new(scrutinee),
        clauses,
        default: Box::new(default),
    }))
}

/// Case tests must be Dart switch constants: ints, strings, bools.
fn case_literals(form: &Form, whole: &Form) -> Result<Vec<Ir>> {
    let one = |form: &Form| -> Result<Ir> {
        match form.strip_meta().0 {
            Form::Int(n) => Ok(Ir::Int(*n)),
            Form::Str(s) => Ok(Ir::Str(s.to_string())),
            Form::Bool(b) => Ok(Ir::Bool(*b)),
            _ => Err(CompileError::new(ErrorKind::UnsupportedLiteral("case test"), whole)),
        }
    };
    match form.strip_meta().0 {
        Form::Seq(items) if !items.is_empty() => items.iter().map(one).collect(),
        _ => Ok(vec![one(form)?]),
    }
}

// =============================================================================
// ns / def

fn analyze_ns(ctx: &mut CompilerContext, form: &Form) -> Result<()> {
    let items = form.as_seq().expect("ns is a seq");
    let name = items.get(1).and_then(|f| f.as_symbol()).ok_or_else(|| {
        CompileError::new(
            ErrorKind::MalformedForm { form: "ns", reason: "expected (ns name clauses...)" },
            form,
        )
    })?;
    ctx.nses.in_ns(&name.name);

    for clause in &items[2..] {
        let inner = clause.strip_meta().0;
        // docstrings and attr maps are legal and carry nothing we use
        if matches!(inner, Form::Str(_) | Form::Map(_)) {
            continue;
        }
        let seq = inner.as_seq().ok_or_else(|| {
            CompileError::new(ErrorKind::UnsupportedImportSpec, clause)
        })?;
        match seq.first().and_then(|f| f.as_keyword()) {
            Some(kw) if kw.ns.is_none() && &*kw.name == "require" => {
                for spec in &seq[1..] {
                    require_spec(ctx, spec)?;
                }
            }
            _ => return Err(CompileError::new(ErrorKind::UnsupportedImportSpec, clause)),
        }
    }
    Ok(())
}

fn require_spec(ctx: &mut CompilerContext, spec: &Form) -> Result<()> {
    use crate::nses::lib_for_ns;

    // bare symbol: `(:require a.b.c)`
    if let Some(sym) = spec.as_symbol() {
        ctx.nses.ensure_import(&lib_for_ns(&sym.name), Some(&sym.name));
        return Ok(());
    }

    let items = match spec.as_vector() {
        Some(items) if !items.is_empty() => items,
        _ => return Err(CompileError::new(ErrorKind::UnsupportedImportSpec, spec)),
    };

    // opts: :as alias, :refer [syms]
    let mut as_alias: Option<&Symbol> = None;
    let mut refers: Option<&[Form]> = None;
    let mut i = 1;
    while i < items.len() {
        match items[i].as_keyword().map(|k| &*k.name) {
            Some("as") => {
                as_alias = items.get(i + 1).and_then(|f| f.as_symbol());
                if as_alias.is_none() {
                    return Err(CompileError::new(ErrorKind::UnsupportedImportSpec, spec));
                }
                i += 2;
            }
            Some("refer") => {
                refers = items.get(i + 1).and_then(|f| f.as_vector());
                if refers.is_none() {
                    return Err(CompileError::new(ErrorKind::UnsupportedImportSpec, spec));
                }
                i += 2;
            }
            _ => return Err(CompileError::new(ErrorKind::UnsupportedImportSpec, spec)),
        }
    }

    match &items[0] {
        // `[x.y :as z :refer [r]]`
        Form::Symbol(ns_sym) => {
            let import_alias = ctx.nses.ensure_import(&lib_for_ns(&ns_sym.name), Some(&ns_sym.name));
            if let Some(alias) = as_alias {
                ctx.nses
                    .current_mut()
                    .aliases
                    .insert(alias.name.to_string(), import_alias);
            }
            if let Some(refers) = refers {
                for referred in refers {
                    let short = referred.as_symbol().ok_or_else(|| {
                        CompileError::new(ErrorKind::UnsupportedImportSpec, spec)
                    })?;
                    ctx.nses.current_mut().mappings.insert(
                        short.name.to_string(),
                        Symbol::qualified(&ns_sym.name, &short.name),
                    );
                }
            }
            Ok(())
        }
        // `["package:lib/lib.dart" :as w]`
        Form::Str(path) => {
            if refers.is_some() {
                return Err(CompileError::new(ErrorKind::UnsupportedImportSpec, spec));
            }
            let import_alias = ctx.nses.ensure_import(path, None);
            if let Some(alias) = as_alias {
                ctx.nses
                    .current_mut()
                    .aliases
                    .insert(alias.name.to_string(), import_alias);
            }
            Ok(())
        }
        _ => Err(CompileError::new(ErrorKind::UnsupportedImportSpec, spec)),
    }
}

fn analyze_def(ctx: &mut CompilerContext, form: &Form) -> Result<()> {
    let items = form.as_seq().expect("def is a seq");
    let name_sym = items.get(1).and_then(|f| f.as_symbol()).cloned().ok_or_else(|| {
        CompileError::new(
            ErrorKind::MalformedForm { form: "def", reason: "expected (def name value)" },
            form,
        )
    })?;

    let (doc, value_form) = match items.len() {
        2 => (None, None),
        3 => (None, Some(&items[2])),
        4 => match items[2].as_str() {
            Some(doc) => (Some(doc.to_owned()), Some(&items[3])),
            None => {
                return Err(CompileError::new(
                    ErrorKind::DocStringMisplaced(items[2].descr()),
                    form,
                ))
            }
        },
        _ => {
            return Err(CompileError::new(
                ErrorKind::MalformedForm { form: "def", reason: "too many forms" },
                form,
            ))
        }
    };

    let dart_name = munge(&name_sym.name);
    let mut meta = DefMeta {
        is_test: name_sym.meta_flag("test"),
        doc: doc.or_else(|| match name_sym.meta_get("doc") {
            Some(Form::Str(s)) => Some(s.to_string()),
            _ => None,
        }),
        ..DefMeta::default()
    };
    if let Some(tag) = name_sym.type_tag() {
        meta.ty = Some(
            ctx.nses
                .resolve_type(&tag)
                .map_err(|e| CompileError::new(e.kind, form))?,
        );
    }

    let value_form = match value_form {
        Some(value) => value,
        None => {
            // declaration only: pre-declare and stop
            ctx.nses
                .define(&name_sym.name, DefRecord::predeclaration(&dart_name, DefKind::Field));
            return Ok(());
        }
    };

    let env = Env::default();
    let value_form = expand::expand(ctx, &env, value_form.clone())?;

    if value_form.head_symbol().map_or(false, |s| s.is("fn*")) {
        let fn_items = value_form.as_seq().expect("fn* is a seq").to_vec();
        // pre-declare so recursive references resolve to a direct call
        let predecl_kind = if fn_star_is_simple(&fn_items) { DefKind::DartFn } else { DefKind::Field };
        ctx.nses
            .define(&name_sym.name, DefRecord::predeclaration(&dart_name, predecl_kind));

        match lower_fn_star(ctx, &env, &fn_items, Some(&dart_name), &value_form)? {
            LoweredFn::Simple(mut def) => {
                def.name = Some(dart_name.clone());
                let alias = core_alias(ctx);
                let source = render_def(meta.doc.as_deref(), emit::render_named_fn(&def, &alias));
                ctx.nses.define(
                    &name_sym.name,
                    DefRecord { dart_name, kind: DefKind::DartFn, meta, source },
                );
            }
            LoweredFn::Object(instance) => {
                meta.ty = Some(core_type(ctx, "IFn"));
                let alias = core_alias(ctx);
                let source =
                    render_def(meta.doc.as_deref(), emit::render_top_field(&dart_name, &instance, &alias));
                ctx.nses.define(
                    &name_sym.name,
                    DefRecord { dart_name, kind: DefKind::Field, meta, source },
                );
            }
        }
        return Ok(());
    }

    ctx.nses
        .define(&name_sym.name, DefRecord::predeclaration(&dart_name, DefKind::Field));
    let value = analyze(ctx, &env, &value_form)?;
    if meta.ty.is_none() {
        let ty = value.ty();
        if !ty.is_dynamic() {
            meta.ty = Some(ty);
        }
    }
    let alias = core_alias(ctx);
    let source = render_def(meta.doc.as_deref(), emit::render_top_field(&dart_name, &value, &alias));
    ctx.nses.define(
        &name_sym.name,
        DefRecord { dart_name, kind: DefKind::Field, meta, source },
    );
    Ok(())
}

fn render_def(doc: Option<&str>, source: String) -> String {
    match doc {
        None => source,
        Some(doc) => {
            let mut out = String::new();
            for line in doc.lines() {
                out.push_str("/// ");
                out.push_str(line);
                out.push('\n');
            }
            out.push_str(&source);
            out
        }
    }
}

// =============================================================================
// Function lowering

#[derive(Debug, Clone, PartialEq)]
struct ParsedParams {
    fixed: Vec<Symbol>,
    /// `(named?, params-with-defaults)`
    opt: Option<(bool, Vec<(Symbol, Option<Form>)>)>,
    rest: Option<Symbol>,
}

impl ParsedParams {
    fn arity(&self) -> usize {
        self.fixed.len()
    }
}

/// Parse a parameter vector.  `...` starts optional positionals, `.&` starts
/// named parameters, `&` precedes the variadic rest parameter; a non-symbol
/// form following an optional parameter is its default value.
fn parse_params(params: &[Form], whole: &Form) -> Result<ParsedParams> {
    let mut out = ParsedParams { fixed: vec![], opt: None, rest: None };
    let malformed = |reason| {
        CompileError::new(ErrorKind::MalformedForm { form: "fn*", reason }, whole.clone())
    };

    let mut i = 0;
    enum Mode {
        Fixed,
        Opt,
    }
    let mut mode = Mode::Fixed;
    while i < params.len() {
        let sym = match params[i].as_symbol() {
            Some(sym) => sym.clone(),
            None => return Err(malformed("parameter must be a symbol")),
        };
        match &*sym.name {
            "..." | ".&" => {
                if out.opt.is_some() || out.rest.is_some() {
                    return Err(malformed("misplaced parameter sentinel"));
                }
                out.opt = Some((&*sym.name == ".&", vec![]));
                mode = Mode::Opt;
                i += 1;
            }
            "&" => {
                let rest = params.get(i + 1).and_then(|f| f.as_symbol());
                match rest {
                    Some(rest) if i + 2 == params.len() => {
                        out.rest = Some(rest.clone());
                        i += 2;
                    }
                    _ => return Err(malformed("& takes exactly one rest parameter")),
                }
            }
            _ => match mode {
                Mode::Fixed => {
                    out.fixed.push(sym);
                    i += 1;
                }
                Mode::Opt => {
                    let default = match params.get(i + 1) {
                        Some(next) if next.as_symbol().is_none() => {
                            i += 1;
                            Some(next.clone())
                        }
                        _ => None,
                    };
                    out.opt.as_mut().expect("mode is Opt").1.push((sym, default));
                    i += 1;
                }
            },
        }
    }
    Ok(out)
}

/// Shapes of a lowered `fn*`.
enum LoweredFn {
    /// One fixed body: a plain function the emitter can write as a named
    /// declaration or a closure.
    Simple(FnDef),
    /// Multi-arity and/or variadic: an instance of a synthesized dispatch
    /// class, cast to the function interface.
    Object(Ir),
}

/// Pull apart `(fn* name? ...)` into the optional self-name and its bodies.
fn fn_star_parts(items: &[Form]) -> (Option<&Symbol>, &[Form]) {
    match items.get(1).and_then(|f| f.as_symbol()) {
        Some(name) => (Some(name), &items[2..]),
        None => (None, &items[1..]),
    }
}

/// A `fn*` lowers to a plain function when it has exactly one body and no
/// variadic rest parameter.
fn fn_star_is_simple(items: &[Form]) -> bool {
    let (_, rest) = fn_star_parts(items);
    match rest.first() {
        Some(first) if first.as_vector().is_some() => {
            !first.as_vector().expect("just checked").iter().any(|p| {
                p.as_symbol().map_or(false, |s| s.is("&"))
            })
        }
        _ => {
            rest.len() == 1
                && rest[0].as_seq().map_or(false, |body| {
                    body.first()
                        .and_then(|f| f.as_vector())
                        .map_or(false, |params| {
                            !params.iter().any(|p| p.as_symbol().map_or(false, |s| s.is("&")))
                        })
                })
        }
    }
}

fn analyze_fn_expr(
    ctx: &mut CompilerContext,
    env: &Env,
    items: &[Form],
    whole: &Form,
) -> Result<Ir> {
    match lower_fn_star(ctx, env, items, None, whole)? {
        LoweredFn::Object(ir) => Ok(ir),
        LoweredFn::Simple(def) => {
            let (self_name, _) = fn_star_parts(items);
            match self_name {
                None => Ok(Ir::Fn(Box::new(def))),
                // A self-referencing closure becomes a named local function.
                Some(_) => {
                    let id = def
                        .name
                        .as_deref()
                        .map(|name| {
                            DartId::local(name, DartType::dynamic()).with_marker(FnMarker::Native)
                        })
                        .expect("self-named fn lowered without a name. This is a bug!");
                    Ok(Ir::Let {
                        bindings: vec![Binding { id: Some(id.clone()), value: Ir::Fn(Box::new(def)) }],
                        body: Box::new(Ir::Id(id)),
                    })
                }
            }
        }
    }
}

fn lower_fn_star(
    ctx: &mut CompilerContext,
    env: &Env,
    items: &[Form],
    def_name: Option<&str>,
    whole: &Form,
) -> Result<LoweredFn> {
    let (self_name, rest) = fn_star_parts(items);
    let malformed = |reason| {
        CompileError::new(ErrorKind::MalformedForm { form: "fn*", reason }, whole.clone())
    };

    // normalize to a list of (params, body-forms)
    let mut bodies: Vec<(ParsedParams, Vec<Form>)> = vec![];
    if let Some(params) = rest.first().and_then(|f| f.as_vector()) {
        bodies.push((parse_params(params, whole)?, rest[1..].to_vec()));
    } else {
        for body in rest {
            let seq = body.as_seq().ok_or_else(|| malformed("expected ([params] body...)"))?;
            let params = seq
                .first()
                .and_then(|f| f.as_vector())
                .ok_or_else(|| malformed("expected ([params] body...)"))?;
            bodies.push((parse_params(params, whole)?, seq[1..].to_vec()));
        }
    }
    if bodies.is_empty() {
        return Err(malformed("missing parameter vector"));
    }

    let simple = bodies.len() == 1 && bodies[0].0.rest.is_none();
    if simple {
        let (params, body_forms) = bodies.remove(0);
        let def = lower_simple_fn(ctx, env, self_name, def_name, &params, &body_forms)?;
        Ok(LoweredFn::Simple(def))
    } else {
        let instance = lower_fn_object(ctx, env, self_name, def_name, bodies, whole)?;
        Ok(LoweredFn::Object(instance))
    }
}

/// Analyze one parameter list into ids and an extended environment.
fn bind_params(
    ctx: &mut CompilerContext,
    env: &Env,
    params: &ParsedParams,
) -> Result<(Vec<DartId>, Option<OptParams>, Env)> {
    let mut env = env.expr();
    let mut fixed = vec![];
    for sym in &params.fixed {
        let id = param_id(ctx, sym)?;
        env = env.bind(&sym.name, id.clone());
        fixed.push(id);
    }
    let opt = match &params.opt {
        None => None,
        Some((named, pairs)) => {
            let mut out = vec![];
            for (sym, default) in pairs {
                let id = param_id(ctx, sym)?;
                let default = match default {
                    Some(form) => analyze(ctx, &env, form)?,
                    None => Ir::Nil,
                };
                env = env.bind(&sym.name, id.clone());
                out.push((id, default));
            }
            Some(OptParams { named: *named, params: out })
        }
    };
    Ok((fixed, opt, env))
}

fn param_id(ctx: &mut CompilerContext, sym: &Symbol) -> Result<DartId> {
    let name = ctx.gensym(&munge(&sym.name));
    Ok(match sym.type_tag() {
        Some(tag) => {
            let ty = ctx
                .nses
                .resolve_type(&tag)
                .map_err(|e| CompileError::new(e.kind, sym))?;
            DartId::local(name, ty)
        }
        None => DartId::local(name, DartType::dynamic()),
    })
}

fn lower_simple_fn(
    ctx: &mut CompilerContext,
    env: &Env,
    self_name: Option<&Symbol>,
    def_name: Option<&str>,
    params: &ParsedParams,
    body_forms: &[Form],
) -> Result<FnDef> {
    let mut env = env.clone();
    let fn_dart_name = match (def_name, self_name) {
        (Some(def_name), _) => Some(def_name.to_owned()),
        (None, Some(sym)) => Some(ctx.gensym(&munge(&sym.name))),
        (None, None) => None,
    };
    if let Some(sym) = self_name {
        // recursive self reference: to the named local for closures, to the
        // pre-declared def for top-level functions
        let target = fn_dart_name.clone().expect("self-named fn has a dart name");
        env = env.bind(&sym.name, DartId::local(target, DartType::dynamic()).with_marker(FnMarker::Native));
    }

    let (fixed, opt, benv) = bind_params(ctx, &env, params)?;
    let mut recur_ids = fixed.clone();
    if let Some(opt) = &opt {
        recur_ids.extend(opt.params.iter().map(|(id, _)| id.clone()));
    }
    let benv = benv.with_recur(recur_ids.clone()).tail();
    let mut body = analyze_do(ctx, &benv, body_forms)?;
    if body.has_recur() {
        body = Ir::Loop {
            bindings: recur_ids.iter().map(|id| (id.clone(), Ir::Id(id.clone()))).collect(),
            body: Box::new(body),
        };
    }

    let ret = match self_name.and_then(|s| s.type_tag()) {
        Some(tag) => ctx
            .nses
            .resolve_type(&tag)
            .map_err(|e| CompileError::new(e.kind, self_name.expect("tag came from it")))?,
        None => DartType::dynamic(),
    };

    Ok(FnDef { name: fn_dart_name, ret, params: fixed, opt, body })
}

/// Lower a multi-arity/variadic `fn*` into an invoke-style class and return
/// the instantiation expression.
fn lower_fn_object(
    ctx: &mut CompilerContext,
    env: &Env,
    self_name: Option<&Symbol>,
    def_name: Option<&str>,
    bodies: Vec<(ParsedParams, Vec<Form>)>,
    whole: &Form,
) -> Result<Ir> {
    let malformed = |reason| {
        CompileError::new(ErrorKind::MalformedForm { form: "fn*", reason }, whole.clone())
    };

    let hint = def_name
        .map(str::to_owned)
        .or_else(|| self_name.map(|s| munge(&s.name)))
        .unwrap_or_else(|| "fn".to_owned());
    let cls_name = ctx.nses.fresh_class_name(&hint);
    ctx.nses
        .define(&cls_name, DefRecord::predeclaration(&cls_name, DefKind::Class));

    // inside the bodies, the function itself is `this`
    let mut env = env.clone();
    if let Some(sym) = self_name {
        env = env.bind(
            &sym.name,
            DartId::local("this", DartType::named(&cls_name)).with_marker(FnMarker::Ifn),
        );
    }

    let this_id = DartId::local("this", DartType::named(&cls_name));
    let mut methods: Vec<MethodDef> = vec![];
    let mut fixed_arities: Vec<usize> = vec![];
    let mut variadic: Option<usize> = None;

    for (params, body_forms) in &bodies {
        if params.opt.is_some() {
            return Err(malformed("optional parameters require a single-body fn"));
        }
        let (fixed, _, benv) = bind_params(ctx, &env, params)?;
        let mut all_params = fixed;
        let mut benv = benv;
        if let Some(rest_sym) = &params.rest {
            let rest_id = param_id(ctx, rest_sym)?;
            benv = benv.bind(&rest_sym.name, rest_id.clone());
            all_params.push(rest_id);
        }
        let benv = benv.with_recur(all_params.clone()).tail();
        let mut body = analyze_do(ctx, &benv, body_forms)?;
        if body.has_recur() {
            body = Ir::Loop {
                bindings: all_params.iter().map(|id| (id.clone(), Ir::Id(id.clone()))).collect(),
                body: Box::new(body),
            };
        }

        let arity = params.arity();
        let name = if params.rest.is_some() {
            if variadic.is_some() {
                return Err(malformed("only one variadic body is allowed"));
            }
            if arity >= ARITY_THRESHOLD {
                return Err(malformed("variadic base arity exceeds the dispatch threshold"));
            }
            variadic = Some(arity);
            "$_invoke$vararg".to_owned()
        } else {
            if fixed_arities.contains(&arity) {
                return Err(malformed("duplicate fixed arity"));
            }
            fixed_arities.push(arity);
            invoke_method_name(arity)
        };
        methods.push(MethodDef {
            name,
            kind: MethodKind::Normal,
            ret: DartType::dynamic(),
            params: all_params,
            opt: None,
            body: Some(body),
        });
    }

    if let Some(base) = variadic {
        if fixed_arities.iter().any(|&a| a >= base) {
            return Err(malformed("fixed arity must be below the variadic base arity"));
        }
    }

    // variadic trampolines: every uncovered arity from the base up to the
    // threshold (or past it, when fixed arities reach that far)
    if let Some(base) = variadic {
        let max_fixed = fixed_arities.iter().copied().max().unwrap_or(0);
        let hi = std::cmp::max(ARITY_THRESHOLD, max_fixed + 1);
        for k in base..hi {
            if fixed_arities.contains(&k) {
                continue;
            }
            let params: Vec<DartId> = (0..k)
                .map(|_| DartId::local(ctx.gensym("p"), DartType::dynamic()))
                .collect();
            let mut args: Vec<Arg> =
                params[..base].iter().map(|p| Arg::positional(Ir::Id(p.clone()))).collect();
            let pack = if k == base {
                Ir::Call { callee: Box::new(core_id(ctx, "emptySeq")), args: vec![] }
            } else {
                Ir::Call {
                    callee: Box::new(core_id(ctx, "seqOf")),
                    args: vec![Arg::positional(Ir::ListLit(
                        params[base..].iter().map(|p| Ir::Id(p.clone())).collect(),
                    ))],
                }
            };
            args.push(Arg::positional(pack));
            methods.push(MethodDef {
                name: invoke_method_name(k),
                kind: MethodKind::Normal,
                ret: DartType::dynamic(),
                params,
                opt: None,
                body: Some(Ir::MethodCall {
                    obj: Box::new(Ir::Id(this_id.clone())),
                    method: "$_invoke$vararg".into(),
                    args,
                }),
            });
        }
    }

    let ext_arities: Vec<usize> =
        fixed_arities.iter().copied().filter(|&a| a >= ARITY_THRESHOLD).collect();
    if variadic.is_some() || !ext_arities.is_empty() {
        methods.push(invoke_more_method(ctx, &this_id, &ext_arities, variadic));
    }
    methods.push(call_method(ctx, &this_id, &fixed_arities, variadic));

    // closure: free locals of the bodies, minus each method's own bindings
    let mut captured: Vec<DartId> = vec![];
    for method in &methods {
        if let Some(body) = &method.body {
            let mut bound: Vec<String> =
                method.params.iter().map(|p| p.name.clone()).collect();
            if let Some(opt) = &method.opt {
                bound.extend(opt.params.iter().map(|(p, _)| p.name.clone()));
            }
            bound.push("this".into());
            for free in free_ids(body, &bound) {
                if !captured.iter().any(|c| c.name == free.name) {
                    captured.push(free);
                }
            }
        }
    }

    let iface = core_type(ctx, "IFn");
    let cls = ClassDef {
        name: cls_name.clone(),
        abstract_: false,
        extends: None,
        super_ctor: None,
        super_args: vec![],
        implements: vec![iface.clone()],
        mixins: vec![],
        fields: captured.clone(),
        ctor_params: captured.iter().map(|c| CtorParam::Field(c.name.clone())).collect(),
        methods,
        need_no_such_method: true,
    };

    let alias = core_alias(ctx);
    let source = emit::render_class(&cls, &alias);
    ctx.nses.define(
        &cls_name,
        DefRecord { dart_name: cls_name.clone(), kind: DefKind::Class, meta: DefMeta::default(), source },
    );

    let instance = Ir::New {
        class: DartType::named(&cls_name),
        ctor: None,
        args: captured.into_iter().map(|c| Arg::positional(Ir::Id(c))).collect(),
    };
    Ok(Ir::Cast { expr: Box::new(instance), ty: iface })
}

fn invoke_method_name(arity: usize) -> String {
    if arity < ARITY_THRESHOLD {
        format!("$_invoke${}", arity)
    } else {
        format!("$_invoke$ext${}", arity)
    }
}

/// `$_invoke_more`: T-1 positionals plus the packed overflow; redispatches to
/// the matching `$_invoke$ext$N`, or unpacks into `$_invoke$vararg`.
fn invoke_more_method(
    ctx: &mut CompilerContext,
    this_id: &DartId,
    ext_arities: &[usize],
    variadic: Option<usize>,
) -> MethodDef {
    let leading = ARITY_THRESHOLD - 1;
    let params: Vec<DartId> = (0..leading)
        .map(|_| DartId::local(ctx.gensym("x"), DartType::dynamic()))
        .collect();
    let rest = DartId::local(ctx.gensym("rest"), DartType::named("List"));

    let rest_index = |i: usize| Ir::MethodCall {
        obj: Box::new(Ir::Id(rest.clone())),
        method: "[]".into(),
        args: vec![Arg::positional(Ir::Int(i as i64))],
    };

    let fallback = match variadic {
        Some(base) => {
            let mut args: Vec<Arg> =
                params[..base].iter().map(|p| Arg::positional(Ir::Id(p.clone()))).collect();
            args.push(Arg::positional(Ir::Call {
                callee: Box::new(core_id(ctx, "seqConcat")),
                args: vec![
                    Arg::positional(Ir::ListLit(
                        params[base..].iter().map(|p| Ir::Id(p.clone())).collect(),
                    )),
                    Arg::positional(Ir::Id(rest.clone())),
                ],
            }));
            Ir::MethodCall {
                obj: Box::new(Ir::Id(this_id.clone())),
                method: "$_invoke$vararg".into(),
                args,
            }
        }
        None => Ir::Throw(Box::new(Ir::New {
            class: DartType::named("ArgumentError"),
            ctor: None,
            args: vec![Arg::positional(Ir::Str("wrong number of arguments".into()))],
        })),
    };

    let mut body = fallback;
    for &ext in ext_arities.iter().rev() {
        let overflow = ext - leading;
        let mut args: Vec<Arg> =
            params.iter().map(|p| Arg::positional(Ir::Id(p.clone()))).collect();
        args.extend((0..overflow).map(|i| Arg::positional(rest_index(i))));
        let test = Ir::MethodCall {
            obj: Box::new(Ir::FieldGet {
                obj: Box::new(Ir::Id(rest.clone())),
                field: "length".into(),
            }),
            method: "==".into(),
            args: vec![Arg::positional(Ir::Int(overflow as i64))],
        };
        body = Ir::If {
            test: Box::new(test),
            then: Box::new(Ir::MethodCall {
                obj: Box::new(Ir::Id(this_id.clone())),
                method: invoke_method_name(ext),
                args,
            }),
            els: Box::new(body),
        };
    }

    let mut all_params = params;
    all_params.push(rest);
    MethodDef {
        name: "$_invoke_more".into(),
        kind: MethodKind::Normal,
        ret: DartType::dynamic(),
        params: all_params,
        opt: None,
        body: Some(body),
    }
}

/// The `call` method: optional positionals defaulted to the runtime's
/// missing-argument sentinel; the first missing slot picks the arity.
fn call_method(
    ctx: &mut CompilerContext,
    this_id: &DartId,
    fixed_arities: &[usize],
    variadic: Option<usize>,
) -> MethodDef {
    let leading = ARITY_THRESHOLD - 1;
    let params: Vec<DartId> = (0..leading)
        .map(|_| DartId::local(ctx.gensym("x"), DartType::dynamic()))
        .collect();
    let missing = core_id(ctx, "MISSING_ARG");

    let covered = |k: usize| -> bool {
        fixed_arities.contains(&k) || variadic.map_or(false, |base| k >= base)
    };
    let dispatch = |k: usize| -> Ir {
        if covered(k) {
            Ir::MethodCall {
                obj: Box::new(Ir::Id(this_id.clone())),
                method: invoke_method_name(k),
                args: params[..k].iter().map(|p| Arg::positional(Ir::Id(p.clone()))).collect(),
            }
        } else {
            Ir::Throw(Box::new(Ir::New {
                class: DartType::named("ArgumentError"),
                ctor: None,
                args: vec![Arg::positional(Ir::Str("wrong number of arguments".into()))],
            }))
        }
    };

    // innermost branch: every optional slot was supplied
    let mut body = dispatch(leading);
    for k in (0..leading).rev() {
        let test = Ir::MethodCall {
            obj: Box::new(Ir::Id(params[k].clone())),
            method: "==".into(),
            args: vec![Arg::positional(missing.clone())],
        };
        body = Ir::If {
            test: Box::new(test),
            then: Box::new(dispatch(k)),
            els: Box::new(body),
        };
    }

    let opt = OptParams {
        named: false,
        params: params.into_iter().map(|p| (p, missing.clone())).collect(),
    };
    MethodDef {
        name: "call".into(),
        kind: MethodKind::Normal,
        ret: DartType::dynamic(),
        params: vec![],
        opt: Some(opt),
        body: Some(body),
    }
}

// =============================================================================
// Class assembly (reify* / deftype*)

struct ClassOpts {
    abstract_: bool,
    extends: Option<(Symbol, Option<String>, Vec<Form>)>,
    mixins: Vec<Symbol>,
}

/// Parse leading `:opt value` pairs from a reify*/deftype* tail.
fn parse_class_opts<'a>(mut rest: &'a [Form], whole: &Form) -> Result<(ClassOpts, &'a [Form])> {
    let mut opts = ClassOpts { abstract_: false, extends: None, mixins: vec![] };
    loop {
        match rest.first().and_then(|f| f.as_keyword()).map(|k| &*k.name) {
            Some("abstract") => {
                opts.abstract_ = matches!(rest.get(1), Some(Form::Bool(true)));
                rest = &rest[2..];
            }
            Some("extends") => {
                let spec = rest.get(1).ok_or_else(|| {
                    CompileError::new(
                        ErrorKind::MalformedForm { form: "deftype*", reason: ":extends needs a value" },
                        whole,
                    )
                })?;
                opts.extends = Some(parse_extends(spec, whole)?);
                rest = &rest[2..];
            }
            Some("mixin") => {
                let mixins = rest.get(1).and_then(|f| f.as_vector()).ok_or_else(|| {
                    CompileError::new(
                        ErrorKind::MalformedForm { form: "deftype*", reason: ":mixin needs a vector" },
                        whole,
                    )
                })?;
                opts.mixins = mixins.iter().filter_map(|f| f.as_symbol().cloned()).collect();
                rest = &rest[2..];
            }
            _ => return Ok((opts, rest)),
        }
    }
}

/// `:extends Super`, `:extends (Super args...)`, `:extends (Super.named ...)`.
fn parse_extends(spec: &Form, whole: &Form) -> Result<(Symbol, Option<String>, Vec<Form>)> {
    let (head, args) = match spec.as_seq() {
        Some(items) if !items.is_empty() => (&items[0], items[1..].to_vec()),
        Some(_) => {
            return Err(CompileError::new(
                ErrorKind::MalformedForm { form: "deftype*", reason: "empty :extends form" },
                whole,
            ))
        }
        None => (spec, vec![]),
    };
    let sym = head.as_symbol().ok_or_else(|| {
        CompileError::new(
            ErrorKind::MalformedForm { form: "deftype*", reason: "parent must be a symbol" },
            whole,
        )
    })?;
    match sym.name.split_once('.') {
        Some((class, ctor)) => Ok((
            Symbol { ns: sym.ns.clone(), name: class.into(), meta: None },
            Some(ctor.to_owned()),
            args,
        )),
        None => Ok((sym.clone(), None, args)),
    }
}

/// Split specs into interface symbols and method forms.
fn split_specs(specs: &[Form]) -> (Vec<Symbol>, Vec<&Form>) {
    let mut ifaces = vec![];
    let mut methods = vec![];
    for spec in specs {
        if let Some(sym) = spec.as_symbol() {
            ifaces.push(sym.clone());
        } else if spec.as_seq().is_some() {
            methods.push(spec);
        }
    }
    (ifaces, methods)
}

/// The final Dart name of a method: a `:dart-name` override, then the
/// protocol table of an implemented interface, then operator spelling, then
/// plain munging.
fn method_dart_name(
    ctx: &CompilerContext,
    ifaces: &[Symbol],
    name: &Symbol,
    arity: usize,
) -> String {
    if let Some(Form::Str(explicit)) = name.meta_get("dart-name") {
        return explicit.to_string();
    }
    for iface in ifaces {
        if let Some((ns, def)) = ctx.nses.find_def(iface) {
            if def.meta.protocol.is_some() {
                if let Some(entry) =
                    ctx.nses.resolve_protocol_method(&ns, &iface.name, &name.name, arity)
                {
                    return entry.dart_name.clone();
                }
            }
        }
    }
    use std::str::FromStr;
    if DartOp::from_str(&name.name).is_ok() {
        return name.name.to_string();
    }
    munge(&name.name)
}

/// Analyze one `(name [this args...] body...)` method form.
fn analyze_method(
    ctx: &mut CompilerContext,
    env: &Env,
    ifaces: &[Symbol],
    items: &[Form],
    whole: &Form,
) -> Result<MethodDef> {
    let malformed = |reason| {
        CompileError::new(ErrorKind::MalformedForm { form: "method", reason }, whole.clone())
    };
    let name_sym = items.first().and_then(|f| f.as_symbol()).cloned().ok_or_else(|| {
        malformed("method name must be a symbol")
    })?;
    let params = items.get(1).and_then(|f| f.as_vector()).ok_or_else(|| {
        malformed("missing parameter vector")
    })?;
    if params.is_empty() {
        return Err(malformed("first parameter must name the receiver"));
    }
    let this_sym = params[0].as_symbol().ok_or_else(|| malformed("receiver must be a symbol"))?;

    let dart_name = method_dart_name(ctx, ifaces, &name_sym, params.len());
    let kind = if name_sym.meta_flag("getter") {
        MethodKind::Getter
    } else if name_sym.meta_flag("setter") {
        MethodKind::Setter
    } else {
        use std::str::FromStr;
        if DartOp::from_str(&name_sym.name).is_ok() {
            MethodKind::Operator
        } else {
            MethodKind::Normal
        }
    };

    let parsed = parse_params(&params[1..], whole)?;
    let mut env = env.bind(
        &this_sym.name,
        DartId::local("this", DartType::dynamic()),
    );
    let (fixed, opt, benv) = bind_params(ctx, &env, &parsed)?;
    env = benv;
    if parsed.rest.is_some() {
        return Err(malformed("methods cannot be variadic"));
    }

    let ret = match name_sym.type_tag() {
        Some(tag) => ctx
            .nses
            .resolve_type(&tag)
            .map_err(|e| CompileError::new(e.kind, whole))?,
        None => DartType::dynamic(),
    };

    let body = if items.len() > 2 {
        let benv = env.with_recur(fixed.clone()).tail();
        let mut body = analyze_do(ctx, &benv, &items[2..])?;
        if body.has_recur() {
            body = Ir::Loop {
                bindings: fixed.iter().map(|id| (id.clone(), Ir::Id(id.clone()))).collect(),
                body: Box::new(body),
            };
        }
        Some(body)
    } else {
        None
    };

    Ok(MethodDef { name: dart_name, kind, ret, params: fixed, opt, body })
}

fn analyze_deftype_star(ctx: &mut CompilerContext, env: &Env, form: &Form) -> Result<Ir> {
    let items = form.as_seq().expect("deftype* is a seq");
    let name_sym = items.get(1).and_then(|f| f.as_symbol()).cloned().ok_or_else(|| {
        CompileError::new(
            ErrorKind::MalformedForm { form: "deftype*", reason: "expected (deftype* Name [fields] ...)" },
            form,
        )
    })?;
    let field_forms = items.get(2).and_then(|f| f.as_vector()).ok_or_else(|| {
        CompileError::new(
            ErrorKind::MalformedForm { form: "deftype*", reason: "missing field vector" },
            form,
        )
    })?;
    let (opts, specs) = parse_class_opts(&items[3..], form)?;
    let (ifaces, method_forms) = split_specs(specs);

    let dart_name = munge(&name_sym.name);
    // the expander may have pre-registered a protocol record under this name
    let protocol = ctx
        .nses
        .lookup_def(ctx.nses.current_name(), &name_sym.name)
        .and_then(|def| def.meta.protocol.clone());
    ctx.nses.define(
        &name_sym.name,
        DefRecord {
            dart_name: dart_name.clone(),
            kind: DefKind::Class,
            meta: DefMeta { protocol: protocol.clone(), ..DefMeta::default() },
            source: String::new(),
        },
    );

    // typed fields, bound into scope for method bodies
    let mut env = env.clone();
    let mut fields = vec![];
    for field_form in field_forms {
        let sym = field_form.as_symbol().ok_or_else(|| {
            CompileError::new(
                ErrorKind::MalformedForm { form: "deftype*", reason: "field must be a symbol" },
                form,
            )
        })?;
        let ty = match sym.type_tag() {
            Some(tag) => ctx
                .nses
                .resolve_type(&tag)
                .map_err(|e| CompileError::new(e.kind, form))?,
            None => DartType::dynamic(),
        };
        let mut id = DartId::local(munge(&sym.name), ty);
        if sym.meta_flag("mutable") {
            id = id.mutable();
        }
        env = env.bind(&sym.name, id.clone());
        fields.push(id);
    }

    let mut cls = assemble_class(ctx, &env, &dart_name, opts, &ifaces, &method_forms, form)?;
    cls.fields.splice(0..0, fields.iter().cloned());
    cls.ctor_params.splice(
        0..0,
        fields.iter().map(|f| CtorParam::Field(f.name.clone())),
    );

    let source = {
        let alias = core_alias(ctx);
        emit::render_class(&cls, &alias)
    };
    ctx.nses.define(
        &name_sym.name,
        DefRecord { dart_name, kind: DefKind::Class, meta: DefMeta { protocol, ..DefMeta::default() }, source },
    );
    Ok(Ir::Nil)
}

fn analyze_reify(ctx: &mut CompilerContext, env: &Env, items: &[Form], whole: &Form) -> Result<Ir> {
    let (opts, specs) = parse_class_opts(&items[1..], whole)?;
    let (ifaces, method_forms) = split_specs(specs);

    let cls_name = ctx.nses.fresh_class_name("reify");
    ctx.nses
        .define(&cls_name, DefRecord::predeclaration(&cls_name, DefKind::Class));

    // parent constructor arguments evaluate at the reify site
    let mut lifter = Lifter::default();
    let mut site_args: Vec<Ir> = vec![];
    let mut super_params: Vec<DartId> = vec![];
    let extends = match &opts.extends {
        None => None,
        Some((parent_sym, ctor, arg_forms)) => {
            for arg in arg_forms.iter().rev() {
                site_args.insert(0, lifter.operand(ctx, env, arg)?);
            }
            for site in &site_args {
                super_params
                    .push(DartId::local(ctx.gensym("super$arg"), site.ty()));
            }
            Some((type_from_symbol(ctx, parent_sym)?, ctor.clone()))
        }
    };

    let opts_no_extends = ClassOpts { abstract_: opts.abstract_, extends: None, mixins: opts.mixins };
    let mut cls = assemble_class(ctx, env, &cls_name, opts_no_extends, &ifaces, &method_forms, whole)?;
    if let Some((parent, ctor)) = extends {
        cls.extends = Some(parent);
        cls.super_ctor = ctor;
        cls.super_args = super_params.iter().map(|p| Ir::Id(p.clone())).collect();
    }

    // closure: free locals of the method bodies become fields
    let mut captured: Vec<DartId> = vec![];
    for method in &cls.methods {
        if let Some(body) = &method.body {
            let mut bound: Vec<String> = method.params.iter().map(|p| p.name.clone()).collect();
            bound.push("this".into());
            if let Some(opt) = &method.opt {
                bound.extend(opt.params.iter().map(|(p, _)| p.name.clone()));
            }
            for free in free_ids(body, &bound) {
                if !captured.iter().any(|c| c.name == free.name) {
                    captured.push(free);
                }
            }
        }
    }
    cls.fields = captured.clone();
    cls.ctor_params = captured
        .iter()
        .map(|c| CtorParam::Field(c.name.clone()))
        .chain(super_params.iter().map(|p| CtorParam::Plain(p.clone())))
        .collect();

    let source = {
        let alias = core_alias(ctx);
        emit::render_class(&cls, &alias)
    };
    ctx.nses.define(
        &cls_name,
        DefRecord { dart_name: cls_name.clone(), kind: DefKind::Class, meta: DefMeta::default(), source },
    );

    let mut args: Vec<Arg> =
        captured.into_iter().map(|c| Arg::positional(Ir::Id(c))).collect();
    args.extend(site_args.into_iter().map(Arg::positional));
    Ok(lifter.wrap(Ir::New { class: DartType::named(&cls_name), ctor: None, args }))
}

/// The parts shared by reify* and deftype*: option handling, interfaces,
/// methods, and the noSuchMethod rule.
fn assemble_class(
    ctx: &mut CompilerContext,
    env: &Env,
    _name: &str,
    opts: ClassOpts,
    ifaces: &[Symbol],
    method_forms: &[&Form],
    whole: &Form,
) -> Result<ClassDef> {
    let mut implements = vec![];
    for iface in ifaces {
        implements.push(type_from_symbol(ctx, iface)?);
    }
    let mut mixins = vec![];
    for mixin in &opts.mixins {
        mixins.push(type_from_symbol(ctx, mixin)?);
    }

    let (extends, super_ctor, super_args) = match &opts.extends {
        None => (None, None, vec![]),
        Some((parent_sym, ctor, arg_forms)) => {
            // deftype's super args may refer to the fields already in `env`
            let mut args = vec![];
            for arg in arg_forms {
                let ir = analyze(ctx, &env.expr(), arg)?;
                if ir.is_statement_like() {
                    return Err(CompileError::new(
                        ErrorKind::MalformedForm {
                            form: "deftype*",
                            reason: "super constructor arguments must be plain expressions",
                        },
                        whole,
                    ));
                }
                args.push(ir);
            }
            (Some(type_from_symbol(ctx, parent_sym)?), ctor.clone(), args)
        }
    };

    let mut methods = vec![];
    for method_form in method_forms {
        let items = method_form.as_seq().expect("method specs are seqs");
        methods.push(analyze_method(ctx, env, ifaces, items, whole)?);
    }

    let need_no_such_method =
        !implements.is_empty() && !methods.iter().any(|m| m.name == "noSuchMethod");

    Ok(ClassDef {
        name: _name.to_owned(),
        abstract_: opts.abstract_,
        extends,
        super_ctor,
        super_args,
        implements,
        mixins,
        fields: vec![],
        ctor_params: vec![],
        methods,
        need_no_such_method,
    })
}
