//! The Dart emitter.
//!
//! IR nodes are written against a [`Locus`], the contextual print strategy of
//! the position being filled: a statement, a return, an argument, the
//! right-hand side of a declaration, and so on.  Because the analyzer has
//! already lifted every non-trivial operand into a `let` binding, any node
//! reaching an expression locus here really is a Dart expression; the
//! statement-shaped nodes (`let`/`if`/`loop`/`case`/`try`/`throw`/`recur`)
//! only ever meet statement-shaped loci.

use std::io::{self, Write};
use std::str::FromStr;

use thiserror::Error;

use crate::ir::{
    Arg, Binding, ClassDef, CtorParam, DartId, DartOp, FnDef, FnMarker, Ir, MethodDef, MethodKind,
    OptParams, Truth,
};

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[error(transparent)]
pub struct Error(io::Error);

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error(e)
    }
}

/// Arity threshold: calls with this many arguments or more dispatch through
/// the packed-rest overflow method.
pub const ARITY_THRESHOLD: usize = 10;

const INDENT: usize = 2;

// =============================================================================
// Writer

/// Line-oriented output writer.
///
/// Keeps the current line in a buffer and writes it out on [`next_line`],
/// prefixed with the indent that was current when the line started.
///
/// [`next_line`]: Writer::next_line
pub struct Writer<W: io::Write> {
    writer: Option<W>,
    line_buffer: Vec<u8>,
    indent: usize,
    pending_data: bool,
    /// Alias under which the runtime core library is imported.
    core_alias: String,
    /// Loop bindings of the enclosing `do..while` emissions, innermost last.
    loop_stack: Vec<Vec<DartId>>,
    /// Caught-exception identifiers of enclosing catch bodies, innermost
    /// last; consulted to decide between `throw e` and `rethrow`.
    caught: Vec<String>,
    /// Counter for emitter-introduced temporaries (`$r` names cannot clash
    /// with analyzer gensyms, whose suffixes are purely numeric).
    tmp_counter: u32,
}

/// An unfinished line is written on drop so partial output is not lost;
/// errors at that point are ignored, as in any Drop.
impl<W: io::Write> Drop for Writer<W> {
    fn drop(&mut self) {
        let _ = self.flush_incomplete_line();
    }
}

impl<W: io::Write> Writer<W> {
    pub fn new(writer: W, core_alias: &str) -> Self {
        Writer {
            writer: Some(writer),
            line_buffer: vec![],
            indent: 0,
            pending_data: false,
            core_alias: core_alias.into(),
            loop_stack: vec![],
            caught: vec![],
            tmp_counter: 0,
        }
    }

    /// Recover the wrapped writer, flushing any unfinished line first.
    pub fn into_inner(mut self) -> Result<W> {
        self.flush_incomplete_line()?;
        Ok(self.writer.take().expect("writer already taken. This is a bug!"))
    }

    fn flush_incomplete_line(&mut self) -> Result {
        if self.pending_data {
            if let Some(w) = self.writer.as_mut() {
                w.write_all(&self.line_buffer)?;
            }
            self.pending_data = false;
        }
        Ok(())
    }

    /// Append to the current line.
    pub fn put(&mut self, text: &str) -> Result {
        assert!(!text.contains('\n'), "newline appended to line. This is a bug!");
        self.line_buffer.extend_from_slice(text.as_bytes());
        self.pending_data = true;
        Ok(())
    }

    pub fn put_display(&mut self, value: impl std::fmt::Display) -> Result {
        write!(&mut self.line_buffer, "{}", value)?;
        self.pending_data = true;
        Ok(())
    }

    /// Commit the current line and start a new one at the same indent.
    pub fn next_line(&mut self) -> Result {
        if !self.pending_data {
            self.line_buffer.truncate(0);
        }
        self.line_buffer.push(b'\n');
        self.writer
            .as_mut()
            .expect("writer already taken. This is a bug!")
            .write_all(&self.line_buffer)?;
        self.pending_data = false;
        self.line_buffer.clear();
        self.line_buffer.resize(self.indent, b' ');
        Ok(())
    }

    pub fn indent(&mut self) {
        self.change_indent(INDENT as isize);
    }

    pub fn dedent(&mut self) {
        self.change_indent(-(INDENT as isize));
    }

    fn change_indent(&mut self, delta: isize) {
        assert!(!self.pending_data, "indent changed mid-line. This is a bug!");
        let new = self.indent as isize + delta;
        assert!(new >= 0, "dedent past the margin. This is a bug!");
        self.indent = new as usize;
        self.line_buffer.resize(self.indent, b' ');
    }

    fn fresh_tmp(&mut self) -> String {
        self.tmp_counter += 1;
        format!("t$r{}", self.tmp_counter)
    }
}

// =============================================================================
// Loci

/// The print strategy of the position being emitted into.
#[derive(Debug, Copy, Clone)]
pub enum Locus<'a> {
    /// A statement on its own line.
    Stmt,
    /// `return <expr>;`; exits control flow.
    Return,
    /// A bare expression.
    Expr,
    /// An expression wrapped in parentheses.
    Paren,
    /// A positional argument (commas are the caller's business).
    Arg,
    /// `name: <expr>` argument.
    NamedArg(&'a str),
    /// A named function declaration position.
    NamedFn(&'a FnDef),
    /// `var name = <expr>;`, with a declare-then-assign fallback for
    /// statement-shaped values.
    VarDecl(&'a DartId),
    /// `target = <expr>;`
    Assign(&'a str),
}

impl Locus<'_> {
    fn open<W: io::Write>(&self, w: &mut Writer<W>) -> Result {
        match self {
            Locus::Stmt | Locus::Expr | Locus::Arg => Ok(()),
            Locus::Return => w.put("return "),
            Locus::Paren => w.put("("),
            Locus::NamedArg(name) => {
                w.put(name)?;
                w.put(": ")
            }
            Locus::VarDecl(id) => {
                w.put("var ")?;
                w.put(&id.name)?;
                w.put(" = ")
            }
            Locus::Assign(target) => {
                w.put(target)?;
                w.put(" = ")
            }
            Locus::NamedFn(_) => panic!("expression in named-fn locus. This is a bug!"),
        }
    }

    fn close<W: io::Write>(&self, w: &mut Writer<W>) -> Result {
        match self {
            Locus::Expr | Locus::Arg | Locus::NamedArg(_) => Ok(()),
            Locus::Paren => w.put(")"),
            Locus::Stmt | Locus::Return | Locus::VarDecl(_) | Locus::Assign(_) => {
                w.put(";")?;
                w.next_line()
            }
            Locus::NamedFn(_) => Ok(()),
        }
    }

    fn is_expression(&self) -> bool {
        matches!(self, Locus::Expr | Locus::Paren | Locus::Arg | Locus::NamedArg(_))
    }
}

/// Whether control flow leaves this position without falling through, given
/// the locus its tail is emitted against.
fn exits(ir: &Ir, locus: &Locus) -> bool {
    match ir {
        Ir::Throw(_) | Ir::Recur { .. } => true,
        Ir::Let { body, .. } => exits(body, locus),
        Ir::If { then, els, .. } => exits(then, locus) && exits(els, locus),
        Ir::Case { clauses, default, .. } => {
            clauses.iter().all(|c| exits(&c.body, locus)) && exits(default, locus)
        }
        Ir::Try { body, catches, .. } => {
            exits(body, locus) && catches.iter().all(|c| exits(&c.body, locus))
        }
        Ir::Loop { body, .. } => exits(body, locus),
        _ => matches!(locus, Locus::Return),
    }
}

/// `var name;`, the declare half of a variable-declaration locus.
fn declare<W: io::Write>(w: &mut Writer<W>, id: &DartId) -> Result {
    w.put("var ")?;
    w.put(&id.name)?;
    w.put(";")?;
    w.next_line()
}

// =============================================================================
// Emission

pub fn emit_ir<W: io::Write>(w: &mut Writer<W>, ir: &Ir, locus: &Locus) -> Result {
    // Statement-shaped nodes assigning through a declaration first declare,
    // then assign from each arm.  `let` is exempt: its bindings are
    // statements but its body takes the outer locus directly.
    if ir.is_statement_like() && !matches!(ir, Ir::Let { .. }) {
        if let Locus::VarDecl(id) = locus {
            if matches!(ir, Ir::Throw(_)) {
                // A throw never produces a value to assign.
                return emit_ir(w, ir, &Locus::Stmt);
            }
            declare(w, id)?;
            return emit_ir(w, ir, &Locus::Assign(&id.name));
        }
        assert!(
            !locus.is_expression(),
            "statement-shaped IR in expression locus. This is a bug!"
        );
    }

    match ir {
        Ir::Let { bindings, body } => {
            for binding in bindings {
                emit_binding(w, binding)?;
            }
            emit_ir(w, body, locus)
        }

        Ir::If { test, then, els } => emit_if(w, test, then, els, locus),

        Ir::Loop { bindings, body } => emit_loop(w, bindings, body, locus),

        Ir::Recur { args } => emit_recur(w, args),

        Ir::Case { scrutinee, clauses, default } => {
            emit_case(w, scrutinee, clauses, default, locus)
        }

        Ir::Try { body, catches, finally } => emit_try(w, body, catches, finally.as_deref(), locus),

        Ir::Throw(expr) => {
            // Rethrowing the identifier bound by the enclosing catch clause
            // has dedicated syntax.
            if let Some(id) = expr.id() {
                if w.caught.last() == Some(&id.name) {
                    w.put("rethrow;")?;
                    return w.next_line();
                }
            }
            w.put("throw ")?;
            emit_ir(w, expr, &Locus::Expr)?;
            w.put(";")?;
            w.next_line()
        }

        Ir::Fn(def) => match locus {
            Locus::NamedFn(_) => emit_fn(w, def, true),
            _ => {
                locus.open(w)?;
                emit_fn(w, def, false)?;
                locus.close(w)
            }
        },

        // everything below is an ordinary expression
        _ => {
            if let Locus::NamedFn(def) = locus {
                panic!(
                    "non-fn value {:?} for named function '{}'. This is a bug!",
                    ir.ty(),
                    def.name.as_deref().unwrap_or("?")
                );
            }
            // A bare expression statement with no effect gets dropped.
            if matches!(locus, Locus::Stmt) && matches!(ir, Ir::Nil) {
                return Ok(());
            }
            locus.open(w)?;
            emit_expr(w, ir)?;
            locus.close(w)
        }
    }
}

fn emit_binding<W: io::Write>(w: &mut Writer<W>, binding: &Binding) -> Result {
    match &binding.id {
        None => emit_ir(w, &binding.value, &Locus::Stmt),
        Some(id) => match &binding.value {
            Ir::Fn(def) => {
                let named = FnDef { name: Some(id.name.clone()), ..(**def).clone() };
                emit_ir(w, &Ir::Fn(Box::new(named.clone())), &Locus::NamedFn(&named))
            }
            value => emit_ir(w, value, &Locus::VarDecl(id)),
        },
    }
}

/// Write the truthiness-correct Dart condition for a test atom.
fn emit_test<W: io::Write>(w: &mut Writer<W>, test: &Ir) -> Result {
    match test.truth() {
        Truth::Boolean => emit_expr(w, test),
        Truth::Some => {
            emit_expr(w, test)?;
            w.put(" != null")
        }
        Truth::Unknown => {
            emit_expr(w, test)?;
            w.put(" != false && ")?;
            emit_expr(w, test)?;
            w.put(" != null")
        }
    }
}

fn emit_if<W: io::Write>(
    w: &mut Writer<W>,
    test: &Ir,
    then: &Ir,
    els: &Ir,
    locus: &Locus,
) -> Result {
    w.put("if (")?;
    emit_test(w, test)?;
    w.put(") {")?;
    w.next_line()?;
    w.indent();
    emit_ir(w, then, locus)?;
    w.dedent();

    let skip_else = matches!(els, Ir::Nil) && matches!(locus, Locus::Stmt);
    if exits(then, locus) {
        // The then-branch left; let the else contents fall through.
        w.put("}")?;
        w.next_line()?;
        if !skip_else {
            emit_ir(w, els, locus)?;
        }
        Ok(())
    } else if skip_else {
        w.put("}")?;
        w.next_line()
    } else {
        w.put("} else {")?;
        w.next_line()?;
        w.indent();
        emit_ir(w, els, locus)?;
        w.dedent();
        w.put("}")?;
        w.next_line()
    }
}

fn emit_loop<W: io::Write>(
    w: &mut Writer<W>,
    bindings: &[(DartId, Ir)],
    body: &Ir,
    locus: &Locus,
) -> Result {
    for (id, init) in bindings {
        // Function parameters loop over themselves; no declaration needed.
        if init.id().map_or(false, |i| i.name == id.name) {
            continue;
        }
        emit_ir(w, init, &Locus::VarDecl(id))?;
    }
    w.put("do {")?;
    w.next_line()?;
    w.indent();
    w.loop_stack.push(bindings.iter().map(|(id, _)| id.clone()).collect());
    emit_ir(w, body, locus)?;
    if !exits(body, locus) {
        w.put("break;")?;
        w.next_line()?;
    }
    w.loop_stack.pop();
    w.dedent();
    w.put("} while (true);")?;
    w.next_line()
}

fn emit_recur<W: io::Write>(w: &mut Writer<W>, args: &[Ir]) -> Result {
    let bindings = w.loop_stack.last().cloned().expect("recur outside loop. This is a bug!");
    assert_eq!(bindings.len(), args.len(), "recur arity survived analysis. This is a bug!");

    // Sequential reassignment is wrong when an argument reads a binding that
    // an earlier assignment would already have clobbered.
    let hazard = args.iter().enumerate().any(|(i, arg)| {
        bindings[..i].iter().any(|b| arg.mentions(&b.name))
    });

    if hazard {
        // Two phases: compute everything that touches a loop binding into
        // temporaries, then assign.
        let mut staged: Vec<Option<String>> = vec![];
        for arg in args {
            if bindings.iter().any(|b| arg.mentions(&b.name)) {
                let tmp = w.fresh_tmp();
                w.put("var ")?;
                w.put(&tmp)?;
                w.put(" = ")?;
                emit_expr(w, arg)?;
                w.put(";")?;
                w.next_line()?;
                staged.push(Some(tmp));
            } else {
                staged.push(None);
            }
        }
        for (i, arg) in args.iter().enumerate() {
            match &staged[i] {
                Some(tmp) => {
                    w.put(&bindings[i].name)?;
                    w.put(" = ")?;
                    w.put(tmp)?;
                    w.put(";")?;
                    w.next_line()?;
                }
                None => {
                    if arg.id().map_or(true, |id| id.name != bindings[i].name) {
                        emit_ir(w, arg, &Locus::Assign(&bindings[i].name))?;
                    }
                }
            }
        }
    } else {
        for (binding, arg) in bindings.iter().zip(args) {
            if arg.id().map_or(false, |id| id.name == binding.name) {
                continue; // self-assignment
            }
            emit_ir(w, arg, &Locus::Assign(&binding.name))?;
        }
    }
    w.put("continue;")?;
    w.next_line()
}

fn emit_case<W: io::Write>(
    w: &mut Writer<W>,
    scrutinee: &Ir,
    clauses: &[crate::ir::CaseClause],
    default: &Ir,
    locus: &Locus,
) -> Result {
    w.put("switch (")?;
    emit_expr(w, scrutinee)?;
    w.put(") {")?;
    w.next_line()?;
    w.indent();
    for clause in clauses {
        for value in &clause.values {
            w.put("case ")?;
            emit_expr(w, value)?;
            w.put(":")?;
            w.next_line()?;
        }
        w.indent();
        emit_ir(w, &clause.body, locus)?;
        if !exits(&clause.body, locus) {
            w.put("break;")?;
            w.next_line()?;
        }
        w.dedent();
    }
    w.put("default:")?;
    w.next_line()?;
    w.indent();
    emit_ir(w, default, locus)?;
    if !exits(default, locus) {
        w.put("break;")?;
        w.next_line()?;
    }
    w.dedent();
    w.dedent();
    w.put("}")?;
    w.next_line()
}

fn emit_try<W: io::Write>(
    w: &mut Writer<W>,
    body: &Ir,
    catches: &[crate::ir::CatchClause],
    finally: Option<&Ir>,
    locus: &Locus,
) -> Result {
    w.put("try {")?;
    w.next_line()?;
    w.indent();
    emit_ir(w, body, locus)?;
    w.dedent();
    for catch in catches {
        w.put("} on ")?;
        w.put_display(&catch.class)?;
        w.put(" catch (")?;
        w.put(&catch.exn.name)?;
        if let Some(trace) = &catch.trace {
            w.put(", ")?;
            w.put(&trace.name)?;
        }
        w.put(") {")?;
        w.next_line()?;
        w.indent();
        w.caught.push(catch.exn.name.clone());
        emit_ir(w, &catch.body, locus)?;
        w.caught.pop();
        w.dedent();
    }
    if let Some(finally) = finally {
        w.put("} finally {")?;
        w.next_line()?;
        w.indent();
        emit_ir(w, finally, &Locus::Stmt)?;
        w.dedent();
    }
    w.put("}")?;
    w.next_line()
}

// -----------------------------------------------------------------------------
// Expressions

fn emit_expr<W: io::Write>(w: &mut Writer<W>, ir: &Ir) -> Result {
    match ir {
        Ir::Nil => w.put("null"),
        Ir::Bool(b) => w.put_display(b),
        Ir::Int(n) => w.put_display(n),
        Ir::Double(x) => emit_double(w, *x),
        Ir::Str(s) => {
            w.put("\"")?;
            w.put(&escape_string(s))?;
            w.put("\"")
        }
        Ir::Id(id) => w.put(&id.name),
        Ir::ListLit(items) => {
            w.put("[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    w.put(", ")?;
                }
                emit_expr(w, item)?;
            }
            w.put("]")
        }
        Ir::FieldGet { obj, field } => {
            emit_receiver(w, obj)?;
            w.put(".")?;
            w.put(field)
        }
        Ir::MethodCall { obj, method, args } => emit_method_call(w, obj, method, args),
        Ir::Set { target, value } => {
            emit_expr(w, target)?;
            w.put(" = ")?;
            emit_ir(w, value, &Locus::Expr)
        }
        Ir::New { class, ctor, args } => {
            let bare = crate::ir::DartType { nullable: false, ..class.clone() };
            w.put_display(&bare)?;
            if let Some(ctor) = ctor {
                w.put(".")?;
                w.put(ctor)?;
            }
            emit_args(w, args)
        }
        Ir::Is { expr, ty } => {
            w.put("(")?;
            emit_expr(w, expr)?;
            w.put(" is ")?;
            w.put_display(ty)?;
            w.put(")")
        }
        Ir::Cast { expr, ty } => {
            w.put("(")?;
            emit_expr(w, expr)?;
            w.put(" as ")?;
            w.put_display(ty)?;
            w.put(")")
        }
        Ir::Call { callee, args } => emit_call(w, callee, args),
        Ir::Fn(def) => emit_fn(w, def, false),
        _ => panic!("statement-shaped IR reached emit_expr: {:?}. This is a bug!", ir),
    }
}

fn emit_double<W: io::Write>(w: &mut Writer<W>, x: f64) -> Result {
    if x.is_nan() {
        return w.put("double.nan");
    }
    if x == f64::INFINITY {
        return w.put("double.infinity");
    }
    if x == f64::NEG_INFINITY {
        return w.put("double.negativeInfinity");
    }
    let mut s = format!("{}", x);
    if !s.contains('.') && !s.contains('e') {
        s.push_str(".0");
    }
    w.put(&s)
}

/// Receivers that read cleanly stay bare; anything else is parenthesized.
fn emit_receiver<W: io::Write>(w: &mut Writer<W>, obj: &Ir) -> Result {
    match obj {
        Ir::Id(_) | Ir::FieldGet { .. } | Ir::Str(_) => emit_expr(w, obj),
        _ => {
            w.put("(")?;
            emit_expr(w, obj)?;
            w.put(")")
        }
    }
}

fn emit_method_call<W: io::Write>(
    w: &mut Writer<W>,
    obj: &Ir,
    method: &str,
    args: &[Arg],
) -> Result {
    if let Ok(op) = DartOp::from_str(method) {
        return emit_operator(w, op, obj, args);
    }
    emit_receiver(w, obj)?;
    w.put(".")?;
    w.put(method)?;
    emit_args(w, args)
}

fn emit_operator<W: io::Write>(w: &mut Writer<W>, op: DartOp, obj: &Ir, args: &[Arg]) -> Result {
    let paren = |w: &mut Writer<W>, ir: &Ir| -> Result {
        w.put("(")?;
        emit_expr(w, ir)?;
        w.put(")")
    };

    // `-` doubles as negation when there is nothing to subtract.
    if op.is_prefix() || (op == DartOp::Sub && args.is_empty()) {
        let spelling: &'static str = op.into();
        w.put(spelling)?;
        return paren(w, obj);
    }

    match op {
        DartOp::Index => {
            paren(w, obj)?;
            w.put("[")?;
            emit_ir(w, &args[0].value, &Locus::Expr)?;
            w.put("]")
        }
        DartOp::IndexSet => {
            paren(w, obj)?;
            w.put("[")?;
            emit_ir(w, &args[0].value, &Locus::Expr)?;
            w.put("] = ")?;
            emit_ir(w, &args[1].value, &Locus::Expr)
        }
        _ => {
            let rhs = &args[0].value;
            // `&` and `|` double into their short-circuit forms when both
            // operands are known booleans.
            let spelling = match op {
                DartOp::BitAnd if obj.truth() == Truth::Boolean && rhs.truth() == Truth::Boolean => {
                    "&&"
                }
                DartOp::BitOr if obj.truth() == Truth::Boolean && rhs.truth() == Truth::Boolean => {
                    "||"
                }
                _ => op.into(),
            };
            paren(w, obj)?;
            w.put(spelling)?;
            paren(w, rhs)
        }
    }
}

fn emit_args<W: io::Write>(w: &mut Writer<W>, args: &[Arg]) -> Result {
    w.put("(")?;
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            w.put(", ")?;
        }
        match &arg.name {
            Some(name) => emit_ir(w, &arg.value, &Locus::NamedArg(name))?,
            None => emit_ir(w, &arg.value, &Locus::Arg)?,
        }
    }
    w.put(")")
}

fn emit_call<W: io::Write>(w: &mut Writer<W>, callee: &Ir, args: &[Arg]) -> Result {
    let marker = callee.id().map_or(FnMarker::Unknown, |id| id.marker);
    match marker {
        FnMarker::Native => {
            emit_receiver(w, callee)?;
            emit_args(w, args)
        }
        FnMarker::Ifn => emit_invoke(w, callee, args),
        FnMarker::Unknown => {
            // Decide at runtime; the analyzer guarantees the callee is an
            // identifier here, so mentioning it three times is safe.
            w.put("((")?;
            emit_expr(w, callee)?;
            w.put(" is ")?;
            let core = w.core_alias.clone();
            w.put(&core)?;
            w.put(".IFn) ? ")?;
            emit_invoke(w, callee, args)?;
            w.put(" : (")?;
            emit_expr(w, callee)?;
            w.put(" as dynamic)")?;
            emit_args(w, args)?;
            w.put(")")
        }
    }
}

/// Arity-indexed dispatch through the function interface.
fn emit_invoke<W: io::Write>(w: &mut Writer<W>, callee: &Ir, args: &[Arg]) -> Result {
    let core = w.core_alias.clone();
    w.put("(")?;
    emit_expr(w, callee)?;
    w.put(" as ")?;
    w.put(&core)?;
    w.put(".IFn).")?;
    if args.len() < ARITY_THRESHOLD {
        w.put(&format!("$_invoke${}", args.len()))?;
        emit_args(w, args)
    } else {
        // T-1 positionals, the rest packed into a list.
        w.put("$_invoke_more(")?;
        for arg in &args[..ARITY_THRESHOLD - 1] {
            emit_ir(w, &arg.value, &Locus::Arg)?;
            w.put(", ")?;
        }
        w.put("[")?;
        for (i, arg) in args[ARITY_THRESHOLD - 1..].iter().enumerate() {
            if i > 0 {
                w.put(", ")?;
            }
            emit_ir(w, &arg.value, &Locus::Arg)?;
        }
        w.put("])")
    }
}

// -----------------------------------------------------------------------------
// Functions

fn emit_params<W: io::Write>(
    w: &mut Writer<W>,
    params: &[DartId],
    opt: Option<&OptParams>,
) -> Result {
    w.put("(")?;
    let mut first = true;
    for param in params {
        if !first {
            w.put(", ")?;
        }
        first = false;
        if !param.ty.is_dynamic() {
            w.put_display(&param.ty)?;
            w.put(" ")?;
        }
        w.put(&param.name)?;
    }
    if let Some(opt) = opt {
        if !first {
            w.put(", ")?;
        }
        w.put(if opt.named { "{" } else { "[" })?;
        for (i, (param, default)) in opt.params.iter().enumerate() {
            if i > 0 {
                w.put(", ")?;
            }
            if !param.ty.is_dynamic() {
                w.put_display(&param.ty)?;
                w.put(" ")?;
            }
            w.put(&param.name)?;
            w.put(" = ")?;
            emit_ir(w, default, &Locus::Expr)?;
        }
        w.put(if opt.named { "}" } else { "]" })?;
    }
    w.put(")")
}

/// A function, either as a named declaration or a closure expression.
fn emit_fn<W: io::Write>(w: &mut Writer<W>, def: &FnDef, named: bool) -> Result {
    if named {
        w.put_display(&def.ret)?;
        w.put(" ")?;
        w.put(def.name.as_deref().expect("named fn without a name. This is a bug!"))?;
    }
    emit_params(w, &def.params, def.opt.as_ref())?;
    w.put(" {")?;
    w.next_line()?;
    w.indent();
    let body_locus = if def.ret == crate::ir::DartType::void() { Locus::Stmt } else { Locus::Return };
    // the body is a fresh function: loops outside it are not recur targets
    let saved = std::mem::take(&mut w.loop_stack);
    emit_ir(w, &def.body, &body_locus)?;
    w.loop_stack = saved;
    w.dedent();
    w.put("}")?;
    if named {
        w.next_line()?;
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// Classes

pub fn write_class<W: io::Write>(w: &mut Writer<W>, cls: &ClassDef) -> Result {
    if cls.abstract_ {
        w.put("abstract ")?;
    }
    w.put("class ")?;
    w.put(&cls.name)?;
    if let Some(parent) = &cls.extends {
        w.put(" extends ")?;
        w.put_display(parent)?;
    }
    if !cls.mixins.is_empty() {
        w.put(" with ")?;
        for (i, mixin) in cls.mixins.iter().enumerate() {
            if i > 0 {
                w.put(", ")?;
            }
            w.put_display(mixin)?;
        }
    }
    if !cls.implements.is_empty() {
        w.put(" implements ")?;
        for (i, iface) in cls.implements.iter().enumerate() {
            if i > 0 {
                w.put(", ")?;
            }
            w.put_display(iface)?;
        }
    }
    w.put(" {")?;
    w.next_line()?;
    w.indent();

    for field in &cls.fields {
        if !field.mutable {
            w.put("final ")?;
        }
        if field.ty.is_dynamic() {
            if field.mutable {
                w.put("var ")?;
            }
        } else {
            w.put_display(&field.ty)?;
            w.put(" ")?;
        }
        w.put(&field.name)?;
        w.put(";")?;
        w.next_line()?;
    }

    if !cls.ctor_params.is_empty() || !cls.super_args.is_empty() {
        w.put(&cls.name)?;
        w.put("(")?;
        for (i, param) in cls.ctor_params.iter().enumerate() {
            if i > 0 {
                w.put(", ")?;
            }
            match param {
                CtorParam::Field(name) => {
                    w.put("this.")?;
                    w.put(name)?;
                }
                CtorParam::Plain(id) => {
                    if !id.ty.is_dynamic() {
                        w.put_display(&id.ty)?;
                        w.put(" ")?;
                    }
                    w.put(&id.name)?;
                }
            }
        }
        w.put(")")?;
        if !cls.super_args.is_empty() || cls.super_ctor.is_some() {
            w.put(" : super")?;
            if let Some(ctor) = &cls.super_ctor {
                w.put(".")?;
                w.put(ctor)?;
            }
            w.put("(")?;
            for (i, arg) in cls.super_args.iter().enumerate() {
                if i > 0 {
                    w.put(", ")?;
                }
                emit_ir(w, arg, &Locus::Arg)?;
            }
            w.put(")")?;
        }
        w.put(";")?;
        w.next_line()?;
    }

    for method in &cls.methods {
        write_method(w, method)?;
    }

    if cls.need_no_such_method {
        w.put("dynamic noSuchMethod(Invocation invocation) => super.noSuchMethod(invocation);")?;
        w.next_line()?;
    }

    w.dedent();
    w.put("}")?;
    w.next_line()
}

fn write_method<W: io::Write>(w: &mut Writer<W>, method: &MethodDef) -> Result {
    match method.kind {
        MethodKind::Getter => {
            w.put_display(&method.ret)?;
            w.put(" get ")?;
            w.put(&method.name)?;
        }
        MethodKind::Setter => {
            w.put("set ")?;
            w.put(&method.name)?;
            emit_params(w, &method.params, None)?;
        }
        MethodKind::Operator => {
            w.put_display(&method.ret)?;
            w.put(" operator ")?;
            w.put(&method.name)?;
            emit_params(w, &method.params, method.opt.as_ref())?;
        }
        MethodKind::Normal => {
            w.put_display(&method.ret)?;
            w.put(" ")?;
            w.put(&method.name)?;
            emit_params(w, &method.params, method.opt.as_ref())?;
        }
    }

    match &method.body {
        None => {
            w.put(";")?;
            w.next_line()
        }
        Some(body) => {
            w.put(" {")?;
            w.next_line()?;
            w.indent();
            let locus =
                if method.ret == crate::ir::DartType::void() { Locus::Stmt } else { Locus::Return };
            emit_ir(w, body, &locus)?;
            w.dedent();
            w.put("}")?;
            w.next_line()
        }
    }
}

// =============================================================================
// String escaping

/// C-style escapes for Dart double-quoted strings.  The interpolation sigil
/// is escaped so emitted literals never interpolate.
pub fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '\u{8}' => out.push_str("\\b"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{c}' => out.push_str("\\f"),
            '\u{b}' => out.push_str("\\v"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '$' => out.push_str("\\$"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

// =============================================================================
// String renderers

fn render(core_alias: &str, f: impl FnOnce(&mut Writer<Vec<u8>>) -> Result) -> String {
    let mut w = Writer::new(vec![], core_alias);
    f(&mut w).expect("failed to write to vec. This is a bug!");
    let bytes = w.into_inner().expect("failed to write to vec. This is a bug!");
    String::from_utf8(bytes).expect("emitter produced invalid utf-8. This is a bug!")
}

/// Emit a node as statements (test entry point and thunk bodies).
pub fn render_statement(ir: &Ir, core_alias: &str) -> String {
    render(core_alias, |w| emit_ir(w, ir, &Locus::Stmt))
}

/// Emit a node in return position.
pub fn render_return(ir: &Ir, core_alias: &str) -> String {
    render(core_alias, |w| emit_ir(w, ir, &Locus::Return))
}

/// Render a top-level named function definition.
pub fn render_named_fn(def: &FnDef, core_alias: &str) -> String {
    render(core_alias, |w| emit_ir(w, &Ir::Fn(Box::new(def.clone())), &Locus::NamedFn(def)))
}

/// Render a class definition.
pub fn render_class(cls: &ClassDef, core_alias: &str) -> String {
    render(core_alias, |w| write_class(w, cls))
}

/// Render a top-level field.  A simple initializer becomes `final x = e;`;
/// anything statement-shaped is wrapped in an immediately-invoked thunk.
pub fn render_top_field(name: &str, ir: &Ir, core_alias: &str) -> String {
    render(core_alias, |w| {
        w.put("final ")?;
        w.put(name)?;
        w.put(" = ")?;
        if ir.is_statement_like() {
            w.put("(() {")?;
            w.next_line()?;
            w.indent();
            emit_ir(w, ir, &Locus::Return)?;
            w.dedent();
            w.put("})()")?;
        } else {
            emit_ir(w, ir, &Locus::Expr)?;
        }
        w.put(";")?;
        w.next_line()
    })
}

// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::DartType;

    fn id(name: &str) -> Ir {
        Ir::Id(DartId::local(name, DartType::dynamic()))
    }

    fn bool_id(name: &str) -> Ir {
        Ir::Id(DartId::local(name, DartType::named("bool")))
    }

    #[test]
    fn statement_locus_terminates_lines() {
        let call = Ir::Call { callee: Box::new(id("f")), args: vec![] };
        // unknown marker: runtime branch
        assert_eq!(
            render_statement(&call, "core"),
            "((f is core.IFn) ? (f as core.IFn).$_invoke$0() : (f as dynamic)());\n"
        );
    }

    #[test]
    fn operator_emission() {
        let add = Ir::MethodCall {
            obj: Box::new(id("x$1")),
            method: "+".into(),
            args: vec![Arg::positional(id("y$1"))],
        };
        assert_eq!(render_return(&add, "core"), "return (x$1)+(y$1);\n");

        let not = Ir::MethodCall { obj: Box::new(id("x")), method: "!".into(), args: vec![] };
        assert_eq!(render_return(&not, "core"), "return !(x);\n");

        let idx = Ir::MethodCall {
            obj: Box::new(id("xs")),
            method: "[]".into(),
            args: vec![Arg::positional(Ir::Int(0))],
        };
        assert_eq!(render_return(&idx, "core"), "return (xs)[0];\n");
    }

    #[test]
    fn logical_doubling_needs_boolean_operands() {
        let bools = Ir::MethodCall {
            obj: Box::new(bool_id("a")),
            method: "&".into(),
            args: vec![Arg::positional(bool_id("b"))],
        };
        assert_eq!(render_return(&bools, "core"), "return (a)&&(b);\n");

        let ints = Ir::MethodCall {
            obj: Box::new(id("a")),
            method: "&".into(),
            args: vec![Arg::positional(id("b"))],
        };
        assert_eq!(render_return(&ints, "core"), "return (a)&(b);\n");
    }

    #[test]
    fn truthiness_of_if_tests() {
        let mk_if = |test: Ir| Ir::If {
            test: Box::new(test),
            then: Box::new(Ir::Str("y".into())),
            els: Box::new(Ir::Str("n".into())),
        };

        assert_eq!(
            render_return(&mk_if(bool_id("b")), "core"),
            "if (b) {\n  return \"y\";\n}\nreturn \"n\";\n"
        );
        assert_eq!(
            render_return(&mk_if(Ir::Id(DartId::local("s", DartType::named("String")))), "core"),
            "if (s != null) {\n  return \"y\";\n}\nreturn \"n\";\n"
        );
        assert_eq!(
            render_return(&mk_if(id("t$1")), "core"),
            "if (t$1 != false && t$1 != null) {\n  return \"y\";\n}\nreturn \"n\";\n"
        );
    }

    #[test]
    fn if_without_exit_keeps_else_block() {
        let node = Ir::If {
            test: Box::new(bool_id("b")),
            then: Box::new(Ir::Int(1)),
            els: Box::new(Ir::Int(2)),
        };
        let x = DartId::local("x$1", DartType::dynamic());
        let out = render("core", |w| emit_ir(w, &node, &Locus::VarDecl(&x)));
        assert_eq!(out, "var x$1;\nif (b) {\n  x$1 = 1;\n} else {\n  x$1 = 2;\n}\n");
    }

    #[test]
    fn loop_and_recur() {
        let a = DartId::local("a$1", DartType::dynamic());
        let b = DartId::local("b$1", DartType::dynamic());
        let body = Ir::Recur {
            args: vec![
                Ir::Id(b.clone()),
                Ir::MethodCall {
                    obj: Box::new(Ir::Id(a.clone())),
                    method: "+".into(),
                    args: vec![Arg::positional(Ir::Id(b.clone()))],
                },
            ],
        };
        let node = Ir::Loop {
            bindings: vec![(a, Ir::Int(0)), (b, Ir::Int(1))],
            body: Box::new(body),
        };
        let out = render_statement(&node, "core");
        // both new values are computed before either binding is reassigned
        assert_eq!(
            out,
            "var a$1 = 0;\nvar b$1 = 1;\ndo {\n  var t$r1 = b$1;\n  var t$r2 = (a$1)+(b$1);\n  a$1 = t$r1;\n  b$1 = t$r2;\n  continue;\n} while (true);\n"
        );
    }

    #[test]
    fn rethrow_for_caught_identifier() {
        let e = DartId::local("e$1", DartType::dynamic());
        let node = Ir::Try {
            body: Box::new(Ir::Call { callee: Box::new(id("f")), args: vec![] }),
            catches: vec![crate::ir::CatchClause {
                class: DartType::named("E"),
                exn: e.clone(),
                trace: None,
                body: Ir::Throw(Box::new(Ir::Id(e))),
            }],
            finally: None,
        };
        let out = render_statement(&node, "core");
        assert!(out.contains("} on E catch (e$1) {\n  rethrow;\n}"), "{}", out);
    }

    #[test]
    fn escaping() {
        assert_eq!(escape_string("a\nb"), "a\\nb");
        assert_eq!(escape_string("a\"$\\"), "a\\\"\\$\\\\");
        assert_eq!(escape_string("\u{1}\u{1f}"), "\\x01\\x1f");
        assert_eq!(escape_string("\u{8}\u{b}\u{c}"), "\\b\\v\\f");
    }

    #[test]
    fn invoke_dispatch_packs_overflow() {
        let callee = Ir::Id(DartId::local("f", DartType::dynamic()).with_marker(FnMarker::Ifn));
        let args: Vec<Arg> = (0..12).map(|n| Arg::positional(Ir::Int(n))).collect();
        let node = Ir::Call { callee: Box::new(callee), args };
        let out = render_return(&node, "core");
        assert_eq!(
            out,
            "return (f as core.IFn).$_invoke_more(0, 1, 2, 3, 4, 5, 6, 7, 8, [9, 10, 11]);\n"
        );
    }

    #[test]
    fn top_field_thunks_statements() {
        let simple = render_top_field("x", &Ir::Int(1), "core");
        assert_eq!(simple, "final x = 1;\n");

        let branchy = Ir::If {
            test: Box::new(bool_id("b")),
            then: Box::new(Ir::Int(1)),
            els: Box::new(Ir::Int(2)),
        };
        let out = render_top_field("x", &branchy, "core");
        assert_eq!(
            out,
            "final x = (() {\n  if (b) {\n    return 1;\n  }\n  return 2;\n})();\n"
        );
    }
}
