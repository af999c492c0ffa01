//! The intermediate tree produced by the analyzer and consumed by the emitter.
//!
//! This is a small, sugar-free tagged union: every operand that needed
//! pre-evaluation has already been lifted into a `let` binding by the
//! analyzer, so the emitter can treat any non-statement node as a Dart
//! expression.  Identifiers carry their Dart type, truthiness class and
//! mutability; nothing here refers back to surface forms.

use std::fmt;
use std::str::FromStr;

// =============================================================================
// Types and truthiness

/// A Dart type reference as it appears in emitted source: an optional import
/// alias, a bare name, and a nullability flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DartType {
    pub lib: Option<String>,
    pub name: String,
    pub nullable: bool,
}

impl DartType {
    pub fn named(name: &str) -> Self {
        DartType { lib: None, name: name.into(), nullable: false }
    }

    pub fn aliased(lib: &str, name: &str) -> Self {
        DartType { lib: Some(lib.into()), name: name.into(), nullable: false }
    }

    pub fn dynamic() -> Self {
        Self::named("dynamic")
    }

    pub fn void() -> Self {
        Self::named("void")
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn is_dynamic(&self) -> bool {
        self.lib.is_none() && self.name == "dynamic"
    }

    /// The truthiness class values of this type fall into.
    pub fn truth(&self) -> Truth {
        if self.lib.is_some() {
            return Truth::Some;
        }
        match &*self.name {
            "bool" if !self.nullable => Truth::Boolean,
            // A nullable bool can be any of true/false/null.
            "bool" => Truth::Unknown,
            "dynamic" | "Object" | "void" => Truth::Unknown,
            _ => Truth::Some,
        }
    }
}

impl fmt::Display for DartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(lib) = &self.lib {
            write!(f, "{}.", lib)?;
        }
        write!(f, "{}", self.name)?;
        if self.nullable {
            write!(f, "?")?;
        }
        Ok(())
    }
}

/// What the compiler knows about a value for condition emission.
///
/// `Boolean`: provably a non-nullable bool, tests emit bare.
/// `Some`: provably not a bool, tests emit a single `!= null` check.
/// `Unknown`: anything else, tests emit `!= false && != null`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Truth {
    Boolean,
    Some,
    Unknown,
}

impl Truth {
    pub fn join(self, other: Truth) -> Truth {
        if self == other { self } else { Truth::Unknown }
    }
}

/// How a callee dispatches, when the analyzer can tell.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FnMarker {
    /// A top-level Dart function; calls emit directly.
    Native,
    /// An invoke-style function object; calls dispatch through `$_invoke$N`.
    Ifn,
    /// Anything else; calls emit a runtime `is IFn` branch.
    Unknown,
}

/// Where an identifier lives; captured closures only ever contain locals.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IdScope {
    /// A parameter or let/loop/catch binding of the current function.
    Local,
    /// A top-level definition or an import-qualified reference.
    Global,
}

/// A resolved identifier with its emission metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct DartId {
    pub name: String,
    pub ty: DartType,
    pub truth: Truth,
    pub mutable: bool,
    pub marker: FnMarker,
    pub scope: IdScope,
}

impl DartId {
    pub fn local(name: impl Into<String>, ty: DartType) -> Self {
        let truth = ty.truth();
        DartId {
            name: name.into(),
            ty,
            truth,
            mutable: false,
            marker: FnMarker::Unknown,
            scope: IdScope::Local,
        }
    }

    pub fn global(name: impl Into<String>, ty: DartType) -> Self {
        let mut id = Self::local(name, ty);
        id.scope = IdScope::Global;
        id
    }

    pub fn with_truth(mut self, truth: Truth) -> Self {
        self.truth = truth;
        self
    }

    pub fn mutable(mut self) -> Self {
        self.mutable = true;
        self
    }

    pub fn with_marker(mut self, marker: FnMarker) -> Self {
        self.marker = marker;
        self
    }
}

// =============================================================================
// Nodes

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    /// `None` means the value is evaluated purely for effect.
    pub id: Option<DartId>,
    pub value: Ir,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    /// Set for named arguments, which always follow the positionals.
    pub name: Option<String>,
    pub value: Ir,
}

impl Arg {
    pub fn positional(value: Ir) -> Self {
        Arg { name: None, value }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseClause {
    /// Literal values sharing one body.
    pub values: Vec<Ir>,
    pub body: Ir,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatchClause {
    pub class: DartType,
    pub exn: DartId,
    pub trace: Option<DartId>,
    pub body: Ir,
}

/// Optional parameters of a [`FnDef`], either positional or named, each with
/// a default value.
#[derive(Debug, Clone, PartialEq)]
pub struct OptParams {
    pub named: bool,
    pub params: Vec<(DartId, Ir)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FnDef {
    /// Present when the function is declared under a name (named-function
    /// locus); anonymous closures leave it empty.
    pub name: Option<String>,
    pub ret: DartType,
    pub params: Vec<DartId>,
    pub opt: Option<OptParams>,
    pub body: Ir,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Ir {
    Nil,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    Id(DartId),
    Let { bindings: Vec<Binding>, body: Box<Ir> },
    If { test: Box<Ir>, then: Box<Ir>, els: Box<Ir> },
    Loop { bindings: Vec<(DartId, Ir)>, body: Box<Ir> },
    Recur { args: Vec<Ir> },
    Fn(Box<FnDef>),
    Case { scrutinee: Box<Ir>, clauses: Vec<CaseClause>, default: Box<Ir> },
    Try { body: Box<Ir>, catches: Vec<CatchClause>, finally: Option<Box<Ir>> },
    Throw(Box<Ir>),
    /// Method or operator invocation, `(. obj m args)`.
    MethodCall { obj: Box<Ir>, method: String, args: Vec<Arg> },
    /// Field read, `(.- obj f)`.
    FieldGet { obj: Box<Ir>, field: String },
    /// Assignment to an identifier or a field access.
    Set { target: Box<Ir>, value: Box<Ir> },
    New { class: DartType, ctor: Option<String>, args: Vec<Arg> },
    Is { expr: Box<Ir>, ty: DartType },
    Cast { expr: Box<Ir>, ty: DartType },
    Call { callee: Box<Ir>, args: Vec<Arg> },
    /// A native Dart list literal; used for `#dart [...]` and for packing
    /// overflow arguments at call sites.
    ListLit(Vec<Ir>),
}

impl Ir {
    pub fn id(&self) -> Option<&DartId> {
        match self {
            Ir::Id(id) => Some(id),
            _ => None,
        }
    }

    /// Whether this node may be spliced into an operand position without a
    /// temporary: literals, identifiers, and bare field reads/casts of
    /// atomic receivers need no pre-evaluation.
    pub fn is_atomic(&self) -> bool {
        match self {
            Ir::Nil | Ir::Bool(_) | Ir::Int(_) | Ir::Double(_) | Ir::Str(_) | Ir::Id(_) => true,
            Ir::FieldGet { obj, .. } => obj.is_atomic(),
            Ir::Cast { expr, .. } | Ir::Is { expr, .. } => expr.is_atomic(),
            _ => false,
        }
    }

    /// Whether this node must be written as Dart statements rather than an
    /// expression.  The analyzer's lifting guarantees these never survive
    /// into operand positions.
    pub fn is_statement_like(&self) -> bool {
        matches!(
            self,
            Ir::Let { .. }
                | Ir::If { .. }
                | Ir::Loop { .. }
                | Ir::Recur { .. }
                | Ir::Case { .. }
                | Ir::Try { .. }
                | Ir::Throw(_)
        )
    }

    pub fn truth(&self) -> Truth {
        match self {
            Ir::Bool(_) => Truth::Boolean,
            Ir::Int(_) | Ir::Double(_) | Ir::Str(_) | Ir::ListLit(_) => Truth::Some,
            // `null != null` is false, which is exactly nil's truthiness.
            Ir::Nil => Truth::Some,
            Ir::Id(id) => id.truth,
            Ir::Is { .. } => Truth::Boolean,
            Ir::Cast { ty, .. } => ty.truth(),
            Ir::New { .. } => Truth::Some,
            Ir::MethodCall { obj, method, args } => match DartOp::from_str(method) {
                Ok(op) if op.returns_bool() => Truth::Boolean,
                Ok(op) if op.is_bitwise_logical() => {
                    // `&`, `|`, `^` stay boolean when both sides are.
                    let rhs = args.first().map_or(Truth::Unknown, |a| a.value.truth());
                    if obj.truth() == Truth::Boolean && rhs == Truth::Boolean {
                        Truth::Boolean
                    } else {
                        Truth::Unknown
                    }
                }
                _ => Truth::Unknown,
            },
            Ir::Let { body, .. } => body.truth(),
            Ir::If { then, els, .. } => then.truth().join(els.truth()),
            Ir::Case { clauses, default, .. } => clauses
                .iter()
                .map(|c| c.body.truth())
                .fold(default.truth(), Truth::join),
            Ir::Try { body, catches, .. } => catches
                .iter()
                .map(|c| c.body.truth())
                .fold(body.truth(), Truth::join),
            _ => Truth::Unknown,
        }
    }

    pub fn ty(&self) -> DartType {
        match self {
            Ir::Nil => DartType::named("Null"),
            Ir::Bool(_) => DartType::named("bool"),
            Ir::Int(_) => DartType::named("int"),
            Ir::Double(_) => DartType::named("double"),
            Ir::Str(_) => DartType::named("String"),
            Ir::Id(id) => id.ty.clone(),
            Ir::Is { .. } => DartType::named("bool"),
            Ir::Cast { ty, .. } => ty.clone(),
            Ir::New { class, .. } => class.clone(),
            Ir::Let { body, .. } => body.ty(),
            Ir::MethodCall { method, .. } => match DartOp::from_str(method) {
                Ok(op) if op.returns_bool() => DartType::named("bool"),
                _ => DartType::dynamic(),
            },
            _ => DartType::dynamic(),
        }
    }

    /// Whether `name` occurs as an identifier anywhere in this tree.
    /// Shadowing is deliberately ignored: the caller uses this to decide
    /// when a recur rebind needs a temporary, and a false positive only
    /// costs one extra local.
    pub fn mentions(&self, name: &str) -> bool {
        let mut found = false;
        self.walk(&mut |ir| {
            if let Ir::Id(id) = ir {
                if id.name == name {
                    found = true;
                }
            }
        });
        found
    }

    /// Whether a `recur` occurs in this tree, not counting ones that belong
    /// to a nested function or loop.
    pub fn has_recur(&self) -> bool {
        match self {
            Ir::Recur { .. } => true,
            Ir::Fn(_) | Ir::Loop { .. } => false,
            _ => {
                let mut found = false;
                self.walk_children(&mut |child| {
                    if child.has_recur() {
                        found = true;
                    }
                });
                found
            }
        }
    }

    fn walk_children(&self, f: &mut impl FnMut(&Ir)) {
        match self {
            Ir::Nil | Ir::Bool(_) | Ir::Int(_) | Ir::Double(_) | Ir::Str(_) | Ir::Id(_) => {}
            Ir::Let { bindings, body } => {
                for b in bindings {
                    f(&b.value);
                }
                f(body);
            }
            Ir::If { test, then, els } => {
                f(test);
                f(then);
                f(els);
            }
            Ir::Loop { bindings, body } => {
                for (_, init) in bindings {
                    f(init);
                }
                f(body);
            }
            Ir::Recur { args } => args.iter().for_each(f),
            Ir::Fn(def) => f(&def.body),
            Ir::Case { scrutinee, clauses, default } => {
                f(scrutinee);
                for c in clauses {
                    c.values.iter().for_each(&mut *f);
                    f(&c.body);
                }
                f(default);
            }
            Ir::Try { body, catches, finally } => {
                f(body);
                for c in catches {
                    f(&c.body);
                }
                if let Some(fin) = finally {
                    f(fin);
                }
            }
            Ir::Throw(e) => f(e),
            Ir::MethodCall { obj, args, .. } => {
                f(obj);
                args.iter().for_each(|a| f(&a.value));
            }
            Ir::FieldGet { obj, .. } => f(obj),
            Ir::Set { target, value } => {
                f(target);
                f(value);
            }
            Ir::New { args, .. } => args.iter().for_each(|a| f(&a.value)),
            Ir::Is { expr, .. } | Ir::Cast { expr, .. } => f(expr),
            Ir::Call { callee, args } => {
                f(callee);
                args.iter().for_each(|a| f(&a.value));
            }
            Ir::ListLit(items) => items.iter().for_each(f),
        }
    }

    /// Depth-first walk over every node including `self`.
    pub fn walk(&self, f: &mut impl FnMut(&Ir)) {
        f(self);
        self.walk_children(&mut |child| child.walk(f));
    }
}

// =============================================================================
// Free variables

/// Collect the free identifiers of `ir`: every [`DartId`] referenced but not
/// bound by an enclosing `let`/`loop`/`fn`/`catch` within `ir` and not listed
/// in `bound`.  Order of first occurrence is preserved; this is the closure
/// set of reify/fn classes.
pub fn free_ids(ir: &Ir, bound: &[String]) -> Vec<DartId> {
    let mut scope: Vec<String> = bound.to_vec();
    let mut out: Vec<DartId> = vec![];
    collect_free(ir, &mut scope, &mut out);
    out
}

fn collect_free(ir: &Ir, scope: &mut Vec<String>, out: &mut Vec<DartId>) {
    match ir {
        Ir::Id(id) => {
            if id.scope == IdScope::Local
                && !scope.iter().any(|s| *s == id.name)
                && !out.iter().any(|o| o.name == id.name)
            {
                out.push(id.clone());
            }
        }
        Ir::Let { bindings, body } => {
            let depth = scope.len();
            for b in bindings {
                collect_free(&b.value, scope, out);
                if let Some(id) = &b.id {
                    scope.push(id.name.clone());
                }
            }
            collect_free(body, scope, out);
            scope.truncate(depth);
        }
        Ir::Loop { bindings, body } => {
            let depth = scope.len();
            for (id, init) in bindings {
                collect_free(init, scope, out);
                scope.push(id.name.clone());
            }
            collect_free(body, scope, out);
            scope.truncate(depth);
        }
        Ir::Fn(def) => {
            let depth = scope.len();
            scope.extend(def.params.iter().map(|p| p.name.clone()));
            if let Some(opt) = &def.opt {
                for (id, default) in &opt.params {
                    collect_free(default, scope, out);
                    scope.push(id.name.clone());
                }
            }
            collect_free(&def.body, scope, out);
            scope.truncate(depth);
        }
        Ir::Try { body, catches, finally } => {
            collect_free(body, scope, out);
            for c in catches {
                let depth = scope.len();
                scope.push(c.exn.name.clone());
                if let Some(trace) = &c.trace {
                    scope.push(trace.name.clone());
                }
                collect_free(&c.body, scope, out);
                scope.truncate(depth);
            }
            if let Some(fin) = finally {
                collect_free(fin, scope, out);
            }
        }
        other => other.walk_children(&mut |child| collect_free(child, scope, out)),
    }
}

// =============================================================================
// Class descriptions

/// How one constructor parameter is declared.
#[derive(Debug, Clone, PartialEq)]
pub enum CtorParam {
    /// `this.f`: initializes the field of the same name.
    Field(String),
    /// A plain typed parameter, usually forwarded to the super constructor.
    Plain(DartId),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MethodKind {
    Normal,
    Getter,
    Setter,
    Operator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    /// Final Dart name (already resolved through protocol tables/munging).
    pub name: String,
    pub kind: MethodKind,
    pub ret: DartType,
    /// Excludes the receiver.
    pub params: Vec<DartId>,
    pub opt: Option<OptParams>,
    /// `None` marks an abstract method.
    pub body: Option<Ir>,
}

/// Output of reify/deftype class assembly, consumed by the class writer.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    pub name: String,
    pub abstract_: bool,
    pub extends: Option<DartType>,
    /// Named super constructor, when the parent is constructed through one.
    pub super_ctor: Option<String>,
    pub super_args: Vec<Ir>,
    pub implements: Vec<DartType>,
    pub mixins: Vec<DartType>,
    /// Fields in declaration order; `DartId::mutable` selects `final` vs not.
    pub fields: Vec<DartId>,
    pub ctor_params: Vec<CtorParam>,
    pub methods: Vec<MethodDef>,
    /// Synthesize a delegating `noSuchMethod` stub.
    pub need_no_such_method: bool,
}

// =============================================================================
// Operators

/// Dart operators reachable through `(. obj op args)` forms.
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::EnumString, strum::IntoStaticStr)]
pub enum DartOp {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "/")]
    Div,
    #[strum(serialize = "%")]
    Rem,
    #[strum(serialize = "~/")]
    TruncDiv,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">=")]
    Ge,
    #[strum(serialize = "<<")]
    Shl,
    #[strum(serialize = ">>")]
    Shr,
    #[strum(serialize = ">>>")]
    UShr,
    #[strum(serialize = "|")]
    BitOr,
    #[strum(serialize = "^")]
    BitXor,
    #[strum(serialize = "&")]
    BitAnd,
    #[strum(serialize = "~")]
    BitNot,
    #[strum(serialize = "!")]
    Not,
    #[strum(serialize = "[]")]
    Index,
    #[strum(serialize = "[]=")]
    IndexSet,
}

impl DartOp {
    /// Comparison and negation operators always produce a bool.
    pub fn returns_bool(self) -> bool {
        matches!(
            self,
            DartOp::Eq | DartOp::Ne | DartOp::Lt | DartOp::Gt | DartOp::Le | DartOp::Ge | DartOp::Not
        )
    }

    /// Operators that double into logical form on boolean operands.
    pub fn is_bitwise_logical(self) -> bool {
        matches!(self, DartOp::BitOr | DartOp::BitXor | DartOp::BitAnd)
    }

    /// Prefix (unary) operators.
    pub fn is_prefix(self) -> bool {
        matches!(self, DartOp::BitNot | DartOp::Not)
    }
}

// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> Ir {
        Ir::Id(DartId::local(name, DartType::dynamic()))
    }

    #[test]
    fn truth_of_operators() {
        let cmp = Ir::MethodCall {
            obj: Box::new(id("a")),
            method: "<".into(),
            args: vec![Arg::positional(id("b"))],
        };
        assert_eq!(cmp.truth(), Truth::Boolean);

        let bitand = Ir::MethodCall {
            obj: Box::new(id("a")),
            method: "&".into(),
            args: vec![Arg::positional(id("b"))],
        };
        assert_eq!(bitand.truth(), Truth::Unknown);
    }

    #[test]
    fn truth_join_over_if() {
        let both_bool = Ir::If {
            test: Box::new(id("t")),
            then: Box::new(Ir::Bool(true)),
            els: Box::new(Ir::Bool(false)),
        };
        assert_eq!(both_bool.truth(), Truth::Boolean);

        let mixed = Ir::If {
            test: Box::new(id("t")),
            then: Box::new(Ir::Int(1)),
            els: Box::new(Ir::Bool(false)),
        };
        assert_eq!(mixed.truth(), Truth::Unknown);
    }

    #[test]
    fn has_recur_stops_at_fn_boundary() {
        let recur = Ir::Recur { args: vec![] };
        assert!(recur.has_recur());

        let nested = Ir::Fn(Box::new(FnDef {
            name: None,
            ret: DartType::dynamic(),
            params: vec![],
            opt: None,
            body: Ir::Recur { args: vec![] },
        }));
        assert!(!nested.has_recur());

        let let_around = Ir::Let {
            bindings: vec![Binding { id: None, value: nested }],
            body: Box::new(Ir::Recur { args: vec![] }),
        };
        assert!(let_around.has_recur());
    }

    #[test]
    fn free_ids_skip_bound_and_qualified() {
        let body = Ir::Let {
            bindings: vec![Binding {
                id: Some(DartId::local("x$1", DartType::dynamic())),
                value: id("captured"),
            }],
            body: Box::new(Ir::MethodCall {
                obj: Box::new(id("x$1")),
                method: "+".into(),
                args: vec![Arg::positional(Ir::Id(DartId::global(
                    "lib0.topLevel",
                    DartType::dynamic(),
                )))],
            }),
        };
        let free = free_ids(&body, &["this".into()]);
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].name, "captured");
    }

    #[test]
    fn op_parsing() {
        assert_eq!(DartOp::from_str("~/").unwrap(), DartOp::TruncDiv);
        assert_eq!(DartOp::from_str(">>>").unwrap(), DartOp::UShr);
        assert!(DartOp::from_str("toString").is_err());
        let s: &'static str = DartOp::TruncDiv.into();
        assert_eq!(s, "~/");
    }
}
