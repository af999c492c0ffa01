//! The surface form tree produced by a reader.
//!
//! The compiler core never tokenizes text; it consumes [`Form`]s yielded by a
//! reader behind the [`crate::driver::FormSource`] trait.  Everything in this
//! module is therefore plain data: symbols, keywords, the usual literal atoms,
//! and the four collection shapes, plus `#tag`ged literals and a with-meta
//! wrapper that lets a reader attach metadata to an arbitrary form.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

/// Metadata mapping attached to symbols (and, via [`Form::WithMeta`], to
/// arbitrary forms).  Keys are keywords; insertion order is preserved.
pub type Meta = IndexMap<Keyword, Form>;

/// An interned-ish keyword like `:foo` or `:foo/bar`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Keyword {
    pub ns: Option<Rc<str>>,
    pub name: Rc<str>,
}

impl Keyword {
    pub fn simple(name: &str) -> Self {
        Keyword { ns: None, name: name.into() }
    }

    pub fn qualified(ns: &str, name: &str) -> Self {
        Keyword { ns: Some(ns.into()), name: name.into() }
    }
}

/// A symbol, optionally namespaced, optionally carrying reader metadata.
///
/// Metadata does not participate in equality, mirroring the source language's
/// rule that `(= 'x (with-meta 'x {...}))` holds.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub ns: Option<Rc<str>>,
    pub name: Rc<str>,
    pub meta: Option<Rc<Meta>>,
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.ns == other.ns && self.name == other.name
    }
}

impl Eq for Symbol {}

impl Symbol {
    pub fn simple(name: &str) -> Self {
        Symbol { ns: None, name: name.into(), meta: None }
    }

    pub fn qualified(ns: &str, name: &str) -> Self {
        Symbol { ns: Some(ns.into()), name: name.into(), meta: None }
    }

    /// True for an unqualified symbol with exactly this name.
    pub fn is(&self, name: &str) -> bool {
        self.ns.is_none() && &*self.name == name
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = Some(Rc::new(meta));
        self
    }

    /// Look up a metadata entry by simple keyword name.
    pub fn meta_get(&self, key: &str) -> Option<&Form> {
        self.meta.as_ref().and_then(|m| m.get(&Keyword::simple(key)))
    }

    /// True when the metadata holds `{:key true}`.
    pub fn meta_flag(&self, key: &str) -> bool {
        matches!(self.meta_get(key), Some(Form::Bool(true)))
    }

    /// The `:tag` metadata as a type-tag string, from either a symbol or a
    /// string value.
    pub fn type_tag(&self) -> Option<String> {
        match self.meta_get("tag") {
            Some(Form::Symbol(s)) => Some(s.to_string()),
            Some(Form::Str(s)) => Some(s.to_string()),
            _ => None,
        }
    }
}

/// A surface form.
///
/// `Map` keeps its pairs in reader order; the analyzer relies on that order
/// when emitting aggregate constructors, so it must not be canonicalized.
#[derive(Debug, Clone, PartialEq)]
pub enum Form {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Keyword(Keyword),
    Symbol(Symbol),
    /// A list form `(a b c)`.
    Seq(Vec<Form>),
    Vector(Vec<Form>),
    Map(Vec<(Form, Form)>),
    Set(Vec<Form>),
    /// A tagged literal `#tag form`.
    Tagged(Symbol, Box<Form>),
    /// Reader-attached metadata on an arbitrary form, `^{...} form`.
    WithMeta(Rc<Meta>, Box<Form>),
}

impl Form {
    /// Strip any number of with-meta wrappers, returning the inner form and
    /// the outermost metadata (the reader never double-wraps in practice).
    pub fn strip_meta(&self) -> (&Form, Option<&Meta>) {
        match self {
            Form::WithMeta(meta, inner) => {
                let (form, _) = inner.strip_meta();
                (form, Some(meta))
            }
            other => (other, None),
        }
    }

    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self.strip_meta().0 {
            Form::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Form]> {
        match self.strip_meta().0 {
            Form::Seq(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[Form]> {
        match self.strip_meta().0 {
            Form::Vector(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.strip_meta().0 {
            Form::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_keyword(&self) -> Option<&Keyword> {
        match self.strip_meta().0 {
            Form::Keyword(k) => Some(k),
            _ => None,
        }
    }

    /// The head symbol of a `(sym ...)` form, if that is this form's shape.
    pub fn head_symbol(&self) -> Option<&Symbol> {
        self.as_seq().and_then(|items| items.first()).and_then(|f| f.as_symbol())
    }

    /// A `:tag` type hint, read from the form's own metadata or (for a bare
    /// symbol) from the symbol's metadata.
    pub fn type_tag(&self) -> Option<String> {
        let (inner, meta) = self.strip_meta();
        if let Some(meta) = meta {
            match meta.get(&Keyword::simple("tag")) {
                Some(Form::Symbol(s)) => return Some(s.to_string()),
                Some(Form::Str(s)) => return Some(s.to_string()),
                _ => {}
            }
        }
        match inner {
            Form::Symbol(s) => s.type_tag(),
            _ => None,
        }
    }

    /// Noun for error messages.
    pub fn descr(&self) -> &'static str {
        match self {
            Form::Nil => "nil",
            Form::Bool(_) => "boolean",
            Form::Int(_) | Form::Float(_) => "number",
            Form::Str(_) => "string",
            Form::Keyword(_) => "keyword",
            Form::Symbol(_) => "symbol",
            Form::Seq(_) => "list",
            Form::Vector(_) => "vector",
            Form::Map(_) => "map",
            Form::Set(_) => "set",
            Form::Tagged(..) => "tagged literal",
            Form::WithMeta(_, inner) => inner.descr(),
        }
    }
}

// =============================================================================
// Printing

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ns {
            Some(ns) => write!(f, ":{}/{}", ns, self.name),
            None => write!(f, ":{}", self.name),
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ns {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

fn fmt_items(f: &mut fmt::Formatter<'_>, items: &[Form]) -> fmt::Result {
    let mut first = true;
    for item in items {
        if !first {
            write!(f, " ")?;
        }
        first = false;
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Form::Nil => write!(f, "nil"),
            Form::Bool(b) => write!(f, "{}", b),
            Form::Int(n) => write!(f, "{}", n),
            Form::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Form::Str(s) => write!(f, "{:?}", s),
            Form::Keyword(k) => write!(f, "{}", k),
            Form::Symbol(s) => write!(f, "{}", s),
            Form::Seq(items) => {
                write!(f, "(")?;
                fmt_items(f, items)?;
                write!(f, ")")
            }
            Form::Vector(items) => {
                write!(f, "[")?;
                fmt_items(f, items)?;
                write!(f, "]")
            }
            Form::Map(pairs) => {
                write!(f, "{{")?;
                let mut first = true;
                for (k, v) in pairs {
                    if !first {
                        write!(f, ", ")?;
                    }
                    first = false;
                    write!(f, "{} {}", k, v)?;
                }
                write!(f, "}}")
            }
            Form::Set(items) => {
                write!(f, "#{{")?;
                fmt_items(f, items)?;
                write!(f, "}}")
            }
            Form::Tagged(tag, inner) => write!(f, "#{} {}", tag, inner),
            Form::WithMeta(_, inner) => write!(f, "{}", inner),
        }
    }
}

// =============================================================================
// Builders

/// Short constructors for assembling forms by hand, mainly in tests and in
/// the expander's rewrite rules.
pub mod build {
    use super::*;

    pub fn nil() -> Form {
        Form::Nil
    }

    pub fn boolean(b: bool) -> Form {
        Form::Bool(b)
    }

    pub fn int(n: i64) -> Form {
        Form::Int(n)
    }

    pub fn float(x: f64) -> Form {
        Form::Float(x)
    }

    pub fn string(s: &str) -> Form {
        Form::Str(s.into())
    }

    pub fn sym(name: &str) -> Form {
        Form::Symbol(Symbol::simple(name))
    }

    pub fn qsym(ns: &str, name: &str) -> Form {
        Form::Symbol(Symbol::qualified(ns, name))
    }

    pub fn kw(name: &str) -> Form {
        Form::Keyword(Keyword::simple(name))
    }

    pub fn qkw(ns: &str, name: &str) -> Form {
        Form::Keyword(Keyword::qualified(ns, name))
    }

    pub fn list(items: impl IntoIterator<Item = Form>) -> Form {
        Form::Seq(items.into_iter().collect())
    }

    pub fn vector(items: impl IntoIterator<Item = Form>) -> Form {
        Form::Vector(items.into_iter().collect())
    }

    pub fn map(pairs: impl IntoIterator<Item = (Form, Form)>) -> Form {
        Form::Map(pairs.into_iter().collect())
    }

    pub fn set(items: impl IntoIterator<Item = Form>) -> Form {
        Form::Set(items.into_iter().collect())
    }

    pub fn tagged(tag: &str, inner: Form) -> Form {
        Form::Tagged(Symbol::simple(tag), Box::new(inner))
    }

    /// A symbol carrying a `^Type` tag.
    pub fn tagged_sym(tag: &str, name: &str) -> Form {
        let mut meta = Meta::new();
        meta.insert(Keyword::simple("tag"), sym(tag));
        Form::Symbol(Symbol::simple(name).with_meta(meta))
    }

    /// A symbol carrying a `^:flag` boolean meta entry.
    pub fn flagged_sym(flag: &str, name: &str) -> Form {
        let mut meta = Meta::new();
        meta.insert(Keyword::simple(flag), Form::Bool(true));
        Form::Symbol(Symbol::simple(name).with_meta(meta))
    }
}

// =============================================================================

#[cfg(test)]
mod tests {
    use super::build::*;
    use super::*;

    #[test]
    fn display_round_trips_shape() {
        let form = list([
            sym("let*"),
            vector([sym("x"), int(1)]),
            list([sym("."), sym("x"), string("+"), float(2.0)]),
        ]);
        assert_eq!(format!("{}", form), r#"(let* [x 1] (. x "+" 2.0))"#);
    }

    #[test]
    fn symbol_equality_ignores_meta() {
        let plain = Symbol::simple("x");
        let mut meta = Meta::new();
        meta.insert(Keyword::simple("tag"), sym("int"));
        let tagged = Symbol::simple("x").with_meta(meta);
        assert_eq!(plain, tagged);
    }

    #[test]
    fn type_tag_reads_symbol_and_form_meta() {
        assert_eq!(tagged_sym("String", "s").type_tag().as_deref(), Some("String"));

        let mut meta = Meta::new();
        meta.insert(Keyword::simple("tag"), sym("int"));
        let call = Form::WithMeta(
            Rc::new(meta),
            Box::new(list([sym("f"), sym("x")])),
        );
        assert_eq!(call.type_tag().as_deref(), Some("int"));
        assert!(call.head_symbol().unwrap().is("f"));
    }

    #[test]
    fn keyword_display() {
        assert_eq!(format!("{}", qkw("foo", "bar")), ":foo/bar");
        assert_eq!(format!("{}", kw("foo")), ":foo");
    }
}
