//! The namespace registry.
//!
//! A process-wide mutable store of namespaces, owned by the compiler context
//! and mutated by the analyzer as top-level forms are processed.  Each
//! namespace records its Dart imports, its aliases, its referred symbols, and
//! its definitions (with their pre-rendered Dart source, which the driver
//! later writes out verbatim).
//!
//! Reads go through `&self` query methods; everything that mutates is an
//! explicit `&mut self` operation, serialized by the single-threaded driver.

use indexmap::IndexMap;

use crate::error::{CompileError, ErrorKind, Result};
use crate::form::Symbol;
use crate::ident::munge;
use crate::ir::{DartId, DartType, FnMarker};

/// The seeded core namespace and the Dart library backing it.
pub const CORE_NS: &str = "lotus.core";
pub const CORE_LIB: &str = "package:lotus/core.dart";

/// Dart core types available without an import, seeded into [`CORE_NS`].
const BUILTIN_TYPES: &[&str] = &[
    "Object", "String", "bool", "int", "double", "num", "List", "Map", "Set",
    "Iterable", "Duration", "Type", "Null", "Invocation", "StackTrace",
    "Error", "Exception", "StateError", "ArgumentError", "UnsupportedError",
    "FormatException", "RangeError", "Future", "Stream",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibImport {
    /// Dart library path, e.g. `package:lotus/core.dart` or `dart:math`.
    pub lib: String,
    /// Set when the library is the output of a compiled namespace.
    pub ns: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DefKind {
    /// A top-level field (possibly thunk-initialized).
    Field,
    /// A top-level Dart function; call sites dispatch directly.
    DartFn,
    /// A class (deftype, definterface, protocol marker, fn object class).
    Class,
}

/// Per-method, per-arity dispatch entry of a protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMethod {
    pub dart_name: String,
    /// Parameter names excluding the receiver.
    pub params: Vec<String>,
}

/// The dispatch table recorded by `defprotocol`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtocolRecord {
    /// method short name -> arity (including receiver) -> entry.
    pub methods: IndexMap<String, IndexMap<usize, ProtocolMethod>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefMeta {
    /// Part of the closed builtin macro set; the expander maps the name to
    /// its rewrite function.
    pub is_macro: bool,
    /// Seeded dart:core type; emitted without an import alias.
    pub builtin: bool,
    /// Defined by `deftest` (collected by `defrunner-main`).
    pub is_test: bool,
    pub doc: Option<String>,
    pub ty: Option<DartType>,
    pub protocol: Option<ProtocolRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DefRecord {
    /// Munged Dart-side name.
    pub dart_name: String,
    pub kind: DefKind,
    pub meta: DefMeta,
    /// Pre-rendered Dart source, written to the output file by the driver.
    /// Empty for pre-declarations.
    pub source: String,
}

impl DefRecord {
    /// An empty record allowing recursive self-reference during analysis.
    pub fn predeclaration(dart_name: &str, kind: DefKind) -> Self {
        DefRecord { dart_name: dart_name.into(), kind, meta: DefMeta::default(), source: String::new() }
    }

    fn marker(&self) -> FnMarker {
        match self.kind {
            DefKind::DartFn => FnMarker::Native,
            DefKind::Field if self.meta.ty.as_ref().map_or(false, |t| t.name == "IFn") => {
                FnMarker::Ifn
            }
            _ => FnMarker::Unknown,
        }
    }

    fn id_with_name(&self, name: String) -> DartId {
        let ty = self.meta.ty.clone().unwrap_or_else(DartType::dynamic);
        DartId::global(name, ty).with_marker(self.marker())
    }
}

#[derive(Debug, Clone)]
pub struct Namespace {
    pub name: String,
    /// The Dart library this namespace compiles to.
    pub lib: String,
    /// import alias -> imported library.
    pub imports: IndexMap<String, LibImport>,
    /// user alias (from `:as`) -> import alias.
    pub aliases: IndexMap<String, String>,
    /// referred short name -> fully qualified symbol.
    pub mappings: IndexMap<String, Symbol>,
    /// short name -> definition.
    pub defs: IndexMap<String, DefRecord>,
}

impl Namespace {
    fn new(name: &str) -> Self {
        Namespace {
            name: name.into(),
            lib: lib_for_ns(name),
            imports: IndexMap::new(),
            aliases: IndexMap::new(),
            mappings: IndexMap::new(),
            defs: IndexMap::new(),
        }
    }
}

/// Output library path for a namespace: dots become `/`, dashes `_`.
pub fn lib_for_ns(name: &str) -> String {
    format!("{}.dart", name.replace('.', "/").replace('-', "_"))
}

// =============================================================================

#[derive(Debug)]
pub struct Namespaces {
    nses: IndexMap<String, Namespace>,
    current: String,
}

impl Default for Namespaces {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespaces {
    /// A registry holding only the seeded core namespace.
    pub fn new() -> Self {
        let mut core = Namespace::new(CORE_NS);
        core.lib = CORE_LIB.into();
        for ty in BUILTIN_TYPES {
            core.defs.insert(
                (*ty).to_owned(),
                DefRecord {
                    dart_name: (*ty).to_owned(),
                    kind: DefKind::Class,
                    meta: DefMeta { builtin: true, ..DefMeta::default() },
                    source: String::new(),
                },
            );
        }
        for name in crate::expand::BUILTIN_MACROS {
            core.defs.insert(
                (*name).to_owned(),
                DefRecord {
                    dart_name: munge(name),
                    kind: DefKind::DartFn,
                    meta: DefMeta { is_macro: true, ..DefMeta::default() },
                    source: String::new(),
                },
            );
        }
        let mut nses = IndexMap::new();
        nses.insert(CORE_NS.to_owned(), core);
        Namespaces { nses, current: CORE_NS.to_owned() }
    }

    /// If `sym` resolves to a macro definition, return the macro's short name
    /// in its defining namespace.  Used by the expander only.
    pub fn macro_ref(&self, sym: &Symbol) -> Option<String> {
        let def = if let Some(ns_part) = &sym.ns {
            self.nses.get(&**ns_part)?.defs.get(&*sym.name)?
        } else if let Some(def) = self.current().defs.get(&*sym.name) {
            def
        } else {
            let mapped = self.current().mappings.get(&*sym.name)?;
            let target = mapped.ns.as_deref()?;
            self.nses.get(target)?.defs.get(&*mapped.name)?
        };
        if def.meta.is_macro {
            Some(sym.name.to_string())
        } else {
            None
        }
    }

    pub fn current(&self) -> &Namespace {
        &self.nses[&self.current]
    }

    pub fn current_mut(&mut self) -> &mut Namespace {
        self.nses.get_mut(&self.current).expect("current namespace missing. This is a bug!")
    }

    pub fn current_name(&self) -> &str {
        &self.current
    }

    pub fn get(&self, name: &str) -> Option<&Namespace> {
        self.nses.get(name)
    }

    /// Switch to (creating if needed) the given namespace.  New namespaces
    /// auto-refer the core namespace's definitions, so core names resolve
    /// without qualification.
    pub fn in_ns(&mut self, name: &str) {
        if !self.nses.contains_key(name) {
            let mut ns = Namespace::new(name);
            if name != CORE_NS {
                for short in self.nses[CORE_NS].defs.keys() {
                    ns.mappings.insert(short.clone(), Symbol::qualified(CORE_NS, short));
                }
            }
            self.nses.insert(name.to_owned(), ns);
        }
        self.current = name.to_owned();
    }

    /// Record a definition.  Last writer wins; pre-declaring with an empty
    /// record and overwriting later is the normal flow for recursive defs.
    pub fn define(&mut self, short: &str, record: DefRecord) {
        self.current_mut().defs.insert(short.to_owned(), record);
    }

    pub fn lookup_def(&self, ns: &str, short: &str) -> Option<&DefRecord> {
        self.nses.get(ns).and_then(|ns| ns.defs.get(short))
    }

    /// Update a definition's rendered source after emission.
    pub fn set_def_source(&mut self, short: &str, source: String) {
        if let Some(def) = self.current_mut().defs.get_mut(short) {
            def.source = source;
        }
    }

    /// Return the import alias for `lib` in the current namespace, adding the
    /// import if it is not present yet.
    pub fn ensure_import(&mut self, lib: &str, ns: Option<&str>) -> String {
        let cur = self.current_mut();
        if let Some((alias, _)) = cur.imports.iter().find(|(_, imp)| imp.lib == lib) {
            return alias.clone();
        }
        let base = alias_base(lib);
        let mut alias = base.clone();
        let mut n = 1;
        while cur.imports.contains_key(&alias) {
            alias = format!("{}{}", base, n);
            n += 1;
        }
        cur.imports.insert(
            alias.clone(),
            LibImport { lib: lib.to_owned(), ns: ns.map(str::to_owned) },
        );
        alias
    }

    /// Resolve a symbol that the lexical environment did not bind.
    ///
    /// Order: current-namespace definition; user alias; referred mapping
    /// (recursively); known namespace qualification (adding the import);
    /// otherwise unknown-symbol.
    pub fn resolve(&mut self, sym: &Symbol) -> Result<DartId> {
        // 2. defined in the current namespace
        if sym.ns.is_none() {
            if let Some(def) = self.current().defs.get(&*sym.name) {
                let name = def.dart_name.clone();
                return Ok(def.id_with_name(name));
            }
        }

        // 3. namespace part is a user alias
        if let Some(ns_part) = &sym.ns {
            if let Some(import_alias) = self.current().aliases.get(&**ns_part).cloned() {
                let imported_ns =
                    self.current().imports.get(&import_alias).and_then(|imp| imp.ns.clone());
                if let Some(target_ns) = imported_ns {
                    if let Some(def) = self.lookup_def(&target_ns, &sym.name) {
                        if def.meta.builtin {
                            let name = def.dart_name.clone();
                            return Ok(def.id_with_name(name));
                        }
                        let name = format!("{}.{}", import_alias, def.dart_name);
                        return Ok(def.id_with_name(name));
                    }
                }
                // A Dart library import: assume the member exists over there
                // and is directly callable.
                let name = format!("{}.{}", import_alias, munge(&sym.name));
                return Ok(DartId::global(name, DartType::dynamic()).with_marker(FnMarker::Native));
            }
        }

        // 4. referred mapping
        if sym.ns.is_none() {
            if let Some(mapped) = self.current().mappings.get(&*sym.name).cloned() {
                return self.resolve(&mapped);
            }
        }

        // 5. namespace part names a known namespace
        if let Some(ns_part) = &sym.ns {
            if let Some(ns) = self.nses.get(&**ns_part) {
                let lib = ns.lib.clone();
                let ns_name = ns.name.clone();
                match ns.defs.get(&*sym.name) {
                    Some(def) if def.meta.builtin => {
                        let name = def.dart_name.clone();
                        return Ok(def.id_with_name(name));
                    }
                    Some(def) => {
                        let def = def.clone();
                        let alias = if ns_name == self.current {
                            None
                        } else {
                            Some(self.ensure_import(&lib, Some(&ns_name)))
                        };
                        let name = match alias {
                            Some(alias) => format!("{}.{}", alias, def.dart_name),
                            None => def.dart_name.clone(),
                        };
                        return Ok(def.id_with_name(name));
                    }
                    None => {}
                }
            }
        }

        // 6. fail
        Err(CompileError::new(ErrorKind::UnknownSymbol(sym.to_string()), sym))
    }

    /// Locate the definition a symbol refers to, returning the defining
    /// namespace's name alongside the record.  Unlike [`Self::resolve`] this
    /// never mutates (no import is added).
    pub fn find_def(&self, sym: &Symbol) -> Option<(String, &DefRecord)> {
        if let Some(ns_part) = &sym.ns {
            if let Some(import_alias) = self.current().aliases.get(&**ns_part) {
                if let Some(target) =
                    self.current().imports.get(import_alias).and_then(|i| i.ns.clone())
                {
                    return self
                        .nses
                        .get(&target)
                        .and_then(|ns| ns.defs.get(&*sym.name))
                        .map(|def| (target.clone(), def));
                }
            }
            return self
                .nses
                .get(&**ns_part)
                .and_then(|ns| ns.defs.get(&*sym.name))
                .map(|def| (ns_part.to_string(), def));
        }
        if let Some(def) = self.current().defs.get(&*sym.name) {
            return Some((self.current.clone(), def));
        }
        let mapped = self.current().mappings.get(&*sym.name)?;
        let target = mapped.ns.as_deref()?;
        self.nses
            .get(target)
            .and_then(|ns| ns.defs.get(&*mapped.name))
            .map(|def| (target.to_owned(), def))
    }

    /// A class name unused in the current namespace, derived from `hint`.
    /// Generated classes register themselves under the returned name, which
    /// keeps the counter moving.
    pub fn fresh_class_name(&mut self, hint: &str) -> String {
        let mut n = 1;
        loop {
            let candidate = format!("_{}${}", hint, n);
            if !self.current().defs.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Look up the dispatch entry of a protocol method, by argument count
    /// (including the receiver).
    pub fn resolve_protocol_method(
        &self,
        proto_ns: &str,
        proto_short: &str,
        method: &str,
        argc: usize,
    ) -> Option<&ProtocolMethod> {
        self.lookup_def(proto_ns, proto_short)?
            .meta
            .protocol
            .as_ref()?
            .methods
            .get(method)?
            .get(&argc)
    }

    // -------------------------------------------------------------------------
    // Type tags

    /// Resolve a type-tag string: optional `alias.` prefix, an identifier,
    /// an optional `?` nullability suffix, and an optional trailing
    /// space-separated parameter name (which is ignored here; the analyzer
    /// pulls it off separately when it names a parameter).
    pub fn resolve_type(&self, tag: &str) -> Result<DartType> {
        let tag = tag.trim();
        let head = tag.split_whitespace().next().unwrap_or("");
        if head.is_empty() {
            return Err(CompileError::new(ErrorKind::UnknownTypeTag(tag.into()), tag));
        }

        let (head, nullable) = match head.strip_suffix('?') {
            Some(stripped) => (stripped, true),
            None => (head, false),
        };

        let mut ty = match head.split_once('.') {
            Some((alias, name)) => {
                // The alias must be declared in the current namespace.
                let import_alias = self
                    .current()
                    .aliases
                    .get(alias)
                    .cloned()
                    .or_else(|| self.current().imports.contains_key(alias).then(|| alias.to_owned()))
                    .ok_or_else(|| {
                        CompileError::new(ErrorKind::UnknownTypeTag(tag.into()), tag)
                    })?;
                DartType::aliased(&import_alias, name)
            }
            None => match head {
                // Hard-coded allowlist, checked ahead of namespace lookup.
                "Function" | "void" | "dynamic" => DartType::named(head),
                _ => {
                    if self.lookup_def(CORE_NS, head).map_or(false, |d| d.meta.builtin) {
                        DartType::named(head)
                    } else if let Some(def) = self.current().defs.get(head) {
                        if def.kind == DefKind::Class {
                            DartType::named(&def.dart_name)
                        } else {
                            return Err(CompileError::new(
                                ErrorKind::UnknownTypeTag(tag.into()),
                                tag,
                            ));
                        }
                    } else {
                        return Err(CompileError::new(ErrorKind::UnknownTypeTag(tag.into()), tag));
                    }
                }
            },
        };
        ty.nullable = nullable;
        Ok(ty)
    }
}

/// Base import alias for a library path: the file stem, munged to a plain
/// identifier.
fn alias_base(lib: &str) -> String {
    let stem = lib
        .rsplit(|c| c == '/' || c == ':')
        .next()
        .unwrap_or(lib)
        .trim_end_matches(".dart");
    let base: String =
        stem.chars().map(|c| if c.is_alphanumeric() { c } else { '_' }).collect();
    if base.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        format!("lib{}", base)
    } else {
        base
    }
}

// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::Symbol;

    fn registry_in(ns: &str) -> Namespaces {
        let mut nses = Namespaces::new();
        nses.in_ns(ns);
        nses
    }

    #[test]
    fn seeded_core_types_resolve_unprefixed() {
        let mut nses = registry_in("app.main");
        let id = nses.resolve(&Symbol::qualified(CORE_NS, "String")).unwrap();
        assert_eq!(id.name, "String");
        assert!(nses.current().imports.is_empty());
    }

    #[test]
    fn current_ns_def_wins() {
        let mut nses = registry_in("app.main");
        nses.define("frob", DefRecord::predeclaration("frob", DefKind::DartFn));
        let id = nses.resolve(&Symbol::simple("frob")).unwrap();
        assert_eq!(id.name, "frob");
        assert_eq!(id.marker, FnMarker::Native);
    }

    #[test]
    fn alias_resolution_goes_through_import() {
        let mut nses = registry_in("app.main");
        let alias = nses.ensure_import("dart:math", None);
        assert_eq!(alias, "math");
        nses.current_mut().aliases.insert("m".into(), alias);
        let id = nses.resolve(&Symbol::qualified("m", "max")).unwrap();
        assert_eq!(id.name, "math.max");
    }

    #[test]
    fn known_namespace_reference_adds_import() {
        let mut nses = Namespaces::new();
        nses.in_ns("app.util");
        nses.define("helper", DefRecord::predeclaration("helper", DefKind::DartFn));
        nses.in_ns("app.main");
        let id = nses.resolve(&Symbol::qualified("app.util", "helper")).unwrap();
        assert_eq!(id.name, "util.helper");
        let imp = nses.current().imports.get("util").unwrap();
        assert_eq!(imp.lib, "app/util.dart");
        assert_eq!(imp.ns.as_deref(), Some("app.util"));

        // second resolution reuses the same alias
        let again = nses.resolve(&Symbol::qualified("app.util", "helper")).unwrap();
        assert_eq!(again.name, id.name);
        assert_eq!(nses.current().imports.len(), 1);
    }

    #[test]
    fn alias_collision_gets_counter() {
        let mut nses = registry_in("app.main");
        assert_eq!(nses.ensure_import("package:a/util.dart", None), "util");
        assert_eq!(nses.ensure_import("package:b/util.dart", None), "util1");
    }

    #[test]
    fn unknown_symbol_fails() {
        let mut nses = registry_in("app.main");
        let err = nses.resolve(&Symbol::simple("nope")).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnknownSymbol(_)));
    }

    #[test]
    fn type_tags() {
        let mut nses = registry_in("app.main");
        assert_eq!(nses.resolve_type("String").unwrap(), DartType::named("String"));
        assert_eq!(
            nses.resolve_type("String?").unwrap(),
            DartType::named("String").nullable()
        );
        assert_eq!(nses.resolve_type("dynamic").unwrap(), DartType::dynamic());

        nses.ensure_import("dart:math", None);
        nses.current_mut().aliases.insert("m".into(), "math".into());
        assert_eq!(
            nses.resolve_type("m.Random").unwrap(),
            DartType::aliased("math", "Random")
        );

        assert!(matches!(
            nses.resolve_type("Frob").unwrap_err().kind,
            ErrorKind::UnknownTypeTag(_)
        ));
    }

    #[test]
    fn trailing_param_name_is_ignored() {
        let mut nses = registry_in("app.main");
        assert_eq!(nses.resolve_type("String s").unwrap(), DartType::named("String"));
    }
}
