//! The mutable state shared by the expander and the analyzer.
//!
//! One [`CompilerContext`] lives for a whole compilation run; the namespace
//! registry inside it accumulates definitions across top-level forms, while
//! the gensym scope is opened fresh for each top-level form and torn down
//! afterwards.

use crate::ident::GensymScope;
use crate::nses::Namespaces;

#[derive(Debug)]
pub struct CompilerContext {
    pub nses: Namespaces,
    /// `Some` only while a top-level form is being analyzed.
    gensym: Option<GensymScope>,
}

impl Default for CompilerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilerContext {
    pub fn new() -> Self {
        CompilerContext { nses: Namespaces::new(), gensym: None }
    }

    /// Run `f` inside a fresh gensym scope.  Nested entry saves and restores
    /// the outer scope, so identifier counters never leak between forms.
    pub fn with_gensym_scope<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let saved = self.gensym.replace(GensymScope::new());
        let out = f(self);
        self.gensym = saved;
        out
    }

    /// Produce a fresh identifier for `hint` (already munged).
    ///
    /// Panics when no scope is open: analysis entry points are required to
    /// wrap themselves in [`Self::with_gensym_scope`].
    pub fn gensym(&mut self, hint: &str) -> String {
        self.gensym
            .as_mut()
            .expect("gensym used outside a top-level form scope. This is a bug!")
            .gensym(hint)
    }

    /// Fresh source-level symbol name (`hint__N`) for macro expansions.
    pub fn gensym_form(&mut self, hint: &str) -> String {
        self.gensym
            .as_mut()
            .expect("gensym used outside a top-level form scope. This is a bug!")
            .gensym_form(hint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_reset_between_forms() {
        let mut ctx = CompilerContext::new();
        let first = ctx.with_gensym_scope(|ctx| ctx.gensym("x"));
        let second = ctx.with_gensym_scope(|ctx| ctx.gensym("x"));
        assert_eq!(first, "x$1");
        assert_eq!(second, "x$1");
    }

    #[test]
    fn nested_scopes_restore() {
        let mut ctx = CompilerContext::new();
        ctx.with_gensym_scope(|ctx| {
            assert_eq!(ctx.gensym("x"), "x$1");
            ctx.with_gensym_scope(|ctx| {
                assert_eq!(ctx.gensym("x"), "x$1");
            });
            assert_eq!(ctx.gensym("x"), "x$2");
        });
    }

    #[test]
    #[should_panic(expected = "outside a top-level form scope")]
    fn gensym_outside_scope_is_a_bug() {
        let mut ctx = CompilerContext::new();
        let _ = ctx.gensym("x");
    }
}
