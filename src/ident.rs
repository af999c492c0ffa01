//! Identifier mangling and gensym.
//!
//! Every source symbol that survives into emitted Dart goes through
//! [`munge`], which is injective: distinct source names always map to
//! distinct Dart names.  Locals additionally get a `$N` counter suffix from
//! [`GensymScope`] so that names are unique within one top-level form.

use std::collections::HashMap;

/// Dart reserved words, sorted for binary search.
///
/// Includes contextual keywords that are legal identifiers in some positions;
/// mangling all of them keeps the emitter out of Dart's grammar corner cases.
const DART_RESERVED: &[&str] = &[
    "abstract", "as", "assert", "async", "await", "break", "case", "catch",
    "class", "const", "continue", "covariant", "default", "deferred", "do",
    "dynamic", "else", "enum", "export", "extends", "extension", "external",
    "factory", "false", "final", "finally", "for", "get", "hide", "if",
    "implements", "import", "in", "interface", "is", "late", "library",
    "mixin", "new", "null", "on", "operator", "part", "required", "rethrow",
    "return", "set", "show", "static", "super", "switch", "sync", "this",
    "throw", "true", "try", "typedef", "var", "void", "while", "with",
    "yield",
];

pub fn is_dart_reserved(name: &str) -> bool {
    DART_RESERVED.binary_search(&name).is_ok()
}

/// Mangle a source identifier into a valid Dart identifier.
pub fn munge(name: &str) -> String {
    if is_dart_reserved(name) {
        return format!("${}_", name);
    }

    let mut out = String::with_capacity(name.len());
    let chars: Vec<char> = name.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];

        if i == 0 && c == '-' {
            out.push_str("$_");
            i += 1;
            continue;
        }

        if c == '_' && chars.get(i + 1) == Some(&'_') {
            // `__auto__` and `__<digits>` have dedicated spellings.
            if chars[i..].starts_with(&['_', '_', 'a', 'u', 't', 'o', '_', '_']) {
                out.push_str("$AUTO_");
                i += 8;
                continue;
            }
            if chars.get(i + 2).map_or(false, |c| c.is_ascii_digit()) {
                out.push('$');
                i += 2;
                while let Some(d) = chars.get(i).filter(|c| c.is_ascii_digit()) {
                    out.push(*d);
                    i += 1;
                }
                out.push('_');
                continue;
            }
        }

        match c {
            '-' => out.push('_'),
            '_' => out.push_str("$UNDERSCORE_"),
            '$' => out.push_str("$DOLLAR_"),
            ':' => out.push_str("$COLON_"),
            '+' => out.push_str("$PLUS_"),
            '>' => out.push_str("$GT_"),
            '<' => out.push_str("$LT_"),
            '=' => out.push_str("$EQ_"),
            '~' => out.push_str("$TILDE_"),
            '!' => out.push_str("$BANG_"),
            '@' => out.push_str("$CIRCA_"),
            '#' => out.push_str("$SHARP_"),
            '\'' => out.push_str("$SINGLEQUOTE_"),
            '"' => out.push_str("$DOUBLEQUOTE_"),
            '%' => out.push_str("$PERCENT_"),
            '^' => out.push_str("$CARET_"),
            '&' => out.push_str("$AMPERSAND_"),
            '*' => out.push_str("$STAR_"),
            '|' => out.push_str("$BAR_"),
            '{' => out.push_str("$LBRACE_"),
            '}' => out.push_str("$RBRACE_"),
            '[' => out.push_str("$LBRACK_"),
            ']' => out.push_str("$RBRACK_"),
            '/' => out.push_str("$SLASH_"),
            '\\' => out.push_str("$BSLASH_"),
            '?' => out.push_str("$QMARK_"),
            c if c.is_alphanumeric() => out.push(c),
            c => out.push_str(&format!("$u{:x}_", c as u32)),
        }
        i += 1;
    }
    out
}

// =============================================================================

/// Identifier factory for one top-level form.
///
/// Produces names of the shape `hint$N`, counting per hint.  The analyzer
/// opens a fresh scope for each top-level form and tears it down afterwards;
/// calling [`GensymScope::gensym`] without an open scope is a bug in the
/// analyzer, not a user error (see [`crate::context::CompilerContext`]).
#[derive(Debug, Default)]
pub struct GensymScope {
    counters: HashMap<String, u32>,
}

impl GensymScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce a fresh name for `hint`.  The hint is expected to already be
    /// munged (it is spliced into the output verbatim).
    pub fn gensym(&mut self, hint: &str) -> String {
        let n = self.counters.entry(hint.to_owned()).or_insert(0);
        *n += 1;
        format!("{}${}", hint, n)
    }

    /// Produce a fresh *source-level* symbol name for macro expansions,
    /// `hint__N`.  The shape matters: `__N` has a dedicated spelling in
    /// [`munge`], so these survive mangling without noise.
    pub fn gensym_form(&mut self, hint: &str) -> String {
        let n = self.counters.entry(format!("form:{}", hint)).or_insert(0);
        *n += 1;
        format!("{}__{}", hint, n)
    }
}

// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn reserved_words_are_wrapped() {
        assert_eq!(munge("class"), "$class_");
        assert_eq!(munge("if"), "$if_");
        assert_eq!(munge("await"), "$await_");
    }

    #[test]
    fn reserved_table_is_sorted() {
        let mut sorted = DART_RESERVED.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, DART_RESERVED);
    }

    #[test]
    fn char_table() {
        assert_eq!(munge("foo-bar"), "foo_bar");
        assert_eq!(munge("nil?"), "nil$QMARK_");
        assert_eq!(munge("->name"), "$_$GT_name");
        assert_eq!(munge("a+b"), "a$PLUS_b");
        assert_eq!(munge("a_b"), "a$UNDERSCORE_b");
        assert_eq!(munge("a/b"), "a$SLASH_b");
        assert_eq!(munge("set!"), "set$BANG_");
    }

    #[test]
    fn double_underscore_forms() {
        assert_eq!(munge("x__12"), "x$12_");
        assert_eq!(munge("__auto__"), "$AUTO_");
        assert_eq!(munge("x__auto__y"), "x$AUTO_y");
    }

    #[test]
    fn hex_fallback() {
        assert_eq!(munge("a\u{3bb}"), "a\u{3bb}"); // letters pass through
        assert_eq!(munge("a;b"), "a$u3b_b");
    }

    // Cheap deterministic generator; no need to pull in a crate for this.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    #[test]
    fn munge_is_injective_on_random_symbols() {
        const ALPHABET: &[char] = &[
            'a', 'b', 'z', '0', '9', '-', '_', '$', '?', '!', '+', '<', '>',
            '=', '*', '/', '&', '%', '.', '|',
        ];
        let mut rng = XorShift(0x5eed_1234_dead_beef);
        let mut names = HashSet::new();
        while names.len() < 2000 {
            let len = 1 + (rng.next() % 8) as usize;
            let name: String =
                (0..len).map(|_| ALPHABET[(rng.next() % ALPHABET.len() as u64) as usize]).collect();
            names.insert(name);
        }

        let mut seen = HashMap::new();
        for name in &names {
            if let Some(clash) = seen.insert(munge(name), name.clone()) {
                panic!("munge collision: {:?} and {:?} -> {:?}", clash, name, munge(name));
            }
        }
    }

    #[test]
    fn gensym_counts_per_hint() {
        let mut scope = GensymScope::new();
        assert_eq!(scope.gensym("x"), "x$1");
        assert_eq!(scope.gensym("x"), "x$2");
        assert_eq!(scope.gensym("test"), "test$1");
        assert_eq!(scope.gensym("x"), "x$3");
    }
}
