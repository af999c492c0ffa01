//! Compilation errors.
//!
//! Every failure the core can raise is fatal to the current compilation; the
//! driver reports it and moves on to the next namespace.  There is no
//! recovery machinery inside the core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CompileError>;

/// An error raised while compiling one top-level form.
///
/// Carries the printed representation of the form (or sub-form) that caused
/// the failure, since reader-produced trees have no source positions.
#[derive(Debug, Error)]
#[error("{kind}\n  in: {context}")]
pub struct CompileError {
    pub kind: ErrorKind,
    pub context: String,
}

impl CompileError {
    pub fn new(kind: ErrorKind, context: impl ToString) -> Self {
        CompileError { kind, context: context.to_string() }
    }
}

impl From<std::io::Error> for CompileError {
    fn from(e: std::io::Error) -> Self {
        CompileError::new(ErrorKind::Io(e), "<io>")
    }
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),

    #[error("unknown type tag '{0}'")]
    UnknownTypeTag(String),

    #[error("cannot assign to '{0}': not a mutable local or a field access")]
    BadAssignment(String),

    #[error("recur crosses a try boundary")]
    RecurAcrossTry,

    #[error("recur expects {expected} argument(s), got {got}")]
    RecurArityMismatch { expected: usize, got: usize },

    #[error("recur is only allowed in tail position")]
    RecurOutsideTail,

    #[error("doc position of def takes a string literal, got a {0}")]
    DocStringMisplaced(&'static str),

    #[error("unsupported import spec")]
    UnsupportedImportSpec,

    #[error("unsupported literal ({0})")]
    UnsupportedLiteral(&'static str),

    #[error("are: {args} argument(s) do not fill rows of the {argv}-slot template")]
    AreArityMismatch { argv: usize, args: usize },

    #[error("malformed {form}: {reason}")]
    MalformedForm { form: &'static str, reason: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_carries_form_context() {
        let e = CompileError::new(
            ErrorKind::UnknownSymbol("frob".into()),
            "(frob 1 2)",
        );
        let text = e.to_string();
        assert!(text.contains("unknown symbol 'frob'"), "{}", text);
        assert!(text.contains("(frob 1 2)"), "{}", text);
    }
}
