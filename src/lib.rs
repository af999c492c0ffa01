//! Compiler core for Lotus, a Clojure-family Lisp that compiles to Dart.
//!
//! The pipeline: a reader (external, see [`driver::FormSource`]) yields
//! surface [`Form`]s; the [`expand`] fixpoint rewrites macros away; the
//! [`analyze`] pass lowers each top-level form to [`ir`] and records
//! definitions in the namespace registry; the [`emit`] pass renders Dart
//! source per definition; the [`driver`] writes per-namespace output files.

pub use error::{CompileError, ErrorKind};
pub mod error;

pub use form::{Form, Keyword, Symbol};
pub mod form;

pub mod ident;

pub use context::CompilerContext;
pub mod context;

pub mod nses;

pub mod expand;

pub mod ir;

pub mod analyze;

pub mod emit;

pub use driver::{Config, Driver, FormSource};
pub mod driver;
