//! Compiler from structured IR to generated code, and the evaluator that
//! runs it.

mod ast;
mod compilation;
mod compiler;
mod eval;
mod ir;

pub use compilation::Compilation;
pub use compiler::generate;
pub use eval::{Globals, ScriptError, ScriptFunction, ScriptResult, ScriptValue};
pub use ir::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0} is not supported by the backend")]
    Unsupported(&'static str),
    #[error("malformed IR: {0}")]
    Malformed(String),
}
