mod arena;
pub mod backend;
mod bytecode;
mod context;
mod error;
mod frame;
mod interpreter;
mod kind;
mod metadata;
mod native;
mod object;
mod thread;
mod value;

#[cfg(test)]
mod testing;

pub use arena::*;
pub use bytecode::*;
pub use context::*;
pub use error::*;
pub use frame::*;
pub use interpreter::{Completion, interpret};
pub use kind::*;
pub use metadata::*;
pub use native::*;
pub use object::*;
pub use thread::*;
pub use value::*;
