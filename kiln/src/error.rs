use thiserror::Error;

use crate::{ConstantTag, ObjectRef, Opcode, backend::ScriptError};

pub type VmResult<T> = Result<T, VmError>;

#[derive(Debug, Error)]
pub enum VmError {
    /// A language-level exception escaped the host entry frame.
    #[error("uncaught exception {0}")]
    Exception(ObjectRef),
    #[error("unknown opcode 0x{opcode:02x} at pc {pc}")]
    UnknownOpcode { opcode: u8, pc: usize },
    #[error("opcode {0:?} is not supported")]
    Unsupported(Opcode),
    #[error("bytecode of {method} ends inside the instruction at pc {pc}")]
    CodeBounds { method: String, pc: usize },
    #[error("constant pool entry {index} is not a {expected:?} constant")]
    ConstantPool { index: u16, expected: ConstantTag },
    #[error("class {0} has no constant pool")]
    MissingConstantPool(String),
    #[error("no native implementation bound for {0}")]
    UnboundNative(String),
    #[error("abstract method {0} invoked")]
    AbstractMethod(String),
    #[error("no implementation of {method} found in {class}")]
    NoSuchMethod { class: String, method: String },
    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: &'static str, got: String },
    #[error("invalid descriptor {0}")]
    Descriptor(String),
    #[error("method {method} declares {max_locals} locals but takes {arguments} argument slots")]
    LocalsTooSmall {
        method: String,
        max_locals: usize,
        arguments: usize,
    },
    #[error("branch target {target} outside of {method}")]
    BranchTarget { method: String, target: isize },
    #[error("thread has no frame to execute")]
    NoFrame,
    #[error("label was never bound")]
    UnboundLabel,
    #[error("jump offset {0} does not fit the instruction")]
    JumpOutOfRange(isize),
    #[error(transparent)]
    Script(#[from] ScriptError),
}
