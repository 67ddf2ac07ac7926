use crate::types::encoding::DecodeError;
use scopevm_derive::Error;

/// Reason a machine halted.
///
/// The discriminant is the code carried by `ABORT`; `None` is the
/// end-of-program sentinel, not an error.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorKind {
    #[error("no error")]
    None = 0,
    /// Heap capacity exhausted or an unsatisfiable allocation size.
    #[error("memory allocation failure")]
    Memory = 1,
    /// Malformed instruction stream, GC invariant violation, stale handle or
    /// register read as the wrong kind.
    #[error("internal error")]
    Internal = 2,
    /// Checked heap access outside `0..limit`.
    #[error("index out of range")]
    IndexOutOfRange = 13,
    #[error("divide by zero")]
    DivideByZero = 14,
    /// Register address past the stack, or call/frame depth past the frame limit.
    #[error("stack overflow")]
    StackOverflow = 15,
    /// Checked load from a slot never written since allocation.
    #[error("read of uninitialized memory")]
    UninitializedRead = 16,
    /// Control reached the end of a function body without returning a value.
    #[error("function did not return a value")]
    UnreturnedFunction = 17,
    /// User requested abort.
    #[error("aborted")]
    Abort = 18,
    /// Unregistered foreign function, arity mismatch or a failing foreign call.
    #[error("foreign call failed")]
    Foreign = 19,
    #[error("cannot open file")]
    CannotOpenFile = 20,
    /// Execution stopped through a [`HaltHandle`](super::vm::HaltHandle).
    #[error("execution cancelled")]
    Cancelled = 21,
}

impl ErrorKind {
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Maps an `ABORT` operand back to its kind.
    pub const fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0 => Self::None,
            1 => Self::Memory,
            2 => Self::Internal,
            13 => Self::IndexOutOfRange,
            14 => Self::DivideByZero,
            15 => Self::StackOverflow,
            16 => Self::UninitializedRead,
            17 => Self::UnreturnedFunction,
            18 => Self::Abort,
            19 => Self::Foreign,
            20 => Self::CannotOpenFile,
            21 => Self::Cancelled,
            _ => return None,
        })
    }
}

/// Halting error returned by [`Machine::execute`](super::vm::Machine::execute).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} at instruction {ip}")]
pub struct MachineError {
    pub kind: ErrorKind,
    /// Index of the instruction that triggered the halt.
    pub ip: usize,
}

/// Errors raised outside of execution: loading, validating and assembling programs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VMError {
    /// Opcode with an unknown base operation.
    #[error("invalid opcode {opcode:#06x} at instruction {index}")]
    InvalidOpcode { opcode: u16, index: usize },
    /// Addressing mask sets the global bit on an operand that is not a register.
    #[error("invalid addressing mask on {mnemonic} at instruction {index}")]
    InvalidAddressing { mnemonic: &'static str, index: usize },
    /// Jump or label immediate pointing past the end of the stream.
    #[error("jump target {target} out of range at instruction {index}")]
    InvalidJumpTarget { target: u16, index: usize },
    /// Stream is empty or does not end with `ABORT 0`.
    #[error("instruction stream is not terminated by the ABORT sentinel")]
    MissingSentinel,
    #[error("decoding error: {reason}")]
    DecodeError { reason: String },
    #[error("invalid machine configuration: {reason}")]
    InvalidConfig { reason: &'static str },
    /// Backing storage for the register stack could not be reserved.
    #[error("cannot reserve {registers} registers")]
    OutOfMemory { registers: usize },
    #[error("unknown mnemonic {0}")]
    UnknownMnemonic(String),
    #[error("{mnemonic} expects {expected} operands, got {actual}")]
    ArityMismatch {
        mnemonic: String,
        expected: usize,
        actual: usize,
    },
    #[error("invalid operand {token}")]
    InvalidOperand { token: String },
    #[error("invalid directive {0}")]
    InvalidDirective(String),
    #[error("duplicate label {0}")]
    DuplicateLabel(String),
    #[error("undefined label {0}")]
    UndefinedLabel(String),
    /// Assembly error located in the source text.
    #[error("line {line}:{offset}: {source}")]
    AssemblyError {
        line: usize,
        offset: usize,
        source: String,
    },
    #[error("io error on {path}: {source}")]
    IoError { path: String, source: String },
    /// Foreign library symbol the resolver could not provide.
    #[error("unresolved foreign symbol {library}::{symbol}")]
    UnresolvedForeign { library: String, symbol: String },
    #[error("foreign table is full")]
    ForeignTableFull,
}

impl VMError {
    /// Halting kind this error maps to when surfaced to a program host.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VMError::IoError { .. } => ErrorKind::CannotOpenFile,
            VMError::OutOfMemory { .. } => ErrorKind::Memory,
            VMError::UnresolvedForeign { .. } | VMError::ForeignTableFull => ErrorKind::Foreign,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<DecodeError> for VMError {
    fn from(err: DecodeError) -> Self {
        VMError::DecodeError {
            reason: err.to_string(),
        }
    }
}
