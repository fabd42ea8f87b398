//! Errors reported while loading rule bytecode.
//!
//! Loading is the only fallible stage. Once a [`Code`](crate::vm::code::Code)
//! has been accepted, executing it cannot fail: a rule that goes wrong at
//! run time aborts gracefully instead (see [`Machine`](crate::vm::Machine)).

use std::fmt;

use crate::vm::code::Opcode;

/// Rejection reasons for a bytecode stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeError {
    /// A byte that does not name any opcode.
    InvalidOpcode(u8),
    /// A known opcode with no implementation for the side (action or
    /// constraint) it was compiled into.
    UnimplementedOpcode(Opcode),
    /// The stream ended in the middle of an instruction's operands.
    ArgumentsExhausted,
    /// A context-item block claimed more bytes than the stream holds.
    JumpPastEnd,
    /// The final instruction is not a return.
    MissingReturn,
    /// A context item inside another context item.
    NestedContextItem,
    /// Conservative depth tracking found a pop with nothing to pop.
    UnderfullStack,
    /// A class, glyph attribute, feature or slot reference outside the
    /// bounds the compilation context declared.
    OutOfRangeData,
}

impl fmt::Display for CodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeError::InvalidOpcode(b) => write!(f, "invalid opcode {b:#04x}"),
            CodeError::UnimplementedOpcode(op) => {
                write!(f, "opcode {op} is not implemented on this side")
            }
            CodeError::ArgumentsExhausted => write!(f, "bytecode ended mid-instruction"),
            CodeError::JumpPastEnd => write!(f, "context item skips past the end of the code"),
            CodeError::MissingReturn => write!(f, "code does not end in a return"),
            CodeError::NestedContextItem => write!(f, "context item inside a context item"),
            CodeError::UnderfullStack => write!(f, "instruction pops an empty stack"),
            CodeError::OutOfRangeData => write!(f, "operand is out of range for this context"),
        }
    }
}

impl std::error::Error for CodeError {}
