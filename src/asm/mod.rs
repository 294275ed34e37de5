//! Two-pass assembler for the VideoCore VI QPU instruction set.
//!
//! The QPU issues one 64-bit VLIW word per cycle. A word carries up to one
//! add-pipe operation and one multiply-pipe operation, an optional signal
//! (uniform load, TMU transaction, thread switch), an optional
//! condition/flag-update spec, and (in its branch form) a relative
//! branch target.
//!
//! This module provides:
//! - Typed operands (accumulators, register file, magic ports, small
//!   immediates)
//! - The instruction model and its bit-exact 64-bit packing
//! - A builder-style assembler with symbolic labels and a second
//!   resolution/encoding pass
//! - A decoder/disassembler used to round-trip every word the encoder
//!   produces
//!
//! # Example
//!
//! ```
//! use v3d_qpu::asm::{assemble, R5};
//!
//! let program = assemble(|asm| {
//!     asm.nop().ldunif();
//!     let entry = asm.begin_loop();
//!     asm.sub(R5, R5, 1).pushn();
//!     entry.branch_back(asm).anyna();
//!     asm.nop();
//!     asm.nop();
//!     asm.nop();
//!     asm.end_program();
//! })
//! .unwrap();
//! assert!(program.len() > 8);
//! ```
//!
//! The pipelined branch unit does not flush: the three instructions after
//! a branch always execute, and the assembler rejects programs that do not
//! supply them.

pub mod assembler;
pub mod disasm;
pub mod instruction;
pub mod registers;

pub use assembler::{assemble, Assembler, Loop, Program, Slot};
pub use disasm::{decode, decode_stream, disassemble, DecodeError};
pub use instruction::{
    AddOp, AluInstr, BranchCond, BranchInstr, BranchTarget, Cond, CondSpec, Flags, Instruction,
    Loc, MulOp, RotateSource, Sig, BRANCH_DELAY_SLOTS, TMU_RESULT_LATENCY,
};
pub use registers::{
    rf, Imm, Port, Reg, Src, EXP, LOG, NULL, R0, R1, R2, R3, R4, R5, R5REP, RECIP, RSQRT, SIN,
    TLB, TLBU, TMUA, TMUAU, TMUD, TMUL, UNIFA,
};

use thiserror::Error;

/// Assembly failure. Always fatal for the program being assembled; every
/// variant names enough context to diagnose without re-running.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AssemblyError {
    /// A branch referenced a label that was never declared.
    #[error("undefined label `{name}` referenced by branch at {at}")]
    UndefinedLabel { name: String, at: Loc },

    /// The same label name was declared twice in one program.
    #[error("label `{name}` declared twice (second declaration at {at})")]
    DuplicateLabel { name: String, at: Loc },

    /// A magic port was used as a source operand.
    #[error("{reg} is write-only and cannot be read ({at})")]
    NotReadable { reg: String, at: Loc },

    /// An immediate outside the hardware's small-immediate table.
    #[error("immediate {value} has no small-immediate encoding ({at})")]
    UnencodableImmediate { value: String, at: Loc },

    /// More than two distinct register-file operands in one instruction.
    #[error("instruction reads more than two register-file slots ({at})")]
    RegFilePortsExhausted { at: Loc },

    /// Two different small immediates in one instruction.
    #[error("instruction already carries a different small immediate ({at})")]
    ImmediateConflict { at: Loc },

    /// A second operation was chained onto a pipe that is already in use.
    #[error("{pipe} pipe already in use in this instruction ({at})")]
    PipeBusy { pipe: &'static str, at: Loc },

    /// The requested signal set has no encoding.
    #[error("signal combination cannot be encoded ({at})")]
    SignalCombination { at: Loc },

    /// Register-writing signals occupy the condition field.
    #[error("a register-writing signal excludes conditions and flag updates ({at})")]
    SignalWithCondition { at: Loc },

    /// The requested condition/flag combination has no encoding.
    #[error("condition combination cannot be encoded ({at})")]
    UnencodableCondition { at: Loc },

    /// Rotate amounts are restricted to -15..=15 (or r5).
    #[error("rotate amount {amount} out of range -15..=15 ({at})")]
    RotateOutOfRange { amount: i32, at: Loc },

    /// A branch or thread switch without its mandatory delay-slot
    /// instructions.
    #[error(
        "instruction {index} needs {need} delay-slot instructions after it, found {have}"
    )]
    MissingDelaySlots { index: usize, need: usize, have: usize },

    /// A branch placed inside another branch's delay slots.
    #[error("instruction {slot} sits in the delay slots of the branch at {index}")]
    BranchInDelaySlot { index: usize, slot: usize },

    /// Internal: encode called on a branch that was never resolved.
    #[error("branch target `{name}` was not resolved before encoding")]
    UnresolvedBranch { name: String },

    /// A modifier was applied to an instruction slot with no operation on
    /// the pipe it targets.
    #[error("modifier has no operation to modify ({at})")]
    DanglingModifier { at: Loc },
}
