//! QPU instruction model and 64-bit word packing.
//!
//! # Word format (instruction-set v4.2)
//!
//! ALU form:
//!
//! ```text
//!  63       58 57   53 52    46 45 44 43     38 37     32 31    24
//! +-----------+-------+--------+--+--+---------+---------+--------+
//! |  op_mul   |  sig  |  cond  |mm|ma| waddr_m | waddr_a | op_add |
//! +-----------+-------+--------+--+--+---------+---------+--------+
//!  23    21 20    18 17    15 14    12 11      6 5        0
//! +--------+--------+--------+--------+---------+----------+
//! | mul_b  | mul_a  | add_b  | add_a  | raddr_a | raddr_b  |
//! +--------+--------+--------+--------+---------+----------+
//! ```
//!
//! Source muxes 0-5 select accumulators r0-r5; mux 6 reads the register
//! file through `raddr_a`, mux 7 through `raddr_b` (or the small-immediate
//! table when the smallimm signal is raised). Unary and nullary operations
//! reuse the unused `b` (and `a`) mux bits as a sub-opcode selector.
//!
//! Branch form (op_mul = 0, bit 57 set):
//!
//! ```text
//!  63     58 57 56 55         35 34  32 31      24 ... 14 13 12
//! +---------+--+--+-------------+------+----------+    +--+-----+
//! |    0    | 1| 0| addr[23:3]  | cond | addr[31:24]   |ub| bdi |
//! +---------+--+--+-------------+------+----------+    +--+-----+
//! ```
//!
//! The branch address is a byte offset relative to the end of the three
//! delay slots; instruction words are 8 bytes so bits [2:0] are always
//! zero.
//!
//! The condition field multiplexes flag updates, conditional execution and
//! the destination of register-writing signals; see [`CondSpec::pack`].

use std::fmt;

use super::registers::{Reg, Src};
use super::AssemblyError;

/// Instructions that must follow a branch before control transfers.
/// The pipeline does not flush; these always execute.
pub const BRANCH_DELAY_SLOTS: usize = 3;

/// Instructions between a TMU transaction (write to `tmua`) and the
/// earliest `ldtmu` that may observe its result.
pub const TMU_RESULT_LATENCY: usize = 3;

// ---------------------------------------------------------------------------
// Field layout

const OP_MUL_SHIFT: u32 = 58;
const SIG_SHIFT: u32 = 53;
const COND_SHIFT: u32 = 46;
const MM_BIT: u64 = 1 << 45;
const MA_BIT: u64 = 1 << 44;
const WADDR_M_SHIFT: u32 = 38;
const WADDR_A_SHIFT: u32 = 32;
const OP_ADD_SHIFT: u32 = 24;
const MUL_B_SHIFT: u32 = 21;
const MUL_A_SHIFT: u32 = 18;
const ADD_B_SHIFT: u32 = 15;
const ADD_A_SHIFT: u32 = 12;
const RADDR_A_SHIFT: u32 = 6;
const RADDR_B_SHIFT: u32 = 0;

const BR_MARKER: u64 = 1 << 57;
const BR_ADDR_LOW_SHIFT: u32 = 35; // addr bits [23:3]
const BR_COND_SHIFT: u32 = 32;
const BR_ADDR_HIGH_SHIFT: u32 = 24; // addr bits [31:24]
const BR_BDI_SHIFT: u32 = 12; // 1 = pc-relative

/// Sig-address form of the condition field: bit 6 is the magic flag, bits
/// [5:0] the waddr of the signal's destination register.
const COND_SIG_MAGIC: u8 = 1 << 6;

// ---------------------------------------------------------------------------
// Source position

/// Source position of the call that built an instruction, kept for
/// diagnostics (assembly errors point at user code, not at the assembler).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loc {
    pub file: &'static str,
    pub line: u32,
}

impl Loc {
    /// Position of instructions that did not come from source (decoded
    /// words, synthesized fills).
    pub const UNKNOWN: Loc = Loc {
        file: "<unknown>",
        line: 0,
    };

    #[track_caller]
    pub fn caller() -> Loc {
        let l = std::panic::Location::caller();
        Loc {
            file: l.file(),
            line: l.line(),
        }
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

// ---------------------------------------------------------------------------
// Operations

/// How an operation consumes its operand muxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shape {
    /// Two sources: a and b muxes.
    Binary,
    /// One source in the a mux; the b mux holds a sub-opcode.
    Unary(u8),
    /// No sources; the b mux holds a sub-opcode, the a mux is zero.
    Nullary(u8),
}

/// Add-pipe operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOp {
    Fadd,
    Fsub,
    Fmin,
    Fmax,
    Add,
    Sub,
    Min,
    Max,
    Umin,
    Umax,
    Shl,
    Shr,
    Asr,
    Ror,
    Band,
    Bor,
    Bxor,
    Bnot,
    Neg,
    Nop,
    Tidx,
    Eidx,
    Sampid,
    Barrierid,
    Tmuwt,
}

impl AddOp {
    pub(crate) fn desc(self) -> (u8, Shape) {
        use Shape::*;
        match self {
            AddOp::Fadd => (0, Binary),
            AddOp::Add => (56, Binary),
            AddOp::Sub => (60, Binary),
            AddOp::Fsub => (64, Binary),
            AddOp::Min => (120, Binary),
            AddOp::Max => (121, Binary),
            AddOp::Umin => (122, Binary),
            AddOp::Umax => (123, Binary),
            AddOp::Shl => (124, Binary),
            AddOp::Shr => (125, Binary),
            AddOp::Asr => (126, Binary),
            AddOp::Ror => (127, Binary),
            AddOp::Fmin => (128, Binary),
            AddOp::Fmax => (129, Binary),
            AddOp::Band => (181, Binary),
            AddOp::Bor => (182, Binary),
            AddOp::Bxor => (183, Binary),
            AddOp::Bnot => (186, Unary(0)),
            AddOp::Neg => (186, Unary(1)),
            AddOp::Nop => (187, Nullary(0)),
            AddOp::Tidx => (187, Nullary(1)),
            AddOp::Eidx => (187, Nullary(2)),
            AddOp::Sampid => (187, Nullary(3)),
            AddOp::Barrierid => (187, Nullary(4)),
            AddOp::Tmuwt => (187, Nullary(5)),
        }
    }

    /// Reverse of [`AddOp::desc`].
    pub(crate) fn from_fields(opcode: u8, add_b: u8) -> Option<AddOp> {
        Some(match opcode {
            0 => AddOp::Fadd,
            56 => AddOp::Add,
            60 => AddOp::Sub,
            64 => AddOp::Fsub,
            120 => AddOp::Min,
            121 => AddOp::Max,
            122 => AddOp::Umin,
            123 => AddOp::Umax,
            124 => AddOp::Shl,
            125 => AddOp::Shr,
            126 => AddOp::Asr,
            127 => AddOp::Ror,
            128 => AddOp::Fmin,
            129 => AddOp::Fmax,
            181 => AddOp::Band,
            182 => AddOp::Bor,
            183 => AddOp::Bxor,
            186 => match add_b {
                0 => AddOp::Bnot,
                1 => AddOp::Neg,
                _ => return None,
            },
            187 => match add_b {
                0 => AddOp::Nop,
                1 => AddOp::Tidx,
                2 => AddOp::Eidx,
                3 => AddOp::Sampid,
                4 => AddOp::Barrierid,
                5 => AddOp::Tmuwt,
                _ => return None,
            },
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            AddOp::Fadd => "fadd",
            AddOp::Fsub => "fsub",
            AddOp::Fmin => "fmin",
            AddOp::Fmax => "fmax",
            AddOp::Add => "add",
            AddOp::Sub => "sub",
            AddOp::Min => "min",
            AddOp::Max => "max",
            AddOp::Umin => "umin",
            AddOp::Umax => "umax",
            AddOp::Shl => "shl",
            AddOp::Shr => "shr",
            AddOp::Asr => "asr",
            AddOp::Ror => "ror",
            AddOp::Band => "band",
            AddOp::Bor => "bor",
            AddOp::Bxor => "bxor",
            AddOp::Bnot => "bnot",
            AddOp::Neg => "neg",
            AddOp::Nop => "nop",
            AddOp::Tidx => "tidx",
            AddOp::Eidx => "eidx",
            AddOp::Sampid => "sampid",
            AddOp::Barrierid => "barrierid",
            AddOp::Tmuwt => "tmuwt",
        }
    }
}

/// Multiply-pipe operations. `Rotate` is a mul-pipe move co-issued with
/// the rotate signal; the amount comes from the `raddr_b` field or from
/// `r5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulOp {
    Add,
    Sub,
    Umul24,
    Smul24,
    Vfmul,
    Fmul,
    Mov,
    Rotate,
    Nop,
}

/// Sub-opcode selectors for the op_mul = 15 group.
const MUL15_MOV: u8 = 0;
const MUL15_NOP: u8 = 4;
const MUL15_ROT_R5: u8 = 5;
const MUL15_ROT_IMM: u8 = 7;

impl MulOp {
    fn desc(self) -> (u8, Shape) {
        use Shape::*;
        match self {
            MulOp::Add => (1, Binary),
            MulOp::Sub => (2, Binary),
            MulOp::Umul24 => (3, Binary),
            MulOp::Vfmul => (4, Binary),
            MulOp::Smul24 => (9, Binary),
            MulOp::Fmul => (16, Binary),
            MulOp::Mov => (15, Unary(MUL15_MOV)),
            // Rotate and Nop are encoded by hand; see Instruction::encode.
            MulOp::Rotate => (15, Unary(MUL15_ROT_IMM)),
            MulOp::Nop => (15, Nullary(MUL15_NOP)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MulOp::Add => "add",
            MulOp::Sub => "sub",
            MulOp::Umul24 => "umul24",
            MulOp::Smul24 => "smul24",
            MulOp::Vfmul => "vfmul",
            MulOp::Fmul => "fmul",
            MulOp::Mov => "mov",
            MulOp::Rotate => "rotate",
            MulOp::Nop => "nop",
        }
    }
}

// ---------------------------------------------------------------------------
// Signals

/// Where a vector rotate takes its amount from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateSource {
    /// Constant amount, -15..=15.
    Amount(i8),
    /// Per-instruction amount from r5.
    R5,
}

/// Signal set co-issued with an ALU instruction. At most one encodable
/// combination per instruction; a signal that writes a register
/// (`ldunifrf`, `ldtmu`) stores its destination in the condition field and
/// therefore excludes conditions and flag updates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Sig {
    /// Thread switch: yields the core to the sibling thread. Takes effect
    /// after [`BRANCH_DELAY_SLOTS`] instructions.
    pub thrsw: bool,
    /// Load the next uniform into r5.
    pub ldunif: bool,
    /// Load the next uniform into a register-file slot.
    pub ldunifrf: Option<Reg>,
    /// Move the oldest outstanding TMU result into a register.
    pub ldtmu: Option<Reg>,
    /// Vector rotate (mul pipe only).
    pub rot: Option<RotateSource>,
}

impl Sig {
    pub fn is_none(&self) -> bool {
        *self == Sig::default()
    }

    /// Destination register of an address-writing signal, if any.
    pub fn dest(&self) -> Option<Reg> {
        self.ldunifrf.or(self.ldtmu)
    }

    /// Signal field encoding. `smimm` is raised by the encoder when the
    /// instruction reads a small immediate through raddr_b.
    fn code(&self, smimm: bool) -> Option<u8> {
        let key = (
            self.thrsw,
            self.ldunif,
            self.ldunifrf.is_some(),
            self.ldtmu.is_some(),
            self.rot.is_some(),
            smimm,
        );
        Some(match key {
            (false, false, false, false, false, false) => 0,
            (true, false, false, false, false, false) => 1,
            (false, true, false, false, false, false) => 2,
            (true, true, false, false, false, false) => 3,
            (false, false, false, true, false, false) => 4,
            (true, false, false, true, false, false) => 5,
            (false, true, false, true, false, false) => 6,
            (true, true, false, true, false, false) => 7,
            (false, false, true, false, false, false) => 12,
            (true, false, true, false, false, false) => 13,
            (false, false, false, false, false, true) => 15,
            (false, false, false, false, true, false) => 23,
            (false, false, false, true, false, true) => 31,
            _ => return None,
        })
    }

    /// Signal components for a decoded signal field. Destination registers
    /// are filled in by the decoder from the condition field.
    pub(crate) fn from_code(code: u8) -> Option<(Sig, SigExtras)> {
        let mut sig = Sig::default();
        let mut extras = SigExtras {
            smimm: false,
            writes_addr: SigDest::None,
        };
        match code {
            0 => {}
            1 => sig.thrsw = true,
            2 => sig.ldunif = true,
            3 => {
                sig.thrsw = true;
                sig.ldunif = true;
            }
            4 => extras.writes_addr = SigDest::Ldtmu,
            5 => {
                sig.thrsw = true;
                extras.writes_addr = SigDest::Ldtmu;
            }
            6 => {
                sig.ldunif = true;
                extras.writes_addr = SigDest::Ldtmu;
            }
            7 => {
                sig.thrsw = true;
                sig.ldunif = true;
                extras.writes_addr = SigDest::Ldtmu;
            }
            12 => extras.writes_addr = SigDest::Ldunifrf,
            13 => {
                sig.thrsw = true;
                extras.writes_addr = SigDest::Ldunifrf;
            }
            15 => extras.smimm = true,
            23 => sig.rot = Some(RotateSource::Amount(0)), // amount filled by decoder
            31 => {
                extras.smimm = true;
                extras.writes_addr = SigDest::Ldtmu;
            }
            _ => return None,
        }
        Some((sig, extras))
    }
}

/// Which signal slot a decoded sig-address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SigDest {
    None,
    Ldtmu,
    Ldunifrf,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SigExtras {
    pub smimm: bool,
    pub writes_addr: SigDest,
}

// ---------------------------------------------------------------------------
// Conditions and flags

/// Flag-update request attached to one ALU half. `Push*` replaces the
/// current flags; the and/nor forms fold the new condition into them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Flags {
    PushZ = 1,
    PushN = 2,
    PushC = 3,
    AndZ = 4,
    AndNz = 5,
    NorNz = 6,
    NorZ = 7,
    AndN = 8,
    AndNn = 9,
    NorNn = 10,
    NorN = 11,
    AndC = 12,
    AndNc = 13,
    NorNc = 14,
    NorC = 15,
}

impl Flags {
    fn from_bits(v: u8) -> Option<Flags> {
        Some(match v {
            1 => Flags::PushZ,
            2 => Flags::PushN,
            3 => Flags::PushC,
            4 => Flags::AndZ,
            5 => Flags::AndNz,
            6 => Flags::NorNz,
            7 => Flags::NorZ,
            8 => Flags::AndN,
            9 => Flags::AndNn,
            10 => Flags::NorNn,
            11 => Flags::NorN,
            12 => Flags::AndC,
            13 => Flags::AndNc,
            14 => Flags::NorNc,
            15 => Flags::NorC,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Flags::PushZ => "pushz",
            Flags::PushN => "pushn",
            Flags::PushC => "pushc",
            Flags::AndZ => "andz",
            Flags::AndNz => "andnz",
            Flags::NorNz => "nornz",
            Flags::NorZ => "norz",
            Flags::AndN => "andn",
            Flags::AndNn => "andnn",
            Flags::NorNn => "nornn",
            Flags::NorN => "norn",
            Flags::AndC => "andc",
            Flags::AndNc => "andnc",
            Flags::NorNc => "nornc",
            Flags::NorC => "norc",
        }
    }
}

/// Conditional-execution predicate for one ALU half, testing the a/b flag
/// stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    IfA = 0,
    IfB = 1,
    IfNa = 2,
    IfNb = 3,
}

impl Cond {
    fn from_bits(v: u8) -> Cond {
        match v & 3 {
            0 => Cond::IfA,
            1 => Cond::IfB,
            2 => Cond::IfNa,
            _ => Cond::IfNb,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Cond::IfA => "ifa",
            Cond::IfB => "ifb",
            Cond::IfNa => "ifna",
            Cond::IfNb => "ifnb",
        }
    }
}

/// Condition/flag spec for one instruction.
///
/// The 7-bit condition field multiplexes these combinations:
///
/// ```text
/// 0000000              nothing
/// 0000ffff (1..15)     add-pipe flag update f
/// 001ffff  (17..31)    mul-pipe flag update f
/// 01 fff cc            add-pipe condition cc, optional mul-pipe push fff
/// 10 fff cc            mul-pipe condition cc, optional add-pipe push fff
/// 11 mm cc? -> 11 0 mm cc  both pipes conditional
/// ```
///
/// Only one pipe may update flags per instruction, and a condition paired
/// with the other pipe's flag update restricts that update to the push
/// forms. Anything else is [`AssemblyError::UnencodableCondition`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CondSpec {
    pub add_flags: Option<Flags>,
    pub mul_flags: Option<Flags>,
    pub add_cond: Option<Cond>,
    pub mul_cond: Option<Cond>,
}

impl CondSpec {
    pub fn is_none(&self) -> bool {
        *self == CondSpec::default()
    }

    pub(crate) fn pack(&self, at: Loc) -> Result<u8, AssemblyError> {
        let err = || AssemblyError::UnencodableCondition { at };
        let push3 = |f: Option<Flags>| -> Result<u8, AssemblyError> {
            match f {
                None => Ok(0),
                Some(f) if (f as u8) <= 3 => Ok(f as u8),
                Some(_) => Err(err()),
            }
        };
        match (self.add_flags, self.mul_flags, self.add_cond, self.mul_cond) {
            (None, None, None, None) => Ok(0),
            (Some(f), None, None, None) => Ok(f as u8),
            (None, Some(f), None, None) => Ok(0b001_0000 | f as u8),
            (None, mf, Some(c), None) => Ok(0b010_0000 | push3(mf)? << 2 | c as u8),
            (af, None, None, Some(c)) => Ok(0b100_0000 | push3(af)? << 2 | c as u8),
            (None, None, Some(a), Some(m)) => Ok(0b110_0000 | (m as u8) << 2 | a as u8),
            _ => Err(err()),
        }
    }

    pub(crate) fn unpack(field: u8) -> Option<CondSpec> {
        let mut spec = CondSpec::default();
        match field {
            0 => {}
            1..=15 => spec.add_flags = Flags::from_bits(field),
            17..=31 => spec.mul_flags = Flags::from_bits(field & 0xf),
            0b010_0000..=0b011_1111 => {
                spec.add_cond = Some(Cond::from_bits(field));
                let push = (field >> 2) & 7;
                if push > 3 {
                    return None;
                }
                if push != 0 {
                    spec.mul_flags = Flags::from_bits(push);
                }
            }
            0b100_0000..=0b101_1111 => {
                spec.mul_cond = Some(Cond::from_bits(field));
                let push = (field >> 2) & 7;
                if push > 3 {
                    return None;
                }
                if push != 0 {
                    spec.add_flags = Flags::from_bits(push);
                }
            }
            0b110_0000..=0b111_1111 => {
                spec.add_cond = Some(Cond::from_bits(field));
                spec.mul_cond = Some(Cond::from_bits((field >> 2) & 3));
                if field & 0b001_0000 != 0 {
                    return None;
                }
            }
            _ => return None,
        }
        Some(spec)
    }
}

// ---------------------------------------------------------------------------
// Branches

/// Branch predicate, testing the flag stacks across all 16 lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCond {
    Always,
    /// Lane 0 a-flag set.
    A0,
    /// Lane 0 a-flag clear.
    Na0,
    /// a-flag set in all lanes.
    AllA,
    /// a-flag clear in at least one lane.
    AnyNa,
    /// a-flag set in at least one lane.
    AnyA,
    /// a-flag clear in all lanes.
    AllNa,
}

impl BranchCond {
    fn code(self) -> u8 {
        match self {
            BranchCond::Always => 0,
            BranchCond::A0 => 2,
            BranchCond::Na0 => 3,
            BranchCond::AllA => 4,
            BranchCond::AnyNa => 5,
            BranchCond::AnyA => 6,
            BranchCond::AllNa => 7,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<BranchCond> {
        Some(match code {
            0 => BranchCond::Always,
            2 => BranchCond::A0,
            3 => BranchCond::Na0,
            4 => BranchCond::AllA,
            5 => BranchCond::AnyNa,
            6 => BranchCond::AnyA,
            7 => BranchCond::AllNa,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            BranchCond::Always => "always",
            BranchCond::A0 => "a0",
            BranchCond::Na0 => "na0",
            BranchCond::AllA => "alla",
            BranchCond::AnyNa => "anyna",
            BranchCond::AnyA => "anya",
            BranchCond::AllNa => "allna",
        }
    }
}

/// A branch destination: symbolic until pass 2, then a byte offset
/// relative to the end of the delay slots.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchTarget {
    Label(String),
    Offset(i32),
}

// ---------------------------------------------------------------------------
// Instructions

/// One half of an ALU instruction: the operation issued into one pipe.
/// `a`/`b` are `None` where the operation's shape takes no source there.
#[derive(Debug, Clone, PartialEq)]
pub struct AddHalf {
    pub op: AddOp,
    pub dst: Reg,
    pub a: Option<Src>,
    pub b: Option<Src>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MulHalf {
    pub op: MulOp,
    pub dst: Reg,
    pub a: Option<Src>,
    pub b: Option<Src>,
}

/// ALU-form instruction: up to one op per pipe plus signal and condition.
#[derive(Debug, Clone, PartialEq)]
pub struct AluInstr {
    pub add: Option<AddHalf>,
    pub mul: Option<MulHalf>,
    pub sig: Sig,
    pub cond: CondSpec,
    pub loc: Loc,
}

/// Branch-form instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchInstr {
    pub cond: BranchCond,
    pub target: BranchTarget,
    pub loc: Loc,
}

/// One issue slot of a program.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Alu(AluInstr),
    Branch(BranchInstr),
}

impl Instruction {
    pub fn loc(&self) -> Loc {
        match self {
            Instruction::Alu(i) => i.loc,
            Instruction::Branch(i) => i.loc,
        }
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, Instruction::Branch(_))
    }

    /// Canonical form for structural comparison: idle pipe halves are
    /// dropped and the source position is erased. An explicit `nop null`
    /// and an absent half encode to the same bits.
    pub fn normalized(&self) -> Instruction {
        match self {
            Instruction::Branch(b) => Instruction::Branch(BranchInstr {
                loc: Loc::UNKNOWN,
                ..b.clone()
            }),
            Instruction::Alu(a) => {
                let idle_add = |h: &AddHalf| h.op == AddOp::Nop && h.dst == super::registers::NULL;
                let idle_mul = |h: &MulHalf| h.op == MulOp::Nop && h.dst == super::registers::NULL;
                Instruction::Alu(AluInstr {
                    add: a.add.clone().filter(|h| !idle_add(h)),
                    mul: a.mul.clone().filter(|h| !idle_mul(h)),
                    sig: a.sig,
                    cond: a.cond,
                    loc: Loc::UNKNOWN,
                })
            }
        }
    }

    /// Pack this instruction into its 64-bit machine word. Branches must
    /// have been resolved to an offset.
    pub fn encode(&self) -> Result<u64, AssemblyError> {
        match self {
            Instruction::Branch(b) => b.encode(),
            Instruction::Alu(a) => a.encode(),
        }
    }
}

impl BranchInstr {
    fn encode(&self) -> Result<u64, AssemblyError> {
        let offset = match &self.target {
            BranchTarget::Offset(o) => *o,
            BranchTarget::Label(name) => {
                return Err(AssemblyError::UnresolvedBranch { name: name.clone() })
            }
        };
        let addr = offset as u32;
        debug_assert_eq!(addr & 7, 0, "instruction offsets are 8-byte aligned");
        let word = BR_MARKER
            | (((addr >> 3) & 0x1f_ffff) as u64) << BR_ADDR_LOW_SHIFT
            | (self.cond.code() as u64) << BR_COND_SHIFT
            | (((addr >> 24) & 0xff) as u64) << BR_ADDR_HIGH_SHIFT
            | 1 << BR_BDI_SHIFT;
        Ok(word)
    }
}

/// Read-port allocation for one instruction: two register-file reads plus
/// the small-immediate overlay on raddr_b.
#[derive(Default)]
struct Ports {
    raddr_a: Option<u8>,
    raddr_b: Option<RaddrB>,
}

#[derive(Clone, Copy, PartialEq)]
enum RaddrB {
    Reg(u8),
    Imm(u8),
}

impl Ports {
    fn alloc(&mut self, src: Src, at: Loc) -> Result<u8, AssemblyError> {
        match src {
            Src::Reg(Reg::Acc(n)) => Ok(n),
            Src::Reg(Reg::RegFile(n)) => {
                if self.raddr_a == Some(n) {
                    Ok(6)
                } else if self.raddr_a.is_none() {
                    self.raddr_a = Some(n);
                    Ok(6)
                } else if self.raddr_b == Some(RaddrB::Reg(n)) {
                    Ok(7)
                } else if self.raddr_b.is_none() {
                    self.raddr_b = Some(RaddrB::Reg(n));
                    Ok(7)
                } else {
                    Err(AssemblyError::RegFilePortsExhausted { at })
                }
            }
            Src::Reg(reg @ Reg::Port(_)) => Err(AssemblyError::NotReadable {
                reg: reg.to_string(),
                at,
            }),
            Src::Imm(imm) => {
                let code = imm.code().ok_or(AssemblyError::UnencodableImmediate {
                    value: imm.to_string(),
                    at,
                })?;
                match self.raddr_b {
                    None => {
                        self.raddr_b = Some(RaddrB::Imm(code));
                        Ok(7)
                    }
                    Some(RaddrB::Imm(c)) if c == code => Ok(7),
                    Some(_) => Err(AssemblyError::ImmediateConflict { at }),
                }
            }
        }
    }
}

impl AluInstr {
    fn encode(&self) -> Result<u64, AssemblyError> {
        let at = self.loc;
        let mut ports = Ports::default();
        let mut word = 0u64;

        // Add pipe. A missing half is an architectural nop writing null.
        let (op_add, add_a, add_b, waddr_a, magic_a) = match &self.add {
            None => (187u8, 0u8, 0u8, 6u8, true),
            Some(h) => {
                let (opcode, shape) = h.op.desc();
                let (a, b) = shape_muxes(shape, h.a, h.b, &mut ports, at)?;
                let (waddr, magic) = h.dst.waddr();
                (opcode, a, b, waddr, magic)
            }
        };

        // Mul pipe.
        let (op_mul, mul_a, mul_b, waddr_m, magic_m) = match &self.mul {
            None => (15u8, 0u8, MUL15_NOP, 6u8, true),
            Some(h) => {
                let (waddr, magic) = h.dst.waddr();
                match h.op {
                    MulOp::Nop => (15, 0, MUL15_NOP, waddr, magic),
                    MulOp::Rotate => {
                        // Source in mul_a; amount in raddr_b or from r5,
                        // selected by the mul_b sub-opcode.
                        let a = ports.alloc(h.a.expect("rotate has a source"), at)?;
                        let sel = match self.sig.rot {
                            Some(RotateSource::R5) => MUL15_ROT_R5,
                            Some(RotateSource::Amount(n)) => {
                                if !(-15..=15).contains(&n) {
                                    return Err(AssemblyError::RotateOutOfRange {
                                        amount: n as i32,
                                        at,
                                    });
                                }
                                if ports.raddr_b.is_some() {
                                    return Err(AssemblyError::ImmediateConflict { at });
                                }
                                ports.raddr_b = Some(RaddrB::Imm((n as u8) & 0x1f));
                                MUL15_ROT_IMM
                            }
                            None => return Err(AssemblyError::SignalCombination { at }),
                        };
                        (15, a, sel, waddr, magic)
                    }
                    MulOp::Mov => {
                        let a = ports.alloc(h.a.expect("mov has a source"), at)?;
                        (15, a, MUL15_MOV, waddr, magic)
                    }
                    _ => {
                        let (opcode, shape) = h.op.desc();
                        let (a, b) = shape_muxes(shape, h.a, h.b, &mut ports, at)?;
                        (opcode, a, b, waddr, magic)
                    }
                }
            }
        };

        // Rotate uses raddr_b for its amount, so only flag it as a small
        // immediate when an actual immediate operand claimed the port.
        let smimm = self.sig.rot.is_none() && matches!(ports.raddr_b, Some(RaddrB::Imm(_)));
        let sig_code = self
            .sig
            .code(smimm)
            .ok_or(AssemblyError::SignalCombination { at })?;

        let cond_field = match self.sig.dest() {
            Some(dest) => {
                if !self.cond.is_none() {
                    return Err(AssemblyError::SignalWithCondition { at });
                }
                let (waddr, magic) = dest.waddr();
                waddr | if magic { COND_SIG_MAGIC } else { 0 }
            }
            None => self.cond.pack(at)?,
        };

        let (raddr_a, raddr_b) = (
            ports.raddr_a.unwrap_or(0),
            match ports.raddr_b {
                Some(RaddrB::Reg(n)) | Some(RaddrB::Imm(n)) => n,
                None => 0,
            },
        );

        word |= (op_mul as u64) << OP_MUL_SHIFT;
        word |= (sig_code as u64) << SIG_SHIFT;
        word |= (cond_field as u64) << COND_SHIFT;
        if magic_m {
            word |= MM_BIT;
        }
        if magic_a {
            word |= MA_BIT;
        }
        word |= (waddr_m as u64) << WADDR_M_SHIFT;
        word |= (waddr_a as u64) << WADDR_A_SHIFT;
        word |= (op_add as u64) << OP_ADD_SHIFT;
        word |= (mul_b as u64) << MUL_B_SHIFT;
        word |= (mul_a as u64) << MUL_A_SHIFT;
        word |= (add_b as u64) << ADD_B_SHIFT;
        word |= (add_a as u64) << ADD_A_SHIFT;
        word |= (raddr_a as u64) << RADDR_A_SHIFT;
        word |= (raddr_b as u64) << RADDR_B_SHIFT;
        Ok(word)
    }
}

fn shape_muxes(
    shape: Shape,
    a: Option<Src>,
    b: Option<Src>,
    ports: &mut Ports,
    at: Loc,
) -> Result<(u8, u8), AssemblyError> {
    match shape {
        Shape::Binary => {
            let am = ports.alloc(a.expect("binary op has two sources"), at)?;
            let bm = ports.alloc(b.expect("binary op has two sources"), at)?;
            Ok((am, bm))
        }
        Shape::Unary(sub) => {
            let am = ports.alloc(a.expect("unary op has one source"), at)?;
            Ok((am, sub))
        }
        Shape::Nullary(sub) => Ok((0, sub)),
    }
}

// Field accessors shared with the decoder.
pub(crate) mod fields {
    pub fn op_mul(w: u64) -> u8 {
        ((w >> super::OP_MUL_SHIFT) & 0x3f) as u8
    }
    pub fn sig(w: u64) -> u8 {
        ((w >> super::SIG_SHIFT) & 0x1f) as u8
    }
    pub fn cond(w: u64) -> u8 {
        ((w >> super::COND_SHIFT) & 0x7f) as u8
    }
    pub fn magic_m(w: u64) -> bool {
        w & super::MM_BIT != 0
    }
    pub fn magic_a(w: u64) -> bool {
        w & super::MA_BIT != 0
    }
    pub fn waddr_m(w: u64) -> u8 {
        ((w >> super::WADDR_M_SHIFT) & 0x3f) as u8
    }
    pub fn waddr_a(w: u64) -> u8 {
        ((w >> super::WADDR_A_SHIFT) & 0x3f) as u8
    }
    pub fn op_add(w: u64) -> u8 {
        ((w >> super::OP_ADD_SHIFT) & 0xff) as u8
    }
    pub fn mul_b(w: u64) -> u8 {
        ((w >> super::MUL_B_SHIFT) & 0x7) as u8
    }
    pub fn mul_a(w: u64) -> u8 {
        ((w >> super::MUL_A_SHIFT) & 0x7) as u8
    }
    pub fn add_b(w: u64) -> u8 {
        ((w >> super::ADD_B_SHIFT) & 0x7) as u8
    }
    pub fn add_a(w: u64) -> u8 {
        ((w >> super::ADD_A_SHIFT) & 0x7) as u8
    }
    pub fn raddr_a(w: u64) -> u8 {
        ((w >> super::RADDR_A_SHIFT) & 0x3f) as u8
    }
    pub fn raddr_b(w: u64) -> u8 {
        ((w >> super::RADDR_B_SHIFT) & 0x3f) as u8
    }

    pub fn is_branch(w: u64) -> bool {
        op_mul(w) == 0 && (w >> 56) & 0x3 == 0x2
    }
    pub fn br_cond(w: u64) -> u8 {
        ((w >> super::BR_COND_SHIFT) & 0x7) as u8
    }
    pub fn br_offset(w: u64) -> i32 {
        let low = ((w >> super::BR_ADDR_LOW_SHIFT) & 0x1f_ffff) as u32;
        let high = ((w >> super::BR_ADDR_HIGH_SHIFT) & 0xff) as u32;
        ((high << 24) | (low << 3)) as i32
    }
    pub const SIG_MAGIC: u8 = super::COND_SIG_MAGIC;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::registers::{rf, R0, R1, R5, TMUD};

    fn loc() -> Loc {
        Loc::caller()
    }

    fn alu(add: Option<AddHalf>, mul: Option<MulHalf>) -> AluInstr {
        AluInstr {
            add,
            mul,
            sig: Sig::default(),
            cond: CondSpec::default(),
            loc: loc(),
        }
    }

    #[test]
    fn test_nop_word_has_both_pipes_idle() {
        let word = alu(None, None).encode().unwrap();
        assert_eq!(fields::op_mul(word), 15);
        assert_eq!(fields::mul_b(word), MUL15_NOP);
        assert_eq!(fields::op_add(word), 187);
        assert_eq!(fields::waddr_a(word), 6);
        assert!(fields::magic_a(word));
        assert!(!fields::is_branch(word));
    }

    #[test]
    fn test_regfile_port_allocation() {
        // Two distinct rf reads use raddr_a then raddr_b.
        let half = AddHalf {
            op: AddOp::Add,
            dst: R0,
            a: Some(rf(3).into()),
            b: Some(rf(9).into()),
        };
        let word = alu(Some(half), None).encode().unwrap();
        assert_eq!(fields::raddr_a(word), 3);
        assert_eq!(fields::raddr_b(word), 9);
        assert_eq!(fields::add_a(word), 6);
        assert_eq!(fields::add_b(word), 7);
    }

    #[test]
    fn test_regfile_ports_exhausted() {
        let add = AddHalf {
            op: AddOp::Add,
            dst: R0,
            a: Some(rf(1).into()),
            b: Some(rf(2).into()),
        };
        let mul = MulHalf {
            op: MulOp::Umul24,
            dst: R1,
            a: Some(rf(3).into()),
            b: Some(rf(4).into()),
        };
        let err = alu(Some(add), Some(mul)).encode().unwrap_err();
        assert!(matches!(err, AssemblyError::RegFilePortsExhausted { .. }));
    }

    #[test]
    fn test_small_imm_sets_signal() {
        let half = AddHalf {
            op: AddOp::Sub,
            dst: R0,
            a: Some(R0.into()),
            b: Some((-16).into()),
        };
        let word = alu(Some(half), None).encode().unwrap();
        assert_eq!(fields::sig(word), 15);
        assert_eq!(fields::raddr_b(word), 16); // -16 encodes as 16
        assert_eq!(fields::add_b(word), 7);
    }

    #[test]
    fn test_port_read_rejected() {
        let half = AddHalf {
            op: AddOp::Add,
            dst: R0,
            a: Some(TMUD.into()),
            b: Some(R0.into()),
        };
        let err = alu(Some(half), None).encode().unwrap_err();
        assert!(matches!(err, AssemblyError::NotReadable { .. }));
    }

    #[test]
    fn test_sig_dest_occupies_cond_field() {
        let mut instr = alu(None, None);
        instr.sig.ldtmu = Some(rf(7));
        let word = instr.encode().unwrap();
        assert_eq!(fields::sig(word), 4);
        assert_eq!(fields::cond(word), 7); // rf7, magic clear

        let mut instr = alu(None, None);
        instr.sig.ldtmu = Some(R0);
        let word = instr.encode().unwrap();
        assert_eq!(fields::cond(word), fields::SIG_MAGIC);
    }

    #[test]
    fn test_sig_dest_conflicts_with_cond() {
        let mut instr = alu(None, None);
        instr.sig.ldunifrf = Some(rf(0));
        instr.cond.add_flags = Some(Flags::PushZ);
        let err = instr.encode().unwrap_err();
        assert!(matches!(err, AssemblyError::SignalWithCondition { .. }));
    }

    #[test]
    fn test_cond_pack_unpack() {
        let specs = [
            CondSpec::default(),
            CondSpec {
                add_flags: Some(Flags::PushZ),
                ..Default::default()
            },
            CondSpec {
                mul_flags: Some(Flags::NorC),
                ..Default::default()
            },
            CondSpec {
                add_cond: Some(Cond::IfNa),
                ..Default::default()
            },
            CondSpec {
                add_cond: Some(Cond::IfA),
                mul_flags: Some(Flags::PushN),
                ..Default::default()
            },
            CondSpec {
                mul_cond: Some(Cond::IfB),
                add_flags: Some(Flags::PushC),
                ..Default::default()
            },
            CondSpec {
                add_cond: Some(Cond::IfNb),
                mul_cond: Some(Cond::IfNa),
                ..Default::default()
            },
        ];
        for spec in specs {
            let field = spec.pack(loc()).unwrap();
            assert_eq!(CondSpec::unpack(field), Some(spec), "field {:#09b}", field);
        }
    }

    #[test]
    fn test_cond_both_flag_writers_rejected() {
        let spec = CondSpec {
            add_flags: Some(Flags::PushZ),
            mul_flags: Some(Flags::PushN),
            ..Default::default()
        };
        assert!(spec.pack(loc()).is_err());
    }

    #[test]
    fn test_branch_word_marker_and_offset() {
        for offset in [-32i32, 0, 8, 4096, -65536] {
            let b = BranchInstr {
                cond: BranchCond::AnyNa,
                target: BranchTarget::Offset(offset),
                loc: loc(),
            };
            let word = b.encode().unwrap();
            assert!(fields::is_branch(word), "offset {}", offset);
            assert_eq!(fields::br_offset(word), offset);
            assert_eq!(fields::br_cond(word), 5);
        }
    }

    #[test]
    fn test_branch_unresolved_rejected() {
        let b = BranchInstr {
            cond: BranchCond::Always,
            target: BranchTarget::Label("loop".into()),
            loc: loc(),
        };
        assert!(matches!(
            b.encode(),
            Err(AssemblyError::UnresolvedBranch { .. })
        ));
    }

    #[test]
    fn test_rotate_amount_encoding() {
        let mut instr = alu(
            None,
            Some(MulHalf {
                op: MulOp::Rotate,
                dst: R5,
                a: Some(R1.into()),
                b: None,
            }),
        );
        instr.sig.rot = Some(RotateSource::Amount(-3));
        let word = instr.encode().unwrap();
        assert_eq!(fields::sig(word), 23);
        assert_eq!(fields::mul_b(word), MUL15_ROT_IMM);
        assert_eq!(fields::raddr_b(word), 0x1d); // -3 & 0x1f
    }
}
