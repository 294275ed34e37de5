//! Builder-style two-pass assembler.
//!
//! Pass 1 runs the user's assembly function once: every operation call
//! appends one [`Instruction`] to the program, label declarations record
//! the current offset, and branches record a symbolic reference. Pass 2
//! ([`Assembler::finish`]) checks delay-slot discipline, resolves branch
//! references against the label table (built in pass 1, never mutated
//! afterwards) and packs every instruction into its machine word.
//!
//! Operation methods return a [`Slot`] for the instruction just appended;
//! chaining on the slot fills the same issue slot's multiply pipe, signal
//! and condition fields:
//!
//! ```
//! use v3d_qpu::asm::{assemble, rf, R1, TMUD};
//!
//! let program = assemble(|asm| {
//!     asm.sub(R1, R1, 1).pushz().mov(TMUD, rf(0));
//!     asm.end_program();
//! })
//! .unwrap();
//! assert_eq!(program.len(), 9);
//! ```
//!
//! Construction errors (unreadable operand, pipe collision, unencodable
//! signal set) are recorded with the source position of the offending
//! call and returned from `finish`; the first error wins and nothing is
//! silently dropped.

use std::collections::HashMap;

use log::debug;

use super::disasm::disassemble;
use super::instruction::{
    AddHalf, AddOp, AluInstr, BranchCond, BranchInstr, BranchTarget, Cond, CondSpec, Flags,
    Instruction, Loc, MulHalf, MulOp, RotateSource, Sig, BRANCH_DELAY_SLOTS,
};
use super::registers::{Reg, Src, NULL};
use super::AssemblyError;

/// A fully assembled program: the instruction sequence and its packed
/// machine words, one to one, in order. Immutable once built.
#[derive(Debug, Clone)]
pub struct Program {
    instructions: Vec<Instruction>,
    words: Vec<u64>,
}

impl Program {
    /// Packed machine words, ready to hand to the execution driver.
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// The instruction records the words were packed from.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Disassembly listing with byte offsets, for debugging.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for (i, &word) in self.words.iter().enumerate() {
            let text = disassemble(word).unwrap_or_else(|e| format!("<{}>", e));
            out.push_str(&format!("{:04x}: {}\n", i * 8, text));
        }
        out
    }
}

/// Run an assembly function and produce the packed program.
pub fn assemble(f: impl FnOnce(&mut Assembler)) -> Result<Program, AssemblyError> {
    let mut asm = Assembler::new();
    f(&mut asm);
    asm.finish()
}

/// Program under construction. See the module docs for the builder
/// conventions.
pub struct Assembler {
    instrs: Vec<Instruction>,
    labels: HashMap<String, usize>,
    err: Option<AssemblyError>,
    next_loop: usize,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Which part of the current issue slot the last call touched; condition
/// modifiers bind to it.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Half {
    Add,
    Mul,
    Branch,
}

/// Chaining handle for the most recently appended instruction.
pub struct Slot<'a> {
    asm: &'a mut Assembler,
    idx: usize,
    half: Half,
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler {
            instrs: Vec::new(),
            labels: HashMap::new(),
            err: None,
            next_loop: 0,
        }
    }

    /// Number of instructions appended so far (the offset the next
    /// instruction or label will get).
    pub fn offset(&self) -> usize {
        self.instrs.len()
    }

    fn fail(&mut self, err: AssemblyError) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    fn push_alu(&mut self, add: Option<AddHalf>, mul: Option<MulHalf>, loc: Loc) -> Slot<'_> {
        let half = if mul.is_some() { Half::Mul } else { Half::Add };
        self.instrs.push(Instruction::Alu(AluInstr {
            add,
            mul,
            sig: Sig::default(),
            cond: CondSpec::default(),
            loc,
        }));
        Slot {
            idx: self.instrs.len() - 1,
            half,
            asm: self,
        }
    }

    fn push_add_op(&mut self, op: AddOp, dst: Reg, a: Option<Src>, b: Option<Src>, loc: Loc) -> Slot<'_> {
        self.push_alu(Some(AddHalf { op, dst, a, b }), None, loc)
    }

    fn push_mul_op(&mut self, op: MulOp, dst: Reg, a: Option<Src>, b: Option<Src>, loc: Loc) -> Slot<'_> {
        self.push_alu(None, Some(MulHalf { op, dst, a, b }), loc)
    }

    // --- add-pipe operations -------------------------------------------

    /// Empty issue slot. The usual carrier for signals and delay slots.
    #[track_caller]
    pub fn nop(&mut self) -> Slot<'_> {
        self.push_alu(None, None, Loc::caller())
    }

    /// Move through the add pipe (encoded as `bor dst, src, src`).
    #[track_caller]
    pub fn mov(&mut self, dst: Reg, src: impl Into<Src>) -> Slot<'_> {
        let s = src.into();
        self.push_add_op(AddOp::Bor, dst, Some(s), Some(s), Loc::caller())
    }

    #[track_caller]
    pub fn add(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Add, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn sub(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Sub, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn fadd(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Fadd, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn fsub(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Fsub, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn fmin(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Fmin, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn fmax(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Fmax, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn min(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Min, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn max(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Max, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn umin(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Umin, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn umax(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Umax, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn shl(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Shl, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn shr(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Shr, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn asr(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Asr, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn ror(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Ror, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn band(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Band, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn bor(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Bor, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn bxor(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Bxor, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn bnot(&mut self, dst: Reg, a: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Bnot, dst, Some(a.into()), None, Loc::caller())
    }

    #[track_caller]
    pub fn neg(&mut self, dst: Reg, a: impl Into<Src>) -> Slot<'_> {
        self.push_add_op(AddOp::Neg, dst, Some(a.into()), None, Loc::caller())
    }

    /// Thread index of this hardware thread, 0..threads.
    #[track_caller]
    pub fn tidx(&mut self, dst: Reg) -> Slot<'_> {
        self.push_add_op(AddOp::Tidx, dst, None, None, Loc::caller())
    }

    /// Element (lane) index, 0..16.
    #[track_caller]
    pub fn eidx(&mut self, dst: Reg) -> Slot<'_> {
        self.push_add_op(AddOp::Eidx, dst, None, None, Loc::caller())
    }

    #[track_caller]
    pub fn sampid(&mut self, dst: Reg) -> Slot<'_> {
        self.push_add_op(AddOp::Sampid, dst, None, None, Loc::caller())
    }

    #[track_caller]
    pub fn barrierid(&mut self, dst: Reg) -> Slot<'_> {
        self.push_add_op(AddOp::Barrierid, dst, None, None, Loc::caller())
    }

    /// Stall until every outstanding TMU write is acknowledged. A program
    /// must issue this before its final thread switch or results may not
    /// be visible to the host.
    #[track_caller]
    pub fn tmuwt(&mut self) -> Slot<'_> {
        self.push_add_op(AddOp::Tmuwt, NULL, None, None, Loc::caller())
    }

    // --- mul-pipe primaries --------------------------------------------

    #[track_caller]
    pub fn fmul(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_mul_op(MulOp::Fmul, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn umul24(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_mul_op(MulOp::Umul24, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn smul24(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_mul_op(MulOp::Smul24, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    /// Packed half-float multiply.
    #[track_caller]
    pub fn vfmul(&mut self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Slot<'_> {
        self.push_mul_op(MulOp::Vfmul, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    /// Rotate the 16-lane vector `src` by a constant amount, delivering
    /// through the broadcast path (write `r5rep` to broadcast lane 0).
    #[track_caller]
    pub fn rotate(&mut self, dst: Reg, src: impl Into<Src>, amount: i32) -> Slot<'_> {
        let loc = Loc::caller();
        if !(-15..=15).contains(&amount) {
            self.fail(AssemblyError::RotateOutOfRange { amount, at: loc });
        }
        let mut slot = self.push_mul_op(MulOp::Rotate, dst, Some(src.into()), None, loc);
        slot.set_rot(RotateSource::Amount(amount as i8), loc);
        slot
    }

    /// Rotate by the per-instruction amount in r5.
    #[track_caller]
    pub fn rotate_by_r5(&mut self, dst: Reg, src: impl Into<Src>) -> Slot<'_> {
        let loc = Loc::caller();
        let mut slot = self.push_mul_op(MulOp::Rotate, dst, Some(src.into()), None, loc);
        slot.set_rot(RotateSource::R5, loc);
        slot
    }

    // --- control flow --------------------------------------------------

    /// Declare a label at the current offset. Branches may reference it
    /// before or after this point.
    #[track_caller]
    pub fn label(&mut self, name: impl Into<String>) {
        let name = name.into();
        let at = Loc::caller();
        debug!("label `{}` at instruction {}", name, self.instrs.len());
        if self.labels.insert(name.clone(), self.instrs.len()).is_some() {
            self.fail(AssemblyError::DuplicateLabel { name, at });
        }
    }

    /// Branch to a label. Unconditional unless a predicate is chained;
    /// the following [`BRANCH_DELAY_SLOTS`] instructions always execute.
    #[track_caller]
    pub fn b(&mut self, label: impl Into<String>) -> Slot<'_> {
        self.instrs.push(Instruction::Branch(BranchInstr {
            cond: BranchCond::Always,
            target: BranchTarget::Label(label.into()),
            loc: Loc::caller(),
        }));
        Slot {
            idx: self.instrs.len() - 1,
            half: Half::Branch,
            asm: self,
        }
    }

    /// Declare a loop entry point. Pure label sugar: the returned handle
    /// remembers the label so the branch back to it reads naturally.
    #[track_caller]
    pub fn begin_loop(&mut self) -> Loop {
        let name = format!("_loop{}", self.next_loop);
        self.next_loop += 1;
        self.label(name.clone());
        Loop { label: name }
    }

    /// Emit the canonical program-end sequence: the double thread-switch
    /// that retires the thread, with its delay slots.
    #[track_caller]
    pub fn end_program(&mut self) {
        self.nop().thrsw();
        self.nop().thrsw();
        self.nop();
        self.nop();
        self.nop().thrsw();
        self.nop();
        self.nop();
        self.nop();
    }

    // --- pass 2 --------------------------------------------------------

    /// Resolve labels, lint delay slots and encode. Consumes the builder;
    /// a program is assembled exactly once.
    pub fn finish(self) -> Result<Program, AssemblyError> {
        let Assembler {
            mut instrs,
            labels,
            err,
            ..
        } = self;

        if let Some(err) = err {
            return Err(err);
        }

        // Structural delay-slot check: the hardware executes the three
        // instructions after a branch (or a thread switch) before the
        // transfer takes effect, so they must exist, and a branch's slots
        // must not branch themselves.
        for i in 0..instrs.len() {
            let delayed = match &instrs[i] {
                Instruction::Branch(_) => true,
                Instruction::Alu(a) => a.sig.thrsw,
            };
            if !delayed {
                continue;
            }
            let have = instrs.len() - i - 1;
            if have < BRANCH_DELAY_SLOTS {
                return Err(AssemblyError::MissingDelaySlots {
                    index: i,
                    need: BRANCH_DELAY_SLOTS,
                    have,
                });
            }
            if instrs[i].is_branch() {
                for slot in i + 1..=i + BRANCH_DELAY_SLOTS {
                    if instrs[slot].is_branch() {
                        return Err(AssemblyError::BranchInDelaySlot { index: i, slot });
                    }
                }
            }
        }

        // Resolve branch references. The branch offset is relative to the
        // end of its delay slots (branch index + 4 instructions).
        for i in 0..instrs.len() {
            if let Instruction::Branch(b) = &mut instrs[i] {
                if let BranchTarget::Label(name) = &b.target {
                    let target = *labels.get(name).ok_or_else(|| {
                        AssemblyError::UndefinedLabel {
                            name: name.clone(),
                            at: b.loc,
                        }
                    })?;
                    let offset = 8 * (target as i64 - (i as i64 + 1 + BRANCH_DELAY_SLOTS as i64));
                    b.target = BranchTarget::Offset(offset as i32);
                }
            }
        }

        let mut words = Vec::with_capacity(instrs.len());
        for instr in &instrs {
            words.push(instr.encode()?);
        }
        debug!("assembled {} instructions", words.len());

        Ok(Program {
            instructions: instrs,
            words,
        })
    }
}

/// Loop handle returned by [`Assembler::begin_loop`]. Holds only the
/// entry label; carries no runtime state.
pub struct Loop {
    label: String,
}

impl Loop {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Branch back to the loop entry.
    #[track_caller]
    pub fn branch_back<'a>(&self, asm: &'a mut Assembler) -> Slot<'a> {
        asm.b(self.label.clone())
    }
}

impl<'a> Slot<'a> {
    fn fail(&mut self, err: AssemblyError) {
        self.asm.fail(err);
    }

    fn with_alu(&mut self, at: Loc, f: impl FnOnce(&mut AluInstr) -> Result<(), AssemblyError>) {
        match &mut self.asm.instrs[self.idx] {
            Instruction::Alu(alu) => {
                if let Err(e) = f(alu) {
                    self.asm.fail(e);
                }
            }
            Instruction::Branch(_) => self.fail(AssemblyError::DanglingModifier { at }),
        }
    }

    fn chain_mul(mut self, op: MulOp, dst: Reg, a: Option<Src>, b: Option<Src>, at: Loc) -> Self {
        self.with_alu(at, |alu| {
            if alu.mul.is_some() {
                return Err(AssemblyError::PipeBusy { pipe: "mul", at });
            }
            alu.mul = Some(MulHalf { op, dst, a, b });
            Ok(())
        });
        self.half = Half::Mul;
        self
    }

    // --- mul-pipe chains -----------------------------------------------

    /// Move through the mul pipe.
    #[track_caller]
    pub fn mov(self, dst: Reg, src: impl Into<Src>) -> Self {
        self.chain_mul(MulOp::Mov, dst, Some(src.into()), None, Loc::caller())
    }

    #[track_caller]
    pub fn add(self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Self {
        self.chain_mul(MulOp::Add, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn sub(self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Self {
        self.chain_mul(MulOp::Sub, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn fmul(self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Self {
        self.chain_mul(MulOp::Fmul, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn umul24(self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Self {
        self.chain_mul(MulOp::Umul24, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn smul24(self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Self {
        self.chain_mul(MulOp::Smul24, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    #[track_caller]
    pub fn vfmul(self, dst: Reg, a: impl Into<Src>, b: impl Into<Src>) -> Self {
        self.chain_mul(MulOp::Vfmul, dst, Some(a.into()), Some(b.into()), Loc::caller())
    }

    /// Rotate chained onto this slot's mul pipe.
    #[track_caller]
    pub fn rotate(self, dst: Reg, src: impl Into<Src>, amount: i32) -> Self {
        let at = Loc::caller();
        let mut slot = self.chain_mul(MulOp::Rotate, dst, Some(src.into()), None, at);
        if !(-15..=15).contains(&amount) {
            slot.fail(AssemblyError::RotateOutOfRange { amount, at });
        }
        slot.set_rot(RotateSource::Amount(amount as i8), at);
        slot
    }

    fn set_rot(&mut self, rot: RotateSource, at: Loc) {
        self.with_alu(at, |alu| {
            if alu.sig.rot.is_some() {
                return Err(AssemblyError::SignalCombination { at });
            }
            alu.sig.rot = Some(rot);
            Ok(())
        });
    }

    // --- signals -------------------------------------------------------

    /// Thread switch. Takes effect after three further instructions.
    #[track_caller]
    pub fn thrsw(mut self) -> Self {
        let at = Loc::caller();
        self.with_alu(at, |alu| {
            if alu.sig.thrsw {
                return Err(AssemblyError::SignalCombination { at });
            }
            alu.sig.thrsw = true;
            Ok(())
        });
        self
    }

    /// Load the next uniform into r5.
    #[track_caller]
    pub fn ldunif(mut self) -> Self {
        let at = Loc::caller();
        self.with_alu(at, |alu| {
            if alu.sig.ldunif {
                return Err(AssemblyError::SignalCombination { at });
            }
            alu.sig.ldunif = true;
            Ok(())
        });
        self
    }

    /// Load the next uniform into a register-file slot.
    #[track_caller]
    pub fn ldunifrf(mut self, dst: Reg) -> Self {
        let at = Loc::caller();
        self.with_alu(at, |alu| {
            if alu.sig.ldunifrf.is_some() {
                return Err(AssemblyError::SignalCombination { at });
            }
            alu.sig.ldunifrf = Some(dst);
            Ok(())
        });
        self
    }

    /// Collect the oldest outstanding TMU result into `dst`. Valid no
    /// earlier than [`super::TMU_RESULT_LATENCY`] instructions after the
    /// transaction was issued.
    #[track_caller]
    pub fn ldtmu(mut self, dst: Reg) -> Self {
        let at = Loc::caller();
        self.with_alu(at, |alu| {
            if alu.sig.ldtmu.is_some() {
                return Err(AssemblyError::SignalCombination { at });
            }
            alu.sig.ldtmu = Some(dst);
            Ok(())
        });
        self
    }

    // --- conditions and flags ------------------------------------------

    /// Attach a flag update to the half this slot last touched.
    #[track_caller]
    pub fn push(mut self, flags: Flags) -> Self {
        let at = Loc::caller();
        let half = self.half;
        self.with_alu(at, |alu| {
            let target = match half {
                Half::Add => &mut alu.cond.add_flags,
                Half::Mul => &mut alu.cond.mul_flags,
                Half::Branch => unreachable!("with_alu rejects branches"),
            };
            if target.is_some() {
                return Err(AssemblyError::UnencodableCondition { at });
            }
            *target = Some(flags);
            Ok(())
        });
        self
    }

    /// Push the zero flag.
    #[track_caller]
    pub fn pushz(self) -> Self {
        self.push(Flags::PushZ)
    }

    /// Push the negative flag.
    #[track_caller]
    pub fn pushn(self) -> Self {
        self.push(Flags::PushN)
    }

    /// Push the carry flag.
    #[track_caller]
    pub fn pushc(self) -> Self {
        self.push(Flags::PushC)
    }

    /// Attach a conditional-execution predicate to the half this slot
    /// last touched.
    #[track_caller]
    pub fn cond(mut self, cond: Cond) -> Self {
        let at = Loc::caller();
        let half = self.half;
        self.with_alu(at, |alu| {
            let target = match half {
                Half::Add => &mut alu.cond.add_cond,
                Half::Mul => &mut alu.cond.mul_cond,
                Half::Branch => unreachable!("with_alu rejects branches"),
            };
            if target.is_some() {
                return Err(AssemblyError::UnencodableCondition { at });
            }
            *target = Some(cond);
            Ok(())
        });
        self
    }

    #[track_caller]
    pub fn ifa(self) -> Self {
        self.cond(Cond::IfA)
    }

    #[track_caller]
    pub fn ifb(self) -> Self {
        self.cond(Cond::IfB)
    }

    #[track_caller]
    pub fn ifna(self) -> Self {
        self.cond(Cond::IfNa)
    }

    #[track_caller]
    pub fn ifnb(self) -> Self {
        self.cond(Cond::IfNb)
    }

    // --- branch predicates ---------------------------------------------

    #[track_caller]
    fn branch_cond(mut self, cond: BranchCond) -> Self {
        let at = Loc::caller();
        match &mut self.asm.instrs[self.idx] {
            Instruction::Branch(b) => b.cond = cond,
            Instruction::Alu(_) => self.fail(AssemblyError::DanglingModifier { at }),
        }
        self
    }

    /// Branch if any lane has its a-flag clear.
    #[track_caller]
    pub fn anyna(self) -> Self {
        self.branch_cond(BranchCond::AnyNa)
    }

    /// Branch if any lane has its a-flag set.
    #[track_caller]
    pub fn anya(self) -> Self {
        self.branch_cond(BranchCond::AnyA)
    }

    /// Branch if all lanes have their a-flag set.
    #[track_caller]
    pub fn alla(self) -> Self {
        self.branch_cond(BranchCond::AllA)
    }

    /// Branch if all lanes have their a-flag clear.
    #[track_caller]
    pub fn allna(self) -> Self {
        self.branch_cond(BranchCond::AllNa)
    }

    /// Branch on lane 0's a-flag.
    #[track_caller]
    pub fn a0(self) -> Self {
        self.branch_cond(BranchCond::A0)
    }

    /// Branch on lane 0's a-flag being clear.
    #[track_caller]
    pub fn na0(self) -> Self {
        self.branch_cond(BranchCond::Na0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::disasm::decode;
    use crate::asm::registers::{rf, R0, R1, R2, R5, TMUA, TMUD};

    /// The counter-loop kernel shared by several tests.
    fn counter(asm: &mut Assembler) {
        asm.nop().ldunif();
        let entry = asm.begin_loop();
        asm.sub(R5, R5, 1).pushn();
        entry.branch_back(asm).anyna();
        asm.nop();
        asm.nop();
        asm.nop();
        asm.end_program();
    }

    #[test]
    fn test_counter_assembles() {
        let program = assemble(counter).unwrap();
        assert_eq!(program.len(), 14);
        // The branch sits at instruction 2 and targets instruction 1:
        // 8 * (1 - (2 + 4)) = -40 bytes.
        match &program.instructions()[2] {
            Instruction::Branch(b) => {
                assert_eq!(b.target, BranchTarget::Offset(-40));
                assert_eq!(b.cond, BranchCond::AnyNa);
            }
            other => panic!("expected branch, got {:?}", other),
        }
    }

    #[test]
    fn test_assembly_is_idempotent() {
        let first = assemble(counter).unwrap();
        let second = assemble(counter).unwrap();
        assert_eq!(first.words(), second.words());
    }

    #[test]
    fn test_round_trip_whole_program() {
        let program = assemble(counter).unwrap();
        for (instr, &word) in program.instructions().iter().zip(program.words()) {
            let back = decode(word).unwrap();
            assert_eq!(back.normalized(), instr.normalized());
            assert_eq!(back.encode().unwrap(), word);
        }
    }

    #[test]
    fn test_forward_reference() {
        let program = assemble(|asm| {
            asm.b("out");
            asm.nop();
            asm.nop();
            asm.nop();
            asm.nop();
            asm.label("out");
            asm.end_program();
        })
        .unwrap();
        // Branch at 0, label at 5: 8 * (5 - 4) = 8.
        match &program.instructions()[0] {
            Instruction::Branch(b) => assert_eq!(b.target, BranchTarget::Offset(8)),
            other => panic!("expected branch, got {:?}", other),
        }
    }

    #[test]
    fn test_undefined_label() {
        let err = assemble(|asm| {
            asm.b("nowhere");
            asm.nop();
            asm.nop();
            asm.nop();
        })
        .unwrap_err();
        match err {
            AssemblyError::UndefinedLabel { name, .. } => assert_eq!(name, "nowhere"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_label() {
        let err = assemble(|asm| {
            asm.label("here");
            asm.nop();
            asm.label("here");
        })
        .unwrap_err();
        assert!(matches!(err, AssemblyError::DuplicateLabel { .. }));
    }

    #[test]
    fn test_missing_delay_slots() {
        let err = assemble(|asm| {
            asm.label("top");
            asm.nop();
            asm.b("top");
            asm.nop();
        })
        .unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::MissingDelaySlots {
                index: 1,
                need: 3,
                have: 1
            }
        ));
    }

    #[test]
    fn test_branch_in_delay_slot() {
        let err = assemble(|asm| {
            asm.label("top");
            asm.b("top");
            asm.nop();
            asm.b("top");
            asm.nop();
            asm.nop();
            asm.nop();
        })
        .unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::BranchInDelaySlot { index: 0, slot: 2 }
        ));
    }

    #[test]
    fn test_thread_switch_needs_trailing_slots() {
        let err = assemble(|asm| {
            asm.nop();
            asm.nop().thrsw();
        })
        .unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::MissingDelaySlots {
                index: 1,
                need: 3,
                have: 0
            }
        ));
    }

    #[test]
    fn test_mul_pipe_busy() {
        let err = assemble(|asm| {
            asm.fmul(R0, R1, R1).mov(R0, R1);
            asm.end_program();
        })
        .unwrap_err();
        assert!(matches!(err, AssemblyError::PipeBusy { pipe: "mul", .. }));
    }

    #[test]
    fn test_two_pipe_issue() {
        let program = assemble(|asm| {
            asm.sub(R1, R1, 1).pushz().mov(TMUD, rf(0));
            asm.end_program();
        })
        .unwrap();
        let word = program.words()[0];
        let text = crate::asm::disasm::disassemble(word).unwrap();
        assert_eq!(text, "sub.pushz r1, r1, 1; mov tmud, rf0");
    }

    #[test]
    fn test_modifier_on_branch_rejected() {
        let err = assemble(|asm| {
            asm.label("top");
            asm.b("top").pushz();
            asm.nop();
            asm.nop();
            asm.nop();
        })
        .unwrap_err();
        assert!(matches!(err, AssemblyError::DanglingModifier { .. }));
    }

    #[test]
    fn test_tmu_write_loop_shape() {
        // The write-pattern kernel from the hardware tests, checked here
        // for encodability and branch placement only.
        let program = assemble(|asm| {
            asm.nop().ldunif();
            asm.bor(R1, R5, R5).ldunif();
            asm.eidx(R0).mov(R2, R5);
            asm.shl(R0, R0, 2).mov(rf(0), R0);
            asm.add(R2, R2, R0);
            let entry = asm.begin_loop();
            asm.sub(R1, R1, 1).pushz().mov(TMUD, rf(0));
            entry.branch_back(asm).anyna();
            asm.sub(rf(0), rf(0), -16).mov(TMUA, R2);
            asm.shl(R0, 4, 4);
            asm.tmuwt().add(R2, R2, R0);
            asm.end_program();
        })
        .unwrap();
        assert_eq!(program.len(), 18);
        assert!(program.listing().contains("b.anyna -40"));
    }
}
