//! Machine-word decoder and text disassembler.
//!
//! The decoder recovers the full instruction model from any word the
//! encoder produces; the assembler's round-trip tests lean on this to pin
//! the wire format. It is a decoder for words this toolchain emits, not a
//! general disassembler for arbitrary compiler output: encodings outside
//! the supported subset decode to an error rather than to a guess.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use super::instruction::{
    fields, AddHalf, AddOp, AluInstr, BranchCond, BranchInstr, BranchTarget, CondSpec,
    Instruction, Loc, MulHalf, MulOp, RotateSource, Shape, Sig, SigDest,
};
use super::registers::{Imm, Port, Reg, Src};

/// Source position attached to decoded instructions.
pub const DECODED: Loc = Loc::UNKNOWN;

/// Instruction decode error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown signal encoding {0}")]
    UnknownSignal(u8),

    #[error("unknown condition field {0:#04x}")]
    UnknownCondition(u8),

    #[error("unknown add opcode {opcode} (sub-op {sub})")]
    UnknownAddOp { opcode: u8, sub: u8 },

    #[error("unknown mul opcode {opcode} (sub-op {sub})")]
    UnknownMulOp { opcode: u8, sub: u8 },

    #[error("unknown branch condition {0}")]
    UnknownBranchCond(u8),

    #[error("write address {waddr} (magic={magic}) does not name a register")]
    BadWaddr { waddr: u8, magic: bool },

    #[error("raddr_b value {0} is not a small immediate")]
    BadImmediate(u8),

    #[error("register file index {0} out of range")]
    BadRegFileIndex(u8),

    #[error("byte stream ends mid-word ({trailing} trailing bytes)")]
    TruncatedWord { trailing: usize },
}

fn dst_reg(waddr: u8, magic: bool) -> Result<Reg, DecodeError> {
    Reg::from_waddr(waddr, magic).ok_or(DecodeError::BadWaddr { waddr, magic })
}

fn src_from_mux(mux: u8, raddr_a: u8, raddr_b: u8, smimm: bool) -> Result<Src, DecodeError> {
    match mux {
        0..=5 => Ok(Src::Reg(Reg::Acc(mux))),
        6 => {
            if raddr_a < 64 {
                Ok(Src::Reg(Reg::RegFile(raddr_a)))
            } else {
                Err(DecodeError::BadRegFileIndex(raddr_a))
            }
        }
        _ => {
            if smimm {
                Imm::from_code(raddr_b)
                    .map(Src::Imm)
                    .ok_or(DecodeError::BadImmediate(raddr_b))
            } else if raddr_b < 64 {
                Ok(Src::Reg(Reg::RegFile(raddr_b)))
            } else {
                Err(DecodeError::BadRegFileIndex(raddr_b))
            }
        }
    }
}

/// Decode one machine word back to the instruction model.
pub fn decode(word: u64) -> Result<Instruction, DecodeError> {
    if fields::is_branch(word) {
        let cond = BranchCond::from_code(fields::br_cond(word))
            .ok_or_else(|| DecodeError::UnknownBranchCond(fields::br_cond(word)))?;
        return Ok(Instruction::Branch(BranchInstr {
            cond,
            target: BranchTarget::Offset(fields::br_offset(word)),
            loc: DECODED,
        }));
    }

    let sig_code = fields::sig(word);
    let (mut sig, extras) =
        Sig::from_code(sig_code).ok_or(DecodeError::UnknownSignal(sig_code))?;

    let cond_field = fields::cond(word);
    let cond = match extras.writes_addr {
        SigDest::None => {
            CondSpec::unpack(cond_field).ok_or(DecodeError::UnknownCondition(cond_field))?
        }
        dest => {
            let magic = cond_field & fields::SIG_MAGIC != 0;
            let reg = dst_reg(cond_field & 0x3f, magic)?;
            match dest {
                SigDest::Ldtmu => sig.ldtmu = Some(reg),
                SigDest::Ldunifrf => sig.ldunifrf = Some(reg),
                SigDest::None => unreachable!(),
            }
            CondSpec::default()
        }
    };

    let raddr_a = fields::raddr_a(word);
    let raddr_b = fields::raddr_b(word);
    let src = |mux: u8| src_from_mux(mux, raddr_a, raddr_b, extras.smimm);

    // Add pipe.
    let op_add = fields::op_add(word);
    let add_b = fields::add_b(word);
    let op = AddOp::from_fields(op_add, add_b).ok_or(DecodeError::UnknownAddOp {
        opcode: op_add,
        sub: add_b,
    })?;
    let add_dst = dst_reg(fields::waddr_a(word), fields::magic_a(word))?;
    let add = if op == AddOp::Nop && add_dst == Reg::Port(Port::Null) {
        None
    } else {
        let (a, b) = match op.desc().1 {
            Shape::Binary => (Some(src(fields::add_a(word))?), Some(src(add_b)?)),
            Shape::Unary(_) => (Some(src(fields::add_a(word))?), None),
            Shape::Nullary(_) => (None, None),
        };
        Some(AddHalf {
            op,
            dst: add_dst,
            a,
            b,
        })
    };

    // Mul pipe.
    let op_mul = fields::op_mul(word);
    let mul_a = fields::mul_a(word);
    let mul_b = fields::mul_b(word);
    let mul_dst = dst_reg(fields::waddr_m(word), fields::magic_m(word))?;
    let mul = match op_mul {
        15 => {
            if sig.rot.is_some() {
                let amount = match mul_b {
                    5 => RotateSource::R5,
                    7 => {
                        // Sign-extend the 5-bit amount.
                        let n = (((raddr_b & 0x1f) << 3) as i8) >> 3;
                        RotateSource::Amount(n)
                    }
                    _ => {
                        return Err(DecodeError::UnknownMulOp {
                            opcode: op_mul,
                            sub: mul_b,
                        })
                    }
                };
                sig.rot = Some(amount);
                Some(MulHalf {
                    op: MulOp::Rotate,
                    dst: mul_dst,
                    a: Some(src_from_mux(mul_a, raddr_a, raddr_b, false)?),
                    b: None,
                })
            } else {
                match mul_b {
                    4 => {
                        if mul_dst == Reg::Port(Port::Null) {
                            None
                        } else {
                            Some(MulHalf {
                                op: MulOp::Nop,
                                dst: mul_dst,
                                a: None,
                                b: None,
                            })
                        }
                    }
                    0 => Some(MulHalf {
                        op: MulOp::Mov,
                        dst: mul_dst,
                        a: Some(src(mul_a)?),
                        b: None,
                    }),
                    _ => {
                        return Err(DecodeError::UnknownMulOp {
                            opcode: op_mul,
                            sub: mul_b,
                        })
                    }
                }
            }
        }
        1 | 2 | 3 | 4 | 9 | 16 => {
            let op = match op_mul {
                1 => MulOp::Add,
                2 => MulOp::Sub,
                3 => MulOp::Umul24,
                4 => MulOp::Vfmul,
                9 => MulOp::Smul24,
                _ => MulOp::Fmul,
            };
            Some(MulHalf {
                op,
                dst: mul_dst,
                a: Some(src(mul_a)?),
                b: Some(src(mul_b)?),
            })
        }
        _ => {
            return Err(DecodeError::UnknownMulOp {
                opcode: op_mul,
                sub: mul_b,
            })
        }
    };

    Ok(Instruction::Alu(AluInstr {
        add,
        mul,
        sig,
        cond,
        loc: DECODED,
    }))
}

/// Decode a little-endian byte image of a program (e.g. a code buffer
/// read back from GPU memory). Trailing bytes short of a full word are an
/// error.
pub fn decode_stream(bytes: &[u8]) -> Result<Vec<Instruction>, DecodeError> {
    if bytes.len() % 8 != 0 {
        return Err(DecodeError::TruncatedWord {
            trailing: bytes.len() % 8,
        });
    }
    let mut cursor = Cursor::new(bytes);
    let mut instrs = Vec::with_capacity(bytes.len() / 8);
    while (cursor.position() as usize) < bytes.len() {
        let word = cursor
            .read_u64::<LittleEndian>()
            .expect("length checked above");
        instrs.push(decode(word)?);
    }
    Ok(instrs)
}

/// Render one decoded instruction as text.
pub fn disassemble(word: u64) -> Result<String, DecodeError> {
    Ok(render(&decode(word)?))
}

fn render_srcs(out: &mut String, srcs: [Option<&Src>; 2]) {
    for src in srcs.into_iter().flatten() {
        out.push_str(", ");
        out.push_str(&src.to_string());
    }
}

fn render(instr: &Instruction) -> String {
    match instr {
        Instruction::Branch(b) => {
            let mut s = String::from("b");
            if b.cond != BranchCond::Always {
                s.push('.');
                s.push_str(b.cond.name());
            }
            match &b.target {
                BranchTarget::Offset(o) => s.push_str(&format!(" {}", o)),
                BranchTarget::Label(l) => s.push_str(&format!(" {}", l)),
            }
            s
        }
        Instruction::Alu(alu) => {
            let mut parts: Vec<String> = Vec::new();
            if let Some(h) = &alu.add {
                let mut s = String::new();
                // bor x, x is the canonical add-pipe move.
                if h.op == AddOp::Bor && h.a == h.b {
                    s.push_str("mov");
                    suffixes(&mut s, alu.cond.add_cond.map(|c| c.name()), alu.cond.add_flags.map(|f| f.name()));
                    s.push(' ');
                    s.push_str(&h.dst.to_string());
                    render_srcs(&mut s, [h.a.as_ref(), None]);
                } else {
                    s.push_str(h.op.name());
                    suffixes(&mut s, alu.cond.add_cond.map(|c| c.name()), alu.cond.add_flags.map(|f| f.name()));
                    s.push(' ');
                    s.push_str(&h.dst.to_string());
                    render_srcs(&mut s, [h.a.as_ref(), h.b.as_ref()]);
                }
                parts.push(s);
            }
            if let Some(h) = &alu.mul {
                let mut s = String::from(h.op.name());
                suffixes(&mut s, alu.cond.mul_cond.map(|c| c.name()), alu.cond.mul_flags.map(|f| f.name()));
                s.push(' ');
                s.push_str(&h.dst.to_string());
                render_srcs(&mut s, [h.a.as_ref(), h.b.as_ref()]);
                if h.op == MulOp::Rotate {
                    match alu.sig.rot {
                        Some(RotateSource::Amount(n)) => s.push_str(&format!(", {}", n)),
                        Some(RotateSource::R5) => s.push_str(", r5"),
                        None => {}
                    }
                }
                parts.push(s);
            }
            if parts.is_empty() {
                parts.push("nop".into());
            }
            let mut sigs: Vec<String> = Vec::new();
            if alu.sig.thrsw {
                sigs.push("thrsw".into());
            }
            if alu.sig.ldunif {
                sigs.push("ldunif".into());
            }
            if let Some(r) = alu.sig.ldunifrf {
                sigs.push(format!("ldunifrf({})", r));
            }
            if let Some(r) = alu.sig.ldtmu {
                sigs.push(format!("ldtmu({})", r));
            }
            if !sigs.is_empty() {
                parts.push(format!("sig {}", sigs.join(" ")));
            }
            parts.join("; ")
        }
    }
}

fn suffixes(s: &mut String, cond: Option<&'static str>, flags: Option<&'static str>) {
    if let Some(c) = cond {
        s.push('.');
        s.push_str(c);
    }
    if let Some(f) = flags {
        s.push('.');
        s.push_str(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::instruction::{CondSpec, Flags, Sig};
    use crate::asm::registers::{rf, R0, R1, R2, R5, TMUD};

    fn alu(add: Option<AddHalf>, mul: Option<MulHalf>) -> AluInstr {
        AluInstr {
            add,
            mul,
            sig: Sig::default(),
            cond: CondSpec::default(),
            loc: DECODED,
        }
    }

    fn round_trip(instr: Instruction) {
        let word = instr.encode().unwrap();
        let mut back = decode(word).unwrap();
        // Source positions do not survive the wire; pin them for equality.
        match &mut back {
            Instruction::Alu(a) => a.loc = DECODED,
            Instruction::Branch(b) => b.loc = DECODED,
        }
        assert_eq!(back, instr, "word {:#018x}", word);
        assert_eq!(back.encode().unwrap(), word);
    }

    #[test]
    fn test_round_trip_two_pipe() {
        round_trip(Instruction::Alu(AluInstr {
            add: Some(AddHalf {
                op: AddOp::Sub,
                dst: R1,
                a: Some(R1.into()),
                b: Some(1.into()),
            }),
            mul: Some(MulHalf {
                op: MulOp::Mov,
                dst: TMUD,
                a: Some(rf(0).into()),
                b: None,
            }),
            sig: Sig::default(),
            cond: CondSpec {
                add_flags: Some(Flags::PushZ),
                ..Default::default()
            },
            loc: DECODED,
        }));
    }

    #[test]
    fn test_round_trip_signals() {
        let mut i = alu(None, None);
        i.sig.thrsw = true;
        i.sig.ldunif = true;
        round_trip(Instruction::Alu(i));

        let mut i = alu(None, None);
        i.sig.ldtmu = Some(rf(14));
        round_trip(Instruction::Alu(i));

        let mut i = alu(None, None);
        i.sig.ldunifrf = Some(rf(33));
        round_trip(Instruction::Alu(i));
    }

    #[test]
    fn test_round_trip_rotate() {
        let mut i = alu(
            None,
            Some(MulHalf {
                op: MulOp::Rotate,
                dst: R5,
                a: Some(R0.into()),
                b: None,
            }),
        );
        i.sig.rot = Some(RotateSource::Amount(-7));
        round_trip(Instruction::Alu(i.clone()));

        i.sig.rot = Some(RotateSource::R5);
        round_trip(Instruction::Alu(i));
    }

    #[test]
    fn test_round_trip_branch() {
        round_trip(Instruction::Branch(BranchInstr {
            cond: BranchCond::AnyNa,
            target: BranchTarget::Offset(-64),
            loc: DECODED,
        }));
        round_trip(Instruction::Branch(BranchInstr {
            cond: BranchCond::Always,
            target: BranchTarget::Offset(1 << 20),
            loc: DECODED,
        }));
    }

    #[test]
    fn test_disassembly_text() {
        let i = Instruction::Alu(AluInstr {
            add: Some(AddHalf {
                op: AddOp::Sub,
                dst: R5,
                a: Some(R5.into()),
                b: Some(1.into()),
            }),
            mul: None,
            sig: Sig::default(),
            cond: CondSpec {
                add_flags: Some(Flags::PushN),
                ..Default::default()
            },
            loc: DECODED,
        });
        assert_eq!(disassemble(i.encode().unwrap()).unwrap(), "sub.pushn r5, r5, 1");

        let i = Instruction::Alu(AluInstr {
            add: Some(AddHalf {
                op: AddOp::Bor,
                dst: R2,
                a: Some(rf(8).into()),
                b: Some(rf(8).into()),
            }),
            mul: None,
            sig: Sig {
                ldunif: true,
                ..Default::default()
            },
            cond: CondSpec::default(),
            loc: DECODED,
        });
        assert_eq!(
            disassemble(i.encode().unwrap()).unwrap(),
            "mov r2, rf8; sig ldunif"
        );

        let nop = alu(None, None);
        assert_eq!(
            disassemble(Instruction::Alu(nop).encode().unwrap()).unwrap(),
            "nop"
        );
    }

    #[test]
    fn test_decode_stream() {
        let a = Instruction::Alu(alu(None, None));
        let b = Instruction::Branch(BranchInstr {
            cond: BranchCond::AllNa,
            target: BranchTarget::Offset(16),
            loc: DECODED,
        });
        let mut bytes = Vec::new();
        for i in [&a, &b] {
            bytes.extend_from_slice(&i.encode().unwrap().to_le_bytes());
        }
        let decoded = decode_stream(&bytes).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(decoded[1].is_branch());

        assert!(matches!(
            decode_stream(&bytes[..12]),
            Err(DecodeError::TruncatedWord { trailing: 4 })
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        // op_mul = 0 without the branch marker is not a valid word.
        assert!(decode(0).is_err());
    }
}
