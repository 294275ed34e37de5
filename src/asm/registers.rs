//! Register and operand model for the VideoCore VI QPU.
//!
//! A QPU instruction reads its operands from three places: the six
//! accumulators `r0`-`r5`, the 64-entry register file `rf0`-`rf63`, and a
//! small-immediate port that replaces one register-file read. Writes go to
//! an accumulator, a register-file slot, or one of the "magic" write
//! addresses that front fixed-function hardware (TMU, SFU, TLB, uniform
//! prefetch).
//!
//! `r5` is the broadcast register: a write to it replicates one lane's
//! value across all sixteen lanes (the `R5REP` alias makes that intent
//! visible at the call site), and vector rotates deliver their result
//! through it.

use std::fmt;

/// Magic write addresses. The numeric value is the waddr field encoding
/// with the magic bit set in the instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Port {
    /// Discard the result (write nothing).
    Null = 6,
    /// Tile buffer color write.
    Tlb = 7,
    /// Tile buffer write, unencoded.
    Tlbu = 8,
    /// Uniform stream prefetch address.
    Unifa = 9,
    /// TMU lookup configuration.
    Tmul = 10,
    /// TMU write data.
    Tmud = 11,
    /// TMU address; writing it issues the memory transaction.
    Tmua = 12,
    /// TMU address, unencoded.
    Tmuau = 13,
    /// SFU reciprocal.
    Recip = 19,
    /// SFU reciprocal square root.
    Rsqrt = 20,
    /// SFU base-2 exponential.
    Exp = 21,
    /// SFU base-2 logarithm.
    Log = 22,
    /// SFU sine.
    Sin = 23,
}

impl Port {
    pub fn name(self) -> &'static str {
        match self {
            Port::Null => "null",
            Port::Tlb => "tlb",
            Port::Tlbu => "tlbu",
            Port::Unifa => "unifa",
            Port::Tmul => "tmul",
            Port::Tmud => "tmud",
            Port::Tmua => "tmua",
            Port::Tmuau => "tmuau",
            Port::Recip => "recip",
            Port::Rsqrt => "rsqrt",
            Port::Exp => "exp",
            Port::Log => "log",
            Port::Sin => "sin",
        }
    }

    /// Decode a magic waddr field value back to a port.
    pub fn from_waddr(waddr: u8) -> Option<Port> {
        Some(match waddr {
            6 => Port::Null,
            7 => Port::Tlb,
            8 => Port::Tlbu,
            9 => Port::Unifa,
            10 => Port::Tmul,
            11 => Port::Tmud,
            12 => Port::Tmua,
            13 => Port::Tmuau,
            19 => Port::Recip,
            20 => Port::Rsqrt,
            21 => Port::Exp,
            22 => Port::Log,
            23 => Port::Sin,
            _ => return None,
        })
    }
}

/// One register operand: an accumulator, a register-file slot, or a magic
/// write port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    /// Accumulator `r0`-`r5`.
    Acc(u8),
    /// Register file slot `rf0`-`rf63`.
    RegFile(u8),
    /// Magic write address.
    Port(Port),
}

pub const R0: Reg = Reg::Acc(0);
pub const R1: Reg = Reg::Acc(1);
pub const R2: Reg = Reg::Acc(2);
pub const R3: Reg = Reg::Acc(3);
pub const R4: Reg = Reg::Acc(4);
pub const R5: Reg = Reg::Acc(5);
/// Broadcast write alias of `r5`: element 0 is replicated to every lane.
pub const R5REP: Reg = Reg::Acc(5);

pub const NULL: Reg = Reg::Port(Port::Null);
pub const TLB: Reg = Reg::Port(Port::Tlb);
pub const TLBU: Reg = Reg::Port(Port::Tlbu);
pub const UNIFA: Reg = Reg::Port(Port::Unifa);
pub const TMUL: Reg = Reg::Port(Port::Tmul);
pub const TMUD: Reg = Reg::Port(Port::Tmud);
pub const TMUA: Reg = Reg::Port(Port::Tmua);
pub const TMUAU: Reg = Reg::Port(Port::Tmuau);
pub const RECIP: Reg = Reg::Port(Port::Recip);
pub const RSQRT: Reg = Reg::Port(Port::Rsqrt);
pub const EXP: Reg = Reg::Port(Port::Exp);
pub const LOG: Reg = Reg::Port(Port::Log);
pub const SIN: Reg = Reg::Port(Port::Sin);

/// Register file slot `rf0`-`rf63`.
///
/// Panics if `n` is out of range; slot numbers are compile-time constants
/// in every real program.
pub fn rf(n: u8) -> Reg {
    assert!(n < 64, "register file has 64 slots, got rf{}", n);
    Reg::RegFile(n)
}

impl Reg {
    /// Can an ALU op read this operand?
    pub fn is_readable(self) -> bool {
        matches!(self, Reg::Acc(_) | Reg::RegFile(_))
    }

    /// Can an ALU op write this operand? Every register class is writable;
    /// immediates (which are `Src`, not `Reg`) are not.
    pub fn is_writable(self) -> bool {
        true
    }

    /// waddr field value and magic flag for a write to this register.
    pub(crate) fn waddr(self) -> (u8, bool) {
        match self {
            Reg::Acc(n) => (n, true),
            Reg::RegFile(n) => (n, false),
            Reg::Port(p) => (p as u8, true),
        }
    }

    /// Reverse of [`Reg::waddr`].
    pub(crate) fn from_waddr(waddr: u8, magic: bool) -> Option<Reg> {
        if magic {
            if waddr < 6 {
                Some(Reg::Acc(waddr))
            } else {
                Port::from_waddr(waddr).map(Reg::Port)
            }
        } else if waddr < 64 {
            Some(Reg::RegFile(waddr))
        } else {
            None
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Acc(n) => write!(f, "r{}", n),
            Reg::RegFile(n) => write!(f, "rf{}", n),
            Reg::Port(p) => f.write_str(p.name()),
        }
    }
}

/// An immediate source operand.
///
/// The hardware has no immediate field in ALU instructions; a small set of
/// constants can be injected through the `raddr_b` port with the
/// small-immediate signal. Integers -16..=15 and the binary powers
/// 1.0..=128.0 and 2^-8..=2^-1 are representable; 0.0 shares the encoding
/// of integer 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Imm {
    Int(i32),
    Float(f32),
}

impl Imm {
    /// raddr_b encoding of this immediate, or `None` if the value is not
    /// representable.
    pub fn code(self) -> Option<u8> {
        match self {
            Imm::Int(v) if (-16..=15).contains(&v) => Some((v as u8) & 0x1f),
            Imm::Int(_) => None,
            Imm::Float(f) => {
                if f == 0.0 {
                    return Some(0);
                }
                // 1.0 * 2^n for n in -8..=7
                let bits = f.to_bits();
                if bits & 0x007f_ffff != 0 {
                    return None; // not a power of two
                }
                let exp = ((bits >> 23) & 0xff) as i32 - 127;
                match exp {
                    0..=7 => Some(32 + exp as u8),
                    -8..=-1 => Some((48 + exp) as u8),
                    _ => None,
                }
            }
        }
    }

    /// Reverse of [`Imm::code`]. Integer decodings are canonical: 0.0 comes
    /// back as `Int(0)`.
    pub fn from_code(code: u8) -> Option<Imm> {
        match code {
            0..=15 => Some(Imm::Int(code as i32)),
            16..=31 => Some(Imm::Int(code as i32 - 32)),
            32..=39 => Some(Imm::Float((2.0f32).powi(code as i32 - 32))),
            40..=47 => Some(Imm::Float((2.0f32).powi(code as i32 - 48))),
            _ => None,
        }
    }
}

impl fmt::Display for Imm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Imm::Int(v) => write!(f, "{}", v),
            Imm::Float(v) => write!(f, "{:?}", v),
        }
    }
}

/// A source operand: a readable register or a small immediate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Src {
    Reg(Reg),
    Imm(Imm),
}

impl From<Reg> for Src {
    fn from(r: Reg) -> Src {
        Src::Reg(r)
    }
}

impl From<i32> for Src {
    fn from(v: i32) -> Src {
        Src::Imm(Imm::Int(v))
    }
}

impl From<f32> for Src {
    fn from(v: f32) -> Src {
        Src::Imm(Imm::Float(v))
    }
}

impl fmt::Display for Src {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Src::Reg(r) => r.fmt(f),
            Src::Imm(i) => i.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waddr_round_trip() {
        for reg in [R0, R5, rf(0), rf(63), NULL, TMUD, TMUA, RECIP] {
            let (waddr, magic) = reg.waddr();
            assert_eq!(Reg::from_waddr(waddr, magic), Some(reg), "{}", reg);
        }
    }

    #[test]
    fn test_port_reads_rejected() {
        assert!(!TMUD.is_readable());
        assert!(!NULL.is_readable());
        assert!(R4.is_readable());
        assert!(rf(31).is_readable());
    }

    #[test]
    fn test_small_imm_ints() {
        for v in -16..=15 {
            let code = Imm::Int(v).code().unwrap();
            assert_eq!(Imm::from_code(code), Some(Imm::Int(v)), "imm {}", v);
        }
        assert_eq!(Imm::Int(16).code(), None);
        assert_eq!(Imm::Int(-17).code(), None);
    }

    #[test]
    fn test_small_imm_floats() {
        for exp in -8..=7 {
            let f = (2.0f32).powi(exp);
            let code = Imm::Float(f).code().unwrap();
            assert_eq!(Imm::from_code(code), Some(Imm::Float(f)), "imm {}", f);
        }
        // 0.0 aliases integer zero
        assert_eq!(Imm::Float(0.0).code(), Some(0));
        assert_eq!(Imm::Float(3.0).code(), None);
        assert_eq!(Imm::Float(256.0).code(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(R5.to_string(), "r5");
        assert_eq!(rf(32).to_string(), "rf32");
        assert_eq!(TMUA.to_string(), "tmua");
        assert_eq!(Src::from(-16).to_string(), "-16");
        assert_eq!(Src::from(0.5f32).to_string(), "0.5");
    }
}
