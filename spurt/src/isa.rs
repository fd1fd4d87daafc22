//! Decoding of the subset of the SPU instruction set needed to find the shape of guest code.
//!
//! Words are presented as native `u32`s (i.e. already converted from the big-endian local
//! storage). Bit positions in comments follow the SPU manuals, where bit 0 is the MSB.

/// The size of the local storage in bytes.
pub const LS_SIZE: u32 = 0x40000;
/// Mask an address to an aligned instruction position in the local storage.
pub const LS_MASK: u32 = 0x3fffc;
/// The number of instruction positions in the local storage.
pub const LS_WORDS: usize = 0x10000;

pub const NOP: u32 = 0x4020_0000;
pub const LNOP: u32 = 0x0020_0000;

/// Register indices as tracked by analysis. Indices 128 and above are pseudo registers used to
/// record writes to MFC channels.
pub mod reg {
    pub const LR: u8 = 0;
    pub const SP: u8 = 1;
    pub const R80: u8 = 80;
    pub const R127: u8 = 127;
    pub const MFC_EAL: u8 = 128;
    pub const MFC_LSA: u8 = 129;
    pub const MFC_TAG: u8 = 130;
    pub const MFC_SIZE: u8 = 131;
    pub const MAX: u8 = 132;
    /// "No register modified" in [crate::analysis::Analyser::regmod].
    pub const NONE: u8 = 0xff;
}

/// The condition tested by conditional branches.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cond {
    Zero,
    NotZero,
    HalfZero,
    HalfNotZero,
}

impl Cond {
    fn from_low_bits(x: u32) -> Self {
        match x & 3 {
            0 => Cond::Zero,
            1 => Cond::NotZero,
            2 => Cond::HalfZero,
            _ => Cond::HalfNotZero,
        }
    }

    /// Is the branch taken when the preferred slot of the tested register holds `v`?
    pub fn taken(self, v: u32) -> bool {
        match self {
            Cond::Zero => v == 0,
            Cond::NotZero => v != 0,
            Cond::HalfZero => v & 0xffff == 0,
            Cond::HalfNotZero => v & 0xffff != 0,
        }
    }
}

/// A decoded instruction word. Everything analysis does not care about is [Insn::Plain].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Insn {
    /// Data that can't be code (`0x0`, `0x3`): analysis never walks over it.
    Null,
    Stop { code: u32 },
    StopD,
    Iret,
    /// `NOP` or `LNOP`.
    Nop,
    /// `BR` or `BRA`.
    Br { target: u32 },
    /// `BRSL` or `BRASL`.
    BrSl { target: u32, rt: u8 },
    /// `BRZ`, `BRNZ`, `BRHZ`, `BRHNZ`.
    BrCond { cond: Cond, rt: u8, target: u32 },
    Bi { ra: u8 },
    /// `BISL` or `BISLED`.
    BiSl { ra: u8, rt: u8 },
    /// `BIZ`, `BINZ`, `BIHZ`, `BIHNZ`.
    BiCond { cond: Cond, rt: u8, ra: u8 },
    /// A constant formation instruction: `rt = (old & keep) | value`.
    Const { rt: u8, keep: u32, value: u32 },
    Plain,
}

#[inline]
fn op11(w: u32) -> u32 {
    w >> 21
}

#[inline]
fn op9(w: u32) -> u32 {
    w >> 23
}

#[inline]
fn rt(w: u32) -> u8 {
    (w & 0x7f) as u8
}

#[inline]
fn ra(w: u32) -> u8 {
    ((w >> 7) & 0x7f) as u8
}

#[inline]
fn i16(w: u32) -> u32 {
    (w >> 7) & 0xffff
}

/// The target of an `i16` branch from `base`.
#[inline]
fn branch_target(base: u32, w: u32) -> u32 {
    let off = (i16(w) as u16 as i16 as i32) << 2;
    base.wrapping_add(off as u32) & LS_MASK
}

/// Decode the word `w` found at LS address `pos`.
pub fn decode(pos: u32, w: u32) -> Insn {
    if w == 0 || w == 3 {
        return Insn::Null;
    }
    match op11(w) {
        0x000 => return Insn::Stop { code: w & 0x3fff },
        0x140 => return Insn::StopD,
        0x001 | 0x201 => return Insn::Nop,
        0x1aa => return Insn::Iret,
        0x1a8 => return Insn::Bi { ra: ra(w) },
        0x1a9 | 0x1ab => {
            return Insn::BiSl {
                ra: ra(w),
                rt: rt(w),
            }
        }
        x @ 0x128..=0x12b => {
            return Insn::BiCond {
                cond: Cond::from_low_bits(x),
                rt: rt(w),
                ra: ra(w),
            }
        }
        _ => (),
    }
    match op9(w) {
        0x064 => Insn::Br {
            target: branch_target(pos, w),
        },
        0x060 => Insn::Br {
            target: branch_target(0, w),
        },
        0x066 => Insn::BrSl {
            target: branch_target(pos, w),
            rt: rt(w),
        },
        0x062 => Insn::BrSl {
            target: branch_target(0, w),
            rt: rt(w),
        },
        x @ (0x040 | 0x042 | 0x044 | 0x046) => Insn::BrCond {
            cond: Cond::from_low_bits(x >> 1),
            rt: rt(w),
            target: branch_target(pos, w),
        },
        // IL
        0x081 => Insn::Const {
            rt: rt(w),
            keep: 0,
            value: i16(w) as u16 as i16 as i32 as u32,
        },
        // ILHU
        0x082 => Insn::Const {
            rt: rt(w),
            keep: 0,
            value: i16(w) << 16,
        },
        // ILH
        0x083 => Insn::Const {
            rt: rt(w),
            keep: 0,
            value: i16(w) * 0x10001,
        },
        // IOHL
        0x0c1 => Insn::Const {
            rt: rt(w),
            keep: 0xffff_ffff,
            value: i16(w),
        },
        // ILA
        _ if w >> 25 == 0x21 => Insn::Const {
            rt: rt(w),
            keep: 0,
            value: (w >> 7) & 0x3ffff,
        },
        _ => Insn::Plain,
    }
}

/// Which register (or MFC pseudo register) does `w` write? Returns [reg::NONE] if none.
pub fn regmod(w: u32) -> u8 {
    match decode(0, w) {
        Insn::Null
        | Insn::Stop { .. }
        | Insn::StopD
        | Insn::Iret
        | Insn::Nop
        | Insn::Br { .. }
        | Insn::BrCond { .. }
        | Insn::Bi { .. }
        | Insn::BiCond { .. } => reg::NONE,
        Insn::BrSl { rt, .. } | Insn::BiSl { rt, .. } | Insn::Const { rt, .. } => rt,
        Insn::Plain => plain_regmod(w),
    }
}

fn plain_regmod(w: u32) -> u8 {
    // RRR format: the target register lives in bits 4..10.
    if matches!(w >> 28, 0x8 | 0xb..=0xf) {
        return ((w >> 21) & 0x7f) as u8;
    }
    match op11(w) {
        // SYNC, DSYNC, STQX, MTSPR, HBR
        0x002 | 0x003 | 0x144 | 0x10c | 0x1ac => return reg::NONE,
        // WRCH
        0x10d => {
            return match ra(w) {
                16 => reg::MFC_LSA,
                18 => reg::MFC_EAL,
                19 => reg::MFC_SIZE,
                20 => reg::MFC_TAG,
                _ => reg::NONE,
            }
        }
        _ => (),
    }
    // STQA, STQR
    if matches!(op9(w), 0x041 | 0x047) {
        return reg::NONE;
    }
    // STQD
    if w >> 24 == 0x24 {
        return reg::NONE;
    }
    // HBRA, HBRR
    if matches!(w >> 25, 0x08 | 0x09) {
        return reg::NONE;
    }
    rt(w)
}

/// Is `w` a branch with an absolute target (`BRA`, `BRASL`)?
pub fn is_absolute(w: u32) -> bool {
    matches!(op9(w), 0x060 | 0x062)
}

/// Is `w` a hint (`HBR`, `HBRA`, `HBRR`)?
pub fn is_hint(w: u32) -> bool {
    op11(w) == 0x1ac || matches!(w >> 25, 0x08 | 0x09)
}

/// Encoders for the instructions we care about. These are used by tests and by
/// [crate::recompiler::SpuRecompiler::precompile] to fill holes.
pub mod enc {
    use super::LS_MASK;

    fn ri16(op9: u32, i16: u32, rt: u8) -> u32 {
        (op9 << 23) | ((i16 & 0xffff) << 7) | u32::from(rt & 0x7f)
    }

    fn rr(op11: u32, ra: u8, rt: u8) -> u32 {
        (op11 << 21) | (u32::from(ra & 0x7f) << 7) | u32::from(rt & 0x7f)
    }

    /// The `i16` word offset that branches from `from` to `to`.
    fn rel(from: u32, to: u32) -> u32 {
        ((to & LS_MASK).wrapping_sub(from & LS_MASK) as i32 >> 2) as u32
    }

    /// `STOP code`. Codes 0 and 3 would encode words analysis treats as data.
    pub fn stop(code: u32) -> u32 {
        let w = code & 0x3fff;
        assert!(w != 0 && w != 3, "STOP {code:#x} is indistinguishable from data");
        w
    }

    pub fn br(from: u32, to: u32) -> u32 {
        ri16(0x064, rel(from, to), 0)
    }

    pub fn bra(to: u32) -> u32 {
        ri16(0x060, to >> 2, 0)
    }

    pub fn brsl(from: u32, to: u32, rt: u8) -> u32 {
        ri16(0x066, rel(from, to), rt)
    }

    pub fn brz(from: u32, to: u32, rt: u8) -> u32 {
        ri16(0x040, rel(from, to), rt)
    }

    pub fn brnz(from: u32, to: u32, rt: u8) -> u32 {
        ri16(0x042, rel(from, to), rt)
    }

    pub fn bi(ra: u8) -> u32 {
        rr(0x1a8, ra, 0)
    }

    pub fn bisl(ra: u8, rt: u8) -> u32 {
        rr(0x1a9, ra, rt)
    }

    pub fn biz(rt: u8, ra: u8) -> u32 {
        rr(0x128, ra, rt)
    }

    pub fn il(rt: u8, v: i16) -> u32 {
        ri16(0x081, v as u16 as u32, rt)
    }

    pub fn ila(rt: u8, v: u32) -> u32 {
        (0x21 << 25) | ((v & 0x3ffff) << 7) | u32::from(rt & 0x7f)
    }

    pub fn ilhu(rt: u8, v: u16) -> u32 {
        ri16(0x082, u32::from(v), rt)
    }

    pub fn iohl(rt: u8, v: u16) -> u32 {
        ri16(0x0c1, u32::from(v), rt)
    }

    /// `AI rt, ra, imm` (add word immediate).
    pub fn ai(rt: u8, ra: u8, imm: i16) -> u32 {
        (0x1c << 24) | ((imm as u32 & 0x3ff) << 14) | (u32::from(ra & 0x7f) << 7) | u32::from(rt)
    }

    pub fn wrch(ch: u8, rt: u8) -> u32 {
        rr(0x10d, ch, rt)
    }
}
