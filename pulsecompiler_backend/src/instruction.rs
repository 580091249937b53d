//! Provides definitions for the two-word instructions understood by the pulse controller.
//!
//! ## Main Structures and Enumerations:
//!
//! - `Instruction`: A `(ctrl, op)` pair. The top nibble of `ctrl` selects the opcode class. Real
//!   hardware pulses are written verbatim to the instruction FIFO, while meta instructions (top
//!   nibble `0xF`) are expanded by the interpreter into one or more hardware pulses.
//!
//! - `InstrType`: A decoded, typed view of an instruction, used by the interpreter for dispatch.
//!
//! ## Encoding
//!
//! | opcode | `ctrl` | `op` | duration (cycles) |
//! |--------|--------|------|-------------------|
//! | TTL  `0x0` | `t` | TTL word | `t` |
//! | DDS  `0x1` | `chn << 4 \| addr << 9 \| sub` | data | [`DDS_T`] |
//! | Wait `0x2` | `t` | 0 | `t` |
//! | Clear timing check `0x3` | | | [`SHORT_T`] |
//! | Loop-back `0x4` | | value | [`SHORT_T`] |
//! | Clock out `0x5` | | divider | [`SHORT_T`] |
//! | DAC  `0x6` | `chn << 4` | value | [`DAC_T`] |
//! | Meta `0xF` | `sub << 24 \| payload` | payload | expanded |
//!
//! One time unit (cycle) is 10 ns.

use std::fmt;

use crate::channel::{check_chn, ChannelKind};
use crate::error::SeqError;

/// Largest duration a single TTL or wait pulse can encode.
pub const MAX_PULSE_T: u32 = 0x001F_FFFF;
/// Duration of a TTL pulse emitted for a TTL state change.
pub const TTL_T: u32 = 3;
/// Extra settle time required before the TTL word may change again.
pub const TTL_EDGE_T: u32 = 2;
/// Duration of every DDS register access.
pub const DDS_T: u32 = 50;
/// Duration of a DAC update.
pub const DAC_T: u32 = 45;
/// Duration of the remaining short instructions (clock, loop-back, clear timing check).
pub const SHORT_T: u32 = 5;

/// Timing-check flag OR-ed onto real pulses issued during a time critical run.
pub const TIMING_CHECK: u32 = 0x0080_0000;

pub const OP_TTL: u32 = 0x0;
pub const OP_DDS: u32 = 0x1;
pub const OP_WAIT: u32 = 0x2;
pub const OP_CLEAR_TIMING: u32 = 0x3;
pub const OP_LOOPBACK: u32 = 0x4;
pub const OP_CLOCK: u32 = 0x5;
pub const OP_DAC: u32 = 0x6;
pub const OP_META: u32 = 0xF;

// DDS sub-opcodes (low nibble of ctrl)
pub const DDS_SET_FREQ: u32 = 0x0;
pub const DDS_SET_AMP: u32 = 0x1;
pub const DDS_SET_PHASE: u32 = 0x2;
pub const DDS_RESET: u32 = 0x4;
pub const DDS_GET_FREQ: u32 = 0x8;
pub const DDS_GET_AMP: u32 = 0x9;
pub const DDS_GET_PHASE: u32 = 0xA;
pub const DDS_GET_TWO_BYTES: u32 = 0xC;
pub const DDS_GET_FOUR_BYTES: u32 = 0xD;
pub const DDS_SET_TWO_BYTES: u32 = 0xE;
pub const DDS_SET_FOUR_BYTES: u32 = 0xF;

// Meta sub-opcodes (second nibble of ctrl)
pub const META_WAIT: u32 = 0x0;
pub const META_DDS_SET_PHASE: u32 = 0x1;
pub const META_DDS_SHIFT_PHASE: u32 = 0x2;
pub const META_DDS_RESET: u32 = 0x3;
pub const META_TTL_ALL: u32 = 0x4;
pub const META_TTL_BIT: u32 = 0x5;
pub const META_TIMING_CHECK: u32 = 0x6;

/// Largest wait a single meta instruction can carry (56 bits).
pub const MAX_META_WAIT: u64 = (1 << 56) - 1;

/// Returns the opcode class (top nibble) of a control word.
pub fn opcode(ctrl: u32) -> u32 {
    ctrl >> 28
}

/// Number of cycles the hardware spends executing a real pulse.
///
/// Meta instructions have no intrinsic hardware duration and return 0.
pub fn pulse_duration(ctrl: u32) -> u32 {
    match opcode(ctrl) {
        OP_TTL | OP_WAIT => ctrl & MAX_PULSE_T,
        OP_DDS => DDS_T,
        OP_DAC => DAC_T,
        OP_META => 0,
        _ => SHORT_T,
    }
}

/// Whether the hardware pushes a word onto the result FIFO when executing `ctrl`.
pub fn has_result(ctrl: u32) -> bool {
    match opcode(ctrl) {
        OP_LOOPBACK => true,
        OP_DDS => matches!(
            ctrl & 0xF,
            DDS_GET_FREQ | DDS_GET_AMP | DDS_GET_PHASE | DDS_GET_TWO_BYTES | DDS_GET_FOUR_BYTES
        ),
        _ => false,
    }
}

fn dds_ctrl(chn: u32, addr: u32, sub: u32) -> u32 {
    (OP_DDS << 28) | ((addr & 0x7F) << 9) | ((chn & 0x1F) << 4) | (sub & 0xF)
}

/// A single `(ctrl, op)` instruction word pair.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Instruction {
    pub ctrl: u32,
    pub op: u32,
}

impl Instruction {
    pub fn new(ctrl: u32, op: u32) -> Self {
        Instruction { ctrl, op }
    }

    /// TTL pulse holding `ttl` for `t` cycles.
    ///
    /// ```
    /// use pulsecompiler_backend::instruction::*;
    /// let instr = Instruction::ttl(0b101, 100);
    /// assert_eq!(instr.ctrl, 100);
    /// assert_eq!(pulse_duration(instr.ctrl), 100);
    /// ```
    pub fn ttl(ttl: u32, t: u32) -> Self {
        assert!(
            t <= MAX_PULSE_T,
            "TTL pulse duration {} exceeds the maximum {}",
            t,
            MAX_PULSE_T
        );
        Instruction::new((OP_TTL << 28) | t, ttl)
    }

    /// Hardware wait of `t` cycles (at most [`MAX_PULSE_T`]).
    pub fn wait(t: u32) -> Self {
        assert!(
            t <= MAX_PULSE_T,
            "Wait pulse duration {} exceeds the maximum {}",
            t,
            MAX_PULSE_T
        );
        Instruction::new((OP_WAIT << 28) | t, 0)
    }

    pub fn clear_timing_check() -> Self {
        Instruction::new(OP_CLEAR_TIMING << 28, 0)
    }

    /// Loop-back instruction: the hardware echoes `val` into the result FIFO.
    pub fn loopback(val: u32) -> Self {
        Instruction::new(OP_LOOPBACK << 28, val)
    }

    /// Clock output with the given divider, `255` turns the clock off.
    pub fn clock(period: u8) -> Self {
        Instruction::new(OP_CLOCK << 28, period as u32)
    }

    pub fn dac(chn: u32, val: u16) -> Self {
        Instruction::new((OP_DAC << 28) | ((chn & 0x3) << 4), val as u32)
    }

    pub fn dds_freq(chn: u32, ftw: u32) -> Self {
        Instruction::new(dds_ctrl(chn, 0, DDS_SET_FREQ), ftw)
    }
    pub fn dds_amp(chn: u32, amp: u16) -> Self {
        Instruction::new(dds_ctrl(chn, 0, DDS_SET_AMP), (amp & 0xFFF) as u32)
    }
    pub fn dds_phase(chn: u32, phase: u16) -> Self {
        Instruction::new(dds_ctrl(chn, 0, DDS_SET_PHASE), phase as u32)
    }
    pub fn dds_reset(chn: u32) -> Self {
        Instruction::new(dds_ctrl(chn, 0, DDS_RESET), 0)
    }
    pub fn dds_set_two_bytes(chn: u32, addr: u32, val: u16) -> Self {
        Instruction::new(dds_ctrl(chn, addr, DDS_SET_TWO_BYTES), val as u32)
    }
    pub fn dds_set_four_bytes(chn: u32, addr: u32, val: u32) -> Self {
        Instruction::new(dds_ctrl(chn, addr, DDS_SET_FOUR_BYTES), val)
    }
    pub fn dds_get_freq(chn: u32) -> Self {
        Instruction::new(dds_ctrl(chn, 0, DDS_GET_FREQ), 0)
    }
    pub fn dds_get_amp(chn: u32) -> Self {
        Instruction::new(dds_ctrl(chn, 0, DDS_GET_AMP), 0)
    }
    pub fn dds_get_phase(chn: u32) -> Self {
        Instruction::new(dds_ctrl(chn, 0, DDS_GET_PHASE), 0)
    }
    pub fn dds_get_two_bytes(chn: u32, addr: u32) -> Self {
        Instruction::new(dds_ctrl(chn, addr, DDS_GET_TWO_BYTES), 0)
    }
    pub fn dds_get_four_bytes(chn: u32, addr: u32) -> Self {
        Instruction::new(dds_ctrl(chn, addr, DDS_GET_FOUR_BYTES), 0)
    }

    fn meta(sub: u32, payload: u32, op: u32) -> Self {
        Instruction::new((OP_META << 28) | ((sub & 0xF) << 24) | (payload & 0x00FF_FFFF), op)
    }

    /// Meta wait carrying a 56-bit duration split across `ctrl` and `op`.
    ///
    /// ```
    /// use pulsecompiler_backend::instruction::*;
    /// let t = 0x12_3456_789A_u64;
    /// assert_eq!(Instruction::meta_wait(t).decode().unwrap(), InstrType::Wait(t));
    /// ```
    pub fn meta_wait(t: u64) -> Self {
        assert!(
            t <= MAX_META_WAIT,
            "Wait time {} does not fit in a meta wait instruction",
            t
        );
        Instruction::meta(META_WAIT, (t >> 32) as u32, t as u32)
    }
    pub fn meta_dds_phase(chn: u32, phase: u16) -> Self {
        Instruction::meta(META_DDS_SET_PHASE, chn & 0x1F, phase as u32)
    }
    pub fn meta_dds_shift_phase(chn: u32, delta: u16) -> Self {
        Instruction::meta(META_DDS_SHIFT_PHASE, chn & 0x1F, delta as u32)
    }
    pub fn meta_dds_reset(chn: u32) -> Self {
        Instruction::meta(META_DDS_RESET, chn & 0x1F, 0)
    }
    pub fn meta_ttl_all(ttl: u32) -> Self {
        Instruction::meta(META_TTL_ALL, 0, ttl)
    }
    pub fn meta_ttl_bit(chn: u32, val: bool) -> Self {
        Instruction::meta(META_TTL_BIT, (chn & 0x1F) | ((val as u32) << 8), 0)
    }
    pub fn meta_timing_check(enable: bool) -> Self {
        Instruction::meta(META_TIMING_CHECK, 0, enable as u32)
    }

    pub fn is_meta(&self) -> bool {
        opcode(self.ctrl) == OP_META
    }

    /// Decodes the instruction into its typed form, validating channel indices and sub-opcodes.
    pub fn decode(&self) -> Result<InstrType, SeqError> {
        if !self.is_meta() {
            return match opcode(self.ctrl) {
                OP_DDS => {
                    check_chn(ChannelKind::DDS, (self.ctrl >> 4) & 0x1F)?;
                    Ok(InstrType::Pulse(*self))
                }
                OP_TTL | OP_WAIT | OP_CLEAR_TIMING | OP_LOOPBACK | OP_CLOCK | OP_DAC => {
                    Ok(InstrType::Pulse(*self))
                }
                _ => Err(SeqError::UnknownOpcode { ctrl: self.ctrl }),
            };
        }
        let chn = self.ctrl & 0x1F;
        let check_dds = |chn: u32| check_chn(ChannelKind::DDS, chn).map(|_| chn);
        match (self.ctrl >> 24) & 0xF {
            META_WAIT => Ok(InstrType::Wait(
                (((self.ctrl & 0x00FF_FFFF) as u64) << 32) | self.op as u64,
            )),
            META_DDS_SET_PHASE => Ok(InstrType::DdsSetPhase {
                chn: check_dds(chn)?,
                phase: self.op as u16,
            }),
            META_DDS_SHIFT_PHASE => Ok(InstrType::DdsShiftPhase {
                chn: check_dds(chn)?,
                delta: self.op as u16,
            }),
            META_DDS_RESET => Ok(InstrType::DdsReset {
                chn: check_dds(chn)?,
            }),
            META_TTL_ALL => Ok(InstrType::TtlAll(self.op)),
            META_TTL_BIT => {
                check_chn(ChannelKind::TTL, chn)?;
                Ok(InstrType::TtlBit {
                    chn,
                    val: (self.ctrl >> 8) & 1 != 0,
                })
            }
            META_TIMING_CHECK => Ok(InstrType::TimingCheck(self.op != 0)),
            _ => Err(SeqError::UnknownOpcode { ctrl: self.ctrl }),
        }
    }
}

impl Instruction {
    /// Decodes an instruction of a sequence, where pulses producing a result are not allowed:
    /// their results would have no request to complete.
    pub fn decode_in_sequence(&self) -> Result<InstrType, SeqError> {
        let instr_type = self.decode()?;
        if !self.is_meta() && has_result(self.ctrl) {
            return Err(SeqError::ResultInSequence { ctrl: self.ctrl });
        }
        Ok(instr_type)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[0x{:08x}, 0x{:08x}]", self.ctrl, self.op)
    }
}

/// Typed view of an [`Instruction`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InstrType {
    /// Real hardware pulse, issued as-is (plus the timing-check flag).
    Pulse(Instruction),
    Wait(u64),
    DdsSetPhase { chn: u32, phase: u16 },
    DdsShiftPhase { chn: u32, delta: u16 },
    DdsReset { chn: u32 },
    TtlAll(u32),
    TtlBit { chn: u32, val: bool },
    TimingCheck(bool),
}

impl InstrType {
    /// Hardware time consumed by the instruction once expanded.
    pub fn duration(&self) -> u64 {
        match self {
            InstrType::Pulse(instr) => pulse_duration(instr.ctrl) as u64,
            InstrType::Wait(t) => *t,
            InstrType::DdsSetPhase { .. }
            | InstrType::DdsShiftPhase { .. }
            | InstrType::DdsReset { .. } => DDS_T as u64,
            InstrType::TtlAll(_) | InstrType::TtlBit { .. } => TTL_T as u64,
            InstrType::TimingCheck(_) => 0,
        }
    }

    /// Short name used for statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            InstrType::Pulse(instr) => match opcode(instr.ctrl) {
                OP_TTL => "ttl",
                OP_DDS => "dds",
                OP_WAIT => "wait",
                OP_CLEAR_TIMING => "clear_timing",
                OP_LOOPBACK => "loopback",
                OP_CLOCK => "clock",
                OP_DAC => "dac",
                _ => "unknown",
            },
            InstrType::Wait(_) => "wait",
            InstrType::DdsSetPhase { .. }
            | InstrType::DdsShiftPhase { .. }
            | InstrType::DdsReset { .. } => "dds",
            InstrType::TtlAll(_) | InstrType::TtlBit { .. } => "ttl",
            InstrType::TimingCheck(_) => "timing_check",
        }
    }
}
