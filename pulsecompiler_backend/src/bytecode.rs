//! Dense byte-code encoding of a pulse program.
//!
//! Every op starts with one header byte: the low nibble is the opcode, the high nibble carries
//! small flags (TTL bit value, wait length, timing-check enable). Multi-byte payloads are
//! little-endian. Compared to the two-word [`Instruction`](crate::instruction::Instruction)
//! stream, a TTL bit flip takes 2 bytes instead of 8 and short waits take 2 or 3 bytes.

use crate::channel::{check_chn, ChannelKind};
use crate::error::SeqError;
use crate::instruction::{DAC_T, DDS_T, SHORT_T, TTL_T};

pub const BC_TTL_ALL: u8 = 0;
pub const BC_TTL1: u8 = 1;
pub const BC_WAIT: u8 = 2;
pub const BC_CLOCK: u8 = 3;
pub const BC_DDS_FREQ: u8 = 4;
pub const BC_DDS_DET_FREQ: u8 = 5;
pub const BC_DDS_AMP: u8 = 6;
pub const BC_DDS_PHASE: u8 = 7;
pub const BC_DDS_DET_PHASE: u8 = 8;
pub const BC_DDS_RESET: u8 = 9;
pub const BC_DAC: u8 = 10;
pub const BC_TIMING_CHECK: u8 = 11;

/// One decoded byte-code operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ByteCodeOp {
    TtlAll(u32),
    Ttl1 { chn: u32, val: bool },
    Wait(u64),
    Clock(u8),
    DdsFreq { chn: u32, ftw: u32 },
    DdsDetFreq { chn: u32, delta: i32 },
    DdsAmp { chn: u32, amp: u16 },
    DdsPhase { chn: u32, phase: u16 },
    DdsDetPhase { chn: u32, delta: u16 },
    DdsReset { chn: u32 },
    Dac { chn: u32, val: u16 },
    TimingCheck(bool),
}

impl ByteCodeOp {
    /// Hardware time consumed by the op once expanded into pulses.
    pub fn duration(&self) -> u64 {
        (match self {
            ByteCodeOp::TtlAll(_) | ByteCodeOp::Ttl1 { .. } => TTL_T,
            ByteCodeOp::Wait(t) => return *t,
            ByteCodeOp::Clock(_) => SHORT_T,
            ByteCodeOp::DdsFreq { .. }
            | ByteCodeOp::DdsDetFreq { .. }
            | ByteCodeOp::DdsAmp { .. }
            | ByteCodeOp::DdsPhase { .. }
            | ByteCodeOp::DdsDetPhase { .. }
            | ByteCodeOp::DdsReset { .. } => DDS_T,
            ByteCodeOp::Dac { .. } => DAC_T,
            ByteCodeOp::TimingCheck(_) => 0,
        }) as u64
    }

    /// Appends the encoded op to `buf`.
    ///
    /// ```
    /// use pulsecompiler_backend::bytecode::*;
    ///
    /// let mut buf = Vec::new();
    /// ByteCodeOp::Ttl1 { chn: 4, val: true }.encode(&mut buf);
    /// ByteCodeOp::Wait(300).encode(&mut buf);
    /// assert_eq!(buf, vec![0x11, 4, 0x22, 0x2c, 0x01]);
    /// ```
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match *self {
            ByteCodeOp::TtlAll(ttl) => {
                buf.push(BC_TTL_ALL);
                buf.extend_from_slice(&ttl.to_le_bytes());
            }
            ByteCodeOp::Ttl1 { chn, val } => {
                buf.push(BC_TTL1 | ((val as u8) << 4));
                buf.push(chn as u8);
            }
            ByteCodeOp::Wait(t) => {
                assert!(t > 0 && t < (1 << 56), "Byte-code wait {} out of range", t);
                let nbytes = (8 - t.leading_zeros() / 8) as u8;
                buf.push(BC_WAIT | (nbytes << 4));
                buf.extend_from_slice(&t.to_le_bytes()[..nbytes as usize]);
            }
            ByteCodeOp::Clock(period) => {
                buf.push(BC_CLOCK);
                buf.push(period);
            }
            ByteCodeOp::DdsFreq { chn, ftw } => {
                buf.extend_from_slice(&[BC_DDS_FREQ, chn as u8]);
                buf.extend_from_slice(&ftw.to_le_bytes());
            }
            ByteCodeOp::DdsDetFreq { chn, delta } => {
                buf.extend_from_slice(&[BC_DDS_DET_FREQ, chn as u8]);
                buf.extend_from_slice(&delta.to_le_bytes());
            }
            ByteCodeOp::DdsAmp { chn, amp } => {
                buf.extend_from_slice(&[BC_DDS_AMP, chn as u8]);
                buf.extend_from_slice(&amp.to_le_bytes());
            }
            ByteCodeOp::DdsPhase { chn, phase } => {
                buf.extend_from_slice(&[BC_DDS_PHASE, chn as u8]);
                buf.extend_from_slice(&phase.to_le_bytes());
            }
            ByteCodeOp::DdsDetPhase { chn, delta } => {
                buf.extend_from_slice(&[BC_DDS_DET_PHASE, chn as u8]);
                buf.extend_from_slice(&delta.to_le_bytes());
            }
            ByteCodeOp::DdsReset { chn } => {
                buf.extend_from_slice(&[BC_DDS_RESET, chn as u8]);
            }
            ByteCodeOp::Dac { chn, val } => {
                buf.extend_from_slice(&[BC_DAC, chn as u8]);
                buf.extend_from_slice(&val.to_le_bytes());
            }
            ByteCodeOp::TimingCheck(enable) => {
                buf.push(BC_TIMING_CHECK | ((enable as u8) << 4));
            }
        }
    }
}

/// Iterates over the ops of an encoded byte-code buffer.
///
/// Decoding stops at the first error; the error carries the offset of the offending op.
pub struct ByteCodeReader<'a> {
    code: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> ByteCodeReader<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        ByteCodeReader {
            code,
            pos: 0,
            failed: false,
        }
    }

    fn take<const N: usize>(&mut self, start: usize) -> Result<[u8; N], SeqError> {
        let bytes = self
            .code
            .get(self.pos..self.pos + N)
            .ok_or(SeqError::Truncated { offset: start })?;
        self.pos += N;
        let mut res = [0u8; N];
        res.copy_from_slice(bytes);
        Ok(res)
    }

    fn chn(&mut self, kind: ChannelKind, start: usize) -> Result<u32, SeqError> {
        let [chn] = self.take::<1>(start)?;
        check_chn(kind, chn as u32)?;
        Ok(chn as u32)
    }

    fn next_op(&mut self) -> Result<ByteCodeOp, SeqError> {
        let start = self.pos;
        let [header] = self.take::<1>(start)?;
        let flags = header >> 4;
        let op = match header & 0xF {
            BC_TTL_ALL => ByteCodeOp::TtlAll(u32::from_le_bytes(self.take(start)?)),
            BC_TTL1 => ByteCodeOp::Ttl1 {
                chn: self.chn(ChannelKind::TTL, start)?,
                val: flags & 1 != 0,
            },
            BC_WAIT => {
                if flags == 0 || flags > 7 {
                    return Err(SeqError::WaitLength {
                        len: flags,
                        offset: start,
                    });
                }
                let bytes = self
                    .code
                    .get(self.pos..self.pos + flags as usize)
                    .ok_or(SeqError::Truncated { offset: start })?;
                self.pos += flags as usize;
                let mut t = [0u8; 8];
                t[..bytes.len()].copy_from_slice(bytes);
                ByteCodeOp::Wait(u64::from_le_bytes(t))
            }
            BC_CLOCK => ByteCodeOp::Clock(self.take::<1>(start)?[0]),
            BC_DDS_FREQ => ByteCodeOp::DdsFreq {
                chn: self.chn(ChannelKind::DDS, start)?,
                ftw: u32::from_le_bytes(self.take(start)?),
            },
            BC_DDS_DET_FREQ => ByteCodeOp::DdsDetFreq {
                chn: self.chn(ChannelKind::DDS, start)?,
                delta: i32::from_le_bytes(self.take(start)?),
            },
            BC_DDS_AMP => ByteCodeOp::DdsAmp {
                chn: self.chn(ChannelKind::DDS, start)?,
                amp: u16::from_le_bytes(self.take(start)?),
            },
            BC_DDS_PHASE => ByteCodeOp::DdsPhase {
                chn: self.chn(ChannelKind::DDS, start)?,
                phase: u16::from_le_bytes(self.take(start)?),
            },
            BC_DDS_DET_PHASE => ByteCodeOp::DdsDetPhase {
                chn: self.chn(ChannelKind::DDS, start)?,
                delta: u16::from_le_bytes(self.take(start)?),
            },
            BC_DDS_RESET => ByteCodeOp::DdsReset {
                chn: self.chn(ChannelKind::DDS, start)?,
            },
            BC_DAC => ByteCodeOp::Dac {
                chn: self.chn(ChannelKind::DAC, start)?,
                val: u16::from_le_bytes(self.take(start)?),
            },
            BC_TIMING_CHECK => ByteCodeOp::TimingCheck(flags & 1 != 0),
            op => return Err(SeqError::UnknownByteCode { op, offset: start }),
        };
        Ok(op)
    }
}

impl Iterator for ByteCodeReader<'_> {
    type Item = Result<ByteCodeOp, SeqError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.code.len() {
            return None;
        }
        let res = self.next_op();
        self.failed = res.is_err();
        Some(res)
    }
}

/// Decodes the whole buffer, returning the first error encountered.
pub fn decode_all(code: &[u8]) -> Result<Vec<ByteCodeOp>, SeqError> {
    ByteCodeReader::new(code).collect()
}
