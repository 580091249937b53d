//! Builds fully resolved pulse programs from timed pulse descriptions.
//!
//! ## Overview
//!
//! The behavior of every builder is defined by the [`BaseBuilder`] trait through default trait
//! implementations. An implementer only supplies access to its [`BuildState`] and a handful of
//! `emit_*` primitives which append one already-timed operation to the output buffer. Two
//! builders are provided:
//!
//! - [`BlockBuilder`] produces a [`Program`]: a flat stream of `(ctrl, op)` words consumed by the
//!   instruction interpreter. Waits, TTL updates and DDS phase operations are emitted as meta
//!   instructions so that the interpreter can service asynchronous requests during idle time
//!   and keep its per-run shadow state in sync.
//! - [`ByteCodeBuilder`] produces [`ByteCode`], the dense wire format.
//!
//! ## Timing rules
//!
//! Times are absolute, in 10 ns cycles. The builder tracks the start time and duration of the
//! last pulse; a new pulse may start no earlier than `last_t + last_duration`, plus
//! [`TTL_EDGE_T`] if it changes the TTL word. Requests that violate this are rejected with
//! [`SeqError::TooEarly`] rather than shifted. Gaps between pulses are filled with waits.
//!
//! The first pulse of every program must set the full TTL word so that the hardware starts from
//! a known output state.
//!
//! ```
//! use pulsecompiler_backend::builder::*;
//!
//! let mut builder = BlockBuilder::new();
//! builder.ttl(0b01, 0).unwrap();
//! builder.dds_freq(0, 0x1234_5678, 100).unwrap();
//! builder.ttl(0b11, 1000).unwrap();
//! // Too early: the last pulse only ends at 1003, and the TTL word changes.
//! assert!(builder.ttl(0b10, 1004).is_err());
//! builder.ttl(0b10, 1005).unwrap();
//! let program = builder.finish();
//! assert_eq!(program.total_time(), 1008);
//! ```

use indexmap::IndexMap;

use crate::bytecode::{decode_all, ByteCodeOp};
use crate::channel::{check_chn, ChannelKind, NUM_DDS};
use crate::error::SeqError;
use crate::instruction::*;

/// Build-time mirror of the interpreter's per-run state.
#[derive(Clone, Debug)]
pub struct BuildState {
    /// Start time of the last emitted pulse.
    pub last_t: u64,
    /// Duration of the last emitted pulse.
    pub last_duration: u64,
    /// End of the last pulse other than padding waits.
    pub last_pulse_end: u64,
    /// Current TTL word, `None` until the initial TTL pulse.
    pub curr_ttl: Option<u32>,
    pub dds_phases: [u16; NUM_DDS],
    pub dds_freqs: [u32; NUM_DDS],
    pub timing_check: bool,
}

impl Default for BuildState {
    fn default() -> Self {
        Self {
            last_t: 0,
            last_duration: 0,
            last_pulse_end: 0,
            curr_ttl: None,
            dds_phases: [0; NUM_DDS],
            dds_freqs: [0; NUM_DDS],
            timing_check: true,
        }
    }
}

impl BuildState {
    /// Time at which the last emitted pulse ends.
    pub fn end_time(&self) -> u64 {
        self.last_t + self.last_duration
    }
}

/// This trait defines the behavior of pulse program builders through default implementations.
///
/// Trait methods fall in the following categories:
/// 1. Field methods: [`state`](BaseBuilder::state), [`state_`](BaseBuilder::state_).
/// 2. Emission primitives (`emit_*`), which append one operation without any timing checks.
/// 3. Timed pulse methods: [`ttl`](BaseBuilder::ttl), [`ttl_bit`](BaseBuilder::ttl_bit),
///    [`dds_freq`](BaseBuilder::dds_freq), [`dds_det_freq`](BaseBuilder::dds_det_freq),
///    [`dds_amp`](BaseBuilder::dds_amp), [`dds_phase`](BaseBuilder::dds_phase),
///    [`dds_shift_phase`](BaseBuilder::dds_shift_phase), [`dds_reset`](BaseBuilder::dds_reset),
///    [`dac`](BaseBuilder::dac), [`clock`](BaseBuilder::clock), and their `*_after` variants
///    taking a delay relative to the end of the previous pulse.
/// 4. Untimed settings and helpers: [`timing_check`](BaseBuilder::timing_check),
///    [`wait_until`](BaseBuilder::wait_until), [`earliest_time`](BaseBuilder::earliest_time).
pub trait BaseBuilder {
    // FIELD methods
    fn state(&self) -> &BuildState;
    fn state_(&mut self) -> &mut BuildState;

    // Emission primitives
    fn emit_wait(&mut self, t: u64);
    fn emit_ttl_all(&mut self, ttl: u32);
    fn emit_ttl_bit(&mut self, chn: u32, val: bool);
    /// `delta` is set when the change was requested relative to the previous frequency.
    fn emit_dds_freq(&mut self, chn: u32, ftw: u32, delta: Option<i32>);
    fn emit_dds_amp(&mut self, chn: u32, amp: u16);
    fn emit_dds_phase(&mut self, chn: u32, phase: u16);
    fn emit_dds_shift_phase(&mut self, chn: u32, delta: u16);
    fn emit_dds_reset(&mut self, chn: u32);
    fn emit_dac(&mut self, chn: u32, val: u16);
    fn emit_clock(&mut self, period: u8);
    fn emit_timing_check(&mut self, enable: bool);

    fn end_time(&self) -> u64 {
        self.state().end_time()
    }

    /// Earliest time at which the next pulse may start.
    ///
    /// The TTL edge time counts from the end of the last pulse; padding waits only delay the
    /// next pulse to their own end.
    fn earliest_time(&self, ttl_changes: bool) -> u64 {
        let edge = if ttl_changes { TTL_EDGE_T as u64 } else { 0 };
        let state = self.state();
        state.end_time().max(state.last_pulse_end + edge)
    }

    /// Validates the start time of a new pulse and fills the gap since the last one with a wait.
    fn start_pulse(&mut self, t: u64, duration: u32, ttl_changes: bool) -> Result<(), SeqError> {
        let earliest = self.earliest_time(ttl_changes);
        if t < earliest {
            return Err(SeqError::TooEarly { t, earliest });
        }
        let gap = t - self.state().end_time();
        if gap > 0 {
            self.emit_wait(gap);
        }
        let state = self.state_();
        state.last_t = t;
        state.last_duration = duration as u64;
        state.last_pulse_end = t + duration as u64;
        Ok(())
    }

    fn require_ttl(&self, what: &'static str, t: u64) -> Result<u32, SeqError> {
        self.state()
            .curr_ttl
            .ok_or(SeqError::MissingInitialTtl { what, t })
    }

    /// Sets all TTL outputs at time `t`.
    fn ttl(&mut self, ttl: u32, t: u64) -> Result<(), SeqError> {
        let changes = self.state().curr_ttl.is_some_and(|curr| curr != ttl);
        self.start_pulse(t, TTL_T, changes)?;
        self.state_().curr_ttl = Some(ttl);
        self.emit_ttl_all(ttl);
        Ok(())
    }

    /// Sets a single TTL output at time `t`.
    fn ttl_bit(&mut self, chn: u32, val: bool, t: u64) -> Result<(), SeqError> {
        check_chn(ChannelKind::TTL, chn)?;
        let curr = self.require_ttl("ttl_bit", t)?;
        let ttl = if val { curr | (1 << chn) } else { curr & !(1 << chn) };
        self.start_pulse(t, TTL_T, ttl != curr)?;
        self.state_().curr_ttl = Some(ttl);
        self.emit_ttl_bit(chn, val);
        Ok(())
    }

    fn set_dds_freq(
        &mut self,
        chn: u32,
        ftw: u32,
        delta: Option<i32>,
        t: u64,
    ) -> Result<(), SeqError> {
        check_chn(ChannelKind::DDS, chn)?;
        self.require_ttl("dds_freq", t)?;
        self.start_pulse(t, DDS_T, false)?;
        self.state_().dds_freqs[chn as usize] = ftw;
        self.emit_dds_freq(chn, ftw, delta);
        Ok(())
    }

    fn dds_freq(&mut self, chn: u32, ftw: u32, t: u64) -> Result<(), SeqError> {
        self.set_dds_freq(chn, ftw, None, t)
    }

    /// Changes the frequency tuning word of a DDS by `delta` relative to its last value.
    fn dds_det_freq(&mut self, chn: u32, delta: i32, t: u64) -> Result<(), SeqError> {
        check_chn(ChannelKind::DDS, chn)?;
        let ftw = self.state().dds_freqs[chn as usize].wrapping_add(delta as u32);
        self.set_dds_freq(chn, ftw, Some(delta), t)
    }

    fn dds_amp(&mut self, chn: u32, amp: u16, t: u64) -> Result<(), SeqError> {
        check_chn(ChannelKind::DDS, chn)?;
        self.require_ttl("dds_amp", t)?;
        self.start_pulse(t, DDS_T, false)?;
        self.emit_dds_amp(chn, amp);
        Ok(())
    }

    fn dds_phase(&mut self, chn: u32, phase: u16, t: u64) -> Result<(), SeqError> {
        check_chn(ChannelKind::DDS, chn)?;
        self.require_ttl("dds_phase", t)?;
        self.start_pulse(t, DDS_T, false)?;
        self.state_().dds_phases[chn as usize] = phase;
        self.emit_dds_phase(chn, phase);
        Ok(())
    }

    fn dds_shift_phase(&mut self, chn: u32, delta: u16, t: u64) -> Result<(), SeqError> {
        check_chn(ChannelKind::DDS, chn)?;
        self.require_ttl("dds_shift_phase", t)?;
        self.start_pulse(t, DDS_T, false)?;
        let phase = &mut self.state_().dds_phases[chn as usize];
        *phase = phase.wrapping_add(delta);
        self.emit_dds_shift_phase(chn, delta);
        Ok(())
    }

    fn dds_reset(&mut self, chn: u32, t: u64) -> Result<(), SeqError> {
        check_chn(ChannelKind::DDS, chn)?;
        self.require_ttl("dds_reset", t)?;
        self.start_pulse(t, DDS_T, false)?;
        let state = self.state_();
        state.dds_phases[chn as usize] = 0;
        state.dds_freqs[chn as usize] = 0;
        self.emit_dds_reset(chn);
        Ok(())
    }

    fn dac(&mut self, chn: u32, val: u16, t: u64) -> Result<(), SeqError> {
        check_chn(ChannelKind::DAC, chn)?;
        self.require_ttl("dac", t)?;
        self.start_pulse(t, DAC_T, false)?;
        self.emit_dac(chn, val);
        Ok(())
    }

    fn clock(&mut self, period: u8, t: u64) -> Result<(), SeqError> {
        self.require_ttl("clock", t)?;
        self.start_pulse(t, SHORT_T, false)?;
        self.emit_clock(period);
        Ok(())
    }

    /// Enables or disables the hardware timing check for the following pulses.
    fn timing_check(&mut self, enable: bool) {
        if self.state().timing_check != enable {
            self.state_().timing_check = enable;
            self.emit_timing_check(enable);
        }
    }

    /// Pads the program with a wait so that it ends exactly at `t`.
    fn wait_until(&mut self, t: u64) -> Result<(), SeqError> {
        let end = self.end_time();
        if t < end {
            return Err(SeqError::TooEarly { t, earliest: end });
        }
        if t > end {
            self.emit_wait(t - end);
            let state = self.state_();
            state.last_t = end;
            state.last_duration = t - end;
        }
        Ok(())
    }

    fn ttl_after(&mut self, ttl: u32, delay: u64) -> Result<(), SeqError> {
        let changes = self.state().curr_ttl.is_some_and(|curr| curr != ttl);
        self.ttl(ttl, self.earliest_time(changes) + delay)
    }

    fn ttl_bit_after(&mut self, chn: u32, val: bool, delay: u64) -> Result<(), SeqError> {
        let curr = self.state().curr_ttl.unwrap_or(0);
        let changes = ((curr >> chn.min(31)) & 1 != 0) != val;
        self.ttl_bit(chn, val, self.earliest_time(changes) + delay)
    }

    fn dds_freq_after(&mut self, chn: u32, ftw: u32, delay: u64) -> Result<(), SeqError> {
        self.dds_freq(chn, ftw, self.earliest_time(false) + delay)
    }

    fn dds_amp_after(&mut self, chn: u32, amp: u16, delay: u64) -> Result<(), SeqError> {
        self.dds_amp(chn, amp, self.earliest_time(false) + delay)
    }

    fn dds_phase_after(&mut self, chn: u32, phase: u16, delay: u64) -> Result<(), SeqError> {
        self.dds_phase(chn, phase, self.earliest_time(false) + delay)
    }

    fn dac_after(&mut self, chn: u32, val: u16, delay: u64) -> Result<(), SeqError> {
        self.dac(chn, val, self.earliest_time(false) + delay)
    }
}

/// A fully resolved instruction stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Program {
    words: Vec<u32>,
    total_time: u64,
}

impl Program {
    /// Wraps an externally produced word stream, validating every instruction.
    ///
    /// ```
    /// use pulsecompiler_backend::builder::Program;
    /// use pulsecompiler_backend::instruction::Instruction;
    ///
    /// let wait = Instruction::meta_wait(1000);
    /// let program = Program::from_words(vec![0, 0b1, wait.ctrl, wait.op]).unwrap();
    /// assert_eq!(program.total_time(), 1000);
    /// assert!(Program::from_words(vec![0, 0b1, 0]).is_err());
    /// let loopback = Instruction::loopback(1);
    /// assert!(Program::from_words(vec![loopback.ctrl, loopback.op]).is_err());
    /// ```
    pub fn from_words(words: Vec<u32>) -> Result<Self, SeqError> {
        if words.len() % 2 != 0 {
            return Err(SeqError::OddLength { len: words.len() });
        }
        let mut total_time = 0;
        for (index, pair) in words.chunks_exact(2).enumerate() {
            let instr_type = Instruction::new(pair[0], pair[1])
                .decode_in_sequence()
                .map_err(|e| SeqError::AtInstruction {
                    index,
                    source: Box::new(e),
                })?;
            total_time += instr_type.duration();
        }
        Ok(Program { words, total_time })
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }
    pub fn into_words(self) -> Vec<u32> {
        self.words
    }
    pub fn len(&self) -> usize {
        self.words.len() / 2
    }
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
    /// Total sequence time in cycles.
    pub fn total_time(&self) -> u64 {
        self.total_time
    }

    pub fn instructions(&self) -> impl Iterator<Item = Instruction> + '_ {
        self.words
            .chunks_exact(2)
            .map(|pair| Instruction::new(pair[0], pair[1]))
    }

    /// Number of instructions of each kind, in order of first appearance.
    pub fn pulse_counts(&self) -> IndexMap<&'static str, usize> {
        let mut counts = IndexMap::new();
        for instr in self.instructions() {
            if let Ok(instr_type) = instr.decode() {
                *counts.entry(instr_type.kind()).or_insert(0) += 1;
            }
        }
        counts
    }
}

/// Builder producing a [`Program`].
#[derive(Default)]
pub struct BlockBuilder {
    state: BuildState,
    words: Vec<u32>,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, instr: Instruction) {
        self.words.push(instr.ctrl);
        self.words.push(instr.op);
    }

    pub fn finish(self) -> Program {
        let total_time = self.state.end_time();
        Program {
            words: self.words,
            total_time,
        }
    }
}

impl BaseBuilder for BlockBuilder {
    fn state(&self) -> &BuildState {
        &self.state
    }
    fn state_(&mut self) -> &mut BuildState {
        &mut self.state
    }

    fn emit_wait(&mut self, mut t: u64) {
        while t > 0 {
            let chunk = t.min(MAX_META_WAIT);
            self.push(Instruction::meta_wait(chunk));
            t -= chunk;
        }
    }
    fn emit_ttl_all(&mut self, ttl: u32) {
        self.push(Instruction::meta_ttl_all(ttl));
    }
    fn emit_ttl_bit(&mut self, chn: u32, val: bool) {
        self.push(Instruction::meta_ttl_bit(chn, val));
    }
    fn emit_dds_freq(&mut self, chn: u32, ftw: u32, _delta: Option<i32>) {
        self.push(Instruction::dds_freq(chn, ftw));
    }
    fn emit_dds_amp(&mut self, chn: u32, amp: u16) {
        self.push(Instruction::dds_amp(chn, amp));
    }
    fn emit_dds_phase(&mut self, chn: u32, phase: u16) {
        self.push(Instruction::meta_dds_phase(chn, phase));
    }
    fn emit_dds_shift_phase(&mut self, chn: u32, delta: u16) {
        self.push(Instruction::meta_dds_shift_phase(chn, delta));
    }
    fn emit_dds_reset(&mut self, chn: u32) {
        self.push(Instruction::meta_dds_reset(chn));
    }
    fn emit_dac(&mut self, chn: u32, val: u16) {
        self.push(Instruction::dac(chn, val));
    }
    fn emit_clock(&mut self, period: u8) {
        self.push(Instruction::clock(period));
    }
    fn emit_timing_check(&mut self, enable: bool) {
        self.push(Instruction::meta_timing_check(enable));
    }
}

/// An encoded byte-code program.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ByteCode {
    bytes: Vec<u8>,
    total_time: u64,
}

impl ByteCode {
    /// Wraps an externally produced byte-code buffer, validating every op.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, SeqError> {
        let total_time = decode_all(&bytes)?.iter().map(|op| op.duration()).sum();
        Ok(ByteCode { bytes, total_time })
    }
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
    pub fn total_time(&self) -> u64 {
        self.total_time
    }
}

/// Builder producing [`ByteCode`].
#[derive(Default)]
pub struct ByteCodeBuilder {
    state: BuildState,
    bytes: Vec<u8>,
}

impl ByteCodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, op: ByteCodeOp) {
        op.encode(&mut self.bytes);
    }

    pub fn finish(self) -> ByteCode {
        let total_time = self.state.end_time();
        ByteCode {
            bytes: self.bytes,
            total_time,
        }
    }
}

impl BaseBuilder for ByteCodeBuilder {
    fn state(&self) -> &BuildState {
        &self.state
    }
    fn state_(&mut self) -> &mut BuildState {
        &mut self.state
    }

    fn emit_wait(&mut self, mut t: u64) {
        while t > 0 {
            let chunk = t.min(MAX_META_WAIT);
            self.push(ByteCodeOp::Wait(chunk));
            t -= chunk;
        }
    }
    fn emit_ttl_all(&mut self, ttl: u32) {
        self.push(ByteCodeOp::TtlAll(ttl));
    }
    fn emit_ttl_bit(&mut self, chn: u32, val: bool) {
        self.push(ByteCodeOp::Ttl1 { chn, val });
    }
    fn emit_dds_freq(&mut self, chn: u32, ftw: u32, delta: Option<i32>) {
        match delta {
            Some(delta) => self.push(ByteCodeOp::DdsDetFreq { chn, delta }),
            None => self.push(ByteCodeOp::DdsFreq { chn, ftw }),
        }
    }
    fn emit_dds_amp(&mut self, chn: u32, amp: u16) {
        self.push(ByteCodeOp::DdsAmp { chn, amp });
    }
    fn emit_dds_phase(&mut self, chn: u32, phase: u16) {
        self.push(ByteCodeOp::DdsPhase { chn, phase });
    }
    fn emit_dds_shift_phase(&mut self, chn: u32, delta: u16) {
        self.push(ByteCodeOp::DdsDetPhase { chn, delta });
    }
    fn emit_dds_reset(&mut self, chn: u32) {
        self.push(ByteCodeOp::DdsReset { chn });
    }
    fn emit_dac(&mut self, chn: u32, val: u16) {
        self.push(ByteCodeOp::Dac { chn, val });
    }
    fn emit_clock(&mut self, period: u8) {
        self.push(ByteCodeOp::Clock(period));
    }
    fn emit_timing_check(&mut self, enable: bool) {
        self.push(ByteCodeOp::TimingCheck(enable));
    }
}
