//! Executes pulse programs on the controller in real time.
//!
//! ## Overview
//!
//! An [`Interpreter`] borrows a [`CtrlLocker`] for the whole run, so no other thread can write
//! to the instruction FIFO while a sequence is being issued. Real pulses are written as they
//! are, with the timing-check flag added while the check is enabled. Meta instructions are
//! expanded against the per-run [`CtrlState`]:
//!
//! - waits go through [`Interpreter::run_wait`], which lends idle time to queued asynchronous
//!   requests;
//! - DDS phase set/shift/reset update the shadow phase and issue the matching DDS access;
//! - TTL updates compute the new TTL word from the shadow word and issue a TTL pulse.
//!
//! ## Waits
//!
//! `run_wait(t)` has three regimes:
//!
//! | `t` | behavior |
//! |-----|----------|
//! | `< DDS_T` | one wait pulse |
//! | `< MEDIUM_WAIT` | once enough wait debt has accumulated, issue up to `t / DDS_T - 1` (at most 15) requests in place of part of the wait |
//! | otherwise | loop: issue requests for up to `SERVICE_BUDGET` cycles, or emit an idle slice and sleep when none are queued |
//!
//! The hardware time of all emitted pulses, request pulses included, always adds up to `t`.
//!
//! When the run is paced against the wall clock (the byte-code runner), idle iterations emit
//! large waits while the sequence is less than `max_ahead` ahead of real time, and only sleep
//! once it is further ahead.
//!
//! ## Hold
//!
//! Pulses are buffered under hold until `preload_cycles` of sequence time are queued, so the
//! hardware does not underflow right after the first pulse. The epilogue toggles the clock
//! output, waits 10 ms, clears the timing check, drains outstanding results and reads back
//! the timing-error flag.

use std::time::Duration;

use pulsecompiler_backend::builder::Program;
use pulsecompiler_backend::channel::NUM_DDS;
use pulsecompiler_backend::error::SeqError;
use pulsecompiler_backend::instruction::*;
use pulsecompiler_backend::utils::duration_to_cycles;

use crate::controller::{CtrlLocker, MAX_REQ_BATCH};
use crate::driver::RegisterFile;
use crate::utils::Clock;

/// Waits at least this long (160 µs) are sliced.
pub const MEDIUM_WAIT: u64 = 16_000;
/// Request service per iteration of a sliced wait (80 µs).
pub const SERVICE_BUDGET: u64 = 8_000;
/// Wait emitted by an idle iteration of a sliced wait (10 µs).
pub const IDLE_SLICE: u64 = 1_000;
/// Medium waits accumulated before requests are serviced from them.
pub const WAIT_DEBT_LIMIT: u64 = 2_000;
/// Wait appended to every run (10 ms).
pub const EPILOGUE_WAIT: u64 = 1_000_000;

/// Shadow state of one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CtrlState {
    pub dds_phases: [u16; NUM_DDS],
    pub dds_freqs: [u32; NUM_DDS],
    pub curr_ttl: u32,
    pub timing_check: bool,
    pub wait_debt: u64,
}

impl Default for CtrlState {
    fn default() -> Self {
        CtrlState {
            dds_phases: [0; NUM_DDS],
            dds_freqs: [0; NUM_DDS],
            curr_ttl: 0,
            timing_check: true,
            wait_debt: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Hardware time of everything issued, requests included.
    pub seq_time: u64,
    /// Sequence pulses issued.
    pub num_pulses: u64,
    /// Hardware time spent on asynchronous requests.
    pub req_time: u64,
    pub timing_failed: bool,
}

/// Checks a word stream before anything is written to the hardware.
pub fn validate(words: &[u32]) -> Result<Vec<InstrType>, SeqError> {
    if words.len() % 2 != 0 {
        return Err(SeqError::OddLength { len: words.len() });
    }
    words
        .chunks_exact(2)
        .enumerate()
        .map(|(index, pair)| {
            Instruction::new(pair[0], pair[1])
                .decode_in_sequence()
                .map_err(|e| SeqError::AtInstruction {
                    index,
                    source: Box::new(e),
                })
        })
        .collect()
}

/// Runs a word stream under `ctl`. See [`Interpreter::run_instructions`].
pub fn run_instructions<R: RegisterFile, C: Clock>(
    ctl: &CtrlLocker<'_, R>,
    state: &mut CtrlState,
    clock: &C,
    words: &[u32],
) -> Result<RunStats, SeqError> {
    Interpreter::new(ctl, state, clock).run_instructions(words)
}

pub struct Interpreter<'a, 'c, R: RegisterFile, C: Clock> {
    ctl: &'a CtrlLocker<'c, R>,
    state: &'a mut CtrlState,
    clock: &'a C,
    idle_sleep: Duration,
    preload: u64,
    max_ahead: u64,
    paced: bool,
    origin: Duration,
    holding: bool,
    stats: RunStats,
}

impl<'a, 'c, R: RegisterFile, C: Clock> Interpreter<'a, 'c, R, C> {
    pub fn new(ctl: &'a CtrlLocker<'c, R>, state: &'a mut CtrlState, clock: &'a C) -> Self {
        let config = ctl.controller().config();
        Interpreter {
            ctl,
            state,
            clock,
            idle_sleep: config.idle_sleep,
            preload: config.preload_cycles,
            max_ahead: duration_to_cycles(config.max_ahead),
            paced: false,
            origin: Duration::ZERO,
            holding: false,
            stats: RunStats::default(),
        }
    }

    /// Keeps the run within `max_ahead` of the wall clock.
    pub fn paced(mut self) -> Self {
        self.paced = true;
        self
    }

    pub fn state(&self) -> &CtrlState {
        &*self.state
    }
    pub fn stats(&self) -> RunStats {
        self.stats
    }

    fn flags(&self) -> u32 {
        if self.state.timing_check {
            TIMING_CHECK
        } else {
            0
        }
    }

    /// Sequence cycles buffered ahead of the wall clock.
    fn ahead(&self) -> u64 {
        let elapsed = self.clock.now().saturating_sub(self.origin);
        self.stats.seq_time.saturating_sub(duration_to_cycles(elapsed))
    }

    fn advance(&mut self, t: u64) {
        self.stats.seq_time += t;
        if self.holding && self.stats.seq_time >= self.preload {
            self.release_hold();
        }
    }

    fn release_hold(&mut self) {
        if self.holding {
            self.ctl.release_hold();
            self.holding = false;
            log::debug!("Released hold at t={}", self.stats.seq_time);
        }
    }

    /// Resets the shadow state and puts the hardware on hold.
    pub fn start(&mut self) {
        *self.state = CtrlState::default();
        self.stats = RunStats::default();
        self.ctl.set_hold();
        self.holding = true;
        self.origin = self.clock.now();
    }

    /// Issues one pulse, with the timing-check flag if enabled.
    pub fn pulse(&mut self, instr: Instruction) {
        self.ctl.pulse(instr, self.flags());
        self.stats.num_pulses += 1;
        self.advance(pulse_duration(instr.ctrl) as u64);
    }

    fn service(&mut self, max_num: usize) -> u64 {
        let t = self.ctl.write_requests(max_num, false, self.flags());
        self.stats.req_time += t;
        self.advance(t);
        t
    }

    fn emit_wait(&mut self, mut t: u64) {
        while t > 0 {
            let chunk = t.min(MAX_PULSE_T as u64);
            self.pulse(Instruction::wait(chunk as u32));
            t -= chunk;
        }
    }

    /// Waits `t` cycles, issuing queued requests from the idle time.
    pub fn run_wait(&mut self, t: u64) {
        let dds_t = DDS_T as u64;
        if t < dds_t {
            self.emit_wait(t);
            return;
        }
        if t < MEDIUM_WAIT {
            let mut t = t;
            self.state.wait_debt += t;
            if self.state.wait_debt >= WAIT_DEBT_LIMIT {
                self.state.wait_debt = 0;
                let max_num = (t / dds_t - 1).min(MAX_REQ_BATCH as u64) as usize;
                if max_num > 0 {
                    t -= self.service(max_num);
                }
            }
            self.emit_wait(t);
            return;
        }

        self.state.wait_debt = 0;
        let mut remaining = t;
        while remaining >= MEDIUM_WAIT {
            let mut spent = 0;
            while spent + MAX_REQ_BATCH as u64 * dds_t <= SERVICE_BUDGET {
                let t = self.service(MAX_REQ_BATCH);
                if t == 0 {
                    break;
                }
                spent += t;
            }
            if spent > 0 {
                remaining -= spent;
                continue;
            }
            if !self.paced {
                let slice = IDLE_SLICE.min(remaining);
                self.emit_wait(slice);
                remaining -= slice;
                self.clock.sleep(self.idle_sleep);
                continue;
            }
            let ahead = self.ahead();
            if ahead < self.max_ahead {
                let chunk = (self.max_ahead - ahead)
                    .min(MAX_PULSE_T as u64)
                    .max(IDLE_SLICE)
                    .min(remaining);
                self.emit_wait(chunk);
                remaining -= chunk;
            } else {
                // Far enough ahead, keep servicing requests while real time catches up
                self.clock.sleep(self.idle_sleep);
            }
        }
        self.emit_wait(remaining);
    }

    pub fn set_ttl(&mut self, ttl: u32) {
        self.state.curr_ttl = ttl;
        self.pulse(Instruction::ttl(ttl, TTL_T));
    }

    pub fn set_ttl_bit(&mut self, chn: u32, val: bool) {
        let curr = self.state.curr_ttl;
        let ttl = if val {
            curr | (1 << chn)
        } else {
            curr & !(1 << chn)
        };
        self.set_ttl(ttl);
    }

    pub fn set_dds_freq(&mut self, chn: u32, ftw: u32) {
        self.state.dds_freqs[chn as usize] = ftw;
        self.pulse(Instruction::dds_freq(chn, ftw));
    }

    pub fn set_dds_phase(&mut self, chn: u32, phase: u16) {
        self.state.dds_phases[chn as usize] = phase;
        self.pulse(Instruction::dds_phase(chn, phase));
    }

    /// Adds `delta` to the last phase written through this run.
    pub fn shift_dds_phase(&mut self, chn: u32, delta: u16) {
        let phase = self.state.dds_phases[chn as usize].wrapping_add(delta);
        self.set_dds_phase(chn, phase);
    }

    pub fn reset_dds(&mut self, chn: u32) {
        self.state.dds_phases[chn as usize] = 0;
        self.state.dds_freqs[chn as usize] = 0;
        self.pulse(Instruction::dds_reset(chn));
    }

    pub fn set_timing_check(&mut self, enable: bool) {
        self.state.timing_check = enable;
    }

    fn raw_pulse(&mut self, instr: Instruction) {
        match opcode(instr.ctrl) {
            OP_TTL => self.state.curr_ttl = instr.op,
            OP_DDS => {
                let chn = ((instr.ctrl >> 4) & 0x1F) as usize;
                match instr.ctrl & 0xF {
                    DDS_SET_FREQ => self.state.dds_freqs[chn] = instr.op,
                    DDS_SET_PHASE => self.state.dds_phases[chn] = instr.op as u16,
                    DDS_RESET => {
                        self.state.dds_freqs[chn] = 0;
                        self.state.dds_phases[chn] = 0;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        self.pulse(instr);
    }

    pub fn execute(&mut self, instr_type: InstrType) {
        match instr_type {
            InstrType::Pulse(instr) => self.raw_pulse(instr),
            InstrType::Wait(t) => self.run_wait(t),
            InstrType::DdsSetPhase { chn, phase } => self.set_dds_phase(chn, phase),
            InstrType::DdsShiftPhase { chn, delta } => self.shift_dds_phase(chn, delta),
            InstrType::DdsReset { chn } => self.reset_dds(chn),
            InstrType::TtlAll(ttl) => self.set_ttl(ttl),
            InstrType::TtlBit { chn, val } => self.set_ttl_bit(chn, val),
            InstrType::TimingCheck(enable) => self.set_timing_check(enable),
        }
    }

    /// Issues the epilogue, waits for the hardware to finish and collects the run statistics.
    pub fn finish(mut self) -> RunStats {
        self.pulse(Instruction::clock(1));
        self.pulse(Instruction::clock(255));
        self.run_wait(EPILOGUE_WAIT);
        self.pulse(Instruction::clear_timing_check());
        self.release_hold();

        let ctl = self.ctl.controller();
        ctl.pop_remaining();
        ctl.dump_notify();
        ctl.wait_finished();
        self.stats.timing_failed = ctl.driver().timing_failed();
        if self.stats.timing_failed {
            self.ctl.toggle_init();
        }
        log::debug!(
            "Run finished: {} pulses, {} cycles ({} serving requests)",
            self.stats.num_pulses,
            self.stats.seq_time,
            self.stats.req_time
        );
        self.stats
    }

    /// Validates `words`, then issues the whole stream followed by the epilogue.
    pub fn run_instructions(mut self, words: &[u32]) -> Result<RunStats, SeqError> {
        let instrs = validate(words)?;
        self.start();
        for instr_type in instrs {
            self.execute(instr_type);
        }
        Ok(self.finish())
    }

    pub fn run_program(self, program: &Program) -> Result<RunStats, SeqError> {
        self.run_instructions(program.words())
    }
}
