//! A software model of the pulse controller register file.
//!
//! [`SimRegisters`] executes instructions as soon as their control word is latched: it keeps the
//! TTL, DDS, DAC and clock output state, echoes loop-back operands into a 32-deep result FIFO,
//! and accumulates the hardware time the executed pulses would take. Pulses are logged so that
//! tests can inspect exactly what was issued.
//!
//! Buffer underflow cannot happen in the model; [`SimRegisters::inject_timing_error`] arms a
//! failure that latches on the next pulse issued with the timing-check flag.

use std::collections::VecDeque;

use parking_lot::Mutex;

use pulsecompiler_backend::channel::{NUM_DAC, NUM_DDS};
use pulsecompiler_backend::instruction::*;

use crate::driver::*;

/// Size of each simulated DDS register bank, in bytes.
pub const DDS_BANK_SIZE: usize = 0x80;
pub const DDS_FREQ_ADDR: u32 = 0x2C;
pub const DDS_PHASE_ADDR: u32 = 0x30;
pub const DDS_AMP_ADDR: u32 = 0x32;

struct SimState {
    regs: [u32; NUM_REGS],
    latched_op: Option<u32>,
    results: VecDeque<u32>,
    dropped_results: usize,
    dds: Vec<[u8; DDS_BANK_SIZE]>,
    dac: [u16; NUM_DAC],
    ttl: u32,
    clock_div: u8,
    timing_error: bool,
    underflow_armed: bool,
    pulses: Vec<Instruction>,
    elapsed: u64,
    resets: usize,
}

impl SimState {
    fn new() -> Self {
        SimState {
            regs: [0; NUM_REGS],
            latched_op: None,
            results: VecDeque::new(),
            dropped_results: 0,
            dds: vec![[0; DDS_BANK_SIZE]; NUM_DDS],
            dac: [0; NUM_DAC],
            ttl: 0,
            clock_div: 255,
            timing_error: false,
            underflow_armed: false,
            pulses: Vec::new(),
            elapsed: 0,
            resets: 0,
        }
    }

    fn status(&self) -> u32 {
        let count = (self.results.len() as u32).min(STATUS_RESULTS_MASK);
        let mut status = count << STATUS_RESULTS_SHIFT;
        if self.timing_error {
            status |= STATUS_TIMING_ERROR;
        }
        if self.regs[REG_CTRL] & CTRL_HOLD == 0 {
            status |= STATUS_FINISHED;
        }
        status
    }

    fn push_result(&mut self, res: u32) {
        if self.results.len() < RESULT_FIFO_DEPTH as usize {
            self.results.push_back(res);
        } else {
            log::warn!("Simulated result FIFO overflow, dropping 0x{:08x}", res);
            self.dropped_results += 1;
        }
    }

    fn dds_read(&self, chn: usize, addr: u32, nbytes: usize) -> u32 {
        (0..nbytes).fold(0, |acc, i| {
            let byte = self.dds[chn][(addr as usize + i) % DDS_BANK_SIZE];
            acc | (byte as u32) << (8 * i)
        })
    }

    fn dds_write(&mut self, chn: usize, addr: u32, nbytes: usize, val: u32) {
        for i in 0..nbytes {
            self.dds[chn][(addr as usize + i) % DDS_BANK_SIZE] = (val >> (8 * i)) as u8;
        }
    }

    fn execute(&mut self, ctrl: u32, op: u32) {
        self.pulses.push(Instruction::new(ctrl, op));
        self.elapsed += pulse_duration(ctrl) as u64;
        if ctrl & TIMING_CHECK != 0 && self.underflow_armed {
            self.underflow_armed = false;
            self.timing_error = true;
        }
        match opcode(ctrl) {
            OP_TTL => self.ttl = op,
            OP_WAIT | OP_CLEAR_TIMING => {}
            OP_LOOPBACK => self.push_result(op),
            OP_CLOCK => self.clock_div = op as u8,
            OP_DAC => self.dac[((ctrl >> 4) & 0x3) as usize] = op as u16,
            OP_DDS => self.execute_dds(ctrl, op),
            _ => log::warn!("Simulated controller ignoring instruction 0x{:08x}", ctrl),
        }
    }

    fn execute_dds(&mut self, ctrl: u32, op: u32) {
        let chn = ((ctrl >> 4) & 0x1F) as usize;
        let addr = (ctrl >> 9) & 0x7F;
        if chn >= NUM_DDS {
            log::warn!("Simulated controller ignoring DDS channel {}", chn);
            // Queries still produce a result word
            if has_result(ctrl) {
                self.push_result(0);
            }
            return;
        }
        match ctrl & 0xF {
            DDS_SET_FREQ => self.dds_write(chn, DDS_FREQ_ADDR, 4, op),
            DDS_SET_AMP => self.dds_write(chn, DDS_AMP_ADDR, 2, op & 0xFFF),
            DDS_SET_PHASE => self.dds_write(chn, DDS_PHASE_ADDR, 2, op),
            DDS_RESET => self.dds[chn] = [0; DDS_BANK_SIZE],
            DDS_GET_FREQ => self.push_result(self.dds_read(chn, DDS_FREQ_ADDR, 4)),
            DDS_GET_AMP => self.push_result(self.dds_read(chn, DDS_AMP_ADDR, 2)),
            DDS_GET_PHASE => self.push_result(self.dds_read(chn, DDS_PHASE_ADDR, 2)),
            DDS_GET_TWO_BYTES => self.push_result(self.dds_read(chn, addr, 2)),
            DDS_GET_FOUR_BYTES => self.push_result(self.dds_read(chn, addr, 4)),
            DDS_SET_TWO_BYTES => self.dds_write(chn, addr, 2, op),
            DDS_SET_FOUR_BYTES => self.dds_write(chn, addr, 4, op),
            sub => log::warn!("Simulated controller ignoring DDS sub-opcode {}", sub),
        }
    }
}

/// Simulated pulse controller register file.
pub struct SimRegisters {
    state: Mutex<SimState>,
}

impl Default for SimRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRegisters {
    pub fn new() -> Self {
        SimRegisters {
            state: Mutex::new(SimState::new()),
        }
    }

    /// Makes the next pulse issued with the timing-check flag latch a timing error.
    pub fn inject_timing_error(&self) {
        self.state.lock().underflow_armed = true;
    }

    /// Hardware time consumed by all executed pulses, in cycles.
    pub fn elapsed(&self) -> u64 {
        self.state.lock().elapsed
    }

    pub fn num_pulses(&self) -> usize {
        self.state.lock().pulses.len()
    }

    /// Removes and returns the log of executed pulses.
    pub fn take_pulses(&self) -> Vec<Instruction> {
        std::mem::take(&mut self.state.lock().pulses)
    }

    /// Results dropped because the result FIFO was full.
    pub fn dropped_results(&self) -> usize {
        self.state.lock().dropped_results
    }

    pub fn ttl(&self) -> u32 {
        self.state.lock().ttl
    }
    pub fn clock_div(&self) -> u8 {
        self.state.lock().clock_div
    }
    pub fn dac(&self, chn: usize) -> u16 {
        self.state.lock().dac[chn]
    }
    pub fn dds_freq(&self, chn: usize) -> u32 {
        self.state.lock().dds_read(chn, DDS_FREQ_ADDR, 4)
    }
    pub fn dds_phase(&self, chn: usize) -> u16 {
        self.state.lock().dds_read(chn, DDS_PHASE_ADDR, 2) as u16
    }
    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }
}

impl RegisterFile for SimRegisters {
    fn read(&self, offset: usize) -> u32 {
        let mut state = self.state.lock();
        match offset / 4 {
            REG_STATUS => state.status(),
            REG_FIFO => state.results.pop_front().unwrap_or(0),
            n if n < NUM_REGS => state.regs[n],
            _ => 0,
        }
    }

    fn write(&self, offset: usize, val: u32) {
        let mut state = self.state.lock();
        if offset == RESET_OFFSET {
            if val == RESET_MAGIC {
                let resets = state.resets + 1;
                *state = SimState::new();
                state.resets = resets;
            }
            return;
        }
        match offset / 4 {
            REG_FIFO => match state.latched_op.take() {
                None => state.latched_op = Some(val),
                Some(op) => state.execute(val, op),
            },
            REG_CTRL => {
                let prev = state.regs[REG_CTRL];
                if val & CTRL_TOGGLE_INIT != 0 && prev & CTRL_TOGGLE_INIT == 0 {
                    state.timing_error = false;
                }
                state.regs[REG_CTRL] = val;
            }
            REG_STATUS => {}
            n if n < NUM_REGS => state.regs[n] = val,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_phase_latch() {
        let driver = Driver::new(SimRegisters::new());
        driver.write_reg(REG_FIFO, 0xABCD);
        assert_eq!(driver.regs().num_pulses(), 0);
        driver.write_reg(REG_FIFO, Instruction::loopback(0).ctrl);
        assert_eq!(driver.num_results(), 1);
        assert_eq!(driver.pop_result(), 0xABCD);
        assert_eq!(driver.num_results(), 0);
    }

    #[test]
    fn dds_bank_access() {
        let driver = Driver::new(SimRegisters::new());
        let set = Instruction::dds_set_four_bytes(3, 0x10, 0xDEAD_BEEF);
        driver.short_pulse(set.ctrl, set.op);
        let get = Instruction::dds_get_two_bytes(3, 0x12);
        driver.short_pulse(get.ctrl, get.op);
        assert_eq!(driver.pop_result(), 0xDEAD);
        let freq = Instruction::dds_freq(3, 1234);
        driver.short_pulse(freq.ctrl, freq.op);
        assert_eq!(driver.regs().dds_freq(3), 1234);
        assert_eq!(driver.regs().elapsed(), 2 * DDS_T as u64 + DDS_T as u64);
    }

    #[test]
    fn result_fifo_overflow_drops() {
        let driver = Driver::new(SimRegisters::new());
        for i in 0..(RESULT_FIFO_DEPTH + 2) {
            let instr = Instruction::loopback(i);
            driver.short_pulse(instr.ctrl, instr.op);
        }
        // The count field saturates below the FIFO depth
        assert_eq!(driver.num_results(), STATUS_RESULTS_MASK);
        assert_eq!(driver.regs().dropped_results(), 2);
    }

    #[test]
    fn unknown_dds_channel_query() {
        let driver = Driver::new(SimRegisters::new());
        let get = Instruction::dds_get_freq(NUM_DDS as u32);
        driver.short_pulse(get.ctrl, get.op);
        assert_eq!(driver.num_results(), 1);
        assert_eq!(driver.pop_result(), 0);
    }

    #[test]
    fn hold_and_timing_error() {
        let driver = Driver::new(SimRegisters::new());
        assert!(driver.is_finished());
        driver.set_hold();
        assert!(!driver.is_finished());
        driver.regs().inject_timing_error();
        let ttl = Instruction::ttl(1, TTL_T);
        driver.short_pulse(ttl.ctrl, ttl.op);
        assert!(!driver.timing_failed());
        driver.short_pulse(ttl.ctrl | TIMING_CHECK, ttl.op);
        assert!(driver.timing_failed());
        driver.release_hold();
        driver.toggle_init();
        assert!(!driver.timing_failed());
        assert!(driver.is_finished());
        assert_eq!(driver.regs().ttl(), 1);
    }

    #[test]
    fn software_reset() {
        let driver = Driver::new(SimRegisters::new());
        driver.set_ttl_high_mask(0xF0);
        driver.reset();
        assert_eq!(driver.ttl_high_mask(), 0);
        assert_eq!(driver.regs().resets(), 1);
    }
}
