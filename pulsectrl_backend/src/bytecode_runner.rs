use pulsecompiler_backend::builder::ByteCode;
use pulsecompiler_backend::bytecode::{decode_all, ByteCodeOp};
use pulsecompiler_backend::error::SeqError;
use pulsecompiler_backend::instruction::Instruction;

use crate::controller::CtrlLocker;
use crate::driver::RegisterFile;
use crate::interpreter::{CtrlState, Interpreter, RunStats};
use crate::utils::Clock;

/// Executes byte-code programs, paced against the wall clock.
pub struct ByteCodeRunner<'a, 'c, R: RegisterFile, C: Clock> {
    interp: Interpreter<'a, 'c, R, C>,
}

impl<'a, 'c, R: RegisterFile, C: Clock> ByteCodeRunner<'a, 'c, R, C> {
    pub fn new(ctl: &'a CtrlLocker<'c, R>, state: &'a mut CtrlState, clock: &'a C) -> Self {
        ByteCodeRunner {
            interp: Interpreter::new(ctl, state, clock).paced(),
        }
    }

    fn execute(&mut self, op: ByteCodeOp) {
        let interp = &mut self.interp;
        match op {
            ByteCodeOp::TtlAll(ttl) => interp.set_ttl(ttl),
            ByteCodeOp::Ttl1 { chn, val } => interp.set_ttl_bit(chn, val),
            ByteCodeOp::Wait(t) => interp.run_wait(t),
            ByteCodeOp::Clock(period) => interp.pulse(Instruction::clock(period)),
            ByteCodeOp::DdsFreq { chn, ftw } => interp.set_dds_freq(chn, ftw),
            ByteCodeOp::DdsDetFreq { chn, delta } => {
                let ftw = interp.state().dds_freqs[chn as usize].wrapping_add(delta as u32);
                interp.set_dds_freq(chn, ftw);
            }
            ByteCodeOp::DdsAmp { chn, amp } => interp.pulse(Instruction::dds_amp(chn, amp)),
            ByteCodeOp::DdsPhase { chn, phase } => interp.set_dds_phase(chn, phase),
            ByteCodeOp::DdsDetPhase { chn, delta } => interp.shift_dds_phase(chn, delta),
            ByteCodeOp::DdsReset { chn } => interp.reset_dds(chn),
            ByteCodeOp::Dac { chn, val } => interp.pulse(Instruction::dac(chn, val)),
            ByteCodeOp::TimingCheck(enable) => interp.set_timing_check(enable),
        }
    }

    /// Decodes the whole buffer, then issues it followed by the epilogue.
    pub fn run(mut self, code: &[u8]) -> Result<RunStats, SeqError> {
        let ops = decode_all(code)?;
        self.interp.start();
        for op in ops {
            self.execute(op);
        }
        Ok(self.interp.finish())
    }

    pub fn run_bytecode(self, code: &ByteCode) -> Result<RunStats, SeqError> {
        self.run(code.bytes())
    }
}
