use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;

use pulsectrl_backend::*;

/// Clock advanced only by sleeping.
#[derive(Default)]
struct ManualClock {
    now: Mutex<Duration>,
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
    fn sleep(&self, dur: Duration) {
        *self.now.lock() += dur;
    }
}

/// Hardware time of the sequence epilogue.
const EPILOGUE_T: u64 = 2 * SHORT_T as u64 + EPILOGUE_WAIT + SHORT_T as u64;

fn controller() -> Arc<Controller<SimRegisters>> {
    Arc::new(Controller::new(
        Driver::new(SimRegisters::new()),
        CtrlConfig::default(),
    ))
}

fn sequencer() -> Sequencer<SimRegisters> {
    Sequencer::new(Driver::new(SimRegisters::new()), CtrlConfig::default()).unwrap()
}

fn push(ctl: &Controller<SimRegisters>, instr: Instruction) -> Arc<Request> {
    let req = Arc::new(ctl.new_request(instr));
    ctl.push_req(req.clone());
    req
}

fn simple_program() -> Program {
    let mut builder = BlockBuilder::new();
    builder.ttl(0b1, 0).unwrap();
    builder.ttl(0b0, 1000).unwrap();
    builder.finish()
}

#[test]
fn request_completes_once() {
    let ctl = controller();
    let req = push(&ctl, Instruction::loopback(5));
    assert!(!req.is_ready());

    assert_eq!(ctl.lock().write_requests(MAX_REQ_BATCH, true, 0), SHORT_T as u64);
    // Issued but not read back yet
    assert!(!req.is_ready());
    assert_eq!(ctl.in_flight(), 1);

    assert_eq!(ctl.pop_results(), 1);
    assert!(req.is_ready());
    assert_eq!(req.res(), 5);
    ctl.wait(&req);
    assert_eq!(ctl.in_flight(), 0);
}

#[test]
#[should_panic(expected = "completed twice")]
fn request_completed_twice() {
    let ctl = controller();
    let req = ctl.new_request(Instruction::loopback(0));
    ctl.set_res(&req, 1);
    ctl.set_res(&req, 2);
}

#[test]
#[should_panic(expected = "cannot be submitted as a request")]
fn meta_request_rejected() {
    let ctl = controller();
    push(&ctl, Instruction::meta_wait(10));
}

#[test]
#[should_panic(expected = "submit it as a request")]
fn result_pulse_needs_request() {
    let ctl = controller();
    ctl.run(Instruction::loopback(1).ctrl, 1);
}

#[test]
fn write_only_requests() {
    let ctl = controller();
    let from_writer = push(&ctl, Instruction::dds_freq(1, 77));
    ctl.lock().write_requests(MAX_REQ_BATCH, true, 0);
    assert!(from_writer.is_ready());

    let from_sequence = push(&ctl, Instruction::dds_freq(2, 78));
    ctl.lock().write_requests(MAX_REQ_BATCH, false, 0);
    assert!(!from_sequence.is_ready());
    assert_eq!(ctl.dump_notify(), 1);
    assert!(from_sequence.is_ready());

    assert_eq!(ctl.driver().regs().dds_freq(1), 77);
    assert_eq!(ctl.driver().regs().dds_freq(2), 78);
    assert_eq!(ctl.in_flight(), 0);
}

#[test]
fn result_space_limits_writes() {
    let ctl = controller();
    let reqs: Vec<_> = (0..40)
        .map(|i| push(&ctl, Instruction::loopback(i)))
        .collect();
    {
        let locker = ctl.lock();
        for _ in 0..3 {
            locker.write_requests(MAX_REQ_BATCH, true, 0);
            assert!(ctl.in_flight() <= MAX_IN_FLIGHT as u64);
        }
        assert_eq!(ctl.in_flight(), MAX_IN_FLIGHT as u64);
        assert_eq!(ctl.res_buff_space(), 0);
        assert_eq!(locker.write_requests(MAX_REQ_BATCH, true, 0), 0);
    }
    assert_eq!(ctl.driver().regs().dropped_results(), 0);

    assert_eq!(ctl.pop_results(), MAX_IN_FLIGHT as usize);
    ctl.lock().write_requests(MAX_REQ_BATCH, true, 0);
    ctl.pop_remaining();
    for (i, req) in reqs.iter().enumerate() {
        assert!(req.is_ready());
        assert_eq!(req.res(), i as u32);
    }
}

#[test]
fn dds_round_trip() {
    let seq = sequencer();
    let ctl = seq.controller();
    for chn in [0u32, 5, 21] {
        let ftw = 0x1234_5678u32.wrapping_mul(chn + 1);
        ctl.lock().dds_set_freq(chn, ftw).unwrap();
        assert_eq!(ctl.dds_get_freq(chn), Ok(ftw));
    }
    ctl.lock().dds_set_phase(3, 0xBEEF).unwrap();
    assert_eq!(ctl.dds_get_phase(3), Ok(0xBEEF));
    ctl.lock().dds_set_amp(3, 0x0ABC).unwrap();
    assert_eq!(ctl.dds_get_amp(3), Ok(0x0ABC));
    ctl.lock().dds_set_four_bytes(4, 0x40, 0xCAFE_F00D).unwrap();
    assert_eq!(ctl.dds_get_four_bytes(4, 0x40), Ok(0xCAFE_F00D));
    assert_eq!(ctl.dds_get_two_bytes(4, 0x42), Ok(0xCAFE));

    // Write-only requests go through the writer and complete with 0
    assert_eq!(ctl.req_sync(ctl.new_request(Instruction::dds_freq(7, 99))), 0);
    assert_eq!(ctl.dds_get_freq(7), Ok(99));
    ctl.lock().dds_reset(7).unwrap();
    assert_eq!(ctl.dds_get_freq(7), Ok(0));
}

#[test]
fn invalid_channels_rejected() {
    let seq = sequencer();
    let ctl = seq.controller();
    for chn in [NUM_DDS as u32, 31, 33] {
        assert_eq!(
            ctl.dds_get_freq(chn),
            Err(SeqError::InvalidChannel {
                kind: "dds",
                chn,
                max: NUM_DDS as u32
            })
        );
        assert!(ctl.lock().dds_set_freq(chn, 0xAAAA).is_err());
    }
    assert!(ctl.dds_get_amp(22).is_err());
    assert!(ctl.dds_get_phase(40).is_err());
    assert!(ctl.dds_get_two_bytes(22, 0).is_err());
    assert!(ctl.dds_get_four_bytes(22, 0).is_err());
    assert!(ctl.lock().dds_reset(22).is_err());
    assert!(ctl.lock().dds_set_phase(22, 1).is_err());
    assert!(ctl.lock().dds_set_two_bytes(22, 0, 1).is_err());
    assert!(ctl.lock().dds_set_four_bytes(22, 0, 1).is_err());
    assert!(matches!(
        ctl.lock().dac(NUM_DAC as u32, 1),
        Err(SeqError::InvalidChannel { kind: "dac", .. })
    ));
    assert_eq!(ctl.num_written(), 0);
    // Channel 33 did not alias channel 1
    assert_eq!(ctl.driver().regs().dds_freq(1), 0);

    // Nothing was left in flight, so valid queries still get their own results
    ctl.lock().dds_set_freq(1, 0xAAAA).unwrap();
    assert_eq!(ctl.dds_get_freq(1), Ok(0xAAAA));
    assert_eq!(ctl.loopback(9), 9);
    assert_eq!(ctl.in_flight(), 0);
}

#[test]
#[should_panic(expected = "Invalid request")]
fn invalid_channel_request_rejected() {
    let ctl = controller();
    push(&ctl, Instruction::dds_get_freq(NUM_DDS as u32));
}

#[test]
#[should_panic(expected = "no pending request")]
fn unmatched_result_panics() {
    let ctl = controller();
    // A result the controller never asked for
    let instr = Instruction::loopback(7);
    ctl.driver().short_pulse(instr.ctrl, instr.op);
    ctl.pop_results();
}

#[test]
fn sequential_loopbacks() {
    let seq = sequencer();
    let ctl = seq.controller();
    for i in 0..1024 {
        assert_eq!(ctl.loopback(i), i);
    }
    assert_eq!(ctl.num_read(), 1024);
}

#[test]
fn concurrent_loopbacks() {
    let seq = sequencer();
    let ctl = seq.controller();
    thread::scope(|s| {
        for t in 0..4u32 {
            s.spawn(move || {
                for i in 0..1024u32 {
                    let val = (t << 16) | i;
                    assert_eq!(ctl.loopback(val), val);
                }
            });
        }
    });
    assert_eq!(ctl.num_read(), 4 * 1024);
    assert_eq!(ctl.in_flight(), 0);
    assert_eq!(ctl.driver().regs().dropped_results(), 0);
}

#[test]
fn query_during_long_wait() {
    let seq = sequencer();
    let ctl = seq.controller();
    let mut builder = BlockBuilder::new();
    builder.ttl(0b1, 0).unwrap();
    builder.wait_until(2_000_003).unwrap();
    let program = builder.finish();

    thread::scope(|s| {
        let run = s.spawn(|| seq.run_program(&program).unwrap());
        // The first pulse is only issued once the sequence holds the lock
        while ctl.driver().regs().num_pulses() == 0 {
            thread::yield_now();
        }
        let status = ctl.status();
        assert_eq!(status & STATUS_TIMING_ERROR, 0);
        assert_eq!(ctl.loopback(0x55), 0x55);

        let stats = run.join().unwrap();
        // Serviced from the wait, without changing the sequence length
        assert_eq!(stats.req_time, SHORT_T as u64);
        assert_eq!(stats.seq_time, program.total_time() + EPILOGUE_T);
    });
    assert_eq!(ctl.driver().regs().elapsed(), 2_000_003 + EPILOGUE_T);
}

#[test]
fn medium_wait_serves_requests() {
    let ctl = controller();
    let reqs: Vec<_> = (0..3)
        .map(|i| push(&ctl, Instruction::loopback(i)))
        .collect();
    let clock = ManualClock::default();
    let mut state = CtrlState {
        timing_check: false,
        ..Default::default()
    };
    {
        let locker = ctl.lock();
        let mut interp = Interpreter::new(&locker, &mut state, &clock);
        interp.run_wait(5000);
        assert_eq!(interp.stats().req_time, 3 * SHORT_T as u64);
    }
    let pulses = ctl.driver().regs().take_pulses();
    assert_eq!(pulses.len(), 4);
    assert_eq!(pulses[3], Instruction::wait(5000 - 3 * SHORT_T));
    ctl.pop_remaining();
    assert!(reqs.iter().all(|req| req.is_ready()));
}

#[test]
fn short_wait_is_single_pulse() {
    let ctl = controller();
    push(&ctl, Instruction::loopback(0));
    let clock = ManualClock::default();
    let mut state = CtrlState {
        timing_check: false,
        ..Default::default()
    };
    {
        let locker = ctl.lock();
        Interpreter::new(&locker, &mut state, &clock).run_wait(DDS_T as u64 - 1);
    }
    assert_eq!(
        ctl.driver().regs().take_pulses(),
        vec![Instruction::wait(DDS_T - 1)]
    );
    assert_eq!(ctl.num_written(), 0);
}

#[test]
fn paced_wait_stays_near_wall_clock() {
    let ctl = controller();
    let clock = ManualClock::default();
    let mut state = CtrlState::default();
    let t = 120_000_000;
    {
        let locker = ctl.lock();
        let mut interp = Interpreter::new(&locker, &mut state, &clock).paced();
        interp.start();
        interp.run_wait(t);
        assert_eq!(interp.stats().seq_time, t);
    }
    let max_ahead = duration_to_cycles(CtrlConfig::default().max_ahead);
    assert!(duration_to_cycles(clock.now()) + max_ahead + 2 * MEDIUM_WAIT >= t);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn wait_durations_add_up(
        t in 1u64..5_000_000,
        num_loopbacks in 0u32..40,
        num_writes in 0u32..20,
        paced in any::<bool>(),
    ) {
        let ctl = controller();
        for i in 0..num_loopbacks {
            push(&ctl, Instruction::loopback(i));
        }
        for i in 0..num_writes {
            push(&ctl, Instruction::dac(i % 4, i as u16));
        }
        let clock = ManualClock::default();
        let mut state = CtrlState::default();
        {
            let locker = ctl.lock();
            let mut interp = Interpreter::new(&locker, &mut state, &clock);
            if paced {
                interp = interp.paced();
            }
            interp.run_wait(t);
            prop_assert_eq!(interp.stats().seq_time, t);
        }
        prop_assert_eq!(ctl.driver().regs().elapsed(), t);
        prop_assert!(ctl.in_flight() <= MAX_IN_FLIGHT as u64);
    }
}

#[test]
fn program_shadow_state() {
    let seq = sequencer();
    let mut builder = BlockBuilder::new();
    builder.ttl(0b1000, 0).unwrap();
    builder.ttl_bit(0, true, 10).unwrap();
    builder.dds_freq(2, 1000, 20).unwrap();
    builder.dds_phase(2, 0xF000, 100).unwrap();
    builder.dds_shift_phase(2, 0x2000, 200).unwrap();
    builder.dac(1, 0x8000, 300).unwrap();
    let program = builder.finish();

    let stats = seq.run_program(&program).unwrap();
    assert_eq!(stats.seq_time, program.total_time() + EPILOGUE_T);
    assert!(!stats.timing_failed);

    let sim = seq.controller().driver().regs();
    assert_eq!(sim.ttl(), 0b1001);
    assert_eq!(sim.dds_freq(2), 1000);
    assert_eq!(sim.dds_phase(2), 0x1000);
    assert_eq!(sim.dac(1), 0x8000);
    // Clock output left off by the epilogue
    assert_eq!(sim.clock_div(), 255);
    assert!(sim.take_pulses().iter().any(|p| p.ctrl & TIMING_CHECK != 0));
}

#[test]
fn bytecode_run() {
    let seq = sequencer();
    let mut builder = ByteCodeBuilder::new();
    builder.ttl(0, 0).unwrap();
    builder.dds_freq(1, 5000, 10).unwrap();
    builder.dds_det_freq(1, -300, 100).unwrap();
    builder.dds_phase(1, 0x100, 200).unwrap();
    builder.dds_shift_phase(1, 0x10, 300).unwrap();
    builder.ttl_bit(31, true, 400).unwrap();
    builder.clock(4, 500).unwrap();
    builder.wait_until(1_000_000).unwrap();
    let code = builder.finish();

    let stats = seq.run_bytecode(&code).unwrap();
    assert_eq!(stats.seq_time, code.total_time() + EPILOGUE_T);

    let sim = seq.controller().driver().regs();
    assert_eq!(sim.dds_freq(1), 4700);
    assert_eq!(sim.dds_phase(1), 0x110);
    assert_eq!(sim.ttl(), 1 << 31);
}

#[test]
fn timing_failures_counted() {
    let seq = sequencer();
    let sim = seq.controller().driver().regs();
    sim.inject_timing_error();
    let stats = seq.run_program(&simple_program()).unwrap();
    assert!(stats.timing_failed);
    assert_eq!(seq.timing_failures(), 1);
    // Cleared for the next run
    assert!(!seq.controller().driver().timing_failed());

    let stats = seq.run_program(&simple_program()).unwrap();
    assert!(!stats.timing_failed);
    assert_eq!(seq.timing_failures(), 1);
}

#[test]
fn timing_check_disabled() {
    let seq = sequencer();
    let mut builder = BlockBuilder::new();
    builder.timing_check(false);
    builder.ttl(0b1, 0).unwrap();
    builder.ttl(0b0, 1000).unwrap();
    let program = builder.finish();

    seq.controller().driver().regs().inject_timing_error();
    let stats = seq.run_program(&program).unwrap();
    assert!(!stats.timing_failed);
    assert_eq!(seq.timing_failures(), 0);
    let pulses = seq.controller().driver().regs().take_pulses();
    assert!(pulses.iter().all(|p| p.ctrl & TIMING_CHECK == 0));
}

#[test]
fn invalid_streams_rejected_before_issue() {
    let seq = sequencer();
    let sim = seq.controller().driver().regs();

    assert_eq!(
        seq.run_instructions(&[0, 1, 2]),
        Err(SeqError::OddLength { len: 3 })
    );
    assert_eq!(
        seq.run_instructions(&[3, 1, 0xF700_0000, 0]),
        Err(SeqError::AtInstruction {
            index: 1,
            source: Box::new(SeqError::UnknownOpcode { ctrl: 0xF700_0000 })
        })
    );
    let loopback = Instruction::loopback(1);
    assert!(matches!(
        seq.run_instructions(&[loopback.ctrl, loopback.op]),
        Err(SeqError::AtInstruction { index: 0, .. })
    ));
    assert_eq!(sim.num_pulses(), 0);

    let valid = ByteCode::from_bytes(vec![BC_TTL_ALL, 1, 0, 0, 0]).unwrap();
    assert!(seq.run_bytecode(&valid).is_ok());
    let pulses_after_valid = sim.num_pulses();
    assert!(matches!(
        ByteCode::from_bytes(vec![BC_DDS_AMP, 30, 0, 0]),
        Err(SeqError::InvalidChannel { chn: 30, .. })
    ));
    assert!(matches!(
        ByteCode::from_bytes(vec![BC_DDS_FREQ, 1, 0, 0]),
        Err(SeqError::Truncated { offset: 0 })
    ));

    // Only the valid byte-code run touched the hardware
    assert!(pulses_after_valid > 0);
    assert_eq!(sim.num_pulses(), pulses_after_valid);
    assert_eq!(seq.timing_failures(), 0);
}

#[test]
fn controller_masks_and_reset() {
    let ctl = controller();
    {
        let locker = ctl.lock();
        locker.set_ttl_high_mask(0xF0);
        locker.set_ttl_low_mask(0x0F);
    }
    assert_eq!(ctl.ttl_high_mask(), 0xF0);
    assert_eq!(ctl.ttl_low_mask(), 0x0F);
    ctl.driver().reset();
    assert_eq!(ctl.ttl_high_mask(), 0);
}
