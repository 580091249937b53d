use pulsecompiler_backend::*;

#[test]
fn ttl_edge_spacing() {
    let mut builder = BlockBuilder::new();
    builder.ttl(0b1, 0).unwrap();
    // A TTL change needs the pulse time plus the edge settle time
    assert_eq!(
        builder.ttl(0b0, 4),
        Err(SeqError::TooEarly { t: 4, earliest: 5 })
    );
    builder.ttl(0b0, 5).unwrap();
    // Rewriting the same word only needs the pulse time
    builder.ttl(0b0, 8).unwrap();
    assert_eq!(builder.end_time(), 11);
}

#[test]
fn ttl_change_after_padding() {
    let mut builder = BlockBuilder::new();
    builder.ttl(0b1, 0).unwrap();
    builder.wait_until(1000).unwrap();
    // The edge time counts from the TTL pulse, not from the padding
    builder.ttl(0b0, 1000).unwrap();
    assert_eq!(builder.end_time(), 1003);

    let mut builder = ByteCodeBuilder::new();
    builder.ttl(0b1, 0).unwrap();
    builder.wait_until(4).unwrap();
    // Padding shorter than the edge time does not lift it
    assert_eq!(
        builder.ttl(0b0, 4),
        Err(SeqError::TooEarly { t: 4, earliest: 5 })
    );
    builder.ttl_after(0b0, 0).unwrap();
    assert_eq!(builder.end_time(), 8);
}

#[test]
fn dds_spacing() {
    let mut builder = BlockBuilder::new();
    builder.ttl(0, 0).unwrap();
    builder.dds_freq(0, 100, 3).unwrap();
    assert_eq!(
        builder.dds_amp(1, 10, 52),
        Err(SeqError::TooEarly { t: 52, earliest: 53 })
    );
    builder.dds_amp(1, 10, 53).unwrap();
    builder.dac_after(0, 0x8000, 0).unwrap();
    assert_eq!(builder.end_time(), 53 + DDS_T as u64 + DAC_T as u64);
}

#[test]
fn missing_initial_ttl() {
    let mut builder = BlockBuilder::new();
    assert_eq!(
        builder.dds_freq(0, 1, 0),
        Err(SeqError::MissingInitialTtl {
            what: "dds_freq",
            t: 0
        })
    );
    let mut builder = ByteCodeBuilder::new();
    assert!(builder.ttl_bit(0, true, 0).is_err());
    builder.ttl(0, 0).unwrap();
    builder.ttl_bit(0, true, 10).unwrap();
}

#[test]
fn invalid_channels() {
    let mut builder = BlockBuilder::new();
    builder.ttl(0, 0).unwrap();
    assert_eq!(
        builder.dds_amp(22, 1, 10),
        Err(SeqError::InvalidChannel {
            kind: "dds",
            chn: 22,
            max: 22
        })
    );
    assert!(builder.dac(4, 0, 10).is_err());
    assert!(builder.ttl_bit(32, true, 10).is_err());
    // Rejected pulses leave the program untouched
    assert_eq!(builder.end_time(), 3);
}

#[test]
fn channel_names() {
    let chan: Channel = "ttl31".parse().unwrap();
    assert_eq!(chan.kind(), ChannelKind::TTL);
    assert_eq!(chan.to_string(), "ttl31");
    assert!("ttl32".parse::<Channel>().is_err());
    assert!("dac".parse::<Channel>().is_err());
    assert!(matches!(
        "PXI1Slot6/port0".parse::<Channel>(),
        Err(SeqError::ChannelName { .. })
    ));
}

#[test]
fn block_program_contents() {
    let mut builder = BlockBuilder::new();
    builder.ttl(0b1, 0).unwrap();
    builder.ttl_bit(2, true, 100).unwrap();
    let program = builder.finish();

    assert_eq!(program.len(), 3);
    assert_eq!(program.total_time(), 103);
    let instrs: Vec<_> = program.instructions().collect();
    assert_eq!(
        instrs,
        vec![
            Instruction::meta_ttl_all(0b1),
            Instruction::meta_wait(97),
            Instruction::meta_ttl_bit(2, true),
        ]
    );
    let counts = program.pulse_counts();
    assert_eq!(counts.keys().copied().collect::<Vec<_>>(), vec!["ttl", "wait"]);
    assert_eq!(counts["ttl"], 2);

    // The word stream validates and re-derives the same total time
    let reparsed = Program::from_words(program.words().to_vec()).unwrap();
    assert_eq!(reparsed, program);
}

#[test]
fn program_from_words_errors() {
    assert_eq!(
        Program::from_words(vec![0, 1, 2]),
        Err(SeqError::OddLength { len: 3 })
    );
    let err = Program::from_words(vec![0, 1, 0x7000_0000, 0]).unwrap_err();
    assert_eq!(
        err,
        SeqError::AtInstruction {
            index: 1,
            source: Box::new(SeqError::UnknownOpcode { ctrl: 0x7000_0000 })
        }
    );
    // Meta DDS phase on a channel that does not exist
    let bad = Instruction::meta_dds_phase(25, 0);
    assert!(Program::from_words(vec![bad.ctrl, bad.op]).is_err());
    // Pulses producing a result cannot be part of a program
    let query = Instruction::dds_get_freq(3);
    assert_eq!(
        Program::from_words(vec![0, 1, query.ctrl, query.op]),
        Err(SeqError::AtInstruction {
            index: 1,
            source: Box::new(SeqError::ResultInSequence { ctrl: query.ctrl })
        })
    );
    assert!(Program::from_words(Vec::new()).unwrap().is_empty());
}

#[test]
fn long_waits_are_split() {
    let mut builder = BlockBuilder::new();
    builder.ttl(0, 0).unwrap();
    builder.wait_until(MAX_META_WAIT + 10).unwrap();
    let program = builder.finish();
    let waits: Vec<_> = program
        .instructions()
        .filter_map(|instr| match instr.decode().unwrap() {
            InstrType::Wait(t) => Some(t),
            _ => None,
        })
        .collect();
    assert_eq!(waits, vec![MAX_META_WAIT, 7]);
    assert_eq!(program.total_time(), MAX_META_WAIT + 10);
}

#[test]
fn timing_check_toggles_once() {
    let mut builder = BlockBuilder::new();
    builder.ttl(0, 0).unwrap();
    builder.timing_check(true);
    builder.timing_check(false);
    builder.timing_check(false);
    let program = builder.finish();
    assert_eq!(program.len(), 2);
    assert_eq!(
        program.instructions().nth(1).unwrap().decode().unwrap(),
        InstrType::TimingCheck(false)
    );
}

#[test]
fn bytecode_builder() {
    let mut builder = ByteCodeBuilder::new();
    builder.ttl(0b1, 0).unwrap();
    builder.ttl_bit(2, true, 100).unwrap();
    builder.dds_freq(1, 1000, 110).unwrap();
    builder.dds_det_freq(1, -10, 200).unwrap();
    builder.dds_reset(1, 250).unwrap();
    builder.clock(10, 300).unwrap();
    let code = builder.finish();
    assert_eq!(code.total_time(), 305);
    assert_eq!(&code.bytes()[..9], &[0x00, 1, 0, 0, 0, 0x12, 97, 0x11, 2]);

    let ops = decode_all(code.bytes()).unwrap();
    assert_eq!(
        ops,
        vec![
            ByteCodeOp::TtlAll(1),
            ByteCodeOp::Wait(97),
            ByteCodeOp::Ttl1 { chn: 2, val: true },
            ByteCodeOp::Wait(7),
            ByteCodeOp::DdsFreq { chn: 1, ftw: 1000 },
            ByteCodeOp::Wait(40),
            ByteCodeOp::DdsDetFreq { chn: 1, delta: -10 },
            ByteCodeOp::DdsReset { chn: 1 },
            ByteCodeOp::Clock(10),
        ]
    );
    let total: u64 = ops.iter().map(|op| op.duration()).sum();
    assert_eq!(total, code.total_time());
    assert_eq!(ByteCode::from_bytes(code.bytes().to_vec()).unwrap(), code);
}

#[test]
fn bytecode_decode_errors() {
    assert_eq!(
        ByteCode::from_bytes(vec![0x0C]),
        Err(SeqError::UnknownByteCode { op: 12, offset: 0 })
    );
    assert_eq!(
        ByteCode::from_bytes(vec![0x03, 1, BC_DDS_FREQ, 3]),
        Err(SeqError::Truncated { offset: 2 })
    );
    assert_eq!(
        ByteCode::from_bytes(vec![BC_WAIT]),
        Err(SeqError::WaitLength { len: 0, offset: 0 })
    );
    assert!(matches!(
        ByteCode::from_bytes(vec![0x11, 40]),
        Err(SeqError::InvalidChannel { kind: "ttl", .. })
    ));

    // The reader stops after the first error
    let mut reader = ByteCodeReader::new(&[0x0C, 0x03, 1]);
    assert!(reader.next().unwrap().is_err());
    assert!(reader.next().is_none());
}

#[test]
#[should_panic(expected = "exceeds the maximum")]
fn oversized_ttl_pulse() {
    Instruction::ttl(0, MAX_PULSE_T + 1);
}
