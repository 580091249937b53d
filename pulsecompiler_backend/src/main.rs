use pulsecompiler_backend::*;

fn main() {
    let mut timer = TickTimer::new();
    let mut builder = BlockBuilder::new();
    builder.ttl(0, 0).unwrap();
    builder.dds_freq(0, 0x1999_999A, 100).unwrap();
    builder.dds_amp(0, 0xFFF, 200).unwrap();
    for i in 0..10u64 {
        let t = 1000 + i * secs_to_cycles(1e-6);
        builder.ttl_bit(3, i % 2 == 0, t).unwrap();
    }
    builder.wait_until(secs_to_cycles(0.1)).unwrap();
    let program = builder.finish();
    println!("Built program in {:.3} ms", timer.tick());

    println!(
        "{} instructions, {:.6} s",
        program.len(),
        cycles_to_secs(program.total_time())
    );
    for (kind, count) in program.pulse_counts() {
        println!("{:>12}: {}", kind, count);
    }
    for instr in program.instructions().take(5) {
        println!("{}", instr);
    }
}
