use std::error::Error;
use std::process::ExitCode;
use std::thread;

use clap::Parser;

use pulsectrl_backend::*;

/// Runs a demo sequence on the pulse controller while querying it from another thread.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Use the simulated controller instead of the hardware
    #[arg(long)]
    sim: bool,
    /// Memory device used to map the registers
    #[arg(long, default_value = "/dev/mem")]
    dev: String,
    /// Physical base address of the register block
    #[arg(long, value_parser = parse_addr, default_value = "0x43c00000")]
    addr: u64,
    /// Number of loop-back queries issued during the sequence
    #[arg(long, default_value_t = 1024)]
    queries: u32,
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let res = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    res.map_err(|e| format!("invalid address '{}': {}", s, e))
}

fn demo_program() -> Result<Program, SeqError> {
    let mut builder = BlockBuilder::new();
    builder.ttl(0, 0)?;
    builder.dds_freq(0, 0x1999_999A, 100)?;
    builder.dds_amp(0, 0xFFF, 200)?;
    for i in 0..100u64 {
        builder.ttl_bit(0, i % 2 == 0, 1000 + i * secs_to_cycles(200e-6))?;
    }
    builder.dds_shift_phase(0, 0x4000, builder.earliest_time(false))?;
    builder.wait_until(builder.end_time() + secs_to_cycles(20e-3))?;
    Ok(builder.finish())
}

fn run<R: RegisterFile + 'static>(
    driver: Driver<R>,
    config: CtrlConfig,
    queries: u32,
) -> Result<(), Box<dyn Error>> {
    let seq = Sequencer::new(driver, config)?;
    let program = demo_program()?;
    println!(
        "Program: {} instructions, {:.3} ms",
        program.len(),
        cycles_to_secs(program.total_time()) * 1e3
    );

    let ctl = seq.controller().clone();
    let mut timer = TickTimer::new();
    let (stats, mismatches) = thread::scope(|s| {
        let querier = s.spawn(|| (0..queries).filter(|&i| ctl.loopback(i) != i).count());
        let stats = seq.run_program(&program);
        (stats, querier.join())
    });
    let stats = stats?;
    let mismatches = mismatches.map_err(|_| "query thread panicked")?;
    timer.tick_log("Sequence and queries");

    println!("{:?}", stats);
    println!(
        "{} queries, {} mismatched, {} timing failures",
        queries,
        mismatches,
        seq.timing_failures()
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    let config = CtrlConfig {
        dev_path: args.dev,
        base_addr: args.addr,
        ..Default::default()
    };
    let res = if args.sim {
        run(Driver::new(SimRegisters::new()), config, args.queries)
    } else {
        match Driver::open(&config) {
            Ok(driver) => run(driver, config, args.queries),
            Err(e) => Err(e.into()),
        }
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
