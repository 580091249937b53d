//! Owner of a controller and its worker threads.
//!
//! ## Overview
//!
//! [`Sequencer`] builds a [`Controller`] around a register back-end and starts its two
//! background threads:
//!
//! - `pulse-writer`, running [`Controller::run_writer`];
//! - `pulse-reader`, running [`Controller::run_reader`].
//!
//! Sequences are executed with [`Sequencer::run_program`] and [`Sequencer::run_bytecode`],
//! which hold the controller-wide lock for the whole run. Asynchronous queries can be issued
//! from any thread through [`Sequencer::controller`] while a sequence is running: they are
//! serviced from the idle time of the sequence's waits.
//!
//! Hardware timing failures do not abort a run. They are counted, logged as warnings and
//! reported in the returned [`RunStats`].
//!
//! Dropping the sequencer stops and joins the worker threads.
//!
//! ## Example
//!
//! ```
//! use pulsectrl_backend::*;
//!
//! let seq = Sequencer::new(Driver::new(SimRegisters::new()), CtrlConfig::default()).unwrap();
//! let mut builder = BlockBuilder::new();
//! builder.ttl(0b1, 0).unwrap();
//! builder.ttl(0b0, 100).unwrap();
//! let stats = seq.run_program(&builder.finish()).unwrap();
//! assert!(!stats.timing_failed);
//! assert_eq!(seq.controller().loopback(7), 7);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use pulsecompiler_backend::builder::{ByteCode, Program};
use pulsecompiler_backend::error::SeqError;
use pulsecompiler_backend::utils::cycles_to_secs;

use crate::bytecode_runner::ByteCodeRunner;
use crate::config::CtrlConfig;
use crate::controller::Controller;
use crate::driver::{Driver, DriverError, RegisterFile};
use crate::interpreter::{CtrlState, Interpreter, RunStats};
use crate::utils::{Clock, SystemClock};

pub struct Sequencer<R: RegisterFile + 'static, C: Clock = SystemClock> {
    ctl: Arc<Controller<R>>,
    clock: C,
    workers: Vec<JoinHandle<()>>,
    timing_failures: AtomicUsize,
}

impl<R: RegisterFile + 'static> Sequencer<R, SystemClock> {
    pub fn new(driver: Driver<R>, config: CtrlConfig) -> Result<Self, DriverError> {
        Self::with_clock(driver, config, SystemClock::new())
    }
}

impl<R: RegisterFile + 'static, C: Clock> Sequencer<R, C> {
    pub fn with_clock(driver: Driver<R>, config: CtrlConfig, clock: C) -> Result<Self, DriverError> {
        let ctl = Arc::new(Controller::new(driver, config));
        let mut seq = Sequencer {
            ctl,
            clock,
            workers: Vec::new(),
            timing_failures: AtomicUsize::new(0),
        };
        // Workers already started are shut down by Drop if a later spawn fails
        seq.spawn("pulse-writer", |ctl| ctl.run_writer())?;
        seq.spawn("pulse-reader", |ctl| ctl.run_reader())?;
        Ok(seq)
    }

    fn spawn(&mut self, name: &str, body: fn(&Controller<R>)) -> Result<(), DriverError> {
        let ctl = self.ctl.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(&ctl))
            .map_err(DriverError::Thread)?;
        self.workers.push(handle);
        Ok(())
    }

    pub fn controller(&self) -> &Arc<Controller<R>> {
        &self.ctl
    }

    /// Number of runs that ended with a hardware timing failure.
    pub fn timing_failures(&self) -> usize {
        self.timing_failures.load(Ordering::Relaxed)
    }

    fn record(&self, stats: RunStats) -> RunStats {
        if stats.timing_failed {
            let count = self.timing_failures.fetch_add(1, Ordering::Relaxed) + 1;
            log::warn!("Timing failure during sequence ({} so far)", count);
        }
        log::info!(
            "Sequence done: {} pulses, {:.6} s",
            stats.num_pulses,
            cycles_to_secs(stats.seq_time)
        );
        stats
    }

    pub fn run_program(&self, program: &Program) -> Result<RunStats, SeqError> {
        let ctl = self.ctl.lock();
        let mut state = CtrlState::default();
        let stats = Interpreter::new(&ctl, &mut state, &self.clock).run_program(program)?;
        Ok(self.record(stats))
    }

    pub fn run_instructions(&self, words: &[u32]) -> Result<RunStats, SeqError> {
        let ctl = self.ctl.lock();
        let mut state = CtrlState::default();
        let stats = Interpreter::new(&ctl, &mut state, &self.clock).run_instructions(words)?;
        Ok(self.record(stats))
    }

    pub fn run_bytecode(&self, code: &ByteCode) -> Result<RunStats, SeqError> {
        let ctl = self.ctl.lock();
        let mut state = CtrlState::default();
        let stats = ByteCodeRunner::new(&ctl, &mut state, &self.clock).run_bytecode(code)?;
        Ok(self.record(stats))
    }
}

impl<R: RegisterFile + 'static, C: Clock> Drop for Sequencer<R, C> {
    fn drop(&mut self) {
        self.ctl.shutdown();
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                log::error!("Thread {} panicked", name);
            }
        }
    }
}
