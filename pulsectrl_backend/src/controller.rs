//! The request/response protocol between client threads and the pulse controller.
//!
//! ## Overview
//!
//! Hardware instructions reach the controller through two paths:
//!
//! - **Real-time pulses** are issued directly by the thread holding the controller-wide lock,
//!   represented by a [`CtrlLocker`]. The sequence interpreter holds it for a whole run.
//! - **Asynchronous requests** (e.g. reading back a DDS frequency) are queued with
//!   [`Controller::push_req`]. A background writer thread ([`Controller::run_writer`]) issues
//!   them whenever it can take the lock, and the interpreter issues them from the idle time of
//!   long waits through [`CtrlLocker::write_requests`]. A background reader thread
//!   ([`Controller::run_reader`]) pops the hardware result FIFO and completes the matching
//!   requests.
//!
//! Results carry no tag: result `i` popped from the hardware belongs to the `i`-th
//! result-bearing request issued. Issued requests are therefore pushed onto a pending queue in
//! issue order, and the writer never has more requests in flight than the hardware result FIFO
//! can hold.
//!
//! ## Waiting
//!
//! Blocked callers wait on one of [`COND_POOL_SIZE`](crate::utils::COND_POOL_SIZE) condition
//! variables selected by the request's `cond_id`; waits re-check the request's `ready` flag.
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//! use pulsectrl_backend::*;
//!
//! let ctl = Arc::new(Controller::new(Driver::new(SimRegisters::new()), CtrlConfig::default()));
//! let writer = { let ctl = ctl.clone(); thread::spawn(move || ctl.run_writer()) };
//! let reader = { let ctl = ctl.clone(); thread::spawn(move || ctl.run_reader()) };
//!
//! assert_eq!(ctl.loopback(42), 42);
//! ctl.lock().dds_set_freq(2, 0x1234).unwrap();
//! assert_eq!(ctl.dds_get_freq(2), Ok(0x1234));
//! assert!(ctl.dds_get_freq(22).is_err());
//!
//! ctl.shutdown();
//! writer.join().unwrap();
//! reader.join().unwrap();
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use crossbeam::utils::Backoff;
use parking_lot::{Mutex, MutexGuard};

use pulsecompiler_backend::channel::{check_chn, ChannelKind};
use pulsecompiler_backend::error::SeqError;
use pulsecompiler_backend::instruction::*;

use crate::config::CtrlConfig;
use crate::driver::{Driver, RegisterFile, MAX_IN_FLIGHT};
use crate::request::Request;
use crate::utils::CondPool;
use crate::wake_chan::WakeChan;

/// Most requests issued by a single [`CtrlLocker::write_requests`] call from a sequence.
pub const MAX_REQ_BATCH: usize = 15;
/// Most requests the writer thread issues per wake-up.
pub const WRITER_BATCH: usize = 32;

pub struct Controller<R: RegisterFile> {
    driver: Driver<R>,
    ctrl_lock: Mutex<()>,
    req_tx: Sender<Arc<Request>>,
    req_rx: Receiver<Arc<Request>>,
    pending_tx: Sender<Arc<Request>>,
    pending_rx: Receiver<Arc<Request>>,
    notify_tx: Sender<Arc<Request>>,
    notify_rx: Receiver<Arc<Request>>,
    conds: CondPool,
    next_cond: AtomicU32,
    num_written: AtomicU64,
    num_read: AtomicU64,
    pop_lock: Mutex<()>,
    writer_wake: WakeChan,
    reader_wake: WakeChan,
    quit: AtomicBool,
    config: CtrlConfig,
}

impl<R: RegisterFile> Controller<R> {
    pub fn new(driver: Driver<R>, config: CtrlConfig) -> Self {
        let (req_tx, req_rx) = unbounded();
        let (pending_tx, pending_rx) = unbounded();
        let (notify_tx, notify_rx) = unbounded();
        Controller {
            driver,
            ctrl_lock: Mutex::new(()),
            req_tx,
            req_rx,
            pending_tx,
            pending_rx,
            notify_tx,
            notify_rx,
            conds: CondPool::new(),
            next_cond: AtomicU32::new(0),
            num_written: AtomicU64::new(0),
            num_read: AtomicU64::new(0),
            pop_lock: Mutex::new(()),
            writer_wake: WakeChan::new(),
            reader_wake: WakeChan::new(),
            quit: AtomicBool::new(false),
            config,
        }
    }

    pub fn driver(&self) -> &Driver<R> {
        &self.driver
    }
    pub fn config(&self) -> &CtrlConfig {
        &self.config
    }

    /// Takes the controller-wide lock guarding the instruction FIFO.
    pub fn lock(&self) -> CtrlLocker<'_, R> {
        CtrlLocker {
            ctl: self,
            _guard: self.ctrl_lock.lock(),
        }
    }

    fn try_lock_for(&self, timeout: Duration) -> Option<CtrlLocker<'_, R>> {
        self.ctrl_lock
            .try_lock_for(timeout)
            .map(|guard| CtrlLocker {
                ctl: self,
                _guard: guard,
            })
    }

    // Counters
    pub fn num_written(&self) -> u64 {
        self.num_written.load(Ordering::SeqCst)
    }
    pub fn num_read(&self) -> u64 {
        self.num_read.load(Ordering::SeqCst)
    }
    /// Result-bearing requests issued to the hardware whose result has not been popped yet.
    pub fn in_flight(&self) -> u64 {
        // Reads only ever trail writes, so load them first
        let read = self.num_read();
        self.num_written() - read
    }
    /// Free space in the hardware result FIFO.
    pub fn res_buff_space(&self) -> u32 {
        let in_flight = self.in_flight();
        assert!(
            in_flight <= MAX_IN_FLIGHT as u64,
            "{} results in flight exceed the limit {}",
            in_flight,
            MAX_IN_FLIGHT
        );
        MAX_IN_FLIGHT - in_flight as u32
    }

    fn quitting(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// Builds a request with a fresh condition id.
    pub fn new_request(&self, instr: Instruction) -> Request {
        Request::new(self.next_cond.fetch_add(1, Ordering::Relaxed), instr)
    }

    /// Queues a request for the writer. Never blocks.
    pub fn push_req(&self, req: Arc<Request>) {
        assert!(
            !req.instruction().is_meta(),
            "Meta instruction {} cannot be submitted as a request",
            req.instruction()
        );
        assert!(
            pulse_duration(req.ctrl) <= DDS_T,
            "Request {} is longer than a DDS access",
            req.instruction()
        );
        // A request the hardware drops would leave its result slot unmatched
        if let Err(e) = req.instruction().decode() {
            panic!("Invalid request {}: {}", req.instruction(), e);
        }
        self.req_tx
            .send(req)
            .expect("request queue receiver is owned by the controller");
        self.writer_wake.notify();
    }

    /// Queues `req` and blocks until it completes, returning its result.
    pub fn req_sync(&self, req: Request) -> u32 {
        let req = Arc::new(req);
        self.push_req(req.clone());
        self.wait(&req);
        req.res()
    }

    pub fn wait(&self, req: &Request) {
        self.conds.wait_until(req.cond_id, || req.is_ready());
    }

    pub fn set_res(&self, req: &Request, res: u32) {
        req.complete(res);
        self.conds.notify(req.cond_id);
    }

    /// Pops every result sitting in the hardware FIFO and completes the matching requests.
    pub fn pop_results(&self) -> usize {
        let _guard = self.pop_lock.lock();
        let num = self.driver.num_results() as usize;
        for _ in 0..num {
            let res = self.driver.pop_result();
            let req = self.pending_rx.try_recv().unwrap_or_else(|_| {
                panic!(
                    "Hardware returned result 0x{:08x} with no pending request ({} written, {} read)",
                    res,
                    self.num_written(),
                    self.num_read()
                )
            });
            self.num_read.fetch_add(1, Ordering::SeqCst);
            self.set_res(&req, res);
        }
        if num > 0 {
            self.writer_wake.notify();
        }
        num
    }

    /// Pops results until every issued result-bearing request is complete, or shutdown.
    pub fn pop_remaining(&self) {
        let backoff = Backoff::new();
        while self.in_flight() > 0 && !self.quitting() {
            if self.pop_results() > 0 {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
    }

    /// Completes the write-only requests issued from a sequence.
    pub fn dump_notify(&self) -> usize {
        let mut num = 0;
        while let Ok(req) = self.notify_rx.try_recv() {
            self.set_res(&req, 0);
            num += 1;
        }
        num
    }

    /// Spins until the hardware reports the end of the sequence, or shutdown.
    pub fn wait_finished(&self) {
        let backoff = Backoff::new();
        while !self.driver.is_finished() && !self.quitting() {
            backoff.snooze();
        }
    }

    /// Writer thread body: issues queued requests whenever the lock and result space allow.
    pub fn run_writer(&self) {
        log::debug!("Request writer started");
        let mut wake = self.writer_wake.new_recvr();
        let timeout = self.config.writer_idle_timeout;
        while !self.quitting() {
            if self.req_rx.is_empty() || self.res_buff_space() == 0 {
                wake.wait_timeout(timeout);
                continue;
            }
            if let Some(ctl) = self.try_lock_for(timeout) {
                ctl.write_requests(WRITER_BATCH, true, 0);
            }
        }
        log::debug!("Request writer stopped");
    }

    /// Reader thread body: pops results and completes write-only requests.
    pub fn run_reader(&self) {
        log::debug!("Result reader started");
        let mut wake = self.reader_wake.new_recvr();
        while !self.quitting() {
            self.pop_results();
            self.dump_notify();
            let poll = if self.in_flight() > 0 {
                self.config.reader_busy_poll
            } else {
                self.config.reader_idle_poll
            };
            wake.wait_timeout(poll);
        }
        log::debug!("Result reader stopped");
    }

    /// Stops the writer and reader loops and any result drain in progress.
    pub fn shutdown(&self) {
        self.quit.store(true, Ordering::Release);
        self.writer_wake.notify();
        self.reader_wake.notify();
    }

    /// Issues a write-only instruction immediately.
    pub fn run(&self, ctrl: u32, op: u32) {
        self.lock().short_pulse(ctrl, op);
    }

    pub fn loopback(&self, val: u32) -> u32 {
        self.req_sync(self.new_request(Instruction::loopback(val)))
    }
    fn dds_query(&self, chn: u32, instr: Instruction) -> Result<u32, SeqError> {
        check_chn(ChannelKind::DDS, chn)?;
        Ok(self.req_sync(self.new_request(instr)))
    }
    pub fn dds_get_freq(&self, chn: u32) -> Result<u32, SeqError> {
        self.dds_query(chn, Instruction::dds_get_freq(chn))
    }
    pub fn dds_get_amp(&self, chn: u32) -> Result<u16, SeqError> {
        Ok(self.dds_query(chn, Instruction::dds_get_amp(chn))? as u16)
    }
    pub fn dds_get_phase(&self, chn: u32) -> Result<u16, SeqError> {
        Ok(self.dds_query(chn, Instruction::dds_get_phase(chn))? as u16)
    }
    pub fn dds_get_two_bytes(&self, chn: u32, addr: u32) -> Result<u16, SeqError> {
        Ok(self.dds_query(chn, Instruction::dds_get_two_bytes(chn, addr))? as u16)
    }
    pub fn dds_get_four_bytes(&self, chn: u32, addr: u32) -> Result<u32, SeqError> {
        self.dds_query(chn, Instruction::dds_get_four_bytes(chn, addr))
    }

    pub fn ttl_high_mask(&self) -> u32 {
        self.driver.ttl_high_mask()
    }
    pub fn ttl_low_mask(&self) -> u32 {
        self.driver.ttl_low_mask()
    }
    pub fn status(&self) -> u32 {
        self.driver.status()
    }
}

/// Exclusive access to the instruction FIFO.
pub struct CtrlLocker<'a, R: RegisterFile> {
    ctl: &'a Controller<R>,
    _guard: MutexGuard<'a, ()>,
}

impl<'a, R: RegisterFile> CtrlLocker<'a, R> {
    pub fn controller(&self) -> &'a Controller<R> {
        self.ctl
    }

    pub fn short_pulse(&self, ctrl: u32, op: u32) {
        assert!(
            !has_result(ctrl),
            "Instruction 0x{:08x} produces a result, submit it as a request",
            ctrl
        );
        self.ctl.driver.short_pulse(ctrl, op);
    }

    pub fn pulse(&self, instr: Instruction, flags: u32) {
        self.short_pulse(instr.ctrl | flags, instr.op);
    }

    /// Issues up to `max_num` queued requests, bounded by the free result FIFO space.
    ///
    /// Write-only requests are completed right away when `notify` is set, otherwise they are
    /// queued for [`Controller::dump_notify`]. Returns the total hardware time of the issued
    /// instructions.
    pub fn write_requests(&self, max_num: usize, notify: bool, flags: u32) -> u64 {
        let ctl = self.ctl;
        let max_num = max_num.min(ctl.res_buff_space() as usize);
        let mut total = 0;
        let mut num_res = 0;
        for _ in 0..max_num {
            let Ok(req) = ctl.req_rx.try_recv() else {
                break;
            };
            total += pulse_duration(req.ctrl) as u64;
            if req.has_res {
                // Queued before the write so the reader always finds the entry
                ctl.num_written.fetch_add(1, Ordering::SeqCst);
                ctl.pending_tx
                    .send(req.clone())
                    .expect("pending queue receiver is owned by the controller");
                ctl.driver.short_pulse(req.ctrl | flags, req.op);
                num_res += 1;
            } else {
                ctl.driver.short_pulse(req.ctrl | flags, req.op);
                if notify {
                    ctl.set_res(&req, 0);
                } else {
                    ctl.notify_tx
                        .send(req)
                        .expect("notify queue receiver is owned by the controller");
                }
            }
        }
        if num_res > 0 {
            ctl.reader_wake.notify();
        }
        total
    }

    pub fn set_hold(&self) {
        self.ctl.driver.set_hold();
    }
    pub fn release_hold(&self) {
        self.ctl.driver.release_hold();
    }
    pub fn toggle_init(&self) {
        self.ctl.driver.toggle_init();
    }
    pub fn set_ttl_high_mask(&self, mask: u32) {
        self.ctl.driver.set_ttl_high_mask(mask);
    }
    pub fn set_ttl_low_mask(&self, mask: u32) {
        self.ctl.driver.set_ttl_low_mask(mask);
    }

    pub fn ttl(&self, ttl: u32, t: u32) {
        self.pulse(Instruction::ttl(ttl, t), 0);
    }
    /// Waits `t` cycles, split into maximum length pulses.
    pub fn wait(&self, mut t: u64) {
        while t > 0 {
            let chunk = t.min(MAX_PULSE_T as u64);
            self.pulse(Instruction::wait(chunk as u32), 0);
            t -= chunk;
        }
    }
    /// Issues `instr` after checking `chn` against the channels of `kind`.
    fn checked_pulse(
        &self,
        kind: ChannelKind,
        chn: u32,
        instr: Instruction,
    ) -> Result<(), SeqError> {
        check_chn(kind, chn)?;
        self.pulse(instr, 0);
        Ok(())
    }
    pub fn dds_set_freq(&self, chn: u32, ftw: u32) -> Result<(), SeqError> {
        self.checked_pulse(ChannelKind::DDS, chn, Instruction::dds_freq(chn, ftw))
    }
    pub fn dds_set_amp(&self, chn: u32, amp: u16) -> Result<(), SeqError> {
        self.checked_pulse(ChannelKind::DDS, chn, Instruction::dds_amp(chn, amp))
    }
    pub fn dds_set_phase(&self, chn: u32, phase: u16) -> Result<(), SeqError> {
        self.checked_pulse(ChannelKind::DDS, chn, Instruction::dds_phase(chn, phase))
    }
    pub fn dds_reset(&self, chn: u32) -> Result<(), SeqError> {
        self.checked_pulse(ChannelKind::DDS, chn, Instruction::dds_reset(chn))
    }
    pub fn dds_set_two_bytes(&self, chn: u32, addr: u32, val: u16) -> Result<(), SeqError> {
        let instr = Instruction::dds_set_two_bytes(chn, addr, val);
        self.checked_pulse(ChannelKind::DDS, chn, instr)
    }
    pub fn dds_set_four_bytes(&self, chn: u32, addr: u32, val: u32) -> Result<(), SeqError> {
        let instr = Instruction::dds_set_four_bytes(chn, addr, val);
        self.checked_pulse(ChannelKind::DDS, chn, instr)
    }
    pub fn dac(&self, chn: u32, val: u16) -> Result<(), SeqError> {
        self.checked_pulse(ChannelKind::DAC, chn, Instruction::dac(chn, val))
    }
    pub fn clock(&self, period: u8) {
        self.pulse(Instruction::clock(period), 0);
    }
    pub fn clear_timing_check(&self) {
        self.pulse(Instruction::clear_timing_check(), 0);
    }
}
