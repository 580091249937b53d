//! Register-level access to the FPGA pulse controller.
//!
//! ## Overview
//!
//! The pulse controller exposes 32 word registers at offset `4 * n` plus a software reset
//! register at [`RESET_OFFSET`]. The [`Driver`] struct wraps a [`RegisterFile`] back-end and
//! provides the register map as named methods:
//!
//! | register | meaning |
//! |----------|---------|
//! | 0 / 1 | TTL high / low override masks |
//! | 2 | status: bit 0 timing error, bit 2 finished, bits 4.. number of pending results |
//! | 3 | control: `0x80` hold, `0x100` toggle-init (write then clear) |
//! | 31 | instruction FIFO ingress (operand, then control) and result FIFO egress |
//!
//! Two back-ends are provided: [`MmapRegisters`], which maps the physical register block through
//! `/dev/mem`, and [`SimRegisters`](crate::sim::SimRegisters), a software model of the
//! controller used by the tests and by the demo binary.
//!
//! ## Locking
//!
//! The driver does no locking of its own. The hardware latches operand and control as one
//! two-write transaction, so writes to register 31 must never interleave between threads. The
//! [`Controller`](crate::controller::Controller) guarantees this by routing every instruction
//! write through its [`CtrlLocker`](crate::controller::CtrlLocker).

use std::ffi::CString;
use std::io;

use thiserror::Error;

use crate::config::CtrlConfig;

pub const NUM_REGS: usize = 32;
pub const REG_TTL_HIGH: usize = 0;
pub const REG_TTL_LOW: usize = 1;
pub const REG_STATUS: usize = 2;
pub const REG_CTRL: usize = 3;
pub const REG_FIFO: usize = 31;

pub const RESET_OFFSET: usize = 0x100;
pub const RESET_MAGIC: u32 = 0x0000_000A;

pub const STATUS_TIMING_ERROR: u32 = 0x1;
pub const STATUS_FINISHED: u32 = 0x4;
pub const CTRL_HOLD: u32 = 0x80;
pub const CTRL_TOGGLE_INIT: u32 = 0x100;

/// Depth of the hardware result FIFO.
pub const RESULT_FIFO_DEPTH: u32 = 32;
/// Pending result count field of the status register, bits 4..8.
pub const STATUS_RESULTS_SHIFT: u32 = 4;
pub const STATUS_RESULTS_MASK: u32 = 0x1F;
/// Most results allowed in flight: the largest count the status field can report.
pub const MAX_IN_FLIGHT: u32 = STATUS_RESULTS_MASK;

/// Size of the mapped register block.
pub const MAP_SIZE: usize = 0x1000;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to map 0x{len:x} bytes at physical address 0x{addr:x}: {source}")]
    Map {
        addr: u64,
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("physical address 0x{addr:x} is not aligned to the 0x{page:x} byte page size")]
    Unaligned { addr: u64, page: u64 },
    #[error("failed to query the page size: {0}")]
    PageSize(#[source] io::Error),
    #[error("failed to start worker thread: {0}")]
    Thread(#[source] io::Error),
}

/// A block of 32-bit registers addressed by byte offset.
///
/// Every call is a single volatile access; implementations must not cache or reorder.
pub trait RegisterFile: Send + Sync {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, val: u32);
}

/// Runs a libc call returning a negative value on failure and converts the failure into
/// the corresponding OS error.
fn libc_call<F: FnOnce() -> libc::c_int>(func: F) -> io::Result<libc::c_int> {
    let ret = func();
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Checks `addr` against the page size returned by `sysconf`, which is -1 on failure.
fn check_alignment(page: libc::c_long, addr: u64) -> Result<u64, DriverError> {
    if page <= 0 {
        return Err(DriverError::PageSize(io::Error::last_os_error()));
    }
    let page = page as u64;
    if addr % page != 0 {
        return Err(DriverError::Unaligned { addr, page });
    }
    Ok(page)
}

/// The physical register block, mapped through `/dev/mem`.
pub struct MmapRegisters {
    base: *mut u32,
    len: usize,
}

// The mapping is only ever accessed through volatile word reads and writes.
unsafe impl Send for MmapRegisters {}
unsafe impl Sync for MmapRegisters {}

impl MmapRegisters {
    pub fn open(path: &str, addr: u64) -> Result<Self, DriverError> {
        check_alignment(unsafe { libc::sysconf(libc::_SC_PAGESIZE) }, addr)?;
        let open_err = |source| DriverError::Open {
            path: path.to_string(),
            source,
        };
        let path_cstr =
            CString::new(path).map_err(|e| open_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let fd = libc_call(|| unsafe { libc::open(path_cstr.as_ptr(), libc::O_RDWR | libc::O_SYNC) })
            .map_err(open_err)?;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                MAP_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                addr as libc::off_t,
            )
        };
        let res = if ptr == libc::MAP_FAILED {
            Err(DriverError::Map {
                addr,
                len: MAP_SIZE,
                source: io::Error::last_os_error(),
            })
        } else {
            log::debug!("Mapped pulse controller registers at 0x{:x} from {}", addr, path);
            Ok(MmapRegisters {
                base: ptr as *mut u32,
                len: MAP_SIZE,
            })
        };
        // The mapping stays valid after the descriptor is closed
        unsafe { libc::close(fd) };
        res
    }

    fn word_ptr(&self, offset: usize) -> *mut u32 {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.len,
            "Register offset 0x{:x} outside of the mapped block",
            offset
        );
        unsafe { self.base.add(offset / 4) }
    }
}

impl RegisterFile for MmapRegisters {
    fn read(&self, offset: usize) -> u32 {
        unsafe { std::ptr::read_volatile(self.word_ptr(offset)) }
    }
    fn write(&self, offset: usize, val: u32) {
        unsafe { std::ptr::write_volatile(self.word_ptr(offset), val) }
    }
}

impl Drop for MmapRegisters {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// Named access to the pulse controller registers.
pub struct Driver<R: RegisterFile> {
    regs: R,
}

impl Driver<MmapRegisters> {
    /// Maps the register block described by `config`.
    pub fn open(config: &CtrlConfig) -> Result<Self, DriverError> {
        Ok(Driver::new(MmapRegisters::open(
            &config.dev_path,
            config.base_addr,
        )?))
    }
}

impl<R: RegisterFile> Driver<R> {
    pub fn new(regs: R) -> Self {
        Driver { regs }
    }

    /// The underlying register back-end.
    pub fn regs(&self) -> &R {
        &self.regs
    }

    pub fn read_reg(&self, n: usize) -> u32 {
        assert!(n < NUM_REGS, "Register index {} out of range", n);
        self.regs.read(4 * n)
    }

    pub fn write_reg(&self, n: usize, val: u32) {
        assert!(n < NUM_REGS, "Register index {} out of range", n);
        self.regs.write(4 * n, val)
    }

    /// Issues one instruction: operand first, then control.
    pub fn short_pulse(&self, ctrl: u32, op: u32) {
        self.write_reg(REG_FIFO, op);
        self.write_reg(REG_FIFO, ctrl);
    }

    pub fn status(&self) -> u32 {
        self.read_reg(REG_STATUS)
    }

    /// Number of results waiting in the hardware result FIFO.
    pub fn num_results(&self) -> u32 {
        (self.status() >> STATUS_RESULTS_SHIFT) & STATUS_RESULTS_MASK
    }

    /// Pops one word off the result FIFO.
    pub fn pop_result(&self) -> u32 {
        self.read_reg(REG_FIFO)
    }

    pub fn is_finished(&self) -> bool {
        self.status() & STATUS_FINISHED != 0
    }

    pub fn timing_failed(&self) -> bool {
        self.status() & STATUS_TIMING_ERROR != 0
    }

    pub fn ttl_high_mask(&self) -> u32 {
        self.read_reg(REG_TTL_HIGH)
    }
    pub fn ttl_low_mask(&self) -> u32 {
        self.read_reg(REG_TTL_LOW)
    }
    pub fn set_ttl_high_mask(&self, mask: u32) {
        self.write_reg(REG_TTL_HIGH, mask)
    }
    pub fn set_ttl_low_mask(&self, mask: u32) {
        self.write_reg(REG_TTL_LOW, mask)
    }

    /// Buffers issued pulses without executing them.
    pub fn set_hold(&self) {
        let ctrl = self.read_reg(REG_CTRL);
        self.write_reg(REG_CTRL, ctrl | CTRL_HOLD);
    }

    pub fn release_hold(&self) {
        let ctrl = self.read_reg(REG_CTRL);
        self.write_reg(REG_CTRL, ctrl & !CTRL_HOLD);
    }

    /// Pulses the init bit, clearing a latched timing error.
    pub fn toggle_init(&self) {
        let ctrl = self.read_reg(REG_CTRL);
        self.write_reg(REG_CTRL, ctrl | CTRL_TOGGLE_INIT);
        self.write_reg(REG_CTRL, ctrl & !CTRL_TOGGLE_INIT);
    }

    /// Software reset of the whole controller.
    pub fn reset(&self) {
        self.regs.write(RESET_OFFSET, RESET_MAGIC);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Register file whose status word is set directly.
    struct StatusOnly(AtomicU32);

    impl RegisterFile for StatusOnly {
        fn read(&self, offset: usize) -> u32 {
            match offset / 4 {
                REG_STATUS => self.0.load(Ordering::Relaxed),
                _ => 0,
            }
        }
        fn write(&self, _offset: usize, _val: u32) {}
    }

    #[test]
    fn result_count_field() {
        let driver = Driver::new(StatusOnly(AtomicU32::new(0)));
        driver.regs().0.store((7 << 4) | STATUS_FINISHED, Ordering::Relaxed);
        assert_eq!(driver.num_results(), 7);
        // Bits above the count field are not results
        driver.regs().0.store(0x200 | (3 << 4) | STATUS_TIMING_ERROR, Ordering::Relaxed);
        assert_eq!(driver.num_results(), 3);
        assert!(driver.timing_failed());
        driver.regs().0.store(0x1F << 4, Ordering::Relaxed);
        assert_eq!(driver.num_results(), MAX_IN_FLIGHT);
    }

    #[test]
    fn page_alignment() {
        assert_eq!(check_alignment(4096, 0x43C0_0000).unwrap(), 4096);
        assert!(matches!(
            check_alignment(4096, 0x43C0_0010),
            Err(DriverError::Unaligned { page: 4096, .. })
        ));
        assert!(matches!(
            check_alignment(-1, 0x43C0_0000),
            Err(DriverError::PageSize(_))
        ));
        assert!(matches!(check_alignment(0, 0), Err(DriverError::PageSize(_))));
    }
}
