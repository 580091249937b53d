use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use pulsecompiler_backend::instruction::{has_result, Instruction};

/// An asynchronous instruction submitted to the [`Controller`](crate::controller::Controller).
///
/// The instruction fields are fixed at construction. `ready` flips from false to true exactly
/// once, when the writer (for write-only instructions) or the reader (for instructions with a
/// result) completes the request; `res` holds the popped result word from then on.
#[derive(Debug)]
pub struct Request {
    pub cond_id: u32,
    pub ctrl: u32,
    pub op: u32,
    pub has_res: bool,
    ready: AtomicBool,
    res: AtomicU32,
}

impl Request {
    pub fn new(cond_id: u32, instr: Instruction) -> Self {
        Request {
            cond_id,
            ctrl: instr.ctrl,
            op: instr.op,
            has_res: has_result(instr.ctrl),
            ready: AtomicBool::new(false),
            res: AtomicU32::new(0),
        }
    }

    pub fn instruction(&self) -> Instruction {
        Instruction::new(self.ctrl, self.op)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Result word, only meaningful once [`is_ready`](Request::is_ready) returns true.
    pub fn res(&self) -> u32 {
        self.res.load(Ordering::Relaxed)
    }

    pub(crate) fn complete(&self, res: u32) {
        self.res.store(res, Ordering::Relaxed);
        let was_ready = self.ready.swap(true, Ordering::Release);
        assert!(
            !was_ready,
            "Request {} completed twice (cond_id {})",
            self.instruction(),
            self.cond_id
        );
    }
}
