use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Broadcast wake-up signal for a worker thread.
///
/// Every [`notify`](WakeChan::notify) bumps a generation counter. A receiver remembers the last
/// generation it has seen, so a notification posted while the worker was busy is observed by its
/// next wait instead of being lost.
pub struct WakeChan {
    gen: Arc<Mutex<u64>>,
    condvar: Arc<Condvar>,
}

impl Default for WakeChan {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeChan {
    pub fn new() -> Self {
        Self {
            gen: Arc::new(Mutex::new(0)),
            condvar: Arc::new(Condvar::new()),
        }
    }

    pub fn new_recvr(&self) -> WakeRecvr {
        // Notifications posted before the receiver existed are not pending for it
        let viewed_gen = *self.gen.lock();
        WakeRecvr {
            gen: self.gen.clone(),
            condvar: self.condvar.clone(),
            viewed_gen,
        }
    }

    pub fn notify(&self) {
        let mut gen = self.gen.lock();
        *gen += 1;
        self.condvar.notify_all();
    }
}

pub struct WakeRecvr {
    gen: Arc<Mutex<u64>>,
    condvar: Arc<Condvar>,
    viewed_gen: u64,
}

impl WakeRecvr {
    /// Waits for a notification newer than the last one seen.
    ///
    /// Returns immediately if one was already posted. Returns false on timeout.
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let mut gen = self.gen.lock();
        if *gen == self.viewed_gen {
            self.condvar.wait_for(&mut gen, timeout);
        }
        let woken = *gen != self.viewed_gen;
        self.viewed_gen = *gen;
        woken
    }
}
