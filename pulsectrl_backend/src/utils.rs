use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Number of condition variables shared by all requests.
pub const COND_POOL_SIZE: usize = 32;

/// A fixed pool of condition variables, shared between waiters by hashing a condition id.
///
/// Waiters sharing a slot see each other's notifications, so waits always re-check their
/// predicate.
pub struct CondPool {
    slots: [(Mutex<()>, Condvar); COND_POOL_SIZE],
}

impl Default for CondPool {
    fn default() -> Self {
        Self::new()
    }
}

impl CondPool {
    pub fn new() -> Self {
        CondPool {
            slots: std::array::from_fn(|_| (Mutex::new(()), Condvar::new())),
        }
    }

    fn slot(&self, cond_id: u32) -> &(Mutex<()>, Condvar) {
        &self.slots[cond_id as usize % COND_POOL_SIZE]
    }

    /// Blocks until `pred` holds. `pred` must become true before the matching
    /// [`notify`](CondPool::notify) call.
    pub fn wait_until<F: Fn() -> bool>(&self, cond_id: u32, pred: F) {
        let (mutex, condvar) = self.slot(cond_id);
        let mut guard = mutex.lock();
        while !pred() {
            condvar.wait(&mut guard);
        }
    }

    pub fn notify(&self, cond_id: u32) {
        let (mutex, condvar) = self.slot(cond_id);
        let _guard = mutex.lock();
        condvar.notify_all();
    }
}

/// Wall-clock source used to pace sequences against real time.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
    fn sleep(&self, dur: Duration);
}

pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
    fn sleep(&self, dur: Duration) {
        thread::sleep(dur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn shared_slot_waiters() {
        let pool = Arc::new(CondPool::new());
        // Ids 1 and 33 hash to the same slot
        let flags = Arc::new([AtomicBool::new(false), AtomicBool::new(false)]);
        let handles: Vec<_> = [(0usize, 1u32), (1, 33)]
            .into_iter()
            .map(|(i, cond_id)| {
                let (pool, flags) = (pool.clone(), flags.clone());
                thread::spawn(move || pool.wait_until(cond_id, || flags[i].load(Ordering::Acquire)))
            })
            .collect();
        for (i, cond_id) in [(1usize, 33u32), (0, 1)] {
            thread::sleep(Duration::from_millis(2));
            flags[i].store(true, Ordering::Release);
            pool.notify(cond_id);
        }
        handles.into_iter().for_each(|h| h.join().unwrap());
    }
}
