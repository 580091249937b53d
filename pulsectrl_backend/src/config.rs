use std::time::Duration;

/// Runtime settings of the controller and its worker threads.
#[derive(Clone, Debug)]
pub struct CtrlConfig {
    /// Memory device used to map the register block.
    pub dev_path: String,
    /// Physical base address of the pulse controller registers.
    pub base_addr: u64,
    /// Reader poll interval while results are outstanding.
    pub reader_busy_poll: Duration,
    /// Reader poll interval when nothing is in flight.
    pub reader_idle_poll: Duration,
    /// Longest the writer sleeps before re-checking its queue and the shutdown flag.
    pub writer_idle_timeout: Duration,
    /// Sleep taken by the interpreter after an idle slice of a long wait.
    pub idle_sleep: Duration,
    /// How far the byte-code runner may run ahead of the wall clock.
    pub max_ahead: Duration,
    /// Sequence time (cycles) buffered before the hold is released.
    pub preload_cycles: u64,
}

impl Default for CtrlConfig {
    fn default() -> Self {
        Self {
            dev_path: "/dev/mem".to_string(),
            base_addr: 0x43C0_0000,
            reader_busy_poll: Duration::from_micros(200),
            reader_idle_poll: Duration::from_millis(2),
            writer_idle_timeout: Duration::from_millis(10),
            idle_sleep: Duration::from_micros(10),
            max_ahead: Duration::from_millis(500),
            preload_cycles: 100_000,
        }
    }
}
