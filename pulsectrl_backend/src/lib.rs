//! Real-time control of the FPGA pulse controller.
//!
//! Builds on [`pulsecompiler_backend`] for the instruction set and program builders.
//!
//! - [`driver`]: register map and back-ends ([`MmapRegisters`], [`SimRegisters`]).
//! - [`controller`]: the asynchronous request protocol and the controller-wide lock.
//! - [`interpreter`], [`bytecode_runner`]: real-time execution of programs.
//! - [`sequencer`]: owner of a controller and its worker threads.

pub mod bytecode_runner;
pub mod config;
pub mod controller;
pub mod driver;
pub mod interpreter;
pub mod request;
pub mod sequencer;
pub mod sim;
pub mod utils;
pub mod wake_chan;

pub use crate::bytecode_runner::*;
pub use crate::config::*;
pub use crate::controller::*;
pub use crate::driver::*;
pub use crate::interpreter::*;
pub use crate::request::*;
pub use crate::sequencer::*;
pub use crate::sim::*;
pub use crate::utils::*;
pub use pulsecompiler_backend::*;
