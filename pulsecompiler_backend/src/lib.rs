//! Pulse program representation and builders for the FPGA pulse sequencer.
//!
//! - [`instruction`]: the two-word `(ctrl, op)` instruction set, including meta instructions.
//! - [`bytecode`]: the dense byte-code format and its decoder.
//! - [`channel`]: channel naming and validation.
//! - [`builder`]: timed pulse builders producing [`builder::Program`] and [`builder::ByteCode`].

pub mod builder;
pub mod bytecode;
pub mod channel;
pub mod error;
pub mod instruction;
pub mod utils;

pub use builder::*;
pub use bytecode::*;
pub use channel::*;
pub use error::*;
pub use instruction::*;
pub use utils::*;
