use thiserror::Error;

/// Errors raised while building or validating a pulse program.
///
/// Each variant carries the context (time, channel, stream offset) needed to point the
/// sequence's author at the offending pulse; presentation is left to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SeqError {
    #[error("pulse at t={t} is earlier than the earliest valid time {earliest}")]
    TooEarly { t: u64, earliest: u64 },

    #[error("the first pulse must set the TTL state, got {what} at t={t}")]
    MissingInitialTtl { what: &'static str, t: u64 },

    #[error("{kind} channel {chn} out of range (there are {max} channels)")]
    InvalidChannel {
        kind: &'static str,
        chn: u32,
        max: u32,
    },

    #[error("invalid channel name '{name}', expecting ttl(number), dds(number) or dac(number)")]
    ChannelName { name: String },

    #[error("instruction stream has odd length {len}")]
    OddLength { len: usize },

    #[error("unknown opcode in control word 0x{ctrl:08x}")]
    UnknownOpcode { ctrl: u32 },

    #[error("unknown byte-code op {op} at offset {offset}")]
    UnknownByteCode { op: u8, offset: usize },

    #[error("truncated byte-code at offset {offset}")]
    Truncated { offset: usize },

    #[error("invalid wait length {len} at offset {offset}")]
    WaitLength { len: u8, offset: usize },

    #[error("instruction 0x{ctrl:08x} produces a result and cannot be issued from a sequence")]
    ResultInSequence { ctrl: u32 },

    #[error("instruction {index}: {source}")]
    AtInstruction {
        index: usize,
        #[source]
        source: Box<SeqError>,
    },
}
