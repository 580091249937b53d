//! Channel naming for the pulse controller outputs.
//!
//! Channels are named `ttl<n>`, `dds<n>` or `dac<n>` (e.g. `ttl12`, `dds3`). The number of
//! physical channels of each kind is fixed by the FPGA firmware.

use std::fmt;
use std::str::FromStr;

use regex::Regex;

use crate::error::SeqError;

pub const NUM_TTL: usize = 32;
pub const NUM_DDS: usize = 22;
pub const NUM_DAC: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ChannelKind {
    TTL,
    DDS,
    DAC,
}

impl ChannelKind {
    pub fn count(&self) -> usize {
        match self {
            ChannelKind::TTL => NUM_TTL,
            ChannelKind::DDS => NUM_DDS,
            ChannelKind::DAC => NUM_DAC,
        }
    }
    pub fn prefix(&self) -> &'static str {
        match self {
            ChannelKind::TTL => "ttl",
            ChannelKind::DDS => "dds",
            ChannelKind::DAC => "dac",
        }
    }
}

/// A validated physical channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Channel {
    kind: ChannelKind,
    chn: u32,
}

impl Channel {
    /// Builds a channel, checking the index against the hardware channel count.
    pub fn new(kind: ChannelKind, chn: u32) -> Result<Self, SeqError> {
        check_chn(kind, chn)?;
        Ok(Channel { kind, chn })
    }
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }
    pub fn chn(&self) -> u32 {
        self.chn
    }
}

/// Checks `chn` against the number of channels of the given kind.
pub fn check_chn(kind: ChannelKind, chn: u32) -> Result<(), SeqError> {
    if (chn as usize) < kind.count() {
        Ok(())
    } else {
        Err(SeqError::InvalidChannel {
            kind: kind.prefix(),
            chn,
            max: kind.count() as u32,
        })
    }
}

impl FromStr for Channel {
    type Err = SeqError;

    /// Parses a channel name.
    ///
    /// ```
    /// use pulsecompiler_backend::channel::*;
    ///
    /// let chan: Channel = "dds3".parse().unwrap();
    /// assert_eq!(chan.kind(), ChannelKind::DDS);
    /// assert_eq!(chan.chn(), 3);
    /// assert!("dds22".parse::<Channel>().is_err());
    /// assert!("port0/line1".parse::<Channel>().is_err());
    /// ```
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let re = Regex::new(r"^(ttl|dds|dac)(\d+)$").expect("channel name pattern is valid");
        let caps = re.captures(name).ok_or_else(|| SeqError::ChannelName {
            name: name.to_string(),
        })?;
        let kind = match &caps[1] {
            "ttl" => ChannelKind::TTL,
            "dds" => ChannelKind::DDS,
            _ => ChannelKind::DAC,
        };
        let chn = caps[2].parse::<u32>().map_err(|_| SeqError::ChannelName {
            name: name.to_string(),
        })?;
        Channel::new(kind, chn)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.chn)
    }
}
