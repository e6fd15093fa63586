//! Machine-guard wire protocol: packet framing, message kinds and the
//! primitive encoders they are built from. Pure and stateless.

mod message;
mod packet;
mod stream;

pub use message::*;
pub use packet::Packet;
pub use stream::{WireReader, WireWriter};

use thiserror::Error;

/// Default daemon port.
pub const PORT_MACHINED: u16 = 20018;
/// Port used only by the startup self-probe that finds the broadcast interface.
pub const PORT_BROADCAST_DISCOVERY: u16 = 20019;
/// Hard ceiling on an encoded packet. Larger packets are refused, never truncated.
pub const MAX_PACKET_SIZE: usize = 32768;

/// Bumped whenever a message layout changes. Decoders gate on the version
/// carried inside the message, not on this constant.
pub const PROTOCOL_VERSION: u8 = 2;

/// First version whose process extension carries the logger id as a string.
pub const LOGGER_ID_STRING_VERSION: u8 = 2;

/// Per-sender sequence numbers: random start, wrapping, never 0.
#[derive(Debug, Clone)]
pub struct SeqTicker {
    next: u16,
}

impl SeqTicker {
    pub fn new<R: rand::Rng>(rng: &mut R) -> Self {
        Self {
            next: rng.gen_range(1..=u16::MAX),
        }
    }

    pub fn next_seq(&mut self) -> u16 {
        let seq = self.next;
        self.next = match self.next.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        seq
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("string field is not valid UTF-8")]
    InvalidString,
    #[error("packet is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },
    #[error("{field} holds {count} items, the wire format allows {max}")]
    TooManyItems {
        field: &'static str,
        count: usize,
        max: usize,
    },
    #[error("invalid {field} value {value}")]
    BadValue { field: &'static str, value: u32 },
    #[error("extension block length {0} does not match its contents")]
    BadExtension(i32),
}
