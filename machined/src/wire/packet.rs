use super::message::Message;
use super::stream::{WireReader, WireWriter};
use super::{WireError, MAX_PACKET_SIZE};
use std::net::Ipv4Addr;

/// An owned batch of messages plus the packet-level flags and the sender's
/// current buddy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flags: u8,
    /// `0.0.0.0` when the sender has no buddy.
    pub buddy: Ipv4Addr,
    pub messages: Vec<Message>,
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            flags: 0,
            buddy: Ipv4Addr::UNSPECIFIED,
            messages: Vec::new(),
        }
    }
}

impl Packet {
    /// Ask receivers to delay their replies by a random jitter.
    pub const STAGGER_REPLIES: u8 = 0x1;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(message: Message) -> Self {
        Self {
            messages: vec![message],
            ..Self::default()
        }
    }

    pub fn staggered(mut self) -> Self {
        self.flags |= Self::STAGGER_REPLIES;
        self
    }

    pub fn is_staggered(&self) -> bool {
        self.flags & Self::STAGGER_REPLIES != 0
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut w = WireWriter::with_capacity(256);
        w.u8(self.flags);
        w.addr(self.buddy);
        for message in &self.messages {
            let len_at = w.reserve_u16();
            let start = w.len();
            message.encode(&mut w)?;
            let len = w.len() - start;
            if len > u16::MAX as usize || w.len() > MAX_PACKET_SIZE {
                return Err(WireError::TooLarge {
                    size: w.len(),
                    max: MAX_PACKET_SIZE,
                });
            }
            w.patch_u16(len_at, len as u16);
        }
        Ok(w.into_vec())
    }

    /// A packet is rejected whole if its framing is broken; a message whose
    /// body is unparseable still decodes, as [`super::Body::Unknown`].
    pub fn decode(bytes: &[u8]) -> Result<Packet, WireError> {
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(WireError::TooLarge {
                size: bytes.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        let mut r = WireReader::new(bytes);
        let flags = r.u8()?;
        let buddy = r.addr()?;
        let mut messages = Vec::new();
        while !r.is_empty() {
            let len = r.u16()? as usize;
            messages.push(Message::decode(r.bytes(len)?)?);
        }
        Ok(Packet {
            flags,
            buddy,
            messages,
        })
    }
}
