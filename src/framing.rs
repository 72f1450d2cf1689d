//! Inbound message framing
//!
//! Turns raw delivery units from the device input into channel messages.
//! Anything the interface never sends (system common, SysEx, 2-byte channel
//! messages) is consumed and dropped rather than reported.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::midi::{frame_len, ChannelMessage, MessageKind};

/// What to do with a message cut off by the end of a delivery unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingPolicy {
    /// Discard the partial message. The interface only ever delivers complete
    /// messages per packet, so this matches the device's framing.
    #[default]
    DropPartial,

    /// Carry the partial message over and complete it with the next unit
    BufferPartial,
}

/// Decode one delivery unit without carrying anything across calls
pub fn frames(bytes: &[u8]) -> Frames<'_> {
    Frames {
        bytes,
        pos: 0,
        carry: None,
        done: false,
    }
}

/// Lazy iterator over the channel messages of one delivery unit
pub struct Frames<'a> {
    bytes: &'a [u8],
    pos: usize,
    /// Where trailing partial bytes go under `BufferPartial`
    carry: Option<&'a mut Vec<u8>>,
    done: bool,
}

impl<'a> Frames<'a> {
    fn finish(&mut self) {
        self.done = true;
        self.pos = self.bytes.len();
    }

    /// Variable-length system message: the rest of the unit is unusable
    fn abandon(&mut self, status: u8) {
        trace!("Abandoning unit at system status {:02X}", status);
        if let Some(carry) = self.carry.as_mut() {
            carry.clear();
        }
        self.finish();
    }

    fn truncated(&mut self, status: u8, data: &[u8]) {
        match self.carry.as_mut() {
            Some(carry) => {
                carry.clear();
                carry.push(status);
                carry.extend_from_slice(data);
                trace!("Carrying {} partial byte(s) to next unit", carry.len());
            }
            None => trace!("Dropping partial message {:02X}", status),
        }
        self.finish();
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = ChannelMessage;

    fn next(&mut self) -> Option<ChannelMessage> {
        while !self.done && self.pos < self.bytes.len() {
            let status = self.bytes[self.pos];

            // Orphan data byte
            if status < 0x80 {
                trace!("Skipping orphan data byte {:02X}", status);
                self.pos += 1;
                continue;
            }

            // System real-time, single byte
            if status >= 0xF8 {
                self.pos += 1;
                continue;
            }

            let len = match frame_len(status) {
                Some(len) => len,
                None => {
                    self.abandon(status);
                    return None;
                }
            };

            let mut data = [0u8; 2];
            let mut have = 0;
            let mut cursor = self.pos + 1;
            let mut interrupted = false;

            while have < len - 1 {
                match self.bytes.get(cursor).copied() {
                    None => {
                        self.truncated(status, &data[..have]);
                        return None;
                    }
                    // Real-time bytes may sit between the bytes of a message
                    Some(b) if b >= 0xF8 => cursor += 1,
                    Some(b) if b >= 0x80 => {
                        interrupted = true;
                        break;
                    }
                    Some(b) => {
                        data[have] = b;
                        have += 1;
                        cursor += 1;
                    }
                }
            }

            self.pos = cursor;

            if interrupted {
                // Resume at the status byte that cut this message short
                trace!("Message {:02X} interrupted by a new status byte", status);
                continue;
            }

            // Program change / channel pressure: consumed, never emitted
            if len == 2 {
                continue;
            }

            return Some(ChannelMessage {
                channel: status & 0x0F,
                kind: MessageKind::from_status(status),
                data1: data[0],
                data2: Some(data[1]),
            });
        }

        None
    }
}

/// Stateful framer applying a [`FramingPolicy`] across delivery units
#[derive(Debug, Default)]
pub struct Framer {
    policy: FramingPolicy,
    pending: Vec<u8>,
    scratch: Vec<u8>,
}

impl Framer {
    pub fn new(policy: FramingPolicy) -> Self {
        Self {
            policy,
            pending: Vec::new(),
            scratch: Vec::new(),
        }
    }

    pub fn policy(&self) -> FramingPolicy {
        self.policy
    }

    /// Decode one delivery unit.
    ///
    /// Under `BufferPartial` the trailing partial message is only carried over
    /// once the returned iterator has been run to the end.
    pub fn feed<'a>(&'a mut self, chunk: &'a [u8]) -> Frames<'a> {
        match self.policy {
            FramingPolicy::DropPartial => frames(chunk),
            FramingPolicy::BufferPartial if self.pending.is_empty() => Frames {
                bytes: chunk,
                pos: 0,
                carry: Some(&mut self.pending),
                done: false,
            },
            FramingPolicy::BufferPartial => {
                self.scratch.clear();
                self.scratch.append(&mut self.pending);
                self.scratch.extend_from_slice(chunk);
                Frames {
                    bytes: &self.scratch,
                    pos: 0,
                    carry: Some(&mut self.pending),
                    done: false,
                }
            }
        }
    }

    /// Bytes waiting for the rest of their message
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Forget any carried-over bytes (transport detached)
    pub fn reset(&mut self) {
        self.pending.clear();
        self.scratch.clear();
    }
}
