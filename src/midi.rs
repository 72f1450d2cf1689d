//! MIDI channel message types
//!
//! Provides the channel message value produced by the framer, its wire
//! encoding, and 7/14-bit value helpers.

use std::fmt;

/// Kind of a channel voice message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Note Off (0x8n)
    NoteOff,

    /// Note On (0x9n)
    NoteOn,

    /// Control Change (0xBn)
    ControlChange,

    /// Any other channel message class (poly pressure, pitch bend, ...).
    /// The raw status nibble is kept so the frame can be re-encoded.
    Other(u8),
}

impl MessageKind {
    /// Map a status byte's high nibble to a message kind
    pub fn from_status(status: u8) -> Self {
        match status & 0xF0 {
            0x80 => MessageKind::NoteOff,
            0x90 => MessageKind::NoteOn,
            0xB0 => MessageKind::ControlChange,
            nibble => MessageKind::Other(nibble),
        }
    }

    /// High nibble of the status byte for this kind
    pub fn status_nibble(&self) -> u8 {
        match *self {
            MessageKind::NoteOff => 0x80,
            MessageKind::NoteOn => 0x90,
            MessageKind::ControlChange => 0xB0,
            MessageKind::Other(nibble) => nibble & 0xF0,
        }
    }
}

/// Total frame length (status included) for a channel status byte.
///
/// Returns `None` for system status bytes (0xF0-0xFF) and data bytes.
pub fn frame_len(status: u8) -> Option<usize> {
    match status & 0xF0 {
        0x80 | 0x90 | 0xA0 | 0xB0 | 0xE0 => Some(3),
        0xC0 | 0xD0 => Some(2),
        _ => None,
    }
}

/// A decoded channel message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelMessage {
    /// Logical channel (0-15)
    pub channel: u8,
    pub kind: MessageKind,
    /// First data byte (note or controller number)
    pub data1: u8,
    /// Second data byte, absent for 2-byte forms
    pub data2: Option<u8>,
}

impl ChannelMessage {
    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self {
            channel: channel & 0x0F,
            kind: MessageKind::NoteOn,
            data1: note & 0x7F,
            data2: Some(velocity & 0x7F),
        }
    }

    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Self {
        Self {
            channel: channel & 0x0F,
            kind: MessageKind::NoteOff,
            data1: note & 0x7F,
            data2: Some(velocity & 0x7F),
        }
    }

    pub fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        Self {
            channel: channel & 0x0F,
            kind: MessageKind::ControlChange,
            data1: controller & 0x7F,
            data2: Some(value & 0x7F),
        }
    }

    /// Status byte (kind nibble | channel)
    pub fn status(&self) -> u8 {
        self.kind.status_nibble() | (self.channel & 0x0F)
    }

    /// Controller number and value, if this is a control change
    pub fn as_control_change(&self) -> Option<(u8, u8)> {
        match (self.kind, self.data2) {
            (MessageKind::ControlChange, Some(value)) => Some((self.data1, value)),
            _ => None,
        }
    }

    /// Encode the message to MIDI bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(3);
        self.encode_into(&mut bytes);
        bytes
    }

    /// Append the encoded message to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.status());
        out.push(self.data1 & 0x7F);
        if let Some(data2) = self.data2 {
            out.push(data2 & 0x7F);
        }
    }
}

impl fmt::Display for ChannelMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data2 = self.data2.unwrap_or(0);
        match self.kind {
            MessageKind::NoteOff => {
                write!(f, "NoteOff ch:{} n:{} v:{}", self.channel + 1, self.data1, data2)
            }
            MessageKind::NoteOn => {
                write!(f, "NoteOn ch:{} n:{} v:{}", self.channel + 1, self.data1, data2)
            }
            MessageKind::ControlChange => {
                write!(f, "CC ch:{} cc:{} v:{}", self.channel + 1, self.data1, data2)
            }
            MessageKind::Other(0xE0) => {
                let value = convert::join_14bit(data2, self.data1);
                write!(f, "PitchBend ch:{} v:{}", self.channel + 1, value)
            }
            MessageKind::Other(nibble) => write!(
                f,
                "{:02X} ch:{} d1:{} d2:{}",
                nibble,
                self.channel + 1,
                self.data1,
                data2
            ),
        }
    }
}

/// MIDI value conversion utilities
pub mod convert {
    /// Split a 14-bit value into (high, low) 7-bit halves
    pub fn split_14bit(value: u16) -> (u8, u8) {
        (((value >> 7) & 0x7F) as u8, (value & 0x7F) as u8)
    }

    /// Join 7-bit (high, low) halves into a 14-bit value
    pub fn join_14bit(high: u8, low: u8) -> u16 {
        (((high & 0x7F) as u16) << 7) | (low & 0x7F) as u16
    }
}

/// Format MIDI bytes as hex string for debugging
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_on_encoding() {
        let msg = ChannelMessage::note_on(4, 1, b'A');
        assert_eq!(msg.encode(), vec![0x94, 0x01, 0x41]);
    }

    #[test]
    fn test_control_change_accessor() {
        let msg = ChannelMessage::control_change(1, 0x63, 5);
        assert_eq!(msg.as_control_change(), Some((0x63, 5)));
        assert_eq!(ChannelMessage::note_on(1, 0x63, 5).as_control_change(), None);
    }

    #[test]
    fn test_frame_len_by_class() {
        assert_eq!(frame_len(0x90), Some(3));
        assert_eq!(frame_len(0xE5), Some(3));
        assert_eq!(frame_len(0xC3), Some(2));
        assert_eq!(frame_len(0xD0), Some(2));
        assert_eq!(frame_len(0xF0), None);
        assert_eq!(frame_len(0x40), None);
    }

    #[test]
    fn test_kind_roundtrips_status_nibble() {
        assert_eq!(MessageKind::from_status(0xA7).status_nibble(), 0xA0);
        assert_eq!(MessageKind::from_status(0x83), MessageKind::NoteOff);
    }

    #[test]
    fn test_14bit_split_and_join() {
        assert_eq!(convert::split_14bit(0x3FFF), (0x7F, 0x7F));
        assert_eq!(convert::split_14bit(656), (5, 0x10));
        assert_eq!(convert::join_14bit(0x7F, 0x3F), 16319);
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[0xB1, 0x63, 0x00]), "B1 63 00");
    }
}
