//! Parameter/value exchange reassembly
//!
//! The interface exchanges typed information as NRPN-style sequences of four
//! control changes on the exchange channel: parameter MSB, parameter LSB,
//! data MSB, data LSB. There is no framing or checksum, so an exchange is only
//! accepted when its four parts arrive as an unbroken run of consecutive
//! controller events. A dropped or interleaved part makes the whole exchange
//! disappear; the periodic inquiries of the session layer recover from that.

use std::fmt;

use tracing::trace;

use crate::midi::{convert, ChannelMessage};
use crate::protocol::{CC_DATA_HIGH, CC_DATA_LOW, CC_PARAM_HIGH, CC_PARAM_LOW, EXCHANGE_CHANNEL};

/// A completed parameter/value exchange (both fields 14-bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangePair {
    pub parameter: u16,
    pub value: u16,
}

impl ExchangePair {
    pub fn new(parameter: u16, value: u16) -> Self {
        Self { parameter, value }
    }
}

impl fmt::Display for ExchangePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "param:{} value:{:#06X}", self.parameter, self.value)
    }
}

/// One control change accepted on the exchange channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerEvent {
    pub channel: u8,
    pub controller: u8,
    pub value: u8,
    /// Receipt order, strictly increasing and never reused
    pub sequence: u64,
    /// Connection epoch the event was received in
    pub epoch: u64,
}

/// Which quarter of an exchange a controller number carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    ParamHigh = 0,
    ParamLow = 1,
    DataHigh = 2,
    DataLow = 3,
}

impl Role {
    fn from_controller(controller: u8) -> Option<Self> {
        match controller {
            CC_PARAM_HIGH => Some(Role::ParamHigh),
            CC_PARAM_LOW => Some(Role::ParamLow),
            CC_DATA_HIGH => Some(Role::DataHigh),
            CC_DATA_LOW => Some(Role::DataLow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: u8,
    sequence: u64,
    epoch: u64,
}

/// Reassembles exchanges from controller events on one channel
#[derive(Debug)]
pub struct ExchangeAssembler {
    channel: u8,
    next_sequence: u64,
    epoch: u64,
    slots: [Option<Slot>; 4],
}

impl Default for ExchangeAssembler {
    fn default() -> Self {
        Self::new(EXCHANGE_CHANNEL)
    }
}

impl ExchangeAssembler {
    /// Create an assembler listening on `channel`
    pub fn new(channel: u8) -> Self {
        Self {
            channel: channel & 0x0F,
            next_sequence: 0,
            epoch: 0,
            slots: [None; 4],
        }
    }

    /// Start from a given connection epoch
    pub fn with_epoch(channel: u8, epoch: u64) -> Self {
        Self {
            epoch,
            ..Self::new(channel)
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Sequence number the next accepted controller event will carry
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Filter a decoded message down to a controller event on the exchange
    /// channel, stamping it with the next receipt sequence.
    ///
    /// Non-CC messages on the channel (ORK buttons, knob) do not take a
    /// sequence number.
    pub fn stamp(&mut self, message: &ChannelMessage) -> Option<ControllerEvent> {
        if message.channel != self.channel {
            return None;
        }
        let (controller, value) = message.as_control_change()?;

        let event = ControllerEvent {
            channel: message.channel,
            controller,
            value,
            sequence: self.next_sequence,
            epoch: self.epoch,
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);
        Some(event)
    }

    /// Feed one controller event; returns a pair when it completes an exchange
    pub fn accept(&mut self, event: ControllerEvent) -> Option<ExchangePair> {
        if event.epoch != self.epoch {
            trace!(
                event_epoch = event.epoch,
                epoch = self.epoch,
                "Ignoring controller event from another connection"
            );
            return None;
        }

        // Unrelated controllers only matter through the sequence gap they leave
        let role = Role::from_controller(event.controller)?;

        self.slots[role as usize] = Some(Slot {
            value: event.value,
            sequence: event.sequence,
            epoch: event.epoch,
        });

        if role != Role::DataLow {
            return None;
        }

        let pair = self.complete(event.sequence);
        if pair.is_none() {
            trace!(sequence = event.sequence, "Data LSB without an unbroken exchange run");
        }
        pair
    }

    /// Convenience: stamp and accept in one step
    pub fn observe(&mut self, message: &ChannelMessage) -> Option<ExchangePair> {
        let event = self.stamp(message)?;
        self.accept(event)
    }

    /// Drop all progress and move to a new connection epoch.
    ///
    /// The sequence counter keeps counting so numbers from the previous
    /// connection can never line up with new ones.
    pub fn reset(&mut self) -> u64 {
        self.slots = [None; 4];
        self.epoch = self.epoch.wrapping_add(1);
        self.epoch
    }

    fn complete(&self, last: u64) -> Option<ExchangePair> {
        let mut values = [0u8; 4];
        for (offset, slot) in self.slots.iter().enumerate() {
            let slot = slot.as_ref()?;
            let expected = last.checked_sub(3 - offset as u64)?;
            if slot.sequence != expected || slot.epoch != self.epoch {
                return None;
            }
            values[offset] = slot.value;
        }

        Some(ExchangePair {
            parameter: convert::join_14bit(values[0], values[1]),
            value: convert::join_14bit(values[2], values[3]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cc(controller: u8, value: u8) -> ChannelMessage {
        ChannelMessage::control_change(EXCHANGE_CHANNEL, controller, value)
    }

    fn feed(assembler: &mut ExchangeAssembler, messages: &[ChannelMessage]) -> Vec<ExchangePair> {
        messages.iter().filter_map(|m| assembler.observe(m)).collect()
    }

    #[test]
    fn test_in_order_exchange_assembles() {
        let mut assembler = ExchangeAssembler::default();
        let out = feed(
            &mut assembler,
            &[cc(0x63, 0x05), cc(0x62, 0x10), cc(0x06, 0x7F), cc(0x26, 0x3F)],
        );
        assert_eq!(out, vec![ExchangePair::new(656, 16319)]);
    }

    #[test]
    fn test_unrelated_controller_breaks_run() {
        let mut assembler = ExchangeAssembler::default();
        let out = feed(
            &mut assembler,
            &[cc(0x63, 0), cc(0x62, 1), cc(0x06, 0), cc(0x07, 64), cc(0x26, 2)],
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_retry_after_broken_run_succeeds() {
        let mut assembler = ExchangeAssembler::default();
        let out = feed(
            &mut assembler,
            &[
                cc(0x63, 0),
                cc(0x62, 1),
                cc(0x26, 2),
                cc(0x63, 0),
                cc(0x62, 1),
                cc(0x06, 0),
                cc(0x26, 2),
            ],
        );
        assert_eq!(out, vec![ExchangePair::new(1, 2)]);
    }

    #[test]
    fn test_out_of_order_roles_are_rejected() {
        let mut assembler = ExchangeAssembler::default();
        let out = feed(
            &mut assembler,
            &[cc(0x62, 1), cc(0x63, 0), cc(0x06, 0), cc(0x26, 2)],
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_fields_from_two_exchanges_do_not_stitch() {
        // Second exchange lost its param MSB: the stale one must not be reused
        let mut assembler = ExchangeAssembler::default();
        let out = feed(
            &mut assembler,
            &[
                cc(0x63, 0),
                cc(0x62, 1),
                cc(0x06, 0),
                cc(0x26, 1),
                cc(0x62, 4),
                cc(0x06, 0x7F),
                cc(0x26, 0x7F),
            ],
        );
        assert_eq!(out, vec![ExchangePair::new(1, 1)]);
    }

    #[test]
    fn test_other_channels_and_notes_do_not_take_sequence() {
        let mut assembler = ExchangeAssembler::default();
        let out = feed(
            &mut assembler,
            &[
                cc(0x63, 0),
                ChannelMessage::control_change(0, 0x07, 100),
                ChannelMessage::note_on(EXCHANGE_CHANNEL, 12, 127),
                cc(0x62, 1),
                cc(0x06, 0),
                cc(0x26, 0),
            ],
        );
        assert_eq!(out, vec![ExchangePair::new(1, 0)]);
        assert_eq!(assembler.next_sequence(), 4);
    }

    #[test]
    fn test_reset_discards_progress_and_keeps_counting() {
        let mut assembler = ExchangeAssembler::default();
        feed(&mut assembler, &[cc(0x63, 0), cc(0x62, 1), cc(0x06, 0)]);
        let before = assembler.next_sequence();

        assert_eq!(assembler.reset(), 1);
        assert_eq!(assembler.next_sequence(), before);
        assert!(feed(&mut assembler, &[cc(0x26, 2)]).is_empty());
    }

    #[test]
    fn test_stale_epoch_event_is_ignored() {
        let mut assembler = ExchangeAssembler::default();
        let stale: Vec<_> = [cc(0x63, 0), cc(0x62, 1), cc(0x06, 0), cc(0x26, 2)]
            .iter()
            .filter_map(|m| assembler.stamp(m))
            .collect();
        assembler.reset();

        let out: Vec<_> = stale.into_iter().filter_map(|e| assembler.accept(e)).collect();
        assert!(out.is_empty());
    }

    #[test]
    fn test_data_low_alone_at_start_does_not_underflow() {
        let mut assembler = ExchangeAssembler::default();
        assert!(assembler.observe(&cc(0x26, 1)).is_none());
    }
}
