//! KBI-1 MIDI transport
//!
//! Finds the interface's input and output ports, decodes inbound packets on
//! the MIDI callback thread and hands the results to the session task over a
//! channel. Everything that touches the session happens on the receiving side.

use async_trait::async_trait;
use midir::{MidiInput, MidiInputConnection, MidiInputPort, MidiOutput, MidiOutputConnection, MidiOutputPort};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::exchange::{ExchangeAssembler, ExchangePair};
use crate::framing::{Framer, FramingPolicy};
use crate::midi::{format_hex, ChannelMessage};
use crate::protocol::EXCHANGE_CHANNEL;

/// Capacity of the callback → session channel
pub const INBOUND_CAPACITY: usize = 1000;

/// Errors from opening or using the device ports
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The MIDI services client could not be created
    #[error("MIDI init failed: {0}")]
    Init(String),

    /// No port name matched the configured pattern
    #[error("{direction} port matching '{pattern}' not found")]
    PortNotFound {
        direction: &'static str,
        pattern: String,
    },

    /// A matching port was found but could not be opened
    #[error("failed to connect to {direction} port '{port}': {reason}")]
    Connect {
        direction: &'static str,
        port: String,
        reason: String,
    },

    /// Sending to the output port failed
    #[error("send failed: {0}")]
    Send(String),

    /// Send attempted with no open output port
    #[error("not connected")]
    NotConnected,
}

/// Something decoded from the device, tagged with its connection epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundEvent {
    pub epoch: u64,
    pub kind: InboundKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    /// Any decoded channel message (keys, buttons, controllers). Only
    /// produced by decoders built with [`InboundDecoder::forwarding_messages`].
    Message(ChannelMessage),
    /// A completed parameter/value exchange
    Exchange(ExchangePair),
}

/// Device endpoints as seen by the session runner
#[async_trait]
pub trait Transport: Send {
    /// Look for the device and open both endpoints. Inbound events of this
    /// connection are delivered to `inbound` tagged with `epoch`.
    async fn open(&mut self, epoch: u64, inbound: mpsc::Sender<InboundEvent>) -> Result<(), TransportError>;

    /// Whether both endpoints are open
    fn is_open(&self) -> bool;

    /// Whether the device's ports are still registered with the system
    fn is_present(&self) -> bool;

    /// Send raw bytes to the output endpoint
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Close both endpoints
    fn close(&mut self);
}

/// Per-connection inbound decoding, run on the MIDI callback thread.
///
/// Only completed exchanges are forwarded by default, so a burst of key or
/// controller traffic cannot fill the channel ahead of a status reply.
pub struct InboundDecoder {
    framer: Framer,
    assembler: ExchangeAssembler,
    epoch: u64,
    forward_messages: bool,
    tx: mpsc::Sender<InboundEvent>,
}

impl InboundDecoder {
    pub fn new(policy: FramingPolicy, epoch: u64, tx: mpsc::Sender<InboundEvent>) -> Self {
        Self {
            framer: Framer::new(policy),
            assembler: ExchangeAssembler::with_epoch(EXCHANGE_CHANNEL, epoch),
            epoch,
            forward_messages: false,
            tx,
        }
    }

    /// Also forward every decoded channel message (used by the sniffer)
    pub fn forwarding_messages(mut self) -> Self {
        self.forward_messages = true;
        self
    }

    /// Decode one delivery unit and forward what it contained
    pub fn on_packet(&mut self, data: &[u8]) {
        trace!("RX {}", format_hex(data));

        for message in self.framer.feed(data) {
            let exchange = self.assembler.observe(&message);

            if self.forward_messages {
                Self::forward(&self.tx, self.epoch, InboundKind::Message(message));
            }
            if let Some(pair) = exchange {
                Self::forward(&self.tx, self.epoch, InboundKind::Exchange(pair));
            }
        }
    }

    fn forward(tx: &mpsc::Sender<InboundEvent>, epoch: u64, kind: InboundKind) {
        // Never block the MIDI thread
        if let Err(e) = tx.try_send(InboundEvent { epoch, kind }) {
            debug!("Dropping inbound event: {}", e);
        }
    }
}

/// midir-backed transport
pub struct MidiTransport {
    /// Port name pattern (case-insensitive substring)
    port_pattern: String,
    client_name: String,
    framing: FramingPolicy,
    input_conn: Option<MidiInputConnection<()>>,
    output_conn: Option<MidiOutputConnection>,
}

impl MidiTransport {
    pub fn new(port_pattern: impl Into<String>, client_name: impl Into<String>, framing: FramingPolicy) -> Self {
        Self {
            port_pattern: port_pattern.into(),
            client_name: client_name.into(),
            framing,
            input_conn: None,
            output_conn: None,
        }
    }

    /// Find an input port by substring match
    pub fn find_input_port(midi_in: &MidiInput, pattern: &str) -> Option<(MidiInputPort, String)> {
        let pattern = pattern.to_lowercase();
        midi_in.ports().into_iter().find_map(|port| {
            let name = midi_in.port_name(&port).ok()?;
            name.to_lowercase().contains(&pattern).then_some((port, name))
        })
    }

    /// Find an output port by substring match
    pub fn find_output_port(midi_out: &MidiOutput, pattern: &str) -> Option<(MidiOutputPort, String)> {
        let pattern = pattern.to_lowercase();
        midi_out.ports().into_iter().find_map(|port| {
            let name = midi_out.port_name(&port).ok()?;
            name.to_lowercase().contains(&pattern).then_some((port, name))
        })
    }

    fn open_input(&self, epoch: u64, inbound: mpsc::Sender<InboundEvent>) -> Result<MidiInputConnection<()>, TransportError> {
        let midi_in = MidiInput::new(&format!("{}-Input", self.client_name))
            .map_err(|e| TransportError::Init(e.to_string()))?;

        let (port, name) = Self::find_input_port(&midi_in, &self.port_pattern).ok_or_else(|| {
            TransportError::PortNotFound {
                direction: "input",
                pattern: self.port_pattern.clone(),
            }
        })?;

        debug!("Connecting to input port: {}", name);

        let mut decoder = InboundDecoder::new(self.framing, epoch, inbound);
        midi_in
            .connect(
                &port,
                &self.client_name,
                move |_timestamp, data, _| decoder.on_packet(data),
                (),
            )
            .map_err(|e| TransportError::Connect {
                direction: "input",
                port: name,
                reason: e.to_string(),
            })
    }

    fn open_output(&self) -> Result<MidiOutputConnection, TransportError> {
        let midi_out = MidiOutput::new(&format!("{}-Output", self.client_name))
            .map_err(|e| TransportError::Init(e.to_string()))?;

        let (port, name) = Self::find_output_port(&midi_out, &self.port_pattern).ok_or_else(|| {
            TransportError::PortNotFound {
                direction: "output",
                pattern: self.port_pattern.clone(),
            }
        })?;

        debug!("Connecting to output port: {}", name);

        midi_out
            .connect(&port, &self.client_name)
            .map_err(|e| TransportError::Connect {
                direction: "output",
                port: name,
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl Transport for MidiTransport {
    async fn open(&mut self, epoch: u64, inbound: mpsc::Sender<InboundEvent>) -> Result<(), TransportError> {
        self.close();

        let input = self.open_input(epoch, inbound)?;
        let output = self.open_output()?;

        self.input_conn = Some(input);
        self.output_conn = Some(output);

        info!("KBI-1 ports opened (epoch {})", epoch);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.input_conn.is_some() && self.output_conn.is_some()
    }

    fn is_present(&self) -> bool {
        let input = MidiInput::new(&format!("{}-Scanner", self.client_name))
            .map(|midi_in| Self::find_input_port(&midi_in, &self.port_pattern).is_some())
            .unwrap_or(false);
        let output = MidiOutput::new(&format!("{}-Scanner", self.client_name))
            .map(|midi_out| Self::find_output_port(&midi_out, &self.port_pattern).is_some())
            .unwrap_or(false);
        input && output
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let conn = self.output_conn.as_mut().ok_or(TransportError::NotConnected)?;

        // The device expects whole 3-byte messages per packet
        for frame in bytes.chunks(3) {
            conn.send(frame).map_err(|e| TransportError::Send(e.to_string()))?;
        }

        debug!("TX {}", format_hex(bytes));
        Ok(())
    }

    fn close(&mut self) {
        if self.is_open() {
            debug!("Closing KBI-1 ports");
        }
        self.input_conn = None;
        self.output_conn = None;
    }
}

/// Port discovery utilities
pub mod discovery {
    use super::*;

    /// Information about a MIDI port
    #[derive(Debug, Clone)]
    pub struct PortInfo {
        pub index: usize,
        pub name: String,
    }

    /// Discover input ports
    pub fn discover_input_ports() -> anyhow::Result<Vec<PortInfo>> {
        let midi_in = MidiInput::new("KBI-Host-Discovery")?;
        Ok(midi_in
            .ports()
            .iter()
            .enumerate()
            .filter_map(|(index, port)| {
                midi_in.port_name(port).ok().map(|name| PortInfo { index, name })
            })
            .collect())
    }

    /// Discover output ports
    pub fn discover_output_ports() -> anyhow::Result<Vec<PortInfo>> {
        let midi_out = MidiOutput::new("KBI-Host-Discovery")?;
        Ok(midi_out
            .ports()
            .iter()
            .enumerate()
            .filter_map(|(index, port)| {
                midi_out.port_name(port).ok().map(|name| PortInfo { index, name })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::encode_exchange;
    use crate::protocol::{PARAM_STATUS, STATUS_VK};

    fn drain(rx: &mut mpsc::Receiver<InboundEvent>) -> Vec<InboundEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_decoder_forwards_messages_and_exchange() {
        let (tx, mut rx) = mpsc::channel(INBOUND_CAPACITY);
        let mut decoder = InboundDecoder::new(FramingPolicy::DropPartial, 3, tx).forwarding_messages();

        decoder.on_packet(&[0x90, 60, 100]);
        decoder.on_packet(&encode_exchange(ExchangePair::new(1, 2)));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 6);
        assert!(events.iter().all(|e| e.epoch == 3));
        assert_eq!(
            events[0].kind,
            InboundKind::Message(ChannelMessage::note_on(0, 60, 100))
        );
        assert_eq!(
            events.last().map(|e| e.kind),
            Some(InboundKind::Exchange(ExchangePair::new(1, 2)))
        );
    }

    #[test]
    fn test_decoder_exchange_split_over_packets() {
        // One CC per packet, as the device sends them
        let (tx, mut rx) = mpsc::channel(INBOUND_CAPACITY);
        let mut decoder = InboundDecoder::new(FramingPolicy::DropPartial, 0, tx);

        for frame in encode_exchange(ExchangePair::new(0, 0)).chunks(3) {
            decoder.on_packet(frame);
        }

        let exchanges: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e.kind, InboundKind::Exchange(_)))
            .collect();
        assert_eq!(exchanges.len(), 1);
    }

    #[test]
    fn test_decoder_does_not_block_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut decoder = InboundDecoder::new(FramingPolicy::DropPartial, 0, tx).forwarding_messages();

        decoder.on_packet(&[0x90, 1, 1, 0x90, 2, 2, 0x90, 3, 3]);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_decoder_forwards_only_exchanges_by_default() {
        let (tx, mut rx) = mpsc::channel(INBOUND_CAPACITY);
        let mut decoder = InboundDecoder::new(FramingPolicy::DropPartial, 0, tx);

        decoder.on_packet(&[0x90, 60, 100, 0xB0, 7, 64]);
        decoder.on_packet(&encode_exchange(ExchangePair::new(1, 2)));

        let kinds: Vec<_> = drain(&mut rx).into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![InboundKind::Exchange(ExchangePair::new(1, 2))]);
    }

    #[test]
    fn test_status_reply_survives_pitch_bend_burst() {
        // Channel with a single slot: the reply must still get it
        let (tx, mut rx) = mpsc::channel(1);
        let mut decoder = InboundDecoder::new(FramingPolicy::DropPartial, 0, tx);

        let burst: Vec<u8> = (0..2000u16)
            .flat_map(|i| [0xE0, (i & 0x7F) as u8, ((i >> 7) & 0x7F) as u8])
            .collect();
        decoder.on_packet(&burst);
        decoder.on_packet(&encode_exchange(ExchangePair::new(PARAM_STATUS, STATUS_VK)));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].kind,
            InboundKind::Exchange(ExchangePair::new(PARAM_STATUS, STATUS_VK))
        );
    }

    #[test]
    fn test_port_discovery() {
        // Only checks that discovery doesn't panic without MIDI hardware
        let _ = discovery::discover_input_ports();
        let _ = discovery::discover_output_ports();
    }
}
