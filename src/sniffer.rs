//! MIDI sniffer for debugging and development
//!
//! Listens on the KBI-1 input port (or any port by name or index) without
//! talking back, and prints every decoded channel message plus the exchanges
//! reassembled from them.

use anyhow::Result;
use colored::*;
use midir::{MidiInput, MidiInputConnection};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::info;

use crate::exchange::ExchangePair;
use crate::framing::FramingPolicy;
use crate::midi::{format_hex, ChannelMessage, MessageKind};
use crate::protocol::{
    ASK_VALUE, IDENTITY_ALTERNATE, IDENTITY_SELF, PARAM_CLEAR, PARAM_ECHO, PARAM_IDENTITY,
    PARAM_REFRESH, PARAM_STATUS, STATUS_NONE, STATUS_ORK, STATUS_VK,
};
use crate::transport::{discovery, InboundDecoder, InboundEvent, InboundKind, MidiTransport, INBOUND_CAPACITY};

/// CLI MIDI sniffer
pub async fn run_cli_sniffer(pattern: &str, framing: FramingPolicy) -> Result<()> {
    println!("{}", "=== KBI-1 Sniffer ===".bold().cyan());
    println!("Press Ctrl+C to exit\n");

    list_ports_formatted(pattern);

    let mut sniffer = CliSniffer::new();
    sniffer.connect_input(pattern, framing)?;

    println!("\n{}", "Monitoring MIDI traffic...".green());
    println!("{}", "Format: [timestamp] MESSAGE  or  [timestamp] EXCHANGE".dimmed());
    println!("{}\n", "─".repeat(80).dimmed());

    sniffer.run().await
}

/// CLI sniffer implementation
struct CliSniffer {
    connection: Option<MidiInputConnection<()>>,
    event_rx: mpsc::Receiver<InboundEvent>,
    event_tx: mpsc::Sender<InboundEvent>,
    start_time: Instant,
}

impl CliSniffer {
    fn new() -> Self {
        let (event_tx, event_rx) = mpsc::channel(INBOUND_CAPACITY);

        Self {
            connection: None,
            event_rx,
            event_tx,
            start_time: Instant::now(),
        }
    }

    fn connect_input(&mut self, pattern: &str, framing: FramingPolicy) -> Result<()> {
        let midi_in = MidiInput::new("KBI-Host-Sniffer")?;

        // A numeric pattern selects a port by index
        let (port, name) = if let Ok(index) = pattern.parse::<usize>() {
            let port = midi_in
                .ports()
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("No port found at index: {}", index))?;
            let name = midi_in.port_name(&port)?;
            (port, name)
        } else {
            MidiTransport::find_input_port(&midi_in, pattern)
                .ok_or_else(|| anyhow::anyhow!("No port found matching pattern: {}", pattern))?
        };

        info!("Connecting to: {}", name);

        let mut decoder = InboundDecoder::new(framing, 0, self.event_tx.clone()).forwarding_messages();
        let conn = midi_in
            .connect(
                &port,
                "Sniffer",
                move |_timestamp, data, _| decoder.on_packet(data),
                (),
            )
            .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", name, e))?;

        self.connection = Some(conn);
        Ok(())
    }

    async fn run(mut self) -> Result<()> {
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(event) = self.event_rx.recv() => self.print_event(&event),
                _ = &mut shutdown => break,
            }
        }

        self.connection = None;
        println!("\n{}", "Sniffer stopped".yellow());
        Ok(())
    }

    fn print_event(&self, event: &InboundEvent) {
        let timestamp = format!("{:08}", self.start_time.elapsed().as_millis());

        match event.kind {
            InboundKind::Message(message) => {
                let hex = format_hex(&message.encode());
                println!("[{}ms] {:9} | {}", timestamp.dimmed(), color_by_kind(&message, hex), message);
            }
            InboundKind::Exchange(pair) => {
                println!(
                    "[{}ms] {} {}",
                    timestamp.dimmed(),
                    "EXCHANGE".bold().bright_magenta(),
                    describe_exchange(pair).bright_blue()
                );
            }
        }
    }
}

fn color_by_kind(message: &ChannelMessage, hex: String) -> ColoredString {
    match message.kind {
        MessageKind::NoteOn => hex.bright_green(),
        MessageKind::NoteOff => hex.bright_red(),
        MessageKind::ControlChange => hex.bright_yellow(),
        MessageKind::Other(_) => hex.bright_cyan(),
    }
}

/// Human-readable meaning of an exchange coming from the device
pub fn describe_exchange(pair: ExchangePair) -> String {
    let value = if pair.value == ASK_VALUE {
        "ask".to_string()
    } else {
        pair.value.to_string()
    };

    match (pair.parameter, pair.value) {
        (PARAM_IDENTITY, IDENTITY_SELF) => "identity = KBI-1".to_string(),
        (PARAM_IDENTITY, IDENTITY_ALTERNATE) => "identity = alternate product".to_string(),
        (PARAM_IDENTITY, _) => format!("identity = {}", value),
        (PARAM_STATUS, STATUS_NONE) => "status = nothing attached".to_string(),
        (PARAM_STATUS, STATUS_ORK) => "status = ORK".to_string(),
        (PARAM_STATUS, STATUS_VK) => "status = VK".to_string(),
        (PARAM_STATUS, _) => format!("status = {}", value),
        (PARAM_CLEAR, _) => format!("clear = {}", value),
        (PARAM_ECHO, _) => format!("echo = {}", value),
        (PARAM_REFRESH, ASK_VALUE) => "refresh requested".to_string(),
        _ => format!("{}", pair),
    }
}

/// List all ports in a formatted way, marking the ones matching `pattern`
pub fn list_ports_formatted(pattern: &str) {
    println!("\n{}", "=== Available MIDI Ports ===".bold().cyan());

    let lowered = pattern.to_lowercase();
    let print_port = |port: &discovery::PortInfo| {
        if port.name.to_lowercase().contains(&lowered) {
            println!("  {:3} {} {}", port.index, port.name.bright_white(), "[KBI-1]".green());
        } else {
            println!("  {:3} {}", port.index, port.name);
        }
    };

    if let Ok(inputs) = discovery::discover_input_ports() {
        println!("\n{}", "Input Ports:".bold());
        if inputs.is_empty() {
            println!("  {}", "No input ports found".dimmed());
        }
        inputs.iter().for_each(print_port);
    }

    if let Ok(outputs) = discovery::discover_output_ports() {
        println!("\n{}", "Output Ports:".bold());
        if outputs.is_empty() {
            println!("  {}", "No output ports found".dimmed());
        }
        outputs.iter().for_each(print_port);
    }

    println!();
}
