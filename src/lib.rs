//! Host-side driver for the Synclavier KBI-1 keyboard interface
//!
//! Layers, bottom-up: [`framing`] turns the inbound byte stream into channel
//! messages, [`exchange`] reassembles four-controller parameter exchanges,
//! [`session`] tracks attachment, identity and the attached keyboard, and
//! [`encode`] produces everything sent back. [`runtime`] ties them to a
//! [`transport`].

pub mod cli;
pub mod config;
pub mod demo;
pub mod encode;
pub mod exchange;
pub mod framing;
pub mod midi;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod sniffer;
pub mod transport;
