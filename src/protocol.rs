//! KBI-1 wire protocol constants
//!
//! Channel assignments, exchange (NRPN) roles and parameters, light levels and
//! display addressing. All channel numbers are zero-based.

/// Port name the interface registers with the host MIDI services
pub const DEVICE_PORT_NAME: &str = "Synclavier KBI-1";

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// Note on/off, aftertouch, pitch bend and pedal controllers from the keyboard
pub const NOTE_CHANNEL: u8 = 0;

/// Parameter/value exchanges in both directions
pub const EXCHANGE_CHANNEL: u8 = 1;

/// ORK buttons and the ORK knob (pitch bend); shared with the exchange channel
pub const ORK_CHANNEL: u8 = 1;

/// First 128 VK buttons
pub const VK_CHANNEL: u8 = 2;

/// Right-most panel of 32 VK buttons
pub const VK_ALT_CHANNEL: u8 = 3;

/// Display text (host to device only)
pub const DISPLAY_CHANNEL: u8 = 4;

/// Ribbon controller, pitch bend only
pub const RIBBON_CHANNEL: u8 = 5;

// ---------------------------------------------------------------------------
// Exchange roles (controller numbers)
// ---------------------------------------------------------------------------

pub const CC_PARAM_HIGH: u8 = 0x63;
pub const CC_PARAM_LOW: u8 = 0x62;
pub const CC_DATA_HIGH: u8 = 0x06;
pub const CC_DATA_LOW: u8 = 0x26;

// ---------------------------------------------------------------------------
// Exchange parameters and values
// ---------------------------------------------------------------------------

/// Identity query (host) / identity response (device)
pub const PARAM_IDENTITY: u16 = 0;

/// Status query (host) / status push (device)
pub const PARAM_STATUS: u16 = 1;

/// Clear the display and turn off all lights
pub const PARAM_CLEAR: u16 = 2;

/// Echoed back by the device
pub const PARAM_ECHO: u16 = 3;

/// Sent by the device when it needs the host to redraw everything
pub const PARAM_REFRESH: u16 = 4;

/// "Report the current value" instead of setting one
pub const ASK_VALUE: u16 = 0x3FFF;

/// Largest value a 14-bit exchange field can carry
pub const MAX_FIELD: u16 = 0x3FFF;

pub const IDENTITY_SELF: u16 = 0;
pub const IDENTITY_ALTERNATE: u16 = 1;

pub const STATUS_NONE: u16 = 0;
pub const STATUS_ORK: u16 = 1;
pub const STATUS_VK: u16 = 2;

// ---------------------------------------------------------------------------
// Display addressing (note numbers on DISPLAY_CHANNEL)
// ---------------------------------------------------------------------------

pub const DISPLAY_ORK: u8 = 0;
pub const DISPLAY_VK_LINE0: u8 = 1;
pub const DISPLAY_VK_LINE1: u8 = 2;

/// VK character sections, indexed `[line][section]`
pub const DISPLAY_VK_CHAR_SECTIONS: [[u8; 2]; 2] = [[3, 4], [5, 6]];

/// VK decimal-point sections, indexed `[line][section]`
pub const DISPLAY_VK_DECIMAL_SECTIONS: [[u8; 2]; 2] = [[7, 8], [9, 10]];

/// Number of addressable buttons per button channel
pub const BUTTON_COUNT: u8 = 128;
