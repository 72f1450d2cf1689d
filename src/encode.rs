//! Outbound encoders
//!
//! Stateless conversions from typed commands to the bytes the interface
//! expects: exchanges, display text and button lights.

use serde::{Deserialize, Serialize};

use crate::exchange::ExchangePair;
use crate::midi::{convert, ChannelMessage};
use crate::protocol::{
    BUTTON_COUNT, CC_DATA_HIGH, CC_DATA_LOW, CC_PARAM_HIGH, CC_PARAM_LOW, DISPLAY_CHANNEL, DISPLAY_ORK,
    DISPLAY_VK_CHAR_SECTIONS, DISPLAY_VK_DECIMAL_SECTIONS, DISPLAY_VK_LINE0, DISPLAY_VK_LINE1,
    EXCHANGE_CHANNEL, ORK_CHANNEL, VK_ALT_CHANNEL, VK_CHANNEL,
};

/// Four control-change frames carrying one exchange, in wire order
pub fn exchange_frames(channel: u8, pair: ExchangePair) -> [ChannelMessage; 4] {
    let (param_high, param_low) = convert::split_14bit(pair.parameter);
    let (data_high, data_low) = convert::split_14bit(pair.value);

    [
        ChannelMessage::control_change(channel, CC_PARAM_HIGH, param_high),
        ChannelMessage::control_change(channel, CC_PARAM_LOW, param_low),
        ChannelMessage::control_change(channel, CC_DATA_HIGH, data_high),
        ChannelMessage::control_change(channel, CC_DATA_LOW, data_low),
    ]
}

/// Encode an exchange on the exchange channel (12 bytes)
pub fn encode_exchange(pair: ExchangePair) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    for frame in exchange_frames(EXCHANGE_CHANNEL, pair) {
        frame.encode_into(&mut out);
    }
    out
}

/// Display addressed by a note number on the display channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayTarget {
    /// ORK 4-digit display with unit indicators
    Ork,
    /// VK display, top line
    VkLine0,
    /// VK display, bottom line
    VkLine1,
    /// Characters of one half of a VK line
    VkChars { line: VkLine, half: VkHalf },
    /// Decimal points of one half of a VK line
    VkDecimals { line: VkLine, half: VkHalf },
}

/// Line of the VK display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VkLine {
    Top,
    Bottom,
}

/// Half of a VK display line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VkHalf {
    Left,
    Right,
}

impl VkLine {
    fn index(self) -> usize {
        match self {
            VkLine::Top => 0,
            VkLine::Bottom => 1,
        }
    }

    fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "0" => Ok(VkLine::Top),
            "1" => Ok(VkLine::Bottom),
            other => anyhow::bail!("VK line must be 0 or 1, got '{}'", other),
        }
    }
}

impl VkHalf {
    fn index(self) -> usize {
        match self {
            VkHalf::Left => 0,
            VkHalf::Right => 1,
        }
    }

    fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "0" => Ok(VkHalf::Left),
            "1" => Ok(VkHalf::Right),
            other => anyhow::bail!("VK line half must be 0 or 1, got '{}'", other),
        }
    }
}

impl DisplayTarget {
    /// Note number selecting this display
    pub fn note(&self) -> u8 {
        match *self {
            DisplayTarget::Ork => DISPLAY_ORK,
            DisplayTarget::VkLine0 => DISPLAY_VK_LINE0,
            DisplayTarget::VkLine1 => DISPLAY_VK_LINE1,
            DisplayTarget::VkChars { line, half } => {
                DISPLAY_VK_CHAR_SECTIONS[line.index()][half.index()]
            }
            DisplayTarget::VkDecimals { line, half } => {
                DISPLAY_VK_DECIMAL_SECTIONS[line.index()][half.index()]
            }
        }
    }
}

impl std::str::FromStr for DisplayTarget {
    type Err = anyhow::Error;

    /// Accepts `ork`, `vk0`, `vk1`, and `chars:<line>:<half>` or
    /// `dots:<line>:<half>` with line and half each 0 or 1
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        let mut parts = lower.split(':');
        let head = parts.next().unwrap_or_default();

        let target = match (head, parts.next(), parts.next(), parts.next()) {
            ("ork", None, _, _) => DisplayTarget::Ork,
            ("vk0" | "line0", None, _, _) => DisplayTarget::VkLine0,
            ("vk1" | "line1", None, _, _) => DisplayTarget::VkLine1,
            ("chars", Some(line), Some(half), None) => DisplayTarget::VkChars {
                line: VkLine::parse(line)?,
                half: VkHalf::parse(half)?,
            },
            ("dots", Some(line), Some(half), None) => DisplayTarget::VkDecimals {
                line: VkLine::parse(line)?,
                half: VkHalf::parse(half)?,
            },
            _ => anyhow::bail!(
                "Unknown display '{}' (expected ork, vk0, vk1, chars:<0|1>:<0|1> or dots:<0|1>:<0|1>)",
                s
            ),
        };
        Ok(target)
    }
}

/// Encode display text: one note-on per character, then a note-off on the
/// same note which makes the device commit the line.
///
/// An empty string produces only the terminator.
pub fn encode_display(target: DisplayTarget, text: &str) -> Vec<u8> {
    let note = target.note();
    let mut out = Vec::with_capacity((text.len() + 1) * 3);

    for byte in text.bytes() {
        ChannelMessage::note_on(DISPLAY_CHANNEL, note, byte & 0x7F).encode_into(&mut out);
    }
    ChannelMessage::note_off(DISPLAY_CHANNEL, note, 0).encode_into(&mut out);

    out
}

/// Button light level, sent as the note-on velocity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LightLevel {
    Off,
    /// Dim; the VK shows this as off
    Held,
    Blinking,
    On,
}

impl LightLevel {
    pub fn velocity(&self) -> u8 {
        match self {
            LightLevel::Off => 0,
            LightLevel::Held => 32,
            LightLevel::Blinking => 64,
            LightLevel::On => 127,
        }
    }
}

impl std::str::FromStr for LightLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(LightLevel::Off),
            "held" | "dim" => Ok(LightLevel::Held),
            "blink" | "blinking" => Ok(LightLevel::Blinking),
            "on" => Ok(LightLevel::On),
            other => anyhow::bail!("Unknown light level '{}'", other),
        }
    }
}

/// Button bank, each on its own channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonGroup {
    Ork,
    Vk,
    VkAlt,
}

impl ButtonGroup {
    pub fn channel(&self) -> u8 {
        match self {
            ButtonGroup::Ork => ORK_CHANNEL,
            ButtonGroup::Vk => VK_CHANNEL,
            ButtonGroup::VkAlt => VK_ALT_CHANNEL,
        }
    }
}

impl std::str::FromStr for ButtonGroup {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ork" => Ok(ButtonGroup::Ork),
            "vk" => Ok(ButtonGroup::Vk),
            "vkalt" | "vk_alt" | "alt" => Ok(ButtonGroup::VkAlt),
            other => anyhow::bail!("Unknown button group '{}' (expected ork, vk or vkalt)", other),
        }
    }
}

/// Encode a button light. A velocity of 0 turns the light off.
///
/// Returns `None` for button numbers outside the bank.
pub fn encode_button(group: ButtonGroup, button: u8, level: LightLevel) -> Option<[u8; 3]> {
    if button >= BUTTON_COUNT {
        return None;
    }
    let msg = ChannelMessage::note_on(group.channel(), button, level.velocity());
    Some([msg.status(), msg.data1, level.velocity()])
}
