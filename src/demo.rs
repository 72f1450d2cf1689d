//! Display counter and button light chase
//!
//! Shows that a connected keyboard is alive: each tick writes the tick count to
//! its display and moves a single lit button one step along the bank.

use crate::encode::{encode_button, encode_display, ButtonGroup, DisplayTarget, LightLevel};
use crate::protocol::BUTTON_COUNT;
use crate::session::SubPeripheral;

#[derive(Debug, Default)]
pub struct DemoAnimation {
    /// Button currently lit, if any
    cursor: Option<u8>,
}

impl DemoAnimation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart the chase from button 0 (the display was just cleared)
    pub fn reset(&mut self) {
        self.cursor = None;
    }

    pub fn cursor(&self) -> Option<u8> {
        self.cursor
    }

    /// Bytes for one animation step on the given keyboard
    pub fn step(&mut self, kind: SubPeripheral, tick: u64) -> Vec<u8> {
        let (target, text, group) = match kind {
            SubPeripheral::Ork => (DisplayTarget::Ork, format!("{:4}", tick % 1000), ButtonGroup::Ork),
            SubPeripheral::Vk => (DisplayTarget::VkLine0, format!("{:10}", tick), ButtonGroup::Vk),
        };

        let mut out = encode_display(target, &text);

        if let Some(previous) = self.cursor {
            out.extend(encode_button(group, previous, LightLevel::Off).into_iter().flatten());
        }

        let next = match self.cursor {
            Some(previous) => (previous + 1) % BUTTON_COUNT,
            None => 0,
        };
        out.extend(encode_button(group, next, LightLevel::On).into_iter().flatten());
        self.cursor = Some(next);

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_step_lights_button_zero() {
        let mut demo = DemoAnimation::new();
        let bytes = demo.step(SubPeripheral::Ork, 7);

        // "   7" + terminator, then button 0 on
        assert_eq!(bytes.len(), 5 * 3 + 3);
        assert_eq!(&bytes[bytes.len() - 3..], &[0x91, 0, 127]);
        assert_eq!(demo.cursor(), Some(0));
    }

    #[test]
    fn test_chase_turns_previous_off_and_wraps() {
        let mut demo = DemoAnimation::new();
        for tick in 0..128 {
            demo.step(SubPeripheral::Vk, tick);
        }
        assert_eq!(demo.cursor(), Some(127));

        let bytes = demo.step(SubPeripheral::Vk, 128);
        let tail = &bytes[bytes.len() - 6..];
        assert_eq!(tail, &[0x92, 127, 0, 0x92, 0, 127]);
    }

    #[test]
    fn test_ork_counter_wraps_at_thousand() {
        let mut demo = DemoAnimation::new();
        let bytes = demo.step(SubPeripheral::Ork, 1234);
        let chars: Vec<u8> = bytes.chunks(3).take(4).map(|f| f[2]).collect();
        assert_eq!(chars, b" 234");
    }

    #[test]
    fn test_reset_restarts_chase() {
        let mut demo = DemoAnimation::new();
        demo.step(SubPeripheral::Vk, 0);
        demo.step(SubPeripheral::Vk, 1);
        demo.reset();
        let bytes = demo.step(SubPeripheral::Vk, 2);
        assert_eq!(&bytes[bytes.len() - 3..], &[0x92, 0, 127]);
        assert_eq!(demo.cursor(), Some(0));
    }
}
