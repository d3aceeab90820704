//! DR16 receiver protocol
//!
//! The DR16 sends one 18-byte frame every 14 ms:
//!
//! | bytes  | content                                                     |
//! | :----- | :---------------------------------------------------------- |
//! | 0..6   | four 11-bit sticks, then two 2-bit switches, little-endian  |
//! | 6..12  | mouse x, y, z as `i16` LE                                   |
//! | 12, 13 | left, right mouse button                                    |
//! | 14..16 | keyboard bitmask, `u16` LE                                  |
//! | 16..18 | 11-bit wheel, LE                                            |
//!
//! Stick and wheel values are valid within `364..=1684` and centred on
//! 1024. A frame with any of them out of range is rejected as a whole.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::arbiter::{RcDecodeError, RcProtocol};

/// Length of one frame
pub const FRAME_LEN: usize = 18;
/// Lowest valid stick or wheel value
pub const CH_MIN: u16 = 364;
/// Highest valid stick or wheel value
pub const CH_MAX: u16 = 1684;
/// Stick or wheel value at rest
pub const CH_OFFSET: u16 = 1024;

const CH_MASK: u64 = 0x7FF;

/// A three-position switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Switch {
    /// Up
    Up,
    /// Middle
    Mid,
    /// Down
    Down,
    /// Not a valid position, e.g. before the first frame
    #[default]
    Unknown,
}

impl Switch {
    /// Map the 2-bit wire value
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Switch::Up,
            3 => Switch::Mid,
            2 => Switch::Down,
            _ => Switch::Unknown,
        }
    }

    /// The 2-bit wire value
    pub fn to_raw(self) -> u8 {
        match self {
            Switch::Up => 1,
            Switch::Mid => 3,
            Switch::Down => 2,
            Switch::Unknown => 0,
        }
    }
}

/// Keyboard state, one bit per key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct Keys(pub u16);

#[allow(missing_docs)]
impl Keys {
    pub const W: Self = Keys(1 << 0);
    pub const S: Self = Keys(1 << 1);
    pub const A: Self = Keys(1 << 2);
    pub const D: Self = Keys(1 << 3);
    pub const SHIFT: Self = Keys(1 << 4);
    pub const CTRL: Self = Keys(1 << 5);
    pub const Q: Self = Keys(1 << 6);
    pub const E: Self = Keys(1 << 7);
    pub const R: Self = Keys(1 << 8);
    pub const F: Self = Keys(1 << 9);
    pub const G: Self = Keys(1 << 10);
    pub const Z: Self = Keys(1 << 11);
    pub const X: Self = Keys(1 << 12);
    pub const C: Self = Keys(1 << 13);
    pub const V: Self = Keys(1 << 14);
    pub const B: Self = Keys(1 << 15);
}

impl Keys {
    /// Are all keys in `keys` held?
    pub fn contains(self, keys: Keys) -> bool {
        self.0 & keys.0 == keys.0
    }

    /// Is no key held?
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl core::ops::BitOr for Keys {
    type Output = Keys;

    fn bitor(self, rhs: Keys) -> Keys {
        Keys(self.0 | rhs.0)
    }
}

/// Sticks, wheel and switches, centred on zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RcSticks {
    /// Right horizontal, right vertical, left horizontal, left vertical
    pub ch: [i16; 4],
    /// Thumb wheel
    pub wheel: i16,
    /// Left and right switch
    pub s: [Switch; 2],
}

/// Mouse state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Mouse {
    /// Horizontal speed
    pub x: i16,
    /// Vertical speed
    pub y: i16,
    /// Scroll speed
    pub z: i16,
    /// Left button
    pub press_l: bool,
    /// Right button
    pub press_r: bool,
}

/// One decoded and validated frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Dr16Control {
    /// Remote control
    pub rc: RcSticks,
    /// Mouse
    pub mouse: Mouse,
    /// Keyboard
    pub keys: Keys,
}

/// A frame's fields as they are on the wire, not validated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dr16Raw {
    /// Sticks, `0..2048`
    pub ch: [u16; 4],
    /// Switches, 2 bits each
    pub s: [u8; 2],
    /// Mouse speeds
    pub mouse: [i16; 3],
    /// Mouse buttons
    pub press: [u8; 2],
    /// Keyboard bitmask
    pub keys: u16,
    /// Wheel, `0..2048`
    pub wheel: u16,
}

/// The DR16 protocol
pub struct Dr16;

impl Dr16 {
    /// Split a frame into its wire fields
    pub fn parse(buf: &[u8; FRAME_LEN]) -> Dr16Raw {
        let mut packed = [0u8; 8];
        packed[..6].copy_from_slice(&buf[..6]);
        let bits = u64::from_le_bytes(packed);
        let i16_at = |i: usize| i16::from_le_bytes([buf[i], buf[i + 1]]);

        Dr16Raw {
            ch: core::array::from_fn(|i| ((bits >> (11 * i)) & CH_MASK) as u16),
            s: [((bits >> 46) & 0b11) as u8, ((bits >> 44) & 0b11) as u8],
            mouse: [i16_at(6), i16_at(8), i16_at(10)],
            press: [buf[12], buf[13]],
            keys: u16::from_le_bytes([buf[14], buf[15]]),
            wheel: u16::from_le_bytes([buf[16], buf[17]]) & CH_MASK as u16,
        }
    }

    /// Build a frame from wire fields, for loopback and simulation
    ///
    /// Out of range fields are truncated to their bit width.
    pub fn encode(raw: &Dr16Raw) -> [u8; FRAME_LEN] {
        let mut bits = 0u64;
        for (i, ch) in raw.ch.iter().enumerate() {
            bits |= (u64::from(*ch) & CH_MASK) << (11 * i);
        }
        bits |= u64::from(raw.s[1] & 0b11) << 44;
        bits |= u64::from(raw.s[0] & 0b11) << 46;

        let mut out = [0u8; FRAME_LEN];
        out[..6].copy_from_slice(&bits.to_le_bytes()[..6]);
        for (i, m) in raw.mouse.iter().enumerate() {
            out[6 + 2 * i..][..2].copy_from_slice(&m.to_le_bytes());
        }
        out[12] = raw.press[0];
        out[13] = raw.press[1];
        out[14..16].copy_from_slice(&raw.keys.to_le_bytes());
        out[16..18].copy_from_slice(&(raw.wheel & CH_MASK as u16).to_le_bytes());
        out
    }

    /// Check the ranges of `raw`, and centre it
    pub fn validate(raw: &Dr16Raw) -> Result<Dr16Control, RcDecodeError> {
        let in_range = |v: u16| (CH_MIN..=CH_MAX).contains(&v);
        if !raw.ch.iter().copied().all(in_range) || !in_range(raw.wheel) {
            return Err(RcDecodeError::OutOfRange);
        }
        let centre = |v: u16| v as i16 - CH_OFFSET as i16;

        Ok(Dr16Control {
            rc: RcSticks {
                ch: raw.ch.map(centre),
                wheel: centre(raw.wheel),
                s: raw.s.map(Switch::from_raw),
            },
            mouse: Mouse {
                x: raw.mouse[0],
                y: raw.mouse[1],
                z: raw.mouse[2],
                press_l: raw.press[0] & 1 != 0,
                press_r: raw.press[1] & 1 != 0,
            },
            keys: Keys(raw.keys),
        })
    }
}

impl RcProtocol for Dr16 {
    const FRAME_LEN: usize = FRAME_LEN;
    type Control = Dr16Control;

    fn decode(buf: &[u8]) -> Result<Dr16Control, RcDecodeError> {
        let buf: &[u8; FRAME_LEN] = buf.try_into().map_err(|_| RcDecodeError::Length)?;
        Self::validate(&Self::parse(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn centred() -> Dr16Raw {
        Dr16Raw {
            ch: [CH_OFFSET; 4],
            s: [1, 2],
            wheel: CH_OFFSET,
            ..Default::default()
        }
    }

    #[test]
    fn decodes_a_full_frame() {
        let raw = Dr16Raw {
            ch: [CH_MAX, CH_MIN, 1000, 1100],
            s: [3, 1],
            mouse: [-5, 300, 1],
            press: [1, 0],
            keys: (Keys::W | Keys::SHIFT | Keys::B).0,
            wheel: 1500,
        };
        let ctrl = Dr16::decode(&Dr16::encode(&raw)).unwrap();

        assert_eq!(ctrl.rc.ch, [660, -660, -24, 76]);
        assert_eq!(ctrl.rc.wheel, 476);
        assert_eq!(ctrl.rc.s, [Switch::Mid, Switch::Up]);
        assert_eq!(
            ctrl.mouse,
            Mouse {
                x: -5,
                y: 300,
                z: 1,
                press_l: true,
                press_r: false
            }
        );
        assert!(ctrl.keys.contains(Keys::W | Keys::B));
        assert!(ctrl.keys.contains(Keys::SHIFT));
        assert!(!ctrl.keys.contains(Keys::CTRL));
    }

    #[test]
    fn known_bytes() {
        // All sticks centred, left switch up, right switch down.
        let frame = Dr16::encode(&centred());
        assert_eq!(&frame[..6], &[0x00, 0x04, 0x20, 0x00, 0x01, 0x68]);
        let ctrl = Dr16::decode(&frame).unwrap();
        assert_eq!(ctrl.rc.ch, [0; 4]);
        assert_eq!(ctrl.rc.s, [Switch::Up, Switch::Down]);
    }

    #[test]
    fn rejects_bad_frames() {
        let good = Dr16::encode(&centred());
        assert_eq!(Dr16::decode(&good[..17]), Err(RcDecodeError::Length));

        let mut raw = centred();
        raw.ch[2] = CH_MIN - 1;
        assert_eq!(Dr16::decode(&Dr16::encode(&raw)), Err(RcDecodeError::OutOfRange));

        let mut raw = centred();
        raw.wheel = CH_MAX + 1;
        assert_eq!(Dr16::decode(&Dr16::encode(&raw)), Err(RcDecodeError::OutOfRange));

        // An all-zero frame is what a disconnected line reads as.
        assert_eq!(Dr16::decode(&[0u8; FRAME_LEN]), Err(RcDecodeError::OutOfRange));
    }

    #[test]
    fn switch_positions() {
        for s in [Switch::Up, Switch::Mid, Switch::Down, Switch::Unknown] {
            assert_eq!(Switch::from_raw(s.to_raw()), s);
        }
    }

    proptest! {
        #[test]
        fn parse_matches_byte_layout(buf in prop::array::uniform18(any::<u8>())) {
            let b = buf.map(u16::from);
            let raw = Dr16::parse(&buf);
            prop_assert_eq!(raw.ch[0], (b[0] | b[1] << 8) & 0x7FF);
            prop_assert_eq!(raw.ch[1], (b[1] >> 3 | b[2] << 5) & 0x7FF);
            prop_assert_eq!(raw.ch[2], (b[2] >> 6 | b[3] << 2 | b[4] << 10) & 0x7FF);
            prop_assert_eq!(raw.ch[3], (b[4] >> 1 | b[5] << 7) & 0x7FF);
            prop_assert_eq!(u16::from(raw.s[0]), ((b[5] >> 4) & 0xC) >> 2);
            prop_assert_eq!(u16::from(raw.s[1]), (b[5] >> 4) & 0x3);
            prop_assert_eq!(raw.wheel, (b[16] | b[17] << 8) & 0x7FF);

            // Everything but the wheel's unused high bits survives a re-encode.
            let again = Dr16::encode(&raw);
            prop_assert_eq!(&again[..17], &buf[..17]);
        }
    }
}
