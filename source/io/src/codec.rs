//! Motor wire codecs
//!
//! Two families of actuators are supported:
//!
//! * Scaled-integer motors (M3508, M2006, GM6020). A command is one signed
//!   16-bit value, four of which share a frame (see [crate::mux]). Feedback
//!   is position, velocity, torque and temperature as fixed-point integers.
//! * Packed-field motors (DM4310 style, "MIT mode"). Every command fills a
//!   whole frame with five bit-packed fields, each linearly quantized over a
//!   configurable range.

use core::f32::consts::PI;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One decoded feedback frame, in SI units
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FeedbackSample {
    /// Rotor position in radians
    pub position: f32,
    /// Velocity in radians per second
    pub velocity: f32,
    /// Output torque in N·m (or the model's torque-equivalent unit)
    pub torque: f32,
    /// Temperature in °C, when the motor reports it
    pub temperature: Option<i8>,
}

/// Converts commands to wire form and feedback frames to samples
pub trait MotorCodec {
    /// The command accepted by this codec
    type Command;
    /// The encoded command
    type Wire;

    /// Encode one command
    fn encode_command(&self, cmd: &Self::Command) -> Self::Wire;

    /// Decode one feedback frame
    fn decode_feedback(&self, data: &[u8; 8]) -> FeedbackSample;
}

fn round(x: f32) -> f32 {
    micromath::F32Ext::round(x)
}

// `f32::clamp` panics when the bounds are swapped.
fn clamp(x: f32, lo: f32, hi: f32) -> f32 {
    x.max(lo).min(hi)
}

//////////////////////////////////////////////////////////////////////////////
// Scaled-integer
//////////////////////////////////////////////////////////////////////////////

/// Encoder counts per revolution of the scaled-integer family
pub const ENCODER_COUNTS: f32 = 8192.0;

/// Model constants of one scaled-integer motor type
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledModel {
    /// Torque (or current) at full command
    pub max_torque: f32,
    /// The raw command value matching `max_torque`
    pub max_torque_raw: i16,
    /// Highest valid motor id. The lowest is always 1.
    pub max_id: u8,
    /// Command frame id for motor ids 1 to 4
    pub tx_id_low: u16,
    /// Command frame id for motor ids 5 and up
    pub tx_id_high: u16,
    /// Feedback arrives on `rx_id_base + id`
    pub rx_id_base: u16,
}

impl ScaledModel {
    /// M3508 with the C620 controller
    pub const M3508: Self = Self {
        max_torque: 20.0,
        max_torque_raw: 16384,
        max_id: 8,
        tx_id_low: 0x200,
        tx_id_high: 0x1FF,
        rx_id_base: 0x200,
    };

    /// M2006 with the C610 controller
    pub const M2006: Self = Self {
        max_torque: 10.0,
        max_torque_raw: 10000,
        max_id: 8,
        tx_id_low: 0x200,
        tx_id_high: 0x1FF,
        rx_id_base: 0x200,
    };

    /// GM6020, voltage command
    pub const GM6020: Self = Self {
        max_torque: 3.0,
        max_torque_raw: 16384,
        max_id: 7,
        tx_id_low: 0x1FE,
        tx_id_high: 0x2FE,
        rx_id_base: 0x204,
    };

    /// Is `id` a valid motor id for this model?
    pub fn valid_id(&self, id: u8) -> bool {
        (1..=self.max_id).contains(&id)
    }

    /// The command frame carrying motor `id`
    pub fn command_id(&self, id: u8) -> Option<u16> {
        match id {
            _ if !self.valid_id(id) => None,
            1..=4 => Some(self.tx_id_low),
            _ => Some(self.tx_id_high),
        }
    }

    /// The frame id motor `id` reports feedback on
    pub fn feedback_id(&self, id: u8) -> Option<u16> {
        self.valid_id(id).then(|| self.rx_id_base + u16::from(id))
    }

    /// Motor `id`'s slot within its command frame
    pub fn slot(&self, id: u8) -> Option<usize> {
        self.valid_id(id).then(|| usize::from(id - 1) % 4)
    }
}

/// Codec for the scaled-integer family
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledCodec {
    model: ScaledModel,
}

impl ScaledCodec {
    /// Create a codec for `model`
    pub const fn new(model: ScaledModel) -> Self {
        Self { model }
    }

    /// The model constants in use
    pub fn model(&self) -> &ScaledModel {
        &self.model
    }
}

impl MotorCodec for ScaledCodec {
    type Command = f32;
    type Wire = i16;

    /// Scale a torque to the raw command, rounding and saturating at the
    /// model's full-scale value. NaN encodes as zero.
    fn encode_command(&self, torque: &f32) -> i16 {
        if torque.is_nan() {
            return 0;
        }
        let raw = f32::from(self.model.max_torque_raw);
        let scaled = clamp(*torque / self.model.max_torque * raw, -raw, raw);
        round(scaled) as i16
    }

    fn decode_feedback(&self, d: &[u8; 8]) -> FeedbackSample {
        let angle = u16::from_be_bytes([d[0], d[1]]);
        let rpm = i16::from_be_bytes([d[2], d[3]]);
        let current = i16::from_be_bytes([d[4], d[5]]);

        FeedbackSample {
            position: f32::from(angle) / ENCODER_COUNTS * 2.0 * PI,
            velocity: f32::from(rpm) * 2.0 * PI / 60.0,
            torque: f32::from(current) / f32::from(self.model.max_torque_raw)
                * self.model.max_torque,
            temperature: Some(d[6] as i8),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Packed-field
//////////////////////////////////////////////////////////////////////////////

/// Width of the packed position field
pub const POSITION_BITS: u32 = 16;
/// Width of the packed velocity field
pub const VELOCITY_BITS: u32 = 12;
/// Width of the packed torque field
pub const TORQUE_BITS: u32 = 12;
/// Width of the packed gain fields
pub const GAIN_BITS: u32 = 12;

/// Enter active control
pub const ENABLE: [u8; 8] = control_frame(0xFC);
/// Leave active control
pub const DISABLE: [u8; 8] = control_frame(0xFD);
/// Store the current position as the zero position
pub const SAVE_ZERO: [u8; 8] = control_frame(0xFE);
/// Clear a latched fault
pub const CLEAR_ERROR: [u8; 8] = control_frame(0xFB);

const fn control_frame(last: u8) -> [u8; 8] {
    [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, last]
}

/// The physical range a packed field is quantized over
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldRange {
    /// Value encoded as all zeros
    pub min: f32,
    /// Value encoded as all ones
    pub max: f32,
}

impl FieldRange {
    /// Create a new range
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Quantize `x` to a `bits`-wide unsigned integer
    ///
    /// Values outside the range saturate, NaN encodes as `min`.
    pub fn to_int(&self, x: f32, bits: u32) -> u16 {
        let levels = levels(bits);
        let x = if x.is_nan() {
            self.min
        } else {
            clamp(x, self.min, self.max)
        };
        let q = round((x - self.min) * (levels / (self.max - self.min)));
        clamp(q, 0.0, levels) as u16
    }

    /// Reconstruct a value from its `bits`-wide quantization
    pub fn to_float(&self, i: u16, bits: u32) -> f32 {
        f32::from(i) * (self.max - self.min) / levels(bits) + self.min
    }

    /// The spacing between two adjacent quantized values
    pub fn step(&self, bits: u32) -> f32 {
        (self.max - self.min) / levels(bits)
    }
}

/// Largest value of a `bits`-wide field. Fields are at most 16 bits wide.
fn levels(bits: u32) -> f32 {
    debug_assert!(bits <= 16, "field width {bits} exceeds 16 bits");
    ((1u32 << bits.min(16)) - 1) as f32
}

/// Field ranges of a packed-field motor
///
/// These must match the limits configured in the motor itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackedRanges {
    /// Position, radians
    pub position: FieldRange,
    /// Velocity, radians per second
    pub velocity: FieldRange,
    /// Torque, N·m
    pub torque: FieldRange,
    /// Position gain
    pub kp: FieldRange,
    /// Velocity gain
    pub kd: FieldRange,
}

impl PackedRanges {
    /// Factory limits of the DM4310
    pub const DM4310: Self = Self {
        position: FieldRange::new(-12.5, 12.5),
        velocity: FieldRange::new(-30.0, 30.0),
        torque: FieldRange::new(-10.0, 10.0),
        kp: FieldRange::new(0.0, 500.0),
        kd: FieldRange::new(0.0, 5.0),
    };
}

impl Default for PackedRanges {
    fn default() -> Self {
        Self::DM4310
    }
}

/// A full packed-field command
///
/// The motor applies `torque + kp * (position - p) + kd * (velocity - v)`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MitCommand {
    /// Target position
    pub position: f32,
    /// Target velocity
    pub velocity: f32,
    /// Position gain
    pub kp: f32,
    /// Velocity gain
    pub kd: f32,
    /// Feed-forward torque
    pub torque: f32,
}

/// Codec for the packed-field family
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PackedCodec {
    /// Field ranges, adjustable at runtime
    pub ranges: PackedRanges,
}

impl PackedCodec {
    /// Create a codec with the given ranges
    pub const fn new(ranges: PackedRanges) -> Self {
        Self { ranges }
    }
}

impl MotorCodec for PackedCodec {
    type Command = MitCommand;
    type Wire = [u8; 8];

    fn encode_command(&self, cmd: &MitCommand) -> [u8; 8] {
        let r = &self.ranges;
        let p = r.position.to_int(cmd.position, POSITION_BITS);
        let v = r.velocity.to_int(cmd.velocity, VELOCITY_BITS);
        let kp = r.kp.to_int(cmd.kp, GAIN_BITS);
        let kd = r.kd.to_int(cmd.kd, GAIN_BITS);
        let t = r.torque.to_int(cmd.torque, TORQUE_BITS);

        [
            (p >> 8) as u8,
            p as u8,
            (v >> 4) as u8,
            (((v & 0xF) << 4) | (kp >> 8)) as u8,
            kp as u8,
            (kd >> 4) as u8,
            (((kd & 0xF) << 4) | (t >> 8)) as u8,
            t as u8,
        ]
    }

    /// Byte 0 carries the motor id and error code, which are not decoded.
    fn decode_feedback(&self, d: &[u8; 8]) -> FeedbackSample {
        let r = &self.ranges;
        let [_, d1, d2, d3, d4, d5, _, _] = d.map(u16::from);
        let p = (d1 << 8) | d2;
        let v = (d3 << 4) | (d4 >> 4);
        let t = ((d4 & 0xF) << 8) | d5;

        FeedbackSample {
            position: r.position.to_float(p, POSITION_BITS),
            velocity: r.velocity.to_float(v, VELOCITY_BITS),
            torque: r.torque.to_float(t, TORQUE_BITS),
            temperature: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn close(a: f32, b: f32, eps: f32) -> bool {
        (a - b).abs() <= eps
    }

    #[test]
    fn scaled_decode_example() {
        let c = ScaledCodec::new(ScaledModel::M3508);
        let s = c.decode_feedback(&[0x10, 0x00, 0x00, 0x64, 0x00, 0x64, 0x00, 0x00]);
        assert!(close(s.position, PI, 1e-5));
        assert!(close(s.velocity, 10.471_975, 1e-4));
        assert!(close(s.torque, 0.122_070_31, 1e-6));
        assert_eq!(s.temperature, Some(0));
    }

    #[test]
    fn scaled_decode_signs() {
        let c = ScaledCodec::new(ScaledModel::GM6020);
        let s = c.decode_feedback(&[0xFF, 0xFF, 0xFF, 0x9C, 0xC0, 0x00, 0xE2, 0x00]);
        assert!(close(s.position, 8191.0 / 8192.0 * 2.0 * PI, 1e-5));
        assert!(close(s.velocity, -100.0 * 2.0 * PI / 60.0, 1e-4));
        assert!(close(s.torque, -3.0, 1e-6));
        assert_eq!(s.temperature, Some(-30));
    }

    #[test]
    fn scaled_encode_rounds_and_saturates() {
        let c = ScaledCodec::new(ScaledModel::M3508);
        assert_eq!(c.encode_command(&0.0), 0);
        assert_eq!(c.encode_command(&10.0), 8192);
        assert_eq!(c.encode_command(&-10.0), -8192);
        // 0.001 N·m is 0.8192 raw
        assert_eq!(c.encode_command(&0.001), 1);
        assert_eq!(c.encode_command(&1000.0), 16384);
        assert_eq!(c.encode_command(&-1000.0), -16384);
        assert_eq!(c.encode_command(&f32::NAN), 0);
        assert_eq!(c.encode_command(&f32::INFINITY), 16384);

        let c = ScaledCodec::new(ScaledModel::M2006);
        assert_eq!(c.encode_command(&5.0), 5000);
        assert_eq!(c.encode_command(&11.0), 10000);
    }

    #[test]
    fn scaled_id_layout() {
        let m = ScaledModel::M3508;
        assert_eq!(m.command_id(1), Some(0x200));
        assert_eq!(m.command_id(4), Some(0x200));
        assert_eq!(m.command_id(5), Some(0x1FF));
        assert_eq!(m.command_id(9), None);
        assert_eq!(m.command_id(0), None);
        assert_eq!(m.feedback_id(3), Some(0x203));
        assert_eq!(m.slot(1), Some(0));
        assert_eq!(m.slot(6), Some(1));

        let g = ScaledModel::GM6020;
        assert_eq!(g.command_id(7), Some(0x2FE));
        assert_eq!(g.command_id(8), None);
        assert_eq!(g.feedback_id(1), Some(0x205));
    }

    #[test]
    fn packed_command_layout() {
        let c = PackedCodec::default();
        let all_max = MitCommand {
            position: 12.5,
            velocity: 30.0,
            kp: 500.0,
            kd: 5.0,
            torque: 10.0,
        };
        assert_eq!(c.encode_command(&all_max), [0xFF; 8]);

        let all_min = MitCommand {
            position: -12.5,
            velocity: -30.0,
            kp: 0.0,
            kd: 0.0,
            torque: -10.0,
        };
        assert_eq!(c.encode_command(&all_min), [0x00; 8]);

        // Only kp at full scale: low nibble of byte 3 and all of byte 4.
        let kp_only = MitCommand { kp: 500.0, ..all_min };
        assert_eq!(c.encode_command(&kp_only), [0, 0, 0, 0x0F, 0xFF, 0, 0, 0]);
    }

    #[test]
    fn packed_feedback_layout() {
        let c = PackedCodec::default();
        let s = c.decode_feedback(&[0x01, 0xFF, 0xFF, 0x00, 0x0F, 0xFF, 0x20, 0x20]);
        assert!(close(s.position, 12.5, 1e-5));
        assert!(close(s.velocity, -30.0, 1e-5));
        assert!(close(s.torque, 10.0, 1e-5));
        assert_eq!(s.temperature, None);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "exceeds 16 bits")]
    fn oversized_field_width_is_caught() {
        FieldRange::new(0.0, 1.0).to_int(0.5, 32);
    }

    #[test]
    fn control_frames() {
        assert_eq!(ENABLE, [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFC]);
        assert_eq!(DISABLE[7], 0xFD);
        assert_eq!(SAVE_ZERO[7], 0xFE);
        assert_eq!(CLEAR_ERROR[7], 0xFB);
    }

    proptest! {
        #[test]
        fn quantization_within_one_step(
            min in -100f32..0.0,
            span in 0.1f32..200.0,
            frac in 0f32..=1.0,
            bits in prop::sample::select(vec![8u32, 12, 16]),
        ) {
            let r = FieldRange::new(min, min + span);
            let x = min + span * frac;
            let back = r.to_float(r.to_int(x, bits), bits);
            let slack = 1e-6 * (1.0 + min.abs() + span);
            prop_assert!((back - x).abs() <= r.step(bits) + slack);
        }

        #[test]
        fn quantization_saturates(x in prop::num::f32::NORMAL) {
            let r = PackedRanges::DM4310.torque;
            let q = r.to_int(x, TORQUE_BITS);
            prop_assert!(q <= 0xFFF);
            if x >= r.max {
                prop_assert_eq!(q, 0xFFF);
            }
            if x <= r.min {
                prop_assert_eq!(q, 0);
            }
        }

        #[test]
        fn packed_feedback_matches_field_decode(p: u16, v in 0u16..0x1000, t in 0u16..0x1000) {
            let c = PackedCodec::default();
            let frame = [
                0x01,
                (p >> 8) as u8,
                p as u8,
                (v >> 4) as u8,
                (((v & 0xF) << 4) | (t >> 8)) as u8,
                t as u8,
                0,
                0,
            ];
            let s = c.decode_feedback(&frame);
            let r = &c.ranges;
            prop_assert_eq!(s.position, r.position.to_float(p, POSITION_BITS));
            prop_assert_eq!(s.velocity, r.velocity.to_float(v, VELOCITY_BITS));
            prop_assert_eq!(s.torque, r.torque.to_float(t, TORQUE_BITS));
        }
    }
}
