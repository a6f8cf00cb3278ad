//! Audio-borne sensor frames
//!
//! An external peripheral talks to the host through the audio interface.
//! Each audio sample on the carrier channel holds one 16-bit word, and
//! eleven consecutive words form a frame:
//!
//! ```text
//! [SYNC, kind, t0, t1, t2, a, b, c, d, aux, checksum]
//! ```
//!
//! `t0..t2` is a 48-bit little-endian device tick count. For sensor kinds
//! `a..d` are signed values scaled to the kind's full range; the checksum
//! is the XOR of the first ten words and `CHECKSUM_SEED`.

mod decoder;
mod encoder;

pub use decoder::{DecoderStats, SignalDecoder};
pub use encoder::CommandEncoder;

use thiserror::Error;

use crate::measurement::MeasurementType;
use crate::peripheral::Channel;

/// First word of every frame
pub const SYNC: u16 = 0x7E5A;

/// Words per frame, sync and checksum included
pub const FRAME_WORDS: usize = 11;

pub const CHECKSUM_SEED: u16 = 0xA55A;

/// Acceleration full scale in g
pub const ACCELERATION_FULL_SCALE: f64 = 16.0;
/// Rotation full scale in rad/s (2000 deg/s)
pub const ROTATION_FULL_SCALE: f64 = 34.90658;
/// Magnetic field full scale in microtesla
pub const MAGNETIC_FULL_SCALE: f64 = 4912.0;
pub const QUATERNION_FULL_SCALE: f64 = 1.0;

const TICK_MASK: u64 = (1 << 48) - 1;

/// Largest magnitude of a scaled value word
const VALUE_STEPS: f64 = i16::MAX as f64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame truncated after {0} words")]
    Truncated(usize),

    #[error("Missing sync word, found {0:#06x}")]
    BadSync(u16),

    #[error("Checksum mismatch: expected {expected:#06x}, found {found:#06x}")]
    BadChecksum { expected: u16, found: u16 },

    #[error("Unknown frame kind {0:#04x}")]
    UnknownKind(u16),
}

/// What a frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Accelerometer,
    Gyroscope,
    Magnetometer,
    Attitude,
    RotationRate,
    Gravity,
    UserAcceleration,
    /// `aux` holds the magnetic accuracy code
    MagneticField,
    /// Device to host: `a` is the available channel mask
    Capabilities,
    /// Device to host: `a` is the streaming channel mask
    Status,
    /// Host to device: `a` is the enabled mask, `b` the interval in ms
    Command,
}

impl FrameKind {
    pub fn word(&self) -> u16 {
        match self {
            Self::Accelerometer => 0x01,
            Self::Gyroscope => 0x02,
            Self::Magnetometer => 0x03,
            Self::Attitude => 0x04,
            Self::RotationRate => 0x05,
            Self::Gravity => 0x06,
            Self::UserAcceleration => 0x07,
            Self::MagneticField => 0x08,
            Self::Capabilities => 0x10,
            Self::Status => 0x11,
            Self::Command => 0x20,
        }
    }

    pub fn from_word(word: u16) -> Option<Self> {
        Some(match word {
            0x01 => Self::Accelerometer,
            0x02 => Self::Gyroscope,
            0x03 => Self::Magnetometer,
            0x04 => Self::Attitude,
            0x05 => Self::RotationRate,
            0x06 => Self::Gravity,
            0x07 => Self::UserAcceleration,
            0x08 => Self::MagneticField,
            0x10 => Self::Capabilities,
            0x11 => Self::Status,
            0x20 => Self::Command,
            _ => return None,
        })
    }

    /// Signal type recorded for a sensor frame
    pub fn measurement_type(&self) -> Option<MeasurementType> {
        match self {
            Self::Accelerometer => Some(MeasurementType::Accelerometer),
            Self::Gyroscope => Some(MeasurementType::Gyroscope),
            Self::Magnetometer => Some(MeasurementType::Magnetometer),
            Self::Attitude => Some(MeasurementType::Attitude),
            Self::RotationRate => Some(MeasurementType::RotationRate),
            Self::Gravity => Some(MeasurementType::Gravity),
            Self::UserAcceleration => Some(MeasurementType::UserAcceleration),
            Self::MagneticField => Some(MeasurementType::MagneticField),
            Self::Capabilities | Self::Status | Self::Command => None,
        }
    }

    /// Channel that has to be active for the frame to be recorded
    pub fn channel(&self) -> Option<Channel> {
        match self {
            Self::Accelerometer => Some(Channel::Accelerometer),
            Self::Gyroscope => Some(Channel::Gyroscope),
            Self::Magnetometer => Some(Channel::Magnetometer),
            Self::Attitude
            | Self::RotationRate
            | Self::Gravity
            | Self::UserAcceleration
            | Self::MagneticField => Some(Channel::DeviceMotion),
            Self::Capabilities | Self::Status | Self::Command => None,
        }
    }

    /// Physical value of a full-scale word, for sensor kinds
    pub fn full_scale(&self) -> Option<f64> {
        match self {
            Self::Accelerometer | Self::Gravity | Self::UserAcceleration => {
                Some(ACCELERATION_FULL_SCALE)
            }
            Self::Gyroscope | Self::RotationRate => Some(ROTATION_FULL_SCALE),
            Self::Magnetometer | Self::MagneticField => Some(MAGNETIC_FULL_SCALE),
            Self::Attitude => Some(QUATERNION_FULL_SCALE),
            Self::Capabilities | Self::Status | Self::Command => None,
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Device ticks, 48 bits
    pub ticks: u64,
    /// Payload words `a..d`
    pub values: [u16; 4],
    pub aux: u16,
}

impl Frame {
    pub fn new(kind: FrameKind, ticks: u64, values: [u16; 4], aux: u16) -> Self {
        Self {
            kind,
            ticks: ticks & TICK_MASK,
            values,
            aux,
        }
    }

    /// Sensor frame from physical values, clamped to the kind's full scale
    pub fn sensor(kind: FrameKind, ticks: u64, values: [f64; 4], aux: u16) -> Self {
        let scale = kind.full_scale().unwrap_or(1.0);
        let words = values.map(|v| {
            let steps = (v / scale * VALUE_STEPS).round();
            steps.clamp(-VALUE_STEPS, VALUE_STEPS) as i16 as u16
        });
        Self::new(kind, ticks, words, aux)
    }

    /// Host to device command
    pub fn command(ticks: u64, enabled_mask: u16, interval_ms: u16) -> Self {
        Self::new(FrameKind::Command, ticks, [enabled_mask, interval_ms, 0, 0], 0)
    }

    /// Physical value of payload word `i` (0..4) of a sensor frame
    pub fn value(&self, i: usize) -> f64 {
        let scale = self.kind.full_scale().unwrap_or(1.0);
        f64::from(self.values[i] as i16) / VALUE_STEPS * scale
    }

    /// All four payload values as physical quantities
    pub fn scaled(&self) -> [f64; 4] {
        [self.value(0), self.value(1), self.value(2), self.value(3)]
    }

    pub fn to_words(&self) -> [u16; FRAME_WORDS] {
        let t = self.ticks & TICK_MASK;
        let mut words = [
            SYNC,
            self.kind.word(),
            t as u16,
            (t >> 16) as u16,
            (t >> 32) as u16,
            self.values[0],
            self.values[1],
            self.values[2],
            self.values[3],
            self.aux,
            0,
        ];
        words[FRAME_WORDS - 1] = checksum(&words[..FRAME_WORDS - 1]);
        words
    }

    pub fn from_words(words: &[u16]) -> Result<Self, DecodeError> {
        if words.len() < FRAME_WORDS {
            return Err(DecodeError::Truncated(words.len()));
        }
        if words[0] != SYNC {
            return Err(DecodeError::BadSync(words[0]));
        }
        let expected = checksum(&words[..FRAME_WORDS - 1]);
        let found = words[FRAME_WORDS - 1];
        if expected != found {
            return Err(DecodeError::BadChecksum { expected, found });
        }
        let kind = FrameKind::from_word(words[1]).ok_or(DecodeError::UnknownKind(words[1]))?;
        let ticks =
            u64::from(words[2]) | u64::from(words[3]) << 16 | u64::from(words[4]) << 32;
        Ok(Self::new(
            kind,
            ticks,
            [words[5], words[6], words[7], words[8]],
            words[9],
        ))
    }
}

pub fn checksum(words: &[u16]) -> u16 {
    words.iter().fold(CHECKSUM_SEED, |acc, w| acc ^ w)
}

/// Audio sample for a word
pub fn word_to_sample(word: u16) -> f32 {
    f32::from(word as i16) / 32768.0
}

/// Word carried by an audio sample
pub fn sample_to_word(sample: f32) -> u16 {
    (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16 as u16
}

/// Write `frame` onto the carrier channel of an interleaved buffer,
/// starting at frame 0. Returns false when the buffer is too short.
pub fn write_frame(frame: &Frame, out: &mut [f32], channels: u16, carrier: u16) -> bool {
    let channels = usize::from(channels.max(1));
    let carrier = usize::from(carrier);
    if carrier >= channels || out.len() / channels < FRAME_WORDS {
        return false;
    }
    for (i, word) in frame.to_words().iter().enumerate() {
        out[i * channels + carrier] = word_to_sample(*word);
    }
    true
}
