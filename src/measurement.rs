//! Measurement records
//!
//! A `Measurement` is one timestamped sample of one signal type, tagged with
//! where on the body the producing peripheral is worn. Records are built by
//! the factory functions on `Measurement` from a raw sensor sample plus the
//! peripheral that produced it. They are `Copy` so the audio thread can hand
//! them off without allocating, and they cannot be changed once built.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::ClockSyncError;
use crate::peripheral::MotionPeripheral;

/// Value stored in components a measurement type does not use
pub const NEUTRAL: f64 = 0.0;

/// Signal type of a measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementType {
    Attitude,
    RotationRate,
    Gravity,
    UserAcceleration,
    MagneticField,
    Accelerometer,
    Gyroscope,
    Magnetometer,
}

impl MeasurementType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Attitude => "Attitude",
            Self::RotationRate => "Rotation Rate",
            Self::Gravity => "Gravity",
            Self::UserAcceleration => "User Acceleration",
            Self::MagneticField => "Magnetic Field",
            Self::Accelerometer => "Accelerometer",
            Self::Gyroscope => "Gyroscope",
            Self::Magnetometer => "Magnetometer",
        }
    }

    /// Number of populated components (x, y, z and, for attitude, w)
    pub fn components(&self) -> usize {
        match self {
            Self::Attitude => 4,
            Self::RotationRate
            | Self::Gravity
            | Self::UserAcceleration
            | Self::MagneticField
            | Self::Accelerometer
            | Self::Gyroscope
            | Self::Magnetometer => 3,
        }
    }

    /// Whether this type is derived from fused device motion rather than a raw sensor
    pub fn is_device_motion(&self) -> bool {
        match self {
            Self::Attitude
            | Self::RotationRate
            | Self::Gravity
            | Self::UserAcceleration
            | Self::MagneticField => true,
            Self::Accelerometer | Self::Gyroscope | Self::Magnetometer => false,
        }
    }
}

/// Side of the body a peripheral is worn on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodySide {
    #[default]
    Unknown,
    Left,
    Right,
}

impl BodySide {
    pub const ALL: &[BodySide] = &[Self::Unknown, Self::Left, Self::Right];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Left => "left",
            Self::Right => "right",
        }
    }

    /// Stable code used when the value is stored in an atomic
    pub fn code(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Left => 1,
            Self::Right => 2,
        }
    }

    /// Inverse of `code`; unrecognised codes map to `Unknown`
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Left,
            2 => Self::Right,
            _ => Self::Unknown,
        }
    }
}

/// Part of the body a peripheral is worn on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyPart {
    #[default]
    Unknown,
    Head,
    Arm,
    Wrist,
    Hip,
    Ankle,
}

impl BodyPart {
    pub const ALL: &[BodyPart] = &[
        Self::Unknown,
        Self::Head,
        Self::Arm,
        Self::Wrist,
        Self::Hip,
        Self::Ankle,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Head => "head",
            Self::Arm => "arm",
            Self::Wrist => "wrist",
            Self::Hip => "hip",
            Self::Ankle => "ankle",
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Head => 1,
            Self::Arm => 2,
            Self::Wrist => 3,
            Self::Hip => 4,
            Self::Ankle => 5,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Head,
            2 => Self::Arm,
            3 => Self::Wrist,
            4 => Self::Hip,
            5 => Self::Ankle,
            _ => Self::Unknown,
        }
    }
}

/// Calibration confidence reported with magnetic field samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MagneticAccuracy {
    #[default]
    Uncalibrated,
    Low,
    Medium,
    High,
}

impl MagneticAccuracy {
    pub fn code(&self) -> u16 {
        match self {
            Self::Uncalibrated => 0,
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            1 => Self::Low,
            2 => Self::Medium,
            3 => Self::High,
            _ => Self::Uncalibrated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Attitude as a unit quaternion
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    pub fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }
}

/// One fused motion sample. `timestamp` is in device seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DeviceMotion {
    pub timestamp: f64,
    pub attitude: Quaternion,
    pub rotation_rate: Vector3,
    pub gravity: Vector3,
    pub user_acceleration: Vector3,
    pub magnetic_field: Vector3,
    pub magnetic_accuracy: MagneticAccuracy,
}

/// Raw accelerometer sample in g. `timestamp` is in device seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AccelerometerData {
    pub timestamp: f64,
    pub acceleration: Vector3,
}

/// Raw gyroscope sample in rad/s
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GyroData {
    pub timestamp: f64,
    pub rotation_rate: Vector3,
}

/// Raw magnetometer sample in microtesla
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MagnetometerData {
    pub timestamp: f64,
    pub magnetic_field: Vector3,
}

/// One measurement sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(rename = "type")]
    kind: MeasurementType,
    /// Host unix-epoch seconds
    timestamp: f64,
    x: f64,
    y: f64,
    z: f64,
    w: f64,
    accuracy: Option<MagneticAccuracy>,
    body_side: BodySide,
    body_part: BodyPart,
    is_local: bool,
    peripheral: Uuid,
    /// Device time was outside the expected bounds
    clock_suspect: bool,
}

impl Measurement {
    pub fn attitude_from_motion<P>(motion: &DeviceMotion, device: &P) -> Result<Self, ClockSyncError>
    where
        P: MotionPeripheral + ?Sized,
    {
        let q = motion.attitude;
        Self::build(
            MeasurementType::Attitude,
            motion.timestamp,
            [q.x, q.y, q.z, q.w],
            None,
            device,
        )
    }

    pub fn rotation_rate_from_motion<P>(
        motion: &DeviceMotion,
        device: &P,
    ) -> Result<Self, ClockSyncError>
    where
        P: MotionPeripheral + ?Sized,
    {
        Self::vector(
            MeasurementType::RotationRate,
            motion.timestamp,
            motion.rotation_rate,
            None,
            device,
        )
    }

    pub fn gravity_from_motion<P>(motion: &DeviceMotion, device: &P) -> Result<Self, ClockSyncError>
    where
        P: MotionPeripheral + ?Sized,
    {
        Self::vector(
            MeasurementType::Gravity,
            motion.timestamp,
            motion.gravity,
            None,
            device,
        )
    }

    pub fn user_acceleration_from_motion<P>(
        motion: &DeviceMotion,
        device: &P,
    ) -> Result<Self, ClockSyncError>
    where
        P: MotionPeripheral + ?Sized,
    {
        Self::vector(
            MeasurementType::UserAcceleration,
            motion.timestamp,
            motion.user_acceleration,
            None,
            device,
        )
    }

    /// Calibrated field from device motion; the only type that carries `accuracy`
    pub fn magnetic_field_from_motion<P>(
        motion: &DeviceMotion,
        device: &P,
    ) -> Result<Self, ClockSyncError>
    where
        P: MotionPeripheral + ?Sized,
    {
        Self::vector(
            MeasurementType::MagneticField,
            motion.timestamp,
            motion.magnetic_field,
            Some(motion.magnetic_accuracy),
            device,
        )
    }

    pub fn from_gyro<P>(data: &GyroData, device: &P) -> Result<Self, ClockSyncError>
    where
        P: MotionPeripheral + ?Sized,
    {
        Self::vector(
            MeasurementType::Gyroscope,
            data.timestamp,
            data.rotation_rate,
            None,
            device,
        )
    }

    pub fn from_accelerometer<P>(data: &AccelerometerData, device: &P) -> Result<Self, ClockSyncError>
    where
        P: MotionPeripheral + ?Sized,
    {
        Self::vector(
            MeasurementType::Accelerometer,
            data.timestamp,
            data.acceleration,
            None,
            device,
        )
    }

    pub fn from_magnetometer<P>(data: &MagnetometerData, device: &P) -> Result<Self, ClockSyncError>
    where
        P: MotionPeripheral + ?Sized,
    {
        Self::vector(
            MeasurementType::Magnetometer,
            data.timestamp,
            data.magnetic_field,
            None,
            device,
        )
    }

    fn vector<P>(
        kind: MeasurementType,
        device_time: f64,
        v: Vector3,
        accuracy: Option<MagneticAccuracy>,
        device: &P,
    ) -> Result<Self, ClockSyncError>
    where
        P: MotionPeripheral + ?Sized,
    {
        Self::build(kind, device_time, [v.x, v.y, v.z, NEUTRAL], accuracy, device)
    }

    fn build<P>(
        kind: MeasurementType,
        device_time: f64,
        components: [f64; 4],
        accuracy: Option<MagneticAccuracy>,
        device: &P,
    ) -> Result<Self, ClockSyncError>
    where
        P: MotionPeripheral + ?Sized,
    {
        let stamp = device.timestamp_for(device_time)?;
        let [x, y, z, w] = components;
        Ok(Self {
            kind,
            timestamp: stamp.seconds,
            x,
            y,
            z,
            w,
            accuracy,
            body_side: device.body_side(),
            body_part: device.body_part(),
            is_local: device.is_local(),
            peripheral: device.uuid(),
            clock_suspect: stamp.suspect,
        })
    }

    pub fn kind(&self) -> MeasurementType {
        self.kind
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn y(&self) -> f64 {
        self.y
    }

    pub fn z(&self) -> f64 {
        self.z
    }

    pub fn w(&self) -> f64 {
        self.w
    }

    pub fn components(&self) -> [f64; 4] {
        [self.x, self.y, self.z, self.w]
    }

    pub fn accuracy(&self) -> Option<MagneticAccuracy> {
        self.accuracy
    }

    pub fn body_side(&self) -> BodySide {
        self.body_side
    }

    pub fn body_part(&self) -> BodyPart {
        self.body_part
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    /// Identity of the producing peripheral
    pub fn peripheral(&self) -> Uuid {
        self.peripheral
    }

    pub fn clock_suspect(&self) -> bool {
        self.clock_suspect
    }
}
