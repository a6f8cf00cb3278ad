//! motion-capture - record body-tagged motion measurements
//!
//! Motion samples come from the host device's own sensors or from an
//! external sensor peripheral that talks to the host over an audio
//! interface. This crate provides:
//! - Measurement records and the factories that build them
//! - Sensor peripherals with per-channel available/enabled/active state
//! - Real-time audio I/O delegation (cpal, file replay, caller-driven)
//! - The audio-borne sensor frame codec (input decoder, command encoder)
//! - Lock-free hand-off of records to a persistence sink

pub mod clock;
pub mod io;
pub mod measurement;
pub mod peripheral;
pub mod queue;
pub mod settings;
pub mod signal;
pub mod sink;

pub use clock::{ClockBounds, ClockModel, ClockPolicy, ClockSyncError, HostTimestamp};
pub use io::{
    status, ActionFlags, AudioBufferList, AudioTimeStamp, DelegatableIo, DeviceIo, IoBuffer,
    IoDelegate, IoError, IoStatus, ManualIo, ReplayIo,
};
pub use measurement::{
    AccelerometerData, BodyPart, BodySide, DeviceMotion, GyroData, MagneticAccuracy,
    MagnetometerData, Measurement, MeasurementType, Quaternion, Vector3,
};
pub use peripheral::{
    Channel, ChannelState, LocalPeripheral, MotionHardware, MotionPeripheral, NullMotionHardware,
    PeripheralError, PeripheralInfo, RemotePeripheral,
};
pub use queue::{MeasurementConsumer, MeasurementProducer, MeasurementQueue};
pub use settings::{Settings, SettingsError};
pub use signal::{CommandEncoder, SignalDecoder};
pub use sink::{Drain, JsonLinesSink, MeasurementSink, SinkError};
