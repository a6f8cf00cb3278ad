//! Host device peripheral
//!
//! Wraps the host's own motion sensors behind `MotionHardware`. Channel
//! availability is probed from the hardware, channels go active only when
//! the hardware accepts a start request, and samples are delivered by the
//! sensor callbacks (`on_accelerometer` and friends) on whatever thread the
//! hardware uses. Device time is seconds since boot.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use super::{Channel, MotionPeripheral, PeripheralError, PeripheralInfo};
use crate::clock::{unix_now, ClockModel, ClockSyncError};
use crate::measurement::{AccelerometerData, DeviceMotion, GyroData, MagnetometerData, Measurement};
use crate::queue::MeasurementProducer;

pub const LOCAL_KIND: &str = "local";

/// Host motion sensor session
pub trait MotionHardware: Send {
    fn is_available(&self, channel: Channel) -> bool;

    /// Start streaming `channel` at `interval` seconds per sample.
    /// `Ok` is the hardware's confirmation that the channel is running.
    fn start(&mut self, channel: Channel, interval: f64) -> Result<(), PeripheralError>;

    fn stop(&mut self, channel: Channel);

    /// Applied from the next sample period on
    fn set_update_interval(&mut self, interval: f64);

    /// Current reading of the device clock, in seconds since boot
    fn uptime(&self) -> f64;
}

/// Hardware for hosts without motion sensors
pub struct NullMotionHardware {
    booted: Instant,
}

impl Default for NullMotionHardware {
    fn default() -> Self {
        Self {
            booted: Instant::now(),
        }
    }
}

impl MotionHardware for NullMotionHardware {
    fn is_available(&self, _channel: Channel) -> bool {
        false
    }

    fn start(&mut self, channel: Channel, _interval: f64) -> Result<(), PeripheralError> {
        Err(PeripheralError::ChannelUnavailable(channel))
    }

    fn stop(&mut self, _channel: Channel) {}

    fn set_update_interval(&mut self, _interval: f64) {}

    fn uptime(&self) -> f64 {
        self.booted.elapsed().as_secs_f64()
    }
}

/// The host device as a motion peripheral
pub struct LocalPeripheral<H> {
    info: PeripheralInfo,
    hardware: Mutex<H>,
    producer: Mutex<MeasurementProducer>,
}

impl<H: MotionHardware> LocalPeripheral<H> {
    pub fn new(hardware: H, producer: MeasurementProducer) -> Self {
        Self::with_info(PeripheralInfo::new(LOCAL_KIND, "This device"), hardware, producer)
    }

    pub fn with_info(info: PeripheralInfo, hardware: H, producer: MeasurementProducer) -> Self {
        for channel in Channel::ALL {
            info.channels()
                .set_available(*channel, hardware.is_available(*channel));
        }
        info.install_clock(ClockModel::boot_offset(unix_now(), hardware.uptime()));

        Self {
            info,
            hardware: Mutex::new(hardware),
            producer: Mutex::new(producer),
        }
    }

    fn hardware(&self) -> MutexGuard<'_, H> {
        self.hardware.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_channel(&self, hardware: &mut H, channel: Channel) -> Result<(), PeripheralError> {
        hardware.start(channel, self.info.update_interval())?;
        if !self.info.channels().confirm_active(channel) {
            // Disabled while the hardware was starting
            hardware.stop(channel);
        }
        Ok(())
    }

    /// Sensor callback for fused motion; records every device-motion type.
    /// Returns the number of records queued.
    pub fn on_device_motion(&self, motion: &DeviceMotion) -> usize {
        if !self.is_active(Channel::DeviceMotion) {
            return 0;
        }
        let builders: [fn(&DeviceMotion, &Self) -> Result<Measurement, ClockSyncError>; 5] = [
            Measurement::attitude_from_motion,
            Measurement::rotation_rate_from_motion,
            Measurement::gravity_from_motion,
            Measurement::user_acceleration_from_motion,
            Measurement::magnetic_field_from_motion,
        ];
        builders
            .iter()
            .map(|build| self.queue(build(motion, self)))
            .filter(|queued| *queued)
            .count()
    }

    pub fn on_accelerometer(&self, data: &AccelerometerData) -> bool {
        self.is_active(Channel::Accelerometer) && self.queue(Measurement::from_accelerometer(data, self))
    }

    pub fn on_gyro(&self, data: &GyroData) -> bool {
        self.is_active(Channel::Gyroscope) && self.queue(Measurement::from_gyro(data, self))
    }

    pub fn on_magnetometer(&self, data: &MagnetometerData) -> bool {
        self.is_active(Channel::Magnetometer) && self.queue(Measurement::from_magnetometer(data, self))
    }

    fn queue(&self, measurement: Result<Measurement, ClockSyncError>) -> bool {
        match measurement {
            Ok(m) => self
                .producer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(m),
            Err(e) => {
                log::debug!("Dropping local sample: {}", e);
                false
            }
        }
    }
}

impl<H: MotionHardware> MotionPeripheral for LocalPeripheral<H> {
    fn info(&self) -> &PeripheralInfo {
        &self.info
    }

    fn is_local(&self) -> bool {
        true
    }

    fn connect(&self) -> Result<(), PeripheralError> {
        let mut hardware = self.hardware();
        self.info
            .install_clock(ClockModel::boot_offset(unix_now(), hardware.uptime()));
        self.info.set_connected(true);

        let mut first_error = None;
        for channel in Channel::ALL {
            let state = self.info.channels().state(*channel);
            if state.available && state.enabled {
                if let Err(e) = self.start_channel(&mut hardware, *channel) {
                    log::warn!("Failed to start local {}: {}", channel, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        log::info!("Local peripheral connected ({})", self.info.location_label());

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn disconnect(&self) {
        let mut hardware = self.hardware();
        self.info.set_connected(false);
        for channel in Channel::ALL {
            if self.info.channels().state(*channel).active {
                hardware.stop(*channel);
            }
        }
        self.info.channels().deactivate_all();
        log::info!("Local peripheral disconnected");
    }

    fn apply_channel(&self, channel: Channel, enabled: bool) -> Result<(), PeripheralError> {
        let mut hardware = self.hardware();
        if enabled {
            self.start_channel(&mut hardware, channel)
        } else {
            hardware.stop(channel);
            self.info.channels().set_inactive(channel);
            Ok(())
        }
    }

    fn apply_update_interval(&self, seconds: f64) {
        self.hardware().set_update_interval(seconds);
    }
}
