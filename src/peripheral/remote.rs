//! External sensor peripheral reached over the audio interface
//!
//! The device announces which channels it has in a capability frame and
//! reports which are streaming in a status frame; both arrive through the
//! `SignalDecoder` on the audio thread. The host's wishes (enabled channels,
//! update interval) travel back in command frames written by the
//! `CommandEncoder` on every render period, so `set_enabled` here only
//! records intent and `active` follows the device's confirmation.
//!
//! Device time is a tick counter. Unless a clock model is configured, the
//! first sample after connect pins the device-to-host offset.

use std::sync::atomic::{AtomicBool, Ordering};

use super::{Channel, MotionPeripheral, PeripheralError, PeripheralInfo};
use crate::clock::ClockModel;

pub const REMOTE_KIND: &str = "audio";

/// Default device tick rate (microsecond ticks)
pub const DEFAULT_TICK_HZ: f64 = 1_000_000.0;

pub struct RemotePeripheral {
    info: PeripheralInfo,
    tick_hz: f64,
    configured_clock: Option<ClockModel>,
    clock_synced: AtomicBool,
}

impl RemotePeripheral {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_info(PeripheralInfo::new(REMOTE_KIND, name), DEFAULT_TICK_HZ)
    }

    pub fn with_info(info: PeripheralInfo, tick_hz: f64) -> Self {
        let tick_hz = if tick_hz.is_finite() && tick_hz > 0.0 {
            tick_hz
        } else {
            log::warn!("Invalid tick rate {}, using {}", tick_hz, DEFAULT_TICK_HZ);
            DEFAULT_TICK_HZ
        };
        Self {
            info,
            tick_hz,
            configured_clock: None,
            clock_synced: AtomicBool::new(false),
        }
    }

    /// Use a fixed clock model instead of syncing on the first sample
    pub fn with_clock(mut self, model: ClockModel) -> Self {
        self.info.install_clock(model);
        self.configured_clock = Some(model);
        self
    }

    pub fn tick_hz(&self) -> f64 {
        self.tick_hz
    }

    /// Device seconds for a raw tick count
    pub fn device_seconds(&self, ticks: u64) -> f64 {
        ticks as f64 / self.tick_hz
    }

    pub fn is_clock_synced(&self) -> bool {
        self.clock_synced.load(Ordering::Acquire)
    }

    /// Pin the clock so `device_time` maps to `host_unix`. Only the first
    /// call after connect has an effect; returns whether this call did.
    /// Called from the audio thread, so it never waits: if the control
    /// thread is installing a clock at the same moment, the next sample
    /// tries again.
    pub fn sync_clock(&self, device_time: f64, host_unix: f64) -> bool {
        if !self.info.is_connected() {
            return false;
        }
        if self
            .clock_synced
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let model = ClockModel::from_sync_point(device_time, host_unix);
        if !self.info.try_install_clock(model) {
            self.clock_synced.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Capability frame from the device
    pub fn apply_capabilities(&self, mask: u16) {
        self.info.channels().apply_available_mask(mask);
    }

    /// Status frame from the device: the channels it is streaming
    pub fn apply_status(&self, mask: u16) {
        if self.info.is_connected() {
            self.info.channels().apply_active_mask(mask);
        } else {
            self.info.channels().deactivate_all();
        }
    }

    /// Channels the host asks the device to stream
    pub fn requested_mask(&self) -> u16 {
        let channels = self.info.channels();
        channels.enabled_mask() & channels.available_mask()
    }
}

impl MotionPeripheral for RemotePeripheral {
    fn info(&self) -> &PeripheralInfo {
        &self.info
    }

    fn is_local(&self) -> bool {
        false
    }

    fn connect(&self) -> Result<(), PeripheralError> {
        match self.configured_clock {
            Some(model) => {
                self.info.install_clock(model);
                self.clock_synced.store(true, Ordering::Release);
            }
            None => self.clock_synced.store(false, Ordering::Release),
        }
        self.info.set_connected(true);
        log::info!(
            "{} connected ({})",
            self.info.name(),
            self.info.location_label()
        );
        Ok(())
    }

    fn disconnect(&self) {
        self.info.set_connected(false);
        self.info.channels().deactivate_all();
        self.clock_synced.store(false, Ordering::Release);
        log::info!("{} disconnected", self.info.name());
    }

    fn apply_channel(&self, channel: Channel, enabled: bool) -> Result<(), PeripheralError> {
        log::debug!(
            "{}: {} requested {}",
            self.info.name(),
            channel,
            if enabled { "on" } else { "off" }
        );
        Ok(())
    }

    fn apply_update_interval(&self, seconds: f64) {
        log::debug!("{}: update interval {}s", self.info.name(), seconds);
    }
}
