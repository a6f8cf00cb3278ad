//! Sensor peripherals
//!
//! A peripheral is a source of motion samples: the host device itself or an
//! external sensor attached over the audio interface. All variants share
//! `PeripheralInfo` (identity, placement, channel flags, clock) and the
//! `MotionPeripheral` trait, and differ in how channel availability is
//! learned, how samples arrive and how device time maps to host time.
//!
//! Everything the audio thread reads is stored in atomics, so peripherals
//! are shared as `Arc<...>` between the control thread and the audio thread
//! and every operation takes `&self`.

mod channel;
mod local;
mod remote;

pub use channel::{Channel, ChannelFlags, ChannelState};
pub use local::{LocalPeripheral, MotionHardware, NullMotionHardware, LOCAL_KIND};
pub use remote::{RemotePeripheral, DEFAULT_TICK_HZ, REMOTE_KIND};

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use uuid::Uuid;

use crate::clock::{self, ClockBounds, ClockModel, ClockPolicy, ClockSyncError, HostTimestamp, SharedClock};
use crate::measurement::{BodyPart, BodySide};

/// 100 Hz
pub const DEFAULT_UPDATE_INTERVAL: f64 = 0.01;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PeripheralError {
    #[error("The {0} channel is not available on this peripheral")]
    ChannelUnavailable(Channel),

    #[error("Update interval must be a positive number of seconds, got {0}")]
    InvalidInterval(f64),

    #[error("Peripheral is not connected")]
    NotConnected,

    #[error("Hardware error: {0}")]
    Hardware(String),
}

/// State shared by every peripheral variant
pub struct PeripheralInfo {
    uuid: Uuid,
    kind: String,
    name: Mutex<String>,
    body_side: AtomicU8,
    body_part: AtomicU8,
    /// f64 bits, seconds
    update_interval: AtomicU64,
    autoconnect: AtomicBool,
    connected: AtomicBool,
    channels: ChannelFlags,
    clock: SharedClock,
    clock_bounds: ClockBounds,
    clock_policy: ClockPolicy,
}

impl PeripheralInfo {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            kind: kind.into(),
            name: Mutex::new(name.into()),
            body_side: AtomicU8::new(BodySide::Unknown.code()),
            body_part: AtomicU8::new(BodyPart::Unknown.code()),
            update_interval: AtomicU64::new(DEFAULT_UPDATE_INTERVAL.to_bits()),
            autoconnect: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            channels: ChannelFlags::new(),
            clock: SharedClock::default(),
            clock_bounds: ClockBounds::default(),
            clock_policy: ClockPolicy::default(),
        }
    }

    /// Reuse a known identity, e.g. a previously paired device
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn with_clock_bounds(mut self, bounds: ClockBounds) -> Self {
        self.clock_bounds = bounds;
        self
    }

    pub fn with_clock_policy(mut self, policy: ClockPolicy) -> Self {
        self.clock_policy = policy;
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name(&self) -> String {
        self.name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().unwrap_or_else(PoisonError::into_inner) = name.into();
    }

    pub fn body_side(&self) -> BodySide {
        BodySide::from_code(self.body_side.load(Ordering::Relaxed))
    }

    pub fn set_body_side(&self, side: BodySide) {
        self.body_side.store(side.code(), Ordering::Relaxed);
    }

    pub fn body_part(&self) -> BodyPart {
        BodyPart::from_code(self.body_part.load(Ordering::Relaxed))
    }

    pub fn set_body_part(&self, part: BodyPart) {
        self.body_part.store(part.code(), Ordering::Relaxed);
    }

    pub fn update_interval(&self) -> f64 {
        f64::from_bits(self.update_interval.load(Ordering::Relaxed))
    }

    pub(crate) fn store_update_interval(&self, seconds: f64) {
        self.update_interval.store(seconds.to_bits(), Ordering::Relaxed);
    }

    pub fn autoconnect(&self) -> bool {
        self.autoconnect.load(Ordering::Relaxed)
    }

    pub fn set_autoconnect(&self, autoconnect: bool) {
        self.autoconnect.store(autoconnect, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn channels(&self) -> &ChannelFlags {
        &self.channels
    }

    pub fn clock(&self) -> ClockModel {
        self.clock.load()
    }

    /// Control thread only; may wait for a concurrent writer
    pub fn install_clock(&self, model: ClockModel) {
        self.clock.store(model);
    }

    /// Real-time safe variant of `install_clock`; false if it would wait
    pub fn try_install_clock(&self, model: ClockModel) -> bool {
        self.clock.try_store(model)
    }

    pub fn clock_bounds(&self) -> ClockBounds {
        self.clock_bounds
    }

    pub fn clock_policy(&self) -> ClockPolicy {
        self.clock_policy
    }

    /// Human readable placement, e.g. "left wrist"
    pub fn location_label(&self) -> String {
        match (self.body_side(), self.body_part()) {
            (BodySide::Unknown, BodyPart::Unknown) => "unknown".to_string(),
            (BodySide::Unknown, part) => part.name().to_string(),
            (side, BodyPart::Unknown) => format!("{} side", side.name()),
            (side, part) => format!("{} {}", side.name(), part.name()),
        }
    }
}

/// Common interface of all peripheral variants
pub trait MotionPeripheral: Send + Sync {
    fn info(&self) -> &PeripheralInfo;

    /// Whether samples originate on the host device
    fn is_local(&self) -> bool;

    fn connect(&self) -> Result<(), PeripheralError>;

    /// Drive every channel inactive and release the hardware
    fn disconnect(&self);

    /// Ask the underlying hardware to start or stop a channel. Only called
    /// while connected. Implementations set `active` once the hardware
    /// confirms, never before.
    fn apply_channel(&self, channel: Channel, enabled: bool) -> Result<(), PeripheralError>;

    /// Forward a new sample interval to the hardware; it takes effect on
    /// the next scheduling cycle.
    fn apply_update_interval(&self, seconds: f64);

    fn uuid(&self) -> Uuid {
        self.info().uuid()
    }

    fn kind(&self) -> &str {
        self.info().kind()
    }

    fn name(&self) -> String {
        self.info().name()
    }

    fn set_name(&self, name: &str) {
        self.info().set_name(name);
    }

    fn body_side(&self) -> BodySide {
        self.info().body_side()
    }

    fn set_body_side(&self, side: BodySide) {
        self.info().set_body_side(side);
    }

    fn body_part(&self) -> BodyPart {
        self.info().body_part()
    }

    fn set_body_part(&self, part: BodyPart) {
        self.info().set_body_part(part);
    }

    fn location_label(&self) -> String {
        self.info().location_label()
    }

    fn update_interval(&self) -> f64 {
        self.info().update_interval()
    }

    fn set_update_interval(&self, seconds: f64) -> Result<(), PeripheralError> {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(PeripheralError::InvalidInterval(seconds));
        }
        self.info().store_update_interval(seconds);
        if self.info().is_connected() {
            self.apply_update_interval(seconds);
        }
        Ok(())
    }

    fn autoconnect(&self) -> bool {
        self.info().autoconnect()
    }

    fn set_autoconnect(&self, autoconnect: bool) {
        self.info().set_autoconnect(autoconnect);
    }

    fn is_connected(&self) -> bool {
        self.info().is_connected()
    }

    fn channel_state(&self, channel: Channel) -> ChannelState {
        self.info().channels().state(channel)
    }

    fn is_available(&self, channel: Channel) -> bool {
        self.channel_state(channel).available
    }

    fn is_enabled(&self, channel: Channel) -> bool {
        self.channel_state(channel).enabled
    }

    fn is_active(&self, channel: Channel) -> bool {
        self.channel_state(channel).active
    }

    /// Record the user's intent for `channel` and, when connected, ask the
    /// hardware to follow it. Enabling an unavailable channel fails without
    /// touching any other channel.
    fn set_enabled(&self, channel: Channel, enabled: bool) -> Result<(), PeripheralError> {
        let info = self.info();
        if enabled && !info.channels().state(channel).available {
            return Err(PeripheralError::ChannelUnavailable(channel));
        }
        info.channels().set_enabled(channel, enabled);
        if !info.is_connected() {
            return Ok(());
        }
        self.apply_channel(channel, enabled).map_err(|e| {
            let action = if enabled { "enable" } else { "disable" };
            log::warn!("{}: failed to {} {}: {}", info.name(), action, channel, e);
            e
        })
    }

    fn seconds_from_unix_epoch(&self, device_time: f64) -> f64 {
        self.info().clock().seconds_from_unix_epoch(device_time)
    }

    /// Convert a device timestamp, applying the clock bounds and policy
    fn timestamp_for(&self, device_time: f64) -> Result<HostTimestamp, ClockSyncError> {
        let info = self.info();
        clock::resolve(&info.clock(), &info.clock_bounds(), info.clock_policy(), device_time)
    }
}
