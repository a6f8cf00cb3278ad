//! Device to host clock translation
//!
//! Peripherals stamp samples with their own clock. Before a measurement is
//! built the device time is converted to host unix-epoch seconds through a
//! `ClockModel`, after checking it against the peripheral's `ClockBounds`.
//!
//! The model is installed by the control thread (usually at connect time)
//! and read by the audio thread for every decoded sample, so it lives in a
//! `SharedClock`: a few published slots of atomics. Readers never block
//! and never allocate.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, TryLockError};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ten years of device uptime
const DEFAULT_MAX_DEVICE_TIME: f64 = 315_576_000.0;

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum ClockSyncError {
    #[error("Device time {device_time} is outside the expected range")]
    OutOfBounds { device_time: f64 },

    #[error("Device time is not a finite number")]
    NotFinite,

    #[error("Drift of {drift_ppm} ppm would make the clock run backwards")]
    InvalidDrift { drift_ppm: f64 },
}

/// How device time maps onto host unix-epoch seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum ClockModel {
    /// `host = device + offset`
    Fixed { offset: f64 },
    /// `host = device + offset + (device - reference) * drift_ppm * 1e-6`
    DriftCorrected {
        offset: f64,
        reference: f64,
        drift_ppm: f64,
    },
}

impl Default for ClockModel {
    fn default() -> Self {
        Self::Fixed { offset: 0.0 }
    }
}

impl ClockModel {
    pub fn fixed(offset: f64) -> Self {
        Self::Fixed { offset }
    }

    pub fn drift_corrected(offset: f64, reference: f64, drift_ppm: f64) -> Result<Self, ClockSyncError> {
        if !drift_ppm.is_finite() || drift_ppm <= -1_000_000.0 {
            return Err(ClockSyncError::InvalidDrift { drift_ppm });
        }
        Ok(Self::DriftCorrected {
            offset,
            reference,
            drift_ppm,
        })
    }

    /// Model for a clock that counts seconds since boot
    pub fn boot_offset(now_unix: f64, uptime: f64) -> Self {
        Self::Fixed {
            offset: now_unix - uptime,
        }
    }

    /// Model pinned so that `device_time` maps to `host_unix`
    pub fn from_sync_point(device_time: f64, host_unix: f64) -> Self {
        Self::Fixed {
            offset: host_unix - device_time,
        }
    }

    pub fn seconds_from_unix_epoch(&self, device_time: f64) -> f64 {
        match *self {
            Self::Fixed { offset } => device_time + offset,
            Self::DriftCorrected {
                offset,
                reference,
                drift_ppm,
            } => device_time + offset + (device_time - reference) * drift_ppm * 1e-6,
        }
    }
}

/// What to do with a sample whose device time is out of bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockPolicy {
    /// Keep the sample, marked `clock_suspect`
    #[default]
    Flag,
    /// Drop the sample
    Drop,
}

/// Valid device time range: `0..=max_device_time`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockBounds {
    pub max_device_time: f64,
}

impl Default for ClockBounds {
    fn default() -> Self {
        Self {
            max_device_time: DEFAULT_MAX_DEVICE_TIME,
        }
    }
}

impl ClockBounds {
    pub fn new(max_device_time: f64) -> Self {
        Self { max_device_time }
    }

    pub fn check(&self, device_time: f64) -> Result<(), ClockSyncError> {
        if !device_time.is_finite() {
            return Err(ClockSyncError::NotFinite);
        }
        if device_time < 0.0 || device_time > self.max_device_time {
            return Err(ClockSyncError::OutOfBounds { device_time });
        }
        Ok(())
    }
}

/// A converted timestamp
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostTimestamp {
    /// Host unix-epoch seconds
    pub seconds: f64,
    /// Device time was out of bounds and kept under `ClockPolicy::Flag`
    pub suspect: bool,
}

/// Convert `device_time` applying bounds and policy.
///
/// Non-finite times are always rejected since no host time can be computed.
pub fn resolve(
    model: &ClockModel,
    bounds: &ClockBounds,
    policy: ClockPolicy,
    device_time: f64,
) -> Result<HostTimestamp, ClockSyncError> {
    match bounds.check(device_time) {
        Ok(()) => Ok(HostTimestamp {
            seconds: model.seconds_from_unix_epoch(device_time),
            suspect: false,
        }),
        Err(ClockSyncError::OutOfBounds { .. }) if policy == ClockPolicy::Flag => {
            Ok(HostTimestamp {
                seconds: model.seconds_from_unix_epoch(device_time),
                suspect: true,
            })
        }
        Err(e) => Err(e),
    }
}

/// Current host time in unix-epoch seconds
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

const TAG_FIXED: u64 = 0;
const TAG_DRIFT: u64 = 1;
const SLOTS: usize = 3;

/// One published copy of the model
#[derive(Default)]
struct ClockSlot {
    tag: AtomicU64,
    offset: AtomicU64,
    reference: AtomicU64,
    drift_ppm: AtomicU64,
    /// Readers currently copying this slot
    readers: AtomicUsize,
}

impl ClockSlot {
    fn write(&self, model: ClockModel) {
        let (tag, offset, reference, drift_ppm) = match model {
            ClockModel::Fixed { offset } => (TAG_FIXED, offset, 0.0, 0.0),
            ClockModel::DriftCorrected {
                offset,
                reference,
                drift_ppm,
            } => (TAG_DRIFT, offset, reference, drift_ppm),
        };
        self.tag.store(tag, Ordering::Relaxed);
        self.offset.store(offset.to_bits(), Ordering::Relaxed);
        self.reference.store(reference.to_bits(), Ordering::Relaxed);
        self.drift_ppm.store(drift_ppm.to_bits(), Ordering::Relaxed);
    }

    fn read(&self) -> ClockModel {
        let offset = f64::from_bits(self.offset.load(Ordering::Relaxed));
        if self.tag.load(Ordering::Relaxed) == TAG_DRIFT {
            ClockModel::DriftCorrected {
                offset,
                reference: f64::from_bits(self.reference.load(Ordering::Relaxed)),
                drift_ppm: f64::from_bits(self.drift_ppm.load(Ordering::Relaxed)),
            }
        } else {
            ClockModel::Fixed { offset }
        }
    }
}

/// Clock model shared between the control thread and the audio thread.
///
/// Writers fill a slot nobody is reading and publish it with a single
/// store of `current`. Readers pin the current slot with a reader count
/// and never wait on a writer: a writer stalled half way through a slot
/// is invisible to them because that slot is not published yet.
pub struct SharedClock {
    slots: [ClockSlot; SLOTS],
    current: AtomicUsize,
    /// Serializes writers
    writer: Mutex<()>,
}

impl Default for SharedClock {
    fn default() -> Self {
        Self::new(ClockModel::default())
    }
}

impl SharedClock {
    pub fn new(model: ClockModel) -> Self {
        let clock = Self {
            slots: Default::default(),
            current: AtomicUsize::new(0),
            writer: Mutex::new(()),
        };
        clock.slots[0].write(model);
        clock
    }

    /// Install a new model. May wait for other writers and for readers of
    /// stale slots, so it is for the control thread only.
    pub fn store(&self, model: ClockModel) {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(slot) = self.free_slot() {
                self.publish(slot, model);
                return;
            }
            thread::yield_now();
        }
    }

    /// Install a new model without waiting. Returns false if another
    /// writer holds the clock or every spare slot is still being read.
    pub fn try_store(&self, model: ClockModel) -> bool {
        let _guard = match self.writer.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        match self.free_slot() {
            Some(slot) => {
                self.publish(slot, model);
                true
            }
            None => false,
        }
    }

    /// Never waits. Only retries when a newer model was published between
    /// picking a slot and pinning it.
    pub fn load(&self) -> ClockModel {
        loop {
            let index = self.current.load(Ordering::SeqCst);
            let slot = &self.slots[index];
            slot.readers.fetch_add(1, Ordering::SeqCst);
            let pinned = self.current.load(Ordering::SeqCst) == index;
            let model = pinned.then(|| slot.read());
            slot.readers.fetch_sub(1, Ordering::Release);
            if let Some(model) = model {
                return model;
            }
        }
    }

    /// A slot that is neither published nor being read. Writer lock held.
    fn free_slot(&self) -> Option<usize> {
        let current = self.current.load(Ordering::SeqCst);
        (0..SLOTS).find(|&i| i != current && self.slots[i].readers.load(Ordering::SeqCst) == 0)
    }

    fn publish(&self, index: usize, model: ClockModel) {
        self.slots[index].write(model);
        self.current.store(index, Ordering::SeqCst);
    }
}
