//! Real-time audio I/O delegation
//!
//! An I/O backend owns the hardware stream (or something standing in for
//! it) and forwards every buffer period to at most one input delegate and
//! one render delegate. Delegates are held as `Weak` references, so a
//! backend never keeps a delegate alive; a dropped delegate just leaves its
//! slot empty.
//!
//! Delegate callbacks run on the real-time thread. They must not block,
//! allocate, or take a lock that another thread may hold. Errors come back
//! as `IoStatus` codes, never as panics or `Result`s.
//!
//! Backends:
//! - `DeviceIo`: sound card via cpal
//! - `ReplayIo`: a recorded capture file, paced at real time
//! - `ManualIo`: periods driven by the caller

mod device;
mod dispatch;
mod manual;
mod replay;

pub use device::{DeviceIo, DeviceIoConfig};
pub use dispatch::{CallbackGate, DelegateSlot, IoDispatch};
pub use manual::{ManualDriver, ManualIo};
pub use replay::{FileError, ReplayConfig, ReplayIo};

use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;

/// Status code returned by a delegate and handed to the audio subsystem
pub type IoStatus = i32;

/// Status codes understood by the backends
pub mod status {
    use super::IoStatus;

    pub const NO_ERR: IoStatus = 0;
    /// Buffer was not of the expected direction or shape
    pub const INVALID_BUFFER: IoStatus = -50;
    /// An encoded frame in the buffer was malformed and dropped
    pub const DECODE_ERROR: IoStatus = -1001;
    /// Delegate state was being swapped; the period was skipped
    pub const BUSY: IoStatus = -1002;
}

/// Bus carrying the hardware input
pub const INPUT_BUS: u32 = 1;
/// Bus carrying the hardware output
pub const OUTPUT_BUS: u32 = 0;

/// Upper bound for `stop` to wait on an in-flight callback
pub const STOP_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-period action flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActionFlags(u32);

impl ActionFlags {
    pub const PRE_RENDER: ActionFlags = ActionFlags(1 << 2);
    pub const POST_RENDER: ActionFlags = ActionFlags(1 << 3);
    pub const OUTPUT_IS_SILENCE: ActionFlags = ActionFlags(1 << 4);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: ActionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ActionFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ActionFlags) {
        self.0 &= !other.0;
    }
}

/// Timing of the first frame in a buffer
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AudioTimeStamp {
    /// Frames since the stream started
    pub sample_time: f64,
    /// Host unix-epoch seconds
    pub host_time: f64,
}

impl AudioTimeStamp {
    pub fn new(sample_time: f64, host_time: f64) -> Self {
        Self {
            sample_time,
            host_time,
        }
    }
}

/// Interleaved sample data for one period
pub enum IoBuffer<'a> {
    /// Captured input, read-only
    Captured(&'a [f32]),
    /// Output to be filled by the render delegate
    Render(&'a mut [f32]),
}

/// One period of audio handed to a delegate
pub struct AudioBufferList<'a> {
    pub channels: u16,
    pub data: IoBuffer<'a>,
}

impl<'a> AudioBufferList<'a> {
    pub fn captured(channels: u16, samples: &'a [f32]) -> Self {
        Self {
            channels,
            data: IoBuffer::Captured(samples),
        }
    }

    pub fn render(channels: u16, samples: &'a mut [f32]) -> Self {
        Self {
            channels,
            data: IoBuffer::Render(samples),
        }
    }

    pub fn samples(&self) -> &[f32] {
        match &self.data {
            IoBuffer::Captured(s) => s,
            IoBuffer::Render(s) => s,
        }
    }

    /// Writable samples; `None` for captured input
    pub fn samples_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.data {
            IoBuffer::Captured(_) => None,
            IoBuffer::Render(s) => Some(&mut **s),
        }
    }
}

/// A consumer or producer of real-time audio buffers
pub trait IoDelegate: Send + Sync {
    /// Called once per period on the real-time thread
    fn io(
        &self,
        data: &mut AudioBufferList<'_>,
        flags: &mut ActionFlags,
        time_stamp: &AudioTimeStamp,
        bus_number: u32,
        num_frames: u32,
    ) -> IoStatus;
}

/// Errors from starting or stopping a stream
#[derive(Error, Debug)]
pub enum IoError {
    #[error("No audio device found: {0}")]
    NoDevice(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to read device configuration: {0}")]
    DeviceConfig(String),

    #[error("Failed to build stream: {0}")]
    BuildStream(String),

    #[error("Failed to start stream: {0}")]
    Play(String),

    #[error("Failed to tear down stream: {0}")]
    Teardown(String),

    #[error("Delegate callback still running after {0:?}")]
    DrainTimeout(Duration),

    #[error("Replay failed: {0}")]
    Replay(#[from] FileError),
}

/// A stream that forwards its buffers to registered delegates
pub trait DelegatableIo {
    /// Start the stream. Does nothing if already running.
    fn start(&mut self) -> Result<(), IoError>;

    /// Stop the stream. On return the stream is not running and no delegate
    /// callback is in progress or will start, even if an error is reported.
    fn stop(&mut self) -> Result<(), IoError>;

    /// Actual stream state, not merely whether `start` was called
    fn is_running(&self) -> bool;

    fn dispatch(&self) -> &IoDispatch;

    /// Frames per second of the running stream, 0 when unknown
    fn sample_rate(&self) -> u32 {
        0
    }

    fn set_input_delegate(&self, delegate: Option<Weak<dyn IoDelegate>>) {
        self.dispatch().input().set(delegate);
    }

    fn set_render_delegate(&self, delegate: Option<Weak<dyn IoDelegate>>) {
        self.dispatch().render().set(delegate);
    }

    fn input_delegate(&self) -> Option<Arc<dyn IoDelegate>> {
        self.dispatch().input().get()
    }

    fn render_delegate(&self) -> Option<Arc<dyn IoDelegate>> {
        self.dispatch().render().get()
    }
}
