//! Sound card I/O
//!
//! Opens the capture device (and optionally a playback device) through
//! cpal and forwards every period to the registered delegates. Samples are
//! handed over as interleaved f32; 16-bit devices are converted into a
//! scratch buffer allocated before the stream starts.
//!
//! cpal callbacks have no way to report a status back to the device, so
//! the delegate's status is only recorded by the dispatcher
//! (`IoDispatch::last_input_status` / `last_render_status`).

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{ActionFlags, AudioTimeStamp, DelegatableIo, IoDispatch, IoError, STOP_TIMEOUT};
use crate::clock::unix_now;

/// Frames per period assumed when the device does not report a range
const FALLBACK_PERIOD_FRAMES: usize = 8192;
/// Cap on the scratch size taken from a device's reported range
const MAX_PERIOD_FRAMES: usize = 1 << 16;

/// Scratch samples for one whole period of a 16-bit stream
fn scratch_len(buffer_size: &cpal::SupportedBufferSize, channels: u16) -> usize {
    let frames = match buffer_size {
        cpal::SupportedBufferSize::Range { max, .. } => (*max as usize).min(MAX_PERIOD_FRAMES),
        cpal::SupportedBufferSize::Unknown => FALLBACK_PERIOD_FRAMES,
    };
    frames.max(1) * usize::from(channels.max(1))
}

/// What `start` has to do given the current stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartAction {
    /// Streams are open and running
    AlreadyRunning,
    /// Streams are open but the device went away; tear down and rebuild
    Rebuild,
    /// Nothing open yet
    Build,
}

fn start_action(has_streams: bool, running: bool) -> StartAction {
    match (has_streams, running) {
        (true, true) => StartAction::AlreadyRunning,
        (true, false) => StartAction::Rebuild,
        (false, _) => StartAction::Build,
    }
}

/// Which devices to open
#[derive(Debug, Clone, Default)]
pub struct DeviceIoConfig {
    /// Input device name; `None` for the host default
    pub input_device: Option<String>,
    /// Output device name; `None` for the host default
    pub output_device: Option<String>,
    /// Open a playback stream for the render delegate
    pub enable_output: bool,
}

/// Maps stream instants onto host unix time and counts frames
struct StreamClock {
    anchor: Option<(cpal::StreamInstant, f64)>,
    sample_rate: f64,
    frames: u64,
}

impl StreamClock {
    fn new(sample_rate: u32) -> Self {
        Self {
            anchor: None,
            sample_rate: f64::from(sample_rate.max(1)),
            frames: 0,
        }
    }

    /// Stamp `frames` frames starting `offset` frames after `instant`
    fn stamp(
        &mut self,
        instant: cpal::StreamInstant,
        offset: usize,
        frames: usize,
    ) -> AudioTimeStamp {
        let (origin, origin_unix) = *self.anchor.get_or_insert_with(|| (instant, unix_now()));
        let elapsed = instant
            .duration_since(&origin)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let host_time = origin_unix + elapsed + offset as f64 / self.sample_rate;
        let ts = AudioTimeStamp::new(self.frames as f64, host_time);
        self.frames += frames as u64;
        ts
    }
}

/// Audio device I/O backend
pub struct DeviceIo {
    config: DeviceIoConfig,
    dispatch: Arc<IoDispatch>,
    running: Arc<AtomicBool>,
    input_stream: Option<cpal::Stream>,
    output_stream: Option<cpal::Stream>,
    sample_rate: u32,
    channels: u16,

    /// Available input devices
    pub devices: Vec<String>,
}

impl DeviceIo {
    pub fn new(config: DeviceIoConfig) -> Self {
        let host = cpal::default_host();
        let devices: Vec<String> = host
            .input_devices()
            .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
            .unwrap_or_default();

        if devices.is_empty() {
            log::warn!("No input devices found");
        } else {
            log::info!("Found {} input device(s)", devices.len());
        }

        Self {
            config,
            dispatch: Arc::new(IoDispatch::new()),
            running: Arc::new(AtomicBool::new(false)),
            input_stream: None,
            output_stream: None,
            sample_rate: 0,
            channels: 0,
            devices,
        }
    }

    /// Input channel count of the open stream
    pub fn channels(&self) -> u16 {
        self.channels
    }

    fn input_device(&self, host: &cpal::Host) -> Result<cpal::Device, IoError> {
        match &self.config.input_device {
            None => host
                .default_input_device()
                .ok_or_else(|| IoError::NoDevice("no default input device".to_string())),
            Some(name) => host
                .input_devices()
                .map_err(|e| IoError::NoDevice(e.to_string()))?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| IoError::NoDevice(name.clone())),
        }
    }

    fn output_device(&self, host: &cpal::Host) -> Result<cpal::Device, IoError> {
        match &self.config.output_device {
            None => host
                .default_output_device()
                .ok_or_else(|| IoError::NoDevice("no default output device".to_string())),
            Some(name) => host
                .output_devices()
                .map_err(|e| IoError::NoDevice(e.to_string()))?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| IoError::NoDevice(name.clone())),
        }
    }

    fn error_callback(&self) -> impl FnMut(cpal::StreamError) + Send + 'static {
        let running = Arc::clone(&self.running);
        move |err| {
            log::error!("Audio error: {}", err);
            if let cpal::StreamError::DeviceNotAvailable = err {
                running.store(false, Ordering::Release);
            }
        }
    }

    fn build_input(&self, device: &cpal::Device) -> Result<(cpal::Stream, u16, u32), IoError> {
        let config = device
            .default_input_config()
            .map_err(|e| IoError::DeviceConfig(e.to_string()))?;
        log::info!("Input config: {:?}", config);

        let channels = config.channels();
        let sample_rate = config.sample_rate().0;
        let dispatch = Arc::clone(&self.dispatch);
        let mut clock = StreamClock::new(sample_rate);

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &config.into(),
                move |data: &[f32], info: &cpal::InputCallbackInfo| {
                    let frames = data.len() / usize::from(channels.max(1));
                    let ts = clock.stamp(info.timestamp().capture, 0, frames);
                    let mut flags = ActionFlags::empty();
                    // Status is kept by the dispatcher
                    dispatch.dispatch_input(channels, data, &mut flags, &ts);
                },
                self.error_callback(),
                None,
            ),
            cpal::SampleFormat::I16 => {
                let step = usize::from(channels.max(1));
                let mut scratch = vec![0.0f32; scratch_len(config.buffer_size(), channels)];
                device.build_input_stream(
                    &config.into(),
                    move |data: &[i16], info: &cpal::InputCallbackInfo| {
                        let capture = info.timestamp().capture;
                        let mut offset = 0;
                        // One chunk per period unless the device exceeds
                        // the range it reported
                        for chunk in data.chunks(scratch.len()) {
                            let out = &mut scratch[..chunk.len()];
                            for (dst, src) in out.iter_mut().zip(chunk) {
                                *dst = *src as f32 / 32768.0;
                            }
                            let frames = chunk.len() / step;
                            let ts = clock.stamp(capture, offset, frames);
                            offset += frames;
                            let mut flags = ActionFlags::empty();
                            dispatch.dispatch_input(channels, out, &mut flags, &ts);
                        }
                    },
                    self.error_callback(),
                    None,
                )
            }
            format => return Err(IoError::UnsupportedFormat(format!("{:?}", format))),
        }
        .map_err(|e| IoError::BuildStream(e.to_string()))?;

        Ok((stream, channels, sample_rate))
    }

    fn build_output(&self, device: &cpal::Device) -> Result<cpal::Stream, IoError> {
        let config = device
            .default_output_config()
            .map_err(|e| IoError::DeviceConfig(e.to_string()))?;
        log::info!("Output config: {:?}", config);

        let channels = config.channels();
        let dispatch = Arc::clone(&self.dispatch);
        let mut clock = StreamClock::new(config.sample_rate().0);

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => device.build_output_stream(
                &config.into(),
                move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / usize::from(channels.max(1));
                    let ts = clock.stamp(info.timestamp().playback, 0, frames);
                    let mut flags = ActionFlags::empty();
                    dispatch.dispatch_render(channels, data, &mut flags, &ts);
                },
                self.error_callback(),
                None,
            ),
            cpal::SampleFormat::I16 => {
                let step = usize::from(channels.max(1));
                let mut scratch = vec![0.0f32; scratch_len(config.buffer_size(), channels)];
                device.build_output_stream(
                    &config.into(),
                    move |data: &mut [i16], info: &cpal::OutputCallbackInfo| {
                        let playback = info.timestamp().playback;
                        let mut offset = 0;
                        for chunk in data.chunks_mut(scratch.len()) {
                            let buf = &mut scratch[..chunk.len()];
                            let frames = chunk.len() / step;
                            let ts = clock.stamp(playback, offset, frames);
                            offset += frames;
                            let mut flags = ActionFlags::empty();
                            dispatch.dispatch_render(channels, buf, &mut flags, &ts);
                            for (dst, src) in chunk.iter_mut().zip(buf.iter()) {
                                *dst = (src.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                            }
                        }
                    },
                    self.error_callback(),
                    None,
                )
            }
            format => return Err(IoError::UnsupportedFormat(format!("{:?}", format))),
        }
        .map_err(|e| IoError::BuildStream(e.to_string()))?;

        Ok(stream)
    }

    fn release_streams(&mut self) -> Result<(), IoError> {
        let mut result = Ok(());
        for stream in [self.input_stream.take(), self.output_stream.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = stream.pause() {
                log::warn!("Failed to pause stream: {}", e);
                result = Err(IoError::Teardown(e.to_string()));
            }
        }
        result
    }
}

impl DelegatableIo for DeviceIo {
    fn start(&mut self) -> Result<(), IoError> {
        let running = self.running.load(Ordering::Acquire);
        match start_action(self.input_stream.is_some(), running) {
            StartAction::AlreadyRunning => return Ok(()),
            StartAction::Rebuild => {
                log::warn!("Audio device was lost, rebuilding streams");
                self.dispatch.shutdown(STOP_TIMEOUT);
                if let Err(e) = self.release_streams() {
                    log::warn!("Stale stream teardown failed: {}", e);
                }
            }
            StartAction::Build => {}
        }

        log::info!("Starting audio I/O...");
        let host = cpal::default_host();

        let device = self.input_device(&host)?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        log::info!("Using input device: {}", device_name);

        let (input, channels, sample_rate) = self.build_input(&device)?;

        let output = if self.config.enable_output {
            match self
                .output_device(&host)
                .and_then(|device| self.build_output(&device))
            {
                Ok(stream) => Some(stream),
                Err(e) => {
                    log::warn!("Continuing without output: {}", e);
                    None
                }
            }
        } else {
            None
        };

        self.dispatch.gate().open();
        if let Err(e) = input.play() {
            self.dispatch.shutdown(STOP_TIMEOUT);
            return Err(IoError::Play(e.to_string()));
        }
        if let Some(stream) = &output {
            if let Err(e) = stream.play() {
                log::warn!("Failed to start output: {}", e);
            }
        }

        self.channels = channels;
        self.sample_rate = sample_rate;
        self.input_stream = Some(input);
        self.output_stream = output;
        self.running.store(true, Ordering::Release);
        log::info!("Audio I/O started: {} ch @ {} Hz", channels, sample_rate);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), IoError> {
        let drained = self.dispatch.shutdown(STOP_TIMEOUT);
        let released = self.release_streams();
        self.running.store(false, Ordering::Release);
        log::info!("Audio I/O stopped");

        if !drained {
            return Err(IoError::DrainTimeout(STOP_TIMEOUT));
        }
        released
    }

    fn is_running(&self) -> bool {
        self.input_stream.is_some() && self.running.load(Ordering::Acquire)
    }

    fn dispatch(&self) -> &IoDispatch {
        &self.dispatch
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for DeviceIo {
    fn drop(&mut self) {
        if self.input_stream.is_some() {
            if let Err(e) = self.stop() {
                log::warn!("Error stopping audio I/O: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_rebuilds_after_device_loss() {
        assert_eq!(start_action(false, false), StartAction::Build);
        assert_eq!(start_action(true, true), StartAction::AlreadyRunning);
        // The error callback cleared `running` but the streams are still held
        assert_eq!(start_action(true, false), StartAction::Rebuild);
    }

    #[test]
    fn test_scratch_holds_a_whole_period() {
        let range = cpal::SupportedBufferSize::Range { min: 64, max: 4096 };
        assert_eq!(scratch_len(&range, 2), 8192);
        assert_eq!(scratch_len(&range, 0), 4096);

        let huge = cpal::SupportedBufferSize::Range {
            min: 64,
            max: u32::MAX,
        };
        assert_eq!(scratch_len(&huge, 1), MAX_PERIOD_FRAMES);

        assert_eq!(
            scratch_len(&cpal::SupportedBufferSize::Unknown, 3),
            FALLBACK_PERIOD_FRAMES * 3
        );
    }
}
