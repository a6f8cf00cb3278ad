//! Capture file replay
//!
//! Plays a recorded capture (any container symphonia can read) through
//! the input delegate as if it were arriving from the sound card. The file
//! is decoded up front on the calling thread; a pacing thread then hands
//! out one period at a time at the file's sample rate.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use super::{ActionFlags, AudioTimeStamp, DelegatableIo, IoDispatch, IoError, STOP_TIMEOUT};
use crate::clock::unix_now;

/// Errors that can occur while loading a capture file
#[derive(Error, Debug)]
pub enum FileError {
    #[error("Failed to open file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to probe audio format: {0}")]
    ProbeError(String),

    #[error("No audio tracks found")]
    NoTracks,

    #[error("Unsupported sample format")]
    UnsupportedFormat,

    #[error("Decoder error: {0}")]
    DecoderError(String),
}

/// Replay settings
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub path: PathBuf,
    /// Frames per delivered period
    pub period_frames: usize,
    /// Start over at end of file instead of stopping
    pub loop_playback: bool,
}

impl ReplayConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            period_frames: 512,
            loop_playback: false,
        }
    }
}

/// Decoded capture, interleaved
#[derive(Debug, Clone)]
struct Recording {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
}

/// File replay I/O backend
pub struct ReplayIo {
    config: ReplayConfig,
    dispatch: Arc<IoDispatch>,
    running: Arc<AtomicBool>,
    thread_handle: Option<thread::JoinHandle<()>>,
    sample_rate: u32,
    channels: u16,
}

impl ReplayIo {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            config,
            dispatch: Arc::new(IoDispatch::new()),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            sample_rate: 0,
            channels: 0,
        }
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    fn join_thread(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                log::error!("Replay thread panicked");
            }
        }
    }
}

impl DelegatableIo for ReplayIo {
    fn start(&mut self) -> Result<(), IoError> {
        if self.is_running() {
            return Ok(());
        }
        // A previous run that reached end of file leaves a finished thread
        self.join_thread();

        let recording = load(&self.config.path)?;
        log::info!(
            "Replaying {:?}: {} ch @ {} Hz, {} frames",
            self.config.path,
            recording.channels,
            recording.sample_rate,
            recording.samples.len() / usize::from(recording.channels)
        );
        self.sample_rate = recording.sample_rate;
        self.channels = recording.channels;

        self.dispatch.gate().open();
        self.running.store(true, Ordering::Release);

        let dispatch = Arc::clone(&self.dispatch);
        let running = Arc::clone(&self.running);
        let period_frames = self.config.period_frames.max(1);
        let loop_playback = self.config.loop_playback;

        self.thread_handle = Some(thread::spawn(move || {
            pace(&recording, &dispatch, &running, period_frames, loop_playback);
        }));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), IoError> {
        self.running.store(false, Ordering::Release);
        let drained = self.dispatch.shutdown(STOP_TIMEOUT);
        self.join_thread();
        log::info!("Replay stopped");
        if drained {
            Ok(())
        } else {
            Err(IoError::DrainTimeout(STOP_TIMEOUT))
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn dispatch(&self) -> &IoDispatch {
        &self.dispatch
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for ReplayIo {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            if let Err(e) = self.stop() {
                log::warn!("Error stopping replay: {}", e);
            }
        }
    }
}

/// Deliver periods at the recording's sample rate until stopped or done
fn pace(
    recording: &Recording,
    dispatch: &IoDispatch,
    running: &AtomicBool,
    period_frames: usize,
    loop_playback: bool,
) {
    let channels = usize::from(recording.channels);
    let rate = f64::from(recording.sample_rate);
    let period = period_frames * channels;
    let start = Instant::now();
    let start_unix = unix_now();
    let mut sent_frames: u64 = 0;

    'outer: loop {
        for chunk in recording.samples.chunks(period) {
            if !running.load(Ordering::Acquire) {
                break 'outer;
            }

            let due = Duration::from_secs_f64(sent_frames as f64 / rate);
            if let Some(wait) = due.checked_sub(start.elapsed()) {
                thread::sleep(wait);
            }

            let ts = AudioTimeStamp::new(sent_frames as f64, start_unix + due.as_secs_f64());
            let mut flags = ActionFlags::empty();
            dispatch.dispatch_input(recording.channels, chunk, &mut flags, &ts);
            sent_frames += (chunk.len() / channels) as u64;
        }

        if !loop_playback || recording.samples.is_empty() {
            break;
        }
        log::debug!("Replay looping");
    }

    running.store(false, Ordering::Release);
}

/// Decode a whole file into interleaved f32
fn load(path: &Path) -> Result<Recording, FileError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| FileError::ProbeError(e.to_string()))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(FileError::NoTracks)?;

    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(44100);
    let mut channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| FileError::DecoderError(e.to_string()))?;

    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) if samples.is_empty() => return Err(FileError::DecoderError(e.to_string())),
            Err(e) => {
                log::warn!("Stopped reading at: {}", e);
                break;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = decoded.spec();
                sample_rate = spec.rate;
                channels = spec.channels.count() as u16;
                extract_samples(&decoded, &mut samples)?;
            }
            Err(SymphoniaError::DecodeError(e)) => {
                log::warn!("Skipping undecodable packet: {}", e);
            }
            Err(e) => return Err(FileError::DecoderError(e.to_string())),
        }
    }

    Ok(Recording {
        samples,
        channels: channels.max(1),
        sample_rate,
    })
}

/// Append a decoded buffer to `out`, interleaved
fn extract_samples(buffer: &AudioBufferRef<'_>, out: &mut Vec<f32>) -> Result<(), FileError> {
    match buffer {
        AudioBufferRef::F32(buf) => {
            let channels = buf.spec().channels.count();
            for frame in 0..buf.frames() {
                out.extend((0..channels).map(|ch| buf.chan(ch)[frame]));
            }
        }
        AudioBufferRef::S16(buf) => {
            let channels = buf.spec().channels.count();
            for frame in 0..buf.frames() {
                out.extend((0..channels).map(|ch| buf.chan(ch)[frame] as f32 / 32768.0));
            }
        }
        AudioBufferRef::S32(buf) => {
            let channels = buf.spec().channels.count();
            for frame in 0..buf.frames() {
                out.extend((0..channels).map(|ch| buf.chan(ch)[frame] as f32 / 2147483648.0));
            }
        }
        _ => return Err(FileError::UnsupportedFormat),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{AudioBufferList, IoDelegate, IoStatus};
    use std::io::Write;
    use std::sync::Mutex;

    /// Minimal 16-bit PCM WAV
    fn write_wav(path: &Path, channels: u16, rate: u32, samples: &[i16]) {
        let data_len = (samples.len() * 2) as u32;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&rate.to_le_bytes());
        bytes.extend_from_slice(&(rate * u32::from(channels) * 2).to_le_bytes());
        bytes.extend_from_slice(&(channels * 2).to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        File::create(path).unwrap().write_all(&bytes).unwrap();
    }

    #[derive(Default)]
    struct Collect {
        samples: Mutex<Vec<f32>>,
        stamps: Mutex<Vec<AudioTimeStamp>>,
    }

    impl IoDelegate for Collect {
        fn io(
            &self,
            data: &mut AudioBufferList<'_>,
            _flags: &mut ActionFlags,
            time_stamp: &AudioTimeStamp,
            _bus_number: u32,
            _num_frames: u32,
        ) -> IoStatus {
            self.samples.lock().unwrap().extend_from_slice(data.samples());
            self.stamps.lock().unwrap().push(*time_stamp);
            0
        }
    }

    #[test]
    fn test_load_interleaves_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 2, 8000, &[16384, -16384, 8192, 0]);

        let recording = load(&path).unwrap();
        assert_eq!(recording.channels, 2);
        assert_eq!(recording.sample_rate, 8000);
        assert_eq!(recording.samples, vec![0.5, -0.5, 0.25, 0.0]);
    }

    #[test]
    fn test_missing_file() {
        let err = load(Path::new("/nonexistent/capture.wav")).unwrap_err();
        assert!(matches!(err, FileError::IoError(_)));
    }

    #[test]
    fn test_replay_delivers_whole_file_then_stops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        let samples: Vec<i16> = (0..2_000).map(|i| (i % 100) as i16).collect();
        write_wav(&path, 1, 48_000, &samples);

        let mut config = ReplayConfig::new(&path);
        config.period_frames = 256;
        let mut io = ReplayIo::new(config);
        let collect = Arc::new(Collect::default());
        let delegate: Arc<dyn IoDelegate> = collect.clone();
        io.set_input_delegate(Some(Arc::downgrade(&delegate)));

        io.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while io.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!io.is_running());
        io.stop().unwrap();

        assert_eq!(collect.samples.lock().unwrap().len(), 2_000);
        let stamps = collect.stamps.lock().unwrap();
        assert_eq!(stamps.len(), 8);
        assert_eq!(stamps[1].sample_time, 256.0);
        let spacing = stamps[1].host_time - stamps[0].host_time;
        assert!((spacing - 256.0 / 48_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_no_callbacks_after_stop_returns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.wav");
        // Ten seconds at 8 kHz, looped, so playback is still going at stop
        write_wav(&path, 1, 8_000, &vec![100i16; 80_000]);

        let mut config = ReplayConfig::new(&path);
        config.period_frames = 80;
        config.loop_playback = true;
        let mut io = ReplayIo::new(config);
        let collect = Arc::new(Collect::default());
        let delegate: Arc<dyn IoDelegate> = collect.clone();
        io.set_input_delegate(Some(Arc::downgrade(&delegate)));

        io.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while collect.stamps.lock().unwrap().len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(io.is_running());

        io.stop().unwrap();
        assert!(!io.is_running());
        let at_stop = collect.stamps.lock().unwrap().len();
        assert!(at_stop >= 3);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(collect.stamps.lock().unwrap().len(), at_stop);
        assert_eq!(Arc::strong_count(&collect), 2);
    }
}
