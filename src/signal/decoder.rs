//! Input delegate decoding sensor frames into measurement records
//!
//! Runs on the real-time thread: no allocation, no blocking, no logging.
//! Partial frames are carried across periods in a fixed array. Problems
//! show up in the counters and the returned status code.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{sample_to_word, Frame, FrameKind, FRAME_WORDS, SYNC};
use crate::clock::ClockSyncError;
use crate::io::{status, ActionFlags, AudioBufferList, AudioTimeStamp, IoDelegate, IoStatus};
use crate::measurement::{
    AccelerometerData, DeviceMotion, GyroData, MagneticAccuracy, MagnetometerData, Measurement,
    Quaternion, Vector3,
};
use crate::peripheral::{MotionPeripheral, RemotePeripheral};
use crate::queue::MeasurementProducer;

/// Snapshot of decoder counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecoderStats {
    /// Frames that passed validation
    pub frames: u64,
    /// Malformed frames dropped
    pub decode_errors: u64,
    /// Records built and queued
    pub records: u64,
    /// Records lost to a full queue
    pub queue_full: u64,
    /// Sensor frames for channels that are not active
    pub inactive: u64,
    /// Samples rejected by the clock policy
    pub clock_rejected: u64,
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    decode_errors: AtomicU64,
    records: AtomicU64,
    queue_full: AtomicU64,
    inactive: AtomicU64,
    clock_rejected: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct DecoderState {
    producer: MeasurementProducer,
    pending: [u16; FRAME_WORDS],
    len: usize,
}

impl DecoderState {
    /// Drop the frame in `pending` and restart at the next sync word in it
    fn resync(&mut self) {
        match self.pending[1..self.len].iter().position(|w| *w == SYNC) {
            Some(i) => {
                let start = i + 1;
                self.pending.copy_within(start..self.len, 0);
                self.len -= start;
            }
            None => self.len = 0,
        }
    }
}

pub struct SignalDecoder {
    peripheral: Arc<RemotePeripheral>,
    carrier: u16,
    sample_rate: AtomicU32,
    state: Mutex<DecoderState>,
    counters: Counters,
}

impl SignalDecoder {
    pub fn new(peripheral: Arc<RemotePeripheral>, producer: MeasurementProducer) -> Self {
        Self {
            peripheral,
            carrier: 0,
            sample_rate: AtomicU32::new(48_000),
            state: Mutex::new(DecoderState {
                producer,
                pending: [0; FRAME_WORDS],
                len: 0,
            }),
            counters: Counters::default(),
        }
    }

    /// Read words from interleaved channel `carrier` instead of 0
    pub fn with_carrier(mut self, carrier: u16) -> Self {
        self.carrier = carrier;
        self
    }

    /// Sample rate used to place words within a period in host time
    pub fn set_sample_rate(&self, sample_rate: u32) {
        if sample_rate > 0 {
            self.sample_rate.store(sample_rate, Ordering::Relaxed);
        }
    }

    pub fn peripheral(&self) -> &Arc<RemotePeripheral> {
        &self.peripheral
    }

    pub fn stats(&self) -> DecoderStats {
        let c = &self.counters;
        DecoderStats {
            frames: c.frames.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            records: c.records.load(Ordering::Relaxed),
            queue_full: c.queue_full.load(Ordering::Relaxed),
            inactive: c.inactive.load(Ordering::Relaxed),
            clock_rejected: c.clock_rejected.load(Ordering::Relaxed),
        }
    }

    fn handle(&self, frame: &Frame, producer: &mut MeasurementProducer, host_time: f64) {
        bump(&self.counters.frames);
        match frame.kind {
            FrameKind::Capabilities => self.peripheral.apply_capabilities(frame.values[0]),
            FrameKind::Status => self.peripheral.apply_status(frame.values[0]),
            // Our own command frames echo back on a loopback cable
            FrameKind::Command => {}
            _ => self.record(frame, producer, host_time),
        }
    }

    fn record(&self, frame: &Frame, producer: &mut MeasurementProducer, host_time: f64) {
        let device = &*self.peripheral;
        let device_time = device.device_seconds(frame.ticks);
        device.sync_clock(device_time, host_time);

        match frame.kind.channel() {
            Some(channel) if device.is_active(channel) => {}
            _ => {
                bump(&self.counters.inactive);
                return;
            }
        }

        let [a, b, c, d] = frame.scaled();
        let v = Vector3::new(a, b, c);
        let motion = |m: DeviceMotion| DeviceMotion {
            timestamp: device_time,
            ..m
        };

        let built: Result<Measurement, ClockSyncError> = match frame.kind {
            FrameKind::Accelerometer => Measurement::from_accelerometer(
                &AccelerometerData {
                    timestamp: device_time,
                    acceleration: v,
                },
                device,
            ),
            FrameKind::Gyroscope => Measurement::from_gyro(
                &GyroData {
                    timestamp: device_time,
                    rotation_rate: v,
                },
                device,
            ),
            FrameKind::Magnetometer => Measurement::from_magnetometer(
                &MagnetometerData {
                    timestamp: device_time,
                    magnetic_field: v,
                },
                device,
            ),
            FrameKind::Attitude => Measurement::attitude_from_motion(
                &motion(DeviceMotion {
                    attitude: Quaternion::new(a, b, c, d),
                    ..Default::default()
                }),
                device,
            ),
            FrameKind::RotationRate => Measurement::rotation_rate_from_motion(
                &motion(DeviceMotion {
                    rotation_rate: v,
                    ..Default::default()
                }),
                device,
            ),
            FrameKind::Gravity => Measurement::gravity_from_motion(
                &motion(DeviceMotion {
                    gravity: v,
                    ..Default::default()
                }),
                device,
            ),
            FrameKind::UserAcceleration => Measurement::user_acceleration_from_motion(
                &motion(DeviceMotion {
                    user_acceleration: v,
                    ..Default::default()
                }),
                device,
            ),
            FrameKind::MagneticField => Measurement::magnetic_field_from_motion(
                &motion(DeviceMotion {
                    magnetic_field: v,
                    magnetic_accuracy: MagneticAccuracy::from_code(frame.aux),
                    ..Default::default()
                }),
                device,
            ),
            FrameKind::Capabilities | FrameKind::Status | FrameKind::Command => return,
        };

        match built {
            Ok(measurement) => {
                if producer.push(measurement) {
                    bump(&self.counters.records);
                } else {
                    bump(&self.counters.queue_full);
                }
            }
            Err(_) => bump(&self.counters.clock_rejected),
        }
    }
}

impl IoDelegate for SignalDecoder {
    fn io(
        &self,
        data: &mut AudioBufferList<'_>,
        _flags: &mut ActionFlags,
        time_stamp: &AudioTimeStamp,
        _bus_number: u32,
        _num_frames: u32,
    ) -> IoStatus {
        let channels = usize::from(data.channels.max(1));
        let carrier = usize::from(self.carrier);
        if data.samples_mut().is_some() || carrier >= channels {
            return status::INVALID_BUFFER;
        }

        let Ok(mut guard) = self.state.try_lock() else {
            return status::BUSY;
        };
        let state = &mut *guard;
        let rate = f64::from(self.sample_rate.load(Ordering::Relaxed));
        let mut result = status::NO_ERR;

        let words = data
            .samples()
            .iter()
            .skip(carrier)
            .step_by(channels)
            .map(|s| sample_to_word(*s));

        for (index, word) in words.enumerate() {
            if state.len == 0 && word != SYNC {
                continue;
            }
            state.pending[state.len] = word;
            state.len += 1;
            if state.len < FRAME_WORDS {
                continue;
            }

            match Frame::from_words(&state.pending) {
                Ok(frame) => {
                    state.len = 0;
                    let host_time = time_stamp.host_time + index as f64 / rate;
                    self.handle(&frame, &mut state.producer, host_time);
                }
                Err(_) => {
                    bump(&self.counters.decode_errors);
                    result = status::DECODE_ERROR;
                    state.resync();
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ClockBounds, ClockPolicy};
    use crate::io::ManualIo;
    use crate::peripheral::{Channel, PeripheralInfo, DEFAULT_TICK_HZ, REMOTE_KIND};
    use crate::queue::MeasurementQueue;
    use crate::signal::{word_to_sample, FRAME_WORDS};

    fn setup() -> (Arc<RemotePeripheral>, SignalDecoder, crate::queue::MeasurementConsumer) {
        let peripheral = Arc::new(RemotePeripheral::new("Ankle"));
        let queue = MeasurementQueue::new(64);
        let decoder =
            SignalDecoder::new(Arc::clone(&peripheral), queue.take_producer().unwrap());
        (peripheral, decoder, queue.take_consumer().unwrap())
    }

    fn samples(frames: &[Frame]) -> Vec<f32> {
        frames
            .iter()
            .flat_map(|f| f.to_words())
            .map(word_to_sample)
            .collect()
    }

    fn run(decoder: &SignalDecoder, input: &[f32]) -> IoStatus {
        let mut list = AudioBufferList::captured(1, input);
        let mut flags = ActionFlags::empty();
        let ts = AudioTimeStamp::new(0.0, 1_700_000_000.0);
        decoder.io(&mut list, &mut flags, &ts, 1, input.len() as u32)
    }

    fn streaming_accelerometer(peripheral: &RemotePeripheral, decoder: &SignalDecoder) {
        peripheral.connect().unwrap();
        let caps = Frame::new(FrameKind::Capabilities, 0, [0b1111, 0, 0, 0], 0);
        assert_eq!(run(decoder, &samples(&[caps])), status::NO_ERR);
        peripheral.set_enabled(Channel::Accelerometer, true).unwrap();
        let status_frame = Frame::new(FrameKind::Status, 0, [Channel::Accelerometer.mask(), 0, 0, 0], 0);
        assert_eq!(run(decoder, &samples(&[status_frame])), status::NO_ERR);
    }

    #[test]
    fn test_malformed_buffer_reports_error_and_records_nothing() {
        let (peripheral, decoder, mut consumer) = setup();
        streaming_accelerometer(&peripheral, &decoder);

        let mut words = Frame::sensor(FrameKind::Accelerometer, 100, [1.0, 0.0, 0.0, 0.0], 0)
            .to_words();
        words[5] ^= 0x00F0;
        let input: Vec<f32> = words.iter().map(|w| word_to_sample(*w)).collect();

        assert_eq!(run(&decoder, &input), status::DECODE_ERROR);
        assert!(consumer.pop().is_none());
        assert_eq!(decoder.stats().decode_errors, 1);
    }

    #[test]
    fn test_frames_split_across_periods() {
        let (peripheral, decoder, mut consumer) = setup();
        streaming_accelerometer(&peripheral, &decoder);

        let frame = Frame::sensor(FrameKind::Accelerometer, 1_000_000, [0.5, -1.0, 2.0, 0.0], 0);
        let input = samples(&[frame]);
        let (first, second) = input.split_at(4);
        assert_eq!(run(&decoder, first), status::NO_ERR);
        assert!(consumer.is_empty());
        assert_eq!(run(&decoder, second), status::NO_ERR);

        let m = consumer.pop().unwrap();
        assert!((m.x() - 0.5).abs() < 1e-3);
        assert!((m.y() + 1.0).abs() < 1e-3);
        assert!((m.z() - 2.0).abs() < 1e-3);
        assert_eq!(m.peripheral(), peripheral.uuid());
        assert!(!m.is_local());
    }

    #[test]
    fn test_inactive_channel_discarded() {
        let (peripheral, decoder, mut consumer) = setup();
        streaming_accelerometer(&peripheral, &decoder);

        let gyro = Frame::sensor(FrameKind::Gyroscope, 5, [1.0, 1.0, 1.0, 0.0], 0);
        assert_eq!(run(&decoder, &samples(&[gyro])), status::NO_ERR);
        assert!(consumer.pop().is_none());
        assert_eq!(decoder.stats().inactive, 1);
    }

    #[test]
    fn test_resyncs_after_garbage() {
        let (peripheral, decoder, mut consumer) = setup();
        streaming_accelerometer(&peripheral, &decoder);

        let good = Frame::sensor(FrameKind::Accelerometer, 7, [0.0, 0.0, 1.0, 0.0], 0);
        let mut input = vec![word_to_sample(SYNC), word_to_sample(3), 0.25, -0.25];
        input.extend(samples(&[good]));

        assert_eq!(run(&decoder, &input), status::DECODE_ERROR);
        assert_eq!(consumer.len(), 1);
        assert_eq!(decoder.stats().frames, 3);
    }

    #[test]
    fn test_first_sample_syncs_clock() {
        let (peripheral, decoder, mut consumer) = setup();
        streaming_accelerometer(&peripheral, &decoder);
        decoder.set_sample_rate(1_000);

        // 2 s and 3 s of device time at the default microsecond tick rate
        let first = Frame::sensor(FrameKind::Accelerometer, 2_000_000, [0.0; 4], 0);
        let second = Frame::sensor(FrameKind::Accelerometer, 3_000_000, [0.0; 4], 0);
        assert_eq!(run(&decoder, &samples(&[first, second])), status::NO_ERR);

        let sync_host = 1_700_000_000.0 + (FRAME_WORDS - 1) as f64 / 1_000.0;
        let a = consumer.pop().unwrap();
        let b = consumer.pop().unwrap();
        assert!((a.timestamp() - sync_host).abs() < 1e-6);
        assert!((b.timestamp() - (sync_host + 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_out_of_range_device_time_follows_policy() {
        for policy in [ClockPolicy::Drop, ClockPolicy::Flag] {
            let info = PeripheralInfo::new(REMOTE_KIND, "Hip")
                .with_clock_bounds(ClockBounds::new(10.0))
                .with_clock_policy(policy);
            let peripheral = Arc::new(RemotePeripheral::with_info(info, DEFAULT_TICK_HZ));
            let queue = MeasurementQueue::new(8);
            let decoder =
                SignalDecoder::new(Arc::clone(&peripheral), queue.take_producer().unwrap());
            let mut consumer = queue.take_consumer().unwrap();
            streaming_accelerometer(&peripheral, &decoder);

            // 2 s is inside the bounds, 20 s is past them
            let inside = Frame::sensor(FrameKind::Accelerometer, 2_000_000, [1.0, 0.0, 0.0, 0.0], 0);
            let outside = Frame::sensor(FrameKind::Accelerometer, 20_000_000, [2.0, 0.0, 0.0, 0.0], 0);
            assert_eq!(run(&decoder, &samples(&[inside, outside])), status::NO_ERR);

            let kept = consumer.pop().unwrap();
            assert!(!kept.clock_suspect());
            match policy {
                ClockPolicy::Drop => {
                    assert!(consumer.pop().is_none());
                    assert_eq!(decoder.stats().clock_rejected, 1);
                    assert_eq!(decoder.stats().records, 1);
                }
                ClockPolicy::Flag => {
                    let flagged = consumer.pop().unwrap();
                    assert!(flagged.clock_suspect());
                    assert!((flagged.x() - 2.0).abs() < 1e-3);
                    assert_eq!(decoder.stats().clock_rejected, 0);
                    assert_eq!(decoder.stats().records, 2);
                }
            }
        }
    }

    #[test]
    fn test_device_motion_frames() {
        let (peripheral, decoder, mut consumer) = setup();
        peripheral.connect().unwrap();
        peripheral.apply_capabilities(Channel::DeviceMotion.mask());
        peripheral.set_enabled(Channel::DeviceMotion, true).unwrap();
        peripheral.apply_status(Channel::DeviceMotion.mask());

        let frames = [
            Frame::sensor(FrameKind::Attitude, 1, [0.0, 0.0, 0.0, 1.0], 0),
            Frame::sensor(FrameKind::MagneticField, 2, [10.0, 20.0, 30.0, 0.0], 3),
        ];
        assert_eq!(run(&decoder, &samples(&frames)), status::NO_ERR);

        let attitude = consumer.pop().unwrap();
        assert_eq!(attitude.kind(), crate::measurement::MeasurementType::Attitude);
        assert_eq!(attitude.w(), 1.0);
        let field = consumer.pop().unwrap();
        assert_eq!(field.accuracy(), Some(MagneticAccuracy::High));
    }

    #[test]
    fn test_render_buffer_rejected() {
        let (_peripheral, decoder, _consumer) = setup();
        let mut out = [0.0f32; 16];
        let mut list = AudioBufferList::render(1, &mut out);
        let status = decoder.io(
            &mut list,
            &mut ActionFlags::empty(),
            &AudioTimeStamp::default(),
            0,
            16,
        );
        assert_eq!(status, status::INVALID_BUFFER);
    }

    #[test]
    fn test_registered_with_manual_io() {
        use crate::io::DelegatableIo;

        let (peripheral, decoder, _consumer) = setup();
        let decoder: Arc<dyn IoDelegate> = Arc::new(decoder);
        let mut io = ManualIo::new(1);
        io.set_input_delegate(Some(Arc::downgrade(&decoder)));
        io.start().unwrap();

        let caps = Frame::new(FrameKind::Capabilities, 0, [Channel::Gyroscope.mask(), 0, 0, 0], 0);
        let status = io
            .driver()
            .deliver_input(&samples(&[caps]), AudioTimeStamp::default());
        assert_eq!(status, status::NO_ERR);
        assert!(peripheral.is_available(Channel::Gyroscope));
        io.stop().unwrap();
    }
}
