//! motion-capture - headless capture runner
//!
//! Listens for an audio-attached sensor peripheral on the default (or
//! configured) sound card, or replays a recorded capture file, and writes
//! every decoded measurement as a JSON line.
//!
//! Usage: `motion-capture [REPLAY_FILE]`

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use motion_capture::io::{DeviceIo, ReplayIo};
use motion_capture::{
    CommandEncoder, DelegatableIo, Drain, IoDelegate, JsonLinesSink, MeasurementQueue,
    MotionPeripheral, Settings, SignalDecoder,
};

/// How often the control loop checks on the peripheral
const CONTROL_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    log::info!("Starting motion-capture");

    let mut settings = Settings::load();
    let replay = std::env::args_os().nth(1).map(PathBuf::from);

    let peripheral = Arc::new(settings.build_peripheral());
    let queue = MeasurementQueue::new(settings.queue_capacity);
    log::info!("Measurement queue holds {} records", queue.capacity());
    let producer = queue.take_producer().ok_or("measurement producer already taken")?;
    let consumer = queue.take_consumer().ok_or("measurement consumer already taken")?;

    let decoder = Arc::new(
        SignalDecoder::new(Arc::clone(&peripheral), producer)
            .with_carrier(settings.carrier_channel),
    );
    let encoder = Arc::new(
        CommandEncoder::new(Arc::clone(&peripheral)).with_carrier(settings.carrier_channel),
    );

    let sink = JsonLinesSink::create(settings.resolved_output_path())?;
    let drain = Drain::spawn(vec![consumer], sink, settings.drain_poll());

    let mut io: Box<dyn DelegatableIo> = match &replay {
        Some(path) => Box::new(ReplayIo::new(settings.replay_config(path))),
        None => Box::new(DeviceIo::new(settings.device_config())),
    };
    let input: Arc<dyn IoDelegate> = decoder.clone();
    let render: Arc<dyn IoDelegate> = encoder.clone();
    io.set_input_delegate(Some(Arc::downgrade(&input)));
    if replay.is_none() && settings.render_commands {
        io.set_render_delegate(Some(Arc::downgrade(&render)));
    }

    io.start()?;
    decoder.set_sample_rate(io.sample_rate());

    if peripheral.autoconnect() {
        peripheral.connect()?;
    }

    let deadline = Instant::now() + settings.capture_duration();
    let mut active_mask = 0;
    while Instant::now() < deadline && io.is_running() {
        if settings.apply_enabled_channels(&*peripheral) > 0 {
            log::info!("Requested channels: {:#06b}", peripheral.requested_mask());
        }
        let now_active = peripheral.info().channels().active_mask();
        if now_active != active_mask {
            log::info!("Streaming channels: {:#06b}", now_active);
            active_mask = now_active;
        }
        thread::sleep(CONTROL_INTERVAL);
    }

    if let Err(e) = io.stop() {
        log::error!("Error stopping audio I/O: {}", e);
    }
    peripheral.disconnect();

    let report = drain.stop()?;
    let stats = decoder.stats();
    log::info!(
        "Captured {} measurements ({} dropped, {} frames, {} decode errors, {} clock rejected)",
        report.records,
        report.dropped,
        stats.frames,
        stats.decode_errors,
        stats.clock_rejected
    );

    settings.update_from(&*peripheral);
    settings.save();
    Ok(())
}
