//! Persistence hand-off
//!
//! A `MeasurementSink` is whatever stores records: a database writer, a
//! network uploader, or the JSON-lines file writer below. The `Drain`
//! thread moves records from the lock-free queues into a sink so that
//! neither the real-time thread nor the sink ever waits on the other.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::measurement::Measurement;
use crate::queue::MeasurementConsumer;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize measurement: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Drain thread panicked")]
    Panicked,
}

/// Receives records on the drain thread
pub trait MeasurementSink: Send {
    fn accept(&mut self, measurement: &Measurement) -> Result<(), SinkError>;

    /// Called after each batch and once more on shutdown
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl MeasurementSink for Vec<Measurement> {
    fn accept(&mut self, measurement: &Measurement) -> Result<(), SinkError> {
        self.push(*measurement);
        Ok(())
    }
}

/// One JSON object per line
pub struct JsonLinesSink<W: Write> {
    writer: BufWriter<W>,
    records: u64,
    bytes_written: u64,
}

impl JsonLinesSink<File> {
    /// Append to `path`, creating it and its parent directories as needed
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        log::info!("Writing measurements to {:?}", path);
        Ok(Self::new(file))
    }
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            records: 0,
            bytes_written: 0,
        }
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flush and hand back the underlying writer
    pub fn into_inner(self) -> Result<W, SinkError> {
        self.writer
            .into_inner()
            .map_err(|e| SinkError::Io(e.into_error()))
    }
}

impl<W: Write + Send> MeasurementSink for JsonLinesSink<W> {
    fn accept(&mut self, measurement: &Measurement) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(measurement)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        self.records += 1;
        self.bytes_written += line.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Totals of a finished drain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Records handed to the sink
    pub records: u64,
    /// Records the queues dropped because they were full
    pub dropped: u64,
}

/// Background thread feeding a sink from measurement queues
pub struct Drain {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<Result<DrainReport, SinkError>>>,
}

impl Drain {
    pub fn spawn<S>(consumers: Vec<MeasurementConsumer>, sink: S, poll: Duration) -> Self
    where
        S: MeasurementSink + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || run(consumers, sink, poll, &flag));
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop after a final pass over the queues
    pub fn stop(mut self) -> Result<DrainReport, SinkError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<DrainReport, SinkError> {
        self.stop.store(true, Ordering::Release);
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| SinkError::Panicked)?,
            None => Ok(DrainReport::default()),
        }
    }
}

impl Drop for Drain {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.finish() {
                log::error!("Drain failed: {}", e);
            }
        }
    }
}

fn drain_once<S: MeasurementSink>(
    consumers: &mut [MeasurementConsumer],
    sink: &mut S,
) -> Result<u64, SinkError> {
    let mut count = 0;
    for consumer in consumers.iter_mut() {
        while let Some(measurement) = consumer.pop() {
            sink.accept(&measurement)?;
            count += 1;
        }
    }
    if count > 0 {
        sink.flush()?;
    }
    Ok(count)
}

fn run<S: MeasurementSink>(
    mut consumers: Vec<MeasurementConsumer>,
    mut sink: S,
    poll: Duration,
    stop: &AtomicBool,
) -> Result<DrainReport, SinkError> {
    let mut records = 0;

    while !stop.load(Ordering::Acquire) {
        let batch = drain_once(&mut consumers, &mut sink)?;
        if batch > 0 {
            records += batch;
            for (i, consumer) in consumers.iter().enumerate() {
                let counters = consumer.counters();
                log::debug!(
                    "Queue {}: {} pushed, {} dropped, {} drained",
                    i,
                    counters.pushed(),
                    counters.dropped(),
                    records
                );
            }
        }
        thread::sleep(poll);
    }

    records += drain_once(&mut consumers, &mut sink)?;
    sink.flush()?;

    let dropped = consumers.iter().map(|c| c.counters().dropped()).sum();
    Ok(DrainReport { records, dropped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{AccelerometerData, Vector3};
    use crate::peripheral::RemotePeripheral;
    use crate::queue::MeasurementQueue;
    use std::io::{BufRead, BufReader};
    use std::sync::Mutex;

    fn sample(device: &RemotePeripheral, x: f64) -> Measurement {
        let data = AccelerometerData {
            timestamp: 1.0,
            acceleration: Vector3::new(x, 0.0, 0.0),
        };
        Measurement::from_accelerometer(&data, device).unwrap()
    }

    #[test]
    fn test_json_lines_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.jsonl");
        let device = RemotePeripheral::new("Head");

        let mut sink = JsonLinesSink::create(&path).unwrap();
        sink.accept(&sample(&device, 1.0)).unwrap();
        sink.accept(&sample(&device, 2.0)).unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.records(), 2);
        assert!(sink.bytes_written() > 0);

        let lines: Vec<String> = BufReader::new(File::open(&path).unwrap())
            .lines()
            .map(|l| l.unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        let first: Measurement = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first, sample(&device, 1.0));
        let value: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(value["type"], "accelerometer");
        assert_eq!(value["x"], 2.0);
    }

    #[test]
    fn test_create_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let device = RemotePeripheral::new("Head");

        for _ in 0..2 {
            let mut sink = JsonLinesSink::create(&path).unwrap();
            sink.accept(&sample(&device, 1.0)).unwrap();
            sink.flush().unwrap();
        }
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    /// Shares its records with the test through a mutex
    struct Shared(Arc<Mutex<Vec<Measurement>>>);

    impl MeasurementSink for Shared {
        fn accept(&mut self, measurement: &Measurement) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(*measurement);
            Ok(())
        }
    }

    #[test]
    fn test_drain_moves_everything_before_stop_returns() {
        let device = RemotePeripheral::new("Hip");
        let first = MeasurementQueue::new(16);
        let second = MeasurementQueue::new(2);
        let mut p1 = first.take_producer().unwrap();
        let mut p2 = second.take_producer().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let drain = Drain::spawn(
            vec![first.take_consumer().unwrap(), second.take_consumer().unwrap()],
            Shared(Arc::clone(&seen)),
            Duration::from_millis(1),
        );

        for i in 0..10 {
            p1.push(sample(&device, i as f64));
        }
        for i in 0..3 {
            p2.push(sample(&device, 100.0 + i as f64));
        }

        let report = drain.stop().unwrap();
        assert_eq!(report.dropped, second.counters().dropped());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len() as u64, report.records);
        assert_eq!(seen.iter().filter(|m| m.x() < 100.0).count(), 10);
    }

    struct Failing;

    impl MeasurementSink for Failing {
        fn accept(&mut self, _measurement: &Measurement) -> Result<(), SinkError> {
            Err(SinkError::Io(std::io::Error::other("disk full")))
        }
    }

    #[test]
    fn test_sink_error_surfaces_on_stop() {
        let device = RemotePeripheral::new("Arm");
        let queue = MeasurementQueue::new(4);
        let mut producer = queue.take_producer().unwrap();
        producer.push(sample(&device, 1.0));

        let drain = Drain::spawn(
            vec![queue.take_consumer().unwrap()],
            Failing,
            Duration::from_millis(1),
        );
        assert!(matches!(drain.stop(), Err(SinkError::Io(_))));
    }
}
