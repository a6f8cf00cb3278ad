//! Lock-free measurement hand-off
//!
//! Records built on the audio thread have to reach the persistence side
//! without the audio thread ever waiting on it. This wraps a SPSC ring
//! buffer from the `ringbuf` crate:
//! - the audio thread (or a sensor callback) owns the producer
//! - the drain thread owns the consumer
//!
//! Pushing into a full queue drops the new record and counts the drop; the
//! producer never blocks and never allocates.

use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};

use crate::measurement::Measurement;

/// Counters shared by both halves of a queue
#[derive(Debug, Default)]
pub struct QueueCounters {
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl QueueCounters {
    /// Records accepted by the queue
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Records discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Producer half (owned by the real-time side)
pub struct MeasurementProducer {
    producer: ringbuf::HeapProd<Measurement>,
    counters: Arc<QueueCounters>,
}

impl MeasurementProducer {
    /// Push a record. Returns false if the queue was full and the record was dropped.
    #[inline]
    pub fn push(&mut self, measurement: Measurement) -> bool {
        match self.producer.try_push(measurement) {
            Ok(()) => {
                self.counters.pushed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn counters(&self) -> &QueueCounters {
        &self.counters
    }
}

/// Consumer half (owned by the drain thread)
pub struct MeasurementConsumer {
    consumer: ringbuf::HeapCons<Measurement>,
    counters: Arc<QueueCounters>,
}

impl MeasurementConsumer {
    pub fn pop(&mut self) -> Option<Measurement> {
        self.consumer.try_pop()
    }

    /// Hand every queued record to `f` in insertion order; returns how many
    pub fn drain_with(&mut self, mut f: impl FnMut(Measurement)) -> usize {
        let mut count = 0;
        while let Some(m) = self.consumer.try_pop() {
            f(m);
            count += 1;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.consumer.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }

    pub fn counters(&self) -> &QueueCounters {
        &self.counters
    }
}

/// A measurement queue whose halves are handed out once each
pub struct MeasurementQueue {
    producer: Mutex<Option<MeasurementProducer>>,
    consumer: Mutex<Option<MeasurementConsumer>>,
    counters: Arc<QueueCounters>,
    capacity: usize,
}

impl MeasurementQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let rb = HeapRb::<Measurement>::new(capacity);
        let (prod, cons) = rb.split();

        let counters = Arc::new(QueueCounters::default());

        let producer = MeasurementProducer {
            producer: prod,
            counters: Arc::clone(&counters),
        };

        let consumer = MeasurementConsumer {
            consumer: cons,
            counters: Arc::clone(&counters),
        };

        Self {
            producer: Mutex::new(Some(producer)),
            consumer: Mutex::new(Some(consumer)),
            counters,
            capacity,
        }
    }

    /// Take the producer handle (the real-time side calls this once)
    pub fn take_producer(&self) -> Option<MeasurementProducer> {
        self.producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Take the consumer handle (the drain side calls this once)
    pub fn take_consumer(&self) -> Option<MeasurementConsumer> {
        self.consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn counters(&self) -> Arc<QueueCounters> {
        Arc::clone(&self.counters)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{AccelerometerData, Vector3};
    use crate::peripheral::RemotePeripheral;

    fn sample(device: &RemotePeripheral, t: f64) -> Measurement {
        let data = AccelerometerData {
            timestamp: t,
            acceleration: Vector3::new(t, 0.0, 0.0),
        };
        Measurement::from_accelerometer(&data, device).unwrap()
    }

    #[test]
    fn test_producer_consumer() {
        let device = RemotePeripheral::new("test");
        let queue = MeasurementQueue::new(4);

        let mut producer = queue.take_producer().unwrap();
        let mut consumer = queue.take_consumer().unwrap();

        assert!(producer.push(sample(&device, 1.0)));
        assert!(producer.push(sample(&device, 2.0)));
        assert_eq!(consumer.len(), 2);

        let mut seen = Vec::new();
        assert_eq!(consumer.drain_with(|m| seen.push(m.x())), 2);
        assert_eq!(seen, vec![1.0, 2.0]);
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let device = RemotePeripheral::new("test");
        let queue = MeasurementQueue::new(2);
        let mut producer = queue.take_producer().unwrap();
        let mut consumer = queue.take_consumer().unwrap();

        assert!(producer.push(sample(&device, 1.0)));
        assert!(producer.push(sample(&device, 2.0)));
        assert!(!producer.push(sample(&device, 3.0)));

        assert_eq!(queue.counters().pushed(), 2);
        assert_eq!(queue.counters().dropped(), 1);
        assert_eq!(consumer.pop().map(|m| m.x()), Some(1.0));
        assert_eq!(consumer.pop().map(|m| m.x()), Some(2.0));
        assert!(consumer.pop().is_none());
    }

    #[test]
    fn test_halves_taken_once() {
        let queue = MeasurementQueue::new(8);
        assert!(queue.take_producer().is_some());
        assert!(queue.take_producer().is_none());
        assert!(queue.take_consumer().is_some());
        assert!(queue.take_consumer().is_none());
        assert_eq!(queue.capacity(), 8);
        assert_eq!(MeasurementQueue::new(0).capacity(), 1);
    }

    #[test]
    fn test_cross_thread_order_preserved() {
        let device = RemotePeripheral::new("test");
        let queue = MeasurementQueue::new(1024);
        let mut producer = queue.take_producer().unwrap();
        let mut consumer = queue.take_consumer().unwrap();
        let records: Vec<Measurement> = (0..500).map(|i| sample(&device, i as f64)).collect();

        let handle = std::thread::spawn(move || {
            for m in records {
                producer.push(m);
            }
        });
        handle.join().unwrap();

        let mut last = -1.0;
        consumer.drain_with(|m| {
            assert!(m.x() > last);
            last = m.x();
        });
        assert_eq!(last, 499.0);
    }
}
