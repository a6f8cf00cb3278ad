//! Caller-driven I/O
//!
//! `ManualIo` has no hardware behind it: whoever holds a `ManualDriver`
//! plays the part of the real-time thread and delivers periods one at a
//! time. Useful for bridging a callback that some other library already
//! owns, and for exercising delegates deterministically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{
    ActionFlags, AudioTimeStamp, DelegatableIo, IoDispatch, IoError, IoStatus,
    STOP_TIMEOUT,
};

pub struct ManualIo {
    dispatch: Arc<IoDispatch>,
    running: AtomicBool,
    channels: u16,
}

impl ManualIo {
    pub fn new(channels: u16) -> Self {
        Self {
            dispatch: Arc::new(IoDispatch::new()),
            running: AtomicBool::new(false),
            channels: channels.max(1),
        }
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Handle for the thread that delivers periods
    pub fn driver(&self) -> ManualDriver {
        ManualDriver {
            dispatch: Arc::clone(&self.dispatch),
            channels: self.channels,
        }
    }
}

impl DelegatableIo for ManualIo {
    fn start(&mut self) -> Result<(), IoError> {
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        self.dispatch.gate().open();
        self.running.store(true, Ordering::Release);
        log::debug!("Manual I/O started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), IoError> {
        let drained = self.dispatch.shutdown(STOP_TIMEOUT);
        self.running.store(false, Ordering::Release);
        log::debug!("Manual I/O stopped");
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
}

/// Delivers periods to a `ManualIo`'s delegates
#[derive(Clone)]
pub struct ManualDriver {
    dispatch: Arc<IoDispatch>,
    channels: u16,
}

impl ManualDriver {
    /// Deliver one captured period. Returns the input delegate's status, or
    /// `NO_ERR` when stopped or no delegate is registered.
    pub fn deliver_input(&self, samples: &[f32], time_stamp: AudioTimeStamp) -> IoStatus {
        let mut flags = ActionFlags::empty();
        self.dispatch
            .dispatch_input(self.channels, samples, &mut flags, &time_stamp)
    }

    /// Pull one output period from the render delegate
    pub fn pull_render(
        &self,
        out: &mut [f32],
        time_stamp: AudioTimeStamp,
    ) -> (IoStatus, ActionFlags) {
        let mut flags = ActionFlags::empty();
        let status = self
            .dispatch
            .dispatch_render(self.channels, out, &mut flags, &time_stamp);
        (status, flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{AudioBufferList, IoDelegate};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Recording {
        calls: AtomicUsize,
        seen: Mutex<Vec<(Vec<f32>, AudioTimeStamp, u32, u32)>>,
    }

    impl IoDelegate for Recording {
        fn io(
            &self,
            data: &mut AudioBufferList<'_>,
            _flags: &mut ActionFlags,
            time_stamp: &AudioTimeStamp,
            bus_number: u32,
            num_frames: u32,
        ) -> IoStatus {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push((
                data.samples().to_vec(),
                *time_stamp,
                bus_number,
                num_frames,
            ));
            7
        }
    }

    #[test]
    fn test_registered_delegate_invoked_once_per_buffer() {
        let mut io = ManualIo::new(1);
        let recording = Arc::new(Recording::default());
        let as_delegate: Arc<dyn IoDelegate> = recording.clone();
        io.set_input_delegate(Some(Arc::downgrade(&as_delegate)));
        io.start().unwrap();

        let ts = AudioTimeStamp::new(512.0, 1_700_000_000.25);
        let status = io.driver().deliver_input(&[0.5, -0.5, 0.25], ts);

        assert_eq!(status, 7);
        assert_eq!(recording.calls.load(Ordering::SeqCst), 1);
        let seen = recording.seen.lock().unwrap();
        assert_eq!(seen[0].0, vec![0.5, -0.5, 0.25]);
        assert_eq!(seen[0].1, ts);
        assert_eq!(seen[0].2, crate::io::INPUT_BUS);
        assert_eq!(seen[0].3, 3);
    }

    #[test]
    fn test_no_callbacks_after_stop() {
        let mut io = ManualIo::new(2);
        let recording = Arc::new(Recording::default());
        let as_delegate: Arc<dyn IoDelegate> = recording.clone();
        io.set_input_delegate(Some(Arc::downgrade(&as_delegate)));
        io.start().unwrap();

        let driver = io.driver();
        let feeder = thread::spawn(move || {
            for _ in 0..2_000 {
                driver.deliver_input(&[0.0; 64], AudioTimeStamp::default());
                thread::sleep(Duration::from_micros(20));
            }
        });
        thread::sleep(Duration::from_millis(5));

        io.stop().unwrap();
        assert!(!io.is_running());
        let after_stop = recording.calls.load(Ordering::SeqCst);
        feeder.join().unwrap();
        assert_eq!(recording.calls.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_start_is_idempotent_and_restartable() {
        let mut io = ManualIo::new(1);
        io.start().unwrap();
        io.start().unwrap();
        assert!(io.is_running());
        io.stop().unwrap();
        assert!(!io.is_running());
        io.start().unwrap();
        assert!(io.is_running());
    }

    #[test]
    fn test_delegates_are_not_owned() {
        let io = ManualIo::new(1);
        let recording: Arc<dyn IoDelegate> = Arc::new(Recording::default());
        io.set_render_delegate(Some(Arc::downgrade(&recording)));
        assert!(io.render_delegate().is_some());
        assert_eq!(Arc::strong_count(&recording), 1);

        drop(recording);
        assert!(io.render_delegate().is_none());
    }
}
