//! Delegate slots and callback dispatch shared by every I/O backend
//!
//! The real-time side only ever calls `try_lock` on a slot: if the control
//! thread happens to be swapping the delegate, that one period is skipped
//! with `status::BUSY` instead of waiting. Slots hold `Weak` references,
//! so a delegate that has been dropped reads as an empty slot.
//!
//! The real-time side keeps the upgraded delegate as a lease between
//! periods. When the owner drops its handle the lease is parked, never
//! dropped, and the control thread releases it on the next `set` or on
//! stop. The delegate's destructor therefore never runs on the audio
//! thread. Control-thread getters read their own copy of the registration
//! and never contend with the real-time lock.
//!
//! The `CallbackGate` counts callbacks in flight. Closing it and draining
//! is how `stop` guarantees that no delegate runs after it returns.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use super::{
    status, ActionFlags, AudioBufferList, AudioTimeStamp, IoDelegate, IoStatus, INPUT_BUS,
    OUTPUT_BUS,
};

/// What the real-time side owns, behind its `try_lock`
#[derive(Default)]
struct SlotState {
    delegate: Option<Weak<dyn IoDelegate>>,
    /// Strong reference held across periods
    lease: Option<Arc<dyn IoDelegate>>,
    /// Lease whose owner went away, waiting for the control thread
    retired: Option<Arc<dyn IoDelegate>>,
}

impl SlotState {
    /// The delegate to call this period, if its owner still holds it
    fn current(&mut self, held: &AtomicUsize) -> Option<&Arc<dyn IoDelegate>> {
        if self.lease.is_none() {
            self.lease = self.delegate.as_ref().and_then(Weak::upgrade);
        }
        let orphaned = self
            .lease
            .as_ref()
            .is_some_and(|lease| Arc::strong_count(lease) == 1);
        if orphaned {
            // `retired` is only filled after `delegate` is cleared, so it
            // is empty here
            self.retired = self.lease.take();
            self.delegate = None;
        }
        held.store(self.held(), Ordering::Release);
        self.lease.as_ref()
    }

    fn held(&self) -> usize {
        usize::from(self.lease.is_some()) + usize::from(self.retired.is_some())
    }

    fn release(&mut self, held: &AtomicUsize) -> [Option<Arc<dyn IoDelegate>>; 2] {
        held.store(0, Ordering::Release);
        [self.lease.take(), self.retired.take()]
    }
}

/// Non-owning reference to a registered delegate
#[derive(Default)]
pub struct DelegateSlot {
    rt: Mutex<SlotState>,
    /// Registration as seen by the control thread
    registered: Mutex<Option<Weak<dyn IoDelegate>>>,
    /// Strong references the real-time side holds
    held: AtomicUsize,
}

impl DelegateSlot {
    /// Register (or with `None`, clear) the delegate. Control thread only;
    /// waits for a callback in progress on this slot.
    pub fn set(&self, delegate: Option<Weak<dyn IoDelegate>>) {
        *self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delegate.clone();
        let released = {
            let mut state = self.rt.lock().unwrap_or_else(PoisonError::into_inner);
            state.delegate = delegate;
            state.release(&self.held)
        };
        drop(released);
    }

    /// The registered delegate, if its owner still holds it
    pub fn get(&self) -> Option<Arc<dyn IoDelegate>> {
        let delegate = self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)?;
        // Alive only if someone besides us and the real-time side holds it
        let ours = 1 + self.held.load(Ordering::Acquire);
        (Arc::strong_count(&delegate) > ours).then_some(delegate)
    }

    pub fn is_empty(&self) -> bool {
        self.get().is_none()
    }

    /// Drop the real-time side's references on the calling thread. Skipped
    /// if a callback still holds the slot.
    pub fn release(&self) {
        let released = match self.rt.try_lock() {
            Ok(mut state) => state.release(&self.held),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().release(&self.held),
            Err(TryLockError::WouldBlock) => return,
        };
        drop(released);
    }

    fn try_enter(&self) -> Option<MutexGuard<'_, SlotState>> {
        match self.rt.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

/// Tracks delegate callbacks in flight
#[derive(Debug, Default)]
pub struct CallbackGate {
    open: AtomicBool,
    in_flight: AtomicUsize,
}

/// Held for the duration of one callback
pub struct GateGuard<'a> {
    gate: &'a CallbackGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::Release);
    }
}

impl CallbackGate {
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Enter a callback; `None` once the gate is closed
    pub fn enter(&self) -> Option<GateGuard<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.open.load(Ordering::SeqCst) {
            Some(GateGuard { gate: self })
        } else {
            self.in_flight.fetch_sub(1, Ordering::Release);
            None
        }
    }

    /// Close the gate and wait until no callback is in flight.
    /// Returns false if one was still running after `timeout`.
    pub fn close_and_drain(&self, timeout: Duration) -> bool {
        self.open.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_micros(100));
        }
        true
    }
}

/// Delegate registration and per-period dispatch
#[derive(Default)]
pub struct IoDispatch {
    input: DelegateSlot,
    render: DelegateSlot,
    gate: CallbackGate,
    last_input_status: AtomicI32,
    last_render_status: AtomicI32,
    input_periods: AtomicU64,
    render_periods: AtomicU64,
}

fn frames_in(len: usize, channels: u16) -> u32 {
    (len / usize::from(channels.max(1))) as u32
}

fn silence(out: &mut [f32], flags: &mut ActionFlags) {
    out.fill(0.0);
    flags.insert(ActionFlags::OUTPUT_IS_SILENCE);
}

impl IoDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(&self) -> &DelegateSlot {
        &self.input
    }

    pub fn render(&self) -> &DelegateSlot {
        &self.render
    }

    pub fn gate(&self) -> &CallbackGate {
        &self.gate
    }

    /// Close the gate, wait for callbacks in flight, then release the
    /// real-time side's delegate references on the calling thread.
    /// Returns false if a callback was still running after `timeout`.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let drained = self.gate.close_and_drain(timeout);
        self.input.release();
        self.render.release();
        drained
    }

    pub fn last_input_status(&self) -> IoStatus {
        self.last_input_status.load(Ordering::Relaxed)
    }

    pub fn last_render_status(&self) -> IoStatus {
        self.last_render_status.load(Ordering::Relaxed)
    }

    /// Periods delivered to an input delegate
    pub fn input_periods(&self) -> u64 {
        self.input_periods.load(Ordering::Relaxed)
    }

    pub fn render_periods(&self) -> u64 {
        self.render_periods.load(Ordering::Relaxed)
    }

    /// Hand one captured period to the input delegate. Returns the
    /// delegate's status unmodified.
    pub fn dispatch_input(
        &self,
        channels: u16,
        samples: &[f32],
        flags: &mut ActionFlags,
        time_stamp: &AudioTimeStamp,
    ) -> IoStatus {
        let Some(_entered) = self.gate.enter() else {
            return status::NO_ERR;
        };
        let frames = frames_in(samples.len(), channels);
        let status = match self.input.try_enter() {
            None => status::BUSY,
            Some(mut state) => match state.current(&self.input.held) {
                None => status::NO_ERR,
                Some(delegate) => {
                    self.input_periods.fetch_add(1, Ordering::Relaxed);
                    let mut list = AudioBufferList::captured(channels, samples);
                    delegate.io(&mut list, flags, time_stamp, INPUT_BUS, frames)
                }
            },
        };
        self.last_input_status.store(status, Ordering::Relaxed);
        status
    }

    /// Ask the render delegate to fill one output period. Without a
    /// delegate, or when it reports an error, the period is silence.
    pub fn dispatch_render(
        &self,
        channels: u16,
        out: &mut [f32],
        flags: &mut ActionFlags,
        time_stamp: &AudioTimeStamp,
    ) -> IoStatus {
        let Some(_entered) = self.gate.enter() else {
            silence(out, flags);
            return status::NO_ERR;
        };
        let frames = frames_in(out.len(), channels);
        let (rendered, status) = match self.render.try_enter() {
            None => (false, status::BUSY),
            Some(mut state) => match state.current(&self.render.held) {
                None => (false, status::NO_ERR),
                Some(delegate) => {
                    self.render_periods.fetch_add(1, Ordering::Relaxed);
                    let mut list = AudioBufferList::render(channels, &mut *out);
                    (true, delegate.io(&mut list, flags, time_stamp, OUTPUT_BUS, frames))
                }
            },
        };
        if !rendered || status != status::NO_ERR {
            silence(out, flags);
        }
        self.last_render_status.store(status, Ordering::Relaxed);
        status
    }
}
