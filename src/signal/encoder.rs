//! Render delegate telling the device what to stream
//!
//! Every output period starts with one command frame on the carrier
//! channel: the channels the host wants (enabled and available) and the
//! update interval in milliseconds. The rest of the period is silence.

use std::sync::Arc;

use super::{write_frame, Frame};
use crate::io::{status, ActionFlags, AudioBufferList, AudioTimeStamp, IoDelegate, IoStatus};
use crate::peripheral::{MotionPeripheral, RemotePeripheral};

pub struct CommandEncoder {
    peripheral: Arc<RemotePeripheral>,
    carrier: u16,
}

impl CommandEncoder {
    pub fn new(peripheral: Arc<RemotePeripheral>) -> Self {
        Self {
            peripheral,
            carrier: 0,
        }
    }

    pub fn with_carrier(mut self, carrier: u16) -> Self {
        self.carrier = carrier;
        self
    }

    /// Command reflecting the peripheral's current settings
    pub fn command(&self, ticks: u64) -> Frame {
        let interval_ms = (self.peripheral.update_interval() * 1000.0)
            .round()
            .clamp(1.0, f64::from(u16::MAX)) as u16;
        Frame::command(ticks, self.peripheral.requested_mask(), interval_ms)
    }
}

impl IoDelegate for CommandEncoder {
    fn io(
        &self,
        data: &mut AudioBufferList<'_>,
        flags: &mut ActionFlags,
        time_stamp: &AudioTimeStamp,
        _bus_number: u32,
        _num_frames: u32,
    ) -> IoStatus {
        let channels = data.channels;
        let Some(out) = data.samples_mut() else {
            return status::INVALID_BUFFER;
        };
        out.fill(0.0);

        if !self.peripheral.is_connected() {
            flags.insert(ActionFlags::OUTPUT_IS_SILENCE);
            return status::NO_ERR;
        }

        let frame = self.command(time_stamp.sample_time as u64);
        if write_frame(&frame, out, channels, self.carrier) {
            flags.remove(ActionFlags::OUTPUT_IS_SILENCE);
            status::NO_ERR
        } else {
            flags.insert(ActionFlags::OUTPUT_IS_SILENCE);
            status::INVALID_BUFFER
        }
    }
}
