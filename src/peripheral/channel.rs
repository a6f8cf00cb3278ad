//! Per-channel sensor state
//!
//! Each channel keeps three flags in one atomic byte:
//! - available: the hardware can produce this signal
//! - enabled: the user wants it
//! - active: it is streaming right now
//!
//! `active` is only ever set through `confirm_active`, which refuses unless
//! the channel is both available and enabled, and clearing either of those
//! clears `active` in the same atomic update. Both the control thread and
//! the audio thread touch these flags, so nothing here locks.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

const AVAILABLE: u8 = 0b001;
const ENABLED: u8 = 0b010;
const ACTIVE: u8 = 0b100;

/// One sensor signal of a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Accelerometer,
    Gyroscope,
    Magnetometer,
    DeviceMotion,
}

impl Channel {
    pub const ALL: &[Channel] = &[
        Self::Accelerometer,
        Self::Gyroscope,
        Self::Magnetometer,
        Self::DeviceMotion,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Accelerometer => "accelerometer",
            Self::Gyroscope => "gyroscope",
            Self::Magnetometer => "magnetometer",
            Self::DeviceMotion => "device motion",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::Accelerometer => 0,
            Self::Gyroscope => 1,
            Self::Magnetometer => 2,
            Self::DeviceMotion => 3,
        }
    }

    /// Bit for this channel in a wire channel mask
    pub fn mask(&self) -> u16 {
        1 << self.index()
    }

    /// Combined mask of `channels`
    pub fn mask_of(channels: &[Channel]) -> u16 {
        channels.iter().fold(0, |mask, ch| mask | ch.mask())
    }

    pub fn in_mask(mask: u16) -> impl Iterator<Item = Channel> {
        Self::ALL.iter().copied().filter(move |ch| mask & ch.mask() != 0)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot of one channel's flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelState {
    pub available: bool,
    pub enabled: bool,
    pub active: bool,
}

impl ChannelState {
    fn from_bits(bits: u8) -> Self {
        Self {
            available: bits & AVAILABLE != 0,
            enabled: bits & ENABLED != 0,
            active: bits & ACTIVE != 0,
        }
    }
}

/// Lock-free flag set for all channels of one peripheral
#[derive(Debug, Default)]
pub struct ChannelFlags {
    bits: [AtomicU8; 4],
}

impl ChannelFlags {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, channel: Channel) -> &AtomicU8 {
        &self.bits[channel.index()]
    }

    fn update(&self, channel: Channel, f: impl Fn(u8) -> Option<u8>) -> bool {
        self.slot(channel)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, f)
            .is_ok()
    }

    pub fn state(&self, channel: Channel) -> ChannelState {
        ChannelState::from_bits(self.slot(channel).load(Ordering::Acquire))
    }

    pub fn set_available(&self, channel: Channel, available: bool) {
        self.update(channel, |bits| {
            Some(if available {
                bits | AVAILABLE
            } else {
                bits & !(AVAILABLE | ACTIVE)
            })
        });
    }

    pub fn set_enabled(&self, channel: Channel, enabled: bool) {
        self.update(channel, |bits| {
            Some(if enabled {
                bits | ENABLED
            } else {
                bits & !(ENABLED | ACTIVE)
            })
        });
    }

    /// Mark `channel` active after the hardware confirmed it is streaming.
    ///
    /// Returns false (and changes nothing) unless the channel is available
    /// and enabled.
    pub fn confirm_active(&self, channel: Channel) -> bool {
        self.update(channel, |bits| {
            if bits & (AVAILABLE | ENABLED) == AVAILABLE | ENABLED {
                Some(bits | ACTIVE)
            } else {
                None
            }
        })
    }

    pub fn set_inactive(&self, channel: Channel) {
        self.update(channel, |bits| Some(bits & !ACTIVE));
    }

    pub fn deactivate_all(&self) {
        for channel in Channel::ALL {
            self.set_inactive(*channel);
        }
    }

    /// Replace availability from a capability mask
    pub fn apply_available_mask(&self, mask: u16) {
        for channel in Channel::ALL {
            self.set_available(*channel, mask & channel.mask() != 0);
        }
    }

    /// Replace activity from a status mask. Channels the mask reports as
    /// streaming but that are not available and enabled stay inactive.
    pub fn apply_active_mask(&self, mask: u16) {
        for channel in Channel::ALL {
            if mask & channel.mask() != 0 {
                self.confirm_active(*channel);
            } else {
                self.set_inactive(*channel);
            }
        }
    }

    fn mask_where(&self, flag: u8) -> u16 {
        Channel::ALL
            .iter()
            .filter(|ch| self.slot(**ch).load(Ordering::Acquire) & flag != 0)
            .fold(0, |mask, ch| mask | ch.mask())
    }

    pub fn available_mask(&self) -> u16 {
        self.mask_where(AVAILABLE)
    }

    pub fn enabled_mask(&self) -> u16 {
        self.mask_where(ENABLED)
    }

    pub fn active_mask(&self) -> u16 {
        self.mask_where(ACTIVE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariant(flags: &ChannelFlags) {
        for ch in Channel::ALL {
            let s = flags.state(*ch);
            if s.active {
                assert!(s.available && s.enabled, "{} active without available+enabled", ch);
            }
        }
    }

    #[test]
    fn test_active_requires_available_and_enabled() {
        let flags = ChannelFlags::new();
        let ch = Channel::Accelerometer;

        assert!(!flags.confirm_active(ch));
        flags.set_available(ch, true);
        assert!(!flags.confirm_active(ch));
        assert!(!flags.state(ch).active);

        flags.set_enabled(ch, true);
        assert!(flags.confirm_active(ch));
        assert_eq!(
            flags.state(ch),
            ChannelState {
                available: true,
                enabled: true,
                active: true
            }
        );
    }

    #[test]
    fn test_clearing_enabled_or_available_clears_active() {
        let flags = ChannelFlags::new();
        let ch = Channel::Gyroscope;
        flags.set_available(ch, true);
        flags.set_enabled(ch, true);
        flags.confirm_active(ch);

        flags.set_enabled(ch, false);
        assert!(!flags.state(ch).active);

        flags.set_enabled(ch, true);
        flags.confirm_active(ch);
        flags.set_available(ch, false);
        assert!(!flags.state(ch).active);
        assert!(flags.state(ch).enabled);
    }

    #[test]
    fn test_invariant_holds_over_all_operation_sequences() {
        // Every sequence of four operations from a fresh state.
        let ops: [fn(&ChannelFlags, Channel); 7] = [
            |f, c| f.set_available(c, true),
            |f, c| f.set_available(c, false),
            |f, c| f.set_enabled(c, true),
            |f, c| f.set_enabled(c, false),
            |f, c| {
                f.confirm_active(c);
            },
            |f, c| f.set_inactive(c),
            |f, _| f.deactivate_all(),
        ];
        for a in 0..ops.len() {
            for b in 0..ops.len() {
                for c in 0..ops.len() {
                    for d in 0..ops.len() {
                        let flags = ChannelFlags::new();
                        for op in [a, b, c, d] {
                            ops[op](&flags, Channel::Magnetometer);
                            assert_invariant(&flags);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_masks() {
        let flags = ChannelFlags::new();
        flags.apply_available_mask(Channel::mask_of(&[Channel::Accelerometer, Channel::DeviceMotion]));
        flags.set_enabled(Channel::Accelerometer, true);
        flags.set_enabled(Channel::Gyroscope, true);

        flags.apply_active_mask(0b1111);
        assert_eq!(flags.active_mask(), Channel::Accelerometer.mask());
        assert_eq!(flags.available_mask(), 0b1001);
        assert_eq!(flags.enabled_mask(), 0b0011);

        flags.apply_active_mask(0);
        assert_eq!(flags.active_mask(), 0);
        assert_invariant(&flags);
    }

    #[test]
    fn test_in_mask_iterates_channels() {
        let channels: Vec<Channel> = Channel::in_mask(0b0110).collect();
        assert_eq!(channels, vec![Channel::Gyroscope, Channel::Magnetometer]);
    }
}
