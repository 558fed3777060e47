//! Single-shot millisecond timers provided by calling code.

use core::fmt::Debug;

/// Identifies which MAC timer fired or must be armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum TimerId {
    TxDelayed,
    Rx1,
    Rx2,
    AckTimeout,
    RadioWatchdog,
    Beacon,
    PingSlot,
}

impl TimerId {
    /// All timers, in a fixed order usable as an index.
    pub const ALL: [TimerId; 7] = [
        TimerId::TxDelayed,
        TimerId::Rx1,
        TimerId::Rx2,
        TimerId::AckTimeout,
        TimerId::RadioWatchdog,
        TimerId::Beacon,
        TimerId::PingSlot,
    ];

    pub(crate) fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Clock and single-shot timers. Expiry is reported to the MAC through
/// [`crate::mac::Mac::on_timer_event`].
pub trait Timer {
    #[cfg(feature = "defmt")]
    /// Timer error.
    type Error: Debug + defmt::Format;

    #[cfg(not(feature = "defmt"))]
    /// Timer error.
    type Error: Debug;

    /// Monotonic time in milliseconds.
    fn now(&self) -> u64;

    /// Arm (or re-arm) the timer to fire once after `duration_ms`.
    fn start(&mut self, id: TimerId, duration_ms: u32) -> Result<(), Self::Error>;

    /// Disarm the timer. Stopping an idle timer is not an error.
    fn stop(&mut self, id: TimerId) -> Result<(), Self::Error>;

    /// Is the timer armed?
    fn is_started(&self, id: TimerId) -> bool;

    /// Milliseconds elapsed since `since`.
    fn elapsed(&self, since: u64) -> u64 {
        self.now().saturating_sub(since)
    }
}
