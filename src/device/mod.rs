//! Capabilities the MAC borrows from the embedding firmware.
//!
//! The MAC never owns hardware. Every request and every call to
//! [`crate::mac::Mac::process`] receives the [`Device`], which hands out its radio, timer,
//! random number generator and non-volatile store. Completions travel the other way, through
//! [`crate::mac::Mac::on_radio_event`] and [`crate::mac::Mac::on_timer_event`].

pub mod non_volatile_store;
pub mod radio;
pub mod radio_buffer;
pub mod rng;
pub mod timer;

use self::non_volatile_store::NonVolatileStore;
use self::radio::Radio;
use self::rng::Rng;
use self::timer::Timer;
use crate::mac::types::DR;

/// A capability failed. Carries the error type of the failing capability.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Error<D>
where
    D: Device,
{
    Radio(<<D as Device>::Radio as Radio>::Error),
    Timer(<<D as Device>::Timer as Timer>::Error),
    Rng(<<D as Device>::Rng as Rng>::Error),
    NonVolatileStore(<<D as Device>::NonVolatileStore as NonVolatileStore>::Error),
    RadioBuffer(radio_buffer::Error),
}

impl<D> From<Error<D>> for crate::Error<D>
where
    D: Device,
{
    fn from(value: Error<D>) -> Self {
        Self::Device(value)
    }
}

/// The end-device hardware as seen by the MAC.
pub trait Device {
    #[allow(missing_docs)]
    type Radio: Radio;
    #[allow(missing_docs)]
    type Timer: Timer;
    #[allow(missing_docs)]
    type Rng: Rng;
    #[allow(missing_docs)]
    type NonVolatileStore: NonVolatileStore;

    #[allow(missing_docs)]
    fn radio(&mut self) -> &mut Self::Radio;
    #[allow(missing_docs)]
    fn timer(&mut self) -> &mut Self::Timer;
    #[allow(missing_docs)]
    fn rng(&mut self) -> &mut Self::Rng;
    /// Storage of the persistent context groups.
    fn non_volatile_store(&mut self) -> &mut Self::NonVolatileStore;

    /// Highest EIRP the board may radiate, in dBm. Caps the region limit.
    fn max_eirp() -> i8 {
        i8::MAX
    }
    /// Battery level reported in DevStatusAns: 0 external power, 1..=254 level, `None` unknown.
    fn battery_level(&self) -> Option<u8> {
        None
    }
    /// Lowest frequency the radio front end can use, in Hz.
    fn min_frequency() -> Option<u32> {
        None
    }
    /// Highest frequency the radio front end can use, in Hz.
    fn max_frequency() -> Option<u32> {
        None
    }
    /// Lowest datarate the board accepts.
    fn min_data_rate() -> Option<DR> {
        None
    }
    /// Highest datarate the board accepts.
    fn max_data_rate() -> Option<DR> {
        None
    }
}

/// Is `frequency` inside the range the device declares and accepted by its radio?
pub(crate) fn supports_frequency<D: Device>(device: &mut D, frequency: u32) -> bool {
    D::min_frequency().map_or(true, |min| frequency >= min)
        && D::max_frequency().map_or(true, |max| frequency <= max)
        && device.radio().check_rf_frequency(frequency)
}
