//! Radio transceiver capability consumed by the MAC.
//!
//! Every method configures or starts an operation and returns immediately. Completion is
//! reported back to the MAC by the caller through [`crate::mac::Mac::on_radio_event`].

pub mod types;
use core::fmt::Debug;
use types::*;

/// A half-duplex LoRa radio driver.
pub trait Radio {
    #[cfg(feature = "defmt")]
    /// Driver error.
    type Error: Debug + defmt::Format;

    #[cfg(not(feature = "defmt"))]
    /// Driver error.
    type Error: Debug;

    /// Select the public (0x34) or private (0x12) LoRa sync word.
    fn set_public_network(&mut self, enable: bool) -> Result<(), Self::Error>;

    /// Tune the radio to the given frequency in Hz.
    fn set_channel(&mut self, frequency: u32) -> Result<(), Self::Error>;

    /// Configure modulation and power for the next transmission.
    fn set_tx_config(&mut self, config: &TxConfig) -> Result<(), Self::Error>;

    /// Configure modulation and symbol timeout for the next reception.
    fn set_rx_config(&mut self, config: &RxConfig) -> Result<(), Self::Error>;

    /// Start transmitting the buffer. Completion is signalled with TxDone or TxTimeout.
    fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error>;

    /// Open the receiver for `timeout_ms`, 0 meaning continuous reception.
    fn rx(&mut self, timeout_ms: u32) -> Result<(), Self::Error>;

    /// Put the radio in standby.
    fn standby(&mut self) -> Result<(), Self::Error>;

    /// Put the radio in sleep mode.
    fn sleep(&mut self) -> Result<(), Self::Error>;

    /// Airtime in milliseconds of a frame of `len` bytes with the given modulation.
    fn time_on_air(&self, config: &RfConfig, preamble_len: u16, len: usize) -> u32;

    /// Is the frequency supported by the radio hardware?
    fn check_rf_frequency(&self, frequency: u32) -> bool;

    /// Current RSSI in dBm.
    fn rssi(&mut self) -> i16;

    /// Transmit an unmodulated carrier for `timeout_s` seconds.
    fn set_tx_continuous_wave(
        &mut self,
        frequency: u32,
        power: i8,
        timeout_s: u16,
    ) -> Result<(), Self::Error>;

    /// Time the radio needs to wake up before a reception, in milliseconds.
    fn wakeup_time_ms(&self) -> u32 {
        1
    }
}
