//! Value types exchanged with the radio driver.

pub use lora_modulation::{Bandwidth, CodingRate, SpreadingFactor};

/// LoRa modulation parameters of a datarate index.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub struct Datarate {
    pub bandwidth: Bandwidth,
    pub spreading_factor: SpreadingFactor,
}

impl Datarate {
    /// Bandwidth in Hz.
    pub fn bandwidth_hz(&self) -> u32 {
        match self.bandwidth {
            Bandwidth::_125KHz => 125_000,
            Bandwidth::_250KHz => 250_000,
            _ => 500_000,
        }
    }

    /// Spreading factor as a number, 7 for SF7.
    pub fn spreading_factor_value(&self) -> u8 {
        match self.spreading_factor {
            SpreadingFactor::_7 => 7,
            SpreadingFactor::_8 => 8,
            SpreadingFactor::_9 => 9,
            SpreadingFactor::_10 => 10,
            SpreadingFactor::_11 => 11,
            SpreadingFactor::_12 => 12,
            _ => 6,
        }
    }

    /// Duration of one symbol in microseconds.
    pub fn symbol_time_us(&self) -> u32 {
        ((1u64 << self.spreading_factor_value()) * 1_000_000 / self.bandwidth_hz() as u64) as u32
    }
}

/// Frequency and modulation of a transmission or reception.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub struct RfConfig {
    pub frequency: u32,
    pub coding_rate: CodingRate,
    pub data_rate: Datarate,
}

/// Transmission parameters.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub struct TxConfig {
    /// Conducted output power in dBm.
    pub pw: i8,
    pub rf: RfConfig,
    pub preamble_len: u16,
    /// Upper bound after which the driver reports TxTimeout.
    pub timeout_ms: u32,
}

/// Reception parameters.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub struct RxConfig {
    pub rf: RfConfig,
    pub preamble_len: u16,
    /// Number of symbols after which a single reception gives up.
    pub symbol_timeout: u16,
    pub continuous: bool,
    pub max_payload: u8,
}

/// Signal quality of a received frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxQuality {
    rssi: i16,
    snr: i8,
}

impl RxQuality {
    /// Creation.
    pub fn new(rssi: i16, snr: i8) -> RxQuality {
        RxQuality { rssi, snr }
    }

    /// Received signal strength in dBm.
    pub fn rssi(self) -> i16 {
        self.rssi
    }
    /// Signal to noise ratio in dB.
    pub fn snr(self) -> i8 {
        self.snr
    }
}

/// Completion reported by the radio driver, normally from interrupt context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent<'a> {
    /// The frame handed to [`super::Radio::send`] left the antenna.
    TxDone,
    /// The transmission did not complete in time.
    TxTimeout,
    /// A frame was received.
    RxDone(&'a [u8], RxQuality),
    /// The reception window closed without preamble.
    RxTimeout,
    /// A frame was received with a CRC or header error.
    RxError,
}
