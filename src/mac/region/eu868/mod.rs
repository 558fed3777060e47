//! Processing for the EU868 region, which uses a dynamic channel plan.

use super::channel_plan::Channel;
use super::{BeaconFormat, Error};
use crate::device::radio::types::{Bandwidth, Datarate, SpreadingFactor};
use crate::mac::types::DR;

const JOIN_CHANNELS: [u32; 3] = [868_100_000, 868_300_000, 868_500_000];
const BEACON_FREQUENCY: u32 = 869_525_000;

/// Duty cycle divisors of the G, G1, G2, G3, G4 and G5 sub-bands.
const BANDS: [u16; 6] = [100, 100, 1000, 10, 100, 1000];

/// Frequency limits of each sub-band, in lookup order.
const BAND_RANGES: [(u32, u32, u8); 6] = [
    (863_000_000, 865_000_000, 2),
    (865_000_000, 868_000_000, 0),
    (868_000_000, 868_600_000, 1),
    (868_700_000, 869_200_000, 5),
    (869_400_000, 869_650_000, 3),
    (869_700_000, 870_000_000, 4),
];

const MAX_PAYLOAD: [u8; 8] = [51, 51, 51, 115, 242, 242, 242, 242];

/// Specific processing for the EU868 region.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EU868;

impl super::Region for EU868 {
    fn max_channels() -> usize {
        16
    }
    fn default_channels() -> usize {
        JOIN_CHANNELS.len()
    }
    fn default_channel(index: usize) -> Channel {
        let frequency = JOIN_CHANNELS[index % JOIN_CHANNELS.len()];
        Channel::new(frequency, DR::_0, DR::_5, 1)
    }
    fn min_frequency() -> u32 {
        863_000_000
    }
    fn max_frequency() -> u32 {
        870_000_000
    }
    fn bands() -> &'static [u16] {
        &BANDS
    }
    fn band_for_frequency(frequency: u32) -> Option<u8> {
        BAND_RANGES
            .iter()
            .find(|(low, high, _)| (*low..=*high).contains(&frequency))
            .map(|(_, _, band)| *band)
    }
    fn verify_rx_frequency(frequency: u32) -> bool {
        Self::band_for_frequency(frequency).is_some()
    }
    fn max_tx_data_rate() -> DR {
        DR::_6
    }
    fn max_rx_data_rate() -> DR {
        DR::_6
    }
    fn default_data_rate() -> DR {
        DR::_0
    }
    fn max_payload(dr: DR) -> u8 {
        MAX_PAYLOAD.get(dr as usize).copied().unwrap_or(0)
    }
    fn default_rx2_frequency() -> u32 {
        869_525_000
    }
    fn default_rx2_data_rate() -> DR {
        DR::_0
    }
    fn max_rx1_data_rate_offset() -> u8 {
        5
    }

    fn get_rx1_dr(ul_dr: DR, rx1_dr_offset: u8) -> Result<DR, Error> {
        if rx1_dr_offset > 5 {
            return Err(Error::UnsupportedRx1DROffset(ul_dr, rx1_dr_offset));
        }
        let dl_dr_matrix = [
            [DR::_0, DR::_0, DR::_0, DR::_0, DR::_0, DR::_0],
            [DR::_1, DR::_0, DR::_0, DR::_0, DR::_0, DR::_0],
            [DR::_2, DR::_1, DR::_0, DR::_0, DR::_0, DR::_0],
            [DR::_3, DR::_2, DR::_1, DR::_0, DR::_0, DR::_0],
            [DR::_4, DR::_3, DR::_2, DR::_1, DR::_0, DR::_0],
            [DR::_5, DR::_4, DR::_3, DR::_2, DR::_1, DR::_0],
            [DR::_6, DR::_5, DR::_4, DR::_3, DR::_2, DR::_1],
        ];
        dl_dr_matrix
            .get(ul_dr as usize)
            .map(|row| row[rx1_dr_offset as usize])
            .ok_or(Error::UnsupportedRx1DROffset(ul_dr, rx1_dr_offset))
    }

    fn convert_data_rate(dr: DR) -> Result<Datarate, Error> {
        let (spreading_factor, bandwidth) = match dr {
            DR::_0 => (SpreadingFactor::_12, Bandwidth::_125KHz),
            DR::_1 => (SpreadingFactor::_11, Bandwidth::_125KHz),
            DR::_2 => (SpreadingFactor::_10, Bandwidth::_125KHz),
            DR::_3 => (SpreadingFactor::_9, Bandwidth::_125KHz),
            DR::_4 => (SpreadingFactor::_8, Bandwidth::_125KHz),
            DR::_5 => (SpreadingFactor::_7, Bandwidth::_125KHz),
            DR::_6 => (SpreadingFactor::_7, Bandwidth::_250KHz),
            _ => return Err(Error::DataRateNotSupported(dr)),
        };
        Ok(Datarate { spreading_factor, bandwidth })
    }

    fn max_eirp() -> i8 {
        16
    }
    fn max_tx_power_index() -> u8 {
        7
    }
    fn duty_cycle_enabled() -> bool {
        true
    }
    fn beacon_format() -> BeaconFormat {
        BeaconFormat { size: 17, rfu1_size: 2, rfu2_size: 0 }
    }
    fn beacon_data_rate() -> DR {
        DR::_3
    }
    fn beacon_frequency(_beacon_time: u32) -> u32 {
        BEACON_FREQUENCY
    }
    fn ping_slot_frequency(_dev_addr: u32, _beacon_time: u32) -> u32 {
        BEACON_FREQUENCY
    }
}
