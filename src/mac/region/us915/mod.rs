//! Processing for the US915 region, which uses a fixed channel plan.

use super::channel_plan::Channel;
use super::{BeaconFormat, Error};
use crate::device::radio::types::{Bandwidth, Datarate, SpreadingFactor};
use crate::mac::types::DR;

const DOWNLINK_BASE: u32 = 923_300_000;
const DOWNLINK_STEP: u32 = 600_000;
const BEACON_PERIOD_S: u32 = 128;

const MAX_PAYLOAD: [u8; 14] = [11, 53, 125, 242, 242, 0, 0, 0, 53, 129, 242, 242, 242, 242];

fn downlink_channel(index: u32) -> u32 {
    DOWNLINK_BASE + DOWNLINK_STEP * (index % 8)
}

/// Specific processing for the US915 region.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct US915;

impl super::Region for US915 {
    fn max_channels() -> usize {
        72
    }
    fn default_channels() -> usize {
        72
    }
    fn default_channel(index: usize) -> Channel {
        // upstream: 64 (902.3 to 914.9 [+ by 0.2]) + 8 (903.0 to 914.2 [+ by 1.6])
        let mut channel = if index < 64 {
            Channel::new(902_300_000 + 200_000 * index as u32, DR::_0, DR::_3, 0)
        } else {
            Channel::new(903_000_000 + 1_600_000 * (index as u32 - 64), DR::_4, DR::_4, 0)
        };
        // downstream: 8 (923.3 to 927.5 [+ by 0.6])
        channel.rx1_frequency = Some(downlink_channel(index as u32));
        channel
    }
    fn min_frequency() -> u32 {
        902_000_000
    }
    fn max_frequency() -> u32 {
        928_000_000
    }
    fn bands() -> &'static [u16] {
        &[1]
    }
    fn verify_rx_frequency(frequency: u32) -> bool {
        (DOWNLINK_BASE..=downlink_channel(7)).contains(&frequency)
            && (frequency - DOWNLINK_BASE) % DOWNLINK_STEP == 0
    }
    fn max_tx_data_rate() -> DR {
        DR::_4
    }
    fn min_rx_data_rate() -> DR {
        DR::_8
    }
    fn max_rx_data_rate() -> DR {
        DR::_13
    }
    fn default_data_rate() -> DR {
        DR::_0
    }
    fn join_data_rate(attempt: u16) -> DR {
        // Alternate between a 125 kHz and a 500 kHz channel.
        if attempt % 2 == 0 {
            DR::_0
        } else {
            DR::_4
        }
    }
    fn max_payload(dr: DR) -> u8 {
        MAX_PAYLOAD.get(dr as usize).copied().unwrap_or(0)
    }
    fn default_rx2_frequency() -> u32 {
        DOWNLINK_BASE
    }
    fn default_rx2_data_rate() -> DR {
        DR::_8
    }
    fn max_rx1_data_rate_offset() -> u8 {
        3
    }

    fn get_rx1_dr(ul_dr: DR, rx1_dr_offset: u8) -> Result<DR, Error> {
        if rx1_dr_offset > 3 {
            return Err(Error::UnsupportedRx1DROffset(ul_dr, rx1_dr_offset));
        }
        let dl_dr_matrix = [
            [DR::_10, DR::_9, DR::_8, DR::_8],
            [DR::_11, DR::_10, DR::_9, DR::_8],
            [DR::_12, DR::_11, DR::_10, DR::_9],
            [DR::_13, DR::_12, DR::_11, DR::_10],
            [DR::_13, DR::_13, DR::_12, DR::_11],
        ];
        dl_dr_matrix
            .get(ul_dr as usize)
            .map(|row| row[rx1_dr_offset as usize])
            .ok_or(Error::UnsupportedRx1DROffset(ul_dr, rx1_dr_offset))
    }

    fn convert_data_rate(dr: DR) -> Result<Datarate, Error> {
        let (spreading_factor, bandwidth) = match dr {
            DR::_0 => (SpreadingFactor::_10, Bandwidth::_125KHz),
            DR::_1 => (SpreadingFactor::_9, Bandwidth::_125KHz),
            DR::_2 => (SpreadingFactor::_8, Bandwidth::_125KHz),
            DR::_3 => (SpreadingFactor::_7, Bandwidth::_125KHz),
            DR::_4 => (SpreadingFactor::_8, Bandwidth::_500KHz),
            DR::_8 => (SpreadingFactor::_12, Bandwidth::_500KHz),
            DR::_9 => (SpreadingFactor::_11, Bandwidth::_500KHz),
            DR::_10 => (SpreadingFactor::_10, Bandwidth::_500KHz),
            DR::_11 => (SpreadingFactor::_9, Bandwidth::_500KHz),
            DR::_12 => (SpreadingFactor::_8, Bandwidth::_500KHz),
            DR::_13 => (SpreadingFactor::_7, Bandwidth::_500KHz),
            _ => return Err(Error::DataRateNotSupported(dr)),
        };
        Ok(Datarate { spreading_factor, bandwidth })
    }

    fn max_eirp() -> i8 {
        30
    }
    fn max_tx_power_index() -> u8 {
        14
    }
    fn duty_cycle_enabled() -> bool {
        false
    }
    fn beacon_format() -> BeaconFormat {
        BeaconFormat { size: 23, rfu1_size: 5, rfu2_size: 3 }
    }
    fn beacon_data_rate() -> DR {
        DR::_8
    }
    fn beacon_frequency(beacon_time: u32) -> u32 {
        downlink_channel(beacon_time / BEACON_PERIOD_S)
    }
    fn ping_slot_frequency(dev_addr: u32, beacon_time: u32) -> u32 {
        downlink_channel(dev_addr.wrapping_add(beacon_time / BEACON_PERIOD_S))
    }
}
