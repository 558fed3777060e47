//! Processing for the IN865 region, which uses a dynamic channel plan.

use super::channel_plan::Channel;
use super::{BeaconFormat, Error};
use crate::device::radio::types::{Bandwidth, Datarate, SpreadingFactor};
use crate::mac::types::DR;

const JOIN_CHANNELS: [u32; 3] = [865_062_500, 865_402_500, 865_985_000];
const RX2_FREQUENCY: u32 = 866_550_000;

const MAX_PAYLOAD: [u8; 8] = [51, 51, 51, 115, 242, 242, 242, 242];

/// RX1 offsets 6 and 7 raise the downlink datarate.
const EFFECTIVE_RX1_DR_OFFSET: [i8; 8] = [0, 1, 2, 3, 4, 5, -1, -2];

/// Specific processing for the IN865 region.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IN865;

impl super::Region for IN865 {
    fn max_channels() -> usize {
        16
    }
    fn default_channels() -> usize {
        JOIN_CHANNELS.len()
    }
    fn default_channel(index: usize) -> Channel {
        Channel::new(JOIN_CHANNELS[index % JOIN_CHANNELS.len()], DR::_0, DR::_5, 0)
    }
    fn min_frequency() -> u32 {
        865_000_000
    }
    fn max_frequency() -> u32 {
        867_000_000
    }
    fn bands() -> &'static [u16] {
        &[1]
    }
    fn max_tx_data_rate() -> DR {
        DR::_5
    }
    fn max_rx_data_rate() -> DR {
        DR::_5
    }
    fn default_data_rate() -> DR {
        DR::_0
    }
    fn max_payload(dr: DR) -> u8 {
        MAX_PAYLOAD.get(dr as usize).copied().unwrap_or(0)
    }
    fn default_rx2_frequency() -> u32 {
        RX2_FREQUENCY
    }
    fn default_rx2_data_rate() -> DR {
        DR::_2
    }
    fn max_rx1_data_rate_offset() -> u8 {
        7
    }

    fn get_rx1_dr(ul_dr: DR, rx1_dr_offset: u8) -> Result<DR, Error> {
        let offset = EFFECTIVE_RX1_DR_OFFSET
            .get(rx1_dr_offset as usize)
            .ok_or(Error::UnsupportedRx1DROffset(ul_dr, rx1_dr_offset))?;
        if ul_dr > Self::max_tx_data_rate() {
            return Err(Error::UnsupportedRx1DROffset(ul_dr, rx1_dr_offset));
        }
        let dr = (ul_dr as i8 - offset).clamp(DR::_0 as i8, DR::_5 as i8);
        DR::try_from(dr as u8).map_err(|_| Error::UnsupportedRx1DROffset(ul_dr, rx1_dr_offset))
    }

    fn convert_data_rate(dr: DR) -> Result<Datarate, Error> {
        let spreading_factor = match dr {
            DR::_0 => SpreadingFactor::_12,
            DR::_1 => SpreadingFactor::_11,
            DR::_2 => SpreadingFactor::_10,
            DR::_3 => SpreadingFactor::_9,
            DR::_4 => SpreadingFactor::_8,
            DR::_5 => SpreadingFactor::_7,
            _ => return Err(Error::DataRateNotSupported(dr)),
        };
        Ok(Datarate { spreading_factor, bandwidth: Bandwidth::_125KHz })
    }

    fn max_eirp() -> i8 {
        30
    }
    fn max_tx_power_index() -> u8 {
        10
    }
    fn duty_cycle_enabled() -> bool {
        false
    }
    fn beacon_format() -> BeaconFormat {
        BeaconFormat { size: 19, rfu1_size: 1, rfu2_size: 3 }
    }
    fn beacon_data_rate() -> DR {
        DR::_4
    }
    fn beacon_frequency(_beacon_time: u32) -> u32 {
        RX2_FREQUENCY
    }
    fn ping_slot_frequency(_dev_addr: u32, _beacon_time: u32) -> u32 {
        RX2_FREQUENCY
    }
}
