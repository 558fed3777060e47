//! Specification of functionality implemented for each supported LoRaWAN region.
//!
//! A region is a set of static tables ([`Region`]) plus the mutable channel plan
//! ([`channel_plan::ChannelPlan`]) and duty cycle ledger ([`band::Bands`]) owned by the MAC.
//! Everything the MAC needs to know about a region goes through this module.

use crate::device::radio::types::{CodingRate, Datarate, RfConfig, RxConfig, TxConfig};
use crate::device::Device;

use self::channel_plan::Channel;

use super::commands::LinkAdrReq;
use super::types::DR;

pub mod band;
pub mod channel_plan;
pub mod eu868;
pub mod in865;
pub mod us915;

/// Preamble length of LoRa frames.
pub const LORA_PREAMBLE_LEN: u16 = 8;
/// MHDR, FHDR without FOpts, FPort and MIC.
pub const FRAME_PAYLOAD_OVERHEAD: u8 = 13;
/// Upper bound of a transmission before the radio reports a timeout.
pub const TX_TIMEOUT_MS: u32 = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Error {
    InvalidTxPower,
    InvalidChannelIndex,
    InvalidChannelMaskCtrl,
    InvalidFrequency,
    DataRateNotSupported(DR),
    UnsupportedRx1DROffset(DR, u8),
    NoValidChannelFound,
    DutyCycleRestricted { wait_ms: u64 },
    InvalidCfListType,
    CommandNotImplementedForRegion,
}
impl<D> From<Error> for crate::Error<D>
where
    D: Device,
{
    fn from(value: Error) -> Self {
        Self::Region(value)
    }
}

/// Class B beacon frame layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub struct BeaconFormat {
    pub size: u8,
    pub rfu1_size: u8,
    pub rfu2_size: u8,
}

/// Specification of functionality to describe regional characteristics.
pub trait Region {
    /// Largest number of channels of the channel plan.
    fn max_channels() -> usize;
    /// Number of default channels, which are also the join channels.
    fn default_channels() -> usize;
    /// Definition of the default channel at `index`.
    fn default_channel(index: usize) -> Channel;
    /// Get the minimum frequency for the region.
    fn min_frequency() -> u32;
    /// Get the maximum frequency for the region.
    fn max_frequency() -> u32;
    /// Duty cycle divisors of the region's bands.
    fn bands() -> &'static [u16];
    /// Band a frequency belongs to, `None` when it may not be used.
    fn band_for_frequency(frequency: u32) -> Option<u8> {
        (Self::min_frequency()..=Self::max_frequency()).contains(&frequency).then_some(0)
    }
    /// Can a downlink be received on this frequency?
    fn verify_rx_frequency(frequency: u32) -> bool {
        (Self::min_frequency()..=Self::max_frequency()).contains(&frequency)
    }
    /// Lowest uplink datarate.
    fn min_tx_data_rate() -> DR {
        DR::_0
    }
    /// Highest uplink datarate.
    fn max_tx_data_rate() -> DR;
    /// Lowest downlink datarate.
    fn min_rx_data_rate() -> DR {
        DR::_0
    }
    /// Highest downlink datarate.
    fn max_rx_data_rate() -> DR;
    /// Get the default data rate for the region.
    fn default_data_rate() -> DR;
    /// Datarate of the given join attempt, counting from 0.
    fn join_data_rate(_attempt: u16) -> DR {
        Self::default_data_rate()
    }
    /// Largest application payload at a datarate, FOpts included.
    fn max_payload(dr: DR) -> u8;
    /// Get the default RX2 frequency for the region.
    fn default_rx2_frequency() -> u32;
    /// Get the default RX2 data rate for the region.
    fn default_rx2_data_rate() -> DR;
    /// Get the default RX1 data rate offset for the region.
    fn default_rx1_data_rate_offset() -> u8 {
        0
    }
    /// Largest RX1 data rate offset.
    fn max_rx1_data_rate_offset() -> u8;
    /// For the region, determine the RX1 data rate based on the uplink data rate and data rate offset.
    fn get_rx1_dr(ul_dr: DR, rx1_dr_offset: u8) -> Result<DR, Error>;
    /// Convert the data rate to spreading factor and bandwidth for the region.
    fn convert_data_rate(dr: DR) -> Result<Datarate, Error>;
    /// Get the default coding rate for the region.
    fn default_coding_rate() -> CodingRate {
        CodingRate::_4_5
    }
    /// Get the maximum EIRP for the region.
    fn max_eirp() -> i8;
    /// Antenna gain assumed when converting EIRP to conducted power.
    fn default_antenna_gain() -> f32 {
        2.15
    }
    /// Highest TXPower index, the lowest power.
    fn max_tx_power_index() -> u8;
    /// Is regulatory duty cycle enforced?
    fn duty_cycle_enabled() -> bool;
    /// Does the region support TXParamSetupReq packet processing?
    fn supports_tx_param_setup() -> bool {
        false
    }
    /// Get the default RX delay for the region.
    fn default_rx_delay() -> u32 {
        1000
    }
    /// Get the default delay from now before opening the RX1 window for a join accept packet from a network server.
    fn default_join_accept_delay1() -> u32 {
        5000
    }
    /// Get the default delay from now before opening the RX2 window for a join accept packet from a network server.
    fn default_join_accept_delay2() -> u32 {
        Self::default_join_accept_delay1() + 1000
    }
    /// Get the default ADR acknowledgement limit for the region.
    fn default_adr_ack_limit() -> u16 {
        64
    }
    /// Get the default ADR acknowledgement delay for the region.
    fn default_adr_ack_delay() -> u16 {
        32
    }
    /// Layout of class B beacons.
    fn beacon_format() -> BeaconFormat;
    /// Datarate of beacons and default ping slots.
    fn beacon_data_rate() -> DR;
    /// Beacon frequency for the beacon period starting at `beacon_time` (GPS seconds).
    fn beacon_frequency(beacon_time: u32) -> u32;
    /// Default ping slot frequency.
    fn ping_slot_frequency(dev_addr: u32, beacon_time: u32) -> u32;
}

/// Region parameters readable through [`phy_param`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum PhyAttribute {
    MinTxDr,
    MaxTxDr,
    MinRxDr,
    MaxRxDr,
    DefaultTxDr,
    MaxPayload(DR),
    DefaultTxPower,
    MaxTxPower,
    DefaultMaxEirp,
    DefaultAntennaGain,
    ReceiveDelay1,
    ReceiveDelay2,
    JoinAcceptDelay1,
    JoinAcceptDelay2,
    MaxRxWindow,
    AdrAckLimit,
    AdrAckDelay,
    DefaultRx1DrOffset,
    DefaultRx2Frequency,
    DefaultRx2Dr,
    MaxNbChannels,
    DefaultChannels,
    NbBands,
    DutyCycleEnabled,
    BeaconFormat,
    BeaconChannelDr,
    BeaconChannelFrequency { beacon_time: u32 },
    PingSlotChannelFrequency { dev_addr: u32, beacon_time: u32 },
    SymbolTime(DR),
}

/// Value of a [`PhyAttribute`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[allow(missing_docs)]
pub enum PhyValue {
    DataRate(DR),
    Value(u32),
    Eirp(i8),
    Gain(f32),
    Bool(bool),
    BeaconFormat(BeaconFormat),
    Unsupported,
}

/// Read a region parameter.
pub fn phy_param<R: Region>(attribute: PhyAttribute) -> PhyValue {
    match attribute {
        PhyAttribute::MinTxDr => PhyValue::DataRate(R::min_tx_data_rate()),
        PhyAttribute::MaxTxDr => PhyValue::DataRate(R::max_tx_data_rate()),
        PhyAttribute::MinRxDr => PhyValue::DataRate(R::min_rx_data_rate()),
        PhyAttribute::MaxRxDr => PhyValue::DataRate(R::max_rx_data_rate()),
        PhyAttribute::DefaultTxDr => PhyValue::DataRate(R::default_data_rate()),
        PhyAttribute::MaxPayload(dr) => PhyValue::Value(R::max_payload(dr) as u32),
        PhyAttribute::DefaultTxPower => PhyValue::Value(0),
        PhyAttribute::MaxTxPower => PhyValue::Value(R::max_tx_power_index() as u32),
        PhyAttribute::DefaultMaxEirp => PhyValue::Eirp(R::max_eirp()),
        PhyAttribute::DefaultAntennaGain => PhyValue::Gain(R::default_antenna_gain()),
        PhyAttribute::ReceiveDelay1 => PhyValue::Value(R::default_rx_delay()),
        PhyAttribute::ReceiveDelay2 => PhyValue::Value(R::default_rx_delay() + 1000),
        PhyAttribute::JoinAcceptDelay1 => PhyValue::Value(R::default_join_accept_delay1()),
        PhyAttribute::JoinAcceptDelay2 => PhyValue::Value(R::default_join_accept_delay2()),
        PhyAttribute::MaxRxWindow => PhyValue::Value(3000),
        PhyAttribute::AdrAckLimit => PhyValue::Value(R::default_adr_ack_limit() as u32),
        PhyAttribute::AdrAckDelay => PhyValue::Value(R::default_adr_ack_delay() as u32),
        PhyAttribute::DefaultRx1DrOffset => PhyValue::Value(R::default_rx1_data_rate_offset() as u32),
        PhyAttribute::DefaultRx2Frequency => PhyValue::Value(R::default_rx2_frequency()),
        PhyAttribute::DefaultRx2Dr => PhyValue::DataRate(R::default_rx2_data_rate()),
        PhyAttribute::MaxNbChannels => PhyValue::Value(R::max_channels() as u32),
        PhyAttribute::DefaultChannels => PhyValue::Value(R::default_channels() as u32),
        PhyAttribute::NbBands => PhyValue::Value(R::bands().len() as u32),
        PhyAttribute::DutyCycleEnabled => PhyValue::Bool(R::duty_cycle_enabled()),
        PhyAttribute::BeaconFormat => PhyValue::BeaconFormat(R::beacon_format()),
        PhyAttribute::BeaconChannelDr => PhyValue::DataRate(R::beacon_data_rate()),
        PhyAttribute::BeaconChannelFrequency { beacon_time } => {
            PhyValue::Value(R::beacon_frequency(beacon_time))
        }
        PhyAttribute::PingSlotChannelFrequency { dev_addr, beacon_time } => {
            PhyValue::Value(R::ping_slot_frequency(dev_addr, beacon_time))
        }
        PhyAttribute::SymbolTime(dr) => match R::convert_data_rate(dr) {
            Ok(datarate) => PhyValue::Value(datarate.symbol_time_us()),
            Err(_) => PhyValue::Unsupported,
        },
    }
}

/// Values checked by [`verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum VerifyAttribute {
    TxDr(DR),
    RxDr(DR),
    DefaultTxDr(DR),
    TxPower(u8),
    Rx1DrOffset(u8),
    Frequency(u32),
    RxFrequency(u32),
    DutyCycle(bool),
    NbTrans(u8),
}

/// Is the value legal in this region?
pub fn verify<R: Region>(attribute: VerifyAttribute) -> bool {
    match attribute {
        VerifyAttribute::TxDr(dr) | VerifyAttribute::DefaultTxDr(dr) => {
            dr.in_range((R::min_tx_data_rate(), R::max_tx_data_rate()))
        }
        VerifyAttribute::RxDr(dr) => {
            dr.in_range((R::min_rx_data_rate(), R::max_rx_data_rate()))
                && R::convert_data_rate(dr).is_ok()
        }
        VerifyAttribute::TxPower(index) => index <= R::max_tx_power_index(),
        VerifyAttribute::Rx1DrOffset(offset) => offset <= R::max_rx1_data_rate_offset(),
        VerifyAttribute::Frequency(frequency) => R::band_for_frequency(frequency).is_some(),
        VerifyAttribute::RxFrequency(frequency) => R::verify_rx_frequency(frequency),
        // Duty cycle may only be switched off where the region does not mandate it.
        VerifyAttribute::DutyCycle(enable) => enable || !R::duty_cycle_enabled(),
        VerifyAttribute::NbTrans(nb) => (1..=15).contains(&nb),
    }
}

/// Reset granularity of [`channel_plan::ChannelPlan::init_defaults`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitType {
    /// Channel list and mask back to defaults.
    All,
    /// Default channel definitions and mask restored, additional channels kept.
    Channels,
    /// Default channels re-enabled in the mask.
    Mask,
}

/// Symbol timeout and start offset of a receive window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxWindowParams {
    /// Symbols the receiver waits for a preamble.
    pub symbol_timeout: u16,
    /// Offset from the nominal window start in milliseconds, negative opens earlier.
    pub offset_ms: i32,
}

fn div_ceil(num: i64, den: i64) -> i64 {
    (num + den - 1) / den
}

/// Receive window geometry so that `min_rx_symbols` preamble symbols are caught despite
/// `rx_error_ms` of clock drift and the radio wake-up time.
pub fn compute_rx_window_params(
    datarate: &Datarate,
    min_rx_symbols: u8,
    rx_error_ms: u32,
    wakeup_ms: u32,
) -> RxWindowParams {
    let t_sym = datarate.symbol_time_us() as i64;
    let min_rx_symbols = min_rx_symbols as i64;
    let timeout = div_ceil((2 * min_rx_symbols - 8) * t_sym + 2 * rx_error_ms as i64 * 1000, t_sym)
        .max(min_rx_symbols);
    let offset = div_ceil(4 * t_sym - div_ceil(timeout * t_sym, 2) - wakeup_ms as i64 * 1000, 1000);
    RxWindowParams { symbol_timeout: timeout.clamp(0, u16::MAX as i64) as u16, offset_ms: offset as i32 }
}

/// Radio configuration of a receive window.
pub fn rx_config<R: Region>(
    frequency: u32,
    dr: DR,
    params: &RxWindowParams,
    continuous: bool,
) -> Result<RxConfig, Error> {
    Ok(RxConfig {
        rf: RfConfig {
            frequency,
            coding_rate: R::default_coding_rate(),
            data_rate: R::convert_data_rate(dr)?,
        },
        preamble_len: LORA_PREAMBLE_LEN,
        symbol_timeout: params.symbol_timeout,
        continuous,
        max_payload: R::max_payload(dr).saturating_add(FRAME_PAYLOAD_OVERHEAD),
    })
}

/// Radiated power of a TXPower index.
pub fn eirp_of_index(max_eirp: i8, index: u8) -> i8 {
    max_eirp.saturating_sub((index as i8).saturating_mul(2))
}

/// Radio configuration of an uplink. The conducted power is the EIRP minus the antenna gain.
pub fn tx_config<R: Region>(
    frequency: u32,
    dr: DR,
    power_index: u8,
    max_eirp: i8,
    antenna_gain: f32,
) -> Result<TxConfig, Error> {
    if power_index > R::max_tx_power_index() {
        return Err(Error::InvalidTxPower);
    }
    let eirp = eirp_of_index(max_eirp.min(R::max_eirp()), power_index);
    Ok(TxConfig {
        pw: (eirp as f32 - antenna_gain) as i8,
        rf: RfConfig {
            frequency,
            coding_rate: R::default_coding_rate(),
            data_rate: R::convert_data_rate(dr)?,
        },
        preamble_len: LORA_PREAMBLE_LEN,
        timeout_ms: TX_TIMEOUT_MS,
    })
}

/// Current datarate and power, checked against a LinkADRReq block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub struct LinkAdrParams {
    pub current_dr: DR,
    pub current_power: u8,
    pub current_nb_trans: u8,
}

/// Outcome of a LinkADRReq block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkAdrOutcome {
    /// Bit 0 channel mask, bit 1 datarate, bit 2 power.
    pub status: u8,
    #[allow(missing_docs)]
    pub data_rate: DR,
    #[allow(missing_docs)]
    pub tx_power: u8,
    #[allow(missing_docs)]
    pub nb_trans: u8,
}

impl LinkAdrOutcome {
    /// Were all three parts accepted?
    pub fn accepted(&self) -> bool {
        self.status == 0x07
    }
}

/// Validate a block of consecutive LinkADRReq commands against the channel plan. The mask is
/// applied to the plan only when the whole block is accepted. Datarate and power are returned
/// for the MAC to apply.
pub fn link_adr_req<R, C>(plan: &mut C, block: &[LinkAdrReq], params: &LinkAdrParams) -> LinkAdrOutcome
where
    R: Region,
    C: channel_plan::ChannelPlan<R>,
{
    let Some(last) = block.last() else {
        return LinkAdrOutcome {
            status: 0,
            data_rate: params.current_dr,
            tx_power: params.current_power,
            nb_trans: params.current_nb_trans,
        };
    };
    let mut mask = *plan.mask();
    let mut mask_ok = true;
    for req in block {
        mask_ok &= plan.apply_link_adr_mask(&mut mask, req);
    }
    let data_rate = if last.data_rate == 0x0F {
        Some(params.current_dr)
    } else {
        DR::try_from(last.data_rate).ok()
    };
    mask_ok &= plan.mask_is_valid(&mask, data_rate.unwrap_or(params.current_dr));
    let dr_ok = match data_rate {
        Some(dr) => verify::<R>(VerifyAttribute::TxDr(dr)) && plan.mask_supports_data_rate(&mask, dr),
        None => false,
    };
    let tx_power = if last.tx_power == 0x0F { params.current_power } else { last.tx_power };
    let power_ok = verify::<R>(VerifyAttribute::TxPower(tx_power));

    let status = (mask_ok as u8) | (dr_ok as u8) << 1 | (power_ok as u8) << 2;
    let outcome = LinkAdrOutcome {
        status,
        data_rate: data_rate.filter(|_| dr_ok).unwrap_or(params.current_dr),
        tx_power: if power_ok { tx_power } else { params.current_power },
        nb_trans: match last.number_of_transmissions {
            0 => 1,
            nb => nb,
        },
    };
    if outcome.accepted() {
        plan.commit_mask(mask);
    }
    outcome
}

/// Outcome of RXParamSetupReq: status bits and whether the values were applied.
pub fn rx_param_setup_req<R: Region>(rx1_dr_offset: u8, rx2_data_rate: u8, frequency: u32) -> u8 {
    let frequency_ok = R::verify_rx_frequency(frequency);
    let rx2_ok = DR::try_from(rx2_data_rate)
        .map(|dr| verify::<R>(VerifyAttribute::RxDr(dr)))
        .unwrap_or(false);
    let offset_ok = verify::<R>(VerifyAttribute::Rx1DrOffset(rx1_dr_offset));
    (frequency_ok as u8) | (rx2_ok as u8) << 1 | (offset_ok as u8) << 2
}

/// TXParamSetupReq answer, `None` when the region ignores the command.
pub fn tx_param_setup_req<R: Region>() -> Option<u8> {
    R::supports_tx_param_setup().then_some(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::radio::types::{Bandwidth, SpreadingFactor};
    use eu868::EU868;
    use us915::US915;

    #[test]
    fn rx_window_for_sf12_and_sf7() {
        let sf12 = Datarate { bandwidth: Bandwidth::_125KHz, spreading_factor: SpreadingFactor::_12 };
        let params = compute_rx_window_params(&sf12, 6, 10, 1);
        // tSym = 32768 us, (2*6-8)*32768+20000 => 5 symbols, bounded below by 6.
        assert_eq!(params.symbol_timeout, 6);
        assert_eq!(params.offset_ms, 32);
        let sf7 = Datarate { bandwidth: Bandwidth::_125KHz, spreading_factor: SpreadingFactor::_7 };
        let params = compute_rx_window_params(&sf7, 6, 10, 1);
        assert_eq!(params.symbol_timeout, 24);
        assert_eq!(params.offset_ms, -8);
    }

    #[test]
    fn phy_params_follow_region_tables() {
        assert_eq!(phy_param::<EU868>(PhyAttribute::MaxPayload(DR::_3)), PhyValue::Value(115));
        assert_eq!(phy_param::<US915>(PhyAttribute::DefaultRx2Dr), PhyValue::DataRate(DR::_8));
        assert_eq!(phy_param::<US915>(PhyAttribute::MaxNbChannels), PhyValue::Value(72));
        assert_eq!(phy_param::<EU868>(PhyAttribute::DutyCycleEnabled), PhyValue::Bool(true));
    }

    #[test]
    fn verify_rejects_out_of_region_values() {
        assert!(verify::<EU868>(VerifyAttribute::TxDr(DR::_5)));
        assert!(!verify::<EU868>(VerifyAttribute::TxDr(DR::_8)));
        assert!(!verify::<US915>(VerifyAttribute::TxDr(DR::_5)));
        assert!(verify::<US915>(VerifyAttribute::RxDr(DR::_13)));
        assert!(!verify::<EU868>(VerifyAttribute::TxPower(8)));
        assert!(!verify::<EU868>(VerifyAttribute::Frequency(915_000_000)));
        assert!(!verify::<EU868>(VerifyAttribute::DutyCycle(false)));
        assert!(verify::<US915>(VerifyAttribute::DutyCycle(false)));
    }

    #[test]
    fn tx_power_is_eirp_minus_gain() {
        let config = tx_config::<EU868>(868_100_000, DR::_5, 1, 16, 2.15).unwrap();
        assert_eq!(config.pw, 11);
        assert_eq!(tx_config::<EU868>(868_100_000, DR::_5, 8, 16, 2.15), Err(Error::InvalidTxPower));
    }

    #[test]
    fn rx_param_setup_status_bits() {
        assert_eq!(rx_param_setup_req::<EU868>(1, 3, 869_525_000), 0x07);
        assert_eq!(rx_param_setup_req::<EU868>(6, 3, 869_525_000), 0x03);
        assert_eq!(rx_param_setup_req::<EU868>(1, 3, 902_000_000), 0x06);
    }
}
