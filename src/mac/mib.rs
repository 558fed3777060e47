//! MAC information base: typed read and write access to the MAC parameters.
//!
//! Reads have no side effect. Writes are checked against the region and rejected with
//! [`Error::ParameterInvalid`] when out of range, leaving the MAC unchanged.

use super::class_b::BeaconState;
use super::crypto::{FCntId, KeyId, AES128, FCNT_DOWN_INITIAL_VALUE, MAX_MC_GROUPS};
use super::multicast::MulticastChannel;
use super::nvm::NvmGroups;
use super::region::channel_plan::{ChannelMask, ChannelPlan};
use super::region::{self, Region, VerifyAttribute};
use super::types::{Activation, DeviceClass, RxChannelParams, DR, LORAWAN_VERSION};
use super::{Error, Mac};
use crate::device::radio::Radio;
use crate::device::{self, Device, Error as DeviceError};

/// Readable and writable MAC parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum MibAttribute {
    DeviceClass,
    NetworkActivation,
    DevEui,
    JoinEui,
    AdrEnabled,
    NetId,
    DevAddr,
    AppKey,
    NwkKey,
    NwkSKey,
    AppSKey,
    McKEKey,
    McKey(u8),
    McKeyEncrypted(u8),
    PublicNetwork,
    Rx2Channel,
    Rx2DefaultChannel,
    RxCChannel,
    RxCDefaultChannel,
    ChannelMask,
    ChannelDefaultMask,
    ChannelsNbTrans,
    MaxRxWindow,
    ReceiveDelay1,
    ReceiveDelay2,
    JoinAcceptDelay1,
    JoinAcceptDelay2,
    ChannelsDataRate,
    ChannelsDefaultDataRate,
    ChannelsTxPower,
    ChannelsDefaultTxPower,
    SystemMaxRxError,
    MinRxSymbols,
    AntennaGain,
    DefaultAntennaGain,
    MaxEirp,
    DefaultMaxEirp,
    DutyCycle,
    Rx1DrOffset,
    AdrAckLimit,
    AdrAckDelay,
    UplinkCounter,
    DownlinkCounter,
    MulticastChannel(u8),
    PingSlotPeriodicity,
    BeaconState,
    SubBand,
    LorawanVersion,
}

/// Value of a MAC parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
#[allow(missing_docs)]
pub enum Mib {
    DeviceClass(DeviceClass),
    /// Only `None` and `Abp` can be written, OTAA goes through a join.
    NetworkActivation(Activation),
    DevEui([u8; 8]),
    JoinEui([u8; 8]),
    AdrEnabled(bool),
    NetId(u32),
    DevAddr(u32),
    AppKey([u8; 16]),
    NwkKey([u8; 16]),
    NwkSKey([u8; 16]),
    AppSKey([u8; 16]),
    McKEKey([u8; 16]),
    McKey { group: u8, key: [u8; 16] },
    /// Group key encrypted with McKEKey, as delivered by the network.
    McKeyEncrypted { group: u8, key: [u8; 16] },
    PublicNetwork(bool),
    Rx2Channel(RxChannelParams),
    Rx2DefaultChannel(RxChannelParams),
    RxCChannel(RxChannelParams),
    RxCDefaultChannel(RxChannelParams),
    ChannelMask(ChannelMask),
    ChannelDefaultMask(ChannelMask),
    ChannelsNbTrans(u8),
    MaxRxWindow(u32),
    ReceiveDelay1(u32),
    ReceiveDelay2(u32),
    JoinAcceptDelay1(u32),
    JoinAcceptDelay2(u32),
    ChannelsDataRate(DR),
    ChannelsDefaultDataRate(DR),
    ChannelsTxPower(u8),
    ChannelsDefaultTxPower(u8),
    SystemMaxRxError(u32),
    MinRxSymbols(u8),
    AntennaGain(f32),
    DefaultAntennaGain(f32),
    MaxEirp(i8),
    DefaultMaxEirp(i8),
    DutyCycle(bool),
    Rx1DrOffset(u8),
    AdrAckLimit(u16),
    AdrAckDelay(u16),
    /// Next uplink counter.
    UplinkCounter(u32),
    /// Last accepted unicast downlink counter.
    DownlinkCounter(u32),
    MulticastChannel { group: u8, channel: Option<MulticastChannel> },
    PingSlotPeriodicity(u8),
    BeaconState(BeaconState),
    /// US915 style 8 channel sub-band, 0 enables every channel.
    SubBand(u8),
    LorawanVersion(u32),
}

impl<R, C> Mac<R, C>
where
    R: Region,
    C: ChannelPlan<R>,
{
    /// Read a parameter. Keys are write only.
    pub fn mib_get(&self, attribute: MibAttribute) -> Result<Mib, Error> {
        let cfg = &self.configuration;
        let defaults = &self.defaults;
        let value = match attribute {
            MibAttribute::DeviceClass => Mib::DeviceClass(self.class),
            MibAttribute::NetworkActivation => Mib::NetworkActivation(self.session.activation),
            MibAttribute::DevEui => Mib::DevEui(self.credentials.dev_eui),
            MibAttribute::JoinEui => Mib::JoinEui(self.credentials.join_eui),
            MibAttribute::AdrEnabled => Mib::AdrEnabled(cfg.adr_enabled),
            MibAttribute::NetId => Mib::NetId(self.session.net_id),
            MibAttribute::DevAddr => Mib::DevAddr(self.session.dev_addr),
            MibAttribute::AppKey
            | MibAttribute::NwkKey
            | MibAttribute::NwkSKey
            | MibAttribute::AppSKey
            | MibAttribute::McKEKey
            | MibAttribute::McKey(_)
            | MibAttribute::McKeyEncrypted(_)
            | MibAttribute::SubBand => return Err(Error::ServiceUnknown),
            MibAttribute::PublicNetwork => Mib::PublicNetwork(cfg.public_network),
            MibAttribute::Rx2Channel => Mib::Rx2Channel(cfg.rx2),
            MibAttribute::Rx2DefaultChannel => Mib::Rx2DefaultChannel(defaults.rx2),
            MibAttribute::RxCChannel => Mib::RxCChannel(cfg.rxc),
            MibAttribute::RxCDefaultChannel => Mib::RxCDefaultChannel(defaults.rxc),
            MibAttribute::ChannelMask => Mib::ChannelMask(*self.channel_plan.mask()),
            MibAttribute::ChannelDefaultMask => Mib::ChannelDefaultMask(self.channel_plan.default_mask()),
            MibAttribute::ChannelsNbTrans => Mib::ChannelsNbTrans(cfg.number_of_transmissions),
            MibAttribute::MaxRxWindow => Mib::MaxRxWindow(cfg.max_rx_window),
            MibAttribute::ReceiveDelay1 => Mib::ReceiveDelay1(cfg.receive_delay1),
            MibAttribute::ReceiveDelay2 => Mib::ReceiveDelay2(cfg.receive_delay2),
            MibAttribute::JoinAcceptDelay1 => Mib::JoinAcceptDelay1(cfg.join_accept_delay1),
            MibAttribute::JoinAcceptDelay2 => Mib::JoinAcceptDelay2(cfg.join_accept_delay2),
            MibAttribute::ChannelsDataRate => Mib::ChannelsDataRate(cfg.tx_data_rate),
            MibAttribute::ChannelsDefaultDataRate => Mib::ChannelsDefaultDataRate(defaults.tx_data_rate),
            MibAttribute::ChannelsTxPower => Mib::ChannelsTxPower(cfg.tx_power),
            MibAttribute::ChannelsDefaultTxPower => Mib::ChannelsDefaultTxPower(defaults.tx_power),
            MibAttribute::SystemMaxRxError => Mib::SystemMaxRxError(cfg.system_max_rx_error),
            MibAttribute::MinRxSymbols => Mib::MinRxSymbols(cfg.min_rx_symbols),
            MibAttribute::AntennaGain => Mib::AntennaGain(cfg.antenna_gain),
            MibAttribute::DefaultAntennaGain => Mib::DefaultAntennaGain(defaults.antenna_gain),
            MibAttribute::MaxEirp => Mib::MaxEirp(cfg.max_eirp),
            MibAttribute::DefaultMaxEirp => Mib::DefaultMaxEirp(defaults.max_eirp),
            MibAttribute::DutyCycle => Mib::DutyCycle(cfg.duty_cycle_enabled),
            MibAttribute::Rx1DrOffset => Mib::Rx1DrOffset(cfg.rx1_data_rate_offset),
            MibAttribute::AdrAckLimit => Mib::AdrAckLimit(cfg.adr_ack_limit),
            MibAttribute::AdrAckDelay => Mib::AdrAckDelay(cfg.adr_ack_delay),
            MibAttribute::UplinkCounter => Mib::UplinkCounter(self.crypto.fcnt_up()),
            MibAttribute::DownlinkCounter => {
                Mib::DownlinkCounter(self.crypto.fcnt_down(FCntId::Down).map_err(|_| Error::ServiceUnknown)?)
            }
            MibAttribute::MulticastChannel(group) => Mib::MulticastChannel {
                group,
                channel: *self.multicast.get(group as usize).ok_or(Error::ParameterInvalid)?,
            },
            MibAttribute::PingSlotPeriodicity => Mib::PingSlotPeriodicity(self.class_b_params.periodicity),
            MibAttribute::BeaconState => Mib::BeaconState(self.class_b.state),
            MibAttribute::LorawanVersion => Mib::LorawanVersion(LORAWAN_VERSION),
        };
        Ok(value)
    }

    /// Write a parameter.
    pub fn mib_set<D: Device>(&mut self, device: &mut D, value: Mib) -> Result<(), crate::Error<D>> {
        let groups = match value {
            Mib::DeviceClass(class) => return self.set_class(device, class),
            Mib::NetworkActivation(activation) => {
                if activation == Activation::Otaa {
                    return Err(Error::ParameterInvalid.into());
                }
                self.session.activation = activation;
                NvmGroups::MAC_GROUP2
            }
            Mib::DevEui(eui) => {
                self.credentials.dev_eui = eui;
                NvmGroups::SECURE_ELEMENT
            }
            Mib::JoinEui(eui) => {
                self.credentials.join_eui = eui;
                NvmGroups::SECURE_ELEMENT
            }
            Mib::AdrEnabled(enable) => {
                self.configuration.adr_enabled = enable;
                NvmGroups::MAC_GROUP2
            }
            Mib::NetId(net_id) => {
                self.session.net_id = net_id;
                NvmGroups::MAC_GROUP2
            }
            Mib::DevAddr(dev_addr) => {
                self.session.dev_addr = dev_addr;
                NvmGroups::MAC_GROUP2
            }
            Mib::AppKey(key) => self.set_key(KeyId::AppKey, key)?,
            Mib::NwkKey(key) => self.set_key(KeyId::NwkKey, key)?,
            Mib::NwkSKey(key) => self.set_key(KeyId::NwkSKey, key)?,
            Mib::AppSKey(key) => self.set_key(KeyId::AppSKey, key)?,
            Mib::McKEKey(key) => self.set_key(KeyId::McKEKey, key)?,
            Mib::McKey { group, key } => self.set_key(KeyId::McKey(group), key)?,
            Mib::McKeyEncrypted { group, key } => {
                self.crypto.set_encrypted_mc_key(group, key)?;
                NvmGroups::SECURE_ELEMENT
            }
            Mib::PublicNetwork(enable) => {
                device.radio().set_public_network(enable).map_err(DeviceError::<D>::Radio)?;
                self.configuration.public_network = enable;
                NvmGroups::MAC_GROUP2
            }
            Mib::Rx2Channel(channel) => {
                self.configuration.rx2 = verified_rx_channel::<R, D>(device, channel)?;
                NvmGroups::MAC_GROUP2
            }
            Mib::Rx2DefaultChannel(channel) => {
                self.defaults.rx2 = verified_rx_channel::<R, D>(device, channel)?;
                NvmGroups::MAC_GROUP2
            }
            Mib::RxCChannel(channel) => {
                self.configuration.rxc = verified_rx_channel::<R, D>(device, channel)?;
                if self.class == DeviceClass::C && !self.is_busy() {
                    self.open_rxc(device)?;
                }
                NvmGroups::MAC_GROUP2
            }
            Mib::RxCDefaultChannel(channel) => {
                self.defaults.rxc = verified_rx_channel::<R, D>(device, channel)?;
                NvmGroups::MAC_GROUP2
            }
            Mib::ChannelMask(mask) => {
                self.channel_plan.set_mask(mask).map_err(|_| Error::ParameterInvalid)?;
                NvmGroups::REGION_GROUP2
            }
            Mib::ChannelDefaultMask(_) | Mib::BeaconState(_) | Mib::LorawanVersion(_) => {
                return Err(Error::ServiceUnknown.into());
            }
            Mib::ChannelsNbTrans(nb) => {
                check(region::verify::<R>(VerifyAttribute::NbTrans(nb)))?;
                self.configuration.number_of_transmissions = nb;
                NvmGroups::MAC_GROUP2
            }
            Mib::MaxRxWindow(ms) => {
                self.configuration.max_rx_window = ms;
                NvmGroups::MAC_GROUP2
            }
            Mib::ReceiveDelay1(ms) => {
                self.configuration.receive_delay1 = ms;
                NvmGroups::MAC_GROUP2
            }
            Mib::ReceiveDelay2(ms) => {
                self.configuration.receive_delay2 = ms;
                NvmGroups::MAC_GROUP2
            }
            Mib::JoinAcceptDelay1(ms) => {
                self.configuration.join_accept_delay1 = ms;
                NvmGroups::MAC_GROUP2
            }
            Mib::JoinAcceptDelay2(ms) => {
                self.configuration.join_accept_delay2 = ms;
                NvmGroups::MAC_GROUP2
            }
            Mib::ChannelsDataRate(dr) => {
                check(region::verify::<R>(VerifyAttribute::TxDr(dr)) && device_supports::<D>(dr))?;
                self.configuration.tx_data_rate = dr;
                NvmGroups::MAC_GROUP1
            }
            Mib::ChannelsDefaultDataRate(dr) => {
                check(region::verify::<R>(VerifyAttribute::DefaultTxDr(dr)))?;
                self.defaults.tx_data_rate = dr;
                NvmGroups::MAC_GROUP2
            }
            Mib::ChannelsTxPower(power) => {
                check(region::verify::<R>(VerifyAttribute::TxPower(power)))?;
                self.configuration.tx_power = power;
                NvmGroups::MAC_GROUP1
            }
            Mib::ChannelsDefaultTxPower(power) => {
                check(region::verify::<R>(VerifyAttribute::TxPower(power)))?;
                self.defaults.tx_power = power;
                NvmGroups::MAC_GROUP2
            }
            Mib::SystemMaxRxError(ms) => {
                self.configuration.system_max_rx_error = ms;
                self.defaults.system_max_rx_error = ms;
                NvmGroups::MAC_GROUP2
            }
            Mib::MinRxSymbols(symbols) => {
                self.configuration.min_rx_symbols = symbols;
                self.defaults.min_rx_symbols = symbols;
                NvmGroups::MAC_GROUP2
            }
            Mib::AntennaGain(gain) => {
                self.configuration.antenna_gain = gain;
                NvmGroups::MAC_GROUP2
            }
            Mib::DefaultAntennaGain(gain) => {
                self.defaults.antenna_gain = gain;
                NvmGroups::MAC_GROUP2
            }
            Mib::MaxEirp(eirp) => {
                self.configuration.max_eirp = eirp;
                NvmGroups::MAC_GROUP2
            }
            Mib::DefaultMaxEirp(eirp) => {
                self.defaults.max_eirp = eirp;
                NvmGroups::MAC_GROUP2
            }
            Mib::DutyCycle(enable) => {
                check(region::verify::<R>(VerifyAttribute::DutyCycle(enable)))?;
                self.configuration.duty_cycle_enabled = enable;
                NvmGroups::MAC_GROUP2
            }
            Mib::Rx1DrOffset(offset) => {
                check(region::verify::<R>(VerifyAttribute::Rx1DrOffset(offset)))?;
                self.configuration.rx1_data_rate_offset = offset;
                NvmGroups::MAC_GROUP2
            }
            Mib::AdrAckLimit(limit) => {
                check(limit > 0)?;
                self.configuration.adr_ack_limit = limit;
                NvmGroups::MAC_GROUP2
            }
            Mib::AdrAckDelay(delay) => {
                check(delay > 0)?;
                self.configuration.adr_ack_delay = delay;
                NvmGroups::MAC_GROUP2
            }
            Mib::UplinkCounter(fcnt) => {
                self.crypto.set_fcnt_up(fcnt);
                NvmGroups::CRYPTO
            }
            Mib::DownlinkCounter(fcnt) => {
                self.crypto.set_fcnt_down(FCntId::Down, fcnt)?;
                NvmGroups::CRYPTO
            }
            Mib::MulticastChannel { group, channel } => {
                check((group as usize) < MAX_MC_GROUPS)?;
                if let Some(channel) = channel {
                    check(
                        channel.class != DeviceClass::A
                            && channel.fcnt_min <= channel.fcnt_max
                            && R::verify_rx_frequency(channel.frequency)
                            && region::verify::<R>(VerifyAttribute::RxDr(channel.data_rate)),
                    )?;
                }
                self.multicast[group as usize] = channel;
                self.crypto.set_fcnt_down(FCntId::McDown(group), FCNT_DOWN_INITIAL_VALUE)?;
                NvmGroups::MAC_GROUP2 | NvmGroups::CRYPTO
            }
            Mib::PingSlotPeriodicity(periodicity) => {
                check(periodicity <= 7)?;
                self.class_b_params.periodicity = periodicity;
                NvmGroups::CLASS_B
            }
            Mib::SubBand(sub_band) => {
                self.channel_plan.set_sub_band(sub_band).map_err(|_| Error::ParameterInvalid)?;
                NvmGroups::REGION_GROUP2
            }
        };
        self.dirty |= groups;
        Ok(())
    }

    fn set_key(&mut self, id: KeyId, key: [u8; 16]) -> Result<NvmGroups, Error> {
        self.crypto.set_key(id, AES128(key)).map_err(|_| Error::ParameterInvalid)?;
        Ok(NvmGroups::SECURE_ELEMENT)
    }
}

fn check(valid: bool) -> Result<(), Error> {
    if valid {
        Ok(())
    } else {
        Err(Error::ParameterInvalid)
    }
}

fn verified_rx_channel<R: Region, D: Device>(
    device: &mut D,
    channel: RxChannelParams,
) -> Result<RxChannelParams, Error> {
    check(
        R::verify_rx_frequency(channel.frequency)
            && device::supports_frequency(device, channel.frequency)
            && region::verify::<R>(VerifyAttribute::RxDr(channel.data_rate)),
    )?;
    Ok(channel)
}

fn device_supports<D: Device>(dr: DR) -> bool {
    D::min_data_rate().map_or(true, |min| dr >= min) && D::max_data_rate().map_or(true, |max| dr <= max)
}
