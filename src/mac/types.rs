//! Properties used in LoRaWAN MAC processing.

use serde::{Deserialize, Serialize};

use super::region::Region;

/// LoRaWAN version implemented by the MAC, 1.0.4.
pub const LORAWAN_VERSION: u32 = 0x0100_0400;

/// Frequency and datarate of a downlink-only receive window (RX2, RXC, ping slot).
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub struct RxChannelParams {
    pub frequency: u32,
    pub data_rate: DR,
}

/// Basic send/receive properties, the live MAC parameters.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Configuration {
    pub(crate) tx_data_rate: DR,
    pub(crate) tx_power: u8,
    pub(crate) rx1_data_rate_offset: u8,
    pub(crate) rx2: RxChannelParams,
    pub(crate) rxc: RxChannelParams,
    pub(crate) receive_delay1: u32,
    pub(crate) receive_delay2: u32,
    pub(crate) join_accept_delay1: u32,
    pub(crate) join_accept_delay2: u32,
    pub(crate) max_rx_window: u32,
    pub(crate) system_max_rx_error: u32,
    pub(crate) min_rx_symbols: u8,
    pub(crate) number_of_transmissions: u8,
    pub(crate) max_duty_cycle: u8,
    pub(crate) adr_enabled: bool,
    pub(crate) adr_ack_limit: u16,
    pub(crate) adr_ack_delay: u16,
    pub(crate) public_network: bool,
    pub(crate) duty_cycle_enabled: bool,
    pub(crate) uplink_dwell_time: bool,
    pub(crate) downlink_dwell_time: bool,
    pub(crate) max_eirp: i8,
    pub(crate) antenna_gain: f32,
}

impl Configuration {
    /// Region defaults.
    pub fn default_for<R: Region>() -> Self {
        let rx2 = RxChannelParams {
            frequency: R::default_rx2_frequency(),
            data_rate: R::default_rx2_data_rate(),
        };
        Self {
            tx_data_rate: R::default_data_rate(),
            tx_power: 0,
            rx1_data_rate_offset: R::default_rx1_data_rate_offset(),
            rx2,
            rxc: rx2,
            receive_delay1: R::default_rx_delay(),
            receive_delay2: R::default_rx_delay() + 1000,
            join_accept_delay1: R::default_join_accept_delay1(),
            join_accept_delay2: R::default_join_accept_delay2(),
            max_rx_window: 3000,
            system_max_rx_error: 10,
            min_rx_symbols: 6,
            number_of_transmissions: 1,
            max_duty_cycle: 0,
            adr_enabled: true,
            adr_ack_limit: R::default_adr_ack_limit(),
            adr_ack_delay: R::default_adr_ack_delay(),
            public_network: true,
            duty_cycle_enabled: R::duty_cycle_enabled(),
            uplink_dwell_time: false,
            downlink_dwell_time: false,
            max_eirp: R::max_eirp(),
            antenna_gain: R::default_antenna_gain(),
        }
    }

    /// Datarate of the next data uplink.
    pub fn tx_data_rate(&self) -> DR {
        self.tx_data_rate
    }

    /// Tx power index of the next data uplink.
    pub fn tx_power(&self) -> u8 {
        self.tx_power
    }

    /// Is adaptive datarate enabled?
    pub fn adr_enabled(&self) -> bool {
        self.adr_enabled
    }

    /// Number of transmissions of each unconfirmed uplink.
    pub fn number_of_transmissions(&self) -> u8 {
        self.number_of_transmissions
    }

    /// RX2 window parameters.
    pub fn rx2(&self) -> RxChannelParams {
        self.rx2
    }

    /// Delay between the end of an uplink and RX1, in milliseconds.
    pub fn receive_delay1(&self) -> u32 {
        self.receive_delay1
    }
}

/// Device class.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum DeviceClass {
    #[default]
    A,
    B,
    C,
}

/// How the current session was established.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Activation {
    #[default]
    None,
    Abp,
    Otaa,
}

/// Identification properties used to enable communication with a network server.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Credentials {
    pub(crate) join_eui: [u8; 8],
    pub(crate) dev_eui: [u8; 8],
}
impl Credentials {
    /// Creation. EUIs are given most significant byte first, as printed on labels.
    pub fn new(join_eui: [u8; 8], dev_eui: [u8; 8]) -> Self {
        Self { join_eui, dev_eui }
    }

    /// JoinEUI (formerly AppEUI).
    pub fn join_eui(&self) -> [u8; 8] {
        self.join_eui
    }

    /// DevEUI.
    pub fn dev_eui(&self) -> [u8; 8] {
        self.dev_eui
    }
}

/// Properties maintained during a session with a network server. Session keys live in the
/// crypto service.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Session {
    pub(crate) dev_addr: u32,
    pub(crate) net_id: u32,
    pub(crate) activation: Activation,
}

impl Session {
    /// Creation.
    pub fn new(dev_addr: u32, net_id: u32, activation: Activation) -> Self {
        Self { dev_addr, net_id, activation }
    }

    /// Get the device address.
    pub fn dev_addr(&self) -> u32 {
        self.dev_addr
    }

    /// Get the network identifier.
    pub fn net_id(&self) -> u32 {
        self.net_id
    }

    /// Is a session established?
    pub fn is_joined(&self) -> bool {
        self.activation != Activation::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
#[repr(u8)]
pub enum DR {
    _0 = 0,
    _1 = 1,
    _2 = 2,
    _3 = 3,
    _4 = 4,
    _5 = 5,
    _6 = 6,
    _7 = 7,
    _8 = 8,
    _9 = 9,
    _10 = 10,
    _11 = 11,
    _12 = 12,
    _13 = 13,
    _14 = 14,
    _15 = 15,
}

impl DR {
    /// Is this DR within range?
    pub fn in_range(&self, range: (DR, DR)) -> bool {
        (range.0 as u8 <= *self as u8) && (*self as u8 <= range.1 as u8)
    }

    /// The DR `steps` below this one, saturating at `floor`.
    pub fn lowered(self, steps: u8, floor: DR) -> DR {
        let value = (self as u8).saturating_sub(steps).max(floor as u8);
        DR::try_from(value).unwrap_or(floor)
    }
}

impl TryFrom<u8> for DR {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DR::_0),
            1 => Ok(DR::_1),
            2 => Ok(DR::_2),
            3 => Ok(DR::_3),
            4 => Ok(DR::_4),
            5 => Ok(DR::_5),
            6 => Ok(DR::_6),
            7 => Ok(DR::_7),
            8 => Ok(DR::_8),
            9 => Ok(DR::_9),
            10 => Ok(DR::_10),
            11 => Ok(DR::_11),
            12 => Ok(DR::_12),
            13 => Ok(DR::_13),
            14 => Ok(DR::_14),
            15 => Ok(DR::_15),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Frame {
    Join,
    Data,
}

/// Receive slot a downlink arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Window {
    _1,
    _2,
    C,
    PingSlot,
    Beacon,
}
