//! Request, confirm and indication primitives exchanged with the layer above the MAC.

use super::nvm::NvmGroups;
use super::types::{DeviceClass, Window, DR};

/// Outcome carried by confirms and indications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum EventStatus {
    Ok,
    Error,
    TxTimeout,
    Rx1Timeout,
    Rx2Timeout,
    Rx1Error,
    Rx2Error,
    JoinFail,
    DownlinkRepeated,
    TxDrPayloadSizeError,
    AddressFail,
    MicFail,
    MulticastFail,
    BeaconLocked,
    BeaconLost,
    BeaconNotFound,
}

/// Kind of data service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum McpsType {
    Unconfirmed,
    Confirmed,
    Proprietary,
    /// Receive only.
    Multicast,
}

/// Data service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpsRequest<'a> {
    /// Fire and forget uplink, repeated NbTrans times. An empty payload sends a frame without
    /// FPort, used to flush pending MAC commands.
    Unconfirmed {
        #[allow(missing_docs)]
        port: u8,
        #[allow(missing_docs)]
        payload: &'a [u8],
    },
    /// Uplink retried until acknowledged.
    Confirmed {
        #[allow(missing_docs)]
        port: u8,
        #[allow(missing_docs)]
        payload: &'a [u8],
    },
    /// Raw frame after the MHDR.
    Proprietary {
        #[allow(missing_docs)]
        payload: &'a [u8],
    },
}

impl McpsRequest<'_> {
    /// Type of the request.
    pub fn kind(&self) -> McpsType {
        match self {
            McpsRequest::Unconfirmed { .. } => McpsType::Unconfirmed,
            McpsRequest::Confirmed { .. } => McpsType::Confirmed,
            McpsRequest::Proprietary { .. } => McpsType::Proprietary,
        }
    }

    /// Application payload.
    pub fn payload(&self) -> &[u8] {
        match self {
            McpsRequest::Unconfirmed { payload, .. }
            | McpsRequest::Confirmed { payload, .. }
            | McpsRequest::Proprietary { payload } => payload,
        }
    }
}

/// Completion of a data request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct McpsConfirm {
    #[allow(missing_docs)]
    pub mcps: McpsType,
    #[allow(missing_docs)]
    pub status: EventStatus,
    /// Datarate of the last transmission.
    pub data_rate: DR,
    /// TXPower index of the last transmission.
    pub tx_power: u8,
    /// Was the uplink acknowledged by the network?
    pub ack_received: bool,
    /// Transmissions performed.
    pub nb_trans: u8,
    /// Uplink counter of the frame.
    pub uplink_counter: u32,
    /// Time on air of the last transmission in milliseconds.
    pub tx_time_on_air: u32,
    /// Uplink channel index of the last transmission.
    pub channel: u8,
}

/// Data received from the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McpsIndication<'a> {
    /// Unconfirmed, Confirmed or Multicast.
    pub mcps: McpsType,
    #[allow(missing_docs)]
    pub status: EventStatus,
    /// Multicast group the frame was addressed to.
    pub multicast_group: Option<u8>,
    /// `None` for frames without FRMPayload.
    pub port: Option<u8>,
    /// Decrypted application payload.
    pub payload: &'a [u8],
    #[allow(missing_docs)]
    pub rssi: i16,
    #[allow(missing_docs)]
    pub snr: i8,
    /// Window the frame arrived in.
    pub rx_slot: Window,
    /// Downlink datarate.
    pub rx_data_rate: DR,
    /// The frame acknowledged the last confirmed uplink.
    pub ack_received: bool,
    /// The network has more data pending.
    pub frame_pending: bool,
    /// Uplink counter of the frame that opened the receive window.
    pub uplink_counter: u32,
    /// 32 bit downlink counter of the frame.
    pub downlink_counter: u32,
    #[allow(missing_docs)]
    pub dev_addr: u32,
}

/// Management request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MlmeRequest {
    /// Over the air activation, or local activation when the MAC holds an ABP session.
    Join,
    /// Queue a LinkCheckReq for the next uplink.
    LinkCheck,
    /// Queue a DeviceTimeReq for the next uplink.
    DeviceTime,
    /// Queue a PingSlotInfoReq for the next uplink.
    PingSlotInfo {
        /// Ping slot period is 2^periodicity seconds.
        periodicity: u8,
    },
    /// Search the beacon. Without a time reference a full beacon period is scanned.
    BeaconAcquisition,
    /// Transmit a continuous wave.
    TxCw {
        #[allow(missing_docs)]
        frequency: u32,
        /// Radiated power in dBm.
        power: i8,
        #[allow(missing_docs)]
        timeout_s: u16,
    },
    /// Derive McKEKey from the multicast root key.
    DeriveMcKeKey,
    /// Derive the session keys of a multicast group.
    DeriveMcKeyPair {
        #[allow(missing_docs)]
        group: u8,
    },
}

/// Kind of management operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum MlmeType {
    Join,
    LinkCheck,
    DeviceTime,
    PingSlotInfo,
    BeaconAcquisition,
    TxCw,
    DeriveMcKeKey,
    DeriveMcKeyPair,
}

impl MlmeRequest {
    /// Type of the request.
    pub fn kind(&self) -> MlmeType {
        match self {
            MlmeRequest::Join => MlmeType::Join,
            MlmeRequest::LinkCheck => MlmeType::LinkCheck,
            MlmeRequest::DeviceTime => MlmeType::DeviceTime,
            MlmeRequest::PingSlotInfo { .. } => MlmeType::PingSlotInfo,
            MlmeRequest::BeaconAcquisition => MlmeType::BeaconAcquisition,
            MlmeRequest::TxCw { .. } => MlmeType::TxCw,
            MlmeRequest::DeriveMcKeKey => MlmeType::DeriveMcKeKey,
            MlmeRequest::DeriveMcKeyPair { .. } => MlmeType::DeriveMcKeyPair,
        }
    }
}

/// Completion of a management request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MlmeConfirm {
    #[allow(missing_docs)]
    pub mlme: MlmeType,
    #[allow(missing_docs)]
    pub status: EventStatus,
    /// LinkCheckAns demodulation margin.
    pub demod_margin: u8,
    /// LinkCheckAns gateway count.
    pub nb_gateways: u8,
    /// Join attempts performed since the last successful join.
    pub nb_retries: u16,
    /// Time on air of the request frame.
    pub tx_time_on_air: u32,
}

impl MlmeConfirm {
    pub(crate) fn new(mlme: MlmeType, status: EventStatus) -> Self {
        Self { mlme, status, demod_margin: 0, nb_gateways: 0, nb_retries: 0, tx_time_on_air: 0 }
    }
}

/// Management events initiated by the network or by timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MlmeIndication {
    /// The network expects an uplink: FPending was set or answers are waiting.
    ScheduleUplink,
    /// A beacon was received or missed.
    Beacon {
        #[allow(missing_docs)]
        status: EventStatus,
        /// GPS time of the beacon period in seconds.
        time: u32,
    },
    /// No beacon for too long, the MAC fell back to class A.
    BeaconLost,
    /// The device class changed.
    ClassChanged(DeviceClass),
}

/// Receiver of MAC events. Every method defaults to doing nothing.
pub trait Primitives {
    /// A data request completed.
    fn mcps_confirm(&mut self, _confirm: &McpsConfirm) {}
    /// Data was received.
    fn mcps_indication(&mut self, _indication: &McpsIndication<'_>) {}
    /// A management request completed.
    fn mlme_confirm(&mut self, _confirm: &MlmeConfirm) {}
    /// A management event occurred.
    fn mlme_indication(&mut self, _indication: &MlmeIndication) {}
    /// Persistent groups changed and should be saved.
    fn nvm_data_change(&mut self, _groups: NvmGroups) {}
}

/// Discards every event.
impl Primitives for () {}
