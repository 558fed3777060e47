//! LoRaWAN 1.0.4 class A, B and C end-device MAC.
//!
//! [`Mac`] is an event driven state machine. Radio completions and timer expiries are
//! recorded with [`Mac::on_radio_event`] and [`Mac::on_timer_event`], which may run in
//! interrupt context, and the work happens in [`Mac::process`] called from the application
//! loop. Results are handed to a [`primitives::Primitives`] implementation.

pub mod adr;
pub mod class_b;
pub mod commands;
pub mod confirm_queue;
pub mod crypto;
pub mod frame;
mod mib;
pub mod multicast;
pub mod nvm;
pub mod primitives;
pub mod region;
mod rx;
pub mod types;

#[cfg(test)]
mod tests;

use core::marker::PhantomData;

use heapless::Vec;

pub use self::mib::{Mib, MibAttribute};

use self::adr::{AdrNext, AdrParams, MAX_ACK_RETRIES};
use self::class_b::{ClassB, ClassBParams};
use self::commands::{MacCommandBuffer, UplinkCommand, MAC_COMMAND_BUFFER_LEN};
use self::confirm_queue::ConfirmQueue;
use self::crypto::{Crypto, MAX_MC_GROUPS};
use self::frame::{DataUplink, FCtrl, MType, MAX_FOPTS_LEN};
use self::multicast::MulticastGroups;
use self::nvm::{MacGroup1, MacGroup2, NvmGroups, PersistentContext, SecureElementNvm};
use self::primitives::{
    EventStatus, McpsConfirm, McpsRequest, McpsType, MlmeConfirm, MlmeIndication, MlmeRequest,
    MlmeType, Primitives,
};
use self::region::band::{Bands, DutyCycleContext};
use self::region::channel_plan::{ChannelPlan, NextChannelParams};
use self::region::{InitType, Region, FRAME_PAYLOAD_OVERHEAD, LORA_PREAMBLE_LEN, TX_TIMEOUT_MS};
use self::types::*;
use crate::device::radio::types::{RadioEvent, RfConfig, RxQuality};
use crate::device::radio::Radio;
use crate::device::radio_buffer::RadioBuffer;
use crate::device::rng::Rng;
use crate::device::timer::{Timer, TimerId};
use crate::device::{Device, Error as DeviceError};

/// Largest PHYPayload handled, MHDR and MIC included.
pub const MAX_PHY_PAYLOAD_LEN: usize = 256;
/// Nominal delay before a confirmed uplink is retransmitted, randomized by one second.
pub const ACK_TIMEOUT_MS: u32 = 2000;
/// Application ports usable by data requests.
pub const APP_PORTS: core::ops::RangeInclusive<u8> = 1..=223;

/// Reasons a MAC request is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A transmission cycle or a request of the same kind is in progress.
    Busy,
    /// The MIB attribute cannot be read or written.
    ServiceUnknown,
    /// A parameter is out of range for the region or the current state.
    ParameterInvalid,
    /// The payload does not fit at the current datarate.
    LengthError,
    /// Pending MAC commands left no room for the payload and were sent alone.
    SkippedAppData,
    /// No channel has duty cycle credit, the uplink may be retried after `wait_ms`.
    DutyCycleRestricted {
        #[allow(missing_docs)]
        wait_ms: u64,
    },
    /// No enabled channel supports the datarate.
    NoFreeChannelFound,
    /// Data requests need a session.
    NoNetworkJoined,
    /// The uplink counter is exhausted, a new session is required.
    FCntExhausted,
    /// Every slot of the confirm queue is taken.
    ConfirmQueueFull,
    /// The answer buffer of MAC commands is full.
    MacCommandBufferFull,
    #[allow(missing_docs)]
    Frame(frame::Error),
}

impl<D> From<Error> for crate::Error<D>
where
    D: Device,
{
    fn from(value: Error) -> Self {
        Self::Mac(value)
    }
}

impl From<confirm_queue::Error> for Error {
    fn from(value: confirm_queue::Error) -> Self {
        match value {
            confirm_queue::Error::Full => Error::ConfirmQueueFull,
            confirm_queue::Error::Duplicate => Error::Busy,
        }
    }
}

impl From<commands::Error> for Error {
    fn from(_: commands::Error) -> Self {
        Error::MacCommandBufferFull
    }
}

fn channel_error(err: region::Error) -> Error {
    match err {
        region::Error::DutyCycleRestricted { wait_ms } => Error::DutyCycleRestricted { wait_ms },
        _ => Error::NoFreeChannelFound,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum State {
    Idle,
    Tx,
    WaitRx1,
    Rx1,
    WaitRx2,
    Rx2,
    /// Waiting for the retransmission of a pending uplink.
    RetryDelay,
    TxCw,
}

/// A radio completion waiting for [`Mac::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    TxDone { at: u64 },
    TxTimeout,
    RxDone { at: u64, quality: RxQuality },
    RxTimeout,
    RxError,
}

/// Receive window currently open on the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RxSlot {
    window: Window,
    data_rate: DR,
}

/// The frame of the current transmission cycle.
struct PendingUplink {
    buf: RadioBuffer<MAX_PHY_PAYLOAD_LEN>,
    frame: Frame,
    /// `None` for a frame flushing MAC commands only.
    mcps: Option<McpsType>,
    fcnt: u32,
    data_rate: DR,
    tx_power: u8,
    channel: usize,
    toa_ms: u32,
    tx_done_at: u64,
    transmissions: u8,
    max_transmissions: u8,
    mac_commands: usize,
    ack_received: bool,
    downlink_received: bool,
    rx1: RxChannelParams,
}

impl PendingUplink {
    fn new(buf: RadioBuffer<MAX_PHY_PAYLOAD_LEN>, frame: Frame, data_rate: DR, tx_power: u8) -> Self {
        Self {
            buf,
            frame,
            mcps: None,
            fcnt: 0,
            data_rate,
            tx_power,
            channel: 0,
            toa_ms: 0,
            tx_done_at: 0,
            transmissions: 0,
            max_transmissions: 1,
            mac_commands: 0,
            ack_received: false,
            downlink_received: false,
            rx1: RxChannelParams { frequency: 0, data_rate },
        }
    }

    fn is_confirmed(&self) -> bool {
        self.mcps == Some(McpsType::Confirmed)
    }
}

/// LoRaWAN MAC of one end-device.
pub struct Mac<R, C>
where
    R: Region,
    C: ChannelPlan<R>,
{
    pub(crate) configuration: Configuration,
    pub(crate) defaults: Configuration,
    pub(crate) credentials: Credentials,
    pub(crate) session: Session,
    pub(crate) crypto: Crypto,
    pub(crate) channel_plan: C,
    pub(crate) bands: Bands,
    pub(crate) class: DeviceClass,
    pub(crate) class_b_params: ClassBParams,
    pub(crate) class_b: ClassB,
    pub(crate) multicast: MulticastGroups,
    pub(crate) commands: MacCommandBuffer,
    pub(crate) confirm_queue: ConfirmQueue,
    pub(crate) adr_ack_counter: u16,
    pub(crate) ack_next: bool,
    state: State,
    uplink: Option<PendingUplink>,
    rx_slot: Option<RxSlot>,
    completion: Option<Completion>,
    timer_events: u8,
    rx_buffer: RadioBuffer<MAX_PHY_PAYLOAD_LEN>,
    last_snr: i8,
    link_check: (u8, u8),
    indications: Vec<MlmeIndication, 4>,
    dirty: NvmGroups,
    join_start: Option<u64>,
    join_attempts: u16,
    region: PhantomData<R>,
}

impl<R, C> Mac<R, C>
where
    R: Region,
    C: ChannelPlan<R>,
{
    /// MAC with the region defaults, no session and class A.
    pub fn new(credentials: Credentials, crypto: Crypto) -> Self {
        let configuration = Configuration::default_for::<R>();
        let mut channel_plan = C::default();
        channel_plan.init_defaults(InitType::All);
        Self {
            configuration,
            defaults: configuration,
            credentials,
            session: Session::default(),
            crypto,
            channel_plan,
            bands: Bands::new::<R>(),
            class: DeviceClass::A,
            class_b_params: ClassBParams::default(),
            class_b: ClassB::default(),
            multicast: [None; MAX_MC_GROUPS],
            commands: MacCommandBuffer::default(),
            confirm_queue: ConfirmQueue::default(),
            adr_ack_counter: 0,
            ack_next: false,
            state: State::Idle,
            uplink: None,
            rx_slot: None,
            completion: None,
            timer_events: 0,
            rx_buffer: RadioBuffer::new(),
            last_snr: 0,
            link_check: (0, 0),
            indications: Vec::new(),
            dirty: NvmGroups::NONE,
            join_start: None,
            join_attempts: 0,
            region: PhantomData,
        }
    }

    /// Bring the radio into the state of the current class, after creation or a restore.
    pub fn start<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        device
            .radio()
            .set_public_network(self.configuration.public_network)
            .map_err(DeviceError::<D>::Radio)?;
        self.resume_reception(device)
    }

    /// Is a transmission cycle, a retransmission or a beacon search in progress?
    pub fn is_busy(&self) -> bool {
        self.state != State::Idle
            || self.uplink.is_some()
            || self.rx_slot.is_some_and(|slot| slot.window == Window::Beacon)
    }

    #[allow(missing_docs)]
    pub fn is_joined(&self) -> bool {
        self.session.is_joined()
    }

    #[allow(missing_docs)]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Live MAC parameters.
    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    #[allow(missing_docs)]
    pub fn class(&self) -> DeviceClass {
        self.class
    }

    #[allow(missing_docs)]
    pub fn crypto(&self) -> &Crypto {
        &self.crypto
    }

    #[allow(missing_docs)]
    pub fn channel_plan(&self) -> &C {
        &self.channel_plan
    }

    /// Largest application payload the next uplink can carry next to the queued MAC
    /// commands.
    pub fn max_app_payload(&self) -> usize {
        (R::max_payload(self.configuration.tx_data_rate) as usize).saturating_sub(self.commands.fopts_len())
    }

    /// Record a radio completion. `now` is the time of the event.
    pub fn on_radio_event(&mut self, event: RadioEvent<'_>, now: u64) {
        let completion = match event {
            RadioEvent::TxDone => Completion::TxDone { at: now },
            RadioEvent::TxTimeout => Completion::TxTimeout,
            RadioEvent::RxDone(data, quality) => {
                self.rx_buffer.clear();
                match self.rx_buffer.extend_from_slice(data) {
                    Ok(()) => Completion::RxDone { at: now, quality },
                    Err(_) => Completion::RxError,
                }
            }
            RadioEvent::RxTimeout => Completion::RxTimeout,
            RadioEvent::RxError => Completion::RxError,
        };
        self.completion = Some(completion);
    }

    /// Record a timer expiry.
    pub fn on_timer_event(&mut self, id: TimerId) {
        self.timer_events |= id.bit();
    }

    /// Handle recorded events and deliver confirms and indications.
    pub fn process<D, P>(&mut self, device: &mut D, primitives: &mut P) -> Result<(), crate::Error<D>>
    where
        D: Device,
        P: Primitives,
    {
        if let Some(completion) = self.completion.take() {
            self.on_completion(device, primitives, completion)?;
        }
        for id in TimerId::ALL {
            if self.timer_events & id.bit() != 0 {
                self.timer_events &= !id.bit();
                self.on_timer(device, primitives, id)?;
            }
        }
        for indication in core::mem::take(&mut self.indications) {
            primitives.mlme_indication(&indication);
        }
        while let Some(entry) = self.confirm_queue.pop_ready() {
            let mut confirm = MlmeConfirm::new(entry.request, entry.status);
            match entry.request {
                MlmeType::LinkCheck => (confirm.demod_margin, confirm.nb_gateways) = self.link_check,
                MlmeType::Join => {
                    confirm.nb_retries = self.join_attempts;
                    if entry.status == EventStatus::Ok {
                        self.join_attempts = 0;
                    }
                }
                _ => {}
            }
            primitives.mlme_confirm(&confirm);
        }
        if !self.dirty.is_empty() {
            primitives.nvm_data_change(self.dirty);
            self.dirty = NvmGroups::NONE;
        }
        Ok(())
    }

    /// Send application data.
    pub fn mcps_request<D: Device>(
        &mut self,
        device: &mut D,
        request: &McpsRequest<'_>,
    ) -> Result<(), crate::Error<D>> {
        if self.is_busy() {
            return Err(Error::Busy.into());
        }
        let (mtype, port, payload) = match *request {
            McpsRequest::Unconfirmed { port, payload } => (MType::UnconfirmedDataUp, port, payload),
            McpsRequest::Confirmed { port, payload } => (MType::ConfirmedDataUp, port, payload),
            McpsRequest::Proprietary { payload } => return self.send_proprietary(device, payload),
        };
        if !self.session.is_joined() {
            return Err(Error::NoNetworkJoined.into());
        }
        if !APP_PORTS.contains(&port) {
            return Err(Error::ParameterInvalid.into());
        }
        let adr = self.adr_next::<D>();
        let max_payload = R::max_payload(adr.data_rate) as usize;
        if payload.len() > max_payload {
            return Err(Error::LengthError.into());
        }
        self.apply_adr(&adr);
        if payload.len() + self.commands.fopts_len() > max_payload {
            debug!("payload of {} bytes skipped for mac commands", payload.len());
            self.prepare_data::<D>(MType::UnconfirmedDataUp, None, &[], None, &adr)?;
            self.schedule_first(device)?;
            return Err(Error::SkippedAppData.into());
        }
        let fport = (!payload.is_empty()).then_some(port);
        self.prepare_data::<D>(mtype, fport, payload, Some(request.kind()), &adr)?;
        self.schedule_first(device)
    }

    /// Start a management operation.
    pub fn mlme_request<D: Device>(&mut self, device: &mut D, request: &MlmeRequest) -> Result<(), crate::Error<D>> {
        match *request {
            MlmeRequest::DeriveMcKeKey => {
                self.confirm_queue.add(MlmeType::DeriveMcKeKey, true).map_err(Error::from)?;
                let status = match self.crypto.derive_mc_ke_key() {
                    Ok(()) => EventStatus::Ok,
                    Err(_) => EventStatus::Error,
                };
                self.dirty |= NvmGroups::SECURE_ELEMENT;
                self.confirm_queue.set_status(MlmeType::DeriveMcKeKey, status);
                return Ok(());
            }
            MlmeRequest::DeriveMcKeyPair { group } => {
                let Some(channel) = self.multicast.get(group as usize).copied().flatten() else {
                    return Err(Error::ParameterInvalid.into());
                };
                self.confirm_queue.add(MlmeType::DeriveMcKeyPair, true).map_err(Error::from)?;
                let status = match self.crypto.derive_mc_session_key_pair(group, channel.address) {
                    Ok(()) => EventStatus::Ok,
                    Err(_) => EventStatus::Error,
                };
                self.dirty |= NvmGroups::SECURE_ELEMENT;
                self.confirm_queue.set_status(MlmeType::DeriveMcKeyPair, status);
                return Ok(());
            }
            _ => {}
        }
        if self.is_busy() {
            return Err(Error::Busy.into());
        }
        match *request {
            MlmeRequest::Join => self.join_request(device),
            MlmeRequest::LinkCheck => self.queue_command(MlmeType::LinkCheck, UplinkCommand::LinkCheckReq),
            MlmeRequest::DeviceTime => self.queue_command(MlmeType::DeviceTime, UplinkCommand::DeviceTimeReq),
            MlmeRequest::PingSlotInfo { periodicity } => {
                if periodicity > 7 {
                    return Err(Error::ParameterInvalid.into());
                }
                self.queue_command(MlmeType::PingSlotInfo, UplinkCommand::PingSlotInfoReq { periodicity })?;
                self.class_b.pending_periodicity = Some(periodicity);
                self.class_b.ping_slot_info_answered = false;
                Ok(())
            }
            MlmeRequest::BeaconAcquisition => {
                if !self.session.is_joined() {
                    return Err(Error::NoNetworkJoined.into());
                }
                self.confirm_queue.add(MlmeType::BeaconAcquisition, true).map_err(Error::from)?;
                if let Err(err) = self.start_beacon_acquisition(device) {
                    self.confirm_queue.remove_last();
                    return Err(err);
                }
                Ok(())
            }
            MlmeRequest::TxCw { frequency, power, timeout_s } => {
                if !R::verify_rx_frequency(frequency) {
                    return Err(Error::ParameterInvalid.into());
                }
                self.confirm_queue.add(MlmeType::TxCw, true).map_err(Error::from)?;
                device.radio().standby().map_err(DeviceError::<D>::Radio)?;
                device
                    .radio()
                    .set_tx_continuous_wave(frequency, power, timeout_s)
                    .map_err(DeviceError::<D>::Radio)?;
                device
                    .timer()
                    .start(TimerId::RadioWatchdog, timeout_s as u32 * 1000)
                    .map_err(DeviceError::<D>::Timer)?;
                self.rx_slot = None;
                self.state = State::TxCw;
                Ok(())
            }
            MlmeRequest::DeriveMcKeKey | MlmeRequest::DeriveMcKeyPair { .. } => Ok(()),
        }
    }

    /// Switch the device class. Class B needs a session and a locked beacon, and classes B
    /// and C can only be left towards class A.
    pub fn set_class<D: Device>(&mut self, device: &mut D, class: DeviceClass) -> Result<(), crate::Error<D>> {
        if class == self.class {
            return Ok(());
        }
        match (self.class, class) {
            (DeviceClass::A, DeviceClass::B) => {
                if !self.session.is_joined() || self.class_b.state != class_b::BeaconState::Locked {
                    return Err(Error::ParameterInvalid.into());
                }
            }
            (DeviceClass::A, DeviceClass::C) | (_, DeviceClass::A) => {}
            _ => return Err(Error::ParameterInvalid.into()),
        }
        info!("class {:?} -> {:?}", self.class, class);
        self.class = class;
        self.dirty |= NvmGroups::MAC_GROUP2;
        if class != DeviceClass::B {
            device.timer().stop(TimerId::PingSlot).map_err(DeviceError::<D>::Timer)?;
            self.class_b.next_ping_slot = None;
        }
        if !self.is_busy() {
            self.resume_reception(device)?;
        }
        Ok(())
    }

    /// Snapshot of everything persisted.
    pub fn persistent_context(&self) -> PersistentContext<C> {
        PersistentContext {
            crypto: self.crypto.nvm,
            mac_group1: MacGroup1 {
                adr_ack_counter: self.adr_ack_counter,
                ack_next: self.ack_next,
                tx_data_rate: Some(self.configuration.tx_data_rate),
                tx_power: self.configuration.tx_power,
            },
            mac_group2: MacGroup2 {
                configuration: self.configuration,
                defaults: self.defaults,
                session: self.session,
                class: self.class,
                multicast: self.multicast,
            },
            secure_element: SecureElementNvm { keys: self.crypto.keys.clone(), credentials: self.credentials },
            region_group1: self.bands.clone(),
            region_group2: self.channel_plan.clone(),
            class_b: self.class_b_params,
        }
    }

    /// Write the given groups to the device store.
    pub fn save<D: Device>(&self, device: &mut D, groups: NvmGroups) -> Result<(), crate::Error<D>> {
        self.persistent_context().save(device, groups)
    }

    /// Groups changed by requests since the last [`Mac::process`], cleared by the call.
    pub fn take_dirty(&mut self) -> NvmGroups {
        core::mem::take(&mut self.dirty)
    }

    /// Load every valid stored group. Class B is not resumed, a restored class B device
    /// comes back in class A until the beacon is acquired again.
    pub fn restore<D: Device>(&mut self, device: &mut D) -> Result<NvmGroups, crate::Error<D>> {
        let mut context = self.persistent_context();
        let restored = context.restore(device)?;
        if restored.contains(NvmGroups::CRYPTO) {
            self.crypto.nvm = context.crypto;
        }
        if restored.contains(NvmGroups::SECURE_ELEMENT) {
            self.crypto.keys = context.secure_element.keys;
            self.credentials = context.secure_element.credentials;
        }
        if restored.contains(NvmGroups::MAC_GROUP2) {
            let group = context.mac_group2;
            self.configuration = group.configuration;
            self.defaults = group.defaults;
            self.session = group.session;
            self.class = match group.class {
                DeviceClass::B => DeviceClass::A,
                class => class,
            };
            self.multicast = group.multicast;
        }
        // Group 1 is written more often than group 2 and wins for datarate and power.
        if restored.contains(NvmGroups::MAC_GROUP1) {
            let group = context.mac_group1;
            self.adr_ack_counter = group.adr_ack_counter;
            self.ack_next = group.ack_next;
            if let Some(dr) = group.tx_data_rate {
                self.configuration.tx_data_rate = dr;
            }
            self.configuration.tx_power = group.tx_power;
        }
        if restored.contains(NvmGroups::REGION_GROUP1) {
            self.bands = context.region_group1;
        }
        if restored.contains(NvmGroups::REGION_GROUP2) {
            self.channel_plan = context.region_group2;
        }
        if restored.contains(NvmGroups::CLASS_B) {
            self.class_b_params = context.class_b;
        }
        debug!("restored nvm groups {:?}", restored);
        Ok(restored)
    }

    fn queue_command<D: Device>(&mut self, mlme: MlmeType, cmd: UplinkCommand) -> Result<(), crate::Error<D>> {
        self.confirm_queue.add(mlme, false).map_err(Error::from)?;
        if let Err(err) = self.commands.push(cmd) {
            self.confirm_queue.remove_last();
            return Err(Error::from(err).into());
        }
        Ok(())
    }

    fn min_tx_data_rate<D: Device>() -> DR {
        match D::min_data_rate() {
            Some(dr) => dr.max(R::min_tx_data_rate()),
            None => R::min_tx_data_rate(),
        }
    }

    fn adr_next<D: Device>(&self) -> AdrNext {
        adr::next(&AdrParams {
            adr_enabled: self.configuration.adr_enabled,
            ack_counter: self.adr_ack_counter,
            ack_limit: self.configuration.adr_ack_limit,
            ack_delay: self.configuration.adr_ack_delay,
            data_rate: self.configuration.tx_data_rate,
            tx_power: self.configuration.tx_power,
            min_data_rate: Self::min_tx_data_rate::<D>(),
        })
    }

    fn apply_adr(&mut self, adr: &AdrNext) {
        if adr.data_rate != self.configuration.tx_data_rate || adr.tx_power != self.configuration.tx_power {
            self.configuration.tx_data_rate = adr.data_rate;
            self.configuration.tx_power = adr.tx_power;
            self.dirty |= NvmGroups::MAC_GROUP1;
        }
        if adr.restore_default_channels {
            self.channel_plan.init_defaults(InitType::Mask);
            self.configuration.number_of_transmissions = 1;
            self.dirty |= NvmGroups::MAC_GROUP2 | NvmGroups::REGION_GROUP2;
        }
    }

    /// Build and secure a data frame as the pending uplink.
    fn prepare_data<D: Device>(
        &mut self,
        mtype: MType,
        port: Option<u8>,
        payload: &[u8],
        mcps: Option<McpsType>,
        adr: &AdrNext,
    ) -> Result<(), crate::Error<D>> {
        let max_payload = R::max_payload(adr.data_rate) as usize;
        let mut fopts: Vec<u8, MAX_FOPTS_LEN> = Vec::new();
        let mut port_commands: Vec<u8, MAC_COMMAND_BUFFER_LEN> = Vec::new();
        let (port, payload, mac_commands) = if port.is_none() && self.commands.encoded_len() > MAX_FOPTS_LEN {
            let count = self.commands.serialize(max_payload, &mut port_commands).map_err(Error::from)?;
            (Some(0), port_commands.as_slice(), count)
        } else {
            let room = MAX_FOPTS_LEN.min(max_payload.saturating_sub(payload.len()));
            let count = self.commands.serialize(room, &mut fopts).map_err(Error::from)?;
            (port, payload, count)
        };
        let mut fctrl = FCtrl::default();
        fctrl
            .set_adr(self.configuration.adr_enabled)
            .set_adr_ack_req(adr.adr_ack_req)
            .set_ack(self.ack_next)
            .set_class_b(self.class == DeviceClass::B);
        let fcnt = self.crypto.next_fcnt_up().map_err(|_| Error::FCntExhausted)?;
        self.dirty |= NvmGroups::CRYPTO;
        let mut buf = RadioBuffer::new();
        DataUplink {
            mtype,
            dev_addr: self.session.dev_addr,
            fctrl,
            fcnt,
            fopts: &fopts,
            fport: port,
            payload,
        }
        .write(&mut buf)
        .map_err(Error::Frame)?;
        self.crypto.secure_uplink(&mut buf, self.session.dev_addr, fcnt)?;

        let mut uplink = PendingUplink::new(buf, Frame::Data, adr.data_rate, adr.tx_power);
        uplink.mcps = mcps;
        uplink.fcnt = fcnt;
        uplink.mac_commands = mac_commands;
        uplink.max_transmissions = match mtype {
            MType::ConfirmedDataUp => MAX_ACK_RETRIES,
            _ => self.configuration.number_of_transmissions.max(1),
        };
        trace!("uplink fcnt {} with {} mac commands", fcnt, mac_commands);
        self.uplink = Some(uplink);
        Ok(())
    }

    fn send_proprietary<D: Device>(&mut self, device: &mut D, payload: &[u8]) -> Result<(), crate::Error<D>> {
        if payload.len() > R::max_payload(self.configuration.tx_data_rate) as usize {
            return Err(Error::LengthError.into());
        }
        let mut buf = RadioBuffer::new();
        DataUplink {
            mtype: MType::Proprietary,
            dev_addr: 0,
            fctrl: FCtrl::default(),
            fcnt: 0,
            fopts: &[],
            fport: None,
            payload,
        }
        .write(&mut buf)
        .map_err(|_| Error::LengthError)?;
        let mut uplink =
            PendingUplink::new(buf, Frame::Data, self.configuration.tx_data_rate, self.configuration.tx_power);
        uplink.mcps = Some(McpsType::Proprietary);
        uplink.fcnt = self.crypto.fcnt_up();
        self.uplink = Some(uplink);
        self.schedule_first(device)
    }

    fn reset_for_join(&mut self) {
        let kept = self.configuration;
        self.configuration = Configuration {
            adr_enabled: kept.adr_enabled,
            public_network: kept.public_network,
            duty_cycle_enabled: kept.duty_cycle_enabled,
            antenna_gain: kept.antenna_gain,
            max_eirp: kept.max_eirp,
            system_max_rx_error: kept.system_max_rx_error,
            min_rx_symbols: kept.min_rx_symbols,
            ..self.defaults
        };
        self.adr_ack_counter = 0;
        self.ack_next = false;
        self.commands.clear();
    }

    fn join_request<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        if self.session.activation == Activation::Abp {
            self.confirm_queue.add(MlmeType::Join, true).map_err(Error::from)?;
            self.confirm_queue.set_status(MlmeType::Join, EventStatus::Ok);
            return Ok(());
        }
        self.confirm_queue.add(MlmeType::Join, true).map_err(Error::from)?;
        let now = device.timer().now();
        self.reset_for_join();
        if self.join_attempts == 0 {
            self.channel_plan.init_defaults(InitType::Channels);
            self.dirty |= NvmGroups::REGION_GROUP2;
        }
        if self.join_start.is_none() {
            self.join_start = Some(now);
        }
        self.session = Session::default();
        self.dirty |= NvmGroups::MAC_GROUP2;

        let dev_nonce = match self.crypto.next_dev_nonce() {
            Ok(nonce) => nonce,
            Err(err) => {
                self.confirm_queue.remove_last();
                return Err(err.into());
            }
        };
        self.dirty |= NvmGroups::CRYPTO;
        let mut buf = RadioBuffer::new();
        frame::write_join_request(&mut buf, &self.credentials.join_eui, &self.credentials.dev_eui, dev_nonce)
            .map_err(Error::Frame)?;
        self.crypto.secure_join_request(&mut buf)?;
        let data_rate = R::join_data_rate(self.join_attempts);
        let uplink = PendingUplink::new(buf, Frame::Join, data_rate, 0);
        debug!("join request, dev_nonce {}, attempt {}", dev_nonce, self.join_attempts);
        self.uplink = Some(uplink);
        if let Err(err) = self.schedule_first(device) {
            self.confirm_queue.remove_last();
            return Err(err);
        }
        Ok(())
    }

    fn duty_cycle_context(&self, now: u64) -> DutyCycleContext {
        DutyCycleContext {
            now,
            joined: self.session.is_joined(),
            duty_cycle_enabled: self.configuration.duty_cycle_enabled,
            elapsed_since_start: self.join_start.map(|start| now.saturating_sub(start)).unwrap_or(0),
        }
    }

    /// First transmission of a new uplink. A failure drops the uplink, the caller retries.
    fn schedule_first<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        let result = self.schedule_tx(device);
        if result.is_err() {
            // A counter handed to the crypto service stays consumed.
            self.uplink = None;
            self.state = State::Idle;
        }
        result
    }

    /// Pick a channel and hand the pending uplink to the radio.
    fn schedule_tx<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        let now = device.timer().now();
        let random = device.rng().next_u32().map_err(DeviceError::<D>::Rng)?;
        let duty_cycle = self.duty_cycle_context(now);
        let max_eirp = self.configuration.max_eirp.min(D::max_eirp());
        let antenna_gain = self.configuration.antenna_gain;
        let Some(uplink) = self.uplink.as_mut() else {
            return Ok(());
        };
        let rf = RfConfig {
            frequency: 0,
            coding_rate: R::default_coding_rate(),
            data_rate: R::convert_data_rate(uplink.data_rate)?,
        };
        let toa_ms = device.radio().time_on_air(&rf, LORA_PREAMBLE_LEN, uplink.buf.len());
        let params = NextChannelParams { data_rate: uplink.data_rate, frame: uplink.frame, toa_ms, duty_cycle };
        let index = self.channel_plan.next_channel(&mut self.bands, &params, random).map_err(channel_error)?;
        let channel = *self.channel_plan.channel(index).ok_or(Error::NoFreeChannelFound)?;
        let power = match uplink.frame {
            Frame::Join => 0,
            Frame::Data => uplink.tx_power,
        };
        let tx = region::tx_config::<R>(channel.frequency(), uplink.data_rate, power, max_eirp, antenna_gain)?;
        uplink.channel = index;
        uplink.toa_ms = toa_ms;
        uplink.rx1 = RxChannelParams {
            frequency: channel.rx1_frequency(),
            data_rate: R::get_rx1_dr(uplink.data_rate, self.configuration.rx1_data_rate_offset)?,
        };

        let radio = device.radio();
        radio.standby().map_err(DeviceError::<D>::Radio)?;
        radio.set_channel(channel.frequency()).map_err(DeviceError::<D>::Radio)?;
        radio.set_tx_config(&tx).map_err(DeviceError::<D>::Radio)?;
        radio.send(uplink.buf.as_ref()).map_err(DeviceError::<D>::Radio)?;
        device
            .timer()
            .start(TimerId::RadioWatchdog, TX_TIMEOUT_MS + toa_ms)
            .map_err(DeviceError::<D>::Timer)?;
        trace!(
            "tx on channel {} at {} Hz, {:?}, {} ms",
            index,
            channel.frequency(),
            uplink.data_rate,
            toa_ms
        );
        self.rx_slot = None;
        self.state = State::Tx;
        Ok(())
    }

    /// Retransmission of the pending uplink. Without duty cycle credit it is postponed.
    fn retransmit<D, P>(&mut self, device: &mut D, primitives: &mut P) -> Result<(), crate::Error<D>>
    where
        D: Device,
        P: Primitives,
    {
        match self.schedule_tx(device) {
            Ok(()) => Ok(()),
            Err(crate::Error::Mac(Error::DutyCycleRestricted { wait_ms })) => {
                debug!("retransmission delayed by {} ms", wait_ms);
                device
                    .timer()
                    .start(TimerId::TxDelayed, wait_ms.min(u32::MAX as u64) as u32)
                    .map_err(DeviceError::<D>::Timer)?;
                self.state = State::RetryDelay;
                Ok(())
            }
            Err(err) => {
                self.complete_cycle(device, primitives, EventStatus::Error)?;
                Err(err)
            }
        }
    }

    /// End of the receive windows of a transmission.
    fn finish_cycle<D, P>(
        &mut self,
        device: &mut D,
        primitives: &mut P,
        status: EventStatus,
    ) -> Result<(), crate::Error<D>>
    where
        D: Device,
        P: Primitives,
    {
        let Some(uplink) = self.uplink.as_mut() else {
            self.state = State::Idle;
            return self.resume_reception(device);
        };
        let done = match uplink.frame {
            Frame::Join => true,
            Frame::Data if uplink.is_confirmed() => uplink.ack_received,
            Frame::Data => uplink.downlink_received,
        };
        if done || uplink.transmissions >= uplink.max_transmissions {
            return self.complete_cycle(device, primitives, status);
        }
        if !uplink.is_confirmed() {
            return self.retransmit(device, primitives);
        }
        if self.configuration.adr_enabled {
            let (dr, power) = adr::retry_step(
                uplink.transmissions,
                uplink.data_rate,
                uplink.tx_power,
                Self::min_tx_data_rate::<D>(),
            );
            uplink.data_rate = dr;
            uplink.tx_power = power;
            if (dr, power) != (self.configuration.tx_data_rate, self.configuration.tx_power) {
                self.configuration.tx_data_rate = dr;
                self.configuration.tx_power = power;
                self.dirty |= NvmGroups::MAC_GROUP1;
            }
        }
        let max_len = R::max_payload(uplink.data_rate) as usize + FRAME_PAYLOAD_OVERHEAD as usize;
        if uplink.buf.len() > max_len {
            return self.complete_cycle(device, primitives, EventStatus::TxDrPayloadSizeError);
        }
        let delay = device
            .rng()
            .next_in(ACK_TIMEOUT_MS - 1000, ACK_TIMEOUT_MS + 1000)
            .map_err(DeviceError::<D>::Rng)?;
        device.timer().start(TimerId::AckTimeout, delay).map_err(DeviceError::<D>::Timer)?;
        self.state = State::RetryDelay;
        Ok(())
    }

    /// Deliver the result of the cycle and go back to idle reception.
    fn complete_cycle<D, P>(
        &mut self,
        device: &mut D,
        primitives: &mut P,
        status: EventStatus,
    ) -> Result<(), crate::Error<D>>
    where
        D: Device,
        P: Primitives,
    {
        self.state = State::Idle;
        if let Some(uplink) = self.uplink.take() {
            match uplink.frame {
                Frame::Join => {
                    if !self.session.is_joined() {
                        let status = match status {
                            EventStatus::TxTimeout => EventStatus::TxTimeout,
                            _ => EventStatus::JoinFail,
                        };
                        debug!("join attempt {} failed: {:?}", self.join_attempts, status);
                        self.confirm_queue.set_status(MlmeType::Join, status);
                    }
                }
                Frame::Data => {
                    let status = match status {
                        EventStatus::Ok => EventStatus::Ok,
                        _ if uplink.ack_received => EventStatus::Ok,
                        _ if !uplink.is_confirmed() && status != EventStatus::TxTimeout => EventStatus::Ok,
                        status => status,
                    };
                    let common = if uplink.downlink_received { EventStatus::Ok } else { status };
                    self.confirm_queue.set_common_status(common);
                    if let Some(mcps) = uplink.mcps {
                        primitives.mcps_confirm(&McpsConfirm {
                            mcps,
                            status,
                            data_rate: uplink.data_rate,
                            tx_power: uplink.tx_power,
                            ack_received: uplink.ack_received,
                            nb_trans: uplink.transmissions,
                            uplink_counter: uplink.fcnt,
                            tx_time_on_air: uplink.toa_ms,
                            channel: uplink.channel as u8,
                        });
                    }
                }
            }
        }
        self.resume_reception(device)
    }

    fn on_completion<D, P>(
        &mut self,
        device: &mut D,
        primitives: &mut P,
        completion: Completion,
    ) -> Result<(), crate::Error<D>>
    where
        D: Device,
        P: Primitives,
    {
        match completion {
            Completion::TxDone { at } => self.on_tx_done(device, at),
            Completion::TxTimeout => {
                device.timer().stop(TimerId::RadioWatchdog).map_err(DeviceError::<D>::Timer)?;
                match self.state {
                    State::TxCw => self.end_tx_cw(device),
                    State::Tx => {
                        warn!("tx timeout");
                        self.complete_cycle(device, primitives, EventStatus::TxTimeout)
                    }
                    _ => Ok(()),
                }
            }
            Completion::RxDone { at, quality } => self.on_rx_done(device, primitives, at, quality),
            Completion::RxTimeout => self.on_rx_failed(device, primitives, false),
            Completion::RxError => self.on_rx_failed(device, primitives, true),
        }
    }

    fn on_timer<D, P>(&mut self, device: &mut D, primitives: &mut P, id: TimerId) -> Result<(), crate::Error<D>>
    where
        D: Device,
        P: Primitives,
    {
        match id {
            TimerId::Rx1 => self.open_rx1(device),
            TimerId::Rx2 => self.open_rx2(device),
            TimerId::TxDelayed | TimerId::AckTimeout => {
                if self.state == State::RetryDelay {
                    self.retransmit(device, primitives)
                } else {
                    Ok(())
                }
            }
            TimerId::RadioWatchdog => match self.state {
                State::TxCw => self.end_tx_cw(device),
                State::Tx => {
                    warn!("radio watchdog expired during tx");
                    device.radio().standby().map_err(DeviceError::<D>::Radio)?;
                    self.complete_cycle(device, primitives, EventStatus::TxTimeout)
                }
                _ => Ok(()),
            },
            TimerId::Beacon => self.on_beacon_timer(device),
            TimerId::PingSlot => self.on_ping_slot_timer(device),
        }
    }

    fn on_tx_done<D: Device>(&mut self, device: &mut D, at: u64) -> Result<(), crate::Error<D>> {
        device.timer().stop(TimerId::RadioWatchdog).map_err(DeviceError::<D>::Timer)?;
        if self.state == State::TxCw {
            return self.end_tx_cw(device);
        }
        if self.state != State::Tx {
            return Ok(());
        }
        let duty_cycle = self.duty_cycle_context(at);
        let max_duty_cycle = self.configuration.max_duty_cycle;
        let Some(uplink) = self.uplink.as_mut() else {
            self.state = State::Idle;
            return Ok(());
        };
        if let Some(channel) = self.channel_plan.channel(uplink.channel) {
            self.bands.consume(channel.band(), uplink.toa_ms, max_duty_cycle, &duty_cycle);
            self.dirty |= NvmGroups::REGION_GROUP1;
        }
        uplink.transmissions += 1;
        uplink.tx_done_at = at;
        match uplink.frame {
            Frame::Join => self.join_attempts = self.join_attempts.saturating_add(1),
            Frame::Data if uplink.transmissions == 1 && uplink.mcps != Some(McpsType::Proprietary) => {
                self.commands.on_sent(uplink.mac_commands);
                self.ack_next = false;
                self.adr_ack_counter = self.adr_ack_counter.saturating_add(1);
                self.dirty |= NvmGroups::MAC_GROUP1;
            }
            Frame::Data => {}
        }
        let (frame, rx1_dr) = (uplink.frame, uplink.rx1.data_rate);
        let (delay1, delay2) = match frame {
            Frame::Join => (self.configuration.join_accept_delay1, self.configuration.join_accept_delay2),
            Frame::Data => (self.configuration.receive_delay1, self.configuration.receive_delay2),
        };
        let wakeup = device.radio().wakeup_time_ms();
        let rx1_at = window_start(at, delay1, self.window_offset(rx1_dr, wakeup)?);
        let rx2_at = window_start(at, delay2, self.window_offset(self.configuration.rx2.data_rate, wakeup)?);
        start_timer_at(device, TimerId::Rx1, rx1_at)?;
        start_timer_at(device, TimerId::Rx2, rx2_at)?;
        self.state = State::WaitRx1;
        if self.class == DeviceClass::C {
            self.open_rxc(device)?;
        } else {
            self.rx_slot = None;
            device.radio().sleep().map_err(DeviceError::<D>::Radio)?;
        }
        Ok(())
    }

    fn end_tx_cw<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        device.timer().stop(TimerId::RadioWatchdog).map_err(DeviceError::<D>::Timer)?;
        self.confirm_queue.set_status(MlmeType::TxCw, EventStatus::Ok);
        self.state = State::Idle;
        self.resume_reception(device)
    }
}

fn window_start(tx_done: u64, delay_ms: u32, offset_ms: i32) -> u64 {
    (tx_done as i64 + delay_ms as i64 + offset_ms as i64).max(0) as u64
}

fn start_timer_at<D: Device>(device: &mut D, id: TimerId, at: u64) -> Result<(), crate::Error<D>> {
    let timer = device.timer();
    let duration = at.saturating_sub(timer.now()).min(u32::MAX as u64) as u32;
    timer.start(id, duration).map_err(DeviceError::<D>::Timer)?;
    Ok(())
}
