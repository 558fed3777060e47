//! Receive windows and downlink processing: RX1/RX2, the class C window, class B beacons and
//! ping slots, MAC commands from the network.

use heapless::Vec;

use super::class_b::{self, BeaconState, TimeReference};
use super::class_b::{BEACON_ACQUISITION_GUARD_MS, BEACON_INTERVAL_MS, BEACON_RX_GUARD_MS};
use super::commands::{self, DownlinkCommand, LinkAdrReq, UplinkCommand};
use super::crypto::{AddressId, FCntId};
use super::frame::{self, DataFrame, PhyPayload};
use super::multicast;
use super::nvm::NvmGroups;
use super::primitives::{EventStatus, McpsIndication, McpsType, MlmeIndication, MlmeType, Primitives};
use super::region::channel_plan::ChannelPlan;
use super::region::{self, LinkAdrParams, Region, RxWindowParams, VerifyAttribute};
use super::types::{Activation, DeviceClass, Frame, RxChannelParams, Session, Window, DR};
use super::{start_timer_at, Mac, RxSlot, State, MAX_PHY_PAYLOAD_LEN};
use crate::device::radio::types::{RfConfig, RxConfig, RxQuality};
use crate::device::radio::Radio;
use crate::device::timer::{Timer, TimerId};
use crate::device::{self, Device, Error as DeviceError};

/// Preamble symbols of a beacon.
const BEACON_PREAMBLE_LEN: u16 = 10;
/// LinkADRReq commands handled as one block.
const MAX_LINK_ADR_BLOCK: usize = 16;
/// Radiated power of the TXParamSetupReq MaxEIRP field.
const MAX_EIRP_TABLE: [i8; 16] = [8, 10, 12, 13, 14, 16, 18, 20, 21, 24, 26, 27, 29, 30, 33, 36];

impl<R, C> Mac<R, C>
where
    R: Region,
    C: ChannelPlan<R>,
{
    pub(super) fn window_offset(&self, data_rate: DR, wakeup_ms: u32) -> Result<i32, region::Error> {
        let datarate = R::convert_data_rate(data_rate)?;
        Ok(region::compute_rx_window_params(
            &datarate,
            self.configuration.min_rx_symbols,
            self.configuration.system_max_rx_error,
            wakeup_ms,
        )
        .offset_ms)
    }

    fn open_rx<D: Device>(
        &mut self,
        device: &mut D,
        window: Window,
        channel: RxChannelParams,
        continuous: bool,
    ) -> Result<(), crate::Error<D>> {
        let datarate = R::convert_data_rate(channel.data_rate)?;
        let params = region::compute_rx_window_params(
            &datarate,
            self.configuration.min_rx_symbols,
            self.configuration.system_max_rx_error,
            device.radio().wakeup_time_ms(),
        );
        let config = region::rx_config::<R>(channel.frequency, channel.data_rate, &params, continuous)?;
        let timeout = if continuous { 0 } else { self.configuration.max_rx_window };
        self.start_rx(device, RxSlot { window, data_rate: channel.data_rate }, &config, timeout)
    }

    fn start_rx<D: Device>(
        &mut self,
        device: &mut D,
        slot: RxSlot,
        config: &RxConfig,
        timeout_ms: u32,
    ) -> Result<(), crate::Error<D>> {
        let radio = device.radio();
        radio.standby().map_err(DeviceError::<D>::Radio)?;
        radio.set_channel(config.rf.frequency).map_err(DeviceError::<D>::Radio)?;
        radio.set_rx_config(config).map_err(DeviceError::<D>::Radio)?;
        radio.rx(timeout_ms).map_err(DeviceError::<D>::Radio)?;
        trace!("rx {:?} at {} Hz", slot.window, config.rf.frequency);
        self.rx_slot = Some(slot);
        Ok(())
    }

    pub(super) fn open_rxc<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        let rxc = self.configuration.rxc;
        self.open_rx(device, Window::C, rxc, true)
    }

    pub(super) fn open_rx1<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        if self.state != State::WaitRx1 {
            return Ok(());
        }
        let Some(rx1) = self.uplink.as_ref().map(|uplink| uplink.rx1) else {
            return Ok(());
        };
        self.state = State::Rx1;
        self.open_rx(device, Window::_1, rx1, false)
    }

    pub(super) fn open_rx2<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        if !matches!(self.state, State::WaitRx1 | State::Rx1 | State::WaitRx2) {
            return Ok(());
        }
        self.state = State::Rx2;
        let rx2 = self.configuration.rx2;
        self.open_rx(device, Window::_2, rx2, false)
    }

    /// Radio state between transmissions: RXC open in class C, next ping slot armed in
    /// class B, sleep in class A.
    pub(super) fn resume_reception<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        if self.rx_slot.is_some_and(|slot| slot.window == Window::Beacon) {
            return Ok(());
        }
        match self.class {
            DeviceClass::C => self.open_rxc(device),
            DeviceClass::B => {
                self.rx_slot = None;
                device.radio().sleep().map_err(DeviceError::<D>::Radio)?;
                self.schedule_ping_slot(device)
            }
            DeviceClass::A => {
                self.rx_slot = None;
                device.radio().sleep().map_err(DeviceError::<D>::Radio)?;
                Ok(())
            }
        }
    }

    /// Was the cycle waiting for something other than its receive windows?
    fn between_windows(&self) -> bool {
        matches!(self.state, State::Idle | State::WaitRx1 | State::WaitRx2 | State::RetryDelay)
    }

    pub(super) fn on_rx_failed<D, P>(
        &mut self,
        device: &mut D,
        primitives: &mut P,
        error: bool,
    ) -> Result<(), crate::Error<D>>
    where
        D: Device,
        P: Primitives,
    {
        let Some(slot) = self.rx_slot.take() else {
            return Ok(());
        };
        match slot.window {
            Window::_1 if self.state == State::Rx1 => self.after_rx1(device),
            Window::_2 if self.state == State::Rx2 => {
                let status = if error { EventStatus::Rx2Error } else { EventStatus::Rx2Timeout };
                self.finish_cycle(device, primitives, status)
            }
            Window::C if self.class == DeviceClass::C && self.between_windows() => self.open_rxc(device),
            Window::PingSlot => self.schedule_ping_slot(device),
            Window::Beacon => {
                let now = device.timer().now();
                self.on_beacon_missed(device, now)
            }
            _ => Ok(()),
        }
    }

    fn after_rx1<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        self.state = State::WaitRx2;
        if self.class == DeviceClass::C {
            self.open_rxc(device)
        } else {
            device.radio().sleep().map_err(DeviceError::<D>::Radio)?;
            Ok(())
        }
    }

    pub(super) fn on_rx_done<D, P>(
        &mut self,
        device: &mut D,
        primitives: &mut P,
        at: u64,
        quality: RxQuality,
    ) -> Result<(), crate::Error<D>>
    where
        D: Device,
        P: Primitives,
    {
        let Some(slot) = self.rx_slot.take() else {
            trace!("frame outside of a receive window dropped");
            return Ok(());
        };
        if slot.window == Window::Beacon {
            return self.on_beacon_received(device, at);
        }
        let accepted = self.handle_downlink(device, primitives, slot, quality)?;
        match slot.window {
            Window::_1 if self.state == State::Rx1 => {
                if accepted {
                    device.timer().stop(TimerId::Rx2).map_err(DeviceError::<D>::Timer)?;
                    self.finish_cycle(device, primitives, EventStatus::Ok)
                } else {
                    self.after_rx1(device)
                }
            }
            Window::_2 if self.state == State::Rx2 => {
                let status = if accepted { EventStatus::Ok } else { EventStatus::Rx2Error };
                self.finish_cycle(device, primitives, status)
            }
            Window::C if self.class == DeviceClass::C && self.between_windows() => self.open_rxc(device),
            Window::PingSlot => self.schedule_ping_slot(device),
            _ => Ok(()),
        }
    }

    /// Process a received frame, `true` when it was accepted.
    fn handle_downlink<D, P>(
        &mut self,
        device: &mut D,
        primitives: &mut P,
        slot: RxSlot,
        quality: RxQuality,
    ) -> Result<bool, crate::Error<D>>
    where
        D: Device,
        P: Primitives,
    {
        let mut data = [0u8; MAX_PHY_PAYLOAD_LEN];
        let len = self.rx_buffer.len();
        data[..len].copy_from_slice(self.rx_buffer.as_ref());
        let payload = match frame::parse(&data[..len]) {
            Ok(payload) => payload,
            Err(err) => {
                debug!("downlink dropped: {:?}", err);
                return Ok(false);
            }
        };
        match payload {
            PhyPayload::JoinAccept(bytes) => {
                let joining = self.uplink.as_ref().is_some_and(|uplink| uplink.frame == Frame::Join);
                if !joining || !matches!(slot.window, Window::_1 | Window::_2) {
                    debug!("unexpected join accept dropped");
                    return Ok(false);
                }
                Ok(self.accept_join(bytes))
            }
            PhyPayload::Proprietary(bytes) => {
                primitives.mcps_indication(&McpsIndication {
                    mcps: McpsType::Proprietary,
                    status: EventStatus::Ok,
                    multicast_group: None,
                    port: None,
                    payload: bytes,
                    rssi: quality.rssi(),
                    snr: quality.snr(),
                    rx_slot: slot.window,
                    rx_data_rate: slot.data_rate,
                    ack_received: false,
                    frame_pending: false,
                    uplink_counter: self.crypto.fcnt_up(),
                    downlink_counter: 0,
                    dev_addr: 0,
                });
                Ok(true)
            }
            PhyPayload::Data(frame) => self.handle_data_downlink(device, primitives, slot, quality, &frame),
        }
    }

    fn accept_join(&mut self, frame: &[u8]) -> bool {
        let dev_nonce = self.crypto.dev_nonce();
        let accept = match self.crypto.handle_join_accept(frame, dev_nonce) {
            Ok(accept) => accept,
            Err(err) => {
                debug!("join accept dropped: {:?}", err);
                return false;
            }
        };
        self.session = Session::new(accept.dev_addr, accept.net_id, Activation::Otaa);
        let rx1_dr_offset = accept.rx1_dr_offset();
        if region::verify::<R>(VerifyAttribute::Rx1DrOffset(rx1_dr_offset)) {
            self.configuration.rx1_data_rate_offset = rx1_dr_offset;
        }
        if let Ok(dr) = DR::try_from(accept.rx2_data_rate()) {
            if region::verify::<R>(VerifyAttribute::RxDr(dr)) {
                self.configuration.rx2.data_rate = dr;
                self.configuration.rxc.data_rate = dr;
            }
        }
        self.configuration.receive_delay1 = accept.rx_delay_s() as u32 * 1000;
        self.configuration.receive_delay2 = self.configuration.receive_delay1 + 1000;
        if let Some(cf_list) = accept.cf_list {
            if let Err(err) = self.channel_plan.apply_cf_list(&cf_list) {
                warn!("cf list ignored: {:?}", err);
            }
        }
        self.adr_ack_counter = 0;
        self.ack_next = false;
        self.join_start = None;
        self.dirty |= NvmGroups::ALL;
        self.confirm_queue.set_status(MlmeType::Join, EventStatus::Ok);
        if let Some(uplink) = self.uplink.as_mut() {
            uplink.downlink_received = true;
        }
        info!("joined as {}", accept.dev_addr);
        true
    }

    fn handle_data_downlink<D, P>(
        &mut self,
        device: &mut D,
        primitives: &mut P,
        slot: RxSlot,
        quality: RxQuality,
        frame: &DataFrame<'_>,
    ) -> Result<bool, crate::Error<D>>
    where
        D: Device,
        P: Primitives,
    {
        let address = if self.session.is_joined() && frame.dev_addr == self.session.dev_addr {
            AddressId::Unicast
        } else if let Some(group) = multicast::find_group(&self.multicast, frame.dev_addr) {
            AddressId::Multicast(group)
        } else {
            debug!("downlink for {} dropped", frame.dev_addr);
            return Ok(false);
        };
        if let AddressId::Multicast(_) = address {
            if frame.is_confirmed() || !frame.fopts.is_empty() || frame.fport == Some(0) || frame.fctrl.ack() {
                debug!("invalid multicast frame dropped");
                return Ok(false);
            }
        }
        if frame.fport == Some(0) && !frame.fopts.is_empty() {
            debug!("mac commands in both FOpts and FRMPayload, frame dropped");
            return Ok(false);
        }
        let mut payload = [0u8; MAX_PHY_PAYLOAD_LEN];
        let (fcnt, len) = match self.crypto.unsecure_downlink(frame, address, &mut payload) {
            Ok(result) => result,
            Err(err) => {
                debug!("downlink dropped: {:?}", err);
                return Ok(false);
            }
        };
        let (fcnt_id, multicast_group) = match address {
            AddressId::Unicast => (FCntId::Down, None),
            AddressId::Multicast(group) => {
                let accepts = self.multicast[group as usize].is_some_and(|channel| channel.accepts(fcnt));
                if !accepts {
                    debug!("multicast fcnt {} outside of the group window", fcnt);
                    return Ok(false);
                }
                (FCntId::McDown(group), Some(group))
            }
        };
        self.crypto.set_fcnt_down(fcnt_id, fcnt)?;
        self.dirty |= NvmGroups::CRYPTO;
        self.last_snr = quality.snr();

        let mut ack_received = false;
        let uplink_counter = match self.uplink.as_ref() {
            Some(uplink) => uplink.fcnt,
            None => self.crypto.fcnt_up().saturating_sub(1),
        };
        if address == AddressId::Unicast {
            self.adr_ack_counter = 0;
            self.ack_next = frame.is_confirmed();
            self.dirty |= NvmGroups::MAC_GROUP1;
            self.commands.remove_sticky();
            let mut tx_done_at = device.timer().now();
            if let Some(uplink) = self.uplink.as_mut() {
                uplink.downlink_received = true;
                tx_done_at = uplink.tx_done_at;
                if uplink.is_confirmed() && frame.fctrl.ack() {
                    uplink.ack_received = true;
                    ack_received = true;
                }
            }
            match frame.fport {
                Some(0) => self.handle_commands(device, &payload[..len], tx_done_at),
                _ => self.handle_commands(device, frame.fopts, tx_done_at),
            }
            if frame.fctrl.f_pending() || self.commands.has_sticky() {
                self.indicate(MlmeIndication::ScheduleUplink);
            }
        }

        let mcps = match (address, frame.is_confirmed()) {
            (AddressId::Multicast(_), _) => McpsType::Multicast,
            (_, true) => McpsType::Confirmed,
            (_, false) => McpsType::Unconfirmed,
        };
        let port = frame.fport.filter(|port| *port != 0);
        primitives.mcps_indication(&McpsIndication {
            mcps,
            status: EventStatus::Ok,
            multicast_group,
            port,
            payload: if port.is_some() { &payload[..len] } else { &[] },
            rssi: quality.rssi(),
            snr: quality.snr(),
            rx_slot: slot.window,
            rx_data_rate: slot.data_rate,
            ack_received,
            frame_pending: frame.fctrl.f_pending(),
            uplink_counter,
            downlink_counter: fcnt,
            dev_addr: frame.dev_addr,
        });
        Ok(true)
    }

    pub(super) fn indicate(&mut self, indication: MlmeIndication) {
        if self.indications.contains(&indication) {
            return;
        }
        if self.indications.push(indication).is_err() {
            warn!("indication dropped: {:?}", indication);
        }
    }

    fn answer(&mut self, cmd: UplinkCommand) {
        if self.commands.push(cmd).is_err() {
            warn!("mac command buffer full, {:?} dropped", cmd);
        }
    }

    /// Run the MAC commands of a downlink and queue their answers. `tx_done_at` is the end
    /// of the uplink that opened the window.
    fn handle_commands<D: Device>(&mut self, device: &mut D, data: &[u8], tx_done_at: u64) {
        let mut cmds = commands::parse_downlink(data).peekable();
        while let Some(cmd) = cmds.next() {
            trace!("handling command {:?}", cmd);
            let answer: Option<UplinkCommand> = match cmd {
                DownlinkCommand::LinkCheckAns { margin, gateway_count } => {
                    self.link_check = (margin, gateway_count);
                    self.confirm_queue.set_status(MlmeType::LinkCheck, EventStatus::Ok);
                    None
                }
                DownlinkCommand::LinkAdrReq(first) => {
                    let mut block: Vec<LinkAdrReq, MAX_LINK_ADR_BLOCK> = Vec::new();
                    let _ = block.push(first);
                    // check if next command is also a LinkADRReq, the block is processed at once
                    while let Some(&DownlinkCommand::LinkAdrReq(next)) = cmds.peek() {
                        cmds.next();
                        if block.push(next).is_err() {
                            warn!("LinkADRReq beyond {} ignored", MAX_LINK_ADR_BLOCK);
                        }
                    }
                    self.link_adr(&block);
                    None
                }
                DownlinkCommand::DutyCycleReq { max_duty_cycle } => {
                    self.configuration.max_duty_cycle = max_duty_cycle;
                    self.dirty |= NvmGroups::MAC_GROUP2;
                    Some(UplinkCommand::DutyCycleAns)
                }
                DownlinkCommand::RxParamSetupReq { rx1_dr_offset, rx2_data_rate, frequency } => {
                    let mut status = region::rx_param_setup_req::<R>(rx1_dr_offset, rx2_data_rate, frequency);
                    if !device::supports_frequency(device, frequency) {
                        debug!("rx2 frequency {} not supported by the device", frequency);
                        status &= !0x01;
                    }
                    if let (0x07, Ok(data_rate)) = (status, DR::try_from(rx2_data_rate)) {
                        self.configuration.rx1_data_rate_offset = rx1_dr_offset;
                        self.configuration.rx2 = RxChannelParams { frequency, data_rate };
                        self.configuration.rxc = self.configuration.rx2;
                        self.dirty |= NvmGroups::MAC_GROUP2;
                    }
                    Some(UplinkCommand::RxParamSetupAns(status))
                }
                DownlinkCommand::DevStatusReq => Some(UplinkCommand::DevStatusAns {
                    battery: device.battery_level().unwrap_or(255),
                    margin: self.last_snr.clamp(-32, 31),
                }),
                DownlinkCommand::NewChannelReq { index, frequency, min_dr, max_dr } => {
                    if frequency != 0 && !device::supports_frequency(device, frequency) {
                        debug!("channel frequency {} outside the device range", frequency);
                        // Evaluated on a copy, the plan stays untouched.
                        let status = self.channel_plan.clone().new_channel_req(index, frequency, min_dr, max_dr);
                        status.map(|status| UplinkCommand::NewChannelAns(status & 0x02))
                    } else {
                        let status = self.channel_plan.new_channel_req(index, frequency, min_dr, max_dr);
                        if status == Some(0x03) {
                            self.dirty |= NvmGroups::REGION_GROUP2;
                        }
                        status.map(UplinkCommand::NewChannelAns)
                    }
                }
                DownlinkCommand::RxTimingSetupReq { delay } => {
                    self.configuration.receive_delay1 = delay.max(1) as u32 * 1000;
                    self.configuration.receive_delay2 = self.configuration.receive_delay1 + 1000;
                    self.dirty |= NvmGroups::MAC_GROUP2;
                    Some(UplinkCommand::RxTimingSetupAns)
                }
                DownlinkCommand::TxParamSetupReq { downlink_dwell_time, uplink_dwell_time, max_eirp } => {
                    region::tx_param_setup_req::<R>().map(|_| {
                        self.configuration.downlink_dwell_time = downlink_dwell_time;
                        self.configuration.uplink_dwell_time = uplink_dwell_time;
                        self.configuration.max_eirp = MAX_EIRP_TABLE[(max_eirp & 0x0F) as usize];
                        self.dirty |= NvmGroups::MAC_GROUP2;
                        UplinkCommand::TxParamSetupAns
                    })
                }
                DownlinkCommand::DlChannelReq { index, frequency } => {
                    let status = if device::supports_frequency(device, frequency) {
                        self.channel_plan.dl_channel_req(index, frequency)
                    } else {
                        self.channel_plan.clone().dl_channel_req(index, frequency).map(|status| status & 0x02)
                    };
                    if status == Some(0x03) {
                        self.dirty |= NvmGroups::REGION_GROUP2;
                    }
                    status.map(UplinkCommand::DlChannelAns)
                }
                DownlinkCommand::DeviceTimeAns { seconds, fraction } => {
                    self.class_b.time_reference = Some(TimeReference::from_device_time(seconds, fraction, tx_done_at));
                    self.confirm_queue.set_status(MlmeType::DeviceTime, EventStatus::Ok);
                    None
                }
                DownlinkCommand::PingSlotInfoAns => {
                    if let Some(periodicity) = self.class_b.pending_periodicity.take() {
                        self.class_b_params.periodicity = periodicity;
                        self.dirty |= NvmGroups::CLASS_B;
                    }
                    self.class_b.ping_slot_info_answered = true;
                    self.confirm_queue.set_status(MlmeType::PingSlotInfo, EventStatus::Ok);
                    None
                }
                DownlinkCommand::PingSlotChannelReq { frequency, data_rate } => {
                    let frequency_ok = frequency == 0 || R::verify_rx_frequency(frequency);
                    let data_rate =
                        DR::try_from(data_rate).ok().filter(|dr| region::verify::<R>(VerifyAttribute::RxDr(*dr)));
                    if let (true, Some(dr)) = (frequency_ok, data_rate) {
                        self.class_b_params.ping_slot_frequency = (frequency != 0).then_some(frequency);
                        self.class_b_params.ping_slot_data_rate = Some(dr);
                        self.dirty |= NvmGroups::CLASS_B;
                    }
                    Some(UplinkCommand::PingSlotChannelAns(frequency_ok as u8 | (data_rate.is_some() as u8) << 1))
                }
                DownlinkCommand::BeaconTimingAns { .. } => None,
                DownlinkCommand::BeaconFreqReq { frequency } => {
                    let frequency_ok = frequency == 0 || R::verify_rx_frequency(frequency);
                    if frequency_ok {
                        self.class_b_params.beacon_frequency = (frequency != 0).then_some(frequency);
                        self.dirty |= NvmGroups::CLASS_B;
                    }
                    Some(UplinkCommand::BeaconFreqAns(frequency_ok as u8))
                }
            };
            if let Some(answer) = answer {
                self.answer(answer);
            }
        }
    }

    /// One answer per LinkADRReq of the block, all with the status of the block. With ADR
    /// off the accepted datarate and power are acknowledged but not applied.
    fn link_adr(&mut self, block: &[LinkAdrReq]) {
        let params = LinkAdrParams {
            current_dr: self.configuration.tx_data_rate,
            current_power: self.configuration.tx_power,
            current_nb_trans: self.configuration.number_of_transmissions,
        };
        let outcome = region::link_adr_req::<R, C>(&mut self.channel_plan, block, &params);
        if outcome.accepted() {
            if self.configuration.adr_enabled {
                self.configuration.tx_data_rate = outcome.data_rate;
                self.configuration.tx_power = outcome.tx_power;
            }
            self.configuration.number_of_transmissions = outcome.nb_trans;
            self.dirty |= NvmGroups::MAC_GROUP1 | NvmGroups::MAC_GROUP2 | NvmGroups::REGION_GROUP2;
            debug!(
                "link adr: dr {:?} power {} nb_trans {}",
                outcome.data_rate,
                outcome.tx_power,
                outcome.nb_trans
            );
        }
        for _ in block {
            self.answer(UplinkCommand::LinkAdrAns(outcome.status));
        }
    }

    pub(super) fn start_beacon_acquisition<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        let now = device.timer().now();
        self.class_b.state = BeaconState::Acquisition;
        match self.class_b.time_reference {
            Some(reference) => {
                let beacon = class_b::next_beacon(reference.gps_at(now + BEACON_ACQUISITION_GUARD_MS));
                let at = reference.local_at(beacon).saturating_sub(BEACON_ACQUISITION_GUARD_MS);
                debug!("beacon acquisition at {}", at);
                start_timer_at(device, TimerId::Beacon, at)
            }
            None => {
                debug!("no time reference, scanning a full beacon period");
                self.open_beacon_window(device, now, BEACON_INTERVAL_MS)
            }
        }
    }

    fn open_beacon_window<D: Device>(
        &mut self,
        device: &mut D,
        now: u64,
        window_ms: u64,
    ) -> Result<(), crate::Error<D>> {
        let beacon_gps = self
            .class_b
            .time_reference
            .map(|reference| class_b::next_beacon(reference.gps_at(now)))
            .unwrap_or(0);
        let frequency = self.class_b_params.beacon_frequency::<R>((beacon_gps / 1000) as u32);
        let data_rate = R::beacon_data_rate();
        let datarate = R::convert_data_rate(data_rate)?;
        let symbol_timeout = (window_ms * 1000 / datarate.symbol_time_us().max(1) as u64).min(u16::MAX as u64) as u16;
        let params = RxWindowParams { symbol_timeout, offset_ms: 0 };
        let mut config = region::rx_config::<R>(frequency, data_rate, &params, false)?;
        config.preamble_len = BEACON_PREAMBLE_LEN;
        config.max_payload = R::beacon_format().size;
        let timeout_ms = window_ms.min(u32::MAX as u64) as u32;
        self.start_rx(device, RxSlot { window: Window::Beacon, data_rate }, &config, timeout_ms)
    }

    pub(super) fn on_beacon_timer<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        let guard = match self.class_b.state {
            BeaconState::Idle => return Ok(()),
            BeaconState::Acquisition => BEACON_ACQUISITION_GUARD_MS,
            BeaconState::Locked => BEACON_RX_GUARD_MS,
        };
        let now = device.timer().now();
        if self.state != State::Idle || self.uplink.is_some() {
            debug!("beacon window skipped, tx cycle in progress");
            return self.on_beacon_missed(device, now);
        }
        let rf = RfConfig {
            frequency: 0,
            coding_rate: R::default_coding_rate(),
            data_rate: R::convert_data_rate(R::beacon_data_rate())?,
        };
        let toa = device.radio().time_on_air(&rf, BEACON_PREAMBLE_LEN, R::beacon_format().size as usize);
        self.open_beacon_window(device, now, 2 * guard + toa as u64)
    }

    fn on_beacon_received<D: Device>(&mut self, device: &mut D, at: u64) -> Result<(), crate::Error<D>> {
        let len = self.rx_buffer.len();
        let beacon = match class_b::parse_beacon(&R::beacon_format(), self.rx_buffer.as_ref()) {
            Ok(beacon) => beacon,
            Err(err) => {
                debug!("beacon dropped: {:?}", err);
                return self.on_beacon_missed(device, at);
            }
        };
        let rf = RfConfig {
            frequency: 0,
            coding_rate: R::default_coding_rate(),
            data_rate: R::convert_data_rate(R::beacon_data_rate())?,
        };
        let toa = device.radio().time_on_air(&rf, BEACON_PREAMBLE_LEN, len);
        let start = at.saturating_sub(toa as u64);
        self.class_b.time_reference = Some(TimeReference::new(beacon.time as u64 * 1000, start));
        self.class_b.last_beacon = Some(start);
        if self.class_b.state == BeaconState::Acquisition {
            self.confirm_queue.set_status(MlmeType::BeaconAcquisition, EventStatus::Ok);
        }
        self.class_b.state = BeaconState::Locked;
        self.indicate(MlmeIndication::Beacon { status: EventStatus::BeaconLocked, time: beacon.time });
        trace!("beacon {} received", beacon.time);
        start_timer_at(device, TimerId::Beacon, start + BEACON_INTERVAL_MS - BEACON_RX_GUARD_MS)?;
        self.resume_reception(device)
    }

    fn on_beacon_missed<D: Device>(&mut self, device: &mut D, now: u64) -> Result<(), crate::Error<D>> {
        match self.class_b.state {
            BeaconState::Idle => {}
            BeaconState::Acquisition => {
                debug!("beacon not found");
                self.class_b.state = BeaconState::Idle;
                self.confirm_queue.set_status(MlmeType::BeaconAcquisition, EventStatus::BeaconNotFound);
            }
            BeaconState::Locked if self.class_b.beacon_lost(now) => {
                warn!("beacon lost");
                self.class_b.state = BeaconState::Idle;
                self.indicate(MlmeIndication::BeaconLost);
                if self.class == DeviceClass::B {
                    self.class = DeviceClass::A;
                    self.class_b.next_ping_slot = None;
                    self.dirty |= NvmGroups::MAC_GROUP2;
                    device.timer().stop(TimerId::PingSlot).map_err(DeviceError::<D>::Timer)?;
                    self.indicate(MlmeIndication::ClassChanged(DeviceClass::A));
                }
            }
            BeaconState::Locked => {
                if let Some(reference) = self.class_b.time_reference {
                    let gps = reference.gps_at(now);
                    let time = (class_b::beacon_period_start(gps) / 1000) as u32;
                    self.indicate(MlmeIndication::Beacon { status: EventStatus::BeaconLost, time });
                    let next = reference.local_at(class_b::next_beacon(gps)).saturating_sub(BEACON_RX_GUARD_MS);
                    start_timer_at(device, TimerId::Beacon, next)?;
                }
            }
        }
        if self.state == State::Idle && self.uplink.is_none() {
            self.resume_reception(device)?;
        }
        Ok(())
    }

    pub(super) fn schedule_ping_slot<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        if self.class != DeviceClass::B {
            return Ok(());
        }
        let now = device.timer().now();
        if let Some(at) = self.class_b.schedule_ping_slot(now, self.session.dev_addr, &self.class_b_params) {
            start_timer_at(device, TimerId::PingSlot, at)?;
        }
        Ok(())
    }

    pub(super) fn on_ping_slot_timer<D: Device>(&mut self, device: &mut D) -> Result<(), crate::Error<D>> {
        if self.class != DeviceClass::B {
            return Ok(());
        }
        if self.state != State::Idle || self.uplink.is_some() || self.rx_slot.is_some() {
            return self.schedule_ping_slot(device);
        }
        let channel = self
            .class_b_params
            .ping_slot_channel::<R>(self.session.dev_addr, self.class_b.ping_slot_beacon_time);
        self.open_rx(device, Window::PingSlot, channel, false)
    }
}
