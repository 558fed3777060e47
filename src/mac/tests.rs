use super::class_b::BeaconState;
use super::crypto::{Crypto, FCNT_DOWN_INITIAL_VALUE, MAX_FCNT_GAP};
use super::frame::FCtrl;
use super::multicast::MulticastChannel;
use super::nvm::{NvmGroup, NvmGroups};
use super::primitives::{EventStatus, McpsRequest, McpsType, MlmeIndication, MlmeRequest, MlmeType};
use super::region::channel_plan::dynamic::DynamicChannelPlan;
use super::region::channel_plan::fixed::FixedChannelPlan;
use super::region::channel_plan::{ChannelMask, ChannelPlan};
use super::region::eu868::EU868;
use super::region::in865::IN865;
use super::region::us915::US915;
use super::region::Region;
use super::types::{Activation, Credentials, DeviceClass, RxChannelParams, Window, DR};
use super::{Error, Mac, Mib, MibAttribute};
use crate::device::radio::types::{RadioEvent, RxQuality};
use crate::device::timer::TimerId;
use crate::testing::{
    beacon, uplink_fcnt, uplink_fopts, EventLog, FakeDevice, FakeNetwork, RadioCall, DEV_EUI, JOIN_EUI, ROOT_KEY,
};

type TestMac = Mac<EU868, DynamicChannelPlan<EU868>>;

const DEV_ADDR: u32 = 0x2601_1BDA;

struct Harness {
    mac: TestMac,
    device: FakeDevice,
    log: EventLog,
}

impl Harness {
    fn new() -> Self {
        let mut mac = TestMac::new(Credentials::new(JOIN_EUI, DEV_EUI), Crypto::new(ROOT_KEY));
        let mut device = FakeDevice::new(7);
        mac.start(&mut device).unwrap();
        Self { mac, device, log: EventLog::default() }
    }

    /// Device personalized with session keys, and the network sharing them.
    fn abp() -> (Self, FakeNetwork) {
        let mut harness = Self::new();
        for value in [
            Mib::DevAddr(DEV_ADDR),
            Mib::NwkSKey([0x11; 16]),
            Mib::AppSKey([0x22; 16]),
            Mib::NetworkActivation(Activation::Abp),
        ] {
            harness.set(value);
        }
        let network = FakeNetwork::abp(&harness.mac.crypto, DEV_ADDR);
        (harness, network)
    }

    fn set(&mut self, value: Mib) {
        self.mac.mib_set(&mut self.device, value).unwrap();
    }

    fn send(&mut self, request: McpsRequest<'_>) -> Result<(), crate::Error<FakeDevice>> {
        let result = self.mac.mcps_request(&mut self.device, &request);
        self.process();
        result
    }

    fn mlme(&mut self, request: MlmeRequest) -> Result<(), crate::Error<FakeDevice>> {
        let result = self.mac.mlme_request(&mut self.device, &request);
        self.process();
        result
    }

    fn process(&mut self) {
        self.mac.process(&mut self.device, &mut self.log).unwrap();
    }

    fn tx_done(&mut self) {
        let now = self.device.timer.now;
        self.mac.on_radio_event(RadioEvent::TxDone, now);
        self.process();
    }

    fn fire(&mut self, id: TimerId) {
        assert!(self.device.timer.expire(id).is_some(), "{:?} not armed", id);
        self.mac.on_timer_event(id);
        self.process();
    }

    fn rx_timeout(&mut self) {
        let now = self.device.timer.now;
        self.mac.on_radio_event(RadioEvent::RxTimeout, now);
        self.process();
    }

    fn receive(&mut self, frame: &[u8]) {
        let now = self.device.timer.now;
        self.mac.on_radio_event(RadioEvent::RxDone(frame, RxQuality::new(-40, 7)), now);
        self.process();
    }

    /// Transmission followed by two empty receive windows.
    fn silent_cycle(&mut self) {
        self.tx_done();
        self.fire(TimerId::Rx1);
        self.rx_timeout();
        self.fire(TimerId::Rx2);
        self.rx_timeout();
    }

    /// Transmission answered by `frame` in RX1.
    fn answered_in_rx1(&mut self, frame: &[u8]) {
        self.tx_done();
        self.fire(TimerId::Rx1);
        self.receive(frame);
    }

    fn sent(&self) -> std::vec::Vec<std::vec::Vec<u8>> {
        self.device.radio.sent()
    }

    fn last_radio_call(&self) -> Option<&RadioCall> {
        self.device.radio.calls.last()
    }
}

fn unconfirmed(payload: &[u8]) -> McpsRequest<'_> {
    McpsRequest::Unconfirmed { port: 1, payload }
}

#[test]
fn busy_until_the_cycle_completes() {
    let (mut h, _) = Harness::abp();
    assert!(!h.mac.is_busy());
    h.send(unconfirmed(b"one")).unwrap();
    assert!(h.mac.is_busy());
    assert!(matches!(h.send(unconfirmed(b"two")), Err(crate::Error::Mac(Error::Busy))));
    assert!(matches!(h.mlme(MlmeRequest::LinkCheck), Err(crate::Error::Mac(Error::Busy))));
    assert!(matches!(h.mac.set_class(&mut h.device, DeviceClass::B), Err(crate::Error::Mac(Error::ParameterInvalid))));
    h.silent_cycle();
    assert!(!h.mac.is_busy());
    assert_eq!(h.sent().len(), 1);
    let confirm = h.log.last_mcps_confirm().unwrap();
    assert_eq!(confirm.mcps, McpsType::Unconfirmed);
    assert_eq!(confirm.status, EventStatus::Ok);
    assert_eq!(confirm.nb_trans, 1);
    h.send(unconfirmed(b"two")).unwrap();
}

#[test]
fn request_validation() {
    let mut h = Harness::new();
    assert!(matches!(h.send(unconfirmed(b"x")), Err(crate::Error::Mac(Error::NoNetworkJoined))));
    let (mut h, _) = Harness::abp();
    let port_zero = McpsRequest::Unconfirmed { port: 0, payload: b"x" };
    assert!(matches!(h.send(port_zero), Err(crate::Error::Mac(Error::ParameterInvalid))));
    let port_224 = McpsRequest::Confirmed { port: 224, payload: b"x" };
    assert!(matches!(h.send(port_224), Err(crate::Error::Mac(Error::ParameterInvalid))));
    // 51 bytes at DR0.
    assert!(matches!(h.send(unconfirmed(&[0; 52])), Err(crate::Error::Mac(Error::LengthError))));
    assert!(h.sent().is_empty());
    assert!(!h.mac.is_busy());
    assert_eq!(h.mac.max_app_payload(), 51);
}

#[test]
fn uplink_counter_is_strictly_increasing() {
    let (mut h, _) = Harness::abp();
    for i in 0..5u8 {
        h.send(unconfirmed(&[i])).unwrap();
        h.silent_cycle();
    }
    let counters: std::vec::Vec<u16> = h.sent().iter().map(|frame| uplink_fcnt(frame)).collect();
    assert_eq!(counters, [0, 1, 2, 3, 4]);
    let reported: std::vec::Vec<u32> = h.log.mcps_confirms.iter().map(|confirm| confirm.uplink_counter).collect();
    assert_eq!(reported, [0, 1, 2, 3, 4]);
    assert_eq!(h.mac.mib_get(MibAttribute::UplinkCounter), Ok(Mib::UplinkCounter(5)));
    assert!(h.log.nvm_changes.contains(NvmGroups::CRYPTO));
}

#[test]
fn rejected_uplink_still_consumes_its_counter() {
    let (mut h, _) = Harness::abp();
    h.device.radio.time_on_air_ms = 36_000;
    h.send(unconfirmed(b"a")).unwrap();
    h.silent_cycle();
    let wait_ms = match h.send(unconfirmed(b"b")) {
        Err(crate::Error::Mac(Error::DutyCycleRestricted { wait_ms })) => wait_ms,
        other => panic!("unexpected {:?}", other),
    };
    // Counter 1 was secured into a frame that never left.
    assert_eq!(h.mac.mib_get(MibAttribute::UplinkCounter), Ok(Mib::UplinkCounter(2)));
    assert_eq!(h.sent().len(), 1);
    assert!(!h.mac.is_busy());

    h.device.timer.now += wait_ms;
    h.send(unconfirmed(b"c")).unwrap();
    let counters: std::vec::Vec<u16> = h.sent().iter().map(|frame| uplink_fcnt(frame)).collect();
    assert_eq!(counters, [0, 2]);
}

#[test]
fn proprietary_frame_is_limited_by_the_datarate() {
    let mut h = Harness::new();
    let too_long = McpsRequest::Proprietary { payload: &[0xAB; 52] };
    assert!(matches!(h.send(too_long), Err(crate::Error::Mac(Error::LengthError))));
    assert!(h.sent().is_empty());
    assert!(!h.mac.is_busy());

    h.send(McpsRequest::Proprietary { payload: &[0xAB; 51] }).unwrap();
    let frame = h.sent()[0].clone();
    assert_eq!(frame.len(), 52);
    assert_eq!(frame[0], 0xE0);
    assert!(frame[1..].iter().all(|byte| *byte == 0xAB));
    h.silent_cycle();
    let confirm = h.log.last_mcps_confirm().unwrap();
    assert_eq!((confirm.mcps, confirm.status), (McpsType::Proprietary, EventStatus::Ok));
    // Proprietary frames carry no frame counter.
    assert_eq!(h.mac.mib_get(MibAttribute::UplinkCounter), Ok(Mib::UplinkCounter(0)));
}

#[test]
fn otaa_join_then_data_exchange() {
    let mut h = Harness::new();
    let mut network = FakeNetwork::new();
    h.mlme(MlmeRequest::Join).unwrap();
    assert!(h.mac.is_busy());
    let request = h.sent()[0].clone();
    assert_eq!(request.len(), 23);
    assert_eq!(request[0], 0x00);

    let accept = network.join_accept(h.mac.crypto.dev_nonce(), 0x00, 1, None);
    h.answered_in_rx1(&accept);
    assert!(h.mac.is_joined());
    assert!(!h.mac.is_busy());
    assert_eq!(h.mac.session().dev_addr(), DEV_ADDR);
    assert_eq!(h.mac.session().net_id(), 0x13);
    let join = h.log.mlme_confirms.last().unwrap();
    assert_eq!((join.mlme, join.status, join.nb_retries), (MlmeType::Join, EventStatus::Ok, 1));
    assert!(h.log.nvm_changes.contains(NvmGroups::ALL));

    h.send(McpsRequest::Unconfirmed { port: 2, payload: b"ping" }).unwrap();
    let uplink = h.sent().last().unwrap().clone();
    assert_eq!(u32::from_le_bytes([uplink[1], uplink[2], uplink[3], uplink[4]]), DEV_ADDR);
    let downlink = network.downlink(false, FCtrl::default(), 0, &[], Some(5), b"hi");
    h.answered_in_rx1(&downlink);
    let received = h.log.received.last().unwrap();
    assert_eq!((received.port, received.payload.as_slice()), (Some(5), b"hi".as_slice()));
    assert_eq!(received.rx_slot, Window::_1);
    assert_eq!(h.log.last_mcps_confirm().unwrap().status, EventStatus::Ok);
    assert!(!h.mac.is_busy());
}

#[test]
fn join_without_answer_fails() {
    let mut h = Harness::new();
    h.mlme(MlmeRequest::Join).unwrap();
    assert!(matches!(h.mlme(MlmeRequest::Join), Err(crate::Error::Mac(Error::Busy))));
    h.silent_cycle();
    assert_eq!(h.log.mlme_status(MlmeType::Join), Some(EventStatus::JoinFail));
    assert!(!h.mac.is_joined());

    h.mlme(MlmeRequest::Join).unwrap();
    h.silent_cycle();
    assert_eq!(h.log.mlme_confirms.last().unwrap().nb_retries, 2);
    let nonces: std::vec::Vec<u16> =
        h.sent().iter().map(|frame| u16::from_le_bytes([frame[17], frame[18]])).collect();
    assert_eq!(nonces, [1, 2]);
}

#[test]
fn replayed_downlink_is_dropped() {
    let (mut h, network) = Harness::abp();
    let downlink = network.downlink(false, FCtrl::default(), 3, &[], Some(1), b"a");

    h.send(unconfirmed(b"x")).unwrap();
    h.answered_in_rx1(&downlink);
    assert_eq!(h.log.received.len(), 1);
    assert_eq!(h.log.received[0].downlink_counter, 3);

    h.send(unconfirmed(b"y")).unwrap();
    h.answered_in_rx1(&downlink);
    assert_eq!(h.log.received.len(), 1);
    // Still waiting for RX2 after the dropped frame.
    assert!(h.mac.is_busy());
    h.fire(TimerId::Rx2);
    h.rx_timeout();
    assert!(!h.mac.is_busy());
    assert_eq!(h.mac.mib_get(MibAttribute::DownlinkCounter), Ok(Mib::DownlinkCounter(3)));

    let mut forged = network.downlink(false, FCtrl::default(), 4, &[], Some(1), b"b");
    let last = forged.len() - 1;
    forged[last] ^= 0x01;
    h.send(unconfirmed(b"z")).unwrap();
    h.answered_in_rx1(&forged);
    assert_eq!(h.log.received.len(), 1);
}

#[test]
fn downlink_beyond_the_counter_gap_is_dropped() {
    let (mut h, network) = Harness::abp();
    h.send(unconfirmed(b"x")).unwrap();
    h.answered_in_rx1(&network.downlink(false, FCtrl::default(), 3, &[], Some(1), b"a"));
    assert_eq!(h.log.received.len(), 1);
    let indications = h.log.mlme_indications.len();

    let far = 3 + MAX_FCNT_GAP;
    h.send(unconfirmed(b"y")).unwrap();
    h.answered_in_rx1(&network.downlink(false, FCtrl::default(), far, &[], Some(1), b"b"));
    assert_eq!(h.log.received.len(), 1);
    assert_eq!(h.log.mlme_indications.len(), indications);
    assert_eq!(h.mac.mib_get(MibAttribute::DownlinkCounter), Ok(Mib::DownlinkCounter(3)));
    assert!(h.mac.is_busy());
    h.fire(TimerId::Rx2);
    h.rx_timeout();
    assert!(!h.mac.is_busy());
    assert_eq!(h.log.last_mcps_confirm().unwrap().status, EventStatus::Ok);
    assert_eq!(h.mac.mib_get(MibAttribute::DownlinkCounter), Ok(Mib::DownlinkCounter(3)));

    // One step short of the gap is still accepted.
    let near = 3 + MAX_FCNT_GAP - 1;
    h.send(unconfirmed(b"z")).unwrap();
    h.answered_in_rx1(&network.downlink(false, FCtrl::default(), near, &[], Some(1), b"c"));
    assert_eq!(h.log.received.len(), 2);
    assert_eq!(h.mac.mib_get(MibAttribute::DownlinkCounter), Ok(Mib::DownlinkCounter(near)));
}

#[test]
fn rejoin_restarts_the_frame_counters() {
    let mut h = Harness::new();
    let mut network = FakeNetwork::new();
    h.mlme(MlmeRequest::Join).unwrap();
    h.answered_in_rx1(&network.join_accept(h.mac.crypto.dev_nonce(), 0x00, 1, None));
    assert!(h.mac.is_joined());
    for (fcnt, payload) in [(0, b"a"), (1, b"b")] {
        h.send(unconfirmed(payload)).unwrap();
        h.answered_in_rx1(&network.downlink(false, FCtrl::default(), 5 + fcnt, &[], None, &[]));
    }
    assert_eq!(h.mac.mib_get(MibAttribute::UplinkCounter), Ok(Mib::UplinkCounter(2)));
    assert_eq!(h.mac.mib_get(MibAttribute::DownlinkCounter), Ok(Mib::DownlinkCounter(6)));

    h.mlme(MlmeRequest::Join).unwrap();
    h.answered_in_rx1(&network.join_accept(h.mac.crypto.dev_nonce(), 0x00, 1, None));
    assert!(h.mac.is_joined());
    assert_eq!(h.log.mlme_status(MlmeType::Join), Some(EventStatus::Ok));
    assert_eq!(h.mac.mib_get(MibAttribute::UplinkCounter), Ok(Mib::UplinkCounter(0)));
    assert_eq!(
        h.mac.mib_get(MibAttribute::DownlinkCounter),
        Ok(Mib::DownlinkCounter(FCNT_DOWN_INITIAL_VALUE))
    );

    h.send(unconfirmed(b"c")).unwrap();
    assert_eq!(uplink_fcnt(h.sent().last().unwrap()), 0);
    h.answered_in_rx1(&network.downlink(false, FCtrl::default(), 0, &[], Some(2), b"new"));
    assert_eq!(h.log.received.last().unwrap().payload.as_slice(), b"new".as_slice());
    assert_eq!(h.mac.mib_get(MibAttribute::DownlinkCounter), Ok(Mib::DownlinkCounter(0)));
}

#[test]
fn send_is_busy_while_a_confirmed_uplink_waits_to_retry() {
    let (mut h, _) = Harness::abp();
    h.send(McpsRequest::Confirmed { port: 1, payload: b"c" }).unwrap();
    h.silent_cycle();
    assert!(h.device.timer.deadline(TimerId::AckTimeout).is_some());
    assert!(h.mac.is_busy());
    assert!(matches!(h.send(unconfirmed(b"u")), Err(crate::Error::Mac(Error::Busy))));
    let proprietary = McpsRequest::Proprietary { payload: b"p" };
    assert!(matches!(h.send(proprietary), Err(crate::Error::Mac(Error::Busy))));
    assert_eq!(h.sent().len(), 1);
    assert!(h.log.mcps_confirms.is_empty());

    h.fire(TimerId::AckTimeout);
    assert_eq!(h.sent().len(), 2);
    assert_eq!(uplink_fcnt(&h.sent()[1]), 0);
}

#[test]
fn channel_mask_past_the_fixed_plan_is_rejected() {
    let mut mac =
        Mac::<US915, FixedChannelPlan<US915>>::new(Credentials::new(JOIN_EUI, DEV_EUI), Crypto::new(ROOT_KEY));
    let mut device = FakeDevice::new(3);
    mac.start(&mut device).unwrap();
    let before = mac.mib_get(MibAttribute::ChannelMask);

    // Channel 72 does not exist in a 72 channel plan.
    let mut mask = ChannelMask::new([0xFFFF, 0xFFFF, 0xFFFF, 0xFFFF, 0x00FF, 0]);
    mask.set(72, true);
    let rejected = mac.mib_set(&mut device, Mib::ChannelMask(mask));
    assert!(matches!(rejected, Err(crate::Error::Mac(Error::ParameterInvalid))));
    assert_eq!(mac.mib_get(MibAttribute::ChannelMask), before);

    let second_sub_band = ChannelMask::new([0xFF00, 0, 0, 0, 0x0002, 0]);
    mac.mib_set(&mut device, Mib::ChannelMask(second_sub_band)).unwrap();
    assert_eq!(mac.mib_get(MibAttribute::ChannelMask), Ok(Mib::ChannelMask(second_sub_band)));
}

#[test]
fn channel_mask_of_undefined_channels_is_rejected() {
    let mut mac =
        Mac::<IN865, DynamicChannelPlan<IN865>>::new(Credentials::new(JOIN_EUI, DEV_EUI), Crypto::new(ROOT_KEY));
    let mut device = FakeDevice::new(3);
    mac.start(&mut device).unwrap();
    let before = mac.mib_get(MibAttribute::ChannelMask);

    // Only the three default channels are defined.
    for index in [3, 15, 16] {
        let mut mask = ChannelMask::new([0x0007, 0, 0, 0, 0, 0]);
        mask.set(index, true);
        let rejected = mac.mib_set(&mut device, Mib::ChannelMask(mask));
        assert!(matches!(rejected, Err(crate::Error::Mac(Error::ParameterInvalid))), "channel {}", index);
        assert_eq!(mac.mib_get(MibAttribute::ChannelMask), before);
    }

    let two_channels = ChannelMask::new([0x0003, 0, 0, 0, 0, 0]);
    mac.mib_set(&mut device, Mib::ChannelMask(two_channels)).unwrap();
    assert_eq!(mac.mib_get(MibAttribute::ChannelMask), Ok(Mib::ChannelMask(two_channels)));
}

#[test]
fn confirmed_uplink_is_acknowledged() {
    let (mut h, network) = Harness::abp();
    h.send(McpsRequest::Confirmed { port: 4, payload: b"c" }).unwrap();
    assert_eq!(h.sent()[0][0] >> 5, 4);
    h.tx_done();
    h.fire(TimerId::Rx1);
    h.rx_timeout();
    h.fire(TimerId::Rx2);
    let mut fctrl = FCtrl::default();
    fctrl.set_ack(true);
    h.receive(&network.downlink(false, fctrl, 0, &[], None, &[]));
    let confirm = h.log.last_mcps_confirm().unwrap();
    assert_eq!(confirm.status, EventStatus::Ok);
    assert!(confirm.ack_received);
    assert_eq!(confirm.nb_trans, 1);
    assert!(h.log.received.last().unwrap().ack_received);
    assert_eq!(h.log.received.last().unwrap().rx_slot, Window::_2);
}

#[test]
fn unacknowledged_confirmed_uplink_walks_down_the_datarates() {
    let (mut h, _) = Harness::abp();
    h.set(Mib::ChannelsDataRate(DR::_5));
    h.send(McpsRequest::Confirmed { port: 1, payload: b"retry" }).unwrap();
    for _ in 0..7 {
        h.silent_cycle();
        assert!(h.mac.is_busy());
        h.fire(TimerId::AckTimeout);
    }
    h.silent_cycle();
    assert!(!h.mac.is_busy());

    let sent = h.sent();
    assert_eq!(sent.len(), 8);
    assert!(sent.iter().all(|frame| uplink_fcnt(frame) == 0));
    let spreading_factors: std::vec::Vec<u8> = h
        .device
        .radio
        .calls
        .iter()
        .filter_map(|call| match call {
            RadioCall::SetTxConfig(config) => Some(config.rf.data_rate.spreading_factor_value()),
            _ => None,
        })
        .collect();
    assert_eq!(spreading_factors, [7, 7, 7, 8, 8, 9, 9, 10]);

    let confirm = h.log.last_mcps_confirm().unwrap();
    assert_eq!(confirm.status, EventStatus::Rx2Timeout);
    assert!(!confirm.ack_received);
    assert_eq!(confirm.nb_trans, 8);
    assert_eq!(confirm.data_rate, DR::_2);
    assert_eq!(h.log.mcps_confirms.len(), 1);
}

#[test]
fn duty_cycle_wait_then_retry() {
    let (mut h, _) = Harness::abp();
    // A full hour of 1% credit.
    h.device.radio.time_on_air_ms = 36_000;
    h.send(unconfirmed(b"big")).unwrap();
    h.silent_cycle();
    let wait_ms = match h.send(unconfirmed(b"again")) {
        Err(crate::Error::Mac(Error::DutyCycleRestricted { wait_ms })) => wait_ms,
        other => panic!("unexpected {:?}", other),
    };
    assert!(wait_ms > 3_000_000);
    assert!(!h.mac.is_busy());
    h.device.timer.now += wait_ms - 1;
    assert!(h.send(unconfirmed(b"again")).is_err());
    h.device.timer.now += 1;
    h.send(unconfirmed(b"again")).unwrap();
    assert_eq!(h.sent().len(), 2);
}

#[test]
fn unconfirmed_uplink_is_repeated_nb_trans_times() {
    let (mut h, network) = Harness::abp();
    h.set(Mib::ChannelsNbTrans(3));
    h.send(unconfirmed(b"rep")).unwrap();
    for expected in 1..=3 {
        assert_eq!(h.sent().len(), expected);
        h.silent_cycle();
    }
    assert_eq!(h.sent().len(), 3);
    assert!(h.sent().iter().all(|frame| uplink_fcnt(frame) == 0));
    let confirm = h.log.last_mcps_confirm().unwrap();
    assert_eq!((confirm.status, confirm.nb_trans), (EventStatus::Ok, 3));

    // A downlink ends the repetitions.
    h.send(unconfirmed(b"rep")).unwrap();
    h.answered_in_rx1(&network.downlink(false, FCtrl::default(), 0, &[], None, &[]));
    assert_eq!(h.sent().len(), 4);
    assert_eq!(h.log.last_mcps_confirm().unwrap().nb_trans, 1);
    assert!(!h.mac.is_busy());
}

#[test]
fn mac_commands_are_answered_in_the_next_uplink() {
    let (mut h, network) = Harness::abp();
    h.device.battery = Some(200);
    // LinkADRReq DR5 power 2 channels 0-2, DevStatusReq, RXTimingSetupReq 2 s.
    let fopts = [0x03, 0x52, 0x07, 0x00, 0x01, 0x06, 0x08, 0x02];
    h.send(unconfirmed(b"x")).unwrap();
    // FPending
    let fctrl = FCtrl(0x10);
    h.answered_in_rx1(&network.downlink(false, fctrl, 0, &fopts, None, &[]));
    assert_eq!(h.mac.configuration().tx_data_rate(), DR::_5);
    assert_eq!(h.mac.configuration().tx_power(), 2);
    assert_eq!(h.mac.configuration().receive_delay1(), 2000);
    assert!(h.log.received.last().unwrap().frame_pending);
    assert!(h.log.mlme_indications.contains(&MlmeIndication::ScheduleUplink));

    h.send(unconfirmed(b"y")).unwrap();
    assert_eq!(uplink_fopts(h.sent().last().unwrap()), [0x03, 0x07, 0x06, 200, 7, 0x08]);
    h.silent_cycle();

    // The RXTimingSetupAns is repeated until a downlink arrives.
    h.send(unconfirmed(b"z")).unwrap();
    assert_eq!(uplink_fopts(h.sent().last().unwrap()), [0x08]);
    h.answered_in_rx1(&network.downlink(false, FCtrl::default(), 1, &[], None, &[]));
    h.send(unconfirmed(b"w")).unwrap();
    assert!(uplink_fopts(h.sent().last().unwrap()).is_empty());
}

#[test]
fn frequencies_the_radio_cannot_tune_are_refused() {
    let (mut h, network) = Harness::abp();
    h.device.radio.rf_range = 863_000_000..=868_600_000;
    // RxParamSetupReq RX2 DR3 at 869.525 MHz, NewChannelReq channel 3 at 869.1 MHz DR0-5.
    let fopts = [0x05, 0x03, 0xD2, 0xAC, 0x84, 0x07, 0x03, 0xB8, 0x9C, 0x84, 0x50];
    h.send(unconfirmed(b"x")).unwrap();
    h.answered_in_rx1(&network.downlink(false, FCtrl::default(), 0, &fopts, None, &[]));
    h.send(unconfirmed(b"y")).unwrap();
    assert_eq!(uplink_fopts(h.sent().last().unwrap()), [0x05, 0x06, 0x07, 0x02]);
    assert!(h.mac.channel_plan.channel(3).is_none());
    assert_eq!(h.mac.configuration().rx2.data_rate, DR::_0);
    h.silent_cycle();

    let rx2 = RxChannelParams { frequency: 869_525_000, data_rate: DR::_0 };
    let rejected = h.mac.mib_set(&mut h.device, Mib::Rx2Channel(rx2));
    assert!(matches!(rejected, Err(crate::Error::Mac(Error::ParameterInvalid))));
    let rx2 = RxChannelParams { frequency: 868_500_000, data_rate: DR::_0 };
    h.set(Mib::Rx2Channel(rx2));
}

#[test]
fn link_check_confirm_carries_the_answer() {
    let (mut h, network) = Harness::abp();
    h.mlme(MlmeRequest::LinkCheck).unwrap();
    assert!(matches!(h.mlme(MlmeRequest::LinkCheck), Err(crate::Error::Mac(Error::Busy))));
    h.send(unconfirmed(b"x")).unwrap();
    assert_eq!(uplink_fopts(h.sent().last().unwrap()), [0x02]);
    h.answered_in_rx1(&network.downlink(false, FCtrl::default(), 0, &[0x02, 12, 3], None, &[]));
    let confirm = h.log.mlme_confirms.last().unwrap();
    assert_eq!(confirm.mlme, MlmeType::LinkCheck);
    assert_eq!(confirm.status, EventStatus::Ok);
    assert_eq!((confirm.demod_margin, confirm.nb_gateways), (12, 3));
}

#[test]
fn class_c_listens_between_windows() {
    let (mut h, network) = Harness::abp();
    h.mac.set_class(&mut h.device, DeviceClass::C).unwrap();
    assert_eq!(h.last_radio_call(), Some(&RadioCall::Rx(0)));
    let rxc = h.device.radio.last_rx_config().unwrap();
    assert!(rxc.continuous);
    assert_eq!(rxc.rf.frequency, EU868::default_rx2_frequency());

    h.receive(&network.downlink(false, FCtrl::default(), 0, &[], Some(3), b"c"));
    assert_eq!(h.log.received.last().unwrap().rx_slot, Window::C);
    assert_eq!(h.last_radio_call(), Some(&RadioCall::Rx(0)));

    h.send(unconfirmed(b"x")).unwrap();
    h.tx_done();
    assert_eq!(h.last_radio_call(), Some(&RadioCall::Rx(0)));
    h.fire(TimerId::Rx1);
    assert_eq!(h.last_radio_call(), Some(&RadioCall::Rx(3000)));
    h.rx_timeout();
    assert_eq!(h.last_radio_call(), Some(&RadioCall::Rx(0)));
    h.fire(TimerId::Rx2);
    h.rx_timeout();
    assert_eq!(h.last_radio_call(), Some(&RadioCall::Rx(0)));
    assert!(!h.mac.is_busy());
    assert_eq!(h.log.last_mcps_confirm().unwrap().status, EventStatus::Ok);

    h.mac.set_class(&mut h.device, DeviceClass::A).unwrap();
    assert_eq!(h.last_radio_call(), Some(&RadioCall::Sleep));
}

#[test]
fn multicast_group_in_class_c() {
    let (mut h, _) = Harness::abp();
    let address = 0x0102_0304;
    h.mac.set_class(&mut h.device, DeviceClass::C).unwrap();
    h.mlme(MlmeRequest::DeriveMcKeKey).unwrap();
    assert_eq!(h.log.mlme_status(MlmeType::DeriveMcKeKey), Some(EventStatus::Ok));
    assert!(matches!(
        h.mlme(MlmeRequest::DeriveMcKeyPair { group: 0 }),
        Err(crate::Error::Mac(Error::ParameterInvalid))
    ));

    h.set(Mib::McKeyEncrypted { group: 0, key: [0x5A; 16] });
    let channel = MulticastChannel {
        address,
        class: DeviceClass::C,
        frequency: EU868::default_rx2_frequency(),
        data_rate: DR::_0,
        periodicity: 0,
        fcnt_min: 0,
        fcnt_max: 10,
    };
    h.set(Mib::MulticastChannel { group: 0, channel: Some(channel) });
    h.mlme(MlmeRequest::DeriveMcKeyPair { group: 0 }).unwrap();
    assert_eq!(h.log.mlme_status(MlmeType::DeriveMcKeyPair), Some(EventStatus::Ok));

    let network = FakeNetwork::abp(&h.mac.crypto, DEV_ADDR);
    h.receive(&network.multicast_downlink(0, address, 1, 10, b"mc"));
    let received = h.log.received.last().unwrap();
    assert_eq!(received.mcps, McpsType::Multicast);
    assert_eq!(received.multicast_group, Some(0));
    assert_eq!((received.port, received.payload.as_slice()), (Some(10), b"mc".as_slice()));

    // Past the end of the session window.
    h.receive(&network.multicast_downlink(0, address, 11, 10, b"late"));
    assert_eq!(h.log.received.len(), 1);
    // Unicast counters are untouched.
    assert_eq!(h.mac.mib_get(MibAttribute::DownlinkCounter), Ok(Mib::DownlinkCounter(u32::MAX)));
}

#[test]
fn device_time_answer_sets_the_time_reference() {
    let (mut h, network) = Harness::abp();
    h.mlme(MlmeRequest::DeviceTime).unwrap();
    h.device.timer.now = 5_000;
    h.send(unconfirmed(b"t")).unwrap();
    assert_eq!(uplink_fopts(h.sent().last().unwrap()), [0x0D]);
    let seconds: u32 = 1_300_000_000;
    let mut fopts = std::vec![0x0D];
    fopts.extend_from_slice(&seconds.to_le_bytes());
    fopts.push(128);
    h.answered_in_rx1(&network.downlink(false, FCtrl::default(), 0, &fopts, None, &[]));
    assert_eq!(h.log.mlme_status(MlmeType::DeviceTime), Some(EventStatus::Ok));
    let reference = h.mac.class_b.time_reference.unwrap();
    assert_eq!(reference.gps_at(5_000), seconds as u64 * 1000 + 500);
}

#[test]
fn class_b_follows_the_beacon() {
    let (mut h, _) = Harness::abp();
    h.mlme(MlmeRequest::BeaconAcquisition).unwrap();
    assert!(h.mac.is_busy());
    assert!(matches!(h.send(unconfirmed(b"x")), Err(crate::Error::Mac(Error::Busy))));

    let time = 1_300_000_000 / 128 * 128;
    h.device.timer.now = 10_000;
    h.receive(&beacon(&EU868::beacon_format(), time));
    assert_eq!(h.mac.class_b.state, BeaconState::Locked);
    assert_eq!(h.log.mlme_status(MlmeType::BeaconAcquisition), Some(EventStatus::Ok));
    assert!(h
        .log
        .mlme_indications
        .contains(&MlmeIndication::Beacon { status: EventStatus::BeaconLocked, time }));
    assert!(!h.mac.is_busy());
    assert!(h.device.timer.deadline(TimerId::Beacon).is_some());

    h.mac.set_class(&mut h.device, DeviceClass::B).unwrap();
    assert_eq!(h.mac.mib_get(MibAttribute::DeviceClass), Ok(Mib::DeviceClass(DeviceClass::B)));
    let ping_slot = h.device.timer.deadline(TimerId::PingSlot).unwrap();
    assert!(ping_slot > 10_000);

    h.fire(TimerId::PingSlot);
    assert_eq!(h.mac.rx_slot.map(|slot| slot.window), Some(Window::PingSlot));
    h.rx_timeout();
    assert!(h.device.timer.deadline(TimerId::PingSlot).unwrap() > ping_slot);

    // A missed beacon keeps the lock while it is recent.
    h.fire(TimerId::Beacon);
    assert_eq!(h.mac.rx_slot.map(|slot| slot.window), Some(Window::Beacon));
    h.rx_timeout();
    assert_eq!(h.mac.class_b.state, BeaconState::Locked);
    assert!(h
        .log
        .mlme_indications
        .iter()
        .any(|indication| matches!(indication, MlmeIndication::Beacon { status: EventStatus::BeaconLost, .. })));
    assert_eq!(h.mac.class(), DeviceClass::B);
}

#[test]
fn beacon_acquisition_without_beacon() {
    let (mut h, _) = Harness::abp();
    h.mlme(MlmeRequest::BeaconAcquisition).unwrap();
    h.rx_timeout();
    assert_eq!(h.log.mlme_status(MlmeType::BeaconAcquisition), Some(EventStatus::BeaconNotFound));
    assert_eq!(h.mac.class_b.state, BeaconState::Idle);
    assert!(!h.mac.is_busy());
}

#[test]
fn continuous_wave_ends_with_the_watchdog() {
    let mut h = Harness::new();
    h.mlme(MlmeRequest::TxCw { frequency: 868_100_000, power: 14, timeout_s: 2 }).unwrap();
    assert_eq!(
        h.last_radio_call(),
        Some(&RadioCall::TxContinuousWave { frequency: 868_100_000, power: 14, timeout_s: 2 })
    );
    assert!(h.mac.is_busy());
    assert_eq!(h.device.timer.deadline(TimerId::RadioWatchdog), Some(2000));
    h.fire(TimerId::RadioWatchdog);
    assert_eq!(h.log.mlme_status(MlmeType::TxCw), Some(EventStatus::Ok));
    assert!(!h.mac.is_busy());
}

#[test]
fn context_survives_a_restart() {
    let (mut h, _) = Harness::abp();
    h.set(Mib::ChannelsDataRate(DR::_3));
    for _ in 0..2 {
        h.send(unconfirmed(b"p")).unwrap();
        h.silent_cycle();
    }
    h.mac.save(&mut h.device, NvmGroups::ALL).unwrap();
    assert!(NvmGroup::ALL.iter().all(|group| h.device.store.is_stored(*group)));

    let mut restarted = TestMac::new(Credentials::default(), Crypto::default());
    assert_eq!(restarted.restore(&mut h.device).unwrap(), NvmGroups::ALL);
    assert!(restarted.is_joined());
    assert_eq!(restarted.session().dev_addr(), DEV_ADDR);
    assert_eq!(restarted.mib_get(MibAttribute::UplinkCounter), Ok(Mib::UplinkCounter(2)));
    assert_eq!(restarted.mib_get(MibAttribute::ChannelsDataRate), Ok(Mib::ChannelsDataRate(DR::_3)));
    assert_eq!(restarted.mib_get(MibAttribute::DevEui), Ok(Mib::DevEui(DEV_EUI)));

    h.device.store.corrupt(NvmGroup::MacGroup2);
    let mut partial = TestMac::new(Credentials::default(), Crypto::default());
    let restored = partial.restore(&mut h.device).unwrap();
    assert!(!restored.contains(NvmGroups::MAC_GROUP2));
    assert!(!partial.is_joined());
    assert_eq!(partial.mib_get(MibAttribute::UplinkCounter), Ok(Mib::UplinkCounter(2)));
}

#[test]
fn confirm_queue_rejects_duplicates_and_overflow() {
    let (mut h, _) = Harness::abp();
    h.mlme(MlmeRequest::LinkCheck).unwrap();
    h.mlme(MlmeRequest::DeviceTime).unwrap();
    h.mlme(MlmeRequest::PingSlotInfo { periodicity: 3 }).unwrap();
    assert!(matches!(h.mlme(MlmeRequest::DeviceTime), Err(crate::Error::Mac(Error::Busy))));
    assert!(matches!(
        h.mlme(MlmeRequest::PingSlotInfo { periodicity: 8 }),
        Err(crate::Error::Mac(Error::ParameterInvalid))
    ));
    h.mlme(MlmeRequest::Join).unwrap();
    h.mlme(MlmeRequest::DeriveMcKeKey).unwrap();
    assert_eq!(h.mac.confirm_queue.len(), 3);
    h.send(unconfirmed(b"q")).unwrap();
    assert_eq!(uplink_fopts(h.sent().last().unwrap()), [0x02, 0x0D, 0x10, 0x03]);
    h.silent_cycle();
    // Unanswered requests complete with the status of the cycle.
    assert_eq!(h.log.mlme_status(MlmeType::LinkCheck), Some(EventStatus::Rx2Timeout));
    assert!(h.mac.confirm_queue.is_empty());
}
