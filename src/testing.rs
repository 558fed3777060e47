//! Deterministic fakes of the device capabilities and of a network server.

use core::ops::RangeInclusive;
use std::vec::Vec;

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac as _};
use rand::{rngs::StdRng, Rng as _, SeedableRng};

use crate::device::non_volatile_store::NonVolatileStore;
use crate::device::radio::types::{RfConfig, RxConfig, TxConfig};
use crate::device::radio::Radio;
use crate::device::rng::Rng;
use crate::device::timer::{Timer, TimerId};
use crate::device::Device;
use crate::mac::crypto::{Crypto, Direction, KeyId};
use crate::mac::frame::{FCtrl, MType, FHDR_LEN};
use crate::mac::nvm::{NvmGroup, NvmGroups};
use crate::mac::primitives::{
    EventStatus, McpsConfirm, McpsIndication, McpsType, MlmeConfirm, MlmeIndication, MlmeType, Primitives,
};
use crate::mac::region::BeaconFormat;
use crate::mac::types::Window;

pub const ROOT_KEY: [u8; 16] = [
    0x2B, 0x7E, 0x15, 0x16, 0x28, 0xAE, 0xD2, 0xA6, 0xAB, 0xF7, 0x15, 0x88, 0x09, 0xCF, 0x4F, 0x3C,
];
pub const JOIN_EUI: [u8; 8] = [0x70, 0xB3, 0xD5, 0x7E, 0xD0, 0x00, 0x00, 0x01];
pub const DEV_EUI: [u8; 8] = [0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x42];

#[derive(Debug, Clone, PartialEq)]
pub enum RadioCall {
    SetPublicNetwork(bool),
    SetChannel(u32),
    SetTxConfig(TxConfig),
    SetRxConfig(RxConfig),
    Send(Vec<u8>),
    Rx(u32),
    Standby,
    Sleep,
    TxContinuousWave { frequency: u32, power: i8, timeout_s: u16 },
}

/// Records every call, completion is injected by the test.
#[derive(Debug)]
pub struct FakeRadio {
    pub calls: Vec<RadioCall>,
    pub time_on_air_ms: u32,
    /// Frequencies the radio hardware tunes to.
    pub rf_range: RangeInclusive<u32>,
}

impl Default for FakeRadio {
    fn default() -> Self {
        Self { calls: Vec::new(), time_on_air_ms: 50, rf_range: 150_000_000..=960_000_000 }
    }
}

impl FakeRadio {
    /// Frames handed to `send`, oldest first.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                RadioCall::Send(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn last_sent(&self) -> Option<Vec<u8>> {
        self.sent().pop()
    }

    pub fn last_rx_config(&self) -> Option<RxConfig> {
        self.calls.iter().rev().find_map(|call| match call {
            RadioCall::SetRxConfig(config) => Some(config.clone()),
            _ => None,
        })
    }

    pub fn last_tx_config(&self) -> Option<TxConfig> {
        self.calls.iter().rev().find_map(|call| match call {
            RadioCall::SetTxConfig(config) => Some(config.clone()),
            _ => None,
        })
    }
}

impl Radio for FakeRadio {
    type Error = ();

    fn set_public_network(&mut self, enable: bool) -> Result<(), Self::Error> {
        self.calls.push(RadioCall::SetPublicNetwork(enable));
        Ok(())
    }
    fn set_channel(&mut self, frequency: u32) -> Result<(), Self::Error> {
        self.calls.push(RadioCall::SetChannel(frequency));
        Ok(())
    }
    fn set_tx_config(&mut self, config: &TxConfig) -> Result<(), Self::Error> {
        self.calls.push(RadioCall::SetTxConfig(config.clone()));
        Ok(())
    }
    fn set_rx_config(&mut self, config: &RxConfig) -> Result<(), Self::Error> {
        self.calls.push(RadioCall::SetRxConfig(config.clone()));
        Ok(())
    }
    fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        self.calls.push(RadioCall::Send(buf.to_vec()));
        Ok(())
    }
    fn rx(&mut self, timeout_ms: u32) -> Result<(), Self::Error> {
        self.calls.push(RadioCall::Rx(timeout_ms));
        Ok(())
    }
    fn standby(&mut self) -> Result<(), Self::Error> {
        self.calls.push(RadioCall::Standby);
        Ok(())
    }
    fn sleep(&mut self) -> Result<(), Self::Error> {
        self.calls.push(RadioCall::Sleep);
        Ok(())
    }
    fn time_on_air(&self, _config: &RfConfig, _preamble_len: u16, _len: usize) -> u32 {
        self.time_on_air_ms
    }
    fn check_rf_frequency(&self, frequency: u32) -> bool {
        self.rf_range.contains(&frequency)
    }
    fn rssi(&mut self) -> i16 {
        -60
    }
    fn set_tx_continuous_wave(&mut self, frequency: u32, power: i8, timeout_s: u16) -> Result<(), Self::Error> {
        self.calls.push(RadioCall::TxContinuousWave { frequency, power, timeout_s });
        Ok(())
    }
}

/// Manual clock. Armed timers only record their deadline.
#[derive(Debug, Default)]
pub struct FakeTimer {
    pub now: u64,
    deadlines: [Option<u64>; 7],
}

impl FakeTimer {
    pub fn deadline(&self, id: TimerId) -> Option<u64> {
        self.deadlines[id as usize]
    }

    /// Move the clock to the deadline of `id` and disarm it.
    pub fn expire(&mut self, id: TimerId) -> Option<u64> {
        let at = self.deadlines[id as usize].take()?;
        self.now = self.now.max(at);
        Some(at)
    }
}

impl Timer for FakeTimer {
    type Error = ();

    fn now(&self) -> u64 {
        self.now
    }
    fn start(&mut self, id: TimerId, duration_ms: u32) -> Result<(), Self::Error> {
        self.deadlines[id as usize] = Some(self.now + duration_ms as u64);
        Ok(())
    }
    fn stop(&mut self, id: TimerId) -> Result<(), Self::Error> {
        self.deadlines[id as usize] = None;
        Ok(())
    }
    fn is_started(&self, id: TimerId) -> bool {
        self.deadlines[id as usize].is_some()
    }
}

#[derive(Debug)]
pub struct FakeRng(StdRng);

impl Rng for FakeRng {
    type Error = ();

    fn next_u32(&mut self) -> Result<u32, Self::Error> {
        Ok(self.0.gen())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    groups: [Vec<u8>; 7],
    pub saves: usize,
}

impl MemoryStore {
    pub fn corrupt(&mut self, group: NvmGroup) {
        if let Some(byte) = self.groups[group as usize].first_mut() {
            *byte ^= 0xFF;
        }
    }

    pub fn is_stored(&self, group: NvmGroup) -> bool {
        !self.groups[group as usize].is_empty()
    }
}

impl NonVolatileStore for MemoryStore {
    type Error = ();

    fn save(&mut self, group: NvmGroup, data: &[u8]) -> Result<(), Self::Error> {
        self.groups[group as usize] = data.to_vec();
        self.saves += 1;
        Ok(())
    }
    fn load(&mut self, group: NvmGroup, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let data = &self.groups[group as usize];
        buf.get_mut(..data.len()).ok_or(())?.copy_from_slice(data);
        Ok(data.len())
    }
}

#[derive(Debug)]
pub struct FakeDevice {
    pub radio: FakeRadio,
    pub timer: FakeTimer,
    pub rng: FakeRng,
    pub store: MemoryStore,
    pub battery: Option<u8>,
}

impl FakeDevice {
    pub fn new(seed: u64) -> Self {
        Self {
            radio: FakeRadio::default(),
            timer: FakeTimer::default(),
            rng: FakeRng(StdRng::seed_from_u64(seed)),
            store: MemoryStore::default(),
            battery: None,
        }
    }
}

impl Device for FakeDevice {
    type Timer = FakeTimer;
    type Radio = FakeRadio;
    type Rng = FakeRng;
    type NonVolatileStore = MemoryStore;

    fn timer(&mut self) -> &mut Self::Timer {
        &mut self.timer
    }
    fn radio(&mut self) -> &mut Self::Radio {
        &mut self.radio
    }
    fn rng(&mut self) -> &mut Self::Rng {
        &mut self.rng
    }
    fn non_volatile_store(&mut self) -> &mut Self::NonVolatileStore {
        &mut self.store
    }
    fn battery_level(&self) -> Option<u8> {
        self.battery
    }
}

/// Builds the downlinks a network server would send, with the device's keys.
pub struct FakeNetwork {
    pub crypto: Crypto,
    pub dev_addr: u32,
    pub join_nonce: u32,
    pub net_id: u32,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self { crypto: Crypto::new(ROOT_KEY), dev_addr: 0x2601_1BDA, join_nonce: 0, net_id: 0x13 }
    }

    /// Network side of an ABP session shared with the device.
    pub fn abp(crypto: &Crypto, dev_addr: u32) -> Self {
        Self { crypto: crypto.clone(), dev_addr, join_nonce: 0, net_id: 0x13 }
    }

    /// Join accept answering the join request carrying `dev_nonce`.
    pub fn join_accept(&mut self, dev_nonce: u16, dl_settings: u8, rx_delay: u8, cf_list: Option<[u8; 16]>) -> Vec<u8> {
        self.join_nonce += 1;
        let mut fields = Vec::new();
        fields.extend_from_slice(&self.join_nonce.to_le_bytes()[..3]);
        fields.extend_from_slice(&self.net_id.to_le_bytes()[..3]);
        fields.extend_from_slice(&self.dev_addr.to_le_bytes());
        fields.push(dl_settings);
        fields.push(rx_delay);
        if let Some(cf_list) = cf_list {
            fields.extend_from_slice(&cf_list);
        }
        let mhdr = MType::JoinAccept.mhdr();
        let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(&ROOT_KEY));
        mac.update(&[mhdr]);
        mac.update(&fields);
        fields.extend_from_slice(&mac.finalize().into_bytes()[..4]);
        let cipher = Aes128::new(GenericArray::from_slice(&ROOT_KEY));
        for block in fields.chunks_exact_mut(16) {
            cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        self.crypto.derive_session_keys(self.join_nonce, self.net_id, dev_nonce).unwrap();
        let mut frame = std::vec![mhdr];
        frame.extend_from_slice(&fields);
        frame
    }

    /// Multicast downlink of `group`, addressed to `address`.
    pub fn multicast_downlink(&self, group: u8, address: u32, fcnt: u32, port: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = std::vec![MType::UnconfirmedDataDown.mhdr()];
        frame.extend_from_slice(&address.to_le_bytes());
        frame.push(0);
        frame.extend_from_slice(&(fcnt as u16).to_le_bytes());
        frame.push(port);
        let mut encrypted = payload.to_vec();
        self.crypto
            .payload_encrypt(KeyId::McAppSKey(group), Direction::Down, address, fcnt, &mut encrypted)
            .unwrap();
        frame.extend_from_slice(&encrypted);
        let mic = self.crypto.compute_mic(KeyId::McNwkSKey(group), &frame, Direction::Down, address, fcnt).unwrap();
        frame.extend_from_slice(&mic);
        frame
    }

    /// Data downlink to the device.
    pub fn downlink(
        &self,
        confirmed: bool,
        fctrl: FCtrl,
        fcnt: u32,
        fopts: &[u8],
        port: Option<u8>,
        payload: &[u8],
    ) -> Vec<u8> {
        let mtype = if confirmed { MType::ConfirmedDataDown } else { MType::UnconfirmedDataDown };
        let mut frame = std::vec![mtype.mhdr()];
        frame.extend_from_slice(&self.dev_addr.to_le_bytes());
        let mut fctrl = fctrl;
        fctrl.set_f_opts_len(fopts.len() as u8);
        frame.push(fctrl.0);
        frame.extend_from_slice(&(fcnt as u16).to_le_bytes());
        frame.extend_from_slice(fopts);
        if let Some(port) = port {
            frame.push(port);
            let key = if port == 0 { KeyId::NwkSKey } else { KeyId::AppSKey };
            let mut encrypted = payload.to_vec();
            self.crypto.payload_encrypt(key, Direction::Down, self.dev_addr, fcnt, &mut encrypted).unwrap();
            frame.extend_from_slice(&encrypted);
        }
        let mic = self.crypto.compute_mic(KeyId::NwkSKey, &frame, Direction::Down, self.dev_addr, fcnt).unwrap();
        frame.extend_from_slice(&mic);
        frame
    }
}

/// 16 bit FCnt of an uplink data frame.
pub fn uplink_fcnt(frame: &[u8]) -> u16 {
    u16::from_le_bytes([frame[6], frame[7]])
}

/// FOpts of an uplink data frame.
pub fn uplink_fopts(frame: &[u8]) -> &[u8] {
    let len = (frame[5] & 0x0F) as usize;
    &frame[1 + FHDR_LEN..1 + FHDR_LEN + len]
}

/// A beacon as broadcast by the gateways of a region.
pub fn beacon(format: &BeaconFormat, time: u32) -> Vec<u8> {
    let crc = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);
    let mut frame = std::vec![0u8; format.rfu1_size as usize];
    frame.extend_from_slice(&time.to_le_bytes());
    frame.extend_from_slice(&crc.checksum(&frame).to_le_bytes());
    let mut gw = std::vec![0x00, 0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC];
    gw.extend(core::iter::repeat(0).take(format.rfu2_size as usize));
    frame.extend_from_slice(&gw);
    frame.extend_from_slice(&crc.checksum(&gw).to_le_bytes());
    frame
}

/// Owned copy of an indication.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub mcps: McpsType,
    pub multicast_group: Option<u8>,
    pub port: Option<u8>,
    pub payload: Vec<u8>,
    pub rx_slot: Window,
    pub ack_received: bool,
    pub frame_pending: bool,
    pub downlink_counter: u32,
}

/// Records every primitive delivered by the MAC.
#[derive(Debug, Default)]
pub struct EventLog {
    pub mcps_confirms: Vec<McpsConfirm>,
    pub received: Vec<Received>,
    pub mlme_confirms: Vec<MlmeConfirm>,
    pub mlme_indications: Vec<MlmeIndication>,
    pub nvm_changes: NvmGroups,
}

impl EventLog {
    pub fn last_mcps_confirm(&self) -> Option<&McpsConfirm> {
        self.mcps_confirms.last()
    }

    pub fn mlme_status(&self, mlme: MlmeType) -> Option<EventStatus> {
        self.mlme_confirms.iter().rev().find(|confirm| confirm.mlme == mlme).map(|confirm| confirm.status)
    }
}

impl Primitives for EventLog {
    fn mcps_confirm(&mut self, confirm: &McpsConfirm) {
        self.mcps_confirms.push(*confirm);
    }
    fn mcps_indication(&mut self, indication: &McpsIndication<'_>) {
        self.received.push(Received {
            mcps: indication.mcps,
            multicast_group: indication.multicast_group,
            port: indication.port,
            payload: indication.payload.to_vec(),
            rx_slot: indication.rx_slot,
            ack_received: indication.ack_received,
            frame_pending: indication.frame_pending,
            downlink_counter: indication.downlink_counter,
        });
    }
    fn mlme_confirm(&mut self, confirm: &MlmeConfirm) {
        self.mlme_confirms.push(*confirm);
    }
    fn mlme_indication(&mut self, indication: &MlmeIndication) {
        self.mlme_indications.push(*indication);
    }
    fn nvm_data_change(&mut self, groups: NvmGroups) {
        self.nvm_changes |= groups;
    }
}
