//! Class B: beacon parsing, time reference and ping slot scheduling.
//!
//! The beacon period is 128 s of GPS time. The first 2.12 s are reserved for the beacon, the
//! rest is cut into 4096 slots of 30 ms, of which a device listens to one every
//! `ping_period` slots starting at a pseudo random offset.

use crc::{Crc, CRC_16_XMODEM};
use serde::{Deserialize, Serialize};

use super::crypto::Crypto;
use super::region::{BeaconFormat, Region};
use super::types::{RxChannelParams, DR};

/// Length of a beacon period.
pub const BEACON_INTERVAL_MS: u64 = 128_000;
/// Start of the ping slots relative to the beacon.
pub const BEACON_RESERVED_MS: u64 = 2_120;
/// Length of one ping slot.
pub const PING_SLOT_MS: u64 = 30;
/// Ping slots of a beacon period.
pub const PING_SLOT_WINDOW_SLOTS: u32 = 4096;
/// Without beacon for this long the device falls back to class A.
pub const BEACON_LOST_TIMEOUT_MS: u64 = 7_200_000;
/// Margin on both sides of the expected beacon while locked.
pub const BEACON_RX_GUARD_MS: u64 = 30;
/// Margin on both sides of the expected beacon when it is searched from a DeviceTime answer.
pub const BEACON_ACQUISITION_GUARD_MS: u64 = 1_000;
/// Default ping slot periodicity, one slot per beacon period.
pub const DEFAULT_PING_SLOT_PERIODICITY: u8 = 7;

const BEACON_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
const TIME_LEN: usize = 4;
const CRC_LEN: usize = 2;
const GW_SPECIFIC_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Error {
    InvalidLength,
    /// The CRC over the time field does not match.
    Crc,
}

/// Persistent class B settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClassBParams {
    pub(crate) periodicity: u8,
    pub(crate) beacon_frequency: Option<u32>,
    pub(crate) ping_slot_frequency: Option<u32>,
    pub(crate) ping_slot_data_rate: Option<DR>,
}

impl Default for ClassBParams {
    fn default() -> Self {
        Self {
            periodicity: DEFAULT_PING_SLOT_PERIODICITY,
            beacon_frequency: None,
            ping_slot_frequency: None,
            ping_slot_data_rate: None,
        }
    }
}

impl ClassBParams {
    /// Ping slot periodicity, a period of 2^periodicity seconds.
    pub fn periodicity(&self) -> u8 {
        self.periodicity
    }

    /// Slots between two ping slots of the device.
    pub fn ping_period(&self) -> u32 {
        1 << (5 + self.periodicity.min(7))
    }

    /// Ping slots of the device per beacon period.
    pub fn ping_nb(&self) -> u32 {
        1 << (7 - self.periodicity.min(7))
    }

    /// Beacon frequency of the period starting at `beacon_time`.
    pub fn beacon_frequency<R: Region>(&self, beacon_time: u32) -> u32 {
        self.beacon_frequency.unwrap_or_else(|| R::beacon_frequency(beacon_time))
    }

    /// Ping slot channel of the period starting at `beacon_time`.
    pub fn ping_slot_channel<R: Region>(&self, dev_addr: u32, beacon_time: u32) -> RxChannelParams {
        RxChannelParams {
            frequency: self
                .ping_slot_frequency
                .unwrap_or_else(|| R::ping_slot_frequency(dev_addr, beacon_time)),
            data_rate: self.ping_slot_data_rate.unwrap_or_else(R::beacon_data_rate),
        }
    }
}

/// GPS time in milliseconds observed at a local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimeReference {
    gps_ms: u64,
    local_ms: u64,
}

impl TimeReference {
    /// Creation.
    pub fn new(gps_ms: u64, local_ms: u64) -> Self {
        Self { gps_ms, local_ms }
    }

    /// Reference from a DeviceTimeAns describing the end of the uplink sent at `local_ms`.
    pub fn from_device_time(seconds: u32, fraction: u8, local_ms: u64) -> Self {
        Self::new(seconds as u64 * 1000 + fraction as u64 * 1000 / 256, local_ms)
    }

    /// GPS time at a local time.
    pub fn gps_at(&self, local_ms: u64) -> u64 {
        (self.gps_ms + local_ms).saturating_sub(self.local_ms)
    }

    /// Local time at a GPS time.
    pub fn local_at(&self, gps_ms: u64) -> u64 {
        (gps_ms + self.local_ms).saturating_sub(self.gps_ms)
    }
}

/// Decoded beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Beacon {
    /// GPS seconds of the start of the beacon period.
    pub time: u32,
    /// Gateway specific part, `None` when its CRC does not match.
    pub gw_specific: Option<[u8; GW_SPECIFIC_LEN]>,
}

/// Decode a beacon. Only the CRC over the time field is mandatory.
pub fn parse_beacon(format: &BeaconFormat, buf: &[u8]) -> Result<Beacon, Error> {
    if buf.len() != format.size as usize {
        return Err(Error::InvalidLength);
    }
    let rfu1 = format.rfu1_size as usize;
    let common_end = rfu1 + TIME_LEN;
    let crc1 = u16::from_le_bytes([buf[common_end], buf[common_end + 1]]);
    if BEACON_CRC.checksum(&buf[..common_end]) != crc1 {
        return Err(Error::Crc);
    }
    let time = u32::from_le_bytes([buf[rfu1], buf[rfu1 + 1], buf[rfu1 + 2], buf[rfu1 + 3]]);

    let gw_start = common_end + CRC_LEN;
    let gw_end = gw_start + GW_SPECIFIC_LEN + format.rfu2_size as usize;
    let crc2 = u16::from_le_bytes([buf[gw_end], buf[gw_end + 1]]);
    let gw_specific = (BEACON_CRC.checksum(&buf[gw_start..gw_end]) == crc2).then(|| {
        let mut gw = [0; GW_SPECIFIC_LEN];
        gw.copy_from_slice(&buf[gw_start..gw_start + GW_SPECIFIC_LEN]);
        gw
    });
    Ok(Beacon { time, gw_specific })
}

/// Ping slot offset of a beacon period, in slots.
pub fn ping_offset(beacon_time: u32, dev_addr: u32, ping_period: u32) -> u32 {
    let mut block = [0u8; 16];
    block[..4].copy_from_slice(&beacon_time.to_le_bytes());
    block[4..8].copy_from_slice(&dev_addr.to_le_bytes());
    Crypto::aes128(&[0; 16], &mut block);
    (block[0] as u32 + block[1] as u32 * 256) % ping_period.max(1)
}

/// Start of the beacon period containing `gps_ms`.
pub fn beacon_period_start(gps_ms: u64) -> u64 {
    gps_ms - gps_ms % BEACON_INTERVAL_MS
}

/// First beacon strictly after `gps_ms`.
pub fn next_beacon(gps_ms: u64) -> u64 {
    beacon_period_start(gps_ms) + BEACON_INTERVAL_MS
}

/// GPS time of the first ping slot of the device starting after `gps_ms`.
pub fn next_ping_slot(gps_ms: u64, dev_addr: u32, params: &ClassBParams) -> u64 {
    let period = params.ping_period();
    let mut start = beacon_period_start(gps_ms);
    loop {
        let beacon_time = (start / 1000) as u32;
        let offset = ping_offset(beacon_time, dev_addr, period);
        let mut slot = offset;
        while slot < PING_SLOT_WINDOW_SLOTS {
            let at = start + BEACON_RESERVED_MS + slot as u64 * PING_SLOT_MS;
            if at > gps_ms {
                return at;
            }
            slot += period;
        }
        start += BEACON_INTERVAL_MS;
    }
}

/// Beacon tracking state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BeaconState {
    /// No beacon tracking.
    #[default]
    Idle,
    /// Searching the first beacon.
    Acquisition,
    /// Beacons are received at the expected time.
    Locked,
}

/// Volatile class B state of the MAC.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClassB {
    pub(crate) state: BeaconState,
    pub(crate) time_reference: Option<TimeReference>,
    /// Local time of the start of the last received beacon period.
    pub(crate) last_beacon: Option<u64>,
    /// Periodicity sent in PingSlotInfoReq, committed by PingSlotInfoAns.
    pub(crate) pending_periodicity: Option<u8>,
    pub(crate) ping_slot_info_answered: bool,
    /// Local time of the next ping slot.
    pub(crate) next_ping_slot: Option<u64>,
    /// Beacon period the next ping slot belongs to.
    pub(crate) ping_slot_beacon_time: u32,
}

impl ClassB {
    /// Has no beacon been received for too long?
    pub(crate) fn beacon_lost(&self, now: u64) -> bool {
        match self.last_beacon {
            Some(last) => now.saturating_sub(last) >= BEACON_LOST_TIMEOUT_MS,
            None => true,
        }
    }

    /// Local time of the next ping slot after `now`, and the beacon time of its period.
    pub(crate) fn schedule_ping_slot(&mut self, now: u64, dev_addr: u32, params: &ClassBParams) -> Option<u64> {
        let reference = self.time_reference?;
        let gps = next_ping_slot(reference.gps_at(now), dev_addr, params);
        self.ping_slot_beacon_time = (beacon_period_start(gps) / 1000) as u32;
        let local = reference.local_at(gps);
        self.next_ping_slot = Some(local);
        Some(local)
    }
}
