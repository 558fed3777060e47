//! Persistent context of the MAC, split into groups that are saved and restored
//! independently. Each stored group is its postcard encoding followed by a little endian
//! CRC32.

use core::ops::{BitOr, BitOrAssign};

use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::class_b::ClassBParams;
use super::crypto::{CryptoNvm, KeyStore};
use super::multicast::MulticastGroups;
use super::region::band::Bands;
use super::types::{Configuration, Credentials, DeviceClass, Session, DR};
use crate::device::non_volatile_store::NonVolatileStore;
use crate::device::Device;

/// Largest encoded group, CRC included.
pub const NVM_GROUP_MAX_LEN: usize = 1536;
const CRC_LEN: usize = 4;
const NVM_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Error {
    Serialize,
    Deserialize,
    /// The stored CRC of the group does not match its content.
    Crc(NvmGroup),
    BufferTooSmall,
}

impl<D> From<Error> for crate::Error<D>
where
    D: Device,
{
    fn from(value: Error) -> Self {
        Self::Nvm(value)
    }
}

/// One independently stored part of the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NvmGroup {
    /// DevNonce, JoinNonce and frame counters.
    Crypto,
    /// Values changing with every uplink.
    MacGroup1,
    /// Session, configuration, class and multicast groups.
    MacGroup2,
    /// Keys and identifiers.
    SecureElement,
    /// Duty cycle ledger.
    RegionGroup1,
    /// Channels and channel mask.
    RegionGroup2,
    /// Ping slot and beacon parameters.
    ClassB,
}

impl NvmGroup {
    /// Every group, in restore order.
    pub const ALL: [NvmGroup; 7] = [
        NvmGroup::Crypto,
        NvmGroup::MacGroup1,
        NvmGroup::MacGroup2,
        NvmGroup::SecureElement,
        NvmGroup::RegionGroup1,
        NvmGroup::RegionGroup2,
        NvmGroup::ClassB,
    ];

    /// Flag of the group in [`NvmGroups`].
    pub fn flag(self) -> NvmGroups {
        NvmGroups(1 << self as u8)
    }
}

/// Set of NVM groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NvmGroups(u8);

#[allow(missing_docs)]
impl NvmGroups {
    pub const NONE: NvmGroups = NvmGroups(0);
    pub const CRYPTO: NvmGroups = NvmGroups(0x01);
    pub const MAC_GROUP1: NvmGroups = NvmGroups(0x02);
    pub const MAC_GROUP2: NvmGroups = NvmGroups(0x04);
    pub const SECURE_ELEMENT: NvmGroups = NvmGroups(0x08);
    pub const REGION_GROUP1: NvmGroups = NvmGroups(0x10);
    pub const REGION_GROUP2: NvmGroups = NvmGroups(0x20);
    pub const CLASS_B: NvmGroups = NvmGroups(0x40);
    pub const ALL: NvmGroups = NvmGroups(0x7F);

    /// Raw bits, bit n for the n-th group of [`NvmGroup::ALL`].
    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: NvmGroups) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: NvmGroups) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Groups of the set.
    pub fn iter(self) -> impl Iterator<Item = NvmGroup> {
        NvmGroup::ALL.into_iter().filter(move |group| self.contains(group.flag()))
    }
}

impl BitOr for NvmGroups {
    type Output = NvmGroups;

    fn bitor(self, rhs: Self) -> Self::Output {
        NvmGroups(self.0 | rhs.0)
    }
}

impl BitOrAssign for NvmGroups {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// MAC values changing with every uplink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MacGroup1 {
    pub(crate) adr_ack_counter: u16,
    /// A confirmed downlink awaits its acknowledgement.
    pub(crate) ack_next: bool,
    pub(crate) tx_data_rate: Option<DR>,
    pub(crate) tx_power: u8,
}

/// Stable MAC state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacGroup2 {
    pub(crate) configuration: Configuration,
    pub(crate) defaults: Configuration,
    pub(crate) session: Session,
    pub(crate) class: DeviceClass,
    pub(crate) multicast: MulticastGroups,
}

/// Secure element content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureElementNvm {
    pub(crate) keys: KeyStore,
    pub(crate) credentials: Credentials,
}

/// Everything the MAC needs to resume after power loss.
#[derive(Debug, Clone)]
pub struct PersistentContext<C> {
    #[allow(missing_docs)]
    pub crypto: CryptoNvm,
    #[allow(missing_docs)]
    pub mac_group1: MacGroup1,
    #[allow(missing_docs)]
    pub mac_group2: MacGroup2,
    #[allow(missing_docs)]
    pub secure_element: SecureElementNvm,
    #[allow(missing_docs)]
    pub region_group1: Bands,
    /// The channel plan.
    pub region_group2: C,
    #[allow(missing_docs)]
    pub class_b: ClassBParams,
}

/// Serialize a group and append its CRC.
pub fn encode<T: Serialize>(value: &T, buf: &mut [u8]) -> Result<usize, Error> {
    if buf.len() < CRC_LEN {
        return Err(Error::BufferTooSmall);
    }
    let body = buf.len() - CRC_LEN;
    let used = postcard::to_slice(value, &mut buf[..body]).map_err(|_| Error::Serialize)?.len();
    let crc = NVM_CRC.checksum(&buf[..used]);
    buf[used..used + CRC_LEN].copy_from_slice(&crc.to_le_bytes());
    Ok(used + CRC_LEN)
}

/// Check the CRC of a stored group and deserialize it.
pub fn decode<T: DeserializeOwned>(group: NvmGroup, data: &[u8]) -> Result<T, Error> {
    if data.len() < CRC_LEN {
        return Err(Error::Crc(group));
    }
    let (body, crc) = data.split_at(data.len() - CRC_LEN);
    if NVM_CRC.checksum(body).to_le_bytes() != crc {
        return Err(Error::Crc(group));
    }
    postcard::from_bytes(body).map_err(|_| Error::Deserialize)
}

impl<C> PersistentContext<C>
where
    C: Serialize + DeserializeOwned,
{
    fn encode_group(&self, group: NvmGroup, buf: &mut [u8]) -> Result<usize, Error> {
        match group {
            NvmGroup::Crypto => encode(&self.crypto, buf),
            NvmGroup::MacGroup1 => encode(&self.mac_group1, buf),
            NvmGroup::MacGroup2 => encode(&self.mac_group2, buf),
            NvmGroup::SecureElement => encode(&self.secure_element, buf),
            NvmGroup::RegionGroup1 => encode(&self.region_group1, buf),
            NvmGroup::RegionGroup2 => encode(&self.region_group2, buf),
            NvmGroup::ClassB => encode(&self.class_b, buf),
        }
    }

    fn decode_group(&mut self, group: NvmGroup, data: &[u8]) -> Result<(), Error> {
        match group {
            NvmGroup::Crypto => self.crypto = decode(group, data)?,
            NvmGroup::MacGroup1 => self.mac_group1 = decode(group, data)?,
            NvmGroup::MacGroup2 => self.mac_group2 = decode(group, data)?,
            NvmGroup::SecureElement => self.secure_element = decode(group, data)?,
            NvmGroup::RegionGroup1 => self.region_group1 = decode(group, data)?,
            NvmGroup::RegionGroup2 => self.region_group2 = decode(group, data)?,
            NvmGroup::ClassB => self.class_b = decode(group, data)?,
        }
        Ok(())
    }

    /// Write the given groups to the device store.
    pub fn save<D: Device>(&self, device: &mut D, groups: NvmGroups) -> Result<(), crate::Error<D>> {
        let mut buf = [0u8; NVM_GROUP_MAX_LEN];
        for group in groups.iter() {
            let len = self.encode_group(group, &mut buf)?;
            device
                .non_volatile_store()
                .save(group, &buf[..len])
                .map_err(crate::device::Error::NonVolatileStore)?;
            trace!("saved nvm group {:?}, {} bytes", group, len);
        }
        Ok(())
    }

    /// Overwrite fields with the stored groups. Groups never written and groups whose CRC
    /// does not match are skipped. Returns the restored groups.
    pub fn restore<D: Device>(&mut self, device: &mut D) -> Result<NvmGroups, crate::Error<D>> {
        let mut buf = [0u8; NVM_GROUP_MAX_LEN];
        let mut restored = NvmGroups::NONE;
        for group in NvmGroup::ALL {
            let len = device
                .non_volatile_store()
                .load(group, &mut buf)
                .map_err(crate::device::Error::NonVolatileStore)?;
            if len == 0 {
                continue;
            }
            match self.decode_group(group, buf.get(..len).ok_or(Error::BufferTooSmall)?) {
                Ok(()) => restored |= group.flag(),
                Err(err) => warn!("nvm group {:?} not restored: {:?}", group, err),
            }
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::region::channel_plan::dynamic::DynamicChannelPlan;
    use crate::mac::region::channel_plan::{Channel, ChannelPlan};
    use crate::mac::region::eu868::EU868;
    use crate::testing::FakeDevice;

    fn context() -> PersistentContext<DynamicChannelPlan<EU868>> {
        let configuration = Configuration::default_for::<EU868>();
        PersistentContext {
            crypto: CryptoNvm::default(),
            mac_group1: MacGroup1::default(),
            mac_group2: MacGroup2 {
                configuration,
                defaults: configuration,
                session: Session::default(),
                class: DeviceClass::A,
                multicast: [None; 4],
            },
            secure_element: SecureElementNvm::default(),
            region_group1: Bands::new::<EU868>(),
            region_group2: DynamicChannelPlan::default(),
            class_b: ClassBParams::default(),
        }
    }

    #[test]
    fn group_flags() {
        let mut groups = NvmGroups::CRYPTO | NvmGroups::CLASS_B;
        assert!(groups.contains(NvmGroups::CRYPTO));
        assert!(!groups.contains(NvmGroups::MAC_GROUP1));
        groups.insert(NvmGroup::MacGroup1.flag());
        assert_eq!(groups.bits(), 0x43);
        assert_eq!(
            groups.iter().collect::<std::vec::Vec<_>>(),
            [NvmGroup::Crypto, NvmGroup::MacGroup1, NvmGroup::ClassB]
        );
        assert_eq!(NvmGroup::ALL.iter().fold(NvmGroups::NONE, |all, g| all | g.flag()), NvmGroups::ALL);
    }

    #[test]
    fn save_then_restore_every_group() {
        let mut device = FakeDevice::new(1);
        let mut ctx = context();
        ctx.crypto.fcnt_up = 42;
        ctx.crypto.dev_nonce = 7;
        ctx.mac_group1.adr_ack_counter = 12;
        ctx.mac_group2.session = Session::new(0x2601_1BDA, 0x13, crate::mac::types::Activation::Otaa);
        ctx.mac_group2.class = DeviceClass::C;
        ctx.region_group2.add_channel(3, Channel::new(867_100_000, DR::_0, DR::_5, 0)).unwrap();
        ctx.class_b.periodicity = 2;
        ctx.save(&mut device, NvmGroups::ALL).unwrap();

        let mut restored = context();
        assert_eq!(restored.restore(&mut device).unwrap(), NvmGroups::ALL);
        assert_eq!(restored.crypto, ctx.crypto);
        assert_eq!(restored.mac_group1, ctx.mac_group1);
        assert_eq!(restored.mac_group2, ctx.mac_group2);
        assert_eq!(restored.region_group1, ctx.region_group1);
        assert_eq!(restored.region_group2.channel(3), ctx.region_group2.channel(3));
        assert_eq!(restored.class_b.periodicity(), 2);
    }

    #[test]
    fn corrupted_group_is_skipped() {
        let mut device = FakeDevice::new(1);
        let mut ctx = context();
        ctx.crypto.fcnt_up = 42;
        ctx.mac_group1.adr_ack_counter = 5;
        ctx.save(&mut device, NvmGroups::CRYPTO | NvmGroups::MAC_GROUP1).unwrap();
        device.store.corrupt(NvmGroup::Crypto);

        let mut restored = context();
        assert_eq!(restored.restore(&mut device).unwrap(), NvmGroups::MAC_GROUP1);
        assert_eq!(restored.crypto.fcnt_up, 0);
        assert_eq!(restored.mac_group1.adr_ack_counter, 5);
    }

    #[test]
    fn decode_checks_crc() {
        let mut buf = [0u8; 64];
        let len = encode(&MacGroup1 { adr_ack_counter: 3, ..Default::default() }, &mut buf).unwrap();
        let group: MacGroup1 = decode(NvmGroup::MacGroup1, &buf[..len]).unwrap();
        assert_eq!(group.adr_ack_counter, 3);
        buf[0] ^= 0xFF;
        assert_eq!(decode::<MacGroup1>(NvmGroup::MacGroup1, &buf[..len]), Err(Error::Crc(NvmGroup::MacGroup1)));
        assert_eq!(encode(&MacGroup1::default(), &mut buf[..2]), Err(Error::BufferTooSmall));
    }
}
