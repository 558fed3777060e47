//! Multicast groups received in class B ping slots or the class C window.

use serde::{Deserialize, Serialize};

use super::crypto::MAX_MC_GROUPS;
use super::types::{DeviceClass, DR};

/// Setup of one multicast group. Keys are held by the crypto service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MulticastChannel {
    /// McAddr.
    pub address: u32,
    /// Class B or class C reception.
    pub class: DeviceClass,
    #[allow(missing_docs)]
    pub frequency: u32,
    #[allow(missing_docs)]
    pub data_rate: DR,
    /// Class B ping slot periodicity.
    pub periodicity: u8,
    /// First accepted downlink counter.
    pub fcnt_min: u32,
    /// Last accepted downlink counter.
    pub fcnt_max: u32,
}

impl MulticastChannel {
    /// Does the group still accept this downlink counter?
    pub fn accepts(&self, fcnt: u32) -> bool {
        (self.fcnt_min..=self.fcnt_max).contains(&fcnt)
    }
}

/// The multicast group table.
pub type MulticastGroups = [Option<MulticastChannel>; MAX_MC_GROUPS];

/// Group whose address matches, if any.
pub fn find_group(groups: &MulticastGroups, address: u32) -> Option<u8> {
    groups
        .iter()
        .position(|group| group.is_some_and(|g| g.address == address))
        .map(|index| index as u8)
}
