//! Application packages running on top of the handler, such as the certification protocol
//! or clock synchronization.

use heapless::Vec;

use crate::mac::primitives::{McpsConfirm, McpsIndication, MlmeConfirm, MlmeIndication};

/// Number of package slots.
pub const PACKAGE_MAX: usize = 4;
/// Largest uplink a package can request.
pub const PACKAGE_PAYLOAD_MAX_LEN: usize = 242;

/// Slot of a package in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PackageId {
    /// LoRaWAN certification protocol.
    Compliance = 0,
    /// Application layer clock synchronization.
    ClockSync = 1,
    /// Remote multicast setup.
    RemoteMcastSetup = 2,
    /// Fragmented data block transport.
    Fragmentation = 3,
}

/// Work a package asks the handler to do on its behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageRequest {
    /// Send an uplink.
    Send {
        #[allow(missing_docs)]
        port: u8,
        #[allow(missing_docs)]
        payload: Vec<u8, PACKAGE_PAYLOAD_MAX_LEN>,
        #[allow(missing_docs)]
        confirmed: bool,
    },
    /// Join the network again.
    Join,
    /// Ask the network for the time.
    DeviceTime,
}

/// A package. Only [`Package::id`] and [`Package::port`] are required, every notification
/// defaults to doing nothing.
pub trait Package {
    /// Registry slot.
    fn id(&self) -> PackageId;
    /// Application port the package listens on.
    fn port(&self) -> u8;
    /// A running package has exclusive use of the link, other ports are refused.
    fn is_running(&self) -> bool {
        false
    }
    /// Called from [`super::Handler::process`].
    fn process(&mut self) -> Option<PackageRequest> {
        None
    }
    #[allow(missing_docs)]
    fn on_mcps_confirm(&mut self, _confirm: &McpsConfirm) {}
    /// Data received on [`Package::port`].
    fn on_mcps_indication(&mut self, _indication: &McpsIndication<'_>) {}
    #[allow(missing_docs)]
    fn on_mlme_confirm(&mut self, _confirm: &MlmeConfirm) {}
    #[allow(missing_docs)]
    fn on_mlme_indication(&mut self, _indication: &MlmeIndication) {}
}

/// Registered packages, indexed by [`PackageId`].
#[derive(Default)]
pub struct Packages<'p> {
    slots: [Option<&'p mut dyn Package>; PACKAGE_MAX],
}

impl<'p> Packages<'p> {
    /// Place the package in its slot. `false` when the slot is taken.
    pub fn register(&mut self, package: &'p mut dyn Package) -> bool {
        let slot = &mut self.slots[package.id() as usize];
        if slot.is_some() {
            return false;
        }
        *slot = Some(package);
        true
    }

    #[allow(missing_docs)]
    pub fn is_registered(&self, id: PackageId) -> bool {
        self.slots[id as usize].is_some()
    }

    /// Is the package registered and running?
    pub fn is_running(&self, id: PackageId) -> bool {
        self.slots[id as usize].as_ref().is_some_and(|package| package.is_running())
    }

    /// Port of a registered package.
    pub fn port(&self, id: PackageId) -> Option<u8> {
        self.slots[id as usize].as_ref().map(|package| package.port())
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut (dyn Package + 'p)> {
        self.slots.iter_mut().filter_map(|slot| slot.as_deref_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Clock {
        running: bool,
    }

    impl Package for Clock {
        fn id(&self) -> PackageId {
            PackageId::ClockSync
        }
        fn port(&self) -> u8 {
            202
        }
        fn is_running(&self) -> bool {
            self.running
        }
    }

    #[test]
    fn slots_are_indexed_by_id() {
        let mut first = Clock { running: true };
        let mut second = Clock { running: false };
        let mut packages = Packages::default();
        assert!(!packages.is_registered(PackageId::ClockSync));
        assert!(packages.register(&mut first));
        assert!(!packages.register(&mut second));
        assert!(packages.is_running(PackageId::ClockSync));
        assert!(!packages.is_running(PackageId::Compliance));
        assert_eq!(packages.port(PackageId::ClockSync), Some(202));
        assert_eq!(packages.port(PackageId::Fragmentation), None);
        assert_eq!(packages.iter_mut().count(), 1);
    }
}
