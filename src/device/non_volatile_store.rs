//! Storage capability supporting persistence during power-off which must be implemented by calling code.

use core::fmt::Debug;

use crate::mac::nvm::NvmGroup;

/// Keeps one serialized blob per NVM group.
pub trait NonVolatileStore {
    #[cfg(feature = "defmt")]
    /// Storage error.
    type Error: Debug + defmt::Format;

    #[cfg(not(feature = "defmt"))]
    /// Storage error.
    type Error: Debug;

    /// Replace the stored blob of a group.
    fn save(&mut self, group: NvmGroup, data: &[u8]) -> Result<(), Self::Error>;

    /// Copy the stored blob of a group into `buf`, returning its length. A group never
    /// written yields 0.
    fn load(&mut self, group: NvmGroup, buf: &mut [u8]) -> Result<usize, Self::Error>;
}
