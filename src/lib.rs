#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

#[macro_use]
mod fmt;

use device::Device;
use mac::region;

pub mod device;
pub mod handler;
pub mod mac;

#[cfg(test)]
mod testing;

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Error<D>
where
    D: Device,
{
    Device(device::Error<D>),
    Region(region::Error),
    Mac(mac::Error),
    Crypto(mac::crypto::Error),
    Nvm(mac::nvm::Error),
}
