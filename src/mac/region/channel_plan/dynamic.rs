//! Dynamic channel plan: a few default channels plus channels added by the network.

use core::marker::PhantomData;

use heapless::Vec;
use serde::{Deserialize, Serialize};

use super::{pick_channel, Channel, ChannelMask, ChannelPlan, NextChannelParams};
use crate::mac::commands::LinkAdrReq;
use crate::mac::frame::u24_le;
use crate::mac::region::band::Bands;
use crate::mac::region::{Error, InitType, Region, VerifyAttribute};
use crate::mac::types::{Frame, DR};

/// Channel count of dynamic plans.
pub const MAX_DYNAMIC_CHANNELS: usize = 16;
const CF_LIST_CHANNELS: usize = 5;

/// Channel list of EU868-like regions.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct DynamicChannelPlan<R>
where
    R: Region,
{
    channels: [Option<Channel>; MAX_DYNAMIC_CHANNELS],
    mask: ChannelMask,
    #[serde(skip)]
    region: PhantomData<R>,
}

impl<R: Region> Clone for DynamicChannelPlan<R> {
    fn clone(&self) -> Self {
        Self { channels: self.channels, mask: self.mask, region: PhantomData }
    }
}

impl<R: Region> core::fmt::Debug for DynamicChannelPlan<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DynamicChannelPlan")
            .field("channels", &self.channels)
            .field("mask", &self.mask)
            .finish()
    }
}

impl<R> Default for DynamicChannelPlan<R>
where
    R: Region,
{
    fn default() -> Self {
        let mut plan = Self {
            channels: [None; MAX_DYNAMIC_CHANNELS],
            mask: ChannelMask::default(),
            region: PhantomData,
        };
        plan.init_defaults(InitType::All);
        plan
    }
}

impl<R> DynamicChannelPlan<R>
where
    R: Region,
{
    fn restore_default_channels(&mut self) {
        for index in 0..R::default_channels() {
            self.channels[index] = Some(R::default_channel(index));
        }
    }

    fn is_enabled_and_defined(&self, index: usize) -> bool {
        self.mask.is_enabled(index) && self.channels[index].is_some()
    }
}

impl<R> ChannelPlan<R> for DynamicChannelPlan<R>
where
    R: Region,
{
    fn init_defaults(&mut self, init: InitType) {
        match init {
            InitType::All => {
                self.channels = [None; MAX_DYNAMIC_CHANNELS];
                self.restore_default_channels();
                self.mask = self.default_mask();
            }
            InitType::Channels => {
                self.restore_default_channels();
                self.mask = self.default_mask();
            }
            InitType::Mask => {
                let default = self.default_mask();
                self.mask.union(&default);
            }
        }
    }

    fn channels(&self) -> &[Option<Channel>] {
        &self.channels
    }

    fn mask(&self) -> &ChannelMask {
        &self.mask
    }

    fn default_mask(&self) -> ChannelMask {
        let mut mask = ChannelMask::default();
        for index in 0..R::default_channels() {
            mask.set(index, true);
        }
        mask
    }

    fn commit_mask(&mut self, mask: ChannelMask) {
        self.mask = mask;
    }

    fn apply_cf_list(&mut self, cf_list: &[u8; 16]) -> Result<(), Error> {
        if cf_list[15] != 0 {
            return Err(Error::InvalidCfListType);
        }
        for k in 0..CF_LIST_CHANNELS {
            let index = R::default_channels() + k;
            if index >= MAX_DYNAMIC_CHANNELS {
                break;
            }
            let frequency = u24_le(&cf_list[3 * k..3 * k + 3]) * 100;
            if frequency == 0 {
                self.channels[index] = None;
                self.mask.set(index, false);
                continue;
            }
            // Best effort, unusable frequencies are skipped.
            if let Some(band) = R::band_for_frequency(frequency) {
                self.channels[index] = Some(Channel::new(frequency, DR::_0, DR::_5, band));
                self.mask.set(index, true);
            }
        }
        Ok(())
    }

    fn next_channel(
        &mut self,
        bands: &mut Bands,
        params: &NextChannelParams,
        random: u32,
    ) -> Result<usize, Error> {
        if !(0..MAX_DYNAMIC_CHANNELS).any(|index| self.is_enabled_and_defined(index)) {
            debug!("no channel enabled, reactivating default channels");
            self.init_defaults(InitType::Mask);
        }
        let limit = match params.frame {
            Frame::Join => R::default_channels(),
            Frame::Data => MAX_DYNAMIC_CHANNELS,
        };
        let mut candidates: Vec<usize, MAX_DYNAMIC_CHANNELS> = Vec::new();
        for index in 0..limit {
            if let Some(channel) = self.channels[index] {
                if self.mask.is_enabled(index) && channel.supports(params.data_rate) {
                    let _ = candidates.push(index);
                }
            }
        }
        pick_channel(&candidates, &self.channels, bands, params, random)
    }

    fn apply_link_adr_mask(&self, mask: &mut ChannelMask, req: &LinkAdrReq) -> bool {
        match req.channel_mask_control {
            0 => {
                for index in 0..MAX_DYNAMIC_CHANNELS {
                    let enable = req.channel_mask & (1 << index) != 0;
                    if enable && self.channels[index].is_none() {
                        return false;
                    }
                    mask.set(index, enable);
                }
                true
            }
            6 => {
                for index in 0..MAX_DYNAMIC_CHANNELS {
                    mask.set(index, self.channels[index].is_some());
                }
                true
            }
            _ => false,
        }
    }

    fn new_channel_req(&mut self, index: u8, frequency: u32, min_dr: u8, max_dr: u8) -> Option<u8> {
        let index = index as usize;
        if index < R::default_channels() || index >= MAX_DYNAMIC_CHANNELS {
            return Some(0);
        }
        if frequency == 0 {
            self.channels[index] = None;
            self.mask.set(index, false);
            return Some(0x03);
        }
        let dr_range = match (DR::try_from(min_dr), DR::try_from(max_dr)) {
            (Ok(min), Ok(max))
                if min <= max
                    && crate::mac::region::verify::<R>(VerifyAttribute::TxDr(min))
                    && crate::mac::region::verify::<R>(VerifyAttribute::TxDr(max)) =>
            {
                Some((min, max))
            }
            _ => None,
        };
        let band = R::band_for_frequency(frequency);
        if let (Some((min, max)), Some(band)) = (dr_range, band) {
            self.channels[index] = Some(Channel::new(frequency, min, max, band));
            self.mask.set(index, true);
        }
        Some((band.is_some() as u8) | (dr_range.is_some() as u8) << 1)
    }

    fn dl_channel_req(&mut self, index: u8, frequency: u32) -> Option<u8> {
        let frequency_ok = R::verify_rx_frequency(frequency);
        let channel = self.channels.get_mut(index as usize).and_then(Option::as_mut);
        let exists = channel.is_some();
        if let (Some(channel), true) = (channel, frequency_ok) {
            channel.rx1_frequency = Some(frequency);
        }
        Some((frequency_ok as u8) | (exists as u8) << 1)
    }

    fn add_channel(&mut self, index: usize, channel: Channel) -> Result<(), Error> {
        if index < R::default_channels() || index >= MAX_DYNAMIC_CHANNELS {
            return Err(Error::InvalidChannelIndex);
        }
        let band = R::band_for_frequency(channel.frequency).ok_or(Error::InvalidFrequency)?;
        if channel.min_dr > channel.max_dr {
            return Err(Error::DataRateNotSupported(channel.min_dr));
        }
        self.channels[index] = Some(Channel { band, ..channel });
        self.mask.set(index, true);
        Ok(())
    }

    fn remove_channel(&mut self, index: usize) -> Result<(), Error> {
        if index < R::default_channels() || index >= MAX_DYNAMIC_CHANNELS {
            return Err(Error::InvalidChannelIndex);
        }
        self.channels[index] = None;
        self.mask.set(index, false);
        Ok(())
    }

    fn set_sub_band(&mut self, _sub_band: u8) -> Result<(), Error> {
        Err(Error::CommandNotImplementedForRegion)
    }
}
