//! Fixed channel plan processing.
//!
//! All channels are known up front, the network only moves the mask. Uplinks hop through the
//! enabled channels without repetition, joins rotate through the 8 channel blocks.

use core::marker::PhantomData;

use heapless::Vec;
use serde::{Deserialize, Serialize};

use super::{pick_channel, Channel, ChannelMask, ChannelPlan, NextChannelParams};
use crate::mac::commands::LinkAdrReq;
use crate::mac::region::band::Bands;
use crate::mac::region::{Error, InitType, Region};
use crate::mac::types::{Frame, DR};

/// Channel count of fixed plans.
pub const MAX_FIXED_CHANNELS: usize = 72;
/// Number of 125 kHz channels.
pub const NUM_OF_125KHZ_CHANNELS: usize = 64;
/// Channels per block.
pub const NUM_OF_CHANNELS_IN_BLOCK: usize = 8;
/// Number of 8 channel blocks.
pub const NUM_OF_CHANNEL_BLOCKS: usize = NUM_OF_125KHZ_CHANNELS / NUM_OF_CHANNELS_IN_BLOCK;

/// Channel list of US915-like regions.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct FixedChannelPlan<R>
where
    R: Region,
{
    channels: Vec<Option<Channel>, MAX_FIXED_CHANNELS>,
    mask: ChannelMask,
    remaining: ChannelMask,
    join_block: u8,
    #[serde(skip)]
    region: PhantomData<R>,
}

impl<R: Region> Clone for FixedChannelPlan<R> {
    fn clone(&self) -> Self {
        Self {
            channels: self.channels.clone(),
            mask: self.mask,
            remaining: self.remaining,
            join_block: self.join_block,
            region: PhantomData,
        }
    }
}

impl<R: Region> core::fmt::Debug for FixedChannelPlan<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FixedChannelPlan")
            .field("mask", &self.mask)
            .field("remaining", &self.remaining)
            .field("join_block", &self.join_block)
            .finish()
    }
}

impl<R> Default for FixedChannelPlan<R>
where
    R: Region,
{
    fn default() -> Self {
        let mut plan = Self {
            channels: Vec::new(),
            mask: ChannelMask::default(),
            remaining: ChannelMask::default(),
            join_block: 0,
            region: PhantomData,
        };
        plan.init_defaults(InitType::All);
        plan
    }
}

impl<R> FixedChannelPlan<R>
where
    R: Region,
{
    fn restore_channels(&mut self) {
        self.channels.clear();
        for index in 0..R::max_channels().min(MAX_FIXED_CHANNELS) {
            // Capacity matches the loop bound.
            let _ = self.channels.push(Some(R::default_channel(index)));
        }
    }

    fn enable_block(mask: &mut ChannelMask, block: usize, enable: bool) {
        for index in block * NUM_OF_CHANNELS_IN_BLOCK..(block + 1) * NUM_OF_CHANNELS_IN_BLOCK {
            mask.set(index, enable);
        }
        mask.set(NUM_OF_125KHZ_CHANNELS + block, enable);
    }

    fn usable(&self, index: usize, mask: &ChannelMask, dr: DR) -> bool {
        mask.is_enabled(index) && self.channel(index).is_some_and(|c| c.supports(dr))
    }

    fn join_candidates(&mut self, dr: DR) -> Vec<usize, MAX_FIXED_CHANNELS> {
        let mut candidates = Vec::new();
        for step in 0..NUM_OF_CHANNEL_BLOCKS {
            let block = (self.join_block as usize + step) % NUM_OF_CHANNEL_BLOCKS;
            let first = block * NUM_OF_CHANNELS_IN_BLOCK;
            let indexes = (first..first + NUM_OF_CHANNELS_IN_BLOCK)
                .chain(core::iter::once(NUM_OF_125KHZ_CHANNELS + block));
            for index in indexes {
                if self.usable(index, &self.mask, dr) {
                    let _ = candidates.push(index);
                }
            }
            if !candidates.is_empty() {
                self.join_block = ((block + 1) % NUM_OF_CHANNEL_BLOCKS) as u8;
                break;
            }
        }
        candidates
    }

    fn data_candidates(&mut self, dr: DR) -> Vec<usize, MAX_FIXED_CHANNELS> {
        let mut candidates = Vec::new();
        for _ in 0..2 {
            let hop = self.mask.intersection(&self.remaining);
            for index in 0..self.channels.len() {
                if self.usable(index, &hop, dr) {
                    let _ = candidates.push(index);
                }
            }
            if !candidates.is_empty() {
                break;
            }
            self.remaining = self.mask;
        }
        candidates
    }
}

impl<R> ChannelPlan<R> for FixedChannelPlan<R>
where
    R: Region,
{
    fn init_defaults(&mut self, init: InitType) {
        match init {
            InitType::All | InitType::Channels => {
                self.restore_channels();
                self.mask = self.default_mask();
                self.join_block = 0;
            }
            InitType::Mask => {
                let default = self.default_mask();
                self.mask.union(&default);
            }
        }
        self.remaining = self.mask;
    }

    fn channels(&self) -> &[Option<Channel>] {
        &self.channels
    }

    fn mask(&self) -> &ChannelMask {
        &self.mask
    }

    fn default_mask(&self) -> ChannelMask {
        let mut mask = ChannelMask::default();
        for index in 0..R::default_channels().min(MAX_FIXED_CHANNELS) {
            mask.set(index, true);
        }
        mask
    }

    fn commit_mask(&mut self, mask: ChannelMask) {
        self.mask = mask;
        self.remaining = self.remaining.intersection(&mask);
    }

    fn apply_cf_list(&mut self, cf_list: &[u8; 16]) -> Result<(), Error> {
        if cf_list[15] != 1 {
            return Err(Error::InvalidCfListType);
        }
        let mut mask = ChannelMask::default();
        for word in 0..5 {
            let value = u16::from_le_bytes([cf_list[2 * word], cf_list[2 * word + 1]]);
            mask.set_word(word, if word == 4 { value & 0x00FF } else { value });
        }
        if mask.is_empty() {
            warn!("ignoring CFList disabling all channels");
            return Ok(());
        }
        self.mask = mask;
        self.remaining = mask;
        Ok(())
    }

    fn next_channel(
        &mut self,
        bands: &mut Bands,
        params: &NextChannelParams,
        random: u32,
    ) -> Result<usize, Error> {
        if self.mask.is_empty() {
            debug!("no channel enabled, reactivating default channels");
            self.init_defaults(InitType::Mask);
        }
        let candidates = match params.frame {
            Frame::Join => self.join_candidates(params.data_rate),
            Frame::Data => self.data_candidates(params.data_rate),
        };
        let index = pick_channel(&candidates, &self.channels, bands, params, random)?;
        if params.frame == Frame::Data {
            self.remaining.set(index, false);
        }
        Ok(index)
    }

    fn apply_link_adr_mask(&self, mask: &mut ChannelMask, req: &LinkAdrReq) -> bool {
        let bits = req.channel_mask;
        match req.channel_mask_control {
            cntl @ 0..=4 => {
                let word = cntl as usize;
                mask.set_word(word, if word == 4 { bits & 0x00FF } else { bits });
            }
            5 => {
                for block in 0..NUM_OF_CHANNEL_BLOCKS {
                    Self::enable_block(mask, block, bits & (1 << block) != 0);
                }
            }
            cntl @ (6 | 7) => {
                for index in 0..NUM_OF_125KHZ_CHANNELS {
                    mask.set(index, cntl == 6);
                }
                mask.set_word(4, bits & 0x00FF);
            }
            _ => return false,
        }
        true
    }

    fn mask_is_valid(&self, mask: &ChannelMask, dr: DR) -> bool {
        if mask.is_empty() {
            return false;
        }
        dr >= DR::_4 || mask.count(0..NUM_OF_125KHZ_CHANNELS) >= 2
    }

    fn new_channel_req(&mut self, _index: u8, _frequency: u32, _min_dr: u8, _max_dr: u8) -> Option<u8> {
        None
    }

    fn dl_channel_req(&mut self, _index: u8, _frequency: u32) -> Option<u8> {
        None
    }

    fn add_channel(&mut self, _index: usize, _channel: Channel) -> Result<(), Error> {
        Err(Error::CommandNotImplementedForRegion)
    }

    fn remove_channel(&mut self, _index: usize) -> Result<(), Error> {
        Err(Error::CommandNotImplementedForRegion)
    }

    fn set_sub_band(&mut self, sub_band: u8) -> Result<(), Error> {
        let mut mask = ChannelMask::default();
        match sub_band as usize {
            0 => mask = self.default_mask(),
            n @ 1..=NUM_OF_CHANNEL_BLOCKS => Self::enable_block(&mut mask, n - 1, true),
            _ => return Err(Error::InvalidChannelIndex),
        }
        self.mask = mask;
        self.remaining = mask;
        self.join_block = sub_band.saturating_sub(1);
        Ok(())
    }
}
