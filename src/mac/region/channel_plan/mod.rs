//! Channel lists, channel masks and channel selection.

use heapless::Vec;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::band::{Bands, DutyCycleContext};
use super::{Error, InitType, Region};
use crate::mac::commands::LinkAdrReq;
use crate::mac::types::{Frame, DR};

pub mod dynamic;
pub mod fixed;

/// Number of 16 bit words of a channel mask.
pub const CHANNEL_MASK_WORDS: usize = 6;
/// Largest channel count a mask can describe.
pub const MAX_CHANNELS: usize = CHANNEL_MASK_WORDS * 16;

/// An uplink channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Channel {
    pub(crate) frequency: u32,
    pub(crate) rx1_frequency: Option<u32>,
    pub(crate) min_dr: DR,
    pub(crate) max_dr: DR,
    pub(crate) band: u8,
}

impl Channel {
    /// Creation.
    pub fn new(frequency: u32, min_dr: DR, max_dr: DR, band: u8) -> Self {
        Self { frequency, rx1_frequency: None, min_dr, max_dr, band }
    }

    /// Uplink frequency.
    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    /// RX1 frequency, the uplink frequency unless DlChannelReq moved it.
    pub fn rx1_frequency(&self) -> u32 {
        self.rx1_frequency.unwrap_or(self.frequency)
    }

    /// Uplink datarate range.
    pub fn data_rate_range(&self) -> (DR, DR) {
        (self.min_dr, self.max_dr)
    }

    /// Duty cycle band.
    pub fn band(&self) -> u8 {
        self.band
    }

    /// Can the channel carry the datarate?
    pub fn supports(&self, dr: DR) -> bool {
        dr.in_range((self.min_dr, self.max_dr))
    }
}

/// Bitset of enabled channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelMask([u16; CHANNEL_MASK_WORDS]);

impl ChannelMask {
    /// Mask from raw words, channel 0 in bit 0 of word 0.
    pub fn new(words: [u16; CHANNEL_MASK_WORDS]) -> Self {
        Self(words)
    }

    /// Raw words.
    pub fn words(&self) -> [u16; CHANNEL_MASK_WORDS] {
        self.0
    }

    /// Verifies if a given channel is enabled.
    pub fn is_enabled(&self, index: usize) -> bool {
        index < MAX_CHANNELS && self.0[index / 16] & (1 << (index % 16)) != 0
    }

    /// Enable or disable a channel. Indexes past the mask are ignored.
    pub fn set(&mut self, index: usize, enable: bool) {
        if index >= MAX_CHANNELS {
            return;
        }
        if enable {
            self.0[index / 16] |= 1 << (index % 16);
        } else {
            self.0[index / 16] &= !(1 << (index % 16));
        }
    }

    /// Replace one word.
    pub fn set_word(&mut self, word: usize, value: u16) {
        if let Some(w) = self.0.get_mut(word) {
            *w = value;
        }
    }

    /// Number of enabled channels among `range`.
    pub fn count(&self, range: core::ops::Range<usize>) -> usize {
        range.filter(|index| self.is_enabled(*index)).count()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// Enable every channel enabled in `other`.
    pub fn union(&mut self, other: &ChannelMask) {
        for (w, o) in self.0.iter_mut().zip(other.0.iter()) {
            *w |= o;
        }
    }

    /// Channels enabled in both masks.
    pub fn intersection(&self, other: &ChannelMask) -> ChannelMask {
        let mut mask = *self;
        for (w, o) in mask.0.iter_mut().zip(other.0.iter()) {
            *w &= o;
        }
        mask
    }
}

/// Inputs of a channel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NextChannelParams {
    /// Datarate of the pending frame.
    pub data_rate: DR,
    #[allow(missing_docs)]
    pub frame: Frame,
    /// Time on air of the pending frame.
    pub toa_ms: u32,
    #[allow(missing_docs)]
    pub duty_cycle: DutyCycleContext,
}

/// Channel list and mask of a region, owned by the MAC and only changed through these
/// operations.
pub trait ChannelPlan<R>: Default + Clone + Serialize + DeserializeOwned
where
    R: Region,
{
    /// Restore defaults. The default channels are enabled afterwards for every init type.
    fn init_defaults(&mut self, init: InitType);
    /// All channel slots.
    fn channels(&self) -> &[Option<Channel>];
    /// Look up a channel.
    fn channel(&self, index: usize) -> Option<&Channel> {
        self.channels().get(index).and_then(Option::as_ref)
    }
    /// Enabled channels.
    fn mask(&self) -> &ChannelMask;
    /// Mask enabling the default channels.
    fn default_mask(&self) -> ChannelMask;
    /// Replace the mask. Only defined channels may be enabled.
    fn set_mask(&mut self, mask: ChannelMask) -> Result<(), Error> {
        for index in 0..MAX_CHANNELS {
            if mask.is_enabled(index) && self.channel(index).is_none() {
                return Err(Error::InvalidChannelIndex);
            }
        }
        self.commit_mask(mask);
        Ok(())
    }
    /// Install an already validated mask.
    fn commit_mask(&mut self, mask: ChannelMask);
    /// Apply the CFList of a join accept.
    fn apply_cf_list(&mut self, cf_list: &[u8; 16]) -> Result<(), Error>;
    /// Pick the channel of the next uplink.
    fn next_channel(
        &mut self,
        bands: &mut Bands,
        params: &NextChannelParams,
        random: u32,
    ) -> Result<usize, Error>;
    /// Apply one LinkADRReq to a working copy of the mask, `false` when it is invalid.
    fn apply_link_adr_mask(&self, mask: &mut ChannelMask, req: &LinkAdrReq) -> bool;
    /// Can the mask be used at the datarate?
    fn mask_is_valid(&self, mask: &ChannelMask, _dr: DR) -> bool {
        !mask.is_empty()
    }
    /// Does an enabled channel of the mask support the datarate?
    fn mask_supports_data_rate(&self, mask: &ChannelMask, dr: DR) -> bool {
        self.channels()
            .iter()
            .enumerate()
            .any(|(index, channel)| mask.is_enabled(index) && channel.is_some_and(|c| c.supports(dr)))
    }
    /// NewChannelReq, returning the answer status or `None` when the region sends no answer.
    fn new_channel_req(&mut self, index: u8, frequency: u32, min_dr: u8, max_dr: u8) -> Option<u8>;
    /// DlChannelReq, returning the answer status or `None` when the region sends no answer.
    fn dl_channel_req(&mut self, index: u8, frequency: u32) -> Option<u8>;
    /// Define an additional channel.
    fn add_channel(&mut self, index: usize, channel: Channel) -> Result<(), Error>;
    /// Remove an additional channel.
    fn remove_channel(&mut self, index: usize) -> Result<(), Error>;
    /// Restrict uplinks to one 8 channel sub-band, numbered from 1. 0 enables all channels.
    fn set_sub_band(&mut self, sub_band: u8) -> Result<(), Error>;
}

/// Pick uniformly among the candidates whose band has enough credit for the frame, or report
/// the shortest wait.
pub(crate) fn pick_channel<const N: usize>(
    candidates: &Vec<usize, N>,
    channels: &[Option<Channel>],
    bands: &mut Bands,
    params: &NextChannelParams,
    random: u32,
) -> Result<usize, Error> {
    if candidates.is_empty() {
        return Err(Error::NoValidChannelFound);
    }
    let ctx = &params.duty_cycle;
    let aggregated = bands.aggregated_wait(ctx.now);
    if aggregated > 0 {
        return Err(Error::DutyCycleRestricted { wait_ms: aggregated });
    }
    bands.refresh(ctx);
    let mut ready: Vec<usize, N> = Vec::new();
    let mut min_wait = u64::MAX;
    for index in candidates.iter() {
        let Some(channel) = channels.get(*index).and_then(Option::as_ref) else {
            continue;
        };
        match bands.wait_for(channel.band, params.toa_ms, ctx) {
            Some(0) => {
                // Both vectors share the capacity N.
                let _ = ready.push(*index);
            }
            Some(wait) => min_wait = min_wait.min(wait),
            None => {}
        }
    }
    if ready.is_empty() {
        return if min_wait == u64::MAX {
            Err(Error::NoValidChannelFound)
        } else {
            trace!("duty cycle restricted for {} ms", min_wait);
            Err(Error::DutyCycleRestricted { wait_ms: min_wait })
        };
    }
    Ok(ready[random as usize % ready.len()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_bits() {
        let mut mask = ChannelMask::default();
        assert!(mask.is_empty());
        mask.set(3, true);
        mask.set(71, true);
        mask.set(200, true);
        assert!(mask.is_enabled(3));
        assert!(mask.is_enabled(71));
        assert!(!mask.is_enabled(200));
        assert_eq!(mask.count(0..96), 2);
        assert_eq!(mask.words()[4], 0x0080);
        let mut other = ChannelMask::default();
        other.set(3, true);
        assert_eq!(mask.intersection(&other).count(0..96), 1);
        other.union(&mask);
        assert_eq!(other, mask);
    }
}
