//! Duty cycle bookkeeping per sub-band.
//!
//! Each band earns one millisecond of credit per elapsed millisecond, up to a maximum, and a
//! transmission costs its time on air multiplied by the band's duty cycle divisor.

use serde::{Deserialize, Serialize};

use super::Region;

/// Largest number of bands of any supported region.
pub const MAX_BANDS: usize = 6;
/// Credit window while joined or during the first hour of join attempts.
pub const DUTY_CYCLE_TIME_PERIOD_MS: u64 = 3_600_000;
/// Credit window of join attempts after the first hour.
pub const JOIN_BACKOFF_TIME_PERIOD_MS: u64 = 24 * DUTY_CYCLE_TIME_PERIOD_MS;

const JOIN_BACKOFF_STEP1_MS: u64 = DUTY_CYCLE_TIME_PERIOD_MS;
const JOIN_BACKOFF_STEP2_MS: u64 = 11 * DUTY_CYCLE_TIME_PERIOD_MS;

/// Join duty cycle divisor for the time elapsed since the first join attempt.
pub fn join_duty_cycle(elapsed_since_start: u64) -> u16 {
    if elapsed_since_start < JOIN_BACKOFF_STEP1_MS {
        100
    } else if elapsed_since_start < JOIN_BACKOFF_STEP2_MS {
        1000
    } else {
        10000
    }
}

/// Situation in which the ledger is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DutyCycleContext {
    /// Current time in milliseconds.
    pub now: u64,
    #[allow(missing_docs)]
    pub joined: bool,
    /// Regulatory duty cycle enforcement. Join back-off applies regardless.
    pub duty_cycle_enabled: bool,
    /// Time since the first join attempt, used for the join back-off.
    pub elapsed_since_start: u64,
}

impl DutyCycleContext {
    fn max_credits(&self) -> u64 {
        if self.joined || self.elapsed_since_start < JOIN_BACKOFF_STEP1_MS {
            DUTY_CYCLE_TIME_PERIOD_MS
        } else {
            JOIN_BACKOFF_TIME_PERIOD_MS
        }
    }

    fn unrestricted(&self) -> bool {
        self.joined && !self.duty_cycle_enabled
    }
}

/// Credit ledger of one band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Band {
    divisor: u16,
    time_credits: u64,
    last_update: Option<u64>,
}

impl Band {
    fn new(divisor: u16) -> Self {
        Self { divisor: divisor.max(1), time_credits: 0, last_update: None }
    }

    fn divisor(&self, ctx: &DutyCycleContext) -> u64 {
        let mut divisor = self.divisor;
        if !ctx.joined {
            divisor = divisor.max(join_duty_cycle(ctx.elapsed_since_start));
        }
        divisor as u64
    }

    fn refresh(&mut self, ctx: &DutyCycleContext) {
        let max = ctx.max_credits();
        self.time_credits = match self.last_update {
            None => max,
            Some(last) => self.time_credits.saturating_add(ctx.now.saturating_sub(last)).min(max),
        };
        self.last_update = Some(ctx.now);
    }

    /// Credit needed for a transmission of `toa_ms`.
    fn cost(&self, toa_ms: u32, ctx: &DutyCycleContext) -> u64 {
        toa_ms as u64 * self.divisor(ctx)
    }

    /// Remaining credit in milliseconds.
    pub fn time_credits(&self) -> u64 {
        self.time_credits
    }
}

/// Aggregated duty cycle imposed by DutyCycleReq.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct AggregatedTimeOff {
    last_tx_done: Option<u64>,
    time_off: u64,
}

/// The duty cycle ledger of a region.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bands {
    bands: [Option<Band>; MAX_BANDS],
    aggregated: AggregatedTimeOff,
}

impl Bands {
    /// Ledger with the region's bands, all credits granted on first use.
    pub fn new<R: Region>() -> Self {
        let mut bands = [None; MAX_BANDS];
        for (slot, divisor) in bands.iter_mut().zip(R::bands().iter()) {
            *slot = Some(Band::new(*divisor));
        }
        Self { bands, aggregated: AggregatedTimeOff::default() }
    }

    /// Look up a band.
    pub fn band(&self, index: u8) -> Option<&Band> {
        self.bands.get(index as usize).and_then(Option::as_ref)
    }

    /// Remaining aggregated time-off in milliseconds.
    pub fn aggregated_wait(&self, now: u64) -> u64 {
        match self.aggregated.last_tx_done {
            Some(last) => self.aggregated.time_off.saturating_sub(now.saturating_sub(last)),
            None => 0,
        }
    }

    /// Bring all credits up to date.
    pub fn refresh(&mut self, ctx: &DutyCycleContext) {
        for band in self.bands.iter_mut().flatten() {
            band.refresh(ctx);
        }
    }

    /// Time until the band can carry a transmission of `toa_ms`, zero when it can now.
    /// Call [`Bands::refresh`] first.
    pub fn wait_for(&self, index: u8, toa_ms: u32, ctx: &DutyCycleContext) -> Option<u64> {
        let band = self.band(index)?;
        if ctx.unrestricted() {
            return Some(0);
        }
        Some(band.cost(toa_ms, ctx).saturating_sub(band.time_credits))
    }

    /// Debit a completed transmission and arm the aggregated time-off.
    pub fn consume(&mut self, index: u8, toa_ms: u32, max_duty_cycle: u8, ctx: &DutyCycleContext) {
        let unrestricted = ctx.unrestricted();
        if let Some(Some(band)) = self.bands.get_mut(index as usize) {
            band.refresh(ctx);
            if !unrestricted {
                let cost = band.cost(toa_ms, ctx);
                band.time_credits = band.time_credits.saturating_sub(cost);
            }
        }
        let factor = 1u64 << max_duty_cycle.min(15);
        self.aggregated = AggregatedTimeOff {
            last_tx_done: Some(ctx.now),
            time_off: toa_ms as u64 * factor - toa_ms as u64,
        };
    }
}
