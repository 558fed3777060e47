use core::fmt::Debug;

/// Source of randomness for channel selection and retransmission jitter.
pub trait Rng {
    #[cfg(feature = "defmt")]
    /// Generator error.
    type Error: Debug + defmt::Format;

    #[cfg(not(feature = "defmt"))]
    /// Generator error.
    type Error: Debug;

    /// Next random value.
    fn next_u32(&mut self) -> Result<u32, Self::Error>;

    /// Uniform value in `min..=max`.
    fn next_in(&mut self, min: u32, max: u32) -> Result<u32, Self::Error> {
        let span = max.saturating_sub(min).saturating_add(1);
        Ok(min + self.next_u32()? % span)
    }
}
