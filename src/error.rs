/// An enum representing all possible errors that the chip may encounter during construction.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The clock rate produces a degenerate (zero or negative) sample period.
    #[error("the clock rate is too low to derive a sample rate")]
    ClockRateTooLow,
}
