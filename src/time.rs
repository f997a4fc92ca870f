use core::cell::Cell;

use embedded_time::{Clock, Instant, duration::Milliseconds, rate::Fraction};

/// Millisecond clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: Cell<u64>,
}

impl ManualClock {
    pub const fn new() -> Self {
        Self { ticks: Cell::new(0) }
    }

    pub fn advance(&self, by: Milliseconds<u32>) {
        self.ticks.set(self.ticks.get() + u64::from(by.0));
    }

    pub fn set(&self, now: Milliseconds<u64>) {
        self.ticks.set(now.0);
    }
}

impl Clock for ManualClock {
    type T = u64;

    const SCALING_FACTOR: Fraction = Fraction::new(1, 1_000);

    fn try_now(&self) -> Result<Instant<Self>, embedded_time::clock::Error> {
        Ok(Instant::new(self.ticks.get()))
    }
}

pub fn to_millis<C: Clock<T = u64>>(instant: &Instant<C>) -> Milliseconds<u64> {
    let ticks = instant.duration_since_epoch().integer() as u128;
    let numerator = *C::SCALING_FACTOR.numerator() as u128;
    let denominator = *C::SCALING_FACTOR.denominator() as u128;

    Milliseconds((ticks * 1_000 * numerator / denominator) as u64)
}

#[cfg(feature = "embassy")]
pub use embassy::EmbassyClock;

#[cfg(feature = "embassy")]
mod embassy {
    use embedded_time::{Clock, Instant, rate::Fraction};

    /// Microsecond clock backed by the embassy time driver.
    pub struct EmbassyClock {
        start: embassy_time::Instant,
    }

    impl Default for EmbassyClock {
        fn default() -> Self {
            Self {
                start: embassy_time::Instant::now(),
            }
        }
    }

    impl Clock for EmbassyClock {
        type T = u64;

        const SCALING_FACTOR: Fraction = Fraction::new(1, 1_000_000);

        fn try_now(&self) -> Result<Instant<Self>, embedded_time::clock::Error> {
            let elapsed = embassy_time::Instant::now().duration_since(self.start);

            Ok(Instant::new(elapsed.as_micros()))
        }
    }
}
