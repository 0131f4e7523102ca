//! # Card-Clock Divider Computation
//!
//! ## Overview
//!
//! The engine derives the card clock from one reference clock through a
//! backend-specific divider. Two strategies exist in the wild and both are
//! kept: direct round-up division (SDHC v3-style 10-bit dividers) and the
//! iterative doubling search of the older power-of-two divider chains.
//! The same target frequency always produces the same divider.

use fugit::HertzU32;

use crate::host::Error;

/// How a backend's clock divider is searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DividerStrategy {
    /// Smallest integer divider with `source / divider <= target`.
    RoundUp {
        /// Largest divider the register can hold.
        max: u32,
    },
    /// Doubling search: smallest power of two with
    /// `source / divider <= target`.
    PowerOfTwo {
        /// Largest divider the register can hold (a power of two).
        max: u32,
    },
}

/// A computed divider and the card clock it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DividedClock {
    /// Division ratio (1 = bypass).
    pub divider: u32,
    /// Resulting card clock.
    pub actual: HertzU32,
}

/// Computes the divider for `target` from `source`.
///
/// Returns [`Error::Invalid`] when the target is zero or slower than the
/// divider chain can reach.
pub(crate) fn divide(
    strategy: DividerStrategy,
    source: HertzU32,
    target: HertzU32,
) -> Result<DividedClock, Error> {
    let source_hz = source.to_Hz();
    let target_hz = target.to_Hz();
    if target_hz == 0 || source_hz == 0 {
        return Err(Error::Invalid);
    }

    let divider = match strategy {
        DividerStrategy::RoundUp { max } => {
            let divider = source_hz.div_ceil(target_hz);
            if divider > max {
                return Err(Error::Invalid);
            }
            divider
        }
        DividerStrategy::PowerOfTwo { max } => {
            let mut divider = 1u32;
            while source_hz / divider > target_hz {
                divider = divider.checked_mul(2).ok_or(Error::Invalid)?;
                if divider > max {
                    return Err(Error::Invalid);
                }
            }
            divider
        }
    };

    Ok(DividedClock {
        divider,
        actual: HertzU32::from_raw(source_hz / divider),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_is_exact_for_integer_ratios() {
        let clock = divide(
            DividerStrategy::RoundUp { max: 1024 },
            HertzU32::MHz(200),
            HertzU32::MHz(25),
        )
        .unwrap();
        assert_eq!(clock.divider, 8);
        assert_eq!(clock.actual, HertzU32::MHz(25));
    }

    #[test]
    fn round_up_never_overshoots() {
        let clock = divide(
            DividerStrategy::RoundUp { max: 1024 },
            HertzU32::MHz(200),
            HertzU32::kHz(400),
        )
        .unwrap();
        assert_eq!(clock.divider, 500);
        assert!(clock.actual <= HertzU32::kHz(400));
    }

    #[test]
    fn power_of_two_rounds_to_next_power() {
        let clock = divide(
            DividerStrategy::PowerOfTwo { max: 256 },
            HertzU32::MHz(96),
            HertzU32::MHz(25),
        )
        .unwrap();
        assert_eq!(clock.divider, 4);
        assert_eq!(clock.actual, HertzU32::MHz(24));
    }

    #[test]
    fn same_target_same_divider() {
        for strategy in [
            DividerStrategy::RoundUp { max: 1024 },
            DividerStrategy::PowerOfTwo { max: 1024 },
        ] {
            let a = divide(strategy, HertzU32::MHz(200), HertzU32::MHz(50)).unwrap();
            let b = divide(strategy, HertzU32::MHz(200), HertzU32::MHz(50)).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn unreachable_target_is_invalid() {
        assert_eq!(
            divide(
                DividerStrategy::PowerOfTwo { max: 8 },
                HertzU32::MHz(200),
                HertzU32::kHz(400),
            ),
            Err(Error::Invalid)
        );
        assert_eq!(
            divide(
                DividerStrategy::RoundUp { max: 4 },
                HertzU32::MHz(200),
                HertzU32::kHz(400),
            ),
            Err(Error::Invalid)
        );
    }

    #[test]
    fn zero_target_is_invalid() {
        assert_eq!(
            divide(
                DividerStrategy::RoundUp { max: 1024 },
                HertzU32::MHz(200),
                HertzU32::Hz(0),
            ),
            Err(Error::Invalid)
        );
    }
}
