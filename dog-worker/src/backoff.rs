//! Retry and polling delay curves.
//!
//! Every strategy maps a 1-based attempt number to a wait duration. An attempt
//! of `0` is treated as attempt `1`, and a zero `max_delay` means "no cap".

use std::fmt;
use std::time::Duration;

/// Maps an attempt number to the delay before the next try.
pub trait BackoffStrategy: Send + Sync + fmt::Debug {
    fn backoff(&self, attempt: u32) -> Duration;
}

/// Default retry curve for job handlers.
pub const DEFAULT_EXPONENTIAL_BACKOFF: ExponentialBackoff = ExponentialBackoff {
    multiplier: 1.6,
    initial_delay: Duration::from_secs(1),
    max_delay: Duration::from_secs(900),
    jitter: 0.2,
};

/// Always waits the same delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstBackoff {
    pub delay: Duration,
}

impl ConstBackoff {
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffStrategy for ConstBackoff {
    fn backoff(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// `(initial_delay * attempt) mod max_delay`: a repeating sawtooth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearModBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffStrategy for LinearModBackoff {
    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay.as_nanos() * u128::from(attempt.max(1));
        match self.max_delay.as_nanos() {
            0 => from_nanos(delay),
            max => from_nanos(delay % max),
        }
    }
}

/// `min(initial_delay * attempt, max_delay)`: capped linear growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffStrategy for LinearBackoff {
    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_delay
            .checked_mul(attempt.max(1))
            .unwrap_or(Duration::MAX);
        cap(delay, self.max_delay)
    }
}

/// `initial_delay * multiplier^(attempt-1)`, capped at `max_delay`, plus a
/// positive random jitter of up to `jitter * delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub multiplier: f64,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl ExponentialBackoff {
    /// Capped delay before jitter is applied.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.max(1) - 1).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        cap(from_secs_f64(secs), self.max_delay)
    }

    /// Delay for `attempt` using `sample` (in `[0, 1)`) as the jitter source.
    pub fn backoff_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }

        let extra = sample.clamp(0.0, 1.0) * self.jitter * base.as_secs_f64();
        base.saturating_add(from_secs_f64(extra))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        DEFAULT_EXPONENTIAL_BACKOFF
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_with_sample(attempt, rand::random::<f64>())
    }
}

/// Adapts a plain function into a [`BackoffStrategy`].
#[derive(Clone, Copy)]
pub struct BackoffFn<F>(pub F);

impl<F> fmt::Debug for BackoffFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BackoffFn")
    }
}

impl<F> BackoffStrategy for BackoffFn<F>
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn backoff(&self, attempt: u32) -> Duration {
        (self.0)(attempt.max(1))
    }
}

fn cap(delay: Duration, max_delay: Duration) -> Duration {
    if !max_delay.is_zero() && delay > max_delay {
        max_delay
    } else {
        delay
    }
}

fn from_nanos(nanos: u128) -> Duration {
    u64::try_from(nanos)
        .map(Duration::from_nanos)
        .unwrap_or(Duration::MAX)
}

fn from_secs_f64(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn assert_close(got: Duration, want: Duration) {
        let diff = if got > want { got - want } else { want - got };
        assert!(diff < Duration::from_micros(1), "got {got:?}, want {want:?}");
    }

    #[test]
    fn const_backoff_ignores_attempt() {
        let b = ConstBackoff::new(Duration::from_secs(1));
        for attempt in [0, 1, 2, 10, u32::MAX] {
            assert_eq!(b.backoff(attempt), Duration::from_secs(1));
        }
    }

    #[test]
    fn linear_mod_backoff_wraps_at_max() {
        let b = LinearModBackoff {
            initial_delay: ms(900),
            max_delay: Duration::from_secs(3),
        };
        let got: Vec<_> = (1..=5).map(|a| b.backoff(a)).collect();
        assert_eq!(got, vec![ms(900), ms(1800), ms(2700), ms(600), ms(1500)]);
    }

    #[test]
    fn linear_mod_backoff_without_max_grows() {
        let b = LinearModBackoff {
            initial_delay: ms(100),
            max_delay: Duration::ZERO,
        };
        assert_eq!(b.backoff(7), ms(700));
    }

    #[test]
    fn linear_backoff_is_capped() {
        let b = LinearBackoff {
            initial_delay: ms(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(b.backoff(5), ms(500));
        assert_eq!(b.backoff(10), Duration::from_secs(1));
        assert_eq!(b.backoff(11), Duration::from_secs(1));
    }

    #[test]
    fn attempt_zero_behaves_like_first_attempt() {
        let linear = LinearBackoff {
            initial_delay: ms(100),
            max_delay: Duration::from_secs(1),
        };
        let modded = LinearModBackoff {
            initial_delay: ms(900),
            max_delay: Duration::from_secs(3),
        };
        let exp = ExponentialBackoff {
            multiplier: 2.0,
            initial_delay: Duration::from_secs(4),
            max_delay: Duration::ZERO,
            jitter: 0.0,
        };
        assert_eq!(linear.backoff(0), linear.backoff(1));
        assert_eq!(modded.backoff(0), modded.backoff(1));
        assert_eq!(exp.backoff(0), exp.backoff(1));
    }

    #[test]
    fn exponential_backoff_cases() {
        let cases = [
            // (multiplier, initial, max, jitter, attempt, want)
            (2.0, Duration::from_secs(4), Duration::from_secs(5), 0.0, 1, ms(4000)),
            (2.0, Duration::from_secs(4), Duration::ZERO, 0.0, 3, ms(16_000)),
            (2.0, Duration::from_secs(4), Duration::from_secs(10), 0.0, 3, ms(10_000)),
            (1.0, Duration::from_secs(4), Duration::ZERO, 0.0, 10, ms(4000)),
            (2.0, Duration::from_secs(4), Duration::ZERO, 0.4, 3, ms(19_200)),
            (4.0, Duration::from_secs(1), Duration::from_secs(10), 1.0, 11, ms(15_000)),
            (4.0, Duration::from_secs(1), Duration::from_secs(10), 1.0, 111, ms(15_000)),
        ];

        for (multiplier, initial_delay, max_delay, jitter, attempt, want) in cases {
            let b = ExponentialBackoff {
                multiplier,
                initial_delay,
                max_delay,
                jitter,
            };
            assert_close(b.backoff_with_sample(attempt, 0.5), want);
        }
    }

    #[test]
    fn exponential_backoff_saturates_without_cap() {
        let b = ExponentialBackoff {
            multiplier: 10.0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::ZERO,
            jitter: 0.5,
        };
        assert_eq!(b.backoff_with_sample(u32::MAX, 0.9), Duration::MAX);
    }

    #[test]
    fn backoff_fn_adapts_closure() {
        let b = BackoffFn(|attempt: u32| Duration::from_secs(u64::from(attempt) * 2));
        assert_eq!(b.backoff(3), Duration::from_secs(6));
        assert_eq!(b.backoff(0), Duration::from_secs(2));
    }

    proptest! {
        #[test]
        fn exponential_never_below_capped_base(
            multiplier in 1.0f64..4.0,
            initial_ms in 1u64..5_000,
            max_ms in 0u64..60_000,
            jitter in 0.0f64..1.0,
            attempt in 0u32..64,
            sample in 0.0f64..1.0,
        ) {
            let b = ExponentialBackoff {
                multiplier,
                initial_delay: ms(initial_ms),
                max_delay: ms(max_ms),
                jitter,
            };
            let base = b.base_delay(attempt);
            let got = b.backoff_with_sample(attempt, sample);
            prop_assert!(got >= base);
            if max_ms > 0 {
                prop_assert!(base <= ms(max_ms));
            }
            prop_assert_eq!(got, b.backoff_with_sample(attempt, sample));
        }

        #[test]
        fn linear_never_exceeds_max(initial_ms in 0u64..10_000, max_ms in 1u64..60_000, attempt in 0u32..10_000) {
            let b = LinearBackoff { initial_delay: ms(initial_ms), max_delay: ms(max_ms) };
            prop_assert!(b.backoff(attempt) <= ms(max_ms));
        }

        #[test]
        fn linear_mod_stays_below_max(initial_ms in 0u64..10_000, max_ms in 1u64..60_000, attempt in 0u32..10_000) {
            let b = LinearModBackoff { initial_delay: ms(initial_ms), max_delay: ms(max_ms) };
            prop_assert!(b.backoff(attempt) < ms(max_ms));
        }
    }
}
