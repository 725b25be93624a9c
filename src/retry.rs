use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::{Context, Error, ErrorClassifier};

/// Randomized exponential backoff.
///
/// The policy holds no state: the retry number is passed in, so a single instance is shared by
/// every concurrent transaction and stream of a [`Client`](crate::Client).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(20),
            max: Duration::from_secs(32),
            multiplier: 1.3,
        }
    }
}

impl Backoff {
    /// The upper bound of the delay before retry number `retry` (0-based).
    pub fn ceiling(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if secs.is_nan() || secs <= 0.0 {
            Duration::ZERO
        } else if secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// A random delay in `[ceiling / 2, ceiling]` before retry number `retry`.
    pub fn delay(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling(retry);
        let floor = ceiling / 2;
        if floor == ceiling {
            return ceiling;
        }
        rand::thread_rng().gen_range(floor..=ceiling)
    }
}

/// Runs `op` until it returns something other than a transient transport error.
///
/// Sleeps go through `ctx`, so an expired or cancelled context ends the retries with the context
/// error rather than the last transient one.
pub(crate) async fn retry_transient<T, F, Fut>(
    ctx: &Context,
    backoff: &Backoff,
    classifier: &ErrorClassifier,
    what: &str,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut retry = 0;
    loop {
        let err = match ctx.run(op()).await? {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !classifier.classify(&err).is_transient() {
            return Err(err);
        }
        let delay = backoff.delay(retry);
        log::debug!("{} failed with a transient error, retrying in {:?}: {}", what, delay, err);
        ctx.sleep(delay).await?;
        retry += 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_ceiling_grows_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        };
        assert_eq!(backoff.ceiling(0), Duration::from_millis(100));
        assert_eq!(backoff.ceiling(1), Duration::from_millis(200));
        assert_eq!(backoff.ceiling(3), Duration::from_millis(800));
        assert_eq!(backoff.ceiling(4), Duration::from_secs(1));
        assert_eq!(backoff.ceiling(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_negative_multiplier() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: -2.0,
        };
        assert_eq!(backoff.ceiling(0), Duration::from_millis(100));
        assert_eq!(backoff.ceiling(1), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::ZERO);
        assert_eq!(backoff.ceiling(2), Duration::from_millis(400));
        assert_eq!(backoff.ceiling(u32::MAX), Duration::ZERO);
    }

    #[test]
    fn test_delay_is_within_bounds() {
        let backoff = Backoff::default();
        for retry in 0..50 {
            let ceiling = backoff.ceiling(retry);
            let delay = backoff.delay(retry);
            assert!(delay <= ceiling, "{:?} > {:?}", delay, ceiling);
            assert!(delay >= ceiling / 2, "{:?} < {:?}", delay, ceiling / 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient() {
        let calls = AtomicUsize::new(0);
        let result = retry_transient(
            &Context::background(),
            &Backoff::default(),
            &ErrorClassifier::default(),
            "test",
            || async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(Error::Status(tonic::Status::unavailable("Unavailable"))),
                    _ => Ok(42),
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_stops_on_fatal() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), Error> = retry_transient(
            &Context::background(),
            &Backoff::default(),
            &ErrorClassifier::default(),
            "test",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Status(tonic::Status::invalid_argument("Invalid argument")))
            },
        )
        .await;
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_respects_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_secs(1));
        let result: Result<(), Error> = retry_transient(
            &ctx,
            &Backoff::default(),
            &ErrorClassifier::default(),
            "test",
            || async { Err(Error::Status(tonic::Status::unavailable("Unavailable"))) },
        )
        .await;
        assert!(matches!(result, Err(Error::DeadlineExceeded)));
    }
}
