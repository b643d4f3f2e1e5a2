//! Request execution with URL rotation and exponential backoff.
//!
//! Two axes drive a request's lifecycle here: the ordered candidate URL
//! list (rotated through without delay) and the per-error-class retry
//! counters (regular vs offline) that gate backoff sleeps once every
//! candidate failed.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    backoff::BackoffOptions,
    error::{ErrorClass, NetError, NetResult},
};

/// Dual retry counters with class-switch forgiveness.
#[derive(Debug, Default)]
struct RetryCounters {
    regular: u32,
    offline: u32,
    last_class: Option<ErrorClass>,
}

impl RetryCounters {
    /// Record a retryable failure's class. Switching class resets the
    /// *other* class's counter, not both.
    fn note_class(&mut self, class: ErrorClass) {
        if let Some(last) = self.last_class {
            if last != class {
                match last {
                    ErrorClass::Regular => self.regular = 0,
                    ErrorClass::Offline => self.offline = 0,
                }
            }
        }
        self.last_class = Some(class);
    }

    /// Consume one retry of the given class, returning the post-increment
    /// count.
    fn increment(&mut self, class: ErrorClass) -> u32 {
        let counter = match class {
            ErrorClass::Regular => &mut self.regular,
            ErrorClass::Offline => &mut self.offline,
        };
        *counter += 1;
        *counter
    }
}

fn max_for(options: &BackoffOptions, class: ErrorClass) -> u32 {
    match class {
        ErrorClass::Regular => options.max_retry_regular,
        ErrorClass::Offline => options.max_retry_offline,
    }
}

/// Sleep that aborts as soon as `cancel` fires.
async fn cancellable_sleep(
    delay: std::time::Duration,
    cancel: &CancellationToken,
) -> NetResult<()> {
    tokio::select! {
        () = cancel.cancelled() => Err(NetError::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Execute `perform` against an ordered candidate URL list, retrying with
/// exponential backoff.
///
/// Behavior, in order:
/// 1. The URL at the current index is tried; success returns its result.
/// 2. A non-retryable failure bans that URL permanently for this call.
///    With no candidate left, the call fails with that error.
/// 3. Retryable failures are classed regular or offline; a class switch
///    resets the other class's counter to zero.
/// 4. While candidates remain past the current index (or a ban shrank the
///    list), the next candidate is tried immediately, without delay.
/// 5. Once the last candidate failed retryably, the active class's
///    counter is incremented; past its limit the call fails, otherwise a
///    fuzzed `min(base * 2^(n-1), max)` sleep runs and rotation restarts
///    from the first remaining candidate.
///
/// `on_retry` fires for every non-fatal failure, before any sleep, so
/// callers can surface warnings. Cancellation is checked before each
/// attempt and interrupts sleeps; it surfaces as `NetError::Cancelled`,
/// never as the underlying network error.
pub async fn try_urls_with_backoff<T, F, Fut>(
    urls: &[Url],
    mut perform: F,
    options: &BackoffOptions,
    mut on_retry: impl FnMut(&NetError, u32),
    cancel: &CancellationToken,
) -> NetResult<T>
where
    F: FnMut(Url) -> Fut,
    Fut: Future<Output = NetResult<T>>,
{
    if urls.is_empty() {
        return Err(NetError::NoCandidateLeft);
    }
    let mut candidates: Vec<Url> = urls.to_vec();
    let mut index = 0_usize;
    let mut counters = RetryCounters::default();
    let mut attempts = 0_u32;

    loop {
        if cancel.is_cancelled() {
            return Err(NetError::Cancelled);
        }

        let url = candidates[index].clone();
        attempts += 1;
        let error = match perform(url).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if cancel.is_cancelled() {
            return Err(NetError::Cancelled);
        }

        let Some(class) = error.error_class() else {
            // Banned outright: this URL never gets another chance.
            tracing::debug!(%error, url = %candidates[index], "banning candidate URL");
            candidates.remove(index);
            if candidates.is_empty() {
                return Err(error);
            }
            on_retry(&error, attempts);
            if index >= candidates.len() {
                index = 0;
            }
            continue;
        };

        counters.note_class(class);

        if index + 1 < candidates.len() {
            // Another candidate is waiting: rotate without delay.
            on_retry(&error, attempts);
            index += 1;
            continue;
        }

        let retry_count = counters.increment(class);
        if retry_count > max_for(options, class) {
            return Err(NetError::RetryExhausted {
                attempts,
                source: Box::new(error),
            });
        }
        on_retry(&error, attempts);

        let delay = options.fuzzed(options.delay_for_retry(retry_count));
        tracing::debug!(
            ?delay,
            retry_count,
            class = ?class,
            "backing off before restarting URL rotation"
        );
        cancellable_sleep(delay, cancel).await?;
        index = 0;
    }
}

/// Single-resource variant of [`try_urls_with_backoff`], for requests
/// without alternative locations (manifest refreshes, key fetches).
pub async fn retry_with_backoff<T, F, Fut>(
    mut perform: F,
    options: &BackoffOptions,
    mut on_retry: impl FnMut(&NetError, u32),
    cancel: &CancellationToken,
) -> NetResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = NetResult<T>>,
{
    let mut counters = RetryCounters::default();
    let mut attempts = 0_u32;

    loop {
        if cancel.is_cancelled() {
            return Err(NetError::Cancelled);
        }
        attempts += 1;
        let error = match perform().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if cancel.is_cancelled() {
            return Err(NetError::Cancelled);
        }

        let Some(class) = error.error_class() else {
            return Err(error);
        };
        counters.note_class(class);
        let retry_count = counters.increment(class);
        if retry_count > max_for(options, class) {
            return Err(NetError::RetryExhausted {
                attempts,
                source: Box::new(error),
            });
        }
        on_retry(&error, attempts);

        let delay = options.fuzzed(options.delay_for_retry(retry_count));
        cancellable_sleep(delay, cancel).await?;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        time::Duration,
    };

    use tokio::time::Instant;

    use super::*;

    fn options() -> BackoffOptions {
        BackoffOptions {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            max_retry_regular: 3,
            max_retry_offline: 5,
            fuzz_factor: 0.0,
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).expect("test url")
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_delays_follow_the_law() {
        let opts = BackoffOptions {
            max_retry_regular: 4,
            ..options()
        };
        let urls = [url("http://a/seg")];
        let timestamps = RefCell::new(vec![Instant::now()]);
        let calls = RefCell::new(0_u32);

        let result: NetResult<()> = try_urls_with_backoff(
            &urls,
            |_| {
                timestamps.borrow_mut().push(Instant::now());
                let n = {
                    let mut c = calls.borrow_mut();
                    *c += 1;
                    *c
                };
                async move {
                    if n <= 4 {
                        Err(NetError::http_status(503, "http://a/seg"))
                    } else {
                        Ok(())
                    }
                }
            },
            &opts,
            |_, _| {},
            &CancellationToken::new(),
        )
        .await;

        assert!(result.is_ok());
        let ts = timestamps.borrow();
        // Attempts at t0, then after 100ms, 200ms, 400ms, 800ms.
        let gaps: Vec<Duration> = ts.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps[1], Duration::from_millis(100));
        assert_eq!(gaps[2], Duration::from_millis(200));
        assert_eq!(gaps[3], Duration::from_millis(400));
        assert_eq!(gaps[4], Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn regular_retry_limit_is_enforced() {
        let urls = [url("http://a/seg")];
        let attempts = RefCell::new(0_u32);

        let result: NetResult<()> = try_urls_with_backoff(
            &urls,
            |_| {
                *attempts.borrow_mut() += 1;
                async { Err(NetError::Timeout) }
            },
            &options(),
            |_, _| {},
            &CancellationToken::new(),
        )
        .await;

        // max_retry_regular = 3: initial try + 3 retries.
        assert_eq!(*attempts.borrow(), 4);
        assert!(matches!(result, Err(NetError::RetryExhausted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn class_switch_resets_only_the_other_counter() {
        // Sequence: regular, regular, offline, then regular failures.
        // The switch to offline must forgive the two regular retries, so
        // three further regular retries fit before exhaustion.
        let urls = [url("http://a/seg")];
        let calls = RefCell::new(0_u32);

        let result: NetResult<()> = try_urls_with_backoff(
            &urls,
            |_| {
                let n = {
                    let mut c = calls.borrow_mut();
                    *c += 1;
                    *c
                };
                async move {
                    match n {
                        1 | 2 => Err(NetError::Timeout),
                        3 => Err(NetError::Offline("down".into())),
                        4..=6 => Err(NetError::Timeout),
                        _ => Ok(()),
                    }
                }
            },
            &options(),
            |_, _| {},
            &CancellationToken::new(),
        )
        .await;

        // 2 regular retries, 1 offline retry (regular reset to 0), then
        // 3 fresh regular retries, then success: 7 calls, no exhaustion.
        assert!(result.is_ok());
        assert_eq!(*calls.borrow(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_bans_url_permanently() {
        let urls = [url("http://cdn-a/seg"), url("http://cdn-b/seg")];
        let per_url = RefCell::new((0_u32, 0_u32));
        let calls = RefCell::new(0_u32);

        let result: NetResult<&str> = try_urls_with_backoff(
            &urls,
            |u| {
                let n = {
                    let mut c = calls.borrow_mut();
                    *c += 1;
                    *c
                };
                let is_a = u.host_str() == Some("cdn-a");
                {
                    let mut counts = per_url.borrow_mut();
                    if is_a {
                        counts.0 += 1;
                    } else {
                        counts.1 += 1;
                    }
                }
                async move {
                    if is_a {
                        Err(NetError::http_status(404, "http://cdn-a/seg"))
                    } else if n < 4 {
                        Err(NetError::Timeout)
                    } else {
                        Ok("payload")
                    }
                }
            },
            &options(),
            |_, _| {},
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(result.expect("should succeed"), "payload");
        let (a_calls, b_calls) = *per_url.borrow();
        assert_eq!(a_calls, 1, "banned URL must not be retried");
        assert_eq!(b_calls, 3, "all later attempts go to the second URL");
    }

    #[tokio::test(start_paused = true)]
    async fn all_urls_non_retryable_attempts_each_exactly_once() {
        let urls = [
            url("http://cdn-a/seg"),
            url("http://cdn-b/seg"),
            url("http://cdn-c/seg"),
        ];
        let tried = RefCell::new(Vec::new());

        let result: NetResult<()> = try_urls_with_backoff(
            &urls,
            |u| {
                tried.borrow_mut().push(u.clone());
                async { Err(NetError::http_status(403, "denied")) }
            },
            &options(),
            |_, _| {},
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(NetError::HttpStatus { status: 403, .. })));
        let tried = tried.borrow();
        assert_eq!(tried.len(), 3);
        let mut unique = tried.clone();
        unique.dedup();
        assert_eq!(unique.len(), 3, "each URL tried exactly once");
    }

    #[tokio::test(start_paused = true)]
    async fn url_rotation_happens_without_delay() {
        let urls = [url("http://cdn-a/seg"), url("http://cdn-b/seg")];
        let started = Instant::now();

        let result: NetResult<()> = try_urls_with_backoff(
            &urls,
            |u| {
                let fail = u.host_str() == Some("cdn-a");
                async move {
                    if fail {
                        Err(NetError::Timeout)
                    } else {
                        Ok(())
                    }
                }
            },
            &options(),
            |_, _| {},
            &CancellationToken::new(),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(Instant::now() - started, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff_sleep() {
        let urls = [url("http://a/seg")];
        let cancel = CancellationToken::new();
        let child = cancel.child_token();

        let task = tokio::spawn({
            let opts = options();
            async move {
                try_urls_with_backoff(
                    &urls,
                    |_| async { Err::<(), _>(NetError::Timeout) },
                    &opts,
                    |_, _| {},
                    &child,
                )
                .await
            }
        });

        // Let the first attempt fail and the engine enter its sleep.
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let result = task.await.expect("task not panicked");
        assert!(matches!(result, Err(NetError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_over_network_error() {
        let urls = [url("http://a/seg")];
        let cancel = CancellationToken::new();

        let result: NetResult<()> = try_urls_with_backoff(
            &urls,
            |_| {
                cancel.cancel();
                async { Err(NetError::Timeout) }
            },
            &options(),
            |_, _| {},
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(NetError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn single_resource_retry_shares_semantics() {
        let calls = RefCell::new(0_u32);
        let warnings = RefCell::new(0_u32);

        let result: NetResult<u32> = retry_with_backoff(
            || {
                let n = {
                    let mut c = calls.borrow_mut();
                    *c += 1;
                    *c
                };
                async move {
                    if n <= 2 {
                        Err(NetError::http_status(500, "u"))
                    } else {
                        Ok(n)
                    }
                }
            },
            &options(),
            |_, _| *warnings.borrow_mut() += 1,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(result.expect("succeeds on third call"), 3);
        assert_eq!(*warnings.borrow(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_candidate_list_fails_immediately() {
        let result: NetResult<()> = try_urls_with_backoff(
            &[],
            |_| async { Ok(()) },
            &options(),
            |_, _| {},
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(NetError::NoCandidateLeft)));
    }
}
