//! A client-side token-bucket rate limit for API requests

use parking_lot::Mutex;
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};
use tokio::time::{self, Duration, Instant};

/// Applies a [`RateLimit`] to a service
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitLayer {
    qps: u32,
    burst: u32,
}

/// Delays readiness of the inner service until a request token is available
///
/// Clones share a single bucket.
#[derive(Debug)]
pub struct RateLimit<S> {
    inner: S,
    bucket: Option<Arc<Mutex<Bucket>>>,
    sleep: Option<Pin<Box<time::Sleep>>>,
    permitted: bool,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last: Instant,
}

// === impl RateLimitLayer ===

impl RateLimitLayer {
    /// Permits `qps` requests per second on average, with bursts of up to
    /// `burst` requests
    ///
    /// A `qps` of zero disables the limit.
    pub fn new(qps: u32, burst: u32) -> Self {
        Self { qps, burst }
    }
}

impl<S> tower::Layer<S> for RateLimitLayer {
    type Service = RateLimit<S>;

    fn layer(&self, inner: S) -> RateLimit<S> {
        let bucket = (self.qps > 0).then(|| {
            Arc::new(Mutex::new(Bucket::new(
                self.qps,
                self.burst,
                Instant::now(),
            )))
        });
        RateLimit {
            inner,
            bucket,
            sleep: None,
            permitted: false,
        }
    }
}

// === impl RateLimit ===

impl<S: Clone> Clone for RateLimit<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            bucket: self.bucket.clone(),
            sleep: None,
            permitted: false,
        }
    }
}

impl<S, Req> tower::Service<Req> for RateLimit<S>
where
    S: tower::Service<Req>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        loop {
            if self.permitted {
                return self.inner.poll_ready(cx);
            }

            if let Some(sleep) = self.sleep.as_mut() {
                ready!(sleep.as_mut().poll(cx));
                self.sleep = None;
            }

            let Some(bucket) = self.bucket.as_ref() else {
                self.permitted = true;
                continue;
            };
            let acquired = bucket.lock().acquire(Instant::now());
            match acquired {
                Ok(()) => self.permitted = true,
                Err(at) => {
                    let wait = at.saturating_duration_since(Instant::now());
                    tracing::trace!(?wait, "Rate limited");
                    self.sleep = Some(Box::pin(time::sleep_until(at)));
                }
            }
        }
    }

    fn call(&mut self, req: Req) -> Self::Future {
        self.permitted = false;
        self.inner.call(req)
    }
}

// === impl Bucket ===

impl Bucket {
    fn new(qps: u32, burst: u32, now: Instant) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            tokens: capacity,
            capacity,
            rate: f64::from(qps),
            last: now,
        }
    }

    /// Takes a token, or returns the instant at which one will be available
    fn acquire(&mut self, now: Instant) -> Result<(), Instant> {
        if now > self.last {
            let elapsed = now.duration_since(self.last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            self.last = now;
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let wait = (1.0 - self.tokens) / self.rate;
        Err(now + Duration::from_secs_f64(wait))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use tokio_test::{assert_pending, assert_ready_ok};
    use tower::{Layer, Service, ServiceExt};

    #[test]
    fn bucket_allows_bursts() {
        let start = Instant::now();
        let mut bucket = Bucket::new(10, 3, start);
        for _ in 0..3 {
            assert_eq!(bucket.acquire(start), Ok(()));
        }
        assert_eq!(
            bucket.acquire(start),
            Err(start + Duration::from_millis(100))
        );
    }

    #[test]
    fn bucket_refills_up_to_capacity() {
        let start = Instant::now();
        let mut bucket = Bucket::new(10, 2, start);
        assert!(bucket.acquire(start).is_ok());
        assert!(bucket.acquire(start).is_ok());
        assert!(bucket.acquire(start).is_err());

        let later = start + Duration::from_millis(100);
        assert!(bucket.acquire(later).is_ok());
        assert!(bucket.acquire(later).is_err());

        let much_later = later + Duration::from_secs(60);
        assert!(bucket.acquire(much_later).is_ok());
        assert!(bucket.acquire(much_later).is_ok());
        assert!(bucket.acquire(much_later).is_err());
    }

    #[test]
    fn zero_burst_permits_one() {
        let start = Instant::now();
        let mut bucket = Bucket::new(1, 0, start);
        assert!(bucket.acquire(start).is_ok());
        assert_eq!(bucket.acquire(start), Err(start + Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn delays_readiness() {
        let mut svc = RateLimitLayer::new(1, 1)
            .layer(tower::service_fn(|()| async { Ok::<_, Infallible>(()) }));

        svc.ready().await.expect("ready");
        svc.call(()).await.expect("call");

        let mut ready = tokio_test::task::spawn(svc.ready());
        assert_pending!(ready.poll());
        time::advance(Duration::from_millis(500)).await;
        assert_pending!(ready.poll());
        time::advance(Duration::from_millis(500)).await;
        assert!(ready.is_woken());
        assert_ready_ok!(ready.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_qps_is_unlimited() {
        let mut svc = RateLimitLayer::new(0, 0)
            .layer(tower::service_fn(|()| async { Ok::<_, Infallible>(()) }));
        for _ in 0..100 {
            let mut ready = tokio_test::task::spawn(svc.ready());
            assert_ready_ok!(ready.poll());
            drop(ready);
            svc.call(()).await.expect("call");
        }
    }
}
