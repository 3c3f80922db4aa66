//! Concurrency gate for outbound HTTP exchanges.
//!
//! A slot is taken before the request is sent and given back when the
//! response is dropped, which may happen on a different task.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{ProtocolError, Result};
use crate::message::HttpResponse;

/// Limits how many exchanges run at once
#[async_trait]
pub trait Throttle: Send + Sync + fmt::Debug {
    /// Wait for a free slot
    async fn acquire(&self, token: &CancellationToken) -> Result<()>;

    /// Free one slot
    fn release(&self);
}

/// Counting-semaphore throttle
#[derive(Debug)]
pub struct SemaphoreThrottle {
    semaphore: Semaphore,
    capacity: usize,
}

impl SemaphoreThrottle {
    /// Allow `capacity` concurrent exchanges
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
        }
    }

    /// Configured number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[async_trait]
impl Throttle for SemaphoreThrottle {
    async fn acquire(&self, token: &CancellationToken) -> Result<()> {
        let permit = tokio::select! {
            biased;
            () = token.cancelled() => return Err(ProtocolError::Cancelled),
            permit = self.semaphore.acquire() => permit
                .map_err(|_| ProtocolError::Config("throttle semaphore closed".to_string()))?,
        };
        // Returned through `release`, possibly from another task
        permit.forget();
        Ok(())
    }

    fn release(&self) {
        self.semaphore.add_permits(1);
    }
}

/// Throttle that never waits
#[derive(Debug, Clone, Copy, Default)]
pub struct NullThrottle;

#[async_trait]
impl Throttle for NullThrottle {
    async fn acquire(&self, _token: &CancellationToken) -> Result<()> {
        Ok(())
    }

    fn release(&self) {}
}

/// Build the throttle for a concurrency limit; 0 means unthrottled
pub fn throttle_for(max_concurrent_requests: usize) -> Arc<dyn Throttle> {
    if max_concurrent_requests == 0 {
        Arc::new(NullThrottle)
    } else {
        Arc::new(SemaphoreThrottle::new(max_concurrent_requests))
    }
}

/// One acquired throttle slot. Released exactly once, on the first of
/// [`ThrottleSlot::release`] or drop.
#[must_use = "the slot is released as soon as it is dropped"]
#[derive(Debug)]
pub struct ThrottleSlot {
    throttle: Arc<dyn Throttle>,
    released: AtomicBool,
}

impl ThrottleSlot {
    /// Wait for a slot on `throttle`
    pub async fn acquire(throttle: Arc<dyn Throttle>, token: &CancellationToken) -> Result<Self> {
        throttle.acquire(token).await?;
        Ok(Self {
            throttle,
            released: AtomicBool::new(false),
        })
    }

    /// Give the slot back. Later calls do nothing.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.throttle.release();
        }
    }

    /// Whether the slot has been given back
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for ThrottleSlot {
    fn drop(&mut self) {
        self.release();
    }
}

/// A response that holds a throttle slot until it is released or dropped
#[derive(Debug)]
pub struct ThrottledResponse {
    response: HttpResponse,
    slot: ThrottleSlot,
}

impl ThrottledResponse {
    /// Pair a response with its slot
    pub fn new(response: HttpResponse, slot: ThrottleSlot) -> Self {
        Self { response, slot }
    }

    /// The response
    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    /// Give the slot back early while keeping the response
    pub fn release(&self) {
        self.slot.release();
    }

    /// Split into the response and the slot so the body can be consumed
    /// while the slot is still held
    pub fn into_parts(self) -> (HttpResponse, ThrottleSlot) {
        (self.response, self.slot)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::time::Duration;
    use url::Url;

    fn response() -> HttpResponse {
        HttpResponse::empty(
            StatusCode::OK,
            Url::parse("https://api.example.org/").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_semaphore_bounds_concurrency() {
        let throttle = Arc::new(SemaphoreThrottle::new(2));
        let token = CancellationToken::new();
        let as_dyn: Arc<dyn Throttle> = throttle.clone();

        let a = ThrottleSlot::acquire(Arc::clone(&as_dyn), &token).await.unwrap();
        let _b = ThrottleSlot::acquire(Arc::clone(&as_dyn), &token).await.unwrap();
        assert_eq!(throttle.available(), 0);

        let waiting = tokio::time::timeout(
            Duration::from_millis(50),
            ThrottleSlot::acquire(Arc::clone(&as_dyn), &token),
        )
        .await;
        assert!(waiting.is_err(), "third acquire should wait");

        drop(a);
        let _c = tokio::time::timeout(
            Duration::from_secs(1),
            ThrottleSlot::acquire(as_dyn, &token),
        )
        .await
        .expect("slot should be free after release")
        .unwrap();
    }

    #[tokio::test]
    async fn test_double_release_frees_one_slot() {
        let throttle = Arc::new(SemaphoreThrottle::new(1));
        let token = CancellationToken::new();

        let slot = ThrottleSlot::acquire(throttle.clone(), &token).await.unwrap();
        let throttled = ThrottledResponse::new(response(), slot);
        throttled.release();
        throttled.release();
        drop(throttled);

        assert_eq!(throttle.available(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_release_frees_one_slot() {
        let throttle = Arc::new(SemaphoreThrottle::new(1));
        let slot = Arc::new(
            ThrottleSlot::acquire(throttle.clone(), &CancellationToken::new())
                .await
                .unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let slot = Arc::clone(&slot);
            handles.push(tokio::spawn(async move { slot.release() }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        drop(slot);

        assert_eq!(throttle.available(), 1);
    }

    #[tokio::test]
    async fn test_waiting_can_be_cancelled() {
        let throttle: Arc<dyn Throttle> = Arc::new(SemaphoreThrottle::new(1));
        let _held = ThrottleSlot::acquire(Arc::clone(&throttle), &CancellationToken::new())
            .await
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let result = ThrottleSlot::acquire(throttle, &token).await;

        assert!(matches!(result, Err(ProtocolError::Cancelled)));
    }

    #[tokio::test]
    async fn test_null_throttle_never_blocks() {
        let throttle = throttle_for(0);
        let token = CancellationToken::new();
        let mut slots = Vec::new();
        for _ in 0..100 {
            slots.push(ThrottleSlot::acquire(Arc::clone(&throttle), &token).await.unwrap());
        }
        assert_eq!(slots.len(), 100);
    }

    #[test]
    fn test_into_parts_keeps_slot_held() {
        let throttle = Arc::new(SemaphoreThrottle::new(1));
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let slot = runtime
            .block_on(ThrottleSlot::acquire(throttle.clone(), &CancellationToken::new()))
            .unwrap();

        let (response, slot) = ThrottledResponse::new(response(), slot).into_parts();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(throttle.available(), 0);
        drop(slot);
        assert_eq!(throttle.available(), 1);
    }
}
