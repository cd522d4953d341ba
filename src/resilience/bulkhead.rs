//! Bulkhead: bounded concurrency with a bounded FIFO wait queue
//!
//! Slots are handed directly from a finishing call to the oldest live
//! waiter, so the active count never exceeds `max_concurrent` and queued
//! calls start in arrival order.

use crate::context::{keys, ExecutionContext};
use crate::error::{BulkheadRejection, Result, RuntimeError};
use crate::metrics::Metrics;
use crate::middleware::{Middleware, Next};
use crate::protocol::Envelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BulkheadConfig {
    pub name: String,
    pub max_concurrent: usize,
    pub max_queue: usize,
    pub queue_timeout_ms: u64,
    /// When false, a full queue evicts its oldest waiter instead of
    /// rejecting the newcomer.
    pub reject_on_queue_full: bool,
    pub priority: i32,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            name: "bulkhead".to_string(),
            max_concurrent: 10,
            max_queue: 100,
            queue_timeout_ms: 30_000,
            reject_on_queue_full: true,
            priority: 200,
        }
    }
}

struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct Slots {
    active: usize,
    queue: VecDeque<Waiter>,
    next_id: u64,
}

pub struct BulkheadMiddleware {
    config: BulkheadConfig,
    slots: Mutex<Slots>,
    metrics: Option<Arc<Metrics>>,
}

/// Held for the duration of an admitted call.
struct Permit<'a> {
    bulkhead: &'a BulkheadMiddleware,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.bulkhead.release();
    }
}

/// A queued call. Dropping it before it settles withdraws it from the queue,
/// or passes on a slot that was granted but never used.
struct Ticket<'a> {
    bulkhead: &'a BulkheadMiddleware,
    id: u64,
    grant: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut slots = self.bulkhead.lock();
        if let Some(pos) = slots.queue.iter().position(|w| w.id == self.id) {
            slots.queue.remove(pos);
            return;
        }
        drop(slots);
        if self.grant.try_recv().is_ok() {
            self.bulkhead.release();
        }
    }
}

impl BulkheadMiddleware {
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(Slots::default()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active(&self) -> usize {
        self.lock().active
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    fn reject(&self, reason: BulkheadRejection) -> RuntimeError {
        debug!(bulkhead = %self.config.name, %reason, "Bulkhead rejected call");
        if let Some(metrics) = &self.metrics {
            metrics.record_bulkhead_rejection();
        }
        RuntimeError::BulkheadRejected {
            name: self.config.name.clone(),
            reason,
        }
    }

    /// Hands the slot to the oldest waiter still listening, or frees it.
    fn release(&self) {
        let mut slots = self.lock();
        while let Some(waiter) = slots.queue.pop_front() {
            if waiter.grant.send(()).is_ok() {
                return;
            }
        }
        slots.active = slots.active.saturating_sub(1);
    }

    /// Returns a permit and whether the call had to wait for it.
    async fn acquire(&self) -> Result<(Permit<'_>, bool)> {
        let mut ticket = {
            let mut slots = self.lock();
            if slots.active < self.config.max_concurrent {
                slots.active += 1;
                return Ok((Permit { bulkhead: self }, false));
            }

            // waiters abandoned by cancelled callers
            slots.queue.retain(|w| !w.grant.is_closed());

            if slots.queue.len() >= self.config.max_queue {
                if self.config.reject_on_queue_full || self.config.max_queue == 0 {
                    drop(slots);
                    return Err(self.reject(BulkheadRejection::QueueFull));
                }
                if let Some(evicted) = slots.queue.pop_front() {
                    warn!(
                        bulkhead = %self.config.name,
                        waiter = evicted.id,
                        "Evicting oldest queued call"
                    );
                }
            }

            let (tx, rx) = oneshot::channel();
            let id = slots.next_id;
            slots.next_id += 1;
            slots.queue.push_back(Waiter { id, grant: tx });
            Ticket {
                bulkhead: self,
                id,
                grant: rx,
                settled: false,
            }
        };

        let wait = Duration::from_millis(self.config.queue_timeout_ms);
        let outcome = tokio::time::timeout(wait, &mut ticket.grant).await;
        match outcome {
            Ok(Ok(())) => {
                ticket.settled = true;
                Ok((Permit { bulkhead: self }, true))
            }
            Ok(Err(_)) => {
                ticket.settled = true;
                Err(self.reject(BulkheadRejection::Evicted))
            }
            // the ticket's drop withdraws it or passes on a late grant
            Err(_) => {
                drop(ticket);
                Err(self.reject(BulkheadRejection::QueueTimeout))
            }
        }
    }
}

#[async_trait]
impl Middleware for BulkheadMiddleware {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn priority(&self) -> i32 {
        self.config.priority
    }

    async fn handle(
        &self,
        envelope: &Envelope,
        ctx: &mut ExecutionContext,
        next: Next<'_>,
    ) -> Result<()> {
        let (permit, queued) = self.acquire().await?;
        if queued {
            ctx.set(keys::BULKHEAD_QUEUED, true);
        }
        let result = next.run(envelope, ctx).await;
        drop(permit);
        result
    }
}
