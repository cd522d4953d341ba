//! Middleware pipeline
//!
//! Interceptors run in strictly descending priority order around a terminal
//! [`Endpoint`]. Each middleware receives a [`Next`] continuation; calling
//! `next.run(..)` proceeds down the chain, returning without calling it
//! short-circuits everything below (including the endpoint).
//!
//! # Modules
//!
//! - `chain`: the priority-sorted, concurrently readable middleware list

pub mod chain;

pub use chain::MiddlewareChain;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::protocol::Envelope;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Higher priorities run first.
    fn priority(&self) -> i32 {
        0
    }

    async fn handle(
        &self,
        envelope: &Envelope,
        ctx: &mut ExecutionContext,
        next: Next<'_>,
    ) -> Result<()>;
}

/// Terminal operation a chain wraps.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(&self, envelope: &Envelope, ctx: &mut ExecutionContext) -> Result<()>;
}

/// Continuation handed to each middleware. Carries the remaining slice of the
/// chain, so it may be run more than once (retries) or not at all.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub fn new(remaining: &'a [Arc<dyn Middleware>], endpoint: &'a dyn Endpoint) -> Self {
        Self {
            remaining,
            endpoint,
        }
    }

    pub async fn run(&self, envelope: &Envelope, ctx: &mut ExecutionContext) -> Result<()> {
        match self.remaining.split_first() {
            Some((current, rest)) => {
                tracing::trace!(middleware = current.name(), "entering middleware");
                current
                    .handle(envelope, ctx, Next::new(rest, self.endpoint))
                    .await
            }
            None => self.endpoint.call(envelope, ctx).await,
        }
    }

    /// Number of middlewares still ahead of the endpoint.
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}
