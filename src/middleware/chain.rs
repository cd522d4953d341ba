//! Priority-ordered middleware chain
//!
//! Registration uses read-copy-update so dispatches in flight keep the
//! snapshot they started with while plugins add middleware concurrently.

use super::{Endpoint, Middleware, Next};
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::protocol::Envelope;
use arc_swap::ArcSwap;
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct MiddlewareChain {
    label: &'static str,
    entries: ArcSwap<Vec<Arc<dyn Middleware>>>,
}

impl MiddlewareChain {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            entries: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Inserts a middleware and re-sorts by descending priority. The sort is
    /// stable, so equal priorities keep registration order.
    pub fn register(&self, middleware: Arc<dyn Middleware>) {
        debug!(
            chain = self.label,
            middleware = middleware.name(),
            priority = middleware.priority(),
            "Registering middleware"
        );
        self.entries.rcu(|current| {
            let mut next: Vec<Arc<dyn Middleware>> = current.iter().cloned().collect();
            next.push(middleware.clone());
            next.sort_by_key(|m| Reverse(m.priority()));
            next
        });
    }

    /// Removes every middleware registered under `name`.
    pub fn unregister(&self, name: &str) -> bool {
        let before = self.len();
        self.entries.rcu(|current| {
            current
                .iter()
                .filter(|m| m.name() != name)
                .cloned()
                .collect::<Vec<_>>()
        });
        let removed = self.len() < before;
        if !removed {
            warn!(chain = self.label, middleware = name, "No middleware to unregister");
        }
        removed
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .load()
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the chain over `endpoint` using the current snapshot.
    pub async fn execute(
        &self,
        envelope: &Envelope,
        ctx: &mut ExecutionContext,
        endpoint: &dyn Endpoint,
    ) -> Result<()> {
        let snapshot = self.entries.load_full();
        Next::new(&snapshot, endpoint).run(envelope, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Recorder {
        name: String,
        priority: i32,
        log: Arc<Mutex<Vec<String>>>,
        pass: bool,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn handle(
            &self,
            envelope: &Envelope,
            ctx: &mut ExecutionContext,
            next: Next<'_>,
        ) -> Result<()> {
            self.log.lock().unwrap().push(self.name.clone());
            if self.pass {
                next.run(envelope, ctx).await
            } else {
                Ok(())
            }
        }
    }

    struct RecordingEndpoint {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Endpoint for RecordingEndpoint {
        async fn call(&self, _envelope: &Envelope, _ctx: &mut ExecutionContext) -> Result<()> {
            self.log.lock().unwrap().push("endpoint".into());
            Ok(())
        }
    }

    fn recorder(
        name: &str,
        priority: i32,
        pass: bool,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn Middleware> {
        Arc::new(Recorder {
            name: name.into(),
            priority,
            log: log.clone(),
            pass,
        })
    }

    #[tokio::test]
    async fn test_descending_priority_with_stable_ties() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new("test");
        chain.register(recorder("low", 1, true, &log));
        chain.register(recorder("high", 10, true, &log));
        chain.register(recorder("mid-a", 5, true, &log));
        chain.register(recorder("mid-b", 5, true, &log));

        assert_eq!(chain.names(), vec!["high", "mid-a", "mid-b", "low"]);

        let endpoint = RecordingEndpoint { log: log.clone() };
        let mut ctx = ExecutionContext::new("c");
        chain
            .execute(&Envelope::request("1", "ping", None), &mut ctx, &endpoint)
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["high", "mid-a", "mid-b", "low", "endpoint"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_stops_lower_priorities() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new("test");
        chain.register(recorder("auth", 100, false, &log));
        chain.register(recorder("logger", 50, true, &log));

        let endpoint = RecordingEndpoint { log: log.clone() };
        let mut ctx = ExecutionContext::new("c");
        chain
            .execute(&Envelope::request("1", "ping", None), &mut ctx, &endpoint)
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["auth"]);
    }

    #[tokio::test]
    async fn test_unregister() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new("test");
        chain.register(recorder("a", 1, true, &log));
        chain.register(recorder("b", 2, true, &log));

        assert!(chain.unregister("a"));
        assert!(!chain.unregister("a"));
        assert_eq!(chain.names(), vec!["b"]);
    }
}
