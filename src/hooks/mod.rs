//! Lifecycle hooks
//!
//! Hooks observe lifecycle points without influencing control flow. Hooks in
//! a phase run sequentially in registration order; a hook that fails or
//! panics is logged and the remaining hooks still run.

use crate::error::Result;
use crate::protocol::ErrorInfo;
use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookPhase {
    OnConnect,
    OnDisconnect,
    BeforeHandlerExecution,
    AfterHandlerExecution,
    OnStart,
    OnStop,
    OnError,
}

#[derive(Debug, Clone)]
pub struct HookContext {
    pub event: HookPhase,
    pub client_id: Option<String>,
    pub request_id: Option<String>,
    pub tool_name: Option<String>,
    pub duration: Option<Duration>,
    pub error: Option<ErrorInfo>,
}

impl HookContext {
    pub fn new(event: HookPhase) -> Self {
        Self {
            event,
            client_id: None,
            request_id: None,
            tool_name: None,
            duration: None,
            error: None,
        }
    }

    pub fn client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn request(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }
}

type HookFn = dyn Fn(HookContext) -> BoxFuture<'static, Result<()>> + Send + Sync;

#[derive(Clone)]
pub struct Hook {
    pub name: String,
    pub phase: HookPhase,
    handler: Arc<HookFn>,
}

impl Hook {
    pub fn new<F, Fut>(name: impl Into<String>, phase: HookPhase, handler: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            phase,
            handler: Arc::new(move |ctx| handler(ctx).boxed()),
        }
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .finish()
    }
}

#[derive(Default)]
pub struct HookRegistry {
    phases: ArcSwap<HashMap<HookPhase, Vec<Hook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hook: Hook) {
        debug!(hook = %hook.name, phase = ?hook.phase, "Registering hook");
        self.phases.rcu(|current| {
            let mut next = (**current).clone();
            next.entry(hook.phase).or_default().push(hook.clone());
            next
        });
    }

    pub fn count(&self, phase: HookPhase) -> usize {
        self.phases.load().get(&phase).map_or(0, Vec::len)
    }

    /// Runs every hook registered for `ctx.event`. Returns how many of them
    /// completed successfully.
    pub async fn run(&self, ctx: HookContext) -> usize {
        let snapshot = self.phases.load_full();
        let Some(hooks) = snapshot.get(&ctx.event) else {
            return 0;
        };

        let mut succeeded = 0;
        for hook in hooks {
            // the closure itself may panic before handing back its future
            let start = AssertUnwindSafe(|| (hook.handler)(ctx.clone()));
            let started = std::panic::catch_unwind(start);
            let outcome = match started {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            };
            match outcome {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(e)) => {
                    warn!(hook = %hook.name, phase = ?ctx.event, error = %e, "Hook failed");
                }
                Err(_) => {
                    warn!(hook = %hook.name, phase = ?ctx.event, "Hook panicked");
                }
            }
        }
        succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_hooks_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = HookRegistry::new();

        for name in ["first", "second", "third"] {
            let log = log.clone();
            registry.register(Hook::new(name, HookPhase::OnStart, move |_| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(name);
                    Ok(())
                }
            }));
        }

        let ran = registry.run(HookContext::new(HookPhase::OnStart)).await;
        assert_eq!(ran, 3);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_failing_and_panicking_hooks_do_not_abort_phase() {
        let reached = Arc::new(Mutex::new(false));
        let registry = HookRegistry::new();

        registry.register(Hook::new("fails", HookPhase::OnError, |_| async {
            Err(RuntimeError::Internal("boom".into()))
        }));
        registry.register(Hook::new("panics", HookPhase::OnError, |_| async {
            if true {
                panic!("hook panic");
            }
            Ok(())
        }));
        let flag = reached.clone();
        registry.register(Hook::new("after", HookPhase::OnError, move |ctx| {
            let flag = flag.clone();
            async move {
                assert_eq!(ctx.client_id.as_deref(), Some("c1"));
                *flag.lock().unwrap() = true;
                Ok(())
            }
        }));

        let ran = registry
            .run(HookContext::new(HookPhase::OnError).client("c1"))
            .await;
        assert_eq!(ran, 1);
        assert!(*reached.lock().unwrap());
    }

    #[tokio::test]
    async fn test_hook_panicking_before_its_future_is_isolated() {
        let reached = Arc::new(Mutex::new(false));
        let registry = HookRegistry::new();

        registry.register(Hook::new("eager", HookPhase::OnDisconnect, |ctx| {
            let seen: Vec<String> = Vec::new();
            let index = ctx.client_id.map_or(0, |id| id.len());
            let first = seen[index].clone();
            async move {
                drop(first);
                Ok(())
            }
        }));
        let flag = reached.clone();
        registry.register(Hook::new("after", HookPhase::OnDisconnect, move |_| {
            let flag = flag.clone();
            async move {
                *flag.lock().unwrap() = true;
                Ok(())
            }
        }));

        let ran = registry
            .run(HookContext::new(HookPhase::OnDisconnect).client("c1"))
            .await;
        assert_eq!(ran, 1);
        assert!(*reached.lock().unwrap());
    }

    #[tokio::test]
    async fn test_phases_are_isolated() {
        let registry = HookRegistry::new();
        registry.register(Hook::new("start", HookPhase::OnStart, |_| async { Ok(()) }));

        assert_eq!(registry.count(HookPhase::OnStart), 1);
        assert_eq!(registry.count(HookPhase::OnStop), 0);
        assert_eq!(registry.run(HookContext::new(HookPhase::OnStop)).await, 0);
    }
}
