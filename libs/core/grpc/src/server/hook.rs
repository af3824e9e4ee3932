use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::config::DEFAULT_HOOK_TIMEOUT;
use super::context::{ContextError, ShutdownContext};
use super::error::{BoxError, ServerError};
use super::join_all;

type HookFn = Arc<dyn Fn(ShutdownContext) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Cleanup step run after the listeners have been drained.
///
/// Hooks run in ascending `priority` order (launch order; they execute
/// concurrently once launched). Each receives a context bounded by its own
/// `timeout` and by the overall shutdown deadline.
#[derive(Clone)]
pub struct ShutdownHook {
    pub name: String,
    pub priority: i32,
    pub timeout: Duration,
    hook: HookFn,
}

impl ShutdownHook {
    /// A zero `timeout` falls back to five seconds.
    pub fn new<F, Fut>(name: impl Into<String>, priority: i32, timeout: Duration, hook: F) -> Self
    where
        F: Fn(ShutdownContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            priority,
            timeout: if timeout.is_zero() { DEFAULT_HOOK_TIMEOUT } else { timeout },
            hook: Arc::new(move |ctx: ShutdownContext| -> BoxFuture<'static, Result<(), BoxError>> {
                Box::pin(hook(ctx))
            }),
        }
    }
}

impl fmt::Debug for ShutdownHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHook")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .finish()
    }
}

async fn run_hook(hook: ShutdownHook, ctx: ShutdownContext) -> Option<ServerError> {
    let hook_ctx = ctx.with_timeout(hook.timeout);
    let started = Instant::now();
    debug!(hook = %hook.name, priority = hook.priority, "Executing shutdown hook");

    let result = (hook.hook)(hook_ctx.clone()).await;

    // Checked after the callback returns: a hook that ignored its context and
    // overran the timeout is still reported, whatever it returned.
    if hook_ctx.err() == Some(ContextError::DeadlineExceeded) {
        warn!(hook = %hook.name, timeout = ?hook.timeout, "Shutdown hook timed out");
        return Some(ServerError::HookTimedOut(hook.name));
    }

    match result {
        Ok(()) => {
            info!(hook = %hook.name, duration = ?started.elapsed(), "Shutdown hook completed");
            None
        }
        Err(err) => {
            error!(hook = %hook.name, error = %err, "Shutdown hook failed");
            Some(ServerError::hook_failed(&hook.name, err))
        }
    }
}

/// Runs `hooks` under `ctx` and joins their errors.
///
/// If `ctx` finishes before every hook has returned, the hooks still running
/// are detached and `ShutdownTimeout` is returned.
pub(crate) async fn execute_hooks(
    hooks: &[ShutdownHook],
    ctx: &ShutdownContext,
    span: &Span,
) -> Result<(), ServerError> {
    if hooks.is_empty() {
        return Ok(());
    }

    let mut ordered: Vec<ShutdownHook> = hooks.to_vec();
    ordered.sort_by_key(|hook| hook.priority);

    let errors = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = JoinSet::new();
    for hook in ordered {
        let errors = Arc::clone(&errors);
        let ctx = ctx.clone();
        tasks.spawn(
            async move {
                if let Some(err) = run_hook(hook, ctx).await {
                    errors
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(err);
                }
            }
            .instrument(span.clone()),
        );
    }

    let finished = tokio::select! {
        biased;
        _ = join_all(&mut tasks) => true,
        _ = ctx.done() => false,
    };

    if !finished {
        warn!(remaining = tasks.len(), "Shutdown deadline reached while hooks were running");
        tasks.detach_all();
        return Err(ServerError::ShutdownTimeout);
    }

    let errors = std::mem::take(&mut *errors.lock().unwrap_or_else(PoisonError::into_inner));
    ServerError::join(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn ok_hook(name: &str, priority: i32, order: Arc<Mutex<Vec<String>>>) -> ShutdownHook {
        let label = name.to_string();
        ShutdownHook::new(name, priority, Duration::from_secs(1), move |_ctx| {
            let order = Arc::clone(&order);
            let label = label.clone();
            async move {
                order.lock().unwrap().push(label);
                Ok(())
            }
        })
    }

    #[test]
    fn test_zero_timeout_uses_default() {
        let hook = ShutdownHook::new("noop", 0, Duration::ZERO, |_| async { Ok(()) });
        assert_eq!(hook.timeout, DEFAULT_HOOK_TIMEOUT);
    }

    #[tokio::test]
    async fn test_no_hooks_is_ok() {
        let result = execute_hooks(&[], &ShutdownContext::background(), &Span::none()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_hooks_launch_in_priority_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let hooks = vec![
            ok_hook("third", 30, Arc::clone(&order)),
            ok_hook("first", -1, Arc::clone(&order)),
            ok_hook("second", 10, Arc::clone(&order)),
        ];

        // A current-thread runtime polls spawned tasks in spawn order.
        execute_hooks(&hooks, &ShutdownContext::background(), &Span::none())
            .await
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_failing_hook_is_reported_by_name() {
        let hooks = vec![
            ShutdownHook::new("broken", 1, Duration::from_secs(1), |_| async {
                Err::<(), BoxError>("disk full".into())
            }),
            ShutdownHook::new("fine", 2, Duration::from_secs(1), |_| async { Ok(()) }),
        ];

        let err = execute_hooks(&hooks, &ShutdownContext::background(), &Span::none())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::HookFailed { ref name, .. } if name == "broken"));
    }

    #[tokio::test]
    async fn test_hook_ignoring_deadline_is_timed_out() {
        let hooks = vec![ShutdownHook::new(
            "stubborn",
            1,
            Duration::from_millis(50),
            |_ctx| async {
                sleep(Duration::from_millis(150)).await;
                Ok(())
            },
        )];

        let err = execute_hooks(&hooks, &ShutdownContext::background(), &Span::none())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::HookTimedOut(ref name) if name == "stubborn"));
    }

    #[tokio::test]
    async fn test_hook_observes_its_deadline() {
        let hooks = vec![ShutdownHook::new(
            "polite",
            1,
            Duration::from_millis(50),
            |ctx: ShutdownContext| async move {
                ctx.done().await;
                Err::<(), BoxError>("interrupted".into())
            },
        )];

        let err = execute_hooks(&hooks, &ShutdownContext::background(), &Span::none())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::HookTimedOut(_)));
    }

    #[tokio::test]
    async fn test_overall_deadline_returns_shutdown_timeout() {
        let completed = Arc::new(AtomicUsize::new(0));
        let slow_done = Arc::clone(&completed);
        let hooks = vec![
            ShutdownHook::new("slow", 1, Duration::from_secs(5), move |_| {
                let slow_done = Arc::clone(&slow_done);
                async move {
                    sleep(Duration::from_secs(2)).await;
                    slow_done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            ShutdownHook::new("fast", 2, Duration::from_secs(5), |_| async { Ok(()) }),
        ];

        let ctx = ShutdownContext::background().with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        let err = execute_hooks(&hooks, &ctx, &Span::none()).await.unwrap_err();

        assert!(matches!(err, ServerError::ShutdownTimeout));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_hooks_run_even_when_one_fails() {
        let ran = Arc::new(AtomicUsize::new(0));
        let hooks: Vec<ShutdownHook> = (0..4)
            .map(|i| {
                let ran = Arc::clone(&ran);
                ShutdownHook::new(format!("hook-{i}"), i, Duration::from_secs(1), move |_| {
                    let ran = Arc::clone(&ran);
                    async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        if i == 0 {
                            Err::<(), BoxError>("boom".into())
                        } else {
                            Ok(())
                        }
                    }
                })
            })
            .collect();

        let err = execute_hooks(&hooks, &ShutdownContext::background(), &Span::none())
            .await
            .unwrap_err();
        assert_eq!(err.errors().len(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }
}
