//! Process-wide shutdown wiring.
//!
//! Components register synchronous release hooks with one
//! [`ShutdownCoordinator`]. The coordinator runs them once, in registration
//! order, and a hook that panics does not stop the ones after it.
//!
//! Triggers:
//! - SIGINT / SIGTERM via [`ShutdownSignals`]
//! - dropping the owning [`ShutdownGuard`]
//! - an explicit [`ShutdownCoordinator::run`]

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Hook = Box<dyn FnOnce() + Send + 'static>;

struct NamedHook {
    name: String,
    hook: Hook,
}

/// Outcome of a shutdown run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Default)]
pub struct ShutdownCoordinator {
    hooks: Mutex<Vec<NamedHook>>,
    done: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn hooks(&self) -> MutexGuard<'_, Vec<NamedHook>> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a release hook. After shutdown has run, the hook runs
    /// immediately instead.
    pub fn register(&self, name: impl Into<String>, hook: impl FnOnce() + Send + 'static) {
        let named = NamedHook {
            name: name.into(),
            hook: Box::new(hook),
        };
        if self.is_done() {
            tracing::warn!(hook = %named.name, "shutdown already ran, running hook now");
            run_isolated(named);
            return;
        }
        self.hooks().push(named);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.hooks().len()
    }

    /// Run every registered hook. Only the first call does anything.
    pub fn run(&self) -> ShutdownReport {
        if self.done.swap(true, Ordering::SeqCst) {
            return ShutdownReport::default();
        }
        let hooks = std::mem::take(&mut *self.hooks());
        let mut report = ShutdownReport::default();
        for named in hooks {
            let name = named.name.clone();
            if run_isolated(named) {
                report.completed.push(name);
            } else {
                report.failed.push(name);
            }
        }
        tracing::info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            "shutdown hooks finished"
        );
        report
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("pending", &self.pending())
            .field("done", &self.is_done())
            .finish()
    }
}

fn run_isolated(named: NamedHook) -> bool {
    let NamedHook { name, hook } = named;
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(()) => {
            tracing::debug!(hook = %name, "shutdown hook completed");
            true
        }
        Err(_) => {
            tracing::error!(hook = %name, "shutdown hook panicked");
            false
        }
    }
}

/// Runs the coordinator when dropped.
#[derive(Debug)]
pub struct ShutdownGuard {
    coordinator: Arc<ShutdownCoordinator>,
}

impl ShutdownGuard {
    pub fn new(coordinator: Arc<ShutdownCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.coordinator.run();
    }
}

/// SIGINT and SIGTERM listeners.
///
/// Handlers are installed by [`ShutdownSignals::register`], so a signal
/// that arrives before the first [`ShutdownSignals::recv`] is not lost and
/// does not terminate the process. Must be called inside a Tokio runtime.
#[derive(Debug)]
pub struct ShutdownSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    pub fn register() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Resolves on the next SIGINT or SIGTERM with the signal's name.
    pub async fn recv(&mut self) -> &'static str {
        #[cfg(unix)]
        let signal = tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        };

        #[cfg(not(unix))]
        let signal = {
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        };

        tracing::info!(signal, "shutdown signal received");
        signal
    }
}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut signals = ShutdownSignals::register()?;
    Ok(signals.recv().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Hook) {
        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&order);
        let make = move |label: &'static str| -> Hook {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().unwrap().push(label))
        };
        (order, make)
    }

    #[test]
    fn test_hooks_run_once_in_order() {
        let coordinator = ShutdownCoordinator::new();
        let (order, make) = recorder();
        coordinator.register("first", make("first"));
        coordinator.register("second", make("second"));
        coordinator.register("third", make("third"));

        let report = coordinator.run();
        let again = coordinator.run();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
        assert_eq!(report.completed, vec!["first", "second", "third"]);
        assert!(again.completed.is_empty());
        assert!(coordinator.is_done());
    }

    #[test]
    fn test_panicking_hook_does_not_stop_the_rest() {
        let coordinator = ShutdownCoordinator::new();
        let (order, make) = recorder();
        coordinator.register("before", make("before"));
        coordinator.register("broken", || panic!("release failed"));
        coordinator.register("after", make("after"));

        let report = coordinator.run();

        assert_eq!(*order.lock().unwrap(), vec!["before", "after"]);
        assert_eq!(report.failed, vec!["broken"]);
    }

    #[test]
    fn test_late_registration_runs_immediately() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.run();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        coordinator.register("late", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.pending(), 0);
    }

    #[test]
    fn test_guard_drop_runs_coordinator() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        coordinator.register("count", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        drop(ShutdownGuard::new(Arc::clone(&coordinator)));
        coordinator.run();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
