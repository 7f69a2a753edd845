use crate::domain::error::CloseErrors;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, OnceLock, Weak};
use std::time::SystemTime;
use tokio::sync::{watch, OnceCell};
use tracing::debug;

pub type CloseResult = Result<(), CloseErrors>;

type CloseFn = Box<dyn FnOnce() -> BoxFuture<'static, CloseResult> + Send>;
type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Hooks {
    stages: Vec<CloseFn>,
    closers: Vec<CloseFn>,
    after_close: Vec<Hook>,
    notify_stages: Vec<Hook>,
    notifiers: Vec<Hook>,
    notify_ran: bool,
    close_ran: bool,
}

/// Shutdown state machine with ordered hooks and a completion signal.
///
/// Moves through `open -> notified -> closed`. Notification tells composed
/// resources that a teardown is underway so they can treat the I/O errors it
/// causes as expected. Closing always notifies first, then runs the close
/// stages, the cleanup closers and finally the after-close hooks.
pub struct Lifecycle {
    name: String,
    hooks: Mutex<Hooks>,
    this: Weak<Self>,
    notify_once: Once,
    close_once: Once,
    notified: AtomicBool,
    closed_at: OnceLock<SystemTime>,
    result: OnceCell<CloseResult>,
    done: watch::Sender<Option<CloseResult>>,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let (done, _) = watch::channel(None);
        Arc::new_cyclic(|this| Self {
            name: name.into(),
            hooks: Mutex::new(Hooks::default()),
            this: this.clone(),
            notify_once: Once::new(),
            close_once: Once::new(),
            notified: AtomicBool::new(false),
            closed_at: OnceLock::new(),
            result: OnceCell::new(),
            done,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a close stage. Stages run in registration order, each one
    /// after the stages registered before it.
    pub fn wrap_close<F, Fut>(&self, stage: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CloseResult> + Send + 'static,
    {
        self.hooks.lock().stages.push(Box::new(move || stage().boxed()));
    }

    /// Append a cleanup closer; its error is labelled with its position.
    pub fn add_closer<F, Fut>(&self, closer: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CloseResult> + Send + 'static,
    {
        self.hooks.lock().closers.push(Box::new(move || closer().boxed()));
    }

    /// Register a hook that runs once the close has completed. Runs right
    /// away when the lifecycle already finished closing.
    pub fn after_close(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.hooks.lock();
        if hooks.close_ran {
            drop(hooks);
            hook();
        } else {
            hooks.after_close.push(Box::new(hook));
        }
    }

    /// Append a notify stage, run before the plain notify hooks.
    pub fn wrap_notify(&self, stage: impl FnOnce() + Send + 'static) {
        let mut hooks = self.hooks.lock();
        if hooks.notify_ran {
            drop(hooks);
            stage();
        } else {
            hooks.notify_stages.push(Box::new(stage));
        }
    }

    pub fn on_notify(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.hooks.lock();
        if hooks.notify_ran {
            drop(hooks);
            hook();
        } else {
            hooks.notifiers.push(Box::new(hook));
        }
    }

    pub fn is_notified(&self) -> bool {
        self.notified.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.get().is_some()
    }

    pub fn closed_at(&self) -> Option<SystemTime> {
        self.closed_at.get().copied()
    }

    /// Mark the shutdown as expected. Concurrent callers return only after
    /// the first notification has run every hook.
    pub fn notify(&self) {
        self.notify_once.call_once(|| {
            self.notified.store(true, Ordering::SeqCst);
            let (stages, notifiers) = {
                let mut hooks = self.hooks.lock();
                hooks.notify_ran = true;
                (
                    mem::take(&mut hooks.notify_stages),
                    mem::take(&mut hooks.notifiers),
                )
            };
            for stage in stages {
                stage();
            }
            for hook in notifiers {
                hook();
            }
        });
    }

    /// Close once. Every caller, concurrent or later, gets the same result.
    /// The close runs on its own task, so a caller that stops waiting does
    /// not cut it short.
    pub async fn close(&self) -> CloseResult {
        self.close_once.call_once(|| {
            if let Some(this) = self.this.upgrade() {
                tokio::spawn(async move {
                    this.run_close().await;
                });
            }
        });
        if let Some(result) = self.result.get() {
            return result.clone();
        }
        self.closed().await
    }

    /// Wait until a close has completed and return its result.
    pub async fn closed(&self) -> CloseResult {
        let mut rx = self.done.subscribe();
        let result = match rx.wait_for(|r| r.is_some()).await {
            Ok(r) => (*r).clone(),
            Err(_) => None,
        };
        result.unwrap_or(Ok(()))
    }

    async fn run_close(&self) {
        self.notify();
        let _ = self.closed_at.set(SystemTime::now());

        let (stages, closers) = {
            let mut hooks = self.hooks.lock();
            (mem::take(&mut hooks.stages), mem::take(&mut hooks.closers))
        };

        let mut errors = CloseErrors::new();
        for stage in stages {
            if let Err(e) = stage().await {
                errors.extend(e);
            }
        }
        for (i, closer) in closers.into_iter().enumerate() {
            errors.push(format!("Closer #{}", i), closer().await);
        }

        let after_close = {
            let mut hooks = self.hooks.lock();
            hooks.close_ran = true;
            mem::take(&mut hooks.after_close)
        };
        for hook in after_close {
            hook();
        }

        let result = errors.into_result();
        if let Err(e) = &result {
            debug!(lifecycle = %self.name, error = %e, "closed with errors");
        }
        let _ = self.result.set(result.clone());
        self.done.send_replace(Some(result));
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("name", &self.name)
            .field("notified", &self.is_notified())
            .field("closed_at", &self.closed_at())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_close_runs_once() {
        let lifecycle = Lifecycle::new("test");
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        lifecycle.wrap_close(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut errs = CloseErrors::new();
            errs.push("SRC", Err::<(), _>("boom"));
            errs.into_result()
        });

        let mut handles = Vec::new();
        for _ in 0..16 {
            let lifecycle = Arc::clone(&lifecycle);
            handles.push(tokio::spawn(async move { lifecycle.close().await }));
        }

        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(result.unwrap_err().to_string(), "SRC: boom");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(lifecycle.is_closed());
    }

    #[tokio::test]
    async fn test_notify_precedes_close() {
        let lifecycle = Lifecycle::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        lifecycle.add_closer(move || async move {
            o.lock().push("closer");
            Ok(())
        });
        let o = Arc::clone(&order);
        lifecycle.after_close(move || o.lock().push("after"));
        let o = Arc::clone(&order);
        lifecycle.on_notify(move || o.lock().push("notify"));
        let o = Arc::clone(&order);
        lifecycle.wrap_notify(move || o.lock().push("notify-stage"));
        let o = Arc::clone(&order);
        lifecycle.wrap_close(move || async move {
            o.lock().push("stage");
            Ok(())
        });

        lifecycle.close().await.unwrap();
        assert_eq!(
            *order.lock(),
            vec!["notify-stage", "notify", "stage", "closer", "after"]
        );
    }

    #[tokio::test]
    async fn test_notify_without_close() {
        let lifecycle = Lifecycle::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        lifecycle.on_notify(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        lifecycle.notify();
        lifecycle.notify();
        assert!(lifecycle.is_notified());
        assert!(!lifecycle.is_closed());

        lifecycle.close().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closer_errors_are_labelled() {
        let lifecycle = Lifecycle::new("test");
        lifecycle.add_closer(|| async { Ok(()) });
        lifecycle.add_closer(|| async {
            let mut errs = CloseErrors::new();
            errs.push("", Err::<(), _>("disk gone"));
            errs.into_result()
        });

        let err = lifecycle.close().await.unwrap_err();
        assert_eq!(err.to_string(), "Closer #1: disk gone");
    }

    #[tokio::test]
    async fn test_dropped_close_call_still_runs_every_closer() {
        let lifecycle = Lifecycle::new("test");
        lifecycle.wrap_close(|| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        lifecycle.add_closer(move || async move {
            r.store(true, Ordering::SeqCst);
            let mut errs = CloseErrors::new();
            errs.push("", Err::<(), _>("late failure"));
            errs.into_result()
        });

        let first = tokio::time::timeout(Duration::from_millis(5), lifecycle.close()).await;
        assert!(first.is_err());

        let err = lifecycle.close().await.unwrap_err();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(err.to_string(), "Closer #0: late failure");
    }

    #[tokio::test]
    async fn test_after_close_registered_late_runs_immediately() {
        let lifecycle = Lifecycle::new("test");
        lifecycle.close().await.unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        lifecycle.after_close(move || r.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_closed_signal() {
        let lifecycle = Lifecycle::new("test");
        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.closed().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        lifecycle.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());

        // Late waiters see the stored result.
        assert!(lifecycle.closed().await.is_ok());
    }
}
