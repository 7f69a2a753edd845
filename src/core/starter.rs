use crate::domain::error::{SerialdError, SerialdResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

type Work = Box<dyn FnOnce() -> BoxFuture<'static, SerialdResult<()>> + Send>;
type ErrorObserver = Arc<dyn Fn(&SerialdError) + Send + Sync>;

#[derive(Default)]
pub struct Starter {
    work: Mutex<Option<Work>>,
    observers: Mutex<Vec<ErrorObserver>>,
}

impl Starter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the unit of work, replacing any previous one not yet started.
    pub fn set_starter<F, Fut>(&self, work: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SerialdResult<()>> + Send + 'static,
    {
        *self.work.lock() = Some(Box::new(move || work().boxed()));
    }

    /// Observe errors returned by the unit of work.
    pub fn on_error(&self, observer: impl Fn(&SerialdError) + Send + Sync + 'static) {
        self.observers.lock().push(Arc::new(observer));
    }

    /// Launch the unit of work on the runtime. No-op when nothing is
    /// installed or it was already started.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let work = self.work.lock().take()?;
        let observers: Vec<ErrorObserver> = self.observers.lock().clone();
        Some(tokio::spawn(async move {
            if let Err(e) = work().await {
                for observer in &observers {
                    observer(&e);
                }
            }
        }))
    }
}
