//! Cross-context task submission.
//!
//! A context is a named worker thread driving a current-thread tokio runtime
//! and a `LocalSet`. The state a context owns lives in an `Rc` and never
//! leaves that thread: every other thread reaches it by submitting a job and
//! awaiting the returned [`PendingFuture`].

use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures_util::future::LocalBoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::errors::PicallError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("context '{0}' is closed")]
    Closed(&'static str),
    #[error("task panicked on context '{0}'")]
    Panicked(&'static str),
    #[error("task cancelled")]
    Cancelled,
}

type Job<S> = Box<dyn FnOnce(Rc<S>) -> LocalBoxFuture<'static, ()> + Send>;

/// Sending side of a context. Cheap to clone and `Send`, whatever `S` is.
pub struct ContextHandle<S> {
    name: &'static str,
    jobs: mpsc::UnboundedSender<Job<S>>,
}

impl<S> Clone for ContextHandle<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            jobs: self.jobs.clone(),
        }
    }
}

impl<S: 'static> ContextHandle<S> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run `task` on this context. The caller is never blocked; the task runs
    /// to completion even if the returned handle is dropped or cancelled.
    pub fn submit<T, F, Fut>(&self, task: F) -> PendingFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(Rc<S>) -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        self.dispatch(task, None)
    }

    /// Like [`submit`](Self::submit), but the task receives a [`CancelSignal`]
    /// and [`PendingFuture::cancel`] is honored: once cancellation has been
    /// requested the handle resolves with [`BridgeError::Cancelled`].
    pub fn submit_cancellable<T, F, Fut>(&self, task: F) -> PendingFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(Rc<S>, CancelSignal) -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let signal = CancelSignal::new(cancel_rx);
        self.dispatch(move |state| task(state, signal), Some(cancel_tx))
    }

    fn dispatch<T, F, Fut>(&self, task: F, cancel: Option<watch::Sender<bool>>) -> PendingFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(Rc<S>) -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let name = self.name;
        let cancelled = cancel.as_ref().map(|tx| tx.subscribe());

        let job: Job<S> = Box::new(move |state| {
            Box::pin(async move {
                let outcome = match tokio::task::spawn_local(task(state)).await {
                    Ok(_) if cancelled.as_ref().is_some_and(|rx| *rx.borrow()) => {
                        Err(BridgeError::Cancelled)
                    }
                    Ok(value) => Ok(value),
                    Err(e) if e.is_panic() => Err(BridgeError::Panicked(name)),
                    Err(_) => Err(BridgeError::Cancelled),
                };
                let _ = result_tx.send(outcome);
            })
        });

        if self.jobs.send(job).is_err() {
            tracing::debug!(context = name, "submit on closed context");
        }

        PendingFuture {
            context: name,
            result: result_rx,
            cancel,
        }
    }
}

/// Resolves exactly once with the submitted task's output or a [`BridgeError`].
pub struct PendingFuture<T> {
    context: &'static str,
    result: oneshot::Receiver<Result<T, BridgeError>>,
    cancel: Option<watch::Sender<bool>>,
}

impl<T> PendingFuture<T> {
    /// Request cancellation. Returns `false` when the task was submitted
    /// without cancellation support, in which case nothing happens.
    pub fn cancel(&self) -> bool {
        match &self.cancel {
            Some(tx) => {
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }
}

impl<T> Future for PendingFuture<T> {
    type Output = Result<T, BridgeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let context = self.context;
        Pin::new(&mut self.result)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(BridgeError::Closed(context))))
    }
}

/// Cooperative cancellation flag handed to cancellable tasks and renderer loops.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A sender/signal pair, for owners that cancel their own loops.
    pub fn pair() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self::new(rx))
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once cancellation is requested. Never completes if the
    /// sender goes away without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Owner of a context's worker thread.
pub struct ContextThread {
    name: &'static str,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ContextThread {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop accepting work and wait for the worker thread to exit. Tasks
    /// still pending are dropped and their handles resolve as closed.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!(context = self.name, "context thread panicked");
            }
        }
    }
}

/// Start a context named `name`. `init` runs on the new thread and builds the
/// state the context owns, so `S` does not need to be `Send`.
pub fn spawn_context<S, I>(
    name: &'static str,
    init: I,
) -> Result<(ContextHandle<S>, ContextThread), PicallError>
where
    S: 'static,
    I: FnOnce() -> S + Send + 'static,
{
    let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<Job<S>>();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let thread = std::thread::Builder::new()
        .name(format!("picall-{name}"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!(context = name, "failed to build runtime: {e}");
                    return;
                }
            };
            let local = tokio::task::LocalSet::new();
            local.block_on(&runtime, async move {
                let state = Rc::new(init());
                tracing::debug!(context = name, "context started");
                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        job = jobs_rx.recv() => match job {
                            Some(job) => {
                                tokio::task::spawn_local(job(state.clone()));
                            }
                            None => break,
                        },
                    }
                }
                tracing::debug!(context = name, "context stopped");
            });
        })?;

    Ok((
        ContextHandle {
            name,
            jobs: jobs_tx,
        },
        ContextThread {
            name,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        },
    ))
}
