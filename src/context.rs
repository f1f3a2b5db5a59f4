//! Caller-facing cancellation/deadline handles, and the internal
//! completion tracking used to report the outcome of a command back
//! to whoever submitted it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::error::MonitorError;

/// A deadline and a cancellation signal, supplied by the caller of
/// `Start`/`Kill`/`Stop` and threaded down into a running command.
#[derive(Clone)]
pub struct OperationContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl OperationContext {
    /// No deadline, never cancelled unless [`OperationContext::cancel`] is called.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::background()
        }
    }

    pub fn with_timeout(timeout: std::time::Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::background()
    }
}

/// Which of the three orchestrator operations a [`CommandContext`] was
/// created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitoringCommand {
    Start,
    Kill,
    Stop,
}

impl fmt::Display for MonitoringCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitoringCommand::Start => "start",
            MonitoringCommand::Kill => "kill",
            MonitoringCommand::Stop => "stop",
        };
        f.write_str(name)
    }
}

struct Inner {
    parent: Option<Arc<Inner>>,
    operation: OperationContext,
    command: MonitoringCommand,
    done_tx: tokio::sync::watch::Sender<bool>,
    done_rx: tokio::sync::watch::Receiver<bool>,
    error: Mutex<Option<MonitorError>>,
    completed: AtomicBool,
}

fn complete_inner(inner: &Arc<Inner>, err: Option<MonitorError>) {
    if inner.completed.swap(true, Ordering::SeqCst) {
        return;
    }
    *inner.error.lock().unwrap() = err.clone();
    let _ = inner.done_tx.send(true);
    if let Some(parent) = &inner.parent {
        complete_inner(parent, err);
    }
}

/// Tracks one submitted command from enqueue to completion.
///
/// Completion is idempotent and, when the context was built with
/// [`CommandContext::nested`], propagates up to the parent — the
/// handle the original caller is waiting on.
#[derive(Clone)]
pub struct CommandContext {
    inner: Arc<Inner>,
}

impl CommandContext {
    pub fn new(operation: OperationContext, command: MonitoringCommand) -> Self {
        let (done_tx, done_rx) = tokio::sync::watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                parent: None,
                operation,
                command,
                done_tx,
                done_rx,
                error: Mutex::new(None),
                completed: AtomicBool::new(false),
            }),
        }
    }

    /// A child context sharing this context's operation, whose
    /// completion bubbles up to `self`.
    pub fn nested(&self, command: MonitoringCommand) -> Self {
        let (done_tx, done_rx) = tokio::sync::watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                parent: Some(self.inner.clone()),
                operation: self.inner.operation.clone(),
                command,
                done_tx,
                done_rx,
                error: Mutex::new(None),
                completed: AtomicBool::new(false),
            }),
        }
    }

    pub fn command(&self) -> MonitoringCommand {
        self.inner.command
    }

    pub fn operation(&self) -> &OperationContext {
        &self.inner.operation
    }

    /// Mark this context (and its ancestors) complete. A no-op past
    /// the first call.
    pub fn complete(&self, err: Option<MonitorError>) {
        complete_inner(&self.inner, err);
    }

    pub fn is_done(&self) -> bool {
        *self.inner.done_rx.borrow()
    }

    pub fn error(&self) -> Option<MonitorError> {
        self.inner.error.lock().unwrap().clone()
    }

    /// Block until complete, either because the command finished or
    /// because the caller's own operation was cancelled first — in
    /// which case this context completes itself with `UserCancel`.
    pub async fn wait_done(&self) {
        let mut rx = self.inner.done_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            tokio::select! {
                _ = rx.changed() => {}
                _ = self.inner.operation.cancelled() => {
                    complete_inner(&self.inner, Some(MonitorError::UserCancel));
                }
            }
        }
    }
}
