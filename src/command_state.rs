//! Readiness detection for a single replica: start the process, then
//! decide whether and when it counts as "up" before handing control to
//! the long-lived monitoring loop.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::context::OperationContext;
use crate::core_cmd::CoreCmd;
use crate::deadline::deadline_timer;
use crate::error::MonitorError;
use crate::parameter::{MonitoringParameter, StartLinePredicate};

enum ReadinessEvent {
    Timeout,
    Cancelled,
    StdoutLine(String),
    StdoutClosed,
    StderrLine(String),
    StderrClosed,
}

async fn select_once(core: &mut CoreCmd, ctx: &OperationContext) -> ReadinessEvent {
    tokio::select! {
        _ = deadline_timer(ctx.deadline()) => ReadinessEvent::Timeout,
        line = core.recv_stdout() => match line {
            Some(l) => ReadinessEvent::StdoutLine(l),
            None => ReadinessEvent::StdoutClosed,
        },
        line = core.recv_stderr() => match line {
            Some(l) => ReadinessEvent::StderrLine(l),
            None => ReadinessEvent::StderrClosed,
        },
        _ = ctx.cancelled() => ReadinessEvent::Cancelled,
    }
}

enum Phase1Outcome {
    Success,
    FirstLine(String),
    Failed(MonitorError),
}

enum Phase2Outcome {
    Success,
    Failed(MonitorError),
}

/// One replica's process plus the readiness policy applied to it.
pub struct CommandState {
    core: CoreCmd,
    stderr_is_ok: bool,
    check_start_line: Option<StartLinePredicate>,
    run_count: Arc<AtomicU32>,
    parameter: Arc<dyn MonitoringParameter>,
}

impl CommandState {
    pub fn new(parameter: Arc<dyn MonitoringParameter>) -> Result<Self, MonitorError> {
        let core = CoreCmd::new(parameter.as_ref())?;
        Ok(Self {
            core,
            stderr_is_ok: parameter.stderr_is_ok(),
            check_start_line: parameter.check_start_line(),
            run_count: Arc::new(AtomicU32::new(0)),
            parameter,
        })
    }

    /// Rebuild the underlying process for a fresh run, keeping the
    /// run counter and readiness policy.
    pub fn init(&mut self) -> Result<(), MonitorError> {
        self.core = CoreCmd::new(self.parameter.as_ref())?;
        Ok(())
    }

    pub fn run_count(&self) -> u32 {
        self.run_count.load(Ordering::SeqCst)
    }

    pub fn is_exited(&self) -> bool {
        self.core.is_exited()
    }

    pub async fn kill(&self) -> Result<(), MonitorError> {
        self.core.kill().await
    }

    pub fn exit_signal(&self) -> tokio::sync::watch::Receiver<bool> {
        self.core.exit_signal()
    }

    fn matches_predicate(&self, line: &str) -> bool {
        match &self.check_start_line {
            Some(predicate) => predicate(line),
            None => true,
        }
    }

    async fn phase1(&mut self, ctx: &OperationContext) -> Phase1Outcome {
        match select_once(&mut self.core, ctx).await {
            ReadinessEvent::Timeout => Phase1Outcome::Failed(MonitorError::Timeout),
            ReadinessEvent::Cancelled => Phase1Outcome::Failed(MonitorError::UserCancel),
            ReadinessEvent::StdoutClosed => {
                let drained = self.core.drain_stderr().await;
                if drained.is_empty() {
                    Phase1Outcome::Success
                } else {
                    Phase1Outcome::Failed(MonitorError::message(drained))
                }
            }
            // The stderr side closing before producing anything carries
            // no error content of its own, so it resolves the same way
            // as an empty drain on the stdout-closed branch above.
            ReadinessEvent::StderrClosed => Phase1Outcome::Success,
            ReadinessEvent::StdoutLine(line) => Phase1Outcome::FirstLine(line),
            ReadinessEvent::StderrLine(line) => {
                if self.stderr_is_ok {
                    Phase1Outcome::FirstLine(line)
                } else {
                    Phase1Outcome::Failed(MonitorError::message(line))
                }
            }
        }
    }

    async fn phase2(&mut self, ctx: &OperationContext, mut candidate: String) -> Phase2Outcome {
        loop {
            if self.matches_predicate(&candidate) {
                return Phase2Outcome::Success;
            }
            match select_once(&mut self.core, ctx).await {
                ReadinessEvent::Timeout => return Phase2Outcome::Failed(MonitorError::Timeout),
                ReadinessEvent::Cancelled => return Phase2Outcome::Failed(MonitorError::UserCancel),
                ReadinessEvent::StdoutClosed | ReadinessEvent::StderrClosed => {
                    let drained = self.core.drain_stderr().await;
                    return Phase2Outcome::Failed(if drained.is_empty() {
                        MonitorError::message("unexpected end of input while waiting for readiness")
                    } else {
                        MonitorError::message(drained)
                    });
                }
                ReadinessEvent::StdoutLine(line) => candidate = line,
                ReadinessEvent::StderrLine(line) => {
                    if !self.stderr_is_ok {
                        return Phase2Outcome::Failed(MonitorError::message(line));
                    }
                    candidate = line;
                }
            }
        }
    }

    /// Start the process and run it through both readiness phases.
    /// Returns `None` once the replica is considered ready (or exited
    /// cleanly before producing output), `Some(err)` otherwise.
    pub async fn run(&mut self, ctx: &OperationContext) -> Option<MonitorError> {
        if let Err(e) = self.core.start().await {
            return Some(e);
        }
        self.run_count.fetch_add(1, Ordering::SeqCst);

        match self.phase1(ctx).await {
            Phase1Outcome::Success => None,
            Phase1Outcome::Failed(e) => Some(e),
            Phase1Outcome::FirstLine(line) => {
                if self.matches_predicate(&line) {
                    None
                } else {
                    match self.phase2(ctx, line).await {
                        Phase2Outcome::Success => None,
                        Phase2Outcome::Failed(e) => Some(e),
                    }
                }
            }
        }
    }
}
