//! The orchestrator: fan out `parallel_count` replicas, bring them all
//! up before reporting `Start` successful, then keep each one running
//! (restarting per the configured [`RunningMode`]) until `Kill` or
//! `Stop` tears everything down.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command_state::CommandState;
use crate::context::{CommandContext, MonitoringCommand, OperationContext};
use crate::error::{several_errors, MonitorError};
use crate::parameter::{MonitoringParameter, RunningMode};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Stopped = 0,
    Starting = 1,
    Monitoring = 2,
    Finish = 3,
}

impl Stage {
    fn from_u8(v: u8) -> Stage {
        match v {
            0 => Stage::Stopped,
            1 => Stage::Starting,
            2 => Stage::Monitoring,
            _ => Stage::Finish,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Stopped => "stopped",
            Stage::Starting => "starting",
            Stage::Monitoring => "monitoring",
            Stage::Finish => "finished",
        };
        f.write_str(name)
    }
}

type Replica = Arc<AsyncMutex<CommandState>>;

/// A running supervisor for `parallel_count` replicas of one command.
///
/// Cloning a `Monitoring` handle (it's cheap, just an `Arc`) gives you
/// another reference to the same supervisor; `Start`/`Kill`/`Stop` are
/// safe to call from any clone concurrently — they're serialized
/// through a single internal command loop.
pub struct Monitoring {
    parameter: Arc<dyn MonitoringParameter>,
    stage: AtomicU8,
    replicas: Mutex<Vec<Replica>>,
    monitor_broadcast: Mutex<Option<CancellationToken>>,
    last_error: Mutex<Option<MonitorError>>,
    command_tx: mpsc::UnboundedSender<CommandContext>,
    finished_rx: tokio::sync::watch::Receiver<bool>,
}

impl Monitoring {
    pub fn new(parameter: Arc<dyn MonitoringParameter>) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = tokio::sync::watch::channel(false);

        let monitoring = Arc::new(Self {
            parameter,
            stage: AtomicU8::new(Stage::Stopped as u8),
            replicas: Mutex::new(Vec::new()),
            monitor_broadcast: Mutex::new(None),
            last_error: Mutex::new(None),
            command_tx,
            finished_rx,
        });

        spawn_command_loop(monitoring.clone(), command_rx, finished_tx);
        monitoring
    }

    fn submit(self: &Arc<Self>, ctx: OperationContext, command: MonitoringCommand) -> CommandContext {
        let cctx = CommandContext::new(ctx, command);
        if self.command_tx.send(cctx.clone()).is_err() {
            cctx.complete(Some(MonitorError::MonitoringStopped));
        }
        cctx
    }

    pub async fn start(self: &Arc<Self>, ctx: OperationContext) -> Option<MonitorError> {
        let cctx = self.submit(ctx, MonitoringCommand::Start);
        cctx.wait_done().await;
        cctx.error()
    }

    pub async fn kill(self: &Arc<Self>, ctx: OperationContext) -> Option<MonitorError> {
        let cctx = self.submit(ctx, MonitoringCommand::Kill);
        cctx.wait_done().await;
        cctx.error()
    }

    pub async fn stop(self: &Arc<Self>, ctx: OperationContext) -> Option<MonitorError> {
        let cctx = self.submit(ctx, MonitoringCommand::Stop);
        cctx.wait_done().await;
        cctx.error()
    }

    /// The most recent error observed, if any, from either a replica's
    /// readiness run or the restart loop.
    pub fn has_error(&self) -> Option<MonitorError> {
        self.last_error.lock().unwrap().clone()
    }

    /// Block until the supervisor has finished: `Stop`/`Kill` completed,
    /// or every replica ran to completion under `RunOnce`/`RepeatAtMost`.
    pub async fn wait(&self) {
        let mut rx = self.finished_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    fn stage(&self) -> Stage {
        Stage::from_u8(self.stage.load(Ordering::SeqCst))
    }

    #[tracing::instrument(skip_all)]
    async fn command_start(self: &Arc<Self>, ctx: &CommandContext) -> (bool, Option<MonitorError>) {
        if self
            .stage
            .compare_exchange(
                Stage::Stopped as u8,
                Stage::Starting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return (false, Some(MonitorError::AlreadyStarted));
        }

        let parallel = self.parameter.parallel_count().max(1);
        let mut replicas = Vec::with_capacity(parallel as usize);
        for _ in 0..parallel {
            match CommandState::new(self.parameter.clone()) {
                Ok(state) => replicas.push(Arc::new(AsyncMutex::new(state))),
                Err(e) => {
                    self.stage.store(Stage::Stopped as u8, Ordering::SeqCst);
                    return (
                        true,
                        Some(MonitorError::wrap("failed to create command for monitoring", e)),
                    );
                }
            }
        }

        *self.replicas.lock().unwrap() = replicas.clone();

        let (tx, mut rx) = mpsc::channel::<Option<MonitorError>>(replicas.len().max(1));
        let op = ctx.operation().clone();
        for replica in &replicas {
            let replica = replica.clone();
            let op = op.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = replica.lock().await.run(&op).await;
                let _ = tx.send(outcome).await;
            });
        }
        drop(tx);

        let mut outcomes = Vec::with_capacity(replicas.len());
        for _ in 0..replicas.len() {
            match rx.recv().await {
                Some(outcome) => outcomes.push(outcome),
                None => break,
            }
        }
        let failure = several_errors("failed to start command", outcomes);

        match failure {
            None => {
                if self
                    .stage
                    .compare_exchange(
                        Stage::Starting as u8,
                        Stage::Monitoring as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_err()
                {
                    self.kill_all().await;
                    return (
                        true,
                        Some(MonitorError::message(
                            "monitoring was torn down while replicas were starting",
                        )),
                    );
                }

                let broadcast = CancellationToken::new();
                *self.monitor_broadcast.lock().unwrap() = Some(broadcast.clone());
                for replica in &replicas {
                    let monitoring = self.clone();
                    let replica = replica.clone();
                    let broadcast = broadcast.clone();
                    tokio::spawn(async move { monitoring.run_replica_loop(replica, broadcast).await });
                }
                debug!(parallel, "all replicas ready");
                (false, None)
            }
            Some(err) => {
                warn!(%err, "one or more replicas failed to start, killing the rest");
                self.kill_all().await;
                (true, Some(err))
            }
        }
    }

    #[tracing::instrument(skip_all)]
    async fn command_kill(self: &Arc<Self>, ctx: &CommandContext) -> (bool, Option<MonitorError>) {
        if self
            .stage
            .compare_exchange(
                Stage::Monitoring as u8,
                Stage::Stopped as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return (false, Some(MonitorError::AlreadyStopped));
        }

        let monitoring = self.clone();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            monitoring.kill_all().await;
            let _ = done_tx.send(());
        });

        tokio::select! {
            _ = done_rx => (true, None),
            _ = ctx.operation().cancelled() => (true, Some(MonitorError::UserCancel)),
        }
    }

    #[tracing::instrument(skip_all)]
    async fn command_stop(self: &Arc<Self>, ctx: &CommandContext) -> (bool, Option<MonitorError>) {
        self.stage.store(Stage::Finish as u8, Ordering::SeqCst);

        let monitoring = self.clone();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            monitoring.kill_all().await;
            let _ = done_tx.send(());
        });

        tokio::select! {
            _ = done_rx => (true, None),
            _ = ctx.operation().cancelled() => (true, Some(MonitorError::UserCancel)),
        }
    }

    async fn kill_all(&self) {
        if let Some(token) = self.monitor_broadcast.lock().unwrap().take() {
            token.cancel();
        }

        let replicas = self.replicas.lock().unwrap().clone();
        let mut set = JoinSet::new();
        for replica in replicas {
            set.spawn(async move {
                let guard = replica.lock().await;
                if !guard.is_exited() {
                    let _ = guard.kill().await;
                }
            });
        }
        while set.join_next().await.is_some() {}
    }

    /// Owns one replica's lifetime after its initial readiness run
    /// succeeded: wait for it to exit, then restart it according to
    /// the configured [`RunningMode`], or hand off to a self-initiated
    /// `Stop` once it shouldn't run again.
    async fn run_replica_loop(self: Arc<Self>, replica: Replica, broadcast: CancellationToken) {
        loop {
            let mut exit_rx = { replica.lock().await.exit_signal() };
            if !*exit_rx.borrow() {
                tokio::select! {
                    _ = exit_rx.changed() => {}
                    _ = broadcast.cancelled() => return,
                }
            }

            let run_count = { replica.lock().await.run_count() };
            let should_restart = match self.parameter.running_mode() {
                RunningMode::RunOnce => false,
                RunningMode::RepeatInfinity => true,
                RunningMode::RepeatAtMost(limit) => run_count < limit,
            };

            if !should_restart {
                info!(run_count, "replica finished, stopping supervisor");
                self.self_initiated_stop();
                return;
            }

            let outcome = {
                let mut guard = replica.lock().await;
                if let Err(e) = guard.init() {
                    Some(e)
                } else {
                    guard.run(&OperationContext::background()).await
                }
            };

            if let Some(err) = outcome {
                warn!(%err, "replica failed to restart, stopping supervisor");
                *self.last_error.lock().unwrap() = Some(err);
                self.self_initiated_stop();
                return;
            }
        }
    }

    fn self_initiated_stop(self: &Arc<Self>) {
        let monitoring = self.clone();
        tokio::spawn(async move {
            monitoring.stop(OperationContext::background()).await;
        });
    }
}

fn spawn_command_loop(
    monitoring: Arc<Monitoring>,
    mut command_rx: mpsc::UnboundedReceiver<CommandContext>,
    finished_tx: tokio::sync::watch::Sender<bool>,
) {
    tokio::spawn(async move {
        let mut absorbed = false;
        while let Some(cctx) = command_rx.recv().await {
            if absorbed {
                cctx.complete(Some(MonitorError::MonitoringStopped));
                continue;
            }

            // Dispatch runs against a context nested one level below the
            // one the caller is awaiting: completing it bubbles the
            // outcome up to `cctx` automatically, the same shape as the
            // per-dispatch/per-submission split the orchestrator this
            // was grounded on uses.
            let dispatch = cctx.nested(cctx.command());
            let (finish, err) = match dispatch.command() {
                MonitoringCommand::Start => monitoring.command_start(&dispatch).await,
                MonitoringCommand::Kill => monitoring.command_kill(&dispatch).await,
                MonitoringCommand::Stop => monitoring.command_stop(&dispatch).await,
            };
            dispatch.complete(err.clone());

            if let Some(e) = &err {
                *monitoring.last_error.lock().unwrap() = Some(e.clone());
            }

            if finish && !absorbed {
                absorbed = true;
                let _ = finished_tx.send(true);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::StaticParameter;
    use std::time::Duration;

    fn sleepy(seconds: &str) -> Arc<dyn MonitoringParameter> {
        Arc::new(
            StaticParameter::new("sleep")
                .with_args([seconds])
                .with_running_mode(RunningMode::RunOnce),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_then_kill() {
        let monitoring = Monitoring::new(sleepy("30"));
        assert_eq!(monitoring.start(OperationContext::background()).await, None);
        assert_eq!(monitoring.kill(OperationContext::background()).await, None);
        monitoring.wait().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn double_start_is_already_started() {
        let monitoring = Monitoring::new(sleepy("30"));
        assert_eq!(monitoring.start(OperationContext::background()).await, None);
        assert_eq!(
            monitoring.start(OperationContext::background()).await,
            Some(MonitorError::AlreadyStarted)
        );
        monitoring.kill(OperationContext::background()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn kill_before_start_is_already_stopped() {
        let monitoring = Monitoring::new(sleepy("30"));
        assert_eq!(
            monitoring.kill(OperationContext::background()).await,
            Some(MonitorError::AlreadyStopped)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_once_finishes_on_its_own() {
        let monitoring = Monitoring::new(sleepy("0"));
        assert_eq!(monitoring.start(OperationContext::background()).await, None);
        tokio::time::timeout(Duration::from_secs(5), monitoring.wait())
            .await
            .expect("supervisor should self-stop after a run-once replica exits");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repeat_infinity_survives_kill_mid_restart() {
        let monitoring = Monitoring::new(Arc::new(
            StaticParameter::new("sleep")
                .with_args(["0"])
                .with_running_mode(RunningMode::RepeatInfinity),
        ));
        assert_eq!(monitoring.start(OperationContext::background()).await, None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(monitoring.kill(OperationContext::background()).await, None);
    }
}
