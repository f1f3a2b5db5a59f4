//! The thinnest layer over a single OS child process: spawn, stream
//! its stdout/stderr as lines, kill it, and let exactly one registered
//! watcher learn when it exits.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::MonitorError;
use crate::line_stream::LineStream;
use crate::parameter::Parameter;

/// One OS child process plus its line-buffered stdout/stderr and exit
/// tracking.
///
/// A fresh `CoreCmd` is built for every run of a replica — restarting
/// means building a new one, not reusing this one.
pub struct CoreCmd {
    program: String,
    args: Vec<String>,
    work_dir: Option<String>,

    pid: Option<u32>,
    exited: std::sync::Arc<AtomicBool>,
    exit_rx: Option<watch::Receiver<bool>>,
    stdout: Option<LineStream>,
    stderr: Option<LineStream>,

    monitor_close: Mutex<Option<CancellationToken>>,
    monitor_tasks: Mutex<JoinSet<()>>,
}

impl CoreCmd {
    /// Build the command description. Building never touches the OS;
    /// the original design's separate pipe-preparation step has no
    /// fallible counterpart here because `tokio::process` only opens
    /// pipes at spawn time, so there is nothing to prepare in advance.
    pub fn new(parameter: &dyn Parameter) -> Result<Self, MonitorError> {
        Ok(Self {
            program: parameter.command().to_string(),
            args: parameter.args().to_vec(),
            work_dir: parameter.work_dir().map(str::to_string),
            pid: None,
            exited: std::sync::Arc::new(AtomicBool::new(false)),
            exit_rx: None,
            stdout: None,
            stderr: None,
            monitor_close: Mutex::new(None),
            monitor_tasks: Mutex::new(JoinSet::new()),
        })
    }

    /// Launch the process and start draining its stdout/stderr.
    #[tracing::instrument(skip_all, fields(command = %self.program))]
    pub async fn start(&mut self) -> Result<(), MonitorError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| MonitorError::wrap("failed to start command for monitoring", e))?;

        self.pid = child.id();
        self.stdout = Some(LineStream::new(child.stdout.take()));
        self.stderr = Some(LineStream::new(child.stderr.take()));

        let (exit_tx, exit_rx) = watch::channel(false);
        self.exit_rx = Some(exit_rx);
        let exited = self.exited.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(%status, "child exited"),
                Err(e) => warn!(error = %e, "error waiting on child"),
            }
            exited.store(true, Ordering::SeqCst);
            let _ = exit_tx.send(true);
        });

        Ok(())
    }

    pub async fn recv_stdout(&mut self) -> Option<String> {
        match &mut self.stdout {
            Some(s) => s.recv().await,
            None => None,
        }
    }

    pub async fn recv_stderr(&mut self) -> Option<String> {
        match &mut self.stderr {
            Some(s) => s.recv().await,
            None => None,
        }
    }

    /// Drain whatever remains of stderr and return it concatenated.
    pub async fn drain_stderr(&mut self) -> String {
        let mut buf = String::new();
        if let Some(s) = &mut self.stderr {
            while let Some(line) = s.recv().await {
                buf.push_str(&line);
            }
        }
        buf
    }

    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// A receiver that reports `true` once the child has exited.
    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exit_rx
            .clone()
            .expect("exit_signal called before start")
    }

    fn check_running(&self) -> Result<(), MonitorError> {
        if self.pid.is_none() {
            return Err(MonitorError::ProcessIdLess);
        }
        if self.is_exited() {
            return Err(MonitorError::AlreadyKilled);
        }
        Ok(())
    }

    /// Register a one-shot watcher for process exit. `done` runs on a
    /// background task and fires exactly once: immediately if the
    /// process has already exited, otherwise when it exits or when
    /// [`CoreCmd::kill`] detaches this registration.
    pub fn monitor(&self, done: impl FnOnce(Option<MonitorError>) + Send + 'static) {
        if let Err(e) = self.check_running() {
            done(Some(e));
            return;
        }

        let close = CancellationToken::new();
        *self.monitor_close.lock().unwrap() = Some(close.clone());
        let mut exit_rx = self.exit_signal();

        self.monitor_tasks.lock().unwrap().spawn(async move {
            if *exit_rx.borrow() {
                done(None);
                return;
            }
            tokio::select! {
                _ = exit_rx.changed() => done(None),
                _ = close.cancelled() => {}
            }
        });
    }

    /// Kill the process and wait for every registered monitor to
    /// detach before returning.
    pub async fn kill(&self) -> Result<(), MonitorError> {
        self.check_running()?;

        if let Some(close) = self.monitor_close.lock().unwrap().take() {
            close.cancel();
        }

        let mut tasks = std::mem::take(&mut *self.monitor_tasks.lock().unwrap());
        while tasks.join_next().await.is_some() {}

        let pid = self.pid.ok_or(MonitorError::ProcessIdLess)?;
        kill_pid(pid)
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> Result<(), MonitorError> {
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if ret == 0 {
        Ok(())
    } else {
        let err = std::io::Error::last_os_error();
        Err(MonitorError::wrap("failed to kill the command", err))
    }
}

#[cfg(not(unix))]
fn kill_pid(_pid: u32) -> Result<(), MonitorError> {
    Err(MonitorError::message(
        "killing by pid is only implemented on unix",
    ))
}
