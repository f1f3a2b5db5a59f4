//! The configuration surface a caller implements to describe what to
//! run and how to supervise it.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// What to run: a program, its arguments, and an optional working
/// directory.
pub trait Parameter: Send + Sync {
    fn command(&self) -> &str;
    fn args(&self) -> &[String];
    fn work_dir(&self) -> Option<&str>;
}

/// A predicate applied to each readiness-phase line; `true` means the
/// replica is considered started.
pub type StartLinePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Supervision policy layered on top of [`Parameter`]: how many
/// replicas to keep alive, whether to restart them, and how to decide
/// a replica is ready.
pub trait MonitoringParameter: Parameter {
    fn running_mode(&self) -> RunningMode;
    fn parallel_count(&self) -> u32;
    fn stderr_is_ok(&self) -> bool;
    fn check_start_line(&self) -> Option<StartLinePredicate>;
}

/// How many times a replica is restarted after it exits cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunningMode {
    /// Exit after the first clean run; do not restart.
    RunOnce,
    /// Restart forever.
    RepeatInfinity,
    /// Restart until the replica has run this many times in total.
    RepeatAtMost(u32),
}

impl Default for RunningMode {
    fn default() -> Self {
        RunningMode::RepeatInfinity
    }
}

impl fmt::Display for RunningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunningMode::RunOnce => f.write_str("run-once"),
            RunningMode::RepeatInfinity => f.write_str("repeat-infinity"),
            RunningMode::RepeatAtMost(n) => write!(f, "repeat-at-most({n})"),
        }
    }
}

fn default_parallel_count() -> u32 {
    1
}

/// A plain, deserializable [`MonitoringParameter`] for embedders and
/// tests that don't need a bespoke configuration type.
///
/// `check_start_line` is a closure and so isn't part of the
/// deserialized shape; set it with [`StaticParameter::with_check_start_line`]
/// after loading.
#[derive(Clone, Serialize, Deserialize)]
pub struct StaticParameter {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub running_mode: RunningMode,
    #[serde(default = "default_parallel_count")]
    pub parallel_count: u32,
    #[serde(default)]
    pub stderr_is_ok: bool,
    #[serde(skip)]
    pub check_start_line: Option<StartLinePredicate>,
}

impl fmt::Debug for StaticParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticParameter")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("work_dir", &self.work_dir)
            .field("running_mode", &self.running_mode)
            .field("parallel_count", &self.parallel_count)
            .field("stderr_is_ok", &self.stderr_is_ok)
            .field("check_start_line", &self.check_start_line.is_some())
            .finish()
    }
}

impl StaticParameter {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            work_dir: None,
            running_mode: RunningMode::default(),
            parallel_count: default_parallel_count(),
            stderr_is_ok: false,
            check_start_line: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_running_mode(mut self, mode: RunningMode) -> Self {
        self.running_mode = mode;
        self
    }

    pub fn with_parallel_count(mut self, count: u32) -> Self {
        self.parallel_count = count;
        self
    }

    pub fn with_stderr_is_ok(mut self, ok: bool) -> Self {
        self.stderr_is_ok = ok;
        self
    }

    pub fn with_check_start_line(
        mut self,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.check_start_line = Some(Arc::new(predicate));
        self
    }
}

impl Parameter for StaticParameter {
    fn command(&self) -> &str {
        &self.command
    }

    fn args(&self) -> &[String] {
        &self.args
    }

    fn work_dir(&self) -> Option<&str> {
        self.work_dir.as_deref()
    }
}

impl MonitoringParameter for StaticParameter {
    fn running_mode(&self) -> RunningMode {
        self.running_mode
    }

    fn parallel_count(&self) -> u32 {
        self.parallel_count
    }

    fn stderr_is_ok(&self) -> bool {
        self.stderr_is_ok
    }

    fn check_start_line(&self) -> Option<StartLinePredicate> {
        self.check_start_line.clone()
    }
}
