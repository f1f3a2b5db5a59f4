//! End-to-end workflows through the public `Monitoring` API, covering
//! the representative scenarios the supervision engine is built for:
//! a clean one-shot run, deadline success and failure, stderr capture,
//! killing an infinitely-repeating replica, and cancelling an in-flight
//! `Start`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use procmon_core::{Monitoring, OperationContext, RunningMode, StaticParameter};

fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn param(command: &str, args: &[&str]) -> Arc<StaticParameter> {
    init_tracing();
    Arc::new(StaticParameter::new(command).with_args(args.iter().copied()))
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_once_runs_to_completion() {
    let monitoring = Monitoring::new(param("echo", &["hello"]));
    assert_eq!(monitoring.start(OperationContext::background()).await, None);
    tokio::time::timeout(Duration::from_secs(5), monitoring.wait())
        .await
        .expect("run-once replica should finish on its own");
    assert_eq!(monitoring.has_error(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn sleep_within_deadline_succeeds() {
    let monitoring = Monitoring::new(param("sleep", &["0"]));
    let ctx = OperationContext::with_timeout(Duration::from_secs(5));
    assert_eq!(monitoring.start(ctx).await, None);
    monitoring.kill(OperationContext::background()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sleep_past_deadline_times_out() {
    let monitoring = Monitoring::new(param("sleep", &["5"]));
    let ctx = OperationContext::with_timeout(Duration::from_millis(50));
    let err = monitoring.start(ctx).await.expect("start should fail");
    assert!(err.to_string().contains("timeout error"), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn stderr_text_surfaces_as_the_start_error() {
    let monitoring = Monitoring::new(param("sh", &["-c", "echo broken >&2; exit 1"]));
    let err = monitoring
        .start(OperationContext::background())
        .await
        .expect("start should fail");
    assert!(err.to_string().contains("broken"), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn kill_stops_an_infinitely_repeating_replica() {
    let monitoring = Monitoring::new(Arc::new(
        StaticParameter::new("sleep")
            .with_args(["0"])
            .with_running_mode(RunningMode::RepeatInfinity)
            .with_parallel_count(2),
    ));

    assert_eq!(monitoring.start(OperationContext::background()).await, None);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(monitoring.kill(OperationContext::background()).await, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_start_before_it_completes_reports_user_cancel() {
    let monitoring = Monitoring::new(param("sleep", &["5"]));
    let ctx = OperationContext::with_deadline(Instant::now() + Duration::from_secs(60));

    let cancel_ctx = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_ctx.cancel();
    });

    let err = monitoring.start(ctx).await.expect("start should be cancelled");
    assert!(err.to_string().contains("user cancel"), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn repeat_at_most_stops_itself_after_the_limit() {
    let monitoring = Monitoring::new(Arc::new(
        StaticParameter::new("sleep")
            .with_args(["0"])
            .with_running_mode(RunningMode::RepeatAtMost(3)),
    ));

    assert_eq!(monitoring.start(OperationContext::background()).await, None);
    tokio::time::timeout(Duration::from_secs(5), monitoring.wait())
        .await
        .expect("supervisor should self-stop once the replica hits its restart limit");
}
