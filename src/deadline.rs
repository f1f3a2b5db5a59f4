//! A timer that fires at an absolute deadline, or effectively never.

use std::time::{Duration, Instant};
use tokio::time::Sleep;

/// Mirrors an "infinite" duration: long enough that no test or caller
/// will ever observe it firing on its own.
const INFINITE_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 1_000_000);

/// Build a sleep future from an optional absolute deadline.
///
/// `None` sleeps for [`INFINITE_TIMEOUT`]. A deadline already in the
/// past resolves to a zero-length sleep, i.e. fires on the next poll.
pub fn deadline_timer(deadline: Option<Instant>) -> Sleep {
    let duration = match deadline {
        None => INFINITE_TIMEOUT,
        Some(at) => at.saturating_duration_since(Instant::now()),
    };
    tokio::time::sleep(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_immediately_when_deadline_already_passed() {
        let past = Instant::now();
        tokio::time::advance(Duration::from_millis(1)).await;
        deadline_timer(Some(past)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_fire_before_real_deadlines_elapse() {
        let at = Instant::now() + Duration::from_secs(5);
        let result = tokio::time::timeout(Duration::from_secs(1), deadline_timer(Some(at))).await;
        assert!(result.is_err(), "timer fired before its deadline");
    }
}
