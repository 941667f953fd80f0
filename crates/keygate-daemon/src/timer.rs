use std::time::Duration;

/// How long to sleep before looking at the session again: until its deadline,
/// but never longer than one poll so manual locks and new sessions are noticed.
pub fn next_wake(now: i64, expires_at: i64, poll: Duration) -> Duration {
    if expires_at <= now {
        return Duration::ZERO;
    }
    let until_deadline = Duration::from_secs((expires_at - now) as u64);
    until_deadline.min(poll)
}
