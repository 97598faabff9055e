use std::time::Duration;

/// How long a graceful cancel may take before the job is cancelled forcibly.
/// Measured from the time written into the cancellation marker.
pub fn get_cancel_grace_period() -> Duration {
    get_duration_from_env("METAQ_CANCEL_GRACE_PERIOD_MS").unwrap_or_else(|| Duration::from_secs(60))
}

fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}
