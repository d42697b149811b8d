use parking_lot::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Minimum spacing between accepted manual reconnects.
pub const DEFAULT_RECONNECT_COOLDOWN: Duration = Duration::from_secs(10);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Rate Limit Reached: {reason}")]
    Limit { reason: String },
}

/// Accepts at most one manual reconnect per cooldown window.
#[derive(Debug)]
pub struct ReconnectGate {
    cooldown: Duration,
    last_accepted: Mutex<Option<Instant>>,
}

impl ReconnectGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_accepted: Mutex::new(None),
        }
    }

    /// Accepts the request if more than `cooldown` has passed since the last accepted one.
    pub fn try_acquire(&self, now: Instant) -> Result<(), RateLimitError> {
        let mut last_accepted = self.last_accepted.lock();

        if let Some(last) = *last_accepted {
            let elapsed = now.saturating_duration_since(last);
            if elapsed <= self.cooldown {
                debug!(
                    message = "manual reconnect rejected",
                    elapsed_ms = elapsed.as_millis() as u64,
                    cooldown_ms = self.cooldown.as_millis() as u64
                );
                return Err(RateLimitError::Limit {
                    reason: format!(
                        "manual reconnect allowed once every {}s",
                        self.cooldown.as_secs()
                    ),
                });
            }
        }

        *last_accepted = Some(now);
        Ok(())
    }
}

impl Default for ReconnectGate {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reconnect_is_accepted() {
        let gate = ReconnectGate::default();
        assert!(gate.try_acquire(Instant::now()).is_ok());
    }

    #[test]
    fn test_reconnects_inside_cooldown_are_rejected() {
        let gate = ReconnectGate::default();
        let start = Instant::now();

        gate.try_acquire(start).unwrap();

        let err = gate
            .try_acquire(start + Duration::from_secs(3))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Rate Limit Reached: manual reconnect allowed once every 10s"
        );

        // exactly on the boundary is still inside the window
        assert!(gate.try_acquire(start + Duration::from_secs(10)).is_err());
        assert!(
            gate.try_acquire(start + Duration::from_millis(10_001))
                .is_ok()
        );
    }

    #[test]
    fn test_rejected_attempts_do_not_extend_window() {
        let gate = ReconnectGate::new(Duration::from_secs(10));
        let start = Instant::now();

        gate.try_acquire(start).unwrap();
        assert!(gate.try_acquire(start + Duration::from_secs(9)).is_err());
        assert!(gate.try_acquire(start + Duration::from_secs(11)).is_ok());
    }
}
