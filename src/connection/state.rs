use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle of a single socket.
///
/// ```text
/// Closed --connect--> Connecting --open--> Open --close--> Closing --> Closed
///            ^             |                 |                          |
///            |             +----failure------+-------lost---------------+
///            +------------------- reconnect (backoff) ------------------+
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionStatus {
    /// User-facing label for the status.
    pub fn label(self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "Connecting",
            ConnectionStatus::Open => "Connected",
            ConnectionStatus::Closing => "Disconnecting",
            ConnectionStatus::Closed => "Disconnected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Reconnection policy: bounded attempts with exponential backoff and jitter.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub auto_reconnect: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Randomization applied to every delay, `0.2` means +/-20%.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            auto_reconnect: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 1.5,
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    /// Creates the `ExponentialBackoff` producing `min(initial * multiplier^n, max) +/- jitter`
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(self.initial_delay)
            .with_max_interval(self.max_delay)
            .with_randomization_factor(self.jitter)
            .with_multiplier(self.multiplier)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Largest delay the policy can produce once jitter is applied.
    pub fn delay_ceiling(&self) -> Duration {
        self.max_delay.mul_f64(1.0 + self.jitter.max(0.0))
    }
}

/// What happens after the socket went away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseDecision {
    Reconnect { attempt: u32, delay: Duration },
    /// The attempt budget is spent; only a manual reconnect restarts the connection.
    Exhausted,
    /// Automatic reconnection is turned off.
    Disabled,
}

/// Point-in-time view of a [`ConnectionState`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub url: String,
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub last_connected_at: Option<Instant>,
    pub is_stable: bool,
    pub exhausted: bool,
}

impl ConnectionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Open
    }

    pub fn status_label(&self) -> &'static str {
        self.status.label()
    }
}

/// Connection state machine. `is_stable` is derived from a timer armed when entering
/// [`ConnectionStatus::Open`] and dropped on any transition away from it.
pub struct ConnectionState {
    url: String,
    policy: ReconnectPolicy,
    backoff: ExponentialBackoff,
    stability_window: Duration,
    status: ConnectionStatus,
    reconnect_attempts: u32,
    last_connected_at: Option<Instant>,
    opened_at: Option<Instant>,
    is_stable: bool,
    exhausted: bool,
}

impl ConnectionState {
    pub fn new(
        url: impl Into<String>,
        policy: ReconnectPolicy,
        stability_window: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            backoff: policy.backoff(),
            policy,
            stability_window,
            status: ConnectionStatus::Closed,
            reconnect_attempts: 0,
            last_connected_at: None,
            opened_at: None,
            is_stable: false,
            exhausted: false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_stable(&self) -> bool {
        self.is_stable
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn begin_connect(&mut self) {
        self.leave_open();
        self.status = ConnectionStatus::Connecting;
    }

    pub fn on_open(&mut self, now: Instant) {
        self.status = ConnectionStatus::Open;
        self.reconnect_attempts = 0;
        self.backoff.reset();
        self.exhausted = false;
        self.last_connected_at = Some(now);
        self.opened_at = Some(now);
        self.is_stable = false;
    }

    /// Instant at which the current session becomes stable, if it is open.
    pub fn stable_at(&self) -> Option<Instant> {
        self.opened_at.map(|opened| opened + self.stability_window)
    }

    /// Fires the stability timer. Returns `true` if the connection is now stable.
    pub fn mark_stable(&mut self, now: Instant) -> bool {
        match self.stable_at() {
            Some(stable_at) if self.status == ConnectionStatus::Open && now >= stable_at => {
                self.is_stable = true;
                true
            }
            _ => false,
        }
    }

    pub fn begin_close(&mut self) {
        self.leave_open();
        self.status = ConnectionStatus::Closing;
    }

    /// Records that the socket went away and decides whether to reconnect.
    pub fn on_close(&mut self) -> CloseDecision {
        self.leave_open();
        self.status = ConnectionStatus::Closed;

        if !self.policy.auto_reconnect {
            return CloseDecision::Disabled;
        }

        if self.reconnect_attempts >= self.policy.max_attempts {
            self.exhausted = true;
            return CloseDecision::Exhausted;
        }

        self.reconnect_attempts += 1;
        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.policy.max_delay)
            .min(self.policy.delay_ceiling());

        CloseDecision::Reconnect {
            attempt: self.reconnect_attempts,
            delay,
        }
    }

    /// Explicit disconnect: closed, with no automatic reconnect scheduled.
    pub fn on_disconnect(&mut self) {
        self.leave_open();
        self.status = ConnectionStatus::Closed;
    }

    /// Clears the attempt budget ahead of a manual reconnect.
    pub fn reset_budget(&mut self) {
        self.reconnect_attempts = 0;
        self.exhausted = false;
        self.backoff.reset();
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            url: self.url.clone(),
            status: self.status,
            reconnect_attempts: self.reconnect_attempts,
            last_connected_at: self.last_connected_at,
            is_stable: self.is_stable,
            exhausted: self.exhausted,
        }
    }

    fn leave_open(&mut self) {
        self.opened_at = None;
        self.is_stable = false;
    }
}
