use std::time::Duration;

/// Decides how long to wait before reconnect attempt `attempt` (1-based).
pub trait ReconnectPolicy: Send + Sync {
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// Same delay every time: no growth, no jitter, no attempt cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReconnectPolicy for FixedBackoff {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}
