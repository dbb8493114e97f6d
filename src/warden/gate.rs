//! Initial discovery phase
//!
//! Right after startup, health checks and discovery are still settling, so
//! every trigger is dropped until the phase ends.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct DiscoveryGate {
    ends_at: Instant,
}

impl DiscoveryGate {
    /// Start a phase of length `wait` now
    pub fn starting_now(wait: Duration) -> Self {
        Self {
            ends_at: Instant::now() + wait,
        }
    }

    /// Recovery is allowed once the phase has ended
    pub fn is_open(&self) -> bool {
        Instant::now() >= self.ends_at
    }

    pub fn remaining(&self) -> Duration {
        self.ends_at.saturating_duration_since(Instant::now())
    }

    /// Wait for the phase to end
    pub async fn opened(&self) {
        tokio::time::sleep_until(self.ends_at).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_gate_opens_after_wait() {
        let gate = DiscoveryGate::starting_now(Duration::from_secs(60));
        assert!(!gate.is_open());
        assert_eq!(gate.remaining(), Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!gate.is_open());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(gate.is_open());
        assert_eq!(gate.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opened_waits_until_end() {
        let gate = DiscoveryGate::starting_now(Duration::from_secs(5));
        let start = Instant::now();
        gate.opened().await;
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert!(gate.is_open());
    }
}
