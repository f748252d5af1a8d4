//! Update check throttle

use std::time::Duration;

use tokio::time::Instant;

/// Default minimum interval between update probes
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Local monotonic guard against redundant update probes
#[derive(Debug)]
pub struct UpdateThrottle {
    last_check_at: Option<Instant>,
    cooldown: Duration,
}

impl UpdateThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            last_check_at: None,
            cooldown,
        }
    }

    #[cfg(test)]
    pub fn last_check_at(&self) -> Option<Instant> {
        self.last_check_at
    }

    /// Time left before the next probe is allowed
    pub fn remaining(&self) -> Duration {
        match self.last_check_at {
            Some(at) => self.cooldown.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Record a check if the cooldown has elapsed
    ///
    /// Returns false, leaving the timer untouched, inside the cooldown.
    pub fn try_begin(&mut self) -> bool {
        if !self.remaining().is_zero() {
            return false;
        }
        self.last_check_at = Some(Instant::now());
        true
    }

    /// Forget the last check so the next one is allowed immediately
    pub fn reset(&mut self) {
        self.last_check_at = None;
    }
}

impl Default for UpdateThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}
