//! Channel-switch coordinator.
//!
//! Tracks the window between a switch request and its confirming snapshot.
//! The previous channel's snapshot stays authoritative for the whole wait;
//! there is never a blank state.

use std::time::{Duration, Instant};

use tracing::info;

#[derive(Debug, Clone, PartialEq)]
enum SwitchState {
    Idle,
    Awaiting { channel: String, since: Instant },
}

#[derive(Debug)]
pub struct SwitchCoordinator {
    state: SwitchState,
    timeout: Duration,
}

impl SwitchCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: SwitchState::Idle,
            timeout,
        }
    }

    /// Start (or replace) a pending switch.
    pub fn request(&mut self, channel: String, now: Instant) {
        info!(channel = %channel, "channel switch requested");
        self.state = SwitchState::Awaiting {
            channel,
            since: now,
        };
    }

    pub fn is_awaiting(&self) -> bool {
        matches!(self.state, SwitchState::Awaiting { .. })
    }

    pub fn pending(&self) -> Option<&str> {
        match &self.state {
            SwitchState::Awaiting { channel, .. } => Some(channel),
            SwitchState::Idle => None,
        }
    }

    /// Feed a received snapshot's channel code.  Returns true when it
    /// confirms the pending request (which then clears).
    pub fn confirm(&mut self, channel: &str) -> bool {
        match &self.state {
            SwitchState::Awaiting { channel: want, .. } if want == channel => {
                info!(channel = %channel, "channel switch confirmed");
                self.state = SwitchState::Idle;
                true
            }
            _ => false,
        }
    }

    /// Expire the pending request if its window has passed.  Returns the
    /// failed channel code at most once per request; the state reverts to
    /// idle so the previous channel's content keeps playing.
    pub fn check_timeout(&mut self, now: Instant) -> Option<String> {
        match &self.state {
            SwitchState::Awaiting { channel, since }
                if now.saturating_duration_since(*since) >= self.timeout =>
            {
                let channel = channel.clone();
                self.state = SwitchState::Idle;
                Some(channel)
            }
            _ => None,
        }
    }

    /// Drop any pending wait without side effects (shutdown, navigation).
    pub fn cancel(&mut self) {
        self.state = SwitchState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> SwitchCoordinator {
        SwitchCoordinator::new(Duration::from_secs(10))
    }

    #[test]
    fn confirms_only_the_requested_channel() {
        let mut sw = coordinator();
        let now = Instant::now();
        sw.request("b".to_string(), now);

        assert!(!sw.confirm("a"), "unrelated snapshot must not confirm");
        assert!(sw.is_awaiting());
        assert!(sw.confirm("b"));
        assert!(!sw.is_awaiting());
        assert!(!sw.confirm("b"), "already idle");
    }

    #[test]
    fn timeout_fires_exactly_once() {
        let mut sw = coordinator();
        let now = Instant::now();
        sw.request("b".to_string(), now);

        assert_eq!(sw.check_timeout(now + Duration::from_secs(9)), None);
        assert_eq!(
            sw.check_timeout(now + Duration::from_secs(10)),
            Some("b".to_string())
        );
        assert_eq!(sw.check_timeout(now + Duration::from_secs(11)), None);
        assert!(!sw.is_awaiting());
    }

    #[test]
    fn new_request_replaces_pending_one() {
        let mut sw = coordinator();
        let now = Instant::now();
        sw.request("b".to_string(), now);
        sw.request("c".to_string(), now + Duration::from_secs(5));

        assert!(!sw.confirm("b"), "superseded request must not confirm");
        // Timeout counts from the replacing request.
        assert_eq!(sw.check_timeout(now + Duration::from_secs(12)), None);
        assert_eq!(
            sw.check_timeout(now + Duration::from_secs(15)),
            Some("c".to_string())
        );
    }

    #[test]
    fn cancel_clears_without_reporting() {
        let mut sw = coordinator();
        let now = Instant::now();
        sw.request("b".to_string(), now);
        sw.cancel();
        assert!(!sw.is_awaiting());
        assert_eq!(sw.check_timeout(now + Duration::from_secs(60)), None);
    }
}
