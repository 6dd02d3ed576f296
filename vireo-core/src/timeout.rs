use std::time::{Duration, Instant};

use crate::TimeoutConfig;

#[derive(Debug)]
pub(crate) struct PingState {
    last_activity: Instant,
    last_ping: Option<Instant>,
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum PingStatus {
    AllGood,
    /// Idle for `activity_timeout` with no PING pending.
    NeedToSend,
    /// Carries the idle time.
    Timeout(Duration),
}

impl PingState {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            last_activity: now,
            last_ping: None,
        }
    }

    pub(crate) fn on_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub(crate) fn on_send_ping(&mut self, now: Instant) {
        self.last_ping = Some(now);
    }

    /// A PING is pending while it was sent after the last activity.
    fn pending_ping(&self) -> Option<Instant> {
        self.last_ping.filter(|&at| at > self.last_activity)
    }

    pub(crate) fn check_status(&self, now: Instant, config: &TimeoutConfig) -> PingStatus {
        let idle = now.saturating_duration_since(self.last_activity);
        if idle < config.activity_timeout {
            return PingStatus::AllGood;
        }

        match self.pending_ping() {
            None => PingStatus::NeedToSend,
            Some(at) => {
                if now.saturating_duration_since(at) < config.ping_timeout {
                    PingStatus::AllGood
                } else {
                    PingStatus::Timeout(idle)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crate::timeout::PingStatus;
    use crate::TimeoutConfig;

    use super::PingState;

    fn config() -> TimeoutConfig {
        TimeoutConfig {
            activity_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn missing_pong() {
        let config = config();
        let now = Instant::now();
        let mut state = PingState::new(now);
        assert_eq!(state.check_status(now, &config), PingStatus::AllGood);
        let now = now + Duration::from_secs(9);
        assert_eq!(state.check_status(now, &config), PingStatus::AllGood);
        let now = now + Duration::from_secs(2);
        assert_eq!(state.check_status(now, &config), PingStatus::NeedToSend);
        state.on_send_ping(now);

        // only one PING per idle period
        let now = now + Duration::from_secs(2);
        assert_eq!(state.check_status(now, &config), PingStatus::AllGood);
        let now = now + Duration::from_secs(3);
        assert_eq!(
            state.check_status(now, &config),
            PingStatus::Timeout(Duration::from_secs(16))
        );
    }

    #[test]
    fn activity_answers_ping() {
        let config = config();
        let now = Instant::now();
        let mut state = PingState::new(now);
        let now = now + Duration::from_secs(11);
        assert_eq!(state.check_status(now, &config), PingStatus::NeedToSend);
        state.on_send_ping(now);

        let now = now + Duration::from_secs(4);
        state.on_activity(now);
        assert_eq!(state.check_status(now, &config), PingStatus::AllGood);
        let now = now + Duration::from_secs(6);
        assert_eq!(state.check_status(now, &config), PingStatus::AllGood);

        // a new idle period asks for a new PING
        let now = now + Duration::from_secs(4);
        assert_eq!(state.check_status(now, &config), PingStatus::NeedToSend);
    }
}
