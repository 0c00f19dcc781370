use rand::Rng;
use std::time::Duration;

/// Election and heartbeat timing for the master raft.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftTimings {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// Deadline for a single vote or append RPC.
    pub rpc_timeout: Duration,
}

impl RaftTimings {
    /// Derive timings from the master pulse. A 5 second pulse gives
    /// elections after 2.5-5s and heartbeats every 500ms.
    pub fn from_pulse_seconds(pulse_seconds: u64) -> Self {
        let pulse = pulse_seconds.max(1);
        let election_timeout_min = Duration::from_millis(pulse * 500);
        Self {
            election_timeout_min,
            election_timeout_max: election_timeout_min * 2,
            heartbeat_interval: election_timeout_min / 5,
            rpc_timeout: election_timeout_min / 5,
        }
    }

    /// Random election timeout within the configured range
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::thread_rng().gen_range(min..=max.max(min));
        Duration::from_millis(timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pulse_timings() {
        let t = RaftTimings::from_pulse_seconds(5);
        assert_eq!(t.election_timeout_min, Duration::from_millis(2500));
        assert_eq!(t.election_timeout_max, Duration::from_millis(5000));
        assert_eq!(t.heartbeat_interval, Duration::from_millis(500));
    }

    #[test]
    fn zero_pulse_is_clamped() {
        let t = RaftTimings::from_pulse_seconds(0);
        assert_eq!(t, RaftTimings::from_pulse_seconds(1));
    }

    #[test]
    fn random_timeout_stays_in_range() {
        let t = RaftTimings::from_pulse_seconds(1);
        for _ in 0..100 {
            let d = t.random_election_timeout();
            assert!(d >= t.election_timeout_min && d <= t.election_timeout_max);
        }
    }
}
