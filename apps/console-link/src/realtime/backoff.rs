use std::time::Duration;

pub const CLOSE_NORMAL: u16 = 1000;
/// Sent when the peer closed without a status code; in practice the platform
/// tore the socket down (navigation, sleep), not the broker.
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Fixed delay used after a [`CLOSE_NO_STATUS`] close.
    pub clean_close_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            clean_close_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Closed on purpose; stay down.
    Stay,
    Retry { delay: Duration, attempts: u32 },
    /// The attempt budget is spent.
    Exhausted { attempts: u32 },
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max)`, saturating.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Decides what follows a close with `code`, given the attempts made since
    /// the last successful connect.
    pub fn on_close(&self, code: u16, attempts: u32) -> ReconnectDecision {
        match code {
            CLOSE_NORMAL => ReconnectDecision::Stay,
            CLOSE_NO_STATUS => ReconnectDecision::Retry {
                delay: self.clean_close_delay,
                attempts,
            },
            _ => {
                let attempts = attempts.saturating_add(1);
                if attempts > self.max_attempts {
                    ReconnectDecision::Exhausted { attempts }
                } else {
                    ReconnectDecision::Retry {
                        delay: self.delay_for(attempts),
                        attempts,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abnormal_closes_back_off_exponentially_up_to_the_cap() {
        let policy = ReconnectPolicy {
            max_attempts: 10,
            ..ReconnectPolicy::default()
        };
        let mut attempts = 0;
        let mut delays = Vec::new();
        while let ReconnectDecision::Retry {
            delay,
            attempts: next,
        } = policy.on_close(CLOSE_ABNORMAL, attempts)
        {
            assert_eq!(delay, policy.delay_for(next));
            delays.push(delay.as_secs());
            attempts = next;
        }
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30, 30, 30, 30, 30]);
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn stops_after_the_attempt_budget() {
        let policy = ReconnectPolicy::default();
        assert!(matches!(
            policy.on_close(4000, 4),
            ReconnectDecision::Retry { attempts: 5, .. }
        ));
        assert_eq!(
            policy.on_close(4000, 5),
            ReconnectDecision::Exhausted { attempts: 6 }
        );
    }

    #[test]
    fn platform_close_retries_without_consuming_budget() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.on_close(CLOSE_NO_STATUS, 3),
            ReconnectDecision::Retry {
                delay: Duration::from_secs(2),
                attempts: 3
            }
        );
    }

    #[test]
    fn normal_close_stays_down() {
        assert_eq!(
            ReconnectPolicy::default().on_close(CLOSE_NORMAL, 0),
            ReconnectDecision::Stay
        );
    }

    #[test]
    fn huge_attempt_counts_saturate_at_the_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(64), policy.max_delay);
        assert_eq!(policy.delay_for(31), policy.max_delay);
    }
}
