//! Single-flight coordination for access-token refreshes.
//!
//! The first request to observe a 401 becomes the leader and performs the
//! refresh; every request that fails while the leader is working queues a
//! continuation and receives the leader's outcome. The queue is settled as a
//! unit: all waiters get the same token or the same failure.

use crate::api::error::RefreshFailure;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

pub(crate) type RefreshOutcome = Result<String, RefreshFailure>;

type Waiter = oneshot::Sender<RefreshOutcome>;

#[derive(Debug)]
enum RefreshState {
    Idle,
    Refreshing { waiters: Vec<Waiter> },
}

#[derive(Debug)]
pub(crate) struct RefreshGate {
    state: Mutex<RefreshState>,
}

pub(crate) enum Admission {
    /// The caller owns the refresh and must settle it.
    Leader(RefreshLeader),
    /// A refresh is already running; await its outcome.
    Follower(oneshot::Receiver<RefreshOutcome>),
}

impl RefreshGate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RefreshState::Idle),
        })
    }

    /// Checks and claims the gate under one lock, so two 401s observed back
    /// to back can never both become leaders.
    pub(crate) fn admit(self: &Arc<Self>) -> Admission {
        let mut state = self.state.lock();
        if let RefreshState::Refreshing { waiters } = &mut *state {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            return Admission::Follower(rx);
        }
        *state = RefreshState::Refreshing {
            waiters: Vec::new(),
        };
        Admission::Leader(RefreshLeader {
            gate: Arc::clone(self),
            settled: false,
        })
    }

    pub(crate) fn is_refreshing(&self) -> bool {
        matches!(*self.state.lock(), RefreshState::Refreshing { .. })
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        match &*self.state.lock() {
            RefreshState::Idle => 0,
            RefreshState::Refreshing { waiters } => waiters.len(),
        }
    }

    fn settle(&self, outcome: RefreshOutcome) -> usize {
        let waiters = match std::mem::replace(&mut *self.state.lock(), RefreshState::Idle) {
            RefreshState::Idle => Vec::new(),
            RefreshState::Refreshing { waiters } => waiters,
        };
        let count = waiters.len();
        for waiter in waiters {
            // A dropped receiver means that caller went away; nothing to do.
            let _ = waiter.send(outcome.clone());
        }
        count
    }
}

/// Proof of leadership. Dropping it unsettled rejects every waiter, so a
/// cancelled leader cannot strand the queue.
pub(crate) struct RefreshLeader {
    gate: Arc<RefreshGate>,
    settled: bool,
}

impl RefreshLeader {
    /// Hands `outcome` to every queued request and returns the gate to idle.
    /// Returns how many requests were waiting.
    pub(crate) fn settle(mut self, outcome: RefreshOutcome) -> usize {
        self.settled = true;
        self.gate.settle(outcome)
    }
}

impl Drop for RefreshLeader {
    fn drop(&mut self) {
        if !self.settled {
            let abandoned = self.gate.settle(Err(RefreshFailure::Transport(
                "token refresh was abandoned".into(),
            )));
            tracing::warn!(
                target: "console_link::api",
                abandoned,
                "refresh leader dropped before settling"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leader(admission: Admission) -> RefreshLeader {
        match admission {
            Admission::Leader(leader) => leader,
            Admission::Follower(_) => panic!("expected leadership"),
        }
    }

    fn follower(admission: Admission) -> oneshot::Receiver<RefreshOutcome> {
        match admission {
            Admission::Follower(rx) => rx,
            Admission::Leader(_) => panic!("expected to queue behind the leader"),
        }
    }

    #[tokio::test]
    async fn only_the_first_caller_leads() {
        let gate = RefreshGate::new();
        let lead = leader(gate.admit());
        let waiters: Vec<_> = (0..3).map(|_| follower(gate.admit())).collect();
        assert!(gate.is_refreshing());
        assert_eq!(gate.queued(), 3);

        assert_eq!(lead.settle(Ok("fresh".into())), 3);
        assert!(!gate.is_refreshing());
        for rx in waiters {
            assert_eq!(rx.await.unwrap(), Ok("fresh".to_string()));
        }

        // The next expiry episode gets a new leader.
        let _next = leader(gate.admit());
    }

    #[tokio::test]
    async fn failure_rejects_every_waiter() {
        let gate = RefreshGate::new();
        let lead = leader(gate.admit());
        let a = follower(gate.admit());
        let b = follower(gate.admit());

        lead.settle(Err(RefreshFailure::MissingRefreshToken));
        assert_eq!(a.await.unwrap(), Err(RefreshFailure::MissingRefreshToken));
        assert_eq!(b.await.unwrap(), Err(RefreshFailure::MissingRefreshToken));
        assert!(!gate.is_refreshing());
    }

    #[tokio::test]
    async fn dropped_leader_releases_queue() {
        let gate = RefreshGate::new();
        let lead = leader(gate.admit());
        let waiter = follower(gate.admit());
        drop(lead);

        assert!(matches!(
            waiter.await.unwrap(),
            Err(RefreshFailure::Transport(_))
        ));
        assert!(!gate.is_refreshing());
    }
}
