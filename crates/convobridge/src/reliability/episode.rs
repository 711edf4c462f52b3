//! Outage episodes and the pairing attempts they bound.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use ulid::Ulid;

use super::error::{ReliabilityError, Result};

/// Identity of one pairing attempt: the episode it belongs to and its number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId {
    pub episode: Ulid,
    pub number: u32,
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.episode, self.number)
    }
}

/// A pairing attempt issued within an episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingAttempt {
    pub tenant_id: String,
    pub id: AttemptId,
    /// Conversation the challenge and its follow-ups are posted to.
    pub conversation_id: u64,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

impl PairingAttempt {
    /// 1-based attempt number within its episode.
    pub fn number(&self) -> u32 {
        self.id.number
    }
}

struct ArmedTimer {
    attempt: AttemptId,
    cancel: oneshot::Sender<()>,
}

/// The span from first detected disconnection to reconnection.
///
/// Owns the attempt counter, so a new episode always starts with a fresh
/// budget. At most one expiry timer is armed at a time.
pub struct OutageEpisode {
    id: Ulid,
    tenant_id: String,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    attempts: u32,
    max_attempts: u32,
    armed: Option<ArmedTimer>,
    closed: bool,
}

impl OutageEpisode {
    /// Open an episode starting now with an empty attempt budget.
    pub fn new(tenant_id: &str, max_attempts: u32) -> Self {
        Self {
            id: Ulid::new(),
            tenant_id: tenant_id.to_string(),
            started_at: Instant::now(),
            started_wall: Utc::now(),
            attempts: 0,
            max_attempts,
            armed: None,
            closed: false,
        }
    }

    /// Unique id, stamped into every attempt of this episode.
    pub fn id(&self) -> Ulid {
        self.id
    }

    /// Attempts issued so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Attempt budget of this episode.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// When the disconnection was first detected.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Time elapsed since the episode started.
    pub fn down_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.started_at)
    }

    /// True once no further attempts may be issued.
    pub fn budget_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// True after [`close`](Self::close).
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True if `attempt` is the latest attempt of this still-open episode.
    pub fn is_current(&self, attempt: &AttemptId) -> bool {
        !self.closed && attempt.episode == self.id && attempt.number == self.attempts
    }

    /// Issue the next attempt, cancelling the previous attempt's timer.
    pub fn begin_attempt(
        &mut self,
        conversation_id: u64,
        expiry: Duration,
    ) -> Result<PairingAttempt> {
        if self.closed {
            return Err(ReliabilityError::TransportUnavailable {
                tenant: self.tenant_id.clone(),
                reason: "outage episode already ended".to_string(),
            });
        }
        if self.budget_exhausted() {
            return Err(ReliabilityError::RetryBudgetExhausted {
                attempts: self.attempts,
                max_attempts: self.max_attempts,
            });
        }

        self.cancel_timer();
        self.attempts += 1;
        let issued_at = Instant::now();
        Ok(PairingAttempt {
            tenant_id: self.tenant_id.clone(),
            id: AttemptId {
                episode: self.id,
                number: self.attempts,
            },
            conversation_id,
            issued_at,
            expires_at: issued_at + expiry,
        })
    }

    /// Register the expiry timer of `attempt`. Returns false (and drops
    /// `cancel`) if the attempt is no longer current.
    pub fn arm(&mut self, attempt: AttemptId, cancel: oneshot::Sender<()>) -> bool {
        if !self.is_current(&attempt) {
            return false;
        }
        self.cancel_timer();
        self.armed = Some(ArmedTimer { attempt, cancel });
        true
    }

    /// Disarm the timer of `attempt` after it resolved. Returns false if the
    /// attempt was superseded, cancelled or already settled.
    pub fn settle(&mut self, attempt: &AttemptId) -> bool {
        if !self.is_current(attempt) {
            return false;
        }
        match &self.armed {
            Some(armed) if armed.attempt == *attempt => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }

    /// True while an issued challenge awaits its expiry.
    pub fn has_armed_timer(&self) -> bool {
        self.armed.is_some()
    }

    fn cancel_timer(&mut self) {
        if let Some(armed) = self.armed.take() {
            let _ = armed.cancel.send(());
        }
    }

    /// End the episode: cancel any armed timer and refuse further attempts.
    pub fn close(&mut self) {
        self.cancel_timer();
        self.closed = true;
    }

    /// Snapshot for status reporting.
    pub fn status(&self) -> EpisodeStatus {
        EpisodeStatus {
            episode_id: self.id.to_string(),
            started_at: self.started_wall,
            down_for_seconds: self.down_for().as_secs(),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            pairing_pending: self.armed.is_some(),
        }
    }
}

/// Serializable snapshot of an episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpisodeStatus {
    pub episode_id: String,
    pub started_at: DateTime<Utc>,
    pub down_for_seconds: u64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub pairing_pending: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPIRY: Duration = Duration::from_secs(30);

    #[test]
    fn attempts_are_bounded() {
        let mut episode = OutageEpisode::new("acme", 5);
        for n in 1..=5 {
            let attempt = episode.begin_attempt(42, EXPIRY).unwrap();
            assert_eq!(attempt.number(), n);
        }
        assert!(episode.budget_exhausted());
        assert!(matches!(
            episode.begin_attempt(42, EXPIRY),
            Err(ReliabilityError::RetryBudgetExhausted {
                attempts: 5,
                max_attempts: 5
            })
        ));
        assert_eq!(episode.attempts(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_is_relative_to_issue_time() {
        let mut episode = OutageEpisode::new("acme", 5);
        let attempt = episode.begin_attempt(42, EXPIRY).unwrap();
        assert_eq!(attempt.expires_at - attempt.issued_at, EXPIRY);
    }

    #[test]
    fn new_attempt_cancels_previous_timer() {
        let mut episode = OutageEpisode::new("acme", 5);
        let first = episode.begin_attempt(42, EXPIRY).unwrap();
        let (tx, mut rx) = oneshot::channel();
        assert!(episode.arm(first.id, tx));

        let second = episode.begin_attempt(42, EXPIRY).unwrap();
        assert_eq!(rx.try_recv(), Ok(()));
        assert!(!episode.is_current(&first.id));
        assert!(!episode.settle(&first.id));
        assert!(episode.is_current(&second.id));
    }

    #[test]
    fn arm_refuses_superseded_attempt() {
        let mut episode = OutageEpisode::new("acme", 5);
        let first = episode.begin_attempt(42, EXPIRY).unwrap();
        episode.begin_attempt(42, EXPIRY).unwrap();

        let (tx, _rx) = oneshot::channel();
        assert!(!episode.arm(first.id, tx));
        assert!(!episode.has_armed_timer());
    }

    #[test]
    fn settle_only_once() {
        let mut episode = OutageEpisode::new("acme", 5);
        let attempt = episode.begin_attempt(42, EXPIRY).unwrap();
        let (tx, _rx) = oneshot::channel();
        episode.arm(attempt.id, tx);

        assert!(episode.settle(&attempt.id));
        assert!(!episode.settle(&attempt.id));
    }

    #[test]
    fn close_cancels_timer_and_blocks_attempts() {
        let mut episode = OutageEpisode::new("acme", 5);
        let attempt = episode.begin_attempt(42, EXPIRY).unwrap();
        let (tx, mut rx) = oneshot::channel();
        episode.arm(attempt.id, tx);

        episode.close();
        assert_eq!(rx.try_recv(), Ok(()));
        assert!(!episode.is_current(&attempt.id));
        assert!(episode.begin_attempt(42, EXPIRY).is_err());
    }

    #[test]
    fn attempt_from_other_episode_is_not_current() {
        let mut old = OutageEpisode::new("acme", 5);
        let stale = old.begin_attempt(42, EXPIRY).unwrap();
        let mut fresh = OutageEpisode::new("acme", 5);
        fresh.begin_attempt(42, EXPIRY).unwrap();
        assert!(!fresh.is_current(&stale.id));
    }
}
