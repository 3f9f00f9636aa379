use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Opaque identity of one network-bound orchestration step.
///
/// Tokens are issued monotonically; a completion whose token no longer matches
/// the tracker's current token belongs to a superseded round and is discarded
/// unconditionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoundToken(u64);

impl RoundToken {
    pub const NONE: RoundToken = RoundToken(0);

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RoundToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "round-{}", self.0)
    }
}

/// What the operator asked the round to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundKind {
    Verify,
    Signup,
}

impl RoundKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::Signup => "signup",
        }
    }
}

/// Observable phase of the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    Idle,
    FetchingProfile,
    SigningOn,
    Discovering,
    Discovered,
    Failed,
    Cancelled,
}

impl RoundPhase {
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::FetchingProfile => "fetching_profile",
            Self::SigningOn => "signing_on",
            Self::Discovering => "discovering",
            Self::Discovered => "discovered",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Discovered | Self::Failed | Self::Cancelled)
    }
}

/// Snapshot published on the UI-update channel at every phase transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub token: RoundToken,
    pub kind: Option<RoundKind>,
    pub phase: RoundPhase,
    pub detail: Option<String>,
}

impl RoundSnapshot {
    pub fn idle() -> Self {
        Self {
            token: RoundToken::NONE,
            kind: None,
            phase: RoundPhase::Idle,
            detail: None,
        }
    }
}

/// Issues round and challenge tokens and tracks which one is current.
///
/// At most one round token is current at a time. Starting any new network-bound
/// step supersedes the previous token, so the previous step's eventual
/// completion compares unequal and is dropped. The MFA challenge path keeps its
/// own current-challenge marker with the same semantics.
#[derive(Debug, Default)]
pub struct RoundTracker {
    sequence: AtomicU64,
    current_round: AtomicU64,
    current_challenge: AtomicU64,
    cancel_requested: AtomicBool,
}

impl RoundTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh token and record it as the current round step.
    pub fn issue(&self) -> RoundToken {
        let token = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.current_round.store(token, Ordering::SeqCst);
        RoundToken(token)
    }

    pub fn is_current(&self, token: RoundToken) -> bool {
        token.0 != 0 && self.current_round.load(Ordering::SeqCst) == token.0
    }

    /// Retire `token` if it is still current (terminal state reached).
    pub fn retire(&self, token: RoundToken) {
        let _ = self.current_round.compare_exchange(
            token.0,
            0,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Clear every current marker; all in-flight completions become stale.
    pub fn supersede_all(&self) {
        self.current_round.store(0, Ordering::SeqCst);
        self.current_challenge.store(0, Ordering::SeqCst);
    }

    /// Cooperative cancellation: clear every current marker and flag the
    /// in-flight round so it reports `Cancelled` rather than `Superseded`
    /// when its next completion finds itself stale.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.supersede_all();
    }

    /// Consume a pending cancellation request.
    pub fn take_cancel_request(&self) -> bool {
        self.cancel_requested.swap(false, Ordering::SeqCst)
    }

    /// Issue a fresh challenge token and record it as the current challenge.
    pub fn issue_challenge(&self) -> RoundToken {
        let token = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.current_challenge.store(token, Ordering::SeqCst);
        RoundToken(token)
    }

    pub fn is_current_challenge(&self, token: RoundToken) -> bool {
        token.0 != 0 && self.current_challenge.load(Ordering::SeqCst) == token.0
    }

    pub fn retire_challenge(&self, token: RoundToken) {
        let _ = self.current_challenge.compare_exchange(
            token.0,
            0,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_monotonic_and_unique() {
        let tracker = RoundTracker::new();
        let a = tracker.issue();
        let b = tracker.issue();
        let c = tracker.issue_challenge();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn newer_round_supersedes_older_token() {
        let tracker = RoundTracker::new();
        let first = tracker.issue();
        assert!(tracker.is_current(first));

        let second = tracker.issue();
        assert!(!tracker.is_current(first));
        assert!(tracker.is_current(second));
    }

    #[test]
    fn retire_only_clears_the_matching_token() {
        let tracker = RoundTracker::new();
        let first = tracker.issue();
        let second = tracker.issue();

        // A stale retire must not knock out the newer round.
        tracker.retire(first);
        assert!(tracker.is_current(second));

        tracker.retire(second);
        assert!(!tracker.is_current(second));
    }

    #[test]
    fn supersede_all_clears_round_and_challenge_markers() {
        let tracker = RoundTracker::new();
        let round = tracker.issue();
        let challenge = tracker.issue_challenge();

        tracker.supersede_all();
        assert!(!tracker.is_current(round));
        assert!(!tracker.is_current_challenge(challenge));
    }

    #[test]
    fn cancel_request_is_consumed_once() {
        let tracker = RoundTracker::new();
        let round = tracker.issue();

        tracker.request_cancel();
        assert!(!tracker.is_current(round));
        assert!(tracker.take_cancel_request());
        assert!(!tracker.take_cancel_request());
    }

    #[test]
    fn challenge_marker_is_independent_of_round_marker() {
        let tracker = RoundTracker::new();
        let round = tracker.issue();
        let first = tracker.issue_challenge();
        let second = tracker.issue_challenge();

        assert!(tracker.is_current(round));
        assert!(!tracker.is_current_challenge(first));
        assert!(tracker.is_current_challenge(second));
    }
}
