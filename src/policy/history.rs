//! Per-destination attempt history

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Default window after which a failed destination is tried again
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(48 * 60 * 60);

/// Result of one proxyless attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Why a proxyless attempt is allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptReason {
    NeverAttempted,
    LastSucceeded,
    ConfigChanged,
    Stale,
}

/// What is known about one destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub domain: String,
    /// Attempts so far; only ever grows
    pub attempts: u64,
    pub last_outcome: Outcome,
    /// Only set by a successful attempt
    pub last_success: Option<SystemTime>,
    pub last_attempt: SystemTime,
    /// Fingerprint of the configuration used by the last attempt
    pub fingerprint: String,
}

impl AttemptRecord {
    /// Time staleness is measured from: the last success, or the last
    /// attempt if there never was one
    pub fn reference_time(&self) -> SystemTime {
        self.last_success.unwrap_or(self.last_attempt)
    }
}

/// Attempt records keyed by domain.
///
/// `decide` and `record` take the lock separately, so two concurrent dials
/// to the same domain may both be allowed before either records. Both
/// outcomes are then recorded and the count stays exact.
#[derive(Debug)]
pub struct AttemptHistory {
    records: Mutex<HashMap<String, AttemptRecord>>,
    staleness: Duration,
}

impl Default for AttemptHistory {
    fn default() -> Self {
        Self::new(DEFAULT_STALENESS)
    }
}

impl AttemptHistory {
    /// Create an empty history with the given staleness window
    pub fn new(staleness: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            staleness,
        }
    }

    /// Staleness window
    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Whether to attempt a proxyless dial to `domain` now
    pub fn decide(&self, domain: &str, fingerprint: &str) -> Option<AttemptReason> {
        self.decide_at(domain, fingerprint, SystemTime::now())
    }

    /// [`decide`](Self::decide) at an explicit time
    pub fn decide_at(
        &self,
        domain: &str,
        fingerprint: &str,
        now: SystemTime,
    ) -> Option<AttemptReason> {
        let records = self.records.lock();
        let Some(record) = records.get(domain) else {
            return Some(AttemptReason::NeverAttempted);
        };

        if record.last_outcome == Outcome::Success {
            return Some(AttemptReason::LastSucceeded);
        }
        if record.fingerprint != fingerprint {
            return Some(AttemptReason::ConfigChanged);
        }

        // A reference time in the future counts as fresh
        let age = now
            .duration_since(record.reference_time())
            .unwrap_or(Duration::ZERO);
        (age > self.staleness).then_some(AttemptReason::Stale)
    }

    /// Record the outcome of an attempt
    pub fn record(&self, domain: &str, fingerprint: &str, outcome: Outcome) {
        self.record_at(domain, fingerprint, outcome, SystemTime::now())
    }

    /// [`record`](Self::record) at an explicit time
    pub fn record_at(&self, domain: &str, fingerprint: &str, outcome: Outcome, now: SystemTime) {
        let mut records = self.records.lock();
        let record = records
            .entry(domain.to_string())
            .or_insert_with(|| AttemptRecord {
                domain: domain.to_string(),
                attempts: 0,
                last_outcome: outcome,
                last_success: None,
                last_attempt: now,
                fingerprint: fingerprint.to_string(),
            });

        record.attempts += 1;
        record.last_outcome = outcome;
        record.last_attempt = now;
        if record.fingerprint != fingerprint {
            record.fingerprint = fingerprint.to_string();
        }
        if outcome == Outcome::Success {
            record.last_success = Some(now);
        }
    }

    /// Snapshot of the record for `domain`
    pub fn get(&self, domain: &str) -> Option<AttemptRecord> {
        self.records.lock().get(domain).cloned()
    }

    /// Number of domains seen
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_never_attempted() {
        let history = AttemptHistory::default();
        assert_eq!(
            history.decide("example.com", "fp"),
            Some(AttemptReason::NeverAttempted)
        );
        assert!(history.is_empty());
    }

    #[test]
    fn test_failure_blocks_until_stale() {
        let history = AttemptHistory::default();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);

        history.record_at("example.com", "fp", Outcome::Failure, t0);
        assert_eq!(history.decide_at("example.com", "fp", t0 + HOUR), None);
        assert_eq!(history.decide_at("example.com", "fp", t0 + 48 * HOUR), None);
        assert_eq!(
            history.decide_at("example.com", "fp", t0 + 49 * HOUR),
            Some(AttemptReason::Stale)
        );
    }

    #[test]
    fn test_success_allows_attempt() {
        let history = AttemptHistory::default();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);

        history.record_at("example.com", "fp", Outcome::Success, t0);
        assert_eq!(
            history.decide_at("example.com", "fp", t0 + HOUR),
            Some(AttemptReason::LastSucceeded)
        );
    }

    #[test]
    fn test_config_change_allows_attempt() {
        let history = AttemptHistory::default();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);

        history.record_at("example.com", "old", Outcome::Failure, t0);
        assert_eq!(
            history.decide_at("example.com", "new", t0 + HOUR),
            Some(AttemptReason::ConfigChanged)
        );
        assert_eq!(history.decide_at("example.com", "old", t0 + HOUR), None);
    }

    #[test]
    fn test_reference_time_prefers_last_success() {
        let history = AttemptHistory::new(10 * HOUR);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);

        history.record_at("example.com", "fp", Outcome::Success, t0);
        history.record_at("example.com", "fp", Outcome::Failure, t0 + 8 * HOUR);

        // Staleness runs from the success at t0, not the failure at t0+8h
        assert_eq!(history.decide_at("example.com", "fp", t0 + 9 * HOUR), None);
        assert_eq!(
            history.decide_at("example.com", "fp", t0 + 11 * HOUR),
            Some(AttemptReason::Stale)
        );

        let record = history.get("example.com").unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.last_success, Some(t0));
        assert_eq!(record.last_attempt, t0 + 8 * HOUR);
        assert_eq!(record.last_outcome, Outcome::Failure);
    }

    #[test]
    fn test_record_tracks_fingerprint() {
        let history = AttemptHistory::default();
        history.record("example.com", "a", Outcome::Failure);
        history.record("example.com", "b", Outcome::Failure);

        let record = history.get("example.com").unwrap();
        assert_eq!(record.fingerprint, "b");
        assert_eq!(record.attempts, 2);
        assert_eq!(record.last_success, None);
    }

    #[test]
    fn test_concurrent_decide_and_record() {
        let history = std::sync::Arc::new(AttemptHistory::default());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let history = history.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        // Decisions may interleave with other threads' records
                        let _ = history.decide("example.com", "fp");
                        let outcome = if i % 2 == 0 {
                            Outcome::Success
                        } else {
                            Outcome::Failure
                        };
                        history.record("example.com", "fp", outcome);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let record = history.get("example.com").unwrap();
        assert_eq!(record.attempts, 800);
        assert!(record.last_success.is_some());
    }
}
