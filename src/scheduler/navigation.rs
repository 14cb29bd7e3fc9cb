//! Navigation pattern tracking.
//!
//! Learners tend to move between the same pieces of content in the same
//! order. The tracker remembers, per session, the last identity visited and
//! counts A→B transitions observed within a time window. Once a transition
//! has been seen often enough, a visit to A predicts B.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::SchedulerError;
use crate::identity::ContentIdentity;

/// Successors kept per source identity.
pub const DEFAULT_MAX_SUCCESSORS: usize = 16;

/// Source identities with remembered transitions.
pub const DEFAULT_MAX_SOURCES: usize = 10_000;

#[derive(Debug, Clone)]
struct LastVisit {
    key: String,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Transition {
    target: ContentIdentity,
    count: u64,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct NavigationState {
    sessions: HashMap<String, LastVisit>,
    transitions: HashMap<String, HashMap<String, Transition>>,
}

/// A predicted next identity and how often the transition was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prediction {
    pub identity: ContentIdentity,
    pub count: u64,
}

/// Counts A→B transitions per session.
pub struct NavigationTracker {
    window: chrono::Duration,
    threshold: u64,
    max_successors: usize,
    max_sources: usize,
    state: Mutex<NavigationState>,
}

impl NavigationTracker {
    /// Creates a tracker.
    ///
    /// # Arguments
    ///
    /// * `window` - Maximum gap between A and B for the pair to count
    /// * `threshold` - Transition count at which B is predicted from A
    pub fn new(window: Duration, threshold: u64) -> Self {
        Self {
            window: chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::minutes(10)),
            threshold: threshold.max(1),
            max_successors: DEFAULT_MAX_SUCCESSORS,
            max_sources: DEFAULT_MAX_SOURCES,
            state: Mutex::new(NavigationState::default()),
        }
    }

    /// Caps how many successors are remembered per source.
    pub fn with_max_successors(mut self, max: usize) -> Self {
        self.max_successors = max.max(1);
        self
    }

    /// Caps how many source identities keep transitions.
    pub fn with_max_sources(mut self, max: usize) -> Self {
        self.max_sources = max.max(1);
        self
    }

    /// Records a visit and returns the identities predicted to follow it.
    ///
    /// Predictions are ordered by transition count, highest first.
    pub fn record_visit(
        &self,
        session: &str,
        identity: &ContentIdentity,
        now: DateTime<Utc>,
    ) -> Result<Vec<Prediction>, SchedulerError> {
        let key = identity.key();
        let mut state = self.state.lock().map_err(|_| SchedulerError::LockPoisoned)?;

        let previous = state.sessions.insert(
            session.to_string(),
            LastVisit {
                key: key.clone(),
                at: now,
            },
        );

        if let Some(prev) = previous {
            if prev.key != key && now >= prev.at && now - prev.at <= self.window {
                let source = prev.key;
                let successors = state.transitions.entry(source.clone()).or_default();
                successors
                    .entry(key.clone())
                    .and_modify(|t| {
                        t.count += 1;
                        t.last_seen = now;
                    })
                    .or_insert_with(|| Transition {
                        target: identity.clone(),
                        count: 1,
                        last_seen: now,
                    });
                trim_successors(successors, self.max_successors, &key);
                trim_sources(&mut state.transitions, self.max_sources, &source);
            }
        }

        let mut predictions: Vec<Prediction> = state
            .transitions
            .get(&key)
            .map(|successors| {
                successors
                    .values()
                    .filter(|t| t.count >= self.threshold)
                    .map(|t| Prediction {
                        identity: t.target.clone(),
                        count: t.count,
                    })
                    .collect()
            })
            .unwrap_or_default();
        predictions.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(predictions)
    }

    /// Forgets sessions whose last visit is older than the window.
    pub fn prune_sessions(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let mut state = self.state.lock().map_err(|_| SchedulerError::LockPoisoned)?;
        let cutoff = now - self.window;
        let before = state.sessions.len();
        state.sessions.retain(|_, visit| visit.at >= cutoff);
        Ok(before - state.sessions.len())
    }

    /// Observed count of the A→B transition.
    pub fn transition_count(&self, from: &ContentIdentity, to: &ContentIdentity) -> u64 {
        self.state
            .lock()
            .ok()
            .and_then(|state| {
                state
                    .transitions
                    .get(&from.key())
                    .and_then(|s| s.get(&to.key()))
                    .map(|t| t.count)
            })
            .unwrap_or(0)
    }

    pub fn tracked_sessions(&self) -> usize {
        self.state.lock().map(|s| s.sessions.len()).unwrap_or(0)
    }
}

/// Drops the weakest successor once the cap is exceeded, never the one just recorded.
fn trim_successors(successors: &mut HashMap<String, Transition>, max: usize, keep: &str) {
    while successors.len() > max {
        let weakest = successors
            .iter()
            .filter(|(k, _)| k.as_str() != keep)
            .min_by(|(_, a), (_, b)| a.count.cmp(&b.count).then(a.last_seen.cmp(&b.last_seen)))
            .map(|(k, _)| k.clone());
        match weakest {
            Some(k) => {
                successors.remove(&k);
            }
            None => break,
        }
    }
}

/// Drops the source whose newest transition is oldest once the cap is exceeded.
fn trim_sources(
    transitions: &mut HashMap<String, HashMap<String, Transition>>,
    max: usize,
    keep: &str,
) {
    while transitions.len() > max {
        let stalest = transitions
            .iter()
            .filter(|(k, _)| k.as_str() != keep)
            .min_by_key(|(_, successors)| successors.values().map(|t| t.last_seen).max())
            .map(|(k, _)| k.clone());
        match stalest {
            Some(k) => {
                transitions.remove(&k);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(skill: &str) -> ContentIdentity {
        ContentIdentity::new("5", "Math", skill)
    }

    #[test]
    fn test_prediction_after_threshold() {
        let tracker = NavigationTracker::new(Duration::from_secs(600), 2);
        let t0 = Utc::now();

        for (i, session) in ["s1", "s2"].iter().enumerate() {
            let at = t0 + chrono::Duration::seconds(i as i64 * 10);
            tracker.record_visit(session, &id("A"), at).unwrap();
            tracker
                .record_visit(session, &id("B"), at + chrono::Duration::seconds(5))
                .unwrap();
        }

        let predictions = tracker
            .record_visit("s3", &id("A"), t0 + chrono::Duration::seconds(60))
            .unwrap();
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].identity, id("B"));
        assert_eq!(predictions[0].count, 2);
    }

    #[test]
    fn test_below_threshold_predicts_nothing() {
        let tracker = NavigationTracker::new(Duration::from_secs(600), 3);
        let t0 = Utc::now();
        tracker.record_visit("s1", &id("A"), t0).unwrap();
        tracker.record_visit("s1", &id("B"), t0).unwrap();

        assert!(tracker.record_visit("s2", &id("A"), t0).unwrap().is_empty());
        assert_eq!(tracker.transition_count(&id("A"), &id("B")), 1);
    }

    #[test]
    fn test_transition_outside_window_ignored() {
        let tracker = NavigationTracker::new(Duration::from_secs(60), 1);
        let t0 = Utc::now();
        tracker.record_visit("s1", &id("A"), t0).unwrap();
        tracker
            .record_visit("s1", &id("B"), t0 + chrono::Duration::seconds(61))
            .unwrap();

        assert_eq!(tracker.transition_count(&id("A"), &id("B")), 0);
    }

    #[test]
    fn test_sessions_are_independent() {
        let tracker = NavigationTracker::new(Duration::from_secs(600), 1);
        let t0 = Utc::now();
        tracker.record_visit("s1", &id("A"), t0).unwrap();
        tracker.record_visit("s2", &id("B"), t0).unwrap();

        assert_eq!(tracker.transition_count(&id("A"), &id("B")), 0);
    }

    #[test]
    fn test_repeat_visit_is_not_a_transition() {
        let tracker = NavigationTracker::new(Duration::from_secs(600), 1);
        let t0 = Utc::now();
        tracker.record_visit("s1", &id("A"), t0).unwrap();
        tracker.record_visit("s1", &id("A"), t0).unwrap();

        assert_eq!(tracker.transition_count(&id("A"), &id("A")), 0);
    }

    #[test]
    fn test_successors_are_bounded() {
        let tracker = NavigationTracker::new(Duration::from_secs(600), 1).with_max_successors(2);
        let t0 = Utc::now();

        // A→B twice, then A→C and A→D once each.
        for (session, target) in [("s1", "B"), ("s2", "B"), ("s3", "C"), ("s4", "D")] {
            tracker.record_visit(session, &id("A"), t0).unwrap();
            tracker.record_visit(session, &id(target), t0).unwrap();
        }

        assert_eq!(tracker.transition_count(&id("A"), &id("B")), 2);
        assert_eq!(tracker.transition_count(&id("A"), &id("C")), 0);
        assert_eq!(tracker.transition_count(&id("A"), &id("D")), 1);
    }

    #[test]
    fn test_sources_are_bounded() {
        let tracker = NavigationTracker::new(Duration::from_secs(600), 1).with_max_sources(2);
        let t0 = Utc::now();

        for (i, (from, to)) in [("A", "B"), ("C", "D"), ("E", "F")].iter().enumerate() {
            let at = t0 + chrono::Duration::seconds(i as i64);
            let session = format!("s{}", i);
            tracker.record_visit(&session, &id(from), at).unwrap();
            tracker.record_visit(&session, &id(to), at).unwrap();
        }

        assert_eq!(tracker.transition_count(&id("A"), &id("B")), 0);
        assert_eq!(tracker.transition_count(&id("C"), &id("D")), 1);
        assert_eq!(tracker.transition_count(&id("E"), &id("F")), 1);
    }

    #[test]
    fn test_prune_sessions() {
        let tracker = NavigationTracker::new(Duration::from_secs(60), 1);
        let t0 = Utc::now();
        tracker.record_visit("old", &id("A"), t0).unwrap();
        tracker
            .record_visit("new", &id("A"), t0 + chrono::Duration::seconds(90))
            .unwrap();

        let pruned = tracker
            .prune_sessions(t0 + chrono::Duration::seconds(100))
            .unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(tracker.tracked_sessions(), 1);
    }
}
