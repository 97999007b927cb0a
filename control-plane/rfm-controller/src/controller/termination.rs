//! Annotation-encoded graceful-termination protocol.
//!
//! Agents must finish unregistering from GitHub before their pod is
//! destroyed, but the owner objects cannot carry arbitrary spec fields, so
//! the protocol is tracked through three timestamp annotations written
//! exactly once each. The phase ladder is explicit here so illegal
//! transitions are a typed error instead of an ad-hoc string check.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

pub const ANNOTATION_UNREGISTRATION_REQUEST: &str =
    "rfm.io/unregistration-request-timestamp";
pub const ANNOTATION_UNREGISTRATION_START: &str =
    "rfm.io/unregistration-start-timestamp";
pub const ANNOTATION_UNREGISTRATION_COMPLETE: &str =
    "rfm.io/unregistration-complete-timestamp";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TerminationPhase {
    None,
    Requested,
    Started,
    Complete,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("illegal termination transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: TerminationPhase,
    pub to: TerminationPhase,
}

impl TerminationPhase {
    /// Highest phase whose timestamp annotation is present.
    pub fn of(annotations: &BTreeMap<String, String>) -> Self {
        if annotations.contains_key(ANNOTATION_UNREGISTRATION_COMPLETE) {
            TerminationPhase::Complete
        } else if annotations.contains_key(ANNOTATION_UNREGISTRATION_START) {
            TerminationPhase::Started
        } else if annotations.contains_key(ANNOTATION_UNREGISTRATION_REQUEST)
        {
            TerminationPhase::Requested
        } else {
            TerminationPhase::None
        }
    }

    pub fn annotation_key(self) -> Option<&'static str> {
        match self {
            TerminationPhase::None => None,
            TerminationPhase::Requested => {
                Some(ANNOTATION_UNREGISTRATION_REQUEST)
            }
            TerminationPhase::Started => {
                Some(ANNOTATION_UNREGISTRATION_START)
            }
            TerminationPhase::Complete => {
                Some(ANNOTATION_UNREGISTRATION_COMPLETE)
            }
        }
    }

    fn allows(self, next: TerminationPhase) -> bool {
        matches!(
            (self, next),
            (TerminationPhase::None, TerminationPhase::Requested)
                | (TerminationPhase::Requested, TerminationPhase::Started)
                | (TerminationPhase::Started, TerminationPhase::Complete)
                // Owner fast-path: all pods finished before any worker
                // started unregistering.
                | (TerminationPhase::Requested, TerminationPhase::Complete)
        )
    }
}

/// Outcome of attempting a transition against the currently stored
/// annotations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Write this annotation to advance the phase.
    Advance(&'static str, String),
    /// The phase is already at or past the requested one; idempotency race,
    /// caller logs a warning and continues.
    AlreadyDone,
}

/// Evaluate the ladder against an already-decoded phase (snapshots keep
/// the phase, not the raw annotations).
pub fn transition_from(
    current: TerminationPhase,
    next: TerminationPhase,
    now: DateTime<Utc>,
) -> Result<Transition, IllegalTransition> {
    if current >= next {
        return Ok(Transition::AlreadyDone);
    }
    if !current.allows(next) {
        return Err(IllegalTransition {
            from: current,
            to: next,
        });
    }
    let key = next
        .annotation_key()
        .ok_or(IllegalTransition {
            from: current,
            to: next,
        })?;
    Ok(Transition::Advance(key, now.to_rfc3339()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotated(keys: &[&str]) -> BTreeMap<String, String> {
        keys.iter()
            .map(|k| (k.to_string(), Utc::now().to_rfc3339()))
            .collect()
    }

    #[test]
    fn phase_derivation_prefers_highest() {
        assert_eq!(
            TerminationPhase::of(&annotated(&[])),
            TerminationPhase::None
        );
        assert_eq!(
            TerminationPhase::of(&annotated(&[
                ANNOTATION_UNREGISTRATION_REQUEST
            ])),
            TerminationPhase::Requested
        );
        assert_eq!(
            TerminationPhase::of(&annotated(&[
                ANNOTATION_UNREGISTRATION_REQUEST,
                ANNOTATION_UNREGISTRATION_START,
                ANNOTATION_UNREGISTRATION_COMPLETE,
            ])),
            TerminationPhase::Complete
        );
    }

    #[test]
    fn legal_ladder_advances() {
        let now = Utc::now();
        let t = transition_from(
            TerminationPhase::None,
            TerminationPhase::Requested,
            now,
        )
        .unwrap();
        assert!(matches!(
            t,
            Transition::Advance(ANNOTATION_UNREGISTRATION_REQUEST, _)
        ));

        let t = transition_from(
            TerminationPhase::Requested,
            TerminationPhase::Started,
            now,
        )
        .unwrap();
        assert!(matches!(
            t,
            Transition::Advance(ANNOTATION_UNREGISTRATION_START, _)
        ));
    }

    #[test]
    fn requested_may_fast_path_to_complete() {
        let t = transition_from(
            TerminationPhase::Requested,
            TerminationPhase::Complete,
            Utc::now(),
        )
        .unwrap();
        assert!(matches!(
            t,
            Transition::Advance(ANNOTATION_UNREGISTRATION_COMPLETE, _)
        ));
    }

    #[test]
    fn skipping_request_is_illegal() {
        let err = transition_from(
            TerminationPhase::None,
            TerminationPhase::Complete,
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err.from, TerminationPhase::None);
        assert_eq!(err.to, TerminationPhase::Complete);
    }

    #[test]
    fn repeat_writes_are_idempotent() {
        let t = transition_from(
            TerminationPhase::Requested,
            TerminationPhase::Requested,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(t, Transition::AlreadyDone);
    }
}
