//! Trigger — a state transition on one die attribute that a host can react to.

use serde::{Deserialize, Serialize};

use crate::die::{ConnectionState, DieSnapshot, RollPhase};

/// Describes which transition of a die should fire.
///
/// A trigger only fires when the watched attribute actually changed. The
/// optional `from` / `to` filters narrow it to specific transitions; a `from`
/// filter never matches the very first observed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DieTrigger {
    /// The face the die rests on changed.
    Face {
        from: Option<Option<u16>>,
        to: Option<Option<u16>>,
    },
    /// The roll phase changed.
    Roll {
        from: Option<RollPhase>,
        to: Option<RollPhase>,
    },
    /// The connection state changed.
    Connection {
        from: Option<ConnectionState>,
        to: Option<ConnectionState>,
    },
}

impl DieTrigger {
    /// Fire on any face change.
    #[must_use]
    pub fn any_face() -> Self {
        Self::Face {
            from: None,
            to: None,
        }
    }

    /// Fire when the die comes to rest on `face`.
    #[must_use]
    pub fn face_becomes(face: u16) -> Self {
        Self::Face {
            from: None,
            to: Some(Some(face)),
        }
    }

    /// Fire on the roll transition `from` → `to` (either may be a wildcard).
    #[must_use]
    pub fn roll(from: Option<RollPhase>, to: Option<RollPhase>) -> Self {
        Self::Roll { from, to }
    }

    /// Fire on the connection transition `from` → `to` (either may be a wildcard).
    #[must_use]
    pub fn connection(from: Option<ConnectionState>, to: Option<ConnectionState>) -> Self {
        Self::Connection { from, to }
    }

    /// Check whether the transition `previous` → `current` matches.
    ///
    /// `previous` is `None` for the first snapshot an observer sees.
    #[must_use]
    pub fn matches(&self, previous: Option<&DieSnapshot>, current: &DieSnapshot) -> bool {
        match self {
            Self::Face { from, to } => transition_matches(
                previous.map(|s| s.face),
                current.face,
                from.as_ref(),
                to.as_ref(),
            ),
            Self::Roll { from, to } => transition_matches(
                previous.map(|s| s.roll),
                current.roll,
                from.as_ref(),
                to.as_ref(),
            ),
            Self::Connection { from, to } => transition_matches(
                previous.map(|s| s.connection),
                current.connection,
                from.as_ref(),
                to.as_ref(),
            ),
        }
    }
}

fn transition_matches<T: PartialEq>(
    old: Option<T>,
    new: T,
    from: Option<&T>,
    to: Option<&T>,
) -> bool {
    if old.as_ref() == Some(&new) {
        return false;
    }
    if from.is_some_and(|expected| old.as_ref() != Some(expected)) {
        return false;
    }
    to.is_none_or(|expected| &new == expected)
}

impl std::fmt::Display for DieTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Face { .. } => f.write_str("face"),
            Self::Roll { .. } => f.write_str("roll"),
            Self::Connection { .. } => f.write_str("connection"),
        }
    }
}
