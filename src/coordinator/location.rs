//! Tablet location state
//!
//! The hosting state is a tagged variant, so a tablet can never have both a
//! current and a future server. `last` is tracked next to it and only the
//! state machine, under the mode policy, ever moves it.

use crate::common::ServerId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationState {
    /// Never hosted, or lost its host without being taken offline.
    #[default]
    Unassigned,
    /// A server was chosen but has not confirmed ownership yet.
    Assigning { target: ServerId },
    /// Served by `server`.
    Hosted { server: ServerId },
    /// Deliberately taken offline after being hosted.
    Offline,
}

impl LocationState {
    pub fn current(&self) -> Option<&ServerId> {
        match self {
            LocationState::Hosted { server } => Some(server),
            _ => None,
        }
    }

    pub fn future(&self) -> Option<&ServerId> {
        match self {
            LocationState::Assigning { target } => Some(target),
            _ => None,
        }
    }

    pub fn is_hosted(&self) -> bool {
        matches!(self, LocationState::Hosted { .. })
    }

    /// Neither hosted nor being assigned.
    pub fn is_unhosted(&self) -> bool {
        matches!(self, LocationState::Unassigned | LocationState::Offline)
    }

    /// Server this state refers to, if any.
    pub fn server(&self) -> Option<&ServerId> {
        self.current().or_else(|| self.future())
    }
}

impl fmt::Display for LocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationState::Unassigned => write!(f, "unassigned"),
            LocationState::Assigning { target } => write!(f, "assigning({})", target),
            LocationState::Hosted { server } => write!(f, "hosted({})", server),
            LocationState::Offline => write!(f, "offline"),
        }
    }
}

/// Location of one tablet: hosting state plus the last known host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletLocation {
    pub state: LocationState,
    pub last: Option<ServerId>,
}

impl TabletLocation {
    pub fn new(state: LocationState, last: Option<ServerId>) -> Self {
        Self { state, last }
    }

    pub fn current(&self) -> Option<&ServerId> {
        self.state.current()
    }

    pub fn future(&self) -> Option<&ServerId> {
        self.state.future()
    }

    pub fn last(&self) -> Option<&ServerId> {
        self.last.as_ref()
    }

    pub fn snapshot(&self) -> LocationSnapshot {
        LocationSnapshot {
            current: self.current().cloned(),
            future: self.future().cloned(),
            last: self.last.clone(),
        }
    }
}

/// Flat `{current, future, last}` view returned by queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationSnapshot {
    pub current: Option<ServerId>,
    pub future: Option<ServerId>,
    pub last: Option<ServerId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_and_future_exclusive() {
        let s = ServerId::new("ts1");
        let states = [
            LocationState::Unassigned,
            LocationState::Assigning { target: s.clone() },
            LocationState::Hosted { server: s.clone() },
            LocationState::Offline,
        ];
        for state in states {
            assert!(!(state.current().is_some() && state.future().is_some()));
        }
    }

    #[test]
    fn test_snapshot() {
        let s = ServerId::new("ts1");
        let location = TabletLocation::new(
            LocationState::Hosted { server: s.clone() },
            Some(ServerId::new("ts0")),
        );
        let snapshot = location.snapshot();
        assert_eq!(snapshot.current, Some(s));
        assert_eq!(snapshot.future, None);
        assert_eq!(snapshot.last, Some(ServerId::new("ts0")));

        let offline = TabletLocation::new(LocationState::Offline, Some(ServerId::new("ts0")));
        assert_eq!(offline.snapshot().current, None);
        assert!(offline.state.is_unhosted());
    }
}
