//! Session lifecycle state management

use std::time::Instant;

/// Per-session lifecycle state machine
///
/// `Created → Initialized → Started ⇄ Stopped → Unregistered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered, backend not initialized yet
    Created,

    /// Backend initialized for this session
    Initialized,

    /// Accepting frame sets
    Started {
        /// When the session was started
        started_at: Instant,
    },

    /// Not accepting frame sets, can be started again
    Stopped,

    /// Removed from the registry, terminal
    Unregistered,
}

impl SessionState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &SessionState) -> bool {
        use SessionState::*;

        match (self, target) {
            // From Created
            (Created, Initialized) => true,

            // From Initialized
            (Initialized, Started { .. }) => true,

            // From Started
            (Started { .. }, Stopped) => true,

            // From Stopped
            (Stopped, Initialized) => true,
            (Stopped, Started { .. }) => true,

            // Any live session can be unregistered
            (Unregistered, _) => false,
            (_, Unregistered) => true,

            // Self-transitions
            (a, b) if a.description() == b.description() => true,

            // All other transitions invalid
            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            SessionState::Created => "Created",
            SessionState::Initialized => "Initialized",
            SessionState::Started { .. } => "Started",
            SessionState::Stopped => "Stopped",
            SessionState::Unregistered => "Unregistered",
        }
    }

    /// Check if the session is accepting frame sets
    pub fn is_started(&self) -> bool {
        matches!(self, SessionState::Started { .. })
    }

    /// Check if the session is stopped
    pub fn is_stopped(&self) -> bool {
        matches!(self, SessionState::Stopped)
    }

    /// Get the duration since the session started (if started)
    pub fn running_duration(&self) -> Option<std::time::Duration> {
        if let SessionState::Started { started_at } = self {
            Some(started_at.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> SessionState {
        SessionState::Started {
            started_at: Instant::now(),
        }
    }

    #[test]
    fn test_valid_transitions() {
        use SessionState::*;

        assert!(Created.can_transition_to(&Initialized));
        assert!(Initialized.can_transition_to(&started()));
        assert!(started().can_transition_to(&Stopped));
        assert!(Stopped.can_transition_to(&started()));
        assert!(Stopped.can_transition_to(&Initialized));
        assert!(Created.can_transition_to(&Unregistered));
        assert!(started().can_transition_to(&Unregistered));

        // Self-transitions
        assert!(started().can_transition_to(&started()));
        assert!(Stopped.can_transition_to(&Stopped));
    }

    #[test]
    fn test_invalid_transitions() {
        use SessionState::*;

        assert!(!Created.can_transition_to(&started())); // Must go through Initialized
        assert!(!Created.can_transition_to(&Stopped));
        assert!(!Initialized.can_transition_to(&Stopped));
        assert!(!started().can_transition_to(&Initialized)); // Must stop first
        assert!(!Unregistered.can_transition_to(&Created));
        assert!(!Unregistered.can_transition_to(&Unregistered));
    }

    #[test]
    fn test_state_checks() {
        let running = started();
        assert!(running.is_started());
        assert!(!running.is_stopped());
        assert!(running.running_duration().is_some());

        assert!(SessionState::Stopped.is_stopped());
        assert!(SessionState::Stopped.running_duration().is_none());
        assert_eq!(SessionState::Initialized.to_string(), "Initialized");
    }
}
