//! Connection lifecycle states.

use std::fmt;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Unknown,
    /// Client constructed, never connected.
    Inited,
    /// TCP connect in progress.
    Connecting,
    /// Socket up, handshake not finished.
    Connected,
    /// Handshake done, traffic flowing.
    Working,
    /// Tearing the session down.
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    /// Returns whether the lifecycle allows moving to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Unknown, Inited)
                | (Inited, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Working)
                | (Connected, Disconnected)
                | (Working, Disconnecting)
                | (Disconnecting, Disconnected)
                | (Disconnected, Connecting)
        )
    }

    /// Requests can be sent only while working.
    pub fn is_working(self) -> bool {
        self == ConnectionState::Working
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Unknown => "unknown",
            ConnectionState::Inited => "inited",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Working => "working",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Emitted on every state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEvent {
    pub state: ConnectionState,
    /// Why the transition happened, for failures and disconnects.
    pub reason: Option<String>,
}

impl NetworkEvent {
    pub fn new(state: ConnectionState, reason: Option<String>) -> Self {
        Self { state, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;
    use super::*;

    #[test]
    fn test_happy_path() {
        let path = [
            Unknown,
            Inited,
            Connecting,
            Connected,
            Working,
            Disconnecting,
            Disconnected,
            Connecting,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_failure_paths() {
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Disconnected));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Inited.can_transition_to(Working));
        assert!(!Connecting.can_transition_to(Working));
        assert!(!Working.can_transition_to(Connecting));
        assert!(!Working.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Working));
        assert!(!Working.can_transition_to(Working));
    }

    #[test]
    fn test_display() {
        assert_eq!(Working.to_string(), "working");
        assert_eq!(Disconnecting.to_string(), "disconnecting");
    }
}
