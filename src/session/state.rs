use serde::Serialize;

/// Lifecycle of the realtime channel.
///
/// `Idle → Connecting → Connected → {Error, Closed}`; an explicit reconnect
/// from `Error` or `Closed` goes back to `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Error,
    Closed,
}

impl ConnectionState {
    /// A channel is open or being opened.
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Closed)
                | (Connected, Error)
                | (Connected, Closed)
                | (Error, Connecting)
                | (Closed, Connecting)
        )
    }
}

/// Turn-level state shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    Idle,
    /// User audio is flowing.
    Listening,
    /// Waiting on the AI.
    Processing,
    /// AI audio is arriving.
    Speaking,
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;

    #[test]
    fn forward_transitions_only() {
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Closed));
        assert!(Connected.can_transition_to(Error));

        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Connected.can_transition_to(Idle));
        assert!(!Closed.can_transition_to(Connected));
        assert!(!Idle.can_transition_to(Connected));
    }

    #[test]
    fn reconnect_resets_to_connecting() {
        assert!(Error.can_transition_to(Connecting));
        assert!(Closed.can_transition_to(Connecting));
        assert!(!Error.can_transition_to(Closed));
    }

    #[test]
    fn active_states() {
        assert!(Connecting.is_active());
        assert!(Connected.is_active());
        assert!(!Idle.is_active());
        assert!(!Error.is_active());
        assert!(!Closed.is_active());
    }
}
