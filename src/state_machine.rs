use std::fmt;

/// Connection state of the session socket. Owned by the session manager;
/// everyone else only reads a mirror of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Conversational state derived from service events. Only used for gating
/// and logging, never for correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceState {
    #[default]
    Idle,
    Recording,
    Processing,
    Speaking,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

impl fmt::Display for VoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VoiceState::Idle => "idle",
            VoiceState::Recording => "recording",
            VoiceState::Processing => "processing",
            VoiceState::Speaking => "speaking",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_states() {
        assert_eq!(SessionState::default(), SessionState::Disconnected);
        assert_eq!(VoiceState::default(), VoiceState::Idle);
    }

    #[test]
    fn display_names() {
        assert_eq!(SessionState::Connecting.to_string(), "connecting");
        assert_eq!(VoiceState::Speaking.to_string(), "speaking");
    }
}
