use std::fmt;

// NOTE: Idle -> Negotiating -> Established <-> Renegotiating -> ShutdownSent -> Closed, with
// Error reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    Established,
    Renegotiating,
    ShutdownSent,
    Closed,
    Error,
}

impl SessionState {
    /// States in which encrypted records may still arrive.
    pub fn is_readable(self) -> bool {
        matches!(self, Self::Established | Self::Renegotiating | Self::ShutdownSent)
    }

    pub fn is_established(self) -> bool {
        matches!(self, Self::Established | Self::Renegotiating)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::Established => "established",
            Self::Renegotiating => "renegotiating",
            Self::ShutdownSent => "shutdown sent",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}
