//! Client lifecycle phases

use std::fmt;

/// Where the client is in its registration sequence.
///
/// Phases only move forward; any failure before [`Phase::Active`] goes
/// straight to [`Phase::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Disconnected,
    Authenticating,
    Connected,
    NegotiatingAddress,
    Listening,
    Registering,
    Active,
    Unregistering,
    Closed,
}

impl Phase {
    /// Whether the tunnel is serving forwarded connections
    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Active)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Disconnected => "disconnected",
            Phase::Authenticating => "authenticating",
            Phase::Connected => "connected",
            Phase::NegotiatingAddress => "negotiating address",
            Phase::Listening => "listening",
            Phase::Registering => "registering",
            Phase::Active => "active",
            Phase::Unregistering => "unregistering",
            Phase::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_are_ordered() {
        assert!(Phase::Disconnected < Phase::Authenticating);
        assert!(Phase::Registering < Phase::Active);
        assert!(Phase::Active < Phase::Unregistering);
        assert!(Phase::Unregistering < Phase::Closed);
        assert!(Phase::Active.is_active());
        assert!(!Phase::Listening.is_active());
    }
}
