use chrono::Duration;
use ragno_common::types::ErrorKind;

/// Scheduling state of a queued node, derived from its last dial outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialState {
    /// Never attempted.
    Zero,
    /// Last attempt succeeded.
    Positive,
    /// Transient failure, worth retrying soon.
    NegativeWithHope,
    /// Likely-permanent failure, retried on a long leash.
    NegativeWithoutHope,
}

impl DialState {
    /// How long to wait before the next dial. No jitter: schedules must be
    /// exactly `base_time + delay`.
    pub fn delay(&self) -> Duration {
        match self {
            DialState::Zero => Duration::zero(),
            DialState::Positive => Duration::minutes(10),
            DialState::NegativeWithHope => Duration::minutes(3),
            DialState::NegativeWithoutHope => Duration::minutes(20),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DialState::Zero => "zero",
            DialState::Positive => "positive",
            DialState::NegativeWithHope => "negative-with-hope",
            DialState::NegativeWithoutHope => "negative-without-hope",
        }
    }

    /// The state a dial outcome maps to.
    pub fn from_error(kind: ErrorKind) -> DialState {
        match kind {
            ErrorKind::None => DialState::Positive,
            ErrorKind::Eof
            | ErrorKind::DisconnectRequested
            | ErrorKind::RlpDecode
            | ErrorKind::BadHandshake
            | ErrorKind::BadHandshake2
            | ErrorKind::BadHandshakeDisconnect
            | ErrorKind::SnappyCorruptedInput
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::TooManyPeers => DialState::NegativeWithHope,
            ErrorKind::Timeout
            | ErrorKind::IoTimeout
            | ErrorKind::NoRouteToHost
            | ErrorKind::UselessPeer
            | ErrorKind::ProtocolNegotiation => DialState::NegativeWithoutHope,
            ErrorKind::Unknown => DialState::NegativeWithHope,
        }
    }
}

impl std::fmt::Display for DialState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_keep_hope() {
        for kind in [
            ErrorKind::ConnectionRefused,
            ErrorKind::ConnectionReset,
            ErrorKind::TooManyPeers,
            ErrorKind::Eof,
            ErrorKind::Unknown,
        ] {
            assert_eq!(DialState::from_error(kind), DialState::NegativeWithHope);
        }
    }

    #[test]
    fn permanent_errors_lose_hope() {
        for kind in [
            ErrorKind::Timeout,
            ErrorKind::IoTimeout,
            ErrorKind::NoRouteToHost,
            ErrorKind::UselessPeer,
            ErrorKind::ProtocolNegotiation,
        ] {
            assert_eq!(DialState::from_error(kind), DialState::NegativeWithoutHope);
        }
    }

    #[test]
    fn delays_match_the_schedule() {
        assert_eq!(DialState::Zero.delay(), Duration::zero());
        assert_eq!(DialState::Positive.delay(), Duration::minutes(10));
        assert_eq!(DialState::NegativeWithHope.delay(), Duration::minutes(3));
        assert_eq!(DialState::NegativeWithoutHope.delay(), Duration::minutes(20));
    }
}
