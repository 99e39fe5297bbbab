use tracing::warn;

/// Classified outcome of a dial, stored verbatim in the attempts table and
/// consumed by the dial-state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    None,
    Eof,
    DisconnectRequested,
    RlpDecode,
    BadHandshake,
    BadHandshake2,
    BadHandshakeDisconnect,
    SnappyCorruptedInput,
    ConnectionReset,
    ConnectionRefused,
    TooManyPeers,
    Timeout,
    IoTimeout,
    NoRouteToHost,
    UselessPeer,
    ProtocolNegotiation,
    Unknown,
}

/// Substring patterns checked in order; the first hit wins, which keeps the
/// classifier deterministic and total.
const PATTERNS: &[(ErrorKind, &[&str])] = &[
    (ErrorKind::TooManyPeers, &["too many peers"]),
    (ErrorKind::UselessPeer, &["useless peer"]),
    (
        ErrorKind::DisconnectRequested,
        &["disconnect requested", "client quitting"],
    ),
    (
        ErrorKind::BadHandshakeDisconnect,
        &["disconnect received during hello"],
    ),
    (ErrorKind::BadHandshake2, &["bad status handshake code: 2"]),
    (
        ErrorKind::BadHandshake,
        &["bad handshake", "cryptography error", "invalid frame mac"],
    ),
    (
        ErrorKind::ProtocolNegotiation,
        &["no matching capabilities", "incompatible p2p protocol"],
    ),
    (ErrorKind::SnappyCorruptedInput, &["corrupt input", "snappy"]),
    (ErrorKind::ConnectionRefused, &["connection refused"]),
    (ErrorKind::ConnectionReset, &["connection reset"]),
    (ErrorKind::NoRouteToHost, &["no route to host", "host unreachable"]),
    (ErrorKind::Timeout, &["connect timed out", "connection timed out"]),
    (
        ErrorKind::IoTimeout,
        &["i/o timed out", "deadline has elapsed", "timed out"],
    ),
    (ErrorKind::Eof, &["eof", "end of file", "stream closed"]),
    (ErrorKind::RlpDecode, &["rlp"]),
];

impl ErrorKind {
    /// Maps an error's display text to the matching kind. Every input maps
    /// to exactly one kind; unmatched strings are `Unknown`.
    pub fn classify(error: &str) -> Self {
        let lowered = error.to_lowercase();
        for (kind, patterns) in PATTERNS {
            if patterns.iter().any(|pattern| lowered.contains(pattern)) {
                return *kind;
            }
        }
        warn!(error, "unrecognized dial error");
        ErrorKind::Unknown
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::None => "none",
            ErrorKind::Eof => "eof",
            ErrorKind::DisconnectRequested => "disconnect_requested",
            ErrorKind::RlpDecode => "rlp_decode",
            ErrorKind::BadHandshake => "bad_handshake",
            ErrorKind::BadHandshake2 => "bad_handshake_code_2",
            ErrorKind::BadHandshakeDisconnect => "bad_handshake_disconnect",
            ErrorKind::SnappyCorruptedInput => "snappy_corrupted_input",
            ErrorKind::ConnectionReset => "connection_reset_by_peer",
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::TooManyPeers => "too_many_peers",
            ErrorKind::Timeout => "time_out",
            ErrorKind::IoTimeout => "io_timeout",
            ErrorKind::NoRouteToHost => "no_route_to_host",
            ErrorKind::UselessPeer => "useless_peer",
            ErrorKind::ProtocolNegotiation => "protocol_negotiation",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_matches_known_errors() {
        let cases = [
            ("connect: connection refused", ErrorKind::ConnectionRefused),
            ("connection reset by peer", ErrorKind::ConnectionReset),
            ("too many peers", ErrorKind::TooManyPeers),
            ("disconnect requested", ErrorKind::DisconnectRequested),
            ("useless peer", ErrorKind::UselessPeer),
            ("connect timed out", ErrorKind::Timeout),
            ("deadline has elapsed", ErrorKind::IoTimeout),
            ("no route to host", ErrorKind::NoRouteToHost),
            ("snappy: corrupt input", ErrorKind::SnappyCorruptedInput),
            ("unexpected EOF", ErrorKind::Eof),
            ("RLP decode error: Malformed data", ErrorKind::RlpDecode),
            ("bad handshake: invalid mac", ErrorKind::BadHandshake),
            ("no matching capabilities", ErrorKind::ProtocolNegotiation),
        ];
        for (input, expected) in cases {
            assert_eq!(ErrorKind::classify(input), expected, "input: {input}");
        }
    }

    #[test]
    fn classifier_is_total_and_deterministic() {
        for input in ["", "something else entirely", "splines unreticulated"] {
            assert_eq!(ErrorKind::classify(input), ErrorKind::Unknown);
            assert_eq!(ErrorKind::classify(input), ErrorKind::classify(input));
        }
    }

    #[test]
    fn timeout_kinds_are_distinct() {
        assert_eq!(
            ErrorKind::classify("tcp connect timed out"),
            ErrorKind::Timeout
        );
        assert_eq!(
            ErrorKind::classify("status read: deadline has elapsed"),
            ErrorKind::IoTimeout
        );
    }
}
