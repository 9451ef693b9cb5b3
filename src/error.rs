//! Error taxonomy for the wire codec, connection pool, and address grammar.

use thiserror::Error;

/// Errors produced while decoding the fixed wire header.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The header announced a body larger than the 1 MiB frame cap.
    #[error("frame body of {len} bytes exceeds the 1 MiB limit")]
    FrameTooLarge {
        /// Body length the header claimed.
        len: u32,
    },

    /// The opcode byte was outside the known range.
    #[error("unknown opcode {value:#04x}")]
    InvalidOpcode {
        /// The offending byte.
        value: u8,
    },

    /// The tag byte was outside the known range.
    #[error("unknown tag {value:#04x}")]
    InvalidTag {
        /// The offending byte.
        value: u8,
    },
}

/// Errors surfaced by the client pool and the server dispatcher.
#[derive(Debug, Error)]
pub enum NetError {
    /// The client is shutting down; no further writers or requests.
    #[error("client is closed")]
    Closed,

    /// A suspended operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The circuit breaker is open; connect attempts fail fast until a
    /// probe succeeds.
    #[error("circuit breaker tripped")]
    CircuitBreakerTripped,

    /// A response frame arrived for a nonce with no outstanding request.
    /// Fatal for the connection that carried it.
    #[error("unexpected response for nonce {nonce}")]
    UnexpectedResponse {
        /// The stale or forged nonce.
        nonce: u32,
    },

    /// The dial did not complete within the configured timeout.
    #[error("connect timed out")]
    ConnectTimeout,

    /// Malformed frame on the wire.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The node capability rejected a packet.
    #[error("packet handler failed: {0}")]
    Handler(anyhow::Error),

    /// Transport failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the textual address grammar.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AddrParseError {
    /// A bracketed IPv6 address was never closed.
    #[error("missing ']' after bracketed IPv6 address")]
    MissingEndBracket,

    /// A bracketed IPv6 address had no `:port` suffix.
    #[error("missing port after bracketed IPv6 address")]
    MissingPort,

    /// A `[` appeared somewhere other than the start of the address.
    #[error("unexpected '[' inside address")]
    UnexpectedLeftBracket,

    /// A `]` appeared without a matching `[`.
    #[error("unexpected ']' without matching '['")]
    UnexpectedRightBracket,

    /// An unbracketed host had colons that do not form a valid IPv6
    /// address, so the port suffix is ambiguous.
    #[error("too many ':' separators for an unbracketed address")]
    TooManyColons,

    /// The host is neither dotted IPv4 nor colon-separated IPv6.
    #[error("cannot tell whether the host is IPv4 or IPv6")]
    UnknownAddressProtocol,

    /// The port was not a decimal number in `0..=65535`.
    #[error("invalid port")]
    InvalidPort,

    /// The host octets did not parse.
    #[error("invalid host address")]
    InvalidHost,
}
