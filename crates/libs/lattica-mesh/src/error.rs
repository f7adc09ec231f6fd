use core::fmt;

/// Error taxonomy for the mesh core.
///
/// Integrity failures (`AuthenticationFailed`, `ProofInvalid`) never travel
/// back to the peer that caused them; the offending packet is dropped and at
/// most a rate-limited log line is emitted. Timeouts and configuration
/// errors are surfaced to the caller or the owning callback exactly once.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum MeshError {
    /// HMAC or signature mismatch, or ratchets enforced and none matched.
    AuthenticationFailed,
    /// A link handshake proof did not verify.
    ProofInvalid,
    /// No link proof arrived within the per-hop establishment budget.
    EstablishmentTimeout,
    /// A link went silent past the keepalive window.
    InactivityTimeout,
    /// A link request/response exchange timed out.
    RequestTimeout,
    /// Programmer error surfaced at construction time (dots in names,
    /// missing identity or group key, wrong direction).
    ConfigurationError,
    /// `inbound`/`outbound` called on a stopped transport.
    TransportNotStarted,
    /// An interface driver could not be started or has detached.
    InterfaceUnavailable,
    /// A frame or packet failed structural validation.
    MalformedPacket,
    /// A fixed-capacity buffer could not hold the requested write.
    BufferExhausted,
    /// Key material had the wrong size or failed to parse.
    InvalidKey,
    /// Persistent state could not be read or written.
    StorageError,
    /// A socket or channel operation failed.
    ConnectionError,
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MeshError::AuthenticationFailed => "authentication failed",
            MeshError::ProofInvalid => "link proof invalid",
            MeshError::EstablishmentTimeout => "link establishment timed out",
            MeshError::InactivityTimeout => "link inactivity timeout",
            MeshError::RequestTimeout => "request timed out",
            MeshError::ConfigurationError => "invalid configuration",
            MeshError::TransportNotStarted => "transport not started",
            MeshError::InterfaceUnavailable => "interface unavailable",
            MeshError::MalformedPacket => "malformed packet",
            MeshError::BufferExhausted => "buffer exhausted",
            MeshError::InvalidKey => "invalid key material",
            MeshError::StorageError => "storage error",
            MeshError::ConnectionError => "connection error",
        };
        write!(f, "{text}")
    }
}

impl std::error::Error for MeshError {}
