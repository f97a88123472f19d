use thiserror::Error;

/// Protocol-level error taxonomy.
///
/// The engine maps each variant onto a session outcome: handshake and key
/// agreement failures abort the attempt, a single decryption failure is
/// non-fatal to the read loop, stream errors tear the session down and
/// trigger recovery, and a rejection is fatal with no recovery.
#[derive(Error, Debug)]
pub enum Error {
    /// Peer public key material was malformed, or the exchange produced a
    /// degenerate shared secret.
    #[error("key agreement failed: {0}")]
    KeyAgreement(String),

    /// A received blob could not be decrypted with the session key.
    ///
    /// Deliberately carries no detail: this is the expected signal that a
    /// blob was not an encrypted application frame.
    #[error("decryption failed")]
    Decryption,

    /// The key exchange did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A file transfer was cut short.
    #[error("file transfer failed: {0}")]
    Transfer(String),

    /// The stream closed or errored while the session was active.
    #[error("stream error: {0}")]
    Stream(String),

    /// The pairing was rejected locally during verification.
    #[error("verification rejected")]
    RejectedLocally,

    /// The pairing was rejected by the peer during verification.
    #[error("verification rejected by peer")]
    RejectedByPeer,
}

/// Result type alias using the nearchat error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Stream(e.to_string())
    }
}
