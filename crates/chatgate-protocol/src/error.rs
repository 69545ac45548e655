//! Error types for the protocol layer.

/// Errors that can occur while encoding or decoding frames.
///
/// When you see a `ProtocolError` the problem is in serialization or in
/// the shape of a frame, never in networking or authentication.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed.
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed JSON, missing fields, or an
    /// unknown message `type`.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),
}
