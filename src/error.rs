//! Error types for blerpc.

use thiserror::Error;

/// Main error type for all blerpc operations.
#[derive(Debug, Error)]
pub enum BlerpcError {
    // ── Codec ────────────────────────────────────────────────────────────
    /// A container frame that cannot be parsed (truncated, bad type bits,
    /// unknown control command).
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// Output buffer too small for the serialized frame.
    #[error("buffer too small: need {need}, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    /// Command name empty, longer than 16 bytes, or not valid UTF-8.
    #[error("invalid command name: {0}")]
    InvalidCommandName(&'static str),

    /// SUBSEQUENT container with an out-of-order sequence number.
    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u8, got: u8 },

    /// FIRST container while a reassembly was already active.
    #[error("unexpected FIRST container during active reassembly")]
    UnexpectedFirst,

    /// SUBSEQUENT container with no reassembly active.
    #[error("unexpected SUBSEQUENT container with no reassembly active")]
    UnexpectedSubsequent,

    /// SUBSEQUENT container with a different transaction id than the FIRST.
    #[error("transaction id mismatch: expected {expected}, got {got}")]
    TidMismatch { expected: u8, got: u8 },

    /// Payload exceeds the announced total length or the assembler cap.
    #[error("payload overflow: {got} bytes exceeds limit {limit}")]
    Overflow { got: usize, limit: usize },

    // ── Transport ────────────────────────────────────────────────────────
    /// Operation requires an open channel.
    #[error("not connected")]
    NotConnected,

    /// No notification arrived within the read timeout.
    #[error("timed out waiting for notification")]
    Timeout,

    /// Channel write failed permanently.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Channel write queue full; transient, the caller may retry.
    #[error("channel write buffer full")]
    WriteBufferFull,

    // ── Protocol ─────────────────────────────────────────────────────────
    /// Response command packet did not carry the RESPONSE type bit.
    #[error("expected a response command packet")]
    UnexpectedResponseType,

    /// Response named a different command than the request.
    #[error("command name mismatch: expected {expected:?}, got {got:?}")]
    CommandNameMismatch { expected: String, got: String },

    /// Request payload exceeds the peripheral's max_request_payload_size.
    #[error("request payload ({actual} bytes) exceeds peripheral limit ({limit} bytes)")]
    PayloadTooLarge { actual: usize, limit: usize },

    /// Peripheral reported the response exceeds max_response_payload_size.
    #[error("response exceeds peripheral's max_response_payload_size")]
    ResponseTooLarge,

    /// Peripheral reported it is busy with another request.
    #[error("peripheral busy")]
    Busy,

    // ── Crypto ───────────────────────────────────────────────────────────
    /// Key-exchange message out of order, wrong size, or failed validation.
    #[error("key exchange protocol violation: {0}")]
    KeyExchangeProtocolViolation(&'static str),

    /// Peripheral identity key does not match the pinned key.
    #[error("peripheral identity key mismatch")]
    IdentityMismatch,

    /// AEAD open failed (bad key, tampered ciphertext, truncated frame).
    #[error("decryption failed")]
    DecryptionFailed,

    /// Frame counter at or below the receive high-water mark.
    #[error("replay detected: counter {0}")]
    ReplayDetected(u32),

    /// Send counter space exhausted; the session must be re-established.
    #[error("nonce space exhausted")]
    NonceExhausted,

    /// Encryption required by policy but not offered or established.
    #[error("encryption required but not established")]
    EncryptionRequired,

    // ── Peripheral ───────────────────────────────────────────────────────
    /// CONTROL/ERROR code the central does not recognize.
    #[error("peripheral error: 0x{0:02x}")]
    Peripheral(u8),

    /// I/O error (known-keys store).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Known-keys store is not valid JSON.
    #[error("known-keys store corrupt: {0}")]
    KnownKeysCorrupt(#[from] serde_json::Error),
}

/// Result type alias using BlerpcError.
pub type Result<T> = std::result::Result<T, BlerpcError>;
