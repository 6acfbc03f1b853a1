//! Crypto session: key exchange, authenticated encryption, identity pinning.
//!
//! Primitives: X25519 ephemeral-ephemeral agreement authenticated by an
//! Ed25519 identity signature, AES-128-GCM payload encryption, HKDF-SHA256
//! key derivation. See [`handshake`] for the four-message protocol and
//! [`CryptoSession`] for the frame format.

mod handshake;
mod known_keys;
mod session;

pub use handshake::{
    CentralHandshake, HandshakeReply, PeripheralHandshake, EPHEMERAL_KEY_LEN, IDENTITY_KEY_LEN,
    PEER_KEYS_LEN, SIGNATURE_LEN,
};
pub use known_keys::KnownKeys;
pub use session::{CryptoSession, COUNTER_LEN, ENCRYPTED_OVERHEAD, KEY_LEN, NONCE_SALT_LEN, TAG_LEN};
