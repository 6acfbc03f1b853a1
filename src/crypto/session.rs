//! Authenticated-encryption session with replay protection.
//!
//! One session per connection, live between handshake completion and
//! disconnect. Each direction has its own AES-128-GCM key and 8-byte nonce
//! salt; the 96-bit nonce is `salt || counter_le_u32`. The encrypted frame
//! layout inside an assembled payload is:
//! ```text
//! counter_le_u32 || ciphertext || tag_16
//! ```
//! The counter prefix is also the lower 32 bits of the AEAD nonce, so a
//! tampered prefix fails tag verification.
//!
//! Key material is wrapped in [`zeroize::Zeroizing`] and scrubbed when the
//! session drops.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};
use zeroize::Zeroizing;

use crate::error::{BlerpcError, Result};

/// AES-128-GCM key length per direction.
pub const KEY_LEN: usize = 16;

/// Per-direction nonce salt length.
pub const NONCE_SALT_LEN: usize = 8;

/// AEAD tag length.
pub const TAG_LEN: usize = 16;

/// Counter prefix length on an encrypted frame.
pub const COUNTER_LEN: usize = 4;

/// Bytes added to a plaintext by [`CryptoSession::encrypt`].
pub const ENCRYPTED_OVERHEAD: usize = COUNTER_LEN + TAG_LEN;

/// Key and nonce salt for one direction.
pub(crate) struct DirectionKey {
    key: Zeroizing<[u8; KEY_LEN]>,
    salt: Zeroizing<[u8; NONCE_SALT_LEN]>,
}

impl DirectionKey {
    pub(crate) fn new(key: [u8; KEY_LEN], salt: [u8; NONCE_SALT_LEN]) -> Self {
        Self {
            key: Zeroizing::new(key),
            salt: Zeroizing::new(salt),
        }
    }

    fn aead_key(&self) -> LessSafeKey {
        let unbound =
            UnboundKey::new(&AES_128_GCM, &*self.key).expect("AES-128 key is 16 bytes");
        LessSafeKey::new(unbound)
    }

    fn nonce(&self, counter: u32) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[..NONCE_SALT_LEN].copy_from_slice(&*self.salt);
        bytes[NONCE_SALT_LEN..].copy_from_slice(&counter.to_le_bytes());
        Nonce::assume_unique_for_key(bytes)
    }
}

/// Live encryption context between one central and one peripheral.
///
/// `tx_key` on one peer is `rx_key` on the other. Methods take `&mut self`;
/// the owning session driver serializes both directions.
pub struct CryptoSession {
    tx: DirectionKey,
    rx: DirectionKey,
    tx_counter: u32,
    rx_high_water: u32,
    rx_primed: bool,
}

impl CryptoSession {
    pub(crate) fn new(tx: DirectionKey, rx: DirectionKey) -> Self {
        Self {
            tx,
            rx,
            tx_counter: 0,
            rx_high_water: 0,
            rx_primed: false,
        }
    }

    /// Frames encrypted so far (the next send counter).
    #[inline]
    pub fn tx_counter(&self) -> u32 {
        self.tx_counter
    }

    /// Highest frame counter accepted so far, if any frame was accepted.
    #[inline]
    pub fn rx_high_water(&self) -> Option<u32> {
        self.rx_primed.then_some(self.rx_high_water)
    }

    /// Encrypt a payload, returning `counter || ciphertext || tag`.
    ///
    /// Increments the send counter. When the counter space is exhausted the
    /// session refuses with [`BlerpcError::NonceExhausted`], forcing a
    /// reconnect.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.tx_counter == u32::MAX {
            return Err(BlerpcError::NonceExhausted);
        }
        let counter = self.tx_counter;

        let mut out = Vec::with_capacity(plaintext.len() + ENCRYPTED_OVERHEAD);
        out.extend_from_slice(&counter.to_le_bytes());
        out.extend_from_slice(plaintext);

        let tag = self
            .tx
            .aead_key()
            .seal_in_place_separate_tag(self.tx.nonce(counter), Aad::empty(), &mut out[COUNTER_LEN..])
            .map_err(|_| BlerpcError::MalformedFrame("aead seal failed"))?;
        out.extend_from_slice(tag.as_ref());

        self.tx_counter += 1;
        Ok(out)
    }

    /// Decrypt a `counter || ciphertext || tag` frame.
    ///
    /// Rejects frames whose counter is at or below the receive high-water
    /// mark before touching the ciphertext; the mark only advances after a
    /// successful tag check, so a failed decrypt leaves state unchanged.
    pub fn decrypt(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < ENCRYPTED_OVERHEAD {
            return Err(BlerpcError::DecryptionFailed);
        }
        let counter = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        if self.rx_primed && counter <= self.rx_high_water {
            return Err(BlerpcError::ReplayDetected(counter));
        }

        let mut buf = frame[COUNTER_LEN..].to_vec();
        let plaintext_len = {
            let opened = self
                .rx
                .aead_key()
                .open_in_place(self.rx.nonce(counter), Aad::empty(), &mut buf)
                .map_err(|_| BlerpcError::DecryptionFailed)?;
            opened.len()
        };
        buf.truncate(plaintext_len);

        self.rx_high_water = counter;
        self.rx_primed = true;
        Ok(buf)
    }
}

impl std::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSession")
            .field("tx_counter", &self.tx_counter)
            .field("rx_high_water", &self.rx_high_water)
            .field("rx_primed", &self.rx_primed)
            .finish_non_exhaustive()
    }
}
