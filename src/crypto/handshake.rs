//! Four-message key-exchange handshake (initiator = central).
//!
//! ```text
//! 1. C -> P  central ephemeral X25519 public key                  (32 bytes)
//! 2. P -> C  peripheral ephemeral (32) || Ed25519 identity (32)
//!            || signature over central_epk || peripheral_epk (64) (128 bytes)
//! 3. C -> P  AEAD confirmation: "client finished" under tx_key    (>= 16)
//! 4. P -> C  AEAD confirmation: "server finished" under tx_key    (>= 16)
//! ```
//!
//! Both state machines here are sans-IO: the session drivers wrap the
//! messages in CONTROL/KEY_EXCHANGE containers. Any message received out of
//! order, with the wrong size, or failing validation discards the pending
//! session and fails with `KeyExchangeProtocolViolation`.
//!
//! Session keys come from HKDF-SHA256 over the X25519 shared secret, salted
//! with both ephemerals. The confirmations go through the normal encrypt
//! path and consume counter 0 of each direction, so data frames start at
//! counter 1 and the replay floor is primed before the session goes live.

use hkdf::Hkdf;
use ring::agreement;
use ring::rand::SystemRandom;
use ring::signature::{self, KeyPair};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::session::{CryptoSession, DirectionKey, ENCRYPTED_OVERHEAD, KEY_LEN, NONCE_SALT_LEN};
use crate::error::{BlerpcError, Result};

/// X25519 public key length; also the size of handshake message 1.
pub const EPHEMERAL_KEY_LEN: usize = 32;

/// Ed25519 public key length.
pub const IDENTITY_KEY_LEN: usize = 32;

/// Ed25519 signature length.
pub const SIGNATURE_LEN: usize = 64;

/// Size of handshake message 2.
pub const PEER_KEYS_LEN: usize = EPHEMERAL_KEY_LEN + IDENTITY_KEY_LEN + SIGNATURE_LEN;

const CONFIRM_CENTRAL: &[u8] = b"blerpc client finished";
const CONFIRM_PERIPHERAL: &[u8] = b"blerpc server finished";
const HKDF_INFO: &[u8] = b"blerpc session v1";

fn violation(reason: &'static str) -> BlerpcError {
    BlerpcError::KeyExchangeProtocolViolation(reason)
}

/// Per-direction keys and salts derived from one handshake.
struct SessionSecrets {
    c2p_key: Zeroizing<[u8; KEY_LEN]>,
    p2c_key: Zeroizing<[u8; KEY_LEN]>,
    c2p_salt: Zeroizing<[u8; NONCE_SALT_LEN]>,
    p2c_salt: Zeroizing<[u8; NONCE_SALT_LEN]>,
}

impl SessionSecrets {
    /// HKDF-SHA256(salt = central_epk || peripheral_epk, ikm = shared secret)
    /// expanded to c2p key, p2c key, c2p salt, p2c salt.
    fn derive(
        shared: &[u8],
        central_epk: &[u8; EPHEMERAL_KEY_LEN],
        peripheral_epk: &[u8; EPHEMERAL_KEY_LEN],
    ) -> Self {
        let mut salt = [0u8; EPHEMERAL_KEY_LEN * 2];
        salt[..EPHEMERAL_KEY_LEN].copy_from_slice(central_epk);
        salt[EPHEMERAL_KEY_LEN..].copy_from_slice(peripheral_epk);

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
        let mut okm = Zeroizing::new([0u8; 2 * KEY_LEN + 2 * NONCE_SALT_LEN]);
        hk.expand(HKDF_INFO, &mut *okm)
            .expect("48-byte HKDF output is within the expand limit");

        let mut c2p_key = Zeroizing::new([0u8; KEY_LEN]);
        let mut p2c_key = Zeroizing::new([0u8; KEY_LEN]);
        let mut c2p_salt = Zeroizing::new([0u8; NONCE_SALT_LEN]);
        let mut p2c_salt = Zeroizing::new([0u8; NONCE_SALT_LEN]);
        c2p_key.copy_from_slice(&okm[0..16]);
        p2c_key.copy_from_slice(&okm[16..32]);
        c2p_salt.copy_from_slice(&okm[32..40]);
        p2c_salt.copy_from_slice(&okm[40..48]);

        Self {
            c2p_key,
            p2c_key,
            c2p_salt,
            p2c_salt,
        }
    }

    fn central_session(self) -> CryptoSession {
        CryptoSession::new(
            DirectionKey::new(*self.c2p_key, *self.c2p_salt),
            DirectionKey::new(*self.p2c_key, *self.p2c_salt),
        )
    }

    fn peripheral_session(self) -> CryptoSession {
        CryptoSession::new(
            DirectionKey::new(*self.p2c_key, *self.p2c_salt),
            DirectionKey::new(*self.c2p_key, *self.c2p_salt),
        )
    }
}

fn generate_ephemeral() -> Result<(agreement::EphemeralPrivateKey, [u8; EPHEMERAL_KEY_LEN])> {
    let rng = SystemRandom::new();
    let esk = agreement::EphemeralPrivateKey::generate(&agreement::X25519, &rng)
        .map_err(|_| violation("ephemeral key generation failed"))?;
    let epk_bytes = esk
        .compute_public_key()
        .map_err(|_| violation("ephemeral public key computation failed"))?;
    let mut epk = [0u8; EPHEMERAL_KEY_LEN];
    epk.copy_from_slice(epk_bytes.as_ref());
    Ok((esk, epk))
}

fn agree(
    esk: agreement::EphemeralPrivateKey,
    peer_epk: &[u8; EPHEMERAL_KEY_LEN],
    central_epk: &[u8; EPHEMERAL_KEY_LEN],
    peripheral_epk: &[u8; EPHEMERAL_KEY_LEN],
) -> Result<SessionSecrets> {
    let peer = agreement::UnparsedPublicKey::new(&agreement::X25519, peer_epk);
    agreement::agree_ephemeral(esk, &peer, |shared| {
        SessionSecrets::derive(shared, central_epk, peripheral_epk)
    })
    .map_err(|_| violation("x25519 agreement failed"))
}

enum CentralState {
    /// Message 1 sent, waiting for the peer's keys.
    Sent1 {
        esk: agreement::EphemeralPrivateKey,
        epk: [u8; EPHEMERAL_KEY_LEN],
    },
    /// Message 3 sent, waiting for the server confirmation.
    Sent3 { session: CryptoSession },
    /// Terminal: finished or failed.
    Done,
}

/// Central (initiator) side of the handshake.
pub struct CentralHandshake {
    state: CentralState,
}

impl CentralHandshake {
    /// Generate the ephemeral keypair and message 1 (the central ephemeral
    /// public key).
    pub fn new() -> Result<(Self, Vec<u8>)> {
        let (esk, epk) = generate_ephemeral()?;
        let msg1 = epk.to_vec();
        Ok((
            Self {
                state: CentralState::Sent1 { esk, epk },
            },
            msg1,
        ))
    }

    /// Process message 2 and produce message 3 (the client confirmation).
    ///
    /// `verify_identity` receives the peripheral's Ed25519 public key after
    /// its signature over both ephemerals checked out; return an error
    /// (typically `IdentityMismatch` from a TOFU store) to abort before any
    /// confirmation is sent.
    pub fn respond(
        &mut self,
        msg2: &[u8],
        verify_identity: impl FnOnce(&[u8; IDENTITY_KEY_LEN]) -> Result<()>,
    ) -> Result<Vec<u8>> {
        let CentralState::Sent1 { esk, epk } =
            std::mem::replace(&mut self.state, CentralState::Done)
        else {
            return Err(violation("peer keys received out of order"));
        };

        if msg2.len() != PEER_KEYS_LEN {
            return Err(violation("peer keys message has wrong size"));
        }
        let mut peripheral_epk = [0u8; EPHEMERAL_KEY_LEN];
        peripheral_epk.copy_from_slice(&msg2[..EPHEMERAL_KEY_LEN]);
        let mut identity = [0u8; IDENTITY_KEY_LEN];
        identity.copy_from_slice(&msg2[EPHEMERAL_KEY_LEN..EPHEMERAL_KEY_LEN + IDENTITY_KEY_LEN]);
        let sig = &msg2[EPHEMERAL_KEY_LEN + IDENTITY_KEY_LEN..];

        let mut signed = [0u8; EPHEMERAL_KEY_LEN * 2];
        signed[..EPHEMERAL_KEY_LEN].copy_from_slice(&epk);
        signed[EPHEMERAL_KEY_LEN..].copy_from_slice(&peripheral_epk);
        signature::UnparsedPublicKey::new(&signature::ED25519, &identity)
            .verify(&signed, sig)
            .map_err(|_| violation("identity signature invalid"))?;

        verify_identity(&identity)?;

        let mut session = agree(esk, &peripheral_epk, &epk, &peripheral_epk)?.central_session();
        let msg3 = session.encrypt(CONFIRM_CENTRAL)?;
        self.state = CentralState::Sent3 { session };
        Ok(msg3)
    }

    /// Verify message 4 and return the live session.
    pub fn finish(mut self, msg4: &[u8]) -> Result<CryptoSession> {
        let CentralState::Sent3 { mut session } =
            std::mem::replace(&mut self.state, CentralState::Done)
        else {
            return Err(violation("server confirmation received out of order"));
        };

        if msg4.len() < ENCRYPTED_OVERHEAD {
            return Err(violation("server confirmation too short"));
        }
        let plaintext = session
            .decrypt(msg4)
            .map_err(|_| violation("server confirmation does not verify"))?;
        if plaintext != CONFIRM_PERIPHERAL {
            return Err(violation("server confirmation label mismatch"));
        }
        Ok(session)
    }
}

enum PeripheralState {
    /// Waiting for message 1.
    Idle,
    /// Message 2 sent, waiting for the client confirmation.
    Sent2 { session: CryptoSession },
}

/// Reply produced by one peripheral handshake step.
pub struct HandshakeReply {
    /// Serialized handshake message to send back (message 2 or 4).
    pub response: Vec<u8>,
    /// The live session, present once the client confirmation verified.
    pub session: Option<CryptoSession>,
}

/// Peripheral (responder) side of the handshake.
///
/// The identity keypair persists across connections; the ephemeral keypair
/// and pending session are per-handshake and discarded on any violation.
pub struct PeripheralHandshake {
    identity: signature::Ed25519KeyPair,
    identity_pub: [u8; IDENTITY_KEY_LEN],
    state: PeripheralState,
}

impl PeripheralHandshake {
    /// Build from a 32-byte Ed25519 seed.
    pub fn new(identity_seed: &[u8; 32]) -> Result<Self> {
        let identity = signature::Ed25519KeyPair::from_seed_unchecked(identity_seed)
            .map_err(|_| violation("invalid identity key seed"))?;
        let mut identity_pub = [0u8; IDENTITY_KEY_LEN];
        identity_pub.copy_from_slice(identity.public_key().as_ref());
        Ok(Self {
            identity,
            identity_pub,
            state: PeripheralState::Idle,
        })
    }

    /// The Ed25519 public key centrals pin via TOFU.
    #[inline]
    pub fn identity_public_key(&self) -> &[u8; IDENTITY_KEY_LEN] {
        &self.identity_pub
    }

    /// Discard any half-completed handshake (connection teardown).
    pub fn reset(&mut self) {
        self.state = PeripheralState::Idle;
    }

    /// Process one KEY_EXCHANGE payload from the central.
    ///
    /// Returns the reply to notify back; `session` is populated when the
    /// handshake completed. On error the pending state is discarded.
    pub fn handle(&mut self, payload: &[u8]) -> Result<HandshakeReply> {
        match std::mem::replace(&mut self.state, PeripheralState::Idle) {
            PeripheralState::Idle => self.handle_initial(payload),
            PeripheralState::Sent2 { session } => self.handle_confirmation(payload, session),
        }
    }

    fn handle_initial(&mut self, payload: &[u8]) -> Result<HandshakeReply> {
        if payload.len() != EPHEMERAL_KEY_LEN {
            return Err(violation("initial message has wrong size"));
        }
        let mut central_epk = [0u8; EPHEMERAL_KEY_LEN];
        central_epk.copy_from_slice(payload);

        let (esk, epk) = generate_ephemeral()?;

        let mut signed = [0u8; EPHEMERAL_KEY_LEN * 2];
        signed[..EPHEMERAL_KEY_LEN].copy_from_slice(&central_epk);
        signed[EPHEMERAL_KEY_LEN..].copy_from_slice(&epk);
        let sig = self.identity.sign(&signed);

        let session = agree(esk, &central_epk, &central_epk, &epk)?.peripheral_session();

        let mut response = Vec::with_capacity(PEER_KEYS_LEN);
        response.extend_from_slice(&epk);
        response.extend_from_slice(&self.identity_pub);
        response.extend_from_slice(sig.as_ref());

        self.state = PeripheralState::Sent2 { session };
        Ok(HandshakeReply {
            response,
            session: None,
        })
    }

    fn handle_confirmation(
        &mut self,
        payload: &[u8],
        mut session: CryptoSession,
    ) -> Result<HandshakeReply> {
        if payload.len() < ENCRYPTED_OVERHEAD {
            return Err(violation("client confirmation too short"));
        }
        let plaintext = session
            .decrypt(payload)
            .map_err(|_| violation("client confirmation does not verify"))?;
        if plaintext != CONFIRM_CENTRAL {
            return Err(violation("client confirmation label mismatch"));
        }

        let response = session.encrypt(CONFIRM_PERIPHERAL)?;
        Ok(HandshakeReply {
            response,
            session: Some(session),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: [u8; 32] = [0x42; 32];

    fn run_handshake() -> (CryptoSession, CryptoSession) {
        let mut peripheral = PeripheralHandshake::new(&SEED).unwrap();
        let (mut central, msg1) = CentralHandshake::new().unwrap();

        let reply2 = peripheral.handle(&msg1).unwrap();
        assert!(reply2.session.is_none());
        assert_eq!(reply2.response.len(), PEER_KEYS_LEN);

        let msg3 = central.respond(&reply2.response, |_| Ok(())).unwrap();

        let reply4 = peripheral.handle(&msg3).unwrap();
        let peripheral_session = reply4.session.unwrap();

        let central_session = central.finish(&reply4.response).unwrap();
        (central_session, peripheral_session)
    }

    #[test]
    fn test_full_handshake_produces_mirrored_sessions() {
        let (mut c, mut p) = run_handshake();

        // Confirmations consumed counter 0 in both directions
        assert_eq!(c.tx_counter(), 1);
        assert_eq!(p.tx_counter(), 1);
        assert_eq!(c.rx_high_water(), Some(0));
        assert_eq!(p.rx_high_water(), Some(0));

        let frame = c.encrypt(b"request").unwrap();
        assert_eq!(p.decrypt(&frame).unwrap(), b"request");
        let frame = p.encrypt(b"response").unwrap();
        assert_eq!(c.decrypt(&frame).unwrap(), b"response");
    }

    #[test]
    fn test_identity_callback_sees_public_key() {
        let peripheral = PeripheralHandshake::new(&SEED).unwrap();
        let expected = *peripheral.identity_public_key();

        let mut peripheral = peripheral;
        let (mut central, msg1) = CentralHandshake::new().unwrap();
        let reply2 = peripheral.handle(&msg1).unwrap();

        let mut seen = None;
        central
            .respond(&reply2.response, |key| {
                seen = Some(*key);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, Some(expected));
    }

    #[test]
    fn test_identity_rejection_aborts_before_confirmation() {
        let mut peripheral = PeripheralHandshake::new(&SEED).unwrap();
        let (mut central, msg1) = CentralHandshake::new().unwrap();
        let reply2 = peripheral.handle(&msg1).unwrap();

        let err = central
            .respond(&reply2.response, |_| Err(BlerpcError::IdentityMismatch))
            .unwrap_err();
        assert!(matches!(err, BlerpcError::IdentityMismatch));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let mut peripheral = PeripheralHandshake::new(&SEED).unwrap();
        let (mut central, msg1) = CentralHandshake::new().unwrap();
        let mut reply2 = peripheral.handle(&msg1).unwrap();
        let last = reply2.response.len() - 1;
        reply2.response[last] ^= 0x01;

        assert!(matches!(
            central.respond(&reply2.response, |_| Ok(())),
            Err(BlerpcError::KeyExchangeProtocolViolation(_))
        ));
    }

    #[test]
    fn test_out_of_order_confirmation_rejected() {
        let mut peripheral = PeripheralHandshake::new(&SEED).unwrap();
        // A confirmation-sized blob while the peripheral is idle
        assert!(matches!(
            peripheral.handle(&[0u8; 42]),
            Err(BlerpcError::KeyExchangeProtocolViolation(_))
        ));
    }

    #[test]
    fn test_wrong_size_initial_rejected() {
        let mut peripheral = PeripheralHandshake::new(&SEED).unwrap();
        assert!(matches!(
            peripheral.handle(&[0u8; 31]),
            Err(BlerpcError::KeyExchangeProtocolViolation(_))
        ));
    }

    #[test]
    fn test_central_finish_out_of_order() {
        let (central, _msg1) = CentralHandshake::new().unwrap();
        assert!(matches!(
            central.finish(&[0u8; 42]),
            Err(BlerpcError::KeyExchangeProtocolViolation(_))
        ));
    }

    #[test]
    fn test_confirmation_with_wrong_key_rejected() {
        let mut peripheral = PeripheralHandshake::new(&SEED).unwrap();
        let (_central, msg1) = CentralHandshake::new().unwrap();
        peripheral.handle(&msg1).unwrap();

        // A confirmation not produced by the central's session key
        assert!(matches!(
            peripheral.handle(&[0u8; 42]),
            Err(BlerpcError::KeyExchangeProtocolViolation(_))
        ));
        // Pending session was discarded; a fresh handshake can start
        let (_central2, msg1b) = CentralHandshake::new().unwrap();
        assert!(peripheral.handle(&msg1b).is_ok());
    }
}
