//! Password-authenticated key exchange over P-256.
//!
//! SPAKE2-shaped: each side blinds an ephemeral Diffie-Hellman share with a
//! password-derived multiple of a role-specific public point (M for the
//! initiator, N for the responder). Peers that know the same code unblind
//! each other's share and land on the same 32-byte key; anyone else learns
//! nothing useful from the exchanged messages. Key confirmation is
//! HMAC-SHA256 over the peer's public message.

use hmac::{Hmac, Mac};
use p256::elliptic_curve::ops::Reduce;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::elliptic_curve::Field;
use p256::{AffinePoint, EncodedPoint, ProjectivePoint, Scalar, U256};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SHARED_KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum PakeError {
    #[error("Peer message is not a valid curve point")]
    InvalidPoint,

    #[error("Key exchange not completed")]
    NotReady,
}

/// Which side of the exchange this state machine plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PakeRole {
    /// role = 0, sends the first message
    Initiator,
    /// role = 1, answers it
    Responder,
}

// Role-specific blinding points, fixed for the protocol's lifetime. Derived
// as generator multiples of hashed domain labels so both ends agree without
// shipping curve constants.
fn blind_point(label: &[u8]) -> ProjectivePoint {
    ProjectivePoint::GENERATOR * scalar_from_hash(label)
}

fn point_m() -> &'static ProjectivePoint {
    static M: OnceLock<ProjectivePoint> = OnceLock::new();
    M.get_or_init(|| blind_point(b"lancast/pake/point-M"))
}

fn point_n() -> &'static ProjectivePoint {
    static N: OnceLock<ProjectivePoint> = OnceLock::new();
    N.get_or_init(|| blind_point(b"lancast/pake/point-N"))
}

fn scalar_from_hash(input: &[u8]) -> Scalar {
    let digest = Sha256::digest(input);
    Scalar::reduce(U256::from_be_slice(&digest))
}

fn code_scalar(code: &str) -> Scalar {
    let mut hasher = Sha256::new();
    hasher.update(b"lancast/pake/code");
    hasher.update(code.as_bytes());
    Scalar::reduce(U256::from_be_slice(&hasher.finalize()))
}

/// One side's handshake state.
pub struct Pake {
    role: PakeRole,
    secret: Scalar,
    blind: Scalar,
    public: Vec<u8>,
    key: Option<[u8; SHARED_KEY_LEN]>,
}

impl Pake {
    /// Derive the blinding scalar from the shared code and emit this side's
    /// public message.
    pub fn new(code: &str, role: PakeRole) -> Self {
        let blind = code_scalar(code);
        let secret = Scalar::random(&mut rand::rngs::OsRng);

        let mask = match role {
            PakeRole::Initiator => *point_m(),
            PakeRole::Responder => *point_n(),
        } * blind;
        let public_point = ProjectivePoint::GENERATOR * secret + mask;
        let public = public_point
            .to_affine()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec();

        Self {
            role,
            secret,
            blind,
            public,
            key: None,
        }
    }

    /// Compressed SEC1 bytes sent to the peer.
    pub fn public_message(&self) -> &[u8] {
        &self.public
    }

    /// Fold in the peer's public message and derive the shared key.
    pub fn update(&mut self, peer_message: &[u8]) -> Result<[u8; SHARED_KEY_LEN], PakeError> {
        let encoded =
            EncodedPoint::from_bytes(peer_message).map_err(|_| PakeError::InvalidPoint)?;
        let affine: Option<AffinePoint> = AffinePoint::from_encoded_point(&encoded).into();
        let peer_point = ProjectivePoint::from(affine.ok_or(PakeError::InvalidPoint)?);

        // Strip the peer's password mask, then raise to our ephemeral secret
        let peer_mask = match self.role {
            PakeRole::Initiator => *point_n(),
            PakeRole::Responder => *point_m(),
        } * self.blind;
        let shared_point = (peer_point - peer_mask) * self.secret;

        if shared_point == ProjectivePoint::IDENTITY {
            return Err(PakeError::InvalidPoint);
        }

        let shared_bytes = shared_point.to_affine().to_encoded_point(true);

        // Transcript order is fixed by role so both sides hash identically
        let (first, second): (&[u8], &[u8]) = match self.role {
            PakeRole::Initiator => (&self.public, peer_message),
            PakeRole::Responder => (peer_message, &self.public),
        };

        let mut hasher = Sha256::new();
        hasher.update(b"lancast/pake/key");
        hasher.update(first);
        hasher.update(second);
        hasher.update(shared_bytes.as_bytes());

        let mut key = [0u8; SHARED_KEY_LEN];
        key.copy_from_slice(&hasher.finalize());
        self.key = Some(key);
        Ok(key)
    }

    pub fn shared_key(&self) -> Result<[u8; SHARED_KEY_LEN], PakeError> {
        self.key.ok_or(PakeError::NotReady)
    }
}

/// `HMAC-SHA256(key, peer_public_message)` proving we derived the same key.
pub fn confirmation(key: &[u8; SHARED_KEY_LEN], peer_message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(peer_message);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time confirmation check.
pub fn verify_confirmation(
    key: &[u8; SHARED_KEY_LEN],
    peer_message: &[u8],
    candidate: &[u8],
) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(peer_message);
    mac.verify_slice(candidate).is_ok()
}
