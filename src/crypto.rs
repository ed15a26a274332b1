//! Channel and allowed-list attestations.
//!
//! A channel is a secret capability string. Its keypair is derived
//! deterministically (`sk = SHA-256(channel)`), so everyone who knows the
//! channel derives the same Ed25519 key and the 33-byte public id
//! (`0x00 || pk`) can be published without revealing the channel itself.
//! An attestation is the channel key's signature over the actor id.
//!
//! Allowed-list membership works the other way around: the sender mints a
//! random 35-byte ticket (`0x00 0x12 0x20 || random_32`) per recipient and
//! attests that recipient with HMAC-SHA-256 keyed by the ticket body. A
//! recipient holding its ticket can prove inclusion without learning
//! anything about the other recipients.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Method prefix for Ed25519 channel public ids.
const CHANNEL_METHOD: u8 = 0x00;

/// Length of a channel public id: method byte plus Ed25519 public key.
pub const CHANNEL_PUBLIC_ID_LEN: usize = 33;

/// Allowed-ticket prefix: method byte plus the sha2-256 multihash header.
const TICKET_PREFIX: [u8; 3] = [0x00, 0x12, 0x20];

/// Length of an allowed ticket: 3-byte prefix plus 32 random bytes.
pub const ALLOWED_TICKET_LEN: usize = 35;

/// Length of an Ed25519 channel attestation.
pub const CHANNEL_ATTESTATION_LEN: usize = 64;

/// Length of an HMAC-SHA-256 allowed attestation.
pub const ALLOWED_ATTESTATION_LEN: usize = 32;

#[derive(Debug)]
pub enum CryptoError {
    InvalidLength(&'static str),
    UnknownMethod(u8),
    InvalidSignature,
    InvalidAttestation,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::InvalidLength(message) => write!(f, "invalid length: {message}"),
            CryptoError::UnknownMethod(byte) => write!(f, "unknown method byte: {byte:#04x}"),
            CryptoError::InvalidSignature => write!(f, "invalid signature"),
            CryptoError::InvalidAttestation => write!(f, "invalid attestation"),
        }
    }
}

impl std::error::Error for CryptoError {}

fn channel_signing_key(channel: &str) -> SigningKey {
    let seed: [u8; 32] = Sha256::digest(channel.as_bytes()).into();
    SigningKey::from_bytes(&seed)
}

/// Derive the publishable 33-byte public id for a channel.
///
/// Idempotent: the same channel string always yields the same id.
pub fn channel_public_id(channel: &str) -> [u8; CHANNEL_PUBLIC_ID_LEN] {
    let key = channel_signing_key(channel);
    let mut id = [0u8; CHANNEL_PUBLIC_ID_LEN];
    id[0] = CHANNEL_METHOD;
    id[1..].copy_from_slice(&key.verifying_key().to_bytes());
    id
}

/// Sign `actor` under the channel's derived key.
///
/// Returns the signature and the channel's public id, in that order; callers
/// carry them positionally so attestation order stays aligned with tag
/// order on the wire.
pub fn attest_channel(
    actor: &str,
    channel: &str,
) -> ([u8; CHANNEL_ATTESTATION_LEN], [u8; CHANNEL_PUBLIC_ID_LEN]) {
    let key = channel_signing_key(channel);
    let signature = key.sign(actor.as_bytes());
    let mut id = [0u8; CHANNEL_PUBLIC_ID_LEN];
    id[0] = CHANNEL_METHOD;
    id[1..].copy_from_slice(&key.verifying_key().to_bytes());
    (signature.to_bytes(), id)
}

/// Verify a channel attestation against an actor and a channel public id.
pub fn validate_channel(
    attestation: &[u8],
    actor: &str,
    public_id: &[u8],
) -> Result<(), CryptoError> {
    if public_id.len() != CHANNEL_PUBLIC_ID_LEN {
        return Err(CryptoError::InvalidLength("channel public id must be 33 bytes"));
    }
    if public_id[0] != CHANNEL_METHOD {
        return Err(CryptoError::UnknownMethod(public_id[0]));
    }
    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(&public_id[1..]);
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidSignature)?;

    if attestation.len() != CHANNEL_ATTESTATION_LEN {
        return Err(CryptoError::InvalidLength("channel attestation must be 64 bytes"));
    }
    let mut sig_bytes = [0u8; CHANNEL_ATTESTATION_LEN];
    sig_bytes.copy_from_slice(attestation);
    let signature = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify(actor.as_bytes(), &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Mint a ticket for `actor` and attest its allowed-list membership.
///
/// Returns the attestation and the ticket, in that order. The ticket is the
/// per-recipient capability; hand it to exactly one recipient.
pub fn attest_allowed(actor: &str) -> ([u8; ALLOWED_ATTESTATION_LEN], [u8; ALLOWED_TICKET_LEN]) {
    attest_allowed_with_rng(actor, &mut OsRng)
}

/// [`attest_allowed`] with a caller-supplied RNG.
pub fn attest_allowed_with_rng(
    actor: &str,
    rng: &mut (impl RngCore + CryptoRng),
) -> ([u8; ALLOWED_ATTESTATION_LEN], [u8; ALLOWED_TICKET_LEN]) {
    let mut ticket = [0u8; ALLOWED_TICKET_LEN];
    ticket[..3].copy_from_slice(&TICKET_PREFIX);
    rng.fill_bytes(&mut ticket[3..]);

    let mut mac = HmacSha256::new_from_slice(&ticket[3..]).expect("hmac accepts any key length");
    mac.update(actor.as_bytes());
    let attestation: [u8; ALLOWED_ATTESTATION_LEN] = mac.finalize().into_bytes().into();
    (attestation, ticket)
}

/// Verify an allowed attestation for `actor` under `ticket`.
///
/// The HMAC comparison is constant-time.
pub fn validate_allowed(
    attestation: &[u8],
    actor: &str,
    ticket: &[u8],
) -> Result<(), CryptoError> {
    if ticket.len() != ALLOWED_TICKET_LEN {
        return Err(CryptoError::InvalidLength("allowed ticket must be 35 bytes"));
    }
    if ticket[..3] != TICKET_PREFIX {
        return Err(CryptoError::UnknownMethod(ticket[0]));
    }
    let mut mac = HmacSha256::new_from_slice(&ticket[3..])
        .map_err(|_| CryptoError::InvalidLength("ticket body rejected as hmac key"))?;
    mac.update(actor.as_bytes());
    mac.verify_slice(attestation)
        .map_err(|_| CryptoError::InvalidAttestation)
}
