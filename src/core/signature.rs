//! Package signature verification.
//!
//! Packages are signed over their payload digest with Ed25519. A chain
//! of trust is a list of raw 32-byte verifying keys; a signature is
//! accepted if any key in the chain verifies it. Store signatures are
//! not made over the digest directly but over the digest keyed with the
//! device hardware id (HMAC-SHA256), binding the package to one device.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

/// Derives the digest a store signature is made over.
///
/// The plain payload digest is keyed with the device `hardware_id`.
pub fn store_digest(digest: &[u8], hardware_id: &str) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(hardware_id.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(digest);
    mac.finalize().into_bytes().to_vec()
}

/// Verifies `signature` over `message` against `chain_of_trust`.
///
/// Each chain entry is a raw 32-byte Ed25519 verifying key. The
/// signature is accepted if any entry verifies it.
pub fn verify(message: &[u8], signature: &[u8], chain_of_trust: &[Vec<u8>]) -> Result<()> {
    if chain_of_trust.is_empty() {
        return Err(Error::SignatureInvalid(
            "no chain of trust configured".into(),
        ));
    }

    let signature = Signature::from_slice(signature)
        .map_err(|e| Error::SignatureInvalid(format!("malformed signature: {e}")))?;

    for key_bytes in chain_of_trust {
        let Ok(raw) = <&[u8; 32]>::try_from(key_bytes.as_slice()) else {
            continue;
        };
        let Ok(key) = VerifyingKey::from_bytes(raw) else {
            continue;
        };
        if key.verify_strict(message, &signature).is_ok() {
            return Ok(());
        }
    }

    Err(Error::SignatureInvalid(
        "signature does not verify against any certificate in the chain of trust".into(),
    ))
}

/// Signs `message` with a raw 32-byte Ed25519 signing key.
///
/// Used by the package builder; verification lives in [`verify`].
pub fn sign(message: &[u8], signing_key: &[u8; 32]) -> Vec<u8> {
    let key = SigningKey::from_bytes(signing_key);
    key.sign(message).to_bytes().to_vec()
}

/// Returns the verifying key matching a raw signing key.
pub fn verifying_key(signing_key: &[u8; 32]) -> Vec<u8> {
    SigningKey::from_bytes(signing_key)
        .verifying_key()
        .to_bytes()
        .to_vec()
}
