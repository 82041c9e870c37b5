//! Key derivation
//!
//! `hkdf_expand` is HKDF-SHA256. The wrap-key helpers bind both X25519
//! public keys into the salt so a derived key is tied to one direction of
//! one key pair.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;

const SEALED_INFO: &[u8] = b"relay-sealed-v1";
const AUTHCRYPT_INFO: &[u8] = b"relay-authcrypt-v1";

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be `None` (HKDF will use a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

fn derive(dh_output: &[u8], first: &[u8; 32], second: &[u8; 32], info: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(first);
    salt[32..].copy_from_slice(second);
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf_expand(dh_output, Some(&salt), info, &mut key[..])?;
    Ok(key)
}

/// Key for an anonymous (ephemeral-sender) box.
pub fn sealed_box_key(
    dh_output: &[u8],
    ephemeral_pub: &[u8; 32],
    recipient_pub: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    derive(dh_output, ephemeral_pub, recipient_pub, SEALED_INFO)
}

/// Key for an authenticated sender→recipient box.
pub fn authcrypt_key(
    dh_output: &[u8],
    sender_pub: &[u8; 32],
    recipient_pub: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    derive(dh_output, sender_pub, recipient_pub, AUTHCRYPT_INFO)
}
