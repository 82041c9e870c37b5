//! Ed25519 → X25519 conversion.
//!
//! Agent keys are Ed25519 verkeys; key agreement needs their Montgomery
//! form. Secrets go through the clamped SHA-512 expansion, public keys
//! through the birational map.

use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Convert an Ed25519 signing seed (32 bytes) to an X25519 static secret.
pub fn ed25519_secret_to_x25519(ed_secret: &[u8; 32]) -> StaticSecret {
    let mut h = Sha512::digest(ed_secret);
    // Clamp as per RFC 7748 §5
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut key = [0u8; 32];
    key.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    let secret = StaticSecret::from(key);
    key.zeroize();
    secret
}

/// Convert an Ed25519 verifying key to an X25519 public key.
pub fn ed25519_pub_to_x25519(ed_pub: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY::from_slice(ed_pub)
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed.decompress().ok_or_else(|| {
        CryptoError::InvalidKey("Ed25519 public key decompression failed".into())
    })?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn converted_halves_agree() {
        let signing = SigningKey::generate(&mut OsRng);
        let secret = ed25519_secret_to_x25519(&signing.to_bytes());
        let public = ed25519_pub_to_x25519(&signing.verifying_key().to_bytes()).unwrap();
        assert_eq!(X25519Public::from(&secret).as_bytes(), public.as_bytes());
    }
}
