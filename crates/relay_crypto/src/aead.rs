//! Authenticated Encryption with Associated Data
//!
//! XChaCha20-Poly1305 (192-bit nonce) everywhere.
//! Key size: 32 bytes.  Nonce: 24 bytes (random).  Tag: 16 bytes.
//!
//! Two wire shapes are used:
//!   - combined: `[ nonce (24) | ciphertext + tag ]`, for key wrapping
//!   - detached: nonce, ciphertext and tag carried separately, for the
//!     envelope body (`iv`, `ciphertext`, `tag`)

use chacha20poly1305::{
    aead::{Aead, AeadCore, AeadInPlace, KeyInit, OsRng as AeadOsRng},
    Tag, XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// Output of [`encrypt_detached`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detached {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Fresh random 24-byte nonce.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&XChaCha20Poly1305::generate_nonce(&mut AeadOsRng));
    nonce
}

/// Fresh random 32-byte symmetric key (content-encryption key).
pub fn generate_key() -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&XChaCha20Poly1305::generate_key(&mut AeadOsRng));
    key
}

/// Encrypt `plaintext` with a 32-byte key, prepending a random 24-byte nonce.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = generate_nonce();
    let ciphertext = encrypt_with_nonce(key, &nonce, plaintext, aad)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (nonce || ciphertext+tag).
pub fn decrypt(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce, ct) = data.split_at(NONCE_LEN);
    decrypt_with_nonce(key, nonce, ct, aad)
}

/// Encrypt under a caller-supplied nonce; output is ciphertext || tag.
pub fn encrypt_with_nonce(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            chacha20poly1305::aead::Payload { msg: plaintext, aad },
        )
        .map_err(|_| CryptoError::AeadEncrypt)
}

/// Decrypt ciphertext || tag under an explicit nonce.
pub fn decrypt_with_nonce(
    key: &[u8; 32],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce),
            chacha20poly1305::aead::Payload { msg: ciphertext, aad },
        )
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

/// Encrypt with a random nonce, returning nonce, ciphertext and tag apart.
pub fn encrypt_detached(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Detached, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = generate_nonce();
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(XNonce::from_slice(&nonce), aad, &mut buffer)
        .map_err(|_| CryptoError::AeadEncrypt)?;
    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(&tag);
    Ok(Detached {
        nonce,
        ciphertext: buffer,
        tag: tag_bytes,
    })
}

pub fn decrypt_detached(
    key: &[u8; 32],
    nonce: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if nonce.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            XNonce::from_slice(nonce),
            aad,
            &mut buffer[..],
            Tag::from_slice(tag),
        )
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_round_trip_binds_aad() {
        let key = generate_key();
        let sealed = encrypt_detached(&key, b"hello relay", b"header").unwrap();
        let opened =
            decrypt_detached(&key, &sealed.nonce, &sealed.ciphertext, &sealed.tag, b"header").unwrap();
        assert_eq!(opened.as_slice(), b"hello relay");

        assert!(decrypt_detached(&key, &sealed.nonce, &sealed.ciphertext, &sealed.tag, b"other").is_err());
    }

    #[test]
    fn combined_rejects_truncated_input() {
        let key = [7u8; 32];
        assert!(decrypt(&key, &[0u8; 10], b"").is_err());
        let ct = encrypt(&key, b"x", b"").unwrap();
        assert_eq!(decrypt(&key, &ct, b"").unwrap().as_slice(), b"x");
    }
}
