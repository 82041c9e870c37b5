//! Key-wrapping boxes used inside envelopes.
//!
//! `seal` / `open_sealed`: anonymous box. The sender is an ephemeral
//! X25519 key whose public half is prepended to the output:
//!   [ epk (32) | nonce (24) | ciphertext + tag ]
//!
//! `auth_seal` / `auth_open`: sender-authenticated box. The key is
//! derived from DH(sender, recipient) so only the holder of either
//! secret can produce or open it. The nonce is returned separately so
//! callers can carry it in a header.

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, SharedSecret};
use zeroize::Zeroizing;

use crate::{
    aead::{self, NONCE_LEN},
    error::CryptoError,
    kdf,
    keys::{KeyPair, PublicKey},
};

const EPK_LEN: usize = 32;

fn contributory(shared: SharedSecret) -> Result<SharedSecret, CryptoError> {
    if shared.was_contributory() {
        Ok(shared)
    } else {
        Err(CryptoError::InvalidKey("low-order X25519 point".into()))
    }
}

/// Anonymously encrypt `plaintext` so only `recipient` can open it.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let recipient_x = recipient.to_x25519()?;
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let epk = X25519Public::from(&ephemeral);
    let shared = contributory(ephemeral.diffie_hellman(&recipient_x))?;

    let key = kdf::sealed_box_key(shared.as_bytes(), epk.as_bytes(), recipient_x.as_bytes())?;
    let boxed = aead::encrypt(&key, plaintext, epk.as_bytes())?;

    let mut out = Vec::with_capacity(EPK_LEN + boxed.len());
    out.extend_from_slice(epk.as_bytes());
    out.extend_from_slice(&boxed);
    Ok(out)
}

pub fn open_sealed(recipient: &KeyPair, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if sealed.len() < EPK_LEN + NONCE_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (epk_bytes, boxed) = sealed.split_at(EPK_LEN);
    let mut epk = [0u8; EPK_LEN];
    epk.copy_from_slice(epk_bytes);
    let epk = X25519Public::from(epk);

    let secret = recipient.x25519_secret();
    let recipient_x = X25519Public::from(&secret);
    let shared = contributory(secret.diffie_hellman(&epk))?;

    let key = kdf::sealed_box_key(shared.as_bytes(), epk.as_bytes(), recipient_x.as_bytes())?;
    aead::decrypt(&key, boxed, epk.as_bytes())
}

/// Encrypt `plaintext` from `sender` to `recipient`. Returns (nonce, ct).
pub fn auth_seal(
    sender: &KeyPair,
    recipient: &PublicKey,
    plaintext: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
    let secret = sender.x25519_secret();
    let sender_x = X25519Public::from(&secret);
    let recipient_x = recipient.to_x25519()?;
    let shared = contributory(secret.diffie_hellman(&recipient_x))?;

    let key = kdf::authcrypt_key(shared.as_bytes(), sender_x.as_bytes(), recipient_x.as_bytes())?;
    let nonce = aead::generate_nonce();
    let ct = aead::encrypt_with_nonce(&key, &nonce, plaintext, b"")?;
    Ok((nonce, ct))
}

pub fn auth_open(
    recipient: &KeyPair,
    sender: &PublicKey,
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let secret = recipient.x25519_secret();
    let recipient_x = X25519Public::from(&secret);
    let sender_x = sender.to_x25519()?;
    let shared = contributory(secret.diffie_hellman(&sender_x))?;

    let key = kdf::authcrypt_key(shared.as_bytes(), sender_x.as_bytes(), recipient_x.as_bytes())?;
    aead::decrypt_with_nonce(&key, nonce, ciphertext, b"")
}
