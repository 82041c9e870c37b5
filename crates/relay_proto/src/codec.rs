//! Envelope codec: plaintext [`AgentMessage`] ⇄ [`EncryptedMessage`].
//!
//! # Pack
//! 1. Random 32-byte content-encryption key (CEK).
//! 2. Per recipient, wrap the CEK:
//!    - Anoncrypt: sealed box to the recipient.
//!    - Authcrypt: sender→recipient box (nonce in `iv` header) plus the
//!      sender verkey sealed to the recipient (`sender` header).
//! 3. Encrypt the plaintext under the CEK with the protected header as AAD.
//! 4. For each routing key, wrap the result in a `forward` addressed to the
//!    previous first recipient and anoncrypt it to `[routing_key]`.
//!
//! # Unpack
//! The first recipient entry whose `kid` we hold a secret for wins.

use std::sync::Arc;

use relay_crypto::{aead, boxes, KeyPair, KeyStore, PublicKey};
use tracing::debug;

use crate::{
    envelope::{
        b64d, b64e, EncryptedMessage, PackAlg, ProtectedHeader, RecipientEntry, RecipientHeader,
        ENC_XCHACHA20POLY1305, TYP_JWM,
    },
    error::ProtoError,
    message::AgentMessage,
    protocols::routing::Forward,
};

/// Keys for one outbound envelope. Built per send, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeKeys {
    pub recipient_keys: Vec<PublicKey>,
    pub routing_keys: Vec<PublicKey>,
    /// `None` ⇒ anonymous encryption.
    pub sender_key: Option<PublicKey>,
}

/// Result of [`EnvelopeCodec::unpack`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedMessage {
    pub plaintext: AgentMessage,
    pub sender_key: Option<PublicKey>,
    pub recipient_key: PublicKey,
}

#[derive(Clone)]
pub struct EnvelopeCodec {
    keys: Arc<dyn KeyStore>,
}

impl EnvelopeCodec {
    pub fn new(keys: Arc<dyn KeyStore>) -> Self {
        Self { keys }
    }

    pub fn key_store(&self) -> &Arc<dyn KeyStore> {
        &self.keys
    }

    pub fn pack(&self, message: &AgentMessage, keys: &EnvelopeKeys) -> Result<EncryptedMessage, ProtoError> {
        let sender = match &keys.sender_key {
            Some(sender_key) => Some(
                self.keys
                    .key_pair(sender_key)
                    .ok_or_else(|| relay_crypto::CryptoError::KeyNotFound(sender_key.to_base58()))?,
            ),
            None => None,
        };

        let mut envelope = encrypt(&message.to_json()?, &keys.recipient_keys, sender.as_deref())?;
        let mut next_hop = *keys.recipient_keys.first().ok_or(ProtoError::NoRecipients)?;

        for routing_key in &keys.routing_keys {
            let forward = AgentMessage::new(&Forward {
                to: next_hop.to_base58(),
                msg: envelope,
            })?;
            debug!(to = %next_hop, via = %routing_key, "wrapping envelope in forward");
            envelope = encrypt(&forward.to_json()?, std::slice::from_ref(routing_key), None)?;
            next_hop = *routing_key;
        }

        Ok(envelope)
    }

    pub fn unpack(&self, envelope: &EncryptedMessage) -> Result<DecryptedMessage, ProtoError> {
        let header = envelope.protected_header()?;
        if header.enc != ENC_XCHACHA20POLY1305 {
            return Err(ProtoError::UnsupportedAlgorithm(header.enc));
        }

        let (entry, recipient_key, ours) = header
            .recipients
            .iter()
            .find_map(|entry| {
                let key = PublicKey::parse(&entry.header.kid).ok()?;
                let pair = self.keys.key_pair(&key)?;
                Some((entry, key, pair))
            })
            .ok_or(ProtoError::NoRecipientKey)?;

        let encrypted_key = b64d(&entry.encrypted_key)?;
        let (cek, sender_key) = match header.alg {
            PackAlg::Anoncrypt => (boxes::open_sealed(&ours, &encrypted_key)?, None),
            PackAlg::Authcrypt => {
                let (sender, iv) = match (&entry.header.sender, &entry.header.iv) {
                    (Some(sender), Some(iv)) => (sender, iv),
                    _ => {
                        return Err(ProtoError::InvalidEnvelope(
                            "Authcrypt recipient header is missing sender or iv".into(),
                        ))
                    }
                };
                let sender_vk = boxes::open_sealed(&ours, &b64d(sender)?)?;
                let sender_vk = std::str::from_utf8(&sender_vk)
                    .map_err(|_| ProtoError::InvalidEnvelope("sender key is not utf-8".into()))?;
                let sender_key = PublicKey::from_base58(sender_vk)?;
                let cek = boxes::auth_open(&ours, &sender_key, &b64d(iv)?, &encrypted_key)?;
                (cek, Some(sender_key))
            }
        };

        let cek: [u8; 32] = cek
            .as_slice()
            .try_into()
            .map_err(|_| ProtoError::InvalidEnvelope("content key must be 32 bytes".into()))?;
        let plaintext = aead::decrypt_detached(
            &cek,
            &b64d(&envelope.iv)?,
            &b64d(&envelope.ciphertext)?,
            &b64d(&envelope.tag)?,
            envelope.protected.as_bytes(),
        )?;

        Ok(DecryptedMessage {
            plaintext: AgentMessage::from_json(&plaintext)?,
            sender_key,
            recipient_key,
        })
    }
}

fn encrypt(
    plaintext: &[u8],
    recipients: &[PublicKey],
    sender: Option<&KeyPair>,
) -> Result<EncryptedMessage, ProtoError> {
    if recipients.is_empty() {
        return Err(ProtoError::NoRecipients);
    }
    let cek = aead::generate_key();

    let mut entries = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        let entry = match sender {
            Some(sender) => {
                let (nonce, wrapped) = boxes::auth_seal(sender, recipient, cek.as_slice())?;
                let sealed_sender = boxes::seal(recipient, sender.public().to_base58().as_bytes())?;
                RecipientEntry {
                    encrypted_key: b64e(&wrapped),
                    header: RecipientHeader {
                        kid: recipient.to_base58(),
                        sender: Some(b64e(&sealed_sender)),
                        iv: Some(b64e(&nonce)),
                    },
                }
            }
            None => RecipientEntry {
                encrypted_key: b64e(&boxes::seal(recipient, cek.as_slice())?),
                header: RecipientHeader {
                    kid: recipient.to_base58(),
                    sender: None,
                    iv: None,
                },
            },
        };
        entries.push(entry);
    }

    let protected = ProtectedHeader {
        enc: ENC_XCHACHA20POLY1305.to_string(),
        typ: TYP_JWM.to_string(),
        alg: if sender.is_some() { PackAlg::Authcrypt } else { PackAlg::Anoncrypt },
        recipients: entries,
    };
    let protected = b64e(&serde_json::to_vec(&protected)?);

    let sealed = aead::encrypt_detached(&cek, plaintext, protected.as_bytes())?;
    Ok(EncryptedMessage {
        protected,
        iv: b64e(&sealed.nonce),
        ciphertext: b64e(&sealed.ciphertext),
        tag: b64e(&sealed.tag),
    })
}
