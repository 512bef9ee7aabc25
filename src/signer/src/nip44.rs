//! NIP-44 v2 conversation encryption, used to protect the NIP-46 RPC
//! transport and offered by the private-key signer.
//!
//! Construction: ECDH x-coordinate -> HKDF-SHA256 conversation key; per
//! message a random 32-byte nonce expands into ChaCha20 key/nonce and an
//! HMAC-SHA256 key; payload is `base64(0x02 || nonce || ciphertext || mac)`
//! with length-prefixed padding.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use shared::types::{PublicKey, SecretKey};

const VERSION: u8 = 2;
const SALT: &[u8] = b"nip44-v2";

#[derive(Debug, thiserror::Error)]
pub enum Nip44Error {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("MAC verification failed")]
    MacMismatch,
}

/// The long-lived key for one (secret, peer) conversation.
pub struct ConversationKey([u8; 32]);

impl ConversationKey {
    /// ECDH against the peer's x-only pubkey (lifted with even parity), then
    /// HKDF-extract with the protocol salt.
    pub fn derive(secret: &SecretKey, peer: &PublicKey) -> Result<Self, Nip44Error> {
        let sk = k256::SecretKey::from_slice(&secret.0)
            .map_err(|e| Nip44Error::InvalidKey(e.to_string()))?;

        let mut sec1 = [0u8; 33];
        sec1[0] = 0x02;
        sec1[1..].copy_from_slice(&peer.0);
        let pk = k256::PublicKey::from_sec1_bytes(&sec1)
            .map_err(|e| Nip44Error::InvalidKey(e.to_string()))?;

        let shared =
            k256::ecdh::diffie_hellman(sk.to_nonzero_scalar(), pk.as_affine());
        let shared_x = shared.raw_secret_bytes();

        let (prk, _) = Hkdf::<Sha256>::extract(Some(SALT), shared_x.as_slice());
        let mut key = [0u8; 32];
        key.copy_from_slice(&prk);
        Ok(Self(key))
    }

    fn message_keys(&self, nonce: &[u8; 32]) -> ([u8; 32], [u8; 12], [u8; 32]) {
        let hk = Hkdf::<Sha256>::from_prk(&self.0).expect("32-byte PRK");
        let mut okm = [0u8; 76];
        hk.expand(nonce, &mut okm).expect("76 bytes fits HKDF output");

        let mut chacha_key = [0u8; 32];
        let mut chacha_nonce = [0u8; 12];
        let mut hmac_key = [0u8; 32];
        chacha_key.copy_from_slice(&okm[0..32]);
        chacha_nonce.copy_from_slice(&okm[32..44]);
        hmac_key.copy_from_slice(&okm[44..76]);
        (chacha_key, chacha_nonce, hmac_key)
    }
}

/// Encrypt plaintext under the conversation key.
pub fn encrypt(plaintext: &str, key: &ConversationKey) -> Result<String, Nip44Error> {
    let mut nonce = [0u8; 32];
    getrandom::getrandom(&mut nonce)
        .map_err(|e| Nip44Error::InvalidKey(format!("rng: {}", e)))?;
    encrypt_with_nonce(plaintext, key, &nonce)
}

fn encrypt_with_nonce(
    plaintext: &str,
    key: &ConversationKey,
    nonce: &[u8; 32],
) -> Result<String, Nip44Error> {
    let unpadded = plaintext.as_bytes();
    if unpadded.is_empty() || unpadded.len() > 65535 {
        return Err(Nip44Error::InvalidPayload(
            "plaintext length out of range".to_string(),
        ));
    }

    let mut padded = vec![0u8; 2 + calc_padded_len(unpadded.len())];
    padded[0..2].copy_from_slice(&(unpadded.len() as u16).to_be_bytes());
    padded[2..2 + unpadded.len()].copy_from_slice(unpadded);

    let (chacha_key, chacha_nonce, hmac_key) = key.message_keys(nonce);
    let mut cipher = ChaCha20::new(&chacha_key.into(), &chacha_nonce.into());
    cipher.apply_keystream(&mut padded);

    let mut mac = Hmac::<Sha256>::new_from_slice(&hmac_key).expect("any key length works");
    mac.update(nonce);
    mac.update(&padded);
    let tag = mac.finalize().into_bytes();

    let mut out = Vec::with_capacity(1 + 32 + padded.len() + 32);
    out.push(VERSION);
    out.extend_from_slice(nonce);
    out.extend_from_slice(&padded);
    out.extend_from_slice(&tag);
    Ok(BASE64.encode(out))
}

/// Decrypt a payload under the conversation key.
pub fn decrypt(payload: &str, key: &ConversationKey) -> Result<String, Nip44Error> {
    let data = BASE64
        .decode(payload)
        .map_err(|e| Nip44Error::InvalidPayload(e.to_string()))?;
    // version + nonce + at least one padded block + mac
    if data.len() < 1 + 32 + 34 + 32 {
        return Err(Nip44Error::InvalidPayload("payload too short".to_string()));
    }
    if data[0] != VERSION {
        return Err(Nip44Error::InvalidPayload(format!(
            "unsupported version {}",
            data[0]
        )));
    }

    let nonce: [u8; 32] = data[1..33].try_into().expect("length checked");
    let ciphertext = &data[33..data.len() - 32];
    let tag = &data[data.len() - 32..];

    let (chacha_key, chacha_nonce, hmac_key) = key.message_keys(&nonce);

    let mut mac = Hmac::<Sha256>::new_from_slice(&hmac_key).expect("any key length works");
    mac.update(&nonce);
    mac.update(ciphertext);
    mac.verify_slice(tag).map_err(|_| Nip44Error::MacMismatch)?;

    let mut padded = ciphertext.to_vec();
    let mut cipher = ChaCha20::new(&chacha_key.into(), &chacha_nonce.into());
    cipher.apply_keystream(&mut padded);

    let unpadded_len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if unpadded_len == 0 || 2 + unpadded_len > padded.len() {
        return Err(Nip44Error::InvalidPayload("invalid padding".to_string()));
    }
    String::from_utf8(padded[2..2 + unpadded_len].to_vec())
        .map_err(|e| Nip44Error::InvalidPayload(e.to_string()))
}

/// Padded length per the NIP-44 scheme: 32-byte floor, then power-of-two
/// derived chunks.
fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        return 32;
    }
    let next_power = 1usize << (usize::BITS - (unpadded_len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((unpadded_len - 1) / chunk + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::Keys;

    #[test]
    fn padding_boundaries() {
        assert_eq!(calc_padded_len(1), 32);
        assert_eq!(calc_padded_len(32), 32);
        assert_eq!(calc_padded_len(33), 64);
        assert_eq!(calc_padded_len(37), 64);
        assert_eq!(calc_padded_len(257), 320);
    }

    #[test]
    fn conversation_key_is_symmetric() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let k1 = ConversationKey::derive(alice.secret_key(), &bob.public_key()).unwrap();
        let k2 = ConversationKey::derive(bob.secret_key(), &alice.public_key()).unwrap();
        assert_eq!(k1.0, k2.0);
    }

    #[test]
    fn encrypt_decrypt_roundtrips() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let key = ConversationKey::derive(alice.secret_key(), &bob.public_key()).unwrap();

        let plaintext = r#"{"id":"1","method":"sign_event","params":["{}"]}"#;
        let payload = encrypt(plaintext, &key).unwrap();
        let peer_key = ConversationKey::derive(bob.secret_key(), &alice.public_key()).unwrap();
        assert_eq!(decrypt(&payload, &peer_key).unwrap(), plaintext);
    }

    #[test]
    fn tampering_is_detected() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let key = ConversationKey::derive(alice.secret_key(), &bob.public_key()).unwrap();

        let payload = encrypt("secret", &key).unwrap();
        let mut bytes = BASE64.decode(&payload).unwrap();
        let flip_at = bytes.len() / 2;
        bytes[flip_at] ^= 0x01;
        let tampered = BASE64.encode(bytes);
        assert!(matches!(
            decrypt(&tampered, &key),
            Err(Nip44Error::MacMismatch)
        ));
    }
}
