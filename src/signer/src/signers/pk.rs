//! Local private-key signer: derives the pubkey, computes event ids and
//! Schnorr signatures, and offers NIP-44 conversation encryption.

use crate::nip44::{self, ConversationKey};
use crate::signers::{SignerError, SignerResult};
use shared::nostr_crypto;
use shared::types::{Event, EventId, Keys, PublicKey, Template};

pub struct PrivateKeySigner {
    keys: Keys,
}

impl PrivateKeySigner {
    /// Accepts a 64-character hex secret.
    pub fn new(secret_hex: &str) -> SignerResult<Self> {
        let keys =
            Keys::parse(secret_hex).map_err(|e| SignerError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self { keys })
    }

    pub fn get_public_key(&self) -> String {
        self.keys.public_key().to_hex()
    }

    /// Sign an event template (JSON), returning the full signed event JSON.
    pub fn sign_event(&self, template_json: &str) -> SignerResult<String> {
        let template: Template = serde_json::from_str(template_json)
            .map_err(|e| SignerError::Other(format!("invalid template: {}", e)))?;

        let pubkey = self.keys.public_key();
        let created_at = template
            .created_at
            .unwrap_or_else(|| (js_sys::Date::now() / 1000.0) as u64);

        let id_hex = nostr_crypto::compute_event_id(
            &pubkey,
            created_at,
            template.kind,
            &template.tags,
            &template.content,
        );
        let id = EventId::from_hex(&id_hex).map_err(|e| SignerError::Crypto(e.to_string()))?;
        let sig = nostr_crypto::sign_event_id(self.keys.secret_key(), &id)
            .map_err(|e| SignerError::Crypto(e.to_string()))?;

        let event = Event {
            id,
            pubkey,
            created_at,
            kind: template.kind,
            tags: template.tags,
            content: template.content,
            sig,
        };
        Ok(event.as_json())
    }

    pub fn nip44_encrypt(&self, peer_hex: &str, plaintext: &str) -> SignerResult<String> {
        let key = self.conversation_key(peer_hex)?;
        nip44::encrypt(plaintext, &key).map_err(|e| SignerError::Crypto(e.to_string()))
    }

    pub fn nip44_decrypt(&self, peer_hex: &str, ciphertext: &str) -> SignerResult<String> {
        let key = self.conversation_key(peer_hex)?;
        nip44::decrypt(ciphertext, &key).map_err(|e| SignerError::Crypto(e.to_string()))
    }

    fn conversation_key(&self, peer_hex: &str) -> SignerResult<ConversationKey> {
        let peer =
            PublicKey::from_hex(peer_hex).map_err(|e| SignerError::Other(e.to_string()))?;
        ConversationKey::derive(self.keys.secret_key(), &peer)
            .map_err(|e| SignerError::Crypto(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_signer() -> PrivateKeySigner {
        let keys = Keys::generate();
        PrivateKeySigner::new(&keys.secret_key().to_hex()).unwrap()
    }

    #[test]
    fn rejects_malformed_secrets() {
        assert!(PrivateKeySigner::new("nothex").is_err());
        assert!(PrivateKeySigner::new("abcd").is_err());
    }

    #[test]
    fn pubkey_is_stable() {
        let keys = Keys::generate();
        let signer = PrivateKeySigner::new(&keys.secret_key().to_hex()).unwrap();
        assert_eq!(signer.get_public_key(), keys.public_key().to_hex());
    }

    #[test]
    fn signed_event_verifies() {
        let signer = test_signer();
        let template = r#"{"kind":1,"content":"hello","tags":[],"created_at":1700000000}"#;
        let signed = signer.sign_event(template).unwrap();
        let event = Event::from_json(&signed).unwrap();
        assert_eq!(event.kind, 1);
        assert_eq!(event.created_at, 1_700_000_000);
        nostr_crypto::verify_event_signature(&event).unwrap();
    }

    #[test]
    fn nip44_roundtrip_between_two_signers() {
        let a_keys = Keys::generate();
        let b_keys = Keys::generate();
        let a = PrivateKeySigner::new(&a_keys.secret_key().to_hex()).unwrap();
        let b = PrivateKeySigner::new(&b_keys.secret_key().to_hex()).unwrap();

        let ct = a
            .nip44_encrypt(&b_keys.public_key().to_hex(), "between us")
            .unwrap();
        let pt = b
            .nip44_decrypt(&a_keys.public_key().to_hex(), &ct)
            .unwrap();
        assert_eq!(pt, "between us");
    }
}
