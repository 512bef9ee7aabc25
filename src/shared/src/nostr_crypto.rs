//! Event signing primitives: id computation, Schnorr signatures, key
//! derivation. Only compiled with the `crypto` feature.

use k256::schnorr::signature::{Signer, Verifier};
use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::types::{Event, EventId, PublicKey, SecretKey, TypesError};

type Result<T> = std::result::Result<T, TypesError>;

/// The serialization an event id commits to: the JSON array
/// `[0, pubkey, created_at, kind, tags, content]` with no whitespace.
/// Letting the JSON encoder do the escaping keeps it byte-compatible with
/// the `JSON.stringify` canonical form relays verify against.
fn canonical_form(
    pubkey: &PublicKey,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    serde_json::json!([0, pubkey.to_hex(), created_at, kind, tags, content]).to_string()
}

/// Compute the event id: SHA-256 over the canonical serialization.
pub fn compute_event_id(
    pubkey: &PublicKey,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    let digest = Sha256::digest(canonical_form(pubkey, created_at, kind, tags, content));
    hex::encode(digest)
}

fn signing_key(secret: &SecretKey) -> Result<SigningKey> {
    SigningKey::from_bytes(&secret.0)
        .map_err(|_| TypesError::InvalidFormat("invalid secret key".to_string()))
}

/// Sign an event id with a secret key, returning the signature hex.
pub fn sign_event_id(secret_key: &SecretKey, event_id: &EventId) -> Result<String> {
    let signature = signing_key(secret_key)?.sign(&event_id.0);
    Ok(hex::encode(signature.to_bytes()))
}

/// Verify an event's signature against its id and pubkey.
pub fn verify_event_signature(event: &Event) -> Result<()> {
    if event.sig.is_empty() {
        return Err(TypesError::MissingField("sig".to_string()));
    }
    let verifying_key = VerifyingKey::from_bytes(&event.pubkey.0)
        .map_err(|_| TypesError::InvalidFormat("invalid public key".to_string()))?;
    let signature = Signature::try_from(hex::decode(&event.sig)?.as_slice())
        .map_err(|_| TypesError::InvalidFormat("invalid signature format".to_string()))?;

    verifying_key
        .verify(&event.id.0, &signature)
        .map_err(|_| TypesError::InvalidFormat("signature verification failed".to_string()))
}

/// Derive the x-only public key from a secret key.
pub fn derive_public_key(secret_key: &SecretKey) -> Result<PublicKey> {
    Ok(PublicKey(
        signing_key(secret_key)?.verifying_key().to_bytes().into(),
    ))
}

/// Generate a fresh random secret key.
pub fn generate_secret_key() -> SecretKey {
    use k256::elliptic_curve::rand_core::OsRng;

    SecretKey(SigningKey::random(&mut OsRng).to_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Keys;

    #[test]
    fn canonical_form_matches_the_commitment_layout() {
        let pubkey = PublicKey([0x11; 32]);
        let tags = vec![vec!["e".to_string(), "abc".to_string()]];
        let form = canonical_form(&pubkey, 7, 1, &tags, "hi");
        assert_eq!(
            form,
            format!(r#"[0,"{}",7,1,[["e","abc"]],"hi"]"#, pubkey.to_hex())
        );
    }

    #[test]
    fn awkward_content_is_escaped_not_mangled() {
        let pubkey = PublicKey([0x22; 32]);
        let form = canonical_form(&pubkey, 1, 1, &[], "say \"hi\"\nnow");
        assert!(form.contains(r#"say \"hi\"\nnow"#));

        let id = compute_event_id(&pubkey, 1, 1, &[], "say \"hi\"\nnow");
        assert_eq!(id.len(), 64);
    }

    #[test]
    fn sign_then_verify_roundtrips() {
        let keys = Keys::generate();
        let tags = vec![vec!["t".to_string(), "test".to_string()]];
        let id_hex = compute_event_id(&keys.public_key(), 1_700_000_000, 1, &tags, "hello");
        let id = EventId::from_hex(&id_hex).unwrap();
        let sig = sign_event_id(keys.secret_key(), &id).unwrap();

        let event = Event {
            id,
            pubkey: keys.public_key(),
            created_at: 1_700_000_000,
            kind: 1,
            tags,
            content: "hello".to_string(),
            sig,
        };
        verify_event_signature(&event).unwrap();
    }

    #[test]
    fn id_depends_on_content() {
        let keys = Keys::generate();
        let a = compute_event_id(&keys.public_key(), 1, 1, &[], "a");
        let b = compute_event_id(&keys.public_key(), 1, 1, &[], "b");
        assert_ne!(a, b);
    }
}
