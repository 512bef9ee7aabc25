//! Minimal Nostr event primitives. The core only routes events; kind-specific
//! content decoding lives outside this workspace.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::TypesError;

macro_rules! hex32 {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn from_hex(s: &str) -> Result<Self, TypesError> {
                let bytes = hex::decode(s)?;
                let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    TypesError::InvalidFormat(format!(
                        "expected 32 bytes, got {}",
                        bytes.len()
                    ))
                })?;
                Ok(Self(arr))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn to_bytes(&self) -> [u8; 32] {
                self.0
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(D::Error::custom)
            }
        }
    };
}

hex32!(EventId);
hex32!(PublicKey);

#[derive(Clone, Copy)]
pub struct SecretKey(pub [u8; 32]);

impl SecretKey {
    pub fn from_hex(s: &str) -> Result<Self, TypesError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| TypesError::InvalidFormat(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

// Deliberately opaque so key material does not leak through logs.
impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// A signed Nostr event as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    pub fn as_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(json: &str) -> Result<Self, TypesError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Value of the first tag with the given single-character key, if any.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() >= 2 && t[0] == key)
            .map(|t| t[1].as_str())
    }
}

/// An unsigned event template handed to a signer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub kind: u16,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
}

/// A secp256k1 keypair. Derivation requires the 'crypto' feature.
#[cfg(feature = "crypto")]
#[derive(Clone)]
pub struct Keys {
    secret: SecretKey,
    public: PublicKey,
}

#[cfg(feature = "crypto")]
impl Keys {
    pub fn parse(secret_hex: &str) -> Result<Self, TypesError> {
        let secret = SecretKey::from_hex(secret_hex)?;
        let public = crate::nostr_crypto::derive_public_key(&secret)?;
        Ok(Self { secret, public })
    }

    pub fn generate() -> Self {
        let secret = crate::nostr_crypto::generate_secret_key();
        let public = crate::nostr_crypto::derive_public_key(&secret)
            .expect("freshly generated key is valid");
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_json_roundtrip_keeps_hex_fields() {
        let json = r#"{"id":"5c83da77af1dec6d7289834998ad7aafbd9e2191396d75ec3cc27f5a77226f36","pubkey":"f86537083941ad2de65baacf405463b57d27366c7930b460e00277bb51f5a03c","created_at":1700000000,"kind":1,"tags":[["p","f86537083941ad2de65baacf405463b57d27366c7930b460e00277bb51f5a03c"]],"content":"hi","sig":"00"}"#;
        let event = Event::from_json(json).unwrap();
        assert_eq!(event.kind, 1);
        assert_eq!(
            event.id.to_hex(),
            "5c83da77af1dec6d7289834998ad7aafbd9e2191396d75ec3cc27f5a77226f36"
        );
        assert_eq!(event.tag_value("p"), Some(event.pubkey.to_hex()).as_deref());

        let back = Event::from_json(&event.as_json()).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.content, event.content);
    }

    #[test]
    fn rejects_short_hex() {
        assert!(EventId::from_hex("abcd").is_err());
    }
}
