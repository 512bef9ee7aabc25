//! Type definitions shared across the worker crates: event primitives,
//! request/option shapes and the control-plane message unions.

pub mod messages;
pub mod network;
pub mod nostr;

pub use messages::*;
pub use network::*;
pub use nostr::{Event, EventId, PublicKey, SecretKey, Template};

#[cfg(feature = "crypto")]
pub use nostr::Keys;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TypesError {
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("missing field: {0}")]
    MissingField(String),

    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("serialization error: {0}")]
    Serde(String),
}

impl From<serde_json::Error> for TypesError {
    fn from(err: serde_json::Error) -> Self {
        TypesError::Serde(err.to_string())
    }
}

impl From<TypesError> for wasm_bindgen::JsValue {
    fn from(err: TypesError) -> Self {
        wasm_bindgen::JsValue::from_str(&err.to_string())
    }
}
