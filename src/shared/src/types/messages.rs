//! Control-plane message unions. Every frame crossing a worker boundary is a
//! MessagePack-encoded tagged union from this module; payloads the core does
//! not interpret (filters, templates, raw relay frames) travel as JSON
//! strings inside them.

use serde::{Deserialize, Serialize};

use super::network::{Envelope, RelayStatusUpdate, Request, SubscriptionOptions};
use super::nostr::{Event, Template};

/// UI thread -> Parser worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MainToWorkerMessage {
    Subscribe {
        subscription_id: String,
        requests: Vec<Request>,
        options: SubscriptionOptions,
    },
    Unsubscribe {
        subscription_id: String,
    },
    Publish {
        publish_id: String,
        template: Template,
        relays: Vec<String>,
    },
    SignEvent {
        template: Template,
    },
    GetPublicKey,
    SetSigner {
        spec: SignerSpec,
    },
}

/// Which signer backend to activate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SignerSpec {
    PrivateKey { secret: String },
    Nip07,
    Nip46Bunker { url: String, client_secret: Option<String> },
    Nip46Qr { url: String, client_secret: Option<String> },
}

/// Records written into subscription/publish buffers and control responses
/// posted back to the UI thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerToMainMessage {
    /// A raw relay frame for one subscription.
    Event {
        sub_id: String,
        relay: String,
        raw: String,
    },
    /// A cached event answered locally.
    CachedEvent { sub_id: String, json: String },
    /// One relay finished its stored events.
    Eose { sub_id: String, relay: String },
    /// The whole subscription finished its initial phase.
    Eoce { sub_id: String },
    PublishUpdate {
        publish_id: String,
        update: RelayStatusUpdate,
    },
    SignedEvent { json: String },
    Pubkey { pubkey: String },
    BufferFull,
}

/// One classified inbound frame, Connections -> Parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayFrame {
    pub sub_id: String,
    pub url: String,
    pub raw: String,
}

/// Parser -> Cache commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheCommand {
    /// Store parsed events for later local answers.
    Ingest { events: Vec<Event> },
    /// Answer a subscription from the local store.
    Query {
        sub_id: String,
        requests: Vec<Request>,
    },
    /// Relay an outbound envelope to Connections untouched.
    Forward { envelope: Envelope },
    /// A subscription went away; release its bookkeeping.
    Close { sub_id: String },
}

/// Cache -> Parser replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheReply {
    Events { sub_id: String, events: Vec<Event> },
}

/// Signer RPC ops. Payload semantics depend on the op; see `SignerRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignerOp {
    GetPubkey,
    SignEvent,
    Nip04Encrypt,
    Nip04Decrypt,
    Nip44Encrypt,
    Nip44Decrypt,
    /// NIP-46 handshake; no-op for other variants.
    Connect,
    SetPrivateKey,
    SetNip07,
    SetNip46Bunker,
    SetNip46Qr,
    ClearSigner,
}

/// A request to the Signer worker, correlated by `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerRequest {
    pub request_id: u64,
    pub op: SignerOp,
    /// Op-specific JSON: an event template, a secret, a bunker URL, plaintext.
    pub payload: String,
    /// Counterparty pubkey for the encryption ops; empty otherwise.
    pub peer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerResponse {
    pub request_id: u64,
    pub ok: bool,
    pub result: String,
    pub error: String,
}

impl SignerResponse {
    pub fn ok(request_id: u64, result: String) -> Self {
        Self {
            request_id,
            ok: true,
            result,
            error: String::new(),
        }
    }

    pub fn err(request_id: u64, error: String) -> Self {
        Self {
            request_id,
            ok: false,
            result: String::new(),
            error,
        }
    }
}

/// Signer worker -> UI thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SignerToMain {
    Response(SignerResponse),
    /// Main-thread capability escape hatch: the signer cannot reach the
    /// injected extension object itself.
    ExtensionRequest { id: u64, op: String, payload: String },
    ExtensionResponse { id: u64, ok: bool, result: String, error: String },
    /// A QR-initiated session learned its canonical bunker URL.
    BunkerDiscovered { url: String },
}

/// UI thread -> Signer worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MainToSigner {
    Request(SignerRequest),
    ExtensionResponse { id: u64, ok: bool, result: String, error: String },
}

/// Encode a control message for a port or buffer record.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, super::TypesError> {
    rmp_serde::to_vec_named(value).map_err(|e| super::TypesError::Serde(e.to_string()))
}

/// Decode a control message received from a port or buffer record.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, super::TypesError> {
    rmp_serde::from_slice(bytes).map_err(|e| super::TypesError::Serde(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frames_survive_encode_decode() {
        let msg = MainToWorkerMessage::Subscribe {
            subscription_id: "feed".into(),
            requests: vec![Request {
                kinds: Some(vec![1]),
                relays: vec!["wss://relay.example".into()],
                ..Default::default()
            }],
            options: SubscriptionOptions {
                close_on_eose: true,
                ..Default::default()
            },
        };
        let bytes = encode(&msg).unwrap();
        match decode::<MainToWorkerMessage>(&bytes).unwrap() {
            MainToWorkerMessage::Subscribe {
                subscription_id,
                requests,
                options,
            } => {
                assert_eq!(subscription_id, "feed");
                assert_eq!(requests.len(), 1);
                assert!(options.close_on_eose);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn signer_response_constructors() {
        let ok = SignerResponse::ok(7, "pubkey".into());
        assert!(ok.ok && ok.error.is_empty());
        let err = SignerResponse::err(7, "no signer".into());
        assert!(!err.ok && err.result.is_empty());
    }
}
