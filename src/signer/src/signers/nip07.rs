//! NIP-07: the signer worker cannot see the injected `window.nostr` object,
//! so every op goes through the main thread. The bridge posts
//! `ExtensionRequest { id, op, payload }` on the main-thread port and
//! completes the matching future when `ExtensionResponse { id, ... }` comes
//! back.

use crate::signers::{SignerError, SignerResult};
use futures::FutureExt;
use futures_channel::oneshot;
use gloo_timers::future::TimeoutFuture;
use shared::types::messages::{self, SignerToMain};
use shared::Port;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::warn;

/// How long the main thread gets to answer before the op fails.
const EXTENSION_TIMEOUT_MS: u32 = 15_000;

pub struct ExtensionBridge {
    main: Rc<Port>,
    pending: RefCell<HashMap<u64, oneshot::Sender<Result<String, String>>>>,
    next_id: Cell<u64>,
}

impl ExtensionBridge {
    pub fn new(main: Rc<Port>) -> Rc<Self> {
        Rc::new(Self {
            main,
            pending: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
        })
    }

    /// Complete a pending op; called by the worker loop on
    /// `ExtensionResponse`.
    pub fn resolve(&self, id: u64, ok: bool, result: String, error: String) {
        let Some(tx) = self.pending.borrow_mut().remove(&id) else {
            warn!(id, "extension response for unknown request");
            return;
        };
        let outcome = if ok { Ok(result) } else { Err(error) };
        let _ = tx.send(outcome);
    }

    pub async fn call(&self, op: &str, payload: String) -> SignerResult<String> {
        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1));

        let (tx, rx) = oneshot::channel();
        self.pending.borrow_mut().insert(id, tx);

        let request = SignerToMain::ExtensionRequest {
            id,
            op: op.to_string(),
            payload,
        };
        let bytes = messages::encode(&request)
            .map_err(|e| SignerError::Extension(format!("encode: {}", e)))?;
        if let Err(e) = self.main.send(&bytes) {
            self.pending.borrow_mut().remove(&id);
            return Err(SignerError::Extension(format!("port send: {:?}", e)));
        }

        let mut response = rx.fuse();
        let mut timeout = TimeoutFuture::new(EXTENSION_TIMEOUT_MS).fuse();
        futures::select! {
            outcome = response => match outcome {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(error)) => Err(SignerError::Extension(error)),
                Err(_) => Err(SignerError::Extension("bridge canceled".to_string())),
            },
            _ = timeout => {
                self.pending.borrow_mut().remove(&id);
                Err(SignerError::Timeout)
            }
        }
    }
}

/// NIP-07 signer: every op delegates to the extension bridge.
pub struct Nip07Signer {
    bridge: Rc<ExtensionBridge>,
}

impl Nip07Signer {
    pub fn new(bridge: Rc<ExtensionBridge>) -> Self {
        Self { bridge }
    }

    pub async fn get_public_key(&self) -> SignerResult<String> {
        self.bridge.call("getPublicKey", String::new()).await
    }

    /// Returns the signed event JSON produced by the extension.
    pub async fn sign_event(&self, template_json: &str) -> SignerResult<String> {
        self.bridge.call("signEvent", template_json.to_string()).await
    }

    pub async fn nip04_encrypt(&self, peer: &str, plaintext: &str) -> SignerResult<String> {
        self.bridge
            .call("nip04Encrypt", cipher_payload(peer, plaintext))
            .await
    }

    pub async fn nip04_decrypt(&self, peer: &str, ciphertext: &str) -> SignerResult<String> {
        self.bridge
            .call("nip04Decrypt", cipher_payload(peer, ciphertext))
            .await
    }

    pub async fn nip44_encrypt(&self, peer: &str, plaintext: &str) -> SignerResult<String> {
        self.bridge
            .call("nip44Encrypt", cipher_payload(peer, plaintext))
            .await
    }

    pub async fn nip44_decrypt(&self, peer: &str, ciphertext: &str) -> SignerResult<String> {
        self.bridge
            .call("nip44Decrypt", cipher_payload(peer, ciphertext))
            .await
    }
}

fn cipher_payload(peer: &str, content: &str) -> String {
    serde_json::json!({ "pubkey": peer, "content": content }).to_string()
}
