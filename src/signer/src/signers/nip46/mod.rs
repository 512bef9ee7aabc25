//! NIP-46 remote signer client.
//!
//! RPC requests ride encrypted kind-24133 events published through the
//! Connections worker; replies come back on a dedicated REQ subscription
//! whose frames the worker loop feeds into `handle_frame`. Calls correlate
//! by JSON-RPC id against a pending map and time out after 20 s.

use gloo_timers::future::TimeoutFuture;
use serde_json::{json, Value};
use shared::types::{Event, Keys, PublicKey};
use shared::{wire, Port};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, info, warn};

use crate::nip44::{self, ConversationKey};
use crate::signers::{SignerError, SignerResult};

pub mod config;
pub mod transport;

pub use config::Nip46Config;
use transport::Transport;

const RESPONSE_TIMEOUT_MS: f64 = 20_000.0;

pub struct Nip46Signer {
    cfg: Nip46Config,
    client_keys: Keys,
    client_pubkey_hex: String,
    sub_id: String,
    id_counter: Cell<u64>,
    pending: Rc<RefCell<HashMap<String, Result<String, String>>>>,
    user_pubkey: RefCell<Option<String>>,
    discovered_remote_pubkey: Rc<RefCell<Option<String>>>,
    transport: Transport,
    on_discovery: RefCell<Option<Rc<dyn Fn(String)>>>,
}

impl Nip46Signer {
    pub fn new(cfg: Nip46Config, to_connections: Rc<Port>, client_keys: Option<Keys>) -> Self {
        let client_keys = client_keys.unwrap_or_else(Keys::generate);
        let client_pubkey_hex = client_keys.public_key().to_hex();
        // Relays commonly cap subscription ids at 64 chars:
        // "n46:" (4) + 60 chars of the client pubkey.
        let sub_id = format!("n46:{}", &client_pubkey_hex[..60]);

        let transport = Transport::new(
            to_connections,
            cfg.relays.clone(),
            cfg.app_name.clone(),
            client_keys.clone(),
        );

        Self {
            cfg,
            client_keys,
            client_pubkey_hex,
            sub_id,
            id_counter: Cell::new(1),
            pending: Rc::new(RefCell::new(HashMap::new())),
            user_pubkey: RefCell::new(None),
            discovered_remote_pubkey: Rc::new(RefCell::new(None)),
            transport,
            on_discovery: RefCell::new(None),
        }
    }

    pub fn start(&self, on_discovery: Option<Rc<dyn Fn(String)>>) {
        *self.on_discovery.borrow_mut() = on_discovery;
        self.transport.open_req_subscription(&self.sub_id);
        info!(
            "nip46 started (sub_id={}, client={})",
            self.sub_id, self.client_pubkey_hex
        );
    }

    pub fn close(&self) {
        self.transport.send_close(&self.sub_id);
    }

    pub fn get_discovered_remote_pubkey(&self) -> Option<String> {
        self.discovered_remote_pubkey.borrow().clone()
    }

    /// Canonical bunker URL for a discovered remote signer, so the session
    /// can be persisted and restored in bunker mode.
    pub fn get_bunker_url(&self) -> Option<String> {
        let remote = self.discovered_remote_pubkey.borrow().clone()?;
        let mut url = format!("bunker://{}?", remote);
        for (i, relay) in self.cfg.relays.iter().enumerate() {
            if i > 0 {
                url.push('&');
            }
            let encoded: String = js_sys::encode_uri_component(relay).into();
            url.push_str(&format!("relay={}", encoded));
        }
        if let Some(secret) = &self.cfg.expected_secret {
            url.push_str(&format!("&secret={}", secret));
        }
        Some(url)
    }

    /// One inbound relay frame for our subscription, as (url, raw text).
    pub fn handle_frame(&self, _url: &str, raw: &str) {
        let Some(incoming) = wire::classify_incoming(raw) else {
            return;
        };
        if incoming.kind != wire::IncomingKind::Event || incoming.sub_id != Some(&self.sub_id[..]) {
            return;
        }
        let Some(event_json) = incoming.payload else {
            return;
        };
        let event = match Event::from_json(event_json) {
            Ok(e) => e,
            Err(e) => {
                warn!("nip46: undecodable RPC event: {}", e);
                return;
            }
        };

        // In QR mode the remote pubkey is whoever answers; otherwise decrypt
        // against the configured/discovered remote.
        let peer_hex = event.pubkey.to_hex();
        let plaintext = match self.decrypt_from(&peer_hex, &event.content) {
            Ok(p) => p,
            Err(e) => {
                warn!("nip46: failed to decrypt RPC payload: {}", e);
                return;
            }
        };

        let rpc: Value = match serde_json::from_str(&plaintext) {
            Ok(v) => v,
            Err(e) => {
                warn!("nip46: RPC payload is not JSON: {}", e);
                return;
            }
        };
        let id = rpc.get("id").and_then(Value::as_str).unwrap_or("");
        let result = rpc.get("result").and_then(Value::as_str).unwrap_or("");
        let error = rpc.get("error").and_then(Value::as_str).unwrap_or("");

        // A connect ack carrying the expected secret identifies the remote
        // signer in QR mode.
        let is_ack = result == "ack"
            || self
                .cfg
                .expected_secret
                .as_deref()
                .is_some_and(|s| s == result);
        if is_ack && self.discovered_remote_pubkey.borrow().is_none() {
            *self.discovered_remote_pubkey.borrow_mut() = Some(peer_hex.clone());
            info!(remote = %peer_hex, "nip46: remote signer discovered");
            if let Some(cb) = self.on_discovery.borrow().clone() {
                if let Some(url) = self.get_bunker_url() {
                    cb(url);
                }
            }
        }

        if id.is_empty() {
            debug!("nip46: RPC frame without id ignored");
            return;
        }
        let outcome = if error.is_empty() {
            Ok(result.to_string())
        } else {
            Err(error.to_string())
        };
        self.pending.borrow_mut().insert(id.to_string(), outcome);
    }

    pub async fn connect(&self) -> SignerResult<String> {
        let mut params = vec![self.remote_pubkey_or_empty()];
        if let Some(secret) = &self.cfg.expected_secret {
            params.push(secret.clone());
        }
        self.rpc_call("connect", params).await
    }

    pub async fn get_public_key(&self) -> SignerResult<String> {
        if let Some(pk) = self.user_pubkey.borrow().as_ref() {
            return Ok(pk.clone());
        }
        let result = self.rpc_call("get_public_key", vec![]).await?;
        *self.user_pubkey.borrow_mut() = Some(result.clone());
        Ok(result)
    }

    /// Returns the signed event JSON produced by the remote signer.
    pub async fn sign_event(&self, template_json: &str) -> SignerResult<String> {
        self.rpc_call("sign_event", vec![template_json.to_string()])
            .await
    }

    pub async fn nip04_encrypt(&self, peer: &str, plaintext: &str) -> SignerResult<String> {
        self.rpc_call("nip04_encrypt", vec![peer.to_string(), plaintext.to_string()])
            .await
    }

    pub async fn nip04_decrypt(&self, peer: &str, ciphertext: &str) -> SignerResult<String> {
        self.rpc_call("nip04_decrypt", vec![peer.to_string(), ciphertext.to_string()])
            .await
    }

    pub async fn nip44_encrypt(&self, peer: &str, plaintext: &str) -> SignerResult<String> {
        self.rpc_call("nip44_encrypt", vec![peer.to_string(), plaintext.to_string()])
            .await
    }

    pub async fn nip44_decrypt(&self, peer: &str, ciphertext: &str) -> SignerResult<String> {
        self.rpc_call("nip44_decrypt", vec![peer.to_string(), ciphertext.to_string()])
            .await
    }

    fn remote_pubkey_or_empty(&self) -> String {
        self.discovered_remote_pubkey
            .borrow()
            .clone()
            .unwrap_or_else(|| self.cfg.remote_signer_pubkey.clone())
    }

    async fn rpc_call(&self, method: &str, params: Vec<String>) -> SignerResult<String> {
        let remote = self.remote_pubkey_or_empty();
        if remote.is_empty() {
            return Err(SignerError::Remote(
                "remote signer pubkey not yet discovered".to_string(),
            ));
        }

        let id = self.next_id();
        let payload = json!({
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string();

        let encrypted = self.encrypt_for(&remote, &payload)?;
        self.transport
            .publish_rpc_event(&encrypted, &remote, unix_time())?;

        self.await_response(&id).await
    }

    async fn await_response(&self, id: &str) -> SignerResult<String> {
        let start = js_sys::Date::now();
        let mut sleep_ms: u32 = 8;
        let max_sleep: u32 = 256;

        loop {
            if let Some(done) = self.pending.borrow_mut().remove(id) {
                return done.map_err(SignerError::Remote);
            }
            if js_sys::Date::now() - start > RESPONSE_TIMEOUT_MS {
                return Err(SignerError::Timeout);
            }
            TimeoutFuture::new(sleep_ms).await;
            sleep_ms = (sleep_ms * 2).min(max_sleep);
        }
    }

    fn encrypt_for(&self, peer_hex: &str, plaintext: &str) -> SignerResult<String> {
        let key = self.conversation_key(peer_hex)?;
        nip44::encrypt(plaintext, &key).map_err(|e| SignerError::Crypto(e.to_string()))
    }

    fn decrypt_from(&self, peer_hex: &str, ciphertext: &str) -> SignerResult<String> {
        let key = self.conversation_key(peer_hex)?;
        nip44::decrypt(ciphertext, &key).map_err(|e| SignerError::Crypto(e.to_string()))
    }

    fn conversation_key(&self, peer_hex: &str) -> SignerResult<ConversationKey> {
        let peer =
            PublicKey::from_hex(peer_hex).map_err(|e| SignerError::Other(e.to_string()))?;
        ConversationKey::derive(self.client_keys.secret_key(), &peer)
            .map_err(|e| SignerError::Crypto(e.to_string()))
    }

    pub fn sub_id(&self) -> &str {
        &self.sub_id
    }

    fn next_id(&self) -> String {
        let c = self.id_counter.get().wrapping_add(1);
        self.id_counter.set(c);
        format!("{}-{}", c, js_sys::Date::now() as u64)
    }
}

fn unix_time() -> u64 {
    (js_sys::Date::now() / 1000.0) as u64
}
