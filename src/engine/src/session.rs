//! Signer session orchestration on the UI thread.
//!
//! Setting a signer does not authenticate it: the chosen variant is held as a
//! pending session while the worker answers `get_pubkey`; only a successful
//! answer persists the session under that pubkey and raises the auth event.
//! Sessions restore from localStorage on construction, and a QR-discovered
//! bunker URL rewrites the pending record so the session restores in bunker
//! mode next time.

use futures::StreamExt;
use futures_channel::oneshot;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use shared::types::messages::{
    self, MainToSigner, SignerOp, SignerRequest, SignerResponse, SignerToMain,
};
use shared::Port;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{info, warn};
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::{spawn_local, JsFuture};

pub const ACCOUNTS_KEY: &str = "nostr_signer_accounts";
pub const ACTIVE_PUBKEY_KEY: &str = "nostr_active_pubkey";

/// One persisted signer session: how to sign for a pubkey.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
}

/// A QR session that learned its bunker URL persists as a bunker session.
pub fn rewrite_for_bunker(record: &SessionRecord, bunker_url: &str) -> SessionRecord {
    if record.kind != "nip46_qr" {
        return record.clone();
    }
    let client_secret = record
        .payload
        .get("clientSecret")
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    SessionRecord {
        kind: "nip46_bunker".to_string(),
        payload: serde_json::json!({ "url": bunker_url, "clientSecret": client_secret }),
    }
}

pub fn parse_accounts(json: &str) -> FxHashMap<String, SessionRecord> {
    serde_json::from_str(json).unwrap_or_default()
}

pub fn serialize_accounts(accounts: &FxHashMap<String, SessionRecord>) -> String {
    serde_json::to_string(accounts).unwrap_or_else(|_| "{}".to_string())
}

/// Request/response link to the signer worker over the UI control port.
struct SignerLink {
    port: Rc<Port>,
    pending: RefCell<HashMap<u64, oneshot::Sender<SignerResponse>>>,
    next_id: Cell<u64>,
}

impl SignerLink {
    fn new(port: Rc<Port>) -> Self {
        Self {
            port,
            pending: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
        }
    }

    fn resolve(&self, response: SignerResponse) {
        let Some(tx) = self.pending.borrow_mut().remove(&response.request_id) else {
            // request_id 0 marks fire-and-forget sends
            if response.request_id != 0 {
                warn!(rid = response.request_id, "signer response without caller");
            }
            return;
        };
        let _ = tx.send(response);
    }

    async fn call(&self, op: SignerOp, payload: String) -> Result<String, String> {
        let rid = self.next_id.get();
        self.next_id.set(rid.wrapping_add(1));

        let (tx, rx) = oneshot::channel();
        self.pending.borrow_mut().insert(rid, tx);

        let request = MainToSigner::Request(SignerRequest {
            request_id: rid,
            op,
            payload,
            peer: String::new(),
        });
        let bytes = messages::encode(&request).map_err(|e| e.to_string())?;
        if let Err(e) = self.port.send(&bytes) {
            self.pending.borrow_mut().remove(&rid);
            return Err(format!("signer port send failed: {:?}", e));
        }

        match rx.await {
            Ok(response) if response.ok => Ok(response.result),
            Ok(response) => Err(response.error),
            Err(_) => Err("signer link canceled".to_string()),
        }
    }
}

pub struct SignerSession {
    link: SignerLink,
    port: Rc<Port>,
    pending_session: RefCell<Option<SessionRecord>>,
    active_pubkey: RefCell<Option<String>>,
    auth_listeners: RefCell<Vec<js_sys::Function>>,
}

impl SignerSession {
    /// Wire the session to the signer control port and replay any persisted
    /// session.
    pub fn new(port: Port) -> Rc<Self> {
        let port = Rc::new(port);
        let session = Rc::new(Self {
            link: SignerLink::new(port.clone()),
            port: port.clone(),
            pending_session: RefCell::new(None),
            active_pubkey: RefCell::new(None),
            auth_listeners: RefCell::new(Vec::new()),
        });

        session.clone().spawn_receiver(port);

        let restoring = session.clone();
        spawn_local(async move {
            restoring.restore().await;
        });

        session
    }

    fn spawn_receiver(self: Rc<Self>, port: Rc<Port>) {
        let mut rx = port.receiver();
        spawn_local(async move {
            while let Some(bytes) = rx.next().await {
                match messages::decode::<SignerToMain>(&bytes) {
                    Ok(SignerToMain::Response(response)) => self.link.resolve(response),
                    Ok(SignerToMain::ExtensionRequest { id, op, payload }) => {
                        let port = self.port.clone();
                        spawn_local(async move {
                            handle_extension_request(port, id, &op, &payload).await;
                        });
                    }
                    Ok(SignerToMain::ExtensionResponse { .. }) => {
                        warn!("unexpected extension response on the UI side");
                    }
                    Ok(SignerToMain::BunkerDiscovered { url }) => {
                        self.on_bunker_discovered(&url);
                    }
                    Err(e) => warn!("undecodable signer message: {}", e),
                }
            }
            info!("signer session receiver ended");
        });
    }

    pub fn get_active_pubkey(&self) -> Option<String> {
        self.active_pubkey.borrow().clone()
    }

    pub fn add_auth_listener(&self, listener: js_sys::Function) {
        self.auth_listeners.borrow_mut().push(listener);
    }

    /// Activate a signer variant. On success the session is persisted under
    /// the authenticated pubkey and the pubkey is returned.
    pub async fn set_signer(
        &self,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<String, String> {
        let (op, op_payload) = match kind {
            "privkey" => (
                SignerOp::SetPrivateKey,
                payload.as_str().unwrap_or_default().to_string(),
            ),
            "nip07" => (SignerOp::SetNip07, String::new()),
            "nip46_bunker" => (SignerOp::SetNip46Bunker, payload.to_string()),
            "nip46_qr" => (SignerOp::SetNip46Qr, payload.to_string()),
            other => return Err(format!("unknown signer type: {}", other)),
        };

        *self.pending_session.borrow_mut() = Some(SessionRecord {
            kind: kind.to_string(),
            payload,
        });

        self.link.call(op, op_payload).await?;

        // NIP-46 sessions need the handshake before the pubkey is knowable.
        if kind.starts_with("nip46") {
            self.link.call(SignerOp::Connect, String::new()).await?;
        }

        // Authentication gate: no pubkey, no saved session.
        let pubkey = match self.link.call(SignerOp::GetPubkey, String::new()).await {
            Ok(pk) => pk,
            Err(e) => {
                *self.pending_session.borrow_mut() = None;
                return Err(e);
            }
        };

        self.persist(&pubkey);
        *self.active_pubkey.borrow_mut() = Some(pubkey.clone());
        self.dispatch_auth(Some(&pubkey));
        Ok(pubkey)
    }

    /// Drop the active session, keeping other stored accounts intact.
    pub fn logout(&self) {
        *self.pending_session.borrow_mut() = None;
        *self.active_pubkey.borrow_mut() = None;
        if let Some(storage) = local_storage() {
            let _ = storage.remove_item(ACTIVE_PUBKEY_KEY);
        }
        // Fire-and-forget clear; request_id 0 expects no reply routing.
        let request = MainToSigner::Request(SignerRequest {
            request_id: 0,
            op: SignerOp::ClearSigner,
            payload: String::new(),
            peer: String::new(),
        });
        if let Ok(bytes) = messages::encode(&request) {
            let _ = self.port.send(&bytes);
        }
        self.dispatch_auth(None);
    }

    /// Delete the active account's stored session, then switch to any
    /// remaining account or log out entirely.
    pub async fn remove_account(&self) {
        let Some(current) = self.get_active_pubkey() else {
            return;
        };

        let mut accounts = load_accounts();
        accounts.remove(&current);
        store_accounts(&accounts);

        if let Some((pubkey, record)) = accounts.into_iter().next() {
            info!(pubkey = %pubkey, "switching to remaining account");
            if let Err(e) = self.set_signer(&record.kind, record.payload).await {
                warn!("failed to switch account: {}", e);
                self.logout();
            }
        } else {
            self.logout();
        }
    }

    async fn restore(self: Rc<Self>) {
        let Some(storage) = local_storage() else {
            return;
        };
        let Ok(Some(pubkey)) = storage.get_item(ACTIVE_PUBKEY_KEY) else {
            return;
        };
        let accounts = load_accounts();
        let Some(record) = accounts.get(&pubkey) else {
            warn!(pubkey = %pubkey, "active pubkey without stored session");
            return;
        };

        info!(pubkey = %pubkey, kind = %record.kind, "restoring signer session");
        match self.set_signer(&record.kind, record.payload.clone()).await {
            Ok(restored) => {
                if restored != pubkey {
                    warn!(expected = %pubkey, got = %restored, "restored session pubkey mismatch");
                }
            }
            Err(e) => warn!("session restore failed: {}", e),
        }
    }

    fn persist(&self, pubkey: &str) {
        let Some(record) = self.pending_session.borrow_mut().take() else {
            return;
        };
        let mut accounts = load_accounts();
        accounts.insert(pubkey.to_string(), record);
        store_accounts(&accounts);
        if let Some(storage) = local_storage() {
            let _ = storage.set_item(ACTIVE_PUBKEY_KEY, pubkey);
        }
    }

    fn on_bunker_discovered(&self, bunker_url: &str) {
        info!("bunker discovered");
        let mut pending = self.pending_session.borrow_mut();
        if let Some(record) = pending.as_ref() {
            *pending = Some(rewrite_for_bunker(record, bunker_url));
            return;
        }
        drop(pending);

        // Discovery can also arrive after authentication; fix up the stored
        // record so the next restore uses bunker mode.
        if let Some(active) = self.get_active_pubkey() {
            let mut accounts = load_accounts();
            if let Some(record) = accounts.get(&active) {
                let rewritten = rewrite_for_bunker(record, bunker_url);
                accounts.insert(active, rewritten);
                store_accounts(&accounts);
            }
        }
    }

    fn dispatch_auth(&self, pubkey: Option<&str>) {
        let value = match pubkey {
            Some(pk) => JsValue::from_str(pk),
            None => JsValue::NULL,
        };
        for listener in self.auth_listeners.borrow().iter() {
            if let Err(e) = listener.call1(&JsValue::NULL, &value) {
                warn!("auth listener threw: {:?}", e);
            }
        }
    }
}

fn local_storage() -> Option<web_sys::Storage> {
    web_sys::window().and_then(|w| w.local_storage().ok().flatten())
}

fn load_accounts() -> FxHashMap<String, SessionRecord> {
    local_storage()
        .and_then(|s| s.get_item(ACCOUNTS_KEY).ok().flatten())
        .map(|json| parse_accounts(&json))
        .unwrap_or_default()
}

fn store_accounts(accounts: &FxHashMap<String, SessionRecord>) {
    if let Some(storage) = local_storage() {
        let _ = storage.set_item(ACCOUNTS_KEY, &serialize_accounts(accounts));
    }
}

/// Perform one extension op against the injected `window.nostr` capability
/// and answer the signer worker.
async fn handle_extension_request(port: Rc<Port>, id: u64, op: &str, payload: &str) {
    let outcome = call_extension(op, payload).await;
    let (ok, result, error) = match outcome {
        Ok(result) => (true, result, String::new()),
        Err(e) => (false, String::new(), e),
    };
    let response = MainToSigner::ExtensionResponse {
        id,
        ok,
        result,
        error,
    };
    match messages::encode(&response) {
        Ok(bytes) => {
            if let Err(e) = port.send(&bytes) {
                warn!("failed to answer extension request: {:?}", e);
            }
        }
        Err(e) => warn!("failed to encode extension response: {}", e),
    }
}

async fn call_extension(op: &str, payload: &str) -> Result<String, String> {
    let window = web_sys::window().ok_or("no window")?;
    let nostr = js_sys::Reflect::get(&window, &JsValue::from_str("nostr"))
        .map_err(|_| "window.nostr missing")?;
    if nostr.is_undefined() || nostr.is_null() {
        return Err("extension missing".to_string());
    }

    let promise = match op {
        "getPublicKey" => invoke0(&nostr, "getPublicKey")?,
        "signEvent" => {
            let template = js_sys::JSON::parse(payload)
                .map_err(|_| "invalid signEvent payload".to_string())?;
            invoke1(&nostr, "signEvent", &template)?
        }
        "nip04Encrypt" => invoke_cipher(&nostr, "nip04", "encrypt", payload)?,
        "nip04Decrypt" => invoke_cipher(&nostr, "nip04", "decrypt", payload)?,
        "nip44Encrypt" => invoke_cipher(&nostr, "nip44", "encrypt", payload)?,
        "nip44Decrypt" => invoke_cipher(&nostr, "nip44", "decrypt", payload)?,
        other => return Err(format!("unknown extension op: {}", other)),
    };

    let value = JsFuture::from(promise)
        .await
        .map_err(|e| format!("extension rejected: {:?}", e))?;

    if let Some(s) = value.as_string() {
        return Ok(s);
    }
    js_sys::JSON::stringify(&value)
        .map(|s| String::from(s))
        .map_err(|_| "unstringifiable extension result".to_string())
}

fn invoke0(target: &JsValue, name: &str) -> Result<js_sys::Promise, String> {
    let f = js_sys::Reflect::get(target, &JsValue::from_str(name))
        .map_err(|_| format!("nostr.{} missing", name))?
        .dyn_into::<js_sys::Function>()
        .map_err(|_| format!("nostr.{} is not a function", name))?;
    f.call0(target)
        .map_err(|_| format!("nostr.{} failed", name))?
        .dyn_into::<js_sys::Promise>()
        .map_err(|_| format!("nostr.{} did not return a promise", name))
}

fn invoke1(target: &JsValue, name: &str, arg: &JsValue) -> Result<js_sys::Promise, String> {
    let f = js_sys::Reflect::get(target, &JsValue::from_str(name))
        .map_err(|_| format!("nostr.{} missing", name))?
        .dyn_into::<js_sys::Function>()
        .map_err(|_| format!("nostr.{} is not a function", name))?;
    f.call1(target, arg)
        .map_err(|_| format!("nostr.{} failed", name))?
        .dyn_into::<js_sys::Promise>()
        .map_err(|_| format!("nostr.{} did not return a promise", name))
}

/// nip04/nip44 live on nested objects and take (pubkey, content).
fn invoke_cipher(
    nostr: &JsValue,
    namespace: &str,
    method: &str,
    payload: &str,
) -> Result<js_sys::Promise, String> {
    let parsed: serde_json::Value =
        serde_json::from_str(payload).map_err(|_| "invalid cipher payload".to_string())?;
    let pubkey = parsed
        .get("pubkey")
        .and_then(serde_json::Value::as_str)
        .ok_or("cipher payload missing pubkey")?;
    let content = parsed
        .get("content")
        .and_then(serde_json::Value::as_str)
        .ok_or("cipher payload missing content")?;

    let ns = js_sys::Reflect::get(nostr, &JsValue::from_str(namespace))
        .map_err(|_| format!("nostr.{} missing", namespace))?;
    let f = js_sys::Reflect::get(&ns, &JsValue::from_str(method))
        .map_err(|_| format!("nostr.{}.{} missing", namespace, method))?
        .dyn_into::<js_sys::Function>()
        .map_err(|_| format!("nostr.{}.{} is not a function", namespace, method))?;
    f.call2(&ns, &JsValue::from_str(pubkey), &JsValue::from_str(content))
        .map_err(|_| format!("nostr.{}.{} failed", namespace, method))?
        .dyn_into::<js_sys::Promise>()
        .map_err(|_| format!("nostr.{}.{} did not return a promise", namespace, method))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_sessions_rewrite_to_bunker() {
        let record = SessionRecord {
            kind: "nip46_qr".to_string(),
            payload: serde_json::json!({
                "url": "nostrconnect://abc?relay=wss%3A%2F%2Fr&secret=s",
                "clientSecret": "deadbeef"
            }),
        };
        let rewritten = rewrite_for_bunker(&record, "bunker://pk?relay=wss%3A%2F%2Fr&secret=s");
        assert_eq!(rewritten.kind, "nip46_bunker");
        assert_eq!(
            rewritten.payload["url"],
            "bunker://pk?relay=wss%3A%2F%2Fr&secret=s"
        );
        assert_eq!(rewritten.payload["clientSecret"], "deadbeef");
    }

    #[test]
    fn non_qr_sessions_are_untouched() {
        let record = SessionRecord {
            kind: "privkey".to_string(),
            payload: serde_json::json!("aa"),
        };
        assert_eq!(rewrite_for_bunker(&record, "bunker://x"), record);
    }

    #[test]
    fn accounts_roundtrip_through_json() {
        let mut accounts = FxHashMap::default();
        accounts.insert(
            "pk1".to_string(),
            SessionRecord {
                kind: "privkey".to_string(),
                payload: serde_json::json!("secret-hex"),
            },
        );
        let json = serialize_accounts(&accounts);
        let parsed = parse_accounts(&json);
        assert_eq!(parsed, accounts);
        // The wire field is `type`, matching the storage contract.
        assert!(json.contains(r#""type":"privkey""#));
    }

    #[test]
    fn malformed_accounts_json_degrades_to_empty() {
        assert!(parse_accounts("not json").is_empty());
        assert!(parse_accounts("{}").is_empty());
    }
}
