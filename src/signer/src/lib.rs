//! Signer worker: four signer variants behind one request/response surface.
//!
//! Requests arrive from the Parser port (signing during publish) and from the
//! UI-thread port (session management); both speak `SignerRequest` /
//! `SignerResponse`. NIP-07 ops bounce through the main thread via the
//! extension escape hatch; NIP-46 traffic rides the Connections port.

#![allow(clippy::needless_return)]

use shared::types::messages::{
    self, MainToSigner, SignerOp, SignerRequest, SignerResponse, SignerToMain,
};
use shared::types::Keys;
use shared::{telemetry, Port};
use tracing::{info, warn};
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::spawn_local;
use web_sys::MessagePort;

use futures::channel::mpsc;
use futures::StreamExt;
use std::cell::RefCell;
use std::rc::Rc;
use url::Url;

mod nip44;
mod signers;

pub use signers::{
    ExtensionBridge, Nip07Signer, Nip46Config, Nip46Signer, PrivateKeySigner, SignerError,
};

/// Pieces of a parsed `bunker://` URL.
#[derive(Debug)]
struct BunkerUrl {
    remote_pubkey: String,
    relays: Vec<String>,
    secret: Option<String>,
}

/// Pieces of a parsed `nostrconnect://` URL.
#[derive(Debug)]
struct NostrconnectUrl {
    relays: Vec<String>,
    secret: String,
    app_name: Option<String>,
}

#[derive(Clone)]
enum ActiveSigner {
    Unset,
    Pk(Rc<PrivateKeySigner>),
    Nip07(Rc<Nip07Signer>),
    Nip46(Rc<Nip46Signer>),
}

#[wasm_bindgen]
pub struct Signer {
    active: Rc<RefCell<ActiveSigner>>,
}

struct SignerState {
    active: Rc<RefCell<ActiveSigner>>,
    to_connections: Rc<Port>,
    main: Rc<Port>,
    extension: Rc<ExtensionBridge>,
}

#[wasm_bindgen]
impl Signer {
    /// new(parserPort, connectionsPort, mainPort)
    #[wasm_bindgen(constructor)]
    pub fn new(
        parser_port: MessagePort,
        connections_port: MessagePort,
        main_port: MessagePort,
    ) -> Result<Signer, JsValue> {
        telemetry::init_with_component(tracing::Level::WARN, "signer");
        info!("instantiating signer worker");

        let parser = Rc::new(Port::new(parser_port));
        let connections = Rc::new(Port::new(connections_port));
        let main = Rc::new(Port::new(main_port));

        let parser_rx = parser.receiver();
        let connections_rx = connections.receiver();
        let main_rx = main.receiver();

        let active = Rc::new(RefCell::new(ActiveSigner::Unset));
        let extension = ExtensionBridge::new(main.clone());

        let state = Rc::new(SignerState {
            active: active.clone(),
            to_connections: connections,
            main: main.clone(),
            extension,
        });

        spawn_parser_loop(state.clone(), parser_rx, parser);
        spawn_main_loop(state.clone(), main_rx);
        spawn_frame_loop(state, connections_rx);

        Ok(Signer { active })
    }

    /// `{type:'wake'}` and `{type:'shutdown'}`; shutdown closes the NIP-46
    /// subscription if one is open.
    #[wasm_bindgen(js_name = handleControl)]
    pub fn handle_control(&self, message: JsValue) {
        let kind = js_sys::Reflect::get(&message, &JsValue::from_str("type"))
            .ok()
            .and_then(|v| v.as_string());
        if kind.as_deref() == Some("shutdown") {
            if let ActiveSigner::Nip46(n46) = &*self.active.borrow() {
                n46.close();
            }
        }
    }
}

fn spawn_parser_loop(state: Rc<SignerState>, mut rx: mpsc::Receiver<Vec<u8>>, parser: Rc<Port>) {
    spawn_local(async move {
        while let Some(bytes) = rx.next().await {
            let request: SignerRequest = match messages::decode(&bytes) {
                Ok(r) => r,
                Err(e) => {
                    warn!("undecodable signer request: {}", e);
                    continue;
                }
            };
            let response = dispatch(&state, request).await;
            send_response(&parser, &response);
        }
        info!("signer request loop ended");
    });
}

fn spawn_main_loop(state: Rc<SignerState>, mut rx: mpsc::Receiver<Vec<u8>>) {
    spawn_local(async move {
        while let Some(bytes) = rx.next().await {
            match messages::decode::<MainToSigner>(&bytes) {
                Ok(MainToSigner::Request(request)) => {
                    let response = dispatch(&state, request).await;
                    send_to_main(&state.main, &SignerToMain::Response(response));
                }
                Ok(MainToSigner::ExtensionResponse {
                    id,
                    ok,
                    result,
                    error,
                }) => {
                    state.extension.resolve(id, ok, result, error);
                }
                Err(e) => warn!("undecodable main-thread message: {}", e),
            }
        }
        info!("signer main loop ended");
    });
}

/// Inbound NIP-46 frames, packed as (url, raw) envelopes by Connections.
fn spawn_frame_loop(state: Rc<SignerState>, mut rx: mpsc::Receiver<Vec<u8>>) {
    spawn_local(async move {
        while let Some(bytes) = rx.next().await {
            let Some((url, raw)) = shared::envelope::unpack_envelope(&bytes) else {
                warn!("undecodable envelope from connections");
                continue;
            };
            let nip46 = match &*state.active.borrow() {
                ActiveSigner::Nip46(n46) => n46.clone(),
                _ => continue,
            };
            nip46.handle_frame(&url, &raw);
        }
        info!("signer frame loop ended");
    });
}

async fn dispatch(state: &SignerState, request: SignerRequest) -> SignerResponse {
    let rid = request.request_id;
    let outcome = dispatch_inner(state, request).await;
    match outcome {
        Ok(result) => SignerResponse::ok(rid, result),
        Err(e) => SignerResponse::err(rid, e.to_string()),
    }
}

async fn dispatch_inner(
    state: &SignerState,
    request: SignerRequest,
) -> Result<String, SignerError> {
    let payload = request.payload;
    let peer = request.peer;

    match request.op {
        SignerOp::SetPrivateKey => {
            let pk = PrivateKeySigner::new(payload.trim())?;
            *state.active.borrow_mut() = ActiveSigner::Pk(Rc::new(pk));
            info!("active signer = PrivateKey");
            Ok(String::new())
        }

        SignerOp::SetNip07 => {
            *state.active.borrow_mut() =
                ActiveSigner::Nip07(Rc::new(Nip07Signer::new(state.extension.clone())));
            info!("active signer = NIP-07");
            Ok(String::new())
        }

        SignerOp::SetNip46Bunker => {
            let (url, client_secret) = parse_set_nip46_payload(&payload)?;
            let parsed = parse_bunker_url(&url)?;
            let cfg = Nip46Config {
                remote_signer_pubkey: parsed.remote_pubkey,
                relays: parsed.relays,
                app_name: None,
                expected_secret: parsed.secret,
            };
            activate_nip46(state, cfg, client_secret)?;
            info!("active signer = NIP-46 (bunker)");
            Ok(String::new())
        }

        SignerOp::SetNip46Qr => {
            let (url, client_secret) = parse_set_nip46_payload(&payload)?;
            let parsed = parse_nostrconnect_url(&url)?;
            let cfg = Nip46Config {
                remote_signer_pubkey: String::new(),
                relays: parsed.relays,
                app_name: parsed.app_name,
                expected_secret: Some(parsed.secret),
            };
            activate_nip46(state, cfg, client_secret)?;
            info!("active signer = NIP-46 (QR discovery)");
            Ok(String::new())
        }

        SignerOp::ClearSigner => {
            if let ActiveSigner::Nip46(n46) = &*state.active.borrow() {
                n46.close();
            }
            *state.active.borrow_mut() = ActiveSigner::Unset;
            info!("active signer cleared");
            Ok(String::new())
        }

        SignerOp::Connect => match active(state) {
            ActiveSigner::Nip46(n46) => n46.connect().await,
            ActiveSigner::Unset => Err(SignerError::NoSigner),
            _ => Err(SignerError::Unsupported("connect".to_string())),
        },

        SignerOp::GetPubkey => match active(state) {
            ActiveSigner::Pk(pk) => Ok(pk.get_public_key()),
            ActiveSigner::Nip07(s) => s.get_public_key().await,
            ActiveSigner::Nip46(s) => s.get_public_key().await,
            ActiveSigner::Unset => Err(SignerError::NoSigner),
        },

        SignerOp::SignEvent => match active(state) {
            ActiveSigner::Pk(pk) => pk.sign_event(&payload),
            ActiveSigner::Nip07(s) => s.sign_event(&payload).await,
            ActiveSigner::Nip46(s) => s.sign_event(&payload).await,
            ActiveSigner::Unset => Err(SignerError::NoSigner),
        },

        SignerOp::Nip04Encrypt => match active(state) {
            ActiveSigner::Pk(_) => Err(SignerError::Unsupported("nip04_encrypt".to_string())),
            ActiveSigner::Nip07(s) => s.nip04_encrypt(&peer, &payload).await,
            ActiveSigner::Nip46(s) => s.nip04_encrypt(&peer, &payload).await,
            ActiveSigner::Unset => Err(SignerError::NoSigner),
        },

        SignerOp::Nip04Decrypt => match active(state) {
            ActiveSigner::Pk(_) => Err(SignerError::Unsupported("nip04_decrypt".to_string())),
            ActiveSigner::Nip07(s) => s.nip04_decrypt(&peer, &payload).await,
            ActiveSigner::Nip46(s) => s.nip04_decrypt(&peer, &payload).await,
            ActiveSigner::Unset => Err(SignerError::NoSigner),
        },

        SignerOp::Nip44Encrypt => match active(state) {
            ActiveSigner::Pk(pk) => pk.nip44_encrypt(&peer, &payload),
            ActiveSigner::Nip07(s) => s.nip44_encrypt(&peer, &payload).await,
            ActiveSigner::Nip46(s) => s.nip44_encrypt(&peer, &payload).await,
            ActiveSigner::Unset => Err(SignerError::NoSigner),
        },

        SignerOp::Nip44Decrypt => match active(state) {
            ActiveSigner::Pk(pk) => pk.nip44_decrypt(&peer, &payload),
            ActiveSigner::Nip07(s) => s.nip44_decrypt(&peer, &payload).await,
            ActiveSigner::Nip46(s) => s.nip44_decrypt(&peer, &payload).await,
            ActiveSigner::Unset => Err(SignerError::NoSigner),
        },
    }
}

/// Snapshot the active signer without holding the borrow across awaits.
fn active(state: &SignerState) -> ActiveSigner {
    state.active.borrow().clone()
}

fn activate_nip46(
    state: &SignerState,
    cfg: Nip46Config,
    client_secret: Option<String>,
) -> Result<(), SignerError> {
    let client_keys = match client_secret {
        Some(s) => Some(Keys::parse(&s).map_err(|e| SignerError::InvalidPrivateKey(e.to_string()))?),
        None => None,
    };

    let nip46 = Rc::new(Nip46Signer::new(
        cfg,
        state.to_connections.clone(),
        client_keys,
    ));

    // Discovery rewrites a QR session into a bunker session on the UI side.
    let main = state.main.clone();
    nip46.start(Some(Rc::new(move |bunker_url: String| {
        send_to_main(&main, &SignerToMain::BunkerDiscovered { url: bunker_url });
    })));

    *state.active.borrow_mut() = ActiveSigner::Nip46(nip46);
    Ok(())
}

fn parse_set_nip46_payload(payload: &str) -> Result<(String, Option<String>), SignerError> {
    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| SignerError::Other(format!("invalid payload: {}", e)))?;
    let url = value
        .get("url")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| SignerError::Other("missing url".to_string()))?
        .to_string();
    let client_secret = value
        .get("clientSecret")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);
    Ok((url, client_secret))
}

fn send_response(port: &Port, response: &SignerResponse) {
    match messages::encode(response) {
        Ok(bytes) => {
            if let Err(e) = port.send(&bytes) {
                warn!("failed to send signer response: {:?}", e);
            }
        }
        Err(e) => warn!("failed to encode signer response: {}", e),
    }
}

fn send_to_main(port: &Port, message: &SignerToMain) {
    match messages::encode(message) {
        Ok(bytes) => {
            if let Err(e) = port.send(&bytes) {
                warn!("failed to send to main thread: {:?}", e);
            }
        }
        Err(e) => warn!("failed to encode main-thread message: {}", e),
    }
}

fn parse_bunker_url(url: &str) -> Result<BunkerUrl, SignerError> {
    let Some(url_part) = url.strip_prefix("bunker://") else {
        return Err(SignerError::Other(
            "invalid bunker URL: must start with bunker://".to_string(),
        ));
    };

    let parts: Vec<&str> = url_part.splitn(2, '?').collect();
    if parts.len() != 2 {
        return Err(SignerError::Other(
            "invalid bunker URL: missing query parameters".to_string(),
        ));
    }

    let remote_pubkey = parts[0];
    if remote_pubkey.len() != 64 || !remote_pubkey.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SignerError::Other(
            "invalid remote signer pubkey in bunker URL".to_string(),
        ));
    }

    let params = Url::parse(&format!("http://localhost/?{}", parts[1]))
        .map_err(|e| SignerError::Other(format!("invalid URL parameters: {}", e)))?;

    let relays: Vec<String> = params
        .query_pairs()
        .filter_map(|(k, v)| (k == "relay").then(|| v.to_string()))
        .collect();
    if relays.is_empty() {
        return Err(SignerError::Other(
            "no relays specified in bunker URL".to_string(),
        ));
    }

    let secret = params
        .query_pairs()
        .find_map(|(k, v)| (k == "secret").then(|| v.to_string()));

    Ok(BunkerUrl {
        remote_pubkey: remote_pubkey.to_string(),
        relays,
        secret,
    })
}

fn parse_nostrconnect_url(url: &str) -> Result<NostrconnectUrl, SignerError> {
    let Some(url_part) = url.strip_prefix("nostrconnect://") else {
        return Err(SignerError::Other(
            "invalid nostrconnect URL: must start with nostrconnect://".to_string(),
        ));
    };

    let parts: Vec<&str> = url_part.splitn(2, '?').collect();
    if parts.len() != 2 {
        return Err(SignerError::Other(
            "invalid nostrconnect URL: missing query parameters".to_string(),
        ));
    }

    let client_pubkey = parts[0];
    if client_pubkey.len() != 64 || !client_pubkey.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SignerError::Other(
            "invalid client pubkey in nostrconnect URL".to_string(),
        ));
    }

    let params = Url::parse(&format!("http://localhost/?{}", parts[1]))
        .map_err(|e| SignerError::Other(format!("invalid URL parameters: {}", e)))?;

    let relays: Vec<String> = params
        .query_pairs()
        .filter_map(|(k, v)| (k == "relay").then(|| v.to_string()))
        .collect();
    if relays.is_empty() {
        return Err(SignerError::Other(
            "no relays specified in nostrconnect URL".to_string(),
        ));
    }

    let secret = params
        .query_pairs()
        .find_map(|(k, v)| (k == "secret").then(|| v.to_string()))
        .ok_or_else(|| SignerError::Other("secret is required in nostrconnect URL".to_string()))?;

    let app_name = params
        .query_pairs()
        .find_map(|(k, v)| (k == "name").then(|| v.to_string()));

    Ok(NostrconnectUrl {
        relays,
        secret,
        app_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PK: &str = "a6b9bb0fc98b34ade6df4b0f4b8b45b1e0b2f7e1e0a8cf1b8e2f7a9c1d3e5f70";

    #[test]
    fn bunker_url_parses_relays_and_secret() {
        let url = format!(
            "bunker://{}?relay=wss%3A%2F%2Fr1.example&relay=wss%3A%2F%2Fr2.example&secret=s3cr3t",
            PK
        );
        let parsed = parse_bunker_url(&url).unwrap();
        assert_eq!(parsed.remote_pubkey, PK);
        assert_eq!(
            parsed.relays,
            vec!["wss://r1.example".to_string(), "wss://r2.example".to_string()]
        );
        assert_eq!(parsed.secret.as_deref(), Some("s3cr3t"));
    }

    #[test]
    fn bunker_url_rejects_bad_pubkeys() {
        assert!(parse_bunker_url("bunker://notahexkey?relay=wss://r").is_err());
        assert!(parse_bunker_url("https://example.com").is_err());
        assert!(parse_bunker_url(&format!("bunker://{}", PK)).is_err());
    }

    #[test]
    fn nostrconnect_url_requires_a_secret() {
        let ok = format!(
            "nostrconnect://{}?relay=wss%3A%2F%2Fr.example&secret=abc&name=app",
            PK
        );
        let parsed = parse_nostrconnect_url(&ok).unwrap();
        assert_eq!(parsed.relays, vec!["wss://r.example".to_string()]);
        assert_eq!(parsed.secret, "abc");
        assert_eq!(parsed.app_name.as_deref(), Some("app"));

        let missing = format!("nostrconnect://{}?relay=wss%3A%2F%2Fr.example", PK);
        assert!(parse_nostrconnect_url(&missing).is_err());
    }

    #[test]
    fn set_nip46_payload_shape() {
        let (url, secret) =
            parse_set_nip46_payload(r#"{"url":"bunker://x?relay=r","clientSecret":"aa"}"#).unwrap();
        assert_eq!(url, "bunker://x?relay=r");
        assert_eq!(secret.as_deref(), Some("aa"));

        let (_, none) = parse_set_nip46_payload(r#"{"url":"u","clientSecret":null}"#).unwrap();
        assert!(none.is_none());
    }
}
