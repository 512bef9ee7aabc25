//! Connections worker: owns every relay socket and the registry policy.
//!
//! Inputs: outbound `Envelope { relays, frames }` batches from the Cache and
//! Signer ports. Outputs: classified inbound frames to the Parser port
//! (NIP-46 traffic to the Signer port instead), plus `status|url` lines on
//! the process-wide status ring.

use shared::types::messages::{self, RelayFrame};
use shared::types::Envelope;
use shared::{telemetry, Port, SabRing};
use tracing::{error, info, warn};
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::spawn_local;
use web_sys::MessagePort;

use js_sys::SharedArrayBuffer;
use std::cell::RefCell;
use std::rc::Rc;

use futures::channel::mpsc;
use futures::select;
use futures::FutureExt;
use futures::StreamExt;

mod backoff;
mod connection;
mod registry;
mod types;

pub use registry::{normalize_relay_url, validate_relay_url, ConnectionRegistry};
pub use types::{BackoffConfig, ConnectionStatus, RelayConfig, RelayError};

/// Subscription ids with this prefix belong to the signer's NIP-46 session;
/// their frames are routed to the Signer port instead of the Parser.
const NIP46_SUB_PREFIX: &str = "n46:";

/// How often the idle-connection sweep runs.
const IDLE_SWEEP_INTERVAL_MS: u32 = 60_000;

#[wasm_bindgen]
pub struct Connections {
    registry: ConnectionRegistry,
    /// Receive-only endpoint; kept so its inbound bridge stays attached.
    _cache: Port,
}

#[wasm_bindgen]
impl Connections {
    /// new(statusRing, cachePort, parserPort, cryptoPort)
    #[wasm_bindgen(constructor)]
    pub fn new(
        status_ring: SharedArrayBuffer,
        cache_port: MessagePort,
        parser_port: MessagePort,
        crypto_port: MessagePort,
    ) -> Result<Connections, JsValue> {
        telemetry::init_with_component(tracing::Level::WARN, "connections");
        info!("instantiating connections worker");

        let status_ring = Rc::new(RefCell::new(SabRing::new(status_ring)?));

        let cache = Port::new(cache_port);
        let parser = Port::new(parser_port);
        let crypto = Port::new(crypto_port);

        let cache_rx = cache.receiver();
        let crypto_rx = crypto.receiver();

        let status_cell = status_ring.clone();
        let status_writer: connection::StatusWriter = Rc::new(move |status: &str, url: &str| {
            let line = shared::envelope::format_status_line(status, url);
            let _ = status_cell.borrow_mut().write(line.as_bytes());
        });

        let parser_tx = Rc::new(parser);
        let crypto_tx = Rc::new(crypto);
        let out_writer: connection::OutWriter = Rc::new(move |url: &str, sub_id: &str, raw: &str| {
            if sub_id.starts_with(NIP46_SUB_PREFIX) {
                let packed = shared::envelope::pack_envelope(url, raw);
                if let Err(e) = crypto_tx.send(&packed) {
                    warn!("failed to forward frame to signer port: {:?}", e);
                }
                return;
            }
            let frame = RelayFrame {
                sub_id: sub_id.to_string(),
                url: url.to_string(),
                raw: raw.to_string(),
            };
            match messages::encode(&frame) {
                Ok(bytes) => {
                    if let Err(e) = parser_tx.send(&bytes) {
                        warn!("failed to forward frame to parser port: {:?}", e);
                    }
                }
                Err(e) => warn!("failed to encode relay frame: {}", e),
            }
        });

        let registry = ConnectionRegistry::new(RelayConfig::default(), out_writer, status_writer);

        let worker = Connections {
            registry,
            _cache: cache,
        };
        worker.start(cache_rx, crypto_rx);
        Ok(worker)
    }

    /// Handle a worker-global control message: `{type:'wake'}` is ignored,
    /// `{type:'shutdown'}` closes everything, a bare relay URL closes that
    /// relay, any other bare string is a subscription close hint.
    #[wasm_bindgen(js_name = handleControl)]
    pub fn handle_control(&self, message: JsValue) {
        if let Some(text) = message.as_string() {
            if text.starts_with("ws://") || text.starts_with("wss://") {
                let registry = self.registry.clone();
                spawn_local(async move {
                    registry.disconnect(&text).await;
                });
            } else {
                self.registry.close_subscription(&text);
            }
            return;
        }

        let kind = js_sys::Reflect::get(&message, &JsValue::from_str("type"))
            .ok()
            .and_then(|v| v.as_string());
        match kind.as_deref() {
            // Wake exists to break long sleep timers; the loops here are
            // select-driven, so there is nothing to do.
            Some("wake") => {}
            Some("shutdown") => {
                let registry = self.registry.clone();
                spawn_local(async move {
                    registry.disconnect_all().await;
                });
            }
            other => warn!(?other, "unknown control message"),
        }
    }

    #[wasm_bindgen(js_name = enableRelay)]
    pub fn enable_relay(&self, url: String) {
        self.registry.enable_relay(&url);
    }

    #[wasm_bindgen(js_name = getActiveReqCount)]
    pub fn get_active_req_count(&self, url: String) -> u32 {
        self.registry.get_active_req_count(&normalize_relay_url(&url))
    }

    #[wasm_bindgen(js_name = getConnectionStatus)]
    pub fn get_connection_status(&self, url: String) -> Option<String> {
        self.registry
            .get_connection_status(&url)
            .map(|s| s.to_string())
    }

    /// Every known connection as `url|status` lines.
    #[wasm_bindgen(js_name = getAllStatuses)]
    pub fn get_all_statuses(&self) -> Vec<JsValue> {
        self.registry
            .get_all_statuses()
            .into_iter()
            .map(|(url, status)| JsValue::from_str(&format!("{}|{}", url, status)))
            .collect()
    }

    fn start(
        &self,
        mut cache_rx: mpsc::Receiver<Vec<u8>>,
        mut crypto_rx: mpsc::Receiver<Vec<u8>>,
    ) {
        // Periodic sweep of idle, request-free connections.
        let sweeper = self.registry.clone();
        spawn_local(async move {
            loop {
                gloo_timers::future::TimeoutFuture::new(IDLE_SWEEP_INTERVAL_MS).await;
                sweeper.cleanup().await;
            }
        });

        let registry = self.registry.clone();

        spawn_local(async move {
            loop {
                let bytes: Option<Vec<u8>> = select! {
                    bytes = cache_rx.next().fuse() => bytes,
                    bytes = crypto_rx.next().fuse() => bytes,
                };
                let bytes = match bytes {
                    Some(b) => b,
                    None => break,
                };

                match serde_json::from_slice::<Envelope>(&bytes) {
                    Ok(env) if !env.relays.is_empty() && !env.frames.is_empty() => {
                        let registry = registry.clone();
                        spawn_local(async move {
                            registry.send_to_relays(&env.relays, &env.frames).await;
                        });
                    }
                    Ok(env) if !env.frames.is_empty() => {
                        error!("envelope has frames but no relays, dropped");
                    }
                    Ok(_) => warn!("empty envelope"),
                    Err(e) => warn!("failed to parse envelope: {}", e),
                }
            }
            info!("envelope loop ended");
        });
    }
}
