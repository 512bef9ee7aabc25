//! Parser worker: the control plane of the runtime.
//!
//! The UI thread posts serialized `MainToWorkerMessage` frames here (with the
//! subscription/publish SharedArrayBuffer alongside where the operation needs
//! one). Outcomes flow back as records in those buffers plus fingerprint
//! notification strings, or as serialized control responses.

#![allow(async_fn_in_trait)]

use js_sys::Uint8Array;
use shared::types::messages::{self, MainToWorkerMessage, SignerOp, SignerSpec, WorkerToMainMessage};
use shared::{telemetry, Port};
use std::rc::Rc;
use tracing::info;
use wasm_bindgen::prelude::*;
use web_sys::MessagePort;

mod js_interop;
pub mod network;
mod signer_client;

pub use network::NetworkManager;
pub use signer_client::SignerClient;

use crate::js_interop::post_worker_message;

#[wasm_bindgen]
pub struct ParserWorker {
    network: Rc<NetworkManager>,
    signer: Rc<SignerClient>,
    /// Receive-only endpoint; kept so its inbound bridge stays attached.
    _connections: Port,
}

#[wasm_bindgen]
impl ParserWorker {
    /// new(cachePort, connectionsPort, cryptoPort)
    #[wasm_bindgen(constructor)]
    pub fn new(
        cache_port: MessagePort,
        connections_port: MessagePort,
        crypto_port: MessagePort,
    ) -> Result<ParserWorker, JsValue> {
        telemetry::init_with_component(tracing::Level::WARN, "parser");
        info!("instantiating parser worker");

        let cache = Port::new(cache_port);
        let cache_rx = cache.receiver();
        let connections = Port::new(connections_port);
        let connections_rx = connections.receiver();
        let signer = Rc::new(SignerClient::new(Port::new(crypto_port)));

        let network = NetworkManager::new(cache, cache_rx, connections_rx, signer.clone());

        Ok(ParserWorker {
            network,
            signer,
            _connections: connections,
        })
    }

    /// `{type:'wake'}` and `{type:'shutdown'}`. The loops here are
    /// message-driven, nothing to do for either.
    #[wasm_bindgen(js_name = handleControl)]
    pub fn handle_control(&self, _message: JsValue) {}

    /// Entry point for control frames from the UI thread. The message is
    /// either a bare Uint8Array or `{serializedMessage, sharedBuffer?}`.
    #[wasm_bindgen(js_name = handleMessage)]
    pub async fn handle_message(&self, message_obj: &JsValue) -> Result<(), JsValue> {
        let (message_bytes, shared_buffer) = if message_obj.is_instance_of::<Uint8Array>() {
            let array: Uint8Array = message_obj.clone().dyn_into()?;
            (array.to_vec(), None)
        } else if let Some(obj) = message_obj.dyn_ref::<js_sys::Object>() {
            let serialized = js_sys::Reflect::get(obj, &JsValue::from_str("serializedMessage"))?;
            if serialized.is_undefined() {
                return Err(JsValue::from_str("missing serializedMessage field"));
            }
            let array = Uint8Array::from(serialized);
            let bytes = array.to_vec();

            let shared_buffer = {
                let buffer = js_sys::Reflect::get(obj, &JsValue::from_str("sharedBuffer"))?;
                if buffer.is_undefined() || buffer.is_null() {
                    None
                } else {
                    Some(
                        buffer
                            .dyn_into::<js_sys::SharedArrayBuffer>()
                            .map_err(|_| JsValue::from_str("invalid SharedArrayBuffer"))?,
                    )
                }
            };
            (bytes, shared_buffer)
        } else {
            return Err(JsValue::from_str("invalid message format"));
        };

        let message: MainToWorkerMessage = messages::decode(&message_bytes)
            .map_err(|e| JsValue::from_str(&format!("failed to decode control frame: {}", e)))?;

        match message {
            MainToWorkerMessage::Subscribe {
                subscription_id,
                requests,
                options,
            } => {
                let buffer = shared_buffer
                    .ok_or_else(|| JsValue::from_str("Subscribe requires SharedArrayBuffer"))?;
                self.network
                    .subscription_manager
                    .open(subscription_id, buffer, requests, &options)
                    .await;
            }

            MainToWorkerMessage::Unsubscribe { subscription_id } => {
                self.network.subscription_manager.close(&subscription_id);
            }

            MainToWorkerMessage::Publish {
                publish_id,
                template,
                relays,
            } => {
                let buffer = shared_buffer
                    .ok_or_else(|| JsValue::from_str("Publish requires SharedArrayBuffer"))?;
                self.network
                    .publish_manager
                    .publish(publish_id, &template, &relays, buffer)
                    .await;
            }

            MainToWorkerMessage::SignEvent { template } => {
                let template_json = serde_json::to_string(&template)
                    .map_err(|e| JsValue::from_str(&format!("bad template: {}", e)))?;
                let signed = self
                    .signer
                    .sign_event(template_json)
                    .await
                    .map_err(|e| JsValue::from_str(&e))?;
                post_response(&WorkerToMainMessage::SignedEvent { json: signed });
            }

            MainToWorkerMessage::GetPublicKey => {
                let pubkey = self
                    .signer
                    .get_public_key()
                    .await
                    .map_err(|e| JsValue::from_str(&e))?;
                post_response(&WorkerToMainMessage::Pubkey { pubkey });
            }

            MainToWorkerMessage::SetSigner { spec } => {
                let (op, payload) = signer_op_for_spec(&spec);
                self.signer
                    .call(op, payload, String::new())
                    .await
                    .map_err(|e| JsValue::from_str(&e))?;
            }
        }

        Ok(())
    }
}

fn signer_op_for_spec(spec: &SignerSpec) -> (SignerOp, String) {
    match spec {
        SignerSpec::PrivateKey { secret } => (SignerOp::SetPrivateKey, secret.clone()),
        SignerSpec::Nip07 => (SignerOp::SetNip07, String::new()),
        SignerSpec::Nip46Bunker { url, client_secret } => (
            SignerOp::SetNip46Bunker,
            serde_json::json!({ "url": url, "clientSecret": client_secret }).to_string(),
        ),
        SignerSpec::Nip46Qr { url, client_secret } => (
            SignerOp::SetNip46Qr,
            serde_json::json!({ "url": url, "clientSecret": client_secret }).to_string(),
        ),
    }
}

fn post_response(message: &WorkerToMainMessage) {
    match messages::encode(message) {
        Ok(bytes) => {
            let array = Uint8Array::new_with_length(bytes.len() as u32);
            array.copy_from(&bytes);
            post_worker_message(&array.into());
        }
        Err(e) => tracing::warn!("failed to encode control response: {}", e),
    }
}
