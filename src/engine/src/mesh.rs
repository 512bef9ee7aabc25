//! Worker topology wiring.
//!
//! The orchestrator allocates every point-to-point channel and the status
//! ring, then posts each worker a single `{type:'init', payload}` message
//! with the transferred endpoints. Worker glue is expected to queue anything
//! that arrives before its module finished loading and replay it after.

use js_sys::{Array, Object, Reflect, SharedArrayBuffer};
use wasm_bindgen::prelude::*;
use web_sys::{MessageChannel, MessagePort, Worker};

use shared::Port;

/// Status ring: 32-byte header + data region.
const STATUS_RING_BYTES: u32 = 32 + 64 * 1024;

pub struct WorkerMesh {
    parser: Worker,
    cache: Worker,
    connections: Worker,
    signer: Worker,
    /// Our end of the Signer<->UI control channel.
    signer_port: MessagePort,
    status_ring: SharedArrayBuffer,
}

impl WorkerMesh {
    pub fn new(
        parser: Worker,
        cache: Worker,
        connections: Worker,
        signer: Worker,
    ) -> Result<Self, JsValue> {
        // One channel per edge of the worker graph.
        let cache_connections = MessageChannel::new()?;
        let parser_cache = MessageChannel::new()?;
        let connections_parser = MessageChannel::new()?;
        let parser_crypto = MessageChannel::new()?;
        let crypto_connections = MessageChannel::new()?;
        let crypto_main = MessageChannel::new()?;

        let status_ring = SharedArrayBuffer::new(STATUS_RING_BYTES);

        post_init(
            &parser,
            &[
                ("cachePort", parser_cache.port1().into()),
                ("connectionsPort", connections_parser.port2().into()),
                ("cryptoPort", parser_crypto.port1().into()),
            ],
            &[
                parser_cache.port1().into(),
                connections_parser.port2().into(),
                parser_crypto.port1().into(),
            ],
        )?;

        post_init(
            &cache,
            &[
                ("parserPort", parser_cache.port2().into()),
                ("connectionsPort", cache_connections.port1().into()),
            ],
            &[
                parser_cache.port2().into(),
                cache_connections.port1().into(),
            ],
        )?;

        post_init(
            &connections,
            &[
                ("statusRing", status_ring.clone().into()),
                ("cachePort", cache_connections.port2().into()),
                ("parserPort", connections_parser.port1().into()),
                ("cryptoPort", crypto_connections.port1().into()),
            ],
            &[
                cache_connections.port2().into(),
                connections_parser.port1().into(),
                crypto_connections.port1().into(),
            ],
        )?;

        post_init(
            &signer,
            &[
                ("parserPort", parser_crypto.port2().into()),
                ("connectionsPort", crypto_connections.port2().into()),
                ("mainPort", crypto_main.port1().into()),
            ],
            &[
                parser_crypto.port2().into(),
                crypto_connections.port2().into(),
                crypto_main.port1().into(),
            ],
        )?;

        Ok(Self {
            parser,
            cache,
            connections,
            signer,
            signer_port: crypto_main.port2(),
            status_ring,
        })
    }

    pub fn parser(&self) -> &Worker {
        &self.parser
    }

    pub fn status_ring(&self) -> SharedArrayBuffer {
        self.status_ring.clone()
    }

    /// Wrap our end of the signer control channel. The receiver side may
    /// only be installed once.
    pub fn signer_port(&self) -> Port {
        Port::new(self.signer_port.clone())
    }

    /// Post a control frame to the parser worker, optionally carrying a
    /// subscription/publish buffer.
    pub fn post_to_parser(
        &self,
        serialized: &[u8],
        buffer: Option<&SharedArrayBuffer>,
    ) -> Result<(), JsValue> {
        let array = js_sys::Uint8Array::new_with_length(serialized.len() as u32);
        array.copy_from(serialized);

        let message = Object::new();
        Reflect::set(&message, &"serializedMessage".into(), &array)?;
        if let Some(buffer) = buffer {
            Reflect::set(&message, &"sharedBuffer".into(), buffer)?;
        }
        self.parser.post_message(&message)
    }

    /// Tell Connections to drop relay-side state for a fingerprint.
    pub fn post_close_hint(&self, fingerprint: &str) -> Result<(), JsValue> {
        self.connections
            .post_message(&JsValue::from_str(fingerprint))
    }

    /// Break any long sleep timers in the workers.
    pub fn wake_all(&self) {
        for worker in [&self.parser, &self.cache, &self.connections, &self.signer] {
            let _ = worker.post_message(&control_message("wake"));
        }
    }

    pub fn shutdown(&self) {
        for worker in [&self.parser, &self.cache, &self.connections, &self.signer] {
            let _ = worker.post_message(&control_message("shutdown"));
        }
    }
}

fn control_message(kind: &str) -> JsValue {
    let message = Object::new();
    let _ = Reflect::set(&message, &"type".into(), &JsValue::from_str(kind));
    message.into()
}

fn post_init(
    worker: &Worker,
    payload_entries: &[(&str, JsValue)],
    transfer: &[JsValue],
) -> Result<(), JsValue> {
    let payload = Object::new();
    for (key, value) in payload_entries {
        Reflect::set(&payload, &JsValue::from_str(key), value)?;
    }

    let message = Object::new();
    Reflect::set(&message, &"type".into(), &JsValue::from_str("init"))?;
    Reflect::set(&message, &"payload".into(), &payload)?;

    let transfer_list = Array::new();
    for item in transfer {
        transfer_list.push(item);
    }
    worker.post_message_with_transfer(&message, &transfer_list)
}
