//! Cache worker: the local half of every subscription.
//!
//! Commands arrive from the Parser port; local answers go back on the same
//! channel, and outbound envelopes are relayed untouched to the Connections
//! port. The store itself is memory-only.

use shared::types::messages::{self, CacheCommand, CacheReply};
use shared::{telemetry, Port};
use tracing::{info, warn};
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::spawn_local;
use web_sys::MessagePort;

use std::cell::RefCell;
use std::rc::Rc;

use futures::channel::mpsc;
use futures::StreamExt;

mod store;

pub use store::EventStore;

#[wasm_bindgen]
pub struct Cache {
    store: Rc<RefCell<EventStore>>,
}

#[wasm_bindgen]
impl Cache {
    /// new(parserPort, connectionsPort)
    #[wasm_bindgen(constructor)]
    pub fn new(parser_port: MessagePort, connections_port: MessagePort) -> Result<Cache, JsValue> {
        telemetry::init_with_component(tracing::Level::WARN, "cache");
        info!("instantiating cache worker");

        let parser = Rc::new(Port::new(parser_port));
        let connections = Rc::new(Port::new(connections_port));
        let parser_rx = parser.receiver();

        let store = Rc::new(RefCell::new(EventStore::new()));
        Self::start(store.clone(), parser_rx, parser, connections);

        Ok(Cache { store })
    }

    /// `{type:'wake'}` and `{type:'shutdown'}`; nothing to tear down here.
    #[wasm_bindgen(js_name = handleControl)]
    pub fn handle_control(&self, _message: JsValue) {}

    /// Number of events currently held, for the debug surface.
    #[wasm_bindgen(js_name = eventCount)]
    pub fn event_count(&self) -> usize {
        self.store.borrow().len()
    }

    fn start(
        store: Rc<RefCell<EventStore>>,
        mut parser_rx: mpsc::Receiver<Vec<u8>>,
        parser: Rc<Port>,
        connections: Rc<Port>,
    ) {
        spawn_local(async move {
            while let Some(bytes) = parser_rx.next().await {
                let command = match messages::decode::<CacheCommand>(&bytes) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("undecodable cache command: {}", e);
                        continue;
                    }
                };

                match command {
                    CacheCommand::Ingest { events } => {
                        let added = store.borrow_mut().insert_all(events);
                        if added > 0 {
                            tracing::debug!(added, "ingested events");
                        }
                    }
                    CacheCommand::Query { sub_id, requests } => {
                        let events = {
                            let store = store.borrow();
                            let mut seen = rustc_hash::FxHashSet::default();
                            let mut out = Vec::new();
                            for request in requests.iter().filter(|r| !r.no_cache) {
                                for event in store.query(request) {
                                    if seen.insert(event.id) {
                                        out.push(event);
                                    }
                                }
                            }
                            out
                        };
                        tracing::debug!(sub_id = %sub_id, hits = events.len(), "local answer");
                        let reply = CacheReply::Events { sub_id, events };
                        match messages::encode(&reply) {
                            Ok(bytes) => {
                                if let Err(e) = parser.send(&bytes) {
                                    warn!("failed to send cache reply: {:?}", e);
                                }
                            }
                            Err(e) => warn!("failed to encode cache reply: {}", e),
                        }
                    }
                    CacheCommand::Forward { envelope } => {
                        match serde_json::to_vec(&envelope) {
                            Ok(bytes) => {
                                if let Err(e) = connections.send(&bytes) {
                                    warn!("failed to forward envelope: {:?}", e);
                                }
                            }
                            Err(e) => warn!("failed to encode envelope: {}", e),
                        }
                    }
                    CacheCommand::Close { sub_id } => {
                        // No per-subscription state in the store today; the
                        // command exists so a future eviction policy has a
                        // hook.
                        tracing::debug!(sub_id = %sub_id, "subscription closed");
                    }
                }
            }
            info!("cache command loop ended");
        });
    }
}
