//! UI-thread orchestrator.
//!
//! `NostrMesh` wires the four workers, owns the fingerprint-keyed
//! subscription registry and the shared per-frame delivery budget, relays
//! control frames to the Parser worker and manages the signer session. The
//! embedding frontend talks only to this type.

use js_sys::{SharedArrayBuffer, Uint8Array};
use rustc_hash::FxHashMap;
use shared::sub_buffer::{calculate_buffer_size, DEFAULT_BYTES_PER_EVENT};
use shared::types::messages::{self, MainToWorkerMessage, WorkerToMainMessage};
use shared::types::{Request, SubscriptionOptions, Template};
use shared::{fingerprint, telemetry, SabRing};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::{info, warn};
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::future_to_promise;
use web_sys::{MessageEvent, Worker};

mod budget;
mod mesh;
mod reader;
mod registry;
mod session;

pub use budget::{BudgetConfig, FrameBudget};
pub use mesh::WorkerMesh;
pub use reader::SubscriptionReader;
pub use registry::SubscriptionRegistry;
pub use session::{SignerSession, ACCOUNTS_KEY, ACTIVE_PUBKEY_KEY};

/// Fallback broadcast targets when a publish names none.
const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.snort.social",
    "wss://relay.damus.io",
    "wss://relay.primal.net",
];

/// Event-count assumption when neither options nor requests bound a
/// subscription.
const DEFAULT_EVENT_LIMIT: usize = 500;

type Listeners = Rc<RefCell<FxHashMap<String, Vec<js_sys::Function>>>>;

#[wasm_bindgen]
pub struct NostrMesh {
    mesh: Rc<WorkerMesh>,
    registry: Rc<RefCell<SubscriptionRegistry<SharedArrayBuffer>>>,
    readers: Rc<RefCell<FxHashMap<String, Rc<SubscriptionReader>>>>,
    budget: Rc<FrameBudget>,
    session: Rc<SignerSession>,
    listeners: Listeners,
    sign_callbacks: Rc<RefCell<VecDeque<js_sys::Function>>>,
    status_ring: Rc<RefCell<SabRing>>,
    _parser_onmessage: Closure<dyn FnMut(MessageEvent)>,
}

#[wasm_bindgen]
impl NostrMesh {
    /// new(parserWorker, cacheWorker, connectionsWorker, signerWorker)
    #[wasm_bindgen(constructor)]
    pub fn new(
        parser: Worker,
        cache: Worker,
        connections: Worker,
        signer: Worker,
    ) -> Result<NostrMesh, JsValue> {
        telemetry::init(tracing::Level::WARN);
        info!("initializing worker mesh");

        let mesh = Rc::new(WorkerMesh::new(parser, cache, connections, signer)?);
        let status_ring = Rc::new(RefCell::new(SabRing::new(mesh.status_ring())?));
        let budget = Rc::new(FrameBudget::new(BudgetConfig::default(), js_sys::Date::now()));
        let session = SignerSession::new(mesh.signer_port());

        let registry = Rc::new(RefCell::new(SubscriptionRegistry::new()));
        let readers: Rc<RefCell<FxHashMap<String, Rc<SubscriptionReader>>>> =
            Rc::new(RefCell::new(FxHashMap::default()));
        let listeners: Listeners = Rc::new(RefCell::new(FxHashMap::default()));
        let sign_callbacks: Rc<RefCell<VecDeque<js_sys::Function>>> =
            Rc::new(RefCell::new(VecDeque::new()));

        // Parser notifications: a bare fingerprint string means "new data in
        // your buffer"; bytes are control responses.
        let parser_onmessage = {
            let readers = readers.clone();
            let listeners = listeners.clone();
            let sign_callbacks = sign_callbacks.clone();
            Closure::wrap(Box::new(move |event: MessageEvent| {
                let data = event.data();
                if let Some(fingerprint) = data.as_string() {
                    if let Some(reader) = readers.borrow().get(&fingerprint) {
                        reader.on_notify();
                    }
                    return;
                }
                let bytes = if let Ok(array) = data.clone().dyn_into::<Uint8Array>() {
                    array.to_vec()
                } else if let Ok(buf) = data.dyn_into::<js_sys::ArrayBuffer>() {
                    Uint8Array::new(&buf).to_vec()
                } else {
                    return;
                };
                match messages::decode::<WorkerToMainMessage>(&bytes) {
                    Ok(WorkerToMainMessage::SignedEvent { json }) => {
                        let callback = sign_callbacks.borrow_mut().pop_front();
                        match callback {
                            Some(callback) => {
                                let _ = callback.call1(&JsValue::NULL, &JsValue::from_str(&json));
                            }
                            None => warn!("signed event without a waiting callback"),
                        }
                    }
                    Ok(WorkerToMainMessage::Pubkey { pubkey }) => {
                        dispatch(&listeners, "pubkey", &JsValue::from_str(&pubkey));
                    }
                    Ok(other) => {
                        warn!("unexpected control response: {:?}", other);
                    }
                    Err(e) => warn!("undecodable worker message: {}", e),
                }
            }) as Box<dyn FnMut(MessageEvent)>)
        };
        mesh.parser()
            .set_onmessage(Some(parser_onmessage.as_ref().unchecked_ref()));

        Ok(NostrMesh {
            mesh,
            registry,
            readers,
            budget,
            session,
            listeners,
            sign_callbacks,
            status_ring,
            _parser_onmessage: parser_onmessage,
        })
    }

    /// Subscribe to a stream of events. Subscribing twice under the same id
    /// returns the same buffer and bumps the reference count.
    pub fn subscribe(
        &self,
        id: String,
        requests: JsValue,
        options: JsValue,
    ) -> Result<SharedArrayBuffer, JsValue> {
        let fp = fingerprint(&id);
        let requests: Vec<Request> = serde_wasm_bindgen::from_value(requests)
            .map_err(|e| JsValue::from_str(&format!("invalid requests: {}", e)))?;
        let options: SubscriptionOptions = if options.is_undefined() || options.is_null() {
            SubscriptionOptions::default()
        } else {
            serde_wasm_bindgen::from_value(options)
                .map_err(|e| JsValue::from_str(&format!("invalid options: {}", e)))?
        };

        let size = subscription_buffer_size(&requests, &options);
        let (buffer, created) = self
            .registry
            .borrow_mut()
            .subscribe(&fp, || SharedArrayBuffer::new(size as u32));

        if created {
            self.install_reader(&fp, &buffer, format!("subscription:{}", fp));

            let control = MainToWorkerMessage::Subscribe {
                subscription_id: fp.clone(),
                requests,
                options,
            };
            let bytes = messages::encode(&control)
                .map_err(|e| JsValue::from_str(&format!("encode subscribe: {}", e)))?;
            self.mesh.post_to_parser(&bytes, Some(&buffer))?;
        }

        Ok(buffer)
    }

    /// Drop one reference to a subscription. The buffer survives until a
    /// `cleanup()` pass finds it unreferenced.
    pub fn unsubscribe(&self, id: String) {
        let fp = fingerprint(&id);
        self.registry.borrow_mut().unsubscribe(&fp);
    }

    /// Exempt a subscription from cleanup.
    #[wasm_bindgen(js_name = markPerpetual)]
    pub fn mark_perpetual(&self, id: String) {
        let fp = fingerprint(&id);
        self.registry.borrow_mut().mark_perpetual(&fp);
    }

    /// Sweep unreferenced subscriptions: tear down readers, tell the Parser
    /// to unsubscribe and hint Connections to drop relay-side state.
    pub fn cleanup(&self) {
        let removed = self.registry.borrow_mut().cleanup();
        for (fp, _buffer) in removed {
            if let Some(reader) = self.readers.borrow_mut().remove(&fp) {
                reader.cancel();
            }
            let control = MainToWorkerMessage::Unsubscribe {
                subscription_id: fp.clone(),
            };
            match messages::encode(&control) {
                Ok(bytes) => {
                    if let Err(e) = self.mesh.post_to_parser(&bytes, None) {
                        warn!("failed to post unsubscribe: {:?}", e);
                    }
                }
                Err(e) => warn!("failed to encode unsubscribe: {}", e),
            }
            if let Err(e) = self.mesh.post_close_hint(&fp) {
                warn!("failed to post close hint: {:?}", e);
            }
        }
    }

    /// Publish an event template; per-relay status updates arrive in the
    /// returned buffer.
    pub fn publish(
        &self,
        id: String,
        template: JsValue,
        relays: JsValue,
    ) -> Result<SharedArrayBuffer, JsValue> {
        let fp = fingerprint(&id);
        let template: Template = serde_wasm_bindgen::from_value(template)
            .map_err(|e| JsValue::from_str(&format!("invalid template: {}", e)))?;
        let relays: Vec<String> = if relays.is_undefined() || relays.is_null() {
            DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect()
        } else {
            serde_wasm_bindgen::from_value(relays)
                .map_err(|e| JsValue::from_str(&format!("invalid relays: {}", e)))?
        };

        // Status updates are small; a modest buffer covers many relays.
        let size = calculate_buffer_size(relays.len().max(4) * 4, 512);
        let buffer = SharedArrayBuffer::new(size as u32);
        self.install_reader(&fp, &buffer, format!("publish:{}", fp));

        let control = MainToWorkerMessage::Publish {
            publish_id: fp,
            template,
            relays,
        };
        let bytes = messages::encode(&control)
            .map_err(|e| JsValue::from_str(&format!("encode publish: {}", e)))?;
        self.mesh.post_to_parser(&bytes, Some(&buffer))?;

        Ok(buffer)
    }

    /// Sign a template through the worker chain; the callback receives the
    /// signed event JSON. Callbacks complete in request order because signing
    /// is serialized on the signer loop.
    #[wasm_bindgen(js_name = signEvent)]
    pub fn sign_event(&self, template: JsValue, callback: js_sys::Function) -> Result<(), JsValue> {
        let template: Template = serde_wasm_bindgen::from_value(template)
            .map_err(|e| JsValue::from_str(&format!("invalid template: {}", e)))?;
        self.sign_callbacks.borrow_mut().push_back(callback);

        let control = MainToWorkerMessage::SignEvent { template };
        let bytes = messages::encode(&control)
            .map_err(|e| JsValue::from_str(&format!("encode sign request: {}", e)))?;
        self.mesh.post_to_parser(&bytes, None)
    }

    /// Activate a signer variant; resolves with the authenticated pubkey.
    #[wasm_bindgen(js_name = setSigner)]
    pub fn set_signer(&self, kind: String, payload: JsValue) -> js_sys::Promise {
        let session = self.session.clone();
        future_to_promise(async move {
            let payload: serde_json::Value = serde_wasm_bindgen::from_value(payload)
                .map_err(|e| JsValue::from_str(&format!("invalid payload: {}", e)))?;
            session
                .set_signer(&kind, payload)
                .await
                .map(|pk| JsValue::from_str(&pk))
                .map_err(|e| JsValue::from_str(&e))
        })
    }

    #[wasm_bindgen(js_name = getActivePubkey)]
    pub fn get_active_pubkey(&self) -> Option<String> {
        self.session.get_active_pubkey()
    }

    pub fn logout(&self) {
        self.session.logout();
    }

    #[wasm_bindgen(js_name = removeAccount)]
    pub fn remove_account(&self) -> js_sys::Promise {
        let session = self.session.clone();
        future_to_promise(async move {
            session.remove_account().await;
            Ok(JsValue::UNDEFINED)
        })
    }

    /// Topics: `subscription:<fp>`, `publish:<fp>`, `pubkey`, `auth`.
    #[wasm_bindgen(js_name = addEventListener)]
    pub fn add_event_listener(&self, topic: String, listener: js_sys::Function) {
        if topic == "auth" {
            self.session.add_auth_listener(listener);
            return;
        }
        self.listeners
            .borrow_mut()
            .entry(topic)
            .or_default()
            .push(listener);
    }

    #[wasm_bindgen(js_name = removeEventListener)]
    pub fn remove_event_listener(&self, topic: String, listener: js_sys::Function) {
        if let Some(list) = self.listeners.borrow_mut().get_mut(&topic) {
            list.retain(|l| !js_sys::Object::is(l.as_ref(), listener.as_ref()));
        }
    }

    /// Drain the relay status ring into an array of `{status, url}` objects.
    #[wasm_bindgen(js_name = pollRelayStatus)]
    pub fn poll_relay_status(&self) -> js_sys::Array {
        let out = js_sys::Array::new();
        let mut ring = self.status_ring.borrow_mut();
        while let Some(record) = ring.read_next() {
            let Ok(line) = std::str::from_utf8(&record) else {
                continue;
            };
            let Some((status, url)) = shared::envelope::parse_status_line(line) else {
                continue;
            };
            let entry = js_sys::Object::new();
            let _ = js_sys::Reflect::set(&entry, &"status".into(), &JsValue::from_str(status));
            let _ = js_sys::Reflect::set(&entry, &"url".into(), &JsValue::from_str(url));
            out.push(&entry);
        }
        out
    }

    /// Break any long sleep timers in the workers.
    pub fn wake(&self) {
        self.mesh.wake_all();
    }

    pub fn shutdown(&self) {
        for reader in self.readers.borrow().values() {
            reader.cancel();
        }
        self.mesh.shutdown();
    }
}

impl NostrMesh {
    fn install_reader(&self, fp: &str, buffer: &SharedArrayBuffer, topic: String) {
        let listeners = self.listeners.clone();
        let deliver: reader::Deliver = Rc::new(move |record: &[u8]| {
            let array = Uint8Array::new_with_length(record.len() as u32);
            array.copy_from(record);
            dispatch(&listeners, &topic, &array.into());
        });
        let reader = SubscriptionReader::new(fp.to_string(), buffer, self.budget.clone(), deliver);
        self.readers.borrow_mut().insert(fp.to_string(), reader);
    }
}

fn dispatch(listeners: &Listeners, topic: &str, value: &JsValue) {
    let Some(list) = listeners.borrow().get(topic).cloned() else {
        return;
    };
    for listener in list {
        if let Err(e) = listener.call1(&JsValue::NULL, value) {
            warn!(topic, "listener threw: {:?}", e);
        }
    }
}

/// Size a subscription buffer from its options and request limits.
fn subscription_buffer_size(requests: &[Request], options: &SubscriptionOptions) -> usize {
    let total_events = options
        .max_events
        .or_else(|| {
            let sum: usize = requests.iter().filter_map(|r| r.limit).sum();
            (sum > 0).then_some(sum)
        })
        .unwrap_or(DEFAULT_EVENT_LIMIT);
    let bytes_per_event = options.bytes_per_event.unwrap_or(DEFAULT_BYTES_PER_EVENT);
    calculate_buffer_size(total_events, bytes_per_event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_size_prefers_explicit_max_events() {
        let options = SubscriptionOptions {
            max_events: Some(10),
            bytes_per_event: Some(1000),
            ..Default::default()
        };
        assert_eq!(
            subscription_buffer_size(&[], &options),
            calculate_buffer_size(10, 1000)
        );
    }

    #[test]
    fn buffer_size_falls_back_to_request_limits() {
        let requests = vec![
            Request {
                limit: Some(20),
                relays: vec!["wss://r".into()],
                ..Default::default()
            },
            Request {
                limit: Some(30),
                relays: vec!["wss://r".into()],
                ..Default::default()
            },
        ];
        let options = SubscriptionOptions::default();
        assert_eq!(
            subscription_buffer_size(&requests, &options),
            calculate_buffer_size(50, DEFAULT_BYTES_PER_EVENT)
        );
    }

    #[test]
    fn buffer_size_defaults_when_unbounded() {
        assert_eq!(
            subscription_buffer_size(&[], &SubscriptionOptions::default()),
            calculate_buffer_size(DEFAULT_EVENT_LIMIT, DEFAULT_BYTES_PER_EVENT)
        );
    }
}
