//! NetworkManager: the parser worker's routing hub.
//!
//! Owns the per-subscription and per-publish state, reads classified frames
//! from the Connections port and local answers from the Cache port, writes
//! records into the per-subscription buffers and notifies the UI thread with
//! the owning fingerprint string.

pub mod publish;
pub mod subscription;

use crate::js_interop::post_worker_message;
use crate::signer_client::SignerClient;

use futures::channel::mpsc;
use futures::select;
use futures::FutureExt;
use futures::StreamExt;
use rustc_hash::{FxHashMap, FxHashSet};
use shared::sub_buffer::SubBufferWriter;
use shared::types::messages::{self, CacheCommand, CacheReply, RelayFrame, WorkerToMainMessage};
use shared::types::{Event, PublishStatus, RelayStatusUpdate};
use shared::{wire, Port};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, info, warn};
use wasm_bindgen::JsValue;
use wasm_bindgen_futures::spawn_local;

pub(crate) struct Sub {
    pub writer: SubBufferWriter,
    pub relays: Vec<String>,
    pub close_on_eose: bool,
    pub max_events: Option<usize>,
    pub delivered: usize,
    pub pending_eose: FxHashSet<String>,
    pub eosed: bool,
}

pub(crate) struct PublishRecord {
    pub publish_id: String,
    pub writer: SubBufferWriter,
}

pub(crate) type SharedSubs = Rc<RefCell<FxHashMap<String, Sub>>>;
pub(crate) type SharedPublishes = Rc<RefCell<FxHashMap<String, PublishRecord>>>;

pub struct NetworkManager {
    to_cache: Rc<Port>,
    subs: SharedSubs,
    publishes: SharedPublishes,
    pub subscription_manager: subscription::SubscriptionManager,
    pub publish_manager: publish::PublishManager,
}

impl NetworkManager {
    pub fn new(
        to_cache: Port,
        from_cache: mpsc::Receiver<Vec<u8>>,
        from_connections: mpsc::Receiver<Vec<u8>>,
        signer: Rc<SignerClient>,
    ) -> Rc<Self> {
        let to_cache = Rc::new(to_cache);
        let subs: SharedSubs = Rc::new(RefCell::new(FxHashMap::default()));
        let publishes: SharedPublishes = Rc::new(RefCell::new(FxHashMap::default()));

        let subscription_manager =
            subscription::SubscriptionManager::new(to_cache.clone(), subs.clone());
        let publish_manager =
            publish::PublishManager::new(to_cache.clone(), publishes.clone(), signer);

        let manager = Rc::new(Self {
            to_cache,
            subs,
            publishes,
            subscription_manager,
            publish_manager,
        });

        manager.clone().start_response_reader(from_cache, from_connections);
        manager
    }

    fn start_response_reader(
        self: Rc<Self>,
        mut from_cache: mpsc::Receiver<Vec<u8>>,
        mut from_connections: mpsc::Receiver<Vec<u8>>,
    ) {
        spawn_local(async move {
            loop {
                select! {
                    bytes = from_connections.next().fuse() => match bytes {
                        Some(bytes) => self.route_relay_bytes(&bytes),
                        None => break,
                    },
                    bytes = from_cache.next().fuse() => match bytes {
                        Some(bytes) => self.route_cache_bytes(&bytes),
                        None => break,
                    },
                }
            }
            info!("response reader ended");
        });
    }

    fn route_relay_bytes(&self, bytes: &[u8]) {
        let frame: RelayFrame = match messages::decode(bytes) {
            Ok(f) => f,
            Err(e) => {
                warn!("undecodable relay frame: {}", e);
                return;
            }
        };
        self.route_relay_frame(frame);
    }

    fn route_relay_frame(&self, frame: RelayFrame) {
        let incoming = match wire::classify_incoming(&frame.raw) {
            Some(i) => i,
            None => {
                warn!(relay = %frame.url, "unclassifiable relay frame");
                return;
            }
        };

        // Decide under the borrow, act after releasing it: closing a
        // subscription re-enters the map.
        let mut close_after: Option<String> = None;
        let mut ingest: Option<Event> = None;

        {
            let mut subs = self.subs.borrow_mut();
            if let Some(sub) = subs.get_mut(&frame.sub_id) {
                match incoming.kind {
                    wire::IncomingKind::Event => {
                        if sub.max_events.is_some_and(|m| sub.delivered >= m) {
                            return;
                        }
                        if let Some(raw_event) = incoming.payload {
                            if let Ok(event) = Event::from_json(raw_event) {
                                ingest = Some(event);
                            }
                        }
                        write_record(
                            &mut sub.writer,
                            &WorkerToMainMessage::Event {
                                sub_id: frame.sub_id.clone(),
                                relay: frame.url.clone(),
                                raw: frame.raw.clone(),
                            },
                        );
                        sub.delivered += 1;
                        notify(&frame.sub_id);
                        if sub.max_events.is_some_and(|m| sub.delivered >= m) {
                            close_after = Some(frame.sub_id.clone());
                        }
                    }
                    wire::IncomingKind::Eose | wire::IncomingKind::Closed => {
                        sub.pending_eose.remove(&frame.url);
                        write_record(
                            &mut sub.writer,
                            &WorkerToMainMessage::Eose {
                                sub_id: frame.sub_id.clone(),
                                relay: frame.url.clone(),
                            },
                        );
                        notify(&frame.sub_id);
                        if sub.pending_eose.is_empty() {
                            sub.eosed = true;
                            if sub.close_on_eose {
                                close_after = Some(frame.sub_id.clone());
                            }
                        }
                    }
                    wire::IncomingKind::Ok => {
                        debug!(sub_id = %frame.sub_id, "OK for a live subscription ignored");
                    }
                    wire::IncomingKind::Notice | wire::IncomingKind::Auth => {
                        debug!(relay = %frame.url, raw = %frame.raw, "relay notice");
                    }
                }
            } else {
                drop(subs);
                self.route_publish_frame(&frame, &incoming);
            }
        }

        if let Some(event) = ingest {
            self.send_to_cache(&CacheCommand::Ingest {
                events: vec![event],
            });
        }
        if let Some(sub_id) = close_after {
            self.subscription_manager.close(&sub_id);
        }
    }

    /// OK frames for publishes arrive keyed by event id.
    fn route_publish_frame(&self, frame: &RelayFrame, incoming: &wire::Incoming<'_>) {
        if incoming.kind != wire::IncomingKind::Ok {
            debug!(sub_id = %frame.sub_id, "frame for unknown subscription");
            return;
        }
        let mut publishes = self.publishes.borrow_mut();
        let record = match publishes.get_mut(&frame.sub_id) {
            Some(r) => r,
            None => {
                debug!(event_id = %frame.sub_id, "OK for unknown publish");
                return;
            }
        };

        let accepted = incoming.payload == Some("true");
        let update = RelayStatusUpdate {
            relay: frame.url.clone(),
            status: if accepted {
                PublishStatus::Success
            } else {
                PublishStatus::Rejected
            },
            message: frame.raw.clone(),
            timestamp: js_sys::Date::now() as u64,
        };
        let publish_id = record.publish_id.clone();
        write_record(
            &mut record.writer,
            &WorkerToMainMessage::PublishUpdate {
                publish_id: publish_id.clone(),
                update,
            },
        );
        notify(&publish_id);
    }

    fn route_cache_bytes(&self, bytes: &[u8]) {
        let reply: CacheReply = match messages::decode(bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!("undecodable cache reply: {}", e);
                return;
            }
        };
        let CacheReply::Events { sub_id, events } = reply;

        let mut subs = self.subs.borrow_mut();
        let Some(sub) = subs.get_mut(&sub_id) else {
            debug!(sub_id = %sub_id, "cache reply for closed subscription");
            return;
        };

        for event in &events {
            if sub.max_events.is_some_and(|m| sub.delivered >= m) {
                break;
            }
            write_record(
                &mut sub.writer,
                &WorkerToMainMessage::CachedEvent {
                    sub_id: sub_id.clone(),
                    json: event.as_json(),
                },
            );
            sub.delivered += 1;
        }
        // End of cached events, whatever the remote side still owes.
        write_record(&mut sub.writer, &WorkerToMainMessage::Eoce { sub_id: sub_id.clone() });
        notify(&sub_id);
    }

    pub(crate) fn send_to_cache(&self, command: &CacheCommand) {
        send_to_cache(&self.to_cache, command);
    }
}

/// Encode a record into a subscription buffer.
pub(crate) fn write_record(writer: &mut SubBufferWriter, message: &WorkerToMainMessage) {
    match messages::encode(message) {
        Ok(bytes) => {
            writer.write(&bytes);
        }
        Err(e) => warn!("failed to encode buffer record: {}", e),
    }
}

/// Tell the UI thread a buffer has new data.
pub(crate) fn notify(fingerprint: &str) {
    post_worker_message(&JsValue::from_str(fingerprint));
}

pub(crate) fn send_to_cache(to_cache: &Port, command: &CacheCommand) {
    match messages::encode(command) {
        Ok(bytes) => {
            if let Err(e) = to_cache.send(&bytes) {
                warn!("cache port send failed: {:?}", e);
            }
        }
        Err(e) => warn!("failed to encode cache command: {}", e),
    }
}
