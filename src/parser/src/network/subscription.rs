//! Subscription opening and closing.
//!
//! Opening a subscription answers it from the cache (unless told not to),
//! groups its requests by relay, and hands the REQ frames to Connections.
//! A concurrency permit keeps a burst of opens from starving the worker loop.

use super::{notify, send_to_cache, write_record, SharedSubs, Sub};
use gloo_timers::future::TimeoutFuture;
use js_sys::SharedArrayBuffer;
use rustc_hash::{FxHashMap, FxHashSet};
use shared::sub_buffer::SubBufferWriter;
use shared::types::messages::{CacheCommand, WorkerToMainMessage};
use shared::types::{Envelope, Request, SubscriptionOptions};
use shared::Port;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use wasm_bindgen_futures::spawn_local;

const MAX_CONCURRENT_OPENS: usize = 36;

pub struct SubscriptionManager {
    to_cache: Rc<Port>,
    subs: SharedSubs,
    permits: Arc<AtomicUsize>,
}

// Releases one permit when an open finishes.
struct PermitGuard {
    permits: Arc<AtomicUsize>,
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        self.permits.fetch_sub(1, Ordering::Release);
    }
}

impl SubscriptionManager {
    pub(crate) fn new(to_cache: Rc<Port>, subs: SharedSubs) -> Self {
        Self {
            to_cache,
            subs,
            permits: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn acquire_permit(&self) -> PermitGuard {
        let mut backoff_ms: u32 = 2;
        loop {
            let current = self.permits.load(Ordering::Relaxed);
            if current < MAX_CONCURRENT_OPENS
                && self
                    .permits
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                break;
            }
            TimeoutFuture::new(backoff_ms).await;
            backoff_ms = backoff_ms.saturating_mul(2).min(32);
        }
        PermitGuard {
            permits: self.permits.clone(),
        }
    }

    pub async fn open(
        &self,
        sub_id: String,
        buffer: SharedArrayBuffer,
        requests: Vec<Request>,
        options: &SubscriptionOptions,
    ) {
        let _permit = self.acquire_permit().await;

        if self.subs.borrow().contains_key(&sub_id) {
            debug!(sub_id = %sub_id, "subscription already open");
            return;
        }

        let relay_filters = group_requests_by_relay(&requests);
        let relays: Vec<String> = relay_filters.keys().cloned().collect();
        let pending_eose: FxHashSet<String> = relays.iter().cloned().collect();

        let mut sub = Sub {
            writer: SubBufferWriter::new(&buffer),
            relays: relays.clone(),
            close_on_eose: options.close_on_eose,
            max_events: options.max_events,
            delivered: 0,
            pending_eose,
            eosed: false,
        };

        if options.skip_cache {
            // No cache phase; mark it finished right away.
            write_record(&mut sub.writer, &WorkerToMainMessage::Eoce { sub_id: sub_id.clone() });
            notify(&sub_id);
        } else {
            send_to_cache(
                &self.to_cache,
                &CacheCommand::Query {
                    sub_id: sub_id.clone(),
                    requests: requests.clone(),
                },
            );
        }

        self.subs.borrow_mut().insert(sub_id.clone(), sub);

        for (relay, filters) in &relay_filters {
            let frame = build_req_frame(&sub_id, filters);
            send_to_cache(
                &self.to_cache,
                &CacheCommand::Forward {
                    envelope: Envelope {
                        relays: vec![relay.clone()],
                        frames: vec![frame],
                    },
                },
            );
        }

        if let Some(timeout_ms) = options.timeout_ms {
            self.spawn_timeout(sub_id, timeout_ms);
        }
    }

    /// After the timeout, a subscription that has not seen all its EOSEs is
    /// declared complete anyway.
    fn spawn_timeout(&self, sub_id: String, timeout_ms: u32) {
        let subs = self.subs.clone();
        spawn_local(async move {
            TimeoutFuture::new(timeout_ms).await;
            let mut subs = subs.borrow_mut();
            if let Some(sub) = subs.get_mut(&sub_id) {
                if !sub.eosed {
                    debug!(sub_id = %sub_id, timeout_ms, "remote wait timed out");
                    sub.eosed = true;
                    write_record(&mut sub.writer, &WorkerToMainMessage::Eoce {
                        sub_id: sub_id.clone(),
                    });
                    notify(&sub_id);
                }
            }
        });
    }

    /// Close a subscription: CLOSE to its relays, release cache bookkeeping,
    /// drop the record.
    pub fn close(&self, sub_id: &str) {
        let sub = self.subs.borrow_mut().remove(sub_id);
        let Some(sub) = sub else {
            return;
        };

        if !sub.relays.is_empty() {
            send_to_cache(
                &self.to_cache,
                &CacheCommand::Forward {
                    envelope: Envelope {
                        relays: sub.relays,
                        frames: vec![build_close_frame(sub_id)],
                    },
                },
            );
        }
        send_to_cache(
            &self.to_cache,
            &CacheCommand::Close {
                sub_id: sub_id.to_string(),
            },
        );
    }
}

/// Map each relay to the filters it should serve. Requests without relays are
/// dropped with a warning; relay URLs are normalized the way the registry
/// keys them.
pub fn group_requests_by_relay(requests: &[Request]) -> FxHashMap<String, Vec<String>> {
    let mut grouped: FxHashMap<String, Vec<String>> = FxHashMap::default();
    for request in requests {
        if request.relays.is_empty() {
            warn!("request without relays skipped");
            continue;
        }
        let filter = request.to_filter_json();
        for relay in &request.relays {
            let normalized = normalize_relay_url(relay);
            if !normalized.starts_with("ws://") && !normalized.starts_with("wss://") {
                warn!(relay = %relay, "invalid relay URL skipped");
                continue;
            }
            grouped.entry(normalized).or_default().push(filter.clone());
        }
    }
    grouped
}

fn normalize_relay_url(url: &str) -> String {
    let mut normalized = url.trim().to_lowercase();
    if normalized.ends_with('/') && normalized.len() > 1 {
        normalized.pop();
    }
    normalized
}

pub fn build_req_frame(sub_id: &str, filters: &[String]) -> String {
    let mut frame = format!(r#"["REQ","{}""#, sub_id);
    for filter in filters {
        frame.push(',');
        frame.push_str(filter);
    }
    frame.push(']');
    frame
}

pub fn build_close_frame(sub_id: &str) -> String {
    format!(r#"["CLOSE","{}"]"#, sub_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouping_collects_filters_per_relay() {
        let requests = vec![
            Request {
                kinds: Some(vec![1]),
                relays: vec!["wss://A.example/".into(), "wss://b.example".into()],
                ..Default::default()
            },
            Request {
                kinds: Some(vec![0]),
                relays: vec!["wss://b.example".into()],
                ..Default::default()
            },
        ];
        let grouped = group_requests_by_relay(&requests);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["wss://a.example"].len(), 1);
        assert_eq!(grouped["wss://b.example"].len(), 2);
    }

    #[test]
    fn requests_without_relays_are_dropped() {
        let requests = vec![Request::default()];
        assert!(group_requests_by_relay(&requests).is_empty());
    }

    #[test]
    fn req_frame_shape() {
        let frame = build_req_frame("feed", &[r#"{"kinds":[1]}"#.to_string()]);
        assert_eq!(frame, r#"["REQ","feed",{"kinds":[1]}]"#);
        assert_eq!(build_close_frame("feed"), r#"["CLOSE","feed"]"#);

        // The frame classifies as a REQ on the way out.
        assert_eq!(
            shared::wire::client_frame_kind(&frame),
            shared::wire::ClientFrameKind::Req
        );
    }
}
