//! The relay connection registry.
//!
//! Owns one RelayConnection per canonical URL plus the registry-level policy
//! state: the disabled set, per-URL cooldown horizons, active-REQ reference
//! counts and the delayed idle-disconnect timers. All of that state lives in
//! this worker; other contexts only see it through request/response messages.

use crate::connection::{OutWriter, RelayConnection, StatusWriter};
use crate::types::{ConnectionStatus, RelayConfig, RelayError};

use futures::future::join_all;
use gloo_timers::future::TimeoutFuture;
use rustc_hash::{FxHashMap, FxHashSet};
use shared::wire::{client_frame_kind, ClientFrameKind};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use wasm_bindgen_futures::spawn_local;

pub struct ConnectionRegistry {
    connections: Rc<RefCell<FxHashMap<String, Arc<RelayConnection>>>>,
    /// URLs that gave up; never reconnected automatically.
    disabled: Rc<RefCell<FxHashSet<String>>>,
    /// Cooldown horizon per URL; connects before it fail immediately.
    next_allowed: Rc<RefCell<FxHashMap<String, f64>>>,
    /// Active REQ count per URL.
    req_counts: Rc<RefCell<FxHashMap<String, u32>>>,
    /// Generation counter per URL; a new REQ bumps it and thereby cancels
    /// any scheduled idle disconnect.
    close_epochs: Rc<RefCell<FxHashMap<String, u64>>>,
    config: RelayConfig,
    out_writer: OutWriter,
    status_writer: StatusWriter,
}

impl Clone for ConnectionRegistry {
    fn clone(&self) -> Self {
        Self {
            connections: self.connections.clone(),
            disabled: self.disabled.clone(),
            next_allowed: self.next_allowed.clone(),
            req_counts: self.req_counts.clone(),
            close_epochs: self.close_epochs.clone(),
            config: self.config.clone(),
            out_writer: self.out_writer.clone(),
            status_writer: self.status_writer.clone(),
        }
    }
}

impl ConnectionRegistry {
    pub fn new(config: RelayConfig, out_writer: OutWriter, status_writer: StatusWriter) -> Self {
        Self {
            connections: Rc::new(RefCell::new(FxHashMap::default())),
            disabled: Rc::new(RefCell::new(FxHashSet::default())),
            next_allowed: Rc::new(RefCell::new(FxHashMap::default())),
            req_counts: Rc::new(RefCell::new(FxHashMap::default())),
            close_epochs: Rc::new(RefCell::new(FxHashMap::default())),
            config,
            out_writer,
            status_writer,
        }
    }

    fn now(&self) -> f64 {
        js_sys::Date::now()
    }

    fn is_cooling_down(&self, url: &str) -> bool {
        match self.next_allowed.borrow().get(url) {
            Some(at) => self.now() < *at,
            None => false,
        }
    }

    /// Apply the failure policy for a URL: a given-up connection disables the
    /// relay with the long cooldown, anything else gets the short one.
    fn give_up_or_cooldown(&self, url: &str, conn: &Arc<RelayConnection>) {
        if conn.has_given_up() {
            self.disabled.borrow_mut().insert(url.to_string());
            self.next_allowed
                .borrow_mut()
                .insert(url.to_string(), self.now() + self.config.cooldown_ms as f64);
        } else {
            let cooldown = self
                .config
                .transient_cooldown_ms
                .min(self.config.cooldown_ms) as f64;
            self.next_allowed
                .borrow_mut()
                .insert(url.to_string(), self.now() + cooldown);
        }
    }

    /// Get or create the connection for a URL and wait until it is ready.
    pub async fn ensure_connection(&self, url: &str) -> Result<Arc<RelayConnection>, RelayError> {
        if self.disabled.borrow().contains(url) {
            return Err(RelayError::DisabledRelay(url.to_string()));
        }
        if self.is_cooling_down(url) {
            return Err(RelayError::CoolingDown(url.to_string()));
        }

        let conn = {
            let mut connections = self.connections.borrow_mut();
            if let Some(existing) = connections.get(url) {
                existing.clone()
            } else {
                let conn = RelayConnection::new(
                    url.to_string(),
                    self.config.clone(),
                    self.out_writer.clone(),
                    self.status_writer.clone(),
                );
                connections.insert(url.to_string(), conn.clone());
                conn
            }
        };

        // Kick a connect when the socket is not there; fire-and-forget, the
        // readiness wait below observes the outcome.
        if !conn.status().is_ready() {
            let nudge = conn.clone();
            spawn_local(async move {
                if let Err(e) = nudge.connect().await {
                    tracing::debug!(relay = %nudge.url(), error = %e, "connect attempt failed");
                }
            });
        }

        match conn.wait_for_ready(self.config.connect_timeout_ms).await {
            Ok(()) => Ok(conn),
            Err(e) => {
                self.give_up_or_cooldown(url, &conn);
                Err(e)
            }
        }
    }

    /// Dispatch frames to each relay: parallel across relays, sequential
    /// within one. Disabled and cooling-down relays are skipped silently.
    pub async fn send_to_relays(&self, relays: &[String], frames: &[String]) {
        if relays.is_empty() || frames.is_empty() {
            return;
        }

        let targets: Vec<String> = relays
            .iter()
            .map(|u| normalize_relay_url(u))
            .filter(|u| !self.disabled.borrow().contains(u) && !self.is_cooling_down(u))
            .collect();

        let sends = targets.into_iter().map(|url| {
            let registry = self.clone();
            let frames = frames.to_vec();
            async move {
                if let Err(e) = registry.send_frames_to_relay(&url, &frames).await {
                    tracing::warn!(relay = %url, error = %e, "send_to_relays: relay dropped");
                }
            }
        });
        join_all(sends).await;
    }

    async fn send_frames_to_relay(&self, url: &str, frames: &[String]) -> Result<(), RelayError> {
        if let Err(e) = validate_relay_url(url) {
            return Err(e);
        }
        let conn = self.ensure_connection(url).await?;

        for frame in frames {
            let kind = client_frame_kind(frame);
            if let Err(e) = conn.send_frame(frame).await {
                self.give_up_or_cooldown(url, &conn);
                self.disconnect(url).await;
                return Err(e);
            }
            match kind {
                ClientFrameKind::Req => self.note_req(url),
                ClientFrameKind::Close => self.note_close(url),
                ClientFrameKind::Other => {}
            }
        }
        Ok(())
    }

    fn note_req(&self, url: &str) {
        *self
            .req_counts
            .borrow_mut()
            .entry(url.to_string())
            .or_insert(0) += 1;
        // Cancel any pending idle disconnect for this URL.
        *self
            .close_epochs
            .borrow_mut()
            .entry(url.to_string())
            .or_insert(0) += 1;
    }

    fn note_close(&self, url: &str) {
        let remaining = {
            let mut counts = self.req_counts.borrow_mut();
            let count = counts.entry(url.to_string()).or_insert(0);
            *count = count.saturating_sub(1);
            *count
        };
        if remaining == 0 {
            self.schedule_idle_disconnect(url);
        }
    }

    /// Disconnect the URL after the close-delay grace, unless a REQ shows up
    /// in the meantime.
    fn schedule_idle_disconnect(&self, url: &str) {
        let epoch = {
            let mut epochs = self.close_epochs.borrow_mut();
            let e = epochs.entry(url.to_string()).or_insert(0);
            *e += 1;
            *e
        };

        let registry = self.clone();
        let url = url.to_string();
        let delay = self.config.close_delay_ms;
        spawn_local(async move {
            TimeoutFuture::new(delay).await;
            let still_current = registry.close_epochs.borrow().get(&url) == Some(&epoch);
            let still_idle = registry.get_active_req_count(&url) == 0;
            if still_current && still_idle {
                tracing::debug!(relay = %url, "idle after CLOSE grace, disconnecting");
                registry.disconnect(&url).await;
            }
        });
    }

    /// Send CLOSE for a subscription on every live connection. Used for the
    /// close hints that arrive as bare fingerprint strings.
    pub fn close_subscription(&self, sub_id: &str) {
        let frame = format!(r#"["CLOSE","{}"]"#, sub_id);
        let conns: Vec<(String, Arc<RelayConnection>)> = self
            .connections
            .borrow()
            .iter()
            .filter(|(_, c)| c.status().is_ready())
            .map(|(u, c)| (u.clone(), c.clone()))
            .collect();
        for (url, conn) in conns {
            let registry = self.clone();
            let frame = frame.clone();
            spawn_local(async move {
                if conn.send_frame(&frame).await.is_ok() {
                    registry.note_close(&url);
                }
            });
        }
    }

    pub async fn disconnect(&self, url: &str) {
        let normalized = normalize_relay_url(url);
        let conn = self.connections.borrow_mut().remove(&normalized);
        self.req_counts.borrow_mut().remove(&normalized);
        if let Some(conn) = conn {
            if let Err(e) = conn.close().await {
                tracing::error!(relay = %normalized, error = %e, "close failed");
            }
        }
    }

    pub async fn disconnect_all(&self) {
        let conns: Vec<Arc<RelayConnection>> = {
            let mut connections = self.connections.borrow_mut();
            let drained: Vec<_> = connections.drain().map(|(_, c)| c).collect();
            drained
        };
        self.req_counts.borrow_mut().clear();
        for conn in conns {
            if let Err(e) = conn.close().await {
                tracing::error!(error = %e, "close failed during disconnect_all");
            }
        }
    }

    /// Lift a disable and its cooldown so the URL may connect again.
    pub fn enable_relay(&self, url: &str) {
        let normalized = normalize_relay_url(url);
        self.disabled.borrow_mut().remove(&normalized);
        self.next_allowed.borrow_mut().remove(&normalized);
    }

    pub fn is_relay_disabled(&self, url: &str) -> bool {
        self.disabled.borrow().contains(&normalize_relay_url(url))
    }

    pub fn get_connection_status(&self, url: &str) -> Option<ConnectionStatus> {
        self.connections
            .borrow()
            .get(&normalize_relay_url(url))
            .map(|c| c.status())
    }

    pub fn get_active_req_count(&self, url: &str) -> u32 {
        *self.req_counts.borrow().get(url).unwrap_or(&0)
    }

    pub fn get_all_statuses(&self) -> Vec<(String, ConnectionStatus)> {
        self.connections
            .borrow()
            .iter()
            .map(|(url, conn)| (url.clone(), conn.status()))
            .collect()
    }

    /// Sweep connections that sat idle past the configured timeout with no
    /// active requests.
    pub async fn cleanup(&self) {
        let now = self.now();
        let idle: Vec<String> = self
            .connections
            .borrow()
            .iter()
            .filter(|(url, conn)| {
                self.get_active_req_count(url) == 0
                    && conn.idle_ms(now) > self.config.idle_timeout_ms as f64
            })
            .map(|(url, _)| url.clone())
            .collect();

        for url in idle {
            tracing::debug!(relay = %url, "sweeping idle connection");
            self.disconnect(&url).await;
        }
    }
}

/// Normalize a relay URL: trim, lowercase, drop the trailing slash.
pub fn normalize_relay_url(url: &str) -> String {
    let mut normalized = url.trim().to_lowercase();
    if normalized.ends_with('/') && normalized.len() > 1 {
        normalized.pop();
    }
    normalized
}

/// Relay URLs must be ws:// or wss://.
pub fn validate_relay_url(url: &str) -> Result<(), RelayError> {
    if url.is_empty() {
        return Err(RelayError::InvalidUrl("URL cannot be empty".to_string()));
    }
    if !url.starts_with("ws://") && !url.starts_with("wss://") {
        return Err(RelayError::InvalidUrl(
            "URL must start with ws:// or wss://".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_is_canonical() {
        assert_eq!(
            normalize_relay_url(" WSS://Relay.Example.com/ "),
            "wss://relay.example.com"
        );
        assert_eq!(normalize_relay_url("wss://r"), "wss://r");
    }

    #[test]
    fn validation_requires_websocket_scheme() {
        assert!(validate_relay_url("wss://relay.example.com").is_ok());
        assert!(validate_relay_url("ws://localhost:7777").is_ok());
        assert!(validate_relay_url("https://relay.example.com").is_err());
        assert!(validate_relay_url("").is_err());
    }
}
