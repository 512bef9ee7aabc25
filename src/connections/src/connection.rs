//! One WebSocket to one relay.
//!
//! The connection owns the socket lifecycle: open, reader task, bounded
//! reconnects with jittered backoff, ready-waiter wakeups and the final
//! close. Inbound text frames are classified and handed to `out_writer`;
//! state transitions go to `status_writer`. Neither callback may block.
//!
//! Exactly one active WebSocket per RelayConnection: the previous reader is
//! aborted and the sink closed before a new socket opens.

use crate::backoff::reconnect_delay_ms;
use crate::types::{ConnectionStats, ConnectionStatus, RelayConfig, RelayError};

use futures::channel::oneshot;
use futures::future::{AbortHandle, Abortable};
use futures::lock::Mutex;
use futures::stream::{SplitSink, SplitStream};
use futures::{FutureExt, SinkExt, StreamExt};
use gloo_net::websocket::{futures::WebSocket, Message, State};
use gloo_timers::future::TimeoutFuture;
use shared::wire;
use std::rc::Rc;
use std::sync::{Arc, RwLock};
use wasm_bindgen_futures::spawn_local;

/// (url, sub_id, raw_text); sub_id is empty for frames without one.
pub type OutWriter = Rc<dyn Fn(&str, &str, &str)>;
/// (status, url), status ∈ {"connecting","connected","failed","close"}.
pub type StatusWriter = Rc<dyn Fn(&str, &str)>;

const OPEN_POLL_MS: u32 = 50;

pub struct RelayConnection {
    url: String,
    config: RelayConfig,

    status: Arc<RwLock<ConnectionStatus>>,
    ws_sink: Arc<Mutex<Option<SplitSink<WebSocket, Message>>>>,

    /// Failed connects since the last successful open.
    attempts: Arc<RwLock<u32>>,
    given_up: Arc<RwLock<bool>>,
    /// Cleared by an explicit close; suppresses all reconnect scheduling.
    want_reconnect: Arc<RwLock<bool>>,

    last_activity: Arc<RwLock<f64>>,
    ready_waiters: Arc<RwLock<Vec<oneshot::Sender<bool>>>>,
    read_abort: Arc<RwLock<Option<AbortHandle>>>,
    stats: Arc<RwLock<ConnectionStats>>,

    out_writer: OutWriter,
    status_writer: StatusWriter,
}

impl RelayConnection {
    pub fn new(
        url: String,
        config: RelayConfig,
        out_writer: OutWriter,
        status_writer: StatusWriter,
    ) -> Arc<Self> {
        Arc::new(Self {
            url,
            config,
            status: Arc::new(RwLock::new(ConnectionStatus::Idle)),
            ws_sink: Arc::new(Mutex::new(None)),
            attempts: Arc::new(RwLock::new(0)),
            given_up: Arc::new(RwLock::new(false)),
            want_reconnect: Arc::new(RwLock::new(true)),
            last_activity: Arc::new(RwLock::new(js_sys::Date::now())),
            ready_waiters: Arc::new(RwLock::new(Vec::new())),
            read_abort: Arc::new(RwLock::new(None)),
            stats: Arc::new(RwLock::new(ConnectionStats::default())),
            out_writer,
            status_writer,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read().unwrap()
    }

    pub fn attempts(&self) -> u32 {
        *self.attempts.read().unwrap()
    }

    pub fn has_given_up(&self) -> bool {
        *self.given_up.read().unwrap()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.read().unwrap().clone()
    }

    pub fn idle_ms(&self, now: f64) -> f64 {
        now - *self.last_activity.read().unwrap()
    }

    fn touch(&self) {
        *self.last_activity.write().unwrap() = js_sys::Date::now();
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.write().unwrap() = status;
    }

    fn wake_waiters(&self, ready: bool) {
        for waiter in self.ready_waiters.write().unwrap().drain(..) {
            let _ = waiter.send(ready);
        }
    }

    /// Block until Ready, a terminal failure, or the timeout.
    pub async fn wait_for_ready(self: &Arc<Self>, timeout_ms: u32) -> Result<(), RelayError> {
        if self.status().is_ready() {
            return Ok(());
        }
        if self.has_given_up() {
            return Err(RelayError::NotReady);
        }
        if !*self.want_reconnect.read().unwrap() {
            return Err(RelayError::ConnectionClosed);
        }

        let (tx, rx) = oneshot::channel::<bool>();
        self.ready_waiters.write().unwrap().push(tx);

        let mut ready = rx.fuse();
        let mut timeout = TimeoutFuture::new(timeout_ms).fuse();
        futures::select! {
            outcome = ready => match outcome {
                Ok(true) => Ok(()),
                _ => Err(RelayError::NotReady),
            },
            _ = timeout => Err(RelayError::Timeout),
        }
    }

    /// Open the socket. Returns once the socket is actually open; failures
    /// are counted and, below the attempt cap, a jittered reconnect is
    /// scheduled.
    pub async fn connect(self: &Arc<Self>) -> Result<(), RelayError> {
        if self.has_given_up() {
            return Err(RelayError::NotReady);
        }
        if !*self.want_reconnect.read().unwrap() {
            return Err(RelayError::ConnectionClosed);
        }
        {
            let status = self.status();
            if matches!(status, ConnectionStatus::Ready | ConnectionStatus::Connecting) {
                return Ok(());
            }
        }

        self.set_status(ConnectionStatus::Connecting);
        (self.status_writer)(shared::envelope::STATUS_CONNECTING, &self.url);

        // Tear down any previous socket before opening a new one.
        if let Some(handle) = self.read_abort.write().unwrap().take() {
            handle.abort();
        }
        {
            let mut sink_guard = self.ws_sink.lock().await;
            if let Some(sink) = sink_guard.as_mut() {
                let _ = SinkExt::close(sink).await;
            }
            *sink_guard = None;
        }

        let ws = match WebSocket::open(&self.url) {
            Ok(ws) => ws,
            Err(e) => {
                self.fail_connect();
                return Err(RelayError::WebSocketError(e.to_string()));
            }
        };

        // The constructor returns while the socket is still opening; poll the
        // readyState until it settles.
        let mut waited: u32 = 0;
        loop {
            match ws.state() {
                State::Open => break,
                State::Closing | State::Closed => {
                    self.fail_connect();
                    return Err(RelayError::WebSocketError("socket closed during open".into()));
                }
                State::Connecting => {
                    if waited >= self.config.connect_timeout_ms {
                        self.fail_connect();
                        return Err(RelayError::Timeout);
                    }
                    TimeoutFuture::new(OPEN_POLL_MS).await;
                    waited += OPEN_POLL_MS;
                }
            }
        }

        let (sink, stream) = ws.split();
        {
            let mut sink_guard = self.ws_sink.lock().await;
            *sink_guard = Some(sink);
        }
        self.spawn_reader(stream);

        self.set_status(ConnectionStatus::Ready);
        *self.attempts.write().unwrap() = 0;
        {
            let mut stats = self.stats.write().unwrap();
            stats.connected_at = Some(js_sys::Date::now() as u64);
        }
        self.touch();
        (self.status_writer)(shared::envelope::STATUS_CONNECTED, &self.url);
        self.wake_waiters(true);

        tracing::debug!(relay = %self.url, "connected");
        Ok(())
    }

    fn spawn_reader(self: &Arc<Self>, mut stream: SplitStream<WebSocket>) {
        let this = Arc::clone(self);

        let fut = async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        this.touch();
                        this.stats.write().unwrap().frames_received += 1;
                        match wire::classify_incoming(&text) {
                            Some(incoming) => {
                                let sub_id = incoming.sub_id.unwrap_or("");
                                (this.out_writer)(&this.url, sub_id, &text);
                            }
                            None => {
                                tracing::warn!(relay = %this.url, "malformed relay frame");
                            }
                        }
                    }
                    Ok(Message::Bytes(_)) => {
                        tracing::warn!(relay = %this.url, "unexpected binary frame");
                    }
                    Err(e) => {
                        if matches!(
                            this.status(),
                            ConnectionStatus::Closing | ConnectionStatus::Closed
                        ) {
                            break;
                        }
                        tracing::error!(relay = %this.url, error = %e, "WebSocket error");
                        this.on_stream_down();
                        return;
                    }
                }
            }

            // Stream ended: abnormal unless we closed on purpose.
            if !matches!(
                this.status(),
                ConnectionStatus::Closing | ConnectionStatus::Closed
            ) {
                this.on_stream_down();
            }
        };

        let (handle, registration) = AbortHandle::new_pair();
        *self.read_abort.write().unwrap() = Some(handle);
        let task = Abortable::new(fut, registration);
        spawn_local(async move {
            let _ = task.await;
        });
    }

    /// The socket dropped out from under a live connection.
    fn on_stream_down(self: &Arc<Self>) {
        self.set_status(ConnectionStatus::Closed);
        {
            let this = Arc::clone(self);
            spawn_local(async move {
                let mut sink_guard = this.ws_sink.lock().await;
                *sink_guard = None;
            });
        }
        (self.status_writer)(shared::envelope::STATUS_FAILED, &self.url);
        self.note_failure();
    }

    /// A connect attempt failed before the socket opened.
    fn fail_connect(self: &Arc<Self>) {
        self.set_status(ConnectionStatus::Closed);
        (self.status_writer)(shared::envelope::STATUS_FAILED, &self.url);
        self.note_failure();
    }

    /// Count a failure; give up at the cap, otherwise schedule a jittered
    /// reconnect.
    fn note_failure(self: &Arc<Self>) {
        let attempts = {
            let mut attempts = self.attempts.write().unwrap();
            *attempts += 1;
            *attempts
        };
        self.stats.write().unwrap().reconnect_attempts += 1;

        if attempts >= self.config.max_reconnect_attempts {
            *self.given_up.write().unwrap() = true;
            tracing::warn!(relay = %self.url, attempts, "giving up on relay");
            self.wake_waiters(false);
            return;
        }
        if !*self.want_reconnect.read().unwrap() {
            self.wake_waiters(false);
            return;
        }

        let delay =
            reconnect_delay_ms(&self.config.backoff, attempts, js_sys::Math::random()) as u32;
        tracing::debug!(relay = %self.url, attempts, delay_ms = delay, "scheduling reconnect");

        let this = Arc::clone(self);
        spawn_local(async move {
            TimeoutFuture::new(delay).await;
            if this.has_given_up() || !*this.want_reconnect.read().unwrap() {
                return;
            }
            if let Err(e) = this.connect().await {
                tracing::debug!(relay = %this.url, error = %e, "reconnect failed");
            }
        });
    }

    /// Send one text frame. The sink mutex serializes frames per relay.
    pub async fn send_frame(self: &Arc<Self>, text: &str) -> Result<(), RelayError> {
        if !self.status().is_ready() {
            return Err(RelayError::NotReady);
        }

        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard.as_mut().ok_or(RelayError::NotReady)?;

        if let Err(e) = sink.send(Message::Text(text.to_owned())).await {
            self.set_status(ConnectionStatus::Closed);
            *sink_guard = None;
            (self.status_writer)(shared::envelope::STATUS_FAILED, &self.url);
            return Err(RelayError::SendFailed(e.to_string()));
        }

        self.stats.write().unwrap().frames_sent += 1;
        self.touch();
        Ok(())
    }

    /// Deliberate close: no reconnects afterwards.
    pub async fn close(self: &Arc<Self>) -> Result<(), RelayError> {
        *self.want_reconnect.write().unwrap() = false;
        self.set_status(ConnectionStatus::Closing);

        if let Some(handle) = self.read_abort.write().unwrap().take() {
            handle.abort();
        }
        {
            let mut sink_guard = self.ws_sink.lock().await;
            if let Some(sink) = sink_guard.as_mut() {
                let _ = SinkExt::close(sink).await;
            }
            *sink_guard = None;
        }

        self.set_status(ConnectionStatus::Closed);
        (self.status_writer)(shared::envelope::STATUS_CLOSE, &self.url);
        self.wake_waiters(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_bindgen_test::*;

    wasm_bindgen_test_configure!(run_in_browser);

    fn writers() -> (OutWriter, StatusWriter) {
        (Rc::new(|_: &str, _: &str, _: &str| {}), Rc::new(|_: &str, _: &str| {}))
    }

    #[wasm_bindgen_test]
    fn fresh_connection_is_idle() {
        let (out_writer, status_writer) = writers();
        let conn = RelayConnection::new(
            "wss://relay.example.com".to_string(),
            RelayConfig::default(),
            out_writer,
            status_writer,
        );
        assert_eq!(conn.status(), ConnectionStatus::Idle);
        assert_eq!(conn.attempts(), 0);
        assert!(!conn.has_given_up());
    }

    #[wasm_bindgen_test]
    async fn send_on_idle_connection_is_refused() {
        let (out_writer, status_writer) = writers();
        let conn = RelayConnection::new(
            "wss://relay.example.com".to_string(),
            RelayConfig::default(),
            out_writer,
            status_writer,
        );
        assert!(matches!(
            conn.send_frame(r#"["REQ","s",{}]"#).await,
            Err(RelayError::NotReady)
        ));
    }
}
