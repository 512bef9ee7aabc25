//! MessagePort endpoints.
//!
//! A `Port` wraps one end of a channel between execution contexts: `send`
//! posts byte frames, `receiver` bridges inbound frames into a bounded async
//! stream. The bridge closure is owned by the Port and detached when the
//! Port drops, so no handler outlives its endpoint — callers that only read
//! must keep the Port alive alongside the stream.

use futures::channel::mpsc;
use wasm_bindgen::prelude::*;
use web_sys::{MessageEvent, MessagePort};

use std::cell::RefCell;

/// Bound on buffered inbound frames; frames beyond it are dropped, which
/// the record framings tolerate.
const CHANNEL_DEPTH: usize = 64;

pub struct Port {
    port: MessagePort,
    bridge: RefCell<Option<Closure<dyn FnMut(MessageEvent)>>>,
}

impl Port {
    pub fn new(port: MessagePort) -> Self {
        Self {
            port,
            bridge: RefCell::new(None),
        }
    }

    /// Post bytes to the other end of this channel.
    pub fn send(&self, bytes: &[u8]) -> Result<(), JsValue> {
        self.port.post_message(&js_sys::Uint8Array::from(bytes))
    }

    /// Install the inbound bridge and return its byte stream. Installing a
    /// second time replaces the previous bridge, closing its stream.
    pub fn receiver(&self) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);

        let bridge: Closure<dyn FnMut(MessageEvent)> = Closure::new(move |event: MessageEvent| {
            if let Some(bytes) = binary_payload(&event.data()) {
                // Inside a JS callback, so never block on a full queue.
                let mut tx = tx.clone();
                let _ = tx.try_send(bytes);
            }
        });
        self.port.set_onmessage(Some(bridge.as_ref().unchecked_ref()));
        *self.bridge.borrow_mut() = Some(bridge);

        rx
    }

    pub fn inner(&self) -> &MessagePort {
        &self.port
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        if self.bridge.borrow().is_some() {
            self.port.set_onmessage(None);
        }
    }
}

impl From<MessagePort> for Port {
    fn from(port: MessagePort) -> Self {
        Self::new(port)
    }
}

/// Only byte frames travel between contexts; anything else is ignored.
fn binary_payload(data: &JsValue) -> Option<Vec<u8>> {
    let view = if data.is_instance_of::<js_sys::ArrayBuffer>() {
        js_sys::Uint8Array::new(data)
    } else {
        data.dyn_ref::<js_sys::Uint8Array>()?.clone()
    };
    let mut bytes = vec![0u8; view.length() as usize];
    view.copy_to(&mut bytes);
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_bindgen_test::*;

    wasm_bindgen_test_configure!(run_in_browser);

    #[wasm_bindgen_test]
    fn bridge_is_detached_when_the_port_drops() {
        let channel = web_sys::MessageChannel::new().unwrap();
        let endpoint = Port::new(channel.port1());
        let _rx = endpoint.receiver();
        assert!(channel.port1().onmessage().is_some());

        drop(endpoint);
        assert!(channel.port1().onmessage().is_none());
    }
}
