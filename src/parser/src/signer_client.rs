//! Parser-facing client for the Signer worker.
//!
//! Requests are written to the signer port with a monotonically increasing
//! request id; a single background pump drains responses and completes the
//! matching pending future. Signing is thereby serialized on the signer's
//! loop while callers await asynchronously.

use futures_channel::oneshot;
use shared::types::messages::{self, SignerOp, SignerRequest, SignerResponse};
use shared::Port;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{info, warn};
use wasm_bindgen_futures::spawn_local;

use futures::channel::mpsc;
use futures::StreamExt;

pub struct SignerClient {
    port: Rc<Port>,
    pending: Rc<RefCell<HashMap<u64, oneshot::Sender<SignerResponse>>>>,
    next_id: Rc<Cell<u64>>,
}

impl SignerClient {
    pub fn new(port: Port) -> Self {
        let port = Rc::new(port);
        let pending: Rc<RefCell<HashMap<u64, oneshot::Sender<SignerResponse>>>> =
            Rc::new(RefCell::new(HashMap::new()));

        Self::spawn_pump(port.receiver(), pending.clone());

        Self {
            port,
            pending,
            next_id: Rc::new(Cell::new(1)),
        }
    }

    fn spawn_pump(
        mut rx: mpsc::Receiver<Vec<u8>>,
        pending: Rc<RefCell<HashMap<u64, oneshot::Sender<SignerResponse>>>>,
    ) {
        spawn_local(async move {
            while let Some(bytes) = rx.next().await {
                match messages::decode::<SignerResponse>(&bytes) {
                    Ok(response) => {
                        let rid = response.request_id;
                        if let Some(tx) = pending.borrow_mut().remove(&rid) {
                            let _ = tx.send(response);
                        } else {
                            warn!("signer response for unknown request_id={}", rid);
                        }
                    }
                    Err(e) => warn!("undecodable signer response: {}", e),
                }
            }
            info!("signer response pump ended");
        });
    }

    fn next_request_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1));
        id
    }

    /// Issue one op and await its response.
    pub async fn call(&self, op: SignerOp, payload: String, peer: String) -> Result<String, String> {
        let rid = self.next_request_id();
        let (tx, rx) = oneshot::channel::<SignerResponse>();
        self.pending.borrow_mut().insert(rid, tx);

        let request = SignerRequest {
            request_id: rid,
            op,
            payload,
            peer,
        };
        let bytes = match messages::encode(&request) {
            Ok(b) => b,
            Err(e) => {
                self.pending.borrow_mut().remove(&rid);
                return Err(format!("encode signer request: {}", e));
            }
        };
        if let Err(e) = self.port.send(&bytes) {
            self.pending.borrow_mut().remove(&rid);
            return Err(format!("signer port send failed: {:?}", e));
        }

        match rx.await {
            Ok(response) if response.ok => Ok(response.result),
            Ok(response) => Err(response.error),
            Err(_) => Err("signer response channel canceled".to_string()),
        }
    }

    /// Sign an event template (JSON), returning the signed event JSON.
    pub async fn sign_event(&self, template_json: String) -> Result<String, String> {
        self.call(SignerOp::SignEvent, template_json, String::new())
            .await
    }

    pub async fn get_public_key(&self) -> Result<String, String> {
        self.call(SignerOp::GetPubkey, String::new(), String::new())
            .await
    }
}
