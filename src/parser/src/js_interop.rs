use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;

/// Post a message to the embedding context from inside a dedicated worker.
/// New-data notifications (fingerprint strings) and control responses both go
/// through here.
pub fn post_worker_message(msg: &JsValue) {
    let global = js_sys::global();
    match global.dyn_into::<web_sys::DedicatedWorkerGlobalScope>() {
        Ok(scope) => {
            if let Err(e) = scope.post_message(msg) {
                tracing::warn!("postMessage failed: {:?}", e);
            }
        }
        Err(_) => tracing::warn!("not in a dedicated worker scope, message dropped"),
    }
}
