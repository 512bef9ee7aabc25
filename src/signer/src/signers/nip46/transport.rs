//! NIP-46 wire plumbing: the REQ subscription for replies and the kind-24133
//! RPC events, both delivered to the Connections worker as envelopes.

use crate::signers::{SignerError, SignerResult};
use serde_json::json;
use shared::nostr_crypto;
use shared::types::{Event, EventId, Keys};
use shared::Port;
use std::rc::Rc;
use tracing::error;

/// Kind of a Nostr Connect RPC event.
pub const NIP46_KIND: u16 = 24133;

pub struct Transport {
    to_connections: Rc<Port>,
    relays: Vec<String>,
    app_name: Option<String>,
    client_keys: Keys,
    client_pubkey_hex: String,
}

impl Transport {
    pub fn new(
        to_connections: Rc<Port>,
        relays: Vec<String>,
        app_name: Option<String>,
        client_keys: Keys,
    ) -> Self {
        let client_pubkey_hex = client_keys.public_key().to_hex();
        Self {
            to_connections,
            relays,
            app_name,
            client_keys,
            client_pubkey_hex,
        }
    }

    /// Subscribe to RPC replies addressed to our ephemeral client key.
    pub fn open_req_subscription(&self, sub_id: &str) {
        let filter = json!({
            "kinds": [NIP46_KIND],
            "#p": [self.client_pubkey_hex],
        })
        .to_string();
        let frame = format!(r#"["REQ","{}",{}]"#, sub_id, filter);
        self.publish_frames(&[frame]);
    }

    pub fn send_close(&self, sub_id: &str) {
        let frame = format!(r#"["CLOSE","{}"]"#, sub_id);
        self.publish_frames(&[frame]);
    }

    /// Wrap an encrypted RPC payload in a signed kind-24133 event and send it.
    pub fn publish_rpc_event(
        &self,
        encrypted_content: &str,
        remote_pubkey: &str,
        unix_time: u64,
    ) -> SignerResult<()> {
        let mut tags = vec![vec!["p".to_string(), remote_pubkey.to_string()]];
        if let Some(app) = &self.app_name {
            tags.push(vec!["client".to_string(), app.clone()]);
        }

        let pubkey = self.client_keys.public_key();
        let id_hex = nostr_crypto::compute_event_id(
            &pubkey,
            unix_time,
            NIP46_KIND,
            &tags,
            encrypted_content,
        );
        let id = EventId::from_hex(&id_hex).map_err(|e| SignerError::Crypto(e.to_string()))?;
        let sig = nostr_crypto::sign_event_id(self.client_keys.secret_key(), &id)
            .map_err(|e| SignerError::Crypto(e.to_string()))?;

        let event = Event {
            id,
            pubkey,
            created_at: unix_time,
            kind: NIP46_KIND,
            tags,
            content: encrypted_content.to_string(),
            sig,
        };

        let frame = format!(r#"["EVENT",{}]"#, event.as_json());
        self.publish_frames(&[frame]);
        Ok(())
    }

    pub fn publish_frames(&self, frames: &[String]) {
        let env = json!({
            "relays": self.relays,
            "frames": frames,
        });
        match serde_json::to_vec(&env) {
            Ok(bytes) => {
                if let Err(e) = self.to_connections.send(&bytes) {
                    error!("failed to send envelope to connections: {:?}", e);
                }
            }
            Err(e) => error!("failed to encode envelope: {}", e),
        }
    }
}
