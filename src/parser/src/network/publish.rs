//! Publish pipeline: template -> signer -> EVENT broadcast -> per-relay
//! status records in the publish buffer.

use super::{notify, send_to_cache, write_record, PublishRecord, SharedPublishes};
use crate::signer_client::SignerClient;

use js_sys::SharedArrayBuffer;
use shared::sub_buffer::SubBufferWriter;
use shared::types::messages::{CacheCommand, WorkerToMainMessage};
use shared::types::{Envelope, Event, PublishStatus, RelayStatusUpdate, Template};
use shared::Port;
use std::rc::Rc;
use tracing::{info, warn};

pub struct PublishManager {
    to_cache: Rc<Port>,
    publishes: SharedPublishes,
    signer: Rc<SignerClient>,
}

impl PublishManager {
    pub(crate) fn new(
        to_cache: Rc<Port>,
        publishes: SharedPublishes,
        signer: Rc<SignerClient>,
    ) -> Self {
        Self {
            to_cache,
            publishes,
            signer,
        }
    }

    pub async fn publish(
        &self,
        publish_id: String,
        template: &Template,
        relays: &[String],
        buffer: SharedArrayBuffer,
    ) {
        let mut writer = SubBufferWriter::new(&buffer);

        if relays.is_empty() {
            warn!(publish_id = %publish_id, "publish without relays");
            return;
        }

        for relay in relays {
            write_update(&mut writer, &publish_id, relay, PublishStatus::Pending, "");
        }
        notify(&publish_id);

        let template_json = match serde_json::to_string(template) {
            Ok(j) => j,
            Err(e) => {
                warn!(publish_id = %publish_id, "unserializable template: {}", e);
                return;
            }
        };

        let signed_json = match self.signer.sign_event(template_json).await {
            Ok(j) => j,
            Err(e) => {
                warn!(publish_id = %publish_id, "signing failed: {}", e);
                for relay in relays {
                    write_update(&mut writer, &publish_id, relay, PublishStatus::Failed, &e);
                }
                notify(&publish_id);
                return;
            }
        };

        let event = match Event::from_json(&signed_json) {
            Ok(e) => e,
            Err(e) => {
                warn!(publish_id = %publish_id, "signer returned invalid event: {}", e);
                for relay in relays {
                    write_update(
                        &mut writer,
                        &publish_id,
                        relay,
                        PublishStatus::Failed,
                        "invalid signed event",
                    );
                }
                notify(&publish_id);
                return;
            }
        };
        let event_id = event.id.to_hex();
        info!(publish_id = %publish_id, event_id = %event_id, "broadcasting event");

        // Keep our own copy so later subscriptions see it locally.
        send_to_cache(
            &self.to_cache,
            &CacheCommand::Ingest {
                events: vec![event],
            },
        );

        let frame = format!(r#"["EVENT",{}]"#, signed_json);
        send_to_cache(
            &self.to_cache,
            &CacheCommand::Forward {
                envelope: Envelope {
                    relays: relays.to_vec(),
                    frames: vec![frame],
                },
            },
        );

        for relay in relays {
            write_update(&mut writer, &publish_id, relay, PublishStatus::Sent, "");
        }
        notify(&publish_id);

        // OK frames for this event id route back to this record.
        self.publishes
            .borrow_mut()
            .insert(event_id, PublishRecord { publish_id, writer });
    }
}

fn write_update(
    writer: &mut SubBufferWriter,
    publish_id: &str,
    relay: &str,
    status: PublishStatus,
    message: &str,
) {
    write_record(
        writer,
        &WorkerToMainMessage::PublishUpdate {
            publish_id: publish_id.to_string(),
            update: RelayStatusUpdate {
                relay: relay.to_string(),
                status,
                message: message.to_string(),
                timestamp: js_sys::Date::now() as u64,
            },
        },
    );
}
