//! Request, subscription-option and relay-status shapes. Field names follow
//! the camelCase wire convention of the embedding frontend.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// One filter of a subscription, including the relays it should reach.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Request {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    /// Single-character tag key -> accepted values.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<FxHashMap<String, Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    pub relays: Vec<String>,
    #[serde(rename = "closeOnEOSE")]
    pub close_on_eose: bool,
    pub cache_first: bool,
    pub no_cache: bool,
}

impl Request {
    /// The NIP-01 filter object for this request: everything except the
    /// routing fields.
    pub fn to_filter_json(&self) -> String {
        let mut obj = serde_json::Map::new();
        if let Some(ids) = &self.ids {
            obj.insert("ids".into(), serde_json::json!(ids));
        }
        if let Some(authors) = &self.authors {
            obj.insert("authors".into(), serde_json::json!(authors));
        }
        if let Some(kinds) = &self.kinds {
            obj.insert("kinds".into(), serde_json::json!(kinds));
        }
        if let Some(tags) = &self.tags {
            for (key, values) in tags {
                obj.insert(format!("#{}", key), serde_json::json!(values));
            }
        }
        if let Some(since) = self.since {
            obj.insert("since".into(), serde_json::json!(since));
        }
        if let Some(until) = self.until {
            obj.insert("until".into(), serde_json::json!(until));
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".into(), serde_json::json!(limit));
        }
        if let Some(search) = &self.search {
            obj.insert("search".into(), serde_json::json!(search));
        }
        serde_json::Value::Object(obj).to_string()
    }
}

/// Per-subscription behavior switches, as supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionOptions {
    pub close_on_eose: bool,
    pub cache_first: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_events: Option<usize>,
    pub skip_cache: bool,
    pub force: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_per_event: Option<usize>,
    pub enable_optimization: bool,
    /// Named transform stages, opaque to the core and forwarded as-is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Vec<String>>,
}

/// Per-relay progress of a publish operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    Pending,
    Sent,
    Success,
    Failed,
    Rejected,
    ConnectionError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayStatusUpdate {
    pub relay: String,
    pub status: PublishStatus,
    pub message: String,
    pub timestamp: u64,
}

/// Outbound frame batch handed to the Connections worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub relays: Vec<String>,
    pub frames: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_json_uses_hash_prefixed_tag_keys() {
        let mut tags = FxHashMap::default();
        tags.insert("p".to_string(), vec!["abc".to_string()]);
        let req = Request {
            kinds: Some(vec![1, 6]),
            tags: Some(tags),
            limit: Some(20),
            relays: vec!["wss://relay.example".into()],
            ..Default::default()
        };
        let filter: serde_json::Value = serde_json::from_str(&req.to_filter_json()).unwrap();
        assert_eq!(filter["kinds"], serde_json::json!([1, 6]));
        assert_eq!(filter["#p"], serde_json::json!(["abc"]));
        assert_eq!(filter["limit"], 20);
        // Routing fields never leak into the relay filter.
        assert!(filter.get("relays").is_none());
        assert!(filter.get("closeOnEOSE").is_none());
    }

    #[test]
    fn options_accept_camel_case_input() {
        let opts: SubscriptionOptions = serde_json::from_str(
            r#"{"closeOnEose":true,"cacheFirst":true,"timeoutMs":3000,"bytesPerEvent":1024}"#,
        )
        .unwrap();
        assert!(opts.close_on_eose);
        assert!(opts.cache_first);
        assert_eq!(opts.timeout_ms, Some(3000));
        assert_eq!(opts.bytes_per_event, Some(1024));
        assert!(!opts.skip_cache);
    }
}
