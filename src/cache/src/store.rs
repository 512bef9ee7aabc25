//! In-memory event store with id de-duplication and kind/author indexes.
//!
//! The store answers subscription requests locally before any relay is
//! touched. It is memory-only: nothing here survives the worker.

use rustc_hash::{FxHashMap, FxHashSet};
use shared::types::{Event, Request};

#[derive(Default)]
pub struct EventStore {
    events: FxHashMap<String, Event>,
    by_kind: FxHashMap<u16, FxHashSet<String>>,
    by_author: FxHashMap<String, FxHashSet<String>>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Insert one event; duplicates by id are ignored. Returns true when the
    /// event was new.
    pub fn insert(&mut self, event: Event) -> bool {
        let id = event.id.to_hex();
        if self.events.contains_key(&id) {
            return false;
        }
        self.by_kind
            .entry(event.kind)
            .or_default()
            .insert(id.clone());
        self.by_author
            .entry(event.pubkey.to_hex())
            .or_default()
            .insert(id.clone());
        self.events.insert(id, event);
        true
    }

    pub fn insert_all(&mut self, events: Vec<Event>) -> usize {
        events.into_iter().filter(|e| self.insert(e.clone())).count()
    }

    /// Answer one request from the store: newest first, capped by `limit`.
    pub fn query(&self, request: &Request) -> Vec<Event> {
        let candidates = self.candidate_ids(request);

        let mut hits: Vec<&Event> = candidates
            .into_iter()
            .filter_map(|id| self.events.get(&id))
            .filter(|e| matches_request(e, request))
            .collect();

        hits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = request.limit {
            hits.truncate(limit);
        }
        hits.into_iter().cloned().collect()
    }

    /// Narrow the scan with whichever indexes the request can use.
    fn candidate_ids(&self, request: &Request) -> Vec<String> {
        if let Some(ids) = &request.ids {
            return ids.iter().filter(|id| self.events.contains_key(*id)).cloned().collect();
        }

        let kind_set = request.kinds.as_ref().map(|kinds| {
            union_id_sets(kinds.iter().filter_map(|k| self.by_kind.get(k)))
        });
        let author_set = request.authors.as_ref().map(|authors| {
            union_id_sets(authors.iter().filter_map(|a| self.by_author.get(a)))
        });

        match (kind_set, author_set) {
            (Some(kinds), Some(authors)) => intersect_id_sets(&kinds, &authors),
            (Some(set), None) | (None, Some(set)) => set.into_iter().collect(),
            (None, None) => self.events.keys().cloned().collect(),
        }
    }
}

fn union_id_sets<'a>(sets: impl Iterator<Item = &'a FxHashSet<String>>) -> FxHashSet<String> {
    let mut out = FxHashSet::default();
    for set in sets {
        out.extend(set.iter().cloned());
    }
    out
}

fn intersect_id_sets(a: &FxHashSet<String>, b: &FxHashSet<String>) -> Vec<String> {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small.iter().filter(|id| large.contains(*id)).cloned().collect()
}

/// The non-indexed predicates of a request.
fn matches_request(event: &Event, request: &Request) -> bool {
    if let Some(since) = request.since {
        if event.created_at < since {
            return false;
        }
    }
    if let Some(until) = request.until {
        if event.created_at > until {
            return false;
        }
    }
    if let Some(search) = &request.search {
        if !event.content.contains(search.as_str()) {
            return false;
        }
    }
    if let Some(tags) = &request.tags {
        for (key, accepted) in tags {
            let found = event.tags.iter().any(|tag| {
                tag.len() >= 2 && tag[0] == *key && accepted.contains(&tag[1])
            });
            if !found {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::{EventId, PublicKey};

    fn event(id_byte: u8, kind: u16, author_byte: u8, created_at: u64) -> Event {
        Event {
            id: EventId([id_byte; 32]),
            pubkey: PublicKey([author_byte; 32]),
            created_at,
            kind,
            tags: vec![],
            content: format!("event {}", id_byte),
            sig: String::new(),
        }
    }

    #[test]
    fn inserts_deduplicate_by_id() {
        let mut store = EventStore::new();
        assert!(store.insert(event(1, 1, 9, 100)));
        assert!(!store.insert(event(1, 1, 9, 100)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn query_by_kind_and_author_intersects() {
        let mut store = EventStore::new();
        store.insert(event(1, 1, 7, 100));
        store.insert(event(2, 1, 8, 101));
        store.insert(event(3, 6, 7, 102));

        let req = Request {
            kinds: Some(vec![1]),
            authors: Some(vec![PublicKey([7; 32]).to_hex()]),
            relays: vec![],
            ..Default::default()
        };
        let hits = store.query(&req);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, EventId([1; 32]));
    }

    #[test]
    fn query_orders_newest_first_and_applies_limit() {
        let mut store = EventStore::new();
        for i in 0..5u8 {
            store.insert(event(i, 1, 7, 100 + i as u64));
        }
        let req = Request {
            kinds: Some(vec![1]),
            limit: Some(2),
            relays: vec![],
            ..Default::default()
        };
        let hits = store.query(&req);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].created_at, 104);
        assert_eq!(hits[1].created_at, 103);
    }

    #[test]
    fn since_until_and_tags_filter() {
        let mut store = EventStore::new();
        let mut tagged = event(1, 1, 7, 150);
        tagged.tags = vec![vec!["p".to_string(), "peer".to_string()]];
        store.insert(tagged);
        store.insert(event(2, 1, 7, 50));

        let mut tags = rustc_hash::FxHashMap::default();
        tags.insert("p".to_string(), vec!["peer".to_string()]);
        let req = Request {
            since: Some(100),
            until: Some(200),
            tags: Some(tags),
            relays: vec![],
            ..Default::default()
        };
        let hits = store.query(&req);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, EventId([1; 32]));
    }

    #[test]
    fn id_query_skips_unknown_ids() {
        let mut store = EventStore::new();
        store.insert(event(1, 1, 7, 100));
        let req = Request {
            ids: Some(vec![EventId([1; 32]).to_hex(), EventId([2; 32]).to_hex()]),
            relays: vec![],
            ..Default::default()
        };
        assert_eq!(store.query(&req).len(), 1);
    }
}
