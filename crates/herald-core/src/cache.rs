//! Bounded recency caches for events and topic payloads.
//!
//! Each publication that survives the veto phase is recorded in a per-key
//! buffer, newest at the front, trimmed to the key's effective cap. Caps come
//! from four tables — a global default, per-class, per-topic, and per-pattern
//! — with inheritance-aware resolution for classes and first-match resolution
//! for patterns. Resolution results are memoized; mutating any raw table sets
//! a dirty flag that drops the memo on the next read.
//!
//! All state lives behind its own `parking_lot::Mutex` (the cache lock),
//! independent of the index lock. Reads return defensive copies, never views
//! of the live buffers.

use std::collections::VecDeque;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::event::{ClassKey, Event, EventClass, TopicPattern};
use crate::subscriber::Payload;
use crate::{BusError, Result};

#[derive(Default)]
struct CacheState {
    default_cap: usize,
    class_caps: FxHashMap<ClassKey, usize>,
    topic_caps: FxHashMap<String, usize>,
    /// Pattern caps in insertion order; the first matching entry wins.
    pattern_caps: Vec<(TopicPattern, usize)>,
    class_memo: FxHashMap<ClassKey, usize>,
    topic_memo: FxHashMap<String, usize>,
    class_dirty: bool,
    topic_dirty: bool,
    class_events: FxHashMap<ClassKey, VecDeque<Arc<dyn Event>>>,
    topic_payloads: FxHashMap<String, VecDeque<Payload>>,
}

impl CacheState {
    fn resolve_class_cap(&mut self, class: &'static EventClass) -> usize {
        if self.class_dirty {
            self.class_memo.clear();
            self.class_dirty = false;
        }
        let key = ClassKey::of(class);
        if let Some(&cap) = self.class_memo.get(&key) {
            return cap;
        }
        let cap = self.compute_class_cap(class);
        self.class_memo.insert(key, cap);
        cap
    }

    /// Exact cap, else nearest capped ancestor, else first capped marker in
    /// declaration order, else the default.
    fn compute_class_cap(&self, class: &'static EventClass) -> usize {
        if let Some(&cap) = self.class_caps.get(&ClassKey::of(class)) {
            return cap;
        }
        let mut cursor = class.parent();
        while let Some(ancestor) = cursor {
            if let Some(&cap) = self.class_caps.get(&ClassKey::of(ancestor)) {
                return cap;
            }
            cursor = ancestor.parent();
        }
        for marker in class.marker_closure() {
            if let Some(&cap) = self.class_caps.get(&ClassKey::of(marker)) {
                return cap;
            }
        }
        self.default_cap
    }

    fn resolve_topic_cap(&mut self, topic: &str) -> usize {
        if self.topic_dirty {
            self.topic_memo.clear();
            self.topic_dirty = false;
        }
        if let Some(&cap) = self.topic_memo.get(topic) {
            return cap;
        }
        let cap = self.compute_topic_cap(topic);
        self.topic_memo.insert(topic.to_owned(), cap);
        cap
    }

    fn compute_topic_cap(&self, topic: &str) -> usize {
        if let Some(&cap) = self.topic_caps.get(topic) {
            return cap;
        }
        for (pattern, cap) in &self.pattern_caps {
            if pattern.matches(topic) {
                return *cap;
            }
        }
        self.default_cap
    }
}

/// The event/payload cache, guarded by the cache lock.
pub(crate) struct EventCache {
    inner: Mutex<CacheState>,
}

impl EventCache {
    pub(crate) fn new(default_cap: usize) -> Self {
        Self {
            inner: Mutex::new(CacheState {
                default_cap,
                ..CacheState::default()
            }),
        }
    }

    // -- cap configuration --

    pub(crate) fn set_default_cap(&self, cap: usize) {
        let state = &mut *self.inner.lock();
        state.default_cap = cap;
        state.class_dirty = true;
        state.topic_dirty = true;
    }

    pub(crate) fn default_cap(&self) -> usize {
        self.inner.lock().default_cap
    }

    /// Marker classes are accepted here; they act as inherited defaults for
    /// implementing classes.
    pub(crate) fn set_class_cap(&self, class: &'static EventClass, cap: usize) {
        let state = &mut *self.inner.lock();
        state.class_caps.insert(ClassKey::of(class), cap);
        state.class_dirty = true;
    }

    pub(crate) fn class_cap(&self, class: &'static EventClass) -> usize {
        self.inner.lock().resolve_class_cap(class)
    }

    pub(crate) fn set_topic_cap(&self, topic: String, cap: usize) {
        let state = &mut *self.inner.lock();
        state.topic_caps.insert(topic, cap);
        state.topic_dirty = true;
    }

    pub(crate) fn set_pattern_cap(&self, pattern: TopicPattern, cap: usize) {
        let state = &mut *self.inner.lock();
        if let Some(slot) = state
            .pattern_caps
            .iter_mut()
            .find(|(existing, _)| existing.source() == pattern.source())
        {
            slot.1 = cap;
        } else {
            state.pattern_caps.push((pattern, cap));
        }
        state.topic_dirty = true;
    }

    pub(crate) fn topic_cap(&self, topic: &str) -> usize {
        self.inner.lock().resolve_topic_cap(topic)
    }

    // -- writes --

    /// Records an event under its class. A resolved cap of zero drops any
    /// existing buffer for the key instead.
    pub(crate) fn insert_event(&self, event: &Arc<dyn Event>) {
        let state = &mut *self.inner.lock();
        let class = event.class();
        let cap = state.resolve_class_cap(class);
        let key = ClassKey::of(class);
        if cap == 0 {
            state.class_events.remove(&key);
            return;
        }
        let buffer = state.class_events.entry(key).or_default();
        buffer.push_front(Arc::clone(event));
        buffer.truncate(cap);
    }

    pub(crate) fn insert_topic(&self, topic: &str, payload: &Payload) {
        let state = &mut *self.inner.lock();
        let cap = state.resolve_topic_cap(topic);
        if cap == 0 {
            state.topic_payloads.remove(topic);
            return;
        }
        let buffer = state.topic_payloads.entry(topic.to_owned()).or_default();
        buffer.push_front(Arc::clone(payload));
        buffer.truncate(cap);
    }

    // -- reads --

    /// # Errors
    ///
    /// [`BusError::InvalidArgument`] for marker class keys: markers have no
    /// instances, so a marker buffer can never exist.
    pub(crate) fn last_event(&self, class: &'static EventClass) -> Result<Option<Arc<dyn Event>>> {
        reject_marker(class)?;
        let state = self.inner.lock();
        Ok(state
            .class_events
            .get(&ClassKey::of(class))
            .and_then(|buffer| buffer.front().cloned()))
    }

    /// Newest-first defensive copy.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidArgument`] for marker class keys.
    pub(crate) fn cached_events(&self, class: &'static EventClass) -> Result<Vec<Arc<dyn Event>>> {
        reject_marker(class)?;
        let state = self.inner.lock();
        Ok(state
            .class_events
            .get(&ClassKey::of(class))
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub(crate) fn last_topic_payload(&self, topic: &str) -> Option<Payload> {
        let state = self.inner.lock();
        state
            .topic_payloads
            .get(topic)
            .and_then(|buffer| buffer.front().cloned())
    }

    pub(crate) fn cached_topic_payloads(&self, topic: &str) -> Vec<Payload> {
        let state = self.inner.lock();
        state
            .topic_payloads
            .get(topic)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    // -- clears --

    pub(crate) fn clear_all(&self) {
        let state = &mut *self.inner.lock();
        state.class_events.clear();
        state.topic_payloads.clear();
    }

    /// Drops buffers whose class key is `class` or a subclass of it.
    pub(crate) fn clear_class(&self, class: &'static EventClass) {
        let state = &mut *self.inner.lock();
        state
            .class_events
            .retain(|key, _| !class.assignable_from(key.class()));
    }

    pub(crate) fn clear_topic(&self, topic: &str) {
        let state = &mut *self.inner.lock();
        state.topic_payloads.remove(topic);
    }

    /// Drops topic buffers whose name matches the pattern.
    pub(crate) fn clear_matching(&self, pattern: &TopicPattern) {
        let state = &mut *self.inner.lock();
        state.topic_payloads.retain(|topic, _| !pattern.matches(topic));
    }
}

fn reject_marker(class: &'static EventClass) -> Result<()> {
    if class.is_marker() {
        return Err(BusError::InvalidArgument(format!(
            "cache reads require a concrete class, got marker {}",
            class.name()
        )));
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    static ROOT: EventClass = EventClass::base("Root");
    static MID: EventClass = EventClass::subclass("Mid", &ROOT);
    static LEAF: EventClass = EventClass::subclass("Leaf", &MID);
    static TAGGED: EventClass = EventClass::marker("Tagged");
    static TAGGED_ONLY: EventClass = EventClass::new("TaggedOnly", None, &[&TAGGED]);

    struct Numbered {
        class: &'static EventClass,
        value: u32,
    }

    impl Event for Numbered {
        fn class(&self) -> &'static EventClass {
            self.class
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn event(class: &'static EventClass, value: u32) -> Arc<dyn Event> {
        Arc::new(Numbered { class, value })
    }

    fn values(cache: &EventCache, class: &'static EventClass) -> Vec<u32> {
        cache
            .cached_events(class)
            .unwrap()
            .iter()
            .map(|e| e.as_any().downcast_ref::<Numbered>().unwrap().value)
            .collect()
    }

    // --- Cap resolution tests ---

    #[test]
    fn test_class_cap_exact_wins() {
        let cache = EventCache::new(3);
        cache.set_class_cap(&ROOT, 10);
        cache.set_class_cap(&MID, 5);
        assert_eq!(cache.class_cap(&MID), 5);
    }

    #[test]
    fn test_class_cap_nearest_ancestor() {
        let cache = EventCache::new(3);
        cache.set_class_cap(&ROOT, 10);
        assert_eq!(cache.class_cap(&LEAF), 10);
    }

    #[test]
    fn test_class_cap_marker_fallback() {
        let cache = EventCache::new(3);
        cache.set_class_cap(&TAGGED, 7);
        assert_eq!(cache.class_cap(&TAGGED_ONLY), 7);
        // The parent chain is consulted before markers.
        assert_eq!(cache.class_cap(&LEAF), 3);
    }

    #[test]
    fn test_class_cap_default() {
        let cache = EventCache::new(4);
        assert_eq!(cache.class_cap(&LEAF), 4);
    }

    #[test]
    fn test_class_cap_memo_invalidated_by_writes() {
        let cache = EventCache::new(0);
        assert_eq!(cache.class_cap(&LEAF), 0);
        // Memoized answer must be rebuilt after the table changes.
        cache.set_class_cap(&ROOT, 9);
        assert_eq!(cache.class_cap(&LEAF), 9);
        cache.set_default_cap(2);
        cache.set_class_cap(&ROOT, 0);
        assert_eq!(cache.class_cap(&LEAF), 0);
    }

    #[test]
    fn test_topic_cap_exact_then_pattern_then_default() {
        let cache = EventCache::new(1);
        cache.set_topic_cap("orders.created".to_owned(), 5);
        cache.set_pattern_cap(TopicPattern::new("orders\\..*").unwrap(), 3);
        assert_eq!(cache.topic_cap("orders.created"), 5);
        assert_eq!(cache.topic_cap("orders.deleted"), 3);
        assert_eq!(cache.topic_cap("billing.created"), 1);
    }

    #[test]
    fn test_pattern_cap_replaced_not_duplicated() {
        let cache = EventCache::new(0);
        cache.set_pattern_cap(TopicPattern::new("a.*").unwrap(), 2);
        cache.set_pattern_cap(TopicPattern::new("a.*").unwrap(), 6);
        assert_eq!(cache.topic_cap("abc"), 6);
    }

    // --- Buffer tests ---

    #[test]
    fn test_insert_newest_first_and_trim() {
        let cache = EventCache::new(0);
        cache.set_class_cap(&ROOT, 3);
        for i in 1..=5 {
            cache.insert_event(&event(&ROOT, i));
        }
        assert_eq!(values(&cache, &ROOT), vec![5, 4, 3]);
        let last = cache.last_event(&ROOT).unwrap().unwrap();
        assert_eq!(last.as_any().downcast_ref::<Numbered>().unwrap().value, 5);
    }

    #[test]
    fn test_zero_cap_drops_existing_buffer() {
        let cache = EventCache::new(0);
        cache.set_class_cap(&ROOT, 2);
        cache.insert_event(&event(&ROOT, 1));
        assert_eq!(values(&cache, &ROOT), vec![1]);

        // Cap goes to zero; the buffer is dropped on the next publish.
        cache.set_class_cap(&ROOT, 0);
        assert_eq!(values(&cache, &ROOT), vec![1]);
        cache.insert_event(&event(&ROOT, 2));
        assert!(values(&cache, &ROOT).is_empty());
    }

    #[test]
    fn test_shrunk_cap_trims_on_next_insert() {
        let cache = EventCache::new(0);
        cache.set_class_cap(&ROOT, 5);
        for i in 1..=5 {
            cache.insert_event(&event(&ROOT, i));
        }
        cache.set_class_cap(&ROOT, 2);
        // Existing entries survive until the next publish touches the key.
        assert_eq!(values(&cache, &ROOT).len(), 5);
        cache.insert_event(&event(&ROOT, 6));
        assert_eq!(values(&cache, &ROOT), vec![6, 5]);
    }

    #[test]
    fn test_topic_buffers_independent() {
        let cache = EventCache::new(2);
        let a: Payload = Arc::new(1i32);
        let b: Payload = Arc::new(2i32);
        cache.insert_topic("alpha", &a);
        cache.insert_topic("beta", &b);
        assert_eq!(cache.cached_topic_payloads("alpha").len(), 1);
        let last = cache.last_topic_payload("beta").unwrap();
        assert_eq!(*last.downcast_ref::<i32>().unwrap(), 2);
        assert!(cache.last_topic_payload("gamma").is_none());
    }

    #[test]
    fn test_marker_reads_rejected_writes_allowed() {
        let cache = EventCache::new(0);
        // set_class_cap on a marker is legal...
        cache.set_class_cap(&TAGGED, 4);
        // ...but reads through a marker key are not.
        assert!(cache.last_event(&TAGGED).is_err());
        assert!(cache.cached_events(&TAGGED).is_err());
    }

    // --- Clear tests ---

    #[test]
    fn test_clear_class_includes_subclasses() {
        let cache = EventCache::new(3);
        cache.insert_event(&event(&ROOT, 1));
        cache.insert_event(&event(&MID, 2));
        cache.insert_event(&event(&LEAF, 3));

        cache.clear_class(&MID);
        assert_eq!(values(&cache, &ROOT), vec![1]);
        assert!(values(&cache, &MID).is_empty());
        assert!(values(&cache, &LEAF).is_empty());
    }

    #[test]
    fn test_clear_topic_and_matching() {
        let cache = EventCache::new(2);
        let payload: Payload = Arc::new(0i32);
        cache.insert_topic("orders.created", &payload);
        cache.insert_topic("orders.deleted", &payload);
        cache.insert_topic("billing.created", &payload);

        cache.clear_topic("orders.created");
        assert!(cache.cached_topic_payloads("orders.created").is_empty());

        cache.clear_matching(&TopicPattern::new("orders\\..*").unwrap());
        assert!(cache.cached_topic_payloads("orders.deleted").is_empty());
        assert_eq!(cache.cached_topic_payloads("billing.created").len(), 1);
    }

    #[test]
    fn test_clear_all() {
        let cache = EventCache::new(2);
        cache.insert_event(&event(&ROOT, 1));
        let payload: Payload = Arc::new(0i32);
        cache.insert_topic("orders", &payload);
        cache.clear_all();
        assert!(values(&cache, &ROOT).is_empty());
        assert!(cache.cached_topic_payloads("orders").is_empty());
    }
}
