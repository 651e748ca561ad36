//! The subscriber index: nine keyed maps behind one lock.
//!
//! Five subscriber maps (hierarchical class, exact class, type reference,
//! exact topic, topic pattern) and four vetoer maps (everything but type
//! references) live behind a single `parking_lot::Mutex` — the index lock —
//! together with the weak/proxy cell count the reaper watches.
//!
//! Publication takes the lock once, copies the matching lists into owned
//! snapshots (scrubbing stale cells as a side effect), and releases it before
//! any callback runs. Between that snapshot and the callback, a subscriber
//! can be unsubscribed yet still receive one final event; that window is part
//! of the contract, not a bug.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::cell::{Cell, CellList, Probe};
use crate::event::{ClassKey, EventClass, TopicPattern, TypeRef};
use crate::subscriber::{EventSubscriber, EventVetoer, TopicSubscriber, TopicVetoer};

pub(crate) type Snapshot<T> = SmallVec<[Arc<T>; 4]>;

// ---------------------------------------------------------------------------
// Map helpers
// ---------------------------------------------------------------------------

fn apply_delta(weakish: &mut usize, delta: isize) {
    // The reaper counter clamps at zero.
    *weakish = weakish.saturating_add_signed(delta);
}

fn insert_into<K, T>(
    map: &mut FxHashMap<K, CellList<T>>,
    key: K,
    cell: Cell<T>,
    weakish: &mut usize,
) -> bool
where
    K: Eq + Hash,
    T: ?Sized,
{
    let list = map.entry(key).or_insert_with(CellList::new);
    let (added, delta) = list.insert(cell);
    apply_delta(weakish, delta);
    added
}

fn remove_from<K, Q, T>(
    map: &mut FxHashMap<K, CellList<T>>,
    key: &Q,
    probe: Probe,
    weakish: &mut usize,
) -> bool
where
    K: Eq + Hash + Borrow<Q>,
    Q: Eq + Hash + ?Sized,
    T: ?Sized,
{
    let Some(list) = map.get_mut(key) else {
        return false;
    };
    let (removed, delta) = list.remove(probe);
    apply_delta(weakish, delta);
    if list.is_empty() {
        map.remove(key);
    }
    removed
}

fn snapshot_from<K, Q, T>(
    map: &mut FxHashMap<K, CellList<T>>,
    key: &Q,
    weakish: &mut usize,
) -> Snapshot<T>
where
    K: Eq + Hash + Borrow<Q>,
    Q: Eq + Hash + ?Sized,
    T: ?Sized,
{
    let Some(list) = map.get_mut(key) else {
        return SmallVec::new();
    };
    let mut delta = 0isize;
    let snapshot = list.snapshot(&mut delta);
    apply_delta(weakish, delta);
    if list.is_empty() {
        map.remove(key);
    }
    snapshot
}

/// Exact-index hits followed by hierarchical hits walking the published
/// class's match keys (self, ancestors, marker closure).
fn class_snapshot<T: ?Sized>(
    exact: &mut FxHashMap<ClassKey, CellList<T>>,
    hierarchical: &mut FxHashMap<ClassKey, CellList<T>>,
    class: &'static EventClass,
    weakish: &mut usize,
) -> Snapshot<T> {
    let mut out = snapshot_from(exact, &ClassKey::of(class), weakish);
    for key in class.match_keys() {
        out.extend(snapshot_from(hierarchical, &ClassKey::of(key), weakish));
    }
    out
}

// ---------------------------------------------------------------------------
// Pattern slots
// ---------------------------------------------------------------------------

struct PatternSlot<T: ?Sized> {
    pattern: TopicPattern,
    cells: CellList<T>,
}

fn pattern_insert<T: ?Sized>(
    map: &mut FxHashMap<String, PatternSlot<T>>,
    pattern: TopicPattern,
    cell: Cell<T>,
    weakish: &mut usize,
) -> bool {
    let slot = map
        .entry(pattern.source().to_owned())
        .or_insert_with(|| PatternSlot {
            pattern,
            cells: CellList::new(),
        });
    let (added, delta) = slot.cells.insert(cell);
    apply_delta(weakish, delta);
    added
}

fn pattern_remove<T: ?Sized>(
    map: &mut FxHashMap<String, PatternSlot<T>>,
    pattern: &str,
    probe: Probe,
    weakish: &mut usize,
) -> bool {
    let Some(slot) = map.get_mut(pattern) else {
        return false;
    };
    let (removed, delta) = slot.cells.remove(probe);
    apply_delta(weakish, delta);
    if slot.cells.is_empty() {
        map.remove(pattern);
    }
    removed
}

/// Appends snapshots of every slot whose pattern matches the topic, in map
/// iteration order (deliberately unspecified among ties).
fn pattern_matches<T: ?Sized>(
    map: &mut FxHashMap<String, PatternSlot<T>>,
    topic: &str,
    out: &mut Snapshot<T>,
    weakish: &mut usize,
) {
    let mut delta = 0isize;
    map.retain(|_, slot| {
        if slot.pattern.matches(topic) {
            out.extend(slot.cells.snapshot(&mut delta));
            !slot.cells.is_empty()
        } else {
            true
        }
    });
    apply_delta(weakish, delta);
}

// ---------------------------------------------------------------------------
// SubscriberIndex
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Maps {
    class_subs: FxHashMap<ClassKey, CellList<dyn EventSubscriber>>,
    exact_class_subs: FxHashMap<ClassKey, CellList<dyn EventSubscriber>>,
    type_subs: FxHashMap<TypeRef, CellList<dyn EventSubscriber>>,
    topic_subs: FxHashMap<String, CellList<dyn TopicSubscriber>>,
    pattern_subs: FxHashMap<String, PatternSlot<dyn TopicSubscriber>>,
    class_vetoers: FxHashMap<ClassKey, CellList<dyn EventVetoer>>,
    exact_class_vetoers: FxHashMap<ClassKey, CellList<dyn EventVetoer>>,
    topic_vetoers: FxHashMap<String, CellList<dyn TopicVetoer>>,
    pattern_vetoers: FxHashMap<String, PatternSlot<dyn TopicVetoer>>,
    /// Weak cells plus weak-strength proxy cells resident across all maps.
    weakish: usize,
}

/// All subscription state, guarded by the index lock.
pub(crate) struct SubscriberIndex {
    inner: Mutex<Maps>,
}

impl SubscriberIndex {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Maps::default()),
        }
    }

    // -- subscription --

    pub(crate) fn subscribe_class(
        &self,
        class: &'static EventClass,
        exact: bool,
        cell: Cell<dyn EventSubscriber>,
    ) -> bool {
        let maps = &mut *self.inner.lock();
        let map = if exact {
            &mut maps.exact_class_subs
        } else {
            &mut maps.class_subs
        };
        insert_into(map, ClassKey::of(class), cell, &mut maps.weakish)
    }

    pub(crate) fn subscribe_type(&self, type_ref: TypeRef, cell: Cell<dyn EventSubscriber>) -> bool {
        let maps = &mut *self.inner.lock();
        insert_into(&mut maps.type_subs, type_ref, cell, &mut maps.weakish)
    }

    pub(crate) fn subscribe_topic(&self, topic: String, cell: Cell<dyn TopicSubscriber>) -> bool {
        let maps = &mut *self.inner.lock();
        insert_into(&mut maps.topic_subs, topic, cell, &mut maps.weakish)
    }

    pub(crate) fn subscribe_pattern(
        &self,
        pattern: TopicPattern,
        cell: Cell<dyn TopicSubscriber>,
    ) -> bool {
        let maps = &mut *self.inner.lock();
        pattern_insert(&mut maps.pattern_subs, pattern, cell, &mut maps.weakish)
    }

    pub(crate) fn subscribe_veto_class(
        &self,
        class: &'static EventClass,
        exact: bool,
        cell: Cell<dyn EventVetoer>,
    ) -> bool {
        let maps = &mut *self.inner.lock();
        let map = if exact {
            &mut maps.exact_class_vetoers
        } else {
            &mut maps.class_vetoers
        };
        insert_into(map, ClassKey::of(class), cell, &mut maps.weakish)
    }

    pub(crate) fn subscribe_veto_topic(&self, topic: String, cell: Cell<dyn TopicVetoer>) -> bool {
        let maps = &mut *self.inner.lock();
        insert_into(&mut maps.topic_vetoers, topic, cell, &mut maps.weakish)
    }

    pub(crate) fn subscribe_veto_pattern(
        &self,
        pattern: TopicPattern,
        cell: Cell<dyn TopicVetoer>,
    ) -> bool {
        let maps = &mut *self.inner.lock();
        pattern_insert(&mut maps.pattern_vetoers, pattern, cell, &mut maps.weakish)
    }

    // -- unsubscription --

    pub(crate) fn unsubscribe_class(
        &self,
        class: &'static EventClass,
        exact: bool,
        probe: Probe,
    ) -> bool {
        let maps = &mut *self.inner.lock();
        let map = if exact {
            &mut maps.exact_class_subs
        } else {
            &mut maps.class_subs
        };
        remove_from(map, &ClassKey::of(class), probe, &mut maps.weakish)
    }

    pub(crate) fn unsubscribe_type(&self, type_ref: &TypeRef, probe: Probe) -> bool {
        let maps = &mut *self.inner.lock();
        remove_from(&mut maps.type_subs, type_ref, probe, &mut maps.weakish)
    }

    pub(crate) fn unsubscribe_topic(&self, topic: &str, probe: Probe) -> bool {
        let maps = &mut *self.inner.lock();
        remove_from(&mut maps.topic_subs, topic, probe, &mut maps.weakish)
    }

    pub(crate) fn unsubscribe_pattern(&self, pattern: &str, probe: Probe) -> bool {
        let maps = &mut *self.inner.lock();
        pattern_remove(&mut maps.pattern_subs, pattern, probe, &mut maps.weakish)
    }

    pub(crate) fn unsubscribe_veto_class(
        &self,
        class: &'static EventClass,
        exact: bool,
        probe: Probe,
    ) -> bool {
        let maps = &mut *self.inner.lock();
        let map = if exact {
            &mut maps.exact_class_vetoers
        } else {
            &mut maps.class_vetoers
        };
        remove_from(map, &ClassKey::of(class), probe, &mut maps.weakish)
    }

    pub(crate) fn unsubscribe_veto_topic(&self, topic: &str, probe: Probe) -> bool {
        let maps = &mut *self.inner.lock();
        remove_from(&mut maps.topic_vetoers, topic, probe, &mut maps.weakish)
    }

    pub(crate) fn unsubscribe_veto_pattern(&self, pattern: &str, probe: Probe) -> bool {
        let maps = &mut *self.inner.lock();
        pattern_remove(&mut maps.pattern_vetoers, pattern, probe, &mut maps.weakish)
    }

    pub(crate) fn clear(&self) {
        let maps = &mut *self.inner.lock();
        *maps = Maps::default();
    }

    // -- publication snapshots --

    /// Vetoer and subscriber snapshots for a class publication, produced
    /// under one lock acquisition.
    pub(crate) fn class_publication(
        &self,
        class: &'static EventClass,
    ) -> (Snapshot<dyn EventVetoer>, Snapshot<dyn EventSubscriber>) {
        let maps = &mut *self.inner.lock();
        let vetoers = class_snapshot(
            &mut maps.exact_class_vetoers,
            &mut maps.class_vetoers,
            class,
            &mut maps.weakish,
        );
        let subscribers = class_snapshot(
            &mut maps.exact_class_subs,
            &mut maps.class_subs,
            class,
            &mut maps.weakish,
        );
        (vetoers, subscribers)
    }

    /// Vetoer (class-keyed — the type dimension has no vetoes) and subscriber
    /// snapshots for a typed publication.
    pub(crate) fn type_publication(
        &self,
        type_ref: &TypeRef,
        class: &'static EventClass,
    ) -> (Snapshot<dyn EventVetoer>, Snapshot<dyn EventSubscriber>) {
        let maps = &mut *self.inner.lock();
        let vetoers = class_snapshot(
            &mut maps.exact_class_vetoers,
            &mut maps.class_vetoers,
            class,
            &mut maps.weakish,
        );
        let mut subscribers: Snapshot<dyn EventSubscriber> = SmallVec::new();
        let mut delta = 0isize;
        maps.type_subs.retain(|key, list| {
            if key.matches(type_ref) {
                subscribers.extend(list.snapshot(&mut delta));
                !list.is_empty()
            } else {
                true
            }
        });
        apply_delta(&mut maps.weakish, delta);
        (vetoers, subscribers)
    }

    /// Vetoer and subscriber snapshots for a topic publication: exact matches
    /// first, then every matching pattern.
    pub(crate) fn topic_publication(
        &self,
        topic: &str,
    ) -> (Snapshot<dyn TopicVetoer>, Snapshot<dyn TopicSubscriber>) {
        let maps = &mut *self.inner.lock();
        let mut vetoers = snapshot_from(&mut maps.topic_vetoers, topic, &mut maps.weakish);
        pattern_matches(&mut maps.pattern_vetoers, topic, &mut vetoers, &mut maps.weakish);
        let mut subscribers = snapshot_from(&mut maps.topic_subs, topic, &mut maps.weakish);
        pattern_matches(&mut maps.pattern_subs, topic, &mut subscribers, &mut maps.weakish);
        (vetoers, subscribers)
    }

    // -- reaper support --

    pub(crate) fn weakish_count(&self) -> usize {
        self.inner.lock().weakish
    }

    /// Evicts every stale cell across all nine maps. Returns the number of
    /// cells removed.
    pub(crate) fn sweep_stale(&self) -> usize {
        fn sweep_map<K: Eq + Hash, T: ?Sized>(
            map: &mut FxHashMap<K, CellList<T>>,
            weakish: &mut usize,
        ) -> usize {
            let mut stale = 0usize;
            let mut delta = 0isize;
            map.retain(|_, list| {
                let (removed, d) = list.sweep();
                stale += removed;
                delta += d;
                !list.is_empty()
            });
            apply_delta(weakish, delta);
            stale
        }

        fn sweep_patterns<T: ?Sized>(
            map: &mut FxHashMap<String, PatternSlot<T>>,
            weakish: &mut usize,
        ) -> usize {
            let mut stale = 0usize;
            let mut delta = 0isize;
            map.retain(|_, slot| {
                let (removed, d) = slot.cells.sweep();
                stale += removed;
                delta += d;
                !slot.cells.is_empty()
            });
            apply_delta(weakish, delta);
            stale
        }

        let maps = &mut *self.inner.lock();
        let mut stale = 0usize;
        stale += sweep_map(&mut maps.class_subs, &mut maps.weakish);
        stale += sweep_map(&mut maps.exact_class_subs, &mut maps.weakish);
        stale += sweep_map(&mut maps.type_subs, &mut maps.weakish);
        stale += sweep_map(&mut maps.topic_subs, &mut maps.weakish);
        stale += sweep_patterns(&mut maps.pattern_subs, &mut maps.weakish);
        stale += sweep_map(&mut maps.class_vetoers, &mut maps.weakish);
        stale += sweep_map(&mut maps.exact_class_vetoers, &mut maps.weakish);
        stale += sweep_map(&mut maps.topic_vetoers, &mut maps.weakish);
        stale += sweep_patterns(&mut maps.pattern_vetoers, &mut maps.weakish);
        stale
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use crate::cell::{ReferenceStrength, TargetId};
    use crate::event::Event;

    static BASE: EventClass = EventClass::base("Base");
    static DERIVED: EventClass = EventClass::subclass("Derived", &BASE);

    struct Recorder {
        label: &'static str,
        calls: Arc<StdMutex<Vec<&'static str>>>,
    }

    impl EventSubscriber for Recorder {
        fn on_event(&self, _event: &Arc<dyn Event>) {
            self.calls.lock().unwrap().push(self.label);
        }
    }

    impl TopicSubscriber for Recorder {
        fn on_topic(&self, _topic: &str, _payload: &crate::subscriber::Payload) {
            self.calls.lock().unwrap().push(self.label);
        }
    }

    fn recorder(label: &'static str, calls: &Arc<StdMutex<Vec<&'static str>>>) -> Arc<Recorder> {
        Arc::new(Recorder {
            label,
            calls: Arc::clone(calls),
        })
    }

    fn event_cell(sub: &Arc<Recorder>, strength: ReferenceStrength) -> Cell<dyn EventSubscriber> {
        Cell::new(Arc::clone(sub) as Arc<dyn EventSubscriber>, strength)
    }

    fn topic_cell(sub: &Arc<Recorder>, strength: ReferenceStrength) -> Cell<dyn TopicSubscriber> {
        Cell::new(Arc::clone(sub) as Arc<dyn TopicSubscriber>, strength)
    }

    // --- Class index tests ---

    #[test]
    fn test_hierarchical_snapshot_includes_ancestor_keys() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let base_sub = recorder("base", &calls);
        let derived_sub = recorder("derived", &calls);

        let index = SubscriberIndex::new();
        index.subscribe_class(&BASE, false, event_cell(&base_sub, ReferenceStrength::Strong));
        index.subscribe_class(
            &DERIVED,
            false,
            event_cell(&derived_sub, ReferenceStrength::Strong),
        );

        let (_, subs) = index.class_publication(&DERIVED);
        assert_eq!(subs.len(), 2);

        let (_, subs) = index.class_publication(&BASE);
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn test_exact_snapshot_ignores_hierarchy() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let base_sub = recorder("base", &calls);

        let index = SubscriberIndex::new();
        index.subscribe_class(&BASE, true, event_cell(&base_sub, ReferenceStrength::Strong));

        let (_, subs) = index.class_publication(&DERIVED);
        assert!(subs.is_empty());
        let (_, subs) = index.class_publication(&BASE);
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn test_exact_matches_precede_hierarchical() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let exact_sub = recorder("exact", &calls);
        let hier_sub = recorder("hier", &calls);

        let index = SubscriberIndex::new();
        index.subscribe_class(&BASE, false, event_cell(&hier_sub, ReferenceStrength::Strong));
        index.subscribe_class(&BASE, true, event_cell(&exact_sub, ReferenceStrength::Strong));

        let (_, subs) = index.class_publication(&BASE);
        assert_eq!(subs.len(), 2);
        assert_eq!(
            TargetId::of(&subs[0]),
            TargetId::of(&(Arc::clone(&exact_sub) as Arc<dyn EventSubscriber>))
        );
    }

    // --- Topic index tests ---

    #[test]
    fn test_topic_exact_and_pattern_snapshot() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let exact_sub = recorder("exact", &calls);
        let pattern_sub = recorder("pattern", &calls);

        let index = SubscriberIndex::new();
        index.subscribe_topic(
            "orders.created".to_owned(),
            topic_cell(&exact_sub, ReferenceStrength::Strong),
        );
        index.subscribe_pattern(
            TopicPattern::new("orders\\..*").unwrap(),
            topic_cell(&pattern_sub, ReferenceStrength::Strong),
        );

        let (_, subs) = index.topic_publication("orders.created");
        assert_eq!(subs.len(), 2);

        let (_, subs) = index.topic_publication("orders.deleted");
        assert_eq!(subs.len(), 1);

        let (_, subs) = index.topic_publication("billing.created");
        assert!(subs.is_empty());
    }

    // --- Weakish accounting tests ---

    #[test]
    fn test_weakish_count_tracks_residency() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let strong_sub = recorder("strong", &calls);

        let index = SubscriberIndex::new();
        index.subscribe_class(&BASE, false, event_cell(&strong_sub, ReferenceStrength::Strong));
        assert_eq!(index.weakish_count(), 0);

        let weak_sub = recorder("weak", &calls);
        index.subscribe_class(&BASE, false, event_cell(&weak_sub, ReferenceStrength::Weak));
        index.subscribe_topic(
            "orders".to_owned(),
            topic_cell(&weak_sub, ReferenceStrength::Weak),
        );
        assert_eq!(index.weakish_count(), 2);

        // Dropping the subscriber and snapshotting scrubs both cells.
        drop(weak_sub);
        let (_, subs) = index.class_publication(&BASE);
        assert_eq!(subs.len(), 1);
        assert_eq!(index.weakish_count(), 1);
        index.topic_publication("orders");
        assert_eq!(index.weakish_count(), 0);
    }

    #[test]
    fn test_sweep_stale_across_maps() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let index = SubscriberIndex::new();
        {
            let doomed = recorder("doomed", &calls);
            index.subscribe_class(&BASE, false, event_cell(&doomed, ReferenceStrength::Weak));
            index.subscribe_class(&BASE, true, event_cell(&doomed, ReferenceStrength::Weak));
            index.subscribe_topic(
                "orders".to_owned(),
                topic_cell(&doomed, ReferenceStrength::Weak),
            );
            assert_eq!(index.weakish_count(), 3);
        }
        let stale = index.sweep_stale();
        assert_eq!(stale, 3);
        assert_eq!(index.weakish_count(), 0);
        assert_eq!(index.sweep_stale(), 0);
    }

    #[test]
    fn test_clear_resets_count() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let sub = recorder("sub", &calls);
        let index = SubscriberIndex::new();
        index.subscribe_class(&BASE, false, event_cell(&sub, ReferenceStrength::Weak));
        assert_eq!(index.weakish_count(), 1);
        index.clear();
        assert_eq!(index.weakish_count(), 0);
        let (_, subs) = index.class_publication(&BASE);
        assert!(subs.is_empty());
    }

    // --- Unsubscribe tests ---

    #[test]
    fn test_unsubscribe_returns_removal() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let sub = recorder("sub", &calls);
        let index = SubscriberIndex::new();
        index.subscribe_class(&BASE, false, event_cell(&sub, ReferenceStrength::Strong));

        let id = TargetId::of(&(Arc::clone(&sub) as Arc<dyn EventSubscriber>));
        assert!(index.unsubscribe_class(&BASE, false, Probe::Dispatch(id)));
        assert!(!index.unsubscribe_class(&BASE, false, Probe::Dispatch(id)));
        let (_, subs) = index.class_publication(&BASE);
        assert!(subs.is_empty());
    }
}
