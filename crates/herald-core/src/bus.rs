//! The event service: subscription surface and the publish pipeline.
//!
//! [`EventBus`] is a cheaply cloneable handle over a shared core. Publishing
//! runs entirely on the calling thread:
//!
//! 1. **Validate & snapshot** — compute the vetoer and subscriber snapshots
//!    under the index lock, then release it.
//! 2. **Veto phase** — consult each vetoer in order; a `true` verdict ends
//!    the publication before caching or delivery. A panicking vetoer does
//!    not veto.
//! 3. **Cache phase** — record the event or payload under the cache lock.
//! 4. **Delivery phase** — invoke each subscriber in order; panics are routed
//!    to the exception sink and never abort the rest of the list.
//!
//! Neither lock is held while subscriber code runs, so callbacks may freely
//! subscribe, unsubscribe, or publish. The flip side is the documented race:
//! a subscriber unsubscribed between snapshot and invocation still receives
//! that one publication.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cache::EventCache;
use crate::cell::{Cell, Probe, ProxyControl, ReferenceStrength, TargetId};
use crate::config::BusConfig;
use crate::event::{Event, EventClass, TopicPattern, TypeRef};
use crate::index::{Snapshot, SubscriberIndex};
use crate::reaper::{CleanupEvent, CleanupPhase, ReaperSignal};
use crate::subscriber::{
    panic_message, DispatchPhase, EventSubscriber, EventVetoer, ExceptionSink, LogSink,
    PanicContext, Payload, TopicSubscriber, TopicVetoer,
};
use crate::timing::{TimingLogger, TimingMonitor, TIMING_EVENT};
use crate::{BusError, Result};

// ---------------------------------------------------------------------------
// BusCore
// ---------------------------------------------------------------------------

struct ReaperTuning {
    start: Option<usize>,
    stop: Option<usize>,
    period: Option<Duration>,
}

/// Key of the publication in flight, for timing events and panic context.
#[derive(Clone, Copy)]
struct PublicationKey<'a> {
    event_class: Option<&'static EventClass>,
    topic: Option<&'a str>,
}

/// Shared state behind every [`EventBus`] handle.
pub(crate) struct BusCore {
    index: SubscriberIndex,
    cache: EventCache,
    monitor: TimingMonitor,
    sink: Mutex<Arc<dyn ExceptionSink>>,
    tuning: Mutex<ReaperTuning>,
    reaper: Arc<ReaperSignal>,
}

impl BusCore {
    // -- reaper support --

    pub(crate) fn weakish_count(&self) -> usize {
        self.index.weakish_count()
    }

    pub(crate) fn cleanup_period(&self) -> Option<Duration> {
        self.tuning.lock().period
    }

    pub(crate) fn cleanup_stop_threshold(&self) -> Option<usize> {
        self.tuning.lock().stop
    }

    pub(crate) fn sweep_index(&self) -> usize {
        self.index.sweep_stale()
    }

    pub(crate) fn publish_cleanup(&self, phase: CleanupPhase, resident: usize) {
        self.dispatch_class(Arc::new(CleanupEvent::new(phase, resident)));
    }

    // -- pipeline --

    fn dispatch_class(&self, event: Arc<dyn Event>) {
        let class = event.class();
        tracing::debug!(class = class.name(), "publishing event");
        let (vetoers, subscribers) = self.index.class_publication(class);
        self.finish_class(&event, class, &vetoers, &subscribers);
    }

    fn finish_class(
        &self,
        event: &Arc<dyn Event>,
        class: &'static EventClass,
        vetoers: &Snapshot<dyn EventVetoer>,
        subscribers: &Snapshot<dyn EventSubscriber>,
    ) {
        let key = PublicationKey {
            event_class: Some(class),
            topic: None,
        };
        let vetoed = self.run_phase(vetoers, DispatchPhase::Veto, key, |vetoer| {
            vetoer.should_veto(event)
        });
        if vetoed {
            return;
        }
        self.cache.insert_event(event);
        self.run_phase(subscribers, DispatchPhase::Delivery, key, |subscriber| {
            subscriber.on_event(event);
            false
        });
    }

    fn dispatch_topic(&self, topic: &str, payload: &Payload) {
        tracing::debug!(topic, "publishing topic payload");
        let (vetoers, subscribers) = self.index.topic_publication(topic);
        let key = PublicationKey {
            event_class: None,
            topic: Some(topic),
        };
        let vetoed = self.run_phase(&vetoers, DispatchPhase::Veto, key, |vetoer| {
            vetoer.should_veto(topic, payload)
        });
        if vetoed {
            return;
        }
        self.cache.insert_topic(topic, payload);
        self.run_phase(&subscribers, DispatchPhase::Delivery, key, |subscriber| {
            subscriber.on_topic(topic, payload);
            false
        });
    }

    /// Runs one phase over a snapshot, timing each call and quarantining
    /// panics. `call` returns the veto verdict; delivery closures always
    /// return `false`. Returns `true` when a vetoer vetoed.
    fn run_phase<T: ?Sized>(
        &self,
        snapshot: &Snapshot<T>,
        phase: DispatchPhase,
        key: PublicationKey<'_>,
        mut call: impl FnMut(&Arc<T>) -> bool,
    ) -> bool {
        for (ordinal, target) in snapshot.iter().enumerate() {
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| call(target)));
            self.check_timing(started, phase, key, ordinal);
            match outcome {
                Ok(true) => {
                    tracing::debug!(ordinal, "publication vetoed");
                    return true;
                }
                Ok(false) => {}
                Err(payload) => self.quarantine(phase, key, ordinal, payload.as_ref()),
            }
        }
        false
    }

    fn check_timing(
        &self,
        started: Instant,
        phase: DispatchPhase,
        key: PublicationKey<'_>,
        ordinal: usize,
    ) {
        if let Some(timing) =
            self.monitor
                .check(started, phase, key.event_class, key.topic, ordinal)
        {
            self.dispatch_class(Arc::new(timing));
        }
    }

    fn quarantine(
        &self,
        phase: DispatchPhase,
        key: PublicationKey<'_>,
        ordinal: usize,
        payload: &(dyn std::any::Any + Send),
    ) {
        let backtrace = std::backtrace::Backtrace::capture();
        let ctx = PanicContext {
            phase,
            event_class: key.event_class,
            topic: key.topic,
            ordinal,
            message: panic_message(payload),
            backtrace: &backtrace,
        };
        let sink = Arc::clone(&self.sink.lock());
        sink.on_panic(&ctx);
    }
}

impl Drop for BusCore {
    fn drop(&mut self) {
        self.reaper.cancel();
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// The in-process publish/subscribe event service.
///
/// Cloning is cheap; all clones share the same subscription state, caches,
/// and reaper.
#[derive(Clone)]
pub struct EventBus {
    core: Arc<BusCore>,
}

impl EventBus {
    /// A bus with the default configuration: no timing monitor, no caching,
    /// no reaper.
    #[must_use]
    pub fn new() -> Self {
        Self::build(&BusConfig::default())
    }

    /// A bus with the given configuration.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidArgument`] when the configuration is inconsistent
    /// (timing-event logging without a time threshold).
    pub fn with_config(config: BusConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(&config))
    }

    fn build(config: &BusConfig) -> Self {
        let core = Arc::new(BusCore {
            index: SubscriberIndex::new(),
            cache: EventCache::new(config.default_cache_size),
            monitor: TimingMonitor::new(config.time_threshold),
            sink: Mutex::new(Arc::new(LogSink)),
            tuning: Mutex::new(ReaperTuning {
                start: config.cleanup_start_threshold,
                stop: config.cleanup_stop_threshold,
                period: config.cleanup_period,
            }),
            reaper: Arc::new(ReaperSignal::new()),
        });
        let bus = Self { core };
        if config.log_timing_events {
            bus.subscribe(&TIMING_EVENT, Arc::new(TimingLogger), ReferenceStrength::Strong);
        }
        bus
    }

    /// Replaces the sink that receives subscriber and vetoer panics.
    pub fn set_exception_sink(&self, sink: Arc<dyn ExceptionSink>) {
        *self.core.sink.lock() = sink;
    }

    // -- class subscriptions --

    /// Subscribes to `class` and all of its descendants.
    ///
    /// Returns `true` when the subscriber was not already present under this
    /// key; a duplicate relocates the existing subscription to the tail of
    /// the delivery order and returns `false`.
    pub fn subscribe(
        &self,
        class: &'static EventClass,
        subscriber: Arc<dyn EventSubscriber>,
        strength: ReferenceStrength,
    ) -> bool {
        tracing::debug!(class = class.name(), ?strength, "subscribing by class");
        let added = self
            .core
            .index
            .subscribe_class(class, false, Cell::new(subscriber, strength));
        if strength == ReferenceStrength::Weak {
            self.maybe_start_reaper();
        }
        added
    }

    /// Subscribes to exactly `class`, ignoring descendants.
    pub fn subscribe_exactly(
        &self,
        class: &'static EventClass,
        subscriber: Arc<dyn EventSubscriber>,
        strength: ReferenceStrength,
    ) -> bool {
        tracing::debug!(class = class.name(), ?strength, "subscribing by exact class");
        let added = self
            .core
            .index
            .subscribe_class(class, true, Cell::new(subscriber, strength));
        if strength == ReferenceStrength::Weak {
            self.maybe_start_reaper();
        }
        added
    }

    /// Subscribes to publications matching a parameterized type reference.
    /// Wildcard arguments are allowed in the subscription key.
    pub fn subscribe_to_type(
        &self,
        type_ref: TypeRef,
        subscriber: Arc<dyn EventSubscriber>,
        strength: ReferenceStrength,
    ) -> bool {
        tracing::debug!(type_ref = ?type_ref, ?strength, "subscribing by type");
        let added = self
            .core
            .index
            .subscribe_type(type_ref, Cell::new(subscriber, strength));
        if strength == ReferenceStrength::Weak {
            self.maybe_start_reaper();
        }
        added
    }

    // -- topic subscriptions --

    /// Subscribes to one topic name.
    pub fn subscribe_topic(
        &self,
        topic: impl Into<String>,
        subscriber: Arc<dyn TopicSubscriber>,
        strength: ReferenceStrength,
    ) -> bool {
        let topic = topic.into();
        tracing::debug!(topic = %topic, ?strength, "subscribing by topic");
        let added = self
            .core
            .index
            .subscribe_topic(topic, Cell::new(subscriber, strength));
        if strength == ReferenceStrength::Weak {
            self.maybe_start_reaper();
        }
        added
    }

    /// Subscribes to every topic fully matching the regex `pattern`.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidArgument`] when the pattern does not parse.
    pub fn subscribe_pattern(
        &self,
        pattern: &str,
        subscriber: Arc<dyn TopicSubscriber>,
        strength: ReferenceStrength,
    ) -> Result<bool> {
        let pattern = TopicPattern::new(pattern)?;
        tracing::debug!(pattern = pattern.source(), ?strength, "subscribing by pattern");
        let added = self
            .core
            .index
            .subscribe_pattern(pattern, Cell::new(subscriber, strength));
        if strength == ReferenceStrength::Weak {
            self.maybe_start_reaper();
        }
        Ok(added)
    }

    // -- proxy subscriptions --

    /// Subscribes a proxy to `class` and its descendants. The proxy is held
    /// strongly (the proxy itself is the weak holder); its
    /// [`ProxyControl::strength`] feeds reaper accounting, and it is notified
    /// via [`ProxyControl::on_unsubscribed`] when removed.
    pub fn subscribe_proxy<P>(&self, class: &'static EventClass, proxy: Arc<P>) -> bool
    where
        P: EventSubscriber + ProxyControl + 'static,
    {
        let weakish = proxy.strength() == ReferenceStrength::Weak;
        let cell = Cell::Proxy {
            subscriber: Arc::clone(&proxy) as Arc<dyn EventSubscriber>,
            control: proxy as Arc<dyn ProxyControl>,
        };
        let added = self.core.index.subscribe_class(class, false, cell);
        if weakish {
            self.maybe_start_reaper();
        }
        added
    }

    /// Subscribes a proxy to exactly `class`.
    pub fn subscribe_proxy_exactly<P>(&self, class: &'static EventClass, proxy: Arc<P>) -> bool
    where
        P: EventSubscriber + ProxyControl + 'static,
    {
        let weakish = proxy.strength() == ReferenceStrength::Weak;
        let cell = Cell::Proxy {
            subscriber: Arc::clone(&proxy) as Arc<dyn EventSubscriber>,
            control: proxy as Arc<dyn ProxyControl>,
        };
        let added = self.core.index.subscribe_class(class, true, cell);
        if weakish {
            self.maybe_start_reaper();
        }
        added
    }

    /// Subscribes a proxy to one topic name.
    pub fn subscribe_proxy_topic<P>(&self, topic: impl Into<String>, proxy: Arc<P>) -> bool
    where
        P: TopicSubscriber + ProxyControl + 'static,
    {
        let weakish = proxy.strength() == ReferenceStrength::Weak;
        let cell = Cell::Proxy {
            subscriber: Arc::clone(&proxy) as Arc<dyn TopicSubscriber>,
            control: proxy as Arc<dyn ProxyControl>,
        };
        let added = self.core.index.subscribe_topic(topic.into(), cell);
        if weakish {
            self.maybe_start_reaper();
        }
        added
    }

    /// Subscribes a proxy to a topic pattern.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidArgument`] when the pattern does not parse.
    pub fn subscribe_proxy_pattern<P>(&self, pattern: &str, proxy: Arc<P>) -> Result<bool>
    where
        P: TopicSubscriber + ProxyControl + 'static,
    {
        let pattern = TopicPattern::new(pattern)?;
        let weakish = proxy.strength() == ReferenceStrength::Weak;
        let cell = Cell::Proxy {
            subscriber: Arc::clone(&proxy) as Arc<dyn TopicSubscriber>,
            control: proxy as Arc<dyn ProxyControl>,
        };
        let added = self.core.index.subscribe_pattern(pattern, cell);
        if weakish {
            self.maybe_start_reaper();
        }
        Ok(added)
    }

    // -- veto subscriptions --

    /// Registers a vetoer for `class` and its descendants.
    pub fn subscribe_veto(
        &self,
        class: &'static EventClass,
        vetoer: Arc<dyn EventVetoer>,
        strength: ReferenceStrength,
    ) -> bool {
        let added = self
            .core
            .index
            .subscribe_veto_class(class, false, Cell::new(vetoer, strength));
        if strength == ReferenceStrength::Weak {
            self.maybe_start_reaper();
        }
        added
    }

    /// Registers a vetoer for exactly `class`.
    pub fn subscribe_veto_exactly(
        &self,
        class: &'static EventClass,
        vetoer: Arc<dyn EventVetoer>,
        strength: ReferenceStrength,
    ) -> bool {
        let added = self
            .core
            .index
            .subscribe_veto_class(class, true, Cell::new(vetoer, strength));
        if strength == ReferenceStrength::Weak {
            self.maybe_start_reaper();
        }
        added
    }

    /// Registers a vetoer for one topic name.
    pub fn subscribe_veto_topic(
        &self,
        topic: impl Into<String>,
        vetoer: Arc<dyn TopicVetoer>,
        strength: ReferenceStrength,
    ) -> bool {
        let added = self
            .core
            .index
            .subscribe_veto_topic(topic.into(), Cell::new(vetoer, strength));
        if strength == ReferenceStrength::Weak {
            self.maybe_start_reaper();
        }
        added
    }

    /// Registers a vetoer for every topic matching the pattern.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidArgument`] when the pattern does not parse.
    pub fn subscribe_veto_pattern(
        &self,
        pattern: &str,
        vetoer: Arc<dyn TopicVetoer>,
        strength: ReferenceStrength,
    ) -> Result<bool> {
        let pattern = TopicPattern::new(pattern)?;
        let added = self
            .core
            .index
            .subscribe_veto_pattern(pattern, Cell::new(vetoer, strength));
        if strength == ReferenceStrength::Weak {
            self.maybe_start_reaper();
        }
        Ok(added)
    }

    // -- unsubscription --

    /// Removes a hierarchical class subscription, matching by the object
    /// originally subscribed (for proxies, the proxy itself). Returns whether
    /// a removal occurred.
    pub fn unsubscribe<S>(&self, class: &'static EventClass, subscriber: &Arc<S>) -> bool
    where
        S: EventSubscriber + ?Sized,
    {
        self.core
            .index
            .unsubscribe_class(class, false, Probe::Dispatch(TargetId::of(subscriber)))
    }

    /// Removes an exact class subscription.
    pub fn unsubscribe_exactly<S>(&self, class: &'static EventClass, subscriber: &Arc<S>) -> bool
    where
        S: EventSubscriber + ?Sized,
    {
        self.core
            .index
            .unsubscribe_class(class, true, Probe::Dispatch(TargetId::of(subscriber)))
    }

    /// Removes a type-reference subscription.
    pub fn unsubscribe_from_type<S>(&self, type_ref: &TypeRef, subscriber: &Arc<S>) -> bool
    where
        S: EventSubscriber + ?Sized,
    {
        self.core
            .index
            .unsubscribe_type(type_ref, Probe::Dispatch(TargetId::of(subscriber)))
    }

    /// Removes a topic subscription.
    pub fn unsubscribe_topic<S>(&self, topic: &str, subscriber: &Arc<S>) -> bool
    where
        S: TopicSubscriber + ?Sized,
    {
        self.core
            .index
            .unsubscribe_topic(topic, Probe::Dispatch(TargetId::of(subscriber)))
    }

    /// Removes a pattern subscription. The pattern is matched by its source
    /// text as supplied to [`subscribe_pattern`](Self::subscribe_pattern).
    pub fn unsubscribe_pattern<S>(&self, pattern: &str, subscriber: &Arc<S>) -> bool
    where
        S: TopicSubscriber + ?Sized,
    {
        self.core
            .index
            .unsubscribe_pattern(pattern, Probe::Dispatch(TargetId::of(subscriber)))
    }

    /// Removes a hierarchical class subscription by target identity: strong
    /// and weak subscriptions match the subscriber itself, proxy
    /// subscriptions match by their **proxied** real target.
    pub fn unsubscribe_target<T>(&self, class: &'static EventClass, target: &Arc<T>) -> bool
    where
        T: ?Sized,
    {
        self.core
            .index
            .unsubscribe_class(class, false, Probe::Proxied(TargetId::of(target)))
    }

    /// Target-identity removal in the exact class index.
    pub fn unsubscribe_target_exactly<T>(&self, class: &'static EventClass, target: &Arc<T>) -> bool
    where
        T: ?Sized,
    {
        self.core
            .index
            .unsubscribe_class(class, true, Probe::Proxied(TargetId::of(target)))
    }

    /// Target-identity removal in the topic index.
    pub fn unsubscribe_target_topic<T>(&self, topic: &str, target: &Arc<T>) -> bool
    where
        T: ?Sized,
    {
        self.core
            .index
            .unsubscribe_topic(topic, Probe::Proxied(TargetId::of(target)))
    }

    /// Target-identity removal in the pattern index.
    pub fn unsubscribe_target_pattern<T>(&self, pattern: &str, target: &Arc<T>) -> bool
    where
        T: ?Sized,
    {
        self.core
            .index
            .unsubscribe_pattern(pattern, Probe::Proxied(TargetId::of(target)))
    }

    /// Removes a hierarchical class vetoer.
    pub fn unsubscribe_veto<V>(&self, class: &'static EventClass, vetoer: &Arc<V>) -> bool
    where
        V: EventVetoer + ?Sized,
    {
        self.core
            .index
            .unsubscribe_veto_class(class, false, Probe::Dispatch(TargetId::of(vetoer)))
    }

    /// Removes an exact class vetoer.
    pub fn unsubscribe_veto_exactly<V>(&self, class: &'static EventClass, vetoer: &Arc<V>) -> bool
    where
        V: EventVetoer + ?Sized,
    {
        self.core
            .index
            .unsubscribe_veto_class(class, true, Probe::Dispatch(TargetId::of(vetoer)))
    }

    /// Removes a topic vetoer.
    pub fn unsubscribe_veto_topic<V>(&self, topic: &str, vetoer: &Arc<V>) -> bool
    where
        V: TopicVetoer + ?Sized,
    {
        self.core
            .index
            .unsubscribe_veto_topic(topic, Probe::Dispatch(TargetId::of(vetoer)))
    }

    /// Removes a pattern vetoer.
    pub fn unsubscribe_veto_pattern<V>(&self, pattern: &str, vetoer: &Arc<V>) -> bool
    where
        V: TopicVetoer + ?Sized,
    {
        self.core
            .index
            .unsubscribe_veto_pattern(pattern, Probe::Dispatch(TargetId::of(vetoer)))
    }

    /// Drops every subscription and vetoer in all indices.
    pub fn clear_all_subscribers(&self) {
        self.core.index.clear();
    }

    // -- publication --

    /// Publishes an event to exact and hierarchical class subscribers.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidArgument`] when the event's class is a marker.
    pub fn publish(&self, event: Arc<dyn Event>) -> Result<()> {
        let class = event.class();
        if class.is_marker() {
            return Err(BusError::InvalidArgument(format!(
                "cannot publish an event of marker class {}",
                class.name()
            )));
        }
        self.core.dispatch_class(event);
        Ok(())
    }

    /// Publishes an event to subscribers of matching type references. The
    /// veto phase consults the class vetoers of the event's class; the type
    /// dimension itself has no vetoes.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidArgument`] when `type_ref` contains wildcards or
    /// the event's class is a marker.
    pub fn publish_typed(&self, type_ref: &TypeRef, event: Arc<dyn Event>) -> Result<()> {
        if type_ref.has_wildcards() {
            return Err(BusError::InvalidArgument(format!(
                "published type reference {type_ref:?} may not contain wildcards"
            )));
        }
        let class = event.class();
        if class.is_marker() {
            return Err(BusError::InvalidArgument(format!(
                "cannot publish an event of marker class {}",
                class.name()
            )));
        }
        tracing::debug!(type_ref = ?type_ref, "publishing typed event");
        let (vetoers, subscribers) = self.core.index.type_publication(type_ref, class);
        self.core.finish_class(&event, class, &vetoers, &subscribers);
        Ok(())
    }

    /// Publishes a payload under a topic name to exact-topic and matching
    /// pattern subscribers.
    ///
    /// # Errors
    ///
    /// None currently; the `Result` keeps the publish surface uniform.
    pub fn publish_topic(&self, topic: &str, payload: Payload) -> Result<()> {
        self.core.dispatch_topic(topic, &payload);
        Ok(())
    }

    // -- cache operations --

    /// Sets the cap used by keys with no specific cap.
    pub fn set_default_cache_size(&self, cap: usize) {
        self.core.cache.set_default_cap(cap);
    }

    /// The default cache cap.
    #[must_use]
    pub fn default_cache_size(&self) -> usize {
        self.core.cache.default_cap()
    }

    /// Sets the cap for a class. Marker classes are allowed and act as
    /// inherited defaults for classes implementing them.
    pub fn set_cache_size_for_class(&self, class: &'static EventClass, cap: usize) {
        self.core.cache.set_class_cap(class, cap);
    }

    /// The effective (inheritance-resolved) cap for a class.
    #[must_use]
    pub fn cache_size_for_class(&self, class: &'static EventClass) -> usize {
        self.core.cache.class_cap(class)
    }

    /// Sets the cap for an exact topic name.
    pub fn set_cache_size_for_topic(&self, topic: impl Into<String>, cap: usize) {
        self.core.cache.set_topic_cap(topic.into(), cap);
    }

    /// Sets the cap for topics matching a pattern. A cap for the same pattern
    /// text is replaced.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidArgument`] when the pattern does not parse.
    pub fn set_cache_size_for_pattern(&self, pattern: &str, cap: usize) -> Result<()> {
        self.core
            .cache
            .set_pattern_cap(TopicPattern::new(pattern)?, cap);
        Ok(())
    }

    /// The effective cap for a topic.
    #[must_use]
    pub fn cache_size_for_topic(&self, topic: &str) -> usize {
        self.core.cache.topic_cap(topic)
    }

    /// The most recently cached event of exactly `class`.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidArgument`] for marker class keys.
    pub fn get_last_event(&self, class: &'static EventClass) -> Result<Option<Arc<dyn Event>>> {
        self.core.cache.last_event(class)
    }

    /// Cached events of exactly `class`, newest first. The returned list is
    /// a copy; mutating the cache afterwards does not affect it.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidArgument`] for marker class keys.
    pub fn get_cached_events(&self, class: &'static EventClass) -> Result<Vec<Arc<dyn Event>>> {
        self.core.cache.cached_events(class)
    }

    /// The most recently cached payload for a topic.
    #[must_use]
    pub fn get_last_topic_payload(&self, topic: &str) -> Option<Payload> {
        self.core.cache.last_topic_payload(topic)
    }

    /// Cached payloads for a topic, newest first, as a copy.
    #[must_use]
    pub fn get_cached_topic_payloads(&self, topic: &str) -> Vec<Payload> {
        self.core.cache.cached_topic_payloads(topic)
    }

    /// Drops every cache buffer.
    pub fn clear_cache(&self) {
        self.core.cache.clear_all();
    }

    /// Drops cache buffers for `class` and its subclasses.
    pub fn clear_cache_for_class(&self, class: &'static EventClass) {
        self.core.cache.clear_class(class);
    }

    /// Drops the cache buffer for one topic.
    pub fn clear_cache_for_topic(&self, topic: &str) {
        self.core.cache.clear_topic(topic);
    }

    /// Drops cache buffers for topics matching the pattern.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidArgument`] when the pattern does not parse.
    pub fn clear_cache_matching(&self, pattern: &str) -> Result<()> {
        self.core.cache.clear_matching(&TopicPattern::new(pattern)?);
        Ok(())
    }

    // -- reaper tuning --

    /// Weak/proxy count at which the reaper starts.
    #[must_use]
    pub fn cleanup_start_threshold(&self) -> Option<usize> {
        self.core.tuning.lock().start
    }

    /// Sets the start threshold; `None` disables starting.
    pub fn set_cleanup_start_threshold(&self, threshold: Option<usize>) {
        self.core.tuning.lock().start = threshold;
    }

    /// Count at or below which a running reaper cancels itself.
    #[must_use]
    pub fn cleanup_stop_threshold(&self) -> Option<usize> {
        self.core.tuning.lock().stop
    }

    /// Sets the stop threshold; `None` compares as zero.
    pub fn set_cleanup_stop_threshold(&self, threshold: Option<usize>) {
        self.core.tuning.lock().stop = threshold;
    }

    /// Interval between reaper ticks.
    #[must_use]
    pub fn cleanup_period(&self) -> Option<Duration> {
        self.core.tuning.lock().period
    }

    /// Sets the tick interval. `None` stops a running reaper.
    pub fn set_cleanup_period(&self, period: Option<Duration>) {
        self.core.tuning.lock().period = period;
        if period.is_none() {
            self.core.reaper.cancel();
        }
    }

    /// Whether the reaper thread is currently running.
    #[must_use]
    pub fn reaper_running(&self) -> bool {
        self.core.reaper.is_running()
    }

    fn maybe_start_reaper(&self) {
        let tuning = self.core.tuning.lock();
        let (Some(start), Some(_)) = (tuning.start, tuning.period) else {
            return;
        };
        drop(tuning);
        if self.core.index.weakish_count() >= start {
            ReaperSignal::ensure_started(&self.core.reaper, &self.core);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use crate::subscriber::{subscriber_fn, topic_subscriber_fn, topic_vetoer_fn, vetoer_fn};

    static BASE: EventClass = EventClass::base("Base");
    static DERIVED: EventClass = EventClass::subclass("Derived", &BASE);
    static MARKED: EventClass = EventClass::marker("Marked");

    struct Probe {
        class: &'static EventClass,
        value: u32,
    }

    impl Event for Probe {
        fn class(&self) -> &'static EventClass {
            self.class
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn probe(class: &'static EventClass, value: u32) -> Arc<dyn Event> {
        Arc::new(Probe { class, value })
    }

    struct CountingSink(AtomicUsize);

    impl ExceptionSink for CountingSink {
        fn on_panic(&self, _ctx: &PanicContext<'_>) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    // --- Construction tests ---

    #[test]
    fn test_with_config_validates() {
        let bad = BusConfig {
            log_timing_events: true,
            ..BusConfig::default()
        };
        assert!(EventBus::with_config(bad).is_err());
        assert!(EventBus::with_config(BusConfig::default()).is_ok());
    }

    // --- Publish validation tests ---

    #[test]
    fn test_publish_marker_class_rejected() {
        let bus = EventBus::new();
        let err = bus.publish(probe(&MARKED, 0)).unwrap_err();
        assert!(matches!(err, BusError::InvalidArgument(_)));
    }

    #[test]
    fn test_publish_typed_rejects_wildcards() {
        let bus = EventBus::new();
        let type_ref = TypeRef::new(
            &BASE,
            vec![crate::event::TypeArg::Wildcard {
                upper: None,
                lower: None,
            }],
        );
        let err = bus.publish_typed(&type_ref, probe(&BASE, 0)).unwrap_err();
        assert!(matches!(err, BusError::InvalidArgument(_)));
    }

    // --- Pipeline tests ---

    #[test]
    fn test_veto_blocks_cache_and_delivery() {
        let bus = EventBus::new();
        bus.set_cache_size_for_class(&BASE, 4);

        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_in = Arc::clone(&delivered);
        bus.subscribe(
            &BASE,
            subscriber_fn(move |_| {
                delivered_in.fetch_add(1, Ordering::Relaxed);
            }),
            ReferenceStrength::Strong,
        );
        let veto = vetoer_fn(|_| true);
        bus.subscribe_veto(&BASE, Arc::clone(&veto), ReferenceStrength::Strong);

        bus.publish(probe(&BASE, 1)).unwrap();
        assert_eq!(delivered.load(Ordering::Relaxed), 0);
        assert!(bus.get_cached_events(&BASE).unwrap().is_empty());

        assert!(bus.unsubscribe_veto(&BASE, &veto));
        bus.publish(probe(&BASE, 2)).unwrap();
        assert_eq!(delivered.load(Ordering::Relaxed), 1);
        assert_eq!(bus.get_cached_events(&BASE).unwrap().len(), 1);
    }

    #[test]
    fn test_panicking_vetoer_does_not_veto() {
        let bus = EventBus::new();
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        bus.set_exception_sink(Arc::clone(&sink) as Arc<dyn ExceptionSink>);

        bus.subscribe_veto(
            &BASE,
            vetoer_fn(|_| panic!("vetoer exploded")),
            ReferenceStrength::Strong,
        );
        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_in = Arc::clone(&delivered);
        bus.subscribe(
            &BASE,
            subscriber_fn(move |_| {
                delivered_in.fetch_add(1, Ordering::Relaxed);
            }),
            ReferenceStrength::Strong,
        );

        bus.publish(probe(&BASE, 1)).unwrap();
        assert_eq!(delivered.load(Ordering::Relaxed), 1);
        assert_eq!(sink.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscriber_panic_isolation() {
        let bus = EventBus::new();
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        bus.set_exception_sink(Arc::clone(&sink) as Arc<dyn ExceptionSink>);

        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..4 {
            if i % 2 == 0 {
                bus.subscribe(
                    &BASE,
                    subscriber_fn(|_| panic!("boom")),
                    ReferenceStrength::Strong,
                );
            } else {
                let counter_in = Arc::clone(&counter);
                bus.subscribe(
                    &BASE,
                    subscriber_fn(move |_| {
                        counter_in.fetch_add(1, Ordering::Relaxed);
                    }),
                    ReferenceStrength::Strong,
                );
            }
        }

        bus.publish(probe(&BASE, 1)).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 2);
        assert_eq!(sink.0.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_hierarchical_and_exact_dispatch() {
        let bus = EventBus::new();
        let hier = Arc::new(AtomicUsize::new(0));
        let exact = Arc::new(AtomicUsize::new(0));

        let hier_in = Arc::clone(&hier);
        bus.subscribe(
            &BASE,
            subscriber_fn(move |_| {
                hier_in.fetch_add(1, Ordering::Relaxed);
            }),
            ReferenceStrength::Strong,
        );
        let exact_in = Arc::clone(&exact);
        bus.subscribe_exactly(
            &BASE,
            subscriber_fn(move |_| {
                exact_in.fetch_add(1, Ordering::Relaxed);
            }),
            ReferenceStrength::Strong,
        );

        bus.publish(probe(&DERIVED, 1)).unwrap();
        assert_eq!(hier.load(Ordering::Relaxed), 1);
        assert_eq!(exact.load(Ordering::Relaxed), 0);

        bus.publish(probe(&BASE, 2)).unwrap();
        assert_eq!(hier.load(Ordering::Relaxed), 2);
        assert_eq!(exact.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_typed_publication_reaches_type_subscribers() {
        static LIST: EventClass = EventClass::base("List");
        let bus = EventBus::new();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in = Arc::clone(&seen);
        bus.subscribe_to_type(
            TypeRef::new(
                &LIST,
                vec![crate::event::TypeArg::Wildcard {
                    upper: Some(&BASE),
                    lower: None,
                }],
            ),
            subscriber_fn(move |_| {
                seen_in.fetch_add(1, Ordering::Relaxed);
            }),
            ReferenceStrength::Strong,
        );

        let matching = TypeRef::new(&LIST, vec![crate::event::TypeArg::Class(&DERIVED)]);
        let missing = TypeRef::new(&LIST, vec![crate::event::TypeArg::Class(&TIMING_EVENT)]);
        bus.publish_typed(&matching, probe(&BASE, 1)).unwrap();
        bus.publish_typed(&missing, probe(&BASE, 2)).unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_topic_veto_and_delivery() {
        let bus = EventBus::new();
        let seen: Arc<StdMutex<Vec<(String, i32)>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_in = Arc::clone(&seen);
        bus.subscribe_topic(
            "orders",
            topic_subscriber_fn(move |topic, payload| {
                let value = *payload.downcast_ref::<i32>().unwrap();
                seen_in.lock().unwrap().push((topic.to_owned(), value));
            }),
            ReferenceStrength::Strong,
        );
        let veto = topic_vetoer_fn(|_, payload| *payload.downcast_ref::<i32>().unwrap() < 0);
        bus.subscribe_veto_topic("orders", veto, ReferenceStrength::Strong);

        bus.publish_topic("orders", Arc::new(5i32)).unwrap();
        bus.publish_topic("orders", Arc::new(-1i32)).unwrap();
        bus.publish_topic("orders", Arc::new(7i32)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[("orders".to_owned(), 5), ("orders".to_owned(), 7)]);
    }

    #[test]
    fn test_reentrant_publish_from_subscriber() {
        let bus = EventBus::new();
        let inner_seen = Arc::new(AtomicUsize::new(0));

        let inner_in = Arc::clone(&inner_seen);
        bus.subscribe(
            &DERIVED,
            subscriber_fn(move |_| {
                inner_in.fetch_add(1, Ordering::Relaxed);
            }),
            ReferenceStrength::Strong,
        );

        let bus_in = bus.clone();
        bus.subscribe_exactly(
            &BASE,
            subscriber_fn(move |_| {
                bus_in.publish(probe(&DERIVED, 9)).unwrap();
            }),
            ReferenceStrength::Strong,
        );

        bus.publish(probe(&BASE, 1)).unwrap();
        assert_eq!(inner_seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_clear_all_subscribers() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_in = Arc::clone(&counter);
        bus.subscribe(
            &BASE,
            subscriber_fn(move |_| {
                counter_in.fetch_add(1, Ordering::Relaxed);
            }),
            ReferenceStrength::Strong,
        );
        bus.clear_all_subscribers();
        bus.publish(probe(&BASE, 1)).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    // --- Timing tests ---

    #[test]
    fn test_timing_event_published_for_slow_subscriber() {
        let bus = EventBus::with_config(BusConfig {
            time_threshold: Some(Duration::from_millis(5)),
            ..BusConfig::default()
        })
        .unwrap();

        let timings = Arc::new(AtomicUsize::new(0));
        let timings_in = Arc::clone(&timings);
        bus.subscribe(
            &TIMING_EVENT,
            subscriber_fn(move |event| {
                let timing = event
                    .as_any()
                    .downcast_ref::<crate::timing::SubscriberTimingEvent>()
                    .unwrap();
                assert_eq!(timing.event_class().unwrap().name(), "Base");
                timings_in.fetch_add(1, Ordering::Relaxed);
            }),
            ReferenceStrength::Strong,
        );
        bus.subscribe(
            &BASE,
            subscriber_fn(|_| std::thread::sleep(Duration::from_millis(20))),
            ReferenceStrength::Strong,
        );

        bus.publish(probe(&BASE, 1)).unwrap();
        assert_eq!(timings.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_no_timing_event_when_disabled() {
        let bus = EventBus::new();
        let timings = Arc::new(AtomicUsize::new(0));
        let timings_in = Arc::clone(&timings);
        bus.subscribe(
            &TIMING_EVENT,
            subscriber_fn(move |_| {
                timings_in.fetch_add(1, Ordering::Relaxed);
            }),
            ReferenceStrength::Strong,
        );
        bus.subscribe(
            &BASE,
            subscriber_fn(|_| std::thread::sleep(Duration::from_millis(10))),
            ReferenceStrength::Strong,
        );
        bus.publish(probe(&BASE, 1)).unwrap();
        assert_eq!(timings.load(Ordering::Relaxed), 0);
    }
}
