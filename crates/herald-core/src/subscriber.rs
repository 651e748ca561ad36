//! Subscriber and vetoer callback traits, plus the exception sink.
//!
//! Two capability kinds exist for subscribers and for vetoers: class-based
//! (receives the event object) and topic-based (receives the topic name and
//! payload). A single type may implement both; the bus stores them in
//! separate indices and never assumes the coincidence.
//!
//! # Panic Safety
//!
//! Callbacks run inline on the publishing thread. Panics in any callback are
//! caught by the bus, converted to a [`PanicContext`], and routed through the
//! bus's [`ExceptionSink`] — a panicking vetoer does not veto, and a
//! panicking subscriber never interrupts delivery to the rest of the list.

use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;

use crate::event::{Event, EventClass};

/// Payload delivered alongside a topic name.
pub type Payload = Arc<dyn Any + Send + Sync>;

// ---------------------------------------------------------------------------
// Subscriber traits
// ---------------------------------------------------------------------------

/// Receives events published by class or by type reference.
pub trait EventSubscriber: Send + Sync {
    /// Called once per matching publication.
    fn on_event(&self, event: &Arc<dyn Event>);
}

/// Receives payloads published under a topic name.
pub trait TopicSubscriber: Send + Sync {
    /// Called once per matching publication with the concrete topic that
    /// matched (for pattern subscriptions, the published name, not the
    /// pattern).
    fn on_topic(&self, topic: &str, payload: &Payload);
}

/// Consulted before class-based delivery; returning `true` cancels the
/// publication.
pub trait EventVetoer: Send + Sync {
    /// Whether to veto this publication.
    fn should_veto(&self, event: &Arc<dyn Event>) -> bool;
}

/// Consulted before topic-based delivery; returning `true` cancels the
/// publication.
pub trait TopicVetoer: Send + Sync {
    /// Whether to veto this publication.
    fn should_veto(&self, topic: &str, payload: &Payload) -> bool;
}

// ---------------------------------------------------------------------------
// Closure adapters
// ---------------------------------------------------------------------------

struct FnEventSubscriber<F>(F);

impl<F: Fn(&Arc<dyn Event>) + Send + Sync> EventSubscriber for FnEventSubscriber<F> {
    fn on_event(&self, event: &Arc<dyn Event>) {
        (self.0)(event);
    }
}

struct FnTopicSubscriber<F>(F);

impl<F: Fn(&str, &Payload) + Send + Sync> TopicSubscriber for FnTopicSubscriber<F> {
    fn on_topic(&self, topic: &str, payload: &Payload) {
        (self.0)(topic, payload);
    }
}

struct FnEventVetoer<F>(F);

impl<F: Fn(&Arc<dyn Event>) -> bool + Send + Sync> EventVetoer for FnEventVetoer<F> {
    fn should_veto(&self, event: &Arc<dyn Event>) -> bool {
        (self.0)(event)
    }
}

struct FnTopicVetoer<F>(F);

impl<F: Fn(&str, &Payload) -> bool + Send + Sync> TopicVetoer for FnTopicVetoer<F> {
    fn should_veto(&self, topic: &str, payload: &Payload) -> bool {
        (self.0)(topic, payload)
    }
}

/// Wraps a closure as an [`EventSubscriber`].
pub fn subscriber_fn<F>(f: F) -> Arc<dyn EventSubscriber>
where
    F: Fn(&Arc<dyn Event>) + Send + Sync + 'static,
{
    Arc::new(FnEventSubscriber(f))
}

/// Wraps a closure as a [`TopicSubscriber`].
pub fn topic_subscriber_fn<F>(f: F) -> Arc<dyn TopicSubscriber>
where
    F: Fn(&str, &Payload) + Send + Sync + 'static,
{
    Arc::new(FnTopicSubscriber(f))
}

/// Wraps a closure as an [`EventVetoer`].
pub fn vetoer_fn<F>(f: F) -> Arc<dyn EventVetoer>
where
    F: Fn(&Arc<dyn Event>) -> bool + Send + Sync + 'static,
{
    Arc::new(FnEventVetoer(f))
}

/// Wraps a closure as a [`TopicVetoer`].
pub fn topic_vetoer_fn<F>(f: F) -> Arc<dyn TopicVetoer>
where
    F: Fn(&str, &Payload) -> bool + Send + Sync + 'static,
{
    Arc::new(FnTopicVetoer(f))
}

// ---------------------------------------------------------------------------
// ExceptionSink
// ---------------------------------------------------------------------------

/// Which pipeline phase a callback ran in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    /// The veto phase, before caching and delivery.
    Veto,
    /// The delivery phase.
    Delivery,
}

impl fmt::Display for DispatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Veto => write!(f, "vetoing"),
            Self::Delivery => write!(f, "delivering"),
        }
    }
}

/// Context handed to the [`ExceptionSink`] when a callback panics.
pub struct PanicContext<'a> {
    /// Which phase the callback ran in.
    pub phase: DispatchPhase,
    /// Class of the published event, for class/type publications.
    pub event_class: Option<&'static EventClass>,
    /// Topic name, for topic publications.
    pub topic: Option<&'a str>,
    /// Zero-based position of the callback in the publication snapshot.
    pub ordinal: usize,
    /// The panic payload, when it was a string.
    pub message: &'a str,
    /// Backtrace captured at the recovery site (respects `RUST_BACKTRACE`).
    pub backtrace: &'a Backtrace,
}

impl PanicContext<'_> {
    /// A short description of the publication key.
    #[must_use]
    pub fn subject(&self) -> String {
        match (self.event_class, self.topic) {
            (Some(class), _) => format!("event class {}", class.name()),
            (None, Some(topic)) => format!("topic \"{topic}\""),
            (None, None) => "unknown publication".to_owned(),
        }
    }
}

/// Sink for panics escaping subscriber or vetoer callbacks.
///
/// The default sink logs at warn level with full context. Hosts that report
/// errors differently install their own via
/// [`EventBus::set_exception_sink`](crate::EventBus::set_exception_sink).
/// Publication always continues after the sink returns.
pub trait ExceptionSink: Send + Sync {
    /// Called once per caught panic.
    fn on_panic(&self, ctx: &PanicContext<'_>);
}

/// Default sink: logs a warning via `tracing`.
pub(crate) struct LogSink;

impl ExceptionSink for LogSink {
    fn on_panic(&self, ctx: &PanicContext<'_>) {
        tracing::warn!(
            phase = %ctx.phase,
            subject = %ctx.subject(),
            ordinal = ctx.ordinal,
            message = %ctx.message,
            "subscriber panicked during dispatch"
        );
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

// ===========================================================================
// Tests
// ===========================================================================
