//! # Herald Core
//!
//! An in-process publish/subscribe event bus. Components exchange
//! notifications by event class, by topic name, or by topic pattern without
//! holding references to each other.
//!
//! This crate provides:
//! - **Event dispatch**: a two-phase veto → deliver pipeline over immutable
//!   subscriber snapshots
//! - **Four keying schemes**: hierarchical class, exact class, parameterized
//!   type reference, and topic (exact or regex pattern)
//! - **Reference management**: strong, weak, and proxy subscriptions with a
//!   background reaper for stale cells
//! - **Event caches**: bounded per-class and per-topic recency buffers with
//!   inheritance-aware size resolution
//!
//! ## Design Principles
//!
//! 1. **Snapshot dispatch** - publication iterates a private copy; subscribers
//!    may mutate subscriptions mid-delivery
//! 2. **No locks across callbacks** - the index and cache locks are released
//!    before any subscriber code runs
//! 3. **Panic quarantine** - a panicking subscriber or vetoer never aborts the
//!    publication or the rest of the subscriber list
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use herald_core::{subscriber_fn, EventBus, EventClass, ReferenceStrength};
//!
//! static TICK_EVENT: EventClass = EventClass::base("TickEvent");
//!
//! struct Tick(u64);
//!
//! impl herald_core::Event for Tick {
//!     fn class(&self) -> &'static EventClass {
//!         &TICK_EVENT
//!     }
//!     fn as_any(&self) -> &dyn std::any::Any {
//!         self
//!     }
//! }
//!
//! let bus = EventBus::new();
//! let seen = subscriber_fn(|event| {
//!     let tick = event.as_any().downcast_ref::<Tick>().unwrap();
//!     println!("tick {}", tick.0);
//! });
//! bus.subscribe(&TICK_EVENT, seen, ReferenceStrength::Strong);
//! bus.publish(Arc::new(Tick(1))).unwrap();
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod bus;
mod cache;
mod cell;
mod config;
mod event;
mod index;
mod reaper;
mod subscriber;
mod timing;

pub use bus::EventBus;
pub use cell::{ProxyControl, ReferenceStrength, TargetId};
pub use config::BusConfig;
pub use event::{ClassKind, Event, EventClass, TopicPattern, TypeArg, TypeRef};
pub use reaper::{CleanupEvent, CleanupPhase, CLEANUP_EVENT};
pub use subscriber::{
    subscriber_fn, topic_subscriber_fn, topic_vetoer_fn, vetoer_fn, DispatchPhase,
    EventSubscriber, EventVetoer, ExceptionSink, PanicContext, Payload, TopicSubscriber,
    TopicVetoer,
};
pub use timing::{SubscriberTimingEvent, TIMING_EVENT};

/// Result type for herald-core operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors raised by the event bus.
///
/// Subscriber and vetoer panics are never surfaced here; they are routed to
/// the bus's [`ExceptionSink`] and publication continues.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BusError {
    /// A caller-supplied argument was rejected: a marker class where a
    /// concrete one is required, a wildcard in a published type reference,
    /// an unparseable topic pattern, or an inconsistent configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
