//! Wall-clock timing surveillance of subscriber and vetoer calls.
//!
//! When the bus is configured with a time threshold, every vetoer and
//! subscriber call is measured and a [`SubscriberTimingEvent`] is published
//! through the bus itself whenever a call runs over. Measurement is post-hoc:
//! nothing is interrupted, the event is a signal.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::event::{Event, EventClass};
use crate::subscriber::{DispatchPhase, EventSubscriber};

/// Class of [`SubscriberTimingEvent`]. Subscribe to it to observe slow
/// subscribers.
pub static TIMING_EVENT: EventClass = EventClass::base("SubscriberTimingEvent");

// ---------------------------------------------------------------------------
// SubscriberTimingEvent
// ---------------------------------------------------------------------------

/// Published when a vetoer or subscriber call exceeded the configured
/// threshold.
pub struct SubscriberTimingEvent {
    phase: DispatchPhase,
    event_class: Option<&'static EventClass>,
    topic: Option<String>,
    ordinal: usize,
    started: Instant,
    ended: Instant,
    threshold: Duration,
}

impl SubscriberTimingEvent {
    /// Which phase the slow call ran in.
    #[must_use]
    pub fn phase(&self) -> DispatchPhase {
        self.phase
    }

    /// Class of the publication being dispatched, for class publications.
    #[must_use]
    pub fn event_class(&self) -> Option<&'static EventClass> {
        self.event_class
    }

    /// Topic of the publication being dispatched, for topic publications.
    #[must_use]
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Zero-based position of the offending callback in the snapshot.
    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// When the call started.
    #[must_use]
    pub fn started(&self) -> Instant {
        self.started
    }

    /// When the call returned (or unwound).
    #[must_use]
    pub fn ended(&self) -> Instant {
        self.ended
    }

    /// Measured wall-clock time of the call.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.ended - self.started
    }

    /// The configured threshold the call exceeded.
    #[must_use]
    pub fn threshold(&self) -> Duration {
        self.threshold
    }
}

impl fmt::Display for SubscriberTimingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slow callback while {} (#{}): {:?} over threshold {:?}",
            self.phase,
            self.ordinal,
            self.elapsed(),
            self.threshold,
        )?;
        if let Some(class) = self.event_class {
            write!(f, ", event class {}", class.name())?;
        }
        if let Some(topic) = &self.topic {
            write!(f, ", topic \"{topic}\"")?;
        }
        Ok(())
    }
}

impl Event for SubscriberTimingEvent {
    fn class(&self) -> &'static EventClass {
        &TIMING_EVENT
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// TimingMonitor
// ---------------------------------------------------------------------------

/// Measures callback wall time against an optional threshold.
pub(crate) struct TimingMonitor {
    threshold: Option<Duration>,
}

impl TimingMonitor {
    pub(crate) fn new(threshold: Option<Duration>) -> Self {
        Self { threshold }
    }

    /// Returns a timing event when the call that started at `started` ran
    /// over the threshold; the caller publishes it.
    pub(crate) fn check(
        &self,
        started: Instant,
        phase: DispatchPhase,
        event_class: Option<&'static EventClass>,
        topic: Option<&str>,
        ordinal: usize,
    ) -> Option<SubscriberTimingEvent> {
        let threshold = self.threshold?;
        let ended = Instant::now();
        (ended - started > threshold).then(|| SubscriberTimingEvent {
            phase,
            event_class,
            topic: topic.map(str::to_owned),
            ordinal,
            started,
            ended,
            threshold,
        })
    }
}

/// Built-in subscriber that logs timing events at warn level. Installed when
/// [`BusConfig::log_timing_events`](crate::BusConfig::log_timing_events) is
/// set.
pub(crate) struct TimingLogger;

impl EventSubscriber for TimingLogger {
    fn on_event(&self, event: &Arc<dyn Event>) {
        if let Some(timing) = event.as_any().downcast_ref::<SubscriberTimingEvent>() {
            tracing::warn!("{timing}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
