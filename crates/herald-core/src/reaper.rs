//! Background reaper for stale weak/proxy cells.
//!
//! The index keeps a count of weak cells and weak-strength proxy cells. When
//! a subscription pushes that count to the configured start threshold (and a
//! period is set), a reaper thread is spawned lazily. Each tick it publishes
//! a [`CleanupEvent`] stream through the bus itself: `Starting`, then either
//! `Cancelled` (count at or below the stop threshold — the thread exits) or
//! `Begun` followed by `Finished` with the number of stale cells evicted.
//!
//! The thread holds only a `Weak` reference to the bus core: dropping the
//! last bus handle lets the thread exit on its next wake, so the reaper
//! never keeps the service alive or blocks process shutdown.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::bus::BusCore;
use crate::event::{Event, EventClass};

/// Class of [`CleanupEvent`]. Subscribe to it to observe reaper activity.
pub static CLEANUP_EVENT: EventClass = EventClass::base("CleanupEvent");

// ---------------------------------------------------------------------------
// CleanupEvent
// ---------------------------------------------------------------------------

/// Phase of one reaper tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPhase {
    /// A tick started.
    Starting,
    /// The resident count was at or below the stop threshold; the reaper
    /// cancelled itself without sweeping.
    Cancelled,
    /// A sweep is about to walk the index.
    Begun,
    /// The sweep completed.
    Finished {
        /// Number of stale cells evicted.
        stale: usize,
    },
}

/// Published by the reaper around each tick.
pub struct CleanupEvent {
    phase: CleanupPhase,
    resident: usize,
}

impl CleanupEvent {
    pub(crate) fn new(phase: CleanupPhase, resident: usize) -> Self {
        Self { phase, resident }
    }

    /// The tick phase.
    #[must_use]
    pub fn phase(&self) -> CleanupPhase {
        self.phase
    }

    /// Weak/proxy cells resident when the event was published.
    #[must_use]
    pub fn resident(&self) -> usize {
        self.resident
    }
}

impl fmt::Display for CleanupEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase {
            CleanupPhase::Starting => write!(f, "cleanup starting, {} resident", self.resident),
            CleanupPhase::Cancelled => {
                write!(f, "cleanup cancelled under threshold, {} resident", self.resident)
            }
            CleanupPhase::Begun => write!(f, "cleanup begun, {} resident", self.resident),
            CleanupPhase::Finished { stale } => {
                write!(f, "cleanup finished, {stale} stale evicted, {} resident", self.resident)
            }
        }
    }
}

impl Event for CleanupEvent {
    fn class(&self) -> &'static EventClass {
        &CLEANUP_EVENT
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// ReaperSignal
// ---------------------------------------------------------------------------

struct SignalState {
    running: bool,
    cancelled: bool,
}

/// Tick/cancel signal shared between the bus core and the reaper thread.
///
/// Lives in its own `Arc` so the thread can wait on it without holding the
/// core alive.
pub(crate) struct ReaperSignal {
    state: Mutex<SignalState>,
    wakeup: Condvar,
}

impl ReaperSignal {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SignalState {
                running: false,
                cancelled: false,
            }),
            wakeup: Condvar::new(),
        }
    }

    /// Spawns the reaper thread unless one is already running.
    pub(crate) fn ensure_started(this: &Arc<Self>, core: &Arc<BusCore>) {
        let mut state = this.state.lock();
        if state.running {
            return;
        }
        state.running = true;
        state.cancelled = false;

        let signal = Arc::clone(this);
        let weak_core = Arc::downgrade(core);
        let spawned = thread::Builder::new()
            .name("herald-reaper".to_owned())
            .spawn(move || run(&signal, &weak_core));
        if let Err(err) = spawned {
            state.running = false;
            tracing::warn!(%err, "failed to spawn reaper thread");
        }
    }

    /// Stops the thread at its next wake.
    pub(crate) fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        self.wakeup.notify_all();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Sleeps for `period` or until cancelled. Returns `true` when cancelled.
    fn wait(&self, period: Duration) -> bool {
        let mut state = self.state.lock();
        let deadline = Instant::now() + period;
        while !state.cancelled {
            if self.wakeup.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.cancelled
    }

    fn mark_stopped(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.cancelled = false;
    }
}

fn run(signal: &Arc<ReaperSignal>, core: &Weak<BusCore>) {
    loop {
        // Read the period fresh each cycle so tuning changes take effect.
        let Some(period) = core.upgrade().and_then(|core| core.cleanup_period()) else {
            break;
        };
        if signal.wait(period) {
            break;
        }
        let Some(core) = core.upgrade() else {
            break;
        };
        if !tick(&core) {
            break;
        }
    }
    signal.mark_stopped();
}

/// One reaper tick. Returns `false` when the reaper cancelled itself.
fn tick(core: &Arc<BusCore>) -> bool {
    let resident = core.weakish_count();
    core.publish_cleanup(CleanupPhase::Starting, resident);

    let stop = core.cleanup_stop_threshold().unwrap_or(0);
    if resident <= stop {
        tracing::debug!(resident, stop, "reaper stopping under threshold");
        core.publish_cleanup(CleanupPhase::Cancelled, resident);
        return false;
    }

    core.publish_cleanup(CleanupPhase::Begun, resident);
    let stale = core.sweep_index();
    tracing::debug!(resident, stale, "reaper sweep finished");
    core.publish_cleanup(CleanupPhase::Finished { stale }, core.weakish_count());
    true
}

// ===========================================================================
// Tests
// ===========================================================================
