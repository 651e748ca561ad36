//! Reference cells and ordered per-key subscription lists.
//!
//! A [`Cell`] is the uniform handle the index stores for every subscription:
//! strong (`Arc`), weak (`std::sync::Weak`), or proxy (held strongly, with a
//! [`ProxyControl`] side-channel reporting whether the proxied real target is
//! still reachable). All dispatch and de-duplication paths consume only live
//! targets resolved through the cell.
//!
//! [`CellList`] is the ordered per-key list: duplicate inserts relocate the
//! subscription to the tail, every walk opportunistically evicts stale cells,
//! and snapshots resolve cells to owned dispatch targets. All `CellList`
//! mutators report a weakish-cell delta so the index can keep the reaper
//! counter exact.

use std::sync::Arc;

use smallvec::SmallVec;

// ---------------------------------------------------------------------------
// ReferenceStrength / TargetId / ProxyControl
// ---------------------------------------------------------------------------

/// How a subscription holds its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceStrength {
    /// The subscription keeps the target alive.
    Strong,
    /// The subscription does not extend the target's lifetime; the cell goes
    /// stale once the last external `Arc` is dropped.
    Weak,
}

/// Pointer identity of a subscription target.
///
/// Derived from the `Arc` data pointer, so the same allocation compares equal
/// regardless of which trait object it is viewed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(usize);

impl TargetId {
    /// Identity of the given target.
    #[must_use]
    pub fn of<T: ?Sized>(target: &Arc<T>) -> Self {
        Self(Arc::as_ptr(target).cast::<()>() as usize)
    }
}

/// Contract a proxy subscriber exposes to the bus.
///
/// A proxy is an intermediary that forwards deliveries to a real target it
/// may hold weakly. The bus holds the proxy itself strongly — the proxy is
/// the weak holder — and consults this contract for liveness, de-duplication,
/// and reaper accounting.
pub trait ProxyControl: Send + Sync {
    /// Identity of the proxied real target, or `None` once it was collected.
    fn proxied_target(&self) -> Option<TargetId>;

    /// Strength of the proxy's own reference to the real target. Weak-strength
    /// proxies count toward the reaper's weak/proxy total.
    fn strength(&self) -> ReferenceStrength;

    /// Called when the proxy's subscription is removed, whether by explicit
    /// unsubscribe or by stale-cell eviction.
    fn on_unsubscribed(&self) {}
}

// ---------------------------------------------------------------------------
// Cell
// ---------------------------------------------------------------------------

/// Tagged handle over one subscription reference.
pub(crate) enum Cell<T: ?Sized> {
    /// Keeps the subscriber alive.
    Strong(Arc<T>),
    /// Goes stale when the subscriber is dropped elsewhere.
    Weak(std::sync::Weak<T>),
    /// The proxy is held strongly and is itself the dispatch target; liveness
    /// tracks the proxied real target.
    Proxy {
        subscriber: Arc<T>,
        control: Arc<dyn ProxyControl>,
    },
}

impl<T: ?Sized> Cell<T> {
    pub(crate) fn new(subscriber: Arc<T>, strength: ReferenceStrength) -> Self {
        match strength {
            ReferenceStrength::Strong => Self::Strong(subscriber),
            ReferenceStrength::Weak => Self::Weak(Arc::downgrade(&subscriber)),
        }
    }

    /// The object deliveries go to, if the cell is live. For proxies this is
    /// the proxy itself, not the proxied target.
    pub(crate) fn dispatch_target(&self) -> Option<Arc<T>> {
        match self {
            Self::Strong(subscriber) => Some(Arc::clone(subscriber)),
            Self::Weak(weak) => weak.upgrade(),
            Self::Proxy {
                subscriber,
                control,
            } => control.proxied_target().map(|_| Arc::clone(subscriber)),
        }
    }

    /// Identity used for de-duplication: the subscriber itself for strong and
    /// weak cells, the proxied real target for proxy cells.
    pub(crate) fn target_id(&self) -> Option<TargetId> {
        match self {
            Self::Strong(subscriber) => Some(TargetId::of(subscriber)),
            Self::Weak(weak) => weak.upgrade().map(|live| TargetId::of(&live)),
            Self::Proxy { control, .. } => control.proxied_target(),
        }
    }

    /// Identity of the dispatch target, for unsubscription by the object the
    /// caller originally handed to `subscribe`.
    pub(crate) fn dispatch_id(&self) -> Option<TargetId> {
        match self {
            Self::Strong(_) | Self::Weak(_) => self.target_id(),
            Self::Proxy {
                subscriber,
                control,
            } => control.proxied_target().map(|_| TargetId::of(subscriber)),
        }
    }

    /// Whether this cell counts toward the reaper's weak/proxy total.
    pub(crate) fn is_weakish(&self) -> bool {
        match self {
            Self::Strong(_) => false,
            Self::Weak(_) => true,
            Self::Proxy { control, .. } => control.strength() == ReferenceStrength::Weak,
        }
    }

    fn is_stale(&self) -> bool {
        match self {
            Self::Strong(_) => false,
            Self::Weak(weak) => weak.strong_count() == 0,
            Self::Proxy { control, .. } => control.proxied_target().is_none(),
        }
    }

    fn notify_unsubscribed(&self) {
        if let Self::Proxy { control, .. } = self {
            control.on_unsubscribed();
        }
    }
}

// ---------------------------------------------------------------------------
// CellList
// ---------------------------------------------------------------------------

/// Which identity an unsubscription probe compares against.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Probe {
    /// Match the dispatch target (the subscriber, or the proxy object itself).
    Dispatch(TargetId),
    /// Match strong/weak cells by subscriber identity and proxy cells by
    /// their proxied real target.
    Proxied(TargetId),
}

/// Ordered subscription list for one index key.
pub(crate) struct CellList<T: ?Sized> {
    cells: Vec<Cell<T>>,
}

impl<T: ?Sized> CellList<T> {
    pub(crate) fn new() -> Self {
        Self { cells: Vec::new() }
    }

    /// Inserts a cell, de-duplicating by live target. A duplicate does not
    /// add a second subscription; the existing one is discarded and the new
    /// cell appended, relocating the subscription to the tail. Stale cells
    /// met during the walk are evicted (proxies notified).
    ///
    /// Returns `(newly_added, weakish_delta)`. A cell that is already stale
    /// on arrival is not inserted and reports `(false, 0)`.
    pub(crate) fn insert(&mut self, cell: Cell<T>) -> (bool, isize) {
        let Some(new_id) = cell.target_id() else {
            return (false, 0);
        };
        let mut delta = 0isize;
        let mut existed = false;
        self.cells.retain(|existing| match existing.target_id() {
            None => {
                existing.notify_unsubscribed();
                if existing.is_weakish() {
                    delta -= 1;
                }
                false
            }
            Some(id) if id == new_id => {
                existed = true;
                if existing.is_weakish() {
                    delta -= 1;
                }
                false
            }
            Some(_) => true,
        });
        if cell.is_weakish() {
            delta += 1;
        }
        self.cells.push(cell);
        (!existed, delta)
    }

    /// Removes the first cell matching the probe, notifying matched and
    /// evicted proxies. Stale cells met during the walk are evicted too.
    ///
    /// Returns `(removed, weakish_delta)`.
    pub(crate) fn remove(&mut self, probe: Probe) -> (bool, isize) {
        let mut delta = 0isize;
        let mut removed = false;
        self.cells.retain(|cell| {
            let id = match probe {
                Probe::Dispatch(_) => cell.dispatch_id(),
                Probe::Proxied(_) => cell.target_id(),
            };
            let Some(id) = id else {
                cell.notify_unsubscribed();
                if cell.is_weakish() {
                    delta -= 1;
                }
                return false;
            };
            let wanted = match probe {
                Probe::Dispatch(target) | Probe::Proxied(target) => target,
            };
            if !removed && id == wanted {
                removed = true;
                cell.notify_unsubscribed();
                if cell.is_weakish() {
                    delta -= 1;
                }
                return false;
            }
            true
        });
        (removed, delta)
    }

    /// Copies the list into owned dispatch targets, evicting stale cells
    /// from the underlying list as it goes. The returned snapshot is stable
    /// under later mutation of the list.
    pub(crate) fn snapshot(&mut self, weakish_delta: &mut isize) -> SmallVec<[Arc<T>; 4]> {
        let mut out: SmallVec<[Arc<T>; 4]> = SmallVec::new();
        self.cells.retain(|cell| {
            if let Some(target) = cell.dispatch_target() {
                out.push(target);
                true
            } else {
                cell.notify_unsubscribed();
                if cell.is_weakish() {
                    *weakish_delta -= 1;
                }
                false
            }
        });
        out
    }

    /// Evicts every stale cell. Returns `(stale_removed, weakish_delta)`.
    pub(crate) fn sweep(&mut self) -> (usize, isize) {
        let mut stale = 0usize;
        let mut delta = 0isize;
        self.cells.retain(|cell| {
            if cell.is_stale() {
                cell.notify_unsubscribed();
                if cell.is_weakish() {
                    delta -= 1;
                }
                stale += 1;
                false
            } else {
                true
            }
        });
        (stale, delta)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
