//! Event model and subscription keys.
//!
//! Events are arbitrary objects published as `Arc<dyn Event>`. Each event
//! belongs to a declared [`EventClass`] — a static descriptor carrying the
//! class name, an optional parent, and the marker classes it implements.
//! Descriptors stand in for a runtime class hierarchy: matching, cache-size
//! inheritance, and assignability all walk the descriptor graph.
//!
//! Identity is descriptor *address*: two `&'static EventClass` references
//! denote the same class iff they point at the same static. [`ClassKey`]
//! wraps that identity for map keying.
//!
//! [`TypeRef`] is the parameterized-type analogue of a class key: a raw class
//! plus type arguments, where subscription-side arguments may be wildcards
//! with upper/lower bounds.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr;

use regex::Regex;
use smallvec::SmallVec;

use crate::{BusError, Result};

// ---------------------------------------------------------------------------
// EventClass
// ---------------------------------------------------------------------------

/// Whether a class descriptor can be instantiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    /// A concrete event class; published events carry one of these.
    Concrete,
    /// A marker (interface-like) class: usable as a subscription or cache-size
    /// key, never as the class of a published event.
    Marker,
}

/// Static descriptor for an event class.
///
/// Declared as a `static` and referenced from [`Event::class`]:
///
/// ```rust
/// use herald_core::EventClass;
///
/// static APP_EVENT: EventClass = EventClass::base("AppEvent");
/// static ORDER_EVENT: EventClass = EventClass::subclass("OrderEvent", &APP_EVENT);
/// static AUDITED: EventClass = EventClass::marker("Audited");
/// ```
///
/// The parent chain is single-inheritance; `markers` lists the marker classes
/// this class implements, in declaration order. Marker classes express their
/// super-markers through their own `markers` list.
pub struct EventClass {
    name: &'static str,
    kind: ClassKind,
    parent: Option<&'static EventClass>,
    markers: &'static [&'static EventClass],
}

impl EventClass {
    /// A concrete class with no parent.
    #[must_use]
    pub const fn base(name: &'static str) -> Self {
        Self {
            name,
            kind: ClassKind::Concrete,
            parent: None,
            markers: &[],
        }
    }

    /// A concrete class extending `parent`.
    #[must_use]
    pub const fn subclass(name: &'static str, parent: &'static EventClass) -> Self {
        Self {
            name,
            kind: ClassKind::Concrete,
            parent: Some(parent),
            markers: &[],
        }
    }

    /// A marker class with no super-markers.
    #[must_use]
    pub const fn marker(name: &'static str) -> Self {
        Self {
            name,
            kind: ClassKind::Marker,
            parent: None,
            markers: &[],
        }
    }

    /// A marker class extending the given super-markers.
    #[must_use]
    pub const fn marker_extending(
        name: &'static str,
        supers: &'static [&'static EventClass],
    ) -> Self {
        Self {
            name,
            kind: ClassKind::Marker,
            parent: None,
            markers: supers,
        }
    }

    /// Full constructor: a concrete class with an optional parent and a list
    /// of implemented markers in declaration order.
    #[must_use]
    pub const fn new(
        name: &'static str,
        parent: Option<&'static EventClass>,
        markers: &'static [&'static EventClass],
    ) -> Self {
        Self {
            name,
            kind: ClassKind::Concrete,
            parent,
            markers,
        }
    }

    /// The declared class name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Whether this is a marker class.
    #[must_use]
    pub const fn is_marker(&self) -> bool {
        matches!(self.kind, ClassKind::Marker)
    }

    /// The direct parent, if any.
    #[must_use]
    pub const fn parent(&self) -> Option<&'static EventClass> {
        self.parent
    }

    /// The directly declared markers, in declaration order.
    #[must_use]
    pub const fn markers(&self) -> &'static [&'static EventClass] {
        self.markers
    }

    /// Returns `true` when a value of class `other` is also a value of
    /// `self`: the classes are identical, `self` is an ancestor of `other`,
    /// or `self` is in the marker closure of `other` or its ancestors.
    #[must_use]
    pub fn assignable_from(&'static self, other: &'static EventClass) -> bool {
        let mut cursor = Some(other);
        while let Some(class) = cursor {
            if ptr::eq(class, self) {
                return true;
            }
            cursor = class.parent;
        }
        self.is_marker()
            && other
                .marker_closure()
                .iter()
                .any(|&marker| ptr::eq(marker, self))
    }

    /// `self` followed by the parent chain, nearest first.
    pub(crate) fn self_and_ancestors(&'static self) -> SmallVec<[&'static EventClass; 4]> {
        let mut chain = SmallVec::new();
        let mut cursor = Some(self);
        while let Some(class) = cursor {
            chain.push(class);
            cursor = class.parent;
        }
        chain
    }

    /// Transitive marker closure: markers of `self` and of every ancestor,
    /// each followed depth-first by its super-markers, de-duplicated in
    /// first-encounter (declaration) order.
    pub(crate) fn marker_closure(&'static self) -> SmallVec<[&'static EventClass; 4]> {
        fn push(class: &'static EventClass, out: &mut SmallVec<[&'static EventClass; 4]>) {
            for &marker in class.markers {
                if !out.iter().any(|&seen| ptr::eq(seen, marker)) {
                    out.push(marker);
                    push(marker, out);
                }
            }
        }
        let mut closure = SmallVec::new();
        for class in self.self_and_ancestors() {
            push(class, &mut closure);
        }
        closure
    }

    /// All keys that match an event of this class in a hierarchical index:
    /// the class itself, its ancestors, then its marker closure.
    pub(crate) fn match_keys(&'static self) -> SmallVec<[&'static EventClass; 8]> {
        let mut keys: SmallVec<[&'static EventClass; 8]> = SmallVec::new();
        keys.extend(self.self_and_ancestors());
        keys.extend(self.marker_closure());
        keys
    }
}

impl fmt::Debug for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventClass")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ClassKey
// ---------------------------------------------------------------------------

/// Map key wrapping an [`EventClass`] with address identity.
#[derive(Clone, Copy)]
pub(crate) struct ClassKey(&'static EventClass);

impl ClassKey {
    pub(crate) fn of(class: &'static EventClass) -> Self {
        Self(class)
    }

    pub(crate) fn class(self) -> &'static EventClass {
        self.0
    }

    fn addr(self) -> usize {
        ptr::from_ref(self.0) as usize
    }
}

impl PartialEq for ClassKey {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for ClassKey {}

impl Hash for ClassKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for ClassKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassKey({})", self.0.name())
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// An object deliverable to class-based subscribers.
///
/// Implementations return their declared [`EventClass`] and expose themselves
/// as [`Any`] so subscribers can downcast:
///
/// ```rust
/// use herald_core::{Event, EventClass};
///
/// static ORDER_EVENT: EventClass = EventClass::base("OrderEvent");
///
/// struct OrderPlaced {
///     order_id: u64,
/// }
///
/// impl Event for OrderPlaced {
///     fn class(&self) -> &'static EventClass {
///         &ORDER_EVENT
///     }
///     fn as_any(&self) -> &dyn std::any::Any {
///         self
///     }
/// }
/// ```
pub trait Event: Any + Send + Sync {
    /// The declared class of this event. Must not be a marker class for
    /// published events.
    fn class(&self) -> &'static EventClass;

    /// Upcast for downcasting in subscribers.
    fn as_any(&self) -> &dyn Any;
}

// ---------------------------------------------------------------------------
// TypeRef / TypeArg
// ---------------------------------------------------------------------------

/// A type argument in a [`TypeRef`].
///
/// Subscription keys may use wildcards; published references may not.
#[derive(Clone, Copy)]
pub enum TypeArg {
    /// A concrete class argument.
    Class(&'static EventClass),
    /// A wildcard with optional bounds: `upper` must be assignable from the
    /// published argument, the published argument must be assignable from
    /// `lower`. A missing bound matches anything on that side.
    Wildcard {
        /// Upper bound (`? extends U`).
        upper: Option<&'static EventClass>,
        /// Lower bound (`? super L`).
        lower: Option<&'static EventClass>,
    },
}

impl TypeArg {
    fn matches(&self, published: &TypeArg) -> bool {
        // Published arguments may not themselves be wildcards.
        let TypeArg::Class(arg) = *published else {
            return false;
        };
        match *self {
            TypeArg::Class(class) => ptr::eq(class, arg),
            TypeArg::Wildcard { upper, lower } => {
                upper.is_none_or(|bound| bound.assignable_from(arg))
                    && lower.is_none_or(|bound| arg.assignable_from(bound))
            }
        }
    }

    fn is_wildcard(&self) -> bool {
        matches!(self, TypeArg::Wildcard { .. })
    }
}

impl PartialEq for TypeArg {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TypeArg::Class(a), TypeArg::Class(b)) => ptr::eq(*a, *b),
            (
                TypeArg::Wildcard { upper: ua, lower: la },
                TypeArg::Wildcard { upper: ub, lower: lb },
            ) => {
                opt_ptr_eq(*ua, *ub) && opt_ptr_eq(*la, *lb)
            }
            _ => false,
        }
    }
}

impl Eq for TypeArg {}

impl Hash for TypeArg {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            TypeArg::Class(class) => {
                0u8.hash(state);
                (ptr::from_ref(*class) as usize).hash(state);
            }
            TypeArg::Wildcard { upper, lower } => {
                1u8.hash(state);
                upper.map(|c| ptr::from_ref(c) as usize).hash(state);
                lower.map(|c| ptr::from_ref(c) as usize).hash(state);
            }
        }
    }
}

impl fmt::Debug for TypeArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeArg::Class(class) => write!(f, "{}", class.name()),
            TypeArg::Wildcard { upper, lower } => {
                write!(f, "?")?;
                if let Some(bound) = upper {
                    write!(f, " extends {}", bound.name())?;
                }
                if let Some(bound) = lower {
                    write!(f, " super {}", bound.name())?;
                }
                Ok(())
            }
        }
    }
}

fn opt_ptr_eq(a: Option<&'static EventClass>, b: Option<&'static EventClass>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => ptr::eq(a, b),
        _ => false,
    }
}

/// A parameterized type reference: a raw class plus type arguments.
///
/// Used to key the generic-type index, where erase-free class keys are not
/// expressive enough. A subscription `TypeRef` matches a published one iff
/// the raw classes are identical, arities agree, and every argument matches
/// per [`TypeArg`].
#[derive(Clone)]
pub struct TypeRef {
    raw: &'static EventClass,
    args: Vec<TypeArg>,
}

impl PartialEq for TypeRef {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.raw, other.raw) && self.args == other.args
    }
}

impl Eq for TypeRef {}

impl Hash for TypeRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (ptr::from_ref(self.raw) as usize).hash(state);
        self.args.hash(state);
    }
}

impl TypeRef {
    /// Builds a reference from a raw class and its arguments.
    #[must_use]
    pub fn new(raw: &'static EventClass, args: Vec<TypeArg>) -> Self {
        Self { raw, args }
    }

    /// The raw (unparameterized) class.
    #[must_use]
    pub fn raw(&self) -> &'static EventClass {
        self.raw
    }

    /// The type arguments.
    #[must_use]
    pub fn args(&self) -> &[TypeArg] {
        &self.args
    }

    pub(crate) fn has_wildcards(&self) -> bool {
        self.args.iter().any(TypeArg::is_wildcard)
    }

    /// Whether this (subscription-side) reference matches a published one.
    pub(crate) fn matches(&self, published: &TypeRef) -> bool {
        ptr::eq(self.raw, published.raw)
            && self.args.len() == published.args.len()
            && self
                .args
                .iter()
                .zip(&published.args)
                .all(|(key, arg)| key.matches(arg))
    }
}

impl fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<", self.raw.name())?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg:?}")?;
        }
        write!(f, ">")
    }
}

// ---------------------------------------------------------------------------
// TopicPattern
// ---------------------------------------------------------------------------

/// A compiled topic pattern. Matching is full-match: the regex must consume
/// the entire topic name.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    source: String,
    regex: Regex,
}

impl TopicPattern {
    /// Compiles a pattern, anchoring it at both ends.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidArgument`] when the pattern does not parse.
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(&format!(r"\A(?:{pattern})\z")).map_err(|err| {
            BusError::InvalidArgument(format!("invalid topic pattern `{pattern}`: {err}"))
        })?;
        Ok(Self {
            source: pattern.to_owned(),
            regex,
        })
    }

    /// The pattern text as supplied, without the added anchors.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Full-match test against a topic name.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        self.regex.is_match(topic)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
