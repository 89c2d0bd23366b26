//! Atoms: subscribable handles for state read during a scene.
//!
//! Rendering or computing a value reads atoms through a scene; the scene forwards
//! every read to its active [`AtomReader`]s so they can collect dependencies. When
//! an atom changes, its [`AtomSubscriber`]s are notified and can recompute.
//!
//! Some atoms are tables with a name. Only named atoms cross process boundaries,
//! and only by name. Purely in-memory atoms have no name.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::SceneError;
use crate::trace::TraceContext;

pub mod registry;

pub use registry::{AtomRegistry, Table};

/// Collects the atoms read while it is registered on a scene.
pub trait AtomReader: Send + Sync {
    fn on_atom_read(&self, atom: &Atom);
}

/// Gets told that an atom it subscribed to was changed by some trace.
pub trait AtomSubscriber: Send + Sync {
    fn on_atom_changed(&self, trace: &TraceContext) -> Result<(), SceneError>;
}

struct AtomInner {
    name: Option<String>,
    subscribers: Mutex<Vec<Arc<dyn AtomSubscriber>>>,
}

/// Shared handle to one atom. Clones refer to the same atom.
#[derive(Clone)]
pub struct Atom {
    inner: Arc<AtomInner>,
}

impl Atom {
    /// An in-memory atom without a name.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// An atom standing for a durable named resource such as a table.
    pub fn named(name: impl Into<String>) -> Self {
        Self::build(Some(name.into()))
    }

    fn build(name: Option<String>) -> Self {
        Self {
            inner: Arc::new(AtomInner {
                name,
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Add a subscriber. Adding the same subscriber twice is a no-op.
    pub fn add_subscriber(&self, subscriber: Arc<dyn AtomSubscriber>) {
        trace!(atom = %self, "addSubscriber");
        let mut subscribers = self.inner.subscribers.lock();
        if !subscribers.iter().any(|s| Arc::ptr_eq(s, &subscriber)) {
            subscribers.push(subscriber);
        }
    }

    /// Remove a subscriber. Removing an absent subscriber is a no-op.
    pub fn delete_subscriber(&self, subscriber: &Arc<dyn AtomSubscriber>) {
        trace!(atom = %self, "deleteSubscriber");
        self.inner
            .subscribers
            .lock()
            .retain(|s| !Arc::ptr_eq(s, subscriber));
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Tell every current subscriber that `trace` changed this atom.
    ///
    /// With no subscribers this does nothing. Subscribers are called in
    /// registration order on a snapshot of the set. Delivery is not isolated: the
    /// first subscriber error is returned and the remaining subscribers are skipped.
    pub fn notify_changed(&self, trace: &TraceContext) -> Result<(), SceneError> {
        let subscribers = self.inner.subscribers.lock().clone();
        if subscribers.is_empty() {
            trace!(
                atom = %self,
                trace_op = %trace.trace_op,
                "notifyChanged without subscribers"
            );
            return Ok(());
        }
        trace!(atom = %self, subscribers = subscribers.len(), "notifyChanged");
        for subscriber in subscribers {
            subscriber.on_atom_changed(trace)?;
        }
        Ok(())
    }
}

impl Default for Atom {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Atom {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Atom {}

impl Hash for Atom {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.name {
            Some(name) => write!(f, "{{TableAtom {}}}", name),
            None => write!(f, "{{Atom {:p}}}", Arc::as_ptr(&self.inner)),
        }
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("name", &self.inner.name)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
