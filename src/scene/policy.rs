//! What a scene does when an operation reports an atom changed.
//!
//! A scene does not trigger change notifications by itself. Whoever creates a
//! scene decides, based on the intent of the work it runs:
//! 1. forward the change to another scene (the caller of an RPC),
//! 2. notify the atom's subscribers so they refresh,
//! 3. reject it, for read-only work.

use std::fmt;
use std::sync::Arc;

use super::Scene;
use crate::atom::Atom;
use crate::error::SceneError;

type PolicyFn = dyn Fn(&Scene, &Atom) -> Result<(), SceneError> + Send + Sync;

/// Change policy of a scene, fixed at construction. Opaque to the scene.
#[derive(Clone)]
pub struct ChangePolicy {
    apply: Arc<PolicyFn>,
}

impl ChangePolicy {
    pub fn new<F>(apply: F) -> Self
    where
        F: Fn(&Scene, &Atom) -> Result<(), SceneError> + Send + Sync + 'static,
    {
        Self {
            apply: Arc::new(apply),
        }
    }

    /// Drop changes on the floor.
    pub fn ignore() -> Self {
        Self::new(|_, _| Ok(()))
    }

    /// Notify the changed atom's subscribers, tagged with the scene's trace.
    pub fn notify_subscribers() -> Self {
        Self::new(|scene, atom| atom.notify_changed(scene.trace()))
    }

    /// Refuse every change.
    pub fn read_only() -> Self {
        Self::new(|scene, atom| {
            Err(SceneError::ReadOnly(format!("{} changed {}", scene, atom)))
        })
    }

    /// Report every change to `target`, which must still be executing.
    pub fn forward_to(target: Arc<Scene>) -> Self {
        Self::new(move |_, atom| target.on_atom_changed(atom))
    }

    pub(crate) fn apply(&self, scene: &Scene, atom: &Atom) -> Result<(), SceneError> {
        (self.apply)(scene, atom)
    }
}

impl Default for ChangePolicy {
    fn default() -> Self {
        Self::ignore()
    }
}

impl fmt::Debug for ChangePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChangePolicy")
    }
}
