//! Scene: the execution context of one asynchronous unit of work.
//!
//! Every async flow that does I/O gets its own scene. The scene carries the
//! trace, the I/O configuration and the set of active atom readers, and it can
//! only be executed once:
//!
//! ```text
//! Init --execute--> Executing --task settles--> Finished
//! ```
//!
//! A backend handling an HTTP request runs its handler in a scene without
//! subscriptions. A frontend computing a value runs it in a scene with a reader
//! registered, collecting every atom it reads. A frontend handling a click runs a
//! write in a scene whose change policy notifies subscribers.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, trace, Instrument};

use crate::atom::{Atom, AtomReader};
use crate::error::{SceneError, UsageError};
use crate::io::IoConf;
use crate::trace::{report_event, TraceContext};

pub mod policy;
pub mod stub;

pub use policy::ChangePolicy;
pub use stub::{DatabaseStub, ServiceStub};

/// Lifecycle state of a [`Scene`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneStatus {
    Init,
    Executing,
    Finished,
}

pub struct Scene {
    trace: Arc<TraceContext>,
    conf: IoConf,
    policy: ChangePolicy,
    status: Mutex<SceneStatus>,
    // Readers registered by `execute` and by nested `track_atom_read` scopes.
    active_readers: Mutex<Vec<Arc<dyn AtomReader>>>,
}

impl Scene {
    /// A scene whose atom changes are ignored.
    pub fn new(trace: impl Into<Arc<TraceContext>>, conf: IoConf) -> Arc<Self> {
        Self::with_policy(trace, conf, ChangePolicy::ignore())
    }

    /// A scene that hands every atom change to `policy`.
    pub fn with_policy(
        trace: impl Into<Arc<TraceContext>>,
        conf: IoConf,
        policy: ChangePolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            trace: trace.into(),
            conf,
            policy,
            status: Mutex::new(SceneStatus::Init),
            active_readers: Mutex::new(Vec::new()),
        })
    }

    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    pub fn conf(&self) -> &IoConf {
        &self.conf
    }

    pub fn status(&self) -> SceneStatus {
        *self.status.lock()
    }

    /// Run `task` inside this scene.
    ///
    /// `receiver` is registered as an active reader for the whole execution. Once
    /// the task settles, the dispatcher is told the scene finished, the receiver is
    /// removed and the scene becomes [`SceneStatus::Finished`], whether the task
    /// succeeded or not. A scene that finished can never execute again; build a
    /// new one to retry.
    pub async fn execute<T, F, Fut>(
        self: &Arc<Self>,
        receiver: Option<Arc<dyn AtomReader>>,
        task: F,
    ) -> Result<T, SceneError>
    where
        F: FnOnce(Arc<Scene>) -> Fut,
        Fut: Future<Output = Result<T, SceneError>>,
    {
        {
            let mut status = self.status.lock();
            match *status {
                SceneStatus::Init => *status = SceneStatus::Executing,
                SceneStatus::Executing => return Err(UsageError::AlreadyExecuting.into()),
                SceneStatus::Finished => return Err(UsageError::Reused.into()),
            }
        }
        if let Some(reader) = &receiver {
            self.add_reader(Arc::clone(reader));
        }
        // Cleans up if this future is dropped before the task settles.
        let mut guard = ExecutionGuard {
            scene: self,
            receiver: receiver.as_ref(),
            armed: true,
        };

        // Let other flows of the same trace see that this scene is running.
        if let Some(hook) = &self.trace.on_execution_started {
            hook(self);
        }

        let span = tracing::debug_span!(
            "scene",
            trace_id = %self.trace.trace_id,
            trace_op = %self.trace.trace_op
        );
        debug!(parent: &span, "Scene executing");
        let result = task(Arc::clone(self)).instrument(span.clone()).await;
        if let Err(e) = &result {
            debug!(parent: &span, error = %e, "Scene task failed");
            if let Some(hook) = &self.trace.on_error {
                hook(e);
            }
        }

        if let Err(e) = self.conf.service.on_scene_finished(self).await {
            self.report_event(
                "failed to call service.onSceneFinished",
                json!({ "error": e.to_string() }),
            );
        }
        guard.armed = false;
        self.close(receiver.as_ref());
        debug!(parent: &span, "Scene finished");
        result
    }

    fn close(&self, receiver: Option<&Arc<dyn AtomReader>>) {
        if let Some(reader) = receiver {
            self.remove_reader(reader);
        }
        let leftover = self.active_readers.lock().len();
        if leftover > 0 {
            self.report_event(
                "detected activeReaders not empty after scene finished",
                json!({ "active_readers": leftover }),
            );
        }
        *self.status.lock() = SceneStatus::Finished;
    }

    fn assert_executing(&self) -> Result<(), UsageError> {
        match *self.status.lock() {
            SceneStatus::Executing => Ok(()),
            SceneStatus::Init => Err(UsageError::NotStarted),
            SceneStatus::Finished => Err(UsageError::Reused),
        }
    }

    fn add_reader(&self, reader: Arc<dyn AtomReader>) {
        let mut readers = self.active_readers.lock();
        if !readers.iter().any(|r| Arc::ptr_eq(r, &reader)) {
            readers.push(reader);
        }
    }

    fn remove_reader(&self, reader: &Arc<dyn AtomReader>) {
        self.active_readers
            .lock()
            .retain(|r| !Arc::ptr_eq(r, reader));
    }

    /// Register `reader` for as long as `work` runs.
    ///
    /// The reader is removed on every exit path, including errors and
    /// cancellation. Scopes may nest or overlap; every active reader sees every
    /// read, not just the innermost one.
    pub async fn track_atom_read<T, Fut>(
        &self,
        reader: Arc<dyn AtomReader>,
        work: Fut,
    ) -> Result<T, SceneError>
    where
        Fut: Future<Output = Result<T, SceneError>>,
    {
        self.assert_executing()?;
        self.add_reader(Arc::clone(&reader));
        let _guard = ReaderGuard {
            scene: self,
            reader,
        };
        work.await
    }

    /// Report that an operation performed through this scene read `atom`.
    ///
    /// Called by [`crate::io::Database`] and [`crate::io::Service`]
    /// implementations. Every active reader is told.
    pub fn on_atom_read(&self, atom: &Atom) -> Result<(), SceneError> {
        self.assert_executing()?;
        let readers = self.active_readers.lock().clone();
        trace!(atom = %atom, readers = readers.len(), "onAtomRead");
        for reader in readers {
            reader.on_atom_read(atom);
        }
        Ok(())
    }

    /// Report that an operation performed through this scene changed `atom`.
    ///
    /// What happens next is decided by the scene's [`ChangePolicy`].
    pub fn on_atom_changed(&self, atom: &Atom) -> Result<(), SceneError> {
        self.assert_executing()?;
        trace!(atom = %atom, "onAtomChanged");
        self.policy.apply(self, atom)
    }

    /// A stub calling methods of `service_name` through this scene's dispatcher.
    ///
    /// `service_port` 0 leaves routing to discovery.
    pub fn use_service(
        &self,
        service_name: &str,
        service_port: u16,
    ) -> Result<ServiceStub<'_>, SceneError> {
        self.assert_executing()?;
        Ok(ServiceStub::new(self, service_name, service_port))
    }

    /// A stub for the database reached under the `db` service.
    pub fn use_database(&self) -> Result<DatabaseStub<'_>, SceneError> {
        self.assert_executing()?;
        Ok(DatabaseStub::new(self))
    }

    /// Suspend for `duration`. No cancellation hook.
    pub async fn sleep(&self, duration: Duration) -> Result<(), SceneError> {
        self.assert_executing()?;
        tokio::time::sleep(duration).await;
        Ok(())
    }

    pub fn report_event(&self, message: &str, detail: Value) {
        report_event(message, detail, Some(&self.trace));
    }
}

impl fmt::Display for Scene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{S traceId={} traceOp={}}}",
            self.trace.trace_id, self.trace.trace_op
        )
    }
}

impl fmt::Debug for Scene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scene")
            .field("trace", &self.trace)
            .field("status", &self.status())
            .field("active_readers", &self.active_readers.lock().len())
            .finish()
    }
}

struct ExecutionGuard<'a> {
    scene: &'a Scene,
    receiver: Option<&'a Arc<dyn AtomReader>>,
    armed: bool,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.scene
                .report_event("scene dropped before its task settled", json!({}));
            self.scene.close(self.receiver);
        }
    }
}

struct ReaderGuard<'a> {
    scene: &'a Scene,
    reader: Arc<dyn AtomReader>,
}

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        self.scene.remove_reader(&self.reader);
    }
}
