//! Sceneflow: execution scenes for distributed request handling
//!
//! Every asynchronous unit of work runs in a one-shot [`scene::Scene`] that
//! tracks which atoms (tables and in-memory state) it reads and what happens
//! when it changes them. Scenes call storage and remote services through narrow
//! interfaces ([`io::Database`], [`io::Service`]); remote calls travel as batched
//! HTTP RPC ([`rpc`]) that carries trace identity in headers and reports back,
//! per call, the names of the atoms the remote side read and changed.

pub mod atom;
pub mod batch;
pub mod config;
pub mod error;
pub mod io;
pub mod logging;
pub mod rpc;
pub mod scene;
pub mod trace;

pub use atom::{Atom, AtomReader, AtomRegistry, AtomSubscriber, Table};
pub use batch::JobBatcher;
pub use config::{ConfigLoader, SceneflowConfig};
pub use error::{RpcError, SceneError, StoreError, UsageError};
pub use io::{Database, IoConf, Record, Service, ServiceRequest};
pub use rpc::{HttpRpcClient, HttpRpcServer, Operation, OperationRegistry};
pub use scene::{ChangePolicy, Scene, SceneStatus};
pub use trace::{new_trace, TraceContext};
