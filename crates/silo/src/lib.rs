//! Silo: a YANG-driven configuration datastore engine.
//!
//! Cooperating processes coordinate through a pair of shared regions (the
//! module registry and its variable-length arena, see [`silo_shm`]) while
//! an in-process worker pool drains client request messages bound to
//! sessions (see [`silo_engine`]). This crate ties the pieces together:
//! repository configuration and layout, the connection lifecycle, and the
//! engine wiring.
//!
//! ```no_run
//! use silo::{Engine, SiloConfig, SiloConn};
//! use silo_engine::MemStore;
//! use std::sync::Arc;
//!
//! # fn sink() -> Arc<dyn silo_engine::ResponseSink> { unimplemented!() }
//! # fn main() -> silo_error::Result<()> {
//! let conn = SiloConn::open(SiloConfig::from_env())?;
//! let store = Arc::new(MemStore::new(Vec::new()));
//! let engine = Engine::start(&conn, store, sink())?;
//! # let _ = engine;
//! # Ok(())
//! # }
//! ```

mod config;
mod conn;
mod engine;

pub use config::{check_dirs, SiloConfig, REPO_PATH_ENV};
pub use conn::{SiloConn, DEFAULT_DEFRAG_THRESHOLD};
pub use engine::Engine;

pub use silo_engine::{
    DataStore, Msg, Operation, OutMsg, Request, Response, ResponseSink, StoreSession,
};
pub use silo_error::{ErrorCode, Result, SiloError};
pub use silo_shm::{DepSpec, ModuleSpec, OpDepSpec, RecoveryHooks};
pub use silo_types::{Datastore, EditOptions, LockMode, MoveDirection, SubOptions, Value};
