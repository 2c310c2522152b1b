//! Shared-memory coordination layer for the silo datastore engine.
//!
//! Cooperating processes share two file-backed regions:
//!
//! - the **main** region: a fixed header (lock records, id counters, table
//!   pointers) followed by a dense array of fixed-width module records;
//! - the **extension** arena: variable-length data (strings, subscription
//!   arrays, connection state) addressed by base-relative offsets, with a
//!   wasted-bytes counter reclaimed only by defragmentation.
//!
//! The layout is host-endian-independent on the wire (everything is
//! little-endian) but host-local in spirit: regions are meant to be shared
//! between processes on one machine, coordinated by the two-level locking
//! protocol in [`ShmConn::lock`] and repaired after crashes by the PID
//! liveness sweep.

pub mod arena;
pub mod conn;
mod conns;
mod defrag;
pub mod layout;
pub mod lock;
pub mod print;
pub mod recover;
pub mod region;
pub mod registry;
mod subs;

pub use arena::Arena;
pub use conn::ShmConn;
pub use lock::MAIN_LOCK_TIMEOUT;
pub use print::Span;
pub use recover::{NoHooks, RecoveryHooks};
pub use region::{process_alive, CreateLock, ShmFile};
pub use registry::{DepSpec, ModuleSpec, OpDepSpec};
