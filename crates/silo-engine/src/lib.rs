//! In-process engine for the silo datastore: session management, the
//! request-processor worker pool, and typed message dispatch.
//!
//! The engine consumes two seams it does not implement: the storage
//! collaborator ([`DataStore`]/[`StoreSession`]) and the transport's send
//! primitive ([`ResponseSink`]). Session ids come from the shared-memory
//! header counter through [`SessionIds`].

pub mod dispatch;
pub mod pool;
pub mod session;
pub mod store;

pub use dispatch::{Msg, Operation, OutMsg, Request, Response, ResponseSink};
pub use pool::{RequestProcessor, RpSession, RP_THREAD_COUNT};
pub use session::{
    ByteBuf, ConnBuffers, Connection, ConnectionKind, Session, SessionIds, SessionManager,
};
pub use store::{DataStore, GetItemsOpts, MemStore, SchemaInfo, StoreSession, ValueEntry};
