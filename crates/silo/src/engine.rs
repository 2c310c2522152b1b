//! Wiring of the in-process engine over one repository connection: the
//! session manager draws ids from the shared header counter, and requests
//! flow through the request-processor pool to the storage collaborator.

use std::fs::File;
use std::sync::Arc;

use silo_engine::{
    Connection, ConnectionKind, DataStore, Msg, RequestProcessor, ResponseSink, Session,
    SessionIds, SessionManager,
};
use silo_error::{Result, SiloError};
use silo_types::{Datastore, SessionId};

use crate::conn::SiloConn;

/// Session-id allocator backed by the main-region header counter.
struct ShmIds {
    main: File,
}

impl SessionIds for ShmIds {
    fn next_session_id(&self) -> Result<SessionId> {
        silo_shm::lock::alloc_session_id_file(&self.main)
    }
}

/// The running engine: session manager plus request-processor pool.
pub struct Engine {
    sessions: SessionManager,
    processor: RequestProcessor,
}

impl Engine {
    /// Start the engine over an open repository connection.
    pub fn start(
        conn: &SiloConn,
        store: Arc<dyn DataStore>,
        sink: Arc<dyn ResponseSink>,
    ) -> Result<Self> {
        let ids = Arc::new(ShmIds {
            main: conn.shm().main().try_clone_file()?,
        });
        Ok(Self {
            sessions: SessionManager::new(ids),
            processor: RequestProcessor::new(store, sink)?,
        })
    }

    /// The session manager.
    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Register a transport connection.
    pub fn connection_start(&self, kind: ConnectionKind, fd: i32) -> Result<Arc<Connection>> {
        self.sessions.connection_start(kind, fd)
    }

    /// Tear down a transport connection; every session on it stops (with
    /// deferred cleanup for any that still has messages in flight).
    pub fn connection_stop(&self, conn: &Arc<Connection>) -> Result<()> {
        for session in conn.sessions() {
            if let Some(rp) = session.rp_data() {
                self.processor.session_stop(rp);
            }
        }
        self.sessions.connection_stop(conn)
    }

    /// Open a session on a connection: assign a unique id and bind the
    /// request-processor context.
    pub fn session_open(
        &self,
        conn: &Arc<Connection>,
        real_user: &str,
        effective_user: Option<&str>,
        datastore: Datastore,
    ) -> Result<Arc<Session>> {
        let session = self.sessions.session_create(conn, real_user, effective_user)?;
        let rp = self.processor.session_start(session.id(), datastore)?;
        session.set_rp_data(rp);
        Ok(session)
    }

    /// Close a session: stop its request-processor side (deferring cleanup
    /// while messages are in flight) and drop it from the indices.
    pub fn session_close(&self, session: &Arc<Session>) -> Result<()> {
        if let Some(rp) = session.rp_data() {
            self.processor.session_stop(rp);
        }
        self.sessions.session_drop(session)
    }

    /// Submit one message on a session.
    pub fn submit(&self, session: &Arc<Session>, msg: Msg) -> Result<()> {
        let rp = session
            .rp_data()
            .ok_or_else(|| SiloError::internal("session has no request-processor context"))?;
        self.processor.process(rp, msg)
    }

    /// Shut the engine down, joining the worker pool.
    pub fn shutdown(mut self) {
        self.processor.shutdown();
    }
}
