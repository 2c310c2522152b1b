//! The session manager: every active session indexed by id, every
//! connection indexed by file descriptor.
//!
//! Session ids come from the main-region monotonic counter through the
//! [`SessionIds`] seam so they stay unique across every process attached to
//! the same repository. One coarse mutex guards both indices; the call rate
//! is far below contention concerns.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use silo_error::{Result, SiloError};
use silo_types::SessionId;
use tracing::debug;

use crate::pool::RpSession;

/// Source of unique session ids (the main-region header counter in
/// production, a local counter in tests).
pub trait SessionIds: Send + Sync {
    /// Draw the next unique session id.
    fn next_session_id(&self) -> Result<SessionId>;
}

/// Connection type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// The peer is a unix-domain socket client.
    UnixClient,
    /// The peer is a unix-domain socket server.
    UnixServer,
}

/// A growable byte buffer with a write cursor, one each for the receive and
/// send directions of a connection.
#[derive(Debug, Default)]
pub struct ByteBuf {
    data: Vec<u8>,
    pos: usize,
}

impl ByteBuf {
    /// Append bytes at the cursor.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.truncate(self.pos);
        self.data.extend_from_slice(bytes);
        self.pos = self.data.len();
    }

    /// The buffered bytes.
    #[must_use]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.pos]
    }

    /// Drop the first `n` bytes (they were processed or sent).
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.pos);
        self.data.drain(..n);
        self.pos -= n;
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }
}

/// Buffers of one connection.
#[derive(Debug, Default)]
pub struct ConnBuffers {
    /// Partially received request data.
    pub inbuf: ByteBuf,
    /// Response data waiting for the receiver to become ready.
    pub outbuf: ByteBuf,
}

/// One transport connection; multiple sessions may share it.
pub struct Connection {
    kind: ConnectionKind,
    fd: i32,
    /// Receive/send buffers.
    pub buffers: Mutex<ConnBuffers>,
    sessions: Mutex<Vec<Arc<Session>>>,
}

impl Connection {
    /// Connection type.
    #[must_use]
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// The transport file descriptor.
    #[must_use]
    pub fn fd(&self) -> i32 {
        self.fd
    }

    /// Sessions currently attached to this connection.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().clone()
    }
}

/// One active session.
pub struct Session {
    id: SessionId,
    connection: Arc<Connection>,
    real_user: String,
    effective_user: Option<String>,
    /// Request-processor data, opaque to the session manager.
    rp_data: OnceLock<Arc<RpSession>>,
}

impl Session {
    /// The unique session id.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The owning connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Real username of the peer.
    #[must_use]
    pub fn real_user(&self) -> &str {
        &self.real_user
    }

    /// Effective username, when different from the real one.
    #[must_use]
    pub fn effective_user(&self) -> Option<&str> {
        self.effective_user.as_deref()
    }

    /// Attach the request-processor context; done once right after
    /// creation.
    pub fn set_rp_data(&self, rp: Arc<RpSession>) {
        let _ = self.rp_data.set(rp);
    }

    /// The request-processor context, if attached.
    #[must_use]
    pub fn rp_data(&self) -> Option<&Arc<RpSession>> {
        self.rp_data.get()
    }
}

/// The session manager.
pub struct SessionManager {
    ids: Arc<dyn SessionIds>,
    inner: Mutex<Indices>,
}

#[derive(Default)]
struct Indices {
    by_id: HashMap<u64, Arc<Session>>,
    by_fd: HashMap<i32, Arc<Connection>>,
}

impl SessionManager {
    /// Create a session manager drawing ids from `ids`.
    #[must_use]
    pub fn new(ids: Arc<dyn SessionIds>) -> Self {
        Self {
            ids,
            inner: Mutex::new(Indices::default()),
        }
    }

    /// Create a connection context for a transport descriptor.
    pub fn connection_start(&self, kind: ConnectionKind, fd: i32) -> Result<Arc<Connection>> {
        let conn = Arc::new(Connection {
            kind,
            fd,
            buffers: Mutex::new(ConnBuffers::default()),
            sessions: Mutex::new(Vec::new()),
        });
        let mut inner = self.inner.lock();
        if inner.by_fd.contains_key(&fd) {
            return Err(SiloError::internal(format!(
                "connection for fd {fd} already exists"
            )));
        }
        inner.by_fd.insert(fd, Arc::clone(&conn));
        debug!(fd, ?kind, "connection started");
        Ok(conn)
    }

    /// Destroy a connection context; all its sessions are dropped.
    pub fn connection_stop(&self, conn: &Arc<Connection>) -> Result<()> {
        let sessions = {
            let mut inner = self.inner.lock();
            inner
                .by_fd
                .remove(&conn.fd)
                .ok_or(SiloError::ConnectionNotFound { fd: conn.fd })?;
            conn.sessions.lock().drain(..).collect::<Vec<_>>()
        };
        for session in &sessions {
            let mut inner = self.inner.lock();
            inner.by_id.remove(&session.id.get());
        }
        debug!(fd = conn.fd, dropped = sessions.len(), "connection stopped");
        Ok(())
    }

    /// Create a session on `conn` with a freshly assigned unique id.
    pub fn session_create(
        &self,
        conn: &Arc<Connection>,
        real_user: &str,
        effective_user: Option<&str>,
    ) -> Result<Arc<Session>> {
        let id = self.ids.next_session_id()?;
        let session = Arc::new(Session {
            id,
            connection: Arc::clone(conn),
            real_user: real_user.to_owned(),
            effective_user: effective_user.map(str::to_owned),
            rp_data: OnceLock::new(),
        });

        let mut inner = self.inner.lock();
        inner.by_id.insert(id.get(), Arc::clone(&session));
        conn.sessions.lock().push(Arc::clone(&session));
        debug!(session = %id, fd = conn.fd, "session created");
        Ok(session)
    }

    /// Drop a session: remove it from the indices and its connection.
    pub fn session_drop(&self, session: &Arc<Session>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .by_id
            .remove(&session.id.get())
            .ok_or(SiloError::SessionNotFound {
                id: session.id.get(),
            })?;
        session
            .connection
            .sessions
            .lock()
            .retain(|s| s.id != session.id);
        debug!(session = %session.id, "session dropped");
        Ok(())
    }

    /// Find a session by id.
    pub fn session_find_id(&self, id: SessionId) -> Result<Arc<Session>> {
        self.inner
            .lock()
            .by_id
            .get(&id.get())
            .cloned()
            .ok_or(SiloError::SessionNotFound { id: id.get() })
    }

    /// Find a connection by its file descriptor.
    pub fn connection_find_fd(&self, fd: i32) -> Result<Arc<Connection>> {
        self.inner
            .lock()
            .by_fd
            .get(&fd)
            .cloned()
            .ok_or(SiloError::ConnectionNotFound { fd })
    }
}
