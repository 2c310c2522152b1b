//! The per-process attach handle over the two shared regions.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use silo_error::{Result, SiloError};
use silo_types::ConnId;
use tracing::{debug, info};

use crate::arena::{Arena, WASTED_SIZE};
use crate::layout::{self, hdr, modrec};
use crate::recover::{NoHooks, RecoveryHooks};
use crate::region::ShmFile;

/// Process-local allocator for connection handles. Records in the arena are
/// keyed by `(conn_id, pid)`, so uniqueness within the process suffices.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// One process' attachment to the main and extension regions.
///
/// All registry, subscription, lock, recovery, and defragmentation
/// operations hang off this handle; they live in their respective modules.
pub struct ShmConn {
    pub(crate) conn_id: ConnId,
    pub(crate) pid: u32,
    pub(crate) main: ShmFile,
    pub(crate) ext: Arena,
    pub(crate) hooks: Box<dyn RecoveryHooks + Send>,
}

impl ShmConn {
    /// Attach to (or create) the shared regions.
    ///
    /// Must be called under the repository create-lock so one-time header
    /// initialization cannot race. Returns the handle and whether the main
    /// region was created by this call.
    pub fn attach(main_path: &Path, ext_path: &Path, perm: u32) -> Result<(Self, bool)> {
        let (mut main, created) = ShmFile::open(main_path, hdr::HEADER_SIZE, perm)?;
        if created {
            layout::init_main_header(main.bytes_mut());
            main.flush()?;
            info!(path = %main_path.display(), "main region created");
        }
        layout::check_main_header(main.bytes())?;

        let (mut ext, ext_created) = ShmFile::open(ext_path, WASTED_SIZE, perm)?;
        if created && !ext_created {
            // Fresh main region next to a stale extension file: zero it so
            // the wasted counter starts from scratch.
            ext.remap(WASTED_SIZE)?;
            ext.bytes_mut().fill(0);
            ext.flush()?;
        }

        let conn_id = ConnId::new(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
            .ok_or_else(|| SiloError::internal("connection id counter wrapped"))?;
        debug!(%conn_id, created, "attached to shared regions");

        Ok((
            Self {
                conn_id,
                pid: crate::region::own_pid(),
                main,
                ext: Arena::new(ext),
                hooks: Box::new(NoHooks),
            },
            created,
        ))
    }

    /// This handle's connection id.
    #[must_use]
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// The PID recorded in this handle's connection-state record.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The main region handle.
    #[must_use]
    pub fn main(&self) -> &ShmFile {
        &self.main
    }

    /// The extension arena.
    #[must_use]
    pub fn arena(&self) -> &Arena {
        &self.ext
    }

    /// Install the storage-collaborator hooks consulted by liveness
    /// recovery.
    pub fn set_recovery_hooks(&mut self, hooks: Box<dyn RecoveryHooks + Send>) {
        self.hooks = hooks;
    }

    /// Number of module records currently in the main region.
    #[must_use]
    pub fn module_count(&self) -> usize {
        layout::module_count(self.main.size())
    }

    /// Volatile byte ranges of the main region: the header lock/counter
    /// block plus every module record's lock fields. These are mutated by
    /// direct file RMW and must survive bulk flushes.
    pub(crate) fn main_volatile_ranges(&self) -> Vec<std::ops::Range<usize>> {
        let mut ranges = vec![hdr::VOLATILE_START..hdr::VOLATILE_END];
        for i in 0..self.module_count() {
            let base = layout::module_base(i);
            ranges.push(base + modrec::DATA_LOCKS..base + modrec::SIZE);
        }
        ranges
    }

    /// Flush the main image, preserving concurrently mutated volatile
    /// fields.
    pub(crate) fn flush_main(&mut self) -> Result<()> {
        let ranges = self.main_volatile_ranges();
        self.main.flush_with_syncback(&ranges)
    }

    /// Flush both images (write side of the main lock only).
    pub(crate) fn flush_all(&mut self) -> Result<()> {
        self.ext.region().flush()?;
        self.flush_main()
    }

    /// Reload both images from the backing files, discarding any
    /// uncommitted mutations.
    pub(crate) fn reload(&mut self) -> Result<()> {
        self.main.load()?;
        self.ext.region_mut().load()
    }

    /// Release both mappings and close the descriptors.
    pub fn clear(self) {
        drop(self);
    }
}

impl std::fmt::Debug for ShmConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmConn")
            .field("conn_id", &self.conn_id)
            .field("pid", &self.pid)
            .field("main_size", &self.main.size())
            .field("ext_size", &self.ext.size())
            .field("wasted", &self.ext.wasted())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Create a fresh attached pair in a temporary repository.
    pub fn temp_conn() -> (tempfile::TempDir, ShmConn) {
        let dir = tempfile::tempdir().expect("tempdir");
        let (conn, created) = ShmConn::attach(
            &dir.path().join("main.shm"),
            &dir.path().join("ext.shm"),
            0o600,
        )
        .expect("attach");
        assert!(created);
        (dir, conn)
    }

    /// Attach a second handle to the same repository.
    pub fn attach_again(dir: &tempfile::TempDir) -> ShmConn {
        let (conn, created) = ShmConn::attach(
            &dir.path().join("main.shm"),
            &dir.path().join("ext.shm"),
            0o600,
        )
        .expect("attach");
        assert!(!created);
        conn
    }
}
