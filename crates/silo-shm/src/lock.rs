//! Cross-region locking.
//!
//! Two inter-process lock records live in the main header: the remap guard
//! (read side for any arena access, write side only for defragmentation)
//! and the main registry lock with a reader counter. A third record is the
//! schema-models mutex. All three are plain counter/PID records mutated by
//! direct file RMW under the fcntl guard byte; the guard itself is robust
//! (kernel-released on process death), so a crashed process can never wedge
//! the record mutation path. Stale counter state left by a crashed process
//! is repaired by the liveness sweep.
//!
//! Locks are not fair, and acquisition is bounded by a timeout.

use std::fs::File;
use std::time::{Duration, Instant};

use silo_error::{Result, SiloError};
use silo_types::{Datastore, EvpipeId, LockKind, LockMode, SessionId};
use tracing::{debug, warn};

use crate::conn::ShmConn;
use crate::layout::{hdr, modrec};
use crate::region::{
    file_read_u32, file_read_u64, file_write_u32, file_write_u64, header_guard, own_pid,
    process_alive,
};

/// Bounded timeout for every shared-lock acquisition.
pub const MAIN_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry interval while an acquisition spins on a held lock.
const ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// A reader-count / writer-PID lock record at fixed file offsets.
#[derive(Clone, Copy)]
pub(crate) struct LockRec {
    readers: u64,
    writer: u64,
    what: &'static str,
}

pub(crate) const MAIN_LOCK: LockRec = LockRec {
    readers: hdr::MAIN_READERS as u64,
    writer: hdr::MAIN_WRITER as u64,
    what: "main",
};

pub(crate) const REMAP_LOCK: LockRec = LockRec {
    readers: hdr::REMAP_READERS as u64,
    writer: hdr::REMAP_WRITER as u64,
    what: "remap guard",
};

// ---------------------------------------------------------------------------
// Record-level primitives
// ---------------------------------------------------------------------------

/// One acquisition attempt under the guard byte.
fn rwlock_try(file: &File, rec: LockRec, write: bool) -> Result<bool> {
    let guard = header_guard(file)?;
    let writer = file_read_u32(file, rec.writer)?;
    let acquired = if write {
        let readers = file_read_u32(file, rec.readers)?;
        if writer == 0 && readers == 0 {
            file_write_u32(file, rec.writer, own_pid())?;
            true
        } else {
            false
        }
    } else if writer == 0 {
        let readers = file_read_u32(file, rec.readers)?;
        file_write_u32(file, rec.readers, readers + 1)?;
        true
    } else {
        false
    };
    drop(guard);
    Ok(acquired)
}

/// Acquire one side of a lock record, retrying until `timeout`.
pub(crate) fn rwlock_acquire(
    file: &File,
    rec: LockRec,
    write: bool,
    timeout: Duration,
) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if rwlock_try(file, rec, write)? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(ACQUIRE_RETRY_INTERVAL);
    }
}

/// Release one side of a lock record.
pub(crate) fn rwlock_release(file: &File, rec: LockRec, write: bool) -> Result<()> {
    let guard = header_guard(file)?;
    if write {
        let writer = file_read_u32(file, rec.writer)?;
        if writer != own_pid() {
            drop(guard);
            return Err(SiloError::internal(format!(
                "releasing {} write lock held by PID {writer}",
                rec.what
            )));
        }
        file_write_u32(file, rec.writer, 0)?;
    } else {
        let readers = file_read_u32(file, rec.readers)?;
        if readers == 0 {
            drop(guard);
            return Err(SiloError::internal(format!(
                "releasing unheld {} read lock",
                rec.what
            )));
        }
        file_write_u32(file, rec.readers, readers - 1)?;
    }
    drop(guard);
    Ok(())
}

/// Clear the writer slot when its recorded PID is dead. Returns whether a
/// reclamation happened.
pub(crate) fn rwlock_reclaim_dead_writer(file: &File, rec: LockRec) -> Result<bool> {
    let guard = header_guard(file)?;
    let writer = file_read_u32(file, rec.writer)?;
    let reclaimed = writer != 0 && !process_alive(writer);
    if reclaimed {
        warn!(lock = rec.what, pid = writer, "reclaiming lock from dead holder");
        file_write_u32(file, rec.writer, 0)?;
    }
    drop(guard);
    Ok(reclaimed)
}

/// Acquire a holder-PID mutex record, reclaiming it from a dead holder.
fn mutex_acquire(file: &File, offset: u64, timeout: Duration) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        {
            let guard = header_guard(file)?;
            let holder = file_read_u32(file, offset)?;
            if holder == 0 || !process_alive(holder) {
                if holder != 0 {
                    warn!(pid = holder, "reclaiming schema mutex from dead holder");
                }
                file_write_u32(file, offset, own_pid())?;
                drop(guard);
                return Ok(true);
            }
            drop(guard);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(ACQUIRE_RETRY_INTERVAL);
    }
}

/// Release a holder-PID mutex record.
fn mutex_release(file: &File, offset: u64) -> Result<()> {
    let guard = header_guard(file)?;
    let holder = file_read_u32(file, offset)?;
    if holder != own_pid() {
        drop(guard);
        return Err(SiloError::internal(format!(
            "releasing schema mutex held by PID {holder}"
        )));
    }
    file_write_u32(file, offset, 0)?;
    drop(guard);
    Ok(())
}

// ---------------------------------------------------------------------------
// Public locking sequences
// ---------------------------------------------------------------------------

impl ShmConn {
    /// Acquire the cross-region locks: remap guard (write side if `remap`),
    /// main lock in `mode`, and optionally the schema-models mutex; then
    /// refresh both images and record the held lock in this connection's
    /// descriptor. On any failure the already-acquired locks unwind in
    /// reverse order.
    ///
    /// Read locks are recursive; write locks forbid recursion.
    /// [`LockMode::WriteNoState`] skips the descriptor bookkeeping for the
    /// window before the connection-state record exists.
    pub fn lock(&mut self, mode: LockMode, remap: bool, schema: bool) -> Result<()> {
        self.lock_with_timeout(mode, remap, schema, MAIN_LOCK_TIMEOUT)
    }

    /// [`Self::lock`] with an explicit timeout (shortened by tests).
    pub fn lock_with_timeout(
        &mut self,
        mode: LockMode,
        remap: bool,
        schema: bool,
        timeout: Duration,
    ) -> Result<()> {
        // REMAP READ/WRITE LOCK
        if !rwlock_acquire(self.main.file(), REMAP_LOCK, remap, timeout)? {
            if !(rwlock_reclaim_dead_writer(self.main.file(), REMAP_LOCK)?
                && rwlock_acquire(self.main.file(), REMAP_LOCK, remap, timeout)?)
            {
                return Err(SiloError::LockTimeout {
                    what: "remap guard",
                });
            }
        }

        // MAIN SHM READ/WRITE LOCK
        if let Err(e) = self.main_lock_acquire(mode.is_write(), timeout) {
            let _ = rwlock_release(self.main.file(), REMAP_LOCK, remap);
            return Err(e);
        }

        // Refresh both images; nothing else can mutate them while the main
        // lock is held (the original remaps ext SHM at this point).
        if let Err(e) = self.reload() {
            let _ = rwlock_release(self.main.file(), MAIN_LOCK, mode.is_write());
            let _ = rwlock_release(self.main.file(), REMAP_LOCK, remap);
            return Err(e);
        }

        // Opportune liveness sweep: stale state left by crashed peers is
        // repaired before the caller observes it. On failure the main lock
        // has already been released.
        if let Err(e) = self.recover_if_needed(mode, timeout) {
            let _ = rwlock_release(self.main.file(), REMAP_LOCK, remap);
            return Err(e);
        }

        // SCHEMA MODELS LOCK
        if schema {
            match mutex_acquire(self.main.file(), hdr::SCHEMA_HOLDER as u64, timeout) {
                Ok(true) => {}
                Ok(false) => {
                    let _ = rwlock_release(self.main.file(), MAIN_LOCK, mode.is_write());
                    let _ = rwlock_release(self.main.file(), REMAP_LOCK, remap);
                    return Err(SiloError::LockTimeout { what: "schema" });
                }
                Err(e) => {
                    let _ = rwlock_release(self.main.file(), MAIN_LOCK, mode.is_write());
                    let _ = rwlock_release(self.main.file(), REMAP_LOCK, remap);
                    return Err(e);
                }
            }
        }

        // Record the held lock.
        if mode != LockMode::WriteNoState {
            if let Err(e) = self.held_lock_record(mode) {
                if schema {
                    let _ = mutex_release(self.main.file(), hdr::SCHEMA_HOLDER as u64);
                }
                let _ = rwlock_release(self.main.file(), MAIN_LOCK, mode.is_write());
                let _ = rwlock_release(self.main.file(), REMAP_LOCK, remap);
                return Err(e);
            }
        }

        debug!(?mode, remap, schema, "locked");
        Ok(())
    }

    /// Symmetric release. The write side flushes both images before the
    /// locks go.
    pub fn unlock(&mut self, mode: LockMode, remap: bool, schema: bool) -> Result<()> {
        if mode != LockMode::WriteNoState {
            if let Err(e) = self.held_lock_clear(mode) {
                // Bookkeeping failures must not leak the lock itself.
                warn!(error = %e, "held-lock descriptor update failed");
            }
        }

        if mode.is_write() {
            self.flush_all()?;
        }

        // MAIN SHM UNLOCK
        rwlock_release(self.main.file(), MAIN_LOCK, mode.is_write())?;
        // REMAP UNLOCK
        rwlock_release(self.main.file(), REMAP_LOCK, remap)?;
        // SCHEMA MODELS UNLOCK
        if schema {
            mutex_release(self.main.file(), hdr::SCHEMA_HOLDER as u64)?;
        }

        debug!(?mode, remap, schema, "unlocked");
        Ok(())
    }

    /// Main-lock acquisition with the timeout recovery path: a dead writer
    /// is reclaimed, the liveness sweep runs under a temporary write claim,
    /// and the acquisition is retried once.
    fn main_lock_acquire(&mut self, write: bool, timeout: Duration) -> Result<()> {
        if rwlock_acquire(self.main.file(), MAIN_LOCK, write, timeout)? {
            return Ok(());
        }

        warn!(write, "main lock timeout, probing holder liveness");
        let reclaimed = rwlock_reclaim_dead_writer(self.main.file(), MAIN_LOCK)?;
        let swept = self.recovery_claim_and_sweep()?;
        if !reclaimed && !swept {
            return Err(SiloError::LockTimeout { what: "main" });
        }

        if rwlock_acquire(self.main.file(), MAIN_LOCK, write, timeout)? {
            Ok(())
        } else {
            Err(SiloError::LockTimeout { what: "main" })
        }
    }

    /// Run the liveness sweep under a temporary write claim, repairing
    /// reader counts left behind by dead processes. Returns whether a sweep
    /// ran.
    fn recovery_claim_and_sweep(&mut self) -> Result<bool> {
        // Claim the writer slot even though stale readers may remain; the
        // sweep is what returns their depths.
        let claimed = {
            let file = self.main.file();
            let guard = header_guard(file)?;
            let writer = file_read_u32(file, MAIN_LOCK.writer)?;
            let claimed = writer == 0;
            if claimed {
                file_write_u32(file, MAIN_LOCK.writer, own_pid())?;
            }
            drop(guard);
            claimed
        };
        if !claimed {
            return Ok(false);
        }

        let swept: Result<bool> = (|| {
            self.reload()?;
            if !self.has_dead_connections() {
                return Ok(false);
            }
            if let Err(e) = self.state_recover() {
                warn!(error = %e, "liveness recovery reported sub-errors");
            }
            self.flush_all()?;
            Ok(true)
        })();
        let released = rwlock_release(self.main.file(), MAIN_LOCK, true);
        let swept = swept?;
        released?;
        Ok(swept)
    }

    /// After acquiring the main lock: if a crashed peer left state behind,
    /// repair it before proceeding. Read acquisitions temporarily upgrade
    /// to the write side for the sweep.
    ///
    /// On `Ok` the main lock is held in the requested mode; on `Err` it has
    /// been released (the caller only unwinds the remap guard).
    fn recover_if_needed(&mut self, mode: LockMode, timeout: Duration) -> Result<()> {
        if !self.has_dead_connections() {
            return Ok(());
        }

        if mode.is_write() {
            if let Err(e) = self.state_recover() {
                warn!(error = %e, "liveness recovery reported sub-errors");
            }
            if let Err(e) = self.flush_all() {
                let _ = rwlock_release(self.main.file(), MAIN_LOCK, true);
                return Err(e);
            }
            return Ok(());
        }

        // Release the read side and run the sweep under the recovery claim
        // (a normal write acquisition would block on the very reader counts
        // the sweep is about to repair), then downgrade back to read.
        rwlock_release(self.main.file(), MAIN_LOCK, false)?;
        self.recovery_claim_and_sweep()?;
        if !rwlock_acquire(self.main.file(), MAIN_LOCK, false, timeout)? {
            return Err(SiloError::LockTimeout { what: "main" });
        }
        if let Err(e) = self.reload() {
            let _ = rwlock_release(self.main.file(), MAIN_LOCK, false);
            return Err(e);
        }
        Ok(())
    }

    /// Whether any connection-state record belongs to a dead process.
    pub(crate) fn has_dead_connections(&self) -> bool {
        use crate::layout::connstate;
        use silo_types::encoding::get_u32_at;
        (0..self.conn_state_count()).any(|i| {
            let rec = self.conn_state_offset(i);
            !process_alive(get_u32_at(self.ext.bytes(), rec + connstate::PID))
        })
    }

    /// Record a freshly acquired lock in the connection descriptor.
    fn held_lock_record(&mut self, mode: LockMode) -> Result<()> {
        let (kind, depth) = self.held_lock()?;
        match mode {
            LockMode::Read => {
                // Recursive read locks are supported.
                if !(kind == LockKind::None && depth == 0
                    || kind == LockKind::Read && depth > 0)
                {
                    return Err(SiloError::internal(format!(
                        "read lock over inconsistent descriptor ({kind:?}, {depth})"
                    )));
                }
                self.held_lock_update(LockKind::Read, depth + 1)
            }
            LockMode::Write => {
                if kind != LockKind::None {
                    return Err(SiloError::internal(
                        "write lock recursion is not supported",
                    ));
                }
                self.held_lock_update(LockKind::Write, 0)
            }
            LockMode::WriteNoState => Ok(()),
        }
    }

    /// Clear (or decrement) the descriptor on release.
    fn held_lock_clear(&mut self, mode: LockMode) -> Result<()> {
        let (kind, depth) = self.held_lock()?;
        match mode {
            LockMode::Read => {
                if kind != LockKind::Read || depth == 0 {
                    return Err(SiloError::internal(format!(
                        "read unlock over inconsistent descriptor ({kind:?}, {depth})"
                    )));
                }
                if depth == 1 {
                    self.held_lock_update(LockKind::None, 0)
                } else {
                    self.held_lock_update(LockKind::Read, depth - 1)
                }
            }
            LockMode::Write => {
                if kind != LockKind::Write {
                    return Err(SiloError::internal(format!(
                        "write unlock over descriptor {kind:?}"
                    )));
                }
                self.held_lock_update(LockKind::None, 0)
            }
            LockMode::WriteNoState => Ok(()),
        }
    }

    /// Current main-lock reader count (test oracle for the descriptor
    /// agreement invariant).
    pub fn main_lock_readers(&self) -> Result<u32> {
        file_read_u32(self.main.file(), MAIN_LOCK.readers)
    }

    /// Current main-lock writer PID.
    pub fn main_lock_writer(&self) -> Result<u32> {
        file_read_u32(self.main.file(), MAIN_LOCK.writer)
    }

    // -----------------------------------------------------------------------
    // Header id counters
    // -----------------------------------------------------------------------

    /// Draw the next session id from the header counter.
    pub fn alloc_session_id(&self) -> Result<SessionId> {
        let raw = counter_fetch_add(self.main.file(), hdr::NEXT_SESSION_ID as u64)?;
        SessionId::new(raw).ok_or_else(|| SiloError::internal("session id counter corrupted"))
    }

    /// Draw the next event-pipe id from the header counter.
    pub fn alloc_evpipe_id(&self) -> Result<EvpipeId> {
        let raw = counter_fetch_add(self.main.file(), hdr::NEXT_EVPIPE_ID as u64)?;
        let raw = u32::try_from(raw)
            .map_err(|_| SiloError::internal("event-pipe id counter exhausted"))?;
        EvpipeId::new(raw).ok_or_else(|| SiloError::internal("event-pipe id counter corrupted"))
    }

    // -----------------------------------------------------------------------
    // Module data locks
    // -----------------------------------------------------------------------

    /// Lock one module's data on one datastore. The main lock must be held
    /// at least in read mode so module record offsets are stable.
    pub fn module_data_lock(
        &mut self,
        module: &str,
        ds: Datastore,
        write: bool,
        timeout: Duration,
    ) -> Result<()> {
        let rec = self.module_lock_rec(module, Some(ds))?;
        self.module_rwlock_acquire(rec, write, timeout)
    }

    /// Release one module's data lock.
    pub fn module_data_unlock(&mut self, module: &str, ds: Datastore, write: bool) -> Result<()> {
        let rec = self.module_lock_rec(module, Some(ds))?;
        rwlock_release(self.main.file(), rec, write)
    }

    /// Lock one module's notification replay state.
    pub fn module_replay_lock(
        &mut self,
        module: &str,
        write: bool,
        timeout: Duration,
    ) -> Result<()> {
        let rec = self.module_lock_rec(module, None)?;
        self.module_rwlock_acquire(rec, write, timeout)
    }

    /// Release one module's replay lock.
    pub fn module_replay_unlock(&mut self, module: &str, write: bool) -> Result<()> {
        let rec = self.module_lock_rec(module, None)?;
        rwlock_release(self.main.file(), rec, write)
    }

    fn module_lock_rec(&self, module: &str, ds: Option<Datastore>) -> Result<LockRec> {
        let base = self
            .find_module(module)?
            .ok_or_else(|| SiloError::module_not_found(module))?;
        let field = match ds {
            Some(ds) => modrec::DATA_LOCKS + ds.index() * modrec::DATA_LOCK_STRIDE,
            None => modrec::REPLAY_LOCK,
        };
        Ok(LockRec {
            readers: (base + field) as u64,
            writer: (base + field + 4) as u64,
            what: "module data",
        })
    }

    fn module_rwlock_acquire(&self, rec: LockRec, write: bool, timeout: Duration) -> Result<()> {
        if rwlock_acquire(self.main.file(), rec, write, timeout)? {
            return Ok(());
        }
        if rwlock_reclaim_dead_writer(self.main.file(), rec)?
            && rwlock_acquire(self.main.file(), rec, write, timeout)?
        {
            return Ok(());
        }
        Err(SiloError::LockTimeout {
            what: "module data",
        })
    }
}

/// Draw the next session id from a main-region file handle. For id
/// allocators that hold their own duplicated descriptor instead of the
/// [`ShmConn`].
pub fn alloc_session_id_file(file: &File) -> Result<SessionId> {
    let raw = counter_fetch_add(file, hdr::NEXT_SESSION_ID as u64)?;
    SessionId::new(raw).ok_or_else(|| SiloError::internal("session id counter corrupted"))
}

/// Post-increment a `u64` header counter under the guard byte.
fn counter_fetch_add(file: &File, offset: u64) -> Result<u64> {
    let guard = header_guard(file)?;
    let v = file_read_u64(file, offset)?;
    file_write_u64(file, offset, v + 1)?;
    drop(guard);
    Ok(v)
}
