//! The arena-resident connection-state table.
//!
//! One record per attached process, keyed by `(conn_id, pid)`: the
//! event-pipe identifiers the connection's subscriptions use, and the
//! held-lock descriptor consulted by crash recovery. The array relocates to
//! the arena tail on every append; removal swaps the last record into the
//! hole.

use silo_error::{Result, SiloError};
use silo_types::encoding::{get_u32_at, get_u64_at, put_u32_at, put_u64_at};
use silo_types::{ConnId, EvpipeId, LockKind};
use tracing::debug;

use crate::conn::ShmConn;
use crate::layout::{connstate, hdr, EVPIPE_ENTRY_SIZE};
use crate::region::{file_write_u32, header_guard};

impl ShmConn {
    /// Number of connection-state records.
    #[must_use]
    pub fn conn_state_count(&self) -> usize {
        get_u32_at(self.main.bytes(), hdr::CONN_COUNT) as usize
    }

    /// Arena offset of the connection-state record at `idx`.
    pub(crate) fn conn_state_offset(&self, idx: usize) -> usize {
        get_u64_at(self.main.bytes(), hdr::CONNS) as usize + idx * connstate::SIZE
    }

    /// Append a connection-state record for this handle.
    ///
    /// The whole array relocates to the tail; the displaced bytes are added
    /// to the wasted tally. The new record starts with no event pipes and no
    /// held lock.
    pub fn conn_state_add(&mut self) -> Result<()> {
        let count = self.conn_state_count();
        let old = get_u64_at(self.main.bytes(), hdr::CONNS);

        let arr = self.ext.alloc((count + 1) * connstate::SIZE)?;
        self.ext.add_wasted((count * connstate::SIZE) as u64);
        if count > 0 {
            self.ext.bytes_mut().copy_within(
                old as usize..old as usize + count * connstate::SIZE,
                arr as usize,
            );
        }

        let rec = arr as usize + count * connstate::SIZE;
        let conn_id = self.conn_id.get();
        let pid = self.pid;
        let buf = self.ext.bytes_mut();
        buf[rec..rec + connstate::SIZE].fill(0);
        put_u64_at(buf, rec + connstate::CONN_ID, conn_id);
        put_u32_at(buf, rec + connstate::PID, pid);

        let main = self.main.bytes_mut();
        put_u64_at(main, hdr::CONNS, arr);
        put_u32_at(main, hdr::CONN_COUNT, (count + 1) as u32);
        debug!(conn = %self.conn_id, pid, "connection state added");
        Ok(())
    }

    /// Linear scan for the record with the given `(conn_id, pid)` pair.
    /// Returns the record's arena offset.
    #[must_use]
    pub fn conn_state_find(&self, conn_id: ConnId, pid: u32) -> Option<usize> {
        (0..self.conn_state_count()).map(|i| self.conn_state_offset(i)).find(|&rec| {
            get_u64_at(self.ext.bytes(), rec + connstate::CONN_ID) == conn_id.get()
                && get_u32_at(self.ext.bytes(), rec + connstate::PID) == pid
        })
    }

    /// The record for this handle.
    pub(crate) fn own_conn_state(&self) -> Result<usize> {
        self.conn_state_find(self.conn_id, self.pid)
            .ok_or(SiloError::StaleConnection { pid: self.pid })
    }

    /// Remove the record with the given `(conn_id, pid)` pair, wasting its
    /// event-pipe array and its own bytes; the last record swaps into the
    /// hole.
    pub fn conn_state_del(&mut self, conn_id: ConnId, pid: u32) -> Result<()> {
        let rec = self
            .conn_state_find(conn_id, pid)
            .ok_or(SiloError::StaleConnection { pid })?;
        self.conn_state_del_at(rec)
    }

    /// Remove the record at arena offset `rec`.
    pub(crate) fn conn_state_del_at(&mut self, rec: usize) -> Result<()> {
        let count = self.conn_state_count();
        let arr = get_u64_at(self.main.bytes(), hdr::CONNS) as usize;
        debug_assert!(rec >= arr && (rec - arr) % connstate::SIZE == 0);

        let evpipe_count = get_u32_at(self.ext.bytes(), rec + connstate::EVPIPE_COUNT);
        self.ext.add_wasted(
            (evpipe_count as usize * EVPIPE_ENTRY_SIZE + connstate::SIZE) as u64,
        );

        let count = count - 1;
        if count == 0 {
            // The only connection removed.
            put_u64_at(self.main.bytes_mut(), hdr::CONNS, 0);
        } else if rec < arr + count * connstate::SIZE {
            // Replace the deleted connection with the last one.
            let last = arr + count * connstate::SIZE;
            self.ext
                .bytes_mut()
                .copy_within(last..last + connstate::SIZE, rec);
        }
        put_u32_at(self.main.bytes_mut(), hdr::CONN_COUNT, count as u32);
        Ok(())
    }

    /// Register an event pipe on this handle's connection-state record.
    ///
    /// The per-connection event-pipe array relocates to the tail, exactly
    /// like the connection array itself.
    pub fn evpipe_add(&mut self, evpipe: EvpipeId) -> Result<()> {
        let rec = self.own_conn_state()?;
        let old = get_u64_at(self.ext.bytes(), rec + connstate::EVPIPES);
        let count = get_u32_at(self.ext.bytes(), rec + connstate::EVPIPE_COUNT) as usize;

        let arr = self.ext.alloc((count + 1) * EVPIPE_ENTRY_SIZE)?;
        self.ext.add_wasted((count * EVPIPE_ENTRY_SIZE) as u64);
        if count > 0 {
            self.ext.bytes_mut().copy_within(
                old as usize..old as usize + count * EVPIPE_ENTRY_SIZE,
                arr as usize,
            );
        }

        let buf = self.ext.bytes_mut();
        put_u32_at(buf, arr as usize + count * EVPIPE_ENTRY_SIZE, evpipe.get());
        put_u64_at(buf, rec + connstate::EVPIPES, arr);
        put_u32_at(buf, rec + connstate::EVPIPE_COUNT, (count + 1) as u32);
        Ok(())
    }

    /// Remove an event pipe from this handle's record. Fails with a
    /// lookup miss if the id is absent.
    pub fn evpipe_del(&mut self, evpipe: EvpipeId) -> Result<()> {
        let rec = self.own_conn_state()?;
        let arr = get_u64_at(self.ext.bytes(), rec + connstate::EVPIPES) as usize;
        let count = get_u32_at(self.ext.bytes(), rec + connstate::EVPIPE_COUNT) as usize;

        let idx = (0..count)
            .find(|&i| {
                get_u32_at(self.ext.bytes(), arr + i * EVPIPE_ENTRY_SIZE) == evpipe.get()
            })
            .ok_or(SiloError::EvpipeNotFound { id: evpipe.get() })?;

        self.ext.add_wasted(EVPIPE_ENTRY_SIZE as u64);

        let count = count - 1;
        let buf = self.ext.bytes_mut();
        if count == 0 {
            // The only event pipe removed.
            put_u64_at(buf, rec + connstate::EVPIPES, 0);
        } else if idx < count {
            // Replace the deleted id with the last one.
            let last = get_u32_at(buf, arr + count * EVPIPE_ENTRY_SIZE);
            put_u32_at(buf, arr + idx * EVPIPE_ENTRY_SIZE, last);
        }
        put_u32_at(buf, rec + connstate::EVPIPE_COUNT, count as u32);
        Ok(())
    }

    /// Event-pipe ids registered on the record at arena offset `rec`.
    pub(crate) fn conn_state_evpipes(&self, rec: usize) -> Vec<u32> {
        let arr = get_u64_at(self.ext.bytes(), rec + connstate::EVPIPES) as usize;
        let count = get_u32_at(self.ext.bytes(), rec + connstate::EVPIPE_COUNT) as usize;
        (0..count)
            .map(|i| get_u32_at(self.ext.bytes(), arr + i * EVPIPE_ENTRY_SIZE))
            .collect()
    }

    /// The held-lock descriptor of this handle's record.
    pub fn held_lock(&self) -> Result<(LockKind, u32)> {
        let rec = self.own_conn_state()?;
        let kind_raw = get_u32_at(self.ext.bytes(), rec + connstate::LOCK_KIND);
        let kind = LockKind::from_u32(kind_raw)
            .ok_or_else(|| SiloError::internal(format!("invalid held-lock kind {kind_raw}")))?;
        Ok((kind, get_u32_at(self.ext.bytes(), rec + connstate::LOCK_RCOUNT)))
    }

    /// Update this handle's held-lock descriptor.
    ///
    /// The descriptor is shared state mutated while only a read lock is
    /// held, so the write goes directly to the backing file under the guard
    /// byte (the record offset is stable for as long as any main lock is
    /// held); the local image is kept in step.
    pub(crate) fn held_lock_update(&mut self, kind: LockKind, rcount: u32) -> Result<()> {
        let rec = self.own_conn_state()?;
        let guard = header_guard(self.ext.region().file())?;
        file_write_u32(
            self.ext.region().file(),
            (rec + connstate::LOCK_KIND) as u64,
            kind as u32,
        )?;
        file_write_u32(
            self.ext.region().file(),
            (rec + connstate::LOCK_RCOUNT) as u64,
            rcount,
        )?;
        drop(guard);
        let buf = self.ext.bytes_mut();
        put_u32_at(buf, rec + connstate::LOCK_KIND, kind as u32);
        put_u32_at(buf, rec + connstate::LOCK_RCOUNT, rcount);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testutil::temp_conn;
    use crate::layout::connstate;

    fn ev(id: u32) -> EvpipeId {
        EvpipeId::new(id).unwrap()
    }

    #[test]
    fn test_conn_add_find_remove() {
        let (_dir, mut conn) = temp_conn();
        conn.conn_state_add().unwrap();
        assert_eq!(conn.conn_state_count(), 1);

        let rec = conn.conn_state_find(conn.conn_id(), conn.pid()).unwrap();
        assert_eq!(
            get_u32_at(conn.arena().bytes(), rec + connstate::PID),
            conn.pid()
        );
        assert_eq!(conn.conn_state_evpipes(rec), Vec::<u32>::new());

        conn.conn_state_del(conn.conn_id(), conn.pid()).unwrap();
        assert_eq!(conn.conn_state_count(), 0);
        assert_eq!(get_u64_at(conn.main().bytes(), hdr::CONNS), 0);
        // The record and (empty) evpipe array became wasted bytes; the
        // relocation on add wasted nothing because the array was empty.
        assert_eq!(conn.arena().wasted(), connstate::SIZE as u64);
    }

    #[test]
    fn test_conn_add_relocates_array() {
        let (_dir, mut conn) = temp_conn();
        conn.conn_state_add().unwrap();
        let first = get_u64_at(conn.main().bytes(), hdr::CONNS);

        // A second attach of the same process: distinct conn_id.
        let saved_id = conn.conn_id;
        conn.conn_id = ConnId::new(saved_id.get() + 1000).unwrap();
        conn.conn_state_add().unwrap();
        conn.conn_id = saved_id;

        let second = get_u64_at(conn.main().bytes(), hdr::CONNS);
        assert_ne!(first, second);
        assert_eq!(conn.conn_state_count(), 2);
        assert_eq!(conn.arena().wasted(), connstate::SIZE as u64);
    }

    #[test]
    fn test_find_requires_matching_pid() {
        let (_dir, mut conn) = temp_conn();
        conn.conn_state_add().unwrap();
        assert!(conn.conn_state_find(conn.conn_id(), conn.pid()).is_some());
        assert!(conn.conn_state_find(conn.conn_id(), conn.pid() + 1).is_none());
    }

    #[test]
    fn test_evpipe_roundtrip_restores_record() {
        let (_dir, mut conn) = temp_conn();
        conn.conn_state_add().unwrap();

        let rec = conn.own_conn_state().unwrap();
        let before_evpipes = conn.conn_state_evpipes(rec);
        let wasted_before = conn.arena().wasted();

        conn.evpipe_add(ev(7)).unwrap();
        conn.evpipe_del(ev(7)).unwrap();

        let rec = conn.own_conn_state().unwrap();
        // Structural equality restored, with increased wasted bytes.
        assert_eq!(conn.conn_state_evpipes(rec), before_evpipes);
        assert_eq!(
            get_u64_at(conn.arena().bytes(), rec + connstate::EVPIPES),
            0
        );
        assert!(conn.arena().wasted() > wasted_before);
    }

    #[test]
    fn test_evpipe_del_missing() {
        let (_dir, mut conn) = temp_conn();
        conn.conn_state_add().unwrap();
        conn.evpipe_add(ev(3)).unwrap();
        assert!(matches!(
            conn.evpipe_del(ev(4)),
            Err(SiloError::EvpipeNotFound { id: 4 })
        ));
    }

    #[test]
    fn test_evpipe_swap_remove() {
        let (_dir, mut conn) = temp_conn();
        conn.conn_state_add().unwrap();
        for id in [1, 2, 3] {
            conn.evpipe_add(ev(id)).unwrap();
        }
        conn.evpipe_del(ev(1)).unwrap();

        let rec = conn.own_conn_state().unwrap();
        let mut ids = conn.conn_state_evpipes(rec);
        ids.sort_unstable();
        assert_eq!(ids, [2, 3]);
    }

    #[test]
    fn test_held_lock_descriptor_update() {
        let (_dir, mut conn) = temp_conn();
        conn.conn_state_add().unwrap();
        assert_eq!(conn.held_lock().unwrap(), (LockKind::None, 0));

        conn.held_lock_update(LockKind::Read, 2).unwrap();
        assert_eq!(conn.held_lock().unwrap(), (LockKind::Read, 2));

        // The update is durable in the backing file, not only the image.
        let rec = conn.own_conn_state().unwrap();
        conn.ext.region_mut().load().unwrap();
        assert_eq!(
            get_u32_at(conn.arena().bytes(), rec + connstate::LOCK_RCOUNT),
            2
        );

        conn.held_lock_update(LockKind::None, 0).unwrap();
        assert_eq!(conn.held_lock().unwrap(), (LockKind::None, 0));
    }

    #[test]
    fn test_missing_state_is_stale_connection() {
        let (_dir, conn) = temp_conn();
        assert!(matches!(
            conn.own_conn_state(),
            Err(SiloError::StaleConnection { .. })
        ));
    }
}
