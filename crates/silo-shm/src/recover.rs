//! Liveness recovery: cleanup after crashed peer processes.
//!
//! The sweep walks the connection-state table and, for every record whose
//! PID no longer maps to a live process, returns its held read depth to the
//! main reader counter, scrubs every subscription keyed by its event pipes,
//! hands its operational data to the storage collaborator for removal, and
//! drops the record itself. Sub-step failures are accumulated into one
//! compound report; the sweep never aborts early.

use silo_error::{Result, SiloError};
use silo_types::encoding::{get_u32_at, get_u64_at};
use silo_types::{ConnId, Datastore};
use tracing::warn;

use crate::conn::ShmConn;
use crate::layout::{self, connstate};
use crate::region::{file_read_u32, file_write_u32, header_guard, process_alive};

/// Storage-collaborator hooks consulted while recovering after a dead
/// process.
pub trait RecoveryHooks {
    /// A running-datastore change subscription disappeared, so the module's
    /// operational view changed.
    fn operational_changed(&mut self, module: &str) -> Result<()> {
        let _ = module;
        Ok(())
    }

    /// Remove any operational data stored by the dead connection.
    fn drop_operational_data(&mut self, conn_id: ConnId, pid: u32) -> Result<()> {
        let _ = (conn_id, pid);
        Ok(())
    }
}

/// The default no-op hooks.
pub struct NoHooks;

impl RecoveryHooks for NoHooks {}

impl ShmConn {
    /// Run the liveness sweep. Requires the write side of the main lock
    /// (or the recovery claim taken on lock timeout).
    pub fn state_recover(&mut self) -> Result<()> {
        let mut reports: Vec<String> = Vec::new();

        let mut i = 0;
        while i < self.conn_state_count() {
            let rec = self.conn_state_offset(i);
            let pid = get_u32_at(self.ext.bytes(), rec + connstate::PID);
            if process_alive(pid) {
                i += 1;
                continue;
            }

            warn!(pid, "cleaning up after a dead client process");
            let conn_id_raw = get_u64_at(self.ext.bytes(), rec + connstate::CONN_ID);

            // 1. Return held locks to the shared counters.
            let kind = get_u32_at(self.ext.bytes(), rec + connstate::LOCK_KIND);
            let depth = get_u32_at(self.ext.bytes(), rec + connstate::LOCK_RCOUNT);
            match kind {
                k if k == silo_types::LockKind::Read as u32 => {
                    if let Err(e) = self.return_read_depth(pid, depth, &mut reports) {
                        reports.push(e.to_string());
                    }
                }
                k if k == silo_types::LockKind::Write as u32 => {
                    // The guard byte is released by the kernel on process
                    // death; a write claim surviving its holder means the
                    // descriptor invariant is broken.
                    reports.push(format!("dead PID {pid} still recorded as write-lock holder"));
                }
                k if k == silo_types::LockKind::None as u32 => {}
                k => reports.push(format!("dead PID {pid} has invalid held-lock kind {k}")),
            }

            // 2. Scrub every subscription keyed by its event pipes.
            for evpipe in self.conn_state_evpipes(rec) {
                self.scrub_evpipe(evpipe, &mut reports);
            }

            // 3. Drop the connection's stored operational data.
            if let Some(conn_id) = ConnId::new(conn_id_raw) {
                if let Err(e) = self.hooks.drop_operational_data(conn_id, pid) {
                    reports.push(format!("operational data cleanup for PID {pid}: {e}"));
                }
            }

            // 4. Remove the record (swap-remove: do not advance).
            if let Err(e) = self.conn_state_del_at(rec) {
                reports.push(e.to_string());
                i += 1;
            }
        }

        if reports.is_empty() {
            Ok(())
        } else {
            Err(SiloError::Recovery { reports })
        }
    }

    /// Return a dead reader's recursion depth to the main reader counter.
    fn return_read_depth(
        &mut self,
        pid: u32,
        depth: u32,
        reports: &mut Vec<String>,
    ) -> Result<()> {
        let file = self.main.file();
        let guard = header_guard(file)?;
        let readers = file_read_u32(file, layout::hdr::MAIN_READERS as u64)?;
        if depth == 0 || readers < depth {
            reports.push(format!(
                "dead PID {pid} read depth {depth} disagrees with reader count {readers}"
            ));
            drop(guard);
            return Ok(());
        }
        file_write_u32(file, layout::hdr::MAIN_READERS as u64, readers - depth)?;
        drop(guard);
        Ok(())
    }

    /// Remove every subscription in the registry matching one event pipe:
    /// all change/operational/notification tables of every module, and
    /// every RPC subscription table (removing the RPC itself with its last
    /// subscription).
    fn scrub_evpipe(&mut self, evpipe: u32, reports: &mut Vec<String>) {
        for m in 0..self.module_count() {
            let base = layout::module_base(m);
            for ds in Datastore::ALL {
                match self.change_sub_del_evpipe(base, ds, evpipe) {
                    Ok(removed) => {
                        if removed && ds == Datastore::Running {
                            // The operational view of the module changed.
                            let name = self
                                .module_name_owned(base)
                                .unwrap_or_else(|_| String::from("?"));
                            if let Err(e) = self.hooks.operational_changed(&name) {
                                reports.push(format!(
                                    "operational update for module \"{name}\": {e}"
                                ));
                            }
                        }
                    }
                    Err(e) => reports.push(e.to_string()),
                }
            }
            if let Err(e) = self.oper_sub_del_evpipe(base, evpipe) {
                reports.push(e.to_string());
            }
            if let Err(e) = self.notif_sub_del_evpipe(base, evpipe) {
                reports.push(e.to_string());
            }
        }

        let mut r = 0;
        while r < self.rpc_count() {
            let rpc_off = self.rpc_offset(r);
            match self.rpc_sub_del_evpipe(rpc_off, evpipe) {
                Ok((_, true)) => {
                    // The last subscription went; remove the RPC itself.
                    // Swap-remove keeps the index in place.
                    if let Err(e) = self.del_rpc_record(rpc_off) {
                        reports.push(e.to_string());
                        r += 1;
                    }
                }
                Ok(_) => r += 1,
                Err(e) => {
                    reports.push(e.to_string());
                    r += 1;
                }
            }
        }
    }

    fn module_name_owned(&self, base: usize) -> Result<String> {
        let name_off = self.module_view(base).name();
        Ok(self.ext.str_at(name_off)?.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testutil::temp_conn;
    use crate::layout::hdr;
    use crate::registry::ModuleSpec;
    use silo_types::encoding::{put_u32_at, put_u64_at};
    use silo_types::{EvpipeId, LockKind, LockMode, SubOptions};
    use std::sync::{Arc, Mutex};

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    /// Forge a connection-state record owned by a dead process, holding a
    /// read lock of `depth` and the given event pipe.
    fn forge_dead_conn(conn: &mut ShmConn, pid: u32, depth: u32, evpipe: u32) {
        let saved = conn.conn_id;
        conn.conn_id = ConnId::new(saved.get() + 7777).unwrap();
        conn.conn_state_add().unwrap();
        conn.evpipe_add(EvpipeId::new(evpipe).unwrap()).unwrap();
        let rec = conn.own_conn_state().unwrap();
        let buf = conn.ext.bytes_mut();
        put_u32_at(buf, rec + connstate::PID, pid);
        if depth > 0 {
            put_u32_at(buf, rec + connstate::LOCK_KIND, LockKind::Read as u32);
            put_u32_at(buf, rec + connstate::LOCK_RCOUNT, depth);
        }
        conn.conn_id = saved;
        // Mirror the forged read depth in the shared counter.
        if depth > 0 {
            let readers =
                file_read_u32(conn.main().file(), hdr::MAIN_READERS as u64).unwrap();
            file_write_u32(conn.main().file(), hdr::MAIN_READERS as u64, readers + depth)
                .unwrap();
        }
        conn.ext.region().flush().unwrap();
    }

    #[test]
    fn test_sweep_removes_dead_connection_and_subs() {
        let (_dir, mut conn) = temp_conn();
        conn.add_modules(&[ModuleSpec::new("m1", "2024-01-01")])
            .unwrap();
        conn.conn_state_add().unwrap();

        let pid = dead_pid();
        forge_dead_conn(&mut conn, pid, 1, 7);
        // The dead connection had registered an operational subscription.
        conn.oper_sub_add("m1", "/m1:state", SubOptions::DEFAULT, EvpipeId::new(7).unwrap())
            .unwrap();

        assert_eq!(conn.conn_state_count(), 2);
        assert_eq!(conn.main_lock_readers().unwrap(), 1);

        conn.state_recover().unwrap();

        assert_eq!(conn.conn_state_count(), 1);
        assert!(conn.conn_state_find(conn.conn_id(), conn.pid()).is_some());
        assert_eq!(conn.main_lock_readers().unwrap(), 0);
        let base = conn.find_module("m1").unwrap().unwrap();
        assert_eq!(conn.module_view(base).oper_subs(), (0, 0));
    }

    #[test]
    fn test_sweep_removes_rpc_with_last_subscription() {
        let (_dir, mut conn) = temp_conn();
        conn.conn_state_add().unwrap();
        let rpc_off = conn.add_rpc("/m1:reset").unwrap();
        conn.rpc_sub_add(rpc_off, "/m1:reset", 0, SubOptions::DEFAULT, EvpipeId::new(9).unwrap())
            .unwrap();

        forge_dead_conn(&mut conn, dead_pid(), 0, 9);
        conn.state_recover().unwrap();

        assert_eq!(conn.rpc_count(), 0);
    }

    #[test]
    fn test_sweep_keeps_live_connections() {
        let (_dir, mut conn) = temp_conn();
        conn.conn_state_add().unwrap();
        conn.state_recover().unwrap();
        assert_eq!(conn.conn_state_count(), 1);
    }

    #[test]
    fn test_dead_write_holder_is_reported_not_fatal() {
        let (_dir, mut conn) = temp_conn();
        conn.conn_state_add().unwrap();

        let pid = dead_pid();
        let saved = conn.conn_id;
        conn.conn_id = ConnId::new(saved.get() + 4242).unwrap();
        conn.conn_state_add().unwrap();
        let rec = conn.own_conn_state().unwrap();
        let buf = conn.ext.bytes_mut();
        put_u32_at(buf, rec + connstate::PID, pid);
        put_u32_at(buf, rec + connstate::LOCK_KIND, LockKind::Write as u32);
        conn.conn_id = saved;

        let err = conn.state_recover().unwrap_err();
        match err {
            SiloError::Recovery { reports } => {
                assert_eq!(reports.len(), 1);
                assert!(reports[0].contains("write-lock holder"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The sweep still removed the dead record.
        assert_eq!(conn.conn_state_count(), 1);
    }

    #[test]
    fn test_hooks_called_for_running_changes_and_oper_data() {
        struct Record {
            modules: Arc<Mutex<Vec<String>>>,
            dropped: Arc<Mutex<Vec<u32>>>,
        }
        impl RecoveryHooks for Record {
            fn operational_changed(&mut self, module: &str) -> Result<()> {
                self.modules.lock().unwrap().push(module.to_owned());
                Ok(())
            }
            fn drop_operational_data(&mut self, _conn: ConnId, pid: u32) -> Result<()> {
                self.dropped.lock().unwrap().push(pid);
                Ok(())
            }
        }

        let (_dir, mut conn) = temp_conn();
        let modules = Arc::new(Mutex::new(Vec::new()));
        let dropped = Arc::new(Mutex::new(Vec::new()));
        conn.set_recovery_hooks(Box::new(Record {
            modules: Arc::clone(&modules),
            dropped: Arc::clone(&dropped),
        }));

        conn.add_modules(&[ModuleSpec::new("m1", "2024-01-01")])
            .unwrap();
        conn.conn_state_add().unwrap();
        conn.change_sub_add(
            "m1",
            Datastore::Running,
            None,
            0,
            SubOptions::DEFAULT,
            EvpipeId::new(5).unwrap(),
        )
        .unwrap();

        let pid = dead_pid();
        // Reassign the subscription's event pipe to a forged dead
        // connection.
        forge_dead_conn(&mut conn, pid, 0, 5);

        conn.state_recover().unwrap();
        assert_eq!(modules.lock().unwrap().as_slice(), ["m1"]);
        assert_eq!(dropped.lock().unwrap().as_slice(), [pid]);
    }

    #[test]
    fn test_scenario_dead_reader_swept_on_read_lock() {
        // Crash recovery end to end at the shm level: a dead peer held a
        // read lock and an operational subscription; the next lock(Read)
        // sweeps it and is granted.
        let (_dir, mut conn) = temp_conn();
        conn.lock(LockMode::WriteNoState, false, false).unwrap();
        conn.conn_state_add().unwrap();
        conn.add_modules(&[ModuleSpec::new("m1", "2024-01-01")])
            .unwrap();
        conn.unlock(LockMode::WriteNoState, false, false).unwrap();

        conn.lock(LockMode::Write, false, false).unwrap();
        conn.oper_sub_add("m1", "/m1:state", SubOptions::DEFAULT, EvpipeId::new(7).unwrap())
            .unwrap();
        let pid = dead_pid();
        forge_dead_conn(&mut conn, pid, 1, 7);
        conn.unlock(LockMode::Write, false, false).unwrap();
        assert_eq!(conn.main_lock_readers().unwrap(), 1);

        conn.lock(LockMode::Read, false, false).unwrap();
        // The sweep ran during acquisition: the dead reader's depth was
        // returned, its subscription and connection removed, and the new
        // read lock granted.
        assert_eq!(conn.main_lock_readers().unwrap(), 1);
        assert_eq!(conn.conn_state_count(), 1);
        let base = conn.find_module("m1").unwrap().unwrap();
        assert_eq!(conn.module_view(base).oper_subs(), (0, 0));
        conn.unlock(LockMode::Read, false, false).unwrap();
        assert_eq!(conn.main_lock_readers().unwrap(), 0);
    }
}
