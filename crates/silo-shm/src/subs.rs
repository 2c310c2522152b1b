//! Subscription tables: per-module change / operational / notification
//! subscriptions and per-RPC subscriptions.
//!
//! All four kinds share one shape: a growable arena array that relocates to
//! the tail on append and swap-removes on delete, with wasted-bytes
//! accounting. Change subscriptions are keyed by `(xpath, priority)` for
//! targeted removal; every kind also supports removal of all entries
//! matching an event-pipe id, the crash-recovery mode.

use silo_error::{Result, SiloError};
use silo_types::encoding::{get_u16_at, get_u32_at, get_u64_at, put_u16_at, put_u32_at, put_u64_at};
use silo_types::{Datastore, EvpipeId, SubOptions};
use tracing::debug;

use crate::conn::ShmConn;
use crate::layout::{
    change_subs_field, changesub, modrec, notifsub, opersub, rpc, rpcsub,
};

impl ShmConn {
    /// Relocate a subscription array to the tail with room for one more
    /// item; the displaced bytes become wasted. Returns the new array
    /// offset.
    fn sub_array_grow(&mut self, old: u64, count: usize, item_size: usize) -> Result<u64> {
        let arr = self.ext.alloc((count + 1) * item_size)?;
        self.ext.add_wasted((count * item_size) as u64);
        if count > 0 {
            self.ext.bytes_mut().copy_within(
                old as usize..old as usize + count * item_size,
                arr as usize,
            );
        }
        Ok(arr)
    }

    /// Swap the last item of an array into slot `idx`.
    fn sub_array_swap(&mut self, arr: usize, new_count: usize, item_size: usize, idx: usize) {
        if idx < new_count {
            let last = arr + new_count * item_size;
            self.ext
                .bytes_mut()
                .copy_within(last..last + item_size, arr + idx * item_size);
        }
    }

    // -----------------------------------------------------------------------
    // Change subscriptions (per datastore)
    // -----------------------------------------------------------------------

    /// Add a change subscription to `module` on `ds`. A `None` xpath
    /// subscribes to the whole module.
    pub fn change_sub_add(
        &mut self,
        module: &str,
        ds: Datastore,
        xpath: Option<&str>,
        priority: u32,
        opts: SubOptions,
        evpipe: EvpipeId,
    ) -> Result<()> {
        let base = self
            .find_module(module)?
            .ok_or_else(|| SiloError::module_not_found(module))?;
        let (subs, count) = self.module_view(base).change_subs(ds);
        let arr = self.sub_array_grow(subs, count as usize, changesub::SIZE)?;

        let xpath_off = match xpath {
            Some(x) => self.ext.put_string(x)?,
            None => 0,
        };
        let rec = arr as usize + count as usize * changesub::SIZE;
        let buf = self.ext.bytes_mut();
        put_u64_at(buf, rec + changesub::XPATH, xpath_off);
        put_u32_at(buf, rec + changesub::PRIORITY, priority);
        put_u32_at(buf, rec + changesub::OPTS, opts.0);
        put_u32_at(buf, rec + changesub::EVPIPE, evpipe.get());

        let (subs_f, count_f) = change_subs_field(ds);
        let main = self.main.bytes_mut();
        put_u64_at(main, base + subs_f, arr);
        put_u16_at(main, base + count_f, count + 1);
        debug!(module, %ds, priority, "change subscription added");
        Ok(())
    }

    /// Remove the change subscription keyed by `(xpath, priority)`.
    pub fn change_sub_del(
        &mut self,
        module: &str,
        ds: Datastore,
        xpath: Option<&str>,
        priority: u32,
    ) -> Result<()> {
        let base = self
            .find_module(module)?
            .ok_or_else(|| SiloError::module_not_found(module))?;
        let (subs, count) = self.module_view(base).change_subs(ds);

        let mut found = None;
        for i in 0..count as usize {
            let rec = subs as usize + i * changesub::SIZE;
            let rec_xpath = get_u64_at(self.ext.bytes(), rec + changesub::XPATH);
            let rec_prio = get_u32_at(self.ext.bytes(), rec + changesub::PRIORITY);
            let xpath_matches = match xpath {
                None => rec_xpath == 0,
                Some(x) => rec_xpath != 0 && self.ext.str_at(rec_xpath)? == x,
            };
            if xpath_matches && rec_prio == priority {
                found = Some(i);
                break;
            }
        }
        let idx = found.ok_or_else(|| SiloError::SubscriptionNotFound {
            key: format!("{module}:{ds} ({}, {priority})", xpath.unwrap_or("*")),
        })?;

        self.change_sub_del_idx(base, ds, subs as usize, count as usize, idx)
    }

    /// Remove every change subscription of `module` on `ds` matching an
    /// event-pipe id. Returns whether anything was removed.
    pub fn change_sub_del_evpipe(
        &mut self,
        module_base: usize,
        ds: Datastore,
        evpipe: u32,
    ) -> Result<bool> {
        let mut removed = false;
        loop {
            let (subs, count) = self.module_view(module_base).change_subs(ds);
            let hit = (0..count as usize).find(|&i| {
                let rec = subs as usize + i * changesub::SIZE;
                get_u32_at(self.ext.bytes(), rec + changesub::EVPIPE) == evpipe
            });
            match hit {
                Some(idx) => {
                    self.change_sub_del_idx(module_base, ds, subs as usize, count as usize, idx)?;
                    removed = true;
                }
                None => return Ok(removed),
            }
        }
    }

    fn change_sub_del_idx(
        &mut self,
        base: usize,
        ds: Datastore,
        subs: usize,
        count: usize,
        idx: usize,
    ) -> Result<()> {
        let rec = subs + idx * changesub::SIZE;
        let xpath = get_u64_at(self.ext.bytes(), rec + changesub::XPATH);
        let mut freed = changesub::SIZE as u64;
        if xpath != 0 {
            freed += self.ext.strlen_at(xpath)? as u64;
        }
        self.ext.add_wasted(freed);

        let count = count - 1;
        self.sub_array_swap(subs, count, changesub::SIZE, idx);
        let (subs_f, count_f) = change_subs_field(ds);
        let main = self.main.bytes_mut();
        if count == 0 {
            put_u64_at(main, base + subs_f, 0);
        }
        put_u16_at(main, base + count_f, count as u16);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Operational subscriptions
    // -----------------------------------------------------------------------

    /// Add an operational subscription to `module`. The xpath is mandatory.
    pub fn oper_sub_add(
        &mut self,
        module: &str,
        xpath: &str,
        opts: SubOptions,
        evpipe: EvpipeId,
    ) -> Result<()> {
        let base = self
            .find_module(module)?
            .ok_or_else(|| SiloError::module_not_found(module))?;
        let (subs, count) = self.module_view(base).oper_subs();
        let arr = self.sub_array_grow(subs, count as usize, opersub::SIZE)?;

        let xpath_off = self.ext.put_string(xpath)?;
        let rec = arr as usize + count as usize * opersub::SIZE;
        let buf = self.ext.bytes_mut();
        put_u64_at(buf, rec + opersub::XPATH, xpath_off);
        put_u32_at(buf, rec + opersub::OPTS, opts.0);
        put_u32_at(buf, rec + opersub::EVPIPE, evpipe.get());

        let main = self.main.bytes_mut();
        put_u64_at(main, base + modrec::OPER_SUBS, arr);
        put_u16_at(main, base + modrec::OPER_SUB_COUNT, count + 1);
        debug!(module, xpath, "operational subscription added");
        Ok(())
    }

    /// Remove the operational subscription with the given xpath.
    pub fn oper_sub_del(&mut self, module: &str, xpath: &str) -> Result<()> {
        let base = self
            .find_module(module)?
            .ok_or_else(|| SiloError::module_not_found(module))?;
        let (subs, count) = self.module_view(base).oper_subs();

        let mut found = None;
        for i in 0..count as usize {
            let rec = subs as usize + i * opersub::SIZE;
            let rec_xpath = get_u64_at(self.ext.bytes(), rec + opersub::XPATH);
            if self.ext.str_at(rec_xpath)? == xpath {
                found = Some(i);
                break;
            }
        }
        let idx = found.ok_or_else(|| SiloError::SubscriptionNotFound {
            key: format!("{module} oper ({xpath})"),
        })?;
        self.oper_sub_del_idx(base, subs as usize, count as usize, idx)
    }

    /// Remove every operational subscription of the module at
    /// `module_base` matching an event-pipe id.
    pub fn oper_sub_del_evpipe(&mut self, module_base: usize, evpipe: u32) -> Result<bool> {
        let mut removed = false;
        loop {
            let (subs, count) = self.module_view(module_base).oper_subs();
            let hit = (0..count as usize).find(|&i| {
                let rec = subs as usize + i * opersub::SIZE;
                get_u32_at(self.ext.bytes(), rec + opersub::EVPIPE) == evpipe
            });
            match hit {
                Some(idx) => {
                    self.oper_sub_del_idx(module_base, subs as usize, count as usize, idx)?;
                    removed = true;
                }
                None => return Ok(removed),
            }
        }
    }

    fn oper_sub_del_idx(
        &mut self,
        base: usize,
        subs: usize,
        count: usize,
        idx: usize,
    ) -> Result<()> {
        let rec = subs + idx * opersub::SIZE;
        let xpath = get_u64_at(self.ext.bytes(), rec + opersub::XPATH);
        let freed = opersub::SIZE as u64 + self.ext.strlen_at(xpath)? as u64;
        self.ext.add_wasted(freed);

        let count = count - 1;
        self.sub_array_swap(subs, count, opersub::SIZE, idx);
        let main = self.main.bytes_mut();
        if count == 0 {
            put_u64_at(main, base + modrec::OPER_SUBS, 0);
        }
        put_u16_at(main, base + modrec::OPER_SUB_COUNT, count as u16);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Notification subscriptions
    // -----------------------------------------------------------------------

    /// Add a notification subscription to `module`.
    pub fn notif_sub_add(&mut self, module: &str, evpipe: EvpipeId) -> Result<()> {
        let base = self
            .find_module(module)?
            .ok_or_else(|| SiloError::module_not_found(module))?;
        let (subs, count) = self.module_view(base).notif_subs();
        let arr = self.sub_array_grow(subs, count as usize, notifsub::SIZE)?;

        put_u32_at(
            self.ext.bytes_mut(),
            arr as usize + count as usize * notifsub::SIZE,
            evpipe.get(),
        );
        let main = self.main.bytes_mut();
        put_u64_at(main, base + modrec::NOTIF_SUBS, arr);
        put_u16_at(main, base + modrec::NOTIF_SUB_COUNT, count + 1);
        Ok(())
    }

    /// Remove one notification subscription with the given event pipe.
    pub fn notif_sub_del(&mut self, module: &str, evpipe: EvpipeId) -> Result<()> {
        let base = self
            .find_module(module)?
            .ok_or_else(|| SiloError::module_not_found(module))?;
        if !self.notif_sub_del_evpipe_one(base, evpipe.get())? {
            return Err(SiloError::SubscriptionNotFound {
                key: format!("{module} notif ({evpipe})"),
            });
        }
        Ok(())
    }

    /// Remove every notification subscription of the module at
    /// `module_base` matching an event-pipe id.
    pub fn notif_sub_del_evpipe(&mut self, module_base: usize, evpipe: u32) -> Result<bool> {
        let mut removed = false;
        while self.notif_sub_del_evpipe_one(module_base, evpipe)? {
            removed = true;
        }
        Ok(removed)
    }

    fn notif_sub_del_evpipe_one(&mut self, base: usize, evpipe: u32) -> Result<bool> {
        let (subs, count) = self.module_view(base).notif_subs();
        let hit = (0..count as usize).find(|&i| {
            get_u32_at(self.ext.bytes(), subs as usize + i * notifsub::SIZE) == evpipe
        });
        let Some(idx) = hit else {
            return Ok(false);
        };

        self.ext.add_wasted(notifsub::SIZE as u64);
        let count = count as usize - 1;
        self.sub_array_swap(subs as usize, count, notifsub::SIZE, idx);
        let main = self.main.bytes_mut();
        if count == 0 {
            put_u64_at(main, base + modrec::NOTIF_SUBS, 0);
        }
        put_u16_at(main, base + modrec::NOTIF_SUB_COUNT, count as u16);
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // RPC subscriptions
    // -----------------------------------------------------------------------

    /// Add a subscription to the RPC record at arena offset `rpc_off`.
    pub fn rpc_sub_add(
        &mut self,
        rpc_off: u64,
        xpath: &str,
        priority: u32,
        opts: SubOptions,
        evpipe: EvpipeId,
    ) -> Result<()> {
        let rec = rpc_off as usize;
        let subs = get_u64_at(self.ext.bytes(), rec + rpc::SUBS);
        let count = get_u16_at(self.ext.bytes(), rec + rpc::SUB_COUNT);
        let arr = self.sub_array_grow(subs, count as usize, rpcsub::SIZE)?;

        let xpath_off = self.ext.put_string(xpath)?;
        let sub = arr as usize + count as usize * rpcsub::SIZE;
        let buf = self.ext.bytes_mut();
        put_u64_at(buf, sub + rpcsub::XPATH, xpath_off);
        put_u32_at(buf, sub + rpcsub::PRIORITY, priority);
        put_u32_at(buf, sub + rpcsub::OPTS, opts.0);
        put_u32_at(buf, sub + rpcsub::EVPIPE, evpipe.get());

        put_u64_at(buf, rec + rpc::SUBS, arr);
        put_u16_at(buf, rec + rpc::SUB_COUNT, count + 1);
        Ok(())
    }

    /// Remove the RPC subscription keyed by `(xpath, priority)`.
    /// Returns whether the removed subscription was the RPC's last.
    pub fn rpc_sub_del(&mut self, rpc_off: u64, xpath: &str, priority: u32) -> Result<bool> {
        let rec = rpc_off as usize;
        let subs = get_u64_at(self.ext.bytes(), rec + rpc::SUBS) as usize;
        let count = get_u16_at(self.ext.bytes(), rec + rpc::SUB_COUNT) as usize;

        let mut found = None;
        for i in 0..count {
            let sub = subs + i * rpcsub::SIZE;
            let sub_xpath = get_u64_at(self.ext.bytes(), sub + rpcsub::XPATH);
            let sub_prio = get_u32_at(self.ext.bytes(), sub + rpcsub::PRIORITY);
            if sub_prio == priority && self.ext.str_at(sub_xpath)? == xpath {
                found = Some(i);
                break;
            }
        }
        let idx = found.ok_or_else(|| SiloError::SubscriptionNotFound {
            key: format!("rpc sub ({xpath}, {priority})"),
        })?;
        self.rpc_sub_del_idx(rec, subs, count, idx)?;
        Ok(count == 1)
    }

    /// Remove every subscription of the RPC at `rpc_off` matching an
    /// event-pipe id. Returns `(removed_any, last_removed)`.
    pub fn rpc_sub_del_evpipe(&mut self, rpc_off: u64, evpipe: u32) -> Result<(bool, bool)> {
        let rec = rpc_off as usize;
        let mut removed = false;
        loop {
            let subs = get_u64_at(self.ext.bytes(), rec + rpc::SUBS) as usize;
            let count = get_u16_at(self.ext.bytes(), rec + rpc::SUB_COUNT) as usize;
            let hit = (0..count).find(|&i| {
                let sub = subs + i * rpcsub::SIZE;
                get_u32_at(self.ext.bytes(), sub + rpcsub::EVPIPE) == evpipe
            });
            match hit {
                Some(idx) => {
                    self.rpc_sub_del_idx(rec, subs, count, idx)?;
                    removed = true;
                }
                None => {
                    let last = removed && count == 0;
                    return Ok((removed, last));
                }
            }
        }
    }

    fn rpc_sub_del_idx(
        &mut self,
        rec: usize,
        subs: usize,
        count: usize,
        idx: usize,
    ) -> Result<()> {
        let sub = subs + idx * rpcsub::SIZE;
        let xpath = get_u64_at(self.ext.bytes(), sub + rpcsub::XPATH);
        let freed = rpcsub::SIZE as u64 + self.ext.strlen_at(xpath)? as u64;
        self.ext.add_wasted(freed);

        let count = count - 1;
        self.sub_array_swap(subs, count, rpcsub::SIZE, idx);
        let buf = self.ext.bytes_mut();
        if count == 0 {
            put_u64_at(buf, rec + rpc::SUBS, 0);
        }
        put_u16_at(buf, rec + rpc::SUB_COUNT, count as u16);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testutil::temp_conn;
    use crate::registry::ModuleSpec;

    fn ev(id: u32) -> EvpipeId {
        EvpipeId::new(id).unwrap()
    }

    fn setup() -> (tempfile::TempDir, ShmConn) {
        let (dir, mut conn) = temp_conn();
        conn.add_modules(&[ModuleSpec::new("m1", "2024-01-01")])
            .unwrap();
        (dir, conn)
    }

    #[test]
    fn test_change_sub_add_del_by_key() {
        let (_dir, mut conn) = setup();
        conn.change_sub_add(
            "m1",
            Datastore::Running,
            Some("/m1:a"),
            10,
            SubOptions::DEFAULT,
            ev(1),
        )
        .unwrap();
        conn.change_sub_add("m1", Datastore::Running, None, 0, SubOptions::DEFAULT, ev(2))
            .unwrap();

        let base = conn.find_module("m1").unwrap().unwrap();
        assert_eq!(conn.module_view(base).change_subs(Datastore::Running).1, 2);
        // Other datastores untouched.
        assert_eq!(conn.module_view(base).change_subs(Datastore::Startup).1, 0);

        conn.change_sub_del("m1", Datastore::Running, Some("/m1:a"), 10)
            .unwrap();
        assert_eq!(conn.module_view(base).change_subs(Datastore::Running).1, 1);

        conn.change_sub_del("m1", Datastore::Running, None, 0).unwrap();
        let (subs, count) = conn.module_view(base).change_subs(Datastore::Running);
        assert_eq!((subs, count), (0, 0));
    }

    #[test]
    fn test_change_sub_del_wrong_key() {
        let (_dir, mut conn) = setup();
        conn.change_sub_add(
            "m1",
            Datastore::Running,
            Some("/m1:a"),
            10,
            SubOptions::DEFAULT,
            ev(1),
        )
        .unwrap();
        // Same xpath, different priority.
        assert!(matches!(
            conn.change_sub_del("m1", Datastore::Running, Some("/m1:a"), 11),
            Err(SiloError::SubscriptionNotFound { .. })
        ));
    }

    #[test]
    fn test_change_sub_del_all_by_evpipe() {
        let (_dir, mut conn) = setup();
        for (xp, prio) in [(Some("/m1:a"), 1), (Some("/m1:b"), 2), (None, 3)] {
            conn.change_sub_add("m1", Datastore::Running, xp, prio, SubOptions::DEFAULT, ev(7))
                .unwrap();
        }
        conn.change_sub_add(
            "m1",
            Datastore::Running,
            Some("/m1:c"),
            4,
            SubOptions::DEFAULT,
            ev(8),
        )
        .unwrap();

        let base = conn.find_module("m1").unwrap().unwrap();
        assert!(conn.change_sub_del_evpipe(base, Datastore::Running, 7).unwrap());
        assert_eq!(conn.module_view(base).change_subs(Datastore::Running).1, 1);
        // Second sweep finds nothing.
        assert!(!conn.change_sub_del_evpipe(base, Datastore::Running, 7).unwrap());
    }

    #[test]
    fn test_oper_sub_lifecycle() {
        let (_dir, mut conn) = setup();
        conn.oper_sub_add("m1", "/m1:state", SubOptions::DEFAULT, ev(7))
            .unwrap();
        let base = conn.find_module("m1").unwrap().unwrap();
        assert_eq!(conn.module_view(base).oper_subs().1, 1);

        conn.oper_sub_del("m1", "/m1:state").unwrap();
        assert_eq!(conn.module_view(base).oper_subs(), (0, 0));

        assert!(matches!(
            conn.oper_sub_del("m1", "/m1:state"),
            Err(SiloError::SubscriptionNotFound { .. })
        ));
    }

    #[test]
    fn test_notif_sub_lifecycle() {
        let (_dir, mut conn) = setup();
        conn.notif_sub_add("m1", ev(5)).unwrap();
        conn.notif_sub_add("m1", ev(5)).unwrap();
        conn.notif_sub_add("m1", ev(6)).unwrap();

        let base = conn.find_module("m1").unwrap().unwrap();
        assert_eq!(conn.module_view(base).notif_subs().1, 3);

        // The evpipe sweep removes both id-5 entries.
        assert!(conn.notif_sub_del_evpipe(base, 5).unwrap());
        assert_eq!(conn.module_view(base).notif_subs().1, 1);

        conn.notif_sub_del("m1", ev(6)).unwrap();
        assert_eq!(conn.module_view(base).notif_subs(), (0, 0));
    }

    #[test]
    fn test_rpc_sub_last_removed_semantics() {
        let (_dir, mut conn) = setup();
        let rpc_off = conn.add_rpc("/m1:reset").unwrap();
        conn.rpc_sub_add(rpc_off, "/m1:reset", 1, SubOptions::DEFAULT, ev(7))
            .unwrap();
        conn.rpc_sub_add(rpc_off, "/m1:reset", 2, SubOptions::DEFAULT, ev(7))
            .unwrap();

        assert!(!conn.rpc_sub_del(rpc_off, "/m1:reset", 1).unwrap());
        assert!(conn.rpc_sub_del(rpc_off, "/m1:reset", 2).unwrap());
    }

    #[test]
    fn test_rpc_sub_del_evpipe_reports_last() {
        let (_dir, mut conn) = setup();
        let rpc_off = conn.add_rpc("/m1:reset").unwrap();
        conn.rpc_sub_add(rpc_off, "/m1:reset", 1, SubOptions::DEFAULT, ev(7))
            .unwrap();
        conn.rpc_sub_add(rpc_off, "/m1:reset", 2, SubOptions::DEFAULT, ev(9))
            .unwrap();

        let (removed, last) = conn.rpc_sub_del_evpipe(rpc_off, 7).unwrap();
        assert!(removed);
        assert!(!last);

        let (removed, last) = conn.rpc_sub_del_evpipe(rpc_off, 9).unwrap();
        assert!(removed);
        assert!(last);

        let (removed, last) = conn.rpc_sub_del_evpipe(rpc_off, 9).unwrap();
        assert!(!removed);
        assert!(!last);
    }

    #[test]
    fn test_wasted_grows_on_churn() {
        let (_dir, mut conn) = setup();
        let w0 = conn.arena().wasted();
        conn.change_sub_add(
            "m1",
            Datastore::Startup,
            Some("/m1:x"),
            1,
            SubOptions::DEFAULT,
            ev(1),
        )
        .unwrap();
        let w1 = conn.arena().wasted();
        assert_eq!(w1, w0); // first append displaces nothing
        conn.change_sub_del("m1", Datastore::Startup, Some("/m1:x"), 1)
            .unwrap();
        let w2 = conn.arena().wasted();
        assert_eq!(
            w2 - w1,
            (changesub::SIZE + "/m1:x".len() + 1) as u64
        );
    }
}
