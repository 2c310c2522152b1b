//! The module registry: the dense array of fixed module records in the main
//! region, together with the RPC table rooted in the header.
//!
//! Bulk insertion rebuilds every module's dependencies. A new module can
//! introduce inverse dependencies into previously existing modules and
//! foreign-augment dependencies inside them; rebuilding everything is
//! cheaper than diffing.

use silo_error::{Result, SiloError};
use silo_types::encoding::{get_u16_at, get_u32_at, get_u64_at, put_u16_at, put_u32_at, put_u64_at};
use silo_types::{Datastore, DepType};
use tracing::{debug, info};

use crate::arena::WASTED_SIZE;
use crate::conn::ShmConn;
use crate::layout::{
    self, changesub, datadep, hdr, modrec, opdep, opersub, rpc, rpcsub, ModView,
    OFFSET_ENTRY_SIZE,
};

// ---------------------------------------------------------------------------
// Descriptor tree
// ---------------------------------------------------------------------------

/// One data dependency in a module descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepSpec {
    /// Plain reference to another module.
    Ref {
        /// Referenced module name; must be present in the descriptor tree
        /// or already installed.
        module: String,
    },
    /// Instance-identifier dependency.
    InstId {
        /// The xpath of the instance identifier.
        xpath: String,
        /// Module providing the default value, if any.
        default_module: Option<String>,
    },
}

/// One operation (RPC/action) dependency block in a module descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpDepSpec {
    /// Operation xpath.
    pub xpath: String,
    /// Input dependencies.
    pub input: Vec<DepSpec>,
    /// Output dependencies.
    pub output: Vec<DepSpec>,
}

/// Descriptor of one module, the unit of bulk insertion.
///
/// The descriptor tree passed to [`ShmConn::add_modules`] holds the full
/// module set: modules already installed contribute only their (rebuilt)
/// dependencies; the rest are inserted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleSpec {
    /// Module name.
    pub name: String,
    /// Revision date, bounded by the inline field.
    pub revision: String,
    /// Whether notification replay is supported.
    pub replay_support: bool,
    /// Enabled feature names.
    pub features: Vec<String>,
    /// Data dependencies.
    pub data_deps: Vec<DepSpec>,
    /// Names of modules depending on this one.
    pub inv_deps: Vec<String>,
    /// Operation dependencies.
    pub op_deps: Vec<OpDepSpec>,
}

impl ModuleSpec {
    /// Minimal descriptor with just a name and revision.
    pub fn new(name: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: revision.into(),
            ..Self::default()
        }
    }
}

/// Arena bytes one data-dependency list will occupy.
fn deps_size(deps: &[DepSpec]) -> usize {
    let mut size = deps.len() * datadep::SIZE;
    for dep in deps {
        if let DepSpec::InstId { xpath, .. } = dep {
            size += xpath.len() + 1;
        }
    }
    size
}

/// Arena bytes the descriptor tree will occupy once emitted.
fn tree_size(tree: &[ModuleSpec]) -> usize {
    let mut size = 0;
    for spec in tree {
        size += spec.name.len() + 1;
        size += spec.features.len() * OFFSET_ENTRY_SIZE;
        for feat in &spec.features {
            size += feat.len() + 1;
        }
        size += deps_size(&spec.data_deps);
        size += spec.inv_deps.len() * OFFSET_ENTRY_SIZE;
        size += spec.op_deps.len() * opdep::SIZE;
        for op in &spec.op_deps {
            size += op.xpath.len() + 1;
            size += deps_size(&op.input);
            size += deps_size(&op.output);
        }
    }
    size
}

// ---------------------------------------------------------------------------
// Registry operations
// ---------------------------------------------------------------------------

impl ShmConn {
    /// Find a module record by name. Returns its main-region base offset.
    pub fn find_module(&self, name: &str) -> Result<Option<usize>> {
        for i in 0..self.module_count() {
            let base = layout::module_base(i);
            let name_off = ModView::new(self.main.bytes(), base).name();
            if self.ext.str_at(name_off)? == name {
                return Ok(Some(base));
            }
        }
        Ok(None)
    }

    /// Find a module record by the exact arena offset of its name.
    #[must_use]
    pub fn find_module_at(&self, name_off: u64) -> Option<usize> {
        (0..self.module_count())
            .map(layout::module_base)
            .find(|&base| ModView::new(self.main.bytes(), base).name() == name_off)
    }

    /// Read accessor for the module record at `base`.
    #[must_use]
    pub fn module_view(&self, base: usize) -> ModView<'_> {
        ModView::new(self.main.bytes(), base)
    }

    /// Bulk insertion. `tree` is the full module set; modules not yet
    /// present are appended, and the dependencies of every module (old and
    /// new) are rebuilt from the tree.
    ///
    /// Must be called with the write side of the main lock held. On an
    /// internal sizing mismatch the in-process images are discarded, so no
    /// partial write becomes observable.
    pub fn add_modules(&mut self, tree: &[ModuleSpec]) -> Result<()> {
        match self.add_modules_inner(tree) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Leave the registry uncommitted.
                self.reload()?;
                Err(e)
            }
        }
    }

    fn add_modules_inner(&mut self, tree: &[ModuleSpec]) -> Result<()> {
        for spec in tree {
            if spec.revision.len() + 1 > layout::REV_MAX {
                return Err(SiloError::internal(format!(
                    "revision of module \"{}\" exceeds the inline bound",
                    spec.name
                )));
            }
        }

        let mut new = Vec::new();
        for spec in tree {
            if self.find_module(&spec.name)?.is_none() {
                new.push(spec.clone());
            }
        }

        // Exact arena size the registry will occupy once this call commits:
        // untouched state (connections, RPCs, module subscriptions) plus
        // everything emitted from the descriptor tree.
        let expected_live = WASTED_SIZE + self.ext_live_state_size()? + tree_size(tree);

        // Enlarge the main region for the new records.
        let old_count = self.module_count();
        let old_main_size = self.main.size();
        self.main
            .remap(old_main_size + new.len() * modrec::SIZE)?;

        // Copy module names first so later dependency records can reference
        // them by offset, then emit the feature lists.
        for (i, spec) in new.iter().enumerate() {
            let base = layout::module_base(old_count + i);
            let name_off = self.ext.put_string(&spec.name)?;
            let buf = self.main.bytes_mut();
            put_u64_at(buf, base + modrec::NAME, name_off);
            let rev = spec.revision.as_bytes();
            buf[base + modrec::REV..base + modrec::REV + rev.len()].copy_from_slice(rev);
            let mut flags = 0;
            if spec.replay_support {
                flags |= modrec::FLAG_REPLAY_SUPPORT;
            }
            put_u32_at(buf, base + modrec::FLAGS, flags);
            put_u32_at(buf, base + modrec::VER, 1);
        }
        for (i, spec) in new.iter().enumerate() {
            let base = layout::module_base(old_count + i);
            let count = u16::try_from(spec.features.len())
                .map_err(|_| SiloError::internal("feature count overflow"))?;
            let arr = self.ext.alloc(spec.features.len() * OFFSET_ENTRY_SIZE)?;
            for (j, feat) in spec.features.iter().enumerate() {
                let off = self.ext.put_string(feat)?;
                put_u64_at(
                    self.ext.bytes_mut(),
                    arr as usize + j * OFFSET_ENTRY_SIZE,
                    off,
                );
            }
            let buf = self.main.bytes_mut();
            put_u64_at(buf, base + modrec::FEATURES, arr);
            put_u16_at(buf, base + modrec::FEAT_COUNT, count);
        }

        // Rebuild every module's dependencies from the tree.
        self.del_modules_deps()?;
        for spec in tree {
            let base = self
                .find_module(&spec.name)?
                .ok_or_else(|| SiloError::internal("freshly added module not found"))?;

            let (data_deps, data_dep_count) = self.fill_data_deps(&spec.data_deps)?;

            let inv_count = u16::try_from(spec.inv_deps.len())
                .map_err(|_| SiloError::internal("inverse dependency count overflow"))?;
            let inv_arr = self.ext.alloc(spec.inv_deps.len() * OFFSET_ENTRY_SIZE)?;
            for (j, dep_mod) in spec.inv_deps.iter().enumerate() {
                let ref_base = self
                    .find_module(dep_mod)?
                    .ok_or_else(|| SiloError::module_not_found(dep_mod.clone()))?;
                let ref_name = self.module_view(ref_base).name();
                put_u64_at(
                    self.ext.bytes_mut(),
                    inv_arr as usize + j * OFFSET_ENTRY_SIZE,
                    ref_name,
                );
            }

            let op_count = u16::try_from(spec.op_deps.len())
                .map_err(|_| SiloError::internal("operation dependency count overflow"))?;
            let op_arr = self.ext.alloc(spec.op_deps.len() * opdep::SIZE)?;
            for (j, op) in spec.op_deps.iter().enumerate() {
                let rec = op_arr as usize + j * opdep::SIZE;
                let xpath_off = self.ext.put_string(&op.xpath)?;
                put_u64_at(self.ext.bytes_mut(), rec + opdep::XPATH, xpath_off);
                let (in_deps, in_count) = self.fill_data_deps(&op.input)?;
                let (out_deps, out_count) = self.fill_data_deps(&op.output)?;
                let buf = self.ext.bytes_mut();
                put_u64_at(buf, rec + opdep::IN_DEPS, in_deps);
                put_u64_at(buf, rec + opdep::OUT_DEPS, out_deps);
                put_u16_at(buf, rec + opdep::IN_COUNT, in_count);
                put_u16_at(buf, rec + opdep::OUT_COUNT, out_count);
            }
            let buf = self.main.bytes_mut();
            put_u64_at(buf, base + modrec::DATA_DEPS, data_deps);
            put_u16_at(buf, base + modrec::DATA_DEP_COUNT, data_dep_count);
            put_u64_at(buf, base + modrec::INV_DEPS, inv_arr);
            put_u16_at(buf, base + modrec::INV_DEP_COUNT, inv_count);
            put_u64_at(buf, base + modrec::OP_DEPS, op_arr);
            put_u16_at(buf, base + modrec::OP_DEP_COUNT, op_count);
        }

        // The computed size must match the tail exactly, or the operation
        // is aborted before anything becomes observable.
        let expected = expected_live + self.ext.wasted() as usize;
        if self.ext.size() != expected {
            return Err(SiloError::internal(format!(
                "registry sizing mismatch: tail {} != expected {}",
                self.ext.size(),
                expected
            )));
        }

        info!(
            added = new.len(),
            total = self.module_count(),
            "modules installed"
        );
        Ok(())
    }

    /// Emit one data-dependency array; returns `(offset, count)`.
    fn fill_data_deps(&mut self, deps: &[DepSpec]) -> Result<(u64, u16)> {
        if deps.is_empty() {
            return Ok((0, 0));
        }
        let count = u16::try_from(deps.len())
            .map_err(|_| SiloError::internal("data dependency count overflow"))?;
        let arr = self.ext.alloc(deps.len() * datadep::SIZE)?;
        for (i, dep) in deps.iter().enumerate() {
            let rec = arr as usize + i * datadep::SIZE;
            match dep {
                DepSpec::Ref { module } => {
                    let ref_base = self
                        .find_module(module)?
                        .ok_or_else(|| SiloError::module_not_found(module.clone()))?;
                    let ref_name = self.module_view(ref_base).name();
                    let buf = self.ext.bytes_mut();
                    put_u32_at(buf, rec + datadep::TYPE, DepType::Ref as u32);
                    put_u64_at(buf, rec + datadep::MODULE, ref_name);
                    put_u64_at(buf, rec + datadep::XPATH, 0);
                }
                DepSpec::InstId {
                    xpath,
                    default_module,
                } => {
                    let module = match default_module {
                        Some(m) => {
                            let ref_base = self
                                .find_module(m)?
                                .ok_or_else(|| SiloError::module_not_found(m.clone()))?;
                            self.module_view(ref_base).name()
                        }
                        None => 0,
                    };
                    let xpath_off = self.ext.put_string(xpath)?;
                    let buf = self.ext.bytes_mut();
                    put_u32_at(buf, rec + datadep::TYPE, DepType::InstId as u32);
                    put_u64_at(buf, rec + datadep::MODULE, module);
                    put_u64_at(buf, rec + datadep::XPATH, xpath_off);
                }
            }
        }
        Ok((arr, count))
    }

    /// Delete the dependencies of every module, accumulating their bytes
    /// into the wasted counter. Part of the rebuild performed by
    /// [`Self::add_modules`]; also the first half of the defrag-equivalence
    /// cycle.
    pub fn del_modules_deps(&mut self) -> Result<()> {
        for i in 0..self.module_count() {
            let base = layout::module_base(i);
            let mut freed = 0_u64;

            let (data_deps, data_dep_count) = self.module_view(base).data_deps();
            freed += self.data_deps_bytes(data_deps, data_dep_count)?;

            let (_, inv_count) = self.module_view(base).inv_deps();
            freed += inv_count as u64 * OFFSET_ENTRY_SIZE as u64;

            let (op_deps, op_dep_count) = self.module_view(base).op_deps();
            for j in 0..op_dep_count as usize {
                let rec = op_deps as usize + j * opdep::SIZE;
                let ext = self.ext.bytes();
                let xpath = get_u64_at(ext, rec + opdep::XPATH);
                let in_deps = get_u64_at(ext, rec + opdep::IN_DEPS);
                let in_count = get_u16_at(ext, rec + opdep::IN_COUNT);
                let out_deps = get_u64_at(ext, rec + opdep::OUT_DEPS);
                let out_count = get_u16_at(ext, rec + opdep::OUT_COUNT);
                if xpath != 0 {
                    freed += self.ext.strlen_at(xpath)? as u64;
                }
                freed += self.data_deps_bytes(in_deps, in_count)?;
                freed += self.data_deps_bytes(out_deps, out_count)?;
            }
            freed += op_dep_count as u64 * opdep::SIZE as u64;

            let buf = self.main.bytes_mut();
            put_u64_at(buf, base + modrec::DATA_DEPS, 0);
            put_u16_at(buf, base + modrec::DATA_DEP_COUNT, 0);
            put_u64_at(buf, base + modrec::INV_DEPS, 0);
            put_u16_at(buf, base + modrec::INV_DEP_COUNT, 0);
            put_u64_at(buf, base + modrec::OP_DEPS, 0);
            put_u16_at(buf, base + modrec::OP_DEP_COUNT, 0);

            self.ext.add_wasted(freed);
        }
        Ok(())
    }

    /// Bytes occupied by one data-dependency array including its xpaths.
    fn data_deps_bytes(&self, deps: u64, count: u16) -> Result<u64> {
        let mut bytes = count as u64 * datadep::SIZE as u64;
        for i in 0..count as usize {
            let rec = deps as usize + i * datadep::SIZE;
            let xpath = get_u64_at(self.ext.bytes(), rec + datadep::XPATH);
            if xpath != 0 {
                bytes += self.ext.strlen_at(xpath)? as u64;
            }
        }
        Ok(bytes)
    }

    /// Toggle a module's replay-support flag; bumps its version counter
    /// when the flag actually changes.
    pub fn update_replay_support(&mut self, name: &str, replay_support: bool) -> Result<()> {
        let base = self
            .find_module(name)?
            .ok_or_else(|| SiloError::module_not_found(name))?;
        let view = self.module_view(base);
        let flags = view.flags();
        let ver = view.ver();
        let has = flags & modrec::FLAG_REPLAY_SUPPORT != 0;
        if has == replay_support {
            return Ok(());
        }
        let buf = self.main.bytes_mut();
        put_u32_at(
            buf,
            base + modrec::FLAGS,
            flags ^ modrec::FLAG_REPLAY_SUPPORT,
        );
        put_u32_at(buf, base + modrec::VER, ver + 1);
        debug!(module = name, replay_support, "replay support updated");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // RPC table
    // -----------------------------------------------------------------------

    /// Number of RPC records.
    #[must_use]
    pub fn rpc_count(&self) -> usize {
        get_u32_at(self.main.bytes(), hdr::RPC_COUNT) as usize
    }

    /// Arena offset of the RPC record at `idx`.
    #[must_use]
    pub fn rpc_offset(&self, idx: usize) -> u64 {
        get_u64_at(self.main.bytes(), hdr::RPCS) + (idx * rpc::SIZE) as u64
    }

    /// Find an RPC record by operation path. Returns its arena offset.
    pub fn find_rpc(&self, op_path: &str) -> Result<Option<u64>> {
        for i in 0..self.rpc_count() {
            let rec = self.rpc_offset(i);
            let path_off = get_u64_at(self.ext.bytes(), rec as usize + rpc::OP_PATH);
            if self.ext.str_at(path_off)? == op_path {
                return Ok(Some(rec));
            }
        }
        Ok(None)
    }

    /// Find an RPC record by the exact arena offset of its operation path.
    #[must_use]
    pub fn find_rpc_at(&self, op_path_off: u64) -> Option<u64> {
        (0..self.rpc_count()).map(|i| self.rpc_offset(i)).find(|&rec| {
            get_u64_at(self.ext.bytes(), rec as usize + rpc::OP_PATH) == op_path_off
        })
    }

    /// Append an RPC record; the whole table relocates to the tail.
    /// Returns the new record's arena offset.
    pub fn add_rpc(&mut self, op_path: &str) -> Result<u64> {
        debug_assert!(
            self.find_rpc(op_path).ok().flatten().is_none(),
            "RPC already present"
        );

        let old = get_u64_at(self.main.bytes(), hdr::RPCS);
        let count = self.rpc_count();

        let arr = self.ext.alloc((count + 1) * rpc::SIZE)?;
        self.ext.add_wasted((count * rpc::SIZE) as u64);
        if count > 0 {
            self.ext
                .bytes_mut()
                .copy_within(old as usize..old as usize + count * rpc::SIZE, arr as usize);
        }

        let path_off = self.ext.put_string(op_path)?;
        let rec = arr as usize + count * rpc::SIZE;
        let buf = self.ext.bytes_mut();
        put_u64_at(buf, rec + rpc::OP_PATH, path_off);
        put_u64_at(buf, rec + rpc::SUBS, 0);
        put_u16_at(buf, rec + rpc::SUB_COUNT, 0);

        let main = self.main.bytes_mut();
        put_u64_at(main, hdr::RPCS, arr);
        put_u32_at(main, hdr::RPC_COUNT, (count + 1) as u32);
        debug!(op_path, "RPC added");
        Ok(rec as u64)
    }

    /// Remove an RPC record by operation path.
    pub fn del_rpc(&mut self, op_path: &str) -> Result<()> {
        let rec = self
            .find_rpc(op_path)?
            .ok_or_else(|| SiloError::RpcNotFound {
                path: op_path.to_owned(),
            })?;
        self.del_rpc_record(rec)
    }

    /// Remove an RPC record by the arena offset of its operation path.
    pub fn del_rpc_at(&mut self, op_path_off: u64) -> Result<()> {
        let rec = self
            .find_rpc_at(op_path_off)
            .ok_or_else(|| SiloError::internal("RPC record for offset not found"))?;
        self.del_rpc_record(rec)
    }

    /// Remove the RPC record at the given arena offset (as returned by
    /// [`Self::find_rpc`] or [`Self::add_rpc`]).
    pub fn del_rpc_offset(&mut self, rpc_off: u64) -> Result<()> {
        self.del_rpc_record(rpc_off)
    }

    /// Swap-remove the RPC record at arena offset `rec`.
    pub(crate) fn del_rpc_record(&mut self, rec: u64) -> Result<()> {
        let arr = get_u64_at(self.main.bytes(), hdr::RPCS);
        let count = self.rpc_count();
        let idx = (rec - arr) as usize / rpc::SIZE;
        debug_assert!(idx < count);

        let path_off = get_u64_at(self.ext.bytes(), rec as usize + rpc::OP_PATH);
        let freed = rpc::SIZE as u64 + self.ext.strlen_at(path_off)? as u64;
        self.ext.add_wasted(freed);

        let count = count - 1;
        if count == 0 {
            // The only RPC removed.
            put_u64_at(self.main.bytes_mut(), hdr::RPCS, 0);
        } else if idx < count {
            // Replace the removed RPC with the last one.
            let last = arr as usize + count * rpc::SIZE;
            self.ext
                .bytes_mut()
                .copy_within(last..last + rpc::SIZE, rec as usize);
        }
        put_u32_at(self.main.bytes_mut(), hdr::RPC_COUNT, count as u32);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Live-size accounting
    // -----------------------------------------------------------------------

    /// Arena bytes occupied by connection state, RPCs and their
    /// subscriptions, and every module's subscription arrays. Everything
    /// the bulk-insertion rebuild does not re-emit.
    pub(crate) fn ext_live_state_size(&self) -> Result<usize> {
        use crate::layout::connstate;

        let mut size = 0;

        let conns = get_u64_at(self.main.bytes(), hdr::CONNS);
        let conn_count = get_u32_at(self.main.bytes(), hdr::CONN_COUNT) as usize;
        for i in 0..conn_count {
            let rec = conns as usize + i * connstate::SIZE;
            let evpipe_count = get_u32_at(self.ext.bytes(), rec + connstate::EVPIPE_COUNT);
            size += connstate::SIZE + evpipe_count as usize * layout::EVPIPE_ENTRY_SIZE;
        }

        for i in 0..self.rpc_count() {
            let rec = self.rpc_offset(i) as usize;
            let path_off = get_u64_at(self.ext.bytes(), rec + rpc::OP_PATH);
            size += rpc::SIZE + self.ext.strlen_at(path_off)?;
            let subs = get_u64_at(self.ext.bytes(), rec + rpc::SUBS);
            let sub_count = get_u16_at(self.ext.bytes(), rec + rpc::SUB_COUNT) as usize;
            size += sub_count * rpcsub::SIZE;
            for j in 0..sub_count {
                let sub = subs as usize + j * rpcsub::SIZE;
                let xpath = get_u64_at(self.ext.bytes(), sub + rpcsub::XPATH);
                size += self.ext.strlen_at(xpath)?;
            }
        }

        for i in 0..self.module_count() {
            let view = self.module_view(layout::module_base(i));
            for ds in Datastore::ALL {
                let (subs, count) = view.change_subs(ds);
                size += count as usize * changesub::SIZE;
                for j in 0..count as usize {
                    let sub = subs as usize + j * changesub::SIZE;
                    let xpath = get_u64_at(self.ext.bytes(), sub + changesub::XPATH);
                    if xpath != 0 {
                        size += self.ext.strlen_at(xpath)?;
                    }
                }
            }
            let (subs, count) = view.oper_subs();
            size += count as usize * opersub::SIZE;
            for j in 0..count as usize {
                let sub = subs as usize + j * opersub::SIZE;
                let xpath = get_u64_at(self.ext.bytes(), sub + opersub::XPATH);
                size += self.ext.strlen_at(xpath)?;
            }
            // Notification subscriptions are sized by their explicit count.
            let (_, notif_count) = view.notif_subs();
            size += notif_count as usize * layout::notifsub::SIZE;
        }

        Ok(size)
    }
}
