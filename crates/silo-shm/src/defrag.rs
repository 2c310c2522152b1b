//! Defragmentation: the compacting rewrite of the extension arena.
//!
//! Executed under the write side of the remap guard (plus the main write
//! lock, which every registry mutation needs anyway). Live data is rewritten
//! into a fresh buffer of exactly `arena_size - wasted` bytes in a canonical
//! order, parent offsets are fixed up as children are copied, and the buffer
//! is swapped in atomically; the wasted counter resets to 0.

use std::collections::HashMap;

use silo_error::{Result, SiloError};
use silo_types::encoding::{get_u16_at, get_u32_at, get_u64_at, put_u64_at};
use silo_types::Datastore;
use tracing::{debug, info};

use crate::arena::Arena;
use crate::conn::ShmConn;
use crate::layout::{
    self, change_subs_field, changesub, connstate, datadep, hdr, modrec, notifsub, opdep,
    opersub, rpc, rpcsub, ModView, EVPIPE_ENTRY_SIZE, OFFSET_ENTRY_SIZE,
};
use crate::region::ShmFile;

impl ShmConn {
    /// Compact the arena. Requires `lock(Write, remap = true)` to be held.
    ///
    /// On success the arena holds exactly its live bytes and the wasted
    /// counter is 0. On a sizing mismatch nothing is committed and the main
    /// image is restored from the backing file.
    pub fn defrag(&mut self) -> Result<()> {
        let wasted = self.ext.wasted() as usize;
        let expected = self.ext.size() - wasted;

        let mut buf = Vec::with_capacity(expected);
        buf.extend_from_slice(&0_u64.to_le_bytes());

        let built = defrag_build(&mut self.main, &self.ext, &mut buf);
        let committed = built.and_then(|()| {
            if buf.len() == expected {
                Ok(())
            } else {
                Err(SiloError::internal(format!(
                    "defragmented size {} != expected {expected}",
                    buf.len()
                )))
            }
        });
        if let Err(e) = committed {
            // The old arena is untouched; discard the half-rewritten main
            // offsets.
            self.main.load()?;
            return Err(e);
        }

        self.ext.region_mut().replace(buf)?;
        self.flush_main()?;
        info!(freed = wasted, size = expected, "arena defragmented");
        Ok(())
    }
}

/// Rewrite all live data into `buf`, updating main-region offsets in place.
fn defrag_build(main: &mut ShmFile, ext: &Arena, buf: &mut Vec<u8>) -> Result<()> {
    let mod_count = layout::module_count(main.size());

    // 1) All module names, so dependency rewrites can resolve name offsets.
    let mut names: HashMap<String, u64> = HashMap::new();
    for i in 0..mod_count {
        let base = layout::module_base(i);
        let old_name = ModView::new(main.bytes(), base).name();
        let name = ext.str_at(old_name)?.to_owned();
        let new_name = copy_str(ext, buf, old_name)?;
        put_u64_at(main.bytes_mut(), base + modrec::NAME, new_name);
        names.insert(name, new_name);
    }

    // 2) Per module: features, data deps, inverse deps, op deps (with their
    //    nested in/out arrays), change subscriptions per datastore,
    //    operational subscriptions, notification subscriptions.
    for i in 0..mod_count {
        let base = layout::module_base(i);

        let (feats, feat_count) = ModView::new(main.bytes(), base).features();
        let new_feats = copy_offset_array(ext, buf, feats, feat_count)?;
        put_u64_at(main.bytes_mut(), base + modrec::FEATURES, new_feats);

        let (deps, dep_count) = ModView::new(main.bytes(), base).data_deps();
        let new_deps = copy_data_deps(ext, buf, &names, deps, dep_count)?;
        put_u64_at(main.bytes_mut(), base + modrec::DATA_DEPS, new_deps);

        let (inv, inv_count) = ModView::new(main.bytes(), base).inv_deps();
        let new_inv = copy_inv_deps(ext, buf, &names, inv, inv_count)?;
        put_u64_at(main.bytes_mut(), base + modrec::INV_DEPS, new_inv);

        let (ops, op_count) = ModView::new(main.bytes(), base).op_deps();
        let new_ops = copy_op_deps(ext, buf, &names, ops, op_count)?;
        put_u64_at(main.bytes_mut(), base + modrec::OP_DEPS, new_ops);

        for ds in Datastore::ALL {
            let (subs, count) = ModView::new(main.bytes(), base).change_subs(ds);
            let new_subs = copy_record_array_with_xpath(
                ext,
                buf,
                subs,
                count as usize,
                changesub::SIZE,
                changesub::XPATH,
                true,
            )?;
            let (subs_f, _) = change_subs_field(ds);
            put_u64_at(main.bytes_mut(), base + subs_f, new_subs);
        }

        let (oper, oper_count) = ModView::new(main.bytes(), base).oper_subs();
        let new_oper = copy_record_array_with_xpath(
            ext,
            buf,
            oper,
            oper_count as usize,
            opersub::SIZE,
            opersub::XPATH,
            false,
        )?;
        put_u64_at(main.bytes_mut(), base + modrec::OPER_SUBS, new_oper);

        let (notif, notif_count) = ModView::new(main.bytes(), base).notif_subs();
        let new_notif = copy_raw(ext, buf, notif, notif_count as usize * notifsub::SIZE)?;
        put_u64_at(main.bytes_mut(), base + modrec::NOTIF_SUBS, new_notif);
    }

    // 3) The connection-state array, and per connection its event pipes.
    let conns = get_u64_at(main.bytes(), hdr::CONNS);
    let conn_count = get_u32_at(main.bytes(), hdr::CONN_COUNT) as usize;
    let new_conns = copy_raw(ext, buf, conns, conn_count * connstate::SIZE)?;
    put_u64_at(main.bytes_mut(), hdr::CONNS, new_conns);
    for i in 0..conn_count {
        let rec = new_conns as usize + i * connstate::SIZE;
        let evpipes = get_u64_at(buf, rec + connstate::EVPIPES);
        let evpipe_count = get_u32_at(buf, rec + connstate::EVPIPE_COUNT) as usize;
        let new_evpipes = copy_raw(ext, buf, evpipes, evpipe_count * EVPIPE_ENTRY_SIZE)?;
        put_u64_at(buf, rec + connstate::EVPIPES, new_evpipes);
    }

    // 4) The RPC table, and per RPC its subscription array.
    let rpcs = get_u64_at(main.bytes(), hdr::RPCS);
    let rpc_count = get_u32_at(main.bytes(), hdr::RPC_COUNT) as usize;
    let new_rpcs = copy_raw(ext, buf, rpcs, rpc_count * rpc::SIZE)?;
    put_u64_at(main.bytes_mut(), hdr::RPCS, new_rpcs);
    for i in 0..rpc_count {
        let rec = new_rpcs as usize + i * rpc::SIZE;
        let op_path = get_u64_at(buf, rec + rpc::OP_PATH);
        let new_path = copy_str(ext, buf, op_path)?;
        put_u64_at(buf, rec + rpc::OP_PATH, new_path);

        let subs = get_u64_at(buf, rec + rpc::SUBS);
        let sub_count = get_u16_at(buf, rec + rpc::SUB_COUNT) as usize;
        let new_subs = copy_record_array_with_xpath(
            ext,
            buf,
            subs,
            sub_count,
            rpcsub::SIZE,
            rpcsub::XPATH,
            false,
        )?;
        put_u64_at(buf, rec + rpc::SUBS, new_subs);
    }

    debug!(bytes = buf.len(), "defragmented arena built");
    Ok(())
}

/// Copy a NUL-terminated string; returns its offset in `buf`.
fn copy_str(ext: &Arena, buf: &mut Vec<u8>, old: u64) -> Result<u64> {
    let len = ext.strlen_at(old)?;
    let pos = buf.len() as u64;
    buf.extend_from_slice(&ext.bytes()[old as usize..old as usize + len]);
    Ok(pos)
}

/// Copy `len` raw bytes; returns the offset, 0 for an empty range.
fn copy_raw(ext: &Arena, buf: &mut Vec<u8>, old: u64, len: usize) -> Result<u64> {
    if len == 0 {
        return Ok(0);
    }
    ext.check_range(old, len)?;
    let pos = buf.len() as u64;
    buf.extend_from_slice(&ext.bytes()[old as usize..old as usize + len]);
    Ok(pos)
}

/// Copy an array of string offsets, rewriting each entry to its copied
/// string.
fn copy_offset_array(ext: &Arena, buf: &mut Vec<u8>, old: u64, count: u16) -> Result<u64> {
    let count = count as usize;
    let pos = copy_raw(ext, buf, old, count * OFFSET_ENTRY_SIZE)?;
    for i in 0..count {
        let slot = pos as usize + i * OFFSET_ENTRY_SIZE;
        let entry = get_u64_at(buf, slot);
        let new_entry = copy_str(ext, buf, entry)?;
        put_u64_at(buf, slot, new_entry);
    }
    Ok(pos)
}

/// Copy a data-dependency array: referenced-module fields are repointed via
/// the new-name map, xpaths are copied.
fn copy_data_deps(
    ext: &Arena,
    buf: &mut Vec<u8>,
    names: &HashMap<String, u64>,
    old: u64,
    count: u16,
) -> Result<u64> {
    let count = count as usize;
    let pos = copy_raw(ext, buf, old, count * datadep::SIZE)?;
    for i in 0..count {
        let rec = pos as usize + i * datadep::SIZE;
        let module = get_u64_at(buf, rec + datadep::MODULE);
        if module != 0 {
            let name = ext.str_at(module)?;
            let new_module = names
                .get(name)
                .copied()
                .ok_or_else(|| SiloError::internal(format!("dangling module reference \"{name}\"")))?;
            put_u64_at(buf, rec + datadep::MODULE, new_module);
        }
        let xpath = get_u64_at(buf, rec + datadep::XPATH);
        if xpath != 0 {
            let new_xpath = copy_str(ext, buf, xpath)?;
            put_u64_at(buf, rec + datadep::XPATH, new_xpath);
        }
    }
    Ok(pos)
}

/// Copy an inverse-dependency array of module-name offsets.
fn copy_inv_deps(
    ext: &Arena,
    buf: &mut Vec<u8>,
    names: &HashMap<String, u64>,
    old: u64,
    count: u16,
) -> Result<u64> {
    let count = count as usize;
    let pos = copy_raw(ext, buf, old, count * OFFSET_ENTRY_SIZE)?;
    for i in 0..count {
        let slot = pos as usize + i * OFFSET_ENTRY_SIZE;
        let name = ext.str_at(get_u64_at(buf, slot))?;
        let new_entry = names
            .get(name)
            .copied()
            .ok_or_else(|| SiloError::internal(format!("dangling module reference \"{name}\"")))?;
        put_u64_at(buf, slot, new_entry);
    }
    Ok(pos)
}

/// Copy an operation-dependency array with its xpaths and nested in/out
/// dependency arrays.
fn copy_op_deps(
    ext: &Arena,
    buf: &mut Vec<u8>,
    names: &HashMap<String, u64>,
    old: u64,
    count: u16,
) -> Result<u64> {
    let count = count as usize;
    let pos = copy_raw(ext, buf, old, count * opdep::SIZE)?;
    for i in 0..count {
        let rec = pos as usize + i * opdep::SIZE;
        let xpath = get_u64_at(buf, rec + opdep::XPATH);
        if xpath != 0 {
            let new_xpath = copy_str(ext, buf, xpath)?;
            put_u64_at(buf, rec + opdep::XPATH, new_xpath);
        }
        let in_deps = get_u64_at(buf, rec + opdep::IN_DEPS);
        let in_count = get_u16_at(buf, rec + opdep::IN_COUNT);
        let new_in = copy_data_deps(ext, buf, names, in_deps, in_count)?;
        put_u64_at(buf, rec + opdep::IN_DEPS, new_in);
        let out_deps = get_u64_at(buf, rec + opdep::OUT_DEPS);
        let out_count = get_u16_at(buf, rec + opdep::OUT_COUNT);
        let new_out = copy_data_deps(ext, buf, names, out_deps, out_count)?;
        put_u64_at(buf, rec + opdep::OUT_DEPS, new_out);
    }
    Ok(pos)
}

/// Copy a fixed-stride record array whose records carry one xpath field.
fn copy_record_array_with_xpath(
    ext: &Arena,
    buf: &mut Vec<u8>,
    old: u64,
    count: usize,
    stride: usize,
    xpath_field: usize,
    xpath_optional: bool,
) -> Result<u64> {
    let pos = copy_raw(ext, buf, old, count * stride)?;
    for i in 0..count {
        let rec = pos as usize + i * stride;
        let xpath = get_u64_at(buf, rec + xpath_field);
        if xpath == 0 {
            if xpath_optional {
                continue;
            }
            return Err(SiloError::internal("mandatory xpath missing"));
        }
        let new_xpath = copy_str(ext, buf, xpath)?;
        put_u64_at(buf, rec + xpath_field, new_xpath);
    }
    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testutil::temp_conn;
    use crate::registry::{DepSpec, ModuleSpec, OpDepSpec};
    use silo_types::{EvpipeId, SubOptions};

    fn ev(id: u32) -> EvpipeId {
        EvpipeId::new(id).unwrap()
    }

    fn rich_tree() -> Vec<ModuleSpec> {
        vec![
            ModuleSpec {
                name: "m1".into(),
                revision: "2024-01-01".into(),
                replay_support: true,
                features: vec!["f1".into(), "f2".into()],
                data_deps: vec![DepSpec::InstId {
                    xpath: "/m1:target".into(),
                    default_module: Some("m2".into()),
                }],
                inv_deps: vec!["m2".into()],
                op_deps: vec![OpDepSpec {
                    xpath: "/m1:reset".into(),
                    input: vec![DepSpec::Ref {
                        module: "m2".into(),
                    }],
                    output: vec![],
                }],
            },
            ModuleSpec {
                name: "m2".into(),
                revision: "2024-02-02".into(),
                data_deps: vec![DepSpec::Ref {
                    module: "m1".into(),
                }],
                ..ModuleSpec::default()
            },
        ]
    }

    fn populate(conn: &mut ShmConn) {
        conn.add_modules(&rich_tree()).unwrap();
        conn.conn_state_add().unwrap();
        conn.evpipe_add(ev(7)).unwrap();
        conn.change_sub_add(
            "m1",
            Datastore::Running,
            Some("/m1:a"),
            5,
            SubOptions::DEFAULT,
            ev(7),
        )
        .unwrap();
        conn.oper_sub_add("m2", "/m2:state", SubOptions::DEFAULT, ev(7))
            .unwrap();
        conn.notif_sub_add("m1", ev(7)).unwrap();
        let rpc_off = conn.add_rpc("/m1:reset").unwrap();
        conn.rpc_sub_add(rpc_off, "/m1:reset", 1, SubOptions::DEFAULT, ev(7))
            .unwrap();
    }

    #[test]
    fn test_defrag_size_equation() {
        let (_dir, mut conn) = temp_conn();
        populate(&mut conn);

        // Churn to generate waste.
        conn.change_sub_del("m1", Datastore::Running, Some("/m1:a"), 5)
            .unwrap();
        conn.change_sub_add(
            "m1",
            Datastore::Running,
            Some("/m1:a"),
            5,
            SubOptions::DEFAULT,
            ev(7),
        )
        .unwrap();

        let size_before = conn.arena().size();
        let wasted = conn.arena().wasted();
        assert!(wasted > 0);

        conn.defrag().unwrap();
        assert_eq!(conn.arena().size() as u64, size_before as u64 - wasted);
        assert_eq!(conn.arena().wasted(), 0);
    }

    #[test]
    fn test_defrag_idempotent_when_compact() {
        let (_dir, mut conn) = temp_conn();
        populate(&mut conn);
        conn.defrag().unwrap();

        let ext_snapshot = conn.arena().bytes().to_vec();
        let main_snapshot = conn.main().bytes().to_vec();
        conn.defrag().unwrap();
        assert_eq!(conn.arena().bytes(), ext_snapshot.as_slice());
        assert_eq!(conn.main().bytes(), main_snapshot.as_slice());
    }

    #[test]
    fn test_defrag_preserves_content() {
        let (_dir, mut conn) = temp_conn();
        populate(&mut conn);
        conn.change_sub_del("m1", Datastore::Running, Some("/m1:a"), 5)
            .unwrap();
        conn.defrag().unwrap();

        // Modules and their metadata survive bit-for-bit.
        let m1 = conn.find_module("m1").unwrap().expect("m1 present");
        let view = conn.module_view(m1);
        assert_eq!(view.revision(), b"2024-01-01");
        assert_eq!(view.flags() & modrec::FLAG_REPLAY_SUPPORT, 1);
        assert_eq!(view.features().1, 2);
        let (feats, _) = view.features();
        let f0 = get_u64_at(conn.arena().bytes(), feats as usize);
        assert_eq!(conn.arena().str_at(f0).unwrap(), "f1");

        // Cross-module references resolve to the new name offsets.
        let m2 = conn.find_module("m2").unwrap().expect("m2 present");
        let (deps, _) = conn.module_view(m2).data_deps();
        let referenced = get_u64_at(conn.arena().bytes(), deps as usize + datadep::MODULE);
        assert_eq!(referenced, conn.module_view(m1).name());

        // Subscriptions and the RPC table survive.
        let (oper, oper_count) = conn.module_view(m2).oper_subs();
        assert_eq!(oper_count, 1);
        let xp = get_u64_at(conn.arena().bytes(), oper as usize + opersub::XPATH);
        assert_eq!(conn.arena().str_at(xp).unwrap(), "/m2:state");
        assert_eq!(conn.module_view(m1).notif_subs().1, 1);
        assert!(conn.find_rpc("/m1:reset").unwrap().is_some());

        // The connection record kept its event pipe.
        let rec = conn.own_conn_state().unwrap();
        assert_eq!(conn.conn_state_evpipes(rec), vec![7]);
    }

    #[test]
    fn test_defrag_equivalence_after_dep_cycle() {
        // Delete a dependency, add it back, defragment: the live content
        // matches a registry that never churned.
        let (_dir, mut conn) = temp_conn();
        let tree = vec![ModuleSpec {
            name: "m1".into(),
            revision: "2024-01-01".into(),
            features: vec!["f1".into()],
            data_deps: vec![DepSpec::InstId {
                xpath: "/m1:ref".into(),
                default_module: None,
            }],
            ..ModuleSpec::default()
        }];
        conn.add_modules(&tree).unwrap();
        let pristine_ext = conn.arena().bytes().to_vec();

        conn.del_modules_deps().unwrap();
        let expected_waste = (datadep::SIZE + "/m1:ref".len() + 1) as u64;
        assert_eq!(conn.arena().wasted(), expected_waste);
        conn.add_modules(&tree).unwrap();

        conn.defrag().unwrap();
        assert_eq!(conn.arena().wasted(), 0);
        assert_eq!(conn.arena().bytes(), pristine_ext.as_slice());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn module_name(i: usize) -> String {
            format!("mod{i}")
        }

        prop_compose! {
            fn arb_tree()(
                count in 1_usize..5,
                feat_counts in proptest::collection::vec(0_usize..3, 5),
                with_dep in proptest::collection::vec(any::<bool>(), 5),
            ) -> Vec<ModuleSpec> {
                (0..count)
                    .map(|i| ModuleSpec {
                        name: module_name(i),
                        revision: "2024-01-01".into(),
                        features: (0..feat_counts[i])
                            .map(|f| format!("feat{f}"))
                            .collect(),
                        data_deps: if with_dep[i] {
                            vec![DepSpec::Ref { module: module_name(0) }]
                        } else {
                            vec![]
                        },
                        ..ModuleSpec::default()
                    })
                    .collect()
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn defrag_restores_compactness(tree in arb_tree(), churn in 0_u32..4) {
                let (_dir, mut conn) = temp_conn();
                conn.add_modules(&tree).unwrap();
                conn.conn_state_add().unwrap();

                for c in 0..churn {
                    conn.evpipe_add(ev(c + 1)).unwrap();
                    conn.evpipe_del(ev(c + 1)).unwrap();
                }
                conn.verify_ext_consistency().unwrap();

                let size_before = conn.arena().size() as u64;
                let wasted = conn.arena().wasted();
                conn.defrag().unwrap();

                prop_assert_eq!(conn.arena().size() as u64, size_before - wasted);
                prop_assert_eq!(conn.arena().wasted(), 0);
                conn.verify_ext_consistency().unwrap();

                // Every module survived with its metadata intact.
                for spec in &tree {
                    let base = conn.find_module(&spec.name).unwrap().unwrap();
                    let view = conn.module_view(base);
                    prop_assert_eq!(view.features().1 as usize, spec.features.len());
                    prop_assert_eq!(view.data_deps().1 as usize, spec.data_deps.len());
                }
            }
        }
    }
}
