//! Debug rendering of the arena: every live span as `(start, size, name)`,
//! sorted, with the gaps in between reported as wasted.
//!
//! Besides tracing output, the span enumeration doubles as the correctness
//! oracle for the no-overlap and wasted-bytes invariants.

use std::fmt::Write as _;

use silo_error::{Result, SiloError};
use silo_types::encoding::{get_u16_at, get_u32_at, get_u64_at};
use silo_types::Datastore;
use tracing::debug;

use crate::arena::WASTED_SIZE;
use crate::conn::ShmConn;
use crate::layout::{
    self, changesub, connstate, datadep, hdr, notifsub, opdep, opersub, rpc, rpcsub,
    EVPIPE_ENTRY_SIZE, OFFSET_ENTRY_SIZE,
};

/// One live arena span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    /// Arena offset of the first byte.
    pub start: u64,
    /// Span length in bytes.
    pub size: usize,
    /// Human-readable description.
    pub name: String,
}

impl ShmConn {
    /// Enumerate every live arena span, sorted by start offset.
    pub fn ext_spans(&self) -> Result<Vec<Span>> {
        let mut spans = vec![Span {
            start: 0,
            size: WASTED_SIZE,
            name: format!("ext wasted {}", self.ext.wasted()),
        }];

        // Connection state and per-connection event pipes.
        let conns = get_u64_at(self.main.bytes(), hdr::CONNS);
        let conn_count = get_u32_at(self.main.bytes(), hdr::CONN_COUNT) as usize;
        if conns != 0 {
            spans.push(Span {
                start: conns,
                size: conn_count * connstate::SIZE,
                name: format!("connections ({conn_count})"),
            });
        }
        for i in 0..conn_count {
            let rec = conns as usize + i * connstate::SIZE;
            let evpipes = get_u64_at(self.ext.bytes(), rec + connstate::EVPIPES);
            let evpipe_count = get_u32_at(self.ext.bytes(), rec + connstate::EVPIPE_COUNT);
            let conn_id = get_u64_at(self.ext.bytes(), rec + connstate::CONN_ID);
            if evpipes != 0 {
                spans.push(Span {
                    start: evpipes,
                    size: evpipe_count as usize * EVPIPE_ENTRY_SIZE,
                    name: format!("evpipes ({evpipe_count}, conn {conn_id})"),
                });
            }
        }

        // RPCs, their operation paths, and their subscriptions.
        let rpcs = get_u64_at(self.main.bytes(), hdr::RPCS);
        let rpc_count = get_u32_at(self.main.bytes(), hdr::RPC_COUNT) as usize;
        if rpcs != 0 {
            spans.push(Span {
                start: rpcs,
                size: rpc_count * rpc::SIZE,
                name: format!("rpcs ({rpc_count})"),
            });
        }
        for i in 0..rpc_count {
            let rec = rpcs as usize + i * rpc::SIZE;
            let op_path = get_u64_at(self.ext.bytes(), rec + rpc::OP_PATH);
            let op_path_str = self.ext.str_at(op_path)?.to_owned();
            spans.push(Span {
                start: op_path,
                size: self.ext.strlen_at(op_path)?,
                name: format!("rpc op_path (\"{op_path_str}\")"),
            });

            let subs = get_u64_at(self.ext.bytes(), rec + rpc::SUBS);
            let sub_count = get_u16_at(self.ext.bytes(), rec + rpc::SUB_COUNT) as usize;
            if subs != 0 {
                spans.push(Span {
                    start: subs,
                    size: sub_count * rpcsub::SIZE,
                    name: format!("rpc subs ({sub_count}, op_path \"{op_path_str}\")"),
                });
            }
            for j in 0..sub_count {
                let sub = subs as usize + j * rpcsub::SIZE;
                let xpath = get_u64_at(self.ext.bytes(), sub + rpcsub::XPATH);
                spans.push(Span {
                    start: xpath,
                    size: self.ext.strlen_at(xpath)?,
                    name: format!("rpc sub xpath (op_path \"{op_path_str}\")"),
                });
            }
        }

        // Modules.
        for m in 0..self.module_count() {
            let base = layout::module_base(m);
            let view = self.module_view(base);
            let name_off = view.name();
            let mod_name = self.ext.str_at(name_off)?.to_owned();
            spans.push(Span {
                start: name_off,
                size: self.ext.strlen_at(name_off)?,
                name: format!("module name (\"{mod_name}\")"),
            });

            let (feats, feat_count) = view.features();
            if feats != 0 {
                spans.push(Span {
                    start: feats,
                    size: feat_count as usize * OFFSET_ENTRY_SIZE,
                    name: format!("features ({feat_count}, mod \"{mod_name}\")"),
                });
                for i in 0..feat_count as usize {
                    let f = get_u64_at(self.ext.bytes(), feats as usize + i * OFFSET_ENTRY_SIZE);
                    spans.push(Span {
                        start: f,
                        size: self.ext.strlen_at(f)?,
                        name: format!(
                            "feature name (\"{}\", mod \"{mod_name}\")",
                            self.ext.str_at(f)?
                        ),
                    });
                }
            }

            let (deps, dep_count) = view.data_deps();
            self.data_dep_spans(deps, dep_count, "data deps", &mod_name, &mut spans)?;

            let (inv, inv_count) = view.inv_deps();
            if inv != 0 {
                spans.push(Span {
                    start: inv,
                    size: inv_count as usize * OFFSET_ENTRY_SIZE,
                    name: format!("inv data deps ({inv_count}, mod \"{mod_name}\")"),
                });
            }

            let (ops, op_count) = view.op_deps();
            if ops != 0 {
                spans.push(Span {
                    start: ops,
                    size: op_count as usize * opdep::SIZE,
                    name: format!("op deps ({op_count}, mod \"{mod_name}\")"),
                });
            }
            for i in 0..op_count as usize {
                let rec = ops as usize + i * opdep::SIZE;
                let xpath = get_u64_at(self.ext.bytes(), rec + opdep::XPATH);
                spans.push(Span {
                    start: xpath,
                    size: self.ext.strlen_at(xpath)?,
                    name: format!("op dep xpath (mod \"{mod_name}\")"),
                });
                let in_deps = get_u64_at(self.ext.bytes(), rec + opdep::IN_DEPS);
                let in_count = get_u16_at(self.ext.bytes(), rec + opdep::IN_COUNT);
                self.data_dep_spans(in_deps, in_count, "op input data deps", &mod_name, &mut spans)?;
                let out_deps = get_u64_at(self.ext.bytes(), rec + opdep::OUT_DEPS);
                let out_count = get_u16_at(self.ext.bytes(), rec + opdep::OUT_COUNT);
                self.data_dep_spans(
                    out_deps,
                    out_count,
                    "op output data deps",
                    &mod_name,
                    &mut spans,
                )?;
            }

            for ds in Datastore::ALL {
                let (subs, count) = view.change_subs(ds);
                if subs != 0 {
                    spans.push(Span {
                        start: subs,
                        size: count as usize * changesub::SIZE,
                        name: format!("{ds} change subs ({count}, mod \"{mod_name}\")"),
                    });
                }
                for i in 0..count as usize {
                    let rec = subs as usize + i * changesub::SIZE;
                    let xpath = get_u64_at(self.ext.bytes(), rec + changesub::XPATH);
                    if xpath != 0 {
                        spans.push(Span {
                            start: xpath,
                            size: self.ext.strlen_at(xpath)?,
                            name: format!("{ds} change sub xpath (mod \"{mod_name}\")"),
                        });
                    }
                }
            }

            let (oper, oper_count) = view.oper_subs();
            if oper != 0 {
                spans.push(Span {
                    start: oper,
                    size: oper_count as usize * opersub::SIZE,
                    name: format!("oper subs ({oper_count}, mod \"{mod_name}\")"),
                });
            }
            for i in 0..oper_count as usize {
                let rec = oper as usize + i * opersub::SIZE;
                let xpath = get_u64_at(self.ext.bytes(), rec + opersub::XPATH);
                spans.push(Span {
                    start: xpath,
                    size: self.ext.strlen_at(xpath)?,
                    name: format!("oper sub xpath (mod \"{mod_name}\")"),
                });
            }

            let (notif, notif_count) = view.notif_subs();
            if notif != 0 {
                spans.push(Span {
                    start: notif,
                    size: notif_count as usize * notifsub::SIZE,
                    name: format!("notif subs ({notif_count}, mod \"{mod_name}\")"),
                });
            }
        }

        spans.sort_by_key(|s| s.start);
        Ok(spans)
    }

    fn data_dep_spans(
        &self,
        deps: u64,
        count: u16,
        label: &str,
        mod_name: &str,
        spans: &mut Vec<Span>,
    ) -> Result<()> {
        if deps == 0 {
            return Ok(());
        }
        spans.push(Span {
            start: deps,
            size: count as usize * datadep::SIZE,
            name: format!("{label} ({count}, mod \"{mod_name}\")"),
        });
        for i in 0..count as usize {
            let rec = deps as usize + i * datadep::SIZE;
            let xpath = get_u64_at(self.ext.bytes(), rec + datadep::XPATH);
            if xpath != 0 {
                spans.push(Span {
                    start: xpath,
                    size: self.ext.strlen_at(xpath)?,
                    name: format!("{label} xpath (mod \"{mod_name}\")"),
                });
            }
        }
        Ok(())
    }

    /// Render the arena layout at debug level: contiguous spans interleaved
    /// with the detected gaps.
    pub fn ext_print(&self) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        let spans = match self.ext_spans() {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "arena span enumeration failed");
                return;
            }
        };

        let mut msg = String::new();
        let mut cur = 0_u64;
        for span in &spans {
            if span.start > cur {
                let _ = writeln!(
                    msg,
                    "{cur:04}-{:04}: (wasted {})",
                    span.start,
                    span.start - cur
                );
            }
            let _ = writeln!(
                msg,
                "{:04}-{:04}: {}",
                span.start,
                span.start + span.size as u64,
                span.name
            );
            cur = span.start + span.size as u64;
        }
        let size = self.ext.size() as u64;
        if cur < size {
            let _ = writeln!(msg, "{cur:04}-{size:04}: (wasted {})", size - cur);
        }
        debug!("#EXT SHM:\n{msg}");
    }

    /// The invariant oracle: spans must not overlap, every span must lie
    /// inside the mapping, and the gaps must sum to exactly the wasted
    /// counter.
    pub fn verify_ext_consistency(&self) -> Result<()> {
        let spans = self.ext_spans()?;
        let size = self.ext.size() as u64;
        let mut cur = 0_u64;
        let mut gaps = 0_u64;
        for span in &spans {
            let end = span.start + span.size as u64;
            if span.start < cur {
                return Err(SiloError::internal(format!(
                    "span overlap at {} (\"{}\")",
                    span.start, span.name
                )));
            }
            if end > size {
                return Err(SiloError::OffsetOutOfBounds {
                    offset: span.start,
                    size: size as usize,
                });
            }
            gaps += span.start - cur;
            cur = end;
        }
        gaps += size - cur;
        if gaps != self.ext.wasted() {
            return Err(SiloError::internal(format!(
                "gap total {gaps} != wasted counter {}",
                self.ext.wasted()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testutil::temp_conn;
    use crate::registry::{DepSpec, ModuleSpec};
    use silo_types::{EvpipeId, SubOptions};

    #[test]
    fn test_empty_arena_single_span() {
        let (_dir, conn) = temp_conn();
        let spans = conn.ext_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, 0);
        assert_eq!(spans[0].size, WASTED_SIZE);
        conn.verify_ext_consistency().unwrap();
    }

    #[test]
    fn test_spans_cover_all_live_data() {
        let (_dir, mut conn) = temp_conn();
        conn.add_modules(&[ModuleSpec {
            name: "m1".into(),
            revision: "2024-01-01".into(),
            features: vec!["f1".into()],
            data_deps: vec![DepSpec::InstId {
                xpath: "/m1:x".into(),
                default_module: None,
            }],
            ..ModuleSpec::default()
        }])
        .unwrap();
        conn.conn_state_add().unwrap();
        conn.evpipe_add(EvpipeId::new(3).unwrap()).unwrap();
        let rpc_off = conn.add_rpc("/m1:go").unwrap();
        conn.rpc_sub_add(rpc_off, "/m1:go", 0, SubOptions::DEFAULT, EvpipeId::new(3).unwrap())
            .unwrap();

        conn.verify_ext_consistency().unwrap();

        // With zero churn the spans tile the arena exactly.
        let spans = conn.ext_spans().unwrap();
        let covered: usize = spans.iter().map(|s| s.size).sum();
        assert_eq!(covered as u64 + conn.arena().wasted(), conn.arena().size() as u64);
    }

    #[test]
    fn test_oracle_detects_gaps_as_wasted() {
        let (_dir, mut conn) = temp_conn();
        conn.add_modules(&[ModuleSpec::new("m1", "2024-01-01")])
            .unwrap();
        conn.conn_state_add().unwrap();
        conn.evpipe_add(EvpipeId::new(1).unwrap()).unwrap();
        conn.evpipe_del(EvpipeId::new(1).unwrap()).unwrap();

        assert!(conn.arena().wasted() > 0);
        conn.verify_ext_consistency().unwrap();
    }

    #[test]
    fn test_oracle_detects_counter_drift() {
        let (_dir, mut conn) = temp_conn();
        conn.add_modules(&[ModuleSpec::new("m1", "2024-01-01")])
            .unwrap();
        // Forge a wasted value no gap accounts for.
        conn.ext.add_wasted(3);
        assert!(conn.verify_ext_consistency().is_err());
    }

    #[test]
    fn test_print_does_not_panic() {
        let (_dir, mut conn) = temp_conn();
        conn.add_modules(&[ModuleSpec::new("m1", "2024-01-01")])
            .unwrap();
        conn.ext_print();
    }
}
