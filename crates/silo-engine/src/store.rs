//! The storage-collaborator seam and an in-memory reference backend.
//!
//! The engine core never touches datastore contents directly: every
//! dispatched operation goes through [`StoreSession`], and sessions are
//! opened through [`DataStore`]. The [`MemStore`] backend implements the
//! same edit-buffer semantics (pending edits visible to their session,
//! applied by commit, dropped by discard) and backs the engine tests.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use silo_error::{Result, SiloError};
use silo_types::{Datastore, EditOptions, ErrorDesc, MoveDirection, Value};

/// Options of a get-items request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetItemsOpts {
    /// Include all descendants, not only direct children.
    pub recursive: bool,
    /// Number of leading matches to skip.
    pub offset: usize,
    /// Maximum number of matches to return; 0 means unlimited.
    pub limit: usize,
}

/// One schema known to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaInfo {
    /// Module name.
    pub name: String,
    /// Revision date.
    pub revision: String,
}

/// One value with the path it lives at.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueEntry {
    /// Full datastore path.
    pub path: String,
    /// The value.
    pub value: Value,
}

/// Factory seam: opens per-session store contexts.
pub trait DataStore: Send + Sync {
    /// Open a session bound to one datastore.
    fn session_start(&self, datastore: Datastore) -> Result<Box<dyn StoreSession>>;
}

/// Per-session storage operations, one method per dispatched request.
pub trait StoreSession: Send {
    fn list_schemas(&mut self) -> Result<Vec<SchemaInfo>>;
    fn get_item(&mut self, path: &str) -> Result<Value>;
    fn get_items(&mut self, path: &str, opts: Option<&GetItemsOpts>) -> Result<Vec<ValueEntry>>;
    fn set_item(&mut self, path: &str, value: Option<&Value>, opts: EditOptions) -> Result<()>;
    fn delete_item(&mut self, path: &str, opts: EditOptions) -> Result<()>;
    fn move_item(&mut self, path: &str, direction: MoveDirection) -> Result<()>;
    /// Check the session's pending edits; a failure carries the per-error
    /// descriptors.
    fn validate(&mut self) -> Result<()>;
    /// Validate and apply the pending edits.
    fn commit(&mut self) -> Result<()>;
    /// Drop the pending edits.
    fn discard_changes(&mut self) -> Result<()>;
    /// Release per-session resources; called exactly once on cleanup.
    fn close(&mut self) {}
}

// ---------------------------------------------------------------------------
// MemStore
// ---------------------------------------------------------------------------

/// In-memory datastore used by the engine tests: an ordered list of
/// `(path, value)` entries per datastore, shared by all sessions, plus a
/// per-session pending edit buffer.
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<MemInner>,
}

struct MemInner {
    schemas: Vec<SchemaInfo>,
    stores: [Mutex<Vec<(String, Value)>>; Datastore::COUNT],
    /// Artificial per-operation latency, for tests exercising slow
    /// requests.
    latency: Option<Duration>,
}

impl MemStore {
    /// Empty store with the given schema list.
    #[must_use]
    pub fn new(schemas: Vec<SchemaInfo>) -> Self {
        Self {
            inner: Arc::new(MemInner {
                schemas,
                stores: [
                    Mutex::new(Vec::new()),
                    Mutex::new(Vec::new()),
                    Mutex::new(Vec::new()),
                ],
                latency: None,
            }),
        }
    }

    /// Same store with every operation sleeping for `latency` first.
    #[must_use]
    pub fn with_latency(schemas: Vec<SchemaInfo>, latency: Duration) -> Self {
        Self {
            inner: Arc::new(MemInner {
                schemas,
                stores: [
                    Mutex::new(Vec::new()),
                    Mutex::new(Vec::new()),
                    Mutex::new(Vec::new()),
                ],
                latency: Some(latency),
            }),
        }
    }

    /// Committed value at `path` in `ds`, for test assertions.
    #[must_use]
    pub fn committed(&self, ds: Datastore, path: &str) -> Option<Value> {
        self.inner.stores[ds.index()]
            .lock()
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, v)| v.clone())
    }
}

impl DataStore for MemStore {
    fn session_start(&self, datastore: Datastore) -> Result<Box<dyn StoreSession>> {
        Ok(Box::new(MemSession {
            inner: Arc::clone(&self.inner),
            datastore,
            pending: Vec::new(),
        }))
    }
}

/// One pending edit in a session's buffer.
#[derive(Debug, Clone)]
enum Edit {
    Set {
        path: String,
        value: Value,
    },
    Delete {
        path: String,
    },
    Move {
        path: String,
        direction: MoveDirection,
    },
}

/// Apply one reorder to an entry list; out-of-range moves are no-ops.
fn apply_move(entries: &mut [(String, Value)], path: &str, direction: MoveDirection) {
    let Some(idx) = entries.iter().position(|(p, _)| p == path) else {
        return;
    };
    match direction {
        MoveDirection::Up if idx > 0 => entries.swap(idx, idx - 1),
        MoveDirection::Down if idx + 1 < entries.len() => entries.swap(idx, idx + 1),
        _ => {}
    }
}

struct MemSession {
    inner: Arc<MemInner>,
    datastore: Datastore,
    pending: Vec<Edit>,
}

impl MemSession {
    fn pause(&self) {
        if let Some(latency) = self.inner.latency {
            std::thread::sleep(latency);
        }
    }

    /// The session's view: committed entries with pending edits applied in
    /// order.
    fn merged(&self) -> Vec<(String, Value)> {
        let mut entries = self.inner.stores[self.datastore.index()].lock().clone();
        for edit in &self.pending {
            match edit {
                Edit::Set { path, value } => {
                    if let Some(slot) = entries.iter_mut().find(|(p, _)| p == path) {
                        slot.1 = value.clone();
                    } else {
                        entries.push((path.clone(), value.clone()));
                    }
                }
                Edit::Delete { path } => entries.retain(|(p, _)| p != path),
                Edit::Move { path, direction } => apply_move(&mut entries, path, *direction),
            }
        }
        entries
    }

    fn exists(&self, path: &str) -> bool {
        self.merged().iter().any(|(p, _)| p == path)
    }

    fn parent_exists(&self, path: &str) -> bool {
        match path.rfind('/') {
            Some(0) | None => true,
            Some(idx) => {
                let parent = &path[..idx];
                self.merged().iter().any(|(p, _)| p == parent)
            }
        }
    }

    fn validation_errors(&self) -> Vec<ErrorDesc> {
        let mut errors = Vec::new();
        for edit in &self.pending {
            let path = match edit {
                Edit::Set { path, .. } | Edit::Delete { path } | Edit::Move { path, .. } => path,
            };
            if !path.starts_with('/') {
                errors.push(ErrorDesc {
                    xpath: Some(path.clone()),
                    message: "path is not absolute".into(),
                });
            }
        }
        errors
    }
}

impl StoreSession for MemSession {
    fn list_schemas(&mut self) -> Result<Vec<SchemaInfo>> {
        self.pause();
        Ok(self.inner.schemas.clone())
    }

    fn get_item(&mut self, path: &str) -> Result<Value> {
        self.pause();
        self.merged()
            .into_iter()
            .find(|(p, _)| p == path)
            .map(|(_, v)| v)
            .ok_or_else(|| SiloError::item_not_found(path))
    }

    fn get_items(&mut self, path: &str, opts: Option<&GetItemsOpts>) -> Result<Vec<ValueEntry>> {
        self.pause();
        let opts = opts.copied().unwrap_or(GetItemsOpts {
            recursive: true,
            offset: 0,
            limit: 0,
        });
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let matches: Vec<ValueEntry> = self
            .merged()
            .into_iter()
            .filter(|(p, _)| {
                p.starts_with(&prefix)
                    && (opts.recursive || !p[prefix.len()..].contains('/'))
            })
            .map(|(path, value)| ValueEntry { path, value })
            .collect();

        if matches.is_empty() {
            return Err(SiloError::item_not_found(path));
        }
        let limited: Vec<ValueEntry> = matches
            .into_iter()
            .skip(opts.offset)
            .take(if opts.limit == 0 {
                usize::MAX
            } else {
                opts.limit
            })
            .collect();
        Ok(limited)
    }

    fn set_item(&mut self, path: &str, value: Option<&Value>, opts: EditOptions) -> Result<()> {
        self.pause();
        if opts.contains(EditOptions::STRICT) && self.exists(path) {
            return Err(SiloError::Validation {
                errors: vec![ErrorDesc {
                    xpath: Some(path.to_owned()),
                    message: "item already exists".into(),
                }],
            });
        }
        if opts.contains(EditOptions::NON_RECURSIVE) && !self.parent_exists(path) {
            return Err(SiloError::item_not_found(path));
        }
        // Creating a list entry or presence container carries no value.
        let value = value.cloned().unwrap_or(Value::Empty);
        self.pending.push(Edit::Set {
            path: path.to_owned(),
            value,
        });
        Ok(())
    }

    fn delete_item(&mut self, path: &str, opts: EditOptions) -> Result<()> {
        self.pause();
        if !self.exists(path) {
            if opts.contains(EditOptions::STRICT) {
                return Err(SiloError::item_not_found(path));
            }
            return Ok(());
        }
        self.pending.push(Edit::Delete {
            path: path.to_owned(),
        });
        Ok(())
    }

    fn move_item(&mut self, path: &str, direction: MoveDirection) -> Result<()> {
        self.pause();
        if !self.exists(path) {
            return Err(SiloError::item_not_found(path));
        }
        self.pending.push(Edit::Move {
            path: path.to_owned(),
            direction,
        });
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.pause();
        let errors = self.validation_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SiloError::Validation { errors })
        }
    }

    fn commit(&mut self) -> Result<()> {
        self.pause();
        let errors = self.validation_errors();
        if !errors.is_empty() {
            return Err(SiloError::Validation { errors });
        }
        let mut entries = self.inner.stores[self.datastore.index()].lock();
        for edit in self.pending.drain(..) {
            match edit {
                Edit::Set { path, value } => {
                    if let Some(slot) = entries.iter_mut().find(|(p, _)| *p == path) {
                        slot.1 = value;
                    } else {
                        entries.push((path, value));
                    }
                }
                Edit::Delete { path } => entries.retain(|(p, _)| *p != path),
                Edit::Move { path, direction } => apply_move(&mut entries, &path, direction),
            }
        }
        Ok(())
    }

    fn discard_changes(&mut self) -> Result<()> {
        self.pause();
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemStore {
        MemStore::new(vec![SchemaInfo {
            name: "ietf-interfaces".into(),
            revision: "2018-02-20".into(),
        }])
    }

    fn session(store: &MemStore) -> Box<dyn StoreSession> {
        store.session_start(Datastore::Running).unwrap()
    }

    #[test]
    fn test_set_visible_to_session_before_commit() {
        let store = store();
        let mut s = session(&store);
        s.set_item("/a", Some(&Value::Int(1)), EditOptions::DEFAULT)
            .unwrap();
        assert_eq!(s.get_item("/a").unwrap(), Value::Int(1));
        // Not committed yet.
        assert_eq!(store.committed(Datastore::Running, "/a"), None);

        s.commit().unwrap();
        assert_eq!(
            store.committed(Datastore::Running, "/a"),
            Some(Value::Int(1))
        );
    }

    #[test]
    fn test_discard_drops_pending() {
        let store = store();
        let mut s = session(&store);
        s.set_item("/a", Some(&Value::Bool(true)), EditOptions::DEFAULT)
            .unwrap();
        s.discard_changes().unwrap();
        assert!(matches!(
            s.get_item("/a"),
            Err(SiloError::ItemNotFound { .. })
        ));
    }

    #[test]
    fn test_strict_set_and_delete() {
        let store = store();
        let mut s = session(&store);
        s.set_item("/a", Some(&Value::Int(1)), EditOptions::DEFAULT)
            .unwrap();
        assert!(matches!(
            s.set_item("/a", Some(&Value::Int(2)), EditOptions::STRICT),
            Err(SiloError::Validation { .. })
        ));
        assert!(matches!(
            s.delete_item("/missing", EditOptions::STRICT),
            Err(SiloError::ItemNotFound { .. })
        ));
        // Non-strict delete of a missing item is a no-op.
        s.delete_item("/missing", EditOptions::DEFAULT).unwrap();
    }

    #[test]
    fn test_non_recursive_set_requires_parent() {
        let store = store();
        let mut s = session(&store);
        assert!(matches!(
            s.set_item("/a/b", Some(&Value::Int(1)), EditOptions::NON_RECURSIVE),
            Err(SiloError::ItemNotFound { .. })
        ));
        s.set_item("/a", None, EditOptions::DEFAULT).unwrap();
        s.set_item("/a/b", Some(&Value::Int(1)), EditOptions::NON_RECURSIVE)
            .unwrap();
    }

    #[test]
    fn test_get_items_children_and_options() {
        let store = store();
        let mut s = session(&store);
        for (p, v) in [
            ("/if/eth0", 0_i64),
            ("/if/eth1", 1),
            ("/if/eth1/mtu", 1500),
        ] {
            s.set_item(p, Some(&Value::Int(v)), EditOptions::DEFAULT)
                .unwrap();
        }
        s.commit().unwrap();

        let direct = s
            .get_items(
                "/if",
                Some(&GetItemsOpts {
                    recursive: false,
                    offset: 0,
                    limit: 0,
                }),
            )
            .unwrap();
        assert_eq!(direct.len(), 2);

        let all = s.get_items("/if", None).unwrap();
        assert_eq!(all.len(), 3);

        let windowed = s
            .get_items(
                "/if",
                Some(&GetItemsOpts {
                    recursive: true,
                    offset: 1,
                    limit: 1,
                }),
            )
            .unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].path, "/if/eth1");

        assert!(matches!(
            s.get_items("/nothing", None),
            Err(SiloError::ItemNotFound { .. })
        ));
    }

    #[test]
    fn test_move_item_reorders() {
        let store = store();
        let mut s = session(&store);
        s.set_item("/l/a", Some(&Value::Int(1)), EditOptions::DEFAULT)
            .unwrap();
        s.set_item("/l/b", Some(&Value::Int(2)), EditOptions::DEFAULT)
            .unwrap();
        s.commit().unwrap();

        s.move_item("/l/b", MoveDirection::Up).unwrap();
        let items = s.get_items("/l", None).unwrap();
        assert_eq!(items[0].path, "/l/b");

        // Moving the head up is a no-op.
        s.move_item("/l/b", MoveDirection::Up).unwrap();
        assert_eq!(s.get_items("/l", None).unwrap()[0].path, "/l/b");

        s.commit().unwrap();
        assert_eq!(s.get_items("/l", None).unwrap()[0].path, "/l/b");
    }

    #[test]
    fn test_move_is_a_pending_edit() {
        let store = store();
        let mut a = session(&store);
        a.set_item("/l/a", Some(&Value::Int(1)), EditOptions::DEFAULT)
            .unwrap();
        a.set_item("/l/b", Some(&Value::Int(2)), EditOptions::DEFAULT)
            .unwrap();
        a.commit().unwrap();

        let mut b = session(&store);
        a.move_item("/l/b", MoveDirection::Up).unwrap();

        // Only the moving session sees the reorder before commit.
        assert_eq!(a.get_items("/l", None).unwrap()[0].path, "/l/b");
        assert_eq!(b.get_items("/l", None).unwrap()[0].path, "/l/a");

        // Discard reverts it.
        a.discard_changes().unwrap();
        assert_eq!(a.get_items("/l", None).unwrap()[0].path, "/l/a");

        // Committed moves become visible everywhere.
        a.move_item("/l/b", MoveDirection::Up).unwrap();
        a.commit().unwrap();
        assert_eq!(b.get_items("/l", None).unwrap()[0].path, "/l/b");
    }

    #[test]
    fn test_move_of_uncommitted_item() {
        let store = store();
        let mut s = session(&store);
        s.set_item("/l/a", Some(&Value::Int(1)), EditOptions::DEFAULT)
            .unwrap();
        s.commit().unwrap();

        // The item exists only in this session's edit buffer.
        s.set_item("/l/b", Some(&Value::Int(2)), EditOptions::DEFAULT)
            .unwrap();
        s.move_item("/l/b", MoveDirection::Up).unwrap();
        assert_eq!(s.get_items("/l", None).unwrap()[0].path, "/l/b");

        assert!(matches!(
            s.move_item("/l/missing", MoveDirection::Up),
            Err(SiloError::ItemNotFound { .. })
        ));

        s.commit().unwrap();
        assert_eq!(s.get_items("/l", None).unwrap()[0].path, "/l/b");
    }

    #[test]
    fn test_validate_reports_bad_paths() {
        let store = store();
        let mut s = session(&store);
        s.set_item("relative", Some(&Value::Int(1)), EditOptions::DEFAULT)
            .unwrap();
        match s.validate() {
            Err(SiloError::Validation { errors }) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].xpath.as_deref(), Some("relative"));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
        // Commit refuses the same edits.
        assert!(matches!(s.commit(), Err(SiloError::Validation { .. })));
    }

    #[test]
    fn test_sessions_are_isolated_until_commit() {
        let store = store();
        let mut a = session(&store);
        let mut b = session(&store);
        a.set_item("/x", Some(&Value::Int(9)), EditOptions::DEFAULT)
            .unwrap();
        assert!(b.get_item("/x").is_err());
        a.commit().unwrap();
        assert_eq!(b.get_item("/x").unwrap(), Value::Int(9));
    }

    #[test]
    fn test_datastores_are_separate() {
        let store = store();
        let mut run = store.session_start(Datastore::Running).unwrap();
        let mut start = store.session_start(Datastore::Startup).unwrap();
        run.set_item("/x", Some(&Value::Int(1)), EditOptions::DEFAULT)
            .unwrap();
        run.commit().unwrap();
        assert!(start.get_item("/x").is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn get_items_window_is_a_slice_of_the_full_result(
                count in 1_usize..20,
                offset in 0_usize..25,
                limit in 0_usize..25,
            ) {
                let store = store();
                let mut s = session(&store);
                for i in 0..count {
                    s.set_item(
                        &format!("/list/e{i:02}"),
                        Some(&Value::Uint(i as u64)),
                        EditOptions::DEFAULT,
                    )
                    .unwrap();
                }
                s.commit().unwrap();

                let full = s.get_items("/list", None).unwrap();
                prop_assert_eq!(full.len(), count);

                let opts = GetItemsOpts { recursive: true, offset, limit };
                match s.get_items("/list", Some(&opts)) {
                    Ok(window) => {
                        let expected: Vec<_> = full
                            .iter()
                            .skip(offset)
                            .take(if limit == 0 { usize::MAX } else { limit })
                            .cloned()
                            .collect();
                        prop_assert_eq!(window, expected);
                    }
                    Err(e) => prop_assert!(
                        false,
                        "windowed get-items failed unexpectedly: {}", e
                    ),
                }
            }
        }
    }
}
