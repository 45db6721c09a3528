//! Identity-stable entity caches.
//!
//! A [`Reconciler`] owns the authoritative key → state map of one entity kind
//! and the ordered list of [`CachedEntity`] wrappers handed out to callers.
//! Every refresh replaces the map wholesale and keeps each wrapper whose key
//! is still reported, so a caller holding a wrapper keeps a live view of the
//! same entity across refreshes. A wrapper whose key disappears answers from
//! its last-known-good snapshot instead.
//!
//! Wrappers point back at their reconciler through a [`Weak`] handle; the
//! reconciler alone owns the wrapper list.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tracing::debug;
use truenas_core::{ClientError, FieldMap, FieldValue, Result};
use truenas_ddp::MethodInvoker;

use crate::job::JobWaiter;

/// One kind of server-side entity.
pub trait EntityKind: Sized + Send + Sync + 'static {
    /// Stable identity of one entity.
    type Key: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync;
    /// Typed state decoded from one query row.
    type State: Clone + fmt::Debug + Send + Sync;

    /// Entity name used in errors and logs.
    const NAME: &'static str;
    /// Query method returning every entity of this kind.
    const QUERY_METHOD: &'static str;
    /// Fields selected from [`QUERY_METHOD`](Self::QUERY_METHOD).
    const SELECT: &'static [&'static str];

    /// Decode one query row into its key and state.
    fn decode(row: &FieldMap) -> Result<(Self::Key, Self::State)>;

    /// Parameters for [`QUERY_METHOD`](Self::QUERY_METHOD): no filters, the
    /// [`SELECT`](Self::SELECT) list as options.
    fn query_params() -> Vec<Value> {
        vec![json!([]), json!({ "select": Self::SELECT })]
    }
}

type StateMap<K> = HashMap<<K as EntityKind>::Key, <K as EntityKind>::State>;

struct Shared<K: EntityKind> {
    invoker: Arc<dyn MethodInvoker>,
    jobs: Option<Arc<JobWaiter>>,
    /// Replaced, never mutated in place.
    state: RwLock<Arc<StateMap<K>>>,
    entities: Mutex<Vec<Arc<CachedEntity<K>>>>,
}

impl<K: EntityKind> Shared<K> {
    fn current(&self, key: &K::Key) -> Option<K::State> {
        let map = Arc::clone(&self.state.read());
        map.get(key).cloned()
    }

    fn patch(&self, key: &K::Key, apply: impl FnOnce(&mut K::State)) -> bool {
        let mut guard = self.state.write();
        let mut next = StateMap::<K>::clone(&guard);
        let Some(state) = next.get_mut(key) else {
            return false;
        };
        apply(state);
        *guard = Arc::new(next);
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reconciler
// ─────────────────────────────────────────────────────────────────────────────

/// Cache of one entity kind.
///
/// Cloning yields another handle to the same cache.
pub struct Reconciler<K: EntityKind> {
    shared: Arc<Shared<K>>,
}

impl<K: EntityKind> Clone for Reconciler<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: EntityKind> fmt::Debug for Reconciler<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("kind", &K::NAME)
            .field("entities", &self.shared.entities.lock().len())
            .finish_non_exhaustive()
    }
}

impl<K: EntityKind> Reconciler<K> {
    /// An empty cache that queries through `invoker`.
    pub fn new(invoker: Arc<dyn MethodInvoker>) -> Self {
        Self::build(invoker, None)
    }

    /// An empty cache whose entities can run job-backed operations.
    pub fn with_jobs(invoker: Arc<dyn MethodInvoker>, jobs: Arc<JobWaiter>) -> Self {
        Self::build(invoker, Some(jobs))
    }

    fn build(invoker: Arc<dyn MethodInvoker>, jobs: Option<Arc<JobWaiter>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                invoker,
                jobs,
                state: RwLock::new(Arc::new(HashMap::new())),
                entities: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Fetch every entity of this kind and reconcile.
    pub async fn refresh(&self) -> Result<Vec<Arc<CachedEntity<K>>>> {
        let result = self
            .shared
            .invoker
            .invoke(K::QUERY_METHOD, K::query_params())
            .await?;
        let rows = query_rows(K::QUERY_METHOD, result)?;
        self.reconcile_rows(&rows)
    }

    /// Decode raw rows and reconcile.
    ///
    /// A row that fails to decode fails the whole refresh and leaves the
    /// cache untouched.
    pub fn reconcile_rows(&self, rows: &[FieldMap]) -> Result<Vec<Arc<CachedEntity<K>>>> {
        let decoded = rows.iter().map(K::decode).collect::<Result<Vec<_>>>()?;
        Ok(self.reconcile(decoded))
    }

    /// Replace the authoritative map with `rows` and rebuild the wrapper list.
    ///
    /// Wrappers whose key is still present keep their identity and relative
    /// order; wrappers for new keys follow, in row order. A key reported
    /// twice keeps its last state.
    pub fn reconcile(&self, rows: Vec<(K::Key, K::State)>) -> Vec<Arc<CachedEntity<K>>> {
        let mut order = Vec::with_capacity(rows.len());
        let mut map = HashMap::with_capacity(rows.len());
        for (key, state) in rows {
            if map.insert(key.clone(), state).is_none() {
                order.push(key);
            }
        }
        let map = Arc::new(map);

        let mut entities = self.shared.entities.lock();
        *self.shared.state.write() = Arc::clone(&map);

        let mut next: Vec<_> = entities
            .iter()
            .filter(|entity| map.contains_key(&entity.key))
            .cloned()
            .collect();
        let kept = next.len();
        let known: HashSet<K::Key> = next.iter().map(|entity| entity.key.clone()).collect();
        for key in order {
            if known.contains(&key) {
                continue;
            }
            if let Some(state) = map.get(&key) {
                let snapshot = state.clone();
                next.push(Arc::new(CachedEntity {
                    key,
                    owner: Arc::downgrade(&self.shared),
                    snapshot: Mutex::new(snapshot),
                }));
            }
        }

        debug!(
            kind = K::NAME,
            kept,
            added = next.len() - kept,
            dropped = entities.len() - kept,
            "reconciled"
        );
        entities.clone_from(&next);
        next
    }

    /// Wrappers from the last refresh, without a network call.
    pub fn entities(&self) -> Vec<Arc<CachedEntity<K>>> {
        self.shared.entities.lock().clone()
    }

    /// The exposed wrapper for `key`, if the last refresh reported it.
    pub fn get(&self, key: &K::Key) -> Option<Arc<CachedEntity<K>>> {
        self.shared
            .entities
            .lock()
            .iter()
            .find(|entity| &entity.key == key)
            .cloned()
    }

    /// Number of entities reported by the last refresh.
    pub fn len(&self) -> usize {
        self.shared.entities.lock().len()
    }

    /// Whether the last refresh reported nothing (or none ran yet).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn invoker(&self) -> Arc<dyn MethodInvoker> {
        Arc::clone(&self.shared.invoker)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wrapper
// ─────────────────────────────────────────────────────────────────────────────

/// A caller-facing handle to one entity.
///
/// Reads go through to the reconciler's current map while the key is
/// present there, refreshing the snapshot as they go. Once the key is gone
/// (or the reconciler is dropped) reads return the snapshot.
pub struct CachedEntity<K: EntityKind> {
    key: K::Key,
    owner: Weak<Shared<K>>,
    snapshot: Mutex<K::State>,
}

impl<K: EntityKind> fmt::Debug for CachedEntity<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedEntity")
            .field("kind", &K::NAME)
            .field("key", &self.key)
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

impl<K: EntityKind> CachedEntity<K> {
    /// Stable key of this entity.
    pub fn key(&self) -> &K::Key {
        &self.key
    }

    /// Whether the server reported this entity in the last refresh.
    pub fn is_available(&self) -> bool {
        self.live().is_some()
    }

    fn live(&self) -> Option<K::State> {
        self.owner.upgrade()?.current(&self.key)
    }

    /// Read the live state, or the snapshot once the entity is gone.
    pub fn read<R>(&self, f: impl FnOnce(&K::State) -> R) -> R {
        let mut snapshot = self.snapshot.lock();
        if let Some(live) = self.live() {
            *snapshot = live;
        }
        f(&snapshot)
    }

    /// Read an attribute that has no meaningful last-known-good value.
    ///
    /// Fails with [`ClientError::Precondition`] once the entity is gone.
    pub fn read_live<R>(&self, attribute: &str, f: impl FnOnce(&K::State) -> R) -> Result<R> {
        let Some(live) = self.live() else {
            return Err(ClientError::Precondition(format!(
                "{} {} is no longer available, cannot read {attribute}",
                K::NAME,
                self.key
            )));
        };
        let out = f(&live);
        *self.snapshot.lock() = live;
        Ok(out)
    }

    /// A copy of the current (or last-known-good) state.
    pub fn state(&self) -> K::State {
        self.read(Clone::clone)
    }

    fn owner(&self) -> Result<Arc<Shared<K>>> {
        self.owner
            .upgrade()
            .ok_or_else(|| ClientError::Precondition(format!("{} cache was dropped", K::NAME)))
    }

    pub(crate) fn invoker(&self) -> Result<Arc<dyn MethodInvoker>> {
        Ok(Arc::clone(&self.owner()?.invoker))
    }

    pub(crate) fn jobs(&self) -> Result<Arc<JobWaiter>> {
        self.owner()?.jobs.clone().ok_or_else(|| {
            ClientError::Precondition(format!("{} cache has no job waiter", K::NAME))
        })
    }

    /// Apply `apply` to this entity's state in a fresh copy of the map.
    pub(crate) fn patch(&self, apply: impl FnOnce(&mut K::State)) -> bool {
        self.owner
            .upgrade()
            .is_some_and(|owner| owner.patch(&self.key, apply))
    }
}

/// Split a query result into its rows.
pub(crate) fn query_rows(method: &str, result: FieldValue) -> Result<Vec<FieldMap>> {
    let items = match result {
        FieldValue::List(items) => items,
        other => {
            return Err(ClientError::ProtocolViolation(format!(
                "{method} returned {}, expected a list",
                other.type_name()
            )));
        }
    };
    items
        .into_iter()
        .map(|item| match item {
            FieldValue::Map(row) => Ok(row),
            other => Err(ClientError::ProtocolViolation(format!(
                "{method} returned a {} row, expected a map",
                other.type_name()
            ))),
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedInvoker;
    use assert_matches::assert_matches;
    use truenas_core::value::FieldMapExt;

    #[derive(Debug)]
    struct Widget;

    #[derive(Clone, Debug, PartialEq)]
    struct WidgetState {
        name: String,
        size: i64,
    }

    impl EntityKind for Widget {
        type Key = String;
        type State = WidgetState;

        const NAME: &'static str = "widget";
        const QUERY_METHOD: &'static str = "widget.query";
        const SELECT: &'static [&'static str] = &["serial", "name", "size"];

        fn decode(row: &FieldMap) -> Result<(String, WidgetState)> {
            Ok((
                row.require_str("widget", "serial")?.to_string(),
                WidgetState {
                    name: row.require_str("widget", "name")?.to_string(),
                    size: row.require_i64("widget", "size")?,
                },
            ))
        }
    }

    fn rows(items: &[(&str, &str, i64)]) -> Vec<(String, WidgetState)> {
        items
            .iter()
            .map(|(key, name, size)| {
                (
                    (*key).to_string(),
                    WidgetState {
                        name: (*name).to_string(),
                        size: *size,
                    },
                )
            })
            .collect()
    }

    fn keys(entities: &[Arc<CachedEntity<Widget>>]) -> Vec<String> {
        entities.iter().map(|e| e.key().clone()).collect()
    }

    fn reconciler() -> Reconciler<Widget> {
        Reconciler::new(Arc::new(ScriptedInvoker::new()))
    }

    #[test]
    fn identical_refreshes_return_same_instances_in_order() {
        let cache = reconciler();
        let first = cache.reconcile(rows(&[("a", "one", 1), ("b", "two", 2), ("c", "three", 3)]));
        let second = cache.reconcile(rows(&[("a", "one", 1), ("b", "two", 2), ("c", "three", 3)]));

        assert_eq!(first.len(), 3);
        for (before, after) in first.iter().zip(&second) {
            assert!(Arc::ptr_eq(before, after));
        }
    }

    #[test]
    fn kept_wrappers_come_first_then_new_keys() {
        let cache = reconciler();
        let first = cache.reconcile(rows(&[("b", "two", 2), ("a", "one", 1)]));
        let second = cache.reconcile(rows(&[("c", "three", 3), ("a", "one", 1), ("b", "two", 2)]));

        assert_eq!(keys(&second), vec!["b", "a", "c"]);
        assert!(Arc::ptr_eq(&first[0], &second[0]));
        assert!(Arc::ptr_eq(&first[1], &second[1]));
    }

    #[test]
    fn live_reads_follow_the_latest_refresh() {
        let cache = reconciler();
        let first = cache.reconcile(rows(&[("a", "one", 1)]));
        let _ = cache.reconcile(rows(&[("a", "renamed", 10)]));

        assert!(first[0].is_available());
        assert_eq!(first[0].read(|s| s.name.clone()), "renamed");
        assert_eq!(first[0].state().size, 10);
    }

    #[test]
    fn disappeared_entity_keeps_snapshot() {
        let cache = reconciler();
        let first = cache.reconcile(rows(&[("a", "one", 1), ("b", "two", 2)]));
        let held = Arc::clone(&first[0]);
        let _ = held.state();

        let second = cache.reconcile(rows(&[("b", "two", 2)]));

        assert_eq!(keys(&second), vec!["b"]);
        assert!(!held.is_available());
        assert_eq!(held.read(|s| s.name.clone()), "one");
        assert_eq!(held.state().size, 1);
    }

    #[test]
    fn disappeared_entity_fails_live_reads() {
        let cache = reconciler();
        let first = cache.reconcile(rows(&[("a", "one", 1)]));
        assert_eq!(first[0].read_live("size", |s| s.size).unwrap(), 1);

        let _ = cache.reconcile(Vec::new());

        let err = first[0].read_live("size", |s| s.size).unwrap_err();
        assert_matches!(err, ClientError::Precondition(msg) if msg.contains("widget a"));
    }

    #[test]
    fn snapshot_is_the_last_state_seen_while_live() {
        let cache = reconciler();
        let first = cache.reconcile(rows(&[("a", "one", 1)]));
        let _ = cache.reconcile(rows(&[("a", "two", 2)]));
        let _ = first[0].state();
        let _ = cache.reconcile(rows(&[("a", "three", 3)]));
        let _ = cache.reconcile(Vec::new());

        // The "three" state was never read, so the snapshot is still "two".
        assert_eq!(first[0].state().name, "two");
    }

    #[test]
    fn reappearing_key_gets_a_new_wrapper() {
        let cache = reconciler();
        let first = cache.reconcile(rows(&[("a", "one", 1)]));
        let _ = cache.reconcile(Vec::new());
        let third = cache.reconcile(rows(&[("a", "one", 1)]));

        assert!(!Arc::ptr_eq(&first[0], &third[0]));
        // The old wrapper reads live again since the key is back.
        assert!(first[0].is_available());
    }

    #[test]
    fn duplicate_keys_keep_the_last_row() {
        let cache = reconciler();
        let entities = cache.reconcile(rows(&[("a", "one", 1), ("a", "uno", 11)]));

        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].state().name, "uno");
    }

    #[test]
    fn entities_and_get_reflect_last_refresh() {
        let cache = reconciler();
        assert!(cache.is_empty());
        let first = cache.reconcile(rows(&[("a", "one", 1), ("b", "two", 2)]));

        assert_eq!(cache.len(), 2);
        assert!(Arc::ptr_eq(&cache.entities()[1], &first[1]));
        assert!(Arc::ptr_eq(&cache.get(&"b".to_string()).unwrap(), &first[1]));
        assert!(cache.get(&"z".to_string()).is_none());
    }

    #[test]
    fn patch_replaces_the_map() {
        let cache = reconciler();
        let first = cache.reconcile(rows(&[("a", "one", 1)]));
        let before = Arc::clone(&cache.shared.state.read());

        assert!(first[0].patch(|s| s.size = 99));

        assert_eq!(first[0].state().size, 99);
        assert_eq!(before.get("a").unwrap().size, 1);
    }

    #[test]
    fn patch_of_missing_key_is_a_noop() {
        let cache = reconciler();
        let first = cache.reconcile(rows(&[("a", "one", 1)]));
        let _ = cache.reconcile(Vec::new());

        assert!(!first[0].patch(|s| s.size = 99));
        assert_eq!(first[0].state().size, 1);
    }

    #[test]
    fn dropped_reconciler_falls_back_to_snapshot() {
        let cache = reconciler();
        let first = cache.reconcile(rows(&[("a", "one", 1)]));
        drop(cache);

        assert!(!first[0].is_available());
        assert_eq!(first[0].state().name, "one");
        assert_matches!(first[0].invoker().err(), Some(ClientError::Precondition(_)));
    }

    #[test]
    fn job_operations_need_a_job_waiter() {
        let cache = reconciler();
        let first = cache.reconcile(rows(&[("a", "one", 1)]));

        assert_matches!(first[0].jobs(), Err(ClientError::Precondition(msg)) if msg.contains("no job waiter"));
    }

    #[tokio::test]
    async fn refresh_queries_with_select_list() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.reply(
            "widget.query",
            json!([
                {"serial": "a", "name": "one", "size": 1},
                {"serial": "b", "name": "two", "size": 2}
            ]),
        );
        let cache: Reconciler<Widget> = Reconciler::new(invoker.clone());

        let entities = cache.refresh().await.unwrap();

        assert_eq!(keys(&entities), vec!["a", "b"]);
        assert_eq!(
            invoker.calls(),
            vec![(
                "widget.query".to_string(),
                vec![json!([]), json!({"select": ["serial", "name", "size"]})]
            )]
        );
    }

    #[tokio::test]
    async fn bad_row_leaves_cache_untouched() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.reply("widget.query", json!([{"serial": "a", "name": "one", "size": 1}]));
        invoker.reply("widget.query", json!([{"serial": "b", "name": "two", "size": "big"}]));
        let cache: Reconciler<Widget> = Reconciler::new(invoker);

        let first = cache.refresh().await.unwrap();
        let err = cache.refresh().await.unwrap_err();

        assert_matches!(err, ClientError::Decode { entity: "widget", .. });
        assert!(first[0].is_available());
        assert_eq!(keys(&cache.entities()), vec!["a"]);
    }

    #[tokio::test]
    async fn non_list_result_is_a_protocol_violation() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.reply("widget.query", json!({"serial": "a"}));
        let cache: Reconciler<Widget> = Reconciler::new(invoker);

        let err = cache.refresh().await.unwrap_err();
        assert_matches!(err, ClientError::ProtocolViolation(msg) if msg.contains("expected a list"));
    }

    #[tokio::test]
    async fn remote_error_propagates() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.fail("widget.query", "[ENOENT] no widgets");
        let cache: Reconciler<Widget> = Reconciler::new(invoker);

        let err = cache.refresh().await.unwrap_err();
        assert_matches!(err, ClientError::RemoteMethod { method, .. } if method == "widget.query");
    }
}
