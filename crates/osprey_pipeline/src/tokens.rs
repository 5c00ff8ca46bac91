//! Node identities and the shared id→entry map.
//!
//! Every operator owns a `Token` carrying a stable id and a handle to a
//! shared `NodeMap`. Composing two operators unions their maps (union by
//! rank with path compression); the authority links form a DAG of `Arc`s
//! pointing toward the authoritative map, never a cycle (a self-link is
//! rejected). All reads and writes go through `find_authority`, so every
//! reachable node sees the same entries and relations.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Stable node identifier, drawn from a process-wide counter.
pub type NodeId = u64;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(0);

fn next_node_id() -> NodeId {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Edge kinds of the pipeline graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// `(a, b)`: a pushes items to b.
    Pushes,
    /// `(a, b)`: a pulls items from b.
    Pulls,
    /// `(a, b)`: a's phase must run after b's phase.
    Depends,
}

/// A type-erased forwarded value.
pub type Forward = Arc<dyn Any + Send + Sync>;

/// Scheduler-visible state of one node.
#[derive(Default)]
pub struct NodeEntry {
    pub name: String,
    /// Higher-priority names win when naming a phase.
    pub priority: i32,
    pub memory_fraction: f64,
    pub minimum_memory: u64,
    /// Progress steps this node contributes to its phase.
    pub steps: u64,
    /// Values this node forwards to its successors.
    pub outbox: HashMap<String, Forward>,
    /// Values forwarded to this node by its predecessors.
    pub inbox: HashMap<String, Forward>,
}

struct MapInner {
    entries: BTreeMap<NodeId, NodeEntry>,
    relations: Vec<(NodeId, NodeId, Relation)>,
    /// Union–find link toward the authoritative map.
    authority: Option<NodeMap>,
    rank: u32,
}

/// The shared id→entry map.
#[derive(Clone)]
pub struct NodeMap(Arc<Mutex<MapInner>>);

impl NodeMap {
    pub fn create() -> Self {
        NodeMap(Arc::new(Mutex::new(MapInner {
            entries: BTreeMap::new(),
            relations: Vec::new(),
            authority: None,
            rank: 0,
        })))
    }

    pub fn same_as(&self, other: &NodeMap) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Resolve the authoritative map, compressing the path behind us.
    pub fn find_authority(&self) -> NodeMap {
        let mut root = self.clone();
        loop {
            let next = root.0.lock().authority.clone();
            match next {
                Some(n) => root = n,
                None => break,
            }
        }
        // Path compression: point everything we walked at the root.
        let mut walk = self.clone();
        while !walk.same_as(&root) {
            let next = {
                let mut inner = walk.0.lock();
                let next = inner.authority.clone();
                if next.is_some() {
                    inner.authority = Some(root.clone());
                }
                next
            };
            match next {
                Some(n) => walk = n,
                None => break,
            }
        }
        root
    }

    /// Union this map's class with `other`'s. The higher-rank authority
    /// absorbs the other; a self-union is a no-op.
    pub fn union(&self, other: &NodeMap) {
        let a = self.find_authority();
        let b = other.find_authority();
        if a.same_as(&b) {
            // A self-link would create a reference cycle.
            return;
        }
        let (rank_a, rank_b) = (a.0.lock().rank, b.0.lock().rank);
        let (winner, loser) = if rank_a >= rank_b { (a, b) } else { (b, a) };
        let (entries, relations) = {
            let mut li = loser.0.lock();
            li.authority = Some(winner.clone());
            (std::mem::take(&mut li.entries), std::mem::take(&mut li.relations))
        };
        let mut wi = winner.0.lock();
        wi.entries.extend(entries);
        wi.relations.extend(relations);
        if rank_a == rank_b {
            wi.rank += 1;
        }
    }

    fn register(&self, id: NodeId, entry: NodeEntry) {
        self.find_authority().0.lock().entries.insert(id, entry);
    }

    pub fn add_relation(&self, from: NodeId, to: NodeId, rel: Relation) {
        self.find_authority().0.lock().relations.push((from, to, rel));
    }

    /// Run `f` on the entry for `id`. Returns `None` for unknown ids.
    pub fn with_entry<R>(&self, id: NodeId, f: impl FnOnce(&mut NodeEntry) -> R) -> Option<R> {
        let auth = self.find_authority();
        let mut inner = auth.0.lock();
        inner.entries.get_mut(&id).map(f)
    }

    /// All node ids in discovery order (ids are monotone).
    pub fn ids(&self) -> Vec<NodeId> {
        let auth = self.find_authority();
        let inner = auth.0.lock();
        inner.entries.keys().copied().collect()
    }

    /// Snapshot of the relation list.
    pub fn relations(&self) -> Vec<(NodeId, NodeId, Relation)> {
        let auth = self.find_authority();
        let inner = auth.0.lock();
        inner.relations.clone()
    }
}

/// A node's identity: its id plus a handle to the shared map.
#[derive(Clone)]
pub struct Token {
    id: NodeId,
    map: NodeMap,
}

impl Token {
    /// A fresh token in a fresh map.
    pub fn new(name: impl Into<String>) -> Self {
        let map = NodeMap::create();
        let id = next_node_id();
        map.register(
            id,
            NodeEntry {
                name: name.into(),
                ..NodeEntry::default()
            },
        );
        Token { id, map }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The authoritative map this token belongs to.
    pub fn map(&self) -> NodeMap {
        self.map.find_authority()
    }

    // ── Edges ────────────────────────────────────────────────────────────────

    /// Record that this node pushes items to `dest`, unioning the maps.
    pub fn add_push_destination(&self, dest: &Token) {
        self.map.union(&dest.map);
        self.map.add_relation(self.id, dest.id, Relation::Pushes);
    }

    /// Record that this node pulls items from `source`, unioning the maps.
    pub fn add_pull_destination(&self, source: &Token) {
        self.map.union(&source.map);
        self.map.add_relation(self.id, source.id, Relation::Pulls);
    }

    /// Record that this node's phase must run after `dep`'s phase.
    pub fn add_dependency(&self, dep: &Token) {
        self.map.union(&dep.map);
        self.map.add_relation(self.id, dep.id, Relation::Depends);
    }

    // ── Entry accessors ──────────────────────────────────────────────────────

    pub fn set_name(&self, name: impl Into<String>, priority: i32) {
        let name = name.into();
        self.map.with_entry(self.id, |e| {
            e.name = name;
            e.priority = priority;
        });
    }

    pub fn name(&self) -> String {
        self.map
            .with_entry(self.id, |e| e.name.clone())
            .unwrap_or_default()
    }

    /// Declare this node's memory request.
    pub fn set_memory(&self, fraction: f64, minimum: u64) {
        self.map.with_entry(self.id, |e| {
            e.memory_fraction = fraction;
            e.minimum_memory = minimum;
        });
    }

    /// Declare how many progress steps this node will take in its phase.
    pub fn set_steps(&self, steps: u64) {
        self.map.with_entry(self.id, |e| e.steps = steps);
    }

    // ── Forwarding ───────────────────────────────────────────────────────────

    /// Attach a value for nodes downstream of this one (visible from their
    /// `begin` on).
    pub fn forward<V: Any + Send + Sync>(&self, key: impl Into<String>, value: V) {
        let value: Forward = Arc::new(value);
        self.map.with_entry(self.id, |e| {
            e.outbox.insert(key.into(), value);
        });
    }

    /// Fetch a value forwarded to this node (or that it forwarded itself).
    pub fn fetch<V: Any + Send + Sync + Clone>(&self, key: &str) -> Option<V> {
        self.map
            .with_entry(self.id, |e| {
                e.inbox
                    .get(key)
                    .or_else(|| e.outbox.get(key))
                    .and_then(|v| v.downcast_ref::<V>().cloned())
            })
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_tokens_have_distinct_ids_and_maps() {
        let a = Token::new("a");
        let b = Token::new("b");
        assert_ne!(a.id(), b.id());
        assert!(!a.map().same_as(&b.map()));
    }

    #[test]
    fn test_union_merges_entries_into_one_authority() {
        let a = Token::new("a");
        let b = Token::new("b");
        let c = Token::new("c");
        a.add_push_destination(&b);
        b.add_push_destination(&c);
        let m = a.map();
        assert!(m.same_as(&b.map()));
        assert!(m.same_as(&c.map()));
        assert_eq!(m.ids(), vec![a.id(), b.id(), c.id()]);
        assert_eq!(m.relations().len(), 2);
    }

    #[test]
    fn test_self_union_is_rejected() {
        let a = Token::new("a");
        let b = Token::new("b");
        a.add_push_destination(&b);
        // Union of two tokens already in the same class is a no-op.
        a.map().union(&b.map());
        assert_eq!(a.map().ids().len(), 2);
    }

    #[test]
    fn test_entry_access_through_stale_handle() {
        let a = Token::new("a");
        let b = Token::new("b");
        let stale = a.map.clone();
        a.add_push_destination(&b);
        // The pre-union handle still resolves through the authority chain.
        assert_eq!(
            stale.with_entry(a.id(), |e| e.name.clone()),
            Some("a".to_string())
        );
    }

    #[test]
    fn test_forward_and_fetch_roundtrip() {
        let a = Token::new("a");
        a.forward("items", 42u64);
        assert_eq!(a.fetch::<u64>("items"), Some(42));
        assert_eq!(a.fetch::<u64>("missing"), None);
        // Wrong type yields None rather than a panic.
        assert_eq!(a.fetch::<String>("items"), None);
    }

    #[test]
    fn test_memory_request_recorded() {
        let a = Token::new("a");
        a.set_memory(0.5, 4096);
        let (f, m) = a
            .map()
            .with_entry(a.id(), |e| (e.memory_fraction, e.minimum_memory))
            .unwrap();
        assert_eq!(f, 0.5);
        assert_eq!(m, 4096);
    }

    #[test]
    fn test_union_by_rank_keeps_growing_tree_shallow() {
        // Chain many unions; every token must still resolve to one root.
        let tokens: Vec<Token> = (0..64).map(|i| Token::new(format!("n{i}"))).collect();
        for pair in tokens.windows(2) {
            pair[0].add_push_destination(&pair[1]);
        }
        let root = tokens[0].map();
        assert!(tokens.iter().all(|t| t.map().same_as(&root)));
        assert_eq!(root.ids().len(), 64);
    }
}
