//! Archetype graph
//!
//! Index from component types to every archetype containing them. Each
//! single-type node `{T}` holds a linked set of every node whose signature
//! contains `T`, itself included, so "all archetypes containing A and B" is
//! the intersection of the linked sets of `{A}` and `{B}`.
//!
//! Node creation is insert-if-absent on a [`DashMap`]. A node is visible in
//! the map before it is linked into its single-type nodes, so every caller
//! that reaches an unindexed node links it before handing out its archetype.
//! Linking is idempotent. Linked sets are
//! persistent [`im::OrdMap`]s, so handing a snapshot to a view is a cheap
//! structural-sharing clone. A snapshot never picks up archetypes created
//! after it was taken.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::archetype::{Archetype, ArchetypeId};
use crate::component::ComponentTypeId;

/// Canonical (sorted, deduplicated) component-type signature
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchetypeKey(SmallVec<[ComponentTypeId; 8]>);

impl ArchetypeKey {
    pub fn new(types: impl IntoIterator<Item = ComponentTypeId>) -> Self {
        let mut types: SmallVec<[ComponentTypeId; 8]> = types.into_iter().collect();
        types.sort_unstable();
        types.dedup();
        Self(types)
    }

    pub fn single(ty: ComponentTypeId) -> Self {
        let mut types = SmallVec::new();
        types.push(ty);
        Self(types)
    }

    pub fn types(&self) -> &[ComponentTypeId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Snapshot of matching nodes, keyed by signature
pub type NodeSet = im::OrdMap<ArchetypeKey, Arc<ArchetypeNode>>;

/// One archetype plus the nodes whose signatures are supersets of it
pub struct ArchetypeNode {
    archetype: Arc<Archetype>,
    linked: RwLock<NodeSet>,
    /// Set once this node is in the linked set of each of its types
    indexed: AtomicBool,
}

impl ArchetypeNode {
    fn new(archetype: Arc<Archetype>) -> Self {
        Self {
            archetype,
            linked: RwLock::new(NodeSet::new()),
            indexed: AtomicBool::new(false),
        }
    }

    fn is_indexed(&self) -> bool {
        self.indexed.load(Ordering::Acquire)
    }

    pub fn archetype(&self) -> &Arc<Archetype> {
        &self.archetype
    }

    /// Snapshot of the linked set
    pub fn linked(&self) -> NodeSet {
        self.linked.read().clone()
    }

    fn link(&self, key: ArchetypeKey, node: Arc<ArchetypeNode>) {
        self.linked.write().insert(key, node);
    }
}

impl fmt::Debug for ArchetypeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchetypeNode")
            .field("archetype", &self.archetype.id())
            .field("linked", &self.linked.read().len())
            .finish()
    }
}

/// Concurrent index of every archetype in a registry
pub struct ArchetypeGraph {
    nodes: DashMap<ArchetypeKey, Arc<ArchetypeNode>>,
    /// All archetypes, indexed by id
    archetypes: RwLock<Vec<Arc<Archetype>>>,
    base: Arc<Archetype>,
}

impl ArchetypeGraph {
    pub fn new() -> Self {
        let base = Arc::new(Archetype::base());
        Self {
            nodes: DashMap::new(),
            archetypes: RwLock::new(vec![Arc::clone(&base)]),
            base,
        }
    }

    /// The zero-component archetype
    pub fn base(&self) -> &Arc<Archetype> {
        &self.base
    }

    /// Look up or lazily create the archetype for a set of types
    ///
    /// Types may be given in any order; duplicates are ignored.
    pub fn get_or_create(&self, types: &[(ComponentTypeId, &'static str)]) -> Arc<Archetype> {
        let key = ArchetypeKey::new(types.iter().map(|(ty, _)| *ty));
        if key.is_empty() {
            return Arc::clone(&self.base);
        }
        let existing = self.nodes.get(&key).map(|node| Arc::clone(node.value()));
        let node = match existing {
            Some(node) => node,
            None => self.insert(&key, types),
        };
        if !node.is_indexed() {
            self.index(key, &node, types);
        }
        Arc::clone(node.archetype())
    }

    fn insert(&self, key: &ArchetypeKey, types: &[(ComponentTypeId, &'static str)]) -> Arc<ArchetypeNode> {
        let entry = self.nodes.entry(key.clone()).or_insert_with(|| {
            let mut archetypes = self.archetypes.write();
            let archetype = Arc::new(Archetype::new(ArchetypeId(archetypes.len() as u32), types));
            archetypes.push(Arc::clone(&archetype));
            log::trace!("Created {}", archetype);
            Arc::new(ArchetypeNode::new(archetype))
        });
        Arc::clone(entry.value())
    }

    /// Link `node` into the single-type node of each of its types
    fn index(&self, key: ArchetypeKey, node: &Arc<ArchetypeNode>, types: &[(ComponentTypeId, &'static str)]) {
        if key.len() == 1 {
            node.link(key, Arc::clone(node));
        } else {
            for &(ty, name) in types {
                let single = self.single_node(ty, name);
                single.link(key.clone(), Arc::clone(node));
            }
        }
        node.indexed.store(true, Ordering::Release);
    }

    fn single_node(&self, ty: ComponentTypeId, name: &'static str) -> Arc<ArchetypeNode> {
        let key = ArchetypeKey::single(ty);
        let existing = self.nodes.get(&key).map(|node| Arc::clone(node.value()));
        let node = match existing {
            Some(node) => node,
            None => self.insert(&key, &[(ty, name)]),
        };
        if !node.is_indexed() {
            self.index(key, &node, &[(ty, name)]);
        }
        node
    }

    /// Node for an exact signature
    pub fn node(&self, key: &ArchetypeKey) -> Option<Arc<ArchetypeNode>> {
        self.nodes.get(key).map(|node| Arc::clone(node.value()))
    }

    /// Every node whose signature contains all of `types`
    ///
    /// A type that no archetype contains yields an empty set.
    pub fn find(&self, types: &[ComponentTypeId]) -> NodeSet {
        let Some((first, rest)) = types.split_first() else {
            return NodeSet::new();
        };
        let mut set = match self.nodes.get(&ArchetypeKey::single(*first)) {
            Some(node) => node.linked(),
            None => return NodeSet::new(),
        };
        for &ty in rest {
            self.include(&mut set, ty);
            if set.is_empty() {
                break;
            }
        }
        set
    }

    /// Keep only nodes that also contain `ty`
    pub fn include(&self, set: &mut NodeSet, ty: ComponentTypeId) {
        let Some(linked) = self.nodes.get(&ArchetypeKey::single(ty)).map(|node| node.linked()) else {
            set.clear();
            return;
        };
        let stale: Vec<ArchetypeKey> = set.keys().filter(|key| !linked.contains_key(*key)).cloned().collect();
        for key in stale {
            set.remove(&key);
        }
    }

    /// Drop every node that contains `ty`
    pub fn exclude(&self, set: &mut NodeSet, ty: ComponentTypeId) {
        let single = ArchetypeKey::single(ty);
        let linked = self.nodes.get(&single).map(|node| node.linked());
        set.remove(&single);
        if let Some(linked) = linked {
            for key in linked.keys() {
                set.remove(key);
            }
        }
    }

    /// Archetype by id
    pub fn archetype(&self, id: ArchetypeId) -> Option<Arc<Archetype>> {
        self.archetypes.read().get(id.0 as usize).cloned()
    }

    /// All archetypes, base first
    pub fn archetypes(&self) -> Vec<Arc<Archetype>> {
        self.archetypes.read().clone()
    }

    /// Number of archetypes, base included
    pub fn len(&self) -> usize {
        self.archetypes.read().len()
    }

    /// Whether only the base archetype exists
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Tear down every node and archetype except the base
    pub fn clear(&self) {
        self.unlink_all();
        self.nodes.clear();
        self.archetypes.write().truncate(1);
    }

    // Self-links and superset links form Arc cycles.
    fn unlink_all(&self) {
        for node in self.nodes.iter() {
            node.linked.write().clear();
        }
    }
}

impl Default for ArchetypeGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ArchetypeGraph {
    fn drop(&mut self) {
        self.unlink_all();
    }
}

impl fmt::Display for ArchetypeGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.base)?;
        let mut singles: Vec<(ArchetypeKey, Arc<ArchetypeNode>)> = self
            .nodes
            .iter()
            .filter(|node| node.key().len() == 1)
            .map(|node| (node.key().clone(), Arc::clone(node.value())))
            .collect();
        singles.sort_by(|a, b| a.0.cmp(&b.0));

        for (_, node) in singles {
            writeln!(f, "{}", node.archetype())?;
            for (key, linked) in node.linked().iter() {
                if key.len() > 1 {
                    writeln!(f, "  -> {}", linked.archetype())?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ArchetypeGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchetypeGraph")
            .field("nodes", &self.nodes.len())
            .field("archetypes", &self.len())
            .finish()
    }
}
