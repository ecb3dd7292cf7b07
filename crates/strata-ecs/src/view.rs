//! Views
//!
//! A [`View`] binds one to eight component types against a snapshot of the
//! archetype graph and iterates every attached entity whose archetype holds
//! all of them. Iteration is lazy and two-level: an outer cursor walks the
//! matching archetypes, an inner cursor walks a member snapshot of one
//! archetype, and column positions are resolved once per archetype.
//!
//! Each item is a [`ViewEntry`] that owns the entity's row lock until it is
//! dropped. Rows moved to another archetype, or detached, after the member
//! snapshot was taken are skipped, and so are rows the calling thread already
//! holds through another entry.
//!
//! The calling thread records every row it holds. Registry operations on a
//! held entity never wait for its lock: structural changes are queued on the
//! entry and applied right after it is dropped, and reads see nothing.

use std::any::TypeId;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, RawMutex};
use rayon::prelude::*;
use smallvec::SmallVec;

use crate::archetype::{Archetype, ArchetypeId};
use crate::component::{Component, ComponentTypeId};
use crate::entity::{Cell, Entity, Row, RowRef};
use crate::graph::NodeSet;
use crate::registry::Registry;

type Columns = SmallVec<[usize; 8]>;

/// Structural change to an entity whose entry the calling thread holds
pub(crate) enum Deferred {
    Add(Vec<Box<dyn Component>>),
    Remove(TypeId),
    Replace(Box<dyn Component>),
    SetEnabled(bool),
    Destroy,
}

struct HeldRow {
    row: usize,
    deferred: Vec<Deferred>,
}

thread_local! {
    static HELD: RefCell<Vec<HeldRow>> = const { RefCell::new(Vec::new()) };
}

fn row_key(row: &RowRef) -> usize {
    Arc::as_ptr(row) as usize
}

/// Whether the calling thread holds `row` through a live [`ViewEntry`]
pub(crate) fn is_held(row: &RowRef) -> bool {
    let key = row_key(row);
    HELD.with(|held| held.borrow().iter().any(|held| held.row == key))
}

/// Queue `op` until the calling thread's entry for `row` is dropped
pub(crate) fn defer(row: &RowRef, op: Deferred) {
    let key = row_key(row);
    HELD.with(|held| {
        if let Some(held) = held.borrow_mut().iter_mut().rev().find(|held| held.row == key) {
            held.deferred.push(op);
        }
    });
}

/// A tuple of one to eight component types
pub trait Query: 'static {
    /// Mutable references to each component of one entity
    type Item<'a>;

    /// `TypeId`s in tuple order
    fn type_ids() -> SmallVec<[TypeId; 8]>;

    /// Downcast components given in tuple order
    fn fetch<'a>(components: SmallVec<[&'a mut dyn Component; 8]>) -> Option<Self::Item<'a>>;
}

macro_rules! impl_query {
    ($($name:ident),+) => {
        impl<$($name: Component),+> Query for ($($name,)+) {
            type Item<'a> = ($(&'a mut $name,)+);

            fn type_ids() -> SmallVec<[TypeId; 8]> {
                let mut ids = SmallVec::new();
                $(ids.push(TypeId::of::<$name>());)+
                ids
            }

            fn fetch<'a>(components: SmallVec<[&'a mut dyn Component; 8]>) -> Option<Self::Item<'a>> {
                let mut components = components.into_iter();
                Some(($(components.next()?.as_any_mut().downcast_mut::<$name>()?,)+))
            }
        }
    };
}

impl_query!(A);
impl_query!(A, B);
impl_query!(A, B, C);
impl_query!(A, B, C, D);
impl_query!(A, B, C, D, E);
impl_query!(A, B, C, D, E, F);
impl_query!(A, B, C, D, E, F, G);
impl_query!(A, B, C, D, E, F, G, H);

/// Borrow the cells at `columns`, in that order
///
/// `columns` must not repeat an index.
fn pick_columns<'a>(cells: &'a mut [Cell], columns: &[usize]) -> Option<SmallVec<[&'a mut dyn Component; 8]>> {
    let mut slots: SmallVec<[Option<&'a mut dyn Component>; 8]> = columns.iter().map(|_| None).collect();
    for (index, cell) in cells.iter_mut().enumerate() {
        if let Some(slot) = columns.iter().position(|column| *column == index) {
            slots[slot] = Some(&mut *cell.value);
        }
    }
    slots.into_iter().collect()
}

fn resolve_columns(archetype: &Archetype, ids: &[ComponentTypeId]) -> Option<Columns> {
    ids.iter().map(|id| archetype.index_of(*id)).collect()
}

/// Typed query over every entity holding all of `Q`'s component types
pub struct View<'r, Q: Query> {
    registry: &'r Registry,
    ids: SmallVec<[ComponentTypeId; 8]>,
    nodes: NodeSet,
    _marker: PhantomData<fn() -> Q>,
}

impl<'r, Q: Query> View<'r, Q> {
    pub(crate) fn new(registry: &'r Registry) -> Self {
        let type_ids = Q::type_ids();
        let resolved: Option<SmallVec<[ComponentTypeId; 8]>> =
            type_ids.iter().map(|type_id| registry.components().id_of(*type_id)).collect();

        let (ids, nodes) = match resolved {
            Some(ids) if !has_duplicates(&ids) => {
                let nodes = registry.graph().find(&ids);
                (ids, nodes)
            }
            // A type no entity ever held, or the same type twice
            _ => (SmallVec::new(), NodeSet::new()),
        };

        Self {
            registry,
            ids,
            nodes,
            _marker: PhantomData,
        }
    }

    /// Narrow to archetypes that also hold every type of `S`
    pub fn include<S: Query>(&mut self) -> &mut Self {
        for type_id in S::type_ids() {
            match self.registry.components().id_of(type_id) {
                Some(id) => self.registry.graph().include(&mut self.nodes, id),
                None => self.nodes.clear(),
            }
        }
        self
    }

    /// Drop archetypes that hold any type of `S`
    pub fn exclude<S: Query>(&mut self) -> &mut Self {
        for type_id in S::type_ids() {
            if let Some(id) = self.registry.components().id_of(type_id) {
                self.registry.graph().exclude(&mut self.nodes, id);
            }
        }
        self
    }

    /// Lazy iterator over matching entities
    pub fn iter(&self) -> ViewIter<'_, Q> {
        let archetypes: Vec<Arc<Archetype>> = self.nodes.values().map(|node| Arc::clone(node.archetype())).collect();
        ViewIter {
            registry: self.registry,
            ids: &self.ids,
            archetypes: archetypes.into_iter(),
            cursor: None,
            _marker: PhantomData,
        }
    }

    /// Visit every matching entity on the calling thread
    ///
    /// `f` may add, remove, replace, disable, or destroy the visited entity
    /// through the registry; those changes land as soon as `f` returns. An
    /// entity moved into a matching archetype the visit has not reached yet
    /// is visited again there.
    pub fn for_each(&self, mut f: impl FnMut(&mut ViewEntry<'_, Q>)) {
        for mut entry in self.iter() {
            f(&mut entry);
        }
    }

    /// Visit every matching entity on the current rayon pool
    ///
    /// Inside a scheduler system this runs on the scheduler's fork-join pool.
    pub fn par_for_each(&self, f: impl Fn(&mut ViewEntry<'_, Q>) + Send + Sync) {
        let candidates: Vec<(Entity, RowRef, ArchetypeId, Columns)> = self
            .nodes
            .values()
            .filter_map(|node| {
                let archetype = node.archetype();
                let columns = resolve_columns(archetype, &self.ids)?;
                Some((archetype.id(), columns, archetype.snapshot()))
            })
            .flat_map(|(archetype, columns, members)| {
                members
                    .into_iter()
                    .map(move |(entity, row)| (entity, row, archetype, columns.clone()))
            })
            .collect();

        candidates.into_par_iter().for_each(|(entity, row, archetype, columns)| {
            if let Some(mut entry) = ViewEntry::lock(self.registry, entity, &row, archetype, columns) {
                f(&mut entry);
            }
        });
    }

    /// Matching entities at this instant
    pub fn entities(&self) -> Vec<Entity> {
        self.iter().map(|entry| entry.entity()).collect()
    }

    /// Number of matching entities
    pub fn count(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Number of archetypes in the bound snapshot
    pub fn archetype_count(&self) -> usize {
        self.nodes.len()
    }

    /// Archetypes in the bound snapshot
    pub fn archetypes(&self) -> Vec<Arc<Archetype>> {
        self.nodes.values().map(|node| Arc::clone(node.archetype())).collect()
    }

    /// Component type ids bound at construction
    pub fn component_types(&self) -> &[ComponentTypeId] {
        &self.ids
    }
}

impl<'v, 'r, Q: Query> IntoIterator for &'v View<'r, Q> {
    type Item = ViewEntry<'v, Q>;
    type IntoIter = ViewIter<'v, Q>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<Q: Query> fmt::Debug for View<'_, Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("types", &self.ids)
            .field("archetypes", &self.nodes.len())
            .finish()
    }
}

fn has_duplicates(ids: &[ComponentTypeId]) -> bool {
    ids.iter().enumerate().any(|(i, id)| ids[..i].contains(id))
}

struct Cursor {
    archetype: ArchetypeId,
    columns: Columns,
    members: std::vec::IntoIter<(Entity, RowRef)>,
}

/// Iterator returned by [`View::iter`]
pub struct ViewIter<'v, Q: Query> {
    registry: &'v Registry,
    ids: &'v [ComponentTypeId],
    archetypes: std::vec::IntoIter<Arc<Archetype>>,
    cursor: Option<Cursor>,
    _marker: PhantomData<fn() -> Q>,
}

impl<'v, Q: Query> Iterator for ViewIter<'v, Q> {
    type Item = ViewEntry<'v, Q>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(cursor) = &mut self.cursor {
                for (entity, row) in cursor.members.by_ref() {
                    let columns = cursor.columns.clone();
                    if let Some(entry) = ViewEntry::lock(self.registry, entity, &row, cursor.archetype, columns) {
                        return Some(entry);
                    }
                }
            }

            let archetype = self.archetypes.next()?;
            self.cursor = resolve_columns(&archetype, self.ids).map(|columns| Cursor {
                archetype: archetype.id(),
                columns,
                members: archetype.snapshot().into_iter(),
            });
        }
    }
}

/// One matching entity, holding its row lock
///
/// While an entry is alive no other thread can read or change its entity,
/// so drop it before waiting on anything that might need that entity. On
/// the thread that holds it, registry calls for the entity do not block:
/// `add`, `remove`, `replace`, `set_enabled`, and `destroy` are queued and
/// run in order right after the entry is dropped (they report `true` for
/// the boolean forms and `None` otherwise), while reads such as `get` or
/// `contains` report nothing. Read the entity through [`get`](Self::get)
/// and [`contains`](Self::contains) instead.
///
/// Two threads that each hold an entry and then touch the other's entity
/// deadlock. Systems sharing a cluster must work on disjoint entities.
pub struct ViewEntry<'r, Q: Query> {
    registry: &'r Registry,
    entity: Entity,
    /// Always `Some` until dropped
    row: Option<ArcMutexGuard<RawMutex, Row>>,
    key: usize,
    columns: Columns,
    _marker: PhantomData<fn() -> Q>,
}

impl<'r, Q: Query> ViewEntry<'r, Q> {
    fn lock(
        registry: &'r Registry,
        entity: Entity,
        row: &RowRef,
        archetype: ArchetypeId,
        columns: Columns,
    ) -> Option<Self> {
        // Relocking would deadlock
        if is_held(row) {
            return None;
        }
        let guard = row.lock_arc();
        if !guard.is_member_of(archetype) {
            return None;
        }

        let key = row_key(row);
        HELD.with(|held| {
            held.borrow_mut().push(HeldRow {
                row: key,
                deferred: Vec::new(),
            })
        });
        Some(Self {
            registry,
            entity,
            row: Some(guard),
            key,
            columns,
            _marker: PhantomData,
        })
    }

    pub fn entity(&self) -> Entity {
        self.entity
    }

    /// Mutable references to the viewed components, in query order
    pub fn components(&mut self) -> Q::Item<'_> {
        let columns = &self.columns;
        let item = self
            .row
            .as_deref_mut()
            .and_then(|row| pick_columns(&mut row.cells, columns))
            .and_then(Q::fetch);
        let Some(item) = item else {
            unreachable!("row of {} does not match its archetype columns", self.entity);
        };
        item
    }

    /// Clone of any component of the entity, viewed or not
    pub fn get<T: Component + Clone>(&self) -> Option<T> {
        let ty = self.registry.components().id::<T>()?;
        let cell = self.row.as_deref()?.cells.iter().find(|cell| cell.ty == ty)?;
        cell.value.as_any().downcast_ref::<T>().cloned()
    }

    pub fn contains<T: Component>(&self) -> bool {
        let Some(ty) = self.registry.components().id::<T>() else {
            return false;
        };
        self.row
            .as_deref()
            .is_some_and(|row| row.cells.iter().any(|cell| cell.ty == ty))
    }
}

impl<Q: Query> Drop for ViewEntry<'_, Q> {
    fn drop(&mut self) {
        let deferred = HELD.with(|held| {
            let mut held = held.borrow_mut();
            match held.iter().rposition(|held| held.row == self.key) {
                Some(index) => held.remove(index).deferred,
                None => Vec::new(),
            }
        });
        drop(self.row.take());

        if std::thread::panicking() {
            return;
        }
        for op in deferred {
            self.registry.apply_deferred(self.entity, op);
        }
    }
}

impl<Q: Query> fmt::Debug for ViewEntry<'_, Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewEntry")
            .field("entity", &self.entity)
            .field("archetype", &self.row.as_deref().map(|row| row.archetype))
            .finish()
    }
}
