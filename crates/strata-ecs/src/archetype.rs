//! Archetypes
//!
//! An archetype owns every entity sharing one exact component-type
//! signature. Columns are kept in ascending [`ComponentTypeId`] order, so the
//! signature is canonical regardless of the order components were supplied
//! in, and every member row lists its cells in that same order.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::component::{Component, ComponentTypeId};
use crate::entity::{Cell, Entity, EntityAllocator, Row, RowRef};

/// Archetype identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchetypeId(pub u32);

impl ArchetypeId {
    /// The zero-component archetype
    pub const BASE: ArchetypeId = ArchetypeId(0);
}

/// Attached members, kept dense with swap-remove
#[derive(Default)]
struct Members {
    entities: Vec<Entity>,
    rows: Vec<RowRef>,
}

/// Storage for all entities with one component-type signature
pub struct Archetype {
    id: ArchetypeId,
    /// Component types in column order
    columns: SmallVec<[ComponentTypeId; 8]>,
    type_names: SmallVec<[&'static str; 8]>,
    members: RwLock<Members>,
}

impl Archetype {
    /// The distinguished zero-component archetype
    pub(crate) fn base() -> Self {
        Self::new(ArchetypeId::BASE, &[])
    }

    pub(crate) fn new(id: ArchetypeId, types: &[(ComponentTypeId, &'static str)]) -> Self {
        let mut sorted: SmallVec<[(ComponentTypeId, &'static str); 8]> = types.iter().copied().collect();
        sorted.sort_unstable_by_key(|(ty, _)| *ty);
        sorted.dedup_by_key(|(ty, _)| *ty);

        Self {
            id,
            columns: sorted.iter().map(|(ty, _)| *ty).collect(),
            type_names: sorted.iter().map(|(_, name)| *name).collect(),
            members: RwLock::new(Members::default()),
        }
    }

    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// Component types in column order
    pub fn types(&self) -> &[ComponentTypeId] {
        &self.columns
    }

    pub fn type_names(&self) -> &[&'static str] {
        &self.type_names
    }

    pub fn is_base(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column position of `ty`
    ///
    /// The base archetype answers `Some(0)` for every type; callers never
    /// read cells through it.
    pub fn index_of(&self, ty: ComponentTypeId) -> Option<usize> {
        if self.is_base() {
            return Some(0);
        }
        self.columns.binary_search(&ty).ok()
    }

    pub fn contains(&self, ty: ComponentTypeId) -> bool {
        !self.is_base() && self.columns.binary_search(&ty).is_ok()
    }

    /// Number of attached members
    pub fn len(&self) -> usize {
        self.members.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attached members at this instant
    pub fn entities(&self) -> Vec<Entity> {
        self.members.read().entities.clone()
    }

    pub(crate) fn snapshot(&self) -> Vec<(Entity, RowRef)> {
        let members = self.members.read();
        members
            .entities
            .iter()
            .copied()
            .zip(members.rows.iter().cloned())
            .collect()
    }

    /// Reorder `cells` in place to this archetype's column order
    pub(crate) fn canonicalize(&self, cells: &mut [Cell]) {
        for i in 1..cells.len() {
            let mut j = i;
            while j > 0 && cells[j - 1].ty > cells[j].ty {
                cells.swap(j - 1, j);
                j -= 1;
            }
        }
        debug_assert!(
            cells.len() == self.columns.len() && cells.iter().zip(&self.columns).all(|(cell, ty)| cell.ty == *ty),
            "row does not match archetype {}",
            self
        );
    }

    /// Allocate a new entity holding `cells` and attach it here
    pub(crate) fn create_entity(self: &Arc<Self>, allocator: &mut EntityAllocator, cells: Vec<Cell>) -> Entity {
        let row_ref: RowRef = Arc::new(Mutex::new(Row::new(self.id, cells)));
        let entity = allocator.allocate(Arc::clone(&row_ref), Arc::clone(self));
        let mut row = row_ref.lock();
        self.attach(allocator, entity, &mut row, &row_ref);
        drop(row);
        entity
    }

    /// Bind an existing entity and its row to this archetype
    ///
    /// The caller holds the row lock; the entity must currently be detached.
    pub(crate) fn attach(
        self: &Arc<Self>,
        allocator: &mut EntityAllocator,
        entity: Entity,
        row: &mut Row,
        row_ref: &RowRef,
    ) -> bool {
        let Some(occupant) = allocator.occupant_mut(entity) else {
            return false;
        };
        if occupant.member.is_some() {
            return false;
        }

        self.canonicalize(&mut row.cells);
        row.archetype = self.id;
        row.attached = true;

        let mut members = self.members.write();
        members.entities.push(entity);
        members.rows.push(Arc::clone(row_ref));
        occupant.member = Some(members.entities.len() - 1);
        occupant.archetype = Arc::clone(self);
        occupant.row = Arc::clone(row_ref);
        true
    }

    /// Remove an attached entity from the member list, leaving its row intact
    ///
    /// The caller holds the row lock.
    pub(crate) fn detach(&self, allocator: &mut EntityAllocator, entity: Entity, row: &mut Row) -> bool {
        let Some(index) = allocator.occupant(entity).and_then(|occupant| occupant.member) else {
            return false;
        };

        let moved = {
            let mut members = self.members.write();
            debug_assert_eq!(members.entities.get(index), Some(&entity));
            members.entities.swap_remove(index);
            members.rows.swap_remove(index);
            members.entities.get(index).copied()
        };

        if let Some(moved) = moved {
            if let Some(occupant) = allocator.occupant_mut(moved) {
                occupant.member = Some(index);
            }
        }
        if let Some(occupant) = allocator.occupant_mut(entity) {
            occupant.member = None;
        }
        row.attached = false;
        true
    }

    /// Free the entity's slot and hand back its components
    ///
    /// Works on attached and detached entities. The caller holds the row lock.
    pub(crate) fn destroy(
        &self,
        allocator: &mut EntityAllocator,
        entity: Entity,
        row: &mut Row,
    ) -> Option<Vec<Box<dyn Component>>> {
        allocator.occupant(entity)?;
        self.detach(allocator, entity, row);
        allocator.free(entity);
        Some(row.take_values())
    }
}

impl fmt::Display for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Archetype#{}[", self.id.0)?;
        for (i, name) in self.type_names.iter().copied().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            let short = name.rsplit("::").next().unwrap_or(name);
            write!(f, "{}", short)?;
        }
        write!(f, "] ({} entities)", self.len())
    }
}

impl fmt::Debug for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("columns", &self.columns)
            .field("len", &self.len())
            .finish()
    }
}
