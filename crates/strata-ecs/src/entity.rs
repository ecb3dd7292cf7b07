//! Entities
//!
//! An [`Entity`] is a generational handle that stays stable for the entire
//! life of the entity, across every archetype move. Its component row lives
//! behind a shared lock so that view entries can keep it borrowed while the
//! registry moves other rows around.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::archetype::{Archetype, ArchetypeId};
use crate::component::{Bundle, Component, ComponentTypeId};
use crate::error::EcsResult;
use crate::event::{Signal, SignalCallback};
use crate::registry::Registry;

/// Entity identifier with generation counter for stable IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Entity {
    /// Slot index
    index: u32,
    /// Generation counter to detect stale references
    generation: u32,
}

impl Entity {
    /// Create a new entity with the given index and generation
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Get the entity index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Get the entity generation
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Liveness of an entity handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityStatus {
    /// Member of its archetype; all accessors work
    Attached,
    /// Still owned by the registry but disabled; accessors fail until it is
    /// re-enabled
    Detached,
    /// Destroyed or released; the handle is permanently inert
    Released,
}

/// One component value tagged with its type id
#[derive(Debug)]
pub(crate) struct Cell {
    pub ty: ComponentTypeId,
    pub value: Box<dyn Component>,
}

/// Component row of one entity, laid out in its archetype's column order
#[derive(Debug)]
pub(crate) struct Row {
    pub archetype: ArchetypeId,
    pub attached: bool,
    pub cells: Vec<Cell>,
}

impl Row {
    pub fn new(archetype: ArchetypeId, cells: Vec<Cell>) -> Self {
        Self {
            archetype,
            attached: false,
            cells,
        }
    }

    /// Whether this row still belongs to `archetype` as an active member
    pub fn is_member_of(&self, archetype: ArchetypeId) -> bool {
        self.attached && self.archetype == archetype
    }

    pub fn take_values(&mut self) -> Vec<Box<dyn Component>> {
        std::mem::take(&mut self.cells)
            .into_iter()
            .map(|cell| cell.value)
            .collect()
    }
}

pub(crate) type RowRef = Arc<Mutex<Row>>;

/// Registry-side record of a live entity
pub(crate) struct Occupant {
    pub row: RowRef,
    pub archetype: Arc<Archetype>,
    /// Position in the archetype's member list; `None` while detached
    pub member: Option<usize>,
}

enum SlotState {
    Vacant,
    Occupied(Occupant),
}

struct EntitySlot {
    generation: u32,
    state: SlotState,
}

/// Generational slot allocator
///
/// Hands out recyclable indices. Freeing a slot bumps its generation so that
/// every outstanding handle to it reports [`EntityStatus::Released`].
#[derive(Default)]
pub(crate) struct EntityAllocator {
    slots: Vec<EntitySlot>,
    free_indices: Vec<u32>,
    live: usize,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a slot and register `row` in it, initially detached
    pub fn allocate(&mut self, row: RowRef, archetype: Arc<Archetype>) -> Entity {
        let occupant = Occupant {
            row,
            archetype,
            member: None,
        };
        self.live += 1;
        if let Some(index) = self.free_indices.pop() {
            let slot = &mut self.slots[index as usize];
            slot.state = SlotState::Occupied(occupant);
            return Entity::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(EntitySlot {
            generation: 0,
            state: SlotState::Occupied(occupant),
        });
        Entity::new(index, 0)
    }

    /// Free the slot of `entity`, returning what it held
    pub fn free(&mut self, entity: Entity) -> Option<Occupant> {
        let slot = self.slot_mut(entity)?;
        let SlotState::Occupied(occupant) = std::mem::replace(&mut slot.state, SlotState::Vacant) else {
            return None;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free_indices.push(entity.index());
        self.live -= 1;
        Some(occupant)
    }

    pub fn occupant(&self, entity: Entity) -> Option<&Occupant> {
        match &self.slot(entity)?.state {
            SlotState::Occupied(occupant) => Some(occupant),
            SlotState::Vacant => None,
        }
    }

    pub fn occupant_mut(&mut self, entity: Entity) -> Option<&mut Occupant> {
        match &mut self.slot_mut(entity)?.state {
            SlotState::Occupied(occupant) => Some(occupant),
            SlotState::Vacant => None,
        }
    }

    /// Occupant of an attached entity only
    pub fn attached(&self, entity: Entity) -> Option<&Occupant> {
        self.occupant(entity).filter(|occupant| occupant.member.is_some())
    }

    pub fn status(&self, entity: Entity) -> EntityStatus {
        match self.occupant(entity) {
            Some(Occupant { member: Some(_), .. }) => EntityStatus::Attached,
            Some(Occupant { member: None, .. }) => EntityStatus::Detached,
            None => EntityStatus::Released,
        }
    }

    /// Number of live (attached or detached) entities
    pub fn len(&self) -> usize {
        self.live
    }

    /// Handles of every live entity
    pub fn live_entities(&self) -> Vec<Entity> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot.state, SlotState::Occupied(_)))
            .map(|(index, slot)| Entity::new(index as u32, slot.generation))
            .collect()
    }

    fn slot(&self, entity: Entity) -> Option<&EntitySlot> {
        self.slots
            .get(entity.index() as usize)
            .filter(|slot| slot.generation == entity.generation())
    }

    fn slot_mut(&mut self, entity: Entity) -> Option<&mut EntitySlot> {
        self.slots
            .get_mut(entity.index() as usize)
            .filter(|slot| slot.generation == entity.generation())
    }
}

/// Convenience handle pairing an [`Entity`] with its registry
///
/// Every method delegates to the corresponding [`Registry`] operation.
#[derive(Clone, Copy)]
pub struct EntityRef<'r> {
    registry: &'r Registry,
    entity: Entity,
}

impl<'r> EntityRef<'r> {
    pub(crate) fn new(registry: &'r Registry, entity: Entity) -> Self {
        Self { registry, entity }
    }

    pub fn id(&self) -> Entity {
        self.entity
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    pub fn status(&self) -> EntityStatus {
        self.registry.status(self.entity)
    }

    pub fn is_enabled(&self) -> bool {
        self.registry.validate(self.entity)
    }

    pub fn is_released(&self) -> bool {
        self.status() == EntityStatus::Released
    }

    /// Detach (`false`) or re-attach (`true`) the entity
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.registry.set_enabled(self.entity, enabled)
    }

    pub fn get<T: Component + Clone>(&self) -> Option<T> {
        self.registry.get::<T>(self.entity)
    }

    pub fn with<T: Component, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.registry.with(self.entity, f)
    }

    pub fn with_mut<T: Component, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.registry.with_mut(self.entity, f)
    }

    pub fn contains<T: Component>(&self) -> bool {
        self.registry.contains::<T>(self.entity)
    }

    pub fn contains_value(&self, component: &dyn Component) -> bool {
        self.registry.contains_value(self.entity, component)
    }

    pub fn add<B: Bundle>(&self, components: B) -> bool {
        self.registry.add(self.entity, components)
    }

    pub fn remove<T: Component>(&self) -> Option<T> {
        self.registry.remove::<T>(self.entity)
    }

    pub fn replace<T: Component>(&self, component: T) -> Option<T> {
        self.registry.replace(self.entity, component)
    }

    pub fn destroy(&self) -> bool {
        self.registry.destroy(self.entity)
    }

    pub fn serialize(&self) -> EcsResult<String> {
        self.registry.serialize(self.entity)
    }

    pub fn register<S: Signal>(&self, signal: S, callback: &SignalCallback) {
        self.registry.register_signal(self.entity, signal, callback);
    }

    pub fn unregister<S: Signal>(&self, signal: &S) {
        self.registry.unregister_signal(self.entity, signal);
    }
}

impl fmt::Debug for EntityRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRef")
            .field("entity", &self.entity)
            .field("status", &self.status())
            .finish()
    }
}
