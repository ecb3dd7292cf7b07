//! Registry
//!
//! The facade over entity storage. Every structural change resolves the
//! target archetype for the entity's new type set, detaches the entity from
//! its source archetype, rebuilds the row, attaches it to the target, and
//! only then notifies listeners.
//!
//! Lock order is row, then entity slots, then archetype members. Read paths
//! look up the row under a short slot read lock and release it before
//! locking the row, so a held [`ViewEntry`](crate::ViewEntry) never blocks
//! reads of other entities. Listeners run after every lock is released.
//!
//! # Concurrent use
//!
//! Every operation may be called from any thread at any time. Operations on
//! one entity are serialized by its row lock; operations on different
//! entities interleave in no particular order, and a view only sees the
//! archetypes that existed when it was built. An entity's row stays locked
//! for as long as a [`ViewEntry`](crate::ViewEntry) for it is alive. The
//! holding thread may keep calling the registry for that entity (structural
//! changes are queued until the entry drops, reads see nothing), but any
//! other thread waits, so never hold an entry while waiting on a thread that
//! needs its entity.

use std::any::TypeId;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use smallvec::SmallVec;

use crate::archetype::Archetype;
use crate::component::{downcast, Bundle, Component, ComponentCodec, ComponentRegistry, ComponentTypeId};
use crate::config::RegistryConfig;
use crate::entity::{Cell, Entity, EntityAllocator, EntityRef, EntityStatus, RowRef};
use crate::error::{EcsError, EcsResult};
use crate::event::{EventSink, ListenerKind, Signal, SignalCallback};
use crate::graph::ArchetypeGraph;
use crate::scheduler::Scheduler;
use crate::view::{self, Deferred, Query, View};

type Signature = SmallVec<[(ComponentTypeId, &'static str); 8]>;

/// Component events collected under lock and emitted afterwards
type Pending = Vec<(ListenerKind, Box<dyn Component>)>;

fn signature(cells: &[Cell]) -> Signature {
    cells.iter().map(|cell| (cell.ty, cell.value.type_name())).collect()
}

/// Owner of all entities, archetypes, listeners, and schedulers
pub struct Registry {
    config: RegistryConfig,
    components: ComponentRegistry,
    entities: RwLock<EntityAllocator>,
    graph: ArchetypeGraph,
    events: EventSink,
    schedulers: Mutex<Vec<Arc<Scheduler>>>,
    next_scheduler: AtomicUsize,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            components: ComponentRegistry::new(),
            entities: RwLock::new(EntityAllocator::new()),
            graph: ArchetypeGraph::new(),
            events: EventSink::new(),
            schedulers: Mutex::new(Vec::new()),
            next_scheduler: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn components(&self) -> &ComponentRegistry {
        &self.components
    }

    pub fn graph(&self) -> &ArchetypeGraph {
        &self.graph
    }

    /// Component listeners and signal channels
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Bind a wire tag and serde_json codec to `T` for (de)serialization
    pub fn register_component<T>(&self, tag: impl Into<String>) -> ComponentTypeId
    where
        T: Component + Serialize + DeserializeOwned,
    {
        self.components.register_codec::<T>(ComponentCodec::json::<T>(tag))
    }

    /// Convenience handle for `entity`
    pub fn entity(&self, entity: Entity) -> EntityRef<'_> {
        EntityRef::new(self, entity)
    }

    /// Create an entity with no components
    pub fn create(&self) -> Entity {
        self.emplace(())
    }

    /// Create an entity directly in the archetype of `components`
    ///
    /// A type given twice keeps the last value.
    pub fn emplace<B: Bundle>(&self, components: B) -> Entity {
        let cells = self.into_cells(components.into_components());
        let archetype = self.graph.get_or_create(&signature(&cells));
        let pending: Pending = cells
            .iter()
            .filter_map(|cell| self.heard(ListenerKind::Add, &*cell.value))
            .collect();

        let entity = {
            let mut entities = self.entities.write();
            archetype.create_entity(&mut entities, cells)
        };
        self.emit_pending(entity, pending);
        entity
    }

    /// Create a new entity holding clones of `entity`'s components plus
    /// `components`, which take precedence
    pub fn emulate<B: Bundle>(&self, entity: Entity, components: B) -> Option<Entity> {
        let mut values: Vec<Box<dyn Component>> = {
            let row_ref = self.row_of(entity)?;
            if view::is_held(&row_ref) {
                return None;
            }
            let row = row_ref.lock();
            if !row.attached {
                return None;
            }
            row.cells.iter().map(|cell| cell.value.clone_boxed()).collect()
        };
        values.extend(components.into_components());
        Some(self.emplace(values))
    }

    /// Add components to an attached entity
    ///
    /// A component whose type the entity already holds is overwritten in
    /// place and reported as a replace. Returns `false` for a stale or
    /// detached entity.
    pub fn add<B: Bundle>(&self, entity: Entity, components: B) -> bool {
        let Some(row_ref) = self.row_of(entity) else {
            return false;
        };
        let components = components.into_components();
        if view::is_held(&row_ref) {
            view::defer(&row_ref, Deferred::Add(components));
            return true;
        }
        let incoming = self.into_cells(components);
        let mut row = row_ref.lock();
        if !row.attached {
            return false;
        }

        let mut pending = Pending::new();
        let mut grew = false;
        for cell in incoming {
            match row.cells.iter_mut().find(|existing| existing.ty == cell.ty) {
                Some(existing) => {
                    pending.extend(self.heard(ListenerKind::Replace, &*cell.value));
                    existing.value = cell.value;
                }
                None => {
                    pending.extend(self.heard(ListenerKind::Add, &*cell.value));
                    row.cells.push(cell);
                    grew = true;
                }
            }
        }

        if grew {
            let target = self.graph.get_or_create(&signature(&row.cells));
            let mut entities = self.entities.write();
            if let Some(source) = entities.attached(entity).map(|occupant| Arc::clone(&occupant.archetype)) {
                source.detach(&mut entities, entity, &mut row);
                target.attach(&mut entities, entity, &mut row, &row_ref);
            }
        }
        drop(row);

        self.emit_pending(entity, pending);
        true
    }

    /// Remove the `T` component of an attached entity
    pub fn remove<T: Component>(&self, entity: Entity) -> Option<T> {
        self.remove_dyn(entity, TypeId::of::<T>()).and_then(downcast::<T>)
    }

    /// Remove the component of type `type_id` from an attached entity
    ///
    /// Removing the last component moves the entity to the base archetype.
    pub fn remove_dyn(&self, entity: Entity, type_id: TypeId) -> Option<Box<dyn Component>> {
        let row_ref = self.row_of(entity)?;
        if view::is_held(&row_ref) {
            view::defer(&row_ref, Deferred::Remove(type_id));
            return None;
        }
        let ty = self.components.id_of(type_id)?;
        let mut row = row_ref.lock();
        if !row.attached {
            return None;
        }
        let index = row.cells.iter().position(|cell| cell.ty == ty)?;

        let target = if row.cells.len() == 1 {
            Arc::clone(self.graph.base())
        } else {
            let mut remaining = signature(&row.cells);
            remaining.remove(index);
            self.graph.get_or_create(&remaining)
        };

        let removed = {
            let mut entities = self.entities.write();
            let source = Arc::clone(&entities.attached(entity)?.archetype);
            source.detach(&mut entities, entity, &mut row);
            let removed = row.cells.remove(index).value;
            target.attach(&mut entities, entity, &mut row, &row_ref);
            removed
        };
        drop(row);

        self.events.emit(ListenerKind::Remove, entity, &*removed);
        Some(removed)
    }

    /// Overwrite the existing `T` component, returning the old value
    ///
    /// Does nothing, and notifies nobody, when the entity holds no `T`.
    pub fn replace<T: Component>(&self, entity: Entity, component: T) -> Option<T> {
        self.replace_dyn(entity, Box::new(component)).and_then(downcast::<T>)
    }

    /// Overwrite the existing component of `component`'s type
    pub fn replace_dyn(&self, entity: Entity, component: Box<dyn Component>) -> Option<Box<dyn Component>> {
        let row_ref = self.row_of(entity)?;
        if view::is_held(&row_ref) {
            view::defer(&row_ref, Deferred::Replace(component));
            return None;
        }
        let ty = self.components.id_of(component.component_type())?;
        let notify = self.heard(ListenerKind::Replace, &*component);

        let old = {
            let mut row = row_ref.lock();
            if !row.attached {
                return None;
            }
            let cell = row.cells.iter_mut().find(|cell| cell.ty == ty)?;
            std::mem::replace(&mut cell.value, component)
        };

        if let Some((kind, new)) = notify {
            self.events.emit(kind, entity, &*new);
        }
        Some(old)
    }

    /// Clone of the `T` component
    pub fn get<T: Component + Clone>(&self, entity: Entity) -> Option<T> {
        self.with(entity, T::clone)
    }

    /// Run `f` on the `T` component while holding the entity's row
    pub fn with<T: Component, R>(&self, entity: Entity, f: impl FnOnce(&T) -> R) -> Option<R> {
        let ty = self.components.id::<T>()?;
        let row_ref = self.unheld_row_of(entity)?;
        let row = row_ref.lock();
        if !row.attached {
            return None;
        }
        let cell = row.cells.iter().find(|cell| cell.ty == ty)?;
        cell.value.as_any().downcast_ref::<T>().map(f)
    }

    /// Run `f` on the `T` component mutably while holding the entity's row
    pub fn with_mut<T: Component, R>(&self, entity: Entity, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let ty = self.components.id::<T>()?;
        let row_ref = self.unheld_row_of(entity)?;
        let mut row = row_ref.lock();
        if !row.attached {
            return None;
        }
        let cell = row.cells.iter_mut().find(|cell| cell.ty == ty)?;
        cell.value.as_any_mut().downcast_mut::<T>().map(f)
    }

    /// Whether an attached entity holds a `T`
    pub fn contains<T: Component>(&self, entity: Entity) -> bool {
        self.contains_type(entity, TypeId::of::<T>())
    }

    pub fn contains_type(&self, entity: Entity, type_id: TypeId) -> bool {
        let Some(ty) = self.components.id_of(type_id) else {
            return false;
        };
        self.unheld_row_of(entity).is_some_and(|row_ref| {
            let row = row_ref.lock();
            row.attached && row.cells.iter().any(|cell| cell.ty == ty)
        })
    }

    /// Whether an attached entity holds a component equal to `component`
    pub fn contains_value(&self, entity: Entity, component: &dyn Component) -> bool {
        let Some(ty) = self.components.id_of(component.component_type()) else {
            return false;
        };
        self.unheld_row_of(entity).is_some_and(|row_ref| {
            let row = row_ref.lock();
            row.attached
                && row
                    .cells
                    .iter()
                    .any(|cell| cell.ty == ty && cell.value.eq_dyn(component))
        })
    }

    /// True iff `entity` is live and attached
    pub fn validate(&self, entity: Entity) -> bool {
        self.status(entity) == EntityStatus::Attached
    }

    pub fn status(&self, entity: Entity) -> EntityStatus {
        self.entities.read().status(entity)
    }

    /// Detach (`false`) or re-attach (`true`) an entity in place
    ///
    /// A detached entity keeps its components but is invisible to views and
    /// accessors. Returns `false` only for a released entity.
    pub fn set_enabled(&self, entity: Entity, enabled: bool) -> bool {
        let Some(row_ref) = self.row_of(entity) else {
            return false;
        };
        if view::is_held(&row_ref) {
            view::defer(&row_ref, Deferred::SetEnabled(enabled));
            return true;
        }
        let mut row = row_ref.lock();
        let mut entities = self.entities.write();
        let Some(occupant) = entities.occupant(entity) else {
            return false;
        };
        let archetype = Arc::clone(&occupant.archetype);
        match (enabled, row.attached) {
            (true, false) => {
                archetype.attach(&mut entities, entity, &mut row, &row_ref);
            }
            (false, true) => {
                archetype.detach(&mut entities, entity, &mut row);
            }
            (true, true) | (false, false) => {}
        }
        true
    }

    /// Destroy an attached or detached entity, notifying remove listeners
    /// for each of its components
    pub fn destroy(&self, entity: Entity) -> bool {
        if let Some(row_ref) = self.row_of(entity) {
            if view::is_held(&row_ref) {
                view::defer(&row_ref, Deferred::Destroy);
                return true;
            }
        }
        match self.take_entity(entity) {
            Some(values) => {
                for value in &values {
                    self.events.emit(ListenerKind::Remove, entity, &**value);
                }
                true
            }
            None => false,
        }
    }

    /// Remove an entity and hand its components to the caller
    ///
    /// No remove events are emitted; the handle reports
    /// [`EntityStatus::Released`] afterwards. An entity whose entry the
    /// calling thread holds cannot be released.
    pub fn release(&self, entity: Entity) -> Option<Vec<Box<dyn Component>>> {
        self.take_entity(entity)
    }

    fn take_entity(&self, entity: Entity) -> Option<Vec<Box<dyn Component>>> {
        let row_ref = self.unheld_row_of(entity)?;
        let values = {
            let mut row = row_ref.lock();
            let mut entities = self.entities.write();
            let archetype = Arc::clone(&entities.occupant(entity)?.archetype);
            archetype.destroy(&mut entities, entity, &mut row)?
        };
        self.events.forget(entity);
        Some(values)
    }

    /// Encode an attached entity as `[tag, value, tag, value, ...]`
    pub fn serialize(&self, entity: Entity) -> EcsResult<String> {
        let row_ref = self.row_of(entity).ok_or(EcsError::InvalidEntity(entity))?;
        if view::is_held(&row_ref) {
            return Err(EcsError::EntityInUse(entity));
        }
        let array = {
            let row = row_ref.lock();
            if !row.attached {
                return Err(EcsError::InvalidEntity(entity));
            }
            let mut array = Vec::with_capacity(row.cells.len() * 2);
            for cell in &row.cells {
                let codec = self
                    .components
                    .codec(cell.ty)
                    .ok_or(EcsError::ComponentNotSerializable(cell.value.type_name()))?;
                array.push(Value::String(codec.tag().to_string()));
                array.push(codec.encode(&*cell.value)?);
            }
            Value::Array(array)
        };

        let json = if self.config.pretty_json {
            serde_json::to_string_pretty(&array)?
        } else {
            serde_json::to_string(&array)?
        };
        Ok(json)
    }

    /// Decode an entity document and emplace it
    ///
    /// Every tag must resolve and every value must decode before anything is
    /// created.
    pub fn deserialize(&self, json: &str) -> EcsResult<Entity> {
        let document: Value = serde_json::from_str(json)?;
        let Value::Array(items) = document else {
            return Err(EcsError::MalformedEntity("expected a JSON array".to_string()));
        };
        if items.len() % 2 != 0 {
            return Err(EcsError::MalformedEntity(format!(
                "expected tag/value pairs, found {} items",
                items.len()
            )));
        }

        let mut components: Vec<Box<dyn Component>> = Vec::with_capacity(items.len() / 2);
        let mut items = items.into_iter();
        while let (Some(tag), Some(value)) = (items.next(), items.next()) {
            let Value::String(tag) = tag else {
                return Err(EcsError::MalformedEntity(format!("expected a type tag, found {}", tag)));
            };
            let (_, codec) = self.components.resolve_tag(&tag)?;
            components.push(codec.decode(value)?);
        }
        Ok(self.emplace(components))
    }

    /// Serialize many entities on the rayon pool; results are in input order
    pub fn par_serialize(&self, entities: &[Entity]) -> Vec<EcsResult<String>> {
        entities.par_iter().map(|entity| self.serialize(*entity)).collect()
    }

    /// Deserialize many documents on the rayon pool; results are in input order
    pub fn par_deserialize<S: AsRef<str> + Sync>(&self, documents: &[S]) -> Vec<EcsResult<Entity>> {
        documents
            .par_iter()
            .map(|document| self.deserialize(document.as_ref()))
            .collect()
    }

    /// Query every attached entity holding all of `Q`'s types
    pub fn view<Q: Query>(&self) -> View<'_, Q> {
        View::new(self)
    }

    /// Remove `Q`'s component types from every entity in `view::<Q>()`;
    /// returns the number of entities touched
    pub fn clear_view<Q: Query>(&self) -> usize {
        let entities = self.view::<Q>().entities();
        for entity in &entities {
            for type_id in Q::type_ids() {
                self.remove_dyn(*entity, type_id);
            }
        }
        entities.len()
    }

    /// Destroy every entity in `view::<Q>()`
    pub fn destroy_view<Q: Query>(&self) -> usize {
        self.view::<Q>()
            .entities()
            .into_iter()
            .filter(|entity| self.destroy(*entity))
            .count()
    }

    /// Release every entity in `view::<Q>()`
    pub fn release_view<Q: Query>(&self) -> Vec<(Entity, Vec<Box<dyn Component>>)> {
        self.view::<Q>()
            .entities()
            .into_iter()
            .filter_map(|entity| self.release(entity).map(|values| (entity, values)))
            .collect()
    }

    /// Subscribe an attached entity to `signal`; ignored for any other entity
    pub fn register_signal<S: Signal>(&self, entity: Entity, signal: S, callback: &SignalCallback) -> bool {
        if !self.validate(entity) {
            return false;
        }
        self.events.register(entity, signal, callback);
        true
    }

    pub fn unregister_signal<S: Signal>(&self, entity: Entity, signal: &S) {
        self.events.unregister(entity, signal);
    }

    /// Subscribe every entity of `view::<Q>()` to `signal`
    pub fn register_view<Q: Query, S: Signal + Clone>(&self, signal: S, callback: &SignalCallback) -> usize {
        let entities = self.view::<Q>().entities();
        for entity in &entities {
            self.events.register(*entity, signal.clone(), callback);
        }
        entities.len()
    }

    pub fn unregister_view<Q: Query, S: Signal>(&self, signal: &S) -> usize {
        let entities = self.view::<Q>().entities();
        for entity in &entities {
            self.events.unregister(*entity, signal);
        }
        entities.len()
    }

    /// Start a scheduler bound to this registry
    pub fn create_scheduler(self: &Arc<Self>) -> EcsResult<Arc<Scheduler>> {
        let index = self.next_scheduler.fetch_add(1, Ordering::Relaxed);
        let scheduler = Arc::new(Scheduler::new(Arc::downgrade(self), &self.config, index)?);
        self.schedulers.lock().push(Arc::clone(&scheduler));
        Ok(scheduler)
    }

    /// Active schedulers
    pub fn schedulers(&self) -> Vec<Arc<Scheduler>> {
        self.schedulers.lock().clone()
    }

    pub(crate) fn detach_scheduler(&self, id: usize) {
        self.schedulers.lock().retain(|scheduler| scheduler.id() != id);
    }

    /// Shut down every scheduler, destroy every entity, and drop all
    /// archetypes and listeners
    pub fn close(&self) {
        let schedulers = std::mem::take(&mut *self.schedulers.lock());
        for scheduler in schedulers {
            scheduler.shutdown();
        }

        let live = self.entities.read().live_entities();
        for entity in live {
            self.take_entity(entity);
        }
        self.graph.clear();
        self.events.clear();
    }

    /// Number of live entities, detached ones included
    pub fn entity_count(&self) -> usize {
        self.entities.read().len()
    }

    /// Number of archetypes, base included
    pub fn archetype_count(&self) -> usize {
        self.graph.len()
    }

    pub(crate) fn archetypes(&self) -> Vec<Arc<Archetype>> {
        self.graph.archetypes()
    }

    fn row_of(&self, entity: Entity) -> Option<RowRef> {
        self.entities
            .read()
            .occupant(entity)
            .map(|occupant| Arc::clone(&occupant.row))
    }

    /// Row of `entity` unless the calling thread holds it through a view
    fn unheld_row_of(&self, entity: Entity) -> Option<RowRef> {
        self.row_of(entity).filter(|row_ref| !view::is_held(row_ref))
    }

    pub(crate) fn apply_deferred(&self, entity: Entity, op: Deferred) {
        match op {
            Deferred::Add(components) => {
                self.add(entity, components);
            }
            Deferred::Remove(type_id) => {
                self.remove_dyn(entity, type_id);
            }
            Deferred::Replace(component) => {
                self.replace_dyn(entity, component);
            }
            Deferred::SetEnabled(enabled) => {
                self.set_enabled(entity, enabled);
            }
            Deferred::Destroy => {
                self.destroy(entity);
            }
        }
    }

    fn into_cells(&self, components: Vec<Box<dyn Component>>) -> Vec<Cell> {
        let mut cells: Vec<Cell> = Vec::with_capacity(components.len());
        for value in components {
            let ty = self.components.id_or_insert(&*value);
            match cells.iter_mut().find(|cell| cell.ty == ty) {
                Some(cell) => cell.value = value,
                None => cells.push(Cell { ty, value }),
            }
        }
        cells
    }

    /// Clone `component` only when someone listens for it
    fn heard(&self, kind: ListenerKind, component: &dyn Component) -> Option<(ListenerKind, Box<dyn Component>)> {
        self.events
            .has_listeners(kind, component.component_type())
            .then(|| (kind, component.clone_boxed()))
    }

    fn emit_pending(&self, entity: Entity, pending: Pending) {
        for (kind, component) in pending {
            self.events.emit(kind, entity, &*component);
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for scheduler in self.schedulers.get_mut().drain(..) {
            scheduler.shutdown();
        }
    }
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Registry: {} entities, {} archetypes, {} schedulers",
            self.entity_count(),
            self.archetype_count(),
            self.schedulers.lock().len()
        )?;
        for archetype in self.archetypes() {
            writeln!(f, "  {}", archetype)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("entities", &self.entity_count())
            .field("archetypes", &self.archetype_count())
            .field("components", &self.components)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Velocity {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Health(u32);

    #[derive(Debug, Clone, PartialEq)]
    struct Opaque;

    fn position(x: f32, y: f32) -> Position {
        Position { x, y }
    }

    fn velocity(x: f32, y: f32) -> Velocity {
        Velocity { x, y }
    }

    #[test]
    fn test_create_lands_in_base() {
        let registry = Registry::default();
        let entity = registry.create();
        assert!(registry.validate(entity));
        assert_eq!(registry.entity_count(), 1);
        assert_eq!(registry.archetype_count(), 1);
        assert!(!registry.contains::<Position>(entity));
    }

    #[test]
    fn test_add_and_remove_move_archetypes() {
        let registry = Registry::default();
        let entity = registry.create();

        assert!(registry.add(entity, (position(1.0, 2.0),)));
        assert!(registry.add(entity, (velocity(3.0, 4.0), Health(10))));
        assert!(registry.contains::<Health>(entity));
        assert_eq!(registry.view::<(Position, Velocity, Health)>().count(), 1);

        assert_eq!(registry.remove::<Velocity>(entity), Some(velocity(3.0, 4.0)));
        assert_eq!(registry.remove::<Velocity>(entity), None);
        assert_eq!(registry.get::<Position>(entity), Some(position(1.0, 2.0)));
        assert_eq!(registry.get::<Health>(entity), Some(Health(10)));

        registry.remove::<Position>(entity);
        assert!(registry.graph().base().is_empty());
        registry.remove::<Health>(entity);
        assert!(registry.validate(entity));
        assert_eq!(registry.view::<(Health,)>().count(), 0);
        assert_eq!(registry.graph().base().entities(), vec![entity]);
    }

    #[test]
    fn test_add_existing_type_overwrites() {
        let registry = Registry::default();
        let entity = registry.emplace((Health(1),));
        let archetypes = registry.archetype_count();
        assert!(registry.add(entity, (Health(2),)));
        assert_eq!(registry.get::<Health>(entity), Some(Health(2)));
        assert_eq!(registry.archetype_count(), archetypes);
    }

    #[test]
    fn test_replace_requires_existing_component() {
        let registry = Registry::default();
        let entity = registry.emplace((Health(5),));
        assert_eq!(registry.replace(entity, Health(6)), Some(Health(5)));
        assert_eq!(registry.get::<Health>(entity), Some(Health(6)));
        assert_eq!(registry.replace(entity, position(0.0, 0.0)), None);
        assert!(!registry.contains::<Position>(entity));
    }

    #[test]
    fn test_with_mut() {
        let registry = Registry::default();
        let entity = registry.emplace((Health(5),));
        assert_eq!(registry.with_mut::<Health, _>(entity, |h| { h.0 += 1; h.0 }), Some(6));
        assert_eq!(registry.with::<Health, _>(entity, |h| h.0 * 2), Some(12));
    }

    #[test]
    fn test_contains_value() {
        let registry = Registry::default();
        let single = registry.emplace((Health(5),));
        let pair = registry.emplace((Health(5), position(0.0, 0.0)));

        for entity in [single, pair] {
            assert!(registry.contains_value(entity, &Health(5)));
            assert!(!registry.contains_value(entity, &Health(6)));
            assert!(!registry.contains_value(entity, &velocity(0.0, 0.0)));
        }
    }

    #[test]
    fn test_stale_handles_are_inert() {
        let registry = Registry::default();
        let entity = registry.emplace((Health(5),));
        assert!(registry.destroy(entity));
        assert!(!registry.destroy(entity));

        assert_eq!(registry.status(entity), EntityStatus::Released);
        assert_eq!(registry.get::<Health>(entity), None);
        assert!(!registry.add(entity, (Health(1),)));
        assert!(registry.remove::<Health>(entity).is_none());
        assert!(matches!(registry.serialize(entity), Err(EcsError::InvalidEntity(_))));

        // The slot is recycled under a new generation
        let next = registry.create();
        assert_eq!(next.index(), entity.index());
        assert!(!registry.validate(entity));
        assert!(registry.validate(next));
    }

    #[test]
    fn test_detach_and_reattach() {
        let registry = Registry::default();
        let entity = registry.emplace((Health(5), position(1.0, 1.0)));

        assert!(registry.set_enabled(entity, false));
        assert_eq!(registry.status(entity), EntityStatus::Detached);
        assert_eq!(registry.get::<Health>(entity), None);
        assert!(!registry.add(entity, (velocity(0.0, 0.0),)));
        assert_eq!(registry.view::<(Health,)>().count(), 0);

        assert!(registry.set_enabled(entity, true));
        assert_eq!(registry.get::<Health>(entity), Some(Health(5)));
        assert_eq!(registry.view::<(Health, Position)>().entities(), vec![entity]);
    }

    #[test]
    fn test_destroy_detached_entity() {
        let registry = Registry::default();
        let entity = registry.emplace((Health(5),));
        registry.set_enabled(entity, false);
        assert!(registry.destroy(entity));
        assert_eq!(registry.entity_count(), 0);
    }

    #[test]
    fn test_release_hands_back_components() {
        let registry = Registry::default();
        let entity = registry.emplace((Health(5), position(1.0, 2.0)));
        let values = registry.release(entity).unwrap();
        assert_eq!(values.len(), 2);
        assert!(values.iter().any(|value| value.eq_dyn(&Health(5))));
        assert_eq!(registry.status(entity), EntityStatus::Released);
        assert!(registry.release(entity).is_none());
    }

    #[test]
    fn test_emulate() {
        let registry = Registry::default();
        let source = registry.emplace((Health(5), position(1.0, 2.0)));
        let copy = registry.emulate(source, (Health(9), velocity(0.0, 1.0))).unwrap();

        assert_ne!(copy, source);
        assert_eq!(registry.get::<Health>(copy), Some(Health(9)));
        assert_eq!(registry.get::<Position>(copy), Some(position(1.0, 2.0)));
        assert_eq!(registry.get::<Health>(source), Some(Health(5)));
        assert!(!registry.contains::<Velocity>(source));
    }

    #[test]
    fn test_listeners_fire_after_structural_changes() {
        let registry = Registry::default();
        let added = Arc::new(AtomicUsize::new(0));
        let replaced = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&added);
        registry.events().connect::<Health>(ListenerKind::Add, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&replaced);
        registry.events().connect::<Health>(ListenerKind::Replace, move |_, health| {
            assert_eq!(health.0, 2);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&removed);
        registry.events().connect_any(ListenerKind::Remove, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let entity = registry.emplace((Health(1),));
        registry.replace(entity, Health(2));
        registry.add(entity, (position(0.0, 0.0),));
        registry.remove::<Position>(entity);
        registry.destroy(entity);

        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert_eq!(replaced.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_may_reenter_registry() {
        let registry = Arc::new(Registry::default());
        let inner = Arc::downgrade(&registry);
        registry.events().connect::<Health>(ListenerKind::Add, move |entity, _| {
            if let Some(registry) = inner.upgrade() {
                registry.add(entity, (position(0.0, 0.0),));
            }
        });

        let entity = registry.emplace((Health(1),));
        assert!(registry.contains::<Position>(entity));
    }

    #[test]
    fn test_serialize_round_trip() {
        let registry = Registry::default();
        registry.register_component::<Position>("game::Position");
        registry.register_component::<Health>("game::Health");

        let entity = registry.emplace((position(1.5, -2.0), Health(7)));
        let json = registry.serialize(entity).unwrap();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.as_array().map(Vec::len), Some(4));

        let copy = registry.deserialize(&json).unwrap();
        assert_eq!(registry.get::<Position>(copy), Some(position(1.5, -2.0)));
        assert_eq!(registry.get::<Health>(copy), Some(Health(7)));
    }

    #[test]
    fn test_unserializable_component() {
        let registry = Registry::default();
        let entity = registry.emplace((Opaque,));
        assert!(matches!(
            registry.serialize(entity),
            Err(EcsError::ComponentNotSerializable(_))
        ));
    }

    #[test]
    fn test_deserialize_is_all_or_nothing() {
        let registry = Registry::default();
        registry.register_component::<Health>("game::Health");

        let result = registry.deserialize(r#"["game::Health", 3, "game::Missing", {}]"#);
        assert!(matches!(result, Err(EcsError::UnknownComponentTag(tag)) if tag == "game::Missing"));
        assert_eq!(registry.entity_count(), 0);

        assert!(matches!(
            registry.deserialize(r#"["game::Health"]"#),
            Err(EcsError::MalformedEntity(_))
        ));
        assert!(matches!(registry.deserialize(r#"{"a": 1}"#), Err(EcsError::MalformedEntity(_))));
        assert!(matches!(registry.deserialize(r#"[1, 2]"#), Err(EcsError::MalformedEntity(_))));
        assert!(matches!(
            registry.deserialize(r#"["game::Health", "not a number"]"#),
            Err(EcsError::Codec(_))
        ));
        assert_eq!(registry.entity_count(), 0);
    }

    #[test]
    fn test_par_serialize_awaits_every_item() {
        let registry = Registry::default();
        registry.register_component::<Health>("game::Health");
        let entities: Vec<Entity> = (0..64).map(|i| registry.emplace((Health(i),))).collect();

        let documents: Vec<String> = registry
            .par_serialize(&entities)
            .into_iter()
            .collect::<EcsResult<_>>()
            .unwrap();
        assert_eq!(documents.len(), 64);

        let copies = registry.par_deserialize(&documents);
        assert!(copies.iter().all(Result::is_ok));
        assert_eq!(registry.entity_count(), 128);
        assert_eq!(registry.view::<(Health,)>().count(), 128);
    }

    #[test]
    fn test_bulk_view_helpers() {
        let registry = Registry::default();
        for i in 0..4 {
            registry.emplace((Health(i), position(0.0, 0.0)));
        }
        registry.emplace((Health(99),));

        assert_eq!(registry.clear_view::<(Position,)>(), 4);
        assert_eq!(registry.view::<(Position,)>().count(), 0);
        assert_eq!(registry.view::<(Health,)>().count(), 5);

        let released = registry.release_view::<(Health,)>();
        assert_eq!(released.len(), 5);
        assert_eq!(registry.entity_count(), 0);

        registry.emplace((Health(1),));
        assert_eq!(registry.destroy_view::<(Health,)>(), 1);
    }

    #[test]
    fn test_signals_require_attached_entity() {
        let registry = Registry::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let callback = SignalCallback::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let live = registry.emplace((Health(1),));
        let detached = registry.emplace((Health(2),));
        registry.set_enabled(detached, false);

        assert!(registry.register_signal(live, "ping", &callback));
        assert!(!registry.register_signal(detached, "ping", &callback));
        registry.events().receive(&"ping", &());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Destroyed entities stop receiving
        registry.destroy(live);
        registry.events().receive(&"ping", &());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        registry.set_enabled(detached, true);
        assert_eq!(registry.register_view::<(Health,), _>("ping", &callback), 1);
        registry.events().receive(&"ping", &());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close() {
        let registry = Registry::default();
        let entity = registry.emplace((Health(1), position(0.0, 0.0)));
        registry.close();
        assert_eq!(registry.entity_count(), 0);
        assert_eq!(registry.archetype_count(), 1);
        assert!(!registry.validate(entity));
    }

    #[test]
    fn test_display_summary() {
        let registry = Registry::default();
        registry.emplace((Health(1),));
        let summary = registry.to_string();
        assert!(summary.starts_with("Registry: 1 entities, 2 archetypes, 0 schedulers"));
        assert!(summary.contains("[Health] (1 entities)"));
    }
}
