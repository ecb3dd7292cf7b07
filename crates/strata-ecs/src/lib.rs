//! # Strata ECS
//!
//! Archetype-based entity-component runtime with a concurrent system scheduler.
//!
//! This crate provides:
//! - **Registry**: entity lifecycle, component add/remove/replace, JSON
//!   (de)serialization, and bulk operations over views
//! - **Archetype Graph**: one node per distinct component type set, linked so
//!   that the archetypes holding a given type set are found without a scan
//! - **Views**: typed iteration over one to eight component types, with
//!   include/exclude refinement and parallel visiting
//! - **Events**: component add/replace/remove listeners and entity-scoped
//!   signals
//! - **Scheduler**: ordered per-tick system execution on a driver thread,
//!   fork-join parallelism on a per-scheduler rayon pool

pub mod archetype;
pub mod component;
pub mod config;
pub mod entity;
pub mod error;
pub mod event;
pub mod graph;
pub mod registry;
pub mod scheduler;
pub mod time;
pub mod view;

pub use archetype::{Archetype, ArchetypeId};
pub use component::{Bundle, Component, ComponentCodec, ComponentInfo, ComponentRegistry, ComponentTypeId};
pub use config::RegistryConfig;
pub use entity::{Entity, EntityRef, EntityStatus};
pub use error::{EcsError, EcsResult};
pub use event::{EventSink, ListenerId, ListenerKind, ListenerTarget, Signal, SignalCallback, SignalData};
pub use graph::{ArchetypeGraph, ArchetypeKey, ArchetypeNode, NodeSet};
pub use registry::Registry;
pub use scheduler::{Scheduler, System, SystemContext, SystemFn, SystemId, SystemResult, TickOutcome};
pub use time::{DeltaTime, TickClock};
pub use view::{Query, View, ViewEntry, ViewIter};
