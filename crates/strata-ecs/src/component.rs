//! Components and the component type registry
//!
//! Every Rust type used as a component is assigned a dense
//! [`ComponentTypeId`] the first time a registry sees it. Archetype
//! signatures, listener keys, and column layouts are all expressed in these
//! ids. Types that take part in serialization are additionally registered
//! with a stable wire tag and a pair of serde_json codec functions.

use std::any::{Any, TypeId};
use std::fmt;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{EcsError, EcsResult};

/// Data attached to an entity
///
/// Implemented for every `Clone + PartialEq + Debug` type that is
/// `Send + Sync + 'static`.
pub trait Component: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
    fn clone_boxed(&self) -> Box<dyn Component>;
    fn eq_dyn(&self, other: &dyn Component) -> bool;
    /// `TypeId` of the concrete component type
    fn component_type(&self) -> TypeId;
    fn type_name(&self) -> &'static str;
}

impl<T> Component for T
where
    T: Any + Send + Sync + Clone + PartialEq + fmt::Debug,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn clone_boxed(&self) -> Box<dyn Component> {
        Box::new(self.clone())
    }

    fn eq_dyn(&self, other: &dyn Component) -> bool {
        other.as_any().downcast_ref::<T>() == Some(self)
    }

    fn component_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Downcast a boxed component into its concrete type
pub fn downcast<T: Component>(component: Box<dyn Component>) -> Option<T> {
    component.into_any().downcast::<T>().ok().map(|boxed| *boxed)
}

/// Dense per-registry component type index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentTypeId(pub u32);

impl ComponentTypeId {
    /// Get the raw index
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

type EncodeFn = fn(&dyn Component) -> EcsResult<Value>;
type DecodeFn = fn(Value) -> EcsResult<Box<dyn Component>>;

/// Wire tag plus encode/decode functions for one component type
#[derive(Clone)]
pub struct ComponentCodec {
    tag: String,
    encode: EncodeFn,
    decode: DecodeFn,
}

impl ComponentCodec {
    /// Build the serde_json codec for `T`
    pub fn json<T>(tag: impl Into<String>) -> Self
    where
        T: Component + Serialize + DeserializeOwned,
    {
        Self {
            tag: tag.into(),
            encode: encode_json::<T>,
            decode: decode_json::<T>,
        }
    }

    /// The stable wire tag
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn encode(&self, component: &dyn Component) -> EcsResult<Value> {
        (self.encode)(component)
    }

    pub fn decode(&self, value: Value) -> EcsResult<Box<dyn Component>> {
        (self.decode)(value)
    }
}

impl fmt::Debug for ComponentCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentCodec").field("tag", &self.tag).finish()
    }
}

fn encode_json<T>(component: &dyn Component) -> EcsResult<Value>
where
    T: Component + Serialize,
{
    let typed = component
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| EcsError::MalformedEntity(format!("expected {}", std::any::type_name::<T>())))?;
    Ok(serde_json::to_value(typed)?)
}

fn decode_json<T>(value: Value) -> EcsResult<Box<dyn Component>>
where
    T: Component + DeserializeOwned,
{
    let typed: T = serde_json::from_value(value)?;
    Ok(Box::new(typed))
}

/// Metadata for one registered component type
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    pub id: ComponentTypeId,
    pub type_id: TypeId,
    pub type_name: &'static str,
    pub codec: Option<ComponentCodec>,
}

#[derive(Default)]
struct TypeTable {
    by_type: AHashMap<TypeId, ComponentTypeId>,
    by_tag: AHashMap<String, ComponentTypeId>,
    infos: Vec<ComponentInfo>,
}

impl TypeTable {
    fn id_or_insert(&mut self, type_id: TypeId, type_name: &'static str) -> ComponentTypeId {
        if let Some(&id) = self.by_type.get(&type_id) {
            return id;
        }
        let id = ComponentTypeId(self.infos.len() as u32);
        self.infos.push(ComponentInfo {
            id,
            type_id,
            type_name,
            codec: None,
        });
        self.by_type.insert(type_id, id);
        id
    }
}

/// Closed type-id registry
#[derive(Default)]
pub struct ComponentRegistry {
    table: RwLock<TypeTable>,
}

impl ComponentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the id of an already known type
    pub fn id_of(&self, type_id: TypeId) -> Option<ComponentTypeId> {
        self.table.read().by_type.get(&type_id).copied()
    }

    /// Look up the id of `T`, if the registry has seen it
    pub fn id<T: Component>(&self) -> Option<ComponentTypeId> {
        self.id_of(TypeId::of::<T>())
    }

    /// Look up or assign the id of a component value's type
    pub fn id_or_insert(&self, component: &dyn Component) -> ComponentTypeId {
        let type_id = component.component_type();
        if let Some(id) = self.id_of(type_id) {
            return id;
        }
        self.table.write().id_or_insert(type_id, component.type_name())
    }

    /// Look up or assign the id of `T`
    pub fn id_or_insert_type<T: Component>(&self) -> ComponentTypeId {
        if let Some(id) = self.id::<T>() {
            return id;
        }
        self.table
            .write()
            .id_or_insert(TypeId::of::<T>(), std::any::type_name::<T>())
    }

    /// Bind a codec to `T`; a later registration of the same type replaces
    /// the earlier tag
    pub fn register_codec<T: Component>(&self, codec: ComponentCodec) -> ComponentTypeId {
        let mut table = self.table.write();
        let id = table.id_or_insert(TypeId::of::<T>(), std::any::type_name::<T>());
        if let Some(previous) = table.infos[id.index()].codec.take() {
            table.by_tag.remove(previous.tag());
        }
        table.by_tag.insert(codec.tag().to_string(), id);
        table.infos[id.index()].codec = Some(codec);
        id
    }

    /// Resolve a wire tag to its type id and codec
    pub fn resolve_tag(&self, tag: &str) -> EcsResult<(ComponentTypeId, ComponentCodec)> {
        let table = self.table.read();
        table
            .by_tag
            .get(tag)
            .and_then(|id| {
                let info = &table.infos[id.index()];
                info.codec.clone().map(|codec| (*id, codec))
            })
            .ok_or_else(|| EcsError::UnknownComponentTag(tag.to_string()))
    }

    /// Codec for a type id
    pub fn codec(&self, id: ComponentTypeId) -> Option<ComponentCodec> {
        self.table.read().infos.get(id.index()).and_then(|info| info.codec.clone())
    }

    /// Metadata for a type id
    pub fn info(&self, id: ComponentTypeId) -> Option<ComponentInfo> {
        self.table.read().infos.get(id.index()).cloned()
    }

    /// Number of known component types
    pub fn len(&self) -> usize {
        self.table.read().infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("types", &self.len())
            .finish()
    }
}

/// A heterogeneous list of components
///
/// Implemented for tuples of up to eight components and for
/// `Vec<Box<dyn Component>>`.
pub trait Bundle: Send {
    fn into_components(self) -> Vec<Box<dyn Component>>;
}

impl Bundle for Vec<Box<dyn Component>> {
    fn into_components(self) -> Vec<Box<dyn Component>> {
        self
    }
}

impl Bundle for () {
    fn into_components(self) -> Vec<Box<dyn Component>> {
        Vec::new()
    }
}

macro_rules! impl_bundle {
    ($($name:ident),+) => {
        impl<$($name: Component),+> Bundle for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_components(self) -> Vec<Box<dyn Component>> {
                let ($($name,)+) = self;
                vec![$(Box::new($name) as Box<dyn Component>),+]
            }
        }
    };
}

impl_bundle!(A);
impl_bundle!(A, B);
impl_bundle!(A, B, C);
impl_bundle!(A, B, C, D);
impl_bundle!(A, B, C, D, E);
impl_bundle!(A, B, C, D, E, F);
impl_bundle!(A, B, C, D, E, F, G);
impl_bundle!(A, B, C, D, E, F, G, H);
