//! Error types
//!
//! Only caller misuse and decode failures surface as errors. Operations on a
//! stale or disabled entity return `None`/`false` instead.

use thiserror::Error;

use crate::entity::Entity;

/// Runtime errors
#[derive(Error, Debug)]
pub enum EcsError {
    #[error("Unknown component tag: {0}")]
    UnknownComponentTag(String),

    #[error("Component type has no registered codec: {0}")]
    ComponentNotSerializable(&'static str),

    #[error("Malformed entity document: {0}")]
    MalformedEntity(String),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Entity is not attached: {0}")]
    InvalidEntity(Entity),

    #[error("Entity is held by a view entry on this thread: {0}")]
    EntityInUse(Entity),

    #[error("fork_and_join() may only be called from a scheduler driver or worker thread")]
    OutsideScheduler,

    #[error("Scheduler has been shut down")]
    SchedulerShutDown,

    #[error("Failed to start scheduler: {0}")]
    SchedulerStart(String),
}

/// Result type for runtime operations
pub type EcsResult<T> = Result<T, EcsError>;
