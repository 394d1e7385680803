//! Persistence core: entity mapping, query translation and the unit of work.
//!
//! # Responsibility
//! - `mapping` / `managed`: rows to entities and back, lazy references.
//! - `query`: derived and declared queries compiled into verified plans.
//! - `session`: identity map, dirty checking, flush, locking.
//!
//! # Invariants
//! - Misconfigured queries fail while repositories are constructed.
//! - Nothing is retried internally; every error reaches the caller.

pub mod error;
pub mod lifecycle;
pub mod managed;
pub mod mapping;
pub mod query;
pub mod session;

pub use error::{MappingError, OrmError, OrmResult};
pub use lifecycle::{Clock, LifecycleEvent, Listeners, SystemClock};
pub use managed::{Inverse, Lazy, Managed};
pub use mapping::{
    Attribute, Entity, EntityGraph, EntityMeta, LoadContext, Metamodel, Relation, RowData,
};
pub use query::{
    Arg, Args, BulkMode, Direction, Order, Page, PageRequest, ParamRef, Projection, QueryCompiler,
    QueryKind, QueryPlan, Slice, Sort, TypedQuery,
};
pub use session::{LockMode, Session, SessionFactory, SessionStats};
