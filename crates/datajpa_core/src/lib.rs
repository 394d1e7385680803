//! Minimal ORM core over a member/team study model.
//!
//! Entities map to SQLite rows through `orm::mapping`, repositories compile
//! their queries up front through `orm::query`, and every read or write goes
//! through an `orm::Session` unit of work.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod orm;
pub mod repo;

pub use config::{FlushMode, OrmConfig};
pub use db::{open_db, open_db_in_memory, open_db_with_config, DbError, DbResult};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::{Item, Member, MemberDto, Team};
pub use orm::{
    BulkMode, Entity, LockMode, Managed, MappingError, OrmError, OrmResult, Page, PageRequest,
    Session, SessionFactory, Slice, Sort,
};
pub use repo::{
    CrudRepository, ItemRepository, MemberRepository, MemberRepositoryCustom, Repositories,
    TeamRepository,
};

use std::rc::Rc;

/// Session factory over the study model, auditing from the system clock.
///
/// # Errors
/// - `MappingError` when an entity graph names an unknown relation.
pub fn session_factory(config: OrmConfig) -> Result<SessionFactory, MappingError> {
    Ok(SessionFactory::new(
        config,
        model::metamodel()?,
        model::listeners(Rc::new(orm::SystemClock)),
    ))
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
