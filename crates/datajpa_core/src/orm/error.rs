//! Error taxonomy of the persistence core.
//!
//! # Invariants
//! - Nothing here is retried internally; every variant reaches the caller.
//! - `MappingError` is raised while repositories are constructed, never
//!   from a query call.

use crate::db::DbError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type OrmResult<T> = Result<T, OrmError>;

/// A query declaration or entity graph that cannot be interpreted against the
/// declared entity metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    UnknownEntity {
        query: String,
        entity: String,
    },
    UnknownAlias {
        query: String,
        alias: String,
    },
    UnknownAttribute {
        query: String,
        entity: &'static str,
        attribute: String,
    },
    InvalidDerivedQuery {
        method: String,
        reason: String,
    },
    Syntax {
        query: String,
        message: String,
    },
    ProjectionMismatch {
        query: String,
        expected: String,
        found: String,
    },
    InvalidEntityGraph {
        graph: &'static str,
        path: String,
    },
    UnknownEntityGraph {
        entity: &'static str,
        graph: String,
    },
}

impl Display for MappingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEntity { query, entity } => {
                write!(f, "unknown entity `{entity}` in query `{query}`")
            }
            Self::UnknownAlias { query, alias } => {
                write!(f, "unknown alias `{alias}` in query `{query}`")
            }
            Self::UnknownAttribute {
                query,
                entity,
                attribute,
            } => write!(
                f,
                "entity `{entity}` has no attribute `{attribute}` (query `{query}`)"
            ),
            Self::InvalidDerivedQuery { method, reason } => {
                write!(f, "cannot derive a query from `{method}`: {reason}")
            }
            Self::Syntax { query, message } => {
                write!(f, "malformed query `{query}`: {message}")
            }
            Self::ProjectionMismatch {
                query,
                expected,
                found,
            } => write!(
                f,
                "query `{query}` projects `{found}` but `{expected}` was declared"
            ),
            Self::InvalidEntityGraph { graph, path } => {
                write!(f, "entity graph `{graph}` names unknown relation `{path}`")
            }
            Self::UnknownEntityGraph { entity, graph } => {
                write!(f, "entity `{entity}` declares no entity graph `{graph}`")
            }
        }
    }
}

impl Error for MappingError {}

/// Errors surfaced by sessions, queries and repositories.
#[derive(Debug)]
pub enum OrmError {
    Db(DbError),
    Mapping(MappingError),
    /// Optimistic lock conflict: the stored version no longer matches.
    StaleVersion {
        entity: &'static str,
        id: i64,
        expected_version: Option<i64>,
    },
    /// A pessimistic lock could not be acquired within the wait timeout.
    LockTimeout {
        entity: &'static str,
        id: Option<i64>,
    },
    /// A lazy relation was touched outside the session that loaded it.
    DetachedAccess {
        entity: &'static str,
        id: i64,
    },
    /// A tracked instance went stale after a bulk statement and was not
    /// cleared, evicted or refreshed before use.
    EvictionRequired {
        entity: &'static str,
        id: i64,
    },
    /// Operation needs a managed instance but got a detached one.
    Detached {
        entity: &'static str,
        id: i64,
        operation: &'static str,
    },
    EntityRemoved {
        entity: &'static str,
        id: i64,
    },
    NotFound {
        entity: &'static str,
        id: i64,
    },
    /// A relation points at an instance that has no identity yet.
    TransientReference {
        entity: &'static str,
        relation: &'static str,
    },
    NoResult {
        query: String,
    },
    NonUniqueResult {
        query: String,
        count: usize,
    },
    MissingParameter(String),
    InvalidSortProperty {
        entity: &'static str,
        property: String,
    },
    InvalidQueryUsage(String),
    NotVersioned(&'static str),
    /// The instance is currently borrowed by the caller.
    EntityInUse(&'static str),
    InvalidData(String),
}

impl Display for OrmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Mapping(err) => write!(f, "{err}"),
            Self::StaleVersion {
                entity,
                id,
                expected_version: Some(version),
            } => write!(
                f,
                "{entity}#{id} was modified concurrently (expected version {version})"
            ),
            Self::StaleVersion { entity, id, .. } => {
                write!(f, "{entity}#{id} was modified or deleted concurrently")
            }
            Self::LockTimeout {
                entity,
                id: Some(id),
            } => write!(f, "timed out waiting for lock on {entity}#{id}"),
            Self::LockTimeout { entity, id: None } => {
                write!(f, "timed out waiting for lock on {entity}")
            }
            Self::DetachedAccess { entity, id } => write!(
                f,
                "cannot resolve {entity}#{id}: owning session is closed or cleared"
            ),
            Self::EvictionRequired { entity, id } => write!(
                f,
                "{entity}#{id} is stale after a bulk statement; clear, evict or refresh it first"
            ),
            Self::Detached {
                entity,
                id,
                operation,
            } => write!(f, "cannot {operation} detached instance {entity}#{id}"),
            Self::EntityRemoved { entity, id } => write!(f, "{entity}#{id} has been removed"),
            Self::NotFound { entity, id } => write!(f, "{entity}#{id} not found"),
            Self::TransientReference { entity, relation } => write!(
                f,
                "{entity}.{relation} references an instance that was never saved"
            ),
            Self::NoResult { query } => write!(f, "query `{query}` returned no rows"),
            Self::NonUniqueResult { query, count } => {
                write!(f, "query `{query}` returned {count} rows, expected at most one")
            }
            Self::MissingParameter(name) => write!(f, "no value bound for parameter `{name}`"),
            Self::InvalidSortProperty { entity, property } => {
                write!(f, "cannot sort {entity} by unknown property `{property}`")
            }
            Self::InvalidQueryUsage(message) => write!(f, "invalid query usage: {message}"),
            Self::NotVersioned(entity) => {
                write!(f, "{entity} has no version attribute for optimistic locking")
            }
            Self::EntityInUse(entity) => write!(f, "{entity} instance is borrowed elsewhere"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for OrmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Mapping(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for OrmError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for OrmError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<MappingError> for OrmError {
    fn from(value: MappingError) -> Self {
        Self::Mapping(value)
    }
}
