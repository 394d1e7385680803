//! Entity metadata and the row mapping contract.
//!
//! # Responsibility
//! - Describe how an entity type maps onto one table (columns, to-one
//!   relations, version column, named entity graphs).
//! - Define `RowData`, the column -> value shape entities are written to and
//!   read from.
//!
//! # Invariants
//! - `RowData` produced by `Entity::write_row` never contains the id or
//!   version column; the session owns both.
//! - Relations are to-one only; the reciprocal side is an in-memory
//!   `Inverse` collection maintained by the owning entity.

use super::error::{MappingError, OrmError, OrmResult};
use super::managed::{Lazy, Managed};
use super::session::{load_fetched, FetchLoader, SessionMarker};
use rusqlite::types::Value;
use rusqlite::Row;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Formatter};
use std::rc::Weak;

/// One mapped scalar attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute {
    pub name: &'static str,
    pub column: &'static str,
    /// `false` keeps the column out of every UPDATE statement.
    pub updatable: bool,
}

impl Attribute {
    pub const fn new(name: &'static str, column: &'static str) -> Self {
        Self {
            name,
            column,
            updatable: true,
        }
    }

    /// Attribute written on insert only.
    pub const fn immutable(name: &'static str, column: &'static str) -> Self {
        Self {
            name,
            column,
            updatable: false,
        }
    }
}

/// Many-to-one relation physically stored as a foreign key column.
#[derive(Clone, Copy)]
pub struct Relation {
    pub name: &'static str,
    pub join_column: &'static str,
    pub target: fn() -> &'static EntityMeta,
    pub(crate) fetch: FetchLoader,
}

impl Relation {
    pub const fn many_to_one<T: Entity>(name: &'static str, join_column: &'static str) -> Self {
        Self {
            name,
            join_column,
            target: T::meta,
            fetch: load_fetched::<T>,
        }
    }
}

impl Debug for Relation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relation")
            .field("name", &self.name)
            .field("join_column", &self.join_column)
            .field("target", &(self.target)().name)
            .finish()
    }
}

/// Named, reusable set of relations to fetch together with the root entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityGraph {
    pub name: &'static str,
    pub paths: &'static [&'static str],
}

impl EntityGraph {
    pub const fn new(name: &'static str, paths: &'static [&'static str]) -> Self {
        Self { name, paths }
    }
}

/// Table mapping of one entity type.
pub struct EntityMeta {
    pub name: &'static str,
    pub table: &'static str,
    pub id_column: &'static str,
    pub attributes: &'static [Attribute],
    pub relations: &'static [Relation],
    pub version: Option<Attribute>,
    pub graphs: &'static [EntityGraph],
}

impl Debug for EntityMeta {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityMeta")
            .field("name", &self.name)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl EntityMeta {
    pub fn attribute(&self, name: &str) -> Option<&'static Attribute> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&'static Relation> {
        self.relations.iter().find(|relation| relation.name == name)
    }

    pub fn graph(&self, name: &str) -> Option<&'static EntityGraph> {
        self.graphs.iter().find(|graph| graph.name == name)
    }

    /// Resolves an attribute path segment to the column that stores it.
    ///
    /// `id`, the version attribute, scalar attributes and relation names
    /// (resolving to their join column) are accepted.
    pub fn column_for(&self, name: &str) -> Option<&'static str> {
        if name == "id" {
            return Some(self.id_column);
        }
        if let Some(version) = self.version.filter(|version| version.name == name) {
            return Some(version.column);
        }
        if let Some(attribute) = self.attribute(name) {
            return Some(attribute.column);
        }
        self.relation(name).map(|relation| relation.join_column)
    }

    /// Every column in select order: id, attributes, join columns, version.
    pub fn select_columns(&self) -> Vec<&'static str> {
        let mut columns = Vec::with_capacity(self.attributes.len() + self.relations.len() + 2);
        columns.push(self.id_column);
        columns.extend(self.attributes.iter().map(|attribute| attribute.column));
        columns.extend(self.relations.iter().map(|relation| relation.join_column));
        if let Some(version) = self.version {
            columns.push(version.column);
        }
        columns
    }

    pub fn is_updatable(&self, column: &str) -> bool {
        self.attributes
            .iter()
            .find(|attribute| attribute.column == column)
            .map_or(true, |attribute| attribute.updatable)
    }

    pub fn is_versioned(&self) -> bool {
        self.version.is_some()
    }
}

/// Column name -> scalar value representation of one entity row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowData {
    values: BTreeMap<&'static str, Value>,
}

impl RowData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.put(column, value);
        self
    }

    pub fn put(&mut self, column: &'static str, value: impl Into<Value>) {
        self.values.insert(column, value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&'static str, &Value)> + '_ {
        self.values.iter().map(|(column, value)| (*column, value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn i64(&self, column: &str) -> OrmResult<i64> {
        self.opt_i64(column)?
            .ok_or_else(|| OrmError::InvalidData(format!("column `{column}` is null")))
    }

    pub fn opt_i64(&self, column: &str) -> OrmResult<Option<i64>> {
        match self.values.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Integer(value)) => Ok(Some(*value)),
            Some(other) => Err(OrmError::InvalidData(format!(
                "expected integer in column `{column}`, got {other:?}"
            ))),
        }
    }

    pub fn i32(&self, column: &str) -> OrmResult<i32> {
        let value = self.i64(column)?;
        i32::try_from(value).map_err(|_| {
            OrmError::InvalidData(format!("value {value} in column `{column}` overflows i32"))
        })
    }

    pub fn opt_text(&self, column: &str) -> OrmResult<Option<String>> {
        match self.values.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Text(value)) => Ok(Some(value.clone())),
            Some(other) => Err(OrmError::InvalidData(format!(
                "expected text in column `{column}`, got {other:?}"
            ))),
        }
    }

    /// Columns whose value differs from `snapshot` and may be updated.
    pub(crate) fn changed_columns(&self, snapshot: &RowData, meta: &EntityMeta) -> Vec<&'static str> {
        self.values
            .iter()
            .filter(|(column, value)| {
                meta.is_updatable(column) && snapshot.values.get(*column) != Some(*value)
            })
            .map(|(column, _)| *column)
            .collect()
    }

    /// Reads `meta`'s select columns starting at `offset`.
    ///
    /// Returns `None` when the id column is null (unmatched outer join).
    pub(crate) fn read(
        row: &Row<'_>,
        offset: usize,
        meta: &EntityMeta,
    ) -> rusqlite::Result<Option<RowData>> {
        let mut data = RowData::new();
        for (index, column) in meta.select_columns().into_iter().enumerate() {
            let value: Value = row.get(offset + index)?;
            if column == meta.id_column && value == Value::Null {
                return Ok(None);
            }
            data.values.insert(column, value);
        }
        Ok(Some(data))
    }
}

/// Hydration context handed to `Entity::read_row`.
///
/// Binds lazy references to the loading session and supplies relations that
/// were already fetched in the same statement.
pub struct LoadContext {
    origin: Weak<SessionMarker>,
    prefetched: HashMap<&'static str, Box<dyn Any>>,
}

impl LoadContext {
    pub(crate) fn new(
        origin: Weak<SessionMarker>,
        prefetched: HashMap<&'static str, Box<dyn Any>>,
    ) -> Self {
        Self { origin, prefetched }
    }

    /// Builds the reference for relation `relation` with foreign key `id`.
    pub fn reference<T: Entity>(&mut self, relation: &'static str, id: Option<i64>) -> Lazy<T> {
        let Some(id) = id else {
            return Lazy::unset();
        };
        let reference = Lazy::unresolved(id, self.origin.clone());
        if let Some(fetched) = self.prefetched.remove(relation) {
            if let Some(handle) = fetched.downcast_ref::<Managed<T>>() {
                reference.fill(handle);
            }
        }
        reference
    }
}

/// A persistent type mapped by an `EntityMeta`.
pub trait Entity: Sized + 'static {
    fn meta() -> &'static EntityMeta;

    /// `None` while transient.
    fn id(&self) -> Option<i64>;

    fn assign_id(&mut self, id: i64);

    /// Every mapped column except id and version.
    fn write_row(&self) -> OrmResult<RowData>;

    /// Rebuilds an instance from a full row (id and version included).
    fn read_row(row: &RowData, ctx: &mut LoadContext) -> OrmResult<Self>;

    fn version(&self) -> Option<i64> {
        None
    }

    fn set_version(&mut self, _version: i64) {}

    /// Hands an eagerly fetched relation target to an already-loaded instance.
    fn prefill(&self, _relation: &str, _target: &dyn Any) -> OrmResult<()> {
        Ok(())
    }

    /// Called once the session holds `handle`, after a load, merge or
    /// refresh. Owning sides use it to keep reciprocal views in step.
    fn attach_relations(_handle: &Managed<Self>) -> OrmResult<()> {
        Ok(())
    }

    /// Copies in-memory state with no column from the instance a reload
    /// replaces.
    fn keep_unmapped(&mut self, _previous: &Self) {}
}

/// Registry of the entity types a query compiler may reference.
#[derive(Debug, Clone)]
pub struct Metamodel {
    entities: Vec<&'static EntityMeta>,
}

impl Metamodel {
    /// Builds the registry, rejecting entity graphs that name unknown relations.
    pub fn new(entities: Vec<&'static EntityMeta>) -> Result<Self, MappingError> {
        for meta in &entities {
            for graph in meta.graphs {
                if let Some(path) = graph.paths.iter().find(|path| meta.relation(path).is_none()) {
                    return Err(MappingError::InvalidEntityGraph {
                        graph: graph.name,
                        path: (*path).to_string(),
                    });
                }
            }
        }
        Ok(Self { entities })
    }

    pub fn entity(&self, name: &str) -> Option<&'static EntityMeta> {
        self.entities.iter().copied().find(|meta| meta.name == name)
    }

    pub fn entities(&self) -> &[&'static EntityMeta] {
        &self.entities
    }
}
