//! Generic CRUD contract shared by every repository.
//!
//! # Invariants
//! - `save` inserts transient instances and merges detached ones.
//! - Lookups by id return `Ok(None)` when nothing matches.
//! - Deletes are deferred to the session's next flush, except
//!   `delete_all_in_batch`, which is one set-based statement.

use crate::orm::{
    BulkMode, Entity, Managed, OrmResult, Page, PageRequest, QueryPlan, Session, Sort,
};
use std::marker::PhantomData;

/// Plans every CRUD repository needs, built from the entity's metadata.
#[derive(Debug)]
pub struct CrudPlans<T> {
    select_all: QueryPlan,
    select_by_ids: QueryPlan,
    delete_all: QueryPlan,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> CrudPlans<T> {
    pub fn new() -> Self {
        let meta = T::meta();
        Self {
            select_all: QueryPlan::select_all(meta),
            select_by_ids: QueryPlan::select_by_ids(meta),
            delete_all: QueryPlan::delete_all(meta),
            _entity: PhantomData,
        }
    }

    pub fn select_all(&self) -> &QueryPlan {
        &self.select_all
    }
}

impl<T: Entity> Default for CrudPlans<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub trait CrudRepository {
    type Entity: Entity;

    fn crud(&self) -> &CrudPlans<Self::Entity>;

    fn save(
        &self,
        session: &mut Session<'_>,
        entity: &Managed<Self::Entity>,
    ) -> OrmResult<Managed<Self::Entity>> {
        session.merge(entity)
    }

    fn save_all(
        &self,
        session: &mut Session<'_>,
        entities: &[Managed<Self::Entity>],
    ) -> OrmResult<Vec<Managed<Self::Entity>>> {
        entities
            .iter()
            .map(|entity| self.save(session, entity))
            .collect()
    }

    fn find_by_id(
        &self,
        session: &mut Session<'_>,
        id: i64,
    ) -> OrmResult<Option<Managed<Self::Entity>>> {
        session.find::<Self::Entity>(id)
    }

    fn exists_by_id(&self, session: &mut Session<'_>, id: i64) -> OrmResult<bool> {
        Ok(self.find_by_id(session, id)?.is_some())
    }

    fn find_all(&self, session: &mut Session<'_>) -> OrmResult<Vec<Managed<Self::Entity>>> {
        session.query(&self.crud().select_all).list()
    }

    fn find_all_sorted(
        &self,
        session: &mut Session<'_>,
        sort: Sort,
    ) -> OrmResult<Vec<Managed<Self::Entity>>> {
        session.query(&self.crud().select_all).sort(sort).list()
    }

    fn find_all_paged(
        &self,
        session: &mut Session<'_>,
        request: &PageRequest,
    ) -> OrmResult<Page<Managed<Self::Entity>>> {
        session.query(&self.crud().select_all).page(request)
    }

    fn find_all_by_id(
        &self,
        session: &mut Session<'_>,
        ids: &[i64],
    ) -> OrmResult<Vec<Managed<Self::Entity>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        session
            .query(&self.crud().select_by_ids)
            .bind("ids", ids)
            .list()
    }

    fn count(&self, session: &mut Session<'_>) -> OrmResult<u64> {
        session.query(&self.crud().select_all).count()
    }

    fn delete(&self, session: &mut Session<'_>, entity: &Managed<Self::Entity>) -> OrmResult<()> {
        session.remove(entity)
    }

    /// Missing ids are ignored.
    fn delete_by_id(&self, session: &mut Session<'_>, id: i64) -> OrmResult<()> {
        match self.find_by_id(session, id)? {
            Some(entity) => session.remove(&entity),
            None => Ok(()),
        }
    }

    /// Loads every row and removes each through the session.
    fn delete_all(&self, session: &mut Session<'_>) -> OrmResult<()> {
        for entity in self.find_all(session)? {
            session.remove(&entity)?;
        }
        Ok(())
    }

    /// One DELETE without loading; tracked instances are handled per `mode`.
    fn delete_all_in_batch(&self, session: &mut Session<'_>, mode: BulkMode) -> OrmResult<usize> {
        session.query(&self.crud().delete_all).execute_update(mode)
    }
}
