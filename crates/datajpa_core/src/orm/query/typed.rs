//! Call-time execution of compiled query plans.

use super::args::{Arg, Args};
use super::page::{Page, PageRequest, Slice, Sort};
use super::plan::{QueryKind, QueryPlan, Selection, Window};
use super::{BulkMode, Projection};
use crate::orm::error::{OrmError, OrmResult};
use crate::orm::managed::Managed;
use crate::orm::mapping::{Entity, EntityGraph};
use crate::orm::session::{LockMode, Session};
use rusqlite::types::FromSql;

/// A plan bound to a session, plus parameters and hints for one execution.
pub struct TypedQuery<'s, 'conn> {
    session: &'s mut Session<'conn>,
    plan: &'s QueryPlan,
    args: Args,
    read_only: bool,
    lock: LockMode,
    graph: Option<&'static EntityGraph>,
    sort: Sort,
}

impl<'s, 'conn> TypedQuery<'s, 'conn> {
    pub(crate) fn new(session: &'s mut Session<'conn>, plan: &'s QueryPlan) -> Self {
        Self {
            session,
            plan,
            args: Args::new(),
            read_only: false,
            lock: LockMode::None,
            graph: None,
            sort: Sort::unsorted(),
        }
    }

    /// Binds `:name`.
    pub fn bind(mut self, name: &str, value: impl Into<Arg>) -> Self {
        self.args = self.args.bind(name, value);
        self
    }

    /// Binds the next positional parameter (`?1` first).
    pub fn arg(mut self, value: impl Into<Arg>) -> Self {
        self.args = self.args.push(value);
        self
    }

    pub fn with_args(mut self, args: Args) -> Self {
        self.args = args;
        self
    }

    /// Loaded instances are never written back by flush.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Locks every returned instance.
    pub fn lock(mut self, mode: LockMode) -> Self {
        self.lock = mode;
        self
    }

    /// Fetches the graph's relations in the same statement.
    pub fn graph(mut self, graph: &'static EntityGraph) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Appends ordering after any declared `order by`.
    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = self.sort.and(sort);
        self
    }

    pub fn list<T: Entity>(mut self) -> OrmResult<Vec<Managed<T>>> {
        self.require_kind(&[QueryKind::Select, QueryKind::Exists], "list")?;
        let sort = self.sort.clone();
        self.fetch::<T>(&sort, None)
    }

    /// Exactly one result.
    ///
    /// # Errors
    /// - `NoResult` for zero rows, `NonUniqueResult` for more than one.
    pub fn single<T: Entity>(self) -> OrmResult<Managed<T>> {
        let query = self.plan.source().to_string();
        let mut found = self.list::<T>()?;
        match found.len() {
            0 => Err(OrmError::NoResult { query }),
            1 => Ok(found.remove(0)),
            count => Err(OrmError::NonUniqueResult { query, count }),
        }
    }

    /// Zero or one result; never an error for zero rows.
    pub fn optional<T: Entity>(self) -> OrmResult<Option<Managed<T>>> {
        let query = self.plan.source().to_string();
        let mut found = self.list::<T>()?;
        match found.len() {
            0 => Ok(None),
            1 => Ok(Some(found.remove(0))),
            count => Err(OrmError::NonUniqueResult { query, count }),
        }
    }

    /// One page plus totals. The count query is skipped when the page
    /// itself proves the total.
    pub fn page<T: Entity>(mut self, request: &PageRequest) -> OrmResult<Page<Managed<T>>> {
        self.require_kind(&[QueryKind::Select], "page")?;
        let size = self.session.config().normalize_page_size(request.size());
        let request = request.with_size(size);
        let sort = self.sort.clone().and(request.sort().clone());
        let window = Window {
            limit: u64::from(size),
            offset: request.offset(),
        };
        let content = self.fetch::<T>(&sort, Some(window))?;

        let fetched = content.len() as u64;
        let total = if fetched < u64::from(size) && (request.offset() == 0 || fetched > 0) {
            request.offset() + fetched
        } else {
            self.count_rows()?
        };
        Ok(Page::new(content, &request, total))
    }

    /// One page without a total; fetches a single extra row to learn
    /// whether another page exists.
    pub fn slice<T: Entity>(mut self, request: &PageRequest) -> OrmResult<Slice<Managed<T>>> {
        self.require_kind(&[QueryKind::Select], "slice")?;
        let size = self.session.config().normalize_page_size(request.size());
        let request = request.with_size(size);
        let sort = self.sort.clone().and(request.sort().clone());
        let window = Window {
            limit: u64::from(size) + 1,
            offset: request.offset(),
        };
        let content = self.fetch::<T>(&sort, Some(window))?;
        Ok(Slice::new(content, &request))
    }

    /// First column of every row.
    pub fn scalars<V: FromSql>(mut self) -> OrmResult<Vec<V>> {
        self.require_kind(&[QueryKind::Select], "scalars")?;
        match &self.plan.selection {
            Selection::Scalars(columns) if columns.len() == 1 => {}
            Selection::Count { .. } => {}
            other => {
                return Err(OrmError::InvalidQueryUsage(format!(
                    "`{}` selects {}, expected one scalar column",
                    self.plan.source(),
                    other.describe()
                )))
            }
        }
        self.session.flush_before_query()?;
        let rendered = self
            .plan
            .render_select(&self.args, None, Some(&self.sort), None)?;
        self.session
            .fetch_rows(&rendered.sql, &rendered.values, |row| row.get::<_, V>(0))
    }

    /// Rows built through the projection's constructor.
    pub fn project<P: Projection>(mut self) -> OrmResult<Vec<P>> {
        self.require_kind(&[QueryKind::Select], "project")?;
        match &self.plan.selection {
            Selection::Constructor { name, args } if name == P::NAME && args.len() == P::ARITY => {}
            other => {
                return Err(OrmError::InvalidQueryUsage(format!(
                    "`{}` selects {}, expected new {}/{}",
                    self.plan.source(),
                    other.describe(),
                    P::NAME,
                    P::ARITY
                )))
            }
        }
        self.session.flush_before_query()?;
        let rendered = self
            .plan
            .render_select(&self.args, None, Some(&self.sort), None)?;
        self.session
            .fetch_rows(&rendered.sql, &rendered.values, |row| P::from_row(row))
    }

    /// Number of rows the query matches.
    pub fn count(mut self) -> OrmResult<u64> {
        self.require_kind(&[QueryKind::Select, QueryKind::Exists], "count")?;
        self.count_rows()
    }

    pub fn exists(mut self) -> OrmResult<bool> {
        self.require_kind(&[QueryKind::Select, QueryKind::Exists], "exists")?;
        Ok(self.count_rows()? > 0)
    }

    /// Runs a bulk UPDATE/DELETE and returns the affected row count.
    ///
    /// With `BulkMode::MarkStale`, tracked instances of the target entity
    /// fail with `EvictionRequired` until cleared, evicted or refreshed.
    pub fn execute_update(mut self, mode: BulkMode) -> OrmResult<usize> {
        self.require_kind(&[QueryKind::BulkUpdate, QueryKind::BulkDelete], "execute_update")?;
        self.session.execute_bulk(self.plan, &self.args, mode)
    }

    /// Loads the matches of a derived delete and removes each through the
    /// session. Returns how many were removed.
    pub fn delete<T: Entity>(mut self) -> OrmResult<usize> {
        self.require_kind(&[QueryKind::DerivedDelete], "delete")?;
        let sort = self.sort.clone();
        let doomed = self.fetch::<T>(&sort, None)?;
        for entity in &doomed {
            self.session.remove(entity)?;
        }
        Ok(doomed.len())
    }

    fn fetch<T: Entity>(&mut self, sort: &Sort, window: Option<Window>) -> OrmResult<Vec<Managed<T>>> {
        if self.plan.selection != Selection::Entity || self.plan.root.name != T::meta().name {
            return Err(OrmError::InvalidQueryUsage(format!(
                "`{}` selects {} of {}, not {} entities",
                self.plan.source(),
                self.plan.selection.describe(),
                self.plan.root.name,
                T::meta().name
            )));
        }
        self.session.flush_before_query()?;
        let rendered = self
            .plan
            .render_select(&self.args, self.graph, Some(sort), window)?;
        let loaded = self.session.load_entities::<T>(&rendered, self.read_only)?;
        if self.lock != LockMode::None {
            for entity in &loaded {
                self.session.lock(entity, self.lock)?;
            }
        }
        Ok(loaded)
    }

    fn count_rows(&mut self) -> OrmResult<u64> {
        self.session.flush_before_query()?;
        let (sql, values) = self.plan.render_count(&self.args)?;
        let counts = self
            .session
            .fetch_rows(&sql, &values, |row| row.get::<_, i64>(0))?;
        Ok(counts
            .first()
            .map_or(0, |count| u64::try_from(*count).unwrap_or(0)))
    }

    fn require_kind(&self, kinds: &[QueryKind], terminal: &str) -> OrmResult<()> {
        if kinds.contains(&self.plan.kind) {
            Ok(())
        } else {
            Err(OrmError::InvalidQueryUsage(format!(
                "`{terminal}` cannot run `{}` ({:?})",
                self.plan.source(),
                self.plan.kind
            )))
        }
    }
}
