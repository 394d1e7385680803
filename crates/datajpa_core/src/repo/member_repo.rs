//! Member repository: derived, declared, paged, bulk, graph, hint and lock
//! queries over `Member`.
//!
//! # Responsibility
//! - Compile every query once, in `MemberRepository::new`, so a broken
//!   declaration fails before any session is opened.
//! - Bind call arguments and pick the result shape per method.
//!
//! # Invariants
//! - Methods never re-parse query text; they only bind parameters.

use super::crud::{CrudPlans, CrudRepository};
use crate::model::{Member, MemberDto};
use crate::orm::{
    BulkMode, EntityGraph, LockMode, Managed, MappingError, Metamodel, OrmResult, Page,
    PageRequest, QueryCompiler, QueryPlan, Session, Slice,
};
use log::debug;

const FIND_USER: &str = "select m from Member m where m.username = :username and m.age = :age";
const FIND_USERNAME_LIST: &str = "select m.username from Member m";
const FIND_MEMBER_DTO: &str =
    "select new study.datajpa.dto.MemberDto(m.id, m.username, t.name) from Member m join m.team t";
const FIND_BY_NAMES: &str = "select m from Member m where m.username in :names";
const FIND_BY_AGE: &str = "select m from Member m left join m.team t where m.age = :age";
const COUNT_BY_AGE: &str = "select count(m) from Member m where m.age = :age";
const BULK_AGE_PLUS: &str = "update Member m set m.age = m.age + 1 where m.age >= :age";
const FIND_MEMBER_FETCH_JOIN: &str = "select m from Member m left join fetch m.team t";
const FIND_MEMBER_ENTITY_GRAPH: &str = "select m from Member m";
const FIND_MEMBER_CUSTOM: &str = "select m from Member m";

/// Queries implemented by hand next to the generated ones.
pub trait MemberRepositoryCustom {
    fn find_member_custom(&self, session: &mut Session<'_>) -> OrmResult<Vec<Managed<Member>>>;
}

/// Hand-written fragment composed into `MemberRepository`.
#[derive(Debug)]
pub struct MemberRepositoryImpl {
    find_member_custom: QueryPlan,
}

impl MemberRepositoryImpl {
    pub fn new(compiler: &QueryCompiler<'_>) -> Result<Self, MappingError> {
        Ok(Self {
            find_member_custom: compiler.jpql(FIND_MEMBER_CUSTOM)?,
        })
    }
}

impl MemberRepositoryCustom for MemberRepositoryImpl {
    fn find_member_custom(&self, session: &mut Session<'_>) -> OrmResult<Vec<Managed<Member>>> {
        session.query(&self.find_member_custom).list()
    }
}

#[derive(Debug)]
pub struct MemberRepository {
    crud: CrudPlans<Member>,
    custom: MemberRepositoryImpl,
    member_all: &'static EntityGraph,
    by_username_and_age_greater_than: QueryPlan,
    top3_by_age_desc: QueryPlan,
    by_username: QueryPlan,
    count_by_age: QueryPlan,
    exists_by_username: QueryPlan,
    delete_by_username: QueryPlan,
    find_user: QueryPlan,
    find_username_list: QueryPlan,
    find_member_dto: QueryPlan,
    find_by_names: QueryPlan,
    find_by_age: QueryPlan,
    bulk_age_plus: QueryPlan,
    find_member_fetch_join: QueryPlan,
    find_member_entity_graph: QueryPlan,
    entity_graph_by_username: QueryPlan,
    read_only_by_username: QueryPlan,
    lock_by_username: QueryPlan,
}

impl MemberRepository {
    /// Compiles and verifies every member query.
    ///
    /// # Errors
    /// - `MappingError` for the first declaration that does not match the
    ///   `Member` mapping.
    pub fn new(metamodel: &Metamodel) -> Result<Self, MappingError> {
        let compiler = QueryCompiler::for_entity::<Member>(metamodel)?;
        let repository = Self {
            crud: CrudPlans::new(),
            custom: MemberRepositoryImpl::new(&compiler)?,
            member_all: compiler.graph("Member.all")?,
            by_username_and_age_greater_than: compiler
                .derived("findByUsernameAndAgeGreaterThan")?,
            top3_by_age_desc: compiler.derived("findTop3ByOrderByAgeDesc")?,
            by_username: compiler.derived("findListByUsername")?,
            count_by_age: compiler.derived("countByAge")?,
            exists_by_username: compiler.derived("existsByUsername")?,
            delete_by_username: compiler.derived("deleteByUsername")?,
            find_user: compiler.jpql(FIND_USER)?,
            find_username_list: compiler.jpql(FIND_USERNAME_LIST)?,
            find_member_dto: compiler.jpql_projection::<MemberDto>(FIND_MEMBER_DTO)?,
            find_by_names: compiler.jpql(FIND_BY_NAMES)?,
            find_by_age: compiler.jpql_with_count(FIND_BY_AGE, COUNT_BY_AGE)?,
            bulk_age_plus: compiler.jpql(BULK_AGE_PLUS)?,
            find_member_fetch_join: compiler.jpql(FIND_MEMBER_FETCH_JOIN)?,
            find_member_entity_graph: compiler.jpql(FIND_MEMBER_ENTITY_GRAPH)?,
            entity_graph_by_username: compiler.derived("findEntityGraphByUsername")?,
            read_only_by_username: compiler.derived("findReadOnlyByUsername")?,
            lock_by_username: compiler.derived("findLockByUsername")?,
        };
        debug!("event=repository_verify module=repo status=ok repository=member");
        Ok(repository)
    }

    pub fn find_by_username_and_age_greater_than(
        &self,
        session: &mut Session<'_>,
        username: &str,
        age: i32,
    ) -> OrmResult<Vec<Managed<Member>>> {
        session
            .query(&self.by_username_and_age_greater_than)
            .arg(username)
            .arg(age)
            .list()
    }

    /// The three oldest members.
    pub fn find_top3_by_age_desc(
        &self,
        session: &mut Session<'_>,
    ) -> OrmResult<Vec<Managed<Member>>> {
        session.query(&self.top3_by_age_desc).list()
    }

    pub fn count_by_age(&self, session: &mut Session<'_>, age: i32) -> OrmResult<u64> {
        session.query(&self.count_by_age).arg(age).count()
    }

    pub fn exists_by_username(&self, session: &mut Session<'_>, username: &str) -> OrmResult<bool> {
        session.query(&self.exists_by_username).arg(username).exists()
    }

    /// Removes every member named `username`; returns how many were removed.
    pub fn delete_by_username(&self, session: &mut Session<'_>, username: &str) -> OrmResult<usize> {
        session
            .query(&self.delete_by_username)
            .arg(username)
            .delete::<Member>()
    }

    pub fn find_user(
        &self,
        session: &mut Session<'_>,
        username: &str,
        age: i32,
    ) -> OrmResult<Vec<Managed<Member>>> {
        session
            .query(&self.find_user)
            .bind("username", username)
            .bind("age", age)
            .list()
    }

    pub fn find_username_list(&self, session: &mut Session<'_>) -> OrmResult<Vec<String>> {
        session.query(&self.find_username_list).scalars()
    }

    /// Members with a team, as `MemberDto`s.
    pub fn find_member_dto(&self, session: &mut Session<'_>) -> OrmResult<Vec<MemberDto>> {
        session.query(&self.find_member_dto).project()
    }

    pub fn find_by_names(
        &self,
        session: &mut Session<'_>,
        names: &[&str],
    ) -> OrmResult<Vec<Managed<Member>>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        session.query(&self.find_by_names).bind("names", names).list()
    }

    pub fn find_list_by_username(
        &self,
        session: &mut Session<'_>,
        username: &str,
    ) -> OrmResult<Vec<Managed<Member>>> {
        session.query(&self.by_username).arg(username).list()
    }

    /// # Errors
    /// - `NoResult` when nobody has the name, `NonUniqueResult` when several do.
    pub fn find_member_by_username(
        &self,
        session: &mut Session<'_>,
        username: &str,
    ) -> OrmResult<Managed<Member>> {
        session.query(&self.by_username).arg(username).single()
    }

    /// # Errors
    /// - `NonUniqueResult` when several members have the name.
    pub fn find_optional_by_username(
        &self,
        session: &mut Session<'_>,
        username: &str,
    ) -> OrmResult<Option<Managed<Member>>> {
        session.query(&self.by_username).arg(username).optional()
    }

    /// One page of members of `age`; the total comes from a dedicated count
    /// query without the team join.
    pub fn find_by_age(
        &self,
        session: &mut Session<'_>,
        age: i32,
        request: &PageRequest,
    ) -> OrmResult<Page<Managed<Member>>> {
        session.query(&self.find_by_age).bind("age", age).page(request)
    }

    pub fn find_slice_by_age(
        &self,
        session: &mut Session<'_>,
        age: i32,
        request: &PageRequest,
    ) -> OrmResult<Slice<Managed<Member>>> {
        session.query(&self.find_by_age).bind("age", age).slice(request)
    }

    /// Adds one to the age of every member at least `age` years old, in one
    /// statement. Returns the number of rows changed.
    pub fn bulk_age_plus(
        &self,
        session: &mut Session<'_>,
        age: i32,
        mode: BulkMode,
    ) -> OrmResult<usize> {
        session
            .query(&self.bulk_age_plus)
            .bind("age", age)
            .execute_update(mode)
    }

    pub fn find_member_fetch_join(
        &self,
        session: &mut Session<'_>,
    ) -> OrmResult<Vec<Managed<Member>>> {
        session.query(&self.find_member_fetch_join).list()
    }

    /// `find_all` with teams fetched in the same statement.
    pub fn find_all_with_graph(&self, session: &mut Session<'_>) -> OrmResult<Vec<Managed<Member>>> {
        session
            .query(self.crud.select_all())
            .graph(self.member_all)
            .list()
    }

    pub fn find_member_entity_graph(
        &self,
        session: &mut Session<'_>,
    ) -> OrmResult<Vec<Managed<Member>>> {
        session
            .query(&self.find_member_entity_graph)
            .graph(self.member_all)
            .list()
    }

    /// Members named `username`, loaded through the `Member.all` graph.
    pub fn find_entity_graph_by_username(
        &self,
        session: &mut Session<'_>,
        username: &str,
    ) -> OrmResult<Vec<Managed<Member>>> {
        session
            .query(&self.entity_graph_by_username)
            .arg(username)
            .graph(self.member_all)
            .list()
    }

    /// Loaded without a snapshot; later changes to it are never flushed.
    pub fn find_read_only_by_username(
        &self,
        session: &mut Session<'_>,
        username: &str,
    ) -> OrmResult<Option<Managed<Member>>> {
        session
            .query(&self.read_only_by_username)
            .arg(username)
            .read_only()
            .optional()
    }

    /// Members named `username`, each under a pessimistic write lock held
    /// until the session ends.
    pub fn find_lock_by_username(
        &self,
        session: &mut Session<'_>,
        username: &str,
    ) -> OrmResult<Vec<Managed<Member>>> {
        session
            .query(&self.lock_by_username)
            .arg(username)
            .lock(LockMode::PessimisticWrite)
            .list()
    }
}

impl CrudRepository for MemberRepository {
    type Entity = Member;

    fn crud(&self) -> &CrudPlans<Member> {
        &self.crud
    }
}

impl MemberRepositoryCustom for MemberRepository {
    fn find_member_custom(&self, session: &mut Session<'_>) -> OrmResult<Vec<Managed<Member>>> {
        self.custom.find_member_custom(session)
    }
}
