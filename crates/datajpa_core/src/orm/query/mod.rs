//! Query translation: derived method names and declared statements compiled
//! into plans at repository construction, executed through `TypedQuery`.
//!
//! # Invariants
//! - Every plan is verified against the metamodel when compiled; call time
//!   only binds parameters.
//! - Projection constructors are matched by name and arity at compile time.

mod args;
mod derived;
mod jpql;
mod lexer;
mod page;
pub(crate) mod plan;
mod typed;

pub use args::{Arg, Args};
pub use page::{Direction, Order, Page, PageRequest, Slice, Sort};
pub use plan::{ParamRef, QueryKind, QueryPlan};
pub use typed::TypedQuery;

use super::error::MappingError;
use super::mapping::{Entity, EntityGraph, EntityMeta, Metamodel};
use plan::Selection;
use rusqlite::Row;

/// Result shape built positionally from the selected columns of a
/// `select new Name(...)` query.
pub trait Projection: Sized {
    const NAME: &'static str;
    const ARITY: usize;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// What a bulk statement does to instances the session already tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BulkMode {
    /// Mark them stale; touching them fails until cleared, evicted or refreshed.
    #[default]
    MarkStale,
    /// Clear the session right after the statement.
    ClearAfter,
}

/// Compiles the queries of one repository, rooted at one entity.
#[derive(Debug, Clone, Copy)]
pub struct QueryCompiler<'m> {
    metamodel: &'m Metamodel,
    root: &'static EntityMeta,
}

impl<'m> QueryCompiler<'m> {
    /// # Errors
    /// - `UnknownEntity` when `T` is not registered in `metamodel`.
    pub fn for_entity<T: Entity>(metamodel: &'m Metamodel) -> Result<Self, MappingError> {
        let root = T::meta();
        metamodel
            .entity(root.name)
            .map(|root| Self { metamodel, root })
            .ok_or_else(|| MappingError::UnknownEntity {
                query: String::new(),
                entity: root.name.to_string(),
            })
    }

    pub fn root(&self) -> &'static EntityMeta {
        self.root
    }

    /// Derives a query from a method name such as `findByUsernameAndAge`.
    pub fn derived(&self, method: &str) -> Result<QueryPlan, MappingError> {
        derived::compile(method, self.root)
    }

    /// Compiles a declared statement selecting root entities, scalar
    /// columns or a count, or a bulk update/delete.
    pub fn jpql(&self, query: &str) -> Result<QueryPlan, MappingError> {
        let plan = jpql::compile(query, self.metamodel)?;
        match &plan.selection {
            Selection::Entity if plan.kind == QueryKind::Select && plan.root.name != self.root.name => {
                Err(MappingError::ProjectionMismatch {
                    query: query.to_string(),
                    expected: self.root.name.to_string(),
                    found: plan.root.name.to_string(),
                })
            }
            Selection::Constructor { .. } => Err(MappingError::ProjectionMismatch {
                query: query.to_string(),
                expected: "entity, scalar or count".to_string(),
                found: plan.selection.describe(),
            }),
            _ => Ok(plan),
        }
    }

    /// `jpql` with a separate count statement used for paging totals.
    pub fn jpql_with_count(&self, query: &str, count_query: &str) -> Result<QueryPlan, MappingError> {
        let mut plan = self.jpql(query)?;
        let count = jpql::compile(count_query, self.metamodel)?;
        if !matches!(count.selection, Selection::Count { .. }) || count.kind != QueryKind::Select {
            return Err(MappingError::ProjectionMismatch {
                query: count_query.to_string(),
                expected: "count".to_string(),
                found: count.selection.describe(),
            });
        }
        plan.count_plan = Some(Box::new(count));
        Ok(plan)
    }

    /// Compiles a `select new P(...)` statement and checks it against `P`.
    pub fn jpql_projection<P: Projection>(&self, query: &str) -> Result<QueryPlan, MappingError> {
        let plan = jpql::compile(query, self.metamodel)?;
        match &plan.selection {
            Selection::Constructor { name, args } if name == P::NAME && args.len() == P::ARITY => {
                Ok(plan)
            }
            other => Err(MappingError::ProjectionMismatch {
                query: query.to_string(),
                expected: format!("new {}/{}", P::NAME, P::ARITY),
                found: other.describe(),
            }),
        }
    }

    /// Looks up a named entity graph of the root entity.
    pub fn graph(&self, name: &str) -> Result<&'static EntityGraph, MappingError> {
        self.root
            .graph(name)
            .ok_or_else(|| MappingError::UnknownEntityGraph {
                entity: self.root.name,
                graph: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::{Args, Projection, QueryCompiler, QueryKind};
    use crate::model::{metamodel, Member, MemberDto};
    use crate::orm::error::MappingError;
    use crate::orm::query::plan::Window;
    use crate::orm::query::{PageRequest, Sort};
    use rusqlite::types::Value;

    fn compiler() -> QueryCompiler<'static> {
        let model = Box::leak(Box::new(metamodel().unwrap()));
        QueryCompiler::for_entity::<Member>(model).unwrap()
    }

    fn select_sql(plan: &super::QueryPlan, args: &Args) -> (String, Vec<Value>) {
        let rendered = plan.render_select(args, None, None, None).unwrap();
        (rendered.sql, rendered.values)
    }

    #[test]
    fn derived_and_predicates_bind_in_order() {
        let plan = compiler()
            .derived("findByUsernameAndAgeGreaterThan")
            .unwrap();
        let args = Args::new().push("AAA").push(15);
        let (sql, values) = select_sql(&plan, &args);
        assert!(sql.ends_with("FROM member m WHERE m.username = ? AND m.age > ?"), "{sql}");
        assert_eq!(values, vec![Value::Text("AAA".into()), Value::Integer(15)]);
    }

    #[test]
    fn derived_or_keeps_and_precedence() {
        let plan = compiler()
            .derived("findByUsernameOrAgeLessThanAndAgeGreaterThanEqual")
            .unwrap();
        let args = Args::new().push("x").push(30).push(10);
        let (sql, _) = select_sql(&plan, &args);
        assert!(
            sql.ends_with("WHERE m.username = ? OR m.age < ? AND m.age >= ?"),
            "{sql}"
        );
    }

    #[test]
    fn derived_top_and_order_by() {
        let plan = compiler().derived("findTop3ByOrderByAgeDesc").unwrap();
        let (sql, values) = select_sql(&plan, &Args::new());
        assert!(sql.ends_with("ORDER BY m.age DESC LIMIT 3"), "{sql}");
        assert!(values.is_empty());
    }

    #[test]
    fn derived_nested_property_joins_relation() {
        let plan = compiler().derived("findByTeamName").unwrap();
        let (sql, _) = select_sql(&plan, &Args::new().push("teamA"));
        assert!(
            sql.contains("JOIN team m_team ON m_team.team_id = m.team_id WHERE m_team.name = ?"),
            "{sql}"
        );
    }

    #[test]
    fn derived_ignore_case_and_containing() {
        let plan = compiler()
            .derived("findByUsernameContainingIgnoreCase")
            .unwrap();
        let (sql, _) = select_sql(&plan, &Args::new().push("mem"));
        assert!(
            sql.ends_with("WHERE UPPER(m.username) LIKE '%' || UPPER( ? ) || '%'"),
            "{sql}"
        );
    }

    #[test]
    fn derived_count_and_exists_subjects() {
        let compiler = compiler();
        let count = compiler.derived("countByAge").unwrap();
        let (sql, _) = select_sql(&count, &Args::new().push(10));
        assert!(sql.starts_with("SELECT COUNT(m.member_id) FROM member m"), "{sql}");

        let exists = compiler.derived("existsByUsername").unwrap();
        assert_eq!(exists.kind(), QueryKind::Exists);
        let delete = compiler.derived("deleteByUsername").unwrap();
        assert_eq!(delete.kind(), QueryKind::DerivedDelete);
    }

    #[test]
    fn derived_unknown_property_fails_fast() {
        let err = compiler().derived("findByNickname").unwrap_err();
        assert!(matches!(
            err,
            MappingError::UnknownAttribute { ref attribute, .. } if attribute == "nickname"
        ));
        let err = compiler().derived("fetchByUsername").unwrap_err();
        assert!(matches!(err, MappingError::InvalidDerivedQuery { .. }));
    }

    #[test]
    fn in_list_expands_one_placeholder_per_value() {
        let plan = compiler()
            .jpql("select m from Member m where m.username in :names")
            .unwrap();
        let args = Args::new().bind("names", &["AAA", "BBB", "CCC"][..]);
        let (sql, values) = select_sql(&plan, &args);
        assert!(sql.ends_with("WHERE m.username IN (?, ?, ?)"), "{sql}");
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn missing_parameter_is_reported_at_render() {
        let plan = compiler()
            .jpql("select m from Member m where m.username = :username and m.age = :age")
            .unwrap();
        let err = plan
            .render_select(&Args::new().bind("username", "AAA"), None, None, None)
            .err()
            .unwrap();
        assert!(err.to_string().contains(":age"));
    }

    #[test]
    fn fetch_join_selects_relation_columns() {
        let plan = compiler()
            .jpql("select m from Member m left join fetch m.team t")
            .unwrap();
        let rendered = plan.render_select(&Args::new(), None, None, None).unwrap();
        assert!(rendered.sql.contains("t.team_id, t.name FROM member m LEFT JOIN team t"));
        assert_eq!(rendered.fetches.len(), 1);
    }

    #[test]
    fn entity_graph_adds_outer_fetch_join() {
        let compiler = compiler();
        let graph = compiler.graph("Member.all").unwrap();
        let plan = compiler.derived("findByUsername").unwrap();
        let rendered = plan
            .render_select(&Args::new().push("member1"), Some(graph), None, None)
            .unwrap();
        assert!(
            rendered
                .sql
                .contains("LEFT JOIN team g_team ON g_team.team_id = m.team_id"),
            "{}",
            rendered.sql
        );
        assert_eq!(rendered.fetches.len(), 1);
        assert!(compiler.graph("Member.none").is_err());
    }

    #[test]
    fn count_query_drops_order_and_outer_fetch_joins() {
        let plan = compiler()
            .jpql("select m from Member m left join fetch m.team t where m.age = :age order by m.username desc")
            .unwrap();
        let (sql, _) = plan.render_count(&Args::new().bind("age", 10)).unwrap();
        assert_eq!(sql, "SELECT COUNT(m.member_id) FROM member m WHERE m.age = ?");
    }

    #[test]
    fn explicit_count_query_is_used_for_totals() {
        let plan = compiler()
            .jpql_with_count(
                "select m from Member m left join m.team t where m.age = :age",
                "select count(m.username) from Member m where m.age = :age",
            )
            .unwrap();
        assert!(plan.has_count_query());
        let (sql, _) = plan.render_count(&Args::new().bind("age", 10)).unwrap();
        assert_eq!(sql, "SELECT COUNT(m.username) FROM member m WHERE m.age = ?");
    }

    #[test]
    fn page_window_and_sort_render_after_filter() {
        let plan = compiler().derived("findByAge").unwrap();
        let request = PageRequest::of(1, 3).with_sort(Sort::desc("username"));
        let rendered = plan
            .render_select(
                &Args::new().push(10),
                None,
                Some(request.sort()),
                Some(Window {
                    limit: 3,
                    offset: request.offset(),
                }),
            )
            .unwrap();
        assert!(rendered
            .sql
            .ends_with("WHERE m.age = ? ORDER BY m.username DESC LIMIT ? OFFSET ?"));
        assert_eq!(
            rendered.values,
            vec![Value::Integer(10), Value::Integer(3), Value::Integer(3)]
        );
    }

    #[test]
    fn unknown_sort_property_is_rejected() {
        let plan = compiler().derived("findByAge").unwrap();
        let err = plan
            .render_select(&Args::new().push(1), None, Some(&Sort::asc("nickname")), None)
            .err()
            .unwrap();
        assert!(err.to_string().contains("nickname"));
    }

    #[test]
    fn bulk_update_renders_unqualified_columns() {
        let plan = compiler()
            .jpql("update Member m set m.age = m.age + 1 where m.age >= :age")
            .unwrap();
        let (sql, values) = plan.render_bulk(&Args::new().bind("age", 20)).unwrap();
        assert_eq!(sql, "UPDATE member SET age = age + 1 WHERE age >= ?");
        assert_eq!(values, vec![Value::Integer(20)]);
    }

    #[test]
    fn projection_constructor_checked_by_name_and_arity() {
        let compiler = compiler();
        let plan = compiler
            .jpql_projection::<MemberDto>(
                "select new study.datajpa.dto.MemberDto(m.id, m.username, t.name) from Member m join m.team t",
            )
            .unwrap();
        let (sql, _) = select_sql(&plan, &Args::new());
        assert!(sql.starts_with("SELECT m.member_id, m.username, t.name FROM member m JOIN team t"));

        let err = compiler
            .jpql_projection::<MemberDto>("select new MemberDto(m.id, m.username) from Member m")
            .unwrap_err();
        assert!(matches!(err, MappingError::ProjectionMismatch { .. }));
        assert_eq!(MemberDto::ARITY, 3);
    }

    #[test]
    fn declared_statements_fail_fast_on_unknown_names() {
        let compiler = compiler();
        assert!(matches!(
            compiler.jpql("select m from Membr m").unwrap_err(),
            MappingError::UnknownEntity { .. }
        ));
        assert!(matches!(
            compiler.jpql("select m from Member m where x.age = 1").unwrap_err(),
            MappingError::UnknownAlias { .. }
        ));
        assert!(matches!(
            compiler.jpql("select m from Member m where m.nickname = 1").unwrap_err(),
            MappingError::UnknownAttribute { .. }
        ));
        assert!(matches!(
            compiler.jpql("select m from Member m where").unwrap_err(),
            MappingError::Syntax { .. }
        ));
        assert!(matches!(
            compiler.jpql("select t from Team t").unwrap_err(),
            MappingError::ProjectionMismatch { .. }
        ));
    }

    #[test]
    fn grouped_conditions_and_functions_translate() {
        let plan = compiler()
            .jpql("select m from Member m where (m.age > 10 or m.age < 5) and lower(m.username) like :pattern")
            .unwrap();
        let (sql, _) = select_sql(&plan, &Args::new().bind("pattern", "m%"));
        assert!(
            sql.ends_with("WHERE ( m.age > 10 OR m.age < 5 ) AND LOWER( m.username ) LIKE ?"),
            "{sql}"
        );
    }
}
