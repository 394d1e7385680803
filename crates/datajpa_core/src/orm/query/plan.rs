//! Compiled query plans and their SQL rendering.
//!
//! # Responsibility
//! - Hold the verified shape of a query: root entity, joins, filter, order,
//!   projection and parameter slots.
//! - Render SQL plus positional values at call time, expanding list
//!   arguments into IN-lists.
//!
//! # Invariants
//! - Count rendering never carries ORDER BY and never selects fetched
//!   columns; outer fetch joins are dropped entirely.
//! - Only to-one joins exist, so joins cannot multiply row counts.

use super::args::{Arg, Args};
use super::page::Sort;
use crate::orm::error::{OrmError, OrmResult};
use crate::orm::mapping::{EntityGraph, EntityMeta, Relation};
use rusqlite::types::Value;
use std::fmt::{Display, Formatter};

/// Reference to a bound parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamRef {
    Named(String),
    Positional(usize),
}

impl Display for ParamRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Named(name) => write!(f, ":{name}"),
            Self::Positional(index) => write!(f, "?{index}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Piece {
    Sql(String),
    Param { param: ParamRef, in_list: bool },
}

/// SQL text interleaved with parameter slots.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Fragment {
    pieces: Vec<Piece>,
}

impl Fragment {
    pub(crate) fn sql(text: impl Into<String>) -> Self {
        let mut fragment = Self::default();
        fragment.push_sql(text);
        fragment
    }

    pub(crate) fn push_sql(&mut self, text: impl Into<String>) {
        self.pieces.push(Piece::Sql(text.into()));
    }

    pub(crate) fn push_param(&mut self, param: ParamRef, in_list: bool) {
        self.pieces.push(Piece::Param { param, in_list });
    }

    pub(crate) fn append(&mut self, other: Fragment) {
        self.pieces.extend(other.pieces);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub(crate) fn params(&self) -> impl Iterator<Item = &ParamRef> + '_ {
        self.pieces.iter().filter_map(|piece| match piece {
            Piece::Param { param, .. } => Some(param),
            Piece::Sql(_) => None,
        })
    }

    /// Renders the fragment, appending `?` placeholders and their values.
    pub(crate) fn render(
        &self,
        args: &Args,
        sql: &mut String,
        values: &mut Vec<Value>,
    ) -> OrmResult<()> {
        for (index, piece) in self.pieces.iter().enumerate() {
            if index > 0 {
                sql.push(' ');
            }
            match piece {
                Piece::Sql(text) => sql.push_str(text),
                Piece::Param { param, in_list } => {
                    let arg = match param {
                        ParamRef::Named(name) => args.named(name),
                        ParamRef::Positional(position) => args.positional(*position),
                    }
                    .ok_or_else(|| OrmError::MissingParameter(param.to_string()))?;
                    render_arg(param, arg, *in_list, sql, values)?;
                }
            }
        }
        Ok(())
    }
}

fn render_arg(
    param: &ParamRef,
    arg: &Arg,
    in_list: bool,
    sql: &mut String,
    values: &mut Vec<Value>,
) -> OrmResult<()> {
    match (arg, in_list) {
        (Arg::Scalar(value), false) => {
            sql.push('?');
            values.push(value.clone());
        }
        (Arg::Scalar(value), true) => {
            sql.push_str("(?)");
            values.push(value.clone());
        }
        (Arg::List(list), true) => {
            let placeholders = vec!["?"; list.len()].join(", ");
            sql.push('(');
            sql.push_str(&placeholders);
            sql.push(')');
            values.extend(list.iter().cloned());
        }
        (Arg::List(_), false) => {
            return Err(OrmError::InvalidQueryUsage(format!(
                "list bound to {param} outside an IN predicate"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub(crate) struct Join {
    pub(crate) alias: String,
    pub(crate) owner_alias: String,
    pub(crate) relation: &'static Relation,
    pub(crate) fetch: bool,
    pub(crate) left: bool,
}

impl Join {
    fn render(&self) -> String {
        let target = (self.relation.target)();
        format!(
            "{} {} {} ON {}.{} = {}.{}",
            if self.left { "LEFT JOIN" } else { "JOIN" },
            target.table,
            self.alias,
            self.alias,
            target.id_column,
            self.owner_alias,
            self.relation.join_column
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Select,
    Exists,
    /// Loads matching entities, then removes each through the session.
    DerivedDelete,
    BulkUpdate,
    BulkDelete,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Selection {
    Entity,
    Scalars(Vec<Fragment>),
    Constructor { name: String, args: Vec<Fragment> },
    Count { distinct: bool, expr: Fragment },
}

impl Selection {
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Entity => "entity".to_string(),
            Self::Scalars(columns) => format!("{} scalar column(s)", columns.len()),
            Self::Constructor { name, args } => format!("new {name}/{}", args.len()),
            Self::Count { .. } => "count".to_string(),
        }
    }
}

/// LIMIT/OFFSET applied at render time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Window {
    pub(crate) limit: u64,
    pub(crate) offset: u64,
}

pub(crate) struct RenderedSelect {
    pub(crate) sql: String,
    pub(crate) values: Vec<Value>,
    /// Relations fetched after the root columns, in select order.
    pub(crate) fetches: Vec<&'static Relation>,
}

/// A verified query, ready to be bound and executed by a session.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub(crate) source: String,
    pub(crate) kind: QueryKind,
    pub(crate) root: &'static EntityMeta,
    pub(crate) root_alias: String,
    pub(crate) selection: Selection,
    pub(crate) distinct: bool,
    pub(crate) joins: Vec<Join>,
    pub(crate) filter: Fragment,
    pub(crate) assignments: Fragment,
    pub(crate) order_by: Vec<String>,
    pub(crate) limit: Option<u32>,
    pub(crate) count_plan: Option<Box<QueryPlan>>,
}

impl QueryPlan {
    pub(crate) fn new(source: impl Into<String>, kind: QueryKind, root: &'static EntityMeta) -> Self {
        Self {
            source: source.into(),
            kind,
            root,
            root_alias: default_alias(root),
            selection: Selection::Entity,
            distinct: false,
            joins: Vec::new(),
            filter: Fragment::default(),
            assignments: Fragment::default(),
            order_by: Vec::new(),
            limit: None,
            count_plan: None,
        }
    }

    /// Every row of `root`.
    pub fn select_all(root: &'static EntityMeta) -> Self {
        Self::new(format!("{}.findAll", root.name), QueryKind::Select, root)
    }

    /// Rows of `root` whose id is in the list bound to `:ids`.
    pub fn select_by_ids(root: &'static EntityMeta) -> Self {
        let mut plan = Self::new(format!("{}.findAllById", root.name), QueryKind::Select, root);
        plan.filter = Fragment::sql(format!("{}.{} IN", plan.root_alias, root.id_column));
        plan.filter.push_param(ParamRef::Named("ids".to_string()), true);
        plan
    }

    /// One set-based DELETE of every row of `root`.
    pub fn delete_all(root: &'static EntityMeta) -> Self {
        Self::new(
            format!("{}.deleteAllInBatch", root.name),
            QueryKind::BulkDelete,
            root,
        )
    }

    /// Method name or query text the plan was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn root_entity(&self) -> &'static str {
        self.root.name
    }

    pub fn has_count_query(&self) -> bool {
        self.count_plan.is_some()
    }

    /// Distinct parameters in order of first appearance.
    pub fn parameters(&self) -> Vec<ParamRef> {
        let mut params = Vec::new();
        let projected: Vec<&Fragment> = match &self.selection {
            Selection::Entity => Vec::new(),
            Selection::Scalars(columns) => columns.iter().collect(),
            Selection::Constructor { args, .. } => args.iter().collect(),
            Selection::Count { expr, .. } => vec![expr],
        };
        let fragments = projected
            .into_iter()
            .chain([&self.assignments, &self.filter]);
        for param in fragments.flat_map(Fragment::params) {
            if !params.contains(param) {
                params.push(param.clone());
            }
        }
        params
    }

    pub(crate) fn render_select(
        &self,
        args: &Args,
        graph: Option<&EntityGraph>,
        sort: Option<&Sort>,
        window: Option<Window>,
    ) -> OrmResult<RenderedSelect> {
        let mut joins = self.joins.clone();
        if let Some(graph) = graph {
            if self.selection != Selection::Entity {
                return Err(OrmError::InvalidQueryUsage(format!(
                    "entity graph `{}` applied to non-entity query `{}`",
                    graph.name, self.source
                )));
            }
            self.apply_graph(graph, &mut joins)?;
        }

        let mut sql = String::from("SELECT ");
        let mut values = Vec::new();
        let mut fetches = Vec::new();
        if self.distinct {
            sql.push_str("DISTINCT ");
        }

        match &self.selection {
            Selection::Entity => {
                let mut columns = qualified_columns(&self.root_alias, self.root);
                for join in joins.iter().filter(|join| join.fetch) {
                    columns.extend(qualified_columns(&join.alias, (join.relation.target)()));
                    fetches.push(join.relation);
                }
                sql.push_str(&columns.join(", "));
            }
            Selection::Scalars(columns) => render_list(columns, args, &mut sql, &mut values)?,
            Selection::Constructor { args: columns, .. } => {
                render_list(columns, args, &mut sql, &mut values)?
            }
            Selection::Count { distinct, expr } => {
                sql.push_str(if *distinct { "COUNT(DISTINCT " } else { "COUNT(" });
                expr.render(args, &mut sql, &mut values)?;
                sql.push(')');
            }
        }

        self.render_from(&joins, &mut sql);
        self.render_where(args, &mut sql, &mut values)?;

        let mut order = self.order_by.clone();
        if let Some(sort) = sort {
            for item in sort.orders() {
                let column = sort_column(self.root, &item.property).ok_or_else(|| {
                    OrmError::InvalidSortProperty {
                        entity: self.root.name,
                        property: item.property.clone(),
                    }
                })?;
                order.push(format!(
                    "{}.{} {}",
                    self.root_alias,
                    column,
                    item.direction.as_sql()
                ));
            }
        }
        if !order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }

        match (window, self.limit) {
            (Some(window), _) => {
                sql.push_str(" LIMIT ? OFFSET ?");
                values.push(Value::Integer(to_sql_int(window.limit)));
                values.push(Value::Integer(to_sql_int(window.offset)));
            }
            (None, Some(limit)) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, None) => {}
        }

        Ok(RenderedSelect {
            sql,
            values,
            fetches,
        })
    }

    /// Renders the row count of this query's result set.
    pub(crate) fn render_count(&self, args: &Args) -> OrmResult<(String, Vec<Value>)> {
        if let Some(count_plan) = &self.count_plan {
            let rendered = count_plan.render_select(args, None, None, None)?;
            return Ok((rendered.sql, rendered.values));
        }
        if let Selection::Count { .. } = self.selection {
            let rendered = self.render_select(args, None, None, None)?;
            return Ok((rendered.sql, rendered.values));
        }

        let mut sql = format!(
            "SELECT COUNT({}{}.{})",
            if self.distinct { "DISTINCT " } else { "" },
            self.root_alias,
            self.root.id_column
        );
        let mut values = Vec::new();
        // Inner fetch joins still filter rows; outer ones cannot change a to-one count.
        let joins: Vec<Join> = self
            .joins
            .iter()
            .filter(|join| !(join.fetch && join.left))
            .cloned()
            .collect();
        self.render_from(&joins, &mut sql);
        self.render_where(args, &mut sql, &mut values)?;
        Ok((sql, values))
    }

    /// Renders a set-based UPDATE or DELETE.
    pub(crate) fn render_bulk(&self, args: &Args) -> OrmResult<(String, Vec<Value>)> {
        let mut values = Vec::new();
        let mut sql = match self.kind {
            QueryKind::BulkUpdate => {
                let mut sql = format!("UPDATE {} SET ", self.root.table);
                self.assignments.render(args, &mut sql, &mut values)?;
                sql
            }
            QueryKind::BulkDelete => format!("DELETE FROM {}", self.root.table),
            _ => {
                return Err(OrmError::InvalidQueryUsage(format!(
                    "`{}` is not a bulk statement",
                    self.source
                )))
            }
        };
        self.render_where(args, &mut sql, &mut values)?;
        Ok((sql, values))
    }

    fn apply_graph(&self, graph: &EntityGraph, joins: &mut Vec<Join>) -> OrmResult<()> {
        for path in graph.paths {
            let relation = self.root.relation(path).ok_or_else(|| {
                OrmError::InvalidQueryUsage(format!(
                    "entity graph `{}` does not apply to {}",
                    graph.name, self.root.name
                ))
            })?;
            let existing = joins.iter_mut().find(|join| {
                join.owner_alias == self.root_alias && join.relation.name == relation.name
            });
            match existing {
                Some(join) => join.fetch = true,
                None => joins.push(Join {
                    alias: format!("g_{}", relation.name),
                    owner_alias: self.root_alias.clone(),
                    relation,
                    fetch: true,
                    left: true,
                }),
            }
        }
        Ok(())
    }

    fn render_from(&self, joins: &[Join], sql: &mut String) {
        sql.push_str(&format!(" FROM {} {}", self.root.table, self.root_alias));
        for join in joins {
            sql.push(' ');
            sql.push_str(&join.render());
        }
    }

    fn render_where(&self, args: &Args, sql: &mut String, values: &mut Vec<Value>) -> OrmResult<()> {
        if self.filter.is_empty() {
            return Ok(());
        }
        sql.push_str(" WHERE ");
        self.filter.render(args, sql, values)
    }
}

pub(crate) fn default_alias(meta: &EntityMeta) -> String {
    meta.table
        .chars()
        .next()
        .map_or_else(|| "e".to_string(), |first| first.to_ascii_lowercase().to_string())
}

fn qualified_columns(alias: &str, meta: &EntityMeta) -> Vec<String> {
    meta.select_columns()
        .into_iter()
        .map(|column| format!("{alias}.{column}"))
        .collect()
}

fn render_list(
    columns: &[Fragment],
    args: &Args,
    sql: &mut String,
    values: &mut Vec<Value>,
) -> OrmResult<()> {
    for (index, column) in columns.iter().enumerate() {
        if index > 0 {
            sql.push_str(", ");
        }
        column.render(args, sql, values)?;
    }
    Ok(())
}

/// Accepts attribute names as declared or in camelCase.
fn sort_column(meta: &EntityMeta, property: &str) -> Option<&'static str> {
    meta.column_for(property)
        .or_else(|| meta.column_for(&camel_to_snake(property)))
}

pub(crate) fn camel_to_snake(value: &str) -> String {
    let mut snake = String::with_capacity(value.len() + 4);
    for (index, ch) in value.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if index > 0 {
                snake.push('_');
            }
            snake.push(ch.to_ascii_lowercase());
        } else {
            snake.push(ch);
        }
    }
    snake
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::camel_to_snake;

    #[test]
    fn camel_to_snake_handles_leading_capital() {
        assert_eq!(camel_to_snake("createdDate"), "created_date");
        assert_eq!(camel_to_snake("Username"), "username");
        assert_eq!(camel_to_snake("age"), "age");
    }
}
