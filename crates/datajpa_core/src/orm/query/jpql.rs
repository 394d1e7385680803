//! Compiler for the object query language used by declared repository queries.
//!
//! # Responsibility
//! - Parse `select`, `update` and `delete` statements written against entity
//!   and attribute names.
//! - Resolve every alias and attribute path against the metamodel so broken
//!   declarations fail when a repository is built.
//!
//! # Invariants
//! - Select statements qualify columns with their alias; bulk statements
//!   render bare columns and accept no joins.
//! - A fetch join must hang off the root alias.

use super::lexer::{tokenize, Token};
use super::plan::{Fragment, Join, ParamRef, QueryKind, QueryPlan, Selection};
use crate::orm::error::MappingError;
use crate::orm::mapping::{EntityMeta, Metamodel, Relation};

const RESERVED: &[&str] = &[
    "select", "from", "where", "join", "left", "inner", "outer", "fetch", "order", "by", "set",
    "and", "or", "not", "on", "as", "group", "having",
];

const FUNCTIONS: &[&str] = &["lower", "upper", "length", "abs", "trim", "coalesce"];

/// Compiles one statement.
pub(crate) fn compile(query: &str, metamodel: &Metamodel) -> Result<QueryPlan, MappingError> {
    let tokens = tokenize(query)?;
    let mut parser = Parser {
        query,
        tokens,
        pos: 0,
        metamodel,
        aliases: Vec::new(),
        joins: Vec::new(),
        root: None,
        root_alias: None,
        qualify: true,
    };
    let plan = match parser.peek() {
        Some(token) if token.is_keyword("select") => parser.select()?,
        Some(token) if token.is_keyword("update") => parser.update()?,
        Some(token) if token.is_keyword("delete") => parser.delete()?,
        _ => return Err(parser.syntax("expected `select`, `update` or `delete`")),
    };
    if let Some(token) = parser.peek() {
        return Err(parser.syntax(format!("unexpected `{}`", token.describe())));
    }
    Ok(plan)
}

struct Parser<'q> {
    query: &'q str,
    tokens: Vec<Token>,
    pos: usize,
    metamodel: &'q Metamodel,
    aliases: Vec<(String, &'static EntityMeta)>,
    joins: Vec<Join>,
    root: Option<&'static EntityMeta>,
    root_alias: Option<String>,
    qualify: bool,
}

impl Parser<'_> {
    fn select(&mut self) -> Result<QueryPlan, MappingError> {
        self.expect_keyword("select")?;
        let distinct = self.eat_keyword("distinct");
        let projection_start = self.pos;

        self.pos = self.find_top_level_keyword("from")?;
        let root = self.from_clause()?;
        self.join_clauses()?;
        let after_joins = self.pos;

        self.pos = projection_start;
        let selection = self.projection()?;
        if !self.peek().is_some_and(|token| token.is_keyword("from")) {
            return Err(self.syntax("expected `from` after the select list"));
        }
        self.pos = after_joins;

        let filter = self.where_clause()?;
        let order_by = self.order_by_clause()?;

        let mut plan = QueryPlan::new(self.query, QueryKind::Select, root);
        if let Some(alias) = &self.root_alias {
            plan.root_alias = alias.clone();
        }
        plan.selection = selection;
        plan.distinct = distinct;
        plan.joins = std::mem::take(&mut self.joins);
        plan.filter = filter;
        plan.order_by = order_by;
        Ok(plan)
    }

    fn update(&mut self) -> Result<QueryPlan, MappingError> {
        self.expect_keyword("update")?;
        self.qualify = false;
        let root = self.entity_and_alias()?;
        self.expect_keyword("set")?;

        let mut assignments = Fragment::default();
        loop {
            let target = self.expect_ident("assignment target")?;
            let column = self.resolve_path(&target)?;
            if column == root.id_column {
                return Err(self.syntax("the id column cannot be assigned"));
            }
            self.expect_op("=")?;
            assignments.push_sql(format!("{column} ="));
            let value = self.expr()?;
            assignments.append(value);
            if !self.eat_op(",") {
                break;
            }
            assignments.push_sql(",");
        }

        let filter = self.where_clause()?;
        let mut plan = QueryPlan::new(self.query, QueryKind::BulkUpdate, root);
        plan.assignments = assignments;
        plan.filter = filter;
        Ok(plan)
    }

    fn delete(&mut self) -> Result<QueryPlan, MappingError> {
        self.expect_keyword("delete")?;
        self.expect_keyword("from")?;
        self.qualify = false;
        let root = self.entity_and_alias()?;
        let filter = self.where_clause()?;
        let mut plan = QueryPlan::new(self.query, QueryKind::BulkDelete, root);
        plan.filter = filter;
        Ok(plan)
    }

    fn from_clause(&mut self) -> Result<&'static EntityMeta, MappingError> {
        self.expect_keyword("from")?;
        let root = self.entity_and_alias()?;
        if self.root_alias.is_none() {
            return Err(self.syntax("select statements need an alias for the root entity"));
        }
        Ok(root)
    }

    fn entity_and_alias(&mut self) -> Result<&'static EntityMeta, MappingError> {
        let name = self.expect_ident("entity name")?;
        let meta = self
            .metamodel
            .entity(&name)
            .ok_or_else(|| MappingError::UnknownEntity {
                query: self.query.to_string(),
                entity: name.clone(),
            })?;
        self.root = Some(meta);
        if let Some(alias) = self.alias_declaration()? {
            self.aliases.push((alias.clone(), meta));
            self.root_alias = Some(alias);
        }
        Ok(meta)
    }

    fn alias_declaration(&mut self) -> Result<Option<String>, MappingError> {
        if self.eat_keyword("as") {
            return self.expect_ident("alias").map(Some);
        }
        match self.peek() {
            Some(Token::Ident(ident))
                if !ident.contains('.')
                    && !RESERVED.iter().any(|word| ident.eq_ignore_ascii_case(word)) =>
            {
                let alias = ident.clone();
                self.pos += 1;
                Ok(Some(alias))
            }
            _ => Ok(None),
        }
    }

    fn join_clauses(&mut self) -> Result<(), MappingError> {
        loop {
            let left = if self.eat_keyword("left") {
                self.eat_keyword("outer");
                true
            } else {
                self.eat_keyword("inner");
                false
            };
            if !self.eat_keyword("join") {
                if left {
                    return Err(self.syntax("expected `join` after `left`"));
                }
                return Ok(());
            }
            let fetch = self.eat_keyword("fetch");
            let path = self.expect_ident("join path")?;
            let Some((owner_alias, relation_name)) = path.split_once('.') else {
                return Err(self.syntax(format!("join path `{path}` must be alias.relation")));
            };
            let owner = self.alias_meta(owner_alias)?;
            let relation =
                owner
                    .relation(relation_name)
                    .ok_or_else(|| MappingError::UnknownAttribute {
                        query: self.query.to_string(),
                        entity: owner.name,
                        attribute: relation_name.to_string(),
                    })?;
            if fetch && self.root_alias.as_deref() != Some(owner_alias) {
                return Err(self.syntax("fetch joins must start at the root alias"));
            }
            let alias = self
                .alias_declaration()?
                .ok_or_else(|| self.syntax(format!("join `{path}` needs an alias")))?;
            self.aliases.push((alias.clone(), (relation.target)()));
            self.joins.push(Join {
                alias,
                owner_alias: owner_alias.to_string(),
                relation,
                fetch,
                left,
            });
        }
    }

    fn projection(&mut self) -> Result<Selection, MappingError> {
        if self.eat_keyword("new") {
            let name = self.expect_ident("projection type")?;
            let short = name.rsplit('.').next().unwrap_or(&name).to_string();
            self.expect_op("(")?;
            let args = self.expr_list()?;
            self.expect_op(")")?;
            return Ok(Selection::Constructor { name: short, args });
        }

        if self.peek().is_some_and(|token| token.is_keyword("count"))
            && self.peek_at(1).is_some_and(|token| token.is_op("("))
        {
            self.pos += 2;
            let distinct = self.eat_keyword("distinct");
            let expr = self.expr()?;
            self.expect_op(")")?;
            return Ok(Selection::Count { distinct, expr });
        }

        if let (Some(Token::Ident(ident)), Some(next)) = (self.peek(), self.peek_at(1)) {
            if !ident.contains('.') && next.is_keyword("from") {
                if self.root_alias.as_deref() == Some(ident.as_str()) {
                    self.pos += 1;
                    return Ok(Selection::Entity);
                }
                if self.aliases.iter().any(|(alias, _)| alias == ident) {
                    return Err(self.syntax(format!(
                        "only the root alias can be selected as an entity, found `{ident}`"
                    )));
                }
            }
        }

        Ok(Selection::Scalars(self.expr_list()?))
    }

    fn where_clause(&mut self) -> Result<Fragment, MappingError> {
        if self.eat_keyword("where") {
            self.or_condition()
        } else {
            Ok(Fragment::default())
        }
    }

    fn order_by_clause(&mut self) -> Result<Vec<String>, MappingError> {
        let mut order = Vec::new();
        if !self.eat_keyword("order") {
            return Ok(order);
        }
        self.expect_keyword("by")?;
        loop {
            let path = self.expect_ident("order by path")?;
            let column = self.resolve_path(&path)?;
            let direction = if self.eat_keyword("desc") {
                "DESC"
            } else {
                self.eat_keyword("asc");
                "ASC"
            };
            order.push(format!("{column} {direction}"));
            if !self.eat_op(",") {
                return Ok(order);
            }
        }
    }

    fn or_condition(&mut self) -> Result<Fragment, MappingError> {
        let mut condition = self.and_condition()?;
        while self.eat_keyword("or") {
            condition.push_sql("OR");
            let next = self.and_condition()?;
            condition.append(next);
        }
        Ok(condition)
    }

    fn and_condition(&mut self) -> Result<Fragment, MappingError> {
        let mut condition = self.not_condition()?;
        while self.eat_keyword("and") {
            condition.push_sql("AND");
            let next = self.not_condition()?;
            condition.append(next);
        }
        Ok(condition)
    }

    fn not_condition(&mut self) -> Result<Fragment, MappingError> {
        if self.eat_keyword("not") {
            let mut condition = Fragment::sql("NOT");
            let inner = self.not_condition()?;
            condition.append(inner);
            return Ok(condition);
        }
        if self.peek().is_some_and(|token| token.is_op("(")) {
            let saved = (self.pos, self.joins.len(), self.aliases.len());
            self.pos += 1;
            let grouped = self
                .or_condition()
                .and_then(|inner| self.expect_op(")").map(|()| inner));
            match grouped {
                Ok(inner) => {
                    let mut condition = Fragment::sql("(");
                    condition.append(inner);
                    condition.push_sql(")");
                    return Ok(condition);
                }
                Err(_) => {
                    self.pos = saved.0;
                    self.joins.truncate(saved.1);
                    self.aliases.truncate(saved.2);
                }
            }
        }
        self.predicate()
    }

    fn predicate(&mut self) -> Result<Fragment, MappingError> {
        let mut predicate = self.expr()?;

        if self.eat_keyword("is") {
            let negated = self.eat_keyword("not");
            self.expect_keyword("null")?;
            predicate.push_sql(if negated { "IS NOT NULL" } else { "IS NULL" });
            return Ok(predicate);
        }

        let negated = self.eat_keyword("not");
        if self.eat_keyword("in") {
            predicate.push_sql(if negated { "NOT IN" } else { "IN" });
            let list = self.in_list()?;
            predicate.append(list);
            return Ok(predicate);
        }
        if self.eat_keyword("like") {
            predicate.push_sql(if negated { "NOT LIKE" } else { "LIKE" });
            let pattern = self.expr()?;
            predicate.append(pattern);
            return Ok(predicate);
        }
        if self.eat_keyword("between") {
            predicate.push_sql(if negated { "NOT BETWEEN" } else { "BETWEEN" });
            let low = self.expr()?;
            predicate.append(low);
            self.expect_keyword("and")?;
            predicate.push_sql("AND");
            let high = self.expr()?;
            predicate.append(high);
            return Ok(predicate);
        }
        if negated {
            return Err(self.syntax("expected `in`, `like` or `between` after `not`"));
        }

        let op = match self.next()? {
            Token::Op(op) if ["=", "<>", "!=", "<", "<=", ">", ">="].contains(&op.as_str()) => op,
            other => {
                return Err(self.syntax(format!(
                    "expected a comparison operator, found `{}`",
                    other.describe()
                )))
            }
        };
        predicate.push_sql(op);
        let right = self.expr()?;
        predicate.append(right);
        Ok(predicate)
    }

    fn in_list(&mut self) -> Result<Fragment, MappingError> {
        let mut list = Fragment::default();
        if let Some(param) = self.peek_param() {
            self.pos += 1;
            list.push_param(param, true);
            return Ok(list);
        }
        self.expect_op("(")?;
        if let (Some(param), Some(close)) = (self.peek_param_at(0), self.peek_at(1)) {
            if close.is_op(")") {
                self.pos += 2;
                list.push_param(param, true);
                return Ok(list);
            }
        }
        list.push_sql("(");
        let items = self.expr_list()?;
        for (index, item) in items.into_iter().enumerate() {
            if index > 0 {
                list.push_sql(",");
            }
            list.append(item);
        }
        self.expect_op(")")?;
        list.push_sql(")");
        Ok(list)
    }

    fn expr_list(&mut self) -> Result<Vec<Fragment>, MappingError> {
        let mut items = vec![self.expr()?];
        while self.eat_op(",") {
            items.push(self.expr()?);
        }
        Ok(items)
    }

    fn expr(&mut self) -> Result<Fragment, MappingError> {
        let mut expr = self.term()?;
        while let Some(op) = self.eat_any_op(&["+", "-"]) {
            expr.push_sql(op);
            let next = self.term()?;
            expr.append(next);
        }
        Ok(expr)
    }

    fn term(&mut self) -> Result<Fragment, MappingError> {
        let mut term = self.factor()?;
        while let Some(op) = self.eat_any_op(&["*", "/"]) {
            term.push_sql(op);
            let next = self.factor()?;
            term.append(next);
        }
        Ok(term)
    }

    fn factor(&mut self) -> Result<Fragment, MappingError> {
        let token = self.next()?;
        match token {
            Token::Named(name) => {
                let mut fragment = Fragment::default();
                fragment.push_param(ParamRef::Named(name), false);
                Ok(fragment)
            }
            Token::Positional(index) => {
                let mut fragment = Fragment::default();
                fragment.push_param(ParamRef::Positional(index), false);
                Ok(fragment)
            }
            Token::Number(value) => Ok(Fragment::sql(value.to_string())),
            Token::Str(value) => Ok(Fragment::sql(format!("'{}'", value.replace('\'', "''")))),
            Token::Op(op) if op == "-" => {
                let mut fragment = Fragment::sql("-");
                let inner = self.factor()?;
                fragment.append(inner);
                Ok(fragment)
            }
            Token::Op(op) if op == "(" => {
                let mut fragment = Fragment::sql("(");
                let inner = self.expr()?;
                fragment.append(inner);
                self.expect_op(")")?;
                fragment.push_sql(")");
                Ok(fragment)
            }
            Token::Ident(ident) if ident.eq_ignore_ascii_case("null") => Ok(Fragment::sql("NULL")),
            Token::Ident(ident) if ident.eq_ignore_ascii_case("true") => Ok(Fragment::sql("1")),
            Token::Ident(ident) if ident.eq_ignore_ascii_case("false") => Ok(Fragment::sql("0")),
            Token::Ident(ident) if self.peek().is_some_and(|next| next.is_op("(")) => {
                self.function(&ident)
            }
            Token::Ident(ident) => Ok(Fragment::sql(self.resolve_path(&ident)?)),
            Token::Op(op) => Err(self.syntax(format!("unexpected `{op}`"))),
        }
    }

    fn function(&mut self, name: &str) -> Result<Fragment, MappingError> {
        let lower = name.to_ascii_lowercase();
        if !FUNCTIONS.contains(&lower.as_str()) {
            return Err(self.syntax(format!("unsupported function `{name}`")));
        }
        self.expect_op("(")?;
        let mut fragment = Fragment::sql(format!("{}(", lower.to_ascii_uppercase()));
        let args = self.expr_list()?;
        for (index, arg) in args.into_iter().enumerate() {
            if index > 0 {
                fragment.push_sql(",");
            }
            fragment.append(arg);
        }
        self.expect_op(")")?;
        fragment.push_sql(")");
        Ok(fragment)
    }

    /// Turns `alias`, `alias.attr` or `alias.relation.attr` into a column.
    fn resolve_path(&mut self, path: &str) -> Result<String, MappingError> {
        let segments: Vec<&str> = path.split('.').collect();
        if !self.qualify {
            return self.resolve_bare(&segments);
        }

        let alias = segments[0];
        let meta = self.alias_meta(alias)?;
        match segments[1..] {
            [] => Ok(format!("{alias}.{}", meta.id_column)),
            [attribute] => {
                let column = self.column(meta, attribute)?;
                Ok(format!("{alias}.{column}"))
            }
            [relation_name, "id"] if meta.relation(relation_name).is_some() => {
                let column = self.column(meta, relation_name)?;
                Ok(format!("{alias}.{column}"))
            }
            [relation_name, attribute] => {
                let relation =
                    meta.relation(relation_name)
                        .ok_or_else(|| MappingError::UnknownAttribute {
                            query: self.query.to_string(),
                            entity: meta.name,
                            attribute: relation_name.to_string(),
                        })?;
                let target = (relation.target)();
                let column = self.column(target, attribute)?;
                let join_alias = self.implicit_join(alias, relation_name, relation)?;
                Ok(format!("{join_alias}.{column}"))
            }
            _ => Err(self.syntax(format!("path `{path}` is too deep"))),
        }
    }

    fn resolve_bare(&self, segments: &[&str]) -> Result<String, MappingError> {
        let meta = self
            .root
            .ok_or_else(|| self.syntax("statement has no root entity"))?;
        let rest = match &self.root_alias {
            Some(alias) if segments[0] == alias.as_str() => &segments[1..],
            Some(_) if segments.len() > 1 => {
                return Err(MappingError::UnknownAlias {
                    query: self.query.to_string(),
                    alias: segments[0].to_string(),
                })
            }
            _ => segments,
        };
        match rest {
            [] => Ok(meta.id_column.to_string()),
            [attribute] => self.column(meta, attribute).map(str::to_string),
            [relation_name, "id"] => self.column(meta, relation_name).map(str::to_string),
            _ => Err(self.syntax(format!(
                "`{}` needs a join, which bulk statements do not support",
                segments.join(".")
            ))),
        }
    }

    fn implicit_join(
        &mut self,
        owner_alias: &str,
        relation_name: &str,
        relation: &'static Relation,
    ) -> Result<String, MappingError> {
        if let Some(join) = self
            .joins
            .iter()
            .find(|join| join.owner_alias == owner_alias && join.relation.name == relation_name)
        {
            return Ok(join.alias.clone());
        }
        let alias = format!("{owner_alias}_{relation_name}");
        self.aliases.push((alias.clone(), (relation.target)()));
        self.joins.push(Join {
            alias: alias.clone(),
            owner_alias: owner_alias.to_string(),
            relation,
            fetch: false,
            left: false,
        });
        Ok(alias)
    }

    fn column(&self, meta: &'static EntityMeta, attribute: &str) -> Result<&'static str, MappingError> {
        meta.column_for(attribute)
            .ok_or_else(|| MappingError::UnknownAttribute {
                query: self.query.to_string(),
                entity: meta.name,
                attribute: attribute.to_string(),
            })
    }

    fn alias_meta(&self, alias: &str) -> Result<&'static EntityMeta, MappingError> {
        self.aliases
            .iter()
            .find(|(name, _)| name == alias)
            .map(|(_, meta)| *meta)
            .ok_or_else(|| MappingError::UnknownAlias {
                query: self.query.to_string(),
                alias: alias.to_string(),
            })
    }

    fn find_top_level_keyword(&self, keyword: &str) -> Result<usize, MappingError> {
        let mut depth = 0usize;
        for (index, token) in self.tokens.iter().enumerate().skip(self.pos) {
            if token.is_op("(") {
                depth += 1;
            } else if token.is_op(")") {
                depth = depth.saturating_sub(1);
            } else if depth == 0 && token.is_keyword(keyword) {
                return Ok(index);
            }
        }
        Err(self.syntax(format!("missing `{keyword}`")))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn peek_param(&self) -> Option<ParamRef> {
        self.peek_param_at(0)
    }

    fn peek_param_at(&self, offset: usize) -> Option<ParamRef> {
        match self.peek_at(offset)? {
            Token::Named(name) => Some(ParamRef::Named(name.clone())),
            Token::Positional(index) => Some(ParamRef::Positional(*index)),
            _ => None,
        }
    }

    fn next(&mut self) -> Result<Token, MappingError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| self.syntax("unexpected end of query"))?;
        self.pos += 1;
        Ok(token)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek().is_some_and(|token| token.is_keyword(keyword)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), MappingError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.syntax(format!("expected `{keyword}`")))
        }
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.peek().is_some_and(|token| token.is_op(op)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_any_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        let op = ops
            .iter()
            .copied()
            .find(|op| self.peek().is_some_and(|token| token.is_op(op)))?;
        self.pos += 1;
        Some(op)
    }

    fn expect_op(&mut self, op: &str) -> Result<(), MappingError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.syntax(format!("expected `{op}`")))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, MappingError> {
        match self.next()? {
            Token::Ident(ident) => Ok(ident),
            other => Err(self.syntax(format!("expected {what}, found `{}`", other.describe()))),
        }
    }

    fn syntax(&self, message: impl Into<String>) -> MappingError {
        MappingError::Syntax {
            query: self.query.to_string(),
            message: message.into(),
        }
    }
}
