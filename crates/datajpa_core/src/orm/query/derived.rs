//! Query derivation from repository method names.
//!
//! `findByUsernameAndAgeGreaterThan` becomes
//! `WHERE m.username = ?1 AND m.age > ?2`. Clauses are split on the words
//! `And` and `Or` (AND binds tighter), each clause is a property followed by an
//! optional operator suffix, and parameters are numbered in clause order.

use super::plan::{
    camel_to_snake, default_alias, Fragment, Join, ParamRef, QueryKind, QueryPlan, Selection,
};
use crate::orm::error::MappingError;
use crate::orm::mapping::EntityMeta;
use once_cell::sync::Lazy;
use regex::Regex;

static METHOD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(find|read|get|query|search|stream|count|exists|delete|remove)([A-Za-z0-9]*?)(?:By([A-Z][A-Za-z0-9]*))?$",
    )
    .expect("method regex must compile")
});

static LIMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:First|Top)([0-9]*)").expect("limit regex must compile"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Equal,
    NotEqual,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
    Between,
    Like,
    NotLike,
    StartingWith,
    EndingWith,
    Containing,
    NotContaining,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    True,
    False,
}

/// Operator keywords as camel-case word sequences, longest first.
const OPERATORS: &[(&[&str], Operator)] = &[
    (&["Greater", "Than", "Equal"], Operator::GreaterThanEqual),
    (&["Less", "Than", "Equal"], Operator::LessThanEqual),
    (&["Is", "Not", "Null"], Operator::IsNotNull),
    (&["Not", "Containing"], Operator::NotContaining),
    (&["Starting", "With"], Operator::StartingWith),
    (&["Starts", "With"], Operator::StartingWith),
    (&["Ending", "With"], Operator::EndingWith),
    (&["Ends", "With"], Operator::EndingWith),
    (&["Greater", "Than"], Operator::GreaterThan),
    (&["Less", "Than"], Operator::LessThan),
    (&["Not", "Null"], Operator::IsNotNull),
    (&["Is", "Null"], Operator::IsNull),
    (&["Not", "Like"], Operator::NotLike),
    (&["Not", "In"], Operator::NotIn),
    (&["Is", "Not"], Operator::NotEqual),
    (&["Is", "True"], Operator::True),
    (&["Is", "False"], Operator::False),
    (&["Containing"], Operator::Containing),
    (&["Contains"], Operator::Containing),
    (&["Between"], Operator::Between),
    (&["Before"], Operator::LessThan),
    (&["After"], Operator::GreaterThan),
    (&["Equals"], Operator::Equal),
    (&["Null"], Operator::IsNull),
    (&["Like"], Operator::Like),
    (&["True"], Operator::True),
    (&["False"], Operator::False),
    (&["Not"], Operator::NotEqual),
    (&["In"], Operator::In),
    (&["Is"], Operator::Equal),
];

/// Compiles a repository method name against `root`.
pub(crate) fn compile(method: &str, root: &'static EntityMeta) -> Result<QueryPlan, MappingError> {
    let captures = METHOD_RE.captures(method).ok_or_else(|| MappingError::InvalidDerivedQuery {
        method: method.to_string(),
        reason: "expected a find/read/get/query/search/stream/count/exists/delete/remove subject"
            .to_string(),
    })?;
    let subject = captures.get(1).map_or("", |m| m.as_str());
    let modifiers = captures.get(2).map_or("", |m| m.as_str());
    let criteria = captures.get(3).map_or("", |m| m.as_str());

    let mut deriver = Deriver {
        method,
        root,
        alias: default_alias(root),
        joins: Vec::new(),
        next_param: 1,
    };

    let (predicates, ordering) = match criteria.find("OrderBy") {
        Some(index) => (&criteria[..index], &criteria[index + "OrderBy".len()..]),
        None => (criteria, ""),
    };
    let filter = deriver.predicates(predicates)?;
    let order_by = deriver.ordering(ordering)?;

    let kind = match subject {
        "exists" => QueryKind::Exists,
        "delete" | "remove" => QueryKind::DerivedDelete,
        _ => QueryKind::Select,
    };
    let mut plan = QueryPlan::new(method, kind, root);
    plan.root_alias = deriver.alias.clone();
    plan.distinct = modifiers.contains("Distinct");
    if subject == "count" {
        plan.selection = Selection::Count {
            distinct: plan.distinct,
            expr: Fragment::sql(format!("{}.{}", deriver.alias, root.id_column)),
        };
        plan.distinct = false;
    }
    if let Some(limit) = LIMIT_RE.captures(modifiers) {
        let digits = limit.get(1).map_or("", |m| m.as_str());
        plan.limit = Some(if digits.is_empty() {
            1
        } else {
            digits.parse().map_err(|_| MappingError::InvalidDerivedQuery {
                method: method.to_string(),
                reason: format!("limit `{digits}` is out of range"),
            })?
        });
    }
    plan.joins = deriver.joins;
    plan.filter = filter;
    plan.order_by = order_by;
    Ok(plan)
}

struct Deriver<'m> {
    method: &'m str,
    root: &'static EntityMeta,
    alias: String,
    joins: Vec<Join>,
    next_param: usize,
}

impl Deriver<'_> {
    fn predicates(&mut self, criteria: &str) -> Result<Fragment, MappingError> {
        let mut filter = Fragment::default();
        if criteria.is_empty() {
            return Ok(filter);
        }
        let words = camel_words(criteria);
        for (group_index, group) in words.split(|word| *word == "Or").enumerate() {
            if group_index > 0 {
                filter.push_sql("OR");
            }
            for (clause_index, clause) in group.split(|word| *word == "And").enumerate() {
                if clause_index > 0 {
                    filter.push_sql("AND");
                }
                let predicate = self.clause(clause)?;
                filter.append(predicate);
            }
        }
        Ok(filter)
    }

    fn clause(&mut self, words: &[&str]) -> Result<Fragment, MappingError> {
        let (words, ignore_case) = match words {
            [rest @ .., "Ignore", "Case"] | [rest @ .., "Ignoring", "Case"] => (rest, true),
            _ => (words, false),
        };
        let (property, operator) = split_operator(words);
        let property = match property {
            [rest @ .., "Is"] if !rest.is_empty() => rest,
            _ => property,
        };
        if property.is_empty() {
            return Err(self.invalid("a predicate is missing its property"));
        }
        if ignore_case && matches!(operator, Operator::In | Operator::NotIn) {
            return Err(self.invalid("IgnoreCase cannot be combined with In"));
        }

        let column = self.resolve(property)?;
        let column = if ignore_case {
            format!("UPPER({column})")
        } else {
            column
        };
        let mut fragment = Fragment::sql(column);
        let value = |fragment: &mut Fragment, param: ParamRef| {
            if ignore_case {
                fragment.push_sql("UPPER(");
                fragment.push_param(param, false);
                fragment.push_sql(")");
            } else {
                fragment.push_param(param, false);
            }
        };
        match operator {
            Operator::Equal => {
                fragment.push_sql("=");
                value(&mut fragment, self.take_param());
            }
            Operator::NotEqual => {
                fragment.push_sql("<>");
                value(&mut fragment, self.take_param());
            }
            Operator::LessThan => {
                fragment.push_sql("<");
                value(&mut fragment, self.take_param());
            }
            Operator::LessThanEqual => {
                fragment.push_sql("<=");
                value(&mut fragment, self.take_param());
            }
            Operator::GreaterThan => {
                fragment.push_sql(">");
                value(&mut fragment, self.take_param());
            }
            Operator::GreaterThanEqual => {
                fragment.push_sql(">=");
                value(&mut fragment, self.take_param());
            }
            Operator::Between => {
                fragment.push_sql("BETWEEN");
                value(&mut fragment, self.take_param());
                fragment.push_sql("AND");
                value(&mut fragment, self.take_param());
            }
            Operator::Like | Operator::NotLike => {
                fragment.push_sql(if operator == Operator::Like { "LIKE" } else { "NOT LIKE" });
                value(&mut fragment, self.take_param());
            }
            Operator::StartingWith => {
                fragment.push_sql("LIKE");
                value(&mut fragment, self.take_param());
                fragment.push_sql("|| '%'");
            }
            Operator::EndingWith => {
                fragment.push_sql("LIKE '%' ||");
                value(&mut fragment, self.take_param());
            }
            Operator::Containing | Operator::NotContaining => {
                fragment.push_sql(if operator == Operator::Containing {
                    "LIKE '%' ||"
                } else {
                    "NOT LIKE '%' ||"
                });
                value(&mut fragment, self.take_param());
                fragment.push_sql("|| '%'");
            }
            Operator::In | Operator::NotIn => {
                fragment.push_sql(if operator == Operator::In { "IN" } else { "NOT IN" });
                fragment.push_param(self.take_param(), true);
            }
            Operator::IsNull => fragment.push_sql("IS NULL"),
            Operator::IsNotNull => fragment.push_sql("IS NOT NULL"),
            Operator::True => fragment.push_sql("= 1"),
            Operator::False => fragment.push_sql("= 0"),
        }
        Ok(fragment)
    }

    fn take_param(&mut self) -> ParamRef {
        let param = ParamRef::Positional(self.next_param);
        self.next_param += 1;
        param
    }

    fn ordering(&mut self, ordering: &str) -> Result<Vec<String>, MappingError> {
        let mut order = Vec::new();
        if ordering.is_empty() {
            return Ok(order);
        }
        let mut pending: Vec<&str> = Vec::new();
        for word in camel_words(ordering) {
            match word {
                "Asc" | "Desc" => {
                    if pending.is_empty() {
                        return Err(self.invalid("OrderBy direction without a property"));
                    }
                    let column = self.root_column(&pending)?;
                    order.push(format!("{column} {}", word.to_ascii_uppercase()));
                    pending.clear();
                }
                _ => pending.push(word),
            }
        }
        if !pending.is_empty() {
            let column = self.root_column(&pending)?;
            order.push(format!("{column} ASC"));
        }
        Ok(order)
    }

    fn root_column(&self, words: &[&str]) -> Result<String, MappingError> {
        let property = camel_to_snake(&words.concat());
        self.root
            .column_for(&property)
            .map(|column| format!("{}.{column}", self.alias))
            .ok_or_else(|| self.unknown(&property))
    }

    /// Resolves a property: own attribute, id, version, relation key, then a
    /// nested `<relation><Attribute>` through an inner join.
    fn resolve(&mut self, words: &[&str]) -> Result<String, MappingError> {
        let property = camel_to_snake(&words.concat());
        if let Some(column) = self.root.column_for(&property) {
            return Ok(format!("{}.{column}", self.alias));
        }
        for split in 1..words.len() {
            let relation_name = camel_to_snake(&words[..split].concat());
            let Some(relation) = self.root.relation(&relation_name) else {
                continue;
            };
            let target = (relation.target)();
            let attribute = camel_to_snake(&words[split..].concat());
            let column = target
                .column_for(&attribute)
                .ok_or_else(|| MappingError::UnknownAttribute {
                    query: self.method.to_string(),
                    entity: target.name,
                    attribute: attribute.clone(),
                })?;
            let join_alias = format!("{}_{}", self.alias, relation.name);
            if !self.joins.iter().any(|join| join.alias == join_alias) {
                self.joins.push(Join {
                    alias: join_alias.clone(),
                    owner_alias: self.alias.clone(),
                    relation,
                    fetch: false,
                    left: false,
                });
            }
            return Ok(format!("{join_alias}.{column}"));
        }
        Err(self.unknown(&property))
    }

    fn unknown(&self, property: &str) -> MappingError {
        MappingError::UnknownAttribute {
            query: self.method.to_string(),
            entity: self.root.name,
            attribute: property.to_string(),
        }
    }

    fn invalid(&self, reason: &str) -> MappingError {
        MappingError::InvalidDerivedQuery {
            method: self.method.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn split_operator<'a, 'w>(words: &'a [&'w str]) -> (&'a [&'w str], Operator) {
    for (keyword, operator) in OPERATORS {
        if words.len() > keyword.len() && words.ends_with(keyword) {
            return (&words[..words.len() - keyword.len()], *operator);
        }
    }
    (words, Operator::Equal)
}

/// Splits `UsernameAndAge3` into `["Username", "And", "Age3"]`.
fn camel_words(value: &str) -> Vec<&str> {
    let mut words = Vec::new();
    let mut start = 0;
    for (index, ch) in value.char_indices().skip(1) {
        if ch.is_ascii_uppercase() {
            words.push(&value[start..index]);
            start = index;
        }
    }
    if start < value.len() {
        words.push(&value[start..]);
    }
    words
}
