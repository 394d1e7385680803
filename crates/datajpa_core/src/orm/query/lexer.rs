//! Tokenizer for the object query language.

use crate::orm::error::MappingError;
use once_cell::sync::Lazy;
use regex::Regex;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\A\s*(?:'(?P<str>(?:[^']|'')*)'|:(?P<named>[A-Za-z_][A-Za-z0-9_]*)|\?(?P<pos>[0-9]+)|(?P<num>[0-9]+)|(?P<ident>[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)|(?P<op><>|!=|<=|>=|[=<>(),+\-*/]))",
    )
    .expect("token regex must compile")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    Str(String),
    Named(String),
    Positional(usize),
    Number(i64),
    /// Identifier or dotted path, case preserved.
    Ident(String),
    Op(String),
}

impl Token {
    pub(crate) fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Self::Ident(ident) if ident.eq_ignore_ascii_case(keyword))
    }

    pub(crate) fn is_op(&self, op: &str) -> bool {
        matches!(self, Self::Op(value) if value == op)
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Str(value) => format!("'{value}'"),
            Self::Named(name) => format!(":{name}"),
            Self::Positional(index) => format!("?{index}"),
            Self::Number(value) => value.to_string(),
            Self::Ident(value) | Self::Op(value) => value.clone(),
        }
    }
}

pub(crate) fn tokenize(query: &str) -> Result<Vec<Token>, MappingError> {
    let mut tokens = Vec::new();
    let mut rest = query;
    while !rest.trim().is_empty() {
        let captures = TOKEN_RE.captures(rest).ok_or_else(|| MappingError::Syntax {
            query: query.to_string(),
            message: format!("unexpected input near `{}`", rest.trim_start()),
        })?;
        let token = if let Some(value) = captures.name("str") {
            Token::Str(value.as_str().replace("''", "'"))
        } else if let Some(name) = captures.name("named") {
            Token::Named(name.as_str().to_string())
        } else if let Some(index) = captures.name("pos") {
            Token::Positional(parse_number(query, index.as_str())?)
        } else if let Some(number) = captures.name("num") {
            Token::Number(parse_number(query, number.as_str())?)
        } else if let Some(ident) = captures.name("ident") {
            Token::Ident(ident.as_str().to_string())
        } else if let Some(op) = captures.name("op") {
            Token::Op(op.as_str().to_string())
        } else {
            return Err(MappingError::Syntax {
                query: query.to_string(),
                message: "empty token".to_string(),
            });
        };
        tokens.push(token);
        let consumed = captures.get(0).map_or(rest.len(), |whole| whole.end());
        rest = &rest[consumed..];
    }
    Ok(tokens)
}

fn parse_number<N: std::str::FromStr>(query: &str, text: &str) -> Result<N, MappingError> {
    text.parse().map_err(|_| MappingError::Syntax {
        query: query.to_string(),
        message: format!("number `{text}` is out of range"),
    })
}

#[cfg(test)]
mod tests {
    use super::{tokenize, Token};

    #[test]
    fn tokenizes_paths_parameters_and_operators() {
        let tokens = tokenize("select m from Member m where m.age >= :age and m.username <> ?1")
            .unwrap();
        assert_eq!(tokens[0], Token::Ident("select".to_string()));
        assert!(tokens.contains(&Token::Ident("m.age".to_string())));
        assert!(tokens.contains(&Token::Op(">=".to_string())));
        assert!(tokens.contains(&Token::Named("age".to_string())));
        assert!(tokens.contains(&Token::Op("<>".to_string())));
        assert_eq!(tokens.last(), Some(&Token::Positional(1)));
    }

    #[test]
    fn string_literals_unescape_doubled_quotes() {
        let tokens = tokenize("m.username = 'O''Brien'").unwrap();
        assert_eq!(tokens[2], Token::Str("O'Brien".to_string()));
    }

    #[test]
    fn rejects_unknown_characters() {
        let err = tokenize("select m from Member m where m.age ; 1").unwrap_err();
        assert!(err.to_string().contains("unexpected input"));
    }

    #[test]
    fn keywords_match_case_insensitively() {
        let tokens = tokenize("SELECT Distinct").unwrap();
        assert!(tokens[0].is_keyword("select"));
        assert!(tokens[1].is_keyword("distinct"));
    }
}
