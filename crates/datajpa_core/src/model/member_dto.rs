//! Read-only projection of a member with its team name.

use crate::orm::Projection;
use rusqlite::Row;
use serde::Serialize;

/// Built positionally from `select new MemberDto(m.id, m.username, t.name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberDto {
    pub id: i64,
    pub username: String,
    pub team_name: Option<String>,
}

impl MemberDto {
    pub fn new(id: i64, username: impl Into<String>, team_name: Option<String>) -> Self {
        Self {
            id,
            username: username.into(),
            team_name,
        }
    }
}

impl Projection for MemberDto {
    const NAME: &'static str = "MemberDto";
    const ARITY: usize = 3;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            username: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            team_name: row.get(2)?,
        })
    }
}
