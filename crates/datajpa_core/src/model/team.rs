//! Team entity, the one side of `Member.team`.

use super::member::Member;
use crate::orm::{Attribute, Entity, EntityMeta, Inverse, LoadContext, Managed, OrmResult, RowData};
use serde::Serialize;
use std::fmt::{Debug, Formatter};

pub static TEAM_META: EntityMeta = EntityMeta {
    name: "Team",
    table: "team",
    id_column: "team_id",
    attributes: &[Attribute::new("name", "name")],
    relations: &[],
    version: None,
    graphs: &[],
};

/// A named group of members.
///
/// `members` is not stored on the team row; it mirrors the `team_id` foreign
/// keys of loaded members. `Member::change_team` and `Member::leave_team`
/// maintain it in memory; a loaded member joins it once its `team` reference
/// resolves, and `TeamRepository::find_members` fills it for a whole team.
#[derive(Serialize)]
pub struct Team {
    id: Option<i64>,
    name: String,
    #[serde(skip)]
    members: Inverse<Member>,
}

impl Team {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            members: Inverse::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Members currently linked to this team in memory.
    pub fn members(&self) -> &Inverse<Member> {
        &self.members
    }

    pub(crate) fn members_mut(&mut self) -> &mut Inverse<Member> {
        &mut self.members
    }
}

impl Debug for Team {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Team")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Entity for Team {
    fn meta() -> &'static EntityMeta {
        &TEAM_META
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn assign_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn write_row(&self) -> OrmResult<RowData> {
        Ok(RowData::new().with("name", self.name.clone()))
    }

    fn read_row(row: &RowData, _ctx: &mut LoadContext) -> OrmResult<Self> {
        Ok(Self {
            id: Some(row.i64("team_id")?),
            name: row.opt_text("name")?.unwrap_or_default(),
            members: Inverse::new(),
        })
    }

    fn keep_unmapped(&mut self, previous: &Self) {
        self.members = previous.members.clone();
    }
}

/// Links `member` into `team`'s reciprocal view without touching the member.
pub(crate) fn link_member(team: &Managed<Team>, member: &Managed<Member>) -> OrmResult<()> {
    team.write()?.members_mut().link(member);
    Ok(())
}

/// Drops `member` from `team`'s reciprocal view.
pub(crate) fn unlink_member(team: &Managed<Team>, member: &Managed<Member>) -> OrmResult<()> {
    team.write()?.members_mut().unlink(member);
    Ok(())
}
