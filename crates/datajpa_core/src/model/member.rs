//! Member entity: audited, versioned, many-to-one to `Team`.
//!
//! # Invariants
//! - When `team` is set, the team's `members()` view contains this member
//!   (for teams held in memory). Both sides change together through
//!   `Member::change_team` / `Member::leave_team` only.
//! - A loaded member links itself into its team as soon as the reference
//!   resolves, whether by `Lazy::get`, a fetch join or an entity graph.
//! - `Debug` output leaves the relation out.

use super::base_entity::{Auditable, BaseEntity};
use super::team::{link_member, unlink_member, Team};
use crate::orm::{
    Attribute, Entity, EntityGraph, EntityMeta, Lazy, LoadContext, Managed, OrmError, OrmResult,
    Relation, RowData,
};
use std::any::Any;
use std::fmt::{Debug, Formatter};

pub static MEMBER_META: EntityMeta = EntityMeta {
    name: "Member",
    table: "member",
    id_column: "member_id",
    attributes: &[
        Attribute::new("username", "username"),
        Attribute::new("age", "age"),
        Attribute::immutable("createdDate", "created_date"),
        Attribute::new("updatedDate", "updated_date"),
    ],
    relations: &[Relation::many_to_one::<Team>("team", "team_id")],
    version: Some(Attribute::new("version", "version")),
    graphs: &[EntityGraph::new("Member.all", &["team"])],
};

pub struct Member {
    id: Option<i64>,
    username: String,
    age: i32,
    team: Lazy<Team>,
    version: i64,
    audit: BaseEntity,
}

impl Member {
    pub fn new(username: impl Into<String>) -> Self {
        Self::with_age(username, 0)
    }

    pub fn with_age(username: impl Into<String>, age: i32) -> Self {
        Self {
            id: None,
            username: username.into(),
            age,
            team: Lazy::unset(),
            version: 0,
            audit: BaseEntity::default(),
        }
    }

    /// Builds a member already placed in `team`.
    pub fn with_team(
        username: impl Into<String>,
        age: i32,
        team: &Managed<Team>,
    ) -> OrmResult<Managed<Self>> {
        let member = Managed::new(Self::with_age(username, age));
        Self::change_team(&member, team)?;
        Ok(member)
    }

    /// Moves `member` to `team`, updating both sides of the relation.
    pub fn change_team(member: &Managed<Self>, team: &Managed<Team>) -> OrmResult<()> {
        let previous = member.read()?.team.peek();
        if let Some(previous) = previous {
            if previous.ptr_eq(team) {
                return Ok(());
            }
            unlink_member(&previous, member)?;
        }
        member.write()?.team = Lazy::bound(team.clone());
        link_member(team, member)
    }

    /// Clears the relation on both sides.
    pub fn leave_team(member: &Managed<Self>) -> OrmResult<()> {
        let previous = member.read()?.team.peek();
        if let Some(previous) = previous {
            unlink_member(&previous, member)?;
        }
        member.write()?.team = Lazy::unset();
        Ok(())
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.username = username.into();
    }

    pub fn age(&self) -> i32 {
        self.age
    }

    pub fn set_age(&mut self, age: i32) {
        self.age = age;
    }

    /// Resolve with `Lazy::get(&mut session)`.
    pub fn team(&self) -> &Lazy<Team> {
        &self.team
    }

    pub fn created_date(&self) -> Option<i64> {
        self.audit.created_date()
    }

    pub fn updated_date(&self) -> Option<i64> {
        self.audit.updated_date()
    }
}

impl Debug for Member {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("age", &self.age)
            .finish()
    }
}

impl Entity for Member {
    fn meta() -> &'static EntityMeta {
        &MEMBER_META
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn assign_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn write_row(&self) -> OrmResult<RowData> {
        let team_id = match (self.team.is_set(), self.team.id()) {
            (true, None) => {
                return Err(OrmError::TransientReference {
                    entity: MEMBER_META.name,
                    relation: "team",
                })
            }
            (_, id) => id,
        };
        let mut row = RowData::new()
            .with("username", self.username.clone())
            .with("age", self.age)
            .with("team_id", team_id);
        self.audit.write_columns(&mut row);
        Ok(row)
    }

    fn read_row(row: &RowData, ctx: &mut LoadContext) -> OrmResult<Self> {
        Ok(Self {
            id: Some(row.i64("member_id")?),
            username: row.opt_text("username")?.unwrap_or_default(),
            age: row.i32("age")?,
            team: ctx.reference::<Team>("team", row.opt_i64("team_id")?),
            version: row.i64("version")?,
            audit: BaseEntity::read_columns(row)?,
        })
    }

    fn version(&self) -> Option<i64> {
        Some(self.version)
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn prefill(&self, relation: &str, target: &dyn Any) -> OrmResult<()> {
        if relation == "team" {
            if let Some(team) = target.downcast_ref::<Managed<Team>>() {
                self.team.prefill(team)?;
            }
        }
        Ok(())
    }

    fn attach_relations(handle: &Managed<Self>) -> OrmResult<()> {
        let member = handle.read()?;
        if let Some(team) = member.team.peek() {
            link_member(&team, handle)?;
        }
        let weak = handle.weak();
        member.team.on_resolve(Box::new(move |team: &Managed<Team>| match weak.upgrade() {
            Some(member) => link_member(team, &member),
            None => Ok(()),
        }));
        Ok(())
    }
}

impl Auditable for Member {
    fn audit(&self) -> &BaseEntity {
        &self.audit
    }

    fn audit_mut(&mut self) -> &mut BaseEntity {
        &mut self.audit
    }
}
