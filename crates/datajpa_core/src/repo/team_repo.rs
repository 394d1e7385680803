//! Team repository.

use super::crud::{CrudPlans, CrudRepository};
use crate::model::team::link_member;
use crate::model::{Member, Team};
use crate::orm::{Entity, Managed, MappingError, Metamodel, OrmResult, QueryCompiler, QueryPlan, Session};

#[derive(Debug)]
pub struct TeamRepository {
    crud: CrudPlans<Team>,
    members_by_team: QueryPlan,
}

impl TeamRepository {
    pub fn new(metamodel: &Metamodel) -> Result<Self, MappingError> {
        QueryCompiler::for_entity::<Team>(metamodel)?;
        let members = QueryCompiler::for_entity::<Member>(metamodel)?;
        Ok(Self {
            crud: CrudPlans::new(),
            members_by_team: members.derived("findByTeam")?,
        })
    }

    /// Loads the members whose foreign key points at `team` and links them
    /// into its `members()` view. A transient team has no stored members.
    pub fn find_members(
        &self,
        session: &mut Session<'_>,
        team: &Managed<Team>,
    ) -> OrmResult<Vec<Managed<Member>>> {
        let Some(team_id) = team.read()?.id() else {
            return Ok(team.read()?.members().to_vec());
        };
        let members: Vec<Managed<Member>> =
            session.query(&self.members_by_team).arg(team_id).list()?;
        for member in &members {
            link_member(team, member)?;
        }
        Ok(members)
    }
}

impl CrudRepository for TeamRepository {
    type Entity = Team;

    fn crud(&self) -> &CrudPlans<Team> {
        &self.crud
    }
}
