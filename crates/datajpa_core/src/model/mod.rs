//! Study domain model: members, teams, items and the member projection.
//!
//! # Invariants
//! - Entities never stamp their own audit columns; `listeners` installs the
//!   callbacks that do.
//! - `metamodel` lists every entity a declared query may name.

pub mod base_entity;
pub mod item;
pub mod member;
pub mod member_dto;
pub mod team;

pub use base_entity::{register_auditing, Auditable, BaseEntity};
pub use item::Item;
pub use member::Member;
pub use member_dto::MemberDto;
pub use team::Team;

use crate::orm::{Clock, Entity, Listeners, MappingError, Metamodel};
use std::rc::Rc;

/// Registry of `Member`, `Team` and `Item`, with entity graphs validated.
pub fn metamodel() -> Result<Metamodel, MappingError> {
    Metamodel::new(vec![Member::meta(), Team::meta(), Item::meta()])
}

/// Lifecycle callbacks for the audited entities, stamped from `clock`.
pub fn listeners(clock: Rc<dyn Clock>) -> Listeners {
    let mut listeners = Listeners::new();
    register_auditing::<Member>(&mut listeners, clock);
    listeners
}
