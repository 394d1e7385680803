//! Repositories over the study model.
//!
//! # Responsibility
//! - Declare each entity's queries once and verify them at construction.
//! - Execute them against a caller-supplied `Session`.
//!
//! # Invariants
//! - Construction fails with `MappingError` on the first query that does not
//!   match the entity mappings; no repository exists in a half-verified state.
//! - Repositories hold no connection or session state.

pub mod crud;
pub mod item_repo;
pub mod member_repo;
pub mod team_repo;

pub use crud::{CrudPlans, CrudRepository};
pub use item_repo::ItemRepository;
pub use member_repo::{MemberRepository, MemberRepositoryCustom, MemberRepositoryImpl};
pub use team_repo::TeamRepository;

use crate::orm::{MappingError, Metamodel};
use log::{error, info};

/// Every repository of the model, verified together.
#[derive(Debug)]
pub struct Repositories {
    pub members: MemberRepository,
    pub teams: TeamRepository,
    pub items: ItemRepository,
}

impl Repositories {
    /// Builds every repository, failing on the first invalid declaration.
    pub fn new(metamodel: &Metamodel) -> Result<Self, MappingError> {
        let built = MemberRepository::new(metamodel).and_then(|members| {
            Ok(Self {
                members,
                teams: TeamRepository::new(metamodel)?,
                items: ItemRepository::new(metamodel)?,
            })
        });
        match &built {
            Ok(_) => info!("event=repositories_verify module=repo status=ok count=3"),
            Err(err) => error!(
                "event=repositories_verify module=repo status=error error_code=mapping error=\"{err}\""
            ),
        }
        built
    }
}
