//! Item repository: CRUD only.

use super::crud::{CrudPlans, CrudRepository};
use crate::model::Item;
use crate::orm::{MappingError, Metamodel, QueryCompiler};

#[derive(Debug)]
pub struct ItemRepository {
    crud: CrudPlans<Item>,
}

impl ItemRepository {
    pub fn new(metamodel: &Metamodel) -> Result<Self, MappingError> {
        QueryCompiler::for_entity::<Item>(metamodel)?;
        Ok(Self {
            crud: CrudPlans::new(),
        })
    }
}

impl CrudRepository for ItemRepository {
    type Entity = Item;

    fn crud(&self) -> &CrudPlans<Item> {
        &self.crud
    }
}
