//! Item entity: identity only.

use crate::orm::{Entity, EntityMeta, LoadContext, OrmResult, RowData};

pub static ITEM_META: EntityMeta = EntityMeta {
    name: "Item",
    table: "item",
    id_column: "item_id",
    attributes: &[],
    relations: &[],
    version: None,
    graphs: &[],
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    id: Option<i64>,
}

impl Item {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Entity for Item {
    fn meta() -> &'static EntityMeta {
        &ITEM_META
    }

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn assign_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn write_row(&self) -> OrmResult<RowData> {
        Ok(RowData::new())
    }

    fn read_row(row: &RowData, _ctx: &mut LoadContext) -> OrmResult<Self> {
        Ok(Self {
            id: Some(row.i64("item_id")?),
        })
    }
}
