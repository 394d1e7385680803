//! Audit timestamps shared by audited entities.
//!
//! # Invariants
//! - Timestamps are written only by the listeners installed through
//!   `register_auditing`; callers can read them but not set them.
//! - `created_date` is written on insert and never again.

use crate::orm::{Clock, Entity, Listeners, OrmResult, RowData};
use serde::Serialize;
use std::rc::Rc;

pub const CREATED_DATE_COLUMN: &str = "created_date";
pub const UPDATED_DATE_COLUMN: &str = "updated_date";

/// `created_date` / `updated_date` pair, epoch milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BaseEntity {
    created_date: Option<i64>,
    updated_date: Option<i64>,
}

impl BaseEntity {
    pub fn created_date(&self) -> Option<i64> {
        self.created_date
    }

    pub fn updated_date(&self) -> Option<i64> {
        self.updated_date
    }

    pub(crate) fn write_columns(&self, row: &mut RowData) {
        row.put(CREATED_DATE_COLUMN, self.created_date);
        row.put(UPDATED_DATE_COLUMN, self.updated_date);
    }

    pub(crate) fn read_columns(row: &RowData) -> OrmResult<Self> {
        Ok(Self {
            created_date: row.opt_i64(CREATED_DATE_COLUMN)?,
            updated_date: row.opt_i64(UPDATED_DATE_COLUMN)?,
        })
    }

    fn stamp_insert(&mut self, now: i64) {
        self.created_date = Some(now);
        self.updated_date = Some(now);
    }

    fn stamp_update(&mut self, now: i64) {
        self.updated_date = Some(now);
    }
}

/// An entity that embeds `BaseEntity`.
pub trait Auditable: Entity {
    fn audit(&self) -> &BaseEntity;

    fn audit_mut(&mut self) -> &mut BaseEntity;
}

/// Installs the insert/update stamping callbacks for `T`.
pub fn register_auditing<T: Auditable>(listeners: &mut Listeners, clock: Rc<dyn Clock>) {
    let insert_clock = Rc::clone(&clock);
    listeners.on_before_insert::<T>(move |entity| {
        entity.audit_mut().stamp_insert(insert_clock.now_millis());
    });
    listeners.on_before_update::<T>(move |entity| {
        entity.audit_mut().stamp_update(clock.now_millis());
    });
}
