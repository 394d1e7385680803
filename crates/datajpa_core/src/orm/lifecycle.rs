//! Explicit lifecycle callback registry.
//!
//! # Invariants
//! - `BeforeInsert` fires once, when an instance becomes persistent.
//! - `BeforeUpdate` fires on each flush that finds the instance dirty.
//! - Callbacks run in registration order.

use super::mapping::Entity;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    BeforeInsert,
    BeforeUpdate,
}

type Callback = Box<dyn Fn(&mut dyn Any)>;

/// Per-entity-type lifecycle callbacks invoked by sessions.
#[derive(Default)]
pub struct Listeners {
    callbacks: HashMap<(TypeId, LifecycleEvent), Vec<Callback>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<T: Entity>(&mut self, event: LifecycleEvent, callback: impl Fn(&mut T) + 'static) {
        let erased: Callback = Box::new(move |entity: &mut dyn Any| {
            if let Some(entity) = entity.downcast_mut::<T>() {
                callback(entity);
            }
        });
        self.callbacks
            .entry((TypeId::of::<T>(), event))
            .or_default()
            .push(erased);
    }

    pub fn on_before_insert<T: Entity>(&mut self, callback: impl Fn(&mut T) + 'static) {
        self.on(LifecycleEvent::BeforeInsert, callback);
    }

    pub fn on_before_update<T: Entity>(&mut self, callback: impl Fn(&mut T) + 'static) {
        self.on(LifecycleEvent::BeforeUpdate, callback);
    }

    pub(crate) fn fire<T: Entity>(&self, event: LifecycleEvent, entity: &mut T) {
        if let Some(callbacks) = self.callbacks.get(&(TypeId::of::<T>(), event)) {
            for callback in callbacks {
                callback(&mut *entity);
            }
        }
    }
}

impl Debug for Listeners {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("registrations", &self.callbacks.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

/// Source of audit timestamps, in epoch milliseconds.
pub trait Clock {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}
