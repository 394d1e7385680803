//! Instance handles shared between callers and the identity map.
//!
//! # Responsibility
//! - `Managed<T>`: the one shared instance a session hands out per identity.
//! - `Lazy<T>`: explicit unresolved reference; dereferenced only through
//!   `Lazy::get` with the owning session.
//! - `Inverse<T>`: non-owning reciprocal collection of a to-one relation.
//!
//! # Invariants
//! - `Managed` equality is identity, not value equality.
//! - A `Lazy` never performs I/O without an explicit session argument.
//! - `Inverse` holds weak handles and is mutated only by the owning side's
//!   relation mutator.

use super::error::{OrmError, OrmResult};
use super::mapping::Entity;
use super::session::{Session, SessionMarker};
use std::cell::{OnceCell, Ref, RefCell, RefMut};
use std::fmt::{Debug, Formatter};
use std::rc::{Rc, Weak};

/// Shared, interior-mutable entity instance.
pub struct Managed<T>(Rc<RefCell<T>>);

impl<T> Managed<T> {
    pub fn new(value: T) -> Self {
        Self(Rc::new(RefCell::new(value)))
    }

    /// Panics when the instance is mutably borrowed, like `RefCell::borrow`.
    pub fn borrow(&self) -> Ref<'_, T> {
        self.0.borrow()
    }

    /// Panics when the instance is already borrowed, like `RefCell::borrow_mut`.
    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.0.borrow_mut()
    }

    /// Returns whether both handles point at the same instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn downgrade(&self) -> Weak<RefCell<T>> {
        Rc::downgrade(&self.0)
    }

    pub(crate) fn weak(&self) -> WeakManaged<T> {
        WeakManaged(self.downgrade())
    }
}

/// Handle that does not keep the instance alive.
pub(crate) struct WeakManaged<T>(Weak<RefCell<T>>);

impl<T> WeakManaged<T> {
    pub(crate) fn upgrade(&self) -> Option<Managed<T>> {
        self.0.upgrade().map(Managed)
    }
}

impl<T: Entity> Managed<T> {
    pub(crate) fn read(&self) -> OrmResult<Ref<'_, T>> {
        self.0
            .try_borrow()
            .map_err(|_| OrmError::EntityInUse(T::meta().name))
    }

    pub(crate) fn write(&self) -> OrmResult<RefMut<'_, T>> {
        self.0
            .try_borrow_mut()
            .map_err(|_| OrmError::EntityInUse(T::meta().name))
    }
}

impl<T> Clone for Managed<T> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<T> PartialEq for Managed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T> Eq for Managed<T> {}

impl<T: Debug> Debug for Managed<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.0.try_borrow() {
            Ok(value) => value.fmt(f),
            Err(_) => f.write_str("Managed(<borrowed>)"),
        }
    }
}

enum LazyState<T> {
    Unset,
    /// Set in memory by a relation mutator.
    Bound(Managed<T>),
    /// Loaded from a row; resolved on first `get` within the origin session.
    Unresolved {
        id: i64,
        origin: Weak<SessionMarker>,
        cell: OnceCell<Managed<T>>,
    },
}

/// Runs when an unresolved reference first reaches its target.
pub(crate) type ResolveHook<T> = Box<dyn Fn(&Managed<T>) -> OrmResult<()>>;

/// To-one reference resolved on demand.
pub struct Lazy<T> {
    state: LazyState<T>,
    on_resolve: OnceCell<ResolveHook<T>>,
}

impl<T: Entity> Lazy<T> {
    pub fn unset() -> Self {
        Self {
            state: LazyState::Unset,
            on_resolve: OnceCell::new(),
        }
    }

    pub(crate) fn bound(target: Managed<T>) -> Self {
        Self {
            state: LazyState::Bound(target),
            on_resolve: OnceCell::new(),
        }
    }

    pub(crate) fn unresolved(id: i64, origin: Weak<SessionMarker>) -> Self {
        Self {
            state: LazyState::Unresolved {
                id,
                origin,
                cell: OnceCell::new(),
            },
            on_resolve: OnceCell::new(),
        }
    }

    pub fn is_set(&self) -> bool {
        !matches!(self.state, LazyState::Unset)
    }

    /// Returns whether `get` can answer without touching the database.
    pub fn is_resolved(&self) -> bool {
        match &self.state {
            LazyState::Unset | LazyState::Bound(_) => true,
            LazyState::Unresolved { cell, .. } => cell.get().is_some(),
        }
    }

    /// Identity of the target; `None` when unset or when the target is transient.
    pub fn id(&self) -> Option<i64> {
        match &self.state {
            LazyState::Unset => None,
            LazyState::Bound(target) => target.0.try_borrow().ok().and_then(|value| value.id()),
            LazyState::Unresolved { id, .. } => Some(*id),
        }
    }

    /// Returns the target if it is already in memory.
    pub fn peek(&self) -> Option<Managed<T>> {
        match &self.state {
            LazyState::Unset => None,
            LazyState::Bound(target) => Some(target.clone()),
            LazyState::Unresolved { cell, .. } => cell.get().cloned(),
        }
    }

    /// Dereferences the relation, loading it through `session` on first use.
    ///
    /// # Errors
    /// - `DetachedAccess` when the reference is unresolved and `session` is
    ///   not the open session that loaded it.
    /// - `NotFound` when the foreign key points at a missing row.
    pub fn get(&self, session: &mut Session<'_>) -> OrmResult<Option<Managed<T>>> {
        match &self.state {
            LazyState::Unset => Ok(None),
            LazyState::Bound(target) => Ok(Some(target.clone())),
            LazyState::Unresolved { id, origin, cell } => {
                if let Some(target) = cell.get() {
                    return Ok(Some(target.clone()));
                }
                if !session.is_origin_of(origin) {
                    return Err(OrmError::DetachedAccess {
                        entity: T::meta().name,
                        id: *id,
                    });
                }
                let target = session.load_reference::<T>(*id)?.ok_or(OrmError::NotFound {
                    entity: T::meta().name,
                    id: *id,
                })?;
                if cell.set(target.clone()).is_ok() {
                    self.resolved(&target)?;
                }
                Ok(Some(target))
            }
        }
    }

    /// Registers the callback run when this reference resolves. Only the first
    /// registration is kept.
    pub(crate) fn on_resolve(&self, hook: ResolveHook<T>) {
        let _ = self.on_resolve.set(hook);
    }

    /// Fills an unresolved reference whose foreign key matches `target` and
    /// runs the resolve callback.
    pub(crate) fn prefill(&self, target: &Managed<T>) -> OrmResult<()> {
        if self.fill(target) {
            self.resolved(target)?;
        }
        Ok(())
    }

    /// Fills without running the callback; returns whether the cell was set.
    pub(crate) fn fill(&self, target: &Managed<T>) -> bool {
        let LazyState::Unresolved { id, cell, .. } = &self.state else {
            return false;
        };
        let matches = target
            .0
            .try_borrow()
            .map(|value| value.id() == Some(*id))
            .unwrap_or(false);
        matches && cell.set(target.clone()).is_ok()
    }

    fn resolved(&self, target: &Managed<T>) -> OrmResult<()> {
        match self.on_resolve.get() {
            Some(hook) => hook(target),
            None => Ok(()),
        }
    }
}

impl<T> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        let state = match &self.state {
            LazyState::Unset => LazyState::Unset,
            LazyState::Bound(target) => LazyState::Bound(target.clone()),
            LazyState::Unresolved { id, origin, cell } => LazyState::Unresolved {
                id: *id,
                origin: origin.clone(),
                cell: cell.clone(),
            },
        };
        Self {
            state,
            on_resolve: OnceCell::new(),
        }
    }
}

impl<T: Entity> Debug for Lazy<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.state {
            LazyState::Unset => f.write_str("Lazy(unset)"),
            LazyState::Bound(_) => write!(f, "Lazy({} bound)", T::meta().name),
            LazyState::Unresolved { id, cell, .. } => write!(
                f,
                "Lazy({}#{id} {})",
                T::meta().name,
                if cell.get().is_some() {
                    "resolved"
                } else {
                    "unresolved"
                }
            ),
        }
    }
}

/// Reciprocal side of a to-one relation.
pub struct Inverse<T> {
    items: Vec<Weak<RefCell<T>>>,
}

impl<T> Inverse<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn contains(&self, item: &Managed<T>) -> bool {
        self.items
            .iter()
            .any(|weak| weak.upgrade().is_some_and(|rc| Rc::ptr_eq(&rc, &item.0)))
    }

    /// Live members in insertion order.
    pub fn to_vec(&self) -> Vec<Managed<T>> {
        self.items
            .iter()
            .filter_map(Weak::upgrade)
            .map(Managed)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.iter().filter(|weak| weak.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn link(&mut self, item: &Managed<T>) {
        self.items.retain(|weak| weak.strong_count() > 0);
        if !self.contains(item) {
            self.items.push(item.downgrade());
        }
    }

    pub(crate) fn unlink(&mut self, item: &Managed<T>) {
        self.items.retain(|weak| {
            weak.upgrade()
                .is_some_and(|rc| !Rc::ptr_eq(&rc, &item.0))
        });
    }
}

impl<T> Default for Inverse<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Inverse<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<T> Debug for Inverse<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Inverse(len={})", self.len())
    }
}
