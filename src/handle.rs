//! Generational handles and the process-wide owner registry.
//!
//! A handle is a stable name for a slot managed by some owner: the triple
//! `(owner, index, generation)` plus an optional type tag. Slot reuse bumps
//! the slot's generation, so a caller holding a name to a dead slot fails a
//! single 32-bit compare instead of touching the resurrected successor.
//!
//! Owners register themselves in a process-wide table keyed by an opaque
//! pointer-sized id. Rows hold a `Weak` to the owner, so resolution after
//! the owner died returns `None` rather than dangling, and the `Weak`
//! upgrade doubles as the retain that keeps a resolved owner alive while the
//! caller uses it.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Opaque identity of a registered owner. Minted from the owner's allocation
/// address, which is stable for the owner's lifetime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(usize);

impl OwnerId {
    pub(crate) fn of<T: ?Sized>(owner: &Arc<T>) -> Self {
        OwnerId(Arc::as_ptr(owner) as *const () as usize)
    }

    /// The id no live owner ever has.
    pub const NONE: OwnerId = OwnerId(0);
}

/// First generation handed out for a fresh slot. Generation 0 never names a
/// live slot, so a zeroed handle is reliably invalid.
pub(crate) const FIRST_GENERATION: u32 = 1;

/// Advances a slot generation, skipping 0 on wrap.
pub(crate) fn bump_generation(generation: u32) -> u32 {
    let next = generation.wrapping_add(1);
    if next == 0 {
        FIRST_GENERATION
    } else {
        next
    }
}

/// Implemented by anything that hands out generational handles.
pub trait HandleOwner: Send + Sync + 'static {
    /// True iff `index` currently holds a live slot at exactly `generation`.
    fn validate(&self, index: u32, generation: u32) -> bool;
}

/// An untyped handle: `(owner, index, generation)` plus an optional type tag.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct RawHandle {
    owner: OwnerId,
    index: u32,
    generation: u32,
    type_tag: Option<TypeId>,
}

impl RawHandle {
    pub(crate) fn new(owner: OwnerId, index: u32, generation: u32) -> Self {
        Self {
            owner,
            index,
            generation,
            type_tag: None,
        }
    }

    /// The reliably-invalid handle.
    pub fn null() -> Self {
        Self {
            owner: OwnerId::NONE,
            index: 0,
            generation: 0,
            type_tag: None,
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Identity comparison on the triple; the type tag does not participate.
    pub fn same_slot(&self, other: &RawHandle) -> bool {
        self.owner == other.owner
            && self.index == other.index
            && self.generation == other.generation
    }

    /// True when both handles carry the same type tag (or neither does).
    pub fn type_matches(&self, other: &RawHandle) -> bool {
        self.type_tag == other.type_tag
    }

    /// Consults the owner registry: false on a missing row, a dead owner, or
    /// a generation mismatch.
    pub fn is_valid(&self) -> bool {
        match resolve_owner(self) {
            Some(owner) => owner.validate(self.index, self.generation),
            None => false,
        }
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RawHandle(owner={:#x}, idx={}, gen={})",
            self.owner.0, self.index, self.generation
        )
    }
}

/// A [`RawHandle`] tagged with the owner's object type.
pub struct TypedHandle<T: 'static> {
    raw: RawHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> TypedHandle<T> {
    pub(crate) fn new(owner: OwnerId, index: u32, generation: u32) -> Self {
        Self {
            raw: RawHandle {
                owner,
                index,
                generation,
                type_tag: Some(TypeId::of::<T>()),
            },
            _marker: PhantomData,
        }
    }

    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    pub fn index(&self) -> u32 {
        self.raw.index
    }

    pub fn generation(&self) -> u32 {
        self.raw.generation
    }

    pub fn is_valid(&self) -> bool {
        self.raw.is_valid()
    }

    /// Recovers the typed handle from an erased one; `None` when the tag
    /// names a different type.
    pub fn from_raw(raw: RawHandle) -> Option<Self> {
        if raw.type_tag == Some(TypeId::of::<T>()) {
            Some(Self {
                raw,
                _marker: PhantomData,
            })
        } else {
            None
        }
    }
}

impl<T: 'static> Copy for TypedHandle<T> {}

impl<T: 'static> Clone for TypedHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: 'static> PartialEq for TypedHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T: 'static> Eq for TypedHandle<T> {}

impl<T: 'static> fmt::Debug for TypedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TypedHandle<{}>({:?})",
            std::any::type_name::<T>(),
            self.raw
        )
    }
}

/// Process-wide owner table. Mutation is rare (owner construction and
/// destruction) and serialized by the write lock; lookups are concurrent
/// reads.
static OWNERS: Lazy<RwLock<HashMap<OwnerId, Weak<dyn HandleOwner>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Installs an owner row. Additive and idempotent by owner id; re-registering
/// a live owner is a no-op.
pub fn register_owner<T: HandleOwner>(owner: &Arc<T>) -> OwnerId {
    let id = OwnerId::of(owner);
    let dyn_owner: Arc<dyn HandleOwner> = owner.clone();
    let weak: Weak<dyn HandleOwner> = Arc::downgrade(&dyn_owner);
    OWNERS.write().insert(id, weak);
    id
}

/// Removes the owner row. After this returns, no handle for that owner
/// resolves.
pub fn unregister_owner(id: OwnerId) {
    OWNERS.write().remove(&id);
}

/// Resolves a handle to a retained reference to its owner; `None` when the
/// row is missing, the owner is dead, or the generation is stale.
pub fn resolve_owner(handle: &RawHandle) -> Option<Arc<dyn HandleOwner>> {
    let owner = OWNERS.read().get(&handle.owner)?.upgrade()?;
    if owner.validate(handle.index, handle.generation) {
        Some(owner)
    } else {
        None
    }
}

/// Registry-level validity check for an erased handle.
pub fn is_valid(handle: &RawHandle) -> bool {
    handle.is_valid()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Pool {
        generations: Vec<AtomicU32>,
    }

    impl HandleOwner for Pool {
        fn validate(&self, index: u32, generation: u32) -> bool {
            self.generations
                .get(index as usize)
                .map_or(false, |g| g.load(Ordering::Acquire) == generation)
        }
    }

    fn pool(slots: usize) -> Arc<Pool> {
        Arc::new(Pool {
            generations: (0..slots).map(|_| AtomicU32::new(FIRST_GENERATION)).collect(),
        })
    }

    #[test]
    fn generation_skips_zero_on_wrap() {
        assert_eq!(bump_generation(1), 2);
        assert_eq!(bump_generation(u32::MAX), FIRST_GENERATION);
    }

    #[test]
    fn registered_owner_validates_handles() {
        let owner = pool(4);
        let id = register_owner(&owner);
        let handle = RawHandle::new(id, 2, FIRST_GENERATION);
        assert!(handle.is_valid());
        assert!(resolve_owner(&handle).is_some());

        // Slot reuse bumps the generation; the old name goes stale.
        owner.generations[2].store(bump_generation(FIRST_GENERATION), Ordering::Release);
        assert!(!handle.is_valid());
        assert!(resolve_owner(&handle).is_none());

        unregister_owner(id);
    }

    #[test]
    fn unregistered_owner_never_resolves() {
        let owner = pool(1);
        let id = register_owner(&owner);
        let handle = RawHandle::new(id, 0, FIRST_GENERATION);
        unregister_owner(id);
        assert!(!handle.is_valid());
        assert!(resolve_owner(&handle).is_none());
    }

    #[test]
    fn dead_owner_leaves_row_unresolvable() {
        let owner = pool(1);
        let id = register_owner(&owner);
        let handle = RawHandle::new(id, 0, FIRST_GENERATION);
        // Pin the allocation with a weak so the address cannot be minted to
        // a new owner while the dead row is probed.
        let keepalive = Arc::downgrade(&owner);
        drop(owner);
        assert!(!handle.is_valid());
        assert!(resolve_owner(&handle).is_none());
        unregister_owner(id);
        drop(keepalive);
    }

    #[test]
    fn null_handle_is_invalid() {
        assert!(!RawHandle::null().is_valid());
    }

    #[test]
    fn typed_handles_round_trip_through_raw() {
        struct TagA;
        struct TagB;
        let typed = TypedHandle::<TagA>::new(OwnerId(7), 3, 9);
        let raw = typed.raw();
        assert!(TypedHandle::<TagA>::from_raw(raw).is_some());
        assert!(TypedHandle::<TagB>::from_raw(raw).is_none());
        assert!(raw.type_matches(&typed.raw()));
    }
}
