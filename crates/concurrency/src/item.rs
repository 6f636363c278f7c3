//! Transaction items
//!
//! Every object a transaction touches is represented by exactly one
//! [`TransItem`], identified by `(owner, key)`. The owner is the participant
//! that will lock, check, and install the item at commit time; the key names
//! the piece of the owner the item refers to (a constant such as "the list
//! version", or a node object).
//!
//! An item carries:
//! - a read observation (the version word seen by the transaction) and/or
//!   arbitrary participant read data
//! - a write payload
//! - a flag word: protocol bits owned by the engine plus user bits that
//!   participants use for their own bookkeeping (insert / delete / update)

use crate::participant::TObject;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use strata_core::{tid, Tid};

/// Type-erased payload stored on an item
pub type ItemData = Box<dyn Any + Send + Sync>;

/// Flag bits
///
/// Bits below [`USER0_BIT`](flags::USER0_BIT) belong to the commit protocol.
/// Participants are free to use the user bits however they like.
pub mod flags {
    /// Item has a read observation
    pub const READ_BIT: u32 = 1 << 0;
    /// Item has a write
    pub const WRITE_BIT: u32 = 1 << 1;
    /// Item's lock is held by this transaction and has not been released
    pub const LOCK_BIT: u32 = 1 << 2;
    /// First participant-owned bit
    pub const USER0_BIT: u32 = 1 << 8;
    /// Mask of every participant-owned bit
    pub const USER_MASK: u32 = !(USER0_BIT - 1);
}

// ============================================================================
// ItemKey
// ============================================================================

/// Key naming the part of an owner an item refers to
#[derive(Clone)]
pub enum ItemKey {
    /// Constant key, such as a container-wide version
    Const(u64),
    /// Object key, compared by identity
    Object(Arc<dyn Any + Send + Sync>),
}

impl ItemKey {
    /// Key for a shared object
    pub fn object<T: Any + Send + Sync>(obj: &Arc<T>) -> Self {
        ItemKey::Object(Arc::clone(obj) as Arc<dyn Any + Send + Sync>)
    }

    /// Identity used for set membership and lock ordering
    ///
    /// Constant keys sort before object keys; object keys sort by address.
    pub fn ident(&self) -> (u8, usize) {
        match self {
            ItemKey::Const(k) => (0, *k as usize),
            ItemKey::Object(obj) => (1, Arc::as_ptr(obj) as *const () as usize),
        }
    }

    /// Constant value, if this is a constant key
    pub fn as_const(&self) -> Option<u64> {
        match self {
            ItemKey::Const(k) => Some(*k),
            ItemKey::Object(_) => None,
        }
    }

    /// Borrow the object, if this is an object key of type `T`
    pub fn as_object<T: Any>(&self) -> Option<&T> {
        match self {
            ItemKey::Object(obj) => obj.downcast_ref::<T>(),
            ItemKey::Const(_) => None,
        }
    }

    /// Clone out the object handle, if this is an object key of type `T`
    pub fn as_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            ItemKey::Object(obj) => Arc::clone(obj).downcast::<T>().ok(),
            ItemKey::Const(_) => None,
        }
    }
}

impl PartialEq for ItemKey {
    fn eq(&self, other: &Self) -> bool {
        self.ident() == other.ident()
    }
}

impl Eq for ItemKey {}

impl fmt::Debug for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKey::Const(k) => write!(f, "Const({})", k),
            ItemKey::Object(obj) => write!(f, "Object({:p})", Arc::as_ptr(obj) as *const ()),
        }
    }
}

/// Address of a participant, used for identity and lock ordering
pub fn owner_ident(owner: &Arc<dyn TObject>) -> usize {
    Arc::as_ptr(owner) as *const () as usize
}

// ============================================================================
// TransItem
// ============================================================================

/// One `(owner, key)` entry in a transaction's item set
pub struct TransItem {
    owner: Arc<dyn TObject>,
    key: ItemKey,
    flags: u32,
    read_version: Tid,
    read_data: Option<ItemData>,
    write_data: Option<ItemData>,
}

impl TransItem {
    /// Fresh item with no read, no write and no flags
    pub fn new(owner: Arc<dyn TObject>, key: ItemKey) -> Self {
        Self {
            owner,
            key,
            flags: 0,
            read_version: 0,
            read_data: None,
            write_data: None,
        }
    }

    /// Participant responsible for this item
    pub fn owner(&self) -> &Arc<dyn TObject> {
        &self.owner
    }

    /// Key within the owner
    pub fn key(&self) -> &ItemKey {
        &self.key
    }

    /// Sort key for the canonical lock order
    pub fn lock_order(&self) -> (usize, (u8, usize)) {
        (owner_ident(&self.owner), self.key.ident())
    }

    // ---- reads ----

    /// Record a read of `version`
    ///
    /// The first observation wins; later calls keep it so validation compares
    /// against the earliest value the transaction depended on. Returns `false`
    /// if the observed word is locked, meaning a concurrent commit is
    /// installing and the caller should abort.
    pub fn observe(&mut self, version: Tid) -> bool {
        if tid::is_locked(version) {
            return false;
        }
        if !self.has_read() {
            self.flags |= flags::READ_BIT;
            self.read_version = version;
        }
        true
    }

    /// Replace the read observation unconditionally
    pub fn update_read(&mut self, version: Tid) {
        self.flags |= flags::READ_BIT;
        self.read_version = version;
    }

    /// Observed version word
    pub fn read_version(&self) -> Tid {
        self.read_version
    }

    /// Attach participant-defined read data and mark the item as read
    pub fn add_read_data<T: Any + Send + Sync>(&mut self, data: T) {
        self.flags |= flags::READ_BIT;
        self.read_data = Some(Box::new(data));
    }

    /// Participant read data, if present and of type `T`
    pub fn read_value<T: Any>(&self) -> Option<&T> {
        self.read_data.as_ref().and_then(|d| d.downcast_ref::<T>())
    }

    /// True if the item has a read observation
    #[inline]
    pub fn has_read(&self) -> bool {
        self.flags & flags::READ_BIT != 0
    }

    /// Drop the read observation
    pub fn remove_read(&mut self) {
        self.flags &= !flags::READ_BIT;
        self.read_version = 0;
        self.read_data = None;
    }

    // ---- writes ----

    /// Stage `value` as the item's write
    pub fn add_write<T: Any + Send + Sync>(&mut self, value: T) {
        self.flags |= flags::WRITE_BIT;
        self.write_data = Some(Box::new(value));
    }

    /// Staged write, if present and of type `T`
    pub fn write_value<T: Any>(&self) -> Option<&T> {
        self.write_data.as_ref().and_then(|d| d.downcast_ref::<T>())
    }

    /// Mutable staged write, if present and of type `T`
    pub fn write_value_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.write_data.as_mut().and_then(|d| d.downcast_mut::<T>())
    }

    /// Move the staged write out, leaving the write flag set
    pub fn take_write_value<T: Any>(&mut self) -> Option<T> {
        match self.write_data.take()?.downcast::<T>() {
            Ok(v) => Some(*v),
            Err(other) => {
                self.write_data = Some(other);
                None
            }
        }
    }

    /// True if the item has a write
    #[inline]
    pub fn has_write(&self) -> bool {
        self.flags & flags::WRITE_BIT != 0
    }

    /// Drop the write and its payload
    pub fn remove_write(&mut self) {
        self.flags &= !flags::WRITE_BIT;
        self.write_data = None;
    }

    /// Drop the write payload but keep the write flag
    pub fn clear_write(&mut self) {
        self.write_data = None;
    }

    // ---- locks ----

    /// True while this transaction holds the item's lock
    #[inline]
    pub fn needs_unlock(&self) -> bool {
        self.flags & flags::LOCK_BIT != 0
    }

    /// Record that the item's lock is held
    pub fn set_needs_unlock(&mut self) {
        self.flags |= flags::LOCK_BIT;
    }

    /// Record that the item's lock was released
    pub fn clear_needs_unlock(&mut self) {
        self.flags &= !flags::LOCK_BIT;
    }

    // ---- flags ----

    /// Raw flag word
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// True if every bit of `mask` is set
    pub fn has_flags(&self, mask: u32) -> bool {
        self.flags & mask == mask
    }

    /// Set participant bits
    pub fn add_flags(&mut self, bits: u32) {
        debug_assert_eq!(bits & !flags::USER_MASK, 0, "protocol bits are not settable");
        self.flags |= bits;
    }

    /// Clear participant bits
    pub fn clear_flags(&mut self, bits: u32) {
        debug_assert_eq!(bits & !flags::USER_MASK, 0, "protocol bits are not clearable");
        self.flags &= !bits;
    }

    /// Replace the bits selected by `mask` with `bits`
    pub fn assign_flags(&mut self, mask: u32, bits: u32) {
        debug_assert_eq!(mask & !flags::USER_MASK, 0, "protocol bits are not assignable");
        self.flags = (self.flags & !mask) | (bits & mask);
    }
}

impl fmt::Debug for TransItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransItem")
            .field("owner", &(owner_ident(&self.owner) as *const ()))
            .field("key", &self.key)
            .field("flags", &format_args!("{:#x}", self.flags))
            .field("read_version", &self.read_version)
            .finish()
    }
}
