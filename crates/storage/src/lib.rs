//! Snapshot storage for Strata STM objects
//!
//! This crate implements point-in-time reads over objects that transactions
//! keep mutating:
//! - NodeWrapper: one immutable version with its `[s_sid, c_sid)` window
//! - History: sorted deque of superseded versions
//! - NodeBase: object identity, current root, version cell, history
//! - ObjectId: indirect / direct handles resolving an object at a sid
//! - SnapshotRegistry: live sids and the compaction horizon

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod history;
pub mod node;
pub mod object_id;
pub mod snapshot;
pub mod wrapper;

pub use history::History;
pub use node::NodeBase;
pub use object_id::ObjectId;
pub use snapshot::SnapshotRegistry;
pub use wrapper::NodeWrapper;
