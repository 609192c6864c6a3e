//! A probabilistic, ordered in-memory index over byte-string keys, backed by a
//! TTL-quarantined slab allocator so that concurrent readers can walk raw pointers
//! into node storage without reference counting.
//!
//! The data structure and its threading contract are described on [`SkipList`]; the
//! physical memory backing every node's key, value, and forward-pointer array is
//! described in the `slabtable-slab` crate this one is built on.

mod comparator;
mod height;
mod iter;
mod list;
mod node;

pub use comparator::{Comparator, DefaultComparator};
pub use height::MAX_HEIGHT;
pub use iter::Iter;
pub use list::SkipList;
