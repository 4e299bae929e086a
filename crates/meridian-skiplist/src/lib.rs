//! # meridian-skiplist
//!
//! A lock-free, multi-level ordered index for Meridian.
//!
//! This crate implements:
//! - A concurrent skiplist with non-blocking insert, logical (soft) delete,
//!   cooperative physical unlink, and ordered traversal
//! - Tagged atomic forward links, where the delete mark and the successor
//!   pointer are updated by a single compare-and-swap
//! - Epoch-based safe memory reclamation: unlinked nodes are returned to the
//!   allocator only after no in-flight reader can still reach them
//! - Range-split hints for sharding large scans
//!
//! Ordering is external: every search-shaped operation takes a comparator,
//! so one list can be indexed under different orderings by different
//! callers (the MVCC layer relies on this).
//!
//! ## Example
//!
//! ```rust
//! use meridian_skiplist::SkipList;
//!
//! let list: SkipList<u64> = SkipList::new();
//! let cmp = |a: &u64, b: &u64| a.cmp(b);
//! let mut buf = list.make_buf();
//! let mut rng = || 0.5f32;
//!
//! assert!(list.insert(7, &cmp, &mut buf, &mut rng));
//! assert!(list.insert(3, &cmp, &mut buf, &mut rng));
//! assert!(!list.insert(7, &cmp, &mut buf, &mut rng)); // duplicate
//!
//! let mut iter = list.iter(&cmp);
//! iter.seek_first();
//! assert_eq!(iter.item(), Some(&3));
//! ```

#![warn(clippy::all)]

pub mod alloc;
mod iter;
mod list;
mod node;
mod stats;

pub use alloc::{GlobalNodeAlloc, NodeAlloc};
pub use iter::Iter;
pub use list::{ActionBuffer, SkipList, Upsert, MAX_LEVEL};
pub use node::{Node, NodeRef};
pub use stats::Stats;

use std::cmp::Ordering;

/// Comparator over items, passed per operation.
///
/// Head and tail sentinels are never handed to a comparator.
pub type CompareFn<T> = dyn Fn(&T, &T) -> Ordering + Send + Sync;
