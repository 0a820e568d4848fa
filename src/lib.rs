//! Durable buffering and windowed aggregation for measurement profiles.
//!
//! The pipeline is built from two storage-backed primitives: a FIFO
//! [`queue`](crate::queue) that absorbs raw measurement records, and a
//! keyed [`map`](crate::map) that holds partially aggregated profiles. A
//! [`merge`](crate::merge) engine drains the queue into the map in
//! debounced passes, and the [`profile`](crate::profile) manager rotates
//! finished time windows out to a [`writer`](crate::writer).
//!
//! Every primitive routes its operations through a single worker task, so
//! callers never need external locking and callback-driven mutations
//! (consume, update, merge) are applied atomically with respect to each
//! other.

pub mod config;
pub mod export;
pub mod map;
pub mod merge;
pub mod profile;
pub mod queue;
pub mod service;
pub mod store;
pub mod writer;
