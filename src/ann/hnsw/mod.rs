//! HNSW approximate nearest neighbor index.
//!
//! Multi-layer proximity graph with exponential level assignment, greedy
//! descent, and heuristic neighbor selection. No training phase; physical
//! removal is unsupported (nodes are tombstoned and dropped at rebuild).

pub mod graph;
pub mod insert;
pub mod search;
pub mod visited;

pub use graph::{HnswGraph, HnswParams};
