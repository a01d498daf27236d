//! The two index generations.
//!
//! Hot receives writes and supports physical deletion; Cold stores aged
//! data, is soft-deleted only, and is rebuilt rather than mutated in
//! place. Both wrap an ANN backend with a label overlay.

pub mod cold;
pub mod hot;
pub mod overlay;

pub use cold::{ColdIndex, ColdStats, RebuildReport};
pub use hot::{HotIndex, HotStats};
