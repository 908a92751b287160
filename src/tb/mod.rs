//! This module provides the translation-block cache: content-addressed storage of translated
//! fragments, direct-jump chaining between them, and the two jump-table fast paths.

pub mod cache;
pub mod chain;
pub mod jumptable;

pub use cache::{Tb, TbCache, TbHandle};
pub use chain::ChainRef;
pub use jumptable::Jumptables;
