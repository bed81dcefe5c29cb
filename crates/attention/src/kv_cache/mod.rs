//! Per-layer key/value cache for incremental decoding.
//!
//! A cache moves through `Empty -> Primed -> Extended -> ... -> Empty`:
//! [`KvCache::prime`] stores the whole prompt once, [`KvCache::extend`]
//! writes exactly one slot per batch row per decode step, and
//! [`KvCache::reset`] clears everything for the next prompt.

pub mod layout;
pub mod state;

pub use layout::CacheLayout;
pub use state::{CacheSnapshot, CacheState, KvCache, SlotPosition};

#[cfg(test)]
mod tests;
