//! Zero-sized hash builder for the engine's internal hash collections.
//!
//! All subscriber sets, child maps and pending queues hash engine-internal
//! ids with a fixed seed. HashDoS resistance is not a concern for these
//! structures, determinism across instances is.

use std::hash::BuildHasher;

pub use foldhash::fast::{FixedState, FoldHasher};

/// A zero-sized `BuildHasher` over foldhash with a fixed seed.
///
/// Every instance produces identical hash values, so collections built with
/// it iterate deterministically given deterministic insertion order.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x2d35_8dcc_aa6c_78a5).build_hasher()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_and_deterministic() {
        assert_eq!(std::mem::size_of::<FastHashBuilder>(), 0);
        assert_eq!(
            FastHashBuilder.hash_one("production"),
            FastHashBuilder.hash_one("production"),
        );
    }
}
