//! Placement group identifiers

use crate::hobject::{HObject, SNAP_HEAD};
use serde::Serialize;
use std::fmt;

/// Striped placement group ID (corresponds to spg_t in Ceph)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SpgId {
    pub pool: i64,
    pub seed: u32,
    /// OSD shard ID (-1 for replicated pools)
    pub shard: i8,
}

/// Number of bits needed to represent `n` (pg_pool_t::calc_bits_of)
fn calc_bits_of(n: u32) -> u32 {
    u32::BITS - n.leading_zeros()
}

/// ceph_stable_mod(): map a placement hash onto `b` buckets without
/// reshuffling existing buckets when `b` grows.
pub fn ceph_stable_mod(x: u32, b: u32, bmask: u32) -> u32 {
    if (x & bmask) < b {
        x & bmask
    } else {
        x & (bmask >> 1)
    }
}

impl SpgId {
    pub const NO_SHARD: i8 = -1;

    pub fn new(pool: i64, seed: u32, shard: i8) -> Self {
        Self { pool, seed, shard }
    }

    /// Create from a pg_t (for replicated pools)
    pub fn from_pg(pool: i64, seed: u32) -> Self {
        Self::new(pool, seed, Self::NO_SHARD)
    }

    /// The PG of `pool` that an object with placement hash `hash` maps to
    pub fn for_hash(pool: i64, hash: u32, pg_num: u32) -> Self {
        assert!(pg_num > 0, "pg_num must be positive");
        let mask = (1u64 << calc_bits_of(pg_num - 1)) - 1;
        Self::from_pg(pool, ceph_stable_mod(hash, pg_num, mask as u32))
    }

    /// Number of hash bits that identify this PG given the pool's `pg_num`
    ///
    /// Reference: ~/dev/ceph/src/osd/osd_types.cc pg_t::get_split_bits()
    pub fn split_bits(&self, pg_num: u32) -> u32 {
        assert!(pg_num > 0, "pg_num must be positive");
        if pg_num == 1 {
            return 0;
        }
        // unique p such that pg_num is in [2^(p-1), 2^p)
        let p = calc_bits_of(pg_num);
        let half = 1u32 << (p - 1);
        if self.seed % half < pg_num % half {
            p
        } else {
            p - 1
        }
    }

    /// First hobject belonging to this PG
    pub fn hobj_start(&self) -> HObject {
        HObject::boundary(self.pool, self.seed.reverse_bits(), 0)
    }

    /// First hobject past the end of this PG
    ///
    /// Reference: ~/dev/ceph/src/osd/osd_types.cc pg_t::get_hobj_end()
    pub fn hobj_end(&self, pg_num: u32) -> HObject {
        let bits = self.split_bits(pg_num);
        let rev_start = u64::from(self.seed.reverse_bits());
        let rev_end = (rev_start | u64::from(u32::MAX >> bits)) + 1;
        if rev_end >= 1 << 32 {
            HObject::max()
        } else {
            HObject::boundary(self.pool, rev_end as u32, SNAP_HEAD)
        }
    }
}

impl fmt::Display for SpgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:x}", self.pool, self.seed)?;
        if self.shard != Self::NO_SHARD {
            write!(f, "s{}", self.shard)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(SpgId::from_pg(1, 0x2).to_string(), "1.2");
        assert_eq!(SpgId::from_pg(3, 0x1f).to_string(), "3.1f");
        assert_eq!(SpgId::new(3, 0x1f, 2).to_string(), "3.1fs2");
    }

    #[test]
    fn test_split_bits() {
        // power of two: every PG uses log2(pg_num) bits
        for seed in 0..8 {
            assert_eq!(SpgId::from_pg(1, seed).split_bits(8), 3);
        }
        // pg_num = 6: seeds 0, 1, 4, 5 have split, 2 and 3 have not
        let bits: Vec<u32> = (0..6).map(|s| SpgId::from_pg(1, s).split_bits(6)).collect();
        assert_eq!(bits, vec![3, 3, 2, 2, 3, 3]);
        assert_eq!(SpgId::from_pg(1, 0).split_bits(1), 0);
    }

    #[test]
    fn test_single_pg_covers_whole_pool() {
        let pg = SpgId::from_pg(4, 0);
        assert_eq!(pg.hobj_end(1), HObject::max());
        assert!(pg.hobj_start() <= HObject::new(4, "a", 0));
    }

    #[test]
    fn test_every_object_lands_in_exactly_its_pg_range() {
        for pg_num in [1u32, 2, 6, 8, 12] {
            for hash in [0u32, 1, 2, 3, 5, 6, 7, 0x8000_0001, 0xdead_beef, u32::MAX] {
                let obj = HObject::new(2, "obj", hash);
                let owner = SpgId::for_hash(2, hash, pg_num);
                let containing: Vec<u32> = (0..pg_num)
                    .filter(|seed| {
                        let pg = SpgId::from_pg(2, *seed);
                        pg.hobj_start() <= obj && obj < pg.hobj_end(pg_num)
                    })
                    .collect();
                assert_eq!(
                    containing,
                    vec![owner.seed],
                    "hash {:#x} with pg_num {}",
                    hash,
                    pg_num
                );
            }
        }
    }
}
