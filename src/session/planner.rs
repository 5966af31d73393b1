use std::collections::BTreeMap;
use std::ops::Range;
use thiserror::Error;

/// Every planned range starts on this boundary.
pub const BUFFER_ALIGNMENT: u64 = 16;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum PlanError {
    #[error("the aligned byte length of {0} bytes overflows")]
    Overflow(u64),
}

/// Packed layout of several named byte buffers in one device buffer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AlignedByteLength<K: Ord> {
    pub total: u64,
    pub ranges: BTreeMap<K, Range<u64>>,
}

impl<K: Ord> AlignedByteLength<K> {
    pub fn range(&self, key: &K) -> Option<&Range<u64>> {
        self.ranges.get(key)
    }
}

pub fn align_up(len: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    Some(len.checked_add(alignment - 1)? & !(alignment - 1))
}

/// Lays out `lengths` back to back in map order. Each range covers the
/// entry's length rounded up to [`BUFFER_ALIGNMENT`], so every range begins
/// aligned and the total is a multiple of the alignment.
pub fn plan<K: Ord + Clone>(lengths: &BTreeMap<K, u64>) -> Result<AlignedByteLength<K>, PlanError> {
    let mut total: u64 = 0;
    let mut ranges = BTreeMap::new();
    for (key, &len) in lengths {
        let aligned = align_up(len, BUFFER_ALIGNMENT).ok_or(PlanError::Overflow(len))?;
        let end = total.checked_add(aligned).ok_or(PlanError::Overflow(len))?;
        ranges.insert(key.clone(), total..end);
        total = end;
    }
    Ok(AlignedByteLength { total, ranges })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan() {
        let lengths = BTreeMap::from([("a".to_string(), 4), ("b".to_string(), 16), ("c".to_string(), 17)]);
        let plan = plan(&lengths).unwrap();
        assert_eq!(plan.total, 64);
        assert_eq!(plan.range(&"a".to_string()), Some(&(0..16)));
        assert_eq!(plan.range(&"b".to_string()), Some(&(16..32)));
        assert_eq!(plan.range(&"c".to_string()), Some(&(32..64)));
    }

    #[test]
    fn test_plan_empty() {
        let plan = plan::<u64>(&BTreeMap::new()).unwrap();
        assert_eq!(plan.total, 0);
        assert!(plan.ranges.is_empty());
    }

    #[test]
    fn test_plan_overflow() {
        let lengths = BTreeMap::from([(0u64, u64::MAX - 3)]);
        assert_eq!(plan(&lengths), Err(PlanError::Overflow(u64::MAX - 3)));

        let lengths = BTreeMap::from([(0u64, u64::MAX / 2), (1, u64::MAX / 2)]);
        assert_eq!(plan(&lengths), Err(PlanError::Overflow(u64::MAX / 2)));
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn plan_total_is_aligned_and_order_independent(lengths in prop::collection::vec(0u64..10_000, 0..16)) {
            let forward: BTreeMap<usize, u64> = lengths.iter().copied().enumerate().collect();
            let reversed: BTreeMap<usize, u64> = lengths.iter().rev().copied().enumerate().collect();
            let a = plan(&forward).unwrap();
            let b = plan(&reversed).unwrap();

            prop_assert_eq!(a.total, b.total);
            prop_assert_eq!(a.total % BUFFER_ALIGNMENT, 0);
            for (key, range) in &a.ranges {
                prop_assert_eq!(range.start % BUFFER_ALIGNMENT, 0);
                prop_assert!(range.end - range.start >= forward[key]);
                prop_assert!(range.end - range.start < forward[key] + BUFFER_ALIGNMENT);
            }
        }
    }
}
