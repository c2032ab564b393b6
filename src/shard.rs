//! Contiguous, balanced partitioning of a work list across parallel workers.

use std::ops::Range;

/// A contiguous `[start, end)` slice of the work list owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    /// Position of the shard in the plan; merge order follows it.
    pub index: usize,
    /// First item index (inclusive).
    pub start: usize,
    /// Last item index (exclusive).
    pub end: usize,
}

impl Shard {
    /// Number of items in the shard.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the shard covers no items.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Index range covered by the shard.
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Borrows the shard's items out of the full list.
    pub fn slice<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        &items[self.range()]
    }
}

/// Splits `total` items into at most `shard_count` contiguous shards whose sizes differ by at
/// most one. The first `total % shard_count` shards carry the extra item. Shards that would be
/// empty are omitted, so asking for more shards than items yields one shard per item.
pub fn plan(total: usize, shard_count: usize) -> Vec<Shard> {
    let shard_count = shard_count.max(1);
    let base = total / shard_count;
    let extra = total % shard_count;

    let mut shards = Vec::with_capacity(shard_count.min(total));
    let mut start = 0usize;
    for index in 0..shard_count {
        let len = base + usize::from(index < extra);
        if len == 0 {
            break;
        }
        shards.push(Shard {
            index,
            start,
            end: start + len,
        });
        start += len;
    }
    shards
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn assert_valid(total: usize, shards: &[Shard]) {
        let mut cursor = 0;
        for (position, shard) in shards.iter().enumerate() {
            assert_eq!(shard.index, position);
            assert_eq!(shard.start, cursor, "gap or overlap before shard {position}");
            assert!(!shard.is_empty());
            cursor = shard.end;
        }
        assert_eq!(cursor, total);

        if let (Some(max), Some(min)) = (
            shards.iter().map(Shard::len).max(),
            shards.iter().map(Shard::len).min(),
        ) {
            assert!(max - min <= 1, "unbalanced plan for {total}: {max} vs {min}");
        }
    }

    #[test]
    fn covers_every_index_exactly_once() {
        for total in 0..=120 {
            for count in 1..=13 {
                assert_valid(total, &plan(total, count));
            }
        }
    }

    #[test]
    fn splits_237_across_five_workers() {
        let sizes: Vec<usize> = plan(237, 5).iter().map(Shard::len).collect();
        assert_eq!(sizes, vec![48, 48, 47, 47, 47]);
    }

    #[test]
    fn omits_shards_past_the_end() {
        let shards = plan(3, 8);
        assert_eq!(shards.len(), 3);
        assert!(shards.iter().all(|shard| shard.len() == 1));
        assert!(plan(0, 4).is_empty());
    }

    #[test]
    fn zero_shard_count_is_one_shard() {
        assert_eq!(
            plan(10, 0),
            vec![Shard {
                index: 0,
                start: 0,
                end: 10
            }]
        );
    }

    #[test]
    fn slices_items() {
        let items: Vec<u32> = (0..10).collect();
        let shards = plan(items.len(), 3);
        assert_eq!(shards[1].slice(&items), &[4, 5, 6]);
    }
}
