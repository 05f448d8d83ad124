//! Half-open key ranges and the absent-range set.
//!
//! A scan that observes a gap between keys records the gap as a half-open
//! interval `[start, end)`; at commit every recorded interval is re-checked
//! to still contain no keys, which is how phantoms are caught when the
//! low-level leaf-version protocol is not in use.

use std::fmt;

/// A half-open key interval `[start, end)`. `end == None` means +∞.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Option<Vec<u8>>,
}

impl KeyRange {
    #[must_use]
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: Some(end.into()),
        }
    }

    /// `[start, +∞)`.
    #[must_use]
    pub fn unbounded(start: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: None,
        }
    }

    /// The interval containing exactly `key`: `[key, succ(key))`.
    #[must_use]
    pub fn point(key: &[u8]) -> Self {
        Self {
            start: key.to_vec(),
            end: Some(key_successor(key)),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match &self.end {
            Some(end) => self.start >= *end,
            None => false,
        }
    }

    /// Whether `self` fully contains `other`.
    #[must_use]
    pub fn contains(&self, other: &KeyRange) -> bool {
        if self.start > other.start {
            return false;
        }
        match (&self.end, &other.end) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) => b <= a,
        }
    }

    #[must_use]
    pub fn key_in_range(&self, key: &[u8]) -> bool {
        *self.start <= *key
            && match &self.end {
                Some(end) => key < &end[..],
                None => true,
            }
    }

    /// Whether `self` and `other` overlap or touch (share an endpoint), i.e.
    /// their union is one interval.
    fn coalesces_with(&self, other: &KeyRange) -> bool {
        let self_reaches = match &self.end {
            None => true,
            Some(end) => *end >= other.start,
        };
        let other_reaches = match &other.end {
            None => true,
            Some(end) => *end >= self.start,
        };
        self_reaches && other_reaches
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, ", EscapedKey(&self.start))?;
        match &self.end {
            Some(end) => write!(f, "{})", EscapedKey(end)),
            None => f.write_str("+inf)"),
        }
    }
}

/// Prints printable ASCII verbatim and everything else as `\xNN`.
struct EscapedKey<'a>(&'a [u8]);

impl fmt::Display for EscapedKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0 {
            if (0x20..0x7f).contains(&b) {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

/// Smallest key strictly greater than `key` (one zero byte appended).
#[must_use]
pub fn key_successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

// ---------------------------------------------------------------------------
// AbsentRangeSet
// ---------------------------------------------------------------------------

/// Ordered set of non-overlapping absent ranges.
///
/// Kept sorted by `start`; insertion coalesces overlapping and adjacent
/// intervals, so the ranges are pairwise disjoint with gaps between them.
#[derive(Debug, Default, Clone)]
pub struct AbsentRangeSet {
    ranges: Vec<KeyRange>,
}

impl AbsentRangeSet {
    #[must_use]
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Record `range` as observed-absent, merging with anything it overlaps
    /// or touches.
    pub fn insert(&mut self, mut range: KeyRange) {
        if range.is_empty() {
            return;
        }
        // First existing range whose upper end can reach the new range: an
        // upper-bound search, since ends are monotone across the sorted,
        // disjoint set.
        let lo = self.ranges.partition_point(|r| match &r.end {
            Some(end) => *end < range.start,
            None => false,
        });
        let mut hi = lo;
        while hi < self.ranges.len() && range.coalesces_with(&self.ranges[hi]) {
            let r = &self.ranges[hi];
            if r.start < range.start {
                range.start = r.start.clone();
            }
            range.end = match (range.end.take(), &r.end) {
                (Some(a), Some(b)) => Some(if *b > a { b.clone() } else { a }),
                _ => None,
            };
            hi += 1;
        }
        self.ranges.splice(lo..hi, [range]);
        debug_assert!(self.is_valid());
    }

    /// Whether `key` is covered by a recorded range.
    #[must_use]
    pub fn contains_key(&self, key: &[u8]) -> bool {
        let i = self.ranges.partition_point(|r| match &r.end {
            Some(end) => &end[..] <= key,
            None => false,
        });
        self.ranges.get(i).is_some_and(|r| r.key_in_range(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyRange> {
        self.ranges.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Structural invariant: sorted, non-empty, pairwise disjoint with
    /// strict gaps (adjacent ranges would have been coalesced).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.ranges.windows(2).all(|w| match &w[0].end {
            Some(end) => *end < w[1].start,
            None => false,
        }) && self.ranges.iter().all(|r| !r.is_empty())
    }
}

impl fmt::Display for AbsentRangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{r}")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(a: &str, b: &str) -> KeyRange {
        KeyRange::new(a.as_bytes().to_vec(), b.as_bytes().to_vec())
    }

    #[test]
    fn emptiness_and_membership() {
        assert!(r("b", "b").is_empty());
        assert!(r("c", "a").is_empty());
        assert!(!r("a", "b").is_empty());
        assert!(!KeyRange::unbounded(b"a".to_vec()).is_empty());

        let range = r("b", "d");
        assert!(range.key_in_range(b"b"));
        assert!(range.key_in_range(b"c"));
        assert!(!range.key_in_range(b"d"));
        assert!(!range.key_in_range(b"a"));

        let open = KeyRange::unbounded(b"m".to_vec());
        assert!(open.key_in_range(b"zzzz"));
        assert!(!open.key_in_range(b"a"));
    }

    #[test]
    fn containment() {
        assert!(r("a", "z").contains(&r("b", "c")));
        assert!(!r("b", "c").contains(&r("a", "z")));
        assert!(KeyRange::unbounded(b"a".to_vec()).contains(&r("b", "c")));
        assert!(!r("a", "z").contains(&KeyRange::unbounded(b"b".to_vec())));
        assert!(r("a", "c").contains(&r("a", "c")));
    }

    #[test]
    fn point_range_covers_only_its_key() {
        let p = KeyRange::point(b"k");
        assert!(p.key_in_range(b"k"));
        assert!(!p.key_in_range(b"k\x01"));
        assert!(!p.key_in_range(b"j"));
        assert!(p.key_in_range(b"k\x00"), "successor bound is exclusive");
    }

    #[test]
    fn insert_keeps_sorted_disjoint() {
        let mut set = AbsentRangeSet::new();
        set.insert(r("m", "p"));
        set.insert(r("a", "c"));
        set.insert(r("e", "g"));
        assert_eq!(set.len(), 3);
        assert!(set.is_valid());
        assert!(set.contains_key(b"f"));
        assert!(!set.contains_key(b"d"));
    }

    #[test]
    fn insert_coalesces_overlap_and_adjacency() {
        let mut set = AbsentRangeSet::new();
        set.insert(r("a", "c"));
        set.insert(r("e", "g"));
        // Bridges both, overlapping the first and touching the second.
        set.insert(r("b", "e"));
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().next().unwrap(), &r("a", "g"));
    }

    #[test]
    fn insert_unbounded_swallows_tail() {
        let mut set = AbsentRangeSet::new();
        set.insert(r("a", "c"));
        set.insert(r("m", "p"));
        set.insert(KeyRange::unbounded(b"k".to_vec()));
        assert_eq!(set.len(), 2);
        assert!(set.contains_key(b"zzz"));
        assert!(!set.contains_key(b"d"));
        assert!(set.is_valid());
    }

    #[test]
    fn display_forms() {
        let mut set = AbsentRangeSet::new();
        set.insert(r("a", "c"));
        set.insert(KeyRange::unbounded(b"x".to_vec()));
        assert_eq!(format!("{set}"), "{[a, c), [x, +inf)}");
    }

    proptest::proptest! {
        /// After arbitrary insertions the set stays sorted, disjoint, and
        /// agrees with a naive membership oracle.
        #[test]
        fn prop_set_invariants(
            ranges in proptest::collection::vec(("[a-f]{1,3}", "[a-f]{1,3}"), 0..24),
            probe in "[a-f]{1,3}",
        ) {
            let mut set = AbsentRangeSet::new();
            let mut kept = Vec::new();
            for (a, b) in &ranges {
                let (a, b) = if a <= b { (a, b) } else { (b, a) };
                let range = KeyRange::new(a.as_bytes().to_vec(), b.as_bytes().to_vec());
                if !range.is_empty() {
                    kept.push(range.clone());
                }
                set.insert(range);
            }
            proptest::prop_assert!(set.is_valid());

            let oracle = kept.iter().any(|r| r.key_in_range(probe.as_bytes()));
            proptest::prop_assert_eq!(set.contains_key(probe.as_bytes()), oracle);
        }
    }
}
