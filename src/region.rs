//! Key ranges and maps keyed by disjoint ranges.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A half-open interval over the binary key space.
///
/// `[start, end)`; an absent `end` extends the range to the end of the key
/// space. Ranges are never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    start: Bytes,
    end: Option<Bytes>,
}

impl KeyRange {
    /// A range covering `[start, end)`.
    ///
    /// # Panics
    ///
    /// Panics if the range would be empty.
    pub fn bounded(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        let (start, end) = (start.into(), end.into());
        assert!(start < end, "empty key range");
        Self {
            start,
            end: Some(end),
        }
    }

    /// A range from `start` to the end of the key space.
    pub fn open_ended(start: impl Into<Bytes>) -> Self {
        Self {
            start: start.into(),
            end: None,
        }
    }

    /// The range covering every key.
    pub fn universe() -> Self {
        Self::open_ended(Bytes::new())
    }

    pub fn start(&self) -> &[u8] {
        &self.start
    }

    /// Exclusive upper bound, `None` when unbounded.
    pub fn end(&self) -> Option<&[u8]> {
        self.end.as_deref()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= &self.start[..] && self.end.as_ref().map_or(true, |end| key < &end[..])
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        let (first, second) = if self.start <= other.start {
            (self, other)
        } else {
            (other, self)
        };
        match &first.end {
            None => true,
            Some(end) => &second.start < end,
        }
    }
}

// Ordered by start; among equal starts an unbounded end sorts last. Range
// maps rely on this to find the candidate range for a key with one
// predecessor probe.
impl Ord for KeyRange {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| match (&self.end, &other.end) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for KeyRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The inserted range overlaps one already in the map.
#[derive(Debug, thiserror::Error)]
#[error("key range {0:?} overlaps an existing range")]
pub struct RangeOverlap(pub KeyRange);

/// A mapping from disjoint key ranges to values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMap<T> {
    ranges: BTreeMap<KeyRange, T>,
}

impl<T> Default for RegionMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RegionMap<T> {
    pub fn new() -> Self {
        Self {
            ranges: BTreeMap::new(),
        }
    }

    /// Inserts a range, rejecting it if it overlaps an existing one.
    pub fn insert(&mut self, range: KeyRange, value: T) -> Result<(), RangeOverlap> {
        if let Some((prev, _)) = self.ranges.range(..&range).next_back() {
            if prev.overlaps(&range) {
                return Err(RangeOverlap(range));
            }
        }
        if let Some((next, _)) = self.ranges.range(&range..).next() {
            if next.overlaps(&range) {
                return Err(RangeOverlap(range));
            }
        }
        self.ranges.insert(range, value);
        Ok(())
    }

    /// The value of the range containing `key`, if any.
    pub fn lookup(&self, key: &[u8]) -> Option<&T> {
        let probe = KeyRange::open_ended(Bytes::copy_from_slice(key));
        let (range, value) = self.ranges.range(..=&probe).next_back()?;
        range.contains(key).then_some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KeyRange, &T)> {
        self.ranges.iter()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl<T> FromIterator<(KeyRange, T)> for RegionMap<T> {
    /// # Panics
    ///
    /// Panics on overlapping ranges.
    fn from_iter<I: IntoIterator<Item = (KeyRange, T)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (range, value) in iter {
            map.insert(range, value).expect("overlapping key ranges");
        }
        map
    }
}
