use serde::{Deserialize, Serialize};

/// Closed byte range `[low, high]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Interval {
    pub low: u64,
    pub high: u64,
}

impl Interval {
    pub fn new(low: u64, high: u64) -> Self {
        debug_assert!(low <= high, "interval low {low} > high {high}");
        Self { low, high }
    }

    /// `len` bytes starting at `low`; `None` for an empty range.
    pub fn with_len(low: u64, len: u64) -> Option<Self> {
        if len == 0 {
            return None;
        }
        Some(Self {
            low,
            high: low.checked_add(len - 1)?,
        })
    }

    /// Half-open `[low, high_exclusive)`; `None` when empty.
    pub fn from_exclusive(low: u64, high_exclusive: u64) -> Option<Self> {
        if high_exclusive <= low {
            return None;
        }
        Some(Self {
            low,
            high: high_exclusive - 1,
        })
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.high - self.low + 1
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.low <= offset && offset <= self.high
    }

    pub fn covers(&self, other: &Interval) -> bool {
        self.low <= other.low && other.high <= self.high
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.low <= other.high && other.low <= self.high
    }

    pub fn intersect(&self, other: &Interval) -> Option<Interval> {
        if !self.overlaps(other) {
            return None;
        }
        Some(Interval {
            low: self.low.max(other.low),
            high: self.high.min(other.high),
        })
    }

    pub fn high_exclusive(&self) -> u64 {
        self.high.saturating_add(1)
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

/// Sorted set of disjoint, non-adjacent intervals. Adjacent or overlapping
/// inserts are merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Interval>", into = "Vec<Interval>")]
pub struct IntervalSet {
    ranges: Vec<Interval>,
}

impl From<Vec<Interval>> for IntervalSet {
    fn from(value: Vec<Interval>) -> Self {
        let mut set = IntervalSet::new();
        for iv in value {
            if iv.low <= iv.high {
                set.add(iv);
            }
        }
        set
    }
}

impl From<IntervalSet> for Vec<Interval> {
    fn from(value: IntervalSet) -> Self {
        value.ranges
    }
}

impl FromIterator<Interval> for IntervalSet {
    fn from_iter<T: IntoIterator<Item = Interval>>(iter: T) -> Self {
        let mut set = IntervalSet::new();
        for iv in iter {
            set.add(iv);
        }
        set
    }
}

impl IntervalSet {
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Whole file `[0, size)`; empty when `size == 0`.
    pub fn full(size: u64) -> Self {
        let mut set = Self::new();
        if let Some(iv) = Interval::from_exclusive(0, size) {
            set.ranges.push(iv);
        }
        set
    }

    pub fn single(iv: Interval) -> Self {
        Self { ranges: vec![iv] }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint intervals.
    pub fn count(&self) -> usize {
        self.ranges.len()
    }

    /// Total bytes covered.
    pub fn size(&self) -> u64 {
        self.ranges.iter().map(Interval::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interval> {
        self.ranges.iter()
    }

    pub fn as_slice(&self) -> &[Interval] {
        &self.ranges
    }

    pub fn first(&self) -> Option<Interval> {
        self.ranges.first().copied()
    }

    pub fn last(&self) -> Option<Interval> {
        self.ranges.last().copied()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn add(&mut self, iv: Interval) {
        let mut low = iv.low;
        let mut high = iv.high;
        let start = self
            .ranges
            .partition_point(|r| r.high.saturating_add(1) < low);
        let mut end = start;
        while end < self.ranges.len() && self.ranges[end].low <= high.saturating_add(1) {
            low = low.min(self.ranges[end].low);
            high = high.max(self.ranges[end].high);
            end += 1;
        }
        self.ranges
            .splice(start..end, std::iter::once(Interval { low, high }));
    }

    pub fn add_all(&mut self, other: &IntervalSet) {
        for iv in &other.ranges {
            self.add(*iv);
        }
    }

    pub fn remove(&mut self, iv: Interval) {
        let start = self.ranges.partition_point(|r| r.high < iv.low);
        let mut end = start;
        let mut keep = Vec::with_capacity(2);
        while end < self.ranges.len() && self.ranges[end].low <= iv.high {
            let r = self.ranges[end];
            if r.low < iv.low {
                keep.push(Interval::new(r.low, iv.low - 1));
            }
            if r.high > iv.high {
                keep.push(Interval::new(iv.high + 1, r.high));
            }
            end += 1;
        }
        self.ranges.splice(start..end, keep);
    }

    pub fn remove_all(&mut self, other: &IntervalSet) {
        for iv in &other.ranges {
            self.remove(*iv);
        }
    }

    /// True when every byte of `iv` is in the set.
    pub fn contains(&self, iv: &Interval) -> bool {
        let idx = self.ranges.partition_point(|r| r.high < iv.low);
        self.ranges.get(idx).is_some_and(|r| r.covers(iv))
    }

    pub fn contains_offset(&self, offset: u64) -> bool {
        let idx = self.ranges.partition_point(|r| r.high < offset);
        self.ranges.get(idx).is_some_and(|r| r.low <= offset)
    }

    /// True when any byte of `iv` is in the set.
    pub fn overlaps(&self, iv: &Interval) -> bool {
        let idx = self.ranges.partition_point(|r| r.high < iv.low);
        self.ranges.get(idx).is_some_and(|r| r.low <= iv.high)
    }

    pub fn overlaps_set(&self, other: &IntervalSet) -> bool {
        other.ranges.iter().any(|iv| self.overlaps(iv))
    }

    pub fn intersect_interval(&self, iv: &Interval) -> IntervalSet {
        let start = self.ranges.partition_point(|r| r.high < iv.low);
        let ranges = self.ranges[start..]
            .iter()
            .take_while(|r| r.low <= iv.high)
            .filter_map(|r| r.intersect(iv))
            .collect();
        IntervalSet { ranges }
    }

    pub fn intersect(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = IntervalSet::new();
        for iv in &other.ranges {
            for hit in self.intersect_interval(iv).ranges {
                out.ranges.push(hit);
            }
        }
        // Hits from distinct inputs may touch; re-merge.
        out.ranges.iter().copied().collect()
    }

    /// Complement of the set within `[0, size)`.
    pub fn invert(&self, size: u64) -> IntervalSet {
        let mut out = IntervalSet::new();
        let mut next = 0u64;
        for r in &self.ranges {
            if r.low >= size {
                break;
            }
            if r.low > next {
                out.ranges.push(Interval::new(next, r.low - 1));
            }
            next = r.high.saturating_add(1);
        }
        if next < size {
            out.ranges.push(Interval::new(next, size - 1));
        }
        out
    }

    /// First range of `[0, size)` not covered by the set.
    pub fn first_gap(&self, size: u64) -> Option<Interval> {
        self.invert(size).first()
    }

    /// Last range of `[0, size)` not covered by the set.
    pub fn last_gap(&self, size: u64) -> Option<Interval> {
        self.invert(size).last()
    }

    /// Length of the run starting at offset 0.
    pub fn leading_len(&self) -> u64 {
        match self.ranges.first() {
            Some(r) if r.low == 0 => r.len(),
            _ => 0,
        }
    }
}

impl std::fmt::Display for IntervalSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[")?;
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{r}")?;
        }
        f.write_str("]")
    }
}
