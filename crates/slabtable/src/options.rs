use slabtable_skiplist::{Comparator, DefaultComparator};

/// Configuration controlling how a [`crate::Table`] opens, persists, and bounds reads.
///
/// `TableOptions` does not borrow or own a comparator directly; `C` is the comparator
/// type the table is parameterized over, defaulting to [`DefaultComparator`].
#[derive(Debug, Clone)]
pub struct TableOptions<C = DefaultComparator> {
    /// Key ordering used by the index. Defaults to lexicographic order with length as
    /// a tie-breaker.
    pub comparator:        C,
    /// Create the table's directory on `open` if it does not already exist.
    pub create_if_missing: bool,
    /// Fail `open` if the table's directory already exists.
    pub error_if_exists:   bool,
    /// Dump the index to segment files automatically during `close`.
    pub dump_when_close:   bool,
    /// Slab quarantine duration in milliseconds; also the upper bound a caller must
    /// honor on the wall-clock duration of any single `get`.
    pub read_ttl_msec:     u64,
    /// Segment rollover threshold in bytes; also the maximum on-disk size of a single
    /// entry (anything larger is rejected by `put`).
    pub max_file_size:     u64,
}

impl TableOptions<DefaultComparator> {
    /// Options with the default comparator and every other field at its documented
    /// default.
    #[must_use]
    pub fn new() -> Self {
        Self::with_comparator(DefaultComparator)
    }
}

impl Default for TableOptions<DefaultComparator> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Comparator> TableOptions<C> {
    /// Options using `comparator` for key ordering, with every other field at its
    /// documented default.
    #[must_use]
    pub fn with_comparator(comparator: C) -> Self {
        Self {
            comparator,
            create_if_missing: false,
            error_if_exists:   false,
            dump_when_close:   true,
            read_ttl_msec:     2_000,
            max_file_size:     1024 * 1024 * 1024,
        }
    }
}
