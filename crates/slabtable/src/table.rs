use std::path::{Path, PathBuf};

use slabtable_skiplist::{Comparator, DefaultComparator, SkipList};
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::options::TableOptions;
use crate::segment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
}

/// An embedded, in-memory ordered key/value table with segment-file persistence.
///
/// All live entries sit in an in-process index ([`SkipList`]); `dump` (or `close`
/// with `dump_when_close`) serializes them to segment files in the table's directory,
/// and `open` reconstructs the index from whatever segments are already there.
///
/// Mutating methods (`put`, `del`, `dump`, `open`, `close`) require external
/// serialization to a single caller at a time. `get` may run concurrently with at
/// most one in-flight mutation and with other `get` calls, provided every individual
/// call completes within `read_ttl_msec` milliseconds — see [`SkipList`]'s own
/// documentation for why that bound exists.
pub struct Table<C = DefaultComparator> {
    path:  PathBuf,
    opts:  TableOptions<C>,
    index: Option<SkipList<C>>,
    state: State,
}

impl Table<DefaultComparator> {
    /// Create a table at `path` using the default comparator and options.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_options(path, TableOptions::new())
    }
}

impl<C: Comparator + Clone> Table<C> {
    /// Create a table at `path` with explicit `opts`.
    #[must_use]
    pub fn with_options(path: impl Into<PathBuf>, opts: TableOptions<C>) -> Self {
        Self { path: path.into(), opts, index: None, state: State::Closed }
    }

    /// The directory this table reads from and writes to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    fn require_open(&self) -> Result<&SkipList<C>> {
        match (&self.state, &self.index) {
            (State::Open, Some(index)) => Ok(index),
            _ => Err(Error::invalid("table is not open")),
        }
    }

    /// Open the table: create (or refuse to create) the directory per
    /// `create_if_missing`/`error_if_exists`, then load every segment file found into
    /// the in-memory index.
    ///
    /// Fails with [`Error::InvalidOperation`] if already open. On any load failure the
    /// table is left closed.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn open(&mut self) -> Result<()> {
        if self.state == State::Open {
            return Err(Error::invalid("table is already open"));
        }

        let index = SkipList::new(self.opts.comparator.clone(), self.opts.read_ttl_msec);
        segment::load(&self.path, &self.opts, &index)?;

        info!(entries = index.len(), "table opened");
        self.index = Some(index);
        self.state = State::Open;
        Ok(())
    }

    /// Close the table. If `dump_when_close` is set, dumps the index to segment files
    /// first; a dump failure propagates and the table remains open.
    ///
    /// Fails with [`Error::InvalidOperation`] if already closed.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn close(&mut self) -> Result<()> {
        if self.state == State::Closed {
            return Err(Error::invalid("table is already closed"));
        }

        if self.opts.dump_when_close {
            self.dump()?;
        }

        self.index = None;
        self.state = State::Closed;
        debug!("table closed");
        Ok(())
    }

    /// Serialize the in-memory index out to segment files, replacing whatever this
    /// directory previously held.
    ///
    /// Requires the table to be open.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn dump(&self) -> Result<()> {
        let index = self.require_open()?;
        segment::dump(&self.path, &self.opts, index)?;
        debug!(entries = index.len(), "table dumped");
        Ok(())
    }

    /// Insert or replace the value stored for `key`.
    ///
    /// Requires the table to be open. Rejects with [`Error::InvalidOperation`] if the
    /// entry's on-disk record would exceed `max_file_size`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let index = self.require_open()?;

        let record_size = segment::entry_size(key, value);
        if record_size > self.opts.max_file_size {
            return Err(Error::invalid(format!(
                "entry of {record_size} on-disk bytes exceeds max_file_size ({})",
                self.opts.max_file_size
            )));
        }

        if !index.insert(key, value) {
            index.update(key, value);
        }
        Ok(())
    }

    /// Look up `key`, copying its value into a freshly allocated `Vec<u8>`.
    ///
    /// Requires the table to be open. Returns [`Error::NotFound`] if `key` is absent.
    ///
    /// A borrowed variant is intentionally not exposed: the index's [`SkipList`] ties
    /// borrowed slices to the TTL quarantine window described on its own `lookup`, and
    /// this façade copies bytes at the API boundary instead of pushing that contract
    /// onto callers.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let index = self.require_open()?;
        index.lookup(key).map(|(_, v)| v.to_vec()).ok_or(Error::NotFound)
    }

    /// Remove `key`.
    ///
    /// Requires the table to be open. Returns [`Error::NotFound`] if `key` is absent.
    pub fn del(&self, key: &[u8]) -> Result<()> {
        let index = self.require_open()?;
        if index.remove(key) {
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }

    /// Number of live entries in the in-memory index.
    ///
    /// Requires the table to be open.
    pub fn len(&self) -> Result<usize> {
        Ok(self.require_open()?.len())
    }

    /// Whether the in-memory index currently holds no entries.
    ///
    /// Requires the table to be open.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.require_open()?.is_empty())
    }

    /// Iterate over all live entries in ascending key order, copying each key and
    /// value into an owned pair.
    ///
    /// Requires the table to be open.
    pub fn iter(&self) -> Result<impl Iterator<Item = (Vec<u8>, Vec<u8>)> + '_> {
        let index = self.require_open()?;
        Ok(index.iter().map(|(k, v)| (k.to_vec(), v.to_vec())))
    }
}
