//! An embedded, in-memory ordered key/value table with TTL-bounded slab-allocated
//! skiplist indexing and simple segment-file persistence.
//!
//! ```no_run
//! use slabtable::{Table, TableOptions};
//!
//! let mut opts = TableOptions::new();
//! opts.create_if_missing = true;
//!
//! let mut table = Table::with_options("/tmp/example-table", opts);
//! table.open()?;
//! table.put(b"key", b"value")?;
//! assert_eq!(table.get(b"key")?, b"value");
//! table.close()?;
//! # Ok::<(), slabtable::Error>(())
//! ```
//!
//! See [`Table`] for the full operation set and its threading contract.

mod error;
mod options;
mod segment;
mod table;

pub use error::{Error, Result};
pub use options::TableOptions;
pub use table::Table;

pub use slabtable_skiplist::{Comparator, DefaultComparator};
