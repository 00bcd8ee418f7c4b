//! External sort-merge shuffle.
//!
//! A run buffers records in memory and spills them to numbered part files
//! once a byte or record threshold is crossed. After switching to reading,
//! the run is consumed exactly once:
//!
//! - [`RunMerger`] returns values in insertion order.
//! - [`KeyedSortedRunMerger`] sorts every spill by a key comparator and
//!   k-way merges the parts, yielding values grouped by key in ascending
//!   comparator order.
//!
//! ```no_run
//! use std::sync::Arc;
//! use flowcomm_shuffle::{KeyedSortedRunMerger, SerdeKeyCodec, ShuffleConfig, natural_order};
//!
//! # fn main() -> flowcomm_shuffle::Result<()> {
//! let mut run = KeyedSortedRunMerger::<u64>::new(
//!     "/tmp", "edge-3", ShuffleConfig::default(), natural_order(), Arc::new(SerdeKeyCodec),
//! );
//! run.add(42, b"value".to_vec())?;
//! run.run()?;
//! run.switch_to_reading()?;
//! let mut groups = run.read_iterator()?;
//! while let Some((key, values)) = groups.next_group()? {
//!     for v in values {
//!         println!("{key}: {} bytes", v?.len());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod merger;
pub mod part;
pub mod sorted;

pub use codec::{KeyCodec, SerdeKeyCodec};
pub use config::ShuffleConfig;
pub use error::{Result, ShuffleError};
pub use merger::{RunMerger, RunState, RunValues};
pub use part::PartFile;
pub use sorted::{GroupValues, KeyComparator, KeyedSortedRunMerger, SortedGroups, natural_order};
