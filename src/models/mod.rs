//! Core data models of the dataset journal.
//!
//! These are plain values: relationships are expressed as foreign-key ids and
//! resolved through explicit registry queries rather than object graphs.

pub mod dataset;
pub mod file;
pub mod stage;
pub mod tag;

pub use dataset::{DEFAULT_DOMAIN, Dataset, DatasetSummary, normalize_domain};
pub use file::{FileRecord, NewFile, PendingFile};
pub use stage::Stage;
pub use tag::{Tag, normalize_tag_name};
