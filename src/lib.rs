//! Dataset journal: a registry of domain-scoped datasets whose files live in
//! object storage.
//!
//! Files are inspected locally (hash, size, sniffed MIME type), registered in
//! a relational registry under uniqueness constraints, and stored at a URI
//! derived from their attributes. Registered files can be queried, exported
//! and downloaded again.

pub mod config;
pub mod errors;
pub mod models;
pub mod services;
