//! Represents a dataset: a named, domain-scoped collection of files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Domain used when the caller does not pick one.
pub const DEFAULT_DOMAIN: &str = "global";

/// A dataset registered in the journal.
///
/// `(domain, name)` is unique. A dataset exclusively owns its files: deleting
/// it removes every file record (and their tag links) with it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Dataset {
    /// Registry-assigned identifier.
    pub id: i64,

    /// Namespace under which `name` must be unique.
    pub domain: String,

    /// Dataset name, unique within `domain`.
    pub name: String,

    /// Optional free-text description, only set at creation.
    pub description: Option<String>,

    /// When this dataset was first registered.
    pub created_at: DateTime<Utc>,
}

/// A dataset annotated with the number of files it currently owns.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DatasetSummary {
    #[serde(flatten)]
    pub dataset: Dataset,

    pub total_files: i64,
}

/// Normalize a domain name: lowercase ASCII letters and digits only.
///
/// An input that normalizes to nothing falls back to [`DEFAULT_DOMAIN`].
pub fn normalize_domain(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if cleaned.is_empty() {
        DEFAULT_DOMAIN.to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_is_lowercased_and_stripped() {
        assert_eq!(normalize_domain("Computer-Vision_2"), "computervision2");
        assert_eq!(normalize_domain("  "), DEFAULT_DOMAIN);
    }
}
