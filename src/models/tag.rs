//! Represents a free-form label attached to files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tag. Names are stored normalized (trimmed, lowercase) and are unique.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Canonical form of a tag name: surrounding whitespace removed, lowercased.
pub fn normalize_tag_name(raw: &str) -> String {
    raw.trim().to_lowercase()
}
