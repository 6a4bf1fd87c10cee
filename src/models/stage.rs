//! Lifecycle stage of a file within its dataset.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Where a file sits in its dataset's lifecycle.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    Raw,
    Staged,
    Processed,
    Published,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown stage `{0}` (expected raw, staged, processed or published)")]
pub struct UnknownStage(pub String);

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Raw,
        Stage::Staged,
        Stage::Processed,
        Stage::Published,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Raw => "raw",
            Stage::Staged => "staged",
            Stage::Processed => "processed",
            Stage::Published => "published",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Processed".parse::<Stage>(), Ok(Stage::Processed));
        assert_eq!(" raw ".parse::<Stage>(), Ok(Stage::Raw));
        assert!("archived".parse::<Stage>().is_err());
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&Stage::Published).unwrap();
        assert_eq!(json, "\"published\"");
    }
}
