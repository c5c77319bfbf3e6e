//! Portable JSON export of the watchlist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vigil_core::Person;

pub const EXPORT_VERSION: &str = "1.0";

/// `{ "persons": [...], "timestamp": ..., "version": "1.0" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistExport {
    pub persons: Vec<Person>,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl WatchlistExport {
    pub fn new(persons: Vec<Person>) -> Self {
        Self {
            persons,
            timestamp: Utc::now(),
            version: EXPORT_VERSION.to_string(),
        }
    }

    /// Exports with the same major version are readable.
    pub fn is_supported(&self) -> bool {
        major(&self.version) == major(EXPORT_VERSION)
    }

    /// Suggested download file name, e.g. `watchlist_export_2026-10-17.json`.
    pub fn file_name(&self) -> String {
        format!("watchlist_export_{}.json", self.timestamp.format("%Y-%m-%d"))
    }
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let mut export = WatchlistExport::new(Vec::new());
        assert!(export.is_supported());
        export.version = "1.3".into();
        assert!(export.is_supported());
        export.version = "2.0".into();
        assert!(!export.is_supported());
    }

    #[test]
    fn test_document_shape() {
        let export = WatchlistExport::new(Vec::new());
        let json = serde_json::to_value(&export).unwrap();
        assert!(json["persons"].as_array().unwrap().is_empty());
        assert_eq!(json["version"], "1.0");
        assert!(json["timestamp"].is_string());
        assert!(export.file_name().starts_with("watchlist_export_"));
    }
}
