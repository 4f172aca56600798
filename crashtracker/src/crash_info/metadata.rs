// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

pub const DEFAULT_LIBRARY_NAME: &str = "crashtracker";

/// Identifies what crashed. Serialized once at `start()`; the crash handler writes the
/// resulting bytes verbatim as the `metadata` part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    pub library_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<OsInfo>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            service: None,
            version: None,
            runtime: None,
            runtime_version: None,
            library_name: DEFAULT_LIBRARY_NAME.to_owned(),
            library_version: None,
            os: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    pub architecture: String,
    pub bitness: String,
    pub os_type: String,
    pub version: String,
}

impl OsInfo {
    pub fn current() -> Self {
        os_info::get().into()
    }
}

impl From<os_info::Info> for OsInfo {
    fn from(value: os_info::Info) -> Self {
        Self {
            architecture: value.architecture().unwrap_or("unknown").to_string(),
            bitness: value.bitness().to_string(),
            os_type: value.os_type().to_string(),
            version: value.version().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_fields_are_omitted() {
        let metadata = Metadata {
            service: Some("my_favorite_service".to_owned()),
            ..Default::default()
        };
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "service": "my_favorite_service",
                "library_name": "crashtracker",
            })
        );
        let back: Metadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, metadata);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_os_info_current() {
        let os = OsInfo::current();
        assert!(!os.os_type.is_empty());
        assert!(!os.version.is_empty());
    }
}
