use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Gateway {
    /// Whether collected samples leave the agent at all.
    pub enabled: bool,

    /// Base URL of the collector endpoint. Request paths are appended to it.
    pub url: String,
}

impl Default for Gateway {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "http://127.0.0.1:30000".to_string(),
        }
    }
}
