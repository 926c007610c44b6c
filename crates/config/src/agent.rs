use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Agent {
    /// Identity this agent reports its samples under. A fresh random id is
    /// generated at startup when unset, so a restarted agent shows up as a
    /// new writer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writer_id: Option<String>,

    /// How long the agent waits for background loops to wind down on
    /// shutdown. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub shutdown_grace: Duration,
}

impl Default for Agent {
    fn default() -> Self {
        Self {
            writer_id: None,
            shutdown_grace: Duration::from_millis(500),
        }
    }
}
