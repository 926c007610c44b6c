#![forbid(unsafe_code)]

use crate::domain::VmId;
use serde::Serialize;

const UNKNOWN: &str = "unknown";

/// What the extractor could learn about a JVM process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmMetadata {
    pub java_version: String,
    pub java_home: String,
    /// For `java -jar foo.jar` this is the jar path.
    pub main_class: String,
    pub command_line: String,
    pub jvm_name: String,
    pub jvm_info: String,
    pub jvm_version: String,
    pub jvm_arguments: String,
    /// Milliseconds since the Unix epoch.
    pub start_time: u64,
    pub uid: Option<u32>,
    pub username: Option<String>,
}

impl Default for VmMetadata {
    fn default() -> Self {
        Self {
            java_version: UNKNOWN.into(),
            java_home: UNKNOWN.into(),
            main_class: UNKNOWN.into(),
            command_line: UNKNOWN.into(),
            jvm_name: UNKNOWN.into(),
            jvm_info: UNKNOWN.into(),
            jvm_version: UNKNOWN.into(),
            jvm_arguments: UNKNOWN.into(),
            start_time: 0,
            uid: None,
            username: None,
        }
    }
}

/// Record published when a VM starts and completed when it stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInfo {
    #[serde(rename = "agentId")]
    pub writer_id: String,
    #[serde(rename = "jvmId")]
    pub vm_id: VmId,
    #[serde(rename = "jvmPid")]
    pub pid: u32,
    #[serde(rename = "startTimeStamp")]
    pub start_time: u64,
    #[serde(rename = "stopTimeStamp")]
    pub stop_time: Option<u64>,
    pub java_version: String,
    pub java_home: String,
    pub main_class: String,
    #[serde(rename = "javaCommandLine")]
    pub command_line: String,
    pub jvm_name: String,
    pub jvm_info: String,
    pub jvm_version: String,
    pub jvm_arguments: String,
    /// `-1` when the owner could not be resolved.
    pub uid: i64,
    pub username: Option<String>,
}

impl VmInfo {
    pub fn new(writer_id: impl Into<String>, vm_id: VmId, pid: u32, metadata: VmMetadata) -> Self {
        Self {
            writer_id: writer_id.into(),
            vm_id,
            pid,
            start_time: metadata.start_time,
            stop_time: None,
            java_version: metadata.java_version,
            java_home: metadata.java_home,
            main_class: metadata.main_class,
            command_line: metadata.command_line,
            jvm_name: metadata.jvm_name,
            jvm_info: metadata.jvm_info,
            jvm_version: metadata.jvm_version,
            jvm_arguments: metadata.jvm_arguments,
            uid: metadata.uid.map(i64::from).unwrap_or(-1),
            username: metadata.username,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.stop_time.is_none()
    }
}
