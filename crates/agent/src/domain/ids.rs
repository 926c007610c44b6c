#![forbid(unsafe_code)]

use serde::{Serialize, Serializer};
use slotmap::new_key_type;
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

new_key_type! { pub struct ListenerId; }
new_key_type! { pub struct ActionId; }

/// Identifier of one observed JVM lifetime. Unlike the pid it is never
/// handed out twice, so samples from a VM that reused a pid cannot be
/// mistaken for the previous owner's.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmId(Arc<str>);

impl VmId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VmId").field(&&*self.0).finish()
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for VmId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VmId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for VmId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl Serialize for VmId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

pub trait IdAllocator: Send + Sync {
    /// Produce an id that has never been returned before by this allocator.
    fn allocate(&self) -> VmId;
}

/// Allocates random (v4) UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidAllocator;

impl IdAllocator for UuidAllocator {
    fn allocate(&self) -> VmId {
        VmId::from(Uuid::new_v4().to_string())
    }
}
