#![forbid(unsafe_code)]

mod ids;
mod status;
mod vm_info;

pub use ids::{ActionId, IdAllocator, ListenerId, UuidAllocator, VmId};
pub use status::VmStatus;
pub use vm_info::{VmInfo, VmMetadata};
