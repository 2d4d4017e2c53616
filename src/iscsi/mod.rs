//! iSCSI target management
//!
//! Exports block devices through the kernel target subsystem.

pub mod configfs;
pub mod fabric;
pub mod manager;
pub mod registry;

pub use configfs::{ConfigFsFabric, DEFAULT_CONFIGFS_ROOT};
pub use fabric::{
    AclHandle, BlockStoreHandle, LunHandle, MappedLunHandle, PortalHandle, TargetFabric,
    TargetHandle, TpgHandle,
};
pub use manager::{
    Portal, RollbackPolicy, TargetManager, DEFAULT_PORTAL_IP, DEFAULT_PORTAL_PORT, LUN_INDEX,
    TPG_TAG,
};
pub use registry::{AclNode, TargetNode, TargetRegistry, TpgNode};
