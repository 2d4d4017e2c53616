//! Target subsystem capability interface
//!
//! Everything the kernel target exposes is addressed by identifier only.
//! Handles are plain values naming an object; all side effects go through a
//! [`TargetFabric`] so that tests can run against an in-memory fabric.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::error::ProvisionResult;

/// Block backing store bound to a device path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockStoreHandle {
    pub name: String,
    pub device: String,
}

/// iSCSI target, identified by its IQN
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetHandle {
    pub wwn: String,
}

/// Target portal group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TpgHandle {
    pub wwn: String,
    pub tag: u16,
}

/// LUN inside a TPG, bound to a block store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LunHandle {
    #[serde(skip)]
    pub tpg: TpgHandle,
    pub index: u32,
    pub storage: String,
}

/// Network portal a TPG listens on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortalHandle {
    #[serde(skip)]
    pub tpg: TpgHandle,
    pub ip: String,
    pub port: u16,
}

impl PortalHandle {
    /// `ip:port`, the key used in the registry
    pub fn id(&self) -> String {
        portal_id(&self.ip, self.port)
    }
}

/// Registry key for a portal, in LIO's `np` naming.
///
/// IPv6 addresses are bracketed: `[::]:3260`.
pub fn portal_id(ip: &str, port: u16) -> String {
    if ip.contains(':') && !ip.starts_with('[') {
        format!("[{}]:{}", ip, port)
    } else {
        format!("{}:{}", ip, port)
    }
}

/// Split a portal id back into address and port
pub fn parse_portal_id(id: &str) -> Option<(String, u16)> {
    let (ip, port) = id.rsplit_once(':')?;
    let ip = ip
        .strip_prefix('[')
        .and_then(|ip| ip.strip_suffix(']'))
        .unwrap_or(ip);
    Some((ip.to_string(), port.parse().ok()?))
}

/// Initiator ACL inside a TPG
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AclHandle {
    #[serde(skip)]
    pub tpg: TpgHandle,
    pub initiator: String,
}

/// A TPG LUN made visible to one initiator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappedLunHandle {
    #[serde(skip)]
    pub acl: AclHandle,
    /// LUN number the initiator sees
    pub index: u32,
    /// TPG LUN it points at
    pub tpg_lun: u32,
}

impl fmt::Display for TpgHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/tpg{}", self.wwn, self.tag)
    }
}

impl fmt::Display for AclHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/acls/{}", self.tpg, self.initiator)
    }
}

impl fmt::Display for LunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/luns/lun{} ({})", self.tpg, self.index, self.storage)
    }
}

/// Create, delete and enumerate target subsystem objects.
///
/// Create calls fail with [`crate::ProvisionError::BackendState`] if the
/// object already exists or its parent does not.
pub trait TargetFabric {
    fn block_stores(&self) -> ProvisionResult<Vec<BlockStoreHandle>>;
    fn targets(&self) -> ProvisionResult<Vec<TargetHandle>>;
    fn tpgs(&self, target: &TargetHandle) -> ProvisionResult<Vec<TpgHandle>>;
    fn luns(&self, tpg: &TpgHandle) -> ProvisionResult<Vec<LunHandle>>;
    fn portals(&self, tpg: &TpgHandle) -> ProvisionResult<Vec<PortalHandle>>;
    fn acls(&self, tpg: &TpgHandle) -> ProvisionResult<Vec<AclHandle>>;
    fn mapped_luns(&self, acl: &AclHandle) -> ProvisionResult<Vec<MappedLunHandle>>;

    fn create_block_store(&self, name: &str, device: &str) -> ProvisionResult<BlockStoreHandle>;
    /// Removes the store object only; the device is untouched.
    fn delete_block_store(&self, store: &BlockStoreHandle) -> ProvisionResult<()>;

    fn create_target(&self, wwn: &str) -> ProvisionResult<TargetHandle>;
    /// Removes the target and everything beneath it.
    fn delete_target(&self, target: &TargetHandle) -> ProvisionResult<()>;

    fn create_tpg(&self, target: &TargetHandle, tag: u16) -> ProvisionResult<TpgHandle>;
    fn delete_tpg(&self, tpg: &TpgHandle) -> ProvisionResult<()>;
    fn set_tpg_attribute(&self, tpg: &TpgHandle, name: &str, value: &str) -> ProvisionResult<()>;
    fn enable_tpg(&self, tpg: &TpgHandle) -> ProvisionResult<()>;

    fn create_lun(
        &self,
        tpg: &TpgHandle,
        index: u32,
        store: &BlockStoreHandle,
    ) -> ProvisionResult<LunHandle>;
    fn delete_lun(&self, lun: &LunHandle) -> ProvisionResult<()>;

    fn create_portal(&self, tpg: &TpgHandle, ip: &str, port: u16) -> ProvisionResult<PortalHandle>;
    fn delete_portal(&self, portal: &PortalHandle) -> ProvisionResult<()>;

    fn create_acl(&self, tpg: &TpgHandle, initiator: &str) -> ProvisionResult<AclHandle>;
    fn delete_acl(&self, acl: &AclHandle) -> ProvisionResult<()>;

    fn create_mapped_lun(
        &self,
        acl: &AclHandle,
        index: u32,
        lun: &LunHandle,
    ) -> ProvisionResult<MappedLunHandle>;
    fn delete_mapped_lun(&self, mapped: &MappedLunHandle) -> ProvisionResult<()>;
}

macro_rules! forward_fabric {
    ($($name:ident($($arg:ident: $ty:ty),*) -> $ret:ty;)*) => {
        impl<F: TargetFabric + ?Sized> TargetFabric for Arc<F> {
            $(fn $name(&self, $($arg: $ty),*) -> $ret {
                (**self).$name($($arg),*)
            })*
        }
    };
}

forward_fabric! {
    block_stores() -> ProvisionResult<Vec<BlockStoreHandle>>;
    targets() -> ProvisionResult<Vec<TargetHandle>>;
    tpgs(target: &TargetHandle) -> ProvisionResult<Vec<TpgHandle>>;
    luns(tpg: &TpgHandle) -> ProvisionResult<Vec<LunHandle>>;
    portals(tpg: &TpgHandle) -> ProvisionResult<Vec<PortalHandle>>;
    acls(tpg: &TpgHandle) -> ProvisionResult<Vec<AclHandle>>;
    mapped_luns(acl: &AclHandle) -> ProvisionResult<Vec<MappedLunHandle>>;
    create_block_store(name: &str, device: &str) -> ProvisionResult<BlockStoreHandle>;
    delete_block_store(store: &BlockStoreHandle) -> ProvisionResult<()>;
    create_target(wwn: &str) -> ProvisionResult<TargetHandle>;
    delete_target(target: &TargetHandle) -> ProvisionResult<()>;
    create_tpg(target: &TargetHandle, tag: u16) -> ProvisionResult<TpgHandle>;
    delete_tpg(tpg: &TpgHandle) -> ProvisionResult<()>;
    set_tpg_attribute(tpg: &TpgHandle, name: &str, value: &str) -> ProvisionResult<()>;
    enable_tpg(tpg: &TpgHandle) -> ProvisionResult<()>;
    create_lun(tpg: &TpgHandle, index: u32, store: &BlockStoreHandle) -> ProvisionResult<LunHandle>;
    delete_lun(lun: &LunHandle) -> ProvisionResult<()>;
    create_portal(tpg: &TpgHandle, ip: &str, port: u16) -> ProvisionResult<PortalHandle>;
    delete_portal(portal: &PortalHandle) -> ProvisionResult<()>;
    create_acl(tpg: &TpgHandle, initiator: &str) -> ProvisionResult<AclHandle>;
    delete_acl(acl: &AclHandle) -> ProvisionResult<()>;
    create_mapped_lun(acl: &AclHandle, index: u32, lun: &LunHandle) -> ProvisionResult<MappedLunHandle>;
    delete_mapped_lun(mapped: &MappedLunHandle) -> ProvisionResult<()>;
}
