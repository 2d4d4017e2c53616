//! Target registry
//!
//! In-memory mirror of the live target subsystem:
//!
//! ```text
//! block_stores: name -> BlockStore
//! targets:      wwn  -> Target
//!                       tpgs: tag -> Tpg
//!                                    acls:    initiator -> Acl { mapped_luns }
//!                                    luns:    block store name -> Lun
//!                                    portals: "ip:port" -> Portal
//! ```
//!
//! The fabric is the source of truth. The registry is rebuilt from it by
//! [`TargetRegistry::discover`] and afterwards updated in lockstep with every
//! fabric mutation made through [`super::TargetManager`].

use serde::Serialize;
use std::collections::BTreeMap;

use super::fabric::*;
use crate::error::ProvisionResult;

/// Registry of block stores and iSCSI targets
#[derive(Debug, Clone, Default, Serialize)]
pub struct TargetRegistry {
    /// Block stores keyed by name
    pub block_stores: BTreeMap<String, BlockStoreHandle>,

    /// Targets keyed by WWN
    pub targets: BTreeMap<String, TargetNode>,
}

/// A target and the TPGs it owns
#[derive(Debug, Clone, Serialize)]
pub struct TargetNode {
    #[serde(skip)]
    pub handle: TargetHandle,
    pub tpgs: BTreeMap<u16, TpgNode>,
}

/// A TPG and its ACLs, LUNs and portals
#[derive(Debug, Clone, Serialize)]
pub struct TpgNode {
    #[serde(skip)]
    pub handle: TpgHandle,
    /// Keyed by initiator name
    pub acls: BTreeMap<String, AclNode>,
    /// Keyed by block store name
    pub luns: BTreeMap<String, LunHandle>,
    /// Keyed by `ip:port`
    pub portals: BTreeMap<String, PortalHandle>,
}

/// An initiator ACL and the LUNs mapped to it
#[derive(Debug, Clone, Serialize)]
pub struct AclNode {
    #[serde(skip)]
    pub handle: AclHandle,
    pub mapped_luns: Vec<MappedLunHandle>,
}

impl TargetNode {
    pub fn new(handle: TargetHandle) -> Self {
        Self {
            handle,
            tpgs: BTreeMap::new(),
        }
    }
}

impl TpgNode {
    pub fn new(handle: TpgHandle) -> Self {
        Self {
            handle,
            acls: BTreeMap::new(),
            luns: BTreeMap::new(),
            portals: BTreeMap::new(),
        }
    }
}

impl AclNode {
    pub fn new(handle: AclHandle) -> Self {
        Self {
            handle,
            mapped_luns: Vec::new(),
        }
    }
}

impl TargetRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan the fabric: block stores first, then the target tree
    pub fn discover<F: TargetFabric + ?Sized>(fabric: &F) -> ProvisionResult<Self> {
        let mut registry = Self::new();

        for store in fabric.block_stores()? {
            registry.block_stores.insert(store.name.clone(), store);
        }

        for target in fabric.targets()? {
            let mut node = TargetNode::new(target.clone());

            for tpg in fabric.tpgs(&target)? {
                let mut tpg_node = TpgNode::new(tpg.clone());

                for acl in fabric.acls(&tpg)? {
                    let mut acl_node = AclNode::new(acl.clone());
                    acl_node.mapped_luns = fabric.mapped_luns(&acl)?;
                    tpg_node.acls.insert(acl.initiator.clone(), acl_node);
                }

                for lun in fabric.luns(&tpg)? {
                    tpg_node.luns.insert(lun.storage.clone(), lun);
                }

                for portal in fabric.portals(&tpg)? {
                    tpg_node.portals.insert(portal.id(), portal);
                }

                node.tpgs.insert(tpg.tag, tpg_node);
            }

            registry.targets.insert(target.wwn.clone(), node);
        }

        log::debug!(
            "Discovered {} block store(s) and {} target(s)",
            registry.block_stores.len(),
            registry.targets.len()
        );
        Ok(registry)
    }

    /// Get a target by WWN
    pub fn get_target(&self, wwn: &str) -> Option<&TargetNode> {
        self.targets.get(wwn)
    }

    /// Get a TPG by WWN and tag
    pub fn get_tpg(&self, wwn: &str, tag: u16) -> Option<&TpgNode> {
        self.targets.get(wwn)?.tpgs.get(&tag)
    }

    /// Get a block store by name
    pub fn get_block_store(&self, name: &str) -> Option<&BlockStoreHandle> {
        self.block_stores.get(name)
    }

    /// All target WWNs, sorted
    pub fn list_targets(&self) -> Vec<&str> {
        self.targets.keys().map(String::as_str).collect()
    }

    pub(crate) fn tpg_mut(&mut self, wwn: &str, tag: u16) -> Option<&mut TpgNode> {
        self.targets.get_mut(wwn)?.tpgs.get_mut(&tag)
    }
}
