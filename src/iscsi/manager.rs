//! iSCSI export management
//!
//! Builds and tears down the target tree that exports one block device:
//! block store, target, TPG 1, LUN 0, portal, and one ACL plus mapped LUN per
//! initiator. Every step checks the registry before touching the fabric, so
//! calling [`TargetManager::create_iscsi_target`] again for an exported WWN
//! only re-applies the TPG settings.

use serde::{Deserialize, Serialize};

use super::fabric::*;
use super::registry::{AclNode, TargetNode, TargetRegistry, TpgNode};
use crate::error::{missing_fields, ProvisionError, ProvisionResult};

/// Only TPG tag used by this manager
pub const TPG_TAG: u16 = 1;

/// LUN index used both inside the TPG and as seen by initiators
pub const LUN_INDEX: u32 = 0;

/// Default portal address
pub const DEFAULT_PORTAL_IP: &str = "0.0.0.0";

/// Default iSCSI port
pub const DEFAULT_PORTAL_PORT: u16 = 3260;

/// What to do with sub-resources created by a call that then fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackPolicy {
    /// Leave whatever was created; a later delete cleans up
    #[default]
    BestEffort,
    /// Delete everything this call created, newest first
    Strict,
}

/// Address a TPG accepts connections on
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Portal {
    pub ip: String,
    pub port: u16,
}

impl Default for Portal {
    fn default() -> Self {
        Self {
            ip: DEFAULT_PORTAL_IP.to_string(),
            port: DEFAULT_PORTAL_PORT,
        }
    }
}

/// Object created during one call, kept for rollback
#[derive(Debug)]
enum Created {
    BlockStore(BlockStoreHandle),
    Target(TargetHandle),
    Tpg(TpgHandle),
    Lun(LunHandle),
    Portal(PortalHandle),
    Acl(AclHandle),
    MappedLun(MappedLunHandle),
}

/// Manages block stores and iSCSI targets through a fabric
pub struct TargetManager<F> {
    fabric: F,
    registry: TargetRegistry,
    policy: RollbackPolicy,
}

impl<F: TargetFabric> TargetManager<F> {
    /// Create a manager, discovering the current fabric state
    pub fn new(fabric: F, policy: RollbackPolicy) -> ProvisionResult<Self> {
        let registry = TargetRegistry::discover(&fabric)?;
        Ok(Self {
            fabric,
            registry,
            policy,
        })
    }

    /// Rebuild the registry from the fabric
    pub fn discover(&mut self) -> ProvisionResult<()> {
        self.registry = TargetRegistry::discover(&self.fabric)?;
        Ok(())
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    pub fn fabric(&self) -> &F {
        &self.fabric
    }

    pub fn policy(&self) -> RollbackPolicy {
        self.policy
    }

    /// Export `device` as LUN 0 of target `wwn` to each initiator
    pub fn create_iscsi_target(
        &mut self,
        wwn: &str,
        device: &str,
        initiators: &[String],
        portal: &Portal,
    ) -> ProvisionResult<()> {
        missing_fields(&[("wwn", !wwn.is_empty()), ("device", !device.is_empty())])?;

        let mut created = Vec::new();
        let result = self.export(wwn, device, initiators, portal, &mut created);

        if let Err(ref e) = result {
            if self.policy == RollbackPolicy::Strict && !created.is_empty() {
                log::warn!(
                    "Export of {} failed ({}), removing {} object(s) created by this call",
                    wwn,
                    e,
                    created.len()
                );
                self.unwind(created);
            }
        }

        result
    }

    fn export(
        &mut self,
        wwn: &str,
        device: &str,
        initiators: &[String],
        portal: &Portal,
        created: &mut Vec<Created>,
    ) -> ProvisionResult<()> {
        let store = self.ensure_block_store(wwn, device, created)?;
        let target = self.ensure_target(wwn, created)?;
        let tpg = self.ensure_tpg(&target, TPG_TAG, created)?;
        let lun = self.ensure_lun(&tpg, &store, created)?;
        log::info!("lun: {}", lun);
        self.ensure_portal(&tpg, portal, created)?;

        for initiator in initiators {
            let acl = self.ensure_acl(&tpg, initiator, created)?;
            self.map_lun(&acl, LUN_INDEX, &lun, created);
        }

        Ok(())
    }

    /// Delete the target and the block store of the same name.
    ///
    /// A WWN with no target is a logged no-op, even if a block store of that
    /// name exists. The device behind the block store is never touched.
    pub fn delete_target_and_block_store(&mut self, wwn: &str) -> ProvisionResult<()> {
        if wwn.is_empty() {
            return Err(ProvisionError::missing("wwn"));
        }

        if !self.registry.targets.contains_key(wwn) {
            log::info!("No target {}. Not deleting", wwn);
            return Ok(());
        }

        self.delete_target(wwn)?;
        self.delete_block_store(wwn)
    }

    /// Delete a target and everything under it, if it exists
    pub fn delete_target(&mut self, wwn: &str) -> ProvisionResult<()> {
        let Some(node) = self.registry.targets.get(wwn) else {
            log::info!("No target {}. Not deleting", wwn);
            return Ok(());
        };

        log::info!("deleting target {}", wwn);
        self.fabric.delete_target(&node.handle)?;
        self.registry.targets.remove(wwn);
        Ok(())
    }

    /// Delete a block store, if it exists
    pub fn delete_block_store(&mut self, name: &str) -> ProvisionResult<()> {
        let Some(store) = self.registry.block_stores.get(name) else {
            log::info!("No block store {}. Not deleting", name);
            return Ok(());
        };

        log::info!("deleting block store {}", name);
        self.fabric.delete_block_store(store)?;
        self.registry.block_stores.remove(name);
        Ok(())
    }

    fn ensure_block_store(
        &mut self,
        name: &str,
        device: &str,
        created: &mut Vec<Created>,
    ) -> ProvisionResult<BlockStoreHandle> {
        if let Some(store) = self.registry.block_stores.get(name) {
            if store.device != device {
                log::warn!(
                    "block store {} is bound to {}, not {}; keeping existing binding",
                    name,
                    store.device,
                    device
                );
            }
            return Ok(store.clone());
        }

        log::info!("creating block backstore {} for device {}", name, device);
        let store = self.fabric.create_block_store(name, device)?;
        self.registry
            .block_stores
            .insert(name.to_string(), store.clone());
        created.push(Created::BlockStore(store.clone()));
        Ok(store)
    }

    fn ensure_target(
        &mut self,
        wwn: &str,
        created: &mut Vec<Created>,
    ) -> ProvisionResult<TargetHandle> {
        if let Some(node) = self.registry.targets.get(wwn) {
            return Ok(node.handle.clone());
        }

        log::info!("creating target {}", wwn);
        let target = self.fabric.create_target(wwn)?;
        self.registry
            .targets
            .insert(wwn.to_string(), TargetNode::new(target.clone()));
        created.push(Created::Target(target.clone()));
        Ok(target)
    }

    fn ensure_tpg(
        &mut self,
        target: &TargetHandle,
        tag: u16,
        created: &mut Vec<Created>,
    ) -> ProvisionResult<TpgHandle> {
        let existing = self
            .registry
            .get_tpg(&target.wwn, tag)
            .map(|node| node.handle.clone());

        let tpg = match existing {
            Some(tpg) => tpg,
            None => {
                log::info!("creating tpg ({}, {})", target.wwn, tag);
                let tpg = self.fabric.create_tpg(target, tag)?;
                if let Some(node) = self.registry.targets.get_mut(&target.wwn) {
                    node.tpgs.insert(tag, TpgNode::new(tpg.clone()));
                }
                created.push(Created::Tpg(tpg.clone()));
                tpg
            }
        };

        self.fabric.set_tpg_attribute(&tpg, "authentication", "0")?;
        self.fabric.enable_tpg(&tpg)?;
        Ok(tpg)
    }

    fn ensure_lun(
        &mut self,
        tpg: &TpgHandle,
        store: &BlockStoreHandle,
        created: &mut Vec<Created>,
    ) -> ProvisionResult<LunHandle> {
        if let Some(lun) = self
            .registry
            .get_tpg(&tpg.wwn, tpg.tag)
            .and_then(|node| node.luns.get(&store.name))
        {
            return Ok(lun.clone());
        }

        log::info!("creating lun {}, blockstore {}", tpg, store.name);
        let lun = self.fabric.create_lun(tpg, LUN_INDEX, store)?;
        if let Some(node) = self.registry.tpg_mut(&tpg.wwn, tpg.tag) {
            node.luns.insert(store.name.clone(), lun.clone());
        }
        created.push(Created::Lun(lun.clone()));
        Ok(lun)
    }

    fn ensure_portal(
        &mut self,
        tpg: &TpgHandle,
        portal: &Portal,
        created: &mut Vec<Created>,
    ) -> ProvisionResult<PortalHandle> {
        let id = portal_id(&portal.ip, portal.port);
        if let Some(existing) = self
            .registry
            .get_tpg(&tpg.wwn, tpg.tag)
            .and_then(|node| node.portals.get(&id))
        {
            return Ok(existing.clone());
        }

        log::info!("creating portal ({}, {}, {})", tpg, portal.ip, portal.port);
        let handle = self.fabric.create_portal(tpg, &portal.ip, portal.port)?;
        if let Some(node) = self.registry.tpg_mut(&tpg.wwn, tpg.tag) {
            node.portals.insert(id, handle.clone());
        }
        created.push(Created::Portal(handle.clone()));
        Ok(handle)
    }

    fn ensure_acl(
        &mut self,
        tpg: &TpgHandle,
        initiator: &str,
        created: &mut Vec<Created>,
    ) -> ProvisionResult<AclHandle> {
        if let Some(acl) = self
            .registry
            .get_tpg(&tpg.wwn, tpg.tag)
            .and_then(|node| node.acls.get(initiator))
        {
            return Ok(acl.handle.clone());
        }

        log::info!("creating acl ({}, {})", tpg, initiator);
        let acl = self.fabric.create_acl(tpg, initiator)?;
        if let Some(node) = self.registry.tpg_mut(&tpg.wwn, tpg.tag) {
            node.acls
                .insert(initiator.to_string(), AclNode::new(acl.clone()));
        }
        created.push(Created::Acl(acl.clone()));
        Ok(acl)
    }

    /// Map `lun` into the ACL unless it already has any mapped LUN.
    ///
    /// Failures are logged and swallowed so the remaining initiators are
    /// still processed.
    fn map_lun(
        &mut self,
        acl: &AclHandle,
        index: u32,
        lun: &LunHandle,
        created: &mut Vec<Created>,
    ) {
        let Some(node) = self
            .registry
            .tpg_mut(&acl.tpg.wwn, acl.tpg.tag)
            .and_then(|tpg| tpg.acls.get_mut(&acl.initiator))
        else {
            return;
        };

        if !node.mapped_luns.is_empty() {
            return;
        }

        log::info!("creating mapped lun ({}, {}, {})", acl, index, lun);
        match self.fabric.create_mapped_lun(acl, index, lun) {
            Ok(mapped) => {
                node.mapped_luns.push(mapped.clone());
                created.push(Created::MappedLun(mapped));
            }
            Err(e) => log::error!("{}", e),
        }
    }

    /// Remove objects newest first; failures are logged and skipped
    fn unwind(&mut self, created: Vec<Created>) {
        for object in created.into_iter().rev() {
            let result = match &object {
                Created::MappedLun(mapped) => self.fabric.delete_mapped_lun(mapped).map(|_| {
                    let acl = &mapped.acl;
                    if let Some(node) = self
                        .registry
                        .tpg_mut(&acl.tpg.wwn, acl.tpg.tag)
                        .and_then(|tpg| tpg.acls.get_mut(&acl.initiator))
                    {
                        node.mapped_luns.retain(|m| m != mapped);
                    }
                }),
                Created::Acl(acl) => self.fabric.delete_acl(acl).map(|_| {
                    if let Some(tpg) = self.registry.tpg_mut(&acl.tpg.wwn, acl.tpg.tag) {
                        tpg.acls.remove(&acl.initiator);
                    }
                }),
                Created::Portal(portal) => self.fabric.delete_portal(portal).map(|_| {
                    if let Some(tpg) = self.registry.tpg_mut(&portal.tpg.wwn, portal.tpg.tag) {
                        tpg.portals.remove(&portal.id());
                    }
                }),
                Created::Lun(lun) => self.fabric.delete_lun(lun).map(|_| {
                    if let Some(tpg) = self.registry.tpg_mut(&lun.tpg.wwn, lun.tpg.tag) {
                        tpg.luns.remove(&lun.storage);
                    }
                }),
                Created::Tpg(tpg) => self.fabric.delete_tpg(tpg).map(|_| {
                    if let Some(node) = self.registry.targets.get_mut(&tpg.wwn) {
                        node.tpgs.remove(&tpg.tag);
                    }
                }),
                Created::Target(target) => self.fabric.delete_target(target).map(|_| {
                    self.registry.targets.remove(&target.wwn);
                }),
                Created::BlockStore(store) => self.fabric.delete_block_store(store).map(|_| {
                    self.registry.block_stores.remove(&store.name);
                }),
            };

            if let Err(e) = result {
                log::warn!("rollback of {:?} failed: {}", object, e);
            }
        }
    }
}
