//! LUN clone orchestration
//!
//! A boot LUN is a zvol cloned from a golden snapshot and exported as LUN 0
//! of its own iSCSI target. [`Provisioner`] ties the volume backend and the
//! target manager together and is safe to share between request handlers:
//! each backend sits behind its own mutex, and a per-WWN lock is held for
//! the whole of a create or delete so two requests for the same target never
//! interleave.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::command::{CommandRunner, ProcessCommandRunner};
use crate::config::Config;
use crate::error::{missing_fields, present, ProvisionError, ProvisionResult};
use crate::iscsi::{ConfigFsFabric, Portal, RollbackPolicy, TargetFabric, TargetManager, TargetRegistry};
use crate::prep::{LunPrep, PrepRequest};
use crate::settle::UdevSettle;
use crate::zfs::{Properties, Zfs};

/// Default directory holding zvol device nodes
pub const DEFAULT_DEVICE_ROOT: &str = "/dev/zvol";

static NO_PROPERTIES: Properties = Properties::new();

/// Clone a snapshot and export it
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneRequest {
    pub snapshot: Option<String>,
    pub dest: Option<String>,
    pub wwn: Option<String>,
    pub device: Option<String>,
    pub initiators: Option<Vec<String>>,
    pub properties: Option<Properties>,
    pub create_parent: Option<bool>,
}

/// Tear down an export and optionally its clone
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub name: Option<String>,
    pub wwn: Option<String>,
    pub delete_clones: Option<bool>,
}

/// One entry of a batch clone. The device is derived from `dst`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneEntry {
    pub snapshot: Option<String>,
    pub dst: Option<String>,
    pub wwn: Option<String>,
    pub initiators: Option<Vec<String>>,
    pub properties: Option<Properties>,
    pub create_parent: Option<bool>,
}

/// One entry of a batch release
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseEntry {
    pub dst: Option<String>,
    pub wwn: Option<String>,
    pub delete_clones: Option<bool>,
}

impl CloneRequest {
    fn validate(&self) -> ProvisionResult<()> {
        missing_fields(&[
            ("snapshot", present(&self.snapshot)),
            ("dest", present(&self.dest)),
            ("wwn", present(&self.wwn)),
            ("device", present(&self.device)),
            ("initiators", self.initiators.is_some()),
        ])
    }
}

impl ReleaseRequest {
    fn validate(&self) -> ProvisionResult<()> {
        missing_fields(&[("name", present(&self.name)), ("wwn", present(&self.wwn))])
    }
}

impl CloneEntry {
    fn validate(&self) -> ProvisionResult<()> {
        missing_fields(&[
            ("snapshot", present(&self.snapshot)),
            ("dst", present(&self.dst)),
            ("wwn", present(&self.wwn)),
            ("initiators", self.initiators.is_some()),
        ])
    }
}

impl ReleaseEntry {
    fn validate(&self) -> ProvisionResult<()> {
        missing_fields(&[("wwn", present(&self.wwn))])?;
        if self.delete_clones.unwrap_or(false) && !present(&self.dst) {
            return Err(ProvisionError::missing("dst"));
        }
        Ok(())
    }
}

/// Value of a field already checked by `validate`
fn field(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or_default()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Table of WWNs currently being worked on
#[derive(Debug, Default)]
pub struct WwnLocks {
    held: Mutex<BTreeSet<String>>,
    released: Condvar,
}

struct WwnGuard<'a> {
    locks: &'a WwnLocks,
    wwns: BTreeSet<String>,
}

impl WwnLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding every WWN in `wwns`.
    ///
    /// The whole set is taken at once, in sorted order, so overlapping
    /// batches cannot deadlock.
    pub fn with<T>(&self, wwns: &[&str], f: impl FnOnce() -> T) -> T {
        let _guard = self.acquire(wwns);
        f()
    }

    fn acquire(&self, wwns: &[&str]) -> WwnGuard<'_> {
        let wanted: BTreeSet<String> = wwns.iter().map(|w| w.to_string()).collect();

        let mut held = lock(&self.held);
        while wanted.iter().any(|w| held.contains(w)) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.extend(wanted.iter().cloned());

        WwnGuard {
            locks: self,
            wwns: wanted,
        }
    }
}

impl Drop for WwnGuard<'_> {
    fn drop(&mut self) {
        let mut held = lock(&self.locks.held);
        for wwn in &self.wwns {
            held.remove(wwn);
        }
        self.locks.released.notify_all();
    }
}

/// Boot LUN provisioner
pub struct Provisioner<R, F> {
    zfs: Mutex<Zfs<R>>,
    targets: Mutex<TargetManager<F>>,
    locks: WwnLocks,
    policy: RollbackPolicy,
    portal: Portal,
    device_root: String,
    prep: Option<LunPrep<R>>,
}

impl Provisioner<ProcessCommandRunner, ConfigFsFabric> {
    /// Provisioner driving the host's zfs, udevadm and configfs
    pub fn from_config(config: &Config) -> ProvisionResult<Self> {
        let zfs = Zfs::new(
            ProcessCommandRunner,
            config.zfs.command.clone(),
            UdevSettle::new(config.udev.command.clone()),
        );
        let fabric = ConfigFsFabric::new(&config.target.configfs_root);
        let targets = TargetManager::new(fabric, config.provisioning.rollback)?;

        let prep = LunPrep::new(
            ProcessCommandRunner,
            UdevSettle::new(config.udev.command.clone()),
            config.prep.clone(),
        );

        Ok(Provisioner::new(zfs, targets, config.target.portal())
            .with_device_root(config.zfs.device_root.clone())
            .with_prep(prep))
    }
}

impl<R: CommandRunner, F: TargetFabric> Provisioner<R, F> {
    pub fn new(zfs: Zfs<R>, targets: TargetManager<F>, portal: Portal) -> Self {
        let policy = targets.policy();
        Self {
            zfs: Mutex::new(zfs),
            targets: Mutex::new(targets),
            locks: WwnLocks::new(),
            policy,
            portal,
            device_root: DEFAULT_DEVICE_ROOT.to_string(),
            prep: None,
        }
    }

    /// Enable image preparation
    pub fn with_prep(mut self, prep: LunPrep<R>) -> Self {
        self.prep = Some(prep);
        self
    }

    /// Directory batch clones are looked up under
    pub fn with_device_root(mut self, root: impl Into<String>) -> Self {
        self.device_root = root.into();
        self
    }

    pub fn policy(&self) -> RollbackPolicy {
        self.policy
    }

    /// Volume backend with a fresh listing cache
    pub fn volumes(&self) -> MutexGuard<'_, Zfs<R>> {
        let mut zfs = lock(&self.zfs);
        zfs.refresh();
        zfs
    }

    /// Snapshot of the target registry, rediscovered from the fabric
    pub fn registry(&self) -> ProvisionResult<TargetRegistry> {
        let mut targets = lock(&self.targets);
        targets.discover()?;
        Ok(targets.registry().clone())
    }

    /// `/dev/zvol/<dataset>` or the configured equivalent
    pub fn device_path(&self, dataset: &str) -> String {
        format!("{}/{}", self.device_root.trim_end_matches('/'), dataset)
    }

    /// Clone `snapshot` to `dest`, then export `device` as target `wwn`.
    ///
    /// Nothing is touched if any required field is missing. The clone is
    /// settled before the export so the device path exists when the block
    /// store is bound to it.
    pub fn create(&self, request: &CloneRequest) -> ProvisionResult<()> {
        request.validate()?;

        let snapshot = field(&request.snapshot);
        let dest = field(&request.dest);
        let wwn = field(&request.wwn);
        let device = field(&request.device);
        let initiators = request.initiators.as_deref().unwrap_or_default();
        let properties = request.properties.as_ref().unwrap_or(&NO_PROPERTIES);
        let create_parent = request.create_parent.unwrap_or(false);

        self.locks.with(&[wwn], || {
            let outcome = self
                .volumes()
                .clone_snapshot(snapshot, dest, properties, create_parent)?;

            if let Err(e) = self.export_locked(wwn, device, initiators) {
                if self.policy == RollbackPolicy::Strict && outcome.changed() {
                    self.discard_clone(dest);
                }
                return Err(e);
            }

            log::info!("Provisioned {} from {} as {}", dest, snapshot, wwn);
            Ok(())
        })
    }

    /// Remove the export for `wwn`, and the clone `name` if asked to.
    ///
    /// A WWN with no target or block store is not an error.
    pub fn delete(&self, request: &ReleaseRequest) -> ProvisionResult<()> {
        request.validate()?;

        let name = field(&request.name);
        let wwn = field(&request.wwn);

        self.locks.with(&[wwn], || {
            self.unexport_locked(wwn)?;

            if request.delete_clones.unwrap_or(false) {
                self.volumes().destroy(name)?;
            }
            Ok(())
        })
    }

    /// Clone every entry, settle once, then export each clone.
    ///
    /// Returns the datasets this call created.
    pub fn create_many(&self, entries: &[CloneEntry]) -> ProvisionResult<Vec<String>> {
        for entry in entries {
            entry.validate()?;
        }

        let wwns: Vec<&str> = entries.iter().map(|e| field(&e.wwn)).collect();

        self.locks.with(&wwns, || {
            let created = self.clone_all(entries)?;

            for (i, entry) in entries.iter().enumerate() {
                let dst = field(&entry.dst);
                let device = self.device_path(dst);
                let initiators = entry.initiators.as_deref().unwrap_or_default();

                if let Err(e) = self.export_locked(field(&entry.wwn), &device, initiators) {
                    if self.policy == RollbackPolicy::Strict {
                        for pending in &entries[i..] {
                            let dst = field(&pending.dst);
                            if created.iter().any(|c| c == dst) {
                                self.discard_clone(dst);
                            }
                        }
                    }
                    return Err(e);
                }
            }

            log::info!("Provisioned {} clone(s), {} new", entries.len(), created.len());
            Ok(created)
        })
    }

    /// Tear down every export, then destroy the clones flagged for deletion
    pub fn delete_many(&self, entries: &[ReleaseEntry]) -> ProvisionResult<()> {
        for entry in entries {
            entry.validate()?;
        }

        let wwns: Vec<&str> = entries.iter().map(|e| field(&e.wwn)).collect();

        self.locks.with(&wwns, || {
            for entry in entries {
                self.unexport_locked(field(&entry.wwn))?;
            }

            for entry in entries {
                if entry.delete_clones.unwrap_or(false) {
                    self.volumes().destroy(field(&entry.dst))?;
                }
            }
            Ok(())
        })
    }

    /// Export an existing device as target `wwn`
    pub fn export(&self, wwn: &str, device: &str, initiators: &[String]) -> ProvisionResult<()> {
        missing_fields(&[("wwn", !wwn.is_empty()), ("device", !device.is_empty())])?;
        self.locks
            .with(&[wwn], || self.export_locked(wwn, device, initiators))
    }

    /// Delete target `wwn` and its block store
    pub fn unexport(&self, wwn: &str) -> ProvisionResult<()> {
        if wwn.is_empty() {
            return Err(ProvisionError::missing("wwn"));
        }
        self.locks.with(&[wwn], || self.unexport_locked(wwn))
    }

    /// Prepare the image on the LUN exported as `wwn`.
    ///
    /// Holds the WWN lock for the whole run so the export cannot be torn
    /// down underneath the mounted image.
    pub fn prep(&self, request: &PrepRequest) -> ProvisionResult<()> {
        request.validate()?;
        let prep = self
            .prep
            .as_ref()
            .ok_or_else(|| ProvisionError::InvalidState("image preparation is not configured".to_string()))?;

        self.locks.with(&[field(&request.wwn)], || prep.prep(request))
    }

    /// Clone stage of a batch; settles once if anything was created
    fn clone_all(&self, entries: &[CloneEntry]) -> ProvisionResult<Vec<String>> {
        let mut created = Vec::new();
        let mut zfs = lock(&self.zfs);

        for entry in entries {
            zfs.refresh();
            let dst = field(&entry.dst);
            let result = zfs.clone_unsettled(
                field(&entry.snapshot),
                dst,
                entry.properties.as_ref().unwrap_or(&NO_PROPERTIES),
                entry.create_parent.unwrap_or(false),
            );

            match result {
                Ok(outcome) if outcome.changed() => created.push(dst.to_string()),
                Ok(_) => {}
                Err(e) => {
                    if self.policy == RollbackPolicy::Strict {
                        zfs.refresh();
                        for dst in &created {
                            if let Err(e) = zfs.destroy(dst) {
                                log::warn!("rollback of clone {} failed: {}", dst, e);
                            }
                        }
                    }
                    return Err(e);
                }
            }
        }

        // udev has to finish with every new zvol before any target can bind
        // to it, and with many zvols that takes a while.
        if !created.is_empty() {
            zfs.settle()?;
        }
        Ok(created)
    }

    fn export_locked(&self, wwn: &str, device: &str, initiators: &[String]) -> ProvisionResult<()> {
        let mut targets = lock(&self.targets);
        targets.discover()?;
        targets.create_iscsi_target(wwn, device, initiators, &self.portal)
    }

    fn unexport_locked(&self, wwn: &str) -> ProvisionResult<()> {
        let mut targets = lock(&self.targets);
        targets.discover()?;
        targets.delete_target_and_block_store(wwn)
    }

    fn discard_clone(&self, dest: &str) {
        log::warn!("Export failed, destroying clone {}", dest);
        if let Err(e) = self.volumes().destroy(dest) {
            log::warn!("rollback of clone {} failed: {}", dest, e);
        }
    }
}
