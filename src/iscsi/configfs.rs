//! LIO configfs target fabric
//!
//! The Linux target subsystem is driven entirely through configfs: creating a
//! directory creates the kernel object, symlinks bind LUNs to storage, and
//! attribute files are written to configure them. Layout under the root
//! (normally `/sys/kernel/config/target`):
//!
//! ```text
//! core/iblock_<n>/<store>/{control,udev_path,enable}
//! iscsi/<wwn>/tpgt_<tag>/{enable,attrib/,lun/,np/,acls/}
//!     lun/lun_<i>/<link> -> core/iblock_<n>/<store>
//!     np/<ip>:<port>/            ([<ip>]:<port> for IPv6)
//!     acls/<initiator>/lun_<m>/<link> -> ../../../lun/lun_<i>
//! ```

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use super::fabric::*;
use crate::error::{ProvisionError, ProvisionResult};

/// Default configfs mount point for the target subsystem
pub const DEFAULT_CONFIGFS_ROOT: &str = "/sys/kernel/config/target";

const HBA_PREFIX: &str = "iblock_";
const TPG_PREFIX: &str = "tpgt_";
const LUN_PREFIX: &str = "lun_";
const DISCOVERY_AUTH: &str = "discovery_auth";

/// Target fabric backed by the kernel's configfs tree
#[derive(Debug, Clone)]
pub struct ConfigFsFabric {
    root: PathBuf,
}

impl ConfigFsFabric {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn core(&self) -> PathBuf {
        self.root.join("core")
    }

    fn iscsi(&self) -> PathBuf {
        self.root.join("iscsi")
    }

    fn target_path(&self, wwn: &str) -> PathBuf {
        self.iscsi().join(wwn)
    }

    fn tpg_path(&self, tpg: &TpgHandle) -> PathBuf {
        self.target_path(&tpg.wwn)
            .join(format!("{}{}", TPG_PREFIX, tpg.tag))
    }

    fn lun_path(&self, tpg: &TpgHandle, index: u32) -> PathBuf {
        self.tpg_path(tpg)
            .join("lun")
            .join(format!("{}{}", LUN_PREFIX, index))
    }

    fn acl_path(&self, acl: &AclHandle) -> PathBuf {
        self.tpg_path(&acl.tpg).join("acls").join(&acl.initiator)
    }

    /// Directory of the named block store, if any HBA holds it
    fn store_path(&self, name: &str) -> ProvisionResult<Option<PathBuf>> {
        for hba in subdirs(&self.core())? {
            if !hba.starts_with(HBA_PREFIX) {
                continue;
            }
            let path = self.core().join(&hba).join(name);
            if path.is_dir() {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// First unused `iblock_<n>` directory
    fn free_hba(&self) -> PathBuf {
        let core = self.core();
        (0u32..)
            .map(|n| core.join(format!("{}{}", HBA_PREFIX, n)))
            .find(|path| !path.exists())
            .unwrap_or_else(|| core.join(HBA_PREFIX))
    }
}

impl TargetFabric for ConfigFsFabric {
    fn block_stores(&self) -> ProvisionResult<Vec<BlockStoreHandle>> {
        let mut stores = Vec::new();
        for hba in subdirs(&self.core())? {
            if !hba.starts_with(HBA_PREFIX) {
                continue;
            }
            let hba_path = self.core().join(&hba);
            for name in subdirs(&hba_path)? {
                let device = fs::read_to_string(hba_path.join(&name).join("udev_path"))
                    .map(|dev| dev.trim().to_string())
                    .unwrap_or_default();
                stores.push(BlockStoreHandle { name, device });
            }
        }
        Ok(stores)
    }

    fn targets(&self) -> ProvisionResult<Vec<TargetHandle>> {
        Ok(subdirs(&self.iscsi())?
            .into_iter()
            .filter(|name| name != DISCOVERY_AUTH)
            .map(|wwn| TargetHandle { wwn })
            .collect())
    }

    fn tpgs(&self, target: &TargetHandle) -> ProvisionResult<Vec<TpgHandle>> {
        Ok(subdirs(&self.target_path(&target.wwn))?
            .iter()
            .filter_map(|name| name.strip_prefix(TPG_PREFIX)?.parse().ok())
            .map(|tag| TpgHandle {
                wwn: target.wwn.clone(),
                tag,
            })
            .collect())
    }

    fn luns(&self, tpg: &TpgHandle) -> ProvisionResult<Vec<LunHandle>> {
        let base = self.tpg_path(tpg).join("lun");
        let mut luns = Vec::new();
        for name in subdirs(&base)? {
            let Some(index) = lun_index(&name) else {
                continue;
            };
            let storage = links(&base.join(&name))?
                .into_iter()
                .next()
                .and_then(|target| file_name(&target))
                .unwrap_or_default();
            luns.push(LunHandle {
                tpg: tpg.clone(),
                index,
                storage,
            });
        }
        Ok(luns)
    }

    fn portals(&self, tpg: &TpgHandle) -> ProvisionResult<Vec<PortalHandle>> {
        Ok(subdirs(&self.tpg_path(tpg).join("np"))?
            .iter()
            .filter_map(|name| {
                let (ip, port) = parse_portal_id(name)?;
                Some(PortalHandle {
                    tpg: tpg.clone(),
                    ip,
                    port,
                })
            })
            .collect())
    }

    fn acls(&self, tpg: &TpgHandle) -> ProvisionResult<Vec<AclHandle>> {
        Ok(subdirs(&self.tpg_path(tpg).join("acls"))?
            .into_iter()
            .map(|initiator| AclHandle {
                tpg: tpg.clone(),
                initiator,
            })
            .collect())
    }

    fn mapped_luns(&self, acl: &AclHandle) -> ProvisionResult<Vec<MappedLunHandle>> {
        let base = self.acl_path(acl);
        let mut mapped = Vec::new();
        for name in subdirs(&base)? {
            let Some(index) = lun_index(&name) else {
                continue;
            };
            let tpg_lun = links(&base.join(&name))?
                .into_iter()
                .next()
                .and_then(|target| file_name(&target))
                .and_then(|target| lun_index(&target))
                .unwrap_or(0);
            mapped.push(MappedLunHandle {
                acl: acl.clone(),
                index,
                tpg_lun,
            });
        }
        Ok(mapped)
    }

    fn create_block_store(&self, name: &str, device: &str) -> ProvisionResult<BlockStoreHandle> {
        if self.store_path(name)?.is_some() {
            return Err(ProvisionError::BackendState {
                operation: format!("create block store {}", name),
                message: "storage object already exists".to_string(),
            });
        }

        let hba = self.free_hba();
        mkdir_all(&hba)?;
        let built = build(&hba.join(name), |path| {
            write(&path.join("control"), &format!("udev_path={}", device))?;
            write(&path.join("udev_path"), device)?;
            write(&path.join("enable"), "1")
        });
        if built.is_err() {
            remove_hba(&hba);
        }
        built?;

        Ok(BlockStoreHandle {
            name: name.to_string(),
            device: device.to_string(),
        })
    }

    fn delete_block_store(&self, store: &BlockStoreHandle) -> ProvisionResult<()> {
        let Some(path) = self.store_path(&store.name)? else {
            return Ok(());
        };
        rmdir(&path)?;
        if let Some(hba) = path.parent() {
            remove_hba(hba);
        }
        Ok(())
    }

    fn create_target(&self, wwn: &str) -> ProvisionResult<TargetHandle> {
        mkdir_all(&self.iscsi())?;
        mkdir(&self.target_path(wwn))?;
        Ok(TargetHandle {
            wwn: wwn.to_string(),
        })
    }

    fn delete_target(&self, target: &TargetHandle) -> ProvisionResult<()> {
        for tpg in self.tpgs(target)? {
            self.delete_tpg(&tpg)?;
        }
        rmdir(&self.target_path(&target.wwn))
    }

    fn create_tpg(&self, target: &TargetHandle, tag: u16) -> ProvisionResult<TpgHandle> {
        let tpg = TpgHandle {
            wwn: target.wwn.clone(),
            tag,
        };
        mkdir(&self.tpg_path(&tpg))?;
        Ok(tpg)
    }

    fn delete_tpg(&self, tpg: &TpgHandle) -> ProvisionResult<()> {
        let enable = self.tpg_path(tpg).join("enable");
        if let Err(e) = fs::write(&enable, "0") {
            log::warn!("could not disable {}: {}", tpg, e);
        }

        for acl in self.acls(tpg)? {
            self.delete_acl(&acl)?;
        }
        for lun in self.luns(tpg)? {
            self.delete_lun(&lun)?;
        }
        for portal in self.portals(tpg)? {
            self.delete_portal(&portal)?;
        }
        rmdir(&self.tpg_path(tpg))
    }

    fn set_tpg_attribute(&self, tpg: &TpgHandle, name: &str, value: &str) -> ProvisionResult<()> {
        let attrib = self.tpg_path(tpg).join("attrib");
        mkdir_all(&attrib)?;
        write(&attrib.join(name), value)
    }

    fn enable_tpg(&self, tpg: &TpgHandle) -> ProvisionResult<()> {
        write(&self.tpg_path(tpg).join("enable"), "1")
    }

    fn create_lun(
        &self,
        tpg: &TpgHandle,
        index: u32,
        store: &BlockStoreHandle,
    ) -> ProvisionResult<LunHandle> {
        let storage = self
            .store_path(&store.name)?
            .ok_or_else(|| ProvisionError::BackendState {
                operation: format!("create lun {} in {}", index, tpg),
                message: format!("no storage object {}", store.name),
            })?;

        let path = self.lun_path(tpg, index);
        mkdir_all(&self.tpg_path(tpg).join("lun"))?;
        mkdir(&path)?;
        link(&storage, &path.join(&store.name))?;

        Ok(LunHandle {
            tpg: tpg.clone(),
            index,
            storage: store.name.clone(),
        })
    }

    fn delete_lun(&self, lun: &LunHandle) -> ProvisionResult<()> {
        let path = self.lun_path(&lun.tpg, lun.index);
        unlink_all(&path)?;
        rmdir(&path)
    }

    fn create_portal(&self, tpg: &TpgHandle, ip: &str, port: u16) -> ProvisionResult<PortalHandle> {
        let np = self.tpg_path(tpg).join("np");
        mkdir_all(&np)?;
        mkdir(&np.join(portal_id(ip, port)))?;
        Ok(PortalHandle {
            tpg: tpg.clone(),
            ip: ip.to_string(),
            port,
        })
    }

    fn delete_portal(&self, portal: &PortalHandle) -> ProvisionResult<()> {
        rmdir(&self.tpg_path(&portal.tpg).join("np").join(portal.id()))
    }

    fn create_acl(&self, tpg: &TpgHandle, initiator: &str) -> ProvisionResult<AclHandle> {
        let acl = AclHandle {
            tpg: tpg.clone(),
            initiator: initiator.to_string(),
        };
        mkdir_all(&self.tpg_path(tpg).join("acls"))?;
        mkdir(&self.acl_path(&acl))?;
        Ok(acl)
    }

    fn delete_acl(&self, acl: &AclHandle) -> ProvisionResult<()> {
        for mapped in self.mapped_luns(acl)? {
            self.delete_mapped_lun(&mapped)?;
        }
        rmdir(&self.acl_path(acl))
    }

    fn create_mapped_lun(
        &self,
        acl: &AclHandle,
        index: u32,
        lun: &LunHandle,
    ) -> ProvisionResult<MappedLunHandle> {
        let path = self.acl_path(acl).join(format!("{}{}", LUN_PREFIX, index));
        mkdir(&path)?;
        let target = self.lun_path(&acl.tpg, lun.index);
        link(&target, &path.join(format!("{}{}", LUN_PREFIX, lun.index)))?;

        Ok(MappedLunHandle {
            acl: acl.clone(),
            index,
            tpg_lun: lun.index,
        })
    }

    fn delete_mapped_lun(&self, mapped: &MappedLunHandle) -> ProvisionResult<()> {
        let path = self
            .acl_path(&mapped.acl)
            .join(format!("{}{}", LUN_PREFIX, mapped.index));
        unlink_all(&path)?;
        rmdir(&path)
    }
}

fn lun_index(name: &str) -> Option<u32> {
    name.strip_prefix(LUN_PREFIX)?.parse().ok()
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|name| name.to_string_lossy().into_owned())
}

/// Sorted names of the subdirectories of `path`; empty if it does not exist.
/// Symlinks are not followed.
fn subdirs(path: &Path) -> ProvisionResult<Vec<String>> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ProvisionError::backend(format!("read {}", path.display()), e)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ProvisionError::backend(format!("read {}", path.display()), e))?;
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Targets of the symlinks directly inside `path`
fn links(path: &Path) -> ProvisionResult<Vec<PathBuf>> {
    let entries = fs::read_dir(path)
        .map_err(|e| ProvisionError::backend(format!("read {}", path.display()), e))?;

    let mut targets = Vec::new();
    for entry in entries.flatten() {
        let is_link = entry.file_type().map(|t| t.is_symlink()).unwrap_or(false);
        if is_link {
            if let Ok(target) = fs::read_link(entry.path()) {
                targets.push(target);
            }
        }
    }
    Ok(targets)
}

fn unlink_all(path: &Path) -> ProvisionResult<()> {
    let entries = fs::read_dir(path)
        .map_err(|e| ProvisionError::backend(format!("read {}", path.display()), e))?;
    for entry in entries.flatten() {
        if entry.file_type().map(|t| t.is_symlink()).unwrap_or(false) {
            fs::remove_file(entry.path())
                .map_err(|e| ProvisionError::backend(format!("unlink {}", entry.path().display()), e))?;
        }
    }
    Ok(())
}

fn mkdir(path: &Path) -> ProvisionResult<()> {
    fs::create_dir(path).map_err(|e| ProvisionError::backend(format!("mkdir {}", path.display()), e))
}

fn mkdir_all(path: &Path) -> ProvisionResult<()> {
    fs::create_dir_all(path)
        .map_err(|e| ProvisionError::backend(format!("mkdir {}", path.display()), e))
}

/// Remove a kernel object directory.
///
/// In configfs the attribute files and default groups go away with the
/// object. Anywhere else they are ordinary entries, so on failure they are
/// cleared and the removal retried. A symlink means the object is still
/// linked to something and is never cleared.
fn rmdir(path: &Path) -> ProvisionResult<()> {
    let first = match fs::remove_dir(path) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    if first.kind() == io::ErrorKind::NotFound || linked(path).unwrap_or(true) || clear(path).is_err()
    {
        return Err(ProvisionError::backend(format!("rmdir {}", path.display()), first));
    }
    fs::remove_dir(path).map_err(|e| ProvisionError::backend(format!("rmdir {}", path.display()), e))
}

/// Whether any symlink sits anywhere below `path`
fn linked(path: &Path) -> io::Result<bool> {
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let kind = entry.file_type()?;
        if kind.is_symlink() || (kind.is_dir() && linked(&entry.path())?) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Remove plain files, then empty the subdirectories and remove them
fn clear(path: &Path) -> io::Result<()> {
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            clear(&entry.path())?;
            fs::remove_dir(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Create the object directory `path` and fill it in; on failure nothing is
/// left behind.
fn build<T>(path: &Path, fill: impl FnOnce(&Path) -> ProvisionResult<T>) -> ProvisionResult<T> {
    mkdir(path)?;
    fill(path).map_err(|e| {
        if let Err(cleanup) = rmdir(path) {
            log::warn!("could not remove partial {}: {}", path.display(), cleanup);
        }
        e
    })
}

/// Drop an HBA directory once its last store is gone
fn remove_hba(hba: &Path) {
    if let Err(e) = fs::remove_dir(hba) {
        log::debug!("keeping {}: {}", hba.display(), e);
    }
}

fn write(path: &Path, value: &str) -> ProvisionResult<()> {
    fs::write(path, value).map_err(|e| ProvisionError::backend(format!("write {}", path.display()), e))
}

fn link(target: &Path, path: &Path) -> ProvisionResult<()> {
    symlink(target, path).map_err(|e| {
        ProvisionError::backend(
            format!("link {} -> {}", path.display(), target.display()),
            e,
        )
    })
}
