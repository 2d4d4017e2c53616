//! Deterministic stand-ins for the host used by unit tests
//!
//! [`FakeZfs`] simulates the `zfs` and `udevadm` commands over an in-memory
//! dataset table. [`MemoryFabric`] is an in-memory target subsystem. Both
//! can append to a shared [`Journal`] so tests can assert on the interleaving
//! of volume and target operations.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::command::{render, CommandOutput, CommandRunner};
use crate::error::{ProvisionError, ProvisionResult};
use crate::iscsi::fabric::*;

/// Ordered record of operations shared between fakes
pub type Journal = Arc<Mutex<Vec<String>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Filesystem,
    Volume,
    Snapshot,
}

#[derive(Default)]
struct ZfsState {
    datasets: BTreeMap<String, Kind>,
    calls: Vec<String>,
    mutations: usize,
    failing_programs: BTreeSet<String>,
    failing_subcommands: BTreeMap<String, String>,
}

/// Simulated `zfs` + `udevadm`
#[derive(Clone)]
pub struct FakeZfs {
    state: Arc<Mutex<ZfsState>>,
    journal: Journal,
}

impl FakeZfs {
    pub fn new() -> Self {
        Self::sharing(Journal::default())
    }

    pub fn sharing(journal: Journal) -> Self {
        Self {
            state: Arc::default(),
            journal,
        }
    }

    pub fn with_datasets(names: &[&str]) -> Self {
        let fake = Self::new();
        for name in names {
            fake.add_dataset(name);
        }
        fake
    }

    pub fn add_dataset(&self, name: &str) {
        lock(&self.state)
            .datasets
            .insert(name.to_string(), kind_of(name));
    }

    pub fn has_dataset(&self, name: &str) -> bool {
        lock(&self.state).datasets.contains_key(name)
    }

    /// Every command line run so far
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Number of zfs commands that would modify datasets
    pub fn mutations(&self) -> usize {
        lock(&self.state).mutations
    }

    /// Make every run of `program` exit 1
    pub fn fail_program(&self, program: &str) {
        lock(&self.state).failing_programs.insert(program.to_string());
    }

    /// Make `zfs <subcommand>` exit 1 with `message` on stderr
    pub fn fail_subcommand(&self, subcommand: &str, message: &str) {
        lock(&self.state)
            .failing_subcommands
            .insert(subcommand.to_string(), message.to_string());
    }

    fn zfs(state: &mut ZfsState, args: &[String]) -> CommandOutput {
        let Some(subcommand) = args.first().map(String::as_str) else {
            return failure("missing command");
        };

        if let Some(message) = state.failing_subcommands.get(subcommand) {
            return failure(message);
        }

        match subcommand {
            "list" => {
                let filter = flag_value(args, "-t").unwrap_or("all");
                let mut out = String::from("NAME AVAIL REFER USED MOUNTPOINT\n");
                for (name, kind) in &state.datasets {
                    let listed = match filter {
                        "all" => true,
                        "filesystem" => *kind == Kind::Filesystem,
                        "volume" => *kind == Kind::Volume,
                        "snapshot" | "snap" => *kind == Kind::Snapshot,
                        _ => false,
                    };
                    if listed {
                        let mountpoint = if *kind == Kind::Filesystem {
                            format!("/{}", name)
                        } else {
                            "-".to_string()
                        };
                        out.push_str(&format!("{} 10G 1G 1G {}\n", name, mountpoint));
                    }
                }
                CommandOutput::ok(out)
            }
            "get" => {
                let mut out = String::from("NAME PROPERTY VALUE SOURCE\n");
                for (name, kind) in &state.datasets {
                    let kind = match kind {
                        Kind::Filesystem => "filesystem",
                        Kind::Volume => "volume",
                        Kind::Snapshot => "snapshot",
                    };
                    out.push_str(&format!("{} type {} -\n", name, kind));
                }
                CommandOutput::ok(out)
            }
            "create" => {
                state.mutations += 1;
                let name = args.last().cloned().unwrap_or_default();
                if state.datasets.contains_key(&name) {
                    return failure(&format!("cannot create '{}': dataset already exists", name));
                }
                let kind = if args.iter().any(|a| a == "-V") {
                    Kind::Volume
                } else {
                    Kind::Filesystem
                };
                state.datasets.insert(name, kind);
                CommandOutput::ok("")
            }
            "clone" => {
                state.mutations += 1;
                let [.., snapshot, dest] = args else {
                    return failure("usage: clone snapshot dest");
                };
                if !state.datasets.contains_key(snapshot) {
                    return failure(&format!("cannot open '{}': dataset does not exist", snapshot));
                }
                if state.datasets.contains_key(dest) {
                    return failure(&format!("cannot create '{}': dataset already exists", dest));
                }
                let origin = snapshot.split('@').next().unwrap_or_default();
                let kind = match state.datasets.get(origin) {
                    Some(Kind::Volume) => Kind::Volume,
                    _ => Kind::Filesystem,
                };
                state.datasets.insert(dest.clone(), kind);
                CommandOutput::ok("")
            }
            "snapshot" => {
                state.mutations += 1;
                let name = args.last().cloned().unwrap_or_default();
                state.datasets.insert(name, Kind::Snapshot);
                CommandOutput::ok("")
            }
            "destroy" => {
                state.mutations += 1;
                let name = args.last().cloned().unwrap_or_default();
                if state.datasets.remove(&name).is_none() {
                    return failure(&format!("cannot open '{}': dataset does not exist", name));
                }
                CommandOutput::ok("")
            }
            "set" => {
                state.mutations += 1;
                CommandOutput::ok("")
            }
            other => failure(&format!("unrecognized command '{}'", other)),
        }
    }
}

impl Default for FakeZfs {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for FakeZfs {
    fn run(&self, program: &str, args: &[String]) -> ProvisionResult<CommandOutput> {
        let line = render(program, args);
        let mut state = lock(&self.state);
        state.calls.push(line.clone());
        lock(&self.journal).push(line);

        if state.failing_programs.contains(program) {
            return Ok(failure("simulated failure"));
        }

        if program.ends_with("zfs") {
            Ok(Self::zfs(&mut *state, args))
        } else {
            Ok(CommandOutput::ok(""))
        }
    }
}

fn kind_of(name: &str) -> Kind {
    if name.contains('@') {
        Kind::Snapshot
    } else {
        Kind::Filesystem
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn failure(message: &str) -> CommandOutput {
    CommandOutput {
        code: Some(1),
        stdout: String::new(),
        stderr: message.to_string(),
    }
}

#[derive(Default)]
struct MemoryTpg {
    attributes: BTreeMap<String, String>,
    enabled: bool,
    /// lun index -> block store name
    luns: BTreeMap<u32, String>,
    portals: BTreeSet<(String, u16)>,
    /// initiator -> mapped index -> tpg lun index
    acls: BTreeMap<String, BTreeMap<u32, u32>>,
}

#[derive(Default)]
struct FabricState {
    stores: BTreeMap<String, String>,
    targets: BTreeMap<String, BTreeMap<u16, MemoryTpg>>,
    mutations: usize,
    fail_once: VecDeque<String>,
}

/// In-memory target subsystem
pub struct MemoryFabric {
    state: Mutex<FabricState>,
    journal: Journal,
}

impl Default for MemoryFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self::sharing(Journal::default())
    }

    pub fn sharing(journal: Journal) -> Self {
        Self {
            state: Mutex::default(),
            journal,
        }
    }

    /// Number of mutating calls received, successful or not
    pub fn mutations(&self) -> usize {
        lock(&self.state).mutations
    }

    /// Make the next call to `operation` fail
    pub fn fail_once(&self, operation: &str) {
        lock(&self.state).fail_once.push_back(operation.to_string());
    }

    pub fn tpg_enabled(&self, wwn: &str, tag: u16) -> bool {
        lock(&self.state)
            .targets
            .get(wwn)
            .and_then(|tpgs| tpgs.get(&tag))
            .is_some_and(|tpg| tpg.enabled)
    }

    pub fn tpg_attribute(&self, wwn: &str, tag: u16, name: &str) -> Option<String> {
        lock(&self.state)
            .targets
            .get(wwn)?
            .get(&tag)?
            .attributes
            .get(name)
            .cloned()
    }

    /// Record a mutation and apply it to the state
    fn mutate<T>(
        &self,
        operation: &str,
        detail: String,
        apply: impl FnOnce(&mut FabricState) -> Result<T, String>,
    ) -> ProvisionResult<T> {
        let mut state = lock(&self.state);
        state.mutations += 1;
        lock(&self.journal).push(format!("fabric {} {}", operation, detail));

        let rejected = |message: String| ProvisionError::BackendState {
            operation: format!("{} {}", operation, detail),
            message,
        };

        if let Some(pos) = state.fail_once.iter().position(|op| op == operation) {
            state.fail_once.remove(pos);
            return Err(rejected("simulated failure".to_string()));
        }

        apply(&mut *state).map_err(rejected)
    }

    fn read<T>(&self, f: impl FnOnce(&FabricState) -> T) -> ProvisionResult<T> {
        Ok(f(&*lock(&self.state)))
    }
}

fn tpg_mut<'a>(state: &'a mut FabricState, tpg: &TpgHandle) -> Result<&'a mut MemoryTpg, String> {
    state
        .targets
        .get_mut(&tpg.wwn)
        .and_then(|tpgs| tpgs.get_mut(&tpg.tag))
        .ok_or_else(|| format!("no tpg {}", tpg))
}

fn tpg_ref<'a>(state: &'a FabricState, tpg: &TpgHandle) -> Option<&'a MemoryTpg> {
    state.targets.get(&tpg.wwn)?.get(&tpg.tag)
}

impl TargetFabric for MemoryFabric {
    fn block_stores(&self) -> ProvisionResult<Vec<BlockStoreHandle>> {
        self.read(|s| {
            s.stores
                .iter()
                .map(|(name, device)| BlockStoreHandle {
                    name: name.clone(),
                    device: device.clone(),
                })
                .collect()
        })
    }

    fn targets(&self) -> ProvisionResult<Vec<TargetHandle>> {
        self.read(|s| {
            s.targets
                .keys()
                .map(|wwn| TargetHandle { wwn: wwn.clone() })
                .collect()
        })
    }

    fn tpgs(&self, target: &TargetHandle) -> ProvisionResult<Vec<TpgHandle>> {
        self.read(|s| {
            s.targets
                .get(&target.wwn)
                .map(|tpgs| {
                    tpgs.keys()
                        .map(|tag| TpgHandle {
                            wwn: target.wwn.clone(),
                            tag: *tag,
                        })
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    fn luns(&self, tpg: &TpgHandle) -> ProvisionResult<Vec<LunHandle>> {
        self.read(|s| {
            tpg_ref(s, tpg)
                .map(|t| {
                    t.luns
                        .iter()
                        .map(|(index, storage)| LunHandle {
                            tpg: tpg.clone(),
                            index: *index,
                            storage: storage.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    fn portals(&self, tpg: &TpgHandle) -> ProvisionResult<Vec<PortalHandle>> {
        self.read(|s| {
            tpg_ref(s, tpg)
                .map(|t| {
                    t.portals
                        .iter()
                        .map(|(ip, port)| PortalHandle {
                            tpg: tpg.clone(),
                            ip: ip.clone(),
                            port: *port,
                        })
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    fn acls(&self, tpg: &TpgHandle) -> ProvisionResult<Vec<AclHandle>> {
        self.read(|s| {
            tpg_ref(s, tpg)
                .map(|t| {
                    t.acls
                        .keys()
                        .map(|initiator| AclHandle {
                            tpg: tpg.clone(),
                            initiator: initiator.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    fn mapped_luns(&self, acl: &AclHandle) -> ProvisionResult<Vec<MappedLunHandle>> {
        self.read(|s| {
            tpg_ref(s, &acl.tpg)
                .and_then(|t| t.acls.get(&acl.initiator))
                .map(|mapped| {
                    mapped
                        .iter()
                        .map(|(index, tpg_lun)| MappedLunHandle {
                            acl: acl.clone(),
                            index: *index,
                            tpg_lun: *tpg_lun,
                        })
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    fn create_block_store(&self, name: &str, device: &str) -> ProvisionResult<BlockStoreHandle> {
        self.mutate("create_block_store", format!("{} {}", name, device), |s| {
            if s.stores.contains_key(name) {
                return Err("storage object already exists".to_string());
            }
            s.stores.insert(name.to_string(), device.to_string());
            Ok(BlockStoreHandle {
                name: name.to_string(),
                device: device.to_string(),
            })
        })
    }

    fn delete_block_store(&self, store: &BlockStoreHandle) -> ProvisionResult<()> {
        self.mutate("delete_block_store", store.name.clone(), |s| {
            let in_use = s
                .targets
                .values()
                .flat_map(|tpgs| tpgs.values())
                .any(|tpg| tpg.luns.values().any(|name| *name == store.name));
            if in_use {
                return Err("storage object is in use".to_string());
            }
            s.stores.remove(&store.name);
            Ok(())
        })
    }

    fn create_target(&self, wwn: &str) -> ProvisionResult<TargetHandle> {
        self.mutate("create_target", wwn.to_string(), |s| {
            if s.targets.contains_key(wwn) {
                return Err("target already exists".to_string());
            }
            s.targets.insert(wwn.to_string(), BTreeMap::new());
            Ok(TargetHandle {
                wwn: wwn.to_string(),
            })
        })
    }

    fn delete_target(&self, target: &TargetHandle) -> ProvisionResult<()> {
        self.mutate("delete_target", target.wwn.clone(), |s| {
            s.targets
                .remove(&target.wwn)
                .map(|_| ())
                .ok_or_else(|| "no such target".to_string())
        })
    }

    fn create_tpg(&self, target: &TargetHandle, tag: u16) -> ProvisionResult<TpgHandle> {
        self.mutate("create_tpg", format!("{} {}", target.wwn, tag), |s| {
            let tpgs = s
                .targets
                .get_mut(&target.wwn)
                .ok_or_else(|| "no such target".to_string())?;
            if tpgs.contains_key(&tag) {
                return Err("tpg already exists".to_string());
            }
            tpgs.insert(tag, MemoryTpg::default());
            Ok(TpgHandle {
                wwn: target.wwn.clone(),
                tag,
            })
        })
    }

    fn delete_tpg(&self, tpg: &TpgHandle) -> ProvisionResult<()> {
        self.mutate("delete_tpg", tpg.to_string(), |s| {
            s.targets
                .get_mut(&tpg.wwn)
                .and_then(|tpgs| tpgs.remove(&tpg.tag))
                .map(|_| ())
                .ok_or_else(|| "no such tpg".to_string())
        })
    }

    fn set_tpg_attribute(&self, tpg: &TpgHandle, name: &str, value: &str) -> ProvisionResult<()> {
        self.mutate("set_tpg_attribute", format!("{} {}={}", tpg, name, value), |s| {
            tpg_mut(s, tpg)?
                .attributes
                .insert(name.to_string(), value.to_string());
            Ok(())
        })
    }

    fn enable_tpg(&self, tpg: &TpgHandle) -> ProvisionResult<()> {
        self.mutate("enable_tpg", tpg.to_string(), |s| {
            tpg_mut(s, tpg)?.enabled = true;
            Ok(())
        })
    }

    fn create_lun(
        &self,
        tpg: &TpgHandle,
        index: u32,
        store: &BlockStoreHandle,
    ) -> ProvisionResult<LunHandle> {
        self.mutate("create_lun", format!("{} {} {}", tpg, index, store.name), |s| {
            if !s.stores.contains_key(&store.name) {
                return Err(format!("no storage object {}", store.name));
            }
            let t = tpg_mut(s, tpg)?;
            if t.luns.contains_key(&index) {
                return Err(format!("lun {} already exists", index));
            }
            t.luns.insert(index, store.name.clone());
            Ok(LunHandle {
                tpg: tpg.clone(),
                index,
                storage: store.name.clone(),
            })
        })
    }

    fn delete_lun(&self, lun: &LunHandle) -> ProvisionResult<()> {
        self.mutate("delete_lun", lun.to_string(), |s| {
            tpg_mut(s, &lun.tpg)?.luns.remove(&lun.index);
            Ok(())
        })
    }

    fn create_portal(&self, tpg: &TpgHandle, ip: &str, port: u16) -> ProvisionResult<PortalHandle> {
        self.mutate("create_portal", format!("{} {}", tpg, portal_id(ip, port)), |s| {
            if !tpg_mut(s, tpg)?.portals.insert((ip.to_string(), port)) {
                return Err("portal already exists".to_string());
            }
            Ok(PortalHandle {
                tpg: tpg.clone(),
                ip: ip.to_string(),
                port,
            })
        })
    }

    fn delete_portal(&self, portal: &PortalHandle) -> ProvisionResult<()> {
        self.mutate("delete_portal", portal.id(), |s| {
            tpg_mut(s, &portal.tpg)?
                .portals
                .remove(&(portal.ip.clone(), portal.port));
            Ok(())
        })
    }

    fn create_acl(&self, tpg: &TpgHandle, initiator: &str) -> ProvisionResult<AclHandle> {
        self.mutate("create_acl", format!("{} {}", tpg, initiator), |s| {
            let t = tpg_mut(s, tpg)?;
            if t.acls.contains_key(initiator) {
                return Err("acl already exists".to_string());
            }
            t.acls.insert(initiator.to_string(), BTreeMap::new());
            Ok(AclHandle {
                tpg: tpg.clone(),
                initiator: initiator.to_string(),
            })
        })
    }

    fn delete_acl(&self, acl: &AclHandle) -> ProvisionResult<()> {
        self.mutate("delete_acl", acl.to_string(), |s| {
            tpg_mut(s, &acl.tpg)?.acls.remove(&acl.initiator);
            Ok(())
        })
    }

    fn create_mapped_lun(
        &self,
        acl: &AclHandle,
        index: u32,
        lun: &LunHandle,
    ) -> ProvisionResult<MappedLunHandle> {
        self.mutate("create_mapped_lun", format!("{} {} {}", acl, index, lun.index), |s| {
            let t = tpg_mut(s, &acl.tpg)?;
            if !t.luns.contains_key(&lun.index) {
                return Err(format!("no lun {}", lun.index));
            }
            let mapped = t
                .acls
                .get_mut(&acl.initiator)
                .ok_or_else(|| format!("no acl {}", acl.initiator))?;
            if mapped.contains_key(&index) {
                return Err(format!("mapped lun {} already exists", index));
            }
            mapped.insert(index, lun.index);
            Ok(MappedLunHandle {
                acl: acl.clone(),
                index,
                tpg_lun: lun.index,
            })
        })
    }

    fn delete_mapped_lun(&self, mapped: &MappedLunHandle) -> ProvisionResult<()> {
        self.mutate("delete_mapped_lun", mapped.acl.to_string(), |s| {
            if let Some(luns) = tpg_mut(s, &mapped.acl.tpg)?.acls.get_mut(&mapped.acl.initiator) {
                luns.remove(&mapped.index);
            }
            Ok(())
        })
    }
}
