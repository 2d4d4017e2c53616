//! ZFS volume backend
//!
//! Idempotent wrappers over the `zfs` command. Existence checks use a listing
//! cached on the backend instance; a create for a name already present is
//! logged and skipped rather than sent to `zfs` to fail.
//!
//! The cache is never invalidated behind the caller's back. Callers that need
//! fresh data call [`Zfs::refresh`].

mod parse;

pub use parse::{parse_attributes, parse_list, AttributeMap, Dataset, DatasetMap, PropertyValue};

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

use crate::command::CommandRunner;
use crate::error::{ProvisionError, ProvisionResult};
use crate::settle::UdevSettle;
use parse::LIST_COLUMNS;

/// Default zfs binary
pub const DEFAULT_ZFS: &str = "/sbin/zfs";

/// Dataset properties passed as `-o key=value`
pub type Properties = BTreeMap<String, String>;

/// Dataset type filter for `zfs list -t`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    All,
    Filesystem,
    Volume,
    Snapshot,
    Bookmark,
}

impl ListKind {
    fn as_arg(self) -> &'static str {
        match self {
            ListKind::All => "all",
            ListKind::Filesystem => "filesystem",
            ListKind::Volume => "volume",
            ListKind::Snapshot => "snapshot",
            ListKind::Bookmark => "bookmark",
        }
    }
}

/// Block volume parameters for `zfs create -V`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolumeSpec {
    /// Volume size, e.g. "10G"
    pub size: Option<String>,
    /// Thin-provision the volume (`-s`)
    #[serde(default)]
    pub sparse: bool,
}

/// Whether an idempotent operation changed anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Changed,
    Unchanged,
}

impl Outcome {
    pub fn changed(self) -> bool {
        self == Outcome::Changed
    }
}

/// ZFS dataset manager
pub struct Zfs<R> {
    runner: R,
    zfs: String,
    settle: UdevSettle,
    listings: HashMap<ListKind, DatasetMap>,
    attributes: Option<AttributeMap>,
}

impl<R: CommandRunner> Zfs<R> {
    pub fn new(runner: R, zfs: impl Into<String>, settle: UdevSettle) -> Self {
        Self {
            runner,
            zfs: zfs.into(),
            settle,
            listings: HashMap::new(),
            attributes: None,
        }
    }

    /// The command runner this backend drives
    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Drop every cached listing
    pub fn refresh(&mut self) {
        self.listings.clear();
        self.attributes = None;
    }

    /// Datasets of the given kind, from cache if already listed
    pub fn list(&mut self, kind: ListKind) -> ProvisionResult<&DatasetMap> {
        if !self.listings.contains_key(&kind) {
            let output = self.run(&[
                "list".to_string(),
                "-t".to_string(),
                kind.as_arg().to_string(),
                "-o".to_string(),
                LIST_COLUMNS.to_string(),
            ])?;
            let datasets = parse_list(&output);
            log::debug!("zfs list -t {}: {} dataset(s)", kind.as_arg(), datasets.len());
            self.listings.insert(kind, datasets);
        }
        Ok(&self.listings[&kind])
    }

    /// Every property of every dataset
    pub fn attributes(&mut self) -> ProvisionResult<&AttributeMap> {
        if self.attributes.is_none() {
            let output = self.run(&["get".to_string(), "all".to_string()])?;
            self.attributes = Some(parse_attributes(&output));
        }
        Ok(self.attributes.get_or_insert_with(AttributeMap::new))
    }

    /// True if a dataset, volume, snapshot or bookmark has this name
    pub fn exists(&mut self, name: &str) -> ProvisionResult<bool> {
        Ok(self.list(ListKind::All)?.contains_key(name))
    }

    /// Create a filesystem, or a block volume when `volume` is given
    pub fn create(
        &mut self,
        name: &str,
        properties: &Properties,
        volume: Option<&VolumeSpec>,
        create_parent: bool,
    ) -> ProvisionResult<Outcome> {
        require(name, "name")?;

        let mut args = vec!["create".to_string()];
        if create_parent {
            args.push("-p".to_string());
        }
        push_properties(&mut args, properties);

        if let Some(volume) = volume {
            let size = volume
                .size
                .as_deref()
                .filter(|size| !size.is_empty())
                .ok_or_else(|| ProvisionError::missing("size"))?;
            args.push("-V".to_string());
            args.push(size.to_string());
            if volume.sparse {
                args.push("-s".to_string());
            }
        }
        args.push(name.to_string());

        if self.exists(name)? {
            let kind = if volume.is_some() { "volume" } else { "filesystem" };
            log::info!("{} already exists. Not creating {}", name, kind);
            return Ok(Outcome::Unchanged);
        }

        self.run(&args)?;
        self.settle()?;
        Ok(Outcome::Changed)
    }

    /// Clone a snapshot into `dest` and wait for its device node
    pub fn clone_snapshot(
        &mut self,
        snapshot: &str,
        dest: &str,
        properties: &Properties,
        create_parent: bool,
    ) -> ProvisionResult<Outcome> {
        let outcome = self.clone_unsettled(snapshot, dest, properties, create_parent)?;
        if outcome.changed() {
            self.settle()?;
        }
        Ok(outcome)
    }

    /// Clone without waiting for udev; the caller must [`Zfs::settle`]
    /// before using the device.
    pub fn clone_unsettled(
        &mut self,
        snapshot: &str,
        dest: &str,
        properties: &Properties,
        create_parent: bool,
    ) -> ProvisionResult<Outcome> {
        require(snapshot, "snapshot")?;
        require(dest, "dest")?;

        if !self.exists(snapshot)? {
            return Err(ProvisionError::InvalidState(format!(
                "Snapshot {} does not exist, clone {} cannot be created",
                snapshot, dest
            )));
        }

        if self.exists(dest)? {
            log::info!("{} already exists. Not creating clone", dest);
            return Ok(Outcome::Unchanged);
        }

        let mut args = vec!["clone".to_string()];
        if create_parent {
            args.push("-p".to_string());
        }
        push_properties(&mut args, properties);
        args.push(snapshot.to_string());
        args.push(dest.to_string());

        self.run(&args)?;
        Ok(Outcome::Changed)
    }

    /// Snapshot a dataset (`pool/fs@name`)
    pub fn snapshot(&mut self, name: &str) -> ProvisionResult<Outcome> {
        require(name, "name")?;

        if self.exists(name)? {
            log::info!("{} already exists. Not creating snapshot", name);
            return Ok(Outcome::Unchanged);
        }

        self.run(&["snapshot".to_string(), name.to_string()])?;
        self.settle()?;
        Ok(Outcome::Changed)
    }

    /// Destroy a dataset.
    ///
    /// Dependent clones are not destroyed; zfs rejects the call if any
    /// remain.
    pub fn destroy(&mut self, name: &str) -> ProvisionResult<Outcome> {
        require(name, "name")?;

        if !self.exists(name)? {
            log::info!("{} does not exist. Cannot destroy", name);
            return Ok(Outcome::Unchanged);
        }

        self.run(&["destroy".to_string(), name.to_string()])?;
        self.settle()?;
        Ok(Outcome::Changed)
    }

    /// Set a single property
    pub fn set(&mut self, name: &str, property: &str, value: &str) -> ProvisionResult<()> {
        require(name, "name")?;
        require(property, "property")?;

        self.run(&[
            "set".to_string(),
            format!("{}={}", property, value),
            name.to_string(),
        ])?;
        Ok(())
    }

    /// Block until udev has processed pending device events
    pub fn settle(&self) -> ProvisionResult<()> {
        self.settle.settle(&self.runner)
    }

    fn run(&self, args: &[String]) -> ProvisionResult<String> {
        Ok(self.runner.run_checked(&self.zfs, args)?.stdout)
    }
}

fn require(value: &str, field: &str) -> ProvisionResult<()> {
    if value.is_empty() {
        Err(ProvisionError::missing(field))
    } else {
        Ok(())
    }
}

fn push_properties(args: &mut Vec<String>, properties: &Properties) {
    for (property, value) in properties {
        args.push("-o".to_string());
        args.push(format!("{}={}", property, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeZfs;

    fn backend(fake: &FakeZfs) -> Zfs<FakeZfs> {
        Zfs::new(fake.clone(), "zfs", UdevSettle::new("udevadm"))
    }

    #[test]
    fn test_create_volume_arguments() {
        let fake = FakeZfs::new();
        let mut zfs = backend(&fake);

        let mut properties = Properties::new();
        properties.insert("compression".to_string(), "lz4".to_string());
        let volume = VolumeSpec {
            size: Some("10G".to_string()),
            sparse: true,
        };

        let outcome = zfs.create("pool/vols/a", &properties, Some(&volume), true).unwrap();
        assert_eq!(outcome, Outcome::Changed);

        let calls = fake.calls();
        assert!(calls.contains(&"zfs create -p -o compression=lz4 -V 10G -s pool/vols/a".to_string()));
        assert_eq!(calls.last().unwrap(), "udevadm settle");
        assert!(fake.has_dataset("pool/vols/a"));
    }

    #[test]
    fn test_create_existing_is_noop() {
        let fake = FakeZfs::with_datasets(&["pool/a"]);
        let mut zfs = backend(&fake);

        let outcome = zfs.create("pool/a", &Properties::new(), None, false).unwrap();
        assert_eq!(outcome, Outcome::Unchanged);
        assert_eq!(fake.mutations(), 0);
    }

    #[test]
    fn test_create_volume_requires_size() {
        let fake = FakeZfs::new();
        let mut zfs = backend(&fake);

        let err = zfs
            .create("pool/a", &Properties::new(), Some(&VolumeSpec::default()), false)
            .unwrap_err();
        assert_eq!(err.to_string(), "Missing parameters: size");
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_missing_name() {
        let fake = FakeZfs::new();
        let mut zfs = backend(&fake);

        assert!(zfs.destroy("").unwrap_err().is_missing_parameter());
        assert!(zfs.snapshot("").unwrap_err().is_missing_parameter());
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_clone_missing_snapshot_is_invalid_state() {
        let fake = FakeZfs::new();
        let mut zfs = backend(&fake);

        let err = zfs
            .clone_snapshot("pool/img@1", "pool/nodeA", &Properties::new(), false)
            .unwrap_err();
        match err {
            ProvisionError::InvalidState(message) => assert!(message.contains("pool/img@1")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fake.mutations(), 0);
    }

    #[test]
    fn test_clone_then_settle() {
        let fake = FakeZfs::with_datasets(&["pool/img", "pool/img@1"]);
        let mut zfs = backend(&fake);

        let outcome = zfs
            .clone_snapshot("pool/img@1", "pool/nodeA", &Properties::new(), false)
            .unwrap();
        assert!(outcome.changed());

        let calls = fake.calls();
        let clone_at = calls
            .iter()
            .position(|c| c == "zfs clone pool/img@1 pool/nodeA")
            .unwrap();
        assert_eq!(calls[clone_at + 1], "udevadm trigger --subsystem-match=block");
        assert_eq!(calls[clone_at + 2], "udevadm settle");
    }

    #[test]
    fn test_clone_existing_dest_is_noop() {
        let fake = FakeZfs::with_datasets(&["pool/img@1", "pool/nodeA"]);
        let mut zfs = backend(&fake);

        let outcome = zfs
            .clone_snapshot("pool/img@1", "pool/nodeA", &Properties::new(), false)
            .unwrap();
        assert_eq!(outcome, Outcome::Unchanged);
        assert_eq!(fake.mutations(), 0);
        assert!(!fake.calls().iter().any(|c| c.starts_with("udevadm")));
    }

    #[test]
    fn test_destroy_absent_is_noop() {
        let fake = FakeZfs::new();
        let mut zfs = backend(&fake);

        assert_eq!(zfs.destroy("pool/ghost").unwrap(), Outcome::Unchanged);
        assert_eq!(fake.mutations(), 0);
    }

    #[test]
    fn test_snapshot_and_destroy() {
        let fake = FakeZfs::with_datasets(&["pool/img"]);
        let mut zfs = backend(&fake);

        assert!(zfs.snapshot("pool/img@2").unwrap().changed());
        assert!(fake.has_dataset("pool/img@2"));

        zfs.refresh();
        assert!(zfs.destroy("pool/img@2").unwrap().changed());
        assert!(!fake.has_dataset("pool/img@2"));
    }

    #[test]
    fn test_listing_is_cached_until_refresh() {
        let fake = FakeZfs::with_datasets(&["pool/a"]);
        let mut zfs = backend(&fake);

        assert_eq!(zfs.list(ListKind::All).unwrap().len(), 1);
        fake.add_dataset("pool/b");
        assert_eq!(zfs.list(ListKind::All).unwrap().len(), 1);
        assert_eq!(fake.count_prefix("zfs list"), 1);

        zfs.refresh();
        assert_eq!(zfs.list(ListKind::All).unwrap().len(), 2);
        assert_eq!(fake.count_prefix("zfs list"), 2);
    }

    #[test]
    fn test_list_by_kind() {
        let fake = FakeZfs::with_datasets(&["pool/img", "pool/img@1"]);
        let mut zfs = backend(&fake);

        let snapshots = zfs.list(ListKind::Snapshot).unwrap();
        assert_eq!(snapshots.keys().collect::<Vec<_>>(), vec!["pool/img@1"]);
    }

    #[test]
    fn test_command_failure_carries_output() {
        let fake = FakeZfs::with_datasets(&["pool/img@1"]);
        fake.fail_subcommand("clone", "cannot create 'pool/x': out of space");
        let mut zfs = backend(&fake);

        let err = zfs
            .clone_snapshot("pool/img@1", "pool/x", &Properties::new(), false)
            .unwrap_err();
        match err {
            ProvisionError::CommandFailed { output, .. } => assert!(output.contains("out of space")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_set_property() {
        let fake = FakeZfs::with_datasets(&["pool/a"]);
        let mut zfs = backend(&fake);

        zfs.set("pool/a", "volsize", "20G").unwrap();
        assert!(fake.calls().contains(&"zfs set volsize=20G pool/a".to_string()));
    }

    #[test]
    fn test_attributes() {
        let fake = FakeZfs::with_datasets(&["pool/a"]);
        let mut zfs = backend(&fake);

        let attributes = zfs.attributes().unwrap();
        assert_eq!(attributes["pool/a"]["type"].value, "filesystem");
    }
}
