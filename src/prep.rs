//! Boot image preparation
//!
//! A freshly cloned boot LUN still carries the golden image's identity.
//! Preparing it logs this host into the new target, mounts the root
//! partition, and runs the image's own `prep_image.py` inside a chroot with
//! the node's network and console settings. Everything is torn down again
//! afterwards, including when a step fails.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::command::CommandRunner;
use crate::error::{missing_fields, present, ProvisionError, ProvisionResult};
use crate::iscsi::DEFAULT_PORTAL_PORT;
use crate::settle::UdevSettle;

/// Directories bind-mounted into the image before the chroot runs
const BIND_MOUNTS: [&str; 3] = ["sys", "proc", "dev"];

/// udev's stable names for iSCSI disks
const BY_PATH: &str = "/dev/disk/by-path";

/// Host tools used while preparing an image
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PrepCommands {
    pub iscsiadm: String,
    pub mount: String,
    pub umount: String,
    pub chroot: String,
    /// Prep script, as seen from inside the image
    pub prep_image: String,
    /// Images are mounted at `<mount_base>/<wwn>`
    pub mount_base: String,
}

impl Default for PrepCommands {
    fn default() -> Self {
        Self {
            iscsiadm: "/usr/sbin/iscsiadm".to_string(),
            mount: "/usr/bin/mount".to_string(),
            umount: "/usr/bin/umount".to_string(),
            chroot: "/usr/sbin/chroot".to_string(),
            prep_image: "/usr/local/sbin/prep_image.py".to_string(),
            mount_base: "/mnt/images".to_string(),
        }
    }
}

/// Prepare the image on an exported boot LUN
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrepRequest {
    /// Portal address of the target
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub wwn: Option<String>,
    pub lun: Option<u32>,
    /// Partition holding the root filesystem
    pub part: Option<u32>,
    /// Initiator name the node will boot with
    pub initiator_name: Option<String>,
    pub fqdn: Option<String>,
    pub ctrl_iface: Option<String>,
    pub ctrl_mac: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub console_port: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub console_speed: Option<String>,
    pub console_params: Option<String>,
}

/// Accept `"19200"` as well as `19200`
fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a string or number, got {}",
            other
        ))),
    }
}

impl PrepRequest {
    pub fn validate(&self) -> ProvisionResult<()> {
        missing_fields(&[
            ("ip", present(&self.ip)),
            ("wwn", present(&self.wwn)),
            ("initiator_name", present(&self.initiator_name)),
            ("fqdn", present(&self.fqdn)),
            ("ctrl_iface", present(&self.ctrl_iface)),
            ("ctrl_mac", present(&self.ctrl_mac)),
            ("console_port", present(&self.console_port)),
            ("console_speed", present(&self.console_speed)),
            ("console_params", present(&self.console_params)),
        ])
    }
}

/// Validated view of a [`PrepRequest`] with defaults filled in
struct Node<'a> {
    name: &'a str,
    ip: &'a str,
    port: u16,
    wwn: &'a str,
    lun: u32,
    part: u32,
    request: &'a PrepRequest,
}

impl<'a> Node<'a> {
    fn new(request: &'a PrepRequest) -> ProvisionResult<Self> {
        request.validate()?;
        let fqdn = value(&request.fqdn);
        Ok(Self {
            name: fqdn.split('.').next().unwrap_or(fqdn),
            ip: value(&request.ip),
            port: request.port.unwrap_or(DEFAULT_PORTAL_PORT),
            wwn: value(&request.wwn),
            lun: request.lun.unwrap_or(0),
            part: request.part.unwrap_or(1),
            request,
        })
    }

    fn portal(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Root partition as udev names it once the session is up
    fn device(&self) -> String {
        format!(
            "{}/ip-{}-iscsi-{}-lun-{}-part{}",
            BY_PATH,
            self.portal(),
            self.wwn,
            self.lun,
            self.part
        )
    }

    fn prep_args(&self) -> Vec<String> {
        let r = self.request;
        let port = self.port.to_string();
        [
            ("initiator-name", value(&r.initiator_name)),
            ("target-ip", self.ip),
            ("target-port", port.as_str()),
            ("target-wwn", self.wwn),
            ("ctrl-iface", value(&r.ctrl_iface)),
            ("ctrl-mac", value(&r.ctrl_mac)),
            ("console-port", value(&r.console_port)),
            ("console-speed", value(&r.console_speed)),
            ("console-params", value(&r.console_params)),
        ]
        .iter()
        .map(|(key, val)| format!("--{}={}", key, val))
        .collect()
    }
}

fn value(field: &Option<String>) -> &str {
    field.as_deref().unwrap_or_default()
}

/// Something set up during a prep run that has to be undone
#[derive(Debug)]
enum Step {
    NodeRecord,
    Session,
    Mount(PathBuf),
}

/// Runs the prep sequence against a host's initiator tools
#[derive(Debug)]
pub struct LunPrep<R> {
    runner: R,
    settle: UdevSettle,
    commands: PrepCommands,
}

impl<R: CommandRunner> LunPrep<R> {
    pub fn new(runner: R, settle: UdevSettle, commands: PrepCommands) -> Self {
        Self {
            runner,
            settle,
            commands,
        }
    }

    /// Mount point of the image for `wwn`
    pub fn chroot_dir(&self, wwn: &str) -> PathBuf {
        Path::new(&self.commands.mount_base).join(wwn)
    }

    /// Log in, mount, run the image's prep script, then undo it all.
    ///
    /// The node record is created with manual startup so a leftover record
    /// never logs in again on reboot.
    pub fn prep(&self, request: &PrepRequest) -> ProvisionResult<()> {
        let node = Node::new(request)?;
        log::info!("{}: preparing {} on {}", node.name, node.wwn, node.portal());

        let mut done = Vec::new();
        match self.setup(&node, &mut done) {
            Ok(()) => {
                self.teardown(&node, done)?;
                log::info!("{}: image prepared", node.name);
                Ok(())
            }
            Err(e) => {
                log::error!("{}: prep failed: {}", node.name, e);
                if let Err(cleanup) = self.teardown(&node, done) {
                    log::warn!("{}: cleanup after failed prep: {}", node.name, cleanup);
                }
                Err(e)
            }
        }
    }

    fn setup(&self, node: &Node<'_>, done: &mut Vec<Step>) -> ProvisionResult<()> {
        self.iscsiadm(node, &["-o", "new"])?;
        done.push(Step::NodeRecord);
        self.iscsiadm(node, &["-o", "update", "-n", "node.startup", "-v", "manual"])?;
        self.iscsiadm(node, &["-o", "update", "-n", "node.conn[0].startup", "-v", "manual"])?;

        self.iscsiadm(node, &["-l"])?;
        done.push(Step::Session);
        self.settle.settle(&self.runner)?;

        let chroot = self.chroot_dir(node.wwn);
        self.mount_image(node, &chroot, done)?;
        for dir in BIND_MOUNTS {
            let source = format!("/{}", dir);
            let dest = chroot.join(dir);
            let target = display(&dest);
            self.run(&self.commands.mount, &["-o", "bind", source.as_str(), target.as_str()])?;
            done.push(Step::Mount(dest));
        }

        let mut args = vec![display(&chroot), self.commands.prep_image.clone()];
        args.extend(node.prep_args());
        log::info!("{}: running {} in {}", node.name, self.commands.prep_image, chroot.display());
        self.runner.run_checked(&self.commands.chroot, &args)?;
        Ok(())
    }

    fn mount_image(&self, node: &Node<'_>, chroot: &Path, done: &mut Vec<Step>) -> ProvisionResult<()> {
        if chroot.is_file() {
            return Err(ProvisionError::InvalidState(format!(
                "{} is a file, cannot mount {} there",
                chroot.display(),
                node.device()
            )));
        }
        fs::create_dir_all(chroot).map_err(|e| {
            ProvisionError::InvalidState(format!("cannot create {}: {}", chroot.display(), e))
        })?;

        // Left behind by an earlier run that died; reuse it.
        if is_mount(chroot) {
            log::info!("{}: {} already mounted", node.name, chroot.display());
        } else {
            let (device, target) = (node.device(), display(chroot));
            self.run(&self.commands.mount, &[device.as_str(), target.as_str()])?;
        }
        done.push(Step::Mount(chroot.to_path_buf()));
        Ok(())
    }

    /// Undo `done` in reverse. Every step is attempted; the first error wins.
    fn teardown(&self, node: &Node<'_>, done: Vec<Step>) -> ProvisionResult<()> {
        let mut first = None;
        for step in done.into_iter().rev() {
            let result = match &step {
                Step::Mount(path) => self.run(&self.commands.umount, &[display(path).as_str()]),
                Step::Session => self.iscsiadm(node, &["-u"]),
                Step::NodeRecord => self.iscsiadm(node, &["-o", "delete"]),
            };
            if let Err(e) = result {
                log::warn!("{}: undo {:?} failed: {}", node.name, step, e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn iscsiadm(&self, node: &Node<'_>, extra: &[&str]) -> ProvisionResult<()> {
        let portal = node.portal();
        let mut args = vec!["-m", "node", "-T", node.wwn, "-p", portal.as_str()];
        args.extend_from_slice(extra);
        self.run(&self.commands.iscsiadm, &args)
    }

    fn run(&self, program: &str, args: &[&str]) -> ProvisionResult<()> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runner.run_checked(program, &args).map(|_| ())
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// True if `path` is the root of a mounted filesystem
fn is_mount(path: &Path) -> bool {
    let (Ok(meta), Some(parent)) = (fs::metadata(path), path.parent()) else {
        return false;
    };
    match fs::metadata(parent) {
        Ok(up) => meta.dev() != up.dev() || meta.ino() == up.ino(),
        Err(_) => false,
    }
}
