//! Boot LUN provisioning for diskless nodes
//!
//! Clones a golden ZFS snapshot into a per-node zvol and exports it over
//! iSCSI through the Linux kernel target. The pieces are usable on their own:
//! a ZFS volume backend, a udev settle gate, a target registry and manager
//! over configfs, an orchestrator that sequences them, and an image prep
//! step that customizes a freshly exported LUN for its node.

pub mod api;
pub mod command;
pub mod config;
pub mod error;
pub mod iscsi;
pub mod prep;
pub mod provision;
pub mod settle;
pub mod zfs;

#[cfg(test)]
pub(crate) mod testing;

pub use command::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{Config, ConfigError};
pub use error::{ProvisionError, ProvisionResult};
pub use prep::{LunPrep, PrepCommands, PrepRequest};
pub use provision::{CloneEntry, CloneRequest, Provisioner, ReleaseEntry, ReleaseRequest, WwnLocks};
pub use settle::UdevSettle;
pub use zfs::Zfs;
