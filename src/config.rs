//! Configuration file parsing
//!
//! Parses TOML configuration files for the provisioning service. Every
//! section is optional; an empty file yields the defaults.

use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use thiserror::Error;

use crate::iscsi::{Portal, RollbackPolicy, DEFAULT_CONFIGFS_ROOT, DEFAULT_PORTAL_IP, DEFAULT_PORTAL_PORT};
use crate::prep::PrepCommands;
use crate::settle::DEFAULT_UDEVADM;
use crate::zfs::DEFAULT_ZFS;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Service configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings
    pub server: ServerConfig,

    /// Volume backend settings
    pub zfs: ZfsConfig,

    /// Device settle settings
    pub udev: UdevConfig,

    /// Target subsystem settings
    pub target: TargetConfig,

    /// Orchestration settings
    pub provisioning: ProvisioningConfig,

    /// Image preparation tools
    pub prep: PrepCommands,
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind: String,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Volume backend settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ZfsConfig {
    /// Path to the zfs binary
    pub command: String,

    /// Directory holding zvol device nodes
    pub device_root: String,
}

impl Default for ZfsConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_ZFS.to_string(),
            device_root: "/dev/zvol".to_string(),
        }
    }
}

/// Device settle settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UdevConfig {
    /// Path to the udevadm binary
    pub command: String,
}

impl Default for UdevConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_UDEVADM.to_string(),
        }
    }
}

/// Target subsystem settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// configfs mount point of the kernel target
    pub configfs_root: String,

    /// Address new portals listen on
    pub portal_ip: String,

    /// Port new portals listen on
    pub portal_port: u16,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            configfs_root: DEFAULT_CONFIGFS_ROOT.to_string(),
            portal_ip: DEFAULT_PORTAL_IP.to_string(),
            portal_port: DEFAULT_PORTAL_PORT,
        }
    }
}

impl TargetConfig {
    /// Portal handed to the target manager
    pub fn portal(&self) -> Portal {
        Portal {
            ip: self.portal_ip.clone(),
            port: self.portal_port,
        }
    }
}

/// Orchestration settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Cleanup behaviour when an export fails part way
    pub rollback: RollbackPolicy,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed listen address
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad bind address {:?}", self.server.bind)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("zfs.command", &self.zfs.command),
            ("zfs.device_root", &self.zfs.device_root),
            ("udev.command", &self.udev.command),
            ("target.configfs_root", &self.target.configfs_root),
            ("prep.iscsiadm", &self.prep.iscsiadm),
            ("prep.mount", &self.prep.mount),
            ("prep.umount", &self.prep.umount),
            ("prep.chroot", &self.prep.chroot),
            ("prep.prep_image", &self.prep.prep_image),
            ("prep.mount_base", &self.prep.mount_base),
        ];
        for (key, value) in required {
            if value.is_empty() {
                return Err(ConfigError::Invalid(format!("{} must not be empty", key)));
            }
        }

        self.bind_addr()?;

        if self.target.portal_ip.parse::<IpAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "bad portal address {:?}",
                self.target.portal_ip
            )));
        }

        if self.target.portal_port == 0 {
            return Err(ConfigError::Invalid("portal_port must not be 0".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_empty_config() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.zfs.command, "/sbin/zfs");
        assert_eq!(config.zfs.device_root, "/dev/zvol");
        assert_eq!(config.udev.command, "/usr/sbin/udevadm");
        assert_eq!(config.target.configfs_root, "/sys/kernel/config/target");
        assert_eq!(config.target.portal(), Portal::default());
        assert_eq!(config.provisioning.rollback, RollbackPolicy::BestEffort);
        assert_eq!(config.prep, PrepCommands::default());
        assert_eq!(config.prep.mount_base, "/mnt/images");
    }

    #[test]
    fn test_parse_full_config() {
        let config_str = r#"
[server]
bind = "127.0.0.1:9000"
log_level = "debug"

[zfs]
command = "/usr/local/sbin/zfs"
device_root = "/dev/zd"

[udev]
command = "/bin/udevadm"

[target]
configfs_root = "/tmp/target"
portal_ip = "10.0.0.5"
portal_port = 3261

[provisioning]
rollback = "strict"

[prep]
iscsiadm = "/sbin/iscsiadm"
mount_base = "/srv/images"
"#;

        let config = Config::parse(config_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.bind_addr().unwrap().port(), 9000);
        assert_eq!(config.zfs.device_root, "/dev/zd");
        assert_eq!(config.udev.command, "/bin/udevadm");
        assert_eq!(config.target.portal().ip, "10.0.0.5");
        assert_eq!(config.target.portal().port, 3261);
        assert_eq!(config.provisioning.rollback, RollbackPolicy::Strict);
        assert_eq!(config.prep.iscsiadm, "/sbin/iscsiadm");
        assert_eq!(config.prep.mount_base, "/srv/images");
        assert_eq!(config.prep.chroot, "/usr/sbin/chroot");
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let config = Config::parse("[target]\nportal_port = 3270\n").unwrap();
        assert_eq!(config.target.portal_port, 3270);
        assert_eq!(config.target.portal_ip, "0.0.0.0");
    }

    #[test]
    fn test_invalid_values() {
        for config_str in [
            "[server]\nbind = \"nowhere\"\n",
            "[target]\nportal_ip = \"not-an-ip\"\n",
            "[target]\nportal_port = 0\n",
            "[zfs]\ncommand = \"\"\n",
            "[prep]\nmount_base = \"\"\n",
        ] {
            let result = Config::parse(config_str);
            assert!(matches!(result, Err(ConfigError::Invalid(_))), "{}", config_str);
        }
    }

    #[test]
    fn test_unknown_rollback_policy() {
        let result = Config::parse("[provisioning]\nrollback = \"sometimes\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nlog_level = \"warn\"").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.log_level, "warn");
    }
}
