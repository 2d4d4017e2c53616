//! Boot LUN clone management CLI
//!
//! Commands:
//! - clone: Clone a snapshot and export it as an iSCSI target
//! - release: Remove an export, optionally destroying its clone
//! - list: List datasets
//! - attributes: Show dataset properties
//! - targets: Show block stores and iSCSI targets
//! - prep: Log in to an exported LUN and run the image prep script in it

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use std::path::PathBuf;

use lun_provision::zfs::{ListKind, Properties};
use lun_provision::{CloneRequest, Config, PrepRequest, Provisioner, ReleaseRequest};

#[derive(Parser)]
#[command(name = "lun-clone")]
#[command(about = "Boot LUN clone management", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone a snapshot and export it
    Clone {
        /// Source snapshot (pool/fs@snap)
        #[arg(short, long)]
        snapshot: String,

        /// Destination dataset
        #[arg(short, long)]
        dest: String,

        /// Target IQN
        #[arg(short, long)]
        wwn: String,

        /// Device to export (default: zvol device of the destination)
        #[arg(long)]
        device: Option<String>,

        /// Initiator allowed to log in (repeatable)
        #[arg(short, long = "initiator")]
        initiators: Vec<String>,

        /// Dataset property as key=value (repeatable)
        #[arg(short = 'o', long = "property", value_parser = parse_property)]
        properties: Vec<(String, String)>,

        /// Create missing parent datasets
        #[arg(short = 'p', long)]
        create_parent: bool,
    },

    /// Remove an export
    Release {
        /// Clone dataset
        #[arg(short, long)]
        name: String,

        /// Target IQN
        #[arg(short, long)]
        wwn: String,

        /// Also destroy the clone
        #[arg(long)]
        delete_clones: bool,

        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// List datasets
    List {
        /// Dataset type
        #[arg(short = 't', long = "type", value_enum, default_value = "all")]
        kind: KindArg,
    },

    /// Show dataset properties
    Attributes {
        /// Only this dataset
        dataset: Option<String>,
    },

    /// Show block stores and iSCSI targets
    Targets,

    /// Prepare the image on an exported LUN
    Prep {
        /// Target portal address
        #[arg(long)]
        ip: String,

        #[arg(long, default_value_t = 3260)]
        port: u16,

        /// Target IQN
        #[arg(short, long)]
        wwn: String,

        #[arg(long, default_value_t = 0)]
        lun: u32,

        /// Partition holding the root filesystem
        #[arg(long, default_value_t = 1)]
        part: u32,

        /// Initiator name the node boots with
        #[arg(long)]
        initiator_name: String,

        #[arg(long)]
        fqdn: String,

        #[arg(long)]
        ctrl_iface: String,

        #[arg(long)]
        ctrl_mac: String,

        #[arg(long)]
        console_port: String,

        #[arg(long)]
        console_speed: String,

        #[arg(long)]
        console_params: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    All,
    Filesystem,
    Volume,
    Snapshot,
    Bookmark,
}

impl From<KindArg> for ListKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::All => ListKind::All,
            KindArg::Filesystem => ListKind::Filesystem,
            KindArg::Volume => ListKind::Volume,
            KindArg::Snapshot => ListKind::Snapshot,
            KindArg::Bookmark => ListKind::Bookmark,
        }
    }
}

fn parse_property(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {:?}", s)),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    env_logger::Builder::from_env(Env::default().default_filter_or(config.server.log_level.as_str()))
        .init();

    let provisioner = Provisioner::from_config(&config)
        .context("Failed to read target subsystem state")?;

    match cli.command {
        Commands::Clone {
            snapshot,
            dest,
            wwn,
            device,
            initiators,
            properties,
            create_parent,
        } => {
            let device = device.unwrap_or_else(|| provisioner.device_path(&dest));
            let request = CloneRequest {
                snapshot: Some(snapshot),
                dest: Some(dest),
                wwn: Some(wwn),
                device: Some(device),
                initiators: Some(initiators),
                properties: Some(properties.into_iter().collect::<Properties>()),
                create_parent: Some(create_parent),
            };
            cmd_clone(&provisioner, request)
        }
        Commands::Release {
            name,
            wwn,
            delete_clones,
            yes,
        } => cmd_release(&provisioner, name, wwn, delete_clones, yes),
        Commands::List { kind } => cmd_list(&provisioner, kind.into()),
        Commands::Attributes { dataset } => cmd_attributes(&provisioner, dataset.as_deref()),
        Commands::Targets => cmd_targets(&provisioner),
        Commands::Prep {
            ip,
            port,
            wwn,
            lun,
            part,
            initiator_name,
            fqdn,
            ctrl_iface,
            ctrl_mac,
            console_port,
            console_speed,
            console_params,
        } => {
            let request = PrepRequest {
                ip: Some(ip),
                port: Some(port),
                wwn: Some(wwn),
                lun: Some(lun),
                part: Some(part),
                initiator_name: Some(initiator_name),
                fqdn: Some(fqdn),
                ctrl_iface: Some(ctrl_iface),
                ctrl_mac: Some(ctrl_mac),
                console_port: Some(console_port),
                console_speed: Some(console_speed),
                console_params: Some(console_params),
            };
            cmd_prep(&provisioner, request)
        }
    }
}

type HostProvisioner = Provisioner<lun_provision::ProcessCommandRunner, lun_provision::iscsi::ConfigFsFabric>;

fn cmd_clone(provisioner: &HostProvisioner, request: CloneRequest) -> Result<()> {
    println!("Cloning boot LUN:");
    println!("  Snapshot: {}", request.snapshot.as_deref().unwrap_or_default());
    println!("  Dest:     {}", request.dest.as_deref().unwrap_or_default());
    println!("  WWN:      {}", request.wwn.as_deref().unwrap_or_default());

    provisioner.create(&request)?;

    println!("✓ Exported {}", request.device.as_deref().unwrap_or_default());

    Ok(())
}

fn cmd_release(
    provisioner: &HostProvisioner,
    name: String,
    wwn: String,
    delete_clones: bool,
    yes: bool,
) -> Result<()> {
    println!("Export to remove:");
    println!("  WWN:   {}", wwn);
    println!("  Clone: {}", name);

    if delete_clones {
        println!("  ⚠ Warning: {} will be PERMANENTLY destroyed", name);

        if !yes {
            print!("\nProceed? [y/N]: ");
            use std::io::{self, Write};
            io::stdout().flush()?;

            let mut input = String::new();
            io::stdin().read_line(&mut input)?;

            if input.trim().to_lowercase() != "y" {
                println!("Release cancelled.");
                return Ok(());
            }
        }
    } else {
        println!("  Note: clone will be kept (use --delete-clones to remove)");
    }

    provisioner.delete(&ReleaseRequest {
        name: Some(name),
        wwn: Some(wwn.clone()),
        delete_clones: Some(delete_clones),
    })?;

    println!("✓ Released {}", wwn);

    Ok(())
}

fn cmd_prep(provisioner: &HostProvisioner, request: PrepRequest) -> Result<()> {
    println!("Preparing image:");
    println!("  WWN:    {}", request.wwn.as_deref().unwrap_or_default());
    println!("  Portal: {}:{}", request.ip.as_deref().unwrap_or_default(), request.port.unwrap_or(3260));
    println!("  Node:   {}", request.fqdn.as_deref().unwrap_or_default());

    provisioner.prep(&request)?;

    println!("✓ Prepared {}", request.wwn.as_deref().unwrap_or_default());

    Ok(())
}

fn cmd_list(provisioner: &HostProvisioner, kind: ListKind) -> Result<()> {
    let mut zfs = provisioner.volumes();
    let datasets = zfs.list(kind)?;

    if datasets.is_empty() {
        println!("No datasets.");
        return Ok(());
    }

    for (name, dataset) in datasets {
        println!("{}", name);
        println!("  Used:       {}", dataset.used);
        println!("  Available:  {}", dataset.available);
        println!("  Refer:      {}", dataset.referenced);
        println!("  Mountpoint: {}", dataset.mountpoint);
    }

    Ok(())
}

fn cmd_attributes(provisioner: &HostProvisioner, only: Option<&str>) -> Result<()> {
    let mut zfs = provisioner.volumes();
    let attributes = zfs.attributes()?;

    for (name, properties) in attributes {
        if only.is_some_and(|only| only != name) {
            continue;
        }

        println!("{}", name);
        for (property, value) in properties {
            println!("  {:<24} {:<24} {}", property, value.value, value.source);
        }
    }

    Ok(())
}

fn cmd_targets(provisioner: &HostProvisioner) -> Result<()> {
    let registry = provisioner.registry()?;

    println!("Block stores:");
    if registry.block_stores.is_empty() {
        println!("  (none)");
    }
    for store in registry.block_stores.values() {
        println!("  {} -> {}", store.name, store.device);
    }

    println!("\nTargets:");
    if registry.targets.is_empty() {
        println!("  (none)");
    }
    for (wwn, target) in &registry.targets {
        println!("  {}", wwn);
        for (tag, tpg) in &target.tpgs {
            println!("    tpg {}", tag);
            for lun in tpg.luns.values() {
                println!("      lun {} -> {}", lun.index, lun.storage);
            }
            for portal in tpg.portals.keys() {
                println!("      portal {}", portal);
            }
            for (initiator, acl) in &tpg.acls {
                let mapped: Vec<String> = acl
                    .mapped_luns
                    .iter()
                    .map(|m| format!("{}->{}", m.index, m.tpg_lun))
                    .collect();
                println!("      acl {} [{}]", initiator, mapped.join(", "));
            }
        }
    }

    Ok(())
}
