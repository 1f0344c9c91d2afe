//! `sherlockfs-mount <device> <mountpoint> [-k priv_path] [FUSE opts...]` (§6).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use fuser::MountOption;
use log::info;

use block_device::open_or_create;
use sherlockfs::cryptfs::CRYPTFS_BLOCK_SIZE_BYTES;
use sherlockfs::fuse_fs::SherlockFuse;
use sherlockfs::keyslots::{default_key_paths, load_private_key};
use sherlockfs::manager::unlock;

#[derive(Parser)]
#[command(name = "sherlockfs-mount", about = "Unlock and mount a SherlockFS volume")]
struct Cli {
    device: PathBuf,
    mountpoint: PathBuf,

    #[arg(short = 'k', long = "priv-key")]
    priv_key: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,

    /// Raw FUSE options, e.g. `-o allow_other`. Passed straight through.
    #[arg(short = 'o', long = "option")]
    options: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    sherlockfs::init_logs();

    let priv_path = match cli.priv_key {
        Some(p) => p,
        None => default_key_paths()?.1,
    };
    let passphrase = rpassword::prompt_password("Passphrase for your private key (blank if none): ")?;
    let passphrase = if passphrase.is_empty() { None } else { Some(passphrase) };
    let rsa_priv = load_private_key(&priv_path, passphrase.as_deref())
        .with_context(|| format!("loading {}", priv_path.display()))?;

    let mut device = open_or_create(&cli.device, CRYPTFS_BLOCK_SIZE_BYTES, 0)
        .with_context(|| format!("opening {}", cli.device.display()))?;
    let master_key = unlock(&mut device, &rsa_priv).context("unlocking volume")?;

    let mut mount_options = vec![MountOption::FSName("sherlockfs".to_string())];
    for raw in &cli.options {
        mount_options.push(parse_mount_option(raw));
    }

    info!("mounting {} at {}", cli.device.display(), cli.mountpoint.display());
    let fs = SherlockFuse::new(device, master_key);
    fuser::mount2(fs, &cli.mountpoint, &mount_options)
        .with_context(|| format!("mounting at {}", cli.mountpoint.display()))?;
    Ok(())
}

fn parse_mount_option(raw: &str) -> MountOption {
    match raw {
        "ro" => MountOption::RO,
        "rw" => MountOption::RW,
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "auto_unmount" => MountOption::AutoUnmount,
        "default_permissions" => MountOption::DefaultPermissions,
        other => MountOption::CUSTOM(other.to_string()),
    }
}
