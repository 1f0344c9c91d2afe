//! `sherlockfs-adduser <device> <other_pub.pem> [my_priv.pem]` (§6).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use block_device::open_or_create;
use sherlockfs::cryptfs::CRYPTFS_BLOCK_SIZE_BYTES;
use sherlockfs::keyslots::{default_key_paths, load_private_key, load_public_key};
use sherlockfs::manager::{add_user, unlock};

#[derive(Parser)]
#[command(name = "sherlockfs-adduser", about = "Add a user to a SherlockFS volume")]
struct Cli {
    device: PathBuf,
    other_pub: PathBuf,
    my_priv: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    sherlockfs::init_logs();

    let my_priv_path = match cli.my_priv {
        Some(p) => p,
        None => default_key_paths()?.1,
    };
    let passphrase = rpassword::prompt_password("Passphrase for your private key (blank if none): ")?;
    let passphrase = if passphrase.is_empty() { None } else { Some(passphrase) };
    let my_priv = load_private_key(&my_priv_path, passphrase.as_deref())
        .with_context(|| format!("loading {}", my_priv_path.display()))?;
    let other_pub = load_public_key(&cli.other_pub)
        .with_context(|| format!("loading {}", cli.other_pub.display()))?;

    let mut device = open_or_create(&cli.device, CRYPTFS_BLOCK_SIZE_BYTES, 0)
        .with_context(|| format!("opening {}", cli.device.display()))?;
    let master_key = unlock(&mut device, &my_priv)?;
    add_user(&mut device, &master_key, &my_priv, &other_pub)?;

    info!("added user from {}", cli.other_pub.display());
    println!("User added.");
    Ok(())
}
