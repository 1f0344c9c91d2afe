//! `sherlockfs-deluser <device> <victim_pub.pem> [my_priv.pem]` (§6).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use rsa::traits::PublicKeyParts;

use block_device::open_or_create;
use sherlockfs::cryptfs::CRYPTFS_BLOCK_SIZE_BYTES;
use sherlockfs::keyslots::{default_key_paths, load_private_key, load_public_key};
use sherlockfs::manager::{remove_user, unlock};

#[derive(Parser)]
#[command(name = "sherlockfs-deluser", about = "Remove a user from a SherlockFS volume")]
struct Cli {
    device: PathBuf,
    victim_pub: PathBuf,
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
    let victim_pub = load_public_key(&cli.victim_pub)
        .with_context(|| format!("loading {}", cli.victim_pub.display()))?;

    if victim_pub.n() == rsa::RsaPublicKey::from(&my_priv).n() {
        print!("This removes your own access to the volume. Continue? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush().ok();
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            bail!("aborted");
        }
    }

    let mut device = open_or_create(&cli.device, CRYPTFS_BLOCK_SIZE_BYTES, 0)
        .with_context(|| format!("opening {}", cli.device.display()))?;
    let master_key = unlock(&mut device, &my_priv)?;
    remove_user(&mut device, &master_key, &my_priv, &victim_pub)?;

    info!("removed user from {}", cli.victim_pub.display());
    println!("User removed.");
    Ok(())
}
