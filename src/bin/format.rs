//! `sherlockfs-format <device> [label]` (§6).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use block_device::open_or_create;
use sherlockfs::cryptfs::CRYPTFS_BLOCK_SIZE_BYTES;
use sherlockfs::keyslots::{default_key_paths, load_private_key};
use sherlockfs::manager::{format, is_already_formatted};

/// A freshly formatted image needs at least the bootstrap blocks; default
/// to a modest 16 MiB so a bare `format foo.img` produces something
/// immediately mountable.
const DEFAULT_MIN_SIZE_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "sherlockfs-format", about = "Format a device or image file as a SherlockFS volume")]
struct Cli {
    /// Path to the device or image file.
    device: PathBuf,

    /// Optional volume label (currently informational only).
    label: Option<String>,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    sherlockfs::init_logs();

    let mut device = open_or_create(&cli.device, CRYPTFS_BLOCK_SIZE_BYTES, DEFAULT_MIN_SIZE_BYTES)
        .with_context(|| format!("opening {}", cli.device.display()))?;

    let force = if is_already_formatted(&mut device) {
        print!("{} already looks like a SherlockFS volume. Overwrite? [y/N] ", cli.device.display());
        use std::io::Write;
        std::io::stdout().flush().ok();
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            bail!("aborted: device already formatted");
        }
        true
    } else {
        false
    };

    let (pub_path, priv_path) = default_key_paths()?;
    let existing_rsa = if priv_path.exists() {
        print!("An existing keypair was found at {}. Reuse it? [y/N] ", priv_path.display());
        use std::io::Write;
        std::io::stdout().flush().ok();
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if answer.trim().eq_ignore_ascii_case("y") {
            let passphrase = rpassword::prompt_password("Passphrase for existing key (blank if none): ")?;
            let passphrase = if passphrase.is_empty() { None } else { Some(passphrase) };
            Some(load_private_key(&priv_path, passphrase.as_deref())?)
        } else {
            None
        }
    } else {
        None
    };

    let passphrase = rpassword::prompt_password("New private key passphrase (blank for none): ")?;
    let passphrase = if passphrase.is_empty() { None } else { Some(passphrase) };

    let outcome = format(
        &mut device,
        &pub_path,
        &priv_path,
        passphrase.as_deref(),
        existing_rsa,
        force,
    )?;
    // The master key only ever needs to exist in this process long enough
    // to have been written into slot 0; nothing further to do with it here.
    drop(outcome.master_key);

    info!("formatted {} (keys at {})", cli.device.display(), pub_path.display());
    if let Some(label) = cli.label {
        info!("label: {label}");
    }
    println!("Formatted {}.", cli.device.display());
    Ok(())
}
