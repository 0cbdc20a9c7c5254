// Standalone keypair generator: prints a fresh wallet (PEM keypair and
// derived account id) without touching any node state.

use anyhow::{Context, Result};
use capsule_mesh::wallet::Wallet;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "capsule-keygen")]
#[command(about = "Generate an Ed25519 wallet for a mesh node", long_about = None)]
struct Cli {
    /// Write the wallet file here instead of printing the signing key
    #[arg(short, long)]
    out: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let wallet = Wallet::generate();

    println!("Account:    {}", wallet.account_id());
    println!("Public key:\n{}", wallet.public_key_pem());

    match cli.out {
        Some(path) => {
            wallet.persist(&path).context("write wallet file")?;
            println!("Wallet written to {}", path.display());
            println!("Keep this file private; it holds the signing key.");
        }
        None => {
            let file = wallet.to_file();
            println!("Signing key (PKCS#8):\n{}", file.signing_key_pem);
        }
    }
    Ok(())
}
