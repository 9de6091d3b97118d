use clap::Subcommand;
use jam_store::keys;

use crate::system::prompt;

#[derive(Subcommand)]
pub enum KeyCommand {
    /// Create a new encryption key.
    New,
    /// Lock an encryption key with a passphrase.
    Lock,
    /// Unlock a locked encryption key.
    Unlock,
}

pub fn run(cmd: KeyCommand) -> anyhow::Result<()> {
    match cmd {
        KeyCommand::New => {
            println!("new key: {}", keys::encode_key(&keys::generate_key()));
        }
        KeyCommand::Lock => {
            let hex_key = prompt("input 32 byte hex-encoded encryption key: ")?;
            let key = keys::parse_key(&hex_key, || {
                Err(jam_store::Error::Input(
                    "expected an unlocked key".to_string(),
                ))
            })?;
            let passphrase = prompt("input passphrase: ")?;
            println!("{}", keys::lock_key(&key, &passphrase)?);
        }
        KeyCommand::Unlock => {
            let locked = prompt("input locked key: ")?;
            let key = keys::parse_key(&locked, || {
                prompt("input passphrase: ").map_err(jam_store::Error::Io)
            })?;
            println!("{}", keys::encode_key(&key));
        }
    }
    Ok(())
}
