//! Host key management
//!
//! The server presents one host key. It is read from the configured path,
//! or generated on first start and written back so the fingerprint stays
//! stable across restarts.

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use russh::keys::ssh_key::private::Ed25519Keypair;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{HashAlg, PrivateKey};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Load a host key in OpenSSH format
pub fn load_host_key(path: &Path) -> Result<PrivateKey> {
    let key_data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read host key from {:?}", path))?;

    parse_host_key(&key_data)
}

/// Parse a host key from its PEM text
pub fn parse_host_key(pem_data: &str) -> Result<PrivateKey> {
    russh::keys::decode_secret_key(pem_data, None).context("Failed to parse private key")
}

/// Generate a fresh Ed25519 host key
pub fn generate_ed25519_key() -> Result<PrivateKey> {
    let keypair = Ed25519Keypair::random(&mut OsRng);
    Ok(PrivateKey::from(keypair))
}

/// Write `key` to `path` in OpenSSH format, readable by the owner only
pub fn save_host_key(key: &PrivateKey, path: &Path) -> Result<()> {
    let openssh = key
        .to_openssh(LineEnding::LF)
        .context("Failed to encode key to OpenSSH format")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
    }
    fs::write(path, openssh.as_bytes())
        .with_context(|| format!("Failed to write host key to {:?}", path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    info!(path = ?path, "Saved host key");
    Ok(())
}

/// Load the key at `path`, generating and saving one if the file is missing
///
/// Without a path the key is ephemeral.
pub fn load_or_generate(path: Option<&Path>) -> Result<PrivateKey> {
    match path {
        Some(path) if path.exists() => load_host_key(path),
        Some(path) => {
            let key = generate_ed25519_key()?;
            save_host_key(&key, path)?;
            Ok(key)
        }
        None => {
            warn!("No host key configured, using an ephemeral Ed25519 key");
            generate_ed25519_key()
        }
    }
}

/// SHA-256 fingerprint of the public half
pub fn key_fingerprint(key: &PrivateKey) -> String {
    key.public_key().fingerprint(HashAlg::Sha256).to_string()
}
