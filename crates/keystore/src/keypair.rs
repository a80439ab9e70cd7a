use std::fs;
use std::path::{Path, PathBuf};

use libp2p::identity::Keypair;
use thiserror::Error;
use tracing::info;

use crate::{default_config_dir, expand_path, Result};

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Failed to read key file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write key file {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid key file {path:?}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("Failed to encode keypair: {0}")]
    Encode(String),
}

/// Default location of the node identity
pub fn default_key_path() -> PathBuf {
    default_config_dir().join("node.key")
}

/// Load the keypair at `path`, creating a fresh Ed25519 identity if the
/// file does not exist yet.
pub fn load_or_generate_keypair(path: impl AsRef<Path>) -> Result<Keypair> {
    let path = expand_path(path);

    if path.exists() {
        let bytes = fs::read(&path).map_err(|source| KeystoreError::Read {
            path: path.clone(),
            source,
        })?;
        return Keypair::from_protobuf_encoding(&bytes).map_err(|e| KeystoreError::Decode {
            path,
            reason: e.to_string(),
        });
    }

    let keypair = Keypair::generate_ed25519();
    save_keypair(&keypair, &path)?;
    info!(
        "Generated new identity {} at {:?}",
        keypair.public().to_peer_id(),
        path
    );
    Ok(keypair)
}

/// Write `keypair` in protobuf encoding, readable by the owner only
pub fn save_keypair(keypair: &Keypair, path: impl AsRef<Path>) -> Result<()> {
    let path = expand_path(path);
    let bytes = keypair
        .to_protobuf_encoding()
        .map_err(|e| KeystoreError::Encode(e.to_string()))?;

    let write_err = |source: std::io::Error| KeystoreError::Write {
        path: path.clone(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    fs::write(&path, bytes).map_err(write_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).map_err(write_err)?;
    }

    Ok(())
}
