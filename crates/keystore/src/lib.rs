//! TunnelMux Keystore
//!
//! Node identity and path utilities shared by the client and the server.
//!
//! ## Features
//!
//! - libp2p Ed25519 keypair loading/generation; the derived PeerId is what
//!   clients pin as the server's identity
//! - `~` expansion for user supplied paths
//! - Owner-only permissions on key files (unix)

mod keypair;
mod paths;

pub use keypair::{default_key_path, load_or_generate_keypair, save_keypair, KeystoreError};
pub use paths::{default_config_dir, expand_path};

pub type Result<T> = std::result::Result<T, KeystoreError>;
