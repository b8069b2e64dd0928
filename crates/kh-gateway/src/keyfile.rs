//! Long-lived secret key persistence.
//!
//! The key file holds the 64-char hex secret. A missing file is not an
//! error: a fresh key is generated and written with owner-only
//! permissions.

use std::io::ErrorKind;
use std::path::Path;

use tracing::info;

use kh_crypto::Keypair;

#[derive(Debug, thiserror::Error)]
pub enum KeyfileError {
    #[error("key file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("key file {path} does not contain a valid secret: {reason}")]
    Invalid { path: String, reason: String },
}

/// Load the secret key at `path`, generating and persisting one if the
/// file does not exist yet.
pub fn load_or_generate(path: &Path) -> Result<Keypair, KeyfileError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Keypair::from_hex(&content).map_err(|e| KeyfileError::Invalid {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let keys = Keypair::generate();
            write_key(path, &keys)?;
            info!(path = %path.display(), pubkey = %keys.public_hex(), "generated new identity key");
            Ok(keys)
        }
        Err(err) => Err(KeyfileError::Io {
            path: path.display().to_string(),
            source: err,
        }),
    }
}

fn write_key(path: &Path, keys: &Keypair) -> Result<(), KeyfileError> {
    let io_err = |source| KeyfileError::Io {
        path: path.display().to_string(),
        source,
    };

    std::fs::write(path, format!("{}\n", hex::encode(keys.secret_bytes()))).map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(io_err)?;
    }

    Ok(())
}
