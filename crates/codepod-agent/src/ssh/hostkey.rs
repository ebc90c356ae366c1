//! Host key bootstrap
//!
//! Generates a 2048-bit RSA host key on first start when the configured path
//! is missing, writing the private key plus an OpenSSH `.pub` alongside it.

use crate::error::{AgentError, Result};
use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::LineEnding;
use russh::keys::PrivateKey;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const RSA_BITS: usize = 2048;

/// Generate a host key at `path` when none exists
pub fn ensure_host_key(path: &str) -> Result<()> {
    if Path::new(path).exists() {
        return Ok(());
    }

    tracing::info!(path = %path, "generating SSH host key");

    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent).map_err(|e| AgentError::Io {
            path: parent.display().to_string(),
            source: e,
        })?;
    }

    let keypair = RsaKeypair::random(&mut OsRng, RSA_BITS)
        .map_err(|e| AgentError::Key(format!("RSA key generation failed: {}", e)))?;
    let private = PrivateKey::new(KeypairData::Rsa(keypair), "codepod-agent")
        .map_err(|e| AgentError::Key(e.to_string()))?;

    let pem = private
        .to_openssh(LineEnding::LF)
        .map_err(|e| AgentError::Key(e.to_string()))?;
    write_with_mode(path, pem.as_bytes(), 0o600)?;

    let public = private
        .public_key()
        .to_openssh()
        .map_err(|e| AgentError::Key(e.to_string()))?;
    write_with_mode(&format!("{}.pub", path), format!("{}\n", public).as_bytes(), 0o644)?;

    tracing::info!(path = %path, "SSH host key generated");
    Ok(())
}

/// Load all configured host keys, generating the first one when missing
///
/// Paths past the first that do not exist are skipped with a warning; at
/// least one key must load.
pub fn load_host_keys(paths: &[String]) -> Result<Vec<PrivateKey>> {
    let mut keys = Vec::new();

    for (i, path) in paths.iter().enumerate() {
        if i == 0 {
            ensure_host_key(path)?;
        } else if !Path::new(path).exists() {
            tracing::warn!(path = %path, "host key missing, skipping");
            continue;
        }

        let key = russh::keys::load_secret_key(path, None)
            .map_err(|e| AgentError::Key(format!("failed to load host key {}: {}", path, e)))?;
        keys.push(key);
    }

    if keys.is_empty() {
        return Err(AgentError::Key("no host keys available".to_string()));
    }
    Ok(keys)
}

fn write_with_mode(path: &str, contents: &[u8], mode: u32) -> Result<()> {
    std::fs::write(path, contents).map_err(|e| AgentError::Io {
        path: path.to_string(),
        source: e,
    })?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
        AgentError::Io {
            path: path.to_string(),
            source: e,
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::Algorithm;

    /// Write a fast-to-generate key for load tests
    fn write_ed25519_key(path: &std::path::Path) {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        std::fs::write(path, key.to_openssh(LineEnding::LF).unwrap().as_bytes()).unwrap();
    }

    #[test]
    fn test_load_existing_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh_host_key");
        write_ed25519_key(&path);

        let keys = load_host_keys(&[path.to_string_lossy().into_owned()]).unwrap();
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn test_missing_secondary_keys_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh_host_key");
        write_ed25519_key(&path);

        let keys = load_host_keys(&[
            path.to_string_lossy().into_owned(),
            "/nonexistent/ssh_host_ecdsa_key".to_string(),
        ])
        .unwrap();
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn test_ensure_is_noop_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh_host_key");
        write_ed25519_key(&path);
        let before = std::fs::read(&path).unwrap();

        ensure_host_key(&path.to_string_lossy()).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    // RSA generation is slow without release optimizations, so the full
    // first-start path runs only when explicitly requested.
    #[test]
    #[ignore]
    fn test_generates_rsa_host_key_and_pub() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc/ssh/ssh_host_rsa_key");
        let path_str = path.to_string_lossy().into_owned();

        ensure_host_key(&path_str).unwrap();

        assert!(path.exists());
        assert!(dir.path().join("etc/ssh/ssh_host_rsa_key.pub").exists());

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let keys = load_host_keys(&[path_str]).unwrap();
        assert_eq!(keys.len(), 1);
    }
}
