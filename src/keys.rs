//! Key provider for the Authenticator (spec.md §4.2, §6 "Persisted state").
//!
//! The core does not mandate a key source; this module supplies the
//! conventional on-disk one (`~/.android/adbkey[.pub]`) so the Authenticator
//! is testable end to end without a caller wiring up their own storage.

use crate::error::{AdbError, Result};
use crate::pubkey::AndroidPublicKey;
use rsa::pkcs8::{FromPrivateKey, ToPrivateKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::path::{Path, PathBuf};

const KEY_BITS: usize = 2048;

/// An ordered set of RSA private keys the Authenticator offers to the
/// device, one at a time, per spec.md §4.2 step 3.
#[derive(Debug)]
pub struct KeyStore {
    keys: Vec<RsaPrivateKey>,
}

impl KeyStore {
    pub fn new(keys: Vec<RsaPrivateKey>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &[RsaPrivateKey] {
        &self.keys
    }

    /// Default provider: the Android convention of `$dir/adbkey` (PKCS#8
    /// PEM) plus a sibling `adbkey.pub` (mincrypt, base64, labeled). A
    /// missing private key is generated fresh and both files are written;
    /// an existing one is loaded as-is.
    pub fn load_or_generate(dir: &Path) -> Result<Self> {
        let private_path = dir.join("adbkey");
        let public_path = dir.join("adbkey.pub");

        if let Ok(pem) = std::fs::read_to_string(&private_path) {
            let key = RsaPrivateKey::from_pkcs8_pem(&pem)
                .map_err(|e| AdbError::ProtocolViolation(format!("invalid adbkey PEM: {e}")))?;
            return Ok(Self::new(vec![key]));
        }

        std::fs::create_dir_all(dir)?;
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| AdbError::ProtocolViolation(format!("RSA key generation failed: {e}")))?;

        let pem = key
            .to_pkcs8_pem()
            .map_err(|e| AdbError::ProtocolViolation(format!("PEM encoding failed: {e}")))?;
        std::fs::write(&private_path, pem.as_bytes())?;

        let public = RsaPublicKey::from(&key);
        let label = format!(
            "host::{}@{}",
            whoami_user(),
            whoami_host(),
        );
        let encoded = AndroidPublicKey::new(&public)?.encode(&label)?;
        std::fs::write(&public_path, encoded.as_bytes())?;

        Ok(Self::new(vec![key]))
    }

    /// The conventional adb key directory, `~/.android`.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".android"))
    }
}

fn whoami_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".into())
}

fn whoami_host() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generates_and_reloads_a_key() {
        let dir = tempdir().unwrap();
        let store = KeyStore::load_or_generate(dir.path()).unwrap();
        assert_eq!(store.keys().len(), 1);
        assert!(dir.path().join("adbkey").exists());
        assert!(dir.path().join("adbkey.pub").exists());

        let reloaded = KeyStore::load_or_generate(dir.path()).unwrap();
        let a = reloaded.keys()[0].to_pkcs8_pem().unwrap();
        let b = store.keys()[0].to_pkcs8_pem().unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }
}
