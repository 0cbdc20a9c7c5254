// src/wallet.rs
// Node wallet: an Ed25519 keypair persisted on disk plus the account id
// derived from the public key.

use crate::errors::{MeshError, Result};
use ed25519_dalek::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// On-disk wallet file. The signing key is stored as PKCS#8 PEM; the
/// public key as SPKI PEM. Accounts are derived from the public PEM, so
/// the file carries both for convenience and cross-checking on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletFile {
    pub account_id: String,
    pub public_key_pem: String,
    pub signing_key_pem: String,
    pub created_at: String,
}

pub struct Wallet {
    signing_key: SigningKey,
    public_pem: String,
    account_id: String,
}

impl Wallet {
    /// Generate a fresh keypair (not yet persisted).
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_pem = encode_public_pem(&signing_key.verifying_key());
        let account_id = account_id_of(&public_pem);
        Self {
            signing_key,
            public_pem,
            account_id,
        }
    }

    /// Load the wallet at `path`, generating and persisting one if absent.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let text = fs::read_to_string(path)?;
            let file: WalletFile = serde_json::from_str(&text)?;
            return Self::from_file(&file);
        }
        let wallet = Self::generate();
        wallet.persist(path)?;
        tracing::info!(account = %wallet.account_id, "generated new wallet");
        Ok(wallet)
    }

    /// Reconstruct a wallet from its file form, validating that the key
    /// material is internally consistent.
    pub fn from_file(file: &WalletFile) -> Result<Self> {
        let signing_key = SigningKey::from_pkcs8_pem(&file.signing_key_pem)
            .map_err(|e| MeshError::BadKeyMaterial(format!("signing key: {}", e)))?;
        let wallet = Self::from_signing_key(signing_key);
        if wallet.public_pem.trim() != file.public_key_pem.trim() {
            return Err(MeshError::BadKeyMaterial(
                "declared public key does not match signing key".into(),
            ));
        }
        if wallet.account_id != file.account_id {
            return Err(MeshError::BadKeyMaterial(format!(
                "declared account {} does not match derived {}",
                file.account_id, wallet.account_id
            )));
        }
        Ok(wallet)
    }

    /// Import foreign key material onto this node. A node whose ledger
    /// already carries a leader key must not change its public key, so the
    /// current leader PEM (if this node is the leader) gates the import.
    pub fn import(
        path: &Path,
        file: &WalletFile,
        current_leader_pem: Option<&str>,
    ) -> Result<Self> {
        let wallet = Self::from_file(file)?;
        if let Some(leader) = current_leader_pem {
            if leader.trim() != wallet.public_pem.trim() {
                return Err(MeshError::BadKeyMaterial(
                    "import would change the genesis leader key".into(),
                ));
            }
        }
        wallet.persist(path)?;
        Ok(wallet)
    }

    /// Persist atomically: write a temp file next to the target, then
    /// rename over it. Restrictive permissions on Unix.
    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = self.to_file();
        let json = serde_json::to_string_pretty(&file)?;
        let tmp: PathBuf = path.with_extension("tmp");
        fs::write(&tmp, &json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn to_file(&self) -> WalletFile {
        let signing_pem = self
            .signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("pkcs8 encoding of a valid key cannot fail")
            .to_string();
        WalletFile {
            account_id: self.account_id.clone(),
            public_key_pem: self.public_pem.clone(),
            signing_key_pem: signing_pem,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// Sign a payload, returning the hex-encoded signature.
    pub fn sign(&self, payload: &[u8]) -> String {
        let sig: Signature = self.signing_key.sign(payload);
        hex::encode(sig.to_bytes())
    }
}

/// Derive the account id from a public key PEM:
/// `acct_` + first 16 hex chars of SHA-256 over the trimmed PEM.
pub fn account_id_of(public_key_pem: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key_pem.trim().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("acct_{}", &digest[..16])
}

/// Verify a hex signature over `payload` under a PEM public key.
/// Malformed keys or signatures verify as false.
pub fn verify(public_key_pem: &str, payload: &[u8], signature_hex: &str) -> bool {
    let vk = match VerifyingKey::from_public_key_pem(public_key_pem.trim()) {
        Ok(vk) => vk,
        Err(_) => return false,
    };
    let sig_bytes = match hex::decode(signature_hex.trim()) {
        Ok(b) => b,
        Err(_) => return false,
    };
    let sig = match <&[u8; 64]>::try_from(sig_bytes.as_slice()) {
        Ok(arr) => Signature::from_bytes(arr),
        Err(_) => return false,
    };
    vk.verify(payload, &sig).is_ok()
}

fn encode_public_pem(vk: &VerifyingKey) -> String {
    vk.to_public_key_pem(LineEnding::LF)
        .expect("spki encoding of a valid key cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let wallet = Wallet::generate();
        let payload = b"{\"type\":\"transfer\",\"amount\":100}";
        let sig = wallet.sign(payload);
        assert!(verify(wallet.public_key_pem(), payload, &sig));
    }

    #[test]
    fn mutated_payload_fails_verification() {
        let wallet = Wallet::generate();
        let sig = wallet.sign(b"payload-a");
        assert!(!verify(wallet.public_key_pem(), b"payload-b", &sig));
    }

    #[test]
    fn foreign_key_fails_verification() {
        let a = Wallet::generate();
        let b = Wallet::generate();
        let sig = a.sign(b"payload");
        assert!(!verify(b.public_key_pem(), b"payload", &sig));
    }

    #[test]
    fn account_id_shape() {
        let wallet = Wallet::generate();
        let id = wallet.account_id();
        assert!(id.starts_with("acct_"));
        assert_eq!(id.len(), "acct_".len() + 16);
        assert_eq!(id, account_id_of(wallet.public_key_pem()));
    }

    #[test]
    fn persist_and_reload() {
        let dir = std::env::temp_dir().join(format!("wallet_test_{}", uuid::Uuid::new_v4()));
        let path = dir.join("wallet.json");
        let wallet = Wallet::load_or_generate(&path).unwrap();
        let reloaded = Wallet::load_or_generate(&path).unwrap();
        assert_eq!(wallet.account_id(), reloaded.account_id());
        assert_eq!(wallet.public_key_pem(), reloaded.public_key_pem());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn import_rejects_mismatched_account() {
        let wallet = Wallet::generate();
        let mut file = wallet.to_file();
        file.account_id = "acct_0000000000000000".to_string();
        assert!(Wallet::from_file(&file).is_err());
    }

    #[test]
    fn import_refuses_leader_key_change() {
        let dir = std::env::temp_dir().join(format!("wallet_test_{}", uuid::Uuid::new_v4()));
        let path = dir.join("wallet.json");
        let current = Wallet::generate();
        let foreign = Wallet::generate();
        let res = Wallet::import(&path, &foreign.to_file(), Some(current.public_key_pem()));
        assert!(res.is_err());
        let _ = std::fs::remove_dir_all(dir);
    }
}
