//! Credential vault.
//!
//! Pure codec over per-tenant secrets: AES-256-GCM with a single master key
//! configured at boot. The vault stores nothing; blobs live on the tenant
//! rows and are materialized into job-local variables only while a sync
//! actually needs them. Key rotation is out of scope.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256};

use crate::error::{SyncError, SyncResult};

const NONCE_LEN: usize = 12;

pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Accepts either 64 hex chars (raw 256-bit key) or an arbitrary
    /// passphrase, which is digested to 256 bits.
    pub fn new(master_key: &str) -> SyncResult<Self> {
        let trimmed = master_key.trim();
        if trimmed.is_empty() {
            return Err(SyncError::config_missing("master key is empty"));
        }

        let key_bytes: [u8; 32] = match hex::decode(trimmed) {
            Ok(raw) if raw.len() == 32 => raw
                .try_into()
                .map_err(|_| SyncError::internal("hex key length changed underfoot"))?,
            _ => Sha256::digest(trimmed.as_bytes()).into(),
        };

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| SyncError::internal(format!("cipher init: {e}")))?;

        Ok(Self { cipher })
    }

    /// Build from optional config value; absence is a boot-fatal error.
    pub fn from_config(master_key: Option<&str>) -> SyncResult<Self> {
        match master_key {
            Some(key) => Self::new(key),
            None => Err(SyncError::config_missing(
                "STOCKSYNC_MASTER_KEY is not set",
            )),
        }
    }

    /// Blob format: base64(nonce[12] || ciphertext+tag). A fresh random
    /// nonce per call, so encrypting the same plaintext twice yields
    /// different blobs.
    pub fn encrypt(&self, plaintext: &str) -> SyncResult<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| SyncError::internal("encryption failed"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    pub fn decrypt(&self, blob: &str) -> SyncResult<String> {
        let raw = BASE64
            .decode(blob.trim())
            .map_err(|_| SyncError::credential("credential blob is not valid base64"))?;

        if raw.len() <= NONCE_LEN {
            return Err(SyncError::credential("credential blob is truncated"));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SyncError::credential("credential authentication tag mismatch"))?;

        String::from_utf8(plaintext)
            .map_err(|_| SyncError::credential("decrypted credential is not utf-8"))
    }
}
