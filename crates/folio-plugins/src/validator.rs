//! Package validation
//!
//! Read-only checks run against a package archive before anything is
//! extracted or persisted, in order: structural integrity, signature,
//! static scan of bundled script code, size ceiling.

use crate::error::{PackageError, PluginResult};
use crate::package::{self, SIGNATURE_ENTRY};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

/// API patterns plugin scripts may not reference. A match fails validation
/// outright; there is no allowlist escape.
const DISALLOWED_PATTERNS: &[&str] = &[
    "os.execute",
    "io.popen",
    "loadstring",
    "dofile",
    "debug.getinfo",
    "child_process",
    "process.binding",
    "new Function",
    "eval(",
];

/// Detached signature block stored as `signature.json` at the archive root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureBlock {
    /// base64-encoded 32-byte ed25519 public key of the signer
    pub signer: String,
    /// base64-encoded 64-byte signature over the sha256 digest of the
    /// manifest bytes
    pub signature: String,
}

/// Validates plugin packages against structural, signature, content, and
/// size rules. Stateless and read-only.
pub struct PackageValidator {
    max_package_bytes: u64,
    trusted_key: Option<VerifyingKey>,
}

impl PackageValidator {
    /// Create a validator.
    ///
    /// `signer_key` is the base64-encoded trusted ed25519 public key; when
    /// `None`, signature verification is skipped entirely.
    pub fn new(max_package_bytes: u64, signer_key: Option<&str>) -> anyhow::Result<Self> {
        let trusted_key = match signer_key {
            Some(encoded) => Some(decode_verifying_key(encoded)?),
            None => None,
        };
        Ok(Self {
            max_package_bytes,
            trusted_key,
        })
    }

    /// Validate a package archive. Read-only; no partial side effects.
    pub fn validate_package(&self, path: &Path) -> PluginResult<()> {
        // 1. Structural integrity
        let entries = package::walk(path)?;
        debug!(package = %path.display(), entries = entries.len(), "package opened");

        // 2. Signature, when a trusted key is configured
        if let Some(trusted_key) = &self.trusted_key {
            self.verify_signature(path, trusted_key)?;
        }

        // 3. Static scan of bundled script code
        for (entry, text) in package::read_scripts(path, self.max_package_bytes)? {
            for pattern in DISALLOWED_PATTERNS {
                if text.contains(pattern) {
                    return Err(PackageError::MaliciousPattern {
                        pattern: (*pattern).to_string(),
                        entry,
                    }
                    .into());
                }
            }
        }

        // 4. Cumulative unpacked size ceiling
        let total: u64 = entries.iter().map(|e| e.size).sum();
        if total > self.max_package_bytes {
            return Err(PackageError::TooLarge {
                actual: total,
                limit: self.max_package_bytes,
            }
            .into());
        }

        Ok(())
    }

    fn verify_signature(&self, path: &Path, trusted_key: &VerifyingKey) -> PluginResult<()> {
        let manifest_bytes = package::read_entry(path, package::MANIFEST_ENTRY, 64 * 1024)?
            .ok_or_else(|| PackageError::SignatureInvalid("package has no manifest to sign".to_string()))?;

        let block_bytes = package::read_entry(path, SIGNATURE_ENTRY, 4 * 1024)?
            .ok_or_else(|| PackageError::SignatureInvalid("package is unsigned".to_string()))?;

        let block: SignatureBlock = serde_json::from_slice(&block_bytes)
            .map_err(|e| PackageError::SignatureInvalid(format!("invalid signature block: {e}")))?;

        let signer = decode_verifying_key(&block.signer)
            .map_err(|e| PackageError::SignatureInvalid(e.to_string()))?;

        if signer != *trusted_key {
            return Err(
                PackageError::SignatureInvalid("signer key is not trusted".to_string()).into(),
            );
        }

        let signature_bytes = BASE64_STANDARD
            .decode(&block.signature)
            .map_err(|e| PackageError::SignatureInvalid(format!("invalid signature encoding: {e}")))?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|e| PackageError::SignatureInvalid(format!("invalid signature: {e}")))?;

        let digest = manifest_digest(&manifest_bytes);
        trusted_key
            .verify(&digest, &signature)
            .map_err(|e| PackageError::SignatureInvalid(e.to_string()))?;

        Ok(())
    }
}

/// sha256 digest of the manifest bytes; the payload package signatures cover
pub fn manifest_digest(manifest_bytes: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(manifest_bytes);
    hasher.finalize().to_vec()
}

fn decode_verifying_key(encoded: &str) -> anyhow::Result<VerifyingKey> {
    let bytes = BASE64_STANDARD
        .decode(encoded)
        .map_err(|e| anyhow::anyhow!("invalid signer key encoding: {e}"))?;

    let key_array: [u8; ed25519_dalek::PUBLIC_KEY_LENGTH] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("signer key must be 32 bytes"))?;

    VerifyingKey::from_bytes(&key_array).map_err(|e| anyhow::anyhow!("invalid signer key: {e}"))
}
