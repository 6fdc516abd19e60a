//! Copyright © 2025-2026 Wenze Wei. All Rights Reserved.
//!
//! This file is part of Eagle.
//! The Eagle project belongs to the Dunimd Team.
//!
//! Licensed under the Apache License, Version 2.0 (the "License");
//! You may not use this file except in compliance with the License.
//! You may obtain a copy of the License at
//!
//!     http://www.apache.org/licenses/LICENSE-2.0
//!
//! Unless required by applicable law or agreed to in writing, software
//! distributed under the License is distributed on an "AS IS" BASIS,
//! WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//! See the License for the specific language governing permissions and
//! limitations under the License.

//! # Plugin Signatures
//!
//! A module `alpha.so` is signed by a sidecar `alpha.so.sig` holding JSON:
//!
//! ```text
//! {
//!   "plugin_id": "alpha",
//!   "scheme": "ed25519" | "blake3",
//!   "signature": "<base64 Ed25519 signature of the module bytes>",
//!   "digest": "<hex blake3 digest, legacy scheme only>",
//!   "certificate": { serial, subject, issuer, public_key, not_before,
//!                    not_after, issuer_signature }
//! }
//! ```
//!
//! Ed25519 signatures are checked with the certificate's public key. The
//! certificate must be inside its validity window and not revoked; with
//! `require_chain` its issuer must be trusted and its `issuer_signature` must
//! verify against that issuer's key. The legacy blake3 digest is accepted
//! only when `allow_legacy_hash` is set.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};

use crate::errors::{EgError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EgSignatureScheme {
    Ed25519,
    /// Legacy integrity-only digest.
    Blake3,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EgPluginCertificate {
    pub serial: String,
    pub subject: String,
    pub issuer: String,
    /// Base64 Ed25519 public key of the subject.
    pub public_key: String,
    /// RFC 3339 timestamps.
    pub not_before: String,
    pub not_after: String,
    /// Base64 signature by the issuer over [`canonical_bytes`](Self::canonical_bytes).
    #[serde(default)]
    pub issuer_signature: String,
}

impl EgPluginCertificate {
    pub fn canonical_bytes(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.serial, self.subject, self.issuer, self.public_key, self.not_before, self.not_after
        )
        .into_bytes()
    }

    fn window(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let parse = |field: &str, value: &str| {
            DateTime::parse_from_rfc3339(value)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    EgError::signature(
                        self.subject.clone(),
                        format!("certificate {} '{}' is not RFC 3339: {}", field, value, e),
                    )
                })
        };
        Ok((
            parse("not_before", &self.not_before)?,
            parse("not_after", &self.not_after)?,
        ))
    }
}

/// Contents of a `.sig` sidecar file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EgPluginSignature {
    pub plugin_id: String,
    pub scheme: EgSignatureScheme,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub certificate: Option<EgPluginCertificate>,
}

impl EgPluginSignature {
    /// `<module>.sig` next to the module.
    pub fn sidecar_path(module_path: &Path) -> PathBuf {
        let mut name: OsString = module_path.as_os_str().to_owned();
        name.push(".sig");
        PathBuf::from(name)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}

/// Hex blake3 digest of `bytes`.
pub fn legacy_digest(bytes: &[u8]) -> String {
    hex::encode(blake3::hash(bytes).as_bytes())
}

/// Verification rules. Also part of the `plugins` configuration section.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgSignaturePolicy {
    pub allow_legacy_hash: bool,
    pub require_chain: bool,
    /// Issuer name → base64 Ed25519 public key.
    pub trusted_issuers: HashMap<String, String>,
    pub revoked_serials: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct EgSignatureVerifier {
    policy: EgSignaturePolicy,
}

impl EgSignatureVerifier {
    pub fn new(policy: EgSignaturePolicy) -> Self {
        EgSignatureVerifier { policy }
    }

    pub fn policy(&self) -> &EgSignaturePolicy {
        &self.policy
    }

    /// Verify the sidecar signature of `module_path` for `plugin_id`.
    pub fn verify_module(&self, plugin_id: &str, module_path: &Path) -> Result<()> {
        self.verify_module_bytes(plugin_id, module_path).map(|_| ())
    }

    /// Verify a module and return the exact bytes that were checked. Load
    /// from these bytes, not from `module_path`, to rule out a swap between
    /// verification and loading.
    pub fn verify_module_bytes(&self, plugin_id: &str, module_path: &Path) -> Result<Vec<u8>> {
        let sig_path = EgPluginSignature::sidecar_path(module_path);
        if !sig_path.is_file() {
            return Err(EgError::signature(
                plugin_id,
                format!("signature file '{}' is missing", sig_path.display()),
            ));
        }
        let signature = EgPluginSignature::load(&sig_path)
            .map_err(|e| EgError::signature(plugin_id, format!("unreadable signature file: {}", e)))?;
        let module_bytes = fs::read(module_path)?;
        self.verify_bytes(plugin_id, &module_bytes, &signature)?;
        log::info!(
            "plugin.signature.verified: plugin signature verified - plugin={}, scheme={:?}",
            plugin_id,
            signature.scheme
        );
        Ok(module_bytes)
    }

    pub fn verify_bytes(
        &self,
        plugin_id: &str,
        module_bytes: &[u8],
        signature: &EgPluginSignature,
    ) -> Result<()> {
        if signature.plugin_id != plugin_id {
            return Err(EgError::signature(
                plugin_id,
                format!("signature was issued for plugin '{}'", signature.plugin_id),
            ));
        }
        match signature.scheme {
            EgSignatureScheme::Blake3 => {
                if !self.policy.allow_legacy_hash {
                    return Err(EgError::signature(plugin_id, "legacy hash signatures are disabled"));
                }
                if !legacy_digest(module_bytes).eq_ignore_ascii_case(signature.digest.trim()) {
                    return Err(EgError::signature(plugin_id, "module digest does not match"));
                }
                log::warn!(
                    "plugin.signature.legacy: module accepted with legacy digest - plugin={}",
                    plugin_id
                );
                Ok(())
            }
            EgSignatureScheme::Ed25519 => {
                let certificate = signature.certificate.as_ref().ok_or_else(|| {
                    EgError::signature(plugin_id, "ed25519 signature has no certificate")
                })?;
                self.check_certificate(plugin_id, certificate, Utc::now())?;
                let public_key = _decode(plugin_id, "public key", &certificate.public_key)?;
                let sig = _decode(plugin_id, "signature", &signature.signature)?;
                UnparsedPublicKey::new(&ED25519, &public_key)
                    .verify(module_bytes, &sig)
                    .map_err(|_| EgError::signature(plugin_id, "signature does not match module"))
            }
        }
    }

    /// Revocation, validity window at `now`, and issuer chain when required.
    pub fn check_certificate(
        &self,
        plugin_id: &str,
        certificate: &EgPluginCertificate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.policy.revoked_serials.iter().any(|s| s == &certificate.serial) {
            return Err(EgError::signature(
                plugin_id,
                format!("certificate serial '{}' is revoked", certificate.serial),
            ));
        }
        let (not_before, not_after) = certificate.window()?;
        if now < not_before {
            return Err(EgError::signature(plugin_id, "certificate is not yet valid"));
        }
        if now > not_after {
            return Err(EgError::signature(plugin_id, "certificate has expired"));
        }
        if self.policy.require_chain {
            let issuer_key = self
                .policy
                .trusted_issuers
                .get(&certificate.issuer)
                .ok_or_else(|| {
                    EgError::signature(
                        plugin_id,
                        format!("issuer '{}' is not trusted", certificate.issuer),
                    )
                })?;
            let issuer_key = _decode(plugin_id, "issuer key", issuer_key)?;
            let issuer_sig = _decode(plugin_id, "issuer signature", &certificate.issuer_signature)?;
            UnparsedPublicKey::new(&ED25519, &issuer_key)
                .verify(&certificate.canonical_bytes(), &issuer_sig)
                .map_err(|_| EgError::signature(plugin_id, "certificate chain does not verify"))?;
        }
        Ok(())
    }
}

fn _decode(plugin_id: &str, what: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value.trim())
        .map_err(|e| EgError::signature(plugin_id, format!("invalid base64 {}: {}", what, e)))
}

/// Ed25519 identity that issues certificates and signs modules.
pub struct EgPluginSigner {
    name: String,
    key_pair: Ed25519KeyPair,
    pkcs8: Vec<u8>,
}

impl std::fmt::Debug for EgPluginSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgPluginSigner")
            .field("name", &self.name)
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

impl EgPluginSigner {
    pub fn generate(name: impl Into<String>) -> Result<Self> {
        let rng = SystemRandom::new();
        let document = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|e| EgError::internal(format!("ed25519 key generation failed: {}", e)))?;
        Self::from_pkcs8(name, document.as_ref())
    }

    pub fn from_pkcs8(name: impl Into<String>, pkcs8: &[u8]) -> Result<Self> {
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|e| EgError::validation(format!("invalid ed25519 key: {}", e)))?;
        Ok(EgPluginSigner {
            name: name.into(),
            key_pair,
            pkcs8: pkcs8.to_vec(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pkcs8_bytes(&self) -> &[u8] {
        &self.pkcs8
    }

    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.key_pair.public_key().as_ref())
    }

    pub fn sign(&self, message: &[u8]) -> String {
        STANDARD.encode(self.key_pair.sign(message).as_ref())
    }

    /// Certificate for `subject_public_key`, signed by this signer as issuer.
    pub fn issue_certificate(
        &self,
        serial: impl Into<String>,
        subject: impl Into<String>,
        subject_public_key: impl Into<String>,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> EgPluginCertificate {
        let mut certificate = EgPluginCertificate {
            serial: serial.into(),
            subject: subject.into(),
            issuer: self.name.clone(),
            public_key: subject_public_key.into(),
            not_before: not_before.to_rfc3339(),
            not_after: not_after.to_rfc3339(),
            issuer_signature: String::new(),
        };
        certificate.issuer_signature = self.sign(&certificate.canonical_bytes());
        certificate
    }

    /// Self-issued certificate valid from now for `validity`.
    pub fn self_certificate(
        &self,
        serial: impl Into<String>,
        validity: std::time::Duration,
    ) -> Result<EgPluginCertificate> {
        let span = chrono::Duration::from_std(validity)
            .map_err(|e| EgError::validation(format!("invalid certificate validity: {}", e)))?;
        let now = Utc::now();
        Ok(self.issue_certificate(serial, self.name.clone(), self.public_key_base64(), now, now + span))
    }

    /// Sign `module_path` and write its sidecar. Returns the sidecar path.
    pub fn sign_module(
        &self,
        plugin_id: &str,
        module_path: &Path,
        certificate: EgPluginCertificate,
    ) -> Result<PathBuf> {
        let bytes = fs::read(module_path)?;
        let signature = EgPluginSignature {
            plugin_id: plugin_id.to_string(),
            scheme: EgSignatureScheme::Ed25519,
            signature: self.sign(&bytes),
            digest: String::new(),
            certificate: Some(certificate),
        };
        let path = EgPluginSignature::sidecar_path(module_path);
        signature.save(&path)?;
        Ok(path)
    }

    /// Write a legacy blake3 sidecar for `module_path`.
    pub fn write_legacy_digest(plugin_id: &str, module_path: &Path) -> Result<PathBuf> {
        let bytes = fs::read(module_path)?;
        let signature = EgPluginSignature {
            plugin_id: plugin_id.to_string(),
            scheme: EgSignatureScheme::Blake3,
            signature: String::new(),
            digest: legacy_digest(&bytes),
            certificate: None,
        };
        let path = EgPluginSignature::sidecar_path(module_path);
        signature.save(&path)?;
        Ok(path)
    }
}
