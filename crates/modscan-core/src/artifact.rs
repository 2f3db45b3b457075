// SPDX-License-Identifier: MIT OR Apache-2.0
//! Artifact identity (content-addressed fingerprint) and metadata.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 of an artifact's raw bytes, used as its sole identity.
///
/// Two byte-identical uploads always produce the same fingerprint and
/// therefore share a single [`Artifact`] record (spec invariant P5).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(into = "String", try_from = "String")]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the fingerprint of a byte slice.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    /// Hex-encoded representation, suitable for use as a path segment or
    /// Redis key fragment.
    #[must_use]
    pub fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Parse a fingerprint from its hex representation.
    pub fn parse(hex: &str) -> Result<Self, FingerprintParseError> {
        if hex.len() != 64 {
            return Err(FingerprintParseError::WrongLength(hex.len()));
        }
        let mut out = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s =
                std::str::from_utf8(chunk).map_err(|_| FingerprintParseError::NotHex)?;
            out[i] = u8::from_str_radix(s, 16).map_err(|_| FingerprintParseError::NotHex)?;
        }
        Ok(Self(out))
    }
}

/// Error returned when a string does not parse as a [`Fingerprint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintParseError {
    /// Input was not exactly 64 hex characters.
    WrongLength(usize),
    /// Input contained non-hex characters.
    NotHex,
}

impl fmt::Display for FingerprintParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongLength(n) => write!(f, "fingerprint must be 64 hex chars, got {n}"),
            Self::NotHex => write!(f, "fingerprint contains non-hex characters"),
        }
    }
}

impl std::error::Error for FingerprintParseError {}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.to_hex()
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = FingerprintParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

/// Detected artifact type, per the dispatcher selection table (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    /// ZIP container with `AndroidManifest.xml`.
    Apk,
    /// ZIP container with `Payload/*.app/Info.plist`.
    Ipa,
    /// Plain ZIP archive (neither APK nor IPA).
    Zip,
    /// Directory or already-unpacked source tree.
    Source,
}

impl FileType {
    /// Every file type that a module's `input_formats` can list.
    #[must_use]
    pub fn all() -> [FileType; 4] {
        [FileType::Apk, FileType::Ipa, FileType::Zip, FileType::Source]
    }

    /// Lowercase wire name, matching the config-file and registration
    /// vocabulary in spec §6.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Apk => "apk",
            FileType::Ipa => "ipa",
            FileType::Zip => "zip",
            FileType::Source => "source",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content-addressed artifact: an uploaded APK/IPA/zip/source archive.
///
/// Immutable after ingestion (spec §3). The only way an `Artifact` record
/// disappears is explicit operator eviction in the store layer.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Artifact {
    /// Content-addressed identity.
    pub fingerprint: Fingerprint,
    /// First-seen original filename.
    pub original_name: String,
    /// Filenames of subsequent duplicate uploads, if the store records them.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Size of the raw upload in bytes.
    pub size: u64,
    /// Detected artifact type.
    pub detected_type: FileType,
    /// When this artifact was first ingested.
    pub ingested_at: DateTime<Utc>,
    /// Path (relative to the store root) to the extracted content tree.
    pub extracted_root: String,
}
