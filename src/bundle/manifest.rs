//! Bundle manifest schema v1 (SPEC_FULL.md §3, §4.8).

use crate::provider::Provider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Darwin,
    Linux,
    Windows,
    Unknown,
}

impl Platform {
    pub fn from_os(os: &str) -> Self {
        match os {
            "macos" => Platform::Darwin,
            "linux" => Platform::Linux,
            "windows" => Platform::Windows,
            _ => Platform::Unknown,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Platform::Darwin => "darwin",
            Platform::Linux => "linux",
            Platform::Windows => "windows",
            Platform::Unknown => "",
        }
    }

    fn from_str_loose(s: &str) -> Self {
        match s {
            "darwin" => Platform::Darwin,
            "linux" => Platform::Linux,
            "windows" => Platform::Windows,
            _ => Platform::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
    X86,
    Arm,
    Unknown,
}

impl Arch {
    pub fn from_arch(arch: &str) -> Self {
        match arch {
            "x86_64" => Arch::Amd64,
            "aarch64" => Arch::Arm64,
            "x86" => Arch::X86,
            "arm" => Arch::Arm,
            _ => Arch::Unknown,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::X86 => "386",
            Arch::Arm => "arm",
            Arch::Unknown => "",
        }
    }

    fn from_str_loose(s: &str) -> Self {
        match s {
            "amd64" => Arch::Amd64,
            "arm64" => Arch::Arm64,
            "386" => Arch::X86,
            "arm" => Arch::Arm,
            _ => Arch::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
    Unknown,
}

impl ChecksumAlgorithm {
    fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha512 => "sha512",
            ChecksumAlgorithm::Unknown => "",
        }
    }

    fn from_str_loose(s: &str) -> Self {
        match s {
            "sha256" => ChecksumAlgorithm::Sha256,
            "sha512" => ChecksumAlgorithm::Sha512,
            _ => ChecksumAlgorithm::Unknown,
        }
    }
}

macro_rules! string_enum_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }
        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Ok(Self::from_str_loose(&s))
            }
        }
    };
}

string_enum_serde!(Platform);
string_enum_serde!(Arch);
string_enum_serde!(ChecksumAlgorithm);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInfo {
    pub hostname: String,
    pub platform: Platform,
    pub arch: Arch,
    pub username: String,
    pub data_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultContents {
    pub included: bool,
    pub profiles: HashMap<Provider, Vec<String>>,
    pub total_profiles: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptionalComponent {
    pub included: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl OptionalComponent {
    pub fn excluded(reason: &str) -> Self {
        Self { included: false, reason: Some(reason.to_string()), ..Default::default() }
    }

    pub fn included_at(path: &str, count: usize) -> Self {
        Self { included: true, path: Some(path.to_string()), count: Some(count), ..Default::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contents {
    pub vault: VaultContents,
    pub config: OptionalComponent,
    pub projects: OptionalComponent,
    pub health: OptionalComponent,
    pub database: OptionalComponent,
    pub sync_config: OptionalComponent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checksums {
    pub algorithm: ChecksumAlgorithm,
    pub files: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleManifest {
    pub schema_version: u32,
    pub caam_version: String,
    pub export_timestamp: i64,
    pub source: SourceInfo,
    pub contents: Contents,
    pub checksums: Checksums,
}

impl Default for ChecksumAlgorithm {
    fn default() -> Self {
        ChecksumAlgorithm::Unknown
    }
}

pub const ALLOWED_ALGORITHMS: &[ChecksumAlgorithm] = &[ChecksumAlgorithm::Sha256, ChecksumAlgorithm::Sha512, ChecksumAlgorithm::Unknown];

/// Validate the structural invariants SPEC_FULL §4.9 step 4 requires before
/// any checksum comparison is attempted.
pub fn validate_manifest(manifest: &BundleManifest) -> crate::error::Result<()> {
    use crate::error::CaamError;

    if manifest.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(CaamError::validation(
            "schema_version",
            format!("bundle schema version {} is newer than supported version {CURRENT_SCHEMA_VERSION}; upgrade caam-core", manifest.schema_version),
        ));
    }
    if manifest.caam_version.is_empty() {
        return Err(CaamError::validation("caam_version", "must not be empty"));
    }
    if manifest.export_timestamp == 0 {
        return Err(CaamError::validation("export_timestamp", "must be non-zero"));
    }
    if manifest.source.hostname.is_empty() {
        return Err(CaamError::validation("source.hostname", "must be present"));
    }
    for (rel_path, hex) in &manifest.checksums.files {
        let expected_len = match manifest.checksums.algorithm {
            ChecksumAlgorithm::Sha256 => Some(64),
            ChecksumAlgorithm::Sha512 => Some(128),
            ChecksumAlgorithm::Unknown => None,
        };
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CaamError::validation("checksums.files", format!("`{rel_path}` has a non-hex digest")));
        }
        if let Some(len) = expected_len {
            if hex.len() != len {
                return Err(CaamError::validation("checksums.files", format!("`{rel_path}` digest length does not match algorithm")));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_and_arch_round_trip_through_json() {
        let source = SourceInfo { hostname: "h".into(), platform: Platform::Linux, arch: Arch::Amd64, username: "u".into(), data_path: "/data".into() };
        let json = serde_json::to_string(&source).unwrap();
        assert!(json.contains("\"platform\":\"linux\""));
        let back: SourceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.platform, Platform::Linux);
    }

    #[test]
    fn unknown_platform_serializes_to_empty_string() {
        let source = SourceInfo { hostname: "h".into(), platform: Platform::Unknown, arch: Arch::Unknown, username: "u".into(), data_path: "/data".into() };
        let json = serde_json::to_string(&source).unwrap();
        assert!(json.contains("\"platform\":\"\""));
    }

    #[test]
    fn future_schema_version_is_rejected() {
        let manifest = BundleManifest {
            schema_version: CURRENT_SCHEMA_VERSION + 1,
            caam_version: "0.1.0".into(),
            export_timestamp: 1,
            source: SourceInfo { hostname: "h".into(), platform: Platform::Linux, arch: Arch::Amd64, username: "u".into(), data_path: "/d".into() },
            contents: Contents {
                vault: VaultContents::default(),
                config: OptionalComponent::excluded("not requested"),
                projects: OptionalComponent::excluded("not requested"),
                health: OptionalComponent::excluded("not requested"),
                database: OptionalComponent::excluded("not requested"),
                sync_config: OptionalComponent::excluded("not requested"),
            },
            checksums: Checksums::default(),
        };
        let err = validate_manifest(&manifest).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
