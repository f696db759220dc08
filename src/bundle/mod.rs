//! Verifiable, optionally encrypted export/import bundles (SPEC_FULL.md §4.8, §4.9).

mod crypto;
mod decode;
mod encode;
mod manifest;

pub use crypto::{open as open_ciphertext, seal, Argon2Params, EncryptionMetadata};
pub use decode::{decode, extracted_dir_has_marker, is_encrypted, merge_projects_json, ChecksumReport, ChecksumStatus, ComponentOutcome, DecodeOutcome, MergeMode, ProfileDecision, ProfileOutcome};
pub use encode::{encode, timestamped_filename, verbose_filename, CompanionPaths, EncodeOptions};
pub use manifest::{validate_manifest, Arch, BundleManifest, Checksums, ChecksumAlgorithm, Contents, OptionalComponent, Platform, SourceInfo, VaultContents, CURRENT_SCHEMA_VERSION};
